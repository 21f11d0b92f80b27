//! Primary entity store with change detection and mutation notification.
//!
//! The store holds entities as `Arc<T>` inside an `Arc<HashMap<..>>` snapshot.
//! A call to [`EntityStore::upsert`] or [`EntityStore::delete`] either leaves
//! the snapshot `Arc` untouched (a no-op, observable via [`Arc::ptr_eq`] on
//! [`EntityStore::snapshot`]) or swaps in a new map reflecting exactly the
//! changed entries and notifies every mutation subscriber once with the full
//! changed list. Unchanged entries keep their `Arc<T>` identity across swaps.
//!
//! "Changed" is decided by `T: PartialEq`: upserting a value equal to the
//! stored one is not a change and does not replace the stored `Arc<T>`.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, RwLock};

use crate::store::traits::Lookup;
use crate::sync::{read, write};

/// Callback receiving the entities changed by a single upsert/delete call.
///
/// Invoked synchronously after the state swap is committed and before the
/// mutating call returns, in registration order, exactly once per call that
/// produced a real change.
pub type MutationSubscriber<T> = Box<dyn Fn(&[Arc<T>]) + Send + Sync>;

/// Outcome of a pure state transition: the replacement map plus the entities
/// that actually changed. A no-op transition is represented by `None` at the
/// call sites so the previous snapshot `Arc` survives untouched.
struct Transition<T, I> {
    entities: Arc<HashMap<I, Arc<T>>>,
    changed: Vec<Arc<T>>,
}

/// Normalized in-memory collection of entities keyed by an id column.
///
/// The id extractor is fixed at construction and immutable thereafter.
/// All operations take `&self`; the store is `Send + Sync` and meant to be
/// shared behind an [`Arc`].
pub struct EntityStore<T, I> {
    id_of: Box<dyn Fn(&T) -> I + Send + Sync>,
    entities: RwLock<Arc<HashMap<I, Arc<T>>>>,
    subscribers: RwLock<Vec<MutationSubscriber<T>>>,
}

impl<T, I> fmt::Debug for EntityStore<T, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityStore")
            .field("size", &read(&self.entities).len())
            .finish_non_exhaustive()
    }
}

impl<T, I> EntityStore<T, I>
where
    T: PartialEq + Send + Sync + 'static,
    I: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// Create an empty store keyed by `id_of`.
    #[must_use]
    pub fn new(id_of: impl Fn(&T) -> I + Send + Sync + 'static) -> Self {
        Self {
            id_of: Box::new(id_of),
            entities: RwLock::new(Arc::new(HashMap::new())),
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Derive an entity's id using the store's id column.
    #[must_use]
    pub fn id_of(&self, entity: &T) -> I {
        (self.id_of)(entity)
    }

    /// Number of entities currently held.
    #[must_use]
    pub fn size(&self) -> usize {
        read(&self.entities).len()
    }

    /// Resolve an id to its entity.
    #[must_use]
    pub fn find(&self, id: &I) -> Option<Arc<T>> {
        read(&self.entities).get(id).cloned()
    }

    /// Entities satisfying `predicate`, in map iteration order.
    #[must_use]
    pub fn filter(&self, predicate: impl Fn(&T) -> bool) -> Vec<Arc<T>> {
        read(&self.entities)
            .values()
            .filter(|entity| predicate(entity))
            .cloned()
            .collect()
    }

    /// The current collection snapshot.
    ///
    /// No-op mutations keep the returned `Arc` identical; real mutations swap
    /// in a new map. Useful for cheap change detection via [`Arc::ptr_eq`].
    #[must_use]
    pub fn snapshot(&self) -> Arc<HashMap<I, Arc<T>>> {
        Arc::clone(&read(&self.entities))
    }

    /// Register a mutation subscriber.
    ///
    /// Subscribers run synchronously inside the mutating call. A subscriber
    /// may read the store but must not register further subscribers from
    /// within the callback.
    pub fn on_mutation(&self, subscriber: impl Fn(&[Arc<T>]) + Send + Sync + 'static) {
        write(&self.subscribers).push(Box::new(subscriber));
    }

    /// Insert or replace entities.
    ///
    /// A value whose id is absent is inserted; a value equal (`PartialEq`) to
    /// the stored entity of the same id is left untouched; anything else
    /// replaces the stored entity. If nothing changed the call is a no-op,
    /// otherwise subscribers are notified once with the changed entities.
    pub fn upsert(&self, values: Vec<T>) {
        if values.is_empty() {
            return;
        }
        let transition = {
            let mut entities = write(&self.entities);
            match apply_upsert(&entities, &*self.id_of, values) {
                Some(transition) => {
                    *entities = Arc::clone(&transition.entities);
                    transition
                }
                None => return,
            }
        };
        self.dispatch(&transition.changed);
    }

    /// Remove the entities with the given ids.
    ///
    /// Unknown ids are ignored; an empty slice is a no-op. If any entity was
    /// actually removed, subscribers are notified once with the removed
    /// entities.
    pub fn delete(&self, ids: &[I]) {
        let transition = {
            let mut entities = write(&self.entities);
            match apply_delete(&entities, ids) {
                Some(transition) => {
                    *entities = Arc::clone(&transition.entities);
                    transition
                }
                None => return,
            }
        };
        self.dispatch(&transition.changed);
    }

    /// Remove every entity, reporting all of them as changed in one
    /// notification. No-op on an already empty store.
    pub fn clear(&self) {
        let transition = {
            let mut entities = write(&self.entities);
            match apply_clear(&entities) {
                Some(transition) => {
                    *entities = Arc::clone(&transition.entities);
                    transition
                }
                None => return,
            }
        };
        self.dispatch(&transition.changed);
    }

    /// Dispatch outside the state lock so subscribers can read the store.
    fn dispatch(&self, changed: &[Arc<T>]) {
        let subscribers = read(&self.subscribers);
        for subscriber in subscribers.iter() {
            subscriber(changed);
        }
    }
}

impl<T, I> Lookup<I, T> for EntityStore<T, I>
where
    T: PartialEq + Send + Sync + 'static,
    I: Eq + Hash + Clone + Send + Sync + 'static,
{
    fn find(&self, key: &I) -> Option<Arc<T>> {
        Self::find(self, key)
    }
}

fn apply_upsert<T, I>(
    current: &Arc<HashMap<I, Arc<T>>>,
    id_of: &(dyn Fn(&T) -> I + Send + Sync),
    values: Vec<T>,
) -> Option<Transition<T, I>>
where
    T: PartialEq,
    I: Eq + Hash + Clone,
{
    let mut next = HashMap::clone(current);
    let mut changed = Vec::new();
    for value in values {
        let id = id_of(&value);
        match next.get(&id) {
            Some(prev) if **prev == value => {}
            _ => {
                let value = Arc::new(value);
                changed.push(Arc::clone(&value));
                next.insert(id, value);
            }
        }
    }
    if changed.is_empty() {
        None
    } else {
        Some(Transition {
            entities: Arc::new(next),
            changed,
        })
    }
}

fn apply_delete<T, I>(current: &Arc<HashMap<I, Arc<T>>>, ids: &[I]) -> Option<Transition<T, I>>
where
    I: Eq + Hash + Clone,
{
    if ids.is_empty() {
        return None;
    }
    let mut next = HashMap::clone(current);
    let mut changed = Vec::new();
    for id in ids {
        if let Some(entity) = next.remove(id) {
            changed.push(entity);
        }
    }
    if changed.is_empty() {
        None
    } else {
        Some(Transition {
            entities: Arc::new(next),
            changed,
        })
    }
}

fn apply_clear<T, I>(current: &Arc<HashMap<I, Arc<T>>>) -> Option<Transition<T, I>>
where
    I: Eq + Hash + Clone,
{
    if current.is_empty() {
        return None;
    }
    Some(Transition {
        entities: Arc::new(HashMap::new()),
        changed: current.values().cloned().collect(),
    })
}
