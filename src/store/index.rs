//! Secondary index derived from an entity store.
//!
//! An [`IndexStore`] is seeded from a snapshot of its source
//! [`EntityStore`] and then kept incrementally consistent through the
//! store's mutation channel. It is bound permanently to one store and one
//! key extractor; external callers never mutate it directly.
//!
//! Known limitation, kept on purpose: when an upsert changes the fields the
//! key is derived from, the entry under the old key is not removed. The old
//! key keeps pointing at the superseded entity until a later upsert reuses
//! that key. Key collisions at seed time resolve last-write-wins in map
//! iteration order.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, RwLock};

use crate::store::entity::EntityStore;
use crate::store::traits::Lookup;
use crate::sync::{read, write};

/// Derived key → entity view over an [`EntityStore`].
pub struct IndexStore<T, K> {
    inner: Arc<IndexInner<T, K>>,
}

struct IndexInner<T, K> {
    index: RwLock<HashMap<K, Arc<T>>>,
}

impl<T, K> fmt::Debug for IndexStore<T, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexStore")
            .field("len", &read(&self.inner.index).len())
            .finish_non_exhaustive()
    }
}

impl<T, K> IndexStore<T, K>
where
    T: PartialEq + Send + Sync + 'static,
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// Build an index over `store`, keyed by `get_key`.
    ///
    /// Seeds from the store's current entities and registers a mutation
    /// subscriber to stay consistent. The subscription holds only weak
    /// references, so dropping either side detaches cleanly instead of
    /// leaking a store ↔ subscriber cycle.
    #[must_use]
    pub fn new<I>(
        store: &Arc<EntityStore<T, I>>,
        get_key: impl Fn(&T) -> K + Send + Sync + 'static,
    ) -> Self
    where
        I: Eq + Hash + Clone + Send + Sync + 'static,
    {
        let mut seeded = HashMap::new();
        for entity in store.snapshot().values() {
            seeded.insert(get_key(entity), Arc::clone(entity));
        }
        let inner = Arc::new(IndexInner {
            index: RwLock::new(seeded),
        });

        let index_ref = Arc::downgrade(&inner);
        let store_ref = Arc::downgrade(store);
        store.on_mutation(move |changed| {
            let (Some(inner), Some(store)) = (index_ref.upgrade(), store_ref.upgrade()) else {
                return;
            };
            apply_mutations(&inner, &store, &get_key, changed);
        });

        Self { inner }
    }

    /// Resolve a secondary key to its entity.
    #[must_use]
    pub fn find(&self, key: &K) -> Option<Arc<T>> {
        read(&self.inner.index).get(key).cloned()
    }

    /// Number of distinct keys currently indexed.
    #[must_use]
    pub fn len(&self) -> usize {
        read(&self.inner.index).len()
    }

    /// Whether the index holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        read(&self.inner.index).is_empty()
    }
}

impl<T, K> Lookup<K, T> for IndexStore<T, K>
where
    T: PartialEq + Send + Sync + 'static,
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    fn find(&self, key: &K) -> Option<Arc<T>> {
        Self::find(self, key)
    }
}

/// Fold one mutation batch into the index.
///
/// Every changed entity is re-resolved by id against the current store state:
/// still present means its (possibly new) key now maps to the current entity,
/// absent means it was deleted and its key is dropped.
fn apply_mutations<T, I, K>(
    inner: &IndexInner<T, K>,
    store: &EntityStore<T, I>,
    get_key: &impl Fn(&T) -> K,
    changed: &[Arc<T>],
) where
    T: PartialEq + Send + Sync + 'static,
    I: Eq + Hash + Clone + Send + Sync + 'static,
    K: Eq + Hash + Clone,
{
    let mut index = write(&inner.index);
    for item in changed {
        match store.find(&store.id_of(item)) {
            Some(current) => {
                index.insert(get_key(&current), current);
            }
            None => {
                index.remove(&get_key(item));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Foo {
        id: u64,
        key: String,
        bar: String,
    }

    fn foo(id: u64, key: &str, bar: &str) -> Foo {
        Foo {
            id,
            key: key.to_string(),
            bar: bar.to_string(),
        }
    }

    fn store() -> Arc<EntityStore<Foo, u64>> {
        Arc::new(EntityStore::new(|f: &Foo| f.id))
    }

    fn index_by_key(store: &Arc<EntityStore<Foo, u64>>) -> IndexStore<Foo, String> {
        IndexStore::new(store, |f: &Foo| f.key.clone())
    }

    #[test]
    fn seeds_from_existing_entities() {
        let store = store();
        store.upsert(vec![foo(1, "a", "hello")]);

        let index = index_by_key(&store);
        let hit = index.find(&"a".to_string()).unwrap();
        assert_eq!(hit.id, 1);
        assert_eq!(hit.bar, "hello");
    }

    #[test]
    fn tracks_upserts() {
        let store = store();
        let index = index_by_key(&store);

        store.upsert(vec![foo(1, "a", "hello")]);
        assert_eq!(index.find(&"a".to_string()).unwrap().id, 1);

        store.upsert(vec![foo(2, "b", "world"), foo(3, "c", "hi")]);
        assert_eq!(index.find(&"b".to_string()).unwrap().id, 2);
        assert_eq!(index.find(&"c".to_string()).unwrap().id, 3);
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn tracks_deletes() {
        let store = store();
        store.upsert(vec![foo(1, "a", "hello")]);
        let index = index_by_key(&store);

        store.delete(&[1]);
        assert!(index.find(&"a".to_string()).is_none());
        assert!(index.is_empty());
    }

    #[test]
    fn index_hands_out_the_same_entity_as_the_store() {
        let store = store();
        let index = index_by_key(&store);
        store.upsert(vec![foo(1, "a", "hello")]);

        let via_store = store.find(&1).unwrap();
        let via_index = index.find(&"a".to_string()).unwrap();
        assert!(Arc::ptr_eq(&via_store, &via_index));
    }

    #[test]
    fn replacement_updates_the_indexed_entity() {
        let store = store();
        let index = index_by_key(&store);
        store.upsert(vec![foo(1, "a", "hello")]);
        store.upsert(vec![foo(1, "a", "rewritten")]);

        let hit = index.find(&"a".to_string()).unwrap();
        assert_eq!(hit.bar, "rewritten");
        assert!(Arc::ptr_eq(&hit, &store.find(&1).unwrap()));
    }

    #[test]
    fn key_change_leaves_the_stale_entry_behind() {
        // Documented limitation: the old key is not cleared when the
        // key-relevant field changes via upsert.
        let store = store();
        let index = index_by_key(&store);
        store.upsert(vec![foo(1, "a", "v1")]);
        let original = index.find(&"a".to_string()).unwrap();

        store.upsert(vec![foo(1, "b", "v2")]);

        let fresh = index.find(&"b".to_string()).unwrap();
        assert_eq!(fresh.bar, "v2");

        let stale = index.find(&"a".to_string()).unwrap();
        assert!(Arc::ptr_eq(&stale, &original));
        assert_eq!(stale.bar, "v1");
    }

    #[test]
    fn seed_collisions_resolve_last_write_wins() {
        let store = store();
        store.upsert(vec![foo(1, "same", "one"), foo(2, "same", "two")]);

        let index = index_by_key(&store);
        assert_eq!(index.len(), 1);
        // Either entity is acceptable; the key must resolve to exactly one.
        let hit = index.find(&"same".to_string()).unwrap();
        assert!(hit.id == 1 || hit.id == 2);
    }

    #[test]
    fn dropped_index_detaches_from_the_store() {
        let store = store();
        let index = index_by_key(&store);
        drop(index);

        // The weak subscriber must no-op; the store keeps working.
        store.upsert(vec![foo(1, "a", "hello")]);
        store.delete(&[1]);
        assert_eq!(store.size(), 0);
    }
}
