//! Self-contained fetch helpers with per-id promise sharing.
//!
//! [`Retriever`] fetches one entity at a time and supports cancelling a
//! superseded in-flight fetch when a forced retrieve arrives.
//! [`BulkRetriever`] batches unresolved ids into one fallback call and shares
//! the batch outcome between overlapping callers. Both persist successful
//! results into the entity store and clear their cache entries on settlement.
//!
//! Settlement is shared through `tokio::sync::watch`: every caller awaiting
//! the same in-flight fetch clones one receiver and observes the same
//! resolution or rejection. Cache entries carry a generation number so a
//! superseded task can never evict the fetch that replaced it.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{RemoteError, RetrieveError};
use crate::store::EntityStore;
use crate::sync::lock;

/// Future returned by a single-entity fallback fetch.
pub type FetchFuture<T> = Pin<Box<dyn Future<Output = Result<T, RemoteError>> + Send>>;

/// Single-entity fallback fetch.
///
/// The token is cancelled when a forced retrieve supersedes the fetch; the
/// implementation is responsible for honoring it (aborting the transport
/// call, closing the connection, ...).
pub type FetchFn<T, I> = Arc<dyn Fn(I, CancellationToken) -> FetchFuture<T> + Send + Sync>;

/// Future returned by a bulk fallback fetch.
pub type BulkFetchFuture<T> = Pin<Box<dyn Future<Output = Result<Vec<T>, RemoteError>> + Send>>;

/// Bulk fallback fetch: unresolved ids in, entities out.
pub type BulkFetchFn<T, I> = Arc<dyn Fn(Vec<I>) -> BulkFetchFuture<T> + Send + Sync>;

type Settlement<T> = Option<Result<Arc<T>, RetrieveError>>;

struct InFlight<T> {
    generation: u64,
    token: CancellationToken,
    rx: watch::Receiver<Settlement<T>>,
}

/// Single-entity retriever with request cancellation.
///
/// At most one fetch per id is in flight at a time: concurrent unforced
/// calls share the same settlement, a forced call cancels and replaces the
/// in-flight fetch. Distinct ids proceed fully independently.
pub struct Retriever<T, I> {
    inner: Arc<RetrieverInner<T, I>>,
}

impl<T, I> Clone for Retriever<T, I> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, I> fmt::Debug for Retriever<T, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retriever")
            .field("in_flight", &lock(&self.inner.in_flight).len())
            .finish_non_exhaustive()
    }
}

struct RetrieverInner<T, I> {
    store: Arc<EntityStore<T, I>>,
    fallback: FetchFn<T, I>,
    in_flight: Mutex<HashMap<I, InFlight<T>>>,
    generation: AtomicU64,
}

impl<T, I> Retriever<T, I>
where
    T: PartialEq + Send + Sync + 'static,
    I: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// Build a retriever persisting into `store` and fetching via `fallback`.
    #[must_use]
    pub fn new(store: Arc<EntityStore<T, I>>, fallback: FetchFn<T, I>) -> Self {
        Self {
            inner: Arc::new(RetrieverInner {
                store,
                fallback,
                in_flight: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Resolve `id`, fetching it remotely if needed.
    ///
    /// Unforced calls short-circuit on a store hit and share the settlement
    /// of an already in-flight fetch. A forced call cancels any in-flight
    /// fetch for the id (its waiters observe [`RetrieveError::Aborted`]) and
    /// starts a fresh one. Successful fetches are upserted into the store
    /// before the call resolves.
    ///
    /// # Errors
    ///
    /// [`RetrieveError::Fetch`] when the fallback fails,
    /// [`RetrieveError::Aborted`] when the awaited fetch was superseded.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub async fn retrieve(&self, id: I, force: bool) -> Result<Arc<T>, RetrieveError> {
        if !force {
            if let Some(existing) = self.inner.store.find(&id) {
                return Ok(existing);
            }
        }

        // The guard must leave lexical scope before any await so the
        // returned future stays `Send`; explicit `drop` is not enough.
        let started = {
            let mut in_flight = lock(&self.inner.in_flight);
            let shared_rx = match in_flight.get(&id) {
                Some(entry) if !force => Some(entry.rx.clone()),
                Some(entry) => {
                    entry.token.cancel();
                    None
                }
                None => None,
            };
            match shared_rx {
                Some(rx) => Err(rx),
                None => {
                    let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
                    let token = CancellationToken::new();
                    let (tx, rx) = watch::channel(None);
                    in_flight.insert(
                        id.clone(),
                        InFlight {
                            generation,
                            token: token.clone(),
                            rx: rx.clone(),
                        },
                    );
                    Ok((generation, token, tx, rx))
                }
            }
        };
        let (generation, token, tx, rx) = match started {
            Ok(parts) => parts,
            Err(rx) => return await_settlement(rx).await,
        };

        let inner = Arc::clone(&self.inner);
        let task_id = id.clone();
        tokio::spawn(async move {
            let outcome = run_single_fetch(&inner, task_id.clone(), &token).await;
            let _ = tx.send(Some(outcome));

            let mut in_flight = lock(&inner.in_flight);
            if in_flight
                .get(&task_id)
                .is_some_and(|entry| entry.generation == generation)
            {
                in_flight.remove(&task_id);
            }
        });

        await_settlement(rx).await
    }
}

async fn run_single_fetch<T, I>(
    inner: &RetrieverInner<T, I>,
    id: I,
    token: &CancellationToken,
) -> Result<Arc<T>, RetrieveError>
where
    T: PartialEq + Send + Sync + 'static,
    I: Eq + Hash + Clone + Send + Sync + 'static,
{
    let fetch = (inner.fallback)(id, token.clone());
    tokio::select! {
        () = token.cancelled() => Err(RetrieveError::Aborted),
        fetched = fetch => match fetched {
            Ok(value) => {
                let id = inner.store.id_of(&value);
                inner.store.upsert(vec![value]);
                inner.store.find(&id).ok_or(RetrieveError::TaskFailed)
            }
            Err(reason) => Err(RetrieveError::Fetch(reason)),
        },
    }
}

async fn await_settlement<T>(mut rx: watch::Receiver<Settlement<T>>) -> Result<Arc<T>, RetrieveError> {
    let settled = rx
        .wait_for(Option::is_some)
        .await
        .map_err(|_| RetrieveError::TaskFailed)?;
    match settled.as_ref() {
        Some(outcome) => outcome.clone(),
        None => Err(RetrieveError::TaskFailed),
    }
}

type BatchSignal = Option<Result<(), RetrieveError>>;

struct InFlightBatch {
    generation: u64,
    rx: watch::Receiver<BatchSignal>,
}

/// Requested ids split into the three disjoint dedup classes.
struct IdClasses<I> {
    exists: HashSet<I>,
    wait: HashMap<I, watch::Receiver<BatchSignal>>,
    fetch: Vec<I>,
}

/// Bulk retriever sharing one fallback call across overlapping ids.
#[deprecated(
    since = "0.1.0",
    note = "prefer RemoteStore, which unifies dedup, batching, and error state"
)]
pub struct BulkRetriever<T, I> {
    inner: Arc<BulkInner<T, I>>,
}

struct BulkInner<T, I> {
    store: Arc<EntityStore<T, I>>,
    fallback: BulkFetchFn<T, I>,
    in_flight: Mutex<HashMap<I, InFlightBatch>>,
    generation: AtomicU64,
}

#[allow(deprecated)]
impl<T, I> Clone for BulkRetriever<T, I> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[allow(deprecated)]
impl<T, I> BulkRetriever<T, I>
where
    T: PartialEq + Send + Sync + 'static,
    I: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
{
    /// Build a bulk retriever persisting into `store` and fetching via
    /// `fallback`.
    #[must_use]
    pub fn new(store: Arc<EntityStore<T, I>>, fallback: BulkFetchFn<T, I>) -> Self {
        Self {
            inner: Arc::new(BulkInner {
                store,
                fallback,
                in_flight: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Resolve every id in `ids`, issuing at most one bulk fallback call for
    /// the ids that are neither in the store nor already in flight.
    ///
    /// When `force` is set every id is fetched unconditionally. A failed
    /// bulk call fails the whole batch for every caller awaiting any of its
    /// ids; cache entries are cleared on settlement either way.
    ///
    /// # Errors
    ///
    /// [`RetrieveError::Fetch`] when the fallback fails,
    /// [`RetrieveError::MissingFromResponse`] when a successful response did
    /// not contain a requested id.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub async fn retrieve(&self, ids: Vec<I>, force: bool) -> Result<Vec<Arc<T>>, RetrieveError> {
        let classes = self.classify(&ids, force);

        if classes.fetch.is_empty() {
            return self.resolve_all(&ids, &classes).await;
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(None);
        {
            let mut in_flight = lock(&self.inner.in_flight);
            for id in &classes.fetch {
                in_flight.insert(
                    id.clone(),
                    InFlightBatch {
                        generation,
                        rx: rx.clone(),
                    },
                );
            }
        }

        let inner = Arc::clone(&self.inner);
        let batch_ids = classes.fetch.clone();
        tokio::spawn(async move {
            let outcome = match (inner.fallback)(batch_ids.clone()).await {
                Ok(items) => {
                    inner.store.upsert(items);
                    Ok(())
                }
                Err(reason) => Err(RetrieveError::Fetch(reason)),
            };
            let _ = tx.send(Some(outcome));

            let mut in_flight = lock(&inner.in_flight);
            for id in &batch_ids {
                if in_flight
                    .get(id)
                    .is_some_and(|entry| entry.generation == generation)
                {
                    in_flight.remove(id);
                }
            }
        });

        await_batch(rx).await?;
        self.resolve_all(&ids, &classes).await
    }

    /// Split `ids` into already-resolvable, already-in-flight, and
    /// to-be-fetched classes. Forced calls fetch everything. Duplicate ids
    /// collapse into one class member.
    fn classify(&self, ids: &[I], force: bool) -> IdClasses<I> {
        let mut classes = IdClasses {
            exists: HashSet::new(),
            wait: HashMap::new(),
            fetch: Vec::new(),
        };
        let mut seen = HashSet::new();

        if force {
            for id in ids {
                if seen.insert(id.clone()) {
                    classes.fetch.push(id.clone());
                }
            }
            return classes;
        }

        let in_flight = lock(&self.inner.in_flight);
        for id in ids {
            if !seen.insert(id.clone()) {
                continue;
            }
            if self.inner.store.find(id).is_some() {
                classes.exists.insert(id.clone());
            } else if let Some(entry) = in_flight.get(id) {
                classes.wait.insert(id.clone(), entry.rx.clone());
            } else {
                classes.fetch.push(id.clone());
            }
        }
        classes
    }

    /// Resolve every requested id from whichever cache or state now holds
    /// it: `wait` entries await their own batch first, everything else reads
    /// the store directly.
    async fn resolve_all(
        &self,
        ids: &[I],
        classes: &IdClasses<I>,
    ) -> Result<Vec<Arc<T>>, RetrieveError> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(rx) = classes.wait.get(id) {
                await_batch(rx.clone()).await?;
            }
            match self.inner.store.find(id) {
                Some(entity) => out.push(entity),
                None => return Err(RetrieveError::MissingFromResponse(format!("{id:?}"))),
            }
        }
        Ok(out)
    }
}

async fn await_batch(mut rx: watch::Receiver<BatchSignal>) -> Result<(), RetrieveError> {
    let settled = rx
        .wait_for(Option::is_some)
        .await
        .map_err(|_| RetrieveError::TaskFailed)?;
    match settled.as_ref() {
        Some(outcome) => outcome.clone(),
        None => Err(RetrieveError::TaskFailed),
    }
}
