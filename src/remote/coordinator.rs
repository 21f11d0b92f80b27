//! Remote request coordinator with per-key loading and error state.
//!
//! `request_remote` is fire-and-forget: the synchronous front half filters
//! out keys that are already resolved, loading, or errored (unless forced)
//! and marks the survivors as loading before it returns; the back half runs
//! on a spawned task and settles the batch into the entity store or the
//! error map. Observers poll [`RemoteStore::is_loading`],
//! [`RemoteStore::error`], and the find collaborator.
//!
//! Error entries are sticky: they persist until a later successful or forced
//! request for the same key, which keeps unforced callers from hammering a
//! failing key.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use crate::error::RemoteError;
use crate::store::{EntityStore, Lookup};
use crate::sync::{read, write};

/// Future returned by a remote request function.
pub type RequestFuture<T> = Pin<Box<dyn Future<Output = Result<Vec<T>, RemoteError>> + Send>>;

/// Bulk remote request: keys in, entities out.
///
/// Called with the final, filtered key list. An empty filtered list never
/// reaches the function; the coordinator skips the call entirely.
pub type RequestFn<T, K> = Arc<dyn Fn(Vec<K>) -> RequestFuture<T> + Send + Sync>;

/// Deduplicating remote-fetch coordinator.
///
/// Cheap to clone; clones share loading/error state and the underlying
/// stores. Must be used within a Tokio runtime.
pub struct RemoteStore<T, I, K> {
    inner: Arc<RemoteInner<T, I, K>>,
}

impl<T, I, K> Clone for RemoteStore<T, I, K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, I, K> fmt::Debug for RemoteStore<T, I, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteStore")
            .field("loading", &read(&self.inner.loading).len())
            .field("errors", &read(&self.inner.error).len())
            .finish_non_exhaustive()
    }
}

struct RemoteInner<T, I, K> {
    store: Arc<EntityStore<T, I>>,
    lookup: Arc<dyn Lookup<K, T>>,
    request: RequestFn<T, K>,
    loading: RwLock<HashSet<K>>,
    error: RwLock<HashMap<K, RemoteError>>,
}

impl<T, I, K> RemoteStore<T, I, K>
where
    T: PartialEq + Send + Sync + 'static,
    I: Eq + Hash + Clone + Send + Sync + 'static,
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// Build a coordinator writing to `store`, resolving keys through
    /// `lookup` (typically an [`IndexStore`](crate::IndexStore) over the
    /// key column), and fetching via `request`.
    #[must_use]
    pub fn new(
        store: Arc<EntityStore<T, I>>,
        lookup: Arc<dyn Lookup<K, T>>,
        request: RequestFn<T, K>,
    ) -> Self {
        Self {
            inner: Arc::new(RemoteInner {
                store,
                lookup,
                request,
                loading: RwLock::new(HashSet::new()),
                error: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Request the entities behind `keys` from the remote source.
    ///
    /// Unless `force` is set, keys that already resolve through the lookup,
    /// are currently loading, or carry a sticky error are dropped; a forced
    /// call fetches every given key unconditionally. Surviving keys are
    /// visible through [`Self::is_loading`] as soon as this returns. On
    /// success the fetched entities are upserted into the entity store and
    /// the keys leave both `loading` and `error`; on failure the keys leave
    /// `loading` and all share one error value.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn request_remote(&self, keys: Vec<K>, force: bool) {
        let keys = if force { keys } else { self.filter_new(keys) };
        if keys.is_empty() {
            return;
        }

        write(&self.inner.loading).extend(keys.iter().cloned());

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            match (inner.request)(keys.clone()).await {
                Ok(items) => {
                    inner.store.upsert(items);
                    let mut loading = write(&inner.loading);
                    for key in &keys {
                        loading.remove(key);
                    }
                    drop(loading);
                    let mut error = write(&inner.error);
                    for key in &keys {
                        error.remove(key);
                    }
                }
                Err(reason) => {
                    let mut loading = write(&inner.loading);
                    for key in &keys {
                        loading.remove(key);
                    }
                    drop(loading);
                    let mut error = write(&inner.error);
                    for key in keys {
                        error.insert(key, Arc::clone(&reason));
                    }
                }
            }
        });
    }

    /// Whether a request for `key` is currently in flight.
    #[must_use]
    pub fn is_loading(&self, key: &K) -> bool {
        read(&self.inner.loading).contains(key)
    }

    /// Number of keys currently awaiting a remote response.
    #[must_use]
    pub fn loading_len(&self) -> usize {
        read(&self.inner.loading).len()
    }

    /// The sticky error recorded for `key`, if its last fetch failed.
    #[must_use]
    pub fn error(&self, key: &K) -> Option<RemoteError> {
        read(&self.inner.error).get(key).cloned()
    }

    fn filter_new(&self, keys: Vec<K>) -> Vec<K> {
        let loading = read(&self.inner.loading);
        let error = read(&self.inner.error);
        keys.into_iter()
            .filter(|key| {
                self.inner.lookup.find(key).is_none()
                    && !loading.contains(key)
                    && !error.contains_key(key)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use tokio::sync::oneshot;

    use crate::error::remote_error;
    use crate::store::IndexStore;

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

    /// Remote endpoint handing out manually-resolved responses, one oneshot
    /// receiver per expected request.
    struct FakeRemote {
        calls: AtomicUsize,
        pending: Mutex<Vec<oneshot::Receiver<Result<Vec<Foo>, RemoteError>>>>,
    }

    impl FakeRemote {
        fn with_responses(
            count: usize,
        ) -> (
            Arc<Self>,
            Vec<oneshot::Sender<Result<Vec<Foo>, RemoteError>>>,
        ) {
            let mut senders = Vec::with_capacity(count);
            let mut receivers = Vec::with_capacity(count);
            for _ in 0..count {
                let (tx, rx) = oneshot::channel();
                senders.push(tx);
                receivers.push(rx);
            }
            receivers.reverse();
            (
                Arc::new(Self {
                    calls: AtomicUsize::new(0),
                    pending: Mutex::new(receivers),
                }),
                senders,
            )
        }

        fn request_fn(self: &Arc<Self>) -> RequestFn<Foo, String> {
            let remote = Arc::clone(self);
            Arc::new(move |_keys| {
                remote.calls.fetch_add(1, Ordering::SeqCst);
                let rx = remote
                    .pending
                    .lock()
                    .unwrap()
                    .pop()
                    .expect("unexpected extra request");
                Box::pin(async move { rx.await.expect("response sender dropped") })
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if condition() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn success_settles_into_store_and_index() {
        let store = store();
        let index = Arc::new(IndexStore::new(&store, |f: &Foo| f.key.clone()));
        let (remote, mut responses) = FakeRemote::with_responses(1);
        let coordinator = RemoteStore::new(Arc::clone(&store), index.clone(), remote.request_fn());

        coordinator.request_remote(vec!["a".to_string()], false);

        // Loading is observable synchronously, before the request settles.
        assert!(coordinator.is_loading(&"a".to_string()));
        assert!(store.find(&1).is_none());
        assert!(index.find(&"a".to_string()).is_none());

        responses.remove(0).send(Ok(vec![foo(1, "a", "bar")])).unwrap();
        eventually(|| !coordinator.is_loading(&"a".to_string())).await;

        assert!(coordinator.error(&"a".to_string()).is_none());
        assert_eq!(store.find(&1).unwrap().bar, "bar");
        assert_eq!(index.find(&"a".to_string()).unwrap().id, 1);
    }

    #[tokio::test]
    async fn pending_key_is_not_requested_twice() {
        let store = store();
        let index = Arc::new(IndexStore::new(&store, |f: &Foo| f.key.clone()));
        let (remote, mut responses) = FakeRemote::with_responses(1);
        let coordinator = RemoteStore::new(Arc::clone(&store), index, remote.request_fn());

        coordinator.request_remote(vec!["a".to_string()], false);
        coordinator.request_remote(vec!["a".to_string()], false);

        responses.remove(0).send(Ok(vec![foo(1, "a", "bar")])).unwrap();
        eventually(|| !coordinator.is_loading(&"a".to_string())).await;

        assert_eq!(remote.calls(), 1);
    }

    #[tokio::test]
    async fn resolved_key_is_not_requested_again() {
        let store = store();
        let index = Arc::new(IndexStore::new(&store, |f: &Foo| f.key.clone()));
        store.upsert(vec![foo(1, "a", "already-here")]);

        let (remote, _responses) = FakeRemote::with_responses(0);
        let coordinator = RemoteStore::new(Arc::clone(&store), index, remote.request_fn());

        coordinator.request_remote(vec!["a".to_string()], false);
        assert_eq!(remote.calls(), 0);
        assert_eq!(coordinator.loading_len(), 0);
    }

    #[tokio::test]
    async fn failure_records_one_shared_error_per_key() {
        let store = store();
        let index = Arc::new(IndexStore::new(&store, |f: &Foo| f.key.clone()));
        let (remote, mut responses) = FakeRemote::with_responses(1);
        let coordinator = RemoteStore::new(Arc::clone(&store), index, remote.request_fn());

        coordinator.request_remote(vec!["a".to_string(), "b".to_string()], false);
        responses
            .remove(0)
            .send(Err(remote_error("upstream 502")))
            .unwrap();
        eventually(|| coordinator.error(&"a".to_string()).is_some()).await;

        assert!(!coordinator.is_loading(&"a".to_string()));
        assert!(!coordinator.is_loading(&"b".to_string()));

        let a = coordinator.error(&"a".to_string()).unwrap();
        let b = coordinator.error(&"b".to_string()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.to_string().contains("upstream 502"));
    }

    #[tokio::test]
    async fn errored_key_is_sticky_until_forced() {
        let store = store();
        let index = Arc::new(IndexStore::new(&store, |f: &Foo| f.key.clone()));
        let (remote, mut responses) = FakeRemote::with_responses(2);
        let coordinator = RemoteStore::new(Arc::clone(&store), index, remote.request_fn());

        coordinator.request_remote(vec!["a".to_string()], false);
        responses.remove(0).send(Err(remote_error("boom"))).unwrap();
        eventually(|| coordinator.error(&"a".to_string()).is_some()).await;

        // Unforced retry is filtered out by the sticky error.
        coordinator.request_remote(vec!["a".to_string()], false);
        assert_eq!(remote.calls(), 1);

        // Forced retry goes through and clears the error on success.
        coordinator.request_remote(vec!["a".to_string()], true);
        assert!(coordinator.is_loading(&"a".to_string()));
        responses.remove(0).send(Ok(vec![foo(1, "a", "ok")])).unwrap();
        eventually(|| !coordinator.is_loading(&"a".to_string())).await;

        assert_eq!(remote.calls(), 2);
        assert!(coordinator.error(&"a".to_string()).is_none());
        assert_eq!(store.find(&1).unwrap().bar, "ok");
    }

    #[tokio::test]
    async fn force_refetches_resolved_keys() {
        let store = store();
        let index = Arc::new(IndexStore::new(&store, |f: &Foo| f.key.clone()));
        store.upsert(vec![foo(1, "a", "stale")]);

        let (remote, mut responses) = FakeRemote::with_responses(1);
        let coordinator = RemoteStore::new(Arc::clone(&store), index, remote.request_fn());

        coordinator.request_remote(vec!["a".to_string()], true);
        assert_eq!(remote.calls(), 1);

        responses.remove(0).send(Ok(vec![foo(1, "a", "fresh")])).unwrap();
        eventually(|| !coordinator.is_loading(&"a".to_string())).await;
        assert_eq!(store.find(&1).unwrap().bar, "fresh");
    }
}
