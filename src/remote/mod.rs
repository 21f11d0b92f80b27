//! Remote hydration: request coordination and retriever helpers.
//!
//! [`RemoteStore`] layers loading/error bookkeeping and request dedup over an
//! [`EntityStore`](crate::EntityStore) and a find-capable collaborator.
//! [`Retriever`] and [`BulkRetriever`] are the alternate self-contained
//! strategies with per-id promise sharing.

mod coordinator;
mod retriever;

pub use coordinator::{RemoteStore, RequestFn, RequestFuture};
#[allow(deprecated)]
pub use retriever::{BulkFetchFn, BulkFetchFuture, BulkRetriever, FetchFn, FetchFuture, Retriever};
