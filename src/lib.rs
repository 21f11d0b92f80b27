//! # recache — normalized entity cache with remote hydration
//!
//! `recache` keeps a normalized collection of records keyed by an identifier
//! column, derives secondary lookup structures that stay consistent with the
//! primary collection, and fetches missing records from a remote source while
//! suppressing duplicate in-flight requests.
//!
//! ## Core pieces
//!
//! - [`EntityStore`]: the primary id → entity mapping with change detection
//!   and synchronous mutation notification
//! - [`IndexStore`]: an incrementally-maintained secondary key → entity view
//! - [`RemoteStore`]: loading/error bookkeeping and request dedup for bulk
//!   remote fetches
//! - [`Retriever`] / [`BulkRetriever`]: self-contained fetch helpers with
//!   per-id promise sharing (and, for [`Retriever`], cancellation of
//!   superseded fetches)
//!
//! ## Usage
//!
//! ```
//! use std::sync::Arc;
//! use recache::{EntityStore, IndexStore};
//!
//! #[derive(Clone, PartialEq)]
//! struct Track {
//!     id: u64,
//!     slug: String,
//! }
//!
//! let store = Arc::new(EntityStore::new(|t: &Track| t.id));
//! let index = IndexStore::new(&store, |t: &Track| t.slug.clone());
//!
//! store.upsert(vec![Track { id: 1, slug: "intro".to_string() }]);
//!
//! assert_eq!(store.size(), 1);
//! let hit = index.find(&"intro".to_string()).unwrap();
//! assert_eq!(hit.id, 1);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod persist;
pub mod remote;
pub mod store;

mod sync;

pub use error::{remote_error, RemoteError, RetrieveError};
pub use persist::{persist_all_to, persist_to};
#[allow(deprecated)]
pub use remote::{
    BulkFetchFn, BulkFetchFuture, BulkRetriever, FetchFn, FetchFuture, RemoteStore, RequestFn,
    RequestFuture, Retriever,
};
pub use store::{EntityStore, IndexStore, Lookup, MutationSubscriber};
