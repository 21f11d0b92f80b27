//! Error types for recache.
//!
//! Absent ids and keys are never errors: `find` returns `Option::None` and
//! empty inputs are no-ops. The error surface here covers only the remote
//! side, where a fetch can genuinely fail or be superseded.

use std::sync::Arc;

use thiserror::Error;

/// A remote fetch failure, shared across everyone who observed it.
///
/// One failed bulk request produces a single error value; the coordinator
/// records the same `RemoteError` for every key in the batch and every
/// caller awaiting the batch receives a clone of the same `Arc`.
pub type RemoteError = Arc<dyn std::error::Error + Send + Sync>;

/// Wrap an ad-hoc message as a [`RemoteError`].
///
/// Handy when the transport layer surfaces failures as plain strings.
#[must_use]
pub fn remote_error(message: impl Into<String>) -> RemoteError {
    Arc::new(MessageError(message.into()))
}

#[derive(Debug, Error)]
#[error("{0}")]
struct MessageError(String);

/// Outcome of an awaited retrieval that did not produce an entity.
#[derive(Debug, Clone, Error)]
pub enum RetrieveError {
    /// The in-flight fetch was cancelled by a forced retrieve for the same id.
    ///
    /// Callers that issued the superseded call can usually ignore this and
    /// re-read the store once the forced fetch lands.
    #[error("fetch superseded by a forced retrieve")]
    Aborted,

    /// The underlying `fallback`/`request` call failed.
    #[error("remote fetch failed: {0}")]
    Fetch(RemoteError),

    /// A successful bulk response did not contain the requested id.
    #[error("id {0} missing from bulk fetch response")]
    MissingFromResponse(String),

    /// The in-flight fetch task ended without settling its result.
    #[error("in-flight fetch ended without a settled result")]
    TaskFailed,
}
