//! Find-capability shared by store-like collaborators.

use std::sync::Arc;

/// Read-only keyed lookup.
///
/// The remote coordinator depends only on this capability, so any lookup
/// backend can stand in for an index: the [`IndexStore`](crate::IndexStore)
/// resolves by secondary key, the [`EntityStore`](crate::EntityStore) by
/// primary id.
pub trait Lookup<K, T>: Send + Sync {
    /// Resolve `key` to the entity it currently maps to, if any.
    fn find(&self, key: &K) -> Option<Arc<T>>;
}
