//! Primary and derived in-memory stores.
//!
//! [`EntityStore`] owns the normalized id → entity collection and is the only
//! mutation entry point. [`IndexStore`] derives a secondary key → entity view
//! and stays consistent by subscribing to the entity store's mutation channel.
//! The [`Lookup`] trait is the narrow find-capability both expose.

mod entity;
mod index;
mod traits;

pub use entity::{EntityStore, MutationSubscriber};
pub use index::IndexStore;
pub use traits::Lookup;
