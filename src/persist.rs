//! Pass-through persistence adapters.
//!
//! These wrap a single entity or a list into an upsert and hand the value
//! back unchanged, so they slot into external fetch pipelines as a `map`
//! step: fetch, persist, keep going.

use std::hash::Hash;
use std::sync::Arc;

use crate::store::EntityStore;

/// Adapter persisting one entity into `store` and passing it through.
pub fn persist_to<T, I>(store: &Arc<EntityStore<T, I>>) -> impl Fn(T) -> T
where
    T: Clone + PartialEq + Send + Sync + 'static,
    I: Eq + Hash + Clone + Send + Sync + 'static,
{
    let store = Arc::clone(store);
    move |value| {
        store.upsert(vec![value.clone()]);
        value
    }
}

/// Adapter persisting a list of entities into `store` and passing it through.
pub fn persist_all_to<T, I>(store: &Arc<EntityStore<T, I>>) -> impl Fn(Vec<T>) -> Vec<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    I: Eq + Hash + Clone + Send + Sync + 'static,
{
    let store = Arc::clone(store);
    move |values| {
        store.upsert(values.clone());
        values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Foo {
        id: u64,
        bar: String,
    }

    fn foo(id: u64, bar: &str) -> Foo {
        Foo {
            id,
            bar: bar.to_string(),
        }
    }

    #[test]
    fn persist_to_upserts_and_passes_through() {
        let store = Arc::new(EntityStore::new(|f: &Foo| f.id));
        let persist = persist_to(&store);

        let value = persist(foo(1, "hello"));
        assert_eq!(value.bar, "hello");
        assert_eq!(store.find(&1).unwrap().bar, "hello");
    }

    #[test]
    fn persist_all_to_upserts_the_whole_batch() {
        let store = Arc::new(EntityStore::new(|f: &Foo| f.id));
        let persist = persist_all_to(&store);

        let values = persist(vec![foo(1, "a"), foo(2, "b")]);
        assert_eq!(values.len(), 2);
        assert_eq!(store.size(), 2);
    }
}
