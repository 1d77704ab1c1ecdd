//! Process-wide named-store registry.
//!
//! Stores built with a `name` register themselves here; any part of the
//! process can then recover a typed handle without threading it through.
//! Lookups are type-checked: asking for a name under the wrong key or
//! value types returns `None` rather than a handle that cannot work.

use std::any::Any;
use std::collections::HashMap;
use std::sync::OnceLock;

use parking_lot::RwLock;

use crate::store::Store;

type AnyStore = Box<dyn Any + Send + Sync>;

fn table() -> &'static RwLock<HashMap<String, AnyStore>> {
    static TABLE: OnceLock<RwLock<HashMap<String, AnyStore>>> = OnceLock::new();
    TABLE.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Register a store under a name, replacing any previous registration.
pub fn register<K, V>(name: impl Into<String>, store: &Store<K, V>)
where
    K: Send + 'static,
    V: Send + 'static,
{
    table().write().insert(name.into(), Box::new(store.clone()));
}

/// Look up a named store. Returns `None` when the name is unknown or was
/// registered under different key/value types.
#[must_use]
pub fn lookup<K, V>(name: &str) -> Option<Store<K, V>>
where
    K: Send + 'static,
    V: Send + 'static,
{
    table()
        .read()
        .get(name)
        .and_then(|any| any.downcast_ref::<Store<K, V>>())
        .cloned()
}

/// Remove a registration; returns whether the name was present.
pub fn unregister(name: &str) -> bool {
    table().write().remove(name).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::StoreBuilder;

    #[tokio::test]
    async fn register_lookup_round_trip() {
        let store: Store<String, u32> = StoreBuilder::new().build().unwrap();
        register("registry-test-a", &store);

        let found = lookup::<String, u32>("registry-test-a").expect("registered");
        found.put("k".into(), 7).await.unwrap();
        assert_eq!(store.fetch("k".into()).await.unwrap(), Some(7));

        assert!(unregister("registry-test-a"));
        assert!(lookup::<String, u32>("registry-test-a").is_none());
    }

    #[tokio::test]
    async fn lookup_is_type_checked() {
        let store: Store<String, u32> = StoreBuilder::new().build().unwrap();
        register("registry-test-b", &store);
        assert!(lookup::<String, String>("registry-test-b").is_none());
        assert!(lookup::<u64, u32>("registry-test-b").is_none());
        unregister("registry-test-b");
    }
}
