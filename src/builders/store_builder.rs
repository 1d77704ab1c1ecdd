//! Store construction: seed entries, tune configuration, start the engine.

use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::StoreConfig;
use crate::core::cell::Parallelism;
use crate::core::error::StoreError;
use crate::core::request::CallTimeout;
use crate::core::server::{EngineConfig, Server};
use crate::registry;
use crate::runtime::{SharedSpawner, TokioSpawner};
use crate::store::Store;

/// Builds a running [`Store`] from initial entries and configuration.
///
/// ```no_run
/// use hivemap::builders::StoreBuilder;
///
/// # async fn demo() -> Result<(), hivemap::core::StoreError> {
/// let store = StoreBuilder::new()
///     .entry("hits", 0_u64)
///     .entry("misses", 0_u64)
///     .build()?;
/// store.put("hits", 1).await?;
/// # Ok(())
/// # }
/// ```
pub struct StoreBuilder<K, V> {
    config: StoreConfig,
    entries: Vec<(K, V)>,
    spawner: Option<SharedSpawner>,
}

impl<K, V> Default for StoreBuilder<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> StoreBuilder<K, V> {
    /// An empty builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: StoreConfig::default(),
            entries: Vec::new(),
            spawner: None,
        }
    }

    /// Replace the whole configuration.
    #[must_use]
    pub fn with_config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Seed one initial entry.
    #[must_use]
    pub fn entry(mut self, key: K, value: V) -> Self {
        self.entries.push((key, value));
        self
    }

    /// Seed many initial entries.
    #[must_use]
    pub fn entries(mut self, entries: impl IntoIterator<Item = (K, V)>) -> Self {
        self.entries.extend(entries);
        self
    }

    /// Default per-key read-parallelism budget.
    #[must_use]
    pub fn max_processes(mut self, limit: Parallelism) -> Self {
        self.config.max_processes = limit;
        self
    }

    /// Idle wait before workers offer to die.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn idle_wait(mut self, wait: Duration) -> Self {
        self.config.idle_wait_ms = wait.as_millis() as u64;
        self
    }

    /// Default hard deadline for requests.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Register the store under a process-wide name on build.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = Some(name.into());
        self
    }

    /// Run the engine on a specific spawner instead of the ambient tokio
    /// runtime.
    #[must_use]
    pub fn spawner(mut self, spawner: SharedSpawner) -> Self {
        self.spawner = Some(spawner);
        self
    }
}

impl<K, V> StoreBuilder<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Validate, seed, and start the engine.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidConfig`] on bad configuration, or
    /// [`StoreError::DuplicateKey`] when the same key was seeded twice.
    ///
    /// # Panics
    ///
    /// Without an explicit [`StoreBuilder::spawner`], panics outside of a
    /// tokio runtime context.
    pub fn build(self) -> Result<Store<K, V>, StoreError> {
        self.config
            .validate()
            .map_err(StoreError::InvalidConfig)?;

        let mut seen = HashSet::with_capacity(self.entries.len());
        for (key, _) in &self.entries {
            if !seen.insert(key.clone()) {
                return Err(StoreError::DuplicateKey(format!("{key:?}")));
            }
        }

        let spawner = self
            .spawner
            .unwrap_or_else(|| Arc::new(TokioSpawner::current()) as SharedSpawner);
        let (tx, rx) = mpsc::unbounded_channel();
        let server = Server::new(
            self.entries,
            EngineConfig::from(&self.config),
            rx,
            tx.clone(),
            Arc::clone(&spawner),
        );
        spawner.spawn(Box::pin(server.run()));

        let store = Store::from_parts(
            tx,
            CallTimeout::Hard(Duration::from_millis(self.config.default_timeout_ms)),
            self.config.name.clone(),
        );
        if let Some(name) = self.config.name {
            registry::register(name, &store);
        }
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_initial_keys_are_rejected() {
        let result = StoreBuilder::new()
            .entry("a", 1_u32)
            .entry("b", 2)
            .entry("a", 3)
            .build();
        assert_eq!(
            result.unwrap_err(),
            StoreError::DuplicateKey("\"a\"".into())
        );
    }

    #[test]
    fn invalid_config_is_rejected_before_spawn() {
        let result: Result<Store<String, u32>, _> = StoreBuilder::new()
            .max_processes(Parallelism::Bounded(0))
            .build();
        assert!(matches!(result, Err(StoreError::InvalidConfig(_))));
    }
}
