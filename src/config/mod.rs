//! Configuration models for stores.

use serde::{Deserialize, Serialize};

use crate::core::cell::Parallelism;

/// Store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Default per-key read-parallelism budget.
    #[serde(default)]
    pub max_processes: Parallelism,
    /// Default per-request hard deadline in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// How long a worker with an empty mailbox waits before asking the
    /// server for permission to die. The knob behind garbage-collection
    /// latency for idle keys.
    #[serde(default = "default_idle_wait_ms")]
    pub idle_wait_ms: u64,
    /// Queue depth past which priority placement degrades to plain FIFO.
    #[serde(default = "default_queue_saturation")]
    pub queue_saturation: usize,
    /// Optional process-wide registration name.
    #[serde(default)]
    pub name: Option<String>,
}

fn default_timeout_ms() -> u64 {
    5_000
}

fn default_idle_wait_ms() -> u64 {
    100
}

fn default_queue_saturation() -> usize {
    1_024
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_processes: Parallelism::default(),
            default_timeout_ms: default_timeout_ms(),
            idle_wait_ms: default_idle_wait_ms(),
            queue_saturation: default_queue_saturation(),
            name: None,
        }
    }
}

impl StoreConfig {
    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns a description of the first offending field.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_processes == Parallelism::Bounded(0) {
            return Err("max_processes must be greater than 0".into());
        }
        if self.default_timeout_ms == 0 {
            return Err("default_timeout_ms must be greater than 0".into());
        }
        if self.idle_wait_ms == 0 {
            return Err("idle_wait_ms must be greater than 0".into());
        }
        if self.queue_saturation == 0 {
            return Err("queue_saturation must be greater than 0".into());
        }
        if matches!(&self.name, Some(name) if name.is_empty()) {
            return Err("name must not be empty when set".into());
        }
        Ok(())
    }

    /// Parse a store configuration from a JSON string and validate.
    ///
    /// # Errors
    ///
    /// Returns a parse or validation error description.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = StoreConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.max_processes, Parallelism::Bounded(5));
        assert_eq!(cfg.default_timeout_ms, 5_000);
        assert_eq!(cfg.idle_wait_ms, 100);
    }

    #[test]
    fn zero_budget_rejected() {
        let cfg = StoreConfig {
            max_processes: Parallelism::Bounded(0),
            ..StoreConfig::default()
        };
        assert!(cfg.validate().unwrap_err().contains("max_processes"));
    }

    #[test]
    fn zero_timeout_rejected() {
        let cfg = StoreConfig {
            default_timeout_ms: 0,
            ..StoreConfig::default()
        };
        assert!(cfg.validate().unwrap_err().contains("default_timeout_ms"));
    }

    #[test]
    fn empty_name_rejected() {
        let cfg = StoreConfig {
            name: Some(String::new()),
            ..StoreConfig::default()
        };
        assert!(cfg.validate().unwrap_err().contains("name"));
    }

    #[test]
    fn json_round_trip_with_defaults() {
        let cfg = StoreConfig::from_json_str(r#"{"max_processes":{"bounded":3}}"#).unwrap();
        assert_eq!(cfg.max_processes, Parallelism::Bounded(3));
        assert_eq!(cfg.default_timeout_ms, 5_000);

        let unbounded =
            StoreConfig::from_json_str(r#"{"max_processes":"unbounded","idle_wait_ms":20}"#)
                .unwrap();
        assert_eq!(unbounded.max_processes, Parallelism::Unbounded);
        assert_eq!(unbounded.idle_wait_ms, 20);
    }

    #[test]
    fn invalid_json_surfaces_parse_error() {
        let err = StoreConfig::from_json_str("{not json}").unwrap_err();
        assert!(err.contains("parse error"));
    }
}
