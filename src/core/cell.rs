//! Per-key server-side state and read-parallelism limits.

use serde::{Deserialize, Serialize};

/// Per-key read-parallelism budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parallelism {
    /// At most this many concurrent readers per key.
    Bounded(u32),
    /// No limit on concurrent readers.
    Unbounded,
}

impl Parallelism {
    /// Default per-key budget.
    pub const DEFAULT: Self = Self::Bounded(5);

    /// True when `charged` already-running readers leave room for one more.
    #[must_use]
    pub fn allows(self, charged: u32) -> bool {
        match self {
            Self::Bounded(n) => charged < n,
            Self::Unbounded => true,
        }
    }
}

impl Default for Parallelism {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Server-side record for a key with no live worker.
///
/// Distinguishes "present with a value" from "absent" (the key is known but
/// holds nothing); a key the map has never seen has no cell at all.
#[derive(Debug)]
pub(crate) struct Cell<V> {
    /// The value box: `Some` is present, `None` is absent.
    pub value: Option<V>,
    /// Read tasks currently in flight for this key.
    pub processes: u32,
    /// Per-key read budget.
    pub max_processes: Parallelism,
}

impl<V> Cell<V> {
    pub fn new(value: Option<V>, max_processes: Parallelism) -> Self {
        Self {
            value,
            processes: 0,
            max_processes,
        }
    }

    pub fn vacant(max_processes: Parallelism) -> Self {
        Self::new(None, max_processes)
    }

    /// A cell is garbage once it is empty, quiescent, and back on the
    /// default budget: nothing about it is worth remembering.
    pub fn reclaimable(&self, default_max: Parallelism) -> bool {
        self.value.is_none() && self.processes == 0 && self.max_processes == default_max
    }
}
