//! # Hivemap
//!
//! A keyed concurrent state store with per-key serialization and
//! inter-key parallelism.
//!
//! Every key is guarded by its own logical execution context: a lazily
//! spawned worker that serializes read-modify-write callbacks on that key
//! while fanning reads out to parallel tasks within a per-key budget. Keys
//! that go quiet hand their state back to the central server and cost
//! nothing while idle.
//!
//! ## Core problem solved
//!
//! Shared-map designs force a choice between one big lock (no write
//! concurrency) and per-entry locks (no per-key ordering, no read
//! throttling, no cross-key transactions). This store routes every request
//! through a per-key executor instead:
//!
//! - **Per-key linearization**: read-modify-write callbacks on a key apply
//!   in dequeue order, with urgent traffic overtaking queued normal work.
//! - **Read parallelism**: reads observe a snapshot and run concurrently,
//!   throttled by a per-key budget.
//! - **Multi-key transactions**: a callback over a consistent snapshot of
//!   many keys, with atomic per-key publish.
//! - **Self-cleaning**: idle workers negotiate their own death and the map
//!   forgets untouched keys.
//!
//! ## Quick example
//!
//! ```rust,no_run
//! use hivemap::builders::StoreBuilder;
//! use hivemap::core::Mutation;
//!
//! # async fn demo() -> Result<(), hivemap::core::StoreError> {
//! let store = StoreBuilder::new().entry("visits", 0_u64).build()?;
//! let seen = store
//!     .get_and_update("visits", |v| {
//!         let n = v.unwrap_or(0) + 1;
//!         (n, Mutation::Put(n))
//!     })
//!     .await?;
//! assert_eq!(seen, 1);
//! # Ok(())
//! # }
//! ```
//!
//! For complete examples, see `tests/store_test.rs` and
//! `tests/multi_test.rs`.

#![deny(warnings)]
#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Builders to construct running stores from configuration.
pub mod builders;
/// Configuration models for stores.
pub mod config;
/// Core engine: requests, cells, the server, workers, and transactions.
pub mod core;
/// Process-wide named-store registry.
pub mod registry;
/// Runtime adapters and the spawn seam.
pub mod runtime;
/// The public store handle.
pub mod store;
/// Shared utilities.
pub mod util;
