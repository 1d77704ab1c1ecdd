//! Core engine: requests, cells, the server, workers, and multi-key
//! transactions.

pub mod cell;
pub mod error;
pub mod multi;
pub(crate) mod queue;
pub mod request;
pub mod server;
pub(crate) mod worker;

pub use cell::Parallelism;
pub use error::{AppResult, StoreError};
pub use multi::MultiStep;
pub use request::{CallTimeout, Mutation, Priority};
pub use server::StoreStats;
