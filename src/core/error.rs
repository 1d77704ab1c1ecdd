//! Error types for store operations.

use thiserror::Error;

/// Errors produced by the store engine.
///
/// Errors are local to the request that caused them: they travel back on
/// that request's reply channel and never take the server down.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The request was dequeued after its hard deadline had passed.
    #[error("request expired before execution")]
    Expired,
    /// Callback execution overran its break deadline and was abandoned.
    #[error("callback ran past its deadline")]
    TooLong,
    /// A multi-key callback returned the wrong number of per-key actions.
    #[error("callback returned {got} per-key actions, expected {expected}")]
    CallbackShape {
        /// Size of the transaction's update set.
        expected: usize,
        /// Number of actions the callback actually returned.
        got: usize,
    },
    /// The same key appeared twice in the initial entries.
    #[error("duplicate key in initial entries: {0}")]
    DuplicateKey(String),
    /// A worker terminated unexpectedly while holding the request.
    #[error("worker terminated mid-request")]
    WorkerCrashed,
    /// The store has been stopped; no further requests are accepted.
    #[error("store has been stopped")]
    Shutdown,
    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_terse_and_stable() {
        assert_eq!(
            StoreError::Expired.to_string(),
            "request expired before execution"
        );
        assert_eq!(
            StoreError::CallbackShape {
                expected: 3,
                got: 5
            }
            .to_string(),
            "callback returned 5 per-key actions, expected 3"
        );
        assert_eq!(
            StoreError::DuplicateKey("\"a\"".into()).to_string(),
            "duplicate key in initial entries: \"a\""
        );
    }
}
