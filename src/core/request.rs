//! Request records: priorities, deadlines, verbs, and reply plumbing.
//!
//! A request is created by the public handle, routed by the server, and
//! consumed exactly once by a worker (or by the server's cell fast path).
//! User callbacks are type-erased at the API boundary: the typed callback
//! and its reply channel are closed over into a boxed `FnOnce` that the
//! engine invokes exactly once with either `Ok(snapshot)` or the error that
//! prevented execution. The engine never sees the caller's reply type.

use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::core::error::StoreError;

/// Queue placement for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    /// Bypass the queue entirely; run against the currently visible value.
    Now,
    /// Jump ahead of all queued non-urgent work.
    Urgent,
    /// Ahead of normal load, behind urgent traffic. Used internally by
    /// multi-key transaction legs and their commits; public for parity
    /// with the caller-side priority shorthand.
    AboveAvg,
    /// Default placement at the back of the queue.
    #[default]
    Normal,
}

/// Per-request deadline policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTimeout {
    /// No deadline.
    Infinite,
    /// Drop the request with [`StoreError::Expired`] if it is dequeued
    /// after the deadline.
    Hard(Duration),
    /// As [`CallTimeout::Hard`], and additionally abandon execution that
    /// overruns the budget measured from dequeue time.
    Break(Duration),
}

impl CallTimeout {
    /// True when a request inserted at `inserted_at` must be dropped at
    /// dequeue.
    pub(crate) fn expired(&self, inserted_at: Instant) -> bool {
        match self {
            Self::Infinite => false,
            Self::Hard(d) | Self::Break(d) => inserted_at.elapsed() > *d,
        }
    }

    /// Execution budget from dequeue, when this policy bounds execution.
    pub(crate) fn break_budget(&self) -> Option<Duration> {
        match self {
            Self::Break(d) => Some(*d),
            _ => None,
        }
    }

    /// How long a caller should wait for a reply before concluding the
    /// callback was abandoned. Only `Break` requests can go silent: the
    /// dequeue happens within the hard deadline and the overrun is detected
    /// one budget later, so twice the budget plus slack bounds the wait.
    pub(crate) fn reply_budget(&self) -> Option<Duration> {
        match self {
            Self::Break(d) => Some(*d * 2 + Duration::from_millis(100)),
            _ => None,
        }
    }

    /// Remaining collection budget for a transaction staged at
    /// `inserted_at`; `None` means unbounded.
    pub(crate) fn remaining(&self, inserted_at: Instant) -> Option<Duration> {
        match self {
            Self::Infinite => None,
            Self::Hard(d) | Self::Break(d) => {
                Some(d.saturating_sub(inserted_at.elapsed()))
            }
        }
    }
}

/// What an update callback decided to do with the stored value.
#[derive(Debug)]
pub enum Mutation<V> {
    /// Leave the value as it is.
    Keep,
    /// Remove the value.
    Drop,
    /// Replace the value.
    Put(V),
}

/// Read callback: invoked exactly once with a snapshot of the value, or
/// with the error that prevented the read. Replies through its captured
/// channel.
pub(crate) type GetFn<V> =
    Box<dyn FnOnce(Result<Option<V>, StoreError>) + Send + 'static>;

/// Update callback: as [`GetFn`], and returns the mutation to apply.
/// When invoked with an error it must not mutate (returns `Keep`).
pub(crate) type UpdateFn<V> =
    Box<dyn FnOnce(Result<Option<V>, StoreError>) -> Mutation<V> + Send + 'static>;

/// The operation a request carries.
pub(crate) enum Verb<V> {
    /// Read-only; eligible for read-parallel execution.
    Get(GetFn<V>),
    /// Exclusive read-modify-write.
    Update(UpdateFn<V>),
    /// Emit the current value for a multi-key snapshot. Never mutates.
    Share(oneshot::Sender<Option<V>>),
    /// Emit the current value, then hold the key until the coordinator
    /// publishes a commit or goes away.
    ShareWait {
        /// Snapshot channel back to the coordinator.
        share: oneshot::Sender<Option<V>>,
        /// The coordinator's follow-up decision for this key.
        commit: oneshot::Receiver<Mutation<V>>,
    },
}

/// A routed request: verb plus scheduling metadata.
pub(crate) struct Request<V> {
    pub verb: Verb<V>,
    pub priority: Priority,
    pub timeout: CallTimeout,
    pub inserted_at: Instant,
}

impl<V> Request<V> {
    pub fn new(verb: Verb<V>, priority: Priority, timeout: CallTimeout) -> Self {
        Self {
            verb,
            priority,
            timeout,
            inserted_at: Instant::now(),
        }
    }

    /// Deliver `err` to whoever is waiting on this request, consuming it.
    pub fn fail(self, err: StoreError) {
        match self.verb {
            Verb::Get(f) => f(Err(err)),
            Verb::Update(f) => {
                let _ = f(Err(err));
            }
            // Dropping the snapshot channel tells the coordinator the leg
            // is dead; it fails the transaction on its side.
            Verb::Share(tx) => drop(tx),
            Verb::ShareWait { share, .. } => drop(share),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hard_timeout_expires_after_budget() {
        let t = CallTimeout::Hard(Duration::from_millis(10));
        let fresh = Instant::now();
        assert!(!t.expired(fresh));
        let stale = Instant::now() - Duration::from_millis(50);
        assert!(t.expired(stale));
    }

    #[test]
    fn infinite_never_expires() {
        let t = CallTimeout::Infinite;
        let stale = Instant::now() - Duration::from_secs(5);
        assert!(!t.expired(stale));
        assert!(t.break_budget().is_none());
        assert!(t.remaining(stale).is_none());
    }

    #[test]
    fn break_budget_only_for_break() {
        assert!(CallTimeout::Hard(Duration::from_secs(1)).break_budget().is_none());
        assert_eq!(
            CallTimeout::Break(Duration::from_secs(1)).break_budget(),
            Some(Duration::from_secs(1))
        );
    }

    #[test]
    fn failing_a_request_reaches_the_callback() {
        let (tx, mut rx) = oneshot::channel();
        let verb: Verb<u32> = Verb::Get(Box::new(move |input| {
            let _ = tx.send(input);
        }));
        let req = Request::new(verb, Priority::Normal, CallTimeout::Infinite);
        req.fail(StoreError::Expired);
        assert_eq!(rx.try_recv().unwrap(), Err(StoreError::Expired));
    }
}
