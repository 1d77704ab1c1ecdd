//! Multi-key transactions: consistent snapshots with per-key publish.
//!
//! The server partitions a transaction's key set, wires up share and
//! commit channels, and hands the slow part to a coordinator task so its
//! own loop never blocks. Keys that are both read and updated are held by
//! their workers between the share and the commit, which is what makes the
//! snapshot consistent and the publish atomic per key.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::error::StoreError;
use crate::core::request::{CallTimeout, Mutation, Priority, Request, Verb};
use crate::core::server::{Server, ServerMsg, Slot};
use crate::core::worker::Msg;

/// Decision returned by a multi-key update callback.
///
/// The reply travels back to the caller; the second component decides what
/// happens to the transaction's update set. The `Set` and `Apply` forms
/// must match the update set's length exactly or the call fails with
/// [`StoreError::CallbackShape`].
pub enum MultiStep<K, V, R> {
    /// Reply and leave every update key unchanged.
    Reply(R),
    /// Reply and remove every update key.
    ReplyAndDrop(R),
    /// Reply and set the update keys element-wise.
    ReplyAndSet(R, Vec<V>),
    /// Reply and patch from a map: listed keys are set, keys missing from
    /// the map are removed.
    ReplyAndPatch(R, HashMap<K, V>),
    /// Reply and apply a per-key action element-wise.
    ReplyAndApply(R, Vec<Mutation<V>>),
}

/// Deferred reply, fired only after the publish phase so a caller that
/// regains control observes its own writes.
pub(crate) type ReplyFn = Box<dyn FnOnce() + Send + 'static>;

/// What an interpreted multi-key callback produced.
pub(crate) struct MultiVerdict<V> {
    /// Exactly one mutation per update key, aligned with the update set.
    pub plan: Vec<Mutation<V>>,
    /// The reply to the caller.
    pub reply: ReplyFn,
}

/// Interpreted multi-key callback: invoked exactly once with the snapshot
/// in get-set order (or with the failure that prevented it).
pub(crate) type MultiFn<V> =
    Box<dyn FnOnce(Result<Vec<Option<V>>, StoreError>) -> MultiVerdict<V> + Send + 'static>;

/// A staged multi-key transaction.
pub(crate) struct MultiRequest<K, V> {
    /// Keys whose values feed the callback, in argument order.
    pub get: Vec<K>,
    /// Keys whose values may change, in action order.
    pub upd: Vec<K>,
    pub callback: MultiFn<V>,
    pub priority: Priority,
    pub timeout: CallTimeout,
    pub inserted_at: Instant,
}

/// How each update key receives its mutation.
enum PublishLane<K, V> {
    /// The worker is parked in share-and-wait; complete it directly.
    Parked(oneshot::Sender<Mutation<V>>),
    /// Update-only key: route an internal update through the server,
    /// ahead of normal load.
    Routed(K),
}

impl<K, V> Server<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Phase 1: prepare every key's leg and spawn the coordinator.
    ///
    /// Read-and-update keys get a worker (promoting on demand) and a
    /// share-and-wait holding it until the commit, queued ahead of normal
    /// load. Read-only keys share from their worker at the caller's
    /// priority, or answer straight from the cell; unknown keys answer
    /// `Absent` without materializing anything.
    pub(crate) fn stage_multi(&mut self, req: MultiRequest<K, V>) {
        self.counters.transactions += 1;
        if req.timeout.expired(req.inserted_at) {
            warn!("transaction expired before staging");
            let verdict = (req.callback)(Err(StoreError::Expired));
            (verdict.reply)();
            return;
        }

        let txn = Uuid::new_v4();
        let upd_set: HashSet<K> = req.upd.iter().cloned().collect();
        let mut commits: HashMap<K, oneshot::Sender<Mutation<V>>> = HashMap::new();
        let mut shares = Vec::with_capacity(req.get.len());

        for key in &req.get {
            let (share_tx, share_rx) = oneshot::channel();
            if upd_set.contains(key) {
                let (commit_tx, commit_rx) = oneshot::channel();
                self.ensure_worker(key);
                // The share-and-wait leg always queues ahead of normal
                // load, like the publish traffic it pairs with.
                self.forward(
                    key.clone(),
                    Msg::Req(Request::new(
                        Verb::ShareWait {
                            share: share_tx,
                            commit: commit_rx,
                        },
                        Priority::AboveAvg,
                        req.timeout,
                    )),
                );
                commits.insert(key.clone(), commit_tx);
            } else if matches!(self.map.get(key), Some(Slot::Live(_))) {
                self.forward(
                    key.clone(),
                    Msg::Req(Request::new(Verb::Share(share_tx), req.priority, req.timeout)),
                );
            } else if let Some(Slot::Cell(cell)) = self.map.get(key) {
                let _ = share_tx.send(cell.value.clone());
            } else {
                let _ = share_tx.send(None);
            }
            shares.push(share_rx);
        }

        let mut publish = Vec::with_capacity(req.upd.len());
        for key in &req.upd {
            match commits.remove(key) {
                Some(commit) => publish.push(PublishLane::Parked(commit)),
                None => publish.push(PublishLane::Routed(key.clone())),
            }
        }

        debug!(%txn, gets = req.get.len(), upds = req.upd.len(), "transaction staged");
        let budget = req.timeout.remaining(req.inserted_at);
        let server = self.self_tx.clone();
        self.spawner.spawn(Box::pin(run_transaction(
            txn,
            shares,
            publish,
            req.callback,
            budget,
            server,
        )));
    }
}

/// Phases 2–4: collect the snapshot, run the callback, publish.
async fn run_transaction<K, V>(
    txn: Uuid,
    shares: Vec<oneshot::Receiver<Option<V>>>,
    publish: Vec<PublishLane<K, V>>,
    callback: MultiFn<V>,
    budget: Option<Duration>,
    server: mpsc::UnboundedSender<ServerMsg<K, V>>,
) where
    K: Send + 'static,
    V: Send + 'static,
{
    let collected = match budget {
        Some(d) => match tokio::time::timeout(d, collect(shares)).await {
            Ok(res) => res,
            Err(_) => Err(StoreError::Expired),
        },
        None => collect(shares).await,
    };

    let snapshot = match collected {
        Ok(values) => values,
        Err(err) => {
            warn!(%txn, error = %err, "transaction failed to collect snapshot, releasing keys");
            // Dropping the commit senders unparks every held worker with
            // no state change.
            drop(publish);
            let verdict = callback(Err(err));
            (verdict.reply)();
            return;
        }
    };

    let verdict = callback(Ok(snapshot));
    debug!(%txn, actions = verdict.plan.len(), "transaction publishing");
    for (lane, mutation) in publish.into_iter().zip(verdict.plan) {
        match lane {
            PublishLane::Parked(commit) => {
                let _ = commit.send(mutation);
            }
            PublishLane::Routed(key) => {
                // A no-op publish is skipped rather than materializing a
                // worker for an untouched key.
                if matches!(mutation, Mutation::Keep) {
                    continue;
                }
                let verb: Verb<V> = Verb::Update(Box::new(move |_| mutation));
                let request = Request::new(verb, Priority::AboveAvg, CallTimeout::Infinite);
                let _ = server.send(ServerMsg::Request { key, req: request });
            }
        }
    }
    // Publishes are ordered before the reply so the caller's next request
    // on any written key observes the transaction's effect.
    (verdict.reply)();
}

/// Await every share leg in order; all legs progress concurrently.
async fn collect<V>(
    shares: Vec<oneshot::Receiver<Option<V>>>,
) -> Result<Vec<Option<V>>, StoreError> {
    let mut values = Vec::with_capacity(shares.len());
    for rx in shares {
        match rx.await {
            Ok(value) => values.push(value),
            Err(_) => return Err(StoreError::WorkerCrashed),
        }
    }
    Ok(values)
}
