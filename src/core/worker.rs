//! Per-key worker: the serial executor that owns a key's value while live.
//!
//! A worker drains its mailbox into a two-band queue and dispatches one
//! request at a time. Reads fan out to child tasks within the key's
//! parallelism budget; updates run exclusively on the worker itself, so
//! every `GetAndUpdate`-class operation on a key is serialized by
//! construction. When the mailbox stays quiet for `idle_wait` the worker
//! asks the server for permission to die and hands its state back.

use std::fmt;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, warn};

use crate::core::cell::{Cell, Parallelism};
use crate::core::error::StoreError;
use crate::core::queue::BandQueue;
use crate::core::request::{CallTimeout, GetFn, Mutation, Priority, Request, UpdateFn, Verb};
use crate::core::server::{EngineConfig, ServerMsg, Verdict};
use crate::runtime::SharedSpawner;

/// Messages accepted by a worker.
pub(crate) enum Msg<V> {
    /// A routed request.
    Req(Request<V>),
    /// Control traffic, handled inline at placement.
    Info(Info),
}

/// Control messages. All except `Done` originate from the server and count
/// toward the idle-death message accounting.
pub(crate) enum Info {
    /// One of this worker's own read tasks finished; release its slot.
    Done,
    /// A read task spawned from the pre-promotion cell finished; the server
    /// relays its completion here.
    CellDone,
    /// Advisory budget change; applies to new read spawns only.
    MaxProcesses(Parallelism),
    /// Pin or unpin the worker against idle death.
    DontDie(bool),
    /// Finish all queued work, then exit without the idle handshake.
    Stop,
}

/// Releases a read slot even if the read callback panics.
struct DoneGuard<V> {
    tx: mpsc::UnboundedSender<Msg<V>>,
}

impl<V> Drop for DoneGuard<V> {
    fn drop(&mut self) {
        let _ = self.tx.send(Msg::Info(Info::Done));
    }
}

pub(crate) struct Worker<K, V> {
    key: K,
    /// The authoritative value box while this worker is alive.
    value: Option<V>,
    /// Charged read slots, including one for the worker's own loop.
    processes: u32,
    max_processes: Parallelism,
    dont_die: bool,
    idle_wait: Duration,
    /// Server-sent messages observed; compared against the server's
    /// forwarded count during the idle-death handshake.
    seen: u64,
    queue: BandQueue<V>,
    rx: mpsc::UnboundedReceiver<Msg<V>>,
    self_tx: mpsc::UnboundedSender<Msg<V>>,
    server: mpsc::UnboundedSender<ServerMsg<K, V>>,
    spawner: SharedSpawner,
    stopping: bool,
}

/// Spawn a worker seeded with a cell's state and return its mailbox.
pub(crate) fn spawn<K, V>(
    key: K,
    cell: Cell<V>,
    cfg: &EngineConfig,
    server: mpsc::UnboundedSender<ServerMsg<K, V>>,
    spawner: &SharedSpawner,
) -> mpsc::UnboundedSender<Msg<V>>
where
    K: fmt::Debug + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let worker = Worker {
        key,
        value: cell.value,
        // The worker's own loop occupies one slot on top of any read
        // tasks still in flight from the cell fast path.
        processes: cell.processes + 1,
        max_processes: cell.max_processes,
        dont_die: false,
        idle_wait: cfg.idle_wait,
        seen: 0,
        queue: BandQueue::new(cfg.saturation),
        rx,
        self_tx: tx.clone(),
        server,
        spawner: spawner.clone(),
        stopping: false,
    };
    spawner.spawn(Box::pin(worker.run()));
    tx
}

impl<K, V> Worker<K, V>
where
    K: fmt::Debug + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    async fn run(mut self) {
        debug!(key = ?self.key, "worker started");
        loop {
            if self.queue.is_empty() {
                if self.stopping {
                    break;
                }
                match timeout(self.idle_wait, self.rx.recv()).await {
                    Ok(Some(msg)) => self.place(msg),
                    Ok(None) => break,
                    Err(_) => {
                        if self.dont_die || self.processes > 1 {
                            continue;
                        }
                        match self.negotiate_death().await {
                            Verdict::Die => {
                                debug!(key = ?self.key, "worker retired");
                                return;
                            }
                            Verdict::Continue => {
                                self.idle_wait = backoff(self.idle_wait);
                                continue;
                            }
                        }
                    }
                }
            }
            // Non-blocking drain so freshly arrived urgent work can
            // overtake queued normal requests before the next dispatch.
            while let Ok(msg) = self.rx.try_recv() {
                self.place(msg);
            }
            if let Some(req) = self.queue.pop() {
                self.dispatch(req).await;
            }
        }
        debug!(key = ?self.key, "worker stopped");
    }

    fn place(&mut self, msg: Msg<V>) {
        match msg {
            Msg::Req(req) => {
                self.seen += 1;
                if req.priority == Priority::Now {
                    match req.verb {
                        // `Now` reads run against the currently visible
                        // value, ahead of everything queued.
                        Verb::Get(f) => f(Ok(self.value.clone())),
                        verb => self.queue.push(Request {
                            verb,
                            priority: req.priority,
                            timeout: req.timeout,
                            inserted_at: req.inserted_at,
                        }),
                    }
                } else {
                    self.queue.push(req);
                }
            }
            Msg::Info(info) => match info {
                Info::Done => self.release_read_slot(),
                Info::CellDone => {
                    self.seen += 1;
                    self.release_read_slot();
                }
                Info::MaxProcesses(limit) => {
                    self.seen += 1;
                    self.max_processes = limit;
                }
                Info::DontDie(pinned) => {
                    self.seen += 1;
                    self.dont_die = pinned;
                }
                Info::Stop => {
                    self.seen += 1;
                    self.stopping = true;
                }
            },
        }
    }

    fn release_read_slot(&mut self) {
        // One slot always belongs to the worker's own loop.
        if self.processes > 1 {
            self.processes -= 1;
        }
    }

    async fn dispatch(&mut self, req: Request<V>) {
        if req.timeout.expired(req.inserted_at) {
            warn!(key = ?self.key, "request expired in queue");
            req.fail(StoreError::Expired);
            return;
        }
        match req.verb {
            Verb::Get(f) => self.run_read(f),
            Verb::Share(tx) => {
                let _ = tx.send(self.value.clone());
            }
            Verb::ShareWait { share, commit } => {
                if share.send(self.value.clone()).is_err() {
                    warn!(key = ?self.key, "transaction abandoned before snapshot");
                    return;
                }
                // The key is held until the coordinator decides; nothing
                // else on this key runs in between.
                match commit.await {
                    Ok(mutation) => self.apply(mutation),
                    Err(_) => {
                        debug!(key = ?self.key, "transaction released key without commit");
                    }
                }
            }
            Verb::Update(f) => self.run_update(f, req.timeout).await,
        }
    }

    /// Reads fan out to child tasks bound to the value as of dispatch,
    /// while a budget slot is free. With the budget exhausted the read
    /// executes inline on the worker's own slot and replies before the
    /// next request is selected; a budget of one is therefore fully
    /// serial.
    fn run_read(&mut self, f: GetFn<V>) {
        if !self.max_processes.allows(self.processes) {
            f(Ok(self.value.clone()));
            return;
        }
        self.processes += 1;
        let value = self.value.clone();
        let guard = DoneGuard {
            tx: self.self_tx.clone(),
        };
        self.spawner.spawn(Box::pin(async move {
            f(Ok(value));
            drop(guard);
        }));
    }

    async fn run_update(&mut self, f: UpdateFn<V>, deadline: CallTimeout) {
        let snapshot = self.value.clone();
        match deadline.break_budget() {
            None => {
                let mutation = f(Ok(snapshot));
                self.apply(mutation);
            }
            Some(budget) => {
                // Safe Rust cannot preempt a running closure: the callback
                // runs on the blocking pool and is detached on overrun, its
                // mutation discarded. The caller times out on its side.
                let task = tokio::task::spawn_blocking(move || f(Ok(snapshot)));
                match timeout(budget, task).await {
                    Ok(Ok(mutation)) => self.apply(mutation),
                    Ok(Err(join_err)) => {
                        error!(key = ?self.key, error = %join_err, "update callback panicked");
                    }
                    Err(_) => {
                        warn!(key = ?self.key, "update ran too long, abandoning its result");
                    }
                }
            }
        }
    }

    fn apply(&mut self, mutation: Mutation<V>) {
        match mutation {
            Mutation::Keep => {}
            Mutation::Drop => self.value = None,
            Mutation::Put(v) => self.value = Some(v),
        }
    }

    /// Ask the server for permission to exit, exporting the final state.
    /// The server grants it only if no message was forwarded since the
    /// last one this worker has seen.
    async fn negotiate_death(&mut self) -> Verdict {
        let (reply, verdict) = tokio::sync::oneshot::channel();
        let msg = ServerMsg::MayIDie {
            key: self.key.clone(),
            seen: self.seen,
            value: self.value.clone(),
            max_processes: self.max_processes,
            reply,
        };
        if self.server.send(msg).is_err() {
            return Verdict::Die;
        }
        verdict.await.unwrap_or(Verdict::Die)
    }
}

/// Raise the idle wait by a small random jitter so workers that keep
/// getting a `Continue` verdict spread their next handshakes out.
fn backoff(current: Duration) -> Duration {
    let cap = (current.as_millis() as u64 / 4).max(1);
    let jitter = rand::rng().random_range(1..=cap);
    current + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_within_a_quarter() {
        let base = Duration::from_millis(100);
        for _ in 0..32 {
            let next = backoff(base);
            assert!(next > base);
            assert!(next <= base + Duration::from_millis(25));
        }
    }
}
