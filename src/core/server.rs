//! The server: owner of the key→state routing table.
//!
//! The server is a single task that serializes every mutation of the map.
//! Reads on worker-less keys run on the cell fast path; anything else
//! promotes the key to a dedicated worker. All dispatch logic is
//! non-blocking: the server only ever waits on its own mailbox.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::StoreConfig;
use crate::core::cell::{Cell, Parallelism};
use crate::core::error::StoreError;
use crate::core::multi::MultiRequest;
use crate::core::request::{CallTimeout, GetFn, Priority, Request, Verb};
use crate::core::worker::{self, Info, Msg};
use crate::runtime::SharedSpawner;

/// Point-in-time engine counters, retrieved through [`crate::store::Store::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Keys tracked by the server map, as cells or live workers.
    pub keys: usize,
    /// Keys currently owned by a live worker.
    pub live_workers: usize,
    /// Single-key requests routed since the store started.
    pub routed_requests: u64,
    /// Multi-key transactions staged.
    pub transactions: u64,
    /// Cell-to-worker promotions.
    pub promotions: u64,
    /// Workers retired through the idle-death handshake.
    pub retirements: u64,
}

/// The server's answer to a worker's idle-death request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    /// Messages are in flight; keep living.
    Continue,
    /// Quiescent; state has been taken back, exit now.
    Die,
}

/// Messages accepted by the server.
pub(crate) enum ServerMsg<K, V> {
    /// Single-key request to route.
    Request {
        key: K,
        req: Request<V>,
    },
    /// Multi-key transaction to stage.
    Multi(MultiRequest<K, V>),
    /// A cell-path read task finished for this key.
    Done {
        key: K,
    },
    /// Idle worker asking permission to exit, exporting its final state.
    MayIDie {
        key: K,
        seen: u64,
        value: Option<V>,
        max_processes: Parallelism,
        reply: oneshot::Sender<Verdict>,
    },
    /// Advisory per-key budget change.
    MaxProcesses {
        key: K,
        limit: Parallelism,
    },
    /// Pin or unpin a key's worker against idle death.
    KeepAlive {
        key: K,
        pinned: bool,
    },
    /// Snapshot of the tracked keys.
    Keys {
        reply: oneshot::Sender<Vec<K>>,
    },
    /// Engine counters snapshot.
    Stats {
        reply: oneshot::Sender<StoreStats>,
    },
    /// Barrier: replies once every request already queued on every live
    /// worker at send time has been dispatched.
    Sync {
        reply: oneshot::Sender<()>,
    },
    /// Graceful drain: workers finish queued requests and exit.
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// A map entry: either passive state or a live worker's mailbox.
pub(crate) enum Slot<V> {
    Cell(Cell<V>),
    Live(WorkerHandle<V>),
}

/// Handle to a live worker, tracking how many messages were forwarded so
/// idle-death handshakes can detect in-flight traffic.
pub(crate) struct WorkerHandle<V> {
    pub tx: mpsc::UnboundedSender<Msg<V>>,
    pub sent: u64,
}

/// Store-wide engine parameters, distilled from [`StoreConfig`].
#[derive(Debug, Clone)]
pub(crate) struct EngineConfig {
    pub default_max: Parallelism,
    pub idle_wait: Duration,
    pub saturation: usize,
}

impl From<&StoreConfig> for EngineConfig {
    fn from(cfg: &StoreConfig) -> Self {
        Self {
            default_max: cfg.max_processes,
            idle_wait: Duration::from_millis(cfg.idle_wait_ms),
            saturation: cfg.queue_saturation,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub routed: u64,
    pub transactions: u64,
    pub promotions: u64,
    pub retirements: u64,
}

pub(crate) struct Server<K, V> {
    pub(crate) map: HashMap<K, Slot<V>>,
    pub(crate) cfg: EngineConfig,
    rx: mpsc::UnboundedReceiver<ServerMsg<K, V>>,
    pub(crate) self_tx: mpsc::UnboundedSender<ServerMsg<K, V>>,
    pub(crate) spawner: SharedSpawner,
    pub(crate) counters: Counters,
}

impl<K, V> Server<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + 'static,
    V: Clone + Send + 'static,
{
    pub(crate) fn new(
        entries: Vec<(K, V)>,
        cfg: EngineConfig,
        rx: mpsc::UnboundedReceiver<ServerMsg<K, V>>,
        self_tx: mpsc::UnboundedSender<ServerMsg<K, V>>,
        spawner: SharedSpawner,
    ) -> Self {
        let mut map = HashMap::with_capacity(entries.len());
        for (key, value) in entries {
            map.insert(key, Slot::Cell(Cell::new(Some(value), cfg.default_max)));
        }
        Self {
            map,
            cfg,
            rx,
            self_tx,
            spawner,
            counters: Counters::default(),
        }
    }

    pub(crate) async fn run(mut self) {
        debug!("state server started");
        while let Some(msg) = self.rx.recv().await {
            match msg {
                ServerMsg::Request { key, req } => self.route(key, req),
                ServerMsg::Multi(req) => self.stage_multi(req),
                ServerMsg::Done { key } => self.read_done(&key),
                ServerMsg::MayIDie {
                    key,
                    seen,
                    value,
                    max_processes,
                    reply,
                } => self.judge(key, seen, value, max_processes, reply),
                ServerMsg::MaxProcesses { key, limit } => self.set_max_processes(key, limit),
                ServerMsg::KeepAlive { key, pinned } => {
                    self.ensure_worker(&key);
                    self.forward(key, Msg::Info(Info::DontDie(pinned)));
                }
                ServerMsg::Keys { reply } => {
                    let _ = reply.send(self.map.keys().cloned().collect());
                }
                ServerMsg::Stats { reply } => {
                    let _ = reply.send(self.stats());
                }
                ServerMsg::Sync { reply } => self.sync_barrier(reply),
                ServerMsg::Stop { reply } => {
                    self.drain_workers();
                    let _ = reply.send(());
                    break;
                }
            }
        }
        debug!("state server exiting");
    }

    /// Dispatch a single-key request per the routing rules: live worker
    /// first, cell fast path second, lazily materialized state last.
    pub(crate) fn route(&mut self, key: K, req: Request<V>) {
        self.counters.routed += 1;
        if req.timeout.expired(req.inserted_at) {
            warn!(key = ?key, "request expired before dispatch");
            req.fail(StoreError::Expired);
            return;
        }
        if !self.map.contains_key(&key) {
            match req.verb {
                // Absent-key reads never materialize state: the callback
                // sees `Absent` and the map stays untouched.
                Verb::Get(f) => {
                    self.spawn_read(key, f, None, false);
                    return;
                }
                Verb::Share(tx) => {
                    let _ = tx.send(None);
                    return;
                }
                _ => {
                    self.map
                        .insert(key.clone(), Slot::Cell(Cell::vacant(self.cfg.default_max)));
                }
            }
        }
        if matches!(self.map.get(&key), Some(Slot::Live(_))) {
            self.forward(key, Msg::Req(req));
        } else {
            self.serve_from_cell(key, req);
        }
    }

    /// Handle a request against a passive cell. Reads within budget run as
    /// detached tasks; anything else promotes the key to a worker.
    fn serve_from_cell(&mut self, key: K, req: Request<V>) {
        let plan = {
            let Some(Slot::Cell(cell)) = self.map.get_mut(&key) else {
                return;
            };
            match &req.verb {
                Verb::Get(_) => {
                    if req.priority == Priority::Now {
                        // Bypasses the budget entirely.
                        CellPlan::Read {
                            value: cell.value.clone(),
                            charged: false,
                        }
                    } else if cell.max_processes.allows(cell.processes) {
                        cell.processes += 1;
                        CellPlan::Read {
                            value: cell.value.clone(),
                            charged: true,
                        }
                    } else {
                        CellPlan::Promote
                    }
                }
                // Snapshot legs read the cell directly, no worker needed.
                Verb::Share(_) => CellPlan::Answer(cell.value.clone()),
                Verb::Update(_) | Verb::ShareWait { .. } => CellPlan::Promote,
            }
        };

        match plan {
            CellPlan::Read { value, charged } => {
                let Verb::Get(f) = req.verb else { return };
                self.spawn_read(key, f, value, charged);
            }
            CellPlan::Answer(value) => {
                let Verb::Share(tx) = req.verb else { return };
                let _ = tx.send(value);
            }
            CellPlan::Promote => {
                self.promote(&key);
                self.forward(key, Msg::Req(req));
            }
        }
    }

    /// Run a read callback as a detached task. Charged reads hold one of
    /// the cell's budget slots and report back through `Done` on
    /// completion, panic included.
    fn spawn_read(&self, key: K, f: GetFn<V>, value: Option<V>, charged: bool) {
        if charged {
            let guard = CellDoneGuard {
                key,
                tx: self.self_tx.clone(),
            };
            self.spawner.spawn(Box::pin(async move {
                f(Ok(value));
                drop(guard);
            }));
        } else {
            self.spawner.spawn(Box::pin(async move {
                f(Ok(value));
            }));
        }
    }

    /// Replace a cell with a worker seeded from its state.
    pub(crate) fn promote(&mut self, key: &K) {
        let Some(Slot::Cell(cell)) = self.map.remove(key) else {
            return;
        };
        let tx = worker::spawn(
            key.clone(),
            cell,
            &self.cfg,
            self.self_tx.clone(),
            &self.spawner,
        );
        self.map
            .insert(key.clone(), Slot::Live(WorkerHandle { tx, sent: 0 }));
        self.counters.promotions += 1;
        debug!(key = ?key, "promoted key to worker");
    }

    /// Ensure the key is owned by a live worker, materializing and
    /// promoting as needed.
    pub(crate) fn ensure_worker(&mut self, key: &K) {
        match self.map.get(key) {
            Some(Slot::Live(_)) => {}
            Some(Slot::Cell(_)) => self.promote(key),
            None => {
                self.map
                    .insert(key.clone(), Slot::Cell(Cell::vacant(self.cfg.default_max)));
                self.promote(key);
            }
        }
    }

    /// Forward a message to a live worker, reclaiming the key if the
    /// worker turns out to be dead.
    pub(crate) fn forward(&mut self, key: K, msg: Msg<V>) {
        let Some(Slot::Live(handle)) = self.map.get_mut(&key) else {
            debug!(key = ?key, "dropping message for a key without a worker");
            return;
        };
        handle.sent += 1;
        if let Err(mpsc::error::SendError(lost)) = handle.tx.send(msg) {
            error!(key = ?key, "worker channel closed unexpectedly, reclaiming state");
            self.map
                .insert(key.clone(), Slot::Cell(Cell::vacant(self.cfg.default_max)));
            if let Msg::Req(req) = lost {
                // One redispatch through the cell path; it may promote a
                // fresh worker.
                self.serve_from_cell(key, req);
            }
        }
    }

    /// A cell-path read finished: release its slot, or relay the release
    /// to the worker that inherited the charge on promotion.
    fn read_done(&mut self, key: &K) {
        match self.map.get_mut(key) {
            Some(Slot::Cell(cell)) => {
                cell.processes = cell.processes.saturating_sub(1);
                if cell.reclaimable(self.cfg.default_max) {
                    self.map.remove(key);
                    debug!(key = ?key, "reclaimed idle cell");
                }
            }
            Some(Slot::Live(_)) => {
                self.forward(key.clone(), Msg::Info(Info::CellDone));
            }
            None => {}
        }
    }

    /// Decide an idle worker's fate. Any message forwarded beyond what the
    /// worker has seen means more work is coming; otherwise the exported
    /// state is committed back to the map before anything else is routed.
    fn judge(
        &mut self,
        key: K,
        seen: u64,
        value: Option<V>,
        max_processes: Parallelism,
        reply: oneshot::Sender<Verdict>,
    ) {
        match self.map.get(&key) {
            Some(Slot::Live(handle)) => {
                if handle.sent != seen {
                    let _ = reply.send(Verdict::Continue);
                    return;
                }
                self.counters.retirements += 1;
                let cell = Cell::new(value, max_processes);
                if cell.reclaimable(self.cfg.default_max) {
                    self.map.remove(&key);
                    debug!(key = ?key, "worker retired, key reclaimed");
                } else {
                    self.map.insert(key, Slot::Cell(cell));
                    debug!("worker retired, state demoted to cell");
                }
                let _ = reply.send(Verdict::Die);
            }
            // Stale handshake from a worker the map no longer tracks.
            _ => {
                let _ = reply.send(Verdict::Die);
            }
        }
    }

    fn set_max_processes(&mut self, key: K, limit: Parallelism) {
        match self.map.get_mut(&key) {
            Some(Slot::Live(_)) => self.forward(key, Msg::Info(Info::MaxProcesses(limit))),
            Some(Slot::Cell(cell)) => {
                cell.max_processes = limit;
                if cell.reclaimable(self.cfg.default_max) {
                    self.map.remove(&key);
                }
            }
            None => {
                // Deliberate first touch: remember the budget override.
                self.map
                    .insert(key, Slot::Cell(Cell::vacant(limit)));
            }
        }
    }

    fn stats(&self) -> StoreStats {
        let live_workers = self
            .map
            .values()
            .filter(|slot| matches!(slot, Slot::Live(_)))
            .count();
        StoreStats {
            keys: self.map.len(),
            live_workers,
            routed_requests: self.counters.routed,
            transactions: self.counters.transactions,
            promotions: self.counters.promotions,
            retirements: self.counters.retirements,
        }
    }

    /// Queue a share behind every live worker's pending work and reply
    /// once all of them have answered.
    fn sync_barrier(&mut self, reply: oneshot::Sender<()>) {
        let live: Vec<K> = self
            .map
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Live(_)))
            .map(|(key, _)| key.clone())
            .collect();
        let mut waits = Vec::with_capacity(live.len());
        for key in live {
            let (tx, rx) = oneshot::channel();
            self.forward(
                key,
                Msg::Req(Request::new(Verb::Share(tx), Priority::Normal, CallTimeout::Infinite)),
            );
            waits.push(rx);
        }
        self.spawner.spawn(Box::pin(async move {
            for rx in waits {
                let _ = rx.await;
            }
            let _ = reply.send(());
        }));
    }

    fn drain_workers(&mut self) {
        info!(keys = self.map.len(), "store stopping, draining workers");
        for (_, slot) in self.map.drain() {
            if let Slot::Live(handle) = slot {
                let _ = handle.tx.send(Msg::Info(Info::Stop));
            }
        }
    }
}

/// What the cell fast path decided to do with a request.
enum CellPlan<V> {
    Read { value: Option<V>, charged: bool },
    Answer(Option<V>),
    Promote,
}

/// Releases a cell's read slot even if the read callback panics.
struct CellDoneGuard<K: Clone, V> {
    key: K,
    tx: mpsc::UnboundedSender<ServerMsg<K, V>>,
}

impl<K: Clone, V> Drop for CellDoneGuard<K, V> {
    fn drop(&mut self) {
        let _ = self.tx.send(ServerMsg::Done {
            key: self.key.clone(),
        });
    }
}
