//! The public store handle.
//!
//! `Store<K, V>` is a cheap, cloneable handle to a running engine. Every
//! operation closes the caller's typed callback and reply channel into a
//! type-erased request, so the engine stays monomorphic per `(K, V)` while
//! each call site keeps its own result type.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};

use crate::builders::StoreBuilder;
use crate::config::StoreConfig;
use crate::core::cell::Parallelism;
use crate::core::error::StoreError;
use crate::core::multi::{MultiFn, MultiRequest, MultiStep, MultiVerdict};
use crate::core::request::{CallTimeout, Mutation, Priority, Request, Verb};
use crate::core::server::{ServerMsg, StoreStats};

/// Per-call options for single-key operations.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallOptions {
    /// Queue placement.
    pub priority: Priority,
    /// Deadline policy; `None` uses the store's default hard timeout.
    pub timeout: Option<CallTimeout>,
}

impl CallOptions {
    /// Options with the defaults: normal priority, store-default timeout.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the queue placement.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the deadline policy.
    #[must_use]
    pub fn with_timeout(mut self, timeout: CallTimeout) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Shorthand for the urgent band (the `!` of the caller-side options).
    #[must_use]
    pub fn urgent() -> Self {
        Self::new().with_priority(Priority::Urgent)
    }

    /// Shorthand for inline execution against the currently visible value.
    #[must_use]
    pub fn now() -> Self {
        Self::new().with_priority(Priority::Now)
    }
}

/// Per-call options for multi-key transactions.
#[derive(Debug, Clone)]
pub struct MultiOptions<V> {
    /// Queue placement for the read-only snapshot legs. Legs on keys that
    /// are both read and updated always queue ahead of normal load.
    pub priority: Priority,
    /// Deadline policy for staging and snapshot collection.
    pub timeout: Option<CallTimeout>,
    /// Placeholder substituted for absent keys in the callback argument
    /// vector.
    pub initial: Option<V>,
}

impl<V> Default for MultiOptions<V> {
    fn default() -> Self {
        Self {
            priority: Priority::Normal,
            timeout: None,
            initial: None,
        }
    }
}

impl<V> MultiOptions<V> {
    /// Options with the defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the queue placement.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the deadline policy.
    #[must_use]
    pub fn with_timeout(mut self, timeout: CallTimeout) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the absent-key placeholder.
    #[must_use]
    pub fn with_initial(mut self, initial: V) -> Self {
        self.initial = Some(initial);
        self
    }
}

/// Handle to a running keyed state store.
///
/// Clones share the same engine. Dropping handles detaches the engine
/// rather than stopping it; call [`Store::stop`] for a graceful drain.
pub struct Store<K, V> {
    tx: mpsc::UnboundedSender<ServerMsg<K, V>>,
    default_timeout: CallTimeout,
    name: Option<String>,
}

impl<K, V> Clone for Store<K, V> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            default_timeout: self.default_timeout,
            name: self.name.clone(),
        }
    }
}

impl<K, V> fmt::Debug for Store<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<K, V> Store<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Start a store from configuration. See [`StoreBuilder`] for seeding
    /// initial entries.
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration.
    pub fn spawn(config: StoreConfig) -> Result<Self, StoreError> {
        StoreBuilder::new().with_config(config).build()
    }

    pub(crate) fn from_parts(
        tx: mpsc::UnboundedSender<ServerMsg<K, V>>,
        default_timeout: CallTimeout,
        name: Option<String>,
    ) -> Self {
        Self {
            tx,
            default_timeout,
            name,
        }
    }

    fn send(&self, msg: ServerMsg<K, V>) -> Result<(), StoreError> {
        self.tx.send(msg).map_err(|_| StoreError::Shutdown)
    }

    async fn await_reply<R>(
        &self,
        rx: oneshot::Receiver<Result<R, StoreError>>,
        timeout: CallTimeout,
    ) -> Result<R, StoreError> {
        match timeout.reply_budget() {
            // Only `Break` requests can go silent (an overrunning callback
            // is abandoned without a reply); bound the wait locally.
            Some(budget) => match tokio::time::timeout(budget, rx).await {
                Ok(Ok(reply)) => reply,
                Ok(Err(_)) => Err(StoreError::WorkerCrashed),
                Err(_) => Err(StoreError::TooLong),
            },
            None => rx.await.unwrap_or(Err(StoreError::WorkerCrashed)),
        }
    }

    /// Apply a read-only callback to the key's value. Reads run in
    /// parallel up to the key's budget and observe the value as of
    /// dispatch time.
    ///
    /// # Errors
    ///
    /// [`StoreError::Expired`], [`StoreError::WorkerCrashed`], or
    /// [`StoreError::Shutdown`].
    pub async fn get<R, F>(&self, key: K, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(Option<V>) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.get_with(key, CallOptions::default(), f).await
    }

    /// [`Store::get`] with explicit options.
    ///
    /// # Errors
    ///
    /// As [`Store::get`], plus [`StoreError::TooLong`] under a `Break`
    /// deadline.
    pub async fn get_with<R, F>(&self, key: K, opts: CallOptions, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(Option<V>) -> R + Send + 'static,
        R: Send + 'static,
    {
        let timeout = opts.timeout.unwrap_or(self.default_timeout);
        let (tx, rx) = oneshot::channel();
        let verb = Verb::Get(Box::new(move |input| {
            let _ = tx.send(input.map(f));
        }));
        self.send(ServerMsg::Request {
            key,
            req: Request::new(verb, opts.priority, timeout),
        })?;
        self.await_reply(rx, timeout).await
    }

    /// Apply a read-modify-write callback: the callback sees the current
    /// value, replies with `R`, and decides the key's fate. Serialized per
    /// key with every other update.
    ///
    /// # Errors
    ///
    /// As [`Store::get_with`].
    pub async fn get_and_update<R, F>(&self, key: K, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(Option<V>) -> (R, Mutation<V>) + Send + 'static,
        R: Send + 'static,
    {
        self.get_and_update_with(key, CallOptions::default(), f).await
    }

    /// [`Store::get_and_update`] with explicit options.
    ///
    /// # Errors
    ///
    /// As [`Store::get_with`].
    pub async fn get_and_update_with<R, F>(
        &self,
        key: K,
        opts: CallOptions,
        f: F,
    ) -> Result<R, StoreError>
    where
        F: FnOnce(Option<V>) -> (R, Mutation<V>) + Send + 'static,
        R: Send + 'static,
    {
        let timeout = opts.timeout.unwrap_or(self.default_timeout);
        let (tx, rx) = oneshot::channel();
        let verb = Verb::Update(Box::new(move |input| match input {
            Ok(value) => {
                let (reply, mutation) = f(value);
                let _ = tx.send(Ok(reply));
                mutation
            }
            Err(err) => {
                let _ = tx.send(Err(err));
                Mutation::Keep
            }
        }));
        self.send(ServerMsg::Request {
            key,
            req: Request::new(verb, opts.priority, timeout),
        })?;
        self.await_reply(rx, timeout).await
    }

    /// Update a key without a meaningful reply.
    ///
    /// # Errors
    ///
    /// As [`Store::get_with`].
    pub async fn update<F>(&self, key: K, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(Option<V>) -> Mutation<V> + Send + 'static,
    {
        self.update_with(key, CallOptions::default(), f).await
    }

    /// [`Store::update`] with explicit options.
    ///
    /// # Errors
    ///
    /// As [`Store::get_with`].
    pub async fn update_with<F>(&self, key: K, opts: CallOptions, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(Option<V>) -> Mutation<V> + Send + 'static,
    {
        self.get_and_update_with(key, opts, move |value| ((), f(value)))
            .await
    }

    /// Fire-and-forget update: enqueues and returns immediately, no reply
    /// channel at all.
    ///
    /// # Errors
    ///
    /// Only [`StoreError::Shutdown`], from the enqueue itself.
    pub fn cast<F>(&self, key: K, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(Option<V>) -> Mutation<V> + Send + 'static,
    {
        self.cast_with(key, CallOptions::default(), f)
    }

    /// [`Store::cast`] with explicit options.
    ///
    /// # Errors
    ///
    /// Only [`StoreError::Shutdown`], from the enqueue itself.
    pub fn cast_with<F>(&self, key: K, opts: CallOptions, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(Option<V>) -> Mutation<V> + Send + 'static,
    {
        let timeout = opts.timeout.unwrap_or(self.default_timeout);
        let verb = Verb::Update(Box::new(move |input| match input {
            Ok(value) => f(value),
            Err(_) => Mutation::Keep,
        }));
        self.send(ServerMsg::Request {
            key,
            req: Request::new(verb, opts.priority, timeout),
        })
    }

    /// Set the key to `value`.
    ///
    /// # Errors
    ///
    /// As [`Store::get_with`].
    pub async fn put(&self, key: K, value: V) -> Result<(), StoreError> {
        self.update(key, move |_| Mutation::Put(value)).await
    }

    /// Remove the key's value.
    ///
    /// # Errors
    ///
    /// As [`Store::get_with`].
    pub async fn delete(&self, key: K) -> Result<(), StoreError> {
        self.update(key, |_| Mutation::Drop).await
    }

    /// Remove the key's value and return what was there.
    ///
    /// # Errors
    ///
    /// As [`Store::get_with`].
    pub async fn pop(&self, key: K) -> Result<Option<V>, StoreError> {
        self.get_and_update(key, |value| (value, Mutation::Drop)).await
    }

    /// Current value of the key, if any.
    ///
    /// # Errors
    ///
    /// As [`Store::get`].
    pub async fn fetch(&self, key: K) -> Result<Option<V>, StoreError> {
        self.get(key, |value| value).await
    }

    /// Whether the key currently holds a value.
    ///
    /// # Errors
    ///
    /// As [`Store::get`].
    pub async fn has_key(&self, key: K) -> Result<bool, StoreError> {
        self.get(key, |value| value.is_some()).await
    }

    /// Run a transaction over `get` (read) and `upd` (write) key sets: the
    /// callback sees a consistent snapshot of the read set and its
    /// decision is published atomically per key. Keys in both sets are
    /// held between snapshot and publish; duplicate keys are collapsed.
    ///
    /// # Errors
    ///
    /// As [`Store::get_with`], plus [`StoreError::CallbackShape`] when an
    /// element-wise decision does not match the update set's length.
    pub async fn multi_update<R, F>(
        &self,
        get: Vec<K>,
        upd: Vec<K>,
        f: F,
    ) -> Result<R, StoreError>
    where
        F: FnOnce(Vec<Option<V>>) -> MultiStep<K, V, R> + Send + 'static,
        R: Send + 'static,
    {
        self.multi_update_with(get, upd, MultiOptions::default(), f)
            .await
    }

    /// [`Store::multi_update`] with explicit options.
    ///
    /// # Errors
    ///
    /// As [`Store::multi_update`].
    pub async fn multi_update_with<R, F>(
        &self,
        get: Vec<K>,
        upd: Vec<K>,
        opts: MultiOptions<V>,
        f: F,
    ) -> Result<R, StoreError>
    where
        F: FnOnce(Vec<Option<V>>) -> MultiStep<K, V, R> + Send + 'static,
        R: Send + 'static,
    {
        let get = dedup(get);
        let upd = dedup(upd);
        let expected = upd.len();
        let upd_order = upd.clone();
        let initial = opts.initial;
        let timeout = opts.timeout.unwrap_or(self.default_timeout);
        let (tx, rx) = oneshot::channel();
        let callback: MultiFn<V> = Box::new(move |input| match input {
            Err(err) => MultiVerdict {
                plan: keep_plan(expected),
                reply: Box::new(move || {
                    let _ = tx.send(Err(err));
                }),
            },
            Ok(mut values) => {
                if let Some(seed) = initial {
                    for slot in &mut values {
                        if slot.is_none() {
                            *slot = Some(seed.clone());
                        }
                    }
                }
                interpret(f(values), tx, expected, &upd_order)
            }
        });
        self.send(ServerMsg::Multi(MultiRequest {
            get,
            upd,
            callback,
            priority: opts.priority,
            timeout,
            inserted_at: Instant::now(),
        }))?;
        self.await_reply(rx, timeout).await
    }

    /// Read-only transaction: a consistent-enough snapshot of `keys` fed
    /// to the callback in key order.
    ///
    /// # Errors
    ///
    /// As [`Store::multi_update`].
    pub async fn multi_get<R, F>(&self, keys: Vec<K>, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(Vec<Option<V>>) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.multi_get_with(keys, MultiOptions::default(), f).await
    }

    /// [`Store::multi_get`] with explicit options.
    ///
    /// # Errors
    ///
    /// As [`Store::multi_update`].
    pub async fn multi_get_with<R, F>(
        &self,
        keys: Vec<K>,
        opts: MultiOptions<V>,
        f: F,
    ) -> Result<R, StoreError>
    where
        F: FnOnce(Vec<Option<V>>) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.multi_update_with(keys, Vec::new(), opts, move |values| {
            MultiStep::Reply(f(values))
        })
        .await
    }

    /// Snapshot the listed keys into a map; absent keys are omitted.
    ///
    /// # Errors
    ///
    /// As [`Store::multi_update`].
    pub async fn take(&self, keys: Vec<K>) -> Result<HashMap<K, V>, StoreError> {
        let keys = dedup(keys);
        let order = keys.clone();
        self.multi_get(keys, move |values| {
            order
                .into_iter()
                .zip(values)
                .filter_map(|(key, value)| value.map(|v| (key, v)))
                .collect()
        })
        .await
    }

    /// Keys currently tracked by the engine (with a value, a live worker,
    /// or a remembered budget override).
    ///
    /// # Errors
    ///
    /// [`StoreError::Shutdown`].
    pub async fn keys(&self) -> Result<Vec<K>, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.send(ServerMsg::Keys { reply: tx })?;
        rx.await.map_err(|_| StoreError::Shutdown)
    }

    /// Number of tracked keys.
    ///
    /// # Errors
    ///
    /// [`StoreError::Shutdown`].
    pub async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.keys().await?.len())
    }

    /// Whether the engine currently tracks no keys at all.
    ///
    /// # Errors
    ///
    /// [`StoreError::Shutdown`].
    pub async fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.keys().await?.is_empty())
    }

    /// Engine counters snapshot.
    ///
    /// # Errors
    ///
    /// [`StoreError::Shutdown`].
    pub async fn stats(&self) -> Result<StoreStats, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.send(ServerMsg::Stats { reply: tx })?;
        rx.await.map_err(|_| StoreError::Shutdown)
    }

    /// Barrier: resolves once every request queued on every live worker at
    /// call time has been dispatched.
    ///
    /// # Errors
    ///
    /// [`StoreError::Shutdown`].
    pub async fn sync(&self) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.send(ServerMsg::Sync { reply: tx })?;
        rx.await.map_err(|_| StoreError::Shutdown)
    }

    /// Change a key's read-parallelism budget. Advisory: reads already in
    /// flight finish; new reads respect the new budget immediately.
    ///
    /// # Errors
    ///
    /// [`StoreError::Shutdown`].
    pub fn set_max_processes(&self, key: K, limit: Parallelism) -> Result<(), StoreError> {
        self.send(ServerMsg::MaxProcesses { key, limit })
    }

    /// Pin (or unpin) a key's worker against idle death, keeping the key
    /// hot across quiet periods.
    ///
    /// # Errors
    ///
    /// [`StoreError::Shutdown`].
    pub fn keep_alive(&self, key: K, pinned: bool) -> Result<(), StoreError> {
        self.send(ServerMsg::KeepAlive { key, pinned })
    }

    /// Stop the store: workers finish their queued requests and exit, and
    /// every later call on any handle fails with [`StoreError::Shutdown`].
    ///
    /// # Errors
    ///
    /// [`StoreError::Shutdown`] when already stopped.
    pub async fn stop(self) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.send(ServerMsg::Stop { reply: tx })?;
        rx.await.map_err(|_| StoreError::Shutdown)
    }

    /// Blocking [`Store::get`] for callers outside an async context.
    ///
    /// # Errors
    ///
    /// As [`Store::get`].
    ///
    /// # Panics
    ///
    /// Panics when called from within a tokio runtime; use [`Store::get`]
    /// there instead.
    pub fn get_blocking<R, F>(&self, key: K, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(Option<V>) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let verb = Verb::Get(Box::new(move |input| {
            let _ = tx.send(input.map(f));
        }));
        self.send(ServerMsg::Request {
            key,
            req: Request::new(verb, Priority::Normal, self.default_timeout),
        })?;
        rx.blocking_recv().unwrap_or(Err(StoreError::WorkerCrashed))
    }

    /// Blocking [`Store::fetch`].
    ///
    /// # Errors
    ///
    /// As [`Store::get`].
    ///
    /// # Panics
    ///
    /// As [`Store::get_blocking`].
    pub fn fetch_blocking(&self, key: K) -> Result<Option<V>, StoreError> {
        self.get_blocking(key, |value| value)
    }

    /// Blocking [`Store::put`].
    ///
    /// # Errors
    ///
    /// As [`Store::get`].
    ///
    /// # Panics
    ///
    /// As [`Store::get_blocking`].
    pub fn put_blocking(&self, key: K, value: V) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        let verb = Verb::Update(Box::new(move |input| match input {
            Ok(_) => {
                let _ = tx.send(Ok(()));
                Mutation::Put(value)
            }
            Err(err) => {
                let _ = tx.send(Err(err));
                Mutation::Keep
            }
        }));
        self.send(ServerMsg::Request {
            key,
            req: Request::new(verb, Priority::Normal, self.default_timeout),
        })?;
        rx.blocking_recv().unwrap_or(Err(StoreError::WorkerCrashed))
    }
}

/// Collapse duplicate keys, keeping first-appearance order.
fn dedup<K: Eq + Hash + Clone>(keys: Vec<K>) -> Vec<K> {
    let mut seen = HashSet::with_capacity(keys.len());
    keys.into_iter().filter(|key| seen.insert(key.clone())).collect()
}

/// Turn a callback decision into the per-key plan the engine publishes
/// plus the deferred reply it fires afterwards. Arity mismatches fail the
/// call and keep every key.
fn interpret<K, V, R>(
    step: MultiStep<K, V, R>,
    tx: oneshot::Sender<Result<R, StoreError>>,
    expected: usize,
    upd_order: &[K],
) -> MultiVerdict<V>
where
    K: Eq + Hash,
    V: Send + 'static,
    R: Send + 'static,
{
    let (plan, outcome) = match step {
        MultiStep::Reply(reply) => (keep_plan(expected), Ok(reply)),
        MultiStep::ReplyAndDrop(reply) => {
            ((0..expected).map(|_| Mutation::Drop).collect(), Ok(reply))
        }
        MultiStep::ReplyAndSet(reply, values) => {
            if values.len() == expected {
                (values.into_iter().map(Mutation::Put).collect(), Ok(reply))
            } else {
                let shape = StoreError::CallbackShape {
                    expected,
                    got: values.len(),
                };
                (keep_plan(expected), Err(shape))
            }
        }
        MultiStep::ReplyAndPatch(reply, mut patch) => {
            let plan = upd_order
                .iter()
                .map(|key| patch.remove(key).map_or(Mutation::Drop, Mutation::Put))
                .collect();
            (plan, Ok(reply))
        }
        MultiStep::ReplyAndApply(reply, plan) => {
            if plan.len() == expected {
                (plan, Ok(reply))
            } else {
                let shape = StoreError::CallbackShape {
                    expected,
                    got: plan.len(),
                };
                (keep_plan(expected), Err(shape))
            }
        }
    };
    MultiVerdict {
        plan,
        reply: Box::new(move || {
            let _ = tx.send(outcome);
        }),
    }
}

fn keep_plan<V>(n: usize) -> Vec<Mutation<V>> {
    (0..n).map(|_| Mutation::Keep).collect()
}
