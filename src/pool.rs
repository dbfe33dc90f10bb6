//! Connection pool of RPC sessions.
//!
//! A [`ConnectionPool`] keeps up to `pool_size` open sessions in a queue. Callers
//! borrow one with [`ConnectionPool::fetch`], which blocks (optionally with a timeout)
//! or fails fast when the queue is empty.
//!
//! # Concurrency
//!
//! - The idle queue is a `parking_lot::Mutex<VecDeque>` that is never held across an
//!   await point
//! - A semaphore carries one permit per queued session: fetchers wait on it, drains
//!   take permits with `try_acquire` and never block
//! - A context is pushed before its permit is added and popped after its permit is
//!   taken, so a permit always has a queued context behind it
//! - `live` counts queued, checked-out and in-creation sessions and is reserved before
//!   any session is opened, which keeps it at or below `pool_size`
//! - `clear` only drains what is queued; checked-out sessions find out at their own
//!   scope exit
//! - `start` is single-flight: overlapping callers wait for the first one and then
//!   see the pool started
//!
//! # Pool directory
//!
//! Sessions refer to their pool by id and look it up in a process-wide directory when
//! their scope ends. A pool leaves the directory when its last [`ConnectionPool`]
//! handle is dropped, after which returning sessions are torn down.

use crate::client::RpcClientFactory;
use crate::config::PoolConfig;
use crate::context::{Checkout, SessionContext};
use crate::error::{PoolError, PoolResult};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::sync::{Mutex as TokioMutex, Semaphore, TryAcquireError};
use tracing::{debug, info, warn};

/// Lifecycle state of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PoolState {
    NotStarted,
    Started,
    /// Terminal. Fetches fail and returning sessions are torn down.
    Stopped,
}

impl std::fmt::Display for PoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "NOT_STARTED"),
            Self::Started => write!(f, "STARTED"),
            Self::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// Pool status snapshot (no secrets exposed).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStatus {
    pub name: String,
    pub state: PoolState,
    pub pool_size: usize,
    /// Sessions waiting in the queue.
    pub available: usize,
    /// Sessions currently inside a checkout scope.
    pub checked_out: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

/// Identifier of a pool in the process-wide directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct PoolId(u64);

impl std::fmt::Display for PoolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

static DIRECTORY: LazyLock<RwLock<HashMap<PoolId, Arc<PoolInner>>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// Find a live pool by id. `None` once every handle to it has been dropped.
pub(crate) fn lookup(id: PoolId) -> Option<Arc<PoolInner>> {
    DIRECTORY.read().get(&id).cloned()
}

/// Shared by all clones of a [`ConnectionPool`]; the last one out unregisters the pool.
struct Registration {
    id: PoolId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let removed = DIRECTORY.write().remove(&self.id);
        drop(removed);
        debug!(pool_id = %self.id, "Pool unregistered");
    }
}

struct Lifecycle {
    state: PoolState,
    started_at: Option<DateTime<Utc>>,
}

pub(crate) struct PoolInner {
    id: PoolId,
    name: String,
    config: PoolConfig,
    factory: Arc<dyn RpcClientFactory>,
    /// Lock order: `lifecycle` before `idle`.
    lifecycle: Mutex<Lifecycle>,
    idle: Mutex<VecDeque<SessionContext>>,
    available: Semaphore,
    live: AtomicUsize,
    checked_out: AtomicUsize,
    start_lock: TokioMutex<()>,
}

impl PoolInner {
    pub(crate) fn id(&self) -> PoolId {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub(crate) fn factory(&self) -> &dyn RpcClientFactory {
        self.factory.as_ref()
    }

    fn state(&self) -> PoolState {
        self.lifecycle.lock().state
    }

    pub(crate) fn is_started(&self) -> bool {
        self.state() == PoolState::Started
    }

    /// Reserve up to `wanted` session slots. Returns how many were reserved.
    fn reserve(&self, wanted: usize) -> usize {
        let size = self.config.pool_size;
        match self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < size).then(|| live + wanted.min(size - live))
            }) {
            Ok(before) => wanted.min(size - before),
            Err(_) => 0,
        }
    }

    /// Give back one session slot. Saturates at 0.
    pub(crate) fn release_slot(&self) {
        let result = self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                Some(live.saturating_sub(1))
            });
        if result == Ok(0) {
            warn!(pool = %self.name, "Session slot released with no live sessions");
        }
    }

    /// Mark one checked-out session as back from its scope.
    pub(crate) fn check_in(&self) {
        let _ = self
            .checked_out
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(1))
            });
    }

    /// Tear a session down and free its slot.
    pub(crate) async fn discard(&self, mut context: SessionContext) {
        context.teardown().await;
        self.release_slot();
    }

    /// Queue a session, or discard it when the pool no longer runs.
    pub(crate) async fn put_back(&self, context: SessionContext) {
        let rejected = {
            let lifecycle = self.lifecycle.lock();
            if lifecycle.state == PoolState::Started {
                self.idle.lock().push_back(context);
                self.available.add_permits(1);
                None
            } else {
                Some(context)
            }
        };
        if let Some(context) = rejected {
            self.discard(context).await;
        }
    }

    /// Drain and tear down every queued session. Does not wait for checked-out ones.
    pub(crate) async fn clear(&self) -> usize {
        let mut drained = Vec::new();
        while let Ok(permit) = self.available.try_acquire() {
            permit.forget();
            if let Some(context) = self.idle.lock().pop_front() {
                drained.push(context);
            }
        }

        let count = drained.len();
        for context in drained {
            self.discard(context).await;
        }
        debug!(pool = %self.name, count = count, "Cleared sessions");
        count
    }

    /// Open up to `count` new sessions (all of `pool_size` when `None` or zero),
    /// never exceeding `pool_size` live sessions. Failures are logged.
    pub(crate) async fn reload(&self, count: Option<usize>) -> usize {
        let wanted = count
            .filter(|n| *n > 0)
            .unwrap_or(self.config.pool_size);
        let reserved = self.reserve(wanted);

        let results = join_all((0..reserved).map(|_| SessionContext::open(self))).await;
        let mut reloaded = 0;
        for result in results {
            match result {
                Ok(context) => {
                    self.put_back(context).await;
                    reloaded += 1;
                }
                Err(e) => {
                    self.release_slot();
                    warn!(pool = %self.name, error = %e, "Failed to reload session");
                }
            }
        }
        debug!(pool = %self.name, count = reloaded, "Reloaded sessions");
        reloaded
    }
}

/// A bounded pool of RPC sessions sharing one broker config.
///
/// Cloning is cheap and yields a handle to the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
    _registration: Arc<Registration>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("name", &self.inner.name)
            .field("broker_uri", &self.inner.config.redacted_uri())
            .field("pool_size", &self.inner.config.pool_size)
            .field("state", &self.inner.state())
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    /// Create a pool. No session is opened until [`start`](Self::start).
    ///
    /// The config is owned by the pool, so callers cannot mutate it afterwards.
    pub fn new(
        name: impl Into<String>,
        config: PoolConfig,
        factory: Arc<dyn RpcClientFactory>,
    ) -> Self {
        let pool_size = config.pool_size;
        let id = PoolId(NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed));
        let inner = Arc::new(PoolInner {
            id,
            name: name.into(),
            config,
            factory,
            lifecycle: Mutex::new(Lifecycle {
                state: PoolState::NotStarted,
                started_at: None,
            }),
            idle: Mutex::new(VecDeque::with_capacity(pool_size)),
            available: Semaphore::new(0),
            live: AtomicUsize::new(0),
            checked_out: AtomicUsize::new(0),
            start_lock: TokioMutex::new(()),
        });
        DIRECTORY.write().insert(id, Arc::clone(&inner));
        Self {
            inner,
            _registration: Arc::new(Registration { id }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn pool_size(&self) -> usize {
        self.inner.config.pool_size
    }

    pub fn state(&self) -> PoolState {
        self.inner.state()
    }

    pub fn is_started(&self) -> bool {
        self.inner.is_started()
    }

    /// Whether both handles refer to the same pool.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Open `pool_size` sessions and start serving checkouts.
    ///
    /// The config is validated first. If any session fails to open, the ones already
    /// opened are stopped, the pool stays `NOT_STARTED` and the session error is
    /// returned unchanged. Concurrent calls open the sessions once.
    pub async fn start(&self) -> PoolResult<()> {
        let inner = &self.inner;
        inner.config.validate()?;

        let _starting = inner.start_lock.lock().await;
        match inner.state() {
            PoolState::NotStarted => {}
            PoolState::Started => {
                warn!(pool = %inner.name, "Pool already started");
                return Ok(());
            }
            PoolState::Stopped => return Err(PoolError::closed(&inner.name, PoolState::Stopped)),
        }

        let reserved = inner.reserve(inner.config.pool_size);
        let results = join_all((0..reserved).map(|_| SessionContext::open(inner))).await;

        let mut opened = Vec::with_capacity(reserved);
        let mut failure = None;
        for result in results {
            match result {
                Ok(context) => opened.push(context),
                Err(e) => {
                    inner.release_slot();
                    if failure.is_none() {
                        failure = Some(e);
                    }
                }
            }
        }

        if let Some(err) = failure {
            warn!(pool = %inner.name, error = %err, "Failed to start pool");
            for context in opened {
                inner.discard(context).await;
            }
            return Err(err);
        }

        let count = opened.len();
        let rejected = {
            let mut lifecycle = inner.lifecycle.lock();
            if lifecycle.state == PoolState::NotStarted {
                lifecycle.state = PoolState::Started;
                lifecycle.started_at = Some(Utc::now());
                inner.idle.lock().extend(opened);
                inner.available.add_permits(count);
                Vec::new()
            } else {
                opened
            }
        };
        for context in rejected {
            inner.discard(context).await;
        }

        info!(
            pool = %inner.name,
            broker_uri = ?inner.config.redacted_uri(),
            pool_size = count,
            "Pool started"
        );
        Ok(())
    }

    /// Borrow a session.
    ///
    /// With `block`, waits until a session is queued, up to `timeout` when given
    /// ([`PoolError::Timeout`]). Without it, fails at once on an empty queue
    /// ([`PoolError::Exhausted`]). The returned [`Checkout`] must be released.
    pub async fn fetch(&self, block: bool, timeout: Option<Duration>) -> PoolResult<Checkout> {
        let inner = &self.inner;
        let state = inner.state();
        if state != PoolState::Started {
            return Err(PoolError::closed(&inner.name, state));
        }

        let permit = if block {
            let acquired = match timeout {
                Some(limit) => tokio::time::timeout(limit, inner.available.acquire())
                    .await
                    .map_err(|_| PoolError::timeout(&inner.name, limit))?,
                None => inner.available.acquire().await,
            };
            acquired.map_err(|_| PoolError::closed(&inner.name, inner.state()))?
        } else {
            inner.available.try_acquire().map_err(|e| match e {
                TryAcquireError::NoPermits => PoolError::exhausted(&inner.name),
                TryAcquireError::Closed => PoolError::closed(&inner.name, inner.state()),
            })?
        };
        permit.forget();

        let queued = inner.idle.lock().pop_front();
        let context = queued.ok_or_else(|| PoolError::closed(&inner.name, inner.state()))?;
        inner.checked_out.fetch_add(1, Ordering::AcqRel);
        debug!(pool = %inner.name, session_id = %context.id(), "Session checked out");
        Ok(context.enter())
    }

    /// Tear down every queued session. Returns how many were removed.
    pub async fn clear(&self) -> usize {
        self.inner.clear().await
    }

    /// Open up to `count` new sessions (`None` or zero: `pool_size`), capped so that
    /// queued plus checked-out sessions never exceed `pool_size`.
    pub async fn reload(&self, count: Option<usize>) -> usize {
        self.inner.reload(count).await
    }

    /// Stop the pool: wake waiting fetchers, tear down queued sessions.
    ///
    /// Sessions still checked out are torn down when their scope ends.
    pub async fn stop(&self) {
        let inner = &self.inner;
        let drained: Vec<SessionContext> = {
            let mut lifecycle = inner.lifecycle.lock();
            if lifecycle.state == PoolState::Stopped {
                return;
            }
            lifecycle.state = PoolState::Stopped;
            inner.available.close();
            inner.idle.lock().drain(..).collect()
        };

        let count = drained.len();
        for context in drained {
            inner.discard(context).await;
        }
        info!(pool = %inner.name, count = count, "Pool stopped");
    }

    /// Current status of the pool.
    pub fn status(&self) -> PoolStatus {
        let inner = &self.inner;
        let (state, started_at) = {
            let lifecycle = inner.lifecycle.lock();
            (lifecycle.state, lifecycle.started_at)
        };
        PoolStatus {
            name: inner.name.clone(),
            state,
            pool_size: inner.config.pool_size,
            available: inner.idle.lock().len(),
            checked_out: inner.checked_out.load(Ordering::Acquire),
            started_at,
        }
    }
}
