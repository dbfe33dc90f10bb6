//! In-process RPC cluster.
//!
//! `LoopbackCluster` implements [`RpcClientFactory`] without a broker: services are
//! plain closures registered on the cluster, and every session opened through it
//! dispatches to them directly. Connection and call failures can be injected so that
//! pool recovery paths can be exercised deterministically.

use super::{ContextData, RpcClientFactory, RpcError, RpcSession};
use crate::config::{BROKER_URI_KEY, BrokerConfig};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// Service method implementation: receives the call arguments and the session's
/// context data.
pub type Handler = Arc<dyn Fn(Value, &ContextData) -> Result<Value, RpcError> + Send + Sync>;

/// Parameters of one `connect` call, as seen by the cluster.
#[derive(Debug, Clone)]
pub struct ConnectRecord {
    pub session_id: u64,
    pub config: BrokerConfig,
    pub context_data: Option<ContextData>,
    pub timeout: Option<Duration>,
}

#[derive(Default)]
struct ClusterInner {
    services: RwLock<HashMap<String, HashMap<String, Handler>>>,
    connect_faults: Mutex<VecDeque<RpcError>>,
    connect_error: Mutex<Option<RpcError>>,
    refused: Mutex<HashMap<String, RpcError>>,
    call_faults: Mutex<VecDeque<RpcError>>,
    connects: Mutex<Vec<ConnectRecord>>,
    live: Mutex<BTreeSet<u64>>,
    next_id: AtomicU64,
    stopped: AtomicU64,
}

/// An in-process service cluster and the factory for its sessions.
#[derive(Clone, Default)]
pub struct LoopbackCluster {
    inner: Arc<ClusterInner>,
}

impl std::fmt::Debug for LoopbackCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackCluster")
            .field("services", &self.inner.services.read().len())
            .field("live_sessions", &self.inner.live.lock().len())
            .finish_non_exhaustive()
    }
}

impl LoopbackCluster {
    /// Create an empty cluster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a cluster exposing the `echo` service.
    ///
    /// `echo.echo` returns its arguments; `echo.context` returns the caller's
    /// context data.
    pub fn with_echo() -> Self {
        let cluster = Self::new();
        cluster.register("echo", "echo", |args, _| Ok(args));
        cluster.register("echo", "context", |_, context| {
            Ok(Value::Object(context.clone()))
        });
        cluster
    }

    /// Register `service.method`.
    pub fn register<F>(&self, service: &str, method: &str, handler: F)
    where
        F: Fn(Value, &ContextData) -> Result<Value, RpcError> + Send + Sync + 'static,
    {
        self.inner
            .services
            .write()
            .entry(service.to_string())
            .or_default()
            .insert(method.to_string(), Arc::new(handler));
    }

    /// Make the next `connect` fail with `error`.
    pub fn fail_next_connect(&self, error: RpcError) {
        self.inner.connect_faults.lock().push_back(error);
    }

    /// Make every `connect` fail with `error` until cleared with `None`.
    pub fn set_connect_error(&self, error: Option<RpcError>) {
        *self.inner.connect_error.lock() = error;
    }

    /// Make every `connect` to broker `uri` fail with `error`.
    pub fn refuse(&self, uri: &str, error: RpcError) {
        self.inner.refused.lock().insert(uri.to_string(), error);
    }

    /// Undo [`refuse`](Self::refuse) for `uri`.
    pub fn accept(&self, uri: &str) {
        self.inner.refused.lock().remove(uri);
    }

    /// Make the next call on any session fail with `error`.
    pub fn fail_next_call(&self, error: RpcError) {
        self.inner.call_faults.lock().push_back(error);
    }

    /// Ids of sessions that are open and not stopped.
    pub fn live_sessions(&self) -> BTreeSet<u64> {
        self.inner.live.lock().clone()
    }

    /// Number of sessions ever opened.
    pub fn opened_count(&self) -> u64 {
        self.inner.next_id.load(Ordering::Acquire)
    }

    /// Number of sessions stopped so far.
    pub fn stopped_count(&self) -> u64 {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Every successful `connect` so far, oldest first.
    pub fn connects(&self) -> Vec<ConnectRecord> {
        self.inner.connects.lock().clone()
    }

    fn next_connect_error(&self, config: &BrokerConfig) -> Option<RpcError> {
        let refused = config
            .get(BROKER_URI_KEY)
            .and_then(Value::as_str)
            .and_then(|uri| self.inner.refused.lock().get(uri).cloned());
        if refused.is_some() {
            return refused;
        }
        let queued = self.inner.connect_faults.lock().pop_front();
        queued.or_else(|| self.inner.connect_error.lock().clone())
    }
}

#[async_trait]
impl RpcClientFactory for LoopbackCluster {
    async fn connect(
        &self,
        config: &BrokerConfig,
        context_data: Option<ContextData>,
        timeout: Option<Duration>,
    ) -> Result<Arc<dyn RpcSession>, RpcError> {
        if let Some(err) = self.next_connect_error(config) {
            return Err(err);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::AcqRel) + 1;
        self.inner.live.lock().insert(id);
        self.inner.connects.lock().push(ConnectRecord {
            session_id: id,
            config: config.clone(),
            context_data: context_data.clone(),
            timeout,
        });
        debug!(session = id, "Loopback session opened");

        Ok(Arc::new(LoopbackSession {
            id,
            cluster: Arc::clone(&self.inner),
            context: Mutex::new(context_data.unwrap_or_default()),
            stopped: AtomicBool::new(false),
        }))
    }
}

struct LoopbackSession {
    id: u64,
    cluster: Arc<ClusterInner>,
    context: Mutex<ContextData>,
    stopped: AtomicBool,
}

#[async_trait]
impl RpcSession for LoopbackSession {
    async fn call(&self, service: &str, method: &str, args: Value) -> Result<Value, RpcError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(RpcError::ConsumerStopped);
        }
        if let Some(err) = self.cluster.call_faults.lock().pop_front() {
            return Err(err);
        }

        let handler = {
            let services = self.cluster.services.read();
            let methods = services
                .get(service)
                .ok_or_else(|| RpcError::unknown_service(service))?;
            Arc::clone(
                methods
                    .get(method)
                    .ok_or_else(|| RpcError::method_not_found(service, method))?,
            )
        };

        let context = self.context.lock().clone();
        handler(args, &context)
    }

    fn context_data(&self) -> ContextData {
        self.context.lock().clone()
    }

    fn replace_context_data(&self, data: ContextData) {
        *self.context.lock() = data;
    }

    async fn stop(&self) -> Result<(), RpcError> {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            self.cluster.live.lock().remove(&self.id);
            self.cluster.stopped.fetch_add(1, Ordering::AcqRel);
            debug!(session = self.id, "Loopback session stopped");
        }
        Ok(())
    }
}
