//! Pooled session contexts and checkout scopes.
//!
//! A [`SessionContext`] is an idle, pooled session: it exposes no call surface. The
//! pool turns it into a [`Checkout`] when handing it out, and calls are only possible
//! through that checkout or the [`RpcProxy`] handles it gives away. Leaving the scope
//! (`Checkout::release` or drop) disables every proxy of that scope, then either
//! returns the context to its pool or tears it down and triggers recovery.

use crate::client::{ContextData, RpcError, RpcSession, SessionFault};
use crate::error::{PoolError, PoolResult};
use crate::pool::{PoolId, PoolInner, lookup};
use parking_lot::Mutex;
use serde_json::Value;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// An idle pooled session.
pub struct SessionContext {
    id: Uuid,
    /// Looked up when the scope ends; the pool may be stopped or gone by then.
    pool_id: PoolId,
    session: Option<Arc<dyn RpcSession>>,
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("id", &self.id)
            .field("pool_id", &self.pool_id)
            .field("open", &self.session.is_some())
            .finish_non_exhaustive()
    }
}

impl SessionContext {
    /// Open a session for `pool` with a private copy of its context data.
    ///
    /// Connection and authentication failures are returned unchanged.
    pub(crate) async fn open(pool: &PoolInner) -> PoolResult<Self> {
        let config = pool.config();
        let session = pool
            .factory()
            .connect(&config.broker, config.context_data.clone(), config.timeout)
            .await?;
        let context = Self {
            id: Uuid::new_v4(),
            pool_id: pool.id(),
            session: Some(session),
        };
        debug!(pool = %pool.name(), session_id = %context.id, "Session opened");
        Ok(context)
    }

    /// Unique id of this session, stable for its whole life.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Stop the underlying session. Safe to call more than once.
    pub(crate) async fn teardown(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        match session.stop().await {
            Ok(()) => debug!(session_id = %self.id, "Session stopped"),
            Err(e) => warn!(session_id = %self.id, error = %e, "Failed to stop session"),
        }
    }

    /// Enter a checkout scope.
    pub(crate) fn enter(self) -> Checkout {
        let proxy = RpcProxy {
            session_id: self.id,
            session: self.session.clone(),
            scope: Arc::new(ScopeState {
                enabled: AtomicBool::new(true),
                fault: Mutex::new(None),
            }),
        };
        Checkout {
            context: Some(self),
            proxy,
        }
    }

    /// Reset the session's context data to `snapshot`.
    fn reconcile(&self, snapshot: Option<&ContextData>) {
        let Some(session) = &self.session else {
            return;
        };
        let mut data = session.context_data();
        if reconcile_context_data(&mut data, snapshot) {
            session.replace_context_data(data);
        }
    }
}

impl Drop for SessionContext {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let id = self.id;
        handle.spawn(async move {
            if let Err(e) = session.stop().await {
                warn!(session_id = %id, error = %e, "Failed to stop dropped session");
            }
        });
    }
}

/// Bring `current` back to `snapshot`. Returns whether anything changed.
///
/// Without a snapshot every key is removed. Otherwise keys unknown to the snapshot are
/// removed, and every snapshot key is reset to its snapshot value.
pub fn reconcile_context_data(current: &mut ContextData, snapshot: Option<&ContextData>) -> bool {
    let Some(snapshot) = snapshot else {
        let changed = !current.is_empty();
        current.clear();
        return changed;
    };
    if current == snapshot {
        return false;
    }
    current.retain(|key, _| snapshot.contains_key(key));
    for (key, value) in snapshot {
        if current.get(key) != Some(value) {
            current.insert(key.clone(), value.clone());
        }
    }
    true
}

struct ScopeState {
    enabled: AtomicBool,
    /// Fault reported by the most recent failing call, cleared by a later success.
    fault: Mutex<Option<SessionFault>>,
}

impl ScopeState {
    fn record(&self, outcome: Result<(), &RpcError>) {
        *self.fault.lock() = outcome.err().and_then(RpcError::fault);
    }
}

/// Call handle for one checkout scope.
///
/// Proxies can be cloned and kept, but they cannot stop or return the session, and
/// every operation fails with [`PoolError::StaleHandle`] once the scope has ended.
#[derive(Clone)]
pub struct RpcProxy {
    session_id: Uuid,
    session: Option<Arc<dyn RpcSession>>,
    scope: Arc<ScopeState>,
}

impl std::fmt::Debug for RpcProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcProxy")
            .field("session_id", &self.session_id)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

impl RpcProxy {
    /// Whether the scope this proxy belongs to is still open.
    pub fn is_active(&self) -> bool {
        self.scope.enabled.load(Ordering::Acquire)
    }

    /// Id of the pooled session behind this proxy.
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    fn session(&self, operation: impl FnOnce() -> String) -> PoolResult<&Arc<dyn RpcSession>> {
        match &self.session {
            Some(session) if self.is_active() => Ok(session),
            _ => Err(PoolError::stale_handle(operation())),
        }
    }

    /// Call `service.method` on the pooled session.
    ///
    /// Session errors are returned unchanged inside [`PoolError::Remote`].
    pub async fn call(&self, service: &str, method: &str, args: Value) -> PoolResult<Value> {
        let session = self.session(|| format!("{service}.{method}"))?;
        let result = session.call(service, method, args).await;
        self.scope.record(result.as_ref().map(|_| ()));
        Ok(result?)
    }

    /// Copy of the context data sent with calls.
    pub fn context_data(&self) -> PoolResult<ContextData> {
        Ok(self.session(|| "context_data".to_string())?.context_data())
    }

    /// Set one context data key for the rest of this scope.
    pub fn set_context(&self, key: impl Into<String>, value: Value) -> PoolResult<()> {
        let session = self.session(|| "set_context".to_string())?;
        let mut data = session.context_data();
        data.insert(key.into(), value);
        session.replace_context_data(data);
        Ok(())
    }

    /// Remove one context data key for the rest of this scope.
    pub fn remove_context(&self, key: &str) -> PoolResult<Option<Value>> {
        let session = self.session(|| "remove_context".to_string())?;
        let mut data = session.context_data();
        let removed = data.remove(key);
        session.replace_context_data(data);
        Ok(removed)
    }
}

/// A checked-out session. Dereferences to its [`RpcProxy`].
///
/// Prefer [`Checkout::release`]; dropping an unreleased checkout finishes the scope on
/// a background task.
pub struct Checkout {
    context: Option<SessionContext>,
    proxy: RpcProxy,
}

impl std::fmt::Debug for Checkout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Checkout")
            .field("session_id", &self.proxy.session_id)
            .field("released", &self.context.is_none())
            .finish()
    }
}

impl Deref for Checkout {
    type Target = RpcProxy;

    fn deref(&self) -> &RpcProxy {
        &self.proxy
    }
}

impl Checkout {
    /// A proxy that stays valid until this checkout ends.
    pub fn proxy(&self) -> RpcProxy {
        self.proxy.clone()
    }

    /// Report an error observed outside of the proxy, e.g. from a spawned task.
    /// Session-level faults decide how the scope ends.
    pub fn report(&self, error: &RpcError) {
        if let Some(fault) = error.fault() {
            *self.proxy.scope.fault.lock() = Some(fault);
        }
    }

    /// Leave the checkout scope.
    pub async fn release(mut self) {
        if let Some(context) = self.context.take() {
            let fault = self.close_scope();
            finish(context, fault).await;
        }
    }

    fn close_scope(&self) -> Option<SessionFault> {
        self.proxy.scope.enabled.store(false, Ordering::Release);
        self.proxy.scope.fault.lock().take()
    }
}

impl Drop for Checkout {
    fn drop(&mut self) {
        let Some(context) = self.context.take() else {
            return;
        };
        let fault = self.close_scope();
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            discard_blocking(context);
            return;
        };
        let session_id = context.id;
        handle.spawn(async move {
            finish(context, fault).await;
            warn!(
                session_id = %session_id,
                "Checkout released via Drop - consider using explicit release()"
            );
        });
    }
}

/// Checkout dropped outside of any runtime: stop the session on a throwaway runtime
/// and give its slot back. The pool is short one session until its next reload.
fn discard_blocking(mut context: SessionContext) {
    warn!(
        session_id = %context.id,
        "Checkout dropped outside of a tokio runtime - discarding session"
    );
    let pool = lookup(context.pool_id);
    if let Some(pool) = &pool {
        pool.check_in();
    }
    match tokio::runtime::Builder::new_current_thread().build() {
        Ok(runtime) => runtime.block_on(context.teardown()),
        Err(e) => warn!(session_id = %context.id, error = %e, "Cannot stop session"),
    }
    if let Some(pool) = &pool {
        pool.release_slot();
    }
}

/// End of a checkout scope: route the context according to `fault`.
async fn finish(mut context: SessionContext, fault: Option<SessionFault>) {
    let Some(pool) = lookup(context.pool_id) else {
        debug!(session_id = %context.id, "Pool is gone, discarding session");
        context.teardown().await;
        return;
    };
    pool.check_in();

    if !pool.is_started() {
        debug!(pool = %pool.name(), session_id = %context.id, "Pool stopped, discarding session");
        pool.discard(context).await;
        return;
    }

    match fault {
        Some(SessionFault::Stopped) => {
            warn!(
                pool = %pool.name(),
                session_id = %context.id,
                "Session consumer stopped, rebuilding every session"
            );
            pool.clear().await;
            pool.discard(context).await;
            pool.reload(None).await;
        }
        Some(SessionFault::ConnectionLost) => {
            warn!(
                pool = %pool.name(),
                session_id = %context.id,
                "Broker connection lost, replacing session"
            );
            pool.discard(context).await;
            pool.reload(Some(1)).await;
        }
        None => {
            context.reconcile(pool.config().context_data.as_ref());
            pool.put_back(context).await;
        }
    }
}
