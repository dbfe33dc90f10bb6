//! RPC client interface consumed by the pool.
//!
//! The pool never speaks the wire protocol itself. Sessions are opened through an
//! [`RpcClientFactory`] and calls are forwarded to the resulting [`RpcSession`]:
//! - `loopback`: in-process cluster used by tests and local wiring

pub mod loopback;

pub use loopback::LoopbackCluster;

use crate::config::BrokerConfig;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Request-scoped metadata sent along with every remote call.
pub type ContextData = Map<String, Value>;

/// Errors reported by the RPC session layer.
///
/// The pool classifies these at scope exit (see [`RpcError::fault`]) but never
/// rewrites them: callers see the same value the session produced.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RpcError {
    #[error("This consumer has been stopped, and can no longer be used")]
    ConsumerStopped,

    #[error("This consumer has been disconnected, and can no longer be used")]
    ConsumerDisconnected,

    #[error("Broker connection failed: {message}")]
    BrokerConnection { message: String },

    #[error("Broker refused access: {message}")]
    AccessRefused { message: String },

    #[error("Unknown service: {service}")]
    UnknownService { service: String },

    #[error("Method not found: {service}.{method}")]
    MethodNotFound { service: String, method: String },

    #[error("Remote error {exc_type}: {message}")]
    Remote { exc_type: String, message: String },

    #[error("Call {service}.{method} timed out after {elapsed_ms}ms")]
    CallTimeout {
        service: String,
        method: String,
        elapsed_ms: u64,
    },
}

/// Session-level failure that invalidates a pooled session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionFault {
    /// The reply consumer was stopped or disconnected. Every session of the
    /// pool is suspect.
    Stopped,
    /// The broker connection dropped under this session only.
    ConnectionLost,
}

impl RpcError {
    /// Create a broker connection error.
    pub fn broker_connection(message: impl Into<String>) -> Self {
        Self::BrokerConnection {
            message: message.into(),
        }
    }

    /// Create an access refused error.
    pub fn access_refused(message: impl Into<String>) -> Self {
        Self::AccessRefused {
            message: message.into(),
        }
    }

    /// Create an unknown service error.
    pub fn unknown_service(service: impl Into<String>) -> Self {
        Self::UnknownService {
            service: service.into(),
        }
    }

    /// Create a method not found error.
    pub fn method_not_found(service: impl Into<String>, method: impl Into<String>) -> Self {
        Self::MethodNotFound {
            service: service.into(),
            method: method.into(),
        }
    }

    /// Create a remote (application) error.
    pub fn remote(exc_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Remote {
            exc_type: exc_type.into(),
            message: message.into(),
        }
    }

    /// Classify this error for pool recovery.
    ///
    /// Application-level errors return `None`: the session stays usable.
    pub fn fault(&self) -> Option<SessionFault> {
        match self {
            Self::ConsumerStopped | Self::ConsumerDisconnected => Some(SessionFault::Stopped),
            Self::BrokerConnection { .. } => Some(SessionFault::ConnectionLost),
            _ => None,
        }
    }
}

/// One live RPC session: a connected reply consumer plus its context data.
#[async_trait]
pub trait RpcSession: Send + Sync {
    /// Invoke `service.method` with JSON arguments.
    async fn call(&self, service: &str, method: &str, args: Value) -> Result<Value, RpcError>;

    /// Current context data attached to outgoing calls.
    fn context_data(&self) -> ContextData;

    /// Replace the context data attached to outgoing calls.
    fn replace_context_data(&self, data: ContextData);

    /// Stop the session and release its broker resources.
    async fn stop(&self) -> Result<(), RpcError>;
}

/// Opens [`RpcSession`]s against a broker.
#[async_trait]
pub trait RpcClientFactory: Send + Sync {
    /// Connect, authenticate and declare the reply queue for a new session.
    async fn connect(
        &self,
        config: &BrokerConfig,
        context_data: Option<ContextData>,
        timeout: Option<Duration>,
    ) -> Result<Arc<dyn RpcSession>, RpcError>;
}
