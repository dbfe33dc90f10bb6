//! RPC Pool Library
//!
//! Pools of reusable RPC client sessions, grouped in a lazily-initialized registry
//! of named pools. Sessions are borrowed through checkout scopes that restore the
//! session's context data on exit and replace sessions whose consumer or broker
//! connection died.

pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod pool;
pub mod registry;

pub use client::{ContextData, LoopbackCluster, RpcClientFactory, RpcError, RpcSession};
pub use config::{Config, PoolConfig, Settings, SettingsProvider};
pub use context::{Checkout, RpcProxy, SessionContext};
pub use error::{PoolError, PoolResult};
pub use pool::{ConnectionPool, PoolState, PoolStatus};
pub use registry::{Registry, destroy_all_pools, get_pool};
