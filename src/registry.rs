//! Registry of named connection pools.
//!
//! A [`Registry`] builds its pools from a [`SettingsProvider`] on first access and
//! keeps them until [`Registry::destroy_all`]. The process-wide registry is installed
//! once with [`install`] and reached through [`get_pool`] and [`destroy_all_pools`].
//!
//! # Initialization
//!
//! - Once populated, lookups only take the read side of a `parking_lot::RwLock`
//! - First-time callers serialize on an async init mutex and re-check the state after
//!   acquiring it, so only the first one opens broker connections
//! - A failed initialization stops the pools it already started and leaves the
//!   registry empty; the next call retries with the provider's current settings

use crate::client::RpcClientFactory;
use crate::config::{DEFAULT_POOL_NAME, PoolConfig, PoolPlan, SettingsProvider};
use crate::error::{PoolError, PoolResult};
use crate::pool::{ConnectionPool, PoolStatus};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex as TokioMutex;
use tracing::{info, warn};

/// Pools built from one settings snapshot.
#[derive(Debug)]
enum PoolSet {
    Single(ConnectionPool),
    Multi(BTreeMap<String, ConnectionPool>),
}

impl PoolSet {
    fn lookup(&self, name: Option<&str>) -> PoolResult<ConnectionPool> {
        match (self, name) {
            (PoolSet::Multi(pools), Some(name)) => pools.get(name).cloned().ok_or_else(|| {
                PoolError::configuration(format!(
                    "RPC_CONFIG must include this pool name \"{name}\" config"
                ))
            }),
            (PoolSet::Single(_), Some(name)) => Err(PoolError::configuration(format!(
                "RPC_CONFIG must include this pool name \"{name}\" config"
            ))),
            (PoolSet::Multi(pools), None) => pools
                .get(DEFAULT_POOL_NAME)
                .or_else(|| pools.values().next())
                .cloned()
                .ok_or_else(|| {
                    PoolError::configuration(format!(
                        "RPC_CONFIG must include at least 1 \"{DEFAULT_POOL_NAME}\" config"
                    ))
                }),
            (PoolSet::Single(pool), None) => Ok(pool.clone()),
        }
    }

    fn pools(&self) -> Vec<&ConnectionPool> {
        match self {
            PoolSet::Single(pool) => vec![pool],
            PoolSet::Multi(pools) => pools.values().collect(),
        }
    }

    async fn stop_all(&self) {
        for pool in self.pools() {
            pool.stop().await;
        }
    }
}

/// Lazily-initialized set of named pools.
pub struct Registry {
    provider: Arc<dyn SettingsProvider>,
    factory: Arc<dyn RpcClientFactory>,
    pools: RwLock<Option<Arc<PoolSet>>>,
    init_lock: TokioMutex<()>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("pools", &*self.pools.read())
            .finish_non_exhaustive()
    }
}

impl Registry {
    /// Create an empty registry. Nothing is read or opened until the first lookup.
    pub fn new(provider: Arc<dyn SettingsProvider>, factory: Arc<dyn RpcClientFactory>) -> Self {
        Self {
            provider,
            factory,
            pools: RwLock::new(None),
            init_lock: TokioMutex::new(()),
        }
    }

    /// Get a pool by name, initializing the registry on first use.
    ///
    /// With a name, the registry must hold named pools and one of them must match.
    /// Without a name, returns `default`, else the first named pool, else the single
    /// pool.
    pub async fn get(&self, name: Option<&str>) -> PoolResult<ConnectionPool> {
        let pools = match self.loaded() {
            Some(pools) => pools,
            None => self.initialize().await?,
        };
        pools.lookup(name)
    }

    /// Whether pools are currently built.
    pub fn is_initialized(&self) -> bool {
        self.pools.read().is_some()
    }

    /// Names of the built pools. Empty until initialized.
    pub fn pool_names(&self) -> Vec<String> {
        self.loaded()
            .map(|set| set.pools().iter().map(|p| p.name().to_string()).collect())
            .unwrap_or_default()
    }

    /// Status of every built pool.
    pub fn status(&self) -> Vec<PoolStatus> {
        self.loaded()
            .map(|set| set.pools().iter().map(|p| p.status()).collect())
            .unwrap_or_default()
    }

    /// Stop every pool and forget them. The next lookup re-reads the settings.
    pub async fn destroy_all(&self) {
        let _guard = self.init_lock.lock().await;
        let taken = self.pools.write().take();
        if let Some(pools) = taken {
            pools.stop_all().await;
            info!(pools = ?self.names_of(&pools), "Registry destroyed");
        }
    }

    fn loaded(&self) -> Option<Arc<PoolSet>> {
        self.pools.read().clone()
    }

    fn names_of(&self, set: &PoolSet) -> Vec<String> {
        set.pools().iter().map(|p| p.name().to_string()).collect()
    }

    async fn initialize(&self) -> PoolResult<Arc<PoolSet>> {
        let _guard = self.init_lock.lock().await;
        if let Some(pools) = self.loaded() {
            return Ok(pools);
        }

        let settings = self.provider.settings()?;
        let set = match settings.resolve()? {
            PoolPlan::Single(config) => PoolSet::Single(self.start_pool(DEFAULT_POOL_NAME, config).await?),
            PoolPlan::Multi(configs) => {
                let mut pools = BTreeMap::new();
                for (name, config) in configs {
                    match self.start_pool(&name, config).await {
                        Ok(pool) => {
                            pools.insert(name, pool);
                        }
                        Err(e) => {
                            PoolSet::Multi(pools).stop_all().await;
                            return Err(e);
                        }
                    }
                }
                PoolSet::Multi(pools)
            }
        };

        let set = Arc::new(set);
        *self.pools.write() = Some(Arc::clone(&set));
        info!(pools = ?self.names_of(&set), "Registry initialized");
        Ok(set)
    }

    async fn start_pool(&self, name: &str, config: PoolConfig) -> PoolResult<ConnectionPool> {
        let pool = ConnectionPool::new(name, config, Arc::clone(&self.factory));
        if let Err(e) = pool.start().await {
            warn!(pool = %name, error = %e, "Failed to start pool");
            return Err(e);
        }
        Ok(pool)
    }
}

static GLOBAL_REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Install the process-wide registry. Fails if one is already installed.
pub fn install(
    provider: Arc<dyn SettingsProvider>,
    factory: Arc<dyn RpcClientFactory>,
) -> PoolResult<&'static Registry> {
    let mut installed = false;
    let registry = GLOBAL_REGISTRY.get_or_init(|| {
        installed = true;
        Registry::new(provider, factory)
    });
    if !installed {
        return Err(PoolError::configuration(
            "The process-wide pool registry is already installed",
        ));
    }
    Ok(registry)
}

/// The process-wide registry.
pub fn global() -> PoolResult<&'static Registry> {
    GLOBAL_REGISTRY.get().ok_or_else(|| {
        PoolError::configuration(
            "No pool registry installed; call registry::install during startup",
        )
    })
}

/// Get a pool from the process-wide registry.
///
/// ```ignore
/// let pool = rpc_pool::registry::get_pool(None).await?;
/// let rpc = pool.fetch(true, None).await?;
/// let reply = rpc.call("mailer", "send_mail", json!({"to": "bob"})).await;
/// rpc.release().await;
/// ```
pub async fn get_pool(name: Option<&str>) -> PoolResult<ConnectionPool> {
    global()?.get(name).await
}

/// Stop and forget every pool of the process-wide registry, if any.
pub async fn destroy_all_pools() {
    if let Some(registry) = GLOBAL_REGISTRY.get() {
        registry.destroy_all().await;
    }
}
