//! Cluster agent: lifecycle and facade
//!
//! One agent per process wires the store client, the registry watcher,
//! the config store, and the lock registry together. The RPC/transport
//! layer consumes this facade: routing lookups, named locks, and config
//! operations.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{info, warn};

use boxbus_common::{Result, validate_name};

use crate::config::ConfigStore;
use crate::lock::{ClusterMutex, LockRegistry};
use crate::registry::{BoxInfo, BoxRegistration, RegistryWatcher};
use crate::store::{HttpStore, StoreBackend, StoreClient};
use crate::ticket::ClusterTicket;
use crate::watch::Watcher;

pub struct ClusterAgent {
    client: Arc<StoreClient>,
    registry: Arc<RegistryWatcher>,
    config: Arc<ConfigStore>,
    locks: Arc<LockRegistry>,
    registration: Mutex<Option<Arc<BoxRegistration>>>,
    watch_flags: Mutex<Vec<Arc<AtomicBool>>>,
    started: AtomicBool,
}

impl ClusterAgent {
    pub fn new(ticket: &ClusterTicket) -> anyhow::Result<Self> {
        ticket.validate()?;
        let backend = HttpStore::new(ticket.store_config())?;
        Ok(Self::with_backend(Arc::new(backend), &ticket.prefix))
    }

    /// Build an agent over any backend; tests and embedded deployments
    /// pass the in-memory store here.
    pub fn with_backend(backend: Arc<dyn StoreBackend>, prefix: &str) -> Self {
        let client = Arc::new(StoreClient::new(backend, prefix));
        Self {
            registry: Arc::new(RegistryWatcher::new(client.clone())),
            config: Arc::new(ConfigStore::new(client.clone())),
            locks: Arc::new(LockRegistry::new()),
            registration: Mutex::new(None),
            watch_flags: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            client,
        }
    }

    /// Build both snapshots, then start the watch loops.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("cluster agent already started");
            return Ok(());
        }

        self.registry.rebuild().await?;
        self.config.refresh().await?;

        let mut flags = self.watch_flags.lock();
        let (_, boxes_flag) =
            Watcher::spawn(self.client.clone(), "boxes", self.registry.clone());
        flags.push(boxes_flag);
        let (_, configs_flag) =
            Watcher::spawn(self.client.clone(), "configs", self.config.clone());
        flags.push(configs_flag);

        info!(prefix = %self.client.prefix(), "cluster agent started");
        Ok(())
    }

    /// Stop the watch loops, drop the box registration, and release
    /// every lock this process still holds.
    pub async fn close(&self) {
        for flag in self.watch_flags.lock().drain(..) {
            flag.store(false, Ordering::SeqCst);
        }

        let registration = self.registration.lock().take();
        if let Some(registration) = registration
            && let Err(e) = registration.deregister().await
        {
            warn!("deregistration failed at shutdown: {}", e);
        }

        let released = self.locks.release_all(&self.client).await;
        if released > 0 {
            info!(released, "released outstanding locks at shutdown");
        }
        self.started.store(false, Ordering::SeqCst);
        info!("cluster agent closed");
    }

    /// Register this process as a service host and keep the entry alive.
    pub async fn register_box(&self, info: BoxInfo) -> Result<()> {
        let registration = Arc::new(BoxRegistration::new(self.client.clone(), info));
        registration.register().await?;
        *self.registration.lock() = Some(registration);
        Ok(())
    }

    /// Pick a bind address currently hosting `service`.
    pub fn get_box(&self, service: &str) -> Result<String> {
        self.registry.get_box(service)
    }

    /// A named cluster-wide mutex. One acquire/release cycle per handle.
    pub fn acquire_lock(&self, name: &str) -> Result<ClusterMutex> {
        validate_name("lock name", name)?;
        Ok(ClusterMutex::new(
            self.client.clone(),
            self.locks.clone(),
            name,
        ))
    }

    pub async fn set_config(&self, section: &str, key: &str, value: Value) -> Result<()> {
        self.config.set(section, key, value).await
    }

    pub async fn del_config(&self, section: &str, key: &str) -> Result<()> {
        self.config.delete(section, key).await
    }

    pub async fn del_section(&self, section: &str) -> Result<()> {
        self.config.delete_section(section).await
    }

    pub async fn clear_config(&self) -> Result<()> {
        self.config.clear().await
    }

    pub fn get_config(&self, section: &str, key: &str) -> Option<Value> {
        self.config.get(section, key)
    }

    pub fn config(&self) -> Arc<ConfigStore> {
        self.config.clone()
    }

    pub fn registry(&self) -> Arc<RegistryWatcher> {
        self.registry.clone()
    }

    pub fn client(&self) -> Arc<StoreClient> {
        self.client.clone()
    }

    /// Whether the last store call failed to reach the store.
    pub fn degraded(&self) -> bool {
        self.client.degraded()
    }
}
