//! Service registry: box discovery and routing
//!
//! Every box registers a `boxes/<bind>` document listing the services it
//! hosts. The watcher rebuilds the whole routing table from a recursive
//! read on start and after every change notification; readers only ever
//! see a complete snapshot.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use tokio::time::Duration;
use tracing::{debug, info, warn};

use boxbus_common::{ClusterError, Result};

use crate::store::{
    DeleteOptions, ReadOptions, StoreClient, StoreResponse, WriteOptions, is_direct_child,
};
use crate::watch::WatchHandler;

/// One registered service host.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoxInfo {
    #[serde(default)]
    pub boxid: String,
    pub bind: String,
    #[serde(default)]
    pub services: HashSet<String>,
}

/// Immutable mapping from service name to candidate bind addresses.
#[derive(Clone, Debug, Default)]
pub struct RoutingTable {
    routes: HashMap<String, Vec<String>>,
    boxes: HashMap<String, BoxInfo>,
}

impl RoutingTable {
    /// Bind addresses currently hosting `service`; duplicates permitted.
    pub fn candidates(&self, service: &str) -> &[String] {
        self.routes.get(service).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn boxes(&self) -> &HashMap<String, BoxInfo> {
        &self.boxes
    }

    pub fn box_count(&self) -> usize {
        self.boxes.len()
    }

    fn insert_box(&mut self, info: BoxInfo) {
        for service in &info.services {
            self.routes
                .entry(service.clone())
                .or_default()
                .push(info.bind.clone());
        }
        self.boxes.insert(info.bind.clone(), info);
    }
}

/// Maintains the routing table from the `boxes/` subtree.
pub struct RegistryWatcher {
    client: Arc<StoreClient>,
    table: RwLock<Arc<RoutingTable>>,
}

impl RegistryWatcher {
    pub fn new(client: Arc<StoreClient>) -> Self {
        Self {
            client,
            table: RwLock::new(Arc::new(RoutingTable::default())),
        }
    }

    /// The current snapshot.
    pub fn table(&self) -> Arc<RoutingTable> {
        self.table.read().clone()
    }

    /// Pick one candidate for `service` uniformly at random.
    pub fn get_box(&self, service: &str) -> Result<String> {
        let table = self.table();
        table
            .candidates(service)
            .choose(&mut rand::rng())
            .cloned()
            .ok_or_else(|| ClusterError::ServiceNotFound(service.to_string()))
    }

    /// Rebuild the table from a full recursive read and swap it in.
    pub async fn rebuild(&self) -> Result<()> {
        let mut table = RoutingTable::default();

        match self
            .client
            .read("boxes", ReadOptions { recursive: true, ..Default::default() })
            .await
        {
            Ok(resp) => {
                let root_key = self.client.path("boxes");
                for node in resp.node.walk() {
                    if node.dir || !is_direct_child(&root_key, &node.key) {
                        continue;
                    }
                    let Some(value) = &node.value else { continue };
                    match serde_json::from_str::<BoxInfo>(value) {
                        Ok(info) => table.insert_box(info),
                        Err(e) => {
                            warn!(key = %node.key, "skipping malformed box entry: {}", e);
                        }
                    }
                }
            }
            // No registrations yet; the empty table is the truth.
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        debug!(boxes = table.box_count(), "routing table rebuilt");
        *self.table.write() = Arc::new(table);
        Ok(())
    }
}

#[async_trait]
impl WatchHandler for RegistryWatcher {
    async fn on_event(&self, _event: Option<StoreResponse>) {
        if let Err(e) = self.rebuild().await {
            debug!("routing table rebuild deferred: {}", e);
        }
    }
}

/// Lease parameters for a box registration.
#[derive(Clone, Copy, Debug)]
pub struct RegistrationTiming {
    pub ttl_secs: u64,
    pub beat: Duration,
}

impl Default for RegistrationTiming {
    fn default() -> Self {
        Self {
            ttl_secs: 10,
            beat: Duration::from_secs(3),
        }
    }
}

/// Keeps this process's registry entry alive.
///
/// The beat loop refreshes the entry's lease; when the lease lapsed (the
/// key vanished) the entry is re-created on the next beat, so a store
/// flap costs at most one lease worth of visibility.
pub struct BoxRegistration {
    client: Arc<StoreClient>,
    info: BoxInfo,
    timing: RegistrationTiming,
    cont: Arc<AtomicBool>,
}

impl BoxRegistration {
    pub fn new(client: Arc<StoreClient>, info: BoxInfo) -> Self {
        Self::with_timing(client, info, RegistrationTiming::default())
    }

    pub fn with_timing(
        client: Arc<StoreClient>,
        info: BoxInfo,
        timing: RegistrationTiming,
    ) -> Self {
        Self {
            client,
            info,
            timing,
            cont: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn info(&self) -> &BoxInfo {
        &self.info
    }

    fn path(&self) -> String {
        format!("boxes/{}", self.info.bind)
    }

    /// Write the registration document and start the beat loop.
    pub async fn register(&self) -> Result<()> {
        let doc = serde_json::to_string(&self.info)
            .map_err(|e| ClusterError::Parse(e.to_string()))?;
        self.client
            .write(
                &self.path(),
                &doc,
                WriteOptions { ttl: Some(self.timing.ttl_secs), ..Default::default() },
            )
            .await?;
        info!(bind = %self.info.bind, "box registered");

        self.cont.store(true, Ordering::SeqCst);
        let client = self.client.clone();
        let path = self.path();
        let timing = self.timing;
        let cont = self.cont.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(timing.beat).await;
                if !cont.load(Ordering::SeqCst) {
                    break;
                }
                match client.refresh(&path, timing.ttl_secs).await {
                    Ok(_) => {}
                    Err(e) if e.is_not_found() => {
                        match client
                            .write(
                                &path,
                                &doc,
                                WriteOptions { ttl: Some(timing.ttl_secs), ..Default::default() },
                            )
                            .await
                        {
                            Ok(_) => info!(path = %path, "registration re-created"),
                            Err(e) => warn!(path = %path, "registration re-create failed: {}", e),
                        }
                    }
                    Err(e) => warn!(path = %path, "registration keepalive failed: {}", e),
                }
            }
            debug!(path = %path, "registration beat stopped");
        });
        Ok(())
    }

    /// Stop the beat loop and delete the registration entry.
    pub async fn deregister(&self) -> Result<()> {
        self.cont.store(false, Ordering::SeqCst);
        match self
            .client
            .delete(&self.path(), DeleteOptions::default())
            .await
        {
            Ok(_) | Err(ClusterError::KeyNotFound(_)) => {
                info!(bind = %self.info.bind, "box deregistered");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreBackend};

    fn setup() -> (Arc<MemoryStore>, Arc<StoreClient>) {
        let backend = Arc::new(MemoryStore::new());
        let client = Arc::new(StoreClient::new(backend.clone(), "bbox"));
        (backend, client)
    }

    fn box_doc(boxid: &str, bind: &str, services: &[&str]) -> String {
        serde_json::to_string(&BoxInfo {
            boxid: boxid.to_string(),
            bind: bind.to_string(),
            services: services.iter().map(|s| s.to_string()).collect(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_rebuild_and_random_selection() {
        let (backend, client) = setup();
        backend
            .write("/bbox/boxes/h1:1", &box_doc("box1", "h1:1", &["x"]), WriteOptions::default())
            .await
            .unwrap();
        backend
            .write("/bbox/boxes/h2:2", &box_doc("box2", "h2:2", &["x"]), WriteOptions::default())
            .await
            .unwrap();

        let watcher = RegistryWatcher::new(client);
        watcher.rebuild().await.unwrap();

        let table = watcher.table();
        assert_eq!(table.box_count(), 2);
        assert_eq!(table.candidates("x").len(), 2);

        let mut seen_h1 = 0usize;
        let mut seen_h2 = 0usize;
        for _ in 0..200 {
            match watcher.get_box("x").unwrap().as_str() {
                "h1:1" => seen_h1 += 1,
                "h2:2" => seen_h2 += 1,
                other => panic!("unexpected bind {}", other),
            }
        }
        assert!(seen_h1 > 0 && seen_h2 > 0);

        let err = watcher.get_box("y").unwrap_err();
        assert!(matches!(err, ClusterError::ServiceNotFound(_)));
    }

    #[tokio::test]
    async fn test_rebuild_skips_malformed_and_nested_entries() {
        let (backend, client) = setup();
        backend
            .write("/bbox/boxes/h1:1", &box_doc("box1", "h1:1", &["x"]), WriteOptions::default())
            .await
            .unwrap();
        backend
            .write("/bbox/boxes/h2:2", "not json", WriteOptions::default())
            .await
            .unwrap();
        backend
            .write("/bbox/boxes/nested/deep", &box_doc("box3", "h3:3", &["x"]), WriteOptions::default())
            .await
            .unwrap();

        let watcher = RegistryWatcher::new(client);
        watcher.rebuild().await.unwrap();

        let table = watcher.table();
        assert_eq!(table.box_count(), 1);
        assert_eq!(table.candidates("x"), ["h1:1"]);
    }

    #[tokio::test]
    async fn test_empty_registry_is_empty_state() {
        let (_, client) = setup();
        let watcher = RegistryWatcher::new(client);
        watcher.rebuild().await.unwrap();
        assert_eq!(watcher.table().box_count(), 0);
    }

    #[tokio::test]
    async fn test_registration_lifecycle() {
        let (backend, client) = setup();
        let registration = BoxRegistration::with_timing(
            client.clone(),
            BoxInfo {
                boxid: "box1".to_string(),
                bind: "h1:1".to_string(),
                services: ["x".to_string()].into_iter().collect(),
            },
            RegistrationTiming { ttl_secs: 5, beat: Duration::from_millis(100) },
        );

        registration.register().await.unwrap();
        let resp = backend
            .read("/bbox/boxes/h1:1", ReadOptions::default())
            .await
            .unwrap();
        let info: BoxInfo = serde_json::from_str(resp.node.value.as_deref().unwrap()).unwrap();
        assert_eq!(info.boxid, "box1");

        registration.deregister().await.unwrap();
        let err = backend.read("/bbox/boxes/h1:1", ReadOptions::default()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_registration_recreated_after_key_loss() {
        let (backend, client) = setup();
        let registration = BoxRegistration::with_timing(
            client.clone(),
            BoxInfo {
                boxid: "box1".to_string(),
                bind: "h1:1".to_string(),
                services: HashSet::new(),
            },
            RegistrationTiming { ttl_secs: 5, beat: Duration::from_millis(80) },
        );
        registration.register().await.unwrap();

        // Simulate lease loss.
        backend.delete("/bbox/boxes/h1:1", DeleteOptions::default()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(backend.read("/bbox/boxes/h1:1", ReadOptions::default()).await.is_ok());

        registration.deregister().await.unwrap();
    }
}
