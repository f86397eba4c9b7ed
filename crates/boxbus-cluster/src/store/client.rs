//! Store adapter: namespace prefixing and the fault-translation boundary
//!
//! Every coordination component talks to the store through this client.
//! Logical paths are rewritten under the cluster prefix, and every call
//! passes through one tracking point that maintains the process-visible
//! degraded flag: set when the store is unreachable, cleared by the next
//! call that reaches it (key absence and lost conditional writes both
//! count as reaching it).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};

use boxbus_common::Result;

use super::{
    DeleteOptions, ReadOptions, StoreBackend, StoreResponse, WriteOptions,
};

/// Typed, namespaced wrapper over a [`StoreBackend`].
pub struct StoreClient {
    backend: Arc<dyn StoreBackend>,
    prefix: String,
    degraded: AtomicBool,
}

impl StoreClient {
    /// `prefix` is the cluster namespace, fixed for the process lifetime.
    pub fn new(backend: Arc<dyn StoreBackend>, prefix: &str) -> Self {
        Self {
            backend,
            prefix: prefix.trim_matches('/').to_string(),
            degraded: AtomicBool::new(false),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Whether the last store call failed to reach the store.
    pub fn degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Rewrite a logical path into an absolute store key under the
    /// cluster prefix. A leading separator means absolute-within-prefix;
    /// anything else nests under the prefix root the same way.
    pub fn path(&self, logical: &str) -> String {
        if let Some(absolute) = logical.strip_prefix('/') {
            format!("/{}/{}", self.prefix, absolute)
        } else {
            format!("/{}/{}", self.prefix, logical)
        }
    }

    fn track<T>(&self, result: Result<T>) -> Result<T> {
        match &result {
            Err(e) if e.is_unavailable() => {
                if !self.degraded.swap(true, Ordering::SeqCst) {
                    warn!("store degraded: {}", e);
                }
            }
            _ => {
                if self.degraded.swap(false, Ordering::SeqCst) {
                    info!("store connectivity restored");
                }
            }
        }
        result
    }

    pub async fn write(
        &self,
        logical: &str,
        value: &str,
        options: WriteOptions,
    ) -> Result<StoreResponse> {
        self.write_key(&self.path(logical), value, options).await
    }

    pub async fn read(&self, logical: &str, options: ReadOptions) -> Result<StoreResponse> {
        self.read_key(&self.path(logical), options).await
    }

    pub async fn delete(&self, logical: &str, options: DeleteOptions) -> Result<StoreResponse> {
        self.delete_key(&self.path(logical), options).await
    }

    pub async fn refresh(&self, logical: &str, ttl: u64) -> Result<StoreResponse> {
        self.refresh_key(&self.path(logical), ttl).await
    }

    /// Write by absolute store key, as returned in store responses.
    pub async fn write_key(
        &self,
        key: &str,
        value: &str,
        options: WriteOptions,
    ) -> Result<StoreResponse> {
        let result = self.backend.write(key, value, options).await;
        self.track(result)
    }

    pub async fn read_key(&self, key: &str, options: ReadOptions) -> Result<StoreResponse> {
        let result = self.backend.read(key, options).await;
        self.track(result)
    }

    pub async fn delete_key(&self, key: &str, options: DeleteOptions) -> Result<StoreResponse> {
        let result = self.backend.delete(key, options).await;
        self.track(result)
    }

    pub async fn refresh_key(&self, key: &str, ttl: u64) -> Result<StoreResponse> {
        let result = self.backend.refresh(key, ttl).await;
        self.track(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn client_with_memory() -> (Arc<MemoryStore>, StoreClient) {
        let backend = Arc::new(MemoryStore::new());
        let client = StoreClient::new(backend.clone(), "bbox");
        (backend, client)
    }

    #[test]
    fn test_path_rewriting() {
        let (_, client) = client_with_memory();
        assert_eq!(client.path("boxes"), "/bbox/boxes");
        assert_eq!(client.path("/boxes"), "/bbox/boxes");
        assert_eq!(client.path("configs/db/host"), "/bbox/configs/db/host");
    }

    #[test]
    fn test_prefix_trimmed() {
        let backend = Arc::new(MemoryStore::new());
        let client = StoreClient::new(backend, "/bbox/");
        assert_eq!(client.prefix(), "bbox");
        assert_eq!(client.path("boxes"), "/bbox/boxes");
    }

    #[tokio::test]
    async fn test_degraded_flag_set_and_cleared() {
        let (backend, client) = client_with_memory();
        assert!(!client.degraded());

        backend.set_available(false);
        assert!(client.write("k", "v", WriteOptions::default()).await.is_err());
        assert!(client.degraded());

        backend.set_available(true);
        client.write("k", "v", WriteOptions::default()).await.unwrap();
        assert!(!client.degraded());
    }

    #[tokio::test]
    async fn test_key_absence_clears_degraded() {
        let (backend, client) = client_with_memory();
        backend.set_available(false);
        let _ = client.read("missing", ReadOptions::default()).await;
        assert!(client.degraded());

        backend.set_available(true);
        let err = client.read("missing", ReadOptions::default()).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(!client.degraded());
    }

    #[tokio::test]
    async fn test_writes_land_under_prefix() {
        let (backend, client) = client_with_memory();
        client.write("boxes/h1:1", "{}", WriteOptions::default()).await.unwrap();

        let resp = backend.read("/bbox/boxes/h1:1", ReadOptions::default()).await.unwrap();
        assert_eq!(resp.node.value.as_deref(), Some("{}"));
    }
}
