//! Cluster-wide named mutex over store sequence keys
//!
//! Acquisition creates a sequence-ordered entry under the lock's root and
//! waits until that entry is the oldest direct child. A keepalive task
//! refreshes the entry's lease; if the lease cannot be maintained the
//! lock is declared lost and released asynchronously. Contenders are
//! granted in creation order of their entries.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Duration;
use tracing::{debug, warn};

use boxbus_common::{ClusterError, Result};

use crate::store::{
    DeleteOptions, ReadOptions, StoreClient, WriteOptions, is_direct_child,
};

/// Lease and cadence parameters for a mutex.
#[derive(Clone, Copy, Debug)]
pub struct LockTiming {
    /// Lease on the lock entry, in seconds.
    pub ttl_secs: u64,
    /// Interval between lease refreshes. Must stay well under the lease.
    pub keepalive: Duration,
    /// Bound on one blocking wait for lock-root changes.
    pub wait_bound: Duration,
}

impl Default for LockTiming {
    fn default() -> Self {
        Self {
            ttl_secs: 5,
            keepalive: Duration::from_secs(1),
            wait_bound: Duration::from_secs(20),
        }
    }
}

/// Process-wide map of held lock keys to their tokens.
///
/// Constructed once per process and shared by every mutex so shutdown
/// can release everything this process still holds.
pub struct LockRegistry {
    held: DashMap<String, String>,
}

impl Default for LockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LockRegistry {
    pub fn new() -> Self {
        Self { held: DashMap::new() }
    }

    pub(crate) fn insert(&self, key: &str, token: &str) {
        self.held.insert(key.to_string(), token.to_string());
    }

    pub(crate) fn remove(&self, key: &str) {
        self.held.remove(key);
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    /// Delete every outstanding lock key owned by this process. Returns
    /// the number of keys released.
    pub async fn release_all(&self, client: &StoreClient) -> usize {
        let keys: Vec<String> = self.held.iter().map(|e| e.key().clone()).collect();
        let mut released = 0;
        for key in keys {
            match client.delete_key(&key, DeleteOptions::default()).await {
                Ok(_) | Err(ClusterError::KeyNotFound(_)) => {
                    self.held.remove(&key);
                    released += 1;
                }
                Err(e) => {
                    warn!(key = %key, "failed to release lock key at shutdown: {}", e);
                }
            }
        }
        released
    }
}

struct LockState {
    /// Absolute store key of our entry, once created.
    key: Option<String>,
    /// Continuation flag for the keepalive task and the wait loop.
    cont: bool,
    acquired: bool,
    /// Set on release; a closed mutex cannot be reused.
    closed: bool,
}

struct LockShared {
    client: Arc<StoreClient>,
    registry: Arc<LockRegistry>,
    /// Logical path of the lock root, `_lock/<name>`.
    root: String,
    token: String,
    timing: LockTiming,
    state: Mutex<LockState>,
}

impl LockShared {
    async fn release_inner(&self) -> Result<()> {
        let key = {
            let mut state = self.state.lock();
            if state.closed && state.key.is_none() {
                return Ok(());
            }
            state.cont = false;
            state.acquired = false;
            state.closed = true;
            state.key.take()
        };

        if let Some(key) = key {
            self.registry.remove(&key);
            match self.client.delete_key(&key, DeleteOptions::default()).await {
                Ok(_) | Err(ClusterError::KeyNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        } else {
            // Key identity lost; find our entry by token.
            let resp = match self
                .client
                .read(&self.root, ReadOptions { recursive: true, ..Default::default() })
                .await
            {
                Ok(resp) => resp,
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(e),
            };
            for node in resp.node.walk() {
                if node.value.as_deref() == Some(self.token.as_str()) {
                    match self.client.delete_key(&node.key, DeleteOptions::default()).await {
                        Ok(_) | Err(ClusterError::KeyNotFound(_)) => {}
                        Err(e) => return Err(e),
                    }
                    self.registry.remove(&node.key);
                }
            }
        }
        Ok(())
    }
}

async fn keepalive(shared: Arc<LockShared>) {
    loop {
        let key = {
            let state = shared.state.lock();
            if !state.cont {
                break;
            }
            match &state.key {
                Some(key) => key.clone(),
                None => break,
            }
        };

        match shared.client.refresh_key(&key, shared.timing.ttl_secs).await {
            Ok(_) => {}
            // The key being gone is not a keepalive failure; release or
            // expiry already took it.
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                warn!(key = %key, "lock keepalive failed, forcing release: {}", e);
                if let Err(release_err) = shared.release_inner().await {
                    debug!(key = %key, "forced release incomplete: {}", release_err);
                }
                break;
            }
        }
        tokio::time::sleep(shared.timing.keepalive).await;
    }
}

/// Named, cluster-wide exclusive lock.
///
/// Not reentrant; one acquire/release cycle per instance. After
/// `release` the mutex is permanently closed.
pub struct ClusterMutex {
    shared: Arc<LockShared>,
}

impl ClusterMutex {
    pub(crate) fn new(client: Arc<StoreClient>, registry: Arc<LockRegistry>, name: &str) -> Self {
        Self::with_timing(client, registry, name, LockTiming::default())
    }

    pub(crate) fn with_timing(
        client: Arc<StoreClient>,
        registry: Arc<LockRegistry>,
        name: &str,
        timing: LockTiming,
    ) -> Self {
        Self {
            shared: Arc::new(LockShared {
                client,
                registry,
                root: format!("_lock/{}", name),
                token: uuid::Uuid::new_v4().simple().to_string(),
                timing,
                state: Mutex::new(LockState {
                    key: None,
                    cont: false,
                    acquired: false,
                    closed: false,
                }),
            }),
        }
    }

    pub fn is_acquired(&self) -> bool {
        self.shared.state.lock().acquired
    }

    /// Suspend until this process holds exclusive ownership of the name.
    ///
    /// Fails immediately with `StoreUnavailable` when the store cannot be
    /// reached; queuing without a store would be meaningless.
    pub async fn acquire(&self) -> Result<()> {
        {
            let state = self.shared.state.lock();
            if state.closed {
                return Err(ClusterError::LockClosed);
            }
        }
        if self.shared.client.degraded() {
            return Err(ClusterError::StoreUnavailable(
                "store is degraded".to_string(),
            ));
        }

        let resp = self
            .shared
            .client
            .write(
                &self.shared.root,
                &self.shared.token,
                WriteOptions {
                    ttl: Some(self.shared.timing.ttl_secs),
                    append: true,
                    ..Default::default()
                },
            )
            .await?;
        let key = resp.node.key.clone();
        debug!(key = %key, "lock entry created");

        {
            let mut state = self.shared.state.lock();
            state.key = Some(key.clone());
            state.cont = true;
        }
        self.shared.registry.insert(&key, &self.shared.token);
        tokio::spawn(keepalive(self.shared.clone()));

        match self.wait_until_first().await {
            Ok(()) => Ok(()),
            Err(e) => {
                // Leave no queue entry behind on a failed acquire.
                if let Err(release_err) = self.shared.release_inner().await {
                    debug!("cleanup after failed acquire incomplete: {}", release_err);
                }
                Err(e)
            }
        }
    }

    /// Whether our entry is the oldest direct child of the lock root.
    /// Nested unrelated keys are not contenders.
    async fn check_acquired(&self) -> Result<bool> {
        let resp = match self
            .shared
            .client
            .read(
                &self.shared.root,
                ReadOptions { recursive: true, sorted: true, ..Default::default() },
            )
            .await
        {
            Ok(resp) => resp,
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e),
        };

        let root_key = self.shared.client.path(&self.shared.root);
        let mut entries: Vec<(u64, &str)> = resp
            .node
            .walk()
            .filter(|n| !n.dir && is_direct_child(&root_key, &n.key))
            .map(|n| (n.created_index, n.key.as_str()))
            .collect();
        entries.sort_unstable();

        let mut state = self.shared.state.lock();
        let acquired = match (&state.key, entries.first()) {
            (Some(key), Some((_, first))) => key == first,
            _ => false,
        };
        state.acquired = acquired;
        Ok(acquired)
    }

    async fn wait_until_first(&self) -> Result<()> {
        loop {
            if !self.shared.state.lock().cont {
                return Err(ClusterError::LockLost);
            }
            if self.check_acquired().await? {
                debug!(root = %self.shared.root, "lock acquired");
                return Ok(());
            }

            // Only a removal under the root can promote us; anything else
            // keeps us waiting without a re-check.
            loop {
                let read = self.shared.client.read(
                    &self.shared.root,
                    ReadOptions { wait: true, recursive: true, ..Default::default() },
                );
                match tokio::time::timeout(self.shared.timing.wait_bound, read).await {
                    Err(_) => break,
                    Ok(Err(e)) if e.is_unavailable() => return Err(e),
                    Ok(Err(_)) => break,
                    Ok(Ok(event)) if event.action.is_removal() => break,
                    Ok(Ok(_)) => continue,
                }
            }
        }
    }

    /// Relinquish ownership. The entry is deleted (by key, or by token
    /// scan when the key identity was lost) and the mutex is closed.
    pub async fn release(&self) -> Result<()> {
        {
            let state = self.shared.state.lock();
            if state.closed && state.key.is_none() {
                return Ok(());
            }
        }
        self.shared.release_inner().await
    }

    /// Scoped pairing: acquire, run the body, release.
    pub async fn with_acquired<T, F, Fut>(self, body: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.acquire().await?;
        let out = body().await;
        self.release().await?;
        Ok(out)
    }

    #[cfg(test)]
    fn forget_key(&self) {
        self.shared.state.lock().key = None;
    }
}
