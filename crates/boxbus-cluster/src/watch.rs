//! Resilient long-poll watch loop
//!
//! One reusable primitive drives every watcher in the process: issue a
//! blocking "wait for change" read bounded by a local timeout, retry
//! through store faults with a fixed backoff, advance the cursor on each
//! delivered change, and poke the handler once per iteration so
//! dependents can re-validate even when nothing happened.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::store::{ReadOptions, StoreClient, StoreResponse};

/// Bound on a single long-poll read, to stay under idle-connection
/// timeouts of intermediate infrastructure.
pub const WATCH_BOUND: Duration = Duration::from_secs(60);

/// Backoff after a store connectivity fault.
pub const FAULT_BACKOFF: Duration = Duration::from_secs(1);

/// Receives watch deliveries. `None` is the per-iteration poke.
#[async_trait]
pub trait WatchHandler: Send + Sync {
    async fn on_event(&self, event: Option<StoreResponse>);
}

/// Adapter for handlers expressed as a plain closure.
pub struct FnWatchHandler<F>
where
    F: Fn(Option<StoreResponse>) + Send + Sync,
{
    f: F,
}

impl<F> FnWatchHandler<F>
where
    F: Fn(Option<StoreResponse>) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> WatchHandler for FnWatchHandler<F>
where
    F: Fn(Option<StoreResponse>) + Send + Sync,
{
    async fn on_event(&self, event: Option<StoreResponse>) {
        (self.f)(event);
    }
}

/// A cancellable watch over one store subtree.
pub struct Watcher {
    client: Arc<StoreClient>,
    path: String,
    cont: Arc<AtomicBool>,
    bound: Duration,
    backoff: Duration,
}

impl Watcher {
    pub fn new(client: Arc<StoreClient>, path: &str) -> Self {
        Self {
            client,
            path: path.to_string(),
            cont: Arc::new(AtomicBool::new(true)),
            bound: WATCH_BOUND,
            backoff: FAULT_BACKOFF,
        }
    }

    /// Override the poll bound and fault backoff. Tests shrink these.
    pub fn with_timing(mut self, bound: Duration, backoff: Duration) -> Self {
        self.bound = bound;
        self.backoff = backoff;
        self
    }

    /// Dropping this flag makes the loop exit at its next suspension
    /// point.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cont.clone()
    }

    /// Run the loop until cancelled. Never returns early on store
    /// faults or timeouts.
    pub async fn run(&self, handler: Arc<dyn WatchHandler>) {
        let mut cursor: Option<u64> = None;

        while self.cont.load(Ordering::SeqCst) {
            debug!(path = %self.path, "watching");
            let read = self.client.read(
                &self.path,
                ReadOptions {
                    recursive: true,
                    wait: true,
                    wait_index: cursor.map(|c| c + 1),
                    ..Default::default()
                },
            );

            match tokio::time::timeout(self.bound, read).await {
                Err(_) => {
                    // Local bound elapsed with no change; re-issue.
                    debug!(path = %self.path, "watch bound elapsed");
                }
                Ok(Err(e)) if e.is_unavailable() => {
                    warn!(path = %self.path, "store fault while watching, backing off: {}", e);
                    tokio::time::sleep(self.backoff).await;
                }
                Ok(Err(e)) => {
                    // The store no longer holds our resume index; start
                    // over from the current state.
                    debug!(path = %self.path, "watch read rejected, resetting cursor: {}", e);
                    cursor = None;
                }
                Ok(Ok(event)) => {
                    cursor = Some(event.node.modified_index);
                    handler.on_event(Some(event)).await;
                }
            }

            // Poke: dependents re-validate once per iteration no matter
            // what the read produced.
            handler.on_event(None).await;
        }
        debug!(path = %self.path, "watch loop cancelled");
    }

    /// Spawn the loop as a task; returns the handle and the cancel flag.
    pub fn spawn(
        client: Arc<StoreClient>,
        path: &str,
        handler: Arc<dyn WatchHandler>,
    ) -> (JoinHandle<()>, Arc<AtomicBool>) {
        let watcher = Self::new(client, path);
        let cont = watcher.cancel_flag();
        let handle = tokio::spawn(async move {
            watcher.run(handler).await;
        });
        (handle, cont)
    }
}
