//! Boxbus Cluster - coordination layer over an etcd-like key-value store
//!
//! This crate provides:
//! - A typed, namespaced store client with one fault-translation boundary
//! - A resilient long-poll watch loop reused by every watcher
//! - Cluster-wide named mutexes with lease keepalive and FIFO fairness
//! - A service registry maintaining an atomically swapped routing table
//! - A replicated section/key/value config store with snapshot diffing
//! - The `ClusterAgent` facade consumed by the RPC/transport layer

pub mod agent;
pub mod config;
pub mod lock;
pub mod registry;
pub mod store;
pub mod ticket;
pub mod watch;

pub use agent::ClusterAgent;
pub use boxbus_common::{ClusterError, Result};
pub use config::{ConfigStore, SharedConfig, compare_sections};
pub use lock::{ClusterMutex, LockRegistry, LockTiming};
pub use registry::{BoxInfo, BoxRegistration, RegistryWatcher, RoutingTable};
pub use store::{HttpStore, HttpStoreConfig, MemoryStore, StoreBackend, StoreClient};
pub use ticket::ClusterTicket;
pub use watch::{WatchHandler, Watcher};
