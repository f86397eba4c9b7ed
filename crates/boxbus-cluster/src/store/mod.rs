//! Typed model of the key-value store and the backend seam
//!
//! The store speaks an etcd-v2-shaped protocol: a tree of nodes, each
//! carrying key, optional value, creation/modification indices, and
//! children; writes support TTL leases, conditional previous values, and
//! in-order ("append") key creation; reads support recursion, sorting,
//! and blocking long-poll waits resumable from an index.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use boxbus_common::Result;

pub mod client;
pub mod http;
pub mod memory;

pub use client::StoreClient;
pub use http::{HttpStore, HttpStoreConfig};
pub use memory::MemoryStore;

/// What happened to a node, as reported by the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Action {
    Get,
    Set,
    Create,
    Update,
    Delete,
    Expire,
    CompareAndSwap,
    CompareAndDelete,
}

impl Action {
    /// Deletions and lease expirations are the only actions that can
    /// promote a lock waiter.
    pub fn is_removal(&self) -> bool {
        matches!(self, Action::Delete | Action::Expire)
    }
}

/// One node of the store's key tree.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default)]
    pub dir: bool,
    #[serde(default, rename = "createdIndex")]
    pub created_index: u64,
    #[serde(default, rename = "modifiedIndex")]
    pub modified_index: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<Node>,
}

impl Node {
    /// Flatten the subtree rooted at this node, the node itself included.
    pub fn walk(&self) -> Walk<'_> {
        Walk { stack: vec![self] }
    }

    /// Leaf nodes (non-directories) of the subtree.
    pub fn leaves(&self) -> impl Iterator<Item = &Node> {
        self.walk().filter(|n| !n.dir)
    }
}

/// Depth-first traversal over a [`Node`] subtree.
pub struct Walk<'a> {
    stack: Vec<&'a Node>,
}

impl<'a> Iterator for Walk<'a> {
    type Item = &'a Node;

    fn next(&mut self) -> Option<&'a Node> {
        let node = self.stack.pop()?;
        self.stack.extend(node.nodes.iter());
        Some(node)
    }
}

/// A store reply: the action taken and the affected subtree.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreResponse {
    pub action: Action,
    pub node: Node,
    #[serde(default, rename = "prevNode", skip_serializing_if = "Option::is_none")]
    pub prev_node: Option<Node>,
}

/// Options for write operations.
#[derive(Clone, Debug, Default)]
pub struct WriteOptions {
    /// Lease in seconds; the key expires unless refreshed in time.
    pub ttl: Option<u64>,
    /// The write succeeds only if the current value equals this.
    pub prev_value: Option<String>,
    /// `Some(false)` requires the key to not exist; `Some(true)` requires
    /// it to exist.
    pub prev_exist: Option<bool>,
    /// Create a sequence-named key under the target directory instead of
    /// writing the target itself.
    pub append: bool,
}

/// Options for read operations.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReadOptions {
    pub recursive: bool,
    pub sorted: bool,
    /// Block until a change occurs under the key instead of returning the
    /// current state.
    pub wait: bool,
    /// With `wait`, deliver the first change whose modification index is
    /// at least this, replaying missed events.
    pub wait_index: Option<u64>,
}

/// Options for delete operations.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeleteOptions {
    pub recursive: bool,
}

/// The seam between the coordination layer and a concrete store.
///
/// Keys are absolute store paths; namespace prefixing happens one layer
/// up in [`StoreClient`]. Implementations translate their transport
/// faults into the shared [`boxbus_common::ClusterError`] taxonomy.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    async fn write(&self, key: &str, value: &str, options: WriteOptions) -> Result<StoreResponse>;

    async fn read(&self, key: &str, options: ReadOptions) -> Result<StoreResponse>;

    async fn delete(&self, key: &str, options: DeleteOptions) -> Result<StoreResponse>;

    /// Extend a key's lease without changing its value. Must not wake
    /// watchers.
    async fn refresh(&self, key: &str, ttl: u64) -> Result<StoreResponse>;
}

/// Path segments of `key` relative to `root`, or `None` when `key` is not
/// under `root`.
pub fn relative_segments<'a>(root: &str, key: &'a str) -> Option<Vec<&'a str>> {
    let rest = key.strip_prefix(root)?;
    let rest = rest.strip_prefix('/').unwrap_or(rest);
    if rest.is_empty() {
        return Some(Vec::new());
    }
    Some(rest.split('/').collect())
}

/// Whether `key` sits exactly one path segment below `root`.
pub fn is_direct_child(root: &str, key: &str) -> bool {
    relative_segments(root, key).is_some_and(|segments| segments.len() == 1)
}
