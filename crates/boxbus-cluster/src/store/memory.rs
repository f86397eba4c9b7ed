//! In-memory store backend
//!
//! Implements the full backend contract without a live store: monotonic
//! indices, in-order key creation, TTL leases with expiration events,
//! conditional writes, and long-poll waits. Integration tests and
//! embedded single-process deployments run against this backend.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use boxbus_common::{ClusterError, Result};

use super::{
    Action, DeleteOptions, Node, ReadOptions, StoreBackend, StoreResponse, WriteOptions,
};

const EVENT_LOG_CAP: usize = 65536;
const WAIT_POLL: Duration = Duration::from_millis(25);

struct Entry {
    value: String,
    created_index: u64,
    modified_index: u64,
    expires_at: Option<Instant>,
}

struct Inner {
    entries: BTreeMap<String, Entry>,
    index: u64,
    events: VecDeque<StoreResponse>,
    trimmed: bool,
}

/// In-memory [`StoreBackend`].
///
/// `set_available(false)` makes every operation fail with
/// `StoreUnavailable`, which is how tests exercise degraded-mode paths.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    notify: Notify,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: BTreeMap::new(),
                index: 0,
                events: VecDeque::new(),
                trimmed: false,
            }),
            notify: Notify::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Toggle simulated connectivity.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ClusterError::StoreUnavailable("memory store offline".to_string()))
        }
    }

    /// Drop expired entries, emitting an `expire` event per key.
    fn purge_expired(inner: &mut Inner) -> bool {
        let now = Instant::now();
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at.is_some_and(|at| at <= now))
            .map(|(k, _)| k.clone())
            .collect();

        for key in &expired {
            let old = inner.entries.remove(key);
            inner.index += 1;
            let index = inner.index;
            push_event(
                inner,
                StoreResponse {
                    action: Action::Expire,
                    node: Node {
                        key: key.clone(),
                        value: None,
                        dir: false,
                        created_index: old.as_ref().map(|e| e.created_index).unwrap_or(index),
                        modified_index: index,
                        nodes: Vec::new(),
                    },
                    prev_node: old.map(|e| leaf_node(key, &e)),
                },
            );
        }
        !expired.is_empty()
    }

    fn subtree_keys(inner: &Inner, root: &str) -> Vec<String> {
        let prefix = format!("{}/", root);
        inner
            .entries
            .keys()
            .filter(|k| k.as_str() == root || k.starts_with(&prefix))
            .cloned()
            .collect()
    }

    fn build_tree(inner: &Inner, root: &str, recursive: bool) -> Option<Node> {
        if let Some(entry) = inner.entries.get(root) {
            return Some(leaf_node(root, entry));
        }

        let prefix = format!("{}/", root);
        let mut children: BTreeMap<String, bool> = BTreeMap::new();
        for key in inner.entries.keys() {
            if let Some(rest) = key.strip_prefix(&prefix) {
                match rest.split_once('/') {
                    Some((first, _)) => {
                        children.insert(format!("{}/{}", root, first), true);
                    }
                    None => {
                        children.entry(key.clone()).or_insert(false);
                    }
                }
            }
        }

        if children.is_empty() {
            return None;
        }

        let nodes = children
            .iter()
            .filter_map(|(child, is_dir)| {
                if *is_dir && !recursive {
                    Some(Node {
                        key: child.clone(),
                        value: None,
                        dir: true,
                        created_index: 0,
                        modified_index: 0,
                        nodes: Vec::new(),
                    })
                } else {
                    Self::build_tree(inner, child, recursive)
                }
            })
            .collect();

        Some(Node {
            key: root.to_string(),
            value: None,
            dir: true,
            created_index: 0,
            modified_index: 0,
            nodes,
        })
    }
}

fn leaf_node(key: &str, entry: &Entry) -> Node {
    Node {
        key: key.to_string(),
        value: Some(entry.value.clone()),
        dir: false,
        created_index: entry.created_index,
        modified_index: entry.modified_index,
        nodes: Vec::new(),
    }
}

fn push_event(inner: &mut Inner, event: StoreResponse) {
    inner.events.push_back(event);
    if inner.events.len() > EVENT_LOG_CAP {
        inner.events.pop_front();
        inner.trimmed = true;
    }
}

fn in_subtree(root: &str, key: &str) -> bool {
    key == root || key.strip_prefix(root).is_some_and(|rest| rest.starts_with('/'))
}

#[async_trait]
impl StoreBackend for MemoryStore {
    async fn write(&self, key: &str, value: &str, options: WriteOptions) -> Result<StoreResponse> {
        self.check_available()?;
        let response = {
            let mut inner = self.inner.lock();
            Self::purge_expired(&mut inner);

            let expires_at = options
                .ttl
                .map(|ttl| Instant::now() + Duration::from_secs(ttl));

            let response = if options.append {
                if inner.entries.contains_key(key) {
                    return Err(ClusterError::Rejected(format!("{} is not a directory", key)));
                }
                inner.index += 1;
                let index = inner.index;
                // Zero-padded so lexicographic order matches creation order.
                let child = format!("{}/{:020}", key, index);
                let entry = Entry {
                    value: value.to_string(),
                    created_index: index,
                    modified_index: index,
                    expires_at,
                };
                let node = leaf_node(&child, &entry);
                inner.entries.insert(child, entry);
                StoreResponse {
                    action: Action::Create,
                    node,
                    prev_node: None,
                }
            } else {
                let existing = inner.entries.get(key);
                match options.prev_exist {
                    Some(false) if existing.is_some() => {
                        return Err(ClusterError::CasFailed(key.to_string()));
                    }
                    Some(true) if existing.is_none() => {
                        return Err(ClusterError::KeyNotFound(key.to_string()));
                    }
                    _ => {}
                }
                if let Some(expected) = &options.prev_value {
                    match existing {
                        None => return Err(ClusterError::KeyNotFound(key.to_string())),
                        Some(entry) if &entry.value != expected => {
                            return Err(ClusterError::CasFailed(key.to_string()));
                        }
                        Some(_) => {}
                    }
                }

                let prev = existing.map(|e| leaf_node(key, e));
                let created_index = existing.map(|e| e.created_index);
                inner.index += 1;
                let index = inner.index;
                let entry = Entry {
                    value: value.to_string(),
                    created_index: created_index.unwrap_or(index),
                    modified_index: index,
                    expires_at,
                };
                let node = leaf_node(key, &entry);
                inner.entries.insert(key.to_string(), entry);

                let action = if options.prev_value.is_some() {
                    Action::CompareAndSwap
                } else if options.prev_exist == Some(false) {
                    Action::Create
                } else {
                    Action::Set
                };
                StoreResponse {
                    action,
                    node,
                    prev_node: prev,
                }
            };

            push_event(&mut inner, response.clone());
            response
        };
        self.notify.notify_waiters();
        Ok(response)
    }

    async fn read(&self, key: &str, options: ReadOptions) -> Result<StoreResponse> {
        self.check_available()?;

        if !options.wait {
            let mut inner = self.inner.lock();
            Self::purge_expired(&mut inner);
            let node = Self::build_tree(&inner, key, options.recursive)
                .ok_or_else(|| ClusterError::KeyNotFound(key.to_string()))?;
            return Ok(StoreResponse {
                action: Action::Get,
                node,
                prev_node: None,
            });
        }

        // Long-poll: deliver the first event at or past `since` touching
        // the watched subtree. Without an explicit index only future
        // events qualify.
        let mut since = options.wait_index;
        loop {
            {
                let mut inner = self.inner.lock();
                if Self::purge_expired(&mut inner) {
                    self.notify.notify_waiters();
                }
                let since = *since.get_or_insert(inner.index + 1);

                if let Some(event) = inner
                    .events
                    .iter()
                    .find(|ev| ev.node.modified_index >= since && in_subtree(key, &ev.node.key))
                {
                    return Ok(event.clone());
                }
                if inner.trimmed
                    && inner
                        .events
                        .front()
                        .is_none_or(|ev| ev.node.modified_index > since)
                {
                    return Err(ClusterError::Rejected(format!(
                        "event index {} has been cleared",
                        since
                    )));
                }
            }
            self.check_available()?;
            let notified = self.notify.notified();
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(WAIT_POLL) => {}
            }
        }
    }

    async fn delete(&self, key: &str, options: DeleteOptions) -> Result<StoreResponse> {
        self.check_available()?;
        let response = {
            let mut inner = self.inner.lock();
            Self::purge_expired(&mut inner);

            let response = if let Some(old) = inner.entries.remove(key) {
                inner.index += 1;
                let index = inner.index;
                StoreResponse {
                    action: Action::Delete,
                    node: Node {
                        key: key.to_string(),
                        value: None,
                        dir: false,
                        created_index: old.created_index,
                        modified_index: index,
                        nodes: Vec::new(),
                    },
                    prev_node: Some(leaf_node(key, &old)),
                }
            } else {
                let subtree = Self::subtree_keys(&inner, key);
                if subtree.is_empty() {
                    return Err(ClusterError::KeyNotFound(key.to_string()));
                }
                if !options.recursive {
                    return Err(ClusterError::Rejected(format!("{} is not a file", key)));
                }
                for k in &subtree {
                    inner.entries.remove(k);
                }
                inner.index += 1;
                let index = inner.index;
                StoreResponse {
                    action: Action::Delete,
                    node: Node {
                        key: key.to_string(),
                        value: None,
                        dir: true,
                        created_index: 0,
                        modified_index: index,
                        nodes: Vec::new(),
                    },
                    prev_node: None,
                }
            };
            push_event(&mut inner, response.clone());
            response
        };
        self.notify.notify_waiters();
        Ok(response)
    }

    async fn refresh(&self, key: &str, ttl: u64) -> Result<StoreResponse> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        Self::purge_expired(&mut inner);

        let entry = inner
            .entries
            .get_mut(key)
            .ok_or_else(|| ClusterError::KeyNotFound(key.to_string()))?;
        entry.expires_at = Some(Instant::now() + Duration::from_secs(ttl));

        // A refresh extends the lease without waking watchers.
        let node = leaf_node(key, entry);
        Ok(StoreResponse {
            action: Action::Update,
            node,
            prev_node: None,
        })
    }
}
