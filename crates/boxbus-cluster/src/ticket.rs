//! Process configuration
//!
//! A ticket names the cluster this process belongs to: the key namespace
//! prefix and the store endpoints. Loaded once at startup, fixed for the
//! process lifetime.

use serde::{Deserialize, Serialize};

use boxbus_common::{ClusterError, Result, validate_name};

use crate::store::HttpStoreConfig;

/// Cluster membership configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterTicket {
    /// Key namespace prefix; every key this process touches lives under
    /// `/<prefix>/`.
    pub prefix: String,
    /// Store endpoints.
    pub etcd: Vec<String>,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for ClusterTicket {
    fn default() -> Self {
        Self {
            prefix: "bbox".to_string(),
            etcd: vec!["http://127.0.0.1:2379".to_string()],
            connect_timeout_ms: 5000,
            request_timeout_ms: 10000,
        }
    }
}

impl ClusterTicket {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            ..Default::default()
        }
    }

    pub fn with_endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.etcd = endpoints;
        self
    }

    pub fn with_timeouts(mut self, connect_ms: u64, request_ms: u64) -> Self {
        self.connect_timeout_ms = connect_ms;
        self.request_timeout_ms = request_ms;
        self
    }

    /// Load a ticket from a JSON file.
    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading ticket {}: {}", path.display(), e))?;
        let ticket: Self = serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("parsing ticket {}: {}", path.display(), e))?;
        ticket.validate()?;
        Ok(ticket)
    }

    pub fn validate(&self) -> Result<()> {
        validate_name("cluster prefix", &self.prefix)?;
        if self.etcd.is_empty() {
            return Err(ClusterError::InvalidName(
                "at least one store endpoint is required".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn store_config(&self) -> HttpStoreConfig {
        HttpStoreConfig::with_endpoints(self.etcd.clone())
            .with_timeouts(self.connect_timeout_ms, self.request_timeout_ms)
    }
}
