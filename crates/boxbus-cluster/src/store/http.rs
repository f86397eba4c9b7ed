//! HTTP store backend
//!
//! Speaks the etcd v2 REST API: `PUT`/`POST`/`GET`/`DELETE` against
//! `/v2/keys`, with long-poll reads left unbounded so the watch loop can
//! apply its own time bound. Transport faults rotate to the next endpoint
//! and surface as `StoreUnavailable`.

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use boxbus_common::{ClusterError, Result};

use super::{DeleteOptions, ReadOptions, StoreBackend, StoreResponse, WriteOptions};

// etcd v2 wire error codes.
const CODE_KEY_NOT_FOUND: i32 = 100;
const CODE_TEST_FAILED: i32 = 101;
const CODE_NODE_EXIST: i32 = 105;

/// Configuration for the HTTP store backend.
#[derive(Clone, Debug)]
pub struct HttpStoreConfig {
    /// Store endpoints, rotated through on connectivity faults.
    pub endpoints: Vec<String>,
    /// Connection timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Per-request timeout in milliseconds for non-waiting calls.
    pub request_timeout_ms: u64,
}

impl Default for HttpStoreConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            connect_timeout_ms: 5000,
            request_timeout_ms: 10000,
        }
    }
}

impl HttpStoreConfig {
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoints: vec![endpoint.to_string()],
            ..Default::default()
        }
    }

    pub fn with_endpoints(endpoints: Vec<String>) -> Self {
        Self {
            endpoints,
            ..Default::default()
        }
    }

    pub fn with_timeouts(mut self, connect_ms: u64, request_ms: u64) -> Self {
        self.connect_timeout_ms = connect_ms;
        self.request_timeout_ms = request_ms;
        self
    }
}

#[derive(Debug, Deserialize)]
struct WireError {
    #[serde(rename = "errorCode")]
    error_code: i32,
    message: String,
    #[serde(default)]
    cause: String,
}

/// [`StoreBackend`] over the store's HTTP API.
pub struct HttpStore {
    client: Client,
    config: HttpStoreConfig,
    current_endpoint: RwLock<usize>,
}

impl HttpStore {
    pub fn new(config: HttpStoreConfig) -> anyhow::Result<Self> {
        if config.endpoints.is_empty() {
            anyhow::bail!("at least one store endpoint is required");
        }
        let client = Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .build()?;
        Ok(Self {
            client,
            config,
            current_endpoint: RwLock::new(0),
        })
    }

    fn current_endpoint(&self) -> String {
        let index = *self
            .current_endpoint
            .read()
            .unwrap_or_else(|e| e.into_inner());
        self.config.endpoints[index].clone()
    }

    fn switch_to_next_endpoint(&self) {
        let mut index = self
            .current_endpoint
            .write()
            .unwrap_or_else(|e| e.into_inner());
        *index = (*index + 1) % self.config.endpoints.len();
        debug!("switched to store endpoint index {}", *index);
    }

    fn key_url(&self, key: &str) -> String {
        format!("{}/v2/keys{}", self.current_endpoint(), key)
    }

    fn transport_fault(&self, key: &str, err: reqwest::Error) -> ClusterError {
        warn!(key = %key, "store transport fault: {}", err);
        self.switch_to_next_endpoint();
        ClusterError::StoreUnavailable(err.to_string())
    }

    async fn decode(&self, key: &str, response: Response) -> Result<StoreResponse> {
        let status = response.status();
        if status.is_success() {
            return response
                .json::<StoreResponse>()
                .await
                .map_err(|e| ClusterError::Parse(format!("{}: {}", key, e)));
        }

        match response.json::<WireError>().await {
            Ok(wire) => Err(match wire.error_code {
                CODE_KEY_NOT_FOUND => ClusterError::KeyNotFound(key.to_string()),
                CODE_TEST_FAILED | CODE_NODE_EXIST => ClusterError::CasFailed(key.to_string()),
                code => ClusterError::Rejected(format!(
                    "{} (code {}, cause {})",
                    wire.message, code, wire.cause
                )),
            }),
            Err(_) if status == StatusCode::SERVICE_UNAVAILABLE || status.is_server_error() => {
                self.switch_to_next_endpoint();
                Err(ClusterError::StoreUnavailable(format!("status {}", status)))
            }
            Err(_) => Err(ClusterError::Rejected(format!("status {}", status))),
        }
    }
}

#[async_trait]
impl StoreBackend for HttpStore {
    async fn write(&self, key: &str, value: &str, options: WriteOptions) -> Result<StoreResponse> {
        let mut form: Vec<(&str, String)> = vec![("value", value.to_string())];
        if let Some(ttl) = options.ttl {
            form.push(("ttl", ttl.to_string()));
        }
        if let Some(prev_value) = &options.prev_value {
            form.push(("prevValue", prev_value.clone()));
        }
        if let Some(prev_exist) = options.prev_exist {
            form.push(("prevExist", prev_exist.to_string()));
        }

        let url = self.key_url(key);
        let request = if options.append {
            self.client.post(&url)
        } else {
            self.client.put(&url)
        };
        let response = request
            .timeout(Duration::from_millis(self.config.request_timeout_ms))
            .form(&form)
            .send()
            .await
            .map_err(|e| self.transport_fault(key, e))?;
        self.decode(key, response).await
    }

    async fn read(&self, key: &str, options: ReadOptions) -> Result<StoreResponse> {
        let mut query: Vec<(&str, String)> = Vec::new();
        if options.recursive {
            query.push(("recursive", "true".to_string()));
        }
        if options.sorted {
            query.push(("sorted", "true".to_string()));
        }
        if options.wait {
            query.push(("wait", "true".to_string()));
        }
        if let Some(index) = options.wait_index {
            query.push(("waitIndex", index.to_string()));
        }

        // Waiting reads hang until a change arrives; the caller bounds
        // them, so only plain reads get the request timeout.
        let mut request = self.client.get(self.key_url(key)).query(&query);
        if !options.wait {
            request = request.timeout(Duration::from_millis(self.config.request_timeout_ms));
        }
        let response = request
            .send()
            .await
            .map_err(|e| self.transport_fault(key, e))?;
        self.decode(key, response).await
    }

    async fn delete(&self, key: &str, options: DeleteOptions) -> Result<StoreResponse> {
        let mut query: Vec<(&str, String)> = Vec::new();
        if options.recursive {
            query.push(("recursive", "true".to_string()));
        }

        let response = self
            .client
            .delete(self.key_url(key))
            .timeout(Duration::from_millis(self.config.request_timeout_ms))
            .query(&query)
            .send()
            .await
            .map_err(|e| self.transport_fault(key, e))?;
        self.decode(key, response).await
    }

    async fn refresh(&self, key: &str, ttl: u64) -> Result<StoreResponse> {
        let form: Vec<(&str, String)> = vec![
            ("ttl", ttl.to_string()),
            ("refresh", "true".to_string()),
            ("prevExist", "true".to_string()),
        ];

        let response = self
            .client
            .put(self.key_url(key))
            .timeout(Duration::from_millis(self.config.request_timeout_ms))
            .form(&form)
            .send()
            .await
            .map_err(|e| self.transport_fault(key, e))?;
        self.decode(key, response).await
    }
}
