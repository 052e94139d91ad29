//! JSON-RPC transport over HTTP.
//!
//! Every provider is addressed by its URL; requests use the JSON-RPC 2.0
//! envelope. Providers with an `auth_token_env` get a bearer token.
//!
//! Data providers serve quotes over plain REST, so their health check is a
//! GET of `health_path` rather than a JSON-RPC call.

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use super::transport::{Settlement, TransactionPlan, Transport};
use super::Provider;
use crate::config::{AppConfig, ProviderConfig};
use crate::types::{ArbiterError, ProviderRole};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Liveness probe; any well-formed result counts as alive.
const PING_METHOD: &str = "eth_chainId";

/// Health path of a data provider that does not configure one.
const DEFAULT_HEALTH_PATH: &str = "/health";

const SUBMIT_METHOD: &str = "arbiter_submitPlan";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

impl<T> RpcResponse<T> {
    fn into_result(self, provider: &str) -> Result<T, ArbiterError> {
        if let Some(e) = self.error {
            return Err(ArbiterError::Transport {
                provider: provider.to_string(),
                message: format!("rpc error {}: {}", e.code, e.message),
            });
        }
        self.result.ok_or_else(|| ArbiterError::Transport {
            provider: provider.to_string(),
            message: "rpc response carried neither result nor error".into(),
        })
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

pub struct HttpTransport {
    http: Client,
    timeout: Duration,
    tokens: HashMap<String, SecretString>,
    /// REST health URL per data provider.
    health_urls: HashMap<String, String>,
    next_id: AtomicU64,
}

impl HttpTransport {
    /// Build the client and resolve each provider's bearer token.
    ///
    /// A token env var that is not set is logged and the provider is
    /// called without authentication.
    pub fn new(providers: &[ProviderConfig], timeout: Duration) -> anyhow::Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;

        let mut tokens = HashMap::new();
        let mut health_urls = HashMap::new();
        for p in providers {
            if p.role == ProviderRole::Data {
                let path = p.health_path.as_deref().unwrap_or(DEFAULT_HEALTH_PATH);
                health_urls.insert(
                    p.name.clone(),
                    format!("{}{}", p.url.trim_end_matches('/'), path),
                );
            }
            let Some(env) = &p.auth_token_env else {
                continue;
            };
            match AppConfig::resolve_env(env) {
                Ok(token) => {
                    tokens.insert(p.name.clone(), SecretString::new(token));
                }
                Err(e) => warn!(provider = %p.name, error = %e, "Provider token unavailable"),
            }
        }

        Ok(Self {
            http,
            timeout,
            tokens,
            health_urls,
            next_id: AtomicU64::new(1),
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        provider: &Provider,
        method: &str,
        params: Value,
    ) -> Result<T, ArbiterError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let mut req = self.http.post(&provider.url).json(&body);
        if let Some(token) = self.tokens.get(&provider.name) {
            req = req.bearer_auth(token.expose_secret());
        }

        let resp = req.send().await.map_err(|e| self.request_error(provider, e))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ArbiterError::Transport {
                provider: provider.name.clone(),
                message: format!("HTTP {status}: {body}"),
            });
        }

        let envelope: RpcResponse<T> = resp
            .json()
            .await
            .map_err(|e| self.request_error(provider, e))?;
        debug!(provider = %provider.name, method, id, "RPC call completed");
        envelope.into_result(&provider.name)
    }

    async fn get_health(&self, provider: &Provider, url: &str) -> Result<(), ArbiterError> {
        let mut req = self.http.get(url);
        if let Some(token) = self.tokens.get(&provider.name) {
            req = req.bearer_auth(token.expose_secret());
        }
        let resp = req.send().await.map_err(|e| self.request_error(provider, e))?;
        if !resp.status().is_success() {
            return Err(ArbiterError::Transport {
                provider: provider.name.clone(),
                message: format!("health check HTTP {}", resp.status()),
            });
        }
        debug!(provider = %provider.name, url, "Health check passed");
        Ok(())
    }

    fn request_error(&self, provider: &Provider, e: reqwest::Error) -> ArbiterError {
        if e.is_timeout() {
            ArbiterError::Timeout {
                provider: provider.name.clone(),
                after_ms: self.timeout.as_millis() as u64,
            }
        } else {
            ArbiterError::Transport {
                provider: provider.name.clone(),
                message: e.to_string(),
            }
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn ping(&self, provider: &Provider) -> Result<(), ArbiterError> {
        if let Some(url) = self.health_urls.get(&provider.name) {
            return self.get_health(provider, url).await;
        }
        self.call::<Value>(provider, PING_METHOD, json!([])).await?;
        Ok(())
    }

    async fn submit(
        &self,
        provider: &Provider,
        plan: &TransactionPlan,
    ) -> Result<Settlement, ArbiterError> {
        self.call::<Settlement>(provider, SUBMIT_METHOD, json!([plan])).await
    }
}
