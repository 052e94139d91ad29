//! HTTP quote source served by the registry's data providers.
//!
//! Each request goes to the best healthy data provider at call time and
//! its outcome is reported back, so a failing node is demoted and the next
//! poll transparently moves to the next one.

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use super::{PriceSource, RawQuote};
use crate::config::SourceConfig;
use crate::providers::ProviderRegistry;
use crate::types::{ArbiterError, ProviderRole};

#[derive(Debug, Deserialize)]
struct QuotesResponse {
    quotes: Vec<RawQuote>,
}

pub struct HttpPriceSource {
    config: SourceConfig,
    registry: Arc<ProviderRegistry>,
    http: Client,
    timeout: Duration,
}

impl HttpPriceSource {
    pub fn new(config: SourceConfig, registry: Arc<ProviderRegistry>, timeout: Duration) -> anyhow::Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            config,
            registry,
            http,
            timeout,
        })
    }

    fn quotes_url(&self, base: &str) -> String {
        format!(
            "{}{}?pairs={}",
            base.trim_end_matches('/'),
            self.config.path,
            urlencoding::encode(&self.config.pairs.join(","))
        )
    }

    async fn get(&self, url: &str, provider: &str) -> Result<Vec<RawQuote>, ArbiterError> {
        let resp = self.http.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                ArbiterError::Timeout {
                    provider: provider.to_string(),
                    after_ms: self.timeout.as_millis() as u64,
                }
            } else {
                ArbiterError::Transport {
                    provider: provider.to_string(),
                    message: e.to_string(),
                }
            }
        })?;

        if !resp.status().is_success() {
            return Err(ArbiterError::Transport {
                provider: provider.to_string(),
                message: format!("HTTP {}", resp.status()),
            });
        }

        let body: QuotesResponse = resp.json().await.map_err(|e| ArbiterError::Transport {
            provider: provider.to_string(),
            message: format!("malformed quotes: {e}"),
        })?;
        Ok(body.quotes)
    }
}

#[async_trait]
impl PriceSource for HttpPriceSource {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn fee_bps(&self) -> Decimal {
        self.config.fee_bps
    }

    async fn fetch_quotes(&self) -> Result<Vec<RawQuote>, ArbiterError> {
        let provider = self.registry.best(ProviderRole::Data)?;
        let url = self.quotes_url(&provider.url);

        let started = Instant::now();
        let result = self.get(&url, &provider.name).await;
        let latency = started.elapsed();

        match &result {
            Ok(quotes) => {
                self.registry.report(&provider.name, true, latency);
                debug!(
                    source = %self.config.name,
                    provider = %provider.name,
                    quotes = quotes.len(),
                    "Quotes fetched"
                );
            }
            Err(e) => {
                self.registry
                    .report_outcome(&provider.name, false, latency, Some(&e.to_string()));
            }
        }
        result
    }
}
