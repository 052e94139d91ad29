//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Secrets (provider auth tokens, the control reset token) are referenced
//! by env-var name in the config and resolved at runtime via `std::env::var`.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::fs;
use std::time::Duration;

use crate::types::{ArbiterError, ProviderRole};

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub registry: RegistryConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    pub strategy: StrategyConfig,
    pub risk: RiskConfig,
    pub executor: ExecutorConfig,
    pub audit: AuditConfig,
    pub control: ControlConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    pub name: String,
    /// Capital available at the start of the audit history.
    pub starting_capital: Decimal,
    pub orchestrator_workers: usize,
    pub executor_workers: usize,
    /// Capacity of the approved-signal channel between the pools.
    #[serde(default = "default_signal_buffer")]
    pub signal_buffer: usize,
}

fn default_signal_buffer() -> usize {
    64
}

#[derive(Debug, Deserialize, Clone)]
pub struct RegistryConfig {
    pub health_check_interval_secs: u64,
    /// Consecutive failures before a provider is demoted.
    pub failure_threshold: u32,
    /// Minimum time a demoted provider sits out before a health check may promote it.
    pub cooldown_secs: u64,
    pub ping_timeout_ms: u64,
}

impl RegistryConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: 30,
            failure_threshold: 5,
            cooldown_secs: 60,
            ping_timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    pub name: String,
    pub url: String,
    pub role: ProviderRole,
    /// Lower is preferred.
    pub priority: u32,
    /// Env var holding a bearer token for this endpoint, if it needs one.
    #[serde(default)]
    pub auth_token_env: Option<String>,
    /// Path the health check GETs on a data provider.
    /// Execution providers are pinged over JSON-RPC instead.
    #[serde(default)]
    pub health_path: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScannerConfig {
    pub poll_interval_ms: u64,
    pub poll_timeout_ms: u64,
    /// Opportunities below this confidence are dropped before queueing.
    pub confidence_floor: Decimal,
    pub debounce_ms: u64,
    /// Width of a dedup price bucket, in the common quote unit.
    pub price_bucket: Decimal,
    pub queue_capacity: usize,
    pub opportunity_ttl_ms: u64,
    /// Quotes older than this are ignored when pairing venues.
    pub quote_max_age_ms: u64,
    /// Flat per-opportunity execution overhead added to venue fees.
    #[serde(default)]
    pub execution_overhead: Decimal,
    /// Opportunities retained for `GET /opportunities`.
    #[serde(default = "default_recent_opportunities")]
    pub recent_opportunities: usize,
}

fn default_recent_opportunities() -> usize {
    100
}

impl ScannerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn opportunity_ttl(&self) -> Duration {
        Duration::from_millis(self.opportunity_ttl_ms)
    }

    pub fn quote_max_age(&self) -> Duration {
        Duration::from_millis(self.quote_max_age_ms)
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            poll_timeout_ms: 1_500,
            confidence_floor: dec!(0.5),
            debounce_ms: 200,
            price_bucket: dec!(0.5),
            queue_capacity: 256,
            opportunity_ttl_ms: 3_000,
            quote_max_age_ms: 2_000,
            execution_overhead: Decimal::ZERO,
            recent_opportunities: 100,
        }
    }
}

/// One external price source polled by its own scanner task.
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub name: String,
    /// Path appended to the data provider URL (e.g. `/v1/quotes`).
    pub path: String,
    pub pairs: Vec<String>,
    /// Venue fee in basis points applied to every quote from this source.
    #[serde(default)]
    pub fee_bps: Decimal,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StrategyConfig {
    /// Opportunities must clear this net value after strategy costs.
    pub min_net_value: Decimal,
    /// Maximum fraction of available capital committed to one direct position.
    pub max_capital_fraction: Decimal,
    /// Positions below this notional are not worth executing.
    pub min_position: Decimal,
    pub flash_loan_enabled: bool,
    pub flash_loan_fee_bps: Decimal,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            min_net_value: dec!(0.01),
            max_capital_fraction: dec!(0.25),
            min_position: dec!(1),
            flash_loan_enabled: true,
            flash_loan_fee_bps: dec!(9),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RiskConfig {
    /// Halt when drawdown from peak equity exceeds this fraction.
    pub max_drawdown_pct: Decimal,
    /// Halt when the current window's realised loss exceeds this amount.
    pub daily_loss_limit: Decimal,
    /// Halt after this many consecutive failed executions.
    pub max_consecutive_failures: u32,
    /// Largest notional position allowed for a single signal.
    pub max_position_size: Decimal,
    /// Largest share of available capital at risk in a single asset.
    pub concentration_cap: Decimal,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_drawdown_pct: dec!(0.20),
            daily_loss_limit: dec!(1000),
            max_consecutive_failures: 3,
            max_position_size: dec!(100000),
            concentration_cap: dec!(0.25),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExecutorConfig {
    pub max_attempts: u32,
    pub attempt_timeout_ms: u64,
    /// Whether the back ends account for partially settled plans.
    #[serde(default)]
    pub supports_partial: bool,
    /// Settle plans at their estimates without contacting any back end.
    #[serde(default)]
    pub dry_run: bool,
}

impl ExecutorConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout_ms: 5_000,
            supports_partial: false,
            dry_run: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuditConfig {
    /// SQLite URL, e.g. `sqlite://arbiter_audit.db`.
    pub database_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ControlConfig {
    pub enabled: bool,
    pub port: u16,
    /// Env var holding the bearer token required by `POST /reset-halt` and `POST /settings`.
    pub reset_token_env: Option<String>,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::from_toml(&contents).with_context(|| format!("Invalid config file: {path}"))
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: AppConfig =
            toml::from_str(contents).context("Failed to parse configuration TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the engine unsafe or inert.
    pub fn validate(&self) -> Result<(), ArbiterError> {
        let fail = |msg: String| Err(ArbiterError::Config(msg));
        let unit = |v: Decimal| v > Decimal::ZERO && v <= Decimal::ONE;

        if self.engine.starting_capital <= Decimal::ZERO {
            return fail("engine.starting_capital must be positive".into());
        }
        if self.engine.orchestrator_workers == 0 || self.engine.executor_workers == 0 {
            return fail("worker pools must have at least one worker".into());
        }
        if self.engine.signal_buffer == 0 || self.scanner.queue_capacity == 0 {
            return fail("queue capacities must be positive".into());
        }
        if self.registry.failure_threshold == 0 {
            return fail("registry.failure_threshold must be at least 1".into());
        }
        if self.executor.max_attempts == 0 {
            return fail("executor.max_attempts must be at least 1".into());
        }
        if self.scanner.confidence_floor < Decimal::ZERO
            || self.scanner.confidence_floor > Decimal::ONE
        {
            return fail("scanner.confidence_floor must be within [0, 1]".into());
        }
        if self.scanner.price_bucket <= Decimal::ZERO {
            return fail("scanner.price_bucket must be positive".into());
        }
        if !unit(self.risk.max_drawdown_pct) || !unit(self.risk.concentration_cap) {
            return fail("risk percentages must be within (0, 1]".into());
        }
        if !unit(self.strategy.max_capital_fraction) {
            return fail("strategy.max_capital_fraction must be within (0, 1]".into());
        }
        if self.risk.max_consecutive_failures == 0 {
            return fail("risk.max_consecutive_failures must be at least 1".into());
        }
        if !self.executor.dry_run
            && !self
                .providers
                .iter()
                .any(|p| p.role == ProviderRole::Execution)
        {
            return fail("at least one execution provider is required".into());
        }
        let mut names: Vec<&str> = self.providers.iter().map(|p| p.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.providers.len() {
            return fail("provider names must be unique".into());
        }
        Ok(())
    }

    /// Resolve an environment variable name to its value.
    /// Useful for loading secrets referenced in the config.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }
}
