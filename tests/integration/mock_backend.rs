//! Scripted back ends for integration testing.
//!
//! Deterministic `Transport` and `PriceSource` implementations that keep
//! everything in memory. Behaviour is set per provider from test code.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

use arbiter::config::AppConfig;
use arbiter::data::{PriceSource, RawQuote};
use arbiter::engine::{Engine, Pipeline};
use arbiter::providers::{Provider, ProviderRegistry, Settlement, TransactionPlan, Transport};
use arbiter::storage::AuditLog;
use arbiter::types::{ArbiterError, LegSide, Opportunity, OpportunityKey, PricedLeg};

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// What a scripted provider does with a submitted plan.
#[derive(Debug, Clone)]
pub enum Behaviour {
    /// Every step settles with the given value and cost.
    Settle { value: Decimal, cost: Decimal },
    /// Settles like `Settle`, after holding the submission for `delay`.
    Slow { delay: Duration, value: Decimal, cost: Decimal },
    /// The plan reverts; only the cost is paid.
    Revert { cost: Decimal },
    /// The provider cannot be reached.
    Down,
}

pub struct ScriptedTransport {
    default: Mutex<Behaviour>,
    overrides: Mutex<HashMap<String, Behaviour>>,
    /// One-shot behaviours consumed by the next submissions, in order.
    script: Mutex<VecDeque<Behaviour>>,
    submissions: Mutex<Vec<(String, Uuid)>>,
}

impl ScriptedTransport {
    pub fn new(default: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            default: Mutex::new(default),
            overrides: Mutex::new(HashMap::new()),
            script: Mutex::new(VecDeque::new()),
            submissions: Mutex::new(Vec::new()),
        })
    }

    pub fn set_default(&self, behaviour: Behaviour) {
        *self.default.lock().unwrap() = behaviour;
    }

    pub fn set(&self, provider: &str, behaviour: Behaviour) {
        self.overrides
            .lock()
            .unwrap()
            .insert(provider.to_string(), behaviour);
    }

    /// Use `behaviour` for the next submission only, whichever provider gets it.
    pub fn then(&self, behaviour: Behaviour) {
        self.script.lock().unwrap().push_back(behaviour);
    }

    /// (provider, signal id) for every submission, in order.
    pub fn submissions(&self) -> Vec<(String, Uuid)> {
        self.submissions.lock().unwrap().clone()
    }

    fn behaviour(&self, provider: &str) -> Behaviour {
        self.overrides
            .lock()
            .unwrap()
            .get(provider)
            .cloned()
            .unwrap_or_else(|| self.default.lock().unwrap().clone())
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn ping(&self, provider: &Provider) -> Result<(), ArbiterError> {
        match self.behaviour(&provider.name) {
            Behaviour::Down => Err(ArbiterError::Transport {
                provider: provider.name.clone(),
                message: "connection refused".into(),
            }),
            _ => Ok(()),
        }
    }

    async fn submit(&self, provider: &Provider, plan: &TransactionPlan) -> Result<Settlement, ArbiterError> {
        self.submissions
            .lock()
            .unwrap()
            .push((provider.name.clone(), plan.signal_id));

        let scripted = self.script.lock().unwrap().pop_front();
        let behaviour = scripted.unwrap_or_else(|| self.behaviour(&provider.name));

        let total = plan.steps.len();
        match behaviour {
            Behaviour::Slow { delay, value, cost } => {
                tokio::time::sleep(delay).await;
                Ok(Settlement {
                    settled_steps: total,
                    total_steps: total,
                    realized_value: value,
                    realized_cost: cost,
                    tx_ref: Some(format!("0x{}", plan.signal_id.simple())),
                })
            }
            Behaviour::Settle { value, cost } => Ok(Settlement {
                settled_steps: total,
                total_steps: total,
                realized_value: value,
                realized_cost: cost,
                tx_ref: Some(format!("0x{}", plan.signal_id.simple())),
            }),
            Behaviour::Revert { cost } => Ok(Settlement {
                settled_steps: 0,
                total_steps: total,
                realized_value: Decimal::ZERO,
                realized_cost: cost,
                tx_ref: None,
            }),
            Behaviour::Down => Err(ArbiterError::Transport {
                provider: provider.name.clone(),
                message: "connection refused".into(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Price source
// ---------------------------------------------------------------------------

pub struct ScriptedSource {
    name: String,
    fee_bps: Decimal,
    quotes: Mutex<Vec<RawQuote>>,
}

impl ScriptedSource {
    pub fn new(name: &str, fee_bps: Decimal) -> Self {
        Self {
            name: name.to_string(),
            fee_bps,
            quotes: Mutex::new(Vec::new()),
        }
    }

    pub fn quote(&self, pair: &str, price: Decimal, liquidity: Decimal) {
        *self.quotes.lock().unwrap() = vec![RawQuote {
            pair: pair.to_string(),
            price,
            decimals: 0,
            liquidity,
        }];
    }
}

#[async_trait]
impl PriceSource for ScriptedSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn fee_bps(&self) -> Decimal {
        self.fee_bps
    }

    async fn fetch_quotes(&self) -> Result<Vec<RawQuote>, ArbiterError> {
        Ok(self.quotes.lock().unwrap().clone())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// A complete configuration with two execution relays.
pub fn config(failure_threshold: u32) -> AppConfig {
    let toml = format!(
        r#"
[engine]
name = "ARBITER-TEST"
starting_capital = 100000
orchestrator_workers = 2
executor_workers = 2
signal_buffer = 8

[registry]
health_check_interval_secs = 30
failure_threshold = {failure_threshold}
cooldown_secs = 60
ping_timeout_ms = 500

[[providers]]
name = "node-a"
url = "http://node-a.test"
role = "data"
priority = 1

[[providers]]
name = "relay-a"
url = "http://relay-a.test"
role = "execution"
priority = 1

[[providers]]
name = "relay-b"
url = "http://relay-b.test"
role = "execution"
priority = 2

[scanner]
poll_interval_ms = 100
poll_timeout_ms = 500
confidence_floor = 0.5
debounce_ms = 200
price_bucket = 0.5
queue_capacity = 16
opportunity_ttl_ms = 3000
quote_max_age_ms = 2000

[strategy]
min_net_value = 1
max_capital_fraction = 0.25
min_position = 10
flash_loan_enabled = true
flash_loan_fee_bps = 9

[risk]
max_drawdown_pct = 0.2
daily_loss_limit = 5000
max_consecutive_failures = 3
max_position_size = 50000
concentration_cap = 0.25

[executor]
max_attempts = 3
attempt_timeout_ms = 1000

[audit]
database_url = "sqlite::memory:"

[control]
enabled = false
port = 0
"#
    );
    AppConfig::from_toml(&toml).expect("test config is valid")
}

pub async fn engine(config: &AppConfig, transport: Arc<ScriptedTransport>) -> (Arc<Engine>, AuditLog) {
    let registry = Arc::new(ProviderRegistry::new(&config.providers, config.registry.clone()));
    let audit = AuditLog::open(&config.audit.database_url).await.unwrap();
    let engine = Engine::build(config, registry, transport, audit.clone()).unwrap();
    (Arc::new(engine), audit)
}

/// A running pipeline with its shutdown switch.
pub struct Running {
    shutdown: watch::Sender<bool>,
    pipeline: Pipeline,
}

impl Running {
    pub fn start(engine: &Arc<Engine>) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let pipeline = engine.start(Vec::new(), rx);
        Self { shutdown, pipeline }
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        tokio::time::timeout(Duration::from_secs(5), self.pipeline.join())
            .await
            .expect("pipeline stops within 5s");
    }
}

/// Poll `cond` until it holds, failing the test after five seconds.
pub async fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A two-leg ETH opportunity: buy `quantity` at 2000, sell at 2100.
pub fn opportunity(bucket: i64, quantity: Decimal, gross: Decimal, cost: Decimal, confidence: Decimal) -> Opportunity {
    Opportunity {
        id: Uuid::new_v4(),
        key: OpportunityKey {
            buy_venue: "venue-a".into(),
            sell_venue: "venue-b".into(),
            asset: "ETH".into(),
            price_bucket: bucket,
        },
        asset: "ETH".into(),
        legs: vec![
            PricedLeg {
                venue: "venue-a".into(),
                side: LegSide::Buy,
                price: dec!(2000),
                quantity,
                fee_bps: Decimal::ZERO,
            },
            PricedLeg {
                venue: "venue-b".into(),
                side: LegSide::Sell,
                price: dec!(2100),
                quantity,
                fee_bps: Decimal::ZERO,
            },
        ],
        gross_value: gross,
        estimated_cost: cost,
        confidence,
        detected_at: Utc::now(),
    }
}
