//! Shared types for the ARBITER engine.
//!
//! These types form the data model passed between the scanner, the
//! orchestrator, the risk manager, the executor and the audit log. They
//! carry no behaviour beyond small derived quantities so that every
//! component can depend on them without circular references.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Provider roles
// ---------------------------------------------------------------------------

/// The job an interchangeable back-end endpoint performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderRole {
    /// Price/liquidity data (RPC nodes, quote APIs).
    Data,
    /// Transaction submission (direct signers, relays, bundlers).
    Execution,
}

impl ProviderRole {
    pub const ALL: &'static [ProviderRole] = &[ProviderRole::Data, ProviderRole::Execution];
}

impl fmt::Display for ProviderRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderRole::Data => write!(f, "data"),
            ProviderRole::Execution => write!(f, "execution"),
        }
    }
}

// ---------------------------------------------------------------------------
// Opportunity
// ---------------------------------------------------------------------------

/// Direction of a single leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LegSide {
    Buy,
    Sell,
}

impl fmt::Display for LegSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LegSide::Buy => write!(f, "BUY"),
            LegSide::Sell => write!(f, "SELL"),
        }
    }
}

/// One priced leg of an opportunity, in the engine's common unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricedLeg {
    pub venue: String,
    pub side: LegSide,
    /// Price per unit of the asset, normalised to the common quote unit.
    pub price: Decimal,
    /// Executable quantity at `price`.
    pub quantity: Decimal,
    /// Venue fee in basis points.
    pub fee_bps: Decimal,
}

impl PricedLeg {
    /// Notional value of the leg (price × quantity).
    pub fn notional(&self) -> Decimal {
        self.price * self.quantity
    }

    /// Fee charged by the venue on this leg.
    pub fn fee(&self) -> Decimal {
        self.notional() * self.fee_bps / Decimal::from(10_000)
    }
}

/// Deduplication key: the venue pair, the asset, and a rounded price bucket.
///
/// Two opportunities with the same key describe the same underlying
/// mispricing and must not both be live in the queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpportunityKey {
    pub buy_venue: String,
    pub sell_venue: String,
    pub asset: String,
    pub price_bucket: i64,
}

impl fmt::Display for OpportunityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}->{}@{}",
            self.asset, self.buy_venue, self.sell_venue, self.price_bucket
        )
    }
}

/// Immutable snapshot of a perishable candidate action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: Uuid,
    pub key: OpportunityKey,
    pub asset: String,
    /// Two or more priced legs.
    pub legs: Vec<PricedLeg>,
    /// Estimated value captured if every leg settles at its quoted price.
    pub gross_value: Decimal,
    /// Estimated fees and execution overhead.
    pub estimated_cost: Decimal,
    /// Confidence in [0, 1].
    pub confidence: Decimal,
    pub detected_at: DateTime<Utc>,
}

impl fmt::Display for Opportunity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] gross={:.4} cost={:.4} conf={:.0}% legs={}",
            self.key,
            self.gross_value,
            self.estimated_cost,
            self.confidence * Decimal::from(100),
            self.legs.len(),
        )
    }
}

impl Opportunity {
    /// Estimated value after costs.
    pub fn net_value(&self) -> Decimal {
        self.gross_value - self.estimated_cost
    }

    /// Capital needed to open the buy legs.
    pub fn notional(&self) -> Decimal {
        self.legs
            .iter()
            .filter(|l| l.side == LegSide::Buy)
            .map(PricedLeg::notional)
            .sum()
    }

    /// Venues involved, in leg order.
    pub fn sources(&self) -> Vec<&str> {
        self.legs.iter().map(|l| l.venue.as_str()).collect()
    }

    /// Age relative to `now`.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.detected_at
    }

    /// Whether the opportunity has outlived its time-to-live.
    pub fn is_expired(&self, ttl: std::time::Duration, now: DateTime<Utc>) -> bool {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365));
        self.age(now) > ttl
    }
}

// ---------------------------------------------------------------------------
// Strategies and signals
// ---------------------------------------------------------------------------

/// The closed set of execution strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Both legs funded from the engine's own capital.
    DirectArbitrage,
    /// Buy leg funded by an atomic borrow repaid in the same transaction.
    FlashLoanArbitrage,
}

impl StrategyKind {
    pub const ALL: &'static [StrategyKind] =
        &[StrategyKind::DirectArbitrage, StrategyKind::FlashLoanArbitrage];

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::DirectArbitrage => "direct_arbitrage",
            StrategyKind::FlashLoanArbitrage => "flash_loan_arbitrage",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An opportunity paired with a chosen strategy and a proposed size.
///
/// Immutable once the risk manager approves it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: Uuid,
    /// The opportunity this signal was derived from.
    pub opportunity: Opportunity,
    pub strategy: StrategyKind,
    /// Risk-adjusted score from the orchestrator.
    pub score: Decimal,
    /// Notional size of the position.
    pub position_size: Decimal,
    /// Own capital lost if every leg fails to recover (fees, borrowed-capital premium).
    pub capital_at_risk: Decimal,
    /// Expected gross value at `position_size`.
    pub expected_value: Decimal,
    /// Expected total cost at `position_size`.
    pub expected_cost: Decimal,
    pub created_at: DateTime<Utc>,
}

impl Signal {
    pub fn opportunity_id(&self) -> Uuid {
        self.opportunity.id
    }

    pub fn asset(&self) -> &str {
        &self.opportunity.asset
    }

    pub fn expected_net(&self) -> Decimal {
        self.expected_value - self.expected_cost
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} size={:.4} score={:.4} net={:.4}",
            self.strategy,
            self.opportunity.key,
            self.position_size,
            self.score,
            self.expected_net(),
        )
    }
}

/// Why an opportunity did not become an approved signal.
///
/// Rejections are expected control flow, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Expired,
    NonPositiveScore,
    NoFeasibleStrategy,
    Halted,
    ConcentrationCap,
    MaxPositionSize,
    Invariant,
}

impl RejectReason {
    pub const ALL: &'static [RejectReason] = &[
        RejectReason::Expired,
        RejectReason::NonPositiveScore,
        RejectReason::NoFeasibleStrategy,
        RejectReason::Halted,
        RejectReason::ConcentrationCap,
        RejectReason::MaxPositionSize,
        RejectReason::Invariant,
    ];

    /// Stable reason code for logs and counters.
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::Expired => "expired",
            RejectReason::NonPositiveScore => "non_positive_score",
            RejectReason::NoFeasibleStrategy => "no_feasible_strategy",
            RejectReason::Halted => "halted",
            RejectReason::ConcentrationCap => "concentration_cap",
            RejectReason::MaxPositionSize => "max_position_size",
            RejectReason::Invariant => "invariant",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

// ---------------------------------------------------------------------------
// Execution results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    /// Only produced when the back end supports partial settlement accounting.
    Partial,
    Failed,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStatus::Success => write!(f, "SUCCESS"),
            ExecutionStatus::Partial => write!(f, "PARTIAL"),
            ExecutionStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Outcome of executing one signal. Exactly one per signal.
///
/// Amounts serialise as strings so that replaying the audit log
/// reproduces the live risk state exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub signal_id: Uuid,
    pub opportunity_id: Uuid,
    pub asset: String,
    pub strategy: StrategyKind,
    pub status: ExecutionStatus,
    #[serde(with = "rust_decimal::serde::str")]
    pub position_size: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub capital_at_risk: Decimal,
    /// Realised gross value (the realised delta for partial settlements).
    #[serde(with = "rust_decimal::serde::str")]
    pub realized_profit: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub realized_cost: Decimal,
    /// Provider of the final attempt, if any attempt was made.
    pub provider: Option<String>,
    pub attempts: u32,
    pub latency_ms: u64,
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl ExecutionResult {
    /// Realised profit and loss.
    pub fn net_pnl(&self) -> Decimal {
        self.realized_profit - self.realized_cost
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }
}

impl fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} pnl={:.4} via {} ({} attempts, {}ms)",
            self.status,
            self.strategy,
            self.asset,
            self.net_pnl(),
            self.provider.as_deref().unwrap_or("-"),
            self.attempts,
            self.latency_ms,
        )
    }
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

/// Why the circuit breaker tripped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "trigger", rename_all = "snake_case")]
pub enum HaltReason {
    Drawdown {
        #[serde(with = "rust_decimal::serde::str")]
        drawdown: Decimal,
        #[serde(with = "rust_decimal::serde::str")]
        limit: Decimal,
    },
    DailyLoss {
        #[serde(with = "rust_decimal::serde::str")]
        loss: Decimal,
        #[serde(with = "rust_decimal::serde::str")]
        limit: Decimal,
    },
    ConsecutiveFailures { count: u32, limit: u32 },
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HaltReason::Drawdown { drawdown, limit } => write!(
                f,
                "drawdown {:.2}% exceeds {:.2}%",
                drawdown * Decimal::from(100),
                limit * Decimal::from(100)
            ),
            HaltReason::DailyLoss { loss, limit } => {
                write!(f, "daily loss {loss:.4} exceeds {limit:.4}")
            }
            HaltReason::ConsecutiveFailures { count, limit } => {
                write!(f, "{count} consecutive failures (limit {limit})")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain-specific error types for ARBITER.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ArbiterError {
    #[error("No healthy {role} provider available")]
    NotAvailable { role: ProviderRole },

    #[error("Transport error ({provider}): {message}")]
    Transport { provider: String, message: String },

    #[error("Timed out after {after_ms}ms ({provider})")]
    Timeout { provider: String, after_ms: u64 },

    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("Invalid settings: {0}")]
    Settings(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl ArbiterError {
    /// Transient I/O errors are retried within the component's own budget.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ArbiterError::Transport { .. } | ArbiterError::Timeout { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
