//! Back-end transport seam.
//!
//! The executor and the health-check loop only ever talk to providers
//! through `Transport`, so tests can substitute a scripted back end.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Provider;
use crate::types::{ArbiterError, LegSide, StrategyKind};

/// One step of an execution plan, executed in order by the back end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PlanStep {
    /// Borrow capital atomically (flash loan).
    Borrow { asset: String, amount: Decimal },
    /// Fill one priced leg at no worse than `limit_price`.
    Swap {
        venue: String,
        side: LegSide,
        asset: String,
        quantity: Decimal,
        limit_price: Decimal,
    },
    /// Repay a borrow plus its fee in the same transaction.
    Repay {
        asset: String,
        amount: Decimal,
        fee: Decimal,
    },
}

/// Ordered steps built from a Signal, submitted as one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionPlan {
    pub signal_id: Uuid,
    pub strategy: StrategyKind,
    pub steps: Vec<PlanStep>,
    /// Plan reverts if it cannot return at least this much.
    pub min_return: Decimal,
    pub deadline: DateTime<Utc>,
}

impl TransactionPlan {
    pub fn swap_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s, PlanStep::Swap { .. }))
            .count()
    }
}

/// What a back end reports after running a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settlement {
    /// Steps that settled, counted from the start of the plan.
    pub settled_steps: usize,
    pub total_steps: usize,
    pub realized_value: Decimal,
    pub realized_cost: Decimal,
    #[serde(default)]
    pub tx_ref: Option<String>,
}

impl Settlement {
    pub fn is_complete(&self) -> bool {
        self.total_steps > 0 && self.settled_steps >= self.total_steps
    }

    /// Some but not all steps settled.
    pub fn is_partial(&self) -> bool {
        self.settled_steps > 0 && self.settled_steps < self.total_steps
    }
}

/// Network access to one provider.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Cheap liveness probe used by the health-check loop.
    async fn ping(&self, provider: &Provider) -> Result<(), ArbiterError>;

    /// Submit a plan and wait for its settlement.
    async fn submit(
        &self,
        provider: &Provider,
        plan: &TransactionPlan,
    ) -> Result<Settlement, ArbiterError>;
}
