//! Strategy engine: scoring, strategy selection, sizing and the risk gate.

pub mod risk;
pub mod scoring;
pub mod sizing;
pub mod strategies;

use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::StrategyConfig;
use crate::settings::Settings;
use crate::types::{Opportunity, OpportunityKey, RejectReason, Signal, StrategyKind};
use risk::RiskManager;
use strategies::{Assessment, StrategyContext};

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

/// Result of evaluating one opportunity.
#[derive(Debug, Clone)]
pub enum Decision {
    /// Approved by the risk gate and ready for execution.
    Approved(Signal),
    /// Passed on, with the reason code.
    Rejected {
        opportunity_id: Uuid,
        key: OpportunityKey,
        reason: RejectReason,
    },
}

impl Decision {
    pub fn is_approved(&self) -> bool {
        matches!(self, Decision::Approved(_))
    }
}

/// Orchestrator counters exposed in `GET /status`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OrchestratorStats {
    pub evaluated: u64,
    pub approved: u64,
    pub rejected: BTreeMap<&'static str, u64>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Turns opportunities into approved signals.
///
/// Holds no per-opportunity state between calls, so many `evaluate` calls
/// can run concurrently. The only shared inputs are the risk snapshot and
/// the tunables, both read without blocking; the final gate goes through
/// the risk manager's writer.
pub struct StrategyOrchestrator {
    config: StrategyConfig,
    opportunity_ttl: Duration,
    settings: Arc<Settings>,
    risk: Arc<RiskManager>,
    stats: Mutex<OrchestratorStats>,
}

impl StrategyOrchestrator {
    pub fn new(
        config: StrategyConfig,
        opportunity_ttl: Duration,
        settings: Arc<Settings>,
        risk: Arc<RiskManager>,
    ) -> Self {
        Self {
            config,
            opportunity_ttl,
            settings,
            risk,
            stats: Mutex::new(OrchestratorStats::default()),
        }
    }

    /// Evaluate one opportunity:
    /// 1. Structural and freshness checks.
    /// 2. Base score `confidence × (gross − cost)` must be positive.
    /// 3. Risk snapshot: halted opportunities stop here; otherwise the
    ///    drawdown factor and available capital feed the strategies.
    /// 4. Assess every strategy and keep the best feasible one.
    /// 5. Risk gate (`approve`), which also reserves exposure.
    pub fn evaluate(&self, opp: &Opportunity) -> Decision {
        let decision = match self.assess(opp) {
            Ok(best) => self.gate(opp, best),
            Err(reason) => self.reject(opp, reason),
        };
        self.count(&decision);
        decision
    }

    fn assess(&self, opp: &Opportunity) -> Result<Assessment, RejectReason> {
        if opp.legs.len() < 2 {
            error!(opportunity_id = %opp.id, legs = opp.legs.len(), "Opportunity with fewer than two legs");
            return Err(RejectReason::Invariant);
        }
        if opp.is_expired(self.opportunity_ttl, Utc::now()) {
            return Err(RejectReason::Expired);
        }
        if scoring::base_score(opp) <= Decimal::ZERO {
            return Err(RejectReason::NonPositiveScore);
        }

        let state = self.risk.snapshot();
        if state.is_halted() {
            return Err(RejectReason::Halted);
        }
        let ctx = StrategyContext {
            available_capital: state.available_capital(),
            risk_factor: scoring::drawdown_factor(state.drawdown(), self.settings.max_drawdown_pct()),
        };

        let feasible: Vec<Assessment> = StrategyKind::ALL
            .iter()
            .filter_map(|kind| strategies::assess(*kind, opp, &ctx, &self.config))
            .collect();
        let best = strategies::select(feasible).ok_or(RejectReason::NoFeasibleStrategy)?;
        if best.score <= Decimal::ZERO {
            return Err(RejectReason::NonPositiveScore);
        }
        Ok(best)
    }

    fn gate(&self, opp: &Opportunity, best: Assessment) -> Decision {
        let signal = Signal {
            id: Uuid::new_v4(),
            opportunity: opp.clone(),
            strategy: best.kind,
            score: best.score,
            position_size: best.position_size,
            capital_at_risk: best.capital_at_risk,
            expected_value: best.expected_value,
            expected_cost: best.expected_cost,
            created_at: Utc::now(),
        };

        match self.risk.approve(&signal) {
            Ok(()) => {
                info!(
                    signal_id = %signal.id,
                    key = %opp.key,
                    strategy = %signal.strategy,
                    size = %signal.position_size,
                    score = %signal.score.round_dp(4),
                    net = %signal.expected_net().round_dp(4),
                    "Signal approved"
                );
                Decision::Approved(signal)
            }
            Err(reason) => self.reject(opp, reason),
        }
    }

    fn reject(&self, opp: &Opportunity, reason: RejectReason) -> Decision {
        debug!(
            opportunity_id = %opp.id,
            key = %opp.key,
            reason = reason.code(),
            "Opportunity rejected"
        );
        Decision::Rejected {
            opportunity_id: opp.id,
            key: opp.key.clone(),
            reason,
        }
    }

    fn count(&self, decision: &Decision) {
        let mut stats = self.stats.lock();
        stats.evaluated += 1;
        match decision {
            Decision::Approved(_) => stats.approved += 1,
            Decision::Rejected { reason, .. } => *stats.rejected.entry(reason.code()).or_default() += 1,
        }
    }

    pub fn stats(&self) -> OrchestratorStats {
        self.stats.lock().clone()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
