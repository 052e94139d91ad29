//! The closed set of execution strategies.
//!
//! Each variant is a pure function from an opportunity (plus the capital
//! context) to feasibility and a risk-adjusted score. The orchestrator
//! dispatches over `StrategyKind::ALL`; nothing is looked up by name.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use super::scoring::risk_adjusted;
use super::sizing::{fill_ratio, fractional_position, SizingConfig};
use crate::config::StrategyConfig;
use crate::types::{Opportunity, StrategyKind};

const BPS: Decimal = dec!(10000);

/// Capital context for one evaluation, read from the risk snapshot.
#[derive(Debug, Clone, Copy)]
pub struct StrategyContext {
    pub available_capital: Decimal,
    /// Drawdown multiplier in [0, 1].
    pub risk_factor: Decimal,
}

/// A feasible way to execute an opportunity.
#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub kind: StrategyKind,
    pub position_size: Decimal,
    pub capital_at_risk: Decimal,
    pub expected_value: Decimal,
    pub expected_cost: Decimal,
    pub score: Decimal,
}

impl Assessment {
    pub fn expected_net(&self) -> Decimal {
        self.expected_value - self.expected_cost
    }
}

/// Assess one strategy. `None` means infeasible.
pub fn assess(
    kind: StrategyKind,
    opp: &Opportunity,
    ctx: &StrategyContext,
    cfg: &StrategyConfig,
) -> Option<Assessment> {
    let assessment = match kind {
        StrategyKind::DirectArbitrage => direct(opp, ctx, cfg)?,
        StrategyKind::FlashLoanArbitrage => flash_loan(opp, ctx, cfg)?,
    };
    if assessment.expected_net() < cfg.min_net_value {
        return None;
    }
    Some(assessment)
}

/// Own capital funds the buy legs; size is capped by a fraction of
/// available capital and economics scale with the fill.
fn direct(opp: &Opportunity, ctx: &StrategyContext, cfg: &StrategyConfig) -> Option<Assessment> {
    let required = opp.notional();
    let sizing = SizingConfig {
        max_capital_fraction: cfg.max_capital_fraction,
        min_position: cfg.min_position,
    };
    let size = fractional_position(required, ctx.available_capital, &sizing)?;
    let ratio = fill_ratio(size, required);

    let expected_value = opp.gross_value * ratio;
    let expected_cost = opp.estimated_cost * ratio;
    Some(Assessment {
        kind: StrategyKind::DirectArbitrage,
        position_size: size,
        capital_at_risk: size,
        expected_value,
        expected_cost,
        score: risk_adjusted(opp.confidence, expected_value - expected_cost, ctx.risk_factor),
    })
}

/// Borrowed capital funds the full buy side and is repaid in the same
/// transaction. Own capital at risk is the loan premium plus execution cost.
fn flash_loan(opp: &Opportunity, ctx: &StrategyContext, cfg: &StrategyConfig) -> Option<Assessment> {
    if !cfg.flash_loan_enabled {
        return None;
    }
    let size = opp.notional();
    if size < cfg.min_position {
        return None;
    }

    let premium = size * cfg.flash_loan_fee_bps / BPS;
    let expected_cost = opp.estimated_cost + premium;
    if expected_cost > ctx.available_capital {
        return None;
    }
    Some(Assessment {
        kind: StrategyKind::FlashLoanArbitrage,
        position_size: size,
        capital_at_risk: expected_cost,
        expected_value: opp.gross_value,
        expected_cost,
        score: risk_adjusted(opp.confidence, opp.gross_value - expected_cost, ctx.risk_factor),
    })
}

/// Highest score wins; ties go to the lowest expected cost.
pub fn select(assessments: Vec<Assessment>) -> Option<Assessment> {
    assessments.into_iter().max_by(|a, b| {
        a.score
            .cmp(&b.score)
            .then_with(|| b.expected_cost.cmp(&a.expected_cost))
    })
}
