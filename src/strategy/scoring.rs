//! Scoring functions.
//!
//! Pure and deterministic: `confidence × (gross − cost)`, scaled down as
//! drawdown approaches its ceiling.

use rust_decimal::Decimal;

use crate::types::Opportunity;

/// Confidence-weighted expected value of an opportunity.
pub fn base_score(opp: &Opportunity) -> Decimal {
    opp.confidence * (opp.gross_value - opp.estimated_cost)
}

/// `1 − drawdown / max_drawdown`, clamped to [0, 1].
pub fn drawdown_factor(drawdown: Decimal, max_drawdown: Decimal) -> Decimal {
    if max_drawdown <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    (Decimal::ONE - drawdown / max_drawdown).clamp(Decimal::ZERO, Decimal::ONE)
}

/// Score of a strategy assessment: confidence × net value × risk factor.
pub fn risk_adjusted(confidence: Decimal, net_value: Decimal, factor: Decimal) -> Decimal {
    confidence * net_value * factor
}
