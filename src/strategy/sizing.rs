//! Fractional-capital position sizing.
//!
//! A position never commits more than a fixed fraction of available
//! capital, never exceeds what the opportunity can absorb, and is skipped
//! entirely below a minimum notional.

use rust_decimal::Decimal;
use tracing::debug;

/// Sizing configuration.
#[derive(Debug, Clone)]
pub struct SizingConfig {
    /// Maximum fraction of available capital per position.
    pub max_capital_fraction: Decimal,
    /// Positions below this notional are not worth executing.
    pub min_position: Decimal,
}

/// Size a position funded from own capital.
///
/// `required` is the notional the opportunity can absorb. Returns `None`
/// when the capped size falls below the minimum.
pub fn fractional_position(required: Decimal, available: Decimal, cfg: &SizingConfig) -> Option<Decimal> {
    if required <= Decimal::ZERO || available <= Decimal::ZERO {
        return None;
    }

    let budget = available * cfg.max_capital_fraction;
    let size = required.min(budget);

    if size < cfg.min_position {
        debug!(
            required = %required,
            budget = %budget,
            min = %cfg.min_position,
            "Position below minimum size"
        );
        return None;
    }
    Some(size)
}

/// Share of the opportunity captured at `size`, in [0, 1].
pub fn fill_ratio(size: Decimal, required: Decimal) -> Decimal {
    if required <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    (size / required).min(Decimal::ONE)
}
