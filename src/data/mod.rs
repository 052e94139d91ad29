//! External price sources.
//!
//! Defines the `PriceSource` trait polled by the scanner, the raw quote
//! shape sources return, and normalisation into the common quote unit.

pub mod http;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::ArbiterError;

/// A quote as reported by a source, in the source's own fixed-point units.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawQuote {
    /// Asset symbol, e.g. `ETH`.
    pub pair: String,
    /// Price scaled by `10^decimals`.
    pub price: Decimal,
    #[serde(default)]
    pub decimals: u32,
    /// Executable quantity at `price`, in asset units.
    pub liquidity: Decimal,
}

/// A normalised quote from one venue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Quote {
    pub venue: String,
    pub asset: String,
    pub price: Decimal,
    pub liquidity: Decimal,
    pub fee_bps: Decimal,
    pub observed_at: DateTime<Utc>,
}

impl RawQuote {
    /// Convert to the common unit. Returns `None` for quotes that cannot be
    /// traded (non-positive price or liquidity, or an unrepresentable scale).
    pub fn normalise(&self, venue: &str, fee_bps: Decimal, observed_at: DateTime<Utc>) -> Option<Quote> {
        if self.price <= Decimal::ZERO || self.liquidity <= Decimal::ZERO {
            return None;
        }
        let mut price = self.price;
        price.set_scale(price.scale() + self.decimals).ok()?;

        Some(Quote {
            venue: venue.to_string(),
            asset: self.pair.to_uppercase(),
            price: price.normalize(),
            liquidity: self.liquidity,
            fee_bps,
            observed_at,
        })
    }
}

/// A venue the scanner polls for quotes.
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Venue name, used as the leg venue in opportunities.
    fn name(&self) -> &str;

    /// Fee charged by the venue, in basis points.
    fn fee_bps(&self) -> Decimal;

    /// Fetch the latest quotes for every pair this source covers.
    async fn fetch_quotes(&self) -> Result<Vec<RawQuote>, ArbiterError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn raw(price: Decimal, decimals: u32, liquidity: Decimal) -> RawQuote {
        RawQuote { pair: "eth".into(), price, decimals, liquidity }
    }

    #[test]
    fn test_normalise_fixed_point() {
        let q = raw(dec!(200012), 2, dec!(4))
            .normalise("venue-a", dec!(30), Utc::now())
            .unwrap();
        assert_eq!(q.price, dec!(2000.12));
        assert_eq!(q.asset, "ETH");
        assert_eq!(q.venue, "venue-a");
        assert_eq!(q.fee_bps, dec!(30));
    }

    #[test]
    fn test_normalise_unscaled() {
        let q = raw(dec!(2000.5), 0, dec!(1)).normalise("v", dec!(0), Utc::now()).unwrap();
        assert_eq!(q.price, dec!(2000.5));
    }

    #[test]
    fn test_normalise_rejects_untradeable() {
        assert!(raw(dec!(0), 0, dec!(1)).normalise("v", dec!(0), Utc::now()).is_none());
        assert!(raw(dec!(10), 0, dec!(0)).normalise("v", dec!(0), Utc::now()).is_none());
        assert!(raw(dec!(10), 40, dec!(1)).normalise("v", dec!(0), Utc::now()).is_none());
    }
}
