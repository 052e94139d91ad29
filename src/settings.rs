//! Runtime-tunable thresholds.
//!
//! The control surface may tighten or loosen a small set of thresholds
//! while the engine runs. Every update is validated against hard-coded
//! safety bounds before it is published; readers on the hot path load
//! the current values from an atomically swapped snapshot.

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::config::{RiskConfig, ScannerConfig};
use crate::types::ArbiterError;

/// Lowest confidence floor the scanner may be configured with.
pub const MIN_CONFIDENCE_FLOOR: Decimal = dec!(0.10);

/// Largest share of capital that may sit in one asset.
pub const MAX_CONCENTRATION_CAP: Decimal = dec!(0.50);

/// Largest drawdown tolerated before the breaker must trip.
pub const MAX_DRAWDOWN_CEILING: Decimal = dec!(0.50);

/// Current values of the tunable thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tunables {
    pub confidence_floor: Decimal,
    pub concentration_cap: Decimal,
    pub max_drawdown_pct: Decimal,
}

impl Tunables {
    pub fn from_config(scanner: &ScannerConfig, risk: &RiskConfig) -> Self {
        Self {
            confidence_floor: scanner.confidence_floor,
            concentration_cap: risk.concentration_cap,
            max_drawdown_pct: risk.max_drawdown_pct,
        }
    }

    fn validate(&self) -> Result<(), ArbiterError> {
        if self.confidence_floor < MIN_CONFIDENCE_FLOOR || self.confidence_floor > Decimal::ONE {
            return Err(ArbiterError::Settings(format!(
                "confidence_floor must be within [{MIN_CONFIDENCE_FLOOR}, 1], got {}",
                self.confidence_floor
            )));
        }
        if self.concentration_cap <= Decimal::ZERO || self.concentration_cap > MAX_CONCENTRATION_CAP
        {
            return Err(ArbiterError::Settings(format!(
                "concentration_cap must be within (0, {MAX_CONCENTRATION_CAP}], got {}",
                self.concentration_cap
            )));
        }
        if self.max_drawdown_pct <= Decimal::ZERO || self.max_drawdown_pct > MAX_DRAWDOWN_CEILING {
            return Err(ArbiterError::Settings(format!(
                "max_drawdown_pct must be within (0, {MAX_DRAWDOWN_CEILING}], got {}",
                self.max_drawdown_pct
            )));
        }
        Ok(())
    }
}

/// Partial update posted to `POST /settings`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsUpdate {
    pub confidence_floor: Option<Decimal>,
    pub concentration_cap: Option<Decimal>,
    pub max_drawdown_pct: Option<Decimal>,
}

impl SettingsUpdate {
    pub fn is_empty(&self) -> bool {
        self.confidence_floor.is_none()
            && self.concentration_cap.is_none()
            && self.max_drawdown_pct.is_none()
    }
}

/// Shared handle to the published tunables.
#[derive(Debug)]
pub struct Settings {
    current: ArcSwap<Tunables>,
    /// Serialises updates; readers never take it.
    writer: Mutex<()>,
}

impl Settings {
    /// Wrap initial values. Values from the config file are trusted as long
    /// as they sit inside the safety bounds.
    pub fn new(initial: Tunables) -> Result<Self, ArbiterError> {
        initial.validate()?;
        Ok(Self {
            current: ArcSwap::from_pointee(initial),
            writer: Mutex::new(()),
        })
    }

    pub fn current(&self) -> Arc<Tunables> {
        self.current.load_full()
    }

    pub fn confidence_floor(&self) -> Decimal {
        self.current.load().confidence_floor
    }

    pub fn concentration_cap(&self) -> Decimal {
        self.current.load().concentration_cap
    }

    pub fn max_drawdown_pct(&self) -> Decimal {
        self.current.load().max_drawdown_pct
    }

    /// Validate and publish an update. Nothing changes if any field is out of bounds.
    pub fn apply(&self, update: &SettingsUpdate) -> Result<Tunables, ArbiterError> {
        let _writer = self.writer.lock();
        let mut next = (*self.current.load_full()).clone();
        if let Some(v) = update.confidence_floor {
            next.confidence_floor = v;
        }
        if let Some(v) = update.concentration_cap {
            next.concentration_cap = v;
        }
        if let Some(v) = update.max_drawdown_pct {
            next.max_drawdown_pct = v;
        }
        next.validate()?;

        self.current.store(Arc::new(next.clone()));
        info!(
            confidence_floor = %next.confidence_floor,
            concentration_cap = %next.concentration_cap,
            max_drawdown_pct = %next.max_drawdown_pct,
            "Settings updated"
        );
        Ok(next)
    }
}
