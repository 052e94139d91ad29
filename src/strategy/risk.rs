//! Risk manager and circuit breaker.
//!
//! Owns the single `RiskState` of the process. Every mutation (gate
//! reservations, execution feedback, resets, replay) runs under one writer
//! lock and ends by publishing a fresh immutable snapshot, which the
//! orchestrator and the control surface read without locking.
//!
//! Two states: `Active` and `Halted`. The breaker trips synchronously inside
//! `record` when drawdown, daily loss or consecutive failures cross their
//! limits, and only an explicit `reset` brings it back.

use arc_swap::ArcSwap;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::RiskConfig;
use crate::settings::Settings;
use crate::storage::AuditEvent;
use crate::types::{ExecutionResult, ExecutionStatus, HaltReason, RejectReason, Signal};

// ---------------------------------------------------------------------------
// Risk state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakerState {
    Active,
    Halted,
}

/// Snapshot of the process-wide risk aggregate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskState {
    pub state: BreakerState,
    pub halt_reason: Option<HaltReason>,
    pub starting_capital: Decimal,
    /// Realised P&L since the start of the audit history.
    pub realized_pnl: Decimal,
    pub peak_equity: Decimal,
    /// UTC day of the current accounting window.
    pub window_day: Option<NaiveDate>,
    /// Realised P&L inside the current accounting window.
    pub window_pnl: Decimal,
    /// Capital at risk of approved signals still executing, per asset.
    pub exposure: BTreeMap<String, Decimal>,
    /// Position size of approved signals still executing, per asset.
    pub open_positions: BTreeMap<String, Decimal>,
    pub consecutive_failures: u32,
    pub executions: u64,
    pub last_result_at: Option<DateTime<Utc>>,
}

impl RiskState {
    pub fn new(starting_capital: Decimal) -> Self {
        Self {
            state: BreakerState::Active,
            halt_reason: None,
            starting_capital,
            realized_pnl: Decimal::ZERO,
            peak_equity: starting_capital,
            window_day: None,
            window_pnl: Decimal::ZERO,
            exposure: BTreeMap::new(),
            open_positions: BTreeMap::new(),
            consecutive_failures: 0,
            executions: 0,
            last_result_at: None,
        }
    }

    pub fn is_halted(&self) -> bool {
        self.state == BreakerState::Halted
    }

    pub fn equity(&self) -> Decimal {
        self.starting_capital + self.realized_pnl
    }

    /// Fractional drawdown from peak equity.
    pub fn drawdown(&self) -> Decimal {
        if self.peak_equity <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        ((self.peak_equity - self.equity()) / self.peak_equity).max(Decimal::ZERO)
    }

    /// Loss realised in the current window (zero when the window is up).
    pub fn daily_loss(&self) -> Decimal {
        (-self.window_pnl).max(Decimal::ZERO)
    }

    pub fn total_exposure(&self) -> Decimal {
        self.exposure.values().copied().sum()
    }

    /// Equity not tied up in in-flight signals.
    pub fn available_capital(&self) -> Decimal {
        (self.equity() - self.total_exposure()).max(Decimal::ZERO)
    }

    /// Apply one result to P&L, peak equity, the accounting window and the
    /// failure counter. Does not evaluate the breaker.
    fn apply(&mut self, result: &ExecutionResult) {
        let day = result.completed_at.date_naive();
        if self.window_day != Some(day) {
            self.window_day = Some(day);
            self.window_pnl = Decimal::ZERO;
        }

        let pnl = result.net_pnl();
        self.realized_pnl += pnl;
        self.window_pnl += pnl;
        self.peak_equity = self.peak_equity.max(self.equity());

        match result.status {
            ExecutionStatus::Success => self.consecutive_failures = 0,
            ExecutionStatus::Failed => self.consecutive_failures += 1,
            ExecutionStatus::Partial => {}
        }
        self.executions += 1;
        self.last_result_at = Some(result.completed_at);
    }

    fn halt(&mut self, reason: HaltReason) {
        self.state = BreakerState::Halted;
        self.halt_reason = Some(reason);
    }

    fn resume(&mut self) {
        self.state = BreakerState::Active;
        self.halt_reason = None;
        self.peak_equity = self.equity();
        self.consecutive_failures = 0;
    }
}

/// Outcome of feeding one result to the risk manager.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    Applied { halt: Option<HaltReason> },
    /// No open reservation for the signal: already recorded or never approved.
    Ignored,
}

// ---------------------------------------------------------------------------
// Risk manager
// ---------------------------------------------------------------------------

struct Ledger {
    state: RiskState,
    /// Open reservations by signal id.
    reservations: HashMap<Uuid, Reservation>,
}

struct Reservation {
    asset: String,
    position_size: Decimal,
    capital_at_risk: Decimal,
}

pub struct RiskManager {
    config: RiskConfig,
    settings: Arc<Settings>,
    ledger: Mutex<Ledger>,
    snapshot: ArcSwap<RiskState>,
}

impl RiskManager {
    pub fn new(starting_capital: Decimal, config: RiskConfig, settings: Arc<Settings>) -> Self {
        let state = RiskState::new(starting_capital);
        Self {
            snapshot: ArcSwap::from_pointee(state.clone()),
            ledger: Mutex::new(Ledger {
                state,
                reservations: HashMap::new(),
            }),
            config,
            settings,
        }
    }

    /// Latest published state.
    pub fn snapshot(&self) -> Arc<RiskState> {
        self.snapshot.load_full()
    }

    pub fn is_halted(&self) -> bool {
        self.snapshot.load().is_halted()
    }

    /// Gate a signal. All checks are conjunctive; on approval the signal's
    /// position and capital at risk are reserved against its asset until
    /// `record`.
    ///
    /// Concentration is the asset's open position size plus this one,
    /// over available capital.
    pub fn approve(&self, signal: &Signal) -> Result<(), RejectReason> {
        let mut ledger = self.ledger.lock();

        if ledger.state.is_halted() {
            debug!(signal_id = %signal.id, "Signal rejected: breaker halted");
            return Err(RejectReason::Halted);
        }

        if signal.position_size > self.config.max_position_size {
            warn!(
                signal_id = %signal.id,
                size = %signal.position_size,
                limit = %self.config.max_position_size,
                "Position size limit exceeded"
            );
            return Err(RejectReason::MaxPositionSize);
        }

        let available = ledger.state.available_capital();
        let current = ledger
            .state
            .open_positions
            .get(signal.asset())
            .copied()
            .unwrap_or_default();
        let cap = self.settings.concentration_cap();
        if current + signal.position_size > available * cap {
            warn!(
                signal_id = %signal.id,
                asset = signal.asset(),
                current = %current,
                additional = %signal.position_size,
                available = %available,
                cap = %cap,
                "Concentration cap exceeded"
            );
            return Err(RejectReason::ConcentrationCap);
        }

        let asset = signal.asset().to_string();
        *ledger.state.exposure.entry(asset.clone()).or_default() += signal.capital_at_risk;
        *ledger.state.open_positions.entry(asset.clone()).or_default() += signal.position_size;
        ledger.reservations.insert(
            signal.id,
            Reservation {
                asset,
                position_size: signal.position_size,
                capital_at_risk: signal.capital_at_risk,
            },
        );
        self.publish(&ledger.state);
        Ok(())
    }

    /// Apply the single result for an approved signal and re-evaluate the
    /// breaker. A second result for the same signal is ignored.
    pub fn record(&self, result: &ExecutionResult) -> RecordOutcome {
        let mut ledger = self.ledger.lock();

        let Some(reservation) = ledger.reservations.remove(&result.signal_id) else {
            warn!(signal_id = %result.signal_id, "Result without open reservation ignored");
            return RecordOutcome::Ignored;
        };
        release(&mut ledger.state.exposure, &reservation.asset, reservation.capital_at_risk);
        release(
            &mut ledger.state.open_positions,
            &reservation.asset,
            reservation.position_size,
        );

        ledger.state.apply(result);

        let halt = if ledger.state.is_halted() {
            None
        } else {
            self.breach(&ledger.state)
        };
        if let Some(reason) = &halt {
            ledger.state.halt(reason.clone());
            error!(
                reason = %reason,
                equity = %ledger.state.equity(),
                window_pnl = %ledger.state.window_pnl,
                "CIRCUIT BREAKER TRIPPED: execution halted"
            );
        }

        debug!(
            signal_id = %result.signal_id,
            status = %result.status,
            pnl = %result.net_pnl(),
            equity = %ledger.state.equity(),
            failures = ledger.state.consecutive_failures,
            "Execution result recorded"
        );
        self.publish(&ledger.state);
        RecordOutcome::Applied { halt }
    }

    /// Explicit `Halted -> Active` transition. Returns false if not halted.
    pub fn reset(&self) -> bool {
        let mut ledger = self.ledger.lock();
        if !ledger.state.is_halted() {
            return false;
        }
        let previous = ledger.state.halt_reason.clone();
        ledger.state.resume();
        info!(
            previous = previous.map(|r| r.to_string()).unwrap_or_default(),
            equity = %ledger.state.equity(),
            "Circuit breaker reset"
        );
        self.publish(&ledger.state);
        true
    }

    /// Rebuild state from an audit history, starting from a fresh state.
    ///
    /// Halt and reset events are taken as recorded; thresholds are not
    /// re-evaluated, so the result does not depend on current settings.
    pub fn replay<'a>(&self, events: impl IntoIterator<Item = &'a AuditEvent>) -> Arc<RiskState> {
        let mut ledger = self.ledger.lock();
        let mut state = RiskState::new(ledger.state.starting_capital);

        for event in events {
            match event {
                AuditEvent::Execution(result) => state.apply(result),
                AuditEvent::Halt { reason, .. } => state.halt(reason.clone()),
                AuditEvent::Reset { .. } => state.resume(),
            }
        }

        ledger.state = state;
        ledger.reservations.clear();
        info!(
            executions = ledger.state.executions,
            realized_pnl = %ledger.state.realized_pnl,
            halted = ledger.state.is_halted(),
            "Risk state restored from audit log"
        );
        self.publish(&ledger.state);
        self.snapshot()
    }

    fn breach(&self, state: &RiskState) -> Option<HaltReason> {
        let max_drawdown = self.settings.max_drawdown_pct();
        let drawdown = state.drawdown();
        if drawdown > max_drawdown {
            return Some(HaltReason::Drawdown {
                drawdown: drawdown.round_dp(6),
                limit: max_drawdown,
            });
        }

        let loss = state.daily_loss();
        if loss > self.config.daily_loss_limit {
            return Some(HaltReason::DailyLoss {
                loss,
                limit: self.config.daily_loss_limit,
            });
        }

        if state.consecutive_failures >= self.config.max_consecutive_failures {
            return Some(HaltReason::ConsecutiveFailures {
                count: state.consecutive_failures,
                limit: self.config.max_consecutive_failures,
            });
        }
        None
    }

    fn publish(&self, state: &RiskState) {
        self.snapshot.store(Arc::new(state.clone()));
    }
}

fn release(book: &mut BTreeMap<String, Decimal>, asset: &str, amount: Decimal) {
    if let Some(current) = book.get_mut(asset) {
        *current -= amount;
        if *current <= Decimal::ZERO {
            book.remove(asset);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
