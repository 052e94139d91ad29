//! Signal executor.
//!
//! Turns an approved Signal into a provider-agnostic transaction plan,
//! submits it through the best execution provider and fails over to the
//! next-ranked one on transport errors or timeouts, within a fixed attempt
//! budget. Produces exactly one `ExecutionResult` per Signal.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::config::ExecutorConfig;
use crate::providers::{PlanStep, Provider, ProviderRegistry, Settlement, TransactionPlan, Transport};
use crate::types::{
    ArbiterError, ExecutionResult, ExecutionStatus, LegSide, ProviderRole, Signal, StrategyKind,
};

/// Provider name recorded for dry-run settlements.
const DRY_RUN_PROVIDER: &str = "dry-run";

// ---------------------------------------------------------------------------
// Plan building
// ---------------------------------------------------------------------------

/// Build the ordered steps for a Signal.
///
/// Leg quantities are scaled to the approved position size. Flash-loan
/// plans borrow the asset quantity up front and repay it, plus the premium,
/// as the final step.
pub fn build_plan(signal: &Signal, deadline: chrono::Duration) -> Result<TransactionPlan, ArbiterError> {
    let opp = &signal.opportunity;
    if opp.legs.len() < 2 {
        return Err(ArbiterError::Invariant(format!(
            "signal {} has {} legs",
            signal.id,
            opp.legs.len()
        )));
    }
    let notional = opp.notional();
    if notional <= Decimal::ZERO || signal.position_size <= Decimal::ZERO {
        return Err(ArbiterError::Invariant(format!(
            "signal {} has no position to execute",
            signal.id
        )));
    }
    let ratio = (signal.position_size / notional).min(Decimal::ONE);

    let swaps: Vec<PlanStep> = opp
        .legs
        .iter()
        .map(|leg| PlanStep::Swap {
            venue: leg.venue.clone(),
            side: leg.side,
            asset: opp.asset.clone(),
            quantity: leg.quantity * ratio,
            limit_price: leg.price,
        })
        .collect();

    let steps = match signal.strategy {
        StrategyKind::DirectArbitrage => swaps,
        StrategyKind::FlashLoanArbitrage => {
            let quantity: Decimal = opp
                .legs
                .iter()
                .filter(|l| l.side == LegSide::Buy)
                .map(|l| l.quantity * ratio)
                .sum();
            let premium = (signal.expected_cost - opp.estimated_cost * ratio).max(Decimal::ZERO);

            let mut steps = Vec::with_capacity(swaps.len() + 2);
            steps.push(PlanStep::Borrow {
                asset: opp.asset.clone(),
                amount: quantity,
            });
            // Sell the borrowed asset on the rich venue first, then buy it back.
            steps.extend(swaps.iter().filter(|s| matches!(s, PlanStep::Swap { side: LegSide::Sell, .. })).cloned());
            steps.extend(swaps.iter().filter(|s| matches!(s, PlanStep::Swap { side: LegSide::Buy, .. })).cloned());
            steps.push(PlanStep::Repay {
                asset: opp.asset.clone(),
                amount: quantity,
                fee: premium,
            });
            steps
        }
    };

    Ok(TransactionPlan {
        signal_id: signal.id,
        strategy: signal.strategy,
        steps,
        min_return: signal.expected_cost,
        deadline: Utc::now() + deadline,
    })
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Executor counters exposed in `GET /status`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutorStats {
    pub succeeded: u64,
    pub partial: u64,
    pub failed: u64,
    pub attempts: u64,
    pub failovers: u64,
}

#[derive(Default)]
struct Counters {
    succeeded: AtomicU64,
    partial: AtomicU64,
    failed: AtomicU64,
    attempts: AtomicU64,
    failovers: AtomicU64,
}

pub struct Executor {
    config: ExecutorConfig,
    registry: Arc<ProviderRegistry>,
    transport: Arc<dyn Transport>,
    counters: Counters,
}

impl Executor {
    pub fn new(config: ExecutorConfig, registry: Arc<ProviderRegistry>, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            registry,
            transport,
            counters: Counters::default(),
        }
    }

    /// Execute a Signal. Never panics and never retries past the budget;
    /// every outcome, including invariant violations, becomes a result.
    pub async fn execute(&self, signal: &Signal) -> ExecutionResult {
        let started = Instant::now();
        let budget = self.config.attempt_timeout() * self.config.max_attempts;
        let deadline = chrono::Duration::from_std(budget).unwrap_or_else(|_| chrono::Duration::seconds(60));

        let plan = match build_plan(signal, deadline) {
            Ok(plan) => plan,
            Err(e) => {
                error!(signal_id = %signal.id, error = %e, "Invariant violation building plan");
                return self.finish(signal, Outcome::failed(0, None, e), started);
            }
        };

        if self.config.dry_run {
            info!(
                signal_id = %signal.id,
                strategy = %signal.strategy,
                size = %signal.position_size,
                steps = plan.steps.len(),
                "[DRY RUN] Would submit plan"
            );
            return self.finish(
                signal,
                Outcome {
                    status: ExecutionStatus::Success,
                    profit: signal.expected_value,
                    cost: signal.expected_cost,
                    provider: Some(DRY_RUN_PROVIDER.to_string()),
                    attempts: 0,
                    error: None,
                },
                started,
            );
        }

        let outcome = self.attempt_loop(signal, &plan).await;
        self.finish(signal, outcome, started)
    }

    async fn attempt_loop(&self, signal: &Signal, plan: &TransactionPlan) -> Outcome {
        let timeout = self.config.attempt_timeout();
        let mut tried: Vec<String> = Vec::new();
        let mut last_error: Option<ArbiterError> = None;

        while (tried.len() as u32) < self.config.max_attempts {
            let provider = match self.next_provider(&tried) {
                Ok(p) => p,
                Err(e) => {
                    warn!(signal_id = %signal.id, error = %e, "No execution provider available");
                    last_error = Some(e);
                    break;
                }
            };
            let attempt = tried.len() as u32 + 1;
            if attempt > 1 {
                self.counters.failovers.fetch_add(1, Ordering::Relaxed);
            }
            tried.push(provider.name.clone());
            self.counters.attempts.fetch_add(1, Ordering::Relaxed);

            let sent = Instant::now();
            let submitted = match tokio::time::timeout(timeout, self.transport.submit(&provider, plan)).await {
                Ok(result) => result,
                Err(_) => Err(ArbiterError::Timeout {
                    provider: provider.name.clone(),
                    after_ms: timeout.as_millis() as u64,
                }),
            };
            let latency = sent.elapsed();

            match submitted {
                Ok(settlement) => {
                    // The back end answered; the endpoint is healthy whatever
                    // the plan did.
                    self.registry.report(&provider.name, true, latency);
                    return self.settle(signal, &provider, attempt, settlement);
                }
                Err(e) => {
                    self.registry
                        .report_outcome(&provider.name, false, latency, Some(&e.to_string()));
                    warn!(
                        signal_id = %signal.id,
                        provider = %provider.name,
                        attempt,
                        max_attempts = self.config.max_attempts,
                        error = %e,
                        "Execution attempt failed, failing over"
                    );
                    last_error = Some(e);
                }
            }
        }

        let error = last_error.unwrap_or_else(|| ArbiterError::NotAvailable {
            role: ProviderRole::Execution,
        });
        Outcome::failed(tried.len() as u32, tried.pop(), error)
    }

    /// Untried healthy providers first, in rank order; once every healthy
    /// provider has been tried, the best one again.
    fn next_provider(&self, tried: &[String]) -> Result<Provider, ArbiterError> {
        self.registry
            .ranked(ProviderRole::Execution)
            .into_iter()
            .find(|p| !tried.contains(&p.name))
            .map(Ok)
            .unwrap_or_else(|| self.registry.best(ProviderRole::Execution))
    }

    fn settle(&self, signal: &Signal, provider: &Provider, attempts: u32, s: Settlement) -> Outcome {
        let provider = Some(provider.name.clone());
        if s.is_complete() {
            return Outcome {
                status: ExecutionStatus::Success,
                profit: s.realized_value,
                cost: s.realized_cost,
                provider,
                attempts,
                error: None,
            };
        }

        if s.is_partial() && self.config.supports_partial {
            warn!(
                signal_id = %signal.id,
                settled = s.settled_steps,
                total = s.total_steps,
                "Plan partially settled"
            );
            return Outcome {
                status: ExecutionStatus::Partial,
                profit: s.realized_value,
                cost: s.realized_cost,
                provider,
                attempts,
                error: None,
            };
        }

        // Reverted, or partially settled on a back end without partial
        // accounting. Only the cost paid is realised; no retry.
        let message = if s.is_partial() {
            format!("plan partially settled ({}/{} steps)", s.settled_steps, s.total_steps)
        } else {
            "plan reverted".to_string()
        };
        Outcome {
            status: ExecutionStatus::Failed,
            profit: Decimal::ZERO,
            cost: s.realized_cost,
            provider,
            attempts,
            error: Some(message),
        }
    }

    fn finish(&self, signal: &Signal, outcome: Outcome, started: Instant) -> ExecutionResult {
        let counter = match outcome.status {
            ExecutionStatus::Success => &self.counters.succeeded,
            ExecutionStatus::Partial => &self.counters.partial,
            ExecutionStatus::Failed => &self.counters.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        let result = ExecutionResult {
            signal_id: signal.id,
            opportunity_id: signal.opportunity_id(),
            asset: signal.asset().to_string(),
            strategy: signal.strategy,
            status: outcome.status,
            position_size: signal.position_size,
            capital_at_risk: signal.capital_at_risk,
            realized_profit: outcome.profit,
            realized_cost: outcome.cost,
            provider: outcome.provider,
            attempts: outcome.attempts,
            latency_ms: started.elapsed().as_millis() as u64,
            error: outcome.error,
            completed_at: Utc::now(),
        };

        match result.status {
            ExecutionStatus::Failed => warn!(
                signal_id = %result.signal_id,
                attempts = result.attempts,
                error = result.error.as_deref().unwrap_or("-"),
                "Execution failed"
            ),
            _ => info!(signal_id = %result.signal_id, "{result}"),
        }
        result
    }

    pub fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            partial: self.counters.partial.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            attempts: self.counters.attempts.load(Ordering::Relaxed),
            failovers: self.counters.failovers.load(Ordering::Relaxed),
        }
    }
}

struct Outcome {
    status: ExecutionStatus,
    profit: Decimal,
    cost: Decimal,
    provider: Option<String>,
    attempts: u32,
    error: Option<String>,
}

impl Outcome {
    fn failed(attempts: u32, provider: Option<String>, error: ArbiterError) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            profit: Decimal::ZERO,
            cost: Decimal::ZERO,
            provider,
            attempts,
            error: Some(error.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
