//! Accountant: feeds execution results to the risk manager and the audit log.
//!
//! Each result is applied to the risk state exactly once. Applying a
//! result and appending its events happen under one sequencing lock, so
//! the log holds events in the order they changed the live state and a
//! replay walks through the same transitions.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::storage::{AuditEvent, AuditLog};
use crate::strategy::risk::{RecordOutcome, RiskManager};
use crate::types::{ArbiterError, ExecutionResult};

pub struct Accountant {
    risk: Arc<RiskManager>,
    audit: AuditLog,
    sequence: Mutex<()>,
}

impl Accountant {
    pub fn new(risk: Arc<RiskManager>, audit: AuditLog) -> Self {
        Self {
            risk,
            audit,
            sequence: Mutex::new(()),
        }
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Record one result. Duplicates are dropped before reaching the log.
    ///
    /// A halt is appended even when the execution append failed, so a
    /// restart still comes back halted.
    pub async fn settle(&self, result: &ExecutionResult) -> Result<RecordOutcome, ArbiterError> {
        let _sequence = self.sequence.lock().await;
        let outcome = self.risk.record(result);
        let RecordOutcome::Applied { halt } = &outcome else {
            return Ok(outcome);
        };

        let appended = self.append(AuditEvent::Execution(result.clone())).await;
        if let Some(reason) = halt {
            self.append(AuditEvent::Halt {
                reason: reason.clone(),
                at: result.completed_at,
            })
            .await?;
        }
        appended.map(|_| outcome)
    }

    /// Operator reset of the breaker. Returns false when it was not halted.
    pub async fn reset_halt(&self) -> Result<bool, ArbiterError> {
        let _sequence = self.sequence.lock().await;
        if !self.risk.reset() {
            return Ok(false);
        }
        self.append(AuditEvent::Reset { at: Utc::now() }).await?;
        info!("Breaker reset recorded");
        Ok(true)
    }

    async fn append(&self, event: AuditEvent) -> Result<(), ArbiterError> {
        match self.audit.append(&event).await {
            Ok(_) => Ok(()),
            Err(e) => {
                // Live state is already updated; a restart would replay
                // without this event.
                error!(kind = event.kind(), error = %e, "Audit append failed");
                Err(e)
            }
        }
    }
}
