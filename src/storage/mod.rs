//! Append-only audit log.
//!
//! One record per ExecutionResult plus breaker halt and reset transitions,
//! stored as JSON payloads in SQLite. Replaying the log from the first
//! record rebuilds the risk state after a restart.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::{debug, info};

use crate::types::{ArbiterError, ExecutionResult, HaltReason};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS audit_log (
    seq         INTEGER PRIMARY KEY AUTOINCREMENT,
    recorded_at TEXT NOT NULL,
    kind        TEXT NOT NULL,
    payload     TEXT NOT NULL
)
"#;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditEvent {
    Execution(ExecutionResult),
    Halt { reason: HaltReason, at: DateTime<Utc> },
    Reset { at: DateTime<Utc> },
}

impl AuditEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            AuditEvent::Execution(_) => "execution",
            AuditEvent::Halt { .. } => "halt",
            AuditEvent::Reset { .. } => "reset",
        }
    }
}

/// A stored event with its sequence number.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditRecord {
    pub seq: i64,
    pub recorded_at: DateTime<Utc>,
    pub event: AuditEvent,
}

/// Aggregates served by `GET /audit/report`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AuditReport {
    pub executions: u64,
    pub by_status: BTreeMap<String, u64>,
    pub by_strategy: BTreeMap<String, u64>,
    pub by_provider: BTreeMap<String, u64>,
    pub realized_profit: Decimal,
    pub realized_cost: Decimal,
    pub net_pnl: Decimal,
    pub halts: u64,
    pub resets: u64,
}

impl AuditReport {
    fn add(&mut self, event: &AuditEvent) {
        match event {
            AuditEvent::Execution(r) => {
                self.executions += 1;
                *self.by_status.entry(r.status.to_string().to_lowercase()).or_default() += 1;
                *self.by_strategy.entry(r.strategy.to_string()).or_default() += 1;
                let provider = r.provider.clone().unwrap_or_else(|| "none".to_string());
                *self.by_provider.entry(provider).or_default() += 1;
                self.realized_profit += r.realized_profit;
                self.realized_cost += r.realized_cost;
                self.net_pnl += r.net_pnl();
            }
            AuditEvent::Halt { .. } => self.halts += 1,
            AuditEvent::Reset { .. } => self.resets += 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Log
// ---------------------------------------------------------------------------

fn storage_err(context: &str, e: impl std::fmt::Display) -> ArbiterError {
    ArbiterError::Storage(format!("{context}: {e}"))
}

#[derive(Clone)]
pub struct AuditLog {
    pool: Pool<Sqlite>,
}

impl AuditLog {
    /// Open (creating if missing) the log at `database_url`.
    ///
    /// A single connection keeps appends strictly ordered.
    pub async fn open(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("Invalid audit database URL: {database_url}"))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open audit database: {database_url}"))?;

        sqlx::query(SCHEMA)
            .execute(&pool)
            .await
            .context("Failed to create audit_log table")?;

        info!(url = database_url, "Audit log opened");
        Ok(Self { pool })
    }

    /// Append one event. Returns its sequence number.
    pub async fn append(&self, event: &AuditEvent) -> Result<i64, ArbiterError> {
        let payload = serde_json::to_string(event).map_err(|e| storage_err("encode event", e))?;
        let seq: i64 = sqlx::query_scalar(
            "INSERT INTO audit_log (recorded_at, kind, payload) VALUES (?, ?, ?) RETURNING seq",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(event.kind())
        .bind(payload)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| storage_err("append", e))?;

        debug!(seq, kind = event.kind(), "Audit event appended");
        Ok(seq)
    }

    /// Records in sequence order.
    pub async fn page(&self, offset: i64, limit: i64) -> Result<Vec<AuditRecord>, ArbiterError> {
        let rows: Vec<(i64, String, String)> = sqlx::query_as(
            "SELECT seq, recorded_at, payload FROM audit_log ORDER BY seq LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| storage_err("read page", e))?;

        rows.into_iter().map(decode).collect()
    }

    pub async fn count(&self) -> Result<i64, ArbiterError> {
        sqlx::query_scalar("SELECT COUNT(*) FROM audit_log")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| storage_err("count", e))
    }

    /// Every event, in the order it was appended.
    pub async fn events(&self) -> Result<Vec<AuditEvent>, ArbiterError> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT payload FROM audit_log ORDER BY seq")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| storage_err("read events", e))?;

        rows.into_iter()
            .map(|(payload,)| serde_json::from_str(&payload).map_err(|e| storage_err("decode event", e)))
            .collect()
    }

    pub async fn report(&self) -> Result<AuditReport, ArbiterError> {
        let mut report = AuditReport::default();
        for event in self.events().await? {
            report.add(&event);
        }
        Ok(report)
    }
}

fn decode((seq, recorded_at, payload): (i64, String, String)) -> Result<AuditRecord, ArbiterError> {
    let recorded_at = DateTime::parse_from_rfc3339(&recorded_at)
        .map_err(|e| storage_err("decode timestamp", e))?
        .with_timezone(&Utc);
    let event = serde_json::from_str(&payload).map_err(|e| storage_err("decode event", e))?;
    Ok(AuditRecord {
        seq,
        recorded_at,
        event,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
