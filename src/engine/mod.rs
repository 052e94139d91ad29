//! Core engine: the scan → evaluate → execute → record pipeline.
//!
//! Scanner tasks (one per source) feed the deduplicating opportunity queue.
//! A fixed pool of orchestrator workers drains the queue and sends approved
//! signals down a bounded channel to a fixed pool of executor workers, which
//! hand every result to the accountant.

pub mod accountant;
pub mod executor;
pub mod queue;
pub mod scanner;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, EngineConfig};
use crate::data::PriceSource;
use crate::providers::{ProviderRegistry, Transport};
use crate::settings::{Settings, Tunables};
use crate::storage::AuditLog;
use crate::strategy::risk::{RecordOutcome, RiskManager, RiskState};
use crate::strategy::{Decision, OrchestratorStats, StrategyOrchestrator};
use crate::types::Signal;
use accountant::Accountant;
use executor::{Executor, ExecutorStats};
use queue::{OpportunityQueue, QueueStats};
use scanner::{Scanner, ScannerStats};

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Counters for the hand-off between the pools.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub signals_sent: u64,
    pub in_flight: u64,
    pub settled: u64,
    pub duplicate_results: u64,
    pub audit_failures: u64,
}

#[derive(Default)]
struct Counters {
    signals_sent: AtomicU64,
    in_flight: AtomicU64,
    settled: AtomicU64,
    duplicate_results: AtomicU64,
    audit_failures: AtomicU64,
}

/// Everything `GET /status` reports.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub risk: RiskState,
    pub settings: Tunables,
    pub scanner: ScannerStats,
    pub queue: QueueStats,
    pub orchestrator: OrchestratorStats,
    pub executor: ExecutorStats,
    pub pipeline: PipelineStats,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The wired-up components. Constructed once at startup and shared by
/// handle with the worker tasks and the control surface.
pub struct Engine {
    config: EngineConfig,
    pub settings: Arc<Settings>,
    pub registry: Arc<ProviderRegistry>,
    pub risk: Arc<RiskManager>,
    pub queue: Arc<OpportunityQueue>,
    pub scanner: Arc<Scanner>,
    pub orchestrator: Arc<StrategyOrchestrator>,
    pub executor: Arc<Executor>,
    pub accountant: Arc<Accountant>,
    counters: Counters,
    started_at: DateTime<Utc>,
}

impl Engine {
    pub fn build(
        config: &AppConfig,
        registry: Arc<ProviderRegistry>,
        transport: Arc<dyn Transport>,
        audit: AuditLog,
    ) -> Result<Self> {
        let settings = Arc::new(
            Settings::new(Tunables::from_config(&config.scanner, &config.risk))
                .context("Configured thresholds are outside the safety bounds")?,
        );
        let risk = Arc::new(RiskManager::new(
            config.engine.starting_capital,
            config.risk.clone(),
            settings.clone(),
        ));
        let queue = Arc::new(OpportunityQueue::new(
            config.scanner.queue_capacity,
            config.scanner.debounce(),
            config.scanner.opportunity_ttl(),
        ));
        let scanner = Arc::new(Scanner::new(
            config.scanner.clone(),
            settings.clone(),
            queue.clone(),
        ));
        let orchestrator = Arc::new(StrategyOrchestrator::new(
            config.strategy.clone(),
            config.scanner.opportunity_ttl(),
            settings.clone(),
            risk.clone(),
        ));
        let executor = Arc::new(Executor::new(config.executor.clone(), registry.clone(), transport));
        let accountant = Arc::new(Accountant::new(risk.clone(), audit));

        Ok(Self {
            config: config.engine.clone(),
            settings,
            registry,
            risk,
            queue,
            scanner,
            orchestrator,
            executor,
            accountant,
            counters: Counters::default(),
            started_at: Utc::now(),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Rebuild the risk state from the audit log. Must run before `start`.
    pub async fn restore(&self) -> Result<Arc<RiskState>> {
        let events = self
            .accountant
            .audit()
            .events()
            .await
            .context("Failed to read audit log for replay")?;
        Ok(self.risk.replay(&events))
    }

    /// Spawn the scanner tasks and both worker pools.
    pub fn start(
        self: &Arc<Self>,
        sources: Vec<Arc<dyn PriceSource>>,
        shutdown: watch::Receiver<bool>,
    ) -> Pipeline {
        let (tx, rx) = mpsc::channel::<Signal>(self.config.signal_buffer);
        let rx = Arc::new(Mutex::new(rx));

        let scanners = self.scanner.spawn(sources, shutdown.clone());

        let orchestrators = (0..self.config.orchestrator_workers)
            .map(|worker| {
                let engine = Arc::clone(self);
                let tx = tx.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { engine.orchestrate(worker, tx, shutdown).await })
            })
            .collect();
        drop(tx);

        let executors = (0..self.config.executor_workers)
            .map(|worker| {
                let engine = Arc::clone(self);
                let rx = rx.clone();
                tokio::spawn(async move { engine.execute(worker, rx).await })
            })
            .collect();

        info!(
            orchestrator_workers = self.config.orchestrator_workers,
            executor_workers = self.config.executor_workers,
            signal_buffer = self.config.signal_buffer,
            "Pipeline started"
        );
        Pipeline {
            engine: Arc::clone(self),
            scanners,
            orchestrators,
            executors,
        }
    }

    async fn orchestrate(&self, worker: usize, tx: mpsc::Sender<Signal>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let opportunity = tokio::select! {
                next = self.queue.pop() => match next {
                    Some(opp) => opp,
                    None => break,
                },
                _ = shutdown.changed() => break,
            };

            if let Decision::Approved(signal) = self.orchestrator.evaluate(&opportunity) {
                // Approved signals hold a reservation; they are always
                // delivered since executors outlive every sender.
                if tx.send(signal).await.is_err() {
                    error!(worker, "Signal channel closed with approved signal pending");
                    break;
                }
                self.counters.signals_sent.fetch_add(1, Ordering::Relaxed);
            }
        }
        debug!(worker, "Orchestrator worker stopped");
    }

    async fn execute(&self, worker: usize, rx: Arc<Mutex<mpsc::Receiver<Signal>>>) {
        loop {
            let next = { rx.lock().await.recv().await };
            let Some(signal) = next else {
                break;
            };

            self.counters.in_flight.fetch_add(1, Ordering::Relaxed);
            let result = self.executor.execute(&signal).await;
            match self.accountant.settle(&result).await {
                Ok(RecordOutcome::Applied { .. }) => {
                    self.counters.settled.fetch_add(1, Ordering::Relaxed);
                }
                Ok(RecordOutcome::Ignored) => {
                    self.counters.duplicate_results.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.counters.settled.fetch_add(1, Ordering::Relaxed);
                    self.counters.audit_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(worker, signal_id = %signal.id, error = %e, "Result applied but not audited");
                }
            }
            self.counters.in_flight.fetch_sub(1, Ordering::Relaxed);
        }
        debug!(worker, "Executor worker stopped");
    }

    pub fn pipeline_stats(&self) -> PipelineStats {
        PipelineStats {
            signals_sent: self.counters.signals_sent.load(Ordering::Relaxed),
            in_flight: self.counters.in_flight.load(Ordering::Relaxed),
            settled: self.counters.settled.load(Ordering::Relaxed),
            duplicate_results: self.counters.duplicate_results.load(Ordering::Relaxed),
            audit_failures: self.counters.audit_failures.load(Ordering::Relaxed),
        }
    }

    pub fn status(&self) -> EngineStatus {
        let now = Utc::now();
        EngineStatus {
            name: self.config.name.clone(),
            started_at: self.started_at,
            uptime_secs: (now - self.started_at).num_seconds(),
            risk: (*self.risk.snapshot()).clone(),
            settings: (*self.settings.current()).clone(),
            scanner: self.scanner.stats(),
            queue: self.queue.stats(),
            orchestrator: self.orchestrator.stats(),
            executor: self.executor.stats(),
            pipeline: self.pipeline_stats(),
        }
    }
}

// ---------------------------------------------------------------------------
// Running pipeline
// ---------------------------------------------------------------------------

/// Task handles of a started pipeline.
pub struct Pipeline {
    engine: Arc<Engine>,
    scanners: Vec<JoinHandle<()>>,
    orchestrators: Vec<JoinHandle<()>>,
    executors: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Wait for the pipeline to wind down after the shutdown signal.
    ///
    /// Scanners stop first, then the queue is closed so no new opportunity
    /// is evaluated. Signals already approved are executed and recorded
    /// before the executor pool exits.
    pub async fn join(self) {
        for handle in self.scanners {
            let _ = handle.await;
        }
        self.engine.queue.close();
        for handle in self.orchestrators {
            let _ = handle.await;
        }
        for handle in self.executors {
            let _ = handle.await;
        }
        let stats = self.engine.pipeline_stats();
        info!(
            signals = stats.signals_sent,
            settled = stats.settled,
            audit_failures = stats.audit_failures,
            "Pipeline stopped"
        );
    }
}
