//! Provider registry.
//!
//! Tracks health, priority and cost of interchangeable back-end endpoints
//! (data nodes and execution relays) and hands out the best available one
//! per role. Mutations (outcome reports and health checks) are serialised
//! behind a single writer lock and each one republishes an immutable
//! ranking snapshot, so `best()` never blocks and never touches the network.

pub mod http;
pub mod transport;

use arc_swap::ArcSwap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{ProviderConfig, RegistryConfig};
use crate::types::{ArbiterError, ProviderRole};
pub use transport::{PlanStep, Settlement, TransactionPlan, Transport};

/// Outcomes kept for the rolling success rate.
const OUTCOME_WINDOW: usize = 100;

/// Weight of the newest latency sample in the moving average.
const LATENCY_ALPHA: f64 = 0.2;

// ---------------------------------------------------------------------------
// Provider descriptor
// ---------------------------------------------------------------------------

/// Public view of an endpoint at the time the ranking was published.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Provider {
    pub name: String,
    pub url: String,
    pub role: ProviderRole,
    /// Lower is preferred.
    pub priority: u32,
    pub healthy: bool,
    /// Share of successful outcomes over the rolling window (1.0 when unobserved).
    pub success_rate: f64,
    pub consecutive_failures: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    /// Moving average of successful call latency.
    pub avg_latency_ms: f64,
    pub last_error: Option<String>,
}

/// Total order used for ranking: healthy first, then fewest consecutive
/// failures, then configured priority, then lowest observed latency.
fn rank_order(a: &Provider, b: &Provider) -> Ordering {
    b.healthy
        .cmp(&a.healthy)
        .then(a.consecutive_failures.cmp(&b.consecutive_failures))
        .then(a.priority.cmp(&b.priority))
        .then(a.avg_latency_ms.total_cmp(&b.avg_latency_ms))
        .then_with(|| a.name.cmp(&b.name))
}

/// Writer-side bookkeeping for one endpoint.
#[derive(Debug)]
struct ProviderEntry {
    view: Provider,
    outcomes: VecDeque<bool>,
    demoted_at: Option<Instant>,
}

impl ProviderEntry {
    fn new(cfg: &ProviderConfig) -> Self {
        Self {
            view: Provider {
                name: cfg.name.clone(),
                url: cfg.url.clone(),
                role: cfg.role,
                priority: cfg.priority,
                healthy: true,
                success_rate: 1.0,
                consecutive_failures: 0,
                total_successes: 0,
                total_failures: 0,
                avg_latency_ms: 0.0,
                last_error: None,
            },
            outcomes: VecDeque::with_capacity(OUTCOME_WINDOW),
            demoted_at: None,
        }
    }

    fn push_outcome(&mut self, success: bool) {
        if self.outcomes.len() == OUTCOME_WINDOW {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(success);
        let ok = self.outcomes.iter().filter(|o| **o).count();
        self.view.success_rate = ok as f64 / self.outcomes.len() as f64;
    }

    fn record_success(&mut self, latency: Duration) {
        let sample = latency.as_secs_f64() * 1000.0;
        self.view.avg_latency_ms = if self.view.total_successes == 0 {
            sample
        } else {
            (1.0 - LATENCY_ALPHA) * self.view.avg_latency_ms + LATENCY_ALPHA * sample
        };
        self.view.total_successes += 1;
        self.view.consecutive_failures = 0;
        self.push_outcome(true);
    }

    /// Returns true if this failure demoted the provider.
    fn record_failure(&mut self, error: Option<&str>, threshold: u32, now: Instant) -> bool {
        self.view.total_failures += 1;
        self.view.consecutive_failures += 1;
        if let Some(e) = error {
            self.view.last_error = Some(e.to_string());
        }
        self.push_outcome(false);

        if self.view.healthy && self.view.consecutive_failures >= threshold {
            self.view.healthy = false;
            self.demoted_at = Some(now);
            return true;
        }
        false
    }

    fn cooled_down(&self, cooldown: Duration, now: Instant) -> bool {
        match self.demoted_at {
            Some(at) => now.duration_since(at) >= cooldown,
            None => true,
        }
    }

    fn promote(&mut self, latency: Duration) {
        self.view.healthy = true;
        self.demoted_at = None;
        self.record_success(latency);
    }
}

// ---------------------------------------------------------------------------
// Ranking snapshot
// ---------------------------------------------------------------------------

/// Immutable ranking published after every registry mutation.
#[derive(Debug, Default)]
pub struct Ranking {
    by_role: HashMap<ProviderRole, Vec<Provider>>,
}

impl Ranking {
    fn build(entries: &[ProviderEntry]) -> Self {
        let mut by_role: HashMap<ProviderRole, Vec<Provider>> = HashMap::new();
        for entry in entries {
            by_role
                .entry(entry.view.role)
                .or_default()
                .push(entry.view.clone());
        }
        for list in by_role.values_mut() {
            list.sort_by(rank_order);
        }
        Self { by_role }
    }

    /// All providers of a role, best first (unhealthy ones trail).
    pub fn role(&self, role: ProviderRole) -> &[Provider] {
        self.by_role.get(&role).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every provider, grouped by role.
    pub fn all(&self) -> Vec<Provider> {
        ProviderRole::ALL
            .iter()
            .flat_map(|r| self.role(*r).iter().cloned())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Registry of interchangeable endpoints with automatic failover.
///
/// Constructed once at startup and shared by handle with the scanner and
/// the executor.
pub struct ProviderRegistry {
    entries: Mutex<Vec<ProviderEntry>>,
    ranking: ArcSwap<Ranking>,
    policy: RegistryConfig,
}

impl ProviderRegistry {
    pub fn new(providers: &[ProviderConfig], policy: RegistryConfig) -> Self {
        let entries: Vec<ProviderEntry> = providers.iter().map(ProviderEntry::new).collect();
        let ranking = Ranking::build(&entries);
        info!(
            providers = entries.len(),
            failure_threshold = policy.failure_threshold,
            cooldown_secs = policy.cooldown_secs,
            "Provider registry initialised"
        );
        Self {
            entries: Mutex::new(entries),
            ranking: ArcSwap::from_pointee(ranking),
            policy,
        }
    }

    /// Current ranking snapshot.
    pub fn snapshot(&self) -> Arc<Ranking> {
        self.ranking.load_full()
    }

    /// Best healthy provider for a role, from the cached ranking.
    pub fn best(&self, role: ProviderRole) -> Result<Provider, ArbiterError> {
        self.ranking
            .load()
            .role(role)
            .iter()
            .find(|p| p.healthy)
            .cloned()
            .ok_or(ArbiterError::NotAvailable { role })
    }

    /// Healthy providers for a role, best first.
    pub fn ranked(&self, role: ProviderRole) -> Vec<Provider> {
        self.ranking
            .load()
            .role(role)
            .iter()
            .filter(|p| p.healthy)
            .cloned()
            .collect()
    }

    /// Whether at least one provider of the role is healthy.
    pub fn is_available(&self, role: ProviderRole) -> bool {
        self.ranking.load().role(role).iter().any(|p| p.healthy)
    }

    /// Record the outcome of one call made against a provider.
    pub fn report(&self, name: &str, success: bool, latency: Duration) {
        self.report_outcome(name, success, latency, None);
    }

    /// Record an outcome together with the error that caused a failure.
    pub fn report_outcome(&self, name: &str, success: bool, latency: Duration, error: Option<&str>) {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let Some(entry) = entries.iter_mut().find(|e| e.view.name == name) else {
            warn!(provider = name, "Outcome reported for unknown provider");
            return;
        };

        if success {
            entry.record_success(latency);
        } else if entry.record_failure(error, self.policy.failure_threshold, now) {
            error!(
                provider = name,
                role = %entry.view.role,
                failures = entry.view.consecutive_failures,
                error = error.unwrap_or("-"),
                "Provider demoted after consecutive failures"
            );
        } else {
            debug!(
                provider = name,
                failures = entry.view.consecutive_failures,
                "Provider failure recorded"
            );
        }
        self.publish(&entries);
    }

    /// Ping every provider that is healthy or whose cooldown has elapsed,
    /// update health and latency, and re-rank.
    pub async fn health_check(&self, transport: &dyn Transport) {
        let now = Instant::now();
        let targets: Vec<(Provider, bool)> = {
            let entries = self.entries.lock();
            entries
                .iter()
                .filter(|e| e.view.healthy || e.cooled_down(self.policy.cooldown(), now))
                .map(|e| (e.view.clone(), e.view.healthy))
                .collect()
        };

        let timeout = self.policy.ping_timeout();
        let pings = targets.iter().map(|(provider, _)| async move {
            let started = Instant::now();
            let outcome = match tokio::time::timeout(timeout, transport.ping(provider)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!("health check timed out after {}ms", timeout.as_millis())),
            };
            (outcome, started.elapsed())
        });
        let results = join_all(pings).await;

        let checked_at = Instant::now();
        let mut entries = self.entries.lock();
        for ((provider, was_healthy), (outcome, latency)) in targets.iter().zip(results) {
            let Some(entry) = entries.iter_mut().find(|e| e.view.name == provider.name) else {
                continue;
            };
            match (was_healthy, outcome) {
                (true, Ok(())) => entry.record_success(latency),
                (true, Err(e)) => {
                    if entry.record_failure(Some(&e), self.policy.failure_threshold, checked_at) {
                        error!(provider = %provider.name, error = %e, "Provider demoted by health check");
                    }
                }
                (false, Ok(())) => {
                    entry.promote(latency);
                    info!(
                        provider = %provider.name,
                        role = %provider.role,
                        latency_ms = latency.as_millis() as u64,
                        "Provider promoted after cooldown"
                    );
                }
                (false, Err(e)) => {
                    // Still failing: restart the cooldown.
                    entry.demoted_at = Some(checked_at);
                    entry.view.last_error = Some(e.clone());
                    debug!(provider = %provider.name, error = %e, "Demoted provider still failing");
                }
            }
        }
        self.publish(&entries);

        for p in entries.iter().map(|e| &e.view) {
            debug!(
                provider = %p.name,
                healthy = p.healthy,
                success_rate = p.success_rate,
                latency_ms = p.avg_latency_ms,
                "Provider health"
            );
        }
    }

    /// Run `health_check` on a fixed interval until shutdown is signalled.
    pub fn spawn_health_checks(
        self: Arc<Self>,
        transport: Arc<dyn Transport>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let interval = self.policy.health_check_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.health_check(transport.as_ref()).await,
                    _ = shutdown.changed() => {
                        debug!("Health-check loop stopping");
                        break;
                    }
                }
            }
        })
    }

    fn publish(&self, entries: &[ProviderEntry]) {
        self.ranking.store(Arc::new(Ranking::build(entries)));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use transport::MockTransport;

    fn cfg(name: &str, role: ProviderRole, priority: u32) -> ProviderConfig {
        ProviderConfig {
            name: name.into(),
            url: format!("https://{name}.example.com"),
            role,
            priority,
            auth_token_env: None,
            health_path: None,
        }
    }

    fn policy(threshold: u32, cooldown_secs: u64) -> RegistryConfig {
        RegistryConfig {
            health_check_interval_secs: 30,
            failure_threshold: threshold,
            cooldown_secs,
            ping_timeout_ms: 100,
        }
    }

    fn registry() -> ProviderRegistry {
        ProviderRegistry::new(
            &[
                cfg("relay-b", ProviderRole::Execution, 2),
                cfg("relay-a", ProviderRole::Execution, 1),
                cfg("node-a", ProviderRole::Data, 1),
            ],
            policy(5, 0),
        )
    }

    #[test]
    fn test_best_respects_priority() {
        let reg = registry();
        assert_eq!(reg.best(ProviderRole::Execution).unwrap().name, "relay-a");
        assert_eq!(reg.best(ProviderRole::Data).unwrap().name, "node-a");
    }

    #[test]
    fn test_ties_broken_by_latency() {
        let reg = ProviderRegistry::new(
            &[
                cfg("slow", ProviderRole::Execution, 1),
                cfg("fast", ProviderRole::Execution, 1),
            ],
            policy(5, 0),
        );
        reg.report("slow", true, Duration::from_millis(90));
        reg.report("fast", true, Duration::from_millis(10));
        let ranked = reg.ranked(ProviderRole::Execution);
        assert_eq!(ranked[0].name, "fast");
        assert_eq!(ranked[1].name, "slow");
    }

    #[test]
    fn test_failover_after_consecutive_failures() {
        let reg = registry();
        for _ in 0..5 {
            reg.report("relay-a", false, Duration::from_millis(5));
        }
        let best = reg.best(ProviderRole::Execution).unwrap();
        assert_eq!(best.name, "relay-b");
        assert!(best.healthy);

        let all = reg.snapshot();
        let demoted = all
            .role(ProviderRole::Execution)
            .iter()
            .find(|p| p.name == "relay-a")
            .unwrap();
        assert!(!demoted.healthy);
        assert_eq!(demoted.consecutive_failures, 5);
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let reg = registry();
        for _ in 0..4 {
            reg.report("relay-a", false, Duration::from_millis(5));
        }
        reg.report("relay-a", true, Duration::from_millis(5));
        for _ in 0..4 {
            reg.report("relay-a", false, Duration::from_millis(5));
        }
        let ranked = reg.ranked(ProviderRole::Execution);
        assert_eq!(ranked.len(), 2);
    }

    #[test]
    fn test_not_available_when_all_unhealthy() {
        let reg = registry();
        for name in ["relay-a", "relay-b"] {
            for _ in 0..5 {
                reg.report(name, false, Duration::from_millis(1));
            }
        }
        let err = reg.best(ProviderRole::Execution).unwrap_err();
        assert!(matches!(
            err,
            ArbiterError::NotAvailable { role: ProviderRole::Execution }
        ));
        assert!(!reg.is_available(ProviderRole::Execution));
        // Other roles are unaffected.
        assert!(reg.best(ProviderRole::Data).is_ok());
    }

    #[test]
    fn test_success_rate_window() {
        let reg = registry();
        reg.report("node-a", true, Duration::from_millis(1));
        reg.report("node-a", false, Duration::from_millis(1));
        let node = reg.best(ProviderRole::Data).unwrap();
        assert!((node.success_rate - 0.5).abs() < 1e-9);
        assert_eq!(node.total_successes, 1);
        assert_eq!(node.total_failures, 1);
    }

    #[test]
    fn test_unknown_provider_report_ignored() {
        let reg = registry();
        reg.report("ghost", false, Duration::from_millis(1));
        assert_eq!(reg.snapshot().all().len(), 3);
    }

    #[tokio::test]
    async fn test_health_check_promotes_after_cooldown() {
        let reg = registry();
        for _ in 0..5 {
            reg.report("relay-a", false, Duration::from_millis(1));
        }
        assert_eq!(reg.best(ProviderRole::Execution).unwrap().name, "relay-b");

        let mut transport = MockTransport::new();
        transport.expect_ping().returning(|_| Ok(()));
        reg.health_check(&transport).await;

        // Cooldown is zero, so one passing check restores relay-a.
        assert_eq!(reg.best(ProviderRole::Execution).unwrap().name, "relay-a");
    }

    #[tokio::test]
    async fn test_health_check_skips_demoted_within_cooldown() {
        let reg = ProviderRegistry::new(
            &[
                cfg("relay-a", ProviderRole::Execution, 1),
                cfg("relay-b", ProviderRole::Execution, 2),
            ],
            policy(2, 3600),
        );
        reg.report("relay-a", false, Duration::from_millis(1));
        reg.report("relay-a", false, Duration::from_millis(1));

        let mut transport = MockTransport::new();
        transport
            .expect_ping()
            .withf(|p| p.name == "relay-b")
            .times(1)
            .returning(|_| Ok(()));
        reg.health_check(&transport).await;

        assert_eq!(reg.ranked(ProviderRole::Execution).len(), 1);
    }

    #[tokio::test]
    async fn test_health_check_failures_demote() {
        let reg = ProviderRegistry::new(
            &[cfg("node-a", ProviderRole::Data, 1)],
            policy(1, 3600),
        );
        let mut transport = MockTransport::new();
        transport.expect_ping().returning(|p| {
            Err(ArbiterError::Transport {
                provider: p.name.clone(),
                message: "connection refused".into(),
            })
        });
        reg.health_check(&transport).await;

        assert!(reg.best(ProviderRole::Data).is_err());
        let snapshot = reg.snapshot();
        let node = &snapshot.role(ProviderRole::Data)[0];
        assert!(node.last_error.as_deref().unwrap().contains("connection refused"));
    }
}
