//! Quote scanner.
//!
//! Runs one polling task per configured price source. Each poll normalises
//! raw quotes into the common unit, updates a per-asset book of the latest
//! quote from every venue, and prices the cross-venue spreads the new
//! quotes open up. Candidates below the confidence floor are dropped before
//! they reach the queue.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::queue::{OpportunityQueue, PushOutcome};
use crate::config::ScannerConfig;
use crate::data::{PriceSource, Quote};
use crate::settings::Settings;
use crate::types::{LegSide, Opportunity, OpportunityKey, PricedLeg};

// ---------------------------------------------------------------------------
// Pricing
// ---------------------------------------------------------------------------

/// Latest quote per venue for one asset.
type VenueBook = HashMap<String, Quote>;

/// Freshness of the older of two quotes, in [0, 1].
fn freshness(buy: &Quote, sell: &Quote, max_age_ms: u64, now: DateTime<Utc>) -> Decimal {
    if max_age_ms == 0 {
        return Decimal::ONE;
    }
    let oldest = buy.observed_at.min(sell.observed_at);
    let age_ms = (now - oldest).num_milliseconds().max(0);
    let ratio = Decimal::from(age_ms) / Decimal::from(max_age_ms);
    (Decimal::ONE - ratio).clamp(Decimal::ZERO, Decimal::ONE)
}

/// Price a buy-on-one-venue, sell-on-another candidate.
///
/// Returns `None` when there is no positive spread or no common size.
pub fn price_spread(
    buy: &Quote,
    sell: &Quote,
    cfg: &ScannerConfig,
    now: DateTime<Utc>,
) -> Option<Opportunity> {
    if buy.venue == sell.venue || sell.price <= buy.price {
        return None;
    }
    let size = buy.liquidity.min(sell.liquidity);
    if size <= Decimal::ZERO {
        return None;
    }

    let legs = vec![
        PricedLeg {
            venue: buy.venue.clone(),
            side: LegSide::Buy,
            price: buy.price,
            quantity: size,
            fee_bps: buy.fee_bps,
        },
        PricedLeg {
            venue: sell.venue.clone(),
            side: LegSide::Sell,
            price: sell.price,
            quantity: size,
            fee_bps: sell.fee_bps,
        },
    ];
    let gross_value = (sell.price - buy.price) * size;
    let estimated_cost = legs.iter().map(PricedLeg::fee).sum::<Decimal>() + cfg.execution_overhead;

    // Thin books on one side make the smaller fill less certain.
    let depth = size / buy.liquidity.max(sell.liquidity);
    let confidence = freshness(buy, sell, cfg.quote_max_age_ms, now)
        * (dec!(0.5) + dec!(0.5) * depth);

    let price_bucket = (buy.price / cfg.price_bucket)
        .round()
        .to_i64()
        .unwrap_or_default();

    Some(Opportunity {
        id: Uuid::new_v4(),
        key: OpportunityKey {
            buy_venue: buy.venue.clone(),
            sell_venue: sell.venue.clone(),
            asset: buy.asset.clone(),
            price_bucket,
        },
        asset: buy.asset.clone(),
        legs,
        gross_value,
        estimated_cost,
        confidence: confidence.round_dp(4),
        detected_at: now,
    })
}

/// Candidates opened up by `updated` against every other fresh quote.
fn detect(book: &VenueBook, updated: &Quote, cfg: &ScannerConfig, now: DateTime<Utc>) -> Vec<Opportunity> {
    let max_age = chrono::Duration::milliseconds(cfg.quote_max_age_ms as i64);
    book.values()
        .filter(|other| other.venue != updated.venue && now - other.observed_at <= max_age)
        .filter_map(|other| {
            price_spread(other, updated, cfg, now).or_else(|| price_spread(updated, other, cfg, now))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

/// Scanner counters exposed in `GET /status`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScannerStats {
    pub polls: u64,
    pub poll_failures: u64,
    pub quotes: u64,
    pub emitted: u64,
    pub below_floor: u64,
}

#[derive(Default)]
struct Counters {
    polls: AtomicU64,
    poll_failures: AtomicU64,
    quotes: AtomicU64,
    emitted: AtomicU64,
    below_floor: AtomicU64,
}

pub struct Scanner {
    config: ScannerConfig,
    settings: Arc<Settings>,
    queue: Arc<OpportunityQueue>,
    books: Mutex<HashMap<String, VenueBook>>,
    recent: Mutex<VecDeque<Opportunity>>,
    counters: Counters,
}

impl Scanner {
    pub fn new(config: ScannerConfig, settings: Arc<Settings>, queue: Arc<OpportunityQueue>) -> Self {
        Self {
            recent: Mutex::new(VecDeque::with_capacity(config.recent_opportunities)),
            config,
            settings,
            queue,
            books: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    /// Start one polling task per source.
    pub fn spawn(
        self: &Arc<Self>,
        sources: Vec<Arc<dyn PriceSource>>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        info!(sources = sources.len(), "Starting scanner tasks");
        sources
            .into_iter()
            .map(|source| {
                let scanner = Arc::clone(self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { scanner.run_source(source, shutdown).await })
            })
            .collect()
    }

    async fn run_source(&self, source: Arc<dyn PriceSource>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_once(source.as_ref()).await;
                }
                _ = shutdown.changed() => {
                    debug!(source = source.name(), "Scanner task stopping");
                    break;
                }
            }
        }
    }

    /// Poll one source under the poll timeout and ingest what it returns.
    /// Returns the number of opportunities queued.
    pub async fn poll_once(&self, source: &dyn PriceSource) -> usize {
        self.counters.polls.fetch_add(1, Ordering::Relaxed);
        let timeout = self.config.poll_timeout();

        let raw = match tokio::time::timeout(timeout, source.fetch_quotes()).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                self.counters.poll_failures.fetch_add(1, Ordering::Relaxed);
                warn!(source = source.name(), error = %e, "Quote poll failed");
                return 0;
            }
            Err(_) => {
                self.counters.poll_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    source = source.name(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Quote poll timed out"
                );
                return 0;
            }
        };

        self.counters.quotes.fetch_add(raw.len() as u64, Ordering::Relaxed);
        let now = Utc::now();
        let quotes: Vec<Quote> = raw
            .iter()
            .filter_map(|r| r.normalise(source.name(), source.fee_bps(), now))
            .collect();
        self.ingest(quotes)
    }

    /// Record quotes in the book, price new spreads and queue the candidates
    /// that clear the confidence floor.
    pub fn ingest(&self, quotes: Vec<Quote>) -> usize {
        let now = Utc::now();
        let candidates: Vec<Opportunity> = {
            let mut books = self.books.lock();
            let mut found = Vec::new();
            for quote in quotes {
                let book = books.entry(quote.asset.clone()).or_default();
                book.insert(quote.venue.clone(), quote.clone());
                found.extend(detect(book, &quote, &self.config, now));
            }
            found
        };

        let floor = self.settings.confidence_floor();
        let mut queued = 0;
        for opp in candidates {
            if opp.confidence < floor {
                self.counters.below_floor.fetch_add(1, Ordering::Relaxed);
                debug!(key = %opp.key, confidence = %opp.confidence, "Below confidence floor, dropped");
                continue;
            }
            self.remember(&opp);
            match self.queue.push(opp) {
                PushOutcome::Closed => break,
                PushOutcome::Debounced => {}
                _ => {
                    queued += 1;
                    self.counters.emitted.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        queued
    }

    fn remember(&self, opp: &Opportunity) {
        let mut recent = self.recent.lock();
        if recent.len() >= self.config.recent_opportunities {
            recent.pop_front();
        }
        if self.config.recent_opportunities > 0 {
            recent.push_back(opp.clone());
        }
    }

    /// Most recent opportunities, newest first.
    pub fn recent(&self) -> Vec<Opportunity> {
        self.recent.lock().iter().rev().cloned().collect()
    }

    pub fn stats(&self) -> ScannerStats {
        ScannerStats {
            polls: self.counters.polls.load(Ordering::Relaxed),
            poll_failures: self.counters.poll_failures.load(Ordering::Relaxed),
            quotes: self.counters.quotes.load(Ordering::Relaxed),
            emitted: self.counters.emitted.load(Ordering::Relaxed),
            below_floor: self.counters.below_floor.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
