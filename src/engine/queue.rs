//! Bounded, deduplicating opportunity queue between the scanner and the
//! orchestrator pool.
//!
//! - At most one live entry per `OpportunityKey`. A newer opportunity with
//!   the same key replaces the queued one in place while inside the debounce
//!   window; outside it, the stale entry is dropped and the newer one queued
//!   at the back.
//! - A key handed to a consumer stays claimed for one debounce window:
//!   same-key arrivals in that window are dropped.
//! - When full, the oldest entry is evicted. `push` never waits.
//! - Expired entries are discarded on `pop`.

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::debug;

use crate::types::{Opportunity, OpportunityKey};

/// What happened to a pushed opportunity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Replaced a queued entry with the same key inside the debounce window.
    Replaced,
    /// Superseded a queued entry with the same key outside the window.
    Superseded,
    /// Dropped: the same key was handed to a consumer inside the window.
    Debounced,
    /// Queued after evicting the oldest entry.
    Evicted(OpportunityKey),
    Closed,
}

/// Lifetime counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub depth: usize,
    pub pushed: u64,
    pub deduplicated: u64,
    pub evicted: u64,
    pub expired: u64,
    pub popped: u64,
}

struct Entry {
    opportunity: Opportunity,
    enqueued_at: Instant,
}

#[derive(Default)]
struct Inner {
    entries: VecDeque<Entry>,
    /// Keys recently handed out, with the time they were popped.
    claimed: HashMap<OpportunityKey, Instant>,
    closed: bool,
    stats: QueueStats,
}

pub struct OpportunityQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
    debounce: Duration,
    ttl: Duration,
}

impl OpportunityQueue {
    pub fn new(capacity: usize, debounce: Duration, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
            debounce,
            ttl,
        }
    }

    pub fn push(&self, opportunity: Opportunity) -> PushOutcome {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        if inner.closed {
            return PushOutcome::Closed;
        }
        inner.stats.pushed += 1;

        let debounce = self.debounce;
        inner
            .claimed
            .retain(|_, popped_at| now.duration_since(*popped_at) < debounce);
        if inner.claimed.contains_key(&opportunity.key) {
            inner.stats.deduplicated += 1;
            debug!(key = %opportunity.key, "Opportunity dropped, key already taken within debounce window");
            return PushOutcome::Debounced;
        }

        let existing = inner
            .entries
            .iter()
            .position(|e| e.opportunity.key == opportunity.key);

        let mut outcome = PushOutcome::Queued;
        if let Some(idx) = existing {
            inner.stats.deduplicated += 1;
            if now.duration_since(inner.entries[idx].enqueued_at) < self.debounce {
                inner.entries[idx].opportunity = opportunity;
                debug!(key = %inner.entries[idx].opportunity.key, "Opportunity replaced within debounce window");
                return PushOutcome::Replaced;
            }
            inner.entries.remove(idx);
            outcome = PushOutcome::Superseded;
        }

        if inner.entries.len() >= self.capacity {
            if let Some(oldest) = inner.entries.pop_front() {
                inner.stats.evicted += 1;
                debug!(key = %oldest.opportunity.key, "Queue full, oldest opportunity evicted");
                outcome = PushOutcome::Evicted(oldest.opportunity.key);
            }
        }

        inner.entries.push_back(Entry {
            opportunity,
            enqueued_at: now,
        });
        drop(inner);
        self.notify.notify_one();
        outcome
    }

    /// Wait for the next live opportunity. Returns `None` once the queue is
    /// closed and drained.
    pub async fn pop(&self) -> Option<Opportunity> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(next) = self.try_pop() {
                return Some(next);
            }
            if self.inner.lock().closed {
                return None;
            }
            notified.await;
        }
    }

    /// Next live opportunity without waiting.
    pub fn try_pop(&self) -> Option<Opportunity> {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        while let Some(entry) = inner.entries.pop_front() {
            if entry.opportunity.is_expired(self.ttl, now) {
                inner.stats.expired += 1;
                debug!(key = %entry.opportunity.key, "Expired opportunity discarded");
                continue;
            }
            inner.stats.popped += 1;
            if !self.debounce.is_zero() {
                inner
                    .claimed
                    .insert(entry.opportunity.key.clone(), Instant::now());
            }
            return Some(entry.opportunity);
        }
        None
    }

    /// Stop accepting opportunities and wake every waiting consumer.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        QueueStats {
            depth: inner.entries.len(),
            ..inner.stats.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::tests::sample_opportunity;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn keyed(bucket: i64) -> Opportunity {
        let mut opp = sample_opportunity(dec!(500), dec!(50), dec!(0.9));
        opp.key.price_bucket = bucket;
        opp
    }

    fn queue(capacity: usize, debounce_ms: u64) -> OpportunityQueue {
        OpportunityQueue::new(
            capacity,
            Duration::from_millis(debounce_ms),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn test_same_key_within_window_keeps_latest() {
        let q = queue(8, 10_000);
        let first = keyed(1);
        let mut second = keyed(1);
        second.gross_value = dec!(600);

        assert_eq!(q.push(first), PushOutcome::Queued);
        assert_eq!(q.push(second.clone()), PushOutcome::Replaced);
        assert_eq!(q.len(), 1);
        assert_eq!(q.try_pop().unwrap().id, second.id);
        assert!(q.try_pop().is_none());
    }

    #[test]
    fn test_same_key_outside_window_moves_to_back() {
        let q = queue(8, 0);
        let a = keyed(1);
        let b = keyed(2);
        let a2 = keyed(1);

        q.push(a);
        q.push(b.clone());
        assert_eq!(q.push(a2.clone()), PushOutcome::Superseded);
        assert_eq!(q.len(), 2);
        assert_eq!(q.try_pop().unwrap().id, b.id);
        assert_eq!(q.try_pop().unwrap().id, a2.id);
    }

    #[test]
    fn test_same_key_after_pop_within_window_dropped() {
        let q = queue(8, 10_000);
        let first = keyed(1);
        q.push(first.clone());
        assert_eq!(q.try_pop().unwrap().id, first.id);

        assert_eq!(q.push(keyed(1)), PushOutcome::Debounced);
        assert!(q.try_pop().is_none());
        assert_eq!(q.stats().deduplicated, 1);

        // Other keys are unaffected.
        assert_eq!(q.push(keyed(2)), PushOutcome::Queued);
    }

    #[test]
    fn test_same_key_after_pop_outside_window_queued() {
        let q = queue(8, 20);
        q.push(keyed(1));
        q.try_pop().unwrap();
        std::thread::sleep(Duration::from_millis(30));

        let again = keyed(1);
        assert_eq!(q.push(again.clone()), PushOutcome::Queued);
        assert_eq!(q.try_pop().unwrap().id, again.id);
    }

    #[test]
    fn test_full_queue_evicts_oldest() {
        let q = queue(2, 0);
        let oldest = keyed(1);
        q.push(oldest.clone());
        q.push(keyed(2));
        let outcome = q.push(keyed(3));
        assert_eq!(outcome, PushOutcome::Evicted(oldest.key));
        assert_eq!(q.len(), 2);
        assert_eq!(q.try_pop().unwrap().key.price_bucket, 2);
        assert_eq!(q.stats().evicted, 1);
    }

    #[test]
    fn test_expired_entries_skipped() {
        let q = OpportunityQueue::new(8, Duration::ZERO, Duration::from_millis(100));
        let mut stale = keyed(1);
        stale.detected_at = Utc::now() - chrono::Duration::seconds(10);
        let fresh = keyed(2);
        q.push(stale);
        q.push(fresh.clone());

        assert_eq!(q.try_pop().unwrap().id, fresh.id);
        assert_eq!(q.stats().expired, 1);
    }

    #[test]
    fn test_closed_queue_rejects_push() {
        let q = queue(8, 0);
        q.close();
        assert_eq!(q.push(keyed(1)), PushOutcome::Closed);
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let q = Arc::new(queue(8, 0));
        let consumer = {
            let q = q.clone();
            tokio::spawn(async move { q.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let opp = keyed(7);
        q.push(opp.clone());
        let got = consumer.await.unwrap().unwrap();
        assert_eq!(got.id, opp.id);
    }

    #[tokio::test]
    async fn test_close_wakes_waiting_consumers() {
        let q = Arc::new(queue(8, 0));
        let consumer = {
            let q = q.clone();
            tokio::spawn(async move { q.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.close();
        assert!(consumer.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_drains_remaining_entries() {
        let q = queue(8, 0);
        q.push(keyed(1));
        q.close();
        assert!(q.pop().await.is_some());
        assert!(q.pop().await.is_none());
    }
}
