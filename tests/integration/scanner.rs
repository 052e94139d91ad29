//! Scanner polling into the deduplicating queue.

use rust_decimal_macros::dec;

use crate::mock_backend::{config, engine, Behaviour, ScriptedSource, ScriptedTransport};

#[tokio::test]
async fn test_repeated_spread_within_debounce_keeps_one_entry() {
    let transport = ScriptedTransport::new(Behaviour::Down);
    let (engine, _) = engine(&config(5), transport).await;

    let a = ScriptedSource::new("venue-a", dec!(0));
    let b = ScriptedSource::new("venue-b", dec!(0));
    a.quote("eth", dec!(2000), dec!(5));
    b.quote("eth", dec!(2010), dec!(5));

    assert_eq!(engine.scanner.poll_once(&a).await, 0);
    assert_eq!(engine.scanner.poll_once(&b).await, 1);
    // Same venues, same price bucket, inside the 200ms window.
    assert_eq!(engine.scanner.poll_once(&b).await, 1);

    assert_eq!(engine.queue.len(), 1);
    let stats = engine.queue.stats();
    assert_eq!(stats.deduplicated, 1);

    let opp = engine.queue.try_pop().unwrap();
    assert_eq!(opp.gross_value, dec!(50));
    assert_eq!(opp.key.buy_venue, "venue-a");
    assert_eq!(opp.key.sell_venue, "venue-b");
    assert!(engine.queue.try_pop().is_none());
}

#[tokio::test]
async fn test_low_confidence_never_queued() {
    let transport = ScriptedTransport::new(Behaviour::Down);
    let (engine, _) = engine(&config(5), transport).await;

    let a = ScriptedSource::new("venue-a", dec!(0));
    let b = ScriptedSource::new("venue-b", dec!(0));
    // Depth ratio 0.01 keeps confidence near 0.5 × freshness.
    a.quote("eth", dec!(2000), dec!(100));
    b.quote("eth", dec!(2010), dec!(1));
    engine
        .settings
        .apply(&arbiter::settings::SettingsUpdate {
            confidence_floor: Some(dec!(0.6)),
            ..Default::default()
        })
        .unwrap();

    engine.scanner.poll_once(&a).await;
    assert_eq!(engine.scanner.poll_once(&b).await, 0);
    assert!(engine.queue.is_empty());
    assert_eq!(engine.scanner.stats().below_floor, 1);
}

#[tokio::test]
async fn test_spread_taken_by_worker_not_requeued_within_debounce() {
    let transport = ScriptedTransport::new(Behaviour::Down);
    let (engine, _) = engine(&config(5), transport).await;

    let a = ScriptedSource::new("venue-a", dec!(0));
    let b = ScriptedSource::new("venue-b", dec!(0));
    a.quote("eth", dec!(2000), dec!(5));
    b.quote("eth", dec!(2010), dec!(5));

    engine.scanner.poll_once(&a).await;
    assert_eq!(engine.scanner.poll_once(&b).await, 1);
    assert!(engine.queue.try_pop().is_some());

    // A second source task sees the same spread right after a worker took it.
    assert_eq!(engine.scanner.poll_once(&b).await, 0);
    assert!(engine.queue.try_pop().is_none());
    assert_eq!(engine.queue.stats().deduplicated, 1);
}
