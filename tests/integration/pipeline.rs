//! Scan queue → orchestrator → executor → accountant, end to end.

use rust_decimal_macros::dec;
use std::collections::HashSet;
use std::time::Duration;

use arbiter::storage::AuditEvent;
use arbiter::strategy::scoring::base_score;
use arbiter::strategy::Decision;
use arbiter::types::{ExecutionStatus, HaltReason, ProviderRole, RejectReason};

use crate::mock_backend::{config, engine, opportunity, wait_for, Behaviour, Running, ScriptedTransport};

#[tokio::test]
async fn test_example_opportunity_settles_and_is_audited_once() {
    let transport = ScriptedTransport::new(Behaviour::Settle {
        value: dec!(500),
        cost: dec!(50),
    });
    let (engine, audit) = engine(&config(5), transport.clone()).await;

    let opp = opportunity(1, dec!(5), dec!(500), dec!(50), dec!(0.9));
    assert_eq!(base_score(&opp), dec!(405));
    engine.queue.push(opp.clone());

    let running = Running::start(&engine);
    wait_for("settlement", || engine.pipeline_stats().settled == 1).await;
    running.stop().await;

    let state = engine.risk.snapshot();
    assert_eq!(state.realized_pnl, dec!(450));
    assert_eq!(state.executions, 1);
    assert!(state.exposure.is_empty());

    let events = audit.events().await.unwrap();
    assert_eq!(events.len(), 1);
    let AuditEvent::Execution(result) = &events[0] else {
        panic!("expected an execution record");
    };
    assert_eq!(result.status, ExecutionStatus::Success);
    assert_eq!(result.opportunity_id, opp.id);
    assert_eq!(result.provider.as_deref(), Some("relay-a"));
    assert_eq!(result.attempts, 1);
    assert_eq!(transport.submissions().len(), 1);
}

#[tokio::test]
async fn test_three_failures_halt_and_block_new_signals() {
    let transport = ScriptedTransport::new(Behaviour::Revert { cost: dec!(2) });
    let (engine, audit) = engine(&config(5), transport).await;

    for bucket in 1..=3 {
        engine
            .queue
            .push(opportunity(bucket, dec!(1), dec!(500), dec!(50), dec!(0.9)));
    }
    let running = Running::start(&engine);
    wait_for("three results", || engine.pipeline_stats().settled == 3).await;
    assert!(engine.risk.is_halted());
    assert_eq!(
        engine.risk.snapshot().halt_reason,
        Some(HaltReason::ConsecutiveFailures { count: 3, limit: 3 })
    );

    // A far better opportunity is still turned away.
    engine
        .queue
        .push(opportunity(4, dec!(1), dec!(100000), dec!(1), dec!(1)));
    wait_for("halted rejection", || {
        engine.orchestrator.stats().rejected.get("halted") == Some(&1)
    })
    .await;
    running.stop().await;

    assert!(matches!(
        engine
            .orchestrator
            .evaluate(&opportunity(5, dec!(1), dec!(100000), dec!(1), dec!(1))),
        Decision::Rejected { reason: RejectReason::Halted, .. }
    ));
    assert_eq!(engine.pipeline_stats().signals_sent, 3);

    let kinds: Vec<&str> = audit.events().await.unwrap().iter().map(AuditEvent::kind).collect();
    assert_eq!(kinds, vec!["execution", "execution", "execution", "halt"]);
}

#[tokio::test]
async fn test_halt_lets_in_flight_execution_finish() {
    let transport = ScriptedTransport::new(Behaviour::Revert { cost: dec!(2) });
    let (engine, audit) = engine(&config(5), transport.clone()).await;
    let running = Running::start(&engine);

    for bucket in 1..=2 {
        engine
            .queue
            .push(opportunity(bucket, dec!(1), dec!(500), dec!(50), dec!(0.9)));
    }
    wait_for("two failures", || engine.pipeline_stats().settled == 2).await;
    assert!(!engine.risk.is_halted());

    // The slow signal is submitted, then a third failure trips the breaker.
    transport.then(Behaviour::Slow {
        delay: Duration::from_millis(300),
        value: dec!(500),
        cost: dec!(50),
    });
    engine
        .queue
        .push(opportunity(3, dec!(1), dec!(500), dec!(50), dec!(0.9)));
    wait_for("slow submission", || transport.submissions().len() == 3).await;
    engine
        .queue
        .push(opportunity(4, dec!(1), dec!(500), dec!(50), dec!(0.9)));
    wait_for("third failure", || engine.pipeline_stats().settled == 3).await;
    assert!(engine.risk.is_halted());

    wait_for("in-flight result", || engine.pipeline_stats().settled == 4).await;
    running.stop().await;

    let state = engine.risk.snapshot();
    assert!(state.is_halted());
    assert_eq!(state.executions, 4);
    assert_eq!(state.realized_pnl, dec!(444));
    assert!(state.exposure.is_empty());

    let events = audit.events().await.unwrap();
    let kinds: Vec<&str> = events.iter().map(AuditEvent::kind).collect();
    assert_eq!(kinds, vec!["execution", "execution", "execution", "halt", "execution"]);
    let AuditEvent::Execution(last) = &events[4] else {
        panic!("expected an execution record");
    };
    assert_eq!(last.status, ExecutionStatus::Success);
}

#[tokio::test]
async fn test_failover_to_next_relay() {
    let transport = ScriptedTransport::new(Behaviour::Settle {
        value: dec!(500),
        cost: dec!(50),
    });
    transport.set("relay-a", Behaviour::Down);
    let (engine, audit) = engine(&config(1), transport.clone()).await;

    engine
        .queue
        .push(opportunity(1, dec!(5), dec!(500), dec!(50), dec!(0.9)));
    let running = Running::start(&engine);
    wait_for("settlement", || engine.pipeline_stats().settled == 1).await;
    running.stop().await;

    let events = audit.events().await.unwrap();
    let AuditEvent::Execution(result) = &events[0] else {
        panic!("expected an execution record");
    };
    assert_eq!(result.status, ExecutionStatus::Success);
    assert_eq!(result.provider.as_deref(), Some("relay-b"));
    assert_eq!(result.attempts, 2);

    // The demoted relay is no longer the best choice.
    assert_eq!(engine.registry.best(ProviderRole::Execution).unwrap().name, "relay-b");
    assert_eq!(engine.executor.stats().failovers, 1);

    let tried: Vec<String> = transport.submissions().into_iter().map(|(p, _)| p).collect();
    assert_eq!(tried, vec!["relay-a".to_string(), "relay-b".to_string()]);
}

#[tokio::test]
async fn test_no_relay_left_fails_signal_without_crashing() {
    let transport = ScriptedTransport::new(Behaviour::Down);
    let (engine, audit) = engine(&config(1), transport.clone()).await;

    engine
        .queue
        .push(opportunity(1, dec!(5), dec!(500), dec!(50), dec!(0.9)));
    let running = Running::start(&engine);
    wait_for("settlement", || engine.pipeline_stats().settled == 1).await;
    running.stop().await;

    let events = audit.events().await.unwrap();
    let AuditEvent::Execution(result) = &events[0] else {
        panic!("expected an execution record");
    };
    assert_eq!(result.status, ExecutionStatus::Failed);
    // Both relays tried once, then nothing healthy remains.
    assert_eq!(transport.submissions().len(), 2);
    assert!(!engine.registry.is_available(ProviderRole::Execution));
    assert_eq!(engine.risk.snapshot().consecutive_failures, 1);
}

#[tokio::test]
async fn test_each_signal_recorded_exactly_once() {
    let transport = ScriptedTransport::new(Behaviour::Settle {
        value: dec!(100),
        cost: dec!(10),
    });
    transport.set("relay-a", Behaviour::Down);
    let (engine, audit) = engine(&config(5), transport.clone()).await;

    for bucket in 1..=6 {
        engine
            .queue
            .push(opportunity(bucket, dec!(1), dec!(100), dec!(10), dec!(0.9)));
    }
    let running = Running::start(&engine);
    wait_for("six results", || engine.pipeline_stats().settled == 6).await;
    running.stop().await;

    let events = audit.events().await.unwrap();
    let signals: HashSet<_> = events
        .iter()
        .filter_map(|e| match e {
            AuditEvent::Execution(r) => Some(r.signal_id),
            _ => None,
        })
        .collect();
    assert_eq!(signals.len(), 6);
    assert_eq!(events.len(), 6);
    // Retries happened, but not as extra records.
    assert!(transport.submissions().len() > 6);
    assert_eq!(engine.risk.snapshot().realized_pnl, dec!(540));
}

#[tokio::test]
async fn test_replay_reproduces_live_state() {
    let transport = ScriptedTransport::new(Behaviour::Settle {
        value: dec!(500),
        cost: dec!(50),
    });
    let cfg = config(5);
    let (engine, audit) = engine(&cfg, transport.clone()).await;
    let running = Running::start(&engine);

    engine
        .queue
        .push(opportunity(1, dec!(5), dec!(500), dec!(50), dec!(0.9)));
    wait_for("first result", || engine.pipeline_stats().settled == 1).await;

    transport.set_default(Behaviour::Revert { cost: dec!(3) });
    for bucket in 2..=4 {
        engine
            .queue
            .push(opportunity(bucket, dec!(1), dec!(500), dec!(50), dec!(0.9)));
    }
    wait_for("halt", || engine.pipeline_stats().settled == 4).await;
    running.stop().await;
    assert!(engine.risk.is_halted());

    assert!(engine.accountant.reset_halt().await.unwrap());
    let live = engine.risk.snapshot();

    let registry = std::sync::Arc::new(arbiter::providers::ProviderRegistry::new(
        &cfg.providers,
        cfg.registry.clone(),
    ));
    let restarted = arbiter::engine::Engine::build(&cfg, registry, transport, audit).unwrap();
    let replayed = restarted.restore().await.unwrap();

    assert_eq!(*replayed, *live);
    assert_eq!(replayed.realized_pnl, dec!(441));
    assert!(!replayed.is_halted());
}
