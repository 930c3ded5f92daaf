use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::broadcast;

use bandit::Arm;
use common::{
    DemotionReason, Direction, EngineEvent, ObjectiveVector, Outcome, OutcomeStore, Phase,
    PriceBar, PricePath, RiskConfiguration, SourceKey,
};
use engine::{
    Engine, EngineConfig, EngineHandle, Ingest, LifecycleConfig, MemoryStore, SelectionState,
    SelectionStore, Stores,
};
use optimizer::{OptimizerConfig, SearchSpaceConfig};

fn key() -> SourceKey {
    SourceKey::new("BTCUSDT", Direction::Long, "tradingview")
}

fn config() -> EngineConfig {
    EngineConfig {
        optimizer: OptimizerConfig {
            trials: 100,
            timeout_secs: None,
            n_jobs: 2,
            seed: Some(1),
            search_space: SearchSpaceConfig {
                take_profit_pct: vec![1.0, 2.0, 3.0],
                stop_loss_pct: vec![1.0, 2.0],
                trailing: vec![],
                breakeven_pct: vec![],
            },
            ..OptimizerConfig::default()
        },
        lifecycle: LifecycleConfig {
            live_window: 10,
            max_consecutive_losses: 3,
            retry_interval_secs: 3600,
            ..LifecycleConfig::default()
        },
        ..EngineConfig::default()
    }
}

fn at(i: usize) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap() + chrono::Duration::minutes(i as i64 * 15)
}

/// Steady move of 0.4% per bar for eight bars, up for winners and down for
/// losers, never retracing more than 0.3%.
fn path(id: &str, win: bool, start: DateTime<Utc>) -> PricePath {
    let sign = if win { 1.0 } else { -1.0 };
    let bars = (0..8)
        .map(|i| {
            let prev = 100.0 + sign * 0.4 * i as f64;
            let close = 100.0 + sign * 0.4 * (i + 1) as f64;
            let (high, low) = if win {
                (close + 0.1, prev - 0.2)
            } else {
                (prev + 0.2, close - 0.1)
            };
            PriceBar {
                timestamp: start + chrono::Duration::minutes(i as i64),
                high,
                low,
                close,
            }
        })
        .collect();
    PricePath {
        outcome_id: id.to_string(),
        entry_price: 100.0,
        bars,
    }
}

fn outcome(i: usize, win: bool, applied: Option<RiskConfiguration>) -> Outcome {
    Outcome {
        outcome_id: format!("o-{i}"),
        key: key(),
        realized_pnl_pct: if win { 2.0 } else { -1.0 },
        opened_at: at(i),
        closed_at: at(i) + chrono::Duration::minutes(10),
        applied_configuration: applied,
    }
}

/// 40 outcomes, 28 wins, 2:1 average win to loss.
fn baseline() -> Vec<(Outcome, PricePath)> {
    baseline_from(0)
}

/// Same sample, numbered from `first`.
fn baseline_from(first: usize) -> Vec<(Outcome, PricePath)> {
    (0..40)
        .map(|i| {
            let win = i % 10 < 7;
            let o = outcome(first + i, win, None);
            let p = path(&o.outcome_id, win, o.opened_at);
            (o, p)
        })
        .collect()
}

fn start(store: Arc<MemoryStore>, config: EngineConfig) -> (EngineHandle, broadcast::Receiver<EngineEvent>) {
    let (engine, handle) = Engine::new(config, Stores::single(store)).unwrap();
    let events = handle.subscribe();
    tokio::spawn(engine.run());
    (handle, events)
}

async fn wait_for<F>(events: &mut broadcast::Receiver<EngineEvent>, mut pred: F) -> EngineEvent
where
    F: FnMut(&EngineEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timeout waiting for engine event")
}

fn to_live(e: &EngineEvent) -> bool {
    matches!(e, EngineEvent::PhaseChanged { to: Phase::Live, .. })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_key_stays_in_baseline_and_is_not_selectable() {
    let (handle, _events) = start(Arc::new(MemoryStore::new()), config());
    assert_eq!(handle.phase(&key()).await, Phase::Baseline);
    assert!(handle.snapshot(&key()).await.is_none());
    assert_eq!(handle.select_config(&key()).await.unwrap(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn edge_leads_to_live_and_losses_demote() {
    let store = Arc::new(MemoryStore::new());
    for (_, p) in baseline() {
        store.insert_price_path(p).await;
    }
    let (handle, mut events) = start(store.clone(), config());

    for (o, _) in baseline() {
        handle.submit_outcome(o).await.unwrap();
    }

    let optimizing = wait_for(&mut events, |e| {
        matches!(e, EngineEvent::PhaseChanged { to: Phase::Optimizing, .. })
    })
    .await;
    assert!(matches!(
        optimizing,
        EngineEvent::PhaseChanged { from: Phase::Baseline, .. }
    ));

    let completed = wait_for(&mut events, |e| {
        matches!(e, EngineEvent::OptimizationCompleted { .. })
    })
    .await;
    match completed {
        EngineEvent::OptimizationCompleted {
            trials, front_size, candidates, ..
        } => {
            assert_eq!(trials, 6);
            assert!(front_size >= 1);
            assert_eq!(candidates, front_size.min(4));
        }
        other => panic!("unexpected event {other:?}"),
    }
    wait_for(&mut events, to_live).await;
    assert_eq!(handle.phase(&key()).await, Phase::Live);

    let selection = handle.select_config(&key()).await.unwrap().expect("live key selects");
    let snapshot = handle.snapshot(&key()).await.unwrap();
    assert!(snapshot
        .candidates
        .iter()
        .any(|a| a.config == selection.config && a.trial_id == selection.trial_id));

    // A win credited to the applied configuration.
    let ingest = handle
        .submit_outcome(outcome(100, true, Some(selection.config)))
        .await
        .unwrap();
    assert_eq!(ingest, Ingest::Accepted { phase: Phase::Live });
    let arm = handle
        .snapshot(&key())
        .await
        .unwrap()
        .candidates
        .into_iter()
        .find(|a| a.config == selection.config)
        .unwrap();
    assert_eq!((arm.alpha, arm.beta), (2.0, 1.0));

    // Four straight losses exceed the limit of three.
    for i in 101..105 {
        handle
            .submit_outcome(outcome(i, false, Some(selection.config)))
            .await
            .unwrap();
    }
    let demoted = wait_for(&mut events, |e| matches!(e, EngineEvent::Demoted { .. })).await;
    match demoted {
        EngineEvent::Demoted { from, to, reason, .. } => {
            assert_eq!(from, Phase::Live);
            assert_eq!(to, Phase::Optimizing);
            assert_eq!(reason, DemotionReason::ConsecutiveLosses { streak: 4, max: 3 });
        }
        other => panic!("unexpected event {other:?}"),
    }
    let state = store.load(&key()).await.unwrap().unwrap();
    assert_eq!(state.reoptimizations, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_outcomes_are_ignored() {
    let (handle, _events) = start(Arc::new(MemoryStore::new()), config());
    let o = outcome(0, true, None);
    assert_eq!(
        handle.submit_outcome(o.clone()).await.unwrap(),
        Ingest::Accepted { phase: Phase::Baseline }
    );
    assert_eq!(handle.submit_outcome(o).await.unwrap(), Ingest::Duplicate);

    let snapshot = handle.snapshot(&key()).await.unwrap();
    assert_eq!(snapshot.assessment.unwrap().sample_size, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_price_paths_fail_the_run_and_keep_optimizing() {
    let (handle, mut events) = start(Arc::new(MemoryStore::new()), config());
    for (o, _) in baseline() {
        handle.submit_outcome(o).await.unwrap();
    }
    let failed = wait_for(&mut events, |e| {
        matches!(e, EngineEvent::OptimizationFailed { .. })
    })
    .await;
    assert_eq!(failed.key(), &key());
    assert_eq!(handle.phase(&key()).await, Phase::Optimizing);

    let last_run = handle.snapshot(&key()).await.unwrap().last_run.unwrap();
    assert!(last_run.error.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restart_resumes_optimizing_keys() {
    let store = Arc::new(MemoryStore::new());
    for (o, p) in baseline() {
        store.append_outcome(&o).await.unwrap();
        store.insert_price_path(p).await;
    }
    let state = SelectionState {
        phase: Phase::Optimizing,
        ..SelectionState::new(key())
    };
    store.save(&state).await.unwrap();

    let (handle, mut events) = start(store, config());
    wait_for(&mut events, to_live).await;
    assert_eq!(handle.phase(&key()).await, Phase::Live);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deactivate_stops_the_worker() {
    let (handle, _events) = start(Arc::new(MemoryStore::new()), config());
    assert!(!handle.deactivate(&key()).await.unwrap());

    handle.submit_outcome(outcome(0, true, None)).await.unwrap();
    assert!(handle.deactivate(&key()).await.unwrap());
    assert!(!handle.deactivate(&key()).await.unwrap());

    // State survives; a new outcome brings the worker back.
    handle.submit_outcome(outcome(1, false, None)).await.unwrap();
    let snapshot = handle.snapshot(&key()).await.unwrap();
    assert_eq!(snapshot.assessment.unwrap().sample_size, 2);
}

fn live_arm() -> Arm {
    Arm::new(
        0,
        RiskConfiguration::fixed(3.0, 1.0),
        ObjectiveVector {
            win_rate: 0.7,
            risk_reward_ratio: 3.0,
            expected_value: 1.8,
        },
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hard_demoted_key_recovers_from_backfilled_outcomes() {
    let store = Arc::new(MemoryStore::new());
    let state = SelectionState {
        phase: Phase::Live,
        reoptimizations: 1,
        candidates: vec![live_arm()],
        ..SelectionState::new(key())
    };
    store.save(&state).await.unwrap();
    let (handle, mut events) = start(store.clone(), config());

    // Feed timestamps lie well before the engine's wall clock.
    for i in 0..4 {
        handle.submit_outcome(outcome(i, false, None)).await.unwrap();
    }
    let demoted = wait_for(&mut events, |e| matches!(e, EngineEvent::Demoted { .. })).await;
    assert!(matches!(
        demoted,
        EngineEvent::Demoted { from: Phase::Live, to: Phase::Baseline, .. }
    ));
    let snapshot = handle.snapshot(&key()).await.unwrap();
    assert_eq!(snapshot.baseline_since, Some(outcome(3, false, None).closed_at));

    for (o, p) in baseline_from(10) {
        store.insert_price_path(p).await;
        handle.submit_outcome(o).await.unwrap();
    }
    wait_for(&mut events, |e| {
        matches!(e, EngineEvent::PhaseChanged { from: Phase::Baseline, to: Phase::Optimizing, .. })
    })
    .await;
    let snapshot = handle.snapshot(&key()).await.unwrap();
    assert_eq!(snapshot.baseline_since, Some(outcome(3, false, None).closed_at));
    assert_eq!(snapshot.reoptimizations, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_reoptimization_hard_demotes_to_baseline() {
    let store = Arc::new(MemoryStore::new());
    for (o, p) in baseline() {
        store.append_outcome(&o).await.unwrap();
        store.insert_price_path(p).await;
    }
    let state = SelectionState {
        phase: Phase::Optimizing,
        reoptimizations: 1,
        ..SelectionState::new(key())
    };
    store.save(&state).await.unwrap();

    let mut cfg = config();
    cfg.lifecycle.promotion_min_win_rate = 0.99;
    let (handle, mut events) = start(store.clone(), cfg);

    wait_for(&mut events, |e| matches!(e, EngineEvent::OptimizationCompleted { .. })).await;
    let demoted = wait_for(&mut events, |e| matches!(e, EngineEvent::Demoted { .. })).await;
    match demoted {
        EngineEvent::Demoted { from, to, reason, .. } => {
            assert_eq!((from, to), (Phase::Optimizing, Phase::Baseline));
            match reason {
                DemotionReason::NoQualifyingCandidate { best_win_rate, bar, candidates } => {
                    assert!(best_win_rate < bar);
                    assert_eq!(bar, 0.99);
                    assert!(candidates >= 1);
                }
                other => panic!("unexpected reason {other:?}"),
            }
        }
        other => panic!("unexpected event {other:?}"),
    }

    let stored = store.load(&key()).await.unwrap().unwrap();
    assert_eq!(stored.phase, Phase::Baseline);
    assert_eq!(stored.reoptimizations, 0);
    assert_eq!(stored.baseline_since, Some(outcome(39, true, None).closed_at));
}
