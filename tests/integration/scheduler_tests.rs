//! End-to-end scheduler scenarios against stub collaborators

use crate::support::{
    blocked, create_identity_pool, create_scheduler, create_test_settings, create_units,
    ScriptedExecutor,
};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sumi_sluice::progress::{MemoryProgressBackend, ProgressRecord, ProgressStore};
use sumi_sluice::state::UnitStatus;
use sumi_sluice::work::{ExecutionOutput, FailureKind, UnitOutcome, WorkKind, WorkUnit};
use sumi_sluice::SluiceError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn create_store(backend: &MemoryProgressBackend) -> Arc<ProgressStore> {
    Arc::new(ProgressStore::open(backend.clone(), 5, Duration::from_secs(30)).unwrap())
}

#[tokio::test(start_paused = true)]
async fn test_blocked_unit_completes_on_third_attempt() {
    let executor = ScriptedExecutor::new(|_, unit| {
        if unit.id == "7" && unit.attempt <= 2 {
            Err(blocked())
        } else {
            Ok(ExecutionOutput::new("{}", 2))
        }
    });
    let identities = create_identity_pool(1);
    let store = Arc::new(ProgressStore::in_memory());
    let scheduler = create_scheduler(
        create_test_settings(),
        Arc::clone(&identities),
        executor.clone(),
        Arc::clone(&store),
    );

    let report = scheduler.run(create_units(10), 2).await.unwrap();

    assert_eq!(report.succeeded(), 10);
    let unit = report.get("7").unwrap();
    assert_eq!(unit.attempts, 3);
    assert_eq!(unit.outcome, UnitOutcome::Succeeded { items: 2 });

    let attempts: Vec<u32> = executor
        .calls_for("7")
        .iter()
        .map(|call| call.attempt)
        .collect();
    assert_eq!(attempts, vec![1, 2, 3]);

    let identity = identities.get("acct-1").await.unwrap();
    assert_eq!(identity.error_count, 0);
    assert!(identity.healthy);
    assert!(!identity.busy);

    assert_eq!(scheduler.classifier().block_events().await, 2);
    let stats = store.stats().await;
    assert_eq!(stats.succeeded, 10);
    assert_eq!(stats.retried, 2);
    assert_eq!(stats.items_produced, 20);
}

#[tokio::test(start_paused = true)]
async fn test_blocked_identity_is_not_reused_while_cooling() {
    let executor = ScriptedExecutor::new(|identity, unit| {
        if identity.id == "acct-1" && unit.attempt == 1 {
            Err(blocked())
        } else {
            Ok(ExecutionOutput::new("{}", 1))
        }
    });
    let identities = create_identity_pool(2);
    let scheduler = create_scheduler(
        create_test_settings(),
        Arc::clone(&identities),
        executor.clone(),
        Arc::new(ProgressStore::in_memory()),
    );

    let report = scheduler.run(create_units(6), 1).await.unwrap();
    assert_eq!(report.succeeded(), 6);

    // acct-1 is cooling for 15 minutes after its first block, far longer than
    // the remaining work takes on acct-2
    let calls = executor.calls();
    let first_block = calls
        .iter()
        .position(|call| call.identity == "acct-1")
        .unwrap();
    assert!(calls[first_block + 1..]
        .iter()
        .all(|call| call.identity == "acct-2"));
}

#[tokio::test(start_paused = true)]
async fn test_resume_does_not_redispatch_succeeded_unit() {
    let backend = MemoryProgressBackend::with_records([ProgressRecord {
        unit_id: "42".to_string(),
        status: UnitStatus::Success,
        updated_at: Utc::now(),
    }]);
    let executor = ScriptedExecutor::always_ok();
    let scheduler = create_scheduler(
        create_test_settings(),
        create_identity_pool(2),
        executor.clone(),
        create_store(&backend),
    );

    let units = vec![
        WorkUnit::new("41", WorkKind::PostDetail, ""),
        WorkUnit::new("42", WorkKind::PostDetail, ""),
        WorkUnit::new("43", WorkKind::PostDetail, ""),
    ];
    let report = scheduler.run(units, 2).await.unwrap();

    assert!(executor.calls_for("42").is_empty());
    assert_eq!(executor.calls().len(), 2);
    assert_eq!(report.get("42").unwrap().outcome, UnitOutcome::Skipped);
    assert_eq!(report.succeeded(), 2);
    assert_eq!(report.skipped(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_every_unit_ends_with_one_terminal_status() {
    let executor = ScriptedExecutor::new(|_, unit| {
        let n: u32 = unit.id.parse().unwrap();
        match n % 4 {
            0 => Err(FailureKind::Rejected("HTTP 404".to_string())),
            1 => Err(FailureKind::Timeout),
            2 if unit.attempt == 1 => Err(FailureKind::Malformed("empty body".to_string())),
            _ => Ok(ExecutionOutput::new("{}", 1)),
        }
    });
    let backend = MemoryProgressBackend::new();
    let store = create_store(&backend);
    let scheduler = create_scheduler(
        create_test_settings(),
        create_identity_pool(3),
        executor,
        Arc::clone(&store),
    );

    let units = create_units(20);
    let report = scheduler.run(units.clone(), 3).await.unwrap();

    assert_eq!(report.len(), 20);
    assert_eq!(report.failed(), 5);
    assert_eq!(report.abandoned(), 5);
    assert_eq!(report.succeeded(), 10);

    let reported: HashSet<&str> = report
        .results()
        .iter()
        .map(|result| result.unit_id.as_str())
        .collect();
    assert_eq!(reported.len(), 20);

    let succeeded: HashSet<String> = store
        .ids_with_status(UnitStatus::Success)
        .await
        .into_iter()
        .collect();
    let failed: HashSet<String> = store
        .ids_with_status(UnitStatus::Failed)
        .await
        .into_iter()
        .collect();
    assert!(succeeded.is_disjoint(&failed));
    assert_eq!(succeeded.len() + failed.len(), 20);
    assert!(units
        .iter()
        .all(|unit| succeeded.contains(&unit.id) || failed.contains(&unit.id)));

    // Durable state matches after the final flush
    let reopened = create_store(&backend);
    let counts = reopened.status_counts().await;
    assert_eq!(counts.success, 10);
    assert_eq!(counts.failed, 10);
    assert_eq!(counts.pending, 0);
}

#[tokio::test(start_paused = true)]
async fn test_fifteen_transient_failures_pause_the_run_once() {
    let executor = ScriptedExecutor::new(|_, unit| {
        if unit.id.starts_with('t') {
            Err(FailureKind::Network("connection refused".to_string()))
        } else {
            Ok(ExecutionOutput::new("{}", 1))
        }
    });
    let mut settings = create_test_settings();
    settings.scheduler.max_attempts = 1;
    let scheduler = create_scheduler(
        settings,
        create_identity_pool(2),
        executor.clone(),
        Arc::new(ProgressStore::in_memory()),
    );

    let mut units: Vec<WorkUnit> = (1..=15)
        .map(|i| WorkUnit::new(format!("t{}", i), WorkKind::SearchPage, "keyword"))
        .collect();
    units.push(WorkUnit::new("ok", WorkKind::SearchPage, "keyword").with_priority(1));

    let start = Instant::now();
    let report = scheduler.run(units, 1).await.unwrap();

    assert_eq!(report.abandoned(), 15);
    assert_eq!(report.succeeded(), 1);
    assert_eq!(scheduler.classifier().long_pauses().await, 1);
    assert_eq!(scheduler.classifier().consecutive_timeouts().await, 7);
    assert!(start.elapsed() >= Duration::from_secs(300));
    assert_eq!(executor.calls().last().unwrap().unit, "ok");
}

#[tokio::test(start_paused = true)]
async fn test_block_ceiling_aborts_and_flushes() {
    let executor = ScriptedExecutor::new(|_, _| Err(blocked()));
    let mut settings = create_test_settings();
    settings.scheduler.max_attempts = 10;
    let backend = MemoryProgressBackend::new();
    let scheduler = create_scheduler(
        settings,
        create_identity_pool(8),
        executor.clone(),
        create_store(&backend),
    );

    let result = scheduler.run(create_units(4), 2).await;

    match result {
        Err(SluiceError::BlockCeilingExceeded { blocks, ceiling }) => {
            assert_eq!(blocks, 7);
            assert_eq!(ceiling, 6);
        }
        other => panic!("expected block ceiling error, got {:?}", other.map(|r| r.len())),
    }
    assert_eq!(executor.calls().len(), 7);

    // Every unit was left pending and written out before returning
    assert!(backend.persist_calls() >= 1);
    let reopened = create_store(&backend);
    let counts = reopened.status_counts().await;
    assert_eq!(counts.pending, 4);
    assert_eq!(counts.success + counts.failed, 0);
}

#[tokio::test(start_paused = true)]
async fn test_no_healthy_identity_is_fatal() {
    let identities = create_identity_pool(1);
    identities.mark_dead("acct-1").await;
    let executor = ScriptedExecutor::always_ok();
    let scheduler = create_scheduler(
        create_test_settings(),
        identities,
        executor.clone(),
        Arc::new(ProgressStore::in_memory()),
    );

    let result = scheduler.run(create_units(3), 2).await;

    assert!(matches!(result, Err(SluiceError::NoIdentityAvailable)));
    assert!(executor.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_leaves_unfinished_units_pending() {
    let executor = ScriptedExecutor::always_ok();
    let backend = MemoryProgressBackend::new();
    let store = create_store(&backend);
    let scheduler = create_scheduler(
        create_test_settings(),
        create_identity_pool(1),
        executor.clone(),
        Arc::clone(&store),
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let units = create_units(20);
    let report = scheduler
        .run_with_cancellation(units.clone(), 1, cancel)
        .await
        .unwrap();

    let done = report.succeeded();
    assert!(done > 0);
    assert!(done < 20);
    assert_eq!(report.interrupted(), 20 - done);
    assert_eq!(report.len(), 20);

    let reopened = create_store(&backend);
    let counts = reopened.status_counts().await;
    assert_eq!(counts.success as usize, done);
    assert_eq!(counts.pending as usize, 20 - done);

    // A resumed run only dispatches what was left
    let executor = ScriptedExecutor::always_ok();
    let resumed = create_scheduler(
        create_test_settings(),
        create_identity_pool(1),
        executor.clone(),
        reopened,
    );
    let report = resumed.run(units, 2).await.unwrap();
    assert_eq!(report.skipped(), done);
    assert_eq!(report.succeeded(), 20 - done);
    assert_eq!(executor.calls().len(), 20 - done);
}

#[tokio::test(start_paused = true)]
async fn test_resubmission_recovers_abandoned_unit() {
    let flaky_calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&flaky_calls);
    let executor = ScriptedExecutor::new(move |_, unit| {
        if unit.id == "flaky" && counter.fetch_add(1, Ordering::SeqCst) < 3 {
            Err(FailureKind::Timeout)
        } else {
            Ok(ExecutionOutput::new("{}", 1))
        }
    });
    let mut settings = create_test_settings();
    settings.scheduler.resubmit_rounds = 2;
    let store = Arc::new(ProgressStore::in_memory());
    let scheduler = create_scheduler(
        settings,
        create_identity_pool(2),
        executor.clone(),
        Arc::clone(&store),
    );

    let units = vec![
        WorkUnit::new("flaky", WorkKind::CommentPage, "page=1"),
        WorkUnit::new("steady", WorkKind::CommentPage, "page=1"),
    ];
    let report = scheduler
        .run_with_resubmission(units, 2, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.len(), 2);
    assert_eq!(report.succeeded(), 2);
    let flaky = report.get("flaky").unwrap();
    assert_eq!(flaky.attempts, 1);

    let attempts: Vec<u32> = executor
        .calls_for("flaky")
        .iter()
        .map(|call| call.attempt)
        .collect();
    assert_eq!(attempts, vec![1, 2, 3, 1]);

    assert_eq!(store.status_of("flaky").await, Some(UnitStatus::Success));
    let stats = store.stats().await;
    assert_eq!(stats.processed, 2);
    assert_eq!(stats.succeeded, 2);
    assert_eq!(stats.failed, 0);
}

#[tokio::test(start_paused = true)]
async fn test_resubmission_rounds_are_bounded() {
    let executor = ScriptedExecutor::new(|_, _| Err(FailureKind::Timeout));
    let mut settings = create_test_settings();
    settings.scheduler.max_attempts = 2;
    settings.scheduler.resubmit_rounds = 2;
    let scheduler = create_scheduler(
        settings,
        create_identity_pool(1),
        executor.clone(),
        Arc::new(ProgressStore::in_memory()),
    );

    let report = scheduler
        .run_with_resubmission(create_units(1), 1, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.abandoned(), 1);
    // Initial run plus two resubmissions, two attempts each
    assert_eq!(executor.calls().len(), 6);
}
