//! Integration tests for the drain cycle: ordering, retry budget,
//! non-retryable failures, timeouts and unknown channels.

use std::sync::Arc;
use std::time::Duration;

use offline_queue::dispatch::{DispatchTable, HandlerError};
use offline_queue::drainer::connectivity::ConnectivityGate;
use offline_queue::drainer::events::DrainEvent;
use offline_queue::drainer::Drainer;
use offline_queue::models::attempt::AttemptOutcome;
use offline_queue::models::record::RecordStatus;
use offline_queue::persistence::attempt_repo::AttemptRepo;
use offline_queue::persistence::record_repo::RecordRepo;
use tokio::sync::mpsc;

use super::test_helpers::{fast_options, memory_db, table_with, ScriptedHandler};

fn transport(msg: &str) -> HandlerError {
    HandlerError::Transport(msg.into())
}

#[tokio::test]
async fn batch_drains_by_priority_then_age() {
    let db = memory_db().await;
    let repo = RecordRepo::new(Arc::clone(&db), 3);
    for (queue_id, priority, data) in [("a", 1, "p1"), ("b", 5, "p5-first"), ("c", 5, "p5-second"), ("d", 2, "p2")] {
        repo.enqueue("timelogs", queue_id, priority, data.as_bytes())
            .await
            .expect("enqueue");
    }

    let handler = ScriptedHandler::succeeding();
    let gate = ConnectivityGate::new(true);
    let drainer = Drainer::new(
        Arc::clone(&db),
        table_with(&["timelogs"], &handler),
        fast_options(3),
        gate.subscribe(),
    );

    let report = drainer.drain_cycle().await.expect("drain");
    assert_eq!(report.succeeded, 4);
    assert_eq!(
        handler.calls(),
        vec!["p5-first", "p5-second", "p2", "p1"],
        "records must be executed by priority desc, then enqueue order"
    );
}

#[tokio::test]
async fn retryable_failure_dies_after_max_attempts() {
    let db = memory_db().await;
    let repo = RecordRepo::new(Arc::clone(&db), 3);
    let record = repo
        .enqueue("timelogs", "retry-me", 0, b"{}")
        .await
        .expect("enqueue");

    let handler = ScriptedHandler::always(Err(transport("connection refused")));
    let gate = ConnectivityGate::new(true);
    let drainer = Drainer::new(
        Arc::clone(&db),
        table_with(&["timelogs"], &handler),
        fast_options(3),
        gate.subscribe(),
    );

    for expected_attempts in 1..=2 {
        let report = drainer.drain_cycle().await.expect("drain");
        assert_eq!(report.retried, 1);
        let current = repo.get(record.id).await.expect("get");
        assert_eq!(current.status, RecordStatus::Pending);
        assert_eq!(current.attempts, expected_attempts);
        assert!(current.finished_at.is_none());
        assert_eq!(current.last_error.as_deref(), Some("transport: connection refused"));
    }

    let report = drainer.drain_cycle().await.expect("drain");
    assert_eq!(report.dead, 1);

    let dead = repo.get(record.id).await.expect("get");
    assert_eq!(dead.status, RecordStatus::Dead);
    assert_eq!(dead.attempts, 3);
    assert!(dead.finished_at.is_some());

    let idle = drainer.drain_cycle().await.expect("drain");
    assert_eq!(idle.selected, 0, "dead records are never selected again");
    assert_eq!(handler.call_count(), 3);

    let attempts = AttemptRepo::new(Arc::clone(&db))
        .list_for_record(record.id)
        .await
        .expect("attempts");
    assert_eq!(attempts.len(), 3);
    assert!(attempts
        .iter()
        .all(|a| a.outcome == AttemptOutcome::TransportError));
    assert_eq!(
        attempts.iter().map(|a| a.attempt).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
}

#[tokio::test]
async fn rejected_record_dies_after_one_attempt() {
    let db = memory_db().await;
    let repo = RecordRepo::new(Arc::clone(&db), 5);
    let record = repo
        .enqueue("timelogs", "bad-payload", 0, b"{}")
        .await
        .expect("enqueue");

    let handler = ScriptedHandler::always(Err(HandlerError::Rejected("http status 422".into())));
    let gate = ConnectivityGate::new(true);
    let drainer = Drainer::new(
        Arc::clone(&db),
        table_with(&["timelogs"], &handler),
        fast_options(5),
        gate.subscribe(),
    );

    let report = drainer.drain_cycle().await.expect("drain");
    assert_eq!(report.dead, 1);
    assert_eq!(report.retried, 0);

    let dead = repo.get(record.id).await.expect("get");
    assert_eq!(dead.status, RecordStatus::Dead);
    assert_eq!(dead.attempts, 1);
    assert_eq!(dead.last_error.as_deref(), Some("rejected: http status 422"));

    let attempts = AttemptRepo::new(Arc::clone(&db))
        .list_for_record(record.id)
        .await
        .expect("attempts");
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].outcome, AttemptOutcome::Rejected);
}

#[tokio::test]
async fn transient_failure_then_success() {
    let db = memory_db().await;
    let repo = RecordRepo::new(Arc::clone(&db), 5);
    let record = repo
        .enqueue("timelogs", "flaky", 0, b"{}")
        .await
        .expect("enqueue");

    let handler = ScriptedHandler::scripted(vec![Err(transport("timeout"))], Ok(()));
    let gate = ConnectivityGate::new(true);
    let drainer = Drainer::new(
        Arc::clone(&db),
        table_with(&["timelogs"], &handler),
        fast_options(5),
        gate.subscribe(),
    );

    drainer.drain_cycle().await.expect("first drain");
    drainer.drain_cycle().await.expect("second drain");

    let done = repo.get(record.id).await.expect("get");
    assert_eq!(done.status, RecordStatus::Success);
    assert_eq!(done.attempts, 2);
    assert_eq!(
        done.last_error.as_deref(),
        Some("transport: timeout"),
        "last error is kept for audit"
    );
}

#[tokio::test]
async fn call_timeout_counts_as_transport_error() {
    let db = memory_db().await;
    let repo = RecordRepo::new(Arc::clone(&db), 3);
    let record = repo
        .enqueue("screenshots", "slow", 0, b"{}")
        .await
        .expect("enqueue");

    let handler = ScriptedHandler::slow(Duration::from_millis(500));
    let mut options = fast_options(3);
    options.call_timeout = Duration::from_millis(50);
    let gate = ConnectivityGate::new(true);
    let drainer = Drainer::new(
        Arc::clone(&db),
        table_with(&["screenshots"], &handler),
        options,
        gate.subscribe(),
    );

    let report = drainer.drain_cycle().await.expect("drain");
    assert_eq!(report.retried, 1);

    let current = repo.get(record.id).await.expect("get");
    assert_eq!(current.status, RecordStatus::Pending);
    assert!(current
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("timed out")));
}

#[tokio::test]
async fn retried_record_waits_for_backoff() {
    let db = memory_db().await;
    let repo = RecordRepo::new(Arc::clone(&db), 5);
    let record = repo
        .enqueue("timelogs", "backoff", 0, b"{}")
        .await
        .expect("enqueue");

    let handler = ScriptedHandler::always(Err(transport("unreachable")));
    let mut options = fast_options(5);
    options.policy.base_backoff = Duration::from_secs(3600);
    options.policy.cap_backoff = Duration::from_secs(3600);
    let gate = ConnectivityGate::new(true);
    let drainer = Drainer::new(
        Arc::clone(&db),
        table_with(&["timelogs"], &handler),
        options,
        gate.subscribe(),
    );

    drainer.drain_cycle().await.expect("drain");
    let waiting = repo.get(record.id).await.expect("get");
    assert_eq!(waiting.status, RecordStatus::Pending);
    assert!(waiting.next_eligible_at.is_some_and(|at| at > chrono::Utc::now()));

    let report = drainer.drain_cycle().await.expect("drain");
    assert_eq!(report.selected, 0, "record inside its backoff window is skipped");
    assert_eq!(handler.call_count(), 1);
}

#[tokio::test]
async fn unknown_queue_is_halted_without_consuming_attempts() {
    let db = memory_db().await;
    let repo = RecordRepo::new(Arc::clone(&db), 3);
    let orphan = repo
        .enqueue("screenshots", "no-handler", 9, b"{}")
        .await
        .expect("enqueue");
    let known = repo
        .enqueue("timelogs", "has-handler", 0, b"{}")
        .await
        .expect("enqueue");

    let handler = ScriptedHandler::succeeding();
    let gate = ConnectivityGate::new(true);
    let drainer = Drainer::new(
        Arc::clone(&db),
        table_with(&["timelogs"], &handler),
        fast_options(3),
        gate.subscribe(),
    );

    let report = drainer.drain_cycle().await.expect("drain");
    assert_eq!(report.unknown_queue, 1);
    assert_eq!(report.succeeded, 1);
    assert_eq!(drainer.halted_queues().await, vec!["screenshots".to_owned()]);

    let untouched = repo.get(orphan.id).await.expect("get");
    assert_eq!(untouched.status, RecordStatus::Pending);
    assert_eq!(untouched.attempts, 0);
    assert_eq!(
        repo.get(known.id).await.expect("get").status,
        RecordStatus::Success
    );

    let next = drainer.drain_cycle().await.expect("drain");
    assert_eq!(next.selected, 0, "halted channel is excluded from selection");
}

#[tokio::test]
async fn full_batches_drain_back_to_back() {
    let db = memory_db().await;
    let repo = RecordRepo::new(Arc::clone(&db), 3);
    for i in 0..5 {
        repo.enqueue("timelogs", &format!("rec-{i}"), 0, b"{}")
            .await
            .expect("enqueue");
    }

    let handler = ScriptedHandler::succeeding();
    let mut options = fast_options(3);
    options.batch_size = 2;
    let gate = ConnectivityGate::new(true);
    let drainer = Drainer::new(
        Arc::clone(&db),
        table_with(&["timelogs"], &handler),
        options,
        gate.subscribe(),
    );

    let report = drainer.drain_cycle().await.expect("drain");
    assert_eq!(report.batches, 3);
    assert_eq!(report.succeeded, 5);
    assert_eq!(repo.counts(None).await.expect("counts").success, 5);
}

#[tokio::test]
async fn events_follow_cycle_progress() {
    let db = memory_db().await;
    let repo = RecordRepo::new(Arc::clone(&db), 3);
    let record = repo
        .enqueue("timelogs", "evt", 0, b"{}")
        .await
        .expect("enqueue");

    let (tx, mut rx) = mpsc::channel(16);
    let handler = ScriptedHandler::succeeding();
    let gate = ConnectivityGate::new(true);
    let drainer = Drainer::new(
        Arc::clone(&db),
        table_with(&["timelogs"], &handler),
        fast_options(3),
        gate.subscribe(),
    )
    .with_events(tx);

    drainer.drain_cycle().await.expect("drain");

    assert_eq!(rx.recv().await, Some(DrainEvent::CycleStarted));
    assert_eq!(
        rx.recv().await,
        Some(DrainEvent::RecordFinished {
            id: record.id,
            queue: "timelogs".into(),
            status: RecordStatus::Success,
            attempts: 1,
        })
    );
    match rx.recv().await {
        Some(DrainEvent::CycleFinished { report, counts }) => {
            assert_eq!(report.succeeded, 1);
            assert_eq!(counts.success, 1);
            assert_eq!(counts.outstanding(), 0);
        }
        other => panic!("expected CycleFinished, got {other:?}"),
    }
}

#[tokio::test]
async fn empty_table_leaves_records_pending() {
    let db = memory_db().await;
    let repo = RecordRepo::new(Arc::clone(&db), 3);
    repo.enqueue("timelogs", "x", 0, b"{}")
        .await
        .expect("enqueue");

    let gate = ConnectivityGate::new(true);
    let drainer = Drainer::new(
        Arc::clone(&db),
        Arc::new(DispatchTable::new()),
        fast_options(3),
        gate.subscribe(),
    );

    let report = drainer.drain_cycle().await.expect("drain");
    assert_eq!(report.claimed, 0);
    assert_eq!(repo.counts(None).await.expect("counts").pending, 1);
}

#[tokio::test]
async fn oversized_backoff_still_requeues_the_record() {
    let db = memory_db().await;
    let repo = RecordRepo::new(Arc::clone(&db), 3);
    let first = repo
        .enqueue("timelogs", "first", 0, b"first")
        .await
        .expect("enqueue");
    repo.enqueue("timelogs", "second", 0, b"second")
        .await
        .expect("enqueue");

    let mut options = fast_options(3);
    options.policy.base_backoff = Duration::from_millis(10_000_000_000_000_000);
    options.policy.cap_backoff = Duration::from_millis(10_000_000_000_000_000);
    options.policy.jitter_ratio = 0.2;

    let handler = ScriptedHandler::always(Err(transport("connection refused")));
    let gate = ConnectivityGate::new(true);
    let drainer = Drainer::new(
        Arc::clone(&db),
        table_with(&["timelogs"], &handler),
        options,
        gate.subscribe(),
    );

    let report = drainer.drain_cycle().await.expect("drain");
    assert_eq!(report.retried, 2, "every record of the batch was attempted");
    assert_eq!(handler.call_count(), 2);

    let retried = repo.get(first.id).await.expect("get");
    assert_eq!(retried.status, RecordStatus::Pending);
    assert_eq!(retried.attempts, 1);
    assert!(retried.next_eligible_at.is_some());
}
