//! Unit tests for the record status machine and serde representations.

use offline_queue::models::record::{QueueCounts, RecordFilter, RecordStatus};

// ── RecordStatus ─────────────────────────────────────

#[test]
fn status_storage_names_parse_back() {
    for status in RecordStatus::ALL {
        assert_eq!(RecordStatus::parse(status.as_str()), Some(status));
        assert_eq!(status.as_str().parse::<RecordStatus>(), Ok(status));
    }
    assert_eq!(RecordStatus::parse("PENDING"), None);
    assert!("queued".parse::<RecordStatus>().is_err());
}

#[test]
fn status_serialization() {
    let values = [
        (RecordStatus::Pending, "\"pending\""),
        (RecordStatus::InProgress, "\"in_progress\""),
        (RecordStatus::Success, "\"success\""),
        (RecordStatus::Failed, "\"failed\""),
        (RecordStatus::Dead, "\"dead\""),
    ];
    for (status, expected) in values {
        let json = serde_json::to_string(&status).expect("serialize status");
        assert_eq!(json, expected);
    }
}

#[test]
fn only_success_and_dead_are_terminal() {
    let terminal: Vec<RecordStatus> = RecordStatus::ALL
        .into_iter()
        .filter(|s| s.is_terminal())
        .collect();
    assert_eq!(terminal, vec![RecordStatus::Success, RecordStatus::Dead]);
}

#[test]
fn allowed_transitions() {
    use RecordStatus::{Dead, Failed, InProgress, Pending, Success};

    assert!(Pending.can_transition_to(InProgress));
    assert!(InProgress.can_transition_to(Success));
    assert!(InProgress.can_transition_to(Pending));
    assert!(InProgress.can_transition_to(Dead));
    assert!(Failed.can_transition_to(Pending));
    assert!(Failed.can_transition_to(Dead));

    assert!(!Pending.can_transition_to(Success));
    assert!(!Pending.can_transition_to(Dead));
    for next in RecordStatus::ALL {
        assert!(!Success.can_transition_to(next), "success is terminal");
        assert!(!Dead.can_transition_to(next), "dead is terminal");
    }
}

// ── QueueCounts / RecordFilter ───────────────────────

#[test]
fn outstanding_excludes_terminal_records() {
    let counts = QueueCounts {
        pending: 3,
        in_progress: 1,
        success: 10,
        failed: 2,
        dead: 4,
    };
    assert_eq!(counts.outstanding(), 6);
}

#[test]
fn filter_constructors() {
    let by_queue = RecordFilter::queue("timelogs");
    assert_eq!(by_queue.queue.as_deref(), Some("timelogs"));
    assert!(by_queue.status.is_none());

    let by_status = RecordFilter::status(RecordStatus::Dead);
    assert_eq!(by_status.status, Some(RecordStatus::Dead));
    assert!(by_status.queue.is_none());
    assert!(by_status.limit.is_none());
}
