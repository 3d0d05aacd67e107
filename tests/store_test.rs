//! Integration tests for the durable task store.

use chrono::{Duration, Utc};
use forage::error::Error;
use forage::key::CacheKey;
use forage::model::*;
use forage::store::{Reservation, Store};
use serde_json::json;

fn test_store() -> Store {
    Store::in_memory().expect("failed to create in-memory store")
}

fn pending_task(kind: TaskKind, cache_key: Option<CacheKey>) -> Task {
    let now = Utc::now();
    Task {
        id: TaskId::new(),
        kind,
        class: kind.default_class(),
        payload: json!({}),
        cache_key,
        status: TaskStatus::Pending,
        attempt_count: 0,
        max_attempts: 3,
        created_at: now,
        updated_at: now,
        next_retry_at: None,
        outcome: None,
    }
}

// ---------------------------------------------------------------------------
// Insert and dedup
// ---------------------------------------------------------------------------

#[test]
fn insert_and_get_round_trips() {
    let store = test_store();
    let task = pending_task(TaskKind::Scrape, None);

    store.insert_task(&task).unwrap();

    let loaded = store.get_task(task.id).unwrap();
    assert_eq!(loaded.id, task.id);
    assert_eq!(loaded.kind, TaskKind::Scrape);
    assert_eq!(loaded.status, TaskStatus::Pending);
    assert_eq!(loaded.attempt_count, 0);
    assert!(loaded.next_retry_at.is_none());
}

#[test]
fn duplicate_key_references_the_canonical_task() {
    let store = test_store();
    let url = url::Url::parse("https://example.com/a").unwrap();
    let key = CacheKey::for_scrape(&url);

    let first = pending_task(TaskKind::Scrape, Some(key.clone()));
    store.insert_task(&first).unwrap();

    let second = pending_task(TaskKind::Scrape, Some(key));
    let err = store.insert_task(&second).unwrap_err();

    match err {
        Error::DuplicateCacheKey { existing, .. } => assert_eq!(existing, first.id),
        other => panic!("expected DuplicateCacheKey, got {other:?}"),
    }

    // Exactly one row exists, and it holds the key
    let all = store.list_tasks(None, None, 10).unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].id, first.id);
    let url = url::Url::parse("https://example.com/a").unwrap();
    let holder = store
        .find_open_by_key(&CacheKey::for_scrape(&url))
        .unwrap()
        .expect("open task holds the key");
    assert_eq!(holder.id, first.id);
}

#[test]
fn cross_kind_key_reuse_is_a_conflict() {
    let store = test_store();
    let key = CacheKey::from_raw("shared-fingerprint");

    store
        .insert_task(&pending_task(TaskKind::Scrape, Some(key.clone())))
        .unwrap();

    let err = store
        .insert_task(&pending_task(TaskKind::Extract, Some(key)))
        .unwrap_err();

    match err {
        Error::KeyConflict {
            held_by, requested, ..
        } => {
            assert_eq!(held_by, TaskKind::Scrape);
            assert_eq!(requested, TaskKind::Extract);
        }
        other => panic!("expected KeyConflict, got {other:?}"),
    }
}

#[test]
fn terminal_task_releases_its_key() {
    let store = test_store();
    let key = CacheKey::from_raw("release-on-completion");

    let first = pending_task(TaskKind::Scrape, Some(key.clone()));
    store.insert_task(&first).unwrap();
    store
        .transition(first.id, TaskStatus::Pending, TaskStatus::InProgress)
        .unwrap();
    store
        .settle_success(
            first.id,
            &Outcome {
                success: true,
                data: Some(json!({"bytes": 1024})),
                error: None,
                duration_ms: 10,
            },
        )
        .unwrap();

    // Same key is insertable again once the holder is terminal
    let second = pending_task(TaskKind::Scrape, Some(key));
    store.insert_task(&second).unwrap();
}

#[test]
fn abandoned_task_releases_its_key() {
    let store = test_store();
    let key = CacheKey::from_raw("release-on-abandon");

    let first = pending_task(TaskKind::Process, Some(key.clone()));
    store.insert_task(&first).unwrap();
    store
        .transition(first.id, TaskStatus::Pending, TaskStatus::Abandoned)
        .unwrap();

    store
        .insert_task(&pending_task(TaskKind::Process, Some(key)))
        .unwrap();
}

// ---------------------------------------------------------------------------
// Compare-and-swap transitions
// ---------------------------------------------------------------------------

#[test]
fn cas_transition_rejects_stale_status() {
    let store = test_store();
    let task = pending_task(TaskKind::Process, None);
    store.insert_task(&task).unwrap();

    // First claim wins
    store
        .transition(task.id, TaskStatus::Pending, TaskStatus::InProgress)
        .unwrap();

    // Second claim sees the real status
    let err = store
        .transition(task.id, TaskStatus::Pending, TaskStatus::InProgress)
        .unwrap_err();
    match err {
        Error::StaleStatus {
            expected, actual, ..
        } => {
            assert_eq!(expected, TaskStatus::Pending);
            assert_eq!(actual, TaskStatus::InProgress);
        }
        other => panic!("expected StaleStatus, got {other:?}"),
    }
}

#[test]
fn invalid_transition_is_rejected_up_front() {
    let store = test_store();
    let task = pending_task(TaskKind::Process, None);
    store.insert_task(&task).unwrap();

    let err = store
        .transition(task.id, TaskStatus::Pending, TaskStatus::Completed)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { .. }));
}

#[test]
fn claim_increments_attempts_and_clears_retry_deadline() {
    let store = test_store();
    let task = pending_task(TaskKind::Process, None);
    store.insert_task(&task).unwrap();

    let claimed = store
        .transition(task.id, TaskStatus::Pending, TaskStatus::InProgress)
        .unwrap();
    assert_eq!(claimed.attempt_count, 1);

    let retry_at = Utc::now() - Duration::seconds(1);
    let scheduled = store.schedule_retry(task.id, "flaky", retry_at).unwrap();
    assert_eq!(scheduled.status, TaskStatus::Pending);
    assert!(scheduled.next_retry_at.is_some());

    let reclaimed = store
        .transition(task.id, TaskStatus::Pending, TaskStatus::InProgress)
        .unwrap();
    assert_eq!(reclaimed.attempt_count, 2);
    assert!(reclaimed.next_retry_at.is_none());
}

#[test]
fn terminal_failure_is_exactly_once() {
    let store = test_store();
    let task = pending_task(TaskKind::Scrape, None);
    store.insert_task(&task).unwrap();
    store
        .transition(task.id, TaskStatus::Pending, TaskStatus::InProgress)
        .unwrap();

    store.settle_failure(task.id, "boom", 5).unwrap();

    // A second settlement loses the CAS
    let err = store.settle_failure(task.id, "boom again", 5).unwrap_err();
    assert!(matches!(err, Error::StaleStatus { .. }));

    // Exactly one exhaustion event
    let exhausted: Vec<_> = store
        .events_since(0)
        .unwrap()
        .into_iter()
        .filter(|e| matches!(e.kind, forage::event::EventKind::TaskExhausted { .. }))
        .collect();
    assert_eq!(exhausted.len(), 1);
}

// ---------------------------------------------------------------------------
// Retry queries and recovery
// ---------------------------------------------------------------------------

#[test]
fn find_due_for_retry_orders_by_deadline_then_class() {
    let store = test_store();
    let now = Utc::now();
    let equal_deadline = now - Duration::seconds(10);

    // Earliest deadline, lowest class
    let early = pending_task(TaskKind::Process, None);
    store.insert_task(&early).unwrap();
    store
        .transition(early.id, TaskStatus::Pending, TaskStatus::InProgress)
        .unwrap();
    store
        .schedule_retry(early.id, "e1", now - Duration::seconds(60))
        .unwrap();

    // Equal later deadlines, different classes
    let low = pending_task(TaskKind::Process, None);
    store.insert_task(&low).unwrap();
    store
        .transition(low.id, TaskStatus::Pending, TaskStatus::InProgress)
        .unwrap();
    store.schedule_retry(low.id, "e2", equal_deadline).unwrap();

    let high = pending_task(TaskKind::GenerateResponse, None);
    store.insert_task(&high).unwrap();
    store
        .transition(high.id, TaskStatus::Pending, TaskStatus::InProgress)
        .unwrap();
    store.schedule_retry(high.id, "e3", equal_deadline).unwrap();

    let due = store.find_due_for_retry(now).unwrap();
    let ids: Vec<_> = due.iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![early.id, high.id, low.id]);
}

#[test]
fn future_retry_deadline_is_not_due() {
    let store = test_store();
    let task = pending_task(TaskKind::Scrape, None);
    store.insert_task(&task).unwrap();
    store
        .transition(task.id, TaskStatus::Pending, TaskStatus::InProgress)
        .unwrap();
    store
        .schedule_retry(task.id, "later", Utc::now() + Duration::seconds(120))
        .unwrap();

    assert!(store.find_due_for_retry(Utc::now()).unwrap().is_empty());
}

#[test]
fn list_dispatchable_covers_fresh_and_due_tasks() {
    let store = test_store();
    let now = Utc::now();

    let fresh = pending_task(TaskKind::Process, None);
    store.insert_task(&fresh).unwrap();

    let waiting = pending_task(TaskKind::Process, None);
    store.insert_task(&waiting).unwrap();
    store
        .transition(waiting.id, TaskStatus::Pending, TaskStatus::InProgress)
        .unwrap();
    store
        .schedule_retry(waiting.id, "w", now + Duration::seconds(300))
        .unwrap();

    let due = pending_task(TaskKind::Process, None);
    store.insert_task(&due).unwrap();
    store
        .transition(due.id, TaskStatus::Pending, TaskStatus::InProgress)
        .unwrap();
    store
        .schedule_retry(due.id, "d", now - Duration::seconds(1))
        .unwrap();

    let dispatchable = store.list_dispatchable(Utc::now()).unwrap();
    let ids: Vec<_> = dispatchable.iter().map(|t| t.id).collect();
    assert!(ids.contains(&fresh.id));
    assert!(ids.contains(&due.id));
    assert!(!ids.contains(&waiting.id));
}

#[test]
fn recover_orphans_returns_in_progress_to_pending() {
    let store = test_store();
    let task = pending_task(TaskKind::Scrape, None);
    store.insert_task(&task).unwrap();
    store
        .transition(task.id, TaskStatus::Pending, TaskStatus::InProgress)
        .unwrap();

    let recovered = store.recover_orphans().unwrap();
    assert_eq!(recovered, vec![task.id]);

    let loaded = store.get_task(task.id).unwrap();
    assert_eq!(loaded.status, TaskStatus::Pending);
    // The interrupted attempt still counts
    assert_eq!(loaded.attempt_count, 1);
}

#[test]
fn latest_completed_outcome_is_recoverable_by_key() {
    let store = test_store();
    let key = CacheKey::from_raw("completed-result");

    let task = pending_task(TaskKind::Process, Some(key.clone()));
    store.insert_task(&task).unwrap();
    store
        .transition(task.id, TaskStatus::Pending, TaskStatus::InProgress)
        .unwrap();
    store
        .settle_success(
            task.id,
            &Outcome {
                success: true,
                data: Some(json!({"sentiment": 0.8})),
                error: None,
                duration_ms: 42,
            },
        )
        .unwrap();

    let value = store.latest_completed_outcome(&key).unwrap();
    assert_eq!(value, Some(json!({"sentiment": 0.8})));

    let missing = store
        .latest_completed_outcome(&CacheKey::from_raw("nothing-here"))
        .unwrap();
    assert!(missing.is_none());
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

#[test]
fn source_url_is_globally_unique() {
    let store = test_store();

    let first = store
        .upsert_source("https://example.com/feed", "example.com", 900)
        .unwrap();
    let second = store
        .upsert_source("https://example.com/feed", "example.com", 600)
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(second.scrape_interval_secs, 600);
    assert_eq!(store.list_sources().unwrap().len(), 1);
}

#[test]
fn sources_due_respects_the_interval() {
    let store = test_store();
    let now = Utc::now();

    let never = store
        .upsert_source("https://a.example/feed", "a.example", 60)
        .unwrap();
    let stale = store
        .upsert_source("https://b.example/feed", "b.example", 60)
        .unwrap();
    let recent = store
        .upsert_source("https://c.example/feed", "c.example", 3600)
        .unwrap();

    store
        .mark_source_scraped(stale.id, now - Duration::seconds(120))
        .unwrap();
    store.mark_source_scraped(recent.id, now).unwrap();

    let due = store.sources_due(now).unwrap();
    let ids: Vec<_> = due.iter().map(|s| s.id).collect();
    assert!(ids.contains(&never.id));
    assert!(ids.contains(&stale.id));
    assert!(!ids.contains(&recent.id));
}

// ---------------------------------------------------------------------------
// Domain records
// ---------------------------------------------------------------------------

#[test]
fn query_content_result_keys_reserve_exactly_once() {
    let store = test_store();

    let qkey = CacheKey::for_query("rust async runtimes");
    let query = match store.insert_query("rust async runtimes", &qkey).unwrap() {
        Reservation::Created(q) => q,
        Reservation::Existing(_) => panic!("first insert should create"),
    };
    match store.insert_query("rust async runtimes", &qkey).unwrap() {
        Reservation::Existing(q) => assert_eq!(q.id, query.id),
        Reservation::Created(_) => panic!("second insert should hit the existing query"),
    }

    let source = store
        .upsert_source("https://example.com/feed", "example.com", 900)
        .unwrap();

    let ckey = CacheKey::from_raw("content-fingerprint");
    let content = store
        .insert_content(query.id, source.id.0, &ckey)
        .unwrap()
        .into_inner();
    match store.insert_content(query.id, source.id.0, &ckey).unwrap() {
        Reservation::Existing(c) => assert_eq!(c.id, content.id),
        Reservation::Created(_) => panic!("duplicate content should not create"),
    }

    let rkey = CacheKey::from_raw("result-fingerprint");
    let result = store
        .insert_result(query.id, Some(source.id.0), &rkey)
        .unwrap()
        .into_inner();
    match store.insert_result(query.id, None, &rkey).unwrap() {
        Reservation::Existing(r) => assert_eq!(r.id, result.id),
        Reservation::Created(_) => panic!("duplicate result should not create"),
    }

    // Query status moves independently of its children
    store
        .set_query_status(query.id, RecordStatus::Processed)
        .unwrap();
    match store.insert_query("rust async runtimes", &qkey).unwrap() {
        Reservation::Existing(q) => assert_eq!(q.status, RecordStatus::Processed),
        Reservation::Created(_) => panic!("query should still exist"),
    }
}

#[test]
fn stuck_content_sweep_window() {
    let store = test_store();
    let qkey = CacheKey::for_query("stuck sweep");
    let query = store.insert_query("stuck sweep", &qkey).unwrap().into_inner();
    let source = store
        .upsert_source("https://example.com/feed", "example.com", 900)
        .unwrap();

    let content = store
        .insert_content(query.id, source.id.0, &CacheKey::from_raw("stuck-1"))
        .unwrap()
        .into_inner();

    // Everything created before the cutoff and still pending is stuck
    let stuck = store.stuck_content(Utc::now() + Duration::seconds(1)).unwrap();
    assert_eq!(stuck.len(), 1);
    assert_eq!(stuck[0].id, content.id);

    store
        .set_content_status(content.id, RecordStatus::Processed)
        .unwrap();
    let stuck = store.stuck_content(Utc::now() + Duration::seconds(1)).unwrap();
    assert!(stuck.is_empty());
}

#[test]
fn content_reverse_lookup_by_query() {
    let store = test_store();
    let query = store
        .insert_query("reverse lookup", &CacheKey::for_query("reverse lookup"))
        .unwrap()
        .into_inner();
    let source = store
        .upsert_source("https://example.com/feed", "example.com", 900)
        .unwrap();

    store
        .insert_content(query.id, source.id.0, &CacheKey::from_raw("c1"))
        .unwrap();
    store
        .insert_content(query.id, source.id.0, &CacheKey::from_raw("c2"))
        .unwrap();

    let owned = store.content_for_query(query.id).unwrap();
    assert_eq!(owned.len(), 2);
    assert!(owned.iter().all(|c| c.query_id == query.id));
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[test]
fn events_are_recorded_with_monotonic_seq() {
    let store = test_store();
    let task = pending_task(TaskKind::Scrape, Some(CacheKey::from_raw("evt")));
    store.insert_task(&task).unwrap();
    store
        .transition(task.id, TaskStatus::Pending, TaskStatus::InProgress)
        .unwrap();

    let events = store.events_since(0).unwrap();

    // At least TaskCreated and one StatusChanged
    assert!(events.len() >= 2);
    for window in events.windows(2) {
        assert!(window[1].seq > window[0].seq);
    }

    let status_changes: Vec<_> = events
        .iter()
        .filter_map(|e| match &e.kind {
            forage::event::EventKind::StatusChanged {
                from,
                to,
                attempt_count,
                ..
            } => Some((*from, *to, *attempt_count)),
            _ => None,
        })
        .collect();
    assert_eq!(
        status_changes,
        vec![(TaskStatus::Pending, TaskStatus::InProgress, 1)]
    );
}

#[test]
fn dedup_records_an_event_without_a_row() {
    let store = test_store();
    let key = CacheKey::from_raw("dedup-event");
    store
        .insert_task(&pending_task(TaskKind::Scrape, Some(key.clone())))
        .unwrap();
    let _ = store.insert_task(&pending_task(TaskKind::Scrape, Some(key)));

    let deduped: Vec<_> = store
        .events_since(0)
        .unwrap()
        .into_iter()
        .filter(|e| matches!(e.kind, forage::event::EventKind::TaskDeduplicated { .. }))
        .collect();
    assert_eq!(deduped.len(), 1);
}
