//! End-to-end behaviour of the sync orchestrator against a scripted remote.

use driftsync_engine::remote::mock::{MockAuditSink, MockRemote};
use driftsync_engine::{
    CacheOptions, DrainStatus, MutationStatus, NetworkState, NewMutation, OutboxStats, Resolution,
    STORAGE_WARNING, SubmitOutcome, SyncConfig, SyncError, SyncOrchestrator, Timestamp,
};
use driftsync_engine::RemoteError;
use driftsync_store::{DurableStore, MemoryStore, Namespace};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

const T0: i64 = 1_700_000_000_000;
const T1: i64 = T0 + 60_000;

fn config() -> SyncConfig {
    SyncConfig {
        backoff_base_ms: 0,
        ..SyncConfig::default()
    }
}

async fn engine(
    store: Arc<MemoryStore>,
    remote: Arc<MockRemote>,
    initial: NetworkState,
) -> SyncOrchestrator {
    SyncOrchestrator::open(config(), store, remote, initial).await
}

async fn offline_engine() -> (SyncOrchestrator, Arc<MockRemote>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let remote = Arc::new(MockRemote::new());
    let engine = engine(store.clone(), remote.clone(), NetworkState::Offline).await;
    (engine, remote, store)
}

fn rename(id: &str, name: &str) -> NewMutation {
    NewMutation::update("contact", id, "contacts.update", json!({ "name": name }))
}

fn rename_based_on(id: &str, name: &str, base: i64) -> NewMutation {
    rename(id, name).with_original(json!({ "id": id, "name": "Alice", "updatedAt": base }))
}

fn contact_key(id: &str) -> Vec<Value> {
    vec![json!(id)]
}

/// Scenario B setup: one conflict on contact-1, engine online afterwards.
async fn engine_with_conflict() -> (SyncOrchestrator, Arc<MockRemote>) {
    let (engine, remote, _) = offline_engine().await;
    remote.set_snapshot(
        "contact",
        "contact-1",
        json!({ "id": "contact-1", "name": "Carol", "updatedAt": T1 }),
    );
    engine
        .submit(rename_based_on("contact-1", "Bob", T0))
        .await
        .unwrap();
    let report = engine.connectivity_restored().await.unwrap();
    assert_eq!(report.conflicted, 1);
    (engine, remote)
}

// ── Scenarios ────────────────────────────────────────────────────

#[tokio::test]
async fn offline_update_drains_on_reconnect() {
    let (engine, remote, _) = offline_engine().await;

    let outcome = engine.submit(rename("contact-1", "Bob")).await.unwrap();
    assert!(matches!(outcome, SubmitOutcome::Queued(_)));
    assert_eq!(engine.offline_state().await.pending_mutations, 1);
    assert_eq!(
        engine.cache().get("contact.get", &contact_key("contact-1")).await,
        Some(json!({ "name": "Bob" }))
    );

    let report = engine.connectivity_restored().await.unwrap();

    assert_eq!(report.status, DrainStatus::Completed);
    assert_eq!(report.applied, 1);
    assert!(engine.outbox().is_empty().await);
    let state = engine.offline_state().await;
    assert_eq!(state.pending_mutations, 0);
    assert_eq!(state.network_state, NetworkState::Online);
    assert_eq!(engine.cache().get("contact.get", &contact_key("contact-1")).await, None);
    assert_eq!(remote.calls_to("contacts.update").len(), 1);
}

#[tokio::test]
async fn newer_remote_turns_update_into_conflict() {
    let (engine, remote) = engine_with_conflict().await;

    assert!(engine.outbox().is_empty().await);
    assert!(remote.calls().is_empty());
    let conflicts = engine.unresolved_conflicts().await;
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].local_data["name"], "Bob");
    assert_eq!(conflicts[0].remote_data["name"], "Carol");
    assert_eq!(conflicts[0].remote_timestamp, Timestamp::from_millis(T1));
    let state = engine.offline_state().await;
    assert_eq!(state.unresolved_conflicts, 1);
    assert_eq!(state.pending_mutations, 0);
}

#[tokio::test]
async fn resolving_remote_issues_no_write() {
    let (engine, remote) = engine_with_conflict().await;
    let id = engine.unresolved_conflicts().await[0].id;

    let resolved = engine.resolve(id, Resolution::Remote, None).await.unwrap();

    assert!(resolved.resolved);
    assert_eq!(resolved.resolution, Some(Resolution::Remote));
    assert!(resolved.resolved_at.is_some());
    assert_eq!(engine.offline_state().await.unresolved_conflicts, 0);
    assert!(remote.calls().is_empty());
    assert_eq!(engine.conflicts().await.len(), 1);
    assert_eq!(engine.cache().get("contact.get", &contact_key("contact-1")).await, None);
}

#[tokio::test]
async fn three_transient_failures_classify_failed() {
    let (engine, remote, _) = offline_engine().await;
    remote.fail_next("contacts.update", RemoteError::Transient("timeout".into()), 3);
    engine.submit(rename("contact-1", "Bob")).await.unwrap();

    engine.connectivity_restored().await.unwrap();
    engine.drain().await.unwrap();
    engine.drain().await.unwrap();

    assert_eq!(
        engine.outbox_stats().await,
        OutboxStats {
            total: 1,
            pending: 0,
            failed: 1,
            retrying: 0,
        }
    );
    let entry = &engine.outbox_entries().await[0];
    assert_eq!(entry.retry_count, 3);
    assert_eq!(entry.error.as_deref(), Some("timeout"));
    assert_eq!(engine.outbox().classify(entry), MutationStatus::Failed);
    assert_eq!(engine.offline_state().await.failed_mutations, 1);

    // Failed entries are left for the user.
    let report = engine.drain().await.unwrap();
    assert_eq!(report.attempted(), 0);
    assert_eq!(report.skipped, 1);
    assert_eq!(remote.calls_to("contacts.update").len(), 3);
}

// ── Drain ────────────────────────────────────────────────────────

#[tokio::test]
async fn successful_drain_empties_outbox() {
    let (engine, remote, _) = offline_engine().await;
    for (id, name) in [("c1", "a"), ("c2", "b"), ("c1", "c"), ("c3", "d"), ("c2", "e")] {
        engine.submit(rename(id, name)).await.unwrap();
    }
    engine
        .submit(NewMutation::create("deal", "d1", "deals.create", json!({ "title": "x" })))
        .await
        .unwrap();
    engine
        .submit(NewMutation::delete("contact", "c4", "contacts.delete"))
        .await
        .unwrap();
    assert_eq!(engine.offline_state().await.pending_mutations, 7);

    let report = engine.connectivity_restored().await.unwrap();

    assert_eq!(report.applied, 7);
    assert_eq!(engine.offline_state().await.pending_mutations, 0);
    assert_eq!(remote.calls().len(), 7);
}

#[tokio::test]
async fn drain_is_skipped_while_offline() {
    let (engine, remote, _) = offline_engine().await;
    engine.submit(rename("contact-1", "Bob")).await.unwrap();

    let report = engine.drain().await.unwrap();

    assert_eq!(report.status, DrainStatus::Offline);
    assert!(remote.calls().is_empty());
    assert_eq!(engine.outbox().len().await, 1);
}

#[tokio::test]
async fn transient_failure_blocks_later_writes_to_same_record() {
    let (engine, remote, _) = offline_engine().await;
    remote.fail_next("contacts.update", RemoteError::Transient("503".into()), 1);
    engine.submit(rename("contact-1", "first")).await.unwrap();
    engine.submit(rename("contact-1", "second")).await.unwrap();

    let report = engine.connectivity_restored().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(remote.calls().len(), 1);

    let report = engine.drain().await.unwrap();
    assert_eq!(report.applied, 2);
    let names: Vec<Value> = remote
        .calls()
        .iter()
        .map(|c| c.args[1]["name"].clone())
        .collect();
    assert_eq!(names, vec![json!("first"), json!("first"), json!("second")]);
}

#[tokio::test]
async fn backoff_defers_retry() {
    let store = Arc::new(MemoryStore::new());
    let remote = Arc::new(MockRemote::new());
    let config = SyncConfig {
        backoff_base_ms: 60_000,
        ..SyncConfig::default()
    };
    let engine = SyncOrchestrator::open(config, store, remote.clone(), NetworkState::Offline).await;
    remote.fail_next("contacts.update", RemoteError::Transient("timeout".into()), 1);
    engine.submit(rename("contact-1", "Bob")).await.unwrap();

    engine.connectivity_restored().await.unwrap();
    let report = engine.drain().await.unwrap();

    assert_eq!(report.attempted(), 0);
    assert_eq!(report.skipped, 1);
    assert!(!engine.outbox().has_due().await);
    assert_eq!(engine.outbox_stats().await.retrying, 1);
}

#[tokio::test]
async fn rejected_mutation_is_kept_as_failed() {
    let (engine, remote, _) = offline_engine().await;
    remote.fail_next("contacts.update", RemoteError::Rejected("email invalid".into()), 1);
    let id = match engine.submit(rename("contact-1", "Bob")).await.unwrap() {
        SubmitOutcome::Queued(id) => id,
        other => panic!("expected queued, got {other:?}"),
    };

    engine.connectivity_restored().await.unwrap();

    let entry = engine.outbox().get(id).await.unwrap();
    assert!(entry.rejected);
    assert_eq!(entry.retry_count, 0);
    assert_eq!(engine.outbox_stats().await.failed, 1);

    engine.drain().await.unwrap();
    assert_eq!(remote.calls().len(), 1);
}

#[tokio::test]
async fn drain_is_not_reentrant() {
    let store = Arc::new(MemoryStore::new());
    let remote = Arc::new(MockRemote::new());
    {
        let offline = engine(store.clone(), remote.clone(), NetworkState::Offline).await;
        offline.submit(rename("c1", "a")).await.unwrap();
        offline.submit(rename("c2", "b")).await.unwrap();
    }
    remote.set_latency(Duration::from_millis(50));
    let engine = Arc::new(engine(store, remote.clone(), NetworkState::Online).await);

    let background = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.drain().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(engine.network_state(), NetworkState::Syncing);

    let second = engine.drain().await.unwrap();
    assert_eq!(second.status, DrainStatus::AlreadyRunning);

    let first = background.await.unwrap().unwrap();
    assert_eq!(first.status, DrainStatus::Completed);
    assert_eq!(first.applied, 2);
    assert_eq!(remote.calls().len(), 2);
    assert_eq!(engine.network_state(), NetworkState::Online);
}

#[tokio::test]
async fn connectivity_loss_cancels_between_mutations() {
    let store = Arc::new(MemoryStore::new());
    let remote = Arc::new(MockRemote::new());
    {
        let offline = engine(store.clone(), remote.clone(), NetworkState::Offline).await;
        for id in ["c1", "c2", "c3"] {
            offline.submit(rename(id, "x")).await.unwrap();
        }
    }
    remote.set_latency(Duration::from_millis(50));
    let config = SyncConfig {
        drain_concurrency: 1,
        ..config()
    };
    let engine = Arc::new(SyncOrchestrator::open(config, store, remote.clone(), NetworkState::Online).await);

    let background = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.drain().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    engine.connectivity_lost().await;

    let report = background.await.unwrap().unwrap();
    assert_eq!(report.status, DrainStatus::Cancelled);
    // The in-flight attempt completes; nothing else is started.
    assert_eq!(report.applied, 1);
    assert_eq!(report.skipped, 2);
    assert_eq!(engine.outbox().len().await, 2);
    let state = engine.offline_state().await;
    assert_eq!(state.network_state, NetworkState::Offline);
    assert!(state.last_online.is_some());
}

#[tokio::test]
async fn unreachable_remote_moves_engine_offline() {
    let (engine, remote, _) = offline_engine().await;
    engine.submit(rename("contact-1", "Bob")).await.unwrap();
    remote.set_unreachable(true);

    let report = engine.connectivity_restored().await.unwrap();

    assert_eq!(report.status, DrainStatus::Cancelled);
    assert_eq!(engine.network_state(), NetworkState::Offline);
    let entry = &engine.outbox_entries().await[0];
    assert_eq!(entry.retry_count, 0);
}

// ── Submit ───────────────────────────────────────────────────────

#[tokio::test]
async fn online_submit_executes_immediately() {
    let store = Arc::new(MemoryStore::new());
    let remote = Arc::new(MockRemote::new());
    let engine = engine(store, remote.clone(), NetworkState::Online).await;
    engine
        .cache()
        .set(
            "contact.list",
            &[],
            json!([{ "name": "Alice" }]),
            Default::default(),
        )
        .await;

    let outcome = engine.submit(rename("contact-1", "Bob")).await.unwrap();

    assert_eq!(outcome, SubmitOutcome::Applied(json!({ "name": "Bob" })));
    assert!(engine.outbox().is_empty().await);
    assert_eq!(engine.cache().get("contact.list", &[]).await, None);
}

#[tokio::test]
async fn online_submit_queues_behind_pending_write() {
    let store = Arc::new(MemoryStore::new());
    let remote = Arc::new(MockRemote::new());
    {
        let offline = engine(store.clone(), remote.clone(), NetworkState::Offline).await;
        offline.submit(rename("contact-1", "first")).await.unwrap();
    }
    let engine = engine(store, remote.clone(), NetworkState::Online).await;

    let outcome = engine.submit(rename("contact-1", "second")).await.unwrap();

    assert!(matches!(outcome, SubmitOutcome::Queued(_)));
    assert!(remote.calls().is_empty());
    assert_eq!(engine.outbox().len().await, 2);
}

#[tokio::test]
async fn immediate_transient_failure_is_queued_with_retry() {
    let store = Arc::new(MemoryStore::new());
    let remote = Arc::new(MockRemote::new());
    remote.fail_next("contacts.update", RemoteError::Transient("timeout".into()), 1);
    let engine = engine(store, remote, NetworkState::Online).await;

    let id = match engine.submit(rename("contact-1", "Bob")).await.unwrap() {
        SubmitOutcome::Queued(id) => id,
        other => panic!("expected queued, got {other:?}"),
    };

    assert_eq!(engine.outbox().get(id).await.unwrap().retry_count, 1);
    assert_eq!(engine.outbox_stats().await.retrying, 1);
}

#[tokio::test]
async fn immediate_rejection_is_returned() {
    let store = Arc::new(MemoryStore::new());
    let remote = Arc::new(MockRemote::new());
    remote.fail_next("contacts.update", RemoteError::Rejected("name required".into()), 1);
    let engine = engine(store, remote, NetworkState::Online).await;

    let err = engine.submit(rename("contact-1", "")).await.unwrap_err();

    assert!(matches!(err, SyncError::RemoteRejected(reason) if reason == "name required"));
    assert!(engine.outbox().is_empty().await);
}

#[tokio::test]
async fn immediate_conflict_is_recorded() {
    let store = Arc::new(MemoryStore::new());
    let remote = Arc::new(MockRemote::new());
    remote.set_snapshot(
        "contact",
        "contact-1",
        json!({ "name": "Carol", "updatedAt": T1 }),
    );
    let engine = engine(store, remote.clone(), NetworkState::Online).await;

    let outcome = engine
        .submit(rename_based_on("contact-1", "Bob", T0))
        .await
        .unwrap();

    let SubmitOutcome::Conflicted(id) = outcome else {
        panic!("expected conflict, got {outcome:?}");
    };
    assert_eq!(engine.conflict(id).await.unwrap().local_data["name"], "Bob");
    assert!(remote.calls().is_empty());
    assert!(engine.outbox().is_empty().await);
}

#[tokio::test]
async fn missing_remote_record_does_not_conflict() {
    let store = Arc::new(MemoryStore::new());
    let remote = Arc::new(MockRemote::new());
    let engine = engine(store, remote, NetworkState::Online).await;

    let outcome = engine
        .submit(rename_based_on("contact-1", "Bob", T0))
        .await
        .unwrap();

    assert!(matches!(outcome, SubmitOutcome::Applied(_)));
}

#[tokio::test]
async fn concurrent_submits_to_one_record_keep_their_order() {
    let store = Arc::new(MemoryStore::new());
    let remote = Arc::new(MockRemote::new());
    remote.set_latency(Duration::from_millis(20));
    remote.fail_next("contacts.update", RemoteError::Transient("timeout".into()), 1);
    let engine = engine(store, remote.clone(), NetworkState::Online).await;

    let (first, second) = tokio::join!(
        engine.submit(rename("contact-1", "A")),
        engine.submit(rename("contact-1", "B")),
    );

    // B waited for A's attempt, then queued behind it.
    assert!(matches!(first.unwrap(), SubmitOutcome::Queued(_)));
    assert!(matches!(second.unwrap(), SubmitOutcome::Queued(_)));
    assert_eq!(remote.calls().len(), 1);

    let report = engine.drain().await.unwrap();
    assert_eq!(report.applied, 2);
    let names: Vec<Value> = remote
        .calls()
        .iter()
        .map(|c| c.args[1]["name"].clone())
        .collect();
    assert_eq!(names, vec![json!("A"), json!("A"), json!("B")]);
}

#[tokio::test]
async fn concurrent_submits_to_different_records_both_apply() {
    let store = Arc::new(MemoryStore::new());
    let remote = Arc::new(MockRemote::new());
    remote.set_latency(Duration::from_millis(20));
    let engine = engine(store, remote.clone(), NetworkState::Online).await;

    let (first, second) = tokio::join!(
        engine.submit(rename("contact-1", "A")),
        engine.submit(rename("contact-2", "B")),
    );

    assert!(matches!(first.unwrap(), SubmitOutcome::Applied(_)));
    assert!(matches!(second.unwrap(), SubmitOutcome::Applied(_)));
    assert!(engine.outbox().is_empty().await);
}

// ── Resolution ───────────────────────────────────────────────────

#[tokio::test]
async fn resolving_local_twice_writes_once() {
    let (engine, remote) = engine_with_conflict().await;
    let id = engine.unresolved_conflicts().await[0].id;

    let resolved = engine.resolve(id, Resolution::Local, None).await.unwrap();
    assert_eq!(resolved.resolution, Some(Resolution::Local));

    let again = engine.resolve(id, Resolution::Local, None).await;
    assert!(matches!(again, Err(SyncError::ConflictAlreadyResolved(c)) if c == id));

    let writes = remote.calls_to("contacts.update");
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].args[1], json!({ "name": "Bob" }));
    assert_eq!(engine.offline_state().await.unresolved_conflicts, 0);
}

#[tokio::test]
async fn resolving_local_offline_queues_unconditional_write() {
    let (engine, remote) = engine_with_conflict().await;
    let id = engine.unresolved_conflicts().await[0].id;
    engine.connectivity_lost().await;

    engine.resolve(id, Resolution::Local, None).await.unwrap();

    let queued = engine.outbox_entries().await;
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].original_data, None);

    // Replays without a conflict check even though the remote is newer.
    let report = engine.connectivity_restored().await.unwrap();
    assert_eq!(report.applied, 1);
    assert_eq!(remote.calls_to("contacts.update").len(), 1);
}

#[tokio::test]
async fn rejected_local_resolution_leaves_conflict_open() {
    let (engine, remote) = engine_with_conflict().await;
    let id = engine.unresolved_conflicts().await[0].id;
    remote.fail_next("contacts.update", RemoteError::Rejected("locked".into()), 1);

    let err = engine.resolve(id, Resolution::Local, None).await.unwrap_err();

    assert!(matches!(err, SyncError::RemoteRejected(_)));
    assert!(!engine.conflict(id).await.unwrap().resolved);
    assert_eq!(engine.offline_state().await.unresolved_conflicts, 1);
}

#[tokio::test]
async fn local_resolution_lands_after_later_writes() {
    let (engine, remote, _) = offline_engine().await;
    remote.set_snapshot(
        "contact",
        "contact-1",
        json!({ "id": "contact-1", "name": "Carol", "updatedAt": T1 }),
    );
    engine.submit(rename_based_on("contact-1", "Bob", T0)).await.unwrap();
    engine.submit(rename("contact-1", "Dave")).await.unwrap();

    let report = engine.connectivity_restored().await.unwrap();
    assert_eq!(report.conflicted, 1);
    assert_eq!(report.applied, 1);

    let id = engine.unresolved_conflicts().await[0].id;
    engine.resolve(id, Resolution::Local, None).await.unwrap();

    // The conflicted write is re-issued on top of the one queued after it.
    let names: Vec<Value> = remote
        .calls_to("contacts.update")
        .iter()
        .map(|c| c.args[1]["name"].clone())
        .collect();
    assert_eq!(names, vec![json!("Dave"), json!("Bob")]);
}

#[tokio::test]
async fn merged_resolution_is_refused() {
    let (engine, remote) = engine_with_conflict().await;
    let id = engine.unresolved_conflicts().await[0].id;

    let err = engine.resolve(id, Resolution::Merged, None).await.unwrap_err();

    assert!(matches!(err, SyncError::MergeNotSupported));
    assert!(!engine.conflict(id).await.unwrap().resolved);
    assert!(remote.calls().is_empty());
}

#[tokio::test]
async fn unknown_conflict_is_reported() {
    let (engine, _, _) = offline_engine().await;
    let id = driftsync_engine::ConflictId::new();

    let err = engine.resolve(id, Resolution::Remote, None).await.unwrap_err();
    assert!(matches!(err, SyncError::ConflictNotFound(c) if c == id));
    assert!(matches!(
        engine.conflict_fields(id).await,
        Err(SyncError::ConflictNotFound(_))
    ));
}

#[tokio::test]
async fn resolution_reaches_audit_sink() {
    let (engine, _) = engine_with_conflict().await;
    let sink = Arc::new(MockAuditSink::new());
    let engine = engine.with_audit_sink(sink.clone());
    let id = engine.unresolved_conflicts().await[0].id;

    let resolved = engine
        .resolve(id, Resolution::Remote, Some(json!({ "reason": "remote is correct" })))
        .await
        .unwrap();

    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].conflict_id, id);
    assert_eq!(records[0].resolution, Resolution::Remote);
    assert_eq!(records[0].entry, Some(json!({ "reason": "remote is correct" })));
    assert_eq!(resolved.audit_entry, Some(json!({ "reason": "remote is correct" })));
}

#[tokio::test]
async fn failing_audit_sink_does_not_block_resolution() {
    let (engine, _) = engine_with_conflict().await;
    let sink = Arc::new(MockAuditSink::new());
    sink.set_failing(true);
    let engine = engine.with_audit_sink(sink);
    let id = engine.unresolved_conflicts().await[0].id;

    let resolved = engine.resolve(id, Resolution::Remote, None).await.unwrap();
    assert!(resolved.resolved);
}

#[tokio::test]
async fn conflict_fields_exclude_identity() {
    let (engine, _) = engine_with_conflict().await;
    let id = engine.unresolved_conflicts().await[0].id;

    let fields = engine.conflict_fields(id).await.unwrap();

    assert_eq!(fields.len(), 1);
    assert_eq!(fields[0].field, "name");
    assert_eq!(fields[0].local, Some(json!("Bob")));
    assert_eq!(fields[0].remote, Some(json!("Carol")));
}

// ── Manual retry / discard ───────────────────────────────────────

#[tokio::test]
async fn manual_retry_replays_failed_entry() {
    let (engine, remote, _) = offline_engine().await;
    remote.fail_next("contacts.update", RemoteError::Rejected("conflict on server".into()), 1);
    engine.submit(rename("contact-1", "Bob")).await.unwrap();
    engine.connectivity_restored().await.unwrap();
    let id = engine.outbox_entries().await[0].id;

    engine.retry_mutation(id).await.unwrap();

    assert!(engine.outbox().is_empty().await);
    assert_eq!(remote.calls().len(), 2);
}

#[tokio::test]
async fn discard_removes_failed_entry_only() {
    let (engine, remote, _) = offline_engine().await;
    remote.fail_next("contacts.update", RemoteError::Rejected("bad".into()), 1);
    engine.submit(rename("contact-1", "Bob")).await.unwrap();
    engine.submit(rename("contact-2", "Eve")).await.unwrap();
    let entries = engine.outbox_entries().await;

    // Not failed yet.
    assert!(matches!(
        engine.discard_mutation(entries[0].id).await,
        Err(SyncError::MutationNotFailed(_))
    ));

    engine.connectivity_restored().await.unwrap();
    let discarded = engine.discard_mutation(entries[0].id).await.unwrap();

    assert_eq!(discarded.entity_id, "contact-1");
    assert!(engine.outbox().is_empty().await);
    assert_eq!(engine.offline_state().await.failed_mutations, 0);
    assert_eq!(engine.cache().get("contact.get", &contact_key("contact-1")).await, None);
}

// ── Persistence ──────────────────────────────────────────────────

#[tokio::test]
async fn state_survives_restart() {
    let store = Arc::new(MemoryStore::new());
    let remote = Arc::new(MockRemote::new());
    remote.set_snapshot(
        "contact",
        "contact-1",
        json!({ "name": "Carol", "updatedAt": T1 }),
    );
    {
        let engine = engine(store.clone(), remote.clone(), NetworkState::Offline).await;
        engine.submit(rename_based_on("contact-1", "Bob", T0)).await.unwrap();
        engine.submit(rename("contact-2", "Eve")).await.unwrap();
        engine.connectivity_restored().await.unwrap();
        engine.submit(rename("contact-3", "Ann")).await.unwrap();
        engine.connectivity_lost().await;
        engine.submit(rename("contact-3", "Ann2")).await.unwrap();
    }

    let engine = engine(store, remote, NetworkState::Offline).await;
    let state = engine.offline_state().await;
    assert_eq!(state.unresolved_conflicts, 1);
    assert_eq!(state.pending_mutations, 1);
    assert!(state.last_online.is_some());
    assert_eq!(engine.outbox_entries().await[0].data, json!({ "name": "Ann2" }));
}

#[tokio::test]
async fn storage_failure_degrades_and_recovers() {
    let (engine, _, store) = offline_engine().await;
    store.set_available(false);

    let outcome = engine.submit(rename("contact-1", "Bob")).await.unwrap();
    assert!(matches!(outcome, SubmitOutcome::Queued(_)));
    let state = engine.offline_state().await;
    assert!(state.storage_degraded);
    assert_eq!(state.storage_warning(), Some(STORAGE_WARNING));
    assert_eq!(state.pending_mutations, 1);
    assert!(engine.storage_size().await.is_err());

    store.set_available(true);
    engine.submit(rename("contact-2", "Eve")).await.unwrap();

    let state = engine.offline_state().await;
    assert!(!state.storage_degraded);
    assert_eq!(state.pending_mutations, 2);
    assert!(engine.storage_size().await.unwrap().used > 0);
}

#[tokio::test]
async fn healthy_cache_write_does_not_hide_unsaved_outbox() {
    let (first, remote, store) = offline_engine().await;
    store.set_available(false);
    first.submit(rename("contact-1", "Bob")).await.unwrap();
    store.set_available(true);

    first
        .cache()
        .set("deal.list", &[], json!([]), CacheOptions::default())
        .await;

    let state = first.offline_state().await;
    assert!(state.storage_degraded);
    assert_eq!(state.storage_warning(), Some(STORAGE_WARNING));
    assert!(state.degraded_namespaces.contains(&Namespace::Outbox));
    assert!(!state.degraded_namespaces.contains(&Namespace::Cache));
    assert!(store.entries(Namespace::Outbox).await.unwrap().is_empty());

    assert!(first.repair_storage().await);
    assert!(first.offline_state().await.degraded_namespaces.is_empty());
    assert_eq!(store.entries(Namespace::Outbox).await.unwrap().len(), 1);
    drop(first);

    let reopened = engine(store, remote, NetworkState::Offline).await;
    assert_eq!(reopened.offline_state().await.pending_mutations, 1);
    assert_eq!(reopened.outbox_entries().await[0].entity_id, "contact-1");
}

#[tokio::test]
async fn unsaved_conflict_is_repaired_by_next_drain() {
    let (engine, remote, store) = offline_engine().await;
    remote.set_snapshot(
        "contact",
        "contact-1",
        json!({ "id": "contact-1", "name": "Carol", "updatedAt": T1 }),
    );
    engine.submit(rename_based_on("contact-1", "Bob", T0)).await.unwrap();
    engine.connectivity_restored().await.unwrap();
    let id = engine.unresolved_conflicts().await[0].id;

    store.set_available(false);
    engine.resolve(id, Resolution::Remote, None).await.unwrap();
    assert!(engine
        .offline_state()
        .await
        .degraded_namespaces
        .contains(&Namespace::Conflicts));

    store.set_available(true);
    engine.drain().await.unwrap();

    assert!(!engine.offline_state().await.storage_degraded);
    let persisted = store.entries(Namespace::Conflicts).await.unwrap();
    assert_eq!(persisted[0].1["resolved"], json!(true));
}

#[tokio::test]
async fn network_changes_are_published() {
    let (engine, _, _) = offline_engine().await;
    let mut rx = engine.subscribe_network();

    engine.connectivity_restored().await.unwrap();

    rx.changed().await.unwrap();
    assert_ne!(*rx.borrow_and_update(), NetworkState::Offline);
    assert_eq!(engine.network_state(), NetworkState::Online);
}

#[tokio::test]
async fn run_loop_follows_connectivity_signal() {
    let (engine, remote, _) = offline_engine().await;
    engine.submit(rename("contact-1", "Bob")).await.unwrap();
    let engine = Arc::new(engine);
    let (tx, rx) = tokio::sync::watch::channel(false);

    let task = tokio::spawn(engine.clone().run(rx));
    tx.send(true).unwrap();
    for _ in 0..50 {
        if engine.outbox().is_empty().await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(engine.outbox().is_empty().await);
    assert_eq!(remote.calls().len(), 1);

    tx.send(false).unwrap();
    for _ in 0..50 {
        if engine.network_state() == NetworkState::Offline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(engine.network_state(), NetworkState::Offline);

    drop(tx);
    task.await.unwrap();
}

#[tokio::test]
async fn store_is_shared_through_trait_object() {
    let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
    let engine = SyncOrchestrator::open(
        SyncConfig::default(),
        store.clone(),
        Arc::new(MockRemote::new()),
        NetworkState::Offline,
    )
    .await;
    engine.submit(rename("contact-1", "Bob")).await.unwrap();

    let entries = store
        .entries(driftsync_store::Namespace::Outbox)
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].1["type"], "update");
    assert_eq!(entries[0].1["entityId"], "contact-1");
}
