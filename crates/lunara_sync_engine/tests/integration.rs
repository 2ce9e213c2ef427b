//! Integration tests: full sync cycles against an in-memory remote.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use lunara_sync_engine::{
    ChangeJournal, CursorStore, LocalStore, MemoryChangeJournal, MemoryCursorStore,
    MemoryLocalStore, MemoryRemote, MockConnectivity, MockIdentity, PullPage, PushItem,
    PushOutcome, RemoteGateway, RetryConfig, SyncConfig, SyncCoordinator, SyncError, SyncPhase,
    SyncResult, SyncTrigger,
};
use lunara_sync_model::{
    ChangeOp, ChangeRecord, EntityKind, MergePolicy, Payload, RemoteEntity, SyncStatus,
    SyncableEntity,
};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Semaphore;
use uuid::Uuid;

const DEVICE_A: Uuid = Uuid::from_u128(0xA);
const DEVICE_B: Uuid = Uuid::from_u128(0xB);

/// One device's engine instance: the coordinator plus shared handles to its
/// ports so tests can seed and inspect state.
struct Device<G> {
    coordinator: SyncCoordinator<G, MemoryChangeJournal, MemoryCursorStore, MemoryLocalStore>,
    journal: Arc<MemoryChangeJournal>,
    cursors: Arc<MemoryCursorStore>,
    store: Arc<MemoryLocalStore>,
    device_id: Uuid,
}

fn device<G: RemoteGateway>(
    gateway: Arc<G>,
    device_id: Uuid,
    policy: MergePolicy,
) -> Device<G> {
    let journal = Arc::new(MemoryChangeJournal::new());
    let cursors = Arc::new(MemoryCursorStore::new());
    let store = Arc::new(MemoryLocalStore::new());
    let coordinator = SyncCoordinator::new(
        SyncConfig::new(device_id)
            .with_retry(RetryConfig::no_retry())
            .with_merge_policy(policy),
        gateway,
        Arc::clone(&journal),
        Arc::clone(&cursors),
        Arc::clone(&store),
        Arc::new(MockConnectivity::new(true)),
        Arc::new(MockIdentity::new("user-1")),
    );
    Device {
        coordinator,
        journal,
        cursors,
        store,
        device_id,
    }
}

fn simple_device(remote: &Arc<MemoryRemote>, device_id: Uuid) -> Device<MemoryRemote> {
    device(Arc::clone(remote), device_id, MergePolicy::new())
}

fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

fn flow_payload(flow: &str) -> Payload {
    let mut payload = Payload::new();
    payload.set("flow", json!(flow));
    payload
}

/// Mimics the app's write path: update the local row and journal the change.
async fn local_edit<G: RemoteGateway>(
    device: &Device<G>,
    id: &str,
    payload: Payload,
    op: ChangeOp,
    at: DateTime<Utc>,
) {
    if !op.is_delete() {
        let entity = match device
            .store
            .read_entity(EntityKind::DailyLog, id)
            .await
            .unwrap()
        {
            Some(mut entity) => {
                entity.payload = payload;
                entity.local_updated_at = at;
                entity.status = SyncStatus::PendingPush;
                entity
            }
            None => SyncableEntity::new(id, EntityKind::DailyLog, payload, at),
        };
        device.store.write_entity(entity).await.unwrap();
    }
    device
        .journal
        .append(ChangeRecord::new(
            id,
            EntityKind::DailyLog,
            op,
            at,
            device.device_id,
        ))
        .await
        .unwrap();
}

#[tokio::test]
async fn never_synced_entity_pushes_and_becomes_clean() {
    let remote = Arc::new(MemoryRemote::new());
    let dev = simple_device(&remote, DEVICE_A);

    local_edit(&dev, "d1", flow_payload("medium"), ChangeOp::Create, ts(100)).await;

    let report = dev.coordinator.trigger(SyncTrigger::Manual).await.unwrap();
    assert_eq!(report.pushed, 1);
    assert_eq!(report.conflicts, 0);

    let entity = dev
        .store
        .read_entity(EntityKind::DailyLog, "d1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entity.status, SyncStatus::Clean);
    assert!(entity.remote_updated_at.is_some());
    assert_eq!(dev.journal.pending_count().await.unwrap(), 0);

    let doc = remote.document(EntityKind::DailyLog, "d1").unwrap();
    assert_eq!(doc.payload, flow_payload("medium"));
    assert!(!doc.deleted);
}

#[tokio::test]
async fn second_cycle_is_idempotent() {
    let remote = Arc::new(MemoryRemote::new());
    let dev = simple_device(&remote, DEVICE_A);

    local_edit(&dev, "d1", flow_payload("light"), ChangeOp::Create, ts(100)).await;
    local_edit(&dev, "d2", flow_payload("heavy"), ChangeOp::Create, ts(200)).await;

    dev.coordinator.trigger(SyncTrigger::Manual).await.unwrap();

    let entities_before = dev.store.list_kind(EntityKind::DailyLog).await.unwrap();
    let cursor_before = dev.cursors.get(EntityKind::DailyLog).await.unwrap();
    let remote_count_before = remote.document_count();

    let report = dev.coordinator.trigger(SyncTrigger::Manual).await.unwrap();
    assert_eq!(report.pushed, 0);
    assert_eq!(report.pulled, 0);

    assert_eq!(
        dev.store.list_kind(EntityKind::DailyLog).await.unwrap(),
        entities_before
    );
    assert_eq!(
        dev.cursors.get(EntityKind::DailyLog).await.unwrap(),
        cursor_before
    );
    assert_eq!(dev.journal.pending_count().await.unwrap(), 0);
    assert_eq!(remote.document_count(), remote_count_before);
}

#[tokio::test]
async fn newer_local_copy_converges_to_remote() {
    let remote = Arc::new(MemoryRemote::new());
    remote.insert_document(
        RemoteEntity::new("d1", EntityKind::DailyLog, flow_payload("stale"), ts(50))
            .with_origin(DEVICE_B),
    );

    let dev = simple_device(&remote, DEVICE_A);
    // Synced at baseline 50, then edited locally at 100.
    let mut entity = SyncableEntity::new("d1", EntityKind::DailyLog, flow_payload("fresh"), ts(100));
    entity.remote_updated_at = Some(ts(50));
    dev.store.write_entity(entity).await.unwrap();
    dev.journal
        .append(ChangeRecord::new(
            "d1",
            EntityKind::DailyLog,
            ChangeOp::Update,
            ts(100),
            DEVICE_A,
        ))
        .await
        .unwrap();

    dev.coordinator.trigger(SyncTrigger::Manual).await.unwrap();

    // The remote copy now equals the local pre-sync copy.
    let doc = remote.document(EntityKind::DailyLog, "d1").unwrap();
    assert_eq!(doc.payload, flow_payload("fresh"));
}

#[tokio::test]
async fn rejected_record_does_not_block_its_batch() {
    let remote = Arc::new(MemoryRemote::new());
    remote.reject_entity("d3");
    let dev = simple_device(&remote, DEVICE_A);

    for (i, id) in ["d1", "d2", "d3", "d4", "d5"].iter().enumerate() {
        local_edit(
            &dev,
            id,
            flow_payload("medium"),
            ChangeOp::Create,
            ts(100 + i as i64),
        )
        .await;
    }

    let report = dev.coordinator.trigger(SyncTrigger::Manual).await.unwrap();
    assert_eq!(report.pushed, 4);
    assert_eq!(report.rejected, 1);
    assert_eq!(report.conflicts, 1);

    // Siblings committed and were acknowledged.
    assert_eq!(remote.document_count(), 4);
    assert_eq!(dev.journal.pending_count().await.unwrap(), 0);

    // The rejected record is parked with a conflict preserving its data.
    let parked = dev
        .store
        .read_entity(EntityKind::DailyLog, "d3")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(parked.status, SyncStatus::PendingConflict);
    let conflicts = dev.store.conflicts().await.unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].entity_id, "d3");
    assert!(conflicts[0].reason.is_some());
}

#[tokio::test]
async fn transient_outage_is_retried_within_the_cycle() {
    let remote = Arc::new(MemoryRemote::new());
    remote.fail_next_pushes(2);

    let journal = Arc::new(MemoryChangeJournal::new());
    let cursors = Arc::new(MemoryCursorStore::new());
    let store = Arc::new(MemoryLocalStore::new());
    let retry = RetryConfig::new(5)
        .with_initial_delay(std::time::Duration::from_millis(1))
        .with_max_delay(std::time::Duration::from_millis(2));
    let coordinator = SyncCoordinator::new(
        SyncConfig::new(DEVICE_A).with_retry(retry),
        Arc::clone(&remote),
        Arc::clone(&journal),
        Arc::clone(&cursors),
        Arc::clone(&store),
        Arc::new(MockConnectivity::new(true)),
        Arc::new(MockIdentity::new("user-1")),
    );
    let dev = Device {
        coordinator,
        journal,
        cursors,
        store,
        device_id: DEVICE_A,
    };

    local_edit(&dev, "d1", flow_payload("medium"), ChangeOp::Create, ts(100)).await;

    let report = dev.coordinator.trigger(SyncTrigger::Manual).await.unwrap();
    assert_eq!(report.pushed, 1);
    // Two failed attempts plus the success.
    assert_eq!(remote.push_calls(), 3);
}

#[tokio::test]
async fn exhausted_retries_fail_the_cycle_but_preserve_the_journal() {
    let remote = Arc::new(MemoryRemote::new());
    remote.fail_next_pushes(10);
    let dev = simple_device(&remote, DEVICE_A);

    local_edit(&dev, "d1", flow_payload("medium"), ChangeOp::Create, ts(100)).await;

    let err = dev.coordinator.trigger(SyncTrigger::Manual).await.unwrap_err();
    assert!(err.is_retryable());

    // Nothing lost: the journal entry survives for the next trigger.
    assert_eq!(dev.journal.pending_count().await.unwrap(), 1);
    assert_eq!(
        dev.cursors.get(EntityKind::DailyLog).await.unwrap(),
        DateTime::UNIX_EPOCH
    );

    // Next trigger retries from scratch and succeeds.
    remote.fail_next_pushes(0);
    let report = dev.coordinator.trigger(SyncTrigger::Manual).await.unwrap();
    assert_eq!(report.pushed, 1);
}

#[tokio::test]
async fn auth_failure_is_terminal_and_immediate() {
    let remote = Arc::new(MemoryRemote::new());
    remote.set_auth_failed(true);
    let dev = simple_device(&remote, DEVICE_A);

    local_edit(&dev, "d1", flow_payload("medium"), ChangeOp::Create, ts(100)).await;

    let err = dev.coordinator.trigger(SyncTrigger::Manual).await.unwrap_err();
    assert!(matches!(err, SyncError::Auth(_)));
    assert_eq!(remote.push_calls(), 1);
    assert_eq!(dev.journal.pending_count().await.unwrap(), 1);
}

#[tokio::test]
async fn quota_error_fails_the_cycle_without_retry() {
    let remote = Arc::new(MemoryRemote::new());
    remote.set_quota_exceeded(true);
    let dev = simple_device(&remote, DEVICE_A);

    local_edit(&dev, "d1", flow_payload("medium"), ChangeOp::Create, ts(100)).await;

    let err = dev.coordinator.trigger(SyncTrigger::Manual).await.unwrap_err();
    assert!(matches!(err, SyncError::Quota(_)));
    assert_eq!(remote.push_calls(), 1);
}

#[tokio::test]
async fn raced_local_edit_resolves_by_last_write_wins() {
    let remote = Arc::new(MemoryRemote::new());
    remote.insert_document(
        RemoteEntity::new("d1", EntityKind::DailyLog, flow_payload("remote"), ts(200))
            .with_origin(DEVICE_B),
    );

    let dev = simple_device(&remote, DEVICE_A);
    dev.cursors.advance(EntityKind::DailyLog, ts(50)).await.unwrap();
    // A local edit that raced the push phase: the row is dirty against
    // baseline 50 but its journal entry has not been written yet.
    let mut entity = SyncableEntity::new("d1", EntityKind::DailyLog, flow_payload("local"), ts(100));
    entity.remote_updated_at = Some(ts(50));
    dev.store.write_entity(entity).await.unwrap();

    let report = dev.coordinator.trigger(SyncTrigger::Manual).await.unwrap();
    assert_eq!(report.pulled, 1);
    assert_eq!(report.conflicts, 0);

    // Remote edit is later (200 > 100): remote wins, no conflict record.
    let entity = dev
        .store
        .read_entity(EntityKind::DailyLog, "d1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entity.payload, flow_payload("remote"));
    assert_eq!(entity.status, SyncStatus::Clean);
    assert_eq!(dev.cursors.get(EntityKind::DailyLog).await.unwrap(), ts(200));
}

#[tokio::test]
async fn non_mergeable_kind_materializes_a_conflict() {
    let remote = Arc::new(MemoryRemote::new());
    remote.insert_document(
        RemoteEntity::new("d1", EntityKind::DailyLog, flow_payload("remote"), ts(200))
            .with_origin(DEVICE_B),
    );

    let policy = MergePolicy::new().with_manual(EntityKind::DailyLog);
    let dev = device(Arc::clone(&remote), DEVICE_A, policy);
    dev.cursors.advance(EntityKind::DailyLog, ts(50)).await.unwrap();
    let mut entity = SyncableEntity::new("d1", EntityKind::DailyLog, flow_payload("local"), ts(100));
    entity.remote_updated_at = Some(ts(50));
    dev.store.write_entity(entity).await.unwrap();

    let report = dev.coordinator.trigger(SyncTrigger::Manual).await.unwrap();
    assert_eq!(report.conflicts, 1);

    // Both versions preserved; the local row is parked.
    let conflicts = dev.store.conflicts().await.unwrap();
    assert_eq!(conflicts.len(), 1);
    assert!(conflicts[0].has_both_versions());
    let parked = dev
        .store
        .read_entity(EntityKind::DailyLog, "d1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(parked.status, SyncStatus::PendingConflict);
    assert_eq!(parked.payload, flow_payload("local"));

    // The conflicting range is not re-pulled forever.
    assert_eq!(dev.cursors.get(EntityKind::DailyLog).await.unwrap(), ts(200));
}

#[tokio::test]
async fn field_level_edits_merge_across_devices() {
    let remote = Arc::new(MemoryRemote::new());
    let mut remote_payload = Payload::new();
    remote_payload.set_at("flow", json!("light"), ts(80));
    remote_payload.set_at("mood", json!("anxious"), ts(190));
    remote.insert_document(
        RemoteEntity::new("d1", EntityKind::DailyLog, remote_payload, ts(200))
            .with_origin(DEVICE_B),
    );

    let dev = simple_device(&remote, DEVICE_A);
    dev.cursors.advance(EntityKind::DailyLog, ts(50)).await.unwrap();
    let mut local_payload = Payload::new();
    local_payload.set_at("flow", json!("heavy"), ts(120));
    local_payload.set_at("mood", json!("calm"), ts(60));
    let mut entity = SyncableEntity::new("d1", EntityKind::DailyLog, local_payload, ts(120));
    entity.remote_updated_at = Some(ts(50));
    dev.store.write_entity(entity).await.unwrap();

    let report = dev.coordinator.trigger(SyncTrigger::Manual).await.unwrap();
    assert_eq!(report.merged, 1);

    // Later edit wins per field: local flow (120 > 80), remote mood (190 > 60).
    let merged = dev
        .store
        .read_entity(EntityKind::DailyLog, "d1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(merged.payload.get("flow"), Some(&json!("heavy")));
    assert_eq!(merged.payload.get("mood"), Some(&json!("anxious")));

    // The merge is journaled for re-push so the remote converges too.
    assert_eq!(dev.journal.pending_count().await.unwrap(), 1);
    let report = dev.coordinator.trigger(SyncTrigger::Manual).await.unwrap();
    assert_eq!(report.pushed, 1);
    let doc = remote.document(EntityKind::DailyLog, "d1").unwrap();
    assert_eq!(doc.payload.get("flow"), Some(&json!("heavy")));
    assert_eq!(doc.payload.get("mood"), Some(&json!("anxious")));
}

#[tokio::test]
async fn two_devices_converge_through_the_remote() {
    let remote = Arc::new(MemoryRemote::new());
    let dev_a = simple_device(&remote, DEVICE_A);
    let dev_b = simple_device(&remote, DEVICE_B);

    // A creates and pushes; B pulls it.
    local_edit(&dev_a, "d1", flow_payload("medium"), ChangeOp::Create, ts(100)).await;
    dev_a.coordinator.trigger(SyncTrigger::Manual).await.unwrap();
    let report = dev_b.coordinator.trigger(SyncTrigger::Manual).await.unwrap();
    assert_eq!(report.pulled, 1);
    let on_b = dev_b
        .store
        .read_entity(EntityKind::DailyLog, "d1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(on_b.payload, flow_payload("medium"));
    assert_eq!(on_b.status, SyncStatus::Clean);

    // A edits; B picks up the new version.
    local_edit(&dev_a, "d1", flow_payload("heavy"), ChangeOp::Update, ts(300)).await;
    dev_a.coordinator.trigger(SyncTrigger::Manual).await.unwrap();
    dev_b.coordinator.trigger(SyncTrigger::Manual).await.unwrap();
    let on_b = dev_b
        .store
        .read_entity(EntityKind::DailyLog, "d1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(on_b.payload, flow_payload("heavy"));

    // A deletes; the tombstone removes B's copy.
    local_edit(&dev_a, "d1", Payload::new(), ChangeOp::Delete, ts(400)).await;
    dev_a.coordinator.trigger(SyncTrigger::Manual).await.unwrap();
    dev_b.coordinator.trigger(SyncTrigger::Manual).await.unwrap();
    assert!(dev_b
        .store
        .read_entity(EntityKind::DailyLog, "d1")
        .await
        .unwrap()
        .is_none());
    assert!(dev_a
        .store
        .read_entity(EntityKind::DailyLog, "d1")
        .await
        .unwrap()
        .is_none());
}

/// A gateway whose pulls block until the test grants a permit, holding a
/// cycle open in its pulling phase.
struct GatedRemote {
    inner: Arc<MemoryRemote>,
    pull_gate: Arc<Semaphore>,
}

#[async_trait]
impl RemoteGateway for GatedRemote {
    async fn push_batch(&self, user_id: &str, items: &[PushItem]) -> SyncResult<Vec<PushOutcome>> {
        self.inner.push_batch(user_id, items).await
    }

    async fn pull_since(
        &self,
        user_id: &str,
        kind: EntityKind,
        since: DateTime<Utc>,
        page: Option<&str>,
        limit: usize,
    ) -> SyncResult<PullPage> {
        let permit = self
            .pull_gate
            .acquire()
            .await
            .map_err(|_| SyncError::Cancelled)?;
        permit.forget();
        self.inner.pull_since(user_id, kind, since, page, limit).await
    }
}

// One pull call per entity kind when every kind fits in one page.
const PULLS_PER_CYCLE: usize = EntityKind::ALL.len();

#[tokio::test]
async fn concurrent_triggers_coalesce_into_one_cycle() {
    let remote = Arc::new(MemoryRemote::new());
    let gate = Arc::new(Semaphore::new(0));
    let gated = Arc::new(GatedRemote {
        inner: Arc::clone(&remote),
        pull_gate: Arc::clone(&gate),
    });
    let dev = Arc::new(device(gated, DEVICE_A, MergePolicy::new()));

    local_edit(&dev, "d1", flow_payload("medium"), ChangeOp::Create, ts(100)).await;

    let first = {
        let dev = Arc::clone(&dev);
        tokio::spawn(async move { dev.coordinator.trigger(SyncTrigger::Manual).await })
    };

    // Wait until the first cycle is parked in its pulling phase.
    let mut phases = dev.coordinator.subscribe();
    phases
        .wait_for(|phase| *phase == SyncPhase::Pulling)
        .await
        .unwrap();

    let second = {
        let dev = Arc::clone(&dev);
        tokio::spawn(async move { dev.coordinator.trigger(SyncTrigger::Scheduled).await })
    };

    // Let the second trigger register against the in-flight cycle before the
    // gate opens.
    tokio::task::yield_now().await;
    tokio::task::yield_now().await;

    gate.add_permits(PULLS_PER_CYCLE);

    let report_a = first.await.unwrap().unwrap();
    let report_b = second.await.unwrap().unwrap();

    // Both callers observed the same single cycle.
    assert_eq!(report_a, report_b);
    assert_eq!(report_a.pushed, 1);
    assert_eq!(remote.push_calls(), 1);
    assert_eq!(remote.pull_calls() as usize, PULLS_PER_CYCLE);
}

#[tokio::test]
async fn cancellation_mid_pull_is_safe_to_resume() {
    let remote = Arc::new(MemoryRemote::new());
    let gate = Arc::new(Semaphore::new(0));
    let gated = Arc::new(GatedRemote {
        inner: Arc::clone(&remote),
        pull_gate: Arc::clone(&gate),
    });
    let dev = Arc::new(device(gated, DEVICE_A, MergePolicy::new()));

    local_edit(&dev, "d1", flow_payload("medium"), ChangeOp::Create, ts(100)).await;

    let cycle = {
        let dev = Arc::clone(&dev);
        tokio::spawn(async move { dev.coordinator.trigger(SyncTrigger::Manual).await })
    };

    let mut phases = dev.coordinator.subscribe();
    phases
        .wait_for(|phase| *phase == SyncPhase::Pulling)
        .await
        .unwrap();

    // Push already committed; cancel while the pull is parked.
    dev.coordinator.cancel();
    gate.add_permits(PULLS_PER_CYCLE);

    let err = cycle.await.unwrap().unwrap_err();
    assert!(matches!(err, SyncError::Cancelled));

    // Acknowledged push stays acknowledged, the cursor never advanced.
    assert_eq!(dev.journal.pending_count().await.unwrap(), 0);
    assert_eq!(remote.document_count(), 1);
    assert_eq!(
        dev.cursors.get(EntityKind::DailyLog).await.unwrap(),
        DateTime::UNIX_EPOCH
    );

    // The next trigger re-pulls the same range and completes.
    gate.add_permits(PULLS_PER_CYCLE * 2);
    let report = dev.coordinator.trigger(SyncTrigger::Manual).await.unwrap();
    assert_eq!(report.pulled, 1);
    assert!(dev.cursors.get(EntityKind::DailyLog).await.unwrap() > DateTime::UNIX_EPOCH);
}
