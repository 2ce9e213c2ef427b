//! Remote gateway abstraction.
//!
//! The gateway is pure plumbing against the remote document store: batched
//! upserts and timestamp-range pulls, no business logic, no retries. The
//! caller classifies outcomes and decides what to retry.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lunara_sync_model::{ChangeRecord, EntityKind, RemoteEntity, SyncableEntity};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use uuid::Uuid;

/// One record in a push batch: the journal entry plus the entity snapshot it
/// refers to. Deletes carry no snapshot.
#[derive(Debug, Clone)]
pub struct PushItem {
    /// The journaled mutation.
    pub record: ChangeRecord,
    /// The current local entity, absent for deletes.
    pub entity: Option<SyncableEntity>,
}

/// Per-record outcome of a push batch.
#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    /// The record was durably written.
    Committed {
        /// The journal entry that committed.
        change_id: Uuid,
        /// The remote store's write timestamp.
        remote_updated_at: DateTime<Utc>,
    },
    /// The remote store rejected the record; terminal for this record only.
    Rejected {
        /// The rejected journal entry.
        change_id: Uuid,
        /// Rejection reason.
        reason: String,
    },
    /// A transient failure; the whole batch is safe to retry because each
    /// batch is an atomic unit and upserts are idempotent by entity id.
    Retryable {
        /// The affected journal entry.
        change_id: Uuid,
        /// Failure reason.
        reason: String,
    },
}

impl PushOutcome {
    /// The journal entry this outcome refers to.
    pub fn change_id(&self) -> Uuid {
        match self {
            PushOutcome::Committed { change_id, .. }
            | PushOutcome::Rejected { change_id, .. }
            | PushOutcome::Retryable { change_id, .. } => *change_id,
        }
    }
}

/// One page of a timestamp-range pull.
#[derive(Debug, Clone, Default)]
pub struct PullPage {
    /// Entities ordered by `remote_updated_at` ascending.
    pub entities: Vec<RemoteEntity>,
    /// Continuation token when more pages remain.
    pub next_page: Option<String>,
}

/// Batched push/pull against the remote document store.
///
/// Implementations must not retry; they report per-record outcomes and
/// transport errors and leave the policy to the caller.
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    /// Pushes one batch of records for a user. The batch must not exceed the
    /// configured batch size; it is an atomic unit on the remote side.
    async fn push_batch(
        &self,
        user_id: &str,
        items: &[PushItem],
    ) -> SyncResult<Vec<PushOutcome>>;

    /// Pulls entities of a kind with `remote_updated_at` strictly after
    /// `since`, one page at a time.
    async fn pull_since(
        &self,
        user_id: &str,
        kind: EntityKind,
        since: DateTime<Utc>,
        page: Option<&str>,
        limit: usize,
    ) -> SyncResult<PullPage>;
}

/// An in-memory remote store for tests.
///
/// Behaves like a per-user document store with a server-assigned write
/// clock, and offers failure injection: transient outages, per-record
/// rejections and retryable records, and auth failures.
#[derive(Debug)]
pub struct MemoryRemote {
    documents: RwLock<HashMap<(EntityKind, String), RemoteEntity>>,
    clock_ms: AtomicI64,
    fail_pushes: AtomicU32,
    fail_pulls: AtomicU32,
    auth_failed: AtomicBool,
    quota_exceeded: AtomicBool,
    rejected: RwLock<HashSet<String>>,
    retryable: Mutex<HashMap<String, u32>>,
    push_calls: AtomicU32,
    pull_calls: AtomicU32,
}

impl MemoryRemote {
    /// Creates an empty remote store.
    pub fn new() -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
            clock_ms: AtomicI64::new(1_000_000_000_000),
            fail_pushes: AtomicU32::new(0),
            fail_pulls: AtomicU32::new(0),
            auth_failed: AtomicBool::new(false),
            quota_exceeded: AtomicBool::new(false),
            rejected: RwLock::new(HashSet::new()),
            retryable: Mutex::new(HashMap::new()),
            push_calls: AtomicU32::new(0),
            pull_calls: AtomicU32::new(0),
        }
    }

    /// Seeds a document, as if another device had pushed it.
    pub fn insert_document(&self, entity: RemoteEntity) {
        self.documents
            .write()
            .insert((entity.kind, entity.id.clone()), entity);
    }

    /// Returns a stored document.
    pub fn document(&self, kind: EntityKind, id: &str) -> Option<RemoteEntity> {
        self.documents.read().get(&(kind, id.to_string())).cloned()
    }

    /// Returns the number of stored documents, tombstones included.
    pub fn document_count(&self) -> usize {
        self.documents.read().len()
    }

    /// Fails the next `count` push calls with a retryable network error.
    pub fn fail_next_pushes(&self, count: u32) {
        self.fail_pushes.store(count, Ordering::SeqCst);
    }

    /// Fails the next `count` pull calls with a retryable network error.
    pub fn fail_next_pulls(&self, count: u32) {
        self.fail_pulls.store(count, Ordering::SeqCst);
    }

    /// Makes every call fail with an auth error until cleared.
    pub fn set_auth_failed(&self, failed: bool) {
        self.auth_failed.store(failed, Ordering::SeqCst);
    }

    /// Makes writes fail with a quota error until cleared.
    pub fn set_quota_exceeded(&self, exceeded: bool) {
        self.quota_exceeded.store(exceeded, Ordering::SeqCst);
    }

    /// Permanently rejects pushes for an entity id.
    pub fn reject_entity(&self, entity_id: impl Into<String>) {
        self.rejected.write().insert(entity_id.into());
    }

    /// Reports an entity as retryable for the next `times` push batches it
    /// appears in. Per batch atomicity, those batches commit nothing.
    pub fn set_retryable(&self, entity_id: impl Into<String>, times: u32) {
        self.retryable.lock().insert(entity_id.into(), times);
    }

    /// Number of push calls made.
    pub fn push_calls(&self) -> u32 {
        self.push_calls.load(Ordering::SeqCst)
    }

    /// Number of pull calls made.
    pub fn pull_calls(&self) -> u32 {
        self.pull_calls.load(Ordering::SeqCst)
    }

    fn tick(&self) -> DateTime<Utc> {
        let ms = self.clock_ms.fetch_add(1_000, Ordering::SeqCst);
        DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::UNIX_EPOCH)
    }

    fn check_auth(&self) -> SyncResult<()> {
        if self.auth_failed.load(Ordering::SeqCst) {
            Err(SyncError::Auth("credentials expired".into()))
        } else {
            Ok(())
        }
    }

    fn take_outage(&self, counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Marks retryable items for this batch, consuming one strike per entity.
    fn retryable_in(&self, items: &[PushItem]) -> Option<String> {
        let mut retryable = self.retryable.lock();
        for item in items {
            if let Some(times) = retryable.get_mut(&item.record.entity_id) {
                if *times > 0 {
                    *times -= 1;
                    return Some(item.record.entity_id.clone());
                }
            }
        }
        None
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteGateway for MemoryRemote {
    async fn push_batch(
        &self,
        _user_id: &str,
        items: &[PushItem],
    ) -> SyncResult<Vec<PushOutcome>> {
        self.push_calls.fetch_add(1, Ordering::SeqCst);
        self.check_auth()?;
        if self.quota_exceeded.load(Ordering::SeqCst) {
            return Err(SyncError::Quota("storage quota exhausted".into()));
        }
        if self.take_outage(&self.fail_pushes) {
            return Err(SyncError::network_retryable("simulated outage"));
        }

        // The batch is atomic: one transiently failing record aborts the
        // whole write and every record reports Retryable.
        if let Some(entity_id) = self.retryable_in(items) {
            let reason = format!("write contention on {entity_id}");
            return Ok(items
                .iter()
                .map(|item| PushOutcome::Retryable {
                    change_id: item.record.change_id,
                    reason: reason.clone(),
                })
                .collect());
        }

        let rejected = self.rejected.read();
        let mut documents = self.documents.write();
        let mut outcomes = Vec::with_capacity(items.len());
        for item in items {
            let record = &item.record;
            if rejected.contains(&record.entity_id) {
                outcomes.push(PushOutcome::Rejected {
                    change_id: record.change_id,
                    reason: "schema validation failed".into(),
                });
                continue;
            }

            let committed_at = self.tick();
            let key = (record.kind, record.entity_id.clone());
            if record.op.is_delete() {
                documents.insert(
                    key,
                    RemoteEntity::tombstone(record.entity_id.clone(), record.kind, committed_at)
                        .with_origin(record.device_id),
                );
            } else if let Some(entity) = &item.entity {
                documents.insert(
                    key,
                    RemoteEntity::new(
                        record.entity_id.clone(),
                        record.kind,
                        entity.payload.clone(),
                        committed_at,
                    )
                    .with_origin(record.device_id),
                );
            }
            outcomes.push(PushOutcome::Committed {
                change_id: record.change_id,
                remote_updated_at: committed_at,
            });
        }
        Ok(outcomes)
    }

    async fn pull_since(
        &self,
        _user_id: &str,
        kind: EntityKind,
        since: DateTime<Utc>,
        page: Option<&str>,
        limit: usize,
    ) -> SyncResult<PullPage> {
        self.pull_calls.fetch_add(1, Ordering::SeqCst);
        self.check_auth()?;
        if self.take_outage(&self.fail_pulls) {
            return Err(SyncError::network_retryable("simulated outage"));
        }

        let mut matching: Vec<RemoteEntity> = self
            .documents
            .read()
            .values()
            .filter(|e| e.kind == kind && e.remote_updated_at > since)
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            a.remote_updated_at
                .cmp(&b.remote_updated_at)
                .then_with(|| a.id.cmp(&b.id))
        });

        let offset: usize = page.and_then(|p| p.parse().ok()).unwrap_or(0);
        let end = (offset + limit.max(1)).min(matching.len());
        let next_page = (end < matching.len()).then(|| end.to_string());

        Ok(PullPage {
            entities: matching.get(offset..end).unwrap_or_default().to_vec(),
            next_page,
        })
    }
}
