//! Durable journal of pending local changes.

use crate::error::SyncResult;
use async_trait::async_trait;
use lunara_sync_model::{ChangeOp, ChangeRecord, EntityKind};
use parking_lot::RwLock;
use std::collections::HashSet;
use tracing::debug;
use uuid::Uuid;

/// A durable log of local mutations awaiting push.
///
/// Appends come from the app's write path and must always succeed locally
/// without touching the network. The coordinator drains the journal during a
/// cycle; appends may interleave with an in-flight drain, so removal happens
/// only through explicit acknowledgment.
#[async_trait]
pub trait ChangeJournal: Send + Sync {
    /// Journals a local mutation.
    async fn append(&self, change: ChangeRecord) -> SyncResult<()>;

    /// Returns pending records of a kind, ordered by `occurred_at` with ties
    /// broken by insertion order.
    async fn pending(&self, kind: EntityKind) -> SyncResult<Vec<ChangeRecord>>;

    /// Removes exactly the given records. Partial acknowledgment is legal:
    /// a batch where only some records committed acknowledges only those.
    async fn acknowledge(&self, change_ids: &[Uuid]) -> SyncResult<()>;

    /// Returns the number of pending records across all kinds.
    async fn pending_count(&self) -> SyncResult<usize>;
}

/// An in-memory change journal.
///
/// Keeps one pending record per entity: a new append for an entity that
/// already has one collapses the pair into the operation the remote store
/// ultimately needs (payloads are read at push time, so only the op and
/// timestamp matter).
#[derive(Debug, Default)]
pub struct MemoryChangeJournal {
    entries: RwLock<Vec<ChangeRecord>>,
}

impl MemoryChangeJournal {
    /// Creates an empty journal.
    pub fn new() -> Self {
        Self::default()
    }

    fn coalesce(existing: &mut ChangeRecord, incoming: &ChangeRecord) -> bool {
        let keep = match (existing.op, incoming.op) {
            // Created and deleted before ever reaching the remote: the
            // entity never existed there, drop both.
            (ChangeOp::Create, ChangeOp::Delete) => return false,
            (ChangeOp::Create, _) => ChangeOp::Create,
            (_, ChangeOp::Delete) => ChangeOp::Delete,
            // Recreated after a pending delete: the remote may still hold
            // the old version, so an upsert covers both.
            (ChangeOp::Delete, ChangeOp::Create) => ChangeOp::Update,
            _ => ChangeOp::Update,
        };
        existing.op = keep;
        existing.occurred_at = incoming.occurred_at;
        existing.device_id = incoming.device_id;
        true
    }
}

#[async_trait]
impl ChangeJournal for MemoryChangeJournal {
    async fn append(&self, change: ChangeRecord) -> SyncResult<()> {
        let mut entries = self.entries.write();
        let position = entries
            .iter()
            .position(|e| e.kind == change.kind && e.entity_id == change.entity_id);

        match position {
            Some(index) => {
                if !Self::coalesce(&mut entries[index], &change) {
                    entries.remove(index);
                    debug!(entity_id = %change.entity_id, "create+delete annihilated in journal");
                }
            }
            None => entries.push(change),
        }
        Ok(())
    }

    async fn pending(&self, kind: EntityKind) -> SyncResult<Vec<ChangeRecord>> {
        let entries = self.entries.read();
        let mut pending: Vec<ChangeRecord> = entries
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect();
        // Stable sort keeps insertion order for equal timestamps.
        pending.sort_by_key(|e| e.occurred_at);
        Ok(pending)
    }

    async fn acknowledge(&self, change_ids: &[Uuid]) -> SyncResult<()> {
        let ids: HashSet<&Uuid> = change_ids.iter().collect();
        self.entries.write().retain(|e| !ids.contains(&e.change_id));
        Ok(())
    }

    async fn pending_count(&self) -> SyncResult<usize> {
        Ok(self.entries.read().len())
    }
}
