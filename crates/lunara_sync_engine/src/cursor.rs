//! Per-kind sync cursors.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lunara_sync_model::EntityKind;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::error;

/// Per-kind watermark of the last successfully synced remote timestamp.
///
/// Cursors are monotonically non-decreasing. Only the coordinator advances
/// them, at the end of a successful pull, and only to the maximum
/// `remote_updated_at` it actually applied.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Returns the cursor for a kind, or the epoch if it never synced.
    async fn get(&self, kind: EntityKind) -> SyncResult<DateTime<Utc>>;

    /// Advances the cursor.
    ///
    /// A timestamp earlier than the stored watermark is a logic bug
    /// upstream: the call fails with [`SyncError::InvariantViolation`] and
    /// leaves the cursor untouched.
    async fn advance(&self, kind: EntityKind, to: DateTime<Utc>) -> SyncResult<()>;
}

/// An in-memory cursor store.
#[derive(Debug, Default)]
pub struct MemoryCursorStore {
    cursors: RwLock<BTreeMap<EntityKind, DateTime<Utc>>>,
}

impl MemoryCursorStore {
    /// Creates a store with every cursor at the epoch.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn get(&self, kind: EntityKind) -> SyncResult<DateTime<Utc>> {
        Ok(self
            .cursors
            .read()
            .get(&kind)
            .copied()
            .unwrap_or(DateTime::UNIX_EPOCH))
    }

    async fn advance(&self, kind: EntityKind, to: DateTime<Utc>) -> SyncResult<()> {
        let mut cursors = self.cursors.write();
        let current = cursors.get(&kind).copied().unwrap_or(DateTime::UNIX_EPOCH);
        if to < current {
            error!(kind = %kind, current = %current, requested = %to, "cursor regression attempted");
            return Err(SyncError::InvariantViolation(format!(
                "cursor for {kind} would regress from {current} to {to}"
            )));
        }
        cursors.insert(kind, to);
        Ok(())
    }
}
