//! Pending-change records.

use crate::entity::EntityKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The kind of local mutation a change record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeOp {
    /// Entity was created locally.
    Create,
    /// Entity was updated locally.
    Update,
    /// Entity was deleted locally.
    Delete,
}

impl ChangeOp {
    /// Returns true for deletions.
    pub fn is_delete(&self) -> bool {
        matches!(self, ChangeOp::Delete)
    }
}

/// One pending local mutation, journaled until the remote store confirms it.
///
/// Records for the same entity are pushed in `occurred_at` order to preserve
/// the causal order of edits; the journal breaks ties by insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Unique id of this journal entry.
    pub change_id: Uuid,
    /// The entity the mutation applies to.
    pub entity_id: String,
    /// Entity kind.
    pub kind: EntityKind,
    /// What happened.
    pub op: ChangeOp,
    /// When the mutation happened on this device.
    pub occurred_at: DateTime<Utc>,
    /// The device that made the mutation.
    pub device_id: Uuid,
}

impl ChangeRecord {
    /// Creates a new change record with a fresh id.
    pub fn new(
        entity_id: impl Into<String>,
        kind: EntityKind,
        op: ChangeOp,
        occurred_at: DateTime<Utc>,
        device_id: Uuid,
    ) -> Self {
        Self {
            change_id: Uuid::new_v4(),
            entity_id: entity_id.into(),
            kind,
            op,
            occurred_at,
            device_id,
        }
    }
}
