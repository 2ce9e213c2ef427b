//! Syncable entity types.

use crate::payload::Payload;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// The kind of record being synchronized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    /// The account-level user profile.
    User,
    /// A menstrual cycle.
    Cycle,
    /// A single day's log entries.
    DailyLog,
    /// A derived insight.
    Insight,
    /// App settings.
    Settings,
}

impl EntityKind {
    /// All kinds, in sync order.
    pub const ALL: [EntityKind; 5] = [
        EntityKind::User,
        EntityKind::Cycle,
        EntityKind::DailyLog,
        EntityKind::Insight,
        EntityKind::Settings,
    ];

    /// Returns the stable string code used in persisted state.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::User => "user",
            EntityKind::Cycle => "cycle",
            EntityKind::DailyLog => "daily_log",
            EntityKind::Insight => "insight",
            EntityKind::Settings => "settings",
        }
    }

    /// Parses a stable string code.
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "user" => Some(EntityKind::User),
            "cycle" => Some(EntityKind::Cycle),
            "daily_log" => Some(EntityKind::DailyLog),
            "insight" => Some(EntityKind::Insight),
            "settings" => Some(EntityKind::Settings),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local sync lifecycle of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    /// In step with the remote store; no journal entry exists.
    Clean,
    /// Locally edited, awaiting push.
    PendingPush,
    /// Parked behind an unresolved conflict.
    PendingConflict,
    /// Locally deleted, awaiting tombstone push.
    Deleted,
}

impl SyncStatus {
    /// Returns true if the entity still has work pending against the remote.
    pub fn is_dirty(&self) -> bool {
        !matches!(self, SyncStatus::Clean)
    }
}

/// A versioned local record.
///
/// # Invariants
///
/// - `status == Clean` implies `local_updated_at <= remote_updated_at` and
///   no change-journal entry exists for this id
/// - `remote_updated_at` is `None` until the first successful sync
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncableEntity {
    /// Entity id, unique within its kind.
    pub id: String,
    /// Entity kind.
    pub kind: EntityKind,
    /// The record's fields.
    pub payload: Payload,
    /// When the record was last edited on this device.
    pub local_updated_at: DateTime<Utc>,
    /// The remote store's timestamp as of the last sync.
    pub remote_updated_at: Option<DateTime<Utc>>,
    /// Sync lifecycle status.
    pub status: SyncStatus,
}

impl SyncableEntity {
    /// Creates a never-synced local record.
    pub fn new(
        id: impl Into<String>,
        kind: EntityKind,
        payload: Payload,
        edited_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            payload,
            local_updated_at: edited_at,
            remote_updated_at: None,
            status: SyncStatus::PendingPush,
        }
    }

    /// Builds the local shape of a record pulled from the remote store.
    ///
    /// A tombstone becomes a `Deleted` record so callers can turn it into a
    /// local removal.
    pub fn from_remote(remote: &RemoteEntity) -> Self {
        Self {
            id: remote.id.clone(),
            kind: remote.kind,
            payload: remote.payload.clone(),
            local_updated_at: remote.remote_updated_at,
            remote_updated_at: Some(remote.remote_updated_at),
            status: if remote.deleted {
                SyncStatus::Deleted
            } else {
                SyncStatus::Clean
            },
        }
    }

    /// Returns true if the record was edited locally since the last sync.
    pub fn has_local_edits(&self) -> bool {
        match self.remote_updated_at {
            Some(baseline) => self.local_updated_at > baseline,
            None => true,
        }
    }

    /// Marks the record as committed remotely at `committed_at`.
    ///
    /// The remote timestamp is clamped to `local_updated_at` so a lagging
    /// server clock cannot leave a `Clean` record looking locally edited.
    pub fn mark_synced(&mut self, committed_at: DateTime<Utc>) {
        self.remote_updated_at = Some(committed_at.max(self.local_updated_at));
        self.status = SyncStatus::Clean;
    }
}

/// A record as it exists in the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteEntity {
    /// Entity id, unique within its kind.
    pub id: String,
    /// Entity kind.
    pub kind: EntityKind,
    /// The record's fields. Empty for tombstones.
    pub payload: Payload,
    /// The remote store's last-write timestamp.
    pub remote_updated_at: DateTime<Utc>,
    /// The device that produced the remote version, when known.
    pub origin_device: Option<Uuid>,
    /// True if the remote copy is a deletion tombstone.
    pub deleted: bool,
}

impl RemoteEntity {
    /// Creates a live remote record.
    pub fn new(
        id: impl Into<String>,
        kind: EntityKind,
        payload: Payload,
        remote_updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            payload,
            remote_updated_at,
            origin_device: None,
            deleted: false,
        }
    }

    /// Creates a deletion tombstone.
    pub fn tombstone(
        id: impl Into<String>,
        kind: EntityKind,
        deleted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            payload: Payload::new(),
            remote_updated_at: deleted_at,
            origin_device: None,
            deleted: true,
        }
    }

    /// Attaches the originating device id.
    pub fn with_origin(mut self, device: Uuid) -> Self {
        self.origin_device = Some(device);
        self
    }
}
