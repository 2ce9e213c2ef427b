//! Conflict detection and resolution.

use crate::entity::{EntityKind, RemoteEntity, SyncStatus, SyncableEntity};
use crate::payload::Payload;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// A conflict between a local and a remote version of an entity.
///
/// Materialized only when the resolver cannot merge automatically, or when
/// the remote store rejected a pushed record. Destroyed once resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// The entity in conflict.
    pub entity_id: String,
    /// Entity kind.
    pub kind: EntityKind,
    /// The local version, if one exists.
    pub local: Option<SyncableEntity>,
    /// The remote version, if one exists.
    pub remote: Option<RemoteEntity>,
    /// Why the conflict was raised, when it did not come from a merge.
    pub reason: Option<String>,
    /// When the conflict was detected.
    pub detected_at: DateTime<Utc>,
    /// The chosen resolution, once one is made.
    pub resolution: Option<ConflictChoice>,
}

impl ConflictRecord {
    /// Creates a conflict holding both versions of an entity.
    pub fn versions(
        local: SyncableEntity,
        remote: RemoteEntity,
        detected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            entity_id: local.id.clone(),
            kind: local.kind,
            local: Some(local),
            remote: Some(remote),
            reason: None,
            detected_at,
            resolution: None,
        }
    }

    /// Creates a conflict for a record the remote store rejected.
    pub fn rejected(
        local: SyncableEntity,
        reason: impl Into<String>,
        detected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            entity_id: local.id.clone(),
            kind: local.kind,
            local: Some(local),
            remote: None,
            reason: Some(reason.into()),
            detected_at,
            resolution: None,
        }
    }

    /// Returns true if both versions are present.
    pub fn has_both_versions(&self) -> bool {
        self.local.is_some() && self.remote.is_some()
    }

    /// Records the chosen resolution.
    pub fn resolve(&mut self, choice: ConflictChoice) {
        self.resolution = Some(choice);
    }

    /// Returns true if the conflict has been resolved.
    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }
}

/// A resolution choice for a materialized conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictChoice {
    /// Keep the local version.
    KeepLocal,
    /// Accept the remote version.
    AcceptRemote,
}

/// Per-kind merge policy.
///
/// Every kind merges automatically unless marked manual; a manual kind
/// always surfaces a [`ConflictRecord`] when both sides changed.
#[derive(Debug, Clone, Default)]
pub struct MergePolicy {
    manual: BTreeSet<EntityKind>,
}

impl MergePolicy {
    /// Creates a policy where every kind merges automatically.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a kind as requiring manual resolution.
    pub fn with_manual(mut self, kind: EntityKind) -> Self {
        self.manual.insert(kind);
        self
    }

    /// Returns true if the kind requires manual resolution.
    pub fn is_manual(&self, kind: EntityKind) -> bool {
        self.manual.contains(&kind)
    }
}

/// The outcome of resolving a (local, remote) pair.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The remote version supersedes the local one.
    RemoteWins(SyncableEntity),
    /// The local version supersedes the remote one; it must be re-pushed.
    LocalWins(SyncableEntity),
    /// Both sides contributed; the merge must be written and re-pushed.
    Merged(SyncableEntity),
    /// Automatic resolution is not allowed; both versions are preserved.
    Manual(ConflictRecord),
}

impl Resolution {
    /// The resolved entity, when resolution was automatic.
    pub fn entity(&self) -> Option<&SyncableEntity> {
        match self {
            Resolution::RemoteWins(entity)
            | Resolution::LocalWins(entity)
            | Resolution::Merged(entity) => Some(entity),
            Resolution::Manual(_) => None,
        }
    }

    /// Returns true if the local side must be pushed again.
    pub fn needs_push(&self) -> bool {
        matches!(self, Resolution::LocalWins(_) | Resolution::Merged(_))
    }
}

/// Pure timestamp-ordered merge of local and remote entity versions.
///
/// No I/O: the resolver only compares the two versions it is given against
/// the shared baseline (`local.remote_updated_at`, the state as of the last
/// successful sync).
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    policy: MergePolicy,
    device_id: Uuid,
}

impl ConflictResolver {
    /// Creates a resolver for the given policy and local device.
    pub fn new(policy: MergePolicy, device_id: Uuid) -> Self {
        Self { policy, device_id }
    }

    /// Resolves a pulled remote version against its local counterpart.
    ///
    /// - local untouched since baseline: remote wins outright
    /// - remote untouched since baseline: local wins outright
    /// - both changed: field-level merge when both sides carry field
    ///   timestamps, whole-record last-write-wins otherwise; kinds marked
    ///   manual surface a [`ConflictRecord`] instead
    pub fn resolve(
        &self,
        local: &SyncableEntity,
        remote: &RemoteEntity,
        now: DateTime<Utc>,
    ) -> Resolution {
        let baseline = local.remote_updated_at;
        let local_edited = local.has_local_edits() || local.status == SyncStatus::Deleted;
        let remote_edited = match baseline {
            Some(baseline) => remote.remote_updated_at > baseline,
            None => true,
        };

        if !local_edited {
            return Resolution::RemoteWins(SyncableEntity::from_remote(remote));
        }
        if !remote_edited {
            return Resolution::LocalWins(local.clone());
        }

        // Both sides changed since the last sync.
        if self.policy.is_manual(local.kind) {
            return Resolution::Manual(ConflictRecord::versions(
                local.clone(),
                remote.clone(),
                now,
            ));
        }

        let deletion_involved = remote.deleted || local.status == SyncStatus::Deleted;
        if !deletion_involved
            && local.payload.has_field_timestamps()
            && remote.payload.has_field_timestamps()
        {
            return Resolution::Merged(self.merge_fields(local, remote));
        }

        if self.local_wins_record(local, remote) {
            Resolution::LocalWins(local.clone())
        } else {
            Resolution::RemoteWins(SyncableEntity::from_remote(remote))
        }
    }

    /// Whole-record last-write-wins, ties broken by device id.
    fn local_wins_record(&self, local: &SyncableEntity, remote: &RemoteEntity) -> bool {
        match local.local_updated_at.cmp(&remote.remote_updated_at) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            // Exact-timestamp tie: the lexicographically larger device id
            // wins; a remote copy with no recorded origin loses to local.
            std::cmp::Ordering::Equal => match remote.origin_device {
                Some(origin) => self.device_id > origin,
                None => true,
            },
        }
    }

    /// Field-level merge: each field goes to whichever side edited it later;
    /// fields without their own timestamp follow the record-level winner.
    fn merge_fields(&self, local: &SyncableEntity, remote: &RemoteEntity) -> SyncableEntity {
        let record_winner_local = self.local_wins_record(local, remote);
        let lp = &local.payload;
        let rp = &remote.payload;

        let mut names: BTreeSet<&str> = lp.fields().map(|(name, _)| name).collect();
        names.extend(rp.fields().map(|(name, _)| name));

        let mut merged = Payload::new();
        for name in names {
            let take_local = match (lp.get(name), rp.get(name)) {
                (Some(_), None) => true,
                (None, Some(_)) => false,
                _ => match (lp.edited_at(name), rp.edited_at(name)) {
                    (Some(at_local), Some(at_remote)) if at_local != at_remote => {
                        at_local > at_remote
                    }
                    _ => record_winner_local,
                },
            };

            let (payload, value) = if take_local {
                (lp, lp.get(name))
            } else {
                (rp, rp.get(name))
            };
            if let Some(value) = value {
                match payload.edited_at(name) {
                    Some(at) => merged.set_at(name, value.clone(), at),
                    None => merged.set(name, value.clone()),
                }
            }
        }

        SyncableEntity {
            id: local.id.clone(),
            kind: local.kind,
            payload: merged,
            local_updated_at: local.local_updated_at.max(remote.remote_updated_at),
            remote_updated_at: Some(remote.remote_updated_at),
            status: SyncStatus::PendingPush,
        }
    }
}
