//! Local-side ports consumed by the coordinator.
//!
//! The local store, connectivity oracle and identity provider are owned by
//! the host app; the engine only sees these traits. In-memory
//! implementations back the test suites.

use crate::error::SyncResult;
use async_trait::async_trait;
use lunara_sync_model::{ConflictRecord, EntityKind, SyncableEntity};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// One write in a transactional batch.
#[derive(Debug, Clone)]
pub enum EntityWrite {
    /// Insert or replace an entity.
    Put(SyncableEntity),
    /// Remove an entity.
    Remove {
        /// Entity kind.
        kind: EntityKind,
        /// Entity id.
        id: String,
    },
    /// Materialize a conflict record.
    Conflict(ConflictRecord),
}

/// The local persistent store.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Reads an entity.
    async fn read_entity(
        &self,
        kind: EntityKind,
        id: &str,
    ) -> SyncResult<Option<SyncableEntity>>;

    /// Writes a single entity.
    async fn write_entity(&self, entity: SyncableEntity) -> SyncResult<()>;

    /// Applies a batch of writes transactionally: all of them or none.
    async fn apply(&self, writes: Vec<EntityWrite>) -> SyncResult<()>;

    /// Lists all entities of a kind.
    async fn list_kind(&self, kind: EntityKind) -> SyncResult<Vec<SyncableEntity>>;

    /// Lists unresolved conflict records.
    async fn conflicts(&self) -> SyncResult<Vec<ConflictRecord>>;
}

/// Network reachability oracle.
#[async_trait]
pub trait Connectivity: Send + Sync {
    /// Returns true if the remote store is believed reachable.
    async fn is_reachable(&self) -> bool;
}

/// Identity provider for the signed-in user.
#[async_trait]
pub trait Identity: Send + Sync {
    /// Returns the current user's opaque id.
    async fn current_user_id(&self) -> SyncResult<String>;
}

/// An in-memory local store.
#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    entities: RwLock<HashMap<(EntityKind, String), SyncableEntity>>,
    conflicts: RwLock<Vec<ConflictRecord>>,
}

impl MemoryLocalStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LocalStore for MemoryLocalStore {
    async fn read_entity(
        &self,
        kind: EntityKind,
        id: &str,
    ) -> SyncResult<Option<SyncableEntity>> {
        Ok(self.entities.read().get(&(kind, id.to_string())).cloned())
    }

    async fn write_entity(&self, entity: SyncableEntity) -> SyncResult<()> {
        self.entities
            .write()
            .insert((entity.kind, entity.id.clone()), entity);
        Ok(())
    }

    async fn apply(&self, writes: Vec<EntityWrite>) -> SyncResult<()> {
        // Both maps are locked for the whole batch, so readers observe all
        // of it or none of it.
        let mut entities = self.entities.write();
        let mut conflicts = self.conflicts.write();
        for write in writes {
            match write {
                EntityWrite::Put(entity) => {
                    entities.insert((entity.kind, entity.id.clone()), entity);
                }
                EntityWrite::Remove { kind, id } => {
                    entities.remove(&(kind, id));
                }
                EntityWrite::Conflict(conflict) => conflicts.push(conflict),
            }
        }
        Ok(())
    }

    async fn list_kind(&self, kind: EntityKind) -> SyncResult<Vec<SyncableEntity>> {
        let mut entities: Vec<SyncableEntity> = self
            .entities
            .read()
            .values()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect();
        entities.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entities)
    }

    async fn conflicts(&self) -> SyncResult<Vec<ConflictRecord>> {
        Ok(self.conflicts.read().clone())
    }
}

/// A connectivity oracle with a settable answer.
#[derive(Debug)]
pub struct MockConnectivity {
    reachable: AtomicBool,
}

impl MockConnectivity {
    /// Creates an oracle reporting the given reachability.
    pub fn new(reachable: bool) -> Self {
        Self {
            reachable: AtomicBool::new(reachable),
        }
    }

    /// Updates the reported reachability.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connectivity for MockConnectivity {
    async fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }
}

/// An identity provider returning a fixed user id.
#[derive(Debug)]
pub struct MockIdentity {
    user_id: String,
}

impl MockIdentity {
    /// Creates a provider for the given user id.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }
}

#[async_trait]
impl Identity for MockIdentity {
    async fn current_user_id(&self) -> SyncResult<String> {
        Ok(self.user_id.clone())
    }
}
