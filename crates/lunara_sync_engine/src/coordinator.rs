//! Sync coordinator state machine.

use crate::config::SyncConfig;
use crate::cursor::CursorStore;
use crate::error::{SyncError, SyncResult};
use crate::gateway::{PushItem, PushOutcome, RemoteGateway};
use crate::journal::ChangeJournal;
use crate::ports::{Connectivity, EntityWrite, Identity, LocalStore};
use crate::retry::retry_with_backoff;
use chrono::{DateTime, Utc};
use lunara_sync_model::{
    ChangeOp, ChangeRecord, ConflictRecord, ConflictResolver, EntityKind, RemoteEntity,
    Resolution, SyncStatus, SyncableEntity,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// The phase of the sync state machine.
///
/// Published on a watch channel with latest-value-only semantics: a slow
/// observer sees the current phase, not the history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncPhase {
    /// No cycle in flight.
    Idle,
    /// Draining the change journal to the remote store.
    Pushing,
    /// Pulling remote changes since the cursors.
    Pulling,
    /// Resolving pulled changes against local state.
    Resolving,
    /// Writing merged results and advancing the cursors.
    Advancing,
    /// The cycle finished successfully.
    Complete,
    /// The cycle ended with an error.
    Failed(String),
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncPhase::Idle => write!(f, "idle"),
            SyncPhase::Pushing => write!(f, "pushing"),
            SyncPhase::Pulling => write!(f, "pulling"),
            SyncPhase::Resolving => write!(f, "resolving"),
            SyncPhase::Advancing => write!(f, "advancing"),
            SyncPhase::Complete => write!(f, "complete"),
            SyncPhase::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// What caused a sync cycle to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    /// The user asked for a sync.
    Manual,
    /// A periodic timer fired.
    Scheduled,
    /// Connectivity came back.
    ConnectivityRegained,
}

impl SyncTrigger {
    /// Automatic triggers are gated on reachability; manual ones proceed
    /// and fail gracefully.
    pub fn is_automatic(&self) -> bool {
        !matches!(self, SyncTrigger::Manual)
    }
}

/// Result of a completed sync cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    /// Records confirmed by the remote store.
    pub pushed: u64,
    /// Entities received from the remote store.
    pub pulled: u64,
    /// Entities that went through a field-level merge.
    pub merged: u64,
    /// Conflicts materialized for manual resolution.
    pub conflicts: u64,
    /// Records the remote store rejected.
    pub rejected: u64,
    /// Duration of the cycle.
    pub duration: Duration,
}

type CycleDone = Option<SyncResult<SyncReport>>;

struct InFlight {
    user_id: String,
    done: watch::Receiver<CycleDone>,
}

enum Entry {
    Coalesce(watch::Receiver<CycleDone>),
    Run(watch::Sender<CycleDone>),
}

/// Planned writes for one kind, produced by the resolving phase and applied
/// transactionally by the advancing phase.
struct KindPlan {
    kind: EntityKind,
    writes: Vec<EntityWrite>,
    repush: Vec<ChangeRecord>,
    max_applied: Option<DateTime<Utc>>,
}

impl KindPlan {
    fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            writes: Vec::new(),
            repush: Vec::new(),
            max_applied: None,
        }
    }

    fn note_applied(&mut self, at: DateTime<Utc>) {
        self.max_applied = Some(self.max_applied.map_or(at, |current| current.max(at)));
    }
}

/// Orchestrates full sync cycles against the remote store.
///
/// The coordinator owns the single-flight guarantee: at most one cycle per
/// user at any time, with concurrent triggers coalescing onto the in-flight
/// cycle's completion. It is the sole writer of sync cursors and the sole
/// mutator of entity sync status.
pub struct SyncCoordinator<G, J, C, S> {
    config: SyncConfig,
    gateway: Arc<G>,
    journal: Arc<J>,
    cursors: Arc<C>,
    store: Arc<S>,
    connectivity: Arc<dyn Connectivity>,
    identity: Arc<dyn Identity>,
    resolver: ConflictResolver,
    phase_tx: watch::Sender<SyncPhase>,
    phase_rx: watch::Receiver<SyncPhase>,
    in_flight: Mutex<Option<InFlight>>,
    cancelled: AtomicBool,
}

impl<G, J, C, S> SyncCoordinator<G, J, C, S>
where
    G: RemoteGateway,
    J: ChangeJournal,
    C: CursorStore,
    S: LocalStore,
{
    /// Creates a new coordinator.
    ///
    /// Ports are shared: the app's write path appends to the same journal
    /// the coordinator drains, and reads the same store it advances.
    pub fn new(
        config: SyncConfig,
        gateway: Arc<G>,
        journal: Arc<J>,
        cursors: Arc<C>,
        store: Arc<S>,
        connectivity: Arc<dyn Connectivity>,
        identity: Arc<dyn Identity>,
    ) -> Self {
        let (phase_tx, phase_rx) = watch::channel(SyncPhase::Idle);
        let resolver = ConflictResolver::new(config.merge_policy.clone(), config.device_id);
        Self {
            config,
            gateway,
            journal,
            cursors,
            store,
            connectivity,
            identity,
            resolver,
            phase_tx,
            phase_rx,
            in_flight: Mutex::new(None),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Returns the current phase.
    pub fn phase(&self) -> SyncPhase {
        self.phase_rx.borrow().clone()
    }

    /// Subscribes to phase changes.
    pub fn subscribe(&self) -> watch::Receiver<SyncPhase> {
        self.phase_rx.clone()
    }

    /// Requests cancellation of the in-flight cycle.
    ///
    /// Safe at any point: mid-push, only already-acknowledged journal
    /// entries stay removed; mid-pull, unapplied data is discarded and the
    /// cursors stay put, so the next cycle re-pulls the same range.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Runs a full sync cycle, or joins the one already in flight.
    ///
    /// Automatic triggers are skipped while the device is offline.
    pub async fn trigger(&self, trigger: SyncTrigger) -> SyncResult<SyncReport> {
        if trigger.is_automatic() && !self.connectivity.is_reachable().await {
            debug!(trigger = ?trigger, "offline, automatic sync skipped");
            return Err(SyncError::network_retryable("device is offline"));
        }
        let user_id = self.identity.current_user_id().await?;

        let entry = {
            let mut in_flight = self.in_flight.lock().await;
            match in_flight.as_ref() {
                Some(flight) if flight.user_id == user_id => {
                    debug!(user_id = %user_id, "coalescing onto in-flight cycle");
                    Entry::Coalesce(flight.done.clone())
                }
                Some(flight) => {
                    error!(
                        in_flight_user = %flight.user_id,
                        trigger_user = %user_id,
                        "trigger for a different user while a cycle is in flight"
                    );
                    return Err(SyncError::InvariantViolation(
                        "a sync cycle is already in flight for a different user".into(),
                    ));
                }
                None => {
                    let (done_tx, done_rx) = watch::channel(None);
                    *in_flight = Some(InFlight {
                        user_id: user_id.clone(),
                        done: done_rx,
                    });
                    Entry::Run(done_tx)
                }
            }
        };

        let done_tx = match entry {
            Entry::Coalesce(rx) => return Self::await_in_flight(rx).await,
            Entry::Run(tx) => tx,
        };

        self.cancelled.store(false, Ordering::SeqCst);
        let started = Instant::now();
        info!(user_id = %user_id, trigger = ?trigger, "sync cycle started");

        let mut result = self.run_cycle(&user_id).await;
        if let Ok(report) = result.as_mut() {
            report.duration = started.elapsed();
        }
        match &result {
            Ok(report) => {
                info!(
                    pushed = report.pushed,
                    pulled = report.pulled,
                    merged = report.merged,
                    conflicts = report.conflicts,
                    rejected = report.rejected,
                    "sync cycle complete"
                );
                self.set_phase(SyncPhase::Complete);
            }
            Err(err) => {
                warn!(error = %err, "sync cycle failed");
                self.set_phase(SyncPhase::Failed(err.to_string()));
            }
        }

        let _ = done_tx.send(Some(result.clone()));
        *self.in_flight.lock().await = None;
        self.set_phase(SyncPhase::Idle);
        result
    }

    async fn await_in_flight(mut done: watch::Receiver<CycleDone>) -> SyncResult<SyncReport> {
        loop {
            if let Some(result) = done.borrow().clone() {
                return result;
            }
            if done.changed().await.is_err() {
                return Err(SyncError::Cancelled);
            }
        }
    }

    async fn run_cycle(&self, user_id: &str) -> SyncResult<SyncReport> {
        let mut report = SyncReport::default();

        // Push before pull: local changes must never be overwritten by a
        // pull that has not seen them yet.
        self.set_phase(SyncPhase::Pushing);
        self.push_pending(user_id, &mut report).await?;

        self.set_phase(SyncPhase::Pulling);
        let pulled = self.pull_remote(user_id, &mut report).await?;

        self.set_phase(SyncPhase::Resolving);
        let plans = self.resolve_pulled(pulled, &mut report).await?;

        self.set_phase(SyncPhase::Advancing);
        self.advance(plans).await?;

        Ok(report)
    }

    async fn push_pending(&self, user_id: &str, report: &mut SyncReport) -> SyncResult<()> {
        for kind in EntityKind::ALL {
            self.check_cancelled()?;
            let pending = self.journal.pending(kind).await?;
            if pending.is_empty() {
                continue;
            }
            debug!(kind = %kind, pending = pending.len(), "draining journal");

            for chunk in pending.chunks(self.config.push_batch_size.max(1)) {
                self.check_cancelled()?;
                let (items, skipped) = self.load_push_items(chunk).await?;
                if !skipped.is_empty() {
                    self.journal.acknowledge(&skipped).await?;
                }
                if items.is_empty() {
                    continue;
                }

                let outcomes = retry_with_backoff(&self.config.retry, || {
                    let gateway = Arc::clone(&self.gateway);
                    let user_id = user_id.to_string();
                    let items = items.clone();
                    async move {
                        let outcomes = gateway.push_batch(&user_id, &items).await?;
                        // A chunk is an atomic unit server-side, so one
                        // transiently failing record retries the whole chunk.
                        if let Some(reason) = outcomes.iter().find_map(|o| match o {
                            PushOutcome::Retryable { reason, .. } => Some(reason.clone()),
                            _ => None,
                        }) {
                            return Err(SyncError::network_retryable(reason));
                        }
                        Ok(outcomes)
                    }
                })
                .await?;

                self.apply_push_outcomes(kind, &items, outcomes, report).await?;
            }
        }
        Ok(())
    }

    /// Pairs journal entries with the entity snapshots they push. Entries
    /// whose local row vanished are returned separately for acknowledgment.
    async fn load_push_items(
        &self,
        chunk: &[ChangeRecord],
    ) -> SyncResult<(Vec<PushItem>, Vec<Uuid>)> {
        let mut items = Vec::with_capacity(chunk.len());
        let mut skipped = Vec::new();
        for record in chunk {
            if record.op.is_delete() {
                items.push(PushItem {
                    record: record.clone(),
                    entity: None,
                });
                continue;
            }
            match self.store.read_entity(record.kind, &record.entity_id).await? {
                Some(entity) => items.push(PushItem {
                    record: record.clone(),
                    entity: Some(entity),
                }),
                None => {
                    warn!(
                        entity_id = %record.entity_id,
                        kind = %record.kind,
                        "journal entry without local row, dropping"
                    );
                    skipped.push(record.change_id);
                }
            }
        }
        Ok((items, skipped))
    }

    async fn apply_push_outcomes(
        &self,
        kind: EntityKind,
        items: &[PushItem],
        outcomes: Vec<PushOutcome>,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        let by_id: HashMap<Uuid, &PushItem> =
            items.iter().map(|item| (item.record.change_id, item)).collect();
        let now = Utc::now();
        let mut acked = Vec::new();
        let mut writes = Vec::new();

        for outcome in outcomes {
            let Some(item) = by_id.get(&outcome.change_id()) else {
                warn!(change_id = %outcome.change_id(), "outcome for unknown change record");
                continue;
            };
            match outcome {
                PushOutcome::Committed {
                    change_id,
                    remote_updated_at,
                } => {
                    if item.record.op.is_delete() {
                        writes.push(EntityWrite::Remove {
                            kind,
                            id: item.record.entity_id.clone(),
                        });
                    } else if let Some(entity) = &item.entity {
                        let mut entity = entity.clone();
                        entity.mark_synced(remote_updated_at);
                        writes.push(EntityWrite::Put(entity));
                    }
                    acked.push(change_id);
                    report.pushed += 1;
                }
                PushOutcome::Rejected { change_id, reason } => {
                    // Terminal for this record only; its chunk siblings
                    // committed and the conflict record preserves the data.
                    warn!(
                        entity_id = %item.record.entity_id,
                        reason = %reason,
                        "record rejected by remote store"
                    );
                    let conflict = match &item.entity {
                        Some(entity) => {
                            let mut parked = entity.clone();
                            parked.status = SyncStatus::PendingConflict;
                            let conflict =
                                ConflictRecord::rejected(parked.clone(), reason, now);
                            writes.push(EntityWrite::Put(parked));
                            conflict
                        }
                        None => ConflictRecord {
                            entity_id: item.record.entity_id.clone(),
                            kind,
                            local: None,
                            remote: None,
                            reason: Some(reason),
                            detected_at: now,
                            resolution: None,
                        },
                    };
                    writes.push(EntityWrite::Conflict(conflict));
                    acked.push(change_id);
                    report.rejected += 1;
                    report.conflicts += 1;
                }
                PushOutcome::Retryable { .. } => {
                    // Normally converted to a transport error before this
                    // point; a stray one stays pending for the next cycle.
                }
            }
        }

        // Store first, journal second: if acknowledgment fails the entry is
        // re-pushed later, which the idempotent upsert absorbs. The reverse
        // order could strand a dirty entity with no journal entry.
        if !writes.is_empty() {
            self.store.apply(writes).await?;
        }
        if !acked.is_empty() {
            self.journal.acknowledge(&acked).await?;
        }
        Ok(())
    }

    async fn pull_remote(
        &self,
        user_id: &str,
        report: &mut SyncReport,
    ) -> SyncResult<Vec<(EntityKind, Vec<RemoteEntity>)>> {
        let mut pulled = Vec::new();
        for kind in EntityKind::ALL {
            self.check_cancelled()?;
            let since = self.cursors.get(kind).await?;
            let mut entities = Vec::new();
            let mut page: Option<String> = None;

            loop {
                self.check_cancelled()?;
                let result = retry_with_backoff(&self.config.retry, || {
                    let gateway = Arc::clone(&self.gateway);
                    let user_id = user_id.to_string();
                    let page = page.clone();
                    let limit = self.config.pull_page_size;
                    async move {
                        gateway
                            .pull_since(&user_id, kind, since, page.as_deref(), limit)
                            .await
                    }
                })
                .await?;

                report.pulled += result.entities.len() as u64;
                entities.extend(result.entities);
                match result.next_page {
                    Some(next) => page = Some(next),
                    None => break,
                }
            }

            if !entities.is_empty() {
                debug!(kind = %kind, pulled = entities.len(), since = %since, "pulled remote changes");
                pulled.push((kind, entities));
            }
        }
        Ok(pulled)
    }

    async fn resolve_pulled(
        &self,
        pulled: Vec<(EntityKind, Vec<RemoteEntity>)>,
        report: &mut SyncReport,
    ) -> SyncResult<Vec<KindPlan>> {
        let now = Utc::now();
        let mut plans = Vec::with_capacity(pulled.len());

        for (kind, entities) in pulled {
            self.check_cancelled()?;
            let mut plan = KindPlan::new(kind);

            for remote in entities {
                let applied_at = remote.remote_updated_at;
                match self.store.read_entity(kind, &remote.id).await? {
                    None => {
                        // No local counterpart: remote wins trivially.
                        if !remote.deleted {
                            plan.writes
                                .push(EntityWrite::Put(SyncableEntity::from_remote(&remote)));
                        }
                        plan.note_applied(applied_at);
                    }
                    Some(local) => {
                        match self.resolver.resolve(&local, &remote, now) {
                            Resolution::RemoteWins(entity) => {
                                if entity.status == SyncStatus::Deleted {
                                    plan.writes.push(EntityWrite::Remove {
                                        kind,
                                        id: entity.id,
                                    });
                                } else {
                                    plan.writes.push(EntityWrite::Put(entity));
                                }
                            }
                            Resolution::LocalWins(local) => {
                                // The remote version is superseded; journal a
                                // re-push so the next push phase uploads it.
                                plan.repush.push(ChangeRecord::new(
                                    local.id.clone(),
                                    kind,
                                    if local.status == SyncStatus::Deleted {
                                        ChangeOp::Delete
                                    } else {
                                        ChangeOp::Update
                                    },
                                    local.local_updated_at,
                                    self.config.device_id,
                                ));
                            }
                            Resolution::Merged(entity) => {
                                report.merged += 1;
                                plan.repush.push(ChangeRecord::new(
                                    entity.id.clone(),
                                    kind,
                                    ChangeOp::Update,
                                    entity.local_updated_at,
                                    self.config.device_id,
                                ));
                                plan.writes.push(EntityWrite::Put(entity));
                            }
                            Resolution::Manual(conflict) => {
                                report.conflicts += 1;
                                debug!(entity_id = %conflict.entity_id, "conflict requires manual resolution");
                                if let Some(parked) = &conflict.local {
                                    let mut parked = parked.clone();
                                    parked.status = SyncStatus::PendingConflict;
                                    plan.writes.push(EntityWrite::Put(parked));
                                }
                                plan.writes.push(EntityWrite::Conflict(conflict));
                            }
                        }
                        // Observed and accounted for, whichever side won:
                        // the conflict record preserves a losing remote.
                        plan.note_applied(applied_at);
                    }
                }
            }
            plans.push(plan);
        }
        Ok(plans)
    }

    async fn advance(&self, plans: Vec<KindPlan>) -> SyncResult<()> {
        for plan in plans {
            self.check_cancelled()?;
            if !plan.writes.is_empty() {
                self.store.apply(plan.writes).await?;
            }
            for record in plan.repush {
                self.journal.append(record).await?;
            }
            if let Some(applied) = plan.max_applied {
                let current = self.cursors.get(plan.kind).await?;
                if applied > current {
                    self.cursors.advance(plan.kind, applied).await?;
                }
            }
        }
        Ok(())
    }

    fn set_phase(&self, phase: SyncPhase) {
        debug!(phase = %phase, "sync phase");
        let _ = self.phase_tx.send(phase);
    }

    fn check_cancelled(&self) -> SyncResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }
}
