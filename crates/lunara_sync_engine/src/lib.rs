//! # Lunara Sync Engine
//!
//! Offline-first synchronization engine for Lunara.
//!
//! This crate provides:
//! - Change journal of pending local mutations
//! - Per-kind sync cursor store with monotonic advancement
//! - Batched remote gateway abstraction
//! - Retry with exponential backoff and error classification
//! - Sync coordinator state machine with a watch-channel status stream
//!
//! ## Architecture
//!
//! The engine implements a **push-then-pull** synchronization cycle:
//! 1. Drain the change journal to the remote store in batches
//! 2. Pull remote changes since the per-kind cursor
//! 3. Resolve conflicts with the pure resolver from `lunara_sync_model`
//! 4. Write merged results locally and advance the cursor
//!
//! Local writes never wait on the network; the journal absorbs them and a
//! later cycle reconciles.
//!
//! ## Key Invariants
//!
//! - Push always precedes pull within a cycle
//! - At most one cycle runs per user at any time; concurrent triggers
//!   coalesce onto the in-flight cycle
//! - The cursor only advances to timestamps that were actually applied
//! - Journal entries are removed only after the remote store confirms them
//! - Remote upserts are idempotent, keyed by entity id

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod coordinator;
mod cursor;
mod error;
mod gateway;
mod journal;
mod ports;
mod retry;

pub use config::{RetryConfig, SyncConfig};
pub use coordinator::{SyncCoordinator, SyncPhase, SyncReport, SyncTrigger};
pub use cursor::{CursorStore, MemoryCursorStore};
pub use error::{SyncError, SyncResult};
pub use gateway::{MemoryRemote, PullPage, PushItem, PushOutcome, RemoteGateway};
pub use journal::{ChangeJournal, MemoryChangeJournal};
pub use ports::{
    Connectivity, EntityWrite, Identity, LocalStore, MemoryLocalStore, MockConnectivity,
    MockIdentity,
};
pub use retry::retry_with_backoff;
