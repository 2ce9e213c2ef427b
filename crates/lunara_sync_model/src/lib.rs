//! # Lunara Sync Model
//!
//! Sync data model and conflict resolution for Lunara.
//!
//! This crate provides:
//! - [`SyncableEntity`] and [`RemoteEntity`] for the local and remote shape of a record
//! - [`ChangeRecord`] for one pending local mutation awaiting push
//! - [`Payload`] flat field maps with optional per-field edit timestamps
//! - [`ConflictRecord`] and the pure [`ConflictResolver`]
//!
//! This is a pure model crate with no I/O operations. All timestamp-ordered
//! merge decisions live here so they can be tested without an engine.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change;
mod conflict;
mod entity;
mod payload;

pub use change::{ChangeOp, ChangeRecord};
pub use conflict::{
    ConflictChoice, ConflictRecord, ConflictResolver, MergePolicy, Resolution,
};
pub use entity::{EntityKind, RemoteEntity, SyncStatus, SyncableEntity};
pub use payload::Payload;
