//! # Agora Core
//!
//! Storage/consistency substrate for the Agora decentralized election
//! platform. Independent nodes produce updates (new questions, votes,
//! comparisons) that must be propagated, durably recorded, and verified
//! without a central server.
//!
//! This crate provides:
//! - **Snapshot & Delta Engine**: full snapshots with per-item hash
//!   manifests, minimal deltas relative to a base manifest
//! - **Sync Orchestrator**: full-vs-delta strategy per dataset, persisted
//!   sync state, recursive materialization of stored objects
//! - **Block Manager**: five rotating purpose-tagged write buffers with
//!   capacity policies and a node registry
//! - **Audit Log & Recovery**: a tamper-evident hash-chained log written
//!   through the buffers, with cross-node chain recovery and prioritized
//!   backup
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       CLIs / services (external)        │
//! ├──────────────┬──────────────────────────┤
//! │ SyncOrchestr.│   AuditLog / Recovery    │
//! ├──────────────┤──────────────────────────┤
//! │ SnapshotEng. │       BlockManager       │
//! ├──────────────┴──────────────────────────┤
//! │        ContentStore (agora-store)       │
//! └─────────────────────────────────────────┘
//! ```
//!
//! All managers are explicit handle objects over an `Arc<ContentStore>`;
//! there is no ambient global state. The core performs no network I/O of
//! its own — peer data arrives through injected collaborator traits.

pub mod blocks;
pub mod chain;
pub(crate) mod cid_serde;
pub mod error;
pub mod recovery;
pub mod snapshot;
pub mod sync;

pub use blocks::{
    BlockConfig, BlockManager, BlocksMetadata, Buffer, BufferPolicy, BufferRole, BufferStatus,
    Entry, PeerEntrySource, Priority, RotationRecord,
};
pub use chain::{verify_blocks, AuditEvent, AuditLog, AuditSink, ChainRecovery, LogBlock};
pub use error::{CoreError, Result};
pub use recovery::{
    BackupEnvelope, CollectedBackup, MultiNodeSyncReport, RecoveredBackup, RecoveryManager,
    RecoveryStatus,
};
pub use snapshot::{
    compute_manifest, DeltaSavings, DeltaUpdate, FullSnapshot, Items, Manifest, SnapshotEngine,
    StoredObject,
};
pub use sync::{SyncOrchestrator, SyncState, SyncStats};

/// Version of the persisted document format
pub const FORMAT_VERSION: &str = "1.0.0";
