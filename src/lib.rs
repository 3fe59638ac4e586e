// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! # Overview
//!
//! This crate implements the metadata core of a Data Manager (DM) in a
//! distributed object store. Volumes hold blobs; blobs are sparse byte ranges
//! mapped, in units of the volume's maximum object size, onto content-addressed
//! objects that live on storage nodes elsewhere. A DM owns the blob metadata of
//! the volumes placed on it, and keeps it replicated across the volume's group
//! of DMs.
//!
//! The pieces, leaves first:
//!
//!   - [extent]: a blob's offset map is split into bounded-size
//!     [BlobExtent]s. Extent 0 carries the blob's name and metadata plus the
//!     first offset range; extents 1..N carry further ranges.
//!
//!   - [catalog]: one [VolumeCatalogStore] owns the persistent extent records
//!     of every volume on this DM, behind a [CatalogBackend] that offers atomic
//!     batches and point-in-time snapshots. Every commit becomes exactly one
//!     atomic batch.
//!
//!   - [txmgr]: blob mutations arrive as multi-step transactions (start,
//!     updates, commit or abort). The [TransactionManager] stages them and hands
//!     the staged state to the catalog at commit, at most once per transaction.
//!
//!   - [catsync]: when a volume moves between DMs, or a replica fell too far
//!     behind, its catalog is copied in bulk while live commits are forwarded
//!     and buffered behind a stopped "shadow" queue until the baseline lands.
//!
//!   - [volgroup]: a [VolumeGroupHandle] fans commits out to a volume's
//!     replicas, acknowledges only once a quorum applied them, drops replicas
//!     that fail to answer and brings lagging replicas back by commit-log
//!     replay or full catalog copy.
//!
//! The [DataManager] ties these together behind RPC handlers that speak the
//! messages in [messages], carried between DMs by [edelcrantz] connections.
//!
//! ## Ordering
//!
//! Operations on different volumes run fully in parallel. Within a volume,
//! operations that share a transaction id run in order on that transaction's
//! lane, and every commit runs on the volume's single commit lane, which
//! assigns commit ids and applies them to the catalog, the commit log and any
//! migration forwarding in strictly increasing order.
//!
//! ## Caveats
//!
//!  - Durability is whatever the [CatalogBackend] provides. The in-memory
//!    backend is for tests; the [LsmBackend] persists to disk.
//!
//!  - Placement tables are consumed, not computed: some orchestrator tells each
//!    DM about new tables and the DM reacts by migrating or forwarding.

use futures::Future;
use serde::{Deserialize, Serialize};
use std::{fmt::Debug, pin::Pin};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Error {
    #[error("Requested entry not found")]
    NotFound,
    #[error("Volume not found")]
    VolNotFound,
    #[error("Catalog entry not found")]
    CatEntryNotFound,
    #[error("Offset out of the extent's range")]
    OffsetOutOfRange,
    #[error("Transaction id already in use")]
    DuplicateUuid,
    #[error("Volume still holds live blobs")]
    VolNotEmpty,
    #[error("Volume not ready for this operation")]
    NotReady,
    #[error("Volume already exists")]
    VolumeExists,
    #[error("Volume is read-only")]
    ReadOnly,
    #[error("Storage failure: {0}")]
    Storage(String),
    #[error("Corrupt catalog record: {0}")]
    Corrupt(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Replica timed out")]
    ReplicaTimeout,
    #[error("Quorum not met")]
    QuorumNotMet,
    #[error("Volume group is not functional")]
    GroupNotFunctional,
    #[error("Commit id gap")]
    CommitIdGap,
    #[error("Commit log no longer holds the requested range")]
    CommitLogTruncated,
    #[error("Catalog sync not in progress")]
    SyncNotInProgress,
    #[error("Catalog sync already in progress")]
    SyncInProgress,
    #[error("Illegal state transition: {0}")]
    IllegalTransition(String),
    #[error("Networking error")]
    NetworkingError,
    #[error("Unexpected response")]
    UnexpectedResponse,
    #[error("Shutting down")]
    ShuttingDown,
}

impl Error {
    /// Stable wire name of this error, carried in acknowledgments.
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound => "ERR_NOT_FOUND",
            Error::VolNotFound => "ERR_VOL_NOT_FOUND",
            Error::CatEntryNotFound => "ERR_CAT_ENTRY_NOT_FOUND",
            Error::OffsetOutOfRange => "ERR_DM_OFFSET_OUT_RANGE",
            Error::DuplicateUuid => "ERR_DUPLICATE_UUID",
            Error::VolNotEmpty => "ERR_VOL_NOT_EMPTY",
            Error::NotReady => "ERR_NOT_READY",
            Error::VolumeExists => "ERR_VOL_DUPLICATE",
            Error::ReadOnly => "ERR_DM_VOL_READ_ONLY",
            Error::Storage(_) => "ERR_DISK_WRITE_FAILED",
            Error::Corrupt(_) => "ERR_ONDISK_DATA_CORRUPT",
            Error::InvalidConfig(_) => "ERR_INVALID_ARG",
            Error::ReplicaTimeout => "ERR_SVC_REQUEST_TIMEOUT",
            Error::QuorumNotMet => "ERR_DM_QUORUM_NOT_MET",
            Error::GroupNotFunctional => "ERR_VOLUMEGROUP_DOWN",
            Error::CommitIdGap => "ERR_DM_COMMIT_ID_GAP",
            Error::CommitLogTruncated => "ERR_DM_COMMITLOG_TRUNCATED",
            Error::SyncNotInProgress => "ERR_DM_SYNC_NOT_IN_PROGRESS",
            Error::SyncInProgress => "ERR_DM_SYNC_IN_PROGRESS",
            Error::IllegalTransition(_) => "ERR_INVALID_STATE",
            Error::NetworkingError => "ERR_NETWORK",
            Error::UnexpectedResponse => "ERR_UNEXPECTED_RESPONSE",
            Error::ShuttingDown => "ERR_SHUTTING_DOWN",
        }
    }

    /// Not-found class errors leave the choice to synthesize or fail with the
    /// caller.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::NotFound | Error::VolNotFound | Error::CatEntryNotFound
        )
    }
}

impl From<edelcrantz::Error> for Error {
    fn from(_: edelcrantz::Error) -> Self {
        Error::NetworkingError
    }
}

impl From<fjall::Error> for Error {
    fn from(e: fjall::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Corrupt(e.to_string())
    }
}

pub mod backend;
pub mod catalog;
pub mod catsync;
mod commitlog;
mod config;
mod datamgr;
pub mod extent;
mod lsm;
pub mod messages;
pub mod network;
mod placement;
mod qos;
mod quorum;
pub mod txmgr;
mod types;
pub mod volgroup;
mod watermarks;

// As elsewhere in this family of crates, nontrivial async calls are wrapped in
// a boxed future: it costs a heap allocation per call but lets futures recurse,
// be stored in queues and cross task boundaries without naming their types.
//
// The standard BoxFuture isn't used because we want our boxed futures to also
// implement Sync.
pub type SyncBoxFuture<T> = Pin<Box<dyn Future<Output = T> + 'static + Send + Sync>>;

pub use backend::{BatchOp, CatalogBackend, CatalogSnapshot, MemoryBackend};
pub use catalog::{
    AppliedCommit, CatalogRecord, CommitBatch, OffsetUpdate, SnapshotId, VolumeCatalogStore,
};
pub use catsync::{
    CatSyncReceiver, CatSyncSender, DoneCallback, MigrationProgress, ReceiverState,
};
pub use commitlog::{CommitLog, CommitLogEntry};
pub use config::DmConfig;
pub use datamgr::DataManager;
pub use extent::{BlobExtent, BlobMeta, ExtentGeometry, ExtentId, META_EXTENT_ID};
pub use lsm::LsmBackend;
pub use placement::{
    transition, Dmt, DmtMigrationFsm, MigrationAction, MigrationEvent, MigrationState,
    PlacementState,
};
pub use qos::{LaneExecutor, LaneKey, SerialQueue};
pub use quorum::QuorumTracker;
pub use txmgr::{DescUpdate, ObjectCache, StagedBlobDesc, TransactionManager, TxDescriptor};
pub use types::{
    BlobOpType, DmtVersion, ObjectId, SequenceId, ServiceId, TxId, VolumeDesc, VolumeId,
    OBJECT_ID_LEN,
};
pub use volgroup::{GroupTransport, ReplicaPhase, ReplicaState, VolumeGroupHandle, VolumeReplica};
pub use watermarks::{AppliedCommitId, AppliedOpId, VolumeMeta, VolumeWatermarks};
