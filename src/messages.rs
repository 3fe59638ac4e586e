// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Message bodies exchanged with the access layer, the orchestrator and other
//! DMs. They are plain serde structs; [crate::network] wraps them into the
//! request, response and one-way enums that travel on a connection.

use crate::{
    catalog::CatalogRecord, placement::Dmt, BlobMeta, CommitBatch, CommitLogEntry, DmtVersion,
    ObjectId, SequenceId, ServiceId, TxId, VolumeDesc, VolumeId,
};
use serde::{Deserialize, Serialize};

/// `blob_mode` flag: the commit replaces the blob instead of overwriting
/// part of it.
pub const BLOB_MODE_TRUNCATE: u32 = 0x1;

/// Result code of a successful operation in acknowledgments.
pub const ERR_OK: &str = "ERR_OK";

pub type MetaDataList = Vec<(String, String)>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartBlobTxMsg {
    pub volume_id: VolumeId,
    pub blob_name: String,
    pub blob_version: u64,
    pub blob_mode: u32,
    pub tx_id: TxId,
    pub dmt_version: DmtVersion,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectListEntry {
    pub offset: u64,
    pub size: u32,
    pub object_id: ObjectId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateCatalogMsg {
    pub volume_id: VolumeId,
    pub blob_name: String,
    pub tx_id: TxId,
    pub object_list: Vec<ObjectListEntry>,
    /// Object payloads small enough to travel inline.
    #[serde(default)]
    pub payloads: Vec<(ObjectId, Vec<u8>)>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitBlobTxMsg {
    pub volume_id: VolumeId,
    pub blob_name: String,
    pub blob_version: u64,
    pub dmt_version: DmtVersion,
    pub sequence_id: SequenceId,
    pub tx_id: TxId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitBlobTxRspMsg {
    pub blob_version: u64,
    pub meta_data_list: MetaDataList,
    pub byte_count: u64,
}

impl CommitBlobTxRspMsg {
    pub fn from_meta(meta: &BlobMeta) -> CommitBlobTxRspMsg {
        CommitBlobTxRspMsg {
            blob_version: meta.version,
            meta_data_list: meta
                .meta
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            byte_count: meta.size,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortBlobTxMsg {
    pub volume_id: VolumeId,
    pub blob_name: String,
    pub blob_version: u64,
    pub tx_id: TxId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetBlobMetaDataMsg {
    pub volume_id: VolumeId,
    pub blob_name: String,
    pub tx_id: TxId,
    pub meta_data_list: MetaDataList,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteBlobMsg {
    pub volume_id: VolumeId,
    pub blob_name: String,
    pub tx_id: TxId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryCatalogMsg {
    pub volume_id: VolumeId,
    pub blob_name: String,
    pub start_offset: u64,
    pub length: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryCatalogRspMsg {
    pub blob_version: u64,
    pub byte_count: u64,
    pub meta_data_list: MetaDataList,
    pub object_list: Vec<ObjectListEntry>,
}

/// Sent by a group coordinator to each replica before any fan-out. Replicas
/// that have never seen the volume create its catalog from `desc`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenVolumeMsg {
    pub volume_id: VolumeId,
    pub desc: VolumeDesc,
    pub coordinator: ServiceId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenVolumeRspMsg {
    pub replica_version: u64,
    pub applied_op_id: u64,
    pub applied_commit_id: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetVolumeGroupCoordinatorMsg {
    pub volume_id: VolumeId,
    pub coordinator: ServiceId,
    pub version: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetVolumeGroupCoordinatorRspMsg {
    pub version: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullCommitlogEntriesMsg {
    pub volume_id: VolumeId,
    pub start_commit_id: u64,
    pub end_commit_id: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullCommitlogEntriesRspMsg {
    pub entries: Vec<CommitLogEntry>,
}

/// Asks a replica to pull and apply commits it missed from `from`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayCommitsMsg {
    pub volume_id: VolumeId,
    pub from: ServiceId,
    pub start_commit_id: u64,
    pub end_commit_id: u64,
}

/// The non-committing mutations a coordinator replicates.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModifyOp {
    StartTx(StartBlobTxMsg),
    UpdateCatalog(UpdateCatalogMsg),
    SetMetaData(SetBlobMetaDataMsg),
    DeleteBlob(DeleteBlobMsg),
    AbortTx(AbortBlobTxMsg),
}

impl ModifyOp {
    pub fn tx_id(&self) -> TxId {
        match self {
            ModifyOp::StartTx(m) => m.tx_id,
            ModifyOp::UpdateCatalog(m) => m.tx_id,
            ModifyOp::SetMetaData(m) => m.tx_id,
            ModifyOp::DeleteBlob(m) => m.tx_id,
            ModifyOp::AbortTx(m) => m.tx_id,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeGroupModifyMsg {
    pub volume_id: VolumeId,
    pub op_id: u64,
    pub op: ModifyOp,
}

/// A replicated commit. Replicas apply the coordinator's batch, so a replica
/// that missed some staging still commits the same state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeGroupCommitMsg {
    pub volume_id: VolumeId,
    pub op_id: u64,
    pub commit_id: u64,
    pub batch: CommitBatch,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeGroupCommitRspMsg {
    pub applied_commit_id: u64,
    /// `None` when the commit was already applied.
    pub meta: Option<BlobMeta>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CtrlNotifyDmtUpdate {
    pub dmt: Dmt,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CtrlDmtCommit {
    pub version: DmtVersion,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CtrlNotifyDltUpdate {
    pub version: u64,
}

/// Opens a catalog sync: the receiver starts an empty target catalog and a
/// stopped shadow queue.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatSyncStartMsg {
    pub volume_id: VolumeId,
    pub desc: VolumeDesc,
    pub source: ServiceId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatSyncBaselineMsg {
    pub volume_id: VolumeId,
    pub chunk: u64,
    pub records: Vec<CatalogRecord>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatSyncBaselineDoneMsg {
    pub volume_id: VolumeId,
    pub chunks: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardCatalogUpdateMsg {
    pub volume_id: VolumeId,
    pub source: ServiceId,
    pub op_id: u64,
    pub commit_id: u64,
    pub batch: CommitBatch,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatSyncFwdDoneMsg {
    pub volume_id: VolumeId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatSyncAbortMsg {
    pub volume_id: VolumeId,
}

/// Per-update acknowledgment of a forwarded commit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushMetaSyncRespMsg {
    pub volume_id: VolumeId,
    pub blob_name: String,
    pub blob_version: u64,
    pub tx_id: TxId,
    pub commit_id: u64,
    pub result_code: String,
    pub err_msg: String,
}

impl PushMetaSyncRespMsg {
    pub fn is_ok(&self) -> bool {
        self.result_code == ERR_OK
    }
}
