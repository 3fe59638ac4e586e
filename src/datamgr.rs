// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{
    catsync::DoneCallback,
    messages::{
        AbortBlobTxMsg, CatSyncAbortMsg, CatSyncBaselineDoneMsg, CatSyncBaselineMsg,
        CatSyncFwdDoneMsg, CatSyncStartMsg, CommitBlobTxMsg, CommitBlobTxRspMsg, CtrlDmtCommit,
        CtrlNotifyDltUpdate, CtrlNotifyDmtUpdate, DeleteBlobMsg, ForwardCatalogUpdateMsg,
        ModifyOp, ObjectListEntry, OpenVolumeMsg, OpenVolumeRspMsg, PullCommitlogEntriesMsg,
        PullCommitlogEntriesRspMsg, PushMetaSyncRespMsg, QueryCatalogMsg, QueryCatalogRspMsg,
        ReplayCommitsMsg, SetBlobMetaDataMsg, SetVolumeGroupCoordinatorMsg,
        SetVolumeGroupCoordinatorRspMsg, StartBlobTxMsg, UpdateCatalogMsg, VolumeGroupCommitMsg,
        VolumeGroupCommitRspMsg, VolumeGroupModifyMsg, BLOB_MODE_TRUNCATE, ERR_OK,
    },
    network::{self, OneWay, Req, Res},
    volgroup::{ReplicaPhase, VolumeReplica},
    BlobMeta, BlobOpType, CatSyncReceiver, CatSyncSender, CommitBatch, CommitLogEntry,
    DescUpdate, DmConfig, Dmt, DmtVersion, Error, GroupTransport, LaneExecutor, LaneKey,
    MigrationEvent, MigrationProgress, ObjectCache, ObjectId, OffsetUpdate, PlacementState,
    ReceiverState, ReplicaState, ServiceId, SnapshotId, SyncBoxFuture, TransactionManager,
    VolumeCatalogStore, VolumeDesc, VolumeGroupHandle, VolumeId,
};
use async_std::{
    sync::{Arc, Mutex, RwLock},
    task,
};
use futures::Future;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, error, info, instrument, trace, warn};

/// One Data Manager. Clients construct it over a [VolumeCatalogStore], connect
/// it to its peers and call [DataManager::launch_workers]; after that it
/// serves the access layer, its volume groups, catalog syncs and placement
/// updates over those connections.
///
/// Clones share all state.
#[derive(Clone)]
pub struct DataManager {
    pub self_id: ServiceId,

    pub(crate) config: Arc<DmConfig>,

    pub(crate) catalog: Arc<VolumeCatalogStore>,

    pub(crate) txmgr: TransactionManager,

    // Orders operations of one transaction, and all commits of one volume.
    pub(crate) lanes: LaneExecutor,

    pub(crate) placement: Arc<RwLock<PlacementState>>,

    /// This DM's state as a replica of each volume it holds.
    pub(crate) replicas: Arc<RwLock<HashMap<VolumeId, Arc<Mutex<VolumeReplica>>>>>,

    /// Groups this DM coordinates.
    pub(crate) groups: Arc<RwLock<HashMap<VolumeId, VolumeGroupHandle>>>,

    pub(crate) receiver: CatSyncReceiver,
    pub(crate) sender: CatSyncSender,

    pub(crate) object_cache: Arc<Mutex<ObjectCache>>,

    /// The map of network connections, served by network service loops.
    pub(crate) connections: Arc<RwLock<BTreeMap<ServiceId, network::Connection>>>,
}

impl GroupTransport for DataManager {
    fn send_req(&self, to: ServiceId, req: Req) -> SyncBoxFuture<Result<Res, Error>> {
        self.request(to, req)
    }
}

impl DataManager {
    pub fn new(self_id: ServiceId, catalog: VolumeCatalogStore) -> DataManager {
        let config = catalog.config().clone();
        DataManager {
            self_id,
            txmgr: TransactionManager::new(config.max_staged_entries),
            lanes: LaneExecutor::new(),
            placement: Arc::new(RwLock::new(PlacementState::new(Dmt::new(DmtVersion(0))))),
            replicas: Arc::new(RwLock::new(HashMap::new())),
            groups: Arc::new(RwLock::new(HashMap::new())),
            receiver: CatSyncReceiver::new(),
            sender: CatSyncSender::new(self_id),
            object_cache: Arc::new(Mutex::new(ObjectCache::new(config.object_cache_entries))),
            connections: Arc::new(RwLock::new(BTreeMap::new())),
            catalog: Arc::new(catalog),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &DmConfig {
        &self.config
    }

    pub fn catalog(&self) -> &VolumeCatalogStore {
        &self.catalog
    }

    pub fn txmgr(&self) -> &TransactionManager {
        &self.txmgr
    }

    pub async fn cached_object(&self, object_id: &ObjectId) -> Option<Vec<u8>> {
        self.object_cache
            .lock()
            .await
            .get(object_id)
            .map(|p| p.to_vec())
    }

    pub async fn current_dmt_version(&self) -> DmtVersion {
        self.placement.read().await.current_dmt_version()
    }

    /// `(applied_op_id, applied_commit_id)` of this DM's replica of `vol`.
    pub async fn replica_watermarks(&self, vol: VolumeId) -> Option<(u64, u64)> {
        let r = self.replicas.read().await.get(&vol).cloned()?;
        let r = r.lock().await;
        Some((r.applied_op_id(), r.applied_commit_id()))
    }

    pub async fn group(&self, vol: VolumeId) -> Result<VolumeGroupHandle, Error> {
        self.groups
            .read()
            .await
            .get(&vol)
            .cloned()
            .ok_or(Error::VolNotFound)
    }

    async fn replica(&self, vol: VolumeId) -> Result<Arc<Mutex<VolumeReplica>>, Error> {
        self.replicas
            .read()
            .await
            .get(&vol)
            .cloned()
            .ok_or(Error::VolNotFound)
    }

    // Runs `job` on one of `vol`'s ordered lanes.
    async fn on_lane<T, F>(&self, vol: VolumeId, key: LaneKey, job: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, Error>> + Send + Sync + 'static,
    {
        self.lanes.submit(vol, key, job).await?
    }

    // A volume whose catalog is still arriving serves nothing.
    async fn check_serving(&self, vol: VolumeId) -> Result<(), Error> {
        if self.receiver.is_receiving(vol).await {
            debug!("{:?} is receiving its catalog", vol);
            return Err(Error::NotReady);
        }
        Ok(())
    }

    /// Makes this DM the coordinator of `desc`'s volume group over `replicas`
    /// (this DM included) and opens the group. Replicas found behind the
    /// newest commit are resynced in the background.
    pub async fn open_volume_group(
        &self,
        desc: VolumeDesc,
        replicas: Vec<ServiceId>,
    ) -> Result<u64, Error> {
        let vol = desc.volume_id;
        let group = VolumeGroupHandle::new(
            vol,
            self.self_id,
            replicas,
            self.config.replica_timeout,
            Arc::new(self.clone()),
        );
        let version = group
            .open(OpenVolumeMsg {
                volume_id: vol,
                desc,
                coordinator: self.self_id,
            })
            .await?;
        self.groups.write().await.insert(vol, group.clone());
        for r in group.replicas().await {
            if group.replica_state(r).await == Some(ReplicaState::Syncing) {
                let this = self.clone();
                task::spawn(async move {
                    if let Err(e) = this.resync_group_replica(vol, r).await {
                        warn!("resync of {:?} replica {:?} failed: {}", vol, r, e);
                    }
                });
            }
        }
        Ok(version)
    }

    // Rejects transactions that began under a pending table which moves the
    // volume away from here; they belong to the new owner.
    async fn check_tx_routing(&self, vol: VolumeId, dmt_version: DmtVersion) -> Result<(), Error> {
        let placement = self.placement.read().await;
        match placement.target() {
            Some(t) if dmt_version >= t.version && !t.hosts(vol, self.self_id) => {
                debug!("{:?} tx under {:?} belongs elsewhere", vol, dmt_version);
                Err(Error::NotReady)
            }
            _ => Ok(()),
        }
    }

    #[instrument(skip(self, m), fields(vol = ?m.volume_id, tx = ?m.tx_id))]
    pub(crate) async fn start_blob_tx(&self, m: StartBlobTxMsg) -> Result<(), Error> {
        let vol = m.volume_id;
        self.check_serving(vol).await?;
        self.check_tx_routing(vol, m.dmt_version).await?;
        let group = self.group(vol).await?;
        let tx = m.tx_id;
        let res = self
            .on_lane(vol, LaneKey::Tx(tx), group.send_modify_msg(ModifyOp::StartTx(m)))
            .await;
        match &res {
            // The lane belongs to the live transaction of that id.
            Ok(()) | Err(Error::DuplicateUuid) => (),
            Err(_) => self.lanes.retire(vol, LaneKey::Tx(tx)).await,
        }
        res
    }

    // Every entry must route to an extent and end within the u64 offset space.
    fn check_object_list(&self, vol: VolumeId, list: &[ObjectListEntry]) -> Result<(), Error> {
        let g = self.catalog.geometry(vol)?;
        for e in list {
            g.extent_for_offset(e.offset)?;
            if e.offset.checked_add(u64::from(e.size)).is_none() {
                return Err(Error::OffsetOutOfRange);
            }
        }
        Ok(())
    }

    #[instrument(skip(self, m), fields(vol = ?m.volume_id, tx = ?m.tx_id))]
    pub(crate) async fn update_catalog(&self, m: UpdateCatalogMsg) -> Result<(), Error> {
        let vol = m.volume_id;
        self.check_serving(vol).await?;
        let group = self.group(vol).await?;
        self.check_object_list(vol, &m.object_list)?;
        let tx = m.tx_id;
        self.on_lane(
            vol,
            LaneKey::Tx(tx),
            group.send_modify_msg(ModifyOp::UpdateCatalog(m)),
        )
        .await
    }

    #[instrument(skip(self, m), fields(vol = ?m.volume_id, tx = ?m.tx_id))]
    pub(crate) async fn set_blob_meta_data(&self, m: SetBlobMetaDataMsg) -> Result<(), Error> {
        let vol = m.volume_id;
        self.check_serving(vol).await?;
        let group = self.group(vol).await?;
        let tx = m.tx_id;
        self.on_lane(vol, LaneKey::Tx(tx), group.send_modify_msg(ModifyOp::SetMetaData(m)))
            .await
    }

    #[instrument(skip(self, m), fields(vol = ?m.volume_id, tx = ?m.tx_id))]
    pub(crate) async fn delete_blob(&self, m: DeleteBlobMsg) -> Result<(), Error> {
        let vol = m.volume_id;
        self.check_serving(vol).await?;
        let group = self.group(vol).await?;
        let tx = m.tx_id;
        self.on_lane(vol, LaneKey::Tx(tx), group.send_modify_msg(ModifyOp::DeleteBlob(m)))
            .await
    }

    #[instrument(skip(self, m), fields(vol = ?m.volume_id, tx = ?m.tx_id))]
    pub(crate) async fn abort_blob_tx(&self, m: AbortBlobTxMsg) -> Result<(), Error> {
        let vol = m.volume_id;
        self.check_serving(vol).await?;
        let group = self.group(vol).await?;
        let tx = m.tx_id;
        let res = self
            .on_lane(vol, LaneKey::Tx(tx), group.send_modify_msg(ModifyOp::AbortTx(m)))
            .await;
        self.lanes.retire(vol, LaneKey::Tx(tx)).await;
        res
    }

    /// Commits a transaction through the volume group. The transaction is
    /// taken out of this DM's transaction map first, so it commits at most
    /// once however many times it is asked to.
    #[instrument(skip(self, m), fields(vol = ?m.volume_id, tx = ?m.tx_id))]
    pub(crate) async fn commit_blob_tx(
        &self,
        m: CommitBlobTxMsg,
    ) -> Result<CommitBlobTxRspMsg, Error> {
        let vol = m.volume_id;
        self.check_serving(vol).await?;
        self.group(vol).await?;
        let tx_id = m.tx_id;
        let txmgr = self.txmgr.clone();
        let tx = self
            .on_lane(vol, LaneKey::Tx(tx_id), async move {
                txmgr.remove_tx(tx_id).await
            })
            .await;
        self.lanes.retire(vol, LaneKey::Tx(tx_id)).await;
        let tx = tx?;
        let dmt_version = tx.origin_dmt_version;
        let (batch, objects) = tx.into_commit(m.sequence_id);

        let this = self.clone();
        let meta = self
            .on_lane(vol, LaneKey::Commit, async move {
                this.commit_on_lane(vol, dmt_version, batch).await
            })
            .await?;

        let mut cache = self.object_cache.lock().await;
        for (oid, payload) in objects {
            cache.insert(oid, payload);
        }
        Ok(CommitBlobTxRspMsg::from_meta(&meta))
    }

    // The group is looked up here, on the commit lane, so that a volume
    // released by a finished migration takes no further commits.
    async fn commit_on_lane(
        &self,
        vol: VolumeId,
        dmt_version: DmtVersion,
        batch: CommitBatch,
    ) -> Result<BlobMeta, Error> {
        let group = self.group(vol).await?;
        let (commit_id, op_id, meta) = group.send_commit_msg(batch.clone()).await?;
        let fwd = self
            .placement
            .read()
            .await
            .forward_target(vol, dmt_version);
        if fwd.is_some() {
            self.forward_commit(vol, op_id, commit_id, &batch).await;
        }
        Ok(meta)
    }

    // Best effort: the client's commit already succeeded and must not fail
    // on account of the forward.
    async fn forward_commit(&self, vol: VolumeId, op_id: u64, commit_id: u64, batch: &CommitBatch) {
        if let Some((dest, msg)) = self.sender.on_commit(vol, op_id, commit_id, batch).await {
            trace!("forwarding {:?} commit {} to {:?}", vol, commit_id, dest);
            if let Err(e) = self
                .send_oneway(dest, OneWay::ForwardCatalogUpdate(msg))
                .await
            {
                warn!(
                    "forward of {:?} commit {} to {:?} failed: {}",
                    vol, commit_id, dest, e
                );
                self.sender.on_send_failed(vol, commit_id, e).await;
            }
        }
    }

    #[instrument(skip(self, m), fields(vol = ?m.volume_id))]
    pub(crate) async fn query_catalog(&self, m: QueryCatalogMsg) -> Result<QueryCatalogRspMsg, Error> {
        self.check_serving(m.volume_id).await?;
        let group = self.group(m.volume_id).await?;
        group.send_read_msg(m).await
    }

    /// Serves a read from this DM's own catalog. A zero length reads to the
    /// end of the blob.
    pub(crate) fn read_catalog_local(&self, m: &QueryCatalogMsg) -> Result<QueryCatalogRspMsg, Error> {
        let vol = m.volume_id;
        let meta = self.catalog.get_blob_desc(vol, &m.blob_name)?;
        let unit = u64::from(self.catalog.geometry(vol)?.offset_unit_bytes);
        let len = if m.length == 0 {
            meta.size.saturating_sub(m.start_offset)
        } else {
            m.length
        };
        let object_list = self
            .catalog
            .get_blob_offsets(vol, &m.blob_name, m.start_offset, len)?
            .into_iter()
            .map(|(offset, object_id)| ObjectListEntry {
                offset,
                size: unit.min(meta.size.saturating_sub(offset)) as u32,
                object_id,
            })
            .collect();
        Ok(QueryCatalogRspMsg {
            blob_version: meta.version,
            byte_count: meta.size,
            meta_data_list: meta.meta.into_iter().collect(),
            object_list,
        })
    }

    // Replica side of a volume group.

    fn open_rsp(r: &VolumeReplica) -> OpenVolumeRspMsg {
        OpenVolumeRspMsg {
            replica_version: r.version(),
            applied_op_id: r.applied_op_id(),
            applied_commit_id: r.applied_commit_id(),
        }
    }

    /// Opens (creating if needed) this DM's replica of a volume and reports
    /// its watermarks. Opening an open replica only reports.
    #[instrument(skip(self, m), fields(vol = ?m.volume_id))]
    pub(crate) async fn open_volume(&self, m: OpenVolumeMsg) -> Result<OpenVolumeRspMsg, Error> {
        let vol = m.volume_id;
        self.check_serving(vol).await?;
        if let Ok(r) = self.replica(vol).await {
            return Ok(Self::open_rsp(&*r.lock().await));
        }
        match self.catalog.open_catalog(vol) {
            Err(Error::VolNotFound) => {
                self.catalog.create_catalog(&m.desc)?;
                self.catalog.open_catalog(vol)?;
            }
            other => other?,
        }
        let mut r = VolumeReplica::new(
            self.catalog.get_volume_meta(vol)?,
            self.config.commit_log_retention,
        );
        r.set_phase(ReplicaPhase::Functional);
        let rsp = Self::open_rsp(&r);
        self.replicas
            .write()
            .await
            .entry(vol)
            .or_insert_with(|| Arc::new(Mutex::new(r)));
        info!("{:?} opened replica of {:?} for {:?}", self.self_id, vol, m.coordinator);
        Ok(rsp)
    }

    pub(crate) async fn set_coordinator(
        &self,
        m: SetVolumeGroupCoordinatorMsg,
    ) -> Result<SetVolumeGroupCoordinatorRspMsg, Error> {
        let r = self.replica(m.volume_id).await?;
        let version = r.lock().await.set_coordinator(m.coordinator, m.version)?;
        debug!(
            "{:?} coordinator of {:?} is {:?} v{}",
            self.self_id, m.volume_id, m.coordinator, version
        );
        Ok(SetVolumeGroupCoordinatorRspMsg { version })
    }

    pub(crate) async fn apply_group_modify(&self, m: VolumeGroupModifyMsg) -> Result<(), Error> {
        let vol = m.volume_id;
        let replica = self.replica(vol).await?;
        match m.op {
            ModifyOp::StartTx(s) => {
                self.txmgr
                    .add_tx(vol, s.tx_id, s.dmt_version, &s.blob_name)
                    .await?;
                if s.blob_mode & BLOB_MODE_TRUNCATE != 0 {
                    self.txmgr
                        .update_staged_blob_desc(s.tx_id, DescUpdate::Truncate)
                        .await?;
                }
            }
            ModifyOp::UpdateCatalog(u) => {
                self.check_object_list(vol, &u.object_list)?;
                for e in u.object_list {
                    self.txmgr
                        .update_staged_blob_offset(
                            u.tx_id,
                            &u.blob_name,
                            OffsetUpdate {
                                offset: e.offset,
                                size: e.size,
                                object_id: e.object_id,
                            },
                        )
                        .await?;
                }
                for (oid, payload) in u.payloads {
                    self.txmgr
                        .update_staged_blob_object(u.tx_id, oid, payload)
                        .await?;
                }
            }
            ModifyOp::SetMetaData(s) => {
                self.txmgr
                    .update_staged_blob_desc(s.tx_id, DescUpdate::MetaList(s.meta_data_list))
                    .await?
            }
            ModifyOp::DeleteBlob(d) => {
                self.txmgr
                    .update_tx_op_type(d.tx_id, BlobOpType::Delete)
                    .await?
            }
            ModifyOp::AbortTx(a) => {
                // Staged payloads are dropped with the descriptor.
                self.txmgr.remove_tx(a.tx_id).await?;
                debug!("{:?} aborted {:?}", self.self_id, a.tx_id);
            }
        }
        replica.lock().await.note_op(m.op_id);
        Ok(())
    }

    // Applies one commit to a replica whose lock the caller holds. `None`
    // means the commit was applied before.
    fn apply_commit_locked(
        &self,
        r: &mut VolumeReplica,
        vol: VolumeId,
        op_id: u64,
        commit_id: u64,
        batch: &CommitBatch,
    ) -> Result<Option<BlobMeta>, Error> {
        if !r.check_commit(commit_id)? {
            trace!("{:?} commit {} already applied", vol, commit_id);
            return Ok(None);
        }
        let vm = r.next_meta(op_id, commit_id);
        let applied = self.catalog.apply_blob_commit(vol, batch, Some(&vm))?;
        if !applied.expunged.is_empty() {
            debug!(
                "{:?} commit {} released {} objects",
                vol,
                commit_id,
                applied.expunged.len()
            );
        }
        r.record_commit(
            vm,
            CommitLogEntry {
                commit_id,
                op_id,
                batch: batch.clone(),
            },
        );
        Ok(Some(applied.meta))
    }

    pub(crate) async fn apply_group_commit(
        &self,
        m: VolumeGroupCommitMsg,
    ) -> Result<VolumeGroupCommitRspMsg, Error> {
        let vol = m.volume_id;
        let replica = self.replica(vol).await?;
        let mut r = replica.lock().await;
        // The coordinator's batch is authoritative; whatever this replica
        // staged for the transaction only contributes object payloads.
        let staged = self.txmgr.remove_tx(m.batch.tx_id).await.ok();
        let meta = self.apply_commit_locked(&mut r, vol, m.op_id, m.commit_id, &m.batch)?;
        if let Some(tx) = staged {
            let (_, objects) = tx.into_commit(m.batch.sequence_id);
            let mut cache = self.object_cache.lock().await;
            for (oid, payload) in objects {
                cache.insert(oid, payload);
            }
        }
        Ok(VolumeGroupCommitRspMsg {
            applied_commit_id: r.applied_commit_id(),
            meta,
        })
    }

    pub(crate) async fn pull_commitlog(
        &self,
        m: PullCommitlogEntriesMsg,
    ) -> Result<PullCommitlogEntriesRspMsg, Error> {
        let r = self.replica(m.volume_id).await?;
        let entries = r.lock().await.pull(m.start_commit_id, m.end_commit_id)?;
        Ok(PullCommitlogEntriesRspMsg { entries })
    }

    /// Pulls commits this replica missed from `m.from` and applies them.
    #[instrument(skip(self, m), fields(vol = ?m.volume_id))]
    pub(crate) async fn replay_commits(&self, m: ReplayCommitsMsg) -> Result<(), Error> {
        let vol = m.volume_id;
        let replica = self.replica(vol).await?;
        let rsp = self
            .call_peer(
                m.from,
                Req::PullCommitlog(PullCommitlogEntriesMsg {
                    volume_id: vol,
                    start_commit_id: m.start_commit_id,
                    end_commit_id: m.end_commit_id,
                }),
            )
            .await?
            .into_pull_commitlog()?;
        let mut r = replica.lock().await;
        r.set_phase(ReplicaPhase::Syncing);
        for e in rsp.entries.iter() {
            self.apply_commit_locked(&mut r, vol, e.op_id, e.commit_id, &e.batch)?;
        }
        r.set_phase(ReplicaPhase::Functional);
        debug!(
            "{:?} replayed {} commits of {:?}, now at {}",
            self.self_id,
            rsp.entries.len(),
            vol,
            r.applied_commit_id()
        );
        Ok(())
    }

    // Catalog sync, receiving side.

    fn install_synced_replica(&self) -> DoneCallback {
        let this = self.clone();
        Box::new(move |vol: VolumeId| -> SyncBoxFuture<()> {
            Box::pin(async move {
                match this.catalog.get_volume_meta(vol) {
                    Ok(vm) => {
                        let mut r = VolumeReplica::new(vm, this.config.commit_log_retention);
                        r.set_phase(ReplicaPhase::Functional);
                        this.replicas
                            .write()
                            .await
                            .insert(vol, Arc::new(Mutex::new(r)));
                    }
                    Err(e) => error!("{:?} synced catalog unreadable: {}", vol, e),
                }
            })
        })
    }

    async fn expect_receiving(&self, vol: VolumeId, state: ReceiverState) -> Result<(), Error> {
        match self.receiver.state(vol).await {
            Some(s) if s == state => Ok(()),
            Some(s) => Err(Error::IllegalTransition(format!(
                "{:?} sync in {:?}, expected {:?}",
                vol, s, state
            ))),
            None => Err(Error::SyncNotInProgress),
        }
    }

    #[instrument(skip(self, m), fields(vol = ?m.volume_id))]
    pub(crate) async fn cat_sync_start(&self, m: CatSyncStartMsg) -> Result<(), Error> {
        let vol = m.volume_id;
        self.receiver
            .start_recv_volmeta(vol, self.install_synced_replica())
            .await?;
        // Whatever this DM held of the volume is replaced.
        self.replicas.write().await.remove(&vol);
        if let Err(e) = self.catalog.create_sync_target(&m.desc) {
            error!("{:?} cannot start sync target: {}", vol, e);
            if let Err(e) = self.receiver.abort(vol).await {
                warn!("{:?} sync receiver abort failed: {}", vol, e);
            }
            return Err(e);
        }
        info!("{:?} receiving {:?} from {:?}", self.self_id, vol, m.source);
        Ok(())
    }

    pub(crate) async fn cat_sync_baseline(&self, m: CatSyncBaselineMsg) -> Result<(), Error> {
        self.expect_receiving(m.volume_id, ReceiverState::Syncing)
            .await?;
        trace!(
            "{:?} baseline chunk {} ({} records)",
            m.volume_id,
            m.chunk,
            m.records.len()
        );
        self.catalog.import_records(m.volume_id, m.records)
    }

    pub(crate) async fn cat_sync_baseline_done(
        &self,
        m: CatSyncBaselineDoneMsg,
    ) -> Result<(), Error> {
        let vol = m.volume_id;
        self.expect_receiving(vol, ReceiverState::Syncing).await?;
        self.catalog.activate_catalog(vol)?;
        debug!("{:?} baseline of {} chunks in place", vol, m.chunks);
        self.receiver.start_process_fwd_updates(vol).await
    }

    pub(crate) async fn cat_sync_fwd_done(&self, m: CatSyncFwdDoneMsg) -> Result<(), Error> {
        self.receiver.handle_fwd_done(m.volume_id).await
    }

    pub(crate) async fn cat_sync_abort(&self, m: CatSyncAbortMsg) -> Result<(), Error> {
        let vol = m.volume_id;
        self.receiver.abort(vol).await?;
        self.replicas.write().await.remove(&vol);
        self.catalog.discard_catalog(vol)
    }

    // Applies a forwarded commit straight to the catalog; the receiving
    // side has no replica of the volume until the sync completes.
    fn apply_forwarded(&self, msg: &ForwardCatalogUpdateMsg) -> Result<Option<BlobMeta>, Error> {
        let vol = msg.volume_id;
        let vm = self.catalog.get_volume_meta(vol)?;
        let applied = vm.watermarks.applied_commit_id.0;
        if msg.commit_id <= applied {
            trace!("{:?} forwarded commit {} already in baseline", vol, msg.commit_id);
            return Ok(None);
        }
        if msg.commit_id != applied + 1 {
            return Err(Error::CommitIdGap);
        }
        let mut next = vm;
        next.watermarks.advance_commit(msg.op_id, msg.commit_id);
        Ok(Some(
            self.catalog
                .apply_blob_commit(vol, &msg.batch, Some(&next))?
                .meta,
        ))
    }

    async fn ack_forward(&self, msg: &ForwardCatalogUpdateMsg, res: Result<Option<BlobMeta>, Error>) {
        let (blob_version, result_code, err_msg) = match &res {
            Ok(meta) => (
                meta.as_ref().map_or(0, |m| m.version),
                ERR_OK.to_string(),
                String::new(),
            ),
            Err(e) => (0, e.code().to_string(), e.to_string()),
        };
        let ack = PushMetaSyncRespMsg {
            volume_id: msg.volume_id,
            blob_name: msg.batch.blob_name.clone(),
            blob_version,
            tx_id: msg.batch.tx_id,
            commit_id: msg.commit_id,
            result_code,
            err_msg,
        };
        if let Err(e) = self
            .send_oneway(msg.source, OneWay::PushMetaSyncResp(ack))
            .await
        {
            warn!(
                "ack of {:?} commit {} to {:?} lost: {}",
                msg.volume_id, msg.commit_id, msg.source, e
            );
        }
    }

    /// Queues a forwarded commit on the volume's shadow queue; it is applied
    /// and acknowledged once everything forwarded before it was.
    pub(crate) async fn handle_forwarded_update(&self, msg: ForwardCatalogUpdateMsg) {
        let vol = msg.volume_id;
        let this = self.clone();
        let job_msg = msg.clone();
        let job = async move {
            let res = this.apply_forwarded(&job_msg);
            if let Err(e) = &res {
                error!("{:?} forwarded commit {} failed: {}", vol, job_msg.commit_id, e);
            }
            this.ack_forward(&job_msg, res).await;
        };
        if let Err(e) = self.receiver.try_enqueue_fwd_update(vol, job).await {
            warn!("{:?} refused forwarded commit {}: {}", vol, msg.commit_id, e);
            self.ack_forward(&msg, Err(e)).await;
        }
    }

    // Catalog sync, sending side.

    async fn send_baseline(
        &self,
        vol: VolumeId,
        dest: ServiceId,
        snap: SnapshotId,
        progress: &MigrationProgress,
    ) -> Result<(), Error> {
        let records = self.catalog.export_records(vol, snap)?;
        let mut chunks = 0u64;
        for chunk in records.chunks(self.config.sync_batch_entries.max(1)) {
            progress.record_sent();
            self.call_peer(
                dest,
                Req::CatSyncBaseline(CatSyncBaselineMsg {
                    volume_id: vol,
                    chunk: chunks,
                    records: chunk.to_vec(),
                }),
            )
            .await?
            .into_ack()?;
            progress.record_done();
            chunks += 1;
        }
        self.call_peer(
            dest,
            Req::CatSyncBaselineDone(CatSyncBaselineDoneMsg {
                volume_id: vol,
                chunks,
            }),
        )
        .await?
        .into_ack()?;
        debug!(
            "{:?} baseline of {} records in {} chunks sent to {:?}",
            vol,
            records.len(),
            chunks,
            dest
        );
        Ok(())
    }

    async fn start_catalog_push(&self, vol: VolumeId, dest: ServiceId) -> Result<(), Error> {
        let desc = self.catalog.get_volume_meta(vol)?.desc;
        self.call_peer(
            dest,
            Req::CatSyncStart(CatSyncStartMsg {
                volume_id: vol,
                desc,
                source: self.self_id,
            }),
        )
        .await?
        .into_ack()
    }

    /// Copies `vol`'s whole catalog to `dest`, with no forwarding. Commits
    /// made after the copy's snapshot have to be replayed separately.
    pub(crate) async fn push_catalog(&self, vol: VolumeId, dest: ServiceId) -> Result<(), Error> {
        let snap = self.catalog.get_volume_snapshot(vol)?;
        let progress = MigrationProgress::new();
        let res = async {
            self.start_catalog_push(vol, dest).await?;
            self.send_baseline(vol, dest, snap, &progress).await?;
            self.call_peer(dest, Req::CatSyncFwdDone(CatSyncFwdDoneMsg { volume_id: vol }))
                .await?
                .into_ack()
        }
        .await;
        if let Err(e) = self.catalog.free_volume_snapshot(snap) {
            warn!("{:?} snapshot {:?} not freed: {}", vol, snap, e);
        }
        if res.is_err() {
            if let Err(e) = self
                .call_peer(dest, Req::CatSyncAbort(CatSyncAbortMsg { volume_id: vol }))
                .await
            {
                warn!("{:?} sync abort to {:?} failed: {}", vol, dest, e);
            }
        }
        res
    }

    /// Brings a lagging replica of a group this DM coordinates back into the
    /// functional set: replays the commits it missed, or copies the whole
    /// catalog when they are no longer in the commit log, then replays the
    /// rest on the commit lane and rejoins it there.
    #[instrument(skip(self))]
    pub async fn resync_group_replica(&self, vol: VolumeId, replica: ServiceId) -> Result<(), Error> {
        let group = self.group(vol).await?;
        group.begin_resync(replica).await;
        let res = self.resync_group_replica_(&group, vol, replica).await;
        if let Err(e) = &res {
            warn!("{:?} replica {:?} stays out of the group: {}", vol, replica, e);
        }
        res
    }

    async fn resync_group_replica_(
        &self,
        group: &VolumeGroupHandle,
        vol: VolumeId,
        replica: ServiceId,
    ) -> Result<(), Error> {
        let target = group.last_commit_id().await;
        let probe = group.probe_replica(replica).await?;
        let full_copy = if probe.applied_commit_id > target
            || group.needs_full_copy(replica).await
        {
            // Holds, or may hold, commits the group never acknowledged.
            true
        } else {
            match group
                .replay_to(replica, probe.applied_commit_id + 1, target)
                .await
            {
                Ok(()) => false,
                Err(Error::CommitLogTruncated) => true,
                Err(e) => return Err(e),
            }
        };
        if full_copy {
            info!("{:?} copying catalog to replica {:?}", vol, replica);
            self.push_catalog(vol, replica).await?;
        }
        let g = group.clone();
        self.on_lane(vol, LaneKey::Commit, async move {
            let probe = g.probe_replica(replica).await?;
            let last = g.last_commit_id().await;
            g.replay_to(replica, probe.applied_commit_id + 1, last).await?;
            g.rejoin(replica).await;
            Ok(())
        })
        .await
    }

    /// Moves `vol` to `dest`: baseline copy, then live forwarding until the
    /// pending table is committed. Failures abort the migration.
    #[instrument(skip(self))]
    pub(crate) async fn migrate_volume(&self, vol: VolumeId, dest: ServiceId) -> Result<(), Error> {
        let progress = self.sender.begin(vol, dest).await?;
        match self.migrate_volume_(vol, dest, &progress).await {
            Ok(()) => {
                let this = self.clone();
                progress.spawn_watchdog(self.config.migration_progress_timeout, move || {
                    Box::pin(async move {
                        this.abort_migration(vol, MigrationEvent::Timeout).await;
                    })
                });
                Ok(())
            }
            Err(e) => {
                error!("migration of {:?} to {:?} failed: {}", vol, dest, e);
                self.abort_migration(vol, MigrationEvent::Abort).await;
                Err(e)
            }
        }
    }

    async fn migrate_volume_(
        &self,
        vol: VolumeId,
        dest: ServiceId,
        progress: &MigrationProgress,
    ) -> Result<(), Error> {
        // Commits after the snapshot are buffered by the sender.
        let this = self.clone();
        let snap = self
            .on_lane(vol, LaneKey::Commit, async move {
                this.placement.write().await.start_forwarding(vol, dest);
                this.catalog.get_volume_snapshot(vol)
            })
            .await?;
        let res = async {
            self.start_catalog_push(vol, dest).await?;
            self.sender.fire(vol, MigrationEvent::SyncStarted).await?;
            self.send_baseline(vol, dest, snap, progress).await
        }
        .await;
        if let Err(e) = self.catalog.free_volume_snapshot(snap) {
            warn!("{:?} snapshot {:?} not freed: {}", vol, snap, e);
        }
        res?;

        let this = self.clone();
        self.on_lane(vol, LaneKey::Commit, async move {
            let (dest, msgs) = this.sender.go_live(vol).await?;
            for m in msgs {
                let commit_id = m.commit_id;
                if let Err(e) = this.send_oneway(dest, OneWay::ForwardCatalogUpdate(m)).await {
                    warn!("forward of {:?} commit {} failed: {}", vol, commit_id, e);
                    this.sender.on_send_failed(vol, commit_id, e).await;
                }
            }
            Ok(())
        })
        .await
    }

    async fn abort_migration(&self, vol: VolumeId, why: MigrationEvent) {
        let dest = self.sender.dest(vol).await;
        if let Err(e) = self.sender.fire(vol, why).await {
            debug!("{:?} migration not abortable: {}", vol, e);
        }
        self.placement.write().await.stop_forwarding(vol);
        if let Some(dest) = dest {
            let res = self
                .call_peer(dest, Req::CatSyncAbort(CatSyncAbortMsg { volume_id: vol }))
                .await
                .and_then(Res::into_ack);
            if let Err(e) = res {
                warn!("{:?} could not abort sync at {:?}: {}", vol, dest, e);
            }
        }
        self.sender.finish(vol).await;
    }

    /// Ends forwarding of a migrating volume and hands it over: waits for
    /// every forwarded commit to be acknowledged, tells the destination, and
    /// releases the volume here.
    #[instrument(skip(self))]
    pub(crate) async fn finish_migration(&self, vol: VolumeId) -> Result<(), Error> {
        let dest = self.sender.dest(vol).await.ok_or(Error::SyncNotInProgress)?;
        let this = self.clone();
        let group = self
            .on_lane(vol, LaneKey::Commit, async move {
                this.sender.fire(vol, MigrationEvent::FwdDone).await?;
                this.placement.write().await.stop_forwarding(vol);
                Ok(this.groups.write().await.remove(&vol))
            })
            .await?;
        let res = async {
            self.sender
                .wait_drained(vol, self.config.migration_progress_timeout)
                .await?;
            self.call_peer(dest, Req::CatSyncFwdDone(CatSyncFwdDoneMsg { volume_id: vol }))
                .await?
                .into_ack()?;
            self.sender.fire(vol, MigrationEvent::Commit).await?;
            Ok::<(), Error>(())
        }
        .await;
        match res {
            Ok(()) => {
                self.release_volume(vol).await;
                self.sender.finish(vol).await;
                info!("{:?} handed {:?} over to {:?}", self.self_id, vol, dest);
                Ok(())
            }
            Err(e) => {
                if let Some(g) = group {
                    self.groups.write().await.insert(vol, g);
                }
                Err(e)
            }
        }
    }

    async fn release_volume(&self, vol: VolumeId) {
        self.groups.write().await.remove(&vol);
        self.lanes.retire_volume(vol).await;
        let dropped = self.txmgr.remove_volume_txs(vol).await;
        if dropped > 0 {
            info!("{:?} release dropped {} open transactions", vol, dropped);
        }
        self.replicas.write().await.remove(&vol);
        if let Err(e) = self.catalog.close_catalog(vol) {
            debug!("{:?} release: {}", vol, e);
        }
    }

    // Placement control.

    #[instrument(skip(self, m), fields(dmt = ?m.dmt.version))]
    pub(crate) async fn notify_dmt_update(&self, m: CtrlNotifyDmtUpdate) -> Result<(), Error> {
        let moving = {
            let mut placement = self.placement.write().await;
            placement.notify_dmt_update(m.dmt)?;
            placement.volumes_moving_away(self.self_id)
        };
        for (vol, dest) in moving {
            if !self.groups.read().await.contains_key(&vol) {
                continue;
            }
            if self.sender.state(vol).await.is_some() {
                debug!("{:?} already migrating", vol);
                continue;
            }
            self.migrate_volume(vol, dest).await?;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub(crate) async fn dmt_commit(&self, m: CtrlDmtCommit) -> Result<(), Error> {
        let mut first_err = None;
        for vol in self.sender.volumes().await {
            if let Err(e) = self.finish_migration(vol).await {
                error!("migration of {:?} failed at commit: {}", vol, e);
                self.abort_migration(vol, MigrationEvent::Abort).await;
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => self.placement.write().await.commit_dmt(m.version),
        }
    }

    pub(crate) async fn dmt_abort(&self) -> Result<(), Error> {
        for vol in self.sender.volumes().await {
            self.abort_migration(vol, MigrationEvent::Abort).await;
        }
        self.placement.write().await.abort_dmt();
        Ok(())
    }

    pub(crate) async fn notify_dlt_update(&self, m: CtrlNotifyDltUpdate) -> Result<(), Error> {
        self.placement.write().await.notify_dlt_update(m.version);
        Ok(())
    }
}
