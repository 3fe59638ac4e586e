// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Replicated volume groups.
//!
//! One DM coordinates each volume: it owns a [VolumeGroupHandle] that fans
//! every mutation out to the volume's replicas (itself included) and
//! acknowledges only once a majority of the replicas the group was opened with
//! applied it. Replicas that fail to answer are dropped from the functional
//! set; once that set is smaller than the quorum every call fails fast.
//!
//! Mutations come in two kinds. Modify ops stage transaction state and carry
//! only an op id. Commits carry the full [CommitBatch] and a commit id; every
//! replica applies commits in strict commit-id order and keeps recent ones in
//! a [CommitLog] so that a replica that fell behind can replay them.
//!
//! The replica side of the protocol is [VolumeReplica].

use crate::{
    messages::{
        ModifyOp, OpenVolumeMsg, OpenVolumeRspMsg, QueryCatalogMsg, QueryCatalogRspMsg,
        ReplayCommitsMsg, SetVolumeGroupCoordinatorMsg, VolumeGroupCommitMsg,
        VolumeGroupModifyMsg,
    },
    network::{Req, Res},
    quorum::{failures_tolerated, majority_quorum},
    BlobMeta, CommitBatch, CommitLog, CommitLogEntry, Error, QuorumTracker, ServiceId,
    SyncBoxFuture, VolumeId, VolumeMeta,
};
use async_std::{
    future,
    sync::{Arc, Mutex},
};
use futures::{stream::FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    time::Duration,
};
use tracing::{debug, info, trace, warn};

/// How a coordinator reaches the replicas of its groups.
pub trait GroupTransport: Send + Sync + 'static {
    fn send_req(&self, to: ServiceId, req: Req) -> SyncBoxFuture<Result<Res, Error>>;
}

/// A replica as its coordinator sees it.
#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicaState {
    Functional,
    /// Being brought up to date; receives no fan-out.
    Syncing,
    NonFunctional,
}

// Errors that say nothing about the replica's state, only that it couldn't
// be reached in time.
fn is_transport_error(e: &Error) -> bool {
    matches!(
        e,
        Error::NetworkingError | Error::ReplicaTimeout | Error::ShuttingDown
    )
}

#[derive(Debug)]
struct GroupState {
    replicas: BTreeMap<ServiceId, ReplicaState>,
    open_msg: Option<OpenVolumeMsg>,
    version: u64,
    last_op_id: u64,
    last_commit_id: u64,
    // Replicas that timed out on a commit whose id was then reused. They may
    // hold a different batch under that id, so replay can't repair them.
    needs_full_copy: BTreeSet<ServiceId>,
}

impl GroupState {
    fn functional(&self) -> Vec<ServiceId> {
        self.replicas
            .iter()
            .filter(|(_, s)| **s == ReplicaState::Functional)
            .map(|(id, _)| *id)
            .collect()
    }
}

#[derive(Clone)]
pub struct VolumeGroupHandle {
    volume_id: VolumeId,
    self_id: ServiceId,
    quorum: usize,
    timeout: Duration,
    transport: Arc<dyn GroupTransport>,
    state: Arc<Mutex<GroupState>>,
}

impl VolumeGroupHandle {
    pub fn new(
        volume_id: VolumeId,
        self_id: ServiceId,
        replicas: Vec<ServiceId>,
        timeout: Duration,
        transport: Arc<dyn GroupTransport>,
    ) -> VolumeGroupHandle {
        assert!(!replicas.is_empty(), "volume group with no replicas");
        let quorum = majority_quorum(replicas.len());
        VolumeGroupHandle {
            volume_id,
            self_id,
            quorum,
            timeout,
            transport,
            state: Arc::new(Mutex::new(GroupState {
                replicas: replicas
                    .into_iter()
                    .map(|r| (r, ReplicaState::NonFunctional))
                    .collect(),
                open_msg: None,
                version: 0,
                last_op_id: 0,
                last_commit_id: 0,
                needs_full_copy: BTreeSet::new(),
            })),
        }
    }

    pub fn volume_id(&self) -> VolumeId {
        self.volume_id
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    pub async fn replicas(&self) -> Vec<ServiceId> {
        self.state.lock().await.replicas.keys().copied().collect()
    }

    pub async fn replica_state(&self, replica: ServiceId) -> Option<ReplicaState> {
        self.state.lock().await.replicas.get(&replica).copied()
    }

    pub async fn functional_replica_count(&self) -> usize {
        self.state.lock().await.functional().len()
    }

    pub async fn is_functional(&self) -> bool {
        self.functional_replica_count().await >= self.quorum
    }

    pub async fn version(&self) -> u64 {
        self.state.lock().await.version
    }

    pub async fn last_commit_id(&self) -> u64 {
        self.state.lock().await.last_commit_id
    }

    /// Whether `replica` may have applied a commit the group later reissued
    /// under the same id, and so must be fully copied before it rejoins.
    pub async fn needs_full_copy(&self, replica: ServiceId) -> bool {
        self.state.lock().await.needs_full_copy.contains(&replica)
    }

    fn call(&self, to: ServiceId, req: Req) -> SyncBoxFuture<(ServiceId, Result<Res, Error>)> {
        let fut = self.transport.send_req(to, req);
        let dur = self.timeout;
        Box::pin(async move {
            match future::timeout(dur, fut).await {
                Ok(res) => (to, res),
                Err(_) => (to, Err(Error::ReplicaTimeout)),
            }
        })
    }

    async fn fan_out(
        &self,
        targets: &[ServiceId],
        req: Req,
    ) -> Vec<(ServiceId, Result<Res, Error>)> {
        trace!("{:?} fan-out to {:?}: {:?}", self.volume_id, targets, req);
        let mut futs = FuturesUnordered::new();
        for t in targets {
            futs.push(self.call(*t, req.clone()));
        }
        let mut out = Vec::with_capacity(targets.len());
        while let Some(r) = futs.next().await {
            out.push(r);
        }
        out
    }

    async fn mark_non_functional(&self, replica: ServiceId, why: &Error) {
        let mut st = self.state.lock().await;
        if let Some(s) = st.replicas.get_mut(&replica) {
            if *s != ReplicaState::NonFunctional {
                *s = ReplicaState::NonFunctional;
                warn!(
                    "{:?} replica {:?} marked non-functional: {}",
                    self.volume_id, replica, why
                );
            }
        }
    }

    /// Establishes the group: every replica opens (or creates) its catalog
    /// and reports its watermarks, replicas at the newest commit become the
    /// functional set and learn this DM as their coordinator. Returns the new
    /// group version. Replicas behind the newest commit are left `Syncing`.
    pub fn open(&self, msg: OpenVolumeMsg) -> SyncBoxFuture<Result<u64, Error>> {
        let this = self.clone();
        Box::pin(async move { this.open_(msg).await })
    }

    async fn open_(&self, msg: OpenVolumeMsg) -> Result<u64, Error> {
        let all = self.replicas().await;
        let mut opened: BTreeMap<ServiceId, OpenVolumeRspMsg> = BTreeMap::new();
        for (from, res) in self.fan_out(&all, Req::OpenVolume(msg.clone())).await {
            match res.and_then(Res::into_open_volume) {
                Ok(rsp) => {
                    opened.insert(from, rsp);
                }
                Err(e) => warn!("{:?} replica {:?} failed to open: {}", self.volume_id, from, e),
            }
        }
        let newest = opened.values().map(|r| r.applied_commit_id).max().unwrap_or(0);
        let version = opened.values().map(|r| r.replica_version).max().unwrap_or(0) + 1;
        let functional = {
            let mut st = self.state.lock().await;
            for id in all.iter() {
                let s = match opened.get(id) {
                    Some(r) if r.applied_commit_id == newest => ReplicaState::Functional,
                    Some(_) => ReplicaState::Syncing,
                    None => ReplicaState::NonFunctional,
                };
                st.replicas.insert(*id, s);
            }
            st.open_msg = Some(msg);
            st.version = version;
            st.last_commit_id = newest;
            st.last_op_id = opened.values().map(|r| r.applied_op_id).max().unwrap_or(0);
            st.functional()
        };
        if functional.len() < self.quorum {
            return Err(Error::GroupNotFunctional);
        }

        let req = Req::SetCoordinator(SetVolumeGroupCoordinatorMsg {
            volume_id: self.volume_id,
            coordinator: self.self_id,
            version,
        });
        for (from, res) in self.fan_out(&functional, req).await {
            if let Err(e) = res.and_then(Res::into_set_coordinator) {
                self.mark_non_functional(from, &e).await;
            }
        }
        let n = self.functional_replica_count().await;
        if n < self.quorum {
            return Err(Error::GroupNotFunctional);
        }
        info!(
            "opened group of {:?} at version {}: {} of {} replicas functional, tolerating {} failures, last commit {}",
            self.volume_id,
            version,
            n,
            all.len(),
            failures_tolerated(all.len()),
            newest
        );
        Ok(version)
    }

    /// Replicates a non-committing mutation. Succeeds once a quorum applied
    /// it; replicas that can't be reached are dropped from the group.
    pub fn send_modify_msg(&self, op: ModifyOp) -> SyncBoxFuture<Result<(), Error>> {
        let this = self.clone();
        Box::pin(async move { this.send_modify_msg_(op).await })
    }

    async fn send_modify_msg_(&self, op: ModifyOp) -> Result<(), Error> {
        let (op_id, targets) = {
            let mut st = self.state.lock().await;
            let targets = st.functional();
            if targets.len() < self.quorum {
                return Err(Error::GroupNotFunctional);
            }
            st.last_op_id += 1;
            (st.last_op_id, targets)
        };
        let req = Req::GroupModify(VolumeGroupModifyMsg {
            volume_id: self.volume_id,
            op_id,
            op,
        });
        let mut tracker = QuorumTracker::new(self.quorum, targets.len());
        let mut first_err = None;
        for (from, res) in self.fan_out(&targets, req).await {
            match res.and_then(Res::into_ack) {
                Ok(()) => tracker.ack(from),
                Err(e) => {
                    if is_transport_error(&e) {
                        self.mark_non_functional(from, &e).await;
                    } else {
                        // Staging divergence is repaired by the commit, which
                        // carries the coordinator's full batch.
                        debug!("{:?} replica {:?} rejected op {}: {}", self.volume_id, from, op_id, e);
                        first_err.get_or_insert(e);
                    }
                    tracker.fail(from);
                }
            }
        }
        if tracker.acked().is_empty() {
            return Err(first_err.unwrap_or(Error::QuorumNotMet));
        }
        tracker.result()
    }

    /// Replicates a commit under the next commit id. Must not be called
    /// concurrently for one group. Returns the commit id, its op id and the
    /// blob's new metadata.
    pub fn send_commit_msg(
        &self,
        batch: CommitBatch,
    ) -> SyncBoxFuture<Result<(u64, u64, BlobMeta), Error>> {
        let this = self.clone();
        Box::pin(async move { this.send_commit_msg_(batch).await })
    }

    async fn send_commit_msg_(&self, batch: CommitBatch) -> Result<(u64, u64, BlobMeta), Error> {
        let (op_id, commit_id, targets) = {
            let mut st = self.state.lock().await;
            let targets = st.functional();
            if targets.len() < self.quorum {
                return Err(Error::GroupNotFunctional);
            }
            st.last_op_id += 1;
            st.last_commit_id += 1;
            (st.last_op_id, st.last_commit_id, targets)
        };
        let req = Req::GroupCommit(VolumeGroupCommitMsg {
            volume_id: self.volume_id,
            op_id,
            commit_id,
            batch,
        });
        let mut tracker = QuorumTracker::new(self.quorum, targets.len());
        let mut rejected = Vec::new();
        let mut unreachable = Vec::new();
        let mut first_err = None;
        let mut meta: Option<BlobMeta> = None;
        for (from, res) in self.fan_out(&targets, req).await {
            match res.and_then(Res::into_group_commit) {
                Ok(rsp) => {
                    tracker.ack(from);
                    if let Some(m) = rsp.meta {
                        if meta.is_none() || from == self.self_id {
                            meta = Some(m);
                        }
                    }
                }
                Err(e) if is_transport_error(&e) => {
                    self.mark_non_functional(from, &e).await;
                    unreachable.push(from);
                    tracker.fail(from);
                }
                Err(e) => {
                    rejected.push(from);
                    first_err.get_or_insert(e);
                    tracker.fail(from);
                }
            }
        }

        if tracker.acked().is_empty() {
            // No ack: the id is reused by the next commit. Replicas that
            // didn't answer may have applied this batch under it anyway.
            let mut st = self.state.lock().await;
            assert_eq!(st.last_commit_id, commit_id, "concurrent commits on one group");
            st.last_commit_id -= 1;
            for r in unreachable {
                warn!(
                    "{:?} replica {:?} may hold reissued commit {}",
                    self.volume_id, r, commit_id
                );
                st.needs_full_copy.insert(r);
            }
            return Err(first_err.unwrap_or(Error::QuorumNotMet));
        }
        for r in rejected {
            // Some replicas applied this commit and these didn't: diverged.
            self.mark_non_functional(r, first_err.as_ref().unwrap_or(&Error::QuorumNotMet))
                .await;
        }
        tracker.result()?;
        debug!(
            "{:?} commit {} (op {}) acked by {:?}",
            self.volume_id,
            commit_id,
            op_id,
            tracker.acked()
        );
        match meta {
            Some(m) => Ok((commit_id, op_id, m)),
            None => Err(Error::UnexpectedResponse),
        }
    }

    /// Reads from one functional replica, this DM first.
    pub fn send_read_msg(
        &self,
        msg: QueryCatalogMsg,
    ) -> SyncBoxFuture<Result<QueryCatalogRspMsg, Error>> {
        let this = self.clone();
        Box::pin(async move { this.send_read_msg_(msg).await })
    }

    async fn send_read_msg_(&self, msg: QueryCatalogMsg) -> Result<QueryCatalogRspMsg, Error> {
        let mut targets = {
            let st = self.state.lock().await;
            let targets = st.functional();
            if targets.len() < self.quorum {
                return Err(Error::GroupNotFunctional);
            }
            targets
        };
        targets.sort_by_key(|t| *t != self.self_id);
        for t in targets {
            let (_, res) = self.call(t, Req::GroupRead(msg.clone())).await;
            match res.and_then(Res::into_query) {
                Err(e) if is_transport_error(&e) => self.mark_non_functional(t, &e).await,
                other => return other,
            }
        }
        Err(Error::GroupNotFunctional)
    }

    /// Takes `replica` out of the fan-out while it is brought up to date.
    pub async fn begin_resync(&self, replica: ServiceId) {
        if let Some(s) = self.state.lock().await.replicas.get_mut(&replica) {
            info!("{:?} replica {:?} resyncing", self.volume_id, replica);
            *s = ReplicaState::Syncing;
        }
    }

    /// Returns a caught-up replica to the functional set. Call it where no
    /// commit can slip in between the replica's last replay and this.
    pub async fn rejoin(&self, replica: ServiceId) {
        let mut st = self.state.lock().await;
        st.needs_full_copy.remove(&replica);
        if let Some(s) = st.replicas.get_mut(&replica) {
            info!("{:?} replica {:?} rejoined", self.volume_id, replica);
            *s = ReplicaState::Functional;
        }
    }

    /// Re-sends the open message to one replica to learn its watermarks.
    pub async fn probe_replica(&self, replica: ServiceId) -> Result<OpenVolumeRspMsg, Error> {
        let msg = self.state.lock().await.open_msg.clone();
        match msg {
            Some(msg) => self.call(replica, Req::OpenVolume(msg)).await.1?.into_open_volume(),
            None => Err(Error::NotReady),
        }
    }

    /// Has `replica` pull and apply commits `start..=end` from this DM.
    pub async fn replay_to(&self, replica: ServiceId, start: u64, end: u64) -> Result<(), Error> {
        if start > end {
            return Ok(());
        }
        let req = Req::ReplayCommits(ReplayCommitsMsg {
            volume_id: self.volume_id,
            from: self.self_id,
            start_commit_id: start,
            end_commit_id: end,
        });
        debug!(
            "{:?} replaying commits {}..={} to {:?}",
            self.volume_id, start, end, replica
        );
        self.call(replica, req).await.1?.into_ack()
    }
}

/// Where a replica is in its own life cycle.
#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicaPhase {
    Loading,
    Syncing,
    Functional,
}

/// A DM's state as a replica of one volume.
#[derive(Debug)]
pub struct VolumeReplica {
    phase: ReplicaPhase,
    meta: VolumeMeta,
    coordinator: Option<(ServiceId, u64)>,
    log: CommitLog,
}

impl VolumeReplica {
    pub fn new(meta: VolumeMeta, log_retention: usize) -> VolumeReplica {
        let log = CommitLog::new(log_retention, meta.watermarks.applied_commit_id.0);
        VolumeReplica {
            phase: ReplicaPhase::Loading,
            meta,
            coordinator: None,
            log,
        }
    }

    pub fn phase(&self) -> ReplicaPhase {
        self.phase
    }

    pub fn set_phase(&mut self, phase: ReplicaPhase) {
        debug!("{:?} replica {:?} -> {:?}", self.meta.desc.volume_id, self.phase, phase);
        self.phase = phase;
    }

    pub fn meta(&self) -> &VolumeMeta {
        &self.meta
    }

    pub fn applied_commit_id(&self) -> u64 {
        self.meta.watermarks.applied_commit_id.0
    }

    pub fn applied_op_id(&self) -> u64 {
        self.meta.watermarks.applied_op_id.0
    }

    pub fn coordinator(&self) -> Option<(ServiceId, u64)> {
        self.coordinator
    }

    pub fn version(&self) -> u64 {
        self.coordinator.map_or(0, |(_, v)| v)
    }

    /// Accepts a coordinator announcement unless it is older than the one
    /// already recorded.
    pub fn set_coordinator(&mut self, coordinator: ServiceId, version: u64) -> Result<u64, Error> {
        if version < self.version() {
            return Err(Error::IllegalTransition(format!(
                "coordinator version {} is older than {}",
                version,
                self.version()
            )));
        }
        self.coordinator = Some((coordinator, version));
        Ok(version)
    }

    pub fn note_op(&mut self, op_id: u64) {
        self.meta.watermarks.advance_op(op_id);
    }

    /// `Ok(true)` if `commit_id` is the next one, `Ok(false)` if it was
    /// already applied, [Error::CommitIdGap] if commits are missing.
    pub fn check_commit(&self, commit_id: u64) -> Result<bool, Error> {
        let applied = self.applied_commit_id();
        if commit_id <= applied {
            Ok(false)
        } else if commit_id == applied + 1 {
            Ok(true)
        } else {
            Err(Error::CommitIdGap)
        }
    }

    /// The volume record as it will be after applying this commit.
    pub fn next_meta(&self, op_id: u64, commit_id: u64) -> VolumeMeta {
        let mut vm = self.meta.clone();
        vm.watermarks.advance_commit(op_id, commit_id);
        vm
    }

    /// Records a commit whose batch, with `meta`, was persisted.
    pub fn record_commit(&mut self, meta: VolumeMeta, entry: CommitLogEntry) {
        assert_eq!(
            meta.watermarks.applied_commit_id.0, entry.commit_id,
            "volume record and log entry disagree"
        );
        self.meta = meta;
        self.log.append(entry);
    }

    pub fn pull(&self, start: u64, end: u64) -> Result<Vec<CommitLogEntry>, Error> {
        self.log.pull(start, end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        messages::{StartBlobTxMsg, VolumeGroupCommitRspMsg},
        DmtVersion, TxId, VolumeDesc,
    };
    use async_std::task;
    use std::collections::BTreeSet;

    #[derive(Default)]
    struct FakeTransport {
        dead: std::sync::Mutex<BTreeSet<ServiceId>>,
        hung: std::sync::Mutex<BTreeSet<ServiceId>>,
        failing_commits: std::sync::Mutex<BTreeSet<ServiceId>>,
    }

    impl FakeTransport {
        fn kill(&self, id: u64) {
            self.dead.lock().unwrap().insert(ServiceId(id));
        }
        fn hang(&self, id: u64) {
            self.hung.lock().unwrap().insert(ServiceId(id));
        }
        fn fail_commits(&self, id: u64) {
            self.failing_commits.lock().unwrap().insert(ServiceId(id));
        }
    }

    impl GroupTransport for FakeTransport {
        fn send_req(&self, to: ServiceId, req: Req) -> SyncBoxFuture<Result<Res, Error>> {
            let dead = self.dead.lock().unwrap().contains(&to);
            let hung = self.hung.lock().unwrap().contains(&to);
            let failing = self.failing_commits.lock().unwrap().contains(&to);
            Box::pin(async move {
                if hung {
                    future::pending::<()>().await;
                }
                if dead {
                    return Err(Error::NetworkingError);
                }
                Ok(match req {
                    Req::OpenVolume(_) => Res::OpenVolume(Ok(OpenVolumeRspMsg {
                        replica_version: 0,
                        applied_op_id: 0,
                        applied_commit_id: 0,
                    })),
                    Req::SetCoordinator(m) => Res::SetCoordinator(Ok(
                        crate::messages::SetVolumeGroupCoordinatorRspMsg { version: m.version },
                    )),
                    Req::GroupCommit(_) if failing => {
                        Res::GroupCommit(Err(Error::Storage("disk full".into())))
                    }
                    Req::GroupCommit(m) => Res::GroupCommit(Ok(VolumeGroupCommitRspMsg {
                        applied_commit_id: m.commit_id,
                        meta: Some(BlobMeta::new(m.volume_id, &m.batch.blob_name)),
                    })),
                    _ => Res::Ack(Ok(())),
                })
            })
        }
    }

    fn group(transport: Arc<FakeTransport>) -> VolumeGroupHandle {
        VolumeGroupHandle::new(
            VolumeId(7),
            ServiceId(1),
            vec![ServiceId(1), ServiceId(2), ServiceId(3)],
            Duration::from_millis(100),
            transport,
        )
    }

    fn open_msg() -> OpenVolumeMsg {
        OpenVolumeMsg {
            volume_id: VolumeId(7),
            desc: VolumeDesc::new(VolumeId(7), "v", 4096),
            coordinator: ServiceId(1),
        }
    }

    fn start(tx: u64) -> ModifyOp {
        ModifyOp::StartTx(StartBlobTxMsg {
            volume_id: VolumeId(7),
            blob_name: "b".into(),
            blob_version: 0,
            blob_mode: 0,
            tx_id: TxId(tx),
            dmt_version: DmtVersion(1),
        })
    }

    #[test]
    fn fan_out_before_open_fails_fast() {
        task::block_on(async {
            let g = group(Arc::new(FakeTransport::default()));
            assert_eq!(g.send_modify_msg(start(1)).await, Err(Error::GroupNotFunctional));
            assert!(!g.is_functional().await);
        })
    }

    #[test]
    fn quorum_degradation() {
        task::block_on(async {
            let _ = tracing_subscriber::fmt::try_init();
            let t = Arc::new(FakeTransport::default());
            let g = group(t.clone());
            assert_eq!(g.quorum(), 2);
            assert_eq!(g.open(open_msg()).await, Ok(1));
            assert_eq!(g.functional_replica_count().await, 3);

            t.kill(3);
            assert_eq!(g.send_modify_msg(start(1)).await, Ok(()));
            assert_eq!(g.functional_replica_count().await, 2);
            assert!(g.is_functional().await);
            assert_eq!(g.replica_state(ServiceId(3)).await, Some(ReplicaState::NonFunctional));

            t.kill(2);
            assert_eq!(g.send_modify_msg(start(2)).await, Err(Error::QuorumNotMet));
            assert!(g.functional_replica_count().await < g.quorum());
            assert!(!g.is_functional().await);
            assert_eq!(g.send_modify_msg(start(3)).await, Err(Error::GroupNotFunctional));
            assert_eq!(
                g.send_commit_msg(CommitBatch::new("b", TxId(3))).await,
                Err(Error::GroupNotFunctional)
            );
        })
    }

    #[test]
    fn hung_replica_times_out_and_commits_continue() {
        task::block_on(async {
            let t = Arc::new(FakeTransport::default());
            let g = group(t.clone());
            g.open(open_msg()).await.unwrap();
            t.hang(2);
            let (c1, _, meta) = g.send_commit_msg(CommitBatch::new("b", TxId(1))).await.unwrap();
            assert_eq!(c1, 1);
            assert_eq!(meta.blob_name, "b");
            assert_eq!(g.replica_state(ServiceId(2)).await, Some(ReplicaState::NonFunctional));
            let (c2, _, _) = g.send_commit_msg(CommitBatch::new("b", TxId(2))).await.unwrap();
            assert_eq!(c2, 2);
            assert_eq!(g.last_commit_id().await, 2);
        })
    }

    #[test]
    fn reissued_commit_id_forces_full_copy_of_silent_replicas() {
        task::block_on(async {
            let t = Arc::new(FakeTransport::default());
            let g = group(t.clone());
            g.open(open_msg()).await.unwrap();
            g.send_commit_msg(CommitBatch::new("b", TxId(1))).await.unwrap();

            // The local apply fails outright; the others may have applied
            // commit 2 before their answers were lost.
            t.fail_commits(1);
            t.hang(2);
            t.hang(3);
            assert_eq!(
                g.send_commit_msg(CommitBatch::new("b", TxId(2))).await,
                Err(Error::Storage("disk full".into()))
            );
            assert_eq!(g.last_commit_id().await, 1);
            assert!(!g.needs_full_copy(ServiceId(1)).await);
            assert!(g.needs_full_copy(ServiceId(2)).await);
            assert!(g.needs_full_copy(ServiceId(3)).await);

            g.begin_resync(ServiceId(2)).await;
            g.rejoin(ServiceId(2)).await;
            assert!(!g.needs_full_copy(ServiceId(2)).await);
            assert!(g.needs_full_copy(ServiceId(3)).await);
        })
    }

    #[test]
    fn resync_and_rejoin() {
        task::block_on(async {
            let t = Arc::new(FakeTransport::default());
            let g = group(t.clone());
            g.open(open_msg()).await.unwrap();
            g.begin_resync(ServiceId(3)).await;
            assert_eq!(g.functional_replica_count().await, 2);
            assert_eq!(g.replay_to(ServiceId(3), 1, 0).await, Ok(()));
            assert_eq!(g.replay_to(ServiceId(3), 1, 4).await, Ok(()));
            g.rejoin(ServiceId(3)).await;
            assert_eq!(g.functional_replica_count().await, 3);
        })
    }

    #[test]
    fn replica_commit_order() {
        let desc = VolumeDesc::new(VolumeId(7), "v", 4096);
        let mut r = VolumeReplica::new(VolumeMeta::new(desc), 8);
        assert_eq!(r.phase(), ReplicaPhase::Loading);
        assert_eq!(r.check_commit(1), Ok(true));
        assert_eq!(r.check_commit(2), Err(Error::CommitIdGap));
        let vm = r.next_meta(4, 1);
        r.record_commit(
            vm,
            CommitLogEntry {
                commit_id: 1,
                op_id: 4,
                batch: CommitBatch::new("b", TxId(1)),
            },
        );
        assert_eq!(r.check_commit(1), Ok(false));
        assert_eq!(r.applied_op_id(), 4);
        assert_eq!(r.pull(1, 1).unwrap().len(), 1);

        assert_eq!(r.set_coordinator(ServiceId(1), 3), Ok(3));
        assert!(r.set_coordinator(ServiceId(2), 2).is_err());
        assert_eq!(r.coordinator(), Some((ServiceId(1), 3)));
    }
}
