// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! This module glues a set of peer connections and their IO service loops,
//! provided by edelcrantz, to the RPC handlers on [DataManager]. Requests are
//! served on their own tasks; one-way messages are fed to a single ordered
//! consumer so forwarded commits are applied in the order they were sent.

use crate::{
    messages::{
        AbortBlobTxMsg, CatSyncAbortMsg, CatSyncBaselineDoneMsg, CatSyncBaselineMsg,
        CatSyncFwdDoneMsg, CatSyncStartMsg, CommitBlobTxMsg, CommitBlobTxRspMsg,
        CtrlDmtCommit, CtrlNotifyDltUpdate, CtrlNotifyDmtUpdate, DeleteBlobMsg,
        ForwardCatalogUpdateMsg, OpenVolumeMsg, OpenVolumeRspMsg, PullCommitlogEntriesMsg,
        PullCommitlogEntriesRspMsg, PushMetaSyncRespMsg, QueryCatalogMsg, QueryCatalogRspMsg,
        ReplayCommitsMsg, SetBlobMetaDataMsg, SetVolumeGroupCoordinatorMsg,
        SetVolumeGroupCoordinatorRspMsg, StartBlobTxMsg, UpdateCatalogMsg,
        VolumeGroupCommitMsg, VolumeGroupCommitRspMsg, VolumeGroupModifyMsg,
    },
    DataManager, Error, ServiceId, SyncBoxFuture,
};
use async_std::{
    sync::{Arc, Mutex},
    task,
};
use futures::{
    channel::mpsc::{self, UnboundedSender},
    StreamExt,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, debug_span, trace, warn, Instrument};

type Conn = edelcrantz::Connection<OneWay, Req, Res>;
type Queue = edelcrantz::Queue<OneWay, Req, Res>;

pub(crate) type Connection = (Arc<Mutex<Conn>>, Queue);

pub(crate) type ResponseFuture = SyncBoxFuture<(ServiceId, Result<Res, Error>)>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Req {
    // From the access layer, to a volume's coordinator.
    StartBlobTx(StartBlobTxMsg),
    UpdateCatalog(UpdateCatalogMsg),
    CommitBlobTx(CommitBlobTxMsg),
    AbortBlobTx(AbortBlobTxMsg),
    SetBlobMetaData(SetBlobMetaDataMsg),
    DeleteBlob(DeleteBlobMsg),
    QueryCatalog(QueryCatalogMsg),

    // From a coordinator, to the replicas of its group.
    OpenVolume(OpenVolumeMsg),
    SetCoordinator(SetVolumeGroupCoordinatorMsg),
    GroupModify(VolumeGroupModifyMsg),
    GroupCommit(VolumeGroupCommitMsg),
    GroupRead(QueryCatalogMsg),
    PullCommitlog(PullCommitlogEntriesMsg),
    ReplayCommits(ReplayCommitsMsg),

    // From the orchestrator.
    NotifyDmtUpdate(CtrlNotifyDmtUpdate),
    DmtCommit(CtrlDmtCommit),
    DmtAbort,
    NotifyDltUpdate(CtrlNotifyDltUpdate),

    // From a catalog sync source, to its target.
    CatSyncStart(CatSyncStartMsg),
    CatSyncBaseline(CatSyncBaselineMsg),
    CatSyncBaselineDone(CatSyncBaselineDoneMsg),
    CatSyncFwdDone(CatSyncFwdDoneMsg),
    CatSyncAbort(CatSyncAbortMsg),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Res {
    Ack(Result<(), Error>),
    Commit(Result<CommitBlobTxRspMsg, Error>),
    Query(Result<QueryCatalogRspMsg, Error>),
    OpenVolume(Result<OpenVolumeRspMsg, Error>),
    SetCoordinator(Result<SetVolumeGroupCoordinatorRspMsg, Error>),
    GroupCommit(Result<VolumeGroupCommitRspMsg, Error>),
    PullCommitlog(Result<PullCommitlogEntriesRspMsg, Error>),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OneWay {
    ForwardCatalogUpdate(ForwardCatalogUpdateMsg),
    PushMetaSyncResp(PushMetaSyncRespMsg),
}

impl Res {
    pub fn into_ack(self) -> Result<(), Error> {
        match self {
            Res::Ack(r) => r,
            _ => Err(Error::UnexpectedResponse),
        }
    }

    pub fn into_commit(self) -> Result<CommitBlobTxRspMsg, Error> {
        match self {
            Res::Commit(r) => r,
            _ => Err(Error::UnexpectedResponse),
        }
    }

    pub fn into_query(self) -> Result<QueryCatalogRspMsg, Error> {
        match self {
            Res::Query(r) => r,
            _ => Err(Error::UnexpectedResponse),
        }
    }

    pub fn into_open_volume(self) -> Result<OpenVolumeRspMsg, Error> {
        match self {
            Res::OpenVolume(r) => r,
            _ => Err(Error::UnexpectedResponse),
        }
    }

    pub fn into_set_coordinator(self) -> Result<SetVolumeGroupCoordinatorRspMsg, Error> {
        match self {
            Res::SetCoordinator(r) => r,
            _ => Err(Error::UnexpectedResponse),
        }
    }

    pub fn into_group_commit(self) -> Result<VolumeGroupCommitRspMsg, Error> {
        match self {
            Res::GroupCommit(r) => r,
            _ => Err(Error::UnexpectedResponse),
        }
    }

    pub fn into_pull_commitlog(self) -> Result<PullCommitlogEntriesRspMsg, Error> {
        match self {
            Res::PullCommitlog(r) => r,
            _ => Err(Error::UnexpectedResponse),
        }
    }
}

impl DataManager {
    /// Adds a connection to a remote [ServiceId]. The `io` handle should be a
    /// full-duplex `AsyncRead+AsyncWrite` type.
    pub async fn connect<IO: edelcrantz::AsyncReadWrite>(&self, peer: ServiceId, io: IO) {
        debug!("connecting DM {:?} to {:?}", self.self_id, peer);
        let conn = edelcrantz::Connection::new(io);
        let queue = conn.queue.clone();
        let pair = (Arc::new(Mutex::new(conn)), queue);
        self.connections.write().await.insert(peer, pair);
    }

    pub(crate) fn serve_req(&self, req: Req) -> SyncBoxFuture<Res> {
        let this = self.clone();
        Box::pin(async move { this.serve_req_(req).await })
    }

    async fn serve_req_(&self, req: Req) -> Res {
        trace!("request {:?}", req);
        let res = match req {
            Req::StartBlobTx(m) => Res::Ack(self.start_blob_tx(m).await),
            Req::UpdateCatalog(m) => Res::Ack(self.update_catalog(m).await),
            Req::CommitBlobTx(m) => Res::Commit(self.commit_blob_tx(m).await),
            Req::AbortBlobTx(m) => Res::Ack(self.abort_blob_tx(m).await),
            Req::SetBlobMetaData(m) => Res::Ack(self.set_blob_meta_data(m).await),
            Req::DeleteBlob(m) => Res::Ack(self.delete_blob(m).await),
            Req::QueryCatalog(m) => Res::Query(self.query_catalog(m).await),

            Req::OpenVolume(m) => Res::OpenVolume(self.open_volume(m).await),
            Req::SetCoordinator(m) => Res::SetCoordinator(self.set_coordinator(m).await),
            Req::GroupModify(m) => Res::Ack(self.apply_group_modify(m).await),
            Req::GroupCommit(m) => Res::GroupCommit(self.apply_group_commit(m).await),
            Req::GroupRead(m) => Res::Query(self.read_catalog_local(&m)),
            Req::PullCommitlog(m) => Res::PullCommitlog(self.pull_commitlog(m).await),
            Req::ReplayCommits(m) => Res::Ack(self.replay_commits(m).await),

            Req::NotifyDmtUpdate(m) => Res::Ack(self.notify_dmt_update(m).await),
            Req::DmtCommit(m) => Res::Ack(self.dmt_commit(m).await),
            Req::DmtAbort => Res::Ack(self.dmt_abort().await),
            Req::NotifyDltUpdate(m) => Res::Ack(self.notify_dlt_update(m).await),

            Req::CatSyncStart(m) => Res::Ack(self.cat_sync_start(m).await),
            Req::CatSyncBaseline(m) => Res::Ack(self.cat_sync_baseline(m).await),
            Req::CatSyncBaselineDone(m) => Res::Ack(self.cat_sync_baseline_done(m).await),
            Req::CatSyncFwdDone(m) => Res::Ack(self.cat_sync_fwd_done(m).await),
            Req::CatSyncAbort(m) => Res::Ack(self.cat_sync_abort(m).await),
        };
        trace!("response {:?}", res);
        res
    }

    fn serve_oneway(
        &self,
        remote: ServiceId,
        oneway_send: UnboundedSender<(ServiceId, OneWay)>,
        ow: OneWay,
    ) {
        trace!("one-way msg from {:?}: {:?}", remote, ow);
        if let Err(e) = oneway_send.unbounded_send((remote, ow)) {
            warn!(
                "DM {:?} dropped a one-way msg from {:?}: {}",
                self.self_id, remote, e
            );
        }
    }

    pub(crate) fn handle_oneway(&self, remote: ServiceId, ow: OneWay) -> SyncBoxFuture<()> {
        let this = self.clone();
        Box::pin(async move {
            match ow {
                OneWay::ForwardCatalogUpdate(msg) => this.handle_forwarded_update(msg).await,
                OneWay::PushMetaSyncResp(msg) => {
                    trace!("forward ack from {:?}: {:?}", remote, msg);
                    this.sender.on_ack(&msg).await
                }
            }
        })
    }

    /// Start network-service worker tasks on this DM. Should be called after
    /// every peer is connected and before any request is sent.
    pub fn launch_workers(&self) -> SyncBoxFuture<()> {
        let this: DataManager = self.clone();
        let fut = async move {
            // One consumer for every connection's one-way messages: it awaits
            // each handler before taking the next, which keeps forwards in
            // the order their source sent them.
            let (oneway_send, mut oneway_recv) = mpsc::unbounded();
            task::spawn({
                let this = this.clone();
                let span = debug_span!("oneway", svc=?this.self_id);
                (async move {
                    while let Some((remote, msg)) = oneway_recv.next().await {
                        this.handle_oneway(remote, msg).await;
                    }
                })
                .instrument(span)
            });
            for (id, conn) in this.connections.read().await.iter() {
                let id = *id;
                let conn = conn.0.clone();
                let ow_send = oneway_send.clone();
                task::spawn({
                    let this = this.clone();
                    async move {
                        let mut n: usize = 0;
                        loop {
                            n += 1;
                            let sreq = {
                                let this = this.clone();
                                let span = debug_span!("rpc-task", svc=?this.self_id, remote=?id, ?n);
                                move |req| {
                                    task::spawn(
                                        async move { this.serve_req(req).await }.instrument(span),
                                    )
                                }
                            };
                            let sow = {
                                let this = this.clone();
                                let ow_send = ow_send.clone();
                                move |ow| this.serve_oneway(id, ow_send, ow)
                            };
                            let mut guard = conn.lock().await;
                            let span = debug_span!("service", svc=?this.self_id, remote=?id);
                            let res = guard.advance(sreq, sow).instrument(span).await;
                            trace!(
                                "service worker on {:?} talking to {:?} advanced (step {:?}): {:?}",
                                this.self_id,
                                id,
                                n,
                                res
                            );
                            match res {
                                Ok(()) => (),
                                // A replica fan-out stops listening once it has
                                // its answers; late responses land here.
                                Err(edelcrantz::Error::ResponseChannelDropped(_)) => (),
                                Err(_) => break,
                            }
                        }
                        warn!(
                            "service worker on {:?} talking to {:?} exited",
                            this.self_id, id
                        );
                    }
                });
            }
        };
        Box::pin(fut)
    }

    pub(crate) fn send_req_to_self(&self, req: Req) -> ResponseFuture {
        let this = self.clone();
        Box::pin(async move { (this.self_id, Ok(this.serve_req(req).await)) })
    }

    pub(crate) fn send_req_to_peer(&self, req: Req, peer: ServiceId) -> ResponseFuture {
        if peer == self.self_id {
            return self.send_req_to_self(req);
        }
        let this = self.clone();
        Box::pin(async move {
            let fut = match this.connections.read().await.get(&peer) {
                None => return (peer, Err(Error::NetworkingError)),
                Some((_, queue)) => queue.enqueue_request(req),
            };
            (peer, fut.await.map_err(Error::from))
        })
    }

    /// Sends `req` to `peer`, or serves it here when `peer` is this DM. This is
    /// how access-layer and orchestrator clients talk to a DM.
    pub fn request(&self, peer: ServiceId, req: Req) -> SyncBoxFuture<Result<Res, Error>> {
        let fut = self.send_req_to_peer(req, peer);
        Box::pin(async move { fut.await.1 })
    }

    /// Sends `req` to `peer` and waits for the answer, at most the configured
    /// replica timeout.
    pub(crate) async fn call_peer(&self, peer: ServiceId, req: Req) -> Result<Res, Error> {
        let fut = self.send_req_to_peer(req, peer);
        match async_std::future::timeout(self.config.replica_timeout, fut).await {
            Ok((_, res)) => res,
            Err(_) => {
                warn!("{:?} did not answer {:?} in time", peer, self.self_id);
                Err(Error::ReplicaTimeout)
            }
        }
    }

    pub(crate) async fn send_oneway(&self, peer: ServiceId, ow: OneWay) -> Result<(), Error> {
        if peer == self.self_id {
            self.handle_oneway(peer, ow).await;
            return Ok(());
        }
        let queue = match self.connections.read().await.get(&peer) {
            None => return Err(Error::NetworkingError),
            Some((_, queue)) => queue.clone(),
        };
        Ok(queue.enqueue_oneway(ow).await?)
    }
}
