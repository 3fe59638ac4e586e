// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Catalog sync: moving a volume's whole catalog to another DM while it
//! keeps taking commits.
//!
//! The source ([CatSyncSender]) takes a snapshot, streams its records to the
//! destination as a baseline, and buffers every commit made after the
//! snapshot. Once the baseline has landed it sends the buffered commits and
//! forwards new ones as they happen, counting each until the destination
//! acknowledges it.
//!
//! The destination ([CatSyncReceiver]) runs forwarded commits on a per-volume
//! shadow queue. The queue is created stopped and only started once the
//! baseline is in place, so no forwarded commit is applied ahead of it. When
//! the source says it is done, the receiver waits for the shadow queue to
//! drain, then fires the completion callback the owner registered.

use crate::{
    messages::{ForwardCatalogUpdateMsg, PushMetaSyncRespMsg},
    CommitBatch, DmtMigrationFsm, Error, MigrationAction, MigrationEvent, MigrationState,
    SerialQueue, ServiceId, SyncBoxFuture, VolumeId,
};
use async_std::{
    future,
    sync::{Arc, Condvar, Mutex},
    task,
};
use futures::Future;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::Duration,
};
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReceiverState {
    /// Baseline arriving; the shadow queue is stopped.
    Syncing,
    /// Baseline applied; forwarded commits run in arrival order.
    FwdInProgress,
    /// The source is done; draining what is still queued.
    FwdFinishing,
}

/// Called once when a volume's sync completes, before its tracking entry is
/// dropped.
pub type DoneCallback = Box<dyn FnOnce(VolumeId) -> SyncBoxFuture<()> + Send + Sync>;

struct VolReceiver {
    state: ReceiverState,
    shadow: SerialQueue,
    // Forwarded jobs enqueued and not yet finished.
    outstanding: usize,
    on_done: Option<DoneCallback>,
}

#[derive(Clone, Default)]
pub struct CatSyncReceiver {
    vols: Arc<Mutex<HashMap<VolumeId, VolReceiver>>>,
}

impl CatSyncReceiver {
    pub fn new() -> CatSyncReceiver {
        Self::default()
    }

    pub async fn start_recv_volmeta(
        &self,
        vol: VolumeId,
        on_done: DoneCallback,
    ) -> Result<(), Error> {
        let mut vols = self.vols.lock().await;
        if vols.contains_key(&vol) {
            return Err(Error::SyncInProgress);
        }
        vols.insert(
            vol,
            VolReceiver {
                state: ReceiverState::Syncing,
                shadow: SerialQueue::new(format!("{:?}/shadow", vol), false),
                outstanding: 0,
                on_done: Some(on_done),
            },
        );
        info!("receiving catalog of {:?}", vol);
        Ok(())
    }

    /// The baseline is in place: start applying forwarded commits.
    pub async fn start_process_fwd_updates(&self, vol: VolumeId) -> Result<(), Error> {
        let shadow = {
            let mut vols = self.vols.lock().await;
            let r = vols.get_mut(&vol).ok_or(Error::SyncNotInProgress)?;
            if r.state != ReceiverState::Syncing {
                return Err(Error::IllegalTransition(format!(
                    "{:?} baseline finished in state {:?}",
                    vol, r.state
                )));
            }
            r.state = ReceiverState::FwdInProgress;
            r.shadow.clone()
        };
        shadow.activate().await;
        info!("{:?} baseline applied, processing forwarded updates", vol);
        Ok(())
    }

    // Counts a forwarded job in and hands back the queue it runs on.
    async fn admit(&self, vol: VolumeId) -> Result<SerialQueue, Error> {
        let mut vols = self.vols.lock().await;
        let r = vols.get_mut(&vol).ok_or(Error::SyncNotInProgress)?;
        match r.state {
            ReceiverState::FwdInProgress => {
                r.outstanding += 1;
                Ok(r.shadow.clone())
            }
            ReceiverState::Syncing => Err(Error::IllegalTransition(
                "forwarded update before its baseline".to_string(),
            )),
            ReceiverState::FwdFinishing => Err(Error::IllegalTransition(
                "forwarded update after forwarding finished".to_string(),
            )),
        }
    }

    async fn push<F>(&self, vol: VolumeId, shadow: SerialQueue, job: F) -> Result<(), Error>
    where
        F: Future<Output = ()> + Send + Sync + 'static,
    {
        let this = self.clone();
        let res = shadow
            .enqueue(async move {
                job.await;
                this.job_done(vol).await;
            })
            .await;
        if res.is_err() {
            // Never queued, so never counted down by the job.
            self.job_done(vol).await;
        }
        res
    }

    /// Queues one forwarded commit behind those already queued. Forwarded
    /// commits are only legal once the baseline is in place and until the
    /// source said it is done; calling this at any other time panics.
    pub async fn enqueue_fwd_update<F>(&self, vol: VolumeId, job: F) -> Result<(), Error>
    where
        F: Future<Output = ()> + Send + Sync + 'static,
    {
        match self.admit(vol).await {
            Ok(shadow) => self.push(vol, shadow, job).await,
            Err(e) => panic!("{:?}: {}", vol, e),
        }
    }

    /// Like [Self::enqueue_fwd_update] but reports a sync that is gone or in
    /// the wrong state as an error, for updates that can race an abort.
    pub async fn try_enqueue_fwd_update<F>(&self, vol: VolumeId, job: F) -> Result<(), Error>
    where
        F: Future<Output = ()> + Send + Sync + 'static,
    {
        let shadow = self.admit(vol).await?;
        self.push(vol, shadow, job).await
    }

    async fn job_done(&self, vol: VolumeId) {
        let finish = {
            let mut vols = self.vols.lock().await;
            match vols.get_mut(&vol) {
                Some(r) => {
                    r.outstanding -= 1;
                    r.state == ReceiverState::FwdFinishing && r.outstanding == 0
                }
                None => false,
            }
        };
        if finish {
            self.finalize(vol).await;
        }
    }

    /// The source forwarded its last commit. Returns once the sync is
    /// finalized, after whatever was still queued has run.
    pub async fn handle_fwd_done(&self, vol: VolumeId) -> Result<(), Error> {
        let (finish, shadow) = {
            let mut vols = self.vols.lock().await;
            let r = vols.get_mut(&vol).ok_or(Error::SyncNotInProgress)?;
            if r.state != ReceiverState::FwdInProgress {
                return Err(Error::IllegalTransition(format!(
                    "{:?} forwarding done in state {:?}",
                    vol, r.state
                )));
            }
            r.state = ReceiverState::FwdFinishing;
            debug!("{:?} forwarding done, {} updates to drain", vol, r.outstanding);
            (r.outstanding == 0, r.shadow.clone())
        };
        if finish {
            self.finalize(vol).await;
        } else {
            // The last job finalizes; it is done when the queue is idle.
            shadow.wait_idle().await;
        }
        Ok(())
    }

    async fn finalize(&self, vol: VolumeId) {
        let cb = match self.vols.lock().await.get_mut(&vol) {
            Some(r) => r.on_done.take(),
            None => None,
        };
        if let Some(cb) = cb {
            cb(vol).await;
            if let Some(r) = self.vols.lock().await.remove(&vol) {
                r.shadow.close().await;
            }
            info!("catalog of {:?} received", vol);
        }
    }

    /// Drops the sync without calling the completion callback. Queued
    /// forwarded commits that haven't started are discarded.
    pub async fn abort(&self, vol: VolumeId) -> Result<(), Error> {
        let removed = self.vols.lock().await.remove(&vol);
        match removed {
            Some(r) => {
                r.shadow.stop().await;
                r.shadow.close().await;
                warn!("catalog sync of {:?} aborted in state {:?}", vol, r.state);
                Ok(())
            }
            None => Err(Error::SyncNotInProgress),
        }
    }

    pub async fn state(&self, vol: VolumeId) -> Option<ReceiverState> {
        self.vols.lock().await.get(&vol).map(|r| r.state)
    }

    pub async fn is_receiving(&self, vol: VolumeId) -> bool {
        self.vols.lock().await.contains_key(&vol)
    }
}

/// Counts progress of one migration for [MigrationProgress::spawn_watchdog].
#[derive(Clone, Default)]
pub struct MigrationProgress {
    seq: Arc<AtomicU64>,
    pending: Arc<AtomicU64>,
    finished: Arc<AtomicBool>,
}

impl MigrationProgress {
    pub fn new() -> MigrationProgress {
        Self::default()
    }

    pub fn seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn bump(&self) {
        self.seq.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_sent(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.bump();
    }

    pub fn record_done(&self) {
        let _ = self
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |p| p.checked_sub(1));
        self.bump();
    }

    pub fn finish(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Checks every `interval` and calls `handler` once if a whole interval
    /// passed with work pending and no progress. Stops when finished.
    pub fn spawn_watchdog<F>(&self, interval: Duration, handler: F) -> task::JoinHandle<()>
    where
        F: FnOnce() -> SyncBoxFuture<()> + Send + 'static,
    {
        let this = self.clone();
        task::spawn(async move {
            loop {
                let before = this.seq();
                task::sleep(interval).await;
                if this.is_finished() {
                    return;
                }
                if this.seq() == before && this.pending() > 0 {
                    warn!(
                        "migration stalled at seq {} with {} pending",
                        before,
                        this.pending()
                    );
                    handler().await;
                    return;
                }
            }
        })
    }
}

struct SendState {
    fsm: DmtMigrationFsm,
    // Commits made after the snapshot, held until the baseline lands.
    buffered: VecDeque<ForwardCatalogUpdateMsg>,
    // Forwarded commit ids not yet acknowledged.
    outstanding: BTreeSet<u64>,
    forwarded: u64,
    failed: Option<Error>,
    progress: MigrationProgress,
}

/// Source side of every migration this DM runs.
#[derive(Clone)]
pub struct CatSyncSender {
    self_id: ServiceId,
    inner: Arc<(Mutex<HashMap<VolumeId, SendState>>, Condvar)>,
}

impl CatSyncSender {
    pub fn new(self_id: ServiceId) -> CatSyncSender {
        CatSyncSender {
            self_id,
            inner: Arc::new((Mutex::new(HashMap::new()), Condvar::new())),
        }
    }

    pub async fn begin(&self, vol: VolumeId, dest: ServiceId) -> Result<MigrationProgress, Error> {
        let mut sends = self.inner.0.lock().await;
        if let Some(s) = sends.get(&vol) {
            if !s.fsm.state().is_terminal() {
                return Err(Error::SyncInProgress);
            }
        }
        let mut fsm = DmtMigrationFsm::new(vol, dest);
        fsm.fire(MigrationEvent::Prepare)?;
        let progress = MigrationProgress::new();
        sends.insert(
            vol,
            SendState {
                fsm,
                buffered: VecDeque::new(),
                outstanding: BTreeSet::new(),
                forwarded: 0,
                failed: None,
                progress: progress.clone(),
            },
        );
        info!("migrating {:?} to {:?}", vol, dest);
        Ok(progress)
    }

    pub async fn fire(
        &self,
        vol: VolumeId,
        event: MigrationEvent,
    ) -> Result<Option<MigrationAction>, Error> {
        let res = match self.inner.0.lock().await.get_mut(&vol) {
            Some(s) => s.fsm.fire(event),
            None => Err(Error::SyncNotInProgress),
        };
        self.inner.1.notify_all();
        res
    }

    pub async fn state(&self, vol: VolumeId) -> Option<MigrationState> {
        self.inner.0.lock().await.get(&vol).map(|s| s.fsm.state())
    }

    pub async fn dest(&self, vol: VolumeId) -> Option<ServiceId> {
        self.inner.0.lock().await.get(&vol).map(|s| s.fsm.dest)
    }

    pub async fn outstanding(&self, vol: VolumeId) -> usize {
        self.inner
            .0
            .lock()
            .await
            .get(&vol)
            .map_or(0, |s| s.outstanding.len())
    }

    pub async fn volumes(&self) -> Vec<VolumeId> {
        let mut v: Vec<VolumeId> = self.inner.0.lock().await.keys().copied().collect();
        v.sort();
        v
    }

    /// Called for every commit of `vol` that must reach the destination.
    /// Buffers it while the baseline is still in flight; once live, returns
    /// the message to send.
    pub async fn on_commit(
        &self,
        vol: VolumeId,
        op_id: u64,
        commit_id: u64,
        batch: &CommitBatch,
    ) -> Option<(ServiceId, ForwardCatalogUpdateMsg)> {
        let mut sends = self.inner.0.lock().await;
        let s = sends.get_mut(&vol)?;
        let msg = ForwardCatalogUpdateMsg {
            volume_id: vol,
            source: self.self_id,
            op_id,
            commit_id,
            batch: batch.clone(),
        };
        match s.fsm.state() {
            MigrationState::Preparing | MigrationState::Syncing => {
                s.buffered.push_back(msg);
                None
            }
            MigrationState::Forwarding => {
                s.outstanding.insert(commit_id);
                s.forwarded += 1;
                s.progress.record_sent();
                Some((s.fsm.dest, msg))
            }
            other => {
                debug!("{:?} commit {} not forwarded in {:?}", vol, commit_id, other);
                None
            }
        }
    }

    /// The baseline landed. Returns the destination and the buffered commits
    /// to send, in commit order.
    pub async fn go_live(
        &self,
        vol: VolumeId,
    ) -> Result<(ServiceId, Vec<ForwardCatalogUpdateMsg>), Error> {
        let mut sends = self.inner.0.lock().await;
        let s = sends.get_mut(&vol).ok_or(Error::SyncNotInProgress)?;
        s.fsm.fire(MigrationEvent::BaselineDone)?;
        let msgs: Vec<ForwardCatalogUpdateMsg> = s.buffered.drain(..).collect();
        for m in msgs.iter() {
            s.outstanding.insert(m.commit_id);
            s.forwarded += 1;
            s.progress.record_sent();
        }
        debug!("{:?} forwarding live, {} buffered commits", vol, msgs.len());
        Ok((s.fsm.dest, msgs))
    }

    pub async fn on_ack(&self, msg: &PushMetaSyncRespMsg) {
        {
            let mut sends = self.inner.0.lock().await;
            let s = match sends.get_mut(&msg.volume_id) {
                Some(s) => s,
                None => {
                    debug!("late forward ack for {:?}", msg.volume_id);
                    return;
                }
            };
            if s.outstanding.remove(&msg.commit_id) {
                s.progress.record_done();
            }
            if !msg.is_ok() {
                warn!(
                    "{:?} forwarded commit {} ({:?}) failed at destination: {} {}",
                    msg.volume_id, msg.commit_id, msg.tx_id, msg.result_code, msg.err_msg
                );
                s.failed.get_or_insert(Error::IllegalTransition(format!(
                    "forwarded commit {} rejected with {}",
                    msg.commit_id, msg.result_code
                )));
            }
        }
        self.inner.1.notify_all();
    }

    pub async fn on_send_failed(&self, vol: VolumeId, commit_id: u64, err: Error) {
        {
            let mut sends = self.inner.0.lock().await;
            if let Some(s) = sends.get_mut(&vol) {
                if s.outstanding.remove(&commit_id) {
                    s.progress.record_done();
                }
                s.failed.get_or_insert(err);
            }
        }
        self.inner.1.notify_all();
    }

    /// Waits until every forwarded commit of `vol` was acknowledged, failing
    /// if any of them wasn't applied or `timeout` passes first.
    pub async fn wait_drained(&self, vol: VolumeId, timeout: Duration) -> Result<(), Error> {
        let (lock, cvar) = &*self.inner;
        let wait = cvar.wait_until(lock.lock().await, |sends| match sends.get(&vol) {
            Some(s) => s.outstanding.is_empty() || s.failed.is_some(),
            None => true,
        });
        let guard = future::timeout(timeout, wait)
            .await
            .map_err(|_| Error::ReplicaTimeout)?;
        match guard.get(&vol) {
            Some(s) => match &s.failed {
                Some(e) => Err(e.clone()),
                None => {
                    debug!("{:?} all {} forwarded commits acked", vol, s.forwarded);
                    Ok(())
                }
            },
            None => Err(Error::SyncNotInProgress),
        }
    }

    /// Forgets a migration that reached a terminal state.
    pub async fn finish(&self, vol: VolumeId) {
        if let Some(s) = self.inner.0.lock().await.remove(&vol) {
            s.progress.finish();
            info!(
                "migration of {:?} ended {:?} after forwarding {} commits",
                vol,
                s.fsm.state(),
                s.forwarded
            );
        }
        self.inner.1.notify_all();
    }
}
