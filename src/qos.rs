// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Ordered execution queues.
//!
//! A [SerialQueue] runs the futures submitted to it one at a time, in
//! submission order, on its own task. It can be created stopped, in which case
//! it accepts work but runs none of it until activated; catalog sync uses that
//! to buffer forwarded updates behind a baseline that hasn't landed yet.
//!
//! A [LaneExecutor] hands out one queue per (volume, [LaneKey]): operations of
//! one transaction share a lane, all commits of a volume share the commit lane,
//! and everything else runs concurrently.

use crate::{Error, SyncBoxFuture, TxId, VolumeId};
use async_std::{
    sync::{Arc, Condvar, Mutex},
    task,
};
use futures::{channel::oneshot, Future};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, trace};

struct QueueState {
    jobs: VecDeque<SyncBoxFuture<()>>,
    active: bool,
    closed: bool,
    running: bool,
}

#[derive(Clone)]
pub struct SerialQueue {
    name: Arc<String>,
    inner: Arc<(Mutex<QueueState>, Condvar)>,
}

impl SerialQueue {
    /// Starts a queue and its worker task. A queue created inactive holds
    /// its jobs until [SerialQueue::activate] is called.
    pub fn new(name: String, active: bool) -> SerialQueue {
        let q = SerialQueue {
            name: Arc::new(name),
            inner: Arc::new((
                Mutex::new(QueueState {
                    jobs: VecDeque::new(),
                    active,
                    closed: false,
                    running: false,
                }),
                Condvar::new(),
            )),
        };
        let worker = q.clone();
        task::spawn(async move { worker.run().await });
        q
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn run(self) {
        let (lock, cvar) = &*self.inner;
        loop {
            let job = {
                let mut guard = cvar
                    .wait_until(lock.lock().await, |s| {
                        s.closed || (s.active && !s.jobs.is_empty())
                    })
                    .await;
                if guard.active && !guard.jobs.is_empty() {
                    guard.running = true;
                    guard.jobs.pop_front()
                } else {
                    let dropped = guard.jobs.len();
                    guard.jobs.clear();
                    if dropped > 0 {
                        debug!("queue {} closed with {} jobs unrun", self.name, dropped);
                    }
                    None
                }
            };
            match job {
                Some(job) => {
                    job.await;
                    lock.lock().await.running = false;
                    cvar.notify_all();
                }
                None => {
                    cvar.notify_all();
                    trace!("queue {} worker exiting", self.name);
                    return;
                }
            }
        }
    }

    pub async fn enqueue<F>(&self, job: F) -> Result<(), Error>
    where
        F: Future<Output = ()> + Send + Sync + 'static,
    {
        let (lock, cvar) = &*self.inner;
        {
            let mut guard = lock.lock().await;
            if guard.closed {
                return Err(Error::ShuttingDown);
            }
            guard.jobs.push_back(Box::pin(job));
        }
        cvar.notify_all();
        Ok(())
    }

    /// Enqueues `job` and returns a future of its output. The output is
    /// [Error::ShuttingDown] if the queue closes before the job ran.
    pub fn enqueue_with_result<T, F>(&self, job: F) -> SyncBoxFuture<Result<T, Error>>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + Sync + 'static,
    {
        let this = self.clone();
        Box::pin(async move {
            let (tx, rx) = oneshot::channel();
            this.enqueue(async move {
                let _ = tx.send(job.await);
            })
            .await?;
            rx.await.map_err(|_| Error::ShuttingDown)
        })
    }

    pub async fn activate(&self) {
        let (lock, cvar) = &*self.inner;
        lock.lock().await.active = true;
        cvar.notify_all();
        debug!("queue {} activated", self.name);
    }

    pub async fn stop(&self) {
        self.inner.0.lock().await.active = false;
        debug!("queue {} stopped", self.name);
    }

    pub async fn is_active(&self) -> bool {
        self.inner.0.lock().await.active
    }

    /// Refuses further jobs. Queued jobs still run if the queue is active
    /// and are dropped otherwise.
    pub async fn close(&self) {
        let (lock, cvar) = &*self.inner;
        lock.lock().await.closed = true;
        cvar.notify_all();
    }

    /// Jobs queued and not yet started.
    pub async fn pending(&self) -> usize {
        self.inner.0.lock().await.jobs.len()
    }

    /// Waits until nothing is queued or running.
    pub async fn wait_idle(&self) {
        let (lock, cvar) = &*self.inner;
        let _guard = cvar
            .wait_until(lock.lock().await, |s| {
                !s.running && (s.jobs.is_empty() || !s.active)
            })
            .await;
    }
}

/// Which ordered lane of a volume an operation runs on.
#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash)]
pub enum LaneKey {
    Tx(TxId),
    Commit,
}

#[derive(Clone, Default)]
pub struct LaneExecutor {
    lanes: Arc<Mutex<HashMap<(VolumeId, LaneKey), SerialQueue>>>,
}

impl LaneExecutor {
    pub fn new() -> LaneExecutor {
        Self::default()
    }

    async fn lane(&self, vol: VolumeId, key: LaneKey) -> SerialQueue {
        self.lanes
            .lock()
            .await
            .entry((vol, key))
            .or_insert_with(|| SerialQueue::new(format!("{:?}/{:?}", vol, key), true))
            .clone()
    }

    /// Runs `job` on the lane after everything submitted to it earlier.
    pub fn submit<T, F>(&self, vol: VolumeId, key: LaneKey, job: F) -> SyncBoxFuture<Result<T, Error>>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + Sync + 'static,
    {
        let this = self.clone();
        Box::pin(async move { this.lane(vol, key).await.enqueue_with_result(job).await })
    }

    /// Closes a lane once its last job is done, for transaction lanes after
    /// commit or abort.
    pub async fn retire(&self, vol: VolumeId, key: LaneKey) {
        let lane = self.lanes.lock().await.remove(&(vol, key));
        if let Some(lane) = lane {
            lane.close().await;
        }
    }

    pub async fn retire_volume(&self, vol: VolumeId) {
        let lanes: Vec<SerialQueue> = {
            let mut guard = self.lanes.lock().await;
            let keys: Vec<_> = guard.keys().filter(|(v, _)| *v == vol).copied().collect();
            keys.into_iter().filter_map(|k| guard.remove(&k)).collect()
        };
        for lane in lanes {
            lane.close().await;
        }
    }

    pub async fn lane_count(&self) -> usize {
        self.lanes.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_std::future::timeout;
    use std::time::Duration;

    #[test]
    fn jobs_run_in_submission_order() {
        task::block_on(async {
            let q = SerialQueue::new("t".into(), true);
            let seen = Arc::new(Mutex::new(Vec::new()));
            for i in 0..10 {
                let seen = seen.clone();
                q.enqueue(async move {
                    if i % 3 == 0 {
                        task::sleep(Duration::from_millis(2)).await;
                    }
                    seen.lock().await.push(i);
                })
                .await
                .unwrap();
            }
            q.wait_idle().await;
            assert_eq!(*seen.lock().await, (0..10).collect::<Vec<_>>());
        })
    }

    #[test]
    fn stopped_queue_buffers_until_activated() {
        task::block_on(async {
            let q = SerialQueue::new("shadow".into(), false);
            let r = q.enqueue_with_result(async { 42 });
            assert_eq!(q.pending().await, 0);
            let r = task::spawn(r);
            task::sleep(Duration::from_millis(20)).await;
            assert_eq!(q.pending().await, 1);
            q.activate().await;
            assert_eq!(r.await, Ok(42));
        })
    }

    #[test]
    fn closed_queue_refuses_and_drops() {
        task::block_on(async {
            let q = SerialQueue::new("c".into(), false);
            let r = task::spawn(q.enqueue_with_result(async { 1 }));
            task::sleep(Duration::from_millis(20)).await;
            q.close().await;
            assert_eq!(r.await, Err(Error::ShuttingDown));
            assert_eq!(q.enqueue(async {}).await, Err(Error::ShuttingDown));
        })
    }

    #[test]
    fn lanes_order_within_and_overlap_across() {
        task::block_on(async {
            let ex = LaneExecutor::new();
            let vol = VolumeId(1);
            // A slow job on one transaction lane doesn't hold up another lane.
            let slow = ex.submit(vol, LaneKey::Tx(TxId(1)), async {
                task::sleep(Duration::from_millis(200)).await;
                1
            });
            let slow = task::spawn(slow);
            let fast = ex.submit(vol, LaneKey::Tx(TxId(2)), async { 2 });
            assert_eq!(
                timeout(Duration::from_millis(100), fast).await,
                Ok(Ok(2))
            );
            let after = ex.submit(vol, LaneKey::Tx(TxId(1)), async { 3 });
            assert_eq!(after.await, Ok(3));
            assert_eq!(slow.await, Ok(1));
            assert_eq!(ex.lane_count().await, 2);
            ex.retire(vol, LaneKey::Tx(TxId(1))).await;
            ex.retire_volume(vol).await;
            assert_eq!(ex.lane_count().await, 0);
        })
    }
}
