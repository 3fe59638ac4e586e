// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Tracks blob transactions between StartTx and Commit/Abort.
//!
//! Each [TxDescriptor] is owned by the [TransactionManager]'s map for its whole
//! life. Commit and abort both begin by removing it under the map's write lock,
//! and the caller that got it out owns it: that is what makes a commit happen at
//! most once per transaction id even when two callers race.
//!
//! The staged offset and object maps are a bounded read-your-writes cache. The
//! authoritative record of what a transaction changes is its update journal,
//! which becomes the [CommitBatch].

use crate::{
    BlobOpType, CommitBatch, DmtVersion, Error, ObjectId, OffsetUpdate, SequenceId, TxId,
    VolumeId,
};
use async_std::sync::{Arc, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use tracing::{debug, trace, warn};

/// Uniquely names one staged mapping within a transaction.
#[derive(Clone, Debug, PartialOrd, Ord, PartialEq, Eq, Hash)]
pub struct BlobOffsetPair {
    pub blob_name: String,
    pub offset: u64,
}

/// The not-yet-committed view of the blob a transaction mutates.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StagedBlobDesc {
    pub volume_id: VolumeId,
    pub blob_name: String,
    pub blob_version: u64,
    pub blob_size: Option<u64>,
    pub meta: BTreeMap<String, String>,
    pub op: BlobOpType,
    /// The committed blob ends where the last staged write ends.
    pub truncate: bool,
}

/// The ways a staged descriptor can be updated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DescUpdate {
    /// Metadata as a list of pairs, as carried on the wire.
    MetaList(Vec<(String, String)>),
    Map(BTreeMap<String, String>),
    Size(u64),
    /// Replace rather than overwrite: drop everything past the staged data.
    Truncate,
}

#[derive(Debug)]
pub struct TxDescriptor {
    pub volume_id: VolumeId,
    pub tx_id: TxId,
    /// Placement table version current when the transaction started.
    pub origin_dmt_version: DmtVersion,
    pub desc: StagedBlobDesc,
    staged_offsets: BTreeMap<BlobOffsetPair, ObjectId>,
    staged_objects: HashMap<ObjectId, Vec<u8>>,
    journal: Vec<OffsetUpdate>,
    // Every offset in the journal, cached or not.
    journaled: BTreeSet<u64>,
    max_staged: usize,
    overflow_warned: bool,
}

impl TxDescriptor {
    fn new(
        volume_id: VolumeId,
        tx_id: TxId,
        origin_dmt_version: DmtVersion,
        blob_name: &str,
        max_staged: usize,
    ) -> TxDescriptor {
        TxDescriptor {
            volume_id,
            tx_id,
            origin_dmt_version,
            desc: StagedBlobDesc {
                volume_id,
                blob_name: blob_name.to_string(),
                ..Default::default()
            },
            staged_offsets: BTreeMap::new(),
            staged_objects: HashMap::new(),
            journal: Vec::new(),
            journaled: BTreeSet::new(),
            max_staged,
            overflow_warned: false,
        }
    }

    fn note_overflow(&mut self, what: &str) {
        if !self.overflow_warned {
            warn!(
                "{:?} exceeded {} staged entries; further {} are not cached",
                self.tx_id, self.max_staged, what
            );
            self.overflow_warned = true;
        }
    }

    fn stage_offset(&mut self, blob_name: &str, update: OffsetUpdate) -> Result<(), Error> {
        assert_eq!(
            blob_name, self.desc.blob_name,
            "{:?} staged an offset of another blob",
            self.tx_id
        );
        assert_eq!(
            self.desc.op,
            BlobOpType::Put,
            "{:?} staged data for a {:?} transaction",
            self.tx_id,
            self.desc.op
        );
        if update.offset.checked_add(u64::from(update.size)).is_none() {
            return Err(Error::OffsetOutOfRange);
        }
        assert!(
            self.journaled.insert(update.offset),
            "{:?} staged {}@{} twice",
            self.tx_id,
            blob_name,
            update.offset
        );
        if self.staged_offsets.len() < self.max_staged {
            let pair = BlobOffsetPair {
                blob_name: blob_name.to_string(),
                offset: update.offset,
            };
            self.staged_offsets.insert(pair, update.object_id);
        } else {
            self.note_overflow("offsets");
        }
        self.journal.push(update);
        Ok(())
    }

    fn stage_object(&mut self, object_id: ObjectId, payload: Vec<u8>) {
        assert_eq!(
            self.desc.op,
            BlobOpType::Put,
            "{:?} staged an object for a {:?} transaction",
            self.tx_id,
            self.desc.op
        );
        if self.staged_objects.len() < self.max_staged
            || self.staged_objects.contains_key(&object_id)
        {
            self.staged_objects.insert(object_id, payload);
        } else {
            self.note_overflow("objects");
        }
    }

    fn stage_desc(&mut self, update: DescUpdate) {
        match update {
            DescUpdate::MetaList(pairs) => self.desc.meta.extend(pairs),
            DescUpdate::Map(map) => self.desc.meta.extend(map),
            DescUpdate::Size(size) => self.desc.blob_size = Some(size),
            DescUpdate::Truncate => self.desc.truncate = true,
        }
    }

    pub fn staged_offset(&self, blob_name: &str, offset: u64) -> Option<ObjectId> {
        self.staged_offsets
            .get(&BlobOffsetPair {
                blob_name: blob_name.to_string(),
                offset,
            })
            .copied()
    }

    pub fn staged_object(&self, object_id: &ObjectId) -> Option<&[u8]> {
        self.staged_objects.get(object_id).map(|v| v.as_slice())
    }

    pub fn journal_len(&self) -> usize {
        self.journal.len()
    }

    /// Consumes the transaction into the batch handed to the catalog, plus the
    /// staged object payloads whose ownership moves on to the object cache.
    pub fn into_commit(
        self,
        sequence_id: SequenceId,
    ) -> (CommitBatch, Vec<(ObjectId, Vec<u8>)>) {
        let end = self
            .journal
            .iter()
            .filter_map(|u| u.offset.checked_add(u64::from(u.size)))
            .max()
            .unwrap_or(0);
        let size = match (self.desc.blob_size, self.desc.truncate) {
            (Some(size), _) => Some(size),
            (None, true) => Some(end),
            (None, false) => None,
        };
        let batch = CommitBatch {
            blob_name: self.desc.blob_name,
            tx_id: self.tx_id,
            op: self.desc.op,
            sequence_id,
            dmt_version: self.origin_dmt_version,
            offsets: self.journal,
            meta: self.desc.meta,
            size,
        };
        (batch, self.staged_objects.into_iter().collect())
    }
}

/// The map of in-flight transactions. Clones share the map.
#[derive(Clone)]
pub struct TransactionManager {
    txs: Arc<RwLock<HashMap<TxId, TxDescriptor>>>,
    max_staged: usize,
}

impl TransactionManager {
    pub fn new(max_staged_entries: usize) -> TransactionManager {
        TransactionManager {
            txs: Arc::new(RwLock::new(HashMap::new())),
            max_staged: max_staged_entries,
        }
    }

    pub async fn add_tx(
        &self,
        volume_id: VolumeId,
        tx_id: TxId,
        dmt_version: DmtVersion,
        blob_name: &str,
    ) -> Result<(), Error> {
        let mut txs = self.txs.write().await;
        if txs.contains_key(&tx_id) {
            return Err(Error::DuplicateUuid);
        }
        txs.insert(
            tx_id,
            TxDescriptor::new(volume_id, tx_id, dmt_version, blob_name, self.max_staged),
        );
        debug!("opened {:?} on {:?}/{}", tx_id, volume_id, blob_name);
        Ok(())
    }

    /// Takes the transaction out of the map. Whoever gets `Ok` owns the commit
    /// or abort; everyone after sees [Error::NotFound].
    pub async fn remove_tx(&self, tx_id: TxId) -> Result<TxDescriptor, Error> {
        let removed = self.txs.write().await.remove(&tx_id);
        match removed {
            Some(tx) => {
                trace!("removed {:?}", tx_id);
                Ok(tx)
            }
            None => Err(Error::NotFound),
        }
    }

    async fn with_tx_mut<T>(
        &self,
        tx_id: TxId,
        f: impl FnOnce(&mut TxDescriptor) -> T,
    ) -> Result<T, Error> {
        let mut txs = self.txs.write().await;
        match txs.get_mut(&tx_id) {
            Some(tx) => Ok(f(tx)),
            None => Err(Error::NotFound),
        }
    }

    async fn with_tx<T>(&self, tx_id: TxId, f: impl FnOnce(&TxDescriptor) -> T) -> Result<T, Error> {
        let txs = self.txs.read().await;
        match txs.get(&tx_id) {
            Some(tx) => Ok(f(tx)),
            None => Err(Error::NotFound),
        }
    }

    /// Stages one offset mapping. An update whose end does not fit in a u64
    /// is [Error::OffsetOutOfRange]. Staging the same blob offset twice in one
    /// transaction is a protocol violation and panics, whether or not the
    /// first one is still cached.
    pub async fn update_staged_blob_offset(
        &self,
        tx_id: TxId,
        blob_name: &str,
        update: OffsetUpdate,
    ) -> Result<(), Error> {
        self.with_tx_mut(tx_id, |tx| tx.stage_offset(blob_name, update))
            .await?
    }

    /// Stages an object payload; it moves to the object cache at commit.
    pub async fn update_staged_blob_object(
        &self,
        tx_id: TxId,
        object_id: ObjectId,
        payload: Vec<u8>,
    ) -> Result<(), Error> {
        self.with_tx_mut(tx_id, |tx| tx.stage_object(object_id, payload))
            .await
    }

    pub async fn update_staged_blob_desc(
        &self,
        tx_id: TxId,
        update: DescUpdate,
    ) -> Result<(), Error> {
        self.with_tx_mut(tx_id, |tx| tx.stage_desc(update)).await
    }

    /// Changes the transaction's operation. Only PUT to DELETE is legal;
    /// setting the current op again is a no-op.
    pub async fn update_tx_op_type(&self, tx_id: TxId, op: BlobOpType) -> Result<(), Error> {
        self.with_tx_mut(tx_id, |tx| match (tx.desc.op, op) {
            (cur, new) if cur == new => (),
            (BlobOpType::Put, BlobOpType::Delete) => {
                debug!("{:?} becomes a delete", tx_id);
                tx.desc.op = BlobOpType::Delete;
            }
            (cur, new) => panic!("{:?}: illegal op change {:?} -> {:?}", tx_id, cur, new),
        })
        .await
    }

    pub async fn get_staged_blob_desc(&self, tx_id: TxId) -> Result<StagedBlobDesc, Error> {
        self.with_tx(tx_id, |tx| tx.desc.clone()).await
    }

    pub async fn get_tx_dmt_version(&self, tx_id: TxId) -> Result<DmtVersion, Error> {
        self.with_tx(tx_id, |tx| tx.origin_dmt_version).await
    }

    pub async fn get_staged_offset(
        &self,
        tx_id: TxId,
        blob_name: &str,
        offset: u64,
    ) -> Result<Option<ObjectId>, Error> {
        self.with_tx(tx_id, |tx| tx.staged_offset(blob_name, offset))
            .await
    }

    pub async fn contains(&self, tx_id: TxId) -> bool {
        self.txs.read().await.contains_key(&tx_id)
    }

    pub async fn len(&self) -> usize {
        self.txs.read().await.len()
    }

    /// Drops every transaction of `vol`, for a volume this DM no longer holds.
    pub async fn remove_volume_txs(&self, vol: VolumeId) -> usize {
        let mut txs = self.txs.write().await;
        let before = txs.len();
        txs.retain(|_, tx| tx.volume_id != vol);
        before - txs.len()
    }

    /// Transactions of `vol`, in id order.
    pub async fn txs_of_volume(&self, vol: VolumeId) -> Vec<TxId> {
        let mut ids: Vec<TxId> = self
            .txs
            .read()
            .await
            .values()
            .filter(|tx| tx.volume_id == vol)
            .map(|tx| tx.tx_id)
            .collect();
        ids.sort();
        ids
    }
}

/// Bounded FIFO of committed object payloads. Payloads are moved in, never
/// shared with the transaction that staged them.
#[derive(Debug)]
pub struct ObjectCache {
    capacity: usize,
    order: VecDeque<ObjectId>,
    objects: HashMap<ObjectId, Vec<u8>>,
}

impl ObjectCache {
    pub fn new(capacity: usize) -> ObjectCache {
        ObjectCache {
            capacity,
            order: VecDeque::new(),
            objects: HashMap::new(),
        }
    }

    pub fn insert(&mut self, object_id: ObjectId, payload: Vec<u8>) {
        if self.capacity == 0 {
            return;
        }
        if self.objects.insert(object_id, payload).is_none() {
            self.order.push_back(object_id);
        }
        while self.objects.len() > self.capacity {
            match self.order.pop_front() {
                Some(old) => {
                    self.objects.remove(&old);
                }
                None => break,
            }
        }
    }

    pub fn get(&self, object_id: &ObjectId) -> Option<&[u8]> {
        self.objects.get(object_id).map(|v| v.as_slice())
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}
