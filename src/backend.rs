// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! A [CatalogBackend] is responsible for durable storage of catalog records.
//! It is a map of byte keys to byte values, partitioned by volume, that can
//! apply a batch of writes atomically and hand out point-in-time snapshots.
//! The [crate::VolumeCatalogStore] decides what the keys and values mean; the
//! backend only has to store them.
//!
//! Record keys are `[name_len:u16][blob name][extent id:u32]`, big-endian, so
//! all extents of one blob are adjacent and sort by extent id. The single byte
//! key [VOLUME_META_KEY] holds the volume-level record; no blob key is that
//! short.

use crate::{Error, ExtentId, VolumeId};
use parking_lot::{Mutex, RwLock};
use std::{
    collections::{BTreeMap, HashMap},
    convert::{TryFrom, TryInto},
    sync::Arc,
};
use tracing::{debug, warn};

pub const VOLUME_META_KEY: &[u8] = &[0xff];

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

pub fn blob_prefix(blob_name: &str) -> Result<Vec<u8>, Error> {
    let len = u16::try_from(blob_name.len())
        .map_err(|_| Error::Storage(format!("blob name of {} bytes", blob_name.len())))?;
    let mut key = Vec::with_capacity(2 + blob_name.len() + 4);
    key.extend_from_slice(&len.to_be_bytes());
    key.extend_from_slice(blob_name.as_bytes());
    Ok(key)
}

pub fn blob_key(blob_name: &str, extent_id: ExtentId) -> Result<Vec<u8>, Error> {
    let mut key = blob_prefix(blob_name)?;
    key.extend_from_slice(&extent_id.to_be_bytes());
    Ok(key)
}

/// Splits a record key into blob name and extent id; `None` for the volume
/// record or anything malformed.
pub fn decode_blob_key(key: &[u8]) -> Option<(String, ExtentId)> {
    if key.len() < 6 {
        return None;
    }
    let len = u16::from_be_bytes([key[0], key[1]]) as usize;
    if key.len() != 2 + len + 4 {
        return None;
    }
    let name = std::str::from_utf8(&key[2..2 + len]).ok()?.to_string();
    let id = u32::from_be_bytes(key[2 + len..].try_into().ok()?);
    Some((name, id))
}

/// A consistent read-only view of one volume's records.
pub trait CatalogSnapshot: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error>;

    /// Visits records whose key starts with `prefix`, in key order.
    fn for_each_prefix(
        &self,
        prefix: &[u8],
        f: &mut dyn FnMut(&[u8], &[u8]) -> Result<(), Error>,
    ) -> Result<(), Error>;
}

pub trait CatalogBackend: Send + Sync + 'static {
    /// Fails with [Error::VolumeExists] if the partition is already present.
    fn create_partition(&self, vol: VolumeId) -> Result<(), Error>;
    fn partition_exists(&self, vol: VolumeId) -> bool;
    fn drop_partition(&self, vol: VolumeId) -> Result<(), Error>;

    fn get(&self, vol: VolumeId, key: &[u8]) -> Result<Option<Vec<u8>>, Error>;

    fn for_each_prefix(
        &self,
        vol: VolumeId,
        prefix: &[u8],
        f: &mut dyn FnMut(&[u8], &[u8]) -> Result<(), Error>,
    ) -> Result<(), Error>;

    /// Applies every op or none of them.
    fn write_batch(&self, vol: VolumeId, ops: Vec<BatchOp>) -> Result<(), Error>;

    fn snapshot(&self, vol: VolumeId) -> Result<Box<dyn CatalogSnapshot>, Error>;

    /// Creates `dst` holding a point-in-time copy of `src`. Writers to `src`
    /// are only held off while the snapshot is taken.
    fn copy_partition(&self, src: VolumeId, dst: VolumeId, chunk: usize) -> Result<(), Error> {
        let snap = self.snapshot(src)?;
        self.create_partition(dst)?;
        let mut ops = Vec::with_capacity(chunk);
        let mut copied = 0usize;
        snap.for_each_prefix(&[], &mut |k, v| {
            ops.push(BatchOp::Put(k.to_vec(), v.to_vec()));
            if ops.len() >= chunk {
                copied += ops.len();
                self.write_batch(dst, std::mem::take(&mut ops))?;
            }
            Ok(())
        })?;
        copied += ops.len();
        if !ops.is_empty() {
            self.write_batch(dst, ops)?;
        }
        debug!("copied {} records from {:?} to {:?}", copied, src, dst);
        Ok(())
    }
}

type Partition = BTreeMap<Vec<u8>, Vec<u8>>;

/// In-process backend. Batches are applied to a private copy of the partition
/// that replaces the live one only once every op succeeded; snapshots share
/// the live copy.
pub struct MemoryBackend {
    partitions: RwLock<HashMap<VolumeId, Arc<Partition>>>,
    // One-shot fault: the next batch fails after applying this many ops.
    fault: Mutex<Option<usize>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        MemoryBackend {
            partitions: RwLock::new(HashMap::new()),
            fault: Mutex::new(None),
        }
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next [CatalogBackend::write_batch] fail part way, after `ops`
    /// of its ops were applied.
    pub fn fail_batch_after(&self, ops: usize) {
        *self.fault.lock() = Some(ops);
    }

    fn partition(&self, vol: VolumeId) -> Result<Arc<Partition>, Error> {
        self.partitions
            .read()
            .get(&vol)
            .cloned()
            .ok_or(Error::VolNotFound)
    }
}

struct MemorySnapshot(Arc<Partition>);

impl CatalogSnapshot for MemorySnapshot {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.0.get(key).cloned())
    }

    fn for_each_prefix(
        &self,
        prefix: &[u8],
        f: &mut dyn FnMut(&[u8], &[u8]) -> Result<(), Error>,
    ) -> Result<(), Error> {
        for (k, v) in self.0.range(prefix.to_vec()..) {
            if !k.starts_with(prefix) {
                break;
            }
            f(k, v)?;
        }
        Ok(())
    }
}

impl CatalogBackend for MemoryBackend {
    fn create_partition(&self, vol: VolumeId) -> Result<(), Error> {
        let mut guard = self.partitions.write();
        if guard.contains_key(&vol) {
            return Err(Error::VolumeExists);
        }
        guard.insert(vol, Arc::new(BTreeMap::new()));
        Ok(())
    }

    fn partition_exists(&self, vol: VolumeId) -> bool {
        self.partitions.read().contains_key(&vol)
    }

    fn drop_partition(&self, vol: VolumeId) -> Result<(), Error> {
        match self.partitions.write().remove(&vol) {
            Some(_) => Ok(()),
            None => Err(Error::VolNotFound),
        }
    }

    fn get(&self, vol: VolumeId, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.partition(vol)?.get(key).cloned())
    }

    fn for_each_prefix(
        &self,
        vol: VolumeId,
        prefix: &[u8],
        f: &mut dyn FnMut(&[u8], &[u8]) -> Result<(), Error>,
    ) -> Result<(), Error> {
        MemorySnapshot(self.partition(vol)?).for_each_prefix(prefix, f)
    }

    fn write_batch(&self, vol: VolumeId, ops: Vec<BatchOp>) -> Result<(), Error> {
        let mut guard = self.partitions.write();
        let live = guard.get_mut(&vol).ok_or(Error::VolNotFound)?;
        let mut staged: Partition = (**live).clone();
        let fault = self.fault.lock().take();
        for (i, op) in ops.into_iter().enumerate() {
            if fault == Some(i) {
                warn!("injected fault after {} ops of batch on {:?}", i, vol);
                return Err(Error::Storage("injected fault".to_string()));
            }
            match op {
                BatchOp::Put(k, v) => {
                    staged.insert(k, v);
                }
                BatchOp::Delete(k) => {
                    staged.remove(&k);
                }
            }
        }
        *live = Arc::new(staged);
        Ok(())
    }

    fn snapshot(&self, vol: VolumeId) -> Result<Box<dyn CatalogSnapshot>, Error> {
        Ok(Box::new(MemorySnapshot(self.partition(vol)?)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_keys_round_trip_and_group_by_blob() {
        let k0 = blob_key("a", 0).unwrap();
        let k1 = blob_key("a", 1).unwrap();
        let kb = blob_key("ab", 0).unwrap();
        assert_eq!(decode_blob_key(&k1), Some(("a".to_string(), 1)));
        assert!(k0 < k1);
        assert!(k0.starts_with(&blob_prefix("a").unwrap()));
        assert!(!kb.starts_with(&blob_prefix("a").unwrap()));
        assert_eq!(decode_blob_key(VOLUME_META_KEY), None);
    }

    #[test]
    fn failed_batch_leaves_partition_untouched() {
        let be = MemoryBackend::new();
        let vol = VolumeId(1);
        be.create_partition(vol).unwrap();
        be.write_batch(vol, vec![BatchOp::Put(b"k0".to_vec(), b"v0".to_vec())])
            .unwrap();
        be.fail_batch_after(1);
        let res = be.write_batch(
            vol,
            vec![
                BatchOp::Put(b"k1".to_vec(), b"v1".to_vec()),
                BatchOp::Delete(b"k0".to_vec()),
            ],
        );
        assert!(matches!(res, Err(Error::Storage(_))));
        assert_eq!(be.get(vol, b"k0").unwrap(), Some(b"v0".to_vec()));
        assert_eq!(be.get(vol, b"k1").unwrap(), None);
    }

    #[test]
    fn snapshot_is_isolated_from_later_writes() {
        let be = MemoryBackend::new();
        let vol = VolumeId(1);
        be.create_partition(vol).unwrap();
        be.write_batch(vol, vec![BatchOp::Put(b"k".to_vec(), b"old".to_vec())])
            .unwrap();
        let snap = be.snapshot(vol).unwrap();
        be.write_batch(vol, vec![BatchOp::Put(b"k".to_vec(), b"new".to_vec())])
            .unwrap();
        assert_eq!(snap.get(b"k").unwrap(), Some(b"old".to_vec()));
        assert_eq!(be.get(vol, b"k").unwrap(), Some(b"new".to_vec()));
    }

    #[test]
    fn copy_partition_copies_everything() {
        let be = MemoryBackend::new();
        be.create_partition(VolumeId(1)).unwrap();
        let ops = (0..10u8)
            .map(|i| BatchOp::Put(vec![i], vec![i, i]))
            .collect();
        be.write_batch(VolumeId(1), ops).unwrap();
        be.copy_partition(VolumeId(1), VolumeId(2), 3).unwrap();
        let mut n = 0;
        be.for_each_prefix(VolumeId(2), &[], &mut |k, v| {
            assert_eq!(v, &[k[0], k[0]][..]);
            n += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(n, 10);
        assert_eq!(
            be.copy_partition(VolumeId(1), VolumeId(2), 3),
            Err(Error::VolumeExists)
        );
    }
}
