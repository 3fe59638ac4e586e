// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Disk-backed [CatalogBackend] on a fjall LSM keyspace, one partition per
//! volume. Batches commit through the keyspace journal so a multi-extent
//! write is atomic across a crash; snapshots are LSM sequence-number views
//! and never block writers.

use crate::{
    backend::{BatchOp, CatalogBackend, CatalogSnapshot},
    Error, VolumeId,
};
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use parking_lot::RwLock;
use std::{collections::HashMap, path::Path};
use tracing::{debug, info};

pub struct LsmBackend {
    keyspace: Keyspace,
    partitions: RwLock<HashMap<VolumeId, PartitionHandle>>,
    sync_writes: bool,
}

impl LsmBackend {
    /// Opens (or creates) the keyspace at `path`. With `sync_writes` every
    /// batch is fsynced before it is acknowledged.
    pub fn open<P: AsRef<Path>>(path: P, sync_writes: bool) -> Result<Self, Error> {
        let keyspace = fjall::Config::new(path.as_ref()).open()?;
        info!("opened catalog keyspace at {:?}", path.as_ref());
        Ok(LsmBackend {
            keyspace,
            partitions: RwLock::new(HashMap::new()),
            sync_writes,
        })
    }

    fn partition_name(vol: VolumeId) -> String {
        format!("vol_{}", vol.0)
    }

    fn handle(&self, vol: VolumeId) -> Result<PartitionHandle, Error> {
        if let Some(h) = self.partitions.read().get(&vol) {
            return Ok(h.clone());
        }
        let name = Self::partition_name(vol);
        if !self.keyspace.partition_exists(&name) {
            return Err(Error::VolNotFound);
        }
        let h = self
            .keyspace
            .open_partition(&name, PartitionCreateOptions::default())?;
        self.partitions.write().insert(vol, h.clone());
        Ok(h)
    }
}

struct LsmSnapshot(fjall::Snapshot);

impl CatalogSnapshot for LsmSnapshot {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.0.get(key).map_err(fjall::Error::from)?.map(|v| v.to_vec()))
    }

    fn for_each_prefix(
        &self,
        prefix: &[u8],
        f: &mut dyn FnMut(&[u8], &[u8]) -> Result<(), Error>,
    ) -> Result<(), Error> {
        for kv in self.0.prefix(prefix) {
            let (k, v) = kv.map_err(fjall::Error::from)?;
            f(&k, &v)?;
        }
        Ok(())
    }
}

impl CatalogBackend for LsmBackend {
    fn create_partition(&self, vol: VolumeId) -> Result<(), Error> {
        let name = Self::partition_name(vol);
        if self.keyspace.partition_exists(&name) {
            return Err(Error::VolumeExists);
        }
        let h = self
            .keyspace
            .open_partition(&name, PartitionCreateOptions::default())?;
        self.partitions.write().insert(vol, h);
        debug!("created partition {}", name);
        Ok(())
    }

    fn partition_exists(&self, vol: VolumeId) -> bool {
        self.partitions.read().contains_key(&vol)
            || self.keyspace.partition_exists(&Self::partition_name(vol))
    }

    fn drop_partition(&self, vol: VolumeId) -> Result<(), Error> {
        let h = self.handle(vol)?;
        self.partitions.write().remove(&vol);
        self.keyspace.delete_partition(h)?;
        debug!("dropped partition {}", Self::partition_name(vol));
        Ok(())
    }

    fn get(&self, vol: VolumeId, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.handle(vol)?.get(key)?.map(|v| v.to_vec()))
    }

    fn for_each_prefix(
        &self,
        vol: VolumeId,
        prefix: &[u8],
        f: &mut dyn FnMut(&[u8], &[u8]) -> Result<(), Error>,
    ) -> Result<(), Error> {
        for kv in self.handle(vol)?.prefix(prefix) {
            let (k, v) = kv.map_err(fjall::Error::from)?;
            f(&k, &v)?;
        }
        Ok(())
    }

    fn write_batch(&self, vol: VolumeId, ops: Vec<BatchOp>) -> Result<(), Error> {
        let h = self.handle(vol)?;
        let mut batch = self.keyspace.batch();
        for op in ops {
            match op {
                BatchOp::Put(k, v) => batch.insert(&h, k, v),
                BatchOp::Delete(k) => batch.remove(&h, k),
            }
        }
        batch.commit()?;
        if self.sync_writes {
            self.keyspace.persist(PersistMode::SyncAll)?;
        }
        Ok(())
    }

    fn snapshot(&self, vol: VolumeId) -> Result<Box<dyn CatalogSnapshot>, Error> {
        Ok(Box::new(LsmSnapshot(self.handle(vol)?.snapshot())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batches_persist_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let vol = VolumeId(3);
        {
            let be = LsmBackend::open(dir.path(), true).unwrap();
            be.create_partition(vol).unwrap();
            be.write_batch(
                vol,
                vec![
                    BatchOp::Put(b"a".to_vec(), b"1".to_vec()),
                    BatchOp::Put(b"b".to_vec(), b"2".to_vec()),
                ],
            )
            .unwrap();
            be.write_batch(vol, vec![BatchOp::Delete(b"a".to_vec())])
                .unwrap();
        }
        let be = LsmBackend::open(dir.path(), true).unwrap();
        assert!(be.partition_exists(vol));
        assert_eq!(be.get(vol, b"a").unwrap(), None);
        assert_eq!(be.get(vol, b"b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn snapshot_ignores_later_writes() {
        let dir = tempfile::tempdir().unwrap();
        let be = LsmBackend::open(dir.path(), false).unwrap();
        let vol = VolumeId(1);
        be.create_partition(vol).unwrap();
        be.write_batch(vol, vec![BatchOp::Put(b"k".to_vec(), b"old".to_vec())])
            .unwrap();
        let snap = be.snapshot(vol).unwrap();
        be.write_batch(vol, vec![BatchOp::Put(b"k2".to_vec(), b"x".to_vec())])
            .unwrap();
        let mut keys = Vec::new();
        snap.for_each_prefix(&[], &mut |k, _| {
            keys.push(k.to_vec());
            Ok(())
        })
        .unwrap();
        assert_eq!(keys, vec![b"k".to_vec()]);
    }

    #[test]
    fn dropped_partition_is_gone() {
        let dir = tempfile::tempdir().unwrap();
        let be = LsmBackend::open(dir.path(), false).unwrap();
        be.create_partition(VolumeId(5)).unwrap();
        assert_eq!(be.create_partition(VolumeId(5)), Err(Error::VolumeExists));
        be.drop_partition(VolumeId(5)).unwrap();
        assert!(!be.partition_exists(VolumeId(5)));
        assert_eq!(be.get(VolumeId(5), b"k"), Err(Error::VolNotFound));
    }
}
