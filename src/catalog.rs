// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The [VolumeCatalogStore] owns the extent records of every volume on this
//! DM. It is the only writer of its [CatalogBackend], and every mutation of a
//! blob becomes exactly one atomic backend batch: the blob's extent 0, the data
//! extents it touched (empty ones as deletions) and, when the caller supplies
//! it, the volume record with its advanced watermarks.
//!
//! Callers serialize commits per volume; the store itself only guards its own
//! bookkeeping. Reads never take a lock that a commit holds while writing.

use crate::{
    backend::{
        blob_key, blob_prefix, decode_blob_key, BatchOp, CatalogBackend, CatalogSnapshot,
        VOLUME_META_KEY,
    },
    BlobExtent, BlobMeta, BlobOpType, DmConfig, DmtVersion, Error, ExtentGeometry, ExtentId,
    MemoryBackend, ObjectId, SequenceId, TxId, VolumeDesc, VolumeId, VolumeMeta, META_EXTENT_ID,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::{
    collections::{btree_map::Entry, BTreeMap, BTreeSet, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tracing::{debug, info, trace};

/// One staged offset mapping as it travels from a transaction to the catalog.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetUpdate {
    pub offset: u64,
    pub size: u32,
    pub object_id: ObjectId,
}

/// Everything one committed transaction changes about one blob. This is also
/// the unit that is replicated, logged and forwarded.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitBatch {
    pub blob_name: String,
    pub tx_id: TxId,
    pub op: BlobOpType,
    pub sequence_id: SequenceId,
    pub dmt_version: DmtVersion,
    /// Offset updates in the order they were staged; later ones win.
    pub offsets: Vec<OffsetUpdate>,
    /// Metadata entries to set on the blob.
    pub meta: BTreeMap<String, String>,
    /// Explicit new size; mappings past it are removed.
    pub size: Option<u64>,
}

impl CommitBatch {
    pub fn new(blob_name: &str, tx_id: TxId) -> CommitBatch {
        CommitBatch {
            blob_name: blob_name.to_string(),
            tx_id,
            ..Default::default()
        }
    }

    fn end_offset(&self) -> Result<u64, Error> {
        self.offsets.iter().try_fold(0, |end, u| {
            u.offset
                .checked_add(u64::from(u.size))
                .map(|e| end.max(e))
                .ok_or(Error::OffsetOutOfRange)
        })
    }
}

/// Result of applying a [CommitBatch].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppliedCommit {
    pub meta: BlobMeta,
    /// Objects no longer referenced by the blob after truncation or delete.
    pub expunged: Vec<ObjectId>,
}

#[derive(Clone, Copy, Debug, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotId(pub u64);

/// A raw catalog record, as shipped during catalog sync.
pub type CatalogRecord = (Vec<u8>, Vec<u8>);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CatalogState {
    Closed,
    Open,
}

#[derive(Clone, Debug)]
struct VolumeCatalog {
    desc: VolumeDesc,
    geometry: ExtentGeometry,
    state: CatalogState,
    deleted: bool,
    read_only: bool,
}

impl VolumeCatalog {
    fn closed(vm: &VolumeMeta, cfg: &DmConfig) -> VolumeCatalog {
        VolumeCatalog {
            desc: vm.desc.clone(),
            geometry: ExtentGeometry::for_volume(vm.desc.max_object_size_bytes, cfg),
            state: CatalogState::Closed,
            deleted: vm.deleted,
            read_only: vm.read_only,
        }
    }
}

pub struct VolumeCatalogStore {
    backend: Arc<dyn CatalogBackend>,
    config: DmConfig,
    volumes: RwLock<HashMap<VolumeId, VolumeCatalog>>,
    snapshots: Mutex<HashMap<SnapshotId, (VolumeId, Arc<dyn CatalogSnapshot>)>>,
    next_snapshot: AtomicU64,
}

impl VolumeCatalogStore {
    pub fn new(backend: Arc<dyn CatalogBackend>, config: DmConfig) -> Result<Self, Error> {
        config.validate()?;
        Ok(VolumeCatalogStore {
            backend,
            config,
            volumes: RwLock::new(HashMap::new()),
            snapshots: Mutex::new(HashMap::new()),
            next_snapshot: AtomicU64::new(1),
        })
    }

    pub fn in_memory(config: DmConfig) -> Result<Self, Error> {
        Self::new(Arc::new(MemoryBackend::new()), config)
    }

    pub fn config(&self) -> &DmConfig {
        &self.config
    }

    fn catalog(&self, vol: VolumeId) -> Result<VolumeCatalog, Error> {
        self.volumes
            .read()
            .get(&vol)
            .cloned()
            .ok_or(Error::VolNotFound)
    }

    fn readable(&self, vol: VolumeId) -> Result<VolumeCatalog, Error> {
        let cat = self.catalog(vol)?;
        if cat.state != CatalogState::Open {
            return Err(Error::NotReady);
        }
        Ok(cat)
    }

    fn writable(&self, vol: VolumeId) -> Result<VolumeCatalog, Error> {
        let cat = self.readable(vol)?;
        if cat.read_only {
            return Err(Error::ReadOnly);
        }
        if cat.deleted {
            return Err(Error::NotReady);
        }
        Ok(cat)
    }

    pub fn geometry(&self, vol: VolumeId) -> Result<ExtentGeometry, Error> {
        Ok(self.catalog(vol)?.geometry)
    }

    pub fn is_open(&self, vol: VolumeId) -> bool {
        matches!(self.volumes.read().get(&vol), Some(c) if c.state == CatalogState::Open)
    }

    pub fn volume_ids(&self) -> Vec<VolumeId> {
        let mut ids: Vec<VolumeId> = self.volumes.read().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Creates the persistent catalog of a new volume, closed. Creating a
    /// volume twice is a caller error and reported as [Error::VolumeExists].
    pub fn create_catalog(&self, desc: &VolumeDesc) -> Result<(), Error> {
        if desc.max_object_size_bytes == 0 {
            return Err(Error::InvalidConfig(format!(
                "{:?} has a zero max object size",
                desc.volume_id
            )));
        }
        let vol = desc.volume_id;
        let mut vols = self.volumes.write();
        if vols.contains_key(&vol) || self.backend.partition_exists(vol) {
            return Err(Error::VolumeExists);
        }
        self.backend.create_partition(vol)?;
        let vm = VolumeMeta::new(desc.clone());
        self.backend
            .write_batch(vol, vec![BatchOp::Put(VOLUME_META_KEY.to_vec(), vm.encode()?)])?;
        vols.insert(vol, VolumeCatalog::closed(&vm, &self.config));
        info!("created catalog for {:?} ({})", vol, desc.name);
        Ok(())
    }

    /// Opens a created or copied catalog for reads and writes. Opening an
    /// already open catalog changes nothing.
    pub fn open_catalog(&self, vol: VolumeId) -> Result<(), Error> {
        let vm = self.get_volume_meta(vol)?;
        let mut vols = self.volumes.write();
        let cat = vols
            .entry(vol)
            .or_insert_with(|| VolumeCatalog::closed(&vm, &self.config));
        if cat.state == CatalogState::Open {
            debug!("catalog for {:?} already open", vol);
            return Ok(());
        }
        cat.state = CatalogState::Open;
        info!("opened catalog for {:?}", vol);
        Ok(())
    }

    /// Like [Self::open_catalog] but re-reads the volume record first, for
    /// catalogs whose contents were replaced underneath (sync targets).
    pub fn activate_catalog(&self, vol: VolumeId) -> Result<(), Error> {
        let vm = self.get_volume_meta(vol)?;
        let mut cat = VolumeCatalog::closed(&vm, &self.config);
        cat.state = CatalogState::Open;
        self.volumes.write().insert(vol, cat);
        info!("activated catalog for {:?}", vol);
        Ok(())
    }

    pub fn close_catalog(&self, vol: VolumeId) -> Result<(), Error> {
        match self.volumes.write().get_mut(&vol) {
            Some(cat) => {
                cat.state = CatalogState::Closed;
                Ok(())
            }
            None => Err(Error::VolNotFound),
        }
    }

    pub fn get_volume_meta(&self, vol: VolumeId) -> Result<VolumeMeta, Error> {
        match self.backend.get(vol, VOLUME_META_KEY)? {
            Some(bytes) => VolumeMeta::decode(&bytes),
            None => Err(Error::Corrupt(format!("{:?} has no volume record", vol))),
        }
    }

    fn read_extent(
        &self,
        vol: VolumeId,
        geometry: &ExtentGeometry,
        blob_name: &str,
        extent_id: ExtentId,
    ) -> Result<Option<BlobExtent>, Error> {
        match self.backend.get(vol, &blob_key(blob_name, extent_id)?)? {
            Some(bytes) => Ok(Some(BlobExtent::decode(geometry, extent_id, &bytes)?)),
            None => Ok(None),
        }
    }

    fn extent_or_empty(
        &self,
        vol: VolumeId,
        geometry: &ExtentGeometry,
        blob_name: &str,
        extent_id: ExtentId,
    ) -> Result<BlobExtent, Error> {
        Ok(match self.read_extent(vol, geometry, blob_name, extent_id)? {
            Some(ext) => ext,
            None if extent_id == META_EXTENT_ID => BlobExtent::new_meta(geometry, vol, blob_name),
            None => BlobExtent::new(geometry, extent_id),
        })
    }

    /// Extent 0 of `blob_name`. A blob with no record yields an empty extent 0
    /// so the first write needs no special case.
    pub fn get_meta_extent(&self, vol: VolumeId, blob_name: &str) -> Result<BlobExtent, Error> {
        let cat = self.readable(vol)?;
        self.extent_or_empty(vol, &cat.geometry, blob_name, META_EXTENT_ID)
    }

    /// Data extent `extent_id` of `blob_name`, or an empty one if absent.
    pub fn get_extent(
        &self,
        vol: VolumeId,
        blob_name: &str,
        extent_id: ExtentId,
    ) -> Result<BlobExtent, Error> {
        let cat = self.readable(vol)?;
        self.extent_or_empty(vol, &cat.geometry, blob_name, extent_id)
    }

    fn extent_ops(
        blob_name: &str,
        extent0: &BlobExtent,
        extents: &[&BlobExtent],
    ) -> Result<Vec<BatchOp>, Error> {
        assert!(extent0.is_meta(), "first extent of a put must be extent 0");
        assert_eq!(
            extent0.meta().map(|m| m.blob_name.as_str()),
            Some(blob_name),
            "extent 0 belongs to another blob"
        );
        let mut ops = Vec::with_capacity(extents.len() + 2);
        ops.push(BatchOp::Put(blob_key(blob_name, META_EXTENT_ID)?, extent0.encode()?));
        for ext in extents {
            assert!(!ext.is_meta(), "extent 0 passed as a data extent");
            let key = blob_key(blob_name, ext.extent_id())?;
            if ext.is_empty() {
                ops.push(BatchOp::Delete(key));
            } else {
                ops.push(BatchOp::Put(key, ext.encode()?));
            }
        }
        Ok(ops)
    }

    /// Persists extent 0 and any data extents of one blob atomically. Data
    /// extents with no mappings left are deleted rather than written.
    pub fn put_extents(
        &self,
        vol: VolumeId,
        blob_name: &str,
        extent0: &BlobExtent,
        extents: &[BlobExtent],
    ) -> Result<(), Error> {
        self.writable(vol)?;
        let refs: Vec<&BlobExtent> = extents.iter().collect();
        let ops = Self::extent_ops(blob_name, extent0, &refs)?;
        trace!("put {} extent records of {:?}/{}", ops.len(), vol, blob_name);
        self.backend.write_batch(vol, ops)
    }

    fn data_extent_ids(&self, vol: VolumeId, blob_name: &str) -> Result<Vec<ExtentId>, Error> {
        let mut ids = Vec::new();
        self.backend
            .for_each_prefix(vol, &blob_prefix(blob_name)?, &mut |k, _| {
                if let Some((_, id)) = decode_blob_key(k) {
                    if id != META_EXTENT_ID {
                        ids.push(id);
                    }
                }
                Ok(())
            })?;
        Ok(ids)
    }

    /// Applies one committed transaction to its blob: builds the new extents
    /// and writes them, plus `volume_meta` if given, in one atomic batch.
    pub fn apply_blob_commit(
        &self,
        vol: VolumeId,
        batch: &CommitBatch,
        volume_meta: Option<&VolumeMeta>,
    ) -> Result<AppliedCommit, Error> {
        let cat = self.writable(vol)?;
        let g = cat.geometry;
        let name = batch.blob_name.as_str();
        let (mut e0, present) = match self.read_extent(vol, &g, name, META_EXTENT_ID)? {
            Some(e) => (e, true),
            None => (BlobExtent::new_meta(&g, vol, name), false),
        };
        let prev = e0.meta().cloned().unwrap_or_default();
        let mut data: BTreeMap<ExtentId, BlobExtent> = BTreeMap::new();
        let mut expunged = Vec::new();
        let mut size = if prev.deleted { 0 } else { prev.size };
        let mut meta = if prev.deleted {
            BTreeMap::new()
        } else {
            prev.meta.clone()
        };

        match batch.op {
            BlobOpType::Delete => {
                if !present || prev.deleted {
                    return Err(Error::CatEntryNotFound);
                }
                expunged.extend(e0.clear());
                for id in self.data_extent_ids(vol, name)? {
                    let mut ext = self.extent_or_empty(vol, &g, name, id)?;
                    expunged.extend(ext.clear());
                    data.insert(id, ext);
                }
                size = 0;
                meta.clear();
            }
            BlobOpType::Put => {
                for upd in batch.offsets.iter() {
                    if upd.object_id.is_null() {
                        return Err(Error::Corrupt(format!(
                            "null object staged at offset {} of {}",
                            upd.offset, name
                        )));
                    }
                    let id = g.extent_for_offset(upd.offset)?;
                    let ext = if id == META_EXTENT_ID {
                        &mut e0
                    } else {
                        match data.entry(id) {
                            Entry::Occupied(o) => o.into_mut(),
                            Entry::Vacant(v) => v.insert(self.extent_or_empty(vol, &g, name, id)?),
                        }
                    };
                    ext.update_offset(upd.offset, upd.object_id)?;
                }
                size = size.max(batch.end_offset()?);
                if let Some(new_size) = batch.size {
                    size = new_size;
                    let mut ids: BTreeSet<ExtentId> = data.keys().copied().collect();
                    ids.extend(self.data_extent_ids(vol, name)?);
                    for id in ids {
                        let ext = match data.entry(id) {
                            Entry::Occupied(o) => o.into_mut(),
                            Entry::Vacant(v) => v.insert(self.extent_or_empty(vol, &g, name, id)?),
                        };
                        expunged.extend(Self::truncate_to(ext, new_size));
                    }
                    expunged.extend(Self::truncate_to(&mut e0, new_size));
                }
                meta.extend(batch.meta.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }

        let new_meta = {
            let m = e0
                .meta_mut()
                .expect("extent 0 always carries blob metadata");
            m.volume_id = vol;
            m.version = prev.version + 1;
            m.sequence_id = batch.sequence_id;
            m.deleted = batch.op == BlobOpType::Delete;
            m.size = size;
            m.meta = meta;
            m.clone()
        };

        let refs: Vec<&BlobExtent> = data.values().collect();
        let mut ops = Self::extent_ops(name, &e0, &refs)?;
        if let Some(vm) = volume_meta {
            ops.push(BatchOp::Put(VOLUME_META_KEY.to_vec(), vm.encode()?));
        }
        self.backend.write_batch(vol, ops)?;
        debug!(
            "applied {:?} of {:?}/{} v{} size {} ({} extents, {} expunged)",
            batch.op,
            vol,
            name,
            new_meta.version,
            new_meta.size,
            data.len() + 1,
            expunged.len()
        );
        Ok(AppliedCommit {
            meta: new_meta,
            expunged,
        })
    }

    fn truncate_to(ext: &mut BlobExtent, size: u64) -> Vec<ObjectId> {
        if size == 0 {
            ext.clear()
        } else {
            ext.truncate(size - 1)
        }
    }

    /// Writes only the volume record, for watermark advances that carry no
    /// catalog change.
    pub fn put_volume_meta(&self, vol: VolumeId, vm: &VolumeMeta) -> Result<(), Error> {
        self.catalog(vol)?;
        self.backend
            .write_batch(vol, vec![BatchOp::Put(VOLUME_META_KEY.to_vec(), vm.encode()?)])
    }

    /// Live (non-deleted) metadata of one blob.
    pub fn get_blob_desc(&self, vol: VolumeId, blob_name: &str) -> Result<BlobMeta, Error> {
        let cat = self.readable(vol)?;
        match self.read_extent(vol, &cat.geometry, blob_name, META_EXTENT_ID)? {
            Some(e0) => match e0.meta() {
                Some(m) if !m.deleted => {
                    let mut m = m.clone();
                    m.volume_id = vol;
                    Ok(m)
                }
                _ => Err(Error::CatEntryNotFound),
            },
            None => Err(Error::CatEntryNotFound),
        }
    }

    /// Mappings of `blob_name` whose offset lies in `[start, start + len)`.
    pub fn get_blob_offsets(
        &self,
        vol: VolumeId,
        blob_name: &str,
        start: u64,
        len: u64,
    ) -> Result<Vec<(u64, ObjectId)>, Error> {
        let cat = self.readable(vol)?;
        let g = cat.geometry;
        let e0 = match self.read_extent(vol, &g, blob_name, META_EXTENT_ID)? {
            Some(e0) if e0.meta().map_or(false, |m| !m.deleted) => e0,
            _ => return Err(Error::CatEntryNotFound),
        };
        if len == 0 {
            return Ok(Vec::new());
        }
        let end = start.saturating_add(len);
        let first = g.extent_for_offset(start)?;
        let last = g.extent_for_offset(end - 1)?;
        let mut out = Vec::new();
        for id in first..=last {
            let ext = if id == META_EXTENT_ID {
                e0.clone()
            } else {
                match self.read_extent(vol, &g, blob_name, id)? {
                    Some(ext) => ext,
                    None => continue,
                }
            };
            let unit = u64::from(g.offset_unit_bytes);
            out.extend(
                ext.iter()
                    .filter(|(off, _)| *off + unit > start && *off < end),
            );
        }
        Ok(out)
    }

    fn visit(
        &self,
        vol: VolumeId,
        snap: Option<SnapshotId>,
        prefix: &[u8],
        f: &mut dyn FnMut(&[u8], &[u8]) -> Result<(), Error>,
    ) -> Result<(), Error> {
        match snap {
            Some(id) => self.snapshot_handle(vol, id)?.for_each_prefix(prefix, f),
            None => self.backend.for_each_prefix(vol, prefix, f),
        }
    }

    fn visit_extents(
        &self,
        vol: VolumeId,
        snap: Option<SnapshotId>,
        f: &mut dyn FnMut(BlobExtent) -> Result<(), Error>,
    ) -> Result<(), Error> {
        let g = self.catalog(vol)?.geometry;
        self.visit(vol, snap, &[], &mut |k, v| match decode_blob_key(k) {
            Some((_, id)) => f(BlobExtent::decode(&g, id, v)?),
            None => Ok(()),
        })
    }

    pub fn list_blobs(&self, vol: VolumeId) -> Result<Vec<BlobMeta>, Error> {
        self.readable(vol)?;
        let mut blobs = Vec::new();
        self.visit_extents(vol, None, &mut |ext| {
            if let Some(m) = ext.meta() {
                if !m.deleted {
                    blobs.push(m.clone());
                }
            }
            Ok(())
        })?;
        Ok(blobs)
    }

    /// Sequence id of every live blob, read from `snap` when given so the
    /// enumeration doesn't hold off writers.
    pub fn get_all_blobs_with_sequence_id(
        &self,
        vol: VolumeId,
        snap: Option<SnapshotId>,
    ) -> Result<BTreeMap<String, SequenceId>, Error> {
        let mut out = BTreeMap::new();
        self.visit_extents(vol, snap, &mut |ext| {
            if let Some(m) = ext.meta() {
                if !m.deleted {
                    out.insert(m.blob_name.clone(), m.sequence_id);
                }
            }
            Ok(())
        })?;
        Ok(out)
    }

    /// Visits every object referenced by the volume.
    pub fn for_each_object(
        &self,
        vol: VolumeId,
        snap: Option<SnapshotId>,
        f: &mut dyn FnMut(ObjectId),
    ) -> Result<(), Error> {
        self.visit_extents(vol, snap, &mut |ext| {
            for (_, oid) in ext.iter() {
                f(oid);
            }
            Ok(())
        })
    }

    /// Marks the volume deleted. Every blob must already be a deleted version.
    pub fn mark_volume_deleted(&self, vol: VolumeId) -> Result<(), Error> {
        self.catalog(vol)?;
        let mut live = 0usize;
        self.visit_extents(vol, None, &mut |ext| {
            if ext.meta().map_or(false, |m| !m.deleted) {
                live += 1;
            }
            Ok(())
        })?;
        if live > 0 {
            debug!("{:?} still holds {} live blobs", vol, live);
            return Err(Error::VolNotEmpty);
        }
        let mut vm = self.get_volume_meta(vol)?;
        vm.deleted = true;
        self.put_volume_meta(vol, &vm)?;
        if let Some(cat) = self.volumes.write().get_mut(&vol) {
            cat.deleted = true;
        }
        info!("marked {:?} deleted", vol);
        Ok(())
    }

    /// Removes the catalog of a volume previously marked deleted.
    pub fn delete_empty_catalog(&self, vol: VolumeId) -> Result<(), Error> {
        if !self.catalog(vol)?.deleted {
            return Err(Error::NotReady);
        }
        self.discard_catalog(vol)?;
        info!("deleted catalog for {:?}", vol);
        Ok(())
    }

    /// Drops a catalog unconditionally, along with its snapshots. Used when a
    /// stale replica is about to receive a full copy.
    pub fn discard_catalog(&self, vol: VolumeId) -> Result<(), Error> {
        self.snapshots.lock().retain(|_, (v, _)| *v != vol);
        self.volumes.write().remove(&vol);
        if self.backend.partition_exists(vol) {
            self.backend.drop_partition(vol)?;
        }
        debug!("discarded catalog for {:?}", vol);
        Ok(())
    }

    /// Creates `dst` as a point-in-time copy of `src`, closed. Writers to
    /// `src` are held off only while the backend snapshot is taken.
    pub fn copy_volume(
        &self,
        src: VolumeId,
        dst: VolumeId,
        is_snapshot: bool,
        read_only: bool,
    ) -> Result<(), Error> {
        self.catalog(src)?;
        if self.volumes.read().contains_key(&dst) || self.backend.partition_exists(dst) {
            return Err(Error::VolumeExists);
        }
        self.backend
            .copy_partition(src, dst, self.config.sync_batch_entries)?;
        let mut vm = self.get_volume_meta(dst)?;
        vm.desc.volume_id = dst;
        vm.snapshot_of = if is_snapshot { Some(src) } else { None };
        vm.read_only = read_only;
        vm.deleted = false;
        self.backend
            .write_batch(dst, vec![BatchOp::Put(VOLUME_META_KEY.to_vec(), vm.encode()?)])?;
        self.volumes
            .write()
            .insert(dst, VolumeCatalog::closed(&vm, &self.config));
        info!(
            "copied {:?} to {:?} (snapshot: {}, read-only: {})",
            src, dst, is_snapshot, read_only
        );
        Ok(())
    }

    pub fn get_volume_snapshot(&self, vol: VolumeId) -> Result<SnapshotId, Error> {
        self.catalog(vol)?;
        let snap: Arc<dyn CatalogSnapshot> = Arc::from(self.backend.snapshot(vol)?);
        let id = SnapshotId(self.next_snapshot.fetch_add(1, Ordering::SeqCst));
        self.snapshots.lock().insert(id, (vol, snap));
        trace!("took {:?} of {:?}", id, vol);
        Ok(id)
    }

    pub fn free_volume_snapshot(&self, id: SnapshotId) -> Result<(), Error> {
        match self.snapshots.lock().remove(&id) {
            Some(_) => Ok(()),
            None => Err(Error::NotFound),
        }
    }

    fn snapshot_handle(
        &self,
        vol: VolumeId,
        id: SnapshotId,
    ) -> Result<Arc<dyn CatalogSnapshot>, Error> {
        match self.snapshots.lock().get(&id) {
            Some((v, snap)) if *v == vol => Ok(snap.clone()),
            _ => Err(Error::NotFound),
        }
    }

    /// Every record of the volume as seen by `snap`, volume record included.
    pub fn export_records(
        &self,
        vol: VolumeId,
        snap: SnapshotId,
    ) -> Result<Vec<CatalogRecord>, Error> {
        let mut out = Vec::new();
        self.visit(vol, Some(snap), &[], &mut |k, v| {
            out.push((k.to_vec(), v.to_vec()));
            Ok(())
        })?;
        Ok(out)
    }

    /// Starts a fresh, closed catalog that will be filled by
    /// [Self::import_records]. Any previous catalog of the volume is dropped.
    pub fn create_sync_target(&self, desc: &VolumeDesc) -> Result<(), Error> {
        if self.volumes.read().contains_key(&desc.volume_id)
            || self.backend.partition_exists(desc.volume_id)
        {
            self.discard_catalog(desc.volume_id)?;
        }
        self.create_catalog(desc)
    }

    /// Writes raw records received from a sync source.
    pub fn import_records(&self, vol: VolumeId, records: Vec<CatalogRecord>) -> Result<(), Error> {
        self.catalog(vol)?;
        let mut ops = Vec::with_capacity(records.len());
        for (k, v) in records {
            if k.as_slice() != VOLUME_META_KEY && decode_blob_key(&k).is_none() {
                return Err(Error::Corrupt(format!(
                    "unrecognized catalog key of {} bytes",
                    k.len()
                )));
            }
            ops.push(BatchOp::Put(k, v));
        }
        trace!("importing {} records into {:?}", ops.len(), vol);
        self.backend.write_batch(vol, ops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNIT: u32 = 1 << 20;

    fn cfg() -> DmConfig {
        DmConfig {
            extent0_capacity: 4,
            extent_capacity: 8,
            ..DmConfig::default()
        }
    }

    fn store_with(backend: Arc<dyn CatalogBackend>, vol: VolumeId) -> VolumeCatalogStore {
        let store = VolumeCatalogStore::new(backend, cfg()).unwrap();
        store
            .create_catalog(&VolumeDesc::new(vol, "test", UNIT))
            .unwrap();
        store.open_catalog(vol).unwrap();
        store
    }

    fn store(vol: VolumeId) -> VolumeCatalogStore {
        store_with(Arc::new(MemoryBackend::new()), vol)
    }

    fn put(name: &str, units: &[u64]) -> CommitBatch {
        let mut b = CommitBatch::new(name, TxId(1));
        for u in units {
            b.offsets.push(OffsetUpdate {
                offset: u * u64::from(UNIT),
                size: UNIT,
                object_id: ObjectId::from_u64(*u + 100),
            });
        }
        b
    }

    #[test]
    fn lifecycle_errors() {
        let vol = VolumeId(1);
        let s = VolumeCatalogStore::in_memory(cfg()).unwrap();
        assert_eq!(s.get_meta_extent(vol, "b"), Err(Error::VolNotFound));
        let desc = VolumeDesc::new(vol, "v", UNIT);
        s.create_catalog(&desc).unwrap();
        assert_eq!(s.create_catalog(&desc), Err(Error::VolumeExists));
        assert_eq!(s.get_meta_extent(vol, "b"), Err(Error::NotReady));
        s.open_catalog(vol).unwrap();
        s.open_catalog(vol).unwrap();
        assert!(s.is_open(vol));
    }

    #[test]
    fn missing_extents_are_synthesized_empty() {
        let vol = VolumeId(1);
        let s = store(vol);
        let e0 = s.get_meta_extent(vol, "nope").unwrap();
        assert!(e0.is_meta() && e0.is_empty());
        assert_eq!(e0.meta().unwrap().blob_name, "nope");
        let e3 = s.get_extent(vol, "nope", 3).unwrap();
        assert_eq!(e3.extent_id(), 3);
        assert_eq!(e3.first_unit(), 4 + 2 * 8);
        assert_eq!(s.get_blob_desc(vol, "nope"), Err(Error::CatEntryNotFound));
    }

    #[test]
    fn commit_spans_extents_and_reads_back() {
        let vol = VolumeId(1);
        let s = store(vol);
        let applied = s.apply_blob_commit(vol, &put("b", &[0, 3, 4, 20]), None).unwrap();
        assert_eq!(applied.meta.version, 1);
        assert_eq!(applied.meta.size, 21 * u64::from(UNIT));
        assert_eq!(s.get_extent(vol, "b", 1).unwrap().len(), 1);
        assert_eq!(s.get_extent(vol, "b", 3).unwrap().len(), 1);
        let offs = s
            .get_blob_offsets(vol, "b", 2 * u64::from(UNIT), 3 * u64::from(UNIT))
            .unwrap();
        assert_eq!(
            offs,
            vec![
                (3 * u64::from(UNIT), ObjectId::from_u64(103)),
                (4 * u64::from(UNIT), ObjectId::from_u64(104)),
            ]
        );
        assert_eq!(s.list_blobs(vol).unwrap().len(), 1);
    }

    #[test]
    fn commit_ending_past_u64_is_out_of_range() {
        let vol = VolumeId(1);
        let s = store(vol);
        s.apply_blob_commit(vol, &put("b", &[0]), None).unwrap();
        let mut bad = put("b", &[1]);
        bad.offsets.push(OffsetUpdate {
            offset: u64::MAX - 10,
            size: UNIT,
            object_id: ObjectId::from_u64(7),
        });
        assert_eq!(
            s.apply_blob_commit(vol, &bad, None),
            Err(Error::OffsetOutOfRange)
        );
        let meta = s.get_blob_desc(vol, "b").unwrap();
        assert_eq!(meta.version, 1);
        assert_eq!(meta.size, u64::from(UNIT));
    }

    #[test]
    fn failed_commit_leaves_no_partial_state() {
        let vol = VolumeId(1);
        let mem = Arc::new(MemoryBackend::new());
        let s = store_with(mem.clone(), vol);
        s.apply_blob_commit(vol, &put("b", &[0]), None).unwrap();
        // Extent 0 is the first op of the batch; fail right after it.
        mem.fail_batch_after(1);
        let res = s.apply_blob_commit(vol, &put("b", &[1, 5, 13]), None);
        assert!(matches!(res, Err(Error::Storage(_))));
        let e0 = s.get_meta_extent(vol, "b").unwrap();
        assert_eq!(e0.len(), 1);
        assert_eq!(e0.meta().unwrap().version, 1);
        assert!(s.get_extent(vol, "b", 1).unwrap().is_empty());
        assert!(s.get_extent(vol, "b", 2).unwrap().is_empty());
    }

    #[test]
    fn emptied_extents_are_deleted() {
        let vol = VolumeId(1);
        let mem = Arc::new(MemoryBackend::new());
        let s = store_with(mem.clone(), vol);
        s.apply_blob_commit(vol, &put("b", &[1, 6, 7]), None).unwrap();
        let key = blob_key("b", 1).unwrap();
        assert!(mem.get(vol, &key).unwrap().is_some());

        let mut shrink = CommitBatch::new("b", TxId(2));
        shrink.size = Some(2 * u64::from(UNIT));
        let applied = s.apply_blob_commit(vol, &shrink, None).unwrap();
        assert_eq!(
            applied.expunged,
            vec![ObjectId::from_u64(106), ObjectId::from_u64(107)]
        );
        assert_eq!(mem.get(vol, &key).unwrap(), None);
        assert_eq!(s.get_meta_extent(vol, "b").unwrap().len(), 1);

        // put_extents prunes the same way.
        let mut e1 = s.get_extent(vol, "b", 1).unwrap();
        e1.update_offset(5 * u64::from(UNIT), ObjectId::from_u64(9)).unwrap();
        let e0 = s.get_meta_extent(vol, "b").unwrap();
        s.put_extents(vol, "b", &e0, &[e1.clone()]).unwrap();
        assert!(mem.get(vol, &key).unwrap().is_some());
        e1.truncate(0);
        s.put_extents(vol, "b", &e0, &[e1]).unwrap();
        assert_eq!(mem.get(vol, &key).unwrap(), None);
    }

    #[test]
    fn delete_then_drop_volume() {
        let vol = VolumeId(1);
        let s = store(vol);
        s.apply_blob_commit(vol, &put("b", &[0, 9]), None).unwrap();
        assert_eq!(s.mark_volume_deleted(vol), Err(Error::VolNotEmpty));
        assert_eq!(s.delete_empty_catalog(vol), Err(Error::NotReady));

        let mut del = CommitBatch::new("b", TxId(2));
        del.op = BlobOpType::Delete;
        let applied = s.apply_blob_commit(vol, &del, None).unwrap();
        assert!(applied.meta.deleted);
        assert_eq!(applied.meta.version, 2);
        assert_eq!(applied.expunged.len(), 2);
        assert_eq!(s.get_blob_desc(vol, "b"), Err(Error::CatEntryNotFound));
        assert_eq!(
            s.apply_blob_commit(vol, &del, None),
            Err(Error::CatEntryNotFound)
        );

        s.mark_volume_deleted(vol).unwrap();
        s.delete_empty_catalog(vol).unwrap();
        assert_eq!(s.get_meta_extent(vol, "b"), Err(Error::VolNotFound));
    }

    #[test]
    fn put_after_delete_starts_fresh_version() {
        let vol = VolumeId(1);
        let s = store(vol);
        let mut b = put("b", &[0]);
        b.meta.insert("k".into(), "v".into());
        s.apply_blob_commit(vol, &b, None).unwrap();
        let mut del = CommitBatch::new("b", TxId(2));
        del.op = BlobOpType::Delete;
        s.apply_blob_commit(vol, &del, None).unwrap();
        let again = s.apply_blob_commit(vol, &put("b", &[1]), None).unwrap();
        assert_eq!(again.meta.version, 3);
        assert!(again.meta.meta.is_empty());
        assert_eq!(again.meta.size, 2 * u64::from(UNIT));
    }

    #[test]
    fn copies_and_snapshots_are_point_in_time() {
        let vol = VolumeId(1);
        let s = store(vol);
        s.apply_blob_commit(vol, &put("a", &[0]), None).unwrap();
        let snap = s.get_volume_snapshot(vol).unwrap();
        s.copy_volume(vol, VolumeId(2), true, true).unwrap();
        s.apply_blob_commit(vol, &put("b", &[0]), None).unwrap();

        let at_snap = s.get_all_blobs_with_sequence_id(vol, Some(snap)).unwrap();
        assert_eq!(at_snap.keys().collect::<Vec<_>>(), vec!["a"]);
        assert_eq!(s.get_all_blobs_with_sequence_id(vol, None).unwrap().len(), 2);
        let mut objs = Vec::new();
        s.for_each_object(vol, Some(snap), &mut |o| objs.push(o)).unwrap();
        assert_eq!(objs, vec![ObjectId::from_u64(100)]);
        s.free_volume_snapshot(snap).unwrap();
        assert_eq!(s.free_volume_snapshot(snap), Err(Error::NotFound));

        s.open_catalog(VolumeId(2)).unwrap();
        let vm = s.get_volume_meta(VolumeId(2)).unwrap();
        assert_eq!(vm.snapshot_of, Some(vol));
        assert_eq!(s.list_blobs(VolumeId(2)).unwrap().len(), 1);
        assert_eq!(
            s.apply_blob_commit(VolumeId(2), &put("c", &[0]), None),
            Err(Error::ReadOnly)
        );
    }

    #[test]
    fn records_move_between_stores() {
        let vol = VolumeId(7);
        let src = store(vol);
        src.apply_blob_commit(vol, &put("x", &[0, 12]), None).unwrap();
        let snap = src.get_volume_snapshot(vol).unwrap();
        let records = src.export_records(vol, snap).unwrap();

        let dst = VolumeCatalogStore::in_memory(cfg()).unwrap();
        dst.create_sync_target(&VolumeDesc::new(vol, "test", UNIT))
            .unwrap();
        dst.import_records(vol, records).unwrap();
        dst.activate_catalog(vol).unwrap();
        assert_eq!(dst.get_blob_desc(vol, "x"), src.get_blob_desc(vol, "x"));
        assert_eq!(
            dst.import_records(vol, vec![(vec![1, 2], vec![])]),
            Err(Error::Corrupt("unrecognized catalog key of 2 bytes".to_string()))
        );
    }
}
