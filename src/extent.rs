// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! A blob's offset space is measured in "offset units", each the size of the
//! volume's largest object. Unit `u` of a blob maps to at most one
//! [ObjectId]. Those mappings are grouped into extents so that a sparse,
//! large blob is stored as a handful of bounded records instead of one record
//! per unit or one unbounded record per blob:
//!
//!   - extent 0 holds units `0 .. extent0_capacity` plus the [BlobMeta];
//!   - extent `n > 0` holds units
//!     `extent0_capacity + (n-1)*extent_capacity ..` up to (and excluding)
//!     `extent0_capacity + n*extent_capacity`.
//!
//! On disk an extent is
//!
//! ```text
//! [extent 0 only: meta_len:u32, bincode(BlobMeta)]
//! [count:u32] [count x (unit:u32, object id:20 bytes)]
//! ```
//!
//! with all integers little-endian.

use crate::{DmConfig, Error, ObjectId, SequenceId, VolumeId, OBJECT_ID_LEN};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    convert::{TryFrom, TryInto},
};

pub type ExtentId = u32;

/// Extent carrying the blob metadata and the first offset range.
pub const META_EXTENT_ID: ExtentId = 0;

/// Per-volume constants deciding which extent an offset lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ExtentGeometry {
    pub offset_unit_bytes: u32,
    pub extent0_capacity: u32,
    pub extent_capacity: u32,
}

impl ExtentGeometry {
    pub fn new(offset_unit_bytes: u32, extent0_capacity: u32, extent_capacity: u32) -> Self {
        assert!(offset_unit_bytes > 0, "zero offset unit");
        assert!(
            extent0_capacity > 0 && extent_capacity > 0,
            "zero extent capacity"
        );
        ExtentGeometry {
            offset_unit_bytes,
            extent0_capacity,
            extent_capacity,
        }
    }

    pub fn for_volume(max_object_size_bytes: u32, cfg: &DmConfig) -> Self {
        Self::new(
            max_object_size_bytes,
            cfg.extent0_capacity,
            cfg.extent_capacity,
        )
    }

    pub fn offset_units(&self, offset: u64) -> u64 {
        offset / u64::from(self.offset_unit_bytes)
    }

    /// Routes an absolute byte offset to its extent.
    pub fn extent_for_offset(&self, offset: u64) -> Result<ExtentId, Error> {
        let units = self.offset_units(offset);
        let e0 = u64::from(self.extent0_capacity);
        if units < e0 {
            return Ok(META_EXTENT_ID);
        }
        let id = 1 + (units - e0) / u64::from(self.extent_capacity);
        ExtentId::try_from(id).map_err(|_| Error::OffsetOutOfRange)
    }

    /// Inclusive range of offset units held by extent `id`.
    pub fn unit_range(&self, id: ExtentId) -> (u64, u64) {
        if id == META_EXTENT_ID {
            (0, u64::from(self.extent0_capacity) - 1)
        } else {
            let cap = u64::from(self.extent_capacity);
            let first = u64::from(self.extent0_capacity) + (u64::from(id) - 1) * cap;
            (first, first + cap - 1)
        }
    }
}

/// Blob-level metadata, carried by extent 0.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMeta {
    pub blob_name: String,
    pub volume_id: VolumeId,
    /// Bumped by every committed PUT or DELETE.
    pub version: u64,
    pub size: u64,
    pub sequence_id: SequenceId,
    /// A deleted blob keeps its extent 0 as a tombstone version.
    pub deleted: bool,
    pub meta: BTreeMap<String, String>,
}

impl BlobMeta {
    pub fn new(volume_id: VolumeId, blob_name: &str) -> BlobMeta {
        BlobMeta {
            blob_name: blob_name.to_string(),
            volume_id,
            ..Default::default()
        }
    }
}

/// One contiguous range of a blob's unit→object map.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobExtent {
    extent_id: ExtentId,
    offset_unit_bytes: u32,
    first_unit: u64,
    last_unit: u64,
    object_map: BTreeMap<u32, ObjectId>,
    blob_meta: Option<BlobMeta>,
}

impl BlobExtent {
    /// An empty data extent (id > 0).
    pub fn new(geometry: &ExtentGeometry, extent_id: ExtentId) -> BlobExtent {
        assert_ne!(
            extent_id, META_EXTENT_ID,
            "extent 0 must be built with new_meta"
        );
        Self::build(geometry, extent_id, None)
    }

    /// An empty extent 0 for a blob that has no record yet.
    pub fn new_meta(geometry: &ExtentGeometry, volume_id: VolumeId, blob_name: &str) -> BlobExtent {
        Self::build(
            geometry,
            META_EXTENT_ID,
            Some(BlobMeta::new(volume_id, blob_name)),
        )
    }

    fn build(geometry: &ExtentGeometry, extent_id: ExtentId, meta: Option<BlobMeta>) -> BlobExtent {
        let (first_unit, last_unit) = geometry.unit_range(extent_id);
        BlobExtent {
            extent_id,
            offset_unit_bytes: geometry.offset_unit_bytes,
            first_unit,
            last_unit,
            object_map: BTreeMap::new(),
            blob_meta: meta,
        }
    }

    pub fn extent_id(&self) -> ExtentId {
        self.extent_id
    }

    pub fn is_meta(&self) -> bool {
        self.extent_id == META_EXTENT_ID
    }

    pub fn first_unit(&self) -> u64 {
        self.first_unit
    }

    pub fn last_unit(&self) -> u64 {
        self.last_unit
    }

    pub fn meta(&self) -> Option<&BlobMeta> {
        self.blob_meta.as_ref()
    }

    pub fn meta_mut(&mut self) -> Option<&mut BlobMeta> {
        self.blob_meta.as_mut()
    }

    pub fn len(&self) -> usize {
        self.object_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.object_map.is_empty()
    }

    fn unit_of(&self, offset: u64) -> u64 {
        offset / u64::from(self.offset_unit_bytes)
    }

    pub fn offset_in_range(&self, offset: u64) -> bool {
        let unit = self.unit_of(offset);
        self.first_unit <= unit && unit <= self.last_unit
    }

    fn checked_unit(&self, offset: u64) -> Result<u32, Error> {
        if !self.offset_in_range(offset) {
            return Err(Error::OffsetOutOfRange);
        }
        u32::try_from(self.unit_of(offset)).map_err(|_| Error::OffsetOutOfRange)
    }

    /// Writes or overwrites the mapping at `offset`.
    pub fn update_offset(&mut self, offset: u64, object_id: ObjectId) -> Result<(), Error> {
        let unit = self.checked_unit(offset)?;
        self.object_map.insert(unit, object_id);
        Ok(())
    }

    pub fn get_object_info(&self, offset: u64) -> Result<ObjectId, Error> {
        let unit = self.checked_unit(offset)?;
        self.object_map.get(&unit).copied().ok_or(Error::NotFound)
    }

    /// Removes every mapping whose unit lies strictly after the unit holding
    /// `after_offset`, returning the removed object ids in offset order.
    pub fn truncate(&mut self, after_offset: u64) -> Vec<ObjectId> {
        let unit = self.unit_of(after_offset);
        let removed = match u32::try_from(unit + 1) {
            Ok(first_removed) => self.object_map.split_off(&first_removed),
            Err(_) => BTreeMap::new(),
        };
        Self::checked_removal(removed)
    }

    /// Removes every mapping.
    pub fn clear(&mut self) -> Vec<ObjectId> {
        let removed = std::mem::take(&mut self.object_map);
        Self::checked_removal(removed)
    }

    fn checked_removal(removed: BTreeMap<u32, ObjectId>) -> Vec<ObjectId> {
        removed
            .into_iter()
            .map(|(unit, oid)| {
                assert!(!oid.is_null(), "null object mapped at unit {}", unit);
                oid
            })
            .collect()
    }

    /// Mappings as (absolute byte offset, object id), in offset order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, ObjectId)> + '_ {
        let unit_bytes = u64::from(self.offset_unit_bytes);
        self.object_map
            .iter()
            .map(move |(u, oid)| (u64::from(*u) * unit_bytes, *oid))
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let mut out = Vec::with_capacity(4 + self.object_map.len() * (4 + OBJECT_ID_LEN));
        if self.is_meta() {
            let meta = self
                .blob_meta
                .as_ref()
                .expect("extent 0 always carries blob metadata");
            let block = bincode::serialize(meta)?;
            let len = u32::try_from(block.len())
                .map_err(|_| Error::Storage("blob metadata block too large".to_string()))?;
            out.extend_from_slice(&len.to_le_bytes());
            out.extend_from_slice(&block);
        }
        let count = u32::try_from(self.object_map.len())
            .map_err(|_| Error::Storage("extent holds too many offsets".to_string()))?;
        out.extend_from_slice(&count.to_le_bytes());
        for (unit, oid) in self.object_map.iter() {
            out.extend_from_slice(&unit.to_le_bytes());
            out.extend_from_slice(oid.as_bytes());
        }
        Ok(out)
    }

    pub fn decode(
        geometry: &ExtentGeometry,
        extent_id: ExtentId,
        bytes: &[u8],
    ) -> Result<BlobExtent, Error> {
        let mut rd = Reader { buf: bytes, pos: 0 };
        let meta = if extent_id == META_EXTENT_ID {
            let len = rd.u32()? as usize;
            let block = rd.take(len)?;
            Some(bincode::deserialize::<BlobMeta>(block)?)
        } else {
            None
        };
        let mut ext = Self::build(geometry, extent_id, meta);
        let count = rd.u32()?;
        for _ in 0..count {
            let unit = rd.u32()?;
            let oid = ObjectId::from_slice(rd.take(OBJECT_ID_LEN)?)?;
            let u = u64::from(unit);
            if u < ext.first_unit || u > ext.last_unit {
                return Err(Error::Corrupt(format!(
                    "unit {} outside extent {} ({}..={})",
                    unit, extent_id, ext.first_unit, ext.last_unit
                )));
            }
            ext.object_map.insert(unit, oid);
        }
        if rd.pos != bytes.len() {
            return Err(Error::Corrupt(format!(
                "{} trailing bytes after extent {}",
                bytes.len() - rd.pos,
                extent_id
            )));
        }
        Ok(ext)
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| Error::Corrupt("truncated extent record".to_string()))?;
        let s = &self.buf[self.pos..end];
        self.pos = end;
        Ok(s)
    }

    fn u32(&mut self) -> Result<u32, Error> {
        let b: [u8; 4] = self.take(4)?.try_into().expect("took exactly 4 bytes");
        Ok(u32::from_le_bytes(b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MB: u32 = 1 << 20;

    fn geom() -> ExtentGeometry {
        ExtentGeometry::new(2 * MB, 4, 8)
    }

    #[test]
    fn routing_matches_documented_formula() {
        let g = geom();
        let unit = u64::from(2 * MB);
        assert_eq!(g.extent_for_offset(0), Ok(0));
        assert_eq!(g.extent_for_offset(4 * unit - 1), Ok(0));
        assert_eq!(g.extent_for_offset(4 * unit), Ok(1));
        assert_eq!(g.extent_for_offset(11 * unit + 5), Ok(1));
        assert_eq!(g.extent_for_offset(12 * unit), Ok(2));
        assert_eq!(g.unit_range(0), (0, 3));
        assert_eq!(g.unit_range(1), (4, 11));
        assert_eq!(g.unit_range(2), (12, 19));
    }

    #[test]
    fn update_outside_range_is_rejected() {
        let g = geom();
        let unit = u64::from(2 * MB);
        let mut ext = BlobExtent::new(&g, 1);
        assert_eq!(
            ext.update_offset(0, ObjectId::from_u64(1)),
            Err(Error::OffsetOutOfRange)
        );
        assert_eq!(
            ext.update_offset(12 * unit, ObjectId::from_u64(1)),
            Err(Error::OffsetOutOfRange)
        );
        assert_eq!(ext.update_offset(4 * unit, ObjectId::from_u64(1)), Ok(()));
        assert_eq!(ext.get_object_info(4 * unit), Ok(ObjectId::from_u64(1)));
    }

    #[test]
    fn sparse_offsets_are_not_found() {
        let g = geom();
        let unit = u64::from(2 * MB);
        let mut ext = BlobExtent::new_meta(&g, VolumeId(1), "b");
        ext.update_offset(0, ObjectId::from_u64(10)).unwrap();
        ext.update_offset(2 * unit, ObjectId::from_u64(12)).unwrap();
        assert_eq!(ext.get_object_info(unit), Err(Error::NotFound));
        assert_eq!(ext.get_object_info(2 * unit + 17), Ok(ObjectId::from_u64(12)));
    }

    #[test]
    fn truncate_removes_units_after_offset() {
        let g = geom();
        let unit = u64::from(2 * MB);
        let mut ext = BlobExtent::new(&g, 1);
        for u in 4..12u64 {
            ext.update_offset(u * unit, ObjectId::from_u64(u)).unwrap();
        }
        let removed = ext.truncate(6 * unit + 3);
        assert_eq!(
            removed,
            (7..12u64).map(ObjectId::from_u64).collect::<Vec<_>>()
        );
        assert_eq!(ext.len(), 3);
        assert_eq!(ext.clear().len(), 3);
        assert!(ext.is_empty());
    }

    #[test]
    #[should_panic(expected = "null object")]
    fn truncating_a_null_mapping_panics() {
        let g = geom();
        let mut ext = BlobExtent::new(&g, 1);
        ext.update_offset(u64::from(2 * MB) * 5, ObjectId::NULL)
            .unwrap();
        ext.clear();
    }

    #[test]
    fn meta_extent_round_trips_with_metadata() {
        let g = geom();
        let mut ext = BlobExtent::new_meta(&g, VolumeId(9), "photos/cat.jpg");
        {
            let m = ext.meta_mut().unwrap();
            m.version = 3;
            m.size = 12345;
            m.sequence_id = SequenceId(77);
            m.meta.insert("content-type".into(), "image/jpeg".into());
        }
        ext.update_offset(0, ObjectId::from_u64(1)).unwrap();
        let bytes = ext.encode().unwrap();
        let back = BlobExtent::decode(&g, 0, &bytes).unwrap();
        assert_eq!(back, ext);
        assert_eq!(back.meta().unwrap().blob_name, "photos/cat.jpg");
    }

    #[test]
    fn truncated_record_is_corrupt() {
        let g = geom();
        let mut ext = BlobExtent::new(&g, 2);
        ext.update_offset(u64::from(2 * MB) * 13, ObjectId::from_u64(3))
            .unwrap();
        let bytes = ext.encode().unwrap();
        assert!(matches!(
            BlobExtent::decode(&g, 2, &bytes[..bytes.len() - 1]),
            Err(Error::Corrupt(_))
        ));
        // Decoding as the wrong extent puts the unit out of range.
        assert!(matches!(
            BlobExtent::decode(&g, 1, &bytes),
            Err(Error::Corrupt(_))
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn routed_extent_accepts_offset(
            offset in 0u64..(1u64 << 40),
            unit in 4096u32..(16 * MB),
            e0 in 1u32..64,
            ecap in 1u32..4096,
        ) {
            let g = ExtentGeometry::new(unit, e0, ecap);
            let id = g.extent_for_offset(offset).unwrap();
            let ext = if id == META_EXTENT_ID {
                BlobExtent::new_meta(&g, VolumeId(1), "b")
            } else {
                BlobExtent::new(&g, id)
            };
            prop_assert!(ext.offset_in_range(offset));
            if id > 0 {
                let prev = if id == 1 {
                    BlobExtent::new_meta(&g, VolumeId(1), "b")
                } else {
                    BlobExtent::new(&g, id - 1)
                };
                prop_assert!(!prev.offset_in_range(offset));
            }
            prop_assert!(!BlobExtent::new(&g, id + 1).offset_in_range(offset));
        }

        #[test]
        fn encoded_extent_decodes_to_same_map(
            extent_id in 1u32..32,
            picks in proptest::collection::vec((0u32..8, any::<[u8; OBJECT_ID_LEN]>()), 0..64),
        ) {
            let g = geom();
            let mut ext = BlobExtent::new(&g, extent_id);
            let (first, _) = g.unit_range(extent_id);
            for (slot, digest) in picks {
                let offset = (first + u64::from(slot)) * u64::from(g.offset_unit_bytes);
                ext.update_offset(offset, ObjectId(digest)).unwrap();
            }
            let back = BlobExtent::decode(&g, extent_id, &ext.encode().unwrap()).unwrap();
            prop_assert_eq!(back.iter().collect::<Vec<_>>(), ext.iter().collect::<Vec<_>>());
            prop_assert_eq!(back, ext);
        }
    }
}
