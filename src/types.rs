// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Identifier newtypes shared by every layer. Most are plain integers on the
//! wire; wrapping them keeps a volume id from being passed where a transaction
//! id was meant.

use crate::Error;
use serde::{Deserialize, Serialize};

/// Identifies one DM service instance. Should be unique across any present or
/// future configuration of the cluster.
#[derive(Clone, Copy, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceId(pub u64);

impl std::fmt::Debug for ServiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("svc#{}", self.0))
    }
}

#[derive(Clone, Copy, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VolumeId(pub u64);

impl std::fmt::Debug for VolumeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("vol#{}", self.0))
    }
}

/// Opaque transaction token chosen by the access layer.
#[derive(Clone, Copy, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxId(pub u64);

impl std::fmt::Debug for TxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("tx#{:x}", self.0))
    }
}

/// Version of the volume placement table (DMT).
#[derive(
    Clone, Copy, Debug, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub struct DmtVersion(pub u64);

/// Client-assigned sequence number of a blob update, recorded in the blob's
/// metadata and used by migration tooling to diff catalogs.
#[derive(
    Clone, Copy, Debug, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub struct SequenceId(pub u64);

pub const OBJECT_ID_LEN: usize = 20;

/// Content digest naming one stored object.
#[derive(Clone, Copy, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub [u8; OBJECT_ID_LEN]);

impl ObjectId {
    /// Placeholder for "no object"; never a legitimate mapping target.
    pub const NULL: ObjectId = ObjectId([0u8; OBJECT_ID_LEN]);

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    pub fn from_slice(bytes: &[u8]) -> Result<ObjectId, Error> {
        if bytes.len() != OBJECT_ID_LEN {
            return Err(Error::Corrupt(format!(
                "object id of {} bytes, expected {}",
                bytes.len(),
                OBJECT_ID_LEN
            )));
        }
        let mut id = [0u8; OBJECT_ID_LEN];
        id.copy_from_slice(bytes);
        Ok(ObjectId(id))
    }

    /// Builds a non-null id whose leading bytes carry `n`. Handy wherever a
    /// real digest isn't at hand, such as in tests and tools.
    pub fn from_u64(n: u64) -> ObjectId {
        let mut id = [0u8; OBJECT_ID_LEN];
        id[..8].copy_from_slice(&n.to_be_bytes());
        id[OBJECT_ID_LEN - 1] = 0x01;
        ObjectId(id)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("obj:")?;
        for b in &self.0[..8] {
            f.write_fmt(format_args!("{:02x}", b))?;
        }
        Ok(())
    }
}

#[derive(
    Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub enum BlobOpType {
    Put,
    Delete,
}

impl Default for BlobOpType {
    fn default() -> Self {
        BlobOpType::Put
    }
}

/// Describes a volume at catalog creation time.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VolumeDesc {
    pub volume_id: VolumeId,
    pub name: String,
    /// Offset unit of every blob in the volume.
    pub max_object_size_bytes: u32,
}

impl VolumeDesc {
    pub fn new(volume_id: VolumeId, name: &str, max_object_size_bytes: u32) -> VolumeDesc {
        VolumeDesc {
            volume_id,
            name: name.to_string(),
            max_object_size_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_id_from_u64_is_never_null() {
        assert!(!ObjectId::from_u64(0).is_null());
        assert_ne!(ObjectId::from_u64(1), ObjectId::from_u64(2));
        assert!(ObjectId::NULL.is_null());
    }

    #[test]
    fn object_id_from_slice_checks_length() {
        let id = ObjectId::from_u64(7);
        assert_eq!(ObjectId::from_slice(id.as_bytes()), Ok(id));
        assert!(matches!(
            ObjectId::from_slice(&[1, 2, 3]),
            Err(Error::Corrupt(_))
        ));
    }
}
