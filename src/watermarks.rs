// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{Error, VolumeDesc, VolumeId};
use serde::{Deserialize, Serialize};

/**
 * Every replica of a volume tracks a pair of watermarks. Both are
 * monotonically increasing counters assigned by the group coordinator.
 *
 * The op watermark counts every mutation the coordinator sent to the group,
 * including non-committing ones (staging updates that only touch the
 * transaction manager). It tells a replica whether it has seen everything the
 * coordinator issued.
 *
 * The commit watermark counts durable catalog commits only. Commits must be
 * applied in exactly this order: a replica at commit `c` accepts `c + 1`,
 * ignores anything at or below `c`, and reports a gap for anything above
 * `c + 1`. The commit log and catch-up replay are indexed by this counter.
 *
 * Both live in the volume's reserved catalog record and are written in the
 * same atomic batch as the extents of the commit that advanced them, so after
 * a crash the watermark never claims more than the catalog holds.
 */

/// Highest coordinator op applied at this replica.
#[derive(
    Clone, Copy, Debug, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub struct AppliedOpId(pub u64);

/// Highest commit applied to this replica's catalog.
#[derive(
    Clone, Copy, Debug, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub struct AppliedCommitId(pub u64);

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VolumeWatermarks {
    pub applied_op_id: AppliedOpId,
    pub applied_commit_id: AppliedCommitId,
}

impl VolumeWatermarks {
    pub fn next_commit_id(&self) -> u64 {
        self.applied_commit_id.0 + 1
    }

    pub fn advance_op(&mut self, op_id: u64) {
        if op_id > self.applied_op_id.0 {
            self.applied_op_id = AppliedOpId(op_id);
        }
    }

    /// Records commit `commit_id` as applied. Commits must arrive in strict
    /// order; anything else is a bug in the caller's sequencing.
    pub fn advance_commit(&mut self, op_id: u64, commit_id: u64) {
        assert_eq!(
            commit_id,
            self.next_commit_id(),
            "commit {} applied out of order after {}",
            commit_id,
            self.applied_commit_id.0
        );
        self.applied_commit_id = AppliedCommitId(commit_id);
        self.advance_op(op_id);
    }
}

/// The volume-level record kept under the reserved catalog key.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMeta {
    pub desc: VolumeDesc,
    pub watermarks: VolumeWatermarks,
    pub deleted: bool,
    pub read_only: bool,
    /// Source volume when this catalog was produced as a snapshot copy.
    pub snapshot_of: Option<VolumeId>,
}

impl VolumeMeta {
    pub fn new(desc: VolumeDesc) -> VolumeMeta {
        VolumeMeta {
            desc,
            ..Default::default()
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<VolumeMeta, Error> {
        Ok(bincode::deserialize(bytes)?)
    }
}
