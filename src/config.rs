// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::Error;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables of one [crate::DataManager]. Embedding processes deserialize this
/// from whatever configuration source they use; every field has a default.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DmConfig {
    /// Bound on staged offsets and staged objects per transaction.
    pub max_staged_entries: usize,

    /// Offset units held by extent 0 of every blob.
    pub extent0_capacity: u32,

    /// Offset units held by each of extents 1..N.
    pub extent_capacity: u32,

    /// Replica RPCs not answered within this interval count as failed.
    #[serde(with = "millis")]
    pub replica_timeout: Duration,

    /// Commits retained per volume for replica catch-up.
    pub commit_log_retention: usize,

    /// A migration that shows no progress for this long is aborted.
    #[serde(with = "millis")]
    pub migration_progress_timeout: Duration,

    /// Extent records per baseline chunk during catalog sync.
    pub sync_batch_entries: usize,

    /// Committed object payloads kept in the object cache.
    pub object_cache_entries: usize,
}

impl Default for DmConfig {
    fn default() -> Self {
        DmConfig {
            max_staged_entries: 1024,
            extent0_capacity: 32,
            extent_capacity: 1024,
            replica_timeout: Duration::from_secs(5),
            commit_log_retention: 4096,
            migration_progress_timeout: Duration::from_secs(30),
            sync_batch_entries: 256,
            object_cache_entries: 4096,
        }
    }
}

impl DmConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.extent0_capacity == 0 || self.extent_capacity == 0 {
            return Err(Error::InvalidConfig(
                "extent capacities must be non-zero".to_string(),
            ));
        }
        if self.sync_batch_entries == 0 {
            return Err(Error::InvalidConfig(
                "sync_batch_entries must be non-zero".to_string(),
            ));
        }
        if self.replica_timeout == Duration::from_millis(0) {
            return Err(Error::InvalidConfig(
                "replica_timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::{convert::TryFrom, time::Duration};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(DmConfig::default().validate(), Ok(()));
    }

    #[test]
    fn zero_extent_capacity_is_rejected() {
        let cfg = DmConfig {
            extent_capacity: 0,
            ..DmConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn durations_travel_as_millis() {
        let cfg = DmConfig {
            replica_timeout: Duration::from_millis(250),
            ..DmConfig::default()
        };
        let bytes = bincode::serialize(&cfg).unwrap();
        let back: DmConfig = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.replica_timeout, Duration::from_millis(250));
        assert_eq!(back, cfg);
    }
}
