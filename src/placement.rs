// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Placement tables as this DM sees them, and the per-volume migration state
//! machine that runs when a new table moves a volume elsewhere.
//!
//! Tables are computed by an orchestrator and pushed to every DM in two
//! steps: a new target table is announced, then committed (or aborted). While
//! a target is pending, volumes this DM is giving up are synced to their new
//! owner and local commits of transactions that began under the old table are
//! forwarded there.

use crate::{DmtVersion, Error, ServiceId, VolumeId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Data Management Table: the ordered replica list of every volume. The first
/// entry of a column is the volume's primary.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dmt {
    pub version: DmtVersion,
    pub columns: BTreeMap<VolumeId, Vec<ServiceId>>,
}

impl Dmt {
    pub fn new(version: DmtVersion) -> Dmt {
        Dmt {
            version,
            columns: BTreeMap::new(),
        }
    }

    pub fn with_column(mut self, vol: VolumeId, replicas: Vec<ServiceId>) -> Dmt {
        self.columns.insert(vol, replicas);
        self
    }

    pub fn replicas(&self, vol: VolumeId) -> &[ServiceId] {
        self.columns.get(&vol).map(|c| c.as_slice()).unwrap_or(&[])
    }

    pub fn primary(&self, vol: VolumeId) -> Option<ServiceId> {
        self.replicas(vol).first().copied()
    }

    pub fn hosts(&self, vol: VolumeId, svc: ServiceId) -> bool {
        self.replicas(vol).contains(&svc)
    }
}

#[derive(Clone, Debug, Default)]
pub struct PlacementState {
    committed: Dmt,
    target: Option<Dmt>,
    dlt_version: u64,
    // Volumes whose commits are forwarded, to the destination named here.
    forwarding: BTreeMap<VolumeId, ServiceId>,
}

impl PlacementState {
    pub fn new(initial: Dmt) -> PlacementState {
        PlacementState {
            committed: initial,
            ..Default::default()
        }
    }

    pub fn committed(&self) -> &Dmt {
        &self.committed
    }

    pub fn target(&self) -> Option<&Dmt> {
        self.target.as_ref()
    }

    pub fn current_dmt_version(&self) -> DmtVersion {
        self.committed.version
    }

    pub fn dlt_version(&self) -> u64 {
        self.dlt_version
    }

    /// Records a newly announced table. It must be newer than the committed
    /// one; re-announcing the pending target is harmless.
    pub fn notify_dmt_update(&mut self, dmt: Dmt) -> Result<(), Error> {
        if dmt.version <= self.committed.version {
            return Err(Error::IllegalTransition(format!(
                "DMT {:?} is not newer than committed {:?}",
                dmt.version, self.committed.version
            )));
        }
        if let Some(t) = &self.target {
            if t.version != dmt.version {
                return Err(Error::IllegalTransition(format!(
                    "DMT {:?} announced while {:?} is pending",
                    dmt.version, t.version
                )));
            }
        }
        info!("target DMT now {:?}", dmt.version);
        self.target = Some(dmt);
        Ok(())
    }

    /// Makes the pending target the committed table and ends all forwarding.
    pub fn commit_dmt(&mut self, version: DmtVersion) -> Result<(), Error> {
        match self.target.take() {
            Some(t) if t.version == version => {
                info!("committed DMT {:?}", version);
                self.committed = t;
                self.forwarding.clear();
                Ok(())
            }
            other => {
                let pending = other.as_ref().map(|t| t.version);
                self.target = other;
                Err(Error::IllegalTransition(format!(
                    "commit of DMT {:?} while {:?} is pending",
                    version, pending
                )))
            }
        }
    }

    pub fn abort_dmt(&mut self) {
        if let Some(t) = self.target.take() {
            info!("aborted DMT {:?}", t.version);
        }
        self.forwarding.clear();
    }

    pub fn notify_dlt_update(&mut self, version: u64) {
        if version > self.dlt_version {
            debug!("DLT now {}", version);
            self.dlt_version = version;
        }
    }

    /// Volumes whose primary moves away from `me` under the pending target,
    /// with their new primary.
    pub fn volumes_moving_away(&self, me: ServiceId) -> Vec<(VolumeId, ServiceId)> {
        let target = match &self.target {
            Some(t) => t,
            None => return Vec::new(),
        };
        self.committed
            .columns
            .iter()
            .filter(|(_, col)| col.first() == Some(&me))
            .filter_map(|(vol, _)| match target.primary(*vol) {
                Some(dst) if dst != me => Some((*vol, dst)),
                _ => None,
            })
            .collect()
    }

    pub fn start_forwarding(&mut self, vol: VolumeId, dest: ServiceId) {
        self.forwarding.insert(vol, dest);
    }

    pub fn stop_forwarding(&mut self, vol: VolumeId) {
        self.forwarding.remove(&vol);
    }

    pub fn is_forwarding(&self, vol: VolumeId) -> bool {
        self.forwarding.contains_key(&vol)
    }

    /// The node a commit must also be sent to: set when `vol` is being
    /// forwarded and the transaction began under a table older than the
    /// pending target.
    pub fn forward_target(&self, vol: VolumeId, tx_dmt_version: DmtVersion) -> Option<ServiceId> {
        let dest = self.forwarding.get(&vol)?;
        match &self.target {
            Some(t) if tx_dmt_version < t.version => Some(*dest),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MigrationState {
    Idle,
    Preparing,
    Syncing,
    Forwarding,
    Closing,
    Committed,
    Aborted,
}

#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MigrationEvent {
    Prepare,
    SyncStarted,
    BaselineDone,
    FwdDone,
    Commit,
    Abort,
    Timeout,
}

/// What the owner of a migration does on entering a state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MigrationAction {
    /// Turn on forwarding and take the baseline snapshot.
    BeginSync,
    SendBaseline,
    /// Baseline acknowledged; live commits now flow to the destination.
    ForwardLive,
    SendFwdDone,
    ReleaseVolume,
    RollBack,
}

impl MigrationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, MigrationState::Committed | MigrationState::Aborted)
    }

    pub fn on_enter(self) -> Option<MigrationAction> {
        use MigrationAction::*;
        use MigrationState::*;
        match self {
            Idle => None,
            Preparing => Some(BeginSync),
            Syncing => Some(SendBaseline),
            Forwarding => Some(ForwardLive),
            Closing => Some(SendFwdDone),
            Committed => Some(ReleaseVolume),
            Aborted => Some(RollBack),
        }
    }
}

/// The transition table. `None` means the event is illegal in that state.
pub fn transition(state: MigrationState, event: MigrationEvent) -> Option<MigrationState> {
    use MigrationEvent::*;
    use MigrationState::*;
    match (state, event) {
        (Idle, Prepare) | (Committed, Prepare) | (Aborted, Prepare) => Some(Preparing),
        (Preparing, SyncStarted) => Some(Syncing),
        (Syncing, BaselineDone) => Some(Forwarding),
        (Forwarding, FwdDone) => Some(Closing),
        (Closing, Commit) => Some(Committed),
        (Preparing, Abort)
        | (Syncing, Abort)
        | (Forwarding, Abort)
        | (Closing, Abort)
        | (Preparing, Timeout)
        | (Syncing, Timeout)
        | (Forwarding, Timeout)
        | (Closing, Timeout) => Some(Aborted),
        _ => None,
    }
}

#[derive(Clone, Debug)]
pub struct DmtMigrationFsm {
    pub volume_id: VolumeId,
    pub dest: ServiceId,
    state: MigrationState,
}

impl DmtMigrationFsm {
    pub fn new(volume_id: VolumeId, dest: ServiceId) -> DmtMigrationFsm {
        DmtMigrationFsm {
            volume_id,
            dest,
            state: MigrationState::Idle,
        }
    }

    pub fn state(&self) -> MigrationState {
        self.state
    }

    /// Applies `event`, returning the action for the state entered.
    pub fn fire(&mut self, event: MigrationEvent) -> Result<Option<MigrationAction>, Error> {
        match transition(self.state, event) {
            Some(next) => {
                debug!(
                    "{:?} migration: {:?} --{:?}--> {:?}",
                    self.volume_id, self.state, event, next
                );
                self.state = next;
                Ok(next.on_enter())
            }
            None => Err(Error::IllegalTransition(format!(
                "{:?} migration: {:?} in state {:?}",
                self.volume_id, event, self.state
            ))),
        }
    }
}
