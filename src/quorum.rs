// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Quorum sizes for volume groups, and a small tracker that counts replica
//! answers against one.

// The quorum is derived from the number of replicas the group was opened
// with, not from a user-supplied failure tolerance: a group that lost members
// keeps its original threshold and stops being functional when it can no
// longer meet it.
//
//  failures     | total     | majority     |
//  tolerated    | replicas  | quorum       |
//  `(n-1)/2`    | `n`       | `(n/2) + 1`  |
//  -------------|-----------|--------------|
//  0            |  1        |  1           |
//  0            |  2        |  2           |
//  1            |  3        |  2           |
//  1            |  4        |  3           |
//  2            |  5        |  3           |

use crate::{Error, ServiceId};
use std::collections::BTreeSet;

pub(crate) fn failures_tolerated(replica_count: usize) -> usize {
    if replica_count == 0 {
        0
    } else {
        (replica_count - 1) / 2
    }
}

pub(crate) fn majority_quorum(replica_count: usize) -> usize {
    (replica_count / 2) + 1
}

/// Counts acknowledgments and failures from one fan-out.
#[derive(Clone, Debug)]
pub struct QuorumTracker {
    needed: usize,
    outstanding: usize,
    acked: BTreeSet<ServiceId>,
    failed: BTreeSet<ServiceId>,
}

impl QuorumTracker {
    pub fn new(needed: usize, fanout: usize) -> QuorumTracker {
        QuorumTracker {
            needed,
            outstanding: fanout,
            acked: BTreeSet::new(),
            failed: BTreeSet::new(),
        }
    }

    pub fn ack(&mut self, from: ServiceId) {
        self.outstanding = self.outstanding.saturating_sub(1);
        self.acked.insert(from);
    }

    pub fn fail(&mut self, from: ServiceId) {
        self.outstanding = self.outstanding.saturating_sub(1);
        self.failed.insert(from);
    }

    pub fn is_met(&self) -> bool {
        self.acked.len() >= self.needed
    }

    /// True once the remaining answers can no longer make up the quorum.
    pub fn is_lost(&self) -> bool {
        self.acked.len() + self.outstanding < self.needed
    }

    pub fn is_done(&self) -> bool {
        self.outstanding == 0
    }

    pub fn acked(&self) -> &BTreeSet<ServiceId> {
        &self.acked
    }

    pub fn failed(&self) -> &BTreeSet<ServiceId> {
        &self.failed
    }

    pub fn result(&self) -> Result<(), Error> {
        if self.is_met() {
            Ok(())
        } else {
            Err(Error::QuorumNotMet)
        }
    }
}

#[test]
fn test_quorums() {
    assert_eq!(failures_tolerated(1), 0);
    assert_eq!(failures_tolerated(2), 0);
    assert_eq!(failures_tolerated(3), 1);
    assert_eq!(failures_tolerated(4), 1);
    assert_eq!(failures_tolerated(5), 2);

    assert_eq!(majority_quorum(1), 1);
    assert_eq!(majority_quorum(2), 2);
    assert_eq!(majority_quorum(3), 2);
    assert_eq!(majority_quorum(4), 3);
    assert_eq!(majority_quorum(5), 3);
}

#[test]
fn test_tracker() {
    let mut t = QuorumTracker::new(2, 3);
    t.fail(ServiceId(1));
    assert!(!t.is_met());
    assert!(!t.is_lost());
    t.ack(ServiceId(2));
    t.ack(ServiceId(3));
    assert!(t.is_met());
    assert!(t.is_done());
    assert_eq!(t.result(), Ok(()));

    let mut t = QuorumTracker::new(2, 3);
    t.fail(ServiceId(1));
    t.fail(ServiceId(2));
    assert!(t.is_lost());
    assert_eq!(t.result(), Err(Error::QuorumNotMet));
    assert_eq!(t.failed().len(), 2);
}
