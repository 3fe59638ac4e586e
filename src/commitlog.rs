// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{CommitBatch, Error};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::trace;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitLogEntry {
    pub commit_id: u64,
    pub op_id: u64,
    pub batch: CommitBatch,
}

/// The most recent commits of one volume, kept so that a replica that missed
/// a few can replay them instead of copying the whole catalog.
#[derive(Clone, Debug)]
pub struct CommitLog {
    retention: usize,
    entries: VecDeque<CommitLogEntry>,
    // Highest commit id ever appended; survives trimming.
    last_commit_id: u64,
}

impl CommitLog {
    /// A log whose next entry will be `after_commit_id + 1`.
    pub fn new(retention: usize, after_commit_id: u64) -> CommitLog {
        CommitLog {
            retention,
            entries: VecDeque::new(),
            last_commit_id: after_commit_id,
        }
    }

    pub fn last_commit_id(&self) -> u64 {
        self.last_commit_id
    }

    /// Oldest commit id still retained, if any.
    pub fn first_commit_id(&self) -> Option<u64> {
        self.entries.front().map(|e| e.commit_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn append(&mut self, entry: CommitLogEntry) {
        assert_eq!(
            entry.commit_id,
            self.last_commit_id + 1,
            "commit log append out of order"
        );
        self.last_commit_id = entry.commit_id;
        self.entries.push_back(entry);
        while self.entries.len() > self.retention {
            self.entries.pop_front();
        }
    }

    /// Entries `start..=end` in commit order; `end` is clamped to the last
    /// appended commit. Fails with [Error::CommitLogTruncated] when `start` is
    /// older than what is retained.
    pub fn pull(&self, start: u64, end: u64) -> Result<Vec<CommitLogEntry>, Error> {
        let end = end.min(self.last_commit_id);
        if start > end {
            return Ok(Vec::new());
        }
        match self.first_commit_id() {
            Some(first) if first <= start => {}
            _ => return Err(Error::CommitLogTruncated),
        }
        let out: Vec<CommitLogEntry> = self
            .entries
            .iter()
            .filter(|e| e.commit_id >= start && e.commit_id <= end)
            .cloned()
            .collect();
        trace!("pulled commits {}..={} ({} entries)", start, end, out.len());
        Ok(out)
    }

    /// Restarts the log after the catalog was replaced by a full copy.
    pub fn reset(&mut self, after_commit_id: u64) {
        self.entries.clear();
        self.last_commit_id = after_commit_id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TxId;

    fn entry(commit_id: u64) -> CommitLogEntry {
        CommitLogEntry {
            commit_id,
            op_id: commit_id * 2,
            batch: CommitBatch::new("b", TxId(commit_id)),
        }
    }

    #[test]
    fn pull_within_retention() {
        let mut log = CommitLog::new(3, 0);
        for c in 1..=5 {
            log.append(entry(c));
        }
        assert_eq!(log.first_commit_id(), Some(3));
        let got: Vec<u64> = log.pull(4, 99).unwrap().iter().map(|e| e.commit_id).collect();
        assert_eq!(got, vec![4, 5]);
        assert_eq!(log.pull(2, 5), Err(Error::CommitLogTruncated));
        assert_eq!(log.pull(6, 9), Ok(vec![]));
    }

    #[test]
    fn empty_log_after_reset_is_truncated_for_old_commits() {
        let mut log = CommitLog::new(3, 0);
        log.append(entry(1));
        log.reset(10);
        assert_eq!(log.pull(5, 10), Err(Error::CommitLogTruncated));
        log.append(entry(11));
        assert_eq!(log.pull(11, 11).unwrap().len(), 1);
    }

    #[test]
    #[should_panic(expected = "out of order")]
    fn gaps_are_rejected() {
        let mut log = CommitLog::new(3, 0);
        log.append(entry(2));
    }
}
