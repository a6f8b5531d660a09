use std::time::Duration;

use crate::model::RevisionList;

/// Default number of revisions collected into a single `_revs_diff`/
/// `_bulk_docs` round before the diff/upload stage is triggered (spec §4.2).
pub const DEFAULT_BATCH_CAPACITY: usize = 100;

/// Maximum time a partially-filled batch waits for more revisions before it
/// is flushed anyway, so a trickle of changes doesn't stall indefinitely
/// behind an empty inbox (spec §4.2).
pub const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_millis(500);

/// Accumulates incoming revisions into capacity-bounded batches.
#[derive(Debug)]
pub struct InboxBatcher {
    capacity: usize,
    timeout: Duration,
    pending: RevisionList,
}

impl InboxBatcher {
    pub fn new(capacity: usize, timeout: Duration) -> Self {
        Self {
            capacity,
            timeout,
            pending: RevisionList::new(),
        }
    }

    /// Adds `revision` to the current batch. Returns the full batch if this
    /// push filled it to capacity.
    pub fn push(&mut self, revision: crate::model::Revision) -> Option<RevisionList> {
        self.pending.push(revision);
        if self.pending.len() >= self.capacity {
            Some(self.take())
        } else {
            None
        }
    }

    /// Removes and returns everything accumulated so far, leaving the batch empty.
    pub fn take(&mut self) -> RevisionList {
        std::mem::take(&mut self.pending)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for InboxBatcher {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_CAPACITY, DEFAULT_BATCH_TIMEOUT)
    }
}
