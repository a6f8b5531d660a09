use std::collections::BTreeSet;

/// Tracks local sequences currently in flight (queued for diff, queued for
/// upload, or uploading) and derives the checkpoint candidate from them
/// (spec §3, §4.8).
///
/// Invariant: `pending` never contains a sequence <= the current checkpoint.
#[derive(Debug)]
pub struct PendingSequences {
    pending: BTreeSet<u64>,
    max_pending_sequence: u64,
    checkpoint: u64,
}

/// What happened to the checkpoint as a result of a `remove`/`acknowledge_filtered` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointAdvance {
    None,
    To(u64),
}

impl PendingSequences {
    pub fn new(checkpoint: u64) -> Self {
        Self {
            pending: BTreeSet::new(),
            max_pending_sequence: checkpoint,
            checkpoint,
        }
    }

    pub fn checkpoint(&self) -> u64 {
        self.checkpoint
    }

    pub fn max_pending_sequence(&self) -> u64 {
        self.max_pending_sequence
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn count(&self) -> usize {
        self.pending.len()
    }

    pub fn contains(&self, sequence: u64) -> bool {
        self.pending.contains(&sequence)
    }

    /// Inserts `sequence`, ascending as the change feed guarantees (spec §5).
    pub fn add(&mut self, sequence: u64) {
        self.pending.insert(sequence);
        self.max_pending_sequence = self.max_pending_sequence.max(sequence);
    }

    /// Removes `sequence`, returning the new checkpoint if removing it
    /// allowed the checkpoint to advance.
    ///
    /// If `sequence` was never tracked, a warning is logged and the
    /// checkpoint is never advanced, even if it happens to look like the
    /// current minimum — this is the conservative behavior called out as an
    /// open question in spec §9: "never advance the checkpoint when the
    /// removed sequence was not tracked".
    pub fn remove(&mut self, sequence: u64) -> CheckpointAdvance {
        let was_minimum = self.pending.iter().next() == Some(&sequence);
        let was_tracked = self.pending.remove(&sequence);

        if !was_tracked {
            tracing::warn!(sequence, "removePending called for an untracked sequence");
            return CheckpointAdvance::None;
        }

        if !was_minimum {
            return CheckpointAdvance::None;
        }

        self.advance_to(match self.pending.iter().next() {
            Some(&new_min) => new_min.saturating_sub(1),
            None => self.max_pending_sequence,
        })
    }

    /// Records that `sequence` was filtered out at the source and thus never
    /// entered `pending` at all. It is implicitly acknowledged: the
    /// checkpoint may advance past it once nothing lower is still
    /// outstanding (spec §4.2).
    pub fn acknowledge_filtered(&mut self, sequence: u64) -> CheckpointAdvance {
        self.max_pending_sequence = self.max_pending_sequence.max(sequence);
        if !self.pending.is_empty() {
            return CheckpointAdvance::None;
        }
        self.advance_to(sequence)
    }

    fn advance_to(&mut self, candidate: u64) -> CheckpointAdvance {
        if candidate > self.checkpoint {
            self.checkpoint = candidate;
            CheckpointAdvance::To(candidate)
        } else {
            CheckpointAdvance::None
        }
    }
}
