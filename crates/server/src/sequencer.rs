//! Per-session sequencing and the missed-frame buffer.
//!
//! Every response and push a session emits is numbered here and recorded
//! in the buffer *before* any delivery is attempted. Frames leave the
//! buffer only when the client acknowledges them, so whether a socket
//! died before, during, or after a send has no bearing on what a resume
//! can replay.

use std::collections::VecDeque;

use tether_protocol::Frame;

/// Monotonic sequence counter with acknowledgment tracking.
///
/// Numbers start at 1 and never reset while the session lives.
#[derive(Debug, Default)]
pub(crate) struct Sequencer {
    last_assigned: u64,
    last_acked: u64,
}

impl Sequencer {
    /// Hands out the next sequence number.
    pub fn assign(&mut self) -> u64 {
        self.last_assigned += 1;
        self.last_assigned
    }

    pub fn last_assigned(&self) -> u64 {
        self.last_assigned
    }

    pub fn last_acked(&self) -> u64 {
        self.last_acked
    }

    /// Records an acknowledgment up to `seq`. Claims beyond the last
    /// assigned number are clamped; stale (lower) acks are ignored.
    pub fn acknowledge(&mut self, seq: u64) {
        let seq = seq.min(self.last_assigned);
        if seq > self.last_acked {
            self.last_acked = seq;
        }
    }
}

/// Bounded queue of sequenced frames awaiting acknowledgment.
#[derive(Debug)]
pub(crate) struct MissedBuffer {
    entries: VecDeque<(u64, Frame)>,
    cap: usize,
    /// Highest sequence number evicted without acknowledgment. A resume at
    /// or below this point has an unclosable gap.
    evicted: u64,
}

impl MissedBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            cap: cap.max(1),
            evicted: 0,
        }
    }

    /// Appends a frame under its sequence number, evicting the oldest
    /// entry when the buffer is over capacity.
    pub fn record(&mut self, seq: u64, frame: Frame) {
        self.entries.push_back((seq, frame));
        if self.entries.len() > self.cap
            && let Some((evicted_seq, _)) = self.entries.pop_front()
        {
            self.evicted = evicted_seq;
        }
    }

    /// Drops every entry at or below `seq`.
    pub fn acknowledge(&mut self, seq: u64) {
        while self.entries.front().is_some_and(|(s, _)| *s <= seq) {
            self.entries.pop_front();
        }
    }

    /// Clones out every frame with a sequence number strictly greater than
    /// `after`, oldest first. Entries stay buffered; only acknowledgment
    /// removes them.
    pub fn frames_after(&self, after: u64) -> Vec<Frame> {
        self.entries
            .iter()
            .filter(|(seq, _)| *seq > after)
            .map(|(_, frame)| frame.clone())
            .collect()
    }

    pub fn evicted_through(&self) -> u64 {
        self.evicted
    }

    /// Empties the buffer and forgets eviction history. Used when a
    /// session restarts its stream at the current watermark.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.evicted = 0;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Outcome of a resume attempt against the session's buffered history.
#[derive(Debug)]
pub(crate) enum ResumeDecision {
    /// The gap closes: replay these frames, oldest first.
    Replay(Vec<Frame>),
    /// The gap cannot be closed; the client must reload.
    Reload,
}

/// Evaluates a client's reported last-processed sequence number.
///
/// The report is trusted as the exact lower edge of the replay window. It
/// is rejected when it claims the future, when it predates an eviction, or
/// when it contradicts the client's own earlier acknowledgments.
pub(crate) fn resume_from(seq: &Sequencer, buffer: &MissedBuffer, after: u64) -> ResumeDecision {
    if after > seq.last_assigned() || after < buffer.evicted_through() || after < seq.last_acked() {
        return ResumeDecision::Reload;
    }
    ResumeDecision::Replay(buffer.frames_after(after))
}
