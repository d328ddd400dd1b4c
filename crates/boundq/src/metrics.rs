/// Counters describing the traffic a queue has seen.
///
/// Updated under the queue lock, so a snapshot is always self-consistent:
/// `pushed - popped - cleared == len`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueMetrics {
    /// Items accepted by `push`
    pub pushed: u64,
    /// Items rejected by `push` because the queue was full
    pub dropped: u64,
    /// Items handed out by `pop`
    pub popped: u64,
    /// Items discarded by `clear`
    pub cleared: u64,
}

impl QueueMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Items currently accounted as queued.
    pub fn in_flight(&self) -> u64 {
        self.pushed - self.popped - self.cleared
    }
}
