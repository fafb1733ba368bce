use std::collections::VecDeque;

use tracing::warn;

use crate::model::description::IceCandidate;

/// Remote candidates that arrived before the session could apply them.
///
/// Bounded: once full, newer candidates are dropped, since the ones already
/// queued are the earliest in the peer's gathering order.
#[derive(Debug)]
pub struct CandidateQueue {
    queue: VecDeque<IceCandidate>,
    capacity: usize,
    dropped: usize,
}

impl CandidateQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            capacity,
            dropped: 0,
        }
    }

    /// Returns false if the queue was full and the candidate was dropped.
    pub fn push(&mut self, candidate: IceCandidate) -> bool {
        if self.queue.len() >= self.capacity {
            self.dropped += 1;
            warn!(
                "Candidate queue full ({}), dropping candidate: {}",
                self.capacity, candidate.candidate
            );
            return false;
        }

        self.queue.push_back(candidate);
        true
    }

    /// Takes every queued candidate in arrival order.
    pub fn drain(&mut self) -> Vec<IceCandidate> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn dropped(&self) -> usize {
        self.dropped
    }
}
