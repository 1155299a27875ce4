use std::collections::{HashSet, VecDeque};

use call_proto::{ParticipantId, PathCandidate};

/// Identity of a received candidate within a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CandidateSignature {
    pub sender: ParticipantId,
    pub candidate: PathCandidate,
}

/// Per-session record of applied candidates and the queue of candidates that
/// arrived before the remote description.
#[derive(Debug, Default)]
pub struct CandidateCache {
    seen: HashSet<CandidateSignature>,
    pending: VecDeque<PathCandidate>,
}

impl CandidateCache {
    /// Records the signature. Returns false when it was already seen.
    pub fn admit(&mut self, sender: &ParticipantId, candidate: &PathCandidate) -> bool {
        self.seen.insert(CandidateSignature {
            sender: sender.clone(),
            candidate: candidate.clone(),
        })
    }

    pub fn queue(&mut self, candidate: PathCandidate) {
        self.pending.push_back(candidate);
    }

    /// Takes queued candidates in arrival order.
    pub fn drain_pending(&mut self) -> Vec<PathCandidate> {
        self.pending.drain(..).collect()
    }

    /// Drops queued candidates; signatures are kept.
    pub fn discard_pending(&mut self) {
        self.pending.clear();
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn seen_len(&self) -> usize {
        self.seen.len()
    }
}
