//! Candidate traversal for failover

use crate::provider::{sort_candidates, ServerId, ServerRecord};

/// Result of asking for the next candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Next(ServerRecord),
    /// One full traversal went by without a successful switch
    Exhausted,
    /// No candidates at all
    Empty,
}

/// Ordered candidates plus traversal bookkeeping.
///
/// The successor is taken relative to the active server, or to the last
/// proposal when nothing is active (a failed start leaves no active
/// server). A traversal proposes at most `len - 1` servers before it is
/// declared exhausted; a successful switch starts a new traversal.
#[derive(Debug, Default)]
pub struct FailoverContext {
    candidates: Vec<ServerRecord>,
    index: Option<usize>,
    cycles: usize,
    last_proposed: Option<ServerId>,
}

impl FailoverContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preferred subset when it selects anything, otherwise everything;
    /// ordered by latency (unmeasured last), then name
    pub fn candidate_list(all: Vec<ServerRecord>, preferred: &[ServerId]) -> Vec<ServerRecord> {
        let mut candidates: Vec<ServerRecord> = if preferred.is_empty() {
            all
        } else {
            let subset: Vec<ServerRecord> = all.iter().filter(|r| preferred.contains(&r.id)).cloned().collect();
            if subset.is_empty() {
                all
            } else {
                subset
            }
        };
        sort_candidates(&mut candidates);
        candidates
    }

    pub fn set_candidates(&mut self, candidates: Vec<ServerRecord>) {
        self.candidates = candidates;
    }

    pub fn candidates(&self) -> &[ServerRecord] {
        &self.candidates
    }

    /// Position of the last proposal in the candidate list
    pub fn index(&self) -> Option<usize> {
        self.index
    }

    pub fn cycles(&self) -> usize {
        self.cycles
    }

    /// Start a fresh traversal
    pub fn reset(&mut self) {
        self.cycles = 0;
    }

    pub fn next_candidate(&mut self, active: Option<ServerId>) -> Selection {
        let len = self.candidates.len();
        if len == 0 {
            return Selection::Empty;
        }

        let anchor = active.or(self.last_proposed);
        let target = anchor
            .and_then(|id| self.candidates.iter().position(|r| r.id == id))
            .map(|pos| (pos + 1) % len)
            .unwrap_or(0);

        // Only possible with a single candidate that is already active
        if Some(self.candidates[target].id) == active {
            self.exhaust();
            return Selection::Exhausted;
        }

        let budget = (len - 1).max(1);
        if self.cycles >= budget {
            self.exhaust();
            return Selection::Exhausted;
        }

        self.cycles += 1;
        self.index = Some(target);
        let record = self.candidates[target].clone();
        self.last_proposed = Some(record.id);
        Selection::Next(record)
    }

    fn exhaust(&mut self) {
        self.cycles = 0;
        self.index = None;
        self.last_proposed = None;
    }
}
