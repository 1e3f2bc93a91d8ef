use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Identifier of an SCM replica participating in the log.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        PeerId::new(value)
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        PeerId::new(value)
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QuorumConfig {
    voters: usize,
}

impl QuorumConfig {
    pub fn new(voters: usize) -> Self {
        assert!(voters >= 1, "log needs at least one voter");
        Self { voters }
    }

    pub fn voters(&self) -> usize {
        self.voters
    }

    pub fn quorum(&self) -> usize {
        self.voters / 2 + 1
    }
}

/// A peer's replication progress as acknowledged back to the leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PeerProgress {
    pub matched_term: u64,
    pub matched_index: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuorumStatus {
    pub committed_index: u64,
    pub committed_term: u64,
    pub quorum_size: usize,
}

/// Tracks per-peer matched positions and advances the committed index once a
/// majority replicated an entry from the leader's own term.
#[derive(Debug)]
pub struct CommitTracker {
    config: QuorumConfig,
    progress: HashMap<PeerId, PeerProgress>,
    committed_index: u64,
    committed_term: u64,
}

impl CommitTracker {
    pub fn new(config: QuorumConfig) -> Self {
        Self {
            config,
            progress: HashMap::with_capacity(config.voters()),
            committed_index: 0,
            committed_term: 0,
        }
    }

    pub fn register_peer(&mut self, peer: impl Into<PeerId>) {
        self.progress.entry(peer.into()).or_default();
    }

    pub fn record_ack(
        &mut self,
        peer: impl Into<PeerId>,
        term: u64,
        index: u64,
    ) -> Result<(), QuorumError> {
        let peer = peer.into();
        let label = peer.clone();
        let progress = self.progress.entry(peer).or_default();

        if index < progress.matched_index {
            warn!(
                "event=quorum_ack_regression peer={} previous={} observed={}",
                label, progress.matched_index, index
            );
            return Err(QuorumError::IndexRegression {
                previous: progress.matched_index,
                observed: index,
            });
        }
        if index == progress.matched_index && index != 0 && term < progress.matched_term {
            warn!(
                "event=quorum_term_regression peer={} index={} previous={} observed={}",
                label, index, progress.matched_term, term
            );
            return Err(QuorumError::TermRegressionAtIndex {
                index,
                previous: progress.matched_term,
                observed: term,
            });
        }
        progress.matched_index = index;
        progress.matched_term = term;
        Ok(())
    }

    /// Advances the commit point: the index replicated by a quorum, provided
    /// the entry carries the leader's current term.
    pub fn advance_commit(&mut self, leader_term: u64) -> u64 {
        if self.progress.len() < self.config.quorum() {
            return self.committed_index;
        }
        let mut matches: Vec<PeerProgress> = self.progress.values().copied().collect();
        matches.sort_by(|a, b| {
            a.matched_index
                .cmp(&b.matched_index)
                .then_with(|| a.matched_term.cmp(&b.matched_term))
        });
        let candidate = matches[matches.len() - self.config.quorum()];
        if candidate.matched_index > self.committed_index && candidate.matched_term == leader_term {
            self.committed_index = candidate.matched_index;
            self.committed_term = candidate.matched_term;
            info!(
                "event=commit_advance committed_index={} committed_term={} quorum={}",
                self.committed_index,
                self.committed_term,
                self.config.quorum()
            );
        }
        self.committed_index
    }

    pub fn status(&self) -> QuorumStatus {
        QuorumStatus {
            committed_index: self.committed_index,
            committed_term: self.committed_term,
            quorum_size: self.config.quorum(),
        }
    }

    pub fn committed_index(&self) -> u64 {
        self.committed_index
    }

    /// Re-arms the tracker after a leadership change or snapshot install.
    pub fn reset_to(&mut self, term: u64, index: u64) {
        self.committed_index = index;
        self.committed_term = term;
        for progress in self.progress.values_mut() {
            *progress = PeerProgress::default();
        }
    }
}

#[derive(Debug, Error)]
pub enum QuorumError {
    #[error("ack index regression: previous {previous}, observed {observed}")]
    IndexRegression { previous: u64, observed: u64 },

    #[error("ack term regression at index {index}: previous {previous}, observed {observed}")]
    TermRegressionAtIndex {
        index: u64,
        previous: u64,
        observed: u64,
    },
}
