use crate::config::ReplicationConfig;
use crate::error::ScmError;
use crate::ids::{member_set_hash, NodeId, PipelineId};
use serde::{Deserialize, Serialize};

/// Pipeline lifecycle. CLOSED is terminal; a closed pipeline is removed from
/// the store once no open container references it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineState {
    Allocated,
    Open,
    Dormant,
    Closed,
}

impl PipelineState {
    /// Legal edges: ALLOCATED→{OPEN, CLOSED}, OPEN→DORMANT, DORMANT→OPEN,
    /// and any→CLOSED. DORMANT is reachable only from OPEN; a close racing
    /// an ALLOCATED pipeline resolves straight to CLOSED.
    pub fn can_transition(self, to: PipelineState) -> bool {
        if to == PipelineState::Closed {
            return self != PipelineState::Closed;
        }
        matches!(
            (self, to),
            (PipelineState::Allocated, PipelineState::Open)
                | (PipelineState::Open, PipelineState::Dormant)
                | (PipelineState::Dormant, PipelineState::Open)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == PipelineState::Closed
    }
}

/// A replicated write-quorum. Members are pairwise distinct, the list length
/// equals the replication factor, and the leader (for replicated pipelines)
/// is the first entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: PipelineId,
    pub replication: ReplicationConfig,
    pub members: Vec<NodeId>,
    pub state: PipelineState,
    pub created_at_ms: u64,
    pub member_hash: u64,
}

impl Pipeline {
    pub fn new(
        id: PipelineId,
        replication: ReplicationConfig,
        members: Vec<NodeId>,
        created_at_ms: u64,
    ) -> Result<Self, ScmError> {
        if members.len() != replication.factor as usize {
            return Err(ScmError::invalid_transition(format!(
                "pipeline {id} has {} members for factor {}",
                members.len(),
                replication.factor
            )));
        }
        let mut deduped = members.clone();
        deduped.sort();
        deduped.dedup();
        if deduped.len() != members.len() {
            return Err(ScmError::invalid_transition(format!(
                "pipeline {id} members are not pairwise distinct"
            )));
        }
        let member_hash = member_set_hash(&members);
        Ok(Self {
            id,
            replication,
            members,
            state: PipelineState::Allocated,
            created_at_ms,
            member_hash,
        })
    }

    pub fn leader(&self) -> Option<&NodeId> {
        self.members.first()
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.members.contains(node)
    }

    pub fn is_open(&self) -> bool {
        self.state == PipelineState::Open
    }

    pub fn transition(&mut self, to: PipelineState) -> Result<(), ScmError> {
        if self.state == to {
            return Ok(());
        }
        if !self.state.can_transition(to) {
            return Err(ScmError::invalid_transition(format!(
                "pipeline {} cannot move {:?} -> {:?}",
                self.id, self.state, to
            )));
        }
        self.state = to;
        Ok(())
    }
}
