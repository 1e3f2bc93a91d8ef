use crate::ids::{ContainerId, NodeId, PipelineId};
use log::warn;
use std::collections::VecDeque;

/// Commands a datanode picks up in its heartbeat reply. Every command is
/// stamped with the leader term it was issued under; datanodes drop commands
/// whose term regresses for the same command kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatanodeCommand {
    pub term: u64,
    pub kind: DatanodeCommandKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatanodeCommandKind {
    CreatePipeline {
        pipeline: PipelineId,
        members: Vec<NodeId>,
    },
    ClosePipeline {
        pipeline: PipelineId,
    },
    CloseContainer {
        container: ContainerId,
        force: bool,
    },
    ReplicateContainer {
        container: ContainerId,
        sources: Vec<NodeId>,
    },
    DeleteContainer {
        container: ContainerId,
    },
    DeleteBlocks {
        txn_id: u64,
        blocks: Vec<u64>,
    },
    Reregister,
}

impl DatanodeCommand {
    pub fn new(term: u64, kind: DatanodeCommandKind) -> Self {
        Self { term, kind }
    }

    /// Critical commands survive mailbox overflow; losing one would strand
    /// cluster state (an orphaned pipeline, a node that never re-registers).
    pub fn is_critical(&self) -> bool {
        matches!(
            self.kind,
            DatanodeCommandKind::ClosePipeline { .. } | DatanodeCommandKind::Reregister
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePushOutcome {
    Enqueued,
    /// Enqueued after evicting the oldest non-critical command.
    EnqueuedWithEviction,
    /// The mailbox was full of critical commands; the new one was dropped.
    Rejected,
}

/// Bounded per-node mailbox. Multi-producer (leader write paths, sweeper,
/// replication machinery), single-consumer (the heartbeat reply path, which
/// drains it exactly once per heartbeat).
#[derive(Debug)]
pub struct CommandQueue {
    node: NodeId,
    depth: usize,
    pending: VecDeque<DatanodeCommand>,
}

impl CommandQueue {
    pub fn new(node: NodeId, depth: usize) -> Self {
        Self {
            node,
            depth,
            pending: VecDeque::new(),
        }
    }

    pub fn push(&mut self, command: DatanodeCommand) -> QueuePushOutcome {
        if self.pending.len() < self.depth {
            self.pending.push_back(command);
            return QueuePushOutcome::Enqueued;
        }
        let evictable = self
            .pending
            .iter()
            .position(|queued| !queued.is_critical());
        match evictable {
            Some(position) => {
                let evicted = self.pending.remove(position);
                warn!(
                    "event=command_queue_overflow node={} evicted={:?}",
                    self.node,
                    evicted.map(|command| command.kind)
                );
                self.pending.push_back(command);
                QueuePushOutcome::EnqueuedWithEviction
            }
            None => {
                warn!(
                    "event=command_queue_saturated node={} dropped={:?}",
                    self.node, command.kind
                );
                QueuePushOutcome::Rejected
            }
        }
    }

    /// Empties the mailbox; each queued command is handed out exactly once.
    pub fn drain(&mut self) -> Vec<DatanodeCommand> {
        self.pending.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close_container(term: u64, id: u64) -> DatanodeCommand {
        DatanodeCommand::new(
            term,
            DatanodeCommandKind::CloseContainer {
                container: ContainerId::new(id),
                force: false,
            },
        )
    }

    #[test]
    fn drain_hands_out_each_command_once() {
        let mut queue = CommandQueue::new(NodeId::random(), 4);
        queue.push(close_container(1, 10));
        queue.push(close_container(1, 11));
        let first = queue.drain();
        assert_eq!(first.len(), 2);
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn overflow_evicts_oldest_non_critical() {
        let mut queue = CommandQueue::new(NodeId::random(), 2);
        queue.push(close_container(1, 10));
        queue.push(close_container(1, 11));
        let outcome = queue.push(close_container(1, 12));
        assert_eq!(outcome, QueuePushOutcome::EnqueuedWithEviction);
        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert!(matches!(
            drained[0].kind,
            DatanodeCommandKind::CloseContainer { container, .. }
                if container == ContainerId::new(11)
        ));
    }

    #[test]
    fn critical_commands_survive_overflow() {
        let mut queue = CommandQueue::new(NodeId::random(), 2);
        queue.push(DatanodeCommand::new(
            2,
            DatanodeCommandKind::ClosePipeline {
                pipeline: PipelineId::random(),
            },
        ));
        queue.push(DatanodeCommand::new(2, DatanodeCommandKind::Reregister));
        let outcome = queue.push(close_container(2, 20));
        assert_eq!(outcome, QueuePushOutcome::Rejected);
        assert_eq!(queue.len(), 2);
    }
}
