use crate::error::ScmError;
use crate::ids::NodeId;
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};

/// Chooses pipeline members from the healthy fleet. Runs only on the leader
/// at submit time; the chosen members travel inside the command payload, so
/// policies are free to use randomness.
pub trait PlacementPolicy: Send + Sync {
    fn choose(
        &self,
        candidates: &[NodeId],
        exclude: &HashSet<NodeId>,
        needed: usize,
        size_hint: u64,
    ) -> Result<Vec<NodeId>, ScmError>;
}

fn usable<'c>(candidates: &'c [NodeId], exclude: &HashSet<NodeId>) -> Vec<&'c NodeId> {
    candidates
        .iter()
        .filter(|node| !exclude.contains(*node))
        .collect()
}

/// Uniform random choice over the usable candidates.
#[derive(Debug, Default)]
pub struct RandomPlacement;

impl PlacementPolicy for RandomPlacement {
    fn choose(
        &self,
        candidates: &[NodeId],
        exclude: &HashSet<NodeId>,
        needed: usize,
        _size_hint: u64,
    ) -> Result<Vec<NodeId>, ScmError> {
        let usable = usable(candidates, exclude);
        if usable.len() < needed {
            return Err(ScmError::InsufficientDatanodes {
                needed,
                available: usable.len(),
            });
        }
        let mut rng = rand::thread_rng();
        Ok(usable
            .choose_multiple(&mut rng, needed)
            .map(|node| **node)
            .collect())
    }
}

/// Spreads members across racks: at most one member per rack while distinct
/// racks remain, then falls back to packing.
pub struct TopologyAwarePlacement {
    locations: HashMap<NodeId, String>,
}

impl TopologyAwarePlacement {
    pub fn new(locations: HashMap<NodeId, String>) -> Self {
        Self { locations }
    }

    fn rack_of(&self, node: &NodeId) -> &str {
        self.locations
            .get(node)
            .map(String::as_str)
            .unwrap_or(crate::node::DEFAULT_RACK)
    }
}

impl PlacementPolicy for TopologyAwarePlacement {
    fn choose(
        &self,
        candidates: &[NodeId],
        exclude: &HashSet<NodeId>,
        needed: usize,
        _size_hint: u64,
    ) -> Result<Vec<NodeId>, ScmError> {
        let mut usable = usable(candidates, exclude);
        if usable.len() < needed {
            return Err(ScmError::InsufficientDatanodes {
                needed,
                available: usable.len(),
            });
        }
        let mut rng = rand::thread_rng();
        usable.shuffle(&mut rng);

        let mut chosen: Vec<NodeId> = Vec::with_capacity(needed);
        let mut used_racks: HashSet<&str> = HashSet::new();
        for node in &usable {
            if chosen.len() == needed {
                break;
            }
            let rack = self.rack_of(*node);
            if used_racks.insert(rack) {
                chosen.push(**node);
            }
        }
        // Not enough distinct racks: pack remaining slots from the leftovers.
        if chosen.len() < needed {
            for node in &usable {
                if chosen.len() == needed {
                    break;
                }
                if !chosen.contains(*node) {
                    chosen.push(**node);
                }
            }
        }
        Ok(chosen)
    }
}
