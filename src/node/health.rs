use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Health states of a registered datanode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeHealth {
    Healthy,
    Stale,
    Dead,
    Decommissioning,
    Decommissioned,
}

impl NodeHealth {
    /// Nodes usable as pipeline members.
    pub fn is_available(&self) -> bool {
        matches!(self, NodeHealth::Healthy)
    }

    /// Nodes that still count toward an OPEN pipeline's member set.
    pub fn sustains_open_pipeline(&self) -> bool {
        matches!(self, NodeHealth::Healthy | NodeHealth::Stale)
    }
}

/// Heartbeat-silence thresholds. `dead_after > stale_after > heartbeat
/// interval` is enforced by config validation.
#[derive(Debug, Clone, Copy)]
pub struct HealthThresholds {
    pub stale_after: Duration,
    pub dead_after: Duration,
}

impl HealthThresholds {
    /// Classifies a node by heartbeat silence. A node heard from exactly
    /// `stale_after` ago is still HEALTHY; the transition fires strictly
    /// after the threshold.
    pub fn classify(&self, silence: Duration) -> NodeHealth {
        if silence > self.dead_after {
            NodeHealth::Dead
        } else if silence > self.stale_after {
            NodeHealth::Stale
        } else {
            NodeHealth::Healthy
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> HealthThresholds {
        HealthThresholds {
            stale_after: Duration::from_secs(30),
            dead_after: Duration::from_secs(120),
        }
    }

    #[test]
    fn classify_is_healthy_at_exact_threshold() {
        let t = thresholds();
        assert_eq!(t.classify(Duration::from_secs(30)), NodeHealth::Healthy);
        assert_eq!(
            t.classify(Duration::from_secs(30) + Duration::from_millis(1)),
            NodeHealth::Stale
        );
    }

    #[test]
    fn classify_dead_past_dead_after() {
        let t = thresholds();
        assert_eq!(t.classify(Duration::from_secs(120)), NodeHealth::Stale);
        assert_eq!(
            t.classify(Duration::from_secs(120) + Duration::from_millis(1)),
            NodeHealth::Dead
        );
    }

    #[test]
    fn availability_follows_health() {
        assert!(NodeHealth::Healthy.is_available());
        assert!(!NodeHealth::Stale.is_available());
        assert!(NodeHealth::Stale.sustains_open_pipeline());
        assert!(!NodeHealth::Dead.sustains_open_pipeline());
        assert!(!NodeHealth::Decommissioning.is_available());
    }
}
