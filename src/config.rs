//! Runtime configuration for the SCM core.

use std::time::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All recognized knobs, with the defaults a small test cluster would use.
#[derive(Debug, Clone)]
pub struct ScmConfig {
    /// Seconds between datanode heartbeats.
    pub heartbeat_interval: Duration,
    /// Silence after which a node is STALE. Must exceed the heartbeat interval.
    pub stale_after: Duration,
    /// Silence after which a node is DEAD. Must exceed `stale_after`.
    pub dead_after: Duration,
    /// How long a DEAD node lingers in the node table before removal.
    pub dead_node_grace: Duration,
    /// Pipeline quota per healthy metadata volume, unless overridden.
    pub pipelines_per_metadata_volume: u32,
    /// Cluster-wide per-node pipeline cap. Zero means "derive from volumes".
    pub pipeline_limit_override: u32,
    /// Logical container size.
    pub container_size_bytes: u64,
    /// Open-container provisioning inputs for `get_matching`.
    pub min_containers_per_datanode: u32,
    pub min_pipeline_count_per_datanode: u32,
    /// Wall-clock budget for a pipeline create to reach quorum.
    pub pipeline_create_timeout: Duration,
    /// Per-node datanode command mailbox depth.
    pub command_queue_depth: usize,
    /// Wall-clock deadline for a log submit.
    pub submit_timeout: Duration,
    pub safe_mode_enabled: bool,
    /// Minimum registered datanodes before pre-check completes.
    pub safe_mode_min_datanodes: usize,
    /// Fraction of containers that must report a replica, in `[0, 1]`.
    pub safe_mode_container_threshold: f64,
    /// Enables the two pipeline-availability rules.
    pub safe_mode_pipeline_availability_check: bool,
    /// Fraction of replicated pipelines that must be OPEN with a full
    /// member set, in `[0, 1]`.
    pub safe_mode_pipeline_threshold: f64,
    pub replication: ReplicationConfig,
    /// Client failover: total submit attempts before giving up.
    pub failover_max_attempts: u32,
    /// Client failover: base wait between same-leader retries.
    pub wait_between_retries: Duration,
}

impl Default for ScmConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(3),
            stale_after: Duration::from_secs(30),
            dead_after: Duration::from_secs(120),
            dead_node_grace: Duration::from_secs(600),
            pipelines_per_metadata_volume: 2,
            pipeline_limit_override: 0,
            container_size_bytes: 5 * 1024 * 1024 * 1024,
            min_containers_per_datanode: 4,
            min_pipeline_count_per_datanode: 2,
            pipeline_create_timeout: Duration::from_secs(60),
            command_queue_depth: 128,
            submit_timeout: Duration::from_secs(15),
            safe_mode_enabled: true,
            safe_mode_min_datanodes: 1,
            safe_mode_container_threshold: 0.99,
            safe_mode_pipeline_availability_check: false,
            safe_mode_pipeline_threshold: 0.10,
            replication: ReplicationConfig::replicated(3),
            failover_max_attempts: 15,
            wait_between_retries: Duration::from_millis(2000),
        }
    }
}

impl ScmConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stale_after <= self.heartbeat_interval {
            return Err(ConfigError::StaleBeforeHeartbeat {
                stale_after: self.stale_after,
                heartbeat_interval: self.heartbeat_interval,
            });
        }
        if self.dead_after <= self.stale_after {
            return Err(ConfigError::DeadBeforeStale {
                dead_after: self.dead_after,
                stale_after: self.stale_after,
            });
        }
        for (name, value) in [
            ("safe_mode.container_threshold", self.safe_mode_container_threshold),
            ("safe_mode.pipeline_threshold", self.safe_mode_pipeline_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::ThresholdOutOfRange { name, value });
            }
        }
        if self.command_queue_depth == 0 {
            return Err(ConfigError::EmptyCommandQueue);
        }
        if self.failover_max_attempts == 0 {
            return Err(ConfigError::ZeroFailoverAttempts);
        }
        self.replication.validate()
    }
}

/// Replication shape of a pipeline: a single-copy pipeline or a quorum of N.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicationConfig {
    pub kind: ReplicationKind,
    pub factor: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicationKind {
    Standalone,
    Replicated,
}

impl ReplicationConfig {
    pub fn standalone() -> Self {
        Self {
            kind: ReplicationKind::Standalone,
            factor: 1,
        }
    }

    pub fn replicated(factor: u8) -> Self {
        Self {
            kind: ReplicationKind::Replicated,
            factor,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid = match self.kind {
            ReplicationKind::Standalone => self.factor == 1,
            ReplicationKind::Replicated => self.factor == 1 || self.factor == 3,
        };
        if valid {
            Ok(())
        } else {
            Err(ConfigError::UnsupportedReplication {
                kind: self.kind,
                factor: self.factor,
            })
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("stale_after {stale_after:?} must exceed heartbeat_interval {heartbeat_interval:?}")]
    StaleBeforeHeartbeat {
        stale_after: Duration,
        heartbeat_interval: Duration,
    },

    #[error("dead_after {dead_after:?} must exceed stale_after {stale_after:?}")]
    DeadBeforeStale {
        dead_after: Duration,
        stale_after: Duration,
    },

    #[error("{name} = {value} outside [0, 1]")]
    ThresholdOutOfRange { name: &'static str, value: f64 },

    #[error("command queue depth must be non-zero")]
    EmptyCommandQueue,

    #[error("failover_max_attempts must be non-zero")]
    ZeroFailoverAttempts,

    #[error("unsupported replication {kind:?}/{factor}")]
    UnsupportedReplication { kind: ReplicationKind, factor: u8 },
}
