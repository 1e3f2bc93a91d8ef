//! Datanode fleet tracking: registration, heartbeats, health, topology, and
//! the per-node command mailbox.

mod commands;
mod health;
mod manager;
mod topology;

pub use commands::{CommandQueue, DatanodeCommand, DatanodeCommandKind, QueuePushOutcome};
pub use health::{HealthThresholds, NodeHealth};
pub use manager::{
    disk_report, EnqueueOutcome, NodeManager, NodeManagerConfig, NodeRecord, NodeStats,
    RegisterOutcome, SweepReport, VersionInfo,
};
pub use topology::{CachingResolver, DnsToSwitch, StaticTableResolver, DEFAULT_RACK};
