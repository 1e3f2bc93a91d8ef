//! Startup admission barrier: SCM refuses mutating client traffic until
//! enough of the cluster has been observed.

mod manager;
mod rules;

pub use manager::{RuleStatus, SafeModeConfig, SafeModeManager};
pub use rules::{
    ContainerReplicaRule, HealthyPipelineRule, MinDatanodesRule, OneReplicaPipelineRule,
    SafeModeRule, SafeModeSample, CONTAINER_RULE, HEALTHY_PIPELINE_RULE, MIN_DATANODE_RULE,
    ONE_REPLICA_PIPELINE_RULE,
};
