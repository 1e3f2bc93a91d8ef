//! Cluster-control core of a distributed object store.
//!
//! The Storage Container Manager (SCM) tracks the datanode fleet, groups
//! nodes into replicated write-quorums (pipelines), allocates logical
//! containers onto those pipelines, and replicates every mutating decision
//! across its replicas through an ordered command log. A multi-rule safe
//! mode gates client traffic on startup.
#![deny(unreachable_pub)]
#![deny(unused_must_use)]

pub mod bootstrap;
pub mod config;
pub mod consensus;
pub mod container;
pub mod error;
pub mod events;
pub mod gateway;
pub mod ids;
pub mod kv;
#[cfg(feature = "net")]
pub mod net;
pub mod node;
pub mod pipeline;
pub mod safemode;
pub mod scm;
pub mod telemetry;
pub mod wire;

pub use bootstrap::{
    begin_layout_upgrade, finish_layout_upgrade, initialize_or_load, BootstrapError, ScmStorage,
    VersionFile, CURRENT_LAYOUT_VERSION,
};
pub use config::{ConfigError, ReplicationConfig, ReplicationKind, ScmConfig};
pub use consensus::{
    CommandExecutor, FailoverConfig, FailoverSchedule, FailoverStep, LogEntry, LogMetadata,
    LogMetadataStore, LogStore, PeerId, ReplicatedLog, ReplicatedLogConfig, Role, SubmitHandle,
    TermIndex,
};
pub use container::{
    ContainerInfo, ContainerManager, ContainerManagerConfig, ContainerReplica, ContainerState,
    LifecycleEvent,
};
pub use error::ScmError;
pub use events::{EventBus, EventRecorder, SafeModeStatus, ScmEvent};
pub use gateway::{Clock, HaGateway, ManualClock, SystemClock};
pub use ids::{member_set_hash, ClusterId, ContainerId, NodeId, PipelineId, ScmId};
pub use kv::{
    install_checkpoint, verify_checkpoint, write_checkpoint, CheckpointManifest, CheckpointSigner,
    KvError, KvStore, WriteBatch,
};
#[cfg(feature = "net")]
pub use net::{
    load_identity_from_pem, load_trust_store_from_pem, NetError, RpcClient, RpcServer,
    RpcServerConfig, RpcServerHandle,
};
pub use node::{
    DatanodeCommand, DatanodeCommandKind, DnsToSwitch, EnqueueOutcome, NodeHealth, NodeManager,
    NodeRecord, StaticTableResolver, SweepReport,
};
pub use pipeline::{
    Pipeline, PipelineManager, PipelineState, PlacementPolicy, RandomPlacement,
    TopologyAwarePlacement,
};
pub use safemode::{SafeModeManager, SafeModeRule, SafeModeSample};
pub use scm::{RpcHandler, Scm, ScmBuilder};
pub use telemetry::{MetricsRegistry, MetricsSnapshot, SharedMetricsRegistry};
