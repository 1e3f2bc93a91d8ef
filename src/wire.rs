//! Length-prefixed structured-binary messages for everything that crosses the
//! replicated log or the datanode/client RPC surface.
//!
//! Field numbers are stable and additive-only: never re-use or re-type an
//! existing tag, or rolling upgrades lose the ability to replay older logs.

use crate::config::{ReplicationConfig, ReplicationKind};
use crate::container::{ContainerState, LifecycleEvent};
use crate::error::ScmError;
use crate::ids::{ContainerId, NodeId, PipelineId};
use crate::node::{DatanodeCommand, DatanodeCommandKind};
use crate::pipeline::PipelineState;
use prost::Message;

pub fn encode_message<M: Message>(message: &M) -> Vec<u8> {
    message.encode_to_vec()
}

pub fn decode_message<M: Message + Default>(raw: &[u8]) -> Result<M, ScmError> {
    M::decode(raw).map_err(|err| ScmError::Metadata(format!("undecodable message: {err}")))
}

pub fn parse_node_id(raw: &str) -> Result<NodeId, ScmError> {
    raw.parse()
        .map_err(|_| ScmError::Metadata(format!("bad node id `{raw}`")))
}

pub fn parse_pipeline_id(raw: &str) -> Result<PipelineId, ScmError> {
    raw.parse()
        .map_err(|_| ScmError::Metadata(format!("bad pipeline id `{raw}`")))
}

pub fn parse_node_ids(raw: &[String]) -> Result<Vec<NodeId>, ScmError> {
    raw.iter().map(|id| parse_node_id(id)).collect()
}

// ---------------------------------------------------------------------------
// Replicated command envelope
// ---------------------------------------------------------------------------

/// Typed tag routing an envelope to its state manager's apply entry point.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum CommandKind {
    Unspecified = 0,
    Node = 1,
    Pipeline = 2,
    Container = 3,
    Meta = 4,
}

/// One replicated command. All non-determinism (clock, fresh ids, chosen
/// members) is resolved by the leader at submit time and carried here, so the
/// apply path stays a pure function of `(state, envelope)`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CommandEnvelope {
    #[prost(enumeration = "CommandKind", tag = "1")]
    pub kind: i32,
    #[prost(uint32, tag = "2")]
    pub method: u32,
    #[prost(bytes = "vec", tag = "3")]
    pub args: Vec<u8>,
    /// Leader wall clock at submit, milliseconds since the epoch.
    #[prost(uint64, tag = "4")]
    pub stamped_at_ms: u64,
    /// Optional client dedup key.
    #[prost(string, tag = "5")]
    pub client_id: String,
    #[prost(uint64, tag = "6")]
    pub sequence: u64,
}

// ---------------------------------------------------------------------------
// Node messages
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum VolumeKind {
    Unspecified = 0,
    Disk = 1,
    Ssd = 2,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeDetailsMsg {
    #[prost(string, tag = "1")]
    pub node_id: String,
    #[prost(string, tag = "2")]
    pub hostname: String,
    #[prost(string, tag = "3")]
    pub ip: String,
    #[prost(uint32, tag = "4")]
    pub port: u32,
    #[prost(string, tag = "5")]
    pub location: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StorageReportMsg {
    #[prost(string, tag = "1")]
    pub volume: String,
    #[prost(uint64, tag = "2")]
    pub capacity: u64,
    #[prost(uint64, tag = "3")]
    pub used: u64,
    #[prost(uint64, tag = "4")]
    pub remaining: u64,
    #[prost(enumeration = "VolumeKind", tag = "5")]
    pub kind: i32,
    #[prost(bool, tag = "6")]
    pub failed: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeReportMsg {
    #[prost(message, repeated, tag = "1")]
    pub storage: Vec<StorageReportMsg>,
    #[prost(uint32, tag = "2")]
    pub metadata_volume_count: u32,
}

/// The persisted shape of a node in the `nodes` table. Heartbeat timestamps
/// and health are replica-local and deliberately absent.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeInfoMsg {
    #[prost(message, optional, tag = "1")]
    pub details: Option<NodeDetailsMsg>,
    #[prost(message, optional, tag = "2")]
    pub report: Option<NodeReportMsg>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterNodeArgs {
    #[prost(message, optional, tag = "1")]
    pub details: Option<NodeDetailsMsg>,
    #[prost(message, optional, tag = "2")]
    pub node_report: Option<NodeReportMsg>,
    #[prost(string, repeated, tag = "3")]
    pub pipeline_ids: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RemoveNodeArgs {
    #[prost(string, tag = "1")]
    pub node_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterNodeReply {
    #[prost(string, tag = "1")]
    pub cluster_id: String,
    #[prost(string, tag = "2")]
    pub scm_id: String,
    #[prost(string, tag = "3")]
    pub node_id: String,
    #[prost(bool, tag = "4")]
    pub already_registered: bool,
}

// ---------------------------------------------------------------------------
// Pipeline messages
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ReplicationKindMsg {
    Unspecified = 0,
    Standalone = 1,
    Replicated = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum PipelineStateMsg {
    Unspecified = 0,
    Allocated = 1,
    Open = 2,
    Dormant = 3,
    Closed = 4,
}

/// The persisted shape of a pipeline in the `pipelines` table. Members are
/// ordered, leader first.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PipelineMsg {
    #[prost(string, tag = "1")]
    pub pipeline_id: String,
    #[prost(enumeration = "ReplicationKindMsg", tag = "2")]
    pub replication: i32,
    #[prost(uint32, tag = "3")]
    pub factor: u32,
    #[prost(string, repeated, tag = "4")]
    pub members: Vec<String>,
    #[prost(enumeration = "PipelineStateMsg", tag = "5")]
    pub state: i32,
    #[prost(uint64, tag = "6")]
    pub created_at_ms: u64,
    #[prost(uint64, tag = "7")]
    pub member_hash: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreatePipelineArgs {
    #[prost(message, optional, tag = "1")]
    pub pipeline: Option<PipelineMsg>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdatePipelineStateArgs {
    #[prost(string, tag = "1")]
    pub pipeline_id: String,
    #[prost(enumeration = "PipelineStateMsg", tag = "2")]
    pub state: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RemovePipelineArgs {
    #[prost(string, tag = "1")]
    pub pipeline_id: String,
}

// ---------------------------------------------------------------------------
// Container messages
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ContainerStateMsg {
    Unspecified = 0,
    Open = 1,
    Closing = 2,
    QuasiClosed = 3,
    Closed = 4,
    Deleting = 5,
    Deleted = 6,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum LifecycleEventMsg {
    Unspecified = 0,
    Finalize = 1,
    QuasiClose = 2,
    Close = 3,
    ForceClose = 4,
    Delete = 5,
    Cleanup = 6,
}

/// The persisted shape of a container in the `containers` table.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContainerInfoMsg {
    #[prost(uint64, tag = "1")]
    pub container_id: u64,
    #[prost(string, tag = "2")]
    pub pipeline_id: String,
    #[prost(enumeration = "ContainerStateMsg", tag = "3")]
    pub state: i32,
    #[prost(uint64, tag = "4")]
    pub used_bytes: u64,
    #[prost(uint64, tag = "5")]
    pub key_count: u64,
    #[prost(uint64, tag = "6")]
    pub state_entered_at_ms: u64,
    #[prost(string, tag = "7")]
    pub owner: String,
    #[prost(enumeration = "ReplicationKindMsg", tag = "8")]
    pub replication: i32,
    #[prost(uint32, tag = "9")]
    pub factor: u32,
    #[prost(uint64, tag = "10")]
    pub delete_txn_id: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AllocateContainerArgs {
    #[prost(string, tag = "1")]
    pub pipeline_id: String,
    #[prost(string, tag = "2")]
    pub owner: String,
    #[prost(enumeration = "ReplicationKindMsg", tag = "3")]
    pub replication: i32,
    #[prost(uint32, tag = "4")]
    pub factor: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContainerEventArgs {
    #[prost(uint64, tag = "1")]
    pub container_id: u64,
    #[prost(enumeration = "LifecycleEventMsg", tag = "2")]
    pub event: i32,
}

// ---------------------------------------------------------------------------
// Datanode commands and reports
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum CommandTypeMsg {
    Unspecified = 0,
    CreatePipeline = 1,
    ClosePipeline = 2,
    CloseContainer = 3,
    ReplicateContainer = 4,
    DeleteContainer = 5,
    DeleteBlocks = 6,
    Reregister = 7,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DatanodeCommandMsg {
    #[prost(enumeration = "CommandTypeMsg", tag = "1")]
    pub kind: i32,
    /// Leader term the command was issued under. A datanode drops commands
    /// whose term regresses for the same kind.
    #[prost(uint64, tag = "2")]
    pub term: u64,
    #[prost(string, tag = "3")]
    pub pipeline_id: String,
    #[prost(uint64, tag = "4")]
    pub container_id: u64,
    #[prost(string, repeated, tag = "5")]
    pub members: Vec<String>,
    #[prost(string, repeated, tag = "6")]
    pub sources: Vec<String>,
    #[prost(uint64, tag = "7")]
    pub txn_id: u64,
    #[prost(uint64, repeated, tag = "8")]
    pub block_ids: Vec<u64>,
    #[prost(bool, tag = "9")]
    pub force: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HeartbeatArgs {
    #[prost(string, tag = "1")]
    pub node_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HeartbeatReply {
    #[prost(message, repeated, tag = "1")]
    pub commands: Vec<DatanodeCommandMsg>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContainerReplicaMsg {
    #[prost(uint64, tag = "1")]
    pub container_id: u64,
    #[prost(enumeration = "ContainerStateMsg", tag = "2")]
    pub state: i32,
    #[prost(uint64, tag = "3")]
    pub bytes_used: u64,
    #[prost(uint64, tag = "4")]
    pub key_count: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContainerReportArgs {
    #[prost(string, tag = "1")]
    pub node_id: String,
    #[prost(message, repeated, tag = "2")]
    pub replicas: Vec<ContainerReplicaMsg>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PipelineReportArgs {
    #[prost(string, tag = "1")]
    pub node_id: String,
    #[prost(string, repeated, tag = "2")]
    pub pipeline_ids: Vec<String>,
}

// ---------------------------------------------------------------------------
// RPC framing
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum AdminOp {
    Unspecified = 0,
    NodeList = 1,
    PipelineList = 2,
    GetContainer = 3,
    SafeModeStatus = 4,
    ContainerEvent = 5,
    GetVersion = 6,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AdminRequest {
    #[prost(enumeration = "AdminOp", tag = "1")]
    pub op: i32,
    #[prost(uint64, tag = "2")]
    pub container_id: u64,
    #[prost(enumeration = "LifecycleEventMsg", tag = "3")]
    pub event: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AdminReply {
    #[prost(message, repeated, tag = "1")]
    pub nodes: Vec<NodeInfoMsg>,
    #[prost(message, repeated, tag = "2")]
    pub pipelines: Vec<PipelineMsg>,
    #[prost(message, repeated, tag = "3")]
    pub containers: Vec<ContainerInfoMsg>,
    #[prost(bool, tag = "4")]
    pub in_safe_mode: bool,
    #[prost(bool, tag = "5")]
    pub pre_check_complete: bool,
    #[prost(string, tag = "6")]
    pub cluster_id: String,
    #[prost(string, tag = "7")]
    pub scm_id: String,
    #[prost(string, tag = "8")]
    pub software_version: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcRequest {
    #[prost(uint64, tag = "1")]
    pub request_id: u64,
    #[prost(oneof = "RpcRequestBody", tags = "2, 3, 4, 5, 6")]
    pub body: Option<RpcRequestBody>,
}

#[derive(Clone, PartialEq, ::prost::Oneof)]
pub enum RpcRequestBody {
    #[prost(message, tag = "2")]
    Register(RegisterNodeArgs),
    #[prost(message, tag = "3")]
    Heartbeat(HeartbeatArgs),
    #[prost(message, tag = "4")]
    ContainerReport(ContainerReportArgs),
    #[prost(message, tag = "5")]
    PipelineReport(PipelineReportArgs),
    #[prost(message, tag = "6")]
    Admin(AdminRequest),
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcReply {
    #[prost(uint64, tag = "1")]
    pub request_id: u64,
    /// Zero on success, otherwise [`ScmError::result_code`].
    #[prost(uint32, tag = "2")]
    pub code: u32,
    #[prost(string, tag = "3")]
    pub message: String,
    #[prost(oneof = "RpcReplyBody", tags = "4, 5, 6")]
    pub body: Option<RpcReplyBody>,
}

#[derive(Clone, PartialEq, ::prost::Oneof)]
pub enum RpcReplyBody {
    #[prost(message, tag = "4")]
    Register(RegisterNodeReply),
    #[prost(message, tag = "5")]
    Heartbeat(HeartbeatReply),
    #[prost(message, tag = "6")]
    Admin(AdminReply),
}

// ---------------------------------------------------------------------------
// Wire <-> domain conversions
// ---------------------------------------------------------------------------

impl From<ReplicationKind> for ReplicationKindMsg {
    fn from(kind: ReplicationKind) -> Self {
        match kind {
            ReplicationKind::Standalone => Self::Standalone,
            ReplicationKind::Replicated => Self::Replicated,
        }
    }
}

pub fn replication_from_wire(kind: i32, factor: u32) -> Result<ReplicationConfig, ScmError> {
    let kind = match ReplicationKindMsg::try_from(kind) {
        Ok(ReplicationKindMsg::Standalone) => ReplicationKind::Standalone,
        Ok(ReplicationKindMsg::Replicated) => ReplicationKind::Replicated,
        _ => return Err(ScmError::Metadata(format!("bad replication kind {kind}"))),
    };
    let factor = u8::try_from(factor)
        .map_err(|_| ScmError::Metadata(format!("bad replication factor {factor}")))?;
    Ok(ReplicationConfig { kind, factor })
}

impl From<PipelineState> for PipelineStateMsg {
    fn from(state: PipelineState) -> Self {
        match state {
            PipelineState::Allocated => Self::Allocated,
            PipelineState::Open => Self::Open,
            PipelineState::Dormant => Self::Dormant,
            PipelineState::Closed => Self::Closed,
        }
    }
}

pub fn pipeline_state_from_wire(state: i32) -> Result<PipelineState, ScmError> {
    match PipelineStateMsg::try_from(state) {
        Ok(PipelineStateMsg::Allocated) => Ok(PipelineState::Allocated),
        Ok(PipelineStateMsg::Open) => Ok(PipelineState::Open),
        Ok(PipelineStateMsg::Dormant) => Ok(PipelineState::Dormant),
        Ok(PipelineStateMsg::Closed) => Ok(PipelineState::Closed),
        _ => Err(ScmError::Metadata(format!("bad pipeline state {state}"))),
    }
}

impl From<ContainerState> for ContainerStateMsg {
    fn from(state: ContainerState) -> Self {
        match state {
            ContainerState::Open => Self::Open,
            ContainerState::Closing => Self::Closing,
            ContainerState::QuasiClosed => Self::QuasiClosed,
            ContainerState::Closed => Self::Closed,
            ContainerState::Deleting => Self::Deleting,
            ContainerState::Deleted => Self::Deleted,
        }
    }
}

pub fn container_state_from_wire(state: i32) -> Result<ContainerState, ScmError> {
    match ContainerStateMsg::try_from(state) {
        Ok(ContainerStateMsg::Open) => Ok(ContainerState::Open),
        Ok(ContainerStateMsg::Closing) => Ok(ContainerState::Closing),
        Ok(ContainerStateMsg::QuasiClosed) => Ok(ContainerState::QuasiClosed),
        Ok(ContainerStateMsg::Closed) => Ok(ContainerState::Closed),
        Ok(ContainerStateMsg::Deleting) => Ok(ContainerState::Deleting),
        Ok(ContainerStateMsg::Deleted) => Ok(ContainerState::Deleted),
        _ => Err(ScmError::Metadata(format!("bad container state {state}"))),
    }
}

impl From<LifecycleEvent> for LifecycleEventMsg {
    fn from(event: LifecycleEvent) -> Self {
        match event {
            LifecycleEvent::Finalize => Self::Finalize,
            LifecycleEvent::QuasiClose => Self::QuasiClose,
            LifecycleEvent::Close => Self::Close,
            LifecycleEvent::ForceClose => Self::ForceClose,
            LifecycleEvent::Delete => Self::Delete,
            LifecycleEvent::Cleanup => Self::Cleanup,
        }
    }
}

pub fn lifecycle_event_from_wire(event: i32) -> Result<LifecycleEvent, ScmError> {
    match LifecycleEventMsg::try_from(event) {
        Ok(LifecycleEventMsg::Finalize) => Ok(LifecycleEvent::Finalize),
        Ok(LifecycleEventMsg::QuasiClose) => Ok(LifecycleEvent::QuasiClose),
        Ok(LifecycleEventMsg::Close) => Ok(LifecycleEvent::Close),
        Ok(LifecycleEventMsg::ForceClose) => Ok(LifecycleEvent::ForceClose),
        Ok(LifecycleEventMsg::Delete) => Ok(LifecycleEvent::Delete),
        Ok(LifecycleEventMsg::Cleanup) => Ok(LifecycleEvent::Cleanup),
        _ => Err(ScmError::Metadata(format!("bad lifecycle event {event}"))),
    }
}

impl From<&DatanodeCommand> for DatanodeCommandMsg {
    fn from(command: &DatanodeCommand) -> Self {
        let mut msg = DatanodeCommandMsg {
            term: command.term,
            ..Default::default()
        };
        match &command.kind {
            DatanodeCommandKind::CreatePipeline { pipeline, members } => {
                msg.kind = CommandTypeMsg::CreatePipeline as i32;
                msg.pipeline_id = pipeline.to_string();
                msg.members = members.iter().map(ToString::to_string).collect();
            }
            DatanodeCommandKind::ClosePipeline { pipeline } => {
                msg.kind = CommandTypeMsg::ClosePipeline as i32;
                msg.pipeline_id = pipeline.to_string();
            }
            DatanodeCommandKind::CloseContainer { container, force } => {
                msg.kind = CommandTypeMsg::CloseContainer as i32;
                msg.container_id = container.value();
                msg.force = *force;
            }
            DatanodeCommandKind::ReplicateContainer { container, sources } => {
                msg.kind = CommandTypeMsg::ReplicateContainer as i32;
                msg.container_id = container.value();
                msg.sources = sources.iter().map(ToString::to_string).collect();
            }
            DatanodeCommandKind::DeleteContainer { container } => {
                msg.kind = CommandTypeMsg::DeleteContainer as i32;
                msg.container_id = container.value();
            }
            DatanodeCommandKind::DeleteBlocks { txn_id, blocks } => {
                msg.kind = CommandTypeMsg::DeleteBlocks as i32;
                msg.txn_id = *txn_id;
                msg.block_ids = blocks.clone();
            }
            DatanodeCommandKind::Reregister => {
                msg.kind = CommandTypeMsg::Reregister as i32;
            }
        }
        msg
    }
}

impl TryFrom<&DatanodeCommandMsg> for DatanodeCommand {
    type Error = ScmError;

    fn try_from(msg: &DatanodeCommandMsg) -> Result<Self, Self::Error> {
        let kind = match CommandTypeMsg::try_from(msg.kind) {
            Ok(CommandTypeMsg::CreatePipeline) => DatanodeCommandKind::CreatePipeline {
                pipeline: parse_pipeline_id(&msg.pipeline_id)?,
                members: parse_node_ids(&msg.members)?,
            },
            Ok(CommandTypeMsg::ClosePipeline) => DatanodeCommandKind::ClosePipeline {
                pipeline: parse_pipeline_id(&msg.pipeline_id)?,
            },
            Ok(CommandTypeMsg::CloseContainer) => DatanodeCommandKind::CloseContainer {
                container: ContainerId::new(msg.container_id),
                force: msg.force,
            },
            Ok(CommandTypeMsg::ReplicateContainer) => DatanodeCommandKind::ReplicateContainer {
                container: ContainerId::new(msg.container_id),
                sources: parse_node_ids(&msg.sources)?,
            },
            Ok(CommandTypeMsg::DeleteContainer) => DatanodeCommandKind::DeleteContainer {
                container: ContainerId::new(msg.container_id),
            },
            Ok(CommandTypeMsg::DeleteBlocks) => DatanodeCommandKind::DeleteBlocks {
                txn_id: msg.txn_id,
                blocks: msg.block_ids.clone(),
            },
            Ok(CommandTypeMsg::Reregister) => DatanodeCommandKind::Reregister,
            _ => {
                return Err(ScmError::Metadata(format!(
                    "bad datanode command kind {}",
                    msg.kind
                )))
            }
        };
        Ok(DatanodeCommand::new(msg.term, kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_survives_encode_decode() {
        let envelope = CommandEnvelope {
            kind: CommandKind::Container as i32,
            method: 3,
            args: vec![1, 2, 3],
            stamped_at_ms: 42_000,
            client_id: "client-a".into(),
            sequence: 9,
        };
        let raw = encode_message(&envelope);
        let decoded: CommandEnvelope = decode_message(&raw).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn datanode_command_round_trips() {
        let command = DatanodeCommand::new(
            7,
            DatanodeCommandKind::ReplicateContainer {
                container: ContainerId::new(31),
                sources: vec![NodeId::random(), NodeId::random()],
            },
        );
        let msg = DatanodeCommandMsg::from(&command);
        assert_eq!(msg.term, 7);
        let back = DatanodeCommand::try_from(&msg).unwrap();
        assert_eq!(back, command);
    }

    #[test]
    fn unknown_enum_value_is_metadata_error() {
        let msg = DatanodeCommandMsg {
            kind: 99,
            ..Default::default()
        };
        assert!(matches!(
            DatanodeCommand::try_from(&msg).unwrap_err(),
            ScmError::Metadata(_)
        ));
    }

    #[test]
    fn rpc_request_oneof_round_trips() {
        let request = RpcRequest {
            request_id: 11,
            body: Some(RpcRequestBody::Heartbeat(HeartbeatArgs {
                node_id: NodeId::random().to_string(),
            })),
        };
        let raw = encode_message(&request);
        let decoded: RpcRequest = decode_message(&raw).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        let raw = vec![0xff; 16];
        assert!(decode_message::<RpcRequest>(&raw).is_err());
    }
}
