//! The Storage Container Manager facade: wires the replicated log, the HA
//! gateway, the three state managers, and the safe-mode controller, and
//! exposes the datanode/client RPC surface.

use crate::bootstrap::{initialize_or_load, ScmStorage, VersionFile};
use crate::config::{ReplicationConfig, ReplicationKind, ScmConfig};
use crate::consensus::{PeerId, ReplicatedLog, ReplicatedLogConfig};
use crate::container::{
    ContainerInfo, ContainerManager, ContainerManagerConfig, ContainerReplica, LifecycleEvent,
};
use crate::error::ScmError;
use crate::events::{EventBus, SafeModeStatus};
use crate::gateway::{Clock, HaGateway};
use crate::ids::{ContainerId, NodeId, PipelineId};
use crate::kv::{CheckpointSigner, KvStore};
use crate::node::{
    CachingResolver, DnsToSwitch, HealthThresholds, NodeManager, NodeManagerConfig, SweepReport,
};
use crate::pipeline::{
    PipelineManager, PipelineManagerConfig, PipelineState, PlacementPolicy,
};
use crate::safemode::{SafeModeConfig, SafeModeManager, SafeModeSample};
use crate::telemetry::SharedMetricsRegistry;
use crate::wire::{
    container_state_from_wire, lifecycle_event_from_wire, parse_node_id, parse_pipeline_id,
    AdminOp, AdminReply, AdminRequest, CommandKind, ContainerReportArgs, DatanodeCommandMsg,
    HeartbeatArgs, HeartbeatReply, NodeDetailsMsg, NodeInfoMsg, NodeReportMsg, PipelineReportArgs,
    RegisterNodeArgs, RegisterNodeReply, RpcReply, RpcReplyBody, RpcRequest, RpcRequestBody,
};
use log::{info, warn};
use std::collections::HashSet;
use std::sync::Arc;

/// Transport-facing request handler; the net server drives this.
pub trait RpcHandler: Send + Sync {
    fn handle(&self, request: RpcRequest) -> RpcReply;
}

/// Everything needed to bring up one SCM replica.
pub struct ScmBuilder {
    pub config: ScmConfig,
    pub storage: ScmStorage,
    pub peer: PeerId,
    pub voters: Vec<PeerId>,
    pub clock: Arc<dyn Clock>,
    pub resolver: Arc<dyn DnsToSwitch>,
    pub placement: Arc<dyn PlacementPolicy>,
    pub checkpoint_key: Vec<u8>,
}

/// One SCM replica.
pub struct Scm {
    config: ScmConfig,
    version: VersionFile,
    storage: ScmStorage,
    kv: Arc<KvStore>,
    log: Arc<ReplicatedLog>,
    clock: Arc<dyn Clock>,
    pub nodes: Arc<NodeManager>,
    pub pipelines: Arc<PipelineManager>,
    pub containers: Arc<ContainerManager>,
    pub safe_mode: Arc<SafeModeManager>,
    pub bus: EventBus,
    pub metrics: SharedMetricsRegistry,
}

impl Scm {
    pub fn bootstrap(builder: ScmBuilder) -> Result<Self, ScmError> {
        builder
            .config
            .validate()
            .map_err(|err| ScmError::Internal(format!("invalid configuration: {err}")))?;

        let now_ms = builder.clock.now_ms();
        let version = initialize_or_load(&builder.storage, now_ms)
            .map_err(|err| ScmError::Metadata(err.to_string()))?;

        let kv = Arc::new(
            KvStore::open(builder.storage.db_dir())
                .map_err(|err| ScmError::Metadata(err.to_string()))?,
        );
        let signer = CheckpointSigner::new(builder.checkpoint_key);
        let log = Arc::new(ReplicatedLog::open(
            ReplicatedLogConfig {
                peer: builder.peer,
                voters: builder.voters,
            },
            builder.storage.log_file(),
            builder.storage.log_metadata_file(),
            kv.clone(),
            signer,
        )?);
        let gateway = HaGateway::new(log.clone(), builder.clock.clone(), builder.config.submit_timeout);

        let bus = EventBus::new();
        let metrics = SharedMetricsRegistry::new("scm");

        let nodes = Arc::new(NodeManager::new(
            NodeManagerConfig {
                thresholds: HealthThresholds {
                    stale_after: builder.config.stale_after,
                    dead_after: builder.config.dead_after,
                },
                dead_node_grace: builder.config.dead_node_grace,
                command_queue_depth: builder.config.command_queue_depth,
                pipelines_per_metadata_volume: builder.config.pipelines_per_metadata_volume,
                pipeline_limit_override: builder.config.pipeline_limit_override,
            },
            version.cluster_id.clone(),
            version.scm_id,
            gateway.clone(),
            CachingResolver::new(builder.resolver),
            kv.clone(),
            bus.clone(),
            metrics.clone(),
        ));
        let pipelines = Arc::new(PipelineManager::new(
            PipelineManagerConfig {
                create_timeout: builder.config.pipeline_create_timeout,
                container_size_bytes: builder.config.container_size_bytes,
            },
            gateway.clone(),
            kv.clone(),
            bus.clone(),
            metrics.clone(),
            nodes.clone(),
            builder.placement,
        ));
        let containers = Arc::new(ContainerManager::new(
            ContainerManagerConfig {
                container_size_bytes: builder.config.container_size_bytes,
                min_containers_per_datanode: builder.config.min_containers_per_datanode,
                min_pipeline_count_per_datanode: builder.config.min_pipeline_count_per_datanode,
            },
            gateway.clone(),
            kv.clone(),
            metrics.clone(),
            nodes.clone(),
            pipelines.clone(),
        ));
        let safe_mode = Arc::new(SafeModeManager::new(
            SafeModeConfig {
                enabled: builder.config.safe_mode_enabled,
                min_datanodes: builder.config.safe_mode_min_datanodes,
                container_threshold: builder.config.safe_mode_container_threshold,
                pipeline_availability_check: builder.config.safe_mode_pipeline_availability_check,
                pipeline_threshold: builder.config.safe_mode_pipeline_threshold,
            },
            bus.clone(),
        ));

        log.register_executor(CommandKind::Node, nodes.clone());
        log.register_executor(CommandKind::Pipeline, pipelines.clone());
        log.register_executor(CommandKind::Container, containers.clone());

        let scm = Self {
            config: builder.config,
            version,
            storage: builder.storage,
            kv,
            log,
            clock: builder.clock,
            nodes,
            pipelines,
            containers,
            safe_mode,
            bus,
            metrics,
        };
        scm.reload_managers()?;
        scm.log.recover()?;
        scm.revalidate_safe_mode();
        info!(
            "event=scm_bootstrapped cluster={} scm={} peer={}",
            scm.version.cluster_id,
            scm.version.scm_id,
            scm.log.peer()
        );
        Ok(scm)
    }

    /// Rebuilds every manager's in-memory state from the KV tables. Also the
    /// recovery path after a snapshot install.
    pub fn reload_managers(&self) -> Result<(), ScmError> {
        self.nodes.reload(self.clock.now_ms())?;
        self.pipelines.reload()?;
        self.containers.reload()?;
        Ok(())
    }

    pub fn version(&self) -> &VersionFile {
        &self.version
    }

    pub fn config(&self) -> &ScmConfig {
        &self.config
    }

    pub fn storage(&self) -> &ScmStorage {
        &self.storage
    }

    pub fn kv(&self) -> &Arc<KvStore> {
        &self.kv
    }

    pub fn log(&self) -> &Arc<ReplicatedLog> {
        &self.log
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn assume_leadership(&self, term: u64) -> Result<(), ScmError> {
        self.log.step_up(term)
    }

    pub fn yield_leadership(&self, hint: Option<PeerId>) {
        self.log.step_down(hint)
    }

    // ------------------------------------------------------------------
    // Datanode surface
    // ------------------------------------------------------------------

    pub fn register_datanode(
        &self,
        details: NodeDetailsMsg,
        report: NodeReportMsg,
        pipeline_ids: Vec<String>,
    ) -> Result<RegisterNodeReply, ScmError> {
        let outcome = self.nodes.register(details, report, pipeline_ids)?;
        self.revalidate_safe_mode();
        Ok(RegisterNodeReply {
            cluster_id: outcome.cluster_id,
            scm_id: self.version.scm_id.to_string(),
            node_id: outcome.node_id.to_string(),
            already_registered: outcome.already_registered,
        })
    }

    pub fn heartbeat(&self, node: &NodeId) -> Result<Vec<DatanodeCommandMsg>, ScmError> {
        let commands = self.nodes.process_heartbeat(node, self.clock.now_ms())?;
        Ok(commands.iter().map(DatanodeCommandMsg::from).collect())
    }

    /// Fire-and-forget container report.
    pub fn container_report(&self, node: &NodeId, replicas: Vec<(u64, i32, u64, u64)>) {
        let now_ms = self.clock.now_ms();
        for (container_id, state, bytes_used, key_count) in replicas {
            let reported_state = match container_state_from_wire(state) {
                Ok(state) => state,
                Err(_) => {
                    warn!(
                        "event=container_report_bad_state node={node} container={container_id} state={state}"
                    );
                    continue;
                }
            };
            self.containers.update_replica(ContainerReplica {
                container: ContainerId::new(container_id),
                node: *node,
                reported_state,
                bytes_used,
                key_count,
                last_seen_ms: now_ms,
            });
        }
        self.revalidate_safe_mode();
    }

    /// Fire-and-forget pipeline report.
    pub fn pipeline_report(&self, node: &NodeId, pipeline_ids: Vec<PipelineId>) {
        if let Err(err) = self.pipelines.process_pipeline_report(node, &pipeline_ids) {
            warn!("event=pipeline_report_failed node={node} error={err}");
        }
        self.revalidate_safe_mode();
    }

    // ------------------------------------------------------------------
    // Client surface
    // ------------------------------------------------------------------

    pub fn allocate_container(
        &self,
        replication: ReplicationConfig,
        owner: &str,
    ) -> Result<ContainerInfo, ScmError> {
        self.ensure_out_of_safe_mode()?;
        self.containers.allocate(replication, owner)
    }

    pub fn get_matching_container(
        &self,
        size: u64,
        owner: &str,
        pipeline: &PipelineId,
        exclude: &HashSet<ContainerId>,
    ) -> Result<ContainerInfo, ScmError> {
        self.ensure_out_of_safe_mode()?;
        self.containers.get_matching(size, owner, pipeline, exclude)
    }

    pub fn container_event(
        &self,
        id: ContainerId,
        event: LifecycleEvent,
    ) -> Result<ContainerInfo, ScmError> {
        self.ensure_out_of_safe_mode()?;
        self.containers.container_event(id, event)
    }

    pub fn create_pipeline(
        &self,
        replication: ReplicationConfig,
    ) -> Result<crate::pipeline::Pipeline, ScmError> {
        self.pipelines.create_pipeline(replication)
    }

    /// Closes a pipeline and cascades: every OPEN container on it moves to
    /// CLOSING and the members are told to close their replicas.
    pub fn close_pipeline(&self, id: &PipelineId) -> Result<(), ScmError> {
        self.pipelines.close_pipeline(id)?;
        self.containers.close_containers_on(id)?;
        Ok(())
    }

    pub fn safe_mode_status(&self) -> SafeModeStatus {
        self.safe_mode.status()
    }

    // ------------------------------------------------------------------
    // Background driving
    // ------------------------------------------------------------------

    /// One sweeper tick: node health, dead-node pipeline closure, expired
    /// node removal (leader only), and pipeline-creation timeouts.
    pub fn sweep(&self) -> Result<SweepReport, ScmError> {
        let now_ms = self.clock.now_ms();
        let report = self.nodes.sweep(now_ms);
        for node in &report.dead {
            let affected = self.pipelines.close_pipelines_of_node(node)?;
            for pipeline in &affected {
                self.containers.close_containers_on(pipeline)?;
            }
        }
        if self.log.is_leader() {
            for node in &report.expired {
                self.nodes.remove_node(*node)?;
            }
        }
        self.pipelines.tick(now_ms)?;
        Ok(report)
    }

    fn ensure_out_of_safe_mode(&self) -> Result<(), ScmError> {
        if self.safe_mode.in_safe_mode() {
            return Err(ScmError::Conflict {
                what: "cluster",
                id: "in safe mode".to_string(),
            });
        }
        Ok(())
    }

    fn sample(&self) -> SafeModeSample {
        let (containers_with_replica, total_eligible_containers) =
            self.containers.replica_coverage();
        let replicated: Vec<_> = self
            .pipelines
            .pipelines()
            .into_iter()
            .filter(|pipeline| {
                pipeline.replication.kind == ReplicationKind::Replicated
                    && pipeline.replication.factor > 1
            })
            .collect();
        let open_full = replicated
            .iter()
            .filter(|pipeline| pipeline.state == PipelineState::Open)
            .count();
        let with_report = replicated
            .iter()
            .filter(|pipeline| self.pipelines.reported_member_count(&pipeline.id) > 0)
            .count();
        SafeModeSample {
            registered_nodes: self.nodes.registered_count(),
            containers_with_replica,
            total_eligible_containers,
            open_full_replicated_pipelines: open_full,
            total_replicated_pipelines: replicated.len(),
            pipelines_with_report: with_report,
        }
    }

    /// Re-evaluates the safe-mode rules from current manager state.
    pub fn revalidate_safe_mode(&self) -> SafeModeStatus {
        self.safe_mode.refresh_and_validate(&self.sample())
    }

    fn admin_reply(&self, request: &AdminRequest) -> Result<AdminReply, ScmError> {
        let mut reply = AdminReply::default();
        match AdminOp::try_from(request.op) {
            Ok(AdminOp::NodeList) => {
                reply.nodes = self
                    .nodes
                    .all_nodes()
                    .into_iter()
                    .map(|record| NodeInfoMsg {
                        details: Some(NodeDetailsMsg {
                            node_id: record.id.to_string(),
                            hostname: record.hostname,
                            ip: record.ip,
                            port: record.port as u32,
                            location: record.location,
                        }),
                        report: Some(NodeReportMsg {
                            storage: record.storage,
                            metadata_volume_count: record.metadata_volume_count,
                        }),
                    })
                    .collect();
            }
            Ok(AdminOp::PipelineList) => {
                reply.pipelines = self
                    .pipelines
                    .pipelines()
                    .iter()
                    .map(crate::pipeline::pipeline_to_msg)
                    .collect();
            }
            Ok(AdminOp::GetContainer) => {
                let id = ContainerId::new(request.container_id);
                let container = self
                    .containers
                    .container(id)
                    .ok_or_else(|| ScmError::not_found("container", id))?;
                reply.containers = vec![crate::container::container_to_msg(&container)];
            }
            Ok(AdminOp::SafeModeStatus) => {
                let status = self.safe_mode.status();
                reply.in_safe_mode = status.in_safe_mode;
                reply.pre_check_complete = status.pre_check_complete;
            }
            Ok(AdminOp::ContainerEvent) => {
                let event = lifecycle_event_from_wire(request.event)?;
                let container =
                    self.container_event(ContainerId::new(request.container_id), event)?;
                reply.containers = vec![crate::container::container_to_msg(&container)];
            }
            Ok(AdminOp::GetVersion) => {
                let version = self.nodes.get_version();
                reply.cluster_id = version.cluster_id;
                reply.scm_id = version.scm_id;
                reply.software_version = version.software_version.to_string();
            }
            _ => {
                return Err(ScmError::Metadata(format!(
                    "unknown admin op {}",
                    request.op
                )))
            }
        }
        Ok(reply)
    }
}

impl RpcHandler for Scm {
    fn handle(&self, request: RpcRequest) -> RpcReply {
        let request_id = request.request_id;
        let outcome: Result<Option<RpcReplyBody>, ScmError> = match request.body {
            Some(RpcRequestBody::Register(args)) => self.handle_register(args).map(Some),
            Some(RpcRequestBody::Heartbeat(args)) => self.handle_heartbeat(args).map(Some),
            Some(RpcRequestBody::ContainerReport(args)) => {
                self.handle_container_report(args).map(|_| None)
            }
            Some(RpcRequestBody::PipelineReport(args)) => {
                self.handle_pipeline_report(args).map(|_| None)
            }
            Some(RpcRequestBody::Admin(args)) => self
                .admin_reply(&args)
                .map(|reply| Some(RpcReplyBody::Admin(reply))),
            None => Err(ScmError::Metadata("empty rpc request".into())),
        };
        match outcome {
            Ok(body) => RpcReply {
                request_id,
                code: 0,
                message: String::new(),
                body,
            },
            Err(err) => RpcReply {
                request_id,
                code: err.result_code(),
                message: err.to_string(),
                body: None,
            },
        }
    }
}

impl Scm {
    fn handle_register(&self, args: RegisterNodeArgs) -> Result<RpcReplyBody, ScmError> {
        let details = args
            .details
            .ok_or_else(|| ScmError::Metadata("register without details".into()))?;
        let reply = self.register_datanode(
            details,
            args.node_report.unwrap_or_default(),
            args.pipeline_ids,
        )?;
        Ok(RpcReplyBody::Register(reply))
    }

    fn handle_heartbeat(&self, args: HeartbeatArgs) -> Result<RpcReplyBody, ScmError> {
        let node = parse_node_id(&args.node_id)?;
        let commands = self.heartbeat(&node)?;
        Ok(RpcReplyBody::Heartbeat(HeartbeatReply { commands }))
    }

    fn handle_container_report(&self, args: ContainerReportArgs) -> Result<(), ScmError> {
        let node = parse_node_id(&args.node_id)?;
        let replicas = args
            .replicas
            .iter()
            .map(|replica| {
                (
                    replica.container_id,
                    replica.state,
                    replica.bytes_used,
                    replica.key_count,
                )
            })
            .collect();
        self.container_report(&node, replicas);
        Ok(())
    }

    fn handle_pipeline_report(&self, args: PipelineReportArgs) -> Result<(), ScmError> {
        let node = parse_node_id(&args.node_id)?;
        let mut pipeline_ids = Vec::with_capacity(args.pipeline_ids.len());
        for raw in &args.pipeline_ids {
            pipeline_ids.push(parse_pipeline_id(raw)?);
        }
        self.pipeline_report(&node, pipeline_ids);
        Ok(())
    }
}
