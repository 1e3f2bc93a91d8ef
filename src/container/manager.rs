use super::lifecycle::{next_state, ContainerState, LifecycleEvent};
use super::replica::{ContainerReplica, ReplicaIndex};
use crate::config::ReplicationConfig;
use crate::error::ScmError;
use crate::gateway::{ContainerWriteMethod, HaGateway};
use crate::ids::{ContainerId, NodeId, PipelineId};
use crate::kv::{
    KvError, KvStore, META_CONTAINER_ID_COUNTER, META_DELETE_TXN_COUNTER, TABLE_CONTAINERS,
};
use crate::node::{DatanodeCommandKind, NodeManager};
use crate::pipeline::{PipelineManager, PipelineState};
use crate::telemetry::SharedMetricsRegistry;
use crate::wire::{
    container_state_from_wire, decode_message, encode_message, lifecycle_event_from_wire,
    parse_pipeline_id, replication_from_wire, AllocateContainerArgs, CommandEnvelope, CommandKind,
    ContainerEventArgs, ContainerInfoMsg, LifecycleEventMsg, ReplicationKindMsg,
};
use log::{info, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// A logical container: the allocation granularity handed to upper layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: ContainerId,
    pub pipeline: PipelineId,
    pub state: ContainerState,
    pub used_bytes: u64,
    pub key_count: u64,
    pub state_entered_at_ms: u64,
    pub owner: String,
    pub replication: ReplicationConfig,
    pub delete_txn_id: u64,
}

#[derive(Debug, Clone)]
pub struct ContainerManagerConfig {
    pub container_size_bytes: u64,
    pub min_containers_per_datanode: u32,
    pub min_pipeline_count_per_datanode: u32,
}

impl ContainerManagerConfig {
    /// Open containers to keep provisioned per pipeline before reuse kicks
    /// in: `ceil(min_containers_per_dn / min_pipeline_count_per_dn)`.
    pub fn open_containers_per_pipeline(&self) -> usize {
        let per_dn = self.min_containers_per_datanode.max(1) as usize;
        let pipelines = self.min_pipeline_count_per_datanode.max(1) as usize;
        per_dn.div_ceil(pipelines)
    }
}

#[derive(Debug, Default)]
struct ContainerTable {
    containers: HashMap<ContainerId, ContainerInfo>,
    /// OPEN containers per pipeline.
    open_by_pipeline: HashMap<PipelineId, HashSet<ContainerId>>,
}

/// Allocates containers onto open pipelines and drives their lifecycle FSM.
pub struct ContainerManager {
    config: ContainerManagerConfig,
    gateway: HaGateway,
    kv: Arc<KvStore>,
    metrics: SharedMetricsRegistry,
    nodes: Arc<NodeManager>,
    pipelines: Arc<PipelineManager>,
    state: RwLock<ContainerTable>,
    replicas: Mutex<ReplicaIndex>,
}

impl ContainerManager {
    pub fn new(
        config: ContainerManagerConfig,
        gateway: HaGateway,
        kv: Arc<KvStore>,
        metrics: SharedMetricsRegistry,
        nodes: Arc<NodeManager>,
        pipelines: Arc<PipelineManager>,
    ) -> Self {
        Self {
            config,
            gateway,
            kv,
            metrics,
            nodes,
            pipelines,
            state: RwLock::new(ContainerTable::default()),
            replicas: Mutex::new(ReplicaIndex::new()),
        }
    }

    // ------------------------------------------------------------------
    // Read surface
    // ------------------------------------------------------------------

    pub fn container(&self, id: ContainerId) -> Option<ContainerInfo> {
        self.state.read().containers.get(&id).cloned()
    }

    pub fn containers(&self) -> Vec<ContainerInfo> {
        self.state.read().containers.values().cloned().collect()
    }

    pub fn containers_in(&self, state: ContainerState) -> Vec<ContainerInfo> {
        self.state
            .read()
            .containers
            .values()
            .filter(|container| container.state == state)
            .cloned()
            .collect()
    }

    pub fn open_containers_on(&self, pipeline: &PipelineId) -> Vec<ContainerInfo> {
        let table = self.state.read();
        table
            .open_by_pipeline
            .get(pipeline)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| table.containers.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn count(&self) -> usize {
        self.state.read().containers.len()
    }

    /// Safe-mode inputs: (containers with at least one reported replica,
    /// containers expected to have replicas).
    pub fn replica_coverage(&self) -> (usize, usize) {
        let table = self.state.read();
        let replicas = self.replicas.lock();
        let eligible: Vec<ContainerId> = table
            .containers
            .values()
            .filter(|container| container.state != ContainerState::Deleted)
            .map(|container| container.id)
            .collect();
        let covered = eligible
            .iter()
            .filter(|id| replicas.replica_count(**id) > 0)
            .count();
        (covered, eligible.len())
    }

    pub fn replicas_of(&self, id: ContainerId) -> Vec<ContainerReplica> {
        self.replicas
            .lock()
            .replicas_of(id)
            .into_iter()
            .cloned()
            .collect()
    }

    // ------------------------------------------------------------------
    // Write surface (leader)
    // ------------------------------------------------------------------

    /// Allocates a fresh container on an OPEN pipeline of the requested
    /// shape. When none is open yet, a pipeline build is kicked off and the
    /// caller gets a retriable `NotFound`.
    pub fn allocate(
        &self,
        replication: ReplicationConfig,
        owner: &str,
    ) -> Result<ContainerInfo, ScmError> {
        let open = self
            .pipelines
            .pipelines_matching(replication, PipelineState::Open);
        let Some(pipeline) = open.into_iter().min_by_key(|pipeline| pipeline.id) else {
            info!(
                "event=allocate_no_open_pipeline kind={:?} factor={}",
                replication.kind, replication.factor
            );
            self.pipelines.create_pipeline(replication)?;
            return Err(ScmError::not_found(
                "open pipeline",
                format!("{:?}/{}", replication.kind, replication.factor),
            ));
        };
        self.allocate_on(&pipeline.id, replication, owner)
    }

    pub fn allocate_on(
        &self,
        pipeline: &PipelineId,
        replication: ReplicationConfig,
        owner: &str,
    ) -> Result<ContainerInfo, ScmError> {
        let args = AllocateContainerArgs {
            pipeline_id: pipeline.to_string(),
            owner: owner.to_string(),
            replication: ReplicationKindMsg::from(replication.kind) as i32,
            factor: replication.factor as u32,
        };
        let raw = self.gateway.invoke(
            CommandKind::Container,
            ContainerWriteMethod::Allocate as u32,
            encode_message(&args),
        )?;
        container_from_msg(&decode_message::<ContainerInfoMsg>(&raw)?)
    }

    /// Returns an OPEN container on `pipeline` owned by `owner` with at
    /// least `size` free bytes, pre-allocating when the pipeline runs below
    /// its open-container floor.
    pub fn get_matching(
        &self,
        size: u64,
        owner: &str,
        pipeline: &PipelineId,
        exclude: &HashSet<ContainerId>,
    ) -> Result<ContainerInfo, ScmError> {
        let replication = self
            .pipelines
            .pipeline(pipeline)
            .ok_or_else(|| ScmError::not_found("pipeline", pipeline))?
            .replication;

        let open_count = self.open_containers_on(pipeline).len();
        if open_count < self.config.open_containers_per_pipeline() {
            self.allocate_on(pipeline, replication, owner)?;
        }

        let candidate = self
            .open_containers_on(pipeline)
            .into_iter()
            .filter(|container| {
                container.owner == owner
                    && !exclude.contains(&container.id)
                    && container.used_bytes + size <= self.config.container_size_bytes
            })
            .min_by_key(|container| container.id);
        match candidate {
            Some(container) => Ok(container),
            None => self.allocate_on(pipeline, replication, owner),
        }
    }

    /// Drives one lifecycle event through the log.
    pub fn container_event(
        &self,
        id: ContainerId,
        event: LifecycleEvent,
    ) -> Result<ContainerInfo, ScmError> {
        let args = ContainerEventArgs {
            container_id: id.value(),
            event: LifecycleEventMsg::from(event) as i32,
        };
        let raw = self.gateway.invoke(
            CommandKind::Container,
            ContainerWriteMethod::ApplyEvent as u32,
            encode_message(&args),
        )?;
        container_from_msg(&decode_message::<ContainerInfoMsg>(&raw)?)
    }

    /// Close cascade: every OPEN container on a pipeline that left OPEN is
    /// finalized, its members told to close their replicas, and once the
    /// pipeline is drained the pipeline manager may remove it.
    pub fn close_containers_on(&self, pipeline: &PipelineId) -> Result<Vec<ContainerId>, ScmError> {
        let members = self
            .pipelines
            .pipeline(pipeline)
            .map(|pipeline| pipeline.members)
            .unwrap_or_default();
        let open = self.open_containers_on(pipeline);
        let mut closed = Vec::with_capacity(open.len());
        for container in open {
            self.container_event(container.id, LifecycleEvent::Finalize)?;
            for member in &members {
                match self.nodes.add_datanode_command(
                    member,
                    DatanodeCommandKind::CloseContainer {
                        container: container.id,
                        force: false,
                    },
                    None,
                ) {
                    Ok(_) => {}
                    Err(err) => warn!(
                        "event=close_container_command_failed container={} node={member} error={err}",
                        container.id
                    ),
                }
            }
            closed.push(container.id);
        }
        if self.open_containers_on(pipeline).is_empty() {
            self.pipelines.notify_pipeline_drained(pipeline)?;
        }
        Ok(closed)
    }

    // ------------------------------------------------------------------
    // Replica tracking (report-derived, replica-local)
    // ------------------------------------------------------------------

    pub fn update_replica(&self, replica: ContainerReplica) {
        if self.container(replica.container).is_none() {
            warn!(
                "event=replica_report_unknown container={} node={}",
                replica.container, replica.node
            );
            return;
        }
        self.nodes.add_container(&replica.node, replica.container);
        self.replicas.lock().update(replica);
    }

    pub fn remove_replica(&self, container: ContainerId, node: &NodeId) {
        self.replicas.lock().remove(container, node);
    }

    /// Rebuilds in-memory state from the `containers` table. The replica
    /// index restarts empty and refills from the next round of reports.
    pub fn reload(&self) -> Result<(), ScmError> {
        let mut table = ContainerTable::default();
        for (_, value) in self.kv.scan(TABLE_CONTAINERS).map_err(kv_err)? {
            let container = container_from_msg(&decode_message::<ContainerInfoMsg>(&value)?)?;
            if container.state == ContainerState::Open {
                table
                    .open_by_pipeline
                    .entry(container.pipeline)
                    .or_default()
                    .insert(container.id);
            }
            table.containers.insert(container.id, container);
        }
        *self.state.write() = table;
        *self.replicas.lock() = ReplicaIndex::new();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Apply entry points
    // ------------------------------------------------------------------

    fn apply_allocate(
        &self,
        args: AllocateContainerArgs,
        stamped_ms: u64,
    ) -> Result<Vec<u8>, ScmError> {
        let pipeline_id = parse_pipeline_id(&args.pipeline_id)?;
        let replication = replication_from_wire(args.replication, args.factor)?;
        let pipeline = self
            .pipelines
            .pipeline(&pipeline_id)
            .ok_or_else(|| ScmError::not_found("pipeline", pipeline_id))?;
        if pipeline.state != PipelineState::Open {
            return Err(ScmError::invalid_transition(format!(
                "cannot allocate on pipeline {pipeline_id} in state {:?}",
                pipeline.state
            )));
        }
        if pipeline.replication != replication {
            return Err(ScmError::Conflict {
                what: "pipeline replication",
                id: pipeline_id.to_string(),
            });
        }

        let id = ContainerId::new(self.kv.meta_counter(META_CONTAINER_ID_COUNTER).map_err(kv_err)? + 1);
        let container = ContainerInfo {
            id,
            pipeline: pipeline_id,
            state: ContainerState::Open,
            used_bytes: 0,
            key_count: 0,
            state_entered_at_ms: stamped_ms,
            owner: args.owner,
            replication,
            delete_txn_id: 0,
        };
        self.kv
            .set_meta_counter(META_CONTAINER_ID_COUNTER, id.value())
            .map_err(kv_err)?;
        self.persist(&container)?;
        {
            let mut table = self.state.write();
            table
                .open_by_pipeline
                .entry(pipeline_id)
                .or_default()
                .insert(id);
            table.containers.insert(id, container.clone());
        }
        for member in &pipeline.members {
            self.nodes.add_container(member, id);
        }
        self.metrics.inc_counter("container.allocated_total", 1);
        info!(
            "event=container_allocated container={id} pipeline={pipeline_id} owner={}",
            container.owner
        );
        Ok(encode_message(&container_to_msg(&container)))
    }

    fn apply_event(&self, args: ContainerEventArgs, stamped_ms: u64) -> Result<Vec<u8>, ScmError> {
        let id = ContainerId::new(args.container_id);
        let event = lifecycle_event_from_wire(args.event)?;
        let updated = {
            let mut table = self.state.write();
            let container = table
                .containers
                .get_mut(&id)
                .ok_or_else(|| ScmError::not_found("container", id))?;
            let next = next_state(container.state, event)?;
            if next == container.state {
                // Idempotent no-op: state already reached or passed.
                let snapshot = container.clone();
                return Ok(encode_message(&container_to_msg(&snapshot)));
            }
            let was_open = container.state == ContainerState::Open;
            container.state = next;
            container.state_entered_at_ms = stamped_ms;
            if event == LifecycleEvent::Delete {
                container.delete_txn_id =
                    self.kv.meta_counter(META_DELETE_TXN_COUNTER).map_err(kv_err)? + 1;
                self.kv
                    .set_meta_counter(META_DELETE_TXN_COUNTER, container.delete_txn_id)
                    .map_err(kv_err)?;
            }
            let snapshot = container.clone();
            if was_open {
                if let Some(open) = table.open_by_pipeline.get_mut(&snapshot.pipeline) {
                    open.remove(&id);
                    if open.is_empty() {
                        table.open_by_pipeline.remove(&snapshot.pipeline);
                    }
                }
            }
            snapshot
        };
        self.persist(&updated)?;
        if updated.state == ContainerState::Deleted {
            self.replicas.lock().drop_container(id);
        }
        info!(
            "event=container_state container={id} event={event:?} state={:?}",
            updated.state
        );
        Ok(encode_message(&container_to_msg(&updated)))
    }

    fn persist(&self, container: &ContainerInfo) -> Result<(), ScmError> {
        self.kv
            .put(
                TABLE_CONTAINERS,
                container.id.value().to_be_bytes().to_vec(),
                encode_message(&container_to_msg(container)),
            )
            .map_err(kv_err)
    }
}

impl crate::consensus::CommandExecutor for ContainerManager {
    fn execute(&self, envelope: &CommandEnvelope) -> Result<Vec<u8>, ScmError> {
        match ContainerWriteMethod::from_u32(envelope.method) {
            Some(ContainerWriteMethod::Allocate) => {
                let args: AllocateContainerArgs = decode_message(&envelope.args)?;
                self.apply_allocate(args, envelope.stamped_at_ms)
            }
            Some(ContainerWriteMethod::ApplyEvent) => {
                let args: ContainerEventArgs = decode_message(&envelope.args)?;
                self.apply_event(args, envelope.stamped_at_ms)
            }
            None => Err(ScmError::Metadata(format!(
                "unknown container write method {}",
                envelope.method
            ))),
        }
    }

    fn flush(&self) -> Result<(), ScmError> {
        self.kv.flush().map_err(kv_err)
    }
}

fn kv_err(err: KvError) -> ScmError {
    ScmError::Metadata(err.to_string())
}

pub(crate) fn container_to_msg(container: &ContainerInfo) -> ContainerInfoMsg {
    ContainerInfoMsg {
        container_id: container.id.value(),
        pipeline_id: container.pipeline.to_string(),
        state: crate::wire::ContainerStateMsg::from(container.state) as i32,
        used_bytes: container.used_bytes,
        key_count: container.key_count,
        state_entered_at_ms: container.state_entered_at_ms,
        owner: container.owner.clone(),
        replication: ReplicationKindMsg::from(container.replication.kind) as i32,
        factor: container.replication.factor as u32,
        delete_txn_id: container.delete_txn_id,
    }
}

pub(crate) fn container_from_msg(msg: &ContainerInfoMsg) -> Result<ContainerInfo, ScmError> {
    Ok(ContainerInfo {
        id: ContainerId::new(msg.container_id),
        pipeline: parse_pipeline_id(&msg.pipeline_id)?,
        state: container_state_from_wire(msg.state)?,
        used_bytes: msg.used_bytes,
        key_count: msg.key_count,
        state_entered_at_ms: msg.state_entered_at_ms,
        owner: msg.owner.clone(),
        replication: replication_from_wire(msg.replication, msg.factor)?,
        delete_txn_id: msg.delete_txn_id,
    })
}
