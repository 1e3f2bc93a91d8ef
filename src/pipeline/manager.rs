use super::placement::PlacementPolicy;
use super::state::{Pipeline, PipelineState};
use crate::config::{ReplicationConfig, ReplicationKind};
use crate::error::ScmError;
use crate::events::{EventBus, ScmEvent};
use crate::gateway::{HaGateway, PipelineWriteMethod};
use crate::ids::{member_set_hash, NodeId, PipelineId};
use crate::kv::{KvError, KvStore, TABLE_PIPELINES};
use crate::node::{DatanodeCommandKind, NodeManager};
use crate::telemetry::SharedMetricsRegistry;
use crate::wire::{
    decode_message, encode_message, parse_node_ids, parse_pipeline_id, pipeline_state_from_wire,
    replication_from_wire, CommandEnvelope, CommandKind, CreatePipelineArgs, PipelineMsg,
    RemovePipelineArgs, UpdatePipelineStateArgs,
};
use log::{info, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// A leader-local wait for a creation quorum. Members acknowledge the new
/// pipeline through their pipeline reports; the wait either reaches quorum
/// and opens the pipeline or expires and closes it.
#[derive(Debug, Clone)]
pub struct PendingCreate {
    pub pipeline: PipelineId,
    pub deadline_ms: u64,
    pub quorum: usize,
    pub acks: HashSet<NodeId>,
}

#[derive(Debug, Clone)]
pub struct PipelineManagerConfig {
    pub create_timeout: Duration,
    pub container_size_bytes: u64,
}

#[derive(Debug, Default)]
struct PipelineTable {
    pipelines: HashMap<PipelineId, Pipeline>,
    /// Non-CLOSED pipelines grouped by member-set hash, used to refuse
    /// rebuilding "the same three nodes" while one is still live.
    by_member_hash: HashMap<u64, HashSet<PipelineId>>,
}

impl PipelineTable {
    fn index(&mut self, pipeline: &Pipeline) {
        self.by_member_hash
            .entry(pipeline.member_hash)
            .or_default()
            .insert(pipeline.id);
    }

    fn unindex(&mut self, pipeline: &Pipeline) {
        if let Some(ids) = self.by_member_hash.get_mut(&pipeline.member_hash) {
            ids.remove(&pipeline.id);
            if ids.is_empty() {
                self.by_member_hash.remove(&pipeline.member_hash);
            }
        }
    }
}

/// Creates and tears down replication quorums over nodes drawn from the
/// [`NodeManager`].
pub struct PipelineManager {
    config: PipelineManagerConfig,
    gateway: HaGateway,
    kv: Arc<KvStore>,
    bus: EventBus,
    metrics: SharedMetricsRegistry,
    nodes: Arc<NodeManager>,
    placement: Arc<dyn PlacementPolicy>,
    state: RwLock<PipelineTable>,
    pending: Mutex<HashMap<PipelineId, PendingCreate>>,
    /// Members recently seen reporting each pipeline; feeds the safe-mode
    /// pipeline rules. Replica-local.
    reported: Mutex<HashMap<PipelineId, HashSet<NodeId>>>,
}

impl PipelineManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: PipelineManagerConfig,
        gateway: HaGateway,
        kv: Arc<KvStore>,
        bus: EventBus,
        metrics: SharedMetricsRegistry,
        nodes: Arc<NodeManager>,
        placement: Arc<dyn PlacementPolicy>,
    ) -> Self {
        Self {
            config,
            gateway,
            kv,
            bus,
            metrics,
            nodes,
            placement,
            state: RwLock::new(PipelineTable::default()),
            pending: Mutex::new(HashMap::new()),
            reported: Mutex::new(HashMap::new()),
        }
    }

    // ------------------------------------------------------------------
    // Read surface
    // ------------------------------------------------------------------

    pub fn pipeline(&self, id: &PipelineId) -> Option<Pipeline> {
        self.state.read().pipelines.get(id).cloned()
    }

    pub fn pipelines(&self) -> Vec<Pipeline> {
        self.state.read().pipelines.values().cloned().collect()
    }

    pub fn pipelines_in(&self, state: PipelineState) -> Vec<Pipeline> {
        self.state
            .read()
            .pipelines
            .values()
            .filter(|pipeline| pipeline.state == state)
            .cloned()
            .collect()
    }

    pub fn pipelines_matching(
        &self,
        replication: ReplicationConfig,
        state: PipelineState,
    ) -> Vec<Pipeline> {
        self.state
            .read()
            .pipelines
            .values()
            .filter(|pipeline| pipeline.replication == replication && pipeline.state == state)
            .cloned()
            .collect()
    }

    pub fn pipelines_of_node(&self, node: &NodeId) -> Vec<Pipeline> {
        self.state
            .read()
            .pipelines
            .values()
            .filter(|pipeline| pipeline.contains(node))
            .cloned()
            .collect()
    }

    pub fn count(&self) -> usize {
        self.state.read().pipelines.len()
    }

    pub fn reported_member_count(&self, id: &PipelineId) -> usize {
        self.reported
            .lock()
            .get(id)
            .map(HashSet::len)
            .unwrap_or(0)
    }

    pub fn pending_creates(&self) -> Vec<PendingCreate> {
        self.pending.lock().values().cloned().collect()
    }

    // ------------------------------------------------------------------
    // Write surface (leader)
    // ------------------------------------------------------------------

    /// Creates a pipeline of the requested shape: picks members among
    /// healthy, non-excluded nodes, persists the ALLOCATED pipeline through
    /// the log, and queues a create command for every member. The pipeline
    /// opens once a quorum of members acknowledges it, or closes when the
    /// create timeout expires.
    pub fn create_pipeline(&self, replication: ReplicationConfig) -> Result<Pipeline, ScmError> {
        replication
            .validate()
            .map_err(|err| ScmError::invalid_transition(err.to_string()))?;

        let factor = replication.factor as usize;
        let exclude = self.exclusion_set(replication);
        let healthy = self.nodes.healthy_nodes();
        let members = self.placement.choose(
            &healthy,
            &exclude,
            factor,
            self.config.container_size_bytes,
        )?;

        if replication.kind == ReplicationKind::Replicated {
            let hash = member_set_hash(&members);
            let table = self.state.read();
            if let Some(existing) = table.by_member_hash.get(&hash) {
                if let Some(id) = existing.iter().next() {
                    return Err(ScmError::already_exists("pipeline with member set", id));
                }
            }
        }

        let pipeline = Pipeline::new(
            PipelineId::random(),
            replication,
            members,
            self.gateway.now_ms(),
        )?;
        let args = CreatePipelineArgs {
            pipeline: Some(pipeline_to_msg(&pipeline)),
        };
        let raw = self.gateway.invoke(
            CommandKind::Pipeline,
            PipelineWriteMethod::Create as u32,
            encode_message(&args),
        )?;
        let created = pipeline_from_msg(&decode_message::<PipelineMsg>(&raw)?)?;

        for member in &created.members {
            let outcome = self.nodes.add_datanode_command(
                member,
                DatanodeCommandKind::CreatePipeline {
                    pipeline: created.id,
                    members: created.members.clone(),
                },
                None,
            )?;
            info!(
                "event=pipeline_create_command pipeline={} node={member} outcome={outcome:?}",
                created.id
            );
        }

        self.pending.lock().insert(
            created.id,
            PendingCreate {
                pipeline: created.id,
                deadline_ms: self.gateway.now_ms() + self.config.create_timeout.as_millis() as u64,
                quorum: factor / 2 + 1,
                acks: HashSet::new(),
            },
        );
        self.metrics.inc_counter("pipeline.created_total", 1);
        Ok(created)
    }

    /// Records a datanode's pipeline report: feeds the safe-mode rules and
    /// advances any pending creation quorum.
    pub fn process_pipeline_report(
        &self,
        node: &NodeId,
        pipeline_ids: &[PipelineId],
    ) -> Result<(), ScmError> {
        let mut to_open = Vec::new();
        {
            let mut reported = self.reported.lock();
            let mut pending = self.pending.lock();
            let table = self.state.read();
            for id in pipeline_ids {
                let Some(pipeline) = table.pipelines.get(id) else {
                    warn!("event=pipeline_report_unknown pipeline={id} node={node}");
                    continue;
                };
                if !pipeline.contains(node) {
                    warn!("event=pipeline_report_nonmember pipeline={id} node={node}");
                    continue;
                }
                reported.entry(*id).or_default().insert(*node);
                if let Some(wait) = pending.get_mut(id) {
                    wait.acks.insert(*node);
                    if wait.acks.len() >= wait.quorum {
                        to_open.push(*id);
                    }
                }
            }
            for id in &to_open {
                pending.remove(id);
            }
        }
        for id in to_open {
            self.open_pipeline(&id)?;
        }
        Ok(())
    }

    /// Expires creation waits whose deadline passed. Each expired pipeline
    /// is closed and its members told to tear it down.
    pub fn tick(&self, now_ms: u64) -> Result<Vec<PipelineId>, ScmError> {
        let expired: Vec<PipelineId> = {
            let mut pending = self.pending.lock();
            let expired: Vec<PipelineId> = pending
                .values()
                .filter(|wait| wait.deadline_ms <= now_ms)
                .map(|wait| wait.pipeline)
                .collect();
            for id in &expired {
                pending.remove(id);
            }
            expired
        };
        for id in &expired {
            warn!("event=pipeline_create_timeout pipeline={id}");
            self.close_pipeline(id)?;
        }
        Ok(expired)
    }

    pub fn open_pipeline(&self, id: &PipelineId) -> Result<Pipeline, ScmError> {
        self.update_state(id, PipelineState::Open)
    }

    /// Temporary member unavailability: OPEN -> DORMANT.
    pub fn deactivate_pipeline(&self, id: &PipelineId) -> Result<Pipeline, ScmError> {
        self.update_state(id, PipelineState::Dormant)
    }

    /// Recovery: DORMANT -> OPEN.
    pub fn activate_pipeline(&self, id: &PipelineId) -> Result<Pipeline, ScmError> {
        self.update_state(id, PipelineState::Open)
    }

    /// Closes the pipeline and tells every member to tear it down. Removal
    /// from the store is deferred until the container manager reports the
    /// pipeline drained.
    pub fn close_pipeline(&self, id: &PipelineId) -> Result<Pipeline, ScmError> {
        let closed = self.update_state(id, PipelineState::Closed)?;
        for member in &closed.members {
            match self.nodes.add_datanode_command(
                member,
                DatanodeCommandKind::ClosePipeline { pipeline: *id },
                None,
            ) {
                Ok(outcome) => info!(
                    "event=pipeline_close_command pipeline={id} node={member} outcome={outcome:?}"
                ),
                Err(err) => warn!(
                    "event=pipeline_close_command_failed pipeline={id} node={member} error={err}"
                ),
            }
        }
        self.pending.lock().remove(id);
        Ok(closed)
    }

    /// Queues every non-CLOSED pipeline containing `node` for closure. Fired
    /// when the sweeper declares a node DEAD.
    pub fn close_pipelines_of_node(&self, node: &NodeId) -> Result<Vec<PipelineId>, ScmError> {
        let affected: Vec<PipelineId> = self
            .pipelines_of_node(node)
            .into_iter()
            .filter(|pipeline| pipeline.state != PipelineState::Closed)
            .map(|pipeline| pipeline.id)
            .collect();
        for id in &affected {
            self.close_pipeline(id)?;
        }
        Ok(affected)
    }

    /// Container manager callback: no open container references the pipeline
    /// any more, so a CLOSED pipeline can leave the store.
    pub fn notify_pipeline_drained(&self, id: &PipelineId) -> Result<(), ScmError> {
        let Some(pipeline) = self.pipeline(id) else {
            return Ok(());
        };
        if pipeline.state != PipelineState::Closed {
            return Ok(());
        }
        let args = RemovePipelineArgs {
            pipeline_id: id.to_string(),
        };
        self.gateway
            .invoke(
                CommandKind::Pipeline,
                PipelineWriteMethod::Remove as u32,
                encode_message(&args),
            )
            .map(|_| ())
    }

    fn update_state(&self, id: &PipelineId, state: PipelineState) -> Result<Pipeline, ScmError> {
        let args = UpdatePipelineStateArgs {
            pipeline_id: id.to_string(),
            state: crate::wire::PipelineStateMsg::from(state) as i32,
        };
        let raw = self.gateway.invoke(
            CommandKind::Pipeline,
            PipelineWriteMethod::UpdateState as u32,
            encode_message(&args),
        )?;
        pipeline_from_msg(&decode_message::<PipelineMsg>(&raw)?)
    }

    fn exclusion_set(&self, replication: ReplicationConfig) -> HashSet<NodeId> {
        let table = self.state.read();
        let mut exclude = HashSet::new();
        for pipeline in table.pipelines.values() {
            if pipeline.replication == replication
                && matches!(
                    pipeline.state,
                    PipelineState::Allocated | PipelineState::Open | PipelineState::Dormant
                )
            {
                exclude.extend(pipeline.members.iter().copied());
            }
        }
        drop(table);
        // Nodes already at their pipeline quota are excluded as well.
        for node in self.nodes.healthy_nodes() {
            let limit = self.nodes.pipeline_limit(&node);
            if limit > 0 && self.nodes.pipeline_count(&node) >= limit {
                exclude.insert(node);
            }
        }
        exclude
    }

    /// Rebuilds in-memory state from the `pipelines` table.
    pub fn reload(&self) -> Result<(), ScmError> {
        let mut table = PipelineTable::default();
        for (_, value) in self.kv.scan(TABLE_PIPELINES).map_err(kv_err)? {
            let pipeline = pipeline_from_msg(&decode_message::<PipelineMsg>(&value)?)?;
            if pipeline.state != PipelineState::Closed {
                table.index(&pipeline);
            }
            for member in &pipeline.members {
                self.nodes.add_pipeline(member, pipeline.id);
            }
            table.pipelines.insert(pipeline.id, pipeline);
        }
        self.pending.lock().clear();
        self.reported.lock().clear();
        *self.state.write() = table;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Apply entry points
    // ------------------------------------------------------------------

    fn apply_create(&self, args: CreatePipelineArgs) -> Result<Vec<u8>, ScmError> {
        let msg = args
            .pipeline
            .ok_or_else(|| ScmError::Metadata("create without pipeline".into()))?;
        let pipeline = pipeline_from_msg(&msg)?;
        {
            let table = self.state.read();
            if let Some(existing) = table.pipelines.get(&pipeline.id) {
                return Ok(encode_message(&pipeline_to_msg(existing)));
            }
        }
        self.kv
            .put(
                TABLE_PIPELINES,
                pipeline.id.to_string().into_bytes(),
                encode_message(&msg),
            )
            .map_err(kv_err)?;
        {
            let mut table = self.state.write();
            table.index(&pipeline);
            table.pipelines.insert(pipeline.id, pipeline.clone());
        }
        for member in &pipeline.members {
            self.nodes.add_pipeline(member, pipeline.id);
        }
        info!(
            "event=pipeline_allocated pipeline={} factor={} members={}",
            pipeline.id,
            pipeline.replication.factor,
            pipeline.members.len()
        );
        Ok(encode_message(&pipeline_to_msg(&pipeline)))
    }

    fn apply_update_state(&self, args: UpdatePipelineStateArgs) -> Result<Vec<u8>, ScmError> {
        let id = parse_pipeline_id(&args.pipeline_id)?;
        let target = pipeline_state_from_wire(args.state)?;
        let updated = {
            let mut table = self.state.write();
            let pipeline = table
                .pipelines
                .get_mut(&id)
                .ok_or_else(|| ScmError::not_found("pipeline", id))?;
            pipeline.transition(target)?;
            let updated = pipeline.clone();
            if target == PipelineState::Closed {
                table.unindex(&updated);
            }
            updated
        };
        self.kv
            .put(
                TABLE_PIPELINES,
                id.to_string().into_bytes(),
                encode_message(&pipeline_to_msg(&updated)),
            )
            .map_err(kv_err)?;
        match target {
            PipelineState::Open => self.bus.publish(ScmEvent::PipelineOpened { pipeline: id }),
            PipelineState::Closed => self.bus.publish(ScmEvent::PipelineClosed { pipeline: id }),
            _ => {}
        }
        info!(
            "event=pipeline_state pipeline={id} state={:?}",
            updated.state
        );
        Ok(encode_message(&pipeline_to_msg(&updated)))
    }

    fn apply_remove(&self, args: RemovePipelineArgs) -> Result<Vec<u8>, ScmError> {
        let id = parse_pipeline_id(&args.pipeline_id)?;
        let removed = {
            let mut table = self.state.write();
            match table.pipelines.remove(&id) {
                Some(pipeline) => {
                    table.unindex(&pipeline);
                    Some(pipeline)
                }
                None => None,
            }
        };
        if let Some(pipeline) = removed {
            if pipeline.state != PipelineState::Closed {
                // Put it back: removal of a live pipeline is a protocol bug.
                let mut table = self.state.write();
                table.index(&pipeline);
                table.pipelines.insert(pipeline.id, pipeline.clone());
                return Err(ScmError::Conflict {
                    what: "pipeline",
                    id: id.to_string(),
                });
            }
            self.kv
                .delete(TABLE_PIPELINES, id.to_string().as_bytes())
                .map_err(kv_err)?;
            for member in &pipeline.members {
                self.nodes.remove_pipeline(member, &id);
            }
            self.reported.lock().remove(&id);
            info!("event=pipeline_removed pipeline={id}");
        }
        Ok(Vec::new())
    }
}

impl crate::consensus::CommandExecutor for PipelineManager {
    fn execute(&self, envelope: &CommandEnvelope) -> Result<Vec<u8>, ScmError> {
        match PipelineWriteMethod::from_u32(envelope.method) {
            Some(PipelineWriteMethod::Create) => {
                let args: CreatePipelineArgs = decode_message(&envelope.args)?;
                self.apply_create(args)
            }
            Some(PipelineWriteMethod::UpdateState) => {
                let args: UpdatePipelineStateArgs = decode_message(&envelope.args)?;
                self.apply_update_state(args)
            }
            Some(PipelineWriteMethod::Remove) => {
                let args: RemovePipelineArgs = decode_message(&envelope.args)?;
                self.apply_remove(args)
            }
            None => Err(ScmError::Metadata(format!(
                "unknown pipeline write method {}",
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

pub(crate) fn pipeline_to_msg(pipeline: &Pipeline) -> PipelineMsg {
    PipelineMsg {
        pipeline_id: pipeline.id.to_string(),
        replication: crate::wire::ReplicationKindMsg::from(pipeline.replication.kind) as i32,
        factor: pipeline.replication.factor as u32,
        members: pipeline.members.iter().map(ToString::to_string).collect(),
        state: crate::wire::PipelineStateMsg::from(pipeline.state) as i32,
        created_at_ms: pipeline.created_at_ms,
        member_hash: pipeline.member_hash,
    }
}

pub(crate) fn pipeline_from_msg(msg: &PipelineMsg) -> Result<Pipeline, ScmError> {
    let id = parse_pipeline_id(&msg.pipeline_id)?;
    let replication = replication_from_wire(msg.replication, msg.factor)?;
    let members = parse_node_ids(&msg.members)?;
    let mut pipeline = Pipeline::new(id, replication, members, msg.created_at_ms)?;
    pipeline.state = pipeline_state_from_wire(msg.state)?;
    if pipeline.member_hash != msg.member_hash {
        return Err(ScmError::Metadata(format!(
            "member hash mismatch for pipeline {id}"
        )));
    }
    Ok(pipeline)
}
