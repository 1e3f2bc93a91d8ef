use super::commands::{CommandQueue, DatanodeCommand, DatanodeCommandKind, QueuePushOutcome};
use super::health::{HealthThresholds, NodeHealth};
use super::topology::CachingResolver;
use crate::error::ScmError;
use crate::events::{EventBus, ScmEvent};
use crate::gateway::{HaGateway, NodeWriteMethod};
use crate::ids::{ClusterId, ContainerId, NodeId, PipelineId, ScmId};
use crate::kv::{KvError, KvStore, TABLE_NODES};
use crate::telemetry::SharedMetricsRegistry;
use crate::wire::{
    decode_message, encode_message, parse_node_id, CommandEnvelope, CommandKind, NodeDetailsMsg,
    NodeInfoMsg, NodeReportMsg, RegisterNodeArgs, RegisterNodeReply, RemoveNodeArgs,
    StorageReportMsg, VolumeKind,
};
use log::{info, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// One registered datanode as this replica sees it. Heartbeat recency and
/// the derived health are replica-local; only the registration payload is
/// replicated.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub id: NodeId,
    pub hostname: String,
    pub ip: String,
    pub port: u16,
    pub location: String,
    pub storage: Vec<StorageReportMsg>,
    pub metadata_volume_count: u32,
    pub health: NodeHealth,
    pub last_heartbeat_ms: u64,
    pub dead_since_ms: Option<u64>,
}

impl NodeRecord {
    /// Non-failed data volumes.
    pub fn healthy_volume_count(&self) -> usize {
        self.storage.iter().filter(|report| !report.failed).count()
    }
}

/// Cluster-wide capacity aggregates over non-failed volumes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeStats {
    pub capacity: u64,
    pub used: u64,
    pub remaining: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterOutcome {
    pub node_id: NodeId,
    pub cluster_id: String,
    pub already_registered: bool,
}

/// What one sweeper tick observed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub stale: Vec<NodeId>,
    pub dead: Vec<NodeId>,
    /// DEAD past the grace period; the leader should remove them.
    pub expired: Vec<NodeId>,
}

/// Outcome of enqueuing a datanode command, including the leader/term gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    EnqueuedWithEviction,
    DroppedNotLeader,
    DroppedStaleTerm,
    DroppedOverflow,
}

#[derive(Debug, Clone)]
pub struct VersionInfo {
    pub cluster_id: String,
    pub scm_id: String,
    pub software_version: &'static str,
}

#[derive(Debug, Clone)]
pub struct NodeManagerConfig {
    pub thresholds: HealthThresholds,
    pub dead_node_grace: Duration,
    pub command_queue_depth: usize,
    pub pipelines_per_metadata_volume: u32,
    pub pipeline_limit_override: u32,
}

#[derive(Debug, Default)]
struct NodeTable {
    nodes: HashMap<NodeId, NodeRecord>,
    by_ip: HashMap<String, Vec<NodeId>>,
    by_host: HashMap<String, Vec<NodeId>>,
    pipelines_of: HashMap<NodeId, HashSet<PipelineId>>,
    containers_of: HashMap<NodeId, HashSet<ContainerId>>,
}

impl NodeTable {
    fn index_address(&mut self, record: &NodeRecord) {
        self.by_ip.entry(record.ip.clone()).or_default().push(record.id);
        self.by_host
            .entry(record.hostname.clone())
            .or_default()
            .push(record.id);
    }

    fn unindex_address(&mut self, record: &NodeRecord) {
        if let Some(ids) = self.by_ip.get_mut(&record.ip) {
            ids.retain(|id| *id != record.id);
        }
        if let Some(ids) = self.by_host.get_mut(&record.hostname) {
            ids.retain(|id| *id != record.id);
        }
    }
}

/// Tracks the datanode fleet. Writers run on the apply path only; the many
/// read-side RPC threads share the read lock.
pub struct NodeManager {
    config: NodeManagerConfig,
    cluster_id: ClusterId,
    scm_id: ScmId,
    gateway: HaGateway,
    resolver: CachingResolver,
    kv: Arc<KvStore>,
    bus: EventBus,
    metrics: SharedMetricsRegistry,
    state: RwLock<NodeTable>,
    queues: Mutex<HashMap<NodeId, CommandQueue>>,
}

impl NodeManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: NodeManagerConfig,
        cluster_id: ClusterId,
        scm_id: ScmId,
        gateway: HaGateway,
        resolver: CachingResolver,
        kv: Arc<KvStore>,
        bus: EventBus,
        metrics: SharedMetricsRegistry,
    ) -> Self {
        Self {
            config,
            cluster_id,
            scm_id,
            gateway,
            resolver,
            kv,
            bus,
            metrics,
            state: RwLock::new(NodeTable::default()),
            queues: Mutex::new(HashMap::new()),
        }
    }

    // ------------------------------------------------------------------
    // Read surface
    // ------------------------------------------------------------------

    pub fn get_version(&self) -> VersionInfo {
        VersionInfo {
            cluster_id: self.cluster_id.to_string(),
            scm_id: self.scm_id.to_string(),
            software_version: env!("CARGO_PKG_VERSION"),
        }
    }

    pub fn is_node_registered(&self, node: &NodeId) -> bool {
        self.state.read().nodes.contains_key(node)
    }

    pub fn node_by_id(&self, node: &NodeId) -> Option<NodeRecord> {
        self.state.read().nodes.get(node).cloned()
    }

    pub fn all_nodes(&self) -> Vec<NodeRecord> {
        self.state.read().nodes.values().cloned().collect()
    }

    pub fn nodes(&self, health: NodeHealth) -> Vec<NodeId> {
        self.state
            .read()
            .nodes
            .values()
            .filter(|record| record.health == health)
            .map(|record| record.id)
            .collect()
    }

    pub fn node_count(&self, health: NodeHealth) -> usize {
        self.nodes(health).len()
    }

    pub fn registered_count(&self) -> usize {
        self.state.read().nodes.len()
    }

    pub fn nodes_by_address(&self, address: &str) -> Vec<NodeId> {
        let table = self.state.read();
        let mut found = table.by_ip.get(address).cloned().unwrap_or_default();
        if let Some(by_host) = table.by_host.get(address) {
            for id in by_host {
                if !found.contains(id) {
                    found.push(*id);
                }
            }
        }
        found
    }

    pub fn healthy_nodes(&self) -> Vec<NodeId> {
        self.nodes(NodeHealth::Healthy)
    }

    pub fn stats(&self) -> NodeStats {
        let table = self.state.read();
        let mut stats = NodeStats::default();
        for record in table.nodes.values() {
            for report in &record.storage {
                if report.failed {
                    continue;
                }
                stats.capacity += report.capacity;
                stats.used += report.used;
                stats.remaining += report.remaining;
            }
        }
        stats
    }

    /// Smallest healthy-volume count across `nodes`; zero when any node is
    /// unknown.
    pub fn min_healthy_volume_num(&self, nodes: &[NodeId]) -> usize {
        let table = self.state.read();
        nodes
            .iter()
            .map(|node| {
                table
                    .nodes
                    .get(node)
                    .map(NodeRecord::healthy_volume_count)
                    .unwrap_or(0)
            })
            .min()
            .unwrap_or(0)
    }

    /// Per-node pipeline quota: a cluster-wide override wins; otherwise the
    /// metadata-volume rule applies while at least one data volume is healthy.
    pub fn pipeline_limit(&self, node: &NodeId) -> usize {
        if self.config.pipeline_limit_override > 0 {
            return self.config.pipeline_limit_override as usize;
        }
        let table = self.state.read();
        match table.nodes.get(node) {
            Some(record) if record.healthy_volume_count() > 0 => {
                (self.config.pipelines_per_metadata_volume as usize)
                    * (record.metadata_volume_count.max(1) as usize)
            }
            _ => 0,
        }
    }

    pub fn min_pipeline_limit(&self, nodes: &[NodeId]) -> usize {
        nodes
            .iter()
            .map(|node| self.pipeline_limit(node))
            .min()
            .unwrap_or(0)
    }

    pub fn pipelines_of(&self, node: &NodeId) -> HashSet<PipelineId> {
        self.state
            .read()
            .pipelines_of
            .get(node)
            .cloned()
            .unwrap_or_default()
    }

    pub fn pipeline_count(&self, node: &NodeId) -> usize {
        self.state
            .read()
            .pipelines_of
            .get(node)
            .map(HashSet::len)
            .unwrap_or(0)
    }

    pub fn containers_of(&self, node: &NodeId) -> HashSet<ContainerId> {
        self.state
            .read()
            .containers_of
            .get(node)
            .cloned()
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Write surface (leader): routed through the HA gateway
    // ------------------------------------------------------------------

    /// Registers a datanode. Re-registration of a known node is answered
    /// locally without a log entry.
    pub fn register(
        &self,
        mut details: NodeDetailsMsg,
        report: NodeReportMsg,
        pipeline_ids: Vec<String>,
    ) -> Result<RegisterOutcome, ScmError> {
        if !details.node_id.is_empty() {
            let id = parse_node_id(&details.node_id)?;
            if self.is_node_registered(&id) {
                return Ok(RegisterOutcome {
                    node_id: id,
                    cluster_id: self.cluster_id.to_string(),
                    already_registered: true,
                });
            }
        }
        if details.node_id.is_empty() {
            details.node_id = NodeId::random().to_string();
        }
        details.location = self.resolver.location_of(&details.hostname, &details.ip);
        let args = RegisterNodeArgs {
            details: Some(details),
            node_report: Some(report),
            pipeline_ids,
        };
        let raw = self.gateway.invoke(
            CommandKind::Node,
            NodeWriteMethod::Register as u32,
            encode_message(&args),
        )?;
        let reply: RegisterNodeReply = decode_message(&raw)?;
        Ok(RegisterOutcome {
            node_id: parse_node_id(&reply.node_id)?,
            cluster_id: reply.cluster_id,
            already_registered: reply.already_registered,
        })
    }

    /// Removes a node that stayed DEAD through the grace period.
    pub fn remove_node(&self, node: NodeId) -> Result<(), ScmError> {
        let args = RemoveNodeArgs {
            node_id: node.to_string(),
        };
        self.gateway
            .invoke(
                CommandKind::Node,
                NodeWriteMethod::Remove as u32,
                encode_message(&args),
            )
            .map(|_| ())
    }

    // ------------------------------------------------------------------
    // Local (non-replicated) mutation surface
    // ------------------------------------------------------------------

    /// Touches the node's heartbeat and drains its command mailbox. Unknown
    /// nodes are rejected so they re-register.
    pub fn process_heartbeat(
        &self,
        node: &NodeId,
        now_ms: u64,
    ) -> Result<Vec<DatanodeCommand>, ScmError> {
        {
            let mut table = self.state.write();
            let record = table
                .nodes
                .get_mut(node)
                .ok_or_else(|| ScmError::not_found("node", node))?;
            record.last_heartbeat_ms = now_ms;
            record.dead_since_ms = None;
            if matches!(record.health, NodeHealth::Stale | NodeHealth::Dead) {
                info!("event=node_recovered node={node} previous={:?}", record.health);
            }
            if !matches!(
                record.health,
                NodeHealth::Decommissioning | NodeHealth::Decommissioned
            ) {
                record.health = NodeHealth::Healthy;
            }
        }
        let mut queues = self.queues.lock();
        Ok(queues
            .get_mut(node)
            .map(CommandQueue::drain)
            .unwrap_or_default())
    }

    /// Applies a storage report. Reports from unknown nodes are discarded
    /// with a warning.
    pub fn process_node_report(&self, node: &NodeId, report: NodeReportMsg) {
        let mut table = self.state.write();
        match table.nodes.get_mut(node) {
            Some(record) => {
                record.storage = report.storage;
                record.metadata_volume_count = report.metadata_volume_count;
            }
            None => {
                warn!("event=node_report_discarded node={node} reason=unknown_node");
            }
        }
    }

    /// Enqueues a command for delivery in the node's next heartbeat reply.
    /// Only the consensus leader may enqueue: term-less commands on a
    /// follower are dropped, and stale-term commands are dropped everywhere.
    pub fn add_datanode_command(
        &self,
        node: &NodeId,
        kind: DatanodeCommandKind,
        term: Option<u64>,
    ) -> Result<EnqueueOutcome, ScmError> {
        if !self.is_node_registered(node) {
            return Err(ScmError::not_found("node", node));
        }
        let current_term = self.gateway.current_term();
        let stamped_term = match (self.gateway.is_leader(), term) {
            (false, None) => {
                warn!("event=datanode_command_dropped node={node} reason=not_leader");
                return Ok(EnqueueOutcome::DroppedNotLeader);
            }
            (false, Some(_)) => {
                warn!("event=datanode_command_dropped node={node} reason=follower_enqueue");
                return Ok(EnqueueOutcome::DroppedNotLeader);
            }
            (true, Some(term)) if term < current_term => {
                warn!(
                    "event=datanode_command_dropped node={node} reason=stale_term term={term} current={current_term}"
                );
                return Ok(EnqueueOutcome::DroppedStaleTerm);
            }
            (true, Some(term)) => term,
            (true, None) => current_term,
        };
        let command = DatanodeCommand::new(stamped_term, kind);
        let mut queues = self.queues.lock();
        let queue = queues
            .entry(*node)
            .or_insert_with(|| CommandQueue::new(*node, self.config.command_queue_depth));
        Ok(match queue.push(command) {
            QueuePushOutcome::Enqueued => EnqueueOutcome::Enqueued,
            QueuePushOutcome::EnqueuedWithEviction => EnqueueOutcome::EnqueuedWithEviction,
            QueuePushOutcome::Rejected => EnqueueOutcome::DroppedOverflow,
        })
    }

    pub fn add_pipeline(&self, node: &NodeId, pipeline: PipelineId) {
        self.state
            .write()
            .pipelines_of
            .entry(*node)
            .or_default()
            .insert(pipeline);
    }

    pub fn remove_pipeline(&self, node: &NodeId, pipeline: &PipelineId) {
        let mut table = self.state.write();
        if let Some(pipelines) = table.pipelines_of.get_mut(node) {
            pipelines.remove(pipeline);
        }
    }

    pub fn add_container(&self, node: &NodeId, container: ContainerId) {
        self.state
            .write()
            .containers_of
            .entry(*node)
            .or_default()
            .insert(container);
    }

    pub fn set_containers(&self, node: &NodeId, containers: HashSet<ContainerId>) {
        self.state.write().containers_of.insert(*node, containers);
    }

    /// One sweeper tick. Classifies every node by heartbeat silence, emits
    /// stale/dead events, and reports DEAD nodes whose grace expired.
    pub fn sweep(&self, now_ms: u64) -> SweepReport {
        let mut report = SweepReport::default();
        let mut events = Vec::new();
        {
            let mut table = self.state.write();
            for record in table.nodes.values_mut() {
                if matches!(
                    record.health,
                    NodeHealth::Decommissioning | NodeHealth::Decommissioned
                ) {
                    continue;
                }
                let silence = Duration::from_millis(now_ms.saturating_sub(record.last_heartbeat_ms));
                let next = self.config.thresholds.classify(silence);
                if next != record.health {
                    match next {
                        NodeHealth::Stale => {
                            events.push(ScmEvent::NodeStale { node: record.id });
                            report.stale.push(record.id);
                        }
                        NodeHealth::Dead => {
                            events.push(ScmEvent::NodeDead { node: record.id });
                            record.dead_since_ms = Some(now_ms);
                            report.dead.push(record.id);
                        }
                        _ => {}
                    }
                    info!(
                        "event=node_health_transition node={} from={:?} to={:?}",
                        record.id, record.health, next
                    );
                    record.health = next;
                }
                if record.health == NodeHealth::Dead {
                    if let Some(dead_since) = record.dead_since_ms {
                        let dead_for = Duration::from_millis(now_ms.saturating_sub(dead_since));
                        if dead_for >= self.config.dead_node_grace {
                            report.expired.push(record.id);
                        }
                    }
                }
            }
        }
        for event in events {
            self.bus.publish(event);
        }
        self.metrics
            .set_gauge("node.healthy", self.node_count(NodeHealth::Healthy) as u64);
        self.metrics
            .set_gauge("node.stale", self.node_count(NodeHealth::Stale) as u64);
        self.metrics
            .set_gauge("node.dead", self.node_count(NodeHealth::Dead) as u64);
        report
    }

    /// Rebuilds the in-memory table from the `nodes` KV table after a restart
    /// or snapshot install. Every node restarts its heartbeat clock at `now`.
    pub fn reload(&self, now_ms: u64) -> Result<(), ScmError> {
        let mut table = NodeTable::default();
        for (key, value) in self.kv.scan(TABLE_NODES).map_err(kv_err)? {
            let msg: NodeInfoMsg = decode_message(&value)?;
            let record = record_from_msg(msg, now_ms)?;
            if record.id.to_string().into_bytes() != key {
                return Err(ScmError::Metadata(format!(
                    "node table key mismatch for {}",
                    record.id
                )));
            }
            table.index_address(&record);
            table.nodes.insert(record.id, record);
        }
        let mut queues = self.queues.lock();
        queues.clear();
        for id in table.nodes.keys() {
            queues.insert(*id, CommandQueue::new(*id, self.config.command_queue_depth));
        }
        drop(queues);
        *self.state.write() = table;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Apply entry points (every replica, single-threaded, deterministic)
    // ------------------------------------------------------------------

    fn apply_register(&self, args: RegisterNodeArgs, stamped_ms: u64) -> Result<Vec<u8>, ScmError> {
        let details = args
            .details
            .ok_or_else(|| ScmError::Metadata("register without node details".into()))?;
        let id = parse_node_id(&details.node_id)?;
        let report = args.node_report.unwrap_or_default();

        {
            let table = self.state.read();
            if table.nodes.contains_key(&id) {
                return Ok(encode_message(&RegisterNodeReply {
                    cluster_id: self.cluster_id.to_string(),
                    scm_id: self.scm_id.to_string(),
                    node_id: id.to_string(),
                    already_registered: true,
                }));
            }
        }

        let record = record_from_msg(
            NodeInfoMsg {
                details: Some(details.clone()),
                report: Some(report.clone()),
            },
            stamped_ms,
        )?;

        let persisted = NodeInfoMsg {
            details: Some(details),
            report: Some(report),
        };
        self.kv
            .put(
                TABLE_NODES,
                id.to_string().into_bytes(),
                encode_message(&persisted),
            )
            .map_err(kv_err)?;

        {
            let mut table = self.state.write();
            table.index_address(&record);
            for raw in &args.pipeline_ids {
                if let Ok(pipeline) = raw.parse::<PipelineId>() {
                    table.pipelines_of.entry(id).or_default().insert(pipeline);
                }
            }
            table.nodes.insert(id, record);
        }
        self.queues
            .lock()
            .entry(id)
            .or_insert_with(|| CommandQueue::new(id, self.config.command_queue_depth));

        self.metrics.inc_counter("node.registered_total", 1);
        self.bus.publish(ScmEvent::NodeRegistered { node: id });
        info!("event=node_registered node={id}");

        Ok(encode_message(&RegisterNodeReply {
            cluster_id: self.cluster_id.to_string(),
            scm_id: self.scm_id.to_string(),
            node_id: id.to_string(),
            already_registered: false,
        }))
    }

    fn apply_remove(&self, args: RemoveNodeArgs) -> Result<Vec<u8>, ScmError> {
        let id = parse_node_id(&args.node_id)?;
        let removed = {
            let mut table = self.state.write();
            match table.nodes.remove(&id) {
                Some(record) => {
                    table.unindex_address(&record);
                    table.pipelines_of.remove(&id);
                    table.containers_of.remove(&id);
                    true
                }
                None => false,
            }
        };
        if removed {
            self.kv
                .delete(TABLE_NODES, id.to_string().as_bytes())
                .map_err(kv_err)?;
            self.queues.lock().remove(&id);
            self.bus.publish(ScmEvent::NodeRemoved { node: id });
            info!("event=node_removed node={id}");
        }
        Ok(Vec::new())
    }
}

impl crate::consensus::CommandExecutor for NodeManager {
    fn execute(&self, envelope: &CommandEnvelope) -> Result<Vec<u8>, ScmError> {
        match NodeWriteMethod::from_u32(envelope.method) {
            Some(NodeWriteMethod::Register) => {
                let args: RegisterNodeArgs = decode_message(&envelope.args)?;
                self.apply_register(args, envelope.stamped_at_ms)
            }
            Some(NodeWriteMethod::Remove) => {
                let args: RemoveNodeArgs = decode_message(&envelope.args)?;
                self.apply_remove(args)
            }
            None => Err(ScmError::Metadata(format!(
                "unknown node write method {}",
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

fn record_from_msg(msg: NodeInfoMsg, now_ms: u64) -> Result<NodeRecord, ScmError> {
    let details = msg
        .details
        .ok_or_else(|| ScmError::Metadata("node record without details".into()))?;
    let report = msg.report.unwrap_or_default();
    Ok(NodeRecord {
        id: parse_node_id(&details.node_id)?,
        hostname: details.hostname,
        ip: details.ip,
        port: details.port as u16,
        location: details.location,
        storage: report.storage,
        metadata_volume_count: report.metadata_volume_count,
        health: NodeHealth::Healthy,
        last_heartbeat_ms: now_ms,
        dead_since_ms: None,
    })
}

/// Builds a plain disk report for tests and simulators.
pub fn disk_report(volume: &str, capacity: u64, used: u64) -> StorageReportMsg {
    StorageReportMsg {
        volume: volume.to_string(),
        capacity,
        used,
        remaining: capacity.saturating_sub(used),
        kind: VolumeKind::Disk as i32,
        failed: false,
    }
}
