pub const MIN_DATANODE_RULE: &str = "MinDatanodesRule";
pub const CONTAINER_RULE: &str = "ContainerReplicaRule";
pub const HEALTHY_PIPELINE_RULE: &str = "HealthyPipelineRule";
pub const ONE_REPLICA_PIPELINE_RULE: &str = "OneReplicaPipelineRule";

/// A snapshot of the cluster observations the rules consume. Assembled by
/// the facade from the managers after every report that could satisfy a
/// rule; rules never hold manager references.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SafeModeSample {
    pub registered_nodes: usize,
    pub containers_with_replica: usize,
    pub total_eligible_containers: usize,
    pub open_full_replicated_pipelines: usize,
    pub total_replicated_pipelines: usize,
    pub pipelines_with_report: usize,
}

/// One exit rule. `refresh` absorbs the latest sample; `validate` answers
/// from the absorbed state only.
pub trait SafeModeRule: Send + Sync {
    fn name(&self) -> &'static str;
    fn refresh(&mut self, sample: &SafeModeSample);
    fn validate(&self) -> bool;
    fn status_text(&self) -> String;
}

/// Pre-check rule: at least `min_datanodes` nodes have registered.
pub struct MinDatanodesRule {
    min_datanodes: usize,
    registered: usize,
}

impl MinDatanodesRule {
    pub fn new(min_datanodes: usize) -> Self {
        Self {
            min_datanodes,
            registered: 0,
        }
    }
}

impl SafeModeRule for MinDatanodesRule {
    fn name(&self) -> &'static str {
        MIN_DATANODE_RULE
    }

    fn refresh(&mut self, sample: &SafeModeSample) {
        self.registered = sample.registered_nodes;
    }

    fn validate(&self) -> bool {
        self.registered >= self.min_datanodes
    }

    fn status_text(&self) -> String {
        format!(
            "registered datanodes {} of required {}",
            self.registered, self.min_datanodes
        )
    }
}

/// At least `threshold` of eligible containers have a reported replica.
/// Vacuously satisfied on an empty cluster.
pub struct ContainerReplicaRule {
    threshold: f64,
    covered: usize,
    total: usize,
}

impl ContainerReplicaRule {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            covered: 0,
            total: 0,
        }
    }

    pub fn current_fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.covered as f64 / self.total as f64
        }
    }
}

impl SafeModeRule for ContainerReplicaRule {
    fn name(&self) -> &'static str {
        CONTAINER_RULE
    }

    fn refresh(&mut self, sample: &SafeModeSample) {
        self.covered = sample.containers_with_replica;
        self.total = sample.total_eligible_containers;
    }

    fn validate(&self) -> bool {
        self.current_fraction() >= self.threshold
    }

    fn status_text(&self) -> String {
        format!(
            "containers with a reported replica: {} of {} (threshold {})",
            self.covered, self.total, self.threshold
        )
    }
}

/// At least `threshold` of replicated pipelines are OPEN with a full member
/// set. Optional; vacuously satisfied with no replicated pipelines.
pub struct HealthyPipelineRule {
    threshold: f64,
    open_full: usize,
    total: usize,
}

impl HealthyPipelineRule {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            open_full: 0,
            total: 0,
        }
    }
}

impl SafeModeRule for HealthyPipelineRule {
    fn name(&self) -> &'static str {
        HEALTHY_PIPELINE_RULE
    }

    fn refresh(&mut self, sample: &SafeModeSample) {
        self.open_full = sample.open_full_replicated_pipelines;
        self.total = sample.total_replicated_pipelines;
    }

    fn validate(&self) -> bool {
        if self.total == 0 {
            return true;
        }
        self.open_full as f64 / self.total as f64 >= self.threshold
    }

    fn status_text(&self) -> String {
        format!(
            "healthy replicated pipelines: {} of {} (threshold {})",
            self.open_full, self.total, self.threshold
        )
    }
}

/// Every replicated pipeline has at least one member reporting. Optional.
pub struct OneReplicaPipelineRule {
    reported: usize,
    total: usize,
}

impl OneReplicaPipelineRule {
    pub fn new() -> Self {
        Self {
            reported: 0,
            total: 0,
        }
    }
}

impl Default for OneReplicaPipelineRule {
    fn default() -> Self {
        Self::new()
    }
}

impl SafeModeRule for OneReplicaPipelineRule {
    fn name(&self) -> &'static str {
        ONE_REPLICA_PIPELINE_RULE
    }

    fn refresh(&mut self, sample: &SafeModeSample) {
        self.reported = sample.pipelines_with_report;
        self.total = sample.total_replicated_pipelines;
    }

    fn validate(&self) -> bool {
        self.reported >= self.total
    }

    fn status_text(&self) -> String {
        format!(
            "pipelines with at least one reporting member: {} of {}",
            self.reported, self.total
        )
    }
}
