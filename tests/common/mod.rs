#![allow(dead_code)]

use containor::bootstrap::ScmStorage;
use containor::config::{ReplicationConfig, ScmConfig};
use containor::consensus::PeerId;
use containor::gateway::ManualClock;
use containor::ids::NodeId;
use containor::node::{disk_report, StaticTableResolver};
use containor::pipeline::{Pipeline, RandomPlacement};
use containor::scm::{Scm, ScmBuilder};
use containor::wire::{NodeDetailsMsg, NodeReportMsg};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const GIB: u64 = 1024 * 1024 * 1024;
pub const START_MS: u64 = 1_700_000_000_000;

pub struct TestCluster {
    pub scm: Arc<Scm>,
    pub clock: Arc<ManualClock>,
    dir: TempDir,
}

impl TestCluster {
    pub fn advance(&self, delta: Duration) {
        self.clock.advance(delta.as_millis() as u64);
    }

    pub fn storage_root(&self) -> &Path {
        self.dir.path()
    }
}

pub fn test_config() -> ScmConfig {
    let mut config = ScmConfig::default();
    config.pipeline_create_timeout = Duration::from_secs(60);
    config.submit_timeout = Duration::from_secs(5);
    config
}

pub fn cluster_with(config: ScmConfig) -> TestCluster {
    let dir = tempfile::tempdir().expect("temp dir");
    let clock = Arc::new(ManualClock::at(START_MS));
    let scm = Scm::bootstrap(ScmBuilder {
        config,
        storage: ScmStorage::new(dir.path()),
        peer: PeerId::new("scm-1"),
        voters: vec![PeerId::new("scm-1")],
        clock: clock.clone(),
        resolver: Arc::new(StaticTableResolver::new()),
        placement: Arc::new(RandomPlacement),
        checkpoint_key: b"test-cluster-secret".to_vec(),
    })
    .expect("bootstrap");
    scm.assume_leadership(1).expect("step up");
    TestCluster {
        scm: Arc::new(scm),
        clock,
        dir,
    }
}

pub fn cluster() -> TestCluster {
    cluster_with(test_config())
}

/// A replica that stays in the follower role; entries reach it through
/// `append_replicated` + `commit_to`.
pub fn follower_cluster() -> TestCluster {
    let dir = tempfile::tempdir().expect("temp dir");
    let clock = Arc::new(ManualClock::at(START_MS));
    let scm = Scm::bootstrap(ScmBuilder {
        config: test_config(),
        storage: ScmStorage::new(dir.path()),
        peer: PeerId::new("scm-2"),
        voters: vec![PeerId::new("scm-2")],
        clock: clock.clone(),
        resolver: Arc::new(StaticTableResolver::new()),
        placement: Arc::new(RandomPlacement),
        checkpoint_key: b"test-cluster-secret".to_vec(),
    })
    .expect("bootstrap follower");
    TestCluster {
        scm: Arc::new(scm),
        clock,
        dir,
    }
}

/// Re-opens an SCM over an existing storage root, as a process restart would.
pub fn reopen(cluster: &TestCluster) -> Scm {
    let scm = Scm::bootstrap(ScmBuilder {
        config: test_config(),
        storage: ScmStorage::new(cluster.dir.path()),
        peer: PeerId::new("scm-1"),
        voters: vec![PeerId::new("scm-1")],
        clock: cluster.clock.clone(),
        resolver: Arc::new(StaticTableResolver::new()),
        placement: Arc::new(RandomPlacement),
        checkpoint_key: b"test-cluster-secret".to_vec(),
    })
    .expect("re-bootstrap");
    scm.assume_leadership(2).expect("step up after restart");
    scm
}

pub fn node_details(name: &str, ip_octet: u8) -> NodeDetailsMsg {
    NodeDetailsMsg {
        node_id: String::new(),
        hostname: name.to_string(),
        ip: format!("10.0.0.{ip_octet}"),
        port: 9858,
        location: String::new(),
    }
}

pub fn node_report() -> NodeReportMsg {
    NodeReportMsg {
        storage: vec![disk_report("/data/vol1", 100 * GIB, 0)],
        metadata_volume_count: 1,
    }
}

pub fn register_node(scm: &Scm, name: &str, ip_octet: u8) -> NodeId {
    let reply = scm
        .register_datanode(node_details(name, ip_octet), node_report(), Vec::new())
        .expect("register");
    reply.node_id.parse().expect("node id")
}

pub fn register_fleet(scm: &Scm, count: u8) -> Vec<NodeId> {
    (0..count)
        .map(|index| register_node(scm, &format!("dn-{index}"), index + 1))
        .collect()
}

/// Creates a pipeline and walks it to OPEN by acknowledging from every
/// member, the way pipeline reports would.
pub fn open_pipeline(scm: &Scm, replication: ReplicationConfig) -> Pipeline {
    let created = scm.create_pipeline(replication).expect("create pipeline");
    for member in &created.members {
        scm.pipeline_report(member, vec![created.id]);
    }
    scm.pipelines
        .pipeline(&created.id)
        .expect("pipeline present")
}
