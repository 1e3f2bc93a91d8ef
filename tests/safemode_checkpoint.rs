mod common;

use common::{cluster_with, register_node, test_config};
use containor::config::ReplicationConfig;
use containor::container::ContainerState;
use containor::events::{EventRecorder, ScmEvent};

fn three_node_config() -> containor::config::ScmConfig {
    let mut config = test_config();
    config.safe_mode_min_datanodes = 3;
    config.safe_mode_container_threshold = 0.99;
    config
}

#[test]
fn fresh_cluster_bootstrap_walkthrough() {
    let cluster = cluster_with(three_node_config());
    let recorder = EventRecorder::new();
    recorder.attach(&cluster.scm.bus);

    let status = cluster.scm.safe_mode_status();
    assert!(status.in_safe_mode);
    assert!(!status.pre_check_complete);

    register_node(&cluster.scm, "dn-0", 1);
    let status = cluster.scm.safe_mode_status();
    assert!(status.in_safe_mode);
    assert!(!status.pre_check_complete);

    register_node(&cluster.scm, "dn-1", 2);
    register_node(&cluster.scm, "dn-2", 3);

    // Pre-check passes on the third registration, and with zero containers
    // the container rule is vacuously satisfied: safe mode exits.
    let status = cluster.scm.safe_mode_status();
    assert!(status.pre_check_complete);
    assert!(!status.in_safe_mode);
    assert!(recorder.contains(&ScmEvent::PreCheckComplete));
}

#[test]
fn container_rule_gates_exit_until_replicas_report() {
    let mut config = three_node_config();
    config.safe_mode_min_datanodes = 1;
    let cluster = cluster_with(config);

    // Seed a cluster that already has containers, then restart it so the
    // containers are known but no replicas have been reported yet.
    let nodes = common::register_fleet(&cluster.scm, 3);
    let pipeline = common::open_pipeline(&cluster.scm, ReplicationConfig::replicated(3));
    let container = cluster
        .scm
        .allocate_container(ReplicationConfig::replicated(3), "test-owner")
        .expect("allocate");
    cluster
        .scm
        .log()
        .take_snapshot(&cluster.scm.storage().checkpoints_dir().join("cp-1"))
        .expect("snapshot");

    let restarted = common::reopen(&cluster);
    assert_eq!(restarted.containers.count(), 1);
    let status = restarted.safe_mode_status();
    assert!(status.in_safe_mode, "known container with no replica reported");

    // One node reports the replica: coverage 1/1 meets the 0.99 threshold.
    restarted.container_report(
        &nodes[0],
        vec![(
            container.id.value(),
            containor::wire::ContainerStateMsg::from(ContainerState::Open) as i32,
            0,
            0,
        )],
    );
    let status = restarted.safe_mode_status();
    assert!(!status.in_safe_mode);
    let _ = pipeline;
}

#[test]
fn exit_is_never_reversed_by_regression() {
    let cluster = cluster_with(three_node_config());
    common::register_fleet(&cluster.scm, 3);
    assert!(!cluster.scm.safe_mode_status().in_safe_mode);

    // Later rule evaluations see worse state; the flip stays.
    let status = cluster.scm.revalidate_safe_mode();
    assert!(!status.in_safe_mode);
    assert!(status.pre_check_complete);
}

#[test]
fn disabled_safe_mode_admits_traffic_immediately() {
    let mut config = test_config();
    config.safe_mode_enabled = false;
    config.safe_mode_min_datanodes = 100;
    let cluster = cluster_with(config);
    assert!(!cluster.scm.safe_mode_status().in_safe_mode);
    assert!(cluster.scm.safe_mode_status().pre_check_complete);
}

#[test]
fn mutating_traffic_rejected_during_safe_mode() {
    let cluster = cluster_with(three_node_config());
    register_node(&cluster.scm, "dn-0", 1);
    let err = cluster
        .scm
        .allocate_container(ReplicationConfig::replicated(3), "test-owner")
        .unwrap_err();
    assert!(matches!(err, containor::ScmError::Conflict { .. }));
}
