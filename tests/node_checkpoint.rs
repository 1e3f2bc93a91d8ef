mod common;

use common::{cluster, node_details, node_report, register_node, START_MS};
use containor::config::ReplicationConfig;
use containor::ids::{ContainerId, NodeId};
use containor::node::{DatanodeCommandKind, EnqueueOutcome, NodeHealth};
use std::time::Duration;

#[test]
fn register_twice_is_idempotent_with_one_log_entry() {
    let cluster = cluster();
    let first = cluster
        .scm
        .register_datanode(node_details("dn-0", 1), node_report(), Vec::new())
        .unwrap();
    assert!(!first.already_registered);
    let entries_after_first = cluster.scm.log().last_log_index();

    let mut details = node_details("dn-0", 1);
    details.node_id = first.node_id.clone();
    let second = cluster
        .scm
        .register_datanode(details, node_report(), Vec::new())
        .unwrap();
    assert!(second.already_registered);
    assert_eq!(second.node_id, first.node_id);
    assert_eq!(cluster.scm.log().last_log_index(), entries_after_first);

    let node: NodeId = first.node_id.parse().unwrap();
    assert!(cluster.scm.nodes.is_node_registered(&node));
    assert_eq!(cluster.scm.nodes.registered_count(), 1);
}

#[test]
fn register_reply_carries_cluster_identity() {
    let cluster = cluster();
    let reply = cluster
        .scm
        .register_datanode(node_details("dn-0", 1), node_report(), Vec::new())
        .unwrap();
    assert!(reply.cluster_id.starts_with("CID-"));
    assert_eq!(reply.scm_id, cluster.scm.version().scm_id.to_string());
}

#[test]
fn heartbeat_drains_commands_exactly_once() {
    let cluster = cluster();
    let node = register_node(&cluster.scm, "dn-0", 1);
    cluster
        .scm
        .nodes
        .add_datanode_command(
            &node,
            DatanodeCommandKind::CloseContainer {
                container: ContainerId::new(7),
                force: false,
            },
            None,
        )
        .unwrap();

    let first = cluster.scm.heartbeat(&node).unwrap();
    assert_eq!(first.len(), 1);
    let second = cluster.scm.heartbeat(&node).unwrap();
    assert!(second.is_empty());
}

#[test]
fn unknown_node_heartbeat_is_rejected() {
    let cluster = cluster();
    let err = cluster.scm.heartbeat(&NodeId::random()).unwrap_err();
    assert!(matches!(err, containor::ScmError::NotFound { .. }));
}

#[test]
fn unknown_node_report_is_discarded() {
    let cluster = cluster();
    // Must not panic or create a phantom node.
    cluster
        .scm
        .nodes
        .process_node_report(&NodeId::random(), node_report());
    assert_eq!(cluster.scm.nodes.registered_count(), 0);
}

#[test]
fn health_transitions_at_exact_boundaries() {
    let cluster = cluster();
    let node = register_node(&cluster.scm, "dn-0", 1);
    cluster.scm.heartbeat(&node).unwrap();

    // stale_after is 30s: at exactly 30s the node is still HEALTHY.
    cluster.advance(Duration::from_secs(30));
    cluster.scm.sweep().unwrap();
    assert_eq!(
        cluster.scm.nodes.node_by_id(&node).unwrap().health,
        NodeHealth::Healthy
    );

    // One millisecond past the threshold: STALE.
    cluster.advance(Duration::from_millis(1));
    let report = cluster.scm.sweep().unwrap();
    assert_eq!(report.stale, vec![node]);
    assert_eq!(
        cluster.scm.nodes.node_by_id(&node).unwrap().health,
        NodeHealth::Stale
    );
}

#[test]
fn dead_node_closes_pipelines_and_expires_after_grace() {
    let cluster = cluster();
    let nodes = common::register_fleet(&cluster.scm, 3);
    let pipeline = common::open_pipeline(&cluster.scm, ReplicationConfig::replicated(3));
    for node in &nodes {
        cluster.scm.heartbeat(node).unwrap();
    }

    // dead_after is 120s: one member going silent past it kills the node
    // and queues its pipelines for closure.
    cluster.advance(Duration::from_secs(121));
    for node in &nodes[1..] {
        cluster.scm.heartbeat(node).unwrap();
    }
    let report = cluster.scm.sweep().unwrap();
    assert_eq!(report.dead, vec![nodes[0]]);
    assert_eq!(
        cluster
            .scm
            .pipelines
            .pipeline(&pipeline.id)
            .map(|pipeline| pipeline.state),
        // Closed and drained pipelines leave the store entirely.
        None
    );

    // The dead node lingers through the grace period, then is removed.
    assert!(cluster.scm.nodes.is_node_registered(&nodes[0]));
    cluster.advance(cluster.scm.config().dead_node_grace + Duration::from_secs(1));
    for node in &nodes[1..] {
        cluster.scm.heartbeat(node).unwrap();
    }
    let report = cluster.scm.sweep().unwrap();
    assert_eq!(report.expired, vec![nodes[0]]);
    assert!(!cluster.scm.nodes.is_node_registered(&nodes[0]));
}

#[test]
fn heartbeat_restores_a_stale_node() {
    let cluster = cluster();
    let node = register_node(&cluster.scm, "dn-0", 1);
    cluster.advance(Duration::from_secs(45));
    cluster.scm.sweep().unwrap();
    assert_eq!(
        cluster.scm.nodes.node_by_id(&node).unwrap().health,
        NodeHealth::Stale
    );

    cluster.scm.heartbeat(&node).unwrap();
    assert_eq!(
        cluster.scm.nodes.node_by_id(&node).unwrap().health,
        NodeHealth::Healthy
    );
    assert!(
        cluster.scm.nodes.node_by_id(&node).unwrap().last_heartbeat_ms > START_MS
    );
}

#[test]
fn follower_enqueue_without_term_is_dropped() {
    let cluster = cluster();
    let node = register_node(&cluster.scm, "dn-0", 1);
    cluster.scm.yield_leadership(None);

    let outcome = cluster
        .scm
        .nodes
        .add_datanode_command(&node, DatanodeCommandKind::Reregister, None)
        .unwrap();
    assert_eq!(outcome, EnqueueOutcome::DroppedNotLeader);
}

#[test]
fn stale_term_commands_are_dropped() {
    let cluster = cluster();
    let node = register_node(&cluster.scm, "dn-0", 1);
    cluster.scm.yield_leadership(None);
    cluster.scm.assume_leadership(5).unwrap();

    let outcome = cluster
        .scm
        .nodes
        .add_datanode_command(&node, DatanodeCommandKind::Reregister, Some(3))
        .unwrap();
    assert_eq!(outcome, EnqueueOutcome::DroppedStaleTerm);

    let outcome = cluster
        .scm
        .nodes
        .add_datanode_command(&node, DatanodeCommandKind::Reregister, Some(5))
        .unwrap();
    assert_eq!(outcome, EnqueueOutcome::Enqueued);
}

#[test]
fn pipeline_limit_follows_metadata_volumes() {
    let cluster = cluster();
    let node = register_node(&cluster.scm, "dn-0", 1);
    // One metadata volume, pipelines_per_metadata_volume = 2.
    assert_eq!(cluster.scm.nodes.pipeline_limit(&node), 2);
    assert_eq!(cluster.scm.nodes.min_pipeline_limit(&[node]), 2);
    assert_eq!(cluster.scm.nodes.min_healthy_volume_num(&[node]), 1);
}

#[test]
fn address_index_resolves_ip_and_hostname() {
    let cluster = cluster();
    let node = register_node(&cluster.scm, "dn-7", 9);
    assert_eq!(cluster.scm.nodes.nodes_by_address("10.0.0.9"), vec![node]);
    assert_eq!(cluster.scm.nodes.nodes_by_address("dn-7"), vec![node]);
    assert!(cluster.scm.nodes.nodes_by_address("unknown").is_empty());
}
