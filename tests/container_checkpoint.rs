mod common;

use common::{cluster, open_pipeline, register_fleet};
use containor::config::ReplicationConfig;
use containor::container::{ContainerReplica, ContainerState, LifecycleEvent};
use containor::ids::ContainerId;
use containor::wire::CommandTypeMsg;
use containor::ScmError;
use std::collections::HashSet;

fn replicated() -> ReplicationConfig {
    ReplicationConfig::replicated(3)
}

#[test]
fn allocate_assigns_monotone_ids_on_the_open_pipeline() {
    let cluster = cluster();
    register_fleet(&cluster.scm, 3);
    let pipeline = open_pipeline(&cluster.scm, replicated());

    let first = cluster.scm.allocate_container(replicated(), "ns-svc").unwrap();
    let second = cluster.scm.allocate_container(replicated(), "ns-svc").unwrap();
    assert_eq!(first.id, ContainerId::new(1));
    assert_eq!(second.id, ContainerId::new(2));
    assert_eq!(first.pipeline, pipeline.id);
    assert_eq!(first.state, ContainerState::Open);
    assert_eq!(first.owner, "ns-svc");
    assert_eq!(first.replication, replicated());
}

#[test]
fn allocate_without_open_pipeline_starts_one_and_retries_later() {
    let cluster = cluster();
    register_fleet(&cluster.scm, 3);

    let err = cluster
        .scm
        .allocate_container(replicated(), "ns-svc")
        .unwrap_err();
    assert!(matches!(err, ScmError::NotFound { .. }));
    // The attempt left a pipeline building in the background.
    assert_eq!(cluster.scm.pipelines.count(), 1);
}

#[test]
fn close_cascade_finalizes_open_containers() {
    let cluster = cluster();
    let nodes = register_fleet(&cluster.scm, 3);
    let pipeline = open_pipeline(&cluster.scm, replicated());
    let container = cluster.scm.allocate_container(replicated(), "ns-svc").unwrap();
    for node in &nodes {
        cluster.scm.heartbeat(node).unwrap();
    }

    cluster.scm.close_pipeline(&pipeline.id).unwrap();

    let closing = cluster.scm.containers.container(container.id).unwrap();
    assert_eq!(closing.state, ContainerState::Closing);

    // Every member got a ClosePipeline and a CloseContainer command.
    for node in &nodes {
        let commands = cluster.scm.heartbeat(node).unwrap();
        let kinds: Vec<i32> = commands.iter().map(|command| command.kind).collect();
        assert!(kinds.contains(&(CommandTypeMsg::ClosePipeline as i32)));
        assert!(kinds.contains(&(CommandTypeMsg::CloseContainer as i32)));
    }

    // No new allocations land on the closed pipeline.
    let err = cluster
        .scm
        .containers
        .allocate_on(&pipeline.id, replicated(), "ns-svc")
        .unwrap_err();
    assert!(matches!(
        err,
        ScmError::NotFound { .. } | ScmError::InvalidStateTransition { .. }
    ));
}

#[test]
fn lifecycle_walk_and_rejections() {
    let cluster = cluster();
    register_fleet(&cluster.scm, 3);
    open_pipeline(&cluster.scm, replicated());
    let container = cluster.scm.allocate_container(replicated(), "ns-svc").unwrap();

    // FORCE_CLOSE is only valid from QUASI_CLOSED.
    let err = cluster
        .scm
        .container_event(container.id, LifecycleEvent::ForceClose)
        .unwrap_err();
    assert!(matches!(err, ScmError::InvalidStateTransition { .. }));

    let closing = cluster
        .scm
        .container_event(container.id, LifecycleEvent::Finalize)
        .unwrap();
    assert_eq!(closing.state, ContainerState::Closing);

    let quasi = cluster
        .scm
        .container_event(container.id, LifecycleEvent::QuasiClose)
        .unwrap();
    assert_eq!(quasi.state, ContainerState::QuasiClosed);

    let closed = cluster
        .scm
        .container_event(container.id, LifecycleEvent::ForceClose)
        .unwrap();
    assert_eq!(closed.state, ContainerState::Closed);

    // Re-running an absorbed event is a no-op, not an error.
    let still_closed = cluster
        .scm
        .container_event(container.id, LifecycleEvent::Finalize)
        .unwrap();
    assert_eq!(still_closed.state, ContainerState::Closed);

    let deleting = cluster
        .scm
        .container_event(container.id, LifecycleEvent::Delete)
        .unwrap();
    assert_eq!(deleting.state, ContainerState::Deleting);
    assert_eq!(deleting.delete_txn_id, 1);

    let deleted = cluster
        .scm
        .container_event(container.id, LifecycleEvent::Cleanup)
        .unwrap();
    assert_eq!(deleted.state, ContainerState::Deleted);
}

#[test]
fn delete_txn_ids_are_monotone() {
    let cluster = cluster();
    register_fleet(&cluster.scm, 3);
    open_pipeline(&cluster.scm, replicated());
    let first = cluster.scm.allocate_container(replicated(), "ns-svc").unwrap();
    let second = cluster.scm.allocate_container(replicated(), "ns-svc").unwrap();

    for id in [first.id, second.id] {
        cluster.scm.container_event(id, LifecycleEvent::Finalize).unwrap();
        cluster.scm.container_event(id, LifecycleEvent::Close).unwrap();
    }
    let one = cluster
        .scm
        .container_event(first.id, LifecycleEvent::Delete)
        .unwrap();
    let two = cluster
        .scm
        .container_event(second.id, LifecycleEvent::Delete)
        .unwrap();
    assert_eq!(one.delete_txn_id, 1);
    assert_eq!(two.delete_txn_id, 2);
}

#[test]
fn get_matching_prefers_existing_then_preallocates() {
    let cluster = cluster();
    register_fleet(&cluster.scm, 3);
    let pipeline = open_pipeline(&cluster.scm, replicated());

    // Floor is ceil(4 / 2) = 2 open containers per pipeline: each call
    // below the floor pre-allocates one before selecting.
    let matched = cluster
        .scm
        .get_matching_container(1024, "ns-svc", &pipeline.id, &HashSet::new())
        .unwrap();
    assert_eq!(cluster.scm.containers.open_containers_on(&pipeline.id).len(), 1);

    let again = cluster
        .scm
        .get_matching_container(1024, "ns-svc", &pipeline.id, &HashSet::new())
        .unwrap();
    assert_eq!(matched.id, again.id);
    assert_eq!(cluster.scm.containers.open_containers_on(&pipeline.id).len(), 2);

    // Excluding it lands on the other open container.
    let mut exclude = HashSet::new();
    exclude.insert(matched.id);
    let other = cluster
        .scm
        .get_matching_container(1024, "ns-svc", &pipeline.id, &exclude)
        .unwrap();
    assert_ne!(other.id, matched.id);
}

#[test]
fn get_matching_skips_other_owners() {
    let cluster = cluster();
    register_fleet(&cluster.scm, 3);
    let pipeline = open_pipeline(&cluster.scm, replicated());
    cluster.scm.allocate_container(replicated(), "tenant-a").unwrap();
    cluster.scm.allocate_container(replicated(), "tenant-a").unwrap();

    let matched = cluster
        .scm
        .get_matching_container(1024, "tenant-b", &pipeline.id, &HashSet::new())
        .unwrap();
    assert_eq!(matched.owner, "tenant-b");
}

#[test]
fn replica_updates_are_idempotent_per_node() {
    let cluster = cluster();
    let nodes = register_fleet(&cluster.scm, 3);
    open_pipeline(&cluster.scm, replicated());
    let container = cluster.scm.allocate_container(replicated(), "ns-svc").unwrap();

    for _ in 0..3 {
        cluster.scm.containers.update_replica(ContainerReplica {
            container: container.id,
            node: nodes[0],
            reported_state: ContainerState::Open,
            bytes_used: 512,
            key_count: 4,
            last_seen_ms: 0,
        });
    }
    assert_eq!(cluster.scm.containers.replicas_of(container.id).len(), 1);

    cluster.scm.containers.update_replica(ContainerReplica {
        container: container.id,
        node: nodes[1],
        reported_state: ContainerState::Open,
        bytes_used: 512,
        key_count: 4,
        last_seen_ms: 0,
    });
    assert_eq!(cluster.scm.containers.replicas_of(container.id).len(), 2);

    cluster.scm.containers.remove_replica(container.id, &nodes[0]);
    cluster.scm.containers.remove_replica(container.id, &nodes[0]);
    assert_eq!(cluster.scm.containers.replicas_of(container.id).len(), 1);
}

#[test]
fn unknown_container_replica_is_ignored() {
    let cluster = cluster();
    let nodes = register_fleet(&cluster.scm, 1);
    cluster.scm.containers.update_replica(ContainerReplica {
        container: ContainerId::new(404),
        node: nodes[0],
        reported_state: ContainerState::Open,
        bytes_used: 0,
        key_count: 0,
        last_seen_ms: 0,
    });
    assert_eq!(cluster.scm.containers.replicas_of(ContainerId::new(404)).len(), 0);
}
