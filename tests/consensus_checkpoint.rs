mod common;

use common::{cluster, follower_cluster, open_pipeline, register_fleet, TestCluster};
use containor::config::ReplicationConfig;
use containor::consensus::{FailoverConfig, FailoverSchedule, PeerId};
use containor::ids::ContainerId;
use containor::ScmError;
use std::fs;
use std::time::Duration;

fn replicated() -> ReplicationConfig {
    ReplicationConfig::replicated(3)
}

/// Ships the leader's whole log to a follower replica and applies it there.
fn replicate_all(leader: &TestCluster, follower: &TestCluster) {
    let from = follower.scm.log().last_applied().index;
    let entries = leader.scm.log().entries_after(from, usize::MAX);
    for entry in entries {
        let position = follower.scm.log().append_replicated(entry).unwrap();
        follower.scm.log().commit_to(position.index).unwrap();
    }
}

fn table_bytes(cluster: &TestCluster, table: &str) -> Vec<u8> {
    cluster.scm.kv().flush().unwrap();
    fs::read(cluster.scm.storage().db_dir().join(format!("{table}.tab"))).unwrap()
}

#[test]
fn replicas_converge_to_byte_identical_tables() {
    let leader = cluster();
    let follower = follower_cluster();

    register_fleet(&leader.scm, 3);
    open_pipeline(&leader.scm, replicated());
    leader.scm.allocate_container(replicated(), "ns-svc").unwrap();
    leader.scm.allocate_container(replicated(), "ns-svc").unwrap();

    replicate_all(&leader, &follower);
    assert_eq!(
        leader.scm.log().last_applied(),
        follower.scm.log().last_applied()
    );
    for table in ["nodes", "pipelines", "containers", "meta"] {
        assert_eq!(
            table_bytes(&leader, table),
            table_bytes(&follower, table),
            "table `{table}` diverged"
        );
    }
}

#[test]
fn follower_submit_fails_over_to_hinted_leader() {
    let cluster = cluster();
    register_fleet(&cluster.scm, 3);
    open_pipeline(&cluster.scm, replicated());

    cluster.scm.yield_leadership(Some(PeerId::new("scm-2")));
    let err = cluster
        .scm
        .allocate_container(replicated(), "ns-svc")
        .unwrap_err();
    let ScmError::NotLeader { leader_hint } = &err else {
        panic!("expected NotLeader, got {err:?}");
    };
    assert_eq!(leader_hint.as_deref(), Some("scm-2"));

    // Client-side failover: the hint restarts the same-leader phase, and the
    // retry against the new leader succeeds.
    let mut schedule = FailoverSchedule::new(FailoverConfig::new(15, Duration::from_millis(1)));
    schedule.note_leader_hint();
    assert!(schedule.next().is_some());

    cluster.scm.assume_leadership(2).unwrap();
    let container = cluster
        .scm
        .allocate_container(replicated(), "ns-svc")
        .unwrap();
    assert_eq!(container.id, ContainerId::new(1));
    assert_eq!(cluster.scm.containers.count(), 1);
}

#[test]
fn dedup_key_survives_leadership_churn() {
    use containor::gateway::ContainerWriteMethod;
    use containor::wire::{
        decode_message, encode_message, AllocateContainerArgs, CommandKind, ContainerInfoMsg,
        ReplicationKindMsg,
    };

    let cluster = cluster();
    register_fleet(&cluster.scm, 3);
    let pipeline = open_pipeline(&cluster.scm, replicated());

    let gateway = containor::HaGateway::new(
        cluster.scm.log().clone(),
        cluster.clock.clone(),
        Duration::from_secs(5),
    );
    let args = AllocateContainerArgs {
        pipeline_id: pipeline.id.to_string(),
        owner: "ns-svc".to_string(),
        replication: ReplicationKindMsg::Replicated as i32,
        factor: 3,
    };
    let first_raw = gateway
        .invoke_with_dedup(
            CommandKind::Container,
            ContainerWriteMethod::Allocate as u32,
            encode_message(&args),
            "client-a",
            7,
        )
        .unwrap();
    let first: ContainerInfoMsg = decode_message(&first_raw).unwrap();

    cluster.scm.yield_leadership(Some(PeerId::new("scm-1")));
    cluster.scm.assume_leadership(2).unwrap();

    // The retry with the same dedup key returns the original allocation
    // instead of minting a second container.
    let second_raw = gateway
        .invoke_with_dedup(
            CommandKind::Container,
            ContainerWriteMethod::Allocate as u32,
            encode_message(&args),
            "client-a",
            7,
        )
        .unwrap();
    let second: ContainerInfoMsg = decode_message(&second_raw).unwrap();
    assert_eq!(first.container_id, second.container_id);
    assert_eq!(cluster.scm.containers.count(), 1);
}

#[test]
fn snapshot_install_brings_lagging_follower_current() {
    let leader = cluster();
    register_fleet(&leader.scm, 3);
    open_pipeline(&leader.scm, replicated());
    leader.scm.allocate_container(replicated(), "ns-svc").unwrap();

    // The leader compacts its log; shipping entries is no longer possible.
    let checkpoint = leader.scm.storage().checkpoints_dir().join("cp-1");
    let manifest = leader.scm.log().take_snapshot(&checkpoint).unwrap();
    assert!(leader.scm.log().entries_after(0, usize::MAX).is_empty());

    let follower = follower_cluster();
    let installed = follower.scm.log().install_snapshot(&checkpoint).unwrap();
    assert_eq!(installed, manifest);
    follower.scm.reload_managers().unwrap();
    follower.scm.revalidate_safe_mode();

    assert_eq!(follower.scm.nodes.registered_count(), 3);
    assert_eq!(follower.scm.containers.count(), 1);
    assert_eq!(follower.scm.pipelines.count(), 1);
    assert!(!follower.scm.safe_mode_status().in_safe_mode);
    assert_eq!(
        follower.scm.log().last_applied().index,
        leader.scm.log().last_applied().index
    );

    // The first post-install command applies cleanly on the follower.
    leader.scm.allocate_container(replicated(), "ns-svc").unwrap();
    replicate_all(&leader, &follower);
    assert_eq!(follower.scm.containers.count(), 2);
    for table in ["nodes", "pipelines", "containers", "meta"] {
        assert_eq!(table_bytes(&leader, table), table_bytes(&follower, table));
    }
}

#[test]
fn crash_replay_reproduces_the_same_container_id() {
    let cluster = cluster();
    register_fleet(&cluster.scm, 3);
    open_pipeline(&cluster.scm, replicated());
    let first = cluster.scm.allocate_container(replicated(), "ns-svc").unwrap();

    // Snapshot pins the durable state at the first allocation.
    let checkpoint = cluster.scm.storage().checkpoints_dir().join("cp-1");
    cluster.scm.log().take_snapshot(&checkpoint).unwrap();

    // A second allocation lands in the log but never reaches a KV flush.
    let second = cluster.scm.allocate_container(replicated(), "ns-svc").unwrap();
    assert_eq!(second.id, ContainerId::new(first.id.value() + 1));

    // Restart: replay from snapshot + log mints the identical id on the
    // identical pipeline, and the counter does not double-advance.
    let restarted = common::reopen(&cluster);
    let replayed = restarted.containers.container(second.id).unwrap();
    assert_eq!(replayed.pipeline, second.pipeline);
    assert_eq!(restarted.containers.count(), 2);
    let next = restarted.allocate_container(replicated(), "ns-svc").unwrap();
    assert_eq!(next.id, ContainerId::new(second.id.value() + 1));
}

#[test]
fn fatal_apply_failure_halts_instead_of_continuing() {
    let cluster = cluster();
    register_fleet(&cluster.scm, 3);
    open_pipeline(&cluster.scm, replicated());

    // Corrupt the envelope args so apply hits a metadata decode failure.
    let gateway = containor::HaGateway::new(
        cluster.scm.log().clone(),
        cluster.clock.clone(),
        Duration::from_secs(5),
    );
    let err = gateway
        .invoke(
            containor::wire::CommandKind::Container,
            containor::gateway::ContainerWriteMethod::Allocate as u32,
            vec![0xff, 0xff, 0xff],
        )
        .unwrap_err();
    assert!(err.is_fatal());
    assert!(cluster.scm.log().is_halted());
    let err = cluster
        .scm
        .allocate_container(replicated(), "ns-svc")
        .unwrap_err();
    assert!(matches!(err, ScmError::Internal(_)));
}
