mod common;

use common::{cluster, open_pipeline, register_fleet};
use containor::bootstrap::{
    begin_layout_upgrade, initialize_or_load, ScmStorage, CURRENT_LAYOUT_VERSION,
};
use containor::config::ReplicationConfig;
use tempfile::tempdir;

#[test]
fn fresh_install_stamps_identity() {
    let dir = tempdir().unwrap();
    let storage = ScmStorage::new(dir.path());
    let version = initialize_or_load(&storage, 42_000).unwrap();
    assert_eq!(version.node_type, "SCM");
    assert_eq!(version.layout_version, CURRENT_LAYOUT_VERSION);
    assert_eq!(version.created_at_ms, 42_000);
    assert!(version.cluster_id.to_string().starts_with("CID-"));
    assert!(storage.version_file().exists());

    // Identity is sticky across restarts.
    let again = initialize_or_load(&storage, 99_000).unwrap();
    assert_eq!(again, version);
}

#[test]
fn interrupted_upgrade_refuses_startup() {
    let dir = tempdir().unwrap();
    let storage = ScmStorage::new(dir.path());
    let mut version = initialize_or_load(&storage, 1_000).unwrap();
    version.layout_version = CURRENT_LAYOUT_VERSION - 1;
    version.persist(&storage.version_file()).unwrap();
    begin_layout_upgrade(&storage, &mut version, CURRENT_LAYOUT_VERSION).unwrap();

    let err = initialize_or_load(&storage, 2_000).unwrap_err();
    let message = err.to_string();
    assert!(message.contains("interrupted layout upgrade"));
}

#[test]
fn scm_restart_restores_cluster_state() {
    let cluster = cluster();
    let nodes = register_fleet(&cluster.scm, 3);
    let pipeline = open_pipeline(&cluster.scm, ReplicationConfig::replicated(3));
    let container = cluster
        .scm
        .allocate_container(ReplicationConfig::replicated(3), "ns-svc")
        .unwrap();
    let cluster_id = cluster.scm.version().cluster_id.clone();

    let restarted = common::reopen(&cluster);
    assert_eq!(restarted.version().cluster_id, cluster_id);
    assert_eq!(restarted.nodes.registered_count(), 3);
    for node in &nodes {
        assert!(restarted.nodes.is_node_registered(node));
    }
    let reloaded_pipeline = restarted.pipelines.pipeline(&pipeline.id).unwrap();
    assert_eq!(reloaded_pipeline.members, pipeline.members);
    assert_eq!(reloaded_pipeline.member_hash, pipeline.member_hash);
    let reloaded_container = restarted.containers.container(container.id).unwrap();
    assert_eq!(reloaded_container, container);
}

#[test]
fn storage_layout_paths_nest_under_node_type() {
    let storage = ScmStorage::new("/var/lib/object-store");
    assert!(storage.db_dir().ends_with("scm/db"));
    assert!(storage.checkpoints_dir().ends_with("scm/checkpoints"));
    assert!(storage.version_file().ends_with("VERSION"));
}
