//! On-disk identity of an SCM replica: the `VERSION` file and the storage
//! layout rooted under it.

use crate::ids::{ClusterId, ScmId};
use log::info;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// On-disk and wire format generation. Bumps ride the dedicated upgrade
/// protocol that stamps `upgradingToLayoutVersion` first.
pub const CURRENT_LAYOUT_VERSION: u32 = 3;

pub const VERSION_FILE_NAME: &str = "VERSION";
pub const SCM_NODE_TYPE: &str = "SCM";

const KEY_NODE_TYPE: &str = "nodeType";
const KEY_CLUSTER_ID: &str = "clusterID";
const KEY_SCM_ID: &str = "scmID";
const KEY_CREATION_TIME: &str = "cTime";
const KEY_LAYOUT_VERSION: &str = "layoutVersion";
const KEY_UPGRADING_TO: &str = "upgradingToLayoutVersion";

/// Parsed `VERSION` file: plain-text `key=value` lines at the storage root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionFile {
    pub node_type: String,
    pub cluster_id: ClusterId,
    pub scm_id: ScmId,
    pub created_at_ms: u64,
    pub layout_version: u32,
    pub upgrading_to_layout_version: Option<u32>,
}

impl VersionFile {
    pub fn fresh(now_ms: u64) -> Self {
        Self {
            node_type: SCM_NODE_TYPE.to_string(),
            cluster_id: ClusterId::random(),
            scm_id: ScmId::random(),
            created_at_ms: now_ms,
            layout_version: CURRENT_LAYOUT_VERSION,
            upgrading_to_layout_version: None,
        }
    }

    fn render(&self) -> String {
        let mut text = String::new();
        text.push_str(&format!("{KEY_NODE_TYPE}={}\n", self.node_type));
        text.push_str(&format!("{KEY_CLUSTER_ID}={}\n", self.cluster_id));
        text.push_str(&format!("{KEY_SCM_ID}={}\n", self.scm_id));
        text.push_str(&format!("{KEY_CREATION_TIME}={}\n", self.created_at_ms));
        text.push_str(&format!("{KEY_LAYOUT_VERSION}={}\n", self.layout_version));
        if let Some(upgrading_to) = self.upgrading_to_layout_version {
            text.push_str(&format!("{KEY_UPGRADING_TO}={upgrading_to}\n"));
        }
        text
    }

    fn parse(text: &str) -> Result<Self, BootstrapError> {
        let mut properties = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                BootstrapError::Malformed {
                    detail: format!("line without `=`: {line}"),
                }
            })?;
            properties.insert(key.trim().to_string(), value.trim().to_string());
        }
        let fetch = |key: &str| {
            properties
                .get(key)
                .cloned()
                .ok_or_else(|| BootstrapError::Malformed {
                    detail: format!("missing property `{key}`"),
                })
        };
        let cluster_id: ClusterId =
            fetch(KEY_CLUSTER_ID)?
                .parse()
                .map_err(|_| BootstrapError::Malformed {
                    detail: "unparseable clusterID".to_string(),
                })?;
        let scm_id: ScmId = fetch(KEY_SCM_ID)?
            .parse()
            .map_err(|_| BootstrapError::Malformed {
                detail: "unparseable scmID".to_string(),
            })?;
        let created_at_ms =
            fetch(KEY_CREATION_TIME)?
                .parse()
                .map_err(|_| BootstrapError::Malformed {
                    detail: "unparseable cTime".to_string(),
                })?;
        let layout_version =
            fetch(KEY_LAYOUT_VERSION)?
                .parse()
                .map_err(|_| BootstrapError::Malformed {
                    detail: "unparseable layoutVersion".to_string(),
                })?;
        let upgrading_to_layout_version = match properties.get(KEY_UPGRADING_TO) {
            Some(raw) => Some(raw.parse().map_err(|_| BootstrapError::Malformed {
                detail: "unparseable upgradingToLayoutVersion".to_string(),
            })?),
            None => None,
        };
        Ok(Self {
            node_type: fetch(KEY_NODE_TYPE)?,
            cluster_id,
            scm_id,
            created_at_ms,
            layout_version,
            upgrading_to_layout_version,
        })
    }

    pub fn load(path: &Path) -> Result<Option<Self>, BootstrapError> {
        match fs::read_to_string(path) {
            Ok(text) => Ok(Some(Self::parse(&text)?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(BootstrapError::Io(err)),
        }
    }

    pub fn persist(&self, path: &Path) -> Result<(), BootstrapError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(self.render().as_bytes())?;
        file.sync_all()?;
        fs::rename(tmp, path)?;
        Ok(())
    }
}

/// Paths under one SCM storage root. The KV store lives in a per-node-type
/// sibling directory next to the `VERSION` file.
#[derive(Debug, Clone)]
pub struct ScmStorage {
    root: PathBuf,
}

impl ScmStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn version_file(&self) -> PathBuf {
        self.root.join(VERSION_FILE_NAME)
    }

    pub fn db_dir(&self) -> PathBuf {
        self.root.join("scm").join("db")
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.root.join("scm").join("checkpoints")
    }

    pub fn log_file(&self) -> PathBuf {
        self.root.join("scm").join("command.log")
    }

    pub fn log_metadata_file(&self) -> PathBuf {
        self.root.join("scm").join("log_metadata.json")
    }
}

/// Loads the replica identity, initializing a fresh install. A `VERSION`
/// file still carrying the upgrade marker means the process died mid-upgrade
/// and needs operator recovery, not a silent restart.
pub fn initialize_or_load(
    storage: &ScmStorage,
    now_ms: u64,
) -> Result<VersionFile, BootstrapError> {
    let path = storage.version_file();
    match VersionFile::load(&path)? {
        None => {
            let fresh = VersionFile::fresh(now_ms);
            fresh.persist(&path)?;
            info!(
                "event=storage_initialized cluster={} scm={} layout={}",
                fresh.cluster_id, fresh.scm_id, fresh.layout_version
            );
            Ok(fresh)
        }
        Some(existing) => {
            if existing.node_type != SCM_NODE_TYPE {
                return Err(BootstrapError::WrongNodeType {
                    expected: SCM_NODE_TYPE,
                    observed: existing.node_type,
                });
            }
            if let Some(upgrading_to) = existing.upgrading_to_layout_version {
                return Err(BootstrapError::UpgradeInProgress {
                    from: existing.layout_version,
                    to: upgrading_to,
                });
            }
            if existing.layout_version > CURRENT_LAYOUT_VERSION {
                return Err(BootstrapError::LayoutTooNew {
                    on_disk: existing.layout_version,
                    supported: CURRENT_LAYOUT_VERSION,
                });
            }
            info!(
                "event=storage_loaded cluster={} scm={} layout={}",
                existing.cluster_id, existing.scm_id, existing.layout_version
            );
            Ok(existing)
        }
    }
}

/// Stamps the upgrade marker before any layout mutation starts.
pub fn begin_layout_upgrade(
    storage: &ScmStorage,
    version: &mut VersionFile,
    target: u32,
) -> Result<(), BootstrapError> {
    if target <= version.layout_version {
        return Err(BootstrapError::Malformed {
            detail: format!(
                "upgrade target {target} not beyond current layout {}",
                version.layout_version
            ),
        });
    }
    version.upgrading_to_layout_version = Some(target);
    version.persist(&storage.version_file())
}

/// Clears the marker and commits the new layout version.
pub fn finish_layout_upgrade(
    storage: &ScmStorage,
    version: &mut VersionFile,
) -> Result<(), BootstrapError> {
    let Some(target) = version.upgrading_to_layout_version.take() else {
        return Err(BootstrapError::Malformed {
            detail: "no upgrade in progress".to_string(),
        });
    };
    version.layout_version = target;
    version.persist(&storage.version_file())
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed VERSION file: {detail}")]
    Malformed { detail: String },

    #[error("VERSION file belongs to node type `{observed}`, expected `{expected}`")]
    WrongNodeType {
        expected: &'static str,
        observed: String,
    },

    #[error(
        "interrupted layout upgrade from {from} to {to}; finish or roll back the upgrade before starting"
    )]
    UpgradeInProgress { from: u32, to: u32 },

    #[error("on-disk layout {on_disk} is newer than supported {supported}")]
    LayoutTooNew { on_disk: u32, supported: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn fresh_install_initializes_and_reloads() {
        let dir = tempdir().unwrap();
        let storage = ScmStorage::new(dir.path());
        let created = initialize_or_load(&storage, 1_000).unwrap();
        assert_eq!(created.node_type, SCM_NODE_TYPE);
        assert_eq!(created.layout_version, CURRENT_LAYOUT_VERSION);
        assert!(created.cluster_id.to_string().starts_with("CID-"));

        let reloaded = initialize_or_load(&storage, 2_000).unwrap();
        assert_eq!(reloaded, created);
    }

    #[test]
    fn upgrade_marker_aborts_startup() {
        let dir = tempdir().unwrap();
        let storage = ScmStorage::new(dir.path());
        let mut version = initialize_or_load(&storage, 1_000).unwrap();
        version.layout_version = CURRENT_LAYOUT_VERSION - 1;
        version.persist(&storage.version_file()).unwrap();
        begin_layout_upgrade(&storage, &mut version, CURRENT_LAYOUT_VERSION).unwrap();

        let err = initialize_or_load(&storage, 2_000).unwrap_err();
        assert!(matches!(
            err,
            BootstrapError::UpgradeInProgress {
                to,
                ..
            } if to == CURRENT_LAYOUT_VERSION
        ));
    }

    #[test]
    fn finishing_upgrade_clears_marker() {
        let dir = tempdir().unwrap();
        let storage = ScmStorage::new(dir.path());
        let mut version = initialize_or_load(&storage, 1_000).unwrap();
        version.layout_version = CURRENT_LAYOUT_VERSION - 1;
        begin_layout_upgrade(&storage, &mut version, CURRENT_LAYOUT_VERSION).unwrap();
        finish_layout_upgrade(&storage, &mut version).unwrap();
        assert_eq!(version.layout_version, CURRENT_LAYOUT_VERSION);

        let reloaded = initialize_or_load(&storage, 2_000).unwrap();
        assert_eq!(reloaded.layout_version, CURRENT_LAYOUT_VERSION);
        assert_eq!(reloaded.upgrading_to_layout_version, None);
    }

    #[test]
    fn version_file_round_trips_textually() {
        let original = VersionFile::fresh(123_456);
        let rendered = original.render();
        let parsed = VersionFile::parse(&rendered).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn malformed_lines_are_rejected() {
        let err = VersionFile::parse("nodeType SCM").unwrap_err();
        assert!(matches!(err, BootstrapError::Malformed { .. }));
    }
}
