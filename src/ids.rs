//! Identifier newtypes shared across the managers.
//!
//! Identifiers are the only thing that crosses component boundaries or the
//! replicated log; no manager ever hands out a reference to another manager's
//! records.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Opaque 128-bit datanode identifier, assigned on first registration and
/// persisted by the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(Uuid);

impl NodeId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for NodeId {
    type Err = IdParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(value).map_err(|_| {
            IdParseError::Malformed {
                kind: "node id",
                value: value.to_string(),
            }
        })?))
    }
}

/// Random 128-bit pipeline identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PipelineId(Uuid);

impl PipelineId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for PipelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for PipelineId {
    type Err = IdParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(value).map_err(|_| {
            IdParseError::Malformed {
                kind: "pipeline id",
                value: value.to_string(),
            }
        })?))
    }
}

/// Monotonically increasing 64-bit container identifier, unique across the
/// cluster lifetime. Allocated from the replicated counter in the `meta`
/// table, never from a local source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerId(u64);

impl ContainerId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Cluster identifier rendered as `CID-<uuid-v4>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterId(Uuid);

impl ClusterId {
    pub const PREFIX: &'static str = "CID-";

    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", Self::PREFIX, self.0)
    }
}

impl FromStr for ClusterId {
    type Err = IdParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let raw = value
            .strip_prefix(Self::PREFIX)
            .ok_or_else(|| IdParseError::MissingPrefix {
                prefix: Self::PREFIX,
                value: value.to_string(),
            })?;
        Ok(Self(Uuid::parse_str(raw).map_err(|_| {
            IdParseError::Malformed {
                kind: "cluster id",
                value: value.to_string(),
            }
        })?))
    }
}

/// Identifier of a single SCM replica within the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScmId(Uuid);

impl ScmId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ScmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ScmId {
    type Err = IdParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(value).map_err(|_| {
            IdParseError::Malformed {
                kind: "scm id",
                value: value.to_string(),
            }
        })?))
    }
}

/// Stable hash over a sorted member set, used to detect "same nodes" pipeline
/// rebuilds. First eight bytes of SHA-256 over the sorted UUID bytes, so the
/// value is identical on every replica and across restarts.
pub fn member_set_hash(members: &[NodeId]) -> u64 {
    let mut sorted: Vec<&NodeId> = members.iter().collect();
    sorted.sort();
    let mut hasher = Sha256::new();
    for member in sorted {
        hasher.update(member.as_bytes());
    }
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

#[derive(Debug, Error)]
pub enum IdParseError {
    #[error("{kind} `{value}` is not a valid uuid")]
    Malformed { kind: &'static str, value: String },

    #[error("expected prefix `{prefix}` in `{value}`")]
    MissingPrefix { prefix: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_id_round_trips_with_prefix() {
        let id = ClusterId::random();
        let rendered = id.to_string();
        assert!(rendered.starts_with("CID-"));
        let parsed: ClusterId = rendered.parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn cluster_id_rejects_missing_prefix() {
        let err = "6ba7b810-9dad-11d1-80b4-00c04fd430c8"
            .parse::<ClusterId>()
            .unwrap_err();
        assert!(matches!(err, IdParseError::MissingPrefix { .. }));
    }

    #[test]
    fn member_set_hash_ignores_order() {
        let a = NodeId::random();
        let b = NodeId::random();
        let c = NodeId::random();
        assert_eq!(member_set_hash(&[a, b, c]), member_set_hash(&[c, a, b]));
    }

    #[test]
    fn member_set_hash_distinguishes_sets() {
        let a = NodeId::random();
        let b = NodeId::random();
        let c = NodeId::random();
        let d = NodeId::random();
        assert_ne!(member_set_hash(&[a, b, c]), member_set_hash(&[a, b, d]));
    }
}
