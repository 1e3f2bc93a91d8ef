//! Crate-wide error taxonomy.
//!
//! Every state-manager error is returned as a value; nothing is thrown across
//! the apply boundary. Only the fatal kinds justify terminating the replica,
//! and the decision to exit belongs to the embedding process, keyed off
//! [`ScmError::is_fatal`].

use thiserror::Error;

/// Discriminated error kinds surfaced by the managers and the HA layer.
#[derive(Debug, Clone, Error)]
pub enum ScmError {
    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("{what} already exists: {id}")]
    AlreadyExists { what: &'static str, id: String },

    #[error("invalid lifecycle transition: {detail}")]
    InvalidStateTransition { detail: String },

    #[error("insufficient datanodes: needed {needed}, usable {available}")]
    InsufficientDatanodes { needed: usize, available: usize },

    #[error("not the leader{}", leader_display(.leader_hint))]
    NotLeader { leader_hint: Option<String> },

    #[error("operation timed out after {elapsed_ms}ms: {operation}")]
    Timeout { operation: &'static str, elapsed_ms: u64 },

    #[error("conflicting concurrent mutation on {what} {id}")]
    Conflict { what: &'static str, id: String },

    /// Unrecoverable failure inside the apply path. The replica must stop
    /// applying and restart from the log or a snapshot.
    #[error("internal error: {0}")]
    Internal(String),

    /// Metadata store corruption or write failure during apply. Fatal.
    #[error("metadata error: {0}")]
    Metadata(String),

    #[error("security bootstrap failed: {0}")]
    SecurityInit(String),
}

impl ScmError {
    pub fn not_found(what: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            what,
            id: id.to_string(),
        }
    }

    pub fn already_exists(what: &'static str, id: impl ToString) -> Self {
        Self::AlreadyExists {
            what,
            id: id.to_string(),
        }
    }

    pub fn invalid_transition(detail: impl Into<String>) -> Self {
        Self::InvalidStateTransition {
            detail: detail.into(),
        }
    }

    /// True for the kinds that must never be survived by the apply loop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Internal(_) | Self::Metadata(_))
    }

    /// Admin-CLI exit code mapping.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Timeout { .. } => 2,
            Self::NotLeader { .. } => 3,
            Self::Internal(_) | Self::Metadata(_) | Self::SecurityInit(_) => 4,
            _ => 1,
        }
    }

    /// Stable numeric code carried in RPC replies.
    pub fn result_code(&self) -> u32 {
        match self {
            Self::NotFound { .. } => 1,
            Self::AlreadyExists { .. } => 2,
            Self::InvalidStateTransition { .. } => 3,
            Self::InsufficientDatanodes { .. } => 4,
            Self::NotLeader { .. } => 5,
            Self::Timeout { .. } => 6,
            Self::Conflict { .. } => 7,
            Self::Internal(_) => 8,
            Self::Metadata(_) => 9,
            Self::SecurityInit(_) => 10,
        }
    }
}

fn leader_display(hint: &Option<String>) -> String {
    match hint {
        Some(leader) => format!(" (suggested leader: {leader})"),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_kinds_are_internal_and_metadata() {
        assert!(ScmError::Internal("disk full".into()).is_fatal());
        assert!(ScmError::Metadata("corrupt table".into()).is_fatal());
        assert!(!ScmError::not_found("container", "#7").is_fatal());
        assert!(!ScmError::NotLeader { leader_hint: None }.is_fatal());
    }

    #[test]
    fn exit_codes_follow_cli_contract() {
        assert_eq!(
            ScmError::InvalidStateTransition {
                detail: "x".into()
            }
            .exit_code(),
            1
        );
        assert_eq!(
            ScmError::Timeout {
                operation: "submit",
                elapsed_ms: 10
            }
            .exit_code(),
            2
        );
        assert_eq!(ScmError::NotLeader { leader_hint: None }.exit_code(), 3);
        assert_eq!(ScmError::Internal("x".into()).exit_code(), 4);
    }

    #[test]
    fn not_leader_renders_hint() {
        let err = ScmError::NotLeader {
            leader_hint: Some("scm-2".into()),
        };
        assert!(err.to_string().contains("scm-2"));
    }
}
