//! HA invocation gateway.
//!
//! Read methods hit the local state managers directly. Write methods are
//! serialized into a [`CommandEnvelope`], stamped with the leader clock, and
//! funneled through the replicated log; the managers' apply entry points run
//! on every replica and never consult clock or randomness themselves.

use crate::consensus::{ReplicatedLog, SubmitHandle};
use crate::error::ScmError;
use crate::wire::{CommandEnvelope, CommandKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Clock abstraction so tests can pin apply-time stamps.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Deterministic clock for tests; advances only when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn at(now_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(now_ms),
        }
    }

    pub fn advance(&self, delta_ms: u64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }

    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Per-manager write-method identifiers. Stable: they are serialized into
/// the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum NodeWriteMethod {
    Register = 1,
    Remove = 2,
}

impl NodeWriteMethod {
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Register),
            2 => Some(Self::Remove),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PipelineWriteMethod {
    Create = 1,
    UpdateState = 2,
    Remove = 3,
}

impl PipelineWriteMethod {
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Create),
            2 => Some(Self::UpdateState),
            3 => Some(Self::Remove),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ContainerWriteMethod {
    Allocate = 1,
    ApplyEvent = 2,
}

impl ContainerWriteMethod {
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Allocate),
            2 => Some(Self::ApplyEvent),
            _ => None,
        }
    }
}

/// The single choke point for mutating calls.
#[derive(Clone)]
pub struct HaGateway {
    log: Arc<ReplicatedLog>,
    clock: Arc<dyn Clock>,
    submit_timeout: Duration,
}

impl HaGateway {
    pub fn new(log: Arc<ReplicatedLog>, clock: Arc<dyn Clock>, submit_timeout: Duration) -> Self {
        Self {
            log,
            clock,
            submit_timeout,
        }
    }

    pub fn log(&self) -> &Arc<ReplicatedLog> {
        &self.log
    }

    pub fn is_leader(&self) -> bool {
        self.log.is_leader()
    }

    pub fn current_term(&self) -> u64 {
        self.log.current_term()
    }

    /// Leader clock value stamped into envelopes. Exposed so submit-time
    /// code (id generation, creation timestamps) draws from the same source.
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Serializes and submits a write, blocking until the log applies it or
    /// the deadline passes. On expiry the command may still apply later;
    /// write methods must therefore be idempotent or carry a dedup key.
    pub fn invoke(&self, kind: CommandKind, method: u32, args: Vec<u8>) -> Result<Vec<u8>, ScmError> {
        self.invoke_with_dedup(kind, method, args, "", 0)
    }

    pub fn invoke_with_dedup(
        &self,
        kind: CommandKind,
        method: u32,
        args: Vec<u8>,
        client_id: &str,
        sequence: u64,
    ) -> Result<Vec<u8>, ScmError> {
        let handle = self.submit(kind, method, args, client_id, sequence)?;
        handle.wait(self.submit_timeout)
    }

    /// Non-blocking variant for callers that multiplex waits.
    pub fn submit(
        &self,
        kind: CommandKind,
        method: u32,
        args: Vec<u8>,
        client_id: &str,
        sequence: u64,
    ) -> Result<SubmitHandle, ScmError> {
        let envelope = CommandEnvelope {
            kind: kind as i32,
            method,
            args,
            stamped_at_ms: self.clock.now_ms(),
            client_id: client_id.to_string(),
            sequence,
        };
        self.log.submit(envelope)
    }
}
