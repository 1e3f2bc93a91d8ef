use super::quorum::{CommitTracker, PeerId, QuorumConfig};
use super::store::{LogEntry, LogMetadata, LogMetadataStore, LogStore, LogStoreError, TermIndex};
use crate::error::ScmError;
use crate::kv::{
    install_checkpoint, write_checkpoint, CheckpointManifest, CheckpointSigner, KvStore,
    META_LAST_APPLIED_INDEX, META_LAST_APPLIED_TERM,
};
use crate::wire::{decode_message, encode_message, CommandEnvelope, CommandKind};
use log::{error, info, warn};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A state manager's apply entry point. `execute` runs on the single apply
/// thread, strictly in index order, on every replica; it must not consult
/// clocks or randomness.
pub trait CommandExecutor: Send + Sync {
    fn execute(&self, envelope: &CommandEnvelope) -> Result<Vec<u8>, ScmError>;

    /// Flush in-memory state to the KV store ahead of a checkpoint.
    fn flush(&self) -> Result<(), ScmError> {
        Ok(())
    }
}

/// Dispatch table routing envelopes by their kind tag.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: RwLock<HashMap<i32, Arc<dyn CommandExecutor>>>,
}

impl ExecutorRegistry {
    pub fn register(&self, kind: CommandKind, executor: Arc<dyn CommandExecutor>) {
        self.executors.write().insert(kind as i32, executor);
    }

    fn get(&self, kind: i32) -> Option<Arc<dyn CommandExecutor>> {
        self.executors.read().get(&kind).cloned()
    }

    fn all(&self) -> Vec<Arc<dyn CommandExecutor>> {
        self.executors.read().values().cloned().collect()
    }
}

/// Replica role. Only the leader accepts submits; followers answer with the
/// current leader hint so clients can fail over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Leader { term: u64 },
    Follower { leader_hint: Option<PeerId> },
}

#[derive(Debug)]
struct ReplySlot {
    result: Mutex<Option<Result<Vec<u8>, ScmError>>>,
    ready: Condvar,
}

impl ReplySlot {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            result: Mutex::new(None),
            ready: Condvar::new(),
        })
    }

    fn complete(&self, result: Result<Vec<u8>, ScmError>) {
        let mut guard = self.result.lock();
        if guard.is_none() {
            *guard = Some(result);
        }
        self.ready.notify_all();
    }
}

/// Ticket for an in-flight submit. Resolves once the entry commits and
/// applies locally; expiry never cancels the underlying command.
#[derive(Debug, Clone)]
pub struct SubmitHandle {
    index: u64,
    slot: Arc<ReplySlot>,
}

impl SubmitHandle {
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn try_reply(&self) -> Option<Result<Vec<u8>, ScmError>> {
        self.slot.result.lock().clone()
    }

    pub fn wait(&self, timeout: Duration) -> Result<Vec<u8>, ScmError> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.slot.result.lock();
        loop {
            if let Some(result) = guard.clone() {
                return result;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ScmError::Timeout {
                    operation: "log submit",
                    elapsed_ms: timeout.as_millis() as u64,
                });
            }
            let _ = self.slot.ready.wait_for(&mut guard, remaining);
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReplicatedLogConfig {
    pub peer: PeerId,
    pub voters: Vec<PeerId>,
}

impl ReplicatedLogConfig {
    pub fn single(peer: impl Into<PeerId>) -> Self {
        let peer = peer.into();
        Self {
            voters: vec![peer.clone()],
            peer,
        }
    }
}

/// Ordered command replication with single-threaded apply.
///
/// One instance per replica. The leader appends and self-acks on submit;
/// peer acks (fed by the transport) advance the commit point. Committed
/// entries apply in strict index order under one apply mutex, and the reply
/// of each applied command resolves its [`SubmitHandle`].
pub struct ReplicatedLog {
    peer: PeerId,
    store: Mutex<LogStore>,
    metadata_store: LogMetadataStore,
    metadata: Mutex<LogMetadata>,
    tracker: Mutex<CommitTracker>,
    role: RwLock<Role>,
    executors: ExecutorRegistry,
    pending: Mutex<HashMap<u64, Arc<ReplySlot>>>,
    dedupe: Mutex<HashMap<(String, u64), Vec<u8>>>,
    apply_gate: Mutex<()>,
    kv: Arc<KvStore>,
    signer: CheckpointSigner,
    halted: AtomicBool,
}

impl ReplicatedLog {
    pub fn open(
        config: ReplicatedLogConfig,
        log_path: impl AsRef<Path>,
        metadata_path: impl AsRef<Path>,
        kv: Arc<KvStore>,
        signer: CheckpointSigner,
    ) -> Result<Self, ScmError> {
        let mut store = LogStore::open(log_path.as_ref().to_path_buf()).map_err(store_err)?;
        let metadata_store = LogMetadataStore::new(metadata_path.as_ref().to_path_buf());
        let mut metadata = metadata_store.load_or_default().map_err(store_err)?;
        store.align_floor(metadata.snapshot_term, metadata.snapshot_index);
        // The KV store is what apply progress refers to, and it only becomes
        // durable on flush. Reconcile downwards so a crash between applies
        // replays the unflushed suffix from the log.
        let kv_index = kv
            .meta_counter(META_LAST_APPLIED_INDEX)
            .map_err(|err| ScmError::Metadata(err.to_string()))?;
        let kv_term = kv
            .meta_counter(META_LAST_APPLIED_TERM)
            .map_err(|err| ScmError::Metadata(err.to_string()))?;
        if kv_index < metadata.last_applied_index {
            info!(
                "event=apply_progress_reconciled sidecar={} durable={}",
                metadata.last_applied_index, kv_index
            );
            metadata.last_applied_index = kv_index;
            metadata.last_applied_term = kv_term;
        }
        let mut tracker = CommitTracker::new(QuorumConfig::new(config.voters.len()));
        for voter in &config.voters {
            tracker.register_peer(voter.clone());
        }
        tracker.reset_to(metadata.last_applied_term, metadata.last_applied_index);
        Ok(Self {
            peer: config.peer,
            store: Mutex::new(store),
            metadata_store,
            metadata: Mutex::new(metadata),
            tracker: Mutex::new(tracker),
            role: RwLock::new(Role::Follower { leader_hint: None }),
            executors: ExecutorRegistry::default(),
            pending: Mutex::new(HashMap::new()),
            dedupe: Mutex::new(HashMap::new()),
            apply_gate: Mutex::new(()),
            kv,
            signer,
            halted: AtomicBool::new(false),
        })
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn register_executor(&self, kind: CommandKind, executor: Arc<dyn CommandExecutor>) {
        self.executors.register(kind, executor);
    }

    pub fn role(&self) -> Role {
        self.role.read().clone()
    }

    pub fn is_leader(&self) -> bool {
        matches!(*self.role.read(), Role::Leader { .. })
    }

    pub fn current_term(&self) -> u64 {
        self.metadata.lock().current_term
    }

    pub fn last_applied(&self) -> TermIndex {
        let metadata = self.metadata.lock();
        TermIndex {
            term: metadata.last_applied_term,
            index: metadata.last_applied_index,
        }
    }

    pub fn committed_index(&self) -> u64 {
        self.tracker.lock().committed_index()
    }

    pub fn last_log_index(&self) -> u64 {
        self.store.lock().last_index()
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Assumes leadership at `term`. The term must advance strictly.
    pub fn step_up(&self, term: u64) -> Result<(), ScmError> {
        let (last_term, last_index) = {
            let store = self.store.lock();
            (store.last_term(), store.last_index())
        };
        {
            let mut metadata = self.metadata.lock();
            if term < metadata.current_term {
                return Err(ScmError::Conflict {
                    what: "leader term",
                    id: term.to_string(),
                });
            }
            metadata.update_term(term);
            metadata.record_vote(self.peer.as_str());
            self.metadata_store.persist(&metadata).map_err(store_err)?;
        }
        {
            let metadata = self.metadata.lock();
            let mut tracker = self.tracker.lock();
            tracker.reset_to(metadata.last_applied_term, metadata.last_applied_index);
            let _ = tracker.record_ack(self.peer.clone(), last_term.max(term), last_index);
        }
        *self.role.write() = Role::Leader { term };
        info!("event=log_step_up peer={} term={term}", self.peer);
        Ok(())
    }

    /// Relinquishes leadership. Pending submits resolve `NotLeader` with the
    /// hint; their entries may still commit later, so callers must retry
    /// idempotently.
    pub fn step_down(&self, leader_hint: Option<PeerId>) {
        *self.role.write() = Role::Follower {
            leader_hint: leader_hint.clone(),
        };
        let hint = leader_hint.as_ref().map(|peer| peer.to_string());
        let drained: Vec<Arc<ReplySlot>> = self.pending.lock().drain().map(|(_, slot)| slot).collect();
        for slot in drained {
            slot.complete(Err(ScmError::NotLeader {
                leader_hint: hint.clone(),
            }));
        }
        info!("event=log_step_down peer={} hint={:?}", self.peer, hint);
    }

    /// Leader-only entry point for mutating commands.
    pub fn submit(&self, envelope: CommandEnvelope) -> Result<SubmitHandle, ScmError> {
        self.ensure_not_halted()?;
        let term = match self.role() {
            Role::Leader { term } => term,
            Role::Follower { leader_hint } => {
                return Err(ScmError::NotLeader {
                    leader_hint: leader_hint.map(|peer| peer.to_string()),
                })
            }
        };

        if !envelope.client_id.is_empty() {
            let dedupe_key = (envelope.client_id.clone(), envelope.sequence);
            if let Some(reply) = self.dedupe.lock().get(&dedupe_key).cloned() {
                let slot = ReplySlot::new();
                slot.complete(Ok(reply));
                return Ok(SubmitHandle { index: 0, slot });
            }
        }

        let index = {
            let mut store = self.store.lock();
            let index = store.last_index() + 1;
            store
                .append(LogEntry::new(term, index, encode_message(&envelope)))
                .map_err(|err| ScmError::Metadata(format!("log append failed: {err}")))?;
            index
        };

        let slot = ReplySlot::new();
        self.pending.lock().insert(index, slot.clone());

        {
            let mut tracker = self.tracker.lock();
            if let Err(err) = tracker.record_ack(self.peer.clone(), term, index) {
                warn!("event=log_self_ack_rejected peer={} error={err}", self.peer);
            }
            tracker.advance_commit(term);
        }
        self.apply_committed()?;

        Ok(SubmitHandle { index, slot })
    }

    /// Transport feedback: a follower durably replicated up to `index`.
    pub fn record_peer_ack(&self, peer: PeerId, term: u64, index: u64) -> Result<(), ScmError> {
        self.ensure_not_halted()?;
        let leader_term = match self.role() {
            Role::Leader { term } => term,
            Role::Follower { .. } => {
                warn!("event=log_peer_ack_ignored peer={peer} reason=not_leader");
                return Ok(());
            }
        };
        {
            let mut tracker = self.tracker.lock();
            tracker
                .record_ack(peer.clone(), term, index)
                .map_err(|err| ScmError::Conflict {
                    what: "replication ack",
                    id: format!("{peer}: {err}"),
                })?;
            tracker.advance_commit(leader_term);
        }
        self.apply_committed()
    }

    /// Follower-side ingestion of a leader-shipped entry.
    pub fn append_replicated(&self, entry: LogEntry) -> Result<TermIndex, ScmError> {
        self.ensure_not_halted()?;
        {
            let mut metadata = self.metadata.lock();
            metadata.update_term(entry.term);
            self.metadata_store.persist(&metadata).map_err(store_err)?;
        }
        let mut store = self.store.lock();
        store
            .append(entry)
            .map_err(|err| ScmError::Metadata(format!("replicated append failed: {err}")))?;
        Ok(TermIndex {
            term: store.last_term(),
            index: store.last_index(),
        })
    }

    /// Follower-side commit advance driven by the leader's commit index.
    pub fn commit_to(&self, index: u64) -> Result<(), ScmError> {
        self.ensure_not_halted()?;
        let (last_term, last_index) = {
            let store = self.store.lock();
            (store.last_term(), store.last_index())
        };
        let clamped = index.min(last_index);
        {
            let mut tracker = self.tracker.lock();
            let committed = tracker.committed_index();
            // Followers trust the leader's commit point directly.
            tracker.reset_to(last_term, clamped.max(committed));
        }
        self.apply_committed()
    }

    /// Applies every committed-but-unapplied entry in index order. Exactly
    /// one thread runs the loop at a time.
    fn apply_committed(&self) -> Result<(), ScmError> {
        let _gate = self.apply_gate.lock();
        let mut progressed = false;
        loop {
            let committed = self.tracker.lock().committed_index();
            let next = self.metadata.lock().last_applied_index + 1;
            if next > committed {
                break;
            }
            let entry = {
                let store = self.store.lock();
                store.entry_at(next).cloned()
            };
            let entry = match entry {
                Some(entry) => entry,
                None => {
                    return self.halt(ScmError::Internal(format!(
                        "committed entry {next} missing from the local log"
                    )))
                }
            };

            let envelope: CommandEnvelope = match decode_message(&entry.payload) {
                Ok(envelope) => envelope,
                Err(err) => return self.halt(err),
            };

            let result = self.dispatch(&envelope);
            if let Err(err) = &result {
                if err.is_fatal() {
                    self.complete(entry.index, Err(err.clone()));
                    return self.halt(err.clone());
                }
            }

            {
                let mut metadata = self.metadata.lock();
                metadata.note_apply(entry.term, entry.index);
            }
            if let Err(err) = self
                .kv
                .set_meta_counter(META_LAST_APPLIED_INDEX, entry.index)
                .and_then(|_| self.kv.set_meta_counter(META_LAST_APPLIED_TERM, entry.term))
            {
                return self.halt(ScmError::Metadata(format!(
                    "recording apply progress failed: {err}"
                )));
            }

            if !envelope.client_id.is_empty() {
                if let Ok(reply) = &result {
                    self.dedupe
                        .lock()
                        .insert((envelope.client_id.clone(), envelope.sequence), reply.clone());
                }
            }
            self.complete(entry.index, result);
            progressed = true;
        }
        if progressed {
            let metadata = self.metadata.lock().clone();
            self.metadata_store.persist(&metadata).map_err(store_err)?;
        }
        Ok(())
    }

    fn dispatch(&self, envelope: &CommandEnvelope) -> Result<Vec<u8>, ScmError> {
        match self.executors.get(envelope.kind) {
            Some(executor) => executor.execute(envelope),
            None => Err(ScmError::Metadata(format!(
                "no executor for command kind {}",
                envelope.kind
            ))),
        }
    }

    fn complete(&self, index: u64, result: Result<Vec<u8>, ScmError>) {
        if let Some(slot) = self.pending.lock().remove(&index) {
            slot.complete(result);
        }
    }

    fn halt(&self, err: ScmError) -> Result<(), ScmError> {
        self.halted.store(true, Ordering::SeqCst);
        error!("event=apply_halted peer={} error={err}", self.peer);
        let metadata = self.metadata.lock().clone();
        if let Err(persist_err) = self.metadata_store.persist(&metadata) {
            error!("event=apply_halt_flush_failed error={persist_err}");
        }
        Err(err)
    }

    fn ensure_not_halted(&self) -> Result<(), ScmError> {
        if self.is_halted() {
            return Err(ScmError::Internal(
                "apply pipeline halted; replica must restart".to_string(),
            ));
        }
        Ok(())
    }

    /// Local replay after restart: applies everything the durable log holds
    /// beyond the recorded apply progress.
    pub fn recover(&self) -> Result<(), ScmError> {
        let last = self.store.lock().last_index();
        if last == 0 {
            return Ok(());
        }
        let term = self.store.lock().last_term();
        {
            let mut tracker = self.tracker.lock();
            tracker.reset_to(term, last);
        }
        self.apply_committed()
    }

    /// Flushes every state manager, checkpoints the KV store at the current
    /// apply position, then truncates the covered log prefix. The snapshot
    /// index never moves backwards.
    pub fn take_snapshot(&self, dir: &Path) -> Result<CheckpointManifest, ScmError> {
        self.ensure_not_halted()?;
        let _gate = self.apply_gate.lock();
        let (term, index, floor) = {
            let metadata = self.metadata.lock();
            (
                metadata.last_applied_term,
                metadata.last_applied_index,
                metadata.snapshot_index,
            )
        };
        if index < floor {
            return Err(ScmError::Internal(format!(
                "snapshot regression: applied {index} below floor {floor}"
            )));
        }
        for executor in self.executors.all() {
            executor.flush()?;
        }
        let manifest = write_checkpoint(&self.kv, dir, term, index, &self.signer)
            .map_err(|err| ScmError::Metadata(format!("checkpoint failed: {err}")))?;
        {
            let mut metadata = self.metadata.lock();
            metadata.snapshot_term = term;
            metadata.snapshot_index = index;
            self.metadata_store.persist(&metadata).map_err(store_err)?;
        }
        self.store
            .lock()
            .truncate_through(term, index)
            .map_err(store_err)?;
        info!(
            "event=snapshot_taken peer={} term={term} index={index}",
            self.peer
        );
        Ok(manifest)
    }

    /// Replaces local state with a leader-provided checkpoint and resumes
    /// applying at `index + 1`. The caller must rebuild in-memory manager
    /// state afterwards.
    pub fn install_snapshot(&self, dir: &Path) -> Result<CheckpointManifest, ScmError> {
        self.ensure_not_halted()?;
        let _gate = self.apply_gate.lock();
        let floor = self.metadata.lock().snapshot_index;
        let manifest = install_checkpoint(&self.kv, dir, &self.signer)
            .map_err(|err| ScmError::Metadata(format!("snapshot install failed: {err}")))?;
        if manifest.index < floor {
            return Err(ScmError::Internal(format!(
                "snapshot regression: incoming {} below floor {floor}",
                manifest.index
            )));
        }
        {
            let mut metadata = self.metadata.lock();
            metadata.update_term(manifest.term);
            metadata.last_applied_term = manifest.term;
            metadata.last_applied_index = manifest.index;
            metadata.snapshot_term = manifest.term;
            metadata.snapshot_index = manifest.index;
            self.metadata_store.persist(&metadata).map_err(store_err)?;
        }
        self.store
            .lock()
            .reset_to(manifest.term, manifest.index)
            .map_err(store_err)?;
        self.tracker
            .lock()
            .reset_to(manifest.term, manifest.index);
        self.dedupe.lock().clear();
        let drained: Vec<Arc<ReplySlot>> = self.pending.lock().drain().map(|(_, slot)| slot).collect();
        for slot in drained {
            slot.complete(Err(ScmError::Conflict {
                what: "log entry",
                id: "superseded by snapshot install".to_string(),
            }));
        }
        info!(
            "event=snapshot_installed peer={} term={} index={}",
            self.peer, manifest.term, manifest.index
        );
        Ok(manifest)
    }

    /// Entries after `from` (exclusive), for shipping to a follower.
    pub fn entries_after(&self, from: u64, limit: usize) -> Vec<LogEntry> {
        let store = self.store.lock();
        let mut entries = Vec::new();
        let mut index = from + 1;
        while entries.len() < limit {
            match store.entry_at(index) {
                Some(entry) => entries.push(entry.clone()),
                None => break,
            }
            index += 1;
        }
        entries
    }
}

fn store_err(err: LogStoreError) -> ScmError {
    ScmError::Metadata(err.to_string())
}
