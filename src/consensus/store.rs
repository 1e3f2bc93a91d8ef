use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Persistent per-replica log state: the node's term, vote, apply progress,
/// and the floor established by the last snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LogMetadata {
    pub current_term: u64,
    pub voted_for: Option<String>,
    pub last_applied_index: u64,
    pub last_applied_term: u64,
    pub snapshot_index: u64,
    pub snapshot_term: u64,
}

impl LogMetadata {
    pub fn update_term(&mut self, term: u64) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
        }
    }

    pub fn record_vote(&mut self, candidate: impl Into<String>) {
        self.voted_for = Some(candidate.into());
    }

    pub fn note_apply(&mut self, term: u64, index: u64) {
        if index > self.last_applied_index {
            self.last_applied_index = index;
            self.last_applied_term = term;
        }
    }
}

/// JSON-backed metadata sidecar persisted with the atomic rename dance.
#[derive(Debug, Clone)]
pub struct LogMetadataStore {
    path: PathBuf,
}

impl LogMetadataStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load_or_default(&self) -> Result<LogMetadata, LogStoreError> {
        match fs::read(&self.path) {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(LogMetadata::default()),
            Err(err) => Err(LogStoreError::Io(err)),
        }
    }

    pub fn persist(&self, metadata: &LogMetadata) -> Result<(), LogStoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(&serde_json::to_vec_pretty(metadata)?)?;
        file.sync_all()?;
        fs::rename(tmp, &self.path)?;
        Ok(())
    }
}

/// One committed-or-pending log record. The payload is opaque here; the
/// dispatcher decodes it at apply time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub payload: Vec<u8>,
}

impl LogEntry {
    pub fn new(term: u64, index: u64, payload: Vec<u8>) -> Self {
        Self {
            term,
            index,
            payload,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermIndex {
    pub term: u64,
    pub index: u64,
}

/// Append-only log file, one JSON record per line, fsynced per append.
/// Indexes are dense and start after the snapshot floor.
#[derive(Debug)]
pub struct LogStore {
    path: PathBuf,
    entries: Vec<LogEntry>,
    /// Index of the last entry discarded by snapshot truncation.
    floor: TermIndex,
}

impl LogStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LogStoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let entries = Self::load_entries(&path)?;
        let floor = TermIndex { term: 0, index: 0 };
        let mut store = Self {
            path,
            entries,
            floor,
        };
        if let Some(first) = store.entries.first() {
            store.floor = TermIndex {
                term: 0,
                index: first.index.saturating_sub(1),
            };
        }
        Ok(store)
    }

    fn load_entries(path: &Path) -> Result<Vec<LogEntry>, LogStoreError> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(LogStoreError::Io(err)),
        };
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: LogEntry = serde_json::from_str(&line)?;
            if let Some(last_index) = entries.last().map(|last: &LogEntry| last.index) {
                if entry.index != last_index + 1 {
                    return Err(LogStoreError::IndexGap {
                        expected: last_index + 1,
                        observed: entry.index,
                    });
                }
            }
            entries.push(entry);
        }
        Ok(entries)
    }

    pub fn append(&mut self, entry: LogEntry) -> Result<(), LogStoreError> {
        let expected = self.last_index() + 1;
        if entry.index != expected {
            return Err(LogStoreError::IndexGap {
                expected,
                observed: entry.index,
            });
        }
        if let Some(last) = self.entries.last() {
            if entry.term < last.term {
                return Err(LogStoreError::TermRegression {
                    previous: last.term,
                    observed: entry.term,
                });
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');
        file.write_all(&line)?;
        file.sync_data()?;
        self.entries.push(entry);
        Ok(())
    }

    pub fn entry_at(&self, index: u64) -> Option<&LogEntry> {
        if index <= self.floor.index {
            return None;
        }
        let offset = (index - self.floor.index - 1) as usize;
        self.entries.get(offset)
    }

    pub fn last_index(&self) -> u64 {
        self.entries
            .last()
            .map(|entry| entry.index)
            .unwrap_or(self.floor.index)
    }

    pub fn last_term(&self) -> u64 {
        self.entries
            .last()
            .map(|entry| entry.term)
            .unwrap_or(self.floor.term)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn floor(&self) -> TermIndex {
        self.floor
    }

    /// Drops every entry at or below `index` after a snapshot covers them,
    /// then rewrites the file.
    pub fn truncate_through(&mut self, term: u64, index: u64) -> Result<(), LogStoreError> {
        if index <= self.floor.index {
            return Ok(());
        }
        self.entries.retain(|entry| entry.index > index);
        self.floor = TermIndex { term, index };
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            for entry in &self.entries {
                let mut line = serde_json::to_vec(entry)?;
                line.push(b'\n');
                file.write_all(&line)?;
            }
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Re-establishes the snapshot floor after a restart. A fully truncated
    /// log carries no entry to derive the floor from, so the caller feeds it
    /// back from the persisted metadata.
    pub fn align_floor(&mut self, term: u64, index: u64) {
        if self.entries.is_empty() && index > self.floor.index {
            self.floor = TermIndex { term, index };
        }
    }

    /// Wipes the log after a snapshot install supersedes it entirely.
    pub fn reset_to(&mut self, term: u64, index: u64) -> Result<(), LogStoreError> {
        self.entries.clear();
        self.floor = TermIndex { term, index };
        let tmp = self.path.with_extension("tmp");
        File::create(&tmp)?.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum LogStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("log index gap: expected {expected}, observed {observed}")]
    IndexGap { expected: u64, observed: u64 },

    #[error("log term regression: previous {previous}, observed {observed}")]
    TermRegression { previous: u64, observed: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_then_reopen_preserves_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cmd.log");
        {
            let mut store = LogStore::open(&path).unwrap();
            store.append(LogEntry::new(1, 1, vec![0xaa])).unwrap();
            store.append(LogEntry::new(1, 2, vec![0xbb])).unwrap();
        }
        let store = LogStore::open(&path).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.entry_at(2).unwrap().payload, vec![0xbb]);
        assert_eq!(store.last_index(), 2);
    }

    #[test]
    fn append_rejects_index_gap() {
        let dir = tempdir().unwrap();
        let mut store = LogStore::open(dir.path().join("cmd.log")).unwrap();
        store.append(LogEntry::new(1, 1, vec![])).unwrap();
        let err = store.append(LogEntry::new(1, 3, vec![])).unwrap_err();
        assert!(matches!(
            err,
            LogStoreError::IndexGap {
                expected: 2,
                observed: 3
            }
        ));
    }

    #[test]
    fn append_rejects_term_regression() {
        let dir = tempdir().unwrap();
        let mut store = LogStore::open(dir.path().join("cmd.log")).unwrap();
        store.append(LogEntry::new(5, 1, vec![])).unwrap();
        let err = store.append(LogEntry::new(4, 2, vec![])).unwrap_err();
        assert!(matches!(err, LogStoreError::TermRegression { .. }));
    }

    #[test]
    fn truncate_through_raises_the_floor() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cmd.log");
        let mut store = LogStore::open(&path).unwrap();
        for index in 1..=5 {
            store.append(LogEntry::new(1, index, vec![index as u8])).unwrap();
        }
        store.truncate_through(1, 3).unwrap();
        assert!(store.entry_at(3).is_none());
        assert_eq!(store.entry_at(4).unwrap().index, 4);
        assert_eq!(store.last_index(), 5);

        // Entries after the floor keep appending densely.
        store.append(LogEntry::new(1, 6, vec![6])).unwrap();
        let reopened = LogStore::open(&path).unwrap();
        assert_eq!(reopened.last_index(), 6);
    }

    #[test]
    fn metadata_round_trips() {
        let dir = tempdir().unwrap();
        let store = LogMetadataStore::new(dir.path().join("meta.json"));
        let mut metadata = store.load_or_default().unwrap();
        assert_eq!(metadata, LogMetadata::default());
        metadata.update_term(4);
        metadata.record_vote("scm-1");
        metadata.note_apply(4, 12);
        store.persist(&metadata).unwrap();
        assert_eq!(store.load_or_default().unwrap(), metadata);
    }
}
