use log::{info, warn};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{self, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const TABLE_NODES: &str = "nodes";
pub const TABLE_PIPELINES: &str = "pipelines";
pub const TABLE_CONTAINERS: &str = "containers";
pub const TABLE_META: &str = "meta";

pub const ALL_TABLES: [&str; 4] = [TABLE_NODES, TABLE_PIPELINES, TABLE_CONTAINERS, TABLE_META];

pub const META_LAYOUT_VERSION: &[u8] = b"layout_version";
pub const META_LAST_APPLIED_INDEX: &[u8] = b"last_applied_index";
pub const META_LAST_APPLIED_TERM: &[u8] = b"last_applied_term";
pub const META_CONTAINER_ID_COUNTER: &[u8] = b"container_id_counter";
pub const META_DELETE_TXN_COUNTER: &[u8] = b"delete_txn_counter";

const TABLE_MAGIC: &[u8; 4] = b"CTAB";
const TABLE_FORMAT_VERSION: u32 = 1;
const TABLE_FILE_EXTENSION: &str = "tab";

#[derive(Debug, Error)]
pub enum KvError {
    #[error("key {key} not found in table `{table}`")]
    NotFound { table: String, key: String },

    #[error("unknown table `{table}`")]
    UnknownTable { table: String },

    /// Table file damage. Fatal to the caller: a corrupted store must not be
    /// written through.
    #[error("corruption in table `{table}`: {detail}")]
    Corruption { table: String, detail: String },

    #[error("I/O failure: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put {
        table: String,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        table: String,
        key: Vec<u8>,
    },
}

/// All-or-nothing group of mutations. Atomic with respect to readers on the
/// same process; not a distributed transaction.
#[derive(Debug, Default, Clone)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, table: &str, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Put {
            table: table.to_string(),
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn delete(&mut self, table: &str, key: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Delete {
            table: table.to_string(),
            key: key.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterDirection {
    Forward,
    Reverse,
}

#[derive(Debug, Default)]
struct TableState {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
    dirty: bool,
}

/// Directory-backed ordered store. Tables live in memory behind one
/// reader-writer lock and persist to `<root>/<table>.tab` on flush with a
/// trailing SHA-256 digest for damage detection.
#[derive(Debug)]
pub struct KvStore {
    root: PathBuf,
    tables: RwLock<HashMap<String, TableState>>,
}

impl KvStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, KvError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let mut tables = HashMap::new();
        for name in ALL_TABLES {
            let entries = load_table(&table_path(&root, name), name)?;
            tables.insert(
                name.to_string(),
                TableState {
                    entries,
                    dirty: false,
                },
            );
        }
        info!("event=kv_open root={}", root.display());
        Ok(Self {
            root,
            tables: RwLock::new(tables),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn get(&self, table: &str, key: &[u8]) -> Result<Vec<u8>, KvError> {
        self.try_get(table, key)?.ok_or_else(|| KvError::NotFound {
            table: table.to_string(),
            key: hex::encode(key),
        })
    }

    pub fn try_get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>, KvError> {
        let tables = self.tables.read();
        let state = lookup(&tables, table)?;
        Ok(state.entries.get(key).cloned())
    }

    pub fn put(&self, table: &str, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Result<(), KvError> {
        let mut tables = self.tables.write();
        let state = lookup_mut(&mut tables, table)?;
        state.entries.insert(key.into(), value.into());
        state.dirty = true;
        Ok(())
    }

    pub fn delete(&self, table: &str, key: &[u8]) -> Result<(), KvError> {
        let mut tables = self.tables.write();
        let state = lookup_mut(&mut tables, table)?;
        if state.entries.remove(key).is_some() {
            state.dirty = true;
        }
        Ok(())
    }

    /// Applies every operation under one write-lock hold, so readers observe
    /// either none or all of the batch.
    pub fn apply_batch(&self, batch: &WriteBatch) -> Result<(), KvError> {
        let mut tables = self.tables.write();
        for op in batch.ops() {
            let table = match op {
                BatchOp::Put { table, .. } | BatchOp::Delete { table, .. } => table,
            };
            lookup(&tables, table)?;
        }
        for op in batch.ops() {
            match op {
                BatchOp::Put { table, key, value } => {
                    let state = lookup_mut(&mut tables, table)?;
                    state.entries.insert(key.clone(), value.clone());
                    state.dirty = true;
                }
                BatchOp::Delete { table, key } => {
                    let state = lookup_mut(&mut tables, table)?;
                    if state.entries.remove(key).is_some() {
                        state.dirty = true;
                    }
                }
            }
        }
        Ok(())
    }

    /// Range iteration starting at `from` (inclusive), bounded by `limit`.
    pub fn range_from(
        &self,
        table: &str,
        from: &[u8],
        direction: IterDirection,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, KvError> {
        let tables = self.tables.read();
        let state = lookup(&tables, table)?;
        let pairs: Vec<(Vec<u8>, Vec<u8>)> = match direction {
            IterDirection::Forward => state
                .entries
                .range((Bound::Included(from.to_vec()), Bound::Unbounded))
                .take(limit)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            IterDirection::Reverse => state
                .entries
                .range((Bound::Unbounded, Bound::Included(from.to_vec())))
                .rev()
                .take(limit)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        Ok(pairs)
    }

    pub fn scan(&self, table: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>, KvError> {
        let tables = self.tables.read();
        let state = lookup(&tables, table)?;
        Ok(state
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    pub fn len(&self, table: &str) -> Result<usize, KvError> {
        let tables = self.tables.read();
        Ok(lookup(&tables, table)?.entries.len())
    }

    pub fn is_empty(&self, table: &str) -> Result<bool, KvError> {
        Ok(self.len(table)? == 0)
    }

    /// Persists every dirty table with the atomic tmp-write/sync/rename dance.
    pub fn flush(&self) -> Result<(), KvError> {
        let mut tables = self.tables.write();
        for (name, state) in tables.iter_mut() {
            if !state.dirty {
                continue;
            }
            persist_table(&table_path(&self.root, name), &state.entries)?;
            state.dirty = false;
        }
        Ok(())
    }

    /// Drops in-memory state and re-reads every table file. Used after a
    /// checkpoint install replaces the files underneath us.
    pub fn reload(&self) -> Result<(), KvError> {
        let mut fresh = HashMap::new();
        for name in ALL_TABLES {
            let entries = load_table(&table_path(&self.root, name), name)?;
            fresh.insert(
                name.to_string(),
                TableState {
                    entries,
                    dirty: false,
                },
            );
        }
        *self.tables.write() = fresh;
        info!("event=kv_reload root={}", self.root.display());
        Ok(())
    }

    pub(crate) fn table_file(&self, table: &str) -> PathBuf {
        table_path(&self.root, table)
    }

    /// Meta-table helper: big-endian u64 register with zero default.
    pub fn meta_counter(&self, key: &[u8]) -> Result<u64, KvError> {
        match self.try_get(TABLE_META, key)? {
            Some(raw) => decode_u64(TABLE_META, &raw),
            None => Ok(0),
        }
    }

    pub fn set_meta_counter(&self, key: &[u8], value: u64) -> Result<(), KvError> {
        self.put(TABLE_META, key, value.to_be_bytes().to_vec())
    }
}

fn lookup<'t>(
    tables: &'t HashMap<String, TableState>,
    table: &str,
) -> Result<&'t TableState, KvError> {
    tables.get(table).ok_or_else(|| KvError::UnknownTable {
        table: table.to_string(),
    })
}

fn lookup_mut<'t>(
    tables: &'t mut HashMap<String, TableState>,
    table: &str,
) -> Result<&'t mut TableState, KvError> {
    tables.get_mut(table).ok_or_else(|| KvError::UnknownTable {
        table: table.to_string(),
    })
}

fn table_path(root: &Path, table: &str) -> PathBuf {
    root.join(format!("{table}.{TABLE_FILE_EXTENSION}"))
}

fn persist_table(path: &Path, entries: &BTreeMap<Vec<u8>, Vec<u8>>) -> Result<(), KvError> {
    let mut body = Vec::new();
    body.extend_from_slice(&TABLE_FORMAT_VERSION.to_be_bytes());
    body.extend_from_slice(&(entries.len() as u64).to_be_bytes());
    for (key, value) in entries {
        body.extend_from_slice(&(key.len() as u32).to_be_bytes());
        body.extend_from_slice(key);
        body.extend_from_slice(&(value.len() as u32).to_be_bytes());
        body.extend_from_slice(value);
    }
    let digest = Sha256::digest(&body);

    let tmp = path.with_extension("tmp");
    let mut file = File::create(&tmp)?;
    file.write_all(TABLE_MAGIC)?;
    file.write_all(&body)?;
    file.write_all(&digest)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn load_table(path: &Path, table: &str) -> Result<BTreeMap<Vec<u8>, Vec<u8>>, KvError> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(err) => return Err(KvError::Io(err)),
    };
    let corrupt = |detail: &str| KvError::Corruption {
        table: table.to_string(),
        detail: detail.to_string(),
    };

    if raw.len() < TABLE_MAGIC.len() + 4 + 8 + 32 {
        return Err(corrupt("file truncated"));
    }
    if &raw[..TABLE_MAGIC.len()] != TABLE_MAGIC {
        return Err(corrupt("bad magic"));
    }
    let body = &raw[TABLE_MAGIC.len()..raw.len() - 32];
    let stored_digest = &raw[raw.len() - 32..];
    let digest = Sha256::digest(body);
    if digest.as_slice() != stored_digest {
        warn!("event=kv_digest_mismatch table={table} path={}", path.display());
        return Err(corrupt("digest mismatch"));
    }

    let mut cursor = 0usize;
    let version = read_u32(body, &mut cursor).ok_or_else(|| corrupt("missing version"))?;
    if version != TABLE_FORMAT_VERSION {
        return Err(corrupt("unsupported format version"));
    }
    let count = read_u64(body, &mut cursor).ok_or_else(|| corrupt("missing record count"))?;
    let mut entries = BTreeMap::new();
    for _ in 0..count {
        let key = read_chunk(body, &mut cursor).ok_or_else(|| corrupt("truncated key"))?;
        let value = read_chunk(body, &mut cursor).ok_or_else(|| corrupt("truncated value"))?;
        entries.insert(key, value);
    }
    if cursor != body.len() {
        return Err(corrupt("trailing bytes after records"));
    }
    Ok(entries)
}

fn read_u32(buf: &[u8], cursor: &mut usize) -> Option<u32> {
    let bytes = buf.get(*cursor..*cursor + 4)?;
    *cursor += 4;
    Some(u32::from_be_bytes(bytes.try_into().ok()?))
}

fn read_u64(buf: &[u8], cursor: &mut usize) -> Option<u64> {
    let bytes = buf.get(*cursor..*cursor + 8)?;
    *cursor += 8;
    Some(u64::from_be_bytes(bytes.try_into().ok()?))
}

fn read_chunk(buf: &[u8], cursor: &mut usize) -> Option<Vec<u8>> {
    let len = read_u32(buf, cursor)? as usize;
    let chunk = buf.get(*cursor..*cursor + len)?;
    *cursor += len;
    Some(chunk.to_vec())
}

fn decode_u64(table: &str, raw: &[u8]) -> Result<u64, KvError> {
    let bytes: [u8; 8] = raw.try_into().map_err(|_| KvError::Corruption {
        table: table.to_string(),
        detail: "counter register is not 8 bytes".to_string(),
    })?;
    Ok(u64::from_be_bytes(bytes))
}
