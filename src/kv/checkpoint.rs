use super::store::{KvError, KvStore, ALL_TABLES};
use hmac::{Hmac, Mac};
use log::info;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const CHECKPOINT_MANIFEST_NAME: &str = "CHECKPOINT.json";

/// Consistent file-level snapshot of the whole store, suitable for bulk
/// transfer to a lagging replica. The manifest pins every table file by
/// digest and records the log position the snapshot covers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckpointManifest {
    pub format_version: u32,
    pub term: u64,
    pub index: u64,
    pub files: Vec<CheckpointFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckpointFile {
    pub name: String,
    pub len: u64,
    pub sha256_hex: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedCheckpointManifest {
    pub manifest: CheckpointManifest,
    pub signature_hex: String,
}

/// Keyed signer shared by all SCM replicas of one cluster. Signing covers the
/// canonical JSON of the manifest, so a tampered file list or log position is
/// rejected before any table file is swapped in.
#[derive(Clone)]
pub struct CheckpointSigner {
    key: Vec<u8>,
}

impl CheckpointSigner {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    fn sign(&self, payload: &[u8]) -> Result<String, CheckpointError> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|_| CheckpointError::InvalidSigningKey)?;
        mac.update(payload);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn verify(&self, payload: &[u8], signature_hex: &str) -> Result<(), CheckpointError> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|_| CheckpointError::InvalidSigningKey)?;
        mac.update(payload);
        let signature = hex::decode(signature_hex)
            .map_err(|_| CheckpointError::SignatureMismatch)?;
        mac.verify_slice(&signature)
            .map_err(|_| CheckpointError::SignatureMismatch)
    }
}

/// Flushes the store and copies every table file into `dir`, then writes the
/// signed manifest last so a torn checkpoint is never verifiable.
pub fn write_checkpoint(
    store: &KvStore,
    dir: &Path,
    term: u64,
    index: u64,
    signer: &CheckpointSigner,
) -> Result<CheckpointManifest, CheckpointError> {
    store.flush()?;
    fs::create_dir_all(dir)?;

    let mut files = Vec::new();
    for table in ALL_TABLES {
        let source = store.table_file(table);
        let raw = match fs::read(&source) {
            Ok(raw) => raw,
            // A never-flushed empty table has no file yet; checkpoint it as absent.
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(CheckpointError::Kv(KvError::Io(err))),
        };
        let name = source
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(table)
            .to_string();
        fs::write(dir.join(&name), &raw)?;
        files.push(CheckpointFile {
            name,
            len: raw.len() as u64,
            sha256_hex: hex::encode(Sha256::digest(&raw)),
        });
    }

    let manifest = CheckpointManifest {
        format_version: 1,
        term,
        index,
        files,
    };
    let canonical = serde_json::to_vec(&manifest)?;
    let signed = SignedCheckpointManifest {
        signature_hex: signer.sign(&canonical)?,
        manifest: manifest.clone(),
    };
    let manifest_path = dir.join(CHECKPOINT_MANIFEST_NAME);
    let tmp = manifest_path.with_extension("tmp");
    let mut file = File::create(&tmp)?;
    file.write_all(&serde_json::to_vec_pretty(&signed)?)?;
    file.sync_all()?;
    fs::rename(&tmp, &manifest_path)?;

    info!(
        "event=checkpoint_written dir={} term={} index={} files={}",
        dir.display(),
        term,
        index,
        manifest.files.len()
    );
    Ok(manifest)
}

/// Verifies the manifest signature and every file digest without touching the
/// live store.
pub fn verify_checkpoint(
    dir: &Path,
    signer: &CheckpointSigner,
) -> Result<CheckpointManifest, CheckpointError> {
    let raw = fs::read(dir.join(CHECKPOINT_MANIFEST_NAME)).map_err(|err| {
        if err.kind() == io::ErrorKind::NotFound {
            CheckpointError::ManifestMissing
        } else {
            CheckpointError::Kv(KvError::Io(err))
        }
    })?;
    let signed: SignedCheckpointManifest = serde_json::from_slice(&raw)?;
    let canonical = serde_json::to_vec(&signed.manifest)?;
    signer.verify(&canonical, &signed.signature_hex)?;

    for file in &signed.manifest.files {
        let payload = fs::read(dir.join(&file.name))?;
        if payload.len() as u64 != file.len {
            return Err(CheckpointError::FileDamaged {
                name: file.name.clone(),
            });
        }
        if hex::encode(Sha256::digest(&payload)) != file.sha256_hex {
            return Err(CheckpointError::FileDamaged {
                name: file.name.clone(),
            });
        }
    }
    Ok(signed.manifest)
}

/// Verifies, then atomically replaces the live tables with the checkpoint
/// files and reloads the store. Absent tables in the checkpoint become empty.
pub fn install_checkpoint(
    store: &KvStore,
    dir: &Path,
    signer: &CheckpointSigner,
) -> Result<CheckpointManifest, CheckpointError> {
    let manifest = verify_checkpoint(dir, signer)?;

    for table in ALL_TABLES {
        let live = store.table_file(table);
        let name = live
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(table)
            .to_string();
        let incoming = dir.join(&name);
        if incoming.exists() {
            let tmp = live.with_extension("install");
            fs::copy(&incoming, &tmp)?;
            fs::rename(&tmp, &live)?;
        } else if live.exists() {
            fs::remove_file(&live)?;
        }
    }
    store.reload()?;
    info!(
        "event=checkpoint_installed dir={} term={} index={}",
        dir.display(),
        manifest.term,
        manifest.index
    );
    Ok(manifest)
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint manifest missing")]
    ManifestMissing,

    #[error("checkpoint signing key rejected")]
    InvalidSigningKey,

    #[error("checkpoint manifest signature mismatch")]
    SignatureMismatch,

    #[error("checkpoint file `{name}` damaged or truncated")]
    FileDamaged { name: String },

    #[error(transparent)]
    Kv(#[from] KvError),

    #[error("manifest encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl From<io::Error> for CheckpointError {
    fn from(err: io::Error) -> Self {
        Self::Kv(KvError::Io(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{TABLE_CONTAINERS, TABLE_NODES};
    use tempfile::tempdir;

    fn seeded_store(dir: &Path) -> KvStore {
        let store = KvStore::open(dir).unwrap();
        store.put(TABLE_NODES, b"n1".to_vec(), b"node-one".to_vec()).unwrap();
        store
            .put(TABLE_CONTAINERS, b"c1".to_vec(), b"open".to_vec())
            .unwrap();
        store
    }

    #[test]
    fn checkpoint_round_trips_into_fresh_store() {
        let source_dir = tempdir().unwrap();
        let checkpoint_dir = tempdir().unwrap();
        let target_dir = tempdir().unwrap();
        let signer = CheckpointSigner::new(b"cluster-secret".to_vec());

        let store = seeded_store(source_dir.path());
        let manifest =
            write_checkpoint(&store, checkpoint_dir.path(), 3, 17, &signer).unwrap();
        assert_eq!(manifest.index, 17);

        let target = KvStore::open(target_dir.path()).unwrap();
        target.put(TABLE_NODES, b"stale".to_vec(), b"junk".to_vec()).unwrap();
        target.flush().unwrap();

        let installed = install_checkpoint(&target, checkpoint_dir.path(), &signer).unwrap();
        assert_eq!(installed, manifest);
        assert_eq!(target.get(TABLE_NODES, b"n1").unwrap(), b"node-one");
        assert!(target.try_get(TABLE_NODES, b"stale").unwrap().is_none());
    }

    #[test]
    fn tampered_table_file_fails_verification() {
        let source_dir = tempdir().unwrap();
        let checkpoint_dir = tempdir().unwrap();
        let signer = CheckpointSigner::new(b"cluster-secret".to_vec());

        let store = seeded_store(source_dir.path());
        write_checkpoint(&store, checkpoint_dir.path(), 1, 5, &signer).unwrap();

        let victim = checkpoint_dir.path().join("nodes.tab");
        let mut raw = fs::read(&victim).unwrap();
        raw[0] ^= 0x01;
        fs::write(&victim, raw).unwrap();

        assert!(matches!(
            verify_checkpoint(checkpoint_dir.path(), &signer).unwrap_err(),
            CheckpointError::FileDamaged { .. }
        ));
    }

    #[test]
    fn wrong_key_rejects_manifest() {
        let source_dir = tempdir().unwrap();
        let checkpoint_dir = tempdir().unwrap();
        let signer = CheckpointSigner::new(b"cluster-secret".to_vec());
        let store = seeded_store(source_dir.path());
        write_checkpoint(&store, checkpoint_dir.path(), 1, 5, &signer).unwrap();

        let wrong = CheckpointSigner::new(b"other-secret".to_vec());
        assert!(matches!(
            verify_checkpoint(checkpoint_dir.path(), &wrong).unwrap_err(),
            CheckpointError::SignatureMismatch
        ));
    }
}
