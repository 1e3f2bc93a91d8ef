//! Ordered keyed tables with atomic batches and whole-store checkpoints.

mod checkpoint;
mod store;

pub use checkpoint::{
    install_checkpoint, verify_checkpoint, write_checkpoint, CheckpointError, CheckpointFile,
    CheckpointManifest, CheckpointSigner, SignedCheckpointManifest, CHECKPOINT_MANIFEST_NAME,
};
pub use store::{
    BatchOp, IterDirection, KvError, KvStore, WriteBatch, ALL_TABLES, META_CONTAINER_ID_COUNTER,
    META_DELETE_TXN_COUNTER, META_LAST_APPLIED_INDEX, META_LAST_APPLIED_TERM, META_LAYOUT_VERSION,
    TABLE_CONTAINERS, TABLE_META, TABLE_NODES, TABLE_PIPELINES,
};
