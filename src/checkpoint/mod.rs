/*!
 * Checkpoint Store
 *
 * A checkpoint records which parts of a resumable transfer are done. It is
 * saved before the first part runs and after every completed part, and is
 * keyed by a fingerprint of the transfer's logical identity so re-issuing the
 * same transfer finds it again. Records carry a self-digest; one that fails
 * to verify is treated as absent.
 */

pub mod record;
pub mod store;

pub use record::{
    CheckpointRecord, EncryptionRecord, FileStat, ObjectStat, OpType, PartRecord, PartState,
    TransferIdentity, CHECKPOINT_VERSION,
};
pub use store::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
