/*!
 * Transfer Orchestrator
 *
 * Resumable upload, download and copy. Each transfer is split into parts that
 * run on a [`PartWorkerPool`](crate::pool::PartWorkerPool); progress is kept
 * in a [`CheckpointRecord`](crate::checkpoint::CheckpointRecord) that is
 * persisted before the first part runs and after every finished part, so an
 * identical call after a failure only repeats the parts that did not finish.
 *
 * State machine:
 *
 * ```text
 * Init -> FreshStart | Resume -> InFlight -> Finalizing -> Done
 *                                    \-> Failed   (checkpoint kept)
 * ```
 */

pub mod copy;
pub mod download;
pub mod engine;
pub mod upload;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::checkpoint::CheckpointStore;
use crate::progress::SharedListener;
use crate::types::{ByteRange, Conditions, ObjectMetadata};

/// Phase of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Init,
    /// No usable checkpoint; a new remote session or temp file is created
    FreshStart,
    /// A valid checkpoint was found; only pending parts run
    Resume,
    InFlight,
    /// All parts done; completing the session or renaming the temp file
    Finalizing,
    Done,
    /// Stopped by the caller or a disabled client
    Aborted,
    Failed,
}

impl std::fmt::Display for TransferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransferState::Init => "init",
            TransferState::FreshStart => "fresh-start",
            TransferState::Resume => "resume",
            TransferState::InFlight => "in-flight",
            TransferState::Finalizing => "finalizing",
            TransferState::Done => "done",
            TransferState::Aborted => "aborted",
            TransferState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Settings shared by every resumable transfer
#[derive(Clone, Default)]
pub struct TransferOptions {
    /// Part size in bytes; the client's default when unset
    pub part_size: Option<u64>,
    /// Worker count; the client's default when unset
    pub thread_num: Option<usize>,
    /// Directory for checkpoint files; unset or empty disables persistence
    pub checkpoint_dir: Option<PathBuf>,
    /// Checkpoint store to use instead of `checkpoint_dir`
    pub checkpoint_store: Option<Arc<dyn CheckpointStore>>,
    /// Bytes/sec cap for this transfer
    pub traffic_limit: Option<u64>,
    pub progress: Option<SharedListener>,
}

impl std::fmt::Debug for TransferOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferOptions")
            .field("part_size", &self.part_size)
            .field("thread_num", &self.thread_num)
            .field("checkpoint_dir", &self.checkpoint_dir)
            .field("checkpoint_store", &self.checkpoint_store.is_some())
            .field("traffic_limit", &self.traffic_limit)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// Builder methods for the [`TransferOptions`] embedded in a request
macro_rules! transfer_options_builders {
    ($request:ty) => {
        impl $request {
            pub fn with_part_size(mut self, part_size: u64) -> Self {
                self.options.part_size = Some(part_size);
                self
            }

            pub fn with_thread_num(mut self, thread_num: usize) -> Self {
                self.options.thread_num = Some(thread_num);
                self
            }

            pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
                self.options.checkpoint_dir = Some(dir.into());
                self
            }

            pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
                self.options.checkpoint_store = Some(store);
                self
            }

            pub fn with_traffic_limit(mut self, bytes_per_sec: u64) -> Self {
                self.options.traffic_limit = Some(bytes_per_sec);
                self
            }

            pub fn with_progress(mut self, listener: SharedListener) -> Self {
                self.options.progress = Some(listener);
                self
            }
        }
    };
}

/// Upload of a local file to `bucket/key`
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub bucket: String,
    pub key: String,
    pub local_path: PathBuf,
    pub metadata: ObjectMetadata,
    pub options: TransferOptions,
}

impl UploadRequest {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>, local_path: impl AsRef<Path>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            local_path: local_path.as_ref().to_path_buf(),
            metadata: ObjectMetadata::default(),
            options: TransferOptions::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: ObjectMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

transfer_options_builders!(UploadRequest);

/// Download of `bucket/key` into a local file
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub bucket: String,
    pub key: String,
    pub version_id: Option<String>,
    pub local_path: PathBuf,
    /// Only this span of the object
    pub range: Option<ByteRange>,
    /// Checked once against the object before any part is scheduled
    pub conditions: Conditions,
    pub options: TransferOptions,
}

impl DownloadRequest {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>, local_path: impl AsRef<Path>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            version_id: None,
            local_path: local_path.as_ref().to_path_buf(),
            range: None,
            conditions: Conditions::default(),
            options: TransferOptions::default(),
        }
    }

    pub fn with_version_id(mut self, version_id: impl Into<String>) -> Self {
        self.version_id = Some(version_id.into());
        self
    }

    pub fn with_range(mut self, range: ByteRange) -> Self {
        self.range = Some(range);
        self
    }

    pub fn with_conditions(mut self, conditions: Conditions) -> Self {
        self.conditions = conditions;
        self
    }
}

transfer_options_builders!(DownloadRequest);

/// Server-side copy of one object to another
#[derive(Debug, Clone)]
pub struct CopyRequest {
    pub src_bucket: String,
    pub src_key: String,
    pub src_version_id: Option<String>,
    pub bucket: String,
    pub key: String,
    /// Metadata for the destination; the source's when unset
    pub metadata: Option<ObjectMetadata>,
    pub options: TransferOptions,
}

impl CopyRequest {
    pub fn new(
        src_bucket: impl Into<String>,
        src_key: impl Into<String>,
        bucket: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            src_bucket: src_bucket.into(),
            src_key: src_key.into(),
            src_version_id: None,
            bucket: bucket.into(),
            key: key.into(),
            metadata: None,
            options: TransferOptions::default(),
        }
    }

    pub fn with_source_version(mut self, version_id: impl Into<String>) -> Self {
        self.src_version_id = Some(version_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: ObjectMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

transfer_options_builders!(CopyRequest);

/// Result of a finished transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    /// Always `Done` for a returned outcome
    pub state: TransferState,
    /// The run continued from a checkpoint
    pub resumed: bool,
    /// The object was small enough for a single request
    pub single_request: bool,
    pub upload_id: Option<String>,
    pub etag: Option<String>,
    pub crc32: Option<u32>,
    pub version_id: Option<String>,
    pub total_bytes: u64,
    /// Bytes moved by this call, excluding parts finished earlier
    pub transferred_bytes: u64,
    pub part_count: usize,
}

pub use engine::PartOutcome;
