/*!
 * objvault - resumable object-storage transfers with envelope encryption
 *
 * A client library for S3-like object stores with:
 * - Resumable multipart upload, ranged download and server-side copy
 * - Checkpoints persisted after every part, verified by a self-digest
 * - Bounded worker pools for parallel part transfers
 * - Client-side envelope encryption (AES-256-CTR content keys, wrapped by a
 *   master key and stored as object metadata)
 * - CRC-32 verification of parts and whole objects
 * - Retry with interruptible backoff and an enable/disable switch
 *
 * The remote service is reached through the [`Transport`] trait;
 * [`MemoryTransport`] is an in-process store used by the tests.
 */

pub mod bandwidth;
pub mod checkpoint;
pub mod checksum;
pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod logging;
pub mod partition;
pub mod pool;
pub mod progress;
pub mod retry;
pub mod signer;
pub mod transfer;
pub mod transport;
pub mod types;

// Re-export commonly used types
pub use checkpoint::{CheckpointRecord, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use client::{ClientCapabilities, GetObjectOptions, TaskHandle, TransferClient};
pub use config::{BackoffStrategy, ClientConfig};
pub use crypto::{CryptoProvider, EncryptionMaterials, SymmetricKeyProvider};
pub use error::{Result, VaultError};
pub use progress::{ChannelReporter, ProgressEvent, ProgressListener};
pub use transfer::{
    CopyRequest, DownloadRequest, TransferOutcome, TransferState, UploadRequest,
};
pub use transport::{MemoryTransport, Transport};
pub use types::{ByteRange, Conditions, CopySource, ObjectMetadata};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
