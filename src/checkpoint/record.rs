//! Persisted state of one resumable transfer

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::checksum;
use crate::error::{Result, VaultError};
use crate::partition::PartTask;
use crate::types::PartETag;

/// Record format version
pub const CHECKPOINT_VERSION: u32 = 1;

/// Kind of transfer a checkpoint belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpType {
    Upload,
    Download,
    Copy,
}

impl std::fmt::Display for OpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpType::Upload => write!(f, "upload"),
            OpType::Download => write!(f, "download"),
            OpType::Copy => write!(f, "copy"),
        }
    }
}

/// State of one part
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartState {
    Pending,
    Done,
}

/// One part as recorded in the checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartRecord {
    pub part_number: u32,
    pub offset: u64,
    pub size: u64,
    pub crc32: Option<u32>,
    pub etag: Option<String>,
    pub state: PartState,
}

impl PartRecord {
    fn pending(task: &PartTask) -> Self {
        Self {
            part_number: task.part_number,
            offset: task.offset,
            size: task.length,
            crc32: None,
            etag: None,
            state: PartState::Pending,
        }
    }

    /// The part as a task for the worker pool
    pub fn task(&self) -> PartTask {
        PartTask {
            part_number: self.part_number,
            offset: self.offset,
            length: self.size,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == PartState::Done
    }
}

/// Size and modification time of a local file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    pub size: u64,
    pub mtime_ms: i64,
}

impl FileStat {
    /// Read the stat of a local file
    pub fn of(path: &std::path::Path) -> Result<Self> {
        let metadata = std::fs::metadata(path)?;
        let mtime_ms = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Ok(Self {
            size: metadata.len(),
            mtime_ms,
        })
    }
}

/// Attributes of a remote object the transfer reads from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectStat {
    pub size: u64,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

/// Content-encryption material of an encrypted transfer
///
/// Holds the envelope exactly as it is stored in object metadata, so a resumed
/// upload keeps encrypting under the key it started with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionRecord {
    pub wrapped_key: String,
    pub wrapped_iv: String,
    pub wrap_algorithm: String,
    pub cek_algorithm: String,
    pub mat_desc: Option<String>,
}

/// Durable record of an in-flight transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub version: u32,
    pub op_type: OpType,
    pub bucket: String,
    pub key: String,
    #[serde(default)]
    pub version_id: Option<String>,
    #[serde(default)]
    pub src_bucket: Option<String>,
    #[serde(default)]
    pub src_key: Option<String>,
    #[serde(default)]
    pub local_path: Option<String>,
    #[serde(default)]
    pub upload_id: Option<String>,
    #[serde(default)]
    pub file_stat: Option<FileStat>,
    #[serde(default)]
    pub object_stat: Option<ObjectStat>,
    pub part_size: u64,
    #[serde(default)]
    pub range_start: Option<u64>,
    #[serde(default)]
    pub range_end: Option<u64>,
    #[serde(default)]
    pub encryption: Option<EncryptionRecord>,
    /// Extra object metadata the remote session was initiated with
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub parts: Vec<PartRecord>,
    /// SHA-256 over the record with this field blank
    #[serde(default)]
    pub digest: String,
}

impl CheckpointRecord {
    /// Fresh record with every part pending
    pub fn new(
        op_type: OpType,
        bucket: impl Into<String>,
        key: impl Into<String>,
        part_size: u64,
        tasks: &[PartTask],
    ) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            op_type,
            bucket: bucket.into(),
            key: key.into(),
            version_id: None,
            src_bucket: None,
            src_key: None,
            local_path: None,
            upload_id: None,
            file_stat: None,
            object_stat: None,
            part_size,
            range_start: None,
            range_end: None,
            encryption: None,
            metadata: BTreeMap::new(),
            parts: tasks.iter().map(PartRecord::pending).collect(),
            digest: String::new(),
        }
    }

    /// Digest of the record content, ignoring the stored digest
    pub fn compute_digest(&self) -> Result<String> {
        let mut unsealed = self.clone();
        unsealed.digest.clear();
        let canonical = serde_json::to_vec(&unsealed)?;
        Ok(hex::encode(Sha256::digest(&canonical)))
    }

    /// Store the current digest in the record
    pub fn seal(&mut self) -> Result<()> {
        self.digest = self.compute_digest()?;
        Ok(())
    }

    /// True if the stored digest matches the content
    pub fn verify_digest(&self) -> bool {
        match self.compute_digest() {
            Ok(digest) => !self.digest.is_empty() && digest == self.digest,
            Err(_) => false,
        }
    }

    /// True if the recorded parts have exactly the given layout
    pub fn matches_layout(&self, tasks: &[PartTask]) -> bool {
        self.parts.len() == tasks.len()
            && self
                .parts
                .iter()
                .zip(tasks)
                .all(|(part, task)| part.task() == *task)
    }

    /// Parts that still need to run
    pub fn pending_tasks(&self) -> Vec<PartTask> {
        self.parts
            .iter()
            .filter(|p| !p.is_done())
            .map(PartRecord::task)
            .collect()
    }

    /// Mark a part done with its remote result
    pub fn mark_done(&mut self, part_number: u32, etag: Option<String>, crc32: Option<u32>) -> Result<()> {
        let part = self
            .parts
            .iter_mut()
            .find(|p| p.part_number == part_number)
            .ok_or_else(|| {
                VaultError::Checkpoint(format!("part {} not in checkpoint", part_number))
            })?;
        part.etag = etag;
        part.crc32 = crc32;
        part.state = PartState::Done;
        Ok(())
    }

    /// Bytes covered by finished parts
    pub fn completed_bytes(&self) -> u64 {
        self.parts
            .iter()
            .filter(|p| p.is_done())
            .map(|p| p.size)
            .sum()
    }

    /// Total bytes covered by the record
    pub fn total_bytes(&self) -> u64 {
        self.parts.iter().map(|p| p.size).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.parts.iter().all(PartRecord::is_done)
    }

    /// CRC-32 of the whole span, if every part is done and carries a CRC
    pub fn combined_crc32(&self) -> Option<u32> {
        let mut pairs = Vec::with_capacity(self.parts.len());
        for part in &self.parts {
            if !part.is_done() {
                return None;
            }
            pairs.push((part.crc32?, part.size));
        }
        Some(checksum::combine_all(pairs))
    }

    /// Ordered part list for CompleteMultipartUpload
    pub fn part_etags(&self) -> Result<Vec<PartETag>> {
        self.parts
            .iter()
            .map(|p| match (&p.state, &p.etag) {
                (PartState::Done, Some(etag)) => Ok(PartETag {
                    part_number: p.part_number,
                    etag: etag.clone(),
                    size: p.size,
                    crc32: p.crc32,
                }),
                _ => Err(VaultError::Checkpoint(format!(
                    "part {} has no etag",
                    p.part_number
                ))),
            })
            .collect()
    }
}

/// Logical identity of a transfer, hashed into its checkpoint fingerprint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferIdentity {
    pub op_type: OpType,
    pub bucket: String,
    pub key: String,
    pub version_id: Option<String>,
    pub src_bucket: Option<String>,
    pub src_key: Option<String>,
    pub local_path: Option<String>,
}

impl TransferIdentity {
    /// Identity with only the operation and destination set
    pub fn new(op_type: OpType, bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            op_type,
            bucket: bucket.into(),
            key: key.into(),
            version_id: None,
            src_bucket: None,
            src_key: None,
            local_path: None,
        }
    }

    pub fn with_version(mut self, version_id: Option<String>) -> Self {
        self.version_id = version_id;
        self
    }

    pub fn with_source(mut self, bucket: impl Into<String>, key: impl Into<String>) -> Self {
        self.src_bucket = Some(bucket.into());
        self.src_key = Some(key.into());
        self
    }

    pub fn with_local_path(mut self, path: &std::path::Path) -> Self {
        self.local_path = Some(path.to_string_lossy().into_owned());
        self
    }

    /// Deterministic hex fingerprint
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for field in [
            Some(self.op_type.to_string()),
            Some(self.bucket.clone()),
            Some(self.key.clone()),
            self.version_id.clone(),
            self.src_bucket.clone(),
            self.src_key.clone(),
            self.local_path.clone(),
        ] {
            // Length-prefix each field so ("ab","c") and ("a","bc") differ
            match field {
                Some(value) => {
                    hasher.update((value.len() as u64).to_be_bytes());
                    hasher.update(value.as_bytes());
                }
                None => hasher.update(u64::MAX.to_be_bytes()),
            }
        }
        hex::encode(hasher.finalize())
    }
}
