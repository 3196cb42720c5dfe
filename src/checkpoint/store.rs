//! Checkpoint persistence

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

use super::record::CheckpointRecord;
use crate::error::{Result, VaultError};

/// Key-value store of checkpoint records, keyed by transfer fingerprint
pub trait CheckpointStore: Send + Sync {
    /// Load a record; `None` if absent or untrustworthy
    fn load(&self, fingerprint: &str) -> Result<Option<CheckpointRecord>>;

    /// Persist a record, replacing any previous one atomically
    fn save(&self, fingerprint: &str, record: &CheckpointRecord) -> Result<()>;

    /// Remove a record; absent records are not an error
    fn delete(&self, fingerprint: &str) -> Result<()>;
}

/// Stores each record as `<dir>/<fingerprint>.ckpt` JSON
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    /// Open a store in an existing, writable directory
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if dir.as_os_str().is_empty() {
            return Err(VaultError::Validate(
                "checkpoint directory is empty".to_string(),
            ));
        }
        if !dir.is_dir() {
            return Err(VaultError::Validate(format!(
                "checkpoint directory does not exist: {}",
                dir.display()
            )));
        }

        let probe = dir.join(format!(".objvault-probe-{}", std::process::id()));
        fs::write(&probe, b"").map_err(|e| {
            VaultError::Validate(format!(
                "checkpoint directory not writable: {}: {}",
                dir.display(),
                e
            ))
        })?;
        let _ = fs::remove_file(&probe);

        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the record for a fingerprint
    pub fn path_for(&self, fingerprint: &str) -> PathBuf {
        self.dir.join(format!("{}.ckpt", fingerprint))
    }

    fn temp_path_for(&self, fingerprint: &str) -> PathBuf {
        self.dir.join(format!("{}.ckpt.tmp", fingerprint))
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self, fingerprint: &str) -> Result<Option<CheckpointRecord>> {
        let path = self.path_for(fingerprint);
        if !path.exists() {
            return Ok(None);
        }

        let contents = fs::read_to_string(&path)?;
        let record: CheckpointRecord = match serde_json::from_str(&contents) {
            Ok(record) => record,
            Err(e) => {
                warn!("Ignoring unreadable checkpoint {}: {}", path.display(), e);
                return Ok(None);
            }
        };

        if !record.verify_digest() {
            warn!("Ignoring checkpoint {} with bad digest", path.display());
            return Ok(None);
        }

        debug!("Loaded checkpoint {}", path.display());
        Ok(Some(record))
    }

    fn save(&self, fingerprint: &str, record: &CheckpointRecord) -> Result<()> {
        let mut sealed = record.clone();
        sealed.seal()?;
        let json = serde_json::to_string_pretty(&sealed)?;

        let temp_path = self.temp_path_for(fingerprint);
        let path = self.path_for(fingerprint);

        let write = || -> std::io::Result<()> {
            let mut file = fs::File::create(&temp_path)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
            fs::rename(&temp_path, &path)
        };
        write().map_err(|e| {
            VaultError::Checkpoint(format!("failed to save {}: {}", path.display(), e))
        })?;

        debug!(
            "Saved checkpoint {} ({}/{} parts done)",
            path.display(),
            sealed.parts.iter().filter(|p| p.is_done()).count(),
            sealed.parts.len()
        );
        Ok(())
    }

    fn delete(&self, fingerprint: &str) -> Result<()> {
        for path in [self.path_for(fingerprint), self.temp_path_for(fingerprint)] {
            match fs::remove_file(&path) {
                Ok(()) => debug!("Deleted checkpoint {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(VaultError::Checkpoint(format!(
                        "failed to delete {}: {}",
                        path.display(),
                        e
                    )))
                }
            }
        }
        Ok(())
    }
}

/// In-process store, for tests and callers that keep state themselves
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    records: Mutex<HashMap<String, CheckpointRecord>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fingerprints of stored records
    pub fn fingerprints(&self) -> Vec<String> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Replace a stored record without resealing it
    pub fn put_raw(&self, fingerprint: &str, record: CheckpointRecord) {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(fingerprint.to_string(), record);
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self, fingerprint: &str) -> Result<Option<CheckpointRecord>> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(records
            .get(fingerprint)
            .filter(|r| r.verify_digest())
            .cloned())
    }

    fn save(&self, fingerprint: &str, record: &CheckpointRecord) -> Result<()> {
        let mut sealed = record.clone();
        sealed.seal()?;
        self.put_raw(fingerprint, sealed);
        Ok(())
    }

    fn delete(&self, fingerprint: &str) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(fingerprint);
        Ok(())
    }
}
