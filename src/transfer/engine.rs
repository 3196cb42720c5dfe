//! Pieces shared by every resumable transfer: option resolution, checkpoint
//! access, the part runner and lifecycle reporting.

use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, error, info, warn, Span};

use super::{TransferOptions, TransferOutcome, TransferState};
use crate::bandwidth::TrafficLimiter;
use crate::checkpoint::{
    CheckpointRecord, CheckpointStore, FileCheckpointStore, OpType, TransferIdentity,
};
use crate::config::ClientConfig;
use crate::error::{Result, VaultError};
use crate::logging::transfer_span;
use crate::partition::{validate_upload_part_size, PartTask, MAX_PART_SIZE};
use crate::pool::PartWorkerPool;
use crate::progress::{PartProgress, ProgressEvent, ProgressTracker, SharedListener};

/// Bytes paced and reported at a time while a part moves
pub(crate) const PROGRESS_CHUNK: usize = 64 * 1024;

/// Result of one finished part, folded into the checkpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartOutcome {
    pub part_number: u32,
    pub size: u64,
    pub etag: Option<String>,
    pub crc32: Option<u32>,
}

/// Options of one transfer resolved against the client configuration
pub(crate) struct TransferPlan {
    pub part_size: u64,
    pub pool: PartWorkerPool,
    pub limiter: TrafficLimiter,
    store: Option<Arc<dyn CheckpointStore>>,
}

impl TransferPlan {
    /// Validate the options; fails with `ValidateError` before any I/O
    pub fn resolve(config: &ClientConfig, options: &TransferOptions, op_type: OpType) -> Result<Self> {
        let part_size = options.part_size.unwrap_or(config.default_part_size);
        match op_type {
            OpType::Upload | OpType::Copy => validate_upload_part_size(part_size)?,
            OpType::Download => {
                if part_size == 0 || part_size > MAX_PART_SIZE {
                    return Err(VaultError::Validate(format!(
                        "part size {} outside [1, {}]",
                        part_size, MAX_PART_SIZE
                    )));
                }
            }
        }

        let pool = PartWorkerPool::new(options.thread_num.unwrap_or(config.default_thread_num))?;

        let store: Option<Arc<dyn CheckpointStore>> =
            match (&options.checkpoint_store, &options.checkpoint_dir) {
                (Some(store), _) => Some(store.clone()),
                (None, Some(dir)) if !dir.as_os_str().is_empty() => {
                    Some(Arc::new(FileCheckpointStore::open(dir.clone())?))
                }
                _ => None,
            };

        Ok(Self {
            part_size,
            pool,
            limiter: TrafficLimiter::from_limit(options.traffic_limit),
            store,
        })
    }

    pub fn checkpointer(&self, identity: &TransferIdentity) -> Checkpointer {
        Checkpointer {
            store: self.store.clone(),
            fingerprint: identity.fingerprint(),
        }
    }
}

/// Checkpoint access for one transfer; a no-op when persistence is off
pub(crate) struct Checkpointer {
    store: Option<Arc<dyn CheckpointStore>>,
    fingerprint: String,
}

impl Checkpointer {
    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    /// Load the stored record; read failures count as no record
    pub fn load(&self) -> Option<CheckpointRecord> {
        let store = self.store.as_ref()?;
        match store.load(&self.fingerprint) {
            Ok(record) => record,
            Err(e) => {
                warn!("Ignoring checkpoint {}: {}", self.fingerprint, e);
                None
            }
        }
    }

    pub fn save(&self, record: &CheckpointRecord) -> Result<()> {
        match &self.store {
            Some(store) => store.save(&self.fingerprint, record),
            None => Ok(()),
        }
    }

    /// Remove the record; failures are logged, not returned
    pub fn delete(&self) {
        if let Some(store) = &self.store {
            if let Err(e) = store.delete(&self.fingerprint) {
                warn!("Failed to delete checkpoint {}: {}", self.fingerprint, e);
            }
        }
    }
}

/// Run every pending part of `record` on the pool
///
/// Workers report chunk progress through the [`PartProgress`] they are given;
/// whatever a worker leaves unreported is counted when its part succeeds.
/// Results are folded on the calling thread: the part is marked done, the
/// record is persisted, then the part is announced. Returns the bytes moved
/// by this call.
pub(crate) fn run_parts<W>(
    plan: &TransferPlan,
    record: &mut CheckpointRecord,
    checkpointer: &Checkpointer,
    tracker: &ProgressTracker,
    worker: W,
) -> Result<u64>
where
    W: Fn(&PartTask, &PartProgress<'_>) -> Result<PartOutcome> + Sync,
{
    let pending = record.pending_tasks();
    let total_parts = record.parts.len();
    if pending.len() < total_parts {
        debug!("{} of {} parts already done", total_parts - pending.len(), total_parts);
    }

    let span = Span::current();
    let mut moved = 0;
    plan.pool.run(
        pending,
        |task| {
            let _entered = span.enter();
            let progress = tracker.part();
            let outcome = worker(task, &progress)?;
            progress.reach(outcome.size);
            Ok(outcome)
        },
        |outcome| {
            record.mark_done(outcome.part_number, outcome.etag, outcome.crc32)?;
            checkpointer.save(record)?;
            moved += outcome.size;
            tracker.emit(ProgressEvent::PartCompleted {
                part_number: outcome.part_number,
                size: outcome.size,
            });
            debug!("Part {} done ({} bytes)", outcome.part_number, outcome.size);
            Ok(())
        },
    )?;
    Ok(moved)
}

/// Fill `data` one chunk at a time, pacing and reporting each chunk
///
/// `source` fills every chunk given its offset inside `data`.
pub(crate) fn paced_fill<F>(
    limiter: &TrafficLimiter,
    progress: &PartProgress<'_>,
    data: &mut [u8],
    mut source: F,
) -> Result<()>
where
    F: FnMut(u64, &mut [u8]) -> Result<()>,
{
    let mut offset = 0u64;
    for chunk in data.chunks_mut(PROGRESS_CHUNK) {
        limiter.wait_for_capacity(chunk.len() as u64);
        source(offset, chunk)?;
        offset += chunk.len() as u64;
        progress.reach(offset);
    }
    Ok(())
}

/// Pace `data` through the limiter one chunk at a time, reporting each chunk
///
/// `sink` receives every chunk with its offset inside `data`.
pub(crate) fn paced_chunks<F>(
    limiter: &TrafficLimiter,
    progress: &PartProgress<'_>,
    data: &[u8],
    mut sink: F,
) -> Result<()>
where
    F: FnMut(u64, &[u8]) -> Result<()>,
{
    let mut offset = 0u64;
    for chunk in data.chunks(PROGRESS_CHUNK) {
        limiter.wait_for_capacity(chunk.len() as u64);
        sink(offset, chunk)?;
        offset += chunk.len() as u64;
        progress.reach(offset);
    }
    Ok(())
}

/// State logging and start/finish events for one transfer call
pub(crate) struct Lifecycle {
    op_type: OpType,
    bucket: String,
    key: String,
    listener: Option<SharedListener>,
    tracker: Mutex<Option<Arc<ProgressTracker>>>,
    started_at: Instant,
    span: Span,
}

impl Lifecycle {
    pub fn new(op_type: OpType, bucket: &str, key: &str, listener: Option<SharedListener>) -> Self {
        let lifecycle = Self {
            op_type,
            bucket: bucket.to_string(),
            key: key.to_string(),
            listener,
            tracker: Mutex::new(None),
            started_at: Instant::now(),
            span: transfer_span(op_type, bucket, key),
        };
        lifecycle.enter(TransferState::Init);
        lifecycle
    }

    /// Run `body` inside the transfer span
    pub fn in_span<T>(&self, body: impl FnOnce() -> T) -> T {
        self.span.in_scope(body)
    }

    pub fn enter(&self, state: TransferState) {
        debug!("{} {}/{}: {}", self.op_type, self.bucket, self.key, state);
    }

    /// Byte tracker of the transfer, created and announced on first use
    pub fn tracker(&self, total_bytes: u64, resumed_bytes: u64) -> Arc<ProgressTracker> {
        let mut slot = self.tracker.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tracker) = slot.as_ref() {
            return tracker.clone();
        }
        let tracker = Arc::new(ProgressTracker::new(
            self.listener.clone(),
            total_bytes,
            resumed_bytes,
        ));
        tracker.emit(ProgressEvent::TransferStarted {
            bucket: self.bucket.clone(),
            key: self.key.clone(),
            total_bytes,
            resumed_bytes,
            timestamp: ProgressEvent::current_timestamp(),
        });
        *slot = Some(tracker.clone());
        tracker
    }

    /// Drop the byte tracker after the transfer starts over from scratch
    ///
    /// The next [`Lifecycle::tracker`] call announces a new `TransferStarted`
    /// and counts from its own starting point.
    pub fn restart(&self) {
        *self.tracker.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn current_tracker(&self) -> Option<Arc<ProgressTracker>> {
        self.tracker.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Report the result of the transfer and pass it through
    pub fn finish(&self, result: Result<TransferOutcome>) -> Result<TransferOutcome> {
        let duration_ms = self.started_at.elapsed().as_millis() as u64;
        let timestamp = ProgressEvent::current_timestamp();
        match &result {
            Ok(outcome) => {
                self.enter(TransferState::Done);
                info!(
                    "{} {}/{} done: {} bytes in {} ms ({} moved{})",
                    self.op_type,
                    self.bucket,
                    self.key,
                    outcome.total_bytes,
                    duration_ms,
                    outcome.transferred_bytes,
                    if outcome.resumed { ", resumed" } else { "" }
                );
                self.emit(ProgressEvent::TransferCompleted {
                    total_bytes: outcome.total_bytes,
                    duration_ms,
                    timestamp,
                });
            }
            Err(e) => {
                let state = match e.root() {
                    VaultError::ClientDisabled | VaultError::Cancelled => TransferState::Aborted,
                    _ => TransferState::Failed,
                };
                self.enter(state);
                error!(
                    "{} {}/{} {} after {} ms: {}",
                    self.op_type, self.bucket, self.key, state, duration_ms, e
                );
                self.emit(ProgressEvent::TransferFailed {
                    code: e.code().to_string(),
                    error: e.to_string(),
                    transferred_bytes: self.current_tracker().map(|t| t.transferred()).unwrap_or(0),
                    timestamp,
                });
            }
        }
        result
    }

    fn emit(&self, event: ProgressEvent) {
        match self.current_tracker() {
            Some(tracker) => tracker.emit(event),
            None => {
                if let Some(listener) = &self.listener {
                    listener.on_event(&event);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::partition::{partition, MIN_PART_SIZE};
    use crate::progress::ChannelReporter;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn options() -> TransferOptions {
        TransferOptions::default()
    }

    #[test]
    fn test_resolve_defaults() {
        let config = ClientConfig::default();
        let plan = TransferPlan::resolve(&config, &options(), OpType::Upload).unwrap();
        assert_eq!(plan.part_size, config.default_part_size);
        assert_eq!(plan.pool.thread_num(), config.default_thread_num);
        assert!(!plan.limiter.is_enabled());
        assert!(!plan.checkpointer(&TransferIdentity::new(OpType::Upload, "b", "k")).is_enabled());
    }

    #[test]
    fn test_resolve_rejects_bad_options() {
        let config = ClientConfig::default();

        let small = TransferOptions {
            part_size: Some(MIN_PART_SIZE - 1),
            ..options()
        };
        let err = TransferPlan::resolve(&config, &small, OpType::Upload).err().unwrap();
        assert_eq!(err.code(), "ValidateError");
        // Downloads may use any positive part size
        assert!(TransferPlan::resolve(&config, &small, OpType::Download).is_ok());

        let zero_threads = TransferOptions {
            thread_num: Some(0),
            ..options()
        };
        let err = TransferPlan::resolve(&config, &zero_threads, OpType::Download).err().unwrap();
        assert_eq!(err.code(), "ValidateError");

        let missing_dir = TransferOptions {
            checkpoint_dir: Some(PathBuf::from("/nonexistent/objvault/checkpoints")),
            ..options()
        };
        let err = TransferPlan::resolve(&config, &missing_dir, OpType::Upload).err().unwrap();
        assert_eq!(err.code(), "ValidateError");
    }

    #[test]
    fn test_empty_checkpoint_dir_disables_persistence() {
        let empty = TransferOptions {
            checkpoint_dir: Some(PathBuf::new()),
            ..options()
        };
        let plan = TransferPlan::resolve(&ClientConfig::default(), &empty, OpType::Upload).unwrap();
        let checkpointer = plan.checkpointer(&TransferIdentity::new(OpType::Upload, "b", "k"));
        assert!(!checkpointer.is_enabled());
        assert!(checkpointer.load().is_none());
    }

    #[test]
    fn test_checkpoint_dir_store() {
        let dir = TempDir::new().unwrap();
        let with_dir = TransferOptions {
            checkpoint_dir: Some(dir.path().to_path_buf()),
            ..options()
        };
        let plan = TransferPlan::resolve(&ClientConfig::default(), &with_dir, OpType::Upload).unwrap();
        let checkpointer = plan.checkpointer(&TransferIdentity::new(OpType::Upload, "b", "k"));

        let record = CheckpointRecord::new(OpType::Upload, "b", "k", 10, &partition(25, 10).unwrap());
        checkpointer.save(&record).unwrap();
        assert_eq!(checkpointer.load().unwrap().parts.len(), 3);
        checkpointer.delete();
        assert!(checkpointer.load().is_none());
    }

    #[test]
    fn test_run_parts_folds_and_persists() {
        crate::logging::init_test_logging();
        let store = Arc::new(MemoryCheckpointStore::new());
        let opts = TransferOptions {
            thread_num: Some(3),
            part_size: Some(10),
            checkpoint_store: Some(store.clone()),
            ..options()
        };
        let plan = TransferPlan::resolve(&ClientConfig::default(), &opts, OpType::Download).unwrap();
        let identity = TransferIdentity::new(OpType::Download, "b", "k");
        let checkpointer = plan.checkpointer(&identity);

        let mut record =
            CheckpointRecord::new(OpType::Download, "b", "k", 10, &partition(95, 10).unwrap());
        record.mark_done(1, None, Some(0)).unwrap();

        let (reporter, rx) = ChannelReporter::unbounded();
        let tracker = ProgressTracker::new(Some(Arc::new(reporter)), 95, 10);
        let moved = run_parts(&plan, &mut record, &checkpointer, &tracker, |task, _| {
            assert_ne!(task.part_number, 1);
            Ok(PartOutcome {
                part_number: task.part_number,
                size: task.length,
                etag: Some(format!("e{}", task.part_number)),
                crc32: Some(task.part_number),
            })
        })
        .unwrap();

        assert_eq!(moved, 85);
        assert!(record.is_complete());
        assert_eq!(tracker.transferred(), 95);
        let saved = store.load(&identity.fingerprint()).unwrap().unwrap();
        assert!(saved.is_complete());

        let parts_reported = rx
            .try_iter()
            .filter(|e| matches!(e, ProgressEvent::PartCompleted { .. }))
            .count();
        assert_eq!(parts_reported, 9);
    }

    #[test]
    fn test_run_parts_keeps_done_parts_on_failure() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let opts = TransferOptions {
            thread_num: Some(1),
            part_size: Some(10),
            checkpoint_store: Some(store.clone()),
            ..options()
        };
        let plan = TransferPlan::resolve(&ClientConfig::default(), &opts, OpType::Download).unwrap();
        let identity = TransferIdentity::new(OpType::Download, "b", "k");
        let checkpointer = plan.checkpointer(&identity);
        let mut record =
            CheckpointRecord::new(OpType::Download, "b", "k", 10, &partition(50, 10).unwrap());
        let tracker = ProgressTracker::new(None, 50, 0);

        let err = run_parts(&plan, &mut record, &checkpointer, &tracker, |task, _| {
            if task.part_number == 3 {
                return Err(VaultError::Network("reset".into()));
            }
            Ok(PartOutcome {
                part_number: task.part_number,
                size: task.length,
                etag: None,
                crc32: None,
            })
        })
        .unwrap_err();
        assert_eq!(err.code(), "NetworkError");

        let saved = store.load(&identity.fingerprint()).unwrap().unwrap();
        let pending: Vec<u32> = saved.pending_tasks().iter().map(|t| t.part_number).collect();
        assert_eq!(pending, vec![3, 4, 5]);
    }

    #[test]
    fn test_paced_chunks_report_inside_a_part() {
        let (reporter, rx) = ChannelReporter::unbounded();
        let tracker = ProgressTracker::new(Some(Arc::new(reporter)), 150_000, 0);
        let data = vec![7u8; 150_000];
        let mut offsets = Vec::new();

        let progress = tracker.part();
        paced_chunks(&TrafficLimiter::unlimited(), &progress, &data, |offset, chunk| {
            offsets.push((offset, chunk.len()));
            Ok(())
        })
        .unwrap();

        assert_eq!(
            offsets,
            vec![(0, PROGRESS_CHUNK), (65_536, PROGRESS_CHUNK), (131_072, 18_928)]
        );
        let counts: Vec<u64> = rx
            .try_iter()
            .filter_map(|e| match e {
                ProgressEvent::BytesTransferred {
                    transferred_bytes, ..
                } => Some(transferred_bytes),
                _ => None,
            })
            .collect();
        assert_eq!(counts, vec![65_536, 131_072, 150_000]);
    }

    #[test]
    fn test_run_parts_counts_unreported_remainder() {
        let opts = TransferOptions {
            thread_num: Some(2),
            part_size: Some(100),
            ..options()
        };
        let plan = TransferPlan::resolve(&ClientConfig::default(), &opts, OpType::Download).unwrap();
        let checkpointer = plan.checkpointer(&TransferIdentity::new(OpType::Download, "b", "k"));
        let mut record =
            CheckpointRecord::new(OpType::Download, "b", "k", 100, &partition(400, 100).unwrap());
        let tracker = ProgressTracker::new(None, 400, 0);

        run_parts(&plan, &mut record, &checkpointer, &tracker, |task, progress| {
            // Half the part reported mid-way, the rest left to the runner
            progress.reach(task.length / 2);
            Ok(PartOutcome {
                part_number: task.part_number,
                size: task.length,
                etag: None,
                crc32: None,
            })
        })
        .unwrap();
        assert_eq!(tracker.transferred(), 400);
    }

    #[test]
    fn test_lifecycle_restart_announces_a_new_start() {
        let (reporter, rx) = ChannelReporter::unbounded();
        let lifecycle = Lifecycle::new(OpType::Upload, "b", "k", Some(Arc::new(reporter)));
        lifecycle.tracker(100, 80).add(10);
        lifecycle.restart();
        let tracker = lifecycle.tracker(100, 0);
        assert_eq!(tracker.transferred(), 0);
        tracker.add(100);

        let starts: Vec<u64> = rx
            .try_iter()
            .filter_map(|e| match e {
                ProgressEvent::TransferStarted { resumed_bytes, .. } => Some(resumed_bytes),
                _ => None,
            })
            .collect();
        assert_eq!(starts, vec![80, 0]);
    }

    #[test]
    fn test_lifecycle_events() {
        let (reporter, rx) = ChannelReporter::unbounded();
        let lifecycle = Lifecycle::new(OpType::Upload, "b", "k", Some(Arc::new(reporter)));
        lifecycle.tracker(100, 40).add(60);
        let result = lifecycle.finish(Err(VaultError::ClientDisabled));
        assert!(result.is_err());

        let events: Vec<_> = rx.try_iter().collect();
        assert!(matches!(
            events[0],
            ProgressEvent::TransferStarted {
                total_bytes: 100,
                resumed_bytes: 40,
                ..
            }
        ));
        match events.last().unwrap() {
            ProgressEvent::TransferFailed {
                code,
                transferred_bytes,
                ..
            } => {
                assert_eq!(code, "ClientDisabled");
                assert_eq!(*transferred_bytes, 100);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
