//! Asynchronous single-call API
//!
//! [`TransferClient::spawn`] queues one operation on the client's task
//! threads and returns a [`TaskHandle`] that resolves exactly once: with the
//! operation's result, with `Cancelled`, or with `ClientDisabled` when the
//! client was disabled before the operation started.

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::{GetObjectOptions, GetObjectOutput, TransferClient, WriteOutput};
use crate::error::{Result, VaultError};
use crate::transfer::{DownloadRequest, TransferOutcome, UploadRequest};
use crate::types::ObjectMetadata;

enum Slot<T> {
    Pending,
    Ready(Result<T>),
    Taken,
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store the outcome unless one is already stored
    fn resolve(&self, outcome: Result<T>) -> bool {
        let mut slot = self.lock();
        if !matches!(*slot, Slot::Pending) {
            return false;
        }
        *slot = Slot::Ready(outcome);
        self.ready.notify_all();
        true
    }
}

/// Handle to an operation running in the background
pub struct TaskHandle<T> {
    shared: Arc<Shared<T>>,
}

impl<T> TaskHandle<T> {
    fn pending() -> Self {
        Self {
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot::Pending),
                ready: Condvar::new(),
            }),
        }
    }

    fn resolved(outcome: Result<T>) -> Self {
        let handle = Self::pending();
        handle.shared.resolve(outcome);
        handle
    }

    /// True once the handle holds an outcome
    pub fn is_finished(&self) -> bool {
        !matches!(*self.shared.lock(), Slot::Pending)
    }

    /// Resolve the handle with `Cancelled` if it has no outcome yet
    ///
    /// An operation already running keeps running, but its result is
    /// discarded. Returns false when the handle was already resolved.
    pub fn cancel(&self) -> bool {
        let cancelled = self.shared.resolve(Err(VaultError::Cancelled));
        if cancelled {
            debug!("Task cancelled");
        }
        cancelled
    }

    /// Block until the outcome is available
    pub fn wait(self) -> Result<T> {
        let mut slot = self.shared.lock();
        loop {
            match std::mem::replace(&mut *slot, Slot::Taken) {
                Slot::Ready(outcome) => return outcome,
                Slot::Pending => {
                    *slot = Slot::Pending;
                    slot = self
                        .shared
                        .ready
                        .wait(slot)
                        .unwrap_or_else(|e| e.into_inner());
                }
                // Waiting consumes the only handle, so this is never observed
                Slot::Taken => return Err(VaultError::Cancelled),
            }
        }
    }

    /// Wait up to `timeout`; on timeout the handle is given back
    pub fn wait_timeout(self, timeout: Duration) -> std::result::Result<Result<T>, Self> {
        let deadline = Instant::now() + timeout;
        {
            let mut slot = self.shared.lock();
            loop {
                if !matches!(*slot, Slot::Pending) {
                    break;
                }
                let now = Instant::now();
                if now >= deadline {
                    drop(slot);
                    return Err(self);
                }
                let (guard, _) = self
                    .shared
                    .ready
                    .wait_timeout(slot, deadline - now)
                    .unwrap_or_else(|e| e.into_inner());
                slot = guard;
            }
        }
        Ok(self.wait())
    }
}

impl<T> std::fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("finished", &self.is_finished())
            .finish()
    }
}

type Job = Box<dyn FnOnce() + Send>;

/// Fixed set of threads draining a queue of async calls
///
/// Threads start on first use and exit once every client clone is gone and
/// the queue is empty.
pub(crate) struct TaskExecutor {
    sender: Sender<Job>,
    receiver: Receiver<Job>,
    thread_num: usize,
    started: Mutex<usize>,
}

impl TaskExecutor {
    pub fn new(thread_num: usize) -> Self {
        let (sender, receiver) = unbounded();
        Self {
            sender,
            receiver,
            thread_num: thread_num.max(1),
            started: Mutex::new(0),
        }
    }

    /// Queue `job`, starting threads up to the configured count
    pub fn submit(&self, job: Job) -> Result<()> {
        self.ensure_started()?;
        self.sender
            .send(job)
            .map_err(|_| VaultError::Io("task queue closed".to_string()))
    }

    fn ensure_started(&self) -> Result<()> {
        let mut started = self.started.lock().unwrap_or_else(|e| e.into_inner());
        while *started < self.thread_num {
            let receiver = self.receiver.clone();
            let spawned = thread::Builder::new()
                .name(format!("objvault-task-{}", *started))
                .spawn(move || {
                    for job in receiver.iter() {
                        job();
                    }
                });
            match spawned {
                Ok(_) => *started += 1,
                Err(e) if *started == 0 => {
                    return Err(VaultError::Io(format!("cannot spawn task thread: {}", e)));
                }
                Err(e) => {
                    warn!("Running async calls on {} threads: {}", *started, e);
                    break;
                }
            }
        }
        Ok(())
    }
}

impl TransferClient {
    /// Queue `operation` on the client's task threads
    ///
    /// A disabled client resolves the handle with `ClientDisabled` at once. The
    /// gate is checked again when the operation starts, so calls queued before
    /// a disable fail fast too.
    pub fn spawn<T, F>(&self, operation: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(&TransferClient) -> Result<T> + Send + 'static,
    {
        if let Err(e) = self.gate().check() {
            return TaskHandle::resolved(Err(e));
        }

        let handle = TaskHandle::pending();
        let shared = handle.shared.clone();
        let client = self.clone();
        let job = Box::new(move || {
            // Cancelled before it started
            if !matches!(*shared.lock(), Slot::Pending) {
                return;
            }
            let outcome = client.gate().check().and_then(|_| operation(&client));
            shared.resolve(outcome);
        });
        if let Err(e) = self.inner.executor.submit(job) {
            handle.shared.resolve(Err(e));
        }
        handle
    }

    pub fn put_object_async(
        &self,
        bucket: &str,
        key: &str,
        data: Vec<u8>,
        metadata: ObjectMetadata,
    ) -> TaskHandle<WriteOutput> {
        let (bucket, key) = (bucket.to_string(), key.to_string());
        self.spawn(move |client| client.put_object(&bucket, &key, data, &metadata))
    }

    pub fn get_object_async(
        &self,
        bucket: &str,
        key: &str,
        options: GetObjectOptions,
    ) -> TaskHandle<GetObjectOutput> {
        let (bucket, key) = (bucket.to_string(), key.to_string());
        self.spawn(move |client| client.get_object(&bucket, &key, &options))
    }

    pub fn resumable_upload_async(&self, request: UploadRequest) -> TaskHandle<TransferOutcome> {
        self.spawn(move |client| client.resumable_upload(&request))
    }

    pub fn resumable_download_async(&self, request: DownloadRequest) -> TaskHandle<TransferOutcome> {
        self.spawn(move |client| client.resumable_download(&request))
    }

    /// Upload a local file in the background with a single request
    pub fn put_file_async(
        &self,
        bucket: &str,
        key: &str,
        path: PathBuf,
        metadata: ObjectMetadata,
    ) -> TaskHandle<WriteOutput> {
        let (bucket, key) = (bucket.to_string(), key.to_string());
        self.spawn(move |client| client.put_object_from_file(&bucket, &key, &path, &metadata))
    }
}
