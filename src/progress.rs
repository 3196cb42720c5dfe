/*!
 * Progress events for transfers
 *
 * Listeners receive a monotonically increasing byte counter per transfer,
 * plus start/part/finish notifications. Events can be delivered to a closure
 * or to a crossbeam channel.
 */

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::cell::Cell;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

/// Progress event types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// Transfer started; `total_bytes` is known upfront
    TransferStarted {
        bucket: String,
        key: String,
        total_bytes: u64,
        resumed_bytes: u64,
        timestamp: u64,
    },

    /// Bytes moved; `transferred_bytes` never decreases
    BytesTransferred {
        transferred_bytes: u64,
        total_bytes: u64,
    },

    /// One part finished
    PartCompleted { part_number: u32, size: u64 },

    /// Transfer completed successfully
    TransferCompleted {
        total_bytes: u64,
        duration_ms: u64,
        timestamp: u64,
    },

    /// Transfer failed
    TransferFailed {
        code: String,
        error: String,
        transferred_bytes: u64,
        timestamp: u64,
    },
}

impl ProgressEvent {
    pub(crate) fn current_timestamp() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Receives progress events; called from worker threads
pub trait ProgressListener: Send + Sync {
    fn on_event(&self, event: &ProgressEvent);
}

impl<F> ProgressListener for F
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn on_event(&self, event: &ProgressEvent) {
        self(event)
    }
}

/// Listener that forwards events into a channel
#[derive(Clone)]
pub struct ChannelReporter {
    sender: Sender<ProgressEvent>,
}

impl ChannelReporter {
    /// Create a reporter with a bounded channel
    pub fn new(buffer_size: usize) -> (Self, Receiver<ProgressEvent>) {
        let (tx, rx) = bounded(buffer_size);
        (ChannelReporter { sender: tx }, rx)
    }

    /// Create a reporter with an unbounded channel
    pub fn unbounded() -> (Self, Receiver<ProgressEvent>) {
        let (tx, rx) = unbounded();
        (ChannelReporter { sender: tx }, rx)
    }
}

impl ProgressListener for ChannelReporter {
    fn on_event(&self, event: &ProgressEvent) {
        // Receiver may have been dropped
        let _ = self.sender.try_send(event.clone());
    }
}

/// Shared listener handle carried by transfer requests
pub type SharedListener = Arc<dyn ProgressListener>;

/// Per-transfer byte counter that serializes progress reporting
pub struct ProgressTracker {
    listener: Option<SharedListener>,
    total_bytes: u64,
    transferred: Mutex<u64>,
}

impl ProgressTracker {
    /// Create a tracker starting at `already_transferred` bytes
    pub fn new(listener: Option<SharedListener>, total_bytes: u64, already_transferred: u64) -> Self {
        Self {
            listener,
            total_bytes,
            transferred: Mutex::new(already_transferred),
        }
    }

    /// Total bytes of the transfer
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Bytes reported so far
    pub fn transferred(&self) -> u64 {
        *self.transferred.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record `bytes` more and notify the listener
    ///
    /// The lock is held while notifying so listeners observe a strictly
    /// ordered counter even when several workers report at once.
    pub fn add(&self, bytes: u64) {
        let mut transferred = self.transferred.lock().unwrap_or_else(|e| e.into_inner());
        *transferred = (*transferred + bytes).min(self.total_bytes);
        if let Some(listener) = &self.listener {
            listener.on_event(&ProgressEvent::BytesTransferred {
                transferred_bytes: *transferred,
                total_bytes: self.total_bytes,
            });
        }
    }

    /// Forward any other event
    pub fn emit(&self, event: ProgressEvent) {
        if let Some(listener) = &self.listener {
            listener.on_event(&event);
        }
    }

    /// Start reporting the bytes of one part
    pub fn part(&self) -> PartProgress<'_> {
        PartProgress {
            tracker: self,
            reported: Cell::new(0),
        }
    }
}

/// Chunk-level progress of a single part
///
/// Positions are relative to the part. Only bytes past the highest position
/// reached so far are added to the tracker, so a retried part never counts
/// its bytes twice.
pub struct PartProgress<'a> {
    tracker: &'a ProgressTracker,
    reported: Cell<u64>,
}

impl PartProgress<'_> {
    /// Record that the part has moved up to `position` bytes
    pub fn reach(&self, position: u64) {
        let reported = self.reported.get();
        if position > reported {
            self.reported.set(position);
            self.tracker.add(position - reported);
        }
    }

    /// Bytes of this part reported so far
    pub fn reported(&self) -> u64 {
        self.reported.get()
    }
}
