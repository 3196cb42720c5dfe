/*!
 * Part Worker Pool
 *
 * A bounded set of OS threads pulling part tasks from a shared queue. Results
 * flow back over a channel to the calling thread, which is the only place
 * they are folded into transfer state.
 */

use crossbeam_channel::unbounded;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tracing::debug;

use crate::error::{Result, VaultError};

/// Bounded-concurrency executor for part tasks
#[derive(Debug, Clone, Copy)]
pub struct PartWorkerPool {
    thread_num: usize,
}

impl PartWorkerPool {
    /// Create a pool with `thread_num` workers
    pub fn new(thread_num: usize) -> Result<Self> {
        if thread_num == 0 {
            return Err(VaultError::Validate(
                "thread count must be at least 1".to_string(),
            ));
        }
        Ok(Self { thread_num })
    }

    /// Configured worker count
    pub fn thread_num(&self) -> usize {
        self.thread_num
    }

    /// Run `worker` over every task
    ///
    /// `on_complete` runs on the calling thread for each successful result, in
    /// completion order. After the first failure no further tasks are started;
    /// tasks already running finish and their successes are still folded. The
    /// first failure is returned.
    pub fn run<T, R, W, C>(&self, tasks: Vec<T>, worker: W, mut on_complete: C) -> Result<()>
    where
        T: Send,
        R: Send,
        W: Fn(&T) -> Result<R> + Sync,
        C: FnMut(R) -> Result<()>,
    {
        if tasks.is_empty() {
            return Ok(());
        }

        // Surplus threads would only sit idle
        let workers = self.thread_num.min(tasks.len());
        debug!("Dispatching {} tasks to {} workers", tasks.len(), workers);

        let (task_tx, task_rx) = unbounded();
        for task in tasks {
            // Receiver is alive for the duration of this call
            let _ = task_tx.send(task);
        }
        drop(task_tx);

        let (result_tx, result_rx) = unbounded();
        let stop = AtomicBool::new(false);
        let mut first_error: Option<VaultError> = None;

        thread::scope(|scope| {
            for _ in 0..workers {
                let task_rx = task_rx.clone();
                let result_tx = result_tx.clone();
                let stop = &stop;
                let worker = &worker;
                scope.spawn(move || {
                    while !stop.load(Ordering::SeqCst) {
                        let Ok(task) = task_rx.recv() else {
                            break;
                        };
                        let result = worker(&task);
                        if result.is_err() {
                            stop.store(true, Ordering::SeqCst);
                        }
                        if result_tx.send(result).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(result_tx);

            for result in result_rx.iter() {
                let outcome = result.and_then(&mut on_complete);
                if let Err(e) = outcome {
                    stop.store(true, Ordering::SeqCst);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        });

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
