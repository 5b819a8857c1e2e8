//! Background deletion of files nothing references any more.
//!
//! Dropped collections and the inputs of a finished compaction are handed to
//! a single worker thread so the caller never waits for the deletes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::{Condvar, Mutex};

use crate::error::{QuiverError, Result};
use crate::segment::SegmentStore;
use crate::storage::{PrefixedStorage, Storage};

/// A unit of deletion work.
#[derive(Debug, Clone)]
pub enum GcTask {
    /// Data and index files of sealed segments, relative to `storage`.
    SegmentFiles {
        storage: Arc<dyn Storage>,
        segment_ids: Vec<u64>,
    },
    /// Every file under `prefix` of `root`.
    Collection {
        root: Arc<dyn Storage>,
        prefix: String,
    },
}

impl GcTask {
    /// Run the task on the current thread. Returns the number of files removed.
    pub fn run(&self) -> Result<usize> {
        match self {
            GcTask::SegmentFiles {
                storage,
                segment_ids,
            } => {
                for id in segment_ids {
                    SegmentStore::delete_segment_files(storage.as_ref(), *id)?;
                }
                log::debug!("Deleted files of segments {segment_ids:?}");
                Ok(segment_ids.len())
            }
            GcTask::Collection { root, prefix } => {
                let scoped = PrefixedStorage::new(prefix.clone(), root.clone());
                let files = scoped.list_files()?;
                for name in &files {
                    scoped.delete_file(name)?;
                }
                log::info!("Deleted {} files under {prefix}", files.len());
                Ok(files.len())
            }
        }
    }
}

#[derive(Debug)]
struct Shared {
    /// Tasks queued or running.
    pending: Mutex<usize>,
    /// Notified when `pending` drops to zero.
    idle: Condvar,
    running: AtomicBool,
}

impl Shared {
    fn task_done(&self) {
        let mut pending = self.pending.lock();
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.idle.notify_all();
        }
    }
}

/// Cheap handle for submitting tasks.
#[derive(Debug, Clone)]
pub struct GcQueue {
    sender: Sender<GcTask>,
    shared: Arc<Shared>,
}

impl GcQueue {
    /// Queue `task`. When the worker is gone the task runs inline.
    pub fn submit(&self, task: GcTask) {
        *self.shared.pending.lock() += 1;
        if let Err(err) = self.sender.send(task) {
            self.shared.task_done();
            if let Err(err) = err.into_inner().run() {
                log::warn!("Garbage collection failed: {err}");
            }
        }
    }

    /// Tasks queued or running.
    pub fn pending(&self) -> usize {
        *self.shared.pending.lock()
    }
}

/// Owner of the deletion worker thread.
#[derive(Debug)]
pub struct GarbageCollector {
    queue: GcQueue,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl GarbageCollector {
    pub fn start() -> Result<Self> {
        let (sender, receiver) = unbounded();
        let shared = Arc::new(Shared {
            pending: Mutex::new(0),
            idle: Condvar::new(),
            running: AtomicBool::new(true),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("quiver-gc".to_string())
            .spawn(move || run_worker(receiver, worker_shared))
            .map_err(|e| QuiverError::internal(format!("Failed to spawn gc worker: {e}")))?;

        Ok(GarbageCollector {
            queue: GcQueue { sender, shared },
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn queue(&self) -> GcQueue {
        self.queue.clone()
    }

    pub fn submit(&self, task: GcTask) {
        self.queue.submit(task);
    }

    pub fn pending(&self) -> usize {
        self.queue.pending()
    }

    /// Wait until every queued task has run. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let shared = &self.queue.shared;
        let mut pending = shared.pending.lock();
        while *pending > 0 {
            if shared.idle.wait_until(&mut pending, deadline).timed_out() {
                return *pending == 0;
            }
        }
        true
    }

    /// Finish queued tasks and stop the worker.
    pub fn shutdown(&self) {
        self.queue.shared.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                log::error!("Garbage collection worker panicked");
            }
        }
    }
}

impl Drop for GarbageCollector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(receiver: Receiver<GcTask>, shared: Arc<Shared>) {
    loop {
        match receiver.recv_timeout(Duration::from_millis(100)) {
            Ok(task) => {
                if let Err(err) = task.run() {
                    log::warn!("Garbage collection failed: {err}");
                }
                shared.task_done();
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                if !shared.running.load(Ordering::Acquire) && receiver.is_empty() {
                    break;
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }
}
