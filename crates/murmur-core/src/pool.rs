use std::{
    io,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
};

use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size worker pool with an unbounded FIFO queue. Exists so the
/// reactor thread never blocks on handler code: it only ever enqueues.
pub struct WorkerPool {
    tx: Sender<Job>,
    stop: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// 2x the hardware parallelism, at least one.
pub fn default_workers() -> usize {
    thread::available_parallelism().map_or(1, |n| n.get() * 2)
}

impl WorkerPool {
    pub fn new(size: usize) -> io::Result<Self> {
        let size = size.max(1);
        let (tx, rx) = unbounded::<Job>();
        let stop = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(size);
        for i in 0..size {
            let rx = rx.clone();
            let stop = stop.clone();
            let handle = thread::Builder::new()
                .name(format!("murmur-worker-{i}"))
                .spawn(move || worker_loop(&rx, &stop))?;
            workers.push(handle);
        }
        debug!(size, "pool: started");
        Ok(Self { tx, stop, workers: Mutex::new(workers) })
    }

    /// Enqueues a task. Dropped silently after shutdown.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        if self.stop.load(Ordering::Acquire) {
            return;
        }
        let _ = self.tx.send(Box::new(job));
    }

    /// Signals stop, wakes every worker and joins them. Tasks still queued
    /// are discarded, not run. Idempotent.
    pub fn shutdown(&self) {
        if self.stop.swap(true, Ordering::AcqRel) {
            return;
        }
        let workers = std::mem::take(&mut *crate::guard(&self.workers));
        // One no-op per worker so blocked receives return and see the flag.
        for _ in &workers {
            let _ = self.tx.send(Box::new(|| {}));
        }
        for handle in workers {
            let _ = handle.join();
        }
        debug!("pool: stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(rx: &Receiver<Job>, stop: &AtomicBool) {
    while let Ok(job) = rx.recv() {
        if stop.load(Ordering::Acquire) {
            break;
        }
        // A panicking task must not take the worker down with it.
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!("pool: task panicked");
        }
    }
}
