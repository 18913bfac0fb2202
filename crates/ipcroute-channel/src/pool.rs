use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle};

use tracing::{debug, error};

use crate::sync::lock;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Minimum size of the shared pool.
const MIN_SHARED_WORKERS: usize = 4;

/// Fixed set of named worker threads fed from one job queue.
///
/// Panicking jobs are caught and logged; the worker keeps running. If no
/// worker thread could be spawned, jobs run inline on the caller's thread.
pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let receiver = Arc::clone(&receiver);
            match thread::Builder::new()
                .name(format!("ipcroute-worker-{index}"))
                .spawn(move || worker_loop(&receiver))
            {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    error!(error = %err, index, "failed to spawn worker thread");
                    break;
                }
            }
        }
        debug!(workers = workers.len(), "worker pool started");

        Self {
            sender: (!workers.is_empty()).then_some(sender),
            workers,
        }
    }

    /// Process-wide pool, created on first use.
    pub fn shared() -> &'static WorkerPool {
        static SHARED: OnceLock<WorkerPool> = OnceLock::new();
        SHARED.get_or_init(|| {
            let size = thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(MIN_SHARED_WORKERS)
                .max(MIN_SHARED_WORKERS);
            WorkerPool::new(size)
        })
    }

    /// Run `job` on a worker.
    pub fn spawn(&self, job: impl FnOnce() + Send + 'static) {
        let job: Job = Box::new(job);
        match &self.sender {
            Some(sender) => {
                if let Err(mpsc::SendError(job)) = sender.send(job) {
                    run_job(job);
                }
            }
            None => run_job(job),
        }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.sender.take();
        let current = thread::current().id();
        for handle in self.workers.drain(..) {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}

fn worker_loop(receiver: &Mutex<Receiver<Job>>) {
    loop {
        let job = lock(receiver).recv();
        match job {
            Ok(job) => run_job(job),
            Err(_) => return,
        }
    }
}

fn run_job(job: Job) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(job)) {
        error!(panic = %panic_message(panic.as_ref()), "worker job panicked");
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}
