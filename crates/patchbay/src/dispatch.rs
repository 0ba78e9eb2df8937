//! Main-thread execution dispatcher.
//!
//! Socket I/O and handler execution are decoupled: the connector's read
//! loop enqueues jobs here, and the host's own cooperative scheduler
//! drains them by calling `tick()` from its single-threaded hook. A slow
//! handler therefore never blocks reads, and handler bodies only ever
//! run where host-owned state is safe to touch.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

pub type Job = Box<dyn FnOnce() + Send>;

/// Batch cap per tick so one burst cannot starve the host's scheduling.
const MAX_JOBS_PER_TICK: usize = 512;

pub struct MainThreadQueue {
    jobs: Mutex<VecDeque<Job>>,
    installed: AtomicBool,
}

impl MainThreadQueue {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(VecDeque::new()),
            installed: AtomicBool::new(false),
        }
    }

    /// Mark the queue as wired into the host's tick hook. Until then,
    /// `enqueue` drops jobs loudly instead of letting them sit forever;
    /// the hub-side call deadline turns the drop into a timeout error.
    pub fn install(&self) {
        self.installed.store(true, Ordering::SeqCst);
    }

    pub fn installed(&self) -> bool {
        self.installed.load(Ordering::SeqCst)
    }

    pub fn enqueue(&self, job: Job) {
        if !self.installed() {
            tracing::error!("Dispatcher not installed, dropping job");
            return;
        }
        let mut jobs = self.jobs.lock().unwrap_or_else(|p| p.into_inner());
        jobs.push_back(job);
    }

    /// Drain and run up to `MAX_JOBS_PER_TICK` queued jobs. A panicking
    /// job is logged and does not stop the drain. Returns the number of
    /// jobs run.
    pub fn tick(&self) -> usize {
        let mut ran = 0;
        while ran < MAX_JOBS_PER_TICK {
            let job = {
                let mut jobs = self.jobs.lock().unwrap_or_else(|p| p.into_inner());
                jobs.pop_front()
            };
            let Some(job) = job else { break };

            if std::panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                tracing::error!("Dispatched job panicked");
            }
            ran += 1;
        }
        ran
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MainThreadQueue {
    fn default() -> Self {
        Self::new()
    }
}
