//! Periodic Scheduler
//!
//! A registry of named background jobs run at fixed intervals on one worker
//! thread: database flush, task GC, auto-scan, health checks. Job failures
//! are logged, never fatal.

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

type JobFn = Arc<dyn Fn() + Send + Sync>;

struct Job {
    name: String,
    interval: Duration,
    next_due: Instant,
    f: JobFn,
}

/// Named periodic background jobs
pub struct PeriodicScheduler {
    jobs: Arc<Mutex<Vec<Job>>>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicScheduler {
    pub fn new() -> Self {
        Self {
            jobs: Arc::new(Mutex::new(Vec::new())),
            shutdown_tx: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    /// Register a job; the first run happens one interval from now
    pub fn register<F>(&self, name: &str, interval: Duration, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut jobs = self.jobs.lock();
        log::debug!("scheduler job registered: {} every {:?}", name, interval);
        jobs.push(Job {
            name: name.to_string(),
            interval,
            next_due: Instant::now() + interval,
            f: Arc::new(f),
        });
    }

    /// Start the worker thread
    pub fn start(&self) {
        let (tx, rx) = bounded(1);
        *self.shutdown_tx.lock() = Some(tx);
        let jobs = self.jobs.clone();
        let handle = std::thread::Builder::new()
            .name("periodic-scheduler".to_string())
            .spawn(move || run_loop(jobs, rx))
            .expect("spawning scheduler thread");
        *self.handle.lock() = Some(handle);
    }

    /// Stop the worker thread and wait for it
    pub fn stop(&self) {
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    pub fn job_count(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Run every job whose deadline has passed; used by tests and by the
    /// worker loop
    pub fn tick(&self) {
        run_due(&self.jobs);
    }
}

impl Default for PeriodicScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PeriodicScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(jobs: Arc<Mutex<Vec<Job>>>, shutdown: Receiver<()>) {
    loop {
        let sleep = next_deadline(&jobs)
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::from_secs(1))
            .min(Duration::from_secs(1));
        match shutdown.recv_timeout(sleep) {
            Ok(()) => return,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
        }
        run_due(&jobs);
    }
}

fn next_deadline(jobs: &Mutex<Vec<Job>>) -> Option<Instant> {
    jobs.lock().iter().map(|j| j.next_due).min()
}

fn run_due(jobs: &Mutex<Vec<Job>>) {
    let now = Instant::now();
    let due: Vec<(String, JobFn)> = {
        let mut jobs = jobs.lock();
        jobs.iter_mut()
            .filter(|j| j.next_due <= now)
            .map(|j| {
                j.next_due = now + j.interval;
                (j.name.clone(), j.f.clone())
            })
            .collect()
    };
    for (name, f) in due {
        log::debug!("scheduler running {}", name);
        f();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_register_and_tick() {
        let scheduler = PeriodicScheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        scheduler.register("counter", Duration::from_millis(0), move || {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(scheduler.job_count(), 1);

        std::thread::sleep(Duration::from_millis(5));
        scheduler.tick();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_worker_thread_runs_jobs() {
        let scheduler = PeriodicScheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        scheduler.register("fast", Duration::from_millis(10), move || {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        scheduler.start();
        std::thread::sleep(Duration::from_millis(100));
        scheduler.stop();
        assert!(count.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn test_not_due_jobs_skipped() {
        let scheduler = PeriodicScheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        scheduler.register("slow", Duration::from_secs(3600), move || {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        scheduler.tick();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
