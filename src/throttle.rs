//! Bounded Concurrency Primitives
//!
//! - A counting semaphore for classes of throttled work
//! - The scan gate: at most one scan per storage repository at a time, a
//!   global cap across repositories, and queued completion callbacks for
//!   callers that found a scan already running

use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::db::models::Ref;

/// Counting semaphore
pub struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            count: Mutex::new(permits),
            cond: Condvar::new(),
        }
    }

    pub fn acquire(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.cond.wait(&mut count);
        }
        *count -= 1;
    }

    pub fn try_acquire(&self) -> bool {
        let mut count = self.count.lock();
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }

    pub fn release(&self) {
        *self.count.lock() += 1;
        self.cond.notify_one();
    }

    pub fn available(&self) -> usize {
        *self.count.lock()
    }
}

/// Fired when a queued caller's scan request is satisfied by the scan that
/// was already in flight
pub type ScanCallback = Box<dyn FnOnce() + Send>;

struct GateInner {
    limit: usize,
    active: HashSet<Ref>,
    queued: HashMap<Ref, Vec<ScanCallback>>,
}

/// Per-repository single-flight with a global cap
pub struct ScanGate {
    inner: Mutex<GateInner>,
    cond: Condvar,
}

impl ScanGate {
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Mutex::new(GateInner {
                limit: limit.max(1),
                active: HashSet::new(),
                queued: HashMap::new(),
            }),
            cond: Condvar::new(),
        }
    }

    /// Try to begin a scan of `sr`. Returns true when the caller now owns the
    /// scan slot. When a scan is already running for this repository the
    /// optional callback is queued to fire on its completion and false is
    /// returned. Blocks while the global cap is reached.
    pub fn begin(&self, sr: &Ref, on_complete: Option<ScanCallback>) -> bool {
        let mut inner = self.inner.lock();
        loop {
            if inner.active.contains(sr) {
                if let Some(callback) = on_complete {
                    inner.queued.entry(sr.clone()).or_default().push(callback);
                }
                return false;
            }
            if inner.active.len() < inner.limit {
                inner.active.insert(sr.clone());
                return true;
            }
            self.cond.wait(&mut inner);
        }
    }

    /// Finish a scan and collect the callbacks queued while it ran. The
    /// caller fires them outside the lock.
    pub fn end(&self, sr: &Ref) -> Vec<ScanCallback> {
        let mut inner = self.inner.lock();
        inner.active.remove(sr);
        let callbacks = inner.queued.remove(sr).unwrap_or_default();
        drop(inner);
        self.cond.notify_all();
        callbacks
    }

    pub fn is_active(&self, sr: &Ref) -> bool {
        self.inner.lock().active.contains(sr)
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().active.len()
    }

    /// Block until no scan is running for `sr`, up to the timeout
    pub fn wait_idle(&self, sr: &Ref, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while inner.active.contains(sr) {
            if self.cond.wait_until(&mut inner, deadline).timed_out() {
                return !inner.active.contains(sr);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_semaphore_limits() {
        let sem = Semaphore::new(2);
        assert!(sem.try_acquire());
        assert!(sem.try_acquire());
        assert!(!sem.try_acquire());
        sem.release();
        assert!(sem.try_acquire());
    }

    #[test]
    fn test_one_scan_per_sr() {
        let gate = ScanGate::new(4);
        let sr = Ref::generate();
        assert!(gate.begin(&sr, None));
        assert!(!gate.begin(&sr, None));
        let callbacks = gate.end(&sr);
        assert!(callbacks.is_empty());
        assert!(gate.begin(&sr, None));
    }

    #[test]
    fn test_queued_callback_fires_on_completion() {
        let gate = ScanGate::new(4);
        let sr = Ref::generate();
        let fired = Arc::new(AtomicUsize::new(0));

        assert!(gate.begin(&sr, None));
        let fired2 = fired.clone();
        assert!(!gate.begin(&sr, Some(Box::new(move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        }))));

        for callback in gate.end(&sr) {
            callback();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_global_cap_blocks() {
        let gate = Arc::new(ScanGate::new(1));
        let a = Ref::generate();
        let b = Ref::generate();
        assert!(gate.begin(&a, None));

        let gate2 = gate.clone();
        let b2 = b.clone();
        let handle = thread::spawn(move || gate2.begin(&b2, None));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(gate.active_count(), 1);

        gate.end(&a);
        assert!(handle.join().unwrap());
        assert!(gate.is_active(&b));
    }
}
