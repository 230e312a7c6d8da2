//! Suppression Windows
//!
//! VM ids for which the daemon-side event pump must not apply updates, used
//! during migration so a destination-side event cannot flip source-side
//! database state early. Insertions are counted per id: the same id may be
//! suppressed from several call sites, and only the last withdrawal opens
//! the window again.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Counted set of suppressed VM ids
pub struct SuppressionSet {
    entries: Mutex<Vec<String>>,
    cond: Condvar,
}

impl SuppressionSet {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            cond: Condvar::new(),
        }
    }

    /// Add one suppression for the id
    pub fn add(&self, vm_uuid: &str) {
        self.entries.lock().push(vm_uuid.to_string());
    }

    /// Withdraw one suppression. Returns true when this was the last one,
    /// meaning the caller must refresh and broadcast.
    pub fn remove(&self, vm_uuid: &str) -> bool {
        let mut entries = self.entries.lock();
        if let Some(position) = entries.iter().position(|e| e == vm_uuid) {
            entries.remove(position);
        }
        !entries.iter().any(|e| e == vm_uuid)
    }

    pub fn contains(&self, vm_uuid: &str) -> bool {
        self.entries.lock().iter().any(|e| e == vm_uuid)
    }

    /// Wake everyone blocked in `wait_unsuppressed`
    pub fn broadcast(&self) {
        self.cond.notify_all();
    }

    /// Block until nobody suppresses the id any more
    pub fn wait_unsuppressed(&self, vm_uuid: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut entries = self.entries.lock();
        while entries.iter().any(|e| e == vm_uuid) {
            if self.cond.wait_until(&mut entries, deadline).timed_out() {
                return !entries.iter().any(|e| e == vm_uuid);
            }
        }
        true
    }
}

impl Default for SuppressionSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_counted_insertions() {
        let set = SuppressionSet::new();
        set.add("u1");
        set.add("u1");
        assert!(set.contains("u1"));
        // First withdrawal leaves the window closed
        assert!(!set.remove("u1"));
        assert!(set.contains("u1"));
        // Second withdrawal opens it
        assert!(set.remove("u1"));
        assert!(!set.contains("u1"));
    }

    #[test]
    fn test_remove_unknown_id_reports_open() {
        let set = SuppressionSet::new();
        assert!(set.remove("never-added"));
    }

    #[test]
    fn test_wait_unsuppressed() {
        let set = Arc::new(SuppressionSet::new());
        set.add("u1");
        let set2 = set.clone();
        let handle =
            thread::spawn(move || set2.wait_unsuppressed("u1", Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(20));
        set.remove("u1");
        set.broadcast();
        assert!(handle.join().unwrap());
    }
}
