//! Database Replication
//!
//! Members pull the whole database from the coordinator at join time and
//! thereafter receive per-write deltas over the same channel. The transport
//! itself lives outside the core; here a channel per member models it.
//!
//! The coordinator blocks pull requests on a database-ready barrier so a
//! member request arriving during coordinator restart never observes an
//! empty database.

use crossbeam_channel::{unbounded, Receiver, Sender, TrySendError};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{Database, DatabaseSnapshot, DbResult, Delta, WriteSink};

/// Signalled once the coordinator has populated its database
pub struct ReadyBarrier {
    ready: Mutex<bool>,
    cond: Condvar,
}

impl ReadyBarrier {
    pub fn new() -> Self {
        Self {
            ready: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn set_ready(&self) {
        let mut ready = self.ready.lock();
        *ready = true;
        drop(ready);
        self.cond.notify_all();
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.lock()
    }

    /// Block until ready or the timeout expires
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut ready = self.ready.lock();
        while !*ready {
            if self.cond.wait_until(&mut ready, deadline).timed_out() {
                return *ready;
            }
        }
        true
    }
}

impl Default for ReadyBarrier {
    fn default() -> Self {
        Self::new()
    }
}

/// Member connection identifier
pub type MemberId = u64;

struct MemberFeed {
    id: MemberId,
    address: String,
    sender: Sender<Delta>,
}

/// Coordinator-side fan-out of database writes to joined members
pub struct ReplicationFeed {
    members: Mutex<Vec<MemberFeed>>,
    next_id: Mutex<MemberId>,
}

impl ReplicationFeed {
    pub fn new() -> Self {
        Self {
            members: Mutex::new(Vec::new()),
            next_id: Mutex::new(1),
        }
    }

    /// Register a member and hand it the delta stream. The caller sends the
    /// accompanying full snapshot first, taken after registration so no
    /// write can fall between snapshot and stream.
    pub fn attach(&self, address: &str) -> (MemberId, Receiver<Delta>) {
        let (tx, rx) = unbounded();
        let mut next = self.next_id.lock();
        let id = *next;
        *next += 1;
        drop(next);
        self.members.lock().push(MemberFeed {
            id,
            address: address.to_string(),
            sender: tx,
        });
        log::info!("member {} attached to replication feed", address);
        (id, rx)
    }

    pub fn detach(&self, id: MemberId) {
        self.members.lock().retain(|m| m.id != id);
    }

    pub fn member_count(&self) -> usize {
        self.members.lock().len()
    }
}

impl Default for ReplicationFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteSink for ReplicationFeed {
    fn on_write(&self, delta: &Delta) {
        let mut members = self.members.lock();
        members.retain(|member| match member.sender.try_send(delta.clone()) {
            Ok(()) => true,
            Err(TrySendError::Disconnected(_)) => {
                log::warn!("member {} disconnected from replication feed", member.address);
                false
            }
            Err(TrySendError::Full(_)) => true,
        });
    }
}

/// Coordinator endpoint: serve a full database dump to a joining member,
/// blocking until the database is ready
pub fn pull_database(
    db: &Database,
    ready: &ReadyBarrier,
    timeout: Duration,
) -> Option<DbResult<DatabaseSnapshot>> {
    if !ready.wait(timeout) {
        return None;
    }
    Some(db.snapshot())
}

/// Member side: ingest the snapshot, then apply deltas until the feed closes
pub fn run_member_ingest(db: Arc<Database>, snapshot: &DatabaseSnapshot, feed: Receiver<Delta>) -> DbResult<()> {
    db.load_snapshot(snapshot)?;
    for delta in feed.iter() {
        if let Err(e) = db.apply_delta(&delta) {
            log::warn!(
                "dropping bad replicated write for {} {}: {}",
                delta.class,
                delta.reference,
                e
            );
        }
    }
    log::info!("replication feed closed");
    Ok(())
}
