//! Startup Sequencer
//!
//! A named, flagged task list run in order at boot. Flags scope tasks to
//! the coordinator or member role, push them onto a background thread, or
//! demote their failures to log lines.

use crossbeam_channel::bounded;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::db::Database;
use crate::localdb::{keys, LocalDb};

use super::{contact_master, ContactOutcome, EmergencyMode, PeerClient, PoolRole};

/// Behaviour switches for one startup task
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskFlags {
    /// Run only when this host is the coordinator
    pub only_master: bool,
    /// Run only when this host is a member
    pub only_slave: bool,
    /// Run on a background thread; startup does not wait for it
    pub on_thread: bool,
    /// Log failures and keep going instead of aborting startup
    pub no_exn_raising: bool,
}

type TaskFn = Arc<dyn Fn() -> Result<(), String> + Send + Sync>;

pub struct StartupTask {
    pub name: String,
    pub flags: TaskFlags,
    f: TaskFn,
}

/// Startup abort
#[derive(Debug, thiserror::Error)]
#[error("startup task {name} failed: {reason}")]
pub struct StartupError {
    pub name: String,
    pub reason: String,
}

/// Ordered task list
pub struct StartupSequencer {
    tasks: Vec<StartupTask>,
}

impl StartupSequencer {
    pub fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    pub fn add<F>(&mut self, name: &str, flags: TaskFlags, f: F) -> &mut Self
    where
        F: Fn() -> Result<(), String> + Send + Sync + 'static,
    {
        self.tasks.push(StartupTask {
            name: name.to_string(),
            flags,
            f: Arc::new(f),
        });
        self
    }

    /// Run every task applicable to the role, in registration order
    pub fn run(&self, role: &PoolRole) -> Result<(), StartupError> {
        let is_master = role.is_master();
        for task in &self.tasks {
            if task.flags.only_master && !is_master {
                continue;
            }
            if task.flags.only_slave && is_master {
                continue;
            }
            log::info!("startup: {}", task.name);
            if task.flags.on_thread {
                let name = task.name.clone();
                let f = task.f.clone();
                let _ = std::thread::Builder::new()
                    .name(format!("startup-{}", name))
                    .spawn(move || {
                        if let Err(reason) = f() {
                            log::warn!("background startup task {} failed: {}", name, reason);
                        }
                    });
                continue;
            }
            match (task.f)() {
                Ok(()) => {}
                Err(reason) if task.flags.no_exn_raising => {
                    log::warn!("startup task {} failed (ignored): {}", task.name, reason);
                }
                Err(reason) => {
                    return Err(StartupError {
                        name: task.name.clone(),
                        reason,
                    });
                }
            }
        }
        Ok(())
    }
}

impl Default for StartupSequencer {
    fn default() -> Self {
        Self::new()
    }
}

/// Member-side join loop: keep contacting the coordinator until it accepts
/// us. Temporary failures retry on the short interval, permanent ones put
/// the host in emergency mode and retry on the long interval. Returns true
/// once connected; false only when the attempt budget runs out.
#[allow(clippy::too_many_arguments)]
pub fn run_slave_join(
    peer: &dyn PeerClient,
    my_uuid: &str,
    my_address: &str,
    my_version: &str,
    temporary_retry: Duration,
    permanent_retry: Duration,
    emergency: &EmergencyMode,
    max_attempts: Option<u32>,
) -> bool {
    emergency.enter("not yet connected to the coordinator");
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match contact_master(peer, my_uuid, my_address, my_version) {
            ContactOutcome::Ok => {
                emergency.leave();
                return true;
            }
            ContactOutcome::Temporary(reason) => {
                log::warn!("coordinator contact failed (retrying soon): {}", reason);
                if let Some(limit) = max_attempts {
                    if attempts >= limit {
                        return false;
                    }
                }
                std::thread::sleep(temporary_retry);
            }
            ContactOutcome::Permanent(reason) => {
                emergency.enter(&reason);
                if let Some(limit) = max_attempts {
                    if attempts >= limit {
                        return false;
                    }
                }
                std::thread::sleep(permanent_retry);
            }
        }
    }
}

/// HA state must agree with the pool after a join: an HA-enabled pool with
/// an unarmed member is inconsistent
pub fn check_ha_consistency(db: &Database, local: &LocalDb) -> Result<(), String> {
    let Ok(pool) = db.pool() else {
        return Ok(());
    };
    if pool.ha_enabled && !local.get_bool(keys::HA_ARMED) {
        return Err("pool has HA enabled but this host is not armed".to_string());
    }
    Ok(())
}

/// Initialise the external auth backend off the startup path: a watchdog
/// bounds the first attempt, failures retry on a long interval, and success
/// lands in the shared flag
pub fn spawn_auth_init<F>(
    init: F,
    watchdog: Duration,
    retry: Duration,
    initialised: Arc<AtomicBool>,
    disabled: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()>
where
    F: Fn() -> Result<(), String> + Send + Sync + 'static,
{
    std::thread::Builder::new()
        .name("auth-init".to_string())
        .spawn(move || {
            let init = Arc::new(init);
            loop {
                if disabled.load(Ordering::SeqCst) {
                    log::info!("auth backend initialisation disabled, giving up");
                    return;
                }
                let (tx, rx) = bounded(1);
                let attempt = init.clone();
                let _ = std::thread::Builder::new()
                    .name("auth-init-attempt".to_string())
                    .spawn(move || {
                        let _ = tx.send(attempt());
                    });
                match rx.recv_timeout(watchdog) {
                    Ok(Ok(())) => {
                        initialised.store(true, Ordering::SeqCst);
                        log::info!("auth backend initialised");
                        return;
                    }
                    Ok(Err(reason)) => {
                        log::warn!("auth backend initialisation failed: {}", reason);
                    }
                    Err(_) => {
                        log::warn!(
                            "auth backend initialisation still running after {:?}",
                            watchdog
                        );
                    }
                }
                std::thread::sleep(retry);
            }
        })
        .expect("spawning auth init thread")
}
