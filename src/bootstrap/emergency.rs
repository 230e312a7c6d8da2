//! Emergency Mode
//!
//! The degraded member state entered when the coordinator is unreachable,
//! our version is ahead of it, or HA state is inconsistent. Most operations
//! are refused and a self-restart is scheduled after a randomised delay so
//! a pool of members does not stampede the coordinator.

use parking_lot::Mutex;
use rand::Rng;
use std::time::Duration;

use crate::api_error::{codes, ApiError, ApiResult};

/// Base delay plus a uniformly random extra
pub fn restart_delay(base: Duration, jitter: Duration) -> Duration {
    let extra = if jitter.is_zero() {
        Duration::ZERO
    } else {
        Duration::from_millis(rand::thread_rng().gen_range(0..=jitter.as_millis() as u64))
    };
    base + extra
}

/// Process-wide emergency state
pub struct EmergencyMode {
    reason: Mutex<Option<String>>,
}

impl EmergencyMode {
    pub fn new() -> Self {
        Self {
            reason: Mutex::new(None),
        }
    }

    pub fn enter(&self, reason: &str) {
        log::error!("entering emergency mode: {}", reason);
        *self.reason.lock() = Some(reason.to_string());
    }

    pub fn leave(&self) {
        let mut reason = self.reason.lock();
        if reason.take().is_some() {
            log::info!("leaving emergency mode");
        }
    }

    pub fn is_active(&self) -> bool {
        self.reason.lock().is_some()
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    /// Gate for API entry points while degraded
    pub fn check(&self) -> ApiResult<()> {
        match self.reason.lock().as_ref() {
            None => Ok(()),
            Some(reason) => Err(ApiError::new(
                codes::OPERATION_NOT_ALLOWED,
                vec![format!("host is in emergency mode: {}", reason)],
            )),
        }
    }

    /// Sleep out the randomised delay, then hand control to the restart
    /// hook (the service manager brings the process back up)
    pub fn schedule_restart(
        &self,
        base: Duration,
        jitter: Duration,
        restart: impl FnOnce() + Send + 'static,
    ) -> std::thread::JoinHandle<()> {
        let delay = restart_delay(base, jitter);
        log::warn!("self-restart scheduled in {:?}", delay);
        std::thread::Builder::new()
            .name("emergency-restart".to_string())
            .spawn(move || {
                std::thread::sleep(delay);
                restart();
            })
            .expect("spawning restart thread")
    }
}

impl Default for EmergencyMode {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_restart_delay_bounds() {
        let base = Duration::from_secs(60);
        let jitter = Duration::from_secs(120);
        for _ in 0..32 {
            let delay = restart_delay(base, jitter);
            assert!(delay >= base);
            assert!(delay <= base + jitter);
        }
        assert_eq!(restart_delay(base, Duration::ZERO), base);
    }

    #[test]
    fn test_mode_gates_operations() {
        let mode = EmergencyMode::new();
        assert!(mode.check().is_ok());
        mode.enter("coordinator unreachable");
        assert!(mode.is_active());
        let err = mode.check().unwrap_err();
        assert_eq!(err.code, codes::OPERATION_NOT_ALLOWED);
        mode.leave();
        assert!(mode.check().is_ok());
    }

    #[test]
    fn test_schedule_restart_fires() {
        let mode = EmergencyMode::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        let handle = mode.schedule_restart(Duration::from_millis(10), Duration::ZERO, move || {
            fired2.store(true, Ordering::SeqCst);
        });
        handle.join().unwrap();
        assert!(fired.load(Ordering::SeqCst));
    }
}
