//! Daemon Configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Full daemon configuration, loadable from a TOML file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to db.conf, which enumerates the database locations
    pub db_conf_path: PathBuf,
    /// Restore file consumed at startup when present
    pub db_restore_path: PathBuf,
    /// Path to local.db
    pub local_db_path: PathBuf,
    /// Path to the installation inventory
    pub inventory_path: PathBuf,
    /// Certificate-verification marker file; peer TLS verification is on
    /// when it exists
    pub tls_verification_marker: PathBuf,
    /// Seconds between full database flushes
    pub db_flush_interval_secs: u64,
    /// Seconds between task GC sweeps
    pub task_gc_interval_secs: u64,
    /// Age after which finished tasks are destroyed
    pub task_max_age_secs: u64,
    /// Global cap on parallel storage scans
    pub max_parallel_scans: usize,
    /// Retry ceiling when the database changes under a scan
    pub scan_retry_limit: u32,
    /// Backoff after an event-pump transport failure
    pub event_pump_backoff_secs: u64,
    /// Retry delay after a temporary master-contact failure
    pub master_retry_temporary_secs: u64,
    /// Retry delay after a permanent master-contact failure
    pub master_retry_permanent_secs: u64,
    /// Base delay before an emergency-mode self restart
    pub emergency_restart_base_secs: u64,
    /// Random extra delay on top of the base
    pub emergency_restart_jitter_secs: u64,
    /// Watchdog for asynchronous auth-backend initialisation
    pub auth_init_watchdog_secs: u64,
    /// Retry interval when auth-backend initialisation keeps failing
    pub auth_init_retry_secs: u64,
    /// Hypervisor daemon queues to attach event pumps to
    pub xenopsd_queues: Vec<String>,
    /// Disable the startup watchdog
    pub nowatchdog: bool,
    /// Disable event pumps (maintenance diagnostics)
    pub noevents: bool,
    /// Populate the database with synthetic objects for UI development
    pub debug_dummy_data: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_conf_path: PathBuf::from("/etc/poolmgr/db.conf"),
            db_restore_path: PathBuf::from("/var/lib/poolmgr/restore.db"),
            local_db_path: PathBuf::from("/var/lib/poolmgr/local.db"),
            inventory_path: PathBuf::from("/etc/poolmgr/inventory"),
            tls_verification_marker: PathBuf::from("/var/lib/poolmgr/verify-certificates"),
            db_flush_interval_secs: 30,
            task_gc_interval_secs: 300,
            task_max_age_secs: 24 * 3600,
            max_parallel_scans: 8,
            scan_retry_limit: 10,
            event_pump_backoff_secs: 10,
            master_retry_temporary_secs: 5,
            master_retry_permanent_secs: 600,
            emergency_restart_base_secs: 60,
            emergency_restart_jitter_secs: 120,
            auth_init_watchdog_secs: 120,
            auth_init_retry_secs: 300,
            xenopsd_queues: vec!["org.xen.xapi.xenops.classic".to_string()],
            nowatchdog: false,
            noevents: false,
            debug_dummy_data: false,
        }
    }
}

impl Config {
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    pub fn db_flush_interval(&self) -> Duration {
        Duration::from_secs(self.db_flush_interval_secs)
    }

    pub fn task_gc_interval(&self) -> Duration {
        Duration::from_secs(self.task_gc_interval_secs)
    }

    pub fn task_max_age(&self) -> Duration {
        Duration::from_secs(self.task_max_age_secs)
    }

    pub fn event_pump_backoff(&self) -> Duration {
        Duration::from_secs(self.event_pump_backoff_secs)
    }

    pub fn master_retry_temporary(&self) -> Duration {
        Duration::from_secs(self.master_retry_temporary_secs)
    }

    pub fn master_retry_permanent(&self) -> Duration {
        Duration::from_secs(self.master_retry_permanent_secs)
    }
}

/// Configuration load failures
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("parsing configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.max_parallel_scans, 8);
        assert_eq!(config.scan_retry_limit, 10);
        assert_eq!(config.master_retry_temporary_secs, 5);
        assert_eq!(config.event_pump_backoff_secs, 10);
    }

    #[test]
    fn test_partial_toml_overlays_defaults() {
        let config: Config = toml::from_str("max_parallel_scans = 2\nnoevents = true\n").unwrap();
        assert_eq!(config.max_parallel_scans, 2);
        assert!(config.noevents);
        assert_eq!(config.scan_retry_limit, 10);
    }
}
