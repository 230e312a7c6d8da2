//! PoolMgr - Cluster Control Plane for Hypervisor Pools
//!
//! Each host in a pool runs one instance of this daemon. The instances
//! elect a coordinator that owns the authoritative object database; the
//! remaining members replicate it and forward requests. The daemon exposes
//! an object model (pools, hosts, VMs, disks, network interfaces, storage
//! repositories, tasks), decides per object which operations are valid
//! right now, and continuously reconciles its records against the local
//! hypervisor and storage daemons.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        poolmgr (per host)                        │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  ┌────────────────────────────────────────────────────────────┐  │
//! │  │                Lifecycle Services (vm/vbd/vif/vdi/sr)      │  │
//! │  │  task protocol · semantic locks · allowed-operations cache │  │
//! │  └────────────────────────────────────────────────────────────┘  │
//! │  ┌──────────────────────┐  ┌──────────────────────────────────┐  │
//! │  │ Allowed-Operations   │  │        Cluster Database          │  │
//! │  │ Engine (per class)   │  │  tables · events · redo log ·    │  │
//! │  │                      │  │  replication · ready barrier     │  │
//! │  └──────────────────────┘  └──────────────────────────────────┘  │
//! │  ┌────────────────────────────┐  ┌────────────────────────────┐  │
//! │  │     Hypervisor Adapter     │  │      Storage Adapter       │  │
//! │  │  two caches · two pumps ·  │  │  scan gate · three-way     │  │
//! │  │  metadata push/pull ·      │  │  merge · per-disk ops      │  │
//! │  │  suppression · task bridge │  │                            │  │
//! │  └────────────────────────────┘  └────────────────────────────┘  │
//! │  ┌────────────────────────────────────────────────────────────┐  │
//! │  │   Bootstrap: role · startup sequencer · emergency mode     │  │
//! │  └────────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

// Core infrastructure
pub mod api_error;
pub mod config;
pub mod db;
pub mod events;
pub mod localdb;
pub mod message;
pub mod scheduler;
pub mod task;
pub mod throttle;

// The admission engine and the services built on it
pub mod allowed;
pub mod lifecycle;

// External-daemon adapters
pub mod storage;
pub mod xenops;

// Node startup
pub mod bootstrap;
pub mod context;

// Re-export the types nearly every consumer needs
pub use api_error::{ApiError, ApiResult};
pub use config::Config;
pub use context::Context;
pub use db::models::{Class, PowerState, Ref};
pub use db::Database;
pub use events::EventBus;
pub use task::TaskManager;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Platform name
pub const PLATFORM_NAME: &str = "PoolMgr";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
