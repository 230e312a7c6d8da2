//! Core Context
//!
//! Everything the lifecycle services need, constructed once in main and
//! injected everywhere. Nothing in the core reaches for process-wide
//! mutable state.

use std::sync::Arc;

use crate::config::Config;
use crate::db::models::{HostRecord, PoolRecord, Ref};
use crate::db::replication::ReadyBarrier;
use crate::db::Database;
use crate::events::EventBus;
use crate::storage::SmClient;
use crate::task::TaskManager;
use crate::throttle::ScanGate;
use crate::xenops::{XenopsAdapter, XenopsClient};

/// The assembled core
pub struct Context {
    pub config: Config,
    pub db: Arc<Database>,
    pub bus: Arc<EventBus>,
    pub tasks: Arc<TaskManager>,
    pub xenops: Arc<XenopsAdapter>,
    pub storage: Arc<dyn SmClient>,
    pub scan_gate: ScanGate,
    pub ready: Arc<ReadyBarrier>,
    /// This host's database row
    pub localhost: Ref,
}

impl Context {
    pub fn new(
        config: Config,
        db: Arc<Database>,
        bus: Arc<EventBus>,
        tasks: Arc<TaskManager>,
        xenops_client: Arc<dyn XenopsClient>,
        storage: Arc<dyn SmClient>,
        localhost: Ref,
    ) -> Self {
        let queue = config
            .xenopsd_queues
            .first()
            .cloned()
            .unwrap_or_else(|| "org.xen.xapi.xenops.classic".to_string());
        let xenops = Arc::new(XenopsAdapter::new(
            db.clone(),
            bus.clone(),
            tasks.clone(),
            xenops_client,
            localhost.clone(),
            &queue,
        ));
        let scan_gate = ScanGate::new(config.max_parallel_scans);
        Self {
            config,
            db,
            bus,
            tasks,
            xenops,
            storage,
            scan_gate,
            ready: Arc::new(ReadyBarrier::new()),
            localhost,
        }
    }

    /// A fully wired context backed by the in-memory daemons, with a pool
    /// and a localhost row already present. Used by the test suite and the
    /// debug dummy-data mode.
    pub fn sim() -> (
        Arc<Self>,
        Arc<crate::xenops::sim::SimXenops>,
        Arc<crate::storage::sim::SimStorage>,
    ) {
        use uuid::Uuid;

        let bus = Arc::new(EventBus::default());
        let db = Arc::new(Database::new(bus.clone()));
        let localhost = Ref::generate();
        let tasks = Arc::new(TaskManager::new(db.clone(), localhost.clone()));
        let sim_xenops = Arc::new(crate::xenops::sim::SimXenops::new());
        let sim_storage = Arc::new(crate::storage::sim::SimStorage::new());

        let host = HostRecord {
            reference: localhost.clone(),
            uuid: Uuid::new_v4(),
            name_label: "localhost".to_string(),
            address: "127.0.0.1".to_string(),
            enabled: true,
            api_version_major: 2,
            api_version_minor: 21,
            ..Default::default()
        };
        let pool = PoolRecord {
            reference: Ref::generate(),
            uuid: Uuid::new_v4(),
            name_label: "test-pool".to_string(),
            master: localhost.clone(),
            ..Default::default()
        };
        db.hosts.insert(host).expect("inserting localhost");
        db.pools.insert(pool).expect("inserting pool");

        let ctx = Arc::new(Context::new(
            Config::default(),
            db,
            bus,
            tasks,
            sim_xenops.clone(),
            sim_storage.clone(),
            localhost,
        ));
        ctx.ready.set_ready();
        (ctx, sim_xenops, sim_storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_context_wiring() {
        let (ctx, _xenops, _storage) = Context::sim();
        assert!(ctx.db.hosts.contains(&ctx.localhost));
        assert!(ctx.db.pool().is_ok());
        assert!(ctx.ready.is_ready());
    }
}
