//! Hypervisor Adapter
//!
//! The bridge between the cluster database (authoritative for user intent)
//! and the local hypervisor daemon (authoritative for live-VM state):
//! - Two caches kept under one mutex: the last metadata pushed per VM and
//!   the last state observed per object
//! - Two long-running event pumps, one fed by database events and one by the
//!   daemon's updates endpoint
//! - Metadata push/pull, per-VM suppression windows, a task bridge, and the
//!   startup reconciliation pass

pub mod cache;
pub mod metadata;
pub mod pumps;
pub mod resync;
pub mod sim;
pub mod suppress;
pub mod task_bridge;
pub mod updates;

pub use cache::{Caches, ObjectState};
pub use metadata::MetadataDoc;
pub use suppress::SuppressionSet;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::api_error::{codes, ApiError};
use crate::db::models::{ConsoleProtocol, DomainType, Ref};
use crate::db::Database;
use crate::events::EventBus;
use crate::task::TaskManager;

/// VM identity on the daemon side: the VM UUID as a string
pub type XvmId = String;

/// Device identity: (VM UUID, device name)
pub type DeviceId = (String, String);

/// Daemon task handle
pub type XenopsTaskId = String;

// ============================================================================
// Errors
// ============================================================================

/// The daemon's error set, translated into api errors at the boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum XenopsError {
    #[error("bad power state: expected {expected}, found {found}")]
    BadPowerState { expected: String, found: String },

    #[error("object does not exist: {kind} {id}")]
    DoesNotExist { kind: String, id: String },

    #[error("task cancelled: {0}")]
    Cancelled(String),

    #[error("not enough memory")]
    NotEnoughMemory,

    #[error("bootloader failed: {0}")]
    BootloaderFailed(String),

    #[error("hook failed: {0}")]
    HookFailed(String),

    #[error("device detach rejected: {0}")]
    DeviceDetachRejected(String),

    #[error("ballooning timeout before migration")]
    BallooningTimeoutBeforeMigration,

    #[error("daemon internal error: {0}")]
    Internal(String),

    #[error("transport failure: {0}")]
    Transport(String),
}

impl XenopsError {
    /// Map onto the closest user-visible error
    pub fn to_api_error(&self, context: &str) -> ApiError {
        match self {
            XenopsError::BadPowerState { expected, found } => ApiError::new(
                codes::BAD_POWER_STATE,
                vec![context.to_string(), expected.clone(), found.clone()],
            ),
            XenopsError::Cancelled(task) => ApiError::task_cancelled(task),
            XenopsError::NotEnoughMemory => ApiError::new(
                codes::HOST_NOT_ENOUGH_FREE_MEMORY,
                vec![context.to_string()],
            ),
            XenopsError::DoesNotExist { kind, id } => ApiError::handle_invalid(kind, id),
            other => ApiError::internal_error(format!("{}: {}", context, other)),
        }
    }
}

pub type XenopsResult<T> = Result<T, XenopsError>;

// ============================================================================
// Wire state
// ============================================================================

/// Guest power state as the daemon reports it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum XenopsPowerState {
    Halted,
    Paused,
    Running,
    Suspended,
}

/// Domain type as the daemon reports it; Undefined is transient while a
/// domain is being built or torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum XenopsDomainType {
    Hvm,
    Pv,
    PvInPvh,
    Pvh,
    Undefined,
}

impl XenopsDomainType {
    pub fn to_domain_type(self) -> DomainType {
        match self {
            XenopsDomainType::Hvm => DomainType::Hvm,
            XenopsDomainType::Pv => DomainType::Pv,
            XenopsDomainType::PvInPvh => DomainType::PvInPvh,
            XenopsDomainType::Pvh => DomainType::Pvh,
            XenopsDomainType::Undefined => DomainType::Unspecified,
        }
    }
}

/// Live VM state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmStateInfo {
    pub power_state: XenopsPowerState,
    pub domids: Vec<i64>,
    pub domain_type: XenopsDomainType,
    /// (protocol, uri) pairs
    pub consoles: Vec<(ConsoleProtocol, String)>,
    /// Guest-agent key/value pairs
    pub guest_agent: Vec<(String, String)>,
    /// Seconds since the epoch, fractional
    pub last_start_time: f64,
    /// CPU featureset the guest last booted with
    pub featureset: String,
    pub vcpu_target: i64,
    pub memory_target: i64,
}

impl Default for VmStateInfo {
    fn default() -> Self {
        Self {
            power_state: XenopsPowerState::Halted,
            domids: Vec::new(),
            domain_type: XenopsDomainType::Undefined,
            consoles: Vec::new(),
            guest_agent: Vec::new(),
            last_start_time: 0.0,
            featureset: String::new(),
            vcpu_target: 0,
            memory_target: 0,
        }
    }
}

/// Live device states
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VbdStateInfo {
    pub plugged: bool,
    pub active: bool,
    pub media_present: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VifStateInfo {
    pub plugged: bool,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PciStateInfo {
    pub plugged: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VgpuStateInfo {
    pub plugged: bool,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VusbStateInfo {
    pub plugged: bool,
}

// ============================================================================
// Updates endpoint
// ============================================================================

/// One object the daemon reports a change for
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateId {
    Vm(XvmId),
    Vbd(DeviceId),
    Vif(DeviceId),
    Pci(DeviceId),
    Vgpu(DeviceId),
    Vusb(DeviceId),
    Task(XenopsTaskId),
}

impl UpdateId {
    /// The VM this update concerns
    pub fn vm_id(&self) -> Option<&str> {
        match self {
            UpdateId::Vm(id) => Some(id),
            UpdateId::Vbd((vm, _))
            | UpdateId::Vif((vm, _))
            | UpdateId::Pci((vm, _))
            | UpdateId::Vgpu((vm, _))
            | UpdateId::Vusb((vm, _)) => Some(vm),
            UpdateId::Task(_) => None,
        }
    }
}

/// A barrier returned by the updates endpoint together with the events
/// batched behind it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatesBarrier {
    pub id: u64,
    pub events: Vec<UpdateId>,
}

/// Daemon task state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum XenopsTaskState {
    /// Progress in [0, 1]
    Pending(f64),
    Completed { result: Option<serde_json::Value> },
    Failed(XenopsError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XenopsTask {
    pub id: XenopsTaskId,
    pub dbg: String,
    pub state: XenopsTaskState,
    pub cancellable: bool,
}

// ============================================================================
// Client trait
// ============================================================================

/// RPC surface of the hypervisor daemon, keyed by a queue name per daemon
pub trait XenopsClient: Send + Sync {
    // Metadata
    fn vm_import_metadata(&self, dbg: &str, doc: &MetadataDoc) -> XenopsResult<XvmId>;
    fn vm_export_metadata(&self, dbg: &str, id: &str) -> XenopsResult<MetadataDoc>;
    fn vm_remove(&self, dbg: &str, id: &str) -> XenopsResult<()>;

    // Lifecycle; each returns a daemon task to be bridged
    fn vm_start(&self, dbg: &str, id: &str, paused: bool) -> XenopsResult<XenopsTaskId>;
    fn vm_shutdown(&self, dbg: &str, id: &str, timeout: Option<Duration>)
        -> XenopsResult<XenopsTaskId>;
    fn vm_reboot(&self, dbg: &str, id: &str, timeout: Option<Duration>)
        -> XenopsResult<XenopsTaskId>;
    fn vm_pause(&self, dbg: &str, id: &str) -> XenopsResult<XenopsTaskId>;
    fn vm_unpause(&self, dbg: &str, id: &str) -> XenopsResult<XenopsTaskId>;
    fn vm_suspend(&self, dbg: &str, id: &str, disk: &str) -> XenopsResult<XenopsTaskId>;
    fn vm_resume(&self, dbg: &str, id: &str, disk: &str) -> XenopsResult<XenopsTaskId>;
    fn vm_s3suspend(&self, dbg: &str, id: &str) -> XenopsResult<XenopsTaskId>;
    fn vm_s3resume(&self, dbg: &str, id: &str) -> XenopsResult<XenopsTaskId>;

    // Tuning
    fn vm_set_xsdata(&self, dbg: &str, id: &str, xsdata: &HashMap<String, String>)
        -> XenopsResult<()>;
    fn vm_set_vcpus(&self, dbg: &str, id: &str, count: i64) -> XenopsResult<()>;
    fn vm_set_shadow_multiplier(&self, dbg: &str, id: &str, multiplier: f64) -> XenopsResult<()>;
    fn vm_set_memory_dynamic_range(&self, dbg: &str, id: &str, min: i64, max: i64)
        -> XenopsResult<()>;

    // Introspection
    fn vm_stat(&self, dbg: &str, id: &str) -> XenopsResult<(metadata::XenopsVm, VmStateInfo)>;
    fn vm_exists(&self, dbg: &str, id: &str) -> XenopsResult<bool>;
    fn vm_list(&self, dbg: &str) -> XenopsResult<Vec<(metadata::XenopsVm, VmStateInfo)>>;
    fn vm_run_script(&self, dbg: &str, id: &str, script: &str) -> XenopsResult<String>;
    fn vm_request_rdp(&self, dbg: &str, id: &str, enabled: bool) -> XenopsResult<()>;

    // Block devices
    fn vbd_add(&self, dbg: &str, vbd: &metadata::XenopsVbd) -> XenopsResult<()>;
    fn vbd_remove(&self, dbg: &str, id: &DeviceId) -> XenopsResult<()>;
    fn vbd_plug(&self, dbg: &str, id: &DeviceId) -> XenopsResult<XenopsTaskId>;
    fn vbd_unplug(&self, dbg: &str, id: &DeviceId, force: bool) -> XenopsResult<XenopsTaskId>;
    fn vbd_insert(&self, dbg: &str, id: &DeviceId, disk: &str) -> XenopsResult<XenopsTaskId>;
    fn vbd_eject(&self, dbg: &str, id: &DeviceId) -> XenopsResult<XenopsTaskId>;
    fn vbd_stat(&self, dbg: &str, id: &DeviceId)
        -> XenopsResult<(metadata::XenopsVbd, VbdStateInfo)>;

    // Network devices
    fn vif_add(&self, dbg: &str, vif: &metadata::XenopsVif) -> XenopsResult<()>;
    fn vif_remove(&self, dbg: &str, id: &DeviceId) -> XenopsResult<()>;
    fn vif_plug(&self, dbg: &str, id: &DeviceId) -> XenopsResult<XenopsTaskId>;
    fn vif_unplug(&self, dbg: &str, id: &DeviceId, force: bool) -> XenopsResult<XenopsTaskId>;
    fn vif_move(&self, dbg: &str, id: &DeviceId, network: &str) -> XenopsResult<()>;
    fn vif_set_locking_mode(&self, dbg: &str, id: &DeviceId, mode: &str) -> XenopsResult<()>;
    fn vif_set_ipv4_configuration(&self, dbg: &str, id: &DeviceId, config: &str)
        -> XenopsResult<()>;
    fn vif_set_ipv6_configuration(&self, dbg: &str, id: &DeviceId, config: &str)
        -> XenopsResult<()>;
    fn vif_stat(&self, dbg: &str, id: &DeviceId)
        -> XenopsResult<(metadata::XenopsVif, VifStateInfo)>;

    // Passthrough devices
    fn pci_stat(&self, dbg: &str, id: &DeviceId)
        -> XenopsResult<(metadata::XenopsPci, PciStateInfo)>;
    fn vgpu_remove(&self, dbg: &str, id: &DeviceId) -> XenopsResult<()>;
    fn vgpu_stat(&self, dbg: &str, id: &DeviceId)
        -> XenopsResult<(metadata::XenopsVgpu, VgpuStateInfo)>;
    fn vusb_unplug(&self, dbg: &str, id: &DeviceId) -> XenopsResult<XenopsTaskId>;
    fn vusb_stat(&self, dbg: &str, id: &DeviceId)
        -> XenopsResult<(metadata::XenopsVusb, VusbStateInfo)>;

    // Host
    fn host_update_guest_agent_features(
        &self,
        dbg: &str,
        features: &HashMap<String, String>,
    ) -> XenopsResult<()>;
    fn host_set_numa_affinity_policy(&self, dbg: &str, policy: &str) -> XenopsResult<()>;

    // Tracing observers
    fn observer_create(&self, dbg: &str, uuid: &str) -> XenopsResult<()>;
    fn observer_destroy(&self, dbg: &str, uuid: &str) -> XenopsResult<()>;
    fn observer_set_enabled(&self, dbg: &str, uuid: &str, enabled: bool) -> XenopsResult<()>;
    fn observer_set_attributes(
        &self,
        dbg: &str,
        uuid: &str,
        attributes: &HashMap<String, String>,
    ) -> XenopsResult<()>;
    fn observer_set_endpoints(&self, dbg: &str, uuid: &str, endpoints: &[String])
        -> XenopsResult<()>;
    fn observer_init(&self, dbg: &str) -> XenopsResult<()>;

    // Tasks
    fn task_stat(&self, dbg: &str, id: &str) -> XenopsResult<XenopsTask>;
    fn task_cancel(&self, dbg: &str, id: &str) -> XenopsResult<()>;
    fn task_destroy(&self, dbg: &str, id: &str) -> XenopsResult<()>;
    fn task_destroy_on_finish(&self, dbg: &str, id: &str) -> XenopsResult<()>;

    // Updates
    fn updates_get(
        &self,
        dbg: &str,
        from: &str,
        timeout: Duration,
    ) -> XenopsResult<(Vec<UpdatesBarrier>, Vec<UpdateId>, String)>;
    fn updates_refresh_vm(&self, dbg: &str, id: &str) -> XenopsResult<()>;
    fn updates_inject_barrier(&self, dbg: &str, vm: &str, barrier_id: u64) -> XenopsResult<()>;
    fn updates_remove_barrier(&self, dbg: &str, barrier_id: u64) -> XenopsResult<()>;
    fn updates_last_id(&self, dbg: &str) -> XenopsResult<String>;
}

// ============================================================================
// Barrier signals
// ============================================================================

/// Waiters for barriers echoed back by the updates endpoint
pub struct BarrierSignals {
    seen: Mutex<HashSet<u64>>,
    cond: Condvar,
}

impl BarrierSignals {
    pub fn new() -> Self {
        Self {
            seen: Mutex::new(HashSet::new()),
            cond: Condvar::new(),
        }
    }

    pub fn signal(&self, id: u64) {
        self.seen.lock().insert(id);
        self.cond.notify_all();
    }

    /// Block until the barrier comes back through the pump
    pub fn wait(&self, id: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut seen = self.seen.lock();
        while !seen.remove(&id) {
            if self.cond.wait_until(&mut seen, deadline).timed_out() {
                return seen.remove(&id);
            }
        }
        true
    }
}

impl Default for BarrierSignals {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Adapter
// ============================================================================

/// Everything the event pumps and lifecycle services need to talk to one
/// hypervisor daemon queue
pub struct XenopsAdapter {
    pub db: Arc<Database>,
    pub bus: Arc<EventBus>,
    pub tasks: Arc<TaskManager>,
    pub client: Arc<dyn XenopsClient>,
    pub caches: Caches,
    pub suppression: SuppressionSet,
    /// This host's database row
    pub localhost: Ref,
    /// Queue name, used as the debug id on every RPC
    pub queue: String,
    /// Barriers injected into the daemon's update stream
    pub barriers: BarrierSignals,
    barrier_seq: AtomicU64,
    /// Highest database event token the xapi-side pump has processed
    greatest_token: AtomicU64,
}

impl XenopsAdapter {
    pub fn new(
        db: Arc<Database>,
        bus: Arc<EventBus>,
        tasks: Arc<TaskManager>,
        client: Arc<dyn XenopsClient>,
        localhost: Ref,
        queue: &str,
    ) -> Self {
        Self {
            db,
            bus,
            tasks,
            client,
            caches: Caches::new(),
            suppression: SuppressionSet::new(),
            localhost,
            queue: queue.to_string(),
            barriers: BarrierSignals::new(),
            barrier_seq: AtomicU64::new(1),
            greatest_token: AtomicU64::new(0),
        }
    }

    pub fn dbg(&self) -> &str {
        &self.queue
    }

    pub fn next_barrier_id(&self) -> u64 {
        self.barrier_seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Ask the daemon to re-emit everything it knows about a VM, then wait
    /// until the pump has applied it
    pub fn refresh_vm_sync(&self, vm_uuid: &str, timeout: Duration) -> XenopsResult<bool> {
        self.client.updates_refresh_vm(self.dbg(), vm_uuid)?;
        let barrier = self.next_barrier_id();
        self.client
            .updates_inject_barrier(self.dbg(), vm_uuid, barrier)?;
        Ok(self.barriers.wait(barrier, timeout))
    }

    /// Run `f` with updates for `vm_uuid` suppressed. The last withdrawal
    /// forces a refresh and flushes pending events through a barrier before
    /// broadcasting to anyone waiting on the window.
    pub fn with_suppressed<R>(&self, vm_uuid: &str, f: impl FnOnce() -> R) -> R {
        self.suppression.add(vm_uuid);
        let result = f();
        if self.suppression.remove(vm_uuid) {
            if let Err(e) = self.refresh_vm_sync(vm_uuid, Duration::from_secs(30)) {
                log::warn!("refresh after suppression window for {} failed: {}", vm_uuid, e);
            }
            self.suppression.broadcast();
        }
        result
    }

    /// Record the latest database token the xapi event pump has handled, so
    /// other threads can wait for at least a given observation
    pub fn note_xapi_token(&self, token: u64) {
        let mut current = self.greatest_token.load(Ordering::SeqCst);
        while token > current {
            match self.greatest_token.compare_exchange(
                current,
                token,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn greatest_xapi_token(&self) -> u64 {
        self.greatest_token.load(Ordering::SeqCst)
    }

    /// Push the pool's guest-agent policy down to the daemon
    pub fn sync_guest_agent_features(&self) -> XenopsResult<()> {
        let Ok(pool) = self.db.pool() else {
            return Ok(());
        };
        self.client
            .host_update_guest_agent_features(self.dbg(), &pool.guest_agent_config)
    }

    /// Wake the xapi event pump so it re-registers its subscription list.
    /// Emitting a synthetic event on our own host row is the wake signal the
    /// pump listens for.
    pub fn trigger_xenapi_reregister(&self) {
        if let Err(e) = self.db.inject(crate::db::models::Class::Host, &self.localhost) {
            log::warn!("waking the xapi event pump failed: {}", e);
        }
    }
}
