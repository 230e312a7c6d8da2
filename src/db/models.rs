//! Database Models
//!
//! Typed records for every object class held in the cluster database, plus
//! the closed enums that cross the wire: power states, operation kinds,
//! disk/device modes. The wire string for each variant is fixed by the serde
//! rename attributes; `as_str` mirrors the same table for log and error text.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use chrono::{DateTime, Utc};

// ============================================================================
// References
// ============================================================================

/// Stable opaque reference to a database row
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ref(String);

impl Ref {
    /// Mint a fresh reference
    pub fn generate() -> Self {
        Self(format!("OpaqueRef:{}", Uuid::new_v4()))
    }

    /// The null reference
    pub fn null() -> Self {
        Self("OpaqueRef:NULL".to_string())
    }

    pub fn is_null(&self) -> bool {
        self.0 == "OpaqueRef:NULL"
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Ref {
    fn default() -> Self {
        Self::null()
    }
}

impl std::fmt::Display for Ref {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Classes
// ============================================================================

/// Object classes held in the database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Class {
    Pool,
    Host,
    Vm,
    VmMetrics,
    VmGuestMetrics,
    Vbd,
    Vif,
    Vdi,
    Sr,
    Pbd,
    Pci,
    Pgpu,
    Vgpu,
    Pusb,
    Vusb,
    Vtpm,
    Network,
    Pif,
    Console,
    Task,
    Message,
    Role,
    Subject,
}

impl Class {
    /// Wire name used in event class filters and error arguments
    pub fn wire_name(&self) -> &'static str {
        match self {
            Class::Pool => "pool",
            Class::Host => "host",
            Class::Vm => "VM",
            Class::VmMetrics => "VM_metrics",
            Class::VmGuestMetrics => "VM_guest_metrics",
            Class::Vbd => "VBD",
            Class::Vif => "VIF",
            Class::Vdi => "VDI",
            Class::Sr => "SR",
            Class::Pbd => "PBD",
            Class::Pci => "PCI",
            Class::Pgpu => "PGPU",
            Class::Vgpu => "VGPU",
            Class::Pusb => "PUSB",
            Class::Vusb => "VUSB",
            Class::Vtpm => "VTPM",
            Class::Network => "network",
            Class::Pif => "PIF",
            Class::Console => "console",
            Class::Task => "task",
            Class::Message => "message",
            Class::Role => "role",
            Class::Subject => "subject",
        }
    }

    /// Reverse of `wire_name`
    pub fn from_wire_name(s: &str) -> Option<Class> {
        ALL_CLASSES.iter().copied().find(|c| c.wire_name() == s)
    }
}

impl std::fmt::Display for Class {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.wire_name())
    }
}

pub const ALL_CLASSES: &[Class] = &[
    Class::Pool,
    Class::Host,
    Class::Vm,
    Class::VmMetrics,
    Class::VmGuestMetrics,
    Class::Vbd,
    Class::Vif,
    Class::Vdi,
    Class::Sr,
    Class::Pbd,
    Class::Pci,
    Class::Pgpu,
    Class::Vgpu,
    Class::Pusb,
    Class::Vusb,
    Class::Vtpm,
    Class::Network,
    Class::Pif,
    Class::Console,
    Class::Task,
    Class::Message,
    Class::Role,
    Class::Subject,
];

// ============================================================================
// Power state and domain type
// ============================================================================

/// VM power state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    Halted,
    Paused,
    Suspended,
    Running,
}

impl PowerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerState::Halted => "halted",
            PowerState::Paused => "paused",
            PowerState::Suspended => "suspended",
            PowerState::Running => "running",
        }
    }
}

impl Default for PowerState {
    fn default() -> Self {
        Self::Halted
    }
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Domain virtualisation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainType {
    Hvm,
    Pv,
    PvInPvh,
    Pvh,
    Unspecified,
}

impl Default for DomainType {
    fn default() -> Self {
        Self::Unspecified
    }
}

impl DomainType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DomainType::Hvm => "hvm",
            DomainType::Pv => "pv",
            DomainType::PvInPvh => "pv_in_pvh",
            DomainType::Pvh => "pvh",
            DomainType::Unspecified => "unspecified",
        }
    }
}

impl std::fmt::Display for DomainType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What to do when a guest shuts down or crashes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionAfter {
    Destroy,
    Restart,
    Preserve,
}

impl Default for ActionAfter {
    fn default() -> Self {
        Self::Destroy
    }
}

// ============================================================================
// Operation kinds
// ============================================================================

/// VM operations subject to the allowed-operations engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmOperation {
    Snapshot,
    SnapshotWithQuiesce,
    Checkpoint,
    Clone,
    Copy,
    Revert,
    Provision,
    Start,
    StartOn,
    Pause,
    Unpause,
    CleanShutdown,
    CleanReboot,
    HardShutdown,
    HardReboot,
    Suspend,
    Resume,
    ResumeOn,
    PoolMigrate,
    MigrateSend,
    Destroy,
    Export,
    MetadataExport,
    Import,
    MakeIntoTemplate,
    ChangingMemoryLive,
    ChangingDynamicRange,
    ChangingStaticRange,
    ChangingVcpusLive,
    ChangingVcpus,
    DataSourceOp,
    CreateVtpm,
    PowerStateReset,
}

impl VmOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmOperation::Snapshot => "snapshot",
            VmOperation::SnapshotWithQuiesce => "snapshot_with_quiesce",
            VmOperation::Checkpoint => "checkpoint",
            VmOperation::Clone => "clone",
            VmOperation::Copy => "copy",
            VmOperation::Revert => "revert",
            VmOperation::Provision => "provision",
            VmOperation::Start => "start",
            VmOperation::StartOn => "start_on",
            VmOperation::Pause => "pause",
            VmOperation::Unpause => "unpause",
            VmOperation::CleanShutdown => "clean_shutdown",
            VmOperation::CleanReboot => "clean_reboot",
            VmOperation::HardShutdown => "hard_shutdown",
            VmOperation::HardReboot => "hard_reboot",
            VmOperation::Suspend => "suspend",
            VmOperation::Resume => "resume",
            VmOperation::ResumeOn => "resume_on",
            VmOperation::PoolMigrate => "pool_migrate",
            VmOperation::MigrateSend => "migrate_send",
            VmOperation::Destroy => "destroy",
            VmOperation::Export => "export",
            VmOperation::MetadataExport => "metadata_export",
            VmOperation::Import => "import",
            VmOperation::MakeIntoTemplate => "make_into_template",
            VmOperation::ChangingMemoryLive => "changing_memory_live",
            VmOperation::ChangingDynamicRange => "changing_dynamic_range",
            VmOperation::ChangingStaticRange => "changing_static_range",
            VmOperation::ChangingVcpusLive => "changing_vcpus_live",
            VmOperation::ChangingVcpus => "changing_vcpus",
            VmOperation::DataSourceOp => "data_source_op",
            VmOperation::CreateVtpm => "create_vtpm",
            VmOperation::PowerStateReset => "power_state_reset",
        }
    }
}

impl std::fmt::Display for VmOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// VBD operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VbdOperation {
    Attach,
    Plug,
    Unplug,
    UnplugForce,
    Insert,
    Eject,
    Destroy,
}

impl VbdOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            VbdOperation::Attach => "attach",
            VbdOperation::Plug => "plug",
            VbdOperation::Unplug => "unplug",
            VbdOperation::UnplugForce => "unplug_force",
            VbdOperation::Insert => "insert",
            VbdOperation::Eject => "eject",
            VbdOperation::Destroy => "destroy",
        }
    }
}

impl std::fmt::Display for VbdOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// VIF operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VifOperation {
    Attach,
    Plug,
    Unplug,
    UnplugForce,
    Destroy,
}

impl VifOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            VifOperation::Attach => "attach",
            VifOperation::Plug => "plug",
            VifOperation::Unplug => "unplug",
            VifOperation::UnplugForce => "unplug_force",
            VifOperation::Destroy => "destroy",
        }
    }
}

impl std::fmt::Display for VifOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// VDI operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VdiOperation {
    Clone,
    Copy,
    Snapshot,
    Mirror,
    Resize,
    ResizeOnline,
    Destroy,
    DataDestroy,
    Forget,
    Update,
    ForceUnlock,
    GenerateConfig,
    EnableCbt,
    DisableCbt,
    ListChangedBlocks,
    SetOnBoot,
}

impl VdiOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            VdiOperation::Clone => "clone",
            VdiOperation::Copy => "copy",
            VdiOperation::Snapshot => "snapshot",
            VdiOperation::Mirror => "mirror",
            VdiOperation::Resize => "resize",
            VdiOperation::ResizeOnline => "resize_online",
            VdiOperation::Destroy => "destroy",
            VdiOperation::DataDestroy => "data_destroy",
            VdiOperation::Forget => "forget",
            VdiOperation::Update => "update",
            VdiOperation::ForceUnlock => "force_unlock",
            VdiOperation::GenerateConfig => "generate_config",
            VdiOperation::EnableCbt => "enable_cbt",
            VdiOperation::DisableCbt => "disable_cbt",
            VdiOperation::ListChangedBlocks => "list_changed_blocks",
            VdiOperation::SetOnBoot => "set_on_boot",
        }
    }
}

impl std::fmt::Display for VdiOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// SR operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SrOperation {
    Scan,
    Probe,
    Destroy,
    Forget,
    Update,
    PlugPbd,
    UnplugPbd,
    VdiCreate,
    VdiDestroy,
    VdiClone,
    VdiSnapshot,
    VdiResize,
    VdiIntroduce,
    VdiMirror,
    VdiEnableCbt,
    VdiDisableCbt,
    VdiDataDestroy,
    VdiListChangedBlocks,
}

impl SrOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            SrOperation::Scan => "scan",
            SrOperation::Probe => "probe",
            SrOperation::Destroy => "destroy",
            SrOperation::Forget => "forget",
            SrOperation::Update => "update",
            SrOperation::PlugPbd => "plug_pbd",
            SrOperation::UnplugPbd => "unplug_pbd",
            SrOperation::VdiCreate => "vdi_create",
            SrOperation::VdiDestroy => "vdi_destroy",
            SrOperation::VdiClone => "vdi_clone",
            SrOperation::VdiSnapshot => "vdi_snapshot",
            SrOperation::VdiResize => "vdi_resize",
            SrOperation::VdiIntroduce => "vdi_introduce",
            SrOperation::VdiMirror => "vdi_mirror",
            SrOperation::VdiEnableCbt => "vdi_enable_cbt",
            SrOperation::VdiDisableCbt => "vdi_disable_cbt",
            SrOperation::VdiDataDestroy => "vdi_data_destroy",
            SrOperation::VdiListChangedBlocks => "vdi_list_changed_blocks",
        }
    }
}

impl std::fmt::Display for SrOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Task operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOperation {
    Cancel,
    Destroy,
}

// ============================================================================
// Storage enums
// ============================================================================

/// VDI content type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VdiType {
    User,
    System,
    Suspend,
    Crashdump,
    HaStatefile,
    RedoLog,
    Metadata,
    Rrd,
    CbtMetadata,
    PvsCache,
    Ephemeral,
}

impl VdiType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VdiType::User => "user",
            VdiType::System => "system",
            VdiType::Suspend => "suspend",
            VdiType::Crashdump => "crashdump",
            VdiType::HaStatefile => "ha_statefile",
            VdiType::RedoLog => "redo_log",
            VdiType::Metadata => "metadata",
            VdiType::Rrd => "rrd",
            VdiType::CbtMetadata => "cbt_metadata",
            VdiType::PvsCache => "pvs_cache",
            VdiType::Ephemeral => "ephemeral",
        }
    }
}

impl std::fmt::Display for VdiType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Reset-on-boot behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnBoot {
    Persist,
    Reset,
}

impl Default for OnBoot {
    fn default() -> Self {
        Self::Persist
    }
}

/// VBD access mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VbdMode {
    #[serde(rename = "RO")]
    Ro,
    #[serde(rename = "RW")]
    Rw,
}

/// VBD device type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VbdType {
    Disk,
    Cd,
    Floppy,
}

/// Capabilities advertised by a storage backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SmCapability {
    SrProbe,
    SrUpdate,
    SrScan,
    VdiCreate,
    VdiDelete,
    VdiClone,
    VdiSnapshot,
    VdiResize,
    VdiResizeOnline,
    VdiMirror,
    VdiIntroduce,
    VdiUpdate,
    VdiGenerateConfig,
    VdiEnableCbt,
    VdiDataDestroy,
    VdiListChangedBlocks,
}

/// VIF locking mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VifLockingMode {
    NetworkDefault,
    Locked,
    Unlocked,
    Disabled,
}

impl Default for VifLockingMode {
    fn default() -> Self {
        Self::NetworkDefault
    }
}

/// VGPU implementation family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VgpuImplementation {
    Passthrough,
    Nvidia,
    GvtG,
    Mxgpu,
}

/// Console protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleProtocol {
    Vt100,
    Rfb,
    Rdp,
}

// ============================================================================
// Task status
// ============================================================================

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Completed,
    Failed,
    Cancelling,
    Cancelled,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskStatus {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

// ============================================================================
// Records
// ============================================================================

/// The pool singleton
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolRecord {
    pub reference: Ref,
    pub uuid: Uuid,
    pub name_label: String,
    /// Current coordinator host
    pub master: Ref,
    pub default_sr: Ref,
    pub ha_enabled: bool,
    pub ha_reboot_vm_on_internal_shutdown: bool,
    /// Feature flag map
    pub restrictions: HashMap<String, String>,
    pub guest_agent_config: HashMap<String, String>,
    pub other_config: HashMap<String, String>,
}

/// Key in `PoolRecord::other_config` marking a rolling pool upgrade
pub const ROLLING_UPGRADE_IN_PROGRESS: &str = "rolling_upgrade_in_progress";

impl PoolRecord {
    /// Rolling upgrade mode is derived, never stored as a field
    pub fn rolling_upgrade_in_progress(&self) -> bool {
        self.other_config.contains_key(ROLLING_UPGRADE_IN_PROGRESS)
    }
}

/// A physical host
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostRecord {
    pub reference: Ref,
    pub uuid: Uuid,
    pub name_label: String,
    pub address: String,
    pub enabled: bool,
    pub software_version: HashMap<String, String>,
    pub api_version_major: i64,
    pub api_version_minor: i64,
    pub external_auth_type: String,
    pub metrics: Ref,
    pub resident_vms: Vec<Ref>,
    pub pbds: Vec<Ref>,
    pub local_cache_sr: Ref,
    pub tls_verification_enabled: bool,
    pub other_config: HashMap<String, String>,
}

/// A virtual machine (also templates, snapshots and the control domain)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmRecord {
    pub reference: Ref,
    pub uuid: Uuid,
    pub name_label: String,
    pub power_state: PowerState,
    pub is_a_template: bool,
    pub is_a_snapshot: bool,
    pub snapshot_of: Ref,
    pub snapshot_time: Option<DateTime<Utc>>,
    pub is_control_domain: bool,
    pub domain_type: DomainType,
    /// Domain id on the resident host, -1 when none
    pub domid: i64,
    pub vcpus_max: i64,
    pub vcpus_at_startup: i64,
    pub memory_static_min: i64,
    pub memory_dynamic_min: i64,
    pub memory_dynamic_max: i64,
    pub memory_static_max: i64,
    pub vbds: Vec<Ref>,
    pub vifs: Vec<Ref>,
    pub vgpus: Vec<Ref>,
    pub vusbs: Vec<Ref>,
    pub vtpms: Vec<Ref>,
    pub consoles: Vec<Ref>,
    /// PCI devices currently passed through
    pub attached_pcis: Vec<Ref>,
    pub resident_on: Ref,
    pub scheduled_to_be_resident_on: Ref,
    pub suspend_vdi: Ref,
    pub metrics: Ref,
    pub guest_metrics: Ref,
    pub appliance: Ref,
    pub protection_policy: Ref,
    pub snapshot_schedule: Ref,
    pub last_boot_cpu_flags: HashMap<String, String>,
    /// Serialised record captured at boot, refreshed on suspend
    pub last_booted_record: String,
    pub platform: HashMap<String, String>,
    pub hvm_boot_params: HashMap<String, String>,
    pub nvram: HashMap<String, String>,
    /// Explicit user blocks, op kind to reason
    pub blocked_operations: HashMap<VmOperation, String>,
    pub actions_after_shutdown: ActionAfter,
    pub actions_after_reboot: ActionAfter,
    pub actions_after_crash: ActionAfter,
    pub actions_after_softreboot: ActionAfter,
    pub requires_reboot: bool,
    pub pending_guidances: Vec<UpdateGuidance>,
    pub current_operations: HashMap<Ref, VmOperation>,
    pub allowed_operations: Vec<VmOperation>,
    pub other_config: HashMap<String, String>,
}

impl Default for VmRecord {
    fn default() -> Self {
        Self {
            reference: Ref::null(),
            uuid: Uuid::nil(),
            name_label: String::new(),
            power_state: PowerState::Halted,
            is_a_template: false,
            is_a_snapshot: false,
            snapshot_of: Ref::null(),
            snapshot_time: None,
            is_control_domain: false,
            domain_type: DomainType::Unspecified,
            domid: -1,
            vcpus_max: 1,
            vcpus_at_startup: 1,
            memory_static_min: 0,
            memory_dynamic_min: 0,
            memory_dynamic_max: 0,
            memory_static_max: 0,
            vbds: Vec::new(),
            vifs: Vec::new(),
            vgpus: Vec::new(),
            vusbs: Vec::new(),
            vtpms: Vec::new(),
            consoles: Vec::new(),
            attached_pcis: Vec::new(),
            resident_on: Ref::null(),
            scheduled_to_be_resident_on: Ref::null(),
            suspend_vdi: Ref::null(),
            metrics: Ref::null(),
            guest_metrics: Ref::null(),
            appliance: Ref::null(),
            protection_policy: Ref::null(),
            snapshot_schedule: Ref::null(),
            last_boot_cpu_flags: HashMap::new(),
            last_booted_record: String::new(),
            platform: HashMap::new(),
            hvm_boot_params: HashMap::new(),
            nvram: HashMap::new(),
            blocked_operations: HashMap::new(),
            actions_after_shutdown: ActionAfter::Destroy,
            actions_after_reboot: ActionAfter::Restart,
            actions_after_crash: ActionAfter::Restart,
            actions_after_softreboot: ActionAfter::Restart,
            requires_reboot: false,
            pending_guidances: Vec::new(),
            current_operations: HashMap::new(),
            allowed_operations: Vec::new(),
            other_config: HashMap::new(),
        }
    }
}

impl VmRecord {
    /// True when a platform key is set to a truthy value
    pub fn platform_flag(&self, key: &str) -> bool {
        matches!(
            self.platform.get(key).map(|s| s.as_str()),
            Some("true") | Some("1")
        )
    }
}

/// Guidance left pending after host or tool updates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateGuidance {
    RestartDeviceModel,
    RestartVm,
    RebootHost,
}

/// Per-VM runtime metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmMetricsRecord {
    pub reference: Ref,
    pub uuid: Uuid,
    pub vm: Ref,
    pub current_domain_type: DomainType,
    pub nomigrate: bool,
    pub nested_virt: bool,
    pub start_time: DateTime<Utc>,
}

/// Guest-agent reported data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmGuestMetricsRecord {
    pub reference: Ref,
    pub uuid: Uuid,
    pub vm: Ref,
    pub os_version: HashMap<String, String>,
    pub networks: HashMap<String, String>,
    /// Capability flags and hints, e.g. feature-shutdown, data-cant-suspend-reason
    pub other: HashMap<String, String>,
    pub last_updated: DateTime<Utc>,
}

/// A virtual block device binding a VM to a VDI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VbdRecord {
    pub reference: Ref,
    pub uuid: Uuid,
    pub vm: Ref,
    pub vdi: Ref,
    pub userdevice: String,
    pub mode: VbdMode,
    pub vbd_type: VbdType,
    pub bootable: bool,
    pub empty: bool,
    pub currently_attached: bool,
    pub reserved: bool,
    pub current_operations: HashMap<Ref, VbdOperation>,
    pub allowed_operations: Vec<VbdOperation>,
    pub other_config: HashMap<String, String>,
}

/// A virtual network interface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VifRecord {
    pub reference: Ref,
    pub uuid: Uuid,
    pub vm: Ref,
    pub network: Ref,
    pub device: String,
    pub mac: String,
    pub locking_mode: VifLockingMode,
    pub currently_attached: bool,
    pub reserved: bool,
    pub ipv4_configuration_mode: String,
    pub ipv4_addresses: Vec<String>,
    pub ipv6_configuration_mode: String,
    pub ipv6_addresses: Vec<String>,
    /// SR-IOV virtual function reserved for this VIF
    pub reserved_pci: Ref,
    pub current_operations: HashMap<Ref, VifOperation>,
    pub allowed_operations: Vec<VifOperation>,
    pub other_config: HashMap<String, String>,
}

/// A virtual disk image
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VdiRecord {
    pub reference: Ref,
    pub uuid: Uuid,
    pub name_label: String,
    pub sr: Ref,
    pub vbds: Vec<Ref>,
    pub location: String,
    pub vdi_type: VdiType,
    pub virtual_size: i64,
    pub physical_utilisation: i64,
    pub sharable: bool,
    pub read_only: bool,
    pub managed: bool,
    pub missing: bool,
    pub on_boot: OnBoot,
    pub allow_caching: bool,
    pub cbt_enabled: bool,
    pub is_a_snapshot: bool,
    pub snapshot_of: Ref,
    pub snapshot_time: Option<DateTime<Utc>>,
    pub metadata_of_pool: Ref,
    pub is_tools_iso: bool,
    pub current_operations: HashMap<Ref, VdiOperation>,
    pub allowed_operations: Vec<VdiOperation>,
    pub sm_config: HashMap<String, String>,
    pub other_config: HashMap<String, String>,
}

/// A storage repository
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SrRecord {
    pub reference: Ref,
    pub uuid: Uuid,
    pub name_label: String,
    pub name_description: String,
    pub sr_type: String,
    pub content_type: String,
    pub pbds: Vec<Ref>,
    pub vdis: Vec<Ref>,
    pub physical_size: i64,
    pub physical_utilisation: i64,
    pub virtual_allocation: i64,
    pub shared: bool,
    pub clustered: bool,
    pub is_tools_sr: bool,
    /// Capabilities advertised by the backend plugin
    pub capabilities: Vec<SmCapability>,
    pub sm_config: HashMap<String, String>,
    /// Carries auto_scan and indestructible
    pub other_config: HashMap<String, String>,
    pub current_operations: HashMap<Ref, SrOperation>,
    pub allowed_operations: Vec<SrOperation>,
}

impl SrRecord {
    pub fn is_indestructible(&self) -> bool {
        self.other_config.get("indestructible").map(|s| s.as_str()) == Some("true")
    }

    pub fn auto_scan(&self) -> bool {
        self.other_config.get("auto_scan").map(|s| s.as_str()) == Some("true")
    }

    pub fn has_capability(&self, cap: SmCapability) -> bool {
        self.capabilities.contains(&cap)
    }
}

/// The binding of an SR to a host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PbdRecord {
    pub reference: Ref,
    pub uuid: Uuid,
    pub sr: Ref,
    pub host: Ref,
    pub device_config: HashMap<String, String>,
    pub currently_attached: bool,
    pub other_config: HashMap<String, String>,
}

/// A passthrough-capable PCI device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PciRecord {
    pub reference: Ref,
    pub uuid: Uuid,
    pub host: Ref,
    pub pci_id: String,
    pub class_name: String,
    pub vendor_name: String,
    pub device_name: String,
    pub attached_vms: Vec<Ref>,
}

/// A physical GPU
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PgpuRecord {
    pub reference: Ref,
    pub uuid: Uuid,
    pub host: Ref,
    pub pci: Ref,
    /// Vendor metadata; key "vgpu-migration" advertises live migration
    pub compatibility_metadata: HashMap<String, String>,
}

pub const PGPU_MIGRATION_KEY: &str = "vgpu-migration";

impl PgpuRecord {
    pub fn supports_migration(&self) -> bool {
        self.compatibility_metadata
            .get(PGPU_MIGRATION_KEY)
            .map(|s| s.as_str())
            == Some("true")
    }
}

/// A virtual GPU
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VgpuRecord {
    pub reference: Ref,
    pub uuid: Uuid,
    pub vm: Ref,
    pub pgpu: Ref,
    pub device: String,
    pub implementation: VgpuImplementation,
    pub currently_attached: bool,
}

/// A physical USB device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PusbRecord {
    pub reference: Ref,
    pub uuid: Uuid,
    pub host: Ref,
    pub path: String,
    pub passthrough_enabled: bool,
}

/// A virtual USB device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VusbRecord {
    pub reference: Ref,
    pub uuid: Uuid,
    pub vm: Ref,
    pub pusb: Ref,
    pub currently_attached: bool,
    pub other_config: HashMap<String, String>,
}

/// A virtual trusted platform module
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VtpmRecord {
    pub reference: Ref,
    pub uuid: Uuid,
    pub vm: Ref,
    pub is_unique: bool,
    pub is_protected: bool,
}

/// A virtual network
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkRecord {
    pub reference: Ref,
    pub uuid: Uuid,
    pub name_label: String,
    pub bridge: String,
    pub vifs: Vec<Ref>,
    pub pifs: Vec<Ref>,
    pub other_config: HashMap<String, String>,
}

/// A physical network interface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PifRecord {
    pub reference: Ref,
    pub uuid: Uuid,
    pub host: Ref,
    pub network: Ref,
    pub device: String,
    pub mac: String,
    pub currently_attached: bool,
    pub management: bool,
}

/// A guest console endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleRecord {
    pub reference: Ref,
    pub uuid: Uuid,
    pub vm: Ref,
    pub protocol: ConsoleProtocol,
    pub location: String,
}

/// A long-running operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub reference: Ref,
    pub uuid: Uuid,
    pub name_label: String,
    pub created: DateTime<Utc>,
    pub finished: Option<DateTime<Utc>>,
    pub status: TaskStatus,
    /// Progress in [0, 1]
    pub progress: f64,
    pub result: String,
    pub error_info: Vec<String>,
    pub subtask_of: Ref,
    pub subtasks: Vec<Ref>,
    pub cancellable: bool,
    pub resident_on: Ref,
    /// Rows on which this task holds a current_operations entry
    pub locked_objects: Vec<(Class, Ref)>,
    pub allowed_operations: Vec<TaskOperation>,
    pub other_config: HashMap<String, String>,
}

/// An administrator-visible alert
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub reference: Ref,
    pub uuid: Uuid,
    pub name: String,
    pub priority: i64,
    pub cls: Class,
    pub obj_uuid: Uuid,
    pub timestamp: DateTime<Utc>,
    pub body: String,
}

/// An RBAC role
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleRecord {
    pub reference: Ref,
    pub uuid: Uuid,
    pub name_label: String,
    pub subroles: Vec<Ref>,
}

/// An external identity granted access
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectRecord {
    pub reference: Ref,
    pub uuid: Uuid,
    pub subject_identifier: String,
    pub roles: Vec<Ref>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ref_generate() {
        let a = Ref::generate();
        let b = Ref::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("OpaqueRef:"));
        assert!(!a.is_null());
        assert!(Ref::null().is_null());
    }

    #[test]
    fn test_wire_names_roundtrip() {
        for class in ALL_CLASSES {
            assert_eq!(Class::from_wire_name(class.wire_name()), Some(*class));
        }
    }

    #[test]
    fn test_operation_wire_strings() {
        let json = serde_json::to_string(&VmOperation::SnapshotWithQuiesce).unwrap();
        assert_eq!(json, "\"snapshot_with_quiesce\"");
        assert_eq!(
            VmOperation::SnapshotWithQuiesce.as_str(),
            "snapshot_with_quiesce"
        );
        let json = serde_json::to_string(&VdiOperation::ResizeOnline).unwrap();
        assert_eq!(json, "\"resize_online\"");
        let json = serde_json::to_string(&PowerState::Halted).unwrap();
        assert_eq!(json, "\"halted\"");
    }

    #[test]
    fn test_rolling_upgrade_derived() {
        let mut pool = PoolRecord::default();
        assert!(!pool.rolling_upgrade_in_progress());
        pool.other_config
            .insert(ROLLING_UPGRADE_IN_PROGRESS.to_string(), "true".to_string());
        assert!(pool.rolling_upgrade_in_progress());
    }

    #[test]
    fn test_vm_record_default() {
        let vm = VmRecord::default();
        assert_eq!(vm.power_state, PowerState::Halted);
        assert_eq!(vm.domid, -1);
        assert!(vm.resident_on.is_null());
    }
}
