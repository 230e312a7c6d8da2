//! API Error Taxonomy
//!
//! Every user-visible failure is a stable `(code, args)` pair. Clients match
//! on the code string; the argument list carries the offending references and
//! values in a fixed order per code.

use serde::{Deserialize, Serialize};

/// Stable error codes seen by clients
pub mod codes {
    pub const BAD_POWER_STATE: &str = "bad_power_state";
    pub const OPERATION_BLOCKED: &str = "operation_blocked";
    pub const OPERATION_NOT_ALLOWED: &str = "operation_not_allowed";
    pub const OTHER_OPERATION_IN_PROGRESS: &str = "other_operation_in_progress";
    pub const VM_IS_TEMPLATE: &str = "vm_is_template";
    pub const VM_IS_SNAPSHOT: &str = "vm_is_snapshot";
    pub const VM_IS_IMMOBILE: &str = "vm_is_immobile";
    pub const VM_LACKS_FEATURE: &str = "vm_lacks_feature";
    pub const VM_NON_SUSPENDABLE: &str = "vm_non_suspendable";
    pub const VM_HAS_PCI_ATTACHED: &str = "vm_has_pci_attached";
    pub const VM_HAS_VGPU: &str = "vm_has_vgpu";
    pub const VM_HAS_VUSBS: &str = "vm_has_vusbs";
    pub const VM_IS_PART_OF_AN_APPLIANCE: &str = "vm_is_part_of_an_appliance";
    pub const VM_ASSIGNED_TO_PROTECTION_POLICY: &str = "vm_assigned_to_protection_policy";
    pub const VM_ASSIGNED_TO_SNAPSHOT_SCHEDULE: &str = "vm_assigned_to_snapshot_schedule";
    pub const VTPM_MAX_AMOUNT_REACHED: &str = "vtpm_max_amount_reached";
    pub const VTPM_UNIMPLEMENTED: &str = "vtpm_unimplemented";
    pub const VBD_NOT_REMOVABLE_MEDIA: &str = "vbd_not_removable_media";
    pub const VBD_IS_EMPTY: &str = "vbd_is_empty";
    pub const VBD_NOT_EMPTY: &str = "vbd_not_empty";
    pub const DEVICE_ALREADY_ATTACHED: &str = "device_already_attached";
    pub const DEVICE_ALREADY_DETACHED: &str = "device_already_detached";
    pub const VDI_IN_USE: &str = "vdi_in_use";
    pub const VDI_INCOMPATIBLE_TYPE: &str = "vdi_incompatible_type";
    pub const VDI_ON_BOOT_MODE_INCOMPATIBLE_WITH_OPERATION: &str =
        "vdi_on_boot_mode_incompatible_with_operation";
    pub const SR_OPERATION_NOT_SUPPORTED: &str = "sr_operation_not_supported";
    pub const SR_HAS_PBD: &str = "sr_has_pbd";
    pub const SR_NO_PBDS: &str = "sr_no_pbds";
    pub const SR_NOT_EMPTY: &str = "sr_not_empty";
    pub const SR_INDESTRUCTIBLE: &str = "sr_indestructible";
    pub const SR_IS_CACHE_SR: &str = "sr_is_cache_sr";
    pub const HA_IS_ENABLED: &str = "ha_is_enabled";
    pub const NOT_SUPPORTED_DURING_UPGRADE: &str = "not_supported_during_upgrade";
    pub const HOST_UNKNOWN_TO_MASTER: &str = "host_unknown_to_master";
    pub const HOST_MASTER_CANNOT_TALK_BACK: &str = "host_master_cannot_talk_back";
    pub const HOST_XAPI_VERSION_HIGHER_THAN_COORDINATOR: &str =
        "host_xapi_version_higher_than_coordinator";
    pub const HOST_DISABLED: &str = "host_disabled";
    pub const HOST_NOT_ENOUGH_FREE_MEMORY: &str = "host_not_enough_free_memory";
    pub const SESSION_AUTHENTICATION_FAILED: &str = "session_authentication_failed";
    pub const TASK_CANCELLED: &str = "task_cancelled";
    pub const HANDLE_INVALID: &str = "handle_invalid";
    pub const UUID_INVALID: &str = "uuid_invalid";
    pub const EVENTS_LOST: &str = "events_lost";
    pub const NOT_IMPLEMENTED: &str = "not_implemented";
    pub const INTERNAL_ERROR: &str = "internal_error";
}

/// A user-visible API failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    /// Stable error code
    pub code: String,
    /// Code-specific arguments, fixed order
    pub args: Vec<String>,
}

impl ApiError {
    pub fn new(code: &str, args: Vec<String>) -> Self {
        Self {
            code: code.to_string(),
            args,
        }
    }

    /// Wrong power state: args are [expected, actual, object ref]
    pub fn bad_power_state(reference: &str, expected: &str, actual: &str) -> Self {
        Self::new(
            codes::BAD_POWER_STATE,
            vec![
                reference.to_string(),
                expected.to_string(),
                actual.to_string(),
            ],
        )
    }

    /// Another operation holds the semantic lock: args are [class, ref, task ref, op]
    pub fn other_operation_in_progress(class: &str, reference: &str, task: &str, op: &str) -> Self {
        Self::new(
            codes::OTHER_OPERATION_IN_PROGRESS,
            vec![
                class.to_string(),
                reference.to_string(),
                task.to_string(),
                op.to_string(),
            ],
        )
    }

    pub fn operation_blocked(reference: &str, reason: &str) -> Self {
        Self::new(
            codes::OPERATION_BLOCKED,
            vec![reference.to_string(), reason.to_string()],
        )
    }

    pub fn operation_not_allowed(reason: &str) -> Self {
        Self::new(codes::OPERATION_NOT_ALLOWED, vec![reason.to_string()])
    }

    pub fn handle_invalid(class: &str, reference: &str) -> Self {
        Self::new(
            codes::HANDLE_INVALID,
            vec![class.to_string(), reference.to_string()],
        )
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL_ERROR, vec![message.into()])
    }

    pub fn task_cancelled(task: &str) -> Self {
        Self::new(codes::TASK_CANCELLED, vec![task.to_string()])
    }

    /// True if this error carries the given code
    pub fn has_code(&self, code: &str) -> bool {
        self.code == code
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.args.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{} [{}]", self.code, self.args.join(", "))
        }
    }
}

impl std::error::Error for ApiError {}

/// Shorthand result for API entry points
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let e = ApiError::bad_power_state("OpaqueRef:x", "running", "halted");
        assert_eq!(e.code, codes::BAD_POWER_STATE);
        assert_eq!(e.to_string(), "bad_power_state [OpaqueRef:x, running, halted]");
    }

    #[test]
    fn test_roundtrip() {
        let e = ApiError::operation_blocked("OpaqueRef:y", "maintenance");
        let json = serde_json::to_string(&e).unwrap();
        let back: ApiError = serde_json::from_str(&json).unwrap();
        assert_eq!(e, back);
    }
}
