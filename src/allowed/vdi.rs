//! VDI Operation Admission
//!
//! Ordered checks on virtual disks: in-flight operations, disk type
//! compatibility, HA-protected disks, backend capabilities, attachment
//! state, reset-on-boot interactions and the rolling-upgrade allowlist.

use lazy_static::lazy_static;
use std::collections::HashSet;

use crate::api_error::{codes, ApiError, ApiResult};
use crate::db::models::*;
use crate::db::Database;

pub const ALL_VDI_OPERATIONS: &[VdiOperation] = &[
    VdiOperation::Clone,
    VdiOperation::Copy,
    VdiOperation::Snapshot,
    VdiOperation::Mirror,
    VdiOperation::Resize,
    VdiOperation::ResizeOnline,
    VdiOperation::Destroy,
    VdiOperation::DataDestroy,
    VdiOperation::Forget,
    VdiOperation::Update,
    VdiOperation::ForceUnlock,
    VdiOperation::GenerateConfig,
    VdiOperation::EnableCbt,
    VdiOperation::DisableCbt,
    VdiOperation::ListChangedBlocks,
    VdiOperation::SetOnBoot,
];

lazy_static! {
    /// The only operations valid on a changed-block metadata stub
    static ref CBT_METADATA_OPERATIONS: HashSet<VdiOperation> = [
        VdiOperation::DataDestroy,
        VdiOperation::Forget,
        VdiOperation::ListChangedBlocks,
    ]
    .into_iter()
    .collect();

    /// Operations permitted while a VBD is attached to the disk
    static ref LIVE_OPERATIONS: HashSet<VdiOperation> = [
        VdiOperation::Snapshot,
        VdiOperation::ResizeOnline,
        VdiOperation::Clone,
        VdiOperation::Copy,
        VdiOperation::Mirror,
        VdiOperation::EnableCbt,
        VdiOperation::DisableCbt,
        VdiOperation::DataDestroy,
        VdiOperation::ListChangedBlocks,
    ]
    .into_iter()
    .collect();

    /// Operations permitted during a rolling pool upgrade
    static ref RPU_ALLOWED_OPERATIONS: HashSet<VdiOperation> = [
        VdiOperation::Clone,
        VdiOperation::Copy,
        VdiOperation::Snapshot,
        VdiOperation::Destroy,
        VdiOperation::Forget,
    ]
    .into_iter()
    .collect();

    /// Disk types destroy/forget/resize must not touch while HA is armed
    static ref HA_PROTECTED_TYPES: HashSet<VdiType> =
        [VdiType::HaStatefile, VdiType::RedoLog].into_iter().collect();
}

/// Backend capability required to carry out an operation. Clone is absent:
/// when the backend cannot clone, the implementation falls back to a copy.
fn required_capability(op: VdiOperation) -> Option<SmCapability> {
    match op {
        VdiOperation::Snapshot => Some(SmCapability::VdiSnapshot),
        VdiOperation::Mirror => Some(SmCapability::VdiMirror),
        VdiOperation::Resize => Some(SmCapability::VdiResize),
        VdiOperation::ResizeOnline => Some(SmCapability::VdiResizeOnline),
        VdiOperation::Destroy => Some(SmCapability::VdiDelete),
        VdiOperation::DataDestroy => Some(SmCapability::VdiDataDestroy),
        VdiOperation::Update => Some(SmCapability::VdiUpdate),
        VdiOperation::GenerateConfig => Some(SmCapability::VdiGenerateConfig),
        VdiOperation::EnableCbt | VdiOperation::DisableCbt => Some(SmCapability::VdiEnableCbt),
        VdiOperation::ListChangedBlocks => Some(SmCapability::VdiListChangedBlocks),
        _ => None,
    }
}

pub fn check_vdi_operation(db: &Database, vdi: &VdiRecord, op: VdiOperation) -> ApiResult<()> {
    let reference = vdi.reference.as_str();

    // Concurrent-operations policy: disk operations are exclusive
    if let Some((task, in_flight)) = vdi.current_operations.iter().next() {
        return Err(ApiError::other_operation_in_progress(
            "VDI",
            reference,
            task.as_str(),
            in_flight.as_str(),
        ));
    }

    // The tools image is immutable
    if vdi.is_tools_iso
        && matches!(
            op,
            VdiOperation::Destroy
                | VdiOperation::DataDestroy
                | VdiOperation::Forget
                | VdiOperation::Resize
                | VdiOperation::ResizeOnline
                | VdiOperation::SetOnBoot
        )
    {
        return Err(ApiError::operation_not_allowed(
            "the tools image cannot be modified",
        ));
    }

    // A metadata stub is not a disk any more
    if vdi.vdi_type == VdiType::CbtMetadata && !CBT_METADATA_OPERATIONS.contains(&op) {
        return Err(ApiError::new(
            codes::VDI_INCOMPATIBLE_TYPE,
            vec![reference.to_string(), vdi.vdi_type.as_str().to_string()],
        ));
    }

    // HA state and the redo log live on disks of their own types
    if HA_PROTECTED_TYPES.contains(&vdi.vdi_type)
        && matches!(
            op,
            VdiOperation::Destroy
                | VdiOperation::Forget
                | VdiOperation::Resize
                | VdiOperation::ResizeOnline
        )
    {
        if let Ok(pool) = db.pool() {
            if pool.ha_enabled {
                return Err(ApiError::new(codes::HA_IS_ENABLED, vec![]));
            }
        }
    }

    // Backend capability
    if let Some(capability) = required_capability(op) {
        if let Some(sr) = db.srs.try_get(&vdi.sr) {
            if !sr.has_capability(capability) {
                return Err(ApiError::new(
                    codes::SR_OPERATION_NOT_SUPPORTED,
                    vec![sr.reference.as_str().to_string()],
                ));
            }
        }
    }

    // Attachment precondition, with the narrow live-operation exception
    if !LIVE_OPERATIONS.contains(&op) {
        for vbd_ref in &vdi.vbds {
            let Some(vbd) = db.vbds.try_get(vbd_ref) else {
                continue;
            };
            if vbd.currently_attached || vbd.reserved {
                return Err(ApiError::new(
                    codes::VDI_IN_USE,
                    vec![reference.to_string(), op.as_str().to_string()],
                ));
            }
        }
    }

    // Reset-on-boot interactions
    if vdi.on_boot == OnBoot::Reset {
        if op == VdiOperation::Snapshot {
            return Err(ApiError::new(
                codes::VDI_ON_BOOT_MODE_INCOMPATIBLE_WITH_OPERATION,
                vec![reference.to_string()],
            ));
        }
        if vdi.allow_caching && op == VdiOperation::Mirror {
            return Err(ApiError::new(
                codes::VDI_ON_BOOT_MODE_INCOMPATIBLE_WITH_OPERATION,
                vec![reference.to_string()],
            ));
        }
    }

    // Rolling-upgrade allowlist
    if let Ok(pool) = db.pool() {
        if pool.rolling_upgrade_in_progress() && !RPU_ALLOWED_OPERATIONS.contains(&op) {
            return Err(ApiError::new(
                codes::NOT_SUPPORTED_DURING_UPGRADE,
                vec![op.as_str().to_string()],
            ));
        }
    }

    Ok(())
}

pub fn assert_vdi_operation_valid(db: &Database, vdi_ref: &Ref, op: VdiOperation) -> ApiResult<()> {
    let vdi = db
        .vdis
        .try_get(vdi_ref)
        .ok_or_else(|| ApiError::handle_invalid("VDI", vdi_ref.as_str()))?;
    check_vdi_operation(db, &vdi, op)
}

pub fn update_vdi_allowed_operations(db: &Database, vdi_ref: &Ref) {
    let Some(vdi) = db.vdis.try_get(vdi_ref) else {
        return;
    };
    let allowed: Vec<VdiOperation> = ALL_VDI_OPERATIONS
        .iter()
        .copied()
        .filter(|op| check_vdi_operation(db, &vdi, *op).is_ok())
        .collect();
    if allowed != vdi.allowed_operations {
        let _ = db.vdis.update(vdi_ref, |vdi| vdi.allowed_operations = allowed);
    }
}
