//! VBD Operation Admission

use crate::api_error::{codes, ApiError, ApiResult};
use crate::db::models::*;
use crate::db::Database;

pub const ALL_VBD_OPERATIONS: &[VbdOperation] = &[
    VbdOperation::Attach,
    VbdOperation::Plug,
    VbdOperation::Unplug,
    VbdOperation::UnplugForce,
    VbdOperation::Insert,
    VbdOperation::Eject,
    VbdOperation::Destroy,
];

/// Hotplug of independent devices may proceed in parallel
fn allowed_concurrently(op: VbdOperation, in_flight: VbdOperation) -> bool {
    matches!(
        (op, in_flight),
        (VbdOperation::Plug, VbdOperation::Plug) | (VbdOperation::Attach, VbdOperation::Attach)
    )
}

pub fn check_vbd_operation(db: &Database, vbd: &VbdRecord, op: VbdOperation) -> ApiResult<()> {
    let reference = vbd.reference.as_str();

    // Concurrent-operations policy
    for (task, in_flight) in &vbd.current_operations {
        if !allowed_concurrently(op, *in_flight) {
            return Err(ApiError::other_operation_in_progress(
                "VBD",
                reference,
                task.as_str(),
                in_flight.as_str(),
            ));
        }
    }

    let vm = db
        .vms
        .try_get(&vbd.vm)
        .ok_or_else(|| ApiError::handle_invalid("VM", vbd.vm.as_str()))?;

    if vm.is_a_template {
        return Err(ApiError::operation_not_allowed(
            "VBDs of a template cannot be operated on",
        ));
    }

    // Hotplug needs a live domain
    if matches!(
        op,
        VbdOperation::Plug | VbdOperation::Unplug | VbdOperation::UnplugForce
    ) && vm.power_state != PowerState::Running
    {
        return Err(ApiError::bad_power_state(
            vm.reference.as_str(),
            PowerState::Running.as_str(),
            vm.power_state.as_str(),
        ));
    }

    match op {
        VbdOperation::Plug => {
            if vbd.currently_attached {
                return Err(ApiError::new(
                    codes::DEVICE_ALREADY_ATTACHED,
                    vec![reference.to_string()],
                ));
            }
        }
        VbdOperation::Unplug | VbdOperation::UnplugForce => {
            if !vbd.currently_attached {
                return Err(ApiError::new(
                    codes::DEVICE_ALREADY_DETACHED,
                    vec![reference.to_string()],
                ));
            }
        }
        VbdOperation::Insert | VbdOperation::Eject => {
            if !matches!(vbd.vbd_type, VbdType::Cd | VbdType::Floppy) {
                return Err(ApiError::new(
                    codes::VBD_NOT_REMOVABLE_MEDIA,
                    vec![reference.to_string()],
                ));
            }
            if op == VbdOperation::Insert && !vbd.empty {
                return Err(ApiError::new(
                    codes::VBD_NOT_EMPTY,
                    vec![reference.to_string()],
                ));
            }
            if op == VbdOperation::Eject && vbd.empty {
                return Err(ApiError::new(
                    codes::VBD_IS_EMPTY,
                    vec![reference.to_string()],
                ));
            }
        }
        VbdOperation::Destroy => {
            if vbd.currently_attached {
                return Err(ApiError::operation_not_allowed(
                    "VBD is currently attached; unplug it first",
                ));
            }
        }
        VbdOperation::Attach => {}
    }

    Ok(())
}

pub fn assert_vbd_operation_valid(db: &Database, vbd_ref: &Ref, op: VbdOperation) -> ApiResult<()> {
    let vbd = db
        .vbds
        .try_get(vbd_ref)
        .ok_or_else(|| ApiError::handle_invalid("VBD", vbd_ref.as_str()))?;
    check_vbd_operation(db, &vbd, op)
}

pub fn update_vbd_allowed_operations(db: &Database, vbd_ref: &Ref) {
    let Some(vbd) = db.vbds.try_get(vbd_ref) else {
        return;
    };
    let allowed: Vec<VbdOperation> = ALL_VBD_OPERATIONS
        .iter()
        .copied()
        .filter(|op| check_vbd_operation(db, &vbd, *op).is_ok())
        .collect();
    if allowed != vbd.allowed_operations {
        let _ = db.vbds.update(vbd_ref, |vbd| vbd.allowed_operations = allowed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use std::sync::Arc;
    use uuid::Uuid;

    fn setup(power_state: PowerState, vbd_type: VbdType) -> (Database, VbdRecord) {
        let db = Database::new(Arc::new(EventBus::default()));
        let vm = VmRecord {
            reference: Ref::generate(),
            uuid: Uuid::new_v4(),
            power_state,
            ..Default::default()
        };
        let vbd = VbdRecord {
            reference: Ref::generate(),
            uuid: Uuid::new_v4(),
            vm: vm.reference.clone(),
            vdi: Ref::null(),
            userdevice: "0".to_string(),
            mode: VbdMode::Rw,
            vbd_type,
            bootable: false,
            empty: false,
            currently_attached: false,
            reserved: false,
            current_operations: Default::default(),
            allowed_operations: Vec::new(),
            other_config: Default::default(),
        };
        db.vms.insert(vm).unwrap();
        db.vbds.insert(vbd.clone()).unwrap();
        (db, vbd)
    }

    #[test]
    fn test_plug_requires_running_vm() {
        let (db, vbd) = setup(PowerState::Halted, VbdType::Disk);
        let err = check_vbd_operation(&db, &vbd, VbdOperation::Plug).unwrap_err();
        assert_eq!(err.code, codes::BAD_POWER_STATE);
    }

    #[test]
    fn test_plug_attach_states() {
        let (db, mut vbd) = setup(PowerState::Running, VbdType::Disk);
        assert!(check_vbd_operation(&db, &vbd, VbdOperation::Plug).is_ok());
        vbd.currently_attached = true;
        let err = check_vbd_operation(&db, &vbd, VbdOperation::Plug).unwrap_err();
        assert_eq!(err.code, codes::DEVICE_ALREADY_ATTACHED);
        assert!(check_vbd_operation(&db, &vbd, VbdOperation::Unplug).is_ok());
        vbd.currently_attached = false;
        let err = check_vbd_operation(&db, &vbd, VbdOperation::Unplug).unwrap_err();
        assert_eq!(err.code, codes::DEVICE_ALREADY_DETACHED);
    }

    #[test]
    fn test_plug_parallel_with_plug() {
        let (db, mut vbd) = setup(PowerState::Running, VbdType::Disk);
        vbd.current_operations
            .insert(Ref::generate(), VbdOperation::Plug);
        assert!(check_vbd_operation(&db, &vbd, VbdOperation::Plug).is_ok());
        let err = check_vbd_operation(&db, &vbd, VbdOperation::Destroy).unwrap_err();
        assert_eq!(err.code, codes::OTHER_OPERATION_IN_PROGRESS);
    }

    #[test]
    fn test_media_rules() {
        let (db, disk) = setup(PowerState::Running, VbdType::Disk);
        let err = check_vbd_operation(&db, &disk, VbdOperation::Eject).unwrap_err();
        assert_eq!(err.code, codes::VBD_NOT_REMOVABLE_MEDIA);

        let (db, mut cd) = setup(PowerState::Running, VbdType::Cd);
        // Loaded drive: eject fine, insert refused
        assert!(check_vbd_operation(&db, &cd, VbdOperation::Eject).is_ok());
        let err = check_vbd_operation(&db, &cd, VbdOperation::Insert).unwrap_err();
        assert_eq!(err.code, codes::VBD_NOT_EMPTY);

        cd.empty = true;
        assert!(check_vbd_operation(&db, &cd, VbdOperation::Insert).is_ok());
        let err = check_vbd_operation(&db, &cd, VbdOperation::Eject).unwrap_err();
        assert_eq!(err.code, codes::VBD_IS_EMPTY);
    }

    #[test]
    fn test_destroy_requires_detached() {
        let (db, mut vbd) = setup(PowerState::Running, VbdType::Disk);
        vbd.currently_attached = true;
        let err = check_vbd_operation(&db, &vbd, VbdOperation::Destroy).unwrap_err();
        assert_eq!(err.code, codes::OPERATION_NOT_ALLOWED);
        vbd.currently_attached = false;
        assert!(check_vbd_operation(&db, &vbd, VbdOperation::Destroy).is_ok());
    }
}
