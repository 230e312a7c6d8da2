//! VIF Operation Admission

use crate::api_error::{codes, ApiError, ApiResult};
use crate::db::models::*;
use crate::db::Database;

pub const ALL_VIF_OPERATIONS: &[VifOperation] = &[
    VifOperation::Attach,
    VifOperation::Plug,
    VifOperation::Unplug,
    VifOperation::UnplugForce,
    VifOperation::Destroy,
];

fn allowed_concurrently(op: VifOperation, in_flight: VifOperation) -> bool {
    matches!(
        (op, in_flight),
        (VifOperation::Plug, VifOperation::Plug) | (VifOperation::Attach, VifOperation::Attach)
    )
}

pub fn check_vif_operation(db: &Database, vif: &VifRecord, op: VifOperation) -> ApiResult<()> {
    let reference = vif.reference.as_str();

    for (task, in_flight) in &vif.current_operations {
        if !allowed_concurrently(op, *in_flight) {
            return Err(ApiError::other_operation_in_progress(
                "VIF",
                reference,
                task.as_str(),
                in_flight.as_str(),
            ));
        }
    }

    let vm = db
        .vms
        .try_get(&vif.vm)
        .ok_or_else(|| ApiError::handle_invalid("VM", vif.vm.as_str()))?;

    if vm.is_a_template {
        return Err(ApiError::operation_not_allowed(
            "VIFs of a template cannot be operated on",
        ));
    }

    if matches!(
        op,
        VifOperation::Plug | VifOperation::Unplug | VifOperation::UnplugForce
    ) && vm.power_state != PowerState::Running
    {
        return Err(ApiError::bad_power_state(
            vm.reference.as_str(),
            PowerState::Running.as_str(),
            vm.power_state.as_str(),
        ));
    }

    match op {
        VifOperation::Plug => {
            if vif.currently_attached {
                return Err(ApiError::new(
                    codes::DEVICE_ALREADY_ATTACHED,
                    vec![reference.to_string()],
                ));
            }
        }
        VifOperation::Unplug | VifOperation::UnplugForce => {
            if !vif.currently_attached {
                return Err(ApiError::new(
                    codes::DEVICE_ALREADY_DETACHED,
                    vec![reference.to_string()],
                ));
            }
        }
        VifOperation::Destroy => {
            if vif.currently_attached {
                return Err(ApiError::operation_not_allowed(
                    "VIF is currently attached; unplug it first",
                ));
            }
        }
        VifOperation::Attach => {}
    }

    Ok(())
}

pub fn assert_vif_operation_valid(db: &Database, vif_ref: &Ref, op: VifOperation) -> ApiResult<()> {
    let vif = db
        .vifs
        .try_get(vif_ref)
        .ok_or_else(|| ApiError::handle_invalid("VIF", vif_ref.as_str()))?;
    check_vif_operation(db, &vif, op)
}

pub fn update_vif_allowed_operations(db: &Database, vif_ref: &Ref) {
    let Some(vif) = db.vifs.try_get(vif_ref) else {
        return;
    };
    let allowed: Vec<VifOperation> = ALL_VIF_OPERATIONS
        .iter()
        .copied()
        .filter(|op| check_vif_operation(db, &vif, *op).is_ok())
        .collect();
    if allowed != vif.allowed_operations {
        let _ = db.vifs.update(vif_ref, |vif| vif.allowed_operations = allowed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use std::sync::Arc;
    use uuid::Uuid;

    fn setup(power_state: PowerState) -> (Database, VifRecord) {
        let db = Database::new(Arc::new(EventBus::default()));
        let vm = VmRecord {
            reference: Ref::generate(),
            uuid: Uuid::new_v4(),
            power_state,
            ..Default::default()
        };
        let vif = VifRecord {
            reference: Ref::generate(),
            uuid: Uuid::new_v4(),
            vm: vm.reference.clone(),
            network: Ref::generate(),
            device: "0".to_string(),
            mac: "de:ad:be:ef:00:01".to_string(),
            locking_mode: VifLockingMode::NetworkDefault,
            currently_attached: false,
            reserved: false,
            ipv4_configuration_mode: "None".to_string(),
            ipv4_addresses: Vec::new(),
            ipv6_configuration_mode: "None".to_string(),
            ipv6_addresses: Vec::new(),
            reserved_pci: Ref::null(),
            current_operations: Default::default(),
            allowed_operations: Vec::new(),
            other_config: Default::default(),
        };
        db.vms.insert(vm).unwrap();
        db.vifs.insert(vif.clone()).unwrap();
        (db, vif)
    }

    #[test]
    fn test_plug_unplug_states() {
        let (db, mut vif) = setup(PowerState::Running);
        assert!(check_vif_operation(&db, &vif, VifOperation::Plug).is_ok());
        vif.currently_attached = true;
        let err = check_vif_operation(&db, &vif, VifOperation::Plug).unwrap_err();
        assert_eq!(err.code, codes::DEVICE_ALREADY_ATTACHED);
        assert!(check_vif_operation(&db, &vif, VifOperation::Unplug).is_ok());
    }

    #[test]
    fn test_hotplug_needs_running_vm() {
        let (db, vif) = setup(PowerState::Halted);
        let err = check_vif_operation(&db, &vif, VifOperation::Plug).unwrap_err();
        assert_eq!(err.code, codes::BAD_POWER_STATE);
        // Destroy of a detached VIF is fine on a halted VM
        assert!(check_vif_operation(&db, &vif, VifOperation::Destroy).is_ok());
    }

    #[test]
    fn test_update_allowed_cache() {
        let (db, vif) = setup(PowerState::Running);
        update_vif_allowed_operations(&db, &vif.reference);
        let allowed = db.vifs.get(&vif.reference).unwrap().allowed_operations;
        assert!(allowed.contains(&VifOperation::Plug));
        assert!(!allowed.contains(&VifOperation::Unplug));
    }
}
