//! VBD Lifecycle Operations

use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::allowed;
use crate::api_error::{ApiError, ApiResult};
use crate::context::Context;
use crate::db::models::*;

use super::{run_vbd_operation, with_task};

const ATTACH_TIMEOUT: Duration = Duration::from_secs(30);

/// Wait for the event pump to land the wanted attachment state
fn await_attached(ctx: &Context, vbd_ref: &Ref, wanted: bool) -> ApiResult<()> {
    let deadline = Instant::now() + ATTACH_TIMEOUT;
    loop {
        match ctx.db.vbds.try_get(vbd_ref) {
            Some(vbd) if vbd.currently_attached == wanted => return Ok(()),
            Some(_) => {}
            None => return Err(ApiError::handle_invalid("VBD", vbd_ref.as_str())),
        }
        if Instant::now() >= deadline {
            return Err(ApiError::internal_error(format!(
                "timed out waiting for {} attachment to become {}",
                vbd_ref, wanted
            )));
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

/// Create a block device binding. The device is inert until plugged or the
/// VM next starts.
pub fn create(
    ctx: &Context,
    vm_ref: &Ref,
    vdi_ref: &Ref,
    userdevice: &str,
    mode: VbdMode,
    vbd_type: VbdType,
    bootable: bool,
) -> ApiResult<Ref> {
    with_task(ctx, "VBD.create", None, true, |_task| {
        let vm = ctx
            .db
            .vms
            .try_get(vm_ref)
            .ok_or_else(|| ApiError::handle_invalid("VM", vm_ref.as_str()))?;
        for existing in &vm.vbds {
            if let Some(vbd) = ctx.db.vbds.try_get(existing) {
                if vbd.userdevice == userdevice {
                    return Err(ApiError::operation_not_allowed(&format!(
                        "device {} is already taken on {}",
                        userdevice, vm_ref
                    )));
                }
            }
        }
        let empty = vdi_ref.is_null();
        if !empty && !ctx.db.vdis.contains(vdi_ref) {
            return Err(ApiError::handle_invalid("VDI", vdi_ref.as_str()));
        }
        if !empty && matches!(vbd_type, VbdType::Disk) {
            if let Some(vdi) = ctx.db.vdis.try_get(vdi_ref) {
                if vdi.vdi_type == VdiType::CbtMetadata {
                    return Err(ApiError::new(
                        crate::api_error::codes::VDI_INCOMPATIBLE_TYPE,
                        vec![vdi_ref.as_str().to_string(), vdi.vdi_type.as_str().to_string()],
                    ));
                }
            }
        }

        let vbd = VbdRecord {
            reference: Ref::generate(),
            uuid: Uuid::new_v4(),
            vm: vm_ref.clone(),
            vdi: vdi_ref.clone(),
            userdevice: userdevice.to_string(),
            mode,
            vbd_type,
            bootable,
            empty,
            currently_attached: false,
            reserved: false,
            current_operations: Default::default(),
            allowed_operations: Vec::new(),
            other_config: Default::default(),
        };
        let vbd_ref = vbd.reference.clone();
        ctx.db
            .vbds
            .insert(vbd)
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        let _ = ctx.db.vms.update(vm_ref, |vm| vm.vbds.push(vbd_ref.clone()));
        if !empty {
            let _ = ctx.db.vdis.update(vdi_ref, |vdi| vdi.vbds.push(vbd_ref.clone()));
            allowed::update_vdi_allowed_operations(&ctx.db, vdi_ref);
        }
        allowed::update_vbd_allowed_operations(&ctx.db, &vbd_ref);
        Ok(vbd_ref)
    })
}

/// Hotplug into the running guest
pub fn plug(ctx: &Context, vbd_ref: &Ref) -> ApiResult<()> {
    run_vbd_operation(ctx, vbd_ref, VbdOperation::Plug, "VBD.plug", None, |task| {
        let vbd = ctx
            .db
            .vbds
            .get(vbd_ref)
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        let vm = ctx
            .db
            .vms
            .try_get(&vbd.vm)
            .ok_or_else(|| ApiError::handle_invalid("VM", vbd.vm.as_str()))?;
        let doc = crate::xenops::metadata::build(&ctx.db, &vm)?;
        let id = (vm.uuid.to_string(), vbd.userdevice.clone());
        let wire = doc
            .vbds
            .iter()
            .find(|v| v.id == id)
            .cloned()
            .ok_or_else(|| ApiError::internal_error("VBD absent from metadata"))?;
        ctx.xenops
            .client
            .vbd_add(ctx.xenops.dbg(), &wire)
            .map_err(|e| ctx.xenops.rpc_failed(vbd_ref.as_str(), e))?;
        let plug = ctx
            .xenops
            .client
            .vbd_plug(ctx.xenops.dbg(), &id)
            .map_err(|e| ctx.xenops.rpc_failed(vbd_ref.as_str(), e))?;
        ctx.xenops.run_task(Some(task), &plug)?;
        await_attached(ctx, vbd_ref, true)
    })
}

/// Unplug from the running guest
pub fn unplug(ctx: &Context, vbd_ref: &Ref, force: bool) -> ApiResult<()> {
    let op = if force {
        VbdOperation::UnplugForce
    } else {
        VbdOperation::Unplug
    };
    run_vbd_operation(ctx, vbd_ref, op, "VBD.unplug", None, |task| {
        let vbd = ctx
            .db
            .vbds
            .get(vbd_ref)
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        let vm = ctx
            .db
            .vms
            .try_get(&vbd.vm)
            .ok_or_else(|| ApiError::handle_invalid("VM", vbd.vm.as_str()))?;
        let id = (vm.uuid.to_string(), vbd.userdevice.clone());
        let unplug = ctx
            .xenops
            .client
            .vbd_unplug(ctx.xenops.dbg(), &id, force)
            .map_err(|e| ctx.xenops.rpc_failed(vbd_ref.as_str(), e))?;
        ctx.xenops.run_task(Some(task), &unplug)?;
        await_attached(ctx, vbd_ref, false)?;
        let _ = ctx.xenops.client.vbd_remove(ctx.xenops.dbg(), &id);
        Ok(())
    })
}

/// Load media into an empty removable drive
pub fn insert(ctx: &Context, vbd_ref: &Ref, vdi_ref: &Ref) -> ApiResult<()> {
    run_vbd_operation(ctx, vbd_ref, VbdOperation::Insert, "VBD.insert", None, |task| {
        let vdi = ctx
            .db
            .vdis
            .try_get(vdi_ref)
            .ok_or_else(|| ApiError::handle_invalid("VDI", vdi_ref.as_str()))?;
        let vbd = ctx
            .db
            .vbds
            .get(vbd_ref)
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        let _ = ctx.db.vbds.update(vbd_ref, |vbd| {
            vbd.vdi = vdi_ref.clone();
            vbd.empty = false;
        });
        let _ = ctx.db.vdis.update(vdi_ref, |vdi| vdi.vbds.push(vbd_ref.clone()));

        // A live drive needs the daemon to see the media change
        if let Some(vm) = ctx.db.vms.try_get(&vbd.vm) {
            if vm.power_state == PowerState::Running && vbd.currently_attached {
                let sr_uuid = ctx
                    .db
                    .srs
                    .try_get(&vdi.sr)
                    .map(|sr| sr.uuid.to_string())
                    .unwrap_or_default();
                let disk = format!("{}/{}", sr_uuid, vdi.location);
                let id = (vm.uuid.to_string(), vbd.userdevice.clone());
                let insert = ctx
                    .xenops
                    .client
                    .vbd_insert(ctx.xenops.dbg(), &id, &disk)
                    .map_err(|e| ctx.xenops.rpc_failed(vbd_ref.as_str(), e))?;
                ctx.xenops.run_task(Some(task), &insert)?;
            }
        }
        allowed::update_vdi_allowed_operations(&ctx.db, vdi_ref);
        Ok(())
    })
}

/// Remove media from a loaded removable drive
pub fn eject(ctx: &Context, vbd_ref: &Ref) -> ApiResult<()> {
    run_vbd_operation(ctx, vbd_ref, VbdOperation::Eject, "VBD.eject", None, |task| {
        let vbd = ctx
            .db
            .vbds
            .get(vbd_ref)
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        let old_vdi = vbd.vdi.clone();
        let _ = ctx.db.vbds.update(vbd_ref, |vbd| {
            vbd.vdi = Ref::null();
            vbd.empty = true;
        });
        if !old_vdi.is_null() {
            let _ = ctx.db.vdis.update(&old_vdi, |vdi| {
                vdi.vbds.retain(|v| v != vbd_ref);
            });
            allowed::update_vdi_allowed_operations(&ctx.db, &old_vdi);
        }
        if let Some(vm) = ctx.db.vms.try_get(&vbd.vm) {
            if vm.power_state == PowerState::Running && vbd.currently_attached {
                let id = (vm.uuid.to_string(), vbd.userdevice.clone());
                let eject = ctx
                    .xenops
                    .client
                    .vbd_eject(ctx.xenops.dbg(), &id)
                    .map_err(|e| ctx.xenops.rpc_failed(vbd_ref.as_str(), e))?;
                ctx.xenops.run_task(Some(task), &eject)?;
            }
        }
        Ok(())
    })
}

/// Remove the binding
pub fn destroy(ctx: &Context, vbd_ref: &Ref) -> ApiResult<()> {
    run_vbd_operation(ctx, vbd_ref, VbdOperation::Destroy, "VBD.destroy", None, |_task| {
        let vbd = ctx
            .db
            .vbds
            .get(vbd_ref)
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        let _ = ctx.db.vms.update(&vbd.vm, |vm| {
            vm.vbds.retain(|v| v != vbd_ref);
        });
        if !vbd.vdi.is_null() {
            let _ = ctx.db.vdis.update(&vbd.vdi, |vdi| {
                vdi.vbds.retain(|v| v != vbd_ref);
            });
        }
        ctx.db
            .vbds
            .remove(vbd_ref)
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        if !vbd.vdi.is_null() {
            allowed::update_vdi_allowed_operations(&ctx.db, &vbd.vdi);
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_error::codes;

    fn insert_vm(ctx: &Context, power_state: PowerState) -> Ref {
        let vm = VmRecord {
            reference: Ref::generate(),
            uuid: Uuid::new_v4(),
            name_label: "vm".to_string(),
            power_state,
            ..Default::default()
        };
        let vm_ref = vm.reference.clone();
        ctx.db.vms.insert(vm).unwrap();
        vm_ref
    }

    #[test]
    fn test_create_rejects_duplicate_userdevice() {
        let (ctx, _xenops, _storage) = Context::sim();
        let vm_ref = insert_vm(&ctx, PowerState::Halted);
        create(&ctx, &vm_ref, &Ref::null(), "0", VbdMode::Rw, VbdType::Cd, false).unwrap();
        let err = create(&ctx, &vm_ref, &Ref::null(), "0", VbdMode::Rw, VbdType::Cd, false)
            .unwrap_err();
        assert_eq!(err.code, codes::OPERATION_NOT_ALLOWED);
    }

    #[test]
    fn test_create_links_vm_and_vdi() {
        let (ctx, _xenops, _storage) = Context::sim();
        let vm_ref = insert_vm(&ctx, PowerState::Halted);
        let vdi = VdiRecord {
            reference: Ref::generate(),
            uuid: Uuid::new_v4(),
            name_label: "d".to_string(),
            sr: Ref::null(),
            vbds: Vec::new(),
            location: "loc".to_string(),
            vdi_type: VdiType::User,
            virtual_size: 0,
            physical_utilisation: 0,
            sharable: false,
            read_only: false,
            managed: true,
            missing: false,
            on_boot: OnBoot::Persist,
            allow_caching: false,
            cbt_enabled: false,
            is_a_snapshot: false,
            snapshot_of: Ref::null(),
            snapshot_time: None,
            metadata_of_pool: Ref::null(),
            is_tools_iso: false,
            current_operations: Default::default(),
            allowed_operations: Vec::new(),
            sm_config: Default::default(),
            other_config: Default::default(),
        };
        let vdi_ref = vdi.reference.clone();
        ctx.db.vdis.insert(vdi).unwrap();

        let vbd_ref = create(
            &ctx,
            &vm_ref,
            &vdi_ref,
            "xvda",
            VbdMode::Rw,
            VbdType::Disk,
            true,
        )
        .unwrap();
        assert!(ctx.db.vms.get(&vm_ref).unwrap().vbds.contains(&vbd_ref));
        assert!(ctx.db.vdis.get(&vdi_ref).unwrap().vbds.contains(&vbd_ref));

        destroy(&ctx, &vbd_ref).unwrap();
        assert!(ctx.db.vms.get(&vm_ref).unwrap().vbds.is_empty());
        assert!(ctx.db.vdis.get(&vdi_ref).unwrap().vbds.is_empty());
    }

    #[test]
    fn test_cbt_metadata_vdi_cannot_be_linked() {
        let (ctx, _xenops, _storage) = Context::sim();
        let vm_ref = insert_vm(&ctx, PowerState::Halted);
        let vdi = VdiRecord {
            reference: Ref::generate(),
            uuid: Uuid::new_v4(),
            name_label: "stub".to_string(),
            sr: Ref::null(),
            vbds: Vec::new(),
            location: "loc".to_string(),
            vdi_type: VdiType::CbtMetadata,
            virtual_size: 0,
            physical_utilisation: 0,
            sharable: false,
            read_only: false,
            managed: true,
            missing: false,
            on_boot: OnBoot::Persist,
            allow_caching: false,
            cbt_enabled: true,
            is_a_snapshot: false,
            snapshot_of: Ref::null(),
            snapshot_time: None,
            metadata_of_pool: Ref::null(),
            is_tools_iso: false,
            current_operations: Default::default(),
            allowed_operations: Vec::new(),
            sm_config: Default::default(),
            other_config: Default::default(),
        };
        let vdi_ref = vdi.reference.clone();
        ctx.db.vdis.insert(vdi).unwrap();
        let err = create(
            &ctx,
            &vm_ref,
            &vdi_ref,
            "xvdb",
            VbdMode::Rw,
            VbdType::Disk,
            false,
        )
        .unwrap_err();
        assert_eq!(err.code, codes::VDI_INCOMPATIBLE_TYPE);
    }

    #[test]
    fn test_eject_clears_media() {
        let (ctx, _xenops, _storage) = Context::sim();
        let vm_ref = insert_vm(&ctx, PowerState::Halted);
        let vdi = VdiRecord {
            reference: Ref::generate(),
            uuid: Uuid::new_v4(),
            name_label: "iso".to_string(),
            sr: Ref::null(),
            vbds: Vec::new(),
            location: "iso-loc".to_string(),
            vdi_type: VdiType::User,
            virtual_size: 0,
            physical_utilisation: 0,
            sharable: false,
            read_only: true,
            managed: true,
            missing: false,
            on_boot: OnBoot::Persist,
            allow_caching: false,
            cbt_enabled: false,
            is_a_snapshot: false,
            snapshot_of: Ref::null(),
            snapshot_time: None,
            metadata_of_pool: Ref::null(),
            is_tools_iso: false,
            current_operations: Default::default(),
            allowed_operations: Vec::new(),
            sm_config: Default::default(),
            other_config: Default::default(),
        };
        let vdi_ref = vdi.reference.clone();
        ctx.db.vdis.insert(vdi).unwrap();

        let vbd_ref = create(&ctx, &vm_ref, &vdi_ref, "3", VbdMode::Ro, VbdType::Cd, false)
            .unwrap();
        eject(&ctx, &vbd_ref).unwrap();
        let vbd = ctx.db.vbds.get(&vbd_ref).unwrap();
        assert!(vbd.empty);
        assert!(vbd.vdi.is_null());

        insert(&ctx, &vbd_ref, &vdi_ref).unwrap();
        let vbd = ctx.db.vbds.get(&vbd_ref).unwrap();
        assert!(!vbd.empty);
        assert_eq!(vbd.vdi, vdi_ref);
    }
}
