//! VIF Lifecycle Operations

use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::allowed;
use crate::api_error::{ApiError, ApiResult};
use crate::context::Context;
use crate::db::models::*;

use super::{run_vif_operation, with_task};

const ATTACH_TIMEOUT: Duration = Duration::from_secs(30);

fn await_attached(ctx: &Context, vif_ref: &Ref, wanted: bool) -> ApiResult<()> {
    let deadline = Instant::now() + ATTACH_TIMEOUT;
    loop {
        match ctx.db.vifs.try_get(vif_ref) {
            Some(vif) if vif.currently_attached == wanted => return Ok(()),
            Some(_) => {}
            None => return Err(ApiError::handle_invalid("VIF", vif_ref.as_str())),
        }
        if Instant::now() >= deadline {
            return Err(ApiError::internal_error(format!(
                "timed out waiting for {} attachment to become {}",
                vif_ref, wanted
            )));
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

/// Create a network interface on a VM
pub fn create(ctx: &Context, vm_ref: &Ref, network_ref: &Ref, device: &str, mac: &str) -> ApiResult<Ref> {
    with_task(ctx, "VIF.create", None, true, |_task| {
        let vm = ctx
            .db
            .vms
            .try_get(vm_ref)
            .ok_or_else(|| ApiError::handle_invalid("VM", vm_ref.as_str()))?;
        if !ctx.db.networks.contains(network_ref) {
            return Err(ApiError::handle_invalid("network", network_ref.as_str()));
        }
        for existing in &vm.vifs {
            if let Some(vif) = ctx.db.vifs.try_get(existing) {
                if vif.device == device {
                    return Err(ApiError::operation_not_allowed(&format!(
                        "device {} is already taken on {}",
                        device, vm_ref
                    )));
                }
            }
        }
        let vif = VifRecord {
            reference: Ref::generate(),
            uuid: Uuid::new_v4(),
            vm: vm_ref.clone(),
            network: network_ref.clone(),
            device: device.to_string(),
            mac: mac.to_string(),
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
        let vif_ref = vif.reference.clone();
        ctx.db
            .vifs
            .insert(vif)
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        let _ = ctx.db.vms.update(vm_ref, |vm| vm.vifs.push(vif_ref.clone()));
        let _ = ctx.db.networks.update(network_ref, |network| {
            network.vifs.push(vif_ref.clone());
        });
        allowed::update_vif_allowed_operations(&ctx.db, &vif_ref);
        Ok(vif_ref)
    })
}

/// Hotplug into the running guest
pub fn plug(ctx: &Context, vif_ref: &Ref) -> ApiResult<()> {
    run_vif_operation(ctx, vif_ref, VifOperation::Plug, "VIF.plug", None, |task| {
        let vif = ctx
            .db
            .vifs
            .get(vif_ref)
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        let vm = ctx
            .db
            .vms
            .try_get(&vif.vm)
            .ok_or_else(|| ApiError::handle_invalid("VM", vif.vm.as_str()))?;
        let doc = crate::xenops::metadata::build(&ctx.db, &vm)?;
        let id = (vm.uuid.to_string(), vif.device.clone());
        let wire = doc
            .vifs
            .iter()
            .find(|v| v.id == id)
            .cloned()
            .ok_or_else(|| ApiError::internal_error("VIF absent from metadata"))?;
        ctx.xenops
            .client
            .vif_add(ctx.xenops.dbg(), &wire)
            .map_err(|e| ctx.xenops.rpc_failed(vif_ref.as_str(), e))?;
        let plug = ctx
            .xenops
            .client
            .vif_plug(ctx.xenops.dbg(), &id)
            .map_err(|e| ctx.xenops.rpc_failed(vif_ref.as_str(), e))?;
        ctx.xenops.run_task(Some(task), &plug)?;
        await_attached(ctx, vif_ref, true)
    })
}

/// Unplug from the running guest
pub fn unplug(ctx: &Context, vif_ref: &Ref, force: bool) -> ApiResult<()> {
    let op = if force {
        VifOperation::UnplugForce
    } else {
        VifOperation::Unplug
    };
    run_vif_operation(ctx, vif_ref, op, "VIF.unplug", None, |task| {
        let vif = ctx
            .db
            .vifs
            .get(vif_ref)
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        let vm = ctx
            .db
            .vms
            .try_get(&vif.vm)
            .ok_or_else(|| ApiError::handle_invalid("VM", vif.vm.as_str()))?;
        let id = (vm.uuid.to_string(), vif.device.clone());
        let unplug = ctx
            .xenops
            .client
            .vif_unplug(ctx.xenops.dbg(), &id, force)
            .map_err(|e| ctx.xenops.rpc_failed(vif_ref.as_str(), e))?;
        ctx.xenops.run_task(Some(task), &unplug)?;
        await_attached(ctx, vif_ref, false)?;
        let _ = ctx.xenops.client.vif_remove(ctx.xenops.dbg(), &id);
        Ok(())
    })
}

/// Remove the interface
pub fn destroy(ctx: &Context, vif_ref: &Ref) -> ApiResult<()> {
    run_vif_operation(ctx, vif_ref, VifOperation::Destroy, "VIF.destroy", None, |_task| {
        let vif = ctx
            .db
            .vifs
            .get(vif_ref)
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        let _ = ctx.db.vms.update(&vif.vm, |vm| {
            vm.vifs.retain(|v| v != vif_ref);
        });
        let _ = ctx.db.networks.update(&vif.network, |network| {
            network.vifs.retain(|v| v != vif_ref);
        });
        ctx.db
            .vifs
            .remove(vif_ref)
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        Ok(())
    })
}
