//! VM Lifecycle Operations

use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::allowed;
use crate::api_error::{codes, ApiError, ApiResult};
use crate::context::Context;
use crate::db::models::*;
use crate::events::EventFilter;
use crate::storage::SmError;
use crate::xenops::XenopsAdapter;

use super::run_vm_operation;

/// How long handlers wait for the event pump to land a power transition
const POWER_STATE_TIMEOUT: Duration = Duration::from_secs(30);

/// Wait until the pump has written one of the wanted power states
fn await_power_state(
    ctx: &Context,
    vm_ref: &Ref,
    wanted: &[PowerState],
    timeout: Duration,
) -> ApiResult<()> {
    let deadline = Instant::now() + timeout;
    let filter = EventFilter::object(Class::Vm, vm_ref.clone());
    let mut token = String::new();
    loop {
        match ctx.db.vms.try_get(vm_ref) {
            Some(vm) if wanted.contains(&vm.power_state) => return Ok(()),
            Some(_) => {}
            None => return Err(ApiError::handle_invalid("VM", vm_ref.as_str())),
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(ApiError::internal_error(format!(
                "timed out waiting for {} to reach {:?}",
                vm_ref, wanted
            )));
        }
        let wait = (deadline - now).min(Duration::from_millis(200));
        match ctx.bus.from(&filter, &token, wait) {
            Ok(batch) => token = batch.token,
            Err(_) => token = String::new(),
        }
    }
}

fn vm_uuid(ctx: &Context, vm_ref: &Ref) -> ApiResult<String> {
    ctx.db
        .vms
        .try_get(vm_ref)
        .map(|vm| vm.uuid.to_string())
        .ok_or_else(|| ApiError::handle_invalid("VM", vm_ref.as_str()))
}

/// Start a halted VM on this host
pub fn start(ctx: &Context, vm_ref: &Ref, start_paused: bool, force: bool) -> ApiResult<()> {
    run_vm_operation(ctx, vm_ref, VmOperation::Start, "VM.start", None, |task| {
        let host = ctx
            .db
            .hosts
            .try_get(&ctx.localhost)
            .ok_or_else(|| ApiError::handle_invalid("host", ctx.localhost.as_str()))?;
        if !host.enabled {
            return Err(ApiError::new(
                codes::HOST_DISABLED,
                vec![ctx.localhost.as_str().to_string()],
            ));
        }

        let vm = ctx
            .db
            .vms
            .get(vm_ref)
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        let id = vm.uuid.to_string();
        let _ = force;

        let localhost = ctx.localhost.clone();
        let _ = ctx.db.vms.update(vm_ref, |vm| {
            vm.scheduled_to_be_resident_on = localhost.clone();
        });
        // Reserve the devices before the domain exists
        for vbd_ref in &vm.vbds {
            let _ = ctx.db.vbds.update(vbd_ref, |vbd| {
                vbd.currently_attached = true;
                vbd.reserved = true;
            });
        }
        for vif_ref in &vm.vifs {
            let _ = ctx.db.vifs.update(vif_ref, |vif| {
                vif.currently_attached = true;
                vif.reserved = true;
            });
        }

        let outcome = ctx.xenops.with_suppressed(&id, || -> ApiResult<()> {
            let vm = ctx
                .db
                .vms
                .get(vm_ref)
                .map_err(|e| ApiError::internal_error(e.to_string()))?;
            let id = ctx.xenops.push_metadata(&vm)?;
            let start_task = ctx
                .xenops
                .client
                .vm_start(ctx.xenops.dbg(), &id, true)
                .map_err(|e| ctx.xenops.rpc_failed(vm_ref.as_str(), e))?;
            ctx.xenops.run_task(Some(task), &start_task)?;
            if !start_paused {
                let unpause = ctx
                    .xenops
                    .client
                    .vm_unpause(ctx.xenops.dbg(), &id)
                    .map_err(|e| ctx.xenops.rpc_failed(vm_ref.as_str(), e))?;
                ctx.xenops.run_task(Some(task), &unpause)?;
            }
            Ok(())
        });

        if let Err(e) = outcome {
            // Roll back the reservation; the domain never came up
            for vbd_ref in &vm.vbds {
                let _ = ctx.db.vbds.update(vbd_ref, |vbd| {
                    vbd.currently_attached = false;
                    vbd.reserved = false;
                });
            }
            for vif_ref in &vm.vifs {
                let _ = ctx.db.vifs.update(vif_ref, |vif| {
                    vif.currently_attached = false;
                    vif.reserved = false;
                });
            }
            let _ = ctx.db.vms.update(vm_ref, |vm| {
                vm.scheduled_to_be_resident_on = Ref::null();
            });
            let _ = ctx.xenops.client.vm_remove(ctx.xenops.dbg(), &id);
            ctx.xenops.caches.unregister(&id);
            return Err(e);
        }

        let wanted: &[PowerState] = if start_paused {
            &[PowerState::Paused]
        } else {
            &[PowerState::Running]
        };
        await_power_state(ctx, vm_ref, wanted, POWER_STATE_TIMEOUT)
    })
}

/// Ask the guest to shut down and wait for the domain to go
pub fn clean_shutdown(ctx: &Context, vm_ref: &Ref) -> ApiResult<()> {
    run_vm_operation(
        ctx,
        vm_ref,
        VmOperation::CleanShutdown,
        "VM.clean_shutdown",
        None,
        |task| {
            let id = vm_uuid(ctx, vm_ref)?;
            let shutdown = ctx
                .xenops
                .client
                .vm_shutdown(ctx.xenops.dbg(), &id, None)
                .map_err(|e| ctx.xenops.rpc_failed(vm_ref.as_str(), e))?;
            ctx.xenops.run_task(Some(task), &shutdown)?;
            await_power_state(ctx, vm_ref, &[PowerState::Halted], POWER_STATE_TIMEOUT)
        },
    )
}

/// Destroy the domain without consulting the guest
pub fn hard_shutdown(ctx: &Context, vm_ref: &Ref) -> ApiResult<()> {
    run_vm_operation(
        ctx,
        vm_ref,
        VmOperation::HardShutdown,
        "VM.hard_shutdown",
        None,
        |task| {
            let vm = ctx
                .db
                .vms
                .get(vm_ref)
                .map_err(|e| ApiError::internal_error(e.to_string()))?;
            let id = vm.uuid.to_string();
            if vm.power_state == PowerState::Suspended {
                // No live domain; drop the image and clear the record
                let _ = ctx.xenops.client.vm_remove(ctx.xenops.dbg(), &id);
                ctx.xenops.caches.unregister(&id);
                ctx.xenops.force_halted_in_db(&vm);
                return Ok(());
            }
            let shutdown = ctx
                .xenops
                .client
                .vm_shutdown(ctx.xenops.dbg(), &id, None)
                .map_err(|e| ctx.xenops.rpc_failed(vm_ref.as_str(), e))?;
            ctx.xenops.run_task(Some(task), &shutdown)?;
            await_power_state(ctx, vm_ref, &[PowerState::Halted], POWER_STATE_TIMEOUT)
        },
    )
}

fn reboot(ctx: &Context, vm_ref: &Ref, op: VmOperation, label: &str) -> ApiResult<()> {
    run_vm_operation(ctx, vm_ref, op, label, None, |task| {
        let id = vm_uuid(ctx, vm_ref)?;
        let reboot = ctx
            .xenops
            .client
            .vm_reboot(ctx.xenops.dbg(), &id, None)
            .map_err(|e| ctx.xenops.rpc_failed(vm_ref.as_str(), e))?;
        ctx.xenops.run_task(Some(task), &reboot)?;
        await_power_state(ctx, vm_ref, &[PowerState::Running], POWER_STATE_TIMEOUT)
    })
}

pub fn clean_reboot(ctx: &Context, vm_ref: &Ref) -> ApiResult<()> {
    reboot(ctx, vm_ref, VmOperation::CleanReboot, "VM.clean_reboot")
}

pub fn hard_reboot(ctx: &Context, vm_ref: &Ref) -> ApiResult<()> {
    reboot(ctx, vm_ref, VmOperation::HardReboot, "VM.hard_reboot")
}

pub fn pause(ctx: &Context, vm_ref: &Ref) -> ApiResult<()> {
    run_vm_operation(ctx, vm_ref, VmOperation::Pause, "VM.pause", None, |task| {
        let id = vm_uuid(ctx, vm_ref)?;
        let pause = ctx
            .xenops
            .client
            .vm_pause(ctx.xenops.dbg(), &id)
            .map_err(|e| ctx.xenops.rpc_failed(vm_ref.as_str(), e))?;
        ctx.xenops.run_task(Some(task), &pause)?;
        await_power_state(ctx, vm_ref, &[PowerState::Paused], POWER_STATE_TIMEOUT)
    })
}

pub fn unpause(ctx: &Context, vm_ref: &Ref) -> ApiResult<()> {
    run_vm_operation(ctx, vm_ref, VmOperation::Unpause, "VM.unpause", None, |task| {
        let id = vm_uuid(ctx, vm_ref)?;
        let unpause = ctx
            .xenops
            .client
            .vm_unpause(ctx.xenops.dbg(), &id)
            .map_err(|e| ctx.xenops.rpc_failed(vm_ref.as_str(), e))?;
        ctx.xenops.run_task(Some(task), &unpause)?;
        await_power_state(ctx, vm_ref, &[PowerState::Running], POWER_STATE_TIMEOUT)
    })
}

/// Pick the repository for a suspend image
fn default_sr(ctx: &Context) -> ApiResult<SrRecord> {
    let pool = ctx
        .db
        .pool()
        .map_err(|e| ApiError::internal_error(e.to_string()))?;
    ctx.db
        .srs
        .try_get(&pool.default_sr)
        .or_else(|| ctx.db.srs.list().into_iter().next())
        .ok_or_else(|| ApiError::internal_error("no SR available for the suspend image"))
}

/// Create and introduce a suspend VDI sized for the guest's memory
fn create_suspend_vdi(ctx: &Context, vm: &VmRecord) -> ApiResult<VdiRecord> {
    let sr = default_sr(ctx)?;
    let sr_uuid = sr.uuid.to_string();
    let info = ctx
        .storage
        .vdi_create(
            ctx.xenops.dbg(),
            &sr_uuid,
            &format!("Suspend image for {}", vm.name_label),
            vm.memory_static_max,
            VdiType::Suspend,
        )
        .map_err(|e| ApiError::internal_error(e.to_string()))?;
    let vdi = VdiRecord {
        reference: Ref::generate(),
        uuid: Uuid::new_v4(),
        name_label: info.name_label.clone(),
        sr: sr.reference.clone(),
        vbds: Vec::new(),
        location: info.location.clone(),
        vdi_type: VdiType::Suspend,
        virtual_size: info.virtual_size,
        physical_utilisation: info.physical_utilisation,
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
        sm_config: info.sm_config.clone(),
        other_config: Default::default(),
    };
    ctx.db
        .vdis
        .insert(vdi.clone())
        .map_err(|e| ApiError::internal_error(e.to_string()))?;
    let _ = ctx.db.srs.update(&sr.reference, |sr| {
        sr.vdis.push(vdi.reference.clone());
    });
    Ok(vdi)
}

/// Suspend a running VM to disk
pub fn suspend(ctx: &Context, vm_ref: &Ref) -> ApiResult<()> {
    run_vm_operation(ctx, vm_ref, VmOperation::Suspend, "VM.suspend", None, |task| {
        let vm = ctx
            .db
            .vms
            .get(vm_ref)
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        let id = vm.uuid.to_string();
        let vdi = create_suspend_vdi(ctx, &vm)?;
        let sr_uuid = ctx
            .db
            .srs
            .try_get(&vdi.sr)
            .map(|sr| sr.uuid.to_string())
            .unwrap_or_default();
        let _ = ctx.db.vms.update(vm_ref, |vm| {
            vm.suspend_vdi = vdi.reference.clone();
        });
        let disk = format!("{}/{}", sr_uuid, vdi.location);
        let outcome = ctx
            .xenops
            .client
            .vm_suspend(ctx.xenops.dbg(), &id, &disk)
            .map_err(|e| ctx.xenops.rpc_failed(vm_ref.as_str(), e))
            .and_then(|t| ctx.xenops.run_task(Some(task), &t))
            .and_then(|_| {
                await_power_state(ctx, vm_ref, &[PowerState::Suspended], POWER_STATE_TIMEOUT)
            });
        if let Err(e) = outcome {
            // The guest kept running; drop the unused image
            let _ = ctx
                .storage
                .vdi_destroy(ctx.xenops.dbg(), &sr_uuid, &vdi.location);
            let _ = ctx.db.vdis.remove(&vdi.reference);
            let _ = ctx.db.vms.update(vm_ref, |vm| vm.suspend_vdi = Ref::null());
            return Err(e);
        }
        Ok(())
    })
}

/// Resume a suspended VM
pub fn resume(ctx: &Context, vm_ref: &Ref, start_paused: bool) -> ApiResult<()> {
    run_vm_operation(ctx, vm_ref, VmOperation::Resume, "VM.resume", None, |task| {
        let vm = ctx
            .db
            .vms
            .get(vm_ref)
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        let id = vm.uuid.to_string();
        let suspend_vdi = ctx.db.vdis.try_get(&vm.suspend_vdi);
        let disk = suspend_vdi
            .as_ref()
            .and_then(|vdi| {
                ctx.db
                    .srs
                    .try_get(&vdi.sr)
                    .map(|sr| format!("{}/{}", sr.uuid, vdi.location))
            })
            .unwrap_or_default();

        ctx.xenops.with_suppressed(&id, || -> ApiResult<()> {
            let vm = ctx
                .db
                .vms
                .get(vm_ref)
                .map_err(|e| ApiError::internal_error(e.to_string()))?;
            ctx.xenops.push_metadata(&vm)?;
            let resume = ctx
                .xenops
                .client
                .vm_resume(ctx.xenops.dbg(), &id, &disk)
                .map_err(|e| ctx.xenops.rpc_failed(vm_ref.as_str(), e))?;
            ctx.xenops.run_task(Some(task), &resume)?;
            if start_paused {
                let pause = ctx
                    .xenops
                    .client
                    .vm_pause(ctx.xenops.dbg(), &id)
                    .map_err(|e| ctx.xenops.rpc_failed(vm_ref.as_str(), e))?;
                ctx.xenops.run_task(Some(task), &pause)?;
            }
            Ok(())
        })?;

        await_power_state(
            ctx,
            vm_ref,
            &[PowerState::Running, PowerState::Paused],
            POWER_STATE_TIMEOUT,
        )?;

        // The image is consumed by a successful resume
        if let Some(vdi) = suspend_vdi {
            if let Some(sr) = ctx.db.srs.try_get(&vdi.sr) {
                let _ = ctx
                    .storage
                    .vdi_destroy(ctx.xenops.dbg(), &sr.uuid.to_string(), &vdi.location);
                let _ = ctx.db.srs.update(&sr.reference, |sr| {
                    sr.vdis.retain(|v| v != &vdi.reference);
                });
            }
            let _ = ctx.db.vdis.remove(&vdi.reference);
        }
        let _ = ctx.db.vms.update(vm_ref, |vm| vm.suspend_vdi = Ref::null());
        Ok(())
    })
}

/// How disk contents travel into a duplicate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DiskStrategy {
    Snapshot,
    Clone,
    Copy,
}

/// Duplicate a VM record with fresh identities, carrying the disks over by
/// the given strategy
fn duplicate(
    ctx: &Context,
    vm: &VmRecord,
    new_name: &str,
    strategy: DiskStrategy,
    as_snapshot: bool,
) -> ApiResult<Ref> {
    let mut new_vm = vm.clone();
    new_vm.reference = Ref::generate();
    new_vm.uuid = Uuid::new_v4();
    new_vm.name_label = new_name.to_string();
    new_vm.power_state = PowerState::Halted;
    new_vm.domid = -1;
    new_vm.resident_on = Ref::null();
    new_vm.scheduled_to_be_resident_on = Ref::null();
    new_vm.suspend_vdi = Ref::null();
    new_vm.metrics = Ref::null();
    new_vm.guest_metrics = Ref::null();
    new_vm.consoles = Vec::new();
    new_vm.attached_pcis = Vec::new();
    new_vm.current_operations = Default::default();
    new_vm.allowed_operations = Vec::new();
    new_vm.vbds = Vec::new();
    new_vm.vifs = Vec::new();
    new_vm.vgpus = Vec::new();
    new_vm.vusbs = Vec::new();
    new_vm.vtpms = Vec::new();
    if as_snapshot {
        new_vm.is_a_snapshot = true;
        new_vm.is_a_template = true;
        new_vm.snapshot_of = vm.reference.clone();
        new_vm.snapshot_time = Some(chrono::Utc::now());
    } else {
        new_vm.is_a_snapshot = false;
        new_vm.snapshot_of = Ref::null();
        new_vm.snapshot_time = None;
    }
    ctx.db
        .vms
        .insert(new_vm.clone())
        .map_err(|e| ApiError::internal_error(e.to_string()))?;

    // Disks
    for vbd_ref in &vm.vbds {
        let Some(vbd) = ctx.db.vbds.try_get(vbd_ref) else {
            continue;
        };
        let new_vdi_ref = if vbd.empty || vbd.vdi.is_null() {
            Ref::null()
        } else {
            let Some(vdi) = ctx.db.vdis.try_get(&vbd.vdi) else {
                continue;
            };
            if vbd.vbd_type == VbdType::Cd {
                // Removable media is shared, never duplicated
                vdi.reference.clone()
            } else {
                let sr = ctx
                    .db
                    .srs
                    .try_get(&vdi.sr)
                    .ok_or_else(|| ApiError::handle_invalid("SR", vdi.sr.as_str()))?;
                let sr_uuid = sr.uuid.to_string();
                let dbg = ctx.xenops.dbg();
                let info = match strategy {
                    DiskStrategy::Snapshot => {
                        ctx.storage.vdi_snapshot(dbg, &sr_uuid, &vdi.location)
                    }
                    DiskStrategy::Copy => ctx.storage.vdi_copy(dbg, &sr_uuid, &vdi.location),
                    DiskStrategy::Clone => {
                        match ctx.storage.vdi_clone(dbg, &sr_uuid, &vdi.location) {
                            Err(SmError::NotImplemented(_)) => {
                                // Backend cannot clone; fall back to a full
                                // copy through the control domain
                                ctx.storage.vdi_copy(dbg, &sr_uuid, &vdi.location)
                            }
                            other => other,
                        }
                    }
                }
                .map_err(|e| ApiError::internal_error(e.to_string()))?;

                let new_vdi = VdiRecord {
                    reference: Ref::generate(),
                    uuid: Uuid::new_v4(),
                    name_label: vdi.name_label.clone(),
                    sr: vdi.sr.clone(),
                    vbds: Vec::new(),
                    location: info.location.clone(),
                    vdi_type: vdi.vdi_type,
                    virtual_size: info.virtual_size,
                    physical_utilisation: info.physical_utilisation,
                    sharable: vdi.sharable,
                    read_only: info.read_only,
                    managed: true,
                    missing: false,
                    on_boot: vdi.on_boot,
                    allow_caching: vdi.allow_caching,
                    cbt_enabled: false,
                    is_a_snapshot: strategy == DiskStrategy::Snapshot,
                    snapshot_of: if strategy == DiskStrategy::Snapshot {
                        vdi.reference.clone()
                    } else {
                        Ref::null()
                    },
                    snapshot_time: if strategy == DiskStrategy::Snapshot {
                        Some(chrono::Utc::now())
                    } else {
                        None
                    },
                    metadata_of_pool: Ref::null(),
                    is_tools_iso: false,
                    current_operations: Default::default(),
                    allowed_operations: Vec::new(),
                    sm_config: info.sm_config.clone(),
                    other_config: vdi.other_config.clone(),
                };
                let new_ref = new_vdi.reference.clone();
                ctx.db
                    .vdis
                    .insert(new_vdi)
                    .map_err(|e| ApiError::internal_error(e.to_string()))?;
                let _ = ctx.db.srs.update(&vdi.sr, |sr| {
                    sr.vdis.push(new_ref.clone());
                });
                new_ref
            }
        };

        let new_vbd = VbdRecord {
            reference: Ref::generate(),
            uuid: Uuid::new_v4(),
            vm: new_vm.reference.clone(),
            vdi: new_vdi_ref.clone(),
            userdevice: vbd.userdevice.clone(),
            mode: vbd.mode,
            vbd_type: vbd.vbd_type,
            bootable: vbd.bootable,
            empty: vbd.empty,
            currently_attached: false,
            reserved: false,
            current_operations: Default::default(),
            allowed_operations: Vec::new(),
            other_config: vbd.other_config.clone(),
        };
        let new_vbd_ref = new_vbd.reference.clone();
        ctx.db
            .vbds
            .insert(new_vbd)
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        if !new_vdi_ref.is_null() {
            let _ = ctx.db.vdis.update(&new_vdi_ref, |vdi| {
                vdi.vbds.push(new_vbd_ref.clone());
            });
        }
        let _ = ctx.db.vms.update(&new_vm.reference, |vm| {
            vm.vbds.push(new_vbd_ref.clone());
        });
    }

    // Network interfaces keep their configuration with fresh identities
    for vif_ref in &vm.vifs {
        let Some(vif) = ctx.db.vifs.try_get(vif_ref) else {
            continue;
        };
        let new_vif = VifRecord {
            reference: Ref::generate(),
            uuid: Uuid::new_v4(),
            vm: new_vm.reference.clone(),
            currently_attached: false,
            reserved: false,
            current_operations: Default::default(),
            allowed_operations: Vec::new(),
            ..vif.clone()
        };
        let new_vif_ref = new_vif.reference.clone();
        ctx.db
            .vifs
            .insert(new_vif)
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        let _ = ctx.db.networks.update(&vif.network, |network| {
            network.vifs.push(new_vif_ref.clone());
        });
        let _ = ctx.db.vms.update(&new_vm.reference, |vm| {
            vm.vifs.push(new_vif_ref.clone());
        });
    }

    allowed::update_vm_and_devices(&ctx.db, &new_vm.reference);
    Ok(new_vm.reference)
}

/// Disk-level snapshot, valid on halted, suspended and running guests
pub fn snapshot(ctx: &Context, vm_ref: &Ref, new_name: &str) -> ApiResult<Ref> {
    run_vm_operation(ctx, vm_ref, VmOperation::Snapshot, "VM.snapshot", None, |_task| {
        let vm = ctx
            .db
            .vms
            .get(vm_ref)
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        duplicate(ctx, &vm, new_name, DiskStrategy::Snapshot, true)
    })
}

/// Memory-and-disk snapshot of a running guest: suspend, snapshot, resume
pub fn checkpoint(ctx: &Context, vm_ref: &Ref, new_name: &str) -> ApiResult<Ref> {
    run_vm_operation(
        ctx,
        vm_ref,
        VmOperation::Checkpoint,
        "VM.checkpoint",
        None,
        |task| {
            let vm = ctx
                .db
                .vms
                .get(vm_ref)
                .map_err(|e| ApiError::internal_error(e.to_string()))?;
            let id = vm.uuid.to_string();

            let vdi = create_suspend_vdi(ctx, &vm)?;
            let sr_uuid = ctx
                .db
                .srs
                .try_get(&vdi.sr)
                .map(|sr| sr.uuid.to_string())
                .unwrap_or_default();
            let disk = format!("{}/{}", sr_uuid, vdi.location);

            let suspend_task = ctx
                .xenops
                .client
                .vm_suspend(ctx.xenops.dbg(), &id, &disk)
                .map_err(|e| ctx.xenops.rpc_failed(vm_ref.as_str(), e))?;
            ctx.xenops.run_task(Some(task), &suspend_task)?;
            await_power_state(ctx, vm_ref, &[PowerState::Suspended], POWER_STATE_TIMEOUT)?;

            let snapshot_ref = duplicate(ctx, &vm, new_name, DiskStrategy::Snapshot, true)?;
            let _ = ctx.db.vms.update(&snapshot_ref, |snap| {
                snap.power_state = PowerState::Suspended;
                snap.suspend_vdi = vdi.reference.clone();
            });

            // The suspend transition pulled the metadata out of the daemon;
            // put it back before resuming
            let vm_now = ctx
                .db
                .vms
                .get(vm_ref)
                .map_err(|e| ApiError::internal_error(e.to_string()))?;
            ctx.xenops.push_metadata(&vm_now)?;
            let resume_task = ctx
                .xenops
                .client
                .vm_resume(ctx.xenops.dbg(), &id, &disk)
                .map_err(|e| ctx.xenops.rpc_failed(vm_ref.as_str(), e))?;
            ctx.xenops.run_task(Some(task), &resume_task)?;
            await_power_state(ctx, vm_ref, &[PowerState::Running], POWER_STATE_TIMEOUT)?;
            Ok(snapshot_ref)
        },
    )
}

/// Duplicate through the backend's cheap clone, with the copy fallback
pub fn clone_vm(ctx: &Context, vm_ref: &Ref, new_name: &str) -> ApiResult<Ref> {
    run_vm_operation(ctx, vm_ref, VmOperation::Clone, "VM.clone", None, |_task| {
        let vm = ctx
            .db
            .vms
            .get(vm_ref)
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        let new_ref = duplicate(ctx, &vm, new_name, DiskStrategy::Clone, false)?;
        // A clone of a template is a template; a clone of a VM is a VM
        let _ = ctx.db.vms.update(&new_ref, |clone| {
            clone.is_a_template = vm.is_a_template;
        });
        Ok(new_ref)
    })
}

/// Full-copy duplicate
pub fn copy_vm(ctx: &Context, vm_ref: &Ref, new_name: &str) -> ApiResult<Ref> {
    run_vm_operation(ctx, vm_ref, VmOperation::Copy, "VM.copy", None, |_task| {
        let vm = ctx
            .db
            .vms
            .get(vm_ref)
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        let new_ref = duplicate(ctx, &vm, new_name, DiskStrategy::Copy, false)?;
        let _ = ctx.db.vms.update(&new_ref, |copy| {
            copy.is_a_template = vm.is_a_template;
        });
        Ok(new_ref)
    })
}

/// Instantiate the disks a template describes in its provisioning spec
/// (other_config "disks": semicolon-separated sizes in bytes)
pub fn provision(ctx: &Context, vm_ref: &Ref) -> ApiResult<()> {
    run_vm_operation(ctx, vm_ref, VmOperation::Provision, "VM.provision", None, |_task| {
        let vm = ctx
            .db
            .vms
            .get(vm_ref)
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        let Some(spec) = vm.other_config.get("disks").cloned() else {
            return Ok(());
        };
        let sr = default_sr(ctx)?;
        let sr_uuid = sr.uuid.to_string();
        for (index, size) in spec
            .split(';')
            .filter_map(|s| s.trim().parse::<i64>().ok())
            .enumerate()
        {
            let info = ctx
                .storage
                .vdi_create(
                    ctx.xenops.dbg(),
                    &sr_uuid,
                    &format!("{} disk {}", vm.name_label, index),
                    size,
                    VdiType::User,
                )
                .map_err(|e| ApiError::internal_error(e.to_string()))?;
            let vdi = VdiRecord {
                reference: Ref::generate(),
                uuid: Uuid::new_v4(),
                name_label: info.name_label.clone(),
                sr: sr.reference.clone(),
                vbds: Vec::new(),
                location: info.location.clone(),
                vdi_type: VdiType::User,
                virtual_size: info.virtual_size,
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
            ctx.db
                .vdis
                .insert(vdi)
                .map_err(|e| ApiError::internal_error(e.to_string()))?;
            let _ = ctx.db.srs.update(&sr.reference, |sr| {
                sr.vdis.push(vdi_ref.clone());
            });
            let vbd = VbdRecord {
                reference: Ref::generate(),
                uuid: Uuid::new_v4(),
                vm: vm_ref.clone(),
                vdi: vdi_ref.clone(),
                userdevice: index.to_string(),
                mode: VbdMode::Rw,
                vbd_type: VbdType::Disk,
                bootable: index == 0,
                empty: false,
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
            let _ = ctx.db.vdis.update(&vdi_ref, |vdi| {
                vdi.vbds.push(vbd_ref.clone());
            });
            let _ = ctx.db.vms.update(vm_ref, |vm| {
                vm.vbds.push(vbd_ref.clone());
            });
        }
        Ok(())
    })
}

/// Roll a VM back to a snapshot: configuration and disks
pub fn revert(ctx: &Context, snapshot_ref: &Ref) -> ApiResult<()> {
    run_vm_operation(ctx, snapshot_ref, VmOperation::Revert, "VM.revert", None, |_task| {
        let snap = ctx
            .db
            .vms
            .get(snapshot_ref)
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        let target_ref = snap.snapshot_of.clone();
        let target = ctx
            .db
            .vms
            .try_get(&target_ref)
            .ok_or_else(|| ApiError::handle_invalid("VM", target_ref.as_str()))?;
        if target.power_state != PowerState::Halted {
            return Err(ApiError::bad_power_state(
                target_ref.as_str(),
                PowerState::Halted.as_str(),
                target.power_state.as_str(),
            ));
        }

        // Configuration rolls back wholesale
        let _ = ctx.db.vms.update(&target_ref, |vm| {
            vm.vcpus_max = snap.vcpus_max;
            vm.vcpus_at_startup = snap.vcpus_at_startup;
            vm.memory_static_min = snap.memory_static_min;
            vm.memory_dynamic_min = snap.memory_dynamic_min;
            vm.memory_dynamic_max = snap.memory_dynamic_max;
            vm.memory_static_max = snap.memory_static_max;
            vm.domain_type = snap.domain_type;
            vm.platform = snap.platform.clone();
            vm.hvm_boot_params = snap.hvm_boot_params.clone();
            vm.nvram = snap.nvram.clone();
            vm.actions_after_shutdown = snap.actions_after_shutdown;
            vm.actions_after_reboot = snap.actions_after_reboot;
            vm.actions_after_crash = snap.actions_after_crash;
        });

        // Current disks are replaced by clones of the snapshot's disks
        for vbd_ref in target.vbds.clone() {
            let Some(vbd) = ctx.db.vbds.try_get(&vbd_ref) else {
                continue;
            };
            if let Some(vdi) = ctx.db.vdis.try_get(&vbd.vdi) {
                if vbd.vbd_type == VbdType::Disk {
                    if let Some(sr) = ctx.db.srs.try_get(&vdi.sr) {
                        let _ = ctx.storage.vdi_destroy(
                            ctx.xenops.dbg(),
                            &sr.uuid.to_string(),
                            &vdi.location,
                        );
                        let _ = ctx.db.srs.update(&sr.reference, |sr| {
                            sr.vdis.retain(|v| v != &vdi.reference);
                        });
                    }
                    let _ = ctx.db.vdis.remove(&vdi.reference);
                }
            }
            let _ = ctx.db.vbds.remove(&vbd_ref);
            let _ = ctx.db.vms.update(&target_ref, |vm| {
                vm.vbds.retain(|v| v != &vbd_ref);
            });
        }
        for vbd_ref in &snap.vbds {
            let Some(vbd) = ctx.db.vbds.try_get(vbd_ref) else {
                continue;
            };
            let new_vdi_ref = if vbd.empty || vbd.vdi.is_null() {
                Ref::null()
            } else if vbd.vbd_type == VbdType::Cd {
                vbd.vdi.clone()
            } else {
                let Some(vdi) = ctx.db.vdis.try_get(&vbd.vdi) else {
                    continue;
                };
                let sr = ctx
                    .db
                    .srs
                    .try_get(&vdi.sr)
                    .ok_or_else(|| ApiError::handle_invalid("SR", vdi.sr.as_str()))?;
                let info = ctx
                    .storage
                    .vdi_clone(ctx.xenops.dbg(), &sr.uuid.to_string(), &vdi.location)
                    .or_else(|e| match e {
                        SmError::NotImplemented(_) => ctx.storage.vdi_copy(
                            ctx.xenops.dbg(),
                            &sr.uuid.to_string(),
                            &vdi.location,
                        ),
                        other => Err(other),
                    })
                    .map_err(|e| ApiError::internal_error(e.to_string()))?;
                let new_vdi = VdiRecord {
                    reference: Ref::generate(),
                    uuid: Uuid::new_v4(),
                    location: info.location.clone(),
                    is_a_snapshot: false,
                    snapshot_of: Ref::null(),
                    snapshot_time: None,
                    vbds: Vec::new(),
                    current_operations: Default::default(),
                    allowed_operations: Vec::new(),
                    ..vdi.clone()
                };
                let new_ref = new_vdi.reference.clone();
                ctx.db
                    .vdis
                    .insert(new_vdi)
                    .map_err(|e| ApiError::internal_error(e.to_string()))?;
                let _ = ctx.db.srs.update(&vdi.sr, |sr| {
                    sr.vdis.push(new_ref.clone());
                });
                new_ref
            };
            let new_vbd = VbdRecord {
                reference: Ref::generate(),
                uuid: Uuid::new_v4(),
                vm: target_ref.clone(),
                vdi: new_vdi_ref.clone(),
                currently_attached: false,
                reserved: false,
                current_operations: Default::default(),
                allowed_operations: Vec::new(),
                ..vbd.clone()
            };
            let new_vbd_ref = new_vbd.reference.clone();
            ctx.db
                .vbds
                .insert(new_vbd)
                .map_err(|e| ApiError::internal_error(e.to_string()))?;
            if !new_vdi_ref.is_null() {
                let _ = ctx.db.vdis.update(&new_vdi_ref, |vdi| {
                    vdi.vbds.push(new_vbd_ref.clone());
                });
            }
            let _ = ctx.db.vms.update(&target_ref, |vm| {
                vm.vbds.push(new_vbd_ref.clone());
            });
        }
        allowed::update_vm_and_devices(&ctx.db, &target_ref);
        Ok(())
    })
}

pub fn make_into_template(ctx: &Context, vm_ref: &Ref) -> ApiResult<()> {
    run_vm_operation(
        ctx,
        vm_ref,
        VmOperation::MakeIntoTemplate,
        "VM.make_into_template",
        None,
        |_task| {
            let _ = ctx.db.vms.update(vm_ref, |vm| {
                vm.is_a_template = true;
            });
            Ok(())
        },
    )
}

/// Remove the VM and its dependent rows; disks survive
pub fn destroy(ctx: &Context, vm_ref: &Ref) -> ApiResult<()> {
    run_vm_operation(ctx, vm_ref, VmOperation::Destroy, "VM.destroy", None, |_task| {
        let vm = ctx
            .db
            .vms
            .get(vm_ref)
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        for vbd_ref in &vm.vbds {
            if let Some(vbd) = ctx.db.vbds.try_get(vbd_ref) {
                if !vbd.vdi.is_null() {
                    let _ = ctx.db.vdis.update(&vbd.vdi, |vdi| {
                        vdi.vbds.retain(|v| v != vbd_ref);
                    });
                }
            }
            let _ = ctx.db.vbds.remove(vbd_ref);
        }
        for vif_ref in &vm.vifs {
            if let Some(vif) = ctx.db.vifs.try_get(vif_ref) {
                let _ = ctx.db.networks.update(&vif.network, |network| {
                    network.vifs.retain(|v| v != vif_ref);
                });
            }
            let _ = ctx.db.vifs.remove(vif_ref);
        }
        for console_ref in &vm.consoles {
            let _ = ctx.db.consoles.remove(console_ref);
        }
        for vgpu_ref in &vm.vgpus {
            let _ = ctx.db.vgpus.remove(vgpu_ref);
        }
        for vusb_ref in &vm.vusbs {
            let _ = ctx.db.vusbs.remove(vusb_ref);
        }
        for vtpm_ref in &vm.vtpms {
            let _ = ctx.db.vtpms.remove(vtpm_ref);
        }
        if !vm.metrics.is_null() {
            let _ = ctx.db.vm_metrics.remove(&vm.metrics);
        }
        if !vm.guest_metrics.is_null() {
            let _ = ctx.db.vm_guest_metrics.remove(&vm.guest_metrics);
        }
        ctx.db
            .vms
            .remove(vm_ref)
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        Ok(())
    })
}

/// Source side of a live migration. The destination adapter stands for the
/// peer host reached through the forwarding layer; when both are this host
/// the move is a no-op rehearsal.
pub fn pool_migrate(
    ctx: &Context,
    vm_ref: &Ref,
    dest_host: &Ref,
    dest: &XenopsAdapter,
) -> ApiResult<()> {
    run_vm_operation(
        ctx,
        vm_ref,
        VmOperation::PoolMigrate,
        "VM.pool_migrate",
        None,
        |task| {
            let vm = ctx
                .db
                .vms
                .get(vm_ref)
                .map_err(|e| ApiError::internal_error(e.to_string()))?;
            let id = vm.uuid.to_string();
            let dest_host = dest_host.clone();
            let _ = ctx.db.vms.update(vm_ref, |vm| {
                vm.scheduled_to_be_resident_on = dest_host.clone();
            });

            // Source-side events are batched behind the window so the
            // destination's progress cannot flip our record early
            let outcome = ctx.xenops.with_suppressed(&id, || -> ApiResult<()> {
                let suspend = ctx
                    .xenops
                    .client
                    .vm_suspend(ctx.xenops.dbg(), &id, "migration-stream")
                    .map_err(|e| ctx.xenops.rpc_failed(vm_ref.as_str(), e))?;
                ctx.xenops.run_task(Some(task), &suspend)?;

                let doc = ctx
                    .xenops
                    .pull_metadata(&id)
                    .map_err(|e| ctx.xenops.rpc_failed(vm_ref.as_str(), e))?;
                ctx.xenops.caches.unregister(&id);

                dest.client
                    .vm_import_metadata(dest.dbg(), &doc)
                    .map_err(|e| dest.rpc_failed(vm_ref.as_str(), e))?;
                dest.caches.register(&id);
                let resume = dest
                    .client
                    .vm_resume(dest.dbg(), &id, "migration-stream")
                    .map_err(|e| dest.rpc_failed(vm_ref.as_str(), e))?;
                ctx.xenops.run_task(Some(task), &resume)?;
                Ok(())
            });
            if let Err(e) = outcome {
                let _ = ctx.db.vms.update(vm_ref, |vm| {
                    vm.scheduled_to_be_resident_on = Ref::null();
                });
                return Err(e);
            }

            await_power_state(ctx, vm_ref, &[PowerState::Running], POWER_STATE_TIMEOUT)?;
            let _ = ctx.db.vms.update(vm_ref, |vm| {
                vm.scheduled_to_be_resident_on = Ref::null();
            });
            Ok(())
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SmClient;
    use crate::xenops::pumps;

    fn insert_halted_vm(ctx: &Context, name: &str) -> Ref {
        let metrics = VmMetricsRecord {
            reference: Ref::generate(),
            uuid: Uuid::new_v4(),
            vm: Ref::null(),
            current_domain_type: DomainType::Unspecified,
            nomigrate: false,
            nested_virt: false,
            start_time: chrono::Utc::now() - chrono::Duration::days(1),
        };
        let vm = VmRecord {
            reference: Ref::generate(),
            uuid: Uuid::new_v4(),
            name_label: name.to_string(),
            memory_static_max: 1 << 30,
            metrics: metrics.reference.clone(),
            ..Default::default()
        };
        let vm_ref = vm.reference.clone();
        ctx.db.vm_metrics.insert(metrics).unwrap();
        ctx.db.vms.insert(vm).unwrap();
        vm_ref
    }

    fn add_sr(ctx: &Context, storage: &crate::storage::sim::SimStorage) -> Ref {
        let sr = SrRecord {
            reference: Ref::generate(),
            uuid: Uuid::new_v4(),
            name_label: "local".to_string(),
            name_description: String::new(),
            sr_type: "ext".to_string(),
            content_type: "user".to_string(),
            pbds: Vec::new(),
            vdis: Vec::new(),
            physical_size: 1 << 40,
            physical_utilisation: 0,
            virtual_allocation: 0,
            shared: false,
            clustered: false,
            is_tools_sr: false,
            capabilities: crate::storage::sim::full_capabilities(),
            sm_config: Default::default(),
            other_config: Default::default(),
            current_operations: Default::default(),
            allowed_operations: Vec::new(),
        };
        let sr_ref = sr.reference.clone();
        storage.add_sr(&sr.uuid.to_string());
        ctx.db.srs.insert(sr).unwrap();
        let pool_ref = ctx.db.pool().unwrap().reference;
        ctx.db
            .pools
            .update(&pool_ref, |pool| pool.default_sr = sr_ref.clone())
            .unwrap();
        sr_ref
    }

    #[test]
    fn test_start_then_shutdown_restores_invariants() {
        let (ctx, _xenops, _storage) = Context::sim();
        let vm_ref = insert_halted_vm(&ctx, "lifecycle");
        let pumps = pumps::start(ctx.xenops.clone(), Duration::from_millis(50));

        start(&ctx, &vm_ref, false, false).unwrap();
        let vm = ctx.db.vms.get(&vm_ref).unwrap();
        assert_eq!(vm.power_state, PowerState::Running);
        assert_eq!(vm.resident_on, ctx.localhost);
        assert!(vm.domid >= 0);

        clean_shutdown(&ctx, &vm_ref).unwrap();
        let vm = ctx.db.vms.get(&vm_ref).unwrap();
        assert_eq!(vm.power_state, PowerState::Halted);
        assert!(vm.resident_on.is_null());
        assert!(vm.scheduled_to_be_resident_on.is_null());
        assert_eq!(vm.domid, -1);

        pumps.stop();
    }

    #[test]
    fn test_second_operation_rejected_while_first_holds_lock() {
        let (ctx, _xenops, _storage) = Context::sim();
        let vm_ref = insert_halted_vm(&ctx, "locked");
        // A lingering operation entry left by another task
        let task = ctx.tasks.create("VM.clean_shutdown", None, true).unwrap();
        ctx.db
            .vms
            .update(&vm_ref, |vm| {
                vm.power_state = PowerState::Running;
                vm.current_operations
                    .insert(task.clone(), VmOperation::CleanShutdown);
            })
            .unwrap();

        let err = clean_reboot(&ctx, &vm_ref).unwrap_err();
        assert_eq!(err.code, codes::OTHER_OPERATION_IN_PROGRESS);
        assert_eq!(err.args[2], task.as_str());
        assert_eq!(err.args[3], "clean_shutdown");

        // The rejected operation left a failed task behind
        let failed = ctx
            .db
            .tasks
            .list()
            .into_iter()
            .find(|t| t.name_label == "VM.clean_reboot")
            .unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error_info[0], codes::OTHER_OPERATION_IN_PROGRESS);
    }

    #[test]
    fn test_suspend_resume_roundtrip() {
        let (ctx, _xenops, storage) = Context::sim();
        add_sr(&ctx, &storage);
        let vm_ref = insert_halted_vm(&ctx, "susp");
        let pumps = pumps::start(ctx.xenops.clone(), Duration::from_millis(50));

        start(&ctx, &vm_ref, false, false).unwrap();
        suspend(&ctx, &vm_ref).unwrap();
        let vm = ctx.db.vms.get(&vm_ref).unwrap();
        assert_eq!(vm.power_state, PowerState::Suspended);
        assert!(!vm.last_booted_record.is_empty());
        assert!(!vm.suspend_vdi.is_null());

        resume(&ctx, &vm_ref, false).unwrap();
        let vm = ctx.db.vms.get(&vm_ref).unwrap();
        assert_eq!(vm.power_state, PowerState::Running);
        assert!(vm.suspend_vdi.is_null());

        pumps.stop();
    }

    #[test]
    fn test_destroy_cascades() {
        let (ctx, _xenops, _storage) = Context::sim();
        let vm_ref = insert_halted_vm(&ctx, "gone");
        let vbd = VbdRecord {
            reference: Ref::generate(),
            uuid: Uuid::new_v4(),
            vm: vm_ref.clone(),
            vdi: Ref::null(),
            userdevice: "0".to_string(),
            mode: VbdMode::Rw,
            vbd_type: VbdType::Disk,
            bootable: false,
            empty: true,
            currently_attached: false,
            reserved: false,
            current_operations: Default::default(),
            allowed_operations: Vec::new(),
            other_config: Default::default(),
        };
        let vbd_ref = vbd.reference.clone();
        ctx.db.vbds.insert(vbd).unwrap();
        ctx.db
            .vms
            .update(&vm_ref, |vm| vm.vbds.push(vbd_ref.clone()))
            .unwrap();

        destroy(&ctx, &vm_ref).unwrap();
        assert!(ctx.db.vms.try_get(&vm_ref).is_none());
        assert!(ctx.db.vbds.try_get(&vbd_ref).is_none());
    }

    #[test]
    fn test_snapshot_and_clone_with_fallback() {
        let (ctx, _xenops, storage) = Context::sim();
        let sr_ref = add_sr(&ctx, &storage);
        let vm_ref = insert_halted_vm(&ctx, "src");
        let sr_uuid = ctx.db.srs.get(&sr_ref).unwrap().uuid.to_string();

        // Give the VM one real disk
        let info = storage
            .vdi_create("dbg", &sr_uuid, "root", 1 << 30, VdiType::User)
            .unwrap();
        let vdi = VdiRecord {
            reference: Ref::generate(),
            uuid: Uuid::new_v4(),
            name_label: "root".to_string(),
            sr: sr_ref.clone(),
            vbds: Vec::new(),
            location: info.location.clone(),
            vdi_type: VdiType::User,
            virtual_size: 1 << 30,
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
        let vbd = VbdRecord {
            reference: Ref::generate(),
            uuid: Uuid::new_v4(),
            vm: vm_ref.clone(),
            vdi: vdi_ref.clone(),
            userdevice: "xvda".to_string(),
            mode: VbdMode::Rw,
            vbd_type: VbdType::Disk,
            bootable: true,
            empty: false,
            currently_attached: false,
            reserved: false,
            current_operations: Default::default(),
            allowed_operations: Vec::new(),
            other_config: Default::default(),
        };
        let vbd_ref = vbd.reference.clone();
        ctx.db.vbds.insert(vbd).unwrap();
        ctx.db
            .vms
            .update(&vm_ref, |vm| vm.vbds.push(vbd_ref.clone()))
            .unwrap();
        ctx.db
            .vdis
            .update(&vdi_ref, |vdi| vdi.vbds.push(vbd_ref.clone()))
            .unwrap();

        let snap_ref = snapshot(&ctx, &vm_ref, "snap-1").unwrap();
        let snap = ctx.db.vms.get(&snap_ref).unwrap();
        assert!(snap.is_a_snapshot);
        assert_eq!(snap.snapshot_of, vm_ref);
        assert_eq!(snap.vbds.len(), 1);
        let snap_vbd = ctx.db.vbds.get(&snap.vbds[0]).unwrap();
        let snap_vdi = ctx.db.vdis.get(&snap_vbd.vdi).unwrap();
        assert!(snap_vdi.is_a_snapshot);
        assert_eq!(snap_vdi.snapshot_of, vdi_ref);

        // Clone falls back to copy when the backend refuses
        storage
            .clone_unimplemented
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let clone_ref = clone_vm(&ctx, &vm_ref, "clone-1").unwrap();
        let clone = ctx.db.vms.get(&clone_ref).unwrap();
        assert!(!clone.is_a_snapshot);
        assert_eq!(clone.vbds.len(), 1);
    }
}
