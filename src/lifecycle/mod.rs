//! Object Lifecycle Services
//!
//! The operation handlers behind the public API. Every handler follows the
//! same protocol:
//! 1. open a task (linked to a parent when given)
//! 2. assert the operation valid on each object it will mutate
//! 3. take the semantic lock: a current_operations entry per target
//! 4. perform the effect (database mutation, daemon RPC where live)
//! 5. refresh allowed_operations on every touched object
//! 6. drop the current_operations entries
//! 7. complete the task
//!
//! Failures complete the task as failed after the same unlock and refresh
//! steps, leaving the system recoverable.

pub mod sr;
pub mod vbd;
pub mod vdi;
pub mod vif;
pub mod vm;

use crate::allowed;
use crate::api_error::{ApiError, ApiResult};
use crate::context::Context;
use crate::db::models::*;

/// Open a task, run the body, and settle the task from the outcome
pub(crate) fn with_task<R>(
    ctx: &Context,
    label: &str,
    parent: Option<&Ref>,
    cancellable: bool,
    body: impl FnOnce(&Ref) -> ApiResult<R>,
) -> ApiResult<R> {
    let task = ctx
        .tasks
        .create(label, parent, cancellable)
        .map_err(|e| ApiError::internal_error(e.to_string()))?;
    let result = body(&task);
    match &result {
        Ok(_) => ctx.tasks.complete(&task, ""),
        Err(e) => {
            log::info!("{} failed: {}", label, e);
            ctx.tasks.fail(&task, e);
        }
    }
    result
}

/// The full protocol for an operation whose primary target is a VM
pub fn run_vm_operation<R>(
    ctx: &Context,
    vm_ref: &Ref,
    op: VmOperation,
    label: &str,
    parent: Option<&Ref>,
    body: impl FnOnce(&Ref) -> ApiResult<R>,
) -> ApiResult<R> {
    with_task(ctx, label, parent, true, |task| {
        allowed::assert_vm_operation_valid(&ctx.db, vm_ref, op)?;
        ctx.db
            .vms
            .update(vm_ref, |vm| {
                vm.current_operations.insert(task.clone(), op);
            })
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        ctx.tasks.add_lock(task, Class::Vm, vm_ref);
        allowed::update_vm_allowed_operations(&ctx.db, vm_ref);

        let result = body(task);

        let _ = ctx.db.vms.update(vm_ref, |vm| {
            vm.current_operations.remove(task);
        });
        ctx.tasks.remove_lock(task, Class::Vm, vm_ref);
        allowed::update_vm_and_devices(&ctx.db, vm_ref);
        result
    })
}

/// The same protocol for VBD-targeted operations
pub fn run_vbd_operation<R>(
    ctx: &Context,
    vbd_ref: &Ref,
    op: VbdOperation,
    label: &str,
    parent: Option<&Ref>,
    body: impl FnOnce(&Ref) -> ApiResult<R>,
) -> ApiResult<R> {
    with_task(ctx, label, parent, true, |task| {
        allowed::assert_vbd_operation_valid(&ctx.db, vbd_ref, op)?;
        ctx.db
            .vbds
            .update(vbd_ref, |vbd| {
                vbd.current_operations.insert(task.clone(), op);
            })
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        ctx.tasks.add_lock(task, Class::Vbd, vbd_ref);
        allowed::update_vbd_allowed_operations(&ctx.db, vbd_ref);

        let result = body(task);

        let _ = ctx.db.vbds.update(vbd_ref, |vbd| {
            vbd.current_operations.remove(task);
        });
        ctx.tasks.remove_lock(task, Class::Vbd, vbd_ref);
        if ctx.db.vbds.contains(vbd_ref) {
            allowed::update_vbd_allowed_operations(&ctx.db, vbd_ref);
        }
        result
    })
}

/// The same protocol for VIF-targeted operations
pub fn run_vif_operation<R>(
    ctx: &Context,
    vif_ref: &Ref,
    op: VifOperation,
    label: &str,
    parent: Option<&Ref>,
    body: impl FnOnce(&Ref) -> ApiResult<R>,
) -> ApiResult<R> {
    with_task(ctx, label, parent, true, |task| {
        allowed::assert_vif_operation_valid(&ctx.db, vif_ref, op)?;
        ctx.db
            .vifs
            .update(vif_ref, |vif| {
                vif.current_operations.insert(task.clone(), op);
            })
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        ctx.tasks.add_lock(task, Class::Vif, vif_ref);
        allowed::update_vif_allowed_operations(&ctx.db, vif_ref);

        let result = body(task);

        let _ = ctx.db.vifs.update(vif_ref, |vif| {
            vif.current_operations.remove(task);
        });
        ctx.tasks.remove_lock(task, Class::Vif, vif_ref);
        if ctx.db.vifs.contains(vif_ref) {
            allowed::update_vif_allowed_operations(&ctx.db, vif_ref);
        }
        result
    })
}

/// The same protocol for VDI-targeted operations
pub fn run_vdi_operation<R>(
    ctx: &Context,
    vdi_ref: &Ref,
    op: VdiOperation,
    label: &str,
    parent: Option<&Ref>,
    body: impl FnOnce(&Ref) -> ApiResult<R>,
) -> ApiResult<R> {
    with_task(ctx, label, parent, true, |task| {
        allowed::assert_vdi_operation_valid(&ctx.db, vdi_ref, op)?;
        ctx.db
            .vdis
            .update(vdi_ref, |vdi| {
                vdi.current_operations.insert(task.clone(), op);
            })
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        ctx.tasks.add_lock(task, Class::Vdi, vdi_ref);
        allowed::update_vdi_allowed_operations(&ctx.db, vdi_ref);

        let result = body(task);

        let _ = ctx.db.vdis.update(vdi_ref, |vdi| {
            vdi.current_operations.remove(task);
        });
        ctx.tasks.remove_lock(task, Class::Vdi, vdi_ref);
        if ctx.db.vdis.contains(vdi_ref) {
            allowed::update_vdi_allowed_operations(&ctx.db, vdi_ref);
        }
        result
    })
}

/// The same protocol for SR-targeted operations
pub fn run_sr_operation<R>(
    ctx: &Context,
    sr_ref: &Ref,
    op: SrOperation,
    label: &str,
    parent: Option<&Ref>,
    body: impl FnOnce(&Ref) -> ApiResult<R>,
) -> ApiResult<R> {
    with_task(ctx, label, parent, true, |task| {
        allowed::assert_sr_operation_valid(&ctx.db, sr_ref, op)?;
        ctx.db
            .srs
            .update(sr_ref, |sr| {
                sr.current_operations.insert(task.clone(), op);
            })
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        ctx.tasks.add_lock(task, Class::Sr, sr_ref);
        allowed::update_sr_allowed_operations(&ctx.db, sr_ref);

        let result = body(task);

        let _ = ctx.db.srs.update(sr_ref, |sr| {
            sr.current_operations.remove(task);
        });
        ctx.tasks.remove_lock(task, Class::Sr, sr_ref);
        if ctx.db.srs.contains(sr_ref) {
            allowed::update_sr_allowed_operations(&ctx.db, sr_ref);
        }
        result
    })
}
