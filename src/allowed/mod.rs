//! Allowed-Operations Engine
//!
//! One pure predicate per class deciding whether an operation is valid right
//! now. Each chain is evaluated twice around every mutation: once as the
//! admission check and once to refresh the advisory allowed_operations cache
//! on the touched rows. The cache informs UIs only; the server always
//! re-evaluates the live predicate.

pub mod sr;
pub mod vbd;
pub mod vdi;
pub mod vif;
pub mod vm;

pub use sr::{
    assert_sr_operation_valid, check_sr_operation, update_sr_allowed_operations, ALL_SR_OPERATIONS,
};
pub use vbd::{
    assert_vbd_operation_valid, check_vbd_operation, update_vbd_allowed_operations,
    ALL_VBD_OPERATIONS,
};
pub use vdi::{
    assert_vdi_operation_valid, check_vdi_operation, update_vdi_allowed_operations,
    ALL_VDI_OPERATIONS,
};
pub use vif::{
    assert_vif_operation_valid, check_vif_operation, update_vif_allowed_operations,
    ALL_VIF_OPERATIONS,
};
pub use vm::{
    assert_vm_operation_valid, check_vm_operation, check_vm_operation_strictness,
    update_vm_allowed_operations, ALL_VM_OPERATIONS,
};

use crate::db::models::Ref;
use crate::db::Database;

/// Refresh a VM's cache together with every device and disk hanging off it.
/// Called after mutations whose verdict reaches across the object graph.
pub fn update_vm_and_devices(db: &Database, vm_ref: &Ref) {
    update_vm_allowed_operations(db, vm_ref);
    let Some(vm) = db.vms.try_get(vm_ref) else {
        return;
    };
    for vbd_ref in &vm.vbds {
        update_vbd_allowed_operations(db, vbd_ref);
        if let Some(vbd) = db.vbds.try_get(vbd_ref) {
            if !vbd.vdi.is_null() {
                update_vdi_allowed_operations(db, &vbd.vdi);
            }
        }
    }
    for vif_ref in &vm.vifs {
        update_vif_allowed_operations(db, vif_ref);
    }
}
