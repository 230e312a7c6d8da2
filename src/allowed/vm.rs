//! VM Operation Admission
//!
//! The ordered predicate chain deciding whether a VM operation may proceed.
//! The first failing predicate wins; the ordering is part of the API because
//! the error codes are user-visible.

use lazy_static::lazy_static;
use std::collections::HashSet;

use crate::api_error::{codes, ApiError, ApiResult};
use crate::db::models::*;
use crate::db::Database;

/// Every operation the engine evaluates for the allowed_operations cache
pub const ALL_VM_OPERATIONS: &[VmOperation] = &[
    VmOperation::Snapshot,
    VmOperation::SnapshotWithQuiesce,
    VmOperation::Checkpoint,
    VmOperation::Clone,
    VmOperation::Copy,
    VmOperation::Revert,
    VmOperation::Provision,
    VmOperation::Start,
    VmOperation::StartOn,
    VmOperation::Pause,
    VmOperation::Unpause,
    VmOperation::CleanShutdown,
    VmOperation::CleanReboot,
    VmOperation::HardShutdown,
    VmOperation::HardReboot,
    VmOperation::Suspend,
    VmOperation::Resume,
    VmOperation::ResumeOn,
    VmOperation::PoolMigrate,
    VmOperation::MigrateSend,
    VmOperation::Destroy,
    VmOperation::Export,
    VmOperation::MetadataExport,
    VmOperation::MakeIntoTemplate,
    VmOperation::ChangingDynamicRange,
    VmOperation::ChangingStaticRange,
    VmOperation::ChangingVcpusLive,
    VmOperation::ChangingVcpus,
    VmOperation::DataSourceOp,
    VmOperation::CreateVtpm,
];

lazy_static! {
    /// Operations templates admit
    static ref TEMPLATE_OPERATIONS: HashSet<VmOperation> = [
        VmOperation::Snapshot,
        VmOperation::Clone,
        VmOperation::Copy,
        VmOperation::Provision,
        VmOperation::Destroy,
        VmOperation::Export,
        VmOperation::MetadataExport,
        VmOperation::ChangingStaticRange,
        VmOperation::ChangingDynamicRange,
    ]
    .into_iter()
    .collect();

    /// Operations snapshots admit
    static ref SNAPSHOT_OPERATIONS: HashSet<VmOperation> = [
        VmOperation::Revert,
        VmOperation::Clone,
        VmOperation::Copy,
        VmOperation::Export,
        VmOperation::MetadataExport,
        VmOperation::Destroy,
    ]
    .into_iter()
    .collect();

    /// Operations the control domain admits
    static ref CONTROL_DOMAIN_OPERATIONS: HashSet<VmOperation> =
        [VmOperation::DataSourceOp].into_iter().collect();

    /// Operations permitted while a rolling pool upgrade is in progress
    static ref RPU_ALLOWED_OPERATIONS: HashSet<VmOperation> = [
        VmOperation::Start,
        VmOperation::StartOn,
        VmOperation::Pause,
        VmOperation::Unpause,
        VmOperation::CleanShutdown,
        VmOperation::CleanReboot,
        VmOperation::HardShutdown,
        VmOperation::HardReboot,
        VmOperation::Suspend,
        VmOperation::Resume,
        VmOperation::ResumeOn,
        VmOperation::PoolMigrate,
        VmOperation::MigrateSend,
        VmOperation::Destroy,
        VmOperation::DataSourceOp,
    ]
    .into_iter()
    .collect();
}

/// Operations that move or freeze a running guest
fn is_mobility_op(op: VmOperation) -> bool {
    matches!(
        op,
        VmOperation::Suspend
            | VmOperation::Checkpoint
            | VmOperation::PoolMigrate
            | VmOperation::MigrateSend
    )
}

/// Power states from which each operation is valid; None means any
fn allowed_power_states(op: VmOperation) -> Option<&'static [PowerState]> {
    use PowerState::*;
    match op {
        VmOperation::Start | VmOperation::StartOn | VmOperation::Provision => Some(&[Halted]),
        VmOperation::CleanShutdown
        | VmOperation::CleanReboot
        | VmOperation::Suspend
        | VmOperation::Checkpoint
        | VmOperation::SnapshotWithQuiesce
        | VmOperation::Pause
        | VmOperation::ChangingVcpusLive
        | VmOperation::ChangingMemoryLive
        | VmOperation::DataSourceOp => Some(&[Running]),
        VmOperation::HardShutdown | VmOperation::HardReboot => {
            Some(&[Running, Paused, Suspended])
        }
        VmOperation::Unpause => Some(&[Paused]),
        VmOperation::Resume | VmOperation::ResumeOn => Some(&[Suspended]),
        VmOperation::PoolMigrate | VmOperation::MigrateSend => Some(&[Running]),
        VmOperation::Snapshot | VmOperation::Export => Some(&[Halted, Suspended, Running]),
        VmOperation::Destroy
        | VmOperation::MakeIntoTemplate
        | VmOperation::ChangingStaticRange
        | VmOperation::ChangingVcpus
        | VmOperation::CreateVtpm
        | VmOperation::Import => Some(&[Halted]),
        VmOperation::ChangingDynamicRange => Some(&[Halted, Running]),
        VmOperation::Clone | VmOperation::Copy => Some(&[Halted, Suspended, Running]),
        VmOperation::Revert
        | VmOperation::MetadataExport
        | VmOperation::PowerStateReset => None,
    }
}

/// Pairs of operations that may run concurrently on one VM
fn allowed_concurrently(op: VmOperation, in_flight: VmOperation) -> bool {
    match (op, in_flight) {
        // A plain snapshot may ride along a quiesced snapshot or checkpoint
        (VmOperation::Snapshot, VmOperation::SnapshotWithQuiesce) => true,
        (VmOperation::Snapshot, VmOperation::Checkpoint) => true,
        (VmOperation::DataSourceOp, VmOperation::DataSourceOp) => true,
        (VmOperation::MetadataExport, VmOperation::MetadataExport) => true,
        _ => false,
    }
}

/// Whether the guest can be frozen and moved
fn is_mobile(db: &Database, vm: &VmRecord) -> bool {
    let (nomigrate, nested_virt) = match db.vm_metrics.try_get(&vm.metrics) {
        Some(metrics) => (metrics.nomigrate, metrics.nested_virt),
        None => (
            vm.platform_flag("nomigrate"),
            vm.platform_flag("nested-virt"),
        ),
    };
    !(nomigrate || nested_virt)
}

fn required_feature(op: VmOperation) -> Option<&'static str> {
    match op {
        VmOperation::CleanShutdown => Some("feature-shutdown"),
        VmOperation::CleanReboot => Some("feature-reboot"),
        VmOperation::Suspend | VmOperation::Checkpoint => Some("feature-suspend"),
        VmOperation::ChangingVcpusLive => Some("feature-vcpu-hotplug"),
        _ => None,
    }
}

/// Evaluate the full predicate chain for `op` against the record as given.
/// Deterministic and free of I/O beyond database reads; safe to call inside
/// a read transaction. `strict` is cleared by force variants of operations.
pub fn check_vm_operation_strictness(
    db: &Database,
    vm: &VmRecord,
    op: VmOperation,
    strict: bool,
) -> ApiResult<()> {
    let reference = vm.reference.as_str();

    // 1. Explicit user block
    if let Some(reason) = vm.blocked_operations.get(&op) {
        return Err(ApiError::operation_blocked(reference, reason));
    }

    // 2. Power-state precondition; templates have no meaningful power state
    if !vm.is_a_template {
        if let Some(expected) = allowed_power_states(op) {
            if !expected.contains(&vm.power_state) {
                let expected = expected
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join("|");
                return Err(ApiError::bad_power_state(
                    reference,
                    &expected,
                    vm.power_state.as_str(),
                ));
            }
        }
    }

    // 3. Concurrent-operations policy
    for (task, in_flight) in &vm.current_operations {
        if !allowed_concurrently(op, *in_flight) {
            return Err(ApiError::other_operation_in_progress(
                "VM",
                reference,
                task.as_str(),
                in_flight.as_str(),
            ));
        }
    }

    // 4. Template and snapshot class membership
    if vm.is_a_snapshot && !SNAPSHOT_OPERATIONS.contains(&op) {
        return Err(ApiError::new(
            codes::VM_IS_SNAPSHOT,
            vec![reference.to_string(), op.as_str().to_string()],
        ));
    }
    if vm.is_a_template && !vm.is_a_snapshot && !TEMPLATE_OPERATIONS.contains(&op) {
        return Err(ApiError::new(
            codes::VM_IS_TEMPLATE,
            vec![reference.to_string(), op.as_str().to_string()],
        ));
    }

    // 5. Provision and revert class restrictions
    if op == VmOperation::Provision && !vm.is_a_template {
        return Err(ApiError::operation_not_allowed(
            "provision is only valid on a template",
        ));
    }
    if op == VmOperation::Revert && !vm.is_a_snapshot {
        return Err(ApiError::operation_not_allowed(
            "revert is only valid on a snapshot",
        ));
    }

    // 6. Mobility
    if strict && !is_mobile(db, vm) {
        if is_mobility_op(op) {
            return Err(ApiError::new(
                codes::VM_IS_IMMOBILE,
                vec![reference.to_string()],
            ));
        }
        // A pinned guest cannot balloon either
        if op == VmOperation::ChangingDynamicRange {
            return Err(ApiError::new(
                codes::VM_IS_IMMOBILE,
                vec![reference.to_string()],
            ));
        }
    }

    // 7. Control-domain restrictions
    if vm.is_control_domain && !CONTROL_DOMAIN_OPERATIONS.contains(&op) {
        return Err(ApiError::operation_not_allowed(
            "operation not permitted on the control domain",
        ));
    }

    // 8. Guest feature prerequisites
    if strict && vm.domain_type == DomainType::Hvm {
        if let Some(feature) = required_feature(op) {
            let guest = db.vm_guest_metrics.try_get(&vm.guest_metrics);
            let has = guest
                .as_ref()
                .map(|g| g.other.contains_key(feature))
                .unwrap_or(false);
            if !has {
                return Err(ApiError::new(
                    codes::VM_LACKS_FEATURE,
                    vec![reference.to_string(), feature.to_string()],
                ));
            }
        }
    }
    if is_mobility_op(op) {
        if let Some(guest) = db.vm_guest_metrics.try_get(&vm.guest_metrics) {
            if let Some(reason) = guest.other.get("data-cant-suspend-reason") {
                return Err(ApiError::new(
                    codes::VM_NON_SUSPENDABLE,
                    vec![reference.to_string(), reason.clone()],
                ));
            }
        }
    }

    // 11. Reset-on-boot disks cannot survive a memory image
    if matches!(op, VmOperation::Suspend | VmOperation::Checkpoint) {
        for vbd_ref in &vm.vbds {
            let Some(vbd) = db.vbds.try_get(vbd_ref) else {
                continue;
            };
            if let Some(vdi) = db.vdis.try_get(&vbd.vdi) {
                if vdi.on_boot == OnBoot::Reset {
                    return Err(ApiError::new(
                        codes::VDI_ON_BOOT_MODE_INCOMPATIBLE_WITH_OPERATION,
                        vec![vdi.reference.as_str().to_string()],
                    ));
                }
            }
        }
    }

    // 12. Passthrough hardware pins the guest to its host
    if is_mobility_op(op) {
        if !vm.attached_pcis.is_empty() {
            return Err(ApiError::new(
                codes::VM_HAS_PCI_ATTACHED,
                vec![reference.to_string()],
            ));
        }
        for vgpu_ref in &vm.vgpus {
            let Some(vgpu) = db.vgpus.try_get(vgpu_ref) else {
                continue;
            };
            let migratable = vgpu.implementation == VgpuImplementation::Nvidia
                && db
                    .pgpus
                    .try_get(&vgpu.pgpu)
                    .map(|p| p.supports_migration())
                    .unwrap_or(false);
            if !migratable {
                return Err(ApiError::new(
                    codes::VM_HAS_VGPU,
                    vec![reference.to_string(), vgpu.reference.as_str().to_string()],
                ));
            }
        }
        let any_vusb = vm.vusbs.iter().any(|r| {
            db.vusbs
                .try_get(r)
                .map(|v| v.currently_attached)
                .unwrap_or(false)
        });
        if any_vusb {
            return Err(ApiError::new(
                codes::VM_HAS_VUSBS,
                vec![reference.to_string()],
            ));
        }
    }

    // 13. Group membership pins identity
    if op == VmOperation::MakeIntoTemplate {
        if !vm.appliance.is_null() {
            return Err(ApiError::new(
                codes::VM_IS_PART_OF_AN_APPLIANCE,
                vec![reference.to_string(), vm.appliance.as_str().to_string()],
            ));
        }
        if !vm.protection_policy.is_null() {
            return Err(ApiError::new(
                codes::VM_ASSIGNED_TO_PROTECTION_POLICY,
                vec![
                    reference.to_string(),
                    vm.protection_policy.as_str().to_string(),
                ],
            ));
        }
        if !vm.snapshot_schedule.is_null() {
            return Err(ApiError::new(
                codes::VM_ASSIGNED_TO_SNAPSHOT_SCHEDULE,
                vec![
                    reference.to_string(),
                    vm.snapshot_schedule.as_str().to_string(),
                ],
            ));
        }
    }

    // 14. One VTPM per guest
    if op == VmOperation::CreateVtpm && !vm.vtpms.is_empty() {
        return Err(ApiError::new(
            codes::VTPM_MAX_AMOUNT_REACHED,
            vec![reference.to_string(), "1".to_string()],
        ));
    }

    // 16. Rolling-upgrade allowlist
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

/// Strict evaluation, the default for user-initiated operations
pub fn check_vm_operation(db: &Database, vm: &VmRecord, op: VmOperation) -> ApiResult<()> {
    check_vm_operation_strictness(db, vm, op, true)
}

/// Fetch the record and evaluate; the entry point called before any mutation
pub fn assert_vm_operation_valid(db: &Database, vm_ref: &Ref, op: VmOperation) -> ApiResult<()> {
    let vm = db
        .vms
        .try_get(vm_ref)
        .ok_or_else(|| ApiError::handle_invalid("VM", vm_ref.as_str()))?;
    check_vm_operation(db, &vm, op)
}

/// Recompute the advisory allowed_operations cache after a mutation
pub fn update_vm_allowed_operations(db: &Database, vm_ref: &Ref) {
    let Some(vm) = db.vms.try_get(vm_ref) else {
        return;
    };
    let allowed: Vec<VmOperation> = ALL_VM_OPERATIONS
        .iter()
        .copied()
        .filter(|op| check_vm_operation(db, &vm, *op).is_ok())
        .collect();
    if allowed != vm.allowed_operations {
        let _ = db.vms.update(vm_ref, |vm| vm.allowed_operations = allowed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use std::sync::Arc;
    use uuid::Uuid;

    fn fresh_db() -> Database {
        Database::new(Arc::new(EventBus::default()))
    }

    fn insert_vm(db: &Database, power_state: PowerState) -> VmRecord {
        let vm = VmRecord {
            reference: Ref::generate(),
            uuid: Uuid::new_v4(),
            name_label: "t".to_string(),
            power_state,
            ..Default::default()
        };
        db.vms.insert(vm.clone()).unwrap();
        vm
    }

    #[test]
    fn test_blocked_operation_wins() {
        let db = fresh_db();
        let mut vm = insert_vm(&db, PowerState::Running);
        vm.blocked_operations
            .insert(VmOperation::CleanShutdown, "maintenance".to_string());
        let err = check_vm_operation(&db, &vm, VmOperation::CleanShutdown).unwrap_err();
        assert_eq!(err.code, codes::OPERATION_BLOCKED);
        assert_eq!(err.args[1], "maintenance");
    }

    #[test]
    fn test_bad_power_state() {
        let db = fresh_db();
        let vm = insert_vm(&db, PowerState::Halted);
        let err = check_vm_operation(&db, &vm, VmOperation::CleanShutdown).unwrap_err();
        assert_eq!(err.code, codes::BAD_POWER_STATE);
        assert_eq!(err.args[2], "halted");
    }

    #[test]
    fn test_concurrent_op_rejected_with_in_flight_details() {
        let db = fresh_db();
        let mut vm = insert_vm(&db, PowerState::Running);
        let task = Ref::generate();
        vm.current_operations
            .insert(task.clone(), VmOperation::CleanShutdown);
        let err = check_vm_operation(&db, &vm, VmOperation::CleanReboot).unwrap_err();
        assert_eq!(err.code, codes::OTHER_OPERATION_IN_PROGRESS);
        assert_eq!(err.args[2], task.as_str());
        assert_eq!(err.args[3], "clean_shutdown");
    }

    #[test]
    fn test_snapshot_allowed_during_quiesced_snapshot() {
        let db = fresh_db();
        let mut vm = insert_vm(&db, PowerState::Running);
        vm.current_operations
            .insert(Ref::generate(), VmOperation::SnapshotWithQuiesce);
        assert!(check_vm_operation(&db, &vm, VmOperation::Snapshot).is_ok());
    }

    #[test]
    fn test_hard_shutdown_never_concurrent_with_itself() {
        let db = fresh_db();
        let mut vm = insert_vm(&db, PowerState::Running);
        vm.current_operations
            .insert(Ref::generate(), VmOperation::HardShutdown);
        let err = check_vm_operation(&db, &vm, VmOperation::HardShutdown).unwrap_err();
        assert_eq!(err.code, codes::OTHER_OPERATION_IN_PROGRESS);
    }

    #[test]
    fn test_template_whitelist() {
        let db = fresh_db();
        let mut vm = insert_vm(&db, PowerState::Halted);
        vm.is_a_template = true;
        assert!(check_vm_operation(&db, &vm, VmOperation::Clone).is_ok());
        assert!(check_vm_operation(&db, &vm, VmOperation::Provision).is_ok());
        let err = check_vm_operation(&db, &vm, VmOperation::Start).unwrap_err();
        assert_eq!(err.code, codes::VM_IS_TEMPLATE);
    }

    #[test]
    fn test_snapshot_whitelist_and_revert() {
        let db = fresh_db();
        let mut vm = insert_vm(&db, PowerState::Halted);
        vm.is_a_snapshot = true;
        vm.is_a_template = true;
        assert!(check_vm_operation(&db, &vm, VmOperation::Revert).is_ok());
        let err = check_vm_operation(&db, &vm, VmOperation::Provision).unwrap_err();
        assert_eq!(err.code, codes::VM_IS_SNAPSHOT);

        // Revert on a non-snapshot is refused
        let plain = insert_vm(&db, PowerState::Halted);
        let err = check_vm_operation(&db, &plain, VmOperation::Revert).unwrap_err();
        assert_eq!(err.code, codes::OPERATION_NOT_ALLOWED);
    }

    #[test]
    fn test_nested_virt_blocks_ballooning_but_not_start() {
        let db = fresh_db();
        let mut vm = insert_vm(&db, PowerState::Halted);
        vm.platform
            .insert("nested-virt".to_string(), "true".to_string());
        assert!(check_vm_operation(&db, &vm, VmOperation::Start).is_ok());
        let err = check_vm_operation(&db, &vm, VmOperation::ChangingDynamicRange).unwrap_err();
        assert_eq!(err.code, codes::VM_IS_IMMOBILE);
        // The force path skips the mobility rule
        assert!(
            check_vm_operation_strictness(&db, &vm, VmOperation::ChangingDynamicRange, false)
                .is_ok()
        );
    }

    #[test]
    fn test_immobile_vm_cannot_migrate() {
        let db = fresh_db();
        let mut vm = insert_vm(&db, PowerState::Running);
        vm.platform
            .insert("nomigrate".to_string(), "true".to_string());
        let err = check_vm_operation(&db, &vm, VmOperation::PoolMigrate).unwrap_err();
        assert_eq!(err.code, codes::VM_IS_IMMOBILE);
    }

    #[test]
    fn test_control_domain_whitelist() {
        let db = fresh_db();
        let mut vm = insert_vm(&db, PowerState::Running);
        vm.is_control_domain = true;
        assert!(check_vm_operation(&db, &vm, VmOperation::DataSourceOp).is_ok());
        let err = check_vm_operation(&db, &vm, VmOperation::CleanShutdown).unwrap_err();
        assert_eq!(err.code, codes::OPERATION_NOT_ALLOWED);
    }

    #[test]
    fn test_hvm_guest_lacking_feature() {
        let db = fresh_db();
        let mut vm = insert_vm(&db, PowerState::Running);
        vm.domain_type = DomainType::Hvm;
        let err = check_vm_operation(&db, &vm, VmOperation::CleanShutdown).unwrap_err();
        assert_eq!(err.code, codes::VM_LACKS_FEATURE);
        assert_eq!(err.args[1], "feature-shutdown");

        // With the feature reported the operation clears
        let guest_ref = Ref::generate();
        db.vm_guest_metrics
            .insert(VmGuestMetricsRecord {
                reference: guest_ref.clone(),
                uuid: Uuid::new_v4(),
                vm: vm.reference.clone(),
                os_version: Default::default(),
                networks: Default::default(),
                other: [("feature-shutdown".to_string(), "1".to_string())]
                    .into_iter()
                    .collect(),
                last_updated: chrono::Utc::now(),
            })
            .unwrap();
        vm.guest_metrics = guest_ref;
        assert!(check_vm_operation(&db, &vm, VmOperation::CleanShutdown).is_ok());
    }

    #[test]
    fn test_cant_suspend_reason() {
        let db = fresh_db();
        let mut vm = insert_vm(&db, PowerState::Running);
        let guest_ref = Ref::generate();
        db.vm_guest_metrics
            .insert(VmGuestMetricsRecord {
                reference: guest_ref.clone(),
                uuid: Uuid::new_v4(),
                vm: vm.reference.clone(),
                os_version: Default::default(),
                networks: Default::default(),
                other: [(
                    "data-cant-suspend-reason".to_string(),
                    "device busy".to_string(),
                )]
                .into_iter()
                .collect(),
                last_updated: chrono::Utc::now(),
            })
            .unwrap();
        vm.guest_metrics = guest_ref;
        let err = check_vm_operation(&db, &vm, VmOperation::Suspend).unwrap_err();
        assert_eq!(err.code, codes::VM_NON_SUSPENDABLE);
        assert_eq!(err.args[1], "device busy");
    }

    #[test]
    fn test_pci_blocks_suspend() {
        let db = fresh_db();
        let mut vm = insert_vm(&db, PowerState::Running);
        vm.attached_pcis.push(Ref::generate());
        let err = check_vm_operation(&db, &vm, VmOperation::Suspend).unwrap_err();
        assert_eq!(err.code, codes::VM_HAS_PCI_ATTACHED);
    }

    #[test]
    fn test_nvidia_vgpu_with_migration_feature_may_move() {
        let db = fresh_db();
        let mut vm = insert_vm(&db, PowerState::Running);

        let pgpu_ref = Ref::generate();
        db.pgpus
            .insert(PgpuRecord {
                reference: pgpu_ref.clone(),
                uuid: Uuid::new_v4(),
                host: Ref::null(),
                pci: Ref::null(),
                compatibility_metadata: [(PGPU_MIGRATION_KEY.to_string(), "true".to_string())]
                    .into_iter()
                    .collect(),
            })
            .unwrap();
        let vgpu_ref = Ref::generate();
        db.vgpus
            .insert(VgpuRecord {
                reference: vgpu_ref.clone(),
                uuid: Uuid::new_v4(),
                vm: vm.reference.clone(),
                pgpu: pgpu_ref.clone(),
                device: "0".to_string(),
                implementation: VgpuImplementation::Nvidia,
                currently_attached: true,
            })
            .unwrap();
        vm.vgpus.push(vgpu_ref.clone());
        assert!(check_vm_operation(&db, &vm, VmOperation::PoolMigrate).is_ok());

        // Passthrough implementations never move
        db.vgpus
            .update(&vgpu_ref, |v| {
                v.implementation = VgpuImplementation::Passthrough
            })
            .unwrap();
        let err = check_vm_operation(&db, &vm, VmOperation::PoolMigrate).unwrap_err();
        assert_eq!(err.code, codes::VM_HAS_VGPU);
    }

    #[test]
    fn test_vtpm_count_limit() {
        let db = fresh_db();
        let mut vm = insert_vm(&db, PowerState::Halted);
        assert!(check_vm_operation(&db, &vm, VmOperation::CreateVtpm).is_ok());
        vm.vtpms.push(Ref::generate());
        let err = check_vm_operation(&db, &vm, VmOperation::CreateVtpm).unwrap_err();
        assert_eq!(err.code, codes::VTPM_MAX_AMOUNT_REACHED);
    }

    #[test]
    fn test_rpu_allowlist() {
        let db = fresh_db();
        let mut pool = PoolRecord {
            reference: Ref::generate(),
            uuid: Uuid::new_v4(),
            ..Default::default()
        };
        pool.other_config
            .insert(ROLLING_UPGRADE_IN_PROGRESS.to_string(), "true".to_string());
        db.pools.insert(pool).unwrap();

        let vm = insert_vm(&db, PowerState::Running);
        // Snapshot is fine outside an upgrade but barred during one
        let err = check_vm_operation(&db, &vm, VmOperation::Snapshot).unwrap_err();
        assert_eq!(err.code, codes::NOT_SUPPORTED_DURING_UPGRADE);
        assert!(check_vm_operation(&db, &vm, VmOperation::CleanShutdown).is_ok());
    }

    #[test]
    fn test_update_allowed_operations_cache() {
        let db = fresh_db();
        let vm = insert_vm(&db, PowerState::Halted);
        update_vm_allowed_operations(&db, &vm.reference);
        let allowed = db.vms.get(&vm.reference).unwrap().allowed_operations;
        assert!(allowed.contains(&VmOperation::Start));
        assert!(!allowed.contains(&VmOperation::CleanShutdown));

        // Every advertised operation passes a fresh check
        let vm = db.vms.get(&vm.reference).unwrap();
        for op in &allowed {
            assert!(check_vm_operation(&db, &vm, *op).is_ok());
        }
    }
}
