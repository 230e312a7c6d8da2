//! SR Operation Admission
//!
//! The indestructible flag is checked before anything else so its error is
//! reported regardless of attachment or content state.

use crate::api_error::{codes, ApiError, ApiResult};
use crate::db::models::*;
use crate::db::Database;

pub const ALL_SR_OPERATIONS: &[SrOperation] = &[
    SrOperation::Scan,
    SrOperation::Probe,
    SrOperation::Destroy,
    SrOperation::Forget,
    SrOperation::Update,
    SrOperation::PlugPbd,
    SrOperation::UnplugPbd,
    SrOperation::VdiCreate,
    SrOperation::VdiDestroy,
    SrOperation::VdiClone,
    SrOperation::VdiSnapshot,
    SrOperation::VdiResize,
    SrOperation::VdiIntroduce,
];

/// Scans are serialised by the scan gate, not refused; PBD plugs on
/// different hosts proceed in parallel
fn allowed_concurrently(op: SrOperation, in_flight: SrOperation) -> bool {
    match (op, in_flight) {
        (SrOperation::Scan, SrOperation::Scan) => true,
        (SrOperation::PlugPbd, SrOperation::PlugPbd) => true,
        // Disk-level work does not block unrelated disk-level work
        (a, b) if is_vdi_sub_op(a) && is_vdi_sub_op(b) => true,
        (SrOperation::Scan, b) if is_vdi_sub_op(b) => true,
        (a, SrOperation::Scan) if is_vdi_sub_op(a) => true,
        _ => false,
    }
}

fn is_vdi_sub_op(op: SrOperation) -> bool {
    matches!(
        op,
        SrOperation::VdiCreate
            | SrOperation::VdiDestroy
            | SrOperation::VdiClone
            | SrOperation::VdiSnapshot
            | SrOperation::VdiResize
            | SrOperation::VdiIntroduce
            | SrOperation::VdiMirror
            | SrOperation::VdiEnableCbt
            | SrOperation::VdiDisableCbt
            | SrOperation::VdiDataDestroy
            | SrOperation::VdiListChangedBlocks
    )
}

fn required_capability(op: SrOperation) -> Option<SmCapability> {
    match op {
        SrOperation::Scan => Some(SmCapability::SrScan),
        SrOperation::Probe => Some(SmCapability::SrProbe),
        SrOperation::Update => Some(SmCapability::SrUpdate),
        SrOperation::VdiCreate => Some(SmCapability::VdiCreate),
        SrOperation::VdiDestroy => Some(SmCapability::VdiDelete),
        SrOperation::VdiSnapshot => Some(SmCapability::VdiSnapshot),
        SrOperation::VdiResize => Some(SmCapability::VdiResize),
        SrOperation::VdiMirror => Some(SmCapability::VdiMirror),
        SrOperation::VdiIntroduce => Some(SmCapability::VdiIntroduce),
        SrOperation::VdiEnableCbt | SrOperation::VdiDisableCbt => Some(SmCapability::VdiEnableCbt),
        SrOperation::VdiDataDestroy => Some(SmCapability::VdiDataDestroy),
        SrOperation::VdiListChangedBlocks => Some(SmCapability::VdiListChangedBlocks),
        _ => None,
    }
}

pub fn check_sr_operation(db: &Database, sr: &SrRecord, op: SrOperation) -> ApiResult<()> {
    let reference = sr.reference.as_str();

    // The indestructible marker wins over everything
    if op == SrOperation::Destroy && sr.is_indestructible() {
        return Err(ApiError::new(
            codes::SR_INDESTRUCTIBLE,
            vec![reference.to_string()],
        ));
    }

    // Concurrent-operations policy
    for (task, in_flight) in &sr.current_operations {
        if !allowed_concurrently(op, *in_flight) {
            return Err(ApiError::other_operation_in_progress(
                "SR",
                reference,
                task.as_str(),
                in_flight.as_str(),
            ));
        }
    }

    if matches!(op, SrOperation::Destroy | SrOperation::Forget) {
        // An attached binding means a host still uses the repository
        for pbd_ref in &sr.pbds {
            if let Some(pbd) = db.pbds.try_get(pbd_ref) {
                if pbd.currently_attached {
                    return Err(ApiError::new(
                        codes::SR_HAS_PBD,
                        vec![reference.to_string(), pbd.reference.as_str().to_string()],
                    ));
                }
            }
        }
    }

    if op == SrOperation::Destroy {
        // Managed disks (the RRD store excepted) must be gone first
        for vdi_ref in &sr.vdis {
            if let Some(vdi) = db.vdis.try_get(vdi_ref) {
                if vdi.managed && vdi.vdi_type != VdiType::Rrd {
                    return Err(ApiError::new(
                        codes::SR_NOT_EMPTY,
                        vec![reference.to_string()],
                    ));
                }
            }
        }
        // A host's local cache cannot be pulled out from under it
        for host in db.hosts.list() {
            if host.local_cache_sr == sr.reference {
                return Err(ApiError::new(
                    codes::SR_IS_CACHE_SR,
                    vec![host.reference.as_str().to_string()],
                ));
            }
        }
    }

    if let Some(capability) = required_capability(op) {
        if !sr.has_capability(capability) {
            return Err(ApiError::new(
                codes::SR_OPERATION_NOT_SUPPORTED,
                vec![reference.to_string()],
            ));
        }
    }

    Ok(())
}

pub fn assert_sr_operation_valid(db: &Database, sr_ref: &Ref, op: SrOperation) -> ApiResult<()> {
    let sr = db
        .srs
        .try_get(sr_ref)
        .ok_or_else(|| ApiError::handle_invalid("SR", sr_ref.as_str()))?;
    check_sr_operation(db, &sr, op)
}

pub fn update_sr_allowed_operations(db: &Database, sr_ref: &Ref) {
    let Some(sr) = db.srs.try_get(sr_ref) else {
        return;
    };
    let allowed: Vec<SrOperation> = ALL_SR_OPERATIONS
        .iter()
        .copied()
        .filter(|op| check_sr_operation(db, &sr, *op).is_ok())
        .collect();
    if allowed != sr.allowed_operations {
        let _ = db.srs.update(sr_ref, |sr| sr.allowed_operations = allowed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use std::sync::Arc;
    use uuid::Uuid;

    fn setup() -> (Database, SrRecord) {
        let db = Database::new(Arc::new(EventBus::default()));
        let sr = SrRecord {
            reference: Ref::generate(),
            uuid: Uuid::new_v4(),
            name_label: "shared".to_string(),
            name_description: String::new(),
            sr_type: "nfs".to_string(),
            content_type: "user".to_string(),
            pbds: Vec::new(),
            vdis: Vec::new(),
            physical_size: 1 << 40,
            physical_utilisation: 0,
            virtual_allocation: 0,
            shared: true,
            clustered: false,
            is_tools_sr: false,
            capabilities: vec![
                SmCapability::SrScan,
                SmCapability::SrProbe,
                SmCapability::SrUpdate,
                SmCapability::VdiCreate,
                SmCapability::VdiDelete,
                SmCapability::VdiClone,
                SmCapability::VdiSnapshot,
                SmCapability::VdiResize,
                SmCapability::VdiIntroduce,
            ],
            sm_config: Default::default(),
            other_config: Default::default(),
            current_operations: Default::default(),
            allowed_operations: Vec::new(),
        };
        db.srs.insert(sr.clone()).unwrap();
        (db, sr)
    }

    fn add_pbd(db: &Database, sr: &mut SrRecord, attached: bool) {
        let pbd = PbdRecord {
            reference: Ref::generate(),
            uuid: Uuid::new_v4(),
            sr: sr.reference.clone(),
            host: Ref::generate(),
            device_config: Default::default(),
            currently_attached: attached,
            other_config: Default::default(),
        };
        sr.pbds.push(pbd.reference.clone());
        db.pbds.insert(pbd).unwrap();
        db.srs
            .update(&sr.reference, |record| record.pbds = sr.pbds.clone())
            .unwrap();
    }

    #[test]
    fn test_indestructible_beats_everything() {
        let (db, mut sr) = setup();
        sr.other_config
            .insert("indestructible".to_string(), "true".to_string());
        // Even with an attached PBD the indestructible error is reported
        add_pbd(&db, &mut sr, true);
        let err = check_sr_operation(&db, &sr, SrOperation::Destroy).unwrap_err();
        assert_eq!(err.code, codes::SR_INDESTRUCTIBLE);
    }

    #[test]
    fn test_attached_pbd_blocks_destroy_and_forget() {
        let (db, mut sr) = setup();
        add_pbd(&db, &mut sr, true);
        let err = check_sr_operation(&db, &sr, SrOperation::Destroy).unwrap_err();
        assert_eq!(err.code, codes::SR_HAS_PBD);
        let err = check_sr_operation(&db, &sr, SrOperation::Forget).unwrap_err();
        assert_eq!(err.code, codes::SR_HAS_PBD);
    }

    #[test]
    fn test_detached_pbd_allows_destroy() {
        let (db, mut sr) = setup();
        add_pbd(&db, &mut sr, false);
        assert!(check_sr_operation(&db, &sr, SrOperation::Destroy).is_ok());
    }

    #[test]
    fn test_managed_vdi_blocks_destroy() {
        let (db, mut sr) = setup();
        let vdi = VdiRecord {
            reference: Ref::generate(),
            uuid: Uuid::new_v4(),
            name_label: "v".to_string(),
            sr: sr.reference.clone(),
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
        sr.vdis.push(vdi.reference.clone());
        db.vdis.insert(vdi.clone()).unwrap();
        db.srs
            .update(&sr.reference, |record| record.vdis = sr.vdis.clone())
            .unwrap();

        let err = check_sr_operation(&db, &sr, SrOperation::Destroy).unwrap_err();
        assert_eq!(err.code, codes::SR_NOT_EMPTY);

        // The RRD store does not count as content
        db.vdis
            .update(&vdi.reference, |v| v.vdi_type = VdiType::Rrd)
            .unwrap();
        assert!(check_sr_operation(&db, &sr, SrOperation::Destroy).is_ok());
    }

    #[test]
    fn test_local_cache_sr_protected() {
        let (db, sr) = setup();
        db.hosts
            .insert(HostRecord {
                reference: Ref::generate(),
                uuid: Uuid::new_v4(),
                local_cache_sr: sr.reference.clone(),
                ..Default::default()
            })
            .unwrap();
        let err = check_sr_operation(&db, &sr, SrOperation::Destroy).unwrap_err();
        assert_eq!(err.code, codes::SR_IS_CACHE_SR);
    }

    #[test]
    fn test_capability_required() {
        let (db, mut sr) = setup();
        sr.capabilities.retain(|c| *c != SmCapability::SrScan);
        let err = check_sr_operation(&db, &sr, SrOperation::Scan).unwrap_err();
        assert_eq!(err.code, codes::SR_OPERATION_NOT_SUPPORTED);
    }

    #[test]
    fn test_scan_concurrent_with_scan() {
        let (db, mut sr) = setup();
        sr.current_operations
            .insert(Ref::generate(), SrOperation::Scan);
        assert!(check_sr_operation(&db, &sr, SrOperation::Scan).is_ok());
        let err = check_sr_operation(&db, &sr, SrOperation::Destroy).unwrap_err();
        assert_eq!(err.code, codes::OTHER_OPERATION_IN_PROGRESS);
    }
}
