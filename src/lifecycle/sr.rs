//! SR Lifecycle Operations
//!
//! Repository introduce/forget/destroy, metadata setters, and the scan:
//! globally throttled, single-flight per repository, reconciling the
//! database against the backend's view with a three-way merge.

use std::collections::{BTreeSet, HashMap};

use uuid::Uuid;

use crate::allowed;
use crate::api_error::{ApiError, ApiResult};
use crate::context::Context;
use crate::db::models::*;
use crate::storage::SmVdiInfo;
use crate::throttle::ScanCallback;

use super::{run_sr_operation, vdi::introduce_record, with_task};

/// Adopt a repository the backend knows, reading its stats and capabilities
pub fn introduce(
    ctx: &Context,
    sr_uuid: Uuid,
    name_label: &str,
    sr_type: &str,
    content_type: &str,
    shared: bool,
) -> ApiResult<Ref> {
    with_task(ctx, "SR.introduce", None, true, |_task| {
        let stat = ctx
            .storage
            .sr_stat(ctx.xenops.dbg(), &sr_uuid.to_string())
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        let sr = SrRecord {
            reference: Ref::generate(),
            uuid: sr_uuid,
            name_label: name_label.to_string(),
            name_description: stat.name_description.clone(),
            sr_type: sr_type.to_string(),
            content_type: content_type.to_string(),
            pbds: Vec::new(),
            vdis: Vec::new(),
            physical_size: stat.physical_size,
            physical_utilisation: stat.physical_utilisation,
            virtual_allocation: stat.virtual_allocation,
            shared,
            clustered: stat.clustered,
            is_tools_sr: false,
            capabilities: stat.capabilities.clone(),
            sm_config: Default::default(),
            other_config: Default::default(),
            current_operations: Default::default(),
            allowed_operations: Vec::new(),
        };
        let sr_ref = sr.reference.clone();
        ctx.db
            .srs
            .insert(sr)
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        allowed::update_sr_allowed_operations(&ctx.db, &sr_ref);
        Ok(sr_ref)
    })
}

/// Bind the repository to a host
pub fn pbd_create(
    ctx: &Context,
    sr_ref: &Ref,
    host_ref: &Ref,
    device_config: HashMap<String, String>,
) -> ApiResult<Ref> {
    with_task(ctx, "PBD.create", None, true, |_task| {
        if !ctx.db.srs.contains(sr_ref) {
            return Err(ApiError::handle_invalid("SR", sr_ref.as_str()));
        }
        if !ctx.db.hosts.contains(host_ref) {
            return Err(ApiError::handle_invalid("host", host_ref.as_str()));
        }
        let pbd = PbdRecord {
            reference: Ref::generate(),
            uuid: Uuid::new_v4(),
            sr: sr_ref.clone(),
            host: host_ref.clone(),
            device_config,
            currently_attached: false,
            other_config: Default::default(),
        };
        let pbd_ref = pbd.reference.clone();
        ctx.db
            .pbds
            .insert(pbd)
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        let _ = ctx.db.srs.update(sr_ref, |sr| sr.pbds.push(pbd_ref.clone()));
        let _ = ctx
            .db
            .hosts
            .update(host_ref, |host| host.pbds.push(pbd_ref.clone()));
        Ok(pbd_ref)
    })
}

pub fn pbd_plug(ctx: &Context, pbd_ref: &Ref) -> ApiResult<()> {
    with_task(ctx, "PBD.plug", None, true, |_task| {
        let pbd = ctx
            .db
            .pbds
            .try_get(pbd_ref)
            .ok_or_else(|| ApiError::handle_invalid("PBD", pbd_ref.as_str()))?;
        let _ = ctx
            .db
            .pbds
            .update(pbd_ref, |pbd| pbd.currently_attached = true);
        allowed::update_sr_allowed_operations(&ctx.db, &pbd.sr);
        Ok(())
    })
}

pub fn pbd_unplug(ctx: &Context, pbd_ref: &Ref) -> ApiResult<()> {
    with_task(ctx, "PBD.unplug", None, true, |_task| {
        let pbd = ctx
            .db
            .pbds
            .try_get(pbd_ref)
            .ok_or_else(|| ApiError::handle_invalid("PBD", pbd_ref.as_str()))?;
        let _ = ctx
            .db
            .pbds
            .update(pbd_ref, |pbd| pbd.currently_attached = false);
        allowed::update_sr_allowed_operations(&ctx.db, &pbd.sr);
        Ok(())
    })
}

/// Remove the repository and its contents from the database. The admission
/// chain has already established it is detached, empty of managed disks,
/// destructible, and not a cache.
pub fn destroy(ctx: &Context, sr_ref: &Ref) -> ApiResult<()> {
    run_sr_operation(ctx, sr_ref, SrOperation::Destroy, "SR.destroy", None, |_task| {
        remove_sr_rows(ctx, sr_ref)
    })
}

/// Drop the records, leaving the backend untouched
pub fn forget(ctx: &Context, sr_ref: &Ref) -> ApiResult<()> {
    run_sr_operation(ctx, sr_ref, SrOperation::Forget, "SR.forget", None, |_task| {
        remove_sr_rows(ctx, sr_ref)
    })
}

fn remove_sr_rows(ctx: &Context, sr_ref: &Ref) -> ApiResult<()> {
    let sr = ctx
        .db
        .srs
        .get(sr_ref)
        .map_err(|e| ApiError::internal_error(e.to_string()))?;
    for vdi_ref in &sr.vdis {
        let _ = ctx.db.vdis.remove(vdi_ref);
    }
    for pbd_ref in &sr.pbds {
        if let Some(pbd) = ctx.db.pbds.try_get(pbd_ref) {
            let _ = ctx.db.hosts.update(&pbd.host, |host| {
                host.pbds.retain(|p| p != pbd_ref);
            });
        }
        let _ = ctx.db.pbds.remove(pbd_ref);
    }
    ctx.db
        .srs
        .remove(sr_ref)
        .map_err(|e| ApiError::internal_error(e.to_string()))?;
    Ok(())
}

pub fn set_name_label(ctx: &Context, sr_ref: &Ref, label: &str) -> ApiResult<()> {
    with_task(ctx, "SR.set_name_label", None, true, |_task| {
        let sr = ctx
            .db
            .srs
            .get(sr_ref)
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        ctx.storage
            .sr_set_name_label(ctx.xenops.dbg(), &sr.uuid.to_string(), label)
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        let _ = ctx
            .db
            .srs
            .update(sr_ref, |sr| sr.name_label = label.to_string());
        Ok(())
    })
}

pub fn set_name_description(ctx: &Context, sr_ref: &Ref, description: &str) -> ApiResult<()> {
    with_task(ctx, "SR.set_name_description", None, true, |_task| {
        let sr = ctx
            .db
            .srs
            .get(sr_ref)
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        ctx.storage
            .sr_set_name_description(ctx.xenops.dbg(), &sr.uuid.to_string(), description)
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        let _ = ctx
            .db
            .srs
            .update(sr_ref, |sr| sr.name_description = description.to_string());
        Ok(())
    })
}

/// Repositories the backend can see for the given configuration
pub fn probe(ctx: &Context, device_config: &HashMap<String, String>) -> ApiResult<Vec<String>> {
    ctx.storage
        .sr_probe(ctx.xenops.dbg(), device_config)
        .map_err(|e| ApiError::internal_error(e.to_string()))
}

/// Refresh repository-level stats from the backend
pub fn update(ctx: &Context, sr_ref: &Ref) -> ApiResult<()> {
    run_sr_operation(ctx, sr_ref, SrOperation::Update, "SR.update", None, |_task| {
        let sr = ctx
            .db
            .srs
            .get(sr_ref)
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        let stat = ctx
            .storage
            .sr_stat(ctx.xenops.dbg(), &sr.uuid.to_string())
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        let _ = ctx.db.srs.update(sr_ref, |sr| {
            sr.physical_size = stat.physical_size;
            sr.physical_utilisation = stat.physical_utilisation;
            sr.virtual_allocation = stat.virtual_allocation;
            sr.clustered = stat.clustered;
            sr.capabilities = stat.capabilities.clone();
        });
        Ok(())
    })
}

/// Scan the repository, reconciling database rows with the backend's view.
/// At most one scan runs per repository; a scan requested while one is in
/// flight queues its callback on the running scan and returns immediately.
pub fn scan(ctx: &Context, sr_ref: &Ref) -> ApiResult<()> {
    scan_with_callback(ctx, sr_ref, None)
}

pub fn scan_with_callback(
    ctx: &Context,
    sr_ref: &Ref,
    on_complete: Option<ScanCallback>,
) -> ApiResult<()> {
    if !ctx.scan_gate.begin(sr_ref, on_complete) {
        log::debug!("scan of {} already in flight", sr_ref);
        return Ok(());
    }
    let result = run_sr_operation(ctx, sr_ref, SrOperation::Scan, "SR.scan", None, |_task| {
        scan_body(ctx, sr_ref)
    });
    let callbacks = ctx.scan_gate.end(sr_ref);
    for callback in callbacks {
        callback();
    }
    result
}

fn vdi_refs_of(ctx: &Context, sr_ref: &Ref) -> Option<BTreeSet<Ref>> {
    ctx.db
        .srs
        .try_get(sr_ref)
        .map(|sr| sr.vdis.into_iter().collect())
}

fn scan_body(ctx: &Context, sr_ref: &Ref) -> ApiResult<()> {
    let retry_limit = ctx.config.scan_retry_limit.max(1);
    for attempt in 0..retry_limit {
        let sr = ctx
            .db
            .srs
            .get(sr_ref)
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        let before = vdi_refs_of(ctx, sr_ref)
            .ok_or_else(|| ApiError::handle_invalid("SR", sr_ref.as_str()))?;

        let sr_uuid = sr.uuid.to_string();
        let reported = ctx
            .storage
            .sr_scan(ctx.xenops.dbg(), &sr_uuid)
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        let stat = ctx
            .storage
            .sr_stat(ctx.xenops.dbg(), &sr_uuid)
            .map_err(|e| ApiError::internal_error(e.to_string()))?;

        // A concurrent create or destroy changed the set under us; the
        // merge would delete rows it never saw, so go around again
        let after = vdi_refs_of(ctx, sr_ref)
            .ok_or_else(|| ApiError::handle_invalid("SR", sr_ref.as_str()))?;
        if before != after {
            log::debug!(
                "database changed under scan of {} (attempt {}), retrying",
                sr_ref,
                attempt + 1
            );
            continue;
        }

        merge(ctx, &sr, &reported)?;
        let _ = ctx.db.srs.update(sr_ref, |sr| {
            sr.physical_size = stat.physical_size;
            sr.physical_utilisation = stat.physical_utilisation;
            sr.virtual_allocation = stat.virtual_allocation;
        });
        return Ok(());
    }
    Err(ApiError::internal_error(format!(
        "scan of {} kept racing with database changes",
        sr_ref
    )))
}

/// Three-way merge keyed by (sr, location): introduce new disks, forget
/// disappeared ones, update fields on survivors
fn merge(ctx: &Context, sr: &SrRecord, reported: &[SmVdiInfo]) -> ApiResult<()> {
    let by_location: HashMap<&str, &SmVdiInfo> =
        reported.iter().map(|info| (info.location.as_str(), info)).collect();

    let mut known: HashMap<String, VdiRecord> = HashMap::new();
    for vdi_ref in &sr.vdis {
        if let Some(vdi) = ctx.db.vdis.try_get(vdi_ref) {
            known.insert(vdi.location.clone(), vdi);
        }
    }

    // Disappeared from the backend: forget
    for (location, vdi) in &known {
        if !by_location.contains_key(location.as_str()) {
            log::info!("scan: forgetting {} (gone from backend)", vdi.reference);
            let _ = ctx.db.srs.update(&sr.reference, |sr| {
                sr.vdis.retain(|v| v != &vdi.reference);
            });
            for vbd_ref in &vdi.vbds {
                let _ = ctx.db.vbds.update(vbd_ref, |vbd| {
                    vbd.vdi = Ref::null();
                    vbd.empty = true;
                });
            }
            let _ = ctx.db.vdis.remove(&vdi.reference);
        }
    }

    for info in reported {
        match known.get(&info.location) {
            None => {
                // New on the backend: introduce
                log::info!("scan: introducing {} from backend", info.location);
                introduce_record(ctx, sr, info)?;
            }
            Some(vdi) => {
                // Known on both sides: update fields that drifted
                let drifted = vdi.virtual_size != info.virtual_size
                    || vdi.physical_utilisation != info.physical_utilisation
                    || vdi.read_only != info.read_only
                    || vdi.sharable != info.sharable
                    || vdi.cbt_enabled != info.cbt_enabled
                    || vdi.vdi_type != info.vdi_type;
                if drifted {
                    let _ = ctx.db.vdis.update(&vdi.reference, |vdi| {
                        vdi.virtual_size = info.virtual_size;
                        vdi.physical_utilisation = info.physical_utilisation;
                        vdi.read_only = info.read_only;
                        vdi.sharable = info.sharable;
                        vdi.cbt_enabled = info.cbt_enabled;
                        vdi.vdi_type = info.vdi_type;
                    });
                    allowed::update_vdi_allowed_operations(&ctx.db, &vdi.reference);
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::vdi as vdi_ops;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn setup() -> (Arc<Context>, Arc<crate::storage::sim::SimStorage>, Ref, String) {
        let (ctx, _xenops, storage) = Context::sim();
        let sr_uuid = Uuid::new_v4();
        storage.add_sr(&sr_uuid.to_string());
        let sr_ref = introduce(&ctx, sr_uuid, "store", "ext", "user", false).unwrap();
        (ctx, storage, sr_ref, sr_uuid.to_string())
    }

    #[test]
    fn test_scan_three_way_merge() {
        let (ctx, storage, sr_ref, sr_uuid) = setup();

        // A: known to the database, gone from the backend
        let a = vdi_ops::create(&ctx, &sr_ref, "a", 1 << 30, VdiType::User).unwrap();
        let a_location = ctx.db.vdis.get(&a).unwrap().location.clone();
        storage.lose_vdi(&sr_uuid, &a_location);
        // B: known to both, with drifted fields
        let b = vdi_ops::create(&ctx, &sr_ref, "b", 1 << 30, VdiType::User).unwrap();
        let b_location = ctx.db.vdis.get(&b).unwrap().location.clone();
        storage.plant_vdi(
            &sr_uuid,
            SmVdiInfo {
                location: b_location.clone(),
                name_label: "b".to_string(),
                name_description: String::new(),
                vdi_type: VdiType::User,
                virtual_size: 4 << 30,
                physical_utilisation: 1 << 20,
                read_only: false,
                sharable: false,
                cbt_enabled: false,
                is_a_snapshot: false,
                snapshot_of: None,
                sm_config: Default::default(),
            },
        );
        // C: known only to the backend
        storage.plant_vdi(
            &sr_uuid,
            SmVdiInfo {
                location: "c-location".to_string(),
                name_label: "c".to_string(),
                name_description: String::new(),
                vdi_type: VdiType::User,
                virtual_size: 2 << 30,
                physical_utilisation: 0,
                read_only: false,
                sharable: false,
                cbt_enabled: false,
                is_a_snapshot: false,
                snapshot_of: None,
                sm_config: Default::default(),
            },
        );

        scan(&ctx, &sr_ref).unwrap();

        assert!(ctx.db.vdis.try_get(&a).is_none());
        assert_eq!(ctx.db.vdis.get(&b).unwrap().virtual_size, 4 << 30);
        let locations: BTreeSet<String> = ctx
            .db
            .srs
            .get(&sr_ref)
            .unwrap()
            .vdis
            .iter()
            .filter_map(|v| ctx.db.vdis.try_get(v))
            .map(|v| v.location)
            .collect();
        assert!(locations.contains(&b_location));
        assert!(locations.contains("c-location"));
        assert_eq!(locations.len(), 2);
    }

    #[test]
    fn test_scan_idempotent_on_quiescent_sr() {
        let (ctx, _storage, sr_ref, _sr_uuid) = setup();
        vdi_ops::create(&ctx, &sr_ref, "stable", 1 << 30, VdiType::User).unwrap();

        scan(&ctx, &sr_ref).unwrap();
        let first: Vec<VdiRecord> = {
            let mut vdis: Vec<VdiRecord> = ctx
                .db
                .srs
                .get(&sr_ref)
                .unwrap()
                .vdis
                .iter()
                .filter_map(|v| ctx.db.vdis.try_get(v))
                .collect();
            vdis.sort_by(|x, y| x.location.cmp(&y.location));
            vdis
        };
        scan(&ctx, &sr_ref).unwrap();
        let second: Vec<VdiRecord> = {
            let mut vdis: Vec<VdiRecord> = ctx
                .db
                .srs
                .get(&sr_ref)
                .unwrap()
                .vdis
                .iter()
                .filter_map(|v| ctx.db.vdis.try_get(v))
                .collect();
            vdis.sort_by(|x, y| x.location.cmp(&y.location));
            vdis
        };

        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.reference, b.reference);
            assert_eq!(a.location, b.location);
            assert_eq!(a.virtual_size, b.virtual_size);
        }
    }

    #[test]
    fn test_concurrent_scan_queues_callback() {
        let (ctx, _storage, sr_ref, _sr_uuid) = setup();
        let fired = Arc::new(AtomicUsize::new(0));

        // Hold the gate as a running scan would
        assert!(ctx.scan_gate.begin(&sr_ref, None));
        let fired2 = fired.clone();
        scan_with_callback(
            &ctx,
            &sr_ref,
            Some(Box::new(move || {
                fired2.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        for callback in ctx.scan_gate.end(&sr_ref) {
            callback();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_destroy_empty_sr() {
        let (ctx, _storage, sr_ref, _sr_uuid) = setup();
        destroy(&ctx, &sr_ref).unwrap();
        assert!(ctx.db.srs.try_get(&sr_ref).is_none());
    }
}
