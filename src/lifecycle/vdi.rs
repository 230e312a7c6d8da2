//! VDI Lifecycle Operations

use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::allowed;
use crate::api_error::{codes, ApiError, ApiResult};
use crate::context::Context;
use crate::db::models::*;
use crate::events::EventFilter;
use crate::storage::{SmError, SmVdiInfo};

use super::{run_sr_operation, run_vdi_operation};

/// Turn a backend report into a database row on the given repository
pub(crate) fn introduce_record(ctx: &Context, sr: &SrRecord, info: &SmVdiInfo) -> ApiResult<Ref> {
    let snapshot_of = info
        .snapshot_of
        .as_ref()
        .and_then(|location| {
            ctx.db
                .vdis
                .list()
                .into_iter()
                .find(|v| v.sr == sr.reference && &v.location == location)
        })
        .map(|v| v.reference)
        .unwrap_or_else(Ref::null);
    let vdi = VdiRecord {
        reference: Ref::generate(),
        uuid: Uuid::new_v4(),
        name_label: info.name_label.clone(),
        sr: sr.reference.clone(),
        vbds: Vec::new(),
        location: info.location.clone(),
        vdi_type: info.vdi_type,
        virtual_size: info.virtual_size,
        physical_utilisation: info.physical_utilisation,
        sharable: info.sharable,
        read_only: info.read_only,
        managed: true,
        missing: false,
        on_boot: OnBoot::Persist,
        allow_caching: false,
        cbt_enabled: info.cbt_enabled,
        is_a_snapshot: info.is_a_snapshot,
        snapshot_of,
        snapshot_time: if info.is_a_snapshot {
            Some(chrono::Utc::now())
        } else {
            None
        },
        metadata_of_pool: Ref::null(),
        is_tools_iso: false,
        current_operations: Default::default(),
        allowed_operations: Vec::new(),
        sm_config: info.sm_config.clone(),
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
    allowed::update_vdi_allowed_operations(&ctx.db, &vdi_ref);
    Ok(vdi_ref)
}

fn sr_of(ctx: &Context, vdi: &VdiRecord) -> ApiResult<SrRecord> {
    ctx.db
        .srs
        .try_get(&vdi.sr)
        .ok_or_else(|| ApiError::handle_invalid("SR", vdi.sr.as_str()))
}

/// Create a fresh disk on a repository
pub fn create(
    ctx: &Context,
    sr_ref: &Ref,
    name_label: &str,
    virtual_size: i64,
    vdi_type: VdiType,
) -> ApiResult<Ref> {
    run_sr_operation(ctx, sr_ref, SrOperation::VdiCreate, "VDI.create", None, |_task| {
        let sr = ctx
            .db
            .srs
            .get(sr_ref)
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        let info = ctx
            .storage
            .vdi_create(
                ctx.xenops.dbg(),
                &sr.uuid.to_string(),
                name_label,
                virtual_size,
                vdi_type,
            )
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        introduce_record(ctx, &sr, &info)
    })
}

/// Destroy data and record
pub fn destroy(ctx: &Context, vdi_ref: &Ref) -> ApiResult<()> {
    run_vdi_operation(ctx, vdi_ref, VdiOperation::Destroy, "VDI.destroy", None, |_task| {
        let vdi = ctx
            .db
            .vdis
            .get(vdi_ref)
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        let sr = sr_of(ctx, &vdi)?;
        ctx.storage
            .vdi_destroy(ctx.xenops.dbg(), &sr.uuid.to_string(), &vdi.location)
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        let _ = ctx.db.srs.update(&sr.reference, |sr| {
            sr.vdis.retain(|v| v != vdi_ref);
        });
        for vbd_ref in &vdi.vbds {
            let _ = ctx.db.vbds.update(vbd_ref, |vbd| {
                vbd.vdi = Ref::null();
                vbd.empty = true;
            });
        }
        ctx.db
            .vdis
            .remove(vdi_ref)
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        Ok(())
    })
}

/// Destroy only the data of a changed-block-tracked snapshot, leaving the
/// metadata stub behind for incremental backups.
///
/// The disk is tentatively retyped to cbt_metadata so no new VBD can link to
/// it, then the handler waits for the linked VBDs to be destroyed by
/// watching the row's events. On timeout the original type is restored and
/// the call fails with vdi_in_use.
pub fn data_destroy(ctx: &Context, vdi_ref: &Ref, timeout: Duration) -> ApiResult<()> {
    run_vdi_operation(
        ctx,
        vdi_ref,
        VdiOperation::DataDestroy,
        "VDI.data_destroy",
        None,
        |_task| {
            let vdi = ctx
                .db
                .vdis
                .get(vdi_ref)
                .map_err(|e| ApiError::internal_error(e.to_string()))?;
            if !vdi.cbt_enabled {
                return Err(ApiError::new(
                    codes::VDI_INCOMPATIBLE_TYPE,
                    vec![vdi_ref.as_str().to_string(), vdi.vdi_type.as_str().to_string()],
                ));
            }
            let sr = sr_of(ctx, &vdi)?;
            let original_type = vdi.vdi_type;
            let _ = ctx.db.vdis.update(vdi_ref, |vdi| {
                vdi.vdi_type = VdiType::CbtMetadata;
            });

            // Wait for teardown of every linked VBD
            let deadline = Instant::now() + timeout;
            let filter = EventFilter::object(Class::Vdi, vdi_ref.clone());
            let mut token = String::new();
            let drained = loop {
                match ctx.db.vdis.try_get(vdi_ref) {
                    Some(vdi) if vdi.vbds.is_empty() => break true,
                    Some(_) => {}
                    None => break false,
                }
                let now = Instant::now();
                if now >= deadline {
                    break false;
                }
                let wait = (deadline - now).min(Duration::from_millis(200));
                match ctx.bus.from(&filter, &token, wait) {
                    Ok(batch) => token = batch.token,
                    Err(_) => token = String::new(),
                }
            };
            if !drained {
                let _ = ctx.db.vdis.update(vdi_ref, |vdi| {
                    vdi.vdi_type = original_type;
                });
                return Err(ApiError::new(
                    codes::VDI_IN_USE,
                    vec![
                        vdi_ref.as_str().to_string(),
                        VdiOperation::DataDestroy.as_str().to_string(),
                    ],
                ));
            }

            ctx.storage
                .vdi_data_destroy(ctx.xenops.dbg(), &sr.uuid.to_string(), &vdi.location)
                .map_err(|e| ApiError::internal_error(e.to_string()))?;
            let _ = ctx.db.vdis.update(vdi_ref, |vdi| {
                vdi.vdi_type = VdiType::CbtMetadata;
                vdi.virtual_size = 0;
                vdi.physical_utilisation = 0;
            });
            Ok(())
        },
    )
}

/// Snapshot through the backend
pub fn snapshot(ctx: &Context, vdi_ref: &Ref) -> ApiResult<Ref> {
    run_vdi_operation(ctx, vdi_ref, VdiOperation::Snapshot, "VDI.snapshot", None, |_task| {
        let vdi = ctx
            .db
            .vdis
            .get(vdi_ref)
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        let sr = sr_of(ctx, &vdi)?;
        let info = ctx
            .storage
            .vdi_snapshot(ctx.xenops.dbg(), &sr.uuid.to_string(), &vdi.location)
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        introduce_record(ctx, &sr, &info)
    })
}

/// Clone through the backend, falling back to a block copy in the control
/// domain when the backend reports the operation unimplemented
pub fn clone_vdi(ctx: &Context, vdi_ref: &Ref) -> ApiResult<Ref> {
    run_vdi_operation(ctx, vdi_ref, VdiOperation::Clone, "VDI.clone", None, |_task| {
        let vdi = ctx
            .db
            .vdis
            .get(vdi_ref)
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        let sr = sr_of(ctx, &vdi)?;
        let sr_uuid = sr.uuid.to_string();
        let info = match ctx
            .storage
            .vdi_clone(ctx.xenops.dbg(), &sr_uuid, &vdi.location)
        {
            Err(SmError::NotImplemented(_)) => {
                log::info!("backend cannot clone {}; copying instead", vdi_ref);
                ctx.storage
                    .vdi_copy(ctx.xenops.dbg(), &sr_uuid, &vdi.location)
            }
            other => other,
        }
        .map_err(|e| ApiError::internal_error(e.to_string()))?;
        introduce_record(ctx, &sr, &info)
    })
}

/// Full copy
pub fn copy(ctx: &Context, vdi_ref: &Ref) -> ApiResult<Ref> {
    run_vdi_operation(ctx, vdi_ref, VdiOperation::Copy, "VDI.copy", None, |_task| {
        let vdi = ctx
            .db
            .vdis
            .get(vdi_ref)
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        let sr = sr_of(ctx, &vdi)?;
        let info = ctx
            .storage
            .vdi_copy(ctx.xenops.dbg(), &sr.uuid.to_string(), &vdi.location)
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        introduce_record(ctx, &sr, &info)
    })
}

/// Grow a detached disk
pub fn resize(ctx: &Context, vdi_ref: &Ref, new_size: i64) -> ApiResult<()> {
    run_vdi_operation(ctx, vdi_ref, VdiOperation::Resize, "VDI.resize", None, |_task| {
        let vdi = ctx
            .db
            .vdis
            .get(vdi_ref)
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        let sr = sr_of(ctx, &vdi)?;
        let actual = ctx
            .storage
            .vdi_resize(ctx.xenops.dbg(), &sr.uuid.to_string(), &vdi.location, new_size)
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        let _ = ctx.db.vdis.update(vdi_ref, |vdi| vdi.virtual_size = actual);
        Ok(())
    })
}

/// Adopt a disk the backend already has
pub fn introduce(ctx: &Context, sr_ref: &Ref, location: &str) -> ApiResult<Ref> {
    run_sr_operation(
        ctx,
        sr_ref,
        SrOperation::VdiIntroduce,
        "VDI.introduce",
        None,
        |_task| {
            let sr = ctx
                .db
                .srs
                .get(sr_ref)
                .map_err(|e| ApiError::internal_error(e.to_string()))?;
            let info = ctx
                .storage
                .vdi_introduce(ctx.xenops.dbg(), &sr.uuid.to_string(), location)
                .map_err(|e| ApiError::internal_error(e.to_string()))?;
            introduce_record(ctx, &sr, &info)
        },
    )
}

/// Drop the record, leaving the data untouched
pub fn forget(ctx: &Context, vdi_ref: &Ref) -> ApiResult<()> {
    run_vdi_operation(ctx, vdi_ref, VdiOperation::Forget, "VDI.forget", None, |_task| {
        let vdi = ctx
            .db
            .vdis
            .get(vdi_ref)
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        let _ = ctx.db.srs.update(&vdi.sr, |sr| {
            sr.vdis.retain(|v| v != vdi_ref);
        });
        ctx.db
            .vdis
            .remove(vdi_ref)
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        Ok(())
    })
}

pub fn enable_cbt(ctx: &Context, vdi_ref: &Ref) -> ApiResult<()> {
    run_vdi_operation(ctx, vdi_ref, VdiOperation::EnableCbt, "VDI.enable_cbt", None, |_task| {
        let vdi = ctx
            .db
            .vdis
            .get(vdi_ref)
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        let sr = sr_of(ctx, &vdi)?;
        ctx.storage
            .vdi_enable_cbt(ctx.xenops.dbg(), &sr.uuid.to_string(), &vdi.location)
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        let _ = ctx.db.vdis.update(vdi_ref, |vdi| vdi.cbt_enabled = true);
        Ok(())
    })
}

pub fn disable_cbt(ctx: &Context, vdi_ref: &Ref) -> ApiResult<()> {
    run_vdi_operation(
        ctx,
        vdi_ref,
        VdiOperation::DisableCbt,
        "VDI.disable_cbt",
        None,
        |_task| {
            let vdi = ctx
                .db
                .vdis
                .get(vdi_ref)
                .map_err(|e| ApiError::internal_error(e.to_string()))?;
            let sr = sr_of(ctx, &vdi)?;
            ctx.storage
                .vdi_disable_cbt(ctx.xenops.dbg(), &sr.uuid.to_string(), &vdi.location)
                .map_err(|e| ApiError::internal_error(e.to_string()))?;
            let _ = ctx.db.vdis.update(vdi_ref, |vdi| vdi.cbt_enabled = false);
            Ok(())
        },
    )
}

/// Change the reset-on-boot behaviour
pub fn set_on_boot(ctx: &Context, vdi_ref: &Ref, on_boot: OnBoot) -> ApiResult<()> {
    run_vdi_operation(ctx, vdi_ref, VdiOperation::SetOnBoot, "VDI.set_on_boot", None, |_task| {
        let vdi = ctx
            .db
            .vdis
            .get(vdi_ref)
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        let sr = sr_of(ctx, &vdi)?;
        ctx.storage
            .vdi_set_persistent(
                ctx.xenops.dbg(),
                &sr.uuid.to_string(),
                &vdi.location,
                on_boot == OnBoot::Persist,
            )
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        let _ = ctx.db.vdis.update(vdi_ref, |vdi| vdi.on_boot = on_boot);
        Ok(())
    })
}

/// Bitmap of blocks that changed between two tracked disks
pub fn list_changed_blocks(ctx: &Context, base_ref: &Ref, target_ref: &Ref) -> ApiResult<String> {
    run_vdi_operation(
        ctx,
        target_ref,
        VdiOperation::ListChangedBlocks,
        "VDI.list_changed_blocks",
        None,
        |_task| {
            let base = ctx
                .db
                .vdis
                .try_get(base_ref)
                .ok_or_else(|| ApiError::handle_invalid("VDI", base_ref.as_str()))?;
            let target = ctx
                .db
                .vdis
                .get(target_ref)
                .map_err(|e| ApiError::internal_error(e.to_string()))?;
            let sr = sr_of(ctx, &target)?;
            ctx.storage
                .vdi_list_changed_blocks(
                    ctx.xenops.dbg(),
                    &sr.uuid.to_string(),
                    &base.location,
                    &target.location,
                )
                .map_err(|e| ApiError::internal_error(e.to_string()))
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sim::full_capabilities;
    use crate::storage::SmClient;
    use std::sync::Arc;
    use std::thread;

    fn setup() -> (
        Arc<Context>,
        Arc<crate::storage::sim::SimStorage>,
        Ref,
        String,
    ) {
        let (ctx, _xenops, storage) = Context::sim();
        let sr = SrRecord {
            reference: Ref::generate(),
            uuid: Uuid::new_v4(),
            name_label: "store".to_string(),
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
            capabilities: full_capabilities(),
            sm_config: Default::default(),
            other_config: Default::default(),
            current_operations: Default::default(),
            allowed_operations: Vec::new(),
        };
        let sr_ref = sr.reference.clone();
        let sr_uuid = sr.uuid.to_string();
        storage.add_sr(&sr_uuid);
        ctx.db.srs.insert(sr).unwrap();
        (ctx, storage, sr_ref, sr_uuid)
    }

    #[test]
    fn test_create_destroy_roundtrip() {
        let (ctx, storage, sr_ref, sr_uuid) = setup();
        let vdi_ref = create(&ctx, &sr_ref, "data", 1 << 30, VdiType::User).unwrap();
        assert!(ctx.db.srs.get(&sr_ref).unwrap().vdis.contains(&vdi_ref));
        assert_eq!(storage.sr_scan("dbg", &sr_uuid).unwrap().len(), 1);

        destroy(&ctx, &vdi_ref).unwrap();
        assert!(ctx.db.vdis.try_get(&vdi_ref).is_none());
        assert!(ctx.db.srs.get(&sr_ref).unwrap().vdis.is_empty());
        assert!(storage.sr_scan("dbg", &sr_uuid).unwrap().is_empty());
    }

    #[test]
    fn test_clone_falls_back_to_copy() {
        let (ctx, storage, sr_ref, _sr_uuid) = setup();
        let vdi_ref = create(&ctx, &sr_ref, "base", 1 << 30, VdiType::User).unwrap();
        storage
            .clone_unimplemented
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let clone_ref = clone_vdi(&ctx, &vdi_ref).unwrap();
        let clone = ctx.db.vdis.get(&clone_ref).unwrap();
        assert_eq!(clone.sm_config.get("copied").map(|s| s.as_str()), Some("true"));
    }

    #[test]
    fn test_data_destroy_waits_for_vbd_teardown() {
        let (ctx, _storage, sr_ref, _sr_uuid) = setup();
        let base = create(&ctx, &sr_ref, "tracked", 1 << 30, VdiType::User).unwrap();
        enable_cbt(&ctx, &base).unwrap();
        let snap_ref = snapshot(&ctx, &base).unwrap();
        ctx.db
            .vdis
            .update(&snap_ref, |vdi| vdi.cbt_enabled = true)
            .unwrap();

        // A VBD still references the snapshot
        let vm = VmRecord {
            reference: Ref::generate(),
            uuid: Uuid::new_v4(),
            ..Default::default()
        };
        let vbd = VbdRecord {
            reference: Ref::generate(),
            uuid: Uuid::new_v4(),
            vm: vm.reference.clone(),
            vdi: snap_ref.clone(),
            userdevice: "1".to_string(),
            mode: VbdMode::Ro,
            vbd_type: VbdType::Disk,
            bootable: false,
            empty: false,
            currently_attached: false,
            reserved: false,
            current_operations: Default::default(),
            allowed_operations: Vec::new(),
            other_config: Default::default(),
        };
        let vbd_ref = vbd.reference.clone();
        ctx.db.vms.insert(vm).unwrap();
        ctx.db.vbds.insert(vbd).unwrap();
        ctx.db
            .vdis
            .update(&snap_ref, |vdi| vdi.vbds.push(vbd_ref.clone()))
            .unwrap();

        // Timeout path restores the original type
        let original_type = ctx.db.vdis.get(&snap_ref).unwrap().vdi_type;
        let err = data_destroy(&ctx, &snap_ref, Duration::from_millis(120)).unwrap_err();
        assert_eq!(err.code, codes::VDI_IN_USE);
        assert_eq!(ctx.db.vdis.get(&snap_ref).unwrap().vdi_type, original_type);

        // With the VBD torn down mid-wait the call succeeds and the stub
        // keeps the metadata type
        let ctx2 = ctx.clone();
        let snap2 = snap_ref.clone();
        let teardown = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            let _ = ctx2.db.vbds.remove(&vbd_ref);
            let _ = ctx2.db.vdis.update(&snap2, |vdi| vdi.vbds.clear());
        });
        data_destroy(&ctx, &snap_ref, Duration::from_secs(4)).unwrap();
        teardown.join().unwrap();
        let stub = ctx.db.vdis.get(&snap_ref).unwrap();
        assert_eq!(stub.vdi_type, VdiType::CbtMetadata);
        assert_eq!(stub.virtual_size, 0);
    }

    #[test]
    fn test_resize_and_cbt_flags() {
        let (ctx, _storage, sr_ref, _sr_uuid) = setup();
        let vdi_ref = create(&ctx, &sr_ref, "grow", 1 << 30, VdiType::User).unwrap();
        resize(&ctx, &vdi_ref, 2 << 30).unwrap();
        assert_eq!(ctx.db.vdis.get(&vdi_ref).unwrap().virtual_size, 2 << 30);

        enable_cbt(&ctx, &vdi_ref).unwrap();
        assert!(ctx.db.vdis.get(&vdi_ref).unwrap().cbt_enabled);
        disable_cbt(&ctx, &vdi_ref).unwrap();
        assert!(!ctx.db.vdis.get(&vdi_ref).unwrap().cbt_enabled);
    }

    #[test]
    fn test_forget_keeps_backend_data() {
        let (ctx, storage, sr_ref, sr_uuid) = setup();
        let vdi_ref = create(&ctx, &sr_ref, "kept", 1 << 30, VdiType::User).unwrap();
        forget(&ctx, &vdi_ref).unwrap();
        assert!(ctx.db.vdis.try_get(&vdi_ref).is_none());
        // The data is still there for a later introduce
        assert_eq!(storage.sr_scan("dbg", &sr_uuid).unwrap().len(), 1);
    }
}
