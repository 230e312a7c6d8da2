//! Metadata Push and Pull
//!
//! The database record of a VM and all its attached devices is serialised
//! into one document and imported into the daemon; the id the daemon hands
//! back is the identity its events will carry. Pulling exports the document
//! back (capturing live state on suspend) and removes it from the daemon.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::api_error::{codes, ApiError, ApiResult};
use crate::db::models::*;
use crate::db::Database;

use super::{XenopsAdapter, XenopsResult, XvmId};

/// Guest firmware flavour, derived from the platform map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Firmware {
    Bios,
    Uefi,
}

/// VM as the daemon sees it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XenopsVm {
    /// The VM UUID
    pub id: XvmId,
    pub name: String,
    pub vcpus: i64,
    pub vcpus_max: i64,
    pub memory_dynamic_min: i64,
    pub memory_dynamic_max: i64,
    pub memory_static_max: i64,
    pub domain_type: DomainType,
    pub firmware: Firmware,
    pub platform: HashMap<String, String>,
    pub nvram: HashMap<String, String>,
    pub has_vtpm: bool,
    pub on_crash: ActionAfter,
}

/// Block device as the daemon sees it; identified by (vm, device)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XenopsVbd {
    pub id: (XvmId, String),
    /// (sr_uuid, vdi_location); None for an empty drive
    pub backend: Option<(String, String)>,
    pub mode: VbdMode,
    pub removable: bool,
    pub bootable: bool,
}

/// Network device as the daemon sees it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XenopsVif {
    pub id: (XvmId, String),
    pub bridge: String,
    pub mac: String,
    pub locking_mode: VifLockingMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XenopsPci {
    pub id: (XvmId, String),
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XenopsVgpu {
    pub id: (XvmId, String),
    pub implementation: VgpuImplementation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XenopsVusb {
    pub id: (XvmId, String),
    pub path: String,
}

/// The single document crossing the metadata boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataDoc {
    pub vm: XenopsVm,
    pub vbds: Vec<XenopsVbd>,
    pub vifs: Vec<XenopsVif>,
    pub pcis: Vec<XenopsPci>,
    pub vgpus: Vec<XenopsVgpu>,
    pub vusbs: Vec<XenopsVusb>,
    /// Stored boot-time record, present when the VM is suspended
    pub last_booted: Option<String>,
}

impl MetadataDoc {
    pub fn serialise(&self) -> ApiResult<String> {
        serde_json::to_string(self).map_err(|e| ApiError::internal_error(e.to_string()))
    }
}

fn firmware_of(vm: &VmRecord) -> Firmware {
    match vm.platform.get("firmware").map(|s| s.as_str()) {
        Some("uefi") => Firmware::Uefi,
        _ => Firmware::Bios,
    }
}

/// Serialise a VM row and its attached devices into one document.
/// A VTPM on a BIOS guest cannot be expressed on the daemon side, so the
/// combination is rejected here rather than at VTPM creation.
pub fn build(db: &Database, vm: &VmRecord) -> ApiResult<MetadataDoc> {
    let firmware = firmware_of(vm);
    let has_vtpm = !vm.vtpms.is_empty();
    if has_vtpm && firmware == Firmware::Bios {
        return Err(ApiError::new(
            codes::VTPM_UNIMPLEMENTED,
            vec![vm.reference.as_str().to_string()],
        ));
    }

    let vm_id = vm.uuid.to_string();
    let mut vbds = Vec::new();
    for vbd_ref in &vm.vbds {
        let Some(vbd) = db.vbds.try_get(vbd_ref) else {
            continue;
        };
        let backend = if vbd.empty {
            None
        } else {
            db.vdis.try_get(&vbd.vdi).and_then(|vdi| {
                db.srs
                    .try_get(&vdi.sr)
                    .map(|sr| (sr.uuid.to_string(), vdi.location.clone()))
            })
        };
        vbds.push(XenopsVbd {
            id: (vm_id.clone(), vbd.userdevice.clone()),
            backend,
            mode: vbd.mode,
            removable: matches!(vbd.vbd_type, VbdType::Cd | VbdType::Floppy),
            bootable: vbd.bootable,
        });
    }

    let mut vifs = Vec::new();
    for vif_ref in &vm.vifs {
        let Some(vif) = db.vifs.try_get(vif_ref) else {
            continue;
        };
        let bridge = db
            .networks
            .try_get(&vif.network)
            .map(|n| n.bridge)
            .unwrap_or_default();
        vifs.push(XenopsVif {
            id: (vm_id.clone(), vif.device.clone()),
            bridge,
            mac: vif.mac.clone(),
            locking_mode: vif.locking_mode,
        });
    }

    let mut pcis = Vec::new();
    for pci_ref in &vm.attached_pcis {
        if let Some(pci) = db.pcis.try_get(pci_ref) {
            pcis.push(XenopsPci {
                id: (vm_id.clone(), pci.pci_id.clone()),
                address: pci.pci_id.clone(),
            });
        }
    }

    let mut vgpus = Vec::new();
    for vgpu_ref in &vm.vgpus {
        if let Some(vgpu) = db.vgpus.try_get(vgpu_ref) {
            vgpus.push(XenopsVgpu {
                id: (vm_id.clone(), vgpu.device.clone()),
                implementation: vgpu.implementation,
            });
        }
    }

    let mut vusbs = Vec::new();
    for vusb_ref in &vm.vusbs {
        let Some(vusb) = db.vusbs.try_get(vusb_ref) else {
            continue;
        };
        let path = db
            .pusbs
            .try_get(&vusb.pusb)
            .map(|p| p.path)
            .unwrap_or_default();
        vusbs.push(XenopsVusb {
            id: (vm_id.clone(), vusb.uuid.to_string()),
            path,
        });
    }

    let last_booted = if vm.power_state == PowerState::Suspended
        && !vm.last_booted_record.is_empty()
    {
        Some(vm.last_booted_record.clone())
    } else {
        None
    };

    Ok(MetadataDoc {
        vm: XenopsVm {
            id: vm_id,
            name: vm.name_label.clone(),
            vcpus: vm.vcpus_at_startup,
            vcpus_max: vm.vcpus_max,
            memory_dynamic_min: vm.memory_dynamic_min,
            memory_dynamic_max: vm.memory_dynamic_max,
            memory_static_max: vm.memory_static_max,
            domain_type: vm.domain_type,
            firmware,
            platform: vm.platform.clone(),
            nvram: vm.nvram.clone(),
            has_vtpm,
            on_crash: vm.actions_after_crash,
        },
        vbds,
        vifs,
        pcis,
        vgpus,
        vusbs,
        last_booted,
    })
}

impl XenopsAdapter {
    /// Serialise and import the VM's metadata, registering cache entries.
    /// The returned id is what the daemon's events will carry.
    pub fn push_metadata(&self, vm: &VmRecord) -> ApiResult<XvmId> {
        let doc = build(&self.db, vm)?;
        let serialised = doc.serialise()?;
        let id = self
            .client
            .vm_import_metadata(self.dbg(), &doc)
            .map_err(|e| e.to_api_error(vm.reference.as_str()))?;
        self.caches.register(&id);
        self.caches.set_pushed_metadata(&id, serialised);
        log::debug!("pushed metadata for {} as {}", vm.reference, id);
        Ok(id)
    }

    /// Export the document from the daemon and remove it there; used on
    /// suspend to capture the live boot record
    pub fn pull_metadata(&self, id: &str) -> XenopsResult<MetadataDoc> {
        let doc = self.client.vm_export_metadata(self.dbg(), id)?;
        self.client.vm_remove(self.dbg(), id)?;
        Ok(doc)
    }

    /// Recompute the metadata document and push it only when it differs from
    /// the one last pushed
    pub fn update_metadata_if_changed(&self, vm_ref: &Ref) -> ApiResult<()> {
        let Some(vm) = self.db.vms.try_get(vm_ref) else {
            return Ok(());
        };
        let id = vm.uuid.to_string();
        if !self.caches.is_registered(&id) {
            return Ok(());
        }
        let doc = build(&self.db, &vm)?;
        let serialised = doc.serialise()?;
        if self.caches.pushed_metadata(&id).as_deref() == Some(serialised.as_str()) {
            return Ok(());
        }
        self.client
            .vm_import_metadata(self.dbg(), &doc)
            .map_err(|e| e.to_api_error(vm.reference.as_str()))?;
        self.caches.set_pushed_metadata(&id, serialised);
        log::debug!("metadata for {} refreshed", vm.reference);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use std::sync::Arc;
    use uuid::Uuid;

    fn db_with_vm() -> (Database, VmRecord) {
        let db = Database::new(Arc::new(EventBus::default()));
        let vm = VmRecord {
            reference: Ref::generate(),
            uuid: Uuid::new_v4(),
            name_label: "guest".to_string(),
            vcpus_at_startup: 2,
            vcpus_max: 4,
            memory_dynamic_min: 1 << 30,
            memory_dynamic_max: 2 << 30,
            memory_static_max: 2 << 30,
            domain_type: DomainType::Hvm,
            ..Default::default()
        };
        db.vms.insert(vm.clone()).unwrap();
        (db, vm)
    }

    #[test]
    fn test_build_plain_vm() {
        let (db, vm) = db_with_vm();
        let doc = build(&db, &vm).unwrap();
        assert_eq!(doc.vm.id, vm.uuid.to_string());
        assert_eq!(doc.vm.vcpus, 2);
        assert_eq!(doc.vm.firmware, Firmware::Bios);
        assert!(doc.vbds.is_empty());
        assert!(doc.last_booted.is_none());
    }

    #[test]
    fn test_vtpm_on_bios_rejected_at_build_time() {
        let (db, mut vm) = db_with_vm();
        vm.vtpms.push(Ref::generate());
        let err = build(&db, &vm).unwrap_err();
        assert_eq!(err.code, codes::VTPM_UNIMPLEMENTED);

        // A UEFI guest carries its module fine
        vm.platform
            .insert("firmware".to_string(), "uefi".to_string());
        let doc = build(&db, &vm).unwrap();
        assert!(doc.vm.has_vtpm);
        assert_eq!(doc.vm.firmware, Firmware::Uefi);
    }

    #[test]
    fn test_build_includes_devices() {
        let (db, mut vm) = db_with_vm();
        let sr = SrRecord {
            reference: Ref::generate(),
            uuid: Uuid::new_v4(),
            name_label: "sr".to_string(),
            name_description: String::new(),
            sr_type: "ext".to_string(),
            content_type: "user".to_string(),
            pbds: Vec::new(),
            vdis: Vec::new(),
            physical_size: 0,
            physical_utilisation: 0,
            virtual_allocation: 0,
            shared: false,
            clustered: false,
            is_tools_sr: false,
            capabilities: Vec::new(),
            sm_config: Default::default(),
            other_config: Default::default(),
            current_operations: Default::default(),
            allowed_operations: Vec::new(),
        };
        let vdi = VdiRecord {
            reference: Ref::generate(),
            uuid: Uuid::new_v4(),
            name_label: "root".to_string(),
            sr: sr.reference.clone(),
            vbds: Vec::new(),
            location: "loc-1".to_string(),
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
        let vbd = VbdRecord {
            reference: Ref::generate(),
            uuid: Uuid::new_v4(),
            vm: vm.reference.clone(),
            vdi: vdi.reference.clone(),
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
        let network = NetworkRecord {
            reference: Ref::generate(),
            uuid: Uuid::new_v4(),
            name_label: "net".to_string(),
            bridge: "xenbr0".to_string(),
            ..Default::default()
        };
        let vif = VifRecord {
            reference: Ref::generate(),
            uuid: Uuid::new_v4(),
            vm: vm.reference.clone(),
            network: network.reference.clone(),
            device: "0".to_string(),
            mac: "aa:bb:cc:dd:ee:ff".to_string(),
            locking_mode: VifLockingMode::NetworkDefault,
            currently_attached: false,
            reserved: false,
            ipv4_configuration_mode: String::new(),
            ipv4_addresses: Vec::new(),
            ipv6_configuration_mode: String::new(),
            ipv6_addresses: Vec::new(),
            reserved_pci: Ref::null(),
            current_operations: Default::default(),
            allowed_operations: Vec::new(),
            other_config: Default::default(),
        };
        let sr_uuid = sr.uuid.to_string();
        vm.vbds.push(vbd.reference.clone());
        vm.vifs.push(vif.reference.clone());
        db.srs.insert(sr).unwrap();
        db.vdis.insert(vdi).unwrap();
        db.vbds.insert(vbd).unwrap();
        db.networks.insert(network).unwrap();
        db.vifs.insert(vif).unwrap();

        let doc = build(&db, &vm).unwrap();
        assert_eq!(doc.vbds.len(), 1);
        assert_eq!(
            doc.vbds[0].backend,
            Some((sr_uuid, "loc-1".to_string()))
        );
        assert_eq!(doc.vifs.len(), 1);
        assert_eq!(doc.vifs[0].bridge, "xenbr0");
    }

    #[test]
    fn test_suspended_vm_carries_boot_record() {
        let (db, mut vm) = db_with_vm();
        vm.power_state = PowerState::Suspended;
        vm.last_booted_record = "{\"frozen\":true}".to_string();
        let doc = build(&db, &vm).unwrap();
        assert_eq!(doc.last_booted.as_deref(), Some("{\"frozen\":true}"));
    }
}
