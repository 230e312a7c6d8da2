//! Startup Reconciliation
//!
//! After a restart of this process or the daemon, the two views of "which
//! VMs run here" are reconciled before the event pumps start:
//! - known to the daemon but recorded as resident elsewhere: shut down if
//!   running (two hosts writing one disk corrupts it), then removed
//! - known to the daemon but absent from the database: shut down and removed
//! - known to the daemon, resident nowhere in the database: claimed for this
//!   host so the event pump reconciles it normally
//! - recorded as resident here but unknown to the daemon: forced to Halted

use std::time::Duration;

use uuid::Uuid;

use crate::db::models::{PowerState, Ref, UpdateGuidance, VmRecord};

use super::{XenopsAdapter, XenopsPowerState, XenopsResult};

impl XenopsAdapter {
    pub fn resync_resident_on(&self) -> XenopsResult<()> {
        let daemon_vms = self.client.vm_list(self.dbg())?;
        let mut daemon_uuids: Vec<String> = Vec::with_capacity(daemon_vms.len());

        for (xvm, state) in &daemon_vms {
            daemon_uuids.push(xvm.id.clone());
            let db_vm = Uuid::parse_str(&xvm.id)
                .ok()
                .and_then(|uuid| self.db.vms.find_by_uuid(&uuid));
            match db_vm {
                None => {
                    log::warn!("vm {} unknown to the database, removing from daemon", xvm.id);
                    self.shutdown_and_remove(&xvm.id, state.power_state);
                }
                Some(vm)
                    if !vm.resident_on.is_null() && vm.resident_on != self.localhost =>
                {
                    log::warn!(
                        "vm {} is recorded resident on {}, removing local copy",
                        xvm.id,
                        vm.resident_on
                    );
                    self.shutdown_and_remove(&xvm.id, state.power_state);
                }
                Some(vm) if vm.resident_on.is_null() => {
                    log::info!("claiming vm {} as resident here", xvm.id);
                    let localhost = self.localhost.clone();
                    let _ = self.db.vms.update(&vm.reference, |vm| {
                        vm.resident_on = localhost.clone();
                    });
                    let _ = self.db.hosts.update(&self.localhost, |host| {
                        if !host.resident_vms.contains(&vm.reference) {
                            host.resident_vms.push(vm.reference.clone());
                        }
                    });
                    self.caches.register(&xvm.id);
                }
                Some(_) => {
                    self.caches.register(&xvm.id);
                }
            }
        }

        // Database claims residency the daemon does not back
        for vm in self.db.vms.list() {
            if vm.resident_on == self.localhost && !daemon_uuids.contains(&vm.uuid.to_string()) {
                log::warn!("vm {} gone from the daemon, forcing Halted", vm.reference);
                self.force_halted_in_db(&vm);
            }
        }
        Ok(())
    }

    /// Running guests found where they must not be are shut down before
    /// their metadata is removed; a second writer on shared disks corrupts
    /// them
    fn shutdown_and_remove(&self, vm_uuid: &str, power: XenopsPowerState) {
        if matches!(power, XenopsPowerState::Running | XenopsPowerState::Paused) {
            match self.client.vm_shutdown(self.dbg(), vm_uuid, None) {
                Ok(task) => {
                    if let Err(e) = self.run_task(None, &task) {
                        log::warn!("shutting down stray vm {}: {}", vm_uuid, e);
                    }
                }
                Err(e) => log::warn!("shutting down stray vm {}: {}", vm_uuid, e),
            }
        }
        if let Err(e) = self.client.vm_remove(self.dbg(), vm_uuid) {
            log::warn!("removing stray vm {}: {}", vm_uuid, e);
        }
        self.caches.unregister(vm_uuid);
    }

    /// Clear every residue of a domain the daemon no longer has
    pub(crate) fn force_halted_in_db(&self, vm: &VmRecord) {
        let vm_ref = &vm.reference;
        let _ = self.db.vms.update(vm_ref, |vm| {
            vm.power_state = PowerState::Halted;
            vm.resident_on = Ref::null();
            vm.scheduled_to_be_resident_on = Ref::null();
            vm.domid = -1;
            vm.requires_reboot = false;
            vm.pending_guidances.retain(|g| {
                !matches!(
                    g,
                    UpdateGuidance::RestartDeviceModel | UpdateGuidance::RestartVm
                )
            });
            vm.attached_pcis.clear();
        });
        for vbd_ref in &vm.vbds {
            let _ = self.db.vbds.update(vbd_ref, |vbd| {
                vbd.currently_attached = false;
                vbd.reserved = false;
            });
        }
        for vif_ref in &vm.vifs {
            let _ = self.db.vifs.update(vif_ref, |vif| {
                vif.currently_attached = false;
                vif.reserved = false;
            });
        }
        for vgpu_ref in &vm.vgpus {
            let _ = self
                .db
                .vgpus
                .update(vgpu_ref, |vgpu| vgpu.currently_attached = false);
        }
        for vusb_ref in &vm.vusbs {
            let _ = self
                .db
                .vusbs
                .update(vusb_ref, |vusb| vusb.currently_attached = false);
        }
        for pci_ref in &vm.attached_pcis {
            let _ = self.db.pcis.update(pci_ref, |pci| {
                pci.attached_vms.retain(|r| r != vm_ref);
            });
        }
        let _ = self.db.hosts.update(&self.localhost, |host| {
            host.resident_vms.retain(|r| r != vm_ref);
        });
        crate::allowed::update_vm_and_devices(&self.db, vm_ref);
    }

    /// Explicitly refresh every resident VM after the pumps are up, waiting
    /// for each one's barrier so the database reflects daemon truth before
    /// startup proceeds
    pub fn refresh_resident_vms(&self, timeout: Duration) {
        for vm in self.db.vms.list() {
            if vm.resident_on == self.localhost {
                let uuid = vm.uuid.to_string();
                match self.refresh_vm_sync(&uuid, timeout) {
                    Ok(true) => {}
                    Ok(false) => log::warn!("refresh barrier for {} timed out", uuid),
                    Err(e) => log::warn!("refreshing {}: {}", uuid, e),
                }
            }
        }
    }
}
