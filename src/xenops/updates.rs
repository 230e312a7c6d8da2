//! Per-Event Update Rules
//!
//! Handlers applied by the daemon-side event pump. Each one reads the
//! current daemon state for the object, diffs it against the last observed
//! state in the cache, and writes only the changed fields back to the
//! database. The adapter is the only writer of VM.power_state.

use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

use crate::allowed;
use crate::db::models::*;

use super::{
    DeviceId, ObjectState, UpdateId, VmStateInfo, XenopsAdapter, XenopsError, XenopsPowerState,
};

/// Guest-agent keys excluded from change detection; they churn constantly
const GUEST_AGENT_VOLATILE_KEYS: &[&str] =
    &["data/meminfo_free", "data/updated", "data/update_cnt"];

impl XenopsAdapter {
    /// Dispatch one update to its handler. Per-event failures are logged and
    /// swallowed so the pump never dies.
    pub fn route_update(&self, update: &UpdateId) {
        if let Some(vm_uuid) = update.vm_id() {
            if self.suppression.contains(vm_uuid) {
                log::debug!("update for suppressed vm {} dropped", vm_uuid);
                return;
            }
        }
        match update {
            UpdateId::Vm(id) => self.update_vm(id),
            UpdateId::Vbd(id) => self.update_vbd(id),
            UpdateId::Vif(id) => self.update_vif(id),
            UpdateId::Pci(id) => self.update_pci(id),
            UpdateId::Vgpu(id) => self.update_vgpu(id),
            UpdateId::Vusb(id) => self.update_vusb(id),
            UpdateId::Task(id) => {
                // Task progress flows through the task bridge's poll loop
                log::debug!("task update {} observed", id);
            }
        }
    }

    fn vm_by_uuid(&self, vm_uuid: &str) -> Option<VmRecord> {
        let uuid = Uuid::parse_str(vm_uuid).ok()?;
        self.db.vms.find_by_uuid(&uuid)
    }

    // ========================================================================
    // VM
    // ========================================================================

    pub fn update_vm(&self, vm_uuid: &str) {
        let Some(vm) = self.vm_by_uuid(vm_uuid) else {
            log::debug!("update for unknown vm {} ignored", vm_uuid);
            return;
        };
        let key = UpdateId::Vm(vm_uuid.to_string());
        let state = match self.client.vm_stat(self.dbg(), vm_uuid) {
            Ok((_, state)) => state,
            Err(XenopsError::DoesNotExist { .. }) => {
                self.caches.clear_observed(&key);
                return;
            }
            Err(e) => {
                log::warn!("stat of vm {} failed: {}", vm_uuid, e);
                return;
            }
        };

        let previous = match self.caches.observed(&key) {
            Some(ObjectState::Vm(previous)) => Some(previous),
            _ => None,
        };
        if previous.as_ref() == Some(&state) {
            return;
        }

        let power_changed = previous
            .as_ref()
            .map(|p| p.power_state != state.power_state)
            .unwrap_or(true);
        let previous_db_power = vm.power_state;
        if power_changed {
            self.apply_power_state(&vm, &state);
        }

        // Refetch: the power transition may have rewritten the row
        let Some(vm) = self.db.vms.try_get(&vm.reference) else {
            self.caches.set_observed(key, ObjectState::Vm(state));
            return;
        };

        if previous
            .as_ref()
            .map(|p| p.domids != state.domids)
            .unwrap_or(true)
            && state.power_state != XenopsPowerState::Halted
        {
            let domid = state.domids.first().copied().unwrap_or(-1);
            if vm.domid != domid {
                let _ = self.db.vms.update(&vm.reference, |vm| vm.domid = domid);
            }
        }

        if previous
            .as_ref()
            .map(|p| p.domain_type != state.domain_type)
            .unwrap_or(true)
        {
            self.apply_domain_type(&vm, &state);
        }

        if previous
            .as_ref()
            .map(|p| p.consoles != state.consoles)
            .unwrap_or(true)
        {
            self.apply_consoles(&vm, &state);
        }

        if previous
            .as_ref()
            .map(|p| p.guest_agent != state.guest_agent)
            .unwrap_or(true)
        {
            self.apply_guest_agent(&vm, &state);
        }

        if previous
            .as_ref()
            .map(|p| p.last_start_time != state.last_start_time)
            .unwrap_or(true)
        {
            self.apply_last_start_time(&vm, &state, previous_db_power);
        }

        if previous
            .as_ref()
            .map(|p| p.featureset != state.featureset)
            .unwrap_or(true)
        {
            self.apply_featureset(&vm, &state);
        }

        allowed::update_vm_and_devices(&self.db, &vm.reference);
        self.caches.set_observed(key, ObjectState::Vm(state));
    }

    /// The power-state transition rules. The daemon's word is final here.
    fn apply_power_state(&self, vm: &VmRecord, state: &VmStateInfo) {
        let vm_ref = &vm.reference;
        let vm_uuid = vm.uuid.to_string();
        match state.power_state {
            XenopsPowerState::Halted => {
                log::info!("vm {} halted", vm_ref);
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
                });
                // Every attachment is gone with the domain
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
                let _ = self
                    .db
                    .vms
                    .update(vm_ref, |vm| vm.attached_pcis.clear());
                // The daemon's record of the VM is gone too
                if let Err(e) = self.client.vm_remove(self.dbg(), &vm_uuid) {
                    log::debug!("removing metadata for {} after halt: {}", vm_uuid, e);
                }
                self.caches.unregister(&vm_uuid);
                self.trigger_xenapi_reregister();
            }
            XenopsPowerState::Suspended => {
                log::info!("vm {} suspended", vm_ref);
                // Attachment state and the domain type are preserved so
                // resume can restore them
                match self.pull_metadata(&vm_uuid) {
                    Ok(doc) => {
                        let record = doc
                            .serialise()
                            .unwrap_or_default();
                        let _ = self.db.vms.update(vm_ref, |vm| {
                            vm.power_state = PowerState::Suspended;
                            vm.domid = -1;
                            vm.last_booted_record = record;
                        });
                    }
                    Err(e) => {
                        log::warn!("pulling metadata for suspended vm {}: {}", vm_uuid, e);
                        let _ = self.db.vms.update(vm_ref, |vm| {
                            vm.power_state = PowerState::Suspended;
                            vm.domid = -1;
                        });
                    }
                }
                self.trigger_xenapi_reregister();
            }
            XenopsPowerState::Running => {
                log::info!("vm {} running", vm_ref);
                let localhost = self.localhost.clone();
                let was = vm.power_state;
                let _ = self.db.vms.update(vm_ref, |vm| {
                    vm.power_state = PowerState::Running;
                    vm.resident_on = localhost.clone();
                    vm.scheduled_to_be_resident_on = Ref::null();
                });
                let _ = self.db.hosts.update(&self.localhost, |host| {
                    if !host.resident_vms.contains(vm_ref) {
                        host.resident_vms.push(vm_ref.clone());
                    }
                });
                if matches!(was, PowerState::Halted | PowerState::Suspended) {
                    self.ensure_guest_metrics(vm);
                }
                self.trigger_xenapi_reregister();
            }
            XenopsPowerState::Paused => {
                let localhost = self.localhost.clone();
                let _ = self.db.vms.update(vm_ref, |vm| {
                    vm.power_state = PowerState::Paused;
                    vm.resident_on = localhost.clone();
                });
            }
        }
    }

    /// Mirror the domain type into the metrics row, except when the daemon
    /// reports it undefined for a live domain
    fn apply_domain_type(&self, vm: &VmRecord, state: &VmStateInfo) {
        let reported = state.domain_type.to_domain_type();
        if reported == DomainType::Unspecified && state.power_state != XenopsPowerState::Halted {
            return;
        }
        if !vm.metrics.is_null() {
            let _ = self
                .db
                .vm_metrics
                .update(&vm.metrics, |m| m.current_domain_type = reported);
        }
    }

    /// Reconcile console rows by symmetric difference on (protocol, uri)
    fn apply_consoles(&self, vm: &VmRecord, state: &VmStateInfo) {
        let target: Vec<(ConsoleProtocol, String)> = state.consoles.clone();
        let existing: Vec<(Ref, ConsoleProtocol, String)> = vm
            .consoles
            .iter()
            .filter_map(|r| {
                self.db
                    .consoles
                    .try_get(r)
                    .map(|c| (r.clone(), c.protocol, c.location))
            })
            .collect();

        for (console_ref, protocol, location) in &existing {
            if !target.iter().any(|(p, l)| p == protocol && l == location) {
                let _ = self.db.consoles.remove(console_ref);
                let _ = self.db.vms.update(&vm.reference, |vm| {
                    vm.consoles.retain(|c| c != console_ref);
                });
            }
        }
        for (protocol, location) in &target {
            if !existing.iter().any(|(_, p, l)| p == protocol && l == location) {
                let console = ConsoleRecord {
                    reference: Ref::generate(),
                    uuid: Uuid::new_v4(),
                    vm: vm.reference.clone(),
                    protocol: *protocol,
                    location: location.clone(),
                };
                let console_ref = console.reference.clone();
                if self.db.consoles.insert(console).is_ok() {
                    let _ = self
                        .db
                        .vms
                        .update(&vm.reference, |vm| vm.consoles.push(console_ref.clone()));
                }
            }
        }
    }

    /// Write guest-agent data, ignoring the volatile memory/update keys when
    /// deciding whether anything changed
    fn apply_guest_agent(&self, vm: &VmRecord, state: &VmStateInfo) {
        let significant = |pairs: &[(String, String)]| -> Vec<(String, String)> {
            let mut filtered: Vec<(String, String)> = pairs
                .iter()
                .filter(|(k, _)| !GUEST_AGENT_VOLATILE_KEYS.contains(&k.as_str()))
                .cloned()
                .collect();
            filtered.sort();
            filtered
        };

        let reported = significant(&state.guest_agent);
        let stored = self
            .db
            .vm_guest_metrics
            .try_get(&vm.guest_metrics)
            .map(|g| {
                let mut pairs: Vec<(String, String)> = g
                    .other
                    .iter()
                    .filter(|(k, _)| !GUEST_AGENT_VOLATILE_KEYS.contains(&k.as_str()))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                pairs.sort();
                pairs
            });
        if stored.as_deref() == Some(reported.as_slice()) {
            return;
        }

        let other: std::collections::HashMap<String, String> =
            state.guest_agent.iter().cloned().collect();
        if self.db.vm_guest_metrics.contains(&vm.guest_metrics) {
            let _ = self.db.vm_guest_metrics.update(&vm.guest_metrics, |g| {
                g.other = other.clone();
                g.last_updated = Utc::now();
            });
        } else {
            self.ensure_guest_metrics(vm);
            if let Some(vm) = self.db.vms.try_get(&vm.reference) {
                let _ = self.db.vm_guest_metrics.update(&vm.guest_metrics, |g| {
                    g.other = other.clone();
                    g.last_updated = Utc::now();
                });
            }
        }
        // Capability flags feed the admission chain
        allowed::update_vm_allowed_operations(&self.db, &vm.reference);
    }

    /// Start-time bookkeeping: clamp to whole seconds, roll the metrics row
    /// forward, drop restart guidance once a fresh boot is observed, and
    /// replace guest metrics that predate the boot
    fn apply_last_start_time(
        &self,
        vm: &VmRecord,
        state: &VmStateInfo,
        previous_db_power: PowerState,
    ) {
        let clamped: DateTime<Utc> = match Utc.timestamp_opt(state.last_start_time as i64, 0) {
            chrono::LocalResult::Single(t) => t,
            _ => return,
        };
        let Some(metrics) = self.db.vm_metrics.try_get(&vm.metrics) else {
            return;
        };
        if clamped > metrics.start_time {
            let _ = self
                .db
                .vm_metrics
                .update(&vm.metrics, |m| m.start_time = clamped);
            if state.power_state == XenopsPowerState::Running
                && previous_db_power != PowerState::Suspended
            {
                let _ = self.db.vms.update(&vm.reference, |vm| {
                    vm.pending_guidances.retain(|g| {
                        !matches!(
                            g,
                            UpdateGuidance::RestartDeviceModel | UpdateGuidance::RestartVm
                        )
                    });
                });
            }
        }
        if let Some(guest) = self.db.vm_guest_metrics.try_get(&vm.guest_metrics) {
            if guest.last_updated < clamped {
                let _ = self.db.vm_guest_metrics.remove(&vm.guest_metrics);
                let _ = self
                    .db
                    .vms
                    .update(&vm.reference, |vm| vm.guest_metrics = Ref::null());
                if let Some(vm) = self.db.vms.try_get(&vm.reference) {
                    self.ensure_guest_metrics(&vm);
                }
            }
        }
    }

    /// Record the CPU policy the guest booted with, unless it is suspended
    /// (the frozen image keeps its original flags)
    fn apply_featureset(&self, vm: &VmRecord, state: &VmStateInfo) {
        if vm.power_state == PowerState::Suspended || state.featureset.is_empty() {
            return;
        }
        let featureset = state.featureset.clone();
        let _ = self.db.vms.update(&vm.reference, |vm| {
            let vendor = vm
                .last_boot_cpu_flags
                .get("vendor")
                .cloned()
                .unwrap_or_else(|| "unknown".to_string());
            vm.last_boot_cpu_flags.clear();
            vm.last_boot_cpu_flags.insert("vendor".to_string(), vendor);
            vm.last_boot_cpu_flags
                .insert("features".to_string(), featureset.clone());
        });
    }

    /// Create a fresh guest-metrics row for a VM that just came up
    fn ensure_guest_metrics(&self, vm: &VmRecord) {
        if self.db.vm_guest_metrics.contains(&vm.guest_metrics) {
            let _ = self
                .db
                .vm_guest_metrics
                .update(&vm.guest_metrics, |g| g.last_updated = Utc::now());
            return;
        }
        let record = VmGuestMetricsRecord {
            reference: Ref::generate(),
            uuid: Uuid::new_v4(),
            vm: vm.reference.clone(),
            os_version: Default::default(),
            networks: Default::default(),
            other: Default::default(),
            last_updated: Utc::now(),
        };
        let reference = record.reference.clone();
        if self.db.vm_guest_metrics.insert(record).is_ok() {
            let _ = self
                .db
                .vms
                .update(&vm.reference, |vm| vm.guest_metrics = reference.clone());
        }
    }

    // ========================================================================
    // Devices
    // ========================================================================

    fn vbd_by_id(&self, id: &DeviceId) -> Option<VbdRecord> {
        let vm = self.vm_by_uuid(&id.0)?;
        vm.vbds
            .iter()
            .filter_map(|r| self.db.vbds.try_get(r))
            .find(|vbd| vbd.userdevice == id.1)
    }

    pub fn update_vbd(&self, id: &DeviceId) {
        let Some(vbd) = self.vbd_by_id(id) else {
            log::debug!("update for unknown vbd {:?} ignored", id);
            return;
        };
        let key = UpdateId::Vbd(id.clone());
        let state = match self.client.vbd_stat(self.dbg(), id) {
            Ok((_, state)) => state,
            Err(XenopsError::DoesNotExist { .. }) => {
                self.caches.clear_observed(&key);
                return;
            }
            Err(e) => {
                log::warn!("stat of vbd {:?} failed: {}", id, e);
                return;
            }
        };
        if let Some(ObjectState::Vbd(previous)) = self.caches.observed(&key) {
            if previous == state {
                return;
            }
        }
        let attached = state.plugged || state.active;
        let removable = matches!(vbd.vbd_type, VbdType::Cd | VbdType::Floppy);
        let _ = self.db.vbds.update(&vbd.reference, |vbd| {
            vbd.currently_attached = attached;
            if !attached {
                vbd.reserved = false;
            }
            if removable {
                vbd.empty = !state.media_present;
            }
        });
        allowed::update_vbd_allowed_operations(&self.db, &vbd.reference);
        if !vbd.vdi.is_null() {
            allowed::update_vdi_allowed_operations(&self.db, &vbd.vdi);
        }
        self.caches.set_observed(key, ObjectState::Vbd(state));
    }

    fn vif_by_id(&self, id: &DeviceId) -> Option<VifRecord> {
        let vm = self.vm_by_uuid(&id.0)?;
        vm.vifs
            .iter()
            .filter_map(|r| self.db.vifs.try_get(r))
            .find(|vif| vif.device == id.1)
    }

    pub fn update_vif(&self, id: &DeviceId) {
        let Some(vif) = self.vif_by_id(id) else {
            log::debug!("update for unknown vif {:?} ignored", id);
            return;
        };
        let key = UpdateId::Vif(id.clone());
        let state = match self.client.vif_stat(self.dbg(), id) {
            Ok((_, state)) => state,
            Err(XenopsError::DoesNotExist { .. }) => {
                self.caches.clear_observed(&key);
                return;
            }
            Err(e) => {
                log::warn!("stat of vif {:?} failed: {}", id, e);
                return;
            }
        };
        if let Some(ObjectState::Vif(previous)) = self.caches.observed(&key) {
            if previous == state {
                return;
            }
        }
        let attached = state.plugged || state.active;
        let _ = self.db.vifs.update(&vif.reference, |vif| {
            vif.currently_attached = attached;
            if !attached {
                vif.reserved = false;
            }
        });
        allowed::update_vif_allowed_operations(&self.db, &vif.reference);
        self.caches.set_observed(key, ObjectState::Vif(state));
    }

    pub fn update_pci(&self, id: &DeviceId) {
        let Some(vm) = self.vm_by_uuid(&id.0) else {
            return;
        };
        let Some(pci) = self
            .db
            .pcis
            .list()
            .into_iter()
            .find(|pci| pci.pci_id == id.1 && pci.host == self.localhost)
        else {
            log::debug!("update for unknown pci {:?} ignored", id);
            return;
        };
        let key = UpdateId::Pci(id.clone());
        let state = match self.client.pci_stat(self.dbg(), id) {
            Ok((_, state)) => state,
            Err(XenopsError::DoesNotExist { .. }) => {
                self.caches.clear_observed(&key);
                return;
            }
            Err(e) => {
                log::warn!("stat of pci {:?} failed: {}", id, e);
                return;
            }
        };
        if let Some(ObjectState::Pci(previous)) = self.caches.observed(&key) {
            if previous == state {
                return;
            }
        }
        let vm_ref = vm.reference.clone();
        let pci_ref = pci.reference.clone();
        if state.plugged {
            let _ = self.db.pcis.update(&pci_ref, |pci| {
                if !pci.attached_vms.contains(&vm_ref) {
                    pci.attached_vms.push(vm_ref.clone());
                }
            });
            let _ = self.db.vms.update(&vm_ref, |vm| {
                if !vm.attached_pcis.contains(&pci_ref) {
                    vm.attached_pcis.push(pci_ref.clone());
                }
            });
        } else {
            let _ = self.db.pcis.update(&pci_ref, |pci| {
                pci.attached_vms.retain(|r| r != &vm_ref);
            });
            let _ = self.db.vms.update(&vm_ref, |vm| {
                vm.attached_pcis.retain(|r| r != &pci_ref);
            });
        }
        allowed::update_vm_allowed_operations(&self.db, &vm_ref);
        self.caches.set_observed(key, ObjectState::Pci(state));
    }

    pub fn update_vgpu(&self, id: &DeviceId) {
        let Some(vm) = self.vm_by_uuid(&id.0) else {
            return;
        };
        let Some(vgpu) = vm
            .vgpus
            .iter()
            .filter_map(|r| self.db.vgpus.try_get(r))
            .find(|vgpu| vgpu.device == id.1)
        else {
            log::debug!("update for unknown vgpu {:?} ignored", id);
            return;
        };
        let key = UpdateId::Vgpu(id.clone());
        let state = match self.client.vgpu_stat(self.dbg(), id) {
            Ok((_, state)) => state,
            Err(XenopsError::DoesNotExist { .. }) => {
                self.caches.clear_observed(&key);
                return;
            }
            Err(e) => {
                log::warn!("stat of vgpu {:?} failed: {}", id, e);
                return;
            }
        };
        if let Some(ObjectState::Vgpu(previous)) = self.caches.observed(&key) {
            if previous == state {
                return;
            }
        }
        let attached = state.plugged || state.active;
        let _ = self
            .db
            .vgpus
            .update(&vgpu.reference, |vgpu| vgpu.currently_attached = attached);
        self.caches.set_observed(key, ObjectState::Vgpu(state));
    }

    pub fn update_vusb(&self, id: &DeviceId) {
        let Some(vm) = self.vm_by_uuid(&id.0) else {
            return;
        };
        let Some(vusb) = vm
            .vusbs
            .iter()
            .filter_map(|r| self.db.vusbs.try_get(r))
            .find(|vusb| vusb.uuid.to_string() == id.1)
        else {
            log::debug!("update for unknown vusb {:?} ignored", id);
            return;
        };
        let key = UpdateId::Vusb(id.clone());
        let state = match self.client.vusb_stat(self.dbg(), id) {
            Ok((_, state)) => state,
            Err(XenopsError::DoesNotExist { .. }) => {
                self.caches.clear_observed(&key);
                return;
            }
            Err(e) => {
                log::warn!("stat of vusb {:?} failed: {}", id, e);
                return;
            }
        };
        if let Some(ObjectState::Vusb(previous)) = self.caches.observed(&key) {
            if previous == state {
                return;
            }
        }
        let _ = self
            .db
            .vusbs
            .update(&vusb.reference, |vusb| vusb.currently_attached = state.plugged);
        self.caches.set_observed(key, ObjectState::Vusb(state));
    }
}
