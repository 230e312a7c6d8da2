//! In-Memory Hypervisor Daemon
//!
//! A functional stand-in for the real daemon used by the test suite and the
//! debug dummy-data mode. Lifecycle RPCs complete through short-lived tasks,
//! every state change lands in the updates stream, and barriers are echoed
//! back the way the real updates endpoint does.

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use super::metadata::{MetadataDoc, XenopsPci, XenopsVbd, XenopsVgpu, XenopsVif, XenopsVm, XenopsVusb};
use super::{
    DeviceId, PciStateInfo, UpdateId, UpdatesBarrier, VbdStateInfo, VgpuStateInfo, VifStateInfo,
    VmStateInfo, VusbStateInfo, XenopsClient, XenopsDomainType, XenopsError, XenopsPowerState,
    XenopsResult, XenopsTask, XenopsTaskId, XenopsTaskState, XvmId,
};

struct SimVm {
    doc: MetadataDoc,
    state: VmStateInfo,
    vbds: HashMap<String, VbdStateInfo>,
    vifs: HashMap<String, VifStateInfo>,
    pcis: HashMap<String, PciStateInfo>,
    vgpus: HashMap<String, VgpuStateInfo>,
    vusbs: HashMap<String, VusbStateInfo>,
}

struct SimInner {
    vms: HashMap<XvmId, SimVm>,
    tasks: HashMap<XenopsTaskId, XenopsTask>,
    /// (sequence, update); the sequence number doubles as the token
    events: Vec<(u64, UpdateId)>,
    /// (sequence the barrier was placed at, barrier id)
    barriers: Vec<(u64, u64)>,
    seq: u64,
    next_task: u64,
    next_domid: i64,
    clock: f64,
}

/// The simulated daemon
pub struct SimXenops {
    inner: Mutex<SimInner>,
    cond: Condvar,
    /// When set, updates_get fails as a broken transport would
    pub fail_updates: AtomicBool,
}

impl SimXenops {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SimInner {
                vms: HashMap::new(),
                tasks: HashMap::new(),
                events: Vec::new(),
                barriers: Vec::new(),
                seq: 0,
                next_task: 1,
                next_domid: 1,
                clock: 1.0,
            }),
            cond: Condvar::new(),
            fail_updates: AtomicBool::new(false),
        }
    }

    /// Force a VM's state from a test, emitting the update
    pub fn force_state(&self, id: &str, f: impl FnOnce(&mut VmStateInfo)) {
        let mut inner = self.inner.lock();
        if let Some(vm) = inner.vms.get_mut(id) {
            f(&mut vm.state);
            push_event(&mut inner, UpdateId::Vm(id.to_string()));
        }
        drop(inner);
        self.cond.notify_all();
    }

    pub fn power_state_of(&self, id: &str) -> Option<XenopsPowerState> {
        self.inner.lock().vms.get(id).map(|vm| vm.state.power_state)
    }

    fn with_vm<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut SimInner, &mut SimVm) -> XenopsResult<R>,
    ) -> XenopsResult<R> {
        let mut inner = self.inner.lock();
        let mut vm = inner.vms.remove(id).ok_or_else(|| XenopsError::DoesNotExist {
            kind: "VM".to_string(),
            id: id.to_string(),
        })?;
        let result = f(&mut inner, &mut vm);
        inner.vms.insert(id.to_string(), vm);
        drop(inner);
        self.cond.notify_all();
        result
    }

    /// Run a lifecycle effect under a completed task
    fn run_as_task(
        &self,
        dbg: &str,
        id: &str,
        f: impl FnOnce(&mut SimInner, &mut SimVm) -> XenopsResult<()>,
    ) -> XenopsResult<XenopsTaskId> {
        let outcome = self.with_vm(id, f);
        let mut inner = self.inner.lock();
        let task_id = format!("xtask-{}", inner.next_task);
        inner.next_task += 1;
        let state = match outcome {
            Ok(()) => XenopsTaskState::Completed { result: None },
            Err(e) => XenopsTaskState::Failed(e),
        };
        inner.tasks.insert(
            task_id.clone(),
            XenopsTask {
                id: task_id.clone(),
                dbg: dbg.to_string(),
                state,
                cancellable: true,
            },
        );
        drop(inner);
        self.cond.notify_all();
        Ok(task_id)
    }
}

impl Default for SimXenops {
    fn default() -> Self {
        Self::new()
    }
}

fn push_event(inner: &mut SimInner, update: UpdateId) {
    inner.seq += 1;
    let seq = inner.seq;
    inner.events.push((seq, update));
}

fn push_vm_and_devices(inner: &mut SimInner, id: &str) {
    let (vbds, vifs, pcis, vgpus, vusbs) = match inner.vms.get(id) {
        Some(vm) => (
            vm.vbds.keys().cloned().collect::<Vec<_>>(),
            vm.vifs.keys().cloned().collect::<Vec<_>>(),
            vm.pcis.keys().cloned().collect::<Vec<_>>(),
            vm.vgpus.keys().cloned().collect::<Vec<_>>(),
            vm.vusbs.keys().cloned().collect::<Vec<_>>(),
        ),
        None => return,
    };
    push_event(inner, UpdateId::Vm(id.to_string()));
    for device in vbds {
        push_event(inner, UpdateId::Vbd((id.to_string(), device)));
    }
    for device in vifs {
        push_event(inner, UpdateId::Vif((id.to_string(), device)));
    }
    for device in pcis {
        push_event(inner, UpdateId::Pci((id.to_string(), device)));
    }
    for device in vgpus {
        push_event(inner, UpdateId::Vgpu((id.to_string(), device)));
    }
    for device in vusbs {
        push_event(inner, UpdateId::Vusb((id.to_string(), device)));
    }
}

fn set_all_plugged(vm: &mut SimVm, plugged: bool) {
    for (device, state) in vm.vbds.iter_mut() {
        state.plugged = plugged;
        state.active = plugged;
        if plugged {
            let backed = vm
                .doc
                .vbds
                .iter()
                .any(|vbd| &vbd.id.1 == device && vbd.backend.is_some());
            state.media_present = backed;
        }
    }
    for state in vm.vifs.values_mut() {
        state.plugged = plugged;
        state.active = plugged;
    }
    for state in vm.pcis.values_mut() {
        state.plugged = plugged;
    }
    for state in vm.vgpus.values_mut() {
        state.plugged = plugged;
        state.active = plugged;
    }
    for state in vm.vusbs.values_mut() {
        state.plugged = plugged;
    }
}

impl XenopsClient for SimXenops {
    fn vm_import_metadata(&self, _dbg: &str, doc: &MetadataDoc) -> XenopsResult<XvmId> {
        let id = doc.vm.id.clone();
        let mut inner = self.inner.lock();
        match inner.vms.get_mut(&id) {
            Some(vm) => {
                vm.doc = doc.clone();
                // Devices may have been added or removed
                for vbd in &doc.vbds {
                    vm.vbds.entry(vbd.id.1.clone()).or_default();
                }
                for vif in &doc.vifs {
                    vm.vifs.entry(vif.id.1.clone()).or_default();
                }
            }
            None => {
                // Importing the document of a suspended guest yields a
                // suspended guest, ready to resume
                let power_state = if doc.last_booted.is_some() {
                    XenopsPowerState::Suspended
                } else {
                    XenopsPowerState::Halted
                };
                let vm = SimVm {
                    state: VmStateInfo {
                        power_state,
                        domain_type: doc.vm.domain_type.into(),
                        ..Default::default()
                    },
                    vbds: doc.vbds.iter().map(|v| (v.id.1.clone(), Default::default())).collect(),
                    vifs: doc.vifs.iter().map(|v| (v.id.1.clone(), Default::default())).collect(),
                    pcis: doc.pcis.iter().map(|v| (v.id.1.clone(), Default::default())).collect(),
                    vgpus: doc.vgpus.iter().map(|v| (v.id.1.clone(), Default::default())).collect(),
                    vusbs: doc.vusbs.iter().map(|v| (v.id.1.clone(), Default::default())).collect(),
                    doc: doc.clone(),
                };
                inner.vms.insert(id.clone(), vm);
            }
        }
        push_event(&mut inner, UpdateId::Vm(id.clone()));
        drop(inner);
        self.cond.notify_all();
        Ok(id)
    }

    fn vm_export_metadata(&self, _dbg: &str, id: &str) -> XenopsResult<MetadataDoc> {
        let inner = self.inner.lock();
        let vm = inner.vms.get(id).ok_or_else(|| XenopsError::DoesNotExist {
            kind: "VM".to_string(),
            id: id.to_string(),
        })?;
        let mut doc = vm.doc.clone();
        if vm.state.power_state == XenopsPowerState::Suspended {
            doc.last_booted = serde_json::to_string(&vm.state).ok();
        }
        Ok(doc)
    }

    fn vm_remove(&self, _dbg: &str, id: &str) -> XenopsResult<()> {
        let mut inner = self.inner.lock();
        let Some(vm) = inner.vms.get(id) else {
            return Err(XenopsError::DoesNotExist {
                kind: "VM".to_string(),
                id: id.to_string(),
            });
        };
        if matches!(
            vm.state.power_state,
            XenopsPowerState::Running | XenopsPowerState::Paused
        ) {
            return Err(XenopsError::BadPowerState {
                expected: "halted".to_string(),
                found: "running".to_string(),
            });
        }
        inner.vms.remove(id);
        Ok(())
    }

    fn vm_start(&self, dbg: &str, id: &str, paused: bool) -> XenopsResult<XenopsTaskId> {
        self.run_as_task(dbg, id, |inner, vm| {
            if vm.state.power_state != XenopsPowerState::Halted
                && vm.state.power_state != XenopsPowerState::Suspended
            {
                return Err(XenopsError::BadPowerState {
                    expected: "halted".to_string(),
                    found: format!("{:?}", vm.state.power_state).to_lowercase(),
                });
            }
            vm.state.power_state = if paused {
                XenopsPowerState::Paused
            } else {
                XenopsPowerState::Running
            };
            vm.state.domids = vec![inner.next_domid];
            inner.next_domid += 1;
            inner.clock += 1.0;
            vm.state.last_start_time = inner.clock;
            vm.state.domain_type = match vm.doc.vm.domain_type {
                crate::db::models::DomainType::Hvm => XenopsDomainType::Hvm,
                crate::db::models::DomainType::Pv => XenopsDomainType::Pv,
                crate::db::models::DomainType::PvInPvh => XenopsDomainType::PvInPvh,
                crate::db::models::DomainType::Pvh => XenopsDomainType::Pvh,
                crate::db::models::DomainType::Unspecified => XenopsDomainType::Hvm,
            };
            vm.state.featureset = "sim-featureset".to_string();
            set_all_plugged(vm, true);
            push_all(inner, vm);
            Ok(())
        })
    }

    fn vm_shutdown(
        &self,
        dbg: &str,
        id: &str,
        _timeout: Option<Duration>,
    ) -> XenopsResult<XenopsTaskId> {
        self.run_as_task(dbg, id, |inner, vm| {
            vm.state.power_state = XenopsPowerState::Halted;
            vm.state.domids = Vec::new();
            set_all_plugged(vm, false);
            push_all(inner, vm);
            Ok(())
        })
    }

    fn vm_reboot(
        &self,
        dbg: &str,
        id: &str,
        _timeout: Option<Duration>,
    ) -> XenopsResult<XenopsTaskId> {
        self.run_as_task(dbg, id, |inner, vm| {
            if vm.state.power_state != XenopsPowerState::Running {
                return Err(XenopsError::BadPowerState {
                    expected: "running".to_string(),
                    found: format!("{:?}", vm.state.power_state).to_lowercase(),
                });
            }
            vm.state.domids = vec![inner.next_domid];
            inner.next_domid += 1;
            inner.clock += 1.0;
            vm.state.last_start_time = inner.clock;
            push_all(inner, vm);
            Ok(())
        })
    }

    fn vm_pause(&self, dbg: &str, id: &str) -> XenopsResult<XenopsTaskId> {
        self.run_as_task(dbg, id, |inner, vm| {
            vm.state.power_state = XenopsPowerState::Paused;
            push_all(inner, vm);
            Ok(())
        })
    }

    fn vm_unpause(&self, dbg: &str, id: &str) -> XenopsResult<XenopsTaskId> {
        self.run_as_task(dbg, id, |inner, vm| {
            vm.state.power_state = XenopsPowerState::Running;
            push_all(inner, vm);
            Ok(())
        })
    }

    fn vm_suspend(&self, dbg: &str, id: &str, _disk: &str) -> XenopsResult<XenopsTaskId> {
        self.run_as_task(dbg, id, |inner, vm| {
            if vm.state.power_state != XenopsPowerState::Running {
                return Err(XenopsError::BadPowerState {
                    expected: "running".to_string(),
                    found: format!("{:?}", vm.state.power_state).to_lowercase(),
                });
            }
            vm.state.power_state = XenopsPowerState::Suspended;
            vm.state.domids = Vec::new();
            // Device attachment is preserved across suspend
            push_all(inner, vm);
            Ok(())
        })
    }

    fn vm_resume(&self, dbg: &str, id: &str, _disk: &str) -> XenopsResult<XenopsTaskId> {
        self.run_as_task(dbg, id, |inner, vm| {
            if vm.state.power_state != XenopsPowerState::Suspended {
                return Err(XenopsError::BadPowerState {
                    expected: "suspended".to_string(),
                    found: format!("{:?}", vm.state.power_state).to_lowercase(),
                });
            }
            vm.state.power_state = XenopsPowerState::Running;
            vm.state.domids = vec![inner.next_domid];
            inner.next_domid += 1;
            push_all(inner, vm);
            Ok(())
        })
    }

    fn vm_s3suspend(&self, dbg: &str, id: &str) -> XenopsResult<XenopsTaskId> {
        self.vm_pause(dbg, id)
    }

    fn vm_s3resume(&self, dbg: &str, id: &str) -> XenopsResult<XenopsTaskId> {
        self.vm_unpause(dbg, id)
    }

    fn vm_set_xsdata(
        &self,
        _dbg: &str,
        id: &str,
        _xsdata: &HashMap<String, String>,
    ) -> XenopsResult<()> {
        self.with_vm(id, |_, _| Ok(()))
    }

    fn vm_set_vcpus(&self, _dbg: &str, id: &str, count: i64) -> XenopsResult<()> {
        self.with_vm(id, |inner, vm| {
            vm.state.vcpu_target = count;
            let id = vm.doc.vm.id.clone();
            push_event(inner, UpdateId::Vm(id));
            Ok(())
        })
    }

    fn vm_set_shadow_multiplier(&self, _dbg: &str, id: &str, _multiplier: f64) -> XenopsResult<()> {
        self.with_vm(id, |_, _| Ok(()))
    }

    fn vm_set_memory_dynamic_range(
        &self,
        _dbg: &str,
        id: &str,
        _min: i64,
        max: i64,
    ) -> XenopsResult<()> {
        self.with_vm(id, |inner, vm| {
            vm.state.memory_target = max;
            let id = vm.doc.vm.id.clone();
            push_event(inner, UpdateId::Vm(id));
            Ok(())
        })
    }

    fn vm_stat(&self, _dbg: &str, id: &str) -> XenopsResult<(XenopsVm, VmStateInfo)> {
        let inner = self.inner.lock();
        inner
            .vms
            .get(id)
            .map(|vm| (vm.doc.vm.clone(), vm.state.clone()))
            .ok_or_else(|| XenopsError::DoesNotExist {
                kind: "VM".to_string(),
                id: id.to_string(),
            })
    }

    fn vm_exists(&self, _dbg: &str, id: &str) -> XenopsResult<bool> {
        Ok(self.inner.lock().vms.contains_key(id))
    }

    fn vm_list(&self, _dbg: &str) -> XenopsResult<Vec<(XenopsVm, VmStateInfo)>> {
        Ok(self
            .inner
            .lock()
            .vms
            .values()
            .map(|vm| (vm.doc.vm.clone(), vm.state.clone()))
            .collect())
    }

    fn vm_run_script(&self, _dbg: &str, id: &str, _script: &str) -> XenopsResult<String> {
        self.with_vm(id, |_, _| Ok(String::new()))
    }

    fn vm_request_rdp(&self, _dbg: &str, id: &str, _enabled: bool) -> XenopsResult<()> {
        self.with_vm(id, |_, _| Ok(()))
    }

    fn vbd_add(&self, _dbg: &str, vbd: &XenopsVbd) -> XenopsResult<()> {
        self.with_vm(&vbd.id.0.clone(), |inner, vm| {
            vm.vbds.entry(vbd.id.1.clone()).or_default();
            vm.doc.vbds.retain(|v| v.id != vbd.id);
            vm.doc.vbds.push(vbd.clone());
            push_event(inner, UpdateId::Vbd(vbd.id.clone()));
            Ok(())
        })
    }

    fn vbd_remove(&self, _dbg: &str, id: &DeviceId) -> XenopsResult<()> {
        self.with_vm(&id.0.clone(), |inner, vm| {
            vm.vbds.remove(&id.1);
            vm.doc.vbds.retain(|v| &v.id != id);
            push_event(inner, UpdateId::Vbd(id.clone()));
            Ok(())
        })
    }

    fn vbd_plug(&self, dbg: &str, id: &DeviceId) -> XenopsResult<XenopsTaskId> {
        let device = id.clone();
        self.run_as_task(dbg, &id.0, move |inner, vm| {
            let backed = vm
                .doc
                .vbds
                .iter()
                .any(|vbd| vbd.id == device && vbd.backend.is_some());
            let state = vm.vbds.entry(device.1.clone()).or_default();
            state.plugged = true;
            state.active = true;
            state.media_present = backed;
            push_event(inner, UpdateId::Vbd(device.clone()));
            Ok(())
        })
    }

    fn vbd_unplug(&self, dbg: &str, id: &DeviceId, _force: bool) -> XenopsResult<XenopsTaskId> {
        let device = id.clone();
        self.run_as_task(dbg, &id.0, move |inner, vm| {
            let state = vm.vbds.entry(device.1.clone()).or_default();
            state.plugged = false;
            state.active = false;
            push_event(inner, UpdateId::Vbd(device.clone()));
            Ok(())
        })
    }

    fn vbd_insert(&self, dbg: &str, id: &DeviceId, disk: &str) -> XenopsResult<XenopsTaskId> {
        let device = id.clone();
        let disk = disk.to_string();
        self.run_as_task(dbg, &id.0, move |inner, vm| {
            if let Some(vbd) = vm.doc.vbds.iter_mut().find(|v| v.id == device) {
                let mut parts = disk.splitn(2, '/');
                let sr = parts.next().unwrap_or_default().to_string();
                let location = parts.next().unwrap_or_default().to_string();
                vbd.backend = Some((sr, location));
            }
            let state = vm.vbds.entry(device.1.clone()).or_default();
            state.media_present = true;
            push_event(inner, UpdateId::Vbd(device.clone()));
            Ok(())
        })
    }

    fn vbd_eject(&self, dbg: &str, id: &DeviceId) -> XenopsResult<XenopsTaskId> {
        let device = id.clone();
        self.run_as_task(dbg, &id.0, move |inner, vm| {
            if let Some(vbd) = vm.doc.vbds.iter_mut().find(|v| v.id == device) {
                vbd.backend = None;
            }
            let state = vm.vbds.entry(device.1.clone()).or_default();
            state.media_present = false;
            push_event(inner, UpdateId::Vbd(device.clone()));
            Ok(())
        })
    }

    fn vbd_stat(&self, _dbg: &str, id: &DeviceId) -> XenopsResult<(XenopsVbd, VbdStateInfo)> {
        let inner = self.inner.lock();
        let vm = inner.vms.get(&id.0).ok_or_else(|| XenopsError::DoesNotExist {
            kind: "VM".to_string(),
            id: id.0.clone(),
        })?;
        let doc = vm
            .doc
            .vbds
            .iter()
            .find(|v| &v.id == id)
            .cloned()
            .ok_or_else(|| XenopsError::DoesNotExist {
                kind: "VBD".to_string(),
                id: format!("{}/{}", id.0, id.1),
            })?;
        let state = vm.vbds.get(&id.1).copied().unwrap_or_default();
        Ok((doc, state))
    }

    fn vif_add(&self, _dbg: &str, vif: &XenopsVif) -> XenopsResult<()> {
        self.with_vm(&vif.id.0.clone(), |inner, vm| {
            vm.vifs.entry(vif.id.1.clone()).or_default();
            vm.doc.vifs.retain(|v| v.id != vif.id);
            vm.doc.vifs.push(vif.clone());
            push_event(inner, UpdateId::Vif(vif.id.clone()));
            Ok(())
        })
    }

    fn vif_remove(&self, _dbg: &str, id: &DeviceId) -> XenopsResult<()> {
        self.with_vm(&id.0.clone(), |inner, vm| {
            vm.vifs.remove(&id.1);
            vm.doc.vifs.retain(|v| &v.id != id);
            push_event(inner, UpdateId::Vif(id.clone()));
            Ok(())
        })
    }

    fn vif_plug(&self, dbg: &str, id: &DeviceId) -> XenopsResult<XenopsTaskId> {
        let device = id.clone();
        self.run_as_task(dbg, &id.0, move |inner, vm| {
            let state = vm.vifs.entry(device.1.clone()).or_default();
            state.plugged = true;
            state.active = true;
            push_event(inner, UpdateId::Vif(device.clone()));
            Ok(())
        })
    }

    fn vif_unplug(&self, dbg: &str, id: &DeviceId, _force: bool) -> XenopsResult<XenopsTaskId> {
        let device = id.clone();
        self.run_as_task(dbg, &id.0, move |inner, vm| {
            let state = vm.vifs.entry(device.1.clone()).or_default();
            state.plugged = false;
            state.active = false;
            push_event(inner, UpdateId::Vif(device.clone()));
            Ok(())
        })
    }

    fn vif_move(&self, _dbg: &str, id: &DeviceId, network: &str) -> XenopsResult<()> {
        let network = network.to_string();
        self.with_vm(&id.0.clone(), |inner, vm| {
            if let Some(vif) = vm.doc.vifs.iter_mut().find(|v| &v.id == id) {
                vif.bridge = network.clone();
            }
            push_event(inner, UpdateId::Vif(id.clone()));
            Ok(())
        })
    }

    fn vif_set_locking_mode(&self, _dbg: &str, id: &DeviceId, _mode: &str) -> XenopsResult<()> {
        self.with_vm(&id.0.clone(), |_, _| Ok(()))
    }

    fn vif_set_ipv4_configuration(
        &self,
        _dbg: &str,
        id: &DeviceId,
        _config: &str,
    ) -> XenopsResult<()> {
        self.with_vm(&id.0.clone(), |_, _| Ok(()))
    }

    fn vif_set_ipv6_configuration(
        &self,
        _dbg: &str,
        id: &DeviceId,
        _config: &str,
    ) -> XenopsResult<()> {
        self.with_vm(&id.0.clone(), |_, _| Ok(()))
    }

    fn vif_stat(&self, _dbg: &str, id: &DeviceId) -> XenopsResult<(XenopsVif, VifStateInfo)> {
        let inner = self.inner.lock();
        let vm = inner.vms.get(&id.0).ok_or_else(|| XenopsError::DoesNotExist {
            kind: "VM".to_string(),
            id: id.0.clone(),
        })?;
        let doc = vm
            .doc
            .vifs
            .iter()
            .find(|v| &v.id == id)
            .cloned()
            .ok_or_else(|| XenopsError::DoesNotExist {
                kind: "VIF".to_string(),
                id: format!("{}/{}", id.0, id.1),
            })?;
        let state = vm.vifs.get(&id.1).copied().unwrap_or_default();
        Ok((doc, state))
    }

    fn pci_stat(&self, _dbg: &str, id: &DeviceId) -> XenopsResult<(XenopsPci, PciStateInfo)> {
        let inner = self.inner.lock();
        let vm = inner.vms.get(&id.0).ok_or_else(|| XenopsError::DoesNotExist {
            kind: "VM".to_string(),
            id: id.0.clone(),
        })?;
        let doc = vm
            .doc
            .pcis
            .iter()
            .find(|v| &v.id == id)
            .cloned()
            .ok_or_else(|| XenopsError::DoesNotExist {
                kind: "PCI".to_string(),
                id: format!("{}/{}", id.0, id.1),
            })?;
        let state = vm.pcis.get(&id.1).copied().unwrap_or_default();
        Ok((doc, state))
    }

    fn vgpu_remove(&self, _dbg: &str, id: &DeviceId) -> XenopsResult<()> {
        self.with_vm(&id.0.clone(), |inner, vm| {
            vm.vgpus.remove(&id.1);
            vm.doc.vgpus.retain(|v| &v.id != id);
            push_event(inner, UpdateId::Vgpu(id.clone()));
            Ok(())
        })
    }

    fn vgpu_stat(&self, _dbg: &str, id: &DeviceId) -> XenopsResult<(XenopsVgpu, VgpuStateInfo)> {
        let inner = self.inner.lock();
        let vm = inner.vms.get(&id.0).ok_or_else(|| XenopsError::DoesNotExist {
            kind: "VM".to_string(),
            id: id.0.clone(),
        })?;
        let doc = vm
            .doc
            .vgpus
            .iter()
            .find(|v| &v.id == id)
            .cloned()
            .ok_or_else(|| XenopsError::DoesNotExist {
                kind: "VGPU".to_string(),
                id: format!("{}/{}", id.0, id.1),
            })?;
        let state = vm.vgpus.get(&id.1).copied().unwrap_or_default();
        Ok((doc, state))
    }

    fn vusb_unplug(&self, dbg: &str, id: &DeviceId) -> XenopsResult<XenopsTaskId> {
        let device = id.clone();
        self.run_as_task(dbg, &id.0, move |inner, vm| {
            let state = vm.vusbs.entry(device.1.clone()).or_default();
            state.plugged = false;
            push_event(inner, UpdateId::Vusb(device.clone()));
            Ok(())
        })
    }

    fn vusb_stat(&self, _dbg: &str, id: &DeviceId) -> XenopsResult<(XenopsVusb, VusbStateInfo)> {
        let inner = self.inner.lock();
        let vm = inner.vms.get(&id.0).ok_or_else(|| XenopsError::DoesNotExist {
            kind: "VM".to_string(),
            id: id.0.clone(),
        })?;
        let doc = vm
            .doc
            .vusbs
            .iter()
            .find(|v| &v.id == id)
            .cloned()
            .ok_or_else(|| XenopsError::DoesNotExist {
                kind: "VUSB".to_string(),
                id: format!("{}/{}", id.0, id.1),
            })?;
        let state = vm.vusbs.get(&id.1).copied().unwrap_or_default();
        Ok((doc, state))
    }

    fn host_update_guest_agent_features(
        &self,
        _dbg: &str,
        _features: &HashMap<String, String>,
    ) -> XenopsResult<()> {
        Ok(())
    }

    fn host_set_numa_affinity_policy(&self, _dbg: &str, _policy: &str) -> XenopsResult<()> {
        Ok(())
    }

    fn observer_create(&self, _dbg: &str, _uuid: &str) -> XenopsResult<()> {
        Ok(())
    }

    fn observer_destroy(&self, _dbg: &str, _uuid: &str) -> XenopsResult<()> {
        Ok(())
    }

    fn observer_set_enabled(&self, _dbg: &str, _uuid: &str, _enabled: bool) -> XenopsResult<()> {
        Ok(())
    }

    fn observer_set_attributes(
        &self,
        _dbg: &str,
        _uuid: &str,
        _attributes: &HashMap<String, String>,
    ) -> XenopsResult<()> {
        Ok(())
    }

    fn observer_set_endpoints(
        &self,
        _dbg: &str,
        _uuid: &str,
        _endpoints: &[String],
    ) -> XenopsResult<()> {
        Ok(())
    }

    fn observer_init(&self, _dbg: &str) -> XenopsResult<()> {
        Ok(())
    }

    fn task_stat(&self, _dbg: &str, id: &str) -> XenopsResult<XenopsTask> {
        self.inner
            .lock()
            .tasks
            .get(id)
            .cloned()
            .ok_or_else(|| XenopsError::DoesNotExist {
                kind: "Task".to_string(),
                id: id.to_string(),
            })
    }

    fn task_cancel(&self, _dbg: &str, id: &str) -> XenopsResult<()> {
        let mut inner = self.inner.lock();
        if let Some(task) = inner.tasks.get_mut(id) {
            if matches!(task.state, XenopsTaskState::Pending(_)) {
                task.state = XenopsTaskState::Failed(XenopsError::Cancelled(id.to_string()));
            }
        }
        Ok(())
    }

    fn task_destroy(&self, _dbg: &str, id: &str) -> XenopsResult<()> {
        self.inner.lock().tasks.remove(id);
        Ok(())
    }

    fn task_destroy_on_finish(&self, dbg: &str, id: &str) -> XenopsResult<()> {
        self.task_destroy(dbg, id)
    }

    fn updates_get(
        &self,
        _dbg: &str,
        from: &str,
        timeout: Duration,
    ) -> XenopsResult<(Vec<UpdatesBarrier>, Vec<UpdateId>, String)> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(XenopsError::Transport("simulated failure".to_string()));
        }
        let from: u64 = from.parse().unwrap_or(0);
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            let has_events = inner.events.iter().any(|(seq, _)| *seq > from);
            let has_barriers = inner.barriers.iter().any(|(seq, _)| *seq > from);
            if has_events || has_barriers {
                // Coalesce: deliver each id once, in first-seen order
                let mut events: Vec<UpdateId> = Vec::new();
                for (seq, update) in &inner.events {
                    if *seq > from && !events.contains(update) {
                        events.push(update.clone());
                    }
                }
                let barriers: Vec<UpdatesBarrier> = inner
                    .barriers
                    .iter()
                    .filter(|(seq, _)| *seq > from)
                    .map(|(_, id)| UpdatesBarrier {
                        id: *id,
                        events: Vec::new(),
                    })
                    .collect();
                let next = inner.seq.to_string();
                if self.fail_updates.load(Ordering::SeqCst) {
                    return Err(XenopsError::Transport("simulated failure".to_string()));
                }
                return Ok((barriers, events, next));
            }
            if Instant::now() >= deadline {
                return Ok((Vec::new(), Vec::new(), inner.seq.to_string()));
            }
            self.cond.wait_until(&mut inner, deadline);
        }
    }

    fn updates_refresh_vm(&self, _dbg: &str, id: &str) -> XenopsResult<()> {
        let mut inner = self.inner.lock();
        if !inner.vms.contains_key(id) {
            return Err(XenopsError::DoesNotExist {
                kind: "VM".to_string(),
                id: id.to_string(),
            });
        }
        push_vm_and_devices(&mut inner, id);
        drop(inner);
        self.cond.notify_all();
        Ok(())
    }

    fn updates_inject_barrier(&self, _dbg: &str, _vm: &str, barrier_id: u64) -> XenopsResult<()> {
        let mut inner = self.inner.lock();
        inner.seq += 1;
        let seq = inner.seq;
        inner.barriers.push((seq, barrier_id));
        drop(inner);
        self.cond.notify_all();
        Ok(())
    }

    fn updates_remove_barrier(&self, _dbg: &str, barrier_id: u64) -> XenopsResult<()> {
        self.inner.lock().barriers.retain(|(_, id)| *id != barrier_id);
        Ok(())
    }

    fn updates_last_id(&self, _dbg: &str) -> XenopsResult<String> {
        Ok(self.inner.lock().seq.to_string())
    }
}

/// Emit updates for a VM and all of its devices; callable while the VM is
/// checked out of the map
fn push_all(inner: &mut SimInner, vm: &SimVm) {
    let id = vm.doc.vm.id.clone();
    push_event(inner, UpdateId::Vm(id.clone()));
    for device in vm.vbds.keys() {
        push_event(inner, UpdateId::Vbd((id.clone(), device.clone())));
    }
    for device in vm.vifs.keys() {
        push_event(inner, UpdateId::Vif((id.clone(), device.clone())));
    }
    for device in vm.pcis.keys() {
        push_event(inner, UpdateId::Pci((id.clone(), device.clone())));
    }
    for device in vm.vgpus.keys() {
        push_event(inner, UpdateId::Vgpu((id.clone(), device.clone())));
    }
    for device in vm.vusbs.keys() {
        push_event(inner, UpdateId::Vusb((id.clone(), device.clone())));
    }
}

impl From<crate::db::models::DomainType> for XenopsDomainType {
    fn from(value: crate::db::models::DomainType) -> Self {
        match value {
            crate::db::models::DomainType::Hvm => XenopsDomainType::Hvm,
            crate::db::models::DomainType::Pv => XenopsDomainType::Pv,
            crate::db::models::DomainType::PvInPvh => XenopsDomainType::PvInPvh,
            crate::db::models::DomainType::Pvh => XenopsDomainType::Pvh,
            crate::db::models::DomainType::Unspecified => XenopsDomainType::Undefined,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{ActionAfter, DomainType};
    use crate::xenops::metadata::Firmware;

    fn doc(id: &str) -> MetadataDoc {
        MetadataDoc {
            vm: XenopsVm {
                id: id.to_string(),
                name: "sim".to_string(),
                vcpus: 1,
                vcpus_max: 1,
                memory_dynamic_min: 0,
                memory_dynamic_max: 0,
                memory_static_max: 0,
                domain_type: DomainType::Hvm,
                firmware: Firmware::Uefi,
                platform: HashMap::new(),
                nvram: HashMap::new(),
                has_vtpm: false,
                on_crash: ActionAfter::Restart,
            },
            vbds: Vec::new(),
            vifs: Vec::new(),
            pcis: Vec::new(),
            vgpus: Vec::new(),
            vusbs: Vec::new(),
            last_booted: None,
        }
    }

    #[test]
    fn test_import_start_shutdown() {
        let sim = SimXenops::new();
        let id = sim.vm_import_metadata("dbg", &doc("u-1")).unwrap();
        assert_eq!(id, "u-1");
        assert_eq!(sim.power_state_of("u-1"), Some(XenopsPowerState::Halted));

        let task = sim.vm_start("dbg", "u-1", false).unwrap();
        let stat = sim.task_stat("dbg", &task).unwrap();
        assert!(matches!(stat.state, XenopsTaskState::Completed { .. }));
        assert_eq!(sim.power_state_of("u-1"), Some(XenopsPowerState::Running));

        // A running VM's metadata cannot be removed
        assert!(matches!(
            sim.vm_remove("dbg", "u-1"),
            Err(XenopsError::BadPowerState { .. })
        ));

        let task = sim.vm_shutdown("dbg", "u-1", None).unwrap();
        let stat = sim.task_stat("dbg", &task).unwrap();
        assert!(matches!(stat.state, XenopsTaskState::Completed { .. }));
        assert!(sim.vm_remove("dbg", "u-1").is_ok());
    }

    #[test]
    fn test_updates_stream_and_barriers() {
        let sim = SimXenops::new();
        sim.vm_import_metadata("dbg", &doc("u-2")).unwrap();
        let (_, events, token) = sim
            .updates_get("dbg", "", Duration::from_millis(10))
            .unwrap();
        assert!(events.contains(&UpdateId::Vm("u-2".to_string())));

        sim.updates_inject_barrier("dbg", "u-2", 99).unwrap();
        let (barriers, _, _) = sim
            .updates_get("dbg", &token, Duration::from_millis(10))
            .unwrap();
        assert_eq!(barriers.len(), 1);
        assert_eq!(barriers[0].id, 99);
    }

    #[test]
    fn test_suspend_preserves_plugged_and_exports_boot_record() {
        let sim = SimXenops::new();
        let mut d = doc("u-3");
        d.vbds.push(XenopsVbd {
            id: ("u-3".to_string(), "xvda".to_string()),
            backend: Some(("sr".to_string(), "loc".to_string())),
            mode: crate::db::models::VbdMode::Rw,
            removable: false,
            bootable: true,
        });
        sim.vm_import_metadata("dbg", &d).unwrap();
        sim.vm_start("dbg", "u-3", false).unwrap();
        sim.vm_suspend("dbg", "u-3", "suspend-disk").unwrap();
        assert_eq!(sim.power_state_of("u-3"), Some(XenopsPowerState::Suspended));

        let (_, state) = sim
            .vbd_stat("dbg", &("u-3".to_string(), "xvda".to_string()))
            .unwrap();
        assert!(state.plugged);

        let exported = sim.vm_export_metadata("dbg", "u-3").unwrap();
        assert!(exported.last_booted.is_some());
    }

    #[test]
    fn test_transport_failure_flag() {
        let sim = SimXenops::new();
        sim.fail_updates.store(true, Ordering::SeqCst);
        assert!(matches!(
            sim.updates_get("dbg", "", Duration::from_millis(5)),
            Err(XenopsError::Transport(_))
        ));
    }
}
