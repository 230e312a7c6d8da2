//! Adapter Caches
//!
//! Two views held under one mutex:
//! - xapi view: per VM, the metadata string most recently pushed to the
//!   daemon; a recomputed string equal to the cached one means no push
//! - daemon view: per object, the last state observed from the updates
//!   endpoint, used for field-level diffing so only changed fields are
//!   written back to the database

use parking_lot::Mutex;
use std::collections::HashMap;

use super::{
    PciStateInfo, UpdateId, VbdStateInfo, VgpuStateInfo, VifStateInfo, VmStateInfo, VusbStateInfo,
};

/// Last observed state per object
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectState {
    Vm(VmStateInfo),
    Vbd(VbdStateInfo),
    Vif(VifStateInfo),
    Pci(PciStateInfo),
    Vgpu(VgpuStateInfo),
    Vusb(VusbStateInfo),
}

#[derive(Default)]
struct CacheInner {
    /// VM uuid to last pushed metadata string; None marks a registered VM
    /// that has not been pushed yet
    xapi: HashMap<String, Option<String>>,
    xenops: HashMap<UpdateId, ObjectState>,
}

/// The two adapter caches
pub struct Caches {
    inner: Mutex<CacheInner>,
}

impl Caches {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Make room for a VM in both views
    pub fn register(&self, vm_uuid: &str) {
        let mut inner = self.inner.lock();
        inner.xapi.entry(vm_uuid.to_string()).or_insert(None);
    }

    /// Drop everything known about a VM
    pub fn unregister(&self, vm_uuid: &str) {
        let mut inner = self.inner.lock();
        inner.xapi.remove(vm_uuid);
        inner.xenops.retain(|id, _| id.vm_id() != Some(vm_uuid));
    }

    pub fn is_registered(&self, vm_uuid: &str) -> bool {
        self.inner.lock().xapi.contains_key(vm_uuid)
    }

    /// The metadata string last pushed for a VM
    pub fn pushed_metadata(&self, vm_uuid: &str) -> Option<String> {
        self.inner.lock().xapi.get(vm_uuid).cloned().flatten()
    }

    pub fn set_pushed_metadata(&self, vm_uuid: &str, serialised: String) {
        self.inner
            .lock()
            .xapi
            .insert(vm_uuid.to_string(), Some(serialised));
    }

    /// Last daemon-side state for an object
    pub fn observed(&self, id: &UpdateId) -> Option<ObjectState> {
        self.inner.lock().xenops.get(id).cloned()
    }

    pub fn set_observed(&self, id: UpdateId, state: ObjectState) {
        self.inner.lock().xenops.insert(id, state);
    }

    pub fn clear_observed(&self, id: &UpdateId) {
        self.inner.lock().xenops.remove(id);
    }

    /// True when the state differs from what was last observed
    pub fn changed(&self, id: &UpdateId, state: &ObjectState) -> bool {
        self.inner.lock().xenops.get(id) != Some(state)
    }
}

impl Default for Caches {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_unregister() {
        let caches = Caches::new();
        caches.register("u1");
        assert!(caches.is_registered("u1"));
        assert_eq!(caches.pushed_metadata("u1"), None);

        caches.set_pushed_metadata("u1", "doc".to_string());
        assert_eq!(caches.pushed_metadata("u1").as_deref(), Some("doc"));

        caches.set_observed(
            UpdateId::Vbd(("u1".to_string(), "xvda".to_string())),
            ObjectState::Vbd(VbdStateInfo::default()),
        );
        caches.unregister("u1");
        assert!(!caches.is_registered("u1"));
        assert!(caches
            .observed(&UpdateId::Vbd(("u1".to_string(), "xvda".to_string())))
            .is_none());
    }

    #[test]
    fn test_changed_detection() {
        let caches = Caches::new();
        let id = UpdateId::Vif(("u1".to_string(), "0".to_string()));
        let state = ObjectState::Vif(VifStateInfo {
            plugged: true,
            active: true,
        });
        assert!(caches.changed(&id, &state));
        caches.set_observed(id.clone(), state.clone());
        assert!(!caches.changed(&id, &state));
        let other = ObjectState::Vif(VifStateInfo {
            plugged: false,
            active: false,
        });
        assert!(caches.changed(&id, &other));
    }
}
