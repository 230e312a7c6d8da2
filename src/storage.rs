//! Storage Adapter (SMAPI)
//!
//! Contract with the storage daemon: repository stat/scan/probe and the
//! per-disk operations. Repositories are addressed by UUID and disks by
//! (sr_uuid, location); the database reference never crosses this boundary.
//!
//! `sim` provides an in-memory backend used by the test suite and by the
//! debug dummy-data mode.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::db::models::{SmCapability, VdiType};

/// Storage daemon failures
#[derive(Debug, Clone, thiserror::Error)]
pub enum SmError {
    /// The backend does not implement the requested operation
    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("no such SR: {0}")]
    SrDoesNotExist(String),

    #[error("no such VDI: {0}")]
    VdiDoesNotExist(String),

    #[error("backend failure {0}: {1:?}")]
    BackendFailure(String, Vec<String>),

    #[error("storage transport failure: {0}")]
    Transport(String),
}

pub type SmResult<T> = Result<T, SmError>;

/// Repository state as reported by the backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmSrStat {
    pub name_label: String,
    pub name_description: String,
    pub physical_size: i64,
    pub physical_utilisation: i64,
    pub virtual_allocation: i64,
    pub clustered: bool,
    pub capabilities: Vec<SmCapability>,
}

/// Disk state as reported by the backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmVdiInfo {
    pub location: String,
    pub name_label: String,
    pub name_description: String,
    pub vdi_type: VdiType,
    pub virtual_size: i64,
    pub physical_utilisation: i64,
    pub read_only: bool,
    pub sharable: bool,
    pub cbt_enabled: bool,
    pub is_a_snapshot: bool,
    /// Location of the disk this one is a snapshot of
    pub snapshot_of: Option<String>,
    pub sm_config: HashMap<String, String>,
}

/// RPC surface of the storage daemon
pub trait SmClient: Send + Sync {
    fn sr_stat(&self, dbg: &str, sr_uuid: &str) -> SmResult<SmSrStat>;
    fn sr_scan(&self, dbg: &str, sr_uuid: &str) -> SmResult<Vec<SmVdiInfo>>;
    fn sr_probe(&self, dbg: &str, device_config: &HashMap<String, String>) -> SmResult<Vec<String>>;
    fn sr_set_name_label(&self, dbg: &str, sr_uuid: &str, label: &str) -> SmResult<()>;
    fn sr_set_name_description(&self, dbg: &str, sr_uuid: &str, description: &str) -> SmResult<()>;

    fn vdi_create(
        &self,
        dbg: &str,
        sr_uuid: &str,
        name_label: &str,
        virtual_size: i64,
        vdi_type: VdiType,
    ) -> SmResult<SmVdiInfo>;
    fn vdi_destroy(&self, dbg: &str, sr_uuid: &str, location: &str) -> SmResult<()>;
    fn vdi_data_destroy(&self, dbg: &str, sr_uuid: &str, location: &str) -> SmResult<()>;
    fn vdi_clone(&self, dbg: &str, sr_uuid: &str, location: &str) -> SmResult<SmVdiInfo>;
    fn vdi_snapshot(&self, dbg: &str, sr_uuid: &str, location: &str) -> SmResult<SmVdiInfo>;
    fn vdi_resize(&self, dbg: &str, sr_uuid: &str, location: &str, new_size: i64) -> SmResult<i64>;
    /// Block-attach copy inside the control domain; the fallback when the
    /// backend cannot clone
    fn vdi_copy(&self, dbg: &str, sr_uuid: &str, location: &str) -> SmResult<SmVdiInfo>;
    fn vdi_set_persistent(
        &self,
        dbg: &str,
        sr_uuid: &str,
        location: &str,
        persistent: bool,
    ) -> SmResult<()>;
    fn vdi_introduce(&self, dbg: &str, sr_uuid: &str, location: &str) -> SmResult<SmVdiInfo>;
    fn vdi_enable_cbt(&self, dbg: &str, sr_uuid: &str, location: &str) -> SmResult<()>;
    fn vdi_disable_cbt(&self, dbg: &str, sr_uuid: &str, location: &str) -> SmResult<()>;
    fn vdi_list_changed_blocks(
        &self,
        dbg: &str,
        sr_uuid: &str,
        base: &str,
        target: &str,
    ) -> SmResult<String>;
    fn vdi_set_name_label(&self, dbg: &str, sr_uuid: &str, location: &str, label: &str)
        -> SmResult<()>;
    fn vdi_set_name_description(
        &self,
        dbg: &str,
        sr_uuid: &str,
        location: &str,
        description: &str,
    ) -> SmResult<()>;
}

pub mod sim {
    //! In-memory storage backend

    use super::*;
    use parking_lot::Mutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct SimSr {
        stat: SmSrStat,
        vdis: HashMap<String, SmVdiInfo>,
    }

    impl Default for SmSrStat {
        fn default() -> Self {
            Self {
                name_label: String::new(),
                name_description: String::new(),
                physical_size: 1 << 40,
                physical_utilisation: 0,
                virtual_allocation: 0,
                clustered: false,
                capabilities: full_capabilities(),
            }
        }
    }

    /// Every capability the engine knows about
    pub fn full_capabilities() -> Vec<SmCapability> {
        vec![
            SmCapability::SrProbe,
            SmCapability::SrUpdate,
            SmCapability::SrScan,
            SmCapability::VdiCreate,
            SmCapability::VdiDelete,
            SmCapability::VdiClone,
            SmCapability::VdiSnapshot,
            SmCapability::VdiResize,
            SmCapability::VdiResizeOnline,
            SmCapability::VdiMirror,
            SmCapability::VdiIntroduce,
            SmCapability::VdiUpdate,
            SmCapability::VdiGenerateConfig,
            SmCapability::VdiEnableCbt,
            SmCapability::VdiDataDestroy,
            SmCapability::VdiListChangedBlocks,
        ]
    }

    /// In-memory storage daemon
    pub struct SimStorage {
        srs: Mutex<HashMap<String, SimSr>>,
        /// When set, vdi_clone reports the capability unimplemented
        pub clone_unimplemented: std::sync::atomic::AtomicBool,
    }

    impl SimStorage {
        pub fn new() -> Self {
            Self {
                srs: Mutex::new(HashMap::new()),
                clone_unimplemented: std::sync::atomic::AtomicBool::new(false),
            }
        }

        /// Create a repository in the simulator
        pub fn add_sr(&self, sr_uuid: &str) {
            self.srs.lock().insert(sr_uuid.to_string(), SimSr::default());
        }

        /// Drop a disk behind the database's back, as a failing backend would
        pub fn lose_vdi(&self, sr_uuid: &str, location: &str) {
            if let Some(sr) = self.srs.lock().get_mut(sr_uuid) {
                sr.vdis.remove(location);
            }
        }

        /// Introduce a disk behind the database's back
        pub fn plant_vdi(&self, sr_uuid: &str, info: SmVdiInfo) {
            if let Some(sr) = self.srs.lock().get_mut(sr_uuid) {
                sr.vdis.insert(info.location.clone(), info);
            }
        }

        fn with_sr<R>(&self, sr_uuid: &str, f: impl FnOnce(&mut SimSr) -> SmResult<R>) -> SmResult<R> {
            let mut srs = self.srs.lock();
            let sr = srs
                .get_mut(sr_uuid)
                .ok_or_else(|| SmError::SrDoesNotExist(sr_uuid.to_string()))?;
            f(sr)
        }

        fn fresh_vdi(name_label: &str, virtual_size: i64, vdi_type: VdiType) -> SmVdiInfo {
            SmVdiInfo {
                location: Uuid::new_v4().to_string(),
                name_label: name_label.to_string(),
                name_description: String::new(),
                vdi_type,
                virtual_size,
                physical_utilisation: 0,
                read_only: false,
                sharable: false,
                cbt_enabled: false,
                is_a_snapshot: false,
                snapshot_of: None,
                sm_config: HashMap::new(),
            }
        }
    }

    impl Default for SimStorage {
        fn default() -> Self {
            Self::new()
        }
    }

    impl SmClient for SimStorage {
        fn sr_stat(&self, _dbg: &str, sr_uuid: &str) -> SmResult<SmSrStat> {
            self.with_sr(sr_uuid, |sr| Ok(sr.stat.clone()))
        }

        fn sr_scan(&self, _dbg: &str, sr_uuid: &str) -> SmResult<Vec<SmVdiInfo>> {
            self.with_sr(sr_uuid, |sr| Ok(sr.vdis.values().cloned().collect()))
        }

        fn sr_probe(
            &self,
            _dbg: &str,
            _device_config: &HashMap<String, String>,
        ) -> SmResult<Vec<String>> {
            Ok(self.srs.lock().keys().cloned().collect())
        }

        fn sr_set_name_label(&self, _dbg: &str, sr_uuid: &str, label: &str) -> SmResult<()> {
            self.with_sr(sr_uuid, |sr| {
                sr.stat.name_label = label.to_string();
                Ok(())
            })
        }

        fn sr_set_name_description(
            &self,
            _dbg: &str,
            sr_uuid: &str,
            description: &str,
        ) -> SmResult<()> {
            self.with_sr(sr_uuid, |sr| {
                sr.stat.name_description = description.to_string();
                Ok(())
            })
        }

        fn vdi_create(
            &self,
            _dbg: &str,
            sr_uuid: &str,
            name_label: &str,
            virtual_size: i64,
            vdi_type: VdiType,
        ) -> SmResult<SmVdiInfo> {
            self.with_sr(sr_uuid, |sr| {
                let info = Self::fresh_vdi(name_label, virtual_size, vdi_type);
                sr.vdis.insert(info.location.clone(), info.clone());
                sr.stat.virtual_allocation += virtual_size;
                Ok(info)
            })
        }

        fn vdi_destroy(&self, _dbg: &str, sr_uuid: &str, location: &str) -> SmResult<()> {
            self.with_sr(sr_uuid, |sr| {
                sr.vdis
                    .remove(location)
                    .map(|_| ())
                    .ok_or_else(|| SmError::VdiDoesNotExist(location.to_string()))
            })
        }

        fn vdi_data_destroy(&self, _dbg: &str, sr_uuid: &str, location: &str) -> SmResult<()> {
            self.with_sr(sr_uuid, |sr| {
                let vdi = sr
                    .vdis
                    .get_mut(location)
                    .ok_or_else(|| SmError::VdiDoesNotExist(location.to_string()))?;
                vdi.vdi_type = VdiType::CbtMetadata;
                vdi.virtual_size = 0;
                vdi.physical_utilisation = 0;
                Ok(())
            })
        }

        fn vdi_clone(&self, dbg: &str, sr_uuid: &str, location: &str) -> SmResult<SmVdiInfo> {
            if self
                .clone_unimplemented
                .load(std::sync::atomic::Ordering::SeqCst)
            {
                return Err(SmError::NotImplemented("VDI.clone".to_string()));
            }
            self.copy_impl(dbg, sr_uuid, location, false)
        }

        fn vdi_snapshot(&self, _dbg: &str, sr_uuid: &str, location: &str) -> SmResult<SmVdiInfo> {
            self.with_sr(sr_uuid, |sr| {
                let parent = sr
                    .vdis
                    .get(location)
                    .ok_or_else(|| SmError::VdiDoesNotExist(location.to_string()))?
                    .clone();
                let mut snap = parent.clone();
                snap.location = Uuid::new_v4().to_string();
                snap.is_a_snapshot = true;
                snap.snapshot_of = Some(location.to_string());
                snap.read_only = true;
                sr.vdis.insert(snap.location.clone(), snap.clone());
                Ok(snap)
            })
        }

        fn vdi_resize(
            &self,
            _dbg: &str,
            sr_uuid: &str,
            location: &str,
            new_size: i64,
        ) -> SmResult<i64> {
            self.with_sr(sr_uuid, |sr| {
                let vdi = sr
                    .vdis
                    .get_mut(location)
                    .ok_or_else(|| SmError::VdiDoesNotExist(location.to_string()))?;
                vdi.virtual_size = vdi.virtual_size.max(new_size);
                Ok(vdi.virtual_size)
            })
        }

        fn vdi_copy(&self, dbg: &str, sr_uuid: &str, location: &str) -> SmResult<SmVdiInfo> {
            self.copy_impl(dbg, sr_uuid, location, true)
        }

        fn vdi_set_persistent(
            &self,
            _dbg: &str,
            sr_uuid: &str,
            location: &str,
            _persistent: bool,
        ) -> SmResult<()> {
            self.with_sr(sr_uuid, |sr| {
                if sr.vdis.contains_key(location) {
                    Ok(())
                } else {
                    Err(SmError::VdiDoesNotExist(location.to_string()))
                }
            })
        }

        fn vdi_introduce(&self, _dbg: &str, sr_uuid: &str, location: &str) -> SmResult<SmVdiInfo> {
            self.with_sr(sr_uuid, |sr| {
                sr.vdis
                    .get(location)
                    .cloned()
                    .ok_or_else(|| SmError::VdiDoesNotExist(location.to_string()))
            })
        }

        fn vdi_enable_cbt(&self, _dbg: &str, sr_uuid: &str, location: &str) -> SmResult<()> {
            self.with_sr(sr_uuid, |sr| {
                let vdi = sr
                    .vdis
                    .get_mut(location)
                    .ok_or_else(|| SmError::VdiDoesNotExist(location.to_string()))?;
                vdi.cbt_enabled = true;
                Ok(())
            })
        }

        fn vdi_disable_cbt(&self, _dbg: &str, sr_uuid: &str, location: &str) -> SmResult<()> {
            self.with_sr(sr_uuid, |sr| {
                let vdi = sr
                    .vdis
                    .get_mut(location)
                    .ok_or_else(|| SmError::VdiDoesNotExist(location.to_string()))?;
                vdi.cbt_enabled = false;
                Ok(())
            })
        }

        fn vdi_list_changed_blocks(
            &self,
            _dbg: &str,
            sr_uuid: &str,
            base: &str,
            target: &str,
        ) -> SmResult<String> {
            self.with_sr(sr_uuid, |sr| {
                if !sr.vdis.contains_key(base) {
                    return Err(SmError::VdiDoesNotExist(base.to_string()));
                }
                if !sr.vdis.contains_key(target) {
                    return Err(SmError::VdiDoesNotExist(target.to_string()));
                }
                Ok(String::new())
            })
        }

        fn vdi_set_name_label(
            &self,
            _dbg: &str,
            sr_uuid: &str,
            location: &str,
            label: &str,
        ) -> SmResult<()> {
            self.with_sr(sr_uuid, |sr| {
                let vdi = sr
                    .vdis
                    .get_mut(location)
                    .ok_or_else(|| SmError::VdiDoesNotExist(location.to_string()))?;
                vdi.name_label = label.to_string();
                Ok(())
            })
        }

        fn vdi_set_name_description(
            &self,
            _dbg: &str,
            sr_uuid: &str,
            location: &str,
            description: &str,
        ) -> SmResult<()> {
            self.with_sr(sr_uuid, |sr| {
                let vdi = sr
                    .vdis
                    .get_mut(location)
                    .ok_or_else(|| SmError::VdiDoesNotExist(location.to_string()))?;
                vdi.name_description = description.to_string();
                Ok(())
            })
        }
    }

    impl SimStorage {
        fn copy_impl(
            &self,
            _dbg: &str,
            sr_uuid: &str,
            location: &str,
            is_copy: bool,
        ) -> SmResult<SmVdiInfo> {
            self.with_sr(sr_uuid, |sr| {
                let parent = sr
                    .vdis
                    .get(location)
                    .ok_or_else(|| SmError::VdiDoesNotExist(location.to_string()))?
                    .clone();
                let mut child = parent.clone();
                child.location = Uuid::new_v4().to_string();
                child.is_a_snapshot = false;
                child.snapshot_of = None;
                if is_copy {
                    child.sm_config.insert("copied".to_string(), "true".to_string());
                }
                sr.vdis.insert(child.location.clone(), child.clone());
                Ok(child)
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::sim::SimStorage;
    use super::*;

    #[test]
    fn test_sim_create_scan_destroy() {
        let storage = SimStorage::new();
        storage.add_sr("sr-1");
        let info = storage
            .vdi_create("dbg", "sr-1", "disk", 1 << 30, VdiType::User)
            .unwrap();
        assert_eq!(storage.sr_scan("dbg", "sr-1").unwrap().len(), 1);
        storage.vdi_destroy("dbg", "sr-1", &info.location).unwrap();
        assert!(storage.sr_scan("dbg", "sr-1").unwrap().is_empty());
    }

    #[test]
    fn test_sim_snapshot_links_parent() {
        let storage = SimStorage::new();
        storage.add_sr("sr-1");
        let parent = storage
            .vdi_create("dbg", "sr-1", "disk", 1 << 30, VdiType::User)
            .unwrap();
        let snap = storage.vdi_snapshot("dbg", "sr-1", &parent.location).unwrap();
        assert!(snap.is_a_snapshot);
        assert_eq!(snap.snapshot_of.as_deref(), Some(parent.location.as_str()));
    }

    #[test]
    fn test_sim_clone_can_be_unimplemented() {
        let storage = SimStorage::new();
        storage.add_sr("sr-1");
        let parent = storage
            .vdi_create("dbg", "sr-1", "disk", 1 << 30, VdiType::User)
            .unwrap();
        storage
            .clone_unimplemented
            .store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(matches!(
            storage.vdi_clone("dbg", "sr-1", &parent.location),
            Err(SmError::NotImplemented(_))
        ));
        // The copy path still works
        assert!(storage.vdi_copy("dbg", "sr-1", &parent.location).is_ok());
    }

    #[test]
    fn test_sim_data_destroy_leaves_metadata_stub() {
        let storage = SimStorage::new();
        storage.add_sr("sr-1");
        let disk = storage
            .vdi_create("dbg", "sr-1", "disk", 1 << 30, VdiType::User)
            .unwrap();
        storage
            .vdi_data_destroy("dbg", "sr-1", &disk.location)
            .unwrap();
        let scanned = storage.sr_scan("dbg", "sr-1").unwrap();
        assert_eq!(scanned.len(), 1);
        assert_eq!(scanned[0].vdi_type, VdiType::CbtMetadata);
        assert_eq!(scanned[0].virtual_size, 0);
    }
}
