//! Pool Role
//!
//! Whether this host runs the authoritative database or follows one. The
//! role is persisted in the local store so it survives restarts; a host that
//! finds another coordinator claimed in its own database demotes itself and
//! restarts as a member.

use crate::db::models::Ref;
use crate::db::Database;
use crate::localdb::{keys, LocalDb};

/// The node's role in the pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolRole {
    Master,
    /// Follows the coordinator at the given address
    Slave(String),
    /// Configuration is damaged; go straight to emergency mode and never
    /// attempt to talk to a coordinator
    Broken,
}

impl PoolRole {
    pub fn is_master(&self) -> bool {
        matches!(self, PoolRole::Master)
    }
}

/// Read the persisted role; a missing entry means a fresh installation,
/// which boots as its own coordinator
pub fn read_role(local: &LocalDb) -> PoolRole {
    match local.get(keys::POOL_ROLE).as_deref() {
        None | Some("master") => PoolRole::Master,
        Some("slave") => match local.get(keys::POOL_MASTER_ADDRESS) {
            Some(address) => PoolRole::Slave(address),
            None => {
                log::error!("role is slave but no coordinator address is stored");
                PoolRole::Broken
            }
        },
        Some("broken") => PoolRole::Broken,
        Some(other) => {
            log::error!("unrecognised stored role {:?}", other);
            PoolRole::Broken
        }
    }
}

pub fn persist_role(local: &LocalDb, role: &PoolRole) -> std::io::Result<()> {
    match role {
        PoolRole::Master => {
            local.put(keys::POOL_ROLE, "master")?;
            local.remove(keys::POOL_MASTER_ADDRESS)
        }
        PoolRole::Slave(address) => {
            local.put(keys::POOL_ROLE, "slave")?;
            local.put(keys::POOL_MASTER_ADDRESS, address)
        }
        PoolRole::Broken => local.put(keys::POOL_ROLE, "broken"),
    }
}

/// A coordinator that sees another host claimed as coordinator in its own
/// database must demote itself. Returns the new role to restart under, or
/// None when we are still the coordinator of record.
pub fn detect_other_master(db: &Database, localhost: &Ref, local: &LocalDb) -> Option<PoolRole> {
    let pool = db.pool().ok()?;
    if pool.master == *localhost || pool.master.is_null() {
        return None;
    }
    let address = db
        .hosts
        .try_get(&pool.master)
        .map(|host| host.address)
        .unwrap_or_default();
    log::warn!(
        "another coordinator {} is claimed in the database; demoting to member",
        pool.master
    );
    let role = PoolRole::Slave(address);
    if let Err(e) = persist_role(local, &role) {
        log::error!("persisting demoted role: {}", e);
    }
    Some(role)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{HostRecord, PoolRecord};
    use crate::events::EventBus;
    use std::sync::Arc;
    use uuid::Uuid;

    fn local_db() -> (tempfile::TempDir, LocalDb) {
        let dir = tempfile::tempdir().unwrap();
        let local = LocalDb::open(dir.path().join("local.db")).unwrap();
        (dir, local)
    }

    #[test]
    fn test_fresh_install_is_master() {
        let (_dir, local) = local_db();
        assert_eq!(read_role(&local), PoolRole::Master);
    }

    #[test]
    fn test_role_survives_restart() {
        let (dir, local) = local_db();
        persist_role(&local, &PoolRole::Slave("10.0.0.1".to_string())).unwrap();
        let reopened = LocalDb::open(dir.path().join("local.db")).unwrap();
        assert_eq!(read_role(&reopened), PoolRole::Slave("10.0.0.1".to_string()));

        persist_role(&reopened, &PoolRole::Master).unwrap();
        let again = LocalDb::open(dir.path().join("local.db")).unwrap();
        assert_eq!(read_role(&again), PoolRole::Master);
    }

    #[test]
    fn test_slave_without_address_is_broken() {
        let (_dir, local) = local_db();
        local.put(keys::POOL_ROLE, "slave").unwrap();
        assert_eq!(read_role(&local), PoolRole::Broken);
    }

    #[test]
    fn test_detect_other_master() {
        let (_dir, local) = local_db();
        let db = Database::new(Arc::new(EventBus::default()));
        let me = Ref::generate();
        let other = HostRecord {
            reference: Ref::generate(),
            uuid: Uuid::new_v4(),
            address: "10.0.0.9".to_string(),
            ..Default::default()
        };
        let other_ref = other.reference.clone();
        db.hosts.insert(other).unwrap();
        db.pools
            .insert(PoolRecord {
                reference: Ref::generate(),
                uuid: Uuid::new_v4(),
                master: me.clone(),
                ..Default::default()
            })
            .unwrap();

        // Database agrees we are the coordinator
        assert!(detect_other_master(&db, &me, &local).is_none());

        // Another host takes over
        let pool_ref = db.pool().unwrap().reference;
        db.pools
            .update(&pool_ref, |pool| pool.master = other_ref.clone())
            .unwrap();
        let role = detect_other_master(&db, &me, &local).unwrap();
        assert_eq!(role, PoolRole::Slave("10.0.0.9".to_string()));
        // And the demotion is durable
        assert_eq!(read_role(&local), PoolRole::Slave("10.0.0.9".to_string()));
    }
}
