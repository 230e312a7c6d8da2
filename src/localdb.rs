//! Local Host State
//!
//! Small per-host durable state, independent of the cluster database:
//! - local.db: a JSON key/value store for boot-time flags (ha_armed,
//!   host_disabled_until_reboot, redo_log_enabled, pool role)
//! - the inventory file: key=value pairs describing this installation
//! - the network-reset trigger file

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Well-known local.db keys
pub mod keys {
    pub const POOL_ROLE: &str = "pool.role";
    pub const POOL_MASTER_ADDRESS: &str = "pool.master_address";
    pub const HA_ARMED: &str = "ha_armed";
    pub const HOST_DISABLED_UNTIL_REBOOT: &str = "host_disabled_until_reboot";
    pub const MASTER_SCRIPTS: &str = "master_scripts";
    pub const REDO_LOG_ENABLED: &str = "redo_log_enabled";
}

/// Durable per-host key/value flags
pub struct LocalDb {
    path: PathBuf,
    entries: Mutex<HashMap<String, String>>,
}

impl LocalDb {
    /// Open the store, loading existing entries when the file exists
    pub fn open(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let entries = if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            serde_json::from_str(&text).unwrap_or_else(|e| {
                log::warn!("discarding malformed local.db {}: {}", path.display(), e);
                HashMap::new()
            })
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key).map(|v| v == "true").unwrap_or(false)
    }

    pub fn put(&self, key: &str, value: &str) -> std::io::Result<()> {
        let mut entries = self.entries.lock();
        entries.insert(key.to_string(), value.to_string());
        self.write_locked(&entries)
    }

    pub fn put_bool(&self, key: &str, value: bool) -> std::io::Result<()> {
        self.put(key, if value { "true" } else { "false" })
    }

    pub fn remove(&self, key: &str) -> std::io::Result<()> {
        let mut entries = self.entries.lock();
        entries.remove(key);
        self.write_locked(&entries)
    }

    fn write_locked(&self, entries: &HashMap<String, String>) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(entries)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(&self.path, text)
    }
}

/// Typed view of the installation inventory file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inventory {
    pub management_interface: String,
    pub management_address_type: String,
    pub control_domain_uuid: String,
    pub stunnel_idle_timeout: Option<u64>,
    /// Everything else, preserved verbatim
    pub extra: HashMap<String, String>,
}

impl Inventory {
    /// Parse KEY=value lines; values may be single-quoted
    pub fn parse(text: &str) -> Self {
        let mut inventory = Inventory::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('\'').to_string();
            match key.trim() {
                "MANAGEMENT_INTERFACE" => inventory.management_interface = value,
                "MANAGEMENT_ADDRESS_TYPE" => inventory.management_address_type = value,
                "CONTROL_DOMAIN_UUID" => inventory.control_domain_uuid = value,
                "STUNNEL_IDLE_TIMEOUT" => {
                    inventory.stunnel_idle_timeout = value.parse().ok();
                }
                other => {
                    inventory.extra.insert(other.to_string(), value);
                }
            }
        }
        inventory
    }

    pub fn load(path: &Path) -> std::io::Result<Self> {
        Ok(Self::parse(&std::fs::read_to_string(path)?))
    }
}

/// The network-reset trigger file left by the host installer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkReset {
    pub device: String,
    pub vlan: Option<String>,
    pub mode: String,
    pub ip: Option<String>,
    pub netmask: Option<String>,
    pub gateway: Option<String>,
    pub mode_v6: Option<String>,
    pub ipv6: Option<String>,
    pub gateway_v6: Option<String>,
    pub dns: Option<String>,
}

impl NetworkReset {
    pub fn parse(text: &str) -> Self {
        let mut fields: HashMap<&str, String> = HashMap::new();
        for line in text.lines() {
            if let Some((key, value)) = line.trim().split_once('=') {
                fields.insert(key.trim(), value.trim().to_string());
            }
        }
        let take = |k: &str| fields.get(k).cloned();
        Self {
            device: take("DEVICE").unwrap_or_default(),
            vlan: take("VLAN"),
            mode: take("MODE").unwrap_or_default(),
            ip: take("IP"),
            netmask: take("NETMASK"),
            gateway: take("GATEWAY"),
            mode_v6: take("MODE_V6"),
            ipv6: take("IPV6"),
            gateway_v6: take("GATEWAY_V6"),
            dns: take("DNS"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_localdb_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local.db");
        let db = LocalDb::open(&path).unwrap();
        db.put_bool(keys::HA_ARMED, true).unwrap();
        db.put(keys::POOL_MASTER_ADDRESS, "10.0.0.1").unwrap();

        let db2 = LocalDb::open(&path).unwrap();
        assert!(db2.get_bool(keys::HA_ARMED));
        assert_eq!(db2.get(keys::POOL_MASTER_ADDRESS).as_deref(), Some("10.0.0.1"));

        db2.remove(keys::HA_ARMED).unwrap();
        let db3 = LocalDb::open(&path).unwrap();
        assert!(!db3.get_bool(keys::HA_ARMED));
    }

    #[test]
    fn test_inventory_parse() {
        let text = "\
# installation inventory
MANAGEMENT_INTERFACE='xenbr0'
MANAGEMENT_ADDRESS_TYPE='IPv4'
CONTROL_DOMAIN_UUID='0d2e35c4-0d1e-4f63-9ab5-f0ec1b6028b2'
STUNNEL_IDLE_TIMEOUT='120'
PRODUCT_VERSION='1.0.0'
";
        let inventory = Inventory::parse(text);
        assert_eq!(inventory.management_interface, "xenbr0");
        assert_eq!(inventory.management_address_type, "IPv4");
        assert_eq!(inventory.stunnel_idle_timeout, Some(120));
        assert_eq!(
            inventory.extra.get("PRODUCT_VERSION").map(|s| s.as_str()),
            Some("1.0.0")
        );
    }

    #[test]
    fn test_network_reset_parse() {
        let text = "DEVICE=eth0\nMODE=static\nIP=192.168.0.2\nNETMASK=255.255.255.0\nGATEWAY=192.168.0.1\n";
        let reset = NetworkReset::parse(text);
        assert_eq!(reset.device, "eth0");
        assert_eq!(reset.mode, "static");
        assert_eq!(reset.ip.as_deref(), Some("192.168.0.2"));
        assert!(reset.vlan.is_none());
    }
}
