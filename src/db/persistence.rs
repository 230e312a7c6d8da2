//! Database Persistence
//!
//! On-disk durability for the cluster database:
//! - Every write is appended to a redo log next to each configured location
//! - A periodic flush writes the full snapshot and truncates the redo logs
//! - Writes fan out to all configured locations; losing quorum is fatal and
//!   the process exits so the service manager can restart it
//! - A restore file, when present at startup, replaces the active database
//!   and is deleted after the first successful flush

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use super::{Database, DatabaseSnapshot, DbError, DbResult, Delta, WriteSink};

/// One configured database location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbLocation {
    pub path: PathBuf,
}

impl DbLocation {
    fn generation_path(&self) -> PathBuf {
        sibling(&self.path, "generation")
    }

    fn redo_path(&self) -> PathBuf {
        sibling(&self.path, "redo")
    }
}

fn sibling(path: &Path, ext: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(".");
    s.push(ext);
    PathBuf::from(s)
}

/// Parse the db.conf format: one `[<path>]` header per location, followed by
/// ignored key:value attribute lines
pub fn parse_db_conf(text: &str) -> Vec<DbLocation> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.starts_with('[') && line.ends_with(']') {
                Some(DbLocation {
                    path: PathBuf::from(&line[1..line.len() - 1]),
                })
            } else {
                None
            }
        })
        .collect()
}

pub fn load_db_conf(path: &Path) -> DbResult<Vec<DbLocation>> {
    let text = std::fs::read_to_string(path)?;
    Ok(parse_db_conf(&text))
}

/// Durable write-through for the database
pub struct Persistence {
    locations: Vec<DbLocation>,
    restore_path: Option<PathBuf>,
    /// Restore file consumed at load time, deleted after one good flush
    restore_pending: AtomicBool,
    redo_writers: Mutex<Vec<Option<File>>>,
}

impl Persistence {
    pub fn new(locations: Vec<DbLocation>, restore_path: Option<PathBuf>) -> Self {
        let count = locations.len();
        Self {
            locations,
            restore_path,
            restore_pending: AtomicBool::new(false),
            redo_writers: Mutex::new((0..count).map(|_| None).collect()),
        }
    }

    /// Populate the database from disk. Prefers the restore file when one is
    /// present; otherwise picks the location with the highest generation and
    /// replays its redo log on top of the snapshot.
    pub fn load_into(&self, db: &Database) -> DbResult<()> {
        if let Some(restore) = &self.restore_path {
            if restore.exists() {
                log::info!("restoring database from {}", restore.display());
                let snapshot = read_snapshot(restore)?;
                db.load_snapshot(&snapshot)?;
                self.restore_pending.store(true, Ordering::SeqCst);
                return Ok(());
            }
        }

        let best = self
            .locations
            .iter()
            .filter(|loc| loc.path.exists())
            .filter_map(|loc| read_generation(&loc.generation_path()).map(|g| (g, loc)))
            .max_by_key(|(g, _)| *g);

        let Some((_, location)) = best else {
            log::info!("no existing database found, starting empty");
            return Ok(());
        };

        log::info!("loading database from {}", location.path.display());
        let snapshot = read_snapshot(&location.path)?;
        let base_generation = snapshot.generation;
        db.load_snapshot(&snapshot)?;

        // Replay writes that landed after the last flush
        let redo = location.redo_path();
        if redo.exists() {
            let mut replayed = 0usize;
            let reader = BufReader::new(File::open(&redo)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let delta: Delta = serde_json::from_str(&line)
                    .map_err(|e| DbError::Malformed(format!("redo entry: {}", e)))?;
                if delta.generation > base_generation {
                    db.apply_delta(&delta)?;
                    replayed += 1;
                }
            }
            if replayed > 0 {
                log::info!("replayed {} redo entries", replayed);
            }
        }
        Ok(())
    }

    /// Write the full snapshot to every location and truncate the redo logs.
    /// Returns `QuorumFailed` when more than half of the locations could not
    /// be written; the caller is expected to exit.
    pub fn flush(&self, db: &Database) -> DbResult<()> {
        let snapshot = db.snapshot()?;
        let total = self.locations.len();
        let mut ok = 0usize;
        for location in &self.locations {
            match write_snapshot(location, &snapshot) {
                Ok(()) => ok += 1,
                Err(e) => {
                    log::warn!("database flush to {} failed: {}", location.path.display(), e)
                }
            }
        }
        if ok * 2 <= total {
            return Err(DbError::QuorumFailed { ok, total });
        }

        // The flush captured everything; start the redo logs afresh
        let mut writers = self.redo_writers.lock();
        for (i, location) in self.locations.iter().enumerate() {
            writers[i] = None;
            if let Err(e) = std::fs::write(location.redo_path(), b"") {
                log::warn!(
                    "truncating redo log {} failed: {}",
                    location.redo_path().display(),
                    e
                );
            }
        }
        drop(writers);

        if self.restore_pending.swap(false, Ordering::SeqCst) {
            if let Some(restore) = &self.restore_path {
                if let Err(e) = std::fs::remove_file(restore) {
                    log::warn!("removing restore file {} failed: {}", restore.display(), e);
                }
            }
        }
        Ok(())
    }
}

impl WriteSink for Persistence {
    fn on_write(&self, delta: &Delta) {
        let line = match serde_json::to_string(delta) {
            Ok(line) => line,
            Err(e) => {
                log::error!("unserialisable delta dropped from redo log: {}", e);
                return;
            }
        };
        let mut writers = self.redo_writers.lock();
        for (i, location) in self.locations.iter().enumerate() {
            if writers[i].is_none() {
                match OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(location.redo_path())
                {
                    Ok(file) => writers[i] = Some(file),
                    Err(e) => {
                        log::warn!(
                            "opening redo log {} failed: {}",
                            location.redo_path().display(),
                            e
                        );
                        continue;
                    }
                }
            }
            if let Some(file) = writers[i].as_mut() {
                if writeln!(file, "{}", line).is_err() {
                    writers[i] = None;
                }
            }
        }
    }
}

fn read_generation(path: &Path) -> Option<u64> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn read_snapshot(path: &Path) -> DbResult<DatabaseSnapshot> {
    let text = std::fs::read_to_string(path)?;
    serde_json::from_str(&text).map_err(|e| DbError::Malformed(format!("snapshot: {}", e)))
}

fn write_snapshot(location: &DbLocation, snapshot: &DatabaseSnapshot) -> DbResult<()> {
    if let Some(parent) = location.path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = sibling(&location.path, "tmp");
    let text = serde_json::to_string(snapshot)?;
    std::fs::write(&tmp, text)?;
    std::fs::rename(&tmp, &location.path)?;
    std::fs::write(location.generation_path(), snapshot.generation.to_string())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{Ref, VmRecord};
    use crate::events::EventBus;
    use std::sync::Arc;
    use uuid::Uuid;

    fn sample_vm(name: &str) -> VmRecord {
        VmRecord {
            reference: Ref::generate(),
            uuid: Uuid::new_v4(),
            name_label: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_db_conf() {
        let conf = "[/var/lib/poolmgr/state.db]\nformat:json\n[/mnt/backup/state.db]\n";
        let locations = parse_db_conf(conf);
        assert_eq!(locations.len(), 2);
        assert_eq!(locations[0].path, PathBuf::from("/var/lib/poolmgr/state.db"));
    }

    #[test]
    fn test_flush_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let location = DbLocation {
            path: dir.path().join("state.db"),
        };
        let persistence = Arc::new(Persistence::new(vec![location.clone()], None));

        let db = Database::new(Arc::new(EventBus::default()));
        db.add_sink(persistence.clone());
        db.vms.insert(sample_vm("flushed")).unwrap();
        persistence.flush(&db).unwrap();

        // A write after the flush lands only in the redo log
        db.vms.insert(sample_vm("redo-only")).unwrap();

        let db2 = Database::new(Arc::new(EventBus::default()));
        let persistence2 = Persistence::new(vec![location], None);
        persistence2.load_into(&db2).unwrap();
        let names: Vec<String> = db2.vms.list().into_iter().map(|vm| vm.name_label).collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"flushed".to_string()));
        assert!(names.contains(&"redo-only".to_string()));
        assert_eq!(db2.generation(), db.generation());
    }

    #[test]
    fn test_restore_file_replaces_database() {
        let dir = tempfile::tempdir().unwrap();
        let location = DbLocation {
            path: dir.path().join("state.db"),
        };
        let restore = dir.path().join("restore.db");

        // Stale active database
        let db_old = Database::new(Arc::new(EventBus::default()));
        db_old.vms.insert(sample_vm("stale")).unwrap();
        let persistence_old = Persistence::new(vec![location.clone()], None);
        persistence_old.flush(&db_old).unwrap();

        // The restore image holds a different VM
        let db_new = Database::new(Arc::new(EventBus::default()));
        db_new.vms.insert(sample_vm("restored")).unwrap();
        std::fs::write(
            &restore,
            serde_json::to_string(&db_new.snapshot().unwrap()).unwrap(),
        )
        .unwrap();

        let db = Database::new(Arc::new(EventBus::default()));
        let persistence = Persistence::new(vec![location], Some(restore.clone()));
        persistence.load_into(&db).unwrap();
        assert_eq!(db.vms.list()[0].name_label, "restored");
        assert!(restore.exists());

        // Deleted after the first successful flush
        persistence.flush(&db).unwrap();
        assert!(!restore.exists());
    }

    #[test]
    fn test_quorum_failure() {
        let dir = tempfile::tempdir().unwrap();
        let good = DbLocation {
            path: dir.path().join("ok.db"),
        };
        // A directory path cannot be written as a file
        let bad = DbLocation {
            path: dir.path().to_path_buf(),
        };
        let db = Database::new(Arc::new(EventBus::default()));
        db.vms.insert(sample_vm("q")).unwrap();

        let persistence = Persistence::new(vec![good, bad.clone(), bad], None);
        assert!(matches!(
            persistence.flush(&db),
            Err(DbError::QuorumFailed { .. })
        ));
    }
}
