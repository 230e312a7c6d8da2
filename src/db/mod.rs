//! Cluster Database
//!
//! In-memory schema-typed table store, authoritative on the coordinator and
//! cached on members. Features:
//! - Tables keyed by class and opaque reference, with a UUID secondary index
//! - Atomic per-row mutation; a single serialising mutex for cross-row writes
//! - A generation counter incremented on every write and stamped into the row
//! - Every write emits a change event and feeds the write sinks (redo log,
//!   replication) with a delta

pub mod models;
pub mod persistence;
pub mod replication;

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::events::{DbEvent, EventBus, EventOp};
use models::*;

/// Database failures
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("no such {0} object: {1}")]
    NotFound(Class, Ref),

    #[error("duplicate {0} reference: {1}")]
    Duplicate(Class, Ref),

    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialisation failure: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("database flush quorum failed: {ok} of {total} locations writable")]
    QuorumFailed { ok: usize, total: usize },

    #[error("malformed database file: {0}")]
    Malformed(String),
}

pub type DbResult<T> = Result<T, DbError>;

// ============================================================================
// Deltas and write sinks
// ============================================================================

/// A single replicated or logged write
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delta {
    pub generation: u64,
    pub class: Class,
    pub reference: Ref,
    pub op: DeltaOp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaOp {
    /// Post-image of the row
    Write(serde_json::Value),
    Delete,
}

/// Observer of authoritative writes (redo log appender, replication feed)
pub trait WriteSink: Send + Sync {
    fn on_write(&self, delta: &Delta);
}

// ============================================================================
// Records
// ============================================================================

/// Implemented by every row type held in a table
pub trait Record: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const CLASS: Class;
    fn reference(&self) -> &Ref;
    fn uuid(&self) -> Uuid;
}

macro_rules! impl_record {
    ($ty:ty, $class:expr) => {
        impl Record for $ty {
            const CLASS: Class = $class;
            fn reference(&self) -> &Ref {
                &self.reference
            }
            fn uuid(&self) -> Uuid {
                self.uuid
            }
        }
    };
}

impl_record!(PoolRecord, Class::Pool);
impl_record!(HostRecord, Class::Host);
impl_record!(VmRecord, Class::Vm);
impl_record!(VmMetricsRecord, Class::VmMetrics);
impl_record!(VmGuestMetricsRecord, Class::VmGuestMetrics);
impl_record!(VbdRecord, Class::Vbd);
impl_record!(VifRecord, Class::Vif);
impl_record!(VdiRecord, Class::Vdi);
impl_record!(SrRecord, Class::Sr);
impl_record!(PbdRecord, Class::Pbd);
impl_record!(PciRecord, Class::Pci);
impl_record!(PgpuRecord, Class::Pgpu);
impl_record!(VgpuRecord, Class::Vgpu);
impl_record!(PusbRecord, Class::Pusb);
impl_record!(VusbRecord, Class::Vusb);
impl_record!(VtpmRecord, Class::Vtpm);
impl_record!(NetworkRecord, Class::Network);
impl_record!(PifRecord, Class::Pif);
impl_record!(ConsoleRecord, Class::Console);
impl_record!(TaskRecord, Class::Task);
impl_record!(MessageRecord, Class::Message);
impl_record!(RoleRecord, Class::Role);
impl_record!(SubjectRecord, Class::Subject);

// ============================================================================
// Core shared state
// ============================================================================

struct DbCore {
    /// Bumped on every write; the value is both the row generation and the
    /// event token
    generation: AtomicU64,
    /// Serialises all writes so deltas and events leave in one order
    write_lock: Mutex<()>,
    bus: Arc<EventBus>,
    sinks: RwLock<Vec<Arc<dyn WriteSink>>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl DbCore {
    fn emit(&self, generation: u64, class: Class, reference: Ref, op: EventOp, snapshot: Option<serde_json::Value>) {
        self.bus.publish(DbEvent {
            id: generation,
            class,
            operation: op,
            reference,
            snapshot,
        });
    }

    fn feed_sinks(&self, delta: &Delta) {
        for sink in self.sinks.read().iter() {
            sink.on_write(delta);
        }
    }
}

/// Read/write counters and generation watermark
#[derive(Debug, Clone, Default)]
pub struct DbStats {
    pub generation: u64,
    pub reads: u64,
    pub writes: u64,
}

// ============================================================================
// Tables
// ============================================================================

struct Row<T> {
    generation: u64,
    data: T,
}

/// One class-typed table
pub struct Table<T: Record> {
    rows: RwLock<HashMap<Ref, Row<T>>>,
    by_uuid: RwLock<HashMap<Uuid, Ref>>,
    core: Arc<DbCore>,
}

impl<T: Record> Table<T> {
    fn new(core: Arc<DbCore>) -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
            by_uuid: RwLock::new(HashMap::new()),
            core,
        }
    }

    /// Insert a fresh row; the reference must be unused
    pub fn insert(&self, record: T) -> DbResult<()> {
        let reference = record.reference().clone();
        let uuid = record.uuid();
        let snapshot = serde_json::to_value(&record)?;
        let _guard = self.core.write_lock.lock();
        {
            let mut rows = self.rows.write();
            if rows.contains_key(&reference) {
                return Err(DbError::Duplicate(T::CLASS, reference));
            }
            let generation = self.core.generation.fetch_add(1, Ordering::SeqCst) + 1;
            rows.insert(
                reference.clone(),
                Row {
                    generation,
                    data: record,
                },
            );
            self.by_uuid.write().insert(uuid, reference.clone());
            self.core.writes.fetch_add(1, Ordering::Relaxed);
            let delta = Delta {
                generation,
                class: T::CLASS,
                reference: reference.clone(),
                op: DeltaOp::Write(snapshot.clone()),
            };
            self.core.feed_sinks(&delta);
            self.core
                .emit(generation, T::CLASS, reference, EventOp::Add, Some(snapshot));
        }
        Ok(())
    }

    /// Fetch a copy of the row
    pub fn get(&self, reference: &Ref) -> DbResult<T> {
        self.core.reads.fetch_add(1, Ordering::Relaxed);
        self.rows
            .read()
            .get(reference)
            .map(|row| row.data.clone())
            .ok_or_else(|| DbError::NotFound(T::CLASS, reference.clone()))
    }

    pub fn try_get(&self, reference: &Ref) -> Option<T> {
        self.core.reads.fetch_add(1, Ordering::Relaxed);
        self.rows.read().get(reference).map(|row| row.data.clone())
    }

    pub fn contains(&self, reference: &Ref) -> bool {
        self.rows.read().contains_key(reference)
    }

    pub fn list(&self) -> Vec<T> {
        self.core.reads.fetch_add(1, Ordering::Relaxed);
        self.rows.read().values().map(|row| row.data.clone()).collect()
    }

    pub fn refs(&self) -> Vec<Ref> {
        self.rows.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    pub fn find_by_uuid(&self, uuid: &Uuid) -> Option<T> {
        let reference = self.by_uuid.read().get(uuid).cloned()?;
        self.try_get(&reference)
    }

    /// Generation stamped on the row at its last write
    pub fn generation_of(&self, reference: &Ref) -> Option<u64> {
        self.rows.read().get(reference).map(|row| row.generation)
    }

    /// Mutate one row atomically, returning the post-image
    pub fn update<F>(&self, reference: &Ref, f: F) -> DbResult<T>
    where
        F: FnOnce(&mut T),
    {
        let _guard = self.core.write_lock.lock();
        let mut rows = self.rows.write();
        let row = rows
            .get_mut(reference)
            .ok_or_else(|| DbError::NotFound(T::CLASS, reference.clone()))?;
        f(&mut row.data);
        let generation = self.core.generation.fetch_add(1, Ordering::SeqCst) + 1;
        row.generation = generation;
        let post = row.data.clone();
        drop(rows);
        let snapshot = serde_json::to_value(&post)?;
        self.core.writes.fetch_add(1, Ordering::Relaxed);
        let delta = Delta {
            generation,
            class: T::CLASS,
            reference: reference.clone(),
            op: DeltaOp::Write(snapshot.clone()),
        };
        self.core.feed_sinks(&delta);
        self.core.emit(
            generation,
            T::CLASS,
            reference.clone(),
            EventOp::Mod,
            Some(snapshot),
        );
        Ok(post)
    }

    /// Remove the row, returning its final image
    pub fn remove(&self, reference: &Ref) -> DbResult<T> {
        let _guard = self.core.write_lock.lock();
        let removed = {
            let mut rows = self.rows.write();
            rows.remove(reference)
                .ok_or_else(|| DbError::NotFound(T::CLASS, reference.clone()))?
        };
        self.by_uuid.write().remove(&removed.data.uuid());
        let generation = self.core.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.core.writes.fetch_add(1, Ordering::Relaxed);
        let delta = Delta {
            generation,
            class: T::CLASS,
            reference: reference.clone(),
            op: DeltaOp::Delete,
        };
        self.core.feed_sinks(&delta);
        self.core
            .emit(generation, T::CLASS, reference.clone(), EventOp::Del, None);
        Ok(removed.data)
    }

    /// Dump every row as (ref, post-image) pairs
    fn dump(&self) -> DbResult<HashMap<String, serde_json::Value>> {
        let rows = self.rows.read();
        let mut out = HashMap::with_capacity(rows.len());
        for (reference, row) in rows.iter() {
            out.insert(reference.as_str().to_string(), serde_json::to_value(&row.data)?);
        }
        Ok(out)
    }

    /// Replace the table contents without feeding sinks or emitting events
    fn load(&self, rows: &HashMap<String, serde_json::Value>) -> DbResult<()> {
        let mut table = self.rows.write();
        let mut index = self.by_uuid.write();
        table.clear();
        index.clear();
        for (reference, value) in rows {
            let data: T = serde_json::from_value(value.clone())?;
            let reference = Ref::from_string(reference.clone());
            index.insert(data.uuid(), reference.clone());
            table.insert(reference, Row { generation: 0, data });
        }
        Ok(())
    }

    /// Apply a replicated write without feeding sinks; the event carries the
    /// coordinator's generation so member subscribers stay token-compatible
    fn apply(&self, delta: &Delta) -> DbResult<()> {
        match &delta.op {
            DeltaOp::Write(value) => {
                let data: T = serde_json::from_value(value.clone())?;
                let _guard = self.core.write_lock.lock();
                let mut rows = self.rows.write();
                let existed = rows.contains_key(&delta.reference);
                self.by_uuid.write().insert(data.uuid(), delta.reference.clone());
                rows.insert(
                    delta.reference.clone(),
                    Row {
                        generation: delta.generation,
                        data,
                    },
                );
                drop(rows);
                self.core.generation.store(delta.generation, Ordering::SeqCst);
                let op = if existed { EventOp::Mod } else { EventOp::Add };
                self.core.emit(
                    delta.generation,
                    T::CLASS,
                    delta.reference.clone(),
                    op,
                    Some(value.clone()),
                );
            }
            DeltaOp::Delete => {
                let _guard = self.core.write_lock.lock();
                let removed = self.rows.write().remove(&delta.reference);
                if let Some(row) = removed {
                    self.by_uuid.write().remove(&row.data.uuid());
                }
                self.core.generation.store(delta.generation, Ordering::SeqCst);
                self.core.emit(
                    delta.generation,
                    T::CLASS,
                    delta.reference.clone(),
                    EventOp::Del,
                    None,
                );
            }
        }
        Ok(())
    }
}

// ============================================================================
// Database
// ============================================================================

/// Full database snapshot as persisted and replicated
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSnapshot {
    pub generation: u64,
    /// Wire class name to (ref, row) map
    pub tables: HashMap<String, HashMap<String, serde_json::Value>>,
}

/// The cluster object database
pub struct Database {
    core: Arc<DbCore>,
    pub pools: Table<PoolRecord>,
    pub hosts: Table<HostRecord>,
    pub vms: Table<VmRecord>,
    pub vm_metrics: Table<VmMetricsRecord>,
    pub vm_guest_metrics: Table<VmGuestMetricsRecord>,
    pub vbds: Table<VbdRecord>,
    pub vifs: Table<VifRecord>,
    pub vdis: Table<VdiRecord>,
    pub srs: Table<SrRecord>,
    pub pbds: Table<PbdRecord>,
    pub pcis: Table<PciRecord>,
    pub pgpus: Table<PgpuRecord>,
    pub vgpus: Table<VgpuRecord>,
    pub pusbs: Table<PusbRecord>,
    pub vusbs: Table<VusbRecord>,
    pub vtpms: Table<VtpmRecord>,
    pub networks: Table<NetworkRecord>,
    pub pifs: Table<PifRecord>,
    pub consoles: Table<ConsoleRecord>,
    pub tasks: Table<TaskRecord>,
    pub messages: Table<MessageRecord>,
    pub roles: Table<RoleRecord>,
    pub subjects: Table<SubjectRecord>,
}

impl Database {
    pub fn new(bus: Arc<EventBus>) -> Self {
        let core = Arc::new(DbCore {
            generation: AtomicU64::new(0),
            write_lock: Mutex::new(()),
            bus,
            sinks: RwLock::new(Vec::new()),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        });
        Self {
            pools: Table::new(core.clone()),
            hosts: Table::new(core.clone()),
            vms: Table::new(core.clone()),
            vm_metrics: Table::new(core.clone()),
            vm_guest_metrics: Table::new(core.clone()),
            vbds: Table::new(core.clone()),
            vifs: Table::new(core.clone()),
            vdis: Table::new(core.clone()),
            srs: Table::new(core.clone()),
            pbds: Table::new(core.clone()),
            pcis: Table::new(core.clone()),
            pgpus: Table::new(core.clone()),
            vgpus: Table::new(core.clone()),
            pusbs: Table::new(core.clone()),
            vusbs: Table::new(core.clone()),
            vtpms: Table::new(core.clone()),
            networks: Table::new(core.clone()),
            pifs: Table::new(core.clone()),
            consoles: Table::new(core.clone()),
            tasks: Table::new(core.clone()),
            messages: Table::new(core.clone()),
            roles: Table::new(core.clone()),
            subjects: Table::new(core.clone()),
            core,
        }
    }

    /// Attach a write observer; every subsequent authoritative write is fed
    pub fn add_sink(&self, sink: Arc<dyn WriteSink>) {
        self.core.sinks.write().push(sink);
    }

    pub fn generation(&self) -> u64 {
        self.core.generation.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> DbStats {
        DbStats {
            generation: self.generation(),
            reads: self.core.reads.load(Ordering::Relaxed),
            writes: self.core.writes.load(Ordering::Relaxed),
        }
    }

    /// The pool singleton; every deployment has exactly one
    pub fn pool(&self) -> DbResult<PoolRecord> {
        self.pools
            .list()
            .into_iter()
            .next()
            .ok_or_else(|| DbError::NotFound(Class::Pool, Ref::null()))
    }

    /// Current row snapshot for event injection
    pub fn snapshot_of(&self, class: Class, reference: &Ref) -> Option<serde_json::Value> {
        fn val<T: Record>(table: &Table<T>, reference: &Ref) -> Option<serde_json::Value> {
            table
                .try_get(reference)
                .and_then(|r| serde_json::to_value(&r).ok())
        }
        match class {
            Class::Pool => val(&self.pools, reference),
            Class::Host => val(&self.hosts, reference),
            Class::Vm => val(&self.vms, reference),
            Class::VmMetrics => val(&self.vm_metrics, reference),
            Class::VmGuestMetrics => val(&self.vm_guest_metrics, reference),
            Class::Vbd => val(&self.vbds, reference),
            Class::Vif => val(&self.vifs, reference),
            Class::Vdi => val(&self.vdis, reference),
            Class::Sr => val(&self.srs, reference),
            Class::Pbd => val(&self.pbds, reference),
            Class::Pci => val(&self.pcis, reference),
            Class::Pgpu => val(&self.pgpus, reference),
            Class::Vgpu => val(&self.vgpus, reference),
            Class::Pusb => val(&self.pusbs, reference),
            Class::Vusb => val(&self.vusbs, reference),
            Class::Vtpm => val(&self.vtpms, reference),
            Class::Network => val(&self.networks, reference),
            Class::Pif => val(&self.pifs, reference),
            Class::Console => val(&self.consoles, reference),
            Class::Task => val(&self.tasks, reference),
            Class::Message => val(&self.messages, reference),
            Class::Role => val(&self.roles, reference),
            Class::Subject => val(&self.subjects, reference),
        }
    }

    /// Force an event to be emitted for a row right now, waking any
    /// subscriber watching it
    pub fn inject(&self, class: Class, reference: &Ref) -> DbResult<()> {
        let snapshot = self
            .snapshot_of(class, reference)
            .ok_or_else(|| DbError::NotFound(class, reference.clone()))?;
        let _guard = self.core.write_lock.lock();
        let generation = self.core.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.core
            .bus
            .inject(generation, class, reference.clone(), snapshot);
        Ok(())
    }

    /// Run a closure while holding the cross-row transaction mutex
    pub fn transaction<R>(&self, f: impl FnOnce() -> R) -> R {
        // Re-entrant writes are not permitted inside the closure; callers
        // stage their row mutations and apply them after it returns
        let _guard = self.core.write_lock.lock();
        f()
    }

    /// Full dump of every table
    pub fn snapshot(&self) -> DbResult<DatabaseSnapshot> {
        let mut tables = HashMap::new();
        tables.insert("pool".into(), self.pools.dump()?);
        tables.insert("host".into(), self.hosts.dump()?);
        tables.insert("VM".into(), self.vms.dump()?);
        tables.insert("VM_metrics".into(), self.vm_metrics.dump()?);
        tables.insert("VM_guest_metrics".into(), self.vm_guest_metrics.dump()?);
        tables.insert("VBD".into(), self.vbds.dump()?);
        tables.insert("VIF".into(), self.vifs.dump()?);
        tables.insert("VDI".into(), self.vdis.dump()?);
        tables.insert("SR".into(), self.srs.dump()?);
        tables.insert("PBD".into(), self.pbds.dump()?);
        tables.insert("PCI".into(), self.pcis.dump()?);
        tables.insert("PGPU".into(), self.pgpus.dump()?);
        tables.insert("VGPU".into(), self.vgpus.dump()?);
        tables.insert("PUSB".into(), self.pusbs.dump()?);
        tables.insert("VUSB".into(), self.vusbs.dump()?);
        tables.insert("VTPM".into(), self.vtpms.dump()?);
        tables.insert("network".into(), self.networks.dump()?);
        tables.insert("PIF".into(), self.pifs.dump()?);
        tables.insert("console".into(), self.consoles.dump()?);
        tables.insert("task".into(), self.tasks.dump()?);
        tables.insert("message".into(), self.messages.dump()?);
        tables.insert("role".into(), self.roles.dump()?);
        tables.insert("subject".into(), self.subjects.dump()?);
        Ok(DatabaseSnapshot {
            generation: self.generation(),
            tables,
        })
    }

    /// Replace the whole database from a snapshot. No events or sink feeds
    /// are produced; callers re-register interested subscribers afterwards.
    pub fn load_snapshot(&self, snapshot: &DatabaseSnapshot) -> DbResult<()> {
        let empty = HashMap::new();
        let t = |name: &str| snapshot.tables.get(name).unwrap_or(&empty);
        self.pools.load(t("pool"))?;
        self.hosts.load(t("host"))?;
        self.vms.load(t("VM"))?;
        self.vm_metrics.load(t("VM_metrics"))?;
        self.vm_guest_metrics.load(t("VM_guest_metrics"))?;
        self.vbds.load(t("VBD"))?;
        self.vifs.load(t("VIF"))?;
        self.vdis.load(t("VDI"))?;
        self.srs.load(t("SR"))?;
        self.pbds.load(t("PBD"))?;
        self.pcis.load(t("PCI"))?;
        self.pgpus.load(t("PGPU"))?;
        self.vgpus.load(t("VGPU"))?;
        self.pusbs.load(t("PUSB"))?;
        self.vusbs.load(t("VUSB"))?;
        self.vtpms.load(t("VTPM"))?;
        self.networks.load(t("network"))?;
        self.pifs.load(t("PIF"))?;
        self.consoles.load(t("console"))?;
        self.tasks.load(t("task"))?;
        self.messages.load(t("message"))?;
        self.roles.load(t("role"))?;
        self.subjects.load(t("subject"))?;
        self.core
            .generation
            .store(snapshot.generation, Ordering::SeqCst);
        Ok(())
    }

    /// Apply one replicated write from the coordinator
    pub fn apply_delta(&self, delta: &Delta) -> DbResult<()> {
        match delta.class {
            Class::Pool => self.pools.apply(delta),
            Class::Host => self.hosts.apply(delta),
            Class::Vm => self.vms.apply(delta),
            Class::VmMetrics => self.vm_metrics.apply(delta),
            Class::VmGuestMetrics => self.vm_guest_metrics.apply(delta),
            Class::Vbd => self.vbds.apply(delta),
            Class::Vif => self.vifs.apply(delta),
            Class::Vdi => self.vdis.apply(delta),
            Class::Sr => self.srs.apply(delta),
            Class::Pbd => self.pbds.apply(delta),
            Class::Pci => self.pcis.apply(delta),
            Class::Pgpu => self.pgpus.apply(delta),
            Class::Vgpu => self.vgpus.apply(delta),
            Class::Pusb => self.pusbs.apply(delta),
            Class::Vusb => self.vusbs.apply(delta),
            Class::Vtpm => self.vtpms.apply(delta),
            Class::Network => self.networks.apply(delta),
            Class::Pif => self.pifs.apply(delta),
            Class::Console => self.consoles.apply(delta),
            Class::Task => self.tasks.apply(delta),
            Class::Message => self.messages.apply(delta),
            Class::Role => self.roles.apply(delta),
            Class::Subject => self.subjects.apply(delta),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventFilter;
    use std::time::Duration;

    fn fresh_db() -> (Arc<EventBus>, Database) {
        let bus = Arc::new(EventBus::default());
        let db = Database::new(bus.clone());
        (bus, db)
    }

    fn sample_vm(name: &str) -> VmRecord {
        VmRecord {
            reference: Ref::generate(),
            uuid: Uuid::new_v4(),
            name_label: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_insert_get_update_remove() {
        let (_bus, db) = fresh_db();
        let vm = sample_vm("one");
        let reference = vm.reference.clone();
        let uuid = vm.uuid;
        db.vms.insert(vm).unwrap();
        assert_eq!(db.vms.get(&reference).unwrap().name_label, "one");
        assert_eq!(db.vms.find_by_uuid(&uuid).unwrap().name_label, "one");

        let g1 = db.vms.generation_of(&reference).unwrap();
        db.vms
            .update(&reference, |vm| vm.name_label = "two".to_string())
            .unwrap();
        let g2 = db.vms.generation_of(&reference).unwrap();
        assert!(g2 > g1);

        db.vms.remove(&reference).unwrap();
        assert!(db.vms.try_get(&reference).is_none());
        assert!(db.vms.find_by_uuid(&uuid).is_none());
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let (_bus, db) = fresh_db();
        let vm = sample_vm("dup");
        db.vms.insert(vm.clone()).unwrap();
        assert!(matches!(db.vms.insert(vm), Err(DbError::Duplicate(_, _))));
    }

    #[test]
    fn test_writes_emit_events() {
        let (bus, db) = fresh_db();
        let vm = sample_vm("evt");
        let reference = vm.reference.clone();
        db.vms.insert(vm).unwrap();
        db.vms
            .update(&reference, |vm| vm.name_label = "evt2".to_string())
            .unwrap();
        db.vms.remove(&reference).unwrap();

        let batch = bus
            .from(&EventFilter::class(Class::Vm), "", Duration::from_millis(5))
            .unwrap();
        let ops: Vec<EventOp> = batch.events.iter().map(|e| e.operation).collect();
        assert_eq!(ops, vec![EventOp::Add, EventOp::Mod, EventOp::Del]);
        assert!(batch.events[0].snapshot.is_some());
        assert!(batch.events[2].snapshot.is_none());
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let (_bus, db) = fresh_db();
        db.vms.insert(sample_vm("a")).unwrap();
        db.vms.insert(sample_vm("b")).unwrap();
        let snapshot = db.snapshot().unwrap();

        let (_bus2, db2) = fresh_db();
        db2.load_snapshot(&snapshot).unwrap();
        assert_eq!(db2.vms.len(), 2);
        assert_eq!(db2.generation(), db.generation());
    }

    #[test]
    fn test_apply_delta() {
        let (bus, db) = fresh_db();
        let vm = sample_vm("replicated");
        let reference = vm.reference.clone();
        let delta = Delta {
            generation: 17,
            class: Class::Vm,
            reference: reference.clone(),
            op: DeltaOp::Write(serde_json::to_value(&vm).unwrap()),
        };
        db.apply_delta(&delta).unwrap();
        assert_eq!(db.vms.get(&reference).unwrap().name_label, "replicated");
        assert_eq!(db.generation(), 17);

        // Member subscribers observe replicated writes
        let batch = bus
            .from(&EventFilter::class(Class::Vm), "", Duration::from_millis(5))
            .unwrap();
        assert_eq!(batch.events.len(), 1);

        let delete = Delta {
            generation: 18,
            class: Class::Vm,
            reference: reference.clone(),
            op: DeltaOp::Delete,
        };
        db.apply_delta(&delete).unwrap();
        assert!(db.vms.try_get(&reference).is_none());
    }

    #[test]
    fn test_inject_wakes_subscribers() {
        let (bus, db) = fresh_db();
        let vm = sample_vm("inj");
        let reference = vm.reference.clone();
        db.vms.insert(vm).unwrap();
        let token = bus.current_token();
        db.inject(Class::Vm, &reference).unwrap();
        let batch = bus
            .from(&EventFilter::class(Class::Vm), &token, Duration::from_millis(5))
            .unwrap();
        assert_eq!(batch.events.len(), 1);
        assert_eq!(batch.events[0].operation, EventOp::Mod);
    }
}
