//! Task Manager
//!
//! Every operation runs under a task row in the database:
//! - Subtask trees via subtask_of
//! - Progress reporting in [0, 1]
//! - Cooperative cancellation observed at suspension points
//! - Destroy-time cleanup of the current_operations entries the task holds

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::api_error::{codes, ApiError, ApiResult};
use crate::db::models::{Class, Ref, TaskOperation, TaskRecord, TaskStatus};
use crate::db::{Database, DbResult};

/// Invoked when a task enters the cancelling state, used to forward the
/// cancel to an in-flight hypervisor operation
pub type CancelHook = Box<dyn Fn() + Send + Sync>;

/// Registry of live tasks
pub struct TaskManager {
    db: Arc<Database>,
    /// The host this manager runs on
    localhost: Ref,
    cancel_hooks: Mutex<HashMap<Ref, CancelHook>>,
}

impl TaskManager {
    pub fn new(db: Arc<Database>, localhost: Ref) -> Self {
        Self {
            db,
            localhost,
            cancel_hooks: Mutex::new(HashMap::new()),
        }
    }

    /// Open a new task, linking to a parent when supplied
    pub fn create(
        &self,
        name_label: &str,
        subtask_of: Option<&Ref>,
        cancellable: bool,
    ) -> DbResult<Ref> {
        let reference = Ref::generate();
        let mut allowed = vec![TaskOperation::Destroy];
        if cancellable {
            allowed.push(TaskOperation::Cancel);
        }
        let record = TaskRecord {
            reference: reference.clone(),
            uuid: Uuid::new_v4(),
            name_label: name_label.to_string(),
            created: Utc::now(),
            finished: None,
            status: TaskStatus::Pending,
            progress: 0.0,
            result: String::new(),
            error_info: Vec::new(),
            subtask_of: subtask_of.cloned().unwrap_or_else(Ref::null),
            subtasks: Vec::new(),
            cancellable,
            resident_on: self.localhost.clone(),
            locked_objects: Vec::new(),
            allowed_operations: allowed,
            other_config: HashMap::new(),
        };
        self.db.tasks.insert(record)?;
        if let Some(parent) = subtask_of {
            let _ = self.db.tasks.update(parent, |t| {
                t.subtasks.push(reference.clone());
            });
        }
        log::debug!("task {} opened: {}", reference, name_label);
        Ok(reference)
    }

    pub fn get(&self, task: &Ref) -> Option<TaskRecord> {
        self.db.tasks.try_get(task)
    }

    pub fn set_progress(&self, task: &Ref, progress: f64) {
        let progress = progress.clamp(0.0, 1.0);
        let _ = self.db.tasks.update(task, |t| t.progress = progress);
    }

    /// Mark a critical section: the task can no longer be cancelled
    pub fn set_not_cancellable(&self, task: &Ref) {
        let _ = self.db.tasks.update(task, |t| {
            t.cancellable = false;
            t.allowed_operations.retain(|op| *op != TaskOperation::Cancel);
        });
    }

    pub fn set_cancellable(&self, task: &Ref) {
        let _ = self.db.tasks.update(task, |t| {
            t.cancellable = true;
            if !t.allowed_operations.contains(&TaskOperation::Cancel) {
                t.allowed_operations.push(TaskOperation::Cancel);
            }
        });
    }

    /// Record that this task holds a current_operations entry on a row
    pub fn add_lock(&self, task: &Ref, class: Class, reference: &Ref) {
        let _ = self.db.tasks.update(task, |t| {
            t.locked_objects.push((class, reference.clone()));
        });
    }

    pub fn remove_lock(&self, task: &Ref, class: Class, reference: &Ref) {
        let _ = self.db.tasks.update(task, |t| {
            t.locked_objects
                .retain(|(c, r)| !(*c == class && r == reference));
        });
    }

    /// Attach the forwarding hook fired when the task starts cancelling
    pub fn set_cancel_hook(&self, task: &Ref, hook: CancelHook) {
        self.cancel_hooks.lock().insert(task.clone(), hook);
    }

    pub fn clear_cancel_hook(&self, task: &Ref) {
        self.cancel_hooks.lock().remove(task);
    }

    /// Request cancellation. Idempotent; fails only when the task forbids it.
    pub fn cancel(&self, task: &Ref) -> ApiResult<()> {
        let record = self
            .get(task)
            .ok_or_else(|| ApiError::handle_invalid("task", task.as_str()))?;
        if record.status.is_finished() || record.status == TaskStatus::Cancelling {
            return Ok(());
        }
        if !record.cancellable {
            return Err(ApiError::new(
                codes::OPERATION_NOT_ALLOWED,
                vec![format!("task {} is not cancellable", task)],
            ));
        }
        let _ = self.db.tasks.update(task, |t| {
            t.status = TaskStatus::Cancelling;
        });
        if let Some(hook) = self.cancel_hooks.lock().get(task) {
            hook();
        }
        log::info!("task {} cancelling", task);
        Ok(())
    }

    pub fn is_cancelling(&self, task: &Ref) -> bool {
        self.get(task)
            .map(|t| t.status == TaskStatus::Cancelling)
            .unwrap_or(false)
    }

    /// Suspension-point check: surface the cancellation as an error
    pub fn check_cancelling(&self, task: &Ref) -> ApiResult<()> {
        if self.is_cancelling(task) {
            Err(ApiError::task_cancelled(task.as_str()))
        } else {
            Ok(())
        }
    }

    /// Finish a task successfully
    pub fn complete(&self, task: &Ref, result: &str) {
        self.cancel_hooks.lock().remove(task);
        let _ = self.db.tasks.update(task, |t| {
            t.status = TaskStatus::Completed;
            t.progress = 1.0;
            t.result = result.to_string();
            t.finished = Some(Utc::now());
            t.allowed_operations = vec![TaskOperation::Destroy];
        });
    }

    /// Finish a task with the given error
    pub fn fail(&self, task: &Ref, error: &ApiError) {
        self.cancel_hooks.lock().remove(task);
        let cancelled = error.has_code(codes::TASK_CANCELLED);
        let _ = self.db.tasks.update(task, |t| {
            t.status = if cancelled {
                TaskStatus::Cancelled
            } else {
                TaskStatus::Failed
            };
            t.error_info = std::iter::once(error.code.clone())
                .chain(error.args.iter().cloned())
                .collect();
            t.finished = Some(Utc::now());
            t.allowed_operations = vec![TaskOperation::Destroy];
        });
        self.release_locks(task);
    }

    /// Drop the task row and every current_operations entry it still holds
    pub fn destroy(&self, task: &Ref) -> DbResult<()> {
        self.cancel_hooks.lock().remove(task);
        self.release_locks(task);
        let record = self.db.tasks.remove(task)?;
        if !record.subtask_of.is_null() {
            let _ = self.db.tasks.update(&record.subtask_of, |t| {
                t.subtasks.retain(|s| s != task);
            });
        }
        Ok(())
    }

    /// Clear the current_operations entries recorded against this task
    fn release_locks(&self, task: &Ref) {
        let Some(record) = self.get(task) else {
            return;
        };
        for (class, reference) in &record.locked_objects {
            clear_current_operation(&self.db, *class, reference, task);
        }
        let _ = self.db.tasks.update(task, |t| t.locked_objects.clear());
    }

    /// Destroy finished tasks older than `max_age` and sweep stale
    /// current_operations entries whose task row no longer exists or is no
    /// longer pending
    pub fn gc(&self, max_age: Duration) {
        let now = Utc::now();
        let max_age = chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::hours(24));
        for task in self.db.tasks.list() {
            if let Some(finished) = task.finished {
                if task.status.is_finished() && now - finished > max_age {
                    let _ = self.destroy(&task.reference);
                }
            }
        }
        self.sweep_stale_locks();
    }

    /// Every current_operations entry must name a live pending task
    pub fn sweep_stale_locks(&self) {
        let live = |task: &Ref| {
            self.db
                .tasks
                .try_get(task)
                .map(|t| !t.status.is_finished())
                .unwrap_or(false)
        };
        for reference in self.db.vms.refs() {
            let stale: Vec<Ref> = match self.db.vms.try_get(&reference) {
                Some(vm) => vm
                    .current_operations
                    .keys()
                    .filter(|t| !live(t))
                    .cloned()
                    .collect(),
                None => continue,
            };
            if !stale.is_empty() {
                let _ = self.db.vms.update(&reference, |vm| {
                    for t in &stale {
                        vm.current_operations.remove(t);
                    }
                });
            }
        }
        for reference in self.db.vbds.refs() {
            let stale: Vec<Ref> = match self.db.vbds.try_get(&reference) {
                Some(vbd) => vbd
                    .current_operations
                    .keys()
                    .filter(|t| !live(t))
                    .cloned()
                    .collect(),
                None => continue,
            };
            if !stale.is_empty() {
                let _ = self.db.vbds.update(&reference, |vbd| {
                    for t in &stale {
                        vbd.current_operations.remove(t);
                    }
                });
            }
        }
        for reference in self.db.vifs.refs() {
            let stale: Vec<Ref> = match self.db.vifs.try_get(&reference) {
                Some(vif) => vif
                    .current_operations
                    .keys()
                    .filter(|t| !live(t))
                    .cloned()
                    .collect(),
                None => continue,
            };
            if !stale.is_empty() {
                let _ = self.db.vifs.update(&reference, |vif| {
                    for t in &stale {
                        vif.current_operations.remove(t);
                    }
                });
            }
        }
        for reference in self.db.vdis.refs() {
            let stale: Vec<Ref> = match self.db.vdis.try_get(&reference) {
                Some(vdi) => vdi
                    .current_operations
                    .keys()
                    .filter(|t| !live(t))
                    .cloned()
                    .collect(),
                None => continue,
            };
            if !stale.is_empty() {
                let _ = self.db.vdis.update(&reference, |vdi| {
                    for t in &stale {
                        vdi.current_operations.remove(t);
                    }
                });
            }
        }
        for reference in self.db.srs.refs() {
            let stale: Vec<Ref> = match self.db.srs.try_get(&reference) {
                Some(sr) => sr
                    .current_operations
                    .keys()
                    .filter(|t| !live(t))
                    .cloned()
                    .collect(),
                None => continue,
            };
            if !stale.is_empty() {
                let _ = self.db.srs.update(&reference, |sr| {
                    for t in &stale {
                        sr.current_operations.remove(t);
                    }
                });
            }
        }
    }
}

/// Remove one task's current_operations entry from a row
pub fn clear_current_operation(db: &Database, class: Class, reference: &Ref, task: &Ref) {
    match class {
        Class::Vm => {
            let _ = db.vms.update(reference, |vm| {
                vm.current_operations.remove(task);
            });
        }
        Class::Vbd => {
            let _ = db.vbds.update(reference, |vbd| {
                vbd.current_operations.remove(task);
            });
        }
        Class::Vif => {
            let _ = db.vifs.update(reference, |vif| {
                vif.current_operations.remove(task);
            });
        }
        Class::Vdi => {
            let _ = db.vdis.update(reference, |vdi| {
                vdi.current_operations.remove(task);
            });
        }
        Class::Sr => {
            let _ = db.srs.update(reference, |sr| {
                sr.current_operations.remove(task);
            });
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{VmOperation, VmRecord};
    use crate::events::EventBus;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn manager() -> (Arc<Database>, TaskManager) {
        let db = Arc::new(Database::new(Arc::new(EventBus::default())));
        let tasks = TaskManager::new(db.clone(), Ref::generate());
        (db, tasks)
    }

    #[test]
    fn test_create_complete() {
        let (db, tasks) = manager();
        let task = tasks.create("VM.start", None, true).unwrap();
        let record = db.tasks.get(&task).unwrap();
        assert_eq!(record.status, TaskStatus::Pending);
        assert!(record.allowed_operations.contains(&TaskOperation::Cancel));

        tasks.set_progress(&task, 0.5);
        assert_eq!(db.tasks.get(&task).unwrap().progress, 0.5);

        tasks.complete(&task, "OK");
        let record = db.tasks.get(&task).unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.progress, 1.0);
        assert!(record.finished.is_some());
    }

    #[test]
    fn test_subtask_tree() {
        let (db, tasks) = manager();
        let parent = tasks.create("VM.migrate", None, true).unwrap();
        let child = tasks.create("VDI.copy", Some(&parent), true).unwrap();
        assert_eq!(db.tasks.get(&parent).unwrap().subtasks, vec![child.clone()]);
        assert_eq!(db.tasks.get(&child).unwrap().subtask_of, parent);

        tasks.destroy(&child).unwrap();
        assert!(db.tasks.get(&parent).unwrap().subtasks.is_empty());
    }

    #[test]
    fn test_cancel_flow() {
        let (db, tasks) = manager();
        let task = tasks.create("VM.clean_shutdown", None, true).unwrap();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        tasks.set_cancel_hook(&task, Box::new(move || fired2.store(true, Ordering::SeqCst)));

        tasks.cancel(&task).unwrap();
        assert!(fired.load(Ordering::SeqCst));
        assert!(tasks.is_cancelling(&task));
        assert!(tasks.check_cancelling(&task).is_err());

        // Idempotent
        tasks.cancel(&task).unwrap();

        tasks.fail(&task, &ApiError::task_cancelled(task.as_str()));
        assert_eq!(db.tasks.get(&task).unwrap().status, TaskStatus::Cancelled);
    }

    #[test]
    fn test_non_cancellable() {
        let (_db, tasks) = manager();
        let task = tasks.create("critical", None, true).unwrap();
        tasks.set_not_cancellable(&task);
        assert!(tasks.cancel(&task).is_err());
        let record = tasks.get(&task).unwrap();
        assert!(!record.allowed_operations.contains(&TaskOperation::Cancel));
    }

    #[test]
    fn test_destroy_clears_current_operations() {
        let (db, tasks) = manager();
        let vm = VmRecord {
            reference: Ref::generate(),
            uuid: Uuid::new_v4(),
            ..Default::default()
        };
        let vm_ref = vm.reference.clone();
        db.vms.insert(vm).unwrap();

        let task = tasks.create("VM.snapshot", None, true).unwrap();
        db.vms
            .update(&vm_ref, |vm| {
                vm.current_operations
                    .insert(task.clone(), VmOperation::Snapshot);
            })
            .unwrap();
        tasks.add_lock(&task, Class::Vm, &vm_ref);

        tasks.destroy(&task).unwrap();
        assert!(db.vms.get(&vm_ref).unwrap().current_operations.is_empty());
        assert!(db.tasks.try_get(&task).is_none());
    }

    #[test]
    fn test_sweep_stale_locks() {
        let (db, tasks) = manager();
        let vm = VmRecord {
            reference: Ref::generate(),
            uuid: Uuid::new_v4(),
            ..Default::default()
        };
        let vm_ref = vm.reference.clone();
        db.vms.insert(vm).unwrap();

        // An entry naming a task that never existed
        db.vms
            .update(&vm_ref, |vm| {
                vm.current_operations
                    .insert(Ref::generate(), VmOperation::CleanShutdown);
            })
            .unwrap();

        tasks.sweep_stale_locks();
        assert!(db.vms.get(&vm_ref).unwrap().current_operations.is_empty());
    }
}
