//! Task Bridge
//!
//! Daemon RPCs that return a task id are wrapped here: the caller's database
//! task receives forwarded progress and a cancel hook, and on completion the
//! daemon task is destroyed and its result or classified error returned.

use std::thread;
use std::time::Duration;

use crate::api_error::{ApiError, ApiResult};
use crate::db::models::Ref;

use super::{XenopsAdapter, XenopsTaskState};

/// Poll cadence against the daemon's task-stat endpoint
const POLL_INTERVAL: Duration = Duration::from_millis(50);

impl XenopsAdapter {
    /// Follow a daemon task to completion. Progress lands on `db_task` when
    /// one is supplied, and cancelling `db_task` forwards to the daemon.
    pub fn wait_for_task(
        &self,
        db_task: Option<&Ref>,
        xenops_task: &str,
    ) -> ApiResult<Option<serde_json::Value>> {
        if let Some(task) = db_task {
            let client = self.client.clone();
            let dbg = self.queue.clone();
            let id = xenops_task.to_string();
            self.tasks.set_cancel_hook(
                task,
                Box::new(move || {
                    if let Err(e) = client.task_cancel(&dbg, &id) {
                        log::warn!("forwarding cancel to daemon task {}: {}", id, e);
                    }
                }),
            );
        }

        let result = loop {
            let stat = match self.client.task_stat(self.dbg(), xenops_task) {
                Ok(stat) => stat,
                Err(e) => break Err(e.to_api_error(xenops_task)),
            };
            match stat.state {
                XenopsTaskState::Pending(progress) => {
                    if let Some(task) = db_task {
                        self.tasks.set_progress(task, progress);
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                XenopsTaskState::Completed { result } => break Ok(result),
                XenopsTaskState::Failed(e) => break Err(e.to_api_error(xenops_task)),
            }
        };

        if let Some(task) = db_task {
            self.tasks.clear_cancel_hook(task);
        }
        if let Err(e) = self.client.task_destroy(self.dbg(), xenops_task) {
            log::debug!("destroying daemon task {}: {}", xenops_task, e);
        }
        result
    }

    /// Convenience for RPCs whose result payload is unused
    pub fn run_task(&self, db_task: Option<&Ref>, xenops_task: &str) -> ApiResult<()> {
        self.wait_for_task(db_task, xenops_task).map(|_| ())
    }

    /// Attach daemon-task failure context to an api error
    pub fn rpc_failed(&self, context: &str, error: super::XenopsError) -> ApiError {
        error.to_api_error(context)
    }
}
