//! Sequential task runner with retries.
//!
//! A [`Workflow`] runs named tasks one after another. A failing task is retried
//! according to the [`RetryPolicy`]; if it still fails, the remaining tasks are
//! skipped and the error is returned. The `run` subcommand uses it to chain
//! `train_model >> score_model`.
//!
//! ```rust,ignore
//! let report = Workflow::new("traffic_anomaly_pipeline")
//!     .task("train_model", || train(&registry).map(drop))
//!     .task("score_model", || score(&registry).map(drop))
//!     .run()?;
//! ```

use crate::error::Result;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// How often and how patiently a failed task is re-run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Additional attempts after the first failure (default: 1).
    pub retries: u32,
    /// Fixed wait between attempts (default: 60 s).
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 1,
            delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            retries: 0,
            delay: Duration::ZERO,
        }
    }
}

/// Record of one completed task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskRun {
    pub name: String,
    /// Attempts used, including the successful one.
    pub attempts: u32,
    pub duration_seconds: f64,
}

/// Completed tasks of a workflow run, in execution order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowReport {
    pub workflow: String,
    pub tasks: Vec<TaskRun>,
}

type TaskFn<'a> = Box<dyn Fn() -> Result<()> + 'a>;

/// An ordered chain of tasks.
pub struct Workflow<'a> {
    name: String,
    retry: RetryPolicy,
    tasks: Vec<(String, TaskFn<'a>)>,
}

impl std::fmt::Debug for Workflow<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("name", &self.name)
            .field("retry", &self.retry)
            .field(
                "tasks",
                &self.tasks.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl<'a> Workflow<'a> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            retry: RetryPolicy::default(),
            tasks: Vec::new(),
        }
    }

    #[must_use]
    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Append a task; it runs after every task added before it.
    #[must_use]
    pub fn task(mut self, name: impl Into<String>, run: impl Fn() -> Result<()> + 'a) -> Self {
        self.tasks.push((name.into(), Box::new(run)));
        self
    }

    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.tasks.iter().map(|(n, _)| n.as_str())
    }

    /// Run every task in order.
    ///
    /// # Errors
    ///
    /// The last error of the first task that exhausts its retries, with the
    /// task name attached as context.
    pub fn run(&self) -> Result<WorkflowReport> {
        info!(
            "Workflow '{}': {}",
            self.name,
            self.task_names().collect::<Vec<_>>().join(" >> ")
        );

        let mut completed = Vec::with_capacity(self.tasks.len());
        for (name, task) in &self.tasks {
            let start = Instant::now();
            let attempts = self.run_with_retries(name, task).map_err(|e| {
                let skipped = self.tasks.len() - completed.len() - 1;
                error!("Task '{}' failed, skipping {} downstream task(s)", name, skipped);
                e.with_context(format!("Task '{name}' failed"))
            })?;

            completed.push(TaskRun {
                name: name.clone(),
                attempts,
                duration_seconds: start.elapsed().as_secs_f64(),
            });
            info!("Task '{}' succeeded", name);
        }

        Ok(WorkflowReport {
            workflow: self.name.clone(),
            tasks: completed,
        })
    }

    fn run_with_retries(&self, name: &str, task: &TaskFn<'a>) -> Result<u32> {
        let max_attempts = self.retry.retries + 1;
        let mut attempt = 1;
        loop {
            match task() {
                Ok(()) => return Ok(attempt),
                Err(e) if attempt < max_attempts => {
                    warn!(
                        "Task '{}' attempt {}/{} failed: {}. Retrying in {:?}",
                        name, attempt, max_attempts, e, self.retry.delay
                    );
                    std::thread::sleep(self.retry.delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AnomalyError;
    use std::cell::{Cell, RefCell};

    fn quick() -> RetryPolicy {
        RetryPolicy {
            retries: 1,
            delay: Duration::ZERO,
        }
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.retries, 1);
        assert_eq!(policy.delay, Duration::from_secs(60));
    }

    #[test]
    fn test_tasks_run_in_order() {
        let order = RefCell::new(Vec::new());
        let report = Workflow::new("wf")
            .retry_policy(quick())
            .task("train_model", || {
                order.borrow_mut().push("train");
                Ok(())
            })
            .task("score_model", || {
                order.borrow_mut().push("score");
                Ok(())
            })
            .run()
            .unwrap();

        assert_eq!(*order.borrow(), vec!["train", "score"]);
        assert_eq!(report.tasks.len(), 2);
        assert!(report.tasks.iter().all(|t| t.attempts == 1));
    }

    #[test]
    fn test_flaky_task_is_retried() {
        let calls = Cell::new(0);
        let report = Workflow::new("wf")
            .retry_policy(quick())
            .task("train_model", || {
                calls.set(calls.get() + 1);
                if calls.get() == 1 {
                    Err(AnomalyError::registry("create_run", "connection reset"))
                } else {
                    Ok(())
                }
            })
            .run()
            .unwrap();

        assert_eq!(calls.get(), 2);
        assert_eq!(report.tasks[0].attempts, 2);
    }

    #[test]
    fn test_failure_skips_downstream() {
        let scored = Cell::new(false);
        let err = Workflow::new("wf")
            .retry_policy(quick())
            .task("train_model", || {
                Err(AnomalyError::InvalidData("empty".into()))
            })
            .task("score_model", || {
                scored.set(true);
                Ok(())
            })
            .run()
            .unwrap_err();

        assert!(!scored.get());
        assert!(err.to_string().contains("train_model"));
        assert_eq!(err.error_code(), "INVALID_DATA");
    }

    #[test]
    fn test_no_retries() {
        let calls = Cell::new(0);
        let result = Workflow::new("wf")
            .retry_policy(RetryPolicy::none())
            .task("t", || {
                calls.set(calls.get() + 1);
                Err(AnomalyError::TrainingFailed("boom".into()))
            })
            .run();
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }
}
