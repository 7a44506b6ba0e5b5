//! Step execution engine.
//!
//! Three entry points differ only in candidate selection: the global sweep
//! over every active task, a per-task run, and a single-step run. Within a
//! run, steps execute in dependency order (ascending id among ready
//! siblings); a step whose dependencies have not all succeeded is deferred
//! with its result untouched; one step's failure never aborts independent
//! branches. The engine owns the advisory per-task run lock and fails fast
//! on contention.

use crate::config::StepSettings;
use crate::docker::ContainerAdapter;
use crate::error::{Error, Result};
use crate::handlers::{result_doc, HandlerContext, HandlerRegistry, HandlerResult};
use crate::resolver::{step_dependencies, StepDag};
use crate::settings::TaskSettings;
use crate::store::{StepRow, Store, TaskRow};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Process-wide run mode restricting which container assignments scored
/// commands execute against. Fixed before a run begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// All assigned containers
    #[default]
    Default,
    /// Only the Golden assignment
    GoldenOnly,
    /// Only the Original assignment
    OriginalOnly,
}

impl RunMode {
    /// Whether a `containers_map` role participates under this mode
    #[must_use]
    pub fn matches_role(self, role: &str) -> bool {
        match self {
            Self::Default => true,
            Self::GoldenOnly => role.to_lowercase().contains("golden"),
            Self::OriginalOnly => role.to_lowercase().contains("original"),
        }
    }
}

/// Cooperative cancellation threaded from the caller into every handler
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// A fresh, un-cancelled token
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; handlers notice at their next check
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Fail with [`Error::Cancelled`] when cancellation was requested
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// What happened to one step during a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    /// Change detection found nothing to do
    Skipped,
    /// Handler ran and recorded success
    Succeeded,
    /// Handler ran and recorded failure, or errored
    Failed(String),
    /// Identity adopted; the step runs next cycle
    Pending,
    /// Dependencies not yet successful; result untouched
    Deferred,
}

/// One line of a run's outcome
#[derive(Debug, Clone)]
pub struct StepReport {
    /// The step id
    pub step_id: i64,
    /// The step title
    pub title: String,
    /// What happened
    pub status: StepStatus,
}

impl StepReport {
    /// Render the one-line summary the run commands print
    #[must_use]
    pub fn summary(&self) -> String {
        match &self.status {
            StepStatus::Skipped => format!("step {} [{}] skipped", self.step_id, self.title),
            StepStatus::Succeeded => format!("step {} [{}] succeeded", self.step_id, self.title),
            StepStatus::Failed(msg) => {
                format!("step {} [{}] failed: {msg}", self.step_id, self.title)
            }
            StepStatus::Pending => format!("step {} [{}] pending next cycle", self.step_id, self.title),
            StepStatus::Deferred => {
                format!("step {} [{}] waiting on dependencies", self.step_id, self.title)
            }
        }
    }
}

/// The step execution engine
pub struct Engine {
    store: Arc<dyn Store>,
    docker: Arc<dyn ContainerAdapter>,
    registry: HandlerRegistry,
    mode: RunMode,
    cancel: CancelToken,
}

impl Engine {
    /// Build an engine with the standard handler registry
    #[must_use]
    pub fn new(store: Arc<dyn Store>, docker: Arc<dyn ContainerAdapter>) -> Self {
        Self {
            store,
            docker,
            registry: HandlerRegistry::standard(),
            mode: RunMode::default(),
            cancel: CancelToken::new(),
        }
    }

    /// Fix the run mode for this engine instance
    #[must_use]
    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    /// The cancel token callers may trigger from another task
    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Global sweep: every step of every active task
    pub async fn run_all(&self) -> Result<Vec<StepReport>> {
        let mut reports = Vec::new();
        for task in self.store.active_tasks().await? {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.run_task(task.id).await {
                Ok(mut task_reports) => reports.append(&mut task_reports),
                Err(Error::TaskLocked { task_id }) => {
                    warn!(task = task_id, "skipping locked task");
                }
                Err(e) => {
                    // A fatal error in one task does not stop the sweep
                    error!(task = task.id, error = %e, "task run aborted");
                }
            }
        }
        Ok(reports)
    }

    /// Run every supported step of one task in dependency order
    pub async fn run_task(&self, task_id: i64) -> Result<Vec<StepReport>> {
        if !self.store.try_lock_task(task_id).await? {
            return Err(Error::TaskLocked { task_id });
        }
        let result = self.run_task_locked(task_id, None, false).await;
        self.store.unlock_task(task_id).await?;
        result
    }

    /// Run a single step, optionally forcing it past change detection.
    /// A successful forced run propagates re-run invalidation to dependent
    /// `rubric_shell` steps.
    pub async fn run_step(&self, step_id: i64, force: bool) -> Result<StepReport> {
        let step = self.store.step(step_id).await?;
        let task_id = step.task_id;
        if !self.store.try_lock_task(task_id).await? {
            return Err(Error::TaskLocked { task_id });
        }
        let result = self.run_task_locked(task_id, Some(step_id), force).await;
        self.store.unlock_task(task_id).await?;
        let reports = result?;
        reports
            .into_iter()
            .find(|r| r.step_id == step_id)
            .ok_or(Error::StepNotFound { step_id })
    }

    async fn run_task_locked(
        &self,
        task_id: i64,
        only_step: Option<i64>,
        force: bool,
    ) -> Result<Vec<StepReport>> {
        let task = self.store.task(task_id).await?;
        let all_steps = self.store.steps_for_task(task_id).await?;

        // Candidates: steps whose settings carry a supported type key
        let candidates: Vec<StepRow> = all_steps
            .iter()
            .filter(|step| {
                step.settings
                    .as_object()
                    .is_some_and(|obj| obj.keys().any(|k| self.registry.supports(k)))
            })
            .cloned()
            .collect();

        // Cycles abort before any handler runs
        let dag = StepDag::build(&candidates)?;

        let mut rows: HashMap<i64, StepRow> =
            candidates.iter().map(|s| (s.id, s.clone())).collect();
        let mut reports = Vec::new();

        for id in dag.order().to_vec() {
            if let Some(only) = only_step {
                if id != only {
                    continue;
                }
            }
            if self.cancel.is_cancelled() {
                break;
            }
            // Re-read the row: a rubric parent earlier in the order may have
            // deleted and regenerated its children while this run was going.
            let step = match self.store.step(id).await {
                Ok(row) => row,
                Err(_) => {
                    rows.remove(&id);
                    continue;
                }
            };
            rows.insert(id, step.clone());
            let report = self
                .run_one(&task, &step, &mut rows, force && only_step == Some(id))
                .await?;
            info!(task = task_id, "{}", report.summary());
            reports.push(report);
        }

        // Invalidate dependents after a successful forced single-step run
        if force {
            if let Some(step_id) = only_step {
                let succeeded = reports
                    .iter()
                    .any(|r| r.step_id == step_id && r.status == StepStatus::Succeeded);
                if succeeded {
                    self.invalidate_dependents(&dag, step_id, &rows).await?;
                }
            }
        }

        Ok(reports)
    }

    async fn run_one(
        &self,
        task: &TaskRow,
        step: &StepRow,
        rows: &mut HashMap<i64, StepRow>,
        force: bool,
    ) -> Result<StepReport> {
        let report = |status| StepReport {
            step_id: step.id,
            title: step.title.clone(),
            status,
        };

        // Dependency fencing: every prerequisite's most recent result must
        // be success. Deferred steps keep their previous result.
        let dep_ids = step_dependencies(&step.settings);
        let mut dep_steps = Vec::new();
        for dep_id in &dep_ids {
            let dep = match rows.get(dep_id) {
                Some(row) => row.clone(),
                None => match self.store.step(*dep_id).await {
                    Ok(row) => row,
                    Err(_) => {
                        warn!(step = step.id, dep = dep_id, "dependency step does not exist");
                        return Ok(report(StepStatus::Deferred));
                    }
                },
            };
            if dep.result_kind() != "success" {
                info!(step = step.id, dep = dep_id, state = dep.result_kind(), "waiting on dependency");
                return Ok(report(StepStatus::Deferred));
            }
            dep_steps.push(dep);
        }

        // Config taxonomy: undecodable settings fail the step, no retry
        let mut settings = match StepSettings::decode(&step.settings) {
            Ok(settings) => settings,
            Err(e) => {
                let results = result_doc("failure", e.to_string());
                self.store.update_step_results(step.id, results).await?;
                self.refresh_row(rows, step.id).await?;
                return Ok(report(StepStatus::Failed(e.to_string())));
            }
        };
        if force {
            settings.config.set_force(true);
        }

        let type_key = settings.config.type_key();
        let Some(handler) = self.registry.get(type_key) else {
            return Ok(report(StepStatus::Skipped));
        };

        // Handlers mutate task settings as they go; read them fresh
        let task = self.store.task(task.id).await?;
        let ctx = HandlerContext {
            task: &task,
            task_settings: TaskSettings::from_value(&task.settings),
            step,
            dep_steps,
            store: self.store.as_ref(),
            docker: self.docker.as_ref(),
            cancel: &self.cancel,
            run_mode: self.mode,
        };

        match handler.run(&ctx, settings).await {
            Ok(HandlerResult::Skipped) => Ok(report(StepStatus::Skipped)),
            Ok(HandlerResult::Pending(outcome)) => {
                self.persist(step.id, outcome).await?;
                self.refresh_row(rows, step.id).await?;
                Ok(report(StepStatus::Pending))
            }
            Ok(HandlerResult::Done(outcome)) => {
                let succeeded = outcome.results.get("result").and_then(Value::as_str)
                    == Some("success");
                let message = outcome
                    .results
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                self.persist(step.id, outcome).await?;
                self.refresh_row(rows, step.id).await?;
                if succeeded {
                    Ok(report(StepStatus::Succeeded))
                } else {
                    Ok(report(StepStatus::Failed(message)))
                }
            }
            Err(Error::Cancelled) => {
                let results = result_doc("failure", "run cancelled");
                self.store.update_step_results(step.id, results).await?;
                self.refresh_row(rows, step.id).await?;
                Ok(report(StepStatus::Failed("run cancelled".to_string())))
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                let mut results = result_doc("failure", e.to_string());
                if let (Value::Object(obj), Error::CommandFailed { output, .. }) =
                    (&mut results, &e)
                {
                    obj.insert("output".to_string(), Value::from(output.clone()));
                }
                self.store.update_step_results(step.id, results).await?;
                self.refresh_row(rows, step.id).await?;
                error!(step = step.id, category = e.category(), error = %e, "step failed");
                Ok(report(StepStatus::Failed(e.to_string())))
            }
        }
    }

    async fn persist(&self, step_id: i64, outcome: crate::handlers::StepOutcome) -> Result<()> {
        if let Some(settings) = outcome.settings {
            self.store.update_step_settings(step_id, settings).await?;
        }
        self.store.update_step_results(step_id, outcome.results).await?;
        Ok(())
    }

    async fn refresh_row(&self, rows: &mut HashMap<i64, StepRow>, step_id: i64) -> Result<()> {
        if let Ok(row) = self.store.step(step_id).await {
            rows.insert(step_id, row);
        }
        Ok(())
    }

    async fn invalidate_dependents(
        &self,
        dag: &StepDag,
        step_id: i64,
        rows: &HashMap<i64, StepRow>,
    ) -> Result<()> {
        for dependent_id in dag.dependents_of(step_id) {
            let Some(row) = rows.get(dependent_id) else {
                continue;
            };
            let Ok(mut settings) = StepSettings::decode(&row.settings) else {
                continue;
            };
            if let crate::config::StepConfig::RubricShell(ref mut cfg) = settings.config {
                cfg.rerun = true;
                self.store
                    .update_step_settings(*dependent_id, settings.to_value()?)
                    .await?;
                info!(step = dependent_id, "marked for re-run after forced dependency run");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_mode_roles() {
        assert!(RunMode::Default.matches_role("golden"));
        assert!(RunMode::Default.matches_role("solution_1"));
        assert!(RunMode::GoldenOnly.matches_role("Golden"));
        assert!(!RunMode::GoldenOnly.matches_role("solution_1"));
        assert!(RunMode::OriginalOnly.matches_role("original"));
        assert!(!RunMode::OriginalOnly.matches_role("golden"));
    }

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        assert!(token.check().is_ok());
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(Error::Cancelled)));
    }

    #[test]
    fn test_report_summary_lines() {
        let report = StepReport {
            step_id: 7,
            title: "build".to_string(),
            status: StepStatus::Skipped,
        };
        assert_eq!(report.summary(), "step 7 [build] skipped");
        let report = StepReport {
            step_id: 7,
            title: "build".to_string(),
            status: StepStatus::Failed("boom".to_string()),
        };
        assert!(report.summary().contains("failed: boom"));
    }
}
