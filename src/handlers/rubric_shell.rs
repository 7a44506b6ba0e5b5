//! Run a single criterion command inside assigned containers, scored.
//!
//! Assignments come from the step's own `container_name`, or from the
//! task's `containers_map` filtered by the run mode (golden-only /
//! original-only restrict scored commands to that single assignment).
//! Every execution stamps `last_run` with the container image id and exit
//! status; `rerun` forces one execution and is written back to false.

use super::{effective_image_tag, HandlerContext, HandlerResult, StepHandler, StepOutcome};
use crate::config::{LastRun, StepConfig, StepSettings};
use crate::detect;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

/// Handler for `rubric_shell` steps
pub struct RubricShellHandler;

/// The `(role, container-name)` pairs a criterion runs against
#[must_use]
pub fn resolve_assignments(ctx: &HandlerContext<'_>, own_name: &str) -> Vec<(String, String)> {
    if !own_name.is_empty() {
        return vec![("assigned".to_string(), own_name.to_string())];
    }
    let mut assignments: Vec<(String, String)> = ctx
        .task_settings
        .containers_map
        .iter()
        .filter(|(role, _)| ctx.run_mode.matches_role(role))
        .map(|(role, c)| (role.clone(), c.container_name.clone()))
        .filter(|(_, name)| !name.is_empty())
        .collect();
    if assignments.is_empty() {
        // Fall back to the container a dependency recorded
        if let Some(name) =
            super::docker_shell::resolve_exec_container("", ctx)
        {
            assignments.push(("dependency".to_string(), name));
        }
    }
    assignments
}

#[async_trait]
impl StepHandler for RubricShellHandler {
    fn type_key(&self) -> &'static str {
        "rubric_shell"
    }

    async fn run(
        &self,
        ctx: &HandlerContext<'_>,
        mut settings: StepSettings,
    ) -> Result<HandlerResult> {
        let StepConfig::RubricShell(ref mut cfg) = settings.config else {
            return Err(Error::invalid_config("rubric_shell handler got wrong variant"));
        };
        if cfg.command.is_empty() {
            return Err(Error::invalid_config("rubric_shell requires a command"));
        }

        let image_tag = effective_image_tag(&cfg.image_tag, &ctx.dep_steps);
        let current_id =
            detect::resolve_image_id(ctx.docker, &ctx.dep_steps, &image_tag).await?;

        if !cfg.rerun {
            if let Some(last) = &cfg.last_run {
                if !current_id.is_empty() && last.image_id == current_id {
                    return Ok(HandlerResult::Skipped);
                }
            }
        }

        let assignments = resolve_assignments(ctx, &cfg.container_name);
        if assignments.is_empty() {
            return Ok(HandlerResult::Done(StepOutcome::failure(
                "no container assigned for this criterion",
            )));
        }

        info!(
            step = ctx.step.id,
            criterion = %cfg.criterion_id,
            containers = assignments.len(),
            "running criterion command"
        );

        let cleanup = ctx.task_settings.held_out_cleanup().map(String::from);
        let mut outputs = Map::new();
        let mut worst_exit = 0;
        let mut failures = Vec::new();
        for (role, container) in &assignments {
            ctx.check_cancelled()?;
            let exec = ctx.docker.container_exec(container, &cfg.command).await?;
            if !exec.success() {
                worst_exit = exec.exit_code;
                failures.push(role.clone());
            }
            outputs.insert(role.clone(), Value::from(exec.output));

            if let Some(cleanup_cmd) = cleanup.as_deref() {
                ctx.check_cancelled()?;
                let cleaned = ctx.docker.container_exec(container, cleanup_cmd).await?;
                if !cleaned.success() {
                    warn!(container = %container, "held-out cleanup command failed");
                }
            }
        }

        cfg.last_run = Some(LastRun {
            image_id: current_id.clone(),
            exit_code: worst_exit,
        });
        if !current_id.is_empty() {
            cfg.image_id = current_id;
        }
        if !image_tag.is_empty() {
            cfg.image_tag = image_tag;
        }
        cfg.rerun = false;

        let passed = failures.is_empty();
        let score = if passed { cfg.score } else { 0 };
        let summary = json!({
            "criterion_id": cfg.criterion_id,
            "counter": cfg.counter,
            "required": cfg.required,
            "score": score,
        });
        let encoded = settings.to_value()?;

        let outcome = if passed {
            StepOutcome::success("criterion passed")
        } else {
            StepOutcome::failure(format!("criterion failed in: {}", failures.join(", ")))
        };
        Ok(HandlerResult::Done(
            outcome
                .with_result_field("output", Value::Object(outputs))
                .with_result_field("grading", summary)
                .with_settings(encoded),
        ))
    }
}
