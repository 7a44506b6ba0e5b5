//! Exec an ordered list of commands in a container.
//!
//! The target container comes from the step's own `container_name` or from
//! the container a dependency recorded. Commands run in order; the first
//! non-zero exit fails the step with the captured output. Cancellation is
//! checked between commands.

use super::{effective_image_tag, HandlerContext, HandlerResult, StepHandler, StepOutcome};
use crate::config::{StepConfig, StepSettings};
use crate::detect;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

/// Handler for `docker_shell` steps
pub struct DockerShellHandler;

/// Resolve the container a step should exec into: its own assignment first,
/// then whatever a container-providing dependency recorded in its results.
#[must_use]
pub fn resolve_exec_container(own_name: &str, ctx: &HandlerContext<'_>) -> Option<String> {
    if !own_name.is_empty() {
        return Some(own_name.to_string());
    }
    ctx.container_source_dep().and_then(|dep| {
        dep.results
            .get("container_name")
            .or_else(|| dep.results.get("container_id"))
            .and_then(Value::as_str)
            .map(String::from)
    })
}

#[async_trait]
impl StepHandler for DockerShellHandler {
    fn type_key(&self) -> &'static str {
        "docker_shell"
    }

    async fn run(
        &self,
        ctx: &HandlerContext<'_>,
        mut settings: StepSettings,
    ) -> Result<HandlerResult> {
        let StepConfig::DockerShell(ref mut cfg) = settings.config else {
            return Err(Error::invalid_config("docker_shell handler got wrong variant"));
        };

        let image_tag = effective_image_tag(&cfg.docker.image_tag, &ctx.dep_steps);
        let identity = detect::check_image_identity(
            ctx.docker,
            &ctx.dep_steps,
            &image_tag,
            &cfg.docker.image_id,
        )
        .await?;
        if identity.drifted && !cfg.docker.image_id.is_empty() {
            cfg.docker.image_id = identity.resolved.clone();
            let encoded = settings.to_value()?;
            return Ok(HandlerResult::Pending(
                StepOutcome::pending("image identity updated; will run next cycle")
                    .with_settings(encoded),
            ));
        }

        let mut reasons = Vec::new();
        if cfg.force {
            reasons.push("force flag set".to_string());
        }
        if detect::never_succeeded(&ctx.step.results) {
            reasons.push("never succeeded".to_string());
        }
        if reasons.is_empty() {
            return Ok(HandlerResult::Skipped);
        }

        let Some(container) = resolve_exec_container(&cfg.container_name, ctx) else {
            return Ok(HandlerResult::Done(StepOutcome::failure(
                "no container available: set container_name or depend on a run step",
            )));
        };

        info!(step = ctx.step.id, container = %container, commands = cfg.commands.len(), "running shell commands");
        let mut output = String::new();
        for command in &cfg.commands {
            ctx.check_cancelled()?;
            if command.run.trim().is_empty() {
                continue;
            }
            let exec = ctx.docker.container_exec(&container, &command.run).await?;
            output.push_str(&exec.output);
            if !exec.success() {
                return Ok(HandlerResult::Done(
                    StepOutcome::failure(format!(
                        "command `{}` exited {}",
                        command.run, exec.exit_code
                    ))
                    .with_result_field("output", Value::from(output)),
                ));
            }
        }

        cfg.docker.image_id = identity.resolved.clone();
        if !image_tag.is_empty() {
            cfg.docker.image_tag = image_tag;
        }
        cfg.force = false;
        let count = cfg.commands.len();
        let encoded = settings.to_value()?;

        Ok(HandlerResult::Done(
            StepOutcome::success(format!("{count} command(s) completed"))
                .with_result_field("output", Value::from(output))
                .with_settings(encoded),
        ))
    }
}
