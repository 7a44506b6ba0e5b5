//! Start a single long-lived container.
//!
//! The container converges on the expected image identity: when the
//! existing container was created from a different reference or digest it
//! is force-removed and recreated; when it is merely stopped it is
//! restarted.

use super::{effective_image_tag, HandlerContext, HandlerResult, StepHandler, StepOutcome};
use crate::config::{StepConfig, StepSettings};
use crate::detect;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

/// Seconds to wait for a started container to report running
const START_WAIT_SECS: u64 = 10;

/// Handler for `docker_run` steps
pub struct DockerRunHandler;

/// Default container name for a run step
#[must_use]
pub fn default_container_name(task_id: i64, step_id: i64) -> String {
    format!("task_{task_id}_{step_id}_container")
}

/// Poll until a container reports running, up to `wait_secs`
pub async fn wait_until_running(
    docker: &dyn crate::docker::ContainerAdapter,
    name: &str,
    wait_secs: u64,
) -> Result<()> {
    for _ in 0..wait_secs {
        if docker.container_is_running(name).await? {
            return Ok(());
        }
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    }
    Err(Error::timeout(format!("container {name} to run"), wait_secs))
}

#[async_trait]
impl StepHandler for DockerRunHandler {
    fn type_key(&self) -> &'static str {
        "docker_run"
    }

    async fn run(
        &self,
        ctx: &HandlerContext<'_>,
        mut settings: StepSettings,
    ) -> Result<HandlerResult> {
        let StepConfig::DockerRun(ref mut cfg) = settings.config else {
            return Err(Error::invalid_config("docker_run handler got wrong variant"));
        };

        let image_tag = effective_image_tag(&cfg.image_tag, &ctx.dep_steps);
        if image_tag.is_empty() {
            return Err(Error::invalid_config(
                "docker_run has no image_tag and no dependency provides one",
            ));
        }
        let name = if cfg.container_name.is_empty() {
            default_container_name(ctx.task.id, ctx.step.id)
        } else {
            cfg.container_name.clone()
        };

        let identity = detect::check_image_identity(
            ctx.docker,
            &ctx.dep_steps,
            &image_tag,
            &cfg.image_id,
        )
        .await?;
        if identity.drifted && !cfg.image_id.is_empty() {
            // Adopt the fresher id now; the container is recreated next cycle
            cfg.image_id = identity.resolved.clone();
            let encoded = settings.to_value()?;
            return Ok(HandlerResult::Pending(
                StepOutcome::pending("image identity updated; will run next cycle")
                    .with_settings(encoded),
            ));
        }

        let expected_id = if cfg.image_id.is_empty() {
            identity.resolved.clone()
        } else {
            cfg.image_id.clone()
        };
        let diverged = detect::container_diverged(ctx.docker, &name, &image_tag, &expected_id).await?;
        let running = !diverged && ctx.docker.container_is_running(&name).await?;

        let mut reasons = Vec::new();
        if cfg.force {
            reasons.push("force flag set".to_string());
        }
        if diverged {
            reasons.push("container missing or image diverged".to_string());
        } else if !running {
            reasons.push("container stopped".to_string());
        }
        if detect::never_succeeded(&ctx.step.results) {
            reasons.push("never succeeded".to_string());
        }
        if reasons.is_empty() {
            return Ok(HandlerResult::Skipped);
        }

        info!(step = ctx.step.id, container = %name, reasons = ?reasons, "ensuring container");
        ctx.check_cancelled()?;

        let mut container_id = name.clone();
        if diverged || cfg.force {
            if ctx.docker.container_exists(&name).await? {
                ctx.docker.container_remove_force(&name).await?;
            }
            let mut run_args = vec!["-d".to_string(), "--name".to_string(), name.clone()];
            if let Some(platform) = ctx.task_settings.platform.as_deref() {
                run_args.insert(0, platform.to_string());
                run_args.insert(0, "--platform".to_string());
            }
            run_args.extend(ctx.task_settings.docker_run_parameters.iter().cloned());
            run_args.extend(cfg.parameters.iter().cloned());

            let keep_alive: Vec<String> = vec![
                "sh".to_string(),
                "-c".to_string(),
                "tail -f /dev/null".to_string(),
            ];
            let command = cfg.keep_forever.then_some(keep_alive.as_slice());
            container_id = ctx
                .docker
                .container_run_detached(&run_args, &image_tag, command)
                .await?;
            wait_until_running(ctx.docker, &name, START_WAIT_SECS).await?;
        } else if !running {
            ctx.docker.container_start(&name).await?;
            wait_until_running(ctx.docker, &name, START_WAIT_SECS).await?;
        }

        cfg.image_id = if identity.resolved.is_empty() {
            expected_id
        } else {
            identity.resolved.clone()
        };
        cfg.image_tag = image_tag;
        cfg.container_name = name.clone();
        cfg.force = false;
        let encoded = settings.to_value()?;

        Ok(HandlerResult::Done(
            StepOutcome::success(format!("container {name} running"))
                .with_result_field("container_id", Value::from(container_id))
                .with_result_field("container_name", Value::from(name))
                .with_settings(encoded),
        ))
    }
}
