//! Start N containers against one image.
//!
//! On any image-identity change every member is removed and recreated;
//! otherwise stopped members are restarted in place. The resulting
//! assignments are recorded both in the task's `containers_map` (the
//! source of truth) and in the step's own `containers` list.

use super::{effective_image_tag, HandlerContext, HandlerResult, StepHandler, StepOutcome};
use crate::config::{StepConfig, StepSettings};
use crate::detect;
use crate::error::{Error, Result};
use crate::handlers::docker_run::wait_until_running;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::info;

/// Seconds to wait for each pool member to report running
const START_WAIT_SECS: u64 = 10;

/// Handler for `docker_pool` steps
pub struct DockerPoolHandler;

fn member_name(task_id: i64, index: u32) -> String {
    format!("task_{task_id}_pool_{index}_container")
}

fn member_role(index: u32) -> String {
    format!("pool_{index}")
}

#[async_trait]
impl StepHandler for DockerPoolHandler {
    fn type_key(&self) -> &'static str {
        "docker_pool"
    }

    async fn run(
        &self,
        ctx: &HandlerContext<'_>,
        mut settings: StepSettings,
    ) -> Result<HandlerResult> {
        let StepConfig::DockerPool(ref mut cfg) = settings.config else {
            return Err(Error::invalid_config("docker_pool handler got wrong variant"));
        };

        let image_tag = effective_image_tag(&cfg.image_tag, &ctx.dep_steps);
        let identity =
            detect::check_image_identity(ctx.docker, &ctx.dep_steps, &image_tag, &cfg.image_id)
                .await?;
        let expected_id = if identity.resolved.is_empty() {
            cfg.image_id.clone()
        } else {
            identity.resolved.clone()
        };

        let desired: Vec<(String, String)> = (1..=cfg.pool_size)
            .map(|i| (member_role(i), member_name(ctx.task.id, i)))
            .collect();

        let mut reasons = Vec::new();
        if cfg.force {
            reasons.push("force flag set".to_string());
        }
        if identity.drifted {
            reasons.push("image identity changed".to_string());
        }
        let recorded: Vec<String> = desired.iter().map(|(_, name)| name.clone()).collect();
        if cfg.containers != recorded {
            reasons.push("pool membership changed".to_string());
        }
        if !identity.drifted && !cfg.force {
            for (_, name) in &desired {
                if detect::container_diverged(ctx.docker, name, &image_tag, &expected_id).await? {
                    reasons.push(format!("{name} missing or diverged"));
                } else if !ctx.docker.container_is_running(name).await? {
                    reasons.push(format!("{name} stopped"));
                }
            }
        }
        if detect::never_succeeded(&ctx.step.results) {
            reasons.push("never succeeded".to_string());
        }
        if reasons.is_empty() {
            return Ok(HandlerResult::Skipped);
        }

        if cfg.pool_size > 0 && image_tag.is_empty() {
            return Err(Error::invalid_config(
                "docker_pool has no image_tag and no dependency provides one",
            ));
        }

        info!(step = ctx.step.id, size = cfg.pool_size, reasons = ?reasons, "reconciling pool");
        let recreate_all = identity.drifted || cfg.force;

        // Members from a previous shape that are no longer wanted
        if !cfg.keep_forever {
            for old in cfg.containers.clone() {
                ctx.check_cancelled()?;
                if !desired.iter().any(|(_, name)| *name == old)
                    && ctx.docker.container_exists(&old).await?
                {
                    ctx.docker.container_remove_force(&old).await?;
                }
            }
        }

        let mut containers_map = Map::new();
        for (role, name) in &desired {
            ctx.check_cancelled()?;
            let diverged =
                detect::container_diverged(ctx.docker, name, &image_tag, &expected_id).await?;
            let mut container_id = name.clone();
            if recreate_all || diverged {
                if ctx.docker.container_exists(name).await? {
                    ctx.docker.container_remove_force(name).await?;
                }
                let mut run_args = vec!["-d".to_string(), "--name".to_string(), name.clone()];
                if let Some(platform) = ctx.task_settings.platform.as_deref() {
                    run_args.insert(0, platform.to_string());
                    run_args.insert(0, "--platform".to_string());
                }
                run_args.extend(ctx.task_settings.docker_run_parameters.iter().cloned());
                let keep_alive: Vec<String> = vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    "tail -f /dev/null".to_string(),
                ];
                container_id = ctx
                    .docker
                    .container_run_detached(&run_args, &image_tag, Some(&keep_alive))
                    .await?;
                wait_until_running(ctx.docker, name, START_WAIT_SECS).await?;
            } else if !ctx.docker.container_is_running(name).await? {
                ctx.docker.container_start(name).await?;
                wait_until_running(ctx.docker, name, START_WAIT_SECS).await?;
            }
            containers_map.insert(
                role.clone(),
                json!({"container_id": container_id, "container_name": name}),
            );
        }

        ctx.store
            .update_task_settings(
                ctx.task.id,
                &json!({"containers_map": Value::Object(containers_map)}),
            )
            .await?;

        cfg.containers = desired.iter().map(|(_, name)| name.clone()).collect();
        cfg.image_id = expected_id;
        if !image_tag.is_empty() {
            cfg.image_tag = image_tag;
        }
        cfg.force = false;
        let size = cfg.pool_size;
        let names = cfg.containers.clone();
        let encoded = settings.to_value()?;

        Ok(HandlerResult::Done(
            StepOutcome::success(format!("pool of {size} container(s) ready"))
                .with_result_field("containers", Value::from(names))
                .with_settings(encoded),
        ))
    }
}
