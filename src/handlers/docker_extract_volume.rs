//! Extract the app folder from an image into a named host volume.
//!
//! The volume is (re)built by running a throwaway container that mounts it
//! and copies the app folder across. Tracked file changes and the force
//! flag trigger a rebuild; `force` is written back to false afterwards.

use super::{effective_image_tag, HandlerContext, HandlerResult, StepHandler, StepOutcome};
use crate::config::{StepConfig, StepSettings};
use crate::detect;
use crate::error::{Error, Result};
use crate::hash;
use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

/// Mount point of the target volume inside the throwaway container
const EXTRACT_MOUNT: &str = "/task_sync_extract";

/// Handler for `docker_extract_volume` steps
pub struct DockerExtractVolumeHandler;

#[async_trait]
impl StepHandler for DockerExtractVolumeHandler {
    fn type_key(&self) -> &'static str {
        "docker_extract_volume"
    }

    async fn run(
        &self,
        ctx: &HandlerContext<'_>,
        mut settings: StepSettings,
    ) -> Result<HandlerResult> {
        let StepConfig::DockerExtractVolume(ref mut cfg) = settings.config else {
            return Err(Error::invalid_config(
                "docker_extract_volume handler got wrong variant",
            ));
        };

        let volume_name = if cfg.volume_name.is_empty() {
            ctx.task_settings.volume_name.clone().unwrap_or_default()
        } else {
            cfg.volume_name.clone()
        };
        if volume_name.is_empty() {
            return Err(Error::invalid_config(
                "docker_extract_volume requires a volume_name",
            ));
        }
        let app_folder = if cfg.app_folder.is_empty() {
            ctx.task_settings
                .app_folder
                .clone()
                .unwrap_or_else(|| "/app".to_string())
        } else {
            cfg.app_folder.clone()
        };

        let image_tag = effective_image_tag(&cfg.image_tag, &ctx.dep_steps);
        let identity =
            detect::check_image_identity(ctx.docker, &ctx.dep_steps, &image_tag, &cfg.image_id)
                .await?;
        if identity.drifted && !cfg.image_id.is_empty() {
            cfg.image_id = identity.resolved.clone();
            let encoded = settings.to_value()?;
            return Ok(HandlerResult::Pending(
                StepOutcome::pending("image identity updated; will run next cycle")
                    .with_settings(encoded),
            ));
        }

        let tracked: Vec<String> = cfg.triggers.files.keys().cloned().collect();
        let changed =
            detect::changed_tracked_files(ctx.base_path(), &cfg.triggers.files, &tracked).await;

        let mut reasons = Vec::new();
        if cfg.force {
            reasons.push("force flag set".to_string());
        }
        if !ctx.docker.volume_exists(&volume_name).await? {
            reasons.push("volume missing".to_string());
        }
        for file in &changed {
            reasons.push(format!("{file} changed"));
        }
        if detect::never_succeeded(&ctx.step.results) {
            reasons.push("never succeeded".to_string());
        }
        if reasons.is_empty() {
            return Ok(HandlerResult::Skipped);
        }

        let image = if cfg.image_id.is_empty() {
            image_tag.clone()
        } else {
            cfg.image_id.clone()
        };
        if image.is_empty() {
            return Err(Error::invalid_config(
                "docker_extract_volume has no image to extract from",
            ));
        }

        info!(step = ctx.step.id, volume = %volume_name, reasons = ?reasons, "extracting volume");
        ctx.check_cancelled()?;

        // Mounting a non-existent named volume creates it
        let run_args = vec!["-v".to_string(), format!("{volume_name}:{EXTRACT_MOUNT}")];
        let copy_cmd = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("cp -a {app_folder}/. {EXTRACT_MOUNT}/"),
        ];
        let exec = ctx.docker.image_run(&run_args, &image, &copy_cmd).await?;
        if !exec.success() {
            return Err(Error::command_failed(
                format!("extracting {app_folder} into {volume_name}"),
                exec.exit_code,
                exec.output,
            ));
        }

        let fresh_hashes = hash::hash_tracked_files(ctx.base_path(), &tracked).await?;
        cfg.triggers.files = fresh_hashes;
        cfg.volume_name = volume_name.clone();
        cfg.app_folder = app_folder;
        if !identity.resolved.is_empty() {
            cfg.image_id = identity.resolved.clone();
        }
        if !image_tag.is_empty() {
            cfg.image_tag = image_tag;
        }
        cfg.force = false;
        let encoded = settings.to_value()?;

        Ok(HandlerResult::Done(
            StepOutcome::success(format!("volume {volume_name} extracted"))
                .with_settings(encoded),
        ))
    }
}
