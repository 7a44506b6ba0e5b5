//! Build an image from tracked files.
//!
//! State machine: `stale → building → tagged`. A rebuild happens when any
//! tracked file hash mismatches or no image id is recorded; on success the
//! new image id and the refreshed hashes are written back in one settings
//! update.

use super::{HandlerContext, HandlerResult, StepHandler, StepOutcome};
use crate::config::{StepConfig, StepSettings};
use crate::detect;
use crate::error::{Error, Result};
use crate::hash;
use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

/// Handler for `docker_build` steps
pub struct DockerBuildHandler;

#[async_trait]
impl StepHandler for DockerBuildHandler {
    fn type_key(&self) -> &'static str {
        "docker_build"
    }

    async fn run(
        &self,
        ctx: &HandlerContext<'_>,
        mut settings: StepSettings,
    ) -> Result<HandlerResult> {
        let StepConfig::DockerBuild(ref mut cfg) = settings.config else {
            return Err(Error::invalid_config("docker_build handler got wrong variant"));
        };
        if cfg.image_tag.is_empty() {
            return Err(Error::invalid_config("docker_build requires an image_tag"));
        }

        let tracked: Vec<String> = cfg.files.keys().cloned().collect();
        let mut reasons = Vec::new();
        if cfg.force {
            reasons.push("force flag set".to_string());
        }
        if cfg.image_id.is_empty() {
            reasons.push("no image id recorded".to_string());
        }
        for file in detect::changed_tracked_files(ctx.base_path(), &cfg.files, &tracked).await {
            reasons.push(format!("{file} changed"));
        }
        if detect::never_succeeded(&ctx.step.results) {
            reasons.push("never succeeded".to_string());
        }
        if reasons.is_empty() {
            return Ok(HandlerResult::Skipped);
        }

        info!(step = ctx.step.id, tag = %cfg.image_tag, reasons = ?reasons, "building image");
        ctx.check_cancelled()?;
        let context_dir = ctx.base_path().unwrap_or(".").to_string();
        ctx.docker
            .image_build(&cfg.parameters, &cfg.image_tag, &context_dir)
            .await?;

        ctx.check_cancelled()?;
        let image_id = ctx.docker.image_inspect_id(&cfg.image_tag).await?;
        let fresh_hashes = hash::hash_tracked_files(ctx.base_path(), &tracked).await?;

        // Identity and hashes land in one settings write
        cfg.image_id = image_id.clone();
        cfg.files = fresh_hashes;
        cfg.force = false;
        let image_tag = cfg.image_tag.clone();
        let encoded = settings.to_value()?;

        Ok(HandlerResult::Done(
            StepOutcome::success(format!("built {image_tag}"))
                .with_result_field("image_id", Value::from(image_id))
                .with_settings(encoded),
        ))
    }
}
