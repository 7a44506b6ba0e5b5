//! Fetch a tagged image.
//!
//! `prevent_run_before` is an RFC3339 UTC instant; until it passes, the
//! step is skipped outright. Identity is the local digest of the tag after
//! the pull.

use super::{HandlerContext, HandlerResult, StepHandler, StepOutcome};
use crate::config::{StepConfig, StepSettings};
use crate::detect;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::info;

/// Handler for `docker_pull` steps
pub struct DockerPullHandler;

#[async_trait]
impl StepHandler for DockerPullHandler {
    fn type_key(&self) -> &'static str {
        "docker_pull"
    }

    async fn run(
        &self,
        ctx: &HandlerContext<'_>,
        mut settings: StepSettings,
    ) -> Result<HandlerResult> {
        let StepConfig::DockerPull(ref mut cfg) = settings.config else {
            return Err(Error::invalid_config("docker_pull handler got wrong variant"));
        };
        if cfg.image_tag.is_empty() {
            return Err(Error::invalid_config("docker_pull requires an image_tag"));
        }

        if let Some(not_before) = cfg.prevent_run_before {
            if Utc::now() < not_before {
                info!(step = ctx.step.id, until = %not_before.to_rfc3339(), "pull window not open yet");
                return Ok(HandlerResult::Skipped);
            }
        }

        let local_id = ctx
            .docker
            .image_inspect_id(&cfg.image_tag)
            .await
            .unwrap_or_default();
        let mut reasons = Vec::new();
        if cfg.force {
            reasons.push("force flag set".to_string());
        }
        if local_id.is_empty() {
            reasons.push("image not present locally".to_string());
        } else if cfg.image_id.is_empty() {
            reasons.push("no image id recorded".to_string());
        } else if local_id != cfg.image_id {
            reasons.push("local image differs from recorded id".to_string());
        }
        if detect::never_succeeded(&ctx.step.results) {
            reasons.push("never succeeded".to_string());
        }
        if reasons.is_empty() {
            return Ok(HandlerResult::Skipped);
        }

        info!(step = ctx.step.id, tag = %cfg.image_tag, reasons = ?reasons, "pulling image");
        ctx.check_cancelled()?;
        ctx.docker.image_pull(&cfg.image_tag).await?;
        let image_id = ctx.docker.image_inspect_id(&cfg.image_tag).await?;

        cfg.image_id = image_id.clone();
        cfg.force = false;
        let image_tag = cfg.image_tag.clone();
        let encoded = settings.to_value()?;

        Ok(HandlerResult::Done(
            StepOutcome::success(format!("pulled {image_tag}"))
                .with_result_field("image_id", Value::from(image_id))
                .with_settings(encoded),
        ))
    }
}
