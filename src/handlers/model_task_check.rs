//! Compose a prompt document from tracked source files.

use super::{HandlerContext, HandlerResult, StepHandler, StepOutcome};
use crate::config::{StepConfig, StepSettings};
use crate::detect;
use crate::error::{Error, Result};
use crate::hash;
use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

/// Handler for `model_task_check` steps
pub struct ModelTaskCheckHandler;

#[async_trait]
impl StepHandler for ModelTaskCheckHandler {
    fn type_key(&self) -> &'static str {
        "model_task_check"
    }

    async fn run(
        &self,
        ctx: &HandlerContext<'_>,
        mut settings: StepSettings,
    ) -> Result<HandlerResult> {
        let StepConfig::ModelTaskCheck(ref mut cfg) = settings.config else {
            return Err(Error::invalid_config(
                "model_task_check handler got wrong variant",
            ));
        };
        if cfg.files.is_empty() {
            return Err(Error::invalid_config("model_task_check requires files"));
        }

        let changed =
            detect::changed_tracked_files(ctx.base_path(), &cfg.triggers.files, &cfg.files).await;
        let mut reasons = Vec::new();
        if cfg.force {
            reasons.push("force flag set".to_string());
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

        let mut prompt = String::new();
        for file in &cfg.files {
            ctx.check_cancelled()?;
            let path = hash::resolve_tracked_path(ctx.base_path(), file);
            let content = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io {
                    message: format!("reading {}: {e}", path.display()),
                    source: e,
                })?;
            prompt.push_str(&format!("## {file}\n\n{content}\n\n"));
        }
        info!(step = ctx.step.id, files = cfg.files.len(), bytes = prompt.len(), "composed prompt");

        cfg.triggers.files = hash::hash_tracked_files(ctx.base_path(), &cfg.files).await?;
        cfg.force = false;
        let count = cfg.files.len();
        let encoded = settings.to_value()?;

        Ok(HandlerResult::Done(
            StepOutcome::success(format!("prompt composed from {count} file(s)"))
                .with_result_field("prompt", Value::from(prompt))
                .with_settings(encoded),
        ))
    }
}
