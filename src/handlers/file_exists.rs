//! Assert presence of files under the task base path.

use super::{HandlerContext, HandlerResult, StepHandler, StepOutcome};
use crate::config::{StepConfig, StepSettings};
use crate::error::{Error, Result};
use crate::hash::resolve_tracked_path;
use async_trait::async_trait;

/// Handler for `file_exists` steps
pub struct FileExistsHandler;

#[async_trait]
impl StepHandler for FileExistsHandler {
    fn type_key(&self) -> &'static str {
        "file_exists"
    }

    async fn run(
        &self,
        ctx: &HandlerContext<'_>,
        settings: StepSettings,
    ) -> Result<HandlerResult> {
        let StepConfig::FileExists(cfg) = &settings.config else {
            return Err(Error::invalid_config("file_exists handler got wrong variant"));
        };

        // The check is cheap and has no side effects, so it always runs.
        let mut missing = Vec::new();
        for file in &cfg.files {
            ctx.check_cancelled()?;
            let path = resolve_tracked_path(ctx.base_path(), file);
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                missing.push(file.clone());
            }
        }

        if missing.is_empty() {
            Ok(HandlerResult::Done(StepOutcome::success(format!(
                "all {} file(s) present",
                cfg.files.len()
            ))))
        } else {
            Ok(HandlerResult::Done(StepOutcome::failure(format!(
                "missing file(s): {}",
                missing.join(", ")
            ))))
        }
    }
}
