//! Publish a parsed rubric and its file-hash state.
//!
//! Parses the rubric file, stores the tracked hashes, publishes the
//! criterion → content-hash map into the task settings and delegates child
//! synthesis to the step generator whenever anything changed or no
//! children exist.

use super::{HandlerContext, HandlerResult, StepHandler, StepOutcome};
use crate::config::{StepConfig, StepSettings};
use crate::detect;
use crate::error::{Error, Result};
use crate::generator;
use crate::hash;
use crate::rubric;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::info;

/// Handler for `rubric_set` steps
pub struct RubricSetHandler;

/// The container source for generated children: the first dependency that
/// provides containers.
#[must_use]
pub fn resolve_source_step(ctx: &HandlerContext<'_>) -> Option<i64> {
    ctx.container_source_dep().map(|dep| dep.id)
}

#[async_trait]
impl StepHandler for RubricSetHandler {
    fn type_key(&self) -> &'static str {
        "rubric_set"
    }

    async fn run(
        &self,
        ctx: &HandlerContext<'_>,
        mut settings: StepSettings,
    ) -> Result<HandlerResult> {
        let StepConfig::RubricSet(ref mut cfg) = settings.config else {
            return Err(Error::invalid_config("rubric_set handler got wrong variant"));
        };
        if cfg.file.is_empty() {
            return Err(Error::invalid_config("rubric_set requires a rubric file"));
        }

        let mut tracked = vec![cfg.file.clone()];
        tracked.extend(cfg.files.iter().cloned());
        tracked.sort();
        tracked.dedup();

        let changed = detect::changed_tracked_files(ctx.base_path(), &cfg.hashes, &tracked).await;
        let children = generator::generated_children(ctx.store, ctx.task.id, ctx.step.id).await?;

        let mut reasons = Vec::new();
        if cfg.force {
            reasons.push("force flag set".to_string());
        }
        for file in &changed {
            reasons.push(format!("{file} changed"));
        }
        if children.is_empty() {
            reasons.push("no generated steps exist".to_string());
        }
        if detect::never_succeeded(&ctx.step.results) {
            reasons.push("never succeeded".to_string());
        }
        if reasons.is_empty() {
            return Ok(HandlerResult::Skipped);
        }

        ctx.check_cancelled()?;
        let path = hash::resolve_tracked_path(ctx.base_path(), &cfg.file);
        let criteria = rubric::parse_rubric_file(&path).await?;
        info!(step = ctx.step.id, criteria = criteria.len(), reasons = ?reasons, "publishing rubric");

        let source = resolve_source_step(ctx);
        let created =
            generator::regenerate(ctx.store, ctx.task.id, ctx.step.id, source, &criteria, true)
                .await?;

        // Publish per-criterion content hashes for downstream graders
        let mut rubric_map = Map::new();
        for criterion in &criteria {
            rubric_map.insert(criterion.title.clone(), Value::from(criterion.content_hash()));
        }
        ctx.store
            .update_task_settings(ctx.task.id, &json!({"rubric_set": Value::Object(rubric_map)}))
            .await?;

        cfg.hashes = hash::hash_tracked_files(ctx.base_path(), &tracked).await?;
        cfg.force = false;
        let total = criteria.len();
        let encoded = settings.to_value()?;

        Ok(HandlerResult::Done(
            StepOutcome::success(format!("{total} criteria published, {} step(s) generated", created.len()))
                .with_result_field("criteria", Value::from(total as u64))
                .with_settings(encoded),
        ))
    }
}
