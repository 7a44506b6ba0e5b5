//! Generate child steps from one or more rubric files.
//!
//! `dynamic_lab` and `dynamic_rubric` share this handler; they differ only
//! in type key. All named rubric files parse into one ordered criterion
//! list; regeneration follows the same triggers as `rubric_set` (tracked
//! change, or no children exist). The environment flag decides whether
//! container-bound criteria are generated at all.

use super::{HandlerContext, HandlerResult, StepHandler, StepOutcome};
use crate::config::{DynamicConfig, StepConfig, StepSettings};
use crate::detect;
use crate::error::{Error, Result};
use crate::generator;
use crate::hash;
use crate::rubric;
use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

/// Handler for `dynamic_lab` / `dynamic_rubric` steps
pub struct DynamicHandler {
    key: &'static str,
}

impl DynamicHandler {
    /// The `dynamic_lab` flavour
    #[must_use]
    pub fn lab() -> Self {
        Self { key: "dynamic_lab" }
    }

    /// The `dynamic_rubric` flavour
    #[must_use]
    pub fn rubric() -> Self {
        Self {
            key: "dynamic_rubric",
        }
    }
}

fn rubric_files(cfg: &DynamicConfig) -> Vec<String> {
    let mut files: Vec<String> = cfg.rubric_file.iter().cloned().collect();
    files.extend(cfg.rubrics.iter().cloned());
    files
}

#[async_trait]
impl StepHandler for DynamicHandler {
    fn type_key(&self) -> &'static str {
        self.key
    }

    async fn run(
        &self,
        ctx: &HandlerContext<'_>,
        mut settings: StepSettings,
    ) -> Result<HandlerResult> {
        let cfg = match settings.config {
            StepConfig::DynamicLab(ref mut c) | StepConfig::DynamicRubric(ref mut c) => c,
            _ => {
                return Err(Error::invalid_config("dynamic handler got wrong variant"));
            }
        };
        let rubrics = rubric_files(cfg);
        if rubrics.is_empty() {
            return Err(Error::invalid_config(format!(
                "{} requires rubric_file or rubrics",
                self.key
            )));
        }

        let mut tracked = rubrics.clone();
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

        let mut criteria = Vec::new();
        for file in &rubrics {
            ctx.check_cancelled()?;
            let path = hash::resolve_tracked_path(ctx.base_path(), file);
            criteria.extend(rubric::parse_rubric_file(&path).await?);
        }
        info!(step = ctx.step.id, criteria = criteria.len(), reasons = ?reasons, "regenerating rubric steps");

        let source = super::rubric_set::resolve_source_step(ctx);
        let docker_env = cfg.environment.docker;
        let created = generator::regenerate(
            ctx.store,
            ctx.task.id,
            ctx.step.id,
            source,
            &criteria,
            docker_env,
        )
        .await?;

        cfg.hashes = hash::hash_tracked_files(ctx.base_path(), &tracked).await?;
        cfg.force = false;
        let total = criteria.len();
        let encoded = settings.to_value()?;

        Ok(HandlerResult::Done(
            StepOutcome::success(format!("{} step(s) generated from {total} criteria", created.len()))
                .with_result_field("criteria", Value::from(total as u64))
                .with_result_field("generated", Value::from(created))
                .with_settings(encoded),
        ))
    }
}
