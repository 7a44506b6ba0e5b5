//! Run every command from a task-data file in one-shot containers, scored.
//!
//! The task-data file lists numbered lines `<n> [x]|[ ] <command>`; the
//! `[x]` marker makes a command required. Each command runs as
//! `docker run --rm <image> sh -c '<command>'`. A failing required command
//! fails the step immediately with its output; non-required misses are
//! logged and counted. A full pass refreshes the stored file hashes.

use super::{effective_image_tag, HandlerContext, HandlerResult, StepHandler, StepOutcome};
use crate::config::{StepConfig, StepSettings};
use crate::detect;
use crate::error::{Error, Result};
use crate::hash;
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;
use tracing::{info, warn};

/// Handler for `docker_rubrics` steps
pub struct DockerRubricsHandler;

/// One command parsed from a task-data file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDataCommand {
    /// Ordinal from the line
    pub number: u32,
    /// Whether a miss fails the step
    pub required: bool,
    /// Shell command text
    pub command: String,
}

fn line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*(\d+)\s+\[( |x)\]\s+(.+?)\s*$").unwrap())
}

/// Parse the numbered command lines of a task-data file
#[must_use]
pub fn parse_task_data(content: &str) -> Vec<TaskDataCommand> {
    content
        .lines()
        .filter_map(|line| {
            let cap = line_re().captures(line)?;
            Some(TaskDataCommand {
                number: cap[1].parse().ok()?,
                required: &cap[2] == "x",
                command: cap[3].to_string(),
            })
        })
        .collect()
}

#[async_trait]
impl StepHandler for DockerRubricsHandler {
    fn type_key(&self) -> &'static str {
        "docker_rubrics"
    }

    async fn run(
        &self,
        ctx: &HandlerContext<'_>,
        mut settings: StepSettings,
    ) -> Result<HandlerResult> {
        let StepConfig::DockerRubrics(ref mut cfg) = settings.config else {
            return Err(Error::invalid_config("docker_rubrics handler got wrong variant"));
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

        let changed = detect::changed_tracked_files(ctx.base_path(), &cfg.hashes, &cfg.files).await;
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

        let Some(task_data_file) = cfg.files.iter().find(|f| f.contains("TASK_DATA")) else {
            return Err(Error::invalid_config(
                "docker_rubrics files must include a TASK_DATA file",
            ));
        };
        let path = hash::resolve_tracked_path(ctx.base_path(), task_data_file);
        let content = tokio::fs::read_to_string(&path).await.map_err(|e| Error::Io {
            message: format!("reading {}: {e}", path.display()),
            source: e,
        })?;
        let commands = parse_task_data(&content);

        let image = if cfg.image_id.is_empty() {
            if identity.resolved.is_empty() {
                image_tag.clone()
            } else {
                identity.resolved.clone()
            }
        } else {
            cfg.image_id.clone()
        };
        if image.is_empty() {
            return Err(Error::invalid_config("docker_rubrics has no image to run against"));
        }

        info!(step = ctx.step.id, commands = commands.len(), reasons = ?reasons, "running rubric commands");
        let mut passed = 0u32;
        let mut missed = Vec::new();
        for entry in &commands {
            ctx.check_cancelled()?;
            let shell = vec!["sh".to_string(), "-c".to_string(), entry.command.clone()];
            let exec = ctx.docker.image_run(&[], &image, &shell).await?;
            if exec.success() {
                passed += 1;
                continue;
            }
            if entry.required {
                return Ok(HandlerResult::Done(
                    StepOutcome::failure(format!(
                        "required command #{} failed: {}",
                        entry.number, entry.command
                    ))
                    .with_result_field("output", Value::from(exec.output)),
                ));
            }
            warn!(number = entry.number, command = %entry.command, "optional command missed");
            missed.push(entry.number);
        }

        let fresh_hashes = hash::hash_tracked_files(ctx.base_path(), &cfg.files).await?;
        cfg.hashes = fresh_hashes;
        if !identity.resolved.is_empty() {
            cfg.image_id = identity.resolved.clone();
        }
        if !image_tag.is_empty() {
            cfg.image_tag = image_tag;
        }
        cfg.force = false;
        let total = commands.len();
        let encoded = settings.to_value()?;

        Ok(HandlerResult::Done(
            StepOutcome::success(format!("{passed}/{total} command(s) passed"))
                .with_result_field("passed", Value::from(passed))
                .with_result_field("missed", Value::from(missed))
                .with_settings(encoded),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_task_data_lines() {
        let content = "\
# TASK_DATA
1 [x] make build
2 [ ] make lint
not a command line
3 [x] make test
";
        let commands = parse_task_data(content);
        assert_eq!(commands.len(), 3);
        assert!(commands[0].required);
        assert_eq!(commands[0].command, "make build");
        assert!(!commands[1].required);
        assert_eq!(commands[2].number, 3);
    }

    #[test]
    fn test_parse_task_data_empty() {
        assert!(parse_task_data("no numbered lines here\n").is_empty());
    }
}
