//! One container per solution patch, each with its own host-mounted volume.
//!
//! Member containers are named `task_<taskId>_<patch-stem>_container` and
//! mount `volume_solutionN` from the task base path onto the app folder.
//! On every (re)create the project tree is reset (`git reset --hard HEAD`,
//! `git checkout -- .`, `git clean -fd`) and then the grading-setup patch,
//! the solution patch and the held-out-test patch are applied, in that
//! exact order. A successful run writes `force` back to false.

use super::{expand_placeholders, HandlerContext, HandlerResult, StepHandler, StepOutcome};
use crate::config::{StepConfig, StepSettings};
use crate::detect;
use crate::error::{Error, Result};
use crate::handlers::docker_run::wait_until_running;
use crate::hash;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

/// Seconds to wait for each member to report running
const START_WAIT_SECS: u64 = 15;

/// Handler for `docker_volume_pool` steps
pub struct DockerVolumePoolHandler;

/// The stem a patch file contributes to its container name
#[must_use]
pub fn patch_stem(patch: &str) -> String {
    Path::new(patch)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| patch.to_string())
}

/// Deterministic container name for one solution patch
#[must_use]
pub fn solution_container_name(task_id: i64, patch: &str) -> String {
    format!("task_{task_id}_{}_container", patch_stem(patch))
}

impl DockerVolumePoolHandler {
    /// Copy a patch into the container and `git apply` it
    async fn apply_patch(
        ctx: &HandlerContext<'_>,
        container: &str,
        app_folder: &str,
        host_patch: &str,
        container_patch: &str,
    ) -> Result<()> {
        ctx.check_cancelled()?;
        let host_path = hash::resolve_tracked_path(ctx.base_path(), host_patch);
        ctx.docker
            .container_copy_in(container, &host_path.to_string_lossy(), container_patch)
            .await?;
        let exec = ctx
            .docker
            .container_exec(container, &format!("cd {app_folder}; git apply {container_patch}"))
            .await?;
        if !exec.success() {
            return Err(Error::command_failed(
                format!("git apply {container_patch} in {container}"),
                exec.exit_code,
                exec.output,
            ));
        }
        Ok(())
    }

    /// Reset the tree, then apply setup → solution → held-out, in order
    async fn provision(
        ctx: &HandlerContext<'_>,
        container: &str,
        app_folder: &str,
        grading_setup: &str,
        solution: &str,
        held_out: &str,
    ) -> Result<()> {
        for reset_cmd in [
            "git reset --hard HEAD",
            "git checkout -- .",
            "git clean -fd",
        ] {
            ctx.check_cancelled()?;
            let exec = ctx
                .docker
                .container_exec(container, &format!("cd {app_folder}; {reset_cmd}"))
                .await?;
            if !exec.success() {
                return Err(Error::command_failed(
                    format!("{reset_cmd} in {container}"),
                    exec.exit_code,
                    exec.output,
                ));
            }
        }
        if !grading_setup.is_empty() {
            Self::apply_patch(ctx, container, app_folder, grading_setup, "/tmp/grading_setup.patch")
                .await?;
        }
        if !solution.is_empty() {
            let dest = format!("/tmp/{}", file_name(solution));
            Self::apply_patch(ctx, container, app_folder, solution, &dest).await?;
        }
        if !held_out.is_empty() {
            let dest = format!("/tmp/{}", file_name(held_out));
            Self::apply_patch(ctx, container, app_folder, held_out, &dest).await?;
        }
        Ok(())
    }
}

fn file_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string())
}

#[async_trait]
impl StepHandler for DockerVolumePoolHandler {
    fn type_key(&self) -> &'static str {
        "docker_volume_pool"
    }

    async fn run(
        &self,
        ctx: &HandlerContext<'_>,
        mut settings: StepSettings,
    ) -> Result<HandlerResult> {
        let StepConfig::DockerVolumePool(ref mut cfg) = settings.config else {
            return Err(Error::invalid_config(
                "docker_volume_pool handler got wrong variant",
            ));
        };

        let image_tag = super::effective_image_tag(&cfg.triggers.image_tag, &ctx.dep_steps);
        let identity = detect::check_image_identity(
            ctx.docker,
            &ctx.dep_steps,
            &image_tag,
            &cfg.triggers.image_id,
        )
        .await?;
        let expected_id = if identity.resolved.is_empty() {
            cfg.triggers.image_id.clone()
        } else {
            identity.resolved.clone()
        };

        let tracked: Vec<String> = cfg.triggers.files.keys().cloned().collect();
        let changed =
            detect::changed_tracked_files(ctx.base_path(), &cfg.triggers.files, &tracked).await;

        let desired: Vec<(String, String)> = cfg
            .solutions
            .iter()
            .map(|patch| (patch.clone(), solution_container_name(ctx.task.id, patch)))
            .collect();

        let mut reasons = Vec::new();
        if cfg.force {
            reasons.push("force flag set".to_string());
        }
        if identity.drifted {
            reasons.push("image identity changed".to_string());
        }
        for file in &changed {
            reasons.push(format!("{file} changed"));
        }
        let recorded: BTreeMap<String, String> = desired.iter().cloned().collect();
        if cfg.triggers.containers != recorded {
            reasons.push("pool membership changed".to_string());
        }
        let mut diverged_members = Vec::new();
        if reasons.is_empty() {
            for (_, name) in &desired {
                if detect::container_diverged(ctx.docker, name, &image_tag, &expected_id).await? {
                    diverged_members.push(name.clone());
                } else if !ctx.docker.container_is_running(name).await? {
                    diverged_members.push(name.clone());
                }
            }
            if !diverged_members.is_empty() {
                reasons.push(format!("{} member(s) diverged", diverged_members.len()));
            }
        }
        if detect::never_succeeded(&ctx.step.results) {
            reasons.push("never succeeded".to_string());
        }
        if reasons.is_empty() {
            return Ok(HandlerResult::Skipped);
        }

        if !desired.is_empty() && image_tag.is_empty() {
            return Err(Error::invalid_config(
                "docker_volume_pool has no image_tag and no dependency provides one",
            ));
        }

        info!(step = ctx.step.id, members = desired.len(), reasons = ?reasons, "reconciling volume pool");
        let recreate_all = cfg.force || identity.drifted || !changed.is_empty();
        let app_folder = ctx
            .task_settings
            .app_folder
            .clone()
            .unwrap_or_else(|| "/app".to_string());
        let volume_name = ctx.task_settings.volume_name.clone().unwrap_or_default();
        let base = ctx.base_path().unwrap_or(".").to_string();

        // Stale members from a previous membership
        if !cfg.keep_forever {
            for old in cfg.triggers.containers.values() {
                ctx.check_cancelled()?;
                if !desired.iter().any(|(_, name)| name == old)
                    && ctx.docker.container_exists(old).await?
                {
                    ctx.docker.container_remove_force(old).await?;
                }
            }
        }

        let mut containers_map = Map::new();
        for (index, (patch, name)) in desired.iter().enumerate() {
            ctx.check_cancelled()?;
            let volume_dir = format!("volume_solution{}", index + 1);
            let host_dir = format!("{base}/{volume_dir}");

            let needs_recreate = recreate_all
                || diverged_members.contains(name)
                || detect::container_diverged(ctx.docker, name, &image_tag, &expected_id).await?;

            let mut container_id = name.clone();
            if needs_recreate {
                if ctx.docker.container_exists(name).await? {
                    ctx.docker.container_remove_force(name).await?;
                }
                let platform = ctx
                    .task_settings
                    .platform
                    .clone()
                    .unwrap_or_else(|| "linux/amd64".to_string());
                let mut run_args = vec![
                    "--platform".to_string(),
                    platform,
                    "-d".to_string(),
                    "--name".to_string(),
                    name.clone(),
                    "-v".to_string(),
                    format!("{host_dir}:{app_folder}"),
                ];
                let mut subs = BTreeMap::new();
                subs.insert("HOSTPATH", host_dir.clone());
                subs.insert("DOCKERVOLUME", volume_dir.clone());
                subs.insert("IMAGETAG", image_tag.clone());
                subs.insert("VOLUME_NAME", volume_name.clone());
                subs.insert("CONTAINER_NAME", name.clone());
                subs.insert("APP_FOLDER", app_folder.clone());
                run_args.extend(expand_placeholders(
                    &ctx.task_settings.docker_run_parameters,
                    &subs,
                ));
                run_args.extend(expand_placeholders(&cfg.parameters, &subs));

                let keep_alive: Vec<String> = vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    "tail -f /dev/null".to_string(),
                ];
                let has_command = run_args.iter().any(|a| a == "--entrypoint");
                let command = (cfg.keep_forever && !has_command).then_some(keep_alive.as_slice());
                container_id = ctx
                    .docker
                    .container_run_detached(&run_args, &image_tag, command)
                    .await?;
                wait_until_running(ctx.docker, name, START_WAIT_SECS).await?;

                Self::provision(
                    ctx,
                    name,
                    &app_folder,
                    &cfg.grading_setup_script,
                    patch,
                    &cfg.held_out_test_file,
                )
                .await?;
            } else if !ctx.docker.container_is_running(name).await? {
                ctx.docker.container_start(name).await?;
                wait_until_running(ctx.docker, name, START_WAIT_SECS).await?;
            } else {
                warn!(container = %name, "member already converged; left untouched");
            }

            containers_map.insert(
                patch_stem(patch),
                json!({"container_id": container_id, "container_name": name}),
            );
        }

        ctx.store
            .update_task_settings(
                ctx.task.id,
                &json!({"containers_map": Value::Object(containers_map)}),
            )
            .await?;

        let fresh_hashes = hash::hash_tracked_files(ctx.base_path(), &tracked).await?;
        cfg.triggers.files = fresh_hashes;
        cfg.triggers.containers = desired.iter().cloned().collect();
        cfg.triggers.image_id = expected_id;
        if !image_tag.is_empty() {
            cfg.triggers.image_tag = image_tag;
        }
        cfg.force = false;
        let members = cfg.solutions.len();
        let names: Vec<String> = desired.iter().map(|(_, n)| n.clone()).collect();
        let encoded = settings.to_value()?;

        Ok(HandlerResult::Done(
            StepOutcome::success(format!("{members} solution container(s) ready"))
                .with_result_field("containers", Value::from(names))
                .with_settings(encoded),
        ))
    }
}
