//! Container engine adapter.
//!
//! All interaction with the container engine goes through the
//! [`ContainerAdapter`] trait so the engine and every handler can be tested
//! against a scripted fake without spawning real processes. The production
//! implementation, [`DockerCli`], shells out to the `docker` binary via
//! `tokio::process` and captures combined output for diagnostics.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command as TokioCommand;
use tracing::debug;

/// Output from an exec-style invocation where a non-zero exit code is a
/// legitimate, scoreable outcome rather than an adapter failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    /// Combined stdout + stderr
    pub output: String,
    /// Exit code of the command
    pub exit_code: i32,
}

impl ExecOutput {
    /// Check whether the command exited zero
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Narrow surface over the container engine.
///
/// Operations mirror the CLI verbs the engine needs: inspect, existence and
/// liveness checks, start/remove, detached run, exec, copy-in, volume
/// inspection and one-shot image runs. Every failure carries the raw
/// command output.
#[async_trait]
pub trait ContainerAdapter: Send + Sync {
    /// Resolve an image reference to its content digest (`.Id`)
    async fn image_inspect_id(&self, image_ref: &str) -> Result<String>;

    /// The image reference a container was created from (`.Config.Image`)
    async fn image_inspect_config_image(&self, container: &str) -> Result<String>;

    /// Whether a container with this name exists (running or not)
    async fn container_exists(&self, name: &str) -> Result<bool>;

    /// Whether a container with this name is currently running
    async fn container_is_running(&self, name: &str) -> Result<bool>;

    /// Start a stopped container
    async fn container_start(&self, name: &str) -> Result<()>;

    /// Force-remove a container, running or not
    async fn container_remove_force(&self, name: &str) -> Result<()>;

    /// Run a container detached. `run_args` are inserted between `run` and
    /// the image reference; `command` (if any) runs inside the container.
    /// Returns the new container id.
    async fn container_run_detached(
        &self,
        run_args: &[String],
        image: &str,
        command: Option<&[String]>,
    ) -> Result<String>;

    /// Execute a shell command (`sh -c`) inside a running container,
    /// capturing combined output and exit status.
    async fn container_exec(&self, name: &str, shell_cmd: &str) -> Result<ExecOutput>;

    /// Copy a host path into a container
    async fn container_copy_in(
        &self,
        name: &str,
        host_path: &str,
        container_path: &str,
    ) -> Result<()>;

    /// Whether a named volume exists
    async fn volume_exists(&self, name: &str) -> Result<bool>;

    /// Build an image from a directory, returning the raw build output.
    /// `build_args` are inserted between `build` and the context path.
    async fn image_build(
        &self,
        build_args: &[String],
        tag: &str,
        context: &str,
    ) -> Result<String>;

    /// Pull a tagged image
    async fn image_pull(&self, image_ref: &str) -> Result<()>;

    /// Run a one-shot container (`run --rm`), capturing combined output and
    /// exit status. `run_args` are inserted before the image reference.
    async fn image_run(
        &self,
        run_args: &[String],
        image: &str,
        command: &[String],
    ) -> Result<ExecOutput>;
}

/// Production adapter shelling out to the container engine CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    /// Create an adapter, verifying the engine binary is on PATH.
    ///
    /// # Errors
    /// Returns [`Error::EngineNotFound`] when the binary cannot be located.
    pub fn new() -> Result<Self> {
        Self::with_binary("docker")
    }

    /// Create an adapter for a specific engine binary (e.g. `podman`).
    ///
    /// # Errors
    /// Returns [`Error::EngineNotFound`] when the binary cannot be located.
    pub fn with_binary(binary: impl Into<String>) -> Result<Self> {
        let binary = binary.into();
        which::which(&binary).map_err(|_| Error::EngineNotFound {
            binary: binary.clone(),
        })?;
        Ok(Self { binary })
    }

    /// Run the engine binary with `args`, capturing combined output.
    async fn capture(&self, args: &[String]) -> Result<ExecOutput> {
        debug!(binary = %self.binary, args = ?args, "spawning engine command");
        let output = TokioCommand::new(&self.binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                Error::custom(format!("failed to spawn {} {}: {e}", self.binary, args.join(" ")))
            })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            if !combined.is_empty() && !combined.ends_with('\n') {
                combined.push('\n');
            }
            combined.push_str(&stderr);
        }
        Ok(ExecOutput {
            output: combined,
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    /// Run the engine binary, treating a non-zero exit as an error carrying
    /// the combined output.
    async fn run_checked(&self, args: &[String]) -> Result<String> {
        let out = self.capture(args).await?;
        if out.exit_code != 0 {
            return Err(Error::command_failed(
                format!("{} {}", self.binary, args.join(" ")),
                out.exit_code,
                out.output,
            ));
        }
        Ok(out.output)
    }
}

fn string_args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|s| (*s).to_string()).collect()
}

pub(crate) fn run_detached_args(
    run_args: &[String],
    image: &str,
    command: Option<&[String]>,
) -> Vec<String> {
    let mut args = vec!["run".to_string()];
    args.extend(run_args.iter().cloned());
    args.push(image.to_string());
    if let Some(cmd) = command {
        args.extend(cmd.iter().cloned());
    }
    args
}

#[async_trait]
impl ContainerAdapter for DockerCli {
    async fn image_inspect_id(&self, image_ref: &str) -> Result<String> {
        let out = self
            .capture(&string_args(["image", "inspect", "--format", "{{.Id}}", image_ref]))
            .await?;
        if out.exit_code != 0 {
            return Err(Error::image_not_found(image_ref));
        }
        Ok(out.output.trim().to_string())
    }

    async fn image_inspect_config_image(&self, container: &str) -> Result<String> {
        let out = self
            .capture(&string_args([
                "inspect",
                "--format",
                "{{.Config.Image}}",
                container,
            ]))
            .await?;
        if out.exit_code != 0 {
            return Err(Error::container_not_found(container));
        }
        Ok(out.output.trim().to_string())
    }

    async fn container_exists(&self, name: &str) -> Result<bool> {
        let out = self
            .capture(&string_args(["inspect", "--type", "container", name]))
            .await?;
        Ok(out.exit_code == 0)
    }

    async fn container_is_running(&self, name: &str) -> Result<bool> {
        let out = self
            .capture(&string_args([
                "inspect",
                "--format",
                "{{.State.Running}}",
                name,
            ]))
            .await?;
        Ok(out.exit_code == 0 && out.output.trim() == "true")
    }

    async fn container_start(&self, name: &str) -> Result<()> {
        self.run_checked(&string_args(["start", name])).await?;
        Ok(())
    }

    async fn container_remove_force(&self, name: &str) -> Result<()> {
        self.run_checked(&string_args(["rm", "-f", name])).await?;
        Ok(())
    }

    async fn container_run_detached(
        &self,
        run_args: &[String],
        image: &str,
        command: Option<&[String]>,
    ) -> Result<String> {
        let args = run_detached_args(run_args, image, command);
        let output = self.run_checked(&args).await?;
        // `docker run -d` prints the new container id on the last line
        Ok(output.lines().last().unwrap_or("").trim().to_string())
    }

    async fn container_exec(&self, name: &str, shell_cmd: &str) -> Result<ExecOutput> {
        let args = vec![
            "exec".to_string(),
            name.to_string(),
            "sh".to_string(),
            "-c".to_string(),
            shell_cmd.to_string(),
        ];
        self.capture(&args).await
    }

    async fn container_copy_in(
        &self,
        name: &str,
        host_path: &str,
        container_path: &str,
    ) -> Result<()> {
        let dest = format!("{name}:{container_path}");
        self.run_checked(&string_args(["cp", host_path, dest.as_str()]))
            .await?;
        Ok(())
    }

    async fn volume_exists(&self, name: &str) -> Result<bool> {
        let out = self
            .capture(&string_args(["volume", "inspect", name]))
            .await?;
        Ok(out.exit_code == 0)
    }

    async fn image_build(
        &self,
        build_args: &[String],
        tag: &str,
        context: &str,
    ) -> Result<String> {
        let mut args = vec!["build".to_string(), "-t".to_string(), tag.to_string()];
        args.extend(build_args.iter().cloned());
        args.push(context.to_string());
        self.run_checked(&args).await
    }

    async fn image_pull(&self, image_ref: &str) -> Result<()> {
        self.run_checked(&string_args(["pull", image_ref])).await?;
        Ok(())
    }

    async fn image_run(
        &self,
        run_args: &[String],
        image: &str,
        command: &[String],
    ) -> Result<ExecOutput> {
        let mut args = vec!["run".to_string(), "--rm".to_string()];
        args.extend(run_args.iter().cloned());
        args.push(image.to_string());
        args.extend(command.iter().cloned());
        self.capture(&args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_detached_args_order() {
        let run_args = vec![
            "--platform".to_string(),
            "linux/amd64".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            "c1".to_string(),
        ];
        let cmd = vec!["sh".to_string(), "-c".to_string(), "sleep infinity".to_string()];
        let args = run_detached_args(&run_args, "app:1", Some(&cmd));
        assert_eq!(
            args,
            vec![
                "run",
                "--platform",
                "linux/amd64",
                "-d",
                "--name",
                "c1",
                "app:1",
                "sh",
                "-c",
                "sleep infinity"
            ]
        );
    }

    #[test]
    fn test_run_detached_args_without_command() {
        let args = run_detached_args(&[], "app:1", None);
        assert_eq!(args, vec!["run", "app:1"]);
    }

    #[test]
    fn test_exec_output_success() {
        let ok = ExecOutput {
            output: "hi\n".into(),
            exit_code: 0,
        };
        assert!(ok.success());
        let bad = ExecOutput {
            output: String::new(),
            exit_code: 2,
        };
        assert!(!bad.success());
    }
}
