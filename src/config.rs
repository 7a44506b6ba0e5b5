//! Typed step configuration model.
//!
//! A step's `settings` document carries exactly one known type key at the
//! top level; that key's value is the typed configuration decoded here into
//! [`StepConfig`]. Decoding rejects documents with zero or several type
//! keys rather than silently picking one. The surrounding [`StepSettings`]
//! holder keeps the top-level extras (`depends_on`, `generated_by`,
//! unrecognized keys) so a re-encode never loses data.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Every type key a step settings document may carry
pub const TYPE_KEYS: &[&str] = &[
    "file_exists",
    "docker_build",
    "docker_pull",
    "docker_run",
    "docker_pool",
    "docker_shell",
    "docker_volume_pool",
    "docker_extract_volume",
    "docker_rubrics",
    "dynamic_lab",
    "dynamic_rubric",
    "rubric_set",
    "rubric_shell",
    "rubrics_import",
    "model_task_check",
];

/// A dependency edge to another step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepRef {
    /// Step id this step depends on
    pub id: i64,
}

impl DepRef {
    /// Shorthand constructor
    #[must_use]
    pub fn new(id: i64) -> Self {
        Self { id }
    }
}

/// Image identity shared by several variants
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    /// Image tag (may be empty when only a digest is known)
    #[serde(default)]
    pub image_tag: String,
    /// Resolved image digest (may be empty before first resolution)
    #[serde(default)]
    pub image_id: String,
}

/// File-hash trigger block used by variants that track file content
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTriggers {
    /// Tracked file → lowercase hex SHA-256 at last successful run
    #[serde(default)]
    pub files: BTreeMap<String, String>,
}

/// Assert presence of files under the task base path
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileExistsConfig {
    /// Paths that must exist
    #[serde(default)]
    pub files: Vec<String>,
    /// Nested dependency list
    #[serde(default)]
    pub depends_on: Vec<DepRef>,
}

/// Build an image from tracked files
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerBuildConfig {
    /// Tag applied to the built image
    #[serde(default)]
    pub image_tag: String,
    /// Digest recorded after the last successful build
    #[serde(default)]
    pub image_id: String,
    /// Tracked file → hash at last successful build
    #[serde(default)]
    pub files: BTreeMap<String, String>,
    /// Extra arguments inserted into the build command
    #[serde(default)]
    pub parameters: Vec<String>,
    /// Bypass change detection for one invocation
    #[serde(default)]
    pub force: bool,
    /// Nested dependency list
    #[serde(default)]
    pub depends_on: Vec<DepRef>,
}

/// Fetch a tagged image
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerPullConfig {
    /// Image reference to pull
    #[serde(default)]
    pub image_tag: String,
    /// Digest recorded after the last successful pull
    #[serde(default)]
    pub image_id: String,
    /// Earliest instant (RFC3339, UTC) the pull may run again
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prevent_run_before: Option<DateTime<Utc>>,
    /// Bypass change detection for one invocation
    #[serde(default)]
    pub force: bool,
    /// Nested dependency list
    #[serde(default)]
    pub depends_on: Vec<DepRef>,
}

/// Start a single long-lived container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerRunConfig {
    /// Image tag, usually resolved from a build/pull dependency
    #[serde(default)]
    pub image_tag: String,
    /// Expected image digest
    #[serde(default)]
    pub image_id: String,
    /// Extra `docker run` arguments (placeholders expanded)
    #[serde(default)]
    pub parameters: Vec<String>,
    /// Name given to the container
    #[serde(default)]
    pub container_name: String,
    /// Never remove the container during cleanup
    #[serde(default)]
    pub keep_forever: bool,
    /// Bypass change detection for one invocation
    #[serde(default)]
    pub force: bool,
    /// Nested dependency list
    #[serde(default)]
    pub depends_on: Vec<DepRef>,
}

/// Start N containers against one image
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerPoolConfig {
    /// Number of pool members
    #[serde(default)]
    pub pool_size: u32,
    /// Container names recorded for the current pool
    #[serde(default)]
    pub containers: Vec<String>,
    /// Image tag the pool runs
    #[serde(default)]
    pub image_tag: String,
    /// Expected image digest
    #[serde(default)]
    pub image_id: String,
    /// Never remove pool members during cleanup
    #[serde(default)]
    pub keep_forever: bool,
    /// Step id the generator uses as the container source for children
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_step_id: Option<i64>,
    /// Bypass change detection for one invocation
    #[serde(default)]
    pub force: bool,
    /// Nested dependency list
    #[serde(default)]
    pub depends_on: Vec<DepRef>,
}

/// One command of a shell sequence
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellCommand {
    /// Shell command text
    #[serde(default)]
    pub run: String,
}

/// Exec an ordered list of commands in a container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerShellConfig {
    /// Image identity the commands run against
    #[serde(default)]
    pub docker: ImageRef,
    /// Commands executed in order
    #[serde(default)]
    pub commands: Vec<ShellCommand>,
    /// Explicit container to exec in; when empty, resolved from the
    /// `docker_run` dependency's recorded container
    #[serde(default)]
    pub container_name: String,
    /// Bypass change detection for one invocation
    #[serde(default)]
    pub force: bool,
    /// Nested dependency list
    #[serde(default)]
    pub depends_on: Vec<DepRef>,
}

/// Trigger block for the volume pool: image identity, tracked files and the
/// patch → container-name map of the current pool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumePoolTriggers {
    /// Solution patch file → container name
    #[serde(default)]
    pub containers: BTreeMap<String, String>,
    /// Image tag the pool runs
    #[serde(default)]
    pub image_tag: String,
    /// Expected image digest
    #[serde(default)]
    pub image_id: String,
    /// Tracked file → hash at last successful run
    #[serde(default)]
    pub files: BTreeMap<String, String>,
}

/// One container per solution patch, each with its own host-mounted volume
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerVolumePoolConfig {
    /// Solution patch files, one container each
    #[serde(default)]
    pub solutions: Vec<String>,
    /// Identity and membership triggers
    #[serde(default)]
    pub triggers: VolumePoolTriggers,
    /// Extra `docker run` arguments (placeholders expanded)
    #[serde(default)]
    pub parameters: Vec<String>,
    /// Patch applied before the solution patch on every (re)create
    #[serde(default)]
    pub grading_setup_script: String,
    /// Patch applied after the solution patch
    #[serde(default)]
    pub held_out_test_file: String,
    /// Keep the containers alive after the run
    #[serde(default)]
    pub keep_forever: bool,
    /// Bypass change detection for one invocation
    #[serde(default)]
    pub force: bool,
    /// Nested dependency list
    #[serde(default)]
    pub depends_on: Vec<DepRef>,
}

/// Extract the app folder from an image into a named host volume
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerExtractVolumeConfig {
    /// Name of the volume to fill
    #[serde(default)]
    pub volume_name: String,
    /// Image tag the content comes from
    #[serde(default)]
    pub image_tag: String,
    /// Expected image digest
    #[serde(default)]
    pub image_id: String,
    /// Path inside the image that holds the project tree
    #[serde(default)]
    pub app_folder: String,
    /// Tracked files
    #[serde(default)]
    pub triggers: FileTriggers,
    /// Bypass change detection for one invocation
    #[serde(default)]
    pub force: bool,
    /// Nested dependency list
    #[serde(default)]
    pub depends_on: Vec<DepRef>,
}

/// Run every command from a task-data file in one-shot containers, scored
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerRubricsConfig {
    /// Tracked files; must include the task-data file
    #[serde(default)]
    pub files: Vec<String>,
    /// Tracked file → hash at last full pass
    #[serde(default)]
    pub hashes: BTreeMap<String, String>,
    /// Expected image digest
    #[serde(default)]
    pub image_id: String,
    /// Image tag commands run against
    #[serde(default)]
    pub image_tag: String,
    /// Bypass change detection for one invocation
    #[serde(default)]
    pub force: bool,
    /// Nested dependency list
    #[serde(default)]
    pub depends_on: Vec<DepRef>,
}

/// Execution environment flags for dynamic generation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// Whether generated criteria run inside Docker containers
    #[serde(default = "default_true")]
    pub docker: bool,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self { docker: true }
    }
}

fn default_true() -> bool {
    true
}

/// Generate child steps from one or more rubric files
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicConfig {
    /// Single rubric file (alternative to `rubrics`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rubric_file: Option<String>,
    /// Multiple rubric files
    #[serde(default)]
    pub rubrics: Vec<String>,
    /// Additional tracked files
    #[serde(default)]
    pub files: Vec<String>,
    /// Tracked file → hash at last successful generation
    #[serde(default)]
    pub hashes: BTreeMap<String, String>,
    /// Execution environment for generated criteria
    #[serde(default)]
    pub environment: EnvironmentConfig,
    /// Bypass change detection for one invocation
    #[serde(default)]
    pub force: bool,
    /// Nested dependency list
    #[serde(default)]
    pub depends_on: Vec<DepRef>,
}

/// Publish a parsed rubric and its file-hash state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RubricSetConfig {
    /// The rubric file to parse
    #[serde(default)]
    pub file: String,
    /// Additional tracked files
    #[serde(default)]
    pub files: Vec<String>,
    /// Tracked file → hash at last successful parse
    #[serde(default)]
    pub hashes: BTreeMap<String, String>,
    /// Optional solution patches, by slot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solution_1: Option<String>,
    /// Second solution slot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solution_2: Option<String>,
    /// Third solution slot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solution_3: Option<String>,
    /// Fourth solution slot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solution_4: Option<String>,
    /// Held-out test patch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub held_out_test: Option<String>,
    /// Bypass change detection for one invocation
    #[serde(default)]
    pub force: bool,
    /// Nested dependency list
    #[serde(default)]
    pub depends_on: Vec<DepRef>,
}

/// Stamp recorded by `rubric_shell` after each execution
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastRun {
    /// Image digest of the container the command ran in
    #[serde(default)]
    pub image_id: String,
    /// Exit status of the command
    #[serde(default)]
    pub exit_code: i32,
}

/// Run a single criterion command inside assigned containers, scored
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RubricShellConfig {
    /// Shell command of the criterion
    #[serde(default)]
    pub command: String,
    /// Criterion identifier (UUID form)
    #[serde(default)]
    pub criterion_id: String,
    /// Ordinal of the criterion in its rubric
    #[serde(default)]
    pub counter: u32,
    /// Score awarded when the command passes
    #[serde(default)]
    pub score: i64,
    /// Whether a miss fails the rubric
    #[serde(default)]
    pub required: bool,
    /// Explicit container assignment; when empty, resolved from the task's
    /// container map
    #[serde(default)]
    pub container_name: String,
    /// Expected image digest
    #[serde(default)]
    pub image_id: String,
    /// Image tag
    #[serde(default)]
    pub image_tag: String,
    /// Stamp of the previous execution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<LastRun>,
    /// Tracked file → hash
    #[serde(default)]
    pub files: BTreeMap<String, String>,
    /// Parent step that generated this one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_by: Option<i64>,
    /// Run once regardless of the last-run stamp
    #[serde(default)]
    pub rerun: bool,
    /// Nested dependency list
    #[serde(default)]
    pub depends_on: Vec<DepRef>,
}

/// Parse an MHTML export into a Markdown task-data file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RubricsImportConfig {
    /// Source MHTML export
    #[serde(default)]
    pub mhtml_file: String,
    /// Destination Markdown file
    #[serde(default)]
    pub md_file: String,
    /// Tracked file → hash at last successful import
    #[serde(default)]
    pub hashes: BTreeMap<String, String>,
    /// Bypass change detection for one invocation
    #[serde(default)]
    pub force: bool,
    /// Nested dependency list
    #[serde(default)]
    pub depends_on: Vec<DepRef>,
}

/// Compose a prompt document from tracked source files
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelTaskCheckConfig {
    /// Tracked files
    #[serde(default)]
    pub triggers: FileTriggers,
    /// Source files composed into the prompt, in order
    #[serde(default)]
    pub files: Vec<String>,
    /// Bypass change detection for one invocation
    #[serde(default)]
    pub force: bool,
    /// Nested dependency list
    #[serde(default)]
    pub depends_on: Vec<DepRef>,
}

/// The typed configuration of a step, tagged by its settings type key
#[derive(Debug, Clone, PartialEq)]
pub enum StepConfig {
    /// `file_exists`
    FileExists(FileExistsConfig),
    /// `docker_build`
    DockerBuild(DockerBuildConfig),
    /// `docker_pull`
    DockerPull(DockerPullConfig),
    /// `docker_run`
    DockerRun(DockerRunConfig),
    /// `docker_pool`
    DockerPool(DockerPoolConfig),
    /// `docker_shell`
    DockerShell(DockerShellConfig),
    /// `docker_volume_pool`
    DockerVolumePool(DockerVolumePoolConfig),
    /// `docker_extract_volume`
    DockerExtractVolume(DockerExtractVolumeConfig),
    /// `docker_rubrics`
    DockerRubrics(DockerRubricsConfig),
    /// `dynamic_lab`
    DynamicLab(DynamicConfig),
    /// `dynamic_rubric`
    DynamicRubric(DynamicConfig),
    /// `rubric_set`
    RubricSet(RubricSetConfig),
    /// `rubric_shell`
    RubricShell(RubricShellConfig),
    /// `rubrics_import`
    RubricsImport(RubricsImportConfig),
    /// `model_task_check`
    ModelTaskCheck(ModelTaskCheckConfig),
}

impl StepConfig {
    /// Decode the typed value found under `key`
    pub fn decode(key: &str, value: &Value) -> Result<Self> {
        fn de<T: serde::de::DeserializeOwned>(key: &str, value: &Value) -> Result<T> {
            serde_json::from_value(value.clone())
                .map_err(|e| Error::invalid_config(format!("decoding `{key}`: {e}")))
        }
        Ok(match key {
            "file_exists" => Self::FileExists(de(key, value)?),
            "docker_build" => Self::DockerBuild(de(key, value)?),
            "docker_pull" => Self::DockerPull(de(key, value)?),
            "docker_run" => Self::DockerRun(de(key, value)?),
            "docker_pool" => Self::DockerPool(de(key, value)?),
            "docker_shell" => Self::DockerShell(de(key, value)?),
            "docker_volume_pool" => Self::DockerVolumePool(de(key, value)?),
            "docker_extract_volume" => Self::DockerExtractVolume(de(key, value)?),
            "docker_rubrics" => Self::DockerRubrics(de(key, value)?),
            "dynamic_lab" => Self::DynamicLab(de(key, value)?),
            "dynamic_rubric" => Self::DynamicRubric(de(key, value)?),
            "rubric_set" => Self::RubricSet(de(key, value)?),
            "rubric_shell" => Self::RubricShell(de(key, value)?),
            "rubrics_import" => Self::RubricsImport(de(key, value)?),
            "model_task_check" => Self::ModelTaskCheck(de(key, value)?),
            other => {
                return Err(Error::invalid_config(format!("unknown type key `{other}`")));
            }
        })
    }

    /// The settings type key of this configuration
    #[must_use]
    pub fn type_key(&self) -> &'static str {
        match self {
            Self::FileExists(_) => "file_exists",
            Self::DockerBuild(_) => "docker_build",
            Self::DockerPull(_) => "docker_pull",
            Self::DockerRun(_) => "docker_run",
            Self::DockerPool(_) => "docker_pool",
            Self::DockerShell(_) => "docker_shell",
            Self::DockerVolumePool(_) => "docker_volume_pool",
            Self::DockerExtractVolume(_) => "docker_extract_volume",
            Self::DockerRubrics(_) => "docker_rubrics",
            Self::DynamicLab(_) => "dynamic_lab",
            Self::DynamicRubric(_) => "dynamic_rubric",
            Self::RubricSet(_) => "rubric_set",
            Self::RubricShell(_) => "rubric_shell",
            Self::RubricsImport(_) => "rubrics_import",
            Self::ModelTaskCheck(_) => "model_task_check",
        }
    }

    /// Re-encode the typed value
    pub fn to_value(&self) -> Result<Value> {
        let v = match self {
            Self::FileExists(c) => serde_json::to_value(c)?,
            Self::DockerBuild(c) => serde_json::to_value(c)?,
            Self::DockerPull(c) => serde_json::to_value(c)?,
            Self::DockerRun(c) => serde_json::to_value(c)?,
            Self::DockerPool(c) => serde_json::to_value(c)?,
            Self::DockerShell(c) => serde_json::to_value(c)?,
            Self::DockerVolumePool(c) => serde_json::to_value(c)?,
            Self::DockerExtractVolume(c) => serde_json::to_value(c)?,
            Self::DockerRubrics(c) => serde_json::to_value(c)?,
            Self::DynamicLab(c) | Self::DynamicRubric(c) => serde_json::to_value(c)?,
            Self::RubricSet(c) => serde_json::to_value(c)?,
            Self::RubricShell(c) => serde_json::to_value(c)?,
            Self::RubricsImport(c) => serde_json::to_value(c)?,
            Self::ModelTaskCheck(c) => serde_json::to_value(c)?,
        };
        Ok(v)
    }

    /// Nested dependency list of the active variant
    #[must_use]
    pub fn depends_on(&self) -> &[DepRef] {
        match self {
            Self::FileExists(c) => &c.depends_on,
            Self::DockerBuild(c) => &c.depends_on,
            Self::DockerPull(c) => &c.depends_on,
            Self::DockerRun(c) => &c.depends_on,
            Self::DockerPool(c) => &c.depends_on,
            Self::DockerShell(c) => &c.depends_on,
            Self::DockerVolumePool(c) => &c.depends_on,
            Self::DockerExtractVolume(c) => &c.depends_on,
            Self::DockerRubrics(c) => &c.depends_on,
            Self::DynamicLab(c) | Self::DynamicRubric(c) => &c.depends_on,
            Self::RubricSet(c) => &c.depends_on,
            Self::RubricShell(c) => &c.depends_on,
            Self::RubricsImport(c) => &c.depends_on,
            Self::ModelTaskCheck(c) => &c.depends_on,
        }
    }

    /// Image tag of the active variant, empty when the variant carries none
    #[must_use]
    pub fn image_tag(&self) -> &str {
        match self {
            Self::DockerBuild(c) => &c.image_tag,
            Self::DockerPull(c) => &c.image_tag,
            Self::DockerRun(c) => &c.image_tag,
            Self::DockerPool(c) => &c.image_tag,
            Self::DockerShell(c) => &c.docker.image_tag,
            Self::DockerVolumePool(c) => &c.triggers.image_tag,
            Self::DockerExtractVolume(c) => &c.image_tag,
            Self::DockerRubrics(c) => &c.image_tag,
            Self::RubricShell(c) => &c.image_tag,
            _ => "",
        }
    }

    /// Image digest of the active variant, empty when unresolved
    #[must_use]
    pub fn image_id(&self) -> &str {
        match self {
            Self::DockerBuild(c) => &c.image_id,
            Self::DockerPull(c) => &c.image_id,
            Self::DockerRun(c) => &c.image_id,
            Self::DockerPool(c) => &c.image_id,
            Self::DockerShell(c) => &c.docker.image_id,
            Self::DockerVolumePool(c) => &c.triggers.image_id,
            Self::DockerExtractVolume(c) => &c.image_id,
            Self::DockerRubrics(c) => &c.image_id,
            Self::RubricShell(c) => &c.image_id,
            _ => "",
        }
    }

    /// Set the transient bypass flag: `force` for most variants, `rerun`
    /// for `rubric_shell`. `file_exists` always runs and has no flag.
    pub fn set_force(&mut self, force: bool) {
        match self {
            Self::FileExists(_) => {}
            Self::DockerBuild(c) => c.force = force,
            Self::DockerPull(c) => c.force = force,
            Self::DockerRun(c) => c.force = force,
            Self::DockerPool(c) => c.force = force,
            Self::DockerShell(c) => c.force = force,
            Self::DockerVolumePool(c) => c.force = force,
            Self::DockerExtractVolume(c) => c.force = force,
            Self::DockerRubrics(c) => c.force = force,
            Self::DynamicLab(c) | Self::DynamicRubric(c) => c.force = force,
            Self::RubricSet(c) => c.force = force,
            Self::RubricShell(c) => c.rerun = force,
            Self::RubricsImport(c) => c.force = force,
            Self::ModelTaskCheck(c) => c.force = force,
        }
    }

    /// The `generated_by` marker nested in the typed value, if any
    #[must_use]
    pub fn generated_by(&self) -> Option<i64> {
        match self {
            Self::RubricShell(c) => c.generated_by,
            _ => None,
        }
    }

    /// Whether this variant hosts a rubric (may generate child steps)
    #[must_use]
    pub fn hosts_rubric(&self) -> bool {
        matches!(
            self,
            Self::DynamicLab(_) | Self::DynamicRubric(_) | Self::RubricSet(_)
        )
    }

    /// Whether this variant provides containers other steps exec into
    #[must_use]
    pub fn provides_containers(&self) -> bool {
        matches!(
            self,
            Self::DockerRun(_) | Self::DockerPool(_) | Self::DockerVolumePool(_)
        )
    }
}

/// A decoded step settings document: the typed configuration plus the
/// top-level extras that live beside the type key.
#[derive(Debug, Clone, PartialEq)]
pub struct StepSettings {
    /// The single typed configuration
    pub config: StepConfig,
    /// Top-level `depends_on`, honoured in addition to the nested list
    pub top_depends_on: Vec<DepRef>,
    /// Top-level `generated_by` (legacy placement)
    pub top_generated_by: Option<i64>,
    /// Unrecognized top-level keys, preserved across re-encodes
    extra: serde_json::Map<String, Value>,
}

impl StepSettings {
    /// Decode a settings document, enforcing exactly one type key.
    ///
    /// # Errors
    /// Rejects non-object documents, documents with zero or several type
    /// keys, and typed values that fail to decode.
    pub fn decode(settings: &Value) -> Result<Self> {
        let obj = settings
            .as_object()
            .ok_or_else(|| Error::invalid_config("settings is not a JSON object"))?;

        let present: Vec<&str> = TYPE_KEYS
            .iter()
            .copied()
            .filter(|k| obj.contains_key(*k))
            .collect();
        let key = match present.as_slice() {
            [one] => *one,
            [] => {
                return Err(Error::invalid_config("settings carry no known type key"));
            }
            many => {
                return Err(Error::invalid_config(format!(
                    "settings carry {} type keys ({}); exactly one is required",
                    many.len(),
                    many.join(", ")
                )));
            }
        };

        let config = StepConfig::decode(key, &obj[key])?;

        let top_depends_on = match obj.get("depends_on") {
            Some(v) => serde_json::from_value(v.clone())
                .map_err(|e| Error::invalid_config(format!("decoding top-level depends_on: {e}")))?,
            None => Vec::new(),
        };
        let top_generated_by = obj.get("generated_by").and_then(Value::as_i64);

        let mut extra = serde_json::Map::new();
        for (k, v) in obj {
            if k != key && k != "depends_on" && k != "generated_by" {
                extra.insert(k.clone(), v.clone());
            }
        }

        Ok(Self {
            config,
            top_depends_on,
            top_generated_by,
            extra,
        })
    }

    /// Build a holder around a typed configuration (new steps)
    #[must_use]
    pub fn from_config(config: StepConfig) -> Self {
        Self {
            config,
            top_depends_on: Vec::new(),
            top_generated_by: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Union of nested and top-level dependencies, ascending and deduplicated
    #[must_use]
    pub fn all_dependencies(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .config
            .depends_on()
            .iter()
            .chain(self.top_depends_on.iter())
            .map(|d| d.id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// The `generated_by` marker, whichever placement carries it
    #[must_use]
    pub fn generated_by(&self) -> Option<i64> {
        self.config.generated_by().or(self.top_generated_by)
    }

    /// Re-encode the whole settings document
    pub fn to_value(&self) -> Result<Value> {
        let mut obj = serde_json::Map::new();
        obj.insert(self.config.type_key().to_string(), self.config.to_value()?);
        if !self.top_depends_on.is_empty() {
            obj.insert(
                "depends_on".to_string(),
                serde_json::to_value(&self.top_depends_on)?,
            );
        }
        if let Some(id) = self.top_generated_by {
            obj.insert("generated_by".to_string(), Value::from(id));
        }
        for (k, v) in &self.extra {
            obj.insert(k.clone(), v.clone());
        }
        Ok(Value::Object(obj))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_requires_exactly_one_type_key() {
        let none = json!({"depends_on": [{"id": 1}]});
        assert!(StepSettings::decode(&none).is_err());

        let two = json!({
            "docker_build": {"image_tag": "app:1"},
            "docker_pull": {"image_tag": "app:1"}
        });
        let err = StepSettings::decode(&two).unwrap_err();
        assert_eq!(err.category(), "config");

        let not_object = json!([1, 2, 3]);
        assert!(StepSettings::decode(&not_object).is_err());
    }

    #[test]
    fn test_decode_docker_build() {
        let value = json!({
            "docker_build": {
                "image_tag": "app:1",
                "files": {"Dockerfile": ""},
                "parameters": ["--no-cache"],
                "depends_on": [{"id": 3}]
            }
        });
        let settings = StepSettings::decode(&value).unwrap();
        assert_eq!(settings.config.type_key(), "docker_build");
        assert_eq!(settings.config.image_tag(), "app:1");
        assert_eq!(settings.config.image_id(), "");
        assert_eq!(settings.all_dependencies(), vec![3]);
    }

    #[test]
    fn test_dependencies_union_both_placements() {
        let value = json!({
            "docker_shell": {
                "commands": [{"run": "echo hi"}],
                "depends_on": [{"id": 5}, {"id": 2}]
            },
            "depends_on": [{"id": 2}, {"id": 9}]
        });
        let settings = StepSettings::decode(&value).unwrap();
        assert_eq!(settings.all_dependencies(), vec![2, 5, 9]);
    }

    #[test]
    fn test_generated_by_both_placements() {
        let nested = json!({
            "rubric_shell": {"command": "true", "generated_by": 11}
        });
        assert_eq!(StepSettings::decode(&nested).unwrap().generated_by(), Some(11));

        let top = json!({
            "rubric_shell": {"command": "true"},
            "generated_by": 12
        });
        assert_eq!(StepSettings::decode(&top).unwrap().generated_by(), Some(12));
    }

    #[test]
    fn test_roundtrip_preserves_unknown_keys() {
        let value = json!({
            "file_exists": {"files": ["a.txt"]},
            "note": "kept verbatim"
        });
        let settings = StepSettings::decode(&value).unwrap();
        let encoded = settings.to_value().unwrap();
        assert_eq!(encoded["note"], "kept verbatim");
        assert!(encoded.get("file_exists").is_some());
    }

    #[test]
    fn test_volume_pool_accessors() {
        let value = json!({
            "docker_volume_pool": {
                "solutions": ["s1.patch"],
                "triggers": {"image_tag": "app:1", "image_id": "sha256:aa"},
                "force": true
            }
        });
        let settings = StepSettings::decode(&value).unwrap();
        assert_eq!(settings.config.image_tag(), "app:1");
        assert_eq!(settings.config.image_id(), "sha256:aa");
        assert!(settings.config.provides_containers());
    }

    #[test]
    fn test_prevent_run_before_rfc3339() {
        let value = json!({
            "docker_pull": {
                "image_tag": "app:1",
                "prevent_run_before": "2026-02-01T10:00:00Z"
            }
        });
        let settings = StepSettings::decode(&value).unwrap();
        match settings.config {
            StepConfig::DockerPull(c) => {
                let t = c.prevent_run_before.unwrap();
                assert_eq!(t.to_rfc3339(), "2026-02-01T10:00:00+00:00");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_hosts_rubric() {
        let value = json!({"rubric_set": {"file": "rubric.md"}});
        assert!(StepSettings::decode(&value).unwrap().config.hosts_rubric());
        let value = json!({"docker_run": {"container_name": "c"}});
        assert!(!StepSettings::decode(&value).unwrap().config.hosts_rubric());
    }
}
