//! Step handlers.
//!
//! One handler per step type. A handler receives the decoded typed
//! configuration plus a context carrying the owning task, the resolved
//! dependency rows, the store facade, the container adapter and the run's
//! cancel token. It decides for itself whether anything changed (the
//! change predicates in [`crate::detect`]), performs its side effects, and
//! returns the result document and settings mutations for the engine to
//! persist.

use crate::config::StepSettings;
use crate::docker::ContainerAdapter;
use crate::engine::{CancelToken, RunMode};
use crate::error::Result;
use crate::settings::TaskSettings;
use crate::store::{StepRow, Store, TaskRow};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};

pub mod docker_build;
pub mod docker_extract_volume;
pub mod docker_pool;
pub mod docker_pull;
pub mod docker_rubrics;
pub mod docker_run;
pub mod docker_shell;
pub mod docker_volume_pool;
pub mod dynamic;
pub mod file_exists;
pub mod model_task_check;
pub mod rubric_set;
pub mod rubric_shell;
pub mod rubrics_import;

/// Everything a handler may touch while executing one step
pub struct HandlerContext<'a> {
    /// The owning task row
    pub task: &'a TaskRow,
    /// Decoded view of the task's settings document
    pub task_settings: TaskSettings,
    /// The step row being executed
    pub step: &'a StepRow,
    /// Current rows of every step this one depends on
    pub dep_steps: Vec<StepRow>,
    /// Data-access facade
    pub store: &'a dyn Store,
    /// Container engine adapter
    pub docker: &'a dyn ContainerAdapter,
    /// Cooperative cancellation, checked between external calls
    pub cancel: &'a CancelToken,
    /// Process-wide run mode, fixed for the duration of the run
    pub run_mode: RunMode,
}

impl HandlerContext<'_> {
    /// The task's filesystem base path, if any
    #[must_use]
    pub fn base_path(&self) -> Option<&str> {
        self.task.local_path.as_deref()
    }

    /// Fail with [`crate::error::Error::Cancelled`] when the run was cancelled
    pub fn check_cancelled(&self) -> Result<()> {
        self.cancel.check()
    }

    /// The first dependency step that provides containers, if any
    #[must_use]
    pub fn container_source_dep(&self) -> Option<&StepRow> {
        self.dep_steps.iter().find(|dep| {
            StepSettings::decode(&dep.settings)
                .map(|s| s.config.provides_containers())
                .unwrap_or(false)
        })
    }
}

/// What the engine persists after a handler ran
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    /// Full results document, rewritten on every execution
    pub results: Value,
    /// Full settings document to write back, when the handler mutated it
    pub settings: Option<Value>,
}

impl StepOutcome {
    /// A success result with a message
    #[must_use]
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            results: result_doc("success", message),
            settings: None,
        }
    }

    /// A failure result with a message
    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            results: result_doc("failure", message),
            settings: None,
        }
    }

    /// A pending result with a message
    #[must_use]
    pub fn pending(message: impl Into<String>) -> Self {
        Self {
            results: result_doc("pending", message),
            settings: None,
        }
    }

    /// Attach an extra key to the results document
    #[must_use]
    pub fn with_result_field(mut self, key: &str, value: Value) -> Self {
        if let Value::Object(obj) = &mut self.results {
            obj.insert(key.to_string(), value);
        }
        self
    }

    /// Attach the settings document to persist
    #[must_use]
    pub fn with_settings(mut self, settings: Value) -> Self {
        self.settings = Some(settings);
        self
    }
}

/// Build a conventional result document
#[must_use]
pub fn result_doc(result: &str, message: impl Into<String>) -> Value {
    json!({"result": result, "message": message.into()})
}

/// What happened when a handler was invoked
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerResult {
    /// Change detection found nothing to do; results stay untouched
    Skipped,
    /// Identity was adopted from a dependency; the step runs next cycle
    Pending(StepOutcome),
    /// The handler executed (successfully or not, per the result document)
    Done(StepOutcome),
}

/// Contract implemented by every step handler
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// The settings type key this handler serves
    fn type_key(&self) -> &'static str;

    /// Evaluate change detection and, when needed, execute the step
    async fn run(&self, ctx: &HandlerContext<'_>, settings: StepSettings)
        -> Result<HandlerResult>;
}

/// Routes a step to the handler implementing its type
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, Box<dyn StepHandler>>,
}

impl HandlerRegistry {
    /// Registry with every built-in handler
    #[must_use]
    pub fn standard() -> Self {
        let mut registry = Self {
            handlers: HashMap::new(),
        };
        registry.register(Box::new(file_exists::FileExistsHandler));
        registry.register(Box::new(docker_build::DockerBuildHandler));
        registry.register(Box::new(docker_pull::DockerPullHandler));
        registry.register(Box::new(docker_run::DockerRunHandler));
        registry.register(Box::new(docker_pool::DockerPoolHandler));
        registry.register(Box::new(docker_shell::DockerShellHandler));
        registry.register(Box::new(docker_volume_pool::DockerVolumePoolHandler));
        registry.register(Box::new(docker_extract_volume::DockerExtractVolumeHandler));
        registry.register(Box::new(docker_rubrics::DockerRubricsHandler));
        registry.register(Box::new(dynamic::DynamicHandler::lab()));
        registry.register(Box::new(dynamic::DynamicHandler::rubric()));
        registry.register(Box::new(rubric_set::RubricSetHandler));
        registry.register(Box::new(rubric_shell::RubricShellHandler));
        registry.register(Box::new(rubrics_import::RubricsImportHandler));
        registry.register(Box::new(model_task_check::ModelTaskCheckHandler));
        registry
    }

    /// Add a handler, replacing any previous one for the same type key
    pub fn register(&mut self, handler: Box<dyn StepHandler>) {
        self.handlers.insert(handler.type_key(), handler);
    }

    /// Look up the handler for a type key
    #[must_use]
    pub fn get(&self, type_key: &str) -> Option<&dyn StepHandler> {
        self.handlers.get(type_key).map(AsRef::as_ref)
    }

    /// Whether a type key has a registered handler
    #[must_use]
    pub fn supports(&self, type_key: &str) -> bool {
        self.handlers.contains_key(type_key)
    }
}

/// The image tag a step should use: its own when set, otherwise the first
/// non-empty tag among its dependencies' configurations.
#[must_use]
pub fn effective_image_tag(own_tag: &str, dep_steps: &[StepRow]) -> String {
    if !own_tag.is_empty() {
        return own_tag.to_string();
    }
    dep_steps
        .iter()
        .filter_map(|dep| {
            StepSettings::decode(&dep.settings)
                .ok()
                .map(|s| s.config.image_tag().to_string())
        })
        .find(|tag| !tag.is_empty())
        .unwrap_or_default()
}

/// Expand `%%NAME%%` placeholders in an argument list
#[must_use]
pub fn expand_placeholders(args: &[String], substitutions: &BTreeMap<&str, String>) -> Vec<String> {
    args.iter()
        .map(|arg| {
            let mut out = arg.clone();
            for (name, value) in substitutions {
                out = out.replace(&format!("%%{name}%%"), value);
            }
            out
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_routes_every_type_key() {
        let registry = HandlerRegistry::standard();
        for key in crate::config::TYPE_KEYS {
            assert!(registry.supports(key), "no handler for {key}");
            assert_eq!(registry.get(key).unwrap().type_key(), *key);
        }
        assert!(!registry.supports("bogus"));
    }

    #[test]
    fn test_expand_placeholders() {
        let args = vec![
            "-v".to_string(),
            "%%HOSTPATH%%:%%APP_FOLDER%%".to_string(),
            "--label".to_string(),
            "tag=%%IMAGETAG%%".to_string(),
        ];
        let mut subs = BTreeMap::new();
        subs.insert("HOSTPATH", "/w/t/volume_solution1".to_string());
        subs.insert("APP_FOLDER", "/app".to_string());
        subs.insert("IMAGETAG", "app:1".to_string());
        let expanded = expand_placeholders(&args, &subs);
        assert_eq!(
            expanded,
            vec!["-v", "/w/t/volume_solution1:/app", "--label", "tag=app:1"]
        );
    }

    #[test]
    fn test_outcome_builders() {
        let outcome = StepOutcome::success("done")
            .with_result_field("container_id", Value::from("abc"))
            .with_settings(json!({"docker_run": {}}));
        assert_eq!(outcome.results["result"], "success");
        assert_eq!(outcome.results["container_id"], "abc");
        assert!(outcome.settings.is_some());
    }
}
