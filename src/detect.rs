//! Change detection.
//!
//! Every handler type declares a change predicate built from the helpers
//! here. The canonical rule: run when the force flag is set, when any
//! tracked file's current SHA-256 differs from its stored hash, when the
//! resolved image identity differs from the stored image id, when a
//! required container is missing or runs a different image than expected,
//! or when the handler has never succeeded.
//!
//! Image identity resolves hierarchically: a dependency's recorded
//! `image_id` wins over inspecting the tag through the adapter. When a
//! dependency provides a fresher id than the one stored, the handler
//! adopts it, records `pending` and yields so the next cycle runs with
//! consistent identity.

use crate::config::StepSettings;
use crate::docker::ContainerAdapter;
use crate::error::Result;
use crate::hash;
use crate::store::StepRow;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

/// Whether a results document has ever recorded success
#[must_use]
pub fn never_succeeded(results: &Value) -> bool {
    results.get("result").and_then(Value::as_str) != Some("success")
}

/// Resolve the image id a step should run against.
///
/// Dependencies are consulted first: the first dependency step whose typed
/// configuration records a non-empty `image_id` wins. Otherwise the tag is
/// inspected through the adapter. An empty string means identity cannot be
/// resolved yet.
pub async fn resolve_image_id(
    docker: &dyn ContainerAdapter,
    dep_steps: &[StepRow],
    image_tag: &str,
) -> Result<String> {
    for dep in dep_steps {
        if let Ok(settings) = StepSettings::decode(&dep.settings) {
            let id = settings.config.image_id();
            if !id.is_empty() {
                debug!(dep = dep.id, image_id = id, "image identity from dependency");
                return Ok(id.to_string());
            }
        }
    }
    if image_tag.is_empty() {
        return Ok(String::new());
    }
    match docker.image_inspect_id(image_tag).await {
        Ok(id) => Ok(id),
        Err(_) => Ok(String::new()),
    }
}

/// Identity comparison for the two-phase drift protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityCheck {
    /// The freshest image id known
    pub resolved: String,
    /// True when `resolved` is non-empty and differs from the stored id
    pub drifted: bool,
}

/// Compare a step's stored image id against the freshest resolvable one
pub async fn check_image_identity(
    docker: &dyn ContainerAdapter,
    dep_steps: &[StepRow],
    image_tag: &str,
    stored_id: &str,
) -> Result<IdentityCheck> {
    let resolved = resolve_image_id(docker, dep_steps, image_tag).await?;
    let drifted = !resolved.is_empty() && resolved != stored_id;
    Ok(IdentityCheck { resolved, drifted })
}

/// Names of tracked files whose content changed since the stored hashes
pub async fn changed_tracked_files(
    base: Option<&str>,
    stored: &BTreeMap<String, String>,
    files: &[String],
) -> Vec<String> {
    hash::changed_files(base, stored, files).await
}

/// Whether a required container is missing, or exists but was created from
/// a different image reference / digest than expected.
pub async fn container_diverged(
    docker: &dyn ContainerAdapter,
    name: &str,
    expected_tag: &str,
    expected_id: &str,
) -> Result<bool> {
    if !docker.container_exists(name).await? {
        return Ok(true);
    }
    let config_image = docker.image_inspect_config_image(name).await?;
    if !expected_tag.is_empty() && config_image != expected_tag {
        debug!(container = name, found = %config_image, expected = %expected_tag, "image reference diverged");
        return Ok(true);
    }
    if !expected_id.is_empty() {
        match docker.image_inspect_id(&config_image).await {
            Ok(current_id) if current_id == expected_id => {}
            Ok(current_id) => {
                debug!(container = name, found = %current_id, expected = %expected_id, "image digest diverged");
                return Ok(true);
            }
            // The image the container was created from is gone; recreate
            Err(_) => return Ok(true),
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeDocker;
    use chrono::Utc;
    use serde_json::json;

    fn step(id: i64, settings: Value) -> StepRow {
        StepRow {
            id,
            task_id: 1,
            title: format!("step-{id}"),
            settings,
            results: json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_never_succeeded() {
        assert!(never_succeeded(&json!({})));
        assert!(never_succeeded(&json!({"result": "failure"})));
        assert!(!never_succeeded(&json!({"result": "success"})));
    }

    #[tokio::test]
    async fn test_resolve_prefers_dependency_id() {
        let docker = FakeDocker::new();
        docker.set_image("app:1", "sha256:from-inspect");
        let deps = vec![step(
            4,
            json!({"docker_build": {"image_tag": "app:1", "image_id": "sha256:from-dep"}}),
        )];
        let id = resolve_image_id(&docker, &deps, "app:1").await.unwrap();
        assert_eq!(id, "sha256:from-dep");
        // The adapter was never consulted
        assert!(docker.calls_for("image_inspect_id").is_empty());
    }

    #[tokio::test]
    async fn test_resolve_falls_back_to_inspect() {
        let docker = FakeDocker::new();
        docker.set_image("app:1", "sha256:from-inspect");
        let deps = vec![step(4, json!({"file_exists": {"files": []}}))];
        let id = resolve_image_id(&docker, &deps, "app:1").await.unwrap();
        assert_eq!(id, "sha256:from-inspect");
    }

    #[tokio::test]
    async fn test_resolve_unknown_image_is_empty() {
        let docker = FakeDocker::new();
        let id = resolve_image_id(&docker, &[], "ghost:1").await.unwrap();
        assert_eq!(id, "");
    }

    #[tokio::test]
    async fn test_identity_drift() {
        let docker = FakeDocker::new();
        let deps = vec![step(
            2,
            json!({"docker_build": {"image_tag": "app:1", "image_id": "sha256:new"}}),
        )];
        let check = check_image_identity(&docker, &deps, "app:1", "sha256:old")
            .await
            .unwrap();
        assert!(check.drifted);
        assert_eq!(check.resolved, "sha256:new");

        let check = check_image_identity(&docker, &deps, "app:1", "sha256:new")
            .await
            .unwrap();
        assert!(!check.drifted);
    }

    #[tokio::test]
    async fn test_container_diverged() {
        let docker = FakeDocker::new();
        // Missing container always diverges
        assert!(container_diverged(&docker, "ghost", "app:1", "").await.unwrap());

        docker.set_image("app:1", "sha256:aa");
        docker.set_container("c1", "app:1", true);
        assert!(!container_diverged(&docker, "c1", "app:1", "sha256:aa").await.unwrap());

        // Wrong image reference
        assert!(container_diverged(&docker, "c1", "app:2", "").await.unwrap());

        // Same reference, image rebuilt under it
        docker.set_image("app:1", "sha256:bb");
        assert!(container_diverged(&docker, "c1", "app:1", "sha256:aa").await.unwrap());
    }
}
