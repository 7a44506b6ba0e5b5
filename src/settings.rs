//! Task settings document.
//!
//! Task settings are an open JSON mapping shared by every step of a task.
//! This module gives the recognized keys a typed shape and implements the
//! read–merge–write helper all settings mutations go through: `docker` is
//! deep-merged by key, empty container-assignment keys are stripped,
//! deprecated MHTML keys are dropped, and the document is written back
//! whole. Unrecognized keys pass through untouched.

use crate::config::ImageRef;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Legacy hyphenated spelling of the cleanup command key, accepted on read
pub const HELD_OUT_CLEANUP_LEGACY_KEY: &str = "held_out_test-clean_up";

/// Task-settings keys dropped on every merge
const DEPRECATED_KEYS: &[&str] = &["mhtml", "mhtml_file", "mhtml_md_file"];

/// Container-assignment keys stripped when empty or null
const ASSIGNMENT_KEYS: &[&str] = &["assign_containers", "assigned_containers"];

/// One container assignment in `containers_map`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRef {
    /// Container id
    #[serde(default)]
    pub container_id: String,
    /// Container name
    #[serde(default)]
    pub container_name: String,
}

/// Typed view over a task's settings document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskSettings {
    /// Image identity shared by the task's steps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker: Option<ImageRef>,
    /// Path inside containers that holds the evaluated project tree
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_folder: Option<String>,
    /// Named volume holding the extracted project tree
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_name: Option<String>,
    /// Container platform, e.g. `linux/amd64`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    /// Shell command run to clean up after held-out tests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub held_out_test_clean_up: Option<String>,
    /// Logical role → container assignment; the source of truth
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub containers_map: BTreeMap<String, ContainerRef>,
    /// Legacy container list; read-only, never written by handlers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub containers: Vec<Value>,
    /// Extra arguments handlers splice into `docker run` invocations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub docker_run_parameters: Vec<String>,
    /// Criterion id → rubric content hash published by `rubric_set`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub rubric_set: BTreeMap<String, String>,
    /// Unrecognized keys, preserved verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TaskSettings {
    /// Decode a settings document. Unknown keys land in `extra`; a null or
    /// missing document decodes to the default.
    #[must_use]
    pub fn from_value(value: &Value) -> Self {
        if value.is_null() {
            return Self::default();
        }
        serde_json::from_value(value.clone()).unwrap_or_default()
    }

    /// The cleanup command, honouring the legacy hyphenated key on read
    #[must_use]
    pub fn held_out_cleanup(&self) -> Option<&str> {
        if let Some(cmd) = self.held_out_test_clean_up.as_deref() {
            return Some(cmd);
        }
        self.extra
            .get(HELD_OUT_CLEANUP_LEGACY_KEY)
            .and_then(Value::as_str)
    }

    /// Re-encode as a JSON document
    pub fn to_value(&self) -> crate::error::Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

fn is_empty_assignment(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(m) => m.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Merge a partial settings update into the current document.
///
/// `docker` is deep-merged key by key; every other update key replaces the
/// current value wholesale. After merging, empty container-assignment keys
/// and deprecated MHTML keys are removed. The caller writes the returned
/// document back atomically under the task row's primary key.
#[must_use]
pub fn merge_task_settings(current: &Value, updates: &Value) -> Value {
    let mut merged = match current {
        Value::Object(m) => m.clone(),
        _ => Map::new(),
    };

    if let Value::Object(updates) = updates {
        for (key, value) in updates {
            if key == "docker" {
                let target = merged
                    .entry("docker")
                    .or_insert_with(|| Value::Object(Map::new()));
                match (target, value) {
                    (Value::Object(dst), Value::Object(src)) => {
                        for (k, v) in src {
                            dst.insert(k.clone(), v.clone());
                        }
                    }
                    (slot, v) => *slot = v.clone(),
                }
            } else {
                merged.insert(key.clone(), value.clone());
            }
        }
    }

    for key in ASSIGNMENT_KEYS {
        if merged.get(*key).is_some_and(is_empty_assignment) {
            merged.remove(*key);
        }
    }
    for key in DEPRECATED_KEYS {
        merged.remove(*key);
    }

    Value::Object(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_docker_is_deep_merged() {
        let current = json!({
            "docker": {"image_tag": "app:1", "image_id": "sha256:old"},
            "app_folder": "/app"
        });
        let updates = json!({"docker": {"image_id": "sha256:new"}});
        let merged = merge_task_settings(&current, &updates);
        assert_eq!(merged["docker"]["image_tag"], "app:1");
        assert_eq!(merged["docker"]["image_id"], "sha256:new");
        assert_eq!(merged["app_folder"], "/app");
    }

    #[test]
    fn test_other_keys_replace_wholesale() {
        let current = json!({"docker_run_parameters": ["-e", "A=1"]});
        let updates = json!({"docker_run_parameters": ["-e", "B=2"]});
        let merged = merge_task_settings(&current, &updates);
        assert_eq!(merged["docker_run_parameters"], json!(["-e", "B=2"]));
    }

    #[test]
    fn test_empty_assignment_keys_stripped() {
        let current = json!({"assign_containers": {}, "assigned_containers": null});
        let merged = merge_task_settings(&current, &json!({}));
        assert!(merged.get("assign_containers").is_none());
        assert!(merged.get("assigned_containers").is_none());

        // Non-empty assignments survive
        let current = json!({"assign_containers": {"golden": "c1"}});
        let merged = merge_task_settings(&current, &json!({}));
        assert_eq!(merged["assign_containers"]["golden"], "c1");
    }

    #[test]
    fn test_deprecated_mhtml_keys_removed() {
        let current = json!({"mhtml_file": "export.mhtml", "volume_name": "v1"});
        let merged = merge_task_settings(&current, &json!({}));
        assert!(merged.get("mhtml_file").is_none());
        assert_eq!(merged["volume_name"], "v1");
    }

    #[test]
    fn test_legacy_cleanup_key_read_not_rewritten() {
        let value = json!({(HELD_OUT_CLEANUP_LEGACY_KEY): "rm -rf /tmp/hot"});
        let settings = TaskSettings::from_value(&value);
        assert_eq!(settings.held_out_cleanup(), Some("rm -rf /tmp/hot"));

        // Canonical spelling wins when both are present
        let value = json!({
            "held_out_test_clean_up": "canonical",
            (HELD_OUT_CLEANUP_LEGACY_KEY): "legacy"
        });
        let settings = TaskSettings::from_value(&value);
        assert_eq!(settings.held_out_cleanup(), Some("canonical"));

        // Round-trip keeps the legacy key where it was (in extra), without
        // promoting it to the canonical spelling
        let value = json!({(HELD_OUT_CLEANUP_LEGACY_KEY): "legacy"});
        let settings = TaskSettings::from_value(&value);
        let encoded = settings.to_value().unwrap();
        assert_eq!(encoded[HELD_OUT_CLEANUP_LEGACY_KEY], "legacy");
        assert!(encoded.get("held_out_test_clean_up").is_none());
    }

    #[test]
    fn test_containers_map_roundtrip() {
        let value = json!({
            "containers_map": {
                "golden": {"container_id": "abc", "container_name": "task_1_golden_container"}
            }
        });
        let settings = TaskSettings::from_value(&value);
        let golden = &settings.containers_map["golden"];
        assert_eq!(golden.container_name, "task_1_golden_container");
        let encoded = settings.to_value().unwrap();
        assert_eq!(encoded["containers_map"]["golden"]["container_id"], "abc");
    }

    #[test]
    fn test_unknown_keys_pass_through() {
        let value = json!({"custom_flag": true});
        let settings = TaskSettings::from_value(&value);
        let encoded = settings.to_value().unwrap();
        assert_eq!(encoded["custom_flag"], true);
    }
}
