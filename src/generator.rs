//! Dynamic step generation.
//!
//! Rubric-hosting steps (`dynamic_lab`, `dynamic_rubric`, `rubric_set`)
//! synthesize one `rubric_shell` child per parsed criterion. Regeneration
//! deletes every existing child first (matched on `generated_by` in either
//! placement), then creates the new set with dependency links back to the
//! resolved container source step.

use crate::config::{DepRef, RubricShellConfig, StepConfig, StepSettings};
use crate::error::Result;
use crate::rubric::Criterion;
use crate::store::{StepRow, Store};
use serde_json::Value;
use tracing::info;

/// The `generated_by` marker of a raw settings document, wherever it sits
#[must_use]
pub fn generated_by_of(settings: &Value) -> Option<i64> {
    let obj = settings.as_object()?;
    if let Some(id) = obj.get("generated_by").and_then(Value::as_i64) {
        return Some(id);
    }
    obj.values()
        .find_map(|v| v.get("generated_by").and_then(Value::as_i64))
}

/// Existing children generated by a parent step, ascending id
pub async fn generated_children(
    store: &dyn Store,
    task_id: i64,
    parent_step_id: i64,
) -> Result<Vec<StepRow>> {
    Ok(store
        .steps_for_task(task_id)
        .await?
        .into_iter()
        .filter(|step| generated_by_of(&step.settings) == Some(parent_step_id))
        .collect())
}

/// Delete a parent's children and create one `rubric_shell` per criterion.
///
/// Criteria that need a container are skipped (with a log line) when the
/// parent's environment is not Docker. Returns the created step ids in
/// criterion order.
pub async fn regenerate(
    store: &dyn Store,
    task_id: i64,
    parent_step_id: i64,
    source_step_id: Option<i64>,
    criteria: &[Criterion],
    docker_env: bool,
) -> Result<Vec<i64>> {
    let stale: Vec<i64> = generated_children(store, task_id, parent_step_id)
        .await?
        .iter()
        .map(|s| s.id)
        .collect();
    let removed = store.delete_steps(&stale).await?;
    if removed > 0 {
        info!(parent = parent_step_id, removed, "deleted generated steps");
    }

    let mut created = Vec::new();
    for criterion in criteria {
        if !docker_env && criterion.requires_docker {
            info!(
                parent = parent_step_id,
                criterion = %criterion.title,
                "criterion needs a container; skipped outside docker"
            );
            continue;
        }
        let config = RubricShellConfig {
            command: criterion.held_out_test.clone(),
            criterion_id: criterion.title.clone(),
            counter: criterion.counter,
            score: criterion.score,
            required: criterion.required,
            generated_by: Some(parent_step_id),
            depends_on: source_step_id.map(DepRef::new).into_iter().collect(),
            ..RubricShellConfig::default()
        };
        let settings = StepSettings::from_config(StepConfig::RubricShell(config));
        let title = format!("#{}: {}", criterion.counter, criterion.title);
        let row = store
            .create_step(task_id, &title, settings.to_value()?)
            .await?;
        created.push(row.id);
    }
    info!(parent = parent_step_id, created = created.len(), "generated rubric shell steps");
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryStore;
    use serde_json::json;

    fn criterion(counter: u32, title: &str, required: bool) -> Criterion {
        Criterion {
            counter,
            title: title.to_string(),
            score: 3,
            required,
            rubric: "prose".to_string(),
            held_out_test: format!("run-test-{counter}"),
            requires_docker: true,
        }
    }

    #[test]
    fn test_generated_by_of_both_placements() {
        assert_eq!(
            generated_by_of(&json!({"rubric_shell": {"generated_by": 4}})),
            Some(4)
        );
        assert_eq!(generated_by_of(&json!({"generated_by": 9})), Some(9));
        assert_eq!(generated_by_of(&json!({"rubric_shell": {}})), None);
    }

    #[tokio::test]
    async fn test_regenerate_replaces_children() {
        let store = MemoryStore::new();
        let task = store.create_task("t", "active", None, json!({})).await.unwrap();
        let parent = store
            .create_step(task.id, "rubric", json!({"rubric_set": {"file": "r.md"}}))
            .await
            .unwrap();
        let pool = store
            .create_step(task.id, "pool", json!({"docker_pool": {"pool_size": 1}}))
            .await
            .unwrap();

        let first = regenerate(
            &store,
            task.id,
            parent.id,
            Some(pool.id),
            &[criterion(1, "u1", true), criterion(2, "u2", false)],
            true,
        )
        .await
        .unwrap();
        assert_eq!(first.len(), 2);

        // Regenerating with a grown rubric leaves exactly the new set
        let second = regenerate(
            &store,
            task.id,
            parent.id,
            Some(pool.id),
            &[
                criterion(1, "u1", true),
                criterion(2, "u2", false),
                criterion(3, "u3", true),
            ],
            true,
        )
        .await
        .unwrap();
        assert_eq!(second.len(), 3);

        let children = generated_children(&store, task.id, parent.id).await.unwrap();
        assert_eq!(children.len(), 3);
        for (row, counter) in children.iter().zip(1u32..) {
            let settings = StepSettings::decode(&row.settings).unwrap();
            let StepConfig::RubricShell(cfg) = settings.config else {
                panic!("child is not rubric_shell");
            };
            assert_eq!(cfg.counter, counter);
            assert_eq!(cfg.generated_by, Some(parent.id));
            assert_eq!(cfg.depends_on, vec![DepRef::new(pool.id)]);
        }
    }

    #[tokio::test]
    async fn test_regenerate_empty_rubric_deletes_and_creates_none() {
        let store = MemoryStore::new();
        let task = store.create_task("t", "active", None, json!({})).await.unwrap();
        let parent = store
            .create_step(task.id, "rubric", json!({"rubric_set": {"file": "r.md"}}))
            .await
            .unwrap();
        regenerate(&store, task.id, parent.id, None, &[criterion(1, "u1", true)], true)
            .await
            .unwrap();

        let created = regenerate(&store, task.id, parent.id, None, &[], true)
            .await
            .unwrap();
        assert!(created.is_empty());
        assert!(generated_children(&store, task.id, parent.id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_non_docker_environment_skips_container_criteria() {
        let store = MemoryStore::new();
        let task = store.create_task("t", "active", None, json!({})).await.unwrap();
        let parent = store
            .create_step(task.id, "rubric", json!({"dynamic_lab": {}}))
            .await
            .unwrap();

        let mut local = criterion(2, "u2", false);
        local.requires_docker = false;
        let created = regenerate(
            &store,
            task.id,
            parent.id,
            None,
            &[criterion(1, "u1", true), local],
            false,
        )
        .await
        .unwrap();
        assert_eq!(created.len(), 1);
        let children = generated_children(&store, task.id, parent.id).await.unwrap();
        assert_eq!(children.len(), 1);
        assert!(children[0].title.contains("u2"));
    }
}
