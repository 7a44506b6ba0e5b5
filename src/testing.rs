//! Test-support fakes.
//!
//! [`FakeDocker`] is a scripted [`ContainerAdapter`]: tests queue responses
//! per operation and assert on the exact call log afterwards, which is how
//! the order-sensitive properties (patch application order, idempotent
//! second passes) are checked without a container engine. [`MemoryStore`]
//! is a complete in-memory [`Store`] so engine runs need no database.

use crate::docker::{ContainerAdapter, ExecOutput};
use crate::error::{Error, Result};
use crate::settings::merge_task_settings;
use crate::store::{Store, StepRow, TaskRow};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

/// A recorded adapter call, rendered as one line for easy assertions
#[must_use]
pub fn call_line(op: &str, detail: &str) -> String {
    format!("{op} {detail}")
}

#[derive(Default)]
struct FakeDockerState {
    calls: Vec<String>,
    image_ids: HashMap<String, String>,
    containers: HashMap<String, FakeContainer>,
    volumes: HashSet<String>,
    exec_results: VecDeque<ExecOutput>,
    run_results: VecDeque<ExecOutput>,
    next_container_id: u64,
    fail_next: Option<String>,
}

#[derive(Clone)]
struct FakeContainer {
    running: bool,
    image: String,
}

/// Scripted container adapter for tests
#[derive(Default)]
pub struct FakeDocker {
    state: Mutex<FakeDockerState>,
}

impl FakeDocker {
    /// Create an empty fake
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an image tag → digest mapping
    pub fn set_image(&self, image_ref: &str, digest: &str) {
        let mut s = self.state.lock().unwrap();
        s.image_ids.insert(image_ref.to_string(), digest.to_string());
    }

    /// Register an existing container
    pub fn set_container(&self, name: &str, image: &str, running: bool) {
        let mut s = self.state.lock().unwrap();
        s.containers.insert(
            name.to_string(),
            FakeContainer {
                running,
                image: image.to_string(),
            },
        );
    }

    /// Register an existing volume
    pub fn set_volume(&self, name: &str) {
        self.state.lock().unwrap().volumes.insert(name.to_string());
    }

    /// Queue the output of the next `container_exec`
    pub fn push_exec_result(&self, output: &str, exit_code: i32) {
        self.state.lock().unwrap().exec_results.push_back(ExecOutput {
            output: output.to_string(),
            exit_code,
        });
    }

    /// Queue the output of the next `image_run`
    pub fn push_run_result(&self, output: &str, exit_code: i32) {
        self.state.lock().unwrap().run_results.push_back(ExecOutput {
            output: output.to_string(),
            exit_code,
        });
    }

    /// Make the next engine call fail with the given message
    pub fn fail_next(&self, message: &str) {
        self.state.lock().unwrap().fail_next = Some(message.to_string());
    }

    /// The full ordered call log
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Calls recorded for one operation
    #[must_use]
    pub fn calls_for(&self, op: &str) -> Vec<String> {
        let prefix = format!("{op} ");
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.starts_with(&prefix))
            .cloned()
            .collect()
    }

    /// Drop the recorded call log (keeps images/containers/volumes)
    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    fn record(&self, op: &str, detail: &str) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        s.calls.push(call_line(op, detail));
        if let Some(msg) = s.fail_next.take() {
            return Err(Error::command_failed(format!("{op} {detail}"), 1, msg));
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerAdapter for FakeDocker {
    async fn image_inspect_id(&self, image_ref: &str) -> Result<String> {
        self.record("image_inspect_id", image_ref)?;
        let s = self.state.lock().unwrap();
        s.image_ids
            .get(image_ref)
            .cloned()
            .ok_or_else(|| Error::image_not_found(image_ref))
    }

    async fn image_inspect_config_image(&self, container: &str) -> Result<String> {
        self.record("image_inspect_config_image", container)?;
        let s = self.state.lock().unwrap();
        s.containers
            .get(container)
            .map(|c| c.image.clone())
            .ok_or_else(|| Error::container_not_found(container))
    }

    async fn container_exists(&self, name: &str) -> Result<bool> {
        self.record("container_exists", name)?;
        Ok(self.state.lock().unwrap().containers.contains_key(name))
    }

    async fn container_is_running(&self, name: &str) -> Result<bool> {
        self.record("container_is_running", name)?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .containers
            .get(name)
            .is_some_and(|c| c.running))
    }

    async fn container_start(&self, name: &str) -> Result<()> {
        self.record("container_start", name)?;
        let mut s = self.state.lock().unwrap();
        match s.containers.get_mut(name) {
            Some(c) => {
                c.running = true;
                Ok(())
            }
            None => Err(Error::container_not_found(name)),
        }
    }

    async fn container_remove_force(&self, name: &str) -> Result<()> {
        self.record("container_remove_force", name)?;
        self.state.lock().unwrap().containers.remove(name);
        Ok(())
    }

    async fn container_run_detached(
        &self,
        run_args: &[String],
        image: &str,
        command: Option<&[String]>,
    ) -> Result<String> {
        let detail = match command {
            Some(cmd) => format!("{} {image} {}", run_args.join(" "), cmd.join(" ")),
            None => format!("{} {image}", run_args.join(" ")),
        };
        self.record("container_run_detached", &detail)?;
        let mut s = self.state.lock().unwrap();
        s.next_container_id += 1;
        let id = format!("fake-container-{}", s.next_container_id);
        // A --name argument registers the container under that name
        let name = run_args
            .iter()
            .position(|a| a == "--name")
            .and_then(|i| run_args.get(i + 1))
            .cloned()
            .unwrap_or_else(|| id.clone());
        s.containers.insert(
            name,
            FakeContainer {
                running: true,
                image: image.to_string(),
            },
        );
        Ok(id)
    }

    async fn container_exec(&self, name: &str, shell_cmd: &str) -> Result<ExecOutput> {
        self.record("container_exec", &format!("{name} {shell_cmd}"))?;
        if !self.state.lock().unwrap().containers.contains_key(name) {
            return Err(Error::container_not_found(name));
        }
        Ok(self
            .state
            .lock()
            .unwrap()
            .exec_results
            .pop_front()
            .unwrap_or(ExecOutput {
                output: String::new(),
                exit_code: 0,
            }))
    }

    async fn container_copy_in(
        &self,
        name: &str,
        host_path: &str,
        container_path: &str,
    ) -> Result<()> {
        self.record(
            "container_copy_in",
            &format!("{name} {host_path} {container_path}"),
        )?;
        Ok(())
    }

    async fn volume_exists(&self, name: &str) -> Result<bool> {
        self.record("volume_exists", name)?;
        Ok(self.state.lock().unwrap().volumes.contains(name))
    }

    async fn image_build(&self, build_args: &[String], tag: &str, context: &str) -> Result<String> {
        self.record(
            "image_build",
            &format!("{} {tag} {context}", build_args.join(" ")),
        )?;
        Ok(String::new())
    }

    async fn image_pull(&self, image_ref: &str) -> Result<()> {
        self.record("image_pull", image_ref)?;
        Ok(())
    }

    async fn image_run(
        &self,
        run_args: &[String],
        image: &str,
        command: &[String],
    ) -> Result<ExecOutput> {
        self.record(
            "image_run",
            &format!("{} {image} {}", run_args.join(" "), command.join(" ")),
        )?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .run_results
            .pop_front()
            .unwrap_or(ExecOutput {
                output: String::new(),
                exit_code: 0,
            }))
    }
}

#[derive(Default)]
struct MemoryState {
    tasks: HashMap<i64, TaskRow>,
    steps: HashMap<i64, StepRow>,
    next_task_id: i64,
    next_step_id: i64,
    locked: HashSet<i64>,
}

/// In-memory store for engine tests
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn task(&self, id: i64) -> Result<TaskRow> {
        self.state
            .lock()
            .unwrap()
            .tasks
            .get(&id)
            .cloned()
            .ok_or(Error::TaskNotFound { task_id: id })
    }

    async fn tasks(&self) -> Result<Vec<TaskRow>> {
        let s = self.state.lock().unwrap();
        let mut rows: Vec<TaskRow> = s.tasks.values().cloned().collect();
        rows.sort_by_key(|t| t.id);
        Ok(rows)
    }

    async fn active_tasks(&self) -> Result<Vec<TaskRow>> {
        Ok(self
            .tasks()
            .await?
            .into_iter()
            .filter(|t| t.status == "active")
            .collect())
    }

    async fn create_task(
        &self,
        name: &str,
        status: &str,
        local_path: Option<&str>,
        settings: Value,
    ) -> Result<TaskRow> {
        let mut s = self.state.lock().unwrap();
        s.next_task_id += 1;
        let row = TaskRow {
            id: s.next_task_id,
            name: name.to_string(),
            status: status.to_string(),
            local_path: local_path.map(String::from),
            settings,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        s.tasks.insert(row.id, row.clone());
        Ok(row)
    }

    async fn update_task(
        &self,
        id: i64,
        name: Option<&str>,
        status: Option<&str>,
        local_path: Option<&str>,
    ) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        let task = s
            .tasks
            .get_mut(&id)
            .ok_or(Error::TaskNotFound { task_id: id })?;
        if let Some(name) = name {
            task.name = name.to_string();
        }
        if let Some(status) = status {
            task.status = status.to_string();
        }
        if let Some(local_path) = local_path {
            task.local_path = Some(local_path.to_string());
        }
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn update_task_settings(&self, id: i64, updates: &Value) -> Result<Value> {
        let mut s = self.state.lock().unwrap();
        let task = s
            .tasks
            .get_mut(&id)
            .ok_or(Error::TaskNotFound { task_id: id })?;
        let merged = merge_task_settings(&task.settings, updates);
        task.settings = merged.clone();
        task.updated_at = Utc::now();
        Ok(merged)
    }

    async fn delete_task(&self, id: i64) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        s.tasks
            .remove(&id)
            .ok_or(Error::TaskNotFound { task_id: id })?;
        s.steps.retain(|_, step| step.task_id != id);
        Ok(())
    }

    async fn step(&self, id: i64) -> Result<StepRow> {
        self.state
            .lock()
            .unwrap()
            .steps
            .get(&id)
            .cloned()
            .ok_or(Error::StepNotFound { step_id: id })
    }

    async fn steps_for_task(&self, task_id: i64) -> Result<Vec<StepRow>> {
        let s = self.state.lock().unwrap();
        let mut rows: Vec<StepRow> = s
            .steps
            .values()
            .filter(|step| step.task_id == task_id)
            .cloned()
            .collect();
        rows.sort_by_key(|s| s.id);
        Ok(rows)
    }

    async fn create_step(&self, task_id: i64, title: &str, settings: Value) -> Result<StepRow> {
        let mut s = self.state.lock().unwrap();
        if !s.tasks.contains_key(&task_id) {
            return Err(Error::TaskNotFound { task_id });
        }
        s.next_step_id += 1;
        let row = StepRow {
            id: s.next_step_id,
            task_id,
            title: title.to_string(),
            settings,
            results: json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        s.steps.insert(row.id, row.clone());
        Ok(row)
    }

    async fn update_step_settings(&self, id: i64, settings: Value) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        let step = s
            .steps
            .get_mut(&id)
            .ok_or(Error::StepNotFound { step_id: id })?;
        step.settings = settings;
        step.updated_at = Utc::now();
        Ok(())
    }

    async fn update_step_results(&self, id: i64, results: Value) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        let step = s
            .steps
            .get_mut(&id)
            .ok_or(Error::StepNotFound { step_id: id })?;
        step.results = results;
        step.updated_at = Utc::now();
        Ok(())
    }

    async fn update_step_title(&self, id: i64, title: &str) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        let step = s
            .steps
            .get_mut(&id)
            .ok_or(Error::StepNotFound { step_id: id })?;
        step.title = title.to_string();
        step.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_step(&self, id: i64) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .steps
            .remove(&id)
            .map(|_| ())
            .ok_or(Error::StepNotFound { step_id: id })
    }

    async fn delete_steps(&self, ids: &[i64]) -> Result<u64> {
        let mut s = self.state.lock().unwrap();
        let mut removed = 0;
        for id in ids {
            if s.steps.remove(id).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn try_lock_task(&self, task_id: i64) -> Result<bool> {
        Ok(self.state.lock().unwrap().locked.insert(task_id))
    }

    async fn unlock_task(&self, task_id: i64) -> Result<()> {
        self.state.lock().unwrap().locked.remove(&task_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fake_docker_records_calls_in_order() {
        let docker = FakeDocker::new();
        docker.set_image("app:1", "sha256:abc");
        docker.set_container("c1", "app:1", false);

        assert_eq!(docker.image_inspect_id("app:1").await.unwrap(), "sha256:abc");
        assert!(!docker.container_is_running("c1").await.unwrap());
        docker.container_start("c1").await.unwrap();
        assert!(docker.container_is_running("c1").await.unwrap());

        assert_eq!(
            docker.calls(),
            vec![
                "image_inspect_id app:1",
                "container_is_running c1",
                "container_start c1",
                "container_is_running c1",
            ]
        );
    }

    #[tokio::test]
    async fn test_fake_docker_run_detached_registers_named_container() {
        let docker = FakeDocker::new();
        let args = vec!["-d".to_string(), "--name".to_string(), "pool_1".to_string()];
        docker.container_run_detached(&args, "app:1", None).await.unwrap();
        assert!(docker.container_exists("pool_1").await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_store_task_lifecycle() {
        let store = MemoryStore::new();
        let task = store
            .create_task("demo", "active", Some("/w/t"), json!({}))
            .await
            .unwrap();
        let step = store
            .create_step(task.id, "build", json!({"docker_build": {}}))
            .await
            .unwrap();

        store
            .update_step_results(step.id, json!({"result": "success"}))
            .await
            .unwrap();
        assert_eq!(store.step(step.id).await.unwrap().result_kind(), "success");

        assert!(store.try_lock_task(task.id).await.unwrap());
        assert!(!store.try_lock_task(task.id).await.unwrap());
        store.unlock_task(task.id).await.unwrap();
        assert!(store.try_lock_task(task.id).await.unwrap());

        store.delete_task(task.id).await.unwrap();
        assert!(store.step(step.id).await.is_err());
    }

    #[tokio::test]
    async fn test_memory_store_settings_merge() {
        let store = MemoryStore::new();
        let task = store
            .create_task(
                "demo",
                "active",
                None,
                json!({"docker": {"image_tag": "app:1"}}),
            )
            .await
            .unwrap();
        let merged = store
            .update_task_settings(task.id, &json!({"docker": {"image_id": "sha256:x"}}))
            .await
            .unwrap();
        assert_eq!(merged["docker"]["image_tag"], "app:1");
        assert_eq!(merged["docker"]["image_id"], "sha256:x");
    }
}
