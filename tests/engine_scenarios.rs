//! End-to-end engine runs against the in-memory store and the scripted
//! container adapter.

use serde_json::json;
use std::sync::Arc;
use task_sync::testing::{FakeDocker, MemoryStore};
use task_sync::{Engine, RunMode, StepConfig, StepSettings, StepStatus, Store};

fn engine(store: &Arc<MemoryStore>, docker: &Arc<FakeDocker>) -> Engine {
    Engine::new(store.clone(), docker.clone())
}

async fn make_task(store: &MemoryStore, local_path: &str) -> i64 {
    store
        .create_task("demo", "active", Some(local_path), json!({}))
        .await
        .unwrap()
        .id
}

#[tokio::test]
async fn build_run_shell_then_idempotent_second_pass() {
    let store = Arc::new(MemoryStore::new());
    let docker = Arc::new(FakeDocker::new());
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("Dockerfile"), "FROM scratch\n").unwrap();
    docker.set_image("app:1", "sha256:d1");

    let task_id = make_task(&store, dir.path().to_str().unwrap()).await;
    let a = store
        .create_step(
            task_id,
            "build",
            json!({"docker_build": {"image_tag": "app:1", "files": {"Dockerfile": ""}}}),
        )
        .await
        .unwrap();
    let b = store
        .create_step(
            task_id,
            "run",
            json!({"docker_run": {
                "container_name": "c-app",
                "keep_forever": true,
                "depends_on": [{"id": a.id}]
            }}),
        )
        .await
        .unwrap();
    let c = store
        .create_step(
            task_id,
            "shell",
            json!({"docker_shell": {
                "commands": [{"run": "echo hi"}],
                "depends_on": [{"id": b.id}]
            }}),
        )
        .await
        .unwrap();

    docker.push_exec_result("hi\n", 0);
    let reports = engine(&store, &docker).run_task(task_id).await.unwrap();
    assert!(reports.iter().all(|r| r.status == StepStatus::Succeeded));

    // A recorded the digest of its tag
    let a_row = store.step(a.id).await.unwrap();
    let a_settings = StepSettings::decode(&a_row.settings).unwrap();
    assert_eq!(a_settings.config.image_id(), "sha256:d1");
    assert_eq!(a_row.results["image_id"], "sha256:d1");

    // B recorded its container, C captured the command output
    let b_row = store.step(b.id).await.unwrap();
    assert_eq!(b_row.results["container_name"], "c-app");
    assert!(b_row.results["container_id"].as_str().is_some());
    let c_row = store.step(c.id).await.unwrap();
    assert_eq!(c_row.results["result"], "success");
    assert_eq!(c_row.results["output"], "hi\n");

    // Second pass with no external change: everything skips, results stay
    // identical, and the engine performs no state-changing calls against
    // the adapter.
    let mut results_before = Vec::new();
    for id in [a.id, b.id, c.id] {
        results_before.push(store.step(id).await.unwrap().results);
    }
    docker.clear_calls();
    let reports = engine(&store, &docker).run_task(task_id).await.unwrap();
    assert!(reports.iter().all(|r| r.status == StepStatus::Skipped));
    for op in [
        "image_build",
        "image_pull",
        "container_run_detached",
        "container_start",
        "container_remove_force",
        "container_exec",
        "container_copy_in",
        "image_run",
    ] {
        assert!(docker.calls_for(op).is_empty(), "unexpected {op} on second pass");
    }
    let mut results_after = Vec::new();
    for id in [a.id, b.id, c.id] {
        results_after.push(store.step(id).await.unwrap().results);
    }
    assert_eq!(results_before, results_after);
}

const RUBRIC_TWO: &str = "\
### #1: aaaaaaaa-0000-4000-8000-000000000001
**Score**: 4
**Required**: true
**Criterion**: first

```bash
run-test-1
```

### #2: aaaaaaaa-0000-4000-8000-000000000002
**Score**: 2
**Required**: false
**Criterion**: second

```bash
run-test-2
```
";

const RUBRIC_THREE_EXTRA: &str = "
### #3: aaaaaaaa-0000-4000-8000-000000000003
**Score**: 1
**Required**: false
**Criterion**: third

```bash
run-test-3
```
";

#[tokio::test]
async fn rubric_regeneration_tracks_the_file() {
    let store = Arc::new(MemoryStore::new());
    let docker = Arc::new(FakeDocker::new());
    let dir = tempfile::tempdir().unwrap();
    let rubric_path = dir.path().join("rubric.md");
    std::fs::write(&rubric_path, RUBRIC_TWO).unwrap();
    docker.set_image("app:1", "sha256:d1");

    let task_id = make_task(&store, dir.path().to_str().unwrap()).await;
    let pool = store
        .create_step(
            task_id,
            "pool",
            json!({"docker_pool": {"pool_size": 1, "image_tag": "app:1"}}),
        )
        .await
        .unwrap();
    let rubric = store
        .create_step(
            task_id,
            "rubric",
            json!({"rubric_set": {"file": "rubric.md", "depends_on": [{"id": pool.id}]}}),
        )
        .await
        .unwrap();

    engine(&store, &docker).run_task(task_id).await.unwrap();
    let children = task_sync::generator::generated_children(store.as_ref(), task_id, rubric.id)
        .await
        .unwrap();
    assert_eq!(children.len(), 2);

    // Growing the rubric replaces the children with exactly the new set
    std::fs::write(
        &rubric_path,
        format!("{RUBRIC_TWO}{RUBRIC_THREE_EXTRA}"),
    )
    .unwrap();
    engine(&store, &docker).run_task(task_id).await.unwrap();
    let children = task_sync::generator::generated_children(store.as_ref(), task_id, rubric.id)
        .await
        .unwrap();
    assert_eq!(children.len(), 3);
    for (row, counter) in children.iter().zip(1u32..) {
        let settings = StepSettings::decode(&row.settings).unwrap();
        let StepConfig::RubricShell(cfg) = settings.config else {
            panic!("child is not rubric_shell");
        };
        assert_eq!(cfg.counter, counter);
        assert_eq!(cfg.generated_by, Some(rubric.id));
        assert_eq!(cfg.depends_on.first().map(|d| d.id), Some(pool.id));
    }

    // The criterion → content-hash map was published into task settings
    let task = store.task(task_id).await.unwrap();
    assert_eq!(
        task.settings["rubric_set"].as_object().unwrap().len(),
        3
    );
}

#[tokio::test]
async fn identity_drift_goes_pending_then_runs() {
    let store = Arc::new(MemoryStore::new());
    let docker = Arc::new(FakeDocker::new());
    let dir = tempfile::tempdir().unwrap();
    let task_data = "1 [x] make test\n";
    std::fs::write(dir.path().join("TASK_DATA.md"), task_data).unwrap();
    let current_hash = task_sync::hash::sha256_hex(task_data.as_bytes());

    let task_id = make_task(&store, dir.path().to_str().unwrap()).await;
    let build = store
        .create_step(
            task_id,
            "build",
            json!({"docker_build": {"image_tag": "app:1", "image_id": "sha256:new"}}),
        )
        .await
        .unwrap();
    store
        .update_step_results(build.id, json!({"result": "success"}))
        .await
        .unwrap();
    let rubrics = store
        .create_step(
            task_id,
            "rubrics",
            json!({"docker_rubrics": {
                "files": ["TASK_DATA.md"],
                "hashes": {"TASK_DATA.md": current_hash},
                "image_tag": "app:1",
                "image_id": "sha256:old",
                "depends_on": [{"id": build.id}]
            }}),
        )
        .await
        .unwrap();

    // First invocation adopts the dependency's id and yields
    let report = engine(&store, &docker)
        .run_step(rubrics.id, false)
        .await
        .unwrap();
    assert_eq!(report.status, StepStatus::Pending);
    let row = store.step(rubrics.id).await.unwrap();
    assert_eq!(row.results["result"], "pending");
    let settings = StepSettings::decode(&row.settings).unwrap();
    assert_eq!(settings.config.image_id(), "sha256:new");

    // The next cycle executes against the adopted image
    docker.clear_calls();
    docker.push_run_result("ok\n", 0);
    let report = engine(&store, &docker)
        .run_step(rubrics.id, false)
        .await
        .unwrap();
    assert_eq!(report.status, StepStatus::Succeeded);
    let runs = docker.calls_for("image_run");
    assert_eq!(runs.len(), 1);
    assert!(runs[0].contains("sha256:new"), "ran against {runs:?}");
}

#[tokio::test]
async fn volume_pool_applies_patches_in_order_and_resets_force() {
    let store = Arc::new(MemoryStore::new());
    let docker = Arc::new(FakeDocker::new());
    let dir = tempfile::tempdir().unwrap();
    for patch in ["s1.patch", "setup.patch", "hot.patch"] {
        std::fs::write(dir.path().join(patch), "--- a\n+++ b\n").unwrap();
    }
    docker.set_image("app:1", "sha256:d1");

    let task_id = make_task(&store, dir.path().to_str().unwrap()).await;
    let step = store
        .create_step(
            task_id,
            "volume pool",
            json!({"docker_volume_pool": {
                "solutions": ["s1.patch"],
                "grading_setup_script": "setup.patch",
                "held_out_test_file": "hot.patch",
                "triggers": {"image_tag": "app:1"},
                "force": true
            }}),
        )
        .await
        .unwrap();

    let report = engine(&store, &docker).run_step(step.id, false).await.unwrap();
    assert_eq!(report.status, StepStatus::Succeeded);

    let name = format!("task_{task_id}_s1_container");
    let base = dir.path().to_str().unwrap();
    let in_container: Vec<String> = docker
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("container_exec") || c.starts_with("container_copy_in"))
        .collect();
    assert_eq!(
        in_container,
        vec![
            format!("container_exec {name} cd /app; git reset --hard HEAD"),
            format!("container_exec {name} cd /app; git checkout -- ."),
            format!("container_exec {name} cd /app; git clean -fd"),
            format!("container_copy_in {name} {base}/setup.patch /tmp/grading_setup.patch"),
            format!("container_exec {name} cd /app; git apply /tmp/grading_setup.patch"),
            format!("container_copy_in {name} {base}/s1.patch /tmp/s1.patch"),
            format!("container_exec {name} cd /app; git apply /tmp/s1.patch"),
            format!("container_copy_in {name} {base}/hot.patch /tmp/hot.patch"),
            format!("container_exec {name} cd /app; git apply /tmp/hot.patch"),
        ]
    );

    // Force flag reset law: a subsequent read sees force=false
    let row = store.step(step.id).await.unwrap();
    let settings = StepSettings::decode(&row.settings).unwrap();
    let StepConfig::DockerVolumePool(cfg) = settings.config else {
        panic!("wrong variant");
    };
    assert!(!cfg.force);
    assert_eq!(cfg.triggers.containers["s1.patch"], name);

    // The assignment map is the source of truth in task settings
    let task = store.task(task_id).await.unwrap();
    assert_eq!(
        task.settings["containers_map"]["s1"]["container_name"],
        name.as_str()
    );
}

#[tokio::test]
async fn failed_dependency_fences_dependents() {
    let store = Arc::new(MemoryStore::new());
    let docker = Arc::new(FakeDocker::new());
    let dir = tempfile::tempdir().unwrap();
    docker.set_image("app:1", "sha256:d1");

    let task_id = make_task(&store, dir.path().to_str().unwrap()).await;
    let build = store
        .create_step(
            task_id,
            "build",
            json!({"docker_build": {"image_tag": "app:1"}}),
        )
        .await
        .unwrap();
    let shell = store
        .create_step(
            task_id,
            "shell",
            json!({"docker_shell": {
                "commands": [{"run": "echo hi"}],
                "depends_on": [{"id": build.id}]
            }}),
        )
        .await
        .unwrap();

    docker.fail_next("no Dockerfile");
    let reports = engine(&store, &docker).run_task(task_id).await.unwrap();
    assert!(matches!(reports[0].status, StepStatus::Failed(_)));
    assert_eq!(reports[1].status, StepStatus::Deferred);

    // The fenced step's result document is untouched
    let row = store.step(shell.id).await.unwrap();
    assert_eq!(row.results, json!({}));
    // The failure carries the command output for diagnostics
    let row = store.step(build.id).await.unwrap();
    assert_eq!(row.results["result"], "failure");
    assert!(row.results["output"].as_str().unwrap().contains("no Dockerfile"));
}

#[tokio::test]
async fn cycle_refuses_to_start() {
    let store = Arc::new(MemoryStore::new());
    let docker = Arc::new(FakeDocker::new());
    let task_id = make_task(&store, "/tmp").await;
    let first = store
        .create_step(task_id, "a", json!({"file_exists": {"files": []}}))
        .await
        .unwrap();
    let second = store
        .create_step(
            task_id,
            "b",
            json!({"file_exists": {"files": [], "depends_on": [{"id": first.id}]}}),
        )
        .await
        .unwrap();
    store
        .update_step_settings(
            first.id,
            json!({"file_exists": {"files": [], "depends_on": [{"id": second.id}]}}),
        )
        .await
        .unwrap();

    let err = engine(&store, &docker).run_task(task_id).await.unwrap_err();
    assert!(matches!(err, task_sync::Error::DependencyCycle { .. }));
    // No handler ran
    assert!(docker.calls().is_empty());
}

#[tokio::test]
async fn pool_size_zero_succeeds_with_empty_map() {
    let store = Arc::new(MemoryStore::new());
    let docker = Arc::new(FakeDocker::new());
    let task_id = make_task(&store, "/tmp").await;
    let step = store
        .create_step(task_id, "pool", json!({"docker_pool": {"pool_size": 0}}))
        .await
        .unwrap();

    let report = engine(&store, &docker).run_step(step.id, false).await.unwrap();
    assert_eq!(report.status, StepStatus::Succeeded);
    assert!(docker.calls_for("container_run_detached").is_empty());
    let task = store.task(task_id).await.unwrap();
    assert_eq!(task.settings["containers_map"], json!({}));
}

#[tokio::test]
async fn contended_task_lock_fails_fast() {
    let store = Arc::new(MemoryStore::new());
    let docker = Arc::new(FakeDocker::new());
    let task_id = make_task(&store, "/tmp").await;
    assert!(store.try_lock_task(task_id).await.unwrap());

    let err = engine(&store, &docker).run_task(task_id).await.unwrap_err();
    assert!(matches!(err, task_sync::Error::TaskLocked { .. }));
}

#[tokio::test]
async fn golden_mode_restricts_rubric_shell_assignments() {
    let store = Arc::new(MemoryStore::new());
    let docker = Arc::new(FakeDocker::new());
    docker.set_container("c-golden", "app:1", true);
    docker.set_container("c-s1", "app:1", true);

    let task = store
        .create_task(
            "demo",
            "active",
            None,
            json!({"containers_map": {
                "golden": {"container_id": "g1", "container_name": "c-golden"},
                "solution_1": {"container_id": "s1", "container_name": "c-s1"}
            }}),
        )
        .await
        .unwrap();
    let step = store
        .create_step(
            task.id,
            "#1: crit",
            json!({"rubric_shell": {
                "command": "make check",
                "criterion_id": "u1",
                "counter": 1,
                "score": 3,
                "required": true
            }}),
        )
        .await
        .unwrap();

    let engine = Engine::new(store.clone(), docker.clone()).with_mode(RunMode::GoldenOnly);
    let report = engine.run_step(step.id, false).await.unwrap();
    assert_eq!(report.status, StepStatus::Succeeded);

    let execs = docker.calls_for("container_exec");
    assert_eq!(execs, vec!["container_exec c-golden make check"]);

    let row = store.step(step.id).await.unwrap();
    assert!(row.results["output"]["golden"].is_string());
    assert_eq!(row.results["grading"]["score"], 3);
}

#[tokio::test]
async fn forced_single_step_marks_rubric_shell_dependents_for_rerun() {
    let store = Arc::new(MemoryStore::new());
    let docker = Arc::new(FakeDocker::new());
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("Dockerfile"), "FROM scratch\n").unwrap();
    docker.set_image("app:1", "sha256:d1");
    docker.set_container("c1", "app:1", true);

    let task_id = make_task(&store, dir.path().to_str().unwrap()).await;
    let build = store
        .create_step(
            task_id,
            "build",
            json!({"docker_build": {"image_tag": "app:1", "files": {"Dockerfile": ""}}}),
        )
        .await
        .unwrap();
    let criterion = store
        .create_step(
            task_id,
            "#1: crit",
            json!({"rubric_shell": {
                "command": "make check",
                "container_name": "c1",
                "depends_on": [{"id": build.id}]
            }}),
        )
        .await
        .unwrap();

    let report = engine(&store, &docker)
        .run_step(build.id, true)
        .await
        .unwrap();
    assert_eq!(report.status, StepStatus::Succeeded);

    let row = store.step(criterion.id).await.unwrap();
    let settings = StepSettings::decode(&row.settings).unwrap();
    let StepConfig::RubricShell(cfg) = settings.config else {
        panic!("wrong variant");
    };
    assert!(cfg.rerun);
}
