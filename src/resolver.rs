//! Dependency resolution.
//!
//! Dependency edges live inside step settings in two accepted placements: a
//! top-level `depends_on` array, and a `depends_on` nested inside any
//! top-level value. Extraction reads both and unions the results, staying
//! deliberately tolerant of settings that fail full typed decoding — the
//! resolver's job is edges, not validation.
//!
//! For whole-task execution the edges become a DAG; ordering is
//! deterministic (Kahn's algorithm, ties broken by ascending step id) and a
//! cycle is a fatal error surfaced before any handler runs. The box-drawing
//! tree renderer used by `step tree` lives here because its semantics are
//! exactly these edges.

use crate::config::TYPE_KEYS;
use crate::error::{Error, Result};
use crate::store::StepRow;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap, HashSet};

fn ids_from_depends_on(value: &Value) -> Vec<i64> {
    value
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|entry| entry.get("id").and_then(Value::as_i64))
                .collect()
        })
        .unwrap_or_default()
}

/// Extract the set of step ids a settings document depends on.
///
/// Both the top-level `depends_on` and one nested inside any top-level
/// value are honoured; the union is returned ascending and deduplicated.
#[must_use]
pub fn step_dependencies(settings: &Value) -> Vec<i64> {
    let Some(obj) = settings.as_object() else {
        return Vec::new();
    };
    let mut ids = BTreeSet::new();
    if let Some(top) = obj.get("depends_on") {
        ids.extend(ids_from_depends_on(top));
    }
    for (key, value) in obj {
        if key == "depends_on" {
            continue;
        }
        if let Some(nested) = value.get("depends_on") {
            ids.extend(ids_from_depends_on(nested));
        }
    }
    ids.into_iter().collect()
}

/// A task's dependency DAG over its steps
#[derive(Debug)]
pub struct StepDag {
    /// Step id → ids it depends on (restricted to steps in the DAG)
    pub deps: HashMap<i64, Vec<i64>>,
    /// Step id → ids that depend on it
    pub dependents: HashMap<i64, Vec<i64>>,
    order: Vec<i64>,
}

impl StepDag {
    /// Build the DAG for a set of sibling steps and compute the execution
    /// order.
    ///
    /// Edges referencing ids outside the set are dropped (dependency
    /// fencing against their results still happens at execution time).
    ///
    /// # Errors
    /// Returns [`Error::DependencyCycle`] when the steps cannot be ordered.
    pub fn build(steps: &[StepRow]) -> Result<Self> {
        let known: HashSet<i64> = steps.iter().map(|s| s.id).collect();
        let mut deps: HashMap<i64, Vec<i64>> = HashMap::new();
        let mut dependents: HashMap<i64, Vec<i64>> = HashMap::new();
        for step in steps {
            let step_deps: Vec<i64> = step_dependencies(&step.settings)
                .into_iter()
                .filter(|id| known.contains(id) && *id != step.id)
                .collect();
            for dep in &step_deps {
                dependents.entry(*dep).or_default().push(step.id);
            }
            deps.insert(step.id, step_deps);
        }
        for list in dependents.values_mut() {
            list.sort_unstable();
        }

        let order = topo_order(&known, &deps)?;
        Ok(Self {
            deps,
            dependents,
            order,
        })
    }

    /// Deterministic topological order, ascending step id among ready nodes
    #[must_use]
    pub fn order(&self) -> &[i64] {
        &self.order
    }

    /// Direct dependents of a step, ascending
    #[must_use]
    pub fn dependents_of(&self, id: i64) -> &[i64] {
        self.dependents.get(&id).map_or(&[], Vec::as_slice)
    }
}

fn topo_order(known: &HashSet<i64>, deps: &HashMap<i64, Vec<i64>>) -> Result<Vec<i64>> {
    let mut remaining: HashMap<i64, usize> = known
        .iter()
        .map(|id| (*id, deps.get(id).map_or(0, Vec::len)))
        .collect();
    let mut dependents: HashMap<i64, Vec<i64>> = HashMap::new();
    for (id, dep_list) in deps {
        for dep in dep_list {
            dependents.entry(*dep).or_default().push(*id);
        }
    }

    // Min-heap on step id for the deterministic tie-break
    let mut ready: BinaryHeap<std::cmp::Reverse<i64>> = remaining
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(id, _)| std::cmp::Reverse(*id))
        .collect();

    let mut order = Vec::with_capacity(remaining.len());
    while let Some(std::cmp::Reverse(id)) = ready.pop() {
        order.push(id);
        if let Some(next) = dependents.get(&id) {
            for dependent in next {
                if let Some(count) = remaining.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push(std::cmp::Reverse(*dependent));
                    }
                }
            }
        }
    }

    if order.len() != remaining.len() {
        let ordered: HashSet<i64> = order.iter().copied().collect();
        let stuck: Vec<i64> = {
            let mut s: Vec<i64> = remaining
                .keys()
                .filter(|id| !ordered.contains(id))
                .copied()
                .collect();
            s.sort_unstable();
            s
        };
        return Err(Error::DependencyCycle {
            cycle: render_cycle(&stuck, deps),
        });
    }
    Ok(order)
}

/// Walk the unresolved nodes until one repeats, producing `a -> b -> a`
fn render_cycle(stuck: &[i64], deps: &HashMap<i64, Vec<i64>>) -> String {
    let stuck_set: HashSet<i64> = stuck.iter().copied().collect();
    let Some(start) = stuck.first().copied() else {
        return String::new();
    };
    let mut path = vec![start];
    let mut seen = HashSet::from([start]);
    let mut current = start;
    loop {
        let Some(next) = deps
            .get(&current)
            .and_then(|d| d.iter().find(|id| stuck_set.contains(id)))
            .copied()
        else {
            break;
        };
        path.push(next);
        if !seen.insert(next) {
            break;
        }
        current = next;
    }
    path.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn step_type_key(settings: &Value) -> &str {
    settings
        .as_object()
        .and_then(|obj| TYPE_KEYS.iter().find(|k| obj.contains_key(**k)))
        .copied()
        .unwrap_or("?")
}

/// Render a task's dependency tree with box-drawing connectors.
///
/// Children are sorted by id; a step with several parents appears once per
/// parent, which keeps the rendering a faithful view of the edges.
#[must_use]
pub fn render_tree(task_id: i64, task_name: &str, steps: &[StepRow]) -> String {
    let by_id: BTreeMap<i64, &StepRow> = steps.iter().map(|s| (s.id, s)).collect();
    let mut children: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
    let mut has_parent: HashSet<i64> = HashSet::new();
    for step in steps {
        for dep in step_dependencies(&step.settings) {
            if by_id.contains_key(&dep) && dep != step.id {
                children.entry(dep).or_default().push(step.id);
                has_parent.insert(step.id);
            }
        }
    }
    for list in children.values_mut() {
        list.sort_unstable();
        list.dedup();
    }

    let mut out = format!("Task {task_id}: {task_name}\n");
    let roots: Vec<i64> = steps
        .iter()
        .map(|s| s.id)
        .filter(|id| !has_parent.contains(id))
        .collect();
    for (i, root) in roots.iter().enumerate() {
        render_node(&mut out, *root, &by_id, &children, "", i + 1 == roots.len());
    }
    out
}

fn render_node(
    out: &mut String,
    id: i64,
    by_id: &BTreeMap<i64, &StepRow>,
    children: &BTreeMap<i64, Vec<i64>>,
    prefix: &str,
    last: bool,
) {
    let connector = if last { "└── " } else { "├── " };
    let (title, kind) = by_id
        .get(&id)
        .map_or(("?", "?"), |s| (s.title.as_str(), step_type_key(&s.settings)));
    out.push_str(&format!("{prefix}{connector}[{id}] {title} ({kind})\n"));
    let child_prefix = format!("{prefix}{}", if last { "    " } else { "│   " });
    if let Some(kids) = children.get(&id) {
        for (i, kid) in kids.iter().enumerate() {
            render_node(out, *kid, by_id, children, &child_prefix, i + 1 == kids.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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
    fn test_step_dependencies_union() {
        let settings = json!({
            "docker_shell": {"depends_on": [{"id": 4}, {"id": 2}]},
            "depends_on": [{"id": 2}, {"id": 7}]
        });
        assert_eq!(step_dependencies(&settings), vec![2, 4, 7]);
    }

    #[test]
    fn test_step_dependencies_empty() {
        assert!(step_dependencies(&json!({"file_exists": {}})).is_empty());
        assert!(step_dependencies(&json!(null)).is_empty());
    }

    #[test]
    fn test_order_respects_dependencies_and_ids() {
        let steps = vec![
            step(3, json!({"docker_shell": {"depends_on": [{"id": 2}]}})),
            step(1, json!({"docker_build": {}})),
            step(2, json!({"docker_run": {"depends_on": [{"id": 1}]}})),
            step(5, json!({"file_exists": {}})),
        ];
        let dag = StepDag::build(&steps).unwrap();
        // 1 and 5 are both ready; ascending id wins the tie-break
        assert_eq!(dag.order(), &[1, 2, 3, 5]);
    }

    #[test]
    fn test_cycle_is_fatal() {
        let steps = vec![
            step(1, json!({"docker_build": {"depends_on": [{"id": 3}]}})),
            step(2, json!({"docker_run": {"depends_on": [{"id": 1}]}})),
            step(3, json!({"docker_shell": {"depends_on": [{"id": 2}]}})),
        ];
        let err = StepDag::build(&steps).unwrap_err();
        assert!(err.is_fatal());
        match err {
            Error::DependencyCycle { cycle } => {
                assert!(cycle.contains("->"), "cycle rendering: {cycle}");
            }
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn test_unknown_edges_are_dropped_from_ordering() {
        let steps = vec![step(9, json!({"docker_run": {"depends_on": [{"id": 404}]}}))];
        let dag = StepDag::build(&steps).unwrap();
        assert_eq!(dag.order(), &[9]);
    }

    #[test]
    fn test_dependents_of() {
        let steps = vec![
            step(1, json!({"docker_build": {}})),
            step(2, json!({"docker_run": {"depends_on": [{"id": 1}]}})),
            step(3, json!({"docker_rubrics": {"depends_on": [{"id": 1}]}})),
        ];
        let dag = StepDag::build(&steps).unwrap();
        assert_eq!(dag.dependents_of(1), &[2, 3]);
        assert!(dag.dependents_of(2).is_empty());
    }

    #[test]
    fn test_render_tree_connectors() {
        let steps = vec![
            step(1, json!({"docker_build": {}})),
            step(2, json!({"docker_run": {"depends_on": [{"id": 1}]}})),
            step(3, json!({"docker_shell": {"depends_on": [{"id": 2}]}})),
            step(4, json!({"file_exists": {}})),
        ];
        let tree = render_tree(1, "demo", &steps);
        assert!(tree.starts_with("Task 1: demo\n"));
        assert!(tree.contains("├── [1] step-1 (docker_build)"));
        assert!(tree.contains("│   └── [2] step-2 (docker_run)"));
        assert!(tree.contains("    └── [3] step-3 (docker_shell)"));
        assert!(tree.contains("└── [4] step-4 (file_exists)"));
    }
}
