//! Task plans: a flat task list with declared dependencies, validated to
//! form a DAG before anything is scheduled.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::bus::Priority;
use crate::error::{ConvoyError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    /// Routed to the handler registered for this category.
    pub category: String,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    #[serde(default)]
    pub priority: Priority,
    /// Relative effort estimate, informational only.
    #[serde(default)]
    pub complexity: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Task {
    pub fn new(id: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            category: category.into(),
            dependencies: BTreeSet::new(),
            priority: Priority::Normal,
            complexity: 1,
            phase: None,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_dependency(mut self, dep: impl Into<String>) -> Self {
        self.dependencies.insert(dep.into());
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_complexity(mut self, complexity: u8) -> Self {
        self.complexity = complexity;
        self
    }

    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Some(phase.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// A validated task set. Construction fails on duplicate ids, unknown
/// dependency ids, or cycles — in which case zero tasks are scheduled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPlan {
    id: String,
    tasks: Vec<Task>,
}

impl TaskPlan {
    pub fn new(id: impl Into<String>, tasks: Vec<Task>) -> Result<Self> {
        let id = id.into();

        let mut seen = HashSet::new();
        for task in &tasks {
            if !seen.insert(task.id.as_str()) {
                return Err(ConvoyError::PlanValidation(format!(
                    "Duplicate task id: {}",
                    task.id
                )));
            }
        }

        for task in &tasks {
            for dep in &task.dependencies {
                if !seen.contains(dep.as_str()) {
                    return Err(ConvoyError::PlanValidation(format!(
                        "Task '{}' depends on unknown task '{}'",
                        task.id, dep
                    )));
                }
            }
        }

        if let Some(cycle) = find_cycle(&tasks) {
            return Err(ConvoyError::CyclicDependency { cycle });
        }

        Ok(Self { id, tasks })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn get(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Tasks whose dependencies are all in `completed` and which are not in
    /// `excluded` (started, skipped, or settled). This is the dynamically
    /// recomputed execution group, not a static layering.
    pub fn ready_tasks<'a>(
        &'a self,
        completed: &HashSet<String>,
        excluded: &HashSet<String>,
    ) -> Vec<&'a Task> {
        let mut ready: Vec<&Task> = self
            .tasks
            .iter()
            .filter(|t| !excluded.contains(&t.id))
            .filter(|t| t.dependencies.iter().all(|d| completed.contains(d)))
            .collect();
        ready.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.id.cmp(&b.id)));
        ready
    }
}

/// Kahn's algorithm; when nodes remain, a DFS names one offending cycle.
fn find_cycle(tasks: &[Task]) -> Option<Vec<String>> {
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for task in tasks {
        in_degree.entry(task.id.as_str()).or_insert(0);
        for dep in &task.dependencies {
            *in_degree.entry(task.id.as_str()).or_insert(0) += 1;
            dependents.entry(dep.as_str()).or_default().push(&task.id);
        }
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut resolved = 0usize;

    while let Some(id) = queue.pop_front() {
        resolved += 1;
        if let Some(deps) = dependents.get(id) {
            for dependent in deps {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(dependent);
                    }
                }
            }
        }
    }

    if resolved == tasks.len() {
        return None;
    }

    // Some tasks never reached in-degree zero; walk dependency edges among
    // them until an id repeats to report one concrete cycle.
    let unresolved: HashSet<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d > 0)
        .map(|(id, _)| *id)
        .collect();
    let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();

    let start = *unresolved.iter().min()?;
    let mut path: Vec<&str> = vec![start];
    let mut seen: HashMap<&str, usize> = HashMap::from([(start, 0)]);
    let mut current = start;

    loop {
        let task = by_id.get(current)?;
        let next = task
            .dependencies
            .iter()
            .map(String::as_str)
            .find(|d| unresolved.contains(d))?;

        if let Some(&pos) = seen.get(next) {
            let mut cycle: Vec<String> = path[pos..].iter().map(|s| s.to_string()).collect();
            cycle.push(next.to_string());
            return Some(cycle);
        }

        seen.insert(next, path.len());
        path.push(next);
        current = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_plan() {
        let plan = TaskPlan::new(
            "p1",
            vec![
                Task::new("a", "build"),
                Task::new("b", "test").with_dependency("a"),
                Task::new("c", "test").with_dependency("a"),
            ],
        )
        .unwrap();
        assert_eq!(plan.len(), 3);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let err = TaskPlan::new("p1", vec![Task::new("a", "x"), Task::new("a", "y")]).unwrap_err();
        assert!(matches!(err, ConvoyError::PlanValidation(_)));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let err = TaskPlan::new("p1", vec![Task::new("a", "x").with_dependency("ghost")])
            .unwrap_err();
        assert!(matches!(err, ConvoyError::PlanValidation(_)));
    }

    #[test]
    fn test_two_node_cycle_detected() {
        let err = TaskPlan::new(
            "p1",
            vec![
                Task::new("a", "x").with_dependency("b"),
                Task::new("b", "x").with_dependency("a"),
            ],
        )
        .unwrap_err();
        match err {
            ConvoyError::CyclicDependency { cycle } => {
                assert!(cycle.contains(&"a".to_string()));
                assert!(cycle.contains(&"b".to_string()));
            }
            other => panic!("expected cycle error, got {:?}", other),
        }
    }

    #[test]
    fn test_self_cycle_detected() {
        let err =
            TaskPlan::new("p1", vec![Task::new("a", "x").with_dependency("a")]).unwrap_err();
        assert!(matches!(err, ConvoyError::CyclicDependency { .. }));
    }

    #[test]
    fn test_cycle_behind_valid_prefix_detected() {
        let err = TaskPlan::new(
            "p1",
            vec![
                Task::new("root", "x"),
                Task::new("a", "x").with_dependencies(["root", "c"]),
                Task::new("b", "x").with_dependency("a"),
                Task::new("c", "x").with_dependency("b"),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, ConvoyError::CyclicDependency { .. }));
    }

    #[test]
    fn test_ready_tasks_recomputed_dynamically() {
        let plan = TaskPlan::new(
            "p1",
            vec![
                Task::new("a", "x"),
                Task::new("b", "x").with_dependency("a"),
                Task::new("c", "x").with_dependency("a"),
                Task::new("d", "x").with_dependencies(["b", "c"]),
            ],
        )
        .unwrap();

        let mut completed = HashSet::new();
        let mut excluded = HashSet::new();

        let ready: Vec<_> = plan
            .ready_tasks(&completed, &excluded)
            .iter()
            .map(|t| t.id.clone())
            .collect();
        assert_eq!(ready, ["a"]);

        completed.insert("a".to_string());
        excluded.insert("a".to_string());
        let ready: Vec<_> = plan
            .ready_tasks(&completed, &excluded)
            .iter()
            .map(|t| t.id.clone())
            .collect();
        assert_eq!(ready, ["b", "c"]);
    }

    #[test]
    fn test_ready_tasks_ordered_by_priority() {
        let plan = TaskPlan::new(
            "p1",
            vec![
                Task::new("slow", "x").with_priority(Priority::Low),
                Task::new("urgent", "x").with_priority(Priority::Critical),
            ],
        )
        .unwrap();

        let ready: Vec<_> = plan
            .ready_tasks(&HashSet::new(), &HashSet::new())
            .iter()
            .map(|t| t.id.clone())
            .collect();
        assert_eq!(ready, ["urgent", "slow"]);
    }
}
