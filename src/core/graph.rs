use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use serde::Serialize;

use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::overlay::Overlay;
use crate::prompt::Confirm;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// A failing body halts the run for the current host.
    Fatal,
    /// A failing body is logged and the run moves on.
    Tolerant,
}

/// Everything a task body may touch. The overlay is read-only.
pub struct TaskContext<'a> {
    pub overlay: &'a Overlay,
    pub exec: &'a Executor<'a>,
    pub confirm: &'a dyn Confirm,
    pub host: &'a str,
}

pub type TaskBody = Box<dyn Fn(&TaskContext<'_>) -> Result<()>>;

pub struct Task {
    pub name: String,
    pub depends_on: Vec<String>,
    pub policy: FailurePolicy,
    body: TaskBody,
}

impl Task {
    pub fn run(&self, ctx: &TaskContext<'_>) -> Result<()> {
        (self.body)(ctx)
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("depends_on", &self.depends_on)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedTask {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    pub policy: FailurePolicy,
}

/// Named tasks plus the dependency edges between them.
#[derive(Debug)]
pub struct TaskGraph {
    name: String,
    tasks: Vec<Task>,
}

impl TaskGraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tasks: Vec::new(),
        }
    }

    /// Declare a task. Declaration order breaks ties in the execution order.
    /// Problems (duplicates, unknown dependencies, cycles) surface in `validate`.
    pub fn add_task<F>(
        &mut self,
        name: impl Into<String>,
        depends_on: &[&str],
        body: F,
        policy: FailurePolicy,
    ) -> &mut Self
    where
        F: Fn(&TaskContext<'_>) -> Result<()> + 'static,
    {
        self.tasks.push(Task {
            name: name.into(),
            depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
            policy,
            body: Box::new(body),
        });
        self
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        self.execution_order().map(|_| ())
    }

    /// Task indices in execution order.
    ///
    /// Kahn's algorithm over a min-heap of declaration indices: whenever several
    /// tasks are eligible, the earliest declared runs first.
    pub fn execution_order(&self) -> Result<Vec<usize>> {
        let mut index = HashMap::with_capacity(self.tasks.len());
        for (idx, task) in self.tasks.iter().enumerate() {
            if index.insert(task.name.as_str(), idx).is_some() {
                return Err(Error::duplicate_task_name(&self.name, &task.name));
            }
        }

        let mut indegree = vec![0usize; self.tasks.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.tasks.len()];

        for (idx, task) in self.tasks.iter().enumerate() {
            let mut seen: Vec<usize> = Vec::new();
            for dep in &task.depends_on {
                let Some(&parent) = index.get(dep.as_str()) else {
                    return Err(Error::unknown_dependency(&self.name, &task.name, dep));
                };
                if seen.contains(&parent) {
                    continue;
                }
                seen.push(parent);
                indegree[idx] += 1;
                dependents[parent].push(idx);
            }
        }

        let mut ready: BinaryHeap<Reverse<usize>> = indegree
            .iter()
            .enumerate()
            .filter(|(_, count)| **count == 0)
            .map(|(idx, _)| Reverse(idx))
            .collect();

        let mut ordered = Vec::with_capacity(self.tasks.len());
        while let Some(Reverse(idx)) = ready.pop() {
            ordered.push(idx);
            for &child in &dependents[idx] {
                indegree[child] -= 1;
                if indegree[child] == 0 {
                    ready.push(Reverse(child));
                }
            }
        }

        if ordered.len() != self.tasks.len() {
            let pending = self
                .tasks
                .iter()
                .enumerate()
                .filter(|(idx, _)| indegree[*idx] > 0)
                .map(|(_, task)| task.name.clone())
                .collect();
            return Err(Error::cyclic_dependency(&self.name, pending));
        }

        Ok(ordered)
    }

    /// Validated plan in execution order, without running anything.
    pub fn plan(&self) -> Result<Vec<PlannedTask>> {
        Ok(self
            .execution_order()?
            .into_iter()
            .map(|idx| {
                let task = &self.tasks[idx];
                PlannedTask {
                    name: task.name.clone(),
                    description: None,
                    depends_on: task.depends_on.clone(),
                    policy: task.policy,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    fn noop(_: &TaskContext<'_>) -> Result<()> {
        Ok(())
    }

    fn names(graph: &TaskGraph) -> Vec<String> {
        graph
            .plan()
            .unwrap()
            .into_iter()
            .map(|task| task.name)
            .collect()
    }

    #[test]
    fn siblings_follow_declaration_order() {
        let mut graph = TaskGraph::new("test");
        graph
            .add_task("A", &[], noop, FailurePolicy::Fatal)
            .add_task("B", &["A"], noop, FailurePolicy::Fatal)
            .add_task("C", &["A"], noop, FailurePolicy::Fatal);
        assert_eq!(names(&graph), vec!["A", "B", "C"]);

        let mut graph = TaskGraph::new("test");
        graph
            .add_task("A", &[], noop, FailurePolicy::Fatal)
            .add_task("C", &["A"], noop, FailurePolicy::Fatal)
            .add_task("B", &["A"], noop, FailurePolicy::Fatal);
        assert_eq!(names(&graph), vec!["A", "C", "B"]);
    }

    #[test]
    fn newly_eligible_task_runs_before_later_declared_root() {
        let mut graph = TaskGraph::new("test");
        graph
            .add_task("A", &[], noop, FailurePolicy::Fatal)
            .add_task("B", &["A"], noop, FailurePolicy::Fatal)
            .add_task("C", &[], noop, FailurePolicy::Fatal);
        assert_eq!(names(&graph), vec!["A", "B", "C"]);
    }

    #[test]
    fn dependency_declared_later_still_runs_first() {
        let mut graph = TaskGraph::new("test");
        graph
            .add_task("deploy", &["build"], noop, FailurePolicy::Fatal)
            .add_task("build", &[], noop, FailurePolicy::Fatal);
        assert_eq!(names(&graph), vec!["build", "deploy"]);
    }

    #[test]
    fn shared_dependency_appears_once() {
        let mut graph = TaskGraph::new("test");
        graph
            .add_task("pull", &[], noop, FailurePolicy::Fatal)
            .add_task("migrate", &["pull", "pull"], noop, FailurePolicy::Fatal)
            .add_task("collectstatic", &["pull"], noop, FailurePolicy::Tolerant)
            .add_task("restart", &["migrate", "collectstatic"], noop, FailurePolicy::Fatal);
        assert_eq!(
            names(&graph),
            vec!["pull", "migrate", "collectstatic", "restart"]
        );
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut graph = TaskGraph::new("test");
        graph
            .add_task("pull", &[], noop, FailurePolicy::Fatal)
            .add_task("pull", &[], noop, FailurePolicy::Fatal);
        let err = graph.validate().unwrap_err();
        assert_eq!(err.code, ErrorCode::GraphDuplicateTask);
    }

    #[test]
    fn cycles_are_rejected_with_pending_tasks() {
        let mut graph = TaskGraph::new("test");
        graph
            .add_task("root", &[], noop, FailurePolicy::Fatal)
            .add_task("a", &["c"], noop, FailurePolicy::Fatal)
            .add_task("b", &["a"], noop, FailurePolicy::Fatal)
            .add_task("c", &["b"], noop, FailurePolicy::Fatal);
        let err = graph.validate().unwrap_err();
        assert_eq!(err.code, ErrorCode::GraphCyclicDependency);
        assert_eq!(err.details["tasks"], serde_json::json!(["a", "b", "c"]));
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let mut graph = TaskGraph::new("test");
        graph.add_task("loop", &["loop"], noop, FailurePolicy::Fatal);
        assert_eq!(
            graph.validate().unwrap_err().code,
            ErrorCode::GraphCyclicDependency
        );
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let mut graph = TaskGraph::new("test");
        graph.add_task("migrate", &["pull"], noop, FailurePolicy::Fatal);
        assert_eq!(
            graph.validate().unwrap_err().code,
            ErrorCode::GraphUnknownDependency
        );
    }

    #[test]
    fn empty_graph_is_valid() {
        let graph = TaskGraph::new("empty");
        assert!(graph.is_empty());
        assert!(graph.validate().is_ok());
    }
}
