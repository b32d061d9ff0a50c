//! Task DAG construction, validation and readiness queries

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use tracing::{info, instrument};

use crate::task::{Task, TaskId, TaskStatus};

/// A node in the task execution DAG
#[derive(Debug, Clone)]
pub struct TaskNode {
    /// The task and its run state
    pub task: Task,
    /// Tasks waiting on this one
    pub dependents: BTreeSet<TaskId>,
    /// Execution wave (tasks in the same wave have no dependency between them)
    pub wave: usize,
}

/// Directed acyclic graph of tasks to execute.
///
/// Tasks are registered with [`TaskDag::add`]; [`TaskDag::validate`] must
/// succeed before the graph is scheduled. Adding a task invalidates the
/// previous validation.
#[derive(Debug, Clone, Default)]
pub struct TaskDag {
    nodes: HashMap<TaskId, TaskNode>,
    /// Registration order, used to keep iteration deterministic
    insertion: Vec<TaskId>,
    /// Topologically sorted task order
    sorted_order: Vec<TaskId>,
    /// Tasks grouped by execution wave
    waves: Vec<Vec<TaskId>>,
    validated: bool,
}

impl TaskDag {
    /// Create an empty DAG
    pub fn new() -> Self {
        Self::default()
    }

    /// Build and validate a DAG from a set of tasks
    #[instrument(skip_all)]
    pub fn build(tasks: impl IntoIterator<Item = Task>) -> Result<Self, DagError> {
        let mut dag = Self::new();
        for task in tasks {
            dag.add(task)?;
        }
        dag.validate()?;
        Ok(dag)
    }

    /// Register a task
    pub fn add(&mut self, task: Task) -> Result<(), DagError> {
        if self.nodes.contains_key(&task.id) {
            return Err(DagError::DuplicateTask(task.id));
        }
        if task.dependencies.contains(&task.id) {
            return Err(DagError::SelfDependency(task.id));
        }

        self.insertion.push(task.id.clone());
        self.nodes.insert(
            task.id.clone(),
            TaskNode {
                task,
                dependents: BTreeSet::new(),
                wave: 0,
            },
        );
        self.validated = false;
        Ok(())
    }

    /// Check that every dependency exists and the graph has no cycle, then
    /// compute the topological order and execution waves.
    #[instrument(skip_all, fields(task_count = self.nodes.len()))]
    pub fn validate(&mut self) -> Result<(), DagError> {
        if self.validated {
            return Ok(());
        }

        for id in &self.insertion {
            let node = &self.nodes[id];
            for dep in &node.task.dependencies {
                if !self.nodes.contains_key(dep) {
                    return Err(DagError::UnknownDependency {
                        task: id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        // Build reverse dependency map (dependents)
        let edges: Vec<(TaskId, TaskId)> = self
            .nodes
            .values()
            .flat_map(|node| {
                node.task
                    .dependencies
                    .iter()
                    .map(move |dep| (dep.clone(), node.task.id.clone()))
            })
            .collect();
        for node in self.nodes.values_mut() {
            node.dependents.clear();
        }
        for (dep, dependent) in edges {
            if let Some(dep_node) = self.nodes.get_mut(&dep) {
                dep_node.dependents.insert(dependent);
            }
        }

        self.sorted_order = self.topological_sort()?;
        self.waves = self.compute_waves();
        for (wave_idx, wave_tasks) in self.waves.iter().enumerate() {
            for task_id in wave_tasks {
                if let Some(node) = self.nodes.get_mut(task_id) {
                    node.wave = wave_idx;
                }
            }
        }

        self.validated = true;
        info!(
            task_count = self.nodes.len(),
            wave_count = self.waves.len(),
            "task DAG validated"
        );
        Ok(())
    }

    /// Topological sort using Kahn's algorithm
    fn topological_sort(&self) -> Result<Vec<TaskId>, DagError> {
        let mut in_degree: HashMap<&TaskId, usize> = HashMap::new();
        let mut queue: VecDeque<&TaskId> = VecDeque::new();
        let mut sorted: Vec<TaskId> = Vec::with_capacity(self.nodes.len());

        for id in &self.insertion {
            let degree = self.nodes[id].task.dependencies.len();
            in_degree.insert(id, degree);
            if degree == 0 {
                queue.push_back(id);
            }
        }

        while let Some(id) = queue.pop_front() {
            sorted.push(id.clone());

            for dependent in &self.nodes[id].dependents {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 {
                        queue.push_back(dependent);
                    }
                }
            }
        }

        if sorted.len() != self.nodes.len() {
            let in_sorted: HashSet<&TaskId> = sorted.iter().collect();
            let mut cyclic: Vec<TaskId> = self
                .insertion
                .iter()
                .filter(|id| !in_sorted.contains(id))
                .cloned()
                .collect();
            cyclic.sort();
            return Err(DagError::CyclicDependency(cyclic));
        }

        Ok(sorted)
    }

    /// Compute execution waves (groups of tasks that can run in parallel)
    fn compute_waves(&self) -> Vec<Vec<TaskId>> {
        let mut wave_map: HashMap<&TaskId, usize> = HashMap::new();

        for id in &self.sorted_order {
            let wave = self.nodes[id]
                .task
                .dependencies
                .iter()
                .filter_map(|dep| wave_map.get(dep))
                .max()
                .map(|w| w + 1)
                .unwrap_or(0);
            wave_map.insert(id, wave);
        }

        let wave_count = wave_map.values().max().map(|w| w + 1).unwrap_or(0);
        let mut waves: Vec<Vec<TaskId>> = vec![Vec::new(); wave_count];
        for id in &self.sorted_order {
            if let Some(&wave) = wave_map.get(id) {
                waves[wave].push(id.clone());
            }
        }
        waves
    }

    pub fn is_validated(&self) -> bool {
        self.validated
    }

    /// Get a task
    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.nodes.get(id).map(|n| &n.task)
    }

    /// Get a task for mutation
    pub fn get_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        self.nodes.get_mut(id).map(|n| &mut n.task)
    }

    /// Get a DAG node (task plus graph metadata)
    pub fn node(&self, id: &TaskId) -> Option<&TaskNode> {
        self.nodes.get(id)
    }

    /// Iterate tasks in topological order (registration order before validation)
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        let order = if self.validated {
            &self.sorted_order
        } else {
            &self.insertion
        };
        order.iter().filter_map(|id| self.get(id))
    }

    /// Get the total number of tasks
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if the DAG is empty
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Get topologically sorted order
    pub fn sorted(&self) -> &[TaskId] {
        &self.sorted_order
    }

    /// Get execution waves
    pub fn waves(&self) -> &[Vec<TaskId>] {
        &self.waves
    }

    /// Pending tasks whose dependencies have all passed
    pub fn ready_set(&self) -> Vec<&Task> {
        self.tasks()
            .filter(|task| task.status == TaskStatus::Pending)
            .filter(|task| {
                task.dependencies
                    .iter()
                    .all(|dep| self.get(dep).is_some_and(Task::is_successful))
            })
            .collect()
    }

    /// Every task has settled
    pub fn is_exhausted(&self) -> bool {
        self.nodes.values().all(|n| n.task.status.is_terminal())
    }

    /// Number of tasks currently running
    pub fn running_count(&self) -> usize {
        self.nodes
            .values()
            .filter(|n| n.task.status == TaskStatus::Running)
            .count()
    }

    /// Nothing is ready, nothing is running, and work remains
    pub fn has_progress_stalled(&self) -> bool {
        self.ready_set().is_empty() && self.running_count() == 0 && !self.is_exhausted()
    }

    /// Tasks that are still waiting
    pub fn stuck_tasks(&self) -> Vec<TaskId> {
        self.tasks()
            .filter(|t| t.status == TaskStatus::Pending)
            .map(|t| t.id.clone())
            .collect()
    }

    /// Transitive dependents of a task, in topological order
    pub fn dependents_of(&self, id: &TaskId) -> Vec<TaskId> {
        let mut seen: HashSet<&TaskId> = HashSet::new();
        let mut queue: VecDeque<&TaskId> = VecDeque::new();
        queue.push_back(id);

        while let Some(current) = queue.pop_front() {
            if let Some(node) = self.nodes.get(current) {
                for dependent in &node.dependents {
                    if seen.insert(dependent) {
                        queue.push_back(dependent);
                    }
                }
            }
        }

        self.tasks()
            .map(|t| &t.id)
            .filter(|id| seen.contains(id))
            .cloned()
            .collect()
    }

    /// Get a human-readable summary of the execution plan
    pub fn execution_plan(&self) -> String {
        let mut plan = String::new();
        for (i, wave) in self.waves.iter().enumerate() {
            plan.push_str(&format!("Wave {} ({} tasks):\n", i, wave.len()));
            for id in wave {
                if let Some(task) = self.get(id) {
                    let cmd = task.runnable_command().unwrap_or("<no command>");
                    let deps: Vec<&str> = task.dependencies.iter().map(TaskId::as_str).collect();
                    if deps.is_empty() {
                        plan.push_str(&format!("  {} -> {}\n", id, cmd));
                    } else {
                        plan.push_str(&format!(
                            "  {} -> {} (after: {})\n",
                            id,
                            cmd,
                            deps.join(", ")
                        ));
                    }
                }
            }
        }
        plan
    }
}

/// Errors during DAG construction
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DagError {
    /// A task with the same id was already registered
    #[error("Duplicate task id '{0}'")]
    DuplicateTask(TaskId),

    /// Task lists itself as a dependency
    #[error("Task '{0}' depends on itself")]
    SelfDependency(TaskId),

    /// Dependency refers to a task that is not part of the run
    #[error("Task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: TaskId, dependency: TaskId },

    /// Cyclic dependency detected
    #[error("Cyclic dependency detected among tasks: {}", join_ids(.0))]
    CyclicDependency(Vec<TaskId>),
}

fn join_ids(ids: &[TaskId]) -> String {
    ids.iter().map(TaskId::as_str).collect::<Vec<_>>().join(", ")
}
