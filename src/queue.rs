//! Durable task queue with priorities, dependencies and a status state machine.
//!
//! Tasks move `pending -> in_progress -> completed | failed` and never back.
//! A task is only handed out once every task it depends on has completed.
//! Dependency cycles are rejected at enqueue time, so the graph stays acyclic.

use crate::events::{EventBus, OrchestratorEvent};
use crate::persistence::RecordStore;
use crate::types::{lock, CognitivePattern, Complexity, OrchestratorError, Result, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(OrchestratorError::InvalidSubmission(format!(
                "unknown task status '{}'",
                other
            ))),
        }
    }
}

/// A unit of work tracked by the queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: TaskId,

    /// Higher values are serviced first
    pub priority: i64,

    pub status: TaskStatus,

    #[serde(default)]
    pub complexity: Complexity,

    /// Names of the agents working the task (not owned)
    #[serde(default)]
    pub assigned_agents: Vec<String>,

    pub description: String,

    #[serde(default)]
    pub requirements: BTreeSet<String>,

    #[serde(default)]
    pub dependencies: BTreeSet<TaskId>,

    pub created_at: DateTime<Utc>,

    pub started_at: Option<DateTime<Utc>>,

    pub completed_at: Option<DateTime<Utc>>,

    pub result: Option<serde_json::Value>,

    pub pattern_used: Option<CognitivePattern>,

    #[serde(default)]
    pub insights: Vec<String>,

    pub metrics: Option<serde_json::Value>,

    /// Failure reason, set only for failed tasks
    pub error: Option<String>,
}

impl Task {
    pub fn new(
        id: TaskId,
        description: impl Into<String>,
        priority: i64,
        complexity: Complexity,
    ) -> Self {
        Self {
            id,
            priority,
            status: TaskStatus::Pending,
            complexity,
            assigned_agents: Vec::new(),
            description: description.into(),
            requirements: BTreeSet::new(),
            dependencies: BTreeSet::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            pattern_used: None,
            insights: Vec::new(),
            metrics: None,
            error: None,
        }
    }
}

/// Caller-supplied fields of a task about to be enqueued.
#[derive(Debug, Clone)]
pub struct TaskDraft {
    /// Id from [`TaskQueue::reserve_id`]; assigned on enqueue when absent. Ids the
    /// queue did not hand out are rejected.
    pub id: Option<TaskId>,
    pub description: String,
    pub priority: i64,
    pub complexity: Complexity,
    pub requirements: BTreeSet<String>,
    pub dependencies: BTreeSet<TaskId>,
    pub assigned_agents: Vec<String>,
    pub pattern: Option<CognitivePattern>,
}

impl TaskDraft {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            id: None,
            description: description.into(),
            priority: 0,
            complexity: Complexity::default(),
            requirements: BTreeSet::new(),
            dependencies: BTreeSet::new(),
            assigned_agents: Vec::new(),
            pattern: None,
        }
    }

    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.complexity = complexity;
        self
    }

    pub fn with_requirements<I, S>(mut self, requirements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requirements = requirements.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_dependencies(mut self, dependencies: impl IntoIterator<Item = TaskId>) -> Self {
        self.dependencies = dependencies.into_iter().collect();
        self
    }

    pub fn with_agents(mut self, agents: Vec<String>) -> Self {
        self.assigned_agents = agents;
        self
    }

    pub fn with_pattern(mut self, pattern: CognitivePattern) -> Self {
        self.pattern = Some(pattern);
        self
    }
}

/// Data stored on a task when it reaches a terminal state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskOutcome {
    pub result: Option<serde_json::Value>,
    pub insights: Vec<String>,
    pub metrics: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl TaskOutcome {
    pub fn success(result: serde_json::Value) -> Self {
        Self {
            result: Some(result),
            ..Self::default()
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            error: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn with_insights(mut self, insights: Vec<String>) -> Self {
        self.insights = insights;
        self
    }

    pub fn with_metrics(mut self, metrics: serde_json::Value) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

pub struct TaskQueue {
    tasks: Mutex<BTreeMap<TaskId, Task>>,
    next_id: AtomicU64,
    /// Handed out by `reserve_id` and not yet enqueued
    reserved: Mutex<BTreeSet<TaskId>>,
    ready: Arc<Notify>,
    backend: Arc<dyn RecordStore>,
    events: EventBus,
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("next_id", &self.next_id.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

fn dependencies_completed(tasks: &BTreeMap<TaskId, Task>, task: &Task) -> bool {
    task.dependencies.iter().all(|dep| {
        tasks
            .get(dep)
            .is_some_and(|dep| dep.status == TaskStatus::Completed)
    })
}

/// Depth-first search for a cycle among `batch`. Existing tasks cannot depend
/// on batch members, so only edges inside the batch are followed.
fn find_cycle(batch: &BTreeMap<TaskId, BTreeSet<TaskId>>) -> Option<Vec<TaskId>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit(
        node: TaskId,
        batch: &BTreeMap<TaskId, BTreeSet<TaskId>>,
        marks: &mut HashMap<TaskId, Mark>,
        path: &mut Vec<TaskId>,
    ) -> Option<Vec<TaskId>> {
        match marks.get(&node) {
            Some(Mark::Done) => return None,
            Some(Mark::Visiting) => {
                let start = path.iter().position(|id| *id == node).unwrap_or(0);
                let mut cycle = path[start..].to_vec();
                cycle.push(node);
                return Some(cycle);
            }
            None => {}
        }

        marks.insert(node, Mark::Visiting);
        path.push(node);
        if let Some(deps) = batch.get(&node) {
            for dep in deps.iter().filter(|dep| batch.contains_key(dep)) {
                if let Some(cycle) = visit(*dep, batch, marks, path) {
                    return Some(cycle);
                }
            }
        }
        path.pop();
        marks.insert(node, Mark::Done);
        None
    }

    let mut marks = HashMap::new();
    let mut path = Vec::new();
    batch
        .keys()
        .find_map(|node| visit(*node, batch, &mut marks, &mut path))
}

impl TaskQueue {
    /// Open the queue over `backend`, reloading any stored tasks.
    pub fn open(backend: Arc<dyn RecordStore>, events: EventBus) -> Result<Self> {
        let tasks: BTreeMap<_, _> = backend
            .load_tasks()?
            .into_iter()
            .map(|task| (task.id, task))
            .collect();
        let next_id = tasks
            .keys()
            .next_back()
            .map_or(1, |id| id.saturating_add(1));

        let orphaned = tasks
            .values()
            .filter(|task| task.status == TaskStatus::InProgress)
            .count();
        if orphaned > 0 {
            warn!(
                "{} tasks were in progress when the queue was last closed",
                orphaned
            );
        }
        debug!("Loaded {} tasks from storage", tasks.len());

        Ok(Self {
            tasks: Mutex::new(tasks),
            next_id: AtomicU64::new(next_id),
            reserved: Mutex::new(BTreeSet::new()),
            ready: Arc::new(Notify::new()),
            backend,
            events,
        })
    }

    /// Reserve a fresh task id, so callers can wire dependencies between
    /// drafts of the same batch.
    pub fn reserve_id(&self) -> Result<TaskId> {
        let id = self.allocate_id()?;
        lock(&self.reserved).insert(id);
        Ok(id)
    }

    fn allocate_id(&self) -> Result<TaskId> {
        self.next_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |id| id.checked_add(1))
            .map_err(|_| OrchestratorError::Internal(anyhow::anyhow!("task id space exhausted")))
    }

    pub fn enqueue(&self, draft: TaskDraft) -> Result<Task> {
        let mut tasks = self.enqueue_all(vec![draft])?;
        tasks
            .pop()
            .ok_or_else(|| OrchestratorError::Internal(anyhow::anyhow!("empty enqueue batch")))
    }

    /// Enqueue a batch atomically. Dependencies may point at stored tasks or
    /// at other drafts of the batch. On any error nothing is stored.
    pub fn enqueue_all(&self, drafts: Vec<TaskDraft>) -> Result<Vec<Task>> {
        if drafts.is_empty() {
            return Ok(Vec::new());
        }
        let mut tasks = lock(&self.tasks);
        let batch = self.validate_batch(&tasks, drafts)?;

        self.backend.insert_tasks(&batch)?;
        let mut reserved = lock(&self.reserved);
        for task in &batch {
            reserved.remove(&task.id);
            tasks.insert(task.id, task.clone());
        }
        drop(reserved);
        drop(tasks);

        for task in &batch {
            info!(
                "Enqueued task {} (priority {}, {} dependencies)",
                task.id,
                task.priority,
                task.dependencies.len()
            );
            self.events.emit(OrchestratorEvent::TaskEnqueued {
                task_id: task.id,
                priority: task.priority,
            });
        }
        self.ready.notify_waiters();
        Ok(batch)
    }

    /// Enqueue a dependency-free task and claim it for the caller in one step,
    /// so no concurrent consumer can dequeue it first.
    pub fn enqueue_claimed(&self, draft: TaskDraft) -> Result<Task> {
        let mut tasks = lock(&self.tasks);
        let mut batch = self.validate_batch(&tasks, vec![draft])?;
        let Some(pending) = batch.pop() else {
            return Err(OrchestratorError::Internal(anyhow::anyhow!(
                "empty enqueue batch"
            )));
        };
        if !dependencies_completed(&tasks, &pending) {
            return Err(OrchestratorError::InvalidTransition {
                task: pending.id,
                from: TaskStatus::Pending.to_string(),
                to: format!("{} (dependencies incomplete)", TaskStatus::InProgress),
            });
        }

        let mut claimed = pending.clone();
        claimed.status = TaskStatus::InProgress;
        claimed.started_at = Some(Utc::now());
        self.backend.insert_tasks(std::slice::from_ref(&claimed))?;
        lock(&self.reserved).remove(&claimed.id);
        tasks.insert(claimed.id, claimed.clone());
        drop(tasks);

        self.events.emit(OrchestratorEvent::TaskEnqueued {
            task_id: claimed.id,
            priority: claimed.priority,
        });
        self.events.emit(OrchestratorEvent::TaskTransitioned {
            task_id: claimed.id,
            from: TaskStatus::Pending,
            to: TaskStatus::InProgress,
        });
        info!("Enqueued and claimed task {}", claimed.id);
        Ok(claimed)
    }

    fn validate_batch(
        &self,
        tasks: &BTreeMap<TaskId, Task>,
        drafts: Vec<TaskDraft>,
    ) -> Result<Vec<Task>> {
        let mut graph: BTreeMap<TaskId, BTreeSet<TaskId>> = BTreeMap::new();
        let mut ids = Vec::with_capacity(drafts.len());
        let reserved = lock(&self.reserved);
        for draft in &drafts {
            let id = match draft.id {
                Some(id) if tasks.contains_key(&id) || graph.contains_key(&id) => {
                    return Err(OrchestratorError::DuplicateTask(id));
                }
                Some(id) if !reserved.contains(&id) => {
                    return Err(OrchestratorError::InvalidSubmission(format!(
                        "task id {} was not reserved",
                        id
                    )));
                }
                Some(id) => id,
                None => self.allocate_id()?,
            };
            graph.insert(id, draft.dependencies.clone());
            ids.push(id);
        }
        drop(reserved);

        for (id, deps) in &graph {
            if let Some(missing) = deps
                .iter()
                .find(|dep| !tasks.contains_key(dep) && !graph.contains_key(dep))
            {
                return Err(OrchestratorError::UnresolvedDependency {
                    task: *id,
                    missing: *missing,
                });
            }
        }

        if let Some(cycle) = find_cycle(&graph) {
            return Err(OrchestratorError::CyclicDependency(cycle));
        }

        Ok(drafts
            .into_iter()
            .zip(ids)
            .map(|(draft, id)| {
                let mut task = Task::new(id, draft.description, draft.priority, draft.complexity);
                task.requirements = draft.requirements;
                task.dependencies = draft.dependencies;
                task.assigned_agents = draft.assigned_agents;
                task.pattern_used = draft.pattern;
                task
            })
            .collect())
    }

    /// Hand out the next eligible task and mark it in progress.
    ///
    /// Eligible tasks are pending with every dependency completed. The highest
    /// priority wins, then the earliest `created_at`, then the lowest id.
    pub fn dequeue_next(&self) -> Result<Option<Task>> {
        let mut tasks = lock(&self.tasks);
        let next = tasks
            .values()
            .filter(|task| task.status == TaskStatus::Pending)
            .filter(|task| dependencies_completed(&tasks, task))
            .max_by_key(|task| (task.priority, Reverse(task.created_at), Reverse(task.id)))
            .cloned();

        let Some(mut task) = next else {
            return Ok(None);
        };
        task.status = TaskStatus::InProgress;
        task.started_at = Some(Utc::now());
        self.backend.upsert_task(&task)?;
        tasks.insert(task.id, task.clone());
        drop(tasks);

        debug!("Dequeued task {}", task.id);
        self.events
            .emit(OrchestratorEvent::TaskDequeued { task_id: task.id });
        self.events.emit(OrchestratorEvent::TaskTransitioned {
            task_id: task.id,
            from: TaskStatus::Pending,
            to: TaskStatus::InProgress,
        });
        Ok(Some(task))
    }

    /// Move a task along the state machine.
    ///
    /// Allowed: pending to in_progress (dependencies completed), and
    /// in_progress to completed or failed. Terminal transitions store the
    /// outcome and stamp `completed_at`.
    pub fn transition(&self, id: TaskId, to: TaskStatus, outcome: TaskOutcome) -> Result<Task> {
        let mut tasks = lock(&self.tasks);
        let current = tasks
            .get(&id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("task {}", id)))?;
        let from = current.status;

        let invalid = || OrchestratorError::InvalidTransition {
            task: id,
            from: from.to_string(),
            to: to.to_string(),
        };
        match (from, to) {
            (TaskStatus::Pending, TaskStatus::InProgress) => {
                if !dependencies_completed(&tasks, current) {
                    return Err(OrchestratorError::InvalidTransition {
                        task: id,
                        from: from.to_string(),
                        to: format!("{} (dependencies incomplete)", to),
                    });
                }
            }
            (TaskStatus::InProgress, TaskStatus::Completed)
            | (TaskStatus::InProgress, TaskStatus::Failed) => {}
            _ => return Err(invalid()),
        }

        let mut updated = current.clone();
        updated.status = to;
        let now = Utc::now();
        if to == TaskStatus::InProgress {
            updated.started_at = Some(now);
        } else {
            updated.completed_at = Some(now);
            updated.result = outcome.result;
            updated.insights.extend(outcome.insights);
            updated.metrics = outcome.metrics;
            updated.error = match to {
                TaskStatus::Failed => {
                    Some(outcome.error.unwrap_or_else(|| "unspecified failure".to_string()))
                }
                _ => None,
            };
        }

        self.backend.upsert_task(&updated)?;
        tasks.insert(id, updated.clone());
        drop(tasks);

        match to {
            TaskStatus::Failed => warn!(
                "Task {} failed: {}",
                id,
                updated.error.as_deref().unwrap_or_default()
            ),
            _ => info!("Task {} {} -> {}", id, from, to),
        }
        self.events.emit(OrchestratorEvent::TaskTransitioned {
            task_id: id,
            from,
            to,
        });
        if to == TaskStatus::Completed {
            self.ready.notify_waiters();
        }
        Ok(updated)
    }

    /// Fail a pending task as cancelled without running it.
    ///
    /// The task passes through in_progress to failed under one lock, so no
    /// consumer can dequeue it in between. Tasks past pending are rejected
    /// with [`OrchestratorError::InvalidTransition`].
    pub fn cancel_pending(&self, id: TaskId) -> Result<Task> {
        let mut tasks = lock(&self.tasks);
        let current = tasks
            .get(&id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("task {}", id)))?;
        if current.status != TaskStatus::Pending {
            return Err(OrchestratorError::InvalidTransition {
                task: id,
                from: current.status.to_string(),
                to: TaskStatus::Failed.to_string(),
            });
        }

        let mut updated = current.clone();
        let now = Utc::now();
        updated.status = TaskStatus::Failed;
        updated.started_at = Some(now);
        updated.completed_at = Some(now);
        updated.error = Some(OrchestratorError::Cancelled.to_string());
        self.backend.upsert_task(&updated)?;
        tasks.insert(id, updated.clone());
        drop(tasks);

        warn!("Task {} cancelled before it ran", id);
        self.events.emit(OrchestratorEvent::TaskTransitioned {
            task_id: id,
            from: TaskStatus::Pending,
            to: TaskStatus::InProgress,
        });
        self.events.emit(OrchestratorEvent::TaskTransitioned {
            task_id: id,
            from: TaskStatus::InProgress,
            to: TaskStatus::Failed,
        });
        Ok(updated)
    }

    pub fn get(&self, id: TaskId) -> Result<Task> {
        lock(&self.tasks)
            .get(&id)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(format!("task {}", id)))
    }

    /// Tasks in `status`, ordered by id.
    pub fn list_by_status(&self, status: TaskStatus) -> Vec<Task> {
        lock(&self.tasks)
            .values()
            .filter(|task| task.status == status)
            .cloned()
            .collect()
    }

    pub fn list(&self) -> Vec<Task> {
        lock(&self.tasks).values().cloned().collect()
    }

    /// Pending tasks that can never run because a dependency failed.
    pub fn blocked(&self) -> Vec<Task> {
        let tasks = lock(&self.tasks);
        tasks
            .values()
            .filter(|task| task.status == TaskStatus::Pending)
            .filter(|task| {
                task.dependencies.iter().any(|dep| {
                    tasks
                        .get(dep)
                        .is_some_and(|dep| dep.status == TaskStatus::Failed)
                })
            })
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.tasks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Signalled whenever new work may have become eligible.
    pub fn ready_notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::testing::FlakyStore;
    use crate::persistence::Persistence;
    use std::collections::HashSet;
    use std::sync::Barrier;
    use std::thread;

    fn queue() -> TaskQueue {
        let backend = Arc::new(Persistence::in_memory().unwrap());
        TaskQueue::open(backend, EventBus::default()).unwrap()
    }

    #[test]
    fn test_enqueue_assigns_monotonic_ids() {
        let queue = queue();
        let a = queue.enqueue(TaskDraft::new("a")).unwrap();
        let b = queue.enqueue(TaskDraft::new("b")).unwrap();
        assert!(b.id > a.id);
        assert_eq!(a.status, TaskStatus::Pending);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_unresolved_dependency_rejected() {
        let queue = queue();
        let err = queue
            .enqueue(TaskDraft::new("orphan").with_dependencies([42]))
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::UnresolvedDependency { missing: 42, .. }
        ));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_mutual_dependency_rejected_and_nothing_stored() {
        let queue = queue();
        let a = queue.reserve_id().unwrap();
        let b = queue.reserve_id().unwrap();

        let err = queue
            .enqueue_all(vec![
                TaskDraft::new("A").with_id(a).with_dependencies([b]),
                TaskDraft::new("B").with_id(b).with_dependencies([a]),
            ])
            .unwrap_err();

        match err {
            OrchestratorError::CyclicDependency(path) => {
                assert_eq!(path.first(), path.last());
                assert!(path.contains(&a) && path.contains(&b));
            }
            other => panic!("expected cycle error, got {:?}", other),
        }
        assert!(queue.get(a).is_err());
        assert!(queue.get(b).is_err());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_self_dependency_rejected() {
        let queue = queue();
        let id = queue.reserve_id().unwrap();
        let err = queue
            .enqueue(TaskDraft::new("loop").with_id(id).with_dependencies([id]))
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::CyclicDependency(path) if path == vec![id, id]));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let queue = queue();
        let task = queue.enqueue(TaskDraft::new("first")).unwrap();
        let err = queue
            .enqueue(TaskDraft::new("again").with_id(task.id))
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::DuplicateTask(id) if id == task.id));
    }

    #[test]
    fn test_dequeue_order_priority_then_fifo() {
        let queue = queue();
        let low = queue.enqueue(TaskDraft::new("low").with_priority(1)).unwrap();
        let first = queue.enqueue(TaskDraft::new("first").with_priority(9)).unwrap();
        let second = queue.enqueue(TaskDraft::new("second").with_priority(9)).unwrap();

        let order: Vec<_> = std::iter::from_fn(|| queue.dequeue_next().unwrap())
            .map(|task| task.id)
            .collect();
        assert_eq!(order, vec![first.id, second.id, low.id]);
    }

    #[test]
    fn test_dependencies_gate_dequeue() {
        let queue = queue();
        let parent = queue.enqueue(TaskDraft::new("parent").with_priority(1)).unwrap();
        let child = queue
            .enqueue(
                TaskDraft::new("child")
                    .with_priority(100)
                    .with_dependencies([parent.id]),
            )
            .unwrap();

        let next = queue.dequeue_next().unwrap().unwrap();
        assert_eq!(next.id, parent.id);
        assert!(queue.dequeue_next().unwrap().is_none());

        queue
            .transition(parent.id, TaskStatus::Completed, TaskOutcome::default())
            .unwrap();
        let next = queue.dequeue_next().unwrap().unwrap();
        assert_eq!(next.id, child.id);
        assert!(next.started_at.is_some());
    }

    #[test]
    fn test_invalid_transitions() {
        let queue = queue();
        let task = queue.enqueue(TaskDraft::new("t")).unwrap();

        let err = queue
            .transition(task.id, TaskStatus::Completed, TaskOutcome::default())
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidTransition { .. }));

        queue
            .transition(task.id, TaskStatus::InProgress, TaskOutcome::default())
            .unwrap();
        let done = queue
            .transition(
                task.id,
                TaskStatus::Failed,
                TaskOutcome::failure("phase architecture failed"),
            )
            .unwrap();
        assert_eq!(done.error.as_deref(), Some("phase architecture failed"));
        assert!(done.completed_at.is_some());

        let err = queue
            .transition(task.id, TaskStatus::InProgress, TaskOutcome::default())
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidTransition { .. }));
        assert!(matches!(
            queue
                .transition(999, TaskStatus::InProgress, TaskOutcome::default())
                .unwrap_err(),
            OrchestratorError::NotFound(_)
        ));
    }

    #[test]
    fn test_blocked_lists_tasks_behind_failed_dependency() {
        let queue = queue();
        let parent = queue.enqueue(TaskDraft::new("parent")).unwrap();
        let child = queue
            .enqueue(TaskDraft::new("child").with_dependencies([parent.id]))
            .unwrap();

        queue.dequeue_next().unwrap();
        queue
            .transition(parent.id, TaskStatus::Failed, TaskOutcome::failure("boom"))
            .unwrap();

        let blocked: Vec<_> = queue.blocked().iter().map(|t| t.id).collect();
        assert_eq!(blocked, vec![child.id]);
        assert!(queue.dequeue_next().unwrap().is_none());
    }

    #[test]
    fn test_enqueue_claimed_is_in_progress() {
        let queue = queue();
        let task = queue.enqueue_claimed(TaskDraft::new("direct")).unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert!(queue.dequeue_next().unwrap().is_none());
    }

    #[test]
    fn test_concurrent_dequeuers_receive_distinct_tasks() {
        const TASKS: usize = 60;
        const WORKERS: usize = 8;

        let queue = Arc::new(queue());
        for i in 0..TASKS {
            queue
                .enqueue(TaskDraft::new(format!("task {}", i)).with_priority((i % 5) as i64))
                .unwrap();
        }

        let handles: Vec<_> = (0..WORKERS)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    let mut taken = Vec::new();
                    while let Some(task) = queue.dequeue_next().unwrap() {
                        taken.push(task.id);
                    }
                    taken
                })
            })
            .collect();

        let all: Vec<TaskId> = handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect();
        let distinct: HashSet<_> = all.iter().copied().collect();
        assert_eq!(all.len(), TASKS);
        assert_eq!(distinct.len(), TASKS);
        assert!(queue.list_by_status(TaskStatus::Pending).is_empty());
    }

    #[test]
    fn test_storage_failure_leaves_state_untouched() {
        let store = Arc::new(FlakyStore::new());
        let queue = TaskQueue::open(store.clone(), EventBus::default()).unwrap();
        let task = queue.enqueue(TaskDraft::new("stable")).unwrap();

        store.fail_tasks.store(true, Ordering::SeqCst);
        assert!(matches!(
            queue.enqueue(TaskDraft::new("lost")).unwrap_err(),
            OrchestratorError::Storage(_)
        ));
        assert!(matches!(
            queue.dequeue_next().unwrap_err(),
            OrchestratorError::Storage(_)
        ));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get(task.id).unwrap().status, TaskStatus::Pending);

        store.fail_tasks.store(false, Ordering::SeqCst);
        assert_eq!(queue.dequeue_next().unwrap().unwrap().id, task.id);
    }

    #[test]
    fn test_reopen_restores_tasks_and_id_counter() {
        let backend: Arc<dyn RecordStore> = Arc::new(Persistence::in_memory().unwrap());
        let first = {
            let queue = TaskQueue::open(Arc::clone(&backend), EventBus::default()).unwrap();
            queue.enqueue(TaskDraft::new("persisted").with_priority(3)).unwrap()
        };

        let queue = TaskQueue::open(backend, EventBus::default()).unwrap();
        assert_eq!(queue.get(first.id).unwrap().priority, 3);
        assert!(queue.reserve_id().unwrap() > first.id);
    }

    #[test]
    fn test_more_callers_than_tasks_each_task_handed_out_once() {
        const TASKS: usize = 5;
        const CALLERS: usize = 16;

        let queue = Arc::new(queue());
        for i in 0..TASKS {
            queue.enqueue(TaskDraft::new(format!("task {}", i))).unwrap();
        }

        let barrier = Arc::new(Barrier::new(CALLERS));
        let handles: Vec<_> = (0..CALLERS)
            .map(|_| {
                let queue = Arc::clone(&queue);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    queue.dequeue_next().unwrap().map(|task| task.id)
                })
            })
            .collect();

        let results: Vec<Option<TaskId>> =
            handles.into_iter().map(|handle| handle.join().unwrap()).collect();
        let taken: Vec<TaskId> = results.iter().flatten().copied().collect();
        let distinct: HashSet<_> = taken.iter().copied().collect();
        assert_eq!(taken.len(), TASKS);
        assert_eq!(distinct.len(), TASKS);
        assert_eq!(results.iter().filter(|r| r.is_none()).count(), CALLERS - TASKS);
    }

    #[test]
    fn test_caller_ids_must_be_reserved() {
        let queue = queue();
        let err = queue
            .enqueue(TaskDraft::new("overflow").with_id(u64::MAX))
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidSubmission(_)));

        queue.enqueue(TaskDraft::new("first")).unwrap();
        // A rejected batch burns its auto-assigned id
        assert!(queue
            .enqueue(TaskDraft::new("orphan").with_dependencies([9_999]))
            .is_err());
        let ahead = queue.reserve_id().unwrap();
        let burned = ahead - 1;
        let err = queue
            .enqueue(TaskDraft::new("below the counter").with_id(burned))
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidSubmission(_)));
        assert_eq!(queue.len(), 1);

        let task = queue.enqueue(TaskDraft::new("reserved").with_id(ahead)).unwrap();
        assert_eq!(task.id, ahead);
        // A reservation is spent once its task is stored
        assert!(matches!(
            queue
                .enqueue(TaskDraft::new("reused").with_id(ahead))
                .unwrap_err(),
            OrchestratorError::DuplicateTask(_)
        ));
    }

    #[test]
    fn test_reservation_survives_rejected_batch() {
        let queue = queue();
        let id = queue.reserve_id().unwrap();
        assert!(queue
            .enqueue(TaskDraft::new("orphan").with_id(id).with_dependencies([9_999]))
            .is_err());
        let task = queue.enqueue(TaskDraft::new("retry").with_id(id)).unwrap();
        assert_eq!(task.id, id);
    }

    #[test]
    fn test_cancel_pending_fails_task_in_place() {
        let backend: Arc<dyn RecordStore> = Arc::new(Persistence::in_memory().unwrap());
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let queue = TaskQueue::open(Arc::clone(&backend), events).unwrap();
        let task = queue.enqueue(TaskDraft::new("doomed")).unwrap();

        let cancelled = queue.cancel_pending(task.id).unwrap();
        assert_eq!(cancelled.status, TaskStatus::Failed);
        assert_eq!(cancelled.error.as_deref(), Some("Cancelled"));
        assert!(cancelled.started_at.is_some() && cancelled.completed_at.is_some());
        assert!(queue.dequeue_next().unwrap().is_none());

        let mut transitions = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let OrchestratorEvent::TaskTransitioned { from, to, .. } = event {
                transitions.push((from, to));
            }
        }
        assert_eq!(
            transitions,
            vec![
                (TaskStatus::Pending, TaskStatus::InProgress),
                (TaskStatus::InProgress, TaskStatus::Failed),
            ]
        );

        assert!(matches!(
            queue.cancel_pending(task.id).unwrap_err(),
            OrchestratorError::InvalidTransition { .. }
        ));
        let reopened = TaskQueue::open(backend, EventBus::default()).unwrap();
        assert_eq!(reopened.get(task.id).unwrap().status, TaskStatus::Failed);
    }
}
