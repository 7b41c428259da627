//! Five-phase SPARC pipeline: Specification, Pseudocode, Architecture,
//! Refinement and Completion.
//!
//! The [`Orchestrator`] classifies a task, staffs a cohort of agents from the
//! [`CapabilityStore`], queues the task and then runs the phases in order.
//! Each phase is delegated to a [`PhaseExecutor`]; the orchestrator records a
//! memory fragment per phase, feeds outcomes back into agent scores and
//! estimates the improvement factor when the run completes.

use crate::capability::CapabilityStore;
use crate::config::OrchestratorConfig;
use crate::events::{EventBus, OrchestratorEvent};
use crate::memory::{FragmentStore, NewFragment};
use crate::pattern::{Classification, PatternSelector};
use crate::performance::PerformanceEstimator;
use crate::persistence::{Persistence, RecordStore};
use crate::queue::{Task, TaskDraft, TaskOutcome, TaskQueue, TaskStatus};
use crate::types::{
    clamp_unit, lock, AgentName, CognitivePattern, Complexity, FragmentId, OrchestratorError,
    Result, TaskId,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Fragment context type used for phase output.
pub const PHASE_CONTEXT: &str = "sparc_phase";

/// One step of the pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Specification,
    Pseudocode,
    Architecture,
    Refinement,
    Completion,
}

impl Phase {
    /// Execution order.
    pub const ALL: [Phase; 5] = [
        Phase::Specification,
        Phase::Pseudocode,
        Phase::Architecture,
        Phase::Refinement,
        Phase::Completion,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Specification => "specification",
            Phase::Pseudocode => "pseudocode",
            Phase::Architecture => "architecture",
            Phase::Refinement => "refinement",
            Phase::Completion => "completion",
        }
    }

    pub fn pattern(&self) -> CognitivePattern {
        match self {
            Phase::Specification => CognitivePattern::Convergent,
            Phase::Pseudocode => CognitivePattern::Divergent,
            Phase::Architecture => CognitivePattern::Systems,
            Phase::Refinement => CognitivePattern::Critical,
            Phase::Completion => CognitivePattern::Systems,
        }
    }

    pub fn baseline_quality(&self) -> f64 {
        match self {
            Phase::Specification => 0.93,
            Phase::Pseudocode => 0.87,
            Phase::Architecture => 0.91,
            Phase::Refinement => 0.94,
            Phase::Completion => 0.89,
        }
    }

    /// Roles staffed for the phase. Refinement is worked by the whole task
    /// cohort instead.
    pub fn roles(&self) -> &'static [&'static str] {
        match self {
            Phase::Specification => &["researcher"],
            Phase::Pseudocode => &["coder", "architect"],
            Phase::Architecture => &["architect"],
            Phase::Refinement => &[],
            Phase::Completion => &["ops_specialist"],
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Roles a task needs, by complexity tier then by pattern, without duplicates.
pub fn cohort_roles(complexity: Complexity, pattern: CognitivePattern) -> Vec<&'static str> {
    let mut roles = vec!["coder"];
    if complexity >= Complexity::Medium {
        roles.extend(["tester", "reviewer"]);
    }
    if complexity == Complexity::High {
        roles.extend(["architect", "security_specialist"]);
    }
    let additions: &[&str] = match pattern {
        CognitivePattern::Convergent => &[],
        CognitivePattern::Divergent => &["architect"],
        CognitivePattern::Systems => &["architect", "systems_specialist"],
        CognitivePattern::Critical => &["security_specialist", "reviewer"],
        CognitivePattern::Lateral => &["researcher"],
    };
    for role in additions {
        if !roles.contains(role) {
            roles.push(role);
        }
    }
    roles
}

/// Work handed to a [`PhaseExecutor`].
#[derive(Debug, Clone, Serialize)]
pub struct PhaseRequest {
    pub task_id: TaskId,
    pub phase: Phase,
    pub pattern: CognitivePattern,
    /// Pattern chosen for the task as a whole
    pub task_pattern: CognitivePattern,
    pub description: String,
    pub complexity: Complexity,
    pub agents: Vec<AgentName>,
}

/// What a collaborator reports back for one phase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseOutput {
    /// Clamped into [0, 1] by the orchestrator
    pub quality: f64,
    pub summary: String,
    #[serde(default)]
    pub insights: Vec<String>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
}

impl PhaseOutput {
    pub fn new(quality: f64, summary: impl Into<String>) -> Self {
        Self {
            quality,
            summary: summary.into(),
            insights: Vec::new(),
            embedding: None,
        }
    }

    pub fn with_insight(mut self, insight: impl Into<String>) -> Self {
        self.insights.push(insight.into());
        self
    }
}

/// External collaborator that does the actual work of a phase.
#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    async fn execute(&self, request: &PhaseRequest) -> anyhow::Result<PhaseOutput>;
}

/// Deterministic executor that reports each phase's baseline quality.
#[derive(Debug, Clone, Default)]
pub struct BaselineExecutor;

#[async_trait]
impl PhaseExecutor for BaselineExecutor {
    async fn execute(&self, request: &PhaseRequest) -> anyhow::Result<PhaseOutput> {
        let agents = if request.agents.is_empty() {
            "no agents".to_string()
        } else {
            request.agents.join(", ")
        };
        Ok(PhaseOutput::new(
            request.phase.baseline_quality(),
            format!(
                "{} of '{}' using {} thinking ({})",
                request.phase, request.description, request.pattern, agents
            ),
        )
        .with_insight(format!(
            "{} completed at baseline quality {:.2}",
            request.phase,
            request.phase.baseline_quality()
        )))
    }
}

/// Cooperative cancellation flag shared between a running task and
/// [`Orchestrator::cancel`].
#[derive(Debug, Clone)]
pub struct CancellationSignal {
    sender: Arc<watch::Sender<bool>>,
}

impl Default for CancellationSignal {
    fn default() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }
}

impl CancellationSignal {
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        // The sender lives as long as `self`, so this cannot fail
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}

/// Why a phase did not produce output.
#[derive(Debug)]
enum PhaseFailure {
    Executor(anyhow::Error),
    TimedOut(Duration),
    Storage(OrchestratorError),
    Cancelled,
}

impl fmt::Display for PhaseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseFailure::Executor(e) => write!(f, "{:#}", e),
            PhaseFailure::TimedOut(limit) => write!(f, "timed out after {:?}", limit),
            PhaseFailure::Storage(e) => write!(f, "{}", e),
            PhaseFailure::Cancelled => write!(f, "{}", OrchestratorError::Cancelled),
        }
    }
}

/// Outcome of one executed phase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseRecord {
    pub phase: Phase,
    pub pattern: CognitivePattern,
    pub agents: Vec<AgentName>,
    #[serde(default)]
    pub unstaffed_roles: Vec<String>,
    pub duration_secs: f64,
    pub quality: f64,
    pub summary: String,
    pub fragment_id: FragmentId,
    /// Set when a minimum quality is configured for the phase
    #[serde(default)]
    pub quality_gate: Option<QualityGate>,
}

/// A phase's configured minimum quality and whether the run met it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct QualityGate {
    pub minimum: f64,
    pub passed: bool,
}

/// Everything known about one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestrationReport {
    pub run_id: Uuid,
    pub task_id: TaskId,
    pub description: String,
    pub classification: Classification,
    /// Cohort staffed for the task
    pub agents: Vec<AgentName>,
    /// Roles nobody registered could fill, across cohort and phases
    pub unstaffed_roles: Vec<String>,
    /// Completed phases in execution order
    pub phases: Vec<PhaseRecord>,
    pub status: TaskStatus,
    pub error: Option<String>,
    pub failed_phase: Option<Phase>,
    pub execution_time_secs: f64,
    pub improvement_factor: Option<f64>,
    pub average_quality: Option<f64>,
    /// Phases that finished below their configured minimum quality
    #[serde(default)]
    pub failed_gates: Vec<Phase>,
    /// Agent outcome updates that could not be stored after the task settled
    #[serde(default)]
    pub outcome_errors: Vec<String>,
}

impl OrchestrationReport {
    pub fn succeeded(&self) -> bool {
        self.status == TaskStatus::Completed
    }

    pub fn was_cancelled(&self) -> bool {
        self.error == Some(OrchestratorError::Cancelled.to_string())
    }

    pub fn gates_passed(&self) -> bool {
        self.failed_gates.is_empty()
    }

    fn phase_map(&self) -> serde_json::Value {
        let phases: serde_json::Map<String, serde_json::Value> = self
            .phases
            .iter()
            .map(|record| {
                (
                    record.phase.as_str().to_string(),
                    json!({
                        "pattern": record.pattern,
                        "agents": record.agents,
                        "duration_secs": record.duration_secs,
                        "quality": record.quality,
                        "quality_gate": record.quality_gate,
                        "fragment_id": record.fragment_id,
                    }),
                )
            })
            .collect();
        serde_json::Value::Object(phases)
    }
}

struct Staffing {
    agents: Vec<AgentName>,
    unstaffed: Vec<String>,
}

pub struct Orchestrator {
    capabilities: Arc<CapabilityStore>,
    queue: Arc<TaskQueue>,
    memory: Arc<FragmentStore>,
    events: EventBus,
    selector: PatternSelector,
    performance: PerformanceEstimator,
    executor: Arc<dyn PhaseExecutor>,
    phase_timeout: Option<Duration>,
    default_priority: i64,
    quality_gates: BTreeMap<Phase, f64>,
    cancellations: Mutex<HashMap<TaskId, CancellationSignal>>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("capabilities", &self.capabilities)
            .field("queue", &self.queue)
            .field("memory", &self.memory)
            .field("phase_timeout", &self.phase_timeout)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(
        capabilities: Arc<CapabilityStore>,
        queue: Arc<TaskQueue>,
        memory: Arc<FragmentStore>,
        events: EventBus,
        executor: Arc<dyn PhaseExecutor>,
        config: &OrchestratorConfig,
    ) -> Result<Self> {
        // Rebuild the running summary from finished tasks
        let performance = PerformanceEstimator::new(config.performance.clone());
        for task in queue.list() {
            match (task.status, &task.metrics) {
                (TaskStatus::Completed, Some(metrics)) => performance.record(
                    metrics["improvement_factor"].as_f64().unwrap_or(0.0),
                    metrics["average_quality"].as_f64().unwrap_or(0.0),
                ),
                (TaskStatus::Failed, _) => performance.record_failure(),
                _ => {}
            }
        }

        Ok(Self {
            capabilities,
            queue,
            memory,
            events,
            selector: PatternSelector::new(config)?,
            performance,
            executor,
            phase_timeout: config.pipeline.phase_timeout_secs.map(Duration::from_secs),
            default_priority: config.pipeline.default_priority,
            quality_gates: config.pipeline.quality_gates.clone(),
            cancellations: Mutex::new(HashMap::new()),
        })
    }

    /// Open storage as configured (in-memory when no path is set) and wire
    /// every store to one event bus.
    pub fn from_config(
        config: &OrchestratorConfig,
        executor: Arc<dyn PhaseExecutor>,
    ) -> Result<Self> {
        let backend: Arc<dyn RecordStore> = match &config.storage.database_path {
            Some(path) => Arc::new(Persistence::new(path)?),
            None => Arc::new(Persistence::in_memory()?),
        };
        let events = EventBus::default();
        let capabilities = CapabilityStore::open(
            Arc::clone(&backend),
            events.clone(),
            config.scoring.decay_factor,
        )?;
        let queue = TaskQueue::open(Arc::clone(&backend), events.clone())?;
        let memory = FragmentStore::open(
            backend,
            events.clone(),
            config.memory.capacity,
            config.memory.default_compression_ratio,
        )?;
        Self::new(
            Arc::new(capabilities),
            Arc::new(queue),
            Arc::new(memory),
            events,
            executor,
            config,
        )
    }

    pub fn with_phase_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.phase_timeout = timeout;
        self
    }

    /// Minimum quality per phase; phases without an entry are not gated.
    pub fn with_quality_gates(mut self, gates: BTreeMap<Phase, f64>) -> Self {
        self.quality_gates = gates;
        self
    }

    pub fn capabilities(&self) -> &Arc<CapabilityStore> {
        &self.capabilities
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn memory(&self) -> &Arc<FragmentStore> {
        &self.memory
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn performance(&self) -> &PerformanceEstimator {
        &self.performance
    }

    pub fn classify(&self, description: &str, complexity: Complexity) -> Classification {
        self.selector.classify(description, complexity)
    }

    /// Queue a task for a worker to pick up.
    pub fn submit(&self, description: &str, complexity: &str) -> Result<TaskId> {
        let description = validate_description(description)?;
        let complexity: Complexity = complexity.parse()?;
        let draft = self.draft(description, complexity);
        let task = self.queue.enqueue(draft)?;
        Ok(task.id)
    }

    /// Classify, staff, queue and run a task to completion on the caller.
    pub async fn orchestrate(
        &self,
        description: &str,
        complexity: Complexity,
    ) -> Result<OrchestrationReport> {
        let description = validate_description(description)?;
        let draft = self.draft(description, complexity);
        let task = self.queue.enqueue_claimed(draft)?;
        self.run_claimed(task).await
    }

    /// Dequeue the next eligible task and run it. `None` when nothing is ready.
    pub async fn process_next(&self) -> Result<Option<OrchestrationReport>> {
        match self.queue.dequeue_next()? {
            Some(task) => self.run_claimed(task).await.map(Some),
            None => Ok(None),
        }
    }

    /// Run a specific task. A pending task is claimed first; a task already in
    /// progress is assumed to be claimed by the caller.
    pub async fn run_task(&self, task: Task) -> Result<OrchestrationReport> {
        let task = match task.status {
            TaskStatus::Pending => {
                self.queue
                    .transition(task.id, TaskStatus::InProgress, TaskOutcome::default())?
            }
            TaskStatus::InProgress => task,
            status => {
                return Err(OrchestratorError::InvalidTransition {
                    task: task.id,
                    from: status.to_string(),
                    to: TaskStatus::InProgress.to_string(),
                })
            }
        };
        self.run_claimed(task).await
    }

    /// Stop a task. A pending task fails at once without running; a running
    /// one halts at its next await point.
    pub fn cancel(&self, task_id: TaskId) -> Result<()> {
        match self.queue.cancel_pending(task_id) {
            Ok(_) => {
                lock(&self.cancellations).remove(&task_id);
                self.performance.record_failure();
                info!("Cancelled pending task {}", task_id);
                return Ok(());
            }
            Err(OrchestratorError::InvalidTransition { .. }) => {}
            Err(e) => return Err(e),
        }

        // Checked under the map lock: `run_claimed` settles the task before it
        // drops the entry, so a signal is never left behind for a finished task
        let mut cancellations = lock(&self.cancellations);
        let task = self.queue.get(task_id)?;
        if task.status != TaskStatus::InProgress {
            return Err(OrchestratorError::InvalidTransition {
                task: task_id,
                from: task.status.to_string(),
                to: "cancelled".to_string(),
            });
        }
        cancellations.entry(task_id).or_default().cancel();
        drop(cancellations);
        info!("Cancellation requested for running task {}", task_id);
        Ok(())
    }

    fn draft(&self, description: &str, complexity: Complexity) -> TaskDraft {
        let classification = self.selector.classify(description, complexity);
        let roles = cohort_roles(complexity, classification.pattern);
        let staffing = self.staff(&roles, classification.pattern);
        if !staffing.unstaffed.is_empty() {
            debug!("No registered agent for roles {:?}", staffing.unstaffed);
        }
        TaskDraft::new(description)
            .with_priority(self.default_priority)
            .with_complexity(complexity)
            .with_requirements(roles)
            .with_agents(staffing.agents)
            .with_pattern(classification.pattern)
    }

    fn staff(&self, roles: &[&str], pattern: CognitivePattern) -> Staffing {
        let mut agents = Vec::new();
        let mut unstaffed = Vec::new();
        for role in roles {
            match self.capabilities.staff_role(role, pattern) {
                Some(agent) => {
                    if !agents.contains(&agent.name) {
                        agents.push(agent.name);
                    }
                }
                None => unstaffed.push(role.to_string()),
            }
        }
        Staffing { agents, unstaffed }
    }

    /// Roles in `task.requirements` that none of its assigned agents fill.
    fn unfilled_requirements(&self, task: &Task) -> Vec<String> {
        let assigned: Vec<_> = task
            .assigned_agents
            .iter()
            .filter_map(|name| self.capabilities.lookup(name).ok())
            .collect();
        task.requirements
            .iter()
            .filter(|role| !assigned.iter().any(|agent| agent.fills_role(role)))
            .cloned()
            .collect()
    }

    async fn run_claimed(&self, task: Task) -> Result<OrchestrationReport> {
        let signal = lock(&self.cancellations)
            .entry(task.id)
            .or_default()
            .clone();
        let result = self.run_phases(&task, &signal).await;
        lock(&self.cancellations).remove(&task.id);
        result
    }

    async fn run_phases(
        &self,
        task: &Task,
        signal: &CancellationSignal,
    ) -> Result<OrchestrationReport> {
        let started = Instant::now();
        let mut classification = self.selector.classify(&task.description, task.complexity);
        if let Some(pattern) = task.pattern_used {
            classification.pattern = pattern;
        }
        info!(
            "Running task {} with {} pattern ({} agents)",
            task.id,
            classification.pattern,
            task.assigned_agents.len()
        );

        let mut report = OrchestrationReport {
            run_id: Uuid::new_v4(),
            task_id: task.id,
            description: task.description.clone(),
            classification,
            agents: task.assigned_agents.clone(),
            unstaffed_roles: self.unfilled_requirements(task),
            phases: Vec::new(),
            status: TaskStatus::InProgress,
            error: None,
            failed_phase: None,
            execution_time_secs: 0.0,
            improvement_factor: None,
            average_quality: None,
            failed_gates: Vec::new(),
            outcome_errors: Vec::new(),
        };
        let mut insights = Vec::new();

        for phase in Phase::ALL {
            let staffing = match phase {
                Phase::Refinement => Staffing {
                    agents: task.assigned_agents.clone(),
                    unstaffed: Vec::new(),
                },
                _ => self.staff(phase.roles(), phase.pattern()),
            };
            for role in &staffing.unstaffed {
                if !report.unstaffed_roles.contains(role) {
                    report.unstaffed_roles.push(role.clone());
                }
            }
            let request = PhaseRequest {
                task_id: task.id,
                phase,
                pattern: phase.pattern(),
                task_pattern: report.classification.pattern,
                description: task.description.clone(),
                complexity: task.complexity,
                agents: staffing.agents.clone(),
            };

            let phase_started = Instant::now();
            match self.execute_phase(&request, signal).await {
                Ok((output, fragment_id)) => {
                    let quality = clamp_unit(output.quality);
                    debug!("Task {} phase {} finished with quality {:.2}", task.id, phase, quality);
                    self.events.emit(OrchestratorEvent::PhaseCompleted {
                        task_id: task.id,
                        phase: phase.as_str().to_string(),
                        pattern: phase.pattern(),
                        quality,
                    });
                    insights.extend(output.insights);
                    let quality_gate = self.quality_gates.get(&phase).map(|&minimum| QualityGate {
                        minimum,
                        passed: quality >= minimum,
                    });
                    if let Some(gate) = quality_gate.filter(|gate| !gate.passed) {
                        warn!(
                            "Task {} phase {} quality {:.2} is below its gate of {:.2}",
                            task.id, phase, quality, gate.minimum
                        );
                        report.failed_gates.push(phase);
                    }
                    report.phases.push(PhaseRecord {
                        phase,
                        pattern: phase.pattern(),
                        agents: staffing.agents,
                        unstaffed_roles: staffing.unstaffed,
                        duration_secs: phase_started.elapsed().as_secs_f64(),
                        quality,
                        summary: output.summary,
                        fragment_id,
                        quality_gate,
                    });
                }
                Err(failure) => {
                    report.execution_time_secs = started.elapsed().as_secs_f64();
                    return self
                        .fail(task, report, phase, &staffing.agents, failure, insights)
                        .map_err(|e| {
                            warn!("Could not record failure of task {}: {}", task.id, e);
                            e
                        });
                }
            }
        }

        report.execution_time_secs = started.elapsed().as_secs_f64();
        self.complete(task, report, insights, started.elapsed())
    }

    async fn execute_phase(
        &self,
        request: &PhaseRequest,
        signal: &CancellationSignal,
    ) -> std::result::Result<(PhaseOutput, FragmentId), PhaseFailure> {
        if signal.is_cancelled() {
            return Err(PhaseFailure::Cancelled);
        }
        let output = tokio::select! {
            biased;
            _ = signal.cancelled() => Err(PhaseFailure::Cancelled),
            result = self.bounded(self.executor.execute(request)) => result,
        }?;

        let fragment = self
            .memory
            .record(NewFragment {
                context_type: PHASE_CONTEXT.to_string(),
                content: output.summary.clone(),
                embedding: output.embedding.clone(),
                importance: output.quality,
                related_task: Some(request.task_id),
                pattern_correlation: Some(request.pattern.as_str().to_string()),
                ..NewFragment::default()
            })
            .map_err(PhaseFailure::Storage)?;
        Ok((output, fragment.id))
    }

    async fn bounded<F>(&self, work: F) -> std::result::Result<PhaseOutput, PhaseFailure>
    where
        F: Future<Output = anyhow::Result<PhaseOutput>>,
    {
        match self.phase_timeout {
            Some(limit) => match tokio::time::timeout(limit, work).await {
                Ok(result) => result.map_err(PhaseFailure::Executor),
                Err(_) => Err(PhaseFailure::TimedOut(limit)),
            },
            None => work.await.map_err(PhaseFailure::Executor),
        }
    }

    fn complete(
        &self,
        task: &Task,
        mut report: OrchestrationReport,
        insights: Vec<String>,
        elapsed: Duration,
    ) -> Result<OrchestrationReport> {
        let average_quality = report.phases.iter().map(|p| p.quality).sum::<f64>()
            / report.phases.len().max(1) as f64;
        let factor = self
            .performance
            .estimate(elapsed.as_secs_f64(), task.complexity);
        report.average_quality = Some(average_quality);
        report.improvement_factor = Some(factor);

        let outcome = TaskOutcome::success(json!({
            "run_id": report.run_id,
            "classification": report.classification,
            "phases": report.phase_map(),
            "unstaffed_roles": report.unstaffed_roles,
        }))
        .with_insights(insights)
        .with_metrics(json!({
            "execution_time_secs": report.execution_time_secs,
            "improvement_factor": factor,
            "average_quality": average_quality,
            "memory_budget_mb": report.classification.memory_budget_mb,
            "expected_accuracy": report.classification.expected_accuracy,
            "quality_gates_passed": report.gates_passed(),
            "failed_quality_gates": report.failed_gates,
        }));
        self.queue
            .transition(task.id, TaskStatus::Completed, outcome)?;
        self.performance.record(factor, average_quality);
        report.status = TaskStatus::Completed;

        let involved: BTreeSet<AgentName> = report
            .phases
            .iter()
            .flat_map(|record| record.agents.iter())
            .chain(report.agents.iter())
            .cloned()
            .collect();
        for name in &involved {
            self.record_outcome(&mut report, name, true, elapsed);
        }

        info!(
            "Task {} completed in {:.3}s (improvement {:.2}x, quality {:.2})",
            task.id, report.execution_time_secs, factor, average_quality
        );
        Ok(report)
    }

    fn fail(
        &self,
        task: &Task,
        mut report: OrchestrationReport,
        phase: Phase,
        phase_agents: &[AgentName],
        failure: PhaseFailure,
        insights: Vec<String>,
    ) -> Result<OrchestrationReport> {
        let reason = match &failure {
            PhaseFailure::Cancelled => failure.to_string(),
            other => format!("phase {} failed: {}", phase, other),
        };

        let outcome = TaskOutcome::failure(reason.clone())
            .with_insights(insights)
            .with_metrics(json!({
                "execution_time_secs": report.execution_time_secs,
                "failed_phase": phase,
                "completed_phases": report.phases.len(),
                "quality_gates_passed": report.gates_passed(),
                "failed_quality_gates": report.failed_gates,
            }));
        self.queue.transition(task.id, TaskStatus::Failed, outcome)?;
        self.performance.record_failure();

        warn!("Task {} stopped at phase {}: {}", task.id, phase, reason);
        report.status = TaskStatus::Failed;
        report.error = Some(reason);
        report.failed_phase = Some(phase);

        if !matches!(failure, PhaseFailure::Cancelled) {
            let elapsed = Duration::from_secs_f64(report.execution_time_secs);
            for name in phase_agents {
                self.record_outcome(&mut report, name, false, elapsed);
            }
        }
        Ok(report)
    }

    /// Fold an outcome into an agent's scores once its task has settled.
    /// Storage failures land in `report.outcome_errors`.
    fn record_outcome(
        &self,
        report: &mut OrchestrationReport,
        name: &str,
        succeeded: bool,
        elapsed: Duration,
    ) {
        match self
            .capabilities
            .record_outcome(name, succeeded, Some(elapsed))
        {
            Ok(_) => {}
            // Assigned agents are weak references
            Err(OrchestratorError::NotFound(_)) => {
                debug!("Agent '{}' is no longer registered", name);
            }
            Err(e) => {
                warn!("Could not record outcome for agent '{}': {}", name, e);
                report
                    .outcome_errors
                    .push(format!("agent '{}': {}", name, e));
            }
        }
    }
}

fn validate_description(description: &str) -> Result<&str> {
    let trimmed = description.trim();
    if trimmed.is_empty() {
        return Err(OrchestratorError::InvalidSubmission(
            "task description must not be empty".to_string(),
        ));
    }
    Ok(trimmed)
}
