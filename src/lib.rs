//! Agent capability registry, durable task queue and SPARC phase pipeline.
//!
//! The crate is organised as a set of independently constructed stores that
//! the [`Orchestrator`] wires together:
//!
//! - **Capability Store**: registered agents, their skills and moving-average scores
//! - **Task Queue**: prioritised tasks with dependencies and a monotonic state machine
//! - **Memory Fragment Store**: importance-ranked phase output with bounded capacity
//! - **Pattern Selector**: keyword classifier choosing one of five cognitive patterns
//! - **Orchestrator**: runs Specification, Pseudocode, Architecture, Refinement and
//!   Completion for each task through a pluggable [`PhaseExecutor`]
//! - **Performance Estimator**: bounded improvement factor and running statistics
//!
//! All stores write through a [`RecordStore`] (DuckDB by default) and publish
//! [`OrchestratorEvent`]s on a shared [`EventBus`].
//!
//! # Usage
//!
//! ```ignore
//! use sparc_orchestrator::{BaselineExecutor, Complexity, Orchestrator, OrchestratorConfig};
//! use std::sync::Arc;
//!
//! let config = OrchestratorConfig::load_default()?;
//! let orchestrator = Orchestrator::from_config(&config, Arc::new(BaselineExecutor))?;
//! orchestrator.capabilities().load_definitions(Path::new("agents"))?;
//!
//! let report = orchestrator
//!     .orchestrate("Design the billing service", Complexity::High)
//!     .await?;
//! println!("{} phases, {:?}x", report.phases.len(), report.improvement_factor);
//! ```

pub mod capability;
pub mod config;
pub mod events;
pub mod memory;
pub mod orchestration;
pub mod pattern;
pub mod performance;
pub mod persistence;
pub mod queue;
pub mod types;
pub mod worker;

// Re-export main types for convenience
pub use capability::{
    Agent, AgentDefinition, CapabilityDescriptor, CapabilityStore, SkillCategory,
};
pub use config::OrchestratorConfig;
pub use events::{EventBus, OrchestratorEvent};
pub use memory::{FragmentStore, MemoryFragment, NewFragment};
pub use orchestration::{
    BaselineExecutor, CancellationSignal, OrchestrationReport, Orchestrator, Phase, PhaseExecutor,
    PhaseOutput, PhaseRecord, PhaseRequest, QualityGate,
};
pub use pattern::{Classification, PatternSelector};
pub use performance::{PerformanceEstimator, PerformanceSummary};
pub use persistence::{Persistence, RecordStore};
pub use queue::{Task, TaskDraft, TaskOutcome, TaskQueue, TaskStatus};
pub use types::{CognitivePattern, Complexity, OrchestratorError, Result, TaskId};
pub use worker::{run_until_idle, WorkerPool, WorkerPoolConfig};
