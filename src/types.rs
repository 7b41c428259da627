//! Common types shared by the registry, queue and pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Unique, monotonically assigned task identifier.
pub type TaskId = u64;

/// Unique, monotonically assigned memory fragment identifier.
pub type FragmentId = u64;

/// Agent names are the registry key.
pub type AgentName = String;

/// One of the five fixed cognitive execution strategies.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum CognitivePattern {
    /// Goal-directed search (debugging, optimization)
    Convergent,
    /// Broad solution generation (creative work)
    Divergent,
    /// Holistic dependency analysis (architecture, integration)
    Systems,
    /// Adversarial analysis (review, audits)
    Critical,
    /// Cross-domain transfer (research)
    Lateral,
}

impl CognitivePattern {
    pub const ALL: [CognitivePattern; 5] = [
        CognitivePattern::Convergent,
        CognitivePattern::Divergent,
        CognitivePattern::Systems,
        CognitivePattern::Critical,
        CognitivePattern::Lateral,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CognitivePattern::Convergent => "convergent",
            CognitivePattern::Divergent => "divergent",
            CognitivePattern::Systems => "systems",
            CognitivePattern::Critical => "critical",
            CognitivePattern::Lateral => "lateral",
        }
    }
}

impl fmt::Display for CognitivePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for CognitivePattern {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "convergent" => Ok(CognitivePattern::Convergent),
            "divergent" => Ok(CognitivePattern::Divergent),
            "systems" => Ok(CognitivePattern::Systems),
            "critical" => Ok(CognitivePattern::Critical),
            "lateral" => Ok(CognitivePattern::Lateral),
            other => Err(OrchestratorError::InvalidCapability(format!(
                "unknown cognitive pattern '{}'",
                other
            ))),
        }
    }
}

/// Complexity tier of a submitted task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

impl Default for Complexity {
    fn default() -> Self {
        Self::Medium
    }
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Complexity::Low => "low",
            Complexity::Medium => "medium",
            Complexity::High => "high",
        }
    }
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Complexity {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Complexity::Low),
            "medium" => Ok(Complexity::Medium),
            "high" => Ok(Complexity::High),
            other => Err(OrchestratorError::InvalidSubmission(format!(
                "unknown complexity tier '{}' (expected low, medium or high)",
                other
            ))),
        }
    }
}

/// Clamp a score into [0, 1]. NaN collapses to 0.
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

// Poisoned locks are recovered. Writes hit the backend before memory, so the
// guarded value is always the last committed state.

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Error types for registry, queue and pipeline operations.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid capability descriptor: {0}")]
    InvalidCapability(String),

    #[error("Task {task} depends on unknown task {missing}")]
    UnresolvedDependency { task: TaskId, missing: TaskId },

    #[error("Cyclic dependency: {}", format_cycle(.0))]
    CyclicDependency(Vec<TaskId>),

    #[error("Invalid transition for task {task}: {from} -> {to}")]
    InvalidTransition {
        task: TaskId,
        from: String,
        to: String,
    },

    #[error("Task {0} already exists")]
    DuplicateTask(TaskId),

    #[error("Invalid submission: {0}")]
    InvalidSubmission(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

fn format_cycle(path: &[TaskId]) -> String {
    path.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

impl From<duckdb::Error> for OrchestratorError {
    fn from(err: duckdb::Error) -> Self {
        OrchestratorError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        OrchestratorError::Storage(format!("serialization failed: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_round_trip_names() {
        for pattern in CognitivePattern::ALL {
            let parsed: CognitivePattern = pattern.as_str().parse().unwrap();
            assert_eq!(parsed, pattern);
        }
        assert!("quantum".parse::<CognitivePattern>().is_err());
    }

    #[test]
    fn test_complexity_parse() {
        assert_eq!(" High ".parse::<Complexity>().unwrap(), Complexity::High);
        let err = "extreme".parse::<Complexity>().unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidSubmission(_)));
    }

    #[test]
    fn test_clamp_unit() {
        assert_eq!(clamp_unit(1.7), 1.0);
        assert_eq!(clamp_unit(-0.2), 0.0);
        assert_eq!(clamp_unit(f64::NAN), 0.0);
        assert_eq!(clamp_unit(0.42), 0.42);
    }

    #[test]
    fn test_cycle_error_message() {
        let err = OrchestratorError::CyclicDependency(vec![1, 2, 1]);
        assert_eq!(err.to_string(), "Cyclic dependency: 1 -> 2 -> 1");
    }
}
