//! Structured telemetry emitted at every state transition.
//!
//! Stores and the orchestrator publish [`OrchestratorEvent`]s on a shared
//! [`EventBus`]. Dashboards and CLIs subscribe instead of scraping logs. Every
//! event is also written to `tracing` at debug level.

use crate::queue::TaskStatus;
use crate::types::{AgentName, CognitivePattern, FragmentId, TaskId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Events published by the registry, queue, fragment store and pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    AgentRegistered {
        name: AgentName,
        replaced: bool,
    },
    AgentOutcomeRecorded {
        name: AgentName,
        succeeded: bool,
        performance_score: f64,
    },
    TaskEnqueued {
        task_id: TaskId,
        priority: i64,
    },
    TaskDequeued {
        task_id: TaskId,
    },
    TaskTransitioned {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },
    PhaseCompleted {
        task_id: TaskId,
        phase: String,
        pattern: CognitivePattern,
        quality: f64,
    },
    FragmentRecorded {
        fragment_id: FragmentId,
        related_task: Option<TaskId>,
    },
    FragmentsEvicted {
        fragment_ids: Vec<FragmentId>,
    },
}

const DEFAULT_CAPACITY: usize = 256;

/// Broadcast hub for [`OrchestratorEvent`]s.
///
/// Publishing never blocks and never fails: with no subscribers the event is
/// dropped, and slow subscribers observe `RecvError::Lagged`.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<OrchestratorEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: OrchestratorEvent) {
        debug!(?event, "orchestrator event");
        // No receivers is not an error
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_events_in_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(OrchestratorEvent::TaskEnqueued {
            task_id: 1,
            priority: 5,
        });
        bus.emit(OrchestratorEvent::TaskDequeued { task_id: 1 });

        assert_eq!(
            rx.recv().await.unwrap(),
            OrchestratorEvent::TaskEnqueued {
                task_id: 1,
                priority: 5
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            OrchestratorEvent::TaskDequeued { task_id: 1 }
        );
    }

    #[test]
    fn test_emit_without_subscribers_is_noop() {
        let bus = EventBus::new(4);
        bus.emit(OrchestratorEvent::FragmentsEvicted {
            fragment_ids: vec![1, 2],
        });
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = OrchestratorEvent::AgentRegistered {
            name: "coder".to_string(),
            replaced: false,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "agent_registered");
        assert_eq!(json["name"], "coder");
    }
}
