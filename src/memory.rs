//! Importance-ranked memory fragments with bounded capacity.
//!
//! Fragments are appended by the orchestrator after each phase. When the
//! store grows past its capacity an eviction pass removes the least important
//! fragments, oldest access first among equals.

use crate::events::{EventBus, OrchestratorEvent};
use crate::persistence::RecordStore;
use crate::types::{clamp_unit, lock, FragmentId, OrchestratorError, Result, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info};

/// A retained snippet of phase output or insight.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryFragment {
    pub id: FragmentId,

    pub context_type: String,

    pub content: String,

    /// Opaque fixed-size vector supplied by the producer
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,

    /// Eviction priority in [0, 1]
    pub importance: f64,

    pub created_at: DateTime<Utc>,

    pub last_accessed: DateTime<Utc>,

    pub access_count: u64,

    /// May dangle once the task is purged
    #[serde(default)]
    pub related_task: Option<TaskId>,

    pub compression_ratio: f64,

    pub neural_enhanced: bool,

    #[serde(default)]
    pub pattern_correlation: Option<String>,
}

impl MemoryFragment {
    pub fn new(
        id: FragmentId,
        context_type: impl Into<String>,
        content: impl Into<String>,
        importance: f64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            context_type: context_type.into(),
            content: content.into(),
            embedding: None,
            importance: clamp_unit(importance),
            created_at: now,
            last_accessed: now,
            access_count: 0,
            related_task: None,
            compression_ratio: 1.0,
            neural_enhanced: false,
            pattern_correlation: None,
        }
    }
}

/// Fields supplied by a producer; id and timestamps are assigned by the store.
#[derive(Debug, Clone, Default)]
pub struct NewFragment {
    pub context_type: String,
    pub content: String,
    pub embedding: Option<Vec<f32>>,
    pub importance: f64,
    pub related_task: Option<TaskId>,
    pub compression_ratio: Option<f64>,
    pub neural_enhanced: bool,
    pub pattern_correlation: Option<String>,
}

/// Eviction order: lowest importance first, then least recently accessed,
/// then oldest id.
fn eviction_order(a: &MemoryFragment, b: &MemoryFragment) -> Ordering {
    a.importance
        .total_cmp(&b.importance)
        .then_with(|| a.last_accessed.cmp(&b.last_accessed))
        .then_with(|| a.id.cmp(&b.id))
}

pub struct FragmentStore {
    fragments: Mutex<BTreeMap<FragmentId, MemoryFragment>>,
    next_id: AtomicU64,
    capacity: usize,
    default_compression_ratio: f64,
    backend: Arc<dyn RecordStore>,
    events: EventBus,
    over_capacity: Notify,
}

impl std::fmt::Debug for FragmentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FragmentStore")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl FragmentStore {
    pub fn open(
        backend: Arc<dyn RecordStore>,
        events: EventBus,
        capacity: usize,
        default_compression_ratio: f64,
    ) -> Result<Self> {
        let fragments: BTreeMap<_, _> = backend
            .load_fragments()?
            .into_iter()
            .map(|fragment| (fragment.id, fragment))
            .collect();
        let next_id = fragments.keys().next_back().map_or(1, |id| id + 1);
        debug!("Loaded {} memory fragments from storage", fragments.len());
        Ok(Self {
            fragments: Mutex::new(fragments),
            next_id: AtomicU64::new(next_id),
            capacity: capacity.max(1),
            default_compression_ratio: default_compression_ratio.max(0.0),
            backend,
            events,
            over_capacity: Notify::new(),
        })
    }

    /// Append a fragment. Exceeding capacity wakes the eviction worker; the
    /// insert itself never evicts.
    pub fn record(&self, new: NewFragment) -> Result<MemoryFragment> {
        let id = self.next_id.fetch_add(1, AtomicOrdering::SeqCst);
        let mut fragment = MemoryFragment::new(id, new.context_type, new.content, new.importance);
        fragment.embedding = new.embedding;
        fragment.related_task = new.related_task;
        fragment.compression_ratio = new
            .compression_ratio
            .unwrap_or(self.default_compression_ratio)
            .max(0.0);
        fragment.neural_enhanced = new.neural_enhanced;
        fragment.pattern_correlation = new.pattern_correlation;

        let len = {
            let mut fragments = lock(&self.fragments);
            self.backend.upsert_fragment(&fragment)?;
            fragments.insert(id, fragment.clone());
            fragments.len()
        };

        self.events.emit(OrchestratorEvent::FragmentRecorded {
            fragment_id: id,
            related_task: fragment.related_task,
        });
        if len > self.capacity {
            self.over_capacity.notify_one();
        }
        Ok(fragment)
    }

    /// Read a fragment, bumping its access statistics.
    pub fn access(&self, id: FragmentId) -> Result<MemoryFragment> {
        let mut fragments = lock(&self.fragments);
        let current = fragments
            .get(&id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("memory fragment {}", id)))?;

        let mut touched = current.clone();
        touched.access_count += 1;
        touched.last_accessed = Utc::now();
        self.backend.upsert_fragment(&touched)?;
        fragments.insert(id, touched.clone());
        Ok(touched)
    }

    /// Read without touching access statistics.
    pub fn peek(&self, id: FragmentId) -> Option<MemoryFragment> {
        lock(&self.fragments).get(&id).cloned()
    }

    /// Fragments recorded for a task, in insertion order.
    pub fn for_task(&self, task_id: TaskId) -> Vec<MemoryFragment> {
        lock(&self.fragments)
            .values()
            .filter(|fragment| fragment.related_task == Some(task_id))
            .cloned()
            .collect()
    }

    /// The `limit` most important fragments (ties: most recently accessed).
    pub fn top(&self, limit: usize) -> Vec<MemoryFragment> {
        let mut all: Vec<_> = lock(&self.fragments).values().cloned().collect();
        all.sort_by(|a, b| eviction_order(b, a));
        all.truncate(limit);
        all
    }

    pub fn len(&self) -> usize {
        lock(&self.fragments).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Remove fragments until the store is back within capacity.
    ///
    /// The victims are chosen and deleted under a single lock acquisition. If
    /// the backend rejects the delete nothing is removed.
    pub fn evict_excess(&self) -> Result<Vec<FragmentId>> {
        let mut fragments = lock(&self.fragments);
        if fragments.len() <= self.capacity {
            return Ok(Vec::new());
        }
        let excess = fragments.len() - self.capacity;

        let mut candidates: Vec<&MemoryFragment> = fragments.values().collect();
        candidates.sort_by(|a, b| eviction_order(a, b));
        let victims: Vec<FragmentId> = candidates.iter().take(excess).map(|f| f.id).collect();

        self.backend.delete_fragments(&victims)?;
        for id in &victims {
            fragments.remove(id);
        }
        drop(fragments);

        info!("Evicted {} memory fragments", victims.len());
        self.events.emit(OrchestratorEvent::FragmentsEvicted {
            fragment_ids: victims.clone(),
        });
        Ok(victims)
    }

    /// Run eviction in the background: on every capacity overflow and at
    /// least once per `interval`.
    pub fn spawn_eviction(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "Starting memory eviction worker with interval {:?} and capacity {}",
                interval, self.capacity
            );
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = self.over_capacity.notified() => {}
                    _ = ticker.tick() => {}
                }
                if let Err(e) = self.evict_excess() {
                    error!("Memory eviction pass failed: {}", e);
                }
            }
        })
    }
}
