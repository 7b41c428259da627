//! Pool of concurrent queue consumers that run the pipeline.
//!
//! Both [`WorkerPool`] and [`run_until_idle`] keep the fragment store within
//! its capacity while they run and make a final eviction pass when they stop.

use crate::config::OrchestratorConfig;
use crate::orchestration::{OrchestrationReport, Orchestrator};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info};

/// Configuration for the worker pool
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of concurrent consumers
    pub workers: usize,
    /// Fallback poll period while idle
    pub idle_poll: Duration,
    /// Longest gap between memory eviction passes
    pub eviction_interval: Duration,
}

impl WorkerPoolConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            idle_poll: Duration::from_secs(5),
            eviction_interval: Duration::from_secs(30),
        }
    }
}

impl From<&OrchestratorConfig> for WorkerPoolConfig {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            workers: config.pipeline.workers.max(1),
            eviction_interval: Duration::from_secs(config.memory.eviction_interval_secs.max(1)),
            ..Self::default()
        }
    }
}

/// Long-running consumers; stop them with [`WorkerPool::shutdown`].
pub struct WorkerPool {
    orchestrator: Arc<Orchestrator>,
    handles: Vec<JoinHandle<usize>>,
    eviction: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl WorkerPool {
    /// Spawn `config.workers` consumers that sleep until the queue signals
    /// new work.
    pub fn spawn(orchestrator: Arc<Orchestrator>, config: WorkerPoolConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        info!("Starting {} pipeline workers", config.workers);
        let eviction = Arc::clone(orchestrator.memory()).spawn_eviction(config.eviction_interval);
        let handles = (0..config.workers.max(1))
            .map(|worker| {
                let orchestrator = Arc::clone(&orchestrator);
                let mut stop = shutdown.subscribe();
                let idle_poll = config.idle_poll;
                tokio::spawn(async move {
                    let ready = orchestrator.queue().ready_notifier();
                    let mut processed = 0;
                    while !*stop.borrow() {
                        // Registered before checking the queue so a wakeup
                        // between the check and the wait is not lost
                        let notified = ready.notified();
                        tokio::pin!(notified);
                        notified.as_mut().enable();

                        match orchestrator.process_next().await {
                            Ok(Some(report)) => {
                                processed += 1;
                                log_report(worker, &report);
                                continue;
                            }
                            Ok(None) => {}
                            Err(e) => error!("Worker {} failed to process a task: {}", worker, e),
                        }

                        tokio::select! {
                            _ = &mut notified => {}
                            changed = stop.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                            }
                            _ = time::sleep(idle_poll) => {}
                        }
                    }
                    debug!("Worker {} stopped after {} tasks", worker, processed);
                    processed
                })
            })
            .collect();
        Self {
            orchestrator,
            handles,
            eviction,
            shutdown,
        }
    }

    /// Signal every worker to stop after its current task and wait for them.
    /// Returns the number of tasks processed.
    pub async fn shutdown(self) -> usize {
        self.shutdown.send_replace(true);
        let processed = join_all(self.handles)
            .await
            .into_iter()
            .map(|result| match result {
                Ok(processed) => processed,
                Err(e) => {
                    error!("Worker panicked: {}", e);
                    0
                }
            })
            .sum();
        self.eviction.abort();
        final_eviction(&self.orchestrator);
        processed
    }
}

/// Drain the queue with `config.workers` concurrent consumers and return once
/// no task is eligible. Tasks blocked behind unfinished work stay queued.
pub async fn run_until_idle(
    orchestrator: Arc<Orchestrator>,
    config: WorkerPoolConfig,
) -> Vec<OrchestrationReport> {
    let eviction = Arc::clone(orchestrator.memory()).spawn_eviction(config.eviction_interval);
    let handles: Vec<_> = (0..config.workers.max(1))
        .map(|worker| {
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move {
                let mut reports = Vec::new();
                loop {
                    match orchestrator.process_next().await {
                        Ok(Some(report)) => {
                            log_report(worker, &report);
                            reports.push(report);
                        }
                        Ok(None) => break,
                        Err(e) => {
                            error!("Worker {} stopping: {}", worker, e);
                            break;
                        }
                    }
                }
                reports
            })
        })
        .collect();

    let mut reports: Vec<OrchestrationReport> = join_all(handles)
        .await
        .into_iter()
        .filter_map(|result| match result {
            Ok(reports) => Some(reports),
            Err(e) => {
                error!("Worker panicked: {}", e);
                None
            }
        })
        .flatten()
        .collect();
    eviction.abort();
    final_eviction(&orchestrator);
    reports.sort_by_key(|report| report.task_id);
    reports
}

fn final_eviction(orchestrator: &Orchestrator) {
    match orchestrator.memory().evict_excess() {
        Ok(evicted) if !evicted.is_empty() => {
            debug!("Final eviction pass removed {} fragments", evicted.len())
        }
        Ok(_) => {}
        Err(e) => error!("Final memory eviction pass failed: {}", e),
    }
}

fn log_report(worker: usize, report: &OrchestrationReport) {
    match &report.error {
        None => info!(
            "Worker {} completed task {} ({} phases)",
            worker,
            report.task_id,
            report.phases.len()
        ),
        Some(reason) => info!(
            "Worker {} finished task {} as failed: {}",
            worker, report.task_id, reason
        ),
    }
}
