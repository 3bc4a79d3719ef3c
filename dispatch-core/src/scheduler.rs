//! Inner dispatch loop: enqueue ready tasks, respect the global concurrency
//! cap, stream completions, compute newly ready tasks (§4.3).
//!
//! The cancellation signal follows the teacher-adjacent
//! `tokio::sync::watch::Receiver<bool>` shutdown pattern used by
//! `ob-workflow`'s `TaskQueueListener::run` in this retrieval pack.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::sync::{watch, Semaphore};
use tracing::{info, warn};
use uuid::Uuid;

use crate::bus::Bus;
use crate::config::DispatchConfig;
use crate::graph::DependencyGraph;
use crate::types::{Task, TaskExecutionTrigger, TaskWithContext};

/// `{dispatched, failed}` where `dispatched + failed + skipped ==
/// tasks_considered` and each task is counted exactly once (§4.3 "Return").
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub dispatched: usize,
    pub failed: usize,
    pub skipped: usize,
}

pub struct DispatchScheduler<B> {
    bus: Arc<B>,
    config: DispatchConfig,
}

impl<B: Bus + 'static> DispatchScheduler<B> {
    pub fn new(bus: Arc<B>, config: DispatchConfig) -> Self {
        Self { bus, config }
    }

    /// Runs the inner loop over `graph`'s tasks until the graph is empty or
    /// `cancel` is signalled. `task_context` supplies the already-assembled
    /// context for every task the caller intends to dispatch.
    pub async fn run(
        &self,
        graph: Arc<DependencyGraph<Task>>,
        task_context: Arc<HashMap<String, TaskWithContext>>,
        slug: &str,
        mut cancel: watch::Receiver<bool>,
    ) -> BatchStats {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent));
        let running: Arc<StdMutex<HashSet<String>>> = Arc::new(StdMutex::new(HashSet::new()));
        let (completed_tx, mut completed_rx) = tokio::sync::mpsc::unbounded_channel::<()>();
        let stats = Arc::new(StdMutex::new(BatchStats::default()));

        let mut queue: Vec<String> = graph.ready();
        let mut in_flight: usize = 0;

        loop {
            if *cancel.borrow() {
                info!(slug, "scheduler cancelled, draining in-flight dispatchers");
                break;
            }
            if graph.empty() && queue.is_empty() {
                break;
            }

            while let Some(task_id) = queue.pop() {
                if *cancel.borrow() {
                    break;
                }
                {
                    let mut running_guard = running.lock().unwrap();
                    if !running_guard.insert(task_id.clone()) {
                        continue;
                    }
                }

                let Some(task) = graph.get(&task_id) else {
                    continue;
                };

                if !task.is_approved() {
                    // Not approved: signal complete immediately so the
                    // graph can progress past it, counted as skipped.
                    stats.lock().unwrap().skipped += 1;
                    let newly_ready = graph.mark_completed(&task_id);
                    queue.extend(newly_ready);
                    continue;
                }

                let Some(twc) = task_context.get(&task_id).cloned() else {
                    // Missing context-map entry entirely (not merely an
                    // empty payload) is a hard failure per §4.3.
                    warn!(task_id, "approved task has no context-map entry; counting as failed");
                    stats.lock().unwrap().failed += 1;
                    let newly_ready = graph.mark_completed(&task_id);
                    queue.extend(newly_ready);
                    continue;
                };

                let semaphore = semaphore.clone();
                let bus = self.bus.clone();
                let running = running.clone();
                let stats = stats.clone();
                let graph = graph.clone();
                let completed_tx = completed_tx.clone();
                let slug = slug.to_string();
                let subject = self.config.workflow_trigger_subject.clone();
                let mut dispatch_cancel = cancel.clone();

                in_flight += 1;
                tokio::spawn(async move {
                    let permit = tokio::select! {
                        permit = semaphore.acquire() => Some(permit),
                        _ = dispatch_cancel.changed() => None,
                    };
                    let Some(_permit) = permit else {
                        running.lock().unwrap().remove(&task_id);
                        let _ = completed_tx.send(());
                        return;
                    };

                    let trigger = TaskExecutionTrigger {
                        task_id: task_id.clone(),
                        slug: slug.clone(),
                        prompt: twc.task.description.clone(),
                        model: twc.model.clone(),
                        context_request_id: twc.context_request_id.clone(),
                        trace_id: Uuid::new_v4().to_string(),
                    };

                    let outcome = match serde_json::to_vec(&trigger) {
                        Ok(bytes) => bus.publish(&subject, bytes).await,
                        Err(e) => Err(e.to_string()),
                    };

                    match outcome {
                        Ok(()) => {
                            stats.lock().unwrap().dispatched += 1;
                        }
                        Err(e) => {
                            warn!(task_id, error = %e, "task-execution trigger publish failed; counting as failed");
                            stats.lock().unwrap().failed += 1;
                        }
                    }

                    let newly_ready = graph.mark_completed(&task_id);
                    running.lock().unwrap().remove(&task_id);
                    let _ = completed_tx.send(());
                    // Newly-ready ids are folded back in by the drainer via
                    // the shared graph; nothing further to send here.
                    drop(newly_ready);
                });
            }

            if in_flight == 0 && graph.empty() {
                break;
            }

            tokio::select! {
                _ = completed_rx.recv() => {
                    in_flight = in_flight.saturating_sub(1);
                    queue = graph.ready().into_iter()
                        .filter(|id| !running.lock().unwrap().contains(id))
                        .collect();
                }
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        info!(slug, "scheduler cancelled while awaiting completions");
                    }
                }
            }
        }

        // Wait for any stragglers that were already spawned before cancellation.
        while in_flight > 0 {
            if completed_rx.recv().await.is_some() {
                in_flight = in_flight.saturating_sub(1);
            } else {
                break;
            }
        }

        let final_stats = *stats.lock().unwrap();
        final_stats
    }
}
