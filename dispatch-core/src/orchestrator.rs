//! Outer loop: runs all ready phases concurrently; within each phase, runs
//! the inner [`DispatchScheduler`] (§4.4).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use crate::context::ContextAssembler;
use crate::error::DispatchError;
use crate::graph::DependencyGraph;
use crate::scheduler::{BatchStats, DispatchScheduler};
use crate::types::{Phase, Task, TaskWithContext};
use crate::bus::Bus;
use crate::kv::ContextKv;

pub struct PhaseOrchestrator<B, K> {
    scheduler: Arc<DispatchScheduler<B>>,
    assembler: Arc<ContextAssembler<B, K>>,
}

impl<B: Bus + 'static, K: ContextKv + 'static> PhaseOrchestrator<B, K> {
    pub fn new(scheduler: Arc<DispatchScheduler<B>>, assembler: Arc<ContextAssembler<B, K>>) -> Self {
        Self { scheduler, assembler }
    }

    /// Runs the full dispatch graph for one batch. Degrades to a single
    /// flat [`DispatchScheduler`] pass when `phases` is empty.
    pub async fn run(
        &self,
        slug: &str,
        tasks: Vec<Task>,
        phases: Vec<Phase>,
        cancel: watch::Receiver<bool>,
    ) -> Result<BatchStats, DispatchError> {
        // Context assembly happens for every task up front, in parallel,
        // independent of phase or task ordering (§4.2: "never blocks the
        // scheduler... concurrent, capped only by the number of tasks").
        let task_context = self.assemble_all(&tasks).await;

        if phases.is_empty() {
            let graph = Arc::new(DependencyGraph::build(tasks)?);
            let stats = self
                .scheduler
                .run(graph, Arc::new(task_context), slug, cancel.clone())
                .await;
            if *cancel.borrow() {
                return Err(DispatchError::Cancelled(stats));
            }
            return Ok(stats);
        }

        let mut tasks_by_phase: HashMap<String, Vec<Task>> = HashMap::new();
        for t in tasks {
            let phase_id = t.phase_id.clone().unwrap_or_default();
            tasks_by_phase.entry(phase_id).or_default().push(t);
        }

        let phase_graph = Arc::new(DependencyGraph::build(phases)?);
        let task_context = Arc::new(task_context);
        let mut total = BatchStats::default();

        loop {
            if *cancel.borrow() {
                return Err(DispatchError::Cancelled(total));
            }
            if phase_graph.empty() {
                break;
            }

            let ready = phase_graph.ready();
            if ready.is_empty() {
                // Graph construction already rejects cycles; this is the
                // safety net for mutation bugs (§4.4).
                return Err(DispatchError::PhaseDeadlock(phase_graph.remaining()));
            }

            info!(slug, phases = ?ready, "dispatching ready phase wave");

            let mut handles = Vec::new();
            for phase_id in &ready {
                let phase_tasks = tasks_by_phase.remove(phase_id).unwrap_or_default();
                let task_graph = Arc::new(DependencyGraph::build(phase_tasks)?);
                let scheduler = self.scheduler.clone();
                let ctx = task_context.clone();
                let slug_owned = slug.to_string();
                let cancel_clone = cancel.clone();
                handles.push(tokio::spawn(async move {
                    scheduler.run(task_graph, ctx, &slug_owned, cancel_clone).await
                }));
            }

            for handle in handles {
                let stats = handle.await.unwrap_or_default();
                total.dispatched += stats.dispatched;
                total.failed += stats.failed;
                total.skipped += stats.skipped;
            }

            // Every task trigger in this wave has been durably published
            // (DispatchScheduler only returns once publishes resolve) before
            // any phase depending on it is allowed to start (§4.4, §5).
            for phase_id in &ready {
                phase_graph.mark_completed(phase_id);
            }
        }

        Ok(total)
    }

    async fn assemble_all(&self, tasks: &[Task]) -> HashMap<String, TaskWithContext> {
        let mut handles = Vec::new();
        for task in tasks {
            let assembler = self.assembler.clone();
            let task = task.clone();
            handles.push(tokio::spawn(async move {
                let twc = assembler.assemble(&task).await;
                (twc.task.id.clone(), twc)
            }));
        }
        let mut out = HashMap::new();
        for handle in handles {
            if let Ok((id, twc)) = handle.await {
                out.insert(id, twc);
            }
        }
        out
    }
}
