//! Per-task context assembly: request/response over the bus, correlated
//! through a watched KV key (§4.2).

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::warn;
use uuid::Uuid;

use crate::bus::Bus;
use crate::config::DispatchConfig;
use crate::error::ContextError;
use crate::kv::{ContextKv, KvEvent};
use crate::registry::ModelRegistry;
use crate::types::{ContextBuildRequest, ContextBuildResponse, ContextPayload, Task, TaskWithContext};

/// Bounded attempts with exponential backoff + jitter, capped by the outer
/// `context_timeout` — the open question in §9 is resolved this way and
/// recorded in DESIGN.md.
const MAX_ATTEMPTS: u32 = 5;
const BASE_BACKOFF: Duration = Duration::from_millis(100);

pub struct ContextAssembler<B, K> {
    bus: Arc<B>,
    kv: Arc<K>,
    registry: Arc<ModelRegistry>,
    config: DispatchConfig,
}

impl<B: Bus, K: ContextKv> ContextAssembler<B, K> {
    pub fn new(bus: Arc<B>, kv: Arc<K>, registry: Arc<ModelRegistry>, config: DispatchConfig) -> Self {
        Self {
            bus,
            kv,
            registry,
            config,
        }
    }

    /// Produces a [`TaskWithContext`] for `task`. Never fails outright:
    /// exhausting retries yields a context-less entry per §4.2/§8 invariant 6.
    pub async fn assemble(&self, task: &Task) -> TaskWithContext {
        let context_request_id = Uuid::new_v4().to_string();
        let (model, fallback_models) = self.registry.resolve(&task.task_type);
        let context_payload = self.build_with_retry(task, &context_request_id).await;

        TaskWithContext {
            task: task.clone(),
            context_payload,
            context_request_id,
            model,
            fallback_models,
        }
    }

    async fn build_with_retry(&self, task: &Task, request_id: &str) -> Option<ContextPayload> {
        let deadline = Instant::now() + self.config.context_timeout;

        for attempt in 1..=MAX_ATTEMPTS {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            match tokio::time::timeout(remaining, self.try_once(task, request_id)).await {
                Ok(Ok(payload)) => return Some(payload),
                Ok(Err(e)) if !e.is_retryable() => {
                    warn!(task_id = %task.id, error = %e, "context build failed non-retryably; dispatching without context");
                    return None;
                }
                Ok(Err(e)) => {
                    warn!(task_id = %task.id, attempt, error = %e, "context build attempt failed, retrying");
                }
                Err(_) => {
                    let err = ContextError::Timeout(remaining);
                    warn!(task_id = %task.id, error = %err, "context build timed out; dispatching without context");
                    return None;
                }
            }

            if attempt < MAX_ATTEMPTS {
                let backoff = BASE_BACKOFF * 2u32.pow(attempt - 1);
                let jitter_ms = rand::thread_rng().gen_range(0..50);
                let sleep_for = backoff
                    .saturating_add(Duration::from_millis(jitter_ms))
                    .min(deadline.saturating_duration_since(Instant::now()));
                tokio::time::sleep(sleep_for).await;
            }
        }

        warn!(task_id = %task.id, "context build exhausted retries within timeout; dispatching without context");
        None
    }

    async fn try_once(&self, task: &Task, request_id: &str) -> Result<ContextPayload, ContextError> {
        let subject = format!("context.build.{}", task.task_type);
        let request = ContextBuildRequest {
            context_request_id: request_id.to_string(),
            task_id: task.id.clone(),
            task_type: task.task_type.clone(),
            plan_id: task.plan_id.clone(),
            files: task.files.clone(),
        };
        let bytes = serde_json::to_vec(&request).expect("ContextBuildRequest always serializes");
        self.bus
            .publish(&subject, bytes)
            .await
            .map_err(ContextError::PublishFailed)?;

        if let Some(existing) = self
            .kv
            .get(request_id)
            .await
            .map_err(ContextError::KvUnavailable)?
        {
            return Self::decode(&existing);
        }

        let mut rx = self
            .kv
            .watch(request_id)
            .await
            .map_err(ContextError::KvUnavailable)?;

        // The initial update is a readiness marker, not data; ignore it.
        if let Some(KvEvent::Ready) = rx.recv().await {
            // expected path
        }

        match rx.recv().await {
            Some(KvEvent::Value(bytes)) => Self::decode(&bytes),
            Some(KvEvent::Deleted) => Err(ContextError::ResponseGone),
            Some(KvEvent::Ready) => Err(ContextError::KvUnavailable("duplicate watcher-ready event".into())),
            None => Err(ContextError::KvUnavailable("kv watch channel closed".into())),
        }
    }

    fn decode(bytes: &[u8]) -> Result<ContextPayload, ContextError> {
        let response: ContextBuildResponse = serde_json::from_slice(bytes)?;
        if let Some(error) = response.error {
            return Err(ContextError::Remote(error));
        }
        response
            .payload
            .ok_or_else(|| ContextError::Remote("response carried neither payload nor error".into()))
    }
}
