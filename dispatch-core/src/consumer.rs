//! Durable consumer of `workflow.trigger.task-dispatcher`: loads the plan,
//! runs the orchestrator, publishes a `BatchResult`, and resolves the
//! trigger message on every path (§4.5).

use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::bus::Bus;
use crate::config::DispatchConfig;
use crate::kv::ContextKv;
use crate::orchestrator::PhaseOrchestrator;
use crate::plan::load_plan;
use crate::registry::PayloadRegistry;
use crate::types::{BatchResult, BatchStatus, BatchTrigger, Envelope, MessageType};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl ConsumerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Stopped,
            1 => Self::Starting,
            2 => Self::Running,
            _ => Self::Stopping,
        }
    }
}

/// Resolution the caller must apply to the broker's message handle. The
/// consumer never touches the broker API directly — `dispatch-service`
/// maps this onto the real JetStream ack/nak/term calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Ack,
    Nak,
    /// Terminal negative-ack: do not redeliver (poison-pill guard, §7).
    Term,
}

#[async_trait]
pub trait ResultPublisher: Send + Sync {
    async fn publish_result(&self, result: &BatchResult) -> Result<(), String>;
}

pub struct BusResultPublisher<B> {
    pub bus: Arc<B>,
}

#[async_trait]
impl<B: Bus> ResultPublisher for BusResultPublisher<B> {
    async fn publish_result(&self, result: &BatchResult) -> Result<(), String> {
        let subject = format!("workflow.result.task-dispatcher.{}", result.slug);
        let bytes = serde_json::to_vec(result).map_err(|e| e.to_string())?;
        self.bus.publish(&subject, bytes).await
    }
}

/// Known `{domain, category, version}` for a batch-trigger envelope (§9
/// "dynamic payload dispatch"). Any other variant is logged and dropped
/// rather than acted on.
const BATCH_TRIGGER_VARIANT: (&str, &str, u32) = ("workflow", "trigger", 1);

pub struct BatchConsumer<B, K> {
    state: AtomicU8,
    config: DispatchConfig,
    repo_root: PathBuf,
    orchestrator: Arc<PhaseOrchestrator<B, K>>,
    result_publisher: Arc<dyn ResultPublisher>,
    payload_registry: PayloadRegistry,
}

enum ParsedTrigger {
    Trigger(BatchTrigger),
    UnknownVariant(MessageType),
}

impl<B: Bus + 'static, K: ContextKv + 'static> BatchConsumer<B, K> {
    pub fn new(
        config: DispatchConfig,
        repo_root: PathBuf,
        orchestrator: Arc<PhaseOrchestrator<B, K>>,
        result_publisher: Arc<dyn ResultPublisher>,
    ) -> Self {
        let mut payload_registry = PayloadRegistry::new();
        let (domain, category, version) = BATCH_TRIGGER_VARIANT;
        payload_registry.register(domain, category, version);

        Self {
            state: AtomicU8::new(ConsumerState::Stopped as u8),
            config,
            repo_root,
            orchestrator,
            result_publisher,
            payload_registry,
        }
    }

    pub fn state(&self) -> ConsumerState {
        ConsumerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Transition `stopped -> starting -> running`. Returns `false` if the
    /// consumer was not stopped.
    pub fn start(&self) -> bool {
        if self
            .state
            .compare_exchange(
                ConsumerState::Stopped as u8,
                ConsumerState::Starting as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return false;
        }
        info!(
            consumer = %self.config.consumer_name,
            ack_wait = ?self.config.ack_wait(),
            "batch consumer starting"
        );
        self.state.store(ConsumerState::Running as u8, Ordering::SeqCst);
        true
    }

    /// Transition `running -> stopping -> stopped`. Returns `false` if the
    /// consumer was not running.
    pub fn stop(&self) -> bool {
        if self
            .state
            .compare_exchange(
                ConsumerState::Running as u8,
                ConsumerState::Stopping as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return false;
        }
        self.state.store(ConsumerState::Stopped as u8, Ordering::SeqCst);
        true
    }

    /// Parses, executes, and resolves one inbound trigger message. Only
    /// called while `running`; callers are expected to check [`Self::state`]
    /// before delivering a message.
    pub async fn handle_message(&self, raw: &[u8]) -> Resolution {
        let trigger = match Self::parse_trigger(raw, &self.payload_registry) {
            Ok(ParsedTrigger::Trigger(t)) => t,
            Ok(ParsedTrigger::UnknownVariant(message_type)) => {
                warn!(
                    domain = %message_type.domain,
                    category = %message_type.category,
                    version = message_type.version,
                    "dropping unknown payload variant"
                );
                return Resolution::Ack;
            }
            Err(e) => {
                error!(error = %e, "failed to parse batch trigger, nacking for redelivery");
                return Resolution::Nak;
            }
        };

        info!(request_id = %trigger.request_id, slug = %trigger.slug, "processing batch trigger");

        let plan = match load_plan(&self.repo_root, &trigger.slug) {
            Ok(plan) => plan,
            Err(e) => {
                warn!(error = %e, slug = %trigger.slug, "failed to load plan");
                let result = BatchResult {
                    request_id: trigger.request_id.clone(),
                    slug: trigger.slug.clone(),
                    batch_id: trigger.batch_id.clone(),
                    task_count: 0,
                    dispatched_count: 0,
                    failed_count: 0,
                    status: BatchStatus::LoadTasksFailed,
                    error: Some(e.to_string()),
                };
                self.publish_and_resolve(&result).await;
                // Once to prevent a poison-pill loop; max-deliver also caps this.
                return Resolution::Term;
            }
        };

        if plan.tasks.is_empty() {
            let result = BatchResult {
                request_id: trigger.request_id.clone(),
                slug: trigger.slug.clone(),
                batch_id: trigger.batch_id.clone(),
                task_count: 0,
                dispatched_count: 0,
                failed_count: 0,
                status: BatchStatus::NoTasks,
                error: None,
            };
            self.publish_and_resolve(&result).await;
            return Resolution::Ack;
        }

        // §5: `execution_timeout` wraps the entire orchestration as a single
        // root deadline. The timer signals the same cooperative-cancellation
        // channel the scheduler's in-flight drain already observes, rather
        // than dropping the run future outright, so a fired deadline still
        // yields partial stats instead of abandoning in-flight dispatches.
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task_count = plan.tasks.len();
        let timeout_guard = tokio::spawn({
            let execution_timeout = self.config.execution_timeout;
            async move {
                tokio::time::sleep(execution_timeout).await;
                let _ = cancel_tx.send(true);
            }
        });
        let run_result = self
            .orchestrator
            .run(&plan.slug, plan.tasks, plan.phases, cancel_rx)
            .await;
        timeout_guard.abort();

        let result = match run_result {
            Ok(stats) => BatchResult {
                request_id: trigger.request_id.clone(),
                slug: trigger.slug.clone(),
                batch_id: trigger.batch_id.clone(),
                task_count,
                dispatched_count: stats.dispatched,
                failed_count: stats.failed,
                status: BatchStatus::Completed,
                error: None,
            },
            Err(e) => {
                let (status, dispatched_count, failed_count) = match &e {
                    crate::error::DispatchError::PhaseDeadlock(_) => {
                        (BatchStatus::PhaseDeadlock, 0, 0)
                    }
                    crate::error::DispatchError::Cancelled(stats) => {
                        (BatchStatus::TimedOut, stats.dispatched, stats.failed)
                    }
                    _ => (BatchStatus::LoadTasksFailed, 0, 0),
                };
                BatchResult {
                    request_id: trigger.request_id.clone(),
                    slug: trigger.slug.clone(),
                    batch_id: trigger.batch_id.clone(),
                    task_count,
                    dispatched_count,
                    failed_count,
                    status,
                    error: Some(e.to_string()),
                }
            }
        };

        self.publish_and_resolve(&result).await;
        // The core never re-dispatches a partially completed batch (§4.5).
        Resolution::Ack
    }

    async fn publish_and_resolve(&self, result: &BatchResult) {
        if let Err(e) = self.result_publisher.publish_result(result).await {
            error!(error = %e, "failed to publish batch result");
        }
    }

    /// Accepts both raw JSON `BatchTrigger` and an envelope-wrapped payload
    /// so tracing fields on the envelope survive (§4.5 step 1). An
    /// envelope whose `{domain, category, version}` isn't registered is
    /// reported as [`ParsedTrigger::UnknownVariant`] rather than decoded.
    fn parse_trigger(
        raw: &[u8],
        registry: &PayloadRegistry,
    ) -> Result<ParsedTrigger, serde_json::Error> {
        if let Ok(envelope) = serde_json::from_slice::<Envelope<BatchTrigger>>(raw) {
            let mt = &envelope.message_type;
            if registry.is_known(&mt.domain, &mt.category, mt.version) {
                return Ok(ParsedTrigger::Trigger(envelope.payload));
            }
            return Ok(ParsedTrigger::UnknownVariant(envelope.message_type));
        }
        serde_json::from_slice::<BatchTrigger>(raw).map(ParsedTrigger::Trigger)
    }
}
