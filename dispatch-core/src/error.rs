//! Error kinds for the dispatch core, following the shape of
//! `OrchestrationError` in the teacher's `onboarding_orchestrator.rs`: one
//! variant per failure mode, `#[from]` for inner library errors, and a
//! `retryable()` classifier used by [`crate::context::ContextAssembler`].

use thiserror::Error;

use crate::scheduler::BatchStats;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("dependency graph references unknown id: {0}")]
    InvalidDependency(String),

    #[error("circular dependency detected among: {0:?}")]
    CircularDependency(Vec<String>),
}

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("failed to decode context response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("context build returned an error: {0}")]
    Remote(String),

    #[error("bus publish failed: {0}")]
    PublishFailed(String),

    #[error("context kv store unavailable: {0}")]
    KvUnavailable(String),

    #[error("context response key was deleted before a value arrived")]
    ResponseGone,

    #[error("context build timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl ContextError {
    /// Retryable per §4.2/§7: publish failure and KV unavailability are
    /// retryable; a decode failure, an explicit error field in the
    /// response, or the outer-context timeout already having elapsed are
    /// not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ContextError::PublishFailed(_) | ContextError::KvUnavailable(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("trigger publish failed: {0}")]
    PublishFailed(String),

    #[error("phase deadlock: {0} phase(s) remain but none are ready")]
    PhaseDeadlock(usize),

    #[error("failed to parse plan or trigger payload: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("failed to load plan: {0}")]
    PlanLoad(String),

    #[error("batch cancelled after dispatching {0:?}")]
    Cancelled(BatchStats),
}
