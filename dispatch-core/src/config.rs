//! Recognized configuration options (§6), with the defaults named there.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub stream_name: String,
    pub consumer_name: String,
    pub trigger_subject: String,
    pub max_concurrent: usize,
    pub context_timeout: Duration,
    pub execution_timeout: Duration,
    pub context_response_bucket: String,
    pub workflow_trigger_subject: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            stream_name: "WORKFLOW".to_string(),
            consumer_name: "task-dispatcher".to_string(),
            trigger_subject: "workflow.trigger.task-dispatcher".to_string(),
            max_concurrent: 3,
            context_timeout: Duration::from_secs(30),
            execution_timeout: Duration::from_secs(300),
            context_response_bucket: "CONTEXT_RESPONSES".to_string(),
            workflow_trigger_subject: "workflow.trigger.task-execution-loop".to_string(),
        }
    }
}

impl DispatchConfig {
    /// Ack-wait is sized so the broker does not redeliver a batch still
    /// being worked on (§5).
    pub fn ack_wait(&self) -> Duration {
        self.execution_timeout + Duration::from_secs(60)
    }

    /// `max_concurrent` is clamped to the documented 1..10 range.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("DISPATCH_MAX_CONCURRENT") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.max_concurrent = n.clamp(1, 10);
            }
        }
        if let Ok(v) = std::env::var("DISPATCH_CONTEXT_TIMEOUT_SECS") {
            if let Ok(n) = v.parse::<u64>() {
                cfg.context_timeout = Duration::from_secs(n);
            }
        }
        if let Ok(v) = std::env::var("DISPATCH_EXECUTION_TIMEOUT_SECS") {
            if let Ok(n) = v.parse::<u64>() {
                cfg.execution_timeout = Duration::from_secs(n);
            }
        }
        if let Ok(v) = std::env::var("DISPATCH_STREAM_NAME") {
            cfg.stream_name = v;
        }
        if let Ok(v) = std::env::var("DISPATCH_CONSUMER_NAME") {
            cfg.consumer_name = v;
        }
        cfg
    }
}
