//! Wire and in-memory data model for the dispatch core.
//!
//! Field sets mirror §3 of the specification exactly; nothing here is
//! mutated in place once a batch has started except the bookkeeping noted
//! on [`Task::started_at`].

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a task within one plan execution.
///
/// Transitions are monotonic within an execution: the core never moves a
/// task backwards (e.g. `completed` -> `pending`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    PendingApproval,
    Approved,
    Rejected,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub plan_id: String,
    pub sequence: i64,
    #[serde(rename = "type")]
    pub task_type: String,
    pub description: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub depends_on: HashSet<String>,
    #[serde(default)]
    pub phase_id: Option<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn is_approved(&self) -> bool {
        self.status == TaskStatus::Approved
    }
}

impl crate::graph::Node for Task {
    fn id(&self) -> &str {
        &self.id
    }
    fn depends_on(&self) -> &HashSet<String> {
        &self.depends_on
    }
}

impl crate::graph::Node for Phase {
    fn id(&self) -> &str {
        &self.id
    }
    fn depends_on(&self) -> &HashSet<String> {
        &self.depends_on
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub depends_on: HashSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchTrigger {
    pub request_id: String,
    pub batch_id: String,
    pub slug: String,
    pub trace_id: String,
}

/// Plan loaded from `<repo>/.semspec/changes/<slug>/{tasks.json,phases.json}`.
///
/// Named explicitly (it is implicit but unnamed in the distilled spec) so
/// `BatchConsumer::load_plan` has a single return type.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub slug: String,
    pub tasks: Vec<Task>,
    pub phases: Vec<Phase>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextPayload {
    pub documents: HashMap<String, String>,
    pub entities: Vec<ContextEntity>,
    pub sops: Vec<String>,
    pub token_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextEntity {
    pub id: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub content: String,
}

/// In-memory-only pairing of a task with its assembled context and resolved
/// model. Never serialized; produced by [`crate::context::ContextAssembler`]
/// and consumed by [`crate::scheduler::DispatchScheduler`].
#[derive(Debug, Clone)]
pub struct TaskWithContext {
    pub task: Task,
    pub context_payload: Option<ContextPayload>,
    pub context_request_id: String,
    pub model: String,
    pub fallback_models: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Completed,
    LoadTasksFailed,
    NoTasks,
    PhaseDeadlock,
    TimedOut,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub request_id: String,
    pub slug: String,
    pub batch_id: String,
    pub task_count: usize,
    pub dispatched_count: usize,
    pub failed_count: usize,
    pub status: BatchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Context-build request published on `context.build.<task_type>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextBuildRequest {
    pub context_request_id: String,
    pub task_id: String,
    pub task_type: String,
    pub plan_id: String,
    pub files: Vec<String>,
}

/// Context-build response delivered via the KV bucket, keyed by
/// `context_request_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextBuildResponse {
    #[serde(default)]
    pub payload: Option<ContextPayload>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Trigger published on `workflow.trigger.task-execution-loop`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecutionTrigger {
    pub task_id: String,
    pub slug: String,
    pub prompt: String,
    pub model: String,
    pub context_request_id: String,
    pub trace_id: String,
}

/// Outer envelope carried on every bus message (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub source: String,
    pub payload: T,
    pub trace_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageType {
    pub domain: String,
    pub category: String,
    pub version: u32,
}
