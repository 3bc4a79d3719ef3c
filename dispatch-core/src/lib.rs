//! Task Dispatch & Execution Core.
//!
//! Given a plan with phases and tasks, computes an execution order that
//! respects both phase-level and intra-phase dependencies, assembles
//! per-task context from the knowledge graph in parallel with execution,
//! obeys a global concurrency cap, correlates asynchronous replies across
//! the message bus, and produces a per-batch result with exact counts.

pub mod bus;
pub mod config;
pub mod consumer;
pub mod context;
pub mod error;
pub mod graph;
pub mod kv;
pub mod orchestrator;
pub mod plan;
pub mod registry;
pub mod scheduler;
pub mod types;

pub use bus::Bus;
pub use config::DispatchConfig;
pub use consumer::{BatchConsumer, ConsumerState, Resolution, ResultPublisher};
pub use context::ContextAssembler;
pub use error::DispatchError;
pub use graph::{DependencyGraph, Node};
pub use kv::ContextKv;
pub use orchestrator::PhaseOrchestrator;
pub use registry::{ModelRegistry, PayloadRegistry};
pub use scheduler::{BatchStats, DispatchScheduler};
pub use types::*;
