//! Process-wide read-only registries, injected as `Arc`s rather than held as
//! globals (§9 design note), following the teacher's
//! `Arc<HashMap<String, WorkflowDefinition>>` pattern for definitions shared
//! across an engine (`OnboardingOrchestrator`/`WorkflowEngine`).

use std::collections::HashMap;

/// Task type -> resolved model + ordered fallback chain.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    by_task_type: HashMap<String, (String, Vec<String>)>,
    default_model: String,
}

impl ModelRegistry {
    pub fn new(default_model: impl Into<String>) -> Self {
        Self {
            by_task_type: HashMap::new(),
            default_model: default_model.into(),
        }
    }

    pub fn register(
        &mut self,
        task_type: impl Into<String>,
        model: impl Into<String>,
        fallback_models: Vec<String>,
    ) {
        self.by_task_type
            .insert(task_type.into(), (model.into(), fallback_models));
    }

    /// Resolves a task type to `(model, fallback_models)`, falling back to
    /// the registry default with no fallback chain when unregistered.
    pub fn resolve(&self, task_type: &str) -> (String, Vec<String>) {
        self.by_task_type
            .get(task_type)
            .cloned()
            .unwrap_or_else(|| (self.default_model.clone(), Vec::new()))
    }
}

/// Decoder registered per envelope variant `{domain, category, version}`
/// (§9's "dynamic payload dispatch" design note): unknown variants log and
/// drop rather than crash. The registry itself only tracks which variants
/// are known; decoding happens at the call site with `serde_json`.
#[derive(Debug, Clone, Default)]
pub struct PayloadRegistry {
    known_variants: std::collections::HashSet<(String, String, u32)>,
}

impl PayloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, domain: &str, category: &str, version: u32) {
        self.known_variants
            .insert((domain.to_string(), category.to_string(), version));
    }

    pub fn is_known(&self, domain: &str, category: &str, version: u32) -> bool {
        self.known_variants
            .contains(&(domain.to_string(), category.to_string(), version))
    }
}
