//! Loads a plan's tasks and (if present) phases from
//! `<repo>/.semspec/changes/<slug>/{tasks.json,phases.json}` (§6). Read-only
//! to the core; never mutated in place.

use std::path::Path;

use crate::error::DispatchError;
use crate::types::{Phase, Plan, Task};

pub fn load_plan(repo_root: &Path, slug: &str) -> Result<Plan, DispatchError> {
    let dir = repo_root.join(".semspec").join("changes").join(slug);
    let tasks_path = dir.join("tasks.json");
    let phases_path = dir.join("phases.json");

    let tasks_raw = std::fs::read_to_string(&tasks_path)
        .map_err(|e| DispatchError::PlanLoad(format!("{}: {e}", tasks_path.display())))?;
    let tasks: Vec<Task> = serde_json::from_str(&tasks_raw)?;

    let phases: Vec<Phase> = match std::fs::read_to_string(&phases_path) {
        Ok(raw) => serde_json::from_str(&raw)?,
        Err(_) => Vec::new(),
    };

    Ok(Plan {
        slug: slug.to_string(),
        tasks,
        phases,
    })
}
