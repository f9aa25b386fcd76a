// Chain definitions: named, ordered pipelines of analysis modules

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One step of a chain: which module runs, where in the sequence, and the
/// opaque parameters handed to the worker untouched by the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainStep {
    pub module_name: String,
    /// Defines the execution sequence. Values are expected to be unique
    /// within one chain; readers sort and tolerate gaps rather than reject
    /// them.
    pub order: i32,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
}

impl ChainStep {
    pub fn new(module_name: impl Into<String>, order: i32) -> Self {
        Self {
            module_name: module_name.into(),
            order,
            parameters: HashMap::new(),
        }
    }
}

/// A named analysis pipeline definition
///
/// Edits to a definition never affect in-flight executions: the orchestrator
/// snapshots the ordered module list into the chain runtime state at start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainDefinition {
    /// Unique, human-assigned name
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub steps: Vec<ChainStep>,
}

impl ChainDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            steps: Vec::new(),
        }
    }

    /// Add a step, returning self for fluent construction
    pub fn with_step(mut self, step: ChainStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Steps sorted by their order value. This is re-derived at every read;
    /// gapped or out-of-order definitions come back as a dense sequence.
    pub fn ordered_steps(&self) -> Vec<&ChainStep> {
        let mut steps: Vec<&ChainStep> = self.steps.iter().collect();
        steps.sort_by_key(|s| s.order);
        steps
    }

    /// Module names in execution order
    pub fn module_names(&self) -> Vec<String> {
        self.ordered_steps()
            .into_iter()
            .map(|s| s.module_name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_steps_sorts_by_order() {
        let chain = ChainDefinition::new("basic_scan")
            .with_step(ChainStep::new("apkid_module", 1))
            .with_step(ChainStep::new("jadx_module", 0));

        let names = chain.module_names();
        assert_eq!(names, vec!["jadx_module", "apkid_module"]);
    }

    #[test]
    fn ordered_steps_tolerates_gaps() {
        let chain = ChainDefinition::new("deep_scan")
            .with_step(ChainStep::new("ssdeep_module", 10))
            .with_step(ChainStep::new("jadx_module", 0))
            .with_step(ChainStep::new("apkid_module", 4));

        let names = chain.module_names();
        assert_eq!(names, vec!["jadx_module", "apkid_module", "ssdeep_module"]);
    }
}
