// Transient bus-carried shapes: tasks, worker results, chain runtime state
// and the tagged chain event

//! # Task & Event Models
//!
//! Everything in this module lives on the message bus, not in the execution
//! store. Tasks carry a short TTL (≈1 h) and exist only long enough for a
//! worker to read them; the chain runtime state carries a multi-hour TTL
//! (≈24 h) and is the single source of truth the dispatch loop reads to
//! decide the next step. Worker results carry no TTL and rely on the
//! reconciler to delete them after merging.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// One unit of work handed to a single module's queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub file_id: String,
    pub file_name: String,
    pub file_type: String,
    pub folder_path: String,
    pub module_name: String,
    /// Present when the task belongs to an in-flight chain execution
    pub chain_execution_id: Option<String>,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
}

impl Task {
    pub fn new(module_name: impl Into<String>, file_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            file_id: file_id.into(),
            file_name: String::new(),
            file_type: String::new(),
            folder_path: String::new(),
            module_name: module_name.into(),
            chain_execution_id: None,
            parameters: HashMap::new(),
        }
    }
}

/// The output a worker writes back after processing a task
///
/// Identity on the bus is `result:<module_name>:<file_id>`; produced exactly
/// once per task, consumed at-most-once by the reconciler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleResult {
    /// Worker-reported status; anything other than "success" marks the step
    /// and the file scan as failed
    pub status: String,
    #[serde(default)]
    pub results: serde_json::Value,
    #[serde(default)]
    pub error: Option<String>,
}

impl ModuleResult {
    pub fn succeeded(&self) -> bool {
        self.status == "success"
    }
}

/// Transient working set of one chain execution
///
/// Stored under `chain:<execution_id>` with the runtime TTL. The module list
/// is a snapshot taken at chain start; later edits to the chain definition
/// never affect an in-flight execution. Must be kept consistent with the
/// durable ModuleExecution rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainRuntimeState {
    pub chain_execution_id: String,
    pub chain_name: String,
    pub file_id: String,
    pub file_name: String,
    pub file_type: String,
    pub folder_path: String,
    /// Ordered module-name snapshot
    pub modules: Vec<String>,
    /// Dense index of the step currently awaiting a result
    pub current_index: usize,
    /// Accumulated per-module result payloads
    #[serde(default)]
    pub results: HashMap<String, serde_json::Value>,
}

impl ChainRuntimeState {
    /// Name of the module the execution is currently waiting on, if any
    pub fn current_module(&self) -> Option<&str> {
        self.modules.get(self.current_index).map(|m| m.as_str())
    }

    /// True once every step has produced a result
    pub fn is_exhausted(&self) -> bool {
        self.current_index >= self.modules.len()
    }
}

/// Event published on a chain execution's event channel
///
/// A closed set of variants rather than free-form JSON: the reconciler
/// produces `Advance`, the orchestrator reacts to all three.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChainEvent {
    /// A step's result was reconciled; the next step should be dispatched
    Advance {
        chain_execution_id: String,
        /// Step whose result was just merged
        module_index: usize,
        /// Step to dispatch next (== len(modules) means the chain is done)
        next_module_index: usize,
        file_id: String,
    },
    /// Explicit completion request for an execution
    Complete { chain_execution_id: String },
    /// Explicit failure request for an execution
    Fail {
        chain_execution_id: String,
        reason: String,
    },
}

impl ChainEvent {
    pub fn chain_execution_id(&self) -> &str {
        match self {
            ChainEvent::Advance {
                chain_execution_id, ..
            }
            | ChainEvent::Complete { chain_execution_id }
            | ChainEvent::Fail {
                chain_execution_id, ..
            } => chain_execution_id,
        }
    }
}
