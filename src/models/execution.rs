// Durable execution records: one row per chain run, one row per step

//! # Execution Models
//!
//! [`ChainExecution`] and [`ModuleExecution`] are the audit trail of the
//! engine. They are created when a chain run is requested, mutated only by
//! the orchestrator and the reconciler, and never deleted. The transient
//! chain runtime state on the message bus is the working set; these rows are
//! the durable copy that survives it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Lifecycle status for chain executions and their steps
///
/// `PENDING → RUNNING → {COMPLETED | FAILED}`; terminal states are sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }
}

/// One run of a chain against one file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainExecution {
    /// Opaque execution token, `chain_<uuid>`
    pub id: String,
    /// Reference to the chain definition by name, not ownership
    pub chain_name: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl ChainExecution {
    /// Create a new execution, already RUNNING: step 0 is dispatched
    /// synchronously as part of chain start.
    pub fn new(chain_name: impl Into<String>) -> Self {
        Self {
            id: format!("chain_{}", Uuid::new_v4()),
            chain_name: chain_name.into(),
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            error_message: None,
        }
    }

    pub fn complete(&mut self) {
        self.status = ExecutionStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status = ExecutionStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.error_message = Some(reason.into());
    }
}

/// Durable record of one step of a chain execution
///
/// Exactly one step of a given chain is RUNNING at a time; the engine
/// enforces single-step-in-flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleExecution {
    /// `<chain_execution_id>_module_<order>`
    pub id: String,
    pub chain_execution_id: String,
    pub module_name: String,
    /// Dense step position within the execution's module snapshot
    pub order: usize,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Link to the task queue entry once submitted
    pub task_id: Option<String>,
    /// Opaque result payload mirrored from the worker's result record
    pub results: Option<serde_json::Value>,
    pub error_message: Option<String>,
}

impl ModuleExecution {
    pub fn new(
        chain_execution_id: &str,
        module_name: impl Into<String>,
        order: usize,
        parameters: HashMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            id: Self::id_for(chain_execution_id, order),
            chain_execution_id: chain_execution_id.to_string(),
            module_name: module_name.into(),
            order,
            status: ExecutionStatus::Pending,
            parameters,
            started_at: None,
            completed_at: None,
            task_id: None,
            results: None,
            error_message: None,
        }
    }

    /// Deterministic row id for a step of an execution
    pub fn id_for(chain_execution_id: &str, order: usize) -> String {
        format!("{}_module_{}", chain_execution_id, order)
    }

    /// Mark the step RUNNING with the submitted task id
    pub fn start(&mut self, task_id: impl Into<String>) {
        self.status = ExecutionStatus::Running;
        self.task_id = Some(task_id.into());
        self.started_at = Some(Utc::now());
    }

    pub fn complete(&mut self, results: serde_json::Value) {
        self.status = ExecutionStatus::Completed;
        self.results = Some(results);
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status = ExecutionStatus::Failed;
        self.error_message = Some(reason.into());
        self.completed_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_execution_lifecycle() {
        let mut execution = ChainExecution::new("basic_scan");
        assert!(execution.id.starts_with("chain_"));
        assert_eq!(execution.status, ExecutionStatus::Running);
        assert!(execution.completed_at.is_none());

        execution.complete();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert!(execution.completed_at.is_some());
        assert!(execution.status.is_terminal());
    }

    #[test]
    fn chain_execution_failure_records_reason() {
        let mut execution = ChainExecution::new("basic_scan");
        execution.fail("task submission failed for jadx_module");
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(
            execution.error_message.as_deref(),
            Some("task submission failed for jadx_module")
        );
    }

    #[test]
    fn module_execution_id_shape() {
        let execution = ModuleExecution::new("chain_abc", "jadx_module", 0, HashMap::new());
        assert_eq!(execution.id, "chain_abc_module_0");
        assert_eq!(execution.status, ExecutionStatus::Pending);
        assert_eq!(
            ModuleExecution::id_for("chain_abc", 3),
            "chain_abc_module_3"
        );
    }

    #[test]
    fn module_execution_start_records_task_link() {
        let mut execution = ModuleExecution::new("chain_abc", "jadx_module", 0, HashMap::new());
        execution.start("task-123");
        assert_eq!(execution.status, ExecutionStatus::Running);
        assert_eq!(execution.task_id.as_deref(), Some("task-123"));
        assert!(execution.started_at.is_some());
    }
}
