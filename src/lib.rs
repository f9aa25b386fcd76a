// apkscope - mobile-application security analysis platform
// Task/chain orchestration engine: dispatches work to analysis modules and
// tracks multi-step pipelines as a sequential state machine

//! # apkscope Library
//!
//! This is the library crate for the apkscope orchestration engine. Uploaded
//! binaries are processed by independently deployed analysis workers
//! ("modules": decompilers, signature scanners, dynamic-instrumentation
//! helpers). This crate owns the coordination core:
//!
//! - **Module Registry & Worker Lifecycle**: per-module configuration, one
//!   running worker container per active module, task submission
//! - **Result Reconciler**: polling loop that drains worker results, merges
//!   them into durable per-file scan state and emits chain-advance events
//! - **Chain Orchestrator**: chain lifecycle (start, advance, complete,
//!   fail), durable execution records, and the bridge between the blocking
//!   bus subscription and the async dispatch loop
//!
//! ## Architecture Overview
//!
//! ```text
//! caller
//!   ↓ start(chain, file)
//! ChainOrchestrator ──→ ModuleRegistry.submit_task ──→ MessageBus (FIFO queue)
//!   ↑                                                      ↓
//!   │ dispatch loop                              (external worker container)
//!   │ ← mpsc bridge ← subscriber thread                    ↓
//!   └── advance event ←── ResultReconciler ←── result keys on the bus
//! ```
//!
//! The message bus is the only shared mutable resource between processes;
//! the [`ExecutionStore`] holds the durable audit copy (chain and
//! per-step execution rows plus per-file scan records).

// Core domain models (chains, executions, tasks, scan records)
pub mod models;

// Engine implementations (bus, storage, registry, reconciler, orchestrator)
pub mod engine;

// Re-export core domain types for easy access
pub use models::{
    ChainDefinition,   // Named, ordered pipeline of modules
    ChainEvent,        // Tagged advance/complete/fail event on the bus
    ChainExecution,    // One durable run of a chain against one file
    ChainRuntimeState, // Transient working set the dispatch loop reads
    ChainStep,         // One (module, order, parameters) entry of a chain
    ExecutionStatus,   // PENDING / RUNNING / COMPLETED / FAILED
    Module,            // Registered analysis worker metadata
    ModuleConfig,      // Per-module configuration file contents
    ModuleExecution,   // Durable per-step execution row
    ModuleResult,      // Output a worker writes back after a task
    ScanRecord,        // Per-file scan status and per-module results
    ScanStatus,        // Overall file scan status
    Task,              // Transient unit of work on a module queue
};

// Re-export engine types for convenience
pub use engine::{
    bus::{BusMessage, BusSubscription, InMemoryBus, MessageBus},
    nats_bus::{NatsBus, NatsBusConfig},
    orchestrator::ChainOrchestrator,
    reconciler::ResultReconciler,
    registry::ModuleRegistry,
    runtime::{DockerRuntime, WorkerRuntime, WorkerStatus},
    storage::{ExecutionStore, InMemoryExecutionStore},
};

use thiserror::Error;

/// Custom error types for apkscope engine operations
#[derive(Error, Debug)]
pub enum ApkScopeError {
    /// A chain definition could not be found
    #[error("Chain not found: {0}")]
    ChainNotFound(String),

    /// A module is unknown or not registered
    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    /// A file has no scan record
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// A chain or module execution row could not be found
    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    /// Error when invalid input is provided
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Message-bus errors (NATS connection, KV bucket, publish)
    /// Using anyhow::Error for flexible handling across bus backends
    #[error("Bus error: {0}")]
    Bus(anyhow::Error),

    /// Storage-related errors
    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Worker runtime (container lifecycle) errors
    #[error("Worker runtime error: {0}")]
    Runtime(String),

    /// Internal engine error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for ApkScopeError {
    fn from(err: std::io::Error) -> Self {
        ApkScopeError::Internal(err.to_string())
    }
}

/// Type alias for Results that use our custom error type
pub type Result<T> = std::result::Result<T, ApkScopeError>;
