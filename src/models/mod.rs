// Domain models for the apkscope orchestration engine

//! # Domain Models
//!
//! Pure data types shared by every engine component:
//!
//! - `module`: per-module configuration and registry records, plus the
//!   per-file scan record the reconciler merges results into
//! - `chain`: chain definitions (named, ordered pipelines of modules)
//! - `execution`: durable audit rows for chain runs and their steps
//! - `task`: transient bus-carried shapes (tasks, worker results, the chain
//!   runtime working set, and the tagged chain event)
//!
//! Models carry no I/O. Everything here is `Serialize`/`Deserialize` because
//! it is persisted in the execution store or carried over the message bus.

pub mod chain;
pub mod execution;
pub mod module;
pub mod task;

pub use chain::{ChainDefinition, ChainStep};
pub use execution::{ChainExecution, ExecutionStatus, ModuleExecution};
pub use module::{Module, ModuleConfig, ScanRecord, ScanStatus};
pub use task::{ChainEvent, ChainRuntimeState, ModuleResult, Task};
