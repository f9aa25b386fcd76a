// apkscope Engine
// This contains the orchestration core: bus, storage, registry, reconciler
// and chain orchestrator

//! # apkscope Engine Module
//!
//! The engine is the layer between the domain models and the external world.
//! It is constructed once at process start as an explicit set of wired
//! components (no globals, no lazy singletons) and solves a distributed
//! coordination problem entirely through a shared key-value/pub-sub store.
//!
//! ## Engine Components
//!
//! ### Message Bus (`bus`, `nats_bus` modules)
//! - `MessageBus` trait: KV get/set-with-TTL, pattern scan, FIFO queue push,
//!   publish, and blocking pattern-subscribe
//! - `InMemoryBus` for development and tests
//! - `NatsBus` over JetStream KV buckets and core NATS pub/sub
//!
//! ### Execution Store (`storage` module)
//! - CRUD for chain definitions, chain/module execution rows and per-file
//!   scan records; the durable audit copy of everything the engine does
//!
//! ### Worker Runtime (`runtime` module)
//! - Opaque container lifecycle capability (`build_and_run`, `stop`,
//!   `status`) with a Docker-backed implementation
//!
//! ### Module Registry (`registry` module)
//! - Per-module configuration loading, concurrent worker startup with
//!   per-module failure isolation, and task submission
//!
//! ### Result Reconciler (`reconciler` module)
//! - Polling loop that drains worker result entries, merges them into scan
//!   records and module execution rows, and publishes chain-advance events
//!
//! ### Chain Orchestrator (`orchestrator` module)
//! - Chain lifecycle state machine and the bridge between the blocking bus
//!   subscription and the single-consumer async dispatch loop

pub mod bus;
pub mod keys;
pub mod nats_bus;
pub mod orchestrator;
pub mod reconciler;
pub mod registry;
pub mod runtime;
pub mod storage;

// Re-export main engine types for clean API access
pub use bus::{BusMessage, BusSubscription, InMemoryBus, MessageBus};
pub use nats_bus::{NatsBus, NatsBusConfig};
pub use orchestrator::ChainOrchestrator;
pub use reconciler::ResultReconciler;
pub use registry::ModuleRegistry;
pub use runtime::{DockerRuntime, WorkerRuntime, WorkerStatus};
pub use storage::{ExecutionStore, InMemoryExecutionStore};
