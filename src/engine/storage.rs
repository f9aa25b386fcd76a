// Execution store abstraction: durable rows for chains, executions,
// module executions, registered modules and per-file scan records

//! # Execution Store
//!
//! The store is the durable audit copy of everything the engine does. The
//! [`ExecutionStore`] trait defines the interface the engine consumes;
//! [`InMemoryExecutionStore`] is the default implementation for
//! development and testing, and a relational backend plugs in behind the
//! same trait.
//!
//! There is no row locking: concurrent writers to the same row apply
//! last-write-wins semantics. The engine's single-dispatch-loop design is
//! what keeps that safe in practice.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::models::{
    ChainDefinition, ChainExecution, ChainStep, Module, ModuleExecution, ScanRecord,
};
use crate::Result;

/// Storage trait for the engine's durable state
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    // --- chain definitions ---

    /// Store a chain definition (create or replace by name)
    async fn create_chain(&self, chain: ChainDefinition) -> Result<ChainDefinition>;

    /// Get a chain definition by name
    async fn get_chain(&self, name: &str) -> Result<Option<ChainDefinition>>;

    /// List all chain definitions
    async fn list_chains(&self) -> Result<Vec<ChainDefinition>>;

    /// Replace a chain definition
    async fn update_chain(&self, chain: ChainDefinition) -> Result<ChainDefinition>;

    /// The persisted chain-module join rows for a chain, sorted by order.
    /// Readers tolerate gapped order values.
    async fn list_chain_steps(&self, name: &str) -> Result<Vec<ChainStep>>;

    // --- registered modules ---

    /// Register or update a module's metadata
    async fn register_module(&self, module: Module) -> Result<Module>;

    /// Get a registered module by name
    async fn get_module(&self, name: &str) -> Result<Option<Module>>;

    /// List all registered modules
    async fn list_modules(&self) -> Result<Vec<Module>>;

    /// Existence check used as a submission precondition gate
    async fn module_exists(&self, name: &str) -> Result<bool>;

    // --- chain executions ---

    /// Persist a chain execution and all of its step rows atomically
    async fn create_execution_with_steps(
        &self,
        execution: ChainExecution,
        steps: Vec<ModuleExecution>,
    ) -> Result<ChainExecution>;

    /// Get a chain execution by id
    async fn get_execution(&self, id: &str) -> Result<Option<ChainExecution>>;

    /// Update a chain execution row
    async fn update_execution(&self, execution: ChainExecution) -> Result<ChainExecution>;

    /// List chain executions, optionally filtered by chain name
    async fn list_executions(&self, chain_name: Option<&str>) -> Result<Vec<ChainExecution>>;

    // --- module executions ---

    /// Get a module execution row by id
    async fn get_module_execution(&self, id: &str) -> Result<Option<ModuleExecution>>;

    /// Update a module execution row
    async fn update_module_execution(&self, execution: ModuleExecution) -> Result<ModuleExecution>;

    /// List a chain execution's step rows, sorted by step order
    async fn list_module_executions(
        &self,
        chain_execution_id: &str,
    ) -> Result<Vec<ModuleExecution>>;

    // --- per-file scan records ---

    /// Create a scan record for an uploaded file
    async fn create_scan(&self, scan: ScanRecord) -> Result<ScanRecord>;

    /// Get a file's scan record
    async fn get_scan(&self, file_id: &str) -> Result<Option<ScanRecord>>;

    /// Replace a file's scan record (read-merge-write, not transactional)
    async fn update_scan(&self, scan: ScanRecord) -> Result<ScanRecord>;
}

/// In-memory store implementation for development and testing
#[derive(Clone, Default)]
pub struct InMemoryExecutionStore {
    chains: Arc<RwLock<HashMap<String, ChainDefinition>>>,
    modules: Arc<RwLock<HashMap<String, Module>>>,
    executions: Arc<RwLock<HashMap<String, ChainExecution>>>,
    module_executions: Arc<RwLock<HashMap<String, ModuleExecution>>>,
    scans: Arc<RwLock<HashMap<String, ScanRecord>>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn create_chain(&self, chain: ChainDefinition) -> Result<ChainDefinition> {
        let mut chains = self.chains.write().await;
        chains.insert(chain.name.clone(), chain.clone());
        Ok(chain)
    }

    async fn get_chain(&self, name: &str) -> Result<Option<ChainDefinition>> {
        let chains = self.chains.read().await;
        Ok(chains.get(name).cloned())
    }

    async fn list_chains(&self) -> Result<Vec<ChainDefinition>> {
        let chains = self.chains.read().await;
        Ok(chains.values().cloned().collect())
    }

    async fn update_chain(&self, chain: ChainDefinition) -> Result<ChainDefinition> {
        let mut chains = self.chains.write().await;
        chains.insert(chain.name.clone(), chain.clone());
        Ok(chain)
    }

    async fn list_chain_steps(&self, name: &str) -> Result<Vec<ChainStep>> {
        let chains = self.chains.read().await;
        let mut steps: Vec<ChainStep> = chains
            .get(name)
            .map(|c| c.steps.clone())
            .unwrap_or_default();
        steps.sort_by_key(|s| s.order);
        Ok(steps)
    }

    async fn register_module(&self, module: Module) -> Result<Module> {
        let mut modules = self.modules.write().await;
        modules.insert(module.name.clone(), module.clone());
        Ok(module)
    }

    async fn get_module(&self, name: &str) -> Result<Option<Module>> {
        let modules = self.modules.read().await;
        Ok(modules.get(name).cloned())
    }

    async fn list_modules(&self) -> Result<Vec<Module>> {
        let modules = self.modules.read().await;
        Ok(modules.values().cloned().collect())
    }

    async fn module_exists(&self, name: &str) -> Result<bool> {
        let modules = self.modules.read().await;
        Ok(modules.contains_key(name))
    }

    async fn create_execution_with_steps(
        &self,
        execution: ChainExecution,
        steps: Vec<ModuleExecution>,
    ) -> Result<ChainExecution> {
        // Both maps held for the whole insert, the in-memory equivalent of
        // one transaction
        let mut executions = self.executions.write().await;
        let mut module_executions = self.module_executions.write().await;
        executions.insert(execution.id.clone(), execution.clone());
        for step in steps {
            module_executions.insert(step.id.clone(), step);
        }
        Ok(execution)
    }

    async fn get_execution(&self, id: &str) -> Result<Option<ChainExecution>> {
        let executions = self.executions.read().await;
        Ok(executions.get(id).cloned())
    }

    async fn update_execution(&self, execution: ChainExecution) -> Result<ChainExecution> {
        let mut executions = self.executions.write().await;
        executions.insert(execution.id.clone(), execution.clone());
        Ok(execution)
    }

    async fn list_executions(&self, chain_name: Option<&str>) -> Result<Vec<ChainExecution>> {
        let executions = self.executions.read().await;
        Ok(executions
            .values()
            .filter(|e| chain_name.map_or(true, |name| e.chain_name == name))
            .cloned()
            .collect())
    }

    async fn get_module_execution(&self, id: &str) -> Result<Option<ModuleExecution>> {
        let module_executions = self.module_executions.read().await;
        Ok(module_executions.get(id).cloned())
    }

    async fn update_module_execution(&self, execution: ModuleExecution) -> Result<ModuleExecution> {
        let mut module_executions = self.module_executions.write().await;
        module_executions.insert(execution.id.clone(), execution.clone());
        Ok(execution)
    }

    async fn list_module_executions(
        &self,
        chain_execution_id: &str,
    ) -> Result<Vec<ModuleExecution>> {
        let module_executions = self.module_executions.read().await;
        let mut rows: Vec<ModuleExecution> = module_executions
            .values()
            .filter(|e| e.chain_execution_id == chain_execution_id)
            .cloned()
            .collect();
        rows.sort_by_key(|e| e.order);
        Ok(rows)
    }

    async fn create_scan(&self, scan: ScanRecord) -> Result<ScanRecord> {
        let mut scans = self.scans.write().await;
        scans.insert(scan.file_id.clone(), scan.clone());
        Ok(scan)
    }

    async fn get_scan(&self, file_id: &str) -> Result<Option<ScanRecord>> {
        let scans = self.scans.read().await;
        Ok(scans.get(file_id).cloned())
    }

    async fn update_scan(&self, scan: ScanRecord) -> Result<ScanRecord> {
        let mut scans = self.scans.write().await;
        scans.insert(scan.file_id.clone(), scan.clone());
        Ok(scan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::chain::ChainStep;

    #[tokio::test]
    async fn chain_steps_come_back_ordered() {
        let store = InMemoryExecutionStore::new();
        let chain = ChainDefinition::new("deep_scan")
            .with_step(ChainStep::new("apkid_module", 5))
            .with_step(ChainStep::new("jadx_module", 0));
        store.create_chain(chain).await.unwrap();

        let steps = store.list_chain_steps("deep_scan").await.unwrap();
        assert_eq!(steps[0].module_name, "jadx_module");
        assert_eq!(steps[1].module_name, "apkid_module");
    }

    #[tokio::test]
    async fn execution_with_steps_is_atomic_and_ordered() {
        let store = InMemoryExecutionStore::new();
        let execution = ChainExecution::new("basic_scan");
        let id = execution.id.clone();
        let steps = vec![
            ModuleExecution::new(&id, "apkid_module", 1, HashMap::new()),
            ModuleExecution::new(&id, "jadx_module", 0, HashMap::new()),
        ];
        store
            .create_execution_with_steps(execution, steps)
            .await
            .unwrap();

        let rows = store.list_module_executions(&id).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].module_name, "jadx_module");
        assert_eq!(rows[1].module_name, "apkid_module");
        assert!(store.get_execution(&id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn module_existence_gate() {
        let store = InMemoryExecutionStore::new();
        assert!(!store.module_exists("jadx_module").await.unwrap());

        let config = crate::models::ModuleConfig::new("jadx_module");
        store
            .register_module(Module::from_config(&config))
            .await
            .unwrap();
        assert!(store.module_exists("jadx_module").await.unwrap());
    }
}
