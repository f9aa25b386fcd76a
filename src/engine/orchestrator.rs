// Chain orchestrator: starts chain executions, dispatches steps and
// drives executions forward off the chain event channel

//! # Chain Orchestrator
//!
//! Chains run as sequential state machines with exactly one step in flight
//! per execution. Starting a chain creates the durable execution rows,
//! snapshots the ordered module list into the transient runtime state on
//! the bus and dispatches step 0 synchronously. Every later transition
//! arrives as a [`ChainEvent`] published by the result reconciler.
//!
//! ## The subscriber bridge
//!
//! Bus subscriptions block. [`ChainOrchestrator::run`] isolates the
//! blocking `next_message` loop on a dedicated subscriber thread and
//! forwards decoded events through an unbounded mpsc channel into a single
//! async dispatch loop. One consumer, one event at a time: two executions'
//! events never interleave their handling, which is what lets the store
//! run without row locking.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::bus::MessageBus;
use super::keys;
use super::registry::ModuleRegistry;
use super::storage::ExecutionStore;
use crate::models::{
    ChainEvent, ChainExecution, ChainRuntimeState, ModuleExecution, Task,
};
use crate::{ApkScopeError, Result};

pub struct ChainOrchestrator {
    bus: Arc<dyn MessageBus>,
    store: Arc<dyn ExecutionStore>,
    registry: Arc<ModuleRegistry>,
}

impl ChainOrchestrator {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        store: Arc<dyn ExecutionStore>,
        registry: Arc<ModuleRegistry>,
    ) -> Self {
        Self {
            bus,
            store,
            registry,
        }
    }

    /// Start a chain execution against an uploaded file.
    ///
    /// Creates the execution row plus one PENDING step row per module,
    /// writes the runtime state to the bus and dispatches step 0. Returns
    /// the execution id; a step-0 submission failure still returns the id,
    /// with the execution already recorded as FAILED.
    pub async fn start(&self, chain_name: &str, file_id: &str) -> Result<String> {
        let chain = self
            .store
            .get_chain(chain_name)
            .await?
            .ok_or_else(|| ApkScopeError::ChainNotFound(chain_name.to_string()))?;
        let scan = self
            .store
            .get_scan(file_id)
            .await?
            .ok_or_else(|| ApkScopeError::FileNotFound(file_id.to_string()))?;

        let ordered = chain.ordered_steps();
        if ordered.is_empty() {
            return Err(ApkScopeError::InvalidInput(format!(
                "chain \"{}\" has no steps",
                chain_name
            )));
        }

        let execution = ChainExecution::new(chain_name);
        let execution_id = execution.id.clone();

        // Dense step positions regardless of gaps in the definition orders
        let steps: Vec<ModuleExecution> = ordered
            .iter()
            .enumerate()
            .map(|(index, step)| {
                ModuleExecution::new(
                    &execution_id,
                    &step.module_name,
                    index,
                    step.parameters.clone(),
                )
            })
            .collect();
        self.store
            .create_execution_with_steps(execution, steps)
            .await?;

        // Snapshot of the module list; definition edits never touch an
        // in-flight execution
        let state = ChainRuntimeState {
            chain_execution_id: execution_id.clone(),
            chain_name: chain_name.to_string(),
            file_id: file_id.to_string(),
            file_name: scan.file_name.clone(),
            file_type: scan.file_type.clone(),
            folder_path: scan.folder_path.clone(),
            modules: chain.module_names(),
            current_index: 0,
            results: Default::default(),
        };
        self.bus
            .set_with_ttl(
                &keys::chain_state_key(&execution_id),
                &serde_json::to_string(&state)?,
                keys::CHAIN_STATE_TTL,
            )
            .await?;

        info!(chain = %chain_name, file_id = %file_id,
              chain_execution_id = %execution_id, modules = state.modules.len(),
              "chain execution started");
        self.dispatch_step(&state, 0).await?;
        Ok(execution_id)
    }

    /// Submit the task for one step and mark its row RUNNING.
    ///
    /// A silent submission failure (`Ok(None)` from the registry) fails the
    /// step and the whole execution: there is no result coming that could
    /// ever advance it.
    async fn dispatch_step(&self, state: &ChainRuntimeState, index: usize) -> Result<()> {
        let execution_id = &state.chain_execution_id;
        let Some(module_name) = state.modules.get(index) else {
            return Err(ApkScopeError::Internal(format!(
                "step index {} out of range for {}",
                index, execution_id
            )));
        };

        let row_id = ModuleExecution::id_for(execution_id, index);
        let mut row = self
            .store
            .get_module_execution(&row_id)
            .await?
            .ok_or_else(|| ApkScopeError::ExecutionNotFound(row_id.clone()))?;

        let mut task = Task::new(module_name.clone(), &state.file_id);
        task.file_name = state.file_name.clone();
        task.file_type = state.file_type.clone();
        task.folder_path = state.folder_path.clone();
        task.chain_execution_id = Some(execution_id.clone());
        task.parameters = row.parameters.clone();

        match self.registry.submit_task(task).await {
            Ok(Some(task_id)) => {
                row.start(task_id);
                self.store.update_module_execution(row).await?;
                debug!(chain_execution_id = %execution_id, module = %module_name,
                       step = index, "step dispatched");
                Ok(())
            }
            Ok(None) => {
                let reason = format!("task submission failed for {}", module_name);
                error!(chain_execution_id = %execution_id, step = index, "{}", reason);
                row.fail(reason.clone());
                self.store.update_module_execution(row).await?;
                self.fail_execution(execution_id, &reason).await?;
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                row.fail(reason.clone());
                self.store.update_module_execution(row).await?;
                self.fail_execution(execution_id, &reason).await?;
                Err(e)
            }
        }
    }

    /// Run the event dispatch loop until the bus shuts down.
    ///
    /// The blocking subscription lives on its own thread; decoded events
    /// flow through the channel and are handled strictly one at a time.
    ///
    /// Shutdown: aborting the dispatch task drops the receiver, and the
    /// subscriber thread exits on its next message (the failed send). While
    /// the bus stays silent the thread remains parked in `next_message`
    /// until process exit; it holds no state that needs a clean stop.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut subscription = self.bus.subscribe(keys::CHAIN_EVENTS_PATTERN).await?;
        let (sender, mut receiver) = mpsc::unbounded_channel::<ChainEvent>();

        std::thread::Builder::new()
            .name("chain-events-subscriber".to_string())
            .spawn(move || {
                while let Some(message) = subscription.next_message() {
                    match serde_json::from_str::<ChainEvent>(&message.payload) {
                        Ok(event) => {
                            // Receiver gone means the dispatch loop stopped
                            if sender.send(event).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(channel = %message.channel,
                                  "dropping malformed chain event: {}", e);
                        }
                    }
                }
                info!("chain event subscription closed");
            })
            .map_err(|e| {
                ApkScopeError::Internal(format!("failed to spawn subscriber thread: {}", e))
            })?;

        info!(pattern = keys::CHAIN_EVENTS_PATTERN, "chain event dispatch loop started");
        while let Some(event) = receiver.recv().await {
            if let Err(e) = self.handle_event(&event).await {
                error!(chain_execution_id = %event.chain_execution_id(),
                       "failed to handle chain event: {}", e);
            }
        }
        Ok(())
    }

    /// Spawn the dispatch loop onto the runtime
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    /// Apply one chain event
    pub async fn handle_event(&self, event: &ChainEvent) -> Result<()> {
        match event {
            ChainEvent::Advance {
                chain_execution_id,
                next_module_index,
                ..
            } => {
                let state_key = keys::chain_state_key(chain_execution_id);
                let Some(payload) = self.bus.get(&state_key).await? else {
                    // Expired or deleted runtime state; the durable rows
                    // stay as the record of where it stopped
                    warn!(chain_execution_id = %chain_execution_id,
                          "advance event for stranded execution, ignoring");
                    return Ok(());
                };
                let state: ChainRuntimeState = serde_json::from_str(&payload)?;

                if *next_module_index < state.modules.len() {
                    self.dispatch_step(&state, *next_module_index).await
                } else {
                    self.complete_execution(chain_execution_id).await
                }
            }
            ChainEvent::Complete { chain_execution_id } => {
                self.complete_execution(chain_execution_id).await
            }
            ChainEvent::Fail {
                chain_execution_id,
                reason,
            } => self.fail_execution(chain_execution_id, reason).await,
        }
    }

    async fn complete_execution(&self, execution_id: &str) -> Result<()> {
        match self.store.get_execution(execution_id).await? {
            Some(mut execution) => {
                execution.complete();
                self.store.update_execution(execution).await?;
            }
            None => {
                warn!(chain_execution_id = %execution_id,
                      "completion for unknown execution");
            }
        }
        self.bus
            .delete(&keys::chain_state_key(execution_id))
            .await?;
        info!(chain_execution_id = %execution_id, "chain execution completed");
        Ok(())
    }

    async fn fail_execution(&self, execution_id: &str, reason: &str) -> Result<()> {
        match self.store.get_execution(execution_id).await? {
            Some(mut execution) => {
                execution.fail(reason);
                self.store.update_execution(execution).await?;
            }
            None => {
                warn!(chain_execution_id = %execution_id, "failure for unknown execution");
            }
        }
        self.bus
            .delete(&keys::chain_state_key(execution_id))
            .await?;
        warn!(chain_execution_id = %execution_id, "chain execution failed: {}", reason);
        Ok(())
    }

    /// Re-derive every chain definition's step list from its persisted
    /// join rows, sorted by order. Run at startup; repairs definitions
    /// whose in-memory step ordering drifted from storage. Does not touch
    /// in-flight executions. Returns the number of relinked chains.
    pub async fn relink_definitions(&self) -> Result<usize> {
        let chains = self.store.list_chains().await?;
        let mut relinked = 0;
        for mut chain in chains {
            let steps = self.store.list_chain_steps(&chain.name).await?;
            chain.steps = steps;
            self.store.update_chain(chain).await?;
            relinked += 1;
        }
        info!(relinked, "chain definitions relinked");
        Ok(relinked)
    }

    /// Report executions stuck RUNNING whose runtime state is gone from
    /// the bus. They cannot advance; crash recovery is out of scope, so
    /// this only makes them visible. Returns the number found.
    pub async fn sweep_stranded_executions(&self) -> Result<usize> {
        let running = self.store.list_executions(None).await?;
        let mut stranded = 0;
        for execution in running {
            if execution.status != crate::models::ExecutionStatus::Running {
                continue;
            }
            let state_key = keys::chain_state_key(&execution.id);
            if self.bus.get(&state_key).await?.is_none() {
                warn!(chain_execution_id = %execution.id, chain = %execution.chain_name,
                      "stranded execution: RUNNING with no runtime state");
                stranded += 1;
            }
        }
        Ok(stranded)
    }

    // --- read accessors ---

    pub async fn execution(&self, execution_id: &str) -> Result<Option<ChainExecution>> {
        self.store.get_execution(execution_id).await
    }

    pub async fn executions(&self, chain_name: Option<&str>) -> Result<Vec<ChainExecution>> {
        self.store.list_executions(chain_name).await
    }

    /// An execution's step rows, in step order
    pub async fn execution_steps(&self, execution_id: &str) -> Result<Vec<ModuleExecution>> {
        self.store.list_module_executions(execution_id).await
    }
}
