// Result reconciler: drains worker results from the bus into durable
// scan state and emits chain-advance events

//! # Result Reconciler
//!
//! A single polling loop (≈2 s interval) that repeatedly scans the bus for
//! pending `result:<module>:<file>` entries and, for each one:
//!
//! 1. merges the result into the file's persisted scan record,
//! 2. best-effort removes pending task records for the same pair,
//! 3. deletes the consumed result entry (at-most-once consumption,
//!    no redelivery),
//! 4. advances any in-flight chain currently waiting on that module and
//!    publishes the advance event.
//!
//! This loop is the only writer of chain-advance events and never blocks
//! on the orchestrator. Scanning runs without locks: result keys are only
//! ever created once and deleted once.
//!
//! A result whose payload does not parse is logged and left in place; it
//! will be re-examined on every poll until an operator removes it.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::bus::MessageBus;
use super::keys;
use super::storage::ExecutionStore;
use crate::models::{ChainEvent, ChainRuntimeState, ModuleExecution, ModuleResult, ScanStatus, Task};
use crate::Result;

/// Default poll interval for the reconciler loop
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct ResultReconciler {
    bus: Arc<dyn MessageBus>,
    store: Arc<dyn ExecutionStore>,
    poll_interval: Duration,
}

impl ResultReconciler {
    pub fn new(bus: Arc<dyn MessageBus>, store: Arc<dyn ExecutionStore>) -> Self {
        Self {
            bus,
            store,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Run the polling loop forever. Poll errors are logged, never fatal.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_ms = self.poll_interval.as_millis() as u64, "result reconciler started");
        loop {
            ticker.tick().await;
            if let Err(e) = self.poll_once().await {
                warn!("result poll failed: {}", e);
            }
        }
    }

    /// Spawn the loop onto the runtime
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// One reconciliation pass. Returns the number of results merged.
    pub async fn poll_once(&self) -> Result<usize> {
        let result_keys = self.bus.scan(keys::RESULT_KEY_PATTERN).await?;
        let mut merged = 0;

        for key in result_keys {
            let Some((module_name, file_id)) = keys::parse_result_key(&key) else {
                warn!(key = %key, "unparseable result key, skipping");
                continue;
            };

            // A concurrently consumed key comes back empty; nothing to do
            let Some(payload) = self.bus.get(&key).await? else {
                continue;
            };

            let result: ModuleResult = match serde_json::from_str(&payload) {
                Ok(result) => result,
                Err(e) => {
                    warn!(key = %key, "malformed result payload, leaving in place: {}", e);
                    continue;
                }
            };

            self.merge_scan_result(&module_name, &file_id, &result).await;
            self.cleanup_pending_tasks(&module_name, &file_id).await;

            // At-most-once consumption: once deleted the result is gone even
            // if a later step fails
            self.bus.delete(&key).await?;

            self.advance_waiting_chains(&module_name, &file_id, &result)
                .await?;
            merged += 1;
        }

        Ok(merged)
    }

    /// Read-merge-write of the module's result into the file's scan record.
    /// Not transactional; the single-reconciler deployment is what keeps
    /// concurrent merges off the same file.
    async fn merge_scan_result(&self, module_name: &str, file_id: &str, result: &ModuleResult) {
        match self.store.get_scan(file_id).await {
            Ok(Some(mut scan)) => {
                scan.results
                    .insert(module_name.to_string(), result.results.clone());
                scan.status = if result.succeeded() {
                    ScanStatus::Completed
                } else {
                    ScanStatus::Failed
                };
                scan.updated_at = chrono::Utc::now();
                if let Err(e) = self.store.update_scan(scan).await {
                    warn!(module = %module_name, file_id = %file_id,
                          "failed to persist merged scan result: {}", e);
                }
            }
            Ok(None) => {
                warn!(module = %module_name, file_id = %file_id,
                      "result for a file with no scan record");
            }
            Err(e) => {
                warn!(module = %module_name, file_id = %file_id,
                      "failed to read scan record: {}", e);
            }
        }
    }

    /// Best-effort removal of pending task records for the same
    /// `(file, module)` pair
    async fn cleanup_pending_tasks(&self, module_name: &str, file_id: &str) {
        let task_keys = match self.bus.scan(keys::TASK_KEY_PATTERN).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!("task cleanup scan failed: {}", e);
                return;
            }
        };

        for task_key in task_keys {
            let Ok(Some(payload)) = self.bus.get(&task_key).await else {
                continue;
            };
            let task: Task = match serde_json::from_str(&payload) {
                Ok(task) => task,
                Err(e) => {
                    // Malformed task records stay in place until their TTL
                    // clears them
                    warn!(key = %task_key, "malformed task record: {}", e);
                    continue;
                }
            };
            if task.file_id == file_id && task.module_name == module_name {
                if let Err(e) = self.bus.delete(&task_key).await {
                    warn!(key = %task_key, "task cleanup delete failed: {}", e);
                }
            }
        }
    }

    /// Find in-flight chains waiting on this exact module, mirror the
    /// result into their step row, bump the runtime state and publish the
    /// advance event.
    ///
    /// The advance event is published regardless of the step's own status:
    /// a failed step is recorded as FAILED but the chain still moves on.
    async fn advance_waiting_chains(
        &self,
        module_name: &str,
        file_id: &str,
        result: &ModuleResult,
    ) -> Result<()> {
        let state_keys = self.bus.scan(keys::CHAIN_STATE_KEY_PATTERN).await?;

        for state_key in state_keys {
            let Some(payload) = self.bus.get(&state_key).await? else {
                continue;
            };
            let mut state: ChainRuntimeState = match serde_json::from_str(&payload) {
                Ok(state) => state,
                Err(e) => {
                    warn!(key = %state_key, "malformed chain runtime state: {}", e);
                    continue;
                }
            };

            if state.file_id != file_id || state.current_module() != Some(module_name) {
                continue;
            }

            let module_index = state.current_index;
            self.mirror_step_result(&state, module_index, result).await;

            state
                .results
                .insert(module_name.to_string(), result.results.clone());
            state.current_index = module_index + 1;

            // The result is already consumed, so a failure on either write
            // below strands this execution: no event will ever dispatch its
            // next step. Name it loudly and keep reconciling other chains;
            // the startup sweep reports the leftover RUNNING row.
            if let Err(e) = self
                .bus
                .set_with_ttl(
                    &state_key,
                    &serde_json::to_string(&state)?,
                    keys::CHAIN_STATE_TTL,
                )
                .await
            {
                error!(chain_execution_id = %state.chain_execution_id, module = %module_name,
                       "runtime state write failed after result consumption, \
                        execution is stranded: {}", e);
                continue;
            }

            let event = ChainEvent::Advance {
                chain_execution_id: state.chain_execution_id.clone(),
                module_index,
                next_module_index: module_index + 1,
                file_id: file_id.to_string(),
            };
            if let Err(e) = self
                .bus
                .publish(
                    &keys::chain_events_channel(&state.chain_execution_id),
                    &serde_json::to_string(&event)?,
                )
                .await
            {
                error!(chain_execution_id = %state.chain_execution_id, module = %module_name,
                       "advance event publish failed, execution is stranded: {}", e);
                continue;
            }
            debug!(chain_execution_id = %state.chain_execution_id,
                   module = %module_name, next = module_index + 1, "advance event published");
        }

        Ok(())
    }

    /// Mirror a reconciled result into the step's durable execution row
    async fn mirror_step_result(
        &self,
        state: &ChainRuntimeState,
        module_index: usize,
        result: &ModuleResult,
    ) {
        let row_id = ModuleExecution::id_for(&state.chain_execution_id, module_index);
        match self.store.get_module_execution(&row_id).await {
            Ok(Some(mut row)) => {
                if result.succeeded() {
                    row.complete(result.results.clone());
                } else {
                    let reason = result
                        .error
                        .clone()
                        .unwrap_or_else(|| format!("module reported status \"{}\"", result.status));
                    warn!(chain_execution_id = %state.chain_execution_id,
                          module = %row.module_name, "step failed: {}", reason);
                    row.fail(reason);
                }
                if let Err(e) = self.store.update_module_execution(row).await {
                    warn!(row_id = %row_id, "failed to persist step result: {}", e);
                }
            }
            Ok(None) => {
                warn!(row_id = %row_id, "no module execution row for reconciled result");
            }
            Err(e) => {
                warn!(row_id = %row_id, "failed to read module execution row: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::bus::InMemoryBus;
    use crate::engine::storage::InMemoryExecutionStore;
    use crate::models::{ChainExecution, ScanRecord};
    use std::collections::HashMap;

    struct Fixture {
        bus: Arc<InMemoryBus>,
        store: Arc<InMemoryExecutionStore>,
        reconciler: ResultReconciler,
    }

    fn fixture() -> Fixture {
        let bus = Arc::new(InMemoryBus::new());
        let store = Arc::new(InMemoryExecutionStore::new());
        let reconciler = ResultReconciler::new(bus.clone(), store.clone());
        Fixture {
            bus,
            store,
            reconciler,
        }
    }

    async fn seed_scan(store: &InMemoryExecutionStore, file_id: &str) {
        store
            .create_scan(ScanRecord::new(file_id, "app.apk", "apk", "/uploads"))
            .await
            .unwrap();
    }

    async fn write_result(bus: &InMemoryBus, module: &str, file_id: &str, payload: &str) {
        bus.set_with_ttl(&keys::result_key(module, file_id), payload, Duration::ZERO)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn merges_result_into_scan_record() {
        let f = fixture();
        seed_scan(&f.store, "abc123").await;
        write_result(
            &f.bus,
            "jadx_module",
            "abc123",
            r#"{"status": "success", "results": {"classes": 42}}"#,
        )
        .await;

        assert_eq!(f.reconciler.poll_once().await.unwrap(), 1);

        let scan = f.store.get_scan("abc123").await.unwrap().unwrap();
        assert_eq!(scan.status, ScanStatus::Completed);
        assert_eq!(scan.results["jadx_module"]["classes"], 42);
    }

    #[tokio::test]
    async fn failed_result_marks_scan_failed() {
        let f = fixture();
        seed_scan(&f.store, "abc123").await;
        write_result(
            &f.bus,
            "jadx_module",
            "abc123",
            r#"{"status": "error", "error": "jadx crashed"}"#,
        )
        .await;

        f.reconciler.poll_once().await.unwrap();
        let scan = f.store.get_scan("abc123").await.unwrap().unwrap();
        assert_eq!(scan.status, ScanStatus::Failed);
    }

    #[tokio::test]
    async fn consumption_is_at_most_once() {
        let f = fixture();
        seed_scan(&f.store, "abc123").await;
        write_result(&f.bus, "jadx_module", "abc123", r#"{"status": "success"}"#).await;

        assert_eq!(f.reconciler.poll_once().await.unwrap(), 1);
        // Result key is gone; a second poll merges nothing
        assert!(f
            .bus
            .get(&keys::result_key("jadx_module", "abc123"))
            .await
            .unwrap()
            .is_none());
        assert_eq!(f.reconciler.poll_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn malformed_payload_is_left_in_place() {
        let f = fixture();
        seed_scan(&f.store, "abc123").await;
        write_result(&f.bus, "jadx_module", "abc123", "{not json").await;

        assert_eq!(f.reconciler.poll_once().await.unwrap(), 0);
        // Still there for the next poll (and the next...)
        assert!(f
            .bus
            .get(&keys::result_key("jadx_module", "abc123"))
            .await
            .unwrap()
            .is_some());
        let scan = f.store.get_scan("abc123").await.unwrap().unwrap();
        assert_eq!(scan.status, ScanStatus::Pending);
    }

    #[tokio::test]
    async fn pending_tasks_for_the_pair_are_cleaned_up() {
        let f = fixture();
        seed_scan(&f.store, "abc123").await;

        let task = Task::new("jadx_module", "abc123");
        let matching_key = keys::task_key(&task.id);
        f.bus
            .set_with_ttl(
                &matching_key,
                &serde_json::to_string(&task).unwrap(),
                Duration::ZERO,
            )
            .await
            .unwrap();
        let other = Task::new("apkid_module", "abc123");
        let other_key = keys::task_key(&other.id);
        f.bus
            .set_with_ttl(
                &other_key,
                &serde_json::to_string(&other).unwrap(),
                Duration::ZERO,
            )
            .await
            .unwrap();

        write_result(&f.bus, "jadx_module", "abc123", r#"{"status": "success"}"#).await;
        f.reconciler.poll_once().await.unwrap();

        assert!(f.bus.get(&matching_key).await.unwrap().is_none());
        assert!(f.bus.get(&other_key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn waiting_chain_is_advanced_and_event_published() {
        let f = fixture();
        seed_scan(&f.store, "abc123").await;

        // Durable rows for the in-flight execution
        let execution = ChainExecution::new("basic_scan");
        let execution_id = execution.id.clone();
        let steps = vec![
            ModuleExecution::new(&execution_id, "jadx_module", 0, HashMap::new()),
            ModuleExecution::new(&execution_id, "apkid_module", 1, HashMap::new()),
        ];
        f.store
            .create_execution_with_steps(execution, steps)
            .await
            .unwrap();

        let state = ChainRuntimeState {
            chain_execution_id: execution_id.clone(),
            chain_name: "basic_scan".to_string(),
            file_id: "abc123".to_string(),
            file_name: "app.apk".to_string(),
            file_type: "apk".to_string(),
            folder_path: "/uploads".to_string(),
            modules: vec!["jadx_module".to_string(), "apkid_module".to_string()],
            current_index: 0,
            results: HashMap::new(),
        };
        f.bus
            .set_with_ttl(
                &keys::chain_state_key(&execution_id),
                &serde_json::to_string(&state).unwrap(),
                Duration::ZERO,
            )
            .await
            .unwrap();

        let mut subscription = f.bus.subscribe(keys::CHAIN_EVENTS_PATTERN).await.unwrap();
        write_result(
            &f.bus,
            "jadx_module",
            "abc123",
            r#"{"status": "success", "results": {"classes": 42}}"#,
        )
        .await;
        f.reconciler.poll_once().await.unwrap();

        // Runtime state advanced with the result accumulated
        let raw = f
            .bus
            .get(&keys::chain_state_key(&execution_id))
            .await
            .unwrap()
            .unwrap();
        let updated: ChainRuntimeState = serde_json::from_str(&raw).unwrap();
        assert_eq!(updated.current_index, 1);
        assert_eq!(updated.results["jadx_module"]["classes"], 42);

        // Step row mirrored as completed
        let row = f
            .store
            .get_module_execution(&ModuleExecution::id_for(&execution_id, 0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, crate::models::ExecutionStatus::Completed);

        // Advance event on the execution's channel
        let message = subscription.next_message().unwrap();
        assert_eq!(message.channel, keys::chain_events_channel(&execution_id));
        let event: ChainEvent = serde_json::from_str(&message.payload).unwrap();
        match event {
            ChainEvent::Advance {
                module_index,
                next_module_index,
                ..
            } => {
                assert_eq!(module_index, 0);
                assert_eq!(next_module_index, 1);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn publish_failure_strands_one_chain_without_aborting_the_poll() {
        let f = fixture();
        seed_scan(&f.store, "abc123").await;

        let execution = ChainExecution::new("basic_scan");
        let execution_id = execution.id.clone();
        let steps = vec![ModuleExecution::new(
            &execution_id,
            "jadx_module",
            0,
            HashMap::new(),
        )];
        f.store
            .create_execution_with_steps(execution, steps)
            .await
            .unwrap();

        let state = ChainRuntimeState {
            chain_execution_id: execution_id.clone(),
            chain_name: "basic_scan".to_string(),
            file_id: "abc123".to_string(),
            file_name: "app.apk".to_string(),
            file_type: "apk".to_string(),
            folder_path: "/uploads".to_string(),
            modules: vec!["jadx_module".to_string()],
            current_index: 0,
            results: HashMap::new(),
        };
        f.bus
            .set_with_ttl(
                &keys::chain_state_key(&execution_id),
                &serde_json::to_string(&state).unwrap(),
                Duration::ZERO,
            )
            .await
            .unwrap();

        f.bus.fail_writes_matching(Some("chain.events."));
        write_result(&f.bus, "jadx_module", "abc123", r#"{"status": "success"}"#).await;

        // The poll itself still succeeds and the result is consumed
        assert_eq!(f.reconciler.poll_once().await.unwrap(), 1);
        assert!(f
            .bus
            .get(&keys::result_key("jadx_module", "abc123"))
            .await
            .unwrap()
            .is_none());

        // The durable mirror and the runtime state kept their progress;
        // only the event is lost, leaving the chain for the startup sweep
        let row = f
            .store
            .get_module_execution(&ModuleExecution::id_for(&execution_id, 0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, crate::models::ExecutionStatus::Completed);
        let raw = f
            .bus
            .get(&keys::chain_state_key(&execution_id))
            .await
            .unwrap()
            .unwrap();
        let updated: ChainRuntimeState = serde_json::from_str(&raw).unwrap();
        assert_eq!(updated.current_index, 1);

        // Later polls are unaffected
        assert_eq!(f.reconciler.poll_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unrelated_chain_is_not_advanced() {
        let f = fixture();
        seed_scan(&f.store, "abc123").await;

        let state = ChainRuntimeState {
            chain_execution_id: "chain_other".to_string(),
            chain_name: "basic_scan".to_string(),
            file_id: "other_file".to_string(),
            file_name: "other.apk".to_string(),
            file_type: "apk".to_string(),
            folder_path: "/uploads".to_string(),
            modules: vec!["jadx_module".to_string()],
            current_index: 0,
            results: HashMap::new(),
        };
        f.bus
            .set_with_ttl(
                &keys::chain_state_key("chain_other"),
                &serde_json::to_string(&state).unwrap(),
                Duration::ZERO,
            )
            .await
            .unwrap();

        write_result(&f.bus, "jadx_module", "abc123", r#"{"status": "success"}"#).await;
        f.reconciler.poll_once().await.unwrap();

        let raw = f
            .bus
            .get(&keys::chain_state_key("chain_other"))
            .await
            .unwrap()
            .unwrap();
        let untouched: ChainRuntimeState = serde_json::from_str(&raw).unwrap();
        assert_eq!(untouched.current_index, 0);
    }
}
