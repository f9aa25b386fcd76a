// Module registry and worker lifecycle: configuration loading, bulk
// worker startup and task submission

//! # Module Registry
//!
//! One [`ModuleRegistry`] per process owns the per-module configurations
//! and the worker lifecycle. Startup is fail-soft at every layer: an
//! unreadable config file is logged and skipped, and one module's
//! build/start failure never prevents the others from starting.
//!
//! `submit_task` is the single entry point through which work reaches a
//! module's queue. Its contract is deliberate: an unknown module is a
//! validation error; a message-bus failure is a **silent** `Ok(None)` that
//! the caller must branch on.

use futures::future::join_all;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use super::bus::MessageBus;
use super::keys;
use super::runtime::{WorkerRuntime, WorkerStatus};
use super::storage::ExecutionStore;
use crate::models::{Module, ModuleConfig, ScanStatus, Task};
use crate::{ApkScopeError, Result};

pub struct ModuleRegistry {
    bus: Arc<dyn MessageBus>,
    store: Arc<dyn ExecutionStore>,
    runtime: Arc<dyn WorkerRuntime>,
    modules_dir: PathBuf,
    configs: RwLock<HashMap<String, ModuleConfig>>,
}

impl ModuleRegistry {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        store: Arc<dyn ExecutionStore>,
        runtime: Arc<dyn WorkerRuntime>,
        modules_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            bus,
            store,
            runtime,
            modules_dir: modules_dir.into(),
            configs: RwLock::new(HashMap::new()),
        }
    }

    /// Scan the modules directory for `<name>/module.json` files and build
    /// the in-memory name→config map. Fails soft: unreadable or unparsable
    /// configs are logged and skipped. Returns the number of loaded
    /// configurations.
    pub async fn load_configurations(&self) -> Result<usize> {
        let mut loaded = HashMap::new();

        let mut entries = tokio::fs::read_dir(&self.modules_dir).await.map_err(|e| {
            ApkScopeError::InvalidInput(format!(
                "cannot read modules directory {}: {}",
                self.modules_dir.display(),
                e
            ))
        })?;

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("error while scanning modules directory: {}", e);
                    break;
                }
            };
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let config_path = path.join("module.json");
            let raw = match tokio::fs::read_to_string(&config_path).await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(path = %config_path.display(), "skipping module config: {}", e);
                    continue;
                }
            };
            match serde_json::from_str::<ModuleConfig>(&raw) {
                Ok(config) => {
                    info!(module = %config.name, active = config.active, "loaded module configuration");
                    loaded.insert(config.name.clone(), config);
                }
                Err(e) => {
                    warn!(path = %config_path.display(), "skipping malformed module config: {}", e);
                }
            }
        }

        let count = loaded.len();
        *self.configs.write().await = loaded;
        Ok(count)
    }

    /// Snapshot of the loaded configurations
    pub async fn configurations(&self) -> Vec<ModuleConfig> {
        self.configs.read().await.values().cloned().collect()
    }

    /// Start workers for every active module concurrently. One module's
    /// failure never aborts the others; failures are logged individually
    /// and the number of successfully started workers is returned.
    pub async fn start_all(&self) -> usize {
        let active: Vec<ModuleConfig> = self
            .configs
            .read()
            .await
            .values()
            .filter(|c| c.active)
            .cloned()
            .collect();

        let starts = active.iter().map(|config| {
            let config = config.clone();
            async move {
                let name = config.name.clone();
                (name, self.start_worker(&config).await)
            }
        });

        let mut started = 0;
        for (name, outcome) in join_all(starts).await {
            match outcome {
                Ok(()) => started += 1,
                Err(e) => error!(module = %name, "failed to start worker: {}", e),
            }
        }
        info!(started, total = active.len(), "module worker startup finished");
        started
    }

    /// Idempotently ensure at most one running worker container for the
    /// module: remove-if-exists, build image, run container, register the
    /// module's metadata in the execution store.
    pub async fn start_one(&self, module_name: &str) -> Result<()> {
        let config = self
            .configs
            .read()
            .await
            .get(module_name)
            .cloned()
            .ok_or_else(|| ApkScopeError::ModuleNotFound(module_name.to_string()))?;
        self.start_worker(&config).await
    }

    async fn start_worker(&self, config: &ModuleConfig) -> Result<()> {
        match self.runtime.status(&config.name).await? {
            WorkerStatus::Absent => {}
            status => {
                info!(module = %config.name, ?status, "removing existing worker container");
                self.runtime.stop(&config.name).await?;
            }
        }
        self.runtime.build_and_run(config).await?;
        self.store
            .register_module(Module::from_config(config))
            .await?;
        Ok(())
    }

    /// Stop the module's worker container. Failures are surfaced but not
    /// retried automatically.
    pub async fn stop_one(&self, module_name: &str) -> Result<()> {
        self.runtime.stop(module_name).await
    }

    /// Existence check used as a precondition gate before submission
    pub async fn check_module_exists(&self, module_name: &str) -> Result<bool> {
        self.store.module_exists(module_name).await
    }

    /// Submit a task onto a module's FIFO queue.
    ///
    /// Writes the task record with its TTL, appends the task id to the
    /// module's queue and marks the file's overall scan as in progress.
    /// Returns `Err(ModuleNotFound)` for an unknown module; returns
    /// `Ok(None)`, never an error, on any message-bus I/O failure, so
    /// callers must branch on the return value explicitly.
    pub async fn submit_task(&self, task: Task) -> Result<Option<String>> {
        if !self.store.module_exists(&task.module_name).await? {
            return Err(ApkScopeError::ModuleNotFound(task.module_name));
        }

        let task_id = task.id.clone();
        let payload = serde_json::to_string(&task)?;

        if let Err(e) = self
            .bus
            .set_with_ttl(&keys::task_key(&task_id), &payload, keys::TASK_TTL)
            .await
        {
            warn!(module = %task.module_name, file_id = %task.file_id,
                  "task record write failed, dropping submission: {}", e);
            return Ok(None);
        }

        if let Err(e) = self
            .bus
            .push(&keys::queue_name(&task.module_name), &task_id)
            .await
        {
            warn!(module = %task.module_name, file_id = %task.file_id,
                  "task queue push failed, dropping submission: {}", e);
            return Ok(None);
        }

        // Best effort: the submission already succeeded from the worker's
        // point of view
        match self.store.get_scan(&task.file_id).await {
            Ok(Some(mut scan)) => {
                scan.status = ScanStatus::InProgress;
                scan.updated_at = chrono::Utc::now();
                if let Err(e) = self.store.update_scan(scan).await {
                    warn!(file_id = %task.file_id, "failed to mark scan in progress: {}", e);
                }
            }
            Ok(None) => {
                warn!(file_id = %task.file_id, "no scan record for submitted task");
            }
            Err(e) => {
                warn!(file_id = %task.file_id, "failed to read scan record: {}", e);
            }
        }

        info!(module = %task.module_name, file_id = %task.file_id, task_id = %task_id,
              "task submitted");
        Ok(Some(task_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::bus::InMemoryBus;
    use crate::engine::runtime::testkit::MockRuntime;
    use crate::engine::storage::InMemoryExecutionStore;
    use crate::models::ScanRecord;

    struct Fixture {
        bus: Arc<InMemoryBus>,
        store: Arc<InMemoryExecutionStore>,
        runtime: Arc<MockRuntime>,
        registry: ModuleRegistry,
    }

    fn fixture() -> Fixture {
        let bus = Arc::new(InMemoryBus::new());
        let store = Arc::new(InMemoryExecutionStore::new());
        let runtime = Arc::new(MockRuntime::new());
        let registry = ModuleRegistry::new(
            bus.clone(),
            store.clone(),
            runtime.clone(),
            "/nonexistent/modules",
        );
        Fixture {
            bus,
            store,
            runtime,
            registry,
        }
    }

    async fn install_configs(registry: &ModuleRegistry, configs: Vec<ModuleConfig>) {
        let mut map = HashMap::new();
        for config in configs {
            map.insert(config.name.clone(), config);
        }
        *registry.configs.write().await = map;
    }

    fn write_module_config(dir: &std::path::Path, name: &str, raw: &str) {
        let module_dir = dir.join(name);
        std::fs::create_dir_all(&module_dir).unwrap();
        std::fs::write(module_dir.join("module.json"), raw).unwrap();
    }

    #[tokio::test]
    async fn load_configurations_skips_malformed_files() {
        let dir = std::env::temp_dir().join(format!("apkscope-test-{}", uuid::Uuid::new_v4()));
        write_module_config(&dir, "jadx_module", r#"{"name": "jadx_module"}"#);
        write_module_config(&dir, "broken_module", "{not json");
        // Directory without a config file at all
        std::fs::create_dir_all(dir.join("empty_module")).unwrap();

        let f = fixture();
        let registry = ModuleRegistry::new(f.bus, f.store, f.runtime, &dir);
        let loaded = registry.load_configurations().await.unwrap();
        assert_eq!(loaded, 1);
        assert_eq!(registry.configurations().await[0].name, "jadx_module");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn start_all_is_idempotent() {
        let f = fixture();
        let mut inactive = ModuleConfig::new("frida_module");
        inactive.active = false;
        install_configs(
            &f.registry,
            vec![
                ModuleConfig::new("jadx_module"),
                ModuleConfig::new("apkid_module"),
                inactive,
            ],
        )
        .await;

        assert_eq!(f.registry.start_all().await, 2);
        assert_eq!(f.registry.start_all().await, 2);

        // Exactly one running worker per active module, never duplicates
        assert_eq!(f.runtime.running_count(), 2);
        assert!(f.store.module_exists("jadx_module").await.unwrap());
        assert!(f.store.module_exists("apkid_module").await.unwrap());
        assert!(!f.store.module_exists("frida_module").await.unwrap());
    }

    #[tokio::test]
    async fn one_failing_module_does_not_stop_the_others() {
        let f = fixture();
        f.runtime.fail_module("apkid_module");
        install_configs(
            &f.registry,
            vec![
                ModuleConfig::new("jadx_module"),
                ModuleConfig::new("apkid_module"),
            ],
        )
        .await;

        assert_eq!(f.registry.start_all().await, 1);
        assert_eq!(f.runtime.running_count(), 1);
        assert!(f.store.module_exists("jadx_module").await.unwrap());
        assert!(!f.store.module_exists("apkid_module").await.unwrap());
    }

    #[tokio::test]
    async fn submit_task_unknown_module_is_a_validation_error() {
        let f = fixture();
        let err = f
            .registry
            .submit_task(Task::new("ghost_module", "abc123"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApkScopeError::ModuleNotFound(_)));
    }

    #[tokio::test]
    async fn submit_task_writes_record_queue_and_scan_status() {
        let f = fixture();
        install_configs(&f.registry, vec![ModuleConfig::new("jadx_module")]).await;
        f.registry.start_one("jadx_module").await.unwrap();
        f.store
            .create_scan(ScanRecord::new("abc123", "app.apk", "apk", "/uploads/abc123"))
            .await
            .unwrap();

        let task_id = f
            .registry
            .submit_task(Task::new("jadx_module", "abc123"))
            .await
            .unwrap()
            .expect("submission should succeed");

        // Task record exists with the queue entry pointing at it
        let record = f.bus.get(&keys::task_key(&task_id)).await.unwrap().unwrap();
        let task: Task = serde_json::from_str(&record).unwrap();
        assert_eq!(task.file_id, "abc123");
        assert_eq!(
            f.bus.pop("queue:jadx_module").await.unwrap().as_deref(),
            Some(task_id.as_str())
        );

        let scan = f.store.get_scan("abc123").await.unwrap().unwrap();
        assert_eq!(scan.status, ScanStatus::InProgress);
    }

    #[tokio::test]
    async fn submit_task_bus_failure_returns_none() {
        let f = fixture();
        install_configs(&f.registry, vec![ModuleConfig::new("jadx_module")]).await;
        f.registry.start_one("jadx_module").await.unwrap();
        f.bus.fail_writes_matching(Some("task:"));

        let submitted = f
            .registry
            .submit_task(Task::new("jadx_module", "abc123"))
            .await
            .unwrap();
        assert_eq!(submitted, None);
    }
}
