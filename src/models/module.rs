// Module configuration, registry records and per-file scan state

//! # Module Models
//!
//! An analysis module is an independently deployed worker with a well-known
//! task queue name. Its on-disk configuration ([`ModuleConfig`]) drives the
//! worker lifecycle; its registry record ([`Module`]) is the durable metadata
//! row other components gate submissions on. [`ScanRecord`] is the per-file
//! state the reconciler merges worker results into.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-module configuration, loaded from `<modules_dir>/<name>/module.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleConfig {
    /// Unique module name; doubles as the task queue name
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Inactive modules are skipped by bulk worker startup
    #[serde(default = "default_active")]
    pub active: bool,
    /// Free-form configuration passed through to the worker untouched
    #[serde(default)]
    pub config: HashMap<String, serde_json::Value>,
}

fn default_active() -> bool {
    true
}

impl ModuleConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            description: None,
            active: true,
            config: HashMap::new(),
        }
    }
}

/// Registered module metadata in the execution store
///
/// Registered or updated whenever the module's worker is (re)started;
/// never deleted automatically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    pub version: Option<String>,
    pub description: Option<String>,
    pub config: HashMap<String, serde_json::Value>,
    pub registered_at: DateTime<Utc>,
}

impl Module {
    /// Build a registry record from a loaded configuration
    pub fn from_config(config: &ModuleConfig) -> Self {
        Self {
            name: config.name.clone(),
            version: config.version.clone(),
            description: config.description.clone(),
            config: config.config.clone(),
            registered_at: Utc::now(),
        }
    }
}

/// Overall scan status of an uploaded file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// Per-file scan record: overall status plus per-module results
///
/// The results map is keyed by module name. This is the durable merge target
/// of the result reconciler; it also carries the file metadata needed to
/// build tasks for the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRecord {
    /// File identifier (content hash assigned at upload)
    pub file_id: String,
    pub file_name: String,
    pub file_type: String,
    pub folder_path: String,
    pub status: ScanStatus,
    #[serde(default)]
    pub results: HashMap<String, serde_json::Value>,
    pub updated_at: DateTime<Utc>,
}

impl ScanRecord {
    pub fn new(
        file_id: impl Into<String>,
        file_name: impl Into<String>,
        file_type: impl Into<String>,
        folder_path: impl Into<String>,
    ) -> Self {
        Self {
            file_id: file_id.into(),
            file_name: file_name.into(),
            file_type: file_type.into(),
            folder_path: folder_path.into(),
            status: ScanStatus::Pending,
            results: HashMap::new(),
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_config_defaults_to_active() {
        let config: ModuleConfig =
            serde_json::from_str(r#"{"name": "jadx_module"}"#).unwrap();
        assert!(config.active);
        assert!(config.config.is_empty());
        assert_eq!(config.name, "jadx_module");
    }

    #[test]
    fn module_config_explicit_inactive() {
        let config: ModuleConfig =
            serde_json::from_str(r#"{"name": "frida_module", "active": false}"#).unwrap();
        assert!(!config.active);
    }

    #[test]
    fn module_record_from_config() {
        let mut config = ModuleConfig::new("apkid_module");
        config.version = Some("1.2.0".to_string());
        config
            .config
            .insert("timeout".to_string(), serde_json::json!(300));

        let module = Module::from_config(&config);
        assert_eq!(module.name, "apkid_module");
        assert_eq!(module.version.as_deref(), Some("1.2.0"));
        assert_eq!(module.config["timeout"], serde_json::json!(300));
    }
}
