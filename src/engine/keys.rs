// Message-bus key and channel conventions shared by the engine components

//! # Key Conventions
//!
//! Every transient shape the engine stores on the message bus has a
//! well-known key shape. Workers write result entries against these same
//! conventions, so they are part of the wire contract:
//!
//! - `task:<uuid>`: transient task record, TTL ≈1 h
//! - `result:<module_name>:<file_id>`: worker output, no TTL (the
//!   reconciler deletes it after merging)
//! - `chain:<execution_id>`: chain runtime state blob, TTL ≈24 h
//! - `queue:<module_name>`: per-module FIFO task queue
//! - `chain.events.<execution_id>`: advance-event channel, one per
//!   execution, pattern-subscribed by the orchestrator

use std::time::Duration;

/// TTL for transient task records
pub const TASK_TTL: Duration = Duration::from_secs(3600);

/// TTL for chain runtime-state blobs
pub const CHAIN_STATE_TTL: Duration = Duration::from_secs(86_400);

/// Scan pattern matching every pending worker result
pub const RESULT_KEY_PATTERN: &str = "result:*:*";

/// Scan pattern matching every pending task record
pub const TASK_KEY_PATTERN: &str = "task:*";

/// Scan pattern matching every chain runtime-state blob
pub const CHAIN_STATE_KEY_PATTERN: &str = "chain:*";

/// Subscription pattern covering the advance-event channels of all chains
pub const CHAIN_EVENTS_PATTERN: &str = "chain.events.*";

pub fn task_key(task_id: &str) -> String {
    format!("task:{}", task_id)
}

pub fn result_key(module_name: &str, file_id: &str) -> String {
    format!("result:{}:{}", module_name, file_id)
}

pub fn chain_state_key(execution_id: &str) -> String {
    format!("chain:{}", execution_id)
}

pub fn queue_name(module_name: &str) -> String {
    format!("queue:{}", module_name)
}

pub fn chain_events_channel(execution_id: &str) -> String {
    format!("chain.events.{}", execution_id)
}

/// Parse `(module_name, file_id)` out of a `result:<module>:<file>` key.
/// Module names and file identifiers never contain `:`.
pub fn parse_result_key(key: &str) -> Option<(String, String)> {
    let mut parts = key.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("result"), Some(module), Some(file_id)) if !module.is_empty() && !file_id.is_empty() => {
            Some((module.to_string(), file_id.to_string()))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_key_round_trip() {
        let key = result_key("jadx_module", "abc123");
        assert_eq!(key, "result:jadx_module:abc123");
        assert_eq!(
            parse_result_key(&key),
            Some(("jadx_module".to_string(), "abc123".to_string()))
        );
    }

    #[test]
    fn parse_rejects_foreign_keys() {
        assert_eq!(parse_result_key("task:1234"), None);
        assert_eq!(parse_result_key("result:only_module"), None);
        assert_eq!(parse_result_key("result::abc"), None);
    }
}
