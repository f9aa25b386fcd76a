// Message bus abstraction: the thin task-queue client everything above
// it depends on

//! # Message Bus
//!
//! The bus is a key-value + list + pub/sub store shared between the engine
//! and the worker containers. [`MessageBus`] defines the operations the
//! engine consumes; [`InMemoryBus`] is the default implementation for
//! development and tests, and [`super::nats_bus::NatsBus`] provides the
//! distributed backend.
//!
//! ## Subscription model
//!
//! `subscribe` hands back a [`BusSubscription`] whose `next_message` call
//! **blocks** the calling thread until a message arrives. That call must
//! never run on the async dispatch path; the orchestrator isolates it on a
//! dedicated subscriber thread and forwards decoded events through an mpsc
//! channel (a message-passing bridge, not a lock).

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::Result;

/// A message received on a subscribed channel pattern
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub channel: String,
    pub payload: String,
}

/// Blocking half of the pub/sub bridge
pub trait BusSubscription: Send {
    /// Block until the next message matching the subscribed pattern
    /// arrives. Returns `None` once the bus shuts down. Must be called from
    /// a dedicated thread, never from the dispatch loop.
    fn next_message(&mut self) -> Option<BusMessage>;
}

/// Operations the engine consumes from the shared store
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Read a key. `Ok(None)` means the key does not exist (or expired).
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a key with a time-to-live. A zero TTL means no expiry.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Delete a key. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// List all live keys matching a glob pattern (`*` wildcards).
    ///
    /// Scanning is safe to run concurrently with writers: keys are only
    /// ever created once and deleted once.
    async fn scan(&self, pattern: &str) -> Result<Vec<String>>;

    /// Append a value to the tail of a FIFO queue.
    async fn push(&self, queue: &str, value: &str) -> Result<()>;

    /// Pop a value from the head of a FIFO queue (worker side).
    async fn pop(&self, queue: &str) -> Result<Option<String>>;

    /// Publish a payload on a channel.
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Subscribe to all channels matching a glob pattern.
    async fn subscribe(&self, pattern: &str) -> Result<Box<dyn BusSubscription>>;
}

/// Glob match with `*` wildcards (any run of characters)
pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
    fn matches(p: &[u8], t: &[u8]) -> bool {
        match (p.first(), t.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                // Star matches empty, or one more character of text
                matches(&p[1..], t) || (!t.is_empty() && matches(p, &t[1..]))
            }
            (Some(pc), Some(tc)) if pc == tc => matches(&p[1..], &t[1..]),
            _ => false,
        }
    }
    matches(pattern.as_bytes(), text.as_bytes())
}

struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-memory bus implementation for development and testing
///
/// Single-process only. TTLs are honored lazily: expired keys disappear on
/// the next read or scan. Tests can inject write failures for a key prefix
/// to exercise the submission-failure contract.
#[derive(Default)]
pub struct InMemoryBus {
    keys: DashMap<String, StoredValue>,
    queues: Mutex<HashMap<String, VecDeque<String>>>,
    subscribers: Mutex<Vec<(String, std::sync::mpsc::Sender<BusMessage>)>>,
    fail_writes_prefix: Mutex<Option<String>>,
}

// Bus data stays usable after a panicking lock holder
fn recover<'a, T>(guard: std::result::Result<MutexGuard<'a, T>, PoisonError<MutexGuard<'a, T>>>) -> MutexGuard<'a, T> {
    guard.unwrap_or_else(PoisonError::into_inner)
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `set_with_ttl`/`push`/`publish` against a key, queue or
    /// channel starting with `prefix` fail, simulating an unreachable
    /// store. Pass `None` to restore normal behavior.
    pub fn fail_writes_matching(&self, prefix: Option<&str>) {
        *recover(self.fail_writes_prefix.lock()) = prefix.map(|p| p.to_string());
    }

    fn write_allowed(&self, key: &str) -> Result<()> {
        let guard = recover(self.fail_writes_prefix.lock());
        if let Some(prefix) = guard.as_deref() {
            if key.starts_with(prefix) {
                return Err(crate::ApkScopeError::Bus(anyhow::anyhow!(
                    "simulated write failure for {}",
                    key
                )));
            }
        }
        Ok(())
    }
}

struct InMemorySubscription {
    receiver: std::sync::mpsc::Receiver<BusMessage>,
}

impl BusSubscription for InMemorySubscription {
    fn next_message(&mut self) -> Option<BusMessage> {
        self.receiver.recv().ok()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        if let Some(entry) = self.keys.get(key) {
            if entry.is_expired() {
                drop(entry);
                self.keys.remove(key);
                return Ok(None);
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.write_allowed(key)?;
        let expires_at = if ttl.is_zero() {
            None
        } else {
            Some(Instant::now() + ttl)
        };
        self.keys.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.keys.remove(key);
        Ok(())
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>> {
        let mut expired = Vec::new();
        let mut matched = Vec::new();
        for entry in self.keys.iter() {
            if entry.value().is_expired() {
                expired.push(entry.key().clone());
            } else if glob_match(pattern, entry.key()) {
                matched.push(entry.key().clone());
            }
        }
        for key in expired {
            self.keys.remove(&key);
        }
        matched.sort();
        Ok(matched)
    }

    async fn push(&self, queue: &str, value: &str) -> Result<()> {
        self.write_allowed(queue)?;
        let mut queues = recover(self.queues.lock());
        queues
            .entry(queue.to_string())
            .or_default()
            .push_back(value.to_string());
        Ok(())
    }

    async fn pop(&self, queue: &str) -> Result<Option<String>> {
        let mut queues = recover(self.queues.lock());
        Ok(queues.get_mut(queue).and_then(|q| q.pop_front()))
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        self.write_allowed(channel)?;
        let mut subscribers = recover(self.subscribers.lock());
        // Deliver to matching subscribers, dropping any whose receiver died
        subscribers.retain(|(pattern, sender)| {
            if glob_match(pattern, channel) {
                sender
                    .send(BusMessage {
                        channel: channel.to_string(),
                        payload: payload.to_string(),
                    })
                    .is_ok()
            } else {
                true
            }
        });
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<Box<dyn BusSubscription>> {
        let (sender, receiver) = std::sync::mpsc::channel();
        recover(self.subscribers.lock()).push((pattern.to_string(), sender));
        Ok(Box::new(InMemorySubscription { receiver }))
    }
}
