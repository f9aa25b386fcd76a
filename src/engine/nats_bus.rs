// NATS-backed message bus: JetStream KV buckets for transient state,
// a work-queue stream for module task queues, core NATS for events

//! # NATS Bus Implementation
//!
//! Distributed implementation of [`MessageBus`] for multi-process
//! deployments. Layout on the NATS side:
//!
//! - **KV buckets**, one per key prefix, carrying the TTLs as bucket
//!   `max_age`: `<prefix>_tasks` (≈1 h), `<prefix>_chains` (≈24 h),
//!   `<prefix>_results` (no expiry), `<prefix>_misc`
//! - **Work-queue stream** `APKSCOPE_TASKS` on `queue.>` subjects; one
//!   durable pull consumer per module queue
//! - **Core pub/sub** for chain events; NATS subject wildcards implement
//!   the pattern subscription natively
//!
//! Logical keys use `:` separators (`result:<module>:<file>`); KV keys
//! cannot contain `:`, so keys are stored with `/` separators and decoded
//! on the way back out.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use std::time::Duration;

use async_nats::jetstream::{self, consumer, kv, stream, Context};
use async_nats::Client;

use super::bus::{glob_match, BusMessage, BusSubscription, MessageBus};
use crate::{ApkScopeError, Result};

/// Configuration for the NATS bus
#[derive(Debug, Clone)]
pub struct NatsBusConfig {
    /// NATS server URLs
    pub nats_urls: Vec<String>,
    /// Prefix for bucket and stream names, so multiple deployments can
    /// share one NATS cluster
    pub bucket_prefix: String,
    /// max_age applied to the task bucket
    pub task_ttl: Duration,
    /// max_age applied to the chain runtime-state bucket
    pub chain_state_ttl: Duration,
}

impl Default for NatsBusConfig {
    fn default() -> Self {
        Self {
            nats_urls: vec!["nats://localhost:4222".to_string()],
            bucket_prefix: "apkscope".to_string(),
            task_ttl: super::keys::TASK_TTL,
            chain_state_ttl: super::keys::CHAIN_STATE_TTL,
        }
    }
}

/// JetStream-backed bus implementation
pub struct NatsBus {
    client: Client,
    jetstream: Context,
    config: NatsBusConfig,
    bucket_cache: DashMap<String, kv::Store>,
    queue_stream_ready: std::sync::atomic::AtomicBool,
}

fn bus_err(context: &str, err: impl std::fmt::Display) -> ApkScopeError {
    ApkScopeError::Bus(anyhow::anyhow!("{}: {}", context, err))
}

/// Encode a logical key (`result:jadx:abc`) into a KV-legal key
fn encode_key(key: &str) -> String {
    key.replace(':', "/")
}

fn decode_key(key: &str) -> String {
    key.replace('/', ":")
}

/// Map a module queue name (`queue:jadx_module`) onto its stream subject
fn queue_subject(queue: &str) -> String {
    queue.replace(':', ".")
}

impl NatsBus {
    /// Connect to NATS and build the bus
    pub async fn new(config: NatsBusConfig) -> Result<Self> {
        let client = async_nats::connect(config.nats_urls.join(","))
            .await
            .map_err(|e| bus_err("failed to connect to NATS", e))?;
        let jetstream = jetstream::new(client.clone());

        Ok(Self {
            client,
            jetstream,
            config,
            bucket_cache: DashMap::new(),
            queue_stream_ready: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Connect with default configuration
    pub async fn with_default_config() -> Result<Self> {
        Self::new(NatsBusConfig::default()).await
    }

    /// Bucket name and max_age for a logical key prefix
    fn bucket_spec(&self, key: &str) -> (String, Duration) {
        let prefix = key.split(':').next().unwrap_or("");
        let (suffix, max_age) = match prefix {
            "task" => ("tasks", self.config.task_ttl),
            "chain" => ("chains", self.config.chain_state_ttl),
            // Result records have no TTL; the reconciler deletes them
            "result" => ("results", Duration::ZERO),
            _ => ("misc", Duration::ZERO),
        };
        (format!("{}_{}", self.config.bucket_prefix, suffix), max_age)
    }

    /// Get the KV store for a key, creating the bucket on first use
    async fn bucket_for(&self, key: &str) -> Result<kv::Store> {
        let (bucket, max_age) = self.bucket_spec(key);
        if let Some(store) = self.bucket_cache.get(&bucket) {
            return Ok(store.clone());
        }

        // Look up first; create only if missing (mirrors stream handling)
        let store = match self.jetstream.get_key_value(&bucket).await {
            Ok(store) => store,
            Err(_) => self
                .jetstream
                .create_key_value(kv::Config {
                    bucket: bucket.clone(),
                    max_age,
                    history: 1,
                    ..Default::default()
                })
                .await
                .map_err(|e| bus_err("failed to create KV bucket", e))?,
        };

        self.bucket_cache.insert(bucket, store.clone());
        Ok(store)
    }

    fn queue_stream_name(&self) -> String {
        format!("{}_TASKS", self.config.bucket_prefix.to_uppercase())
    }

    /// Ensure the shared work-queue stream for module task queues exists
    async fn ensure_queue_stream(&self) -> Result<()> {
        use std::sync::atomic::Ordering;
        if self.queue_stream_ready.load(Ordering::Relaxed) {
            return Ok(());
        }

        let name = self.queue_stream_name();
        if self.jetstream.get_stream(&name).await.is_err() {
            self.jetstream
                .create_stream(stream::Config {
                    name: name.clone(),
                    subjects: vec!["queue.>".to_string()],
                    retention: stream::RetentionPolicy::WorkQueue,
                    storage: stream::StorageType::File,
                    max_age: self.config.task_ttl,
                    ..Default::default()
                })
                .await
                .map_err(|e| bus_err("failed to create task queue stream", e))?;
        }

        self.queue_stream_ready.store(true, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl MessageBus for NatsBus {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let store = self.bucket_for(key).await?;
        let entry = store
            .get(encode_key(key))
            .await
            .map_err(|e| bus_err("failed to read KV entry", e))?;
        Ok(entry.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    async fn set_with_ttl(&self, key: &str, value: &str, _ttl: Duration) -> Result<()> {
        // TTLs are carried by the per-prefix bucket max_age; the argument
        // is honored through the bucket the key lands in.
        let store = self.bucket_for(key).await?;
        store
            .put(encode_key(key), Bytes::from(value.to_string()))
            .await
            .map_err(|e| bus_err("failed to write KV entry", e))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let store = self.bucket_for(key).await?;
        store
            .purge(encode_key(key))
            .await
            .map_err(|e| bus_err("failed to delete KV entry", e))?;
        Ok(())
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>> {
        let store = self.bucket_for(pattern).await?;
        let mut keys = store
            .keys()
            .await
            .map_err(|e| bus_err("failed to list KV keys", e))?
            .boxed();

        let mut matched = Vec::new();
        while let Some(key) = keys.next().await {
            let key = key.map_err(|e| bus_err("failed to receive KV key", e))?;
            let decoded = decode_key(&key);
            if glob_match(pattern, &decoded) {
                matched.push(decoded);
            }
        }
        matched.sort();
        Ok(matched)
    }

    async fn push(&self, queue: &str, value: &str) -> Result<()> {
        self.ensure_queue_stream().await?;
        let ack = self
            .jetstream
            .publish(queue_subject(queue), Bytes::from(value.to_string()))
            .await
            .map_err(|e| bus_err("failed to publish task to queue", e))?;
        ack.await
            .map_err(|e| bus_err("failed to get queue publish ack", e))?;
        Ok(())
    }

    async fn pop(&self, queue: &str) -> Result<Option<String>> {
        self.ensure_queue_stream().await?;
        let stream = self
            .jetstream
            .get_stream(self.queue_stream_name())
            .await
            .map_err(|e| bus_err("failed to get task queue stream", e))?;

        let durable = queue.replace(':', "_");
        let consumer: consumer::PullConsumer = stream
            .get_or_create_consumer(
                &durable,
                consumer::pull::Config {
                    durable_name: Some(durable.clone()),
                    filter_subject: queue_subject(queue),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| bus_err("failed to create queue consumer", e))?;

        let mut batch = consumer
            .fetch()
            .max_messages(1)
            .expires(Duration::from_millis(500))
            .messages()
            .await
            .map_err(|e| bus_err("failed to fetch from queue", e))?;

        if let Some(message) = batch.next().await {
            let message = message.map_err(|e| bus_err("failed to receive queue message", e))?;
            let value = String::from_utf8_lossy(&message.payload).into_owned();
            message
                .ack()
                .await
                .map_err(|e| bus_err("failed to ack queue message", e))?;
            return Ok(Some(value));
        }
        Ok(None)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        self.client
            .publish(channel.to_string(), Bytes::from(payload.to_string()))
            .await
            .map_err(|e| bus_err("failed to publish event", e))?;
        // Chain events must not sit in client-side buffers while the
        // publisher goes back to polling
        self.client
            .flush()
            .await
            .map_err(|e| bus_err("failed to flush publish", e))?;
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<Box<dyn BusSubscription>> {
        let subscriber = self
            .client
            .subscribe(pattern.to_string())
            .await
            .map_err(|e| bus_err("failed to subscribe", e))?;
        Ok(Box::new(NatsSubscription {
            subscriber,
            handle: tokio::runtime::Handle::current(),
        }))
    }
}

/// Blocking adapter over the async NATS subscriber
///
/// `next_message` parks the calling thread on the runtime handle; the
/// orchestrator only ever calls it from its dedicated subscriber thread.
struct NatsSubscription {
    subscriber: async_nats::Subscriber,
    handle: tokio::runtime::Handle,
}

impl BusSubscription for NatsSubscription {
    fn next_message(&mut self) -> Option<BusMessage> {
        let message = self.handle.block_on(self.subscriber.next())?;
        Some(BusMessage {
            channel: message.subject.to_string(),
            payload: String::from_utf8_lossy(&message.payload).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_encoding_round_trips() {
        let key = "result:jadx_module:abc123";
        let encoded = encode_key(key);
        assert_eq!(encoded, "result/jadx_module/abc123");
        assert_eq!(decode_key(&encoded), key);
    }

    #[test]
    fn queue_names_map_to_subjects() {
        assert_eq!(queue_subject("queue:jadx_module"), "queue.jadx_module");
    }
}
