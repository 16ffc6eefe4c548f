//! In-process world
//!
//! `LocalWorld` runs queues as tokio tasks: each published message
//! spawns a delivery task that sleeps out its delay, finds the mounted
//! handler by longest prefix match, and redelivers on defer or error.
//! Idempotency keys dedup across the world's lifetime. Tests and
//! single-node deployments run on this world; cloud worlds implement
//! the same trait over real queue backends.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use capstan_codec::PayloadEncryption;
use capstan_storage::{MemoryStorage, MemoryStreamStore, Storage, StreamStore};

use crate::error::EngineError;
use crate::world::{HandlerOutcome, QueueHandler, QueueOptions, World, WorldConfig};

/// Redelivery pause after a handler error
const ERROR_REDELIVERY_DELAY: Duration = Duration::from_millis(250);

/// Give up redelivering a poisoned message after this many attempts
const MAX_DELIVERY_ATTEMPTS: u32 = 25;

struct Mounts {
    handlers: Vec<(String, Arc<dyn QueueHandler>)>,
}

impl Mounts {
    /// Longest matching prefix wins
    fn resolve(&self, queue_name: &str) -> Option<Arc<dyn QueueHandler>> {
        self.handlers
            .iter()
            .filter(|(prefix, _)| queue_name.starts_with(prefix))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, handler)| handler.clone())
    }
}

/// In-process queue-backed world
pub struct LocalWorld {
    storage: Arc<dyn Storage>,
    streams: Arc<dyn StreamStore>,
    encryption: Option<PayloadEncryption>,
    config: WorldConfig,
    mounts: Arc<RwLock<Mounts>>,
    seen_keys: Arc<Mutex<HashSet<String>>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl LocalWorld {
    pub fn new(storage: Arc<dyn Storage>, streams: Arc<dyn StreamStore>) -> Self {
        Self {
            storage,
            streams,
            encryption: None,
            config: WorldConfig::default(),
            mounts: Arc::new(RwLock::new(Mounts { handlers: vec![] })),
            seen_keys: Arc::new(Mutex::new(HashSet::new())),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Everything in memory; the default for tests
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryStorage::new()),
            Arc::new(MemoryStreamStore::new()),
        )
    }

    pub fn with_encryption(mut self, encryption: PayloadEncryption) -> Self {
        self.encryption = Some(encryption);
        self
    }

    pub fn with_config(mut self, config: WorldConfig) -> Self {
        self.config = config;
        self
    }

    /// Drain in-flight deliveries, then stop accepting new ones
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Wait for the queue to fall idle (test synchronization)
    pub async fn quiesce(&self) {
        loop {
            if self.tracker.len() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn deliver(
        mounts: Arc<RwLock<Mounts>>,
        config: WorldConfig,
        shutdown: CancellationToken,
        queue_name: String,
        payload: Vec<u8>,
    ) {
        let mut attempt: u32 = 0;

        loop {
            if shutdown.is_cancelled() {
                return;
            }
            attempt += 1;

            let Some(handler) = mounts.read().resolve(&queue_name) else {
                warn!(queue = %queue_name, "no handler mounted; dropping message");
                return;
            };

            match handler.handle(&queue_name, payload.clone()).await {
                Ok(HandlerOutcome::Ack) => return,
                Ok(HandlerOutcome::Defer { timeout }) => {
                    let pause = config.clamp_defer(timeout);
                    debug!(queue = %queue_name, ?pause, "deferring redelivery");
                    tokio::time::sleep(pause).await;
                }
                Err(e) => {
                    if attempt >= MAX_DELIVERY_ATTEMPTS {
                        warn!(queue = %queue_name, attempt, "giving up on message: {e}");
                        return;
                    }
                    warn!(queue = %queue_name, attempt, "handler error, will redeliver: {e}");
                    tokio::time::sleep(ERROR_REDELIVERY_DELAY).await;
                }
            }
        }
    }
}

#[async_trait]
impl World for LocalWorld {
    fn storage(&self) -> Arc<dyn Storage> {
        self.storage.clone()
    }

    fn streams(&self) -> Arc<dyn StreamStore> {
        self.streams.clone()
    }

    fn encryption(&self) -> Option<PayloadEncryption> {
        self.encryption.clone()
    }

    fn config(&self) -> &WorldConfig {
        &self.config
    }

    async fn queue(
        &self,
        queue_name: &str,
        payload: Vec<u8>,
        options: QueueOptions,
    ) -> Result<(), EngineError> {
        if self.shutdown.is_cancelled() {
            return Err(EngineError::Queue("world is shut down".into()));
        }

        if let Some(key) = &options.idempotency_key {
            let scoped = format!("{queue_name}\u{0}{key}");
            if !self.seen_keys.lock().insert(scoped) {
                // Duplicate publish: the prior delivery carries the effect.
                debug!(queue = %queue_name, key, "duplicate idempotency key; treated as success");
                return Ok(());
            }
        }

        let mounts = self.mounts.clone();
        let config = self.config.clone();
        let shutdown = self.shutdown.clone();
        let queue_name = queue_name.to_string();
        let delay = options.delay;

        self.tracker.spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Self::deliver(mounts, config, shutdown, queue_name, payload).await;
        });

        Ok(())
    }

    fn create_queue_handler(&self, prefix: &str, handler: Arc<dyn QueueHandler>) {
        self.mounts
            .write()
            .handlers
            .push((prefix.to_string(), handler));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    struct Recorder {
        seen: Arc<PlMutex<Vec<(String, Vec<u8>)>>>,
        defer_once: PlMutex<bool>,
    }

    #[async_trait]
    impl QueueHandler for Recorder {
        async fn handle(
            &self,
            queue_name: &str,
            payload: Vec<u8>,
        ) -> Result<HandlerOutcome, EngineError> {
            let mut defer = self.defer_once.lock();
            if *defer {
                *defer = false;
                return Ok(HandlerOutcome::Defer {
                    timeout: Duration::from_secs(1),
                });
            }
            drop(defer);
            self.seen.lock().push((queue_name.to_string(), payload));
            Ok(HandlerOutcome::Ack)
        }
    }

    fn recorder(defer_once: bool) -> (Arc<Recorder>, Arc<PlMutex<Vec<(String, Vec<u8>)>>>) {
        let seen = Arc::new(PlMutex::new(Vec::new()));
        (
            Arc::new(Recorder {
                seen: seen.clone(),
                defer_once: PlMutex::new(defer_once),
            }),
            seen,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_prefix_routing_and_delivery() {
        let world = LocalWorld::in_memory();
        let (handler, seen) = recorder(false);
        world.create_queue_handler("__wkf_step_", handler);

        world
            .queue("__wkf_step_mystep", b"payload".to_vec(), QueueOptions::default())
            .await
            .unwrap();
        world.quiesce().await;

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "__wkf_step_mystep");
        assert_eq!(seen[0].1, b"payload");
    }

    #[tokio::test(start_paused = true)]
    async fn test_longest_prefix_wins() {
        let world = LocalWorld::in_memory();
        let (general, general_seen) = recorder(false);
        let (health, health_seen) = recorder(false);
        world.create_queue_handler("__wkf_workflow_", general);
        world.create_queue_handler("__wkf_workflow_health_check", health);

        world
            .queue(
                "__wkf_workflow_health_check",
                b"probe".to_vec(),
                QueueOptions::default(),
            )
            .await
            .unwrap();
        world.quiesce().await;

        assert_eq!(health_seen.lock().len(), 1);
        assert!(general_seen.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_idempotency_key_is_success() {
        let world = LocalWorld::in_memory();
        let (handler, seen) = recorder(false);
        world.create_queue_handler("q_", handler);

        let opts = QueueOptions::default().with_idempotency_key("once");
        world.queue("q_a", b"1".to_vec(), opts.clone()).await.unwrap();
        world.queue("q_a", b"2".to_vec(), opts).await.unwrap();
        world.quiesce().await;

        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_defer_redelivers() {
        let world = LocalWorld::in_memory();
        let (handler, seen) = recorder(true);
        world.create_queue_handler("q_", handler);

        world
            .queue("q_defer", b"x".to_vec(), QueueOptions::default())
            .await
            .unwrap();
        world.quiesce().await;

        // First delivery deferred, second delivered.
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_message() {
        let world = LocalWorld::in_memory();
        let (handler, seen) = recorder(false);
        world.create_queue_handler("q_", handler);

        world
            .queue(
                "q_later",
                b"x".to_vec(),
                QueueOptions::default().with_delay(Duration::from_secs(30)),
            )
            .await
            .unwrap();
        world.quiesce().await;

        assert_eq!(seen.lock().len(), 1);
    }
}
