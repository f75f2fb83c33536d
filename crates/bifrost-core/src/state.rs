//! Hot-reloadable runtime state. Provider and plugin lists live behind
//! atomic pointers: updates build a fresh collection and swap, readers take
//! a snapshot at entry. Nothing is ever mutated in place under a reader.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use arc_swap::ArcSwap;

use bifrost_provider_core::{EventHub, KeySet, ProviderAdapter, ProviderConfig};

use crate::plugins::Plugin;
use crate::pool::ObjectPool;
use crate::queue::{ProviderQueue, QueueItem};
use crate::worker::WorkerDeps;

/// Everything the dispatch path needs for one provider. The queue is
/// created lazily on first dispatch; config swaps do not restart it.
pub struct ProviderRuntime {
    pub name: String,
    pub adapter: Arc<dyn ProviderAdapter>,
    pub config: Arc<ArcSwap<ProviderConfig>>,
    pub keys: Arc<KeySet>,
    queue: OnceLock<Arc<ProviderQueue>>,
}

impl ProviderRuntime {
    pub fn new(config: ProviderConfig, adapter: Arc<dyn ProviderAdapter>) -> Self {
        let keys = Arc::new(KeySet::new(config.keys.clone()));
        Self {
            name: config.name.clone(),
            adapter,
            config: Arc::new(ArcSwap::from_pointee(config)),
            keys,
            queue: OnceLock::new(),
        }
    }

    /// Swaps the config snapshot and the live key list. Concurrency
    /// settings of an already-started queue are left as they are.
    pub fn apply_config(&self, config: ProviderConfig) {
        self.keys.replace(config.keys.clone());
        self.config.store(Arc::new(config));
    }

    /// Starts the queue on first use. Must be called inside a runtime.
    pub(crate) fn queue(
        &self,
        pool: &Arc<ObjectPool<QueueItem>>,
        events: &EventHub,
    ) -> Arc<ProviderQueue> {
        self.queue
            .get_or_init(|| {
                let config = self.config.load();
                ProviderQueue::start(
                    self.name.clone(),
                    config.concurrency.buffer_size,
                    config.concurrency.concurrency,
                    pool.clone(),
                    WorkerDeps {
                        provider: self.name.clone(),
                        adapter: self.adapter.clone(),
                        config: self.config.clone(),
                        keys: self.keys.clone(),
                        events: events.clone(),
                    },
                )
            })
            .clone()
    }

    /// The queue if it was ever started.
    pub(crate) fn started_queue(&self) -> Option<Arc<ProviderQueue>> {
        self.queue.get().cloned()
    }
}

pub struct RuntimeState {
    pub providers: ArcSwap<HashMap<String, Arc<ProviderRuntime>>>,
    pub plugins: ArcSwap<Vec<Arc<dyn Plugin>>>,
}

impl RuntimeState {
    pub fn new() -> Self {
        Self {
            providers: ArcSwap::from_pointee(HashMap::new()),
            plugins: ArcSwap::from_pointee(Vec::new()),
        }
    }

    pub fn provider(&self, name: &str) -> Option<Arc<ProviderRuntime>> {
        self.providers.load().get(name).cloned()
    }

    /// Inserts a new provider or swaps the config of an existing one. The
    /// existing runtime (and its queue and in-flight work) is kept on
    /// config changes.
    pub fn upsert_provider(&self, config: ProviderConfig, adapter: Arc<dyn ProviderAdapter>) {
        let current = self.providers.load();
        if let Some(existing) = current.get(&config.name) {
            existing.apply_config(config);
            return;
        }
        let mut next = current.as_ref().clone();
        let runtime = Arc::new(ProviderRuntime::new(config, adapter));
        next.insert(runtime.name.clone(), runtime);
        self.providers.store(Arc::new(next));
    }

    /// Removes a provider from the routing table. The caller is
    /// responsible for closing the returned runtime's queue.
    pub fn remove_provider(&self, name: &str) -> Option<Arc<ProviderRuntime>> {
        let current = self.providers.load();
        if !current.contains_key(name) {
            return None;
        }
        let mut next = current.as_ref().clone();
        let removed = next.remove(name);
        self.providers.store(Arc::new(next));
        removed
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.load().keys().cloned().collect()
    }

    pub fn add_plugin(&self, plugin: Arc<dyn Plugin>) {
        let mut next = self.plugins.load().as_ref().clone();
        next.push(plugin);
        self.plugins.store(Arc::new(next));
    }

    pub fn remove_plugin(&self, name: &str) {
        let mut next = self.plugins.load().as_ref().clone();
        next.retain(|p| p.name() != name);
        self.plugins.store(Arc::new(next));
    }

    pub fn plugin_snapshot(&self) -> Arc<Vec<Arc<dyn Plugin>>> {
        self.plugins.load_full()
    }
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self::new()
    }
}
