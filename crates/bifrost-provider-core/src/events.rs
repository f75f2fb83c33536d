use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::{RwLock, broadcast};

use crate::keys::CooldownReason;

/// Operational lifecycle events. Observability plugins and tests subscribe;
/// nothing in the dispatch path depends on anyone listening.
#[derive(Debug, Clone)]
pub enum Event {
    QueueStarted {
        provider: String,
    },
    QueueClosing {
        provider: String,
    },
    QueueClosed {
        provider: String,
    },
    KeyCooldownStart {
        provider: String,
        key_id: String,
        reason: CooldownReason,
        until: SystemTime,
    },
    PluginFault {
        plugin: String,
        stage: &'static str,
        message: String,
    },
    FallbackAttempt {
        provider: String,
        model: String,
        index: usize,
    },
    RequestCompleted {
        provider: String,
        model: String,
        operation: &'static str,
        success: bool,
    },
}

pub trait EventSink: Send + Sync {
    fn write<'a>(&'a self, event: &'a Event) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

#[derive(Clone)]
pub struct EventHub {
    inner: Arc<Inner>,
}

struct Inner {
    tx: broadcast::Sender<Event>,
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
}

impl EventHub {
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer);
        Self {
            inner: Arc::new(Inner {
                tx,
                sinks: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.tx.subscribe()
    }

    pub async fn add_sink(&self, sink: Arc<dyn EventSink>) {
        self.inner.sinks.write().await.push(sink);
    }

    /// Broadcast is fire-and-forget; sink writes run detached so a slow
    /// sink cannot stall an emitter on the dispatch path.
    pub async fn emit(&self, event: Event) {
        let _ = self.inner.tx.send(event.clone());
        let sinks = self.inner.sinks.read().await.clone();
        for sink in sinks {
            let event = event.clone();
            tokio::spawn(async move {
                sink.write(&event).await;
            });
        }
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(64)
    }
}
