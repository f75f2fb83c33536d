//! Per-provider bounded queue and worker pool. Each provider gets its own
//! inbox and workers so a slow upstream can never cause head-of-line
//! blocking for another provider.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use bifrost_common::{BifrostError, BifrostResult, ErrorKind};
use bifrost_provider_core::{
    BifrostRequest, BifrostResponse, ChunkStream, Event, RequestContext,
};

use crate::pool::{ObjectPool, PoolItem};
use crate::worker::{WorkerDeps, worker_loop};

/// What a worker hands back through the reply slot.
pub enum AdapterReply {
    Full(BifrostResponse),
    Stream(ChunkStream),
}

pub type ReplySlot = oneshot::Sender<BifrostResult<AdapterReply>>;

/// Pooled carrier moved through the inbox. Every field is `take`n by the
/// worker and the carrier is zeroed before going back to the pool.
#[derive(Default)]
pub struct QueueItem {
    pub request: Option<BifrostRequest>,
    pub context: Option<RequestContext>,
    pub reply: Option<ReplySlot>,
}

impl PoolItem for QueueItem {
    fn reset(&mut self) {
        self.request = None;
        self.context = None;
        self.reply = None;
    }

    fn is_reset(&self) -> bool {
        self.request.is_none() && self.context.is_none() && self.reply.is_none()
    }
}

struct QueueInner {
    tx: mpsc::Sender<Box<QueueItem>>,
    workers: Vec<JoinHandle<()>>,
}

/// Lifecycle: Open → Closing → Closed. `closing` flips exactly once; after
/// that no new sends are accepted, queued items are answered with
/// `provider_shutting_down`, and `close` waits for workers to drain.
pub struct ProviderQueue {
    provider: String,
    closing: AtomicBool,
    drained: AtomicBool,
    done: Notify,
    inner: Mutex<Option<QueueInner>>,
    pool: Arc<ObjectPool<QueueItem>>,
}

impl ProviderQueue {
    /// Starts `deps.concurrency` workers over a bounded inbox. Must run
    /// inside a tokio runtime.
    pub(crate) fn start(
        provider: impl Into<String>,
        buffer_size: usize,
        concurrency: usize,
        pool: Arc<ObjectPool<QueueItem>>,
        deps: WorkerDeps,
    ) -> Arc<Self> {
        let provider = provider.into();
        let (tx, rx) = mpsc::channel::<Box<QueueItem>>(buffer_size.max(1));
        let shared_rx = Arc::new(tokio::sync::Mutex::new(rx));

        let queue = Arc::new(Self {
            provider: provider.clone(),
            closing: AtomicBool::new(false),
            drained: AtomicBool::new(false),
            done: Notify::new(),
            inner: Mutex::new(None),
            pool: pool.clone(),
        });

        let mut workers = Vec::with_capacity(concurrency.max(1));
        for _ in 0..concurrency.max(1) {
            workers.push(tokio::spawn(worker_loop(
                shared_rx.clone(),
                queue.clone(),
                pool.clone(),
                deps.clone(),
            )));
        }
        *queue.inner.lock().expect("queue lock poisoned") = Some(QueueInner { tx, workers });

        let events = deps.events.clone();
        let name = provider;
        tokio::spawn(async move {
            events.emit(Event::QueueStarted { provider: name }).await;
        });
        queue
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Enqueue with the caller's remaining deadline as the send timeout.
    /// The carrier is always consumed: on failure its contents are dropped
    /// and the carrier goes back to the pool here.
    pub async fn enqueue(
        &self,
        item: Box<QueueItem>,
        remaining: Option<Duration>,
        cancel: &CancellationToken,
    ) -> BifrostResult<()> {
        if self.closing.load(Ordering::Acquire) {
            self.recycle(item);
            return Err(self.shutdown_error());
        }

        let tx = {
            let guard = self.inner.lock().expect("queue lock poisoned");
            match guard.as_ref() {
                Some(inner) => inner.tx.clone(),
                None => {
                    drop(guard);
                    self.recycle(item);
                    return Err(self.shutdown_error());
                }
            }
        };

        let send = async {
            match remaining {
                Some(deadline) => tx.send_timeout(item, deadline).await.map_err(|e| match e {
                    SendTimeoutError::Timeout(item) => (
                        item,
                        BifrostError::new(
                            ErrorKind::QueueTimeout,
                            format!("inbox for {} full past deadline", self.provider),
                        )
                        .with_provider(self.provider.clone()),
                    ),
                    SendTimeoutError::Closed(item) => (item, self.shutdown_error()),
                }),
                None => tx
                    .send(item)
                    .await
                    .map_err(|e| (e.0, self.shutdown_error())),
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                // The carrier may still be in flight inside `send`; nothing
                // to recycle here. Workers answer whatever was enqueued.
                Err(BifrostError::cancelled().with_provider(self.provider.clone()))
            }
            result = send => match result {
                Ok(()) => Ok(()),
                Err((returned, err)) => {
                    self.recycle(returned);
                    Err(err)
                }
            },
        }
    }

    /// Transitions to Closing exactly once, drops the inbox sender, and
    /// waits for workers to drain. Concurrent callers wait for the first
    /// closer to finish.
    pub async fn close(&self, events: &bifrost_provider_core::EventHub) {
        if self.closing.swap(true, Ordering::AcqRel) {
            loop {
                let notified = self.done.notified();
                if self.drained.load(Ordering::Acquire) {
                    return;
                }
                notified.await;
            }
        }

        events
            .emit(Event::QueueClosing { provider: self.provider.clone() })
            .await;

        let inner = self.inner.lock().expect("queue lock poisoned").take();
        if let Some(QueueInner { tx, workers }) = inner {
            drop(tx);
            for handle in workers {
                let _ = handle.await;
            }
        }

        self.drained.store(true, Ordering::Release);
        self.done.notify_waiters();
        events
            .emit(Event::QueueClosed { provider: self.provider.clone() })
            .await;
    }

    fn shutdown_error(&self) -> BifrostError {
        BifrostError::new(
            ErrorKind::ProviderShuttingDown,
            format!("provider {} is shutting down", self.provider),
        )
        .with_provider(self.provider.clone())
    }

    fn recycle(&self, mut item: Box<QueueItem>) {
        item.reset();
        self.pool.release(item);
    }
}
