//! Worker body for provider queues: key selection, the adapter call for
//! the requested operation, transport-level retries with jittered backoff,
//! and key cooldown marking. Panics are converted to `internal_error`; the
//! worker keeps serving.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use arc_swap::ArcSwap;
use futures_util::FutureExt;
use serde_json::json;
use tokio::sync::mpsc;

use bifrost_common::{BifrostError, BifrostResult, ErrorKind};
use bifrost_provider_core::{
    BatchResult, BifrostRequest, BifrostResponse, CallCtx, ContainerResult, CooldownReason, Event,
    EventHub, FileResult, Key, KeySet, NetworkConfig, Operation, ProviderAdapter, ProviderConfig,
    RequestContext, RequestPayload, reserved,
};

use crate::pool::{ObjectPool, PoolItem};
use crate::queue::{AdapterReply, ProviderQueue, QueueItem};

const RATE_LIMIT_COOLDOWN: Duration = Duration::from_secs(30);
const AUTH_COOLDOWN: Duration = Duration::from_secs(3600);
const UPSTREAM_COOLDOWN: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub(crate) struct WorkerDeps {
    pub provider: String,
    pub adapter: Arc<dyn ProviderAdapter>,
    pub config: Arc<ArcSwap<ProviderConfig>>,
    pub keys: Arc<KeySet>,
    pub events: EventHub,
}

pub(crate) async fn worker_loop(
    shared_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Box<QueueItem>>>>,
    queue: Arc<ProviderQueue>,
    pool: Arc<ObjectPool<QueueItem>>,
    deps: WorkerDeps,
) {
    loop {
        let item = { shared_rx.lock().await.recv().await };
        let Some(mut item) = item else { return };

        let request = item.request.take();
        let context = item.context.take();
        let reply = item.reply.take();
        item.reset();
        pool.release(item);

        let (Some(request), Some(context), Some(reply)) = (request, context, reply) else {
            tracing::warn!(provider = %deps.provider, "queue item missing fields; dropped");
            continue;
        };

        // Items drained after the close transition are answered, not run.
        if queue.is_closing() {
            let _ = reply.send(Err(BifrostError::new(
                ErrorKind::ProviderShuttingDown,
                format!("provider {} is shutting down", deps.provider),
            )
            .with_provider(deps.provider.clone())));
            continue;
        }

        let result = AssertUnwindSafe(execute(&deps, &request, &context))
            .catch_unwind()
            .await;
        let result = match result {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(provider = %deps.provider, "worker recovered from panic");
                Err(BifrostError::internal("request processing panicked")
                    .with_provider(deps.provider.clone())
                    .with_model(request.model.clone())
                    .with_operation(request.operation.as_str()))
            }
        };
        let _ = reply.send(result);
    }
}

/// One queue item end to end: select a key, call the adapter, retry
/// transient failures in place with jittered backoff bounded by
/// `backoff_max`, and mark keys that misbehave.
async fn execute(
    deps: &WorkerDeps,
    req: &BifrostRequest,
    ctx: &RequestContext,
) -> BifrostResult<AdapterReply> {
    let config = deps.config.load_full();
    let net = config.network.clone();
    let mut attempt: u32 = 1;

    loop {
        if ctx.is_cancelled() {
            return Err(BifrostError::cancelled().with_provider(deps.provider.clone()));
        }

        let key = deps
            .keys
            .select_for_model(&req.model)
            .map_err(|e| e.with_provider(deps.provider.clone()).with_operation(req.operation.as_str()))?;
        ctx.set_reserved_value(reserved::SELECTED_KEY_ID, json!(key.id.clone()));

        let call = CallCtx {
            context: ctx,
            key: &key,
            config: &config,
            model: &req.model,
            params: req.params.as_ref(),
            attempt,
        };

        match run_operation(deps.adapter.as_ref(), &call, req).await {
            Ok(reply) => return Ok(reply),
            Err(err) => {
                apply_cooldown(deps, &key, &err).await;
                let retryable =
                    err.kind.is_transient() && attempt <= net.max_retries && !ctx.is_cancelled();
                if !retryable {
                    return Err(err);
                }
                let delay = retry_delay(&net, attempt, err.retry_after);
                tracing::debug!(
                    provider = %deps.provider,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    kind = err.kind.as_str(),
                    "retrying after transient upstream failure"
                );
                tokio::select! {
                    _ = ctx.cancellation().cancelled() => {
                        return Err(BifrostError::cancelled().with_provider(deps.provider.clone()));
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
        }
    }
}

fn retry_delay(net: &NetworkConfig, attempt: u32, retry_after: Option<Duration>) -> Duration {
    if let Some(after) = retry_after {
        return after;
    }
    let base = net.backoff_initial.as_millis().max(1) as u64;
    let step = attempt.saturating_sub(1).min(10);
    let backoff = base.saturating_mul(1u64 << step);
    let jitter = rand::random::<u64>() % (base + 1);
    Duration::from_millis((backoff + jitter).min(net.backoff_max.as_millis() as u64))
}

async fn apply_cooldown(deps: &WorkerDeps, key: &Key, err: &BifrostError) {
    let (duration, reason) = match err.kind {
        ErrorKind::RateLimited => {
            (err.retry_after.unwrap_or(RATE_LIMIT_COOLDOWN), CooldownReason::RateLimit)
        }
        ErrorKind::Unauthenticated => (AUTH_COOLDOWN, CooldownReason::AuthInvalid),
        ErrorKind::Timeout => (UPSTREAM_COOLDOWN, CooldownReason::Timeout),
        ErrorKind::UpstreamUnavailable => (UPSTREAM_COOLDOWN, CooldownReason::Upstream),
        _ => return,
    };
    deps.keys.mark_unavailable(&key.id, duration, reason);
    deps.events
        .emit(Event::KeyCooldownStart {
            provider: deps.provider.clone(),
            key_id: key.id.clone(),
            reason,
            until: SystemTime::now()
                .checked_add(duration)
                .unwrap_or_else(SystemTime::now),
        })
        .await;
}

fn mismatch(req: &BifrostRequest) -> BifrostError {
    BifrostError::new(
        ErrorKind::InvalidRequest,
        format!("payload does not match operation {}", req.operation),
    )
    .with_operation(req.operation.as_str())
}

/// Routes the typed payload to the matching adapter method and wraps the
/// typed result into the discriminated response.
async fn run_operation(
    adapter: &dyn ProviderAdapter,
    call: &CallCtx<'_>,
    req: &BifrostRequest,
) -> BifrostResult<AdapterReply> {
    use Operation::*;

    match (req.operation, &req.payload) {
        (Chat, RequestPayload::Chat(chat)) => adapter
            .chat(call, chat)
            .await
            .map(|r| AdapterReply::Full(BifrostResponse::Chat(r))),
        (ChatStream, RequestPayload::Chat(chat)) => {
            adapter.chat_stream(call, chat).await.map(AdapterReply::Stream)
        }
        (Responses, RequestPayload::Chat(chat)) => adapter
            .responses(call, chat)
            .await
            .map(|r| AdapterReply::Full(BifrostResponse::Chat(r))),
        (ResponsesStream, RequestPayload::Chat(chat)) => {
            adapter.responses_stream(call, chat).await.map(AdapterReply::Stream)
        }
        (TextCompletion, RequestPayload::Text(text)) => adapter
            .text_completion(call, text)
            .await
            .map(|r| AdapterReply::Full(BifrostResponse::Text(r))),
        (TextCompletionStream, RequestPayload::Text(text)) => adapter
            .text_completion_stream(call, text)
            .await
            .map(AdapterReply::Stream),
        (Embedding, RequestPayload::Embedding(embedding)) => adapter
            .embedding(call, embedding)
            .await
            .map(|r| AdapterReply::Full(BifrostResponse::Embedding(r))),
        (Speech, RequestPayload::Speech(speech)) => adapter
            .speech(call, speech)
            .await
            .map(|r| AdapterReply::Full(BifrostResponse::Speech(r))),
        (Transcription, RequestPayload::Transcription(transcription)) => adapter
            .transcription(call, transcription)
            .await
            .map(|r| AdapterReply::Full(BifrostResponse::Transcription(r))),
        (ImageGeneration, RequestPayload::Image(image)) => adapter
            .image_generation(call, image)
            .await
            .map(|r| AdapterReply::Full(BifrostResponse::Image(r))),
        (ImageEdit, RequestPayload::Image(image)) => adapter
            .image_edit(call, image)
            .await
            .map(|r| AdapterReply::Full(BifrostResponse::Image(r))),
        (ImageVariation, RequestPayload::Image(image)) => adapter
            .image_variation(call, image)
            .await
            .map(|r| AdapterReply::Full(BifrostResponse::Image(r))),
        (CountTokens, RequestPayload::Chat(chat)) => adapter
            .count_tokens(call, chat)
            .await
            .map(|r| AdapterReply::Full(BifrostResponse::TokenCount(r))),
        (ListModels, RequestPayload::Empty) => adapter
            .list_models(call)
            .await
            .map(|r| AdapterReply::Full(BifrostResponse::ModelList(r))),
        (BatchCreate | BatchGet | BatchList | BatchCancel, RequestPayload::Batch(batch)) => {
            adapter.batch(call, batch).await.map(|r| {
                AdapterReply::Full(match r {
                    BatchResult::One(batch) => BifrostResponse::Batch(batch),
                    BatchResult::Many(batches) => BifrostResponse::BatchList(batches),
                })
            })
        }
        (
            FileUpload | FileGet | FileList | FileDelete | FileContent,
            RequestPayload::File(file),
        ) => adapter.file(call, file).await.map(|r| {
            AdapterReply::Full(match r {
                FileResult::One(file) => BifrostResponse::File(file),
                FileResult::Many(files) => BifrostResponse::FileList(files),
                FileResult::Content(content) => BifrostResponse::FileContent(content),
                FileResult::Deleted(status) => BifrostResponse::Deleted(status),
            })
        }),
        (
            ContainerCreate | ContainerGet | ContainerList | ContainerDelete,
            RequestPayload::Container(container),
        ) => adapter.container(call, container).await.map(|r| {
            AdapterReply::Full(match r {
                ContainerResult::One(container) => BifrostResponse::Container(container),
                ContainerResult::Many(containers) => BifrostResponse::ContainerList(containers),
                ContainerResult::Deleted(status) => BifrostResponse::Deleted(status),
            })
        }),
        _ => Err(mismatch(req)),
    }
}
