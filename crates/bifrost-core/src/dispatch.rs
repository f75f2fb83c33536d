//! The dispatcher: one attempt = plugin pre-hooks, queue hand-off, worker
//! result, plugin post-hooks. The fallback orchestrator wraps it and walks
//! the request's fallback targets, re-running the whole pipeline per
//! attempt so governance and caching plugins see every try.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::oneshot;

use bifrost_common::{BifrostError, BifrostResult, ErrorKind};
use bifrost_provider_core::{
    BifrostRequest, BifrostResponse, ChunkStream, Event, EventHub, Operation, RequestContext,
    RequestPayload, reserved,
};

use crate::accumulator::{self, PostHookRunner};
use crate::core::{CoreInner, CorePools};
use crate::mcp::agent::{self, ModelInvoker};
use crate::plugins::HookOutcome;
use crate::pool::PoolItem;
use crate::queue::AdapterReply;
use crate::state::ProviderRuntime;

pub(crate) enum DispatchOutput {
    Full(BifrostResponse),
    Stream(ChunkStream),
}

/// Fallback orchestrator. Walks `[primary] + fallbacks`, re-running the
/// full dispatcher per target, until a target succeeds, a terminal error
/// appears, or the list is exhausted.
pub(crate) async fn dispatch(
    core: &CoreInner,
    ctx: &RequestContext,
    req: &BifrostRequest,
) -> BifrostResult<DispatchOutput> {
    let total_targets = 1 + req.fallbacks.len();
    let mut last_err: Option<BifrostError> = None;

    for index in 0..total_targets {
        if ctx.is_cancelled() {
            return Err(BifrostError::cancelled());
        }

        let mut attempt = req.clone();
        if index > 0 {
            let target = &req.fallbacks[index - 1];
            attempt.provider = target.provider.clone();
            attempt.model = target.model.clone();
            ctx.set_reserved_value(reserved::FALLBACK_INDEX, json!(index - 1));
            ctx.set_reserved_value(
                reserved::NUMBER_OF_RETRIES,
                json!(ctx.number_of_retries() + 1),
            );
            core.events
                .emit(Event::FallbackAttempt {
                    provider: attempt.provider.clone(),
                    model: attempt.model.clone(),
                    index: index - 1,
                })
                .await;
        }

        match dispatch_once(core, ctx, attempt).await {
            Ok(output) => return Ok(output),
            Err(err) => {
                if !err.allows_fallback() {
                    return Err(err);
                }
                tracing::debug!(
                    provider = err.provider.as_deref().unwrap_or(""),
                    kind = err.kind.as_str(),
                    target = index,
                    "target failed; trying next fallback"
                );
                last_err = Some(err);
            }
        }
    }

    Err(last_err
        .unwrap_or_else(|| BifrostError::internal("dispatch finished without an outcome")))
}

/// One full pipeline pass against a single (provider, model) target.
async fn dispatch_once(
    core: &CoreInner,
    ctx: &RequestContext,
    mut req: BifrostRequest,
) -> BifrostResult<DispatchOutput> {
    let Some(runtime) = core.state.provider(&req.provider) else {
        return Err(BifrostError::new(
            ErrorKind::InvalidRequest,
            format!("provider {} is not configured", req.provider),
        )
        .with_provider(req.provider.clone()));
    };

    let config = runtime.config.load();
    if !config.allowed_operations.allows(req.operation) {
        return Err(BifrostError::new(
            ErrorKind::OperationNotAllowed,
            format!("operation {} is not allowed for {}", req.operation, req.provider),
        )
        .with_provider(req.provider.clone())
        .with_operation(req.operation.as_str()));
    }
    validate_payload(&req)?;
    drop(config);

    let mut pipeline = core.pools.pipelines.acquire();
    pipeline.load(&core.state.plugin_snapshot());

    let short = pipeline.run_pre_hooks(ctx, &mut req).await;

    if req.operation.is_streaming() {
        return dispatch_streaming(core, ctx, req, &runtime, pipeline, short).await;
    }

    let mut outcome = match short {
        Some(outcome) => outcome,
        None => {
            attach_mcp_tools(core, &mut req);
            match enqueue_and_wait(&core.pools, &core.events, &runtime, ctx, &req).await {
                Ok(AdapterReply::Full(response)) => {
                    match maybe_agent_loop(core, &runtime, ctx, &req, response).await {
                        Ok(response) => HookOutcome::from_response(response),
                        Err(err) => HookOutcome::from_error(err),
                    }
                }
                Ok(AdapterReply::Stream(_)) => HookOutcome::from_error(BifrostError::internal(
                    "adapter returned a stream for a non-streaming operation",
                )),
                Err(err) => HookOutcome::from_error(err),
            }
        }
    };

    pipeline.run_post_hooks(ctx, &mut outcome).await;
    pipeline.reset();
    core.pools.pipelines.release(pipeline);

    settle_outcome(outcome).map(DispatchOutput::Full)
}

/// Streaming variant. Post-hooks do not run here; they run inside the
/// accumulator's post-hook runner once the full response is known. The
/// pipeline carrier travels into the runner and is released there.
async fn dispatch_streaming(
    core: &CoreInner,
    ctx: &RequestContext,
    mut req: BifrostRequest,
    runtime: &Arc<ProviderRuntime>,
    mut pipeline: Box<crate::plugins::PluginPipeline>,
    short: Option<HookOutcome>,
) -> BifrostResult<DispatchOutput> {
    if let Some(mut outcome) = short {
        pipeline.run_post_hooks(ctx, &mut outcome).await;
        pipeline.reset();
        core.pools.pipelines.release(pipeline);
        let response = settle_outcome(outcome)?;
        return Ok(DispatchOutput::Stream(accumulator::stream_from_response(&response)));
    }

    attach_mcp_tools(core, &mut req);
    match enqueue_and_wait(&core.pools, &core.events, runtime, ctx, &req).await {
        Ok(AdapterReply::Stream(upstream)) => {
            let plugins = pipeline.plugins().to_vec();
            let pools = core.pools.clone();
            let runner_ctx = ctx.clone();
            let runner: PostHookRunner = Box::new(move |response, error| {
                Box::pin(async move {
                    let mut outcome = HookOutcome { response, error };
                    pipeline.run_post_hooks(&runner_ctx, &mut outcome).await;
                    pipeline.reset();
                    pools.pipelines.release(pipeline);
                })
            });
            Ok(DispatchOutput::Stream(accumulator::spawn(
                upstream,
                ctx.clone(),
                plugins,
                req.operation,
                runner,
            )))
        }
        Ok(AdapterReply::Full(response)) => {
            // Adapter satisfied a stream request with a full response;
            // settle hooks now and replay it as a synthetic stream.
            let mut outcome = HookOutcome::from_response(response);
            pipeline.run_post_hooks(ctx, &mut outcome).await;
            pipeline.reset();
            core.pools.pipelines.release(pipeline);
            let response = settle_outcome(outcome)?;
            Ok(DispatchOutput::Stream(accumulator::stream_from_response(&response)))
        }
        Err(err) => {
            let mut outcome = HookOutcome::from_error(err);
            pipeline.run_post_hooks(ctx, &mut outcome).await;
            pipeline.reset();
            core.pools.pipelines.release(pipeline);
            match settle_outcome(outcome) {
                Ok(response) => {
                    Ok(DispatchOutput::Stream(accumulator::stream_from_response(&response)))
                }
                Err(err) => Err(err),
            }
        }
    }
}

fn settle_outcome(outcome: HookOutcome) -> BifrostResult<BifrostResponse> {
    match (outcome.response, outcome.error) {
        (_, Some(err)) => Err(err),
        (Some(response), None) => Ok(response),
        (None, None) => Err(BifrostError::internal(
            "pipeline settled with neither response nor error",
        )),
    }
}

/// Hands the carrier to the provider queue and waits on the reply slot,
/// bounded by the context deadline and cancellation.
pub(crate) async fn enqueue_and_wait(
    pools: &Arc<CorePools>,
    events: &EventHub,
    runtime: &ProviderRuntime,
    ctx: &RequestContext,
    req: &BifrostRequest,
) -> BifrostResult<AdapterReply> {
    let queue = runtime.queue(&pools.queue_items, events);

    let (reply_tx, reply_rx) = oneshot::channel();
    let mut item = pools.queue_items.acquire();
    item.request = Some(req.clone());
    item.context = Some(ctx.clone());
    item.reply = Some(reply_tx);

    queue.enqueue(item, ctx.remaining(), ctx.cancellation()).await?;

    let wait = async {
        match reply_rx.await {
            Ok(result) => result,
            Err(_) => Err(BifrostError::internal("worker dropped the reply slot")
                .with_provider(req.provider.clone())),
        }
    };

    tokio::select! {
        _ = ctx.cancellation().cancelled() => {
            Err(BifrostError::cancelled().with_provider(req.provider.clone()))
        }
        result = async {
            match ctx.deadline() {
                Some(deadline) => match tokio::time::timeout_at(deadline, wait).await {
                    Ok(result) => result,
                    Err(_) => Err(BifrostError::new(
                        ErrorKind::Timeout,
                        "deadline passed while waiting on the provider worker",
                    )
                    .with_provider(req.provider.clone())),
                },
                None => wait.await,
            }
        } => result,
    }
}

/// Merges MCP-discovered tool definitions into a chat payload when the
/// request opted in. Explicitly supplied tools win on name clashes.
fn attach_mcp_tools(core: &CoreInner, req: &mut BifrostRequest) {
    let Some(opts) = req.tools.clone() else { return };
    if !matches!(
        req.operation.non_streaming(),
        Operation::Chat | Operation::Responses
    ) {
        return;
    }
    let RequestPayload::Chat(chat) = &mut req.payload else {
        return;
    };
    for definition in core.mcp.available_tools(Some(&opts)) {
        if !chat.tools.iter().any(|t| t.name == definition.name) {
            chat.tools.push(definition);
        }
    }
}

/// Runs the agent loop when a chat response carries tool calls and the
/// request opted into tools. Inner model turns go back through the same
/// provider queue.
async fn maybe_agent_loop(
    core: &CoreInner,
    runtime: &Arc<ProviderRuntime>,
    ctx: &RequestContext,
    req: &BifrostRequest,
    response: BifrostResponse,
) -> BifrostResult<BifrostResponse> {
    let Some(opts) = req.tools.as_ref() else {
        return Ok(response);
    };
    let BifrostResponse::Chat(chat) = response else {
        return Ok(response);
    };
    let RequestPayload::Chat(base) = &req.payload else {
        return Ok(BifrostResponse::Chat(chat));
    };
    let has_calls = chat
        .primary()
        .is_some_and(|c| !c.message.tool_calls.is_empty());
    if !has_calls {
        return Ok(BifrostResponse::Chat(chat));
    }

    let pools = core.pools.clone();
    let events = core.events.clone();
    let runtime = runtime.clone();
    let invoker_ctx = ctx.clone();
    let template = req.clone();
    let invoke: ModelInvoker<'_> = Box::new(move |chat_req| {
        let pools = pools.clone();
        let events = events.clone();
        let runtime = runtime.clone();
        let ctx = invoker_ctx.clone();
        let mut follow = template.clone();
        follow.payload = RequestPayload::Chat(chat_req);
        Box::pin(async move {
            match enqueue_and_wait(&pools, &events, &runtime, &ctx, &follow).await? {
                AdapterReply::Full(BifrostResponse::Chat(response)) => Ok(response),
                AdapterReply::Full(_) | AdapterReply::Stream(_) => Err(BifrostError::internal(
                    "model re-invocation produced a non-chat reply",
                )),
            }
        })
    });

    let result = agent::run_loop(&core.mcp, ctx, Some(opts), base, chat, invoke).await?;
    Ok(BifrostResponse::Chat(result))
}

fn validate_payload(req: &BifrostRequest) -> BifrostResult<()> {
    use Operation::*;
    use RequestPayload as P;

    let matches = matches!(
        (req.operation, &req.payload),
        (Chat | ChatStream | Responses | ResponsesStream | CountTokens, P::Chat(_))
            | (TextCompletion | TextCompletionStream, P::Text(_))
            | (Embedding, P::Embedding(_))
            | (Speech, P::Speech(_))
            | (Transcription, P::Transcription(_))
            | (ImageGeneration | ImageEdit | ImageVariation, P::Image(_))
            | (ListModels, P::Empty)
            | (BatchCreate | BatchGet | BatchList | BatchCancel, P::Batch(_))
            | (FileUpload | FileGet | FileList | FileDelete | FileContent, P::File(_))
            | (ContainerCreate | ContainerGet | ContainerList | ContainerDelete, P::Container(_))
    );
    if matches {
        Ok(())
    } else {
        Err(BifrostError::new(
            ErrorKind::InvalidRequest,
            format!("payload does not match operation {}", req.operation),
        )
        .with_operation(req.operation.as_str()))
    }
}
