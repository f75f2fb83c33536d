//! Multi-turn agent loop: execute auto-executable tool calls, feed results
//! back to the model, and repeat until the model stops calling tools or the
//! depth bound trips. Mixed auto/manual batches execute the auto subset and
//! hand the rest back to the caller for approval.

use futures_util::future::BoxFuture;
use futures_util::future::join_all;
use serde_json::{Value, json};

use bifrost_common::{BifrostError, BifrostResult, ErrorKind};
use bifrost_provider_core::{
    ChatMessage, ChatRequest, ChatResponse, FinishReason, MessageContent, RequestContext,
    ToolCall, ToolOptions,
};

use super::registry::McpToolManager;

/// Model re-invocation callback; dispatch wires this to the provider queue
/// so every inner turn goes through the same worker path.
pub(crate) type ModelInvoker<'a> =
    Box<dyn FnMut(ChatRequest) -> BoxFuture<'a, BifrostResult<ChatResponse>> + Send + 'a>;

pub(crate) async fn run_loop(
    mgr: &McpToolManager,
    ctx: &RequestContext,
    opts: Option<&ToolOptions>,
    base: &ChatRequest,
    first: ChatResponse,
    mut invoke_model: ModelInvoker<'_>,
) -> BifrostResult<ChatResponse> {
    let max_depth = opts
        .and_then(|o| o.max_depth)
        .unwrap_or(mgr.config().max_agent_depth);
    let mut conversation = base.messages.clone();
    let mut response = first;
    let mut depth: u32 = 0;

    loop {
        let Some(choice) = response.primary() else {
            return Ok(response);
        };
        if choice.message.tool_calls.is_empty() {
            return Ok(response);
        }

        let calls = choice.message.tool_calls.clone();
        let (auto, manual) = partition_calls(mgr, opts, &calls);

        if auto.is_empty() {
            // Nothing executable without approval; hand the batch back.
            if let Some(choice) = response.primary_mut() {
                choice.finish_reason = Some(FinishReason::ToolCalls);
            }
            return Ok(response);
        }

        if manual.is_empty() {
            if depth >= max_depth {
                return Err(BifrostError::new(
                    ErrorKind::MaxAgentDepthExceeded,
                    format!("agent loop exceeded depth {max_depth}"),
                ));
            }
            depth += 1;

            let results = execute_calls(mgr, ctx, &auto).await;
            let assistant = response
                .primary()
                .map(|c| c.message.clone())
                .unwrap_or_else(|| ChatMessage::assistant(""));
            conversation.push(assistant);
            for (call, result) in auto.iter().zip(results) {
                let call_id = call.id.clone().unwrap_or_default();
                conversation.push(ChatMessage::tool_result(call_id, result.to_string()));
            }

            response = invoke_model(ChatRequest {
                messages: conversation.clone(),
                tools: base.tools.clone(),
                tool_choice: base.tool_choice.clone(),
            })
            .await?;
            continue;
        }

        // Mixed batch: run the auto subset, attach its results to the
        // message content as a JSON array in original order, and leave the
        // manual calls pending with finish_reason=stop. No model call this
        // turn; the caller decides what to do with the manual subset.
        let results = execute_calls(mgr, ctx, &auto).await;
        if let Some(choice) = response.primary_mut() {
            attach_results_to_content(&mut choice.message, &results);
            choice.message.tool_calls = manual;
            choice.finish_reason = Some(FinishReason::Stop);
        }
        return Ok(response);
    }
}

/// Splits calls into auto-executable and manual, preserving order within
/// each group. Calls without a resolvable tool name are manual.
pub(crate) fn partition_calls(
    mgr: &McpToolManager,
    opts: Option<&ToolOptions>,
    calls: &[ToolCall],
) -> (Vec<ToolCall>, Vec<ToolCall>) {
    let mut auto = Vec::new();
    let mut manual = Vec::new();
    for call in calls {
        let is_auto = call
            .function
            .name
            .as_deref()
            .is_some_and(|name| mgr.is_auto_executable(name, opts));
        if is_auto {
            auto.push(call.clone());
        } else {
            manual.push(call.clone());
        }
    }
    (auto, manual)
}

/// Executes calls concurrently; the result vector preserves the input
/// order. Failures become `{"error": ...}` values so one bad tool does not
/// abort the batch.
pub(crate) async fn execute_calls(
    mgr: &McpToolManager,
    ctx: &RequestContext,
    calls: &[ToolCall],
) -> Vec<Value> {
    let futures = calls.iter().map(|call| async move {
        let Some(name) = call.function.name.as_deref() else {
            return json!({ "error": "tool call without a name" });
        };
        let args: Value = serde_json::from_str(&call.function.arguments)
            .unwrap_or_else(|_| json!({}));
        match mgr.invoke(name, args, ctx).await {
            Ok(output) => output,
            Err(err) => {
                tracing::warn!(tool = name, error = %err, "tool execution failed");
                json!({ "error": err.to_string() })
            }
        }
    });
    join_all(futures).await
}

fn attach_results_to_content(message: &mut ChatMessage, results: &[Value]) {
    let serialized = Value::Array(results.to_vec()).to_string();
    let existing = message.content_text();
    let combined = if existing.is_empty() {
        serialized
    } else {
        format!("{existing}\n{serialized}")
    };
    message.content = Some(MessageContent::Text(combined));
}
