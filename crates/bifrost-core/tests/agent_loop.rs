mod common;

use std::sync::Arc;

use bifrost_common::BifrostResult;
use bifrost_core::{
    Bifrost, BifrostRequest, McpClientConfig, Operation, RequestPayload, ToolHandler,
};
use bifrost_provider_core::{
    ChatChoice, ChatMessage, ChatRequest, ChatResponse, FinishReason, FunctionCall, MessageRole,
    RequestContext, ToolCall, ToolDefinition, ToolOptions,
};
use serde_json::{Value, json};

use common::{FakeAdapter, gateway_with, provider_config};

fn echo_handler(name: &str) -> ToolHandler {
    let name = name.to_string();
    Arc::new(move |_args, _ctx| {
        let name = name.clone();
        Box::pin(async move { BifrostResult::Ok(json!({ "ran": name })) })
    })
}

fn register_tools(core: &Bifrost, tools: &[(&str, bool)]) {
    core.mcp().add_client(McpClientConfig::new("local"));
    for (name, auto) in tools {
        core.mcp().register_tool(
            "local",
            ToolDefinition {
                name: (*name).to_string(),
                description: String::new(),
                schema: json!({ "type": "object" }),
            },
            echo_handler(name),
            *auto,
        );
    }
}

fn call(name: &str) -> ToolCall {
    ToolCall {
        id: Some(format!("call_{name}")),
        function: FunctionCall { name: Some(name.to_string()), arguments: "{}".into() },
    }
}

fn tool_call_response(calls: Vec<ToolCall>) -> ChatResponse {
    ChatResponse {
        id: None,
        model: None,
        choices: vec![ChatChoice {
            index: 0,
            message: ChatMessage {
                role: MessageRole::Assistant,
                content: None,
                tool_calls: calls,
                tool_call_id: None,
            },
            finish_reason: Some(FinishReason::ToolCalls),
        }],
        usage: None,
    }
}

fn tooled_request() -> BifrostRequest {
    BifrostRequest::new(
        "openai",
        "m1",
        Operation::Chat,
        RequestPayload::Chat(ChatRequest {
            messages: vec![ChatMessage::user("please do things")],
            ..Default::default()
        }),
    )
    .with_tools(ToolOptions::default())
}

#[tokio::test]
async fn mixed_tool_calls_execute_auto_subset_and_return_for_approval() {
    let adapter = Arc::new(FakeAdapter::new("openai"));
    let core = gateway_with(vec![(provider_config("openai", 2, 8), adapter.clone())]);
    register_tools(
        &core,
        &[("a", true), ("b", true), ("c", false), ("d", false), ("e", true)],
    );

    adapter.push_chat(Ok(tool_call_response(vec![
        call("a"),
        call("b"),
        call("c"),
        call("d"),
        call("e"),
    ])));

    let ctx = RequestContext::new();
    let response = core.request(&ctx, tooled_request()).await.unwrap();
    let chat = response.into_chat().unwrap();
    let choice = chat.primary().unwrap();

    // Only the one model call was made this turn.
    assert_eq!(adapter.calls(), 1);
    assert_eq!(choice.finish_reason, Some(FinishReason::Stop));

    let remaining: Vec<_> = choice
        .message
        .tool_calls
        .iter()
        .map(|c| c.function.name.clone().unwrap())
        .collect();
    assert_eq!(remaining, vec!["c", "d"]);

    let attached: Value = serde_json::from_str(&choice.message.content_text()).unwrap();
    assert_eq!(
        attached,
        json!([{ "ran": "a" }, { "ran": "b" }, { "ran": "e" }])
    );
}

#[tokio::test]
async fn all_auto_calls_loop_until_the_model_stops() {
    let adapter = Arc::new(FakeAdapter::new("openai"));
    let core = gateway_with(vec![(provider_config("openai", 2, 8), adapter.clone())]);
    register_tools(&core, &[("lookup", true)]);

    adapter.push_chat(Ok(tool_call_response(vec![call("lookup")])));
    adapter.push_chat(Ok(common::text_response("the answer is 4")));

    let ctx = RequestContext::new();
    let response = core.request(&ctx, tooled_request()).await.unwrap();
    let chat = response.into_chat().unwrap();

    assert_eq!(adapter.calls(), 2);
    assert_eq!(
        chat.primary().unwrap().message.content_text(),
        "the answer is 4"
    );
}

#[tokio::test]
async fn manual_only_calls_are_returned_untouched() {
    let adapter = Arc::new(FakeAdapter::new("openai"));
    let core = gateway_with(vec![(provider_config("openai", 2, 8), adapter.clone())]);
    register_tools(&core, &[("approve_me", false)]);

    adapter.push_chat(Ok(tool_call_response(vec![call("approve_me")])));

    let ctx = RequestContext::new();
    let response = core.request(&ctx, tooled_request()).await.unwrap();
    let chat = response.into_chat().unwrap();
    let choice = chat.primary().unwrap();

    assert_eq!(adapter.calls(), 1);
    assert_eq!(choice.finish_reason, Some(FinishReason::ToolCalls));
    assert_eq!(choice.message.tool_calls.len(), 1);
}

#[tokio::test]
async fn depth_bound_stops_runaway_tool_loops() {
    let adapter = Arc::new(FakeAdapter::new("openai"));
    let core = gateway_with(vec![(provider_config("openai", 2, 8), adapter.clone())]);
    register_tools(&core, &[("spin", true)]);

    for _ in 0..8 {
        adapter.push_chat(Ok(tool_call_response(vec![call("spin")])));
    }

    let mut req = tooled_request();
    req.tools = Some(ToolOptions { max_depth: Some(3), ..Default::default() });

    let ctx = RequestContext::new();
    let err = core.request(&ctx, req).await.unwrap_err();
    assert_eq!(err.kind, bifrost_common::ErrorKind::MaxAgentDepthExceeded);
}

#[tokio::test]
async fn discovered_tools_are_advertised_to_the_model() {
    let adapter = Arc::new(FakeAdapter::new("openai"));
    let core = gateway_with(vec![(provider_config("openai", 2, 8), adapter.clone())]);
    register_tools(&core, &[("visible", true)]);

    // Request without tool opt-in: nothing attached, no agent loop.
    adapter.push_chat(Ok(tool_call_response(vec![call("visible")])));
    let ctx = RequestContext::new();
    let req = BifrostRequest::new(
        "openai",
        "m1",
        Operation::Chat,
        RequestPayload::Chat(ChatRequest::default()),
    );
    let response = core.request(&ctx, req).await.unwrap();
    let chat = response.into_chat().unwrap();
    // Tool calls pass through untouched when the request did not opt in.
    assert_eq!(chat.primary().unwrap().message.tool_calls.len(), 1);
}
