//! Pure converters for the Anthropic messages wire format.

use serde::Deserialize;
use serde_json::{Value, json};

use bifrost_common::{BifrostError, BifrostResult, ErrorKind};
use bifrost_provider_core::{
    ChatChoice, ChatMessage, ChatRequest, ChatResponse, ChunkDelta, FinishReason, FunctionCall,
    MessageContent, MessageRole, ModelInfo, ModelListResponse, ModelParams, StreamEnd,
    TokenCountResponse, ToolCall, ToolCallDelta, Usage,
};

use crate::sse::SseFrame;
use crate::streaming::{StreamDecoder, StreamStep};

const DEFAULT_MAX_TOKENS: u32 = 4096;

fn malformed(context: &str, err: impl std::fmt::Display) -> BifrostError {
    BifrostError::new(ErrorKind::MalformedResponse, format!("decode {context}")).with_cause(err)
}

pub fn encode_messages(
    model: &str,
    req: &ChatRequest,
    params: Option<&ModelParams>,
    stream: bool,
) -> Value {
    let (system, messages) = split_messages(&req.messages);

    let mut body = json!({
        "model": model,
        "max_tokens": params.and_then(|p| p.max_tokens).unwrap_or(DEFAULT_MAX_TOKENS),
        "messages": messages,
    });
    if !system.is_empty() {
        body["system"] = json!(system);
    }
    if !req.tools.is_empty() {
        body["tools"] = Value::Array(
            req.tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.schema,
                    })
                })
                .collect(),
        );
    }
    if stream {
        body["stream"] = json!(true);
    }
    if let Some(params) = params {
        if let Some(t) = params.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(p) = params.top_p {
            body["top_p"] = json!(p);
        }
        if !params.stop.is_empty() {
            body["stop_sequences"] = json!(params.stop);
        }
    }
    body
}

/// Count-tokens takes the message shape without `max_tokens` or `stream`.
pub fn encode_count_tokens(model: &str, req: &ChatRequest) -> Value {
    let (system, messages) = split_messages(&req.messages);
    let mut body = json!({ "model": model, "messages": messages });
    if !system.is_empty() {
        body["system"] = json!(system);
    }
    body
}

/// System prompts move to the top-level `system` field; tool results become
/// `tool_result` blocks on user messages, with consecutive results grouped
/// into one message as the API expects after a `tool_use` turn.
fn split_messages(messages: &[ChatMessage]) -> (String, Vec<Value>) {
    let mut system = String::new();
    let mut out: Vec<Value> = Vec::new();
    let mut pending_results: Vec<Value> = Vec::new();

    for msg in messages {
        if msg.role == MessageRole::Tool {
            pending_results.push(json!({
                "type": "tool_result",
                "tool_use_id": msg.tool_call_id,
                "content": msg.content_text(),
            }));
            continue;
        }
        if !pending_results.is_empty() {
            out.push(json!({ "role": "user", "content": pending_results }));
            pending_results = Vec::new();
        }

        match msg.role {
            MessageRole::System => {
                if !system.is_empty() {
                    system.push('\n');
                }
                system.push_str(&msg.content_text());
            }
            MessageRole::User => {
                out.push(json!({ "role": "user", "content": msg.content_text() }));
            }
            MessageRole::Assistant => {
                let mut blocks: Vec<Value> = Vec::new();
                let text = msg.content_text();
                if !text.is_empty() {
                    blocks.push(json!({ "type": "text", "text": text }));
                }
                for call in &msg.tool_calls {
                    let input: Value = call
                        .function
                        .arguments
                        .parse::<Value>()
                        .ok()
                        .and_then(|v| v.is_object().then_some(v))
                        .unwrap_or_else(|| json!({}));
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.function.name,
                        "input": input,
                    }));
                }
                out.push(json!({ "role": "assistant", "content": blocks }));
            }
            MessageRole::Tool => unreachable!("handled above"),
        }
    }
    if !pending_results.is_empty() {
        out.push(json!({ "role": "user", "content": pending_results }));
    }

    (system, out)
}

#[derive(Deserialize)]
struct WireMessage {
    id: Option<String>,
    model: Option<String>,
    #[serde(default)]
    content: Vec<WireBlock>,
    stop_reason: Option<String>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum WireBlock {
    #[serde(rename = "text")]
    Text {
        #[serde(default)]
        text: String,
    },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: Option<String>,
        name: Option<String>,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize, Default)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

impl From<WireUsage> for Usage {
    fn from(w: WireUsage) -> Self {
        Usage {
            prompt_tokens: w.input_tokens,
            completion_tokens: w.output_tokens,
            total_tokens: w.input_tokens + w.output_tokens,
        }
    }
}

pub fn decode_messages(bytes: &[u8]) -> BifrostResult<ChatResponse> {
    let wire: WireMessage =
        serde_json::from_slice(bytes).map_err(|e| malformed("messages response", e))?;

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for block in wire.content {
        match block {
            WireBlock::Text { text: t } => text.push_str(&t),
            WireBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                id,
                function: FunctionCall {
                    name,
                    arguments: serde_json::to_string(&input).unwrap_or_default(),
                },
            }),
            WireBlock::Other => {}
        }
    }

    Ok(ChatResponse {
        id: wire.id,
        model: wire.model,
        choices: vec![ChatChoice {
            index: 0,
            message: ChatMessage {
                role: MessageRole::Assistant,
                content: (!text.is_empty()).then(|| MessageContent::Text(text)),
                tool_calls,
                tool_call_id: None,
            },
            finish_reason: wire.stop_reason.as_deref().and_then(FinishReason::parse),
        }],
        usage: wire.usage.map(Into::into),
    })
}

pub fn decode_count_tokens(bytes: &[u8]) -> BifrostResult<TokenCountResponse> {
    #[derive(Deserialize)]
    struct Wire {
        input_tokens: u32,
    }
    let wire: Wire = serde_json::from_slice(bytes).map_err(|e| malformed("count_tokens", e))?;
    Ok(TokenCountResponse { input_tokens: wire.input_tokens })
}

pub fn decode_models(bytes: &[u8]) -> BifrostResult<ModelListResponse> {
    #[derive(Deserialize)]
    struct Wire {
        #[serde(default)]
        data: Vec<WireModel>,
    }
    #[derive(Deserialize)]
    struct WireModel {
        id: String,
    }
    let wire: Wire = serde_json::from_slice(bytes).map_err(|e| malformed("model list", e))?;
    Ok(ModelListResponse {
        models: wire
            .data
            .into_iter()
            .map(|m| ModelInfo { id: m.id, owned_by: Some("anthropic".to_string()), created: None })
            .collect(),
    })
}

pub fn decode_error(bytes: &[u8]) -> String {
    #[derive(Deserialize)]
    struct Wire {
        error: WireError,
    }
    #[derive(Deserialize)]
    struct WireError {
        message: String,
    }
    match serde_json::from_slice::<Wire>(bytes) {
        Ok(wire) => wire.error.message,
        Err(_) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

/// Decoder for the named-event stream: `message_start`,
/// `content_block_start`/`delta`/`stop`, `message_delta`, `message_stop`.
#[derive(Default)]
pub struct MessagesStreamDecoder {
    usage: WireUsage,
    finish_reason: Option<FinishReason>,
}

impl StreamDecoder for MessagesStreamDecoder {
    fn frame(&mut self, frame: &SseFrame) -> StreamStep {
        let event = frame.event.as_deref().unwrap_or_default();
        let Ok(data) = serde_json::from_str::<Value>(&frame.data) else {
            return StreamStep::Skip;
        };

        match event {
            "message_start" => {
                if let Some(tokens) = data
                    .pointer("/message/usage/input_tokens")
                    .and_then(Value::as_u64)
                {
                    self.usage.input_tokens = tokens as u32;
                }
                StreamStep::Skip
            }
            "content_block_start" => {
                let index = data.get("index").and_then(Value::as_u64).unwrap_or(0) as u32;
                let block = data.get("content_block");
                let is_tool = block
                    .and_then(|b| b.get("type"))
                    .and_then(Value::as_str)
                    .is_some_and(|t| t == "tool_use");
                if !is_tool {
                    return StreamStep::Skip;
                }
                StreamStep::Delta(ChunkDelta {
                    role: None,
                    text: None,
                    tool_calls: vec![ToolCallDelta {
                        index,
                        id: block
                            .and_then(|b| b.get("id"))
                            .and_then(Value::as_str)
                            .map(str::to_string),
                        name: block
                            .and_then(|b| b.get("name"))
                            .and_then(Value::as_str)
                            .map(str::to_string),
                        arguments: None,
                    }],
                })
            }
            "content_block_delta" => {
                let index = data.get("index").and_then(Value::as_u64).unwrap_or(0) as u32;
                let delta = data.get("delta");
                let kind = delta
                    .and_then(|d| d.get("type"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                match kind {
                    "text_delta" => match delta.and_then(|d| d.get("text")).and_then(Value::as_str)
                    {
                        Some(text) => StreamStep::Delta(ChunkDelta::text(text)),
                        None => StreamStep::Skip,
                    },
                    "input_json_delta" => {
                        let partial = delta
                            .and_then(|d| d.get("partial_json"))
                            .and_then(Value::as_str)
                            .unwrap_or_default();
                        StreamStep::Delta(ChunkDelta {
                            role: None,
                            text: None,
                            tool_calls: vec![ToolCallDelta {
                                index,
                                id: None,
                                name: None,
                                arguments: Some(partial.to_string()),
                            }],
                        })
                    }
                    _ => StreamStep::Skip,
                }
            }
            "message_delta" => {
                if let Some(reason) = data
                    .pointer("/delta/stop_reason")
                    .and_then(Value::as_str)
                    .and_then(FinishReason::parse)
                {
                    self.finish_reason = Some(reason);
                }
                if let Some(tokens) = data.pointer("/usage/output_tokens").and_then(Value::as_u64)
                {
                    self.usage.output_tokens = tokens as u32;
                }
                StreamStep::Skip
            }
            "message_stop" => StreamStep::End(self.take_end()),
            "error" => {
                let message = data
                    .pointer("/error/message")
                    .and_then(Value::as_str)
                    .unwrap_or("message stream failed");
                StreamStep::Fail(BifrostError::new(ErrorKind::UpstreamUnavailable, message))
            }
            _ => StreamStep::Skip,
        }
    }

    fn take_end(&mut self) -> StreamEnd {
        let usage = std::mem::take(&mut self.usage);
        StreamEnd {
            finish_reason: self.finish_reason.take(),
            usage: Some(usage.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_and_tool_results_are_restructured() {
        let req = ChatRequest {
            messages: vec![
                ChatMessage::system("be terse"),
                ChatMessage::user("what is 2+2"),
                ChatMessage {
                    role: MessageRole::Assistant,
                    content: None,
                    tool_calls: vec![ToolCall {
                        id: Some("tu_1".into()),
                        function: FunctionCall {
                            name: Some("calc".into()),
                            arguments: r#"{"expr":"2+2"}"#.into(),
                        },
                    }],
                    tool_call_id: None,
                },
                ChatMessage::tool_result("tu_1", "4"),
            ],
            ..Default::default()
        };
        let body = encode_messages("claude-sonnet-4-5", &req, None, false);

        assert_eq!(body["system"], "be terse");
        assert_eq!(body["max_tokens"], json!(DEFAULT_MAX_TOKENS));
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1]["content"][0]["type"], "tool_use");
        assert_eq!(messages[1]["content"][0]["input"]["expr"], "2+2");
        assert_eq!(messages[2]["role"], "user");
        assert_eq!(messages[2]["content"][0]["type"], "tool_result");
        assert_eq!(messages[2]["content"][0]["tool_use_id"], "tu_1");
    }

    #[test]
    fn stream_decoder_accumulates_usage_across_phases() {
        let mut decoder = MessagesStreamDecoder::default();

        decoder.frame(&SseFrame {
            event: Some("message_start".into()),
            data: r#"{"message":{"usage":{"input_tokens":11}}}"#.into(),
        });
        let step = decoder.frame(&SseFrame {
            event: Some("content_block_delta".into()),
            data: r#"{"index":0,"delta":{"type":"text_delta","text":"Hey"}}"#.into(),
        });
        assert!(matches!(step, StreamStep::Delta(d) if d.text.as_deref() == Some("Hey")));

        decoder.frame(&SseFrame {
            event: Some("message_delta".into()),
            data: r#"{"delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":6}}"#.into(),
        });
        let step = decoder.frame(&SseFrame {
            event: Some("message_stop".into()),
            data: "{}".into(),
        });
        match step {
            StreamStep::End(end) => {
                assert_eq!(end.finish_reason, Some(FinishReason::Stop));
                let usage = end.usage.unwrap();
                assert_eq!(usage.prompt_tokens, 11);
                assert_eq!(usage.completion_tokens, 6);
                assert_eq!(usage.total_tokens, 17);
            }
            _ => panic!("expected end"),
        }
    }

    #[test]
    fn tool_use_stream_fragments_carry_block_index() {
        let mut decoder = MessagesStreamDecoder::default();
        let step = decoder.frame(&SseFrame {
            event: Some("content_block_start".into()),
            data: r#"{"index":1,"content_block":{"type":"tool_use","id":"tu_9","name":"calc"}}"#
                .into(),
        });
        match step {
            StreamStep::Delta(delta) => {
                assert_eq!(delta.tool_calls[0].index, 1);
                assert_eq!(delta.tool_calls[0].name.as_deref(), Some("calc"));
            }
            _ => panic!("expected delta"),
        }

        let step = decoder.frame(&SseFrame {
            event: Some("content_block_delta".into()),
            data: r#"{"index":1,"delta":{"type":"input_json_delta","partial_json":"{\"e"}}"#.into(),
        });
        match step {
            StreamStep::Delta(delta) => {
                assert_eq!(delta.tool_calls[0].arguments.as_deref(), Some("{\"e"));
            }
            _ => panic!("expected delta"),
        }
    }
}
