//! Pure request/response converters for the OpenAI wire format. No IO:
//! every function maps between the gateway model and wire JSON so the whole
//! codec is testable offline.

use serde::Deserialize;
use serde_json::{Value, json};

use bifrost_common::{BifrostError, BifrostResult, ErrorKind};
use bifrost_provider_core::{
    BatchObject, ChatChoice, ChatMessage, ChatRequest, ChatResponse, ChunkDelta, ContainerObject,
    ContentPart, DeletionStatus, EmbeddingRequest, EmbeddingResponse, FileObject, FinishReason,
    FunctionCall, ImageDatum, ImageResponse, MessageContent, MessageRole, ModelInfo,
    ModelListResponse, ModelParams, StreamEnd, TextRequest, TextResponse, ToolCall, ToolCallDelta,
    TranscriptionResponse, Usage,
};

use crate::sse::SseFrame;
use crate::streaming::{StreamDecoder, StreamStep};

fn malformed(context: &str, err: impl std::fmt::Display) -> BifrostError {
    BifrostError::new(ErrorKind::MalformedResponse, format!("decode {context}")).with_cause(err)
}

// ---- chat completions ----

pub fn encode_chat(model: &str, req: &ChatRequest, params: Option<&ModelParams>, stream: bool) -> Value {
    let mut body = json!({
        "model": model,
        "messages": req.messages.iter().map(encode_message).collect::<Vec<_>>(),
    });
    if !req.tools.is_empty() {
        body["tools"] = Value::Array(
            req.tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.schema,
                        },
                    })
                })
                .collect(),
        );
    }
    if let Some(choice) = &req.tool_choice {
        body["tool_choice"] = choice.clone();
    }
    if stream {
        body["stream"] = json!(true);
        // The final usage frame is opt-in on this endpoint.
        body["stream_options"] = json!({ "include_usage": true });
    }
    apply_params(&mut body, params);
    body
}

fn encode_message(msg: &ChatMessage) -> Value {
    let role = match msg.role {
        MessageRole::System => "system",
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
        MessageRole::Tool => "tool",
    };
    let mut out = json!({ "role": role });

    match &msg.content {
        Some(MessageContent::Text(text)) => out["content"] = json!(text),
        Some(MessageContent::Parts(parts)) => {
            out["content"] = Value::Array(
                parts
                    .iter()
                    .map(|part| match part {
                        ContentPart::Text { text } => json!({ "type": "text", "text": text }),
                        ContentPart::ImageUrl { url } => {
                            json!({ "type": "image_url", "image_url": { "url": url } })
                        }
                    })
                    .collect(),
            )
        }
        None => {}
    }

    if !msg.tool_calls.is_empty() {
        out["tool_calls"] = Value::Array(
            msg.tool_calls
                .iter()
                .map(|call| {
                    json!({
                        "id": call.id,
                        "type": "function",
                        "function": {
                            "name": call.function.name,
                            "arguments": call.function.arguments,
                        },
                    })
                })
                .collect(),
        );
    }
    if let Some(id) = &msg.tool_call_id {
        out["tool_call_id"] = json!(id);
    }
    out
}

fn apply_params(body: &mut Value, params: Option<&ModelParams>) {
    let Some(params) = params else { return };
    if let Some(t) = params.temperature {
        body["temperature"] = json!(t);
    }
    if let Some(p) = params.top_p {
        body["top_p"] = json!(p);
    }
    if let Some(m) = params.max_tokens {
        body["max_tokens"] = json!(m);
    }
    if !params.stop.is_empty() {
        body["stop"] = json!(params.stop);
    }
    if let Some(p) = params.presence_penalty {
        body["presence_penalty"] = json!(p);
    }
    if let Some(f) = params.frequency_penalty {
        body["frequency_penalty"] = json!(f);
    }
    if let Some(obj) = body.as_object_mut() {
        for (k, v) in &params.extra {
            obj.insert(k.clone(), v.clone());
        }
    }
}

#[derive(Deserialize)]
struct WireChatResponse {
    id: Option<String>,
    model: Option<String>,
    #[serde(default)]
    choices: Vec<WireChoice>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireChoice {
    #[serde(default)]
    index: u32,
    message: WireMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireMessage {
    role: Option<String>,
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Deserialize)]
struct WireToolCall {
    id: Option<String>,
    function: WireFunction,
}

#[derive(Deserialize)]
struct WireFunction {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

impl From<WireUsage> for Usage {
    fn from(w: WireUsage) -> Self {
        Usage {
            prompt_tokens: w.prompt_tokens,
            completion_tokens: w.completion_tokens,
            total_tokens: w.total_tokens,
        }
    }
}

pub fn decode_chat(bytes: &[u8]) -> BifrostResult<ChatResponse> {
    let wire: WireChatResponse =
        serde_json::from_slice(bytes).map_err(|e| malformed("chat response", e))?;
    Ok(ChatResponse {
        id: wire.id,
        model: wire.model,
        choices: wire.choices.into_iter().map(decode_choice).collect(),
        usage: wire.usage.map(Into::into),
    })
}

fn decode_choice(wire: WireChoice) -> ChatChoice {
    let role = match wire.message.role.as_deref() {
        Some("system") => MessageRole::System,
        Some("user") => MessageRole::User,
        Some("tool") => MessageRole::Tool,
        _ => MessageRole::Assistant,
    };
    ChatChoice {
        index: wire.index,
        message: ChatMessage {
            role,
            content: wire.message.content.map(MessageContent::Text),
            tool_calls: wire
                .message
                .tool_calls
                .unwrap_or_default()
                .into_iter()
                .map(|c| ToolCall {
                    id: c.id,
                    function: FunctionCall {
                        name: c.function.name,
                        arguments: c.function.arguments.unwrap_or_default(),
                    },
                })
                .collect(),
            tool_call_id: None,
        },
        finish_reason: wire.finish_reason.as_deref().and_then(FinishReason::parse),
    }
}

// ---- responses ----

pub fn encode_responses(
    model: &str,
    req: &ChatRequest,
    params: Option<&ModelParams>,
    stream: bool,
) -> Value {
    let input: Vec<Value> = req
        .messages
        .iter()
        .map(|msg| {
            let role = match msg.role {
                MessageRole::System => "system",
                MessageRole::User => "user",
                MessageRole::Assistant => "assistant",
                MessageRole::Tool => "user",
            };
            json!({ "role": role, "content": msg.content_text() })
        })
        .collect();

    let mut body = json!({ "model": model, "input": input });
    if !req.tools.is_empty() {
        body["tools"] = Value::Array(
            req.tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.schema,
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
        if let Some(m) = params.max_tokens {
            body["max_output_tokens"] = json!(m);
        }
    }
    body
}

#[derive(Deserialize)]
struct WireResponsesResponse {
    id: Option<String>,
    model: Option<String>,
    #[serde(default)]
    output: Vec<WireOutputItem>,
    usage: Option<WireResponsesUsage>,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum WireOutputItem {
    #[serde(rename = "message")]
    Message {
        #[serde(default)]
        content: Vec<WireOutputContent>,
    },
    #[serde(rename = "function_call")]
    FunctionCall {
        call_id: Option<String>,
        name: Option<String>,
        #[serde(default)]
        arguments: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct WireOutputContent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct WireResponsesUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

/// The responses API is normalised into the chat shape: output text becomes
/// the assistant message, function_call items become tool calls.
pub fn decode_responses(bytes: &[u8]) -> BifrostResult<ChatResponse> {
    let wire: WireResponsesResponse =
        serde_json::from_slice(bytes).map_err(|e| malformed("responses response", e))?;

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for item in wire.output {
        match item {
            WireOutputItem::Message { content } => {
                for part in content {
                    if part.kind == "output_text" {
                        text.push_str(&part.text);
                    }
                }
            }
            WireOutputItem::FunctionCall { call_id, name, arguments } => {
                tool_calls.push(ToolCall {
                    id: call_id,
                    function: FunctionCall { name, arguments },
                });
            }
            WireOutputItem::Other => {}
        }
    }

    let finish_reason = if tool_calls.is_empty() {
        Some(FinishReason::Stop)
    } else {
        Some(FinishReason::ToolCalls)
    };
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
            finish_reason,
        }],
        usage: wire.usage.map(|u| Usage {
            prompt_tokens: u.input_tokens,
            completion_tokens: u.output_tokens,
            total_tokens: u.total_tokens,
        }),
    })
}

// ---- text completions ----

pub fn encode_text(model: &str, req: &TextRequest, params: Option<&ModelParams>, stream: bool) -> Value {
    let mut body = json!({ "model": model, "prompt": req.prompt });
    if stream {
        body["stream"] = json!(true);
    }
    apply_params(&mut body, params);
    body
}

#[derive(Deserialize)]
struct WireTextResponse {
    #[serde(default)]
    choices: Vec<WireTextChoice>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireTextChoice {
    #[serde(default)]
    text: String,
    finish_reason: Option<String>,
}

pub fn decode_text(bytes: &[u8]) -> BifrostResult<TextResponse> {
    let wire: WireTextResponse =
        serde_json::from_slice(bytes).map_err(|e| malformed("text response", e))?;
    let first = wire.choices.into_iter().next();
    Ok(TextResponse {
        text: first.as_ref().map(|c| c.text.clone()).unwrap_or_default(),
        finish_reason: first
            .and_then(|c| c.finish_reason)
            .as_deref()
            .and_then(FinishReason::parse),
        usage: wire.usage.map(Into::into),
    })
}

// ---- embeddings ----

pub fn encode_embedding(model: &str, req: &EmbeddingRequest) -> Value {
    let mut body = json!({ "model": model, "input": req.input });
    if let Some(dims) = req.dimensions {
        body["dimensions"] = json!(dims);
    }
    body
}

#[derive(Deserialize)]
struct WireEmbeddingResponse {
    #[serde(default)]
    data: Vec<WireEmbeddingDatum>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireEmbeddingDatum {
    embedding: Vec<f32>,
}

pub fn decode_embedding(bytes: &[u8]) -> BifrostResult<EmbeddingResponse> {
    let wire: WireEmbeddingResponse =
        serde_json::from_slice(bytes).map_err(|e| malformed("embedding response", e))?;
    Ok(EmbeddingResponse {
        embeddings: wire.data.into_iter().map(|d| d.embedding).collect(),
        usage: wire.usage.map(Into::into),
    })
}

// ---- misc object decodes ----

pub fn decode_transcription(bytes: &[u8]) -> BifrostResult<TranscriptionResponse> {
    #[derive(Deserialize)]
    struct Wire {
        text: String,
    }
    let wire: Wire = serde_json::from_slice(bytes).map_err(|e| malformed("transcription", e))?;
    Ok(TranscriptionResponse { text: wire.text })
}

pub fn decode_images(bytes: &[u8]) -> BifrostResult<ImageResponse> {
    #[derive(Deserialize)]
    struct Wire {
        #[serde(default)]
        data: Vec<ImageDatum>,
    }
    let wire: Wire = serde_json::from_slice(bytes).map_err(|e| malformed("image response", e))?;
    Ok(ImageResponse { images: wire.data })
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
        owned_by: Option<String>,
        created: Option<i64>,
    }
    let wire: Wire = serde_json::from_slice(bytes).map_err(|e| malformed("model list", e))?;
    Ok(ModelListResponse {
        models: wire
            .data
            .into_iter()
            .map(|m| ModelInfo { id: m.id, owned_by: m.owned_by, created: m.created })
            .collect(),
    })
}

#[derive(Deserialize)]
struct WireBatch {
    id: String,
    #[serde(default)]
    status: String,
    endpoint: Option<String>,
    input_file_id: Option<String>,
    output_file_id: Option<String>,
}

impl From<WireBatch> for BatchObject {
    fn from(w: WireBatch) -> Self {
        BatchObject {
            id: w.id,
            status: w.status,
            endpoint: w.endpoint,
            input_file_id: w.input_file_id,
            output_file_id: w.output_file_id,
        }
    }
}

pub fn decode_batch(bytes: &[u8]) -> BifrostResult<BatchObject> {
    let wire: WireBatch = serde_json::from_slice(bytes).map_err(|e| malformed("batch", e))?;
    Ok(wire.into())
}

pub fn decode_batch_list(bytes: &[u8]) -> BifrostResult<Vec<BatchObject>> {
    #[derive(Deserialize)]
    struct Wire {
        #[serde(default)]
        data: Vec<WireBatch>,
    }
    let wire: Wire = serde_json::from_slice(bytes).map_err(|e| malformed("batch list", e))?;
    Ok(wire.data.into_iter().map(Into::into).collect())
}

#[derive(Deserialize)]
struct WireFile {
    id: String,
    filename: Option<String>,
    bytes: Option<u64>,
    purpose: Option<String>,
}

impl From<WireFile> for FileObject {
    fn from(w: WireFile) -> Self {
        FileObject { id: w.id, file_name: w.filename, bytes: w.bytes, purpose: w.purpose }
    }
}

pub fn decode_file(bytes: &[u8]) -> BifrostResult<FileObject> {
    let wire: WireFile = serde_json::from_slice(bytes).map_err(|e| malformed("file", e))?;
    Ok(wire.into())
}

pub fn decode_file_list(bytes: &[u8]) -> BifrostResult<Vec<FileObject>> {
    #[derive(Deserialize)]
    struct Wire {
        #[serde(default)]
        data: Vec<WireFile>,
    }
    let wire: Wire = serde_json::from_slice(bytes).map_err(|e| malformed("file list", e))?;
    Ok(wire.data.into_iter().map(Into::into).collect())
}

#[derive(Deserialize)]
struct WireContainer {
    id: String,
    name: Option<String>,
    status: Option<String>,
}

pub fn decode_container(bytes: &[u8]) -> BifrostResult<ContainerObject> {
    let wire: WireContainer =
        serde_json::from_slice(bytes).map_err(|e| malformed("container", e))?;
    Ok(ContainerObject { id: wire.id, name: wire.name, status: wire.status })
}

pub fn decode_container_list(bytes: &[u8]) -> BifrostResult<Vec<ContainerObject>> {
    #[derive(Deserialize)]
    struct Wire {
        #[serde(default)]
        data: Vec<WireContainer>,
    }
    let wire: Wire = serde_json::from_slice(bytes).map_err(|e| malformed("container list", e))?;
    Ok(wire
        .data
        .into_iter()
        .map(|c| ContainerObject { id: c.id, name: c.name, status: c.status })
        .collect())
}

pub fn decode_deletion(bytes: &[u8]) -> BifrostResult<DeletionStatus> {
    #[derive(Deserialize)]
    struct Wire {
        id: String,
        #[serde(default)]
        deleted: bool,
    }
    let wire: Wire = serde_json::from_slice(bytes).map_err(|e| malformed("deletion", e))?;
    Ok(DeletionStatus { id: wire.id, deleted: wire.deleted })
}

/// Best-effort error message extraction; falls back to the raw body.
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

// ---- streaming decoders ----

#[derive(Default)]
pub struct ChatStreamDecoder {
    finish_reason: Option<FinishReason>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct WireChatChunk {
    #[serde(default)]
    choices: Vec<WireChunkChoice>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireChunkChoice {
    delta: WireChunkDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct WireChunkDelta {
    role: Option<String>,
    content: Option<String>,
    tool_calls: Option<Vec<WireChunkToolCall>>,
}

#[derive(Deserialize)]
struct WireChunkToolCall {
    #[serde(default)]
    index: u32,
    id: Option<String>,
    function: Option<WireFunction>,
}

impl StreamDecoder for ChatStreamDecoder {
    fn frame(&mut self, frame: &SseFrame) -> StreamStep {
        if frame.data == "[DONE]" {
            return StreamStep::End(self.take_end());
        }
        let chunk: WireChatChunk = match serde_json::from_str(&frame.data) {
            Ok(chunk) => chunk,
            Err(e) => return StreamStep::Fail(malformed("chat stream chunk", e)),
        };
        if let Some(usage) = chunk.usage {
            self.usage = Some(usage.into());
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return StreamStep::Skip;
        };
        if let Some(reason) = choice.finish_reason.as_deref().and_then(FinishReason::parse) {
            self.finish_reason = Some(reason);
        }

        let delta = choice.delta;
        let tool_calls: Vec<ToolCallDelta> = delta
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|c| ToolCallDelta {
                index: c.index,
                id: c.id,
                name: c.function.as_ref().and_then(|f| f.name.clone()),
                arguments: c.function.and_then(|f| f.arguments),
            })
            .collect();

        if delta.content.is_none() && tool_calls.is_empty() && delta.role.is_none() {
            return StreamStep::Skip;
        }
        StreamStep::Delta(ChunkDelta {
            role: delta.role.as_deref().and_then(|r| match r {
                "assistant" => Some(MessageRole::Assistant),
                _ => None,
            }),
            text: delta.content,
            tool_calls,
        })
    }

    fn take_end(&mut self) -> StreamEnd {
        StreamEnd { finish_reason: self.finish_reason.take(), usage: self.usage.take() }
    }
}

#[derive(Default)]
pub struct ResponsesStreamDecoder {
    usage: Option<Usage>,
}

impl StreamDecoder for ResponsesStreamDecoder {
    fn frame(&mut self, frame: &SseFrame) -> StreamStep {
        let Ok(data) = serde_json::from_str::<Value>(&frame.data) else {
            return StreamStep::Skip;
        };
        let event = frame
            .event
            .as_deref()
            .or_else(|| data.get("type").and_then(Value::as_str))
            .unwrap_or_default()
            .to_string();

        match event.as_str() {
            "response.output_text.delta" => {
                match data.get("delta").and_then(Value::as_str) {
                    Some(text) => StreamStep::Delta(ChunkDelta::text(text)),
                    None => StreamStep::Skip,
                }
            }
            "response.completed" => {
                if let Some(usage) = data.pointer("/response/usage") {
                    self.usage = serde_json::from_value::<WireResponsesUsage>(usage.clone())
                        .ok()
                        .map(|u| Usage {
                            prompt_tokens: u.input_tokens,
                            completion_tokens: u.output_tokens,
                            total_tokens: u.total_tokens,
                        });
                }
                StreamStep::End(self.take_end())
            }
            "response.failed" | "error" => {
                let message = data
                    .pointer("/response/error/message")
                    .or_else(|| data.pointer("/message"))
                    .and_then(Value::as_str)
                    .unwrap_or("response stream failed");
                StreamStep::Fail(BifrostError::new(ErrorKind::UpstreamUnavailable, message))
            }
            _ => StreamStep::Skip,
        }
    }

    fn take_end(&mut self) -> StreamEnd {
        StreamEnd { finish_reason: Some(FinishReason::Stop), usage: self.usage.take() }
    }
}

#[derive(Default)]
pub struct TextStreamDecoder {
    finish_reason: Option<FinishReason>,
    usage: Option<Usage>,
}

impl StreamDecoder for TextStreamDecoder {
    fn frame(&mut self, frame: &SseFrame) -> StreamStep {
        if frame.data == "[DONE]" {
            return StreamStep::End(self.take_end());
        }
        #[derive(Deserialize)]
        struct Wire {
            #[serde(default)]
            choices: Vec<WireTextChoice>,
            usage: Option<WireUsage>,
        }
        let chunk: Wire = match serde_json::from_str(&frame.data) {
            Ok(chunk) => chunk,
            Err(e) => return StreamStep::Fail(malformed("text stream chunk", e)),
        };
        if let Some(usage) = chunk.usage {
            self.usage = Some(usage.into());
        }
        let Some(choice) = chunk.choices.into_iter().next() else {
            return StreamStep::Skip;
        };
        if let Some(reason) = choice.finish_reason.as_deref().and_then(FinishReason::parse) {
            self.finish_reason = Some(reason);
        }
        if choice.text.is_empty() {
            return StreamStep::Skip;
        }
        StreamStep::Delta(ChunkDelta::text(choice.text))
    }

    fn take_end(&mut self) -> StreamEnd {
        StreamEnd { finish_reason: self.finish_reason.take(), usage: self.usage.take() }
    }
}
