use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Value, json};

use bifrost_common::{BifrostError, BifrostResult, ErrorKind};
use bifrost_provider_core::{
    BatchPayload, BatchResult, CallCtx, ChatRequest, ChatResponse, ChunkStream, ContainerPayload,
    ContainerResult, EmbeddingRequest, EmbeddingResponse, FileContent, FilePayload, FileResult,
    Headers, ImageRequest, ImageResponse, ModelListResponse, Operation, ProviderAdapter,
    SpeechRequest, SpeechResponse, TextRequest, TextResponse, TranscriptionRequest,
    TranscriptionResponse, header_get, header_set, http_status_kind, parse_retry_after,
};

use crate::client::{
    HttpBody, HttpMethod, HttpRequest, HttpResponse, HttpResponseBody, UpstreamClient,
};
use crate::multipart::MultipartForm;
use crate::streaming::spawn_data_stream;

pub mod codec;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Adapter for the OpenAI API and the many upstreams that speak it. A
/// compatible provider is the same adapter with a different name and base
/// url; everything else (codec, auth scheme, streaming framing) is shared.
pub struct OpenAiAdapter {
    name: String,
    default_base_url: String,
    client: Arc<dyn UpstreamClient>,
}

impl OpenAiAdapter {
    pub fn new(client: Arc<dyn UpstreamClient>) -> Self {
        Self::compatible("openai", DEFAULT_BASE_URL, client)
    }

    pub fn compatible(
        name: impl Into<String>,
        base_url: impl Into<String>,
        client: Arc<dyn UpstreamClient>,
    ) -> Self {
        Self {
            name: name.into(),
            default_base_url: base_url.into(),
            client,
        }
    }

    fn url(&self, ctx: &CallCtx<'_>, path: &str) -> String {
        let base = ctx
            .config
            .network
            .base_url
            .as_deref()
            .unwrap_or(&self.default_base_url);
        format!("{}{}", base.trim_end_matches('/'), path)
    }

    fn headers(&self, ctx: &CallCtx<'_>) -> Headers {
        let mut headers: Headers = vec![(
            "authorization".to_string(),
            format!("Bearer {}", ctx.key.value),
        )];
        for (k, v) in ctx.config.network.extra_headers() {
            header_set(&mut headers, k, v.clone());
        }
        headers
    }

    async fn send(
        &self,
        ctx: &CallCtx<'_>,
        op: Operation,
        method: HttpMethod,
        path: &str,
        body: Option<HttpBody>,
        content_type: Option<&str>,
        stream: bool,
    ) -> BifrostResult<HttpResponse> {
        if ctx.context.is_cancelled() {
            return Err(self.tag(BifrostError::cancelled(), ctx, op));
        }
        let timeout = effective_timeout(ctx).map_err(|e| self.tag(e, ctx, op))?;

        let mut req = HttpRequest::new(method, self.url(ctx, path));
        req.headers = self.headers(ctx);
        if let Some(content_type) = content_type {
            header_set(&mut req.headers, "content-type", content_type);
        }
        req.body = body;
        req.stream = stream;
        req.timeout = Some(timeout);

        let resp = tokio::select! {
            _ = ctx.context.cancellation().cancelled() => {
                return Err(self.tag(BifrostError::cancelled(), ctx, op));
            }
            resp = self.client.send(req) => {
                resp.map_err(|e| self.tag(e.into_bifrost(), ctx, op))?
            }
        };

        if resp.is_success() {
            return Ok(resp);
        }

        let status = resp.status;
        let headers = resp.headers.clone();
        let body = resp.into_bytes();
        let mut err = BifrostError::new(http_status_kind(status), codec::decode_error(&body))
            .with_status(status);
        if let Some(delay) = parse_retry_after(&headers) {
            err = err.with_retry_after(delay);
        }
        Err(self.tag(err, ctx, op))
    }

    async fn send_json(
        &self,
        ctx: &CallCtx<'_>,
        op: Operation,
        method: HttpMethod,
        path: &str,
        body: Option<Value>,
    ) -> BifrostResult<Bytes> {
        let body = match body {
            Some(value) => Some(HttpBody::Bytes(Bytes::from(
                serde_json::to_vec(&value).map_err(|e| {
                    self.tag(BifrostError::internal("encode request body").with_cause(e), ctx, op)
                })?,
            ))),
            None => None,
        };
        let content_type = body.is_some().then_some("application/json");
        let resp = self
            .send(ctx, op, method, path, body, content_type, false)
            .await?;
        Ok(resp.into_bytes())
    }

    /// Multipart uploads travel as a form description; wreq encodes the
    /// body and sets the boundary header.
    async fn send_multipart(
        &self,
        ctx: &CallCtx<'_>,
        op: Operation,
        path: &str,
        form: MultipartForm,
    ) -> BifrostResult<Bytes> {
        let resp = self
            .send(
                ctx,
                op,
                HttpMethod::Post,
                path,
                Some(HttpBody::Multipart(form)),
                None,
                false,
            )
            .await?;
        Ok(resp.into_bytes())
    }

    async fn open_stream(
        &self,
        ctx: &CallCtx<'_>,
        op: Operation,
        path: &str,
        body: Value,
    ) -> BifrostResult<tokio::sync::mpsc::Receiver<Bytes>> {
        let body = HttpBody::Bytes(Bytes::from(serde_json::to_vec(&body).map_err(|e| {
            self.tag(BifrostError::internal("encode request body").with_cause(e), ctx, op)
        })?));
        let resp = self
            .send(ctx, op, HttpMethod::Post, path, Some(body), Some("application/json"), true)
            .await?;
        match resp.body {
            HttpResponseBody::Stream(rx) => Ok(rx),
            HttpResponseBody::Bytes(_) => Err(self.tag(
                BifrostError::new(ErrorKind::MalformedResponse, "expected a streaming body"),
                ctx,
                op,
            )),
        }
    }

    fn tag(&self, err: BifrostError, ctx: &CallCtx<'_>, op: Operation) -> BifrostError {
        let mut err = err;
        if err.provider.is_none() {
            err.provider = Some(self.name.clone());
        }
        if err.model.is_none() {
            err.model = Some(ctx.model.to_string());
        }
        if err.operation.is_none() {
            err.operation = Some(op.as_str());
        }
        err
    }

    fn decode<T>(
        &self,
        ctx: &CallCtx<'_>,
        op: Operation,
        result: BifrostResult<T>,
    ) -> BifrostResult<T> {
        result.map_err(|e| self.tag(e, ctx, op))
    }
}

fn effective_timeout(ctx: &CallCtx<'_>) -> BifrostResult<Duration> {
    let configured = ctx.config.network.timeout;
    match ctx.context.remaining() {
        Some(rem) if rem.is_zero() => Err(BifrostError::new(
            ErrorKind::Timeout,
            "request deadline already passed",
        )),
        Some(rem) => Ok(rem.min(configured)),
        None => Ok(configured),
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(&self, ctx: &CallCtx<'_>, req: &ChatRequest) -> BifrostResult<ChatResponse> {
        let body = codec::encode_chat(ctx.model, req, ctx.params, false);
        let bytes = self
            .send_json(ctx, Operation::Chat, HttpMethod::Post, "/chat/completions", Some(body))
            .await?;
        self.decode(ctx, Operation::Chat, codec::decode_chat(&bytes))
    }

    async fn chat_stream(
        &self,
        ctx: &CallCtx<'_>,
        req: &ChatRequest,
    ) -> BifrostResult<ChunkStream> {
        let body = codec::encode_chat(ctx.model, req, ctx.params, true);
        let bytes_rx = self
            .open_stream(ctx, Operation::ChatStream, "/chat/completions", body)
            .await?;
        Ok(spawn_data_stream(
            bytes_rx,
            ctx.context.cancellation().clone(),
            codec::ChatStreamDecoder::default(),
        ))
    }

    async fn responses(
        &self,
        ctx: &CallCtx<'_>,
        req: &ChatRequest,
    ) -> BifrostResult<ChatResponse> {
        let body = codec::encode_responses(ctx.model, req, ctx.params, false);
        let bytes = self
            .send_json(ctx, Operation::Responses, HttpMethod::Post, "/responses", Some(body))
            .await?;
        self.decode(ctx, Operation::Responses, codec::decode_responses(&bytes))
    }

    async fn responses_stream(
        &self,
        ctx: &CallCtx<'_>,
        req: &ChatRequest,
    ) -> BifrostResult<ChunkStream> {
        let body = codec::encode_responses(ctx.model, req, ctx.params, true);
        let bytes_rx = self
            .open_stream(ctx, Operation::ResponsesStream, "/responses", body)
            .await?;
        Ok(spawn_data_stream(
            bytes_rx,
            ctx.context.cancellation().clone(),
            codec::ResponsesStreamDecoder::default(),
        ))
    }

    async fn text_completion(
        &self,
        ctx: &CallCtx<'_>,
        req: &TextRequest,
    ) -> BifrostResult<TextResponse> {
        let body = codec::encode_text(ctx.model, req, ctx.params, false);
        let bytes = self
            .send_json(ctx, Operation::TextCompletion, HttpMethod::Post, "/completions", Some(body))
            .await?;
        self.decode(ctx, Operation::TextCompletion, codec::decode_text(&bytes))
    }

    async fn text_completion_stream(
        &self,
        ctx: &CallCtx<'_>,
        req: &TextRequest,
    ) -> BifrostResult<ChunkStream> {
        let body = codec::encode_text(ctx.model, req, ctx.params, true);
        let bytes_rx = self
            .open_stream(ctx, Operation::TextCompletionStream, "/completions", body)
            .await?;
        Ok(spawn_data_stream(
            bytes_rx,
            ctx.context.cancellation().clone(),
            codec::TextStreamDecoder::default(),
        ))
    }

    async fn embedding(
        &self,
        ctx: &CallCtx<'_>,
        req: &EmbeddingRequest,
    ) -> BifrostResult<EmbeddingResponse> {
        let body = codec::encode_embedding(ctx.model, req);
        let bytes = self
            .send_json(ctx, Operation::Embedding, HttpMethod::Post, "/embeddings", Some(body))
            .await?;
        self.decode(ctx, Operation::Embedding, codec::decode_embedding(&bytes))
    }

    async fn speech(
        &self,
        ctx: &CallCtx<'_>,
        req: &SpeechRequest,
    ) -> BifrostResult<SpeechResponse> {
        let mut body = json!({
            "model": ctx.model,
            "input": req.input,
            "voice": req.voice,
        });
        if let Some(format) = &req.format {
            body["response_format"] = json!(format);
        }
        let body = Bytes::from(serde_json::to_vec(&body).map_err(|e| {
            self.tag(
                BifrostError::internal("encode request body").with_cause(e),
                ctx,
                Operation::Speech,
            )
        })?);
        let resp = self
            .send(
                ctx,
                Operation::Speech,
                HttpMethod::Post,
                "/audio/speech",
                Some(HttpBody::Bytes(body)),
                Some("application/json"),
                false,
            )
            .await?;
        let content_type = header_get(&resp.headers, "content-type").map(str::to_string);
        Ok(SpeechResponse { audio: resp.into_bytes().to_vec(), content_type })
    }

    async fn transcription(
        &self,
        ctx: &CallCtx<'_>,
        req: &TranscriptionRequest,
    ) -> BifrostResult<TranscriptionResponse> {
        let mut form = MultipartForm::new()
            .text("model", ctx.model)
            .file("file", &req.file_name, "application/octet-stream", req.audio.clone());
        if let Some(language) = &req.language {
            form = form.text("language", language);
        }
        if let Some(prompt) = &req.prompt {
            form = form.text("prompt", prompt);
        }
        let bytes = self
            .send_multipart(ctx, Operation::Transcription, "/audio/transcriptions", form)
            .await?;
        self.decode(ctx, Operation::Transcription, codec::decode_transcription(&bytes))
    }

    async fn image_generation(
        &self,
        ctx: &CallCtx<'_>,
        req: &ImageRequest,
    ) -> BifrostResult<ImageResponse> {
        let mut body = json!({ "model": ctx.model, "prompt": req.prompt });
        if let Some(size) = &req.size {
            body["size"] = json!(size);
        }
        if let Some(count) = req.count {
            body["n"] = json!(count);
        }
        let bytes = self
            .send_json(
                ctx,
                Operation::ImageGeneration,
                HttpMethod::Post,
                "/images/generations",
                Some(body),
            )
            .await?;
        self.decode(ctx, Operation::ImageGeneration, codec::decode_images(&bytes))
    }

    async fn image_edit(
        &self,
        ctx: &CallCtx<'_>,
        req: &ImageRequest,
    ) -> BifrostResult<ImageResponse> {
        let mut form = MultipartForm::new()
            .text("model", ctx.model)
            .text("prompt", &req.prompt)
            .file("image", "image.png", "image/png", req.image.clone());
        if !req.mask.is_empty() {
            form = form.file("mask", "mask.png", "image/png", req.mask.clone());
        }
        if let Some(size) = &req.size {
            form = form.text("size", size);
        }
        let bytes = self
            .send_multipart(ctx, Operation::ImageEdit, "/images/edits", form)
            .await?;
        self.decode(ctx, Operation::ImageEdit, codec::decode_images(&bytes))
    }

    async fn image_variation(
        &self,
        ctx: &CallCtx<'_>,
        req: &ImageRequest,
    ) -> BifrostResult<ImageResponse> {
        let mut form = MultipartForm::new()
            .text("model", ctx.model)
            .file("image", "image.png", "image/png", req.image.clone());
        if let Some(count) = req.count {
            form = form.text("n", &count.to_string());
        }
        let bytes = self
            .send_multipart(ctx, Operation::ImageVariation, "/images/variations", form)
            .await?;
        self.decode(ctx, Operation::ImageVariation, codec::decode_images(&bytes))
    }

    async fn list_models(&self, ctx: &CallCtx<'_>) -> BifrostResult<ModelListResponse> {
        let bytes = self
            .send_json(ctx, Operation::ListModels, HttpMethod::Get, "/models", None)
            .await?;
        self.decode(ctx, Operation::ListModels, codec::decode_models(&bytes))
    }

    async fn batch(&self, ctx: &CallCtx<'_>, req: &BatchPayload) -> BifrostResult<BatchResult> {
        match req {
            BatchPayload::Create { input_file_id, endpoint, completion_window } => {
                let body = json!({
                    "input_file_id": input_file_id,
                    "endpoint": endpoint,
                    "completion_window": completion_window,
                });
                let bytes = self
                    .send_json(ctx, Operation::BatchCreate, HttpMethod::Post, "/batches", Some(body))
                    .await?;
                self.decode(ctx, Operation::BatchCreate, codec::decode_batch(&bytes))
                    .map(BatchResult::One)
            }
            BatchPayload::Get { batch_id } => {
                let path = format!("/batches/{batch_id}");
                let bytes = self
                    .send_json(ctx, Operation::BatchGet, HttpMethod::Get, &path, None)
                    .await?;
                self.decode(ctx, Operation::BatchGet, codec::decode_batch(&bytes))
                    .map(BatchResult::One)
            }
            BatchPayload::List => {
                let bytes = self
                    .send_json(ctx, Operation::BatchList, HttpMethod::Get, "/batches", None)
                    .await?;
                self.decode(ctx, Operation::BatchList, codec::decode_batch_list(&bytes))
                    .map(BatchResult::Many)
            }
            BatchPayload::Cancel { batch_id } => {
                let path = format!("/batches/{batch_id}/cancel");
                let bytes = self
                    .send_json(ctx, Operation::BatchCancel, HttpMethod::Post, &path, None)
                    .await?;
                self.decode(ctx, Operation::BatchCancel, codec::decode_batch(&bytes))
                    .map(BatchResult::One)
            }
        }
    }

    async fn file(&self, ctx: &CallCtx<'_>, req: &FilePayload) -> BifrostResult<FileResult> {
        match req {
            FilePayload::Upload { data, file_name, purpose } => {
                let form = MultipartForm::new()
                    .text("purpose", purpose)
                    .file("file", file_name, "application/octet-stream", data.clone());
                let bytes = self
                    .send_multipart(ctx, Operation::FileUpload, "/files", form)
                    .await?;
                self.decode(ctx, Operation::FileUpload, codec::decode_file(&bytes))
                    .map(FileResult::One)
            }
            FilePayload::Get { file_id } => {
                let path = format!("/files/{file_id}");
                let bytes = self
                    .send_json(ctx, Operation::FileGet, HttpMethod::Get, &path, None)
                    .await?;
                self.decode(ctx, Operation::FileGet, codec::decode_file(&bytes))
                    .map(FileResult::One)
            }
            FilePayload::List => {
                let bytes = self
                    .send_json(ctx, Operation::FileList, HttpMethod::Get, "/files", None)
                    .await?;
                self.decode(ctx, Operation::FileList, codec::decode_file_list(&bytes))
                    .map(FileResult::Many)
            }
            FilePayload::Delete { file_id } => {
                let path = format!("/files/{file_id}");
                let bytes = self
                    .send_json(ctx, Operation::FileDelete, HttpMethod::Delete, &path, None)
                    .await?;
                self.decode(ctx, Operation::FileDelete, codec::decode_deletion(&bytes))
                    .map(FileResult::Deleted)
            }
            FilePayload::Content { file_id } => {
                let path = format!("/files/{file_id}/content");
                let resp = self
                    .send(ctx, Operation::FileContent, HttpMethod::Get, &path, None, None, false)
                    .await?;
                let content_type = header_get(&resp.headers, "content-type").map(str::to_string);
                Ok(FileResult::Content(FileContent {
                    data: resp.into_bytes().to_vec(),
                    content_type,
                }))
            }
        }
    }

    async fn container(
        &self,
        ctx: &CallCtx<'_>,
        req: &ContainerPayload,
    ) -> BifrostResult<ContainerResult> {
        match req {
            ContainerPayload::Create { name } => {
                let body = json!({ "name": name });
                let bytes = self
                    .send_json(
                        ctx,
                        Operation::ContainerCreate,
                        HttpMethod::Post,
                        "/containers",
                        Some(body),
                    )
                    .await?;
                self.decode(ctx, Operation::ContainerCreate, codec::decode_container(&bytes))
                    .map(ContainerResult::One)
            }
            ContainerPayload::Get { container_id } => {
                let path = format!("/containers/{container_id}");
                let bytes = self
                    .send_json(ctx, Operation::ContainerGet, HttpMethod::Get, &path, None)
                    .await?;
                self.decode(ctx, Operation::ContainerGet, codec::decode_container(&bytes))
                    .map(ContainerResult::One)
            }
            ContainerPayload::List => {
                let bytes = self
                    .send_json(ctx, Operation::ContainerList, HttpMethod::Get, "/containers", None)
                    .await?;
                self.decode(ctx, Operation::ContainerList, codec::decode_container_list(&bytes))
                    .map(ContainerResult::Many)
            }
            ContainerPayload::Delete { container_id } => {
                let path = format!("/containers/{container_id}");
                let bytes = self
                    .send_json(ctx, Operation::ContainerDelete, HttpMethod::Delete, &path, None)
                    .await?;
                self.decode(ctx, Operation::ContainerDelete, codec::decode_deletion(&bytes))
                    .map(ContainerResult::Deleted)
            }
        }
    }
}
