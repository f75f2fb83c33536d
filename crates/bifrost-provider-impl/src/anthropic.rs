use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;

use bifrost_common::{BifrostError, BifrostResult, ErrorKind};
use bifrost_provider_core::{
    CallCtx, ChatRequest, ChatResponse, ChunkStream, Headers, ModelListResponse, Operation,
    ProviderAdapter, TokenCountResponse, header_set, http_status_kind, parse_retry_after,
};

use crate::client::{
    HttpBody, HttpMethod, HttpRequest, HttpResponse, HttpResponseBody, UpstreamClient,
};
use crate::streaming::spawn_data_stream;

pub mod codec;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";

/// Adapter for the Anthropic messages API. Not OpenAI-compatible: its own
/// codec, named SSE events, and a token-count endpoint the OpenAI family
/// lacks.
pub struct AnthropicAdapter {
    name: String,
    client: Arc<dyn UpstreamClient>,
}

impl AnthropicAdapter {
    pub fn new(client: Arc<dyn UpstreamClient>) -> Self {
        Self::named("anthropic", client)
    }

    pub fn named(name: impl Into<String>, client: Arc<dyn UpstreamClient>) -> Self {
        Self { name: name.into(), client }
    }

    fn url(&self, ctx: &CallCtx<'_>, path: &str) -> String {
        let base = ctx
            .config
            .network
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL);
        format!("{}{}", base.trim_end_matches('/'), path)
    }

    fn headers(&self, ctx: &CallCtx<'_>) -> Headers {
        let mut headers: Headers = vec![
            ("x-api-key".to_string(), ctx.key.value.clone()),
            ("anthropic-version".to_string(), API_VERSION.to_string()),
        ];
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
        body: Option<Value>,
        stream: bool,
    ) -> BifrostResult<HttpResponse> {
        if ctx.context.is_cancelled() {
            return Err(self.tag(BifrostError::cancelled(), ctx, op));
        }

        let configured = ctx.config.network.timeout;
        let timeout = match ctx.context.remaining() {
            Some(rem) if rem.is_zero() => {
                let err = BifrostError::new(ErrorKind::Timeout, "request deadline already passed");
                return Err(self.tag(err, ctx, op));
            }
            Some(rem) => rem.min(configured),
            None => configured,
        };

        let mut req = HttpRequest::new(method, self.url(ctx, path));
        req.headers = self.headers(ctx);
        if let Some(body) = body {
            let bytes = serde_json::to_vec(&body).map_err(|e| {
                self.tag(BifrostError::internal("encode request body").with_cause(e), ctx, op)
            })?;
            header_set(&mut req.headers, "content-type", "application/json");
            req.body = Some(HttpBody::Bytes(Bytes::from(bytes)));
        }
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

    fn tag(&self, mut err: BifrostError, ctx: &CallCtx<'_>, op: Operation) -> BifrostError {
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
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(&self, ctx: &CallCtx<'_>, req: &ChatRequest) -> BifrostResult<ChatResponse> {
        let body = codec::encode_messages(ctx.model, req, ctx.params, false);
        let resp = self
            .send(ctx, Operation::Chat, HttpMethod::Post, "/messages", Some(body), false)
            .await?;
        codec::decode_messages(&resp.into_bytes()).map_err(|e| self.tag(e, ctx, Operation::Chat))
    }

    async fn chat_stream(
        &self,
        ctx: &CallCtx<'_>,
        req: &ChatRequest,
    ) -> BifrostResult<ChunkStream> {
        let body = codec::encode_messages(ctx.model, req, ctx.params, true);
        let resp = self
            .send(ctx, Operation::ChatStream, HttpMethod::Post, "/messages", Some(body), true)
            .await?;
        match resp.body {
            HttpResponseBody::Stream(rx) => Ok(spawn_data_stream(
                rx,
                ctx.context.cancellation().clone(),
                codec::MessagesStreamDecoder::default(),
            )),
            HttpResponseBody::Bytes(_) => Err(self.tag(
                BifrostError::new(ErrorKind::MalformedResponse, "expected a streaming body"),
                ctx,
                Operation::ChatStream,
            )),
        }
    }

    async fn count_tokens(
        &self,
        ctx: &CallCtx<'_>,
        req: &ChatRequest,
    ) -> BifrostResult<TokenCountResponse> {
        let body = codec::encode_count_tokens(ctx.model, req);
        let resp = self
            .send(
                ctx,
                Operation::CountTokens,
                HttpMethod::Post,
                "/messages/count_tokens",
                Some(body),
                false,
            )
            .await?;
        codec::decode_count_tokens(&resp.into_bytes())
            .map_err(|e| self.tag(e, ctx, Operation::CountTokens))
    }

    async fn list_models(&self, ctx: &CallCtx<'_>) -> BifrostResult<ModelListResponse> {
        let resp = self
            .send(ctx, Operation::ListModels, HttpMethod::Get, "/models", None, false)
            .await?;
        codec::decode_models(&resp.into_bytes())
            .map_err(|e| self.tag(e, ctx, Operation::ListModels))
    }
}
