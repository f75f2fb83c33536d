use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use wreq::{Client, Method};

use bifrost_common::{BifrostError, ErrorKind};
use bifrost_provider_core::Headers;

use crate::multipart::MultipartForm;

/// Byte-level upstream transport. Adapters build [`HttpRequest`]s; the
/// client performs IO. The seam exists so adapter codecs never touch a
/// socket and tests can swap in a scripted transport.
pub trait UpstreamClient: Send + Sync {
    fn send<'a>(
        &'a self,
        req: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, TransportError>> + Send + 'a>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

/// Outbound request body. Multipart stays a description here; the client
/// encodes it with wreq's multipart support at send time.
#[derive(Debug, Clone)]
pub enum HttpBody {
    Bytes(Bytes),
    Multipart(MultipartForm),
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Headers,
    pub body: Option<HttpBody>,
    /// Ask for a streaming body; error statuses are still buffered.
    pub stream: bool,
    /// Whole-request timeout; the client's default applies when unset.
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            stream: false,
            timeout: None,
        }
    }
}

#[derive(Debug)]
pub enum HttpResponseBody {
    Bytes(Bytes),
    Stream(tokio::sync::mpsc::Receiver<Bytes>),
}

#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: HttpResponseBody,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Buffered body bytes; empty for streaming responses.
    pub fn into_bytes(self) -> Bytes {
        match self.body {
            HttpResponseBody::Bytes(bytes) => bytes,
            HttpResponseBody::Stream(_) => Bytes::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    Connect,
    Other,
}

#[derive(Debug, Clone)]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    /// Lift into the gateway taxonomy: timeouts stay timeouts, everything
    /// else is the upstream being unreachable.
    pub fn into_bifrost(self) -> BifrostError {
        let kind = match self.kind {
            TransportErrorKind::Timeout => ErrorKind::Timeout,
            TransportErrorKind::Connect | TransportErrorKind::Other => {
                ErrorKind::UpstreamUnavailable
            }
        };
        BifrostError::new(kind, self.message)
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "transport error: {}", self.message)
    }
}

impl std::error::Error for TransportError {}

#[derive(Debug, Clone)]
pub struct UpstreamClientConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// A streaming body with no bytes for this long is treated as dead.
    pub stream_idle_timeout: Duration,
    pub max_idle_per_host: usize,
    pub pool_idle_timeout: Duration,
}

impl Default for UpstreamClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(120),
            stream_idle_timeout: Duration::from_secs(30),
            max_idle_per_host: 16,
            pool_idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Production transport backed by a shared `wreq` client. One connection
/// pool serves every adapter; per-host idle caps bound the pool.
#[derive(Clone)]
pub struct WreqUpstreamClient {
    config: UpstreamClientConfig,
    client: Client,
}

impl WreqUpstreamClient {
    pub fn new(config: UpstreamClientConfig) -> Result<Self, wreq::Error> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .read_timeout(config.stream_idle_timeout)
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.pool_idle_timeout)
            .build()?;
        Ok(Self { config, client })
    }
}

impl UpstreamClient for WreqUpstreamClient {
    fn send<'a>(
        &'a self,
        req: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, TransportError>> + Send + 'a>> {
        Box::pin(async move {
            let method = match req.method {
                HttpMethod::Get => Method::GET,
                HttpMethod::Post => Method::POST,
                HttpMethod::Put => Method::PUT,
                HttpMethod::Patch => Method::PATCH,
                HttpMethod::Delete => Method::DELETE,
            };

            let mut builder = self.client.request(method, &req.url);
            for (k, v) in &req.headers {
                builder = builder.header(k, v);
            }
            if let Some(timeout) = req.timeout {
                builder = builder.timeout(timeout);
            }
            match req.body {
                Some(HttpBody::Bytes(bytes)) => builder = builder.body(bytes),
                Some(HttpBody::Multipart(form)) => {
                    builder = builder.multipart(form.into_wreq().map_err(map_wreq_error)?);
                }
                None => {}
            }

            let resp = builder.send().await.map_err(map_wreq_error)?;
            convert_response(resp, req.stream, self.config.stream_idle_timeout).await
        })
    }
}

fn map_wreq_error(err: wreq::Error) -> TransportError {
    let kind = if err.is_timeout() {
        TransportErrorKind::Timeout
    } else if err.is_connect() {
        TransportErrorKind::Connect
    } else {
        TransportErrorKind::Other
    };
    TransportError { kind, message: err.to_string() }
}

async fn convert_response(
    resp: wreq::Response,
    want_stream: bool,
    stream_idle_timeout: Duration,
) -> Result<HttpResponse, TransportError> {
    let status = resp.status().as_u16();
    let headers = collect_headers(resp.headers());

    let is_success = (200..300).contains(&status);
    if !is_success || !want_stream {
        let body = resp.bytes().await.map_err(map_wreq_error)?;
        return Ok(HttpResponse { status, headers, body: HttpResponseBody::Bytes(body) });
    }

    let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(16);
    tokio::spawn(async move {
        let mut stream = resp.bytes_stream();
        loop {
            let next = tokio::time::timeout(stream_idle_timeout, stream.next()).await;
            let Ok(item) = next else { break };
            let Some(item) = item else { break };
            let Ok(chunk) = item else { break };
            if tx.send(chunk).await.is_err() {
                // Receiver dropped: the request was cancelled or the stream
                // consumer went away. Dropping `stream` releases the
                // connection.
                break;
            }
        }
    });

    Ok(HttpResponse { status, headers, body: HttpResponseBody::Stream(rx) })
}

fn collect_headers(map: &wreq::header::HeaderMap) -> Headers {
    let mut out = Vec::new();
    for (k, v) in map {
        if let Ok(s) = v.to_str() {
            out.push((k.as_str().to_string(), s.to_string()));
        }
    }
    out
}
