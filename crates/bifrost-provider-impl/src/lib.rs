//! Concrete provider adapters and the upstream HTTP client.
//!
//! Adapters translate the uniform operation surface into provider wire
//! calls. All IO funnels through the [`client::UpstreamClient`] trait so
//! codecs stay pure and tests can substitute a fake transport.

pub mod anthropic;
pub mod client;
pub mod multipart;
pub mod openai;
pub mod sse;
pub mod streaming;

pub use anthropic::AnthropicAdapter;
pub use client::{
    HttpBody, HttpMethod, HttpRequest, HttpResponse, HttpResponseBody, TransportError,
    TransportErrorKind, UpstreamClient, UpstreamClientConfig, WreqUpstreamClient,
};
pub use multipart::{MultipartForm, MultipartPart};
pub use openai::OpenAiAdapter;
