//! Shared primitives for the bifrost workspace: the error taxonomy, fallback
//! policy, and request/trace identifiers.
//!
//! This crate deliberately has no async or HTTP dependencies; every other
//! member depends on it.

pub mod error;
pub mod ids;

pub use error::{BifrostError, BifrostResult, ErrorKind, FallbackPolicy};
pub use ids::{RequestId, TraceId};
