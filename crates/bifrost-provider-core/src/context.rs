use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use bifrost_common::{RequestId, TraceId};

/// Keys written only by the dispatch core. External writes to these are
/// dropped once the context is sealed with `block_restricted(true)`.
pub mod reserved {
    pub const NUMBER_OF_RETRIES: &str = "bifrost.number_of_retries";
    pub const FALLBACK_INDEX: &str = "bifrost.fallback_index";
    pub const SELECTED_KEY_ID: &str = "bifrost.selected_key_id";
    pub const STREAM_END: &str = "bifrost.stream_end";
    pub const TRACE_ID: &str = "bifrost.trace_id";

    pub const ALL: &[&str] = &[
        NUMBER_OF_RETRIES,
        FALLBACK_INDEX,
        SELECTED_KEY_ID,
        STREAM_END,
        TRACE_ID,
    ];

    pub fn is_reserved(key: &str) -> bool {
        ALL.contains(&key)
    }
}

/// Mutable per-request carrier shared by plugins, workers, and adapters.
/// Cloning is shallow; all clones observe the same values, deadline, and
/// cancellation token.
#[derive(Clone)]
pub struct RequestContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    request_id: RequestId,
    trace_id: TraceId,
    values: RwLock<HashMap<String, Value>>,
    block_restricted: AtomicBool,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestContext {
    pub fn new() -> Self {
        Self::build(None, CancellationToken::new())
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::build(Some(Instant::now() + timeout), CancellationToken::new())
    }

    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Self::build(None, cancel)
    }

    pub fn with_timeout_and_cancellation(timeout: Duration, cancel: CancellationToken) -> Self {
        Self::build(Some(Instant::now() + timeout), cancel)
    }

    fn build(deadline: Option<Instant>, cancel: CancellationToken) -> Self {
        let trace_id = TraceId::generate();
        let mut values = HashMap::new();
        values.insert(reserved::TRACE_ID.to_string(), Value::String(trace_id.to_string()));
        Self {
            inner: Arc::new(ContextInner {
                request_id: RequestId::generate(),
                trace_id,
                values: RwLock::new(values),
                block_restricted: AtomicBool::new(false),
                cancel,
                deadline,
            }),
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.inner.request_id
    }

    pub fn trace_id(&self) -> TraceId {
        self.inner.trace_id
    }

    /// Stores a value. Writes to reserved keys are silently dropped while
    /// the block-restricted flag is set.
    pub fn set_value(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        if reserved::is_reserved(&key) && self.inner.block_restricted.load(Ordering::Acquire) {
            return;
        }
        self.inner
            .values
            .write()
            .expect("context lock poisoned")
            .insert(key, value);
    }

    /// Core-internal write path that bypasses the reserved-key guard.
    pub fn set_reserved_value(&self, key: &'static str, value: Value) {
        self.inner
            .values
            .write()
            .expect("context lock poisoned")
            .insert(key.to_string(), value);
    }

    pub fn get_value(&self, key: &str) -> Option<Value> {
        self.inner
            .values
            .read()
            .expect("context lock poisoned")
            .get(key)
            .cloned()
    }

    pub fn set_block_restricted(&self, blocked: bool) {
        self.inner.block_restricted.store(blocked, Ordering::Release);
    }

    pub fn is_block_restricted(&self) -> bool {
        self.inner.block_restricted.load(Ordering::Acquire)
    }

    pub fn number_of_retries(&self) -> u64 {
        self.get_value(reserved::NUMBER_OF_RETRIES)
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
    }

    pub fn fallback_index(&self) -> Option<u64> {
        self.get_value(reserved::FALLBACK_INDEX).and_then(|v| v.as_u64())
    }

    pub fn selected_key_id(&self) -> Option<String> {
        self.get_value(reserved::SELECTED_KEY_ID)
            .and_then(|v| v.as_str().map(str::to_string))
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Time left until the deadline; `None` when no deadline was set,
    /// `Some(ZERO)` when it already passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn deadline_expired(&self) -> bool {
        matches!(self.remaining(), Some(rem) if rem.is_zero())
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("request_id", &self.inner.request_id)
            .field("trace_id", &self.inner.trace_id)
            .field("deadline", &self.inner.deadline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn user_values_round_trip() {
        let ctx = RequestContext::new();
        ctx.set_value("team.cache_hint", json!("warm"));
        assert_eq!(ctx.get_value("team.cache_hint"), Some(json!("warm")));
        assert_eq!(ctx.get_value("team.other"), None);
    }

    #[test]
    fn reserved_writes_are_dropped_when_blocked() {
        let ctx = RequestContext::new();
        ctx.set_reserved_value(reserved::NUMBER_OF_RETRIES, json!(2));
        ctx.set_block_restricted(true);

        ctx.set_value(reserved::NUMBER_OF_RETRIES, json!(99));
        assert_eq!(ctx.number_of_retries(), 2);

        // The core write path is unaffected.
        ctx.set_reserved_value(reserved::NUMBER_OF_RETRIES, json!(3));
        assert_eq!(ctx.number_of_retries(), 3);

        // User keys still work while blocked.
        ctx.set_value("team.note", json!("ok"));
        assert_eq!(ctx.get_value("team.note"), Some(json!("ok")));
    }

    #[test]
    fn clones_share_state() {
        let ctx = RequestContext::new();
        let clone = ctx.clone();
        clone.set_value("team.shared", json!(1));
        assert_eq!(ctx.get_value("team.shared"), Some(json!(1)));
        assert_eq!(ctx.request_id(), clone.request_id());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expires() {
        let ctx = RequestContext::with_timeout(Duration::from_millis(50));
        assert!(!ctx.deadline_expired());
        tokio::time::advance(Duration::from_millis(80)).await;
        assert!(ctx.deadline_expired());
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn cancellation_is_shared() {
        let ctx = RequestContext::new();
        let clone = ctx.clone();
        ctx.cancellation().cancel();
        assert!(clone.is_cancelled());
    }
}
