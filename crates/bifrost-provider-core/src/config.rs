use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::headers::Headers;
use crate::keys::Key;
use crate::operation::Operation;

/// Which adapter family serves a provider. Compatible providers reuse the
/// OpenAI implementation against their own base url.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    OpenAiCompatible,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub kind: ProviderKind,
    #[serde(default)]
    pub keys: Vec<Key>,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub allowed_operations: AllowedOperations,
}

impl ProviderConfig {
    pub fn new(name: impl Into<String>, kind: ProviderKind) -> Self {
        Self {
            name: name.into(),
            kind,
            keys: Vec::new(),
            network: NetworkConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            allowed_operations: AllowedOperations::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Custom upstream endpoint; adapters fall back to their well-known
    /// default when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default = "defaults::timeout", with = "duration_millis")]
    pub timeout: Duration,
    /// Transport-level retries within a single target, on top of which the
    /// fallback orchestrator operates.
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,
    #[serde(default = "defaults::backoff_initial", with = "duration_millis")]
    pub backoff_initial: Duration,
    #[serde(default = "defaults::backoff_max", with = "duration_millis")]
    pub backoff_max: Duration,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    extra_headers: Headers,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout: defaults::timeout(),
            max_retries: defaults::max_retries(),
            backoff_initial: defaults::backoff_initial(),
            backoff_max: defaults::backoff_max(),
            extra_headers: Vec::new(),
        }
    }
}

impl NetworkConfig {
    pub fn extra_headers(&self) -> &Headers {
        &self.extra_headers
    }

    /// Headers are copied pair by pair; the config never aliases a caller's
    /// buffer, so later mutation on either side is invisible to the other.
    pub fn set_extra_headers(&mut self, headers: &[(String, String)]) {
        self.extra_headers = headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Worker count; the hard bound on in-flight adapter calls per provider.
    #[serde(default = "defaults::concurrency")]
    pub concurrency: usize,
    /// Inbox depth before enqueue waits (and eventually times out).
    #[serde(default = "defaults::buffer_size")]
    pub buffer_size: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            concurrency: defaults::concurrency(),
            buffer_size: defaults::buffer_size(),
        }
    }
}

/// `None` allows every operation; a set allows exactly its members.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AllowedOperations(pub Option<BTreeSet<Operation>>);

impl AllowedOperations {
    pub fn all() -> Self {
        Self(None)
    }

    pub fn only(ops: impl IntoIterator<Item = Operation>) -> Self {
        Self(Some(ops.into_iter().collect()))
    }

    pub fn allows(&self, op: Operation) -> bool {
        match &self.0 {
            None => true,
            Some(set) => set.contains(&op),
        }
    }
}

mod defaults {
    use std::time::Duration;

    pub fn timeout() -> Duration {
        Duration::from_secs(30)
    }

    pub fn max_retries() -> u32 {
        2
    }

    pub fn backoff_initial() -> Duration {
        Duration::from_millis(500)
    }

    pub fn backoff_max() -> Duration {
        Duration::from_secs(10)
    }

    pub fn concurrency() -> usize {
        8
    }

    pub fn buffer_size() -> usize {
        128
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(de)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extra_headers_are_deep_copied() {
        let mut source = vec![("x-team".to_string(), "search".to_string())];
        let mut config = NetworkConfig::default();
        config.set_extra_headers(&source);

        source[0].1.push_str("-mutated");
        assert_eq!(config.extra_headers()[0].1, "search");
    }

    #[test]
    fn allowed_operations_default_allows_everything() {
        let allowed = AllowedOperations::default();
        assert!(allowed.allows(Operation::Chat));
        assert!(allowed.allows(Operation::FileDelete));

        let restricted = AllowedOperations::only([Operation::Chat, Operation::ChatStream]);
        assert!(restricted.allows(Operation::ChatStream));
        assert!(!restricted.allows(Operation::Embedding));
    }

    #[test]
    fn network_config_deserializes_durations_from_millis() {
        let config: NetworkConfig =
            serde_json::from_str(r#"{"timeout": 1500, "max_retries": 1}"#).unwrap();
        assert_eq!(config.timeout, Duration::from_millis(1500));
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.backoff_initial, Duration::from_millis(500));
    }
}
