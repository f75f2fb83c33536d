use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use arc_swap::ArcSwap;
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use bifrost_common::{BifrostError, BifrostResult, ErrorKind};

/// A credential usable against one provider. `models` lists supported model
/// ids; the entry `"all"` advertises support for every model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Key {
    pub id: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_weight() -> f64 {
    1.0
}

fn default_enabled() -> bool {
    true
}

impl Key {
    pub fn new(id: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            value: value.into(),
            name: None,
            models: vec!["all".to_string()],
            weight: 1.0,
            enabled: true,
        }
    }

    pub fn with_models(mut self, models: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.models = models.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn supports_model(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == "all" || m == model)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CooldownReason {
    RateLimit,
    AuthInvalid,
    Upstream,
    Timeout,
}

#[derive(Debug, Clone, Copy)]
struct Cooldown {
    until: Instant,
    reason: CooldownReason,
}

/// The live key pool for one provider. Reads take an atomic snapshot of the
/// key list; hot reload replaces the whole list. Cooldowns are timed marks:
/// a marked key drops out of selection until its mark lapses, which is
/// evaluated lazily at selection time.
pub struct KeySet {
    keys: ArcSwap<Vec<Key>>,
    cooldowns: RwLock<HashMap<String, Cooldown>>,
}

impl KeySet {
    pub fn new(keys: Vec<Key>) -> Self {
        Self {
            keys: ArcSwap::from_pointee(keys),
            cooldowns: RwLock::new(HashMap::new()),
        }
    }

    pub fn replace(&self, keys: Vec<Key>) {
        self.keys.store(Arc::new(keys));
    }

    pub fn snapshot(&self) -> Arc<Vec<Key>> {
        self.keys.load_full()
    }

    /// Weighted pick among enabled, non-cooling keys that support `model`.
    /// The candidate list is the only per-call allocation.
    pub fn select_for_model(&self, model: &str) -> BifrostResult<Key> {
        let keys = self.keys.load();
        let now = Instant::now();
        let cooldowns = self.cooldowns.read().expect("cooldown lock poisoned");

        let mut candidates: Vec<&Key> = keys
            .iter()
            .filter(|k| {
                k.enabled
                    && k.supports_model(model)
                    && cooldowns.get(&k.id).is_none_or(|cd| cd.until <= now)
            })
            .collect();

        let mut rng = rand::rng();
        match weighted_pick(&mut candidates, &mut rng) {
            Some(key) => Ok(key.clone()),
            None => Err(BifrostError::new(
                ErrorKind::NoKeyForModel,
                format!("no enabled key supports model {model}"),
            )
            .with_model(model)),
        }
    }

    /// Marks a key so selection skips it for `duration`. Used for rate
    /// limits (honouring Retry-After), auth failures, and repeated upstream
    /// errors observed on a specific key.
    pub fn mark_unavailable(&self, key_id: &str, duration: Duration, reason: CooldownReason) {
        let mut guard = self.cooldowns.write().expect("cooldown lock poisoned");
        guard.insert(
            key_id.to_string(),
            Cooldown { until: Instant::now() + duration, reason },
        );
        // Lapsed marks accumulate only until the next write; purge here so
        // the map stays bounded by the key count.
        let now = Instant::now();
        guard.retain(|_, cd| cd.until > now);
    }

    pub fn cooldown_reason(&self, key_id: &str) -> Option<CooldownReason> {
        let guard = self.cooldowns.read().expect("cooldown lock poisoned");
        guard
            .get(key_id)
            .filter(|cd| cd.until > Instant::now())
            .map(|cd| cd.reason)
    }
}

/// Shuffles the candidate list for uniform bias across equal weights, then
/// draws `r ∈ [0, total)` against the cumulative weight. All weights zero
/// degenerates to a uniform pick. O(n), no allocation beyond the caller's
/// candidate list.
fn weighted_pick<'a>(candidates: &mut Vec<&'a Key>, rng: &mut impl Rng) -> Option<&'a Key> {
    if candidates.is_empty() {
        return None;
    }
    candidates.shuffle(rng);

    let total: f64 = candidates.iter().map(|k| k.weight.max(0.0)).sum();
    if total <= 0.0 {
        return Some(candidates[0]);
    }

    let r: f64 = rng.random_range(0.0..total);
    let mut cumulative = 0.0;
    for key in candidates.iter() {
        cumulative += key.weight.max(0.0);
        if r < cumulative {
            return Some(key);
        }
    }
    candidates.last().copied()
}
