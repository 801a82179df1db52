use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::{Backoff, ConflictRetryPolicy};

/// Registry tuning. Defaults match the usual API-server behaviour.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RegistryConfig {
    /// Prefix shared by every key the registry writes.
    pub key_root: String,
    /// Grace period applied when a delete does not name one.
    pub default_grace_secs: u64,
    pub retry: ConflictRetryPolicy,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { key_root: "/registry".to_string(), default_grace_secs: 30, retry: ConflictRetryPolicy::default() }
    }
}

impl RegistryConfig {
    /// Defaults overridden by `TESSERA_*` environment variables; unset or
    /// unparsable values keep the default.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(root) = std::env::var("TESSERA_KEY_ROOT") {
            cfg.key_root = root;
        }
        if let Some(secs) = env_parse::<u64>("TESSERA_GRACE_PERIOD_SECS") {
            cfg.default_grace_secs = secs;
        }
        if let Some(n) = env_parse::<u32>("TESSERA_UPDATE_MAX_ATTEMPTS") {
            cfg.retry.max_attempts = n.max(1);
        }
        let base = env_parse::<u64>("TESSERA_RETRY_BACKOFF_MS");
        let max = env_parse::<u64>("TESSERA_RETRY_BACKOFF_MAX_MS");
        cfg.retry.backoff = match (base, max) {
            (Some(0), _) => Backoff::None,
            (Some(base_ms), Some(max_ms)) => Backoff::Exponential { base_ms, max_ms: max_ms.max(base_ms) },
            (Some(delay_ms), None) => Backoff::Fixed { delay_ms },
            (None, _) => cfg.retry.backoff,
        };
        cfg
    }

    pub fn default_grace(&self) -> Duration { Duration::from_secs(self.default_grace_secs) }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse::<T>().ok())
}
