//! Controller settings: defaults and `SKIFF_*` environment overrides.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use skiff_core::ResourceKey;
use skiff_queue::{controller_rate_limiter, MaxOfRateLimiter};
use tracing::warn;

/// Runtime knobs of a controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub workers: usize,
    /// How long startup may wait for the initial list before giving up.
    pub sync_timeout: Duration,
    pub max_requeues: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub queue_qps: f64,
    pub queue_burst: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            sync_timeout: Duration::from_secs(60),
            max_requeues: 5,
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_secs(1000),
            queue_qps: 10.0,
            queue_burst: 100,
        }
    }
}

fn parsed<T: std::str::FromStr>(get: &impl Fn(&str) -> Option<String>, var: &str) -> Option<T> {
    let raw = get(var)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(var, value = %raw, "ignoring unparsable setting");
            None
        }
    }
}

impl ControllerConfig {
    /// Defaults overridden by `SKIFF_*` environment variables.
    pub fn from_env() -> Self { Self::from_lookup(|var| std::env::var(var).ok()) }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        if let Some(v) = parsed::<usize>(&get, "SKIFF_WORKERS") { cfg.workers = v.max(1); }
        if let Some(v) = parsed::<u64>(&get, "SKIFF_SYNC_TIMEOUT_SECS") { cfg.sync_timeout = Duration::from_secs(v); }
        if let Some(v) = parsed::<u32>(&get, "SKIFF_MAX_REQUEUES") { cfg.max_requeues = v; }
        if let Some(v) = parsed::<u64>(&get, "SKIFF_BACKOFF_BASE_MS") { cfg.backoff_base = Duration::from_millis(v); }
        if let Some(v) = parsed::<u64>(&get, "SKIFF_BACKOFF_MAX_SECS") { cfg.backoff_max = Duration::from_secs(v); }
        if let Some(v) = parsed::<f64>(&get, "SKIFF_QUEUE_QPS") { cfg.queue_qps = v; }
        if let Some(v) = parsed::<u32>(&get, "SKIFF_QUEUE_BURST") { cfg.queue_burst = v; }
        cfg
    }

    pub(crate) fn rate_limiter(&self) -> MaxOfRateLimiter<ResourceKey> {
        controller_rate_limiter(self.backoff_base, self.backoff_max, self.queue_qps, self.queue_burst)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_without_overrides() {
        assert_eq!(ControllerConfig::from_lookup(lookup(&[])), ControllerConfig::default());
    }

    #[test]
    fn overrides_apply_and_garbage_is_ignored() {
        let cfg = ControllerConfig::from_lookup(lookup(&[
            ("SKIFF_WORKERS", "4"),
            ("SKIFF_SYNC_TIMEOUT_SECS", "5"),
            ("SKIFF_MAX_REQUEUES", "nope"),
            ("SKIFF_BACKOFF_BASE_MS", " 20 "),
        ]));
        assert_eq!(cfg.workers, 4);
        assert_eq!(cfg.sync_timeout, Duration::from_secs(5));
        assert_eq!(cfg.max_requeues, 5);
        assert_eq!(cfg.backoff_base, Duration::from_millis(20));
    }

    #[test]
    fn zero_workers_means_one() {
        assert_eq!(ControllerConfig::from_lookup(lookup(&[("SKIFF_WORKERS", "0")])).workers, 1);
    }
}
