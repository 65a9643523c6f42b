use std::time::Duration;

use ekko_store::InformerConfig;

pub const DEFAULT_CHILD_IMAGE: &str = "reshnm/echoserver:latest";

/// Runtime knobs for the controller. `from_env` reads `EKKO_*` overrides;
/// unparsable values keep the default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Restrict caches to one namespace; `None` watches all.
    pub namespace: Option<String>,
    pub workers: usize,
    pub resync: Duration,
    /// Periodic re-reconcile after success; zero disables it.
    pub requeue: Duration,
    pub sync_timeout: Duration,
    /// Total attempts per key before it is dropped.
    pub max_retries: u32,
    pub child_image: String,
    pub watch_backoff_max: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            workers: 2,
            resync: Duration::from_secs(30),
            requeue: Duration::from_secs(10),
            sync_timeout: Duration::from_secs(60),
            max_retries: 5,
            child_image: DEFAULT_CHILD_IMAGE.to_string(),
            watch_backoff_max: Duration::from_secs(30),
        }
    }
}

impl ControllerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as `from_env` over an arbitrary lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let num = |name: &str| lookup(name).and_then(|s| s.trim().parse::<u64>().ok());
        Self {
            namespace: None,
            workers: num("EKKO_WORKERS").map(|n| n as usize).filter(|n| *n > 0).unwrap_or(d.workers),
            resync: num("EKKO_RESYNC_SECS").map(Duration::from_secs).unwrap_or(d.resync),
            requeue: num("EKKO_REQUEUE_SECS").map(Duration::from_secs).unwrap_or(d.requeue),
            sync_timeout: num("EKKO_SYNC_TIMEOUT_SECS").map(Duration::from_secs).unwrap_or(d.sync_timeout),
            max_retries: num("EKKO_MAX_RETRIES")
                .and_then(|n| u32::try_from(n).ok())
                .filter(|n| *n > 0)
                .unwrap_or(d.max_retries),
            child_image: lookup("EKKO_CHILD_IMAGE").filter(|s| !s.trim().is_empty()).unwrap_or(d.child_image),
            watch_backoff_max: num("EKKO_WATCH_BACKOFF_MAX_SECS")
                .filter(|n| *n > 0)
                .map(Duration::from_secs)
                .unwrap_or(d.watch_backoff_max),
        }
    }

    pub fn informer(&self) -> InformerConfig {
        InformerConfig {
            namespace: self.namespace.clone(),
            resync: self.resync,
            watch_backoff_max: self.watch_backoff_max,
            ..InformerConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn lookup_overrides_and_ignores_garbage() {
        let env: HashMap<&str, &str> = [
            ("EKKO_WORKERS", "4"),
            ("EKKO_REQUEUE_SECS", "0"),
            ("EKKO_MAX_RETRIES", "nope"),
            ("EKKO_CHILD_IMAGE", "example/echo:v2"),
            ("EKKO_WATCH_BACKOFF_MAX_SECS", "0"),
        ]
        .into_iter()
        .collect();
        let cfg = ControllerConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.workers, 4);
        assert_eq!(cfg.requeue, Duration::ZERO);
        assert_eq!(cfg.max_retries, 5);
        assert_eq!(cfg.child_image, "example/echo:v2");
        assert_eq!(cfg.watch_backoff_max, Duration::from_secs(30));
        assert_eq!(cfg.resync, Duration::from_secs(30));
    }

    #[test]
    fn empty_environment_gives_defaults() {
        assert_eq!(ControllerConfig::from_lookup(|_| None), ControllerConfig::default());
    }
}
