//! Manager configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Sizing and timing knobs for the consumer pool.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Consumers kept alive even when idle.
    #[serde(default = "default_min_consumer_count")]
    pub min_consumer_count: usize,

    /// Hard cap on concurrently running consumers.
    #[serde(default = "default_max_consumer_count")]
    pub max_consumer_count: usize,

    /// A new consumer is started only while
    /// `ready_jobs > active_consumers * load_factor`.
    #[serde(default = "default_load_factor")]
    pub load_factor: usize,

    /// How long an idle consumer lingers before retiring; absorbs bursty
    /// arrivals without respawn thrash.
    #[serde(default = "default_consumer_keep_alive")]
    pub consumer_keep_alive: Duration,
}

fn default_min_consumer_count() -> usize {
    0
}

fn default_max_consumer_count() -> usize {
    // One consumer per core, bounded the same way the workload limits of a
    // typical host are.
    num_cpus::get().clamp(2, 8)
}

fn default_load_factor() -> usize {
    3
}

fn default_consumer_keep_alive() -> Duration {
    Duration::from_secs(15)
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            min_consumer_count: default_min_consumer_count(),
            max_consumer_count: default_max_consumer_count(),
            load_factor: default_load_factor(),
            consumer_keep_alive: default_consumer_keep_alive(),
        }
    }
}

impl ManagerConfig {
    /// Clamp inconsistent values: max at least 1 and at least min, load
    /// factor at least 1.
    pub(crate) fn normalized(mut self) -> Self {
        self.max_consumer_count =
            self.max_consumer_count.max(1).max(self.min_consumer_count);
        self.load_factor = self.load_factor.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = ManagerConfig::default();
        assert_eq!(config.min_consumer_count, 0);
        assert!(config.max_consumer_count >= 2);
        assert_eq!(config.load_factor, 3);
        assert_eq!(config.consumer_keep_alive, Duration::from_secs(15));
    }

    #[test]
    fn normalized_repairs_inverted_bounds() {
        let config = ManagerConfig {
            min_consumer_count: 4,
            max_consumer_count: 1,
            load_factor: 0,
            ..Default::default()
        }
        .normalized();
        assert_eq!(config.max_consumer_count, 4);
        assert_eq!(config.load_factor, 1);
    }

    #[test]
    fn serde_roundtrip() {
        let config = ManagerConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: ManagerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.load_factor, config.load_factor);
    }
}
