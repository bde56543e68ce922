//! Engine configuration.
//!
//! Deserializable with full defaults so an embedding process can load it
//! from TOML/JSON or construct it in code.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub randomness: RandomnessConfig,
    pub reconciler: ReconcilerConfig,
    pub settlement: SettlementConfig,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            randomness: RandomnessConfig::default(),
            reconciler: ReconcilerConfig::default(),
            settlement: SettlementConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long a reservation holds boxes before it self-expires.
    pub reservation_ttl_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reservation_ttl_ms: 5 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RandomnessConfig {
    /// Window after which an unfulfilled oracle request becomes `Failed`.
    pub fulfillment_timeout_ms: u64,
}

impl Default for RandomnessConfig {
    fn default() -> Self {
        Self {
            fulfillment_timeout_ms: 30 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub max_ms: u64,
    /// Upper bound on the random jitter added to each delay.
    pub jitter_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 200,
            max_ms: 30_000,
            jitter_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Events fetched per batch from the chain source.
    pub batch_size: usize,
    /// Idle delay between polls when the source is drained.
    pub poll_interval_ms: u64,
    pub backoff: BackoffConfig,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            poll_interval_ms: 1_000,
            backoff: BackoffConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    /// Attempts per record before it lands on the escalation list.
    pub retry_budget: u32,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self { retry_budget: 3 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive string, e.g. "boxraffle=debug".
    pub filter: Option<String>,
}

impl ReconcilerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.settlement.retry_budget, 3);
        assert_eq!(config.reconciler.backoff.base_ms, 200);
        assert!(config.logging.filter.is_none());
    }
}
