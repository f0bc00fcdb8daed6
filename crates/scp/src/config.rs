//! Engine configuration.
//!
//! The billing epoch, cycle duration and byte rate are protocol constants
//! compiled into the client; every node in a swarm must agree on them or
//! billing cycles drift apart.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ss_net_scp::MetadataValue;

/// Billing epoch all cycle numbers are counted from.
pub const EPOCH: &str = "2020-10-01T00:00:00Z";

/// Duration of one billing cycle.
pub const CYCLE_DURATION: &str = "24h";

/// Default currency units per byte.
pub const RATE: &str = "0.000001";

/// Role string reported by nodes running without a Streamspace
/// configuration. Incoming payment validation is relaxed for this role.
pub const DUMMY_ROLE: &str = "dummy";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid epoch timestamp: {0}")]
    InvalidEpoch(#[source] chrono::ParseError),

    #[error("invalid cycle duration: {0}")]
    InvalidCycle(#[source] humantime::DurationError),

    #[error("invalid rate: {0}")]
    InvalidRate(#[source] std::num::ParseFloatError),
}

/// Configuration surface the engine reads.
pub trait ScpConfig: Send + Sync {
    fn device_id(&self) -> &str;
    fn role(&self) -> &str;
    fn epoch(&self) -> DateTime<Utc>;
    fn cycle(&self) -> Duration;
    fn rate(&self) -> f64;
    fn metadata(&self) -> &BTreeMap<String, MetadataValue>;
}

/// Streamspace swarm configuration with the compiled-in protocol constants.
#[derive(Debug, Clone)]
pub struct StreamspaceConfig {
    device_id: String,
    role: String,
    epoch: DateTime<Utc>,
    cycle: Duration,
    rate: f64,
    metadata: BTreeMap<String, MetadataValue>,
}

impl StreamspaceConfig {
    /// Build a config for this node. `rate` arrives string-encoded from the
    /// bootstrap API; epoch and cycle come from the compiled-in constants.
    pub fn new(
        device_id: impl Into<String>,
        role: impl Into<String>,
        metadata: BTreeMap<String, MetadataValue>,
        rate: &str,
    ) -> Result<Self, ConfigError> {
        let epoch = DateTime::parse_from_rfc3339(EPOCH)
            .map_err(ConfigError::InvalidEpoch)?
            .with_timezone(&Utc);
        let cycle = humantime::parse_duration(CYCLE_DURATION).map_err(ConfigError::InvalidCycle)?;
        let rate = rate.trim().parse::<f64>().map_err(ConfigError::InvalidRate)?;
        Ok(Self {
            device_id: device_id.into(),
            role: role.into(),
            epoch,
            cycle,
            rate,
            metadata,
        })
    }

    /// Override epoch and cycle. Intended for swarms running on a private
    /// billing schedule.
    pub fn with_schedule(mut self, epoch: DateTime<Utc>, cycle: Duration) -> Self {
        self.epoch = epoch;
        self.cycle = cycle;
        self
    }
}

impl ScpConfig for StreamspaceConfig {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn role(&self) -> &str {
        &self.role
    }

    fn epoch(&self) -> DateTime<Utc> {
        self.epoch
    }

    fn cycle(&self) -> Duration {
        self.cycle
    }

    fn rate(&self) -> f64 {
        self.rate
    }

    fn metadata(&self) -> &BTreeMap<String, MetadataValue> {
        &self.metadata
    }
}

/// Placeholder configuration used when no Streamspace config is supplied.
#[derive(Debug, Clone)]
pub struct DummyConfig {
    created: DateTime<Utc>,
    metadata: BTreeMap<String, MetadataValue>,
}

impl Default for DummyConfig {
    fn default() -> Self {
        Self {
            created: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }
}

impl ScpConfig for DummyConfig {
    fn device_id(&self) -> &str {
        DUMMY_ROLE
    }

    fn role(&self) -> &str {
        DUMMY_ROLE
    }

    fn epoch(&self) -> DateTime<Utc> {
        self.created
    }

    fn cycle(&self) -> Duration {
        Duration::from_secs(1)
    }

    fn rate(&self) -> f64 {
        0.0
    }

    fn metadata(&self) -> &BTreeMap<String, MetadataValue> {
        &self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiled_constants_parse() {
        let cfg = StreamspaceConfig::new("d-1", "light-client", BTreeMap::new(), RATE).unwrap();
        assert_eq!(cfg.role(), "light-client");
        assert_eq!(cfg.rate(), 1e-6);
        assert_eq!(cfg.cycle(), Duration::from_secs(24 * 3600));
        assert_eq!(cfg.epoch().to_rfc3339(), "2020-10-01T00:00:00+00:00");
    }

    #[test]
    fn bad_rate_is_rejected() {
        let err = StreamspaceConfig::new("d-1", "light-client", BTreeMap::new(), "1.2.3")
            .expect_err("rate must not parse");
        assert!(matches!(err, ConfigError::InvalidRate(_)));
    }
}
