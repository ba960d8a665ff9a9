//! Communication tunables.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timeouts and health-check parameters of the channel layer.
///
/// Durations are written in humantime form (`"40s"`, `"500ms"`) when serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommunicationConfig {
    /// Upper bound for a request/response round trip
    #[serde(with = "humantime_duration")]
    pub request_timeout: Duration,
    /// Upper bound for a forwarded request; shorter than `request_timeout` so that the
    /// original sender still receives the forwarding failure
    #[serde(with = "humantime_duration")]
    pub forwarding_timeout: Duration,
    /// Period of the health-check loop
    #[serde(with = "humantime_duration")]
    pub health_check_interval: Duration,
    /// Maximum random delay before each individual check
    #[serde(with = "humantime_duration")]
    pub health_check_max_jitter: Duration,
    /// Upper bound for a single health-check round trip
    #[serde(with = "humantime_duration")]
    pub health_check_timeout: Duration,
    /// Consecutive failures after which a channel is considered broken
    pub health_check_failure_limit: u32,
}

impl Default for CommunicationConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(40),
            forwarding_timeout: Duration::from_secs(35),
            health_check_interval: Duration::from_secs(20),
            health_check_max_jitter: Duration::from_secs(5),
            health_check_timeout: Duration::from_secs(10),
            health_check_failure_limit: 3,
        }
    }
}

mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
