//! Client configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables captured when the client is built.
///
/// Durations are written as milliseconds when (de)serialized, using the same
/// camelCase keys as the option object accepted by browser-side clients.
/// Negative values are clamped to zero, and zero disables the feature.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientConfig {
    /// Emit diagnostic logging.
    pub enable_logging: bool,

    /// Interval between liveness probes.
    #[serde(with = "millis")]
    pub heartbeat_interval: Duration,

    /// Delay before the first reconnection attempt after an abnormal close.
    #[serde(with = "millis")]
    pub retry_waiting_time_start: Duration,

    /// Amount added to the reconnection delay after every attempt.
    #[serde(with = "millis")]
    pub retry_waiting_time_step: Duration,

    /// Idle time after which the connection is closed cleanly.
    #[serde(with = "millis")]
    pub auto_disconnect_after: Duration,

    /// Reject in-flight requests when the connection closes.
    pub fail_pending_on_close: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            enable_logging: true,
            heartbeat_interval: Duration::from_secs(30),
            retry_waiting_time_start: Duration::from_secs(1),
            retry_waiting_time_step: Duration::from_secs(1),
            auto_disconnect_after: Duration::ZERO,
            fail_pending_on_close: true,
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        // Option objects may carry any JSON number.
        let millis = f64::deserialize(deserializer)?;
        if millis.is_finite() && millis > 0.0 {
            Ok(Duration::from_nanos((millis * 1_000_000.0).round() as u64))
        } else {
            Ok(Duration::ZERO)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_deserialize_option_object() {
        let config: ClientConfig = serde_json::from_str(
            r#"{
                "enableLogging": false,
                "heartbeatInterval": 50,
                "retryWaitingTimeStart": 0,
                "retryWaitingTimeStep": 150,
                "autoDisconnectAfter": 60000
            }"#,
        )
        .unwrap();

        assert_eq!(
            config,
            ClientConfig {
                enable_logging: false,
                heartbeat_interval: Duration::from_millis(50),
                retry_waiting_time_start: Duration::ZERO,
                retry_waiting_time_step: Duration::from_millis(150),
                auto_disconnect_after: Duration::from_secs(60),
                fail_pending_on_close: true,
            }
        );
    }

    #[test]
    fn test_negative_values_disable() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"heartbeatInterval": -1, "autoDisconnectAfter": -500}"#)
                .unwrap();

        assert!(config.heartbeat_interval.is_zero());
        assert!(config.auto_disconnect_after.is_zero());
    }

    #[test]
    fn test_missing_keys_use_defaults() {
        let config: ClientConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, ClientConfig::default());
    }

    #[test]
    fn test_serializes_milliseconds() {
        let value = serde_json::to_value(ClientConfig::default()).unwrap();
        assert_eq!(value["heartbeatInterval"], 30_000);
        assert_eq!(value["failPendingOnClose"], true);
    }
}
