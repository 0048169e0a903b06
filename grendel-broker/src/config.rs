//! Broker configuration.

use std::time::Duration;

use serde::Deserialize;

/// Tunables for the broker core. All fields have working defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Identity of this node in session rows.
    pub node_id: String,

    /// Allow connections without credentials as the `Anonymous` user.
    pub allow_anonymous: bool,

    /// On an unauthorized publish: close the connection instead of
    /// silently dropping the message.
    pub disconnect_on_unauthorized: bool,

    /// How often the ACL cache is rebuilt from the user store.
    #[serde(with = "duration_secs")]
    pub acl_refresh_interval: Duration,

    /// Upper bound for the ACL decision cache.
    pub acl_cache_size: usize,

    /// Per-client outbound send window. Overflow falls back to the
    /// offline queue.
    pub send_window: usize,

    /// How often counters are flushed to the metrics store.
    #[serde(with = "duration_secs")]
    pub metrics_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            node_id: "node0".to_string(),
            allow_anonymous: true,
            disconnect_on_unauthorized: false,
            acl_refresh_interval: Duration::from_secs(60),
            acl_cache_size: 10_000,
            send_window: 128,
            metrics_interval: Duration::from_secs(60),
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BrokerConfig::default();
        assert_eq!(config.acl_refresh_interval, Duration::from_secs(60));
        assert_eq!(config.acl_cache_size, 10_000);
        assert!(!config.disconnect_on_unauthorized);
    }

    #[test]
    fn test_deserialize_partial() {
        let config: BrokerConfig = serde_json::from_str(
            r#"{ "node_id": "n7", "disconnect_on_unauthorized": true, "acl_refresh_interval": 5 }"#,
        )
        .unwrap();
        assert_eq!(config.node_id, "n7");
        assert!(config.disconnect_on_unauthorized);
        assert_eq!(config.acl_refresh_interval, Duration::from_secs(5));
        assert_eq!(config.send_window, 128);
    }
}
