//! Domain records persisted by the stores.

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use grendel_core::QoS;

use crate::{Result, StorageError};

/// Reserved username representing unauthenticated access.
pub const ANONYMOUS_USER: &str = "Anonymous";

/// Reserved username bootstrapped on first use if missing.
pub const ADMIN_USER: &str = "Admin";

/// A broker user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub password_hash: String,
    pub enabled: bool,
    pub can_subscribe: bool,
    pub can_publish: bool,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn new(username: impl Into<String>, password_hash: impl Into<String>) -> Self {
        let now = Utc::now();
        User {
            username: username.into(),
            password_hash: password_hash.into(),
            enabled: true,
            can_subscribe: true,
            can_publish: true,
            is_admin: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.username == ANONYMOUS_USER
    }
}

/// A positive ACL grant. Evaluation order is strictly descending
/// [`priority`](AclRule::priority); there are no deny rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AclRule {
    /// Store-generated, stable.
    pub id: i64,
    pub username: String,
    pub topic_pattern: String,
    pub can_subscribe: bool,
    pub can_publish: bool,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
}

/// A subscription owned by a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub client_id: String,
    pub topic_filter: String,
    pub qos: QoS,
}

impl Subscription {
    pub fn new(client_id: impl Into<String>, topic_filter: impl Into<String>, qos: QoS) -> Self {
        Subscription {
            client_id: client_id.into(),
            topic_filter: topic_filter.into(),
            qos,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        grendel_core::topic::is_wildcard(&self.topic_filter)
    }
}

/// Per-client session row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub client_id: String,
    /// Cluster node currently (or last) hosting the session.
    pub node_id: String,
    pub clean_session: bool,
    pub connected: bool,
    pub last_update: DateTime<Utc>,
    /// Opaque connection information supplied by the front-end.
    pub info: serde_json::Value,
    pub last_will: Option<grendel_core::BrokerMessage>,
}

/// Backend selector for an archive group's stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StoreKind {
    None,
    Memory,
    Sqlite,
}

/// How an archive group persists payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PayloadFormat {
    /// Raw bytes only.
    Default,
    /// Bytes plus a parsed JSON document when the payload is valid JSON.
    Json,
}

/// Name of the always-present catch-all archive group.
pub const DEFAULT_ARCHIVE_GROUP: &str = "Default";

/// Declarative routing policy: which topics archive where.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveGroup {
    pub name: String,
    pub enabled: bool,
    pub topic_filters: Vec<String>,
    /// Only archive messages published with the retain flag.
    pub retained_only: bool,
    pub last_val_type: StoreKind,
    pub archive_type: StoreKind,
    pub payload_format: PayloadFormat,
    /// Duration strings in the `<int>[ms|s|m|h|d|w]` grammar.
    pub last_val_retention: Option<String>,
    pub archive_retention: Option<String>,
    pub purge_interval: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ArchiveGroup {
    /// The `Default` group archiving everything, seeded on first use.
    pub fn default_group() -> Self {
        let now = Utc::now();
        ArchiveGroup {
            name: DEFAULT_ARCHIVE_GROUP.to_string(),
            enabled: true,
            topic_filters: vec!["#".to_string()],
            retained_only: false,
            last_val_type: StoreKind::Memory,
            archive_type: StoreKind::Memory,
            payload_format: PayloadFormat::Default,
            last_val_retention: None,
            archive_retention: None,
            purge_interval: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn archive_retention_millis(&self) -> Result<Option<u64>> {
        Self::parse_retention(self.archive_retention.as_deref())
    }

    pub fn last_val_retention_millis(&self) -> Result<Option<u64>> {
        Self::parse_retention(self.last_val_retention.as_deref())
    }

    pub fn purge_interval_millis(&self) -> Result<Option<u64>> {
        Self::parse_retention(self.purge_interval.as_deref())
    }

    fn parse_retention(value: Option<&str>) -> Result<Option<u64>> {
        match value {
            None => Ok(None),
            Some(s) => grendel_core::duration::parse_millis(s)
                .map(Some)
                .map_err(|e| StorageError::InvalidInput(e.to_string())),
        }
    }

    /// Whether a publish to `topic` with the given retain flag is routed
    /// into this group.
    pub fn matches(&self, topic: &str, retain: bool) -> bool {
        if !self.enabled {
            return false;
        }
        if self.retained_only && !retain {
            return false;
        }
        self.topic_filters
            .iter()
            .any(|f| grendel_core::topic::matches(f, topic))
    }
}

/// Tag selecting the schema of a metrics document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetricKind {
    Broker,
    Session,
    MqttClient,
    OpcUaClient,
    OpcUaDevice,
    KafkaClient,
    WinCcOaClient,
    WinCcUaClient,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Broker => "BROKER",
            MetricKind::Session => "SESSION",
            MetricKind::MqttClient => "MQTTCLIENT",
            MetricKind::OpcUaClient => "OPCUACLIENT",
            MetricKind::OpcUaDevice => "OPCUADEVICE",
            MetricKind::KafkaClient => "KAFKACLIENT",
            MetricKind::WinCcOaClient => "WINCCOACLIENT",
            MetricKind::WinCcUaClient => "WINCCUACLIENT",
        }
    }

    pub fn parse(value: &str) -> Option<MetricKind> {
        match value {
            "BROKER" => Some(MetricKind::Broker),
            "SESSION" => Some(MetricKind::Session),
            "MQTTCLIENT" => Some(MetricKind::MqttClient),
            "OPCUACLIENT" => Some(MetricKind::OpcUaClient),
            "OPCUADEVICE" => Some(MetricKind::OpcUaDevice),
            "KAFKACLIENT" => Some(MetricKind::KafkaClient),
            "WINCCOACLIENT" => Some(MetricKind::WinCcOaClient),
            "WINCCUACLIENT" => Some(MetricKind::WinCcUaClient),
            _ => None,
        }
    }
}

/// One time-series sample. Primary key `(timestamp, kind, identifier)`;
/// writes upsert on conflict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSample {
    pub timestamp: DateTime<Utc>,
    pub kind: MetricKind,
    pub identifier: String,
    pub payload: serde_json::Value,
}

/// Time-range selection for metrics queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// Resolve the query parameters to a concrete window.
    ///
    /// `last_minutes` wins over `from`/`to`; one of the two forms must be
    /// present.
    pub fn resolve(
        last_minutes: Option<i64>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<TimeWindow> {
        if let Some(minutes) = last_minutes {
            if minutes <= 0 {
                return Err(StorageError::InvalidInput(format!(
                    "last_minutes must be positive, got {minutes}"
                )));
            }
            let end = Utc::now();
            return Ok(TimeWindow {
                start: end - Duration::minutes(minutes),
                end,
            });
        }

        match from {
            Some(start) => Ok(TimeWindow {
                start,
                end: to.unwrap_or_else(Utc::now),
            }),
            None => Err(StorageError::InvalidInput(
                "either last_minutes or from is required".to_string(),
            )),
        }
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.start && t <= self.end
    }
}

/// Outcome of a purge pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PurgeResult {
    pub deleted: u64,
    pub elapsed_ms: u64,
}

/// Archived payload, shaped by the group's [`PayloadFormat`] at ingest.
///
/// Untagged: raw payloads serialize as a base64 string, JSON payloads as
/// the document itself. `Raw` must stay the first variant so base64
/// strings round-trip instead of collapsing into `Json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArchivePayload {
    Raw(#[serde(with = "raw_payload_serde")] Bytes),
    Json(serde_json::Value),
}

mod raw_payload_serde {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD
            .decode(&s)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

/// One row returned by an archive history query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivedMessage {
    pub topic: String,
    pub time: DateTime<Utc>,
    pub payload: ArchivePayload,
    pub qos: QoS,
    pub retain: bool,
    pub client_id: String,
    pub message_uuid: Uuid,
}

/// Aggregation function for bucketed archive queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggFunc {
    Min,
    Max,
    Avg,
    Sum,
    Count,
    First,
    Last,
}

impl AggFunc {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggFunc::Min => "min",
            AggFunc::Max => "max",
            AggFunc::Avg => "avg",
            AggFunc::Sum => "sum",
            AggFunc::Count => "count",
            AggFunc::First => "first",
            AggFunc::Last => "last",
        }
    }
}

/// Result of [`get_aggregated_history`](crate::MessageArchive::get_aggregated_history):
/// one `time` column followed by one column per (topic, field, func),
/// rows ascending by bucket.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregatedHistory {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

/// Opaque device configuration record for the admin interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    pub namespace: String,
    pub node_id: String,
    pub enabled: bool,
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeviceConfig {
    /// Device names allow `[a-zA-Z0-9_/-]`, namespaces `[a-zA-Z0-9_-]`.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty()
            || !self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '/' || c == '-')
        {
            return Err(StorageError::InvalidInput(format!(
                "invalid device name `{}`",
                self.name
            )));
        }
        if self.namespace.is_empty()
            || !self
                .namespace
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(StorageError::InvalidInput(format!(
                "invalid namespace `{}`",
                self.namespace
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_window_last_minutes() {
        let w = TimeWindow::resolve(Some(5), None, None).unwrap();
        assert!(w.end - w.start == Duration::minutes(5));
    }

    #[test]
    fn test_time_window_from_to() {
        let from = Utc::now() - Duration::hours(1);
        let to = Utc::now();
        let w = TimeWindow::resolve(None, Some(from), Some(to)).unwrap();
        assert_eq!(w.start, from);
        assert_eq!(w.end, to);
    }

    #[test]
    fn test_time_window_requires_bounds() {
        assert!(TimeWindow::resolve(None, None, None).is_err());
        assert!(TimeWindow::resolve(Some(0), None, None).is_err());
    }

    #[test]
    fn test_archive_group_matches() {
        let mut group = ArchiveGroup::default_group();
        group.topic_filters = vec!["sensors/#".to_string()];
        group.retained_only = true;

        assert!(group.matches("sensors/1/temp", true));
        assert!(!group.matches("sensors/1/temp", false));
        assert!(!group.matches("actuators/1", true));

        group.enabled = false;
        assert!(!group.matches("sensors/1/temp", true));
    }

    #[test]
    fn test_retention_parsing() {
        let mut group = ArchiveGroup::default_group();
        group.archive_retention = Some("1h30m".to_string());
        assert_eq!(group.archive_retention_millis().unwrap(), Some(5_400_000));

        group.archive_retention = Some("junk".to_string());
        assert!(group.archive_retention_millis().is_err());

        group.archive_retention = None;
        assert_eq!(group.archive_retention_millis().unwrap(), None);
    }

    #[test]
    fn test_metric_kind_round_trip() {
        for kind in [
            MetricKind::Broker,
            MetricKind::Session,
            MetricKind::MqttClient,
            MetricKind::OpcUaClient,
            MetricKind::OpcUaDevice,
            MetricKind::KafkaClient,
            MetricKind::WinCcOaClient,
            MetricKind::WinCcUaClient,
        ] {
            assert_eq!(MetricKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(MetricKind::parse("BOGUS"), None);
    }

    #[test]
    fn test_raw_payload_serde_round_trip() {
        let payload = ArchivePayload::Raw(Bytes::from_static(b"\x00\xffraw"));
        let json = serde_json::to_string(&payload).unwrap();
        let back: ArchivePayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_device_config_validation() {
        let mut cfg = DeviceConfig {
            name: "plant-1/line_2".to_string(),
            namespace: "factory_a".to_string(),
            node_id: "node1".to_string(),
            enabled: true,
            config: serde_json::json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(cfg.validate().is_ok());

        cfg.namespace = "has/slash".to_string();
        assert!(cfg.validate().is_err());

        cfg.namespace = "ok".to_string();
        cfg.name = "bad name".to_string();
        assert!(cfg.validate().is_err());
    }
}
