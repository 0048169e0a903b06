//! In-memory storage backend.
//!
//! Thread-safe, document-style implementations of all store traits. All
//! data is lost on restart; suitable for development, testing, and
//! deployments where persistence is delegated entirely to archive groups
//! backed elsewhere.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use grendel_core::{topic, BrokerMessage};

use crate::aggregate::{self, SampleRow};
use crate::glob::glob_match;
use crate::traits::{
    ClientVisitor, MessageVisitor, SessionVisitor, SubscriptionVisitor, TopicVisitor,
};
use crate::types::{
    AclRule, AggFunc, AggregatedHistory, ArchiveGroup, ArchivePayload, ArchivedMessage,
    DeviceConfig, MetricKind, MetricsSample, PayloadFormat, PurgeResult, SessionRecord,
    Subscription, TimeWindow, User, DEFAULT_ARCHIVE_GROUP,
};
use crate::{
    ArchiveGroupStore, DeviceConfigStore, MessageArchive, MessageStore, MetricsStore, Result,
    SessionStore, StorageError, UserStore,
};

fn lock_err<T>(e: std::sync::PoisonError<T>) -> StorageError {
    StorageError::Permanent(e.to_string())
}

/// In-memory retained-message store (one instance per last-value table).
#[derive(Debug, Clone, Default)]
pub struct MemoryMessageStore {
    retained: Arc<RwLock<HashMap<String, BrokerMessage>>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn in_namespace(topic_name: &str, namespace: Option<&str>) -> bool {
        match namespace {
            None => true,
            Some(ns) => {
                topic_name == ns || topic_name.starts_with(&format!("{ns}/"))
            }
        }
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn get(&self, topic_name: &str) -> Result<Option<BrokerMessage>> {
        let retained = self.retained.read().map_err(lock_err)?;
        Ok(retained.get(topic_name).cloned())
    }

    async fn put_all(&self, messages: Vec<BrokerMessage>) -> Result<()> {
        let mut retained = self.retained.write().map_err(lock_err)?;
        for msg in messages {
            retained.insert(msg.topic.clone(), msg);
        }
        Ok(())
    }

    async fn del_all(&self, topics: Vec<String>) -> Result<()> {
        let mut retained = self.retained.write().map_err(lock_err)?;
        for t in topics {
            retained.remove(&t);
        }
        Ok(())
    }

    async fn find_matching_messages(
        &self,
        filter: &str,
        visitor: MessageVisitor<'_>,
    ) -> Result<()> {
        let matching: Vec<BrokerMessage> = {
            let retained = self.retained.read().map_err(lock_err)?;
            retained
                .iter()
                .filter(|(t, _)| topic::matches(filter, t))
                .map(|(_, m)| m.clone())
                .collect()
        };

        for msg in matching {
            if !visitor(msg) {
                break;
            }
        }
        Ok(())
    }

    async fn find_matching_topics(&self, pattern: &str, visitor: TopicVisitor<'_>) -> Result<()> {
        let pattern_levels = topic::levels(pattern);
        let multi = pattern_levels.last() == Some(&topic::WILDCARD_MULTI);

        let found: Vec<String> = {
            let retained = self.retained.read().map_err(lock_err)?;
            let mut seen = HashSet::new();
            let mut found = Vec::new();
            for name in retained.keys() {
                if multi {
                    if topic::matches(pattern, name) && seen.insert(name.clone()) {
                        found.push(name.clone());
                    }
                    continue;
                }

                let name_levels = topic::levels(name);
                if name_levels.len() < pattern_levels.len() {
                    continue;
                }
                let prefix = &name_levels[..pattern_levels.len()];
                if topic::matches_levels(&pattern_levels, prefix) {
                    let joined = prefix.join("/");
                    if seen.insert(joined.clone()) {
                        found.push(joined);
                    }
                }
            }
            found
        };

        for name in found {
            if !visitor(name) {
                break;
            }
        }
        Ok(())
    }

    async fn find_topics_by_name(
        &self,
        glob: &str,
        ignore_case: bool,
        namespace: Option<&str>,
    ) -> Result<Vec<String>> {
        let retained = self.retained.read().map_err(lock_err)?;
        let mut topics: Vec<String> = retained
            .keys()
            .filter(|t| Self::in_namespace(t, namespace))
            .filter(|t| glob_match(glob, t, ignore_case))
            .cloned()
            .collect();
        topics.sort();
        Ok(topics)
    }

    async fn find_topics_by_config(
        &self,
        field: &str,
        value: &str,
        ignore_case: bool,
        namespace: Option<&str>,
    ) -> Result<Vec<String>> {
        let retained = self.retained.read().map_err(lock_err)?;
        let mut topics: Vec<String> = retained
            .iter()
            .filter(|(t, _)| Self::in_namespace(t, namespace))
            .filter(|(_, m)| {
                let Some(doc) = m.payload_json() else {
                    return false;
                };
                match doc.get(field) {
                    Some(Value::String(s)) => {
                        if ignore_case {
                            s.eq_ignore_ascii_case(value)
                        } else {
                            s == value
                        }
                    }
                    Some(other) => other.to_string() == value,
                    None => false,
                }
            })
            .map(|(t, _)| t.clone())
            .collect();
        topics.sort();
        Ok(topics)
    }

    async fn purge_old_messages(&self, older_than: DateTime<Utc>) -> Result<PurgeResult> {
        let started = Instant::now();
        let mut retained = self.retained.write().map_err(lock_err)?;
        let before = retained.len();
        retained.retain(|_, m| m.time >= older_than);
        Ok(PurgeResult {
            deleted: (before - retained.len()) as u64,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }
}

#[derive(Debug, Clone)]
struct ArchiveRow {
    topic: String,
    time: DateTime<Utc>,
    payload: bytes::Bytes,
    payload_json: Option<Value>,
    qos: grendel_core::QoS,
    retain: bool,
    client_id: String,
    message_uuid: Uuid,
}

#[derive(Debug, Default)]
struct ArchiveInner {
    dropped: bool,
    rows: BTreeMap<(DateTime<Utc>, String), ArchiveRow>,
}

/// In-memory message archive (one instance per archive group).
#[derive(Debug, Clone)]
pub struct MemoryMessageArchive {
    format: PayloadFormat,
    inner: Arc<RwLock<ArchiveInner>>,
}

impl MemoryMessageArchive {
    pub fn new(format: PayloadFormat) -> Self {
        MemoryMessageArchive {
            format,
            inner: Arc::new(RwLock::new(ArchiveInner::default())),
        }
    }
}

#[async_trait]
impl MessageArchive for MemoryMessageArchive {
    async fn add_history(&self, messages: Vec<BrokerMessage>) -> Result<()> {
        let mut inner = self.inner.write().map_err(lock_err)?;
        for msg in messages {
            let key = (msg.time, msg.topic.clone());
            if inner.rows.contains_key(&key) {
                continue;
            }
            let payload_json = match self.format {
                PayloadFormat::Json => msg.payload_json(),
                PayloadFormat::Default => None,
            };
            inner.rows.insert(
                key,
                ArchiveRow {
                    topic: msg.topic,
                    time: msg.time,
                    payload: msg.payload,
                    payload_json,
                    qos: msg.qos,
                    retain: msg.retain,
                    client_id: msg.client_id,
                    message_uuid: msg.message_uuid,
                },
            );
        }
        Ok(())
    }

    async fn get_history(
        &self,
        topic_or_filter: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<ArchivedMessage>> {
        let inner = self.inner.read().map_err(lock_err)?;
        let wildcard = topic::is_wildcard(topic_or_filter);

        let mut rows: Vec<&ArchiveRow> = inner
            .rows
            .values()
            .filter(|r| {
                if let Some(s) = start {
                    if r.time < s {
                        return false;
                    }
                }
                if let Some(e) = end {
                    if r.time > e {
                        return false;
                    }
                }
                if wildcard {
                    topic::matches(topic_or_filter, &r.topic)
                } else {
                    r.topic == topic_or_filter
                }
            })
            .collect();

        rows.sort_by(|a, b| b.time.cmp(&a.time));
        rows.truncate(limit);

        Ok(rows
            .into_iter()
            .map(|r| ArchivedMessage {
                topic: r.topic.clone(),
                time: r.time,
                payload: match &r.payload_json {
                    Some(doc) => ArchivePayload::Json(doc.clone()),
                    None => ArchivePayload::Raw(r.payload.clone()),
                },
                qos: r.qos,
                retain: r.retain,
                client_id: r.client_id.clone(),
                message_uuid: r.message_uuid,
            })
            .collect())
    }

    async fn get_aggregated_history(
        &self,
        topics: Vec<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval_minutes: u32,
        agg_funcs: Vec<AggFunc>,
        json_fields: Vec<String>,
    ) -> Result<AggregatedHistory> {
        let inner = self.inner.read().map_err(lock_err)?;
        let rows: Vec<SampleRow> = inner
            .rows
            .values()
            .filter(|r| r.time >= start && r.time <= end)
            .filter(|r| topics.iter().any(|t| t == &r.topic))
            .map(|r| SampleRow {
                topic: r.topic.clone(),
                time: r.time,
                payload: r.payload.clone(),
                payload_json: r.payload_json.clone(),
            })
            .collect();

        Ok(aggregate::aggregate(
            rows,
            &topics,
            start,
            end,
            interval_minutes,
            &agg_funcs,
            &json_fields,
        ))
    }

    async fn purge_old_messages(&self, older_than: DateTime<Utc>) -> Result<PurgeResult> {
        let started = Instant::now();
        let mut inner = self.inner.write().map_err(lock_err)?;
        let before = inner.rows.len();
        inner.rows.retain(|(time, _), _| *time >= older_than);
        Ok(PurgeResult {
            deleted: (before - inner.rows.len()) as u64,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn drop_storage(&self) -> Result<()> {
        let mut inner = self.inner.write().map_err(lock_err)?;
        inner.rows.clear();
        inner.dropped = true;
        Ok(())
    }

    async fn table_exists(&self) -> Result<bool> {
        let inner = self.inner.read().map_err(lock_err)?;
        Ok(!inner.dropped)
    }

    async fn create_table(&self) -> Result<()> {
        let mut inner = self.inner.write().map_err(lock_err)?;
        inner.dropped = false;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    sessions: HashMap<String, SessionRecord>,
    /// client -> filter -> subscription
    subscriptions: HashMap<String, HashMap<String, Subscription>>,
    /// message_uuid -> (message, recipient refcount)
    queued: HashMap<Uuid, (BrokerMessage, usize)>,
    /// client -> message uuids in insertion order
    queues: HashMap<String, Vec<Uuid>>,
    users: HashMap<String, User>,
    acl_rules: Vec<AclRule>,
    groups: HashMap<String, ArchiveGroup>,
    /// (timestamp, kind, identifier) -> document
    metrics: BTreeMap<(DateTime<Utc>, String, String), Value>,
    devices: HashMap<String, DeviceConfig>,
}

impl StoreInner {
    fn unref_queued(&mut self, uuid: Uuid) {
        if let Some((_, refs)) = self.queued.get_mut(&uuid) {
            *refs -= 1;
            if *refs == 0 {
                self.queued.remove(&uuid);
            }
        }
    }

    fn purge_queue_for(&mut self, client_id: &str) {
        if let Some(uuids) = self.queues.remove(client_id) {
            for uuid in uuids {
                self.unref_queued(uuid);
            }
        }
    }
}

/// In-memory implementation of the singleton broker stores: sessions,
/// users/ACLs, archive groups, metrics, and device configs.
///
/// A single lock guards all tables so that multi-table operations such as
/// `del_client` are atomic to observers.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<RwLock<StoreInner>>,
    next_rule_id: Arc<AtomicI64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            inner: Arc::new(RwLock::new(StoreInner::default())),
            next_rule_id: Arc::new(AtomicI64::new(1)),
        }
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn set_client(
        &self,
        client_id: &str,
        node_id: &str,
        clean_session: bool,
        connected: bool,
        info: Value,
    ) -> Result<()> {
        let mut inner = self.inner.write().map_err(lock_err)?;
        let now = Utc::now();
        match inner.sessions.get_mut(client_id) {
            Some(session) => {
                session.node_id = node_id.to_string();
                session.clean_session = clean_session;
                session.connected = connected;
                session.last_update = now;
                session.info = info;
            }
            None => {
                inner.sessions.insert(
                    client_id.to_string(),
                    SessionRecord {
                        client_id: client_id.to_string(),
                        node_id: node_id.to_string(),
                        clean_session,
                        connected,
                        last_update: now,
                        info,
                        last_will: None,
                    },
                );
            }
        }
        Ok(())
    }

    async fn set_connected(&self, client_id: &str, connected: bool) -> Result<()> {
        let mut inner = self.inner.write().map_err(lock_err)?;
        match inner.sessions.get_mut(client_id) {
            Some(session) => {
                session.connected = connected;
                session.last_update = Utc::now();
                Ok(())
            }
            None => Err(StorageError::NotFound(client_id.to_string())),
        }
    }

    async fn is_connected(&self, client_id: &str) -> Result<bool> {
        let inner = self.inner.read().map_err(lock_err)?;
        Ok(inner
            .sessions
            .get(client_id)
            .map(|s| s.connected)
            .unwrap_or(false))
    }

    async fn is_present(&self, client_id: &str) -> Result<bool> {
        let inner = self.inner.read().map_err(lock_err)?;
        Ok(inner.sessions.contains_key(client_id))
    }

    async fn set_last_will(&self, client_id: &str, will: Option<BrokerMessage>) -> Result<()> {
        let mut inner = self.inner.write().map_err(lock_err)?;
        match inner.sessions.get_mut(client_id) {
            Some(session) => {
                session.last_will = will;
                Ok(())
            }
            None => Err(StorageError::NotFound(client_id.to_string())),
        }
    }

    async fn get_session(&self, client_id: &str) -> Result<Option<SessionRecord>> {
        let inner = self.inner.read().map_err(lock_err)?;
        Ok(inner.sessions.get(client_id).cloned())
    }

    async fn add_subscriptions(&self, subscriptions: Vec<Subscription>) -> Result<()> {
        let mut inner = self.inner.write().map_err(lock_err)?;
        for sub in subscriptions {
            inner
                .subscriptions
                .entry(sub.client_id.clone())
                .or_default()
                .insert(sub.topic_filter.clone(), sub);
        }
        Ok(())
    }

    async fn del_subscriptions(&self, subscriptions: Vec<Subscription>) -> Result<()> {
        let mut inner = self.inner.write().map_err(lock_err)?;
        for sub in subscriptions {
            let now_empty = match inner.subscriptions.get_mut(&sub.client_id) {
                Some(client_subs) => {
                    client_subs.remove(&sub.topic_filter);
                    client_subs.is_empty()
                }
                None => false,
            };
            if now_empty {
                inner.subscriptions.remove(&sub.client_id);
            }
        }
        Ok(())
    }

    async fn get_subscriptions(&self, client_id: &str) -> Result<Vec<Subscription>> {
        let inner = self.inner.read().map_err(lock_err)?;
        Ok(inner
            .subscriptions
            .get(client_id)
            .map(|subs| subs.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn del_client(&self, client_id: &str, visitor: SubscriptionVisitor<'_>) -> Result<()> {
        let mut inner = self.inner.write().map_err(lock_err)?;

        if let Some(subs) = inner.subscriptions.remove(client_id) {
            for sub in subs.into_values() {
                visitor(sub);
            }
        }
        inner.purge_queue_for(client_id);
        inner.sessions.remove(client_id);
        Ok(())
    }

    async fn enqueue_messages(&self, messages: Vec<(BrokerMessage, Vec<String>)>) -> Result<()> {
        let mut inner = self.inner.write().map_err(lock_err)?;
        let inner = &mut *inner;
        for (msg, recipients) in messages {
            let uuid = msg.message_uuid;
            for client_id in recipients {
                let queue = inner.queues.entry(client_id).or_default();
                if queue.contains(&uuid) {
                    continue;
                }
                queue.push(uuid);
                inner
                    .queued
                    .entry(uuid)
                    .or_insert_with(|| (msg.clone(), 0))
                    .1 += 1;
            }
        }
        Ok(())
    }

    async fn dequeue_messages(&self, client_id: &str, visitor: MessageVisitor<'_>) -> Result<()> {
        let mut inner = self.inner.write().map_err(lock_err)?;

        let Some(queue) = inner.queues.get(client_id) else {
            return Ok(());
        };

        let pending: Vec<Uuid> = queue.clone();
        let mut acked = Vec::new();

        for uuid in pending {
            let Some((msg, _)) = inner.queued.get(&uuid) else {
                // Mapping without a message: skip the bad row, keep going.
                tracing::warn!(%uuid, client_id, "queued mapping without message, skipping");
                acked.push(uuid);
                continue;
            };
            let mut delivery = msg.clone();
            delivery.queued = true;
            if visitor(delivery) {
                acked.push(uuid);
            } else {
                break;
            }
        }

        let now_empty = match inner.queues.get_mut(client_id) {
            Some(queue) => {
                queue.retain(|u| !acked.contains(u));
                queue.is_empty()
            }
            None => false,
        };
        if now_empty {
            inner.queues.remove(client_id);
        }
        for uuid in acked {
            inner.unref_queued(uuid);
        }
        Ok(())
    }

    async fn remove_messages(&self, messages: Vec<(String, Uuid)>) -> Result<()> {
        let mut inner = self.inner.write().map_err(lock_err)?;
        for (client_id, uuid) in messages {
            let (removed, now_empty) = match inner.queues.get_mut(&client_id) {
                Some(queue) => {
                    let before = queue.len();
                    queue.retain(|u| *u != uuid);
                    (queue.len() != before, queue.is_empty())
                }
                None => (false, false),
            };
            if now_empty {
                inner.queues.remove(&client_id);
            }
            if removed {
                inner.unref_queued(uuid);
            }
        }
        Ok(())
    }

    async fn purge_queued_messages(&self, client_id: &str) -> Result<()> {
        let mut inner = self.inner.write().map_err(lock_err)?;
        inner.purge_queue_for(client_id);
        Ok(())
    }

    async fn purge_sessions(&self) -> Result<u64> {
        let mut inner = self.inner.write().map_err(lock_err)?;
        let stale: Vec<String> = inner
            .sessions
            .values()
            .filter(|s| !s.connected)
            .map(|s| s.client_id.clone())
            .collect();

        for client_id in &stale {
            inner.subscriptions.remove(client_id);
            inner.purge_queue_for(client_id);
            inner.sessions.remove(client_id);
        }
        Ok(stale.len() as u64)
    }

    async fn count_queued_messages(&self) -> Result<u64> {
        let inner = self.inner.read().map_err(lock_err)?;
        Ok(inner.queues.values().map(|q| q.len() as u64).sum())
    }

    async fn count_queued_messages_for_client(&self, client_id: &str) -> Result<u64> {
        let inner = self.inner.read().map_err(lock_err)?;
        Ok(inner
            .queues
            .get(client_id)
            .map(|q| q.len() as u64)
            .unwrap_or(0))
    }

    async fn iterate_subscriptions(&self, visitor: SubscriptionVisitor<'_>) -> Result<()> {
        let subs: Vec<Subscription> = {
            let inner = self.inner.read().map_err(lock_err)?;
            inner
                .subscriptions
                .values()
                .flat_map(|m| m.values().cloned())
                .collect()
        };
        for sub in subs {
            if !visitor(sub) {
                break;
            }
        }
        Ok(())
    }

    async fn iterate_offline_clients(&self, visitor: ClientVisitor<'_>) -> Result<()> {
        let clients: Vec<String> = {
            let inner = self.inner.read().map_err(lock_err)?;
            inner
                .sessions
                .values()
                .filter(|s| !s.connected)
                .map(|s| s.client_id.clone())
                .collect()
        };
        for client in clients {
            if !visitor(client) {
                break;
            }
        }
        Ok(())
    }

    async fn iterate_node_clients(&self, node_id: &str, visitor: ClientVisitor<'_>) -> Result<()> {
        let clients: Vec<String> = {
            let inner = self.inner.read().map_err(lock_err)?;
            inner
                .sessions
                .values()
                .filter(|s| s.node_id == node_id)
                .map(|s| s.client_id.clone())
                .collect()
        };
        for client in clients {
            if !visitor(client) {
                break;
            }
        }
        Ok(())
    }

    async fn iterate_all_sessions(&self, visitor: SessionVisitor<'_>) -> Result<()> {
        let sessions: Vec<SessionRecord> = {
            let inner = self.inner.read().map_err(lock_err)?;
            inner.sessions.values().cloned().collect()
        };
        for session in sessions {
            if !visitor(session) {
                break;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn create_user(&self, user: User) -> Result<()> {
        let mut inner = self.inner.write().map_err(lock_err)?;
        if inner.users.contains_key(&user.username) {
            return Err(StorageError::Permanent(format!(
                "user `{}` already exists",
                user.username
            )));
        }
        inner.users.insert(user.username.clone(), user);
        Ok(())
    }

    async fn get_user(&self, username: &str) -> Result<Option<User>> {
        let inner = self.inner.read().map_err(lock_err)?;
        Ok(inner.users.get(username).cloned())
    }

    async fn update_user(&self, mut user: User) -> Result<()> {
        let mut inner = self.inner.write().map_err(lock_err)?;
        if !inner.users.contains_key(&user.username) {
            return Err(StorageError::NotFound(user.username));
        }
        user.updated_at = Utc::now();
        inner.users.insert(user.username.clone(), user);
        Ok(())
    }

    async fn delete_user(&self, username: &str) -> Result<()> {
        let mut inner = self.inner.write().map_err(lock_err)?;
        inner.users.remove(username);
        inner.acl_rules.retain(|r| r.username != username);
        Ok(())
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        let inner = self.inner.read().map_err(lock_err)?;
        let mut users: Vec<User> = inner.users.values().cloned().collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(users)
    }

    async fn validate_credentials(&self, username: &str, password: &str) -> Result<Option<User>> {
        let user = {
            let inner = self.inner.read().map_err(lock_err)?;
            inner.users.get(username).cloned()
        };

        Ok(user.filter(|u| u.enabled && crate::password::verify_password(password, &u.password_hash)))
    }

    async fn create_acl_rule(&self, mut rule: AclRule) -> Result<AclRule> {
        let mut inner = self.inner.write().map_err(lock_err)?;
        if !inner.users.contains_key(&rule.username) {
            return Err(StorageError::NotFound(rule.username));
        }
        rule.id = self.next_rule_id.fetch_add(1, Ordering::SeqCst);
        inner.acl_rules.push(rule.clone());
        Ok(rule)
    }

    async fn update_acl_rule(&self, rule: AclRule) -> Result<()> {
        let mut inner = self.inner.write().map_err(lock_err)?;
        match inner.acl_rules.iter_mut().find(|r| r.id == rule.id) {
            Some(existing) => {
                *existing = rule;
                Ok(())
            }
            None => Err(StorageError::NotFound(format!("acl rule {}", rule.id))),
        }
    }

    async fn delete_acl_rule(&self, id: i64) -> Result<()> {
        let mut inner = self.inner.write().map_err(lock_err)?;
        inner.acl_rules.retain(|r| r.id != id);
        Ok(())
    }

    async fn list_acl_rules(&self, username: Option<&str>) -> Result<Vec<AclRule>> {
        let inner = self.inner.read().map_err(lock_err)?;
        let mut rules: Vec<AclRule> = inner
            .acl_rules
            .iter()
            .filter(|r| username.map(|u| r.username == u).unwrap_or(true))
            .cloned()
            .collect();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(rules)
    }

    async fn load_all_users_and_acls(&self) -> Result<(Vec<User>, Vec<AclRule>)> {
        let inner = self.inner.read().map_err(lock_err)?;
        let users = inner.users.values().cloned().collect();
        let mut rules: Vec<AclRule> = inner.acl_rules.clone();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok((users, rules))
    }
}

#[async_trait]
impl ArchiveGroupStore for MemoryStore {
    async fn ensure_default_group(&self) -> Result<()> {
        let mut inner = self.inner.write().map_err(lock_err)?;
        inner
            .groups
            .entry(DEFAULT_ARCHIVE_GROUP.to_string())
            .or_insert_with(ArchiveGroup::default_group);
        Ok(())
    }

    async fn upsert_group(&self, mut group: ArchiveGroup) -> Result<()> {
        for filter in &group.topic_filters {
            topic::validate_filter(filter)
                .map_err(|e| StorageError::InvalidInput(e.to_string()))?;
        }
        // Reject bad duration strings before they reach a purge loop.
        group.archive_retention_millis()?;
        group.last_val_retention_millis()?;
        group.purge_interval_millis()?;

        let mut inner = self.inner.write().map_err(lock_err)?;
        group.updated_at = Utc::now();
        inner.groups.insert(group.name.clone(), group);
        Ok(())
    }

    async fn get_group(&self, name: &str) -> Result<Option<ArchiveGroup>> {
        let inner = self.inner.read().map_err(lock_err)?;
        Ok(inner.groups.get(name).cloned())
    }

    async fn delete_group(&self, name: &str) -> Result<()> {
        if name == DEFAULT_ARCHIVE_GROUP {
            return Err(StorageError::InvalidInput(
                "the Default archive group cannot be deleted".to_string(),
            ));
        }
        let mut inner = self.inner.write().map_err(lock_err)?;
        inner.groups.remove(name);
        Ok(())
    }

    async fn list_groups(&self) -> Result<Vec<ArchiveGroup>> {
        let inner = self.inner.read().map_err(lock_err)?;
        let mut groups: Vec<ArchiveGroup> = inner.groups.values().cloned().collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(groups)
    }
}

#[async_trait]
impl MetricsStore for MemoryStore {
    async fn upsert_sample(&self, sample: MetricsSample) -> Result<()> {
        let mut inner = self.inner.write().map_err(lock_err)?;
        inner.metrics.insert(
            (
                sample.timestamp,
                sample.kind.as_str().to_string(),
                sample.identifier,
            ),
            sample.payload,
        );
        Ok(())
    }

    async fn latest_sample(
        &self,
        kind: MetricKind,
        identifier: &str,
        window: TimeWindow,
    ) -> Result<Option<MetricsSample>> {
        let history = self.sample_history(kind, identifier, window, 1).await?;
        Ok(history.into_iter().next())
    }

    async fn sample_history(
        &self,
        kind: MetricKind,
        identifier: &str,
        window: TimeWindow,
        limit: usize,
    ) -> Result<Vec<MetricsSample>> {
        let inner = self.inner.read().map_err(lock_err)?;
        let mut samples: Vec<MetricsSample> = inner
            .metrics
            .range((window.start, String::new(), String::new())..)
            .take_while(|((t, _, _), _)| *t <= window.end)
            .filter(|((_, k, id), _)| k == kind.as_str() && id == identifier)
            .map(|((t, _, id), payload)| MetricsSample {
                timestamp: *t,
                kind,
                identifier: id.clone(),
                payload: payload.clone(),
            })
            .collect();

        samples.reverse(); // newest first
        samples.truncate(limit);
        Ok(samples)
    }

    async fn purge_old_samples(&self, older_than: DateTime<Utc>) -> Result<PurgeResult> {
        let started = Instant::now();
        let mut inner = self.inner.write().map_err(lock_err)?;
        let before = inner.metrics.len();
        inner.metrics.retain(|(t, _, _), _| *t >= older_than);
        Ok(PurgeResult {
            deleted: (before - inner.metrics.len()) as u64,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }
}

#[async_trait]
impl DeviceConfigStore for MemoryStore {
    async fn upsert_device(&self, device: DeviceConfig) -> Result<()> {
        device.validate()?;
        let mut inner = self.inner.write().map_err(lock_err)?;
        inner.devices.insert(device.name.clone(), device);
        Ok(())
    }

    async fn get_device(&self, name: &str) -> Result<Option<DeviceConfig>> {
        let inner = self.inner.read().map_err(lock_err)?;
        Ok(inner.devices.get(name).cloned())
    }

    async fn delete_device(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.write().map_err(lock_err)?;
        inner.devices.remove(name);
        Ok(())
    }

    async fn list_devices(
        &self,
        namespace: Option<&str>,
        node_id: Option<&str>,
    ) -> Result<Vec<DeviceConfig>> {
        let inner = self.inner.read().map_err(lock_err)?;
        let mut devices: Vec<DeviceConfig> = inner
            .devices
            .values()
            .filter(|d| namespace.map(|ns| d.namespace == ns).unwrap_or(true))
            .filter(|d| node_id.map(|n| d.node_id == n).unwrap_or(true))
            .cloned()
            .collect();
        devices.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grendel_core::QoS;

    fn msg(topic_name: &str, payload: &str) -> BrokerMessage {
        BrokerMessage::new(topic_name, payload.to_string()).with_client_id("tester")
    }

    #[tokio::test]
    async fn test_retained_put_get_del() {
        let store = MemoryMessageStore::new();

        store
            .put_all(vec![msg("sensors/1/temp", "21").with_retain(true)])
            .await
            .unwrap();

        let got = store.get("sensors/1/temp").await.unwrap().unwrap();
        assert_eq!(got.payload.as_ref(), b"21");

        store
            .del_all(vec!["sensors/1/temp".to_string()])
            .await
            .unwrap();
        assert!(store.get("sensors/1/temp").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retained_upsert_is_idempotent() {
        let store = MemoryMessageStore::new();
        let m = msg("a/b", "1");
        store.put_all(vec![m.clone()]).await.unwrap();
        store.put_all(vec![m]).await.unwrap();

        let mut count = 0;
        store
            .find_matching_messages("#", &mut |_| {
                count += 1;
                true
            })
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_find_matching_messages_wildcards() {
        let store = MemoryMessageStore::new();
        store
            .put_all(vec![
                msg("sensors/1/temp", "21"),
                msg("sensors/2/temp", "22"),
                msg("sensors/1/hum", "40"),
            ])
            .await
            .unwrap();

        let mut seen = Vec::new();
        store
            .find_matching_messages("sensors/+/temp", &mut |m| {
                seen.push(m.topic);
                true
            })
            .await
            .unwrap();
        seen.sort();
        assert_eq!(seen, vec!["sensors/1/temp", "sensors/2/temp"]);

        // Visitor can stop early.
        let mut count = 0;
        store
            .find_matching_messages("sensors/#", &mut |_| {
                count += 1;
                false
            })
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_find_matching_topics_depth() {
        let store = MemoryMessageStore::new();
        store
            .put_all(vec![
                msg("sensors/1/temp", "21"),
                msg("sensors/1/hum", "40"),
                msg("sensors/2/temp", "22"),
            ])
            .await
            .unwrap();

        let mut prefixes = Vec::new();
        store
            .find_matching_topics("sensors/+", &mut |t| {
                prefixes.push(t);
                true
            })
            .await
            .unwrap();
        prefixes.sort();
        assert_eq!(prefixes, vec!["sensors/1", "sensors/2"]);
    }

    #[tokio::test]
    async fn test_find_topics_by_name_glob() {
        let store = MemoryMessageStore::new();
        store
            .put_all(vec![msg("plant/line1/temp", "1"), msg("plant/line2/rpm", "2")])
            .await
            .unwrap();

        let found = store
            .find_topics_by_name("plant/*/temp", false, None)
            .await
            .unwrap();
        assert_eq!(found, vec!["plant/line1/temp"]);

        let found = store
            .find_topics_by_name("PLANT/*", true, None)
            .await
            .unwrap();
        assert_eq!(found.len(), 2);

        let found = store
            .find_topics_by_name("*", false, Some("plant"))
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
    }

    #[tokio::test]
    async fn test_find_topics_by_config() {
        let store = MemoryMessageStore::new();
        store
            .put_all(vec![
                msg("dev/a", r#"{"type": "opcua"}"#),
                msg("dev/b", r#"{"type": "kafka"}"#),
            ])
            .await
            .unwrap();

        let found = store
            .find_topics_by_config("type", "opcua", false, None)
            .await
            .unwrap();
        assert_eq!(found, vec!["dev/a"]);
    }

    #[tokio::test]
    async fn test_retained_purge() {
        let store = MemoryMessageStore::new();
        let mut old = msg("old/topic", "1");
        old.time = Utc::now() - chrono::Duration::hours(2);
        store.put_all(vec![old, msg("new/topic", "2")]).await.unwrap();

        let result = store
            .purge_old_messages(Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(result.deleted, 1);
        assert!(store.get("old/topic").await.unwrap().is_none());
        assert!(store.get("new/topic").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_archive_history_descending_with_limit() {
        let archive = MemoryMessageArchive::new(PayloadFormat::Default);
        let base = Utc::now();
        for i in 0..5 {
            let mut m = msg("a/b", &format!("{i}"));
            m.time = base + chrono::Duration::seconds(i);
            archive.add_history(vec![m]).await.unwrap();
        }

        let history = archive.get_history("a/b", None, None, 3).await.unwrap();
        assert_eq!(history.len(), 3);
        assert!(history[0].time > history[1].time);
        assert_eq!(history[0].payload, ArchivePayload::Raw("4".into()));
    }

    #[tokio::test]
    async fn test_archive_idempotent_on_topic_time() {
        let archive = MemoryMessageArchive::new(PayloadFormat::Default);
        let m = msg("a/b", "1");
        archive.add_history(vec![m.clone()]).await.unwrap();
        archive.add_history(vec![m]).await.unwrap();

        let history = archive.get_history("a/b", None, None, 10).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_archive_wildcard_history() {
        let archive = MemoryMessageArchive::new(PayloadFormat::Default);
        archive
            .add_history(vec![msg("a/b", "1"), msg("a/c/d", "2"), msg("x/y", "3")])
            .await
            .unwrap();

        let history = archive.get_history("a/#", None, None, 10).await.unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn test_archive_json_format() {
        let archive = MemoryMessageArchive::new(PayloadFormat::Json);
        archive
            .add_history(vec![msg("a/b", r#"{"v": 1}"#), msg("a/c", "raw bytes")])
            .await
            .unwrap();

        let history = archive.get_history("a/#", None, None, 10).await.unwrap();
        let by_topic: HashMap<String, ArchivePayload> = history
            .into_iter()
            .map(|m| (m.topic, m.payload))
            .collect();

        assert!(matches!(by_topic["a/b"], ArchivePayload::Json(_)));
        assert!(matches!(by_topic["a/c"], ArchivePayload::Raw(_)));
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let store = MemoryStore::new();
        store
            .set_client("c1", "node1", false, true, serde_json::json!({}))
            .await
            .unwrap();

        assert!(store.is_present("c1").await.unwrap());
        assert!(store.is_connected("c1").await.unwrap());

        store.set_connected("c1", false).await.unwrap();
        assert!(!store.is_connected("c1").await.unwrap());

        let mut offline = Vec::new();
        store
            .iterate_offline_clients(&mut |c| {
                offline.push(c);
                true
            })
            .await
            .unwrap();
        assert_eq!(offline, vec!["c1"]);
    }

    #[tokio::test]
    async fn test_del_client_visits_subscriptions() {
        let store = MemoryStore::new();
        store
            .set_client("c1", "node1", false, true, serde_json::json!({}))
            .await
            .unwrap();
        store
            .add_subscriptions(vec![
                Subscription::new("c1", "a/#", QoS::AtLeastOnce),
                Subscription::new("c1", "b", QoS::AtMostOnce),
            ])
            .await
            .unwrap();
        store
            .enqueue_messages(vec![(msg("a/x", "1"), vec!["c1".to_string()])])
            .await
            .unwrap();

        let mut visited = Vec::new();
        store
            .del_client("c1", &mut |sub| {
                visited.push(sub.topic_filter);
                true
            })
            .await
            .unwrap();
        visited.sort();
        assert_eq!(visited, vec!["a/#", "b"]);

        assert!(!store.is_present("c1").await.unwrap());
        assert_eq!(store.count_queued_messages().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_queue_fifo_and_ack() {
        let store = MemoryStore::new();
        let m1 = msg("a/b", "first");
        let m2 = msg("a/b/c", "second");
        let m3 = msg("a/d", "third");

        store
            .enqueue_messages(vec![
                (m1.clone(), vec!["c1".to_string()]),
                (m2.clone(), vec!["c1".to_string()]),
                (m3.clone(), vec!["c1".to_string()]),
            ])
            .await
            .unwrap();

        assert_eq!(store.count_queued_messages_for_client("c1").await.unwrap(), 3);

        // Drain in order, acking the first two only.
        let mut seen = Vec::new();
        store
            .dequeue_messages("c1", &mut |m| {
                seen.push(String::from_utf8_lossy(&m.payload).to_string());
                assert!(m.queued);
                seen.len() < 3
            })
            .await
            .unwrap();
        assert_eq!(seen, vec!["first", "second", "third"]);
        assert_eq!(store.count_queued_messages_for_client("c1").await.unwrap(), 1);

        // Remaining message is still the third one.
        let mut remaining = Vec::new();
        store
            .dequeue_messages("c1", &mut |m| {
                remaining.push(String::from_utf8_lossy(&m.payload).to_string());
                true
            })
            .await
            .unwrap();
        assert_eq!(remaining, vec!["third"]);
        assert_eq!(store.count_queued_messages_for_client("c1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_enqueue_duplicate_is_noop() {
        let store = MemoryStore::new();
        let m = msg("a/b", "1");
        store
            .enqueue_messages(vec![(m.clone(), vec!["c1".to_string()])])
            .await
            .unwrap();
        store
            .enqueue_messages(vec![(m, vec!["c1".to_string()])])
            .await
            .unwrap();
        assert_eq!(store.count_queued_messages_for_client("c1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_message_shared_between_recipients() {
        let store = MemoryStore::new();
        let m = msg("a/b", "1");
        store
            .enqueue_messages(vec![(m.clone(), vec!["c1".to_string(), "c2".to_string()])])
            .await
            .unwrap();

        store
            .remove_messages(vec![("c1".to_string(), m.message_uuid)])
            .await
            .unwrap();

        // c2 still sees the message.
        let mut seen = 0;
        store
            .dequeue_messages("c2", &mut |_| {
                seen += 1;
                true
            })
            .await
            .unwrap();
        assert_eq!(seen, 1);
    }

    #[tokio::test]
    async fn test_purge_sessions_drops_disconnected_only() {
        let store = MemoryStore::new();
        store
            .set_client("on", "n", false, true, serde_json::json!({}))
            .await
            .unwrap();
        store
            .set_client("off", "n", false, false, serde_json::json!({}))
            .await
            .unwrap();

        assert_eq!(store.purge_sessions().await.unwrap(), 1);
        assert!(store.is_present("on").await.unwrap());
        assert!(!store.is_present("off").await.unwrap());
    }

    #[tokio::test]
    async fn test_user_crud_and_credentials() {
        let store = MemoryStore::new();
        let hash = crate::password::hash_password("pw").unwrap();
        store.create_user(User::new("alice", hash)).await.unwrap();

        assert!(store.create_user(User::new("alice", "x")).await.is_err());

        let user = store.validate_credentials("alice", "pw").await.unwrap();
        assert!(user.is_some());
        assert!(store
            .validate_credentials("alice", "bad")
            .await
            .unwrap()
            .is_none());

        let mut alice = store.get_user("alice").await.unwrap().unwrap();
        alice.enabled = false;
        store.update_user(alice).await.unwrap();
        assert!(store
            .validate_credentials("alice", "pw")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_acl_rules_deleted_with_user() {
        let store = MemoryStore::new();
        store.create_user(User::new("bob", "h")).await.unwrap();

        let rule = store
            .create_acl_rule(AclRule {
                id: 0,
                username: "bob".to_string(),
                topic_pattern: "a/#".to_string(),
                can_subscribe: true,
                can_publish: false,
                priority: 10,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        assert!(rule.id > 0);

        store.delete_user("bob").await.unwrap();
        assert!(store.list_acl_rules(Some("bob")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_acl_rules_sorted_by_priority() {
        let store = MemoryStore::new();
        store.create_user(User::new("u", "h")).await.unwrap();
        for (pattern, priority) in [("a/#", 10), ("a/b", 20), ("c", 5)] {
            store
                .create_acl_rule(AclRule {
                    id: 0,
                    username: "u".to_string(),
                    topic_pattern: pattern.to_string(),
                    can_subscribe: true,
                    can_publish: true,
                    priority,
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        let rules = store.list_acl_rules(Some("u")).await.unwrap();
        let priorities: Vec<i32> = rules.iter().map(|r| r.priority).collect();
        assert_eq!(priorities, vec![20, 10, 5]);
    }

    #[tokio::test]
    async fn test_default_group_seeded_and_protected() {
        let store = MemoryStore::new();
        store.ensure_default_group().await.unwrap();

        let group = store.get_group(DEFAULT_ARCHIVE_GROUP).await.unwrap().unwrap();
        assert_eq!(group.topic_filters, vec!["#"]);

        assert!(store.delete_group(DEFAULT_ARCHIVE_GROUP).await.is_err());
    }

    #[tokio::test]
    async fn test_group_rejects_bad_filter_and_duration() {
        let store = MemoryStore::new();

        let mut group = ArchiveGroup::default_group();
        group.name = "bad".to_string();
        group.topic_filters = vec!["a/#/b".to_string()];
        assert!(store.upsert_group(group).await.is_err());

        let mut group = ArchiveGroup::default_group();
        group.name = "bad2".to_string();
        group.purge_interval = Some("often".to_string());
        assert!(store.upsert_group(group).await.is_err());
    }

    #[tokio::test]
    async fn test_metrics_window_and_order() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for i in 0..3 {
            store
                .upsert_sample(MetricsSample {
                    timestamp: now - chrono::Duration::minutes(i),
                    kind: MetricKind::Broker,
                    identifier: "node1".to_string(),
                    payload: serde_json::json!({ "messagesIn": i }),
                })
                .await
                .unwrap();
        }

        let window = TimeWindow::resolve(Some(5), None, None).unwrap();
        let history = store
            .sample_history(MetricKind::Broker, "node1", window, 10)
            .await
            .unwrap();
        assert_eq!(history.len(), 3);
        assert!(history[0].timestamp > history[1].timestamp);

        let latest = store
            .latest_sample(MetricKind::Broker, "node1", window)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.payload["messagesIn"], 0);
    }

    #[tokio::test]
    async fn test_metrics_upsert_on_conflict() {
        let store = MemoryStore::new();
        let ts = Utc::now();
        for v in [1, 2] {
            store
                .upsert_sample(MetricsSample {
                    timestamp: ts,
                    kind: MetricKind::Session,
                    identifier: "c1".to_string(),
                    payload: serde_json::json!({ "v": v }),
                })
                .await
                .unwrap();
        }

        let window = TimeWindow::resolve(Some(5), None, None).unwrap();
        let history = store
            .sample_history(MetricKind::Session, "c1", window, 10)
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].payload["v"], 2);
    }

    #[tokio::test]
    async fn test_device_config_crud() {
        let store = MemoryStore::new();
        let device = DeviceConfig {
            name: "plc-1".to_string(),
            namespace: "factory".to_string(),
            node_id: "node1".to_string(),
            enabled: true,
            config: serde_json::json!({"endpoint": "opc.tcp://10.0.0.1"}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.upsert_device(device.clone()).await.unwrap();

        assert!(store.get_device("plc-1").await.unwrap().is_some());
        assert_eq!(
            store
                .list_devices(Some("factory"), None)
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(store
            .list_devices(Some("other"), None)
            .await
            .unwrap()
            .is_empty());

        store.delete_device("plc-1").await.unwrap();
        assert!(store.get_device("plc-1").await.unwrap().is_none());
    }
}
