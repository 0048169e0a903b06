//! Retained-message store on SQLite.
//!
//! A retained row decomposes its topic into nine fixed level columns plus
//! a trailing-levels column and the last level. Wildcard lookup turns the
//! literal levels of a filter into indexed equality predicates; `#` drops
//! the depth constraint. Candidate rows are always re-checked with the
//! structural matcher before the visitor runs, so the SQL only has to
//! narrow, never to decide.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tracing::warn;
use uuid::Uuid;

use grendel_core::{topic, BrokerMessage};

use crate::glob::glob_match;
use crate::traits::{MessageVisitor, TopicVisitor};
use crate::types::PurgeResult;
use crate::{MessageStore, Result, StorageError};

use super::{blocking_on, int_to_qos, millis_to_time, qos_to_int, validate_table_name};

/// Number of fixed, indexable level columns.
const LEVEL_COLUMNS: usize = 9;

/// Retained-message store backed by one SQLite table.
#[derive(Clone)]
pub struct SqliteMessageStore {
    conn: Arc<Mutex<Connection>>,
    table: String,
}

impl SqliteMessageStore {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>, table: &str) -> Result<Self> {
        validate_table_name(table)?;
        let store = SqliteMessageStore {
            conn,
            table: table.to_string(),
        };
        store.create_table_blocking()?;
        Ok(store)
    }

    fn create_table_blocking(&self) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StorageError::Permanent(e.to_string()))?;

        let level_cols: String = (0..LEVEL_COLUMNS)
            .map(|i| format!("level_{i} TEXT,"))
            .collect();

        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                topic TEXT PRIMARY KEY,
                {level_cols}
                levels_rest TEXT,
                last_level TEXT NOT NULL,
                payload BLOB NOT NULL,
                payload_json TEXT,
                qos INTEGER NOT NULL,
                retain INTEGER NOT NULL,
                client_id TEXT NOT NULL,
                message_id INTEGER NOT NULL,
                message_uuid TEXT NOT NULL,
                time INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_levels
                ON {table}(level_0, level_1, level_2, level_3);",
            table = self.table,
        ))?;

        Ok(())
    }

    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        blocking_on(Arc::clone(&self.conn), f).await
    }

    /// First nine levels as column values, the rest joined, and the last
    /// level.
    fn decompose(topic_name: &str) -> ([Option<String>; LEVEL_COLUMNS], Option<String>, String) {
        let levels = topic::levels(topic_name);
        let mut columns: [Option<String>; LEVEL_COLUMNS] = Default::default();
        for (i, level) in levels.iter().take(LEVEL_COLUMNS).enumerate() {
            columns[i] = Some(level.to_string());
        }
        let rest = if levels.len() > LEVEL_COLUMNS {
            Some(levels[LEVEL_COLUMNS..].join("/"))
        } else {
            None
        };
        let last = levels.last().map(|l| l.to_string()).unwrap_or_default();
        (columns, rest, last)
    }

    /// Translate a filter into an indexable WHERE fragment. Literal levels
    /// beyond the fixed columns and any `+` positions are left to the
    /// structural re-check.
    fn filter_predicate(filter: &str) -> (String, Vec<String>) {
        let flevels = topic::levels(filter);
        let mut clauses = Vec::new();
        let mut values = Vec::new();
        let mut multi = false;

        for (i, level) in flevels.iter().enumerate() {
            if *level == topic::WILDCARD_MULTI {
                multi = true;
                break;
            }
            if *level == topic::WILDCARD_SINGLE {
                continue;
            }
            if i < LEVEL_COLUMNS {
                clauses.push(format!("level_{i} = ?"));
                values.push(level.to_string());
            }
        }

        if !multi {
            let depth = flevels.len();
            if depth <= LEVEL_COLUMNS {
                clauses.push(format!("level_{} IS NOT NULL", depth - 1));
                if depth < LEVEL_COLUMNS {
                    clauses.push(format!("level_{depth} IS NULL"));
                } else {
                    clauses.push("levels_rest IS NULL".to_string());
                }
            }
        }

        let where_sql = if clauses.is_empty() {
            "1 = 1".to_string()
        } else {
            clauses.join(" AND ")
        };
        (where_sql, values)
    }

    fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<BrokerMessage> {
        let topic_name: String = row.get("topic")?;
        let payload: Vec<u8> = row.get("payload")?;
        let qos: i64 = row.get("qos")?;
        let retain: bool = row.get("retain")?;
        let client_id: String = row.get("client_id")?;
        let message_id: i64 = row.get("message_id")?;
        let message_uuid: String = row.get("message_uuid")?;
        let time: i64 = row.get("time")?;

        Ok(BrokerMessage {
            message_uuid: Uuid::parse_str(&message_uuid).unwrap_or_default(),
            message_id: message_id as u16,
            topic: topic_name,
            payload: Bytes::from(payload),
            qos: int_to_qos(qos),
            retain,
            queued: false,
            dup: false,
            client_id,
            time: millis_to_time(time).unwrap_or_else(Utc::now),
        })
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn get(&self, topic_name: &str) -> Result<Option<BrokerMessage>> {
        let table = self.table.clone();
        let topic_name = topic_name.to_string();

        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT topic, payload, qos, retain, client_id, message_id, message_uuid, time
                 FROM {table} WHERE topic = ?1"
            ))?;
            let row = stmt
                .query_row(params![topic_name], Self::row_to_message)
                .optional()?;
            Ok(row)
        })
        .await
    }

    async fn put_all(&self, messages: Vec<BrokerMessage>) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let table = self.table.clone();

        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            {
                let level_names: String = (0..LEVEL_COLUMNS)
                    .map(|i| format!("level_{i}, "))
                    .collect();
                let level_marks: String =
                    (0..LEVEL_COLUMNS).map(|i| format!("?{}, ", i + 2)).collect();
                let mut stmt = tx.prepare(&format!(
                    "INSERT OR REPLACE INTO {table}
                     (topic, {level_names}levels_rest, last_level, payload, payload_json,
                      qos, retain, client_id, message_id, message_uuid, time)
                     VALUES (?1, {level_marks}?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)"
                ))?;

                for msg in messages {
                    let (levels, rest, last) = Self::decompose(&msg.topic);
                    let payload_json = msg.payload_json().map(|v| v.to_string());
                    stmt.execute(params![
                        msg.topic,
                        levels[0],
                        levels[1],
                        levels[2],
                        levels[3],
                        levels[4],
                        levels[5],
                        levels[6],
                        levels[7],
                        levels[8],
                        rest,
                        last,
                        msg.payload.as_ref(),
                        payload_json,
                        qos_to_int(msg.qos),
                        msg.retain,
                        msg.client_id,
                        i64::from(msg.message_id),
                        msg.message_uuid.to_string(),
                        msg.time.timestamp_millis(),
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn del_all(&self, topics: Vec<String>) -> Result<()> {
        if topics.is_empty() {
            return Ok(());
        }
        let table = self.table.clone();

        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(&format!("DELETE FROM {table} WHERE topic = ?1"))?;
                for t in topics {
                    stmt.execute(params![t])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn find_matching_messages(
        &self,
        filter: &str,
        visitor: MessageVisitor<'_>,
    ) -> Result<()> {
        let table = self.table.clone();
        let filter_owned = filter.to_string();
        let (where_sql, values) = Self::filter_predicate(filter);

        let candidates: Vec<BrokerMessage> = self
            .blocking(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT topic, payload, qos, retain, client_id, message_id, message_uuid, time
                     FROM {table} WHERE {where_sql}"
                ))?;
                let rows =
                    stmt.query_map(params_from_iter(values.iter()), Self::row_to_message)?;

                let mut out = Vec::new();
                for row in rows {
                    match row {
                        Ok(msg) => out.push(msg),
                        Err(e) => warn!(error = %e, "skipping unreadable retained row"),
                    }
                }
                Ok(out)
            })
            .await?;

        for msg in candidates {
            if !topic::matches(&filter_owned, &msg.topic) {
                continue;
            }
            if !visitor(msg) {
                break;
            }
        }
        Ok(())
    }

    async fn find_matching_topics(&self, pattern: &str, visitor: TopicVisitor<'_>) -> Result<()> {
        let table = self.table.clone();
        let topics: Vec<String> = self
            .blocking(move |conn| {
                let mut stmt = conn.prepare(&format!("SELECT topic FROM {table}"))?;
                let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await?;

        let pattern_levels = topic::levels(pattern);
        let multi = pattern_levels.last() == Some(&topic::WILDCARD_MULTI);
        let mut seen = HashSet::new();

        for name in topics {
            let emit = if multi {
                topic::matches(pattern, &name).then_some(name)
            } else {
                let name_levels = topic::levels(&name);
                if name_levels.len() < pattern_levels.len() {
                    None
                } else {
                    let prefix = &name_levels[..pattern_levels.len()];
                    topic::matches_levels(&pattern_levels, prefix).then(|| prefix.join("/"))
                }
            };

            if let Some(t) = emit {
                if seen.insert(t.clone()) && !visitor(t) {
                    break;
                }
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
        let table = self.table.clone();
        let glob = glob.to_string();
        let namespace = namespace.map(|s| s.to_string());

        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&format!("SELECT topic FROM {table} ORDER BY topic"))?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

            let mut out = Vec::new();
            for row in rows {
                let name = row?;
                if let Some(ns) = &namespace {
                    if name != *ns && !name.starts_with(&format!("{ns}/")) {
                        continue;
                    }
                }
                if glob_match(&glob, &name, ignore_case) {
                    out.push(name);
                }
            }
            Ok(out)
        })
        .await
    }

    async fn find_topics_by_config(
        &self,
        field: &str,
        value: &str,
        ignore_case: bool,
        namespace: Option<&str>,
    ) -> Result<Vec<String>> {
        let table = self.table.clone();
        let field = field.to_string();
        let value = value.to_string();
        let namespace = namespace.map(|s| s.to_string());

        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT topic, payload_json FROM {table}
                 WHERE payload_json IS NOT NULL ORDER BY topic"
            ))?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;

            let mut out = Vec::new();
            for row in rows {
                let (name, doc) = row?;
                if let Some(ns) = &namespace {
                    if name != *ns && !name.starts_with(&format!("{ns}/")) {
                        continue;
                    }
                }
                let Ok(doc) = serde_json::from_str::<serde_json::Value>(&doc) else {
                    warn!(topic = %name, "skipping retained row with unparseable document");
                    continue;
                };
                let matched = match doc.get(&field) {
                    Some(serde_json::Value::String(s)) => {
                        if ignore_case {
                            s.eq_ignore_ascii_case(&value)
                        } else {
                            s == &value
                        }
                    }
                    Some(other) => other.to_string() == value,
                    None => false,
                };
                if matched {
                    out.push(name);
                }
            }
            Ok(out)
        })
        .await
    }

    async fn purge_old_messages(&self, older_than: DateTime<Utc>) -> Result<PurgeResult> {
        let table = self.table.clone();
        let cutoff = older_than.timestamp_millis();
        let started = Instant::now();

        let deleted = self
            .blocking(move |conn| {
                let n = conn.execute(
                    &format!("DELETE FROM {table} WHERE time < ?1"),
                    params![cutoff],
                )?;
                Ok(n as u64)
            })
            .await?;

        Ok(PurgeResult {
            deleted,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }
}
