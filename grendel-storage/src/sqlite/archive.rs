//! Message archive on SQLite.
//!
//! One table per archive group, primary key `(topic, time)`. Appends use
//! `INSERT OR IGNORE` so replayed batches are idempotent. A trailing `#`
//! filter becomes a `LIKE` prefix scan; everything fetched is re-checked
//! structurally.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tracing::warn;
use uuid::Uuid;

use grendel_core::{topic, BrokerMessage};

use crate::aggregate::{self, SampleRow};
use crate::types::{
    AggFunc, AggregatedHistory, ArchivePayload, ArchivedMessage, PayloadFormat, PurgeResult,
};
use crate::{MessageArchive, Result};

use super::{blocking_on, int_to_qos, millis_to_time, qos_to_int, validate_table_name};

/// Message archive backed by one SQLite table.
#[derive(Clone)]
pub struct SqliteMessageArchive {
    conn: Arc<Mutex<Connection>>,
    table: String,
    format: PayloadFormat,
}

impl SqliteMessageArchive {
    pub(crate) fn new(
        conn: Arc<Mutex<Connection>>,
        table: &str,
        format: PayloadFormat,
    ) -> Result<Self> {
        validate_table_name(table)?;
        Ok(SqliteMessageArchive {
            conn,
            table: table.to_string(),
            format,
        })
    }

    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        blocking_on(Arc::clone(&self.conn), f).await
    }
}

#[async_trait]
impl MessageArchive for SqliteMessageArchive {
    async fn add_history(&self, messages: Vec<BrokerMessage>) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        self.create_table().await?;

        let table = self.table.clone();
        let format = self.format;

        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(&format!(
                    "INSERT OR IGNORE INTO {table}
                         (topic, time, payload, payload_json, qos, retain, client_id, message_uuid)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                ))?;

                for msg in messages {
                    let payload_json = match format {
                        PayloadFormat::Json => msg.payload_json().map(|v| v.to_string()),
                        PayloadFormat::Default => None,
                    };
                    stmt.execute(params![
                        msg.topic,
                        msg.time.timestamp_millis(),
                        msg.payload.as_ref(),
                        payload_json,
                        qos_to_int(msg.qos),
                        msg.retain,
                        msg.client_id,
                        msg.message_uuid.to_string(),
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_history(
        &self,
        topic_or_filter: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<ArchivedMessage>> {
        if !self.table_exists().await? {
            return Ok(Vec::new());
        }

        let table = self.table.clone();
        let filter = topic_or_filter.to_string();
        let wildcard = topic::is_wildcard(&filter);

        let rows: Vec<ArchivedMessage> = self
            .blocking(move |conn| {
                let mut clauses = Vec::new();
                let mut values: Vec<String> = Vec::new();

                if !wildcard {
                    clauses.push("topic = ?".to_string());
                    values.push(filter.clone());
                } else if let Some(prefix) = filter.strip_suffix("/#") {
                    if !prefix.contains('+') {
                        // Prefix scan; the structural check below still decides.
                        clauses.push("(topic = ? OR topic LIKE ? ESCAPE '\\')".to_string());
                        values.push(prefix.to_string());
                        values.push(format!("{}/%", like_escape(prefix)));
                    }
                }
                if let Some(s) = start {
                    clauses.push("time >= ?".to_string());
                    values.push(s.timestamp_millis().to_string());
                }
                if let Some(e) = end {
                    clauses.push("time <= ?".to_string());
                    values.push(e.timestamp_millis().to_string());
                }

                let where_sql = if clauses.is_empty() {
                    "1 = 1".to_string()
                } else {
                    clauses.join(" AND ")
                };

                let mut stmt = conn.prepare(&format!(
                    "SELECT topic, time, payload, payload_json, qos, retain, client_id, message_uuid
                     FROM {table} WHERE {where_sql}
                     ORDER BY time DESC"
                ))?;

                let rows = stmt.query_map(params_from_iter(values.iter()), |row| {
                    let topic_name: String = row.get(0)?;
                    let time: i64 = row.get(1)?;
                    let payload: Vec<u8> = row.get(2)?;
                    let payload_json: Option<String> = row.get(3)?;
                    let qos: i64 = row.get(4)?;
                    let retain: bool = row.get(5)?;
                    let client_id: String = row.get(6)?;
                    let message_uuid: String = row.get(7)?;
                    Ok((
                        topic_name,
                        time,
                        payload,
                        payload_json,
                        qos,
                        retain,
                        client_id,
                        message_uuid,
                    ))
                })?;

                let mut out = Vec::new();
                for row in rows {
                    let (topic_name, time, payload, payload_json, qos, retain, client_id, uuid) =
                        match row {
                            Ok(r) => r,
                            Err(e) => {
                                warn!(error = %e, "skipping unreadable archive row");
                                continue;
                            }
                        };

                    if wildcard && !topic::matches(&filter, &topic_name) {
                        continue;
                    }

                    let payload = match payload_json
                        .as_deref()
                        .and_then(|s| serde_json::from_str(s).ok())
                    {
                        Some(doc) => ArchivePayload::Json(doc),
                        None => ArchivePayload::Raw(Bytes::from(payload)),
                    };

                    out.push(ArchivedMessage {
                        topic: topic_name,
                        time: millis_to_time(time).unwrap_or_else(Utc::now),
                        payload,
                        qos: int_to_qos(qos),
                        retain,
                        client_id,
                        message_uuid: Uuid::parse_str(&uuid).unwrap_or_default(),
                    });

                    if out.len() >= limit {
                        break;
                    }
                }
                Ok(out)
            })
            .await?;

        Ok(rows)
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
        if topics.is_empty() || !self.table_exists().await? {
            return Ok(AggregatedHistory::default());
        }

        let table = self.table.clone();
        let topics_param = topics.clone();
        let start_ms = start.timestamp_millis();
        let end_ms = end.timestamp_millis();

        let rows: Vec<SampleRow> = self
            .blocking(move |conn| {
                let marks: String = (0..topics_param.len())
                    .map(|i| {
                        if i == 0 {
                            "?".to_string()
                        } else {
                            ", ?".to_string()
                        }
                    })
                    .collect();

                let mut stmt = conn.prepare(&format!(
                    "SELECT topic, time, payload, payload_json FROM {table}
                     WHERE time >= {start_ms} AND time <= {end_ms}
                       AND topic IN ({marks})
                     ORDER BY time"
                ))?;

                let rows = stmt.query_map(params_from_iter(topics_param.iter()), |row| {
                    let topic_name: String = row.get(0)?;
                    let time: i64 = row.get(1)?;
                    let payload: Vec<u8> = row.get(2)?;
                    let payload_json: Option<String> = row.get(3)?;
                    Ok((topic_name, time, payload, payload_json))
                })?;

                let mut out = Vec::new();
                for row in rows {
                    let (topic_name, time, payload, payload_json) = row?;
                    let Some(time) = millis_to_time(time) else {
                        warn!(topic = %topic_name, "skipping archive row with invalid time");
                        continue;
                    };
                    out.push(SampleRow {
                        topic: topic_name,
                        time,
                        payload: Bytes::from(payload),
                        payload_json: payload_json
                            .as_deref()
                            .and_then(|s| serde_json::from_str(s).ok()),
                    });
                }
                Ok(out)
            })
            .await?;

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
        if !self.table_exists().await? {
            return Ok(PurgeResult::default());
        }

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

    async fn drop_storage(&self) -> Result<()> {
        let table = self.table.clone();
        self.blocking(move |conn| {
            conn.execute_batch(&format!("DROP TABLE IF EXISTS {table}"))?;
            Ok(())
        })
        .await
    }

    async fn table_exists(&self) -> Result<bool> {
        let table = self.table.clone();
        self.blocking(move |conn| {
            let found: Option<String> = conn
                .query_row(
                    "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    params![table],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    async fn create_table(&self) -> Result<()> {
        let table = self.table.clone();
        self.blocking(move |conn| {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    topic TEXT NOT NULL,
                    time INTEGER NOT NULL,
                    payload BLOB NOT NULL,
                    payload_json TEXT,
                    qos INTEGER NOT NULL,
                    retain INTEGER NOT NULL,
                    client_id TEXT NOT NULL,
                    message_uuid TEXT NOT NULL,
                    PRIMARY KEY (topic, time)
                );
                CREATE INDEX IF NOT EXISTS idx_{table}_time ON {table}(time);"
            ))?;
            Ok(())
        })
        .await
    }
}

fn like_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}
