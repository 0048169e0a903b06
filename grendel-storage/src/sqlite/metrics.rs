//! Metrics time-series on SQLite.
//!
//! One logical table keyed `(timestamp, metric_type, identifier)` with the
//! counter document stored as JSON; the composite index
//! `(metric_type, identifier, timestamp)` serves the window queries.

use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use tracing::warn;

use crate::types::{MetricKind, MetricsSample, PurgeResult, TimeWindow};
use crate::{MetricsStore, Result};

use super::{millis_to_time, SqliteStore};

#[async_trait]
impl MetricsStore for SqliteStore {
    async fn upsert_sample(&self, sample: MetricsSample) -> Result<()> {
        let payload = sample.payload.to_string();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO metrics (timestamp, metric_type, identifier, metrics)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(timestamp, metric_type, identifier)
                     DO UPDATE SET metrics = excluded.metrics",
                params![
                    sample.timestamp.timestamp_millis(),
                    sample.kind.as_str(),
                    sample.identifier,
                    payload
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn latest_sample(
        &self,
        kind: MetricKind,
        identifier: &str,
        window: TimeWindow,
    ) -> Result<Option<MetricsSample>> {
        let identifier = identifier.to_string();
        self.blocking(move |conn| {
            let row = conn
                .query_row(
                    "SELECT timestamp, identifier, metrics FROM metrics
                     WHERE metric_type = ?1 AND identifier = ?2
                       AND timestamp >= ?3 AND timestamp <= ?4
                     ORDER BY timestamp DESC LIMIT 1",
                    params![
                        kind.as_str(),
                        identifier,
                        window.start.timestamp_millis(),
                        window.end.timestamp_millis()
                    ],
                    |row| {
                        let ts: i64 = row.get(0)?;
                        let identifier: String = row.get(1)?;
                        let metrics: String = row.get(2)?;
                        Ok((ts, identifier, metrics))
                    },
                )
                .optional()?;

            Ok(row.and_then(|(ts, identifier, metrics)| {
                let payload = match serde_json::from_str(&metrics) {
                    Ok(doc) => doc,
                    Err(e) => {
                        warn!(error = %e, identifier, "skipping metrics row with bad document");
                        return None;
                    }
                };
                Some(MetricsSample {
                    timestamp: millis_to_time(ts)?,
                    kind,
                    identifier,
                    payload,
                })
            }))
        })
        .await
    }

    async fn sample_history(
        &self,
        kind: MetricKind,
        identifier: &str,
        window: TimeWindow,
        limit: usize,
    ) -> Result<Vec<MetricsSample>> {
        let identifier = identifier.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT timestamp, identifier, metrics FROM metrics
                 WHERE metric_type = ?1 AND identifier = ?2
                   AND timestamp >= ?3 AND timestamp <= ?4
                 ORDER BY timestamp DESC LIMIT ?5",
            )?;
            let rows = stmt.query_map(
                params![
                    kind.as_str(),
                    identifier,
                    window.start.timestamp_millis(),
                    window.end.timestamp_millis(),
                    limit as i64
                ],
                |row| {
                    let ts: i64 = row.get(0)?;
                    let identifier: String = row.get(1)?;
                    let metrics: String = row.get(2)?;
                    Ok((ts, identifier, metrics))
                },
            )?;

            let mut samples = Vec::new();
            for row in rows {
                let (ts, identifier, metrics) = row?;
                let Some(timestamp) = millis_to_time(ts) else {
                    warn!(identifier, "skipping metrics row with invalid timestamp");
                    continue;
                };
                let payload = match serde_json::from_str(&metrics) {
                    Ok(doc) => doc,
                    Err(e) => {
                        warn!(error = %e, identifier, "skipping metrics row with bad document");
                        continue;
                    }
                };
                samples.push(MetricsSample {
                    timestamp,
                    kind,
                    identifier,
                    payload,
                });
            }
            Ok(samples)
        })
        .await
    }

    async fn purge_old_samples(&self, older_than: DateTime<Utc>) -> Result<PurgeResult> {
        let cutoff = older_than.timestamp_millis();
        let started = Instant::now();

        let deleted = self
            .blocking(move |conn| {
                let n = conn.execute("DELETE FROM metrics WHERE timestamp < ?1", params![cutoff])?;
                Ok(n as u64)
            })
            .await?;

        Ok(PurgeResult {
            deleted,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }
}
