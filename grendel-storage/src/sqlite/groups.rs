//! Archive-group policies on SQLite.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use tracing::warn;

use grendel_core::topic;

use crate::types::{ArchiveGroup, PayloadFormat, StoreKind, DEFAULT_ARCHIVE_GROUP};
use crate::{ArchiveGroupStore, Result, StorageError};

use super::{millis_to_time, SqliteStore};

fn store_kind_to_str(kind: StoreKind) -> &'static str {
    match kind {
        StoreKind::None => "NONE",
        StoreKind::Memory => "MEMORY",
        StoreKind::Sqlite => "SQLITE",
    }
}

fn str_to_store_kind(value: &str) -> Option<StoreKind> {
    match value {
        "NONE" => Some(StoreKind::None),
        "MEMORY" => Some(StoreKind::Memory),
        "SQLITE" => Some(StoreKind::Sqlite),
        _ => None,
    }
}

fn format_to_str(format: PayloadFormat) -> &'static str {
    match format {
        PayloadFormat::Default => "DEFAULT",
        PayloadFormat::Json => "JSON",
    }
}

fn str_to_format(value: &str) -> Option<PayloadFormat> {
    match value {
        "DEFAULT" => Some(PayloadFormat::Default),
        "JSON" => Some(PayloadFormat::Json),
        _ => None,
    }
}

fn row_to_group(row: &rusqlite::Row<'_>) -> rusqlite::Result<Option<ArchiveGroup>> {
    let name: String = row.get("name")?;
    let filters: String = row.get("topic_filters")?;
    let last_val_type: String = row.get("last_val_type")?;
    let archive_type: String = row.get("archive_type")?;
    let payload_format: String = row.get("payload_format")?;
    let created_at: i64 = row.get("created_at")?;
    let updated_at: i64 = row.get("updated_at")?;

    let Ok(topic_filters) = serde_json::from_str::<Vec<String>>(&filters) else {
        warn!(group = %name, "skipping archive group with unparseable filter list");
        return Ok(None);
    };
    let (Some(last_val_type), Some(archive_type), Some(payload_format)) = (
        str_to_store_kind(&last_val_type),
        str_to_store_kind(&archive_type),
        str_to_format(&payload_format),
    ) else {
        warn!(group = %name, "skipping archive group with unknown store kind");
        return Ok(None);
    };

    Ok(Some(ArchiveGroup {
        name,
        enabled: row.get("enabled")?,
        topic_filters,
        retained_only: row.get("retained_only")?,
        last_val_type,
        archive_type,
        payload_format,
        last_val_retention: row.get("last_val_retention")?,
        archive_retention: row.get("archive_retention")?,
        purge_interval: row.get("purge_interval")?,
        created_at: millis_to_time(created_at).unwrap_or_else(Utc::now),
        updated_at: millis_to_time(updated_at).unwrap_or_else(Utc::now),
    }))
}

const GROUP_COLUMNS: &str = "name, enabled, topic_filters, retained_only, last_val_type, \
     archive_type, payload_format, last_val_retention, archive_retention, purge_interval, \
     created_at, updated_at";

#[async_trait]
impl ArchiveGroupStore for SqliteStore {
    async fn ensure_default_group(&self) -> Result<()> {
        let existing = self.get_group(DEFAULT_ARCHIVE_GROUP).await?;
        if existing.is_none() {
            self.upsert_group(ArchiveGroup::default_group()).await?;
        }
        Ok(())
    }

    async fn upsert_group(&self, mut group: ArchiveGroup) -> Result<()> {
        for filter in &group.topic_filters {
            topic::validate_filter(filter)
                .map_err(|e| StorageError::InvalidInput(e.to_string()))?;
        }
        group.archive_retention_millis()?;
        group.last_val_retention_millis()?;
        group.purge_interval_millis()?;

        group.updated_at = Utc::now();

        self.blocking(move |conn| {
            conn.execute(
                &format!(
                    "INSERT OR REPLACE INTO archive_groups ({GROUP_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ),
                params![
                    group.name,
                    group.enabled,
                    serde_json::to_string(&group.topic_filters)
                        .map_err(|e| StorageError::Serialization(e.to_string()))?,
                    group.retained_only,
                    store_kind_to_str(group.last_val_type),
                    store_kind_to_str(group.archive_type),
                    format_to_str(group.payload_format),
                    group.last_val_retention,
                    group.archive_retention,
                    group.purge_interval,
                    group.created_at.timestamp_millis(),
                    group.updated_at.timestamp_millis(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_group(&self, name: &str) -> Result<Option<ArchiveGroup>> {
        let name = name.to_string();
        self.blocking(move |conn| {
            let group = conn
                .query_row(
                    &format!("SELECT {GROUP_COLUMNS} FROM archive_groups WHERE name = ?1"),
                    params![name],
                    row_to_group,
                )
                .optional()?;
            Ok(group.flatten())
        })
        .await
    }

    async fn delete_group(&self, name: &str) -> Result<()> {
        if name == DEFAULT_ARCHIVE_GROUP {
            return Err(StorageError::InvalidInput(
                "the Default archive group cannot be deleted".to_string(),
            ));
        }
        let name = name.to_string();
        self.blocking(move |conn| {
            conn.execute("DELETE FROM archive_groups WHERE name = ?1", params![name])?;
            Ok(())
        })
        .await
    }

    async fn list_groups(&self) -> Result<Vec<ArchiveGroup>> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {GROUP_COLUMNS} FROM archive_groups ORDER BY name"
            ))?;
            let rows = stmt.query_map([], row_to_group)?;

            let mut groups = Vec::new();
            for row in rows {
                if let Some(group) = row? {
                    groups.push(group);
                }
            }
            Ok(groups)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::SqliteStore;

    #[tokio::test]
    async fn test_default_group_seeding_is_idempotent() {
        let store = SqliteStore::in_memory().unwrap();
        store.ensure_default_group().await.unwrap();
        store.ensure_default_group().await.unwrap();

        let groups = store.list_groups().await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].name, DEFAULT_ARCHIVE_GROUP);
        assert_eq!(groups[0].topic_filters, vec!["#"]);
    }

    #[tokio::test]
    async fn test_group_round_trip() {
        let store = SqliteStore::in_memory().unwrap();

        let mut group = ArchiveGroup::default_group();
        group.name = "sensors".to_string();
        group.topic_filters = vec!["sensors/#".to_string(), "plant/+/temp".to_string()];
        group.retained_only = true;
        group.archive_type = StoreKind::Sqlite;
        group.payload_format = PayloadFormat::Json;
        group.archive_retention = Some("7d".to_string());
        store.upsert_group(group).await.unwrap();

        let group = store.get_group("sensors").await.unwrap().unwrap();
        assert_eq!(group.topic_filters.len(), 2);
        assert!(group.retained_only);
        assert_eq!(group.archive_type, StoreKind::Sqlite);
        assert_eq!(group.payload_format, PayloadFormat::Json);
        assert_eq!(group.archive_retention_millis().unwrap(), Some(604_800_000));
    }

    #[tokio::test]
    async fn test_group_validation() {
        let store = SqliteStore::in_memory().unwrap();

        let mut group = ArchiveGroup::default_group();
        group.name = "bad".to_string();
        group.topic_filters = vec!["#/x".to_string()];
        assert!(store.upsert_group(group).await.is_err());

        let mut group = ArchiveGroup::default_group();
        group.name = "bad2".to_string();
        group.archive_retention = Some("yearly".to_string());
        assert!(store.upsert_group(group).await.is_err());
    }

    #[tokio::test]
    async fn test_default_group_protected() {
        let store = SqliteStore::in_memory().unwrap();
        store.ensure_default_group().await.unwrap();
        assert!(store.delete_group(DEFAULT_ARCHIVE_GROUP).await.is_err());

        let mut group = ArchiveGroup::default_group();
        group.name = "temp".to_string();
        store.upsert_group(group).await.unwrap();
        store.delete_group("temp").await.unwrap();
        assert!(store.get_group("temp").await.unwrap().is_none());
    }
}
