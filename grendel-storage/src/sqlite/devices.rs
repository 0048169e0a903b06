//! Device-configuration registry on SQLite.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use tracing::warn;

use crate::types::DeviceConfig;
use crate::{DeviceConfigStore, Result};

use super::{millis_to_time, SqliteStore};

fn row_to_device(row: &rusqlite::Row<'_>) -> rusqlite::Result<Option<DeviceConfig>> {
    let name: String = row.get("name")?;
    let config: String = row.get("config")?;
    let created_at: i64 = row.get("created_at")?;
    let updated_at: i64 = row.get("updated_at")?;

    let Ok(config) = serde_json::from_str(&config) else {
        warn!(device = %name, "skipping device with unparseable config document");
        return Ok(None);
    };

    Ok(Some(DeviceConfig {
        name,
        namespace: row.get("namespace")?,
        node_id: row.get("node_id")?,
        enabled: row.get("enabled")?,
        config,
        created_at: millis_to_time(created_at).unwrap_or_else(Utc::now),
        updated_at: millis_to_time(updated_at).unwrap_or_else(Utc::now),
    }))
}

const DEVICE_COLUMNS: &str = "name, namespace, node_id, enabled, config, created_at, updated_at";

#[async_trait]
impl DeviceConfigStore for SqliteStore {
    async fn upsert_device(&self, mut device: DeviceConfig) -> Result<()> {
        device.validate()?;
        device.updated_at = Utc::now();

        self.blocking(move |conn| {
            conn.execute(
                &format!(
                    "INSERT OR REPLACE INTO device_configs ({DEVICE_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
                ),
                params![
                    device.name,
                    device.namespace,
                    device.node_id,
                    device.enabled,
                    device.config.to_string(),
                    device.created_at.timestamp_millis(),
                    device.updated_at.timestamp_millis(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_device(&self, name: &str) -> Result<Option<DeviceConfig>> {
        let name = name.to_string();
        self.blocking(move |conn| {
            let device = conn
                .query_row(
                    &format!("SELECT {DEVICE_COLUMNS} FROM device_configs WHERE name = ?1"),
                    params![name],
                    row_to_device,
                )
                .optional()?;
            Ok(device.flatten())
        })
        .await
    }

    async fn delete_device(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.blocking(move |conn| {
            conn.execute("DELETE FROM device_configs WHERE name = ?1", params![name])?;
            Ok(())
        })
        .await
    }

    async fn list_devices(
        &self,
        namespace: Option<&str>,
        node_id: Option<&str>,
    ) -> Result<Vec<DeviceConfig>> {
        let namespace = namespace.map(|s| s.to_string());
        let node_id = node_id.map(|s| s.to_string());

        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {DEVICE_COLUMNS} FROM device_configs
                 WHERE (?1 IS NULL OR namespace = ?1)
                   AND (?2 IS NULL OR node_id = ?2)
                 ORDER BY name"
            ))?;
            let rows = stmt.query_map(params![namespace, node_id], row_to_device)?;

            let mut devices = Vec::new();
            for row in rows {
                if let Some(device) = row? {
                    devices.push(device);
                }
            }
            Ok(devices)
        })
        .await
    }
}
