//! SQLite storage backend.
//!
//! A single connection owned by the store and protected by a mutex;
//! blocking calls hop through `tokio::task::spawn_blocking`. Schema setup
//! runs as an ordered, idempotent migration list. Retained stores and
//! message archives are handed out per table and share the connection.

mod archive;
mod devices;
mod groups;
mod metrics;
mod retained;
mod session;
mod users;

pub use archive::SqliteMessageArchive;
pub use retained::SqliteMessageStore;

use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::{info, warn};

use grendel_core::QoS;

use crate::types::PayloadFormat;
use crate::{Result, StorageError};

struct Migration {
    version: i64,
    ddl: &'static str,
}

/// Forward-only, additive schema migrations for the singleton tables.
/// Applied in order inside a transaction each; recorded in
/// `schema_migrations`.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        ddl: "
            CREATE TABLE IF NOT EXISTS sessions (
                client_id TEXT PRIMARY KEY,
                node_id TEXT NOT NULL,
                clean_session INTEGER NOT NULL,
                connected INTEGER NOT NULL,
                last_update INTEGER NOT NULL,
                info TEXT NOT NULL,
                will_topic TEXT,
                will_payload BLOB,
                will_qos INTEGER,
                will_retain INTEGER
            );

            CREATE TABLE IF NOT EXISTS subscriptions (
                client_id TEXT NOT NULL,
                filter TEXT NOT NULL,
                qos INTEGER NOT NULL,
                wildcard INTEGER NOT NULL,
                PRIMARY KEY (client_id, filter)
            );

            CREATE TABLE IF NOT EXISTS queued_messages (
                message_uuid TEXT PRIMARY KEY,
                message_id INTEGER NOT NULL,
                topic TEXT NOT NULL,
                payload BLOB NOT NULL,
                qos INTEGER NOT NULL,
                retain INTEGER NOT NULL,
                client_id TEXT NOT NULL,
                time INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS queued_recipients (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                client_id TEXT NOT NULL,
                message_uuid TEXT NOT NULL,
                UNIQUE (client_id, message_uuid)
            );

            CREATE INDEX IF NOT EXISTS idx_queued_recipients_client
                ON queued_recipients(client_id, seq);
        ",
    },
    Migration {
        version: 2,
        ddl: "
            CREATE TABLE IF NOT EXISTS users (
                username TEXT PRIMARY KEY,
                password_hash TEXT NOT NULL,
                enabled INTEGER NOT NULL,
                can_subscribe INTEGER NOT NULL,
                can_publish INTEGER NOT NULL,
                is_admin INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS acl_rules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL,
                topic_pattern TEXT NOT NULL,
                can_subscribe INTEGER NOT NULL,
                can_publish INTEGER NOT NULL,
                priority INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_acl_rules_username
                ON acl_rules(username);
        ",
    },
    Migration {
        version: 3,
        ddl: "
            CREATE TABLE IF NOT EXISTS archive_groups (
                name TEXT PRIMARY KEY,
                enabled INTEGER NOT NULL,
                topic_filters TEXT NOT NULL,
                retained_only INTEGER NOT NULL,
                last_val_type TEXT NOT NULL,
                archive_type TEXT NOT NULL,
                payload_format TEXT NOT NULL,
                last_val_retention TEXT,
                archive_retention TEXT,
                purge_interval TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
        ",
    },
    Migration {
        version: 4,
        ddl: "
            CREATE TABLE IF NOT EXISTS metrics (
                timestamp INTEGER NOT NULL,
                metric_type TEXT NOT NULL,
                identifier TEXT NOT NULL,
                metrics TEXT NOT NULL,
                PRIMARY KEY (timestamp, metric_type, identifier)
            );

            CREATE INDEX IF NOT EXISTS idx_metrics_lookup
                ON metrics(metric_type, identifier, timestamp);
        ",
    },
    Migration {
        version: 5,
        ddl: "
            CREATE TABLE IF NOT EXISTS device_configs (
                name TEXT PRIMARY KEY,
                namespace TEXT NOT NULL,
                node_id TEXT NOT NULL,
                enabled INTEGER NOT NULL,
                config TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_device_configs_node
                ON device_configs(node_id);
            CREATE INDEX IF NOT EXISTS idx_device_configs_namespace
                ON device_configs(namespace);
            CREATE INDEX IF NOT EXISTS idx_device_configs_enabled
                ON device_configs(enabled);
        ",
    },
];

/// SQLite backend for the singleton broker stores. Retained stores and
/// archives are obtained with [`SqliteStore::retained_store`] and
/// [`SqliteStore::archive`] and share the connection.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply migrations.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(&path)?;
        let store = SqliteStore {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.as_ref().to_path_buf()),
        };
        store.migrate()?;
        Ok(store)
    }

    /// In-memory database, useful for tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = SqliteStore {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        };
        store.migrate()?;
        Ok(store)
    }

    /// Retained-message store backed by the given table.
    pub fn retained_store(&self, table: &str) -> Result<SqliteMessageStore> {
        SqliteMessageStore::new(Arc::clone(&self.conn), table)
    }

    /// Message archive backed by the given table.
    pub fn archive(&self, table: &str, format: PayloadFormat) -> Result<SqliteMessageArchive> {
        SqliteMessageArchive::new(Arc::clone(&self.conn), table, format)
    }

    fn migrate(&self) -> Result<()> {
        let mut conn = self.conn.lock().map_err(|e| StorageError::Permanent(e.to_string()))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL
            );",
        )?;

        let current: i64 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )?;

        for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
            let tx = conn.transaction()?;
            tx.execute_batch(migration.ddl)?;
            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![migration.version, Utc::now().timestamp_millis()],
            )?;
            tx.commit()?;
            info!(version = migration.version, "applied schema migration");
        }

        Ok(())
    }

    /// Liveness probe; reopens a file-backed connection that stopped
    /// answering. In-memory databases are never reopened (their data
    /// would be lost).
    pub async fn health_check(&self) -> Result<()> {
        let probe = self
            .blocking(|conn| {
                conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
                Ok(())
            })
            .await;

        match probe {
            Ok(()) => Ok(()),
            Err(e) => {
                let Some(path) = self.path.clone() else {
                    return Err(e);
                };
                warn!(error = %e, "sqlite health check failed, reopening");
                let fresh = Connection::open(&path)?;
                let mut guard = self
                    .conn
                    .lock()
                    .map_err(|e| StorageError::Permanent(e.to_string()))?;
                *guard = fresh;
                Ok(())
            }
        }
    }

    /// Run a blocking database operation on the worker pool. The
    /// connection is serialized by the mutex; awaiting callers suspend.
    pub(crate) async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        blocking_on(Arc::clone(&self.conn), f).await
    }
}

/// Shared spawn-blocking helper used by all sqlite store types.
pub(crate) async fn blocking_on<F, T>(conn: Arc<Mutex<Connection>>, f: F) -> Result<T>
where
    F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut conn = conn
            .lock()
            .map_err(|e| StorageError::Permanent(e.to_string()))?;
        f(&mut conn)
    })
    .await
    .map_err(|e| StorageError::Transient(e.to_string()))?
}

/// Table names are interpolated into DDL; restrict them hard.
pub(crate) fn validate_table_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidInput(format!(
            "invalid table name `{name}`"
        )))
    }
}

pub(crate) fn qos_to_int(qos: QoS) -> i64 {
    i64::from(qos.as_u8())
}

pub(crate) fn int_to_qos(value: i64) -> QoS {
    u8::try_from(value)
        .ok()
        .and_then(|v| QoS::try_from(v).ok())
        .unwrap_or(QoS::AtMostOnce)
}

pub(crate) fn millis_to_time(millis: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_name_validation() {
        assert!(validate_table_name("retained_messages").is_ok());
        assert!(validate_table_name("archive_default").is_ok());
        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("1bad").is_err());
        assert!(validate_table_name("drop table;--").is_err());
        assert!(validate_table_name("a-b").is_err());
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let store = SqliteStore::in_memory().unwrap();
        // Re-running against an already-migrated schema is a no-op.
        store.migrate().unwrap();

        let version: i64 = store
            .blocking(|conn| {
                Ok(conn.query_row(
                    "SELECT MAX(version) FROM schema_migrations",
                    [],
                    |row| row.get(0),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(version, MIGRATIONS.last().unwrap().version);
    }

    #[tokio::test]
    async fn test_health_check_in_memory() {
        let store = SqliteStore::in_memory().unwrap();
        store.health_check().await.unwrap();
    }
}
