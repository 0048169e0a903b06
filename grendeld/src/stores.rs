//! Storage backend wiring.
//!
//! Resolves the configured backend into the concrete store handles the
//! broker core runs on, and provides the archive-store factory that turns
//! archive-group policies into live tables.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use grendel_broker::archive::ArchiveStoreFactory;
use grendel_storage::memory::{MemoryMessageArchive, MemoryMessageStore, MemoryStore};
use grendel_storage::sqlite::SqliteStore;
use grendel_storage::types::{ArchiveGroup, StoreKind};
use grendel_storage::{
    ArchiveGroupStore, DeviceConfigStore, MessageArchive, MessageStore, MetricsStore,
    SessionStore, StorageError, UserStore,
};

use crate::config::StorageConfig;

/// The singleton stores plus the retained store and archive factory.
pub struct Stores {
    pub sessions: Arc<dyn SessionStore>,
    pub users: Arc<dyn UserStore>,
    pub groups: Arc<dyn ArchiveGroupStore>,
    pub metrics: Arc<dyn MetricsStore>,
    pub devices: Arc<dyn DeviceConfigStore>,
    pub retained: Arc<dyn MessageStore>,
    pub factory: Arc<dyn ArchiveStoreFactory>,
    /// Present for backends with a connection to watch.
    pub sqlite: Option<SqliteStore>,
}

pub fn build(config: &StorageConfig) -> Result<Stores, StorageError> {
    match config.backend.as_str() {
        "memory" => {
            let store = Arc::new(MemoryStore::new());
            Ok(Stores {
                sessions: store.clone(),
                users: store.clone(),
                groups: store.clone(),
                metrics: store.clone(),
                devices: store,
                retained: Arc::new(MemoryMessageStore::new()),
                factory: Arc::new(MemoryArchiveFactory::default()),
                sqlite: None,
            })
        }
        "sqlite" => {
            let store = SqliteStore::open(&config.path)?;
            let shared = Arc::new(store.clone());
            Ok(Stores {
                sessions: shared.clone(),
                users: shared.clone(),
                groups: shared.clone(),
                metrics: shared.clone(),
                devices: shared,
                retained: Arc::new(store.retained_store("retained_messages")?),
                factory: Arc::new(SqliteArchiveFactory {
                    store: store.clone(),
                    memory: MemoryArchiveFactory::default(),
                }),
                sqlite: Some(store),
            })
        }
        other => Err(StorageError::InvalidInput(format!(
            "unknown storage backend `{other}`"
        ))),
    }
}

/// Hands out per-group in-memory stores, cached by group name so a
/// registry reload keeps the data.
#[derive(Default)]
pub struct MemoryArchiveFactory {
    last_values: Mutex<HashMap<String, Arc<MemoryMessageStore>>>,
    archives: Mutex<HashMap<String, Arc<MemoryMessageArchive>>>,
}

impl ArchiveStoreFactory for MemoryArchiveFactory {
    fn last_value_store(
        &self,
        group: &ArchiveGroup,
    ) -> grendel_broker::Result<Option<Arc<dyn MessageStore>>> {
        if group.last_val_type == StoreKind::None {
            return Ok(None);
        }
        let mut cache = self.last_values.lock().expect("factory lock poisoned");
        let store = cache
            .entry(group.name.clone())
            .or_insert_with(|| Arc::new(MemoryMessageStore::new()));
        Ok(Some(Arc::clone(store) as Arc<dyn MessageStore>))
    }

    fn archive_store(
        &self,
        group: &ArchiveGroup,
    ) -> grendel_broker::Result<Option<Arc<dyn MessageArchive>>> {
        if group.archive_type == StoreKind::None {
            return Ok(None);
        }
        let mut cache = self.archives.lock().expect("factory lock poisoned");
        let store = cache
            .entry(group.name.clone())
            .or_insert_with(|| Arc::new(MemoryMessageArchive::new(group.payload_format)));
        Ok(Some(Arc::clone(store) as Arc<dyn MessageArchive>))
    }
}

/// Sqlite-backed factory: one table pair per group, named after it.
/// Groups configured with `MEMORY` store kinds still get in-memory
/// stores.
pub struct SqliteArchiveFactory {
    store: SqliteStore,
    memory: MemoryArchiveFactory,
}

fn table_suffix(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

impl ArchiveStoreFactory for SqliteArchiveFactory {
    fn last_value_store(
        &self,
        group: &ArchiveGroup,
    ) -> grendel_broker::Result<Option<Arc<dyn MessageStore>>> {
        match group.last_val_type {
            StoreKind::None => Ok(None),
            StoreKind::Memory => self.memory.last_value_store(group),
            StoreKind::Sqlite => {
                let table = format!("lastval_{}", table_suffix(&group.name));
                let store = self.store.retained_store(&table)?;
                Ok(Some(Arc::new(store) as Arc<dyn MessageStore>))
            }
        }
    }

    fn archive_store(
        &self,
        group: &ArchiveGroup,
    ) -> grendel_broker::Result<Option<Arc<dyn MessageArchive>>> {
        match group.archive_type {
            StoreKind::None => Ok(None),
            StoreKind::Memory => self.memory.archive_store(group),
            StoreKind::Sqlite => {
                let table = format!("archive_{}", table_suffix(&group.name));
                let archive = self.store.archive(&table, group.payload_format)?;
                Ok(Some(Arc::new(archive) as Arc<dyn MessageArchive>))
            }
        }
    }
}
