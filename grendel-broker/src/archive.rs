//! Archive-group runtime.
//!
//! Archive groups are declarative policies persisted in the group store;
//! this module turns them into live handles (a last-value store and an
//! append archive per group) and routes published messages into every
//! group whose filters match. Retention is enforced by a purge loop
//! driven by each group's `purge_interval`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use grendel_storage::types::ArchiveGroup;
use grendel_storage::{ArchiveGroupStore, MessageArchive, MessageStore};

use crate::broadcast::{Broadcast, BrokerEvent};
use crate::Result;

/// Live stores for one archive group. Either side may be absent when the
/// group's store kind is `None`.
pub struct GroupHandles {
    pub group: ArchiveGroup,
    pub last_value: Option<Arc<dyn MessageStore>>,
    pub archive: Option<Arc<dyn MessageArchive>>,
}

/// Creates backing stores for a group; implemented by the host over its
/// configured backends.
pub trait ArchiveStoreFactory: Send + Sync {
    fn last_value_store(&self, group: &ArchiveGroup) -> Result<Option<Arc<dyn MessageStore>>>;

    fn archive_store(&self, group: &ArchiveGroup) -> Result<Option<Arc<dyn MessageArchive>>>;
}

/// The set of live archive groups. Reloading swaps the whole list, so
/// routing always sees complete groups.
pub struct ArchiveRegistry {
    groups: RwLock<Vec<Arc<GroupHandles>>>,
}

impl Default for ArchiveRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveRegistry {
    pub fn new() -> Self {
        ArchiveRegistry {
            groups: RwLock::new(Vec::new()),
        }
    }

    /// Build handles for every enabled group in the store. Seeds the
    /// `Default` group if missing. A group whose stores cannot be opened
    /// is skipped with a warning rather than failing the reload.
    pub async fn load(
        &self,
        store: &dyn ArchiveGroupStore,
        factory: &dyn ArchiveStoreFactory,
    ) -> Result<()> {
        store.ensure_default_group().await?;

        let mut handles = Vec::new();
        for group in store.list_groups().await? {
            if !group.enabled {
                continue;
            }
            let last_value = match factory.last_value_store(&group) {
                Ok(store) => store,
                Err(e) => {
                    warn!(group = %group.name, error = %e, "skipping group: last-value store failed");
                    continue;
                }
            };
            let archive = match factory.archive_store(&group) {
                Ok(store) => store,
                Err(e) => {
                    warn!(group = %group.name, error = %e, "skipping group: archive store failed");
                    continue;
                }
            };
            if let Some(archive) = &archive {
                archive.create_table().await?;
            }
            debug!(group = %group.name, filters = ?group.topic_filters, "archive group loaded");
            handles.push(Arc::new(GroupHandles {
                group,
                last_value,
                archive,
            }));
        }

        let mut groups = self.groups.write().expect("archive registry lock poisoned");
        *groups = handles;
        Ok(())
    }

    /// Groups a publish to `topic` (with the given retain flag) routes
    /// into.
    pub fn route(&self, topic_name: &str, retain: bool) -> Vec<Arc<GroupHandles>> {
        let groups = self.groups.read().expect("archive registry lock poisoned");
        groups
            .iter()
            .filter(|h| h.group.matches(topic_name, retain))
            .cloned()
            .collect()
    }

    pub fn group_names(&self) -> Vec<String> {
        let groups = self.groups.read().expect("archive registry lock poisoned");
        groups.iter().map(|h| h.group.name.clone()).collect()
    }

    fn snapshot(&self) -> Vec<Arc<GroupHandles>> {
        self.groups
            .read()
            .expect("archive registry lock poisoned")
            .clone()
    }

    /// Run one retention pass: purge each group whose purge interval has
    /// elapsed since `last_runs[group]`.
    async fn purge_due(&self, now: DateTime<Utc>, last_runs: &mut HashMap<String, DateTime<Utc>>) {
        for handles in self.snapshot() {
            let group = &handles.group;
            let Ok(Some(interval_ms)) = group.purge_interval_millis() else {
                continue;
            };

            let due = last_runs
                .get(&group.name)
                .map(|last| (now - *last).num_milliseconds() as u64 >= interval_ms)
                .unwrap_or(true);
            if !due {
                continue;
            }
            last_runs.insert(group.name.clone(), now);

            if let (Some(archive), Ok(Some(retention_ms))) =
                (&handles.archive, group.archive_retention_millis())
            {
                let cutoff = now - chrono::Duration::milliseconds(retention_ms as i64);
                match archive.purge_old_messages(cutoff).await {
                    Ok(result) if result.deleted > 0 => {
                        info!(
                            group = %group.name,
                            deleted = result.deleted,
                            elapsed_ms = result.elapsed_ms,
                            "archive purge"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => warn!(group = %group.name, error = %e, "archive purge failed"),
                }
            }

            if let (Some(last_value), Ok(Some(retention_ms))) =
                (&handles.last_value, group.last_val_retention_millis())
            {
                let cutoff = now - chrono::Duration::milliseconds(retention_ms as i64);
                match last_value.purge_old_messages(cutoff).await {
                    Ok(result) if result.deleted > 0 => {
                        info!(
                            group = %group.name,
                            deleted = result.deleted,
                            "last-value purge"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => warn!(group = %group.name, error = %e, "last-value purge failed"),
                }
            }
        }
    }

    /// Retention loop, checked once a minute against each group's own
    /// purge interval.
    pub fn spawn_purge_task(self: Arc<Self>, bus: Broadcast) {
        tokio::spawn(async move {
            let mut events = bus.subscribe();
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            let mut last_runs: HashMap<String, DateTime<Utc>> = HashMap::new();
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.purge_due(Utc::now(), &mut last_runs).await;
                    }
                    event = events.recv() => {
                        if matches!(event, Ok(BrokerEvent::Shutdown) | Err(_)) {
                            debug!("archive purge task stopped");
                            return;
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;
    use grendel_storage::memory::{MemoryMessageArchive, MemoryMessageStore};
    use grendel_storage::types::StoreKind;

    /// Factory handing out fresh in-memory stores, shared by the broker
    /// crate's tests.
    pub(crate) struct MemoryFactory;

    impl ArchiveStoreFactory for MemoryFactory {
        fn last_value_store(
            &self,
            group: &ArchiveGroup,
        ) -> Result<Option<Arc<dyn MessageStore>>> {
            Ok(match group.last_val_type {
                StoreKind::None => None,
                _ => Some(Arc::new(MemoryMessageStore::new())),
            })
        }

        fn archive_store(&self, group: &ArchiveGroup) -> Result<Option<Arc<dyn MessageArchive>>> {
            Ok(match group.archive_type {
                StoreKind::None => None,
                _ => Some(Arc::new(MemoryMessageArchive::new(group.payload_format))),
            })
        }
    }
}
