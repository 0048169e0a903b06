//! Session rows, subscriptions, and offline queues on SQLite.
//!
//! Queued messages are stored once in `queued_messages`; delivery fan-out
//! lives in `queued_recipients`, whose `seq` column preserves enqueue
//! order per client. A physical message row survives for as long as any
//! recipient mapping references it. `del_client` removes subscriptions,
//! queue state, and the session row in one transaction.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;
use uuid::Uuid;

use grendel_core::{BrokerMessage, QoS};

use crate::traits::{
    ClientVisitor, MessageVisitor, SessionVisitor, SubscriptionVisitor,
};
use crate::types::{SessionRecord, Subscription};
use crate::{Result, SessionStore, StorageError};

use super::{int_to_qos, millis_to_time, qos_to_int, SqliteStore};

fn delete_orphan_messages(conn: &Connection) -> rusqlite::Result<usize> {
    conn.execute(
        "DELETE FROM queued_messages
         WHERE message_uuid NOT IN (SELECT message_uuid FROM queued_recipients)",
        [],
    )
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRecord> {
    let client_id: String = row.get("client_id")?;
    let node_id: String = row.get("node_id")?;
    let clean_session: bool = row.get("clean_session")?;
    let connected: bool = row.get("connected")?;
    let last_update: i64 = row.get("last_update")?;
    let info: String = row.get("info")?;
    let will_topic: Option<String> = row.get("will_topic")?;
    let will_payload: Option<Vec<u8>> = row.get("will_payload")?;
    let will_qos: Option<i64> = row.get("will_qos")?;
    let will_retain: Option<bool> = row.get("will_retain")?;

    let last_update = millis_to_time(last_update).unwrap_or_else(Utc::now);

    let last_will = will_topic.map(|topic| BrokerMessage {
        message_uuid: Uuid::new_v4(),
        message_id: 0,
        topic,
        payload: Bytes::from(will_payload.unwrap_or_default()),
        qos: will_qos.map(int_to_qos).unwrap_or(QoS::AtMostOnce),
        retain: will_retain.unwrap_or(false),
        queued: false,
        dup: false,
        client_id: client_id.clone(),
        time: last_update,
    });

    Ok(SessionRecord {
        client_id,
        node_id,
        clean_session,
        connected,
        last_update,
        info: serde_json::from_str(&info).unwrap_or(serde_json::Value::Null),
        last_will,
    })
}

fn row_to_queued_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<BrokerMessage> {
    let message_uuid: String = row.get("message_uuid")?;
    let message_id: i64 = row.get("message_id")?;
    let topic: String = row.get("topic")?;
    let payload: Vec<u8> = row.get("payload")?;
    let qos: i64 = row.get("qos")?;
    let retain: bool = row.get("retain")?;
    let client_id: String = row.get("client_id")?;
    let time: i64 = row.get("time")?;

    Ok(BrokerMessage {
        message_uuid: Uuid::parse_str(&message_uuid).unwrap_or_default(),
        message_id: message_id as u16,
        topic,
        payload: Bytes::from(payload),
        qos: int_to_qos(qos),
        retain,
        queued: true,
        dup: false,
        client_id,
        time: millis_to_time(time).unwrap_or_else(Utc::now),
    })
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn set_client(
        &self,
        client_id: &str,
        node_id: &str,
        clean_session: bool,
        connected: bool,
        info: serde_json::Value,
    ) -> Result<()> {
        let client_id = client_id.to_string();
        let node_id = node_id.to_string();
        let info = info.to_string();

        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO sessions
                     (client_id, node_id, clean_session, connected, last_update, info)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(client_id) DO UPDATE SET
                     node_id = excluded.node_id,
                     clean_session = excluded.clean_session,
                     connected = excluded.connected,
                     last_update = excluded.last_update,
                     info = excluded.info",
                params![
                    client_id,
                    node_id,
                    clean_session,
                    connected,
                    Utc::now().timestamp_millis(),
                    info
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn set_connected(&self, client_id: &str, connected: bool) -> Result<()> {
        let client_id = client_id.to_string();

        self.blocking(move |conn| {
            let updated = conn.execute(
                "UPDATE sessions SET connected = ?2, last_update = ?3 WHERE client_id = ?1",
                params![client_id, connected, Utc::now().timestamp_millis()],
            )?;
            if updated == 0 {
                return Err(StorageError::NotFound(client_id));
            }
            Ok(())
        })
        .await
    }

    async fn is_connected(&self, client_id: &str) -> Result<bool> {
        let client_id = client_id.to_string();

        self.blocking(move |conn| {
            let connected: Option<bool> = conn
                .query_row(
                    "SELECT connected FROM sessions WHERE client_id = ?1",
                    params![client_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(connected.unwrap_or(false))
        })
        .await
    }

    async fn is_present(&self, client_id: &str) -> Result<bool> {
        let client_id = client_id.to_string();

        self.blocking(move |conn| {
            let present: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM sessions WHERE client_id = ?1",
                    params![client_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(present.is_some())
        })
        .await
    }

    async fn set_last_will(&self, client_id: &str, will: Option<BrokerMessage>) -> Result<()> {
        let client_id = client_id.to_string();

        self.blocking(move |conn| {
            let updated = match will {
                Some(will) => conn.execute(
                    "UPDATE sessions SET will_topic = ?2, will_payload = ?3,
                         will_qos = ?4, will_retain = ?5
                     WHERE client_id = ?1",
                    params![
                        client_id,
                        will.topic,
                        will.payload.as_ref(),
                        qos_to_int(will.qos),
                        will.retain
                    ],
                )?,
                None => conn.execute(
                    "UPDATE sessions SET will_topic = NULL, will_payload = NULL,
                         will_qos = NULL, will_retain = NULL
                     WHERE client_id = ?1",
                    params![client_id],
                )?,
            };
            if updated == 0 {
                return Err(StorageError::NotFound(client_id));
            }
            Ok(())
        })
        .await
    }

    async fn get_session(&self, client_id: &str) -> Result<Option<SessionRecord>> {
        let client_id = client_id.to_string();

        self.blocking(move |conn| {
            let session = conn
                .query_row(
                    "SELECT client_id, node_id, clean_session, connected, last_update, info,
                            will_topic, will_payload, will_qos, will_retain
                     FROM sessions WHERE client_id = ?1",
                    params![client_id],
                    row_to_session,
                )
                .optional()?;
            Ok(session)
        })
        .await
    }

    async fn add_subscriptions(&self, subscriptions: Vec<Subscription>) -> Result<()> {
        if subscriptions.is_empty() {
            return Ok(());
        }

        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR REPLACE INTO subscriptions (client_id, filter, qos, wildcard)
                     VALUES (?1, ?2, ?3, ?4)",
                )?;
                for sub in subscriptions {
                    let wildcard = sub.is_wildcard();
                    stmt.execute(params![
                        sub.client_id,
                        sub.topic_filter,
                        qos_to_int(sub.qos),
                        wildcard
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn del_subscriptions(&self, subscriptions: Vec<Subscription>) -> Result<()> {
        if subscriptions.is_empty() {
            return Ok(());
        }

        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt =
                    tx.prepare("DELETE FROM subscriptions WHERE client_id = ?1 AND filter = ?2")?;
                for sub in subscriptions {
                    stmt.execute(params![sub.client_id, sub.topic_filter])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_subscriptions(&self, client_id: &str) -> Result<Vec<Subscription>> {
        let client_id = client_id.to_string();

        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT client_id, filter, qos FROM subscriptions WHERE client_id = ?1",
            )?;
            let rows = stmt.query_map(params![client_id], |row| {
                Ok(Subscription {
                    client_id: row.get(0)?,
                    topic_filter: row.get(1)?,
                    qos: int_to_qos(row.get(2)?),
                })
            })?;

            let mut subs = Vec::new();
            for row in rows {
                subs.push(row?);
            }
            Ok(subs)
        })
        .await
    }

    async fn del_client(&self, client_id: &str, visitor: SubscriptionVisitor<'_>) -> Result<()> {
        // The visitor detaches the topic tree before rows disappear; the
        // deletion itself is a single transaction.
        let subs = self.get_subscriptions(client_id).await?;
        for sub in subs {
            visitor(sub);
        }

        let client_id = client_id.to_string();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM subscriptions WHERE client_id = ?1",
                params![client_id],
            )?;
            tx.execute(
                "DELETE FROM queued_recipients WHERE client_id = ?1",
                params![client_id],
            )?;
            delete_orphan_messages(&tx)?;
            tx.execute("DELETE FROM sessions WHERE client_id = ?1", params![client_id])?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn enqueue_messages(&self, messages: Vec<(BrokerMessage, Vec<String>)>) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }

        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut insert_msg = tx.prepare(
                    "INSERT OR IGNORE INTO queued_messages
                         (message_uuid, message_id, topic, payload, qos, retain, client_id, time)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )?;
                let mut insert_recipient = tx.prepare(
                    "INSERT OR IGNORE INTO queued_recipients (client_id, message_uuid)
                     VALUES (?1, ?2)",
                )?;

                for (msg, recipients) in messages {
                    if recipients.is_empty() {
                        continue;
                    }
                    let uuid = msg.message_uuid.to_string();
                    insert_msg.execute(params![
                        uuid,
                        i64::from(msg.message_id),
                        msg.topic,
                        msg.payload.as_ref(),
                        qos_to_int(msg.qos),
                        msg.retain,
                        msg.client_id,
                        msg.time.timestamp_millis(),
                    ])?;
                    for recipient in recipients {
                        insert_recipient.execute(params![recipient, uuid])?;
                    }
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn dequeue_messages(&self, client_id: &str, visitor: MessageVisitor<'_>) -> Result<()> {
        let client = client_id.to_string();

        // (mapping uuid, message or None for a dangling mapping)
        let pending: Vec<(String, Option<BrokerMessage>)> = self
            .blocking(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT qr.message_uuid AS mapping_uuid,
                            qm.message_uuid, qm.message_id, qm.topic, qm.payload,
                            qm.qos, qm.retain, qm.client_id, qm.time
                     FROM queued_recipients qr
                     LEFT JOIN queued_messages qm ON qm.message_uuid = qr.message_uuid
                     WHERE qr.client_id = ?1
                     ORDER BY qr.seq",
                )?;
                let rows = stmt.query_map(params![client], |row| {
                    let mapping_uuid: String = row.get("mapping_uuid")?;
                    let present: Option<String> = row.get("message_uuid")?;
                    let msg = match present {
                        Some(_) => Some(row_to_queued_message(row)?),
                        None => None,
                    };
                    Ok((mapping_uuid, msg))
                })?;

                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await?;

        let mut acked = Vec::new();
        for (mapping_uuid, msg) in pending {
            match msg {
                Some(msg) => {
                    if visitor(msg) {
                        acked.push(mapping_uuid);
                    } else {
                        break;
                    }
                }
                None => {
                    warn!(uuid = %mapping_uuid, client_id, "queued mapping without message, skipping");
                    acked.push(mapping_uuid);
                }
            }
        }

        if acked.is_empty() {
            return Ok(());
        }

        let client = client_id.to_string();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "DELETE FROM queued_recipients WHERE client_id = ?1 AND message_uuid = ?2",
                )?;
                for uuid in acked {
                    stmt.execute(params![client, uuid])?;
                }
            }
            delete_orphan_messages(&tx)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn remove_messages(&self, messages: Vec<(String, Uuid)>) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }

        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "DELETE FROM queued_recipients WHERE client_id = ?1 AND message_uuid = ?2",
                )?;
                for (client_id, uuid) in messages {
                    stmt.execute(params![client_id, uuid.to_string()])?;
                }
            }
            delete_orphan_messages(&tx)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn purge_queued_messages(&self, client_id: &str) -> Result<()> {
        let client_id = client_id.to_string();

        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM queued_recipients WHERE client_id = ?1",
                params![client_id],
            )?;
            delete_orphan_messages(&tx)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn purge_sessions(&self) -> Result<u64> {
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM subscriptions WHERE client_id IN
                     (SELECT client_id FROM sessions WHERE connected = 0)",
                [],
            )?;
            tx.execute(
                "DELETE FROM queued_recipients WHERE client_id IN
                     (SELECT client_id FROM sessions WHERE connected = 0)",
                [],
            )?;
            delete_orphan_messages(&tx)?;
            let deleted = tx.execute("DELETE FROM sessions WHERE connected = 0", [])?;
            tx.commit()?;
            Ok(deleted as u64)
        })
        .await
    }

    async fn count_queued_messages(&self) -> Result<u64> {
        self.blocking(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM queued_recipients", [], |row| row.get(0))?;
            Ok(count as u64)
        })
        .await
    }

    async fn count_queued_messages_for_client(&self, client_id: &str) -> Result<u64> {
        let client_id = client_id.to_string();

        self.blocking(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM queued_recipients WHERE client_id = ?1",
                params![client_id],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
        .await
    }

    async fn iterate_subscriptions(&self, visitor: SubscriptionVisitor<'_>) -> Result<()> {
        let subs: Vec<Subscription> = self
            .blocking(|conn| {
                let mut stmt =
                    conn.prepare("SELECT client_id, filter, qos FROM subscriptions")?;
                let rows = stmt.query_map([], |row| {
                    Ok(Subscription {
                        client_id: row.get(0)?,
                        topic_filter: row.get(1)?,
                        qos: int_to_qos(row.get(2)?),
                    })
                })?;

                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await?;

        for sub in subs {
            if !visitor(sub) {
                break;
            }
        }
        Ok(())
    }

    async fn iterate_offline_clients(&self, visitor: ClientVisitor<'_>) -> Result<()> {
        let clients: Vec<String> = self
            .blocking(|conn| {
                let mut stmt =
                    conn.prepare("SELECT client_id FROM sessions WHERE connected = 0")?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await?;

        for client in clients {
            if !visitor(client) {
                break;
            }
        }
        Ok(())
    }

    async fn iterate_node_clients(&self, node_id: &str, visitor: ClientVisitor<'_>) -> Result<()> {
        let node_id = node_id.to_string();
        let clients: Vec<String> = self
            .blocking(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT client_id FROM sessions WHERE node_id = ?1")?;
                let rows = stmt.query_map(params![node_id], |row| row.get(0))?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await?;

        for client in clients {
            if !visitor(client) {
                break;
            }
        }
        Ok(())
    }

    async fn iterate_all_sessions(&self, visitor: SessionVisitor<'_>) -> Result<()> {
        let sessions: Vec<SessionRecord> = self
            .blocking(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT client_id, node_id, clean_session, connected, last_update, info,
                            will_topic, will_payload, will_qos, will_retain
                     FROM sessions",
                )?;
                let rows = stmt.query_map([], row_to_session)?;
                let mut out = Vec::new();
                for row in rows {
                    match row {
                        Ok(session) => out.push(session),
                        Err(e) => warn!(error = %e, "skipping unreadable session row"),
                    }
                }
                Ok(out)
            })
            .await?;

        for session in sessions {
            if !visitor(session) {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::SqliteStore;

    fn msg(topic: &str, payload: &str) -> BrokerMessage {
        BrokerMessage::new(topic, payload.to_string()).with_client_id("tester")
    }

    #[tokio::test]
    async fn test_session_upsert_and_flags() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .set_client("c1", "node1", false, true, serde_json::json!({"addr": "10.0.0.1"}))
            .await
            .unwrap();

        assert!(store.is_present("c1").await.unwrap());
        assert!(store.is_connected("c1").await.unwrap());
        assert!(!store.is_present("ghost").await.unwrap());

        store.set_connected("c1", false).await.unwrap();
        assert!(!store.is_connected("c1").await.unwrap());

        let session = store.get_session("c1").await.unwrap().unwrap();
        assert_eq!(session.node_id, "node1");
        assert_eq!(session.info["addr"], "10.0.0.1");

        assert!(store.set_connected("ghost", true).await.is_err());
    }

    #[tokio::test]
    async fn test_last_will_round_trip() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .set_client("c1", "n", false, true, serde_json::json!({}))
            .await
            .unwrap();

        let will = msg("status/c1", "offline")
            .with_qos(QoS::AtLeastOnce)
            .with_retain(true);
        store.set_last_will("c1", Some(will)).await.unwrap();

        let session = store.get_session("c1").await.unwrap().unwrap();
        let will = session.last_will.unwrap();
        assert_eq!(will.topic, "status/c1");
        assert_eq!(will.payload.as_ref(), b"offline");
        assert_eq!(will.qos, QoS::AtLeastOnce);
        assert!(will.retain);

        store.set_last_will("c1", None).await.unwrap();
        let session = store.get_session("c1").await.unwrap().unwrap();
        assert!(session.last_will.is_none());
    }

    #[tokio::test]
    async fn test_subscriptions_latest_qos_wins() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .add_subscriptions(vec![Subscription::new("c1", "a/#", QoS::AtMostOnce)])
            .await
            .unwrap();
        store
            .add_subscriptions(vec![Subscription::new("c1", "a/#", QoS::ExactlyOnce)])
            .await
            .unwrap();

        let subs = store.get_subscriptions("c1").await.unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].qos, QoS::ExactlyOnce);
    }

    #[tokio::test]
    async fn test_queue_fifo_order() {
        let store = SqliteStore::in_memory().unwrap();
        for payload in ["first", "second", "third"] {
            store
                .enqueue_messages(vec![(msg("a/b", payload), vec!["c1".to_string()])])
                .await
                .unwrap();
        }

        let mut seen = Vec::new();
        store
            .dequeue_messages("c1", &mut |m| {
                assert!(m.queued);
                seen.push(String::from_utf8_lossy(&m.payload).to_string());
                true
            })
            .await
            .unwrap();
        assert_eq!(seen, vec!["first", "second", "third"]);
        assert_eq!(store.count_queued_messages().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_queue_retain_on_false() {
        let store = SqliteStore::in_memory().unwrap();
        for payload in ["one", "two"] {
            store
                .enqueue_messages(vec![(msg("a", payload), vec!["c1".to_string()])])
                .await
                .unwrap();
        }

        // Refuse everything: nothing is removed.
        store
            .dequeue_messages("c1", &mut |_| false)
            .await
            .unwrap();
        assert_eq!(
            store.count_queued_messages_for_client("c1").await.unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_enqueue_idempotent_and_shared() {
        let store = SqliteStore::in_memory().unwrap();
        let m = msg("a", "x");
        store
            .enqueue_messages(vec![(m.clone(), vec!["c1".to_string(), "c2".to_string()])])
            .await
            .unwrap();
        store
            .enqueue_messages(vec![(m.clone(), vec!["c1".to_string()])])
            .await
            .unwrap();

        assert_eq!(store.count_queued_messages().await.unwrap(), 2);

        // Removing c1's mapping keeps the message for c2.
        store
            .remove_messages(vec![("c1".to_string(), m.message_uuid)])
            .await
            .unwrap();
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
    async fn test_del_client_is_complete() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .set_client("c1", "n", false, false, serde_json::json!({}))
            .await
            .unwrap();
        store
            .add_subscriptions(vec![
                Subscription::new("c1", "a/#", QoS::AtLeastOnce),
                Subscription::new("c1", "b/+", QoS::AtMostOnce),
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
        assert_eq!(visited, vec!["a/#", "b/+"]);

        assert!(!store.is_present("c1").await.unwrap());
        assert!(store.get_subscriptions("c1").await.unwrap().is_empty());
        assert_eq!(store.count_queued_messages().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_purge_sessions() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .set_client("on", "n", false, true, serde_json::json!({}))
            .await
            .unwrap();
        store
            .set_client("off", "n", false, false, serde_json::json!({}))
            .await
            .unwrap();
        store
            .enqueue_messages(vec![(msg("t", "x"), vec!["off".to_string()])])
            .await
            .unwrap();

        assert_eq!(store.purge_sessions().await.unwrap(), 1);
        assert!(store.is_present("on").await.unwrap());
        assert!(!store.is_present("off").await.unwrap());
        assert_eq!(store.count_queued_messages().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_iterators() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .set_client("c1", "node1", false, true, serde_json::json!({}))
            .await
            .unwrap();
        store
            .set_client("c2", "node2", false, false, serde_json::json!({}))
            .await
            .unwrap();
        store
            .add_subscriptions(vec![Subscription::new("c1", "x/#", QoS::AtMostOnce)])
            .await
            .unwrap();

        let mut subs = 0;
        store
            .iterate_subscriptions(&mut |_| {
                subs += 1;
                true
            })
            .await
            .unwrap();
        assert_eq!(subs, 1);

        let mut offline = Vec::new();
        store
            .iterate_offline_clients(&mut |c| {
                offline.push(c);
                true
            })
            .await
            .unwrap();
        assert_eq!(offline, vec!["c2"]);

        let mut node1 = Vec::new();
        store
            .iterate_node_clients("node1", &mut |c| {
                node1.push(c);
                true
            })
            .await
            .unwrap();
        assert_eq!(node1, vec!["c1"]);

        let mut all = 0;
        store
            .iterate_all_sessions(&mut |_| {
                all += 1;
                true
            })
            .await
            .unwrap();
        assert_eq!(all, 2);
    }
}
