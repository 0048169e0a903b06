//! Publish/subscribe routing.
//!
//! One `Router` per node. Inbound publishes run the full pipeline:
//! authorization, retained-store update, fan-out to online subscribers,
//! offline enqueue for persistent sessions, archive-group routing, and
//! counter updates. The retained update always completes before fan-out,
//! so a concurrent subscriber sees either the old retained value plus the
//! live publish, or the new retained value alone.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use grendel_core::{topic, BrokerMessage, QoS};
use grendel_storage::types::Subscription;
use grendel_storage::{MessageStore, SessionStore};

use crate::acl::AclCache;
use crate::archive::ArchiveRegistry;
use crate::config::BrokerConfig;
use crate::metrics::MetricsCollector;
use crate::topic_tree::SubscriptionTree;
use crate::{BrokerError, Result};

/// One message on its way to a subscriber, at the effective QoS
/// `min(subscription, publish)`.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: BrokerMessage,
    pub qos: QoS,
}

/// Outbound channel of a connected client.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    sender: mpsc::Sender<Delivery>,
}

impl ClientHandle {
    /// Non-blocking send into the client's window. `false` means full or
    /// gone; the caller falls back to the offline queue.
    pub(crate) fn try_deliver(&self, delivery: Delivery) -> bool {
        self.sender.try_send(delivery).is_ok()
    }
}

/// What happened to an authorized-or-not publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Routed,
    /// Denied by ACL and silently dropped (policy says not to disconnect).
    DroppedUnauthorized,
}

pub struct Router {
    config: Arc<BrokerConfig>,
    tree: SubscriptionTree,
    retained: Arc<dyn MessageStore>,
    sessions: Arc<dyn SessionStore>,
    acl: Arc<AclCache>,
    archives: Arc<ArchiveRegistry>,
    metrics: Arc<MetricsCollector>,
    clients: RwLock<HashMap<String, ClientHandle>>,
}

impl Router {
    pub fn new(
        config: Arc<BrokerConfig>,
        retained: Arc<dyn MessageStore>,
        sessions: Arc<dyn SessionStore>,
        acl: Arc<AclCache>,
        archives: Arc<ArchiveRegistry>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Router {
            config,
            tree: SubscriptionTree::new(),
            retained,
            sessions,
            acl,
            archives,
            metrics,
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Create an outbound channel for a connecting client without making
    /// it visible to fan-out yet. The session manager drains the offline
    /// queue into it first, then attaches it.
    pub fn open_channel(&self) -> (ClientHandle, mpsc::Receiver<Delivery>) {
        let (sender, receiver) = mpsc::channel(self.config.send_window);
        (ClientHandle { sender }, receiver)
    }

    /// Make the client's channel visible to fan-out.
    pub fn attach_client(&self, client_id: &str, handle: ClientHandle) {
        let mut clients = self.clients.write().expect("router clients lock poisoned");
        clients.insert(client_id.to_string(), handle);
    }

    /// Remove the client from fan-out; subsequent matching publishes go
    /// to its offline queue (persistent sessions only).
    pub fn detach_client(&self, client_id: &str) {
        let mut clients = self.clients.write().expect("router clients lock poisoned");
        clients.remove(client_id);
    }

    pub fn is_client_attached(&self, client_id: &str) -> bool {
        let clients = self.clients.read().expect("router clients lock poisoned");
        clients.contains_key(client_id)
    }

    fn client_handle(&self, client_id: &str) -> Option<ClientHandle> {
        let clients = self.clients.read().expect("router clients lock poisoned");
        clients.get(client_id).cloned()
    }

    /// Full PUBLISH pipeline. `username` is the authenticated identity of
    /// the publishing connection.
    pub async fn publish(&self, username: &str, msg: BrokerMessage) -> Result<PublishOutcome> {
        topic::validate_name(&msg.topic)?;

        if !self.acl.can_publish(username, &msg.topic) {
            if self.config.disconnect_on_unauthorized {
                return Err(BrokerError::Unauthorized {
                    op: "publish",
                    username: username.to_string(),
                    topic: msg.topic,
                });
            }
            debug!(username, topic = %msg.topic, "unauthorized publish dropped");
            return Ok(PublishOutcome::DroppedUnauthorized);
        }

        // Retained update strictly precedes fan-out.
        if msg.retain {
            if msg.is_empty() {
                self.retained.del_all(vec![msg.topic.clone()]).await?;
            } else {
                self.retained.put_all(vec![msg.clone()]).await?;
            }
        }

        self.fan_out(&msg).await?;
        self.route_to_archives(&msg).await;

        self.metrics.incr_messages_in(&msg.client_id);
        Ok(PublishOutcome::Routed)
    }

    async fn fan_out(&self, msg: &BrokerMessage) -> Result<()> {
        let subscribers = self.tree.match_clients(&msg.topic);
        if subscribers.is_empty() {
            return Ok(());
        }

        let mut overflow: Vec<String> = Vec::new();

        for (client_id, sub_qos) in subscribers {
            let qos = sub_qos.min(msg.qos);

            match self.client_handle(&client_id) {
                Some(handle) => {
                    let delivered = handle.try_deliver(Delivery {
                        message: msg.clone(),
                        qos,
                    });
                    if delivered {
                        self.metrics.incr_messages_out(&client_id);
                    } else {
                        // Window full or connection just died.
                        overflow.push(client_id);
                    }
                }
                None => overflow.push(client_id),
            }
        }

        if overflow.is_empty() {
            return Ok(());
        }

        // Only persistent sessions get queued messages.
        let mut recipients = Vec::new();
        for client_id in overflow {
            match self.sessions.get_session(&client_id).await {
                Ok(Some(session)) if !session.clean_session => recipients.push(client_id),
                Ok(_) => {}
                Err(e) => warn!(client_id = %client_id, error = %e, "session lookup failed during fan-out"),
            }
        }

        if !recipients.is_empty() {
            self.sessions
                .enqueue_messages(vec![(msg.clone(), recipients)])
                .await?;
        }
        Ok(())
    }

    async fn route_to_archives(&self, msg: &BrokerMessage) {
        for handles in self.archives.route(&msg.topic, msg.retain) {
            if let Some(archive) = &handles.archive {
                if let Err(e) = archive.add_history(vec![msg.clone()]).await {
                    warn!(group = %handles.group.name, error = %e, "archive append failed");
                }
            }
            if let Some(last_value) = &handles.last_value {
                let result = if msg.retain && msg.is_empty() {
                    last_value.del_all(vec![msg.topic.clone()]).await
                } else {
                    last_value.put_all(vec![msg.clone()]).await
                };
                if let Err(e) = result {
                    warn!(group = %handles.group.name, error = %e, "last-value update failed");
                }
            }
        }
    }

    /// SUBSCRIBE: authorize, index, persist, then replay matching
    /// retained messages at `min(granted, retained)` QoS.
    pub async fn subscribe(
        &self,
        username: &str,
        client_id: &str,
        filter: &str,
        qos: QoS,
    ) -> Result<QoS> {
        topic::validate_filter(filter)?;

        if !self.acl.can_subscribe(username, filter) {
            return Err(BrokerError::Unauthorized {
                op: "subscribe",
                username: username.to_string(),
                topic: filter.to_string(),
            });
        }

        self.tree.insert(filter, client_id.to_string(), qos);
        self.sessions
            .add_subscriptions(vec![Subscription::new(client_id, filter, qos)])
            .await?;

        self.replay_retained(client_id, filter, qos).await?;
        Ok(qos)
    }

    async fn replay_retained(&self, client_id: &str, filter: &str, sub_qos: QoS) -> Result<()> {
        let Some(handle) = self.client_handle(client_id) else {
            return Ok(());
        };
        let metrics = Arc::clone(&self.metrics);
        let client_owned = client_id.to_string();

        self.retained
            .find_matching_messages(filter, &mut |msg| {
                let qos = sub_qos.min(msg.qos);
                let delivered = handle.try_deliver(Delivery { message: msg, qos });
                if delivered {
                    metrics.incr_messages_out(&client_owned);
                } else {
                    debug!(client_id = %client_owned, "retained replay overflowed send window");
                }
                // Best effort: a full window skips the rest of the replay.
                delivered
            })
            .await?;
        Ok(())
    }

    /// UNSUBSCRIBE: drop from the index and the session store. Returns
    /// whether the subscription existed.
    pub async fn unsubscribe(&self, client_id: &str, filter: &str) -> Result<bool> {
        let existed = self.tree.remove(filter, &client_id.to_string());
        self.sessions
            .del_subscriptions(vec![Subscription::new(client_id, filter, QoS::AtMostOnce)])
            .await?;
        Ok(existed)
    }

    /// Re-attach a persisted subscription to the index without touching
    /// the store (session resume and cold-start rebuild).
    pub fn restore_subscription(&self, client_id: &str, filter: &str, qos: QoS) {
        self.tree.insert(filter, client_id.to_string(), qos);
    }

    /// Detach every filter of a client from the index.
    pub fn drop_client_subscriptions(&self, client_id: &str, filters: &[String]) {
        for filter in filters {
            self.tree.remove(filter, &client_id.to_string());
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.tree.iter_entries().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grendel_storage::memory::{MemoryMessageStore, MemoryStore};
    use grendel_storage::types::User;
    use grendel_storage::ArchiveGroupStore;

    struct Fixture {
        router: Arc<Router>,
        sessions: Arc<MemoryStore>,
        retained: Arc<MemoryMessageStore>,
    }

    async fn fixture() -> Fixture {
        fixture_with_config(BrokerConfig::default()).await
    }

    async fn fixture_with_config(config: BrokerConfig) -> Fixture {
        let config = Arc::new(config);
        let sessions = Arc::new(MemoryStore::new());
        let retained = Arc::new(MemoryMessageStore::new());
        let acl = Arc::new(AclCache::new(config.acl_cache_size));

        // One permissive user plus one without any grants.
        let mut admin = User::new("root", "");
        admin.is_admin = true;
        acl.load(
            vec![admin, User::new("nobody", "")],
            vec![],
        );

        let archives = Arc::new(ArchiveRegistry::new());
        archives
            .load(sessions.as_ref(), &crate::archive::tests_support::MemoryFactory)
            .await
            .unwrap();

        let metrics = Arc::new(MetricsCollector::new(
            "node-test",
            sessions.clone() as Arc<dyn grendel_storage::MetricsStore>,
        ));

        let router = Arc::new(Router::new(
            config,
            retained.clone() as Arc<dyn MessageStore>,
            sessions.clone() as Arc<dyn SessionStore>,
            acl,
            archives,
            metrics,
        ));

        Fixture {
            router,
            sessions,
            retained,
        }
    }

    fn attach(router: &Router, client_id: &str) -> mpsc::Receiver<Delivery> {
        let (handle, rx) = router.open_channel();
        router.attach_client(client_id, handle);
        rx
    }

    fn msg(topic: &str, payload: &str, from: &str) -> BrokerMessage {
        BrokerMessage::new(topic, payload.to_string()).with_client_id(from)
    }

    #[tokio::test]
    async fn test_publish_reaches_matching_subscriber() {
        let f = fixture().await;
        let mut rx = attach(&f.router, "sub1");

        f.router
            .subscribe("root", "sub1", "sensors/+/temp", QoS::AtLeastOnce)
            .await
            .unwrap();

        f.router
            .publish(
                "root",
                msg("sensors/1/temp", "21", "pub1").with_qos(QoS::AtMostOnce),
            )
            .await
            .unwrap();

        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.message.topic, "sensors/1/temp");
        // min(subscription 1, publish 0) = 0
        assert_eq!(delivery.qos, QoS::AtMostOnce);
    }

    #[tokio::test]
    async fn test_subscriber_qos_capped_by_publish() {
        let f = fixture().await;
        let mut rx = attach(&f.router, "s");
        f.router
            .subscribe("root", "s", "t", QoS::AtMostOnce)
            .await
            .unwrap();

        f.router
            .publish("root", msg("t", "x", "p").with_qos(QoS::ExactlyOnce))
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap().qos, QoS::AtMostOnce);
    }

    #[tokio::test]
    async fn test_retain_replay_on_subscribe() {
        let f = fixture().await;

        f.router
            .publish(
                "root",
                msg("sensors/1/temp", "21", "p")
                    .with_qos(QoS::AtLeastOnce)
                    .with_retain(true),
            )
            .await
            .unwrap();

        let mut rx = attach(&f.router, "late");
        f.router
            .subscribe("root", "late", "sensors/+/temp", QoS::AtMostOnce)
            .await
            .unwrap();

        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.message.payload.as_ref(), b"21");
        assert!(delivery.message.retain);
        assert_eq!(delivery.qos, QoS::AtMostOnce);
    }

    #[tokio::test]
    async fn test_retain_empty_payload_deletes() {
        let f = fixture().await;

        f.router
            .publish("root", msg("t", "v", "p").with_retain(true))
            .await
            .unwrap();
        f.router
            .publish("root", msg("t", "", "p").with_retain(true))
            .await
            .unwrap();

        assert!(f.retained.get("t").await.unwrap().is_none());

        let mut rx = attach(&f.router, "late");
        f.router
            .subscribe("root", "late", "#", QoS::AtMostOnce)
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_retain_idempotent() {
        let f = fixture().await;
        let m = msg("t", "same", "p").with_retain(true);
        f.router.publish("root", m.clone()).await.unwrap();
        f.router.publish("root", m).await.unwrap();

        let mut count = 0;
        f.retained
            .find_matching_messages("#", &mut |_| {
                count += 1;
                true
            })
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_offline_persistent_subscriber_gets_queued() {
        let f = fixture().await;

        // Persistent session, subscribed, then offline.
        f.sessions
            .set_client("c", "n", false, false, serde_json::json!({}))
            .await
            .unwrap();
        f.router.restore_subscription("c", "a/#", QoS::AtLeastOnce);

        f.router.publish("root", msg("a/b", "1", "p")).await.unwrap();
        f.router.publish("root", msg("a/b/c", "2", "p")).await.unwrap();
        f.router.publish("root", msg("a/d", "3", "p")).await.unwrap();

        assert_eq!(
            f.sessions.count_queued_messages_for_client("c").await.unwrap(),
            3
        );

        // FIFO drain.
        let mut payloads = Vec::new();
        f.sessions
            .dequeue_messages("c", &mut |m| {
                payloads.push(String::from_utf8_lossy(&m.payload).to_string());
                true
            })
            .await
            .unwrap();
        assert_eq!(payloads, vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_clean_session_subscriber_not_queued() {
        let f = fixture().await;
        f.sessions
            .set_client("c", "n", true, false, serde_json::json!({}))
            .await
            .unwrap();
        f.router.restore_subscription("c", "a", QoS::AtMostOnce);

        f.router.publish("root", msg("a", "1", "p")).await.unwrap();
        assert_eq!(f.sessions.count_queued_messages().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_send_window_overflow_goes_to_queue() {
        let mut config = BrokerConfig::default();
        config.send_window = 2;
        let f = fixture_with_config(config).await;

        f.sessions
            .set_client("slow", "n", false, true, serde_json::json!({}))
            .await
            .unwrap();
        let _rx = attach(&f.router, "slow");
        f.router
            .subscribe("root", "slow", "t", QoS::AtMostOnce)
            .await
            .unwrap();

        for i in 0..5 {
            f.router
                .publish("root", msg("t", &i.to_string(), "p"))
                .await
                .unwrap();
        }

        // Window of 2 absorbed two; the rest overflowed to the queue.
        assert_eq!(
            f.sessions.count_queued_messages_for_client("slow").await.unwrap(),
            3
        );
    }

    #[tokio::test]
    async fn test_unauthorized_publish_dropped_silently() {
        let f = fixture().await;
        let mut rx = attach(&f.router, "s");
        f.router
            .subscribe("root", "s", "#", QoS::AtMostOnce)
            .await
            .unwrap();

        let outcome = f
            .router
            .publish("nobody", msg("t", "x", "nobody"))
            .await
            .unwrap();
        assert_eq!(outcome, PublishOutcome::DroppedUnauthorized);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unauthorized_publish_disconnects_when_configured() {
        let mut config = BrokerConfig::default();
        config.disconnect_on_unauthorized = true;
        let f = fixture_with_config(config).await;

        let result = f.router.publish("nobody", msg("t", "x", "nobody")).await;
        assert!(matches!(result, Err(BrokerError::Unauthorized { .. })));
    }

    #[tokio::test]
    async fn test_unauthorized_subscribe_rejected() {
        let f = fixture().await;
        let result = f
            .router
            .subscribe("nobody", "c", "secret/#", QoS::AtMostOnce)
            .await;
        assert!(matches!(result, Err(BrokerError::Unauthorized { .. })));
        assert_eq!(f.router.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_topic_rejected() {
        let f = fixture().await;
        assert!(f
            .router
            .publish("root", msg("bad/+/topic", "x", "p"))
            .await
            .is_err());
        assert!(f
            .router
            .subscribe("root", "c", "bad/#/filter", QoS::AtMostOnce)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let f = fixture().await;
        let mut rx = attach(&f.router, "s");
        f.router
            .subscribe("root", "s", "t", QoS::AtMostOnce)
            .await
            .unwrap();

        assert!(f.router.unsubscribe("s", "t").await.unwrap());
        assert!(!f.router.unsubscribe("s", "t").await.unwrap());

        f.router.publish("root", msg("t", "x", "p")).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_overlapping_subscriptions_deliver_once() {
        let f = fixture().await;
        let mut rx = attach(&f.router, "s");
        f.router
            .subscribe("root", "s", "a/#", QoS::AtMostOnce)
            .await
            .unwrap();
        f.router
            .subscribe("root", "s", "a/b", QoS::AtLeastOnce)
            .await
            .unwrap();

        f.router
            .publish("root", msg("a/b", "x", "p").with_qos(QoS::ExactlyOnce))
            .await
            .unwrap();

        let delivery = rx.recv().await.unwrap();
        // Highest matching subscription QoS wins, capped by publish QoS.
        assert_eq!(delivery.qos, QoS::AtLeastOnce);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_archive_group_routing_retained_only() {
        let f = fixture().await;

        // Group archiving only retained sensor messages.
        let mut group = grendel_storage::types::ArchiveGroup::default_group();
        group.name = "sensors".to_string();
        group.topic_filters = vec!["sensors/#".to_string()];
        group.retained_only = true;
        f.sessions.upsert_group(group).await.unwrap();
        f.router
            .archives
            .load(
                f.sessions.as_ref(),
                &crate::archive::tests_support::MemoryFactory,
            )
            .await
            .unwrap();

        f.router
            .publish("root", msg("sensors/1/temp", "20", "p"))
            .await
            .unwrap();

        let handles = f
            .router
            .archives
            .route("sensors/1/temp", true)
            .into_iter()
            .find(|h| h.group.name == "sensors")
            .unwrap();
        let archive = handles.archive.as_ref().unwrap();
        assert!(archive
            .get_history("sensors/#", None, None, 10)
            .await
            .unwrap()
            .is_empty());

        f.router
            .publish("root", msg("sensors/1/temp", "21", "p").with_retain(true))
            .await
            .unwrap();
        assert_eq!(
            archive
                .get_history("sensors/#", None, None, 10)
                .await
                .unwrap()
                .len(),
            1
        );
    }
}
