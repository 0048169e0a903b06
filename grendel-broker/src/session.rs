//! Session lifecycle.
//!
//! The session manager owns CONNECT/DISCONNECT semantics: authentication,
//! clean-session takeover, subscription restore, offline-queue drain, and
//! will publication on abnormal disconnect. It also carries the broker's
//! periodic tasks: the cold-start rebuild of the subscription index, the
//! Admin/Anonymous bootstrap, and the ACL cache refresh loop.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use grendel_core::BrokerMessage;
use grendel_storage::password::hash_password;
use grendel_storage::types::{User, ADMIN_USER, ANONYMOUS_USER};
use grendel_storage::{SessionStore, UserStore};

use crate::acl::AclCache;
use crate::broadcast::{Broadcast, BrokerEvent};
use crate::config::BrokerConfig;
use crate::router::{Delivery, Router};
use crate::{BrokerError, Result};

/// Decoded CONNECT, as handed over by the front-end.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub clean_session: bool,
    pub last_will: Option<BrokerMessage>,
    /// Opaque connection info (peer address, protocol level, ...).
    pub info: serde_json::Value,
}

/// An established session, owned by the connection task.
pub struct ActiveSession {
    pub client_id: String,
    /// Authenticated identity used for every ACL check.
    pub username: String,
    /// A persistent session existed and was resumed.
    pub session_present: bool,
    /// Outbound deliveries for this client.
    pub deliveries: mpsc::Receiver<Delivery>,
}

pub struct SessionManager {
    config: Arc<BrokerConfig>,
    router: Arc<Router>,
    sessions: Arc<dyn SessionStore>,
    users: Arc<dyn UserStore>,
    acl: Arc<AclCache>,
    bus: Broadcast,
}

impl SessionManager {
    pub fn new(
        config: Arc<BrokerConfig>,
        router: Arc<Router>,
        sessions: Arc<dyn SessionStore>,
        users: Arc<dyn UserStore>,
        acl: Arc<AclCache>,
        bus: Broadcast,
    ) -> Self {
        SessionManager {
            config,
            router,
            sessions,
            users,
            acl,
            bus,
        }
    }

    /// Full CONNECT flow. On success the caller owns the delivery
    /// receiver; on failure the connection is to be refused.
    pub async fn connect(&self, request: ConnectRequest) -> Result<ActiveSession> {
        let username = self.authenticate(&request).await?;

        // A second connection for a live client replaces it.
        if self.router.is_client_attached(&request.client_id) {
            info!(client_id = %request.client_id, "session takeover");
            self.bus.send(BrokerEvent::SessionTakenOver {
                client_id: request.client_id.clone(),
            });
            self.router.detach_client(&request.client_id);
        }

        let was_present = self.sessions.is_present(&request.client_id).await?;
        let session_present = was_present && !request.clean_session;

        if request.clean_session {
            // Takeover is atomic: subscriptions, queue, and session row go
            // together before the fresh row appears.
            if was_present {
                self.forget_client(&request.client_id).await?;
            }
            self.sessions
                .set_client(
                    &request.client_id,
                    &self.config.node_id,
                    true,
                    true,
                    request.info.clone(),
                )
                .await?;
        } else {
            self.sessions
                .set_client(
                    &request.client_id,
                    &self.config.node_id,
                    false,
                    true,
                    request.info.clone(),
                )
                .await?;
            if session_present {
                for sub in self.sessions.get_subscriptions(&request.client_id).await? {
                    self.router
                        .restore_subscription(&sub.client_id, &sub.topic_filter, sub.qos);
                }
            }
        }

        self.sessions
            .set_last_will(&request.client_id, request.last_will.clone())
            .await?;

        // Drain the offline queue into the fresh channel before fan-out
        // can see the client: messages published meanwhile still take the
        // offline path and are picked up by the second drain.
        let (handle, deliveries) = self.router.open_channel();
        if session_present {
            self.drain_queue(&request.client_id, &handle).await?;
        }
        self.router.attach_client(&request.client_id, handle.clone());
        if session_present {
            self.drain_queue(&request.client_id, &handle).await?;
        }

        debug!(
            client_id = %request.client_id,
            username = %username,
            session_present,
            "session connected"
        );

        Ok(ActiveSession {
            client_id: request.client_id,
            username,
            session_present,
            deliveries,
        })
    }

    async fn authenticate(&self, request: &ConnectRequest) -> Result<String> {
        match (&request.username, &request.password) {
            (Some(username), Some(password)) => {
                match self.users.validate_credentials(username, password).await? {
                    Some(user) => Ok(user.username),
                    None => {
                        warn!(username = %username, "authentication failed");
                        Err(BrokerError::AuthenticationFailed(username.clone()))
                    }
                }
            }
            (Some(username), None) => {
                warn!(username = %username, "username without password");
                Err(BrokerError::AuthenticationFailed(username.clone()))
            }
            (None, _) => {
                if !self.config.allow_anonymous {
                    return Err(BrokerError::AuthenticationFailed(ANONYMOUS_USER.to_string()));
                }
                match self.users.get_user(ANONYMOUS_USER).await? {
                    Some(user) if user.enabled => Ok(user.username),
                    _ => Err(BrokerError::AuthenticationFailed(ANONYMOUS_USER.to_string())),
                }
            }
        }
    }

    async fn drain_queue(
        &self,
        client_id: &str,
        handle: &crate::router::ClientHandle,
    ) -> Result<()> {
        self.sessions
            .dequeue_messages(client_id, &mut |msg| {
                let qos = msg.qos;
                handle.try_deliver(Delivery { message: msg, qos })
            })
            .await?;
        Ok(())
    }

    /// Graceful DISCONNECT: the will is discarded, state survives per the
    /// clean-session flag.
    pub async fn disconnect(&self, client_id: &str) -> Result<()> {
        self.router.detach_client(client_id);
        self.sessions.set_last_will(client_id, None).await.ok();
        self.finish_disconnect(client_id).await
    }

    /// Abnormal termination (socket drop, keepalive timeout): publish the
    /// will through the normal pipeline, then proceed as a disconnect.
    pub async fn connection_lost(&self, client_id: &str, username: &str) -> Result<()> {
        self.router.detach_client(client_id);

        if let Some(session) = self.sessions.get_session(client_id).await? {
            if let Some(will) = session.last_will {
                info!(client_id, topic = %will.topic, "publishing last will");
                let mut will = will;
                will.client_id = client_id.to_string();
                if let Err(e) = self.router.publish(username, will).await {
                    warn!(client_id, error = %e, "last-will publish failed");
                }
                self.sessions.set_last_will(client_id, None).await.ok();
            }
        }

        self.finish_disconnect(client_id).await
    }

    async fn finish_disconnect(&self, client_id: &str) -> Result<()> {
        let clean = self
            .sessions
            .get_session(client_id)
            .await?
            .map(|s| s.clean_session)
            .unwrap_or(true);

        if clean {
            // Terminal: nothing survives a clean session's end.
            self.forget_client(client_id).await?;
        } else {
            self.sessions.set_connected(client_id, false).await?;
        }
        Ok(())
    }

    /// Admin removal of a client: drops the session wherever it stands.
    pub async fn expire_client(&self, client_id: &str) -> Result<()> {
        self.router.detach_client(client_id);
        self.forget_client(client_id).await
    }

    /// Delete all client state; the store visitor detaches the index.
    async fn forget_client(&self, client_id: &str) -> Result<()> {
        let router = Arc::clone(&self.router);
        let client = client_id.to_string();
        self.sessions
            .del_client(client_id, &mut move |sub| {
                router.drop_client_subscriptions(&client, &[sub.topic_filter]);
                true
            })
            .await?;
        Ok(())
    }

    /// Cold start: mark this node's sessions disconnected, then rebuild
    /// the subscription index from the store. Rows that fail to load are
    /// skipped, not fatal.
    pub async fn cold_start(&self) -> Result<()> {
        let node_clients: Vec<String> = {
            let mut clients = Vec::new();
            self.sessions
                .iterate_node_clients(&self.config.node_id, &mut |client| {
                    clients.push(client);
                    true
                })
                .await?;
            clients
        };
        for client in node_clients {
            if let Err(e) = self.sessions.set_connected(&client, false).await {
                warn!(client_id = %client, error = %e, "failed to reset connected flag");
            }
        }

        let mut restored = 0usize;
        let router = Arc::clone(&self.router);
        self.sessions
            .iterate_subscriptions(&mut |sub| {
                router.restore_subscription(&sub.client_id, &sub.topic_filter, sub.qos);
                restored += 1;
                true
            })
            .await?;
        info!(restored, "subscription index rebuilt");
        Ok(())
    }

    /// Refresh loop for the ACL cache, on the configured interval.
    pub fn spawn_acl_refresh_task(&self) {
        let acl = Arc::clone(&self.acl);
        let users = Arc::clone(&self.users);
        let bus = self.bus.clone();
        let interval = self.config.acl_refresh_interval;

        tokio::spawn(async move {
            let mut events = bus.subscribe();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = acl.refresh(users.as_ref()).await {
                            warn!(error = %e, "acl cache refresh failed");
                        }
                    }
                    event = events.recv() => {
                        if matches!(event, Ok(BrokerEvent::Shutdown) | Err(_)) {
                            debug!("acl refresh task stopped");
                            return;
                        }
                    }
                }
            }
        });
    }
}

/// First-use bootstrap: an `Admin` user (with the given password, or a
/// generated one logged once) and the `Anonymous` user, enabled per
/// configuration. Idempotent.
pub async fn bootstrap_users(
    users: &dyn UserStore,
    admin_password: Option<&str>,
    allow_anonymous: bool,
) -> Result<()> {
    if users.get_user(ADMIN_USER).await?.is_none() {
        let generated;
        let password = match admin_password {
            Some(p) => p,
            None => {
                generated = uuid::Uuid::new_v4().simple().to_string();
                info!(password = %generated, "generated initial Admin password");
                &generated
            }
        };
        let mut admin = User::new(ADMIN_USER, hash_password(password)?);
        admin.is_admin = true;
        users.create_user(admin).await?;
        info!("bootstrapped Admin user");
    }

    if users.get_user(ANONYMOUS_USER).await?.is_none() {
        let mut anonymous = User::new(ANONYMOUS_USER, String::new());
        anonymous.enabled = allow_anonymous;
        users.create_user(anonymous).await?;
        // Grants are positive-only, so an open broker needs an explicit
        // catch-all rule for the Anonymous user.
        users
            .create_acl_rule(grendel_storage::types::AclRule {
                id: 0,
                username: ANONYMOUS_USER.to_string(),
                topic_pattern: "#".to_string(),
                can_subscribe: true,
                can_publish: true,
                priority: 0,
                created_at: chrono::Utc::now(),
            })
            .await?;
        info!(enabled = allow_anonymous, "bootstrapped Anonymous user");
    }

    Ok(())
}
