//! Broker and session counters.
//!
//! Counter increments are lock-free and happen on the hot publish path;
//! a flush task samples them on an interval and upserts one document per
//! kind/identifier into the metrics store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, warn};

use grendel_storage::types::{MetricKind, MetricsSample};
use grendel_storage::MetricsStore;

use crate::broadcast::{Broadcast, BrokerEvent};

#[derive(Debug, Default)]
struct Counters {
    messages_in: AtomicU64,
    messages_out: AtomicU64,
}

impl Counters {
    fn drain(&self) -> (u64, u64) {
        (
            self.messages_in.swap(0, Ordering::Relaxed),
            self.messages_out.swap(0, Ordering::Relaxed),
        )
    }
}

/// Collects message counters and periodically persists them.
pub struct MetricsCollector {
    node_id: String,
    broker: Counters,
    sessions: RwLock<HashMap<String, Arc<Counters>>>,
    store: Arc<dyn MetricsStore>,
}

impl MetricsCollector {
    pub fn new(node_id: impl Into<String>, store: Arc<dyn MetricsStore>) -> Self {
        MetricsCollector {
            node_id: node_id.into(),
            broker: Counters::default(),
            sessions: RwLock::new(HashMap::new()),
            store,
        }
    }

    pub fn incr_messages_in(&self, client_id: &str) {
        self.broker.messages_in.fetch_add(1, Ordering::Relaxed);
        self.session_counters(client_id)
            .messages_in
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_messages_out(&self, client_id: &str) {
        self.broker.messages_out.fetch_add(1, Ordering::Relaxed);
        self.session_counters(client_id)
            .messages_out
            .fetch_add(1, Ordering::Relaxed);
    }

    fn session_counters(&self, client_id: &str) -> Arc<Counters> {
        {
            let sessions = self.sessions.read().expect("metrics lock poisoned");
            if let Some(counters) = sessions.get(client_id) {
                return Arc::clone(counters);
            }
        }
        let mut sessions = self.sessions.write().expect("metrics lock poisoned");
        Arc::clone(sessions.entry(client_id.to_string()).or_default())
    }

    /// Forget a session's counters after its final flush window.
    pub fn drop_session(&self, client_id: &str) {
        self.sessions
            .write()
            .expect("metrics lock poisoned")
            .remove(client_id);
    }

    /// Drain all counters into store upserts, one sample per identifier.
    pub async fn flush(&self) {
        let now = Utc::now();

        let (broker_in, broker_out) = self.broker.drain();
        let broker_sample = MetricsSample {
            timestamp: now,
            kind: MetricKind::Broker,
            identifier: self.node_id.clone(),
            payload: json!({ "messagesIn": broker_in, "messagesOut": broker_out }),
        };
        if let Err(e) = self.store.upsert_sample(broker_sample).await {
            warn!(error = %e, "failed to store broker metrics sample");
        }

        let session_counts: Vec<(String, u64, u64)> = {
            let sessions = self.sessions.read().expect("metrics lock poisoned");
            sessions
                .iter()
                .map(|(id, counters)| {
                    let (msgs_in, msgs_out) = counters.drain();
                    (id.clone(), msgs_in, msgs_out)
                })
                .collect()
        };

        for (client_id, msgs_in, msgs_out) in session_counts {
            if msgs_in == 0 && msgs_out == 0 {
                continue;
            }
            let sample = MetricsSample {
                timestamp: now,
                kind: MetricKind::Session,
                identifier: client_id.clone(),
                payload: json!({ "messagesIn": msgs_in, "messagesOut": msgs_out }),
            };
            if let Err(e) = self.store.upsert_sample(sample).await {
                warn!(error = %e, client_id = %client_id, "failed to store session metrics sample");
            }
        }
    }

    /// Periodic flush loop; ends on shutdown after one final flush.
    pub fn spawn_flush_task(self: Arc<Self>, interval: Duration, bus: Broadcast) {
        tokio::spawn(async move {
            let mut events = bus.subscribe();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => self.flush().await,
                    event = events.recv() => {
                        match event {
                            Ok(BrokerEvent::Shutdown) | Err(_) => {
                                self.flush().await;
                                debug!("metrics flush task stopped");
                                return;
                            }
                            Ok(_) => {}
                        }
                    }
                }
            }
        });
    }
}
