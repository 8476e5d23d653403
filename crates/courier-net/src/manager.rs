//! Relay endpoint table and reconnect supervision.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use courier_shared::types::normalize_relay_url;

use crate::config::NetConfig;
use crate::error::RelayError;
use crate::session::{RelaySession, RelayStatus, SessionEvent};
use crate::transport::Connector;

/// Snapshot of one configured relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayEndpoint {
    pub url: String,
    pub status: RelayStatus,
    pub read: bool,
    pub write: bool,
    pub last_latency_ms: Option<u64>,
    pub last_error: Option<String>,
}

struct RelayEntry {
    url: String,
    read: bool,
    write: bool,
    session: Arc<RelaySession>,
}

/// Owns every relay endpoint and its session.
///
/// Endpoints are kept in insertion order. A supervisor task periodically
/// reconnects endpoints that are `disconnected` or in `error`; it holds only
/// a weak reference and stops with the manager.
pub struct RelayConnectionManager {
    relays: RwLock<Vec<RelayEntry>>,
    connector: Arc<dyn Connector>,
    events: mpsc::UnboundedSender<SessionEvent>,
    config: NetConfig,
    auto_reconnect: AtomicBool,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl RelayConnectionManager {
    /// Must be called inside a tokio runtime when auto-reconnect is on.
    pub fn new(
        config: NetConfig,
        connector: Arc<dyn Connector>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Arc<Self> {
        let auto_reconnect = config.auto_reconnect;
        let manager = Arc::new(Self {
            relays: RwLock::new(Vec::new()),
            connector,
            events,
            config,
            auto_reconnect: AtomicBool::new(false),
            supervisor: Mutex::new(None),
        });
        if auto_reconnect {
            manager.set_auto_reconnect(true);
        }
        manager
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    /// Register a relay and start connecting to it in the background.
    ///
    /// Adding a URL that is already present is a successful no-op.
    pub async fn add_relay(&self, url: &str) -> Result<(), RelayError> {
        let url = normalize_relay_url(url)?;

        let session = {
            let mut relays = self.relays.write().await;
            if relays.iter().any(|entry| entry.url == url) {
                debug!(relay = %url, "Relay already configured");
                return Ok(());
            }
            let session = Arc::new(RelaySession::new(
                url.clone(),
                self.connector.clone(),
                self.events.clone(),
                self.config.connect_timeout,
            ));
            relays.push(RelayEntry {
                url: url.clone(),
                read: true,
                write: true,
                session: session.clone(),
            });
            session
        };

        info!(relay = %url, "Relay added");
        tokio::spawn(async move {
            if let Err(e) = session.connect().await {
                debug!(relay = %session.url(), error = %e, "Initial connection failed");
            }
        });
        Ok(())
    }

    /// Disconnect and forget a relay. Removing an unknown relay succeeds.
    pub async fn remove_relay(&self, url: &str) -> Result<(), RelayError> {
        let url = normalize_relay_url(url).unwrap_or_else(|_| url.trim().to_string());

        let removed = {
            let mut relays = self.relays.write().await;
            let index = relays.iter().position(|entry| entry.url == url);
            index.map(|index| relays.remove(index))
        };

        if let Some(entry) = removed {
            entry.session.disconnect().await;
            info!(relay = %url, "Relay removed");
        }
        Ok(())
    }

    pub async fn list_relays(&self) -> Vec<RelayEndpoint> {
        let relays = self.relays.read().await;
        let mut endpoints = Vec::with_capacity(relays.len());
        for entry in relays.iter() {
            let snapshot = entry.session.snapshot().await;
            endpoints.push(RelayEndpoint {
                url: entry.url.clone(),
                status: snapshot.status,
                read: entry.read,
                write: entry.write,
                last_latency_ms: snapshot.latency_ms,
                last_error: snapshot.last_error,
            });
        }
        endpoints
    }

    /// Change capability flags only; the connection is left alone.
    pub async fn update_relay(&self, url: &str, read: bool, write: bool) -> Result<(), RelayError> {
        let url = normalize_relay_url(url)?;
        let mut relays = self.relays.write().await;
        let entry = relays
            .iter_mut()
            .find(|entry| entry.url == url)
            .ok_or_else(|| RelayError::UnknownRelay(url.clone()))?;
        entry.read = read;
        entry.write = write;
        debug!(relay = %url, read, write, "Relay flags updated");
        Ok(())
    }

    /// Start or stop the reconnect supervisor. Existing sessions are untouched.
    pub fn set_auto_reconnect(self: &Arc<Self>, enabled: bool) {
        let mut supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = supervisor.take() {
            task.abort();
        }
        self.auto_reconnect.store(enabled, Ordering::SeqCst);

        if enabled {
            *supervisor = Some(spawn_supervisor(
                Arc::downgrade(self),
                self.config.reconnect_interval,
            ));
            info!(interval = ?self.config.reconnect_interval, "Reconnect supervisor started");
        } else {
            info!("Reconnect supervisor stopped");
        }
    }

    pub fn auto_reconnect(&self) -> bool {
        self.auto_reconnect.load(Ordering::SeqCst)
    }

    /// Add the built-in relays if none are configured yet.
    pub async fn bootstrap(&self) {
        if !self.relays.read().await.is_empty() {
            return;
        }
        self.add_defaults().await;
    }

    /// Replace every endpoint with the built-in relay list.
    pub async fn restore_defaults(&self) {
        let removed: Vec<RelayEntry> = self.relays.write().await.drain(..).collect();
        for entry in removed {
            entry.session.disconnect().await;
        }
        self.add_defaults().await;
        info!("Relay list restored to defaults");
    }

    async fn add_defaults(&self) {
        for url in &self.config.default_relays {
            if let Err(e) = self.add_relay(url).await {
                warn!(relay = %url, error = %e, "Skipping invalid default relay");
            }
        }
    }

    /// Attempt a reconnect of every `disconnected` or `error` endpoint.
    ///
    /// Endpoints that are already connecting are skipped. Returns how many
    /// attempts succeeded.
    pub async fn reconnect_now(&self) -> usize {
        let sessions: Vec<Arc<RelaySession>> = self
            .relays
            .read()
            .await
            .iter()
            .map(|entry| entry.session.clone())
            .collect();

        let mut candidates = Vec::new();
        for session in sessions {
            if matches!(
                session.status().await,
                RelayStatus::Disconnected | RelayStatus::Error
            ) {
                candidates.push(session);
            }
        }
        if candidates.is_empty() {
            return 0;
        }

        let attempts = candidates.len();
        let results = join_all(candidates.iter().map(|session| async move {
            match session.connect().await {
                Ok(connected) => connected,
                Err(e) => {
                    debug!(relay = %session.url(), error = %e, "Reconnect failed");
                    false
                }
            }
        }))
        .await;

        let reconnected = results.into_iter().filter(|ok| *ok).count();
        debug!(attempts, reconnected, "Reconnect pass complete");
        reconnected
    }

    /// Wait until at least one relay is connected.
    pub async fn wait_for_connection(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.connected_sessions().await.is_empty() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    pub async fn session(&self, url: &str) -> Option<Arc<RelaySession>> {
        self.relays
            .read()
            .await
            .iter()
            .find(|entry| entry.url == url)
            .map(|entry| entry.session.clone())
    }

    pub async fn connected_sessions(&self) -> Vec<Arc<RelaySession>> {
        self.connected(|_| true).await
    }

    pub async fn is_readable(&self, url: &str) -> bool {
        self.relays
            .read()
            .await
            .iter()
            .any(|entry| entry.url == url && entry.read)
    }

    /// Connected sessions with the `read` flag
    pub async fn readable_sessions(&self) -> Vec<Arc<RelaySession>> {
        self.connected(|entry| entry.read).await
    }

    /// Connected sessions with the `write` flag
    pub async fn writable_sessions(&self) -> Vec<Arc<RelaySession>> {
        self.connected(|entry| entry.write).await
    }

    async fn connected(&self, wanted: impl Fn(&RelayEntry) -> bool) -> Vec<Arc<RelaySession>> {
        let candidates: Vec<Arc<RelaySession>> = self
            .relays
            .read()
            .await
            .iter()
            .filter(|entry| wanted(*entry))
            .map(|entry| entry.session.clone())
            .collect();

        let mut sessions = Vec::with_capacity(candidates.len());
        for session in candidates {
            if session.status().await == RelayStatus::Connected {
                sessions.push(session);
            }
        }
        sessions
    }
}

impl Drop for RelayConnectionManager {
    fn drop(&mut self) {
        if let Some(task) = self
            .supervisor
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

fn spawn_supervisor(manager: Weak<RelayConnectionManager>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(manager) = manager.upgrade() else {
                break;
            };
            let reconnected = manager.reconnect_now().await;
            if reconnected > 0 {
                info!(reconnected, "Supervisor restored relay connections");
            }
        }
    })
}
