//! Logical subscriptions and publishing across relay sessions.
//!
//! A dispatcher task consumes every session event. It fans relay `EVENT`s in
//! to the owning subscription (verified, filter-checked and deduplicated by
//! id), folds per-relay `EOSE`/`CLOSED` into a single end-of-stored-events
//! signal, replays `REQ`s on relays that (re)connect, and settles pending
//! publishes when `OK` frames arrive.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures::future::join_all;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use courier_shared::types::normalize_relay_url;
use courier_shared::{ClientMessage, Filter, RelayMessage, SignedEvent};

use crate::config::NetConfig;
use crate::error::{ConnectionError, PublishError, SubscriptionError};
use crate::manager::RelayConnectionManager;
use crate::session::{RelaySession, SessionEvent};

/// Delivered on a subscription's channel.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    Event { relay: String, event: SignedEvent },
    /// Every relay queried has sent its stored events (or given up).
    EndOfStoredEvents,
}

/// Outcome of publishing to one relay.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishResult {
    pub relay: String,
    pub outcome: Result<(), PublishError>,
}

impl PublishResult {
    pub fn is_accepted(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Recently delivered event ids, bounded in insertion order.
struct SeenIds {
    ids: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl SeenIds {
    fn new(capacity: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// `false` if `id` is still remembered.
    fn insert(&mut self, id: &str) -> bool {
        if !self.ids.insert(id.to_string()) {
            return false;
        }
        self.order.push_back(id.to_string());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }
}

struct SubscriptionEntry {
    filters: Vec<Filter>,
    sender: mpsc::UnboundedSender<SubscriptionEvent>,
    seen: SeenIds,
    /// Relays that were sent the `REQ`
    requested: HashSet<String>,
    /// Relays still owing an `EOSE`
    awaiting_eose: HashSet<String>,
    eose_sent: bool,
}

impl SubscriptionEntry {
    fn relay_finished(&mut self, url: &str) {
        if self.awaiting_eose.remove(url) {
            self.maybe_end_stored();
        }
    }

    fn maybe_end_stored(&mut self) {
        if !self.eose_sent && self.awaiting_eose.is_empty() {
            self.eose_sent = true;
            let _ = self.sender.send(SubscriptionEvent::EndOfStoredEvents);
        }
    }
}

type AckSender = oneshot::Sender<Result<(), PublishError>>;

#[derive(Default)]
struct RouterState {
    subscriptions: HashMap<String, SubscriptionEntry>,
    pending_acks: HashMap<(String, String), AckSender>,
}

struct RouterShared {
    manager: Arc<RelayConnectionManager>,
    state: Mutex<RouterState>,
    config: NetConfig,
}

pub struct SubscriptionRouter {
    shared: Arc<RouterShared>,
    dispatcher: JoinHandle<()>,
}

impl SubscriptionRouter {
    /// Spawn the dispatcher over the manager's session events.
    pub fn new(
        manager: Arc<RelayConnectionManager>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
    ) -> Self {
        let config = manager.config().clone();
        let shared = Arc::new(RouterShared {
            manager,
            state: Mutex::new(RouterState::default()),
            config,
        });
        let dispatcher = tokio::spawn(dispatch(shared.clone(), events));
        Self { shared, dispatcher }
    }

    pub fn manager(&self) -> &Arc<RelayConnectionManager> {
        &self.shared.manager
    }

    /// Open a subscription on every connected readable relay.
    ///
    /// Filters are validated before any frame is sent. Relays that connect
    /// later receive the `REQ` when they come up.
    pub async fn subscribe(&self, filters: Vec<Filter>) -> Result<Subscription, SubscriptionError> {
        if filters.is_empty() {
            return Err(SubscriptionError::NoFilters);
        }
        for filter in &filters {
            filter.validate()?;
        }

        let id = uuid::Uuid::new_v4().simple().to_string();
        let (tx, rx) = mpsc::unbounded_channel();

        self.shared.state.lock().await.subscriptions.insert(
            id.clone(),
            SubscriptionEntry {
                filters: filters.clone(),
                sender: tx,
                seen: SeenIds::new(self.shared.config.dedup_capacity),
                requested: HashSet::new(),
                awaiting_eose: HashSet::new(),
                eose_sent: false,
            },
        );

        let readable = self.shared.manager.readable_sessions().await;
        let targets: Vec<Arc<RelaySession>> = {
            let mut state = self.shared.state.lock().await;
            match state.subscriptions.get_mut(&id) {
                Some(entry) => {
                    let targets: Vec<_> = readable
                        .into_iter()
                        .filter(|session| entry.requested.insert(session.url().to_string()))
                        .collect();
                    entry
                        .awaiting_eose
                        .extend(targets.iter().map(|s| s.url().to_string()));
                    entry.maybe_end_stored();
                    targets
                }
                None => Vec::new(),
            }
        };

        let req = ClientMessage::Req {
            subscription_id: id.clone(),
            filters,
        };
        for session in &targets {
            self.shared.send_req(&id, session, &req).await;
        }
        debug!(subscription = %id, relays = targets.len(), "Subscription opened");

        Ok(Subscription {
            id: id.clone(),
            events: rx,
            closer: SubscriptionCloser {
                id,
                shared: Arc::downgrade(&self.shared),
                stopped: Arc::new(AtomicBool::new(false)),
            },
        })
    }

    /// Publish to every connected writable relay, or to `targets` only.
    ///
    /// Each relay settles independently: accepted, rejected, unreachable or
    /// timed out. An empty result means no relay was eligible.
    pub async fn publish(&self, event: &SignedEvent, targets: Option<&[String]>) -> Vec<PublishResult> {
        let mut results = Vec::new();
        let sessions = match targets {
            None => self.shared.manager.writable_sessions().await,
            Some(targets) => {
                let connected = self.shared.manager.connected_sessions().await;
                let mut chosen = Vec::new();
                for target in targets {
                    let url = normalize_relay_url(target).unwrap_or_else(|_| target.clone());
                    match connected.iter().find(|s| s.url() == url) {
                        Some(session) => chosen.push(session.clone()),
                        None => results.push(PublishResult {
                            relay: url,
                            outcome: Err(ConnectionError::NotConnected.into()),
                        }),
                    }
                }
                chosen
            }
        };

        let frame = ClientMessage::Event(event.clone());
        let settled = join_all(
            sessions
                .iter()
                .map(|session| self.shared.publish_to(session, &event.id, &frame)),
        )
        .await;
        results.extend(settled);

        let accepted = results.iter().filter(|r| r.is_accepted()).count();
        info!(
            event_id = %event.id,
            accepted,
            relays = results.len(),
            "Event published"
        );
        results
    }

    /// Number of open subscriptions
    pub async fn active_subscriptions(&self) -> usize {
        self.shared.state.lock().await.subscriptions.len()
    }
}

impl Drop for SubscriptionRouter {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

impl RouterShared {
    async fn send_req(&self, id: &str, session: &RelaySession, req: &ClientMessage) {
        if let Err(e) = session.send(req).await {
            warn!(relay = %session.url(), subscription = %id, error = %e, "Failed to send REQ");
            let mut state = self.state.lock().await;
            if let Some(entry) = state.subscriptions.get_mut(id) {
                entry.requested.remove(session.url());
                entry.relay_finished(session.url());
            }
        }
    }

    async fn publish_to(
        &self,
        session: &RelaySession,
        event_id: &str,
        frame: &ClientMessage,
    ) -> PublishResult {
        let url = session.url().to_string();
        let key = (url.clone(), event_id.to_string());
        let (tx, rx) = oneshot::channel();
        self.state.lock().await.pending_acks.insert(key.clone(), tx);

        if let Err(e) = session.send(frame).await {
            self.state.lock().await.pending_acks.remove(&key);
            return PublishResult {
                relay: url,
                outcome: Err(e.into()),
            };
        }

        let timeout = self.config.publish_timeout;
        let outcome = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ConnectionError::Closed.into()),
            Err(_) => {
                self.state.lock().await.pending_acks.remove(&key);
                Err(PublishError::Timeout(timeout.as_millis() as u64))
            }
        };

        if let Err(e) = &outcome {
            debug!(relay = %url, event_id, error = %e, "Publish not accepted");
        }
        PublishResult { relay: url, outcome }
    }

    async fn close_subscription(&self, id: &str) {
        let requested = match self.state.lock().await.subscriptions.remove(id) {
            Some(entry) => entry.requested,
            None => return,
        };

        let close = ClientMessage::Close {
            subscription_id: id.to_string(),
        };
        for url in requested {
            if let Some(session) = self.manager.session(&url).await {
                if let Err(e) = session.send(&close).await {
                    debug!(relay = %url, subscription = %id, error = %e, "CLOSE not sent");
                }
            }
        }
        debug!(subscription = %id, "Subscription closed");
    }

    async fn on_connected(&self, url: &str) {
        if !self.manager.is_readable(url).await {
            return;
        }
        let Some(session) = self.manager.session(url).await else {
            return;
        };

        let replays: Vec<(String, Vec<Filter>)> = {
            let mut state = self.state.lock().await;
            state
                .subscriptions
                .iter_mut()
                .filter_map(|(id, entry)| {
                    if !entry.requested.insert(url.to_string()) {
                        return None;
                    }
                    if !entry.eose_sent {
                        entry.awaiting_eose.insert(url.to_string());
                    }
                    Some((id.clone(), entry.filters.clone()))
                })
                .collect()
        };

        if !replays.is_empty() {
            debug!(relay = %url, subscriptions = replays.len(), "Replaying subscriptions");
        }
        for (id, filters) in replays {
            let req = ClientMessage::Req {
                subscription_id: id.clone(),
                filters,
            };
            self.send_req(&id, &session, &req).await;
        }
    }

    async fn on_disconnected(&self, url: &str) {
        let mut state = self.state.lock().await;
        for entry in state.subscriptions.values_mut() {
            entry.requested.remove(url);
            entry.relay_finished(url);
        }

        let lost: Vec<(String, String)> = state
            .pending_acks
            .keys()
            .filter(|(relay, _)| relay == url)
            .cloned()
            .collect();
        for key in lost {
            if let Some(ack) = state.pending_acks.remove(&key) {
                let _ = ack.send(Err(ConnectionError::Closed.into()));
            }
        }
    }

    async fn on_message(&self, url: String, message: RelayMessage) {
        match message {
            RelayMessage::Event {
                subscription_id,
                event,
            } => {
                if self.config.verify_events {
                    if let Err(e) = event.verify() {
                        warn!(relay = %url, event_id = %event.id, error = %e, "Dropping invalid event");
                        return;
                    }
                }

                let mut state = self.state.lock().await;
                let Some(entry) = state.subscriptions.get_mut(&subscription_id) else {
                    debug!(relay = %url, subscription = %subscription_id, "Event for unknown subscription");
                    return;
                };
                if !entry.filters.iter().any(|f| f.matches(&event)) {
                    debug!(relay = %url, event_id = %event.id, "Event does not match subscription");
                    return;
                }
                if !entry.seen.insert(&event.id) {
                    return;
                }
                let _ = entry.sender.send(SubscriptionEvent::Event { relay: url, event });
            }

            RelayMessage::Eose { subscription_id } => {
                let mut state = self.state.lock().await;
                if let Some(entry) = state.subscriptions.get_mut(&subscription_id) {
                    entry.relay_finished(&url);
                }
            }

            RelayMessage::Closed {
                subscription_id,
                message,
            } => {
                warn!(relay = %url, subscription = %subscription_id, reason = %message, "Relay closed subscription");
                let mut state = self.state.lock().await;
                if let Some(entry) = state.subscriptions.get_mut(&subscription_id) {
                    entry.requested.remove(&url);
                    entry.relay_finished(&url);
                }
            }

            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => {
                let ack = self
                    .state
                    .lock()
                    .await
                    .pending_acks
                    .remove(&(url.clone(), event_id.clone()));
                match ack {
                    Some(ack) => {
                        let result = if accepted {
                            Ok(())
                        } else {
                            Err(PublishError::Rejected(message))
                        };
                        let _ = ack.send(result);
                    }
                    None => debug!(relay = %url, event_id = %event_id, "Unsolicited OK"),
                }
            }

            RelayMessage::Notice { message } => {
                info!(relay = %url, notice = %message, "Relay notice");
            }

            RelayMessage::Auth { .. } => {
                debug!(relay = %url, "Ignoring AUTH challenge");
            }
        }
    }
}

async fn dispatch(shared: Arc<RouterShared>, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Connected { url } => shared.on_connected(&url).await,
            SessionEvent::Disconnected { url, .. } => shared.on_disconnected(&url).await,
            SessionEvent::Message { url, message } => shared.on_message(url, message).await,
        }
    }
    debug!("Session event channel closed, dispatcher exiting");
}

/// Receiving end of a subscription.
///
/// Dropping the handle closes the subscription in the background.
pub struct Subscription {
    id: String,
    events: mpsc::UnboundedReceiver<SubscriptionEvent>,
    closer: SubscriptionCloser,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next event, or `None` once stopped.
    pub async fn next(&mut self) -> Option<SubscriptionEvent> {
        if self.closer.is_stopped() {
            return None;
        }
        let event = self.events.recv().await?;
        if self.closer.is_stopped() {
            return None;
        }
        Some(event)
    }

    /// A cloneable handle that can stop this subscription from elsewhere.
    pub fn closer(&self) -> SubscriptionCloser {
        self.closer.clone()
    }

    pub async fn stop(&self) {
        self.closer.stop().await;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.closer.is_stopped() {
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let closer = self.closer.clone();
            runtime.spawn(async move { closer.stop().await });
        }
    }
}

#[derive(Clone)]
pub struct SubscriptionCloser {
    id: String,
    shared: Weak<RouterShared>,
    stopped: Arc<AtomicBool>,
}

impl SubscriptionCloser {
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Release the relay-level subscriptions. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(shared) = self.shared.upgrade() {
            shared.close_subscription(&self.id).await;
        }
    }
}
