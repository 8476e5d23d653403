//! In-memory relay network.
//!
//! Each mock relay stores the events published to it, answers `REQ` with
//! its stored matches followed by `EOSE`, acknowledges `EVENT` with `OK` and
//! forwards new events to every live subscription that matches. Relays can
//! be made unreachable, which also drops their open connections. A stalled
//! relay never completes the handshake; a silent one never sends `EOSE` or
//! `OK`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::channel::mpsc;
use futures::future::{self, BoxFuture};
use futures::{FutureExt, SinkExt, StreamExt};
use tracing::debug;

use courier_shared::{ClientMessage, Filter, RelayMessage, SignedEvent};

use crate::error::ConnectionError;
use crate::transport::{Connector, FrameSink, FrameStream};

#[derive(Clone, Default)]
pub struct MockNetwork {
    inner: Arc<Mutex<NetworkState>>,
}

#[derive(Default)]
struct NetworkState {
    relays: HashMap<String, MockRelay>,
    next_client: u64,
}

struct MockRelay {
    reachable: bool,
    stalled: bool,
    silent: bool,
    reject_events: bool,
    events: Vec<SignedEvent>,
    clients: HashMap<u64, MockClient>,
    req_count: usize,
    connect_count: usize,
}

struct MockClient {
    to_client: mpsc::UnboundedSender<Result<String, ConnectionError>>,
    subscriptions: HashMap<String, Vec<Filter>>,
}

impl MockRelay {
    fn new() -> Self {
        Self {
            reachable: true,
            stalled: false,
            silent: false,
            reject_events: false,
            events: Vec::new(),
            clients: HashMap::new(),
            req_count: 0,
            connect_count: 0,
        }
    }

    /// Store `event` and push it to matching live subscriptions.
    fn accept(&mut self, event: &SignedEvent) {
        if self.events.iter().any(|e| e.id == event.id) {
            return;
        }
        self.events.push(event.clone());

        for client in self.clients.values() {
            for (subscription_id, filters) in &client.subscriptions {
                if filters.iter().any(|f| f.matches(event)) {
                    send(
                        &client.to_client,
                        &RelayMessage::Event {
                            subscription_id: subscription_id.clone(),
                            event: event.clone(),
                        },
                    );
                }
            }
        }
    }
}

fn send(tx: &mpsc::UnboundedSender<Result<String, ConnectionError>>, message: &RelayMessage) {
    if let Ok(frame) = message.to_json() {
        let _ = tx.unbounded_send(Ok(frame));
    }
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, NetworkState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a reachable relay. No-op if it already exists.
    pub fn add_relay(&self, url: &str) {
        self.state()
            .relays
            .entry(url.to_string())
            .or_insert_with(MockRelay::new);
    }

    /// Toggle reachability. Going unreachable drops every open connection.
    pub fn set_reachable(&self, url: &str, reachable: bool) {
        let mut state = self.state();
        if let Some(relay) = state.relays.get_mut(url) {
            relay.reachable = reachable;
            if !reachable {
                relay.clients.clear();
            }
        }
    }

    /// Hold new handshakes open forever.
    pub fn set_stalled(&self, url: &str, stalled: bool) {
        if let Some(relay) = self.state().relays.get_mut(url) {
            relay.stalled = stalled;
        }
    }

    /// Withhold `EOSE` and `OK`. Events are still stored and delivered.
    pub fn set_silent(&self, url: &str, silent: bool) {
        if let Some(relay) = self.state().relays.get_mut(url) {
            relay.silent = silent;
        }
    }

    /// Make the relay answer every `EVENT` with `OK false`.
    pub fn set_reject_events(&self, url: &str, reject: bool) {
        if let Some(relay) = self.state().relays.get_mut(url) {
            relay.reject_events = reject;
        }
    }

    /// Store an event on a relay as if another client had published it.
    pub fn inject_event(&self, url: &str, event: &SignedEvent) {
        if let Some(relay) = self.state().relays.get_mut(url) {
            relay.accept(event);
        }
    }

    pub fn stored_events(&self, url: &str) -> Vec<SignedEvent> {
        self.state()
            .relays
            .get(url)
            .map(|relay| relay.events.clone())
            .unwrap_or_default()
    }

    /// `REQ` frames received by one relay
    pub fn req_count(&self, url: &str) -> usize {
        self.state().relays.get(url).map_or(0, |r| r.req_count)
    }

    /// `REQ` frames received across the network
    pub fn total_req_count(&self) -> usize {
        self.state().relays.values().map(|r| r.req_count).sum()
    }

    pub fn connect_count(&self, url: &str) -> usize {
        self.state().relays.get(url).map_or(0, |r| r.connect_count)
    }

    /// Live subscriptions currently held by a relay
    pub fn open_subscriptions(&self, url: &str) -> usize {
        self.state().relays.get(url).map_or(0, |relay| {
            relay.clients.values().map(|c| c.subscriptions.len()).sum()
        })
    }

    fn handle_frame(&self, url: &str, client_id: u64, frame: &str) {
        let message = match ClientMessage::from_json(frame) {
            Ok(message) => message,
            Err(e) => {
                debug!(relay = %url, error = %e, "Mock relay ignoring frame");
                return;
            }
        };

        let mut state = self.state();
        let Some(relay) = state.relays.get_mut(url) else {
            return;
        };

        match message {
            ClientMessage::Event(event) => {
                let reply = if relay.reject_events {
                    RelayMessage::Ok {
                        event_id: event.id.clone(),
                        accepted: false,
                        message: "blocked: not accepting events".into(),
                    }
                } else {
                    relay.accept(&event);
                    RelayMessage::Ok {
                        event_id: event.id.clone(),
                        accepted: true,
                        message: String::new(),
                    }
                };
                if relay.silent {
                    return;
                }
                if let Some(client) = relay.clients.get(&client_id) {
                    send(&client.to_client, &reply);
                }
            }
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                relay.req_count += 1;
                let stored: Vec<SignedEvent> = relay
                    .events
                    .iter()
                    .filter(|e| filters.iter().any(|f| f.matches(e)))
                    .cloned()
                    .collect();

                let silent = relay.silent;
                if let Some(client) = relay.clients.get_mut(&client_id) {
                    for event in stored {
                        send(
                            &client.to_client,
                            &RelayMessage::Event {
                                subscription_id: subscription_id.clone(),
                                event,
                            },
                        );
                    }
                    if !silent {
                        send(
                            &client.to_client,
                            &RelayMessage::Eose {
                                subscription_id: subscription_id.clone(),
                            },
                        );
                    }
                    client.subscriptions.insert(subscription_id, filters);
                }
            }
            ClientMessage::Close { subscription_id } => {
                if let Some(client) = relay.clients.get_mut(&client_id) {
                    client.subscriptions.remove(&subscription_id);
                }
            }
        }
    }
}

impl Connector for MockNetwork {
    fn connect(
        &self,
        url: &str,
    ) -> BoxFuture<'static, Result<(FrameSink, FrameStream), ConnectionError>> {
        let network = self.clone();
        let url = url.to_string();

        async move {
            let stalled = network
                .state()
                .relays
                .get(&url)
                .is_some_and(|relay| relay.stalled);
            if stalled {
                future::pending::<()>().await;
            }

            let (to_client_tx, to_client_rx) = mpsc::unbounded();
            let (to_relay_tx, mut to_relay_rx) = mpsc::unbounded::<String>();

            let client_id = {
                let mut state = network.state();
                state.next_client += 1;
                let client_id = state.next_client;
                let relay = state
                    .relays
                    .get_mut(&url)
                    .ok_or_else(|| ConnectionError::Handshake(format!("no such relay {url}")))?;
                if !relay.reachable {
                    return Err(ConnectionError::Handshake(format!("{url} unreachable")));
                }
                relay.connect_count += 1;
                relay.clients.insert(
                    client_id,
                    MockClient {
                        to_client: to_client_tx,
                        subscriptions: HashMap::new(),
                    },
                );
                client_id
            };

            let relay_network = network.clone();
            let relay_url = url.clone();
            tokio::spawn(async move {
                while let Some(frame) = to_relay_rx.next().await {
                    relay_network.handle_frame(&relay_url, client_id, &frame);
                }
                if let Some(relay) = relay_network.state().relays.get_mut(&relay_url) {
                    relay.clients.remove(&client_id);
                }
            });

            let sink: FrameSink = Box::pin(
                to_relay_tx.sink_map_err(|e| ConnectionError::Transport(e.to_string())),
            );
            let stream: FrameStream = Box::pin(to_client_rx);
            Ok((sink, stream))
        }
        .boxed()
    }
}
