//! One physical connection to one relay.
//!
//! A session owns the socket lifecycle: `connect` performs the handshake and
//! hands the framed connection to a dedicated I/O task, which forwards parsed
//! relay frames on the shared event channel and writes queued client frames.
//! Every connect bumps a generation counter so a stale I/O task can never
//! overwrite the state of a newer connection.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use courier_shared::{ClientMessage, RelayMessage};

use crate::error::ConnectionError;
use crate::transport::{Connector, FrameSink, FrameStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Emitted by sessions on the channel shared with the router.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected { url: String },
    Disconnected { url: String, error: Option<String> },
    Message { url: String, message: RelayMessage },
}

/// Point-in-time view of a session's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub status: RelayStatus,
    pub latency_ms: Option<u64>,
    pub last_error: Option<String>,
}

struct SessionState {
    status: RelayStatus,
    latency_ms: Option<u64>,
    last_error: Option<String>,
    outgoing: Option<mpsc::UnboundedSender<String>>,
    io_task: Option<JoinHandle<()>>,
    generation: u64,
}

pub struct RelaySession {
    url: String,
    connector: Arc<dyn Connector>,
    events: mpsc::UnboundedSender<SessionEvent>,
    connect_timeout: Duration,
    state: Arc<Mutex<SessionState>>,
}

impl RelaySession {
    pub fn new(
        url: String,
        connector: Arc<dyn Connector>,
        events: mpsc::UnboundedSender<SessionEvent>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            url,
            connector,
            events,
            connect_timeout,
            state: Arc::new(Mutex::new(SessionState {
                status: RelayStatus::Disconnected,
                latency_ms: None,
                last_error: None,
                outgoing: None,
                io_task: None,
                generation: 0,
            })),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn status(&self) -> RelayStatus {
        self.state.lock().await.status
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.lock().await;
        SessionSnapshot {
            status: state.status,
            latency_ms: state.latency_ms,
            last_error: state.last_error.clone(),
        }
    }

    /// Connect unless already connected or connecting.
    ///
    /// A handshake that outlasts the connect timeout leaves the session in
    /// `Error`.
    ///
    /// Returns `Ok(false)` when the call was skipped because another attempt
    /// owns the session.
    pub async fn connect(&self) -> Result<bool, ConnectionError> {
        let generation = {
            let mut state = self.state.lock().await;
            if matches!(state.status, RelayStatus::Connecting | RelayStatus::Connected) {
                return Ok(false);
            }
            state.status = RelayStatus::Connecting;
            state.generation += 1;
            state.generation
        };

        debug!(relay = %self.url, "Connecting");
        let started = Instant::now();
        let handshake = self.connector.connect(&self.url);
        let result = match tokio::time::timeout(self.connect_timeout, handshake).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout(self.connect_timeout.as_secs())),
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        let mut state = self.state.lock().await;
        if state.generation != generation {
            // disconnect() ran during the handshake
            debug!(relay = %self.url, "Connection attempt superseded");
            return Err(ConnectionError::Closed);
        }

        match result {
            Ok((sink, stream)) => {
                let (tx, rx) = mpsc::unbounded_channel();
                state.status = RelayStatus::Connected;
                state.latency_ms = Some(latency_ms);
                state.last_error = None;
                state.outgoing = Some(tx);

                let _ = self.events.send(SessionEvent::Connected {
                    url: self.url.clone(),
                });
                state.io_task = Some(tokio::spawn(run_io(
                    self.url.clone(),
                    generation,
                    sink,
                    stream,
                    rx,
                    self.events.clone(),
                    self.state.clone(),
                )));

                info!(relay = %self.url, latency_ms, "Relay connected");
                Ok(true)
            }
            Err(e) => {
                state.status = RelayStatus::Error;
                state.latency_ms = Some(latency_ms);
                state.last_error = Some(e.to_string());
                warn!(relay = %self.url, error = %e, "Relay connection failed");
                Err(e)
            }
        }
    }

    /// Queue a frame for the relay.
    pub async fn send(&self, message: &ClientMessage) -> Result<(), ConnectionError> {
        let frame = message
            .to_json()
            .map_err(|e| ConnectionError::Encode(e.to_string()))?;

        let state = self.state.lock().await;
        match (&state.status, &state.outgoing) {
            (RelayStatus::Connected, Some(tx)) => {
                tx.send(frame).map_err(|_| ConnectionError::NotConnected)
            }
            _ => Err(ConnectionError::NotConnected),
        }
    }

    /// Close the connection. The I/O task flushes and closes the socket.
    pub async fn disconnect(&self) {
        let mut state = self.state.lock().await;
        let was_connected = state.status == RelayStatus::Connected;

        state.generation += 1;
        state.status = RelayStatus::Disconnected;
        state.outgoing = None;
        state.io_task = None;

        if was_connected {
            info!(relay = %self.url, "Relay disconnected");
            let _ = self.events.send(SessionEvent::Disconnected {
                url: self.url.clone(),
                error: None,
            });
        }
    }
}

async fn run_io(
    url: String,
    generation: u64,
    mut sink: FrameSink,
    mut stream: FrameStream,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<SessionEvent>,
    state: Arc<Mutex<SessionState>>,
) {
    let failure: Option<ConnectionError> = loop {
        tokio::select! {
            frame = outgoing.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = sink.send(frame).await {
                        break Some(e);
                    }
                }
                None => {
                    // session dropped our sender: local disconnect
                    let _ = sink.close().await;
                    return;
                }
            },

            incoming = stream.next() => match incoming {
                Some(Ok(text)) => match RelayMessage::from_json(&text) {
                    Ok(message) => {
                        let _ = events.send(SessionEvent::Message {
                            url: url.clone(),
                            message,
                        });
                    }
                    Err(e) => debug!(relay = %url, error = %e, "Dropping unparseable frame"),
                },
                Some(Err(ConnectionError::Closed)) | None => break None,
                Some(Err(e)) => break Some(e),
            },
        }
    };

    let mut state = state.lock().await;
    if state.generation != generation {
        return;
    }

    state.outgoing = None;
    state.io_task = None;
    match &failure {
        Some(e) => {
            state.status = RelayStatus::Error;
            state.last_error = Some(e.to_string());
            warn!(relay = %url, error = %e, "Relay connection lost");
        }
        None => {
            state.status = RelayStatus::Disconnected;
            info!(relay = %url, "Relay closed the connection");
        }
    }

    let _ = events.send(SessionEvent::Disconnected {
        url,
        error: failure.map(|e| e.to_string()),
    });
}
