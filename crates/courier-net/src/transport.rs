//! Framed text transport to a relay.
//!
//! Sessions only see a sink and a stream of JSON text frames, so the
//! websocket client can be swapped for an in-memory network in tests.

use std::pin::Pin;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{FutureExt, Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

use crate::error::ConnectionError;

pub type FrameSink = Pin<Box<dyn Sink<String, Error = ConnectionError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, ConnectionError>> + Send>>;

/// Opens framed connections to relay URLs.
pub trait Connector: Send + Sync + 'static {
    fn connect(
        &self,
        url: &str,
    ) -> BoxFuture<'static, Result<(FrameSink, FrameStream), ConnectionError>>;
}

/// Websocket transport over `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    handshake_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(handshake_timeout: Duration) -> Self {
        Self { handshake_timeout }
    }
}

impl Connector for WebSocketConnector {
    fn connect(
        &self,
        url: &str,
    ) -> BoxFuture<'static, Result<(FrameSink, FrameStream), ConnectionError>> {
        let url = url.to_string();
        let handshake_timeout = self.handshake_timeout;

        async move {
            let (ws, response) =
                tokio::time::timeout(handshake_timeout, connect_async(url.as_str()))
                    .await
                    .map_err(|_| ConnectionError::Timeout(handshake_timeout.as_secs()))?
                    .map_err(|e| ConnectionError::Handshake(e.to_string()))?;
            debug!(relay = %url, status = %response.status(), "Websocket handshake complete");

            let (write, read) = ws.split();

            let sink = write
                .sink_map_err(|e| ConnectionError::Transport(e.to_string()))
                .with(|frame: String| {
                    futures::future::ready(Ok::<_, ConnectionError>(Message::text(frame)))
                });

            let stream = read.filter_map(|msg| async move {
                match msg {
                    Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                    Ok(Message::Close(_)) => Some(Err(ConnectionError::Closed)),
                    // ping/pong are answered by tungstenite; relays never send binary
                    Ok(_) => None,
                    Err(e) => Some(Err(ConnectionError::Transport(e.to_string()))),
                }
            });

            let sink: FrameSink = Box::pin(sink);
            let stream: FrameStream = Box::pin(stream);
            Ok((sink, stream))
        }
        .boxed()
    }
}
