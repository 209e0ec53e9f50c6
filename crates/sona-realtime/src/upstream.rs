//! Upstream WebSocket lifecycle: connect, pumps, keepalive, envelope
//! stamping.
//!
//! One [`UpstreamConnection`] owns exactly one transport to the upstream
//! realtime API. Every inbound envelope is republished on the connection's
//! bus as `server.<type>` and `server.*` (and mirrored best-effort to an
//! attached observer channel); every outbound envelope is published as
//! `client.<type>` and `client.*` *before* transmission. Transmission is
//! fire-and-forget through a single serialized writer task per socket, so
//! wire order among this socket's sends is preserved.

use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use sona_bus::EventBus;
use sona_core::errors::{ConnectionError, ProtocolError};
use sona_core::ids::generate_id;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};

use crate::ClientError;

/// Default upstream endpoint.
pub const DEFAULT_UPSTREAM_URL: &str = "wss://api.openai.com/v1/realtime";

/// Model used when a connection request does not name one.
pub const DEFAULT_MODEL: &str = "gpt-4o-realtime-preview-2024-10-01";

/// Subprotocols announced during the handshake.
const SUBPROTOCOLS: &str = "realtime, openai-beta.realtime-v1";

/// Liveness ping interval.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Endpoint and credential for one upstream connection.
#[derive(Clone, Debug)]
pub struct UpstreamConfig {
    /// WebSocket endpoint, without query parameters.
    pub url: String,
    /// Bearer credential; required to connect.
    pub api_key: Option<String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_UPSTREAM_URL.to_string(),
            api_key: None,
        }
    }
}

#[derive(Default)]
struct ConnState {
    outbound: Option<mpsc::UnboundedSender<Message>>,
    observer: Option<mpsc::UnboundedSender<String>>,
    tasks: Vec<JoinHandle<()>>,
}

/// One transport to the upstream realtime API.
pub struct UpstreamConnection {
    config: UpstreamConfig,
    bus: Arc<EventBus>,
    state: Mutex<ConnState>,
    /// Self-handle for the background tasks; they must never keep the
    /// connection alive on their own.
    weak: Weak<Self>,
}

impl UpstreamConnection {
    /// Create a disconnected upstream handle.
    #[must_use]
    pub fn new(config: UpstreamConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            config,
            bus: Arc::new(EventBus::new()),
            state: Mutex::new(ConnState::default()),
            weak: weak.clone(),
        })
    }

    /// Bus carrying `client.*` / `server.*` / `close` topics for this
    /// connection.
    #[must_use]
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Whether the transport is currently open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state
            .lock()
            .outbound
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Attach a channel that receives a best-effort mirror of every raw
    /// inbound frame. Mirror failures are logged, never fatal.
    pub fn set_observer(&self, observer: mpsc::UnboundedSender<String>) {
        self.state.lock().observer = Some(observer);
    }

    /// Open the transport for `model` and start the inbound pump, the
    /// serialized writer, and the keepalive monitor.
    pub async fn connect(&self, model: &str) -> Result<(), ClientError> {
        if self.is_connected() {
            return Err(ConnectionError::AlreadyConnected.into());
        }
        let Some(api_key) = self.config.api_key.clone() else {
            return Err(ConnectionError::MissingCredential.into());
        };

        let url = if model.is_empty() {
            self.config.url.clone()
        } else {
            format!("{}?model={model}", self.config.url)
        };
        let mut request =
            url.as_str()
                .into_client_request()
                .map_err(|e| ConnectionError::ConnectFailed {
                    url: url.clone(),
                    reason: e.to_string(),
                })?;
        let authorization = HeaderValue::from_str(&format!("Bearer {api_key}")).map_err(|e| {
            ConnectionError::ConnectFailed {
                url: url.clone(),
                reason: e.to_string(),
            }
        })?;
        let _ = request.headers_mut().insert(AUTHORIZATION, authorization);
        let _ = request
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOLS));

        let (socket, _response) =
            connect_async(request)
                .await
                .map_err(|e| ConnectionError::ConnectFailed {
                    url: url.clone(),
                    reason: e.to_string(),
                })?;
        info!(url = %self.config.url, %model, "connected to upstream");

        let (sink, stream) = socket.split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let mut state = self.state.lock();
        state.outbound = Some(outbound_tx);
        // The writer ends on its own once the outbound channel closes, which
        // lets it send a close frame on graceful disconnect.
        let _ = tokio::spawn(Self::write_loop(self.weak.clone(), sink, outbound_rx));
        state
            .tasks
            .push(tokio::spawn(Self::read_loop(self.weak.clone(), stream)));
        state
            .tasks
            .push(tokio::spawn(Self::keepalive_loop(self.weak.clone())));
        Ok(())
    }

    /// Stamp and publish an outbound envelope, then queue it for
    /// transmission without waiting for delivery.
    ///
    /// `data` must be a JSON object (or null for an empty payload). The
    /// `client.<type>` / `client.*` topics fire before the frame is queued.
    pub fn send(&self, event_type: &str, data: Value) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected.into());
        }
        let envelope = Value::Object(build_envelope(event_type, data)?);
        self.bus.dispatch(&format!("client.{event_type}"), &envelope)?;
        self.bus.dispatch("client.*", &envelope)?;
        debug!(event_type, "queueing upstream event");
        self.enqueue(Message::Text(envelope.to_string().into()))?;
        Ok(())
    }

    /// Tear the connection down. Idempotent.
    pub fn disconnect(&self) {
        let (outbound, tasks) = {
            let mut state = self.state.lock();
            (state.outbound.take(), std::mem::take(&mut state.tasks))
        };
        if outbound.is_some() {
            info!("upstream disconnected");
        }
        for task in tasks {
            task.abort();
        }
    }

    fn enqueue(&self, message: Message) -> Result<(), ConnectionError> {
        let sender = self
            .state
            .lock()
            .outbound
            .clone()
            .ok_or(ConnectionError::NotConnected)?;
        sender.send(message).map_err(|_| ConnectionError::Closed)
    }

    fn notify_close(&self, errored: bool) {
        if let Err(e) = self.bus.dispatch("close", &json!({"error": errored})) {
            error!(error = %e, "close handler failed");
        }
    }

    /// Decode one inbound frame, republish it, and mirror it to the
    /// observer. Malformed frames are logged and dropped; the socket stays
    /// open.
    fn handle_incoming(&self, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "dropping undecodable upstream message");
                return;
            }
        };
        let Some(event_type) = value.get("type").and_then(Value::as_str).map(str::to_string)
        else {
            warn!("dropping upstream message without a type discriminator");
            return;
        };

        if let Err(e) = self.bus.dispatch(&format!("server.{event_type}"), &value) {
            error!(event_type, error = %e, "server event handler failed");
        }
        if let Err(e) = self.bus.dispatch("server.*", &value) {
            error!(event_type, error = %e, "server wildcard handler failed");
        }

        let observer = self.state.lock().observer.clone();
        if let Some(observer) = observer {
            if observer.send(text.to_string()).is_err() {
                debug!("observer channel closed; skipping mirror");
            }
        }
    }

    async fn write_loop(
        conn: Weak<Self>,
        mut sink: WsSink,
        mut outbound: mpsc::UnboundedReceiver<Message>,
    ) {
        while let Some(message) = outbound.recv().await {
            if let Err(e) = sink.send(message).await {
                warn!(error = %e, "upstream write failed");
                if let Some(conn) = conn.upgrade() {
                    conn.notify_close(true);
                    conn.disconnect();
                }
                return;
            }
        }
        // Channel closed by an explicit disconnect — close the socket
        // politely.
        let _ = sink.close().await;
    }

    async fn read_loop(conn: Weak<Self>, mut stream: WsStream) {
        let mut errored = false;
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    let Some(conn) = conn.upgrade() else { return };
                    conn.handle_incoming(text.as_str());
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "upstream read failed");
                    errored = true;
                    break;
                }
            }
        }
        let Some(conn) = conn.upgrade() else { return };
        debug!(errored, "upstream socket closed");
        conn.notify_close(errored);
        conn.disconnect();
    }

    async fn keepalive_loop(conn: Weak<Self>) {
        loop {
            tokio::time::sleep(KEEPALIVE_INTERVAL).await;
            let Some(conn) = conn.upgrade() else { return };
            if !conn.is_connected() {
                return;
            }
            if conn.enqueue(Message::Ping(Bytes::new())).is_err() {
                // A failed ping is connection loss, not a transient error.
                warn!("keepalive ping failed; tearing down upstream connection");
                conn.notify_close(true);
                conn.disconnect();
                return;
            }
        }
    }
}

impl Drop for UpstreamConnection {
    fn drop(&mut self) {
        for task in std::mem::take(&mut self.state.get_mut().tasks) {
            task.abort();
        }
    }
}

/// Build the outbound envelope: stamp `type`, generate an `event_id` only
/// when the caller did not supply one.
fn build_envelope(event_type: &str, data: Value) -> Result<Map<String, Value>, ProtocolError> {
    let mut envelope = match data {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        _ => return Err(ProtocolError::NonObjectPayload),
    };
    let _ = envelope.insert("type".to_string(), Value::String(event_type.to_string()));
    if !envelope.contains_key("event_id") {
        let _ = envelope.insert(
            "event_id".to_string(),
            Value::String(generate_id("evt_")),
        );
    }
    Ok(envelope)
}
