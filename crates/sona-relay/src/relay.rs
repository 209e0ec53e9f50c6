//! Gateway server and per-connection pairing.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use axum::routing::get;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use sona_realtime::{DEFAULT_MODEL, DEFAULT_UPSTREAM_URL, SessionController, UpstreamConfig};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Upstream event types relayed downstream inside the `realtime.event`
/// wrapper. Everything else is dropped before reaching downstream.
const RELAYED_EVENT_TYPES: &[&str] = &[
    "response.create",
    "input_audio_buffer.commit",
    "input_audio_buffer.append",
    "response.audio_transcript.done",
    "response.content_part.done",
    "response.output_item.done",
    "response.done",
    "conversation.item.created",
    "conversation.item.appended",
    "conversation.item.completed",
    "conversation.updated",
    "realtime.event",
];

/// Whether a wrapped event of this inner type passes the relay filter.
#[must_use]
pub fn is_relayed_event(event_type: &str) -> bool {
    RELAYED_EVENT_TYPES.contains(&event_type)
}

/// Gateway configuration.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Upstream credential. Held by the gateway, never relayed downstream.
    pub api_key: String,
    /// Bind host.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Upstream endpoint.
    pub upstream_url: String,
    /// Model used when the connection request names none.
    pub default_model: String,
}

impl RelayConfig {
    /// Configuration with default host/port/endpoint/model.
    #[must_use]
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            host: "127.0.0.1".to_string(),
            port: 4000,
            upstream_url: DEFAULT_UPSTREAM_URL.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
        }
    }
}

/// Gateway startup failures.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Binding or serving the listener failed.
    #[error("relay server error: {0}")]
    Io(#[from] std::io::Error),
}

/// The gateway server.
pub struct Relay {
    config: RelayConfig,
}

impl Relay {
    /// Create a gateway for `config`.
    #[must_use]
    pub fn new(config: RelayConfig) -> Self {
        Self { config }
    }

    /// The axum router serving the WebSocket endpoint.
    #[must_use]
    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(ws_upgrade))
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::new(self.config.clone()))
    }

    /// Bind and serve until the process exits.
    pub async fn listen(&self) -> Result<(), RelayError> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        let addr = listener.local_addr()?;
        info!("listening on ws://{addr}");
        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}

async fn ws_upgrade(
    State(config): State<Arc<RelayConfig>>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let model = params
        .get("model")
        .cloned()
        .unwrap_or_else(|| config.default_model.clone());
    ws.on_upgrade(move |socket| handle_connection(config, socket, model))
}

/// Frames queued for the downstream writer.
enum DownstreamFrame {
    Event(String),
    Close,
}

/// One downstream connection: its own session controller and upstream
/// connection, never shared with other clients.
async fn handle_connection(config: Arc<RelayConfig>, socket: WebSocket, model: String) {
    info!(%model, "downstream connection opened");
    let (sink, mut inbound) = socket.split();
    let (frames_tx, frames_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_downstream(sink, frames_rx));

    let controller = SessionController::new(UpstreamConfig {
        url: config.upstream_url.clone(),
        api_key: Some(config.api_key.clone()),
    });

    // Raw mirror: every upstream frame, verbatim, best effort.
    let (observer_tx, mut observer_rx) = mpsc::unbounded_channel();
    controller.set_observer(observer_tx);
    let mirror = {
        let frames = frames_tx.clone();
        tokio::spawn(async move {
            while let Some(raw) = observer_rx.recv().await {
                if frames.send(DownstreamFrame::Event(raw)).is_err() {
                    return;
                }
            }
        })
    };

    attach_relay_handlers(&controller, &frames_tx);

    if let Err(e) = controller.connect(&model).await {
        error!(error = %e, "failed to open upstream session");
        let _ = frames_tx.send(DownstreamFrame::Close);
        mirror.abort();
        let _ = writer.await;
        return;
    }

    // Diagnostic shadow map of item ids seen from downstream; logging only.
    let mut known_items: HashMap<String, Value> = HashMap::new();
    while let Some(message) = inbound.next().await {
        match message {
            Ok(WsMessage::Text(text)) => {
                handle_downstream_event(&controller, &mut known_items, text.as_str());
            }
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "downstream read failed");
                break;
            }
        }
    }

    controller.disconnect();
    let _ = frames_tx.send(DownstreamFrame::Close);
    mirror.abort();
    info!("downstream connection closed");
}

/// Single serialized writer for the downstream socket.
async fn write_downstream(
    mut sink: SplitSink<WebSocket, WsMessage>,
    mut frames: mpsc::UnboundedReceiver<DownstreamFrame>,
) {
    while let Some(frame) = frames.recv().await {
        match frame {
            DownstreamFrame::Event(text) => {
                if sink.send(WsMessage::Text(text.into())).await.is_err() {
                    return;
                }
            }
            DownstreamFrame::Close => {
                let _ = sink.send(WsMessage::Close(None)).await;
                return;
            }
        }
    }
}

/// Subscribe the relayed event surface: filtered `realtime.event` wrappers,
/// every `conversation.updated`, and upstream closure.
fn attach_relay_handlers(
    controller: &SessionController,
    frames: &mpsc::UnboundedSender<DownstreamFrame>,
) {
    {
        let frames = frames.clone();
        let _ = controller.bus().on("realtime.event", move |event| {
            let inner_type = event
                .get("event")
                .and_then(|e| e.get("type"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            if is_relayed_event(inner_type) {
                let _ = frames.send(DownstreamFrame::Event(wrap_event("realtime.event", event)));
            } else {
                debug!(event_type = inner_type, "skipping non-relayed event");
            }
            Ok(())
        });
    }
    {
        let frames = frames.clone();
        let _ = controller.bus().on("conversation.updated", move |event| {
            let _ = frames.send(DownstreamFrame::Event(wrap_event(
                "conversation.updated",
                event,
            )));
            Ok(())
        });
    }
    {
        let frames = frames.clone();
        let _ = controller.bus().on("close", move |_| {
            let _ = frames.send(DownstreamFrame::Close);
            Ok(())
        });
    }
}

/// Stamp a wrapper payload with its own `type` discriminator so downstream
/// can demux the synthetic categories.
fn wrap_event(event_type: &str, payload: &Value) -> String {
    let mut framed = payload.as_object().cloned().unwrap_or_default();
    let _ = framed.insert(
        "type".to_string(),
        Value::String(event_type.to_string()),
    );
    Value::Object(framed).to_string()
}

/// Parse a downstream message and forward it upstream verbatim as a client
/// intent event.
fn handle_downstream_event(
    controller: &SessionController,
    known_items: &mut HashMap<String, Value>,
    text: &str,
) {
    let event: Value = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "dropping undecodable downstream message");
            return;
        }
    };
    let Some(event_type) = event.get("type").and_then(Value::as_str).map(str::to_string)
    else {
        warn!("dropping downstream message without a type discriminator");
        return;
    };
    debug!(event_type, "downstream event");

    track_items(known_items, &event_type, &event);

    if let Err(e) = controller.send(&event_type, event) {
        warn!(event_type, error = %e, "failed to forward downstream event upstream");
    }
}

fn track_items(known_items: &mut HashMap<String, Value>, event_type: &str, event: &Value) {
    if event_type == "conversation.item.created" {
        if let Some(id) = event
            .get("item")
            .and_then(|item| item.get("id"))
            .and_then(Value::as_str)
        {
            let _ = known_items.insert(id.to_string(), event["item"].clone());
        }
    } else if let Some(item_id) = event.get("item_id").and_then(Value::as_str) {
        if !known_items.contains_key(item_id) {
            warn!(item_id, "downstream referenced an untracked item");
            let _ = known_items.insert(item_id.to_string(), json!({"id": item_id}));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_list_passes_lifecycle_events() {
        for event_type in [
            "conversation.item.created",
            "response.output_item.done",
            "response.done",
            "input_audio_buffer.append",
        ] {
            assert!(is_relayed_event(event_type), "{event_type} should relay");
        }
    }

    #[test]
    fn allow_list_drops_everything_else() {
        for event_type in [
            "session.created",
            "response.audio.delta",
            "response.text.delta",
            "rate_limits.updated",
            "",
        ] {
            assert!(!is_relayed_event(event_type), "{event_type} should drop");
        }
    }

    #[test]
    fn wrapped_events_carry_their_own_discriminator() {
        let payload = json!({"time": "t", "source": "server", "event": {"type": "response.done"}});
        let framed: Value = serde_json::from_str(&wrap_event("realtime.event", &payload)).unwrap();
        assert_eq!(framed["type"], "realtime.event");
        assert_eq!(framed["source"], "server");
        assert_eq!(framed["event"]["type"], "response.done");
    }

    #[test]
    fn track_items_registers_created_items() {
        let mut known = HashMap::new();
        track_items(
            &mut known,
            "conversation.item.created",
            &json!({"item": {"id": "i1", "type": "message"}}),
        );
        assert_eq!(known["i1"]["type"], "message");
    }

    #[test]
    fn track_items_placeholders_unknown_references() {
        let mut known = HashMap::new();
        track_items(
            &mut known,
            "conversation.item.truncate",
            &json!({"item_id": "ghost"}),
        );
        assert_eq!(known["ghost"], json!({"id": "ghost"}));
    }

    #[test]
    fn default_config_points_at_the_public_endpoint() {
        let config = RelayConfig::new("sk-test".into());
        assert_eq!(config.port, 4000);
        assert_eq!(config.upstream_url, DEFAULT_UPSTREAM_URL);
        assert_eq!(config.default_model, DEFAULT_MODEL);
    }
}
