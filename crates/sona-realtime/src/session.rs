//! Caller-facing session operations and event wiring.
//!
//! A [`SessionController`] composes one [`UpstreamConnection`] with one
//! [`Conversation`] and owns everything session-scoped: the running
//! configuration, the tool registry, and the local input-audio accumulator.
//! All of that state lives in a single per-connection mutex — connections
//! never share anything, so there is no cross-connection locking.
//!
//! The controller's own bus carries the derived event surface:
//! `realtime.event` (raw observability wrapper), `conversation.updated`,
//! `conversation.item.appended` / `.completed`, `conversation.interrupted`,
//! and `close`.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::{Value, json};
use sona_bus::{BoxError, EventBus, HandlerResult};
use sona_core::audio::{SAMPLE_RATE_HZ, encode_base64};
use sona_core::errors::{ConnectionError, ValidationError};
use tokio::sync::mpsc;
use tracing::warn;

use crate::ClientError;
use crate::conversation::{Conversation, EngineUpdate};
use crate::types::{
    FormattedTool, Item, ItemDetail, ItemStatus, Role, SessionConfig, SessionTool, SessionUpdate,
    ToolDefinition, UserContent,
};
use crate::upstream::{UpstreamConfig, UpstreamConnection};

/// Boxed future returned by tool handlers.
pub type ToolHandlerFuture = Pin<Box<dyn Future<Output = Result<Value, BoxError>> + Send>>;

type ToolHandler = Arc<dyn Fn(Value) -> ToolHandlerFuture + Send + Sync>;

struct ToolRegistration {
    definition: ToolDefinition,
    handler: ToolHandler,
}

#[derive(Default)]
struct SessionState {
    session_created: bool,
    config: SessionConfig,
    tools: IndexMap<String, ToolRegistration>,
    input_audio_buffer: Vec<u8>,
    conversation: Conversation,
}

/// One session: an upstream connection, a reconstructed conversation, and
/// the operations that drive them.
#[derive(Clone)]
pub struct SessionController {
    upstream: Arc<UpstreamConnection>,
    bus: Arc<EventBus>,
    state: Arc<Mutex<SessionState>>,
}

impl SessionController {
    /// Create a controller with its internal wiring attached.
    #[must_use]
    pub fn new(config: UpstreamConfig) -> Self {
        let controller = Self {
            upstream: UpstreamConnection::new(config),
            bus: Arc::new(EventBus::new()),
            state: Arc::new(Mutex::new(SessionState::default())),
        };
        controller.attach_upstream_handlers();
        controller
    }

    /// Bus carrying the controller-level event surface.
    #[must_use]
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Whether the upstream transport is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.upstream.is_connected()
    }

    /// Mirror raw upstream frames into `observer`, best effort.
    pub fn set_observer(&self, observer: mpsc::UnboundedSender<String>) {
        self.upstream.set_observer(observer);
    }

    /// Connect upstream and transmit the initial session configuration.
    pub async fn connect(&self, model: &str) -> Result<(), ClientError> {
        self.upstream.connect(model).await?;
        self.update_session(SessionUpdate::default())
    }

    /// Suspend until upstream has announced the session.
    pub async fn wait_for_session_created(&self) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected.into());
        }
        while !self.state.lock().session_created {
            let _ = self
                .upstream
                .bus()
                .wait_for("server.session.created", Some(Duration::from_millis(100)))
                .await;
        }
        Ok(())
    }

    /// Tear down the transport and drop all reconstructed conversation
    /// state. Idempotent.
    pub fn disconnect(&self) {
        {
            let mut session = self.state.lock();
            session.session_created = false;
            session.conversation.clear();
        }
        self.upstream.disconnect();
    }

    /// Return the controller to newly-constructed behavior: disconnect,
    /// drop every subscription (external ones included), restore default
    /// configuration and tools, and re-attach internal wiring.
    pub fn reset(&self) {
        self.disconnect();
        self.bus.clear();
        self.upstream.bus().clear();
        *self.state.lock() = SessionState::default();
        self.attach_upstream_handlers();
    }

    /// Merge the supplied overrides into the running configuration and, if
    /// connected, transmit the full session payload (config + computed tool
    /// list).
    pub fn update_session(&self, update: SessionUpdate) -> Result<(), ClientError> {
        let session_payload = {
            let mut session = self.state.lock();
            let adhoc = session.config.apply(update);
            let mut tools: Vec<SessionTool> = adhoc.into_iter().map(SessionTool::from).collect();
            tools.extend(
                session
                    .tools
                    .values()
                    .map(|t| SessionTool::from(t.definition.clone())),
            );
            let mut payload = serde_json::to_value(&session.config)?;
            payload["tools"] = serde_json::to_value(&tools)?;
            payload
        };
        if self.upstream.is_connected() {
            self.upstream
                .send("session.update", json!({"session": session_payload}))?;
        }
        Ok(())
    }

    /// Register a tool and resync the session.
    ///
    /// Fails when the definition has no name or the name is taken.
    pub fn add_tool<F, Fut>(&self, definition: ToolDefinition, handler: F) -> Result<(), ClientError>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
    {
        if definition.name.is_empty() {
            return Err(ValidationError::MissingToolName.into());
        }
        {
            let mut session = self.state.lock();
            if session.tools.contains_key(&definition.name) {
                return Err(ValidationError::DuplicateTool(definition.name.clone()).into());
            }
            let name = definition.name.clone();
            let handler: ToolHandler =
                Arc::new(move |args| Box::pin(handler(args)) as ToolHandlerFuture);
            let _ = session
                .tools
                .insert(name, ToolRegistration { definition, handler });
        }
        self.update_session(SessionUpdate::default())
    }

    /// Deregister a tool and resync the session. Fails when unknown.
    pub fn remove_tool(&self, name: &str) -> Result<(), ClientError> {
        {
            let mut session = self.state.lock();
            if session.tools.shift_remove(name).is_none() {
                return Err(ValidationError::UnknownTool(name.to_string()).into());
            }
        }
        self.update_session(SessionUpdate::default())
    }

    /// Ask upstream to delete an item.
    pub fn delete_item(&self, id: &str) -> Result<(), ClientError> {
        self.upstream
            .send("conversation.item.delete", json!({"item_id": id}))
    }

    /// Transmit an audio chunk and grow the local accumulator identically.
    /// Empty input is a no-op.
    pub fn append_input_audio(&self, audio: &[u8]) -> Result<(), ClientError> {
        if audio.is_empty() {
            return Ok(());
        }
        self.upstream.send(
            "input_audio_buffer.append",
            json!({"audio": encode_base64(audio)}),
        )?;
        self.state.lock().input_audio_buffer.extend_from_slice(audio);
        Ok(())
    }

    /// Create a user message item from typed content, then request a
    /// response.
    pub fn send_user_message_content(&self, content: Vec<UserContent>) -> Result<(), ClientError> {
        if !content.is_empty() {
            self.upstream.send(
                "conversation.item.create",
                json!({"item": {"type": "message", "role": "user", "content": content}}),
            )?;
        }
        self.create_response()
    }

    /// Request a response.
    ///
    /// In manual mode (no turn detection) with local audio pending, first
    /// commits the buffer and hands it to the conversation as the
    /// authoritative source for the in-flight speech segment.
    pub fn create_response(&self) -> Result<(), ClientError> {
        Self::create_response_inner(&self.state, &self.upstream)
    }

    /// Cancel the in-flight response.
    ///
    /// Without an id, sends a bare cancel. With an id, the referenced item
    /// must be an assistant message with an audio content part — validated
    /// *before* any envelope goes out — and the cancel is followed by a
    /// truncate at the millisecond mark derived from `sample_count`.
    pub fn cancel_response(
        &self,
        id: Option<&str>,
        sample_count: usize,
    ) -> Result<Option<Item>, ClientError> {
        let Some(id) = id else {
            self.upstream.send("response.cancel", Value::Null)?;
            return Ok(None);
        };

        let (item, audio_index) = {
            let session = self.state.lock();
            let item = session
                .conversation
                .get_item(id)
                .cloned()
                .ok_or_else(|| ValidationError::ItemNotFound(id.to_string()))?;
            match item.detail {
                Some(ItemDetail::Message { role }) => {
                    if role != Role::Assistant {
                        return Err(ValidationError::NotAssistant(id.to_string()).into());
                    }
                }
                _ => return Err(ValidationError::NotAMessage(id.to_string()).into()),
            }
            let audio_index = item
                .content
                .iter()
                .position(|part| part.kind.as_deref() == Some("audio"))
                .ok_or_else(|| ValidationError::NoAudioContent(id.to_string()))?;
            (item, audio_index)
        };

        self.upstream.send("response.cancel", Value::Null)?;
        let audio_end_ms = sample_count as u64 * 1000 / SAMPLE_RATE_HZ;
        self.upstream.send(
            "conversation.item.truncate",
            json!({
                "item_id": id,
                "content_index": audio_index,
                "audio_end_ms": audio_end_ms,
            }),
        )?;
        Ok(Some(item))
    }

    /// Forward an arbitrary client intent event upstream verbatim.
    pub fn send(&self, event_type: &str, data: Value) -> Result<(), ClientError> {
        self.upstream.send(event_type, data)
    }

    /// Snapshot one reconstructed item.
    #[must_use]
    pub fn get_item(&self, id: &str) -> Option<Item> {
        self.state.lock().conversation.get_item(id).cloned()
    }

    /// Snapshot all reconstructed items in conversation order.
    #[must_use]
    pub fn items(&self) -> Vec<Item> {
        self.state.lock().conversation.items()
    }

    /// Suspend until the next item is appended.
    pub async fn wait_for_next_item(&self, timeout: Option<Duration>) -> Option<Item> {
        self.wait_for_item_event("conversation.item.appended", timeout)
            .await
    }

    /// Suspend until the next item completes.
    pub async fn wait_for_next_completed_item(&self, timeout: Option<Duration>) -> Option<Item> {
        self.wait_for_item_event("conversation.item.completed", timeout)
            .await
    }

    async fn wait_for_item_event(&self, topic: &str, timeout: Option<Duration>) -> Option<Item> {
        let event = self.bus.wait_for(topic, timeout).await?;
        serde_json::from_value(event.get("item")?.clone()).ok()
    }

    // ── Internal wiring ──

    fn attach_upstream_handlers(&self) {
        let upstream_bus = self.upstream.bus();

        for source in ["client", "server"] {
            let bus = Arc::clone(&self.bus);
            let _ = upstream_bus.on(&format!("{source}.*"), move |event| {
                bus.dispatch(
                    "realtime.event",
                    &json!({
                        "time": Utc::now().to_rfc3339(),
                        "source": source,
                        "event": event,
                    }),
                )
            });
        }

        {
            let bus = Arc::clone(&self.bus);
            let _ = upstream_bus.on("close", move |event| bus.dispatch("close", event));
        }

        // Weak captures: the upstream bus outlives nothing here, but its
        // handlers must not keep the session state alive once the pairing
        // is dropped.
        let state = Arc::downgrade(&self.state);
        let upstream = Arc::downgrade(&self.upstream);
        let bus = Arc::clone(&self.bus);
        let _ = upstream_bus.on("server.*", move |event| {
            Self::route_server_event(&state, &upstream, &bus, event)
        });
    }

    /// The dispatch table for upstream events: which of them feed the
    /// conversation, and which controller-level notifications each one
    /// produces.
    fn route_server_event(
        state: &Weak<Mutex<SessionState>>,
        upstream: &Weak<UpstreamConnection>,
        bus: &Arc<EventBus>,
        event: &Value,
    ) -> HandlerResult {
        let Some(state) = state.upgrade() else {
            return Ok(());
        };
        let event_type = event.get("type").and_then(Value::as_str).unwrap_or_default();

        match event_type {
            "session.created" => {
                state.lock().session_created = true;
                Ok(())
            }
            "input_audio_buffer.speech_started" => {
                let _ = state.lock().conversation.process(event, None)?;
                bus.dispatch("conversation.interrupted", &json!({}))
            }
            "input_audio_buffer.speech_stopped" => {
                let mut session = state.lock();
                let buffer = session.input_audio_buffer.clone();
                let _ = session.conversation.process(event, Some(&buffer))?;
                Ok(())
            }
            "conversation.item.created" => {
                let update = state.lock().conversation.process(event, None)?;
                if let Some(item) = update.item {
                    let completed = item.status == ItemStatus::Completed;
                    let payload = json!({"item": &item});
                    bus.dispatch("conversation.item.appended", &payload)?;
                    if completed {
                        bus.dispatch("conversation.item.completed", &payload)?;
                    }
                }
                Ok(())
            }
            "response.created" | "response.output_item.added" | "response.content_part.added" => {
                let _ = state.lock().conversation.process(event, None)?;
                Ok(())
            }
            "conversation.item.truncated"
            | "conversation.item.deleted"
            | "conversation.item.input_audio_transcription.completed"
            | "response.audio_transcript.delta"
            | "response.audio.delta"
            | "response.text.delta"
            | "response.function_call_arguments.delta" => {
                let update = state.lock().conversation.process(event, None)?;
                Self::dispatch_updated(bus, &update)
            }
            "response.output_item.done" => {
                let update = state.lock().conversation.process(event, None)?;
                Self::dispatch_updated(bus, &update)?;
                if let Some(item) = update.item {
                    if item.status == ItemStatus::Completed {
                        bus.dispatch("conversation.item.completed", &json!({"item": &item}))?;
                    }
                    if let Some(tool) = item.formatted.tool {
                        if let Some(upstream) = upstream.upgrade() {
                            let _ = tokio::spawn(Self::run_tool(state, upstream, tool));
                        }
                    }
                }
                Ok(())
            }
            // Everything else is observability-only; the wrapper handlers
            // already saw it.
            _ => Ok(()),
        }
    }

    fn dispatch_updated(bus: &Arc<EventBus>, update: &EngineUpdate) -> HandlerResult {
        if let Some(item) = &update.item {
            bus.dispatch(
                "conversation.updated",
                &json!({"item": item, "delta": update.delta}),
            )?;
        }
        Ok(())
    }

    /// The tool-call pipeline: parse arguments, run the handler, report the
    /// outcome as a `function_call_output` item, then always continue the
    /// turn with a response-create. Failures become error payloads, never
    /// crashes.
    async fn run_tool(
        state: Arc<Mutex<SessionState>>,
        upstream: Arc<UpstreamConnection>,
        tool: FormattedTool,
    ) {
        let output = match Self::invoke_tool(&state, &tool).await {
            Ok(result) => result.to_string(),
            Err(e) => {
                warn!(tool = %tool.name, error = %e, "tool invocation failed");
                json!({"error": e.to_string()}).to_string()
            }
        };

        let payload = json!({"item": {
            "type": "function_call_output",
            "call_id": tool.call_id,
            "output": output,
        }});
        if let Err(e) = upstream.send("conversation.item.create", payload) {
            warn!(error = %e, "failed to send tool output");
        }
        if let Err(e) = Self::create_response_inner(&state, &upstream) {
            warn!(error = %e, "failed to request follow-up response");
        }
    }

    async fn invoke_tool(
        state: &Mutex<SessionState>,
        tool: &FormattedTool,
    ) -> Result<Value, BoxError> {
        let arguments: Value = serde_json::from_str(&tool.arguments)?;
        let Some(handler) = state
            .lock()
            .tools
            .get(&tool.name)
            .map(|t| Arc::clone(&t.handler))
        else {
            return Err(ValidationError::UnknownTool(tool.name.clone()).into());
        };
        handler(arguments).await
    }

    fn create_response_inner(
        state: &Mutex<SessionState>,
        upstream: &UpstreamConnection,
    ) -> Result<(), ClientError> {
        let pending = {
            let session = state.lock();
            if session.config.turn_detection.is_none() && !session.input_audio_buffer.is_empty() {
                Some(session.input_audio_buffer.clone())
            } else {
                None
            }
        };
        if let Some(buffer) = pending {
            upstream.send("input_audio_buffer.commit", Value::Null)?;
            let mut session = state.lock();
            session.conversation.queue_input_audio(buffer);
            session.input_audio_buffer.clear();
        }
        upstream.send("response.create", Value::Null)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;
    use sona_core::errors::ProtocolError;

    fn controller() -> SessionController {
        SessionController::new(UpstreamConfig::default())
    }

    fn definition(name: &str) -> ToolDefinition {
        ToolDefinition {
            name: name.to_string(),
            description: format!("{name} tool"),
            parameters: json!({"type": "object", "properties": {}}),
        }
    }

    fn ok_handler(_args: Value) -> ToolHandlerFuture {
        Box::pin(async { Ok(json!({"ok": true})) })
    }

    fn server_event(event_type: &str, fields: Value) -> Value {
        let mut obj = fields.as_object().cloned().unwrap_or_default();
        let _ = obj.insert("event_id".into(), json!("evt_test"));
        let _ = obj.insert("type".into(), json!(event_type));
        Value::Object(obj)
    }

    /// Push an event through the same path the inbound pump uses.
    fn feed(controller: &SessionController, event: &Value) {
        controller
            .upstream
            .bus()
            .dispatch("server.*", event)
            .unwrap();
    }

    // ── Tool registry ──

    #[tokio::test]
    async fn duplicate_tool_is_rejected_until_removed() {
        let controller = controller();
        controller.add_tool(definition("lookup"), ok_handler).unwrap();

        let err = controller
            .add_tool(definition("lookup"), ok_handler)
            .unwrap_err();
        assert_matches!(
            err,
            ClientError::Validation(ValidationError::DuplicateTool(name)) if name == "lookup"
        );

        controller.remove_tool("lookup").unwrap();
        controller.add_tool(definition("lookup"), ok_handler).unwrap();
    }

    #[tokio::test]
    async fn tool_definition_requires_a_name() {
        let controller = controller();
        let err = controller
            .add_tool(definition(""), ok_handler)
            .unwrap_err();
        assert_matches!(err, ClientError::Validation(ValidationError::MissingToolName));
    }

    #[tokio::test]
    async fn removing_an_unknown_tool_fails() {
        let controller = controller();
        let err = controller.remove_tool("ghost").unwrap_err();
        assert_matches!(
            err,
            ClientError::Validation(ValidationError::UnknownTool(name)) if name == "ghost"
        );
    }

    // ── Session configuration ──

    #[tokio::test]
    async fn update_session_offline_merges_without_sending() {
        let controller = controller();
        controller
            .update_session(SessionUpdate {
                voice: Some("echo".into()),
                ..SessionUpdate::default()
            })
            .unwrap();
        assert_eq!(controller.state.lock().config.voice, "echo");
        // Untouched fields survive.
        assert_eq!(controller.state.lock().config.temperature, 0.8);
    }

    // ── Input audio ──

    #[tokio::test]
    async fn empty_audio_append_is_a_no_op() {
        let controller = controller();
        controller.append_input_audio(&[]).unwrap();
        assert!(controller.state.lock().input_audio_buffer.is_empty());
    }

    #[tokio::test]
    async fn audio_append_requires_a_connection_and_leaves_buffer_untouched() {
        let controller = controller();
        let err = controller.append_input_audio(&[1, 2, 3]).unwrap_err();
        assert_matches!(err, ClientError::Connection(ConnectionError::NotConnected));
        assert!(controller.state.lock().input_audio_buffer.is_empty());
    }

    // ── cancel_response validation ──

    #[tokio::test]
    async fn cancel_unknown_item_fails() {
        let controller = controller();
        let err = controller.cancel_response(Some("ghost"), 0).unwrap_err();
        assert_matches!(
            err,
            ClientError::Validation(ValidationError::ItemNotFound(id)) if id == "ghost"
        );
    }

    #[tokio::test]
    async fn cancel_non_message_item_fails() {
        let controller = controller();
        feed(
            &controller,
            &server_event(
                "conversation.item.created",
                json!({"item": {"id": "f1", "type": "function_call", "call_id": "c", "name": "n"}}),
            ),
        );
        let err = controller.cancel_response(Some("f1"), 0).unwrap_err();
        assert_matches!(err, ClientError::Validation(ValidationError::NotAMessage(_)));
    }

    #[tokio::test]
    async fn cancel_user_message_fails() {
        let controller = controller();
        feed(
            &controller,
            &server_event(
                "conversation.item.created",
                json!({"item": {"id": "u1", "type": "message", "role": "user", "content": []}}),
            ),
        );
        let err = controller.cancel_response(Some("u1"), 0).unwrap_err();
        assert_matches!(err, ClientError::Validation(ValidationError::NotAssistant(_)));
    }

    #[tokio::test]
    async fn cancel_without_audio_content_fails_before_any_send() {
        let controller = controller();
        feed(
            &controller,
            &server_event(
                "conversation.item.created",
                json!({"item": {
                    "id": "a3", "type": "message", "role": "assistant",
                    "content": [{"type": "text", "text": "hi"}],
                }}),
            ),
        );
        let err = controller.cancel_response(Some("a3"), 48_000).unwrap_err();
        // A validation error, not NotConnected: no cancel/truncate envelope
        // was ever attempted.
        assert_matches!(err, ClientError::Validation(ValidationError::NoAudioContent(_)));
    }

    #[tokio::test]
    async fn bare_cancel_goes_straight_to_the_wire() {
        let controller = controller();
        // Disconnected, so the attempted send surfaces as NotConnected —
        // proof the bare-cancel path skips item validation entirely.
        let err = controller.cancel_response(None, 0).unwrap_err();
        assert_matches!(err, ClientError::Connection(ConnectionError::NotConnected));
    }

    // ── Event routing ──

    #[tokio::test]
    async fn session_created_sets_the_flag() {
        let controller = controller();
        assert!(!controller.state.lock().session_created);
        feed(
            &controller,
            &server_event("session.created", json!({"session": {}})),
        );
        assert!(controller.state.lock().session_created);
    }

    #[tokio::test]
    async fn item_created_is_announced_on_the_controller_bus() {
        let controller = controller();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _ = controller.bus().on("conversation.item.appended", move |event| {
            let _ = tx.send(event.clone());
            Ok(())
        });

        feed(
            &controller,
            &server_event(
                "conversation.item.created",
                json!({"item": {"id": "u1", "type": "message", "role": "user", "content": []}}),
            ),
        );

        let event = rx.try_recv().unwrap();
        assert_eq!(event["item"]["id"], "u1");
        assert_eq!(event["item"]["status"], "completed");
    }

    #[tokio::test]
    async fn completed_user_item_also_fires_item_completed() {
        let controller = controller();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _ = controller.bus().on("conversation.item.completed", move |event| {
            let _ = tx.send(event.clone());
            Ok(())
        });

        feed(
            &controller,
            &server_event(
                "conversation.item.created",
                json!({"item": {"id": "u1", "type": "message", "role": "user", "content": []}}),
            ),
        );
        assert_eq!(rx.try_recv().unwrap()["item"]["id"], "u1");
    }

    #[tokio::test]
    async fn deltas_fire_conversation_updated_with_the_fragment() {
        let controller = controller();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _ = controller.bus().on("conversation.updated", move |event| {
            let _ = tx.send(event.clone());
            Ok(())
        });

        feed(
            &controller,
            &server_event(
                "conversation.item.created",
                json!({"item": {"id": "a1", "type": "message", "role": "assistant", "content": []}}),
            ),
        );
        feed(
            &controller,
            &server_event(
                "response.text.delta",
                json!({"item_id": "a1", "content_index": 0, "delta": "hel"}),
            ),
        );

        let event = rx.try_recv().unwrap();
        assert_eq!(event["item"]["id"], "a1");
        assert_eq!(event["delta"]["text"], "hel");
    }

    #[tokio::test]
    async fn speech_started_announces_an_interruption() {
        let controller = controller();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _ = controller.bus().on("conversation.interrupted", move |event| {
            let _ = tx.send(event.clone());
            Ok(())
        });

        feed(
            &controller,
            &server_event(
                "input_audio_buffer.speech_started",
                json!({"item_id": "u1", "audio_start_ms": 0}),
            ),
        );
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn speech_stopped_slices_from_the_local_accumulator() {
        let controller = controller();
        controller.state.lock().input_audio_buffer = (0..4800).map(|i| (i % 251) as u8).collect();

        feed(
            &controller,
            &server_event(
                "input_audio_buffer.speech_started",
                json!({"item_id": "u1", "audio_start_ms": 0}),
            ),
        );
        feed(
            &controller,
            &server_event(
                "input_audio_buffer.speech_stopped",
                json!({"item_id": "u1", "audio_end_ms": 100}),
            ),
        );
        feed(
            &controller,
            &server_event(
                "conversation.item.created",
                json!({"item": {"id": "u1", "type": "message", "role": "user", "content": []}}),
            ),
        );

        let expected: Vec<u8> = (0..2400).map(|i| (i % 251) as u8).collect();
        assert_eq!(controller.get_item("u1").unwrap().formatted.audio, expected);
    }

    #[tokio::test]
    async fn routing_errors_propagate_to_the_dispatcher() {
        let controller = controller();
        // Delta without its content_index: the conversation refuses it.
        let err = controller
            .upstream
            .bus()
            .dispatch(
                "server.*",
                &server_event("response.text.delta", json!({"item_id": "a1", "delta": "x"})),
            )
            .unwrap_err();
        assert!(err.to_string().contains("content_index"));
        let _ = err.downcast::<ProtocolError>().unwrap();
    }

    #[tokio::test]
    async fn raw_events_are_wrapped_for_observability() {
        let controller = controller();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _ = controller.bus().on("realtime.event", move |event| {
            let _ = tx.send(event.clone());
            Ok(())
        });

        feed(
            &controller,
            &server_event("response.created", json!({"response": {"id": "r1", "output": []}})),
        );

        let wrapped = rx.try_recv().unwrap();
        assert_eq!(wrapped["source"], "server");
        assert_eq!(wrapped["event"]["type"], "response.created");
        assert!(wrapped["time"].is_string());
    }

    #[tokio::test]
    async fn upstream_close_is_forwarded() {
        let controller = controller();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _ = controller.bus().on("close", move |event| {
            let _ = tx.send(event.clone());
            Ok(())
        });

        controller
            .upstream
            .bus()
            .dispatch("close", &json!({"error": true}))
            .unwrap();
        assert_eq!(rx.try_recv().unwrap()["error"], true);
    }

    // ── Tool pipeline ──

    #[tokio::test]
    async fn completed_function_call_invokes_the_registered_handler() {
        let controller = controller();
        let (tx, mut rx) = mpsc::unbounded_channel();
        controller
            .add_tool(definition("lookup"), move |args: Value| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(args);
                    Ok(json!({"found": true}))
                }
            })
            .unwrap();

        feed(
            &controller,
            &server_event(
                "conversation.item.created",
                json!({"item": {"id": "f1", "type": "function_call", "call_id": "c1", "name": "lookup"}}),
            ),
        );
        feed(
            &controller,
            &server_event(
                "response.function_call_arguments.delta",
                json!({"item_id": "f1", "delta": "{\"q\":\"rust\"}"}),
            ),
        );
        feed(
            &controller,
            &server_event(
                "response.output_item.done",
                json!({"item": {
                    "id": "f1", "type": "function_call", "status": "completed",
                    "call_id": "c1", "name": "lookup", "arguments": "{\"q\":\"rust\"}",
                }}),
            ),
        );

        let args = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("tool handler should run")
            .unwrap();
        assert_eq!(args, json!({"q": "rust"}));
    }

    #[tokio::test]
    async fn invoke_tool_reports_unregistered_tools() {
        let state = Mutex::new(SessionState::default());
        let tool = FormattedTool {
            name: "ghost".into(),
            call_id: "c1".into(),
            arguments: "{}".into(),
            ..FormattedTool::default()
        };
        let err = SessionController::invoke_tool(&state, &tool).await.unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[tokio::test]
    async fn invoke_tool_reports_argument_parse_failures() {
        let state = Mutex::new(SessionState::default());
        let tool = FormattedTool {
            name: "lookup".into(),
            arguments: "{not json".into(),
            ..FormattedTool::default()
        };
        assert!(SessionController::invoke_tool(&state, &tool).await.is_err());
    }

    // ── Lifecycle ──

    #[tokio::test]
    async fn disconnect_clears_conversation_but_keeps_tools() {
        let controller = controller();
        controller.add_tool(definition("lookup"), ok_handler).unwrap();
        feed(
            &controller,
            &server_event(
                "conversation.item.created",
                json!({"item": {"id": "u1", "type": "message", "role": "user", "content": []}}),
            ),
        );
        assert_eq!(controller.items().len(), 1);

        controller.disconnect();
        assert!(controller.items().is_empty());
        assert!(controller.state.lock().tools.contains_key("lookup"));
    }

    #[tokio::test]
    async fn reset_restores_newly_constructed_behavior() {
        let controller = controller();
        controller.add_tool(definition("lookup"), ok_handler).unwrap();
        controller
            .update_session(SessionUpdate {
                voice: Some("echo".into()),
                ..SessionUpdate::default()
            })
            .unwrap();
        let _ = controller.bus().on("realtime.event", |_| Ok(()));

        controller.reset();

        let state = controller.state.lock();
        assert!(state.tools.is_empty());
        assert_eq!(state.config.voice, "alloy");
        drop(state);
        assert_eq!(controller.bus().handler_count("realtime.event"), 0);
        // Internal wiring is back: server events still reach the engine.
        feed(
            &controller,
            &server_event(
                "conversation.item.created",
                json!({"item": {"id": "u2", "type": "message", "role": "user", "content": []}}),
            ),
        );
        assert_eq!(controller.items().len(), 1);
    }

    #[tokio::test]
    async fn wait_for_next_item_yields_the_appended_item() {
        let controller = controller();
        let waiter = {
            let controller = controller.clone();
            tokio::spawn(async move {
                controller
                    .wait_for_next_item(Some(Duration::from_secs(5)))
                    .await
            })
        };
        // Give the waiter time to register its one-shot subscription.
        tokio::time::sleep(Duration::from_millis(20)).await;

        feed(
            &controller,
            &server_event(
                "conversation.item.created",
                json!({"item": {"id": "u1", "type": "message", "role": "user", "content": []}}),
            ),
        );

        let item = waiter.await.unwrap().expect("item should arrive");
        assert_eq!(item.id, "u1");
    }
}
