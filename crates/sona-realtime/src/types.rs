//! Wire-shaped data model for the realtime protocol.
//!
//! Everything here (de)serializes to the exact envelope shapes exchanged
//! with the upstream API. Items carry an extra `formatted` projection —
//! the locally reconstructed view (decoded audio, concatenated text and
//! transcript, tool descriptor) that never originates upstream.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sona_core::audio::{base64_bytes, base64_bytes_opt};

// ─────────────────────────────────────────────────────────────────────────────
// Items
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle status of an item. Monotonic: once terminal, never regresses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Still being generated.
    #[default]
    InProgress,
    /// Finished normally.
    Completed,
    /// Terminated early (interruption, token cap, filter).
    Incomplete,
}

impl ItemStatus {
    /// Whether this status is final.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Incomplete)
    }

    /// Apply a status transition, refusing to regress from a terminal state.
    #[must_use]
    pub fn advance(self, next: Self) -> Self {
        if self.is_terminal() && !next.is_terminal() {
            self
        } else {
            next
        }
    }
}

/// Speaker role of a message item.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Injected system instructions.
    System,
    /// The human caller.
    User,
    /// The upstream model.
    Assistant,
}

/// Variant-specific payload of an item, tagged by the wire `type` field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ItemDetail {
    /// A conversation message.
    Message {
        /// Who produced it.
        role: Role,
    },
    /// A tool invocation requested by the model.
    FunctionCall {
        /// Correlates the call with its output item.
        #[serde(default)]
        call_id: String,
        /// Registered tool name.
        #[serde(default)]
        name: String,
        /// Argument JSON, streamed incrementally.
        #[serde(default)]
        arguments: String,
    },
    /// The result of a tool invocation.
    FunctionCallOutput {
        /// Correlates the output with its call item.
        #[serde(default)]
        call_id: String,
        /// Stringified result payload.
        #[serde(default)]
        output: String,
    },
}

/// One slot of an item's index-addressed content array.
///
/// Slots are heterogeneous and sparse-filled: writing index N first
/// back-fills 0..N-1 with empty placeholders. All fields optional so an
/// empty placeholder is representable.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentPart {
    /// Wire content type (`text`, `input_text`, `audio`, `input_audio`).
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Accumulated text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Accumulated audio, still base64 as received.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<String>,
    /// Accumulated transcript.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
}

/// Tool descriptor assembled on a function-call item.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FormattedTool {
    /// Always `function`.
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    /// Registered tool name.
    #[serde(default)]
    pub name: String,
    /// Correlation id for the output item.
    #[serde(default)]
    pub call_id: String,
    /// Accumulated argument JSON.
    #[serde(default)]
    pub arguments: String,
}

fn function_kind() -> String {
    "function".to_string()
}

impl Default for FormattedTool {
    fn default() -> Self {
        Self {
            kind: function_kind(),
            name: String::new(),
            call_id: String::new(),
            arguments: String::new(),
        }
    }
}

/// Locally reconstructed projection of an item.
///
/// Audio is raw decoded bytes in memory and base64 on the wire.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Formatted {
    /// Concatenated decoded audio.
    #[serde(with = "base64_bytes", default)]
    pub audio: Vec<u8>,
    /// Concatenated text.
    #[serde(default)]
    pub text: String,
    /// Concatenated transcript.
    #[serde(default)]
    pub transcript: String,
    /// Tool descriptor, present on function-call items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<FormattedTool>,
    /// Output payload, present on function-call-output items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

/// A reconstructed conversation turn.
///
/// `detail: None` is the placeholder form, synthesized when an event
/// references an id that has not been announced yet; the authoritative
/// creation event reconciles it in place.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Unique item id.
    pub id: String,
    /// Lifecycle status.
    #[serde(default)]
    pub status: ItemStatus,
    /// Variant payload; `None` while the item is only a placeholder.
    /// A flattened `None` serializes to nothing, so placeholders go over
    /// the wire without a `type` discriminator.
    #[serde(flatten)]
    pub detail: Option<ItemDetail>,
    /// Index-addressed content slots.
    #[serde(default)]
    pub content: Vec<ContentPart>,
    /// Local projection; never sent by upstream.
    #[serde(default)]
    pub formatted: Formatted,
}

impl Item {
    /// Synthesize a minimal placeholder for a not-yet-announced id.
    #[must_use]
    pub fn placeholder(id: &str) -> Self {
        Self {
            id: id.to_string(),
            status: ItemStatus::InProgress,
            detail: None,
            content: Vec::new(),
            formatted: Formatted::default(),
        }
    }

    /// Apply a status transition without regressing a terminal state.
    pub fn set_status(&mut self, next: ItemStatus) {
        self.status = self.status.advance(next);
    }

    /// Mutable access to content slot `index`, back-filling empty
    /// placeholders so indices are never sparse.
    pub fn content_slot(&mut self, index: usize) -> &mut ContentPart {
        while self.content.len() <= index {
            self.content.push(ContentPart::default());
        }
        &mut self.content[index]
    }

    /// Role of a message item, if this is one.
    #[must_use]
    pub fn role(&self) -> Option<Role> {
        match self.detail {
            Some(ItemDetail::Message { role }) => Some(role),
            _ => None,
        }
    }
}

/// Incremental fragment reported alongside an item update.
///
/// Carries only the fragment from the triggering event, never the
/// accumulated value.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemDelta {
    /// New text fragment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// New decoded audio fragment.
    #[serde(with = "base64_bytes_opt", default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<Vec<u8>>,
    /// New argument-JSON fragment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
    /// New transcript fragment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
}

impl ItemDelta {
    /// Whether the delta carries no fragment at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.is_none()
            && self.audio.is_none()
            && self.arguments.is_none()
            && self.transcript.is_none()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Responses
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle status of a generation unit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    /// Still generating.
    #[default]
    InProgress,
    /// Finished normally.
    Completed,
    /// Terminated early.
    Incomplete,
    /// Cancelled by the caller.
    Cancelled,
    /// Failed upstream.
    Failed,
}

/// Token usage counters reported with a response.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Total tokens consumed.
    #[serde(default)]
    pub total_tokens: u64,
    /// Prompt-side tokens.
    #[serde(default)]
    pub input_tokens: u64,
    /// Generation-side tokens.
    #[serde(default)]
    pub output_tokens: u64,
}

/// One generation unit announced by upstream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Unique response id.
    pub id: String,
    /// Lifecycle status.
    #[serde(default)]
    pub status: ResponseStatus,
    /// Failure / incomplete reason, verbatim from the wire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_details: Option<Value>,
    /// Ids of the items this response produced, in announcement order.
    /// Weak references — the items' existence is not required.
    #[serde(default)]
    pub output: Vec<String>,
    /// Usage counters, once reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Session configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Wire audio encodings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioFormat {
    /// 16-bit little-endian PCM at 24 kHz.
    Pcm16,
    /// G.711 µ-law.
    G711Ulaw,
    /// G.711 A-law.
    G711Alaw,
}

/// Input-audio transcription settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioTranscription {
    /// Transcription model name.
    pub model: String,
}

impl Default for AudioTranscription {
    fn default() -> Self {
        Self {
            model: "whisper-1".to_string(),
        }
    }
}

/// Server-side voice-activity turn detection settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TurnDetection {
    /// Detection mode; only `server_vad` exists today.
    #[serde(rename = "type")]
    pub kind: String,
    /// Activation threshold.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f32>,
    /// Audio to keep before detected speech.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix_padding_ms: Option<u32>,
    /// Silence needed to close a turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub silence_duration_ms: Option<u32>,
}

impl Default for TurnDetection {
    fn default() -> Self {
        Self {
            kind: "server_vad".to_string(),
            threshold: Some(0.5),
            prefix_padding_ms: Some(300),
            silence_duration_ms: Some(200),
        }
    }
}

/// Tool-selection policy sent with the session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    /// Model decides.
    Auto,
    /// Never call tools.
    None,
    /// Must call a tool.
    Required,
    /// A structured selector, passed through verbatim.
    #[serde(untagged)]
    Other(Value),
}

/// Output-token cap: a count or unbounded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaxOutputTokens {
    /// No cap.
    #[serde(rename = "inf")]
    Infinite,
    /// Hard token cap.
    #[serde(untagged)]
    Count(u32),
}

/// A registrable tool definition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Unique (per session) tool name.
    pub name: String,
    /// Natural-language description shown to the model.
    #[serde(default)]
    pub description: String,
    /// JSON-schema parameter declaration.
    #[serde(default = "empty_object")]
    pub parameters: Value,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// A tool entry as transmitted in a session update — the definition tagged
/// with the (only) tool type.
#[derive(Clone, Debug, Serialize)]
pub struct SessionTool {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(flatten)]
    definition: ToolDefinition,
}

impl From<ToolDefinition> for SessionTool {
    fn from(definition: ToolDefinition) -> Self {
        Self {
            kind: "function",
            definition,
        }
    }
}

/// Desired session parameters.
///
/// Serialized in full on every `session.update` — disabled optional features
/// (`input_audio_transcription`, `turn_detection`) go out as explicit nulls.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Enabled output modalities.
    pub modalities: Vec<String>,
    /// System instructions.
    pub instructions: String,
    /// Output voice.
    pub voice: String,
    /// Caller-side audio encoding.
    pub input_audio_format: AudioFormat,
    /// Model-side audio encoding.
    pub output_audio_format: AudioFormat,
    /// Input transcription; `None` disables it.
    pub input_audio_transcription: Option<AudioTranscription>,
    /// Turn detection; `None` means manual commit mode.
    pub turn_detection: Option<TurnDetection>,
    /// Tool-selection policy.
    pub tool_choice: ToolChoice,
    /// Sampling temperature.
    pub temperature: f32,
    /// Output-token cap.
    pub max_response_output_tokens: MaxOutputTokens,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            modalities: vec!["text".to_string(), "audio".to_string()],
            instructions: String::new(),
            voice: "alloy".to_string(),
            input_audio_format: AudioFormat::Pcm16,
            output_audio_format: AudioFormat::Pcm16,
            input_audio_transcription: None,
            turn_detection: None,
            tool_choice: ToolChoice::Auto,
            temperature: 0.8,
            max_response_output_tokens: MaxOutputTokens::Count(4096),
        }
    }
}

/// Partial session overrides: only supplied fields overwrite the running
/// configuration; omission leaves the prior value unchanged.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SessionUpdate {
    /// Replace the enabled modalities.
    pub modalities: Option<Vec<String>>,
    /// Replace the system instructions.
    pub instructions: Option<String>,
    /// Replace the output voice.
    pub voice: Option<String>,
    /// Replace the caller-side audio encoding.
    pub input_audio_format: Option<AudioFormat>,
    /// Replace the model-side audio encoding.
    pub output_audio_format: Option<AudioFormat>,
    /// Enable/replace input transcription.
    pub input_audio_transcription: Option<AudioTranscription>,
    /// Enable/replace turn detection.
    pub turn_detection: Option<TurnDetection>,
    /// Ad hoc tools for this update, merged with the registered ones.
    pub tools: Option<Vec<ToolDefinition>>,
    /// Replace the tool-selection policy.
    pub tool_choice: Option<ToolChoice>,
    /// Replace the sampling temperature.
    pub temperature: Option<f32>,
    /// Replace the output-token cap.
    pub max_response_output_tokens: Option<MaxOutputTokens>,
}

impl SessionConfig {
    /// Merge supplied override fields in place, returning the ad hoc tools
    /// (which are transmitted but never stored).
    pub fn apply(&mut self, update: SessionUpdate) -> Vec<ToolDefinition> {
        if let Some(v) = update.modalities {
            self.modalities = v;
        }
        if let Some(v) = update.instructions {
            self.instructions = v;
        }
        if let Some(v) = update.voice {
            self.voice = v;
        }
        if let Some(v) = update.input_audio_format {
            self.input_audio_format = v;
        }
        if let Some(v) = update.output_audio_format {
            self.output_audio_format = v;
        }
        if let Some(v) = update.input_audio_transcription {
            self.input_audio_transcription = Some(v);
        }
        if let Some(v) = update.turn_detection {
            self.turn_detection = Some(v);
        }
        if let Some(v) = update.tool_choice {
            self.tool_choice = v;
        }
        if let Some(v) = update.temperature {
            self.temperature = v;
        }
        if let Some(v) = update.max_response_output_tokens {
            self.max_response_output_tokens = v;
        }
        update.tools.unwrap_or_default()
    }
}

/// User-supplied message content for `send_user_message_content`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserContent {
    /// Typed text input.
    InputText {
        /// The text.
        text: String,
    },
    /// Raw audio input, base64-encoded on the wire.
    InputAudio {
        /// Decoded audio bytes.
        #[serde(with = "base64_bytes")]
        audio: Vec<u8>,
        /// Optional caller-provided transcript.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transcript: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_item_round_trips() {
        let wire = json!({
            "id": "item_1",
            "type": "message",
            "role": "assistant",
            "status": "in_progress",
            "content": [{"type": "text", "text": "hi"}],
        });
        let item: Item = serde_json::from_value(wire).unwrap();
        assert_eq!(item.id, "item_1");
        assert_eq!(item.role(), Some(Role::Assistant));
        assert_eq!(item.status, ItemStatus::InProgress);
        assert_eq!(item.content.len(), 1);
        assert_eq!(item.content[0].text.as_deref(), Some("hi"));

        let back = serde_json::to_value(&item).unwrap();
        assert_eq!(back["type"], "message");
        assert_eq!(back["role"], "assistant");
        assert_eq!(back["formatted"]["audio"], "");
    }

    #[test]
    fn function_call_item_parses_variant_fields() {
        let wire = json!({
            "id": "item_2",
            "type": "function_call",
            "call_id": "call_9",
            "name": "lookup",
        });
        let item: Item = serde_json::from_value(wire).unwrap();
        match item.detail {
            Some(ItemDetail::FunctionCall {
                ref call_id,
                ref name,
                ref arguments,
            }) => {
                assert_eq!(call_id, "call_9");
                assert_eq!(name, "lookup");
                assert!(arguments.is_empty());
            }
            ref other => panic!("unexpected detail: {other:?}"),
        }
    }

    #[test]
    fn item_without_type_is_a_placeholder() {
        let wire = json!({"id": "item_3"});
        let item: Item = serde_json::from_value(wire).unwrap();
        assert!(item.detail.is_none());
        assert_eq!(item.status, ItemStatus::InProgress);
    }

    #[test]
    fn status_never_regresses_from_terminal() {
        assert_eq!(
            ItemStatus::Completed.advance(ItemStatus::InProgress),
            ItemStatus::Completed
        );
        assert_eq!(
            ItemStatus::InProgress.advance(ItemStatus::Completed),
            ItemStatus::Completed
        );
        assert_eq!(
            ItemStatus::Completed.advance(ItemStatus::Incomplete),
            ItemStatus::Incomplete
        );
    }

    #[test]
    fn content_slot_backfills_placeholders() {
        let mut item = Item::placeholder("item_4");
        item.content_slot(2).text = Some("x".into());
        assert_eq!(item.content.len(), 3);
        assert_eq!(item.content[0], ContentPart::default());
        assert_eq!(item.content[1], ContentPart::default());
        assert_eq!(item.content[2].text.as_deref(), Some("x"));
    }

    #[test]
    fn formatted_audio_serializes_as_base64() {
        let formatted = Formatted {
            audio: vec![1, 2, 3],
            ..Formatted::default()
        };
        let json = serde_json::to_value(&formatted).unwrap();
        assert_eq!(json["audio"], sona_core::audio::encode_base64(&[1, 2, 3]));
        let back: Formatted = serde_json::from_value(json).unwrap();
        assert_eq!(back.audio, vec![1, 2, 3]);
    }

    #[test]
    fn delta_skips_absent_fields() {
        let delta = ItemDelta {
            transcript: Some("hey".into()),
            ..ItemDelta::default()
        };
        let json = serde_json::to_value(&delta).unwrap();
        assert_eq!(json, json!({"transcript": "hey"}));
    }

    #[test]
    fn tool_choice_serde() {
        assert_eq!(serde_json::to_value(ToolChoice::Auto).unwrap(), json!("auto"));
        assert_eq!(
            serde_json::from_value::<ToolChoice>(json!("required")).unwrap(),
            ToolChoice::Required
        );
        let custom = json!({"type": "function", "name": "lookup"});
        assert_eq!(
            serde_json::from_value::<ToolChoice>(custom.clone()).unwrap(),
            ToolChoice::Other(custom)
        );
    }

    #[test]
    fn max_output_tokens_serde() {
        assert_eq!(
            serde_json::to_value(MaxOutputTokens::Infinite).unwrap(),
            json!("inf")
        );
        assert_eq!(
            serde_json::to_value(MaxOutputTokens::Count(4096)).unwrap(),
            json!(4096)
        );
        assert_eq!(
            serde_json::from_value::<MaxOutputTokens>(json!(128)).unwrap(),
            MaxOutputTokens::Count(128)
        );
        assert_eq!(
            serde_json::from_value::<MaxOutputTokens>(json!("inf")).unwrap(),
            MaxOutputTokens::Infinite
        );
    }

    #[test]
    fn default_config_serializes_disabled_features_as_null() {
        let json = serde_json::to_value(SessionConfig::default()).unwrap();
        assert_eq!(json["voice"], "alloy");
        assert_eq!(json["input_audio_format"], "pcm16");
        assert!(json["turn_detection"].is_null());
        assert!(json["input_audio_transcription"].is_null());
        assert_eq!(json["max_response_output_tokens"], 4096);
    }

    #[test]
    fn apply_touches_only_supplied_fields() {
        let mut config = SessionConfig::default();
        let adhoc = config.apply(SessionUpdate {
            voice: Some("echo".into()),
            turn_detection: Some(TurnDetection::default()),
            ..SessionUpdate::default()
        });
        assert!(adhoc.is_empty());
        assert_eq!(config.voice, "echo");
        assert!(config.turn_detection.is_some());
        // Untouched fields keep their defaults.
        assert_eq!(config.temperature, 0.8);
        assert_eq!(config.modalities, vec!["text", "audio"]);
    }

    #[test]
    fn session_tool_is_tagged_as_function() {
        let tool = SessionTool::from(ToolDefinition {
            name: "lookup".into(),
            description: "look a thing up".into(),
            parameters: json!({"type": "object"}),
        });
        let json = serde_json::to_value(&tool).unwrap();
        assert_eq!(json["type"], "function");
        assert_eq!(json["name"], "lookup");
        assert_eq!(json["parameters"]["type"], "object");
    }

    #[test]
    fn user_content_audio_is_base64_on_the_wire() {
        let content = UserContent::InputAudio {
            audio: vec![9, 9, 9],
            transcript: None,
        };
        let json = serde_json::to_value(&content).unwrap();
        assert_eq!(json["type"], "input_audio");
        assert_eq!(json["audio"], sona_core::audio::encode_base64(&[9, 9, 9]));
        assert!(json.get("transcript").is_none());
    }

    #[test]
    fn response_parses_with_defaults() {
        let wire = json!({"id": "resp_1", "status": "in_progress", "output": []});
        let response: Response = serde_json::from_value(wire).unwrap();
        assert_eq!(response.id, "resp_1");
        assert_eq!(response.status, ResponseStatus::InProgress);
        assert!(response.output.is_empty());
        assert!(response.usage.is_none());
    }
}
