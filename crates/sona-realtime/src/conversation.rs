//! Stateful reconstruction of the conversation from streamed events.
//!
//! Upstream delivers conversation state only as an ordered sequence of
//! incremental, partial events. [`Conversation::process`] folds each one
//! into the item and response stores and reports what changed — the updated
//! item plus, for delta events, *only the incremental fragment*, never the
//! accumulated value.
//!
//! Events may race: a voice-activity marker or a content delta can name an
//! item that has not been announced yet. Unknown references synthesize a
//! placeholder item immediately (consumers never see a missing item); the
//! authoritative creation event later reconciles the placeholder in place.

use std::collections::HashMap;

use indexmap::IndexMap;
use indexmap::map::Entry;
use serde_json::{Map, Value};
use sona_core::audio::{SAMPLE_RATE_HZ, decode_base64};
use sona_core::errors::ProtocolError;
use tracing::{info, warn};

use crate::types::{
    ContentPart, Formatted, FormattedTool, Item, ItemDelta, ItemDetail, ItemStatus, Response, Role,
};

/// A speech segment announced by voice-activity detection, waiting for its
/// item. Holds the millisecond markers and, once both ends are known
/// together with an audio snapshot, the materialized slice.
#[derive(Clone, Debug)]
struct PendingSpeech {
    audio_start_ms: u64,
    audio_end_ms: Option<u64>,
    audio: Option<Vec<u8>>,
}

/// What a processed event changed.
#[derive(Clone, Debug, Default)]
pub struct EngineUpdate {
    /// The created/mutated item, if the event targeted one.
    pub item: Option<Item>,
    /// The incremental fragment, for delta events only.
    pub delta: Option<ItemDelta>,
}

impl EngineUpdate {
    /// An update that touched nothing consumers care about.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// An item mutation without a delta.
    #[must_use]
    pub fn item(item: Item) -> Self {
        Self {
            item: Some(item),
            delta: None,
        }
    }

    /// An item mutation carrying an incremental fragment.
    #[must_use]
    pub fn with_delta(item: Item, delta: ItemDelta) -> Self {
        Self {
            item: Some(item),
            delta: Some(delta),
        }
    }
}

/// The conversation reconstruction engine for one session.
///
/// Owned exclusively by that session's controller; items are referenced by
/// id everywhere else, never duplicated.
#[derive(Default)]
pub struct Conversation {
    items: IndexMap<String, Item>,
    responses: IndexMap<String, Response>,
    queued_speech: HashMap<String, PendingSpeech>,
    queued_transcripts: HashMap<String, String>,
    queued_input_audio: Option<Vec<u8>>,
}

impl Conversation {
    /// Create an empty conversation.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all reconstructed state and pending queues.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Stash locally committed input audio; the next user item created
    /// adopts it as its audio.
    pub fn queue_input_audio(&mut self, audio: Vec<u8>) {
        self.queued_input_audio = Some(audio);
    }

    /// Look up an item by id.
    #[must_use]
    pub fn get_item(&self, id: &str) -> Option<&Item> {
        self.items.get(id)
    }

    /// Snapshot of all items in conversation order.
    #[must_use]
    pub fn items(&self) -> Vec<Item> {
        self.items.values().cloned().collect()
    }

    /// Look up a response by id.
    #[must_use]
    pub fn get_response(&self, id: &str) -> Option<&Response> {
        self.responses.get(id)
    }

    /// Fold one upstream event into the stores.
    ///
    /// `input_audio` is the caller's accumulated raw input buffer, required
    /// by `input_audio_buffer.speech_stopped` to slice out the segment.
    ///
    /// Fails with a [`ProtocolError`] when the event lacks its
    /// identification fields or names an event type with no processor —
    /// upstream contract violations that must not be silently absorbed.
    pub fn process(
        &mut self,
        event: &Value,
        input_audio: Option<&[u8]>,
    ) -> Result<EngineUpdate, ProtocolError> {
        let obj = event.as_object().ok_or(ProtocolError::NonObjectPayload)?;
        if !obj.contains_key("event_id") {
            return Err(ProtocolError::MissingField { field: "event_id" });
        }
        let event_type = str_field(obj, "type")?;

        match event_type {
            "conversation.item.created" => self.item_created(obj),
            "conversation.item.truncated" => self.item_truncated(obj),
            "conversation.item.deleted" => self.item_deleted(obj),
            "conversation.item.input_audio_transcription.completed" => {
                self.transcription_completed(obj)
            }
            "input_audio_buffer.speech_started" => self.speech_started(obj),
            "input_audio_buffer.speech_stopped" => self.speech_stopped(obj, input_audio),
            "response.created" => self.response_created(obj),
            "response.output_item.added" => self.output_item_added(obj),
            "response.output_item.done" => self.output_item_done(obj),
            "response.content_part.added" => self.content_part_added(obj),
            "response.audio_transcript.delta" => self.audio_transcript_delta(obj),
            "response.audio.delta" => self.audio_delta(obj),
            "response.text.delta" => self.text_delta(obj),
            "response.function_call_arguments.delta" => self.function_call_arguments_delta(obj),
            other => Err(ProtocolError::UnknownEventType(other.to_string())),
        }
    }

    /// Locate an item, synthesizing a placeholder when the id is unknown.
    fn ensure_item(&mut self, item_id: &str, event_type: &str) -> &mut Item {
        match self.items.entry(item_id.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                warn!(item_id, event_type, "item not tracked yet; creating placeholder");
                entry.insert(Item::placeholder(item_id))
            }
        }
    }

    // ── Event processors ──

    fn item_created(&mut self, obj: &Map<String, Value>) -> Result<EngineUpdate, ProtocolError> {
        let wire = parse_item(value_field(obj, "item")?)?;
        let id = wire.id.clone();

        let adopted_content = match self.items.entry(id.clone()) {
            Entry::Vacant(entry) => {
                let mut item = wire;
                item.formatted = Formatted::default();
                let _ = entry.insert(item);
                true
            }
            Entry::Occupied(mut entry) => {
                // Reconcile a placeholder (or a replayed creation) in place:
                // fill what is missing, keep everything already accumulated.
                let item = entry.get_mut();
                if item.detail.is_none() {
                    item.detail = wire.detail;
                }
                if item.content.is_empty() && !wire.content.is_empty() {
                    item.content = wire.content;
                    true
                } else {
                    false
                }
            }
        };

        let Self {
            items,
            queued_speech,
            queued_transcripts,
            queued_input_audio,
            ..
        } = self;
        let Some(item) = items.get_mut(&id) else {
            return Ok(EngineUpdate::none());
        };

        // A pending speech segment is consumed here only once its audio has
        // materialized; a start-only marker stays queued for speech_stopped.
        if queued_speech.get(&id).is_some_and(|s| s.audio.is_some()) {
            if let Some(PendingSpeech {
                audio: Some(audio), ..
            }) = queued_speech.remove(&id)
            {
                item.formatted.audio = audio;
            }
        }

        if adopted_content {
            for part in &item.content {
                if matches!(part.kind.as_deref(), Some("text" | "input_text")) {
                    if let Some(text) = &part.text {
                        item.formatted.text.push_str(text);
                    }
                }
            }
        }

        if let Some(transcript) = queued_transcripts.remove(&id) {
            item.formatted.transcript = transcript;
        }

        match item.detail.clone() {
            Some(ItemDetail::Message { role }) => {
                if role == Role::User {
                    item.set_status(ItemStatus::Completed);
                    if let Some(audio) = queued_input_audio.take() {
                        item.formatted.audio = audio;
                    }
                } else {
                    item.set_status(ItemStatus::InProgress);
                }
            }
            Some(ItemDetail::FunctionCall { call_id, name, .. }) => {
                let tool = item.formatted.tool.get_or_insert_with(FormattedTool::default);
                tool.name = name;
                tool.call_id = call_id;
                item.set_status(ItemStatus::InProgress);
            }
            Some(ItemDetail::FunctionCallOutput { output, .. }) => {
                item.set_status(ItemStatus::Completed);
                item.formatted.output = Some(output);
            }
            None => {}
        }

        info!(item_id = %id, "item created");
        Ok(EngineUpdate::item(item.clone()))
    }

    fn item_truncated(&mut self, obj: &Map<String, Value>) -> Result<EngineUpdate, ProtocolError> {
        let item_id = str_field(obj, "item_id")?;
        let audio_end_ms = u64_field(obj, "audio_end_ms")?;
        let item = self.ensure_item(item_id, "conversation.item.truncated");

        let end_index = ms_to_sample_index(audio_end_ms);
        item.formatted.transcript.clear();
        if item.formatted.audio.len() > end_index {
            item.formatted.audio.truncate(end_index);
        }
        Ok(EngineUpdate::item(item.clone()))
    }

    fn item_deleted(&mut self, obj: &Map<String, Value>) -> Result<EngineUpdate, ProtocolError> {
        let item_id = str_field(obj, "item_id")?;
        match self.items.shift_remove(item_id) {
            Some(item) => Ok(EngineUpdate::item(item)),
            None => {
                warn!(item_id, "item.deleted: unknown item");
                Ok(EngineUpdate::none())
            }
        }
    }

    fn transcription_completed(
        &mut self,
        obj: &Map<String, Value>,
    ) -> Result<EngineUpdate, ProtocolError> {
        let item_id = str_field(obj, "item_id")?;
        let content_index = usize_field(obj, "content_index")?;
        let transcript = str_field(obj, "transcript")?.to_string();
        let item = self.ensure_item(item_id, "conversation.item.input_audio_transcription.completed");

        item.content_slot(content_index).transcript = Some(transcript.clone());
        // Single-space sentinel: lets consumers tell "completed empty" from
        // "not yet started".
        item.formatted.transcript = if transcript.is_empty() {
            " ".to_string()
        } else {
            transcript.clone()
        };
        Ok(EngineUpdate::with_delta(
            item.clone(),
            ItemDelta {
                transcript: Some(transcript),
                ..ItemDelta::default()
            },
        ))
    }

    fn speech_started(&mut self, obj: &Map<String, Value>) -> Result<EngineUpdate, ProtocolError> {
        let item_id = str_field(obj, "item_id")?;
        let audio_start_ms = u64_field(obj, "audio_start_ms")?;
        let _ = self.queued_speech.insert(
            item_id.to_string(),
            PendingSpeech {
                audio_start_ms,
                audio_end_ms: None,
                audio: None,
            },
        );
        Ok(EngineUpdate::none())
    }

    fn speech_stopped(
        &mut self,
        obj: &Map<String, Value>,
        input_audio: Option<&[u8]>,
    ) -> Result<EngineUpdate, ProtocolError> {
        let item_id = str_field(obj, "item_id")?.to_string();
        let audio_end_ms = u64_field(obj, "audio_end_ms")?;

        let speech = self
            .queued_speech
            .entry(item_id.clone())
            .or_insert_with(|| PendingSpeech {
                audio_start_ms: audio_end_ms,
                audio_end_ms: None,
                audio: None,
            });
        speech.audio_end_ms = Some(audio_end_ms);
        let audio_start_ms = speech.audio_start_ms;

        if let Some(buffer) = input_audio.filter(|b| !b.is_empty()) {
            let start = ms_to_sample_index(audio_start_ms).min(buffer.len());
            let end = ms_to_sample_index(audio_end_ms).min(buffer.len());
            let slice = if start < end {
                buffer[start..end].to_vec()
            } else {
                Vec::new()
            };
            if let Some(item) = self.items.get_mut(&item_id) {
                // The item was created before the segment closed — attach
                // directly and consume the pending entry.
                item.formatted.audio = slice;
                let _ = self.queued_speech.remove(&item_id);
            } else if let Some(speech) = self.queued_speech.get_mut(&item_id) {
                speech.audio = Some(slice);
            }
        }
        Ok(EngineUpdate::none())
    }

    fn response_created(&mut self, obj: &Map<String, Value>) -> Result<EngineUpdate, ProtocolError> {
        let response: Response = serde_json::from_value(value_field(obj, "response")?.clone())
            .map_err(|e| ProtocolError::InvalidField {
                field: "response",
                reason: e.to_string(),
            })?;
        if !self.responses.contains_key(&response.id) {
            let _ = self.responses.insert(response.id.clone(), response);
        }
        Ok(EngineUpdate::none())
    }

    fn output_item_added(
        &mut self,
        obj: &Map<String, Value>,
    ) -> Result<EngineUpdate, ProtocolError> {
        let response_id = str_field(obj, "response_id")?;
        let item_id = obj
            .get("item")
            .and_then(|i| i.get("id"))
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingField { field: "item" })?;

        match self.responses.get_mut(response_id) {
            Some(response) => response.output.push(item_id.to_string()),
            None => warn!(response_id, "response.output_item.added: unknown response"),
        }
        Ok(EngineUpdate::none())
    }

    fn output_item_done(&mut self, obj: &Map<String, Value>) -> Result<EngineUpdate, ProtocolError> {
        let wire = parse_item(value_field(obj, "item")?)?;
        let id = wire.id.clone();
        let item = self.ensure_item(&id, "response.output_item.done");

        // Full merge: the payload is authoritative for everything except the
        // locally accumulated projection.
        item.set_status(wire.status);
        if wire.detail.is_some() {
            item.detail = wire.detail;
        }
        if !wire.content.is_empty() {
            item.content = wire.content;
        }
        if let Some(ItemDetail::FunctionCall {
            call_id,
            name,
            arguments,
        }) = item.detail.clone()
        {
            let tool = item.formatted.tool.get_or_insert_with(FormattedTool::default);
            tool.name = name;
            tool.call_id = call_id;
            if tool.arguments.is_empty() {
                tool.arguments = arguments;
            }
        }
        Ok(EngineUpdate::item(item.clone()))
    }

    fn content_part_added(
        &mut self,
        obj: &Map<String, Value>,
    ) -> Result<EngineUpdate, ProtocolError> {
        let item_id = str_field(obj, "item_id")?;
        let part: ContentPart = serde_json::from_value(value_field(obj, "part")?.clone())
            .map_err(|e| ProtocolError::InvalidField {
                field: "part",
                reason: e.to_string(),
            })?;
        let item = self.ensure_item(item_id, "response.content_part.added");
        item.content.push(part);
        Ok(EngineUpdate::item(item.clone()))
    }

    fn audio_transcript_delta(
        &mut self,
        obj: &Map<String, Value>,
    ) -> Result<EngineUpdate, ProtocolError> {
        let (item_id, content_index, delta) = indexed_delta_fields(obj)?;
        let item = self.ensure_item(item_id, "response.audio_transcript.delta");

        item.content_slot(content_index)
            .transcript
            .get_or_insert_with(String::new)
            .push_str(delta);
        item.formatted.transcript.push_str(delta);
        Ok(EngineUpdate::with_delta(
            item.clone(),
            ItemDelta {
                transcript: Some(delta.to_string()),
                ..ItemDelta::default()
            },
        ))
    }

    fn audio_delta(&mut self, obj: &Map<String, Value>) -> Result<EngineUpdate, ProtocolError> {
        let (item_id, content_index, delta) = indexed_delta_fields(obj)?;
        let decoded = decode_base64(delta).map_err(|e| ProtocolError::InvalidField {
            field: "delta",
            reason: e.to_string(),
        })?;
        let item = self.ensure_item(item_id, "response.audio.delta");

        item.content_slot(content_index)
            .audio
            .get_or_insert_with(String::new)
            .push_str(delta);
        item.formatted.audio.extend_from_slice(&decoded);
        Ok(EngineUpdate::with_delta(
            item.clone(),
            ItemDelta {
                audio: Some(decoded),
                ..ItemDelta::default()
            },
        ))
    }

    fn text_delta(&mut self, obj: &Map<String, Value>) -> Result<EngineUpdate, ProtocolError> {
        let (item_id, content_index, delta) = indexed_delta_fields(obj)?;
        let item = self.ensure_item(item_id, "response.text.delta");

        item.content_slot(content_index)
            .text
            .get_or_insert_with(String::new)
            .push_str(delta);
        item.formatted.text.push_str(delta);
        Ok(EngineUpdate::with_delta(
            item.clone(),
            ItemDelta {
                text: Some(delta.to_string()),
                ..ItemDelta::default()
            },
        ))
    }

    fn function_call_arguments_delta(
        &mut self,
        obj: &Map<String, Value>,
    ) -> Result<EngineUpdate, ProtocolError> {
        let item_id = str_field(obj, "item_id")?;
        let delta = str_field(obj, "delta")?;
        let item = self.ensure_item(item_id, "response.function_call_arguments.delta");

        if let Some(ItemDetail::FunctionCall { arguments, .. }) = &mut item.detail {
            arguments.push_str(delta);
        }
        item.formatted
            .tool
            .get_or_insert_with(FormattedTool::default)
            .arguments
            .push_str(delta);
        Ok(EngineUpdate::with_delta(
            item.clone(),
            ItemDelta {
                arguments: Some(delta.to_string()),
                ..ItemDelta::default()
            },
        ))
    }
}

/// Millisecond mark → index into the raw byte buffer at the fixed sample
/// rate. No per-sample byte-width factor is applied — this matches the wire
/// contract's own truncation arithmetic.
fn ms_to_sample_index(ms: u64) -> usize {
    (ms * SAMPLE_RATE_HZ / 1000) as usize
}

fn parse_item(value: &Value) -> Result<Item, ProtocolError> {
    serde_json::from_value(value.clone()).map_err(|e| ProtocolError::InvalidField {
        field: "item",
        reason: e.to_string(),
    })
}

fn value_field<'a>(
    obj: &'a Map<String, Value>,
    field: &'static str,
) -> Result<&'a Value, ProtocolError> {
    obj.get(field).ok_or(ProtocolError::MissingField { field })
}

fn str_field<'a>(
    obj: &'a Map<String, Value>,
    field: &'static str,
) -> Result<&'a str, ProtocolError> {
    obj.get(field)
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingField { field })
}

fn u64_field(obj: &Map<String, Value>, field: &'static str) -> Result<u64, ProtocolError> {
    obj.get(field)
        .and_then(Value::as_u64)
        .ok_or(ProtocolError::MissingField { field })
}

fn usize_field(obj: &Map<String, Value>, field: &'static str) -> Result<usize, ProtocolError> {
    u64_field(obj, field).map(|v| v as usize)
}

fn indexed_delta_fields<'a>(
    obj: &'a Map<String, Value>,
) -> Result<(&'a str, usize, &'a str), ProtocolError> {
    Ok((
        str_field(obj, "item_id")?,
        usize_field(obj, "content_index")?,
        str_field(obj, "delta")?,
    ))
}
