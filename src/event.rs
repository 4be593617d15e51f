//! The `AgentEvent` codec — the one place that knows the on-the-wire shape
//! of the typed envelope carried end-to-end between mobile client and laptop.
//!
//! Wire format is a JSON object with lower-snake field names:
//!
//! ```json
//! {
//!   "type": "command_text",
//!   "session_id": "s1",
//!   "message_id": "m1",
//!   "parent_id": "m0",
//!   "timestamp": 1722500000000,
//!   "payload": {"text": "hi"}
//! }
//! ```
//!
//! Decoding is strict: an unknown `type` is rejected, missing required fields
//! and out-of-range enum values are rejected with a structured failure.
//! Unknown payload fields are ignored for dispatch but preserved in an extras
//! bag so re-encoding round-trips them (forward compatibility).

use serde_json::{Map, Value};

/// Why a frame failed to decode. The four codes are stable and surface in
/// logs; they never reach the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The frame is not a JSON object.
    MalformedJson,
    /// The `type` field names no known event variant.
    UnknownType(String),
    /// A required envelope or payload field is absent or of the wrong shape.
    MissingRequiredField(&'static str),
    /// An enum-valued field carries a value outside its domain.
    InvalidEnum(&'static str, String),
}

impl DecodeError {
    /// Stable snake_case code for structured logging.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MalformedJson => "malformed_json",
            Self::UnknownType(_) => "unknown_type",
            Self::MissingRequiredField(_) => "missing_required_field",
            Self::InvalidEnum(..) => "invalid_enum",
        }
    }
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedJson => write!(f, "malformed JSON frame"),
            Self::UnknownType(t) => write!(f, "unknown event type '{t}'"),
            Self::MissingRequiredField(field) => write!(f, "missing required field '{field}'"),
            Self::InvalidEnum(field, value) => {
                write!(f, "invalid value '{value}' for field '{field}'")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// Audio container for `command_voice` uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceFormat {
    Wav,
    M4a,
    Opus,
}

impl VoiceFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Wav => "wav",
            Self::M4a => "m4a",
            Self::Opus => "opus",
        }
    }

    fn parse(value: &str) -> Result<Self, DecodeError> {
        match value {
            "wav" => Ok(Self::Wav),
            "m4a" => Ok(Self::M4a),
            "opus" => Ok(Self::Opus),
            other => Err(DecodeError::InvalidEnum("format", other.to_string())),
        }
    }
}

/// Audio container for synthesized `tts_audio` replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtsFormat {
    Mp3,
    Opus,
}

impl TtsFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::Opus => "opus",
        }
    }

    fn parse(value: &str) -> Result<Self, DecodeError> {
        match value {
            "mp3" => Ok(Self::Mp3),
            "opus" => Ok(Self::Opus),
            other => Err(DecodeError::InvalidEnum("format", other.to_string())),
        }
    }
}

/// Type-specific payload of an [`AgentEvent`]. Each variant keeps an `extra`
/// map of payload fields it does not understand.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentPayload {
    /// client → laptop: typed command text.
    CommandText { text: String, extra: Map<String, Value> },
    /// client → laptop: recorded audio to transcribe and execute.
    CommandVoice {
        audio_base64: String,
        format: VoiceFormat,
        extra: Map<String, Value>,
    },
    /// client → laptop: drop conversational context.
    ContextReset { extra: Map<String, Value> },
    /// laptop → client: speech-to-text result.
    Transcription {
        text: String,
        confidence: Option<f64>,
        extra: Map<String, Value>,
    },
    /// laptop → client: assistant output, streamed or final.
    AssistantMessage {
        content: String,
        is_final: bool,
        metadata: Option<Value>,
        extra: Map<String, Value>,
    },
    /// laptop → client: synthesized speech for an assistant message.
    TtsAudio {
        audio_base64: String,
        format: TtsFormat,
        duration_ms: u64,
        transcript: String,
        extra: Map<String, Value>,
    },
    /// laptop → client: terminal outcome of a command.
    Completion {
        success: bool,
        result: Option<Value>,
        error: Option<String>,
        extra: Map<String, Value>,
    },
    /// laptop → client: structured failure.
    Error {
        code: String,
        message: String,
        details: Option<Value>,
        extra: Map<String, Value>,
    },
}

impl AgentPayload {
    /// The wire value of the envelope's `type` field.
    pub fn type_str(&self) -> &'static str {
        match self {
            Self::CommandText { .. } => "command_text",
            Self::CommandVoice { .. } => "command_voice",
            Self::ContextReset { .. } => "context_reset",
            Self::Transcription { .. } => "transcription",
            Self::AssistantMessage { .. } => "assistant_message",
            Self::TtsAudio { .. } => "tts_audio",
            Self::Completion { .. } => "completion",
            Self::Error { .. } => "error",
        }
    }
}

/// The typed envelope. `session_id` is opaque and server-allocated at first
/// use; `message_id` is globally unique; `parent_id`, when present, names an
/// earlier message in the same session and establishes causal ordering.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentEvent {
    pub session_id: String,
    pub message_id: String,
    pub parent_id: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub payload: AgentPayload,
    /// Unknown envelope fields, preserved across re-encoding.
    pub extra: Map<String, Value>,
}

impl AgentEvent {
    pub fn new(session_id: impl Into<String>, message_id: impl Into<String>, timestamp: i64, payload: AgentPayload) -> Self {
        Self {
            session_id: session_id.into(),
            message_id: message_id.into(),
            parent_id: None,
            timestamp,
            payload,
            extra: Map::new(),
        }
    }

    /// Decode a single textual frame.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_str(text).map_err(|_| DecodeError::MalformedJson)?;
        Self::decode_value(value)
    }

    /// Decode an already-parsed JSON value (used when the event arrives
    /// embedded in a tunnel frame).
    pub fn decode_value(value: Value) -> Result<Self, DecodeError> {
        let Value::Object(mut obj) = value else {
            return Err(DecodeError::MalformedJson);
        };

        let kind = match obj.remove("type") {
            Some(Value::String(s)) => s,
            _ => return Err(DecodeError::MissingRequiredField("type")),
        };
        let session_id = take_string(&mut obj, "session_id")?;
        let message_id = take_string(&mut obj, "message_id")?;
        let timestamp = match obj.remove("timestamp") {
            Some(Value::Number(n)) => n
                .as_i64()
                .ok_or(DecodeError::MissingRequiredField("timestamp"))?,
            _ => return Err(DecodeError::MissingRequiredField("timestamp")),
        };
        let parent_id = match obj.remove("parent_id") {
            Some(Value::String(s)) => Some(s),
            Some(Value::Null) | None => None,
            Some(_) => return Err(DecodeError::MissingRequiredField("parent_id")),
        };
        let payload_obj = match obj.remove("payload") {
            Some(Value::Object(p)) => p,
            Some(Value::Null) | None => Map::new(),
            Some(_) => return Err(DecodeError::MissingRequiredField("payload")),
        };

        let payload = decode_payload(&kind, payload_obj)?;

        Ok(Self {
            session_id,
            message_id,
            parent_id,
            timestamp,
            payload,
            extra: obj,
        })
    }

    /// Canonical JSON value for this event. `decode_value(to_value(e)) == e`
    /// for every valid event.
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("type".into(), Value::String(self.payload.type_str().into()));
        obj.insert("session_id".into(), Value::String(self.session_id.clone()));
        obj.insert("message_id".into(), Value::String(self.message_id.clone()));
        if let Some(parent) = &self.parent_id {
            obj.insert("parent_id".into(), Value::String(parent.clone()));
        }
        obj.insert("timestamp".into(), Value::Number(self.timestamp.into()));
        obj.insert("payload".into(), Value::Object(encode_payload(&self.payload)));
        for (k, v) in &self.extra {
            obj.entry(k.clone()).or_insert_with(|| v.clone());
        }
        Value::Object(obj)
    }

    /// Serialize to a single textual frame.
    pub fn encode(&self) -> String {
        serde_json::to_string(&self.to_value()).unwrap_or_else(|_| "{}".to_string())
    }
}

impl serde::Serialize for AgentEvent {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for AgentEvent {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::decode_value(value).map_err(serde::de::Error::custom)
    }
}

fn decode_payload(kind: &str, mut p: Map<String, Value>) -> Result<AgentPayload, DecodeError> {
    match kind {
        "command_text" => Ok(AgentPayload::CommandText {
            text: take_string(&mut p, "text")?,
            extra: p,
        }),
        "command_voice" => Ok(AgentPayload::CommandVoice {
            audio_base64: take_string(&mut p, "audio_base64")?,
            format: VoiceFormat::parse(&take_string(&mut p, "format")?)?,
            extra: p,
        }),
        "context_reset" => Ok(AgentPayload::ContextReset { extra: p }),
        "transcription" => Ok(AgentPayload::Transcription {
            text: take_string(&mut p, "text")?,
            confidence: take_optional_f64(&mut p, "confidence")?,
            extra: p,
        }),
        "assistant_message" => Ok(AgentPayload::AssistantMessage {
            content: take_string(&mut p, "content")?,
            is_final: take_bool(&mut p, "is_final")?,
            metadata: p.remove("metadata").filter(|v| !v.is_null()),
            extra: p,
        }),
        "tts_audio" => Ok(AgentPayload::TtsAudio {
            audio_base64: take_string(&mut p, "audio_base64")?,
            format: TtsFormat::parse(&take_string(&mut p, "format")?)?,
            duration_ms: take_u64(&mut p, "duration_ms")?,
            transcript: take_string(&mut p, "transcript")?,
            extra: p,
        }),
        "completion" => Ok(AgentPayload::Completion {
            success: take_bool(&mut p, "success")?,
            result: p.remove("result").filter(|v| !v.is_null()),
            error: take_optional_string(&mut p, "error")?,
            extra: p,
        }),
        "error" => Ok(AgentPayload::Error {
            code: take_string(&mut p, "code")?,
            message: take_string(&mut p, "message")?,
            details: p.remove("details").filter(|v| !v.is_null()),
            extra: p,
        }),
        other => Err(DecodeError::UnknownType(other.to_string())),
    }
}

fn encode_payload(payload: &AgentPayload) -> Map<String, Value> {
    let mut p = Map::new();
    let extra = match payload {
        AgentPayload::CommandText { text, extra } => {
            p.insert("text".into(), Value::String(text.clone()));
            extra
        }
        AgentPayload::CommandVoice {
            audio_base64,
            format,
            extra,
        } => {
            p.insert("audio_base64".into(), Value::String(audio_base64.clone()));
            p.insert("format".into(), Value::String(format.as_str().into()));
            extra
        }
        AgentPayload::ContextReset { extra } => extra,
        AgentPayload::Transcription {
            text,
            confidence,
            extra,
        } => {
            p.insert("text".into(), Value::String(text.clone()));
            if let Some(confidence) = confidence {
                if let Some(n) = serde_json::Number::from_f64(*confidence) {
                    p.insert("confidence".into(), Value::Number(n));
                }
            }
            extra
        }
        AgentPayload::AssistantMessage {
            content,
            is_final,
            metadata,
            extra,
        } => {
            p.insert("content".into(), Value::String(content.clone()));
            p.insert("is_final".into(), Value::Bool(*is_final));
            if let Some(metadata) = metadata {
                p.insert("metadata".into(), metadata.clone());
            }
            extra
        }
        AgentPayload::TtsAudio {
            audio_base64,
            format,
            duration_ms,
            transcript,
            extra,
        } => {
            p.insert("audio_base64".into(), Value::String(audio_base64.clone()));
            p.insert("format".into(), Value::String(format.as_str().into()));
            p.insert("duration_ms".into(), Value::Number((*duration_ms).into()));
            p.insert("transcript".into(), Value::String(transcript.clone()));
            extra
        }
        AgentPayload::Completion {
            success,
            result,
            error,
            extra,
        } => {
            p.insert("success".into(), Value::Bool(*success));
            if let Some(result) = result {
                p.insert("result".into(), result.clone());
            }
            if let Some(error) = error {
                p.insert("error".into(), Value::String(error.clone()));
            }
            extra
        }
        AgentPayload::Error {
            code,
            message,
            details,
            extra,
        } => {
            p.insert("code".into(), Value::String(code.clone()));
            p.insert("message".into(), Value::String(message.clone()));
            if let Some(details) = details {
                p.insert("details".into(), details.clone());
            }
            extra
        }
    };
    for (k, v) in extra {
        p.entry(k.clone()).or_insert_with(|| v.clone());
    }
    p
}

fn take_string(obj: &mut Map<String, Value>, key: &'static str) -> Result<String, DecodeError> {
    match obj.remove(key) {
        Some(Value::String(s)) => Ok(s),
        _ => Err(DecodeError::MissingRequiredField(key)),
    }
}

fn take_optional_string(
    obj: &mut Map<String, Value>,
    key: &'static str,
) -> Result<Option<String>, DecodeError> {
    match obj.remove(key) {
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Null) | None => Ok(None),
        Some(_) => Err(DecodeError::MissingRequiredField(key)),
    }
}

fn take_bool(obj: &mut Map<String, Value>, key: &'static str) -> Result<bool, DecodeError> {
    match obj.remove(key) {
        Some(Value::Bool(b)) => Ok(b),
        _ => Err(DecodeError::MissingRequiredField(key)),
    }
}

fn take_u64(obj: &mut Map<String, Value>, key: &'static str) -> Result<u64, DecodeError> {
    match obj.remove(key) {
        Some(Value::Number(n)) => n.as_u64().ok_or(DecodeError::MissingRequiredField(key)),
        _ => Err(DecodeError::MissingRequiredField(key)),
    }
}

fn take_optional_f64(
    obj: &mut Map<String, Value>,
    key: &'static str,
) -> Result<Option<f64>, DecodeError> {
    match obj.remove(key) {
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(Value::Null) | None => Ok(None),
        Some(_) => Err(DecodeError::MissingRequiredField(key)),
    }
}
