use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const PAIRING_CODE_LEN: usize = 6;
pub const MAX_RELAY_FRAME_BYTES: usize = 20 * 1024 * 1024;
pub const HEARTBEAT_INTERVAL_MS: u64 = 90_000;
pub const CONNECT_WATCHDOG_MS: u64 = 10_000;
pub const RECONNECT_BASE_MS: u64 = 500;
pub const RECONNECT_MAX_MS: u64 = 5_000;
pub const RECONNECT_JITTER_MS: u64 = 300;
pub const STOP_COOLDOWN_MS: u64 = 2_000;
pub const STOP_STUCK_THRESHOLD_MS: u64 = 10_000;
pub const DEDUP_MAX_ENTRIES: usize = 100;
pub const DEDUP_TRIM_TO: usize = 50;

/// Length of the first-image suffix folded into the dedup fingerprint.
const FINGERPRINT_TAIL_CHARS: usize = 32;

#[derive(Debug, Error)]
pub enum CodeError {
    #[error("pairing code must be exactly {PAIRING_CODE_LEN} digits")]
    InvalidFormat,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame is not valid JSON: {0}")]
    Json(String),
    #[error("frame has no string \"type\" field")]
    MissingType,
    #[error("malformed {kind} frame: {detail}")]
    Payload { kind: String, detail: String },
    #[error("cannot encode unrecognized message kind \"{0}\"")]
    EncodeUnrecognized(String),
}

/// Validated 6-digit pairing code. Construction is the only format check in
/// the system; everything downstream accepts the newtype.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PairingCode(String);

impl PairingCode {
    pub fn parse(input: &str) -> Result<Self, CodeError> {
        let trimmed = input.trim();
        if trimmed.len() != PAIRING_CODE_LEN || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(CodeError::InvalidFormat);
        }
        Ok(Self(trimmed.to_owned()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PairingCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PairingCode {
    type Error = CodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PairingCode> for String {
    fn from(code: PairingCode) -> Self {
        code.0
    }
}

fn default_total() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ScreenshotSingle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base64: Option<String>,
    #[serde(default)]
    pub index: u32,
    #[serde(default = "default_total")]
    pub total: u32,
    /// Absent on the wire means immediate.
    #[serde(default = "default_true")]
    pub process_immediate: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ScreenshotBatch {
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default = "default_true")]
    pub process_immediate: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

/// Every frame the relay carries, resolved once at the parse boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProtocolMessage {
    ConnectionRequest { code: PairingCode, ts: u64 },
    GetHistory,
    HistoryRestore {
        #[serde(default)]
        payload: Value,
    },
    Screenshot(ScreenshotSingle),
    ScreenshotBatch(ScreenshotBatch),
    PartnerConnected,
    PartnerDisconnected,
    WaitingForClient,
    ConnectionTest,
    TestConnection,
    Ping { ts: u64 },
    SaveHistory { payload: Value },
    ClearHistory,
    Error {
        #[serde(default)]
        message: String,
    },
    /// Synthesized for unknown `type` tags so consumers can log and move on.
    /// Never serialized.
    #[serde(skip)]
    Unrecognized { kind: String },
}

const KNOWN_KINDS: &[&str] = &[
    "connection_request",
    "get_history",
    "history_restore",
    "screenshot",
    "screenshot_batch",
    "partner_connected",
    "partner_disconnected",
    "waiting_for_client",
    "connection_test",
    "test_connection",
    "ping",
    "save_history",
    "clear_history",
    "error",
];

/// Screenshot payload fields may arrive nested under `payload` or flattened
/// at the top level. Decode lifts a nested payload object exactly once, so
/// the rest of the system only ever sees the canonical shape.
pub fn decode_message(text: &str) -> Result<ProtocolMessage, ProtocolError> {
    let value: Value = serde_json::from_str(text).map_err(|err| ProtocolError::Json(err.to_string()))?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)?
        .to_owned();

    if !KNOWN_KINDS.contains(&kind.as_str()) {
        return Ok(ProtocolMessage::Unrecognized { kind });
    }

    let normalized = match kind.as_str() {
        "screenshot" | "screenshot_batch" => lift_payload(value),
        _ => value,
    };

    serde_json::from_value(normalized).map_err(|err| ProtocolError::Payload {
        kind,
        detail: err.to_string(),
    })
}

/// Encoding always writes the canonical top-level shape.
pub fn encode_message(message: &ProtocolMessage) -> Result<String, ProtocolError> {
    if let ProtocolMessage::Unrecognized { kind } = message {
        return Err(ProtocolError::EncodeUnrecognized(kind.clone()));
    }
    serde_json::to_string(message).map_err(|err| ProtocolError::Json(err.to_string()))
}

fn lift_payload(mut value: Value) -> Value {
    let Some(object) = value.as_object_mut() else {
        return value;
    };
    if !matches!(object.get("payload"), Some(Value::Object(_))) {
        return value;
    }
    let Some(Value::Object(payload)) = object.remove("payload") else {
        return value;
    };
    for (key, inner) in payload {
        object.entry(key).or_insert(inner);
    }
    value
}

/// One wire image normalized for display and analysis, whether it arrived as
/// a bare base64 string or a full data URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedImage {
    pub base64: String,
    pub mime_type: String,
    pub data_url: String,
    pub source_tag: String,
}

pub fn normalize_image(raw: &str, source_tag: &str) -> NormalizedImage {
    let (mime_from_url, base64_body) = match raw.strip_prefix("data:") {
        Some(rest) => match rest.split_once(";base64,") {
            Some((mime, body)) => (Some(mime.to_owned()), body.to_owned()),
            None => (None, rest.to_owned()),
        },
        None => (None, raw.to_owned()),
    };

    let mime_type = mime_from_url
        .filter(|mime| !mime.is_empty())
        .unwrap_or_else(|| sniff_mime_from_base64(&base64_body).to_owned());

    let data_url = format!("data:{mime_type};base64,{base64_body}");
    NormalizedImage {
        base64: base64_body,
        mime_type,
        data_url,
        source_tag: source_tag.to_owned(),
    }
}

/// Decode just enough of the payload to read the magic bytes. An aligned
/// prefix of valid base64 decodes on its own.
fn sniff_mime_from_base64(body: &str) -> &'static str {
    let take = body.len().min(24);
    let take = take - take % 4;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(&body.as_bytes()[..take])
        .unwrap_or_default();
    sniff_mime(&decoded)
}

pub fn sniff_mime(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        "image/png"
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "image/jpeg"
    } else if bytes.starts_with(b"GIF8") {
        "image/gif"
    } else if bytes.len() >= 12 && bytes.starts_with(b"RIFF") && &bytes[8..12] == b"WEBP" {
        "image/webp"
    } else {
        "image/png"
    }
}

/// Cheap content fingerprint for redelivery detection: timestamp, image
/// count, and the tail of the first image payload, digested. Distinct
/// batches sharing all three components collide.
pub fn dedup_fingerprint(timestamp: Option<u64>, image_count: usize, first_image: &str) -> String {
    let mut tail_start = first_image.len().saturating_sub(FINGERPRINT_TAIL_CHARS);
    while !first_image.is_char_boundary(tail_start) {
        tail_start += 1;
    }
    let tail = &first_image[tail_start..];

    let mut hasher = Sha256::new();
    hasher.update(timestamp.unwrap_or(0).to_le_bytes());
    hasher.update((image_count as u64).to_le_bytes());
    hasher.update(tail.as_bytes());
    hex::encode(hasher.finalize())
}
