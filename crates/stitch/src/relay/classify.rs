//! Classification of decoded upstream SSE lines
//!
//! Upstream content is untrusted, so `classify` never fails: lines that do
//! not decode are still relayed, they just cannot trigger a continuation.

use serde::Deserialize;

/// Finish type the upstream reports when it stopped on a length limit
pub const TRUNCATION_MARKER: &str = "max_tokens";

/// Message status that accompanies a truncation the upstream completed cleanly
pub const FINISHED_SUCCESSFULLY: &str = "finished_successfully";

const TERMINATOR: &str = "[DONE]";
const DATA_PREFIX: &str = "data: ";
const EVENT_PREFIX: &str = "event";
const NOTICE_PREFIX: &str = "data: 20";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Empty line between frames
    Blank,
    /// `event: ...` line, never relayed
    EventMeta,
    /// Non-content notification whose JSON starts with a year (`data: 20..`)
    Notice,
    /// `data: [DONE]`
    Terminator,
    /// Any other payload, JSON or not
    Data,
}

impl EventKind {
    /// Whether a line of this kind is written to the client
    pub fn is_forwarded(self) -> bool {
        matches!(self, EventKind::Terminator | EventKind::Data)
    }
}

/// The message a truncated generation stopped at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TruncationPoint {
    pub message_id: String,
    pub conversation_id: Option<String>,
}

/// The parts of a content frame the relay cares about
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageFragment {
    pub message_id: Option<String>,
    pub conversation_id: Option<String>,
    pub finish_type: Option<String>,
    pub status: Option<String>,
}

impl MessageFragment {
    fn decode(payload: &str) -> Option<Self> {
        let frame: WireFrame = serde_json::from_str(payload).ok()?;
        let message = frame.message.unwrap_or_default();
        let finish_type = message
            .metadata
            .and_then(|m| m.finish_details)
            .and_then(|d| d.kind);

        Some(Self {
            message_id: message.id,
            conversation_id: frame.conversation_id,
            finish_type,
            status: message.status,
        })
    }

    /// True when the upstream finished this message because it hit the length limit
    pub fn is_truncated(&self) -> bool {
        self.finish_type.as_deref() == Some(TRUNCATION_MARKER)
            && self.status.as_deref() == Some(FINISHED_SUCCESSFULLY)
    }
}

#[derive(Deserialize)]
struct WireFrame {
    #[serde(default)]
    message: Option<WireMessage>,
    #[serde(default)]
    conversation_id: Option<String>,
}

#[derive(Deserialize, Default)]
struct WireMessage {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    metadata: Option<WireMetadata>,
}

#[derive(Deserialize)]
struct WireMetadata {
    #[serde(default)]
    finish_details: Option<WireFinishDetails>,
}

#[derive(Deserialize)]
struct WireFinishDetails {
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

/// One classified line of the upstream body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamEvent {
    /// The trimmed line, exactly as it is relayed
    pub raw: String,
    pub kind: EventKind,
    /// Present only for DATA lines whose payload decoded as a frame
    pub fragment: Option<MessageFragment>,
    /// Present only when this line signals a truncated generation
    pub truncation: Option<TruncationPoint>,
}

impl UpstreamEvent {
    fn skipped(raw: &str, kind: EventKind) -> Self {
        Self {
            raw: raw.to_string(),
            kind,
            fragment: None,
            truncation: None,
        }
    }
}

/// Classify one decoded line. Pure: the same line always yields the same event.
pub fn classify(line: &str) -> UpstreamEvent {
    let line = line.trim();

    if line.is_empty() {
        return UpstreamEvent::skipped(line, EventKind::Blank);
    }
    if line.starts_with(EVENT_PREFIX) {
        return UpstreamEvent::skipped(line, EventKind::EventMeta);
    }
    if line.starts_with(NOTICE_PREFIX) {
        return UpstreamEvent::skipped(line, EventKind::Notice);
    }

    let payload = line.strip_prefix(DATA_PREFIX).unwrap_or(line);

    if payload.starts_with(TERMINATOR) {
        return UpstreamEvent::skipped(line, EventKind::Terminator);
    }

    let fragment = MessageFragment::decode(payload);
    let truncation = if payload.contains(TRUNCATION_MARKER) {
        fragment.as_ref().and_then(truncation_point)
    } else {
        None
    };

    UpstreamEvent {
        raw: line.to_string(),
        kind: EventKind::Data,
        fragment,
        truncation,
    }
}

/// The substring gate only finds candidates; marker text inside message
/// content passes it, so the decoded finish details make the decision.
fn truncation_point(fragment: &MessageFragment) -> Option<TruncationPoint> {
    if !fragment.is_truncated() {
        return None;
    }
    Some(TruncationPoint {
        message_id: fragment.message_id.clone()?,
        conversation_id: fragment.conversation_id.clone(),
    })
}
