//! Conversation request model and upstream wire format
//!
//! One `ConversationRequest` is one turn sent upstream. A chain starts with a
//! `next` request authored by the caller and may be followed by any number of
//! `continue` requests synthesized by the relay.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::classify::TruncationPoint;
use crate::proxy::ProxyError;

const DEFAULT_ROLE: &str = "user";
const DEFAULT_CONTENT_TYPE: &str = "text";

/// What the upstream should do with this turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Start or extend a conversation with caller-authored messages
    #[default]
    Next,
    /// Resume a truncated assistant message without new input
    Continue,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Next => "next",
            Action::Continue => "continue",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Author {
    #[serde(default)]
    pub role: String,
}

impl Default for Author {
    fn default() -> Self {
        Self {
            role: DEFAULT_ROLE.to_string(),
        }
    }
}

/// Message body. Callers may send a bare string, which becomes a single text part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "ContentRepr")]
pub struct MessageContent {
    pub content_type: String,
    pub parts: Vec<Value>,
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            parts: vec![Value::String(text.into())],
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ContentRepr {
    Text(String),
    Structured {
        #[serde(default = "default_content_type")]
        content_type: String,
        #[serde(default)]
        parts: Vec<Value>,
    },
}

impl From<ContentRepr> for MessageContent {
    fn from(repr: ContentRepr) -> Self {
        match repr {
            ContentRepr::Text(text) => MessageContent::text(text),
            ContentRepr::Structured {
                content_type,
                parts,
            } => MessageContent {
                content_type,
                parts,
            },
        }
    }
}

fn default_content_type() -> String {
    DEFAULT_CONTENT_TYPE.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub author: Author,
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            author: Author::default(),
            content: MessageContent::text(text),
            metadata: None,
        }
    }
}

/// One turn sent to the upstream conversation endpoint.
///
/// The same shape is accepted from clients and serialized upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationRequest {
    #[serde(default)]
    pub action: Action,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Message>,
    pub model: String,
    #[serde(default)]
    pub parent_message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone_offset_min: Option<i32>,
    #[serde(default)]
    pub history_and_training_disabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arkose_token: Option<String>,
    #[serde(default)]
    pub auto_continue: bool,
}

impl ConversationRequest {
    /// A fresh `next` request with a single user message
    pub fn new(model: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            action: Action::Next,
            messages: vec![Message::user(text)],
            model: model.into(),
            parent_message_id: Uuid::new_v4().to_string(),
            conversation_id: None,
            timezone_offset_min: None,
            history_and_training_disabled: false,
            arkose_token: None,
            auto_continue: false,
        }
    }

    /// Decode a client body and normalize it for the upstream.
    pub fn from_slice(body: &[u8]) -> Result<Self, ProxyError> {
        let request: ConversationRequest = serde_json::from_slice(body)
            .map_err(|e| ProxyError::Request(format!("Failed to parse json request body: {e}")))?;
        request.normalize()
    }

    /// Fill defaults the upstream requires and reject requests it cannot serve.
    pub fn normalize(mut self) -> Result<Self, ProxyError> {
        if self.model.trim().is_empty() {
            return Err(ProxyError::Request("model is required".to_string()));
        }

        if self
            .conversation_id
            .as_deref()
            .is_some_and(|id| id.trim().is_empty())
        {
            self.conversation_id = None;
        }

        if self.arkose_token.as_deref().is_some_and(str::is_empty) {
            self.arkose_token = None;
        }

        match self.action {
            Action::Next => {
                if self.messages.is_empty() {
                    return Err(ProxyError::Request(
                        "messages must contain at least one message".to_string(),
                    ));
                }
                if self.parent_message_id.trim().is_empty() {
                    self.parent_message_id = Uuid::new_v4().to_string();
                }
            }
            Action::Continue => {
                if self.parent_message_id.trim().is_empty() {
                    return Err(ProxyError::Request(
                        "parent_message_id is required to continue".to_string(),
                    ));
                }
            }
        }

        for message in &mut self.messages {
            if message.id.is_empty() {
                message.id = Uuid::new_v4().to_string();
            }
            if message.author.role.is_empty() {
                message.author.role = DEFAULT_ROLE.to_string();
            }
        }

        Ok(self)
    }

    /// Build the `continue` turn that resumes `point`.
    ///
    /// Ids come only from the truncated message. Model, challenge token,
    /// carry-over flags and the auto-continue policy come from `self`.
    pub fn continuation(&self, point: &TruncationPoint) -> Self {
        Self {
            action: Action::Continue,
            messages: Vec::new(),
            model: self.model.clone(),
            parent_message_id: point.message_id.clone(),
            conversation_id: point.conversation_id.clone(),
            timezone_offset_min: self.timezone_offset_min,
            history_and_training_disabled: self.history_and_training_disabled,
            arkose_token: self.arkose_token.clone(),
            auto_continue: self.auto_continue,
        }
    }
}
