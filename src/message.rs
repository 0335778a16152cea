//! Chat messages and their stored representation.
//!
//! A stored message is a `(type, data)` pair: `type` is the tag from
//! [`MessageType`] and `data` is a JSON object holding `content`,
//! `additional_kwargs`, `response_metadata`, `type`, `name`, `id`, the
//! variant's own key (`role`, `name` or `tool_call_id`) and any other fields
//! the writer attached.

use crate::error::MssqlError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Tag stored in the `type` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Human,
    Ai,
    System,
    Chat,
    Function,
    Tool,
}

impl MessageType {
    /// Every known tag.
    pub const ALL: [MessageType; 6] = [
        MessageType::Human,
        MessageType::Ai,
        MessageType::System,
        MessageType::Chat,
        MessageType::Function,
        MessageType::Tool,
    ];

    /// The stored tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Human => "human",
            MessageType::Ai => "ai",
            MessageType::System => "system",
            MessageType::Chat => "chat",
            MessageType::Function => "function",
            MessageType::Tool => "tool",
        }
    }

    /// Payload key that only this variant carries, if any.
    fn variant_key(&self) -> Option<&'static str> {
        match self {
            MessageType::Chat => Some("role"),
            MessageType::Function => Some("name"),
            MessageType::Tool => Some("tool_call_id"),
            _ => None,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = MssqlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| MssqlError::decode(format!("Unknown message type '{}'", s)))
    }
}

/// Fields shared by every message variant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageData {
    /// Message text
    pub content: String,

    /// Provider-specific extras (tool calls, function calls, ...)
    #[serde(default)]
    pub additional_kwargs: Map<String, Value>,

    /// Response headers, token counts, model name, ...
    #[serde(default)]
    pub response_metadata: Map<String, Value>,

    /// Optional speaker name
    #[serde(default)]
    pub name: Option<String>,

    /// Optional message id
    #[serde(default)]
    pub id: Option<String>,

    /// Fields written by other clients that this crate does not model
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MessageData {
    /// Message data with only content set.
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }
}

/// A chat message, closed over the supported variants.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatMessage {
    Human(MessageData),
    Ai(MessageData),
    System(MessageData),
    Chat { role: String, data: MessageData },
    Function { name: String, data: MessageData },
    Tool { tool_call_id: String, data: MessageData },
}

/// A message as stored in a history row.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    /// `type` column value
    pub message_type: MessageType,

    /// `data` column value (JSON text)
    pub data: String,
}

impl ChatMessage {
    /// A message from the user.
    pub fn human(content: impl Into<String>) -> Self {
        ChatMessage::Human(MessageData::new(content))
    }

    /// A message from the model.
    pub fn ai(content: impl Into<String>) -> Self {
        ChatMessage::Ai(MessageData::new(content))
    }

    /// A system prompt.
    pub fn system(content: impl Into<String>) -> Self {
        ChatMessage::System(MessageData::new(content))
    }

    /// A message with an arbitrary speaker role.
    pub fn chat(role: impl Into<String>, content: impl Into<String>) -> Self {
        ChatMessage::Chat {
            role: role.into(),
            data: MessageData::new(content),
        }
    }

    /// The result of a function call.
    pub fn function(name: impl Into<String>, content: impl Into<String>) -> Self {
        ChatMessage::Function {
            name: name.into(),
            data: MessageData::new(content),
        }
    }

    /// The result of a tool call.
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        ChatMessage::Tool {
            tool_call_id: tool_call_id.into(),
            data: MessageData::new(content),
        }
    }

    /// The variant's tag.
    pub fn message_type(&self) -> MessageType {
        match self {
            ChatMessage::Human(_) => MessageType::Human,
            ChatMessage::Ai(_) => MessageType::Ai,
            ChatMessage::System(_) => MessageType::System,
            ChatMessage::Chat { .. } => MessageType::Chat,
            ChatMessage::Function { .. } => MessageType::Function,
            ChatMessage::Tool { .. } => MessageType::Tool,
        }
    }

    /// Shared message fields.
    pub fn data(&self) -> &MessageData {
        match self {
            ChatMessage::Human(data) | ChatMessage::Ai(data) | ChatMessage::System(data) => data,
            ChatMessage::Chat { data, .. }
            | ChatMessage::Function { data, .. }
            | ChatMessage::Tool { data, .. } => data,
        }
    }

    /// Mutable shared message fields.
    pub fn data_mut(&mut self) -> &mut MessageData {
        match self {
            ChatMessage::Human(data) | ChatMessage::Ai(data) | ChatMessage::System(data) => data,
            ChatMessage::Chat { data, .. }
            | ChatMessage::Function { data, .. }
            | ChatMessage::Tool { data, .. } => data,
        }
    }

    /// Message text.
    pub fn content(&self) -> &str {
        &self.data().content
    }

    /// Encode for a history row.
    pub fn to_stored(&self) -> Result<StoredMessage, MssqlError> {
        let message_type = self.message_type();

        let mut payload = match serde_json::to_value(self.data()) {
            Ok(Value::Object(map)) => map,
            Ok(_) => return Err(MssqlError::internal("Message data did not encode as an object")),
            Err(e) => {
                return Err(MssqlError::invalid_input(format!(
                    "Message cannot be encoded: {}",
                    e
                )))
            }
        };

        payload.insert(
            "type".to_string(),
            Value::String(message_type.as_str().to_string()),
        );
        match self {
            ChatMessage::Chat { role, .. } => {
                payload.insert("role".to_string(), Value::String(role.clone()));
            }
            ChatMessage::Function { name, .. } => {
                payload.insert("name".to_string(), Value::String(name.clone()));
            }
            ChatMessage::Tool { tool_call_id, .. } => {
                payload.insert(
                    "tool_call_id".to_string(),
                    Value::String(tool_call_id.clone()),
                );
            }
            _ => {}
        }

        Ok(StoredMessage {
            message_type,
            data: Value::Object(payload).to_string(),
        })
    }

    /// Decode a history row. The `type` column decides the variant.
    pub fn from_stored(type_tag: &str, data: &str) -> Result<Self, MssqlError> {
        let message_type: MessageType = type_tag.parse()?;

        let mut payload = match serde_json::from_str::<Value>(data)? {
            Value::Object(map) => map,
            other => {
                return Err(MssqlError::decode(format!(
                    "Message payload must be a JSON object, found {}",
                    other
                )))
            }
        };
        payload.remove("type");

        let variant_value = match message_type.variant_key() {
            Some(key) => {
                let value = required_str(&payload, key, message_type)?;
                payload.remove(key);
                Some(value)
            }
            None => None,
        };

        let data: MessageData = serde_json::from_value(Value::Object(payload))?;

        let message = match (message_type, variant_value) {
            (MessageType::Human, _) => ChatMessage::Human(data),
            (MessageType::Ai, _) => ChatMessage::Ai(data),
            (MessageType::System, _) => ChatMessage::System(data),
            (MessageType::Chat, Some(role)) => ChatMessage::Chat { role, data },
            (MessageType::Function, Some(name)) => ChatMessage::Function { name, data },
            (MessageType::Tool, Some(tool_call_id)) => ChatMessage::Tool { tool_call_id, data },
            (t, None) => {
                return Err(MssqlError::internal(format!(
                    "Message type '{}' decoded without its variant field",
                    t
                )))
            }
        };
        Ok(message)
    }
}

fn required_str(
    payload: &Map<String, Value>,
    key: &str,
    message_type: MessageType,
) -> Result<String, MssqlError> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            MssqlError::decode(format!(
                "'{}' message payload is missing string field '{}'",
                message_type, key
            ))
        })
}
