//! Conversation content shared with the model client.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// Role attached to a message in the model client's conversation buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Model,
}

/// A model-addressable fragment of conversation content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Part {
    Text {
        text: String,
    },
    /// The outcome of a tool call, fed back to the model.
    FunctionResponse {
        call_id: String,
        name: String,
        response: Value,
    },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn function_response(
        call_id: impl Into<String>,
        name: impl Into<String>,
        response: Value,
    ) -> Self {
        Self::FunctionResponse {
            call_id: call_id.into(),
            name: name.into(),
            response,
        }
    }
}

/// One message in the model client's conversation buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMessage {
    pub role: Role,
    pub parts: Vec<Part>,
}

/// Payload handed to the model client for a single request.
///
/// Plain text for user-typed queries; parts when tool responses are forwarded
/// back to the model unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryPayload {
    Text(String),
    Parts(Vec<Part>),
}

impl QueryPayload {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Parts(_) => None,
        }
    }
}

impl From<&str> for QueryPayload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for QueryPayload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}
