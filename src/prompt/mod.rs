//! Request boundary and prompt rendering
//!
//! Inbound chat bodies are parsed once into [`PreparedRequest`]; the engine
//! only ever sees typed messages, decoded media blobs and resolved sampling
//! parameters.

mod request;
mod template;

pub use request::{
    ChatRequest, ContentPart, InputAudio, MediaUrl, MessageContent, PreparedRequest,
    RequestMessage,
};
pub use template::{ChatTemplate, DefaultTemplate};

use serde::{Deserialize, Serialize};

/// Placeholder substituted for each media part in message text.
pub const MEDIA_MARKER: &str = "<__media__>";

/// A typed chat message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }

    pub fn is_system(&self) -> bool {
        self.role == "system"
    }
}
