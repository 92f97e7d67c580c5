//! Chat request body and its conversion into typed engine input

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use super::{ChatMessage, MEDIA_MARKER};
use crate::config::GenerationConfig;
use crate::error::EngineError;

/// Inbound chat request, as it arrives over the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub messages: Vec<RequestMessage>,
    #[serde(default)]
    pub max_tokens: Option<usize>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub repeat_penalty: Option<f32>,
    #[serde(default)]
    pub frequency_penalty: Option<f32>,
    #[serde(default)]
    pub presence_penalty: Option<f32>,
    #[serde(default)]
    pub seed: Option<u64>,
    /// Session key for KV cache reuse
    #[serde(default)]
    pub cache_id: Option<String>,
    /// Request deadline, measured from submission
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMessage {
    pub role: String,
    #[serde(default)]
    pub content: MessageContent,
}

/// Message content: a plain string or a list of typed parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: MediaUrl },
    InputAudio { input_audio: InputAudio },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaUrl {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputAudio {
    pub data: String,
    #[serde(default)]
    pub format: Option<String>,
}

/// Typed form of a [`ChatRequest`], ready for the engine.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    /// Raw media blobs in marker order
    pub media: Vec<Vec<u8>>,
    pub params: GenerationConfig,
    pub cache_id: Option<String>,
    pub timeout: Option<Duration>,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages: messages
                .into_iter()
                .map(|m| RequestMessage {
                    role: m.role,
                    content: MessageContent::Text(m.content),
                })
                .collect(),
            ..Default::default()
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_cache_id(mut self, cache_id: impl Into<String>) -> Self {
        self.cache_id = Some(cache_id.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Validate the body and convert it into engine input, filling unset
    /// sampling parameters from `defaults`.
    pub fn prepare(self, defaults: &GenerationConfig) -> Result<PreparedRequest, EngineError> {
        let invalid = |msg: &str| EngineError::InvalidRequest(msg.to_string());

        let last_role = match self.messages.last() {
            Some(last) => last.role.as_str(),
            None => return Err(invalid("messages must not be empty")),
        };
        if last_role != "user" && last_role != "tool" {
            return Err(EngineError::InvalidRequest(format!(
                "last message must come from the user or a tool, got {:?}",
                last_role
            )));
        }
        if self.max_tokens == Some(0) {
            return Err(invalid("max_tokens must be at least 1"));
        }

        let mut media = Vec::new();
        let mut messages = Vec::with_capacity(self.messages.len());
        for msg in self.messages {
            let content = match msg.content {
                MessageContent::Text(text) => text,
                MessageContent::Parts(parts) => flatten_parts(parts, &mut media)?,
            };
            messages.push(ChatMessage {
                role: msg.role,
                content,
            });
        }

        let markers: usize = messages
            .iter()
            .map(|m| m.content.matches(MEDIA_MARKER).count())
            .sum();
        if markers != media.len() {
            return Err(EngineError::InvalidRequest(format!(
                "{} media markers in text but {} media parts",
                markers,
                media.len()
            )));
        }

        let params = GenerationConfig {
            max_tokens: self.max_tokens.unwrap_or(defaults.max_tokens),
            temperature: self.temperature.unwrap_or(defaults.temperature),
            top_p: self.top_p.unwrap_or(defaults.top_p),
            top_k: self.top_k.or(defaults.top_k),
            repeat_penalty: self.repeat_penalty.unwrap_or(defaults.repeat_penalty),
            repeat_last_n: defaults.repeat_last_n,
            frequency_penalty: self.frequency_penalty.unwrap_or(defaults.frequency_penalty),
            presence_penalty: self.presence_penalty.unwrap_or(defaults.presence_penalty),
            seed: self.seed.or(defaults.seed),
        };

        Ok(PreparedRequest {
            model: self.model.unwrap_or_else(|| "batchr".to_string()),
            messages,
            media,
            params,
            cache_id: self.cache_id.filter(|id| !id.is_empty()),
            timeout: self.timeout_ms.map(Duration::from_millis),
        })
    }
}

/// Join text parts and replace media parts with [`MEDIA_MARKER`],
/// collecting the decoded blobs.
fn flatten_parts(parts: Vec<ContentPart>, media: &mut Vec<Vec<u8>>) -> Result<String, EngineError> {
    let mut text = String::new();
    for part in parts {
        match part {
            ContentPart::Text { text: t } => text.push_str(&t),
            ContentPart::ImageUrl { image_url } => {
                let payload = match image_url.url.strip_prefix("data:") {
                    Some(rest) => rest
                        .split_once(";base64,")
                        .map(|(_, data)| data)
                        .ok_or_else(|| {
                            EngineError::InvalidRequest("image data url is not base64".into())
                        })?,
                    None if image_url.url.contains("://") => {
                        return Err(EngineError::InvalidRequest(
                            "remote image urls are not supported".into(),
                        ))
                    }
                    None => image_url.url.as_str(),
                };
                media.push(decode_base64(payload)?);
                text.push_str(MEDIA_MARKER);
            }
            ContentPart::InputAudio { input_audio } => {
                media.push(decode_base64(&input_audio.data)?);
                text.push_str(MEDIA_MARKER);
            }
        }
    }
    Ok(text)
}

fn decode_base64(data: &str) -> Result<Vec<u8>, EngineError> {
    BASE64
        .decode(data.trim())
        .map_err(|e| EngineError::InvalidRequest(format!("invalid base64 media: {}", e)))
}
