//! Response chunk types delivered on a job's channel

use serde::{Serialize, Serializer};

use crate::error::EngineError;

/// Identity shared by every chunk of one response.
#[derive(Debug, Clone)]
pub struct ChunkMeta {
    pub id: String,
    pub model: String,
    pub created: i64,
}

impl ChunkMeta {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            model: model.into(),
            created: chrono::Utc::now().timestamp(),
        }
    }
}

/// Why generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Error,
}

/// A function call emitted by the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// JSON-encoded arguments
    pub arguments: String,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: format!("call_{}", uuid::Uuid::new_v4().simple()),
            name: name.into(),
            arguments: arguments.into(),
        }
    }
}

/// Incremental content of one chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl Delta {
    pub fn role(role: &str) -> Self {
        Self {
            role: Some(role.to_string()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.role.is_none()
            && self.content.is_none()
            && self.reasoning_content.is_none()
            && self.tool_calls.is_empty()
    }
}

/// Token accounting reported on the final chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Usage {
    /// Cached plus newly decoded prompt tokens
    pub prompt_tokens: usize,
    pub cached_tokens: usize,
    pub reasoning_tokens: usize,
    pub completion_tokens: usize,
    /// Reasoning plus completion tokens
    pub output_tokens: usize,
    pub total_tokens: usize,
    pub tokens_per_second: f64,
    #[serde(skip_serializing_if = "is_zero")]
    pub draft_accepted: usize,
    #[serde(skip_serializing_if = "is_zero")]
    pub draft_proposed: usize,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

/// One streamed response chunk.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub delta: Delta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_error"
    )]
    pub error: Option<EngineError>,
}

fn serialize_error<S: Serializer>(err: &Option<EngineError>, s: S) -> Result<S::Ok, S::Error> {
    match err {
        Some(err) => s.serialize_some(&err.to_string()),
        None => s.serialize_none(),
    }
}

impl ResponseChunk {
    fn with(meta: &ChunkMeta, delta: Delta) -> Self {
        Self {
            id: meta.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: meta.created,
            model: meta.model.clone(),
            delta,
            finish_reason: None,
            usage: None,
            error: None,
        }
    }

    pub fn delta(meta: &ChunkMeta, delta: Delta) -> Self {
        Self::with(meta, delta)
    }

    pub fn finish(meta: &ChunkMeta, reason: FinishReason, usage: Usage) -> Self {
        Self {
            finish_reason: Some(reason),
            usage: Some(usage),
            ..Self::with(meta, Delta::default())
        }
    }

    pub fn error(meta: &ChunkMeta, err: EngineError) -> Self {
        Self {
            finish_reason: Some(FinishReason::Error),
            error: Some(err),
            ..Self::with(meta, Delta::default())
        }
    }

    /// True for the terminal chunk of a response.
    pub fn is_final(&self) -> bool {
        self.finish_reason.is_some()
    }
}

/// A whole response, assembled from its chunks.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChatCompletion {
    pub id: String,
    pub model: String,
    pub created: i64,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: Option<FinishReason>,
    pub usage: Usage,
}

impl ChatCompletion {
    /// Fold one chunk into the response. Error chunks end assembly.
    pub fn accumulate(&mut self, chunk: ResponseChunk) -> Result<(), EngineError> {
        if let Some(err) = chunk.error {
            return Err(err);
        }
        if self.id.is_empty() {
            self.id = chunk.id;
            self.model = chunk.model;
            self.created = chunk.created;
        }
        let delta = chunk.delta;
        if let Some(content) = delta.content {
            self.content.push_str(&content);
        }
        if let Some(reasoning) = delta.reasoning_content {
            self.reasoning_content
                .get_or_insert_with(String::new)
                .push_str(&reasoning);
        }
        self.tool_calls.extend(delta.tool_calls);
        if chunk.finish_reason.is_some() {
            self.finish_reason = chunk.finish_reason;
        }
        if let Some(usage) = chunk.usage {
            self.usage = usage;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_chunk_serializes_usage_and_reason() {
        let meta = ChunkMeta::new("tiny");
        let usage = Usage {
            prompt_tokens: 3,
            completion_tokens: 2,
            output_tokens: 2,
            total_tokens: 5,
            ..Default::default()
        };
        let chunk = ResponseChunk::finish(&meta, FinishReason::ToolCalls, usage);
        assert!(chunk.is_final());

        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json["object"], "chat.completion.chunk");
        assert_eq!(json["finish_reason"], "tool_calls");
        assert_eq!(json["usage"]["total_tokens"], 5);
        assert!(json["usage"].get("draft_accepted").is_none());
        assert!(json.get("error").is_none());
        assert!(meta.id.starts_with("chatcmpl-"));
    }

    #[test]
    fn error_chunk_carries_message() {
        let meta = ChunkMeta::new("tiny");
        let chunk = ResponseChunk::error(&meta, EngineError::Cancelled);
        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json["finish_reason"], "error");
        assert_eq!(json["error"], "request cancelled");

        let mut completion = ChatCompletion::default();
        assert_eq!(completion.accumulate(chunk), Err(EngineError::Cancelled));
    }

    #[test]
    fn completion_collects_deltas() {
        let meta = ChunkMeta::new("tiny");
        let mut completion = ChatCompletion::default();
        completion
            .accumulate(ResponseChunk::delta(&meta, Delta::role("assistant")))
            .unwrap();
        for part in ["hel", "lo"] {
            let delta = Delta {
                content: Some(part.to_string()),
                ..Default::default()
            };
            completion
                .accumulate(ResponseChunk::delta(&meta, delta))
                .unwrap();
        }
        completion
            .accumulate(ResponseChunk::finish(&meta, FinishReason::Stop, Usage::default()))
            .unwrap();
        assert_eq!(completion.content, "hello");
        assert_eq!(completion.id, meta.id);
        assert_eq!(completion.finish_reason, Some(FinishReason::Stop));
        assert!(completion.reasoning_content.is_none());
    }
}
