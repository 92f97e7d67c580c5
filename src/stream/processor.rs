//! Per-slot token to delta pipeline

use super::chunk::{Delta, ToolCall};
use super::classify::{Classifier, Piece, Section};
use super::utf8::Utf8Buffer;
use crate::config::ModelFamily;

/// Turns sampled token bytes into classified deltas and keeps the
/// per-section accumulators and token counts of one response.
#[derive(Debug)]
pub struct StreamProcessor {
    utf8: Utf8Buffer,
    classifier: Classifier,
    content: String,
    reasoning: String,
    tool_calls: Vec<ToolCall>,
    reasoning_tokens: usize,
    completion_tokens: usize,
}

impl StreamProcessor {
    pub fn new(family: ModelFamily) -> Self {
        Self {
            utf8: Utf8Buffer::new(),
            classifier: Classifier::new(family),
            content: String::new(),
            reasoning: String::new(),
            tool_calls: Vec::new(),
            reasoning_tokens: 0,
            completion_tokens: 0,
        }
    }

    /// Feed the bytes of one sampled token. Returns a delta when there is
    /// something to send.
    pub fn push_token(&mut self, bytes: &[u8]) -> Option<Delta> {
        let text = self.utf8.push(bytes);
        let pieces = if text.is_empty() {
            Vec::new()
        } else {
            self.classifier.push(&text)
        };

        match self.classifier.section() {
            Section::Reasoning => self.reasoning_tokens += 1,
            Section::Completion | Section::ToolCall => self.completion_tokens += 1,
        }
        self.absorb(pieces)
    }

    /// Flush buffered bytes and held-back text at the end of generation.
    pub fn finish(&mut self) -> Option<Delta> {
        let rest = self.utf8.flush();
        let mut pieces = if rest.is_empty() {
            Vec::new()
        } else {
            self.classifier.push(&rest)
        };
        pieces.extend(self.classifier.finish());
        self.absorb(pieces)
    }

    fn absorb(&mut self, pieces: Vec<Piece>) -> Option<Delta> {
        let mut delta = Delta::default();
        for piece in pieces {
            match piece {
                Piece::Text {
                    section: Section::Reasoning,
                    text,
                } => {
                    self.reasoning.push_str(&text);
                    delta
                        .reasoning_content
                        .get_or_insert_with(String::new)
                        .push_str(&text);
                }
                Piece::Text { text, .. } => {
                    self.content.push_str(&text);
                    delta.content.get_or_insert_with(String::new).push_str(&text);
                }
                Piece::ToolCall(call) => {
                    self.tool_calls.push(call.clone());
                    delta.tool_calls.push(call);
                }
            }
        }
        (!delta.is_empty()).then_some(delta)
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    pub fn tool_calls(&self) -> &[ToolCall] {
        &self.tool_calls
    }

    pub fn reasoning_tokens(&self) -> usize {
        self.reasoning_tokens
    }

    pub fn completion_tokens(&self) -> usize {
        self.completion_tokens
    }

    /// Tokens generated so far across all sections.
    pub fn output_tokens(&self) -> usize {
        self.reasoning_tokens + self.completion_tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_reasoning_and_content_with_counts() {
        let mut processor = StreamProcessor::new(ModelFamily::Standard);
        let mut deltas = Vec::new();
        for token in ["<think>", "why", "</think>", "\n", "because"] {
            deltas.extend(processor.push_token(token.as_bytes()));
        }
        deltas.extend(processor.finish());

        assert_eq!(processor.reasoning(), "why");
        assert_eq!(processor.content(), "because");
        assert_eq!(processor.reasoning_tokens(), 2);
        assert_eq!(processor.completion_tokens(), 3);
        assert_eq!(processor.output_tokens(), 5);
        assert_eq!(deltas.len(), 2);
        assert_eq!(deltas[0].reasoning_content.as_deref(), Some("why"));
        assert_eq!(deltas[1].content.as_deref(), Some("because"));
    }

    #[test]
    fn multibyte_token_split_is_reassembled() {
        let mut processor = StreamProcessor::new(ModelFamily::Standard);
        let bytes = "ü".as_bytes();
        assert!(processor.push_token(&bytes[..1]).is_none());
        let delta = processor.push_token(&bytes[1..]).unwrap();
        assert_eq!(delta.content.as_deref(), Some("ü"));
        assert_eq!(processor.completion_tokens(), 2);
    }

    #[test]
    fn tool_calls_are_collected() {
        let mut processor = StreamProcessor::new(ModelFamily::Standard);
        let raw = r#"<tool_call>{"name":"f","arguments":"{}"}</tool_call>"#;
        let delta = processor.push_token(raw.as_bytes()).unwrap();
        assert_eq!(delta.tool_calls.len(), 1);
        assert_eq!(processor.tool_calls()[0].name, "f");
        assert_eq!(processor.tool_calls()[0].arguments, "{}");
        assert!(processor.content().is_empty());
    }
}
