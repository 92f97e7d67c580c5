//! Shared decode batch

use super::{Pos, SeqId, TokenId};

/// Input carried by one batch entry.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchInput {
    Token(TokenId),
    Embedding(Vec<f32>),
}

/// One position to decode.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchEntry {
    pub input: BatchInput,
    pub pos: Pos,
    pub seq_id: SeqId,
    /// Request logits at this entry.
    pub logits: bool,
}

/// Ordered list of entries submitted to a single decode call.
///
/// A batch holds either tokens or embeddings, never both: native backends
/// take them through different input buffers.
#[derive(Debug, Default)]
pub struct Batch {
    entries: Vec<BatchEntry>,
}

impl Batch {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    /// True when the batch carries embeddings.
    pub fn has_embeddings(&self) -> bool {
        matches!(
            self.entries.first(),
            Some(BatchEntry {
                input: BatchInput::Embedding(_),
                ..
            })
        )
    }

    /// Append a token entry and return its index (the logits index).
    pub fn add_token(&mut self, token: TokenId, pos: Pos, seq_id: SeqId, logits: bool) -> usize {
        debug_assert!(!self.has_embeddings(), "token added to an embedding batch");
        self.entries.push(BatchEntry {
            input: BatchInput::Token(token),
            pos,
            seq_id,
            logits,
        });
        self.entries.len() - 1
    }

    /// Append an embedding entry and return its index.
    pub fn add_embedding(
        &mut self,
        embedding: Vec<f32>,
        pos: Pos,
        seq_id: SeqId,
        logits: bool,
    ) -> usize {
        debug_assert!(
            self.entries.is_empty() || self.has_embeddings(),
            "embedding added to a token batch"
        );
        self.entries.push(BatchEntry {
            input: BatchInput::Embedding(embedding),
            pos,
            seq_id,
            logits,
        });
        self.entries.len() - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_follow_insertion_order() {
        let mut batch = Batch::with_capacity(4);
        assert_eq!(batch.add_token(5, 0, 0, false), 0);
        assert_eq!(batch.add_token(6, 1, 0, true), 1);
        assert_eq!(batch.add_token(7, 0, 1, true), 2);
        assert_eq!(batch.len(), 3);
        assert!(!batch.has_embeddings());
        assert_eq!(batch.entries()[2].seq_id, 1);

        batch.clear();
        assert!(batch.is_empty());
        batch.add_embedding(vec![0.5, 0.5], 0, 0, true);
        assert!(batch.has_embeddings());
    }
}
