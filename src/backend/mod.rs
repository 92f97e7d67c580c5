//! Inference primitive contract
//!
//! The batching core never touches tensors. It drives an external engine
//! through three narrow traits:
//! - [`Vocabulary`]: tokenize / detokenize, end-of-generation detection
//! - [`InferenceContext`]: batched decode, logits, KV sequence management
//! - [`MediaEncoder`]: turns raw media blobs into per-position embeddings
//!
//! The KV-owning contexts are only reachable through [`ModelContext`], whose
//! mutex is the decode lock shared by every path that mutates KV memory.

mod batch;
mod context;
pub mod scripted;

pub use batch::{Batch, BatchEntry, BatchInput};
pub use context::{Contexts, ModelContext};

use std::sync::Arc;

use anyhow::Result;

use crate::error::DecodeError;

/// Vocabulary token id.
pub type TokenId = u32;

/// KV sequence id.
pub type SeqId = i32;

/// Position inside a KV sequence.
pub type Pos = i32;

/// Tokenizer side of the model.
///
/// Implementations must be safe to call concurrently from request tasks and
/// from the scheduler thread.
pub trait Vocabulary: Send + Sync {
    /// Encode text to token ids, optionally adding BOS-style special tokens.
    fn tokenize(&self, text: &str, add_special: bool) -> Result<Vec<TokenId>>;

    /// Raw bytes of a token. May be a fragment of a multi-byte codepoint.
    fn token_to_bytes(&self, token: TokenId) -> Vec<u8>;

    /// True for EOS/EOT style tokens that end generation.
    fn is_end_of_generation(&self, token: TokenId) -> bool;

    /// Number of logits produced per output position.
    fn vocab_size(&self) -> usize;
}

/// Decode side of the model: one native context with its KV memory.
///
/// Not thread-safe on its own; the engine serializes every call through
/// [`ModelContext`].
pub trait InferenceContext: Send {
    /// Run one forward pass over `batch`.
    ///
    /// Returns the native status code: `0` success, `1` no KV space,
    /// `2` aborted, `-1` invalid input, anything else fatal.
    fn decode(&mut self, batch: &Batch) -> i32;

    /// Logits for the batch entry at `index` of the last successful decode.
    /// `None` when that entry did not request logits.
    fn logits(&self, index: usize) -> Option<&[f32]>;

    /// Remove positions `[from, to)` of `seq` from KV memory. `to = None`
    /// means "to the end of the sequence".
    fn remove_sequence_range(&mut self, seq: SeqId, from: Pos, to: Option<Pos>) -> bool;

    /// Copy positions `[from, to)` of `src` into `dst`.
    fn copy_sequence_range(&mut self, src: SeqId, dst: SeqId, from: Pos, to: Option<Pos>);

    /// Highest occupied position of `seq`, `None` when the sequence is empty.
    fn max_position(&self, seq: SeqId) -> Option<Pos>;
}

/// External vision/audio embedding path.
pub trait MediaEncoder: Send + Sync {
    /// Encode one media blob into embeddings, one vector per KV position.
    fn encode(&self, blob: &[u8]) -> Result<Vec<Vec<f32>>>;
}

/// Everything the engine needs from a loaded model.
#[derive(Clone)]
pub struct Model {
    pub vocab: Arc<dyn Vocabulary>,
    pub context: Arc<ModelContext>,
    pub media: Option<Arc<dyn MediaEncoder>>,
}

impl Model {
    pub fn new(vocab: Arc<dyn Vocabulary>, context: ModelContext) -> Self {
        Self {
            vocab,
            context: Arc::new(context),
            media: None,
        }
    }

    /// Attach a vision/audio encoder for media prompts.
    pub fn with_media(mut self, encoder: Arc<dyn MediaEncoder>) -> Self {
        self.media = Some(encoder);
        self
    }
}

/// Decode `tokens` into `seq` starting at `start`, at most `n_batch`
/// entries per call, reusing `scratch`. Logits are requested for the last
/// token only when `logits_last` is set; its index is returned.
pub fn decode_tokens(
    ctx: &mut dyn InferenceContext,
    scratch: &mut Batch,
    seq: SeqId,
    start: Pos,
    tokens: &[TokenId],
    n_batch: usize,
    logits_last: bool,
) -> std::result::Result<Option<usize>, DecodeError> {
    let mut last_index = None;
    let mut pos = start;
    for chunk in tokens.chunks(n_batch.max(1)) {
        scratch.clear();
        let is_last_chunk = pos as usize + chunk.len() == start as usize + tokens.len();
        for (i, token) in chunk.iter().enumerate() {
            let logits = logits_last && is_last_chunk && i + 1 == chunk.len();
            let index = scratch.add_token(*token, pos, seq, logits);
            if logits {
                last_index = Some(index);
            }
            pos += 1;
        }
        if let Some(err) = DecodeError::from_code(ctx.decode(scratch)) {
            return Err(err);
        }
    }
    Ok(last_index)
}

/// Index of the largest logit.
pub fn argmax(logits: &[f32]) -> TokenId {
    logits
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i as TokenId)
        .unwrap_or(0)
}
