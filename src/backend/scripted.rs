//! Deterministic reference backend
//!
//! A byte-level "model" that replays a fixed reply after the last
//! `<|assistant|>` marker in a sequence. It keeps real per-sequence KV
//! bookkeeping (with gap validation and a cell budget), so the scheduler,
//! the caches and speculative decoding can be exercised end to end without
//! weights. Used by the test suite and by `batchr simulate`.
//!
//! Vocabulary layout:
//! - `0..=255`: raw bytes
//! - `256`: end of generation
//! - `257..`: chat / reasoning / tool-call markers (see [`SPECIAL_TOKENS`])

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use parking_lot::Mutex;

use super::{Batch, BatchInput, InferenceContext, MediaEncoder, Pos, SeqId, TokenId, Vocabulary};

/// End-of-generation token.
pub const EOS: TokenId = 256;

/// Generation-prompt marker the scripted model keys its reply on.
pub const ASSISTANT: TokenId = 257;

/// KV cell value stored for embedding entries.
const EMBEDDING_CELL: TokenId = TokenId::MAX;

/// Marker strings that tokenize to a single token.
pub const SPECIAL_TOKENS: &[(&str, TokenId)] = &[
    ("<|assistant|>", ASSISTANT),
    ("<|system|>", 258),
    ("<|user|>", 259),
    ("<|tool|>", 260),
    ("<think>", 261),
    ("</think>", 262),
    ("<tool_call>", 263),
    ("</tool_call>", 264),
    ("<|channel|>", 265),
    ("<|message|>", 266),
    ("<|end|>", 267),
    ("<|start|>", 268),
    ("<|call|>", 269),
    ("<|return|>", 270),
];

const VOCAB_SIZE: usize = 271;
const RETURN: TokenId = 270;

/// Byte-level vocabulary with marker tokens.
#[derive(Debug, Default)]
pub struct ScriptedVocab;

impl ScriptedVocab {
    /// Infallible encode used internally and by tests.
    pub fn encode(&self, text: &str) -> Vec<TokenId> {
        let bytes = text.as_bytes();
        let mut tokens = Vec::with_capacity(bytes.len());
        let mut i = 0;
        'outer: while i < bytes.len() {
            if bytes[i] == b'<' {
                for (marker, id) in SPECIAL_TOKENS {
                    if bytes[i..].starts_with(marker.as_bytes()) {
                        tokens.push(*id);
                        i += marker.len();
                        continue 'outer;
                    }
                }
            }
            tokens.push(bytes[i] as TokenId);
            i += 1;
        }
        tokens
    }
}

impl Vocabulary for ScriptedVocab {
    fn tokenize(&self, text: &str, _add_special: bool) -> Result<Vec<TokenId>> {
        Ok(self.encode(text))
    }

    fn token_to_bytes(&self, token: TokenId) -> Vec<u8> {
        match token {
            0..=255 => vec![token as u8],
            EOS => Vec::new(),
            other => SPECIAL_TOKENS
                .iter()
                .find(|(_, id)| *id == other)
                .map(|(marker, _)| marker.as_bytes().to_vec())
                .unwrap_or_default(),
        }
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        token == EOS || token == RETURN
    }

    fn vocab_size(&self) -> usize {
        VOCAB_SIZE
    }
}

/// State shared between a context and its probe.
struct ScriptedState {
    kv: Mutex<HashMap<SeqId, BTreeMap<Pos, TokenId>>>,
    kv_capacity: usize,
    fail_next: AtomicI32,
    decode_calls: AtomicUsize,
    largest_batch: AtomicUsize,
    delay_us: AtomicU64,
}

/// Scripted model: a vocabulary plus the reply every sequence produces.
pub struct ScriptedModel {
    vocab: Arc<ScriptedVocab>,
    reply: Arc<Vec<TokenId>>,
}

impl ScriptedModel {
    /// Build a model whose every generation is `reply` followed by EOS.
    pub fn new(reply: &str) -> Self {
        let vocab = Arc::new(ScriptedVocab);
        let reply = Arc::new(vocab.encode(reply));
        Self { vocab, reply }
    }

    pub fn vocab(&self) -> Arc<ScriptedVocab> {
        Arc::clone(&self.vocab)
    }

    /// Create a context holding at most `kv_capacity` cells, plus a probe
    /// that observes it after it has been handed to the engine.
    pub fn context(&self, kv_capacity: usize) -> (ScriptedContext, ScriptedProbe) {
        let state = Arc::new(ScriptedState {
            kv: Mutex::new(HashMap::new()),
            kv_capacity,
            fail_next: AtomicI32::new(0),
            decode_calls: AtomicUsize::new(0),
            largest_batch: AtomicUsize::new(0),
            delay_us: AtomicU64::new(0),
        });
        let context = ScriptedContext {
            state: Arc::clone(&state),
            reply: Arc::clone(&self.reply),
            logits: HashMap::new(),
        };
        (context, ScriptedProbe { state })
    }
}

/// KV-owning half of the scripted model.
pub struct ScriptedContext {
    state: Arc<ScriptedState>,
    reply: Arc<Vec<TokenId>>,
    logits: HashMap<usize, Vec<f32>>,
}

impl ScriptedContext {
    fn predict(&self, cells: &BTreeMap<Pos, TokenId>, pos: Pos) -> TokenId {
        let marker = cells
            .range(..=pos)
            .rev()
            .find(|(_, token)| **token == ASSISTANT)
            .map(|(p, _)| *p);
        match marker {
            Some(at) => self
                .reply
                .get((pos - at) as usize)
                .copied()
                .unwrap_or(EOS),
            None => EOS,
        }
    }
}

impl InferenceContext for ScriptedContext {
    fn decode(&mut self, batch: &Batch) -> i32 {
        self.state.decode_calls.fetch_add(1, Ordering::SeqCst);
        self.state
            .largest_batch
            .fetch_max(batch.len(), Ordering::SeqCst);

        let delay = self.state.delay_us.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_micros(delay));
        }

        let injected = self.state.fail_next.swap(0, Ordering::SeqCst);
        if injected != 0 {
            return injected;
        }
        if batch.is_empty() {
            return -1;
        }

        let mut kv = self.state.kv.lock();

        // Positions must extend each sequence without gaps.
        let mut next: HashMap<SeqId, Pos> = HashMap::new();
        let mut new_cells = 0usize;
        for entry in batch.entries() {
            let cells = kv.get(&entry.seq_id);
            let expected = next.entry(entry.seq_id).or_insert_with(|| {
                cells
                    .and_then(|c| c.keys().next_back())
                    .map(|p| p + 1)
                    .unwrap_or(0)
            });
            if entry.pos < 0 || entry.pos > *expected {
                return -1;
            }
            if cells.map_or(true, |c| !c.contains_key(&entry.pos)) {
                new_cells += 1;
            }
            *expected = (*expected).max(entry.pos + 1);
        }
        let used: usize = kv.values().map(|c| c.len()).sum();
        if used + new_cells > self.state.kv_capacity {
            return 1;
        }

        for entry in batch.entries() {
            let cell = match entry.input {
                BatchInput::Token(token) => token,
                BatchInput::Embedding(_) => EMBEDDING_CELL,
            };
            kv.entry(entry.seq_id).or_default().insert(entry.pos, cell);
        }

        self.logits.clear();
        for (index, entry) in batch.entries().iter().enumerate() {
            if !entry.logits {
                continue;
            }
            let predicted = kv
                .get(&entry.seq_id)
                .map(|cells| self.predict(cells, entry.pos))
                .unwrap_or(EOS);
            let mut logits = vec![0.0f32; VOCAB_SIZE];
            logits[predicted as usize] = 10.0;
            self.logits.insert(index, logits);
        }
        0
    }

    fn logits(&self, index: usize) -> Option<&[f32]> {
        self.logits.get(&index).map(|l| l.as_slice())
    }

    fn remove_sequence_range(&mut self, seq: SeqId, from: Pos, to: Option<Pos>) -> bool {
        let mut kv = self.state.kv.lock();
        if let Some(cells) = kv.get_mut(&seq) {
            let end = to.unwrap_or(Pos::MAX);
            cells.retain(|pos, _| *pos < from || *pos >= end);
            if cells.is_empty() {
                kv.remove(&seq);
            }
        }
        true
    }

    fn copy_sequence_range(&mut self, src: SeqId, dst: SeqId, from: Pos, to: Option<Pos>) {
        let mut kv = self.state.kv.lock();
        let end = to.unwrap_or(Pos::MAX);
        let copied: Vec<(Pos, TokenId)> = kv
            .get(&src)
            .map(|cells| cells.range(from..end).map(|(p, t)| (*p, *t)).collect())
            .unwrap_or_default();
        if !copied.is_empty() {
            kv.entry(dst).or_default().extend(copied);
        }
    }

    fn max_position(&self, seq: SeqId) -> Option<Pos> {
        self.state
            .kv
            .lock()
            .get(&seq)
            .and_then(|cells| cells.keys().next_back().copied())
    }
}

/// Test-side view of a [`ScriptedContext`] owned by the engine.
#[derive(Clone)]
pub struct ScriptedProbe {
    state: Arc<ScriptedState>,
}

impl ScriptedProbe {
    pub fn decode_calls(&self) -> usize {
        self.state.decode_calls.load(Ordering::SeqCst)
    }

    /// Largest batch ever submitted to `decode`.
    pub fn largest_batch(&self) -> usize {
        self.state.largest_batch.load(Ordering::SeqCst)
    }

    /// Number of occupied KV cells for `seq`.
    pub fn sequence_len(&self, seq: SeqId) -> usize {
        self.state.kv.lock().get(&seq).map_or(0, |c| c.len())
    }

    /// Tokens resident in `seq`, in position order.
    pub fn sequence_tokens(&self, seq: SeqId) -> Vec<TokenId> {
        self.state
            .kv
            .lock()
            .get(&seq)
            .map(|c| c.values().copied().collect())
            .unwrap_or_default()
    }

    pub fn total_cells(&self) -> usize {
        self.state.kv.lock().values().map(|c| c.len()).sum()
    }

    /// Make the next decode call return `code` without touching KV.
    pub fn fail_next_decode(&self, code: i32) {
        self.state.fail_next.store(code, Ordering::SeqCst);
    }

    /// Sleep this long inside every decode call.
    pub fn set_decode_delay(&self, delay: Duration) {
        self.state
            .delay_us
            .store(delay.as_micros() as u64, Ordering::SeqCst);
    }
}

/// Media encoder producing one single-value embedding per blob byte.
#[derive(Debug, Default)]
pub struct ScriptedMediaEncoder;

impl MediaEncoder for ScriptedMediaEncoder {
    fn encode(&self, blob: &[u8]) -> Result<Vec<Vec<f32>>> {
        if blob.is_empty() {
            return Err(anyhow!("empty media blob"));
        }
        Ok(blob.iter().map(|b| vec![*b as f32 / 255.0]).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::argmax;

    #[test]
    fn markers_tokenize_to_single_tokens() {
        let vocab = ScriptedVocab;
        assert_eq!(vocab.encode("a<think>b"), vec![97, 261, 98]);
        assert_eq!(vocab.encode("<x"), vec![60, 120]);
        assert_eq!(vocab.token_to_bytes(262), b"</think>".to_vec());
        assert!(vocab.token_to_bytes(EOS).is_empty());
        assert!(vocab.is_end_of_generation(EOS));
    }

    #[test]
    fn replays_reply_after_assistant_marker() {
        let model = ScriptedModel::new("hi");
        let (mut ctx, probe) = model.context(64);
        let prompt = model.vocab().encode("q<|assistant|>");

        let mut batch = Batch::default();
        for (i, token) in prompt.iter().enumerate() {
            batch.add_token(*token, i as Pos, 0, i + 1 == prompt.len());
        }
        assert_eq!(ctx.decode(&batch), 0);
        let first = argmax(ctx.logits(prompt.len() - 1).unwrap());
        assert_eq!(first, b'h' as TokenId);

        batch.clear();
        batch.add_token(first, prompt.len() as Pos, 0, true);
        assert_eq!(ctx.decode(&batch), 0);
        assert_eq!(argmax(ctx.logits(0).unwrap()), b'i' as TokenId);

        batch.clear();
        batch.add_token(b'i' as TokenId, prompt.len() as Pos + 1, 0, true);
        assert_eq!(ctx.decode(&batch), 0);
        assert_eq!(argmax(ctx.logits(0).unwrap()), EOS);
        assert_eq!(probe.sequence_len(0), prompt.len() + 2);
    }

    #[test]
    fn rejects_gaps_and_overflowing_batches() {
        let model = ScriptedModel::new("x");
        let (mut ctx, probe) = model.context(2);

        let mut batch = Batch::default();
        batch.add_token(1, 3, 0, false);
        assert_eq!(ctx.decode(&batch), -1);

        batch.clear();
        for pos in 0..3 {
            batch.add_token(1, pos, 0, false);
        }
        assert_eq!(ctx.decode(&batch), 1);
        assert_eq!(probe.total_cells(), 0);

        probe.fail_next_decode(2);
        batch.clear();
        batch.add_token(1, 0, 0, false);
        assert_eq!(ctx.decode(&batch), 2);
        assert_eq!(ctx.decode(&batch), 0);
    }

    #[test]
    fn sequence_ranges_can_be_removed_and_copied() {
        let model = ScriptedModel::new("x");
        let (mut ctx, probe) = model.context(64);
        let mut batch = Batch::default();
        for pos in 0..4 {
            batch.add_token(pos as TokenId + 10, pos, 1, false);
        }
        assert_eq!(ctx.decode(&batch), 0);

        ctx.copy_sequence_range(1, 2, 0, Some(2));
        assert_eq!(probe.sequence_tokens(2), vec![10, 11]);

        ctx.remove_sequence_range(1, 2, None);
        assert_eq!(ctx.max_position(1), Some(1));
        ctx.remove_sequence_range(1, 0, None);
        assert_eq!(ctx.max_position(1), None);
    }
}
