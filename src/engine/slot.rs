//! Execution slot: per-request generation state

use std::collections::VecDeque;
use std::time::Instant;

use super::job::{Job, Outbox};
use super::sampler::Sampler;
use super::speculative::SpecState;
use crate::backend::{Pos, SeqId, TokenId};
use crate::config::ModelFamily;
use crate::stream::StreamProcessor;

/// Remaining prompt input of a prefilling slot.
#[derive(Debug)]
pub enum PrefillPart {
    Tokens { tokens: Vec<TokenId>, next: usize },
    Media(Vec<Vec<f32>>),
}

impl PrefillPart {
    pub fn remaining(&self) -> usize {
        match self {
            PrefillPart::Tokens { tokens, next } => tokens.len() - next,
            PrefillPart::Media(embeddings) => embeddings.len(),
        }
    }
}

/// One fixed execution unit. Slot `id` always decodes into KV sequence
/// `seq_id`; state is reset between jobs, never reallocated.
pub struct Slot {
    pub id: usize,
    pub seq_id: SeqId,
    pub job: Option<Job>,
    /// Positions of this slot's sequence holding decoded input
    pub n_past: Pos,
    pub n_prompt: usize,
    pub n_cached: usize,
    pub prefill: VecDeque<PrefillPart>,
    /// Full prompt tokens, kept for the draft model's prefill
    pub prompt_tokens: Vec<TokenId>,
    /// Last sampled token, not yet in KV
    pub last_token: TokenId,
    /// Batch index whose logits this slot samples after the current decode
    pub logits_index: Option<usize>,
    /// Batch index of `last_token` when a draft chain follows it
    pub spec_index: Option<usize>,
    pub sampler: Option<Sampler>,
    pub processor: StreamProcessor,
    /// Chunks the job's channel had no room for
    pub outbox: Outbox,
    pub spec: Option<SpecState>,
    /// Cached positions that survive the end of the job
    pub keep_prefix: Option<Pos>,
    pub started: Option<Instant>,
    pub first_token: Option<Instant>,
}

impl Slot {
    pub fn new(id: usize, family: ModelFamily) -> Self {
        Self {
            id,
            seq_id: id as SeqId,
            job: None,
            n_past: 0,
            n_prompt: 0,
            n_cached: 0,
            prefill: VecDeque::new(),
            prompt_tokens: Vec::new(),
            last_token: 0,
            logits_index: None,
            spec_index: None,
            sampler: None,
            processor: StreamProcessor::new(family),
            outbox: Outbox::default(),
            spec: None,
            keep_prefix: None,
            started: None,
            first_token: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.job.is_some()
    }

    /// Prompt fully decoded and generating tokens.
    pub fn is_generating(&self) -> bool {
        self.is_active() && self.prefill.is_empty() && self.first_token.is_some()
    }

    pub fn is_prefilling(&self) -> bool {
        self.is_active() && !self.prefill.is_empty()
    }

    /// Waiting for its consumer to make room before generating more.
    pub fn is_stalled(&self) -> bool {
        !self.outbox.is_empty()
    }

    /// Clear all per-job state.
    pub fn reset(&mut self, family: ModelFamily) {
        self.job = None;
        self.n_past = 0;
        self.n_prompt = 0;
        self.n_cached = 0;
        self.prefill.clear();
        self.prompt_tokens.clear();
        self.last_token = 0;
        self.logits_index = None;
        self.spec_index = None;
        self.sampler = None;
        self.processor = StreamProcessor::new(family);
        self.outbox = Outbox::default();
        self.spec = None;
        self.keep_prefix = None;
        self.started = None;
        self.first_token = None;
    }

    /// Attach a job; the slot becomes active.
    pub fn activate(&mut self, job: Job) {
        self.sampler = Some(Sampler::new(&job.params));
        self.started = Some(Instant::now());
        self.job = Some(job);
    }

    /// Token budget still open for this job.
    pub fn remaining_tokens(&self) -> usize {
        let max = self.job.as_ref().map_or(0, |j| j.params.max_tokens);
        max.saturating_sub(self.processor.output_tokens())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_id_follows_slot_index() {
        let slot = Slot::new(3, ModelFamily::Standard);
        assert_eq!(slot.seq_id, 3);
        assert!(!slot.is_active());
        assert!(!slot.is_generating());
    }

    #[test]
    fn prefill_part_remaining() {
        let part = PrefillPart::Tokens {
            tokens: vec![1, 2, 3],
            next: 1,
        };
        assert_eq!(part.remaining(), 2);
        assert_eq!(PrefillPart::Media(vec![vec![0.0]; 4]).remaining(), 4);
    }
}
