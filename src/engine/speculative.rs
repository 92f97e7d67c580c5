//! Speculative decoding
//!
//! The draft model runs ahead of the target in its own context, using the
//! same sequence id as the slot. Each step it proposes a chain of K tokens;
//! the target scores `last_token, d1..dK` in the shared batch and keeps the
//! longest run of drafts matching its own greedy predictions, plus one bonus
//! token sampled at the first disagreement (or after the last draft).
//!
//! Draft KV invariant: positions `[0, draft_past)` match the target
//! sequence, and `backlog` holds the accepted tokens after that, ending with
//! the slot's `last_token`.

use crate::backend::{argmax, decode_tokens, Batch, InferenceContext, Pos, SeqId, TokenId};
use crate::error::DecodeError;

#[derive(Debug, Default)]
pub struct SpecState {
    pub prefilled: bool,
    pub draft_past: Pos,
    pub backlog: Vec<TokenId>,
    /// Draft chain scored in the current iteration
    pub drafts: Vec<TokenId>,
    pub accepted: usize,
    pub proposed: usize,
}

impl SpecState {
    /// Draft context now holds the prompt; `first` is the first sampled token.
    pub fn prefilled(prompt_len: usize, first: TokenId) -> Self {
        Self {
            prefilled: true,
            draft_past: prompt_len as Pos,
            backlog: vec![first],
            ..Default::default()
        }
    }

    /// Run the draft model for `k` steps and return the proposed tokens.
    pub fn draft(
        &mut self,
        ctx: &mut dyn InferenceContext,
        scratch: &mut Batch,
        seq: SeqId,
        k: usize,
    ) -> Result<Vec<TokenId>, DecodeError> {
        let mut drafts = Vec::with_capacity(k);
        let mut feed = std::mem::take(&mut self.backlog);

        while drafts.len() < k {
            let index = decode_tokens(ctx, scratch, seq, self.draft_past, &feed, usize::MAX, true)?
                .ok_or(DecodeError::InvalidInput)?;
            self.draft_past += feed.len() as Pos;
            let next = ctx
                .logits(index)
                .map(argmax)
                .ok_or(DecodeError::InvalidInput)?;
            drafts.push(next);
            feed = vec![next];
        }
        self.proposed += drafts.len();
        Ok(drafts)
    }

    /// A plain (non-speculative) step decoded `last_token` in the target
    /// only; `next` is the token sampled after it.
    pub fn after_plain_step(&mut self, next: TokenId) {
        self.backlog.push(next);
    }

    /// Update draft bookkeeping after verification. `base` is the position
    /// `last_token` was decoded at, `accepted` the matching draft run and
    /// `bonus` the token sampled after it. Returns the first draft position
    /// to drop from the draft context, if any.
    pub fn after_verify(&mut self, base: Pos, accepted: usize, bonus: TokenId) -> Option<Pos> {
        let k = self.drafts.len();
        self.accepted += accepted;
        if accepted == k {
            // dK was never decoded by the draft model
            self.draft_past = base + k as Pos;
            self.backlog = vec![self.drafts[k - 1], bonus];
            None
        } else {
            self.draft_past = base + accepted as Pos + 1;
            self.backlog = vec![bonus];
            Some(self.draft_past)
        }
    }
}

/// Length of the leading run where drafts agree with target predictions.
/// `predictions[j]` is the target's greedy token after entry `j` of the
/// chain `last_token, d1..dK`, so it is compared against `drafts[j]`.
pub fn accept_run(drafts: &[TokenId], predictions: &[TokenId]) -> usize {
    drafts
        .iter()
        .zip(predictions)
        .take_while(|(d, p)| d == p)
        .count()
}
