//! Continuous-batching scheduler
//!
//! Owns the slot pool and the shared batch. One call to [`Scheduler::iterate`]
//! builds a batch from every active slot (one generation token or a draft
//! chain per generating slot, then prefill chunks, then at most one newly
//! admitted job), runs a single decode over it, and samples or verifies the
//! results. Only the scheduling thread ever touches a `Scheduler`.
//!
//! Chunks are handed to each job's channel with `try_send`. A slot whose
//! consumer falls behind keeps its chunks in an [`Outbox`] and sits out of
//! the batch until they are flushed, so one slow reader never holds the
//! decode lock.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::job::{Job, Outbox};
use super::queue::JobQueue;
use super::slot::{PrefillPart, Slot};
use super::speculative::{accept_run, SpecState};
use crate::backend::{argmax, decode_tokens, Batch, Contexts, Model, Pos, SeqId, TokenId};
use crate::cache::{CachePlan, ImcPlan, ImcPlanKind, IncrementalMessageCache};
use crate::config::{BatchrConfig, ModelFamily};
use crate::error::{DecodeError, EngineError, Result};
use crate::prompt::MEDIA_MARKER;
use crate::stream::{Delta, FinishReason, ResponseChunk, Usage};

/// A finished job whose last chunks are still waiting for channel room.
struct Draining {
    job: Job,
    outbox: Outbox,
}

/// Outcome of streaming one token.
enum Step {
    Continue,
    Done(Result<FinishReason>),
}

pub struct Scheduler {
    n_batch: usize,
    n_ctx: usize,
    draft_tokens: usize,
    family: ModelFamily,
    model: Model,
    slots: Vec<Slot>,
    batch: Batch,
    scratch: Batch,
    queue: Arc<JobQueue>,
    imc: Option<Arc<IncrementalMessageCache>>,
    draining: Vec<Draining>,
    rotation: usize,
}

impl Scheduler {
    pub fn new(
        config: &BatchrConfig,
        model: Model,
        queue: Arc<JobQueue>,
        imc: Option<Arc<IncrementalMessageCache>>,
    ) -> Self {
        let engine = &config.engine;
        let draft_tokens = if model.context.has_draft() {
            config.speculative.draft_tokens
        } else {
            0
        };
        Self {
            n_batch: engine.n_batch,
            n_ctx: engine.n_ctx,
            draft_tokens,
            family: engine.model_family,
            model,
            slots: (0..engine.n_slots)
                .map(|id| Slot::new(id, engine.model_family))
                .collect(),
            batch: Batch::with_capacity(engine.n_batch),
            scratch: Batch::with_capacity(engine.n_batch),
            queue,
            imc,
            draining: Vec::new(),
            rotation: 0,
        }
    }

    /// True while any slot is active, jobs are waiting, or finished jobs
    /// still have chunks to deliver.
    pub fn has_work(&self) -> bool {
        self.active_slots() > 0 || !self.queue.is_empty() || !self.draining.is_empty()
    }

    pub fn active_slots(&self) -> usize {
        self.slots.iter().filter(|s| s.is_active()).count()
    }

    /// Run one scheduling iteration. Returns true when a decode call ran.
    pub fn iterate(&mut self) -> bool {
        let context = Arc::clone(&self.model.context);
        let mut ctx = context.lock();

        self.batch.clear();
        for slot in &mut self.slots {
            slot.logits_index = None;
            slot.spec_index = None;
        }
        let order = self.slot_order();

        self.drain_finished();
        self.reap_cancelled(&mut ctx);
        self.prefill_drafts(&mut ctx);
        self.add_generation_tokens(&mut ctx, &order);
        self.add_prefill_chunks(&mut ctx, &order);
        self.admit(&mut ctx);

        if self.batch.is_empty() {
            return false;
        }

        if self.batch.len() > self.n_batch {
            error!(
                size = self.batch.len(),
                budget = self.n_batch,
                "batch exceeds token budget"
            );
            self.fail_all(
                &mut ctx,
                EngineError::BatchOverflow {
                    size: self.batch.len(),
                    budget: self.n_batch,
                },
            );
            return false;
        }

        debug!(
            batch = self.batch.len(),
            active = self.active_slots(),
            "decoding batch"
        );
        let code = ctx.target.decode(&self.batch);
        if let Some(err) = DecodeError::from_code(code) {
            error!(code, error = %err, "batch decode failed, failing all active slots");
            self.fail_all(&mut ctx, err.into());
            return true;
        }

        self.process_results(&mut ctx);
        true
    }

    /// Fail everything in flight or queued and release all KV sequences.
    pub fn shutdown(&mut self) {
        let context = Arc::clone(&self.model.context);
        let mut ctx = context.lock();

        self.fail_all(&mut ctx, EngineError::ShuttingDown);
        for job in self.queue.close() {
            job.fail(EngineError::ShuttingDown);
        }
        if !self.draining.is_empty() {
            debug!(jobs = self.draining.len(), "dropping undelivered chunks");
            self.draining.clear();
        }
        for slot in &self.slots {
            ctx.target.remove_sequence_range(slot.seq_id, 0, None);
            if let Some(draft) = ctx.draft.as_mut() {
                draft.remove_sequence_range(slot.seq_id, 0, None);
            }
        }
        info!(slots = self.slots.len(), "scheduler drained");
    }

    /// Slot visiting order, rotated every iteration so that no slot is
    /// starved when the budget is tight.
    fn slot_order(&mut self) -> Vec<usize> {
        let n = self.slots.len();
        let start = self.rotation % n.max(1);
        self.rotation = self.rotation.wrapping_add(1);
        (0..n).map(|k| (start + k) % n).collect()
    }

    /// End withdrawn jobs and retry the outboxes of stalled slots.
    fn reap_cancelled(&mut self, ctx: &mut Contexts) {
        for i in 0..self.slots.len() {
            let slot = &mut self.slots[i];
            let outcome = match slot.job.as_ref() {
                Some(job) => match job.ctx.check() {
                    Ok(()) => slot.outbox.flush(&job.tx),
                    Err(err) => Err(err),
                },
                None => continue,
            };
            if let Err(err) = outcome {
                self.finish_slot(ctx, i, Err(err));
            }
        }
    }

    /// Retry finished jobs whose terminal chunks did not fit. A job leaves
    /// once everything is delivered, its receiver is gone, or it was
    /// cancelled; dropping it closes the channel.
    fn drain_finished(&mut self) {
        self.draining.retain_mut(|entry| {
            if entry.job.ctx.token().is_cancelled() {
                return false;
            }
            entry.outbox.flush(&entry.job.tx).is_ok() && !entry.outbox.is_empty()
        });
    }

    /// Give slots that just finished their prompt a matching draft KV.
    fn prefill_drafts(&mut self, ctx: &mut Contexts) {
        let n_batch = self.n_batch;
        for slot in &mut self.slots {
            let waiting = matches!(&slot.spec, Some(spec) if !spec.prefilled);
            if !waiting || !slot.is_generating() {
                continue;
            }
            let Some(draft) = ctx.draft.as_mut() else {
                slot.spec = None;
                continue;
            };

            draft.remove_sequence_range(slot.seq_id, 0, None);
            let tokens = std::mem::take(&mut slot.prompt_tokens);
            match decode_tokens(
                draft.as_mut(),
                &mut self.scratch,
                slot.seq_id,
                0,
                &tokens,
                n_batch,
                false,
            ) {
                Ok(_) => {
                    debug!(slot = slot.id, tokens = tokens.len(), "draft prefilled");
                    slot.spec = Some(SpecState::prefilled(tokens.len(), slot.last_token));
                }
                Err(err) => {
                    warn!(slot = slot.id, error = %err, "draft prefill failed, speculation off");
                    draft.remove_sequence_range(slot.seq_id, 0, None);
                    slot.spec = None;
                }
            }
        }
    }

    fn add_generation_tokens(&mut self, ctx: &mut Contexts, order: &[usize]) {
        for &i in order {
            if !self.slots[i].is_generating() || self.slots[i].is_stalled() {
                continue;
            }
            let room = self.n_batch.saturating_sub(self.batch.len());
            if room == 0 {
                break;
            }

            let slot = &mut self.slots[i];
            let k = match &slot.spec {
                Some(spec) if spec.prefilled => self
                    .draft_tokens
                    .min(room - 1)
                    .min(self.n_ctx.saturating_sub(slot.n_past as usize + 1))
                    .min(slot.remaining_tokens().saturating_sub(1)),
                _ => 0,
            };

            let mut drafts = Vec::new();
            if k > 0 {
                if let (Some(spec), Some(draft)) = (slot.spec.as_mut(), ctx.draft.as_mut()) {
                    match spec.draft(draft.as_mut(), &mut self.scratch, slot.seq_id, k) {
                        Ok(chain) => drafts = chain,
                        Err(err) => {
                            warn!(slot = slot.id, error = %err, "drafting failed, speculation off");
                            draft.remove_sequence_range(slot.seq_id, 0, None);
                            slot.spec = None;
                        }
                    }
                }
            }

            let index = self
                .batch
                .add_token(slot.last_token, slot.n_past, slot.seq_id, true);
            if drafts.is_empty() {
                slot.n_past += 1;
                slot.logits_index = Some(index);
            } else {
                for (j, token) in drafts.iter().enumerate() {
                    self.batch
                        .add_token(*token, slot.n_past + 1 + j as Pos, slot.seq_id, true);
                }
                if let Some(spec) = slot.spec.as_mut() {
                    spec.drafts = drafts;
                }
                slot.spec_index = Some(index);
            }
        }
    }

    fn add_prefill_chunks(&mut self, ctx: &mut Contexts, order: &[usize]) {
        for &i in order {
            if !self.slots[i].is_prefilling() {
                continue;
            }
            let check = match &self.slots[i].job {
                Some(job) => job.ctx.check(),
                None => continue,
            };
            if let Err(err) = check {
                self.finish_slot(ctx, i, Err(err));
                continue;
            }

            let media_next = matches!(self.slots[i].prefill.front(), Some(PrefillPart::Media(_)));
            if media_next {
                if let Err(err) = self.decode_media(ctx, i) {
                    self.finish_slot(ctx, i, Err(err));
                }
                continue;
            }

            if self.batch.len() >= self.n_batch {
                break;
            }
            self.add_prefill_tokens(i);
        }
    }

    /// Move the next chunk of slot `i`'s prompt tokens into the batch.
    fn add_prefill_tokens(&mut self, i: usize) {
        let room = self.n_batch.saturating_sub(self.batch.len());
        let slot = &mut self.slots[i];
        let last_part = slot.prefill.len() == 1;
        let Some(PrefillPart::Tokens { tokens, next }) = slot.prefill.front_mut() else {
            return;
        };

        let take = room.min(tokens.len() - *next);
        let end = *next + take;
        for (offset, token) in tokens[*next..end].iter().enumerate() {
            let is_final = last_part && *next + offset + 1 == tokens.len();
            let index = self
                .batch
                .add_token(*token, slot.n_past, slot.seq_id, is_final);
            slot.n_past += 1;
            if is_final {
                slot.logits_index = Some(index);
            }
        }
        *next = end;
        if *next == tokens.len() {
            slot.prefill.pop_front();
        }
    }

    /// Decode a media part of slot `i` in its own decode calls. Embeddings
    /// never share the token batch.
    fn decode_media(&mut self, ctx: &mut Contexts, i: usize) -> Result<()> {
        let slot = &mut self.slots[i];
        let Some(PrefillPart::Media(embeddings)) = slot.prefill.pop_front() else {
            return Ok(());
        };
        let last_part = slot.prefill.is_empty();
        let total = embeddings.len();
        let mut final_index = None;
        self.scratch.clear();

        for (n, embedding) in embeddings.into_iter().enumerate() {
            let is_final = last_part && n + 1 == total;
            let index = self
                .scratch
                .add_embedding(embedding, slot.n_past, slot.seq_id, is_final);
            slot.n_past += 1;
            if is_final {
                final_index = Some(index);
            }
            if self.scratch.len() == self.n_batch || n + 1 == total {
                let code = ctx.target.decode(&self.scratch);
                self.scratch.clear();
                if let Some(err) = DecodeError::from_code(code) {
                    return Err(EngineError::Media(format!("embedding decode failed: {}", err)));
                }
            }
        }
        debug!(slot = slot.id, embeddings = total, "media chunk decoded");

        if let Some(index) = final_index {
            self.complete_prefill(ctx, i, index);
        }
        Ok(())
    }

    fn admit(&mut self, ctx: &mut Contexts) {
        if self.queue.is_empty() || self.slots.iter().all(|s| s.is_active()) {
            return;
        }
        let Some(job) = self.queue.pop() else {
            return;
        };
        if let Err(err) = job.ctx.check() {
            debug!(job = job.id(), error = %err, "dropping withdrawn job");
            job.fail(err);
            return;
        }

        let target = match job.cache.target_slot() {
            Some(i) => self.slots.get(i).filter(|s| !s.is_active()).map(|s| s.id),
            None => self.pick_uncached_slot(),
        };
        let Some(i) = target else {
            if let Err(job) = self.queue.requeue(job) {
                job.fail(EngineError::ShuttingDown);
            }
            return;
        };

        self.start_slot(ctx, i, job);
        if self.slots[i].is_prefilling() && self.batch.len() < self.n_batch {
            if matches!(self.slots[i].prefill.front(), Some(PrefillPart::Tokens { .. })) {
                self.add_prefill_tokens(i);
            }
        }
    }

    /// Idle slot for a job without an incremental cache plan. Slots holding
    /// no cached conversation are preferred.
    fn pick_uncached_slot(&self) -> Option<usize> {
        let idle: Vec<usize> = self
            .slots
            .iter()
            .filter(|s| !s.is_active())
            .map(|s| s.id)
            .collect();
        let Some(imc) = &self.imc else {
            return idle.first().copied();
        };
        idle.iter()
            .copied()
            .find(|&i| imc.is_vacant(i) && imc.claim_for_uncached(i))
            .or_else(|| idle.iter().copied().find(|&i| imc.claim_for_uncached(i)))
    }

    fn start_slot(&mut self, ctx: &mut Contexts, i: usize, job: Job) {
        let family = self.family;
        let slot = &mut self.slots[i];
        slot.reset(family);
        debug!(slot = i, job = job.id(), "slot assigned");
        slot.activate(job);

        if let Err(err) = self.prepare_slot(ctx, i) {
            warn!(slot = i, error = %err, "job rejected at slot start");
            self.finish_slot(ctx, i, Err(err));
        }
    }

    /// Apply the job's cache plan to the slot's sequence and queue the
    /// uncached part of the prompt for prefill.
    fn prepare_slot(&mut self, ctx: &mut Contexts, i: usize) -> Result<()> {
        let n_batch = self.n_batch;
        let slot = &mut self.slots[i];
        let seq = slot.seq_id;
        let Some(job) = slot.job.as_mut() else {
            return Ok(());
        };
        let media = std::mem::take(&mut job.prompt.media);
        let speculate = self.draft_tokens > 0 && media.is_empty();
        let mut media = media.into_iter();
        let job = &*job;

        let mut text = job.prompt.text.as_str();
        let cached: Arc<Vec<TokenId>> = match &job.cache {
            CachePlan::None => {
                ctx.target.remove_sequence_range(seq, 0, None);
                Arc::new(Vec::new())
            }
            CachePlan::SystemPrompt(hit) => {
                ctx.target.remove_sequence_range(seq, 0, None);
                decode_tokens(
                    ctx.target.as_mut(),
                    &mut self.scratch,
                    seq,
                    0,
                    &hit.tokens,
                    n_batch,
                    false,
                )
                .map_err(|e| {
                    ctx.target.remove_sequence_range(seq, 0, None);
                    EngineError::CacheBuild(e.to_string())
                })?;
                Arc::clone(&hit.tokens)
            }
            CachePlan::Incremental(plan) => {
                let applied = match &self.imc {
                    Some(imc) => apply_imc_plan(ctx, &mut self.scratch, imc, plan, seq, n_batch),
                    None => Ok(false),
                };
                match applied {
                    Ok(true) => {
                        slot.keep_prefix = Some(plan.tokens.len() as Pos);
                        Arc::clone(&plan.tokens)
                    }
                    Ok(false) => {
                        warn!(slot = i, "incremental cache plan is stale, using full prompt");
                        if let Some(imc) = &self.imc {
                            imc.invalidate(plan.slot);
                        }
                        ctx.target.remove_sequence_range(seq, 0, None);
                        text = job.prompt.full_text.as_deref().unwrap_or(text);
                        Arc::new(Vec::new())
                    }
                    Err(err) => {
                        if let Some(imc) = &self.imc {
                            imc.invalidate(plan.slot);
                        }
                        ctx.target.remove_sequence_range(seq, 0, None);
                        return Err(EngineError::CacheBuild(err.to_string()));
                    }
                }
            }
        };

        let mut parts = VecDeque::new();
        let mut text_tokens = Vec::new();
        let mut n_new = 0;
        let segments: Vec<&str> = text.split(MEDIA_MARKER).collect();
        for (k, segment) in segments.iter().enumerate() {
            if !segment.is_empty() {
                let tokens = self
                    .model
                    .vocab
                    .tokenize(segment, cached.is_empty() && k == 0)
                    .map_err(|e| EngineError::Tokenize(e.to_string()))?;
                n_new += tokens.len();
                if speculate {
                    text_tokens.extend_from_slice(&tokens);
                }
                if !tokens.is_empty() {
                    parts.push_back(PrefillPart::Tokens { tokens, next: 0 });
                }
            }
            if k + 1 < segments.len() {
                let embeddings = media
                    .next()
                    .ok_or_else(|| EngineError::Media("missing media embeddings".into()))?;
                n_new += embeddings.len();
                if !embeddings.is_empty() {
                    parts.push_back(PrefillPart::Media(embeddings));
                }
            }
        }

        let total = cached.len() + n_new;
        if total > self.n_ctx {
            return Err(EngineError::ContextWindowExceeded {
                tokens: total,
                n_ctx: self.n_ctx,
            });
        }

        let mut n_past = cached.len() as Pos;
        if parts.is_empty() {
            // Nothing new to decode: re-decode the last cached position to
            // get logits for the first token.
            let Some(&last) = cached.last() else {
                return Err(EngineError::InvalidRequest("prompt is empty".into()));
            };
            n_past -= 1;
            ctx.target.remove_sequence_range(seq, n_past, None);
            parts.push_back(PrefillPart::Tokens {
                tokens: vec![last],
                next: 0,
            });
        }

        if speculate {
            let mut prompt = Vec::with_capacity(total);
            prompt.extend_from_slice(&cached);
            prompt.extend_from_slice(&text_tokens);
            slot.prompt_tokens = prompt;
            slot.spec = Some(SpecState::default());
        }
        slot.n_past = n_past;
        slot.n_prompt = total;
        slot.n_cached = cached.len();
        slot.prefill = parts;
        debug!(
            slot = i,
            prompt = total,
            cached = cached.len(),
            "slot prefill queued"
        );
        Ok(())
    }

    fn process_results(&mut self, ctx: &mut Contexts) {
        for i in 0..self.slots.len() {
            if let Some(index) = self.slots[i].logits_index.take() {
                if self.slots[i].first_token.is_none() {
                    self.complete_prefill(ctx, i, index);
                } else {
                    self.sample_next(ctx, i, index);
                }
            } else if let Some(index) = self.slots[i].spec_index.take() {
                self.verify_drafts(ctx, i, index);
            }
        }
    }

    /// Sample the first token after the prompt and open the response.
    fn complete_prefill(&mut self, ctx: &mut Contexts, i: usize, index: usize) {
        let token = match self.sample(ctx, i, index) {
            Ok(token) => token,
            Err(err) => return self.finish_slot(ctx, i, Err(err)),
        };

        let slot = &mut self.slots[i];
        slot.first_token = Some(std::time::Instant::now());
        if let Some(job) = slot.job.as_ref() {
            let role = ResponseChunk::delta(&job.meta, Delta::role("assistant"));
            if let Err(err) = slot.outbox.send(&job.tx, role) {
                return self.finish_slot(ctx, i, Err(err));
            }
        }
        debug!(slot = i, "prefill complete");

        if let Step::Done(outcome) = self.emit(i, token, false) {
            self.finish_slot(ctx, i, outcome);
        }
    }

    fn sample_next(&mut self, ctx: &mut Contexts, i: usize, index: usize) {
        let token = match self.sample(ctx, i, index) {
            Ok(token) => token,
            Err(err) => return self.finish_slot(ctx, i, Err(err)),
        };
        if let Some(spec) = self.slots[i].spec.as_mut().filter(|s| s.prefilled) {
            spec.after_plain_step(token);
        }
        if let Step::Done(outcome) = self.emit(i, token, false) {
            self.finish_slot(ctx, i, outcome);
        }
    }

    /// Check a draft chain against the target's predictions, roll back the
    /// rejected positions, and stream the accepted run plus the bonus token.
    fn verify_drafts(&mut self, ctx: &mut Contexts, i: usize, start: usize) {
        let drafts = match self.slots[i].spec.as_ref() {
            Some(spec) => spec.drafts.clone(),
            None => return,
        };
        let k = drafts.len();

        let mut predictions = Vec::with_capacity(k);
        for (j, &draft) in drafts.iter().enumerate() {
            let Some(logits) = ctx.target.logits(start + j) else {
                return self.finish_slot(ctx, i, Err(DecodeError::InvalidInput.into()));
            };
            let sampler = self.slots[i].sampler.as_mut();
            let predicted = match sampler.as_deref() {
                Some(sampler) => sampler.predict(logits),
                None => argmax(logits),
            };
            predictions.push(predicted);
            if predicted != draft {
                break;
            }
            // penalties for the next position see this draft
            if let Some(sampler) = sampler {
                sampler.accept(draft);
            }
        }
        let accepted = accept_run(&drafts, &predictions);
        let bonus = match self.sample(ctx, i, start + accepted) {
            Ok(token) => token,
            Err(err) => return self.finish_slot(ctx, i, Err(err)),
        };

        let slot = &mut self.slots[i];
        let base = slot.n_past;
        let keep_until = base + accepted as Pos + 1;
        ctx.target.remove_sequence_range(slot.seq_id, keep_until, None);
        if let Some(spec) = slot.spec.as_mut() {
            if let Some(from) = spec.after_verify(base, accepted, bonus) {
                if let Some(draft) = ctx.draft.as_mut() {
                    draft.remove_sequence_range(slot.seq_id, from, None);
                }
            }
        }
        slot.n_past = keep_until;
        debug!(slot = i, proposed = k, accepted, "drafts verified");

        let run = drafts[..accepted].iter().map(|&token| (token, true));
        for (token, recorded) in run.chain(std::iter::once((bonus, false))) {
            if let Step::Done(outcome) = self.emit(i, token, recorded) {
                return self.finish_slot(ctx, i, outcome);
            }
        }
    }

    fn sample(&mut self, ctx: &Contexts, i: usize, index: usize) -> Result<TokenId> {
        let logits = ctx
            .target
            .logits(index)
            .ok_or(EngineError::Decode(DecodeError::InvalidInput))?;
        let slot = &mut self.slots[i];
        Ok(match slot.sampler.as_mut() {
            Some(sampler) => sampler.sample(logits),
            None => argmax(logits),
        })
    }

    /// Stream one generated token through the slot's processor. `recorded`
    /// tokens are already in the sampler's history.
    fn emit(&mut self, i: usize, token: TokenId, recorded: bool) -> Step {
        let vocab = &self.model.vocab;
        let n_ctx = self.n_ctx;
        let slot = &mut self.slots[i];
        let Some(job) = slot.job.as_ref() else {
            return Step::Continue;
        };
        if let Err(err) = job.ctx.check() {
            return Step::Done(Err(err));
        }
        if let Some(sampler) = slot.sampler.as_mut().filter(|_| !recorded) {
            sampler.accept(token);
        }
        if vocab.is_end_of_generation(token) {
            return Step::Done(Ok(FinishReason::Stop));
        }

        let bytes = vocab.token_to_bytes(token);
        if let Some(delta) = slot.processor.push_token(&bytes) {
            let chunk = ResponseChunk::delta(&job.meta, delta);
            if let Err(err) = slot.outbox.send(&job.tx, chunk) {
                return Step::Done(Err(err));
            }
        }
        slot.last_token = token;

        if slot.remaining_tokens() == 0 || slot.n_past as usize >= n_ctx {
            return Step::Done(Ok(FinishReason::Stop));
        }
        Step::Continue
    }

    fn fail_all(&mut self, ctx: &mut Contexts, err: EngineError) {
        for i in 0..self.slots.len() {
            if self.slots[i].is_active() {
                self.finish_slot(ctx, i, Err(err.clone()));
            }
        }
    }

    /// End the job on slot `i`: release its KV positions, return the slot to
    /// the pool, then queue the terminal chunk behind anything pending.
    fn finish_slot(&mut self, ctx: &mut Contexts, i: usize, outcome: Result<FinishReason>) {
        let family = self.family;
        let slot = &mut self.slots[i];
        let Some(mut job) = slot.job.take() else {
            return;
        };

        let terminal = outcome.map(|reason| {
            let tail = slot.processor.finish();
            let reason = if slot.processor.tool_calls().is_empty() {
                reason
            } else {
                FinishReason::ToolCalls
            };
            (tail, reason, usage(slot))
        });

        let mut outbox = std::mem::take(&mut slot.outbox);
        let keep = slot.keep_prefix.unwrap_or(0);
        ctx.target.remove_sequence_range(slot.seq_id, keep, None);
        if let Some(draft) = ctx.draft.as_mut() {
            draft.remove_sequence_range(slot.seq_id, 0, None);
        }
        slot.reset(family);
        // release any cache reservation before the caller sees the end
        drop(std::mem::replace(&mut job.cache, CachePlan::None));

        match terminal {
            Ok((tail, reason, usage)) => {
                debug!(
                    slot = i,
                    job = job.id(),
                    prompt = usage.prompt_tokens,
                    output = usage.output_tokens,
                    "job finished"
                );
                if let Some(delta) = tail {
                    outbox.enqueue(ResponseChunk::delta(&job.meta, delta));
                }
                outbox.enqueue(ResponseChunk::finish(&job.meta, reason, usage));
                self.deliver(job, outbox);
            }
            Err(EngineError::Cancelled) => {
                debug!(slot = i, job = job.id(), "job withdrawn");
                job.send_error(EngineError::Cancelled);
            }
            Err(err) => {
                if err.is_cancellation() {
                    debug!(slot = i, job = job.id(), error = %err, "job expired");
                } else {
                    warn!(slot = i, job = job.id(), error = %err, "job failed");
                }
                outbox.enqueue(ResponseChunk::error(&job.meta, err));
                self.deliver(job, outbox);
            }
        }
    }

    /// Flush a finished job's last chunks. What does not fit waits in
    /// `draining`; otherwise the job is dropped here, closing its channel.
    fn deliver(&mut self, job: Job, mut outbox: Outbox) {
        if outbox.flush(&job.tx).is_ok() && !outbox.is_empty() {
            debug!(job = job.id(), pending = outbox.len(), "consumer behind, draining");
            self.draining.push(Draining { job, outbox });
        }
    }

    #[cfg(test)]
    fn slots(&self) -> &[Slot] {
        &self.slots
    }

    #[cfg(test)]
    fn batch_len(&self) -> usize {
        self.batch.len()
    }
}

/// Bring slot `seq` in line with an incremental cache plan. Returns false
/// when the plan no longer matches what the sequence holds.
fn apply_imc_plan(
    ctx: &mut Contexts,
    scratch: &mut Batch,
    imc: &IncrementalMessageCache,
    plan: &ImcPlan,
    seq: SeqId,
    n_batch: usize,
) -> std::result::Result<bool, DecodeError> {
    if !imc.plan_is_current(plan) {
        return Ok(false);
    }
    match plan.kind {
        ImcPlanKind::Hit => {
            let resident = ctx.target.max_position(seq).map_or(0, |p| p as usize + 1);
            if resident < plan.tokens.len() {
                return Ok(false);
            }
            ctx.target
                .remove_sequence_range(seq, plan.tokens.len() as Pos, None);
        }
        ImcPlanKind::Extend { from, .. } => {
            ctx.target.remove_sequence_range(seq, from as Pos, None);
            decode_tokens(
                ctx.target.as_mut(),
                scratch,
                seq,
                from as Pos,
                &plan.tokens[from..],
                n_batch,
                false,
            )?;
            imc.commit(plan);
        }
        ImcPlanKind::Rebuild => {
            ctx.target.remove_sequence_range(seq, 0, None);
            decode_tokens(
                ctx.target.as_mut(),
                scratch,
                seq,
                0,
                &plan.tokens,
                n_batch,
                false,
            )?;
            imc.commit(plan);
        }
    }
    Ok(true)
}

fn usage(slot: &Slot) -> Usage {
    let output = slot.processor.output_tokens();
    let elapsed = slot
        .first_token
        .or(slot.started)
        .map(|t| t.elapsed().as_secs_f64())
        .unwrap_or(0.0);
    let (accepted, proposed) = slot
        .spec
        .as_ref()
        .map_or((0, 0), |s| (s.accepted, s.proposed));
    Usage {
        prompt_tokens: slot.n_prompt,
        cached_tokens: slot.n_cached,
        reasoning_tokens: slot.processor.reasoning_tokens(),
        completion_tokens: slot.processor.completion_tokens(),
        output_tokens: output,
        total_tokens: slot.n_prompt + output,
        tokens_per_second: if elapsed > 0.0 {
            output as f64 / elapsed
        } else {
            0.0
        },
        draft_accepted: accepted,
        draft_proposed: proposed,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use proptest::prelude::*;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::backend::scripted::{ScriptedModel, ScriptedProbe};
    use crate::backend::ModelContext;
    use crate::config::GenerationConfig;
    use crate::engine::job::{JobContext, JobPrompt};
    use crate::stream::{ChatCompletion, ChunkMeta};

    const PROMPT: &str = "<|user|>\nhi\n<|assistant|>";

    struct Harness {
        scheduler: Scheduler,
        queue: Arc<JobQueue>,
        probe: ScriptedProbe,
        draft_probe: Option<ScriptedProbe>,
    }

    fn config(n_slots: usize, n_batch: usize, draft_tokens: usize) -> BatchrConfig {
        let mut config = BatchrConfig::default();
        config.engine.n_slots = n_slots;
        config.engine.n_batch = n_batch;
        config.engine.n_ctx = 256;
        config.speculative.draft_tokens = draft_tokens;
        config
    }

    fn harness(config: BatchrConfig, reply: &str, draft_reply: Option<&str>) -> Harness {
        let target = ScriptedModel::new(reply);
        let (ctx, probe) = target.context(4096);
        let mut context = ModelContext::new(ctx);
        let mut draft_probe = None;
        if let Some(draft_reply) = draft_reply {
            let (draft_ctx, p) = ScriptedModel::new(draft_reply).context(4096);
            context = context.with_draft(draft_ctx);
            draft_probe = Some(p);
        }
        let model = Model::new(target.vocab(), context);
        let queue = Arc::new(JobQueue::new(64));
        let scheduler = Scheduler::new(&config, model, Arc::clone(&queue), None);
        Harness {
            scheduler,
            queue,
            probe,
            draft_probe,
        }
    }

    fn submit_with(
        queue: &JobQueue,
        text: &str,
        params: GenerationConfig,
        timeout: Option<Duration>,
    ) -> (mpsc::Receiver<ResponseChunk>, CancellationToken) {
        submit_bounded(queue, text, params, timeout, 512)
    }

    fn submit_bounded(
        queue: &JobQueue,
        text: &str,
        params: GenerationConfig,
        timeout: Option<Duration>,
        capacity: usize,
    ) -> (mpsc::Receiver<ResponseChunk>, CancellationToken) {
        let (tx, rx) = mpsc::channel(capacity);
        let token = CancellationToken::new();
        let job = Job::new(
            ChunkMeta::new("scripted"),
            JobContext::new(token.clone(), timeout),
            tx,
            JobPrompt {
                text: text.to_string(),
                ..Default::default()
            },
            params,
            CachePlan::None,
        );
        assert!(queue.push(job).is_ok());
        (rx, token)
    }

    fn submit(queue: &JobQueue) -> mpsc::Receiver<ResponseChunk> {
        submit_with(queue, PROMPT, GenerationConfig::greedy(), None).0
    }

    fn run(scheduler: &mut Scheduler) {
        for _ in 0..10_000 {
            if !scheduler.has_work() {
                return;
            }
            scheduler.iterate();
        }
        panic!("scheduler did not drain");
    }

    fn collect(rx: &mut mpsc::Receiver<ResponseChunk>) -> Result<ChatCompletion> {
        let mut completion = ChatCompletion::default();
        while let Ok(chunk) = rx.try_recv() {
            completion.accumulate(chunk)?;
        }
        Ok(completion)
    }

    #[test]
    fn single_job_streams_reply_and_frees_kv() {
        let mut h = harness(config(2, 64, 0), "hello", None);
        let mut rx = submit(&h.queue);
        run(&mut h.scheduler);

        let completion = collect(&mut rx).unwrap();
        assert_eq!(completion.content, "hello");
        assert_eq!(completion.finish_reason, Some(FinishReason::Stop));
        assert_eq!(completion.usage.completion_tokens, 5);
        // two markers plus "\nhi\n"
        assert_eq!(completion.usage.prompt_tokens, 6);
        assert_eq!(h.probe.total_cells(), 0);
        assert_eq!(h.scheduler.active_slots(), 0);
    }

    #[test]
    fn jobs_beyond_slot_count_wait_their_turn() {
        let mut h = harness(config(2, 16, 0), "abc", None);
        let mut receivers: Vec<_> = (0..5).map(|_| submit(&h.queue)).collect();
        run(&mut h.scheduler);

        for rx in &mut receivers {
            assert_eq!(collect(rx).unwrap().content, "abc");
        }
        assert!(h.probe.largest_batch() <= 16);
    }

    #[test]
    fn max_tokens_ends_with_stop() {
        let mut h = harness(config(1, 64, 0), "hello", None);
        let params = GenerationConfig {
            max_tokens: 2,
            ..GenerationConfig::greedy()
        };
        let (mut rx, _) = submit_with(&h.queue, PROMPT, params, None);
        run(&mut h.scheduler);

        let completion = collect(&mut rx).unwrap();
        assert_eq!(completion.content, "he");
        assert_eq!(completion.finish_reason, Some(FinishReason::Stop));
    }

    #[test]
    fn decode_failure_fails_every_active_slot() {
        let mut h = harness(config(2, 64, 0), "a long reply", None);
        let mut first = submit(&h.queue);
        let mut second = submit(&h.queue);
        h.scheduler.iterate();
        h.scheduler.iterate();
        assert_eq!(h.scheduler.active_slots(), 2);

        h.probe.fail_next_decode(2);
        h.scheduler.iterate();

        let expected: Result<String> = Err(EngineError::Decode(DecodeError::Aborted));
        assert_eq!(collect(&mut first).map(|c| c.content), expected);
        assert_eq!(collect(&mut second).map(|c| c.content), expected);
        assert_eq!(h.scheduler.active_slots(), 0);
        assert_eq!(h.probe.total_cells(), 0);
    }

    #[test]
    fn cancelled_job_releases_its_slot() {
        let mut h = harness(config(1, 64, 0), "a long reply", None);
        let (mut rx, token) = submit_with(&h.queue, PROMPT, GenerationConfig::greedy(), None);
        h.scheduler.iterate();
        h.scheduler.iterate();
        token.cancel();
        h.scheduler.iterate();

        assert_eq!(collect(&mut rx).map(|_| ()), Err(EngineError::Cancelled));
        assert!(!h.scheduler.slots()[0].is_active());
        assert_eq!(h.probe.total_cells(), 0);

        let mut next = submit(&h.queue);
        run(&mut h.scheduler);
        assert_eq!(collect(&mut next).unwrap().content, "a long reply");
    }

    #[test]
    fn dropped_receiver_counts_as_cancellation() {
        let mut h = harness(config(1, 64, 0), "hello", None);
        drop(submit(&h.queue));
        run(&mut h.scheduler);
        assert_eq!(h.scheduler.active_slots(), 0);
        assert_eq!(h.probe.total_cells(), 0);
    }

    #[test]
    fn expired_deadline_never_takes_a_slot() {
        let mut h = harness(config(1, 64, 0), "hello", None);
        let (mut rx, _) = submit_with(
            &h.queue,
            PROMPT,
            GenerationConfig::greedy(),
            Some(Duration::ZERO),
        );
        run(&mut h.scheduler);
        assert_eq!(
            collect(&mut rx).map(|_| ()),
            Err(EngineError::DeadlineExceeded)
        );
        assert_eq!(h.probe.decode_calls(), 0);
    }

    #[test]
    fn oversized_prompt_is_rejected() {
        let mut cfg = config(1, 64, 0);
        cfg.engine.n_ctx = 8;
        let mut h = harness(cfg, "hello", None);
        let (mut rx, _) = submit_with(
            &h.queue,
            "<|user|>\na prompt well past eight tokens\n<|assistant|>",
            GenerationConfig::greedy(),
            None,
        );
        run(&mut h.scheduler);
        assert!(matches!(
            collect(&mut rx),
            Err(EngineError::ContextWindowExceeded { n_ctx: 8, .. })
        ));
    }

    #[test]
    fn matching_draft_is_fully_accepted() {
        let mut h = harness(config(1, 64, 3), "abcdefgh", Some("abcdefgh"));
        let mut rx = submit(&h.queue);
        run(&mut h.scheduler);

        let completion = collect(&mut rx).unwrap();
        assert_eq!(completion.content, "abcdefgh");
        assert!(completion.usage.draft_proposed > 0);
        assert_eq!(
            completion.usage.draft_accepted,
            completion.usage.draft_proposed
        );
        assert_eq!(h.probe.total_cells(), 0);
        assert_eq!(h.draft_probe.map(|p| p.total_cells()), Some(0));
    }

    #[test]
    fn diverging_draft_never_changes_output() {
        let mut h = harness(config(1, 64, 4), "abcdefgh", Some("abXdeYgh"));
        let mut rx = submit(&h.queue);
        run(&mut h.scheduler);

        let completion = collect(&mut rx).unwrap();
        assert_eq!(completion.content, "abcdefgh");
        assert!(completion.usage.draft_accepted < completion.usage.draft_proposed);
    }

    #[test]
    fn rejected_drafts_leave_kv_at_the_accepted_run() {
        let mut h = harness(config(1, 64, 3), "abcdefgh", Some("abXdefgh"));
        let mut rx = submit(&h.queue);
        h.scheduler.iterate();
        assert_eq!(collect(&mut rx).unwrap().content, "a");
        let base = h.scheduler.slots()[0].n_past as usize;
        assert_eq!(base, 6);

        // drafts b X d, the target rejects X and samples c instead
        h.scheduler.iterate();
        assert_eq!(collect(&mut rx).unwrap().content, "bc");
        let mismatch = 1;
        assert_eq!(h.probe.sequence_len(0), base + mismatch + 1);
        let draft = h.draft_probe.as_ref().unwrap();
        assert_eq!(draft.sequence_len(0), base + mismatch + 1);
        assert_eq!(h.scheduler.slots()[0].n_past as usize, base + mismatch + 1);

        run(&mut h.scheduler);
        assert_eq!(collect(&mut rx).unwrap().content, "defgh");
    }

    #[test]
    fn accepted_chain_emits_every_draft_plus_bonus() {
        let k = 3;
        let mut h = harness(config(1, 64, k), "abcdefgh", Some("abcdefgh"));
        let mut rx = submit(&h.queue);
        h.scheduler.iterate();
        assert_eq!(collect(&mut rx).unwrap().content, "a");
        let base = h.scheduler.slots()[0].n_past as usize;

        h.scheduler.iterate();
        let step = collect(&mut rx).unwrap();
        assert_eq!(step.content, "bcde");
        assert_eq!(step.content.len(), k + 1);
        // last_token plus K drafts in the target; the final draft is still
        // pending for the draft model
        assert_eq!(h.probe.sequence_len(0), base + k + 1);
        let draft = h.draft_probe.as_ref().unwrap();
        assert_eq!(draft.sequence_len(0), base + k);
    }

    #[test]
    fn speculation_matches_plain_decoding_under_penalties() {
        let params = GenerationConfig {
            presence_penalty: 20.0,
            ..GenerationConfig::greedy()
        };
        let decode = |draft_tokens: usize| {
            let draft = (draft_tokens > 0).then_some("abab");
            let mut h = harness(config(1, 64, draft_tokens), "abab", draft);
            let (mut rx, _) = submit_with(&h.queue, PROMPT, params.clone(), None);
            run(&mut h.scheduler);
            collect(&mut rx).unwrap()
        };

        let plain = decode(0);
        // the repeated 'a' is penalized below the end-of-turn token
        assert_eq!(plain.content, "ab");
        let speculative = decode(3);
        assert_eq!(speculative.content, plain.content);
        assert_eq!(speculative.finish_reason, Some(FinishReason::Stop));
        assert!(speculative.usage.draft_proposed > 0);
    }

    #[test]
    fn stalled_consumer_never_blocks_other_slots() {
        let mut h = harness(config(2, 64, 0), "a long reply", None);
        let (mut stalled, token) =
            submit_bounded(&h.queue, PROMPT, GenerationConfig::greedy(), None, 2);
        let mut healthy = submit(&h.queue);

        for _ in 0..200 {
            h.scheduler.iterate();
        }
        assert_eq!(collect(&mut healthy).unwrap().content, "a long reply");
        assert_eq!(h.scheduler.active_slots(), 1);
        assert!(h.scheduler.slots()[0].is_stalled());

        token.cancel();
        h.scheduler.iterate();
        assert!(!h.scheduler.slots()[0].is_active());
        assert!(!h.scheduler.has_work());
        assert_eq!(h.probe.total_cells(), 0);

        // the two chunks that fit, then a closed channel
        for _ in 0..2 {
            assert!(stalled.try_recv().unwrap().error.is_none());
        }
        assert_eq!(
            stalled.try_recv().unwrap_err(),
            mpsc::error::TryRecvError::Disconnected
        );
    }

    #[test]
    fn finished_job_waits_for_its_reader() {
        let mut h = harness(config(1, 64, 0), "hello", None);
        let params = GenerationConfig {
            max_tokens: 2,
            ..GenerationConfig::greedy()
        };
        let (mut rx, _) = submit_bounded(&h.queue, PROMPT, params, None, 1);

        // role fills the channel, "h" waits in the outbox
        h.scheduler.iterate();
        h.scheduler.iterate();
        assert!(h.scheduler.slots()[0].is_stalled());
        let mut completion = ChatCompletion::default();
        completion.accumulate(rx.try_recv().unwrap()).unwrap();

        // "h" is flushed, "e" and the finish chunk queue up behind it
        h.scheduler.iterate();
        assert_eq!(h.scheduler.active_slots(), 0);
        assert!(h.scheduler.has_work());
        assert_eq!(h.probe.total_cells(), 0);

        for _ in 0..10 {
            while let Ok(chunk) = rx.try_recv() {
                completion.accumulate(chunk).unwrap();
            }
            h.scheduler.iterate();
        }
        assert!(!h.scheduler.has_work());
        assert_eq!(completion.content, "he");
        assert_eq!(completion.finish_reason, Some(FinishReason::Stop));
    }

    #[test]
    fn shutdown_fails_active_and_queued_jobs() {
        let mut h = harness(config(1, 64, 0), "a long reply", None);
        let mut active = submit(&h.queue);
        let mut queued = submit(&h.queue);
        h.scheduler.iterate();
        h.scheduler.shutdown();

        assert_eq!(collect(&mut active).map(|_| ()), Err(EngineError::ShuttingDown));
        assert_eq!(collect(&mut queued).map(|_| ()), Err(EngineError::ShuttingDown));
        assert!(h.queue.is_closed());
        assert_eq!(h.probe.total_cells(), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn batches_stay_within_budget(
            n_slots in 1usize..4,
            n_batch in 4usize..24,
            draft_tokens in 0usize..4,
            prompts in prop::collection::vec("[a-z ]{1,40}", 1..6),
        ) {
            let draft = (draft_tokens > 0).then_some("ok, done");
            let mut h = harness(config(n_slots, n_batch, draft_tokens), "ok, done", draft);
            let mut receivers: Vec<_> = prompts
                .iter()
                .map(|p| {
                    let text = format!("<|user|>\n{}\n<|assistant|>", p);
                    submit_with(&h.queue, &text, GenerationConfig::greedy(), None).0
                })
                .collect();

            for _ in 0..10_000 {
                if !h.scheduler.has_work() {
                    break;
                }
                h.scheduler.iterate();
                prop_assert!(h.scheduler.batch_len() <= n_batch);
                let mut jobs: Vec<&str> = h
                    .scheduler
                    .slots()
                    .iter()
                    .filter_map(|s| s.job.as_ref().map(|j| j.id()))
                    .collect();
                let active = jobs.len();
                jobs.sort_unstable();
                jobs.dedup();
                prop_assert_eq!(jobs.len(), active);
            }

            prop_assert!(h.probe.largest_batch() <= n_batch);
            for rx in &mut receivers {
                prop_assert_eq!(collect(rx).unwrap().content, "ok, done");
            }
            prop_assert_eq!(h.probe.total_cells(), 0);
        }
    }
}
