//! Job: one inbound request on its way through the engine

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use crate::cache::CachePlan;
use crate::config::GenerationConfig;
use crate::error::{EngineError, Result};
use crate::stream::{ChunkMeta, ResponseChunk};

/// Cancellation and deadline of a job.
#[derive(Debug, Clone)]
pub struct JobContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl JobContext {
    pub fn new(token: CancellationToken, timeout: Option<Duration>) -> Self {
        Self {
            token,
            deadline: timeout.map(|t| Instant::now() + t),
        }
    }

    /// Fails once the caller cancelled or the deadline passed.
    pub fn check(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(EngineError::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Prompt text of a job, split by what the cache already covers.
#[derive(Debug, Clone, Default)]
pub struct JobPrompt {
    /// Rendered text not covered by the cache plan
    pub text: String,
    /// Whole rendered prompt, for falling back when a cache plan went stale
    pub full_text: Option<String>,
    /// Encoded media, one embedding list per media marker in `text`
    pub media: Vec<Vec<Vec<f32>>>,
}

/// Unit of work handed to the batch engine.
#[derive(Debug)]
pub struct Job {
    pub meta: ChunkMeta,
    pub ctx: JobContext,
    pub tx: mpsc::Sender<ResponseChunk>,
    pub prompt: JobPrompt,
    pub params: GenerationConfig,
    pub cache: CachePlan,
    pub submitted: Instant,
}

impl Job {
    pub fn new(
        meta: ChunkMeta,
        ctx: JobContext,
        tx: mpsc::Sender<ResponseChunk>,
        prompt: JobPrompt,
        params: GenerationConfig,
        cache: CachePlan,
    ) -> Self {
        Self {
            meta,
            ctx,
            tx,
            prompt,
            params,
            cache,
            submitted: Instant::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.meta.id
    }

    /// Deliver a terminal error without blocking. Dropping the job right
    /// after closes the channel.
    pub fn send_error(&self, err: EngineError) {
        let _ = self.tx.try_send(ResponseChunk::error(&self.meta, err));
    }

    /// Fail the job and release everything it holds.
    pub fn fail(self, err: EngineError) {
        self.send_error(err);
    }
}

/// Chunks produced for a job that its channel had no room for yet.
///
/// The scheduling thread never waits on a consumer: a full channel leaves
/// chunks here, in order, until a later iteration flushes them.
#[derive(Debug, Default)]
pub struct Outbox {
    pending: VecDeque<ResponseChunk>,
}

impl Outbox {
    /// Queue `chunk` behind anything still pending, then flush.
    pub fn send(&mut self, tx: &mpsc::Sender<ResponseChunk>, chunk: ResponseChunk) -> Result<()> {
        self.pending.push_back(chunk);
        self.flush(tx)
    }

    /// Queue `chunk` without touching the channel.
    pub fn enqueue(&mut self, chunk: ResponseChunk) {
        self.pending.push_back(chunk);
    }

    /// Move pending chunks into the channel until it is full. Fails with
    /// `Cancelled` once the receiver is gone.
    pub fn flush(&mut self, tx: &mpsc::Sender<ResponseChunk>) -> Result<()> {
        while let Some(chunk) = self.pending.pop_front() {
            match tx.try_send(chunk) {
                Ok(()) => {}
                Err(TrySendError::Full(chunk)) => {
                    self.pending.push_front(chunk);
                    break;
                }
                Err(TrySendError::Closed(_)) => {
                    self.pending.clear();
                    return Err(EngineError::Cancelled);
                }
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::Delta;

    #[test]
    fn context_reports_cancel_and_deadline() {
        let token = CancellationToken::new();
        let ctx = JobContext::new(token.clone(), None);
        assert!(ctx.check().is_ok());
        token.cancel();
        assert_eq!(ctx.check(), Err(EngineError::Cancelled));

        let expired = JobContext::new(CancellationToken::new(), Some(Duration::ZERO));
        assert_eq!(expired.check(), Err(EngineError::DeadlineExceeded));
    }

    #[test]
    fn failed_job_sends_error_and_closes_channel() {
        let (tx, mut rx) = mpsc::channel(4);
        let job = Job::new(
            ChunkMeta::new("m"),
            JobContext::new(CancellationToken::new(), None),
            tx,
            JobPrompt::default(),
            GenerationConfig::default(),
            CachePlan::None,
        );
        job.fail(EngineError::ShuttingDown);

        let chunk = rx.try_recv().unwrap();
        assert_eq!(chunk.error, Some(EngineError::ShuttingDown));
        assert!(chunk.is_final());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn outbox_holds_chunks_until_the_channel_has_room() {
        let meta = ChunkMeta::new("m");
        let text = |t: &str| {
            ResponseChunk::delta(
                &meta,
                Delta {
                    content: Some(t.to_string()),
                    ..Default::default()
                },
            )
        };
        let (tx, mut rx) = mpsc::channel(1);
        let mut outbox = Outbox::default();

        outbox.send(&tx, ResponseChunk::delta(&meta, Delta::role("assistant"))).unwrap();
        outbox.send(&tx, text("a")).unwrap();
        outbox.send(&tx, text("b")).unwrap();
        assert_eq!(outbox.len(), 2);

        assert_eq!(rx.try_recv().unwrap().delta.role.as_deref(), Some("assistant"));
        outbox.flush(&tx).unwrap();
        assert_eq!(outbox.len(), 1);
        assert_eq!(rx.try_recv().unwrap().delta.content.as_deref(), Some("a"));

        drop(rx);
        assert_eq!(outbox.flush(&tx), Err(EngineError::Cancelled));
        assert!(outbox.is_empty());
    }
}
