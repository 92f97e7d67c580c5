//! Request entry point
//!
//! Turns a [`ChatRequest`] into a [`Job`]: validates it, encodes its media,
//! resolves the cache strategy, renders the uncached part of the prompt and
//! hands the job to the [`BatchEngine`]. The caller gets back a [`ChatStream`] over the job's
//! response channel.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_stream::stream;
use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::debug;

use super::batch_engine::BatchEngine;
use super::job::{Job, JobContext, JobPrompt};
use crate::cache::CachePlan;
use crate::config::CacheMode;
use crate::error::{EngineError, Result};
use crate::prompt::{ChatMessage, ChatRequest, ChatTemplate, DefaultTemplate, PreparedRequest};
use crate::stream::{ChatCompletion, ChunkMeta, ResponseChunk};

/// Chat front end of a batch engine.
pub struct Executor {
    engine: Arc<BatchEngine>,
    template: Arc<dyn ChatTemplate>,
}

impl Executor {
    /// Create an executor rendering prompts with [`DefaultTemplate`].
    pub fn new(engine: Arc<BatchEngine>) -> Self {
        Self::with_template(engine, Arc::new(DefaultTemplate))
    }

    pub fn with_template(engine: Arc<BatchEngine>, template: Arc<dyn ChatTemplate>) -> Self {
        Self { engine, template }
    }

    pub fn engine(&self) -> &Arc<BatchEngine> {
        &self.engine
    }

    /// Submit a chat request and stream its response.
    pub fn chat(&self, request: ChatRequest) -> Result<ChatStream> {
        self.chat_with_token(request, CancellationToken::new())
    }

    /// Like [`Executor::chat`], tied to the caller's cancellation token.
    /// Dropping the returned stream also cancels the job.
    pub fn chat_with_token(
        &self,
        request: ChatRequest,
        token: CancellationToken,
    ) -> Result<ChatStream> {
        let config = self.engine.config();
        let prepared = request.prepare(&config.generation)?;
        let (cache, prompt) = self.plan(&prepared)?;

        let token = token.child_token();
        let meta = ChunkMeta::new(prepared.model.clone());
        let id = meta.id.clone();
        let (tx, rx) = mpsc::channel(config.engine.channel_capacity);
        debug!(
            job = %id,
            messages = prepared.messages.len(),
            cached = cache.cached_tokens(),
            "submitting job"
        );

        let job = Job::new(
            meta,
            JobContext::new(token.clone(), prepared.timeout),
            tx,
            prompt,
            prepared.params,
            cache,
        );
        self.engine.submit(job)?;

        Ok(ChatStream {
            id,
            rx,
            _guard: token.clone().drop_guard(),
            token,
        })
    }

    /// Run a chat request to completion and assemble the full response.
    pub async fn chat_complete(&self, request: ChatRequest) -> Result<ChatCompletion> {
        use futures::StreamExt;

        let mut completion = ChatCompletion::default();
        let mut stream = std::pin::pin!(self.chat(request)?.results());
        while let Some(chunk) = stream.next().await {
            completion.accumulate(chunk?)?;
        }
        Ok(completion)
    }

    /// Pick the cache path and render the text the job still has to prefill.
    fn plan(&self, prepared: &PreparedRequest) -> Result<(CachePlan, JobPrompt)> {
        let messages = &prepared.messages;
        let full_text = self.render(messages)?;
        let media = self.encode_media(&prepared.media)?;
        let uncached = move |text: String| JobPrompt {
            text,
            full_text: None,
            media,
        };

        let cache = &self.engine.config().cache;
        let cache_id = match prepared.cache_id.as_deref() {
            Some(id) if prepared.media.is_empty() && cache.mode != CacheMode::None => id,
            _ => return Ok((CachePlan::None, uncached(full_text))),
        };
        let vocab = self.engine.model().vocab.as_ref();

        match cache.mode {
            CacheMode::SystemPrompt => {
                let hit = self.engine.system_prompt_cache().resolve(
                    cache_id,
                    messages,
                    self.template.as_ref(),
                    vocab,
                    cache.min_tokens,
                )?;
                match hit {
                    Some(hit) => {
                        let text = self.render(&messages[hit.covered..])?;
                        Ok((CachePlan::SystemPrompt(hit), uncached(text)))
                    }
                    None => Ok((CachePlan::None, uncached(full_text))),
                }
            }
            CacheMode::Incremental => {
                let Some(imc) = self.engine.incremental_cache() else {
                    return Ok((CachePlan::None, uncached(full_text)));
                };
                let plan = imc.resolve(
                    cache_id,
                    messages,
                    self.template.as_ref(),
                    vocab,
                    cache.min_tokens,
                )?;
                match plan {
                    Some(plan) => {
                        let last = &messages[messages.len() - 1..];
                        let prompt = JobPrompt {
                            text: self.render(last)?,
                            full_text: Some(full_text),
                            media: Vec::new(),
                        };
                        Ok((CachePlan::Incremental(plan), prompt))
                    }
                    None => Ok((CachePlan::None, uncached(full_text))),
                }
            }
            CacheMode::None => Ok((CachePlan::None, uncached(full_text))),
        }
    }

    /// Run the model's media encoder over every blob, on the caller's
    /// thread so the scheduler only ever decodes finished embeddings.
    fn encode_media(&self, blobs: &[Vec<u8>]) -> Result<Vec<Vec<Vec<f32>>>> {
        if blobs.is_empty() {
            return Ok(Vec::new());
        }
        let encoder = self
            .engine
            .model()
            .media
            .as_ref()
            .ok_or_else(|| EngineError::Media("model has no media encoder".into()))?;
        blobs
            .iter()
            .map(|blob| encoder.encode(blob).map_err(|e| EngineError::Media(e.to_string())))
            .collect()
    }

    fn render(&self, messages: &[ChatMessage]) -> Result<String> {
        self.template
            .render(messages, true)
            .map_err(|e| EngineError::InvalidRequest(format!("template rendering failed: {}", e)))
    }
}

/// Response stream of one submitted job.
///
/// Yields chunks in generation order and ends after the terminal chunk.
/// Dropping it cancels the job.
pub struct ChatStream {
    id: String,
    rx: mpsc::Receiver<ResponseChunk>,
    token: CancellationToken,
    _guard: DropGuard,
}

impl ChatStream {
    /// Response id shared by all chunks.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Withdraw the job. The terminal chunk reports the cancellation.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub async fn next_chunk(&mut self) -> Option<ResponseChunk> {
        self.rx.recv().await
    }

    /// Chunks as results: error chunks become `Err` and end the stream.
    pub fn results(mut self) -> impl Stream<Item = Result<ResponseChunk>> {
        stream! {
            while let Some(mut chunk) = self.rx.recv().await {
                if let Some(err) = chunk.error.take() {
                    yield Err(err);
                    break;
                }
                let done = chunk.is_final();
                yield Ok(chunk);
                if done {
                    break;
                }
            }
        }
    }
}

impl Stream for ChatStream {
    type Item = ResponseChunk;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}
