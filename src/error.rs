//! Error taxonomy for the batching core
//!
//! `EngineError` is what a job's caller sees, either synchronously from
//! `submit`/`chat` or as the terminal chunk on the response channel.
//! `DecodeError` is the translation of a native decode return code.

use thiserror::Error;

/// Native decode failure, translated from the backend's return code.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// No free KV space for the batch.
    #[error("context is full: no free KV cache space for the batch")]
    ContextFull,

    /// The backend aborted the decode (abort callback fired).
    #[error("decode aborted")]
    Aborted,

    /// The batch was rejected as malformed (bad positions, sequence ids, ...).
    #[error("invalid input batch")]
    InvalidInput,

    /// Unrecoverable backend failure.
    #[error("fatal decode error (code {0})")]
    Fatal(i32),
}

impl DecodeError {
    /// Translate a native return code. `0` is success and maps to `None`.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => None,
            1 => Some(Self::ContextFull),
            2 => Some(Self::Aborted),
            -1 => Some(Self::InvalidInput),
            // Positive codes other than 1/2 are warnings in llama-style
            // backends; treat them as fatal since the batch state is unknown.
            other => Some(Self::Fatal(other)),
        }
    }
}

/// Errors delivered to a job's caller.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error("engine is shutting down")]
    ShuttingDown,

    #[error("request queue is full ({depth} jobs waiting)")]
    QueueFull { depth: usize },

    #[error("request cancelled")]
    Cancelled,

    #[error("request deadline exceeded")]
    DeadlineExceeded,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("prompt of {tokens} tokens exceeds the context window of {n_ctx} tokens")]
    ContextWindowExceeded { tokens: usize, n_ctx: usize },

    #[error("cache id {requested:?} rejected: cache slots are bound to {bound:?}")]
    CacheSessionBusy { requested: String, bound: String },

    #[error("cache build failed: {0}")]
    CacheBuild(String),

    #[error("tokenization failed: {0}")]
    Tokenize(String),

    #[error("media encoding failed: {0}")]
    Media(String),

    #[error("batch of {size} tokens exceeds the per-call budget of {budget}")]
    BatchOverflow { size: usize, budget: usize },

    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),
}

impl EngineError {
    /// True for errors that come from the caller withdrawing the request.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
