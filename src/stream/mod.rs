//! Streaming processor
//!
//! Token bytes flow through a UTF-8 carry buffer, then a section classifier
//! for the model family, and come out as [`Delta`]s ready for a
//! [`ResponseChunk`].

mod chunk;
mod classify;
mod processor;
mod utf8;

pub use chunk::{ChatCompletion, ChunkMeta, Delta, FinishReason, ResponseChunk, ToolCall, Usage};
pub use classify::{Classifier, Piece, Section};
pub use processor::StreamProcessor;
pub use utf8::Utf8Buffer;
