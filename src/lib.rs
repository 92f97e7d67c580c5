//! Batchr - continuous-batching inference core
//!
//! Batchr multiplexes many concurrent chat requests onto one loaded model:
//! a fixed pool of execution slots shares a single decode batch per
//! iteration, prompt prefixes are reused across requests, and an optional
//! draft model speculates ahead of the target.
//!
//! # Architecture
//!
//! - **backend**: the narrow contract with the inference engine (tokenize,
//!   batched decode, KV sequence management) plus a scripted reference model
//! - **engine**: job queue, slot scheduler, speculative decoding, entry point
//! - **cache**: system prompt cache and incremental message cache
//! - **stream**: UTF-8 safe detokenization and reasoning / tool-call sections
//!
//! # Example
//!
//! ```bash
//! # 8 concurrent 3-turn chats against the scripted model
//! batchr simulate --chats 8 --turns 3 --cache-id demo
//!
//! # Show the effective configuration
//! batchr --config batchr.yaml config
//! ```

pub mod backend;
pub mod cache;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod prompt;
pub mod stream;

// Re-export key types
pub use config::{BatchrConfig, GenerationConfig};
pub use engine::{BatchEngine, ChatStream, Executor};
pub use error::{DecodeError, EngineError};
pub use prompt::{ChatMessage, ChatRequest};
pub use stream::{ChatCompletion, ResponseChunk};
