//! Batching engine
//!
//! - [`Executor`]: request entry point, cache resolution, response streams
//! - [`BatchEngine`]: scheduler thread lifecycle and job admission
//! - `Scheduler`: slot pool and the per-iteration batch loop
//! - [`Job`] / [`JobContext`]: one request in flight, its cancellation and deadline

mod batch_engine;
mod executor;
mod job;
mod queue;
mod sampler;
mod scheduler;
mod slot;
mod speculative;

pub use batch_engine::BatchEngine;
pub use executor::{ChatStream, Executor};
pub use job::{Job, JobContext, JobPrompt};
pub use sampler::Sampler;
pub use speculative::accept_run;
