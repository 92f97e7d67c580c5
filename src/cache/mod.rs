//! KV cache reuse
//!
//! Two exclusive strategies:
//! - [`SystemPromptCache`]: the leading system message of a session,
//!   tokenized once and kept in RAM, decoded into each slot that needs it
//! - [`IncrementalMessageCache`]: whole conversation prefixes kept resident
//!   in the KV sequence of a dedicated slot, extended turn by turn
//!
//! Lookups only touch bookkeeping; the matching KV decode happens when the
//! job's slot starts, under the decode lock.

mod imc;
mod spc;

pub use imc::{ImcEntry, ImcPlan, ImcPlanKind, IncrementalMessageCache};
pub use spc::{SpcHit, SystemPromptCache};

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::prompt::ChatMessage;

/// Cache decision attached to a job.
#[derive(Debug, Default)]
pub enum CachePlan {
    #[default]
    None,
    SystemPrompt(SpcHit),
    Incremental(ImcPlan),
}

impl CachePlan {
    /// Tokens the job gets from the cache instead of prefilling them.
    pub fn cached_tokens(&self) -> usize {
        match self {
            CachePlan::None => 0,
            CachePlan::SystemPrompt(hit) => hit.tokens.len(),
            CachePlan::Incremental(plan) => plan.tokens.len(),
        }
    }

    /// Incremental cache slot the job must run on, if any.
    pub fn target_slot(&self) -> Option<usize> {
        match self {
            CachePlan::Incremental(plan) => Some(plan.slot),
            _ => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, CachePlan::None)
    }
}

/// Hash of a text blob.
pub fn hash_text(text: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

/// Chained hash over a message list; equal lists hash equal.
pub fn hash_messages(messages: &[ChatMessage]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for msg in messages {
        msg.role.hash(&mut hasher);
        msg.content.hash(&mut hasher);
    }
    messages.len().hash(&mut hasher);
    hasher.finish()
}
