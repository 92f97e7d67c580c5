//! Batch engine settings

use serde::{Deserialize, Serialize};

/// Token-marker dialect the streaming classifier understands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFamily {
    /// `<think>` reasoning and `<tool_call>` JSON bodies
    #[default]
    Standard,
    /// `<|channel|>` / `<|message|>` framed output
    Harmony,
}

/// Scheduler and slot pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of parallel execution slots
    #[serde(default = "default_n_slots")]
    pub n_slots: usize,

    /// Token budget of one decode call
    #[serde(default = "default_n_batch")]
    pub n_batch: usize,

    /// Context window per slot, in tokens
    #[serde(default = "default_n_ctx")]
    pub n_ctx: usize,

    /// Maximum number of queued jobs
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    /// Capacity of each response channel
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Loop wake interval while work is in flight (microseconds)
    #[serde(default = "default_active_wake_us")]
    pub active_wake_us: u64,

    /// Loop wake interval while idle (milliseconds)
    #[serde(default = "default_idle_wake_ms")]
    pub idle_wake_ms: u64,

    /// Output marker dialect of the loaded model
    #[serde(default)]
    pub model_family: ModelFamily,
}

fn default_n_slots() -> usize {
    4
}

fn default_n_batch() -> usize {
    512
}

fn default_n_ctx() -> usize {
    4096
}

fn default_queue_depth() -> usize {
    64
}

fn default_channel_capacity() -> usize {
    256
}

fn default_active_wake_us() -> u64 {
    100
}

fn default_idle_wake_ms() -> u64 {
    5
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            n_slots: default_n_slots(),
            n_batch: default_n_batch(),
            n_ctx: default_n_ctx(),
            queue_depth: default_queue_depth(),
            channel_capacity: default_channel_capacity(),
            active_wake_us: default_active_wake_us(),
            idle_wake_ms: default_idle_wake_ms(),
            model_family: ModelFamily::default(),
        }
    }
}

/// Speculative decoding settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpeculativeConfig {
    /// Draft tokens proposed per step (0 = disabled)
    #[serde(default)]
    pub draft_tokens: usize,
}

impl SpeculativeConfig {
    pub fn enabled(&self) -> bool {
        self.draft_tokens > 0
    }
}
