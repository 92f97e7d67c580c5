//! KV cache reuse settings

use serde::{Deserialize, Serialize};

/// Which cache reuse strategy the engine runs. The two are exclusive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    #[default]
    None,
    /// Cache the leading system message per cache id
    SystemPrompt,
    /// Cache whole conversation prefixes in dedicated slots
    Incremental,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub mode: CacheMode,

    /// Prefixes shorter than this are not worth caching
    #[serde(default = "default_min_tokens")]
    pub min_tokens: usize,

    /// Number of incremental cache slots (defaults to the slot count)
    #[serde(default)]
    pub max_sessions: Option<usize>,
}

fn default_min_tokens() -> usize {
    100
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            mode: CacheMode::None,
            min_tokens: default_min_tokens(),
            max_sessions: None,
        }
    }
}

impl CacheConfig {
    /// Effective number of incremental cache slots for a pool of `n_slots`.
    pub fn sessions(&self, n_slots: usize) -> usize {
        self.max_sessions.unwrap_or(n_slots)
    }
}
