//! Configuration system for batchr
//!
//! BatchrConfig groups the slot pool, cache strategy, speculative decoding
//! and default sampling settings. Every section has serde defaults, so an
//! empty document is a valid configuration.

mod cache;
mod engine;
mod generation;

pub use cache::{CacheConfig, CacheMode};
pub use engine::{EngineConfig, ModelFamily, SpeculativeConfig};
pub use generation::GenerationConfig;

use std::path::Path;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Batchr configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchrConfig {
    /// Slot pool and scheduler settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// KV cache reuse settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Speculative decoding settings
    #[serde(default)]
    pub speculative: SpeculativeConfig,

    /// Default generation settings
    #[serde(default)]
    pub generation: GenerationConfig,
}

impl BatchrConfig {
    /// Load configuration from a YAML file
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file
    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file, picking the format from its extension
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        match path.as_ref().extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(path),
            _ => Self::from_yaml(path),
        }
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        let engine = &self.engine;
        if engine.n_slots == 0 {
            bail!("engine.n_slots must be at least 1");
        }
        if engine.n_batch == 0 {
            bail!("engine.n_batch must be at least 1");
        }
        if engine.n_ctx == 0 {
            bail!("engine.n_ctx must be at least 1");
        }
        if engine.queue_depth == 0 || engine.channel_capacity == 0 {
            bail!("engine.queue_depth and engine.channel_capacity must be at least 1");
        }
        if engine.n_batch < self.speculative.draft_tokens + 1 {
            bail!(
                "engine.n_batch ({}) must hold a full draft chain of {} tokens plus one",
                engine.n_batch,
                self.speculative.draft_tokens
            );
        }
        let sessions = self.cache.sessions(engine.n_slots);
        if sessions > engine.n_slots {
            bail!(
                "cache.max_sessions ({}) cannot exceed engine.n_slots ({})",
                sessions,
                engine.n_slots
            );
        }
        if self.cache.mode == CacheMode::Incremental && sessions == 0 {
            bail!("incremental cache needs at least one session");
        }
        Ok(())
    }

    /// Number of incremental cache slots in effect
    pub fn cache_sessions(&self) -> usize {
        match self.cache.mode {
            CacheMode::Incremental => self.cache.sessions(self.engine.n_slots),
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batchr_config_yaml() {
        let yaml = r#"
engine:
  n_slots: 8
  n_batch: 1024
  model_family: harmony

cache:
  mode: incremental
  min_tokens: 32
  max_sessions: 4

speculative:
  draft_tokens: 5

generation:
  max_tokens: 256
  temperature: 0.7
"#;
        let config: BatchrConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.engine.n_slots, 8);
        assert_eq!(config.engine.n_ctx, 4096);
        assert_eq!(config.engine.model_family, ModelFamily::Harmony);
        assert_eq!(config.cache.mode, CacheMode::Incremental);
        assert_eq!(config.cache_sessions(), 4);
        assert!(config.speculative.enabled());
        assert_eq!(config.generation.max_tokens, 256);
        assert_eq!(config.generation.top_p, 1.0);
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: BatchrConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, BatchrConfig::default());
        assert_eq!(config.engine.n_batch, 512);
        assert_eq!(config.cache.min_tokens, 100);
        assert_eq!(config.cache_sessions(), 0);
        config.validate().unwrap();
    }

    #[test]
    fn test_max_sessions_defaults_to_slot_count() {
        let mut config = BatchrConfig::default();
        config.cache.mode = CacheMode::Incremental;
        assert_eq!(config.cache_sessions(), config.engine.n_slots);
    }

    #[test]
    fn test_validate_rejects_bad_combinations() {
        let mut config = BatchrConfig::default();
        config.engine.n_slots = 0;
        assert!(config.validate().is_err());

        let mut config = BatchrConfig::default();
        config.engine.n_batch = 4;
        config.speculative.draft_tokens = 4;
        assert!(config.validate().is_err());

        let mut config = BatchrConfig::default();
        config.cache.max_sessions = Some(config.engine.n_slots + 1);
        assert!(config.validate().is_err());
    }
}
