//! System prompt cache

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::hash_text;
use crate::backend::{TokenId, Vocabulary};
use crate::error::EngineError;
use crate::prompt::{ChatMessage, ChatTemplate};

#[derive(Debug, Clone)]
struct SpcEntry {
    hash: u64,
    len: usize,
    tokens: Arc<Vec<TokenId>>,
}

/// Cached system prompt for one job.
#[derive(Debug, Clone)]
pub struct SpcHit {
    pub tokens: Arc<Vec<TokenId>>,
    /// Leading messages covered by the cached tokens (0 or 1)
    pub covered: usize,
}

/// RAM-resident system prompt tokens keyed by cache id.
#[derive(Debug, Default)]
pub struct SystemPromptCache {
    entries: RwLock<HashMap<String, SpcEntry>>,
}

impl SystemPromptCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up or build the cached system prompt of `cache_id`.
    ///
    /// Returns `None` when the request gains nothing from the cache.
    pub fn resolve(
        &self,
        cache_id: &str,
        messages: &[ChatMessage],
        template: &dyn ChatTemplate,
        vocab: &dyn Vocabulary,
        min_tokens: usize,
    ) -> Result<Option<SpcHit>, EngineError> {
        let system = match messages.first() {
            Some(first) if first.is_system() => first,
            _ => {
                // A later turn may drop the system message; the session's
                // cached prompt still applies.
                return Ok(self.entries.read().get(cache_id).map(|entry| SpcHit {
                    tokens: Arc::clone(&entry.tokens),
                    covered: 0,
                }));
            }
        };

        let hash = hash_text(&system.content);
        let len = system.content.len();
        if let Some(entry) = self.entries.read().get(cache_id) {
            if entry.len == len && entry.hash == hash {
                debug!(cache_id, tokens = entry.tokens.len(), "system prompt cache hit");
                return Ok(Some(SpcHit {
                    tokens: Arc::clone(&entry.tokens),
                    covered: 1,
                }));
            }
        }

        let text = template
            .render(std::slice::from_ref(system), false)
            .map_err(|e| EngineError::CacheBuild(e.to_string()))?;
        let tokens = vocab
            .tokenize(&text, true)
            .map_err(|e| EngineError::Tokenize(e.to_string()))?;
        if tokens.is_empty() {
            self.entries.write().remove(cache_id);
            return Err(EngineError::CacheBuild(
                "system prompt tokenized to zero tokens".into(),
            ));
        }
        if tokens.len() < min_tokens {
            return Ok(None);
        }

        let tokens = Arc::new(tokens);
        debug!(cache_id, tokens = tokens.len(), "system prompt cached");
        self.entries.write().insert(
            cache_id.to_string(),
            SpcEntry {
                hash,
                len,
                tokens: Arc::clone(&tokens),
            },
        );
        Ok(Some(SpcHit { tokens, covered: 1 }))
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::scripted::ScriptedVocab;
    use crate::prompt::DefaultTemplate;

    fn conversation(system: &str, user: &str) -> Vec<ChatMessage> {
        vec![ChatMessage::system(system), ChatMessage::user(user)]
    }

    #[test]
    fn identical_system_prompts_share_tokens() {
        let cache = SystemPromptCache::new();
        let first = cache
            .resolve("s", &conversation("rules", "a"), &DefaultTemplate, &ScriptedVocab, 1)
            .unwrap()
            .unwrap();
        let second = cache
            .resolve("s", &conversation("rules", "b"), &DefaultTemplate, &ScriptedVocab, 1)
            .unwrap()
            .unwrap();
        assert!(Arc::ptr_eq(&first.tokens, &second.tokens));
        assert_eq!(second.covered, 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn changed_content_overwrites_entry() {
        let cache = SystemPromptCache::new();
        let old = cache
            .resolve("s", &conversation("v1", "a"), &DefaultTemplate, &ScriptedVocab, 1)
            .unwrap()
            .unwrap();
        let new = cache
            .resolve("s", &conversation("v2!", "a"), &DefaultTemplate, &ScriptedVocab, 1)
            .unwrap()
            .unwrap();
        assert!(!Arc::ptr_eq(&old.tokens, &new.tokens));
        assert_eq!(new.tokens.len(), old.tokens.len() + 1);
    }

    #[test]
    fn omitted_system_message_still_hits() {
        let cache = SystemPromptCache::new();
        let built = cache
            .resolve("s", &conversation("rules", "a"), &DefaultTemplate, &ScriptedVocab, 1)
            .unwrap()
            .unwrap();
        let hit = cache
            .resolve("s", &[ChatMessage::user("b")], &DefaultTemplate, &ScriptedVocab, 1)
            .unwrap()
            .unwrap();
        assert_eq!(hit.covered, 0);
        assert_eq!(hit.tokens.len(), built.tokens.len());

        let miss = cache
            .resolve("other", &[ChatMessage::user("b")], &DefaultTemplate, &ScriptedVocab, 1)
            .unwrap();
        assert!(miss.is_none());
    }

    #[test]
    fn short_prompts_are_not_cached() {
        let cache = SystemPromptCache::new();
        let result = cache
            .resolve("s", &conversation("x", "a"), &DefaultTemplate, &ScriptedVocab, 1000)
            .unwrap();
        assert!(result.is_none());
        assert!(cache.is_empty());
    }
}
