//! Incremental message cache
//!
//! Cache slot `i` lives in the KV sequence of execution slot `i`. Each entry
//! records which conversation prefix that sequence currently holds. A
//! request reuses the deepest matching prefix, extends it with the messages
//! added since, or claims an empty / least recently used slot and rebuilds.
//!
//! Entries are reserved by the plans that target them. A reservation blocks
//! eviction and extension by other requests until the owning job ends;
//! `pending` additionally hides an entry from matching until its KV decode
//! has landed.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tracing::{debug, info};

use super::hash_messages;
use crate::backend::{TokenId, Vocabulary};
use crate::error::EngineError;
use crate::prompt::{ChatMessage, ChatTemplate};

/// Bookkeeping for one cache slot.
#[derive(Debug, Clone)]
pub struct ImcEntry {
    pub hash: u64,
    pub msg_count: usize,
    pub tokens: Arc<Vec<TokenId>>,
    pub pending: bool,
    pub in_use: usize,
    pub last_used: Instant,
}

impl ImcEntry {
    fn empty() -> Self {
        Self {
            hash: 0,
            msg_count: 0,
            tokens: Arc::new(Vec::new()),
            pending: false,
            in_use: 0,
            last_used: Instant::now(),
        }
    }

    pub fn total_tokens(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.msg_count == 0
    }

    fn is_free(&self) -> bool {
        !self.pending && self.in_use == 0
    }

    fn reset(&mut self) {
        self.hash = 0;
        self.msg_count = 0;
        self.tokens = Arc::new(Vec::new());
    }
}

#[derive(Debug)]
struct ImcTable {
    entries: Vec<ImcEntry>,
    bound: Option<String>,
}

/// What a plan does to its cache slot when the job starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImcPlanKind {
    /// Prefix already resident; nothing to decode
    Hit,
    /// Decode `tokens[from..]` on top of the resident prefix
    Extend { from: usize, base_hash: u64 },
    /// Clear the sequence and decode all of `tokens`
    Rebuild,
}

/// Incremental cache decision for one job.
#[derive(Debug)]
pub struct ImcPlan {
    pub slot: usize,
    pub kind: ImcPlanKind,
    /// Hash and message count of the prefix once the plan is applied
    pub hash: u64,
    pub msg_count: usize,
    /// Full prefix tokens once the plan is applied
    pub tokens: Arc<Vec<TokenId>>,
    _reservation: Reservation,
}

/// Holds a cache slot for a plan; released on drop.
#[derive(Debug)]
struct Reservation {
    cache: Arc<IncrementalMessageCache>,
    slot: usize,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let mut table = self.cache.table.write();
        if let Some(entry) = table.entries.get_mut(self.slot) {
            entry.in_use = entry.in_use.saturating_sub(1);
            entry.pending = false;
        }
    }
}

enum Choice {
    Hit { hash: u64, tokens: Arc<Vec<TokenId>> },
    Extend { base_hash: u64, base: Arc<Vec<TokenId>> },
    Rebuild,
}

#[derive(Debug)]
pub struct IncrementalMessageCache {
    table: RwLock<ImcTable>,
}

impl IncrementalMessageCache {
    pub fn new(sessions: usize) -> Self {
        Self {
            table: RwLock::new(ImcTable {
                entries: (0..sessions).map(|_| ImcEntry::empty()).collect(),
                bound: None,
            }),
        }
    }

    pub fn sessions(&self) -> usize {
        self.table.read().entries.len()
    }

    /// Snapshot of one entry.
    pub fn entry(&self, slot: usize) -> Option<ImcEntry> {
        self.table.read().entries.get(slot).cloned()
    }

    /// Cache id the slots are currently bound to.
    pub fn bound(&self) -> Option<String> {
        self.table.read().bound.clone()
    }

    /// Plan how a request reuses the cache. Every message but the last is
    /// cacheable. Returns `None` when the request should run uncached.
    pub fn resolve(
        self: &Arc<Self>,
        cache_id: &str,
        messages: &[ChatMessage],
        template: &dyn ChatTemplate,
        vocab: &dyn Vocabulary,
        min_tokens: usize,
    ) -> Result<Option<ImcPlan>, EngineError> {
        let prefix = &messages[..messages.len().saturating_sub(1)];
        if prefix.is_empty() {
            return Ok(None);
        }

        let (slot, choice) = {
            let mut table = self.table.write();
            let bound = table.bound.clone();
            match bound.as_deref() {
                Some(bound) if bound == cache_id => {}
                Some(bound) => {
                    let all_empty = table.entries.iter().all(|e| e.is_empty() && e.is_free());
                    if !all_empty {
                        return Err(EngineError::CacheSessionBusy {
                            requested: cache_id.to_string(),
                            bound: bound.to_string(),
                        });
                    }
                    info!(from = bound, to = cache_id, "rebinding incremental cache");
                    table.bound = Some(cache_id.to_string());
                }
                None => table.bound = Some(cache_id.to_string()),
            }

            let best = table
                .entries
                .iter()
                .enumerate()
                .filter(|(_, e)| !e.pending && !e.is_empty() && e.msg_count <= prefix.len())
                .filter(|(_, e)| hash_messages(&prefix[..e.msg_count]) == e.hash)
                .max_by_key(|(_, e)| e.msg_count)
                .map(|(i, e)| (i, e.msg_count, e.in_use));

            let picked = match best {
                Some((slot, count, _)) if count == prefix.len() => {
                    let entry = &table.entries[slot];
                    Some((
                        slot,
                        Choice::Hit {
                            hash: entry.hash,
                            tokens: Arc::clone(&entry.tokens),
                        },
                    ))
                }
                Some((slot, _, 0)) => {
                    let entry = &table.entries[slot];
                    Some((
                        slot,
                        Choice::Extend {
                            base_hash: entry.hash,
                            base: Arc::clone(&entry.tokens),
                        },
                    ))
                }
                _ => pick_victim(&table.entries).map(|slot| (slot, Choice::Rebuild)),
            };
            let Some((slot, choice)) = picked else {
                debug!(cache_id, "no free incremental cache slot, running uncached");
                return Ok(None);
            };

            let entry = &mut table.entries[slot];
            entry.in_use += 1;
            entry.last_used = Instant::now();
            if !matches!(choice, Choice::Hit { .. }) {
                entry.pending = true;
            }
            (slot, choice)
        };

        let reservation = Reservation {
            cache: Arc::clone(self),
            slot,
        };

        let (base_hash, base) = match choice {
            Choice::Hit { hash, tokens } => {
                debug!(slot, tokens = tokens.len(), "incremental cache hit");
                return Ok(Some(ImcPlan {
                    slot,
                    kind: ImcPlanKind::Hit,
                    hash,
                    msg_count: prefix.len(),
                    tokens,
                    _reservation: reservation,
                }));
            }
            Choice::Extend { base_hash, base } => (Some(base_hash), base),
            Choice::Rebuild => (None, Arc::new(Vec::new())),
        };

        let text = template
            .render(prefix, false)
            .map_err(|e| EngineError::CacheBuild(e.to_string()))?;
        let tokens = vocab
            .tokenize(&text, true)
            .map_err(|e| EngineError::Tokenize(e.to_string()))?;
        if tokens.is_empty() {
            self.invalidate(slot);
            return Err(EngineError::CacheBuild(
                "conversation prefix tokenized to zero tokens".into(),
            ));
        }

        let kind = match base_hash {
            Some(base_hash) if tokens.len() > base.len() && tokens.starts_with(&base) => {
                ImcPlanKind::Extend {
                    from: base.len(),
                    base_hash,
                }
            }
            _ => {
                if tokens.len() < min_tokens {
                    return Ok(None);
                }
                ImcPlanKind::Rebuild
            }
        };
        debug!(slot, ?kind, tokens = tokens.len(), "incremental cache planned");

        Ok(Some(ImcPlan {
            slot,
            kind,
            hash: hash_messages(prefix),
            msg_count: prefix.len(),
            tokens: Arc::new(tokens),
            _reservation: reservation,
        }))
    }

    /// True when the entry still holds what `plan` was computed against.
    pub fn plan_is_current(&self, plan: &ImcPlan) -> bool {
        let table = self.table.read();
        let Some(entry) = table.entries.get(plan.slot) else {
            return false;
        };
        match plan.kind {
            ImcPlanKind::Hit => {
                !entry.pending && entry.hash == plan.hash && entry.tokens.len() == plan.tokens.len()
            }
            ImcPlanKind::Extend { from, base_hash } => {
                entry.hash == base_hash && entry.tokens.len() == from
            }
            ImcPlanKind::Rebuild => true,
        }
    }

    /// Record that the plan's prefix is now resident in its slot.
    pub fn commit(&self, plan: &ImcPlan) {
        let mut table = self.table.write();
        if let Some(entry) = table.entries.get_mut(plan.slot) {
            entry.hash = plan.hash;
            entry.msg_count = plan.msg_count;
            entry.tokens = Arc::clone(&plan.tokens);
            entry.pending = false;
            entry.last_used = Instant::now();
        }
    }

    /// Forget what a slot holds.
    pub fn invalidate(&self, slot: usize) {
        if let Some(entry) = self.table.write().entries.get_mut(slot) {
            entry.reset();
        }
    }

    /// Let an uncached job use execution slot `slot`. Fails while a plan
    /// holds the entry; otherwise the entry is dropped, since the job will
    /// overwrite the sequence.
    pub fn claim_for_uncached(&self, slot: usize) -> bool {
        let mut table = self.table.write();
        match table.entries.get_mut(slot) {
            None => true,
            Some(entry) if !entry.is_free() => false,
            Some(entry) => {
                entry.reset();
                true
            }
        }
    }

    /// True when the slot holds no cached conversation and no plan targets it.
    pub fn is_vacant(&self, slot: usize) -> bool {
        self.table
            .read()
            .entries
            .get(slot)
            .map_or(true, |e| e.is_empty() && e.is_free())
    }

    /// Drop every entry and the cache id binding.
    pub fn clear(&self) {
        let mut table = self.table.write();
        for entry in &mut table.entries {
            entry.reset();
        }
        table.bound = None;
    }
}

/// First empty free entry, else the least recently used free one.
fn pick_victim(entries: &[ImcEntry]) -> Option<usize> {
    let free = entries.iter().enumerate().filter(|(_, e)| e.is_free());
    let mut victim: Option<(usize, &ImcEntry)> = None;
    for (i, entry) in free {
        if entry.is_empty() {
            return Some(i);
        }
        if victim.map_or(true, |(_, v)| entry.last_used < v.last_used) {
            victim = Some((i, entry));
        }
    }
    victim.map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::scripted::ScriptedVocab;
    use crate::prompt::DefaultTemplate;

    fn turns(n: usize) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::system("you are terse")];
        for i in 0..n {
            messages.push(ChatMessage::user(format!("question {}", i)));
            messages.push(ChatMessage::assistant(format!("answer {}", i)));
        }
        messages.push(ChatMessage::user("next"));
        messages
    }

    fn resolve(cache: &Arc<IncrementalMessageCache>, id: &str, messages: &[ChatMessage]) -> Option<ImcPlan> {
        cache
            .resolve(id, messages, &DefaultTemplate, &ScriptedVocab, 1)
            .unwrap()
    }

    #[test]
    fn rebuild_then_hit_then_extend() {
        let cache = Arc::new(IncrementalMessageCache::new(2));

        let plan = resolve(&cache, "c", &turns(0)).unwrap();
        assert_eq!(plan.kind, ImcPlanKind::Rebuild);
        assert!(cache.entry(plan.slot).unwrap().pending);
        cache.commit(&plan);
        let slot = plan.slot;
        let cached = plan.tokens.len();
        drop(plan);
        assert!(cache.entry(slot).unwrap().is_free());

        let hit = resolve(&cache, "c", &turns(0)).unwrap();
        assert_eq!(hit.kind, ImcPlanKind::Hit);
        assert_eq!(hit.slot, slot);
        assert!(cache.plan_is_current(&hit));
        drop(hit);

        let extend = resolve(&cache, "c", &turns(1)).unwrap();
        assert_eq!(extend.slot, slot);
        match extend.kind {
            ImcPlanKind::Extend { from, .. } => assert_eq!(from, cached),
            other => panic!("expected extend, got {:?}", other),
        }
        assert!(cache.plan_is_current(&extend));
        assert!(extend.tokens.len() > cached);
    }

    #[test]
    fn pending_entries_are_not_matched() {
        let cache = Arc::new(IncrementalMessageCache::new(2));
        let first = resolve(&cache, "c", &turns(0)).unwrap();
        cache.commit(&first);
        let slot = first.slot;
        drop(first);

        let extend = resolve(&cache, "c", &turns(1)).unwrap();
        assert_eq!(extend.slot, slot);
        // the extended entry is pending, so the same prefix cannot hit it
        let other = resolve(&cache, "c", &turns(0)).unwrap();
        assert_ne!(other.slot, slot);
        assert_eq!(other.kind, ImcPlanKind::Rebuild);
    }

    #[test]
    fn only_one_cache_id_is_bound() {
        let cache = Arc::new(IncrementalMessageCache::new(2));
        let plan = resolve(&cache, "a", &turns(0)).unwrap();
        cache.commit(&plan);
        drop(plan);

        let err = cache
            .resolve("b", &turns(0), &DefaultTemplate, &ScriptedVocab, 1)
            .unwrap_err();
        assert!(matches!(err, EngineError::CacheSessionBusy { .. }));

        cache.clear();
        assert!(resolve(&cache, "b", &turns(0)).is_some());
        assert_eq!(cache.bound().as_deref(), Some("b"));
    }

    #[test]
    fn least_recently_used_slot_is_evicted() {
        let cache = Arc::new(IncrementalMessageCache::new(1));
        let plan = resolve(&cache, "c", &turns(0)).unwrap();
        cache.commit(&plan);
        drop(plan);

        let divergent = vec![
            ChatMessage::system("different"),
            ChatMessage::user("x"),
        ];
        let plan = resolve(&cache, "c", &divergent).unwrap();
        assert_eq!(plan.kind, ImcPlanKind::Rebuild);
        assert_eq!(plan.slot, 0);
    }

    #[test]
    fn reserved_slots_block_uncached_jobs() {
        let cache = Arc::new(IncrementalMessageCache::new(1));
        let plan = resolve(&cache, "c", &turns(0)).unwrap();
        assert!(!cache.claim_for_uncached(0));
        cache.commit(&plan);
        drop(plan);
        assert!(!cache.is_vacant(0));
        assert!(cache.claim_for_uncached(0));
        assert!(cache.is_vacant(0));
    }

    #[test]
    fn single_message_requests_are_not_cached() {
        let cache = Arc::new(IncrementalMessageCache::new(1));
        assert!(resolve(&cache, "c", &[ChatMessage::user("hi")]).is_none());
        assert!(cache.bound().is_none());
    }
}
