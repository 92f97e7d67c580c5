//! Decode-lock capability object

use parking_lot::{Mutex, MutexGuard};

use super::InferenceContext;

/// The native contexts guarded by the decode lock.
pub struct Contexts {
    /// Target model context; hosts every slot sequence.
    pub target: Box<dyn InferenceContext>,
    /// Draft model context for speculative decoding.
    pub draft: Option<Box<dyn InferenceContext>>,
}

/// Single owner of KV memory.
///
/// Every decode and KV mutation, from the scheduling loop or from cache
/// maintenance, goes through [`ModelContext::lock`]. Concurrent native decode
/// calls on one context are unsafe, so there is no other access path.
pub struct ModelContext {
    inner: Mutex<Contexts>,
    has_draft: bool,
}

impl ModelContext {
    pub fn new<C: InferenceContext + 'static>(target: C) -> Self {
        Self {
            inner: Mutex::new(Contexts {
                target: Box::new(target),
                draft: None,
            }),
            has_draft: false,
        }
    }

    /// Attach a draft model context for speculative decoding.
    pub fn with_draft<C: InferenceContext + 'static>(self, draft: C) -> Self {
        let mut contexts = self.inner.into_inner();
        contexts.draft = Some(Box::new(draft));
        Self {
            inner: Mutex::new(contexts),
            has_draft: true,
        }
    }

    pub fn has_draft(&self) -> bool {
        self.has_draft
    }

    /// Acquire the decode lock.
    pub fn lock(&self) -> MutexGuard<'_, Contexts> {
        self.inner.lock()
    }
}
