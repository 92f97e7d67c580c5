//! Batch engine lifecycle
//!
//! Wraps the [`Scheduler`] in a dedicated thread and exposes the thread-safe
//! surface request tasks talk to: `submit`, `stop` and the shared caches.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::job::Job;
use super::queue::JobQueue;
use super::scheduler::Scheduler;
use crate::backend::Model;
use crate::cache::{IncrementalMessageCache, SystemPromptCache};
use crate::config::{BatchrConfig, CacheMode};
use crate::error::EngineError;

/// Continuous-batching engine over one loaded model.
pub struct BatchEngine {
    config: BatchrConfig,
    model: Model,
    queue: Arc<JobQueue>,
    spc: SystemPromptCache,
    imc: Option<Arc<IncrementalMessageCache>>,
    /// Scheduler waiting for `start`
    scheduler: Mutex<Option<Scheduler>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl BatchEngine {
    pub fn new(config: BatchrConfig, model: Model) -> Result<Self> {
        config.validate()?;
        if config.speculative.enabled() && !model.context.has_draft() {
            warn!(
                draft_tokens = config.speculative.draft_tokens,
                "speculative decoding configured without a draft model, disabled"
            );
        }

        let queue = Arc::new(JobQueue::new(config.engine.queue_depth));
        let imc = (config.cache.mode == CacheMode::Incremental)
            .then(|| Arc::new(IncrementalMessageCache::new(config.cache_sessions())));
        let scheduler = Scheduler::new(&config, model.clone(), Arc::clone(&queue), imc.clone());

        Ok(Self {
            config,
            model,
            queue,
            spc: SystemPromptCache::new(),
            imc,
            scheduler: Mutex::new(Some(scheduler)),
            handle: Mutex::new(None),
            stopped: AtomicBool::new(false),
        })
    }

    /// Spawn the scheduling thread. Fails when called twice.
    pub fn start(&self) -> Result<()> {
        let mut scheduler = self
            .scheduler
            .lock()
            .take()
            .ok_or_else(|| anyhow!("batch engine already started"))?;
        let queue = Arc::clone(&self.queue);
        let active_wake = Duration::from_micros(self.config.engine.active_wake_us);
        let idle_wake = Duration::from_millis(self.config.engine.idle_wake_ms);
        let n_slots = self.config.engine.n_slots;

        let handle = std::thread::Builder::new()
            .name("batchr-scheduler".into())
            .spawn(move || {
                info!(slots = n_slots, "scheduler started");
                while !queue.is_closed() {
                    scheduler.iterate();
                    let wake = if scheduler.has_work() {
                        active_wake
                    } else {
                        idle_wake
                    };
                    queue.wait(wake);
                }
                scheduler.shutdown();
                info!("scheduler stopped");
            })?;
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    /// Hand a job to the scheduler. Fails fast when the job was already
    /// withdrawn, the queue is full, or the engine is stopping.
    pub fn submit(&self, job: Job) -> Result<(), EngineError> {
        job.ctx.check()?;
        if self.stopped.load(Ordering::SeqCst) {
            return Err(EngineError::ShuttingDown);
        }
        self.queue.push(job).map_err(|(job, err)| {
            debug!(job = job.id(), error = %err, "job rejected at admission");
            err
        })
    }

    /// Stop the scheduler, fail everything still in flight and drop all
    /// cached prefixes. Safe to call more than once.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        for job in self.queue.close() {
            job.fail(EngineError::ShuttingDown);
        }
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                warn!("scheduler thread panicked");
            }
        } else if let Some(mut scheduler) = self.scheduler.lock().take() {
            scheduler.shutdown();
        }
        self.spc.clear();
        if let Some(imc) = &self.imc {
            imc.clear();
        }
        info!("batch engine stopped");
    }

    pub fn config(&self) -> &BatchrConfig {
        &self.config
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn system_prompt_cache(&self) -> &SystemPromptCache {
        &self.spc
    }

    pub fn incremental_cache(&self) -> Option<&Arc<IncrementalMessageCache>> {
        self.imc.as_ref()
    }

    /// Jobs waiting for a slot.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl Drop for BatchEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::scripted::ScriptedModel;
    use crate::backend::ModelContext;

    fn engine(config: BatchrConfig) -> BatchEngine {
        let scripted = ScriptedModel::new("ok");
        let (ctx, _) = scripted.context(1024);
        let model = Model::new(scripted.vocab(), ModelContext::new(ctx));
        BatchEngine::new(config, model).unwrap()
    }

    #[test]
    fn start_twice_fails() {
        let engine = engine(BatchrConfig::default());
        engine.start().unwrap();
        assert!(engine.start().is_err());
        engine.stop();
        assert!(engine.is_stopped());
    }

    #[test]
    fn stop_is_idempotent_without_start() {
        let engine = engine(BatchrConfig::default());
        engine.stop();
        engine.stop();
        assert_eq!(engine.queued(), 0);
    }

    #[test]
    fn incremental_mode_allocates_sessions() {
        let mut config = BatchrConfig::default();
        config.cache.mode = CacheMode::Incremental;
        let engine = engine(config);
        let imc = engine.incremental_cache().unwrap();
        assert_eq!(imc.sessions(), engine.config().engine.n_slots);
    }
}
