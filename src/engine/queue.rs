//! Bounded admission queue shared by submitters and the scheduling loop

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::job::Job;
use crate::error::EngineError;

struct QueueState {
    jobs: VecDeque<Job>,
    closed: bool,
}

pub struct JobQueue {
    state: Mutex<QueueState>,
    signal: Condvar,
    depth: usize,
}

impl JobQueue {
    pub fn new(depth: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                jobs: VecDeque::with_capacity(depth),
                closed: false,
            }),
            signal: Condvar::new(),
            depth,
        }
    }

    /// Enqueue without waiting. A rejected job is handed back with the reason.
    pub fn push(&self, job: Job) -> Result<(), (Box<Job>, EngineError)> {
        let mut state = self.state.lock();
        if state.closed {
            return Err((Box::new(job), EngineError::ShuttingDown));
        }
        if state.jobs.len() >= self.depth {
            return Err((Box::new(job), EngineError::QueueFull { depth: self.depth }));
        }
        state.jobs.push_back(job);
        drop(state);
        self.signal.notify_one();
        Ok(())
    }

    /// Return a popped job to the back of the queue. Ignores the depth
    /// limit, since the job was already admitted once.
    pub fn requeue(&self, job: Job) -> Result<(), Box<Job>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Box::new(job));
        }
        state.jobs.push_back(job);
        Ok(())
    }

    pub fn pop(&self) -> Option<Job> {
        self.state.lock().jobs.pop_front()
    }

    pub fn len(&self) -> usize {
        self.state.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().jobs.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Sleep until a job arrives, the queue closes, or `timeout` passes.
    pub fn wait(&self, timeout: Duration) {
        let mut state = self.state.lock();
        if state.jobs.is_empty() && !state.closed {
            self.signal.wait_for(&mut state, timeout);
        }
    }

    /// Refuse further jobs and hand back the ones still waiting.
    pub fn close(&self) -> Vec<Job> {
        let mut state = self.state.lock();
        state.closed = true;
        let drained = state.jobs.drain(..).collect();
        drop(state);
        self.signal.notify_all();
        drained
    }
}
