//! The shared work queue between pool handles and worker threads.

use std::{
    collections::VecDeque,
    sync::{Condvar, Mutex, MutexGuard},
};

use crate::task::Job;

/// An unbounded FIFO of pending jobs plus the pool's running/stopping flag,
/// guarded by a single mutex.
///
/// Producers only ever [`push`](Queue::push) and consumers only ever
/// [`pop`](Queue::pop); the underlying container is never handed out.
pub(crate) struct Queue {
    state: Mutex<State>,
    available: Condvar,
    watermark: usize,
}

struct State {
    jobs: VecDeque<Job>,
    stopping: bool,

    /// Set once the depth reaches the watermark, cleared when it falls back
    /// below it. Makes the backpressure signal fire once per crossing.
    above_watermark: bool,
}

/// What happened when a job was accepted into the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Pushed {
    /// Queue depth right after the push, including the new job.
    pub(crate) depth: usize,

    /// Whether this push moved the depth up across the watermark.
    pub(crate) crossed_watermark: bool,
}

impl Queue {
    pub(crate) fn new(watermark: usize) -> Self {
        Self {
            state: Mutex::new(State {
                jobs: VecDeque::new(),
                stopping: false,
                above_watermark: false,
            }),
            available: Condvar::new(),
            watermark,
        }
    }

    /// Append a job to the tail of the queue and wake one waiting worker.
    ///
    /// The job is only built from `input` once the queue is known to be
    /// accepting work. If the pool is stopping, `input` is handed back
    /// untouched.
    pub(crate) fn push<I>(&self, input: I, into_job: impl FnOnce(I) -> Job) -> Result<Pushed, I> {
        let pushed = {
            let mut state = self.lock();

            if state.stopping {
                return Err(input);
            }

            state.jobs.push_back(into_job(input));

            let depth = state.jobs.len();
            let crossed_watermark = depth >= self.watermark && !state.above_watermark;

            if crossed_watermark {
                state.above_watermark = true;
            }

            Pushed {
                depth,
                crossed_watermark,
            }
        };

        self.available.notify_one();

        Ok(pushed)
    }

    /// Take the job at the head of the queue, blocking while the queue is
    /// empty and the pool is running.
    ///
    /// Returns `None` once the pool is stopping and no jobs remain.
    pub(crate) fn pop(&self) -> Option<Job> {
        let mut state = self.lock();

        loop {
            if let Some(job) = state.jobs.pop_front() {
                if state.jobs.len() < self.watermark {
                    state.above_watermark = false;
                }

                return Some(job);
            }

            if state.stopping {
                return None;
            }

            state = self
                .available
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Stop accepting jobs and wake every worker so it can drain the queue
    /// and exit.
    ///
    /// Returns true if this call moved the queue from running to stopping.
    pub(crate) fn close(&self) -> bool {
        let newly_closed = {
            let mut state = self.lock();
            !std::mem::replace(&mut state.stopping, true)
        };

        self.available.notify_all();

        newly_closed
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().stopping
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // Jobs never run while the lock is held, so a poisoned lock still
        // guards consistent state.
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
