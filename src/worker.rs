use std::sync::Arc;

use crate::queue::Queue;

/// A type which receives notifications from a worker.
///
/// The listener is dropped when the worker loop ends, which is how the pool
/// learns that a worker has exited.
pub(crate) trait Listener {
    fn on_task_started(&mut self) {}

    fn on_task_completed(&mut self, _panicked: bool) {}
}

/// A worker thread which belongs to a thread pool and executes tasks.
pub(crate) struct Worker<L: Listener> {
    /// Queue of tasks to run, shared with the pool and every other worker.
    queue: Arc<Queue>,

    /// Receiver of various worker events.
    listener: L,
}

impl<L: Listener> Worker<L> {
    pub(crate) fn new(queue: Arc<Queue>, listener: L) -> Self {
        Self { queue, listener }
    }

    /// Run tasks until the pool is stopping and the queue is drained.
    pub(crate) fn run(mut self) {
        log::trace!("worker started");

        // The queue lock is released by the time a job is returned, so the
        // job itself runs unlocked.
        while let Some(job) = self.queue.pop() {
            self.listener.on_task_started();
            let panicked = job.run();
            self.listener.on_task_completed(panicked);
        }

        log::trace!("worker stopped, queue drained");
    }
}
