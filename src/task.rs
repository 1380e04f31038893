use std::{
    fmt,
    future::Future,
    panic::{catch_unwind, AssertUnwindSafe},
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::Duration,
};

use atomic_waker::AtomicWaker;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::error::TaskError;

/// A handle to the eventual result of a closure submitted to a thread pool.
///
/// Tasks implement [`Future`], so you can `.await` their completion
/// asynchronously. Or, you can wait for their completion synchronously using
/// the various methods provided.
///
/// Dropping a task does not cancel it. The closure still runs, and its result
/// is discarded.
pub struct Task<T> {
    receiver: Receiver<Result<T, TaskError>>,
    signal: Arc<Signal>,
}

/// Completion state shared between a task and its completer.
struct Signal {
    waker: AtomicWaker,

    /// Set once the completer is gone, whether or not it delivered a result.
    finished: AtomicBool,
}

impl<T> Task<T> {
    /// Create a task handle together with the completer that will deliver
    /// its result.
    pub(crate) fn new() -> (Self, TaskCompleter<T>) {
        let (tx, rx) = bounded(1);
        let signal = Arc::new(Signal {
            waker: AtomicWaker::new(),
            finished: AtomicBool::new(false),
        });

        let task = Task {
            receiver: rx,
            signal: signal.clone(),
        };

        let completer = TaskCompleter { sender: tx, signal };

        (task, completer)
    }

    /// Check if the task has finished running, without blocking.
    ///
    /// Once this returns true, reading the task never blocks. It stays true
    /// after the result has been taken with [`try_get`](Task::try_get), and
    /// is also true for a task that was abandoned without running.
    pub fn is_done(&self) -> bool {
        self.signal.finished.load(Ordering::Acquire)
    }

    /// Take the task's result if it is available, without blocking.
    ///
    /// Returns `None` while the task is still queued or running. The result
    /// can only be taken once; later calls report [`TaskError::Abandoned`].
    pub fn try_get(&mut self) -> Option<Result<T, TaskError>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(TaskError::Abandoned)),
        }
    }

    /// Block the current thread until the task completes and return its
    /// result.
    ///
    /// If the closure panicked, the panic is returned as
    /// [`TaskError::Panicked`].
    ///
    /// # Examples
    ///
    /// ```
    /// let pool = workpool::ThreadPool::new(1).unwrap();
    /// let task = pool.execute(|| "hello".len()).unwrap();
    ///
    /// assert_eq!(task.get().unwrap(), 5);
    /// ```
    pub fn get(self) -> Result<T, TaskError> {
        self.receiver.recv().unwrap_or(Err(TaskError::Abandoned))
    }

    /// Block the current thread until the task completes and return its value.
    ///
    /// # Panics
    ///
    /// If the closure the task was created from panics, the panic will
    /// propagate to this call.
    pub fn join(self) -> T {
        match self.get() {
            Ok(value) => value,
            Err(e) => e.resume(),
        }
    }

    /// Block the current thread until the task completes or a timeout is
    /// reached.
    ///
    /// On timeout the task is handed back so it can be waited on again. The
    /// closure keeps running either way.
    pub fn get_timeout(self, timeout: Duration) -> Result<Result<T, TaskError>, Self> {
        match self.receiver.recv_timeout(timeout) {
            Ok(result) => Ok(result),
            Err(RecvTimeoutError::Timeout) => Err(self),
            Err(RecvTimeoutError::Disconnected) => Ok(Err(TaskError::Abandoned)),
        }
    }
}

impl<T> Future for Task<T> {
    type Output = Result<T, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.signal.waker.register(cx.waker());

        // Read the flag before the channel. The completer sends before it
        // marks itself finished, so finished and empty means no result.
        let finished = self.is_done();

        match self.receiver.try_recv() {
            Ok(result) => Poll::Ready(result),
            Err(TryRecvError::Empty) if finished => Poll::Ready(Err(TaskError::Abandoned)),
            Err(TryRecvError::Empty) => Poll::Pending,
            Err(TryRecvError::Disconnected) => Poll::Ready(Err(TaskError::Abandoned)),
        }
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("done", &self.is_done())
            .finish()
    }
}

/// The producing end of a [`Task`], owned by whichever worker runs the job.
pub(crate) struct TaskCompleter<T> {
    sender: Sender<Result<T, TaskError>>,
    signal: Arc<Signal>,
}

impl<T: Send + 'static> TaskCompleter<T> {
    /// Bind a closure to this completer, producing a job that runs the
    /// closure and delivers its outcome.
    pub(crate) fn into_job<F>(self, closure: F) -> Job
    where
        F: FnOnce() -> T + Send + 'static,
    {
        Job(Box::new(move || self.complete(closure)))
    }

    /// Run the closure and deliver its outcome. Returns true if the closure
    /// panicked.
    fn complete(self, f: impl FnOnce() -> T) -> bool {
        let result = catch_unwind(AssertUnwindSafe(f)).map_err(TaskError::Panicked);
        let panicked = result.is_err();

        // The reader may have dropped its handle; the outcome is then discarded.
        if self.sender.send(result).is_err() {
            log::trace!("task handle dropped before completion, discarding result");
        }

        panicked
    }
}

impl<T> Drop for TaskCompleter<T> {
    fn drop(&mut self) {
        self.signal.finished.store(true, Ordering::Release);
        self.signal.waker.wake();
    }
}

/// A type-erased unit of work waiting in the pool queue.
pub(crate) struct Job(Box<dyn FnOnce() -> bool + Send>);

impl Job {
    /// Run the job to completion. Returns true if it panicked.
    pub(crate) fn run(self) -> bool {
        (self.0)()
    }
}
