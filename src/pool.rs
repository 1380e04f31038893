//! Implementation of the thread pool itself.

use std::{
    cell::Cell,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
        Condvar,
        Mutex,
        MutexGuard,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use once_cell::sync::Lazy;

use crate::{
    error::{BuildError, PoolClosedError},
    queue::Queue,
    task::Task,
    worker::{Listener, Worker},
};

#[cfg(target_has_atomic = "64")]
type AtomicCounter = std::sync::atomic::AtomicU64;

#[cfg(not(target_has_atomic = "64"))]
type AtomicCounter = std::sync::atomic::AtomicU32;

/// Queue depth at which a pool reports backpressure unless configured
/// otherwise with [`Builder::queue_watermark`].
pub const DEFAULT_QUEUE_WATERMARK: usize = 10;

static CORE_COUNT: Lazy<usize> = Lazy::new(|| num_cpus::get().max(1));

thread_local! {
    /// Identity of the pool owning the current thread, if it is a worker.
    static CURRENT_POOL: Cell<usize> = Cell::new(0);
}

type BackpressureHook = Arc<dyn Fn(usize) + Send + Sync>;

/// A builder for constructing a customized [`ThreadPool`].
///
/// # Examples
///
/// ```
/// let custom_pool = workpool::builder()
///     .name("my-pool")
///     .size(2)
///     .build()
///     .unwrap();
/// ```
pub struct Builder {
    name: Option<String>,
    size: Option<usize>,
    stack_size: Option<usize>,
    queue_watermark: usize,
    on_backpressure: Option<BackpressureHook>,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            name: None,
            size: None,
            stack_size: None,
            queue_watermark: DEFAULT_QUEUE_WATERMARK,
            on_backpressure: None,
        }
    }
}

impl Builder {
    /// Set a custom thread name for threads spawned by this thread pool.
    ///
    /// The name must not contain null bytes (`\0`), otherwise
    /// [`build`](Builder::build) fails.
    ///
    /// # Examples
    ///
    /// ```
    /// let pool = workpool::builder().name("my-pool").build().unwrap();
    /// ```
    pub fn name<T: Into<String>>(mut self, name: T) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the number of worker threads in this thread pool.
    ///
    /// The pool always runs exactly this many workers, all started when the
    /// pool is built. Zero is rejected by [`build`](Builder::build).
    ///
    /// If not set, one worker per CPU core is started.
    pub fn size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    /// Set the size of the stack (in bytes) for threads in this thread pool.
    ///
    /// The actual stack size may be greater than this value if the platform
    /// enforces a larger minimum stack size.
    ///
    /// # Examples
    ///
    /// ```
    /// // Worker threads will have a stack size of at least 32 KiB.
    /// let pool = workpool::builder().stack_size(32 * 1024).build().unwrap();
    /// ```
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    /// Set the queue depth at which backpressure is reported.
    ///
    /// When a submission brings the number of queued tasks up to this value
    /// or beyond, a warning is logged and the
    /// [`on_backpressure`](Builder::on_backpressure) hook is called. This
    /// happens once per crossing: the signal is re-armed only after the queue
    /// drains back below the watermark. Submissions are never blocked or
    /// rejected because of queue depth.
    ///
    /// Defaults to [`DEFAULT_QUEUE_WATERMARK`]. Zero is rejected by
    /// [`build`](Builder::build).
    pub fn queue_watermark(mut self, depth: usize) -> Self {
        self.queue_watermark = depth;
        self
    }

    /// Set a hook to be called whenever the queue crosses the watermark.
    ///
    /// The hook receives the queue depth at the time of the crossing and runs
    /// on the submitting thread, so it should return quickly. A panic in the
    /// hook is caught and logged; the submission it interrupted still
    /// succeeds.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::{atomic::{AtomicUsize, Ordering}, Arc};
    ///
    /// let crossings = Arc::new(AtomicUsize::new(0));
    /// let pool = workpool::builder()
    ///     .size(1)
    ///     .on_backpressure({
    ///         let crossings = crossings.clone();
    ///         move |_depth| {
    ///             crossings.fetch_add(1, Ordering::SeqCst);
    ///         }
    ///     })
    ///     .build()
    ///     .unwrap();
    /// # pool.join();
    /// ```
    pub fn on_backpressure<F>(mut self, hook: F) -> Self
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.on_backpressure = Some(Arc::new(hook));
        self
    }

    /// Create a thread pool according to the configuration set with this
    /// builder.
    ///
    /// All worker threads are started before this returns.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::InvalidConfiguration`] without starting any
    /// threads if the size or watermark is zero or the name contains null
    /// bytes. Returns [`BuildError::Spawn`] if a worker thread could not be
    /// created, after stopping the workers started so far.
    pub fn build(self) -> Result<ThreadPool, BuildError> {
        let size = self.size.unwrap_or(*CORE_COUNT);

        if size == 0 {
            return Err(BuildError::InvalidConfiguration(
                "thread pool size must be non-zero",
            ));
        }

        if self.queue_watermark == 0 {
            return Err(BuildError::InvalidConfiguration(
                "queue watermark must be non-zero",
            ));
        }

        if let Some(name) = self.name.as_ref() {
            if name.as_bytes().contains(&0) {
                return Err(BuildError::InvalidConfiguration(
                    "thread pool name must not contain null bytes",
                ));
            }
        }

        let shared = Shared {
            queue: Arc::new(Queue::new(self.queue_watermark)),
            watermark: self.queue_watermark,
            on_backpressure: self.on_backpressure.clone(),
            thread_count: Default::default(),
            workers: Default::default(),
            running_tasks_count: Default::default(),
            completed_tasks_count: Default::default(),
            panicked_tasks_count: Default::default(),
            shutdown_cvar: Condvar::new(),
        };

        let pool = ThreadPool {
            shared: Arc::new(shared),
        };

        // On failure the pool is dropped here, which stops and waits for any
        // workers that did start.
        for _ in 0..size {
            pool.spawn_thread(&self).map_err(BuildError::Spawn)?;
        }

        log::debug!(
            "started thread pool with {} workers, queue watermark {}",
            size,
            self.queue_watermark
        );

        Ok(pool)
    }
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("stack_size", &self.stack_size)
            .field("queue_watermark", &self.queue_watermark)
            .field("on_backpressure", &self.on_backpressure.is_some())
            .finish()
    }
}

/// A fixed-size pool of worker threads that run submitted closures and hand
/// back their results.
///
/// Handing blocking or CPU-heavy work to a pool keeps the submitting threads
/// responsive, and the fixed worker count bounds how much of that work runs
/// at once.
///
/// # Queueing
///
/// Submitted closures are placed in a single unbounded FIFO queue. Workers
/// always take the oldest queued closure first, but with more than one worker
/// closures can finish in any order.
///
/// The queue never blocks or rejects a submission because of its depth. When
/// it grows past the configured [watermark](Builder::queue_watermark) the
/// pool reports backpressure through the [`log`] facade and an optional hook.
///
/// # Shutdown
///
/// Shutting a pool down with [`shutdown`](ThreadPool::shutdown),
/// [`join`](ThreadPool::join) or by dropping it stops new submissions, runs
/// every closure that was already queued, and then blocks until all worker
/// threads have exited.
///
/// # Monitoring
///
/// Each pool instance provides methods for gathering various statistics on the
/// pool's usage, such as number of current number of threads, tasks completed
/// over time, and queued tasks. While these methods provide the most up-to-date
/// numbers upon invocation, they should not be used for controlling program
/// behavior since they can become immediately outdated due to the live nature
/// of the pool.
pub struct ThreadPool {
    shared: Arc<Shared>,
}

impl ThreadPool {
    /// Create a new thread pool with a fixed number of worker threads.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::InvalidConfiguration`] if `size` is zero.
    ///
    /// # Examples
    ///
    /// ```
    /// let pool = workpool::ThreadPool::new(4).unwrap();
    /// assert_eq!(pool.threads(), 4);
    ///
    /// assert!(workpool::ThreadPool::new(0).is_err());
    /// ```
    #[inline]
    pub fn new(size: usize) -> Result<Self, BuildError> {
        Self::builder().size(size).build()
    }

    /// Get a builder for creating a customized thread pool.
    #[inline]
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Get the number of threads currently running in the thread pool.
    ///
    /// This equals the configured size until the pool is shut down.
    pub fn threads(&self) -> usize {
        *self.shared.thread_count()
    }

    /// Get the number of tasks queued for execution, but not yet started.
    ///
    /// Note that the number returned may become immediately outdated after
    /// invocation.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::mpsc;
    ///
    /// // Create a pool with just one thread.
    /// let pool = workpool::ThreadPool::new(1).unwrap();
    ///
    /// // Nothing is queued yet.
    /// assert_eq!(pool.queued_tasks(), 0);
    ///
    /// // Occupy the only thread until we say otherwise.
    /// let (started_tx, started_rx) = mpsc::channel();
    /// let (release_tx, release_rx) = mpsc::channel::<()>();
    /// pool.execute(move || {
    ///     started_tx.send(()).unwrap();
    ///     release_rx.recv().unwrap();
    /// }).unwrap();
    /// started_rx.recv().unwrap();
    ///
    /// // Enqueue some more tasks.
    /// let count = 4;
    /// for _ in 0..count {
    ///     pool.execute(|| {
    ///         // work to do
    ///     }).unwrap();
    /// }
    ///
    /// // The tasks are still in the queue because the first task is
    /// // occupying the only thread.
    /// assert_eq!(pool.queued_tasks(), count);
    ///
    /// release_tx.send(()).unwrap();
    /// pool.join();
    /// ```
    #[inline]
    pub fn queued_tasks(&self) -> usize {
        self.shared.queue.len()
    }

    /// Get the number of tasks currently running.
    ///
    /// Note that the number returned may become immediately outdated after
    /// invocation.
    #[inline]
    pub fn running_tasks(&self) -> usize {
        self.shared.running_tasks_count.load(Ordering::Relaxed)
    }

    /// Get the number of tasks completed (successfully or otherwise) by this
    /// pool since it was created.
    ///
    /// Note that the number returned may become immediately outdated after
    /// invocation.
    #[inline]
    #[allow(clippy::useless_conversion)]
    pub fn completed_tasks(&self) -> u64 {
        self.shared.completed_tasks_count.load(Ordering::Relaxed).into()
    }

    /// Get the number of tasks that have panicked since the pool was created.
    ///
    /// Note that the number returned may become immediately outdated after
    /// invocation.
    #[inline]
    #[allow(clippy::useless_conversion)]
    pub fn panicked_tasks(&self) -> u64 {
        self.shared.panicked_tasks_count.load(Ordering::Relaxed).into()
    }

    /// Check whether the pool has been shut down and no longer accepts tasks.
    pub fn is_closed(&self) -> bool {
        self.shared.queue.is_closed()
    }

    /// Submit a closure to be executed by the thread pool.
    ///
    /// The closure is appended to the queue and one idle worker is woken to
    /// run it. This never blocks beyond the moment needed to enqueue.
    ///
    /// # Errors
    ///
    /// If the pool has been shut down, the closure is not queued and is
    /// returned inside a [`PoolClosedError`].
    ///
    /// # Examples
    ///
    /// ```
    /// let pool = workpool::ThreadPool::new(2).unwrap();
    /// let task = pool.execute(|| {
    ///     2 + 2 // some expensive computation
    /// }).unwrap();
    ///
    /// // do something in the meantime
    ///
    /// // now wait for the result
    /// let sum = task.get().unwrap();
    /// assert_eq!(sum, 4);
    /// ```
    ///
    /// A closed pool hands the closure back, so it can still be run somewhere
    /// else:
    ///
    /// ```
    /// let pool = workpool::ThreadPool::new(1).unwrap();
    /// pool.shutdown();
    ///
    /// let result = pool.execute(|| 2 + 2)
    ///     .map(|task| task.join())
    ///     .unwrap_or_else(|error| error.into_inner()());
    ///
    /// assert_eq!(result, 4);
    /// ```
    pub fn execute<T, F>(&self, closure: F) -> Result<Task<T>, PoolClosedError<F>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (task, completer) = Task::new();

        let pushed = self
            .shared
            .queue
            .push(closure, move |closure| completer.into_job(closure))
            .map_err(PoolClosedError)?;

        if pushed.crossed_watermark {
            self.shared.report_backpressure(pushed.depth);
        }

        Ok(task)
    }

    /// Shut down this thread pool and block until all queued tasks have
    /// completed and threads have stopped.
    ///
    /// Further calls to [`execute`](ThreadPool::execute) fail. Every worker
    /// thread is joined before this returns. Calling this more than once is
    /// harmless; every call waits for the workers to exit.
    ///
    /// When called from one of this pool's own worker threads, the pool is
    /// closed but the call does not wait, since the worker would be waiting
    /// on itself.
    pub fn shutdown(&self) {
        self.join_internal(None);
    }

    /// Shut down this thread pool and block until all queued tasks have
    /// completed and threads have stopped.
    pub fn join(self) {
        self.join_internal(None);
    }

    /// Shut down this thread pool and block until all queued tasks have
    /// completed and threads have stopped, or until the given timeout passes.
    ///
    /// Returns `true` if the thread pool shut down fully before the timeout.
    /// Worker threads are only joined by the untimed shutdown paths, which
    /// includes dropping the pool.
    pub fn join_timeout(&self, timeout: Duration) -> bool {
        self.join_deadline(Instant::now() + timeout)
    }

    /// Shut down this thread pool and block until all queued tasks have
    /// completed and threads have stopped, or the given deadline passes.
    ///
    /// Returns `true` if the thread pool shut down fully before the deadline.
    pub fn join_deadline(&self, deadline: Instant) -> bool {
        self.join_internal(Some(deadline))
    }

    fn join_internal(&self, deadline: Option<Instant>) -> bool {
        // Closing the queue wakes every idle worker. Workers keep taking jobs
        // until the queue is empty and then exit.
        if self.shared.queue.close() {
            log::debug!(
                "shutting down thread pool, {} tasks still queued",
                self.shared.queue.len()
            );
        }

        if self.shared.is_current_worker() {
            log::debug!("thread pool shut down from its own worker, not waiting");
            return false;
        }

        let mut thread_count = self.shared.thread_count();

        while *thread_count > 0 {
            // If a deadline is set, figure out how much time is remaining and
            // wait for that amount.
            if let Some(deadline) = deadline {
                if let Some(timeout) = deadline.checked_duration_since(Instant::now()) {
                    thread_count = self
                        .shared
                        .shutdown_cvar
                        .wait_timeout(thread_count, timeout)
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .0;
                } else {
                    return false;
                }
            }
            // If a deadline is not set, wait forever.
            else {
                thread_count = self
                    .shared
                    .shutdown_cvar
                    .wait(thread_count)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
        }

        drop(thread_count);

        if deadline.is_none() {
            self.shared.join_workers();
        }

        true
    }

    /// Spawn one worker thread into the thread pool.
    fn spawn_thread(&self, config: &Builder) -> std::io::Result<()> {
        struct WorkerListener {
            shared: Arc<Shared>,
        }

        impl Listener for WorkerListener {
            fn on_task_started(&mut self) {
                self.shared
                    .running_tasks_count
                    .fetch_add(1, Ordering::Relaxed);
            }

            fn on_task_completed(&mut self, panicked: bool) {
                self.shared
                    .running_tasks_count
                    .fetch_sub(1, Ordering::Relaxed);
                self.shared
                    .completed_tasks_count
                    .fetch_add(1, Ordering::Relaxed);

                if panicked {
                    self.shared
                        .panicked_tasks_count
                        .fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        impl Drop for WorkerListener {
            fn drop(&mut self) {
                let mut count = self.shared.thread_count();
                *count = count.saturating_sub(1);
                self.shared.shutdown_cvar.notify_all();
            }
        }

        // Configure the thread based on the thread pool configuration.
        let mut builder = thread::Builder::new();

        if let Some(name) = config.name.as_ref() {
            builder = builder.name(name.clone());
        }

        if let Some(size) = config.stack_size {
            builder = builder.stack_size(size);
        }

        *self.shared.thread_count() += 1;

        let pool_id = self.shared.id();
        let worker = Worker::new(
            self.shared.queue.clone(),
            WorkerListener {
                shared: self.shared.clone(),
            },
        );

        // If spawning fails the closure is dropped along with the worker, and
        // the listener gives the thread count back.
        let handle = builder.spawn(move || {
            CURRENT_POOL.with(|current| current.set(pool_id));
            worker.run();
        })?;

        self.shared.workers().push(handle);

        Ok(())
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.join_internal(None);
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("threads", &self.threads())
            .field("queued_tasks", &self.queued_tasks())
            .field("running_tasks", &self.running_tasks())
            .field("completed_tasks", &self.completed_tasks())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Thread pool state shared by the owner and the worker threads.
struct Shared {
    queue: Arc<Queue>,
    watermark: usize,
    on_backpressure: Option<BackpressureHook>,
    thread_count: Mutex<usize>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    running_tasks_count: AtomicUsize,
    completed_tasks_count: AtomicCounter,
    panicked_tasks_count: AtomicCounter,
    shutdown_cvar: Condvar,
}

impl Shared {
    fn thread_count(&self) -> MutexGuard<'_, usize> {
        self.thread_count
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn workers(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Join every worker thread, including thread-local teardown that runs
    /// after a worker loop has ended.
    ///
    /// The lock is held while joining so concurrent callers all wait for the
    /// threads to be gone. Never called from a worker of this pool.
    fn join_workers(&self) {
        let mut workers = self.workers();

        for handle in workers.drain(..) {
            if handle.join().is_err() {
                log::warn!("thread pool worker panicked while exiting");
            }
        }
    }

    fn id(&self) -> usize {
        self as *const Self as usize
    }

    fn is_current_worker(&self) -> bool {
        CURRENT_POOL.with(|current| current.get() == self.id())
    }

    fn report_backpressure(&self, depth: usize) {
        log::warn!(
            "thread pool queue depth {} reached watermark {}, workers are falling behind",
            depth,
            self.watermark
        );

        if let Some(hook) = self.on_backpressure.as_ref() {
            // The job is already queued, so the caller must still get its
            // task back.
            if catch_unwind(AssertUnwindSafe(|| hook(depth))).is_err() {
                log::error!("thread pool backpressure hook panicked");
            }
        }
    }
}
