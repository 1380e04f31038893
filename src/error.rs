use std::{any::Any, error::Error, fmt, io, panic::resume_unwind};

/// An error returned when a thread pool could not be built.
#[derive(Debug)]
pub enum BuildError {
    /// The configuration can never produce a working pool, such as a pool
    /// with zero worker threads. No threads were started.
    InvalidConfiguration(&'static str),

    /// The operating system refused to spawn a worker thread. Any workers
    /// that had already been started were stopped again.
    Spawn(io::Error),
}

impl Error for BuildError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::InvalidConfiguration(_) => None,
            Self::Spawn(e) => Some(e),
        }
    }
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfiguration(reason) => {
                write!(f, "invalid thread pool configuration: {}", reason)
            }
            Self::Spawn(e) => write!(f, "failed to spawn worker thread: {}", e),
        }
    }
}

/// An error returned when a task could not be executed because the thread
/// pool has been shut down.
///
/// Contains the original closure that failed to be submitted. This allows you
/// to run it somewhere else or take some other action.
pub struct PoolClosedError<T>(pub(crate) T);

impl<T> PoolClosedError<T> {
    /// Extracts the inner closure that could not be executed.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> Error for PoolClosedError<T> {}

impl<T> fmt::Debug for PoolClosedError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PoolClosedError(..)")
    }
}

impl<T> fmt::Display for PoolClosedError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("thread pool is closed")
    }
}

/// The reason a task did not produce a value.
pub enum TaskError {
    /// The task's closure panicked. Holds the panic payload.
    Panicked(Box<dyn Any + Send + 'static>),

    /// The task was destroyed without ever being run.
    Abandoned,
}

impl TaskError {
    /// Returns true if the task's closure panicked.
    pub fn is_panic(&self) -> bool {
        matches!(self, Self::Panicked(_))
    }

    /// Get the panic message, if the task panicked with a string payload.
    ///
    /// # Examples
    ///
    /// ```
    /// let pool = workpool::ThreadPool::new(1).unwrap();
    /// let error = pool.execute(|| panic!("oh no!")).unwrap().get().unwrap_err();
    ///
    /// assert_eq!(error.panic_message(), Some("oh no!"));
    /// ```
    pub fn panic_message(&self) -> Option<&str> {
        match self {
            Self::Panicked(payload) => payload
                .downcast_ref::<&'static str>()
                .copied()
                .or_else(|| payload.downcast_ref::<String>().map(String::as_str)),
            Self::Abandoned => None,
        }
    }

    /// Extracts the panic payload, suitable for
    /// [`resume_unwind`](std::panic::resume_unwind).
    ///
    /// An abandoned task is turned into a fresh payload describing it.
    pub fn into_panic(self) -> Box<dyn Any + Send + 'static> {
        match self {
            Self::Panicked(payload) => payload,
            Self::Abandoned => Box::new("task was dropped by thread pool without being completed"),
        }
    }

    pub(crate) fn resume(self) -> ! {
        resume_unwind(self.into_panic())
    }
}

impl Error for TaskError {}

impl fmt::Debug for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Panicked(_) => f
                .debug_tuple("Panicked")
                .field(&self.panic_message().unwrap_or(".."))
                .finish(),
            Self::Abandoned => f.write_str("Abandoned"),
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self, self.panic_message()) {
            (Self::Panicked(_), Some(message)) => write!(f, "task panicked: {}", message),
            (Self::Panicked(_), None) => f.write_str("task panicked"),
            (Self::Abandoned, _) => f.write_str("task was abandoned before it could run"),
        }
    }
}
