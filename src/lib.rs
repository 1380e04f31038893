#![doc = include_str!("../README.md")]

mod error;
mod pool;
mod queue;
mod task;
mod worker;

pub use crate::{
    error::{BuildError, PoolClosedError, TaskError},
    pool::{Builder, ThreadPool, DEFAULT_QUEUE_WATERMARK},
    task::Task,
};

/// Get a builder for creating a customized thread pool.
///
/// Shorthand for [`ThreadPool::builder`].
#[inline]
pub fn builder() -> Builder {
    Builder::default()
}
