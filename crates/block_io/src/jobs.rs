//! Work-dispatch facility for one-shot administrative jobs.
//!
//! Resize, flush, trim, end-of-file and allocation queries block on the
//! device, so they run on a small dedicated rayon pool instead of the calling
//! thread or the I/O completion path. Each job reports through a bounded
//! crossbeam channel wrapped in a [`JobHandle`].

use std::fmt;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::error::{BlockError, BlockResult};

/// Pending result of an administrative job.
#[must_use = "a job handle should be waited on"]
pub struct JobHandle<T> {
    result: Receiver<BlockResult<T>>,
}

impl<T> JobHandle<T> {
    /// A handle whose result is already known.
    pub(crate) fn ready(result: BlockResult<T>) -> Self {
        let (sender, receiver) = crossbeam_channel::bounded(1);
        let _ = sender.send(result);
        Self { result: receiver }
    }

    /// Blocks until the job finishes.
    ///
    /// # Errors
    ///
    /// The job's own error, or [`BlockError::Cancelled`] if the job was
    /// dropped without reporting (for example, because it panicked).
    pub fn wait(self) -> BlockResult<T> {
        self.result.recv().unwrap_or(Err(BlockError::Cancelled))
    }

    /// Waits at most `timeout`; returns the handle back if the job is still running.
    ///
    /// # Errors
    ///
    /// Returns `Err(self)` on timeout.
    pub fn wait_timeout(self, timeout: Duration) -> Result<BlockResult<T>, Self> {
        match self.result.recv_timeout(timeout) {
            Ok(result) => Ok(result),
            Err(RecvTimeoutError::Timeout) => Err(self),
            Err(RecvTimeoutError::Disconnected) => Ok(Err(BlockError::Cancelled)),
        }
    }

    /// Returns the result if the job has finished.
    pub fn try_wait(&self) -> Option<BlockResult<T>> {
        match self.result.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(BlockError::Cancelled)),
        }
    }
}

impl<T> fmt::Debug for JobHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("finished", &!self.result.is_empty())
            .finish()
    }
}

/// Thread pool running administrative jobs.
pub(crate) struct JobPool {
    pool: ThreadPool,
}

impl JobPool {
    pub(crate) fn new(threads: usize) -> BlockResult<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|index| format!("blockio-admin-{index}"))
            .build()
            .map_err(|_| BlockError::InsufficientResources)?;
        Ok(Self { pool })
    }

    /// Runs `job` on the pool.
    pub(crate) fn spawn<T, F>(&self, job: F) -> JobHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> BlockResult<T> + Send + 'static,
    {
        let (sender, receiver) = crossbeam_channel::bounded(1);
        self.pool.spawn(move || {
            let _ = sender.send(job());
        });
        JobHandle { result: receiver }
    }

    pub(crate) fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }
}

impl fmt::Debug for JobPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobPool")
            .field("threads", &self.threads())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn spawned_job_reports_result() {
        let pool = JobPool::new(1).unwrap();
        assert_eq!(pool.threads(), 1);
        let handle = pool.spawn(|| Ok(41 + 1));
        assert_eq!(handle.wait(), Ok(42));
    }

    #[test]
    fn job_errors_propagate() {
        let pool = JobPool::new(2).unwrap();
        let handle: JobHandle<()> = pool.spawn(|| Err(BlockError::Unsupported));
        assert_eq!(handle.wait(), Err(BlockError::Unsupported));
    }

    #[test]
    fn ready_handle_is_immediate() {
        let handle = JobHandle::ready(Err::<u64, _>(BlockError::AccessDenied));
        assert_eq!(handle.try_wait(), Some(Err(BlockError::AccessDenied)));
    }

    #[test]
    fn jobs_run_off_the_calling_thread() {
        let pool = JobPool::new(2).unwrap();
        let caller = std::thread::current().id();
        let ran = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ran = Arc::clone(&ran);
                pool.spawn(move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(std::thread::current().id() != caller)
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.wait(), Ok(true));
        }
        assert_eq!(ran.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn wait_timeout_returns_handle_while_running() {
        let pool = JobPool::new(1).unwrap();
        let (release, gate) = crossbeam_channel::bounded::<()>(0);
        let handle = pool.spawn(move || {
            let _ = gate.recv();
            Ok(())
        });
        let handle = handle
            .wait_timeout(Duration::from_millis(10))
            .expect_err("job is blocked");
        release.send(()).unwrap();
        assert_eq!(handle.wait(), Ok(()));
    }
}
