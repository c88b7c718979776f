//! Submission strategies
//!
//! A strategy receives dependency-cleared commands from the scheduler and
//! gets them to the backend without blocking the owning thread for long:
//!
//! - [`InlineSubmit`]: calls the backend from the owning thread
//! - [`PooledSubmit`]: blocking `pread`/`pwrite` on a worker pool, for
//!   platforms with no usable async primitive
//! - [`ThreadedSubmit`]: one auxiliary thread performs each batch submit,
//!   for backends whose submit call can block
//!
//! Backpressure from the backend is retried transparently; any other
//! submission failure is fatal. The submission thread never aborts on its
//! own: it returns the error with its batch and the owning thread raises it.

use std::sync::Arc;

use crate::io::error::{fatal, IoError, IoResult};
use crate::io::notify::Notifier;
use crate::io::pool::{BlockingPool, Job};
use crate::io::posix_aio;
use crate::io::traits::{is_transient, AioBackend, IoCommand, IoEvent};

use super::metrics::IoMetrics;
use super::RequestId;

/// How admitted commands reach the backend
pub trait SubmitStrategy {
    fn name(&self) -> &'static str;

    /// Commands that can be accepted right now
    fn capacity(&self) -> usize;

    /// Accept one command; it may be buffered until [`flush`](Self::flush)
    fn submit(&mut self, cmd: IoCommand);

    /// Push buffered commands toward the backend
    fn flush(&mut self);

    /// A previously submitted command has completed
    fn notify_done(&mut self, id: RequestId);

    /// Collect events the strategy produced itself and finish hand-offs
    /// from auxiliary threads. Runs on the owning thread.
    fn poll(&mut self, out: &mut Vec<IoEvent>);

    /// Stop auxiliary threads
    fn shutdown(&mut self) {}
}

/// Submit `batch` to the backend until every command has been accepted
///
/// Partial acceptance continues with the remainder; transient errors yield
/// and retry the unsent tail, so no command is dropped or sent twice. Any
/// other error is returned with the unsent count.
pub(crate) fn submit_all(
    backend: &dyn AioBackend,
    batch: &[IoCommand],
    metrics: &IoMetrics,
) -> IoResult<()> {
    let mut sent = 0;
    let mut retries = 0u32;
    while sent < batch.len() {
        match backend.submit(&batch[sent..]) {
            Ok(n) if n > 0 => {
                sent += n;
                metrics.record_batch();
            }
            Ok(_) => retry(backend, batch.len() - sent, &mut retries, metrics),
            Err(e) if is_transient(&e) => retry(backend, batch.len() - sent, &mut retries, metrics),
            Err(source) => {
                return Err(IoError::Submit {
                    op: backend.name(),
                    batch: batch.len() - sent,
                    source,
                });
            }
        }
    }
    tracing::debug!(backend = backend.name(), commands = batch.len(), retries, "batch submitted");
    Ok(())
}

fn retry(backend: &dyn AioBackend, unsent: usize, retries: &mut u32, metrics: &IoMetrics) {
    if *retries == 0 {
        tracing::warn!(backend = backend.name(), unsent, "backend busy, retrying submission");
    }
    *retries += 1;
    metrics.record_retry();
    std::thread::yield_now();
}

// ============================================================================
// Inline
// ============================================================================

/// Submits from the owning thread, bounded by a target queue depth
pub struct InlineSubmit {
    backend: Arc<dyn AioBackend>,
    metrics: Arc<IoMetrics>,
    depth: usize,
    in_flight: usize,
    pending: Vec<IoCommand>,
}

impl InlineSubmit {
    pub fn new(backend: Arc<dyn AioBackend>, depth: usize, metrics: Arc<IoMetrics>) -> Self {
        Self {
            backend,
            metrics,
            depth: depth.max(1),
            in_flight: 0,
            pending: Vec::with_capacity(depth),
        }
    }
}

impl SubmitStrategy for InlineSubmit {
    fn name(&self) -> &'static str {
        "inline"
    }

    fn capacity(&self) -> usize {
        self.depth
            .saturating_sub(self.in_flight + self.pending.len())
    }

    fn submit(&mut self, cmd: IoCommand) {
        self.pending.push(cmd);
    }

    fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        if let Err(err) = submit_all(&*self.backend, &self.pending, &self.metrics) {
            fatal(err);
        }
        self.in_flight += self.pending.len();
        self.pending.clear();
    }

    fn notify_done(&mut self, _id: RequestId) {
        self.in_flight -= 1;
    }

    fn poll(&mut self, _out: &mut Vec<IoEvent>) {}
}

// ============================================================================
// Pooled
// ============================================================================

/// One blocking transfer on a pool worker
pub struct Transfer {
    cmd: IoCommand,
    result: i64,
}

impl Job for Transfer {
    type Output = IoEvent;

    fn run(&mut self) {
        self.result = posix_aio::transfer(&self.cmd);
    }

    fn done(self) -> IoEvent {
        IoEvent {
            id: self.cmd.id,
            result: self.result,
        }
    }
}

/// Emulates asynchronous I/O with blocking syscalls on a worker pool
///
/// The pool also produces the completions: finished transfers come back
/// through [`poll`](SubmitStrategy::poll).
pub struct PooledSubmit {
    pool: BlockingPool<Transfer>,
    in_flight: usize,
}

impl PooledSubmit {
    pub fn new(workers: usize, notifier: Arc<Notifier>) -> IoResult<Self> {
        Ok(Self {
            pool: BlockingPool::new("diskq-io", workers, notifier)?,
            in_flight: 0,
        })
    }
}

impl SubmitStrategy for PooledSubmit {
    fn name(&self) -> &'static str {
        "pooled"
    }

    fn capacity(&self) -> usize {
        self.pool.workers().saturating_sub(self.in_flight)
    }

    fn submit(&mut self, cmd: IoCommand) {
        self.pool.submit(Transfer { cmd, result: 0 });
        self.in_flight += 1;
    }

    fn flush(&mut self) {}

    fn notify_done(&mut self, _id: RequestId) {
        self.in_flight -= 1;
    }

    fn poll(&mut self, out: &mut Vec<IoEvent>) {
        self.pool.finished(|event| out.push(event));
    }

    fn shutdown(&mut self) {
        self.pool.shutdown();
    }
}

// ============================================================================
// Threaded
// ============================================================================

/// A batch submitted from the submission thread
pub struct SubmitBatch {
    backend: Arc<dyn AioBackend>,
    metrics: Arc<IoMetrics>,
    cmds: Vec<IoCommand>,
    outcome: IoResult<()>,
}

impl Job for SubmitBatch {
    type Output = IoResult<usize>;

    fn run(&mut self) {
        self.outcome = submit_all(&*self.backend, &self.cmds, &self.metrics);
    }

    fn done(self) -> IoResult<usize> {
        self.outcome.map(|()| self.cmds.len())
    }
}

/// Performs blocking backend submits on a dedicated thread
///
/// At most one batch is with the thread at a time; commands admitted
/// meanwhile accumulate until it returns.
pub struct ThreadedSubmit {
    pool: BlockingPool<SubmitBatch>,
    backend: Arc<dyn AioBackend>,
    metrics: Arc<IoMetrics>,
    depth: usize,
    batch_cap: usize,
    /// Commands handed to the thread or the backend and not yet completed
    in_flight: usize,
    pending: Vec<IoCommand>,
    batch_running: bool,
}

impl ThreadedSubmit {
    pub fn new(
        backend: Arc<dyn AioBackend>,
        depth: usize,
        batch_cap: usize,
        notifier: Arc<Notifier>,
        metrics: Arc<IoMetrics>,
    ) -> IoResult<Self> {
        Ok(Self {
            pool: BlockingPool::new("diskq-submit", 1, notifier)?,
            backend,
            metrics,
            depth: depth.max(1),
            batch_cap: batch_cap.max(1),
            in_flight: 0,
            pending: Vec::new(),
            batch_running: false,
        })
    }
}

impl SubmitStrategy for ThreadedSubmit {
    fn name(&self) -> &'static str {
        "threaded"
    }

    fn capacity(&self) -> usize {
        let by_depth = self
            .depth
            .saturating_sub(self.in_flight + self.pending.len());
        by_depth.min(self.batch_cap.saturating_sub(self.pending.len()))
    }

    fn submit(&mut self, cmd: IoCommand) {
        self.pending.push(cmd);
    }

    fn flush(&mut self) {
        if self.batch_running || self.pending.is_empty() {
            return;
        }
        let cmds = std::mem::take(&mut self.pending);
        self.in_flight += cmds.len();
        self.batch_running = true;
        self.pool.submit(SubmitBatch {
            backend: self.backend.clone(),
            metrics: self.metrics.clone(),
            cmds,
            outcome: Ok(()),
        });
    }

    fn notify_done(&mut self, _id: RequestId) {
        self.in_flight -= 1;
    }

    fn poll(&mut self, _out: &mut Vec<IoEvent>) {
        let mut returned = false;
        let mut failure = None;
        self.pool.finished(|outcome| {
            returned = true;
            if let Err(err) = outcome {
                failure = Some(err);
            }
        });
        if let Some(err) = failure {
            fatal(err);
        }
        if returned {
            self.batch_running = false;
            self.flush();
        }
    }

    fn shutdown(&mut self) {
        self.pool.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::scheduler::testing::ScriptedBackend;
    use crate::io::scheduler::OpKind;
    use std::time::{Duration, Instant};

    fn command(id: u64) -> IoCommand {
        IoCommand {
            id: RequestId(id),
            fd: 3,
            kind: OpKind::Write,
            buf: std::ptr::null_mut(),
            len: 4096,
            offset: id * 4096,
        }
    }

    #[test]
    fn test_retry_after_backpressure_submits_once() {
        let backend = ScriptedBackend::new();
        backend.fail_next_submit(libc::EAGAIN);
        let metrics = IoMetrics::new();

        submit_all(&*backend, &[command(1)], &metrics).unwrap();

        assert_eq!(backend.submit_calls(), 2);
        assert_eq!(backend.accepted_ids(), vec![RequestId(1)]);
        assert_eq!(metrics.snapshot().submit_retries, 1);
    }

    #[test]
    fn test_partial_acceptance_continues() {
        let backend = ScriptedBackend::new();
        backend.limit_next_submit(1);
        let metrics = IoMetrics::new();

        submit_all(&*backend, &[command(1), command(2), command(3)], &metrics).unwrap();

        assert_eq!(backend.submit_calls(), 2);
        assert_eq!(
            backend.accepted_ids(),
            vec![RequestId(1), RequestId(2), RequestId(3)]
        );
        assert_eq!(metrics.snapshot().batches_submitted, 2);
    }

    #[test]
    fn test_hard_submit_error_is_returned() {
        let backend = ScriptedBackend::new();
        backend.fail_next_submit(libc::EBADF);
        let err = submit_all(&*backend, &[command(1)], &IoMetrics::new()).unwrap_err();
        assert!(matches!(err, IoError::Submit { batch: 1, .. }));
        assert_eq!(backend.submit_calls(), 1);
    }

    #[test]
    #[should_panic(expected = "rejected a batch")]
    fn test_inline_hard_submit_error_is_fatal() {
        let backend = ScriptedBackend::new();
        backend.fail_next_submit(libc::EBADF);
        let mut inline = InlineSubmit::new(backend, 4, Arc::new(IoMetrics::new()));
        inline.submit(command(1));
        inline.flush();
    }

    #[test]
    #[should_panic(expected = "rejected a batch")]
    fn test_threaded_submit_error_raised_on_owner() {
        let backend = ScriptedBackend::new();
        backend.fail_next_submit(libc::EBADF);
        let notifier = Arc::new(Notifier::new().unwrap());
        let mut threaded =
            ThreadedSubmit::new(backend, 8, 8, notifier, Arc::new(IoMetrics::new())).unwrap();

        threaded.submit(command(1));
        threaded.flush();

        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            threaded.poll(&mut Vec::new());
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_inline_capacity_tracks_depth() {
        let backend = ScriptedBackend::new();
        let mut inline = InlineSubmit::new(backend.clone(), 2, Arc::new(IoMetrics::new()));
        assert_eq!(inline.capacity(), 2);

        inline.submit(command(1));
        assert_eq!(inline.capacity(), 1);
        inline.submit(command(2));
        inline.flush();
        assert_eq!(inline.capacity(), 0);
        assert_eq!(backend.submit_calls(), 1);

        inline.notify_done(RequestId(1));
        assert_eq!(inline.capacity(), 1);
    }

    #[test]
    fn test_threaded_one_batch_at_a_time() {
        let backend = ScriptedBackend::new();
        let notifier = Arc::new(Notifier::new().unwrap());
        let mut threaded = ThreadedSubmit::new(
            backend.clone(),
            8,
            2,
            notifier.clone(),
            Arc::new(IoMetrics::new()),
        )
        .unwrap();

        threaded.submit(command(1));
        threaded.submit(command(2));
        assert_eq!(threaded.capacity(), 0);
        threaded.flush();
        threaded.submit(command(3));
        threaded.flush();

        let deadline = Instant::now() + Duration::from_secs(5);
        while backend.accepted_ids().len() < 3 && Instant::now() < deadline {
            threaded.poll(&mut Vec::new());
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(
            backend.accepted_ids(),
            vec![RequestId(1), RequestId(2), RequestId(3)]
        );
        assert_eq!(backend.submit_calls(), 2);
        threaded.shutdown();
    }
}
