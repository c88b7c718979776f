//! Disk I/O coordinator
//!
//! Owns the reorder queue, the dependency tracker and the active strategies,
//! and runs entirely on one owning thread.
//!
//! ```text
//! submit ─> ReorderQueue ─drain─> DependencyTracker ─> SubmitStrategy ─> backend
//!                                        ^                                  │
//!                                        └── poll <── CompleteStrategy <────┘
//! ```
//!
//! Every cross-thread producer (kernel completions, worker threads, the
//! polling thread, and `submit` itself) signals one [`Notifier`]. The owning
//! event loop watches its fd and calls [`Scheduler::poll`], which completes
//! what has finished and then drains newly admissible work in one pass.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::io::aligned_buffer::AlignedBuffer;
use crate::io::error::{fatal, IoError, IoResult};
use crate::io::event_loop::{EventLoop, Interest};
use crate::io::linux_aio::LinuxAio;
use crate::io::notify::Notifier;
use crate::io::traits::{AioBackend, IoCommand, IoEvent};
use crate::io::uring::UringAio;

use super::complete::{CompleteStrategy, EventfdComplete, PollingComplete};
use super::config::SchedulerConfig;
use super::metrics::IoMetrics;
use super::queue::{Bucket, ReorderQueue};
use super::submit::{InlineSubmit, PooledSubmit, SubmitStrategy, ThreadedSubmit};
use super::tracker::DependencyTracker;
use super::{Completion, Extent, OpKind, Request, RequestId};

// ============================================================================
// Strategy selection
// ============================================================================

/// How admitted requests reach the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitMode {
    /// Submit from the owning thread
    Inline,
    /// Submit from a dedicated thread, for backends whose submit blocks
    Threaded,
}

/// How completions reach the owning thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteMode {
    /// The backend signals the scheduler's eventfd directly
    Eventfd,
    /// A background thread waits for completions
    PollingThread,
}

/// Backend and strategies, chosen once at construction
pub enum IoMode {
    /// An OS async I/O facility
    Aio {
        backend: Arc<dyn AioBackend>,
        submit: SubmitMode,
        complete: CompleteMode,
    },
    /// Blocking `pread`/`pwrite` on a pool of `workers` threads
    Pooled { workers: usize },
}

impl IoMode {
    /// Pick strategies from the backend's capabilities
    pub fn detect(backend: Arc<dyn AioBackend>) -> Self {
        let submit = if backend.submit_may_block() {
            SubmitMode::Threaded
        } else {
            SubmitMode::Inline
        };
        let complete = if backend.supports_notify_fd() {
            CompleteMode::Eventfd
        } else {
            CompleteMode::PollingThread
        };
        IoMode::Aio {
            backend,
            submit,
            complete,
        }
    }

    /// Kernel AIO with detected strategies
    pub fn linux_aio(config: &SchedulerConfig) -> IoResult<Self> {
        Ok(Self::detect(Arc::new(LinuxAio::from_config(config)?)))
    }

    /// io_uring with detected strategies
    pub fn uring(config: &SchedulerConfig) -> IoResult<Self> {
        Ok(Self::detect(Arc::new(UringAio::from_config(config)?)))
    }
}

impl fmt::Debug for IoMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoMode::Aio {
                backend,
                submit,
                complete,
            } => f
                .debug_struct("Aio")
                .field("backend", &backend.name())
                .field("submit", submit)
                .field("complete", complete)
                .finish(),
            IoMode::Pooled { workers } => f
                .debug_struct("Pooled")
                .field("workers", workers)
                .finish(),
        }
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// A request the scheduler holds between `submit` and completion
struct Slot<T> {
    extent: Extent,
    buffer: AlignedBuffer,
    token: T,
    /// Set when handed to the submit strategy
    admitted: Option<Instant>,
}

/// Asynchronous disk I/O scheduler
///
/// Not `Send`: all methods run on the owning thread. `on_complete` is
/// invoked from [`poll`](Self::poll) exactly once per submitted request and
/// must not call back into the scheduler.
pub struct Scheduler<T> {
    config: SchedulerConfig,
    queue: ReorderQueue,
    tracker: DependencyTracker,
    requests: HashMap<RequestId, Slot<T>>,
    next_id: u64,
    in_flight: usize,
    submitter: Box<dyn SubmitStrategy>,
    completer: Option<Box<dyn CompleteStrategy>>,
    notifier: Arc<Notifier>,
    metrics: Arc<IoMetrics>,
    /// Scratch space reused across polls
    events: Vec<IoEvent>,
    /// A self-wakeup is armed and no drain has run since
    drain_pending: bool,
    shut_down: bool,
    on_complete: Box<dyn FnMut(Completion<T>)>,
}

impl<T> Scheduler<T> {
    /// Create a scheduler
    ///
    /// Setup failures (backend context, eventfd, threads) are returned so
    /// the embedding engine can report them before aborting.
    pub fn new(
        config: SchedulerConfig,
        mode: IoMode,
        on_complete: impl FnMut(Completion<T>) + 'static,
    ) -> IoResult<Self> {
        config.validate()?;
        let notifier = Arc::new(Notifier::new()?);
        let metrics = Arc::new(IoMetrics::new());
        let depth = config.effective_queue_depth();

        let (submitter, completer): (Box<dyn SubmitStrategy>, Option<Box<dyn CompleteStrategy>>) =
            match mode {
                IoMode::Aio {
                    backend,
                    submit,
                    complete,
                } => {
                    let submitter: Box<dyn SubmitStrategy> = match submit {
                        SubmitMode::Inline => {
                            Box::new(InlineSubmit::new(backend.clone(), depth, metrics.clone()))
                        }
                        SubmitMode::Threaded => Box::new(ThreadedSubmit::new(
                            backend.clone(),
                            depth,
                            config.submit_batch,
                            notifier.clone(),
                            metrics.clone(),
                        )?),
                    };
                    let completer: Box<dyn CompleteStrategy> = match complete {
                        CompleteMode::Eventfd => Box::new(EventfdComplete::new(
                            backend,
                            &notifier,
                            config.completion_batch,
                        )?),
                        CompleteMode::PollingThread => Box::new(PollingComplete::new(
                            backend,
                            notifier.clone(),
                            config.poll_timeout,
                        )?),
                    };
                    (submitter, Some(completer))
                }
                IoMode::Pooled { workers } => {
                    (Box::new(PooledSubmit::new(workers, notifier.clone())?), None)
                }
            };

        tracing::info!(
            submit = submitter.name(),
            complete = completer.as_ref().map_or("pool", |c| c.name()),
            block_size = config.block_size,
            depth,
            "disk I/O scheduler started"
        );

        Ok(Self {
            queue: ReorderQueue::new(config.block_size, config.fairness_batch),
            tracker: DependencyTracker::new(config.block_size),
            requests: HashMap::new(),
            next_id: 0,
            in_flight: 0,
            submitter,
            completer,
            notifier,
            metrics,
            events: Vec::with_capacity(config.completion_batch),
            drain_pending: false,
            shut_down: false,
            on_complete: Box::new(on_complete),
            config,
        })
    }

    /// Queue a request
    ///
    /// Never blocks and never fails. The request is admitted on the next
    /// [`poll`](Self::poll), so every request submitted during one event
    /// loop turn is reordered and batched together.
    pub fn submit(&mut self, request: Request<T>) -> RequestId {
        assert!(!self.shut_down, "submit after shutdown");
        let Request {
            extent,
            buffer,
            token,
        } = request;

        let id = RequestId(self.next_id);
        self.next_id += 1;
        self.queue.push(id, extent);
        self.requests.insert(
            id,
            Slot {
                extent,
                buffer,
                token,
                admitted: None,
            },
        );
        self.metrics.record_submit();

        if !self.drain_pending {
            self.drain_pending = true;
            self.notifier.notify();
        }
        id
    }

    /// Admit as much queued work as the submit strategy has room for
    ///
    /// A bucket whose head conflicts with an admitted request is skipped for
    /// the rest of the pass; that head becomes admissible once the request
    /// it waits on completes. The other buckets keep draining.
    pub fn drain(&mut self) -> usize {
        self.drain_pending = false;
        let mut admitted = 0;
        let mut blocked: Vec<Bucket> = Vec::with_capacity(3);

        while self.submitter.capacity() > 0 {
            let Some(head) = self.queue.peek_except(&blocked) else {
                break;
            };
            if self.tracker.is_conflicting(&head.extent) {
                blocked.push(head.bucket);
                continue;
            }
            let entry = self.queue.pull_from(head.bucket);
            debug_assert_eq!(entry, head);

            self.tracker.register_active(&entry.extent);
            let Some(slot) = self.requests.get_mut(&entry.id) else {
                panic!("queued request {} has no slot", entry.id);
            };
            slot.admitted = Some(Instant::now());
            let cmd = IoCommand {
                id: entry.id,
                fd: entry.extent.fd,
                kind: entry.extent.kind,
                buf: slot.buffer.as_mut_ptr(),
                len: entry.extent.len,
                offset: entry.extent.offset,
            };
            self.submitter.submit(cmd);
            self.metrics
                .record_admit(entry.bucket == Bucket::Conflicting);
            self.in_flight += 1;
            admitted += 1;
        }
        self.submitter.flush();

        if admitted > 0 {
            tracing::debug!(
                admitted,
                queued = self.queue.len(),
                in_flight = self.in_flight,
                ?blocked,
                "drain pass"
            );
        }
        admitted
    }

    /// Handle a wakeup: complete finished requests, then drain
    ///
    /// Returns the number of completions delivered.
    pub fn poll(&mut self) -> usize {
        let completed = self.process_completions();
        if !self.shut_down {
            self.drain();
        }
        completed
    }

    fn process_completions(&mut self) -> usize {
        self.notifier.reset();

        let mut events = std::mem::take(&mut self.events);
        self.submitter.poll(&mut events);
        if let Some(completer) = self.completer.as_mut() {
            completer.collect(&mut events);
        }

        let n = events.len();
        for event in events.drain(..) {
            self.complete(event.id, event.result);
        }
        self.events = events;
        n
    }

    /// Finish one admitted request
    ///
    /// A failed or short transfer is fatal.
    fn complete(&mut self, id: RequestId, result: i64) {
        let Some(slot) = self.requests.remove(&id) else {
            panic!("completion for unknown request {id}");
        };
        let Some(admitted) = slot.admitted else {
            panic!("completion for request {id} that was never admitted");
        };
        let extent = slot.extent;

        if result < 0 {
            fatal(IoError::Completion {
                op: extent.kind.as_str(),
                fd: extent.fd,
                offset: extent.offset,
                source: io::Error::from_raw_os_error(-result as i32),
            });
        }
        if result as usize != extent.len {
            fatal(IoError::ShortTransfer {
                op: extent.kind.as_str(),
                fd: extent.fd,
                offset: extent.offset,
                expected: extent.len,
                actual: result as usize,
            });
        }

        self.tracker.unregister(&extent);
        self.submitter.notify_done(id);
        self.in_flight -= 1;
        self.metrics
            .record_completion(extent.kind, admitted.elapsed(), extent.len);

        let mut buffer = slot.buffer;
        if extent.kind == OpKind::Read {
            buffer.set_len(extent.len);
        }
        (self.on_complete)(Completion {
            token: slot.token,
            fd: extent.fd,
            kind: extent.kind,
            offset: extent.offset,
            buffer,
            bytes: extent.len,
        });
    }

    /// The fd an event loop should watch for readability
    pub fn wake_fd(&self) -> RawFd {
        self.notifier.as_raw_fd()
    }

    /// Register the scheduler's wakeup fd with `event_loop`
    ///
    /// The loop holds only a weak reference; dropping the scheduler turns
    /// later wakeups into no-ops.
    pub fn attach(this: &Rc<RefCell<Self>>, event_loop: &mut dyn EventLoop) -> IoResult<()>
    where
        T: 'static,
    {
        let fd = this.borrow().wake_fd();
        let weak = Rc::downgrade(this);
        event_loop.watch_resource(
            fd,
            Interest::READABLE,
            Box::new(move |_| {
                if let Some(scheduler) = weak.upgrade() {
                    scheduler.borrow_mut().poll();
                }
            }),
        )
    }

    /// Remove the scheduler's wakeup fd from `event_loop`
    pub fn detach(&self, event_loop: &mut dyn EventLoop) {
        event_loop.forget_resource(self.wake_fd());
    }

    /// Poll until every submitted request has completed
    ///
    /// Blocks the calling thread; meant for tools and tests that have no
    /// event loop of their own. Returns false if `timeout` ran out first.
    pub fn run_until_idle(&mut self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            self.poll();
            if self.is_idle() {
                return true;
            }
            let wait = match deadline {
                None => None,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    Some(deadline - now)
                }
            };
            self.wait_for_wakeup(wait);
        }
    }

    /// Block until the notifier is readable or `timeout` passes
    fn wait_for_wakeup(&self, timeout: Option<Duration>) {
        let mut pfd = libc::pollfd {
            fd: self.wake_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = match timeout {
            None => -1,
            Some(d) => d.as_micros().div_ceil(1000).min(i32::MAX as u128) as libc::c_int,
        };
        // Safety: pfd is a single valid pollfd; EINTR and timeouts just
        // return to the caller's loop
        unsafe {
            libc::poll(&mut pfd, 1, timeout_ms);
        }
    }

    /// Requests not yet admitted
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Requests admitted and not yet completed
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Nothing queued and nothing in flight
    pub fn is_idle(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn metrics(&self) -> &Arc<IoMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Stop the scheduler
    ///
    /// Queued requests are dropped without a callback. Admitted requests
    /// are waited for and completed normally, so no buffer is freed while
    /// the backend may still touch it. Then auxiliary threads are joined.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        let mut discarded = 0;
        while !self.queue.is_empty() {
            let entry = self.queue.pull();
            self.requests.remove(&entry.id);
            discarded += 1;
        }
        if discarded > 0 {
            self.metrics.record_discard(discarded);
            tracing::warn!(discarded, "dropping queued requests at shutdown");
        }

        while self.in_flight > 0 {
            self.process_completions();
            self.submitter.flush();
            if self.in_flight > 0 {
                self.wait_for_wakeup(Some(self.config.poll_timeout));
            }
        }

        if let Some(completer) = self.completer.as_mut() {
            completer.shutdown();
        }
        self.submitter.shutdown();
        tracing::info!(
            completed = self.metrics.snapshot().requests_completed,
            "disk I/O scheduler stopped"
        );
    }
}

impl<T> Drop for Scheduler<T> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            // Unwinding from a fatal path: admitted operations may still
            // target these buffers, so leak them rather than free them
            for (_, slot) in self.requests.drain() {
                std::mem::forget(slot.buffer);
            }
            self.shut_down = true;
            if let Some(completer) = self.completer.as_mut() {
                completer.shutdown();
            }
            return;
        }
        self.shutdown();
    }
}
