//! Completion strategies
//!
//! Both strategies deliver backend completions to the owning thread, which
//! watches the shared [`Notifier`]:
//!
//! - [`EventfdComplete`]: the kernel signals the notifier directly and the
//!   owning thread reaps without blocking
//! - [`PollingComplete`]: a background thread blocks in `reap` and forwards
//!   batches over a channel
//!
//! A reap failure is fatal. The polling thread does not abort itself: it
//! forwards the error and exits, and the owning thread raises it on its next
//! [`collect`](CompleteStrategy::collect).

use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};

use crate::io::error::{fatal, IoError, IoResult};
use crate::io::notify::Notifier;
use crate::io::traits::{AioBackend, IoEvent};

/// How backend completions reach the owning thread
pub trait CompleteStrategy {
    fn name(&self) -> &'static str;

    /// Append completions available right now; never blocks
    fn collect(&mut self, out: &mut Vec<IoEvent>);

    /// Stop auxiliary threads
    fn shutdown(&mut self) {}
}

// ============================================================================
// Eventfd
// ============================================================================

/// Reaps on the owning thread whenever the notifier fires
pub struct EventfdComplete {
    backend: Arc<dyn AioBackend>,
    batch: usize,
}

impl EventfdComplete {
    /// Route the backend's completion signal to `notifier`
    pub fn new(backend: Arc<dyn AioBackend>, notifier: &Notifier, batch: usize) -> IoResult<Self> {
        backend
            .set_notify_fd(notifier.as_raw_fd())
            .map_err(|source| IoError::Setup {
                op: "register completion eventfd",
                source,
            })?;
        Ok(Self {
            backend,
            batch: batch.max(1),
        })
    }
}

impl CompleteStrategy for EventfdComplete {
    fn name(&self) -> &'static str {
        "eventfd"
    }

    fn collect(&mut self, out: &mut Vec<IoEvent>) {
        loop {
            match self.backend.reap(out, 0, Some(Duration::ZERO)) {
                Ok(n) if n < self.batch => return,
                Ok(_) => {}
                Err(source) => fatal(IoError::Reap {
                    op: self.backend.name(),
                    source,
                }),
            }
        }
    }
}

// ============================================================================
// Polling thread
// ============================================================================

/// Reaps on a background thread and forwards batches to the owning thread
pub struct PollingComplete {
    backend: Arc<dyn AioBackend>,
    rx: Receiver<IoResult<Vec<IoEvent>>>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl PollingComplete {
    /// Start the reaper thread
    ///
    /// `timeout` bounds each wait so the thread notices the stop flag even
    /// if an interrupt is missed.
    pub fn new(
        backend: Arc<dyn AioBackend>,
        notifier: Arc<Notifier>,
        timeout: Duration,
    ) -> IoResult<Self> {
        let (tx, rx) = unbounded();
        let stop = Arc::new(AtomicBool::new(false));

        let thread = {
            let backend = backend.clone();
            let stop = stop.clone();
            thread::Builder::new()
                .name("diskq-reaper".into())
                .spawn(move || reaper_loop(backend, notifier, tx, stop, timeout))
                .map_err(|source| IoError::Setup {
                    op: "spawn reaper thread",
                    source,
                })?
        };

        tracing::info!(backend = backend.name(), ?timeout, "completion polling thread started");
        Ok(Self {
            backend,
            rx,
            stop,
            thread: Some(thread),
        })
    }
}

fn reaper_loop(
    backend: Arc<dyn AioBackend>,
    notifier: Arc<Notifier>,
    tx: Sender<IoResult<Vec<IoEvent>>>,
    stop: Arc<AtomicBool>,
    timeout: Duration,
) {
    let mut events = Vec::new();
    while !stop.load(Ordering::Acquire) {
        match backend.reap(&mut events, 1, Some(timeout)) {
            Ok(_) if events.is_empty() => {}
            Ok(_) => {
                if tx.send(Ok(std::mem::take(&mut events))).is_err() {
                    break;
                }
                notifier.notify();
            }
            Err(source) => {
                let _ = tx.send(Err(IoError::Reap {
                    op: backend.name(),
                    source,
                }));
                notifier.notify();
                break;
            }
        }
    }
    tracing::debug!("completion polling thread exiting");
}

impl CompleteStrategy for PollingComplete {
    fn name(&self) -> &'static str {
        "polling-thread"
    }

    fn collect(&mut self, out: &mut Vec<IoEvent>) {
        loop {
            match self.rx.try_recv() {
                Ok(Ok(batch)) => out.extend(batch),
                Ok(Err(err)) => fatal(err),
                Err(TryRecvError::Empty) => return,
                // The thread only hangs up when asked to stop
                Err(TryRecvError::Disconnected) if self.thread.is_none() => return,
                Err(TryRecvError::Disconnected) => fatal(IoError::Reap {
                    op: self.backend.name(),
                    source: std::io::Error::other("completion polling thread exited"),
                }),
            }
        }
    }

    fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.stop.store(true, Ordering::Release);
        self.backend.interrupt();
        if thread.join().is_err() {
            tracing::error!("completion polling thread panicked");
        }
        tracing::info!("completion polling thread stopped");
    }
}

impl Drop for PollingComplete {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::scheduler::testing::ScriptedBackend;
    use crate::io::scheduler::RequestId;
    use std::time::Instant;

    #[test]
    fn test_eventfd_registers_and_collects() {
        let backend = ScriptedBackend::new();
        let notifier = Notifier::new().unwrap();
        let mut strategy = EventfdComplete::new(backend.clone(), &notifier, 32).unwrap();

        backend.complete(RequestId(4), 4096);
        assert_eq!(notifier.reset(), 1);

        let mut out = Vec::new();
        strategy.collect(&mut out);
        assert_eq!(
            out,
            vec![IoEvent {
                id: RequestId(4),
                result: 4096
            }]
        );
    }

    #[test]
    fn test_polling_thread_forwards_and_stops() {
        let backend = ScriptedBackend::with_capabilities(false, false);
        let notifier = Arc::new(Notifier::new().unwrap());
        let mut strategy = PollingComplete::new(
            backend.clone(),
            notifier.clone(),
            Duration::from_millis(5),
        )
        .unwrap();

        backend.complete(RequestId(1), 512);
        backend.complete(RequestId(2), 512);

        let mut out = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while out.len() < 2 && Instant::now() < deadline {
            strategy.collect(&mut out);
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(out.len(), 2);
        assert!(notifier.reset() >= 1);

        strategy.shutdown();
        assert!(strategy.thread.is_none());
    }

    #[test]
    #[should_panic(expected = "failed to reap completions")]
    fn test_reap_error_raised_on_owner() {
        let backend = ScriptedBackend::with_capabilities(false, false);
        backend.fail_next_reap(libc::EIO);
        let notifier = Arc::new(Notifier::new().unwrap());
        let mut strategy =
            PollingComplete::new(backend, notifier.clone(), Duration::from_millis(5)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            strategy.collect(&mut Vec::new());
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}
