//! io_uring backend for Linux
//!
//! The submission and completion sides of the ring are serialized by
//! separate locks, so a polling thread can wait for completions while the
//! owning thread keeps submitting.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use io_uring::{opcode, squeue, types, IoUring};
use parking_lot::Mutex;

use super::error::{IoError, IoResult};
use super::scheduler::config::SchedulerConfig;
use super::scheduler::{OpKind, RequestId};
use super::traits::{AioBackend, IoCommand, IoEvent};

/// user_data of the NOP used to wake a waiting reaper
const INTERRUPT_TOKEN: u64 = u64::MAX;

struct SharedRing(IoUring);

// Safety: the submission queue is only touched under `UringAio::sq` and the
// completion queue only under `UringAio::cq`; the submitter is thread-safe.
unsafe impl Send for SharedRing {}
unsafe impl Sync for SharedRing {}

/// io_uring instance shared between the submitting and reaping threads
pub struct UringAio {
    ring: SharedRing,
    sq: Mutex<()>,
    cq: Mutex<()>,
    /// Entries sit in the submission queue but the kernel has not taken them
    unflushed: AtomicBool,
    completion_batch: usize,
}

impl UringAio {
    /// Create a ring with `entries` submission slots
    pub fn new(entries: u32, completion_batch: usize) -> IoResult<Self> {
        let ring = IoUring::new(entries).map_err(|source| IoError::Setup {
            op: "io_uring_setup",
            source,
        })?;
        if !ring.params().is_feature_ext_arg() {
            return Err(IoError::Setup {
                op: "io_uring_setup",
                source: io::Error::new(
                    io::ErrorKind::Unsupported,
                    "kernel lacks IORING_FEAT_EXT_ARG",
                ),
            });
        }

        tracing::debug!(entries, "io_uring created");
        Ok(Self {
            ring: SharedRing(ring),
            sq: Mutex::new(()),
            cq: Mutex::new(()),
            unflushed: AtomicBool::new(false),
            completion_batch: completion_batch.max(1),
        })
    }

    /// Create a ring sized from the scheduler configuration
    pub fn from_config(config: &SchedulerConfig) -> IoResult<Self> {
        let entries = config.max_concurrent.next_power_of_two().min(u32::MAX as usize) as u32;
        Self::new(entries, config.completion_batch)
    }

    fn prepare(cmd: &IoCommand) -> squeue::Entry {
        let fd = types::Fd(cmd.fd);
        let entry = match cmd.kind {
            OpKind::Read => opcode::Read::new(fd, cmd.buf, cmd.len as u32)
                .offset(cmd.offset)
                .build(),
            OpKind::Write => opcode::Write::new(fd, cmd.buf, cmd.len as u32)
                .offset(cmd.offset)
                .build(),
        };
        entry.user_data(cmd.id.0)
    }

    /// Hand queued entries to the kernel
    ///
    /// Callers hold the `sq` lock. EBUSY (completion queue overflow) leaves
    /// the entries queued for the next reap to flush.
    fn flush(&self) -> io::Result<()> {
        loop {
            match self.ring.0.submitter().submit() {
                Ok(_) => {
                    // Safety: the caller holds the sq lock
                    let pending = !unsafe { self.ring.0.submission_shared() }.is_empty();
                    self.unflushed.store(pending, Ordering::Release);
                    return Ok(());
                }
                Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {
                    self.unflushed.store(true, Ordering::Release);
                    return Ok(());
                }
                Err(e) if matches!(e.raw_os_error(), Some(libc::EAGAIN) | Some(libc::EINTR)) => {
                    std::thread::yield_now();
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Move finished entries into `out`, skipping interrupt NOPs
    fn drain_cq(&self, out: &mut Vec<IoEvent>, limit: usize) -> usize {
        // Safety: the caller holds the cq lock
        let mut cq = unsafe { self.ring.0.completion_shared() };
        cq.sync();
        let mut n = 0;
        while n < limit {
            let Some(cqe) = cq.next() else { break };
            if cqe.user_data() == INTERRUPT_TOKEN {
                continue;
            }
            out.push(IoEvent {
                id: RequestId(cqe.user_data()),
                result: cqe.result() as i64,
            });
            n += 1;
        }
        n
    }
}

impl AioBackend for UringAio {
    fn name(&self) -> &'static str {
        "io-uring"
    }

    fn submit(&self, batch: &[IoCommand]) -> io::Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }

        let _sq = self.sq.lock();
        let mut pushed = 0;
        {
            // Safety: the sq lock is held
            let mut sq = unsafe { self.ring.0.submission_shared() };
            sq.sync();
            for cmd in batch {
                let entry = Self::prepare(cmd);
                // Safety: the buffer stays valid until its completion is
                // reaped per the IoCommand contract
                if unsafe { sq.push(&entry) }.is_err() {
                    break;
                }
                pushed += 1;
            }
        }
        if pushed == 0 {
            return Err(io::Error::from_raw_os_error(libc::EAGAIN));
        }

        self.flush()?;
        Ok(pushed)
    }

    fn reap(
        &self,
        out: &mut Vec<IoEvent>,
        min: usize,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        if self.unflushed.load(Ordering::Acquire) {
            let _sq = self.sq.lock();
            self.flush()?;
        }

        let _cq = self.cq.lock();
        let limit = self.completion_batch;
        let mut n = self.drain_cq(out, limit);
        if n >= min.min(limit) {
            return Ok(n);
        }

        let want = min.min(limit) - n;
        let waited = match timeout {
            None => self.ring.0.submitter().submit_and_wait(want),
            Some(d) => {
                let ts = types::Timespec::new()
                    .sec(d.as_secs())
                    .nsec(d.subsec_nanos());
                let args = types::SubmitArgs::new().timespec(&ts);
                self.ring.0.submitter().submit_with_args(want, &args)
            }
        };
        match waited {
            Ok(_) => {}
            Err(e)
                if matches!(
                    e.raw_os_error(),
                    Some(libc::ETIME) | Some(libc::EINTR) | Some(libc::EBUSY)
                ) => {}
            Err(e) => return Err(e),
        }

        n += self.drain_cq(out, limit - n);
        Ok(n)
    }

    fn supports_notify_fd(&self) -> bool {
        true
    }

    fn set_notify_fd(&self, fd: RawFd) -> io::Result<()> {
        self.ring.0.submitter().register_eventfd(fd)
    }

    fn submit_may_block(&self) -> bool {
        false
    }

    fn interrupt(&self) {
        let _sq = self.sq.lock();
        let nop = opcode::Nop::new().build().user_data(INTERRUPT_TOKEN);
        {
            // Safety: the sq lock is held and a NOP references no memory
            let mut sq = unsafe { self.ring.0.submission_shared() };
            if unsafe { sq.push(&nop) }.is_err() {
                // A full queue already guarantees a wakeup once it drains
                return;
            }
        }
        if let Err(e) = self.flush() {
            tracing::warn!(error = %e, "failed to submit io_uring interrupt");
        }
    }
}
