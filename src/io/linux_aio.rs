//! Linux kernel AIO backend
//!
//! Talks to the kernel through the raw `io_setup`/`io_submit`/
//! `io_getevents`/`io_destroy` syscalls. Both `io_submit` and
//! `io_getevents` are safe to call concurrently on one context, so a
//! polling thread can wait for completions while the owning thread submits.
//!
//! A thread blocked in `io_getevents` is woken by submitting a poll iocb
//! against a private eventfd that is always readable. Kernels without
//! `IOCB_CMD_POLL` (before 4.18) fall back to the reap timeout.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use super::error::{fatal, IoError, IoResult};
use super::notify::Notifier;
use super::scheduler::config::SchedulerConfig;
use super::scheduler::{OpKind, RequestId};
use super::traits::{AioBackend, IoCommand, IoEvent};

/// `aio_context_t`
type AioContext = libc::c_ulong;

const IOCB_CMD_PREAD: u16 = 0;
const IOCB_CMD_PWRITE: u16 = 1;
const IOCB_CMD_POLL: u16 = 5;

/// `aio_data` of the poll iocb posted by `interrupt`
const INTERRUPT_TOKEN: u64 = u64::MAX;

/// Set in `aio_flags` to have the kernel signal `aio_resfd` on completion
const IOCB_FLAG_RESFD: u32 = 1 << 0;

/// `struct iocb` from `linux/aio_abi.h`
#[repr(C)]
#[derive(Debug, Default)]
struct Iocb {
    aio_data: u64,
    #[cfg(target_endian = "little")]
    aio_key: u32,
    #[cfg(target_endian = "little")]
    aio_rw_flags: i32,
    #[cfg(target_endian = "big")]
    aio_rw_flags: i32,
    #[cfg(target_endian = "big")]
    aio_key: u32,
    aio_lio_opcode: u16,
    aio_reqprio: i16,
    aio_fildes: u32,
    aio_buf: u64,
    aio_nbytes: u64,
    aio_offset: i64,
    aio_reserved2: u64,
    aio_flags: u32,
    aio_resfd: u32,
}

/// `struct io_event` from `linux/aio_abi.h`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct RawEvent {
    data: u64,
    obj: u64,
    res: i64,
    res2: i64,
}

const _: () = assert!(std::mem::size_of::<Iocb>() == 64);
const _: () = assert!(std::mem::size_of::<RawEvent>() == 32);

impl Iocb {
    fn prepare(cmd: &IoCommand, resfd: RawFd) -> Self {
        let mut iocb = Iocb {
            aio_data: cmd.id.0,
            aio_lio_opcode: match cmd.kind {
                OpKind::Read => IOCB_CMD_PREAD,
                OpKind::Write => IOCB_CMD_PWRITE,
            },
            aio_fildes: cmd.fd as u32,
            aio_buf: cmd.buf as u64,
            aio_nbytes: cmd.len as u64,
            aio_offset: cmd.offset as i64,
            ..Default::default()
        };
        if resfd >= 0 {
            iocb.aio_flags = IOCB_FLAG_RESFD;
            iocb.aio_resfd = resfd as u32;
        }
        iocb
    }

    /// Poll for readability of `fd`; completes as soon as `fd` is readable
    fn interrupt(fd: RawFd) -> Self {
        Iocb {
            aio_data: INTERRUPT_TOKEN,
            aio_lio_opcode: IOCB_CMD_POLL,
            aio_fildes: fd as u32,
            aio_buf: libc::POLLIN as u64,
            ..Default::default()
        }
    }
}

/// Kernel AIO context
pub struct LinuxAio {
    ctx: AioContext,
    /// eventfd signalled on completion, or -1
    notify_fd: AtomicI32,
    /// Upper bound on events returned by one `reap`
    completion_batch: usize,
    /// Permanently readable eventfd targeted by interrupt polls
    wake: Notifier,
}

impl LinuxAio {
    /// Create a context able to hold `max_events` in-flight operations
    pub fn new(max_events: usize, completion_batch: usize) -> IoResult<Self> {
        let wake = Notifier::new()?;
        wake.notify();

        let mut ctx: AioContext = 0;
        // Safety: ctx is a valid out-pointer and must be zero on entry
        let ret = unsafe {
            libc::syscall(
                libc::SYS_io_setup,
                max_events as libc::c_long,
                &mut ctx as *mut AioContext,
            )
        };
        if ret < 0 {
            return Err(IoError::Setup {
                op: "io_setup",
                source: io::Error::last_os_error(),
            });
        }

        tracing::debug!(max_events, "kernel AIO context created");
        Ok(Self {
            ctx,
            notify_fd: AtomicI32::new(-1),
            completion_batch: completion_batch.max(1),
            wake,
        })
    }

    /// Create a context sized from the scheduler configuration
    pub fn from_config(config: &SchedulerConfig) -> IoResult<Self> {
        Self::new(config.max_concurrent, config.completion_batch)
    }

    fn post_interrupt(&self) -> io::Result<()> {
        let mut iocb = Iocb::interrupt(self.wake.as_raw_fd());
        let mut ptr = &mut iocb as *mut Iocb;
        // Safety: one pointer to a live iocb, copied by the kernel before
        // returning; the eventfd it polls lives as long as the context
        let ret = unsafe {
            libc::syscall(
                libc::SYS_io_submit,
                self.ctx,
                1 as libc::c_long,
                &mut ptr as *mut *mut Iocb,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl AioBackend for LinuxAio {
    fn name(&self) -> &'static str {
        "linux-aio"
    }

    fn submit(&self, batch: &[IoCommand]) -> io::Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }

        let resfd = self.notify_fd.load(Ordering::Acquire);
        let mut iocbs: Vec<Iocb> = batch.iter().map(|cmd| Iocb::prepare(cmd, resfd)).collect();
        let mut ptrs: Vec<*mut Iocb> = iocbs.iter_mut().map(|iocb| iocb as *mut Iocb).collect();

        // Safety: every pointer refers to a live iocb; the kernel copies them
        // before returning, and the buffers they name outlive the operation
        // per the IoCommand contract
        let ret = unsafe {
            libc::syscall(
                libc::SYS_io_submit,
                self.ctx,
                ptrs.len() as libc::c_long,
                ptrs.as_mut_ptr(),
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ret as usize)
    }

    fn reap(
        &self,
        out: &mut Vec<IoEvent>,
        min: usize,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        let max = self.completion_batch;
        let mut events = vec![RawEvent::default(); max];
        let ts = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        });
        let ts_ptr = ts
            .as_ref()
            .map_or(std::ptr::null(), |ts| ts as *const libc::timespec);

        // Safety: events has room for `max` entries and ts_ptr is null or
        // points at a timespec that lives across the call
        let ret = unsafe {
            libc::syscall(
                libc::SYS_io_getevents,
                self.ctx,
                min.min(max) as libc::c_long,
                max as libc::c_long,
                events.as_mut_ptr(),
                ts_ptr,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(0);
            }
            return Err(err);
        }

        let before = out.len();
        out.extend(
            events[..ret as usize]
                .iter()
                .filter(|ev| ev.data != INTERRUPT_TOKEN)
                .map(|ev| IoEvent {
                    id: RequestId(ev.data),
                    result: ev.res,
                }),
        );
        Ok(out.len() - before)
    }

    fn supports_notify_fd(&self) -> bool {
        true
    }

    fn set_notify_fd(&self, fd: RawFd) -> io::Result<()> {
        self.notify_fd.store(fd, Ordering::Release);
        Ok(())
    }

    fn submit_may_block(&self) -> bool {
        true
    }

    fn interrupt(&self) {
        if let Err(e) = self.post_interrupt() {
            tracing::debug!(error = %e, "AIO poll unavailable, reaper wakes on its timeout");
        }
    }
}

impl Drop for LinuxAio {
    fn drop(&mut self) {
        // io_destroy waits for every outstanding operation on the context
        // Safety: ctx came from a successful io_setup and is destroyed once
        let ret = unsafe { libc::syscall(libc::SYS_io_destroy, self.ctx) };
        if ret < 0 && !std::thread::panicking() {
            fatal(IoError::Setup {
                op: "io_destroy",
                source: io::Error::last_os_error(),
            });
        }
    }
}
