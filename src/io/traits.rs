//! Backend trait for the OS asynchronous I/O facility

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use super::scheduler::{OpKind, RequestId};

/// A prepared operation handed to a backend.
///
/// `buf` points into an [`AlignedBuffer`](super::AlignedBuffer) owned by the
/// scheduler. The scheduler keeps that buffer alive and untouched until the
/// matching [`IoEvent`] has been processed, and the dependency tracker
/// guarantees no other in-flight command writes the same blocks, so the
/// pointer may be used from whichever thread performs the transfer.
#[derive(Debug, Clone, Copy)]
pub struct IoCommand {
    /// Scheduler request this command belongs to
    pub id: RequestId,
    pub fd: RawFd,
    pub kind: OpKind,
    pub buf: *mut u8,
    pub len: usize,
    pub offset: u64,
}

// Safety: see the type-level docs; ownership of the pointee is handed over
// for the command's lifetime.
unsafe impl Send for IoCommand {}

/// A finished command as reported by a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoEvent {
    pub id: RequestId,
    /// Bytes transferred, or a negated errno
    pub result: i64,
}

/// The OS async-I/O context.
///
/// Implementations must be usable from several threads at once: a polling
/// thread may sit in [`reap`](AioBackend::reap) while another thread calls
/// [`submit`](AioBackend::submit).
pub trait AioBackend: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Hand a batch to the facility.
    ///
    /// Returns how many commands from the front of `batch` were accepted.
    /// A transient error (see [`is_transient`]) means nothing was accepted
    /// and the caller may retry the same commands.
    fn submit(&self, batch: &[IoCommand]) -> io::Result<usize>;

    /// Collect finished commands into `out`.
    ///
    /// Waits until at least `min` are available or `timeout` elapses
    /// (`None` waits indefinitely). Returns the number appended.
    fn reap(&self, out: &mut Vec<IoEvent>, min: usize, timeout: Option<Duration>)
        -> io::Result<usize>;

    /// Whether completions can be signalled on an eventfd
    fn supports_notify_fd(&self) -> bool;

    /// Signal `fd` (an eventfd) on every completion from now on
    fn set_notify_fd(&self, fd: RawFd) -> io::Result<()>;

    /// Whether `submit` can block the calling thread for long periods
    fn submit_may_block(&self) -> bool;

    /// Wake a thread blocked in `reap`, if the backend has a way to
    fn interrupt(&self) {}
}

/// Errors that mean "the facility is busy, try again later"
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EAGAIN) | Some(libc::EBUSY) | Some(libc::EINTR)
    ) || matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(is_transient(&io::Error::from_raw_os_error(libc::EAGAIN)));
        assert!(is_transient(&io::Error::from_raw_os_error(libc::EBUSY)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::WouldBlock)));
        assert!(!is_transient(&io::Error::from_raw_os_error(libc::EIO)));
        assert!(!is_transient(&io::Error::from_raw_os_error(libc::EBADF)));
    }
}
