//! Cross-thread wakeup for the owning thread

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use super::error::{IoError, IoResult};

/// Non-blocking eventfd
///
/// Auxiliary threads and the kernel signal it; the owning thread's event
/// loop watches it and resets it before draining whatever was posted.
#[derive(Debug)]
pub struct Notifier {
    fd: OwnedFd,
}

impl Notifier {
    pub fn new() -> IoResult<Self> {
        // Safety: plain syscall, the returned fd is checked before use
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(IoError::Setup {
                op: "eventfd",
                source: io::Error::last_os_error(),
            });
        }
        // Safety: fd is a freshly created descriptor owned by nobody else
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self { fd })
    }

    /// Make the fd readable
    pub fn notify(&self) {
        let one: u64 = 1;
        loop {
            // Safety: writes 8 bytes from a live u64
            let ret = unsafe {
                libc::write(
                    self.fd.as_raw_fd(),
                    &one as *const u64 as *const libc::c_void,
                    std::mem::size_of::<u64>(),
                )
            };
            if ret >= 0 {
                return;
            }
            match io::Error::last_os_error().raw_os_error() {
                Some(libc::EINTR) => continue,
                // Counter saturated: the fd is readable already
                Some(libc::EAGAIN) => return,
                _ => {
                    tracing::warn!(error = %io::Error::last_os_error(), "eventfd write failed");
                    return;
                }
            }
        }
    }

    /// Clear readiness; returns the number of notifications consumed
    pub fn reset(&self) -> u64 {
        let mut count: u64 = 0;
        loop {
            // Safety: reads 8 bytes into a live u64
            let ret = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    &mut count as *mut u64 as *mut libc::c_void,
                    std::mem::size_of::<u64>(),
                )
            };
            if ret >= 0 {
                return count;
            }
            if io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
                return 0;
            }
        }
    }
}

impl AsRawFd for Notifier {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
