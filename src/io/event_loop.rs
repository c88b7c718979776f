//! Event loop integration
//!
//! The scheduler does not own an event loop; it registers its wakeup fd
//! with whatever loop the embedding engine runs. [`PollLoop`] is a small
//! `poll(2)` loop for tools and tests.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use super::error::{IoError, IoResult};

/// Readiness the caller wants to hear about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const READABLE: Interest = Interest {
        readable: true,
        writable: false,
    };
    pub const WRITABLE: Interest = Interest {
        readable: false,
        writable: true,
    };

    fn poll_events(&self) -> libc::c_short {
        let mut events = 0;
        if self.readable {
            events |= libc::POLLIN;
        }
        if self.writable {
            events |= libc::POLLOUT;
        }
        events
    }
}

/// Readiness reported for a watched fd
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    /// Error or hangup
    pub closed: bool,
}

impl Readiness {
    fn from_revents(revents: libc::c_short) -> Self {
        Self {
            readable: revents & libc::POLLIN != 0,
            writable: revents & libc::POLLOUT != 0,
            closed: revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0,
        }
    }
}

/// Callback invoked on the loop's thread when a watched fd is ready
pub type ReadyCallback = Box<dyn FnMut(Readiness)>;

/// The owning thread's event loop
pub trait EventLoop {
    /// Invoke `callback` whenever `fd` becomes ready for `interest`
    fn watch_resource(
        &mut self,
        fd: RawFd,
        interest: Interest,
        callback: ReadyCallback,
    ) -> IoResult<()>;

    /// Stop watching `fd`
    fn forget_resource(&mut self, fd: RawFd);
}

struct Watch {
    fd: RawFd,
    interest: Interest,
    callback: ReadyCallback,
}

/// Level-triggered event loop over `poll(2)`
#[derive(Default)]
pub struct PollLoop {
    watches: Vec<Watch>,
}

impl PollLoop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of watched fds
    pub fn len(&self) -> usize {
        self.watches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watches.is_empty()
    }

    /// Wait up to `timeout` (`None` = forever) for readiness and dispatch
    /// callbacks; returns how many fired
    pub fn turn(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        let mut fds: Vec<libc::pollfd> = self
            .watches
            .iter()
            .map(|w| libc::pollfd {
                fd: w.fd,
                events: w.interest.poll_events(),
                revents: 0,
            })
            .collect();
        let timeout_ms = match timeout {
            None => -1,
            Some(d) => d.as_micros().div_ceil(1000).min(i32::MAX as u128) as libc::c_int,
        };

        // Safety: fds is a valid array of fds.len() pollfd entries
        let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(0);
            }
            return Err(err);
        }

        let mut fired = 0;
        for (watch, pfd) in self.watches.iter_mut().zip(&fds) {
            if pfd.revents != 0 {
                (watch.callback)(Readiness::from_revents(pfd.revents));
                fired += 1;
            }
        }
        Ok(fired)
    }
}

impl EventLoop for PollLoop {
    fn watch_resource(
        &mut self,
        fd: RawFd,
        interest: Interest,
        callback: ReadyCallback,
    ) -> IoResult<()> {
        if self.watches.iter().any(|w| w.fd == fd) {
            return Err(IoError::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("fd {fd} already watched"),
            )));
        }
        self.watches.push(Watch {
            fd,
            interest,
            callback,
        });
        Ok(())
    }

    fn forget_resource(&mut self, fd: RawFd) {
        self.watches.retain(|w| w.fd != fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::notify::Notifier;
    use std::cell::Cell;
    use std::os::unix::io::AsRawFd;
    use std::rc::Rc;

    #[test]
    fn test_callback_fires_on_readable() {
        let notifier = Notifier::new().unwrap();
        let hits = Rc::new(Cell::new(0));
        let counter = hits.clone();

        let mut event_loop = PollLoop::new();
        event_loop
            .watch_resource(
                notifier.as_raw_fd(),
                Interest::READABLE,
                Box::new(move |ready| {
                    assert!(ready.readable);
                    counter.set(counter.get() + 1);
                }),
            )
            .unwrap();

        assert_eq!(event_loop.turn(Some(Duration::from_millis(1))).unwrap(), 0);
        notifier.notify();
        assert_eq!(event_loop.turn(Some(Duration::from_millis(100))).unwrap(), 1);
        assert_eq!(hits.get(), 1);

        event_loop.forget_resource(notifier.as_raw_fd());
        assert!(event_loop.is_empty());
        assert_eq!(event_loop.turn(Some(Duration::ZERO)).unwrap(), 0);
    }

    #[test]
    fn test_double_watch_rejected() {
        let notifier = Notifier::new().unwrap();
        let mut event_loop = PollLoop::new();
        let fd = notifier.as_raw_fd();
        event_loop
            .watch_resource(fd, Interest::READABLE, Box::new(|_| {}))
            .unwrap();
        assert!(event_loop
            .watch_resource(fd, Interest::READABLE, Box::new(|_| {}))
            .is_err());
    }
}
