//! Blocking POSIX transfers
//!
//! Used by the pooled submission strategy, which emulates asynchronous I/O
//! by running `pread`/`pwrite` on worker threads.

use std::io;

use super::scheduler::OpKind;
use super::traits::IoCommand;

/// Perform one transfer synchronously
///
/// Returns bytes transferred or a negated errno, the same encoding a kernel
/// completion uses. A transfer that stops early (end of file) reports the
/// bytes it did move and is rejected by the scheduler as short.
pub fn transfer(cmd: &IoCommand) -> i64 {
    let mut done = 0usize;
    while done < cmd.len {
        // Safety: cmd.buf is valid for cmd.len bytes for the command's
        // lifetime, and no other in-flight command touches the same blocks
        let ret = unsafe {
            let buf = cmd.buf.add(done);
            let remaining = cmd.len - done;
            let offset = (cmd.offset + done as u64) as libc::off_t;
            match cmd.kind {
                OpKind::Read => {
                    libc::pread(cmd.fd, buf as *mut libc::c_void, remaining, offset)
                }
                OpKind::Write => {
                    libc::pwrite(cmd.fd, buf as *const libc::c_void, remaining, offset)
                }
            }
        };

        if ret < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(errno) => return -(errno as i64),
                None => return -(libc::EIO as i64),
            }
        }
        if ret == 0 {
            break;
        }
        done += ret as usize;
    }
    done as i64
}
