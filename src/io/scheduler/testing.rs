//! Scripted backend for unit tests
//!
//! Records every accepted command and only completes them when told to
//! (or immediately, in auto-complete mode). Submit failures and partial
//! acceptance can be injected ahead of time, as can reap failures.

use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::io::traits::{AioBackend, IoCommand, IoEvent};

use super::RequestId;

#[derive(Default)]
struct Script {
    failures: VecDeque<i32>,
    reap_failures: VecDeque<i32>,
    limits: VecDeque<usize>,
    accepted: Vec<IoCommand>,
    submit_calls: usize,
    ready: VecDeque<IoEvent>,
    auto_complete: bool,
}

pub(crate) struct ScriptedBackend {
    script: Mutex<Script>,
    cond: Condvar,
    notify_fd: AtomicI32,
    notify_capable: bool,
    may_block: bool,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Self::with_capabilities(true, false)
    }

    pub fn with_capabilities(notify_capable: bool, may_block: bool) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(Script::default()),
            cond: Condvar::new(),
            notify_fd: AtomicI32::new(-1),
            notify_capable,
            may_block,
        })
    }

    /// Complete every accepted command in full as soon as it is accepted
    pub fn auto_complete(&self) {
        self.script.lock().auto_complete = true;
    }

    /// Fail the next submit call with `errno`
    pub fn fail_next_submit(&self, errno: i32) {
        self.script.lock().failures.push_back(errno);
    }

    /// Fail the next reap call with `errno`
    pub fn fail_next_reap(&self, errno: i32) {
        self.script.lock().reap_failures.push_back(errno);
    }

    /// Accept at most `n` commands on the next submit call
    pub fn limit_next_submit(&self, n: usize) {
        self.script.lock().limits.push_back(n);
    }

    /// Report `id` finished with `result`
    pub fn complete(&self, id: RequestId, result: i64) {
        self.script.lock().ready.push_back(IoEvent { id, result });
        self.signal();
    }

    /// Complete every accepted command in full
    pub fn complete_all(&self) {
        let mut script = self.script.lock();
        let accepted: Vec<IoEvent> = script
            .accepted
            .iter()
            .map(|cmd| IoEvent {
                id: cmd.id,
                result: cmd.len as i64,
            })
            .collect();
        script.ready.extend(accepted);
        drop(script);
        self.signal();
    }

    pub fn accepted(&self) -> Vec<IoCommand> {
        self.script.lock().accepted.clone()
    }

    pub fn accepted_ids(&self) -> Vec<RequestId> {
        self.script.lock().accepted.iter().map(|c| c.id).collect()
    }

    pub fn submit_calls(&self) -> usize {
        self.script.lock().submit_calls
    }

    fn signal(&self) {
        self.cond.notify_all();
        let fd = self.notify_fd.load(Ordering::Acquire);
        if fd >= 0 {
            let one: u64 = 1;
            // Safety: writes 8 bytes from a live u64 to an eventfd
            unsafe {
                libc::write(
                    fd,
                    &one as *const u64 as *const libc::c_void,
                    std::mem::size_of::<u64>(),
                );
            }
        }
    }
}

impl AioBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn submit(&self, batch: &[IoCommand]) -> io::Result<usize> {
        let mut script = self.script.lock();
        script.submit_calls += 1;
        if let Some(errno) = script.failures.pop_front() {
            return Err(io::Error::from_raw_os_error(errno));
        }

        let n = batch
            .len()
            .min(script.limits.pop_front().unwrap_or(usize::MAX));
        script.accepted.extend_from_slice(&batch[..n]);
        if script.auto_complete {
            let events: Vec<IoEvent> = batch[..n]
                .iter()
                .map(|cmd| IoEvent {
                    id: cmd.id,
                    result: cmd.len as i64,
                })
                .collect();
            script.ready.extend(events);
            drop(script);
            self.signal();
        }
        Ok(n)
    }

    fn reap(
        &self,
        out: &mut Vec<IoEvent>,
        min: usize,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        let mut script = self.script.lock();
        if let Some(errno) = script.reap_failures.pop_front() {
            return Err(io::Error::from_raw_os_error(errno));
        }
        if script.ready.len() < min {
            match timeout {
                Some(timeout) => {
                    self.cond.wait_for(&mut script, timeout);
                }
                None => self.cond.wait(&mut script),
            }
        }
        let n = script.ready.len();
        out.extend(script.ready.drain(..));
        Ok(n)
    }

    fn supports_notify_fd(&self) -> bool {
        self.notify_capable
    }

    fn set_notify_fd(&self, fd: RawFd) -> io::Result<()> {
        self.notify_fd.store(fd, Ordering::Release);
        Ok(())
    }

    fn submit_may_block(&self) -> bool {
        self.may_block
    }

    fn interrupt(&self) {
        self.cond.notify_all();
    }
}
