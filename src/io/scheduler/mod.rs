//! Disk I/O scheduler
//!
//! Accepts reads and writes against raw files or block devices, hands them
//! to the OS asynchronous I/O facility, and guarantees that operations on
//! overlapping blocks never run concurrently out of submission order.
//!
//! # Pipeline
//! - [`ReorderQueue`]: pending requests, split into read-ready, write-ready
//!   and conflicting buckets with quota-based fair interleaving
//! - [`DependencyTracker`]: per-block locks held by admitted requests
//! - [`SubmitStrategy`](submit::SubmitStrategy): inline, pooled or threaded
//!   hand-off to the backend
//! - [`CompleteStrategy`](complete::CompleteStrategy): eventfd-driven or
//!   polling-thread completion delivery
//! - [`Scheduler`]: composes the above on one owning thread

pub mod block;
pub mod complete;
pub mod config;
pub mod metrics;
pub mod queue;
#[allow(clippy::module_inception)]
pub mod scheduler;
pub mod submit;
#[cfg(test)]
pub(crate) mod testing;
pub mod tracker;

pub use block::{overlapping_blocks, Blocks};
pub use config::{SchedulerConfig, BLOCK_SIZE};
pub use metrics::{IoMetrics, IoMetricsSnapshot, LatencyHistogram};
pub use queue::{Bucket, QueueEntry, ReorderQueue};
pub use scheduler::{CompleteMode, IoMode, Scheduler, SubmitMode};
pub use tracker::DependencyTracker;

use std::fmt;
use std::os::unix::io::RawFd;

use super::aligned_buffer::AlignedBuffer;
use super::error::{IoError, IoResult};

/// I/O operation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// Read data from storage into the request buffer
    Read,
    /// Write the request buffer to storage
    Write,
}

impl OpKind {
    /// Syscall-style name used in diagnostics
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Read => "read",
            OpKind::Write => "write",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduler-assigned request identifier
///
/// Identifiers increase monotonically in submission order, which is what
/// the reorder queue relies on for FIFO ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The disk region an operation touches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub fd: RawFd,
    pub kind: OpKind,
    pub offset: u64,
    pub len: usize,
}

impl Extent {
    pub fn new(fd: RawFd, kind: OpKind, offset: u64, len: usize) -> Self {
        Self {
            fd,
            kind,
            offset,
            len,
        }
    }

    /// Block addresses this extent overlaps
    #[inline]
    pub fn blocks(&self, block_size: u64) -> Blocks {
        overlapping_blocks(self.offset, self.len, block_size)
    }
}

/// A read or write waiting to be submitted
///
/// The request owns its buffer until completion, when ownership returns to
/// the caller through [`Completion`].
#[derive(Debug)]
pub struct Request<T> {
    pub(crate) extent: Extent,
    pub(crate) buffer: AlignedBuffer,
    pub(crate) token: T,
}

impl<T> Request<T> {
    /// Read `len` bytes at `offset` into `buffer`
    pub fn read(
        fd: RawFd,
        buffer: AlignedBuffer,
        offset: u64,
        len: usize,
        token: T,
    ) -> IoResult<Self> {
        Self::new(Extent::new(fd, OpKind::Read, offset, len), buffer, token)
    }

    /// Write the first `len` bytes of `buffer` at `offset`
    pub fn write(
        fd: RawFd,
        buffer: AlignedBuffer,
        offset: u64,
        len: usize,
        token: T,
    ) -> IoResult<Self> {
        Self::new(Extent::new(fd, OpKind::Write, offset, len), buffer, token)
    }

    fn new(extent: Extent, buffer: AlignedBuffer, token: T) -> IoResult<Self> {
        if extent.len > buffer.capacity() {
            return Err(IoError::RequestTooLarge {
                len: extent.len,
                capacity: buffer.capacity(),
            });
        }
        Ok(Self {
            extent,
            buffer,
            token,
        })
    }

    pub fn extent(&self) -> &Extent {
        &self.extent
    }

    pub fn token(&self) -> &T {
        &self.token
    }
}

/// A finished request handed back to the caller
#[derive(Debug)]
pub struct Completion<T> {
    /// Token supplied with the request
    pub token: T,
    pub fd: RawFd,
    pub kind: OpKind,
    pub offset: u64,
    /// The request buffer; for reads its length is the bytes read
    pub buffer: AlignedBuffer,
    /// Bytes transferred (always the requested length)
    pub bytes: usize,
}
