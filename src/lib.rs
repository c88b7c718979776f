//! diskq - asynchronous disk I/O scheduler for embedded storage engines
//!
//! Features:
//! - Conflict tracking per block: overlapping requests never race
//! - Read/write/conflicting reorder buckets with fair interleaving
//! - Kernel AIO or io_uring, with inline, threaded or pooled submission
//! - Eventfd-driven or polling-thread completion delivery

#[cfg(not(target_os = "linux"))]
compile_error!("diskq requires Linux (eventfd and kernel AIO)");

pub mod io;

pub use io::{
    AlignedBuffer, Completion, IoError, IoMode, IoResult, OpKind, Request, RequestId, Scheduler,
    SchedulerConfig,
};
