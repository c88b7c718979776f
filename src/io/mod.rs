//! Asynchronous disk I/O layer
//!
//! - [`AioBackend`]: the OS async I/O facility, with kernel AIO
//!   ([`LinuxAio`]) and io_uring ([`UringAio`]) implementations
//! - [`scheduler`]: ordering, batching and completion dispatch on top of a
//!   backend
//! - Collaborators the scheduler plugs into: an [`EventLoop`], a
//!   [`BlockingPool`] and a cross-thread [`Notifier`]
//!
//! Linux only: completion signalling relies on eventfd.

pub mod aligned_buffer;
pub mod error;
pub mod event_loop;
pub mod linux_aio;
pub mod notify;
pub mod pool;
pub mod posix_aio;
pub mod scheduler;
pub mod traits;
pub mod uring;

pub use aligned_buffer::{AlignedBuffer, BUFFER_ALIGN};
pub use error::{fatal, IoError, IoResult};
pub use event_loop::{EventLoop, Interest, PollLoop, Readiness};
pub use linux_aio::LinuxAio;
pub use notify::Notifier;
pub use pool::{BlockingPool, Job};
pub use traits::{AioBackend, IoCommand, IoEvent};
pub use uring::UringAio;

pub use scheduler::{
    Completion, CompleteMode, IoMode, OpKind, Request, RequestId, Scheduler, SchedulerConfig,
    SubmitMode, BLOCK_SIZE,
};
