//! IO error types and the fatal failure path

use thiserror::Error;

/// IO operation errors
#[derive(Error, Debug)]
pub enum IoError {
    /// Standard IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Creating or tearing down an OS resource failed
    #[error("{op} failed: {source}")]
    Setup {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The backend rejected a batch for a reason other than backpressure
    #[error("{op} rejected a batch of {batch}: {source}")]
    Submit {
        op: &'static str,
        batch: usize,
        #[source]
        source: std::io::Error,
    },

    /// Waiting for completions failed
    #[error("{op} failed to reap completions: {source}")]
    Reap {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The backend reported a failed operation
    #[error("{op} at offset {offset} on fd {fd} failed: {source}")]
    Completion {
        op: &'static str,
        fd: i32,
        offset: u64,
        #[source]
        source: std::io::Error,
    },

    /// The backend transferred fewer bytes than requested
    #[error("short {op} on fd {fd} at offset {offset}: expected {expected} bytes, got {actual}")]
    ShortTransfer {
        op: &'static str,
        fd: i32,
        offset: u64,
        expected: usize,
        actual: usize,
    },

    /// Buffer alignment error
    #[error("Buffer not aligned to {expected} bytes (got offset {actual})")]
    Alignment { expected: usize, actual: usize },

    /// Buffer size error
    #[error("Buffer size {size} not a multiple of {alignment}")]
    BufferSize { size: usize, alignment: usize },

    /// A configuration value the scheduler cannot run with
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Request length does not fit the buffer it names
    #[error("request of {len} bytes exceeds buffer capacity {capacity}")]
    RequestTooLarge { len: usize, capacity: usize },
}

/// Result type for IO operations
pub type IoResult<T> = Result<T, IoError>;

/// Abort on an unrecoverable disk-layer failure.
///
/// Logs the diagnostic and aborts the process, whichever thread it runs on.
/// Auxiliary threads never call this; they hand their error to the owning
/// thread, which does. Unit tests panic instead so the path is observable.
#[cold]
#[track_caller]
pub fn fatal(err: IoError) -> ! {
    tracing::error!(error = %err, "unrecoverable disk I/O failure");
    if cfg!(test) {
        panic!("diskq: {err}");
    }
    std::process::abort();
}
