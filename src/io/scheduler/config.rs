//! I/O scheduler configuration

use std::time::Duration;

use crate::io::error::{IoError, IoResult};

/// Granularity of conflict detection and alignment unit for direct I/O
pub const BLOCK_SIZE: u64 = 4096;

/// Default size of the backend context (maximum concurrent operations)
pub const DEFAULT_MAX_CONCURRENT: usize = 128;

/// Default bound on requests in flight for inline and threaded submission
pub const DEFAULT_TARGET_QUEUE_DEPTH: usize = 64;

/// Default maximum completions collected per reap
pub const DEFAULT_COMPLETION_BATCH: usize = 32;

/// Default batch size the reorder queue's fairness quotas are computed against
pub const DEFAULT_FAIRNESS_BATCH: usize = 32;

/// Default cap on commands handed to the submission thread at once
pub const DEFAULT_SUBMIT_BATCH: usize = 32;

/// Default wait bound for the completion polling thread
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 10;

/// Configuration for the I/O scheduler
///
/// Values are fixed for the lifetime of a scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Conflict-detection granularity in bytes (power of two)
    pub block_size: u64,

    /// Size of the backend context
    pub max_concurrent: usize,

    /// Requests allowed in flight at once (inline and threaded submission)
    pub target_queue_depth: usize,

    /// Maximum completions collected per reap
    pub completion_batch: usize,

    /// Batch size the fairness quotas are proportioned against
    pub fairness_batch: usize,

    /// Maximum commands per batch on the submission thread
    pub submit_batch: usize,

    /// How long the polling thread waits before rechecking for shutdown
    pub poll_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            block_size: BLOCK_SIZE,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            target_queue_depth: DEFAULT_TARGET_QUEUE_DEPTH,
            completion_batch: DEFAULT_COMPLETION_BATCH,
            fairness_batch: DEFAULT_FAIRNESS_BATCH,
            submit_batch: DEFAULT_SUBMIT_BATCH,
            poll_timeout: Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS),
        }
    }
}

impl SchedulerConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the block size
    ///
    /// # Panics
    /// Panics if `size` is not a power of two or exceeds [`BLOCK_SIZE`],
    /// the alignment every request buffer is allocated with
    pub fn with_block_size(mut self, size: u64) -> Self {
        assert!(size.is_power_of_two(), "block size must be a power of two");
        assert!(size <= BLOCK_SIZE, "block size {size} exceeds buffer alignment {BLOCK_SIZE}");
        self.block_size = size;
        self
    }

    /// Set the backend context size
    pub fn with_max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = n.max(1);
        self
    }

    /// Set the target queue depth
    pub fn with_target_queue_depth(mut self, depth: usize) -> Self {
        self.target_queue_depth = depth.max(1);
        self
    }

    /// Set the completion batch size
    pub fn with_completion_batch(mut self, n: usize) -> Self {
        self.completion_batch = n.max(1);
        self
    }

    /// Set the fairness batch size
    pub fn with_fairness_batch(mut self, n: usize) -> Self {
        self.fairness_batch = n.max(1);
        self
    }

    /// Set the submission thread's batch cap
    pub fn with_submit_batch(mut self, n: usize) -> Self {
        self.submit_batch = n.max(1);
        self
    }

    /// Set the polling thread's wait bound
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Check values that can be set directly on the public fields
    pub fn validate(&self) -> IoResult<()> {
        if !self.block_size.is_power_of_two() {
            return Err(IoError::Config(format!(
                "block size {} is not a power of two",
                self.block_size
            )));
        }
        if self.block_size > BLOCK_SIZE {
            return Err(IoError::Config(format!(
                "block size {} exceeds buffer alignment {BLOCK_SIZE}",
                self.block_size
            )));
        }
        Ok(())
    }

    /// In-flight bound actually enforced: never more than the backend holds
    pub fn effective_queue_depth(&self) -> usize {
        self.target_queue_depth.min(self.max_concurrent)
    }
}
