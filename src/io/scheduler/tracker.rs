//! Block locks held by requests admitted to the backend

use std::collections::HashMap;
use std::os::unix::io::RawFd;

use super::{Extent, OpKind};

/// Lock state of one block
#[derive(Debug, Default, Clone, Copy)]
struct BlockLock {
    writer: bool,
    readers: u32,
}

/// Tracks which blocks have an active writer or active readers
///
/// Only the owning thread touches the tracker. Locks are taken when a
/// request is admitted and released when its completion is processed.
#[derive(Debug)]
pub struct DependencyTracker {
    block_size: u64,
    locks: HashMap<(RawFd, u64), BlockLock>,
}

impl DependencyTracker {
    pub fn new(block_size: u64) -> Self {
        Self {
            block_size,
            locks: HashMap::new(),
        }
    }

    /// Whether admitting `extent` now would race with an admitted request
    ///
    /// Reads conflict with active writers. Writes conflict with active
    /// writers and active readers.
    pub fn is_conflicting(&self, extent: &Extent) -> bool {
        extent.blocks(self.block_size).any(|block| {
            match self.locks.get(&(extent.fd, block)) {
                None => false,
                Some(lock) => match extent.kind {
                    OpKind::Read => lock.writer,
                    OpKind::Write => lock.writer || lock.readers > 0,
                },
            }
        })
    }

    /// Take the locks for an admitted request
    ///
    /// # Panics
    /// Panics if the request conflicts with an admitted one
    pub fn register_active(&mut self, extent: &Extent) {
        assert!(
            !self.is_conflicting(extent),
            "registering conflicting {} at offset {} on fd {}",
            extent.kind,
            extent.offset,
            extent.fd
        );
        for block in extent.blocks(self.block_size) {
            let lock = self.locks.entry((extent.fd, block)).or_default();
            match extent.kind {
                OpKind::Read => lock.readers += 1,
                OpKind::Write => lock.writer = true,
            }
        }
    }

    /// Release the locks taken by [`register_active`](Self::register_active)
    ///
    /// # Panics
    /// Panics if the request does not hold them
    pub fn unregister(&mut self, extent: &Extent) {
        for block in extent.blocks(self.block_size) {
            let key = (extent.fd, block);
            let lock = self.locks.get_mut(&key);
            let lock = match (lock, extent.kind) {
                (Some(lock), OpKind::Read) if lock.readers > 0 => {
                    lock.readers -= 1;
                    lock
                }
                (Some(lock), OpKind::Write) if lock.writer => {
                    lock.writer = false;
                    lock
                }
                _ => panic!(
                    "unregistering {} at offset {} on fd {} that holds no lock on block {}",
                    extent.kind, extent.offset, extent.fd, block
                ),
            };
            if !lock.writer && lock.readers == 0 {
                self.locks.remove(&key);
            }
        }
    }

    /// Number of blocks currently locked
    pub fn locked_blocks(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BS: u64 = 4096;

    fn read(offset: u64, len: usize) -> Extent {
        Extent::new(3, OpKind::Read, offset, len)
    }

    fn write(offset: u64, len: usize) -> Extent {
        Extent::new(3, OpKind::Write, offset, len)
    }

    #[test]
    fn test_readers_share() {
        let mut tracker = DependencyTracker::new(BS);
        tracker.register_active(&read(0, 4096));
        assert!(!tracker.is_conflicting(&read(100, 10)));
        tracker.register_active(&read(100, 10));
        assert!(tracker.is_conflicting(&write(0, 1)));

        tracker.unregister(&read(0, 4096));
        assert!(tracker.is_conflicting(&write(0, 1)));
        tracker.unregister(&read(100, 10));
        assert!(!tracker.is_conflicting(&write(0, 1)));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_writer_excludes() {
        let mut tracker = DependencyTracker::new(BS);
        tracker.register_active(&write(4096, 8192));
        assert!(tracker.is_conflicting(&read(8192, 1)));
        assert!(tracker.is_conflicting(&write(0, 4097)));
        assert!(!tracker.is_conflicting(&read(0, 4096)));
        assert!(!tracker.is_conflicting(&write(12288, 4096)));
        assert_eq!(tracker.locked_blocks(), 2);
    }

    #[test]
    fn test_fds_are_independent() {
        let mut tracker = DependencyTracker::new(BS);
        tracker.register_active(&write(0, 4096));
        assert!(!tracker.is_conflicting(&Extent::new(4, OpKind::Write, 0, 4096)));
    }

    #[test]
    #[should_panic(expected = "registering conflicting")]
    fn test_register_conflicting_panics() {
        let mut tracker = DependencyTracker::new(BS);
        tracker.register_active(&read(0, 4096));
        tracker.register_active(&write(0, 4096));
    }

    #[test]
    #[should_panic(expected = "holds no lock")]
    fn test_unregister_unknown_panics() {
        let mut tracker = DependencyTracker::new(BS);
        tracker.register_active(&read(0, 4096));
        tracker.unregister(&write(0, 4096));
    }
}
