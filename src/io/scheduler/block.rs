//! Block address arithmetic

/// Block address containing `offset`
#[inline]
pub fn block_of(offset: u64, block_size: u64) -> u64 {
    offset / block_size * block_size
}

/// Block addresses overlapped by `len` bytes at `offset`, in ascending order
///
/// A zero-length range still yields the block containing `offset`.
pub fn overlapping_blocks(offset: u64, len: usize, block_size: u64) -> Blocks {
    debug_assert!(block_size > 0);
    let last_byte = offset.saturating_add((len as u64).saturating_sub(1));
    Blocks {
        next: Some(block_of(offset, block_size)),
        last: block_of(last_byte, block_size),
        step: block_size,
    }
}

/// Iterator over the blocks of a byte range
#[derive(Debug, Clone)]
pub struct Blocks {
    next: Option<u64>,
    last: u64,
    step: u64,
}

impl Iterator for Blocks {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        let block = self.next?;
        self.next = if block >= self.last {
            None
        } else {
            block.checked_add(self.step)
        };
        Some(block)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match self.next {
            Some(block) => {
                let n = ((self.last - block) / self.step + 1) as usize;
                (n, Some(n))
            }
            None => (0, Some(0)),
        }
    }
}

impl ExactSizeIterator for Blocks {}

#[cfg(test)]
mod tests {
    use super::*;

    const BS: u64 = 4096;

    #[test]
    fn test_single_block() {
        let blocks: Vec<u64> = overlapping_blocks(100, 200, BS).collect();
        assert_eq!(blocks, vec![0]);
    }

    #[test]
    fn test_zero_length() {
        let blocks: Vec<u64> = overlapping_blocks(5000, 0, BS).collect();
        assert_eq!(blocks, vec![4096]);
    }

    #[test]
    fn test_exact_boundaries() {
        let blocks: Vec<u64> = overlapping_blocks(4096, 4096, BS).collect();
        assert_eq!(blocks, vec![4096]);

        let blocks: Vec<u64> = overlapping_blocks(4096, 4097, BS).collect();
        assert_eq!(blocks, vec![4096, 8192]);
    }

    #[test]
    fn test_unaligned_span() {
        let blocks = overlapping_blocks(4000, 10_000, BS);
        assert_eq!(blocks.len(), 4);
        assert_eq!(blocks.collect::<Vec<_>>(), vec![0, 4096, 8192, 12288]);
    }

    #[test]
    fn test_end_of_range() {
        let blocks: Vec<u64> = overlapping_blocks(u64::MAX - 10, 100, BS).collect();
        assert_eq!(blocks, vec![block_of(u64::MAX, BS)]);
    }
}
