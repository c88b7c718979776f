//! Reorder queue for requests not yet admitted to the backend
//!
//! Requests land in one of three FIFO buckets:
//! - **Read**: reads that overlap nothing queued
//! - **Write**: writes that overlap nothing queued
//! - **Conflicting**: requests that overlap another queued request, plus
//!   the earlier requests they overlap, kept in submission order
//!
//! Promotion only ever moves a request from Read or Write into Conflicting.
//! Every bucket is ordered by [`RequestId`], which is the submission order,
//! so two conflicting requests on one block always leave the queue in the
//! order they arrived.
//!
//! Buckets are picked by quota. When no bucket with quota left has work,
//! quotas are recomputed proportionally to bucket sizes against a fixed
//! batch, with reads given at least half the batch.
//!
//! A ready-bucket entry overlaps no other queued entry, so a caller whose
//! chosen head is blocked may skip that whole bucket (see
//! [`peek_except`](ReorderQueue::peek_except)) and keep pulling from the
//! others without reordering anything that overlaps.

use std::collections::{BTreeMap, HashMap};
use std::os::unix::io::RawFd;

use super::{Extent, OpKind, RequestId};

/// Which bucket a queued request sits in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
    Read,
    Write,
    Conflicting,
}

/// A request at the head of a bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueEntry {
    pub id: RequestId,
    pub extent: Extent,
    pub bucket: Bucket,
}

/// Queue occupancy of one block
#[derive(Debug, Default)]
struct BlockSlot {
    /// Conflicting-bucket requests touching this block
    conflicting: u32,
    /// The write-ready request touching this block, if any
    writer: Option<RequestId>,
    /// Read-ready requests touching this block
    readers: Vec<RequestId>,
}

impl BlockSlot {
    fn is_empty(&self) -> bool {
        self.conflicting == 0 && self.writer.is_none() && self.readers.is_empty()
    }
}

/// Remaining pulls per bucket before quotas are recomputed
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Quotas {
    pub read: usize,
    pub write: usize,
    pub conflicting: usize,
}

/// Pending requests, split into read, write and conflicting buckets
#[derive(Debug)]
pub struct ReorderQueue {
    block_size: u64,
    batch: usize,
    reads: BTreeMap<RequestId, Extent>,
    writes: BTreeMap<RequestId, Extent>,
    conflicting: BTreeMap<RequestId, Extent>,
    slots: HashMap<(RawFd, u64), BlockSlot>,
    quotas: Quotas,
}

impl ReorderQueue {
    /// Create an empty queue
    ///
    /// `batch` is the number of pulls quotas are proportioned against.
    pub fn new(block_size: u64, batch: usize) -> Self {
        Self {
            block_size,
            batch: batch.max(1),
            reads: BTreeMap::new(),
            writes: BTreeMap::new(),
            conflicting: BTreeMap::new(),
            slots: HashMap::new(),
            quotas: Quotas::default(),
        }
    }

    // ========================================================================
    // Push
    // ========================================================================

    /// Queue a request
    ///
    /// # Panics
    /// Panics if `id` is already queued
    pub fn push(&mut self, id: RequestId, extent: Extent) {
        assert!(
            self.bucket_of(id).is_none(),
            "request {id} pushed twice"
        );

        // Queued requests that must now be ordered with the new one
        let mut promote = Vec::new();
        let mut conflicts = false;
        for block in extent.blocks(self.block_size) {
            let Some(slot) = self.slots.get(&(extent.fd, block)) else {
                continue;
            };
            if slot.conflicting > 0 {
                conflicts = true;
            }
            if let Some(writer) = slot.writer {
                conflicts = true;
                promote.push(writer);
            }
            if extent.kind == OpKind::Write && !slot.readers.is_empty() {
                conflicts = true;
                promote.extend_from_slice(&slot.readers);
            }
        }

        if !conflicts {
            self.insert_ready(id, extent);
            return;
        }

        promote.sort_unstable();
        promote.dedup();
        for earlier in promote {
            self.promote(earlier);
        }
        self.insert_conflicting(id, extent);
    }

    fn insert_ready(&mut self, id: RequestId, extent: Extent) {
        for block in extent.blocks(self.block_size) {
            let slot = self.slots.entry((extent.fd, block)).or_default();
            match extent.kind {
                OpKind::Read => slot.readers.push(id),
                OpKind::Write => {
                    debug_assert!(slot.writer.is_none());
                    slot.writer = Some(id);
                }
            }
        }
        match extent.kind {
            OpKind::Read => self.reads.insert(id, extent),
            OpKind::Write => self.writes.insert(id, extent),
        };
    }

    fn insert_conflicting(&mut self, id: RequestId, extent: Extent) {
        for block in extent.blocks(self.block_size) {
            self.slots.entry((extent.fd, block)).or_default().conflicting += 1;
        }
        self.conflicting.insert(id, extent);
    }

    /// Move a read- or write-ready request into the conflicting bucket
    fn promote(&mut self, id: RequestId) {
        let extent = self
            .reads
            .remove(&id)
            .or_else(|| self.writes.remove(&id));
        let Some(extent) = extent else {
            panic!("promoting {id} which is not in a ready bucket");
        };
        self.unindex_ready(id, &extent);
        self.insert_conflicting(id, extent);
    }

    fn unindex_ready(&mut self, id: RequestId, extent: &Extent) {
        for block in extent.blocks(self.block_size) {
            let key = (extent.fd, block);
            let Some(slot) = self.slots.get_mut(&key) else {
                continue;
            };
            match extent.kind {
                OpKind::Read => slot.readers.retain(|&r| r != id),
                OpKind::Write => {
                    if slot.writer == Some(id) {
                        slot.writer = None;
                    }
                }
            }
            if slot.is_empty() {
                self.slots.remove(&key);
            }
        }
    }

    // ========================================================================
    // Peek / pull
    // ========================================================================

    /// Request that the next [`pull`](Self::pull) will return
    ///
    /// Does not consume quota, though it may recompute exhausted quotas.
    ///
    /// # Panics
    /// Panics if the queue is empty
    pub fn peek(&mut self) -> QueueEntry {
        let bucket = self.pick_next_queue();
        self.head_of(bucket)
    }

    /// Like [`peek`](Self::peek), but never picks a bucket in `skip`
    ///
    /// Returns `None` when every bucket outside `skip` is empty.
    pub fn peek_except(&mut self, skip: &[Bucket]) -> Option<QueueEntry> {
        let bucket = self.pick_next_queue_except(skip)?;
        Some(self.head_of(bucket))
    }

    fn head_of(&self, bucket: Bucket) -> QueueEntry {
        let (&id, &extent) = self
            .bucket(bucket)
            .first_key_value()
            .unwrap_or_else(|| unreachable!("picked empty bucket"));
        QueueEntry { id, extent, bucket }
    }

    /// Remove and return the next request
    ///
    /// # Panics
    /// Panics if the queue is empty
    pub fn pull(&mut self) -> QueueEntry {
        let bucket = self.pick_next_queue();
        self.pull_from(bucket)
    }

    /// Remove and return the head of `bucket`, charging it one pull of quota
    ///
    /// # Panics
    /// Panics if `bucket` is empty
    pub fn pull_from(&mut self, bucket: Bucket) -> QueueEntry {
        let (id, extent) = match bucket {
            Bucket::Read => {
                self.quotas.read = self.quotas.read.saturating_sub(1);
                self.reads.pop_first()
            }
            Bucket::Write => {
                self.quotas.write = self.quotas.write.saturating_sub(1);
                self.writes.pop_first()
            }
            Bucket::Conflicting => {
                self.quotas.conflicting = self.quotas.conflicting.saturating_sub(1);
                self.conflicting.pop_first()
            }
        }
        .unwrap_or_else(|| panic!("pull from empty {bucket:?} bucket"));

        match bucket {
            Bucket::Read | Bucket::Write => self.unindex_ready(id, &extent),
            Bucket::Conflicting => self.release_conflicting(&extent),
        }
        QueueEntry { id, extent, bucket }
    }

    fn release_conflicting(&mut self, extent: &Extent) {
        for block in extent.blocks(self.block_size) {
            let key = (extent.fd, block);
            let slot = self
                .slots
                .get_mut(&key)
                .filter(|slot| slot.conflicting > 0)
                .unwrap_or_else(|| panic!("block {block} on fd {} not conflicting", extent.fd));
            slot.conflicting -= 1;
            if slot.is_empty() {
                self.slots.remove(&key);
            }
        }
    }

    /// Choose the bucket to serve next
    fn pick_next_queue(&mut self) -> Bucket {
        assert!(!self.is_empty(), "peek or pull on an empty reorder queue");
        self.pick_next_queue_except(&[])
            .unwrap_or_else(|| unreachable!("fresh quotas cover every non-empty bucket"))
    }

    fn pick_next_queue_except(&mut self, skip: &[Bucket]) -> Option<Bucket> {
        if let Some(bucket) = self.select(skip) {
            return Some(bucket);
        }
        let open = [Bucket::Read, Bucket::Write, Bucket::Conflicting]
            .into_iter()
            .any(|b| !skip.contains(&b) && !self.bucket(b).is_empty());
        if !open {
            return None;
        }
        self.recompute_quotas();
        self.select(skip)
    }

    fn select(&self, skip: &[Bucket]) -> Option<Bucket> {
        let ready = |bucket: Bucket, quota: usize| {
            quota > 0 && !skip.contains(&bucket) && !self.bucket(bucket).is_empty()
        };
        if ready(Bucket::Read, self.quotas.read) {
            Some(Bucket::Read)
        } else if ready(Bucket::Write, self.quotas.write) {
            Some(Bucket::Write)
        } else if ready(Bucket::Conflicting, self.quotas.conflicting) {
            Some(Bucket::Conflicting)
        } else {
            None
        }
    }

    fn recompute_quotas(&mut self) {
        let (r, w, c) = (self.reads.len(), self.writes.len(), self.conflicting.len());
        let total = r + w + c;
        let b = self.batch;
        let share = |n: usize| if n == 0 { 0 } else { (n * b / total).max(1) };

        self.quotas = Quotas {
            read: if r == 0 {
                0
            } else {
                (r * b / total).max(b / 2).min(r).max(1)
            },
            write: share(w),
            conflicting: share(c),
        };
        tracing::trace!(reads = r, writes = w, conflicting = c, quotas = ?self.quotas, "recomputed fairness quotas");
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    fn bucket(&self, bucket: Bucket) -> &BTreeMap<RequestId, Extent> {
        match bucket {
            Bucket::Read => &self.reads,
            Bucket::Write => &self.writes,
            Bucket::Conflicting => &self.conflicting,
        }
    }

    /// Bucket currently holding `id`
    pub fn bucket_of(&self, id: RequestId) -> Option<Bucket> {
        [Bucket::Read, Bucket::Write, Bucket::Conflicting]
            .into_iter()
            .find(|&b| self.bucket(b).contains_key(&id))
    }

    /// Number of requests in one bucket
    pub fn bucket_len(&self, bucket: Bucket) -> usize {
        self.bucket(bucket).len()
    }

    pub fn len(&self) -> usize {
        self.reads.len() + self.writes.len() + self.conflicting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reads.is_empty() && self.writes.is_empty() && self.conflicting.is_empty()
    }

    pub fn quotas(&self) -> Quotas {
        self.quotas
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const BS: u64 = 4096;

    fn read(offset: u64) -> Extent {
        Extent::new(3, OpKind::Read, offset, BS as usize)
    }

    fn write(offset: u64) -> Extent {
        Extent::new(3, OpKind::Write, offset, BS as usize)
    }

    fn queue() -> ReorderQueue {
        ReorderQueue::new(BS, 32)
    }

    #[test]
    fn test_write_then_read_promotes() {
        let mut q = queue();
        q.push(RequestId(1), write(0));
        assert_eq!(q.bucket_of(RequestId(1)), Some(Bucket::Write));

        q.push(RequestId(2), read(0));
        assert_eq!(q.bucket_of(RequestId(1)), Some(Bucket::Conflicting));
        assert_eq!(q.bucket_of(RequestId(2)), Some(Bucket::Conflicting));
        assert_eq!(q.bucket_len(Bucket::Write), 0);

        assert_eq!(q.pull().id, RequestId(1));
        assert_eq!(q.pull().id, RequestId(2));
        assert!(q.is_empty());
    }

    #[test]
    fn test_disjoint_writes_stay_ready() {
        let mut q = queue();
        q.push(RequestId(1), write(0));
        q.push(RequestId(2), write(BS));
        assert_eq!(q.bucket_len(Bucket::Write), 2);
        assert_eq!(q.bucket_len(Bucket::Conflicting), 0);

        let pulled: HashSet<_> = [q.pull().id, q.pull().id].into_iter().collect();
        assert_eq!(pulled, HashSet::from([RequestId(1), RequestId(2)]));
    }

    #[test]
    fn test_reads_share_block() {
        let mut q = queue();
        q.push(RequestId(1), read(0));
        q.push(RequestId(2), read(100));
        assert_eq!(q.bucket_len(Bucket::Read), 2);
    }

    #[test]
    fn test_write_promotes_all_readers() {
        let mut q = queue();
        q.push(RequestId(1), read(0));
        q.push(RequestId(2), read(0));
        q.push(RequestId(3), read(BS));
        q.push(RequestId(4), write(0));

        assert_eq!(q.bucket_of(RequestId(1)), Some(Bucket::Conflicting));
        assert_eq!(q.bucket_of(RequestId(2)), Some(Bucket::Conflicting));
        assert_eq!(q.bucket_of(RequestId(3)), Some(Bucket::Read));
        assert_eq!(q.bucket_of(RequestId(4)), Some(Bucket::Conflicting));
    }

    #[test]
    fn test_read_joins_conflicting_block() {
        let mut q = queue();
        q.push(RequestId(1), write(0));
        q.push(RequestId(2), write(0));
        // Block 0 is now conflicting; a later read must queue behind both
        q.push(RequestId(3), read(0));
        assert_eq!(q.bucket_len(Bucket::Conflicting), 3);

        let order: Vec<_> = (0..3).map(|_| q.pull().id).collect();
        assert_eq!(order, vec![RequestId(1), RequestId(2), RequestId(3)]);
    }

    #[test]
    fn test_block_leaves_conflicting_state() {
        let mut q = queue();
        q.push(RequestId(1), write(0));
        q.push(RequestId(2), read(0));
        q.pull();
        q.pull();
        assert!(q.is_empty());

        q.push(RequestId(3), read(0));
        assert_eq!(q.bucket_of(RequestId(3)), Some(Bucket::Read));
    }

    #[test]
    fn test_spanning_request_promotes_each_block() {
        let mut q = queue();
        q.push(RequestId(1), write(0));
        q.push(RequestId(2), write(BS));
        q.push(RequestId(3), Extent::new(3, OpKind::Read, 0, 2 * BS as usize));
        assert_eq!(q.bucket_len(Bucket::Conflicting), 3);
        assert_eq!(q.bucket_len(Bucket::Write), 0);
    }

    #[test]
    fn test_other_fd_independent() {
        let mut q = queue();
        q.push(RequestId(1), write(0));
        q.push(RequestId(2), Extent::new(4, OpKind::Read, 0, BS as usize));
        assert_eq!(q.bucket_of(RequestId(1)), Some(Bucket::Write));
        assert_eq!(q.bucket_of(RequestId(2)), Some(Bucket::Read));
    }

    #[test]
    fn test_peek_matches_pull() {
        let mut q = queue();
        q.push(RequestId(1), write(0));
        q.push(RequestId(2), read(BS));
        q.push(RequestId(3), read(0));
        while !q.is_empty() {
            let head = q.peek();
            assert_eq!(q.peek(), head);
            assert_eq!(q.pull(), head);
        }
    }

    #[test]
    fn test_skipped_bucket_not_picked() {
        let mut q = queue();
        q.push(RequestId(1), write(0));
        q.push(RequestId(2), write(0));
        q.push(RequestId(3), read(BS));
        q.push(RequestId(4), write(2 * BS));

        let mut order = Vec::new();
        while let Some(head) = q.peek_except(&[Bucket::Conflicting]) {
            assert_ne!(head.bucket, Bucket::Conflicting);
            assert_eq!(q.pull_from(head.bucket), head);
            order.push(head.id);
        }
        assert_eq!(order, vec![RequestId(3), RequestId(4)]);
        assert_eq!(q.bucket_len(Bucket::Conflicting), 2);

        assert!(q.peek_except(&[Bucket::Conflicting]).is_none());
        assert_eq!(q.peek().id, RequestId(1));
    }

    #[test]
    fn test_skip_refreshes_exhausted_quota() {
        let mut q = ReorderQueue::new(BS, 4);
        q.push(RequestId(1), write(0));
        q.push(RequestId(2), write(0));
        for i in 3..20 {
            q.push(RequestId(i), read(i * BS));
        }
        // Reads keep flowing past their first quota while conflicts are skipped
        for _ in 3..20 {
            let head = q.peek_except(&[Bucket::Conflicting]).unwrap();
            assert_eq!(q.pull_from(head.bucket).bucket, Bucket::Read);
        }
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_quotas_favor_reads() {
        let mut q = queue();
        for i in 0..10 {
            q.push(RequestId(i), write(i * BS));
        }
        for i in 10..20 {
            q.push(RequestId(i), read(i * BS));
        }
        q.peek();
        let quotas = q.quotas();
        // Read share is capped at the bucket size; writes get 10 * 32 / 20
        assert_eq!(quotas.read, 10);
        assert_eq!(quotas.write, 16);
        assert_eq!(quotas.conflicting, 0);

        // Reads are served first within a quota round
        for _ in 0..10 {
            assert_eq!(q.pull().bucket, Bucket::Read);
        }
        assert_eq!(q.pull().bucket, Bucket::Write);
    }

    #[test]
    fn test_quotas_min_one_per_bucket() {
        let mut q = ReorderQueue::new(BS, 8);
        for i in 0..100 {
            q.push(RequestId(i), read(i * BS));
        }
        q.push(RequestId(100), write(200 * BS));
        q.peek();
        let quotas = q.quotas();
        assert_eq!(quotas.read, 7);
        assert_eq!(quotas.write, 1);

        // The lone write is reached after one round of reads
        let buckets: Vec<_> = (0..8).map(|_| q.pull().bucket).collect();
        assert_eq!(buckets.iter().filter(|&&b| b == Bucket::Write).count(), 1);
        assert_eq!(buckets[7], Bucket::Write);
    }

    #[test]
    fn test_conservation() {
        let mut q = queue();
        let mut pushed = HashSet::new();
        for i in 0..200u64 {
            let offset = (i * 7 % 13) * BS;
            let extent = if i % 3 == 0 { write(offset) } else { read(offset) };
            q.push(RequestId(i), extent);
            pushed.insert(RequestId(i));
        }
        let mut pulled = HashSet::new();
        while !q.is_empty() {
            assert!(pulled.insert(q.pull().id));
        }
        assert_eq!(pulled, pushed);
        assert!(q.slots.is_empty());
    }

    #[test]
    #[should_panic(expected = "pushed twice")]
    fn test_double_push_panics() {
        let mut q = queue();
        q.push(RequestId(1), read(0));
        q.push(RequestId(1), read(0));
    }

    #[test]
    #[should_panic(expected = "empty reorder queue")]
    fn test_pull_empty_panics() {
        queue().pull();
    }
}
