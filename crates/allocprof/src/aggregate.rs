//! Stack aggregation: deduplicate sampled stacks and accumulate their weight.

use crate::sampling::SamplingPolicy;
use std::collections::HashMap;

/// Maximum stack depth (must match allocprof-hook)
pub const MAX_STACK_DEPTH: usize = allocprof_hook::MAX_STACK_DEPTH;

/// Hash a stack of return addresses.
///
/// Every address is folded in with add/shift/xor steps and the result goes
/// through a 64-bit avalanche finalizer, so stacks that differ in any frame,
/// in frame order, or in length land in different buckets with high
/// probability.
pub fn stack_hash(stack: &[u64]) -> u64 {
    let mut h = stack.len() as u64;
    for &pc in stack {
        h = h.wrapping_add(pc);
        h = h.wrapping_add(h << 10);
        h ^= h >> 6;
        h = h.rotate_left(17);
    }
    h = h.wrapping_add(h << 3);
    h ^= h >> 11;
    h = h.wrapping_add(h << 15);

    // fmix64
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h ^= h >> 33;
    h
}

/// Aggregated weight of one distinct stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketEntry {
    /// Return addresses, innermost frame first
    pub stack: Box<[u64]>,
    /// Estimated number of allocations
    pub count: u64,
    /// Estimated number of bytes allocated
    pub bytes: u64,
}

/// Hash-bucketed table of sampled stacks.
///
/// Each bucket holds every distinct stack whose hash collided into it; two
/// entries in a bucket never carry the same stack.
#[derive(Debug, Default)]
pub struct StackAggregator {
    policy: SamplingPolicy,
    buckets: HashMap<u64, Vec<BucketEntry>>,
    samples: u64,
}

impl StackAggregator {
    pub fn new(policy: SamplingPolicy) -> Self {
        StackAggregator {
            policy: policy.normalized(),
            buckets: HashMap::new(),
            samples: 0,
        }
    }

    pub fn policy(&self) -> SamplingPolicy {
        self.policy
    }

    /// Record one sampled allocation of `size` bytes at `stack`.
    ///
    /// The stack is copied; the caller may reuse its buffer afterwards.
    pub fn insert(&mut self, stack: &[u64], size: u64) {
        self.insert_hashed(stack_hash(stack), stack, size);
    }

    pub(crate) fn insert_hashed(&mut self, hash: u64, stack: &[u64], size: u64) {
        let weight = self.policy.reweight(size);
        self.samples += 1;

        let bucket = self.buckets.entry(hash).or_default();
        if let Some(entry) = bucket.iter_mut().find(|e| *e.stack == *stack) {
            entry.count = entry.count.saturating_add(weight.count);
            entry.bytes = entry.bytes.saturating_add(weight.bytes);
            return;
        }

        bucket.push(BucketEntry {
            stack: stack.into(),
            count: weight.count,
            bytes: weight.bytes,
        });
    }

    /// Look up the entry for an exact stack
    pub fn get(&self, stack: &[u64]) -> Option<&BucketEntry> {
        self.bucket(stack_hash(stack))
            .iter()
            .find(|e| *e.stack == *stack)
    }

    /// All entries stored under `hash`
    pub fn bucket(&self, hash: u64) -> &[BucketEntry] {
        self.buckets.get(&hash).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Iterate over every distinct stack
    pub fn entries(&self) -> impl Iterator<Item = &BucketEntry> {
        self.buckets.values().flatten()
    }

    /// Number of distinct stacks
    pub fn len(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Number of non-empty buckets
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Number of sampled events inserted
    pub fn samples(&self) -> u64 {
        self.samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregator(rate: u64) -> StackAggregator {
        StackAggregator::new(SamplingPolicy::byte_interval(rate))
    }

    #[test]
    fn test_hash_is_deterministic() {
        assert_eq!(stack_hash(&[1, 2, 3]), stack_hash(&[1, 2, 3]));
    }

    #[test]
    fn test_hash_distinguishes_order_and_length() {
        assert_ne!(stack_hash(&[1, 2]), stack_hash(&[2, 1]));
        assert_ne!(stack_hash(&[1, 2]), stack_hash(&[1, 2, 0]));
        assert_ne!(stack_hash(&[]), stack_hash(&[0]));
        assert_ne!(stack_hash(&[0x1000, 0x2000]), stack_hash(&[0x1000, 0x2001]));
    }

    #[test]
    fn test_identical_stacks_merge() {
        let mut agg = aggregator(1024);
        agg.insert(&[0x10, 0x20], 4096);
        agg.insert(&[0x10, 0x20], 4096);

        assert_eq!(agg.len(), 1);
        let entry = agg.get(&[0x10, 0x20]).unwrap();
        assert_eq!((entry.count, entry.bytes), (2, 8192));
    }

    #[test]
    fn test_different_stacks_stay_distinct() {
        let mut agg = aggregator(1);
        agg.insert(&[0x10, 0x20], 8);
        agg.insert(&[0x10, 0x21], 8);
        agg.insert(&[0x20, 0x10], 8);
        agg.insert(&[0x10, 0x20, 0x30], 8);
        agg.insert(&[0x10], 8);

        assert_eq!(agg.len(), 5);
        assert!(agg.entries().all(|e| e.count == 1 && e.bytes == 8));
    }

    #[test]
    fn test_collisions_keep_separate_entries() {
        let mut agg = aggregator(1);
        agg.insert_hashed(42, &[0x1], 10);
        agg.insert_hashed(42, &[0x2], 20);
        agg.insert_hashed(42, &[0x1], 10);

        assert_eq!(agg.bucket_count(), 1);
        let bucket = agg.bucket(42);
        assert_eq!(bucket.len(), 2);
        assert_eq!(&*bucket[0].stack, &[0x1]);
        assert_eq!((bucket[0].count, bucket[0].bytes), (2, 20));
        assert_eq!(&*bucket[1].stack, &[0x2]);
        assert_eq!((bucket[1].count, bucket[1].bytes), (1, 20));
    }

    #[test]
    fn test_stack_is_copied() {
        let mut agg = aggregator(1);
        let mut buf = [0x1000u64, 0x2000];
        agg.insert(&buf, 1);
        buf[0] = 0xdead;

        assert!(agg.get(&[0x1000, 0x2000]).is_some());
        assert!(agg.get(&buf).is_none());
    }

    #[test]
    fn test_byte_interval_scenario() {
        let mut agg = aggregator(1024);
        let stack = [0x1000, 0x2000];

        agg.insert(&stack, 512);
        let entry = agg.get(&stack).unwrap();
        assert_eq!((entry.count, entry.bytes), (2, 1024));

        agg.insert(&stack, 2048);
        let entry = agg.get(&stack).unwrap();
        assert_eq!((entry.count, entry.bytes), (3, 3072));
        assert_eq!(agg.len(), 1);
        assert_eq!(agg.samples(), 2);
    }

    #[test]
    fn test_fixed_ratio_weights() {
        let mut agg = StackAggregator::new(SamplingPolicy::fixed_ratio(100));
        agg.insert(&[0x1], 16);
        agg.insert(&[0x1], 32);

        let entry = agg.get(&[0x1]).unwrap();
        assert_eq!((entry.count, entry.bytes), (200, 4800));
    }

    #[test]
    fn test_merge_order_does_not_matter() {
        let events = [(&[1u64, 2][..], 100u64), (&[3, 4][..], 5000), (&[1, 2][..], 700)];

        let mut forward = aggregator(1024);
        for (stack, size) in events {
            forward.insert(stack, size);
        }
        let mut backward = aggregator(1024);
        for (stack, size) in events.iter().rev() {
            backward.insert(stack, *size);
        }

        for entry in forward.entries() {
            assert_eq!(backward.get(&entry.stack), Some(entry));
        }
    }

    #[test]
    fn test_empty_stack_is_kept() {
        let mut agg = aggregator(1);
        agg.insert(&[], 64);
        assert_eq!(agg.len(), 1);
        assert!(agg.get(&[]).is_some());
    }
}
