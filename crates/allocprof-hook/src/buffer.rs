//! Bounded hand-off queue between allocating threads and the collector.
//!
//! Allocation hooks push captured stacks from arbitrary threads; a single
//! consumer blocks in [`SampleBuffer::pop`] until a sample is ready or the
//! buffer is stopped and drained. Nothing in here allocates, so the queue is
//! safe to use from inside a global allocator.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// Maximum stack depth kept per sample
pub const MAX_STACK_DEPTH: usize = 64;

/// Number of sample slots in the ring
pub const BUFFER_CAPACITY: usize = 1024;

/// Metadata for a sample copied out of the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSample {
    /// Number of addresses written into the caller's stack buffer
    pub depth: usize,
    /// Requested allocation size in bytes
    pub size: usize,
}

#[derive(Clone, Copy)]
struct Slot {
    stack: [u64; MAX_STACK_DEPTH],
    depth: usize,
    size: usize,
    ready: bool,
}

impl Slot {
    const EMPTY: Slot = Slot {
        stack: [0; MAX_STACK_DEPTH],
        depth: 0,
        size: 0,
        ready: false,
    };
}

struct Ring {
    /// Empty until the first `start`
    slots: Vec<Slot>,
    writer: usize,
    reader: usize,
    started: bool,
}

/// Fixed-size ring of allocation samples.
pub struct SampleBuffer {
    ring: Mutex<Ring>,
    ready: Condvar,
    dropped: AtomicU64,
}

impl SampleBuffer {
    pub const fn new() -> Self {
        SampleBuffer {
            ring: Mutex::new(Ring {
                slots: Vec::new(),
                writer: 0,
                reader: 0,
                started: false,
            }),
            ready: Condvar::new(),
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Ring> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Accept samples. Anything left over from a previous session is discarded.
    pub fn start(&self) {
        // Allocated before locking: with the hook installed this allocation
        // can itself be sampled, which pushes into this buffer
        let slots = vec![Slot::EMPTY; BUFFER_CAPACITY];
        let mut ring = self.lock();
        ring.slots = slots;
        ring.writer = 0;
        ring.reader = 0;
        ring.started = true;
        self.dropped.store(0, Ordering::Relaxed);
    }

    /// Stop accepting samples and wake the consumer.
    ///
    /// Samples already queued are still handed out by [`pop`](Self::pop)
    /// before it reports end-of-stream.
    pub fn stop(&self) {
        let mut ring = self.lock();
        ring.started = false;
        self.ready.notify_all();
    }

    pub fn is_started(&self) -> bool {
        self.lock().started
    }

    /// Queue one sample. Returns `false` if the buffer is stopped or full.
    ///
    /// Stacks deeper than [`MAX_STACK_DEPTH`] are truncated.
    pub fn push(&self, stack: &[u64], size: usize) -> bool {
        let mut ring = self.lock();
        if !ring.started {
            return false;
        }

        let idx = ring.writer;
        if ring.slots[idx].ready {
            // Consumer is behind; keep the older samples
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let depth = stack.len().min(MAX_STACK_DEPTH);
        let slot = &mut ring.slots[idx];
        slot.stack[..depth].copy_from_slice(&stack[..depth]);
        slot.depth = depth;
        slot.size = size;
        slot.ready = true;
        ring.writer = (idx + 1) % BUFFER_CAPACITY;

        self.ready.notify_one();
        true
    }

    /// Block until a sample is available and copy it into `stack`.
    ///
    /// Returns `None` once the buffer has been stopped and every queued sample
    /// has been consumed.
    pub fn pop(&self, stack: &mut [u64]) -> Option<RawSample> {
        let mut ring = self.lock();
        loop {
            let idx = ring.reader;
            if ring.slots.get(idx).is_some_and(|slot| slot.ready) {
                let slot = &mut ring.slots[idx];
                let depth = slot.depth.min(stack.len());
                stack[..depth].copy_from_slice(&slot.stack[..depth]);
                let size = slot.size;
                slot.ready = false;
                ring.reader = (idx + 1) % BUFFER_CAPACITY;
                return Some(RawSample { depth, size });
            }

            if !ring.started {
                return None;
            }

            ring = self
                .ready
                .wait(ring)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Samples rejected because the ring was full since the last `start`
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for SampleBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Buffer fed by [`ProfilingAllocator`](crate::ProfilingAllocator).
pub static GLOBAL_BUFFER: SampleBuffer = SampleBuffer::new();
