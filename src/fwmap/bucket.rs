// Copyright (c) 2025 Dataplane Core Contributors
//
// Bucket and per-worker counter layout
//
// A bucket is exactly one cache line: a 4-byte reader/writer spinlock,
// a 4-byte "next" extra-bucket index (0 = none) and four entries laid
// out structure-of-arrays so every field keeps its natural alignment.
// An entry is a 16-bit signature (0 = empty slot), a 32-bit key index
// and a 64-bit deadline. Within a bucket, empty slots only appear after
// the occupied prefix, so a lookup can stop at the first zero
// signature.

use crate::shm::lock::SeqRwLock;
use std::mem;
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering};

/// Entries per bucket.
pub const ENTRIES_PER_BUCKET: usize = 4;

/// Buckets per index chunk (and key/value slots per store chunk).
pub(crate) const CHUNK_BUCKETS: usize = 1 << 16;
pub(crate) const CHUNK_SHIFT: u32 = 16;

#[repr(C, align(64))]
pub(crate) struct Bucket {
    deadlines: [AtomicU64; ENTRIES_PER_BUCKET],
    key_idx: [AtomicU32; ENTRIES_PER_BUCKET],
    sigs: [AtomicU16; ENTRIES_PER_BUCKET],
    pub(crate) lock: SeqRwLock,
    pub(crate) next: AtomicU32,
}

const _: () = assert!(mem::size_of::<Bucket>() == 64);

impl Bucket {
    #[inline]
    pub fn sig(&self, e: usize) -> u16 {
        self.sigs[e].load(Ordering::Acquire)
    }

    #[inline]
    pub fn deadline(&self, e: usize) -> u64 {
        self.deadlines[e].load(Ordering::Acquire)
    }

    #[inline]
    pub fn key_index(&self, e: usize) -> u32 {
        self.key_idx[e].load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_deadline(&self, e: usize, deadline: u64) {
        self.deadlines[e].store(deadline, Ordering::Release);
    }

    /// Fill a slot. The signature is stored last so a concurrent
    /// lock-free walker never sees a non-zero signature with stale
    /// neighbors.
    #[inline]
    pub fn fill(&self, e: usize, sig: u16, key_index: u32, deadline: u64) {
        debug_assert_ne!(sig, 0);
        self.key_idx[e].store(key_index, Ordering::Relaxed);
        self.deadlines[e].store(deadline, Ordering::Relaxed);
        self.sigs[e].store(sig, Ordering::Release);
    }

    /// Reset every entry and the chain link. Caller holds the write
    /// lock or has exclusive access.
    pub fn reset(&self) {
        for e in 0..ENTRIES_PER_BUCKET {
            self.sigs[e].store(0, Ordering::Relaxed);
            self.key_idx[e].store(0, Ordering::Relaxed);
            self.deadlines[e].store(0, Ordering::Relaxed);
        }
        self.next.store(0, Ordering::Release);
    }
}

/// Per-worker statistics slot, one cache line per worker to keep
/// counter updates race-free without atomics contention.
#[repr(C, align(64))]
pub(crate) struct WorkerCounters {
    total_elements: AtomicU64,
    max_chain: AtomicU64,
    max_deadline: AtomicU64,
}

const _: () = assert!(mem::size_of::<WorkerCounters>() == 64);

impl WorkerCounters {
    /// Record a modification by this slot's worker. Each slot has a
    /// single writer, so plain load/store pairs suffice.
    #[inline]
    pub fn note(&self, newly_inserted: bool, chain_len: u64, deadline: u64) {
        if newly_inserted {
            let t = self.total_elements.load(Ordering::Relaxed);
            self.total_elements.store(t + 1, Ordering::Relaxed);
        }
        if chain_len > self.max_chain.load(Ordering::Relaxed) {
            self.max_chain.store(chain_len, Ordering::Relaxed);
        }
        if deadline > self.max_deadline.load(Ordering::Relaxed) {
            self.max_deadline.store(deadline, Ordering::Relaxed);
        }
    }

    pub fn total_elements(&self) -> u64 {
        self.total_elements.load(Ordering::Relaxed)
    }

    pub fn max_chain(&self) -> u64 {
        self.max_chain.load(Ordering::Relaxed)
    }

    pub fn max_deadline(&self) -> u64 {
        self.max_deadline.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.total_elements.store(0, Ordering::Relaxed);
        self.max_chain.store(0, Ordering::Relaxed);
        self.max_deadline.store(0, Ordering::Relaxed);
    }
}
