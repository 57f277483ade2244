// Copyright (c) 2025 Dataplane Core Contributors
//
// Spin locks for shared memory
//
// Locks that live inside the arena cannot use OS primitives: a futex
// word or parking-lot queue is meaningless in another process's mapping.
// Both locks here are a single 32-bit atomic with bounded spinning,
// which matches the fast-path contract (short critical sections, no
// descheduling expected).
//
// SeqRwLock state encoding (32-bit atomic):
// - Bits 0-23: reader count (24 bits)
// - Bit 24: writer lock bit

use std::sync::atomic::{AtomicU32, Ordering};

/// Reader count mask (bits 0-23)
const READER_MASK: u32 = 0x00FF_FFFF;

/// Writer lock bit (bit 24)
const WRITER_BIT: u32 = 0x0100_0000;

/// Exponential backoff for CAS retry loops
pub(crate) struct Backoff {
    step: u32,
}

impl Backoff {
    const YIELD_THRESHOLD: u32 = 6;
    const MAX_STEP: u32 = 10;

    pub fn new() -> Self {
        Self { step: 0 }
    }

    /// Spin for a while, falling back to a scheduler yield under
    /// sustained contention.
    pub fn snooze(&mut self) {
        if self.step <= Self::YIELD_THRESHOLD {
            for _ in 0..(1u32 << self.step) {
                std::hint::spin_loop();
            }
        } else {
            std::thread::yield_now();
        }
        self.step = (self.step + 1).min(Self::MAX_STEP);
    }
}

/// A 4-byte mutual-exclusion spinlock embeddable in shared memory.
#[repr(transparent)]
pub struct SpinLock {
    state: AtomicU32,
}

impl SpinLock {
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn lock(&self) -> SpinGuard<'_> {
        let mut backoff = Backoff::new();
        while self
            .state
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            backoff.snooze();
        }
        SpinGuard { lock: self }
    }

    #[inline]
    pub fn try_lock(&self) -> Option<SpinGuard<'_>> {
        if self
            .state
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinGuard { lock: self })
        } else {
            None
        }
    }

    #[inline]
    fn unlock(&self) {
        self.state.store(0, Ordering::Release);
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SpinGuard<'a> {
    lock: &'a SpinLock,
}

impl Drop for SpinGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// A 4-byte reader/writer spinlock embeddable in shared memory.
///
/// Readers share; a single writer excludes everyone. There is no writer
/// preference queue: the critical sections it guards (one bucket chain
/// walk) are a few dozen instructions, so bounded spinning is cheaper
/// than any fairness machinery.
#[repr(transparent)]
pub struct SeqRwLock {
    state: AtomicU32,
}

impl SeqRwLock {
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn read(&self) -> SeqReadGuard<'_> {
        let mut backoff = Backoff::new();
        loop {
            let state = self.state.load(Ordering::Relaxed);
            if state & WRITER_BIT != 0 {
                backoff.snooze();
                continue;
            }
            debug_assert!(state & READER_MASK < READER_MASK);
            if self
                .state
                .compare_exchange_weak(state, state + 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return SeqReadGuard { lock: self };
            }
        }
    }

    #[inline]
    pub fn write(&self) -> SeqWriteGuard<'_> {
        let mut backoff = Backoff::new();
        while self
            .state
            .compare_exchange_weak(0, WRITER_BIT, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            backoff.snooze();
        }
        SeqWriteGuard { lock: self }
    }

    #[inline]
    fn release_read(&self) {
        let old = self.state.fetch_sub(1, Ordering::Release);
        debug_assert!(old & READER_MASK > 0);
    }

    #[inline]
    fn release_write(&self) {
        self.state.store(0, Ordering::Release);
    }
}

impl Default for SeqRwLock {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SeqReadGuard<'a> {
    lock: &'a SeqRwLock,
}

impl Drop for SeqReadGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.lock.release_read();
    }
}

pub struct SeqWriteGuard<'a> {
    lock: &'a SeqRwLock,
}

impl Drop for SeqWriteGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.lock.release_write();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_spinlock_mutual_exclusion() {
        struct Shared {
            lock: SpinLock,
            value: AtomicU64,
        }
        let shared = Arc::new(Shared {
            lock: SpinLock::new(),
            value: AtomicU64::new(0),
        });

        let mut handles = vec![];
        for _ in 0..8 {
            let s = Arc::clone(&shared);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    let _g = s.lock.lock();
                    let v = s.value.load(Ordering::Relaxed);
                    s.value.store(v + 1, Ordering::Relaxed);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(shared.value.load(Ordering::Relaxed), 8000);
    }

    #[test]
    fn test_try_lock() {
        let lock = SpinLock::new();
        let g = lock.try_lock();
        assert!(g.is_some());
        assert!(lock.try_lock().is_none());
        drop(g);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn test_rwlock_readers_share() {
        let lock = SeqRwLock::new();
        let r1 = lock.read();
        let r2 = lock.read();
        drop(r1);
        drop(r2);
        let w = lock.write();
        drop(w);
    }

    #[test]
    fn test_rwlock_writer_excludes() {
        let lock = Arc::new(SeqRwLock::new());
        let counter = Arc::new(AtomicU64::new(0));

        let mut handles = vec![];
        for _ in 0..4 {
            let l = Arc::clone(&lock);
            let c = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                for _ in 0..500 {
                    let _w = l.write();
                    let v = c.load(Ordering::Relaxed);
                    c.store(v + 1, Ordering::Relaxed);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 2000);
    }
}
