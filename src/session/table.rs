// Copyright (c) 2025 Dataplane Core Contributors
//
// Two-generation session table with on-line resize
//
// Two TTLMAP slots and a generation counter. The active slot is
// `((gen + 1) & 0b11) >> 1`; odd parity means a resize is in flight
// and lookups that miss the new map must fall back to the previous
// one. Workers publish `(gen << 1) | in_use` marks; the controller
// advances the generation one step at a time and polls the marks until
// every worker has either left the table or observed the new
// generation, then migrates live sessions and frees the old map.

use crate::error::{CoreError, Result};
use crate::session::ttlmap::{SessionSlot, SlotOutcome, TtlMap, TtlMapHdr, TtlView};
use crate::session::SessionId;
use crate::shm::context::MemoryContext;
use crate::shm::lock::SpinGuard;
use crate::shm::offset::OffsetPtr;
use crate::MAX_WORKERS;
use rand::Rng;
use serde::Serialize;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Duration;
use tracing::debug;

#[repr(C)]
struct SessionTableHdr {
    current_gen: AtomicU32,
    worker_count: u32,
    maps: [OffsetPtr<TtlMapHdr>; 2],
    marks: OffsetPtr<WorkerMark>,
    hash_seed: u64,
}

#[repr(C, align(64))]
struct WorkerMark {
    mark: AtomicU32,
}

/// Status of a `get_or_create`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Found,
    Created,
    Overflow,
}

/// A locked reference to one session. Holds the bucket lock and the
/// caller's worker mark; both are released on drop (`unlock`).
pub struct SessionRef<'a> {
    slot: *mut SessionSlot,
    _bucket: SpinGuard<'a>,
    mark: &'a AtomicU32,
    gen: u32,
}

impl SessionRef<'_> {
    pub fn id(&self) -> SessionId {
        // Safety: the slot is valid and we hold its bucket lock.
        unsafe { (*self.slot).id }
    }

    pub fn real_id(&self) -> u32 {
        // Safety: as id().
        unsafe { (*self.slot).real_id }
    }

    pub fn set_real_id(&mut self, real_id: u32) {
        // Safety: as id(); the bucket lock makes this exclusive.
        unsafe { (*self.slot).real_id = real_id }
    }

    pub fn create_timestamp(&self) -> u64 {
        // Safety: as id().
        unsafe { (*self.slot).create_ts }
    }

    pub fn last_packet_timestamp(&self) -> u64 {
        // Safety: as id().
        unsafe { (*self.slot).last_packet_ts }
    }

    pub fn timeout(&self) -> u64 {
        // Safety: as id().
        unsafe { (*self.slot).timeout }
    }

    /// Drop the session from the table.
    pub fn remove(self) {
        // Safety: as id(); the guard is still held.
        unsafe { (*self.slot).occupied = 0 }
    }

    /// Release the bucket lock and the worker mark.
    pub fn unlock(self) {}
}

impl Drop for SessionRef<'_> {
    fn drop(&mut self) {
        self.mark.store(self.gen << 1, Ordering::Release);
    }
}

/// Outcome of `get_or_create` with the session reference attached.
pub enum SessionLookup<'a> {
    Found(SessionRef<'a>),
    Created(SessionRef<'a>),
    Overflow,
}

impl SessionLookup<'_> {
    pub fn status(&self) -> SessionStatus {
        match self {
            SessionLookup::Found(_) => SessionStatus::Found,
            SessionLookup::Created(_) => SessionStatus::Created,
            SessionLookup::Overflow => SessionStatus::Overflow,
        }
    }
}

/// Session info snapshot row for the control plane.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub client_ip: [u8; 16],
    pub client_port: u16,
    pub vs_id: u32,
    pub real_id: u32,
    pub create_timestamp: u64,
    pub last_packet_timestamp: u64,
    pub timeout: u64,
}

/// The resizable two-generation session table.
pub struct SessionTable {
    hdr: NonNull<SessionTableHdr>,
    ctx: MemoryContext,
}

// Safety: shared state is atomics and bucket-locked slots inside the
// arena.
unsafe impl Send for SessionTable {}
unsafe impl Sync for SessionTable {}

impl SessionTable {
    /// Allocate a table with the given session capacity and worker
    /// count. The capacity rounds up to whole buckets.
    pub fn init(ctx: &MemoryContext, size: u32, workers: u32) -> Result<SessionTable> {
        if workers == 0 || workers as usize > MAX_WORKERS {
            return Err(CoreError::Config(format!(
                "worker count {workers} out of range"
            )));
        }
        let hdr_mem = ctx.alloc(mem::size_of::<SessionTableHdr>())?;
        let hdr = hdr_mem.cast::<SessionTableHdr>();
        let seed = rand::rng().random::<u64>();

        let marks = match ctx.alloc(workers as usize * mem::size_of::<WorkerMark>()) {
            Ok(m) => m,
            Err(e) => {
                ctx.free(hdr_mem);
                return Err(e);
            }
        };
        let first = match TtlMap::create(ctx, size, seed) {
            Ok(m) => m,
            Err(e) => {
                ctx.free(marks);
                ctx.free(hdr_mem);
                return Err(e);
            }
        };
        // Safety: zeroed header allocation, exclusively ours.
        unsafe {
            let h = hdr.as_ptr();
            (*h).worker_count = workers;
            (*h).hash_seed = seed;
            (*h).marks
                .store(marks.as_ptr() as *mut WorkerMark, Ordering::Relaxed);
            (*h).maps[0].store(first.hdr_ptr().as_ptr(), Ordering::Release);
        }
        Ok(SessionTable {
            hdr,
            ctx: ctx.clone(),
        })
    }

    fn hdr(&self) -> &SessionTableHdr {
        // Safety: valid for the handle's lifetime.
        unsafe { self.hdr.as_ref() }
    }

    #[inline]
    fn active_slot(gen: u32) -> usize {
        (((gen + 1) & 0b11) >> 1) as usize
    }

    fn ttl_view(&self, slot: usize) -> Option<TtlView<'_>> {
        let p = self.hdr().maps[slot].load(Ordering::Acquire);
        if p.is_null() {
            None
        } else {
            // Safety: generation maps are freed only after both
            // quiescence waits of the resize protocol.
            Some(TtlView { hdr: unsafe { &*p } })
        }
    }

    fn mark(&self, worker_idx: usize) -> &AtomicU32 {
        debug_assert!(worker_idx < self.hdr().worker_count as usize);
        // Safety: the marks array holds worker_count slots.
        unsafe {
            &(*self.hdr().marks.load(Ordering::Relaxed).add(worker_idx)).mark
        }
    }

    /// Publish `(gen << 1) | 1` for this worker, re-reading the
    /// generation until the mark and the counter agree.
    fn enter(&self, mark: &AtomicU32) -> u32 {
        loop {
            let gen = self.hdr().current_gen.load(Ordering::SeqCst);
            mark.store((gen << 1) | 1, Ordering::SeqCst);
            if self.hdr().current_gen.load(Ordering::SeqCst) == gen {
                return gen;
            }
        }
    }

    /// Session capacity of the active generation.
    pub fn capacity(&self) -> u32 {
        let gen = self.hdr().current_gen.load(Ordering::SeqCst);
        self.ttl_view(Self::active_slot(gen))
            .map(|v| v.capacity())
            .unwrap_or(0)
    }

    pub fn worker_count(&self) -> u32 {
        self.hdr().worker_count
    }

    /// Find or create the session for `id`.
    ///
    /// While a resize is in flight, an id that was created in the new
    /// map but exists live in the previous generation reports `Found`
    /// with the previous state carried over, so a session never
    /// duplicates across a resize.
    pub fn get_or_create<'a>(
        &'a self,
        worker_idx: usize,
        now: u64,
        timeout: u64,
        id: &SessionId,
    ) -> SessionLookup<'a> {
        let mark = self.mark(worker_idx);
        let gen = self.enter(mark);
        let active = Self::active_slot(gen);
        let view = match self.ttl_view(active) {
            Some(v) => v,
            None => {
                mark.store(gen << 1, Ordering::Release);
                return SessionLookup::Overflow;
            }
        };

        let (bucket, outcome) = view.get_or_insert(id, now, timeout);
        match outcome {
            SlotOutcome::Found(slot) => SessionLookup::Found(SessionRef {
                slot,
                _bucket: bucket,
                mark,
                gen,
            }),
            SlotOutcome::Overflow => {
                drop(bucket);
                mark.store(gen << 1, Ordering::Release);
                SessionLookup::Overflow
            }
            SlotOutcome::Created(slot) => {
                if gen & 1 == 1 {
                    // Resize in flight: the previous generation may
                    // still hold this session.
                    if let Some(prev) = self.ttl_view(active ^ 1) {
                        if let Some(old) = prev.lookup_copy(id, now) {
                            // Safety: slot belongs to the bucket we
                            // hold locked.
                            unsafe {
                                (*slot).real_id = old.real_id;
                                (*slot).create_ts = old.create_ts;
                                (*slot).timeout = old.timeout;
                            }
                            return SessionLookup::Found(SessionRef {
                                slot,
                                _bucket: bucket,
                                mark,
                                gen,
                            });
                        }
                    }
                }
                SessionLookup::Created(SessionRef {
                    slot,
                    _bucket: bucket,
                    mark,
                    gen,
                })
            }
        }
    }

    /// Resolve the backend for `id` without mutating the session.
    pub fn get_real(&self, id: &SessionId, now: u64, worker_idx: usize) -> Option<u32> {
        let mark = self.mark(worker_idx);
        let gen = self.enter(mark);
        let active = Self::active_slot(gen);

        let mut real = self
            .ttl_view(active)
            .and_then(|v| v.lookup_copy(id, now))
            .map(|s| s.real_id);
        if real.is_none() && gen & 1 == 1 {
            real = self
                .ttl_view(active ^ 1)
                .and_then(|v| v.lookup_copy(id, now))
                .map(|s| s.real_id);
        }
        mark.store(gen << 1, Ordering::Release);
        real
    }

    fn wait_for_workers(&self, target_gen: u32) {
        let workers = self.hdr().worker_count as usize;
        for w in 0..workers {
            let mark = self.mark(w);
            loop {
                let m = mark.load(Ordering::SeqCst);
                if m & 1 == 0 || (m >> 1) >= target_gen {
                    break;
                }
                thread::sleep(Duration::from_millis(1));
            }
        }
    }

    /// Change the table capacity without stopping traffic.
    ///
    /// Allocation failure aborts with no visible change. Otherwise the
    /// generation advances twice with a quiescence wait after each
    /// step; live sessions are migrated with their timestamps
    /// preserved and the old map is freed at the end.
    pub fn resize(&self, new_size: u32, now: u64) -> Result<()> {
        let hdr = self.hdr();
        let gen = hdr.current_gen.load(Ordering::SeqCst);
        if gen & 1 == 1 {
            return Err(CoreError::Config("resize already in progress".into()));
        }
        let active = Self::active_slot(gen);
        let spare = active ^ 1;
        debug_assert!(hdr.maps[spare].is_null(Ordering::Acquire));

        let new_map = TtlMap::create(&self.ctx, new_size, hdr.hash_seed)?;
        hdr.maps[spare].store(new_map.hdr_ptr().as_ptr(), Ordering::Release);

        hdr.current_gen.store(gen + 1, Ordering::SeqCst);
        self.wait_for_workers(gen + 1);
        debug!(gen = gen + 1, "resize: workers entered split generation");

        // Migrate live sessions bucket by bucket. The old bucket lock
        // is released before inserting so a worker holding a new-map
        // bucket while probing the old map cannot deadlock with us.
        let old_view = self.ttl_view(active).expect("active map present");
        let new_view = self.ttl_view(spare).expect("new map present");
        let mut batch = Vec::new();
        let mut migrated = 0u64;
        for b in 0..old_view.bucket_count() {
            batch.clear();
            old_view.copy_bucket(b, &mut batch);
            for slot in &batch {
                if !slot.is_live(now) {
                    continue;
                }
                if new_view.insert_migrated(slot) {
                    migrated += 1;
                }
            }
        }

        hdr.current_gen.store(gen + 2, Ordering::SeqCst);
        self.wait_for_workers(gen + 2);

        let old = hdr.maps[active].load(Ordering::Acquire);
        hdr.maps[active].store(ptr::null_mut(), Ordering::Release);
        // Safety: both waits completed; no worker can reference the
        // old generation anymore.
        TtlMap::destroy_raw(&self.ctx, unsafe { NonNull::new_unchecked(old) });
        debug!(migrated, new_size, "resize complete");
        Ok(())
    }

    /// Snapshot live sessions (or just count them when `only_count`).
    pub fn fill_sessions_info(
        &self,
        out: &mut Vec<SessionInfo>,
        now: u64,
        only_count: bool,
    ) -> usize {
        let gen = self.hdr().current_gen.load(Ordering::SeqCst);
        let active = Self::active_slot(gen);
        let mut count = 0usize;
        let mut batch = Vec::new();

        let mut visit = |slot: &SessionSlot, out: &mut Vec<SessionInfo>| {
            count += 1;
            if !only_count {
                out.push(SessionInfo {
                    client_ip: slot.id.client_ip,
                    client_port: slot.id.client_port,
                    vs_id: slot.id.vs_id,
                    real_id: slot.real_id,
                    create_timestamp: slot.create_ts,
                    last_packet_timestamp: slot.last_packet_ts,
                    timeout: slot.timeout,
                });
            }
        };

        if let Some(view) = self.ttl_view(active) {
            for b in 0..view.bucket_count() {
                batch.clear();
                view.copy_bucket(b, &mut batch);
                for slot in batch.iter().filter(|s| s.is_live(now)) {
                    visit(slot, out);
                }
            }
            if gen & 1 == 1 {
                if let Some(prev) = self.ttl_view(active ^ 1) {
                    for b in 0..prev.bucket_count() {
                        batch.clear();
                        prev.copy_bucket(b, &mut batch);
                        for slot in batch.iter().filter(|s| s.is_live(now)) {
                            // Skip ids already counted from the new map.
                            if view.lookup_copy(&slot.id, now).is_none() {
                                visit(slot, out);
                            }
                        }
                    }
                }
            }
        }
        count
    }

    /// Free both generations, the marks and the header.
    pub fn free(self) {
        let hdr = self.hdr();
        for slot in 0..2 {
            let p = hdr.maps[slot].load(Ordering::Relaxed);
            if let Some(nn) = NonNull::new(p) {
                TtlMap::destroy_raw(&self.ctx, nn);
            }
        }
        let marks = hdr.marks.load(Ordering::Relaxed);
        if let Some(nn) = NonNull::new(marks as *mut u8) {
            self.ctx.free(nn);
        }
        self.ctx.free(self.hdr.cast());
    }
}
