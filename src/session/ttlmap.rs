// Copyright (c) 2025 Dataplane Core Contributors
//
// TTLMAP: the lock-sharded session map one generation is built on
//
// A flat, power-of-two array of 8-slot buckets, each guarded by its
// own spinlock. Entries expire by timestamp comparison and expired
// slots are recycled in place on insert. There is no chaining: a full
// bucket surfaces as overflow and the caller decides (the balancer
// reports it, a resize migrates into a bigger table).

use crate::error::{CoreError, Result};
use crate::fwmap::funcs::fnv1a;
use crate::shm::context::MemoryContext;
use crate::shm::lock::{SpinGuard, SpinLock};
use crate::shm::offset::OffsetPtr;
use std::mem;
use std::ptr::NonNull;
use std::slice;
use std::sync::atomic::Ordering;

/// Session slots per bucket.
pub(crate) const SLOTS_PER_BUCKET: usize = 8;

/// Balancer session identity: client address, client port, virtual
/// service. Packed with explicit zero padding so hashing the raw bytes
/// never touches undefined memory.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionId {
    pub client_ip: [u8; 16],
    pub client_port: u16,
    pad: u16,
    pub vs_id: u32,
}

const _: () = assert!(mem::size_of::<SessionId>() == 24);

impl SessionId {
    pub fn new(client_ip: [u8; 16], client_port: u16, vs_id: u32) -> Self {
        Self {
            client_ip,
            client_port,
            pad: 0,
            vs_id,
        }
    }

    #[inline]
    pub(crate) fn as_bytes(&self) -> &[u8] {
        // Safety: repr(C) with explicit padding; every byte is
        // initialized.
        unsafe { slice::from_raw_parts(self as *const Self as *const u8, mem::size_of::<Self>()) }
    }
}

/// One stored session. Mutated only under the owning bucket's lock.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct SessionSlot {
    pub occupied: u32,
    pub real_id: u32,
    pub create_ts: u64,
    pub last_packet_ts: u64,
    pub timeout: u64,
    pub id: SessionId,
}

const _: () = assert!(mem::size_of::<SessionSlot>() == 56);

impl SessionSlot {
    #[inline]
    pub fn is_live(&self, now: u64) -> bool {
        self.occupied != 0 && self.last_packet_ts.saturating_add(self.timeout) > now
    }
}

#[repr(C, align(64))]
pub(crate) struct SessionBucket {
    pub(crate) lock: SpinLock,
    _pad: u32,
    slots: [SessionSlot; SLOTS_PER_BUCKET],
}

#[repr(C)]
pub(crate) struct TtlMapHdr {
    bucket_count: u32,
    bucket_mask: u32,
    hash_seed: u64,
    buckets: OffsetPtr<SessionBucket>,
}

/// Outcome of a locked bucket probe.
pub(crate) enum SlotOutcome {
    Found(*mut SessionSlot),
    Created(*mut SessionSlot),
    Overflow,
}

/// Borrowed view over one generation's map; all operations live here
/// so guards can borrow the arena rather than a temporary handle.
#[derive(Clone, Copy)]
pub(crate) struct TtlView<'a> {
    pub(crate) hdr: &'a TtlMapHdr,
}

impl<'a> TtlView<'a> {
    #[inline]
    fn bucket(self, id: &SessionId) -> &'a SessionBucket {
        let h = fnv1a(id.as_bytes(), self.hdr.hash_seed);
        let idx = (h as u32) & self.hdr.bucket_mask;
        // Safety: idx is masked into the bucket array.
        unsafe { &*self.hdr.buckets.load(Ordering::Relaxed).add(idx as usize) }
    }

    #[inline]
    fn slots(bucket: &SessionBucket) -> *mut SessionSlot {
        bucket.slots.as_ptr() as *mut SessionSlot
    }

    pub fn bucket_count(self) -> u32 {
        self.hdr.bucket_count
    }

    pub fn capacity(self) -> u32 {
        self.hdr.bucket_count * SLOTS_PER_BUCKET as u32
    }

    /// Find-or-claim under the bucket lock; the lock guard is returned
    /// so the caller can keep mutating the slot.
    pub fn get_or_insert(
        self,
        id: &SessionId,
        now: u64,
        timeout: u64,
    ) -> (SpinGuard<'a>, SlotOutcome) {
        let bucket = self.bucket(id);
        let guard = bucket.lock.lock();
        let base = Self::slots(bucket);

        let mut vacant: Option<*mut SessionSlot> = None;
        for i in 0..SLOTS_PER_BUCKET {
            // Safety: i < SLOTS_PER_BUCKET; we hold the bucket lock.
            let slot = unsafe { &mut *base.add(i) };
            if slot.occupied != 0 && slot.id == *id {
                if slot.is_live(now) {
                    slot.last_packet_ts = now;
                    return (guard, SlotOutcome::Found(slot));
                }
                // Same id but expired: recycle in place.
                vacant = Some(slot);
                break;
            }
            if vacant.is_none() && (slot.occupied == 0 || !slot.is_live(now)) {
                vacant = Some(slot);
            }
        }

        match vacant {
            Some(p) => {
                // Safety: p is a slot in this bucket under our lock.
                unsafe {
                    *p = SessionSlot {
                        occupied: 1,
                        real_id: 0,
                        create_ts: now,
                        last_packet_ts: now,
                        timeout,
                        id: *id,
                    };
                }
                (guard, SlotOutcome::Created(p))
            }
            None => (guard, SlotOutcome::Overflow),
        }
    }

    /// Non-mutating lookup that copies the slot out.
    pub fn lookup_copy(self, id: &SessionId, now: u64) -> Option<SessionSlot> {
        let bucket = self.bucket(id);
        let _guard = bucket.lock.lock();
        let base = Self::slots(bucket);
        for i in 0..SLOTS_PER_BUCKET {
            // Safety: under the bucket lock.
            let slot = unsafe { &*base.add(i) };
            if slot.occupied != 0 && slot.id == *id && slot.is_live(now) {
                return Some(*slot);
            }
        }
        None
    }

    /// Copy a bucket's occupied slots out under its lock. Used by the
    /// resize migration, which must not hold two bucket locks at once.
    pub fn copy_bucket(self, idx: u32, out: &mut Vec<SessionSlot>) {
        debug_assert!(idx < self.hdr.bucket_count);
        // Safety: idx checked against bucket_count.
        let bucket = unsafe { &*self.hdr.buckets.load(Ordering::Relaxed).add(idx as usize) };
        let _guard = bucket.lock.lock();
        let base = Self::slots(bucket);
        for i in 0..SLOTS_PER_BUCKET {
            // Safety: under the bucket lock.
            let slot = unsafe { &*base.add(i) };
            if slot.occupied != 0 {
                out.push(*slot);
            }
        }
    }

    /// Insert a migrated slot preserving its timestamps. Returns false
    /// on bucket overflow.
    pub fn insert_migrated(self, migrated: &SessionSlot) -> bool {
        let bucket = self.bucket(&migrated.id);
        let _guard = bucket.lock.lock();
        let base = Self::slots(bucket);
        let mut vacant: Option<*mut SessionSlot> = None;
        for i in 0..SLOTS_PER_BUCKET {
            // Safety: under the bucket lock.
            let slot = unsafe { &mut *base.add(i) };
            if slot.occupied != 0 && slot.id == migrated.id {
                // The worker re-created it in this generation already;
                // keep the newer state.
                return true;
            }
            if vacant.is_none() && slot.occupied == 0 {
                vacant = Some(slot);
            }
        }
        match vacant {
            Some(p) => {
                // Safety: slot in this bucket under our lock.
                unsafe { *p = *migrated };
                true
            }
            None => false,
        }
    }
}

/// Owning handle: creation and destruction of one generation's map.
pub(crate) struct TtlMap {
    hdr: NonNull<TtlMapHdr>,
    ctx: MemoryContext,
}

impl TtlMap {
    pub fn create(ctx: &MemoryContext, capacity: u32, hash_seed: u64) -> Result<TtlMap> {
        if capacity == 0 {
            return Err(CoreError::Config("session capacity must be non-zero".into()));
        }
        let bucket_count = capacity
            .div_ceil(SLOTS_PER_BUCKET as u32)
            .next_power_of_two();
        let hdr_mem = ctx.alloc(mem::size_of::<TtlMapHdr>())?;
        let hdr = hdr_mem.cast::<TtlMapHdr>();
        let buckets = match ctx.alloc(bucket_count as usize * mem::size_of::<SessionBucket>()) {
            Ok(b) => b,
            Err(e) => {
                ctx.free(hdr_mem);
                return Err(e);
            }
        };
        // Safety: zeroed allocation; zero is a valid empty bucket.
        unsafe {
            let h = hdr.as_ptr();
            (*h).bucket_count = bucket_count;
            (*h).bucket_mask = bucket_count - 1;
            (*h).hash_seed = hash_seed;
            (*h).buckets
                .store(buckets.as_ptr() as *mut SessionBucket, Ordering::Release);
        }
        Ok(TtlMap {
            hdr,
            ctx: ctx.clone(),
        })
    }

    pub fn hdr_ptr(&self) -> NonNull<TtlMapHdr> {
        self.hdr
    }

    pub fn destroy(self) {
        Self::destroy_raw(&self.ctx, self.hdr);
    }

    pub fn destroy_raw(ctx: &MemoryContext, hdr: NonNull<TtlMapHdr>) {
        // Safety: hdr and its bucket array came from ctx; callers
        // guarantee no remaining readers.
        unsafe {
            let b = hdr.as_ref().buckets.load(Ordering::Relaxed);
            if let Some(p) = NonNull::new(b as *mut u8) {
                ctx.free(p);
            }
            ctx.free(hdr.cast());
        }
    }
}
