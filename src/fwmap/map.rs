// Copyright (c) 2025 Dataplane Core Contributors
//
// Single-layer TTL hash map (FwMap)
//
// A concurrent, bucketed, chained hash table over fixed-size keys and
// values with a per-entry deadline, laid out entirely in the shared
// arena. The index is an array of cache-line buckets allocated in
// chunks; overflow chains are indices into a flat extra-bucket pool;
// keys and values live in chunked stores addressed by a 32-bit key
// index handed out by a monotonic cursor. Per-bucket reader/writer
// spinlocks protect a whole chain (writers always lock the primary
// bucket), and per-worker counter slots keep statistics race-free.

use crate::error::{CoreError, Result};
use crate::fwmap::bucket::{
    Bucket, WorkerCounters, CHUNK_BUCKETS, CHUNK_SHIFT, ENTRIES_PER_BUCKET,
};
use crate::fwmap::funcs::{
    self, CopyKind, FuncSet, HashKind, KeyEqKind, MergeKind, FUNC_REGISTRY,
};
use crate::shm::context::MemoryContext;
use crate::shm::lock::{SeqReadGuard, SeqWriteGuard};
use crate::shm::offset::OffsetPtr;
use crate::MAX_WORKERS;
use rand::Rng;
use serde::Serialize;
use std::mem;
use std::ptr::NonNull;
use std::slice;
use std::sync::atomic::{AtomicU32, Ordering};

/// Smallest allowed index size (bucket count).
pub const MIN_INDEX_SIZE: u32 = 16;

/// Largest supported key/value width in bytes.
pub const MAX_KEY_SIZE: usize = 256;
pub const MAX_VALUE_SIZE: usize = 256;

/// Chunk-table width; bounds the index at MAX_CHUNKS * CHUNK_BUCKETS
/// buckets.
pub(crate) const MAX_CHUNKS: usize = 256;

/// Map construction parameters.
///
/// `index_size` is rounded up to a power of two. The function fields
/// are stored in the shared header as ids only, so two processes built
/// from the same strategy table can share the map.
#[derive(Debug, Clone, Serialize)]
pub struct FwMapConfig {
    pub key_size: u32,
    pub value_size: u32,
    pub worker_count: u32,
    pub index_size: u32,
    pub extra_bucket_count: u32,
    pub hash: HashKind,
    pub key_eq: KeyEqKind,
    pub copy: CopyKind,
    pub merge: MergeKind,
    /// Explicit seed; a random one is drawn when absent.
    pub hash_seed: Option<u64>,
}

impl Default for FwMapConfig {
    fn default() -> Self {
        Self {
            key_size: 16,
            value_size: 8,
            worker_count: 1,
            index_size: 1024,
            extra_bucket_count: 256,
            hash: HashKind::Fnv1a,
            key_eq: KeyEqKind::Bytes,
            copy: CopyKind::Bytes,
            merge: MergeKind::Replace,
            hash_seed: None,
        }
    }
}

impl FwMapConfig {
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(CoreError::Config(msg));
        if self.key_size == 0 || self.key_size as usize > MAX_KEY_SIZE {
            return fail(format!("key_size {} out of range", self.key_size));
        }
        if self.value_size == 0 || self.value_size as usize > MAX_VALUE_SIZE {
            return fail(format!("value_size {} out of range", self.value_size));
        }
        if self.worker_count == 0 || self.worker_count as usize > MAX_WORKERS {
            return fail(format!("worker_count {} out of range", self.worker_count));
        }
        let rounded = self.index_size.next_power_of_two().max(MIN_INDEX_SIZE);
        if rounded as usize > MAX_CHUNKS * CHUNK_BUCKETS {
            return fail(format!("index_size {} too large", self.index_size));
        }
        if self.merge == MergeKind::AddU64 && self.value_size < 8 {
            return fail("AddU64 merge requires value_size >= 8".to_string());
        }
        if !FUNC_REGISTRY.hashes.contains(&self.hash) {
            return fail(format!("unregistered hash strategy {:?}", self.hash));
        }
        if !FUNC_REGISTRY.merges.contains(&self.merge) {
            return fail(format!("unregistered merge strategy {:?}", self.merge));
        }
        Ok(())
    }
}

/// Shared header of one map layer. Everything it references is reached
/// through offset pointers, so the layer is position independent.
#[repr(C)]
pub(crate) struct FwMapHdr {
    key_size: u32,
    value_size: u32,
    worker_count: u32,
    index_size: u32,
    index_mask: u32,
    slot_mask: u32,
    extra_count: u32,
    hash_id: u8,
    eq_id: u8,
    copy_id: u8,
    merge_id: u8,
    hash_seed: u64,
    pub(crate) layer_gen: u64,
    pub(crate) key_cursor: AtomicU32,
    pub(crate) extra_free_idx: AtomicU32,
    pub(crate) sealed_count: AtomicU32,
    _pad: u32,
    pub(crate) next: OffsetPtr<FwMapHdr>,
    extra: OffsetPtr<Bucket>,
    counters: OffsetPtr<WorkerCounters>,
    index_chunks: [OffsetPtr<Bucket>; MAX_CHUNKS],
    key_chunks: [OffsetPtr<u8>; MAX_CHUNKS],
    value_chunks: [OffsetPtr<u8>; MAX_CHUNKS],
}

impl FwMapHdr {
    #[inline]
    fn bucket(&self, idx: u32) -> *mut Bucket {
        let chunk = (idx >> CHUNK_SHIFT) as usize;
        let slot = (idx & self.slot_mask) as usize;
        // Safety: idx < index_size, so the chunk pointer is non-null
        // and slot is within the chunk.
        unsafe { self.index_chunks[chunk].load(Ordering::Relaxed).add(slot) }
    }

    #[inline]
    fn extra_bucket(&self, idx: u32) -> *mut Bucket {
        debug_assert!(idx >= 1 && idx < self.extra_count);
        // Safety: the extra pool holds extra_count buckets.
        unsafe { self.extra.load(Ordering::Relaxed).add(idx as usize) }
    }

    #[inline]
    fn key_ptr(&self, key_index: u32) -> *mut u8 {
        let chunk = (key_index >> CHUNK_SHIFT) as usize;
        let off = (key_index as usize & (CHUNK_BUCKETS - 1)) * self.key_size as usize;
        // Safety: key_index came from key_cursor, which is bounded by
        // index_size; the chunk was allocated at construction.
        unsafe { self.key_chunks[chunk].load(Ordering::Relaxed).add(off) }
    }

    #[inline]
    fn value_ptr(&self, key_index: u32) -> *mut u8 {
        let chunk = (key_index >> CHUNK_SHIFT) as usize;
        let off = (key_index as usize & (CHUNK_BUCKETS - 1)) * self.value_size as usize;
        // Safety: as key_ptr.
        unsafe { self.value_chunks[chunk].load(Ordering::Relaxed).add(off) }
    }

    #[inline]
    fn counters(&self, worker_idx: usize) -> &WorkerCounters {
        debug_assert!(worker_idx < self.worker_count as usize);
        // Safety: the counters array holds worker_count slots.
        unsafe { &*self.counters.load(Ordering::Relaxed).add(worker_idx) }
    }
}

/// Coerce the top 16 hash bits into a signature; zero is reserved for
/// empty slots.
#[inline]
fn signature(hash: u64) -> u16 {
    let sig = (hash >> 48) as u16;
    if sig == 0 {
        1
    } else {
        sig
    }
}

/// Aggregated map statistics, summed over the per-worker slots.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FwMapStats {
    pub total_elements: u64,
    pub max_chain: u64,
    pub max_deadline: u64,
    pub index_size: u32,
    pub keys_used: u32,
    pub extra_used: u32,
}

/// A successful lookup holding the bucket read lock.
pub struct FwMapGuard<'a> {
    _lock: SeqReadGuard<'a>,
    value: *const u8,
    value_len: usize,
    key_index: u32,
    deadline: u64,
}

impl FwMapGuard<'_> {
    pub fn value(&self) -> &[u8] {
        // Safety: value points at value_len bytes in the value store;
        // the held read lock keeps writers out of this chain.
        unsafe { slice::from_raw_parts(self.value, self.value_len) }
    }

    pub fn key_index(&self) -> u32 {
        self.key_index
    }

    pub fn deadline(&self) -> u64 {
        self.deadline
    }
}

/// A slot obtained from `entry`, holding the bucket write lock.
///
/// For `EntryStatus::Inserted` the caller must fill the key (and
/// normally the value) before dropping the guard; `put` does both.
pub struct FwMapEntry<'a> {
    _lock: SeqWriteGuard<'a>,
    key: *mut u8,
    value: *mut u8,
    key_len: usize,
    value_len: usize,
    key_index: u32,
    deadline: u64,
    copy: CopyKind,
}

impl FwMapEntry<'_> {
    pub fn key_index(&self) -> u32 {
        self.key_index
    }

    pub fn deadline(&self) -> u64 {
        self.deadline
    }

    pub fn value_mut(&mut self) -> &mut [u8] {
        // Safety: value points at value_len bytes; the held write lock
        // gives exclusive access to this chain.
        unsafe { slice::from_raw_parts_mut(self.value, self.value_len) }
    }

    pub fn write_key(&mut self, key: &[u8]) {
        debug_assert_eq!(key.len(), self.key_len);
        // Safety: as value_mut, for the key store slot.
        let dst = unsafe { slice::from_raw_parts_mut(self.key, self.key_len) };
        funcs::copy_bytes(self.copy, dst, key);
    }

    pub fn write_value(&mut self, value: &[u8]) {
        debug_assert_eq!(value.len(), self.value_len);
        let copy = self.copy;
        funcs::copy_bytes(copy, self.value_mut(), value);
    }
}

/// Outcome of `entry`.
pub enum EntryStatus<'a> {
    /// A live entry for the key existed; its deadline was refreshed.
    Occupied(FwMapEntry<'a>),
    /// A slot was claimed (empty or expired); the key must be written.
    Inserted(FwMapEntry<'a>),
    /// Key cursor or extra-bucket pool exhausted.
    Full,
}

/// Borrowed, copyable view over a layer header. All map operations are
/// implemented here so the layer chain can run them on tail layers
/// without constructing owning handles.
#[derive(Clone, Copy)]
pub(crate) struct MapView<'a> {
    pub(crate) hdr: &'a FwMapHdr,
    pub(crate) funcs: FuncSet,
}

impl<'a> MapView<'a> {
    #[inline]
    fn locate(self, key: &[u8]) -> (u16, u32) {
        let h = funcs::hash_key(self.funcs.hash, key, self.hdr.hash_seed);
        (signature(h), (h as u32) & self.hdr.index_mask)
    }

    #[inline]
    fn chain_next(self, bucket: &Bucket) -> Option<&'a Bucket> {
        let n = bucket.next.load(Ordering::Acquire);
        if n == 0 {
            None
        } else {
            // Safety: next indices are only ever set to claimed extra
            // buckets, which live for the lifetime of the layer.
            Some(unsafe { &*self.hdr.extra_bucket(n) })
        }
    }

    /// Walk a chain for a live entry matching `key`. Returns the
    /// resolved key index and deadline. The caller provides whatever
    /// locking the layer position requires.
    fn find(self, key: &[u8], now: u64, sig: u16, primary: &'a Bucket) -> Option<(u32, u64)> {
        let mut cur = primary;
        loop {
            for e in 0..ENTRIES_PER_BUCKET {
                let s = cur.sig(e);
                if s == 0 {
                    // Empty-tail invariant: nothing occupied follows.
                    return None;
                }
                if s != sig {
                    continue;
                }
                let deadline = cur.deadline(e);
                if deadline <= now {
                    continue;
                }
                let key_index = cur.key_index(e);
                // Safety: key_index was published with the entry and
                // its store slot is never reused while the map lives.
                let stored = unsafe {
                    slice::from_raw_parts(self.hdr.key_ptr(key_index), self.hdr.key_size as usize)
                };
                if funcs::keys_equal(self.funcs.key_eq, stored, key) {
                    return Some((key_index, deadline));
                }
            }
            cur = match self.chain_next(cur) {
                Some(b) => b,
                None => return None,
            };
        }
    }

    /// Deadline-checked lookup under the primary bucket's read lock.
    pub fn get(self, key: &[u8], now: u64) -> Option<FwMapGuard<'a>> {
        debug_assert_eq!(key.len(), self.hdr.key_size as usize);
        let (sig, bidx) = self.locate(key);
        // Safety: bidx is masked into the index.
        let primary = unsafe { &*self.hdr.bucket(bidx) };
        let lock = primary.lock.read();
        let (key_index, deadline) = self.find(key, now, sig, primary)?;
        Some(FwMapGuard {
            _lock: lock,
            value: self.hdr.value_ptr(key_index),
            value_len: self.hdr.value_size as usize,
            key_index,
            deadline,
        })
    }

    /// Lock-free lookup that copies the value out. Only sound on
    /// layers that no longer accept writes (sealed tail layers).
    pub fn get_copy(self, key: &[u8], now: u64, out: &mut [u8]) -> Option<(u32, u64)> {
        debug_assert_eq!(out.len(), self.hdr.value_size as usize);
        let (sig, bidx) = self.locate(key);
        // Safety: bidx is masked into the index.
        let primary = unsafe { &*self.hdr.bucket(bidx) };
        let (key_index, deadline) = self.find(key, now, sig, primary)?;
        // Safety: the value slot outlives the layer; tail layers are
        // read-only so the bytes are stable.
        let src = unsafe {
            slice::from_raw_parts(self.hdr.value_ptr(key_index), self.hdr.value_size as usize)
        };
        out.copy_from_slice(src);
        Some((key_index, deadline))
    }

    /// Find or claim a slot for `key` with deadline `now + ttl`,
    /// holding the primary bucket's write lock.
    pub fn entry(self, worker_idx: usize, key: &[u8], now: u64, ttl: u64) -> EntryStatus<'a> {
        let hdr = self.hdr;
        debug_assert_eq!(key.len(), hdr.key_size as usize);
        let (sig, bidx) = self.locate(key);
        let deadline = now.saturating_add(ttl);
        // Safety: bidx is masked into the index.
        let primary = unsafe { &*hdr.bucket(bidx) };
        let lock = primary.lock.write();

        let mut cur = primary;
        let mut last = primary;
        let mut chain_len = 1u64;
        let mut empty_slot: Option<(&Bucket, usize)> = None;
        let mut expired_slot: Option<(&Bucket, usize)> = None;

        'walk: loop {
            for e in 0..ENTRIES_PER_BUCKET {
                let s = cur.sig(e);
                if s == 0 {
                    empty_slot = Some((cur, e));
                    break 'walk;
                }
                let dl = cur.deadline(e);
                if s == sig && dl > now {
                    let key_index = cur.key_index(e);
                    // Safety: live entry, slot never reused.
                    let stored = unsafe {
                        slice::from_raw_parts(hdr.key_ptr(key_index), hdr.key_size as usize)
                    };
                    if funcs::keys_equal(self.funcs.key_eq, stored, key) {
                        cur.set_deadline(e, deadline);
                        hdr.counters(worker_idx).note(false, chain_len, deadline);
                        return EntryStatus::Occupied(self.entry_at(lock, key_index, deadline));
                    }
                }
                if dl <= now && expired_slot.is_none() {
                    expired_slot = Some((cur, e));
                }
            }
            match self.chain_next(cur) {
                Some(b) => {
                    last = b;
                    cur = b;
                    chain_len += 1;
                }
                None => break,
            }
        }

        // An empty slot wins over an expired one: filling it keeps the
        // occupied prefix dense.
        if let Some((bucket, e)) = empty_slot {
            let key_index = match self.alloc_key_index() {
                Some(k) => k,
                None => return EntryStatus::Full,
            };
            bucket.fill(e, sig, key_index, deadline);
            hdr.counters(worker_idx).note(true, chain_len, deadline);
            return EntryStatus::Inserted(self.entry_at(lock, key_index, deadline));
        }
        if let Some((bucket, e)) = expired_slot {
            // The expired entry's key/value slots are recycled in
            // place; the physical element count does not change.
            let key_index = bucket.key_index(e);
            bucket.fill(e, sig, key_index, deadline);
            hdr.counters(worker_idx).note(false, chain_len, deadline);
            return EntryStatus::Inserted(self.entry_at(lock, key_index, deadline));
        }

        // Chain is fully occupied: claim the next extra bucket and
        // splice it at the tail.
        let xidx = hdr.extra_free_idx.fetch_add(1, Ordering::Relaxed);
        if xidx >= hdr.extra_count {
            return EntryStatus::Full;
        }
        let key_index = match self.alloc_key_index() {
            Some(k) => k,
            None => return EntryStatus::Full,
        };
        // Safety: xidx was claimed from the cursor and is in range.
        let xb = unsafe { &*hdr.extra_bucket(xidx) };
        xb.fill(0, sig, key_index, deadline);
        last.next.store(xidx, Ordering::Release);
        chain_len += 1;
        hdr.counters(worker_idx).note(true, chain_len, deadline);
        EntryStatus::Inserted(self.entry_at(lock, key_index, deadline))
    }

    fn entry_at(
        self,
        lock: SeqWriteGuard<'a>,
        key_index: u32,
        deadline: u64,
    ) -> FwMapEntry<'a> {
        FwMapEntry {
            _lock: lock,
            key: self.hdr.key_ptr(key_index),
            value: self.hdr.value_ptr(key_index),
            key_len: self.hdr.key_size as usize,
            value_len: self.hdr.value_size as usize,
            key_index,
            deadline,
            copy: self.funcs.copy,
        }
    }

    fn alloc_key_index(self) -> Option<u32> {
        let k = self.hdr.key_cursor.fetch_add(1, Ordering::Relaxed);
        if k > self.hdr.index_mask {
            None
        } else {
            Some(k)
        }
    }

    /// Insert or refresh a key/value pair. Returns the key index, or
    /// None when the map is full.
    pub fn put(self, worker_idx: usize, key: &[u8], value: &[u8], now: u64, ttl: u64) -> Option<u32> {
        match self.entry(worker_idx, key, now, ttl) {
            EntryStatus::Full => None,
            EntryStatus::Occupied(mut e) => {
                e.write_value(value);
                Some(e.key_index())
            }
            EntryStatus::Inserted(mut e) => {
                e.write_key(key);
                e.write_value(value);
                Some(e.key_index())
            }
        }
    }

    /// Visit every live entry under per-bucket read locks.
    pub fn iter<F: FnMut(&[u8], &[u8], u64)>(self, now: u64, mut f: F) {
        let hdr = self.hdr;
        for bidx in 0..hdr.index_size {
            // Safety: bidx < index_size.
            let primary = unsafe { &*hdr.bucket(bidx) };
            let _lock = primary.lock.read();
            let mut cur = primary;
            'chain: loop {
                for e in 0..ENTRIES_PER_BUCKET {
                    let s = cur.sig(e);
                    if s == 0 {
                        break 'chain;
                    }
                    let deadline = cur.deadline(e);
                    if deadline <= now {
                        continue;
                    }
                    let key_index = cur.key_index(e);
                    // Safety: entry is occupied; slots are stable.
                    unsafe {
                        let k = slice::from_raw_parts(
                            hdr.key_ptr(key_index),
                            hdr.key_size as usize,
                        );
                        let v = slice::from_raw_parts(
                            hdr.value_ptr(key_index),
                            hdr.value_size as usize,
                        );
                        f(k, v, deadline);
                    }
                }
                cur = match self.chain_next(cur) {
                    Some(b) => b,
                    None => break,
                };
            }
        }
    }

    /// Drop every entry and reset the cursors and counters. A
    /// controller-side operation: concurrent writers on other buckets
    /// see individual chains reset, not one atomic snapshot.
    pub fn clear(self) {
        let hdr = self.hdr;
        for bidx in 0..hdr.index_size {
            // Safety: bidx < index_size.
            let primary = unsafe { &*hdr.bucket(bidx) };
            let _lock = primary.lock.write();
            primary.reset();
        }
        let used = hdr.extra_free_idx.load(Ordering::Relaxed);
        for x in 1..used.min(hdr.extra_count) {
            // Safety: x is within the allocated extra pool; chains were
            // unlinked by the primary resets above.
            unsafe { (*hdr.extra_bucket(x)).reset() };
        }
        for w in 0..hdr.worker_count as usize {
            hdr.counters(w).reset();
        }
        hdr.key_cursor.store(0, Ordering::Release);
        hdr.extra_free_idx.store(1, Ordering::Release);
    }

    pub fn stats(self) -> FwMapStats {
        let hdr = self.hdr;
        let mut out = FwMapStats {
            index_size: hdr.index_size,
            keys_used: hdr
                .key_cursor
                .load(Ordering::Relaxed)
                .min(hdr.index_size),
            extra_used: hdr
                .extra_free_idx
                .load(Ordering::Relaxed)
                .saturating_sub(1)
                .min(hdr.extra_count.saturating_sub(1)),
            ..Default::default()
        };
        for w in 0..hdr.worker_count as usize {
            let c = hdr.counters(w);
            out.total_elements += c.total_elements();
            out.max_chain = out.max_chain.max(c.max_chain());
            out.max_deadline = out.max_deadline.max(c.max_deadline());
        }
        out
    }

    /// Highest deadline any worker has written into this layer.
    pub fn max_deadline(self) -> u64 {
        let hdr = self.hdr;
        let mut max = 0;
        for w in 0..hdr.worker_count as usize {
            max = max.max(hdr.counters(w).max_deadline());
        }
        max
    }
}

/// Owning handle to a single map layer allocated from a memory
/// context.
pub struct FwMap {
    hdr: NonNull<FwMapHdr>,
    ctx: MemoryContext,
    funcs: FuncSet,
}

// Safety: all shared mutation happens through atomics and in-region
// locks; the handle itself is plain pointers plus a context.
unsafe impl Send for FwMap {}
unsafe impl Sync for FwMap {}

impl FwMap {
    /// Allocate and initialize a new map in `ctx`.
    pub fn new(ctx: &MemoryContext, config: &FwMapConfig) -> Result<Self> {
        Self::new_layer(ctx, config, 0)
    }

    pub(crate) fn new_layer(
        ctx: &MemoryContext,
        config: &FwMapConfig,
        layer_gen: u64,
    ) -> Result<Self> {
        config.validate()?;
        let funcs = FuncSet {
            hash: config.hash,
            key_eq: config.key_eq,
            copy: config.copy,
            merge: config.merge,
        };
        let index_size = config.index_size.next_power_of_two().max(MIN_INDEX_SIZE);
        let hdr_mem = ctx.alloc(mem::size_of::<FwMapHdr>())?;
        let hdr = hdr_mem.cast::<FwMapHdr>();

        // Safety: hdr_mem is zeroed and large enough; atomics and
        // offset pointers are valid all-zero.
        unsafe {
            let h = hdr.as_ptr();
            (*h).key_size = config.key_size;
            (*h).value_size = config.value_size;
            (*h).worker_count = config.worker_count;
            (*h).index_size = index_size;
            (*h).index_mask = index_size - 1;
            (*h).slot_mask = index_size.min(CHUNK_BUCKETS as u32) - 1;
            (*h).extra_count = config.extra_bucket_count.saturating_add(1);
            (*h).hash_id = config.hash as u8;
            (*h).eq_id = config.key_eq as u8;
            (*h).copy_id = config.copy as u8;
            (*h).merge_id = config.merge as u8;
            (*h).hash_seed = config
                .hash_seed
                .unwrap_or_else(|| rand::rng().random::<u64>());
            (*h).layer_gen = layer_gen;
            (*h).extra_free_idx.store(1, Ordering::Relaxed);
        }

        let map = Self {
            hdr,
            ctx: ctx.clone(),
            funcs,
        };
        if let Err(e) = map.allocate_stores(config, index_size) {
            Self::destroy_raw(ctx, hdr);
            return Err(e);
        }
        Ok(map)
    }

    fn allocate_stores(&self, config: &FwMapConfig, index_size: u32) -> Result<()> {
        // Safety: we are the only holder of this fresh header.
        let hdr = unsafe { &*self.hdr.as_ptr() };
        let chunk_count = (index_size as usize).div_ceil(CHUNK_BUCKETS);
        let slots_per_chunk = (index_size as usize).min(CHUNK_BUCKETS);

        for c in 0..chunk_count {
            let buckets = self.ctx.alloc(slots_per_chunk * mem::size_of::<Bucket>())?;
            hdr.index_chunks[c].store(buckets.as_ptr() as *mut Bucket, Ordering::Relaxed);
            let keys = self.ctx.alloc(slots_per_chunk * config.key_size as usize)?;
            hdr.key_chunks[c].store(keys.as_ptr(), Ordering::Relaxed);
            let values = self.ctx.alloc(slots_per_chunk * config.value_size as usize)?;
            hdr.value_chunks[c].store(values.as_ptr(), Ordering::Relaxed);
        }
        let extras = self
            .ctx
            .alloc(hdr.extra_count as usize * mem::size_of::<Bucket>())?;
        hdr.extra.store(extras.as_ptr() as *mut Bucket, Ordering::Relaxed);
        let counters = self
            .ctx
            .alloc(config.worker_count as usize * mem::size_of::<WorkerCounters>())?;
        hdr.counters
            .store(counters.as_ptr() as *mut WorkerCounters, Ordering::Relaxed);
        Ok(())
    }

    /// Rebuild a handle over an existing layer header (attach, layer
    /// chain traversal). Fails on unknown strategy ids.
    pub(crate) fn from_hdr(ctx: MemoryContext, hdr: NonNull<FwMapHdr>) -> Result<Self> {
        // Safety: hdr points at an initialized layer in ctx's arena.
        let h = unsafe { hdr.as_ref() };
        let funcs = FuncSet::from_ids(h.hash_id, h.eq_id, h.copy_id, h.merge_id)?;
        Ok(Self { hdr, ctx, funcs })
    }

    pub(crate) fn hdr_ptr(&self) -> NonNull<FwMapHdr> {
        self.hdr
    }

    pub(crate) fn view(&self) -> MapView<'_> {
        // Safety: hdr is valid for the lifetime of this handle.
        MapView {
            hdr: unsafe { self.hdr.as_ref() },
            funcs: self.funcs,
        }
    }

    pub fn get(&self, key: &[u8], now: u64) -> Option<FwMapGuard<'_>> {
        self.view().get(key, now)
    }

    pub fn get_copy(&self, key: &[u8], now: u64, out: &mut [u8]) -> Option<(u32, u64)> {
        self.view().get_copy(key, now, out)
    }

    pub fn entry(&self, worker_idx: usize, key: &[u8], now: u64, ttl: u64) -> EntryStatus<'_> {
        self.view().entry(worker_idx, key, now, ttl)
    }

    pub fn put(
        &self,
        worker_idx: usize,
        key: &[u8],
        value: &[u8],
        now: u64,
        ttl: u64,
    ) -> Option<u32> {
        self.view().put(worker_idx, key, value, now, ttl)
    }

    pub fn iter<F: FnMut(&[u8], &[u8], u64)>(&self, now: u64, f: F) {
        self.view().iter(now, f)
    }

    pub fn clear(&self) {
        self.view().clear()
    }

    pub fn stats(&self) -> FwMapStats {
        self.view().stats()
    }

    pub fn max_deadline(&self) -> u64 {
        self.view().max_deadline()
    }

    /// Key capacity (equals the rounded index size).
    pub fn capacity(&self) -> u32 {
        self.view().hdr.index_size
    }

    /// Free every allocation behind this layer.
    pub fn destroy(self) {
        Self::destroy_raw(&self.ctx, self.hdr);
    }

    pub(crate) fn destroy_raw(ctx: &MemoryContext, hdr: NonNull<FwMapHdr>) {
        // Safety: hdr and everything it references were allocated from
        // ctx and are no longer reachable by readers.
        unsafe {
            let h = hdr.as_ref();
            for c in 0..MAX_CHUNKS {
                for chunk in [
                    h.index_chunks[c].load(Ordering::Relaxed) as *mut u8,
                    h.key_chunks[c].load(Ordering::Relaxed),
                    h.value_chunks[c].load(Ordering::Relaxed),
                ] {
                    if let Some(p) = NonNull::new(chunk) {
                        ctx.free(p);
                    }
                }
            }
            if let Some(p) = NonNull::new(h.extra.load(Ordering::Relaxed) as *mut u8) {
                ctx.free(p);
            }
            if let Some(p) = NonNull::new(h.counters.load(Ordering::Relaxed) as *mut u8) {
                ctx.free(p);
            }
            ctx.free(hdr.cast());
        }
    }
}
