// Copyright (c) 2025 Dataplane Core Contributors
//
// Layered map (version chain of FwMaps)
//
// A LayerMap is an ordered chain of map layers, head to tail. The head
// is the only layer that accepts writes; older layers are read-only
// and drain as their entries expire. The controller installs a new
// head with a single release pointer swap, workers acknowledge the
// transition at a quiescent point by bumping each tail's sealed
// counter, and a layer is unlinked once every worker has sealed it and
// its highest deadline has passed.
//
// Unlinked layers are handed back to the caller for deferred
// destruction: a reader that began a chain walk before the unlink may
// still finish it, so the memory is freed only after the next
// quiescent interval.

use crate::error::Result;
use crate::fwmap::funcs::{self, FuncSet};
use crate::fwmap::map::{
    EntryStatus, FwMap, FwMapConfig, FwMapHdr, FwMapStats, MapView, MAX_VALUE_SIZE,
};
use crate::shm::context::MemoryContext;
use crate::shm::offset::OffsetPtr;
use std::mem;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

#[repr(C)]
struct LayerMapHdr {
    head: OffsetPtr<FwMapHdr>,
    worker_count: u32,
    _pad: u32,
    next_gen: AtomicU64,
}

/// Result of a cross-layer lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerHit {
    pub key_index: u32,
    pub deadline: u64,
    /// The hit came from an older layer; the caller may want to
    /// refresh the entry into the head or queue a state sync.
    pub stale: bool,
}

/// Per-worker layer bookkeeping, process local. Each worker owns one
/// and passes it to `quiesce` at its quiescent points.
#[derive(Debug, Default)]
pub struct LayerWorker {
    /// Every layer with generation <= this has been sealed by this
    /// worker already.
    last_sealed_gen: u64,
}

/// A layer unlinked by `trim_stale_layers`, awaiting destruction.
pub struct TrimmedLayer {
    ctx: MemoryContext,
    hdr: NonNull<FwMapHdr>,
}

impl TrimmedLayer {
    pub fn layer_gen(&self) -> u64 {
        // Safety: the layer stays allocated until destroy().
        unsafe { self.hdr.as_ref().layer_gen }
    }

    /// Free the layer's memory. Callers run this after workers passed
    /// a quiescent point following the unlink.
    pub fn destroy(self) {
        FwMap::destroy_raw(&self.ctx, self.hdr);
    }
}

// Safety: same argument as FwMap.
unsafe impl Send for TrimmedLayer {}

/// The layered TTL map.
pub struct LayerMap {
    hdr: NonNull<LayerMapHdr>,
    ctx: MemoryContext,
    config: FwMapConfig,
    funcs: FuncSet,
}

// Safety: shared mutation is confined to atomics and bucket locks in
// the arena.
unsafe impl Send for LayerMap {}
unsafe impl Sync for LayerMap {}

impl LayerMap {
    /// Create a layer chain with one initial (head) layer.
    pub fn new(ctx: &MemoryContext, config: &FwMapConfig) -> Result<Self> {
        config.validate()?;
        let hdr_mem = ctx.alloc(mem::size_of::<LayerMapHdr>())?;
        let hdr = hdr_mem.cast::<LayerMapHdr>();

        let first = FwMap::new_layer(ctx, config, 1)?;
        // Safety: hdr_mem is zeroed and exclusively ours.
        unsafe {
            let h = hdr.as_ptr();
            (*h).worker_count = config.worker_count;
            (*h).next_gen.store(2, Ordering::Relaxed);
            (*h).head.store(first.hdr_ptr().as_ptr(), Ordering::Release);
        }
        let funcs = FuncSet {
            hash: config.hash,
            key_eq: config.key_eq,
            copy: config.copy,
            merge: config.merge,
        };
        Ok(Self {
            hdr,
            ctx: ctx.clone(),
            config: config.clone(),
            funcs,
        })
    }

    fn hdr(&self) -> &LayerMapHdr {
        // Safety: valid for the handle's lifetime.
        unsafe { self.hdr.as_ref() }
    }

    pub fn worker_count(&self) -> u32 {
        self.hdr().worker_count
    }

    /// Hand out the per-worker bookkeeping for `quiesce`.
    pub fn worker(&self) -> LayerWorker {
        LayerWorker::default()
    }

    fn head_ptr(&self) -> *mut FwMapHdr {
        self.hdr().head.load(Ordering::Acquire)
    }

    fn view_of<'a>(&'a self, hdr: *mut FwMapHdr) -> MapView<'a> {
        // Safety: layer headers referenced from the chain stay
        // allocated until trimmed and destroyed after quiescence.
        MapView {
            hdr: unsafe { &*hdr },
            funcs: self.funcs,
        }
    }

    /// Install a fresh head layer; the old head becomes the first
    /// tail. Writers racing the swap keep operating on whichever head
    /// they resolved and pick up the new one on their next operation.
    pub fn insert_new_layer(&self) -> Result<()> {
        let gen = self.hdr().next_gen.fetch_add(1, Ordering::Relaxed);
        let layer = FwMap::new_layer(&self.ctx, &self.config, gen)?;
        let old_head = self.head_ptr();
        // Safety: the fresh layer is not yet visible to anyone.
        unsafe {
            layer.hdr_ptr().as_ref().next.store(old_head, Ordering::Release);
        }
        self.hdr().head.store(layer.hdr_ptr().as_ptr(), Ordering::Release);
        debug!(layer_gen = gen, "installed new head layer");
        Ok(())
    }

    /// Worker quiescence point: acknowledge every tail layer this
    /// worker has not yet sealed. Called when the worker holds no
    /// references into any layer.
    pub fn quiesce(&self, worker: &mut LayerWorker) {
        let head = self.head_ptr();
        if head.is_null() {
            return;
        }
        // Safety: chain layers stay allocated (deferred destruction).
        unsafe {
            let head_gen = (*head).layer_gen;
            if head_gen.saturating_sub(1) <= worker.last_sealed_gen {
                return;
            }
            let mut cur = (*head).next.load(Ordering::Acquire);
            while !cur.is_null() {
                if (*cur).layer_gen > worker.last_sealed_gen {
                    (*cur).sealed_count.fetch_add(1, Ordering::AcqRel);
                }
                cur = (*cur).next.load(Ordering::Acquire);
            }
            worker.last_sealed_gen = head_gen - 1;
        }
    }

    /// Cross-layer lookup: the head under its bucket read lock, then
    /// older layers lock-free. The value is copied into `out`.
    pub fn get_across(&self, key: &[u8], now: u64, out: &mut [u8]) -> Option<LayerHit> {
        let head = self.head_ptr();
        if head.is_null() {
            return None;
        }
        if let Some(hit) = self.view_of(head).get(key, now) {
            out.copy_from_slice(hit.value());
            return Some(LayerHit {
                key_index: hit.key_index(),
                deadline: hit.deadline(),
                stale: false,
            });
        }
        // Head miss: the lock is already released, walk the tails.
        // Safety: see view_of.
        let mut cur = unsafe { (*head).next.load(Ordering::Acquire) };
        while !cur.is_null() {
            if let Some((key_index, deadline)) = self.view_of(cur).get_copy(key, now, out) {
                return Some(LayerHit {
                    key_index,
                    deadline,
                    stale: true,
                });
            }
            cur = unsafe { (*cur).next.load(Ordering::Acquire) };
        }
        None
    }

    /// Insert into the head layer. On a fresh insert, a live value for
    /// the same key in an older layer is merged into the new value
    /// with the configured merge strategy, preserving monotonic
    /// counters and progress flags across layer transitions.
    pub fn put_merging(
        &self,
        worker_idx: usize,
        key: &[u8],
        value: &[u8],
        now: u64,
        ttl: u64,
    ) -> Option<u32> {
        let head = self.head_ptr();
        debug_assert!(!head.is_null());
        match self.view_of(head).entry(worker_idx, key, now, ttl) {
            EntryStatus::Full => None,
            EntryStatus::Occupied(mut e) => {
                e.write_value(value);
                Some(e.key_index())
            }
            EntryStatus::Inserted(mut e) => {
                e.write_key(key);
                let len = value.len();
                let mut merged = [0u8; MAX_VALUE_SIZE];
                merged[..len].copy_from_slice(value);
                let mut old = [0u8; MAX_VALUE_SIZE];
                // Safety: see view_of.
                let mut cur = unsafe { (*head).next.load(Ordering::Acquire) };
                while !cur.is_null() {
                    if self
                        .view_of(cur)
                        .get_copy(key, now, &mut old[..len])
                        .is_some()
                    {
                        funcs::merge_value(self.funcs.merge, &mut merged[..len], &old[..len]);
                        break;
                    }
                    cur = unsafe { (*cur).next.load(Ordering::Acquire) };
                }
                e.write_value(&merged[..len]);
                Some(e.key_index())
            }
        }
    }

    /// Unlink every tail layer that is sealed by all workers and whose
    /// highest deadline has passed. The surviving `next` is written
    /// with a release store so in-flight readers either finish their
    /// walk through the old link or skip the layer entirely.
    pub fn trim_stale_layers(&self, now: u64) -> Vec<TrimmedLayer> {
        let mut trimmed = Vec::new();
        let head = self.head_ptr();
        if head.is_null() {
            return trimmed;
        }
        let workers = self.worker_count();
        // Safety: only the controller mutates the chain links; layers
        // stay allocated until TrimmedLayer::destroy.
        unsafe {
            let mut prev_next: &OffsetPtr<FwMapHdr> = &(*head).next;
            let mut cur = prev_next.load(Ordering::Acquire);
            while !cur.is_null() {
                let nxt = (*cur).next.load(Ordering::Acquire);
                let sealed = (*cur).sealed_count.load(Ordering::Acquire);
                let outdated = self.view_of(cur).max_deadline() <= now;
                if sealed >= workers && outdated {
                    prev_next.store(nxt, Ordering::Release);
                    debug!(layer_gen = (*cur).layer_gen, "trimmed stale layer");
                    trimmed.push(TrimmedLayer {
                        ctx: self.ctx.clone(),
                        hdr: NonNull::new_unchecked(cur),
                    });
                } else {
                    prev_next = &(*cur).next;
                }
                cur = nxt;
            }
        }
        trimmed
    }

    /// Number of layers currently linked, head included.
    pub fn layer_count(&self) -> usize {
        let mut n = 0;
        let mut cur = self.head_ptr();
        while !cur.is_null() {
            n += 1;
            // Safety: see view_of.
            cur = unsafe { (*cur).next.load(Ordering::Acquire) };
        }
        n
    }

    /// Statistics of the head layer.
    pub fn head_stats(&self) -> FwMapStats {
        self.view_of(self.head_ptr()).stats()
    }

    /// Tear down every layer and the chain header.
    pub fn destroy(self) {
        let mut cur = self.head_ptr();
        while !cur.is_null() {
            // Safety: destroy consumes the only handle; no readers
            // remain by contract.
            unsafe {
                let nxt = (*cur).next.load(Ordering::Relaxed);
                FwMap::destroy_raw(&self.ctx, NonNull::new_unchecked(cur));
                cur = nxt;
            }
        }
        self.ctx.free(self.hdr.cast());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fwmap::funcs::MergeKind;
    use crate::shm::arena::{Arena, ArenaOptions};
    use crate::shm::context::MemoryContext;

    fn ctx() -> MemoryContext {
        let arena = Arena::create(&ArenaOptions::sized(32 * 1024 * 1024)).unwrap();
        MemoryContext::register(&arena, "layer-test").unwrap()
    }

    fn config(workers: u32, merge: MergeKind) -> FwMapConfig {
        FwMapConfig {
            key_size: 16,
            value_size: 8,
            worker_count: workers,
            index_size: 64,
            extra_bucket_count: 16,
            merge,
            hash_seed: Some(1),
            ..Default::default()
        }
    }

    fn key(n: u8) -> [u8; 16] {
        let mut k = [0u8; 16];
        k[0] = n;
        k
    }

    #[test]
    fn test_head_hit_is_not_stale() {
        let ctx = ctx();
        let lm = LayerMap::new(&ctx, &config(1, MergeKind::Replace)).unwrap();
        lm.put_merging(0, &key(1), &5u64.to_le_bytes(), 100, 50).unwrap();

        let mut out = [0u8; 8];
        let hit = lm.get_across(&key(1), 120, &mut out).unwrap();
        assert!(!hit.stale);
        assert_eq!(out, 5u64.to_le_bytes());
    }

    #[test]
    fn test_tail_hit_is_stale() {
        let ctx = ctx();
        let lm = LayerMap::new(&ctx, &config(1, MergeKind::Replace)).unwrap();
        lm.put_merging(0, &key(1), &5u64.to_le_bytes(), 100, 100).unwrap();
        lm.insert_new_layer().unwrap();

        let mut out = [0u8; 8];
        let hit = lm.get_across(&key(1), 120, &mut out).unwrap();
        assert!(hit.stale);
        assert_eq!(out, 5u64.to_le_bytes());
    }

    #[test]
    fn test_merge_across_layers() {
        // Tail holds value 5 live until 200; a fresh head insert of 3
        // with additive merge stores 8.
        let ctx = ctx();
        let lm = LayerMap::new(&ctx, &config(1, MergeKind::AddU64)).unwrap();
        lm.put_merging(0, &key(7), &5u64.to_le_bytes(), 100, 100).unwrap();
        lm.insert_new_layer().unwrap();

        lm.put_merging(0, &key(7), &3u64.to_le_bytes(), 100, 100).unwrap();
        let mut out = [0u8; 8];
        let hit = lm.get_across(&key(7), 150, &mut out).unwrap();
        assert!(!hit.stale);
        assert_eq!(u64::from_le_bytes(out), 8);
    }

    #[test]
    fn test_head_wins_over_live_tail() {
        let ctx = ctx();
        let lm = LayerMap::new(&ctx, &config(1, MergeKind::Replace)).unwrap();
        lm.put_merging(0, &key(2), &1u64.to_le_bytes(), 100, 1000).unwrap();
        lm.insert_new_layer().unwrap();
        lm.put_merging(0, &key(2), &2u64.to_le_bytes(), 100, 1000).unwrap();

        let mut out = [0u8; 8];
        let hit = lm.get_across(&key(2), 150, &mut out).unwrap();
        assert!(!hit.stale);
        assert_eq!(u64::from_le_bytes(out), 2);
    }

    #[test]
    fn test_reclaims_only_sealed_and_outdated() {
        let ctx = ctx();
        let lm = LayerMap::new(&ctx, &config(4, MergeKind::Replace)).unwrap();
        // Tail layer with max_deadline 150.
        lm.put_merging(0, &key(1), &1u64.to_le_bytes(), 100, 50).unwrap();
        lm.insert_new_layer().unwrap();
        assert_eq!(lm.layer_count(), 2);

        // Three of four workers quiesce: still linked at now=200.
        let mut w: Vec<LayerWorker> = (0..4).map(|_| lm.worker()).collect();
        for wk in w.iter_mut().take(3) {
            lm.quiesce(wk);
        }
        assert!(lm.trim_stale_layers(200).is_empty());
        assert_eq!(lm.layer_count(), 2);

        // Fourth seal: reclaimable at 200 but not at 149, where the
        // entry's deadline has not yet passed.
        lm.quiesce(&mut w[3]);
        assert!(lm.trim_stale_layers(149).is_empty());
        let trimmed = lm.trim_stale_layers(200);
        assert_eq!(trimmed.len(), 1);
        assert_eq!(lm.layer_count(), 1);
        for t in trimmed {
            t.destroy();
        }
    }

    #[test]
    fn test_quiesce_seals_once_per_worker() {
        let ctx = ctx();
        let lm = LayerMap::new(&ctx, &config(2, MergeKind::Replace)).unwrap();
        lm.insert_new_layer().unwrap();

        let mut w0 = lm.worker();
        lm.quiesce(&mut w0);
        lm.quiesce(&mut w0);
        lm.quiesce(&mut w0);
        // One worker sealing three times must not count as two.
        assert!(lm.trim_stale_layers(u64::MAX - 1).is_empty());

        let mut w1 = lm.worker();
        lm.quiesce(&mut w1);
        assert_eq!(lm.trim_stale_layers(u64::MAX - 1).len(), 1);
    }

    #[test]
    fn test_lookup_skips_expired_tail_entry() {
        let ctx = ctx();
        let lm = LayerMap::new(&ctx, &config(1, MergeKind::Replace)).unwrap();
        lm.put_merging(0, &key(3), &9u64.to_le_bytes(), 100, 10).unwrap();
        lm.insert_new_layer().unwrap();

        let mut out = [0u8; 8];
        assert!(lm.get_across(&key(3), 111, &mut out).is_none());
    }

    #[test]
    fn test_merge_skips_expired_old_value() {
        let ctx = ctx();
        let lm = LayerMap::new(&ctx, &config(1, MergeKind::AddU64)).unwrap();
        lm.put_merging(0, &key(4), &5u64.to_le_bytes(), 100, 10).unwrap();
        lm.insert_new_layer().unwrap();

        // Old value expired at 111: nothing to merge.
        lm.put_merging(0, &key(4), &3u64.to_le_bytes(), 120, 100).unwrap();
        let mut out = [0u8; 8];
        lm.get_across(&key(4), 130, &mut out).unwrap();
        assert_eq!(u64::from_le_bytes(out), 3);
    }
}
