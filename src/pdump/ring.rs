// Copyright (c) 2025 Dataplane Core Contributors
//
// Per-worker dump ring: layout, configuration and the producer side
//
// One lossy SPSC byte ring per worker, living in the arena. The
// logical indices are monotone 64-bit byte offsets; the physical
// position is `logical & mask`. `readable_idx` is the oldest logical
// offset still intact: the writer advances it record by record with a
// release store *before* overwriting, so an attached reader can detect
// that bytes it was copying are gone. `write_idx` is release-published
// only after the record's header and payload have landed, so a record
// is never exposed half-written. The producer never blocks; under
// backpressure it discards the oldest records.

use crate::error::{CoreError, Result};
use crate::pdump::record::{align4, CaptureInfo, RecordHeader, RECORD_HEADER_SIZE, RECORD_MAGIC};
use crate::shm::context::MemoryContext;
use crate::MAX_WORKERS;
use std::mem;
use std::ptr::NonNull;
use std::slice;
use std::sync::atomic::{fence, AtomicU64, Ordering};

/// Smallest per-worker ring (1 MiB).
pub const MIN_RING_SIZE: usize = 1 << 20;

/// Largest per-worker ring; bounded by the arena's block classes.
pub const MAX_RING_SIZE: usize = 8 << 20;

/// Default snap length for captured payloads.
pub const DEFAULT_SNAPLEN: usize = 2048;

#[repr(C, align(64))]
pub(crate) struct RingHdr {
    pub(crate) size: u64,
    pub(crate) mask: u64,
    pub(crate) write_idx: AtomicU64,
    pub(crate) readable_idx: AtomicU64,
    // Ring bytes follow this header.
}

const _: () = assert!(mem::size_of::<RingHdr>() == 64);

impl RingHdr {
    #[inline]
    pub(crate) fn data_ptr(&self) -> *mut u8 {
        // Safety: the ring bytes were allocated contiguously after the
        // header.
        unsafe { (self as *const RingHdr as *mut u8).add(mem::size_of::<RingHdr>()) }
    }
}

/// Dump ring configuration.
#[derive(Debug, Clone)]
pub struct DumpConfig {
    pub worker_count: u32,
    /// Per-worker ring size; must be a power of two in
    /// [MIN_RING_SIZE, MAX_RING_SIZE].
    pub per_worker_size: usize,
    /// Payload capture limit per record.
    pub snaplen: usize,
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            worker_count: num_cpus::get().min(MAX_WORKERS) as u32,
            per_worker_size: MIN_RING_SIZE,
            snaplen: DEFAULT_SNAPLEN,
        }
    }
}

impl DumpConfig {
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(CoreError::Config(msg));
        if self.worker_count == 0 || self.worker_count as usize > MAX_WORKERS {
            return fail(format!("worker_count {} out of range", self.worker_count));
        }
        if !self.per_worker_size.is_power_of_two()
            || self.per_worker_size < MIN_RING_SIZE
            || self.per_worker_size > MAX_RING_SIZE
        {
            return fail(format!(
                "per_worker_size {} must be a power of two in [{MIN_RING_SIZE}, {MAX_RING_SIZE}]",
                self.per_worker_size
            ));
        }
        if self.snaplen == 0
            || align4((RECORD_HEADER_SIZE + self.snaplen) as u64) > self.per_worker_size as u64
        {
            return fail(format!("snaplen {} does not fit the ring", self.snaplen));
        }
        Ok(())
    }

    /// Allocate one ring per worker in `ctx` and return the table.
    pub fn configure(&self, ctx: &MemoryContext) -> Result<DumpRings> {
        self.validate()?;
        let mut rings: Vec<NonNull<RingHdr>> = Vec::with_capacity(self.worker_count as usize);
        for _ in 0..self.worker_count {
            let mem = match ctx.alloc(mem::size_of::<RingHdr>() + self.per_worker_size) {
                Ok(m) => m,
                Err(e) => {
                    for hdr in rings {
                        ctx.free(hdr.cast());
                    }
                    return Err(e);
                }
            };
            let hdr = mem.cast::<RingHdr>();
            // Safety: zeroed allocation, exclusively ours.
            unsafe {
                (*hdr.as_ptr()).size = self.per_worker_size as u64;
                (*hdr.as_ptr()).mask = self.per_worker_size as u64 - 1;
            }
            rings.push(hdr);
        }
        Ok(DumpRings {
            ctx: ctx.clone(),
            rings,
            snaplen: self.snaplen,
        })
    }
}

/// The per-worker ring table produced by `DumpConfig::configure`.
pub struct DumpRings {
    ctx: MemoryContext,
    rings: Vec<NonNull<RingHdr>>,
    snaplen: usize,
}

// Safety: ring state is atomics in the arena; the handle hands out
// producer/consumer views that enforce their own discipline.
unsafe impl Send for DumpRings {}
unsafe impl Sync for DumpRings {}

impl DumpRings {
    pub fn worker_count(&self) -> usize {
        self.rings.len()
    }

    pub fn per_worker_size(&self) -> usize {
        // Safety: rings are valid for the handle's lifetime.
        unsafe { self.rings[0].as_ref().size as usize }
    }

    /// The producer handle for one worker. One producer per ring: the
    /// worker owns it exclusively.
    pub fn writer(&self, worker_idx: usize) -> DumpRing {
        DumpRing {
            hdr: self.rings[worker_idx],
            snaplen: self.snaplen,
        }
    }

    pub(crate) fn ring_hdr(&self, worker_idx: usize) -> NonNull<RingHdr> {
        self.rings[worker_idx]
    }

    /// Free every ring.
    pub fn destroy(self) {
        for hdr in self.rings {
            self.ctx.free(hdr.cast());
        }
    }
}

/// Producer side of one worker's ring.
pub struct DumpRing {
    hdr: NonNull<RingHdr>,
    snaplen: usize,
}

// Safety: single-producer by contract; the handle may move to the
// worker thread.
unsafe impl Send for DumpRing {}

impl DumpRing {
    fn hdr(&self) -> &RingHdr {
        // Safety: valid for the handle's lifetime.
        unsafe { self.hdr.as_ref() }
    }

    /// Copy `bytes` into the ring at logical offset `logical`,
    /// splitting at the physical wrap.
    fn copy_in(&mut self, logical: u64, bytes: &[u8]) {
        let hdr = self.hdr();
        let size = hdr.size as usize;
        let pos = (logical & hdr.mask) as usize;
        let first = bytes.len().min(size - pos);
        let data = hdr.data_ptr();
        // Safety: pos + first <= size and the remainder lands at the
        // ring start; only this producer writes the ring.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), data.add(pos), first);
            if first < bytes.len() {
                std::ptr::copy_nonoverlapping(
                    bytes.as_ptr().add(first),
                    data,
                    bytes.len() - first,
                );
            }
        }
    }

    /// Read a record header back out of the ring (producer-side, used
    /// to walk records being discarded).
    fn header_at(&self, logical: u64) -> RecordHeader {
        let hdr = self.hdr();
        let size = hdr.size as usize;
        let pos = (logical & hdr.mask) as usize;
        if size - pos >= RECORD_HEADER_SIZE {
            // Safety: contiguous header inside the ring.
            let bytes =
                unsafe { slice::from_raw_parts(hdr.data_ptr().add(pos), RECORD_HEADER_SIZE) };
            RecordHeader::from_bytes(bytes)
        } else {
            let mut tmp = [0u8; RECORD_HEADER_SIZE];
            let first = size - pos;
            // Safety: split copy inside the ring bounds.
            unsafe {
                std::ptr::copy_nonoverlapping(hdr.data_ptr().add(pos), tmp.as_mut_ptr(), first);
                std::ptr::copy_nonoverlapping(
                    hdr.data_ptr(),
                    tmp.as_mut_ptr().add(first),
                    RECORD_HEADER_SIZE - first,
                );
            }
            RecordHeader::from_bytes(&tmp)
        }
    }

    /// Append one record. Returns false only if the record can never
    /// fit the ring; on backpressure the oldest records are discarded.
    pub fn append(&mut self, info: &CaptureInfo, payload: &[u8]) -> bool {
        let captured = payload.len().min(self.snaplen);
        let total = (RECORD_HEADER_SIZE + captured) as u64;
        let padded = align4(total);
        let hdr = self.hdr();
        let size = hdr.size;
        if padded > size {
            return false;
        }

        let w = hdr.write_idx.load(Ordering::Relaxed);
        let r0 = hdr.readable_idx.load(Ordering::Relaxed);
        let mut r = r0;
        while w + padded - r > size {
            let old = self.header_at(r);
            if !old.is_valid(size) {
                // Nothing sane to walk; drop everything unread.
                r = w;
                break;
            }
            r += align4(old.total_len as u64);
        }
        if r != r0 {
            // Expose the discard before the bytes are clobbered; the
            // fence keeps the clobbering writes from overtaking the
            // index store on weakly ordered machines.
            self.hdr().readable_idx.store(r, Ordering::Release);
            fence(Ordering::SeqCst);
        }

        let rec = RecordHeader {
            magic: RECORD_MAGIC,
            total_len: total as u32,
            timestamp: info.timestamp,
            packet_len: info.packet_len,
            worker_idx: info.worker_idx,
            pipeline_idx: info.pipeline_idx,
            rx_device_id: info.rx_device_id,
            tx_device_id: info.tx_device_id,
            queue: info.queue,
        };
        self.copy_in(w, &rec.to_bytes());
        self.copy_in(w + RECORD_HEADER_SIZE as u64, &payload[..captured]);
        self.hdr().write_idx.store(w + padded, Ordering::Release);
        true
    }

    pub fn write_idx(&self) -> u64 {
        self.hdr().write_idx.load(Ordering::Acquire)
    }

    pub fn readable_idx(&self) -> u64 {
        self.hdr().readable_idx.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::arena::{Arena, ArenaOptions};

    fn rings(size: usize) -> DumpRings {
        let arena = Arena::create(&ArenaOptions::sized(32 * 1024 * 1024)).unwrap();
        let ctx = MemoryContext::register(&arena, "pdump-test").unwrap();
        DumpConfig {
            worker_count: 1,
            per_worker_size: size,
            snaplen: DEFAULT_SNAPLEN,
        }
        .configure(&ctx)
        .unwrap()
    }

    fn info(ts: u64, len: u32) -> CaptureInfo {
        CaptureInfo {
            timestamp: ts,
            packet_len: len,
            worker_idx: 0,
            pipeline_idx: 0,
            rx_device_id: 1,
            tx_device_id: 2,
            queue: crate::pdump::record::queue::INPUT,
        }
    }

    #[test]
    fn test_config_validation() {
        let ok = DumpConfig {
            worker_count: 2,
            per_worker_size: MIN_RING_SIZE,
            snaplen: 128,
        };
        assert!(ok.validate().is_ok());

        assert!(DumpConfig {
            per_worker_size: MIN_RING_SIZE + 1,
            ..ok.clone()
        }
        .validate()
        .is_err());
        assert!(DumpConfig {
            per_worker_size: MIN_RING_SIZE / 2,
            ..ok.clone()
        }
        .validate()
        .is_err());
        assert!(DumpConfig {
            worker_count: 0,
            ..ok.clone()
        }
        .validate()
        .is_err());
        assert!(DumpConfig {
            snaplen: 0,
            ..ok
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_append_advances_and_aligns() {
        let rings = rings(MIN_RING_SIZE);
        let mut w = rings.writer(0);
        assert!(w.append(&info(1, 5), &[0xAA; 5]));
        // 32 + 5 = 37, padded to 40.
        assert_eq!(w.write_idx(), 40);
        assert!(w.append(&info(2, 3), &[0xBB; 3]));
        assert_eq!(w.write_idx(), 76);
        assert_eq!(w.readable_idx(), 0);
    }

    #[test]
    fn test_snaplen_truncates() {
        let rings = rings(MIN_RING_SIZE);
        let mut w = rings.writer(0);
        let big = vec![1u8; DEFAULT_SNAPLEN * 2];
        assert!(w.append(&info(1, big.len() as u32), &big));
        assert_eq!(
            w.write_idx(),
            align4((RECORD_HEADER_SIZE + DEFAULT_SNAPLEN) as u64)
        );
    }

    #[test]
    fn test_overwrite_discards_oldest() {
        let rings = rings(MIN_RING_SIZE);
        let mut w = rings.writer(0);
        let payload = vec![7u8; 1000];
        // 32+1000 = 1032 per record; fill past one lap.
        let per = align4(1032) as u64;
        let n = (MIN_RING_SIZE as u64 / per) + 10;
        for i in 0..n {
            assert!(w.append(&info(i, 1000), &payload));
        }
        assert_eq!(w.write_idx(), n * per);
        assert!(w.readable_idx() > 0);
        assert_eq!(w.readable_idx() % per, 0);
        // Monotone invariant.
        assert!(w.write_idx() >= w.readable_idx());
        assert!(w.write_idx() - w.readable_idx() <= MIN_RING_SIZE as u64);
    }
}
