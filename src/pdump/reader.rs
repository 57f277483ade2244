// Copyright (c) 2025 Dataplane Core Contributors
//
// Consumer side of the dump rings
//
// A reader keeps private state: its own logical read offset and a
// staging buffer of bytes copied out of the ring. Any number of
// readers can attach to the same ring without coordinating; each one
// clones the view. Overwrite detection is two-phase: before a copy the
// reader resynchronizes to `readable_idx`, and after the copy it
// re-checks whether the writer advanced past the staged bytes and
// drops the overwritten prefix. Frame validation (magic + length)
// catches the rare case where an overwrite lands between the two
// checks; the buffer is discarded and reading resumes at the next
// intact record.

use crate::pdump::record::{
    align4, PacketRecord, RecordHeader, RecordMeta, RECORD_HEADER_SIZE,
};
use crate::pdump::ring::{DumpRings, RingHdr};
use bytes::{Buf, BytesMut};
use std::ptr::NonNull;
use std::slice;
use std::sync::atomic::{fence, Ordering};
use tracing::warn;

/// A private reading view over one worker's ring.
pub struct RingReader {
    hdr: NonNull<RingHdr>,
    read_idx: u64,
    /// Staged bytes; always starts at a record boundary (`buf_base`).
    buf: BytesMut,
    buf_base: u64,
    corrupt_discards: u64,
    warned: bool,
}

// Safety: reader state is private; the ring is read through atomics
// and raw copies.
unsafe impl Send for RingReader {}

impl DumpRings {
    /// Attach a reader to one worker's ring, starting at the oldest
    /// intact record.
    pub fn reader(&self, worker_idx: usize) -> RingReader {
        let hdr = self.ring_hdr(worker_idx);
        // Safety: the ring outlives the table handle.
        let start = unsafe { hdr.as_ref().readable_idx.load(Ordering::Acquire) };
        RingReader {
            hdr,
            read_idx: start,
            buf: BytesMut::new(),
            buf_base: start,
            corrupt_discards: 0,
            warned: false,
        }
    }
}

impl RingReader {
    fn hdr(&self) -> &RingHdr {
        // Safety: valid for the reader's lifetime.
        unsafe { self.hdr.as_ref() }
    }

    pub fn read_idx(&self) -> u64 {
        self.read_idx
    }

    /// Records dropped because their framing failed validation.
    pub fn corrupt_discards(&self) -> u64 {
        self.corrupt_discards
    }

    /// Copy `[logical, logical + n)` out of the ring into the staging
    /// buffer, splitting at the physical wrap.
    fn copy_out(&mut self, logical: u64, n: usize) {
        let hdr = self.hdr();
        let size = hdr.size as usize;
        let pos = (logical & hdr.mask) as usize;
        let first = n.min(size - pos);
        let data = hdr.data_ptr() as *const u8;
        // Safety: both ranges lie inside the ring. The writer may be
        // overwriting them concurrently; torn bytes are detected
        // afterwards via readable_idx and the frame magic, and the
        // affected prefix is dropped.
        unsafe {
            self.buf.extend_from_slice(slice::from_raw_parts(data.add(pos), first));
            if first < n {
                self.buf.extend_from_slice(slice::from_raw_parts(data, n - first));
            }
        }
    }

    /// Drain whatever the writer has published, staging at most
    /// `chunk_size` bytes per copy. Returns the number of records
    /// appended to `out`.
    pub fn read(&mut self, chunk_size: usize, out: &mut Vec<PacketRecord>) -> usize {
        debug_assert!(chunk_size >= RECORD_HEADER_SIZE);
        let mut drained = 0;
        loop {
            let readable = self.hdr().readable_idx.load(Ordering::Acquire);
            let write = self.hdr().write_idx.load(Ordering::Acquire);
            if readable > self.read_idx {
                // The writer lapped us while we were away; everything
                // staged may be half-overwritten.
                self.buf.clear();
                self.read_idx = readable;
            }
            if self.buf.is_empty() {
                self.buf_base = self.read_idx;
            }
            let avail = write - self.read_idx;
            if avail == 0 {
                break;
            }
            let n = avail.min(chunk_size as u64) as usize;
            self.copy_out(self.read_idx, n);
            self.read_idx += n as u64;

            // The staging copy must complete before the re-check, or
            // the overwrite race below is undetectable.
            fence(Ordering::SeqCst);
            let readable2 = self.hdr().readable_idx.load(Ordering::Acquire);
            if readable2 > self.buf_base {
                // An overwrite raced the copy; drop the overwritten
                // prefix (readable_idx is always a record boundary).
                let cut = readable2 - self.buf_base;
                if cut >= self.buf.len() as u64 {
                    self.buf.clear();
                    if readable2 > self.read_idx {
                        self.read_idx = readable2;
                    }
                    self.buf_base = self.read_idx;
                    continue;
                }
                self.buf.advance(cut as usize);
                self.buf_base = readable2;
            }

            drained += self.drain_frames(out);
            if n as u64 == avail {
                break;
            }
        }
        drained
    }

    /// Parse complete records off the front of the staging buffer.
    fn drain_frames(&mut self, out: &mut Vec<PacketRecord>) -> usize {
        let ring_size = self.hdr().size;
        let mut parsed = 0;
        while self.buf.len() >= RECORD_HEADER_SIZE {
            let header = RecordHeader::from_bytes(&self.buf[..RECORD_HEADER_SIZE]);
            if !header.is_valid(ring_size) {
                self.corrupt_discards += 1;
                if !self.warned {
                    self.warned = true;
                    warn!(
                        total_len = header.total_len,
                        "corrupt dump record framing, discarding reader buffer"
                    );
                }
                self.buf.clear();
                self.buf_base = self.read_idx;
                break;
            }
            let padded = align4(header.total_len as u64) as usize;
            if self.buf.len() < padded {
                break;
            }
            let data_len = header.total_len as usize - RECORD_HEADER_SIZE;
            out.push(PacketRecord {
                meta: RecordMeta {
                    timestamp: header.timestamp,
                    data_size: data_len as u32,
                    packet_len: header.packet_len,
                    worker_idx: header.worker_idx,
                    pipeline_idx: header.pipeline_idx,
                    rx_device_id: header.rx_device_id,
                    tx_device_id: header.tx_device_id,
                    queue: header.queue,
                },
                data: self.buf[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + data_len].to_vec(),
            });
            self.buf.advance(padded);
            self.buf_base += padded as u64;
            parsed += 1;
        }
        parsed
    }
}
