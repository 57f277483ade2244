// Copyright (c) 2025 Dataplane Core Contributors
//
// Packet dump rings
//
// One lossy SPSC byte ring per worker thread, drained by the control
// plane. Workers append length-prefixed packet records and never
// block; readers attach with private state, reassemble records from a
// staging buffer and detect when the writer overwrote bytes under
// them.

pub mod reader;
pub mod record;
pub mod ring;

pub use reader::RingReader;
pub use record::{queue, CaptureInfo, PacketRecord, RecordMeta, RECORD_HEADER_SIZE, RECORD_MAGIC};
pub use ring::{
    DumpConfig, DumpRing, DumpRings, DEFAULT_SNAPLEN, MAX_RING_SIZE, MIN_RING_SIZE,
};
