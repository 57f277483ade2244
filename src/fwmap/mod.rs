// Copyright (c) 2025 Dataplane Core Contributors
//
// Layered TTL hash map
//
// The keyed store shared by firewall state tracking and connection
// tracking: a concurrent, bucketed, chained hash table with per-entry
// deadlines (FwMap), and a version chain of such maps (LayerMap) where
// the head accepts writes and stale tail layers are reclaimed once
// every worker has sealed them.

pub mod bucket;
pub mod funcs;
pub mod layer;
pub mod map;

pub use bucket::ENTRIES_PER_BUCKET;
pub use funcs::{CopyKind, HashKind, KeyEqKind, MergeKind};
pub use layer::{LayerHit, LayerMap, LayerWorker, TrimmedLayer};
pub use map::{
    EntryStatus, FwMap, FwMapConfig, FwMapEntry, FwMapGuard, FwMapStats, MAX_KEY_SIZE,
    MAX_VALUE_SIZE, MIN_INDEX_SIZE,
};
