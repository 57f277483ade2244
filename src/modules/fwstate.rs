// Copyright (c) 2025 Dataplane Core Contributors
//
// Firewall connection-state tracking over the layered map

use crate::error::Result;
use crate::fwmap::{FwMapConfig, HashKind, LayerHit, LayerMap, LayerWorker, MergeKind, TrimmedLayer};
use crate::shm::context::MemoryContext;

/// How long before an entry's deadline a state-sync frame should go
/// out, in timestamp ticks (seconds).
pub const SYNC_THRESHOLD: u64 = 8;

/// Fixed firewall-state key width: 37 bytes of tuple, zero padded to
/// 40 so hashing never reads undefined bytes.
pub const STATE_KEY_SIZE: usize = 40;

/// Connection progress flags, OR-merged across layer transitions.
pub mod state_flags {
    pub const SYN_SEEN: u32 = 1;
    pub const ESTABLISHED: u32 = 2;
    pub const FIN_SEEN: u32 = 4;
    pub const SYNCED: u32 = 8;
}

/// The 5-tuple identifying one tracked connection.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FwStateKey {
    pub proto: u8,
    pad: [u8; 3],
    pub src_ip: [u8; 16],
    pub dst_ip: [u8; 16],
    pub src_port: u16,
    pub dst_port: u16,
}

const _: () = assert!(std::mem::size_of::<FwStateKey>() == STATE_KEY_SIZE);

impl FwStateKey {
    pub fn new(proto: u8, src_ip: [u8; 16], dst_ip: [u8; 16], src_port: u16, dst_port: u16) -> Self {
        Self {
            proto,
            pad: [0; 3],
            src_ip,
            dst_ip,
            src_port,
            dst_port,
        }
    }

    #[inline]
    fn as_bytes(&self) -> &[u8] {
        // Safety: repr(C) with explicit padding; every byte is
        // initialized.
        unsafe {
            std::slice::from_raw_parts(self as *const Self as *const u8, STATE_KEY_SIZE)
        }
    }
}

/// A tracked-state lookup result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FwStateHit {
    pub flags: u32,
    pub deadline: u64,
    /// The state came from an older layer; callers queue a refresh.
    pub stale: bool,
}

/// Firewall state tracker: a LayerMap of connection flags with OR
/// merge, so progress bits survive layer transitions.
pub struct FwStateMap {
    layers: LayerMap,
}

impl FwStateMap {
    pub fn new(
        ctx: &MemoryContext,
        worker_count: u32,
        index_size: u32,
        extra_bucket_count: u32,
    ) -> Result<Self> {
        let config = FwMapConfig {
            key_size: STATE_KEY_SIZE as u32,
            value_size: 8,
            worker_count,
            index_size,
            extra_bucket_count,
            hash: HashKind::Fnv1a,
            merge: MergeKind::BitOr,
            ..Default::default()
        };
        Ok(Self {
            layers: LayerMap::new(ctx, &config)?,
        })
    }

    pub fn layers(&self) -> &LayerMap {
        &self.layers
    }

    pub fn worker(&self) -> LayerWorker {
        self.layers.worker()
    }

    /// Record observed flags for a connection, refreshing its
    /// deadline. Flags accumulate: bits already tracked (in any layer)
    /// stay set. Returns false when the head layer is full.
    pub fn record(
        &self,
        worker_idx: usize,
        key: &FwStateKey,
        flags: u32,
        now: u64,
        ttl: u64,
    ) -> bool {
        let mut flags = flags;
        if let Some(hit) = self.check(key, now) {
            flags |= hit.flags;
        }
        let mut value = [0u8; 8];
        value[..4].copy_from_slice(&flags.to_le_bytes());
        self.layers
            .put_merging(worker_idx, key.as_bytes(), &value, now, ttl)
            .is_some()
    }

    /// Look a connection up across all layers.
    pub fn check(&self, key: &FwStateKey, now: u64) -> Option<FwStateHit> {
        let mut value = [0u8; 8];
        let LayerHit {
            deadline, stale, ..
        } = self.layers.get_across(key.as_bytes(), now, &mut value)?;
        let mut flags = [0u8; 4];
        flags.copy_from_slice(&value[..4]);
        Some(FwStateHit {
            flags: u32::from_le_bytes(flags),
            deadline,
            stale,
        })
    }

    /// Whether a live entry is close enough to expiry that its state
    /// should be synced to the peer.
    pub fn needs_sync(deadline: u64, now: u64) -> bool {
        deadline > now && deadline - now <= SYNC_THRESHOLD
    }

    pub fn insert_new_layer(&self) -> Result<()> {
        self.layers.insert_new_layer()
    }

    pub fn quiesce(&self, worker: &mut LayerWorker) {
        self.layers.quiesce(worker)
    }

    pub fn trim_stale_layers(&self, now: u64) -> Vec<TrimmedLayer> {
        self.layers.trim_stale_layers(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::arena::{Arena, ArenaOptions};

    fn fwstate(workers: u32) -> FwStateMap {
        let arena = Arena::create(&ArenaOptions::sized(32 * 1024 * 1024)).unwrap();
        let ctx = MemoryContext::register(&arena, "fwstate-test").unwrap();
        FwStateMap::new(&ctx, workers, 256, 64).unwrap()
    }

    fn key(n: u8) -> FwStateKey {
        FwStateKey::new(6, [n; 16], [0xFF; 16], 40_000, 443)
    }

    #[test]
    fn test_record_and_check() {
        let fw = fwstate(1);
        assert!(fw.record(0, &key(1), state_flags::SYN_SEEN, 100, 30));
        let hit = fw.check(&key(1), 110).unwrap();
        assert_eq!(hit.flags, state_flags::SYN_SEEN);
        assert_eq!(hit.deadline, 130);
        assert!(!hit.stale);
        assert!(fw.check(&key(1), 131).is_none());
    }

    #[test]
    fn test_flags_survive_layer_transition() {
        let fw = fwstate(1);
        fw.record(0, &key(2), state_flags::SYN_SEEN, 100, 100);
        fw.insert_new_layer().unwrap();

        // The fresh insert merges the old SYN bit in via OR.
        fw.record(0, &key(2), state_flags::ESTABLISHED, 120, 100);
        let hit = fw.check(&key(2), 130).unwrap();
        assert!(!hit.stale);
        assert_eq!(hit.flags, state_flags::SYN_SEEN | state_flags::ESTABLISHED);
    }

    #[test]
    fn test_stale_flag_from_old_layer() {
        let fw = fwstate(1);
        fw.record(0, &key(3), state_flags::ESTABLISHED, 100, 100);
        fw.insert_new_layer().unwrap();

        let hit = fw.check(&key(3), 150).unwrap();
        assert!(hit.stale);
        assert_eq!(hit.flags, state_flags::ESTABLISHED);
    }

    #[test]
    fn test_sync_threshold_window() {
        assert!(!FwStateMap::needs_sync(100, 80));
        assert!(FwStateMap::needs_sync(100, 92));
        assert!(FwStateMap::needs_sync(100, 99));
        assert!(!FwStateMap::needs_sync(100, 100));
        assert!(!FwStateMap::needs_sync(100, 150));
    }

    #[test]
    fn test_layer_lifecycle() {
        let fw = fwstate(2);
        fw.record(0, &key(4), state_flags::FIN_SEEN, 100, 20);
        fw.insert_new_layer().unwrap();

        let mut w0 = fw.worker();
        let mut w1 = fw.worker();
        fw.quiesce(&mut w0);
        fw.quiesce(&mut w1);

        assert!(fw.trim_stale_layers(115).is_empty());
        let trimmed = fw.trim_stale_layers(200);
        assert_eq!(trimmed.len(), 1);
        for t in trimmed {
            t.destroy();
        }
        assert_eq!(fw.layers().layer_count(), 1);
    }
}
