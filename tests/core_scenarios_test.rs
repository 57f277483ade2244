// End-to-end scenarios across the core structures: map expiry, layer
// merge and reclamation, session resize under traffic, ring overwrite
// and framing.

use dataplane_core::fwmap::{FwMap, FwMapConfig, LayerMap, MergeKind};
use dataplane_core::modules::{state_flags, FwStateKey, FwStateMap};
use dataplane_core::pdump::{queue, CaptureInfo, DumpConfig, MIN_RING_SIZE, RECORD_HEADER_SIZE};
use dataplane_core::session::{SessionId, SessionLookup, SessionTable};
use dataplane_core::shm::{Arena, ArenaOptions, MemoryContext};
use std::sync::Arc;

fn context(name: &str) -> MemoryContext {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let arena = Arena::create(&ArenaOptions::sized(64 * 1024 * 1024)).unwrap();
    MemoryContext::register(&arena, name).unwrap()
}

#[test]
fn fwmap_insert_then_expire() {
    let ctx = context("scenario-fwmap");
    let config = FwMapConfig {
        key_size: 16,
        value_size: 8,
        index_size: 16,
        extra_bucket_count: 8,
        worker_count: 1,
        hash_seed: Some(42),
        ..Default::default()
    };
    let map = FwMap::new(&ctx, &config).unwrap();

    let key = [0u8; 16];
    map.put(0, &key, &7u64.to_le_bytes(), 100, 10).unwrap();

    // Live at 105, logically gone at 111, physically still counted.
    assert_eq!(map.get(&key, 105).unwrap().value(), &7u64.to_le_bytes());
    assert!(map.get(&key, 111).is_none());
    assert_eq!(map.stats().total_elements, 1);

    // Clear empties the map and resets the cursors.
    map.clear();
    assert!(map.get(&key, 105).is_none());
    assert_eq!(map.stats().total_elements, 0);
    assert_eq!(map.stats().keys_used, 0);
}

#[test]
fn layermap_additive_merge() {
    let ctx = context("scenario-layer");
    let config = FwMapConfig {
        key_size: 16,
        value_size: 8,
        index_size: 64,
        extra_bucket_count: 16,
        worker_count: 1,
        merge: MergeKind::AddU64,
        hash_seed: Some(42),
        ..Default::default()
    };
    let lm = LayerMap::new(&ctx, &config).unwrap();

    // Tail layer holds key K with value 5, live until 200.
    let k = [9u8; 16];
    lm.put_merging(0, &k, &5u64.to_le_bytes(), 100, 100).unwrap();
    lm.insert_new_layer().unwrap();

    // A fresh insert of 3 merges the live tail value: 8.
    lm.put_merging(0, &k, &3u64.to_le_bytes(), 100, 100).unwrap();
    let mut out = [0u8; 8];
    let hit = lm.get_across(&k, 150, &mut out).unwrap();
    assert!(!hit.stale);
    assert_eq!(u64::from_le_bytes(out), 8);
}

#[test]
fn layer_reclamation_requires_all_seals() {
    let ctx = context("scenario-trim");
    let config = FwMapConfig {
        key_size: 16,
        value_size: 8,
        index_size: 64,
        extra_bucket_count: 16,
        worker_count: 4,
        hash_seed: Some(42),
        ..Default::default()
    };
    let lm = LayerMap::new(&ctx, &config).unwrap();
    lm.put_merging(0, &[1u8; 16], &1u64.to_le_bytes(), 100, 50).unwrap();
    lm.insert_new_layer().unwrap();

    let mut workers: Vec<_> = (0..4).map(|_| lm.worker()).collect();
    for w in workers.iter_mut().take(3) {
        lm.quiesce(w);
    }
    // sealed_count == 3 of 4: stays linked even though outdated.
    assert!(lm.trim_stale_layers(200).is_empty());

    lm.quiesce(&mut workers[3]);
    let trimmed = lm.trim_stale_layers(200);
    assert_eq!(trimmed.len(), 1);
    assert_eq!(lm.layer_count(), 1);
    for t in trimmed {
        t.destroy();
    }
}

#[test]
fn session_resize_under_concurrent_lookups() {
    let ctx = context("scenario-resize");
    let table = Arc::new(SessionTable::init(&ctx, 128, 3).unwrap());

    let id = |n: u8| SessionId::new([n; 16], 7000 + n as u16, 1);
    for n in 0..40u8 {
        if let SessionLookup::Created(mut s) = table.get_or_create(0, 100, 50_000, &id(n)) {
            s.set_real_id(n as u32 + 1);
        }
    }

    crossbeam::thread::scope(|scope| {
        for w in 0..2usize {
            let table = Arc::clone(&table);
            scope.spawn(move |_| {
                for round in 0..300u64 {
                    for n in 0..40u8 {
                        match table.get_or_create(w, 200 + round, 50_000, &id(n)) {
                            SessionLookup::Found(s) => assert_eq!(s.real_id(), n as u32 + 1),
                            SessionLookup::Created(_) => {
                                panic!("live session re-created mid-resize")
                            }
                            SessionLookup::Overflow => {}
                        }
                    }
                }
            });
        }
        let table = Arc::clone(&table);
        scope.spawn(move |_| {
            table.resize(1024, 300).unwrap();
        });
    })
    .unwrap();

    // Every session survived with its backend and original birth time.
    for n in 0..40u8 {
        assert_eq!(table.get_real(&id(n), 600, 2), Some(n as u32 + 1));
        if let SessionLookup::Found(s) = table.get_or_create(2, 600, 50_000, &id(n)) {
            assert_eq!(s.create_timestamp(), 100);
        } else {
            panic!("session lost after resize");
        }
    }
}

#[test]
fn ring_overwrite_then_clean_drain() {
    let ctx = context("scenario-ring");
    let rings = DumpConfig {
        worker_count: 1,
        per_worker_size: MIN_RING_SIZE,
        snaplen: 2048,
    }
    .configure(&ctx)
    .unwrap();

    let mut w = rings.writer(0);
    let mut r = rings.reader(0);
    let info = |ts: u64| CaptureInfo {
        timestamp: ts,
        packet_len: 1200,
        worker_idx: 0,
        pipeline_idx: 0,
        rx_device_id: 3,
        tx_device_id: 4,
        queue: queue::DROPS,
    };

    // Fill well past one lap so the first records are overwritten.
    let payload = vec![0x5Au8; 1200];
    let per = ((RECORD_HEADER_SIZE + 1200 + 3) & !3) as u64;
    let n = (MIN_RING_SIZE as u64 / per) * 2;
    for i in 0..n {
        assert!(w.append(&info(i), &payload));
    }

    let mut out = Vec::new();
    r.read(512 * 1024, &mut out);
    assert!(!out.is_empty());
    assert_eq!(r.corrupt_discards(), 0);
    assert_eq!(r.read_idx(), w.write_idx());
    // Oldest surviving record is a whole record, and order held.
    for pair in out.windows(2) {
        assert_eq!(pair[1].meta.timestamp, pair[0].meta.timestamp + 1);
    }
    assert_eq!(out.last().unwrap().meta.timestamp, n - 1);
}

#[test]
fn ring_framing_across_the_wrap() {
    let ctx = context("scenario-wrap");
    let rings = DumpConfig {
        worker_count: 1,
        per_worker_size: MIN_RING_SIZE,
        snaplen: 4096,
    }
    .configure(&ctx)
    .unwrap();
    let mut w = rings.writer(0);
    let mut r = rings.reader(0);

    // Write in batches that never exceed the ring, draining between
    // batches, so after a few laps the wrap lands mid-record at
    // different offsets while nothing is lost.
    let sizes = [0usize, 1, 3, 4, 1023, 4000];
    let mut ts = 0u64;
    for _ in 0..4 {
        let mut expected = std::collections::VecDeque::new();
        let mut batch_bytes = 0u64;
        while batch_bytes < (3 * MIN_RING_SIZE as u64) / 4 {
            for &s in &sizes {
                let payload: Vec<u8> = (0..s).map(|i| (i ^ s) as u8).collect();
                assert!(w.append(
                    &CaptureInfo {
                        timestamp: ts,
                        packet_len: s as u32,
                        worker_idx: 0,
                        pipeline_idx: 0,
                        rx_device_id: 0,
                        tx_device_id: 0,
                        queue: queue::ALL,
                    },
                    &payload,
                ));
                batch_bytes += ((RECORD_HEADER_SIZE + s + 3) & !3) as u64;
                expected.push_back((ts, payload));
                ts += 1;
            }
        }

        let mut out = Vec::new();
        r.read(64 * 1024, &mut out);
        assert_eq!(out.len(), expected.len());
        for rec in out {
            let (want_ts, want_payload) = expected.pop_front().unwrap();
            assert_eq!(rec.meta.timestamp, want_ts);
            assert_eq!(rec.data, want_payload);
            assert_eq!(rec.data.len() as u32, rec.meta.data_size);
        }
    }
    assert_eq!(r.corrupt_discards(), 0);
}

#[test]
fn fwstate_sync_window_across_layers() {
    let ctx = context("scenario-fwstate");
    let fw = FwStateMap::new(&ctx, 2, 512, 64).unwrap();
    let key = FwStateKey::new(6, [1; 16], [2; 16], 50_000, 80);

    fw.record(0, &key, state_flags::SYN_SEEN, 100, 30);
    fw.record(1, &key, state_flags::ESTABLISHED, 105, 30);

    let hit = fw.check(&key, 110).unwrap();
    assert_eq!(hit.flags, state_flags::SYN_SEEN | state_flags::ESTABLISHED);
    assert_eq!(hit.deadline, 135);
    assert!(!FwStateMap::needs_sync(hit.deadline, 110));
    assert!(FwStateMap::needs_sync(hit.deadline, 128));

    // Roll a layer; progress flags survive the transition.
    fw.insert_new_layer().unwrap();
    fw.record(0, &key, state_flags::FIN_SEEN, 120, 30);
    let hit = fw.check(&key, 125).unwrap();
    assert_eq!(
        hit.flags,
        state_flags::SYN_SEEN | state_flags::ESTABLISHED | state_flags::FIN_SEEN
    );
}

#[test]
fn agent_registry_attach_and_config_flow() {
    let arena = Arena::create(&ArenaOptions::sized(16 * 1024 * 1024)).unwrap();
    let ctx = MemoryContext::register(&arena, "forward").unwrap();

    ctx.publish_config(b"route-table-v1").unwrap();

    // A re-attach by name observes the same agent and config.
    let again = MemoryContext::register(&arena, "forward").unwrap();
    assert_eq!(again.with_config(|c| c.to_vec()).unwrap(), b"route-table-v1");

    let stale = again.publish_config(b"route-table-v2").unwrap().unwrap();
    assert_eq!(ctx.with_config(|c| c.to_vec()).unwrap(), b"route-table-v2");
    stale.release();
}
