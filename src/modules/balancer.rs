// Copyright (c) 2025 Dataplane Core Contributors
//
// Balancer virtual-service state over the session table

use crate::session::{SessionId, SessionLookup, SessionTable, SessionTimeouts};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// One virtual service and its backends.
#[derive(Debug, Clone)]
pub struct VirtualService {
    pub vs_id: u32,
    pub reals: Vec<u32>,
}

struct VsState {
    reals: Vec<u32>,
    rr_cursor: AtomicUsize,
}

/// Session-sticky backend selection: an existing session keeps its
/// backend; a new one picks the next real round robin. Scheduling
/// beyond round robin is the balancer pipeline's business, not the
/// core's.
pub struct Balancer {
    table: SessionTable,
    timeouts: SessionTimeouts,
    services: RwLock<HashMap<u32, VsState>>,
}

impl Balancer {
    pub fn new(table: SessionTable, timeouts: SessionTimeouts) -> Self {
        Self {
            table,
            timeouts,
            services: RwLock::new(HashMap::new()),
        }
    }

    pub fn table(&self) -> &SessionTable {
        &self.table
    }

    pub fn upsert_service(&self, vs: VirtualService) {
        self.services.write().insert(
            vs.vs_id,
            VsState {
                reals: vs.reals,
                rr_cursor: AtomicUsize::new(0),
            },
        );
    }

    pub fn remove_service(&self, vs_id: u32) {
        self.services.write().remove(&vs_id);
    }

    /// Resolve the backend for one packet.
    ///
    /// Returns None when the service is unknown, has no backends, or
    /// the session table overflowed.
    pub fn pick_real(
        &self,
        worker_idx: usize,
        now: u64,
        id: &SessionId,
        proto: u8,
        tcp_flags: u8,
    ) -> Option<u32> {
        let timeout = self.timeouts.select(proto, tcp_flags);
        match self.table.get_or_create(worker_idx, now, timeout, id) {
            SessionLookup::Overflow => None,
            SessionLookup::Found(session) => Some(session.real_id()),
            SessionLookup::Created(mut session) => {
                let services = self.services.read();
                let vs = match services.get(&id.vs_id) {
                    Some(vs) if !vs.reals.is_empty() => vs,
                    _ => {
                        session.remove();
                        return None;
                    }
                };
                let n = vs.rr_cursor.fetch_add(1, Ordering::Relaxed);
                let real = vs.reals[n % vs.reals.len()];
                session.set_real_id(real);
                Some(real)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{IPPROTO_TCP, IPPROTO_UDP, TCP_SYN};
    use crate::shm::arena::{Arena, ArenaOptions};
    use crate::shm::context::MemoryContext;

    fn balancer() -> Balancer {
        let arena = Arena::create(&ArenaOptions::sized(16 * 1024 * 1024)).unwrap();
        let ctx = MemoryContext::register(&arena, "balancer-test").unwrap();
        let table = SessionTable::init(&ctx, 256, 2).unwrap();
        Balancer::new(table, SessionTimeouts::default())
    }

    fn id(n: u8, vs: u32) -> SessionId {
        SessionId::new([n; 16], 1000 + n as u16, vs)
    }

    #[test]
    fn test_round_robin_over_reals() {
        let b = balancer();
        b.upsert_service(VirtualService {
            vs_id: 1,
            reals: vec![10, 20, 30],
        });

        let picks: Vec<u32> = (0..6u8)
            .map(|n| b.pick_real(0, 100, &id(n, 1), IPPROTO_UDP, 0).unwrap())
            .collect();
        assert_eq!(picks, vec![10, 20, 30, 10, 20, 30]);
    }

    #[test]
    fn test_session_stickiness() {
        let b = balancer();
        b.upsert_service(VirtualService {
            vs_id: 1,
            reals: vec![10, 20],
        });

        let first = b
            .pick_real(0, 100, &id(1, 1), IPPROTO_TCP, TCP_SYN)
            .unwrap();
        // Later packets of the same session keep the backend even as
        // other sessions advance the cursor.
        for n in 2..6u8 {
            b.pick_real(0, 100, &id(n, 1), IPPROTO_UDP, 0);
        }
        assert_eq!(b.pick_real(0, 110, &id(1, 1), IPPROTO_TCP, 0), Some(first));
    }

    #[test]
    fn test_unknown_service_leaves_no_session() {
        let b = balancer();
        assert_eq!(b.pick_real(0, 100, &id(1, 99), IPPROTO_UDP, 0), None);
        // A later registration must see the id as new, not stuck with
        // real 0.
        b.upsert_service(VirtualService {
            vs_id: 99,
            reals: vec![5],
        });
        assert_eq!(b.pick_real(0, 101, &id(1, 99), IPPROTO_UDP, 0), Some(5));
    }

    #[test]
    fn test_expired_session_rebalances() {
        let b = balancer();
        b.upsert_service(VirtualService {
            vs_id: 1,
            reals: vec![10, 20],
        });
        let t = SessionTimeouts::default();
        let first = b.pick_real(0, 100, &id(1, 1), IPPROTO_UDP, 0).unwrap();
        assert_eq!(first, 10);
        // Past the UDP timeout the session is gone; the next packet
        // re-creates it on the next real.
        let later = 100 + t.udp + 1;
        assert_eq!(b.pick_real(0, later, &id(1, 1), IPPROTO_UDP, 0), Some(20));
    }
}
