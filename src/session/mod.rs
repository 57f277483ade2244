// Copyright (c) 2025 Dataplane Core Contributors
//
// Balancer session state
//
// A resizable, lock-sharded table of balancer sessions: who is talking
// to which backend, since when, and for how long. The table holds two
// generation slots so capacity can change on-line: workers follow the
// generation counter's parity to know whether a previous generation
// must still be consulted, and the controller migrates live sessions
// between the generations without stopping traffic.

pub mod table;
pub mod timeout;
pub mod ttlmap;

pub use table::{SessionInfo, SessionLookup, SessionRef, SessionStatus, SessionTable};
pub use timeout::{SessionTimeouts, IPPROTO_TCP, IPPROTO_UDP, TCP_ACK, TCP_FIN, TCP_RST, TCP_SYN};
pub use ttlmap::SessionId;
