// Copyright (c) 2025 Dataplane Core Contributors
//
// Module state wrappers
//
// Thin users of the core structures: the balancer's virtual-service
// state over the session table, and the firewall-state tracker over
// the layered map. The full module pipelines (schedulers, NAT64
// translation, rule evaluation) live outside this crate; these
// wrappers carry exactly the state that crosses the core boundary.

pub mod balancer;
pub mod fwstate;

pub use balancer::{Balancer, VirtualService};
pub use fwstate::{state_flags, FwStateHit, FwStateKey, FwStateMap, SYNC_THRESHOLD};
