// Copyright (c) 2025 Dataplane Core Contributors
//
// Shared-memory plumbing
//
// This module provides the shared-memory substrate the core data
// structures are built on: a hugepage-backed arena with a power-of-two
// block allocator, self-relative offset pointers that stay valid when
// the region is mapped at a different virtual address, spin locks that
// are safe to embed in shared memory, named memory contexts, and the
// agent registry used to publish module configuration across the
// control/data boundary.

pub mod arena;
pub mod context;
pub mod lock;
pub mod offset;
pub mod registry;

pub use arena::{Arena, ArenaOptions, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};
pub use context::{ContextStats, MemoryContext};
pub use lock::{SeqReadGuard, SeqRwLock, SeqWriteGuard, SpinGuard, SpinLock};
pub use offset::OffsetPtr;
pub use registry::{StaleConfig, AGENT_NAME_LEN, MAX_AGENTS};

/// Cache line size for padding to avoid false sharing
pub const CACHE_LINE_SIZE: usize = 64;
