// Copyright (c) 2025 Dataplane Core Contributors
//
// Named allocation scopes over the arena

use crate::error::Result;
use crate::shm::arena::Arena;
use crate::shm::registry::{self, AgentSlot};
use serde::Serialize;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// A named, possibly nested, allocation scope bound to one arena.
///
/// Every allocation made by a core structure goes through its context,
/// never the general system heap, and records its exact request size so
/// the block returns to the correct size class on free. The handle is
/// process-local and cheap to clone; the counters live in the agent
/// slot inside shared memory.
pub struct MemoryContext {
    arena: Arc<Arena>,
    slot: NonNull<AgentSlot>,
}

// Safety: the slot lives in the shared mapping for the arena's
// lifetime; all counter updates are atomic.
unsafe impl Send for MemoryContext {}
unsafe impl Sync for MemoryContext {}

impl Clone for MemoryContext {
    fn clone(&self) -> Self {
        Self {
            arena: Arc::clone(&self.arena),
            slot: self.slot,
        }
    }
}

/// Context statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ContextStats {
    pub name: String,
    pub bytes_allocated: u64,
    pub alloc_count: u64,
    pub free_count: u64,
}

impl MemoryContext {
    /// Register (or re-attach to) the named agent in this arena.
    pub fn register(arena: &Arc<Arena>, name: &str) -> Result<MemoryContext> {
        registry::register_agent(arena, name)
    }

    /// Register a child scope, named `parent.suffix`.
    pub fn child(&self, suffix: &str) -> Result<MemoryContext> {
        let name = format!("{}.{}", self.name(), suffix);
        registry::register_agent(&self.arena, &name)
    }

    pub(crate) fn from_slot(arena: Arc<Arena>, slot: NonNull<AgentSlot>) -> Self {
        Self { arena, slot }
    }

    pub(crate) fn slot(&self) -> &AgentSlot {
        // Safety: the slot is inside the arena mapping, which the Arc
        // keeps alive for as long as this handle exists.
        unsafe { self.slot.as_ref() }
    }

    #[cfg(test)]
    pub(crate) fn slot_addr(&self) -> usize {
        self.slot.as_ptr() as usize
    }

    pub fn name(&self) -> String {
        let raw = &self.slot().name;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        String::from_utf8_lossy(&raw[..end]).into_owned()
    }

    pub fn arena(&self) -> &Arc<Arena> {
        &self.arena
    }

    /// Allocate zeroed, 64-byte-aligned bytes from the arena heap.
    pub fn alloc(&self, size: usize) -> Result<NonNull<u8>> {
        let p = self.arena.alloc(size)?;
        let slot = self.slot();
        slot.bytes_allocated.fetch_add(size as u64, Ordering::Relaxed);
        slot.alloc_count.fetch_add(1, Ordering::Relaxed);
        Ok(p)
    }

    /// Return an allocation to its size class.
    pub fn free(&self, p: NonNull<u8>) {
        debug_assert!(self.arena.contains(p.as_ptr()));
        let freed = self.arena.free(p);
        let slot = self.slot();
        slot.bytes_allocated
            .fetch_sub(freed as u64, Ordering::Relaxed);
        slot.free_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> ContextStats {
        let slot = self.slot();
        ContextStats {
            name: self.name(),
            bytes_allocated: slot.bytes_allocated.load(Ordering::Relaxed),
            alloc_count: slot.alloc_count.load(Ordering::Relaxed),
            free_count: slot.free_count.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::arena::ArenaOptions;

    fn ctx() -> MemoryContext {
        let arena = Arena::create(&ArenaOptions::sized(8 * 1024 * 1024)).unwrap();
        MemoryContext::register(&arena, "test").unwrap()
    }

    #[test]
    fn test_counters_track_live_allocations() {
        let c = ctx();
        let a = c.alloc(100).unwrap();
        let b = c.alloc(200).unwrap();
        let s = c.stats();
        assert_eq!(s.bytes_allocated, 300);
        assert_eq!(s.alloc_count, 2);

        c.free(a);
        let s = c.stats();
        assert_eq!(s.bytes_allocated, 200);
        assert_eq!(s.free_count, 1);
        c.free(b);
        assert_eq!(c.stats().bytes_allocated, 0);
    }

    #[test]
    fn test_child_scope_naming() {
        let c = ctx();
        let child = c.child("sessions").unwrap();
        assert_eq!(child.name(), "test.sessions");
        // Re-attach resolves to the same slot.
        let again = c.child("sessions").unwrap();
        assert_eq!(child.slot_addr(), again.slot_addr());
    }

    #[test]
    fn test_stats_serialize() {
        let c = ctx();
        let json = serde_json::to_string(&c.stats()).unwrap();
        assert!(json.contains("\"name\":\"test\""));
    }
}
