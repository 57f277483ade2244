// Copyright (c) 2025 Dataplane Core Contributors
//
// Agent registry and module-config publication
//
// The arena header carries a fixed table of named agents, one per
// module-scoped allocator. Registration is idempotent by (name,
// instance id): a controller re-attaching after restart finds its slot
// and reuses the allocations reachable from it. Each agent also carries
// one offset pointer to its published module configuration; publication
// is a single release store, pickup is an acquire load at the top of
// the worker loop.

use crate::error::{CoreError, Result};
use crate::shm::arena::Arena;
use crate::shm::context::MemoryContext;
use crate::shm::offset::OffsetPtr;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Number of agent slots in the arena header.
pub const MAX_AGENTS: usize = 32;

/// Fixed agent name field width (NUL padded).
pub const AGENT_NAME_LEN: usize = 64;

/// One named agent in the arena header.
#[repr(C)]
pub(crate) struct AgentSlot {
    pub(crate) name: [u8; AGENT_NAME_LEN],
    pub(crate) in_use: AtomicU32,
    _pad: u32,
    pub(crate) instance_id: u64,
    pub(crate) bytes_allocated: AtomicU64,
    pub(crate) alloc_count: AtomicU64,
    pub(crate) free_count: AtomicU64,
    pub(crate) config: OffsetPtr<u8>,
}

fn encode_name(name: &str) -> Result<[u8; AGENT_NAME_LEN]> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() >= AGENT_NAME_LEN {
        return Err(CoreError::Config(format!(
            "agent name must be 1..{} bytes, got {}",
            AGENT_NAME_LEN,
            bytes.len()
        )));
    }
    let mut out = [0u8; AGENT_NAME_LEN];
    out[..bytes.len()].copy_from_slice(bytes);
    Ok(out)
}

/// Register (or re-attach to) the named agent in this arena.
pub fn register_agent(arena: &Arc<Arena>, name: &str) -> Result<MemoryContext> {
    let encoded = encode_name(name)?;
    let hdr = arena.header();
    let instance_id = arena.instance_id();

    let _g = hdr.agent_lock.lock();
    let mut first_free = None;
    for slot in hdr.agents.iter() {
        if slot.in_use.load(Ordering::Acquire) != 0 {
            if slot.name == encoded && slot.instance_id == instance_id {
                return Ok(MemoryContext::from_slot(arena.clone(), slot.into()));
            }
        } else if first_free.is_none() {
            first_free = Some(slot);
        }
    }
    let slot = first_free
        .ok_or_else(|| CoreError::Config(format!("agent table full ({MAX_AGENTS} slots)")))?;

    // Safety: the slot is inside the arena mapping and we hold the
    // agent lock; nobody else writes an unused slot.
    unsafe {
        let p = slot as *const AgentSlot as *mut AgentSlot;
        (*p).name = encoded;
        (*p).instance_id = instance_id;
        (*p).bytes_allocated.store(0, Ordering::Relaxed);
        (*p).alloc_count.store(0, Ordering::Relaxed);
        (*p).free_count.store(0, Ordering::Relaxed);
        (*p).in_use.store(1, Ordering::Release);
    }
    Ok(MemoryContext::from_slot(arena.clone(), slot.into()))
}

/// A config tree that was replaced by a newer publication.
///
/// Workers may still be reading it for the remainder of their current
/// iteration, so it is not freed on publication. The controller calls
/// `release` after the workers have passed a quiescent point.
pub struct StaleConfig {
    ctx: MemoryContext,
    ptr: NonNull<u8>,
}

impl StaleConfig {
    /// Free the retired tree back to the agent's context.
    pub fn release(self) {
        self.ctx.free(self.ptr);
    }
}

impl MemoryContext {
    /// Publish a module configuration: the bytes are copied into the
    /// agent's context and exposed with a single release store. Returns
    /// the previous tree for deferred release, if any.
    pub fn publish_config(&self, config: &[u8]) -> Result<Option<StaleConfig>> {
        let block = self.alloc(8 + config.len())?;
        // Safety: block has 8 + config.len() writable bytes.
        unsafe {
            (block.as_ptr() as *mut u64).write(config.len() as u64);
            std::ptr::copy_nonoverlapping(
                config.as_ptr(),
                block.as_ptr().add(8),
                config.len(),
            );
        }
        let slot = self.slot();
        let old = slot.config.load(Ordering::Acquire);
        slot.config.store(block.as_ptr(), Ordering::Release);
        Ok(NonNull::new(old).map(|ptr| StaleConfig {
            ctx: self.clone(),
            ptr,
        }))
    }

    /// Read the currently published configuration, if any.
    pub fn with_config<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let p = self.slot().config.load(Ordering::Acquire);
        if p.is_null() {
            return None;
        }
        // Safety: p was produced by publish_config and is not freed
        // until the controller has observed worker quiescence.
        unsafe {
            let len = (p as *const u64).read() as usize;
            let bytes = std::slice::from_raw_parts(p.add(8), len);
            Some(f(bytes))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::arena::ArenaOptions;

    fn arena() -> Arc<Arena> {
        Arena::create(&ArenaOptions::sized(8 * 1024 * 1024)).unwrap()
    }

    #[test]
    fn test_register_is_idempotent() {
        let a = arena();
        let c1 = register_agent(&a, "balancer").unwrap();
        let c2 = register_agent(&a, "balancer").unwrap();
        assert_eq!(c1.slot_addr(), c2.slot_addr());

        let c3 = register_agent(&a, "fwstate").unwrap();
        assert_ne!(c1.slot_addr(), c3.slot_addr());
    }

    #[test]
    fn test_bad_names_rejected() {
        let a = arena();
        assert!(register_agent(&a, "").is_err());
        let long = "x".repeat(AGENT_NAME_LEN);
        assert!(register_agent(&a, &long).is_err());
    }

    #[test]
    fn test_table_capacity() {
        let a = arena();
        for i in 0..MAX_AGENTS {
            register_agent(&a, &format!("agent-{i}")).unwrap();
        }
        assert!(register_agent(&a, "one-too-many").is_err());
    }

    #[test]
    fn test_config_publication() {
        let a = arena();
        let ctx = register_agent(&a, "nat64").unwrap();
        assert!(ctx.with_config(|_| ()).is_none());

        let old = ctx.publish_config(b"v1: prefixes").unwrap();
        assert!(old.is_none());
        assert_eq!(
            ctx.with_config(|b| b.to_vec()).unwrap(),
            b"v1: prefixes".to_vec()
        );

        let old = ctx.publish_config(b"v2").unwrap().unwrap();
        assert_eq!(ctx.with_config(|b| b.to_vec()).unwrap(), b"v2".to_vec());
        old.release();
    }
}
