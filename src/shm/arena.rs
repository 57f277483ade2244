// Copyright (c) 2025 Dataplane Core Contributors
//
// Hugepage-backed shared arena with a size-class block allocator
//
// One arena backs one dataplane instance. The region starts with a
// header page (magic, instance id, allocator state, agent table)
// followed by the block heap. Allocation is by power-of-two size class:
// each class keeps a free list threaded through freed blocks with
// offset pointers, and falls back to bumping a heap cursor when the
// list is empty. Every block is preceded by a 64-byte header recording
// the exact requested size, so `free` returns it to the correct class
// and user data stays cache-line aligned.
//
// The arena may be anonymous (single process, tests) or file-backed for
// cross-process attach. Hugepages (2 MiB) are requested when available
// and fall back to standard pages with a one-time warning.

use crate::error::{CoreError, Result};
use crate::shm::lock::SpinLock;
use crate::shm::offset::OffsetPtr;
use crate::shm::registry::{AgentSlot, MAX_AGENTS};
use rand::Rng;
use std::fs::OpenOptions;
use std::mem;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Arena region magic ("DPLNARNA")
const ARENA_MAGIC: u64 = 0x4450_4c4e_4152_4e41;

/// Block header magic, for corruption checks on free
const BLOCK_MAGIC: u32 = 0x424c_4b48;

/// Hugepage size requested for anonymous regions (2 MiB)
pub const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

/// Smallest block size class, header included
pub const MIN_BLOCK_SIZE: usize = 128;

/// Largest block size class; single allocations above this are rejected
pub const MAX_BLOCK_SIZE: usize = 16 * 1024 * 1024;

const MIN_CLASS_SHIFT: u32 = MIN_BLOCK_SIZE.trailing_zeros();
const MAX_CLASS_SHIFT: u32 = MAX_BLOCK_SIZE.trailing_zeros();
const NUM_CLASSES: usize = (MAX_CLASS_SHIFT - MIN_CLASS_SHIFT + 1) as usize;

/// Per-block header. Cache-line sized so user data after it keeps
/// 64-byte alignment regardless of size class.
#[repr(C, align(64))]
struct BlockHeader {
    req_size: u64,
    class_shift: u32,
    magic: u32,
}

const BLOCK_HDR_SIZE: usize = mem::size_of::<BlockHeader>();
const _: () = assert!(BLOCK_HDR_SIZE == 64);

/// Free-list node written over the header of a freed block.
struct FreeBlock {
    next: OffsetPtr<FreeBlock>,
}

/// Region header, at offset 0 of every arena.
#[repr(C)]
pub(crate) struct ArenaHeader {
    magic: u64,
    instance_id: u64,
    size: u64,
    heap_start: u64,
    pub(crate) alloc_lock: SpinLock,
    _pad0: u32,
    heap_cursor: AtomicU64,
    bytes_allocated: AtomicU64,
    bytes_freed: AtomicU64,
    free_lists: [OffsetPtr<FreeBlock>; NUM_CLASSES],
    pub(crate) agent_lock: SpinLock,
    _pad1: u32,
    pub(crate) agents: [AgentSlot; MAX_AGENTS],
}

/// Arena construction options.
#[derive(Debug, Clone)]
pub struct ArenaOptions {
    /// Total region size; rounded up to a hugepage multiple.
    pub size: usize,
    /// Request MAP_HUGETLB for anonymous regions (best effort).
    pub huge_pages: bool,
    /// File backing for cross-process attach; anonymous when None.
    pub path: Option<PathBuf>,
}

impl Default for ArenaOptions {
    fn default() -> Self {
        Self {
            size: 64 * 1024 * 1024,
            huge_pages: true,
            path: None,
        }
    }
}

/// A mapped shared-memory region.
///
/// The handle is process-local; everything reachable from the header
/// uses offset pointers, so the same region attached elsewhere resolves
/// to the same structures.
pub struct Arena {
    base: NonNull<u8>,
    len: usize,
}

// Safety: the region is shared read-write by design; all mutable state
// inside it is atomics or data guarded by in-region locks.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

static HUGETLB_FALLBACK_WARNED: AtomicBool = AtomicBool::new(false);

impl Arena {
    /// Create and initialize a new arena.
    pub fn create(opts: &ArenaOptions) -> Result<Arc<Arena>> {
        let header_len = mem::size_of::<ArenaHeader>();
        if opts.size <= header_len + MIN_BLOCK_SIZE {
            return Err(CoreError::Config(format!(
                "arena size {} too small for header",
                opts.size
            )));
        }
        let len = opts.size.div_ceil(HUGE_PAGE_SIZE) * HUGE_PAGE_SIZE;

        let base = match &opts.path {
            Some(path) => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)?;
                file.set_len(len as u64)?;
                map_shared(len, false, Some(file.as_raw_fd()))?
            }
            None => map_shared(len, opts.huge_pages, None)?,
        };

        let arena = Arena { base, len };
        // Safety: the mapping is fresh, zeroed and large enough for the
        // header; we are the only thread that can see it.
        unsafe {
            let hdr = arena.base.as_ptr() as *mut ArenaHeader;
            (*hdr).magic = ARENA_MAGIC;
            (*hdr).instance_id = rand::rng().random::<u64>();
            (*hdr).size = len as u64;
            (*hdr).heap_start = align_up(header_len, MIN_BLOCK_SIZE) as u64;
            (*hdr).heap_cursor.store((*hdr).heap_start, Ordering::Relaxed);
        }
        Ok(Arc::new(arena))
    }

    /// Attach to an existing file-backed arena created elsewhere.
    pub fn open(path: &PathBuf) -> Result<Arc<Arena>> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        if len < mem::size_of::<ArenaHeader>() {
            return Err(CoreError::Attach(format!(
                "region {} too small for a header",
                path.display()
            )));
        }
        let base = map_shared(len, false, Some(file.as_raw_fd()))?;
        let arena = Arena { base, len };
        if arena.header().magic != ARENA_MAGIC {
            return Err(CoreError::Attach(format!(
                "bad magic in {}",
                path.display()
            )));
        }
        Ok(Arc::new(arena))
    }

    pub(crate) fn header(&self) -> &ArenaHeader {
        // Safety: header is initialized by create() before the arena is
        // shared, or validated by open().
        unsafe { &*(self.base.as_ptr() as *const ArenaHeader) }
    }

    pub fn instance_id(&self) -> u64 {
        self.header().instance_id
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Allocate `size` bytes from the block heap, zeroed, 64-byte
    /// aligned. Returns the user pointer (after the block header).
    pub(crate) fn alloc(&self, size: usize) -> Result<NonNull<u8>> {
        let total = size + BLOCK_HDR_SIZE;
        let class_size = total.next_power_of_two().max(MIN_BLOCK_SIZE);
        if class_size > MAX_BLOCK_SIZE {
            return Err(CoreError::OutOfMemory {
                requested: size,
                class: class_size,
            });
        }
        let shift = class_size.trailing_zeros();
        let list = (shift - MIN_CLASS_SHIFT) as usize;
        let hdr = self.header();

        let block: *mut u8;
        {
            let _g = hdr.alloc_lock.lock();
            let head = hdr.free_lists[list].load(Ordering::Relaxed);
            if !head.is_null() {
                // Safety: free-list nodes are written by free() over the
                // headers of blocks inside this arena.
                let next = unsafe { (*head).next.load(Ordering::Relaxed) };
                hdr.free_lists[list].store(next, Ordering::Relaxed);
                block = head as *mut u8;
            } else {
                let cur = hdr.heap_cursor.load(Ordering::Relaxed);
                let end = cur + class_size as u64;
                if end > self.len as u64 {
                    return Err(CoreError::OutOfMemory {
                        requested: size,
                        class: class_size,
                    });
                }
                hdr.heap_cursor.store(end, Ordering::Relaxed);
                // Safety: [cur, end) is inside the mapping.
                block = unsafe { self.base.as_ptr().add(cur as usize) };
            }
            hdr.bytes_allocated
                .fetch_add(size as u64, Ordering::Relaxed);
        }

        // Safety: block points at class_size bytes owned by this
        // allocation; the header prefix and user area do not overlap
        // other live blocks.
        unsafe {
            let bh = block as *mut BlockHeader;
            (*bh).req_size = size as u64;
            (*bh).class_shift = shift;
            (*bh).magic = BLOCK_MAGIC;
            let user = block.add(BLOCK_HDR_SIZE);
            ptr::write_bytes(user, 0, size);
            Ok(NonNull::new_unchecked(user))
        }
    }

    /// Return a block to its size-class free list. Returns the size
    /// that was originally requested.
    pub(crate) fn free(&self, user: NonNull<u8>) -> usize {
        // Safety: user was produced by alloc() on this arena, so a
        // BlockHeader sits immediately before it.
        unsafe {
            let block = user.as_ptr().sub(BLOCK_HDR_SIZE);
            let bh = block as *mut BlockHeader;
            debug_assert_eq!((*bh).magic, BLOCK_MAGIC);
            let req = (*bh).req_size as usize;
            let list = ((*bh).class_shift - MIN_CLASS_SHIFT) as usize;
            let hdr = self.header();

            let _g = hdr.alloc_lock.lock();
            let node = block as *mut FreeBlock;
            let head = hdr.free_lists[list].load(Ordering::Relaxed);
            (*node).next.store(head, Ordering::Relaxed);
            hdr.free_lists[list].store(node, Ordering::Relaxed);
            hdr.bytes_freed.fetch_add(req as u64, Ordering::Relaxed);
            req
        }
    }

    /// Bytes currently allocated minus bytes freed.
    pub fn bytes_in_use(&self) -> u64 {
        let hdr = self.header();
        hdr.bytes_allocated
            .load(Ordering::Relaxed)
            .saturating_sub(hdr.bytes_freed.load(Ordering::Relaxed))
    }

    pub(crate) fn contains(&self, p: *const u8) -> bool {
        let base = self.base.as_ptr() as usize;
        (p as usize) >= base && (p as usize) < base + self.len
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // Safety: base/len describe a mapping we own.
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

fn map_shared(len: usize, huge: bool, fd: Option<i32>) -> Result<NonNull<u8>> {
    let prot = libc::PROT_READ | libc::PROT_WRITE;
    let mut flags = libc::MAP_SHARED;
    if fd.is_none() {
        flags |= libc::MAP_ANONYMOUS;
    }
    let fd = fd.unwrap_or(-1);

    if huge && fd == -1 {
        // Safety: plain mmap; failure is checked against MAP_FAILED.
        let p = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                prot,
                flags | libc::MAP_HUGETLB,
                fd,
                0,
            )
        };
        if p != libc::MAP_FAILED {
            return Ok(NonNull::new(p as *mut u8).expect("mmap returned null"));
        }
        if !HUGETLB_FALLBACK_WARNED.swap(true, Ordering::Relaxed) {
            warn!(len, "MAP_HUGETLB unavailable, falling back to standard pages");
        }
    }

    // Safety: plain mmap; failure is checked against MAP_FAILED.
    let p = unsafe { libc::mmap(ptr::null_mut(), len, prot, flags, fd, 0) };
    if p == libc::MAP_FAILED {
        return Err(CoreError::Io(std::io::Error::last_os_error()));
    }
    Ok(NonNull::new(p as *mut u8).expect("mmap returned null"))
}

fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Small test/default arena options without hugepages.
impl ArenaOptions {
    pub fn sized(size: usize) -> Self {
        Self {
            size,
            huge_pages: false,
            path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_arena() -> Arc<Arena> {
        Arena::create(&ArenaOptions::sized(8 * 1024 * 1024)).unwrap()
    }

    #[test]
    fn test_create_and_ids() {
        let a = small_arena();
        assert_eq!(a.header().magic, ARENA_MAGIC);
        assert!(a.len() >= 8 * 1024 * 1024);
    }

    #[test]
    fn test_alloc_zeroed_and_aligned() {
        let a = small_arena();
        let p = a.alloc(300).unwrap();
        assert_eq!(p.as_ptr() as usize % 64, 0);
        // Safety: p points at 300 freshly allocated bytes.
        let s = unsafe { std::slice::from_raw_parts(p.as_ptr(), 300) };
        assert!(s.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_free_returns_to_class() {
        let a = small_arena();
        let p1 = a.alloc(1000).unwrap();
        let addr = p1.as_ptr() as usize;
        assert_eq!(a.free(p1), 1000);
        // Same class: the freed block must be reused.
        let p2 = a.alloc(900).unwrap();
        assert_eq!(p2.as_ptr() as usize, addr);
        // Freed-and-reused memory is zeroed again.
        let s = unsafe { std::slice::from_raw_parts(p2.as_ptr(), 900) };
        assert!(s.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_oversized_alloc_rejected() {
        let a = small_arena();
        assert!(matches!(
            a.alloc(MAX_BLOCK_SIZE),
            Err(CoreError::OutOfMemory { .. })
        ));
    }

    #[test]
    fn test_exhaustion_is_an_error_not_a_panic() {
        let a = Arena::create(&ArenaOptions::sized(2 * 1024 * 1024)).unwrap();
        let mut live = vec![];
        loop {
            match a.alloc(64 * 1024) {
                Ok(p) => live.push(p),
                Err(CoreError::OutOfMemory { .. }) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(!live.is_empty());
    }

    #[test]
    fn test_file_backed_attach() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arena.shm");
        let opts = ArenaOptions {
            size: 4 * 1024 * 1024,
            huge_pages: false,
            path: Some(path.clone()),
        };
        let a = Arena::create(&opts).unwrap();
        let id = a.instance_id();
        let p = a.alloc(128).unwrap();
        unsafe { p.as_ptr().write(0xAB) };

        let b = Arena::open(&path).unwrap();
        assert_eq!(b.instance_id(), id);
    }

    #[test]
    fn test_open_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.shm");
        std::fs::write(&path, vec![0u8; 4 * 1024 * 1024]).unwrap();
        assert!(matches!(Arena::open(&path), Err(CoreError::Attach(_))));
    }
}
