// Copyright (c) 2025 Dataplane Core Contributors
//
// Self-relative offset pointers
//
// A signed displacement `d` stored at address `p` denotes the object at
// `p + d`; zero denotes null. Because the displacement is taken from the
// field's own address rather than any region base, a whole arena can be
// remapped at a different virtual address in another process and every
// stored pointer remains valid with no fix-up pass. Nothing in shared
// memory ever holds an absolute virtual address.

use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicI64, Ordering};

/// A self-relative, atomically updated pointer for shared memory.
///
/// The in-memory representation is a single `i64` displacement, so the
/// type can be embedded in `#[repr(C)]` structures that are shared
/// across processes. `load`/`store` take explicit orderings; chain
/// traversals pair release stores with acquire loads.
#[repr(transparent)]
pub struct OffsetPtr<T> {
    disp: AtomicI64,
    _marker: PhantomData<*mut T>,
}

impl<T> OffsetPtr<T> {
    /// A null offset pointer (displacement zero).
    pub const fn null() -> Self {
        Self {
            disp: AtomicI64::new(0),
            _marker: PhantomData,
        }
    }

    /// Resolve the target address from this field's own address.
    #[inline]
    pub fn load(&self, order: Ordering) -> *mut T {
        let d = self.disp.load(order);
        if d == 0 {
            ptr::null_mut()
        } else {
            (self as *const Self as *mut u8).wrapping_offset(d as isize) as *mut T
        }
    }

    /// Store the displacement from this field's address to `target`.
    ///
    /// A null `target` stores displacement zero. A target that aliases
    /// the field itself cannot be represented (zero means null); such a
    /// layout never occurs in practice and is rejected in debug builds.
    #[inline]
    pub fn store(&self, target: *mut T, order: Ordering) {
        let d = if target.is_null() {
            0
        } else {
            (target as usize as i64).wrapping_sub(self as *const Self as usize as i64)
        };
        debug_assert!(d != 0 || target.is_null(), "target aliases the offset field");
        self.disp.store(d, order);
    }

    #[inline]
    pub fn is_null(&self, order: Ordering) -> bool {
        self.disp.load(order) == 0
    }
}
