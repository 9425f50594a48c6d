// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Heap-backed stacks without overflow protection.

use std::alloc::{self, Layout};
use std::io;
use std::ptr::NonNull;

use super::{check_size, StackAllocator, StackContext, STACK_ALIGN};
use crate::config;
use crate::error::FiberError;

/// Allocates fixed-size regions from the global allocator.
///
/// An overflow silently corrupts neighbouring heap memory; prefer
/// `ProtectedFixedSizeStack` unless the callables are known to be shallow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedSizeStack {
    size: usize,
}

impl FixedSizeStack {
    pub fn new(size: usize) -> Result<Self, FiberError> {
        check_size(size)?;
        Layout::from_size_align(size, STACK_ALIGN).map_err(|e| FiberError::StackAllocation {
            size,
            source: io::Error::new(io::ErrorKind::InvalidInput, e),
        })?;
        Ok(Self { size })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn layout(&self) -> Layout {
        // SAFETY: validated in `new`.
        unsafe { Layout::from_size_align_unchecked(self.size, STACK_ALIGN) }
    }
}

impl Default for FixedSizeStack {
    fn default() -> Self {
        Self {
            size: config::current().stack_size,
        }
    }
}

impl StackAllocator for FixedSizeStack {
    fn allocate(&self) -> Result<StackContext, FiberError> {
        // SAFETY: layout has non-zero size.
        let base = unsafe { alloc::alloc(self.layout()) };
        let Some(base) = NonNull::new(base) else {
            return Err(FiberError::StackAllocation {
                size: self.size,
                source: io::Error::from(io::ErrorKind::OutOfMemory),
            });
        };
        // SAFETY: one past the end of the allocation.
        let sp = unsafe { NonNull::new_unchecked(base.as_ptr().add(self.size)) };
        tracing::trace!(size = self.size, "allocated heap stack");
        Ok(StackContext {
            sp,
            size: self.size,
        })
    }

    unsafe fn deallocate(&self, sctx: StackContext) {
        debug_assert_eq!(sctx.size, self.size);
        let base = sctx.sp.as_ptr().sub(sctx.size);
        alloc::dealloc(base, self.layout());
        tracing::trace!(size = sctx.size, "released heap stack");
    }
}
