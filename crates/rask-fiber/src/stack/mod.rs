// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Stack regions and the allocators that supply them.
//!
//! A region is described by its top-of-stack pointer and size; stacks grow
//! down, so the usable bytes are `[sp - size, sp)`. Allocators hand out
//! regions and take them back once the fiber that ran on them is gone.
//!
//! - `fixed`: plain heap regions
//! - `protected`: mmap'd regions with a guard page
//! - `pooled`: recycles regions from a backing allocator

mod fixed;
mod pooled;
mod protected;

use std::ptr::NonNull;

pub use fixed::FixedSizeStack;
pub use pooled::PooledFixedSizeStack;
pub use protected::ProtectedFixedSizeStack;

use crate::config;
use crate::error::FiberError;

/// Smallest region any allocator in this crate hands out.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// Alignment of every region's top-of-stack pointer.
pub const STACK_ALIGN: usize = 16;

/// A contiguous stack region: `size` bytes ending (exclusive) at `sp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackContext {
    pub sp: NonNull<u8>,
    pub size: usize,
}

impl StackContext {
    /// Address one past the highest usable byte.
    pub fn top(&self) -> usize {
        self.sp.as_ptr() as usize
    }

    /// Address of the lowest usable byte.
    pub fn bottom(&self) -> usize {
        self.top() - self.size
    }
}

/// Source of fiber stacks.
///
/// The allocator is moved into the fiber's control block when the fiber is
/// created and is asked to take the region back when the control block is
/// released. It must therefore be self-contained (`'static`).
pub trait StackAllocator: 'static {
    /// Hand out a fresh region.
    fn allocate(&self) -> Result<StackContext, FiberError>;

    /// Take a region back.
    ///
    /// # Safety
    ///
    /// `sctx` must have been returned by `allocate` on this allocator (or a
    /// clone sharing its storage) and nothing may still live on it.
    unsafe fn deallocate(&self, sctx: StackContext);
}

/// Allocator used by `Fiber::new`, chosen from the process configuration.
pub fn default_allocator() -> Result<Box<dyn StackAllocator>, FiberError> {
    allocator_for(config::current().stack_size)
}

/// Allocator of the configured kind handing out `size`-byte regions.
pub fn allocator_for(size: usize) -> Result<Box<dyn StackAllocator>, FiberError> {
    if config::current().guard_pages {
        return Ok(Box::new(ProtectedFixedSizeStack::new(size)?));
    }
    Ok(Box::new(FixedSizeStack::new(size)?))
}

fn check_size(size: usize) -> Result<(), FiberError> {
    if size < MIN_STACK_SIZE {
        return Err(FiberError::InvalidStackSize {
            size,
            min: MIN_STACK_SIZE,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_bounds() {
        let mut buf = [0u8; 64];
        let top = NonNull::new(unsafe { buf.as_mut_ptr().add(64) }).unwrap();
        let sctx = StackContext { sp: top, size: 64 };
        assert_eq!(sctx.top() - sctx.bottom(), 64);
        assert_eq!(sctx.bottom(), buf.as_ptr() as usize);
    }

    #[test]
    fn default_allocator_honours_config() {
        let alloc = default_allocator().unwrap();
        let sctx = alloc.allocate().unwrap();
        assert!(sctx.size >= config::current().stack_size);
        assert_eq!(sctx.top() % STACK_ALIGN, 0);
        unsafe { alloc.deallocate(sctx) };
    }
}
