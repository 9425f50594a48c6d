// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! mmap'd stacks with a guard page.
//!
//! Layout of one mapping, low to high addresses:
//! `[guard page (PROT_NONE)][usable region ... sp)`.
//! Overflowing the usable region faults on the guard page instead of
//! scribbling over unrelated memory.

use std::io;
use std::ptr::{self, NonNull};
use std::sync::OnceLock;

use super::{check_size, StackAllocator, StackContext};
use crate::error::FiberError;

/// Allocates page-rounded regions with a guard page below each one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtectedFixedSizeStack {
    /// Usable bytes per region, a multiple of the page size.
    size: usize,
}

impl ProtectedFixedSizeStack {
    pub fn new(size: usize) -> Result<Self, FiberError> {
        check_size(size)?;
        let page = page_size();
        // The whole mapping, guard page included, must be addressable.
        let size = round_up(size, page)
            .filter(|rounded| rounded.checked_add(page).is_some())
            .ok_or_else(|| FiberError::StackAllocation {
                size,
                source: io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "stack size overflows the address space",
                ),
            })?;
        Ok(Self { size })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Checked against overflow in `new`.
    fn mapping_len(&self) -> usize {
        self.size + page_size()
    }
}

impl StackAllocator for ProtectedFixedSizeStack {
    fn allocate(&self) -> Result<StackContext, FiberError> {
        let len = self.mapping_len();
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(FiberError::StackAllocation {
                size: self.size,
                source: io::Error::last_os_error(),
            });
        }

        // Guard page at the low end; stacks grow down into it.
        let ret = unsafe { libc::mprotect(base, page_size(), libc::PROT_NONE) };
        if ret != 0 {
            let source = io::Error::last_os_error();
            unsafe { libc::munmap(base, len) };
            return Err(FiberError::StackAllocation {
                size: self.size,
                source,
            });
        }

        // SAFETY: `base + len` is one past the end of a successful mapping.
        let sp = unsafe { NonNull::new_unchecked((base as *mut u8).add(len)) };
        tracing::trace!(size = self.size, guard = page_size(), "mapped protected stack");
        Ok(StackContext {
            sp,
            size: self.size,
        })
    }

    unsafe fn deallocate(&self, sctx: StackContext) {
        debug_assert_eq!(sctx.size, self.size);
        let len = self.mapping_len();
        let base = sctx.sp.as_ptr().sub(len);
        if libc::munmap(base as *mut libc::c_void, len) != 0 {
            tracing::error!(
                error = %io::Error::last_os_error(),
                "failed to unmap fiber stack"
            );
        } else {
            tracing::trace!(size = sctx.size, "unmapped protected stack");
        }
    }
}

fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            size as usize
        } else {
            4096
        }
    })
}

fn round_up(size: usize, align: usize) -> Option<usize> {
    Some(size.checked_add(align - 1)? / align * align)
}
