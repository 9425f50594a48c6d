// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Recycling allocator.
//!
//! Fibers on one carrier thread share a pool: a region returned by a
//! finished fiber is handed to the next one instead of going back to the
//! OS. Clones share the same free list.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use super::{StackAllocator, StackContext};
use crate::config;
use crate::error::FiberError;

/// Pool of same-sized regions drawn from a backing allocator.
///
/// At most `capacity` free regions are retained; surplus regions are
/// returned to the backing allocator immediately.
#[derive(Clone)]
pub struct PooledFixedSizeStack {
    pool: Rc<Pool>,
}

struct Pool {
    backing: Box<dyn StackAllocator>,
    free: RefCell<Vec<StackContext>>,
    capacity: usize,
}

impl PooledFixedSizeStack {
    pub fn new(backing: impl StackAllocator, capacity: usize) -> Self {
        Self {
            pool: Rc::new(Pool {
                backing: Box::new(backing),
                free: RefCell::new(Vec::with_capacity(capacity)),
                capacity,
            }),
        }
    }

    /// Pool over the configured default allocator and capacity.
    pub fn from_config() -> Result<Self, FiberError> {
        let config = config::current();
        Ok(Self {
            pool: Rc::new(Pool {
                backing: super::default_allocator()?,
                free: RefCell::new(Vec::with_capacity(config.pool_capacity)),
                capacity: config.pool_capacity,
            }),
        })
    }

    /// Free regions currently held.
    pub fn idle(&self) -> usize {
        self.pool.free.borrow().len()
    }
}

impl fmt::Debug for PooledFixedSizeStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledFixedSizeStack")
            .field("idle", &self.idle())
            .field("capacity", &self.pool.capacity)
            .finish()
    }
}

impl StackAllocator for PooledFixedSizeStack {
    fn allocate(&self) -> Result<StackContext, FiberError> {
        if let Some(sctx) = self.pool.free.borrow_mut().pop() {
            tracing::trace!(size = sctx.size, "reusing pooled stack");
            return Ok(sctx);
        }
        self.pool.backing.allocate()
    }

    unsafe fn deallocate(&self, sctx: StackContext) {
        let mut free = self.pool.free.borrow_mut();
        if free.len() < self.pool.capacity {
            free.push(sctx);
            return;
        }
        drop(free);
        self.pool.backing.deallocate(sctx);
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        for sctx in self.free.get_mut().drain(..) {
            // SAFETY: every pooled region came from `backing` and is unused.
            unsafe { self.backing.deallocate(sctx) };
        }
    }
}
