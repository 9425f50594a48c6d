// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Rask fibers: cooperatively scheduled, stackful units of execution.
//!
//! A fiber runs on its own explicitly allocated stack and is multiplexed
//! with other fibers onto one carrier thread. Its control block is placed
//! at the top of that stack rather than allocated separately.
//!
//! Components:
//! - stack: stack regions and allocators (heap, guard-paged, pooled)
//! - placement: where a control block goes inside a region
//! - context: the in-place control block and its strong/weak refs
//! - scheduler: per-thread round-robin dispatcher
//! - fiber: the owning `Fiber` handle and `Builder`
//! - this_fiber: yield, sleep, interruption and properties of the caller
//! - config: `RASK_FIBER_*` configuration
//!
//! ```ignore
//! let mut fiber = rask_fiber::Fiber::new(|| {
//!     rask_fiber::this_fiber::yield_now();
//! })?;
//! fiber.join()?;
//! ```
//!
//! A `Fiber` that is dropped while still joinable aborts the process.

#[cfg(not(unix))]
compile_error!("rask-fiber supports unix targets only (guard pages use mmap, stacks use the unix stack ABI)");

pub mod config;
mod context;
mod error;
mod fiber;
pub mod placement;
mod scheduler;
pub mod stack;
pub mod this_fiber;

pub use config::FiberConfig;
pub use context::{FiberId, MIN_RESIDUAL_STACK};
pub use error::FiberError;
pub use fiber::{swap, Builder, Fiber};
pub use scheduler::{live_fibers, run_until_idle};
pub use stack::{
    FixedSizeStack, PooledFixedSizeStack, ProtectedFixedSizeStack, StackAllocator, StackContext,
};
