// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Operations on the fiber that is currently running.
//!
//! Called from the thread's own stack (outside any fiber) these act on the
//! dispatcher instead: `yield_now` and `sleep_*` run other fibers, and the
//! interruption queries report nothing pending.

use std::any::Any;
use std::time::{Duration, Instant};

use crate::context::FiberId;
use crate::error::FiberError;
use crate::scheduler;

/// Identity of the running fiber, `None` outside any fiber.
pub fn id() -> Option<FiberId> {
    scheduler::current_id()
}

/// Let every other runnable fiber go first.
pub fn yield_now() {
    scheduler::yield_now();
}

/// Suspend for at least `duration`.
pub fn sleep_for(duration: Duration) {
    scheduler::sleep_until(Instant::now() + duration);
}

/// Suspend until `deadline` has passed.
pub fn sleep_until(deadline: Instant) {
    scheduler::sleep_until(deadline);
}

/// Whether `Fiber::interrupt` has been called on the running fiber.
pub fn interruption_requested() -> bool {
    scheduler::current().is_some_and(|f| f.interrupt_requested())
}

/// `Err(FiberError::Interrupted)` once an interrupt has been requested.
///
/// Interruption is cooperative: the fiber decides where to call this and
/// how to unwind its own work.
pub fn interruption_point() -> Result<(), FiberError> {
    if interruption_requested() {
        return Err(FiberError::Interrupted);
    }
    Ok(())
}

/// Run `f` with the running fiber's properties narrowed to `T`.
///
/// # Panics
///
/// Outside a fiber, or if the running fiber was created without properties.
pub fn with_properties<T: Any, R>(f: impl FnOnce(&T) -> R) -> Result<R, FiberError> {
    let fiber = match scheduler::current() {
        Some(fiber) => fiber,
        None => panic!("this_fiber::with_properties called outside a fiber"),
    };
    let props = match fiber.properties() {
        Some(props) => props,
        None => panic!("fiber::properties not set"),
    };
    let props = props
        .downcast_ref::<T>()
        .ok_or_else(FiberError::property_type::<T>)?;
    Ok(f(props))
}
