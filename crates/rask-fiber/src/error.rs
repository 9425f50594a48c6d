// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Recoverable fiber errors.
//!
//! Ownership violations (dropping a joinable handle, joining an empty one)
//! and memory-layout violations are not represented here. Those abort or
//! assert; see `fiber` and `placement`.

use std::io;

use thiserror::Error;

/// Errors surfaced to callers of fiber operations.
#[derive(Debug, Error)]
pub enum FiberError {
    /// The stack allocator could not supply a region.
    #[error("failed to allocate a {size}-byte fiber stack")]
    StackAllocation {
        size: usize,
        #[source]
        source: io::Error,
    },

    /// Requested stack size is below the usable minimum.
    #[error("fiber stack size {size} is below the minimum of {min} bytes")]
    InvalidStackSize { size: usize, min: usize },

    /// The fiber's property object is not of the requested type.
    #[error("fiber properties are not of type `{expected}`")]
    PropertyType { expected: &'static str },

    /// The fiber's callable panicked.
    #[error("fiber panicked: {0}")]
    Panicked(String),

    /// An interrupt was requested for the current fiber.
    #[error("fiber was interrupted")]
    Interrupted,

    /// A fiber tried to join itself.
    #[error("fiber cannot join itself")]
    Deadlock,
}

impl FiberError {
    pub(crate) fn property_type<T: 'static>() -> Self {
        FiberError::PropertyType {
            expected: std::any::type_name::<T>(),
        }
    }
}
