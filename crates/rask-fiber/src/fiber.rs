// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The fiber handle.
//!
//! A `Fiber` owns at most one running fiber. It is in one of three states:
//!
//! - empty: default-constructed, moved out of with `take`, joined or detached;
//! - joinable: refers to a fiber that has been neither joined nor detached,
//!   whether or not that fiber has finished running;
//! - dropped while joinable: a bug. The process aborts, the same way a
//!   joinable thread handle is treated elsewhere.
//!
//! Handles are neither `Clone` nor `Send`: one owner, one carrier thread.

use std::any::Any;
use std::cmp::Ordering;
use std::fmt;
use std::mem;
use std::ops::Not;

use crate::context::{self, Attributes, FiberId, FiberRef};
use crate::error::FiberError;
use crate::scheduler;
use crate::stack::{self, StackAllocator};

/// Owning handle to a fiber.
#[derive(Default)]
pub struct Fiber {
    inner: Option<FiberRef>,
}

impl Fiber {
    /// Create a fiber running `f` on a stack from the configured default
    /// allocator, and hand it to this thread's scheduler.
    ///
    /// Arguments for `f` are whatever it captures; they are moved into the
    /// fiber now and consumed when it first runs.
    pub fn new<F>(f: F) -> Result<Self, FiberError>
    where
        F: FnOnce() + 'static,
    {
        Builder::new().spawn(f)
    }

    /// Like `new`, with stacks drawn from `allocator`.
    ///
    /// The allocator moves into the fiber and gets the region back once the
    /// fiber is gone.
    pub fn with_allocator<A, F>(allocator: A, f: F) -> Result<Self, FiberError>
    where
        A: StackAllocator,
        F: FnOnce() + 'static,
    {
        Builder::new().allocator(allocator).spawn(f)
    }

    fn start(fiber: FiberRef) -> Self {
        scheduler::start(&fiber);
        Self { inner: Some(fiber) }
    }

    /// True while this handle refers to a fiber that has been neither joined
    /// nor detached, even if that fiber has already finished running.
    pub fn joinable(&self) -> bool {
        // Termination is deliberately not consulted: a finished fiber still
        // has to be joined or detached by its owner.
        self.inner.is_some()
    }

    /// True if this handle refers to a fiber that has not finished.
    ///
    /// `!&fiber` is the complement: empty, or finished but not yet joined.
    pub fn is_running(&self) -> bool {
        self.inner.as_ref().is_some_and(|f| !f.is_terminated())
    }

    /// The fiber's identity, `None` for an empty handle.
    pub fn id(&self) -> Option<FiberId> {
        self.inner.as_ref().map(|f| f.id())
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.as_ref().and_then(|f| f.name())
    }

    /// Give up ownership; the fiber keeps running under the scheduler and
    /// its stack is reclaimed when it finishes. The handle becomes empty.
    ///
    /// # Panics
    ///
    /// If the handle is empty.
    pub fn detach(&mut self) {
        match self.inner.take() {
            Some(fiber) => tracing::debug!(fiber = %fiber.id(), "detached fiber"),
            None => panic!("detach called on an empty fiber handle"),
        }
    }

    /// Wait for the fiber to finish, then become empty.
    ///
    /// Only the calling fiber is suspended; on the thread's own stack the
    /// scheduler runs other fibers in the meantime. Returns
    /// `FiberError::Panicked` if the fiber's callable panicked, and
    /// `FiberError::Deadlock` (leaving the handle joinable) if a fiber tries
    /// to join itself.
    ///
    /// # Panics
    ///
    /// If the handle is empty.
    pub fn join(&mut self) -> Result<(), FiberError> {
        let fiber = match &self.inner {
            Some(fiber) => fiber,
            None => panic!("join called on an empty fiber handle"),
        };
        scheduler::join(fiber)?;

        let fiber = self.inner.take();
        match fiber.and_then(|f| f.take_panic()) {
            Some(msg) => Err(FiberError::Panicked(msg)),
            None => Ok(()),
        }
    }

    /// Ask the fiber to stop at its next interruption point. Never blocks
    /// and leaves the handle untouched; a no-op on an empty handle.
    pub fn interrupt(&self) {
        if let Some(fiber) = &self.inner {
            tracing::debug!(fiber = %fiber.id(), "interrupt requested");
            fiber.request_interrupt();
        }
    }

    /// The property object attached at creation, narrowed to `T`.
    ///
    /// Properties are shared with the running fiber; use interior
    /// mutability in `T` for anything that changes.
    ///
    /// # Panics
    ///
    /// If the handle is empty or the fiber was created without properties.
    pub fn properties<T: Any>(&self) -> Result<&T, FiberError> {
        let fiber = match &self.inner {
            Some(fiber) => fiber,
            None => panic!("properties requested from an empty fiber handle"),
        };
        let props = match fiber.properties() {
            Some(props) => props,
            None => panic!("fiber::properties not set"),
        };
        props
            .downcast_ref::<T>()
            .ok_or_else(FiberError::property_type::<T>)
    }

    /// Move the fiber out, leaving this handle empty.
    pub fn take(&mut self) -> Fiber {
        Fiber {
            inner: self.inner.take(),
        }
    }

    /// Move `other` into this handle.
    ///
    /// Aborts if this handle is still joinable; plain assignment does the
    /// same through `Drop`.
    pub fn replace(&mut self, other: Fiber) {
        if self.joinable() {
            fatal("fiber handle overwritten while joinable", self.id());
        }
        *self = other;
    }

    pub fn swap(&mut self, other: &mut Fiber) {
        mem::swap(&mut self.inner, &mut other.inner);
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        if !self.joinable() {
            return;
        }
        if std::thread::panicking() {
            // Already unwinding: leave the fiber to the scheduler rather than
            // turning one failure into an abort.
            tracing::error!(fiber = ?self.id(), "joinable fiber handle dropped during a panic");
            return;
        }
        fatal("fiber handle dropped while joinable", self.id());
    }
}

#[cold]
fn fatal(what: &str, id: Option<FiberId>) -> ! {
    tracing::error!(fiber = ?id, "{what}; aborting");
    eprintln!("fatal: {what} ({id:?}); join or detach it first");
    std::process::abort()
}

/// `!&fiber`: empty, or finished but not yet joined.
impl Not for &Fiber {
    type Output = bool;

    fn not(self) -> bool {
        !self.is_running()
    }
}

impl PartialEq for Fiber {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Fiber {}

impl PartialOrd for Fiber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Ordered by identity; empty handles sort first.
impl Ord for Fiber {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id().cmp(&other.id())
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Some(fiber) => fmt::Debug::fmt(fiber, f),
            None => f.write_str("Fiber(empty)"),
        }
    }
}

/// Exchange the fibers owned by two handles.
pub fn swap(a: &mut Fiber, b: &mut Fiber) {
    a.swap(b);
}

/// Fiber factory with optional name, stack and properties.
///
/// ```ignore
/// let mut fiber = Builder::new()
///     .name("reader")
///     .stack_size(256 * 1024)
///     .properties(Priority::new(3))
///     .spawn(|| read_loop())?;
/// fiber.join()?;
/// ```
#[derive(Default)]
pub struct Builder {
    name: Option<String>,
    stack_size: Option<usize>,
    allocator: Option<Box<dyn StackAllocator>>,
    properties: Option<Box<dyn Any>>,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Stack size for the default allocator kind. Ignored when an explicit
    /// allocator is given.
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    pub fn allocator(mut self, allocator: impl StackAllocator) -> Self {
        self.allocator = Some(Box::new(allocator));
        self
    }

    /// Attach a property object, retrievable with `Fiber::properties` and
    /// `this_fiber::with_properties`.
    pub fn properties<P: Any>(mut self, props: P) -> Self {
        self.properties = Some(Box::new(props));
        self
    }

    /// Create the fiber and hand it to this thread's scheduler.
    pub fn spawn<F>(self, f: F) -> Result<Fiber, FiberError>
    where
        F: FnOnce() + 'static,
    {
        let allocator = match (self.allocator, self.stack_size) {
            (Some(allocator), _) => allocator,
            (None, Some(size)) => stack::allocator_for(size)?,
            (None, None) => stack::default_allocator()?,
        };
        let attrs = Attributes {
            name: self.name,
            properties: self.properties,
        };
        let fiber = context::create(allocator, attrs, f)?;
        Ok(Fiber::start(fiber))
    }
}
