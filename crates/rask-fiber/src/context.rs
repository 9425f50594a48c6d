// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Fiber control block.
//!
//! Each fiber's state lives in a `FiberContext` written directly into the
//! top of the fiber's own stack region; the bytes below it are the stack the
//! fiber executes on. The block is reference counted in place:
//!
//! - `FiberRef` is a strong reference. The owning `Fiber` handle holds one,
//!   and a started fiber holds one to itself until the scheduler sees it
//!   terminate. When the last strong reference goes, the body (coroutine,
//!   name, properties, waiters) is dropped.
//! - `WeakFiber` is what the scheduler keeps in its queues. It keeps the
//!   header readable but owns nothing. When the last weak reference goes,
//!   the region is handed back to the allocator stored in the header.

use std::alloc::Layout;
use std::any::Any;
use std::cell::{Cell, RefCell, UnsafeCell};
use std::fmt;
use std::mem::ManuallyDrop;
use std::num::{NonZeroU64, NonZeroUsize};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use corosensei::stack::{Stack, StackPointer};
use corosensei::{Coroutine, CoroutineResult, Yielder};

use crate::error::FiberError;
use crate::placement::{self, PlacementStrategy};
use crate::stack::{StackAllocator, StackContext};

/// Fewest bytes a fiber is allowed to execute on once its control block
/// has been carved out of the region.
pub const MIN_RESIDUAL_STACK: usize = 8 * 1024;

/// Unique, never reused fiber identity. Ordered by creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FiberId(NonZeroU64);

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

impl FiberId {
    fn next() -> Self {
        let raw = NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed);
        match NonZeroU64::new(raw) {
            Some(id) => FiberId(id),
            None => unreachable!("fiber id counter wrapped"),
        }
    }

    pub fn as_u64(&self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fiber-{}", self.0)
    }
}

/// Creation-time attributes carried into the control block.
#[derive(Default)]
pub(crate) struct Attributes {
    pub name: Option<String>,
    pub properties: Option<Box<dyn Any>>,
}

/// The part of the region below the control block.
struct ResidualStack {
    base: StackPointer,
    limit: StackPointer,
}

// SAFETY: `base` is the (64-byte aligned) control block address and `limit`
// the bottom of the same live region; the region outlives the coroutine
// because the coroutine is stored in, and dropped with, the control block.
unsafe impl Stack for ResidualStack {
    fn base(&self) -> StackPointer {
        self.base
    }

    fn limit(&self) -> StackPointer {
        self.limit
    }
}

type FiberCoroutine = Coroutine<(), (), (), ResidualStack>;

/// Everything that dies with the last strong reference.
struct Body {
    coroutine: UnsafeCell<FiberCoroutine>,
    /// Set on first resume; valid while the coroutine is running or suspended.
    yielder: Cell<Option<NonNull<Yielder<(), ()>>>>,
    name: Option<String>,
    properties: Option<Box<dyn Any>>,
    waiters: RefCell<Vec<WeakFiber>>,
    panic: RefCell<Option<String>>,
    keep_alive: Cell<Option<FiberRef>>,
}

/// In-place fiber state. 64-byte aligned so the residual stack top is
/// aligned for any target.
#[repr(C, align(64))]
pub(crate) struct FiberContext {
    strong: Cell<usize>,
    /// Weak references plus one shared by all strong references.
    weak: Cell<usize>,
    id: FiberId,
    terminated: Cell<bool>,
    interrupt_requested: Cell<bool>,
    stack: StackContext,
    allocator: ManuallyDrop<Box<dyn StackAllocator>>,
    body: ManuallyDrop<Body>,
}

impl FiberContext {
    pub fn id(&self) -> FiberId {
        self.id
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.get()
    }

    pub fn name(&self) -> Option<&str> {
        self.body.name.as_deref()
    }

    pub fn properties(&self) -> Option<&dyn Any> {
        self.body.properties.as_deref()
    }

    pub fn request_interrupt(&self) {
        self.interrupt_requested.set(true);
    }

    pub fn interrupt_requested(&self) -> bool {
        self.interrupt_requested.get()
    }

    pub fn add_waiter(&self, waiter: WeakFiber) {
        self.body.waiters.borrow_mut().push(waiter);
    }

    /// Record termination. Returns the fibers blocked in `join` on this one.
    pub fn mark_terminated(&self, panic: Option<String>) -> Vec<WeakFiber> {
        self.terminated.set(true);
        *self.body.panic.borrow_mut() = panic;
        std::mem::take(&mut *self.body.waiters.borrow_mut())
    }

    pub fn take_panic(&self) -> Option<String> {
        self.body.panic.borrow_mut().take()
    }

    pub fn set_keep_alive(&self, fiber: FiberRef) {
        self.body.keep_alive.set(Some(fiber));
    }

    pub fn take_keep_alive(&self) -> Option<FiberRef> {
        self.body.keep_alive.take()
    }

    /// Switch onto this fiber's stack until it suspends or returns.
    ///
    /// # Safety
    ///
    /// Only the scheduler's dispatch loop may call this, never from inside
    /// the fiber itself, and never while the fiber is already running.
    pub unsafe fn resume(&self) -> CoroutineResult<(), ()> {
        (*self.body.coroutine.get()).resume(())
    }

    /// Switch back to whoever resumed this fiber.
    ///
    /// Must be called from code running on this fiber.
    pub fn suspend(&self) {
        let yielder = match self.body.yielder.get() {
            Some(yielder) => yielder,
            None => panic!("suspend called on a fiber that is not running"),
        };
        // SAFETY: the yielder lives on this fiber's stack, which is alive
        // because we are executing on it.
        unsafe { yielder.as_ref() }.suspend(());
    }

    fn enter(&self, yielder: &Yielder<(), ()>) {
        self.body.yielder.set(Some(NonNull::from(yielder)));
    }
}

/// Strong reference to a fiber control block.
pub(crate) struct FiberRef {
    ptr: NonNull<FiberContext>,
}

impl FiberRef {
    pub fn downgrade(&self) -> WeakFiber {
        let ctx = self.context();
        ctx.weak.set(ctx.weak.get() + 1);
        WeakFiber { ptr: self.ptr }
    }

    pub fn ptr_eq(&self, other: &FiberRef) -> bool {
        self.ptr == other.ptr
    }

    fn context(&self) -> &FiberContext {
        // SAFETY: a strong reference keeps header and body alive.
        unsafe { self.ptr.as_ref() }
    }
}

impl std::ops::Deref for FiberRef {
    type Target = FiberContext;

    fn deref(&self) -> &FiberContext {
        self.context()
    }
}

impl Clone for FiberRef {
    fn clone(&self) -> Self {
        let ctx = self.context();
        ctx.strong.set(ctx.strong.get() + 1);
        FiberRef { ptr: self.ptr }
    }
}

impl Drop for FiberRef {
    fn drop(&mut self) {
        let ctx = self.context();
        let strong = ctx.strong.get() - 1;
        ctx.strong.set(strong);
        if strong > 0 {
            return;
        }

        tracing::trace!(fiber = %ctx.id, "dropping fiber body");
        // SAFETY: last strong reference. Weak references never touch the
        // body, so no other borrow of it exists.
        unsafe {
            ManuallyDrop::drop(&mut (*self.ptr.as_ptr()).body);
            release_weak(self.ptr);
        }
    }
}

impl fmt::Debug for FiberRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberRef")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

/// Non-owning reference to a fiber control block.
pub(crate) struct WeakFiber {
    ptr: NonNull<FiberContext>,
}

impl WeakFiber {
    /// Strong reference, unless the body is already gone.
    pub fn upgrade(&self) -> Option<FiberRef> {
        let ctx = self.header();
        let strong = ctx.strong.get();
        if strong == 0 {
            return None;
        }
        ctx.strong.set(strong + 1);
        Some(FiberRef { ptr: self.ptr })
    }

    pub fn id(&self) -> FiberId {
        self.header().id
    }

    fn header(&self) -> &FiberContext {
        // SAFETY: a weak reference keeps the header alive. Callers only
        // read header fields through it.
        unsafe { self.ptr.as_ref() }
    }
}

impl Clone for WeakFiber {
    fn clone(&self) -> Self {
        let ctx = self.header();
        ctx.weak.set(ctx.weak.get() + 1);
        WeakFiber { ptr: self.ptr }
    }
}

impl Drop for WeakFiber {
    fn drop(&mut self) {
        // SAFETY: we own one weak count.
        unsafe { release_weak(self.ptr) };
    }
}

impl fmt::Debug for WeakFiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WeakFiber").field(&self.id()).finish()
    }
}

/// Drop one weak count; the last one returns the region to its allocator.
unsafe fn release_weak(ptr: NonNull<FiberContext>) {
    let ctx = ptr.as_ptr();
    let weak = (*ctx).weak.get() - 1;
    (*ctx).weak.set(weak);
    if weak > 0 {
        return;
    }

    let id = (*ctx).id;
    let stack = (*ctx).stack;
    let allocator = ManuallyDrop::take(&mut (*ctx).allocator);
    // The remaining header fields are plain data; the block's bytes belong
    // to the region from here on.
    allocator.deallocate(stack);
    tracing::trace!(fiber = %id, size = stack.size, "released fiber stack");
}

/// Allocate a region, place a control block at its top and build the
/// fiber inside it. The fiber is not started.
///
/// `f` (with everything it captured) is invoked exactly once, on the first
/// resume.
///
/// # Panics
///
/// If the region cannot hold the control block plus `MIN_RESIDUAL_STACK`.
pub(crate) fn create<F>(
    allocator: Box<dyn StackAllocator>,
    attrs: Attributes,
    f: F,
) -> Result<FiberRef, FiberError>
where
    F: FnOnce() + 'static,
{
    let sctx = allocator.allocate()?;
    let placement = placement::place(
        sctx.top(),
        sctx.size,
        Layout::new::<FiberContext>(),
        PlacementStrategy::Aligned,
    );
    if placement.residual_size < MIN_RESIDUAL_STACK {
        // SAFETY: fresh from this allocator and nothing was built on it.
        unsafe { allocator.deallocate(sctx) };
        panic!(
            "stack region of {} bytes leaves only {} bytes to execute on (need {})",
            sctx.size, placement.residual_size, MIN_RESIDUAL_STACK
        );
    }

    let block = placement.address as *mut FiberContext;
    // SAFETY: `place` guarantees a non-null, aligned address inside the
    // region, and the region's bottom is below it.
    let ptr = unsafe { NonNull::new_unchecked(block) };
    let residual = ResidualStack {
        base: to_stack_pointer(placement.address),
        limit: to_stack_pointer(sctx.bottom()),
    };

    let entry = ptr;
    let coroutine = Coroutine::with_stack(residual, move |yielder: &Yielder<(), ()>, ()| {
        // SAFETY: a running fiber keeps itself alive (keep-alive reference).
        unsafe { entry.as_ref() }.enter(yielder);
        f();
    });

    let id = FiberId::next();
    // SAFETY: the placement is in bounds, aligned for `FiberContext`, and
    // nothing else uses these bytes yet.
    unsafe {
        block.write(FiberContext {
            strong: Cell::new(1),
            weak: Cell::new(1),
            id,
            terminated: Cell::new(false),
            interrupt_requested: Cell::new(false),
            stack: sctx,
            allocator: ManuallyDrop::new(allocator),
            body: ManuallyDrop::new(Body {
                coroutine: UnsafeCell::new(coroutine),
                yielder: Cell::new(None),
                name: attrs.name,
                properties: attrs.properties,
                waiters: RefCell::new(Vec::new()),
                panic: RefCell::new(None),
                keep_alive: Cell::new(None),
            }),
        });
    }

    tracing::trace!(
        fiber = %id,
        region = sctx.size,
        residual = placement.residual_size,
        "created fiber"
    );
    Ok(FiberRef { ptr })
}

fn to_stack_pointer(addr: usize) -> StackPointer {
    match NonZeroUsize::new(addr) {
        Some(sp) => sp,
        None => unreachable!("stack address is null"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::FixedSizeStack;
    use std::rc::Rc;

    fn heap() -> Box<dyn StackAllocator> {
        Box::new(FixedSizeStack::new(64 * 1024).unwrap())
    }

    #[test]
    fn block_sits_inside_region() {
        let fiber = create(heap(), Attributes::default(), || {}).unwrap();
        let addr = fiber.ptr.as_ptr() as usize;
        assert_eq!(addr % 64, 0);
        assert!(addr >= fiber.stack.bottom());
        assert!(addr + std::mem::size_of::<FiberContext>() <= fiber.stack.top());
    }

    #[test]
    fn ids_are_unique_and_increasing() {
        let a = create(heap(), Attributes::default(), || {}).unwrap();
        let b = create(heap(), Attributes::default(), || {}).unwrap();
        assert_ne!(a.id(), b.id());
        assert!(a.id() < b.id());
    }

    #[test]
    fn unstarted_fiber_drops_its_closure() {
        let token = Rc::new(());
        let held = token.clone();
        let fiber = create(heap(), Attributes::default(), move || drop(held)).unwrap();
        assert_eq!(Rc::strong_count(&token), 2);
        drop(fiber);
        assert_eq!(Rc::strong_count(&token), 1);
    }

    #[test]
    fn weak_outlives_body() {
        let fiber = create(heap(), Attributes::default(), || {}).unwrap();
        let id = fiber.id();
        let weak = fiber.downgrade();
        assert!(weak.upgrade().is_some());
        drop(fiber);
        assert!(weak.upgrade().is_none());
        assert_eq!(weak.id(), id);
    }

    #[test]
    fn resume_runs_callable_once() {
        let runs = Rc::new(Cell::new(0));
        let r = runs.clone();
        let fiber = create(heap(), Attributes::default(), move || r.set(r.get() + 1)).unwrap();
        let result = unsafe { fiber.resume() };
        assert!(matches!(result, CoroutineResult::Return(())));
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn attributes_are_stored() {
        let attrs = Attributes {
            name: Some("worker".into()),
            properties: Some(Box::new(7u32)),
        };
        let fiber = create(heap(), attrs, || {}).unwrap();
        assert_eq!(fiber.name(), Some("worker"));
        assert_eq!(fiber.properties().and_then(|p| p.downcast_ref::<u32>()), Some(&7));
    }

    /// Hands out 4 KiB regions, bypassing the allocators' own minimum.
    struct Tiny {
        released: Rc<Cell<usize>>,
    }

    impl StackAllocator for Tiny {
        fn allocate(&self) -> Result<StackContext, FiberError> {
            let layout = Layout::from_size_align(4096, 16).unwrap();
            let base = unsafe { std::alloc::alloc(layout) };
            let sp = NonNull::new(unsafe { base.add(4096) }).unwrap();
            Ok(StackContext { sp, size: 4096 })
        }
        unsafe fn deallocate(&self, sctx: StackContext) {
            self.released.set(self.released.get() + 1);
            let layout = Layout::from_size_align(4096, 16).unwrap();
            std::alloc::dealloc(sctx.sp.as_ptr().sub(4096), layout);
        }
    }

    #[test]
    #[should_panic(expected = "leaves only")]
    fn region_without_room_to_execute_is_fatal() {
        let tiny = Tiny {
            released: Rc::new(Cell::new(0)),
        };
        let _ = create(Box::new(tiny), Attributes::default(), || {});
    }

    #[test]
    fn undersized_region_is_returned_before_failing() {
        let released = Rc::new(Cell::new(0));
        let tiny = Tiny {
            released: released.clone(),
        };
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            create(Box::new(tiny), Attributes::default(), || {})
        }));
        assert!(result.is_err());
        assert_eq!(released.get(), 1);
    }

    #[test]
    fn id_display_uses_raw_value() {
        let fiber = create(heap(), Attributes::default(), || {}).unwrap();
        let id = fiber.id();
        assert!(id.as_u64() > 0);
        assert_eq!(id.to_string(), format!("fiber-{}", id.as_u64()));
    }
}
