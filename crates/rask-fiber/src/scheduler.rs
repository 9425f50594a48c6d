// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Per-thread cooperative scheduler.
//!
//! Every carrier thread gets its own scheduler. The thread's native stack
//! is the dispatcher: it resumes fibers one at a time and every fiber
//! suspends back to it. Nothing here is shared across threads.
//!
//! The scheduler never owns a fiber. Its ready and sleep queues hold
//! `WeakFiber`s; a started fiber keeps itself alive through a keep-alive
//! reference that the scheduler releases once it has seen the fiber
//! terminate. That is what lets a detached fiber finish on its own.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use corosensei::CoroutineResult;

use crate::context::{FiberId, FiberRef, WeakFiber};
use crate::error::FiberError;

thread_local! {
    static SCHEDULER: Scheduler = Scheduler::new();
}

struct Sleeper {
    deadline: Instant,
    fiber: WeakFiber,
}

struct Scheduler {
    ready: RefCell<VecDeque<WeakFiber>>,
    /// Sorted by deadline, earliest first.
    sleeping: RefCell<Vec<Sleeper>>,
    /// Fiber currently executing, `None` while on the dispatcher.
    current: RefCell<Option<FiberRef>>,
    /// Started and not yet terminated.
    live: Cell<usize>,
}

impl Scheduler {
    fn new() -> Self {
        Self {
            ready: RefCell::new(VecDeque::new()),
            sleeping: RefCell::new(Vec::new()),
            current: RefCell::new(None),
            live: Cell::new(0),
        }
    }

    fn current(&self) -> Option<FiberRef> {
        self.current.borrow().clone()
    }

    fn in_fiber(&self) -> bool {
        self.current.borrow().is_some()
    }

    fn make_ready(&self, fiber: WeakFiber) {
        self.ready.borrow_mut().push_back(fiber);
    }

    fn pop_ready(&self) -> Option<FiberRef> {
        loop {
            let weak = self.ready.borrow_mut().pop_front()?;
            match weak.upgrade() {
                Some(fiber) if !fiber.is_terminated() => return Some(fiber),
                _ => continue,
            }
        }
    }

    fn add_sleeper(&self, deadline: Instant, fiber: WeakFiber) {
        let mut sleeping = self.sleeping.borrow_mut();
        let at = sleeping.partition_point(|s| s.deadline <= deadline);
        sleeping.insert(at, Sleeper { deadline, fiber });
    }

    /// Move every sleeper whose deadline has passed to the ready queue.
    fn wake_sleepers(&self, now: Instant) {
        let due: Vec<Sleeper> = {
            let mut sleeping = self.sleeping.borrow_mut();
            let n = sleeping.partition_point(|s| s.deadline <= now);
            sleeping.drain(..n).collect()
        };
        for sleeper in due {
            self.make_ready(sleeper.fiber);
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.sleeping.borrow().first().map(|s| s.deadline)
    }

    /// Run `fiber` until it suspends or terminates.
    fn resume(&self, fiber: FiberRef) {
        let previous = self.current.replace(Some(fiber.clone()));
        assert!(previous.is_none(), "fibers may only be resumed from the dispatcher");

        tracing::trace!(fiber = %fiber.id(), "resuming fiber");
        // SAFETY: we are on the dispatcher and `fiber` is not running.
        let result = panic::catch_unwind(AssertUnwindSafe(|| unsafe { fiber.resume() }));
        self.current.replace(None);

        match result {
            Ok(CoroutineResult::Yield(())) => {
                tracing::trace!(fiber = %fiber.id(), "fiber suspended");
            }
            Ok(CoroutineResult::Return(())) => self.finish(&fiber, None),
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                tracing::error!(fiber = %fiber.id(), panic = %msg, "fiber panicked");
                self.finish(&fiber, Some(msg));
            }
        }
    }

    fn finish(&self, fiber: &FiberRef, panic: Option<String>) {
        for waiter in fiber.mark_terminated(panic) {
            self.make_ready(waiter);
        }
        self.live.set(self.live.get() - 1);
        tracing::trace!(fiber = %fiber.id(), "fiber terminated");
        // Dropping the keep-alive may release the body and the stack; we are
        // on the dispatcher's stack, not the fiber's.
        drop(fiber.take_keep_alive());
    }

    /// Dispatch until `done` holds.
    ///
    /// When nothing is runnable the thread sleeps until the next sleeper's
    /// deadline or `deadline`, whichever is first.
    ///
    /// # Panics
    ///
    /// If nothing is runnable, nothing is sleeping, no deadline is given and
    /// `done` still does not hold: no fiber can ever make progress.
    fn run_until(&self, done: &dyn Fn() -> bool, deadline: Option<Instant>) {
        self.assert_dispatcher();
        loop {
            self.wake_sleepers(Instant::now());
            if done() {
                return;
            }
            if let Some(fiber) = self.pop_ready() {
                self.resume(fiber);
                continue;
            }
            let wake_at = match (self.next_deadline(), deadline) {
                (Some(a), Some(b)) => a.min(b),
                (a, b) => match a.or(b) {
                    Some(at) => at,
                    None => panic!(
                        "deadlock: waiting on the dispatcher with no runnable or sleeping fibers \
                         ({} fibers still live)",
                        self.live.get()
                    ),
                },
            };
            park_until(wake_at);
        }
    }

    fn assert_dispatcher(&self) {
        assert!(
            !self.in_fiber(),
            "the dispatcher loop cannot be entered from inside a fiber"
        );
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let live = self.live.get();
        if live > 0 {
            tracing::warn!(
                live,
                "carrier thread exiting with unfinished fibers; their stacks are leaked"
            );
        }
    }
}

fn park_until(deadline: Instant) {
    let now = Instant::now();
    if deadline > now {
        std::thread::sleep(deadline - now);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Hand a freshly created fiber to this thread's scheduler.
///
/// The fiber becomes runnable; it first executes the next time the
/// dispatcher runs.
pub(crate) fn start(fiber: &FiberRef) {
    fiber.set_keep_alive(fiber.clone());
    SCHEDULER.with(|s| {
        s.live.set(s.live.get() + 1);
        s.make_ready(fiber.downgrade());
    });
    tracing::trace!(fiber = %fiber.id(), "fiber started");
}

/// Block until `target` terminates.
///
/// Inside a fiber this suspends only the calling fiber. On the dispatcher
/// it runs other fibers until `target` is done.
pub(crate) fn join(target: &FiberRef) -> Result<(), FiberError> {
    SCHEDULER.with(|s| match s.current() {
        Some(current) => {
            if current.ptr_eq(target) {
                return Err(FiberError::Deadlock);
            }
            while !target.is_terminated() {
                target.add_waiter(current.downgrade());
                current.suspend();
            }
            Ok(())
        }
        None => {
            s.run_until(&|| target.is_terminated(), None);
            Ok(())
        }
    })
}

/// Identity of the running fiber, `None` on the dispatcher.
pub(crate) fn current_id() -> Option<FiberId> {
    SCHEDULER.with(|s| s.current.borrow().as_ref().map(|f| f.id()))
}

pub(crate) fn current() -> Option<FiberRef> {
    SCHEDULER.with(|s| s.current())
}

/// Give other fibers a turn.
///
/// From a fiber: requeue it at the back and suspend. From the dispatcher:
/// run every fiber that is runnable right now once.
pub(crate) fn yield_now() {
    SCHEDULER.with(|s| match s.current() {
        Some(current) => {
            s.make_ready(current.downgrade());
            current.suspend();
        }
        None => {
            s.wake_sleepers(Instant::now());
            let runnable = s.ready.borrow().len();
            for _ in 0..runnable {
                match s.pop_ready() {
                    Some(fiber) => s.resume(fiber),
                    None => break,
                }
            }
        }
    })
}

/// Suspend the caller until `deadline`.
pub(crate) fn sleep_until(deadline: Instant) {
    SCHEDULER.with(|s| match s.current() {
        Some(current) => {
            s.add_sleeper(deadline, current.downgrade());
            current.suspend();
        }
        None => s.run_until(&|| Instant::now() >= deadline, Some(deadline)),
    })
}

/// Run every fiber on this thread until none is runnable or sleeping.
///
/// Fibers blocked on each other forever are left as they are.
///
/// # Panics
///
/// If called from inside a fiber.
pub fn run_until_idle() {
    SCHEDULER.with(|s| {
        s.assert_dispatcher();
        loop {
            s.wake_sleepers(Instant::now());
            if let Some(fiber) = s.pop_ready() {
                s.resume(fiber);
                continue;
            }
            match s.next_deadline() {
                Some(at) => park_until(at),
                None => break,
            }
        }
    })
}

/// Fibers started on this thread that have not terminated yet.
pub fn live_fibers() -> usize {
    SCHEDULER.with(|s| s.live.get())
}
