// SPDX-License-Identifier: (MIT OR Apache-2.0)

//! End-to-end fiber lifecycle: create, run, join/detach, stack reclamation.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use rask_fiber::{
    run_until_idle, this_fiber, Builder, Fiber, FiberError, FixedSizeStack,
    PooledFixedSizeStack, StackAllocator, StackContext,
};

/// Heap stacks that count how many regions are out.
#[derive(Clone)]
struct Counting {
    inner: FixedSizeStack,
    allocated: Rc<Cell<usize>>,
    released: Rc<Cell<usize>>,
}

impl Counting {
    fn new() -> Self {
        Self {
            inner: FixedSizeStack::new(64 * 1024).unwrap(),
            allocated: Rc::new(Cell::new(0)),
            released: Rc::new(Cell::new(0)),
        }
    }

    fn outstanding(&self) -> usize {
        self.allocated.get() - self.released.get()
    }
}

impl StackAllocator for Counting {
    fn allocate(&self) -> Result<StackContext, FiberError> {
        let sctx = self.inner.allocate()?;
        self.allocated.set(self.allocated.get() + 1);
        Ok(sctx)
    }

    unsafe fn deallocate(&self, sctx: StackContext) {
        self.released.set(self.released.get() + 1);
        self.inner.deallocate(sctx);
    }
}

#[test]
fn join_empties_handle_and_releases_stack() {
    let alloc = Counting::new();
    let done = Rc::new(Cell::new(false));
    let d = done.clone();
    let mut fiber = Fiber::with_allocator(alloc.clone(), move || d.set(true)).unwrap();
    assert!(fiber.joinable());
    assert_eq!(alloc.outstanding(), 1);

    fiber.join().unwrap();
    assert!(done.get());
    assert!(!fiber.joinable());
    assert_eq!(fiber.id(), None);
    assert_eq!(alloc.outstanding(), 0);
    assert_eq!(alloc.allocated.get(), 1);
}

#[test]
fn detached_fiber_finishes_on_its_own() {
    let alloc = Counting::new();
    let runs = Rc::new(Cell::new(0));
    let r = runs.clone();
    let mut fiber = Fiber::with_allocator(alloc.clone(), move || {
        this_fiber::yield_now();
        r.set(r.get() + 1);
    })
    .unwrap();

    fiber.detach();
    assert!(!fiber.joinable());
    assert_eq!(fiber.id(), None);
    assert_eq!(alloc.outstanding(), 1);

    run_until_idle();
    assert_eq!(runs.get(), 1);
    assert_eq!(alloc.outstanding(), 0);
}

#[test]
fn moved_handle_keeps_identity() {
    let mut a = Fiber::with_allocator(Counting::new(), || {}).unwrap();
    let id = a.id();
    let mut b = std::mem::take(&mut a);
    assert!(!a.joinable());
    assert_eq!(b.id(), id);
    b.join().unwrap();
}

#[test]
fn identities_are_distinct() {
    let mut fibers: Vec<Fiber> = (0..32)
        .map(|_| Fiber::with_allocator(Counting::new(), || {}).unwrap())
        .collect();
    let mut ids: Vec<_> = fibers.iter().map(|f| f.id().unwrap()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 32);
    for fiber in &mut fibers {
        fiber.join().unwrap();
    }
}

#[test]
fn fibers_spawned_by_fibers() {
    let log = Rc::new(RefCell::new(Vec::new()));
    let l = log.clone();
    let mut parent = Fiber::with_allocator(Counting::new(), move || {
        let mut children: Vec<Fiber> = (0..3)
            .map(|n| {
                let l = l.clone();
                Fiber::with_allocator(Counting::new(), move || l.borrow_mut().push(n)).unwrap()
            })
            .collect();
        for child in &mut children {
            child.join().unwrap();
        }
        l.borrow_mut().push(99);
    })
    .unwrap();
    parent.join().unwrap();
    assert_eq!(*log.borrow(), vec![0, 1, 2, 99]);
}

#[test]
fn ping_pong_through_yields() {
    let turn = Rc::new(Cell::new(0u32));
    let make = |me: u32| {
        let turn = turn.clone();
        Fiber::with_allocator(Counting::new(), move || {
            for _ in 0..5 {
                while turn.get() % 2 != me {
                    this_fiber::yield_now();
                }
                turn.set(turn.get() + 1);
            }
        })
        .unwrap()
    };
    let mut ping = make(0);
    let mut pong = make(1);
    ping.join().unwrap();
    pong.join().unwrap();
    assert_eq!(turn.get(), 10);
}

#[test]
fn pooled_stacks_are_recycled() {
    let pool = PooledFixedSizeStack::new(FixedSizeStack::new(64 * 1024).unwrap(), 4);
    for _ in 0..3 {
        let mut fiber = Fiber::with_allocator(pool.clone(), || {}).unwrap();
        fiber.join().unwrap();
        assert_eq!(pool.idle(), 1);
    }
}

#[test]
fn guarded_stack_runs_deep_recursion() {
    fn depth(n: u64) -> u64 {
        let pad = [n; 16];
        if n == 0 {
            return 0;
        }
        std::hint::black_box(&pad);
        1 + depth(n - 1)
    }

    let result = Rc::new(Cell::new(0));
    let r = result.clone();
    let mut fiber = Builder::new()
        .allocator(rask_fiber::ProtectedFixedSizeStack::new(512 * 1024).unwrap())
        .spawn(move || r.set(depth(1000)))
        .unwrap();
    fiber.join().unwrap();
    assert_eq!(result.get(), 1000);
}

#[test]
fn each_carrier_thread_schedules_its_own_fibers() {
    let threads: Vec<_> = (0..2)
        .map(|t| {
            std::thread::spawn(move || {
                let sum = Rc::new(Cell::new(0));
                let mut fibers: Vec<Fiber> = (1..=4)
                    .map(|n| {
                        let sum = sum.clone();
                        Fiber::with_allocator(Counting::new(), move || {
                            this_fiber::yield_now();
                            sum.set(sum.get() + n * (t + 1));
                        })
                        .unwrap()
                    })
                    .collect();
                for fiber in &mut fibers {
                    fiber.join().unwrap();
                }
                sum.get()
            })
        })
        .collect();
    let sums: Vec<_> = threads.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(sums, vec![10, 20]);
}

#[test]
fn panicking_fiber_is_reported_to_joiner() {
    let alloc = Counting::new();
    let mut fiber = Fiber::with_allocator(alloc.clone(), || panic!("fiber blew up")).unwrap();
    match fiber.join() {
        Err(FiberError::Panicked(msg)) => assert!(msg.contains("fiber blew up")),
        other => panic!("expected Panicked, got {:?}", other),
    }
    assert_eq!(alloc.outstanding(), 0);
}

#[test]
fn live_count_tracks_unfinished_fibers() {
    let before = rask_fiber::live_fibers();
    let mut fiber = Fiber::with_allocator(Counting::new(), || {}).unwrap();
    assert_eq!(rask_fiber::live_fibers(), before + 1);
    fiber.join().unwrap();
    assert_eq!(rask_fiber::live_fibers(), before);
}
