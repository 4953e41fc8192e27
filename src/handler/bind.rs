use crate::executor::{AnyExecutor, Executor};
use crate::handler::Handler;
use crate::memory::{Allocator, AnyAllocator};

/// A handler whose associated executor is replaced.
pub struct ExecutorBinder<H> {
    handler: H,
    ex: AnyExecutor,
}

impl<H> ExecutorBinder<H> {
    pub fn get_ref(&self) -> &H {
        &self.handler
    }

    pub fn into_inner(self) -> H {
        self.handler
    }
}

impl<H, Args> Handler<Args> for ExecutorBinder<H>
where
    H: Handler<Args>,
{
    fn complete(self, args: Args) {
        self.handler.complete(args)
    }

    fn executor(&self) -> Option<AnyExecutor> {
        Some(self.ex.clone())
    }

    fn allocator(&self) -> Option<AnyAllocator> {
        self.handler.allocator()
    }

    fn is_continuation(&self) -> bool {
        self.handler.is_continuation()
    }
}

/// Associates `ex` with `handler`.
pub fn bind_executor<E, H>(ex: E, handler: H) -> ExecutorBinder<H>
where
    E: Executor,
{
    ExecutorBinder {
        handler: handler,
        ex: AnyExecutor::new(ex),
    }
}

/// A handler whose associated allocator is replaced.
pub struct AllocatorBinder<H> {
    handler: H,
    alloc: AnyAllocator,
}

impl<H> AllocatorBinder<H> {
    pub fn get_ref(&self) -> &H {
        &self.handler
    }

    pub fn into_inner(self) -> H {
        self.handler
    }
}

impl<H, Args> Handler<Args> for AllocatorBinder<H>
where
    H: Handler<Args>,
{
    fn complete(self, args: Args) {
        self.handler.complete(args)
    }

    fn executor(&self) -> Option<AnyExecutor> {
        self.handler.executor()
    }

    fn allocator(&self) -> Option<AnyAllocator> {
        Some(self.alloc.clone())
    }

    fn is_continuation(&self) -> bool {
        self.handler.is_continuation()
    }
}

/// Associates `alloc` with `handler`.
pub fn bind_allocator<A, H>(alloc: A, handler: H) -> AllocatorBinder<H>
where
    A: Allocator,
{
    AllocatorBinder {
        handler: handler,
        alloc: AnyAllocator::new(alloc),
    }
}

#[test]
fn test_bind_executor() {
    use crate::executor::QueueExecutor;
    use crate::handler::{get_associated_allocator, get_associated_executor};
    use std::sync::mpsc;

    let q = QueueExecutor::default();
    let (tx, rx) = mpsc::channel();
    let h = bind_executor(q.clone(), move |n: i32| tx.send(n).unwrap());
    assert_eq!(get_associated_executor::<_, (i32,)>(&h, AnyExecutor::default()), AnyExecutor::new(q));
    assert_eq!(get_associated_allocator::<_, (i32,)>(&h, AnyAllocator::default()), AnyAllocator::default());
    h.complete((7,));
    assert_eq!(rx.recv().unwrap(), 7);
}

#[test]
fn test_bind_allocator_keeps_inner_executor() {
    use crate::handler::tests::Probe;
    use crate::memory::StdAllocator;
    use crate::handler::{get_associated_allocator, get_associated_executor, is_continuation};

    let (probe, rx) = Probe::<(i32,)>::new();
    let ex = probe.ex.clone();
    let h = bind_allocator(StdAllocator, probe);
    assert_eq!(get_associated_executor::<_, (i32,)>(&h, AnyExecutor::default()), ex);
    assert_eq!(
        get_associated_allocator::<_, (i32,)>(&h, AnyAllocator::default()),
        AnyAllocator::new(StdAllocator)
    );
    assert!(is_continuation::<_, (i32,)>(&h));
    h.complete((3,));
    assert_eq!(rx.recv().unwrap(), (3,));
}
