use crate::error::AllocError;
use crate::memory::Allocator;
use crate::recycling_allocator::RecyclingAllocator;
use crate::thread_info::ExecutorFunctionTag;

use std::alloc::Layout;
use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;

struct Header {
    complete: unsafe fn(NonNull<Header>, bool),
}

#[repr(C)]
struct FunctionImpl<F, A> {
    header: Header,
    function: F,
    alloc: A,
}

/// A type erased `FnOnce()` submitted to an executor.
///
/// The storage comes from the executor-function category of the calling
/// thread's recycling cache, or from the allocator given to `new_in`, and is
/// released before the function runs.
pub struct ExecutorFunction {
    ptr: NonNull<Header>,
}

unsafe impl Send for ExecutorFunction {}

impl ExecutorFunction {
    pub fn new<F>(function: F) -> Result<ExecutorFunction, AllocError>
    where
        F: FnOnce() + Send + 'static,
    {
        ExecutorFunction::new_in(function, RecyclingAllocator::<ExecutorFunctionTag>::new())
    }

    /// Wraps `function` in storage obtained from `alloc`.
    pub fn new_in<F, A>(function: F, alloc: A) -> Result<ExecutorFunction, AllocError>
    where
        F: FnOnce() + Send + 'static,
        A: Allocator,
    {
        let layout = Layout::new::<FunctionImpl<F, A>>();
        let ptr = alloc.allocate(layout)?.cast::<FunctionImpl<F, A>>();
        unsafe {
            ptr::write(
                ptr.as_ptr(),
                FunctionImpl {
                    header: Header {
                        complete: complete::<F, A>,
                    },
                    function: function,
                    alloc: alloc,
                },
            );
        }
        Ok(ExecutorFunction { ptr: ptr.cast() })
    }

    /// Runs the function.
    pub fn call(self) {
        let ptr = self.ptr;
        mem::forget(self);
        unsafe { ((*ptr.as_ptr()).complete)(ptr, true) }
    }
}

unsafe fn complete<F: FnOnce(), A: Allocator>(base: NonNull<Header>, call: bool) {
    let ptr = base.cast::<FunctionImpl<F, A>>();
    let function = ptr::read(&(*ptr.as_ptr()).function);
    let alloc = ptr::read(&(*ptr.as_ptr()).alloc);
    alloc.deallocate(ptr.cast(), Layout::new::<FunctionImpl<F, A>>());
    drop(alloc);
    if call {
        function()
    }
}

impl Drop for ExecutorFunction {
    fn drop(&mut self) {
        unsafe { ((*self.ptr.as_ptr()).complete)(self.ptr, false) }
    }
}

impl fmt::Debug for ExecutorFunction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ExecutorFunction({:p})", self.ptr)
    }
}

/// An execution context on which handlers are run.
pub trait Executor: Send + Sync + 'static {
    /// Runs the function now if allowed, otherwise as `post`.
    fn dispatch(&self, f: ExecutorFunction);

    fn post(&self, f: ExecutorFunction);

    fn defer(&self, f: ExecutorFunction) {
        self.post(f)
    }

    fn on_work_started(&self) {}

    fn on_work_finished(&self) {}

    #[doc(hidden)]
    fn as_any(&self) -> &dyn Any;

    fn same_executor(&self, other: &dyn Executor) -> bool;
}

/// A cloneable, comparable handle to some `Executor`.
#[derive(Clone)]
pub struct AnyExecutor(Arc<dyn Executor>);

impl AnyExecutor {
    pub fn new<E: Executor>(ex: E) -> AnyExecutor {
        AnyExecutor(Arc::new(ex))
    }

    pub fn downcast_ref<E: Executor>(&self) -> Option<&E> {
        self.0.as_any().downcast_ref::<E>()
    }
}

impl Default for AnyExecutor {
    fn default() -> AnyExecutor {
        AnyExecutor::new(SystemExecutor)
    }
}

impl Executor for AnyExecutor {
    fn dispatch(&self, f: ExecutorFunction) {
        self.0.dispatch(f)
    }

    fn post(&self, f: ExecutorFunction) {
        self.0.post(f)
    }

    fn defer(&self, f: ExecutorFunction) {
        self.0.defer(f)
    }

    fn on_work_started(&self) {
        self.0.on_work_started()
    }

    fn on_work_finished(&self) {
        self.0.on_work_finished()
    }

    fn as_any(&self) -> &dyn Any {
        self.0.as_any()
    }

    fn same_executor(&self, other: &dyn Executor) -> bool {
        self.0.same_executor(other)
    }
}

impl PartialEq for AnyExecutor {
    fn eq(&self, other: &AnyExecutor) -> bool {
        self.0.same_executor(&*other.0)
    }
}

impl fmt::Debug for AnyExecutor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "AnyExecutor({:p})", Arc::as_ptr(&self.0) as *const u8)
    }
}

struct SystemContext {
    queue: Mutex<VecDeque<ExecutorFunction>>,
    condvar: Condvar,
    threads: AtomicUsize,
}

lazy_static! {
    static ref SYSTEM_CONTEXT: Arc<SystemContext> = SystemContext::start();
}

impl SystemContext {
    fn start() -> Arc<SystemContext> {
        let ctx = Arc::new(SystemContext {
            queue: Mutex::default(),
            condvar: Condvar::new(),
            threads: AtomicUsize::new(0),
        });
        let want = thread::available_parallelism().map(|n| n.get()).unwrap_or(1) * 2;
        for i in 0..want {
            let worker = ctx.clone();
            let spawned = thread::Builder::new()
                .name(format!("asyncio-system-{}", i))
                .spawn(move || worker.run());
            match spawned {
                Ok(_) => {
                    ctx.threads.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    tracing::warn!(error = %err, "failed to spawn system executor thread");
                    break;
                }
            }
        }
        tracing::debug!(threads = ctx.threads.load(Ordering::Relaxed), "system executor started");
        ctx
    }

    fn run(&self) {
        loop {
            let f = {
                let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
                loop {
                    if let Some(f) = queue.pop_front() {
                        break f;
                    }
                    queue = self
                        .condvar
                        .wait(queue)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            };
            if panic::catch_unwind(AssertUnwindSafe(|| f.call())).is_err() {
                tracing::error!("function posted to the system executor panicked");
            }
        }
    }

    fn push(&self, f: ExecutorFunction) {
        if self.threads.load(Ordering::Relaxed) == 0 {
            return f.call();
        }
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(f);
        self.condvar.notify_one();
    }
}

/// Runs functions on a process-wide pool of threads.
///
/// The pool is started the first time work is posted.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SystemExecutor;

impl Executor for SystemExecutor {
    fn dispatch(&self, f: ExecutorFunction) {
        f.call()
    }

    fn post(&self, f: ExecutorFunction) {
        SYSTEM_CONTEXT.push(f)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn same_executor(&self, other: &dyn Executor) -> bool {
        other.as_any().is::<SystemExecutor>()
    }
}

/// Queues functions until `run` is called. Used by tests in this crate.
#[cfg(test)]
#[derive(Clone, Default)]
pub(crate) struct QueueExecutor {
    queue: Arc<Mutex<VecDeque<ExecutorFunction>>>,
}

#[cfg(test)]
impl QueueExecutor {
    pub fn run(&self) -> usize {
        let mut n = 0;
        loop {
            let f = self.queue.lock().unwrap().pop_front();
            match f {
                Some(f) => f.call(),
                None => return n,
            }
            n += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

#[cfg(test)]
impl Executor for QueueExecutor {
    fn dispatch(&self, f: ExecutorFunction) {
        self.post(f)
    }

    fn post(&self, f: ExecutorFunction) {
        self.queue.lock().unwrap().push_back(f)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn same_executor(&self, other: &dyn Executor) -> bool {
        match other.as_any().downcast_ref::<QueueExecutor>() {
            Some(other) => Arc::ptr_eq(&self.queue, &other.queue),
            None => false,
        }
    }
}

#[test]
fn test_executor_function_call() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    let f = ExecutorFunction::new(move || {
        c.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 0);
    f.call();
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn test_executor_function_drop_without_call() {
    let data = Arc::new(());
    let d = data.clone();
    let f = ExecutorFunction::new(move || {
        let _ = &d;
        panic!("must not run");
    })
    .unwrap();
    assert_eq!(Arc::strong_count(&data), 2);
    drop(f);
    assert_eq!(Arc::strong_count(&data), 1);
}

#[test]
fn test_executor_function_recycles_storage() {
    use crate::thread_info::ThreadInfo;

    thread::spawn(|| {
        for i in 0..10 {
            let v = [i as u64; 4];
            ExecutorFunction::new(move || assert_eq!(v[0], i)).unwrap().call();
        }
        ThreadInfo::with_current(|ti| {
            let ti = ti.unwrap();
            assert_eq!(ti.stats().heap_allocations, 1);
            assert_eq!(ti.stats().reused, 9);
            assert_eq!(ti.cached::<ExecutorFunctionTag>(), 1);
        });
    })
    .join()
    .unwrap();
}

#[test]
fn test_executor_function_new_in() {
    use crate::memory::tests::Counting;

    let alloc = Counting::new();
    let (tx, rx) = std::sync::mpsc::channel();
    let f = ExecutorFunction::new_in(move || tx.send(()).unwrap(), alloc.clone()).unwrap();
    assert_eq!(alloc.live(), 1);
    f.call();
    rx.try_recv().unwrap();
    assert_eq!(alloc.live(), 0);

    drop(ExecutorFunction::new_in(|| {}, alloc.clone()).unwrap());
    assert_eq!(alloc.allocations(), 2);
    assert_eq!(alloc.live(), 0);

    let limited = Counting::with_limit(0);
    assert!(ExecutorFunction::new_in(|| {}, limited.clone()).is_err());
    assert_eq!(limited.allocations(), 0);
}

#[test]
fn test_system_executor_post() {
    let (tx, rx) = std::sync::mpsc::channel();
    let ex = AnyExecutor::new(SystemExecutor);
    for i in 0..16 {
        let tx = tx.clone();
        ex.post(ExecutorFunction::new(move || tx.send(i).unwrap()).unwrap());
    }
    let mut got: Vec<i32> = (0..16).map(|_| rx.recv().unwrap()).collect();
    got.sort();
    assert_eq!(got, (0..16).collect::<Vec<_>>());
}

#[test]
fn test_system_executor_dispatch_is_inline() {
    let id = thread::current().id();
    let (tx, rx) = std::sync::mpsc::channel();
    SystemExecutor.dispatch(ExecutorFunction::new(move || tx.send(thread::current().id()).unwrap()).unwrap());
    assert_eq!(rx.try_recv().unwrap(), id);
}

#[test]
fn test_any_executor_eq() {
    let q1 = QueueExecutor::default();
    let q2 = QueueExecutor::default();
    assert_eq!(AnyExecutor::new(q1.clone()), AnyExecutor::new(q1.clone()));
    assert_ne!(AnyExecutor::new(q1), AnyExecutor::new(q2));
    assert_eq!(AnyExecutor::default(), AnyExecutor::new(SystemExecutor));
}
