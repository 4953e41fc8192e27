use crate::error::{AllocError, FutureError};
use crate::memory::{self, Allocator, AnyAllocator};

use std::alloc::Layout;
use std::fmt;
use std::future;
use std::mem;
use std::pin::Pin;
use std::ptr::{self, NonNull};
use std::sync::atomic::{self, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

enum State<T> {
    Pending(Option<Waker>),
    Ready(Result<T, FutureError>),
    Taken,
}

struct Shared<T> {
    refs: AtomicUsize,
    promises: AtomicUsize,
    state: Mutex<State<T>>,
    condvar: Condvar,
    alloc: AnyAllocator,
}

impl<T> Shared<T> {
    fn new_in(alloc: AnyAllocator) -> Result<NonNull<Shared<T>>, AllocError> {
        let ptr = alloc.allocate(Layout::new::<Shared<T>>())?.cast::<Shared<T>>();
        unsafe {
            ptr::write(
                ptr.as_ptr(),
                Shared {
                    refs: AtomicUsize::new(2),
                    promises: AtomicUsize::new(1),
                    state: Mutex::new(State::Pending(None)),
                    condvar: Condvar::new(),
                    alloc: alloc,
                },
            );
        }
        Ok(ptr)
    }

    unsafe fn release(ptr: NonNull<Shared<T>>) {
        if (*ptr.as_ptr()).refs.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }
        atomic::fence(Ordering::Acquire);
        let shared = ptr::read(ptr.as_ptr());
        let alloc = shared.alloc.clone();
        drop(shared);
        alloc.deallocate(ptr.cast(), Layout::new::<Shared<T>>());
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resolve(&self, res: Result<T, FutureError>) -> bool {
        let mut state = self.lock();
        let waker = match *state {
            State::Pending(ref mut waker) => waker.take(),
            _ => return false,
        };
        *state = State::Ready(res);
        drop(state);
        self.condvar.notify_all();
        if let Some(waker) = waker {
            waker.wake();
        }
        true
    }
}

/// The writing side of a one-shot result.
///
/// Clones share the same result; the first `set_value` or `set_failure`
/// wins. If the last promise is dropped before either is called, the future
/// reports `FutureError::BrokenPromise`.
pub struct Promise<T> {
    shared: NonNull<Shared<T>>,
}

unsafe impl<T: Send> Send for Promise<T> {}

unsafe impl<T: Send> Sync for Promise<T> {}

impl<T> Promise<T> {
    /// Creates a promise and its future on the global heap.
    pub fn new() -> (Promise<T>, Future<T>) {
        match Promise::new_in(AnyAllocator::default()) {
            Ok(pair) => pair,
            Err(err) => memory::oom(err),
        }
    }

    /// Creates a promise and its future, allocating the shared state from
    /// `alloc`.
    pub fn new_in(alloc: AnyAllocator) -> Result<(Promise<T>, Future<T>), AllocError> {
        let shared = Shared::new_in(alloc)?;
        Ok((Promise { shared: shared }, Future { shared: shared }))
    }

    fn shared(&self) -> &Shared<T> {
        unsafe { self.shared.as_ref() }
    }

    /// Fulfils the promise. Returns `false` if it was already resolved.
    pub fn set_value(&self, value: T) -> bool {
        self.shared().resolve(Ok(value))
    }

    /// Fails the promise. Returns `false` if it was already resolved.
    pub fn set_failure(&self, err: FutureError) -> bool {
        self.shared().resolve(Err(err))
    }

    pub fn is_resolved(&self) -> bool {
        match *self.shared().lock() {
            State::Pending(_) => false,
            _ => true,
        }
    }

    /// The allocator holding the shared state.
    pub fn allocator(&self) -> AnyAllocator {
        self.shared().alloc.clone()
    }

    pub(crate) fn same_state(&self, other: &Promise<T>) -> bool {
        self.shared == other.shared
    }
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Promise<T> {
        let shared = self.shared();
        shared.promises.fetch_add(1, Ordering::Relaxed);
        shared.refs.fetch_add(1, Ordering::Relaxed);
        Promise { shared: self.shared }
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if self.shared().promises.fetch_sub(1, Ordering::AcqRel) == 1
            && self.shared().resolve(Err(FutureError::BrokenPromise))
        {
            tracing::debug!("promise dropped without a result");
        }
        unsafe { Shared::release(self.shared) }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Promise({:p})", self.shared)
    }
}

/// The reading side of a one-shot result.
///
/// The result can be taken once, either by `get` or by awaiting the future.
pub struct Future<T> {
    shared: NonNull<Shared<T>>,
}

unsafe impl<T: Send> Send for Future<T> {}

unsafe impl<T: Send> Sync for Future<T> {}

impl<T> Future<T> {
    fn shared(&self) -> &Shared<T> {
        unsafe { self.shared.as_ref() }
    }

    /// Returns `true` if the result is available.
    pub fn is_ready(&self) -> bool {
        match *self.shared().lock() {
            State::Pending(_) => false,
            _ => true,
        }
    }

    /// Blocks the current thread until the result is available.
    pub fn wait(&self) {
        let shared = self.shared();
        let mut state = shared.lock();
        while let State::Pending(_) = *state {
            state = shared.condvar.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Blocks until the result is available or `timeout` elapses. Returns
    /// `true` if the result is available.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let shared = self.shared();
        let state = shared.lock();
        let (state, _) = shared
            .condvar
            .wait_timeout_while(state, timeout, |state| match *state {
                State::Pending(_) => true,
                _ => false,
            })
            .unwrap_or_else(PoisonError::into_inner);
        match *state {
            State::Pending(_) => false,
            _ => true,
        }
    }

    /// Blocks until the result is available and returns it.
    pub fn get(self) -> Result<T, FutureError> {
        self.wait();
        let mut state = self.shared().lock();
        match mem::replace(&mut *state, State::Taken) {
            State::Ready(res) => res,
            _ => panic!("`Future` result already taken"),
        }
    }

    /// Returns the result if it is available, without blocking.
    ///
    /// # Panics
    ///
    /// Panics if the result was already taken by polling the future.
    pub fn try_get(&mut self) -> Option<Result<T, FutureError>> {
        let mut state = self.shared().lock();
        match mem::replace(&mut *state, State::Taken) {
            State::Ready(res) => Some(res),
            State::Pending(waker) => {
                *state = State::Pending(waker);
                None
            }
            State::Taken => panic!("`Future` result already taken"),
        }
    }
}

impl<T> future::Future for Future<T> {
    type Output = Result<T, FutureError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let mut state = self.shared().lock();
        match mem::replace(&mut *state, State::Taken) {
            State::Ready(res) => Poll::Ready(res),
            State::Pending(waker) => {
                let waker = match waker {
                    Some(waker) if waker.will_wake(cx.waker()) => waker,
                    _ => cx.waker().clone(),
                };
                *state = State::Pending(Some(waker));
                Poll::Pending
            }
            State::Taken => panic!("`Future` polled after completion"),
        }
    }
}

impl<T> Drop for Future<T> {
    fn drop(&mut self) {
        unsafe { Shared::release(self.shared) }
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Future({:p})", self.shared)
    }
}

#[test]
fn test_set_value() {
    let (promise, future) = Promise::new();
    assert!(!future.is_ready());
    assert!(promise.set_value(10));
    assert!(!promise.set_value(20));
    assert!(!promise.set_failure(FutureError::BrokenPromise));
    assert!(future.is_ready());
    assert_eq!(future.get().unwrap(), 10);
}

#[test]
fn test_broken_promise() {
    let (promise, future) = Promise::<i32>::new();
    let other = promise.clone();
    drop(promise);
    assert!(!future.is_ready());
    drop(other);
    match future.get() {
        Err(FutureError::BrokenPromise) => {}
        res => panic!("{:?}", res),
    }
}

#[test]
fn test_resolved_promise_drop_is_not_broken() {
    let (promise, future) = Promise::new();
    promise.set_value("done");
    drop(promise);
    assert_eq!(future.get().unwrap(), "done");
}

#[test]
fn test_get_blocks_until_resolved() {
    use std::thread;

    let (promise, future) = Promise::new();
    let thrd = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        promise.set_value(String::from("late"));
    });
    assert!(!future.wait_timeout(Duration::from_millis(1)));
    assert_eq!(future.get().unwrap(), "late");
    thrd.join().unwrap();
}

#[test]
fn test_try_get() {
    let (promise, mut future) = Promise::<()>::new();
    assert!(future.try_get().is_none());
    promise.set_failure(FutureError::Panicked("x".to_owned()));
    match future.try_get() {
        Some(Err(FutureError::Panicked(msg))) => assert_eq!(msg, "x"),
        res => panic!("{:?}", res),
    }
}

#[test]
fn test_await() {
    use std::thread;

    let (promise, future) = Promise::new();
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(10));
        promise.set_value(7u64);
    });
    assert_eq!(futures::executor::block_on(future).unwrap(), 7);
}

#[test]
fn test_shared_state_freed() {
    use std::sync::Arc;

    let data = Arc::new(());
    let (promise, future) = Promise::new();
    promise.set_value(data.clone());
    drop(future);
    assert_eq!(Arc::strong_count(&data), 2);
    drop(promise);
    assert_eq!(Arc::strong_count(&data), 1);
}

#[test]
fn test_allocated_from_recycling_cache() {
    use crate::recycling_allocator::RecyclingAllocator;
    use crate::thread_info::{DefaultTag, ThreadInfo};
    use std::thread;

    thread::spawn(|| {
        for i in 0..4 {
            let alloc = AnyAllocator::new(RecyclingAllocator::<DefaultTag>::new());
            let (promise, future) = Promise::new_in(alloc).unwrap();
            promise.set_value(i);
            assert_eq!(future.get().unwrap(), i);
        }
        ThreadInfo::with_current(|ti| {
            let ti = ti.unwrap();
            assert_eq!(ti.stats().heap_allocations, 1);
            assert_eq!(ti.stats().reused, 3);
        });
    })
    .join()
    .unwrap();
}
