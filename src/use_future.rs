use crate::async_result::{CompletionToken, Initiation};
use crate::error::FutureError;
use crate::executor::{AnyExecutor, Executor, ExecutorFunction, SystemExecutor};
use crate::future::{Future, Promise};
use crate::handler::Handler;
use crate::memory::{self, Allocator, AnyAllocator, StdAllocator};
use crate::signature::{Signature, Values};

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

type Collapsed<S> = <<S as Signature>::Values as Values>::Collapsed;

/// A completion token returning a `Future` of the operation's result.
///
/// A failing error code or a non-null exception pointer fails the future;
/// otherwise the remaining arguments fulfil it: `()` for none, the value
/// itself for one, a tuple for more. The shared state of the future is
/// allocated from `A`.
#[derive(Clone, Copy, Debug, Default)]
pub struct UseFuture<A = StdAllocator> {
    alloc: A,
}

pub const USE_FUTURE: UseFuture = UseFuture { alloc: StdAllocator };

/// Returns a `UseFuture` token allocating through `alloc`.
pub fn use_future_with<A: Allocator>(alloc: A) -> UseFuture<A> {
    UseFuture { alloc: alloc }
}

impl<A: Allocator> UseFuture<A> {
    pub fn allocator(&self) -> &A {
        &self.alloc
    }

    /// Returns a token passing the completion arguments to `f` and
    /// fulfilling the future with what it returns.
    ///
    /// A panic inside `f` fails the future with `FutureError::Panicked`.
    ///
    /// # Examples
    ///
    /// ```
    /// use asyncio::*;
    ///
    /// let fut = post(&SystemExecutor, USE_FUTURE.package(|| 6 * 7));
    /// assert_eq!(fut.get().unwrap(), 42);
    /// ```
    pub fn package<F>(self, f: F) -> PackagedToken<F, A> {
        PackagedToken {
            function: f,
            alloc: self.alloc,
        }
    }
}

fn new_promise<T>(alloc: &AnyAllocator) -> (Promise<T>, Future<T>) {
    match Promise::new_in(alloc.clone()) {
        Ok(pair) => pair,
        Err(err) => memory::oom(err),
    }
}

impl<S, A> CompletionToken<S> for UseFuture<A>
where
    S: Signature,
    A: Allocator,
{
    type Output = Future<Collapsed<S>>;

    fn async_initiate<I, X>(self, initiation: I, args: X) -> Self::Output
    where
        I: Initiation<S, X>,
    {
        let alloc = AnyAllocator::new(self.alloc);
        let (promise, future) = new_promise(&alloc);
        initiation.initiate(
            PromiseHandler::<S> {
                promise: promise,
                alloc: alloc,
            },
            args,
        );
        future
    }
}

/// The handler produced by `UseFuture`.
pub struct PromiseHandler<S: Signature> {
    promise: Promise<Collapsed<S>>,
    alloc: AnyAllocator,
}

impl<S: Signature> Handler<S::Args> for PromiseHandler<S> {
    fn complete(self, args: S::Args) {
        let (leading, values) = S::split(args);
        match leading.into_failure() {
            Some(err) => self.promise.set_failure(err),
            None => self.promise.set_value(values.collapse()),
        };
    }

    fn executor(&self) -> Option<AnyExecutor> {
        Some(AnyExecutor::new(PromiseExecutor {
            promise: self.promise.clone(),
        }))
    }

    fn allocator(&self) -> Option<AnyAllocator> {
        Some(self.alloc.clone())
    }
}

/// A function called with the completion arguments `Args`.
pub trait Packaged<Args>: Send + 'static {
    type Output: Send + 'static;

    fn call(self, args: Args) -> Self::Output;
}

macro_rules! packaged_impl {
    ($($name:ident),*) => {
        impl<F, R, $($name),*> Packaged<($($name,)*)> for F
        where
            F: FnOnce($($name),*) -> R + Send + 'static,
            R: Send + 'static,
        {
            type Output = R;

            #[allow(non_snake_case)]
            fn call(self, args: ($($name,)*)) -> R {
                let ($($name,)*) = args;
                self($($name),*)
            }
        }
    };
}

packaged_impl!();
packaged_impl!(A);
packaged_impl!(A, B);
packaged_impl!(A, B, C);
packaged_impl!(A, B, C, D);
packaged_impl!(A, B, C, D, E);

/// A completion token returned by `UseFuture::package`.
pub struct PackagedToken<F, A = StdAllocator> {
    function: F,
    alloc: A,
}

impl<S, F, A> CompletionToken<S> for PackagedToken<F, A>
where
    S: Signature,
    F: Packaged<S::Args>,
    A: Allocator,
{
    type Output = Future<F::Output>;

    fn async_initiate<I, X>(self, initiation: I, args: X) -> Self::Output
    where
        I: Initiation<S, X>,
    {
        let alloc = AnyAllocator::new(self.alloc);
        let (promise, future) = new_promise(&alloc);
        initiation.initiate(
            PackagedHandler {
                function: self.function,
                promise: promise,
                alloc: alloc,
            },
            args,
        );
        future
    }
}

/// The handler produced by `PackagedToken`.
pub struct PackagedHandler<F, R> {
    function: F,
    promise: Promise<R>,
    alloc: AnyAllocator,
}

impl<F, R, Args> Handler<Args> for PackagedHandler<F, R>
where
    F: Packaged<Args, Output = R>,
    R: Send + 'static,
    Args: Send + 'static,
{
    fn complete(self, args: Args) {
        let PackagedHandler { function, promise, .. } = self;
        match panic::catch_unwind(AssertUnwindSafe(move || function.call(args))) {
            Ok(value) => promise.set_value(value),
            Err(payload) => promise.set_failure(FutureError::from_panic(payload)),
        };
    }

    fn executor(&self) -> Option<AnyExecutor> {
        Some(AnyExecutor::new(PromiseExecutor {
            promise: self.promise.clone(),
        }))
    }

    fn allocator(&self) -> Option<AnyAllocator> {
        Some(self.alloc.clone())
    }
}

/// The associated executor of the handlers created by `UseFuture`.
///
/// Functions are run inside a `PromiseInvoker`, so a panic fails the
/// promise instead of unwinding into the caller. `post` and `defer` run
/// them on the `SystemExecutor`, wrapped in storage from the promise's
/// allocator; if that allocation fails, the promise fails with
/// `FutureError::Alloc`.
pub struct PromiseExecutor<T> {
    promise: Promise<T>,
}

impl<T> PromiseExecutor<T> {
    pub fn new(promise: Promise<T>) -> PromiseExecutor<T> {
        PromiseExecutor { promise: promise }
    }
}

impl<T> Clone for PromiseExecutor<T> {
    fn clone(&self) -> PromiseExecutor<T> {
        PromiseExecutor {
            promise: self.promise.clone(),
        }
    }
}

impl<T> fmt::Debug for PromiseExecutor<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PromiseExecutor({:?})", self.promise)
    }
}

impl<T: Send + 'static> Executor for PromiseExecutor<T> {
    fn dispatch(&self, f: ExecutorFunction) {
        PromiseInvoker::new(self.promise.clone(), f).complete(())
    }

    fn post(&self, f: ExecutorFunction) {
        let invoker = PromiseInvoker::new(self.promise.clone(), f);
        match ExecutorFunction::new_in(move || invoker.complete(()), self.promise.allocator()) {
            Ok(f) => SystemExecutor.post(f),
            Err(err) => {
                self.promise.set_failure(err.into());
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn same_executor(&self, other: &dyn Executor) -> bool {
        match other.as_any().downcast_ref::<PromiseExecutor<T>>() {
            Some(other) => self.promise.same_state(&other.promise),
            None => false,
        }
    }
}

/// Runs a function on behalf of a promise, failing the promise if the
/// function panics.
pub struct PromiseInvoker<T> {
    promise: Promise<T>,
    function: ExecutorFunction,
}

impl<T> PromiseInvoker<T> {
    pub fn new(promise: Promise<T>, function: ExecutorFunction) -> PromiseInvoker<T> {
        PromiseInvoker {
            promise: promise,
            function: function,
        }
    }
}

impl<T: Send + 'static> Handler<()> for PromiseInvoker<T> {
    fn complete(self, _: ()) {
        let PromiseInvoker { promise, function } = self;
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || function.call())) {
            promise.set_failure(FutureError::from_panic(payload));
        }
    }

    fn executor(&self) -> Option<AnyExecutor> {
        Some(AnyExecutor::new(PromiseExecutor {
            promise: self.promise.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::async_result::async_initiate;
    use crate::async_result::tests::{Immediate, Pending};
    use crate::error::{ErrorCode, ExceptionPtr, SystemError, CANCELED, READY};
    use crate::signature::{EcSig, ExSig, Sig};

    use std::sync::{Arc, Mutex};

    #[test]
    fn test_plain_signatures() {
        let f: Future<()> = async_initiate(Immediate::<Sig<()>>(()), USE_FUTURE, ());
        assert_eq!(f.get().unwrap(), ());
        let f = async_initiate(Immediate::<Sig<(i32,)>>((1,)), USE_FUTURE, ());
        assert_eq!(f.get().unwrap(), 1);
        let f = async_initiate(Immediate::<Sig<(i32, &'static str)>>((2, "b")), USE_FUTURE, ());
        assert_eq!(f.get().unwrap(), (2, "b"));
    }

    #[test]
    fn test_error_code_signatures() {
        let f = async_initiate(Immediate::<EcSig<()>>((READY,)), USE_FUTURE, ());
        assert_eq!(f.get().unwrap(), ());
        let f = async_initiate(Immediate::<EcSig<(usize,)>>((READY, 5)), USE_FUTURE, ());
        assert_eq!(f.get().unwrap(), 5);
        let f = async_initiate(Immediate::<EcSig<(usize, u8)>>((READY, 5, 6)), USE_FUTURE, ());
        assert_eq!(f.get().unwrap(), (5, 6));

        let f = async_initiate(Immediate::<EcSig<(usize,)>>((CANCELED, 5)), USE_FUTURE, ());
        match f.get() {
            Err(FutureError::System(err)) => assert_eq!(err, SystemError(CANCELED)),
            res => panic!("{:?}", res),
        }
    }

    #[test]
    fn test_exception_signatures() {
        let f = async_initiate(Immediate::<ExSig<()>>((ExceptionPtr::null(),)), USE_FUTURE, ());
        assert_eq!(f.get().unwrap(), ());
        let f = async_initiate(Immediate::<ExSig<(u8,)>>((ExceptionPtr::null(), 9)), USE_FUTURE, ());
        assert_eq!(f.get().unwrap(), 9);
        let f = async_initiate(
            Immediate::<ExSig<(u8, u8)>>((ExceptionPtr::null(), 1, 2)),
            USE_FUTURE,
            (),
        );
        assert_eq!(f.get().unwrap(), (1, 2));

        let ex = ExceptionPtr::new(SystemError(CANCELED));
        let f = async_initiate(Immediate::<ExSig<(u8,)>>((ex.clone(), 9)), USE_FUTURE, ());
        match f.get() {
            Err(FutureError::Exception(got)) => assert_eq!(got, ex),
            res => panic!("{:?}", res),
        }
    }

    #[test]
    fn test_dropped_handler_breaks_promise() {
        let slot = Arc::new(Mutex::new(None));
        let f = async_initiate(Pending::<EcSig<(usize,)>> { slot: slot.clone() }, USE_FUTURE, ());
        assert!(!f.is_ready());
        slot.lock().unwrap().take();
        match f.get() {
            Err(FutureError::BrokenPromise) => {}
            res => panic!("{:?}", res),
        }
    }

    #[test]
    fn test_completed_later_on_another_thread() {
        use std::thread;

        let slot = Arc::new(Mutex::new(None));
        let f = async_initiate(Pending::<EcSig<(usize,)>> { slot: slot.clone() }, USE_FUTURE, ());
        let complete = slot.lock().unwrap().take().unwrap();
        thread::spawn(move || complete((ErrorCode::default(), 64)));
        assert_eq!(futures::executor::block_on(f).unwrap(), 64);
    }

    #[test]
    fn test_use_future_with_allocator() {
        use crate::recycling_allocator::RecyclingAllocator;
        use crate::thread_info::{DefaultTag, ThreadInfo};
        use std::thread;

        thread::spawn(|| {
            let token = use_future_with(RecyclingAllocator::<DefaultTag>::new());
            for i in 0..3 {
                let f = async_initiate(Immediate::<Sig<(i32,)>>((i,)), token, ());
                assert_eq!(f.get().unwrap(), i);
            }
            ThreadInfo::with_current(|ti| {
                let ti = ti.unwrap();
                assert_eq!(ti.stats().heap_allocations, 1);
                assert_eq!(ti.stats().reused, 2);
            });
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_promise_handler_affinity() {
        use crate::memory::StdAllocator;

        struct Inspect(Arc<Mutex<Option<(AnyExecutor, AnyAllocator)>>>);

        impl Initiation<Sig<()>> for Inspect {
            fn initiate<H>(self, handler: H, _: ())
            where
                H: Handler<()>,
            {
                let ex = handler.executor().unwrap();
                let alloc = handler.allocator().unwrap();
                *self.0.lock().unwrap() = Some((ex, alloc));
                handler.complete(());
            }
        }

        let seen = Arc::new(Mutex::new(None));
        let f = async_initiate(Inspect(seen.clone()), USE_FUTURE, ());
        f.get().unwrap();
        let (ex, alloc) = seen.lock().unwrap().take().unwrap();
        assert!(ex.downcast_ref::<PromiseExecutor<()>>().is_some());
        assert_eq!(alloc, AnyAllocator::new(StdAllocator));
    }

    #[test]
    fn test_package() {
        let f = async_initiate(
            Immediate::<EcSig<(usize,)>>((CANCELED, 3)),
            USE_FUTURE.package(|ec: ErrorCode, n: usize| format!("{} {}", ec.is_err(), n)),
            (),
        );
        assert_eq!(f.get().unwrap(), "true 3");
    }

    #[test]
    fn test_package_panic() {
        let f = async_initiate(
            Immediate::<Sig<(i32,)>>((0,)),
            USE_FUTURE.package(|n: i32| -> i32 {
                if n == 0 {
                    panic!("division by zero");
                }
                10 / n
            }),
            (),
        );
        match f.get() {
            Err(FutureError::Panicked(msg)) => assert_eq!(msg, "division by zero"),
            res => panic!("{:?}", res),
        }
    }

    #[test]
    fn test_promise_executor_captures_panic() {
        let (promise, future) = Promise::<u8>::new();
        let ex = PromiseExecutor::new(promise.clone());
        ex.dispatch(ExecutorFunction::new(|| panic!("in dispatch")).unwrap());
        match future.get() {
            Err(FutureError::Panicked(msg)) => assert_eq!(msg, "in dispatch"),
            res => panic!("{:?}", res),
        }

        let (promise, future) = Promise::<u8>::new();
        let ex = PromiseExecutor::new(promise.clone());
        let p = promise.clone();
        ex.post(ExecutorFunction::new(move || { p.set_value(1); }).unwrap());
        drop(promise);
        assert_eq!(future.get().unwrap(), 1);
    }

    #[test]
    fn test_promise_executor_post_allocation_failure() {
        use crate::memory::tests::Counting;

        // room for the shared state only
        let alloc = Counting::with_limit(1);
        let (promise, future) = Promise::<u8>::new_in(AnyAllocator::new(alloc.clone())).unwrap();
        let ex = PromiseExecutor::new(promise.clone());
        let p = promise.clone();
        ex.post(ExecutorFunction::new(move || { p.set_value(1); }).unwrap());
        assert!(promise.is_resolved());
        match future.get() {
            Err(FutureError::Alloc(err)) => assert!(err.size > 0),
            res => panic!("{:?}", res),
        }
        drop((ex, promise));
        assert_eq!(alloc.allocations(), 1);
        assert_eq!(alloc.live(), 0);
    }

    #[test]
    fn test_promise_executor_post_uses_promise_allocator() {
        use crate::memory::tests::Counting;

        let alloc = Counting::new();
        let (promise, future) = Promise::<u8>::new_in(AnyAllocator::new(alloc.clone())).unwrap();
        let ex = PromiseExecutor::new(promise.clone());
        let p = promise.clone();
        ex.post(ExecutorFunction::new(move || { p.set_value(2); }).unwrap());
        drop((ex, promise));
        assert_eq!(future.get().unwrap(), 2);
        assert_eq!(alloc.allocations(), 2);
    }

    #[test]
    fn test_promise_executor_eq() {
        let (promise, _future) = Promise::<u8>::new();
        let (other, _other_future) = Promise::<u8>::new();
        let a = AnyExecutor::new(PromiseExecutor::new(promise.clone()));
        assert_eq!(a, AnyExecutor::new(PromiseExecutor::new(promise)));
        assert_ne!(a, AnyExecutor::new(PromiseExecutor::new(other)));
        assert_ne!(a, AnyExecutor::default());
    }
}
