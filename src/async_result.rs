use crate::bind_handler::{Binder, MoveBinder};
use crate::error::{ErrorCode, ExceptionPtr};
use crate::executor::AnyExecutor;
use crate::handler::{AllocatorBinder, ArcHandler, ExecutorBinder, Handler};
use crate::memory::AnyAllocator;
use crate::signature::{EcSig, ExSig, Sig, Signature};

/// The operation-specific part of an asynchronous operation.
///
/// `initiate` starts the work and keeps `handler` until the operation
/// completes, then completes it exactly once with the arguments of `S`.
/// Dropping the handler instead (on cancellation) is allowed.
pub trait Initiation<S: Signature, A = ()> {
    fn initiate<H>(self, handler: H, args: A)
    where
        H: Handler<S::Args>;
}

/// Selects how an asynchronous operation with signature `S` completes.
///
/// The token turns itself into a handler for `S`, passes it to the
/// initiation, and decides what the initiating function returns.
pub trait CompletionToken<S: Signature>: Sized {
    /// The value returned synchronously to the caller of the operation.
    type Output;

    fn async_initiate<I, A>(self, initiation: I, args: A) -> Self::Output
    where
        I: Initiation<S, A>;
}

/// Starts an asynchronous operation, completing it as `token` describes.
///
/// # Examples
///
/// ```
/// use asyncio::*;
///
/// struct Ready(usize);
///
/// impl Initiation<EcSig<(usize,)>> for Ready {
///     fn initiate<H>(self, handler: H, _: ())
///     where
///         H: Handler<(ErrorCode, usize)>,
///     {
///         handler.complete((ErrorCode::default(), self.0))
///     }
/// }
///
/// fn async_ready<T>(len: usize, token: T) -> T::Output
/// where
///     T: CompletionToken<EcSig<(usize,)>>,
/// {
///     async_initiate(Ready(len), token, ())
/// }
///
/// async_ready(5, |ec: ErrorCode, len: usize| {
///     assert!(!ec.is_err());
///     assert_eq!(len, 5);
/// });
/// assert_eq!(async_ready(7, USE_FUTURE).get().unwrap(), 7);
/// ```
pub fn async_initiate<S, T, I, A>(initiation: I, token: T, args: A) -> T::Output
where
    S: Signature,
    T: CompletionToken<S>,
    I: Initiation<S, A>,
{
    token.async_initiate(initiation, args)
}

/// Uses any handler of `S` as its own completion token.
///
/// Closures are tokens already; this is for other `Handler` types.
pub struct CompletionHandler<H>(pub H);

impl<H, Args> Handler<Args> for CompletionHandler<H>
where
    H: Handler<Args>,
{
    fn complete(self, args: Args) {
        self.0.complete(args)
    }

    fn executor(&self) -> Option<AnyExecutor> {
        self.0.executor()
    }

    fn allocator(&self) -> Option<AnyAllocator> {
        self.0.allocator()
    }

    fn is_continuation(&self) -> bool {
        self.0.is_continuation()
    }
}

macro_rules! handler_token_impl {
    ($ty:ident < $($param:ident),* >) => {
        impl<S, $($param),*> CompletionToken<S> for $ty<$($param),*>
        where
            S: Signature,
            Self: Handler<S::Args>,
        {
            type Output = ();

            fn async_initiate<I, A>(self, initiation: I, args: A)
            where
                I: Initiation<S, A>,
            {
                initiation.initiate(self, args)
            }
        }
    };
}

handler_token_impl!(CompletionHandler<H>);
handler_token_impl!(ExecutorBinder<H>);
handler_token_impl!(AllocatorBinder<H>);
handler_token_impl!(ArcHandler<T, F>);
handler_token_impl!(Binder<H, T>);
handler_token_impl!(MoveBinder<H, T>);

macro_rules! fn_token_impl {
    ($($name:ident),*) => {
        impl<F, $($name),*> CompletionToken<Sig<($($name,)*)>> for F
        where
            F: FnOnce($($name),*) + Send + 'static,
            $($name: Send + 'static,)*
        {
            type Output = ();

            fn async_initiate<I, X>(self, initiation: I, args: X)
            where
                I: Initiation<Sig<($($name,)*)>, X>,
            {
                initiation.initiate(self, args)
            }
        }

        impl<F, $($name),*> CompletionToken<EcSig<($($name,)*)>> for F
        where
            F: FnOnce(ErrorCode, $($name),*) + Send + 'static,
            $($name: Send + 'static,)*
        {
            type Output = ();

            fn async_initiate<I, X>(self, initiation: I, args: X)
            where
                I: Initiation<EcSig<($($name,)*)>, X>,
            {
                initiation.initiate(self, args)
            }
        }

        impl<F, $($name),*> CompletionToken<ExSig<($($name,)*)>> for F
        where
            F: FnOnce(ExceptionPtr, $($name),*) + Send + 'static,
            $($name: Send + 'static,)*
        {
            type Output = ();

            fn async_initiate<I, X>(self, initiation: I, args: X)
            where
                I: Initiation<ExSig<($($name,)*)>, X>,
            {
                initiation.initiate(self, args)
            }
        }
    };
}

fn_token_impl!();
fn_token_impl!(A);
fn_token_impl!(A, B);
fn_token_impl!(A, B, C);
fn_token_impl!(A, B, C, D);

impl<F, A, B, C, D, E> CompletionToken<Sig<(A, B, C, D, E)>> for F
where
    F: FnOnce(A, B, C, D, E) + Send + 'static,
    A: Send + 'static,
    B: Send + 'static,
    C: Send + 'static,
    D: Send + 'static,
    E: Send + 'static,
{
    type Output = ();

    fn async_initiate<I, X>(self, initiation: I, args: X)
    where
        I: Initiation<Sig<(A, B, C, D, E)>, X>,
    {
        initiation.initiate(self, args)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::CANCELED;

    use std::sync::mpsc;
    use std::sync::{Arc, Mutex};

    /// Completes the handler inline with the stored arguments.
    pub struct Immediate<S: Signature>(pub S::Args);

    impl<S: Signature> Initiation<S> for Immediate<S> {
        fn initiate<H>(self, handler: H, _: ())
        where
            H: Handler<S::Args>,
        {
            handler.complete(self.0)
        }
    }

    /// Keeps the handler so a test can complete it later.
    pub struct Pending<S: Signature> {
        pub slot: Arc<Mutex<Option<Box<dyn FnOnce(S::Args) + Send>>>>,
    }

    impl<S: Signature> Initiation<S> for Pending<S> {
        fn initiate<H>(self, handler: H, _: ())
        where
            H: Handler<S::Args>,
        {
            *self.slot.lock().unwrap() = Some(Box::new(move |args: S::Args| handler.complete(args)));
        }
    }

    #[test]
    fn test_closure_tokens() {
        let (tx, rx) = mpsc::channel();
        let t = tx.clone();
        async_initiate(
            Immediate::<Sig<(i32,)>>((1,)),
            move |n: i32| t.send(format!("sig {}", n)).unwrap(),
            (),
        );
        let t = tx.clone();
        async_initiate(
            Immediate::<EcSig<(i32, i32)>>((CANCELED, 2, 3)),
            move |ec: ErrorCode, a: i32, b: i32| t.send(format!("ec {} {} {}", ec.is_err(), a, b)).unwrap(),
            (),
        );
        let t = tx.clone();
        async_initiate(
            Immediate::<ExSig<()>>((ExceptionPtr::null(),)),
            move |ex: ExceptionPtr| t.send(format!("ex {}", ex.is_null())).unwrap(),
            (),
        );
        assert_eq!(rx.recv().unwrap(), "sig 1");
        assert_eq!(rx.recv().unwrap(), "ec true 2 3");
        assert_eq!(rx.recv().unwrap(), "ex true");
    }

    #[test]
    fn test_initiation_args() {
        struct AddThen;

        impl Initiation<Sig<(i32,)>, (i32, i32)> for AddThen {
            fn initiate<H>(self, handler: H, args: (i32, i32))
            where
                H: Handler<(i32,)>,
            {
                handler.complete((args.0 + args.1,))
            }
        }

        let (tx, rx) = mpsc::channel();
        async_initiate(AddThen, move |n: i32| tx.send(n).unwrap(), (2, 3));
        assert_eq!(rx.recv().unwrap(), 5);
    }

    #[test]
    fn test_handler_wrappers_are_tokens() {
        use crate::handler::tests::Probe;

        let (probe, rx) = Probe::<(u8,)>::new();
        async_initiate(Immediate::<Sig<(u8,)>>((1,)), CompletionHandler(probe), ());
        assert_eq!(rx.recv().unwrap(), (1,));

        let (probe, rx) = Probe::<(ErrorCode, u8)>::new();
        let token = crate::handler::bind_allocator(crate::memory::StdAllocator, probe);
        async_initiate(Immediate::<EcSig<(u8,)>>((CANCELED, 2)), token, ());
        assert_eq!(rx.recv().unwrap(), (CANCELED, 2));

        let (tx, rx) = mpsc::channel();
        let token = crate::bind_handler::bind_handler(move |n: u8| tx.send(n).unwrap(), (3,));
        async_initiate(Immediate::<Sig<()>>(()), token, ());
        assert_eq!(rx.recv().unwrap(), 3);
    }

    #[test]
    fn test_dropped_handler_never_runs() {
        let slot = Arc::new(Mutex::new(None));
        let ran = Arc::new(Mutex::new(false));
        let r = ran.clone();
        async_initiate(
            Pending::<Sig<()>> { slot: slot.clone() },
            move || *r.lock().unwrap() = true,
            (),
        );
        assert!(slot.lock().unwrap().is_some());
        slot.lock().unwrap().take();
        assert!(!*ran.lock().unwrap());
    }
}
