use crate::async_result::{CompletionToken, Initiation};
use crate::error::ErrorCode;
use crate::executor::AnyExecutor;
use crate::handler::Handler;
use crate::memory::AnyAllocator;
use crate::signature::{ExSig, Sig, Signature, Values};

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

/// A shared cell receiving the error code of a redirected operation.
///
/// Clones refer to the same cell.
#[derive(Clone, Default)]
pub struct ErrorSlot(Arc<AtomicI32>);

impl ErrorSlot {
    pub fn new() -> ErrorSlot {
        ErrorSlot::default()
    }

    pub fn get(&self) -> ErrorCode {
        ErrorCode::new(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, ec: ErrorCode) {
        self.0.store(ec.value(), Ordering::Release)
    }
}

impl fmt::Debug for ErrorSlot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ErrorSlot({:?})", self.get())
    }
}

/// A signature whose leading error code can be taken out of the arguments.
///
/// `EcSig<T>` becomes `Sig<T>`; other signatures pass through unchanged.
pub trait RedirectSignature: Signature {
    type Redirected: Signature;

    fn redirect(args: Self::Args) -> (Option<ErrorCode>, <Self::Redirected as Signature>::Args);
}

impl<T: Values> RedirectSignature for Sig<T> {
    type Redirected = Sig<T>;

    fn redirect(args: T) -> (Option<ErrorCode>, T) {
        (None, args)
    }
}

impl<T> RedirectSignature for ExSig<T>
where
    ExSig<T>: Signature,
{
    type Redirected = ExSig<T>;

    fn redirect(args: Self::Args) -> (Option<ErrorCode>, Self::Args) {
        (None, args)
    }
}

macro_rules! redirect_signature_impl {
    ($($name:ident),*) => {
        impl<$($name: Send + 'static),*> RedirectSignature for crate::signature::EcSig<($($name,)*)> {
            type Redirected = Sig<($($name,)*)>;

            #[allow(non_snake_case)]
            fn redirect(args: Self::Args) -> (Option<ErrorCode>, ($($name,)*)) {
                let (ec, $($name,)*) = args;
                (Some(ec), ($($name,)*))
            }
        }
    };
}

redirect_signature_impl!();
redirect_signature_impl!(A);
redirect_signature_impl!(A, B);
redirect_signature_impl!(A, B, C);
redirect_signature_impl!(A, B, C, D);
redirect_signature_impl!(A, B, C, D, E);

/// A handler storing the leading error code into an `ErrorSlot`, then
/// completing the inner handler with the remaining arguments.
///
/// The remaining arguments are forwarded whether or not the code is a
/// failure.
pub struct RedirectErrorHandler<H, S> {
    handler: H,
    slot: ErrorSlot,
    _marker: PhantomData<fn() -> S>,
}

impl<H, S> Handler<S::Args> for RedirectErrorHandler<H, S>
where
    S: RedirectSignature,
    H: Handler<<S::Redirected as Signature>::Args>,
{
    fn complete(self, args: S::Args) {
        let (ec, rest) = S::redirect(args);
        if let Some(ec) = ec {
            self.slot.set(ec);
        }
        self.handler.complete(rest)
    }

    fn executor(&self) -> Option<AnyExecutor> {
        self.handler.executor()
    }

    fn allocator(&self) -> Option<AnyAllocator> {
        self.handler.allocator()
    }

    fn is_continuation(&self) -> bool {
        self.handler.is_continuation()
    }
}

struct RedirectInitiation<I, S> {
    initiation: I,
    slot: ErrorSlot,
    _marker: PhantomData<fn() -> S>,
}

impl<I, S, A> Initiation<S::Redirected, A> for RedirectInitiation<I, S>
where
    S: RedirectSignature,
    I: Initiation<S, A>,
{
    fn initiate<H>(self, handler: H, args: A)
    where
        H: Handler<<S::Redirected as Signature>::Args>,
    {
        let handler = RedirectErrorHandler::<H, S> {
            handler: handler,
            slot: self.slot,
            _marker: PhantomData,
        };
        self.initiation.initiate(handler, args)
    }
}

/// A completion token adaptor reporting the error code through an
/// `ErrorSlot` instead of the inner token.
pub struct RedirectError<T> {
    token: T,
    slot: ErrorSlot,
}

impl<T> RedirectError<T> {
    pub fn slot(&self) -> &ErrorSlot {
        &self.slot
    }
}

impl<T, S> CompletionToken<S> for RedirectError<T>
where
    S: RedirectSignature,
    T: CompletionToken<S::Redirected>,
{
    type Output = <T as CompletionToken<S::Redirected>>::Output;

    fn async_initiate<I, A>(self, initiation: I, args: A) -> Self::Output
    where
        I: Initiation<S, A>,
    {
        let initiation = RedirectInitiation::<I, S> {
            initiation: initiation,
            slot: self.slot,
            _marker: PhantomData,
        };
        self.token.async_initiate(initiation, args)
    }
}

/// Wraps `token` so the operation's error code is stored into `slot`.
///
/// # Examples
///
/// ```
/// use asyncio::*;
///
/// struct Refused;
///
/// impl Initiation<EcSig<(usize,)>> for Refused {
///     fn initiate<H>(self, handler: H, _: ())
///     where
///         H: Handler<(ErrorCode, usize)>,
///     {
///         handler.complete((CONNECTION_REFUSED, 0))
///     }
/// }
///
/// let ec = ErrorSlot::new();
/// let len = async_initiate(Refused, redirect_error(USE_FUTURE, &ec), ()).get().unwrap();
/// assert_eq!(ec.get(), CONNECTION_REFUSED);
/// assert_eq!(len, 0);
/// ```
pub fn redirect_error<T>(token: T, slot: &ErrorSlot) -> RedirectError<T> {
    RedirectError {
        token: token,
        slot: slot.clone(),
    }
}

#[test]
fn test_redirect_error_forwards_values_even_on_failure() {
    use crate::async_result::async_initiate;
    use crate::async_result::tests::Immediate;
    use crate::error::{CANCELED, READY};
    use crate::signature::EcSig;
    use std::sync::mpsc;

    let ec = ErrorSlot::new();
    let (tx, rx) = mpsc::channel();
    let t = tx.clone();
    async_initiate(
        Immediate::<EcSig<(usize,)>>((CANCELED, 10)),
        redirect_error(move |n: usize| t.send(n).unwrap(), &ec),
        (),
    );
    assert_eq!(ec.get(), CANCELED);
    assert_eq!(rx.recv().unwrap(), 10);

    async_initiate(
        Immediate::<EcSig<(usize,)>>((READY, 20)),
        redirect_error(move |n: usize| tx.send(n).unwrap(), &ec),
        (),
    );
    assert_eq!(ec.get(), READY);
    assert_eq!(rx.recv().unwrap(), 20);
}

#[test]
fn test_redirect_error_no_values() {
    use crate::async_result::async_initiate;
    use crate::async_result::tests::Immediate;
    use crate::error::TIMED_OUT;
    use crate::signature::EcSig;
    use std::sync::mpsc;

    let ec = ErrorSlot::new();
    let (tx, rx) = mpsc::channel();
    async_initiate(
        Immediate::<EcSig<()>>((TIMED_OUT,)),
        redirect_error(move || tx.send(()).unwrap(), &ec),
        (),
    );
    rx.recv().unwrap();
    assert_eq!(ec.get(), TIMED_OUT);
}

#[test]
fn test_redirect_error_passes_other_signatures() {
    use crate::async_result::async_initiate;
    use crate::async_result::tests::Immediate;
    use crate::error::{ExceptionPtr, WOULD_BLOCK};
    use std::sync::mpsc;

    let ec = ErrorSlot::new();
    ec.set(WOULD_BLOCK);
    let (tx, rx) = mpsc::channel();
    let t = tx.clone();
    async_initiate(
        Immediate::<Sig<(u8, u8)>>((1, 2)),
        redirect_error(move |a: u8, b: u8| t.send(a + b).unwrap(), &ec),
        (),
    );
    assert_eq!(rx.recv().unwrap(), 3);
    async_initiate(
        Immediate::<ExSig<(u8,)>>((ExceptionPtr::null(), 4)),
        redirect_error(move |ex: ExceptionPtr, a: u8| tx.send(a + ex.is_null() as u8).unwrap(), &ec),
        (),
    );
    assert_eq!(rx.recv().unwrap(), 5);
    assert_eq!(ec.get(), WOULD_BLOCK);
}

#[test]
fn test_redirect_error_nested() {
    use crate::async_result::async_initiate;
    use crate::async_result::tests::Immediate;
    use crate::error::CANCELED;
    use crate::signature::EcSig;
    use std::sync::mpsc;

    let outer = ErrorSlot::new();
    let inner = ErrorSlot::new();
    let (tx, rx) = mpsc::channel();
    async_initiate(
        Immediate::<EcSig<(i32,)>>((CANCELED, 1)),
        redirect_error(redirect_error(move |n: i32| tx.send(n).unwrap(), &inner), &outer),
        (),
    );
    assert_eq!(rx.recv().unwrap(), 1);
    assert_eq!(outer.get(), CANCELED);
    assert!(!inner.get().is_err());
}

#[test]
fn test_redirect_error_forwards_affinity() {
    use crate::async_result::tests::Pending;
    use crate::async_result::{async_initiate, CompletionHandler};
    use crate::error::CANCELED;
    use crate::handler::tests::Probe;
    use crate::signature::EcSig;
    use std::sync::{Arc, Mutex};

    struct Inspect(Arc<Mutex<Option<(AnyExecutor, bool)>>>);

    impl Initiation<EcSig<(u8,)>> for Inspect {
        fn initiate<H>(self, handler: H, _: ())
        where
            H: Handler<(ErrorCode, u8)>,
        {
            let ex = crate::handler::get_associated_executor(&handler, AnyExecutor::default());
            *self.0.lock().unwrap() = Some((ex, handler.is_continuation()));
            handler.complete((CANCELED, 8));
        }
    }

    let (probe, rx) = Probe::<(u8,)>::new();
    let ex = probe.ex.clone();
    let seen = Arc::new(Mutex::new(None));
    let slot = ErrorSlot::new();
    async_initiate(Inspect(seen.clone()), redirect_error(CompletionHandler(probe), &slot), ());
    assert_eq!(*seen.lock().unwrap(), Some((ex, true)));
    assert_eq!(rx.recv().unwrap(), (8,));
    assert_eq!(slot.get(), CANCELED);

    let pending = Pending::<EcSig<()>> { slot: Arc::new(Mutex::new(None)) };
    let store = pending.slot.clone();
    let (tx, rx) = std::sync::mpsc::channel();
    async_initiate(pending, redirect_error(move || tx.send(()).unwrap(), &slot), ());
    let complete = store.lock().unwrap().take().unwrap();
    complete((crate::error::READY,));
    rx.recv().unwrap();
    assert!(!slot.get().is_err());
}
