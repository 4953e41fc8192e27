use crate::executor::AnyExecutor;
use crate::handler::Handler;
use crate::memory::AnyAllocator;

/// A nullary handler calling `H` with a copy of the bound arguments `T`.
///
/// `T` is a tuple of one to five values. A `Binder` can be cloned, so it can
/// be invoked any number of times with `invoke`.
#[derive(Clone)]
pub struct Binder<H, T> {
    handler: H,
    args: T,
}

impl<H, T> Binder<H, T> {
    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn args(&self) -> &T {
        &self.args
    }

    /// Calls a copy of the handler with a copy of the arguments.
    pub fn invoke(&self)
    where
        H: Handler<T> + Clone,
        T: Clone + Send + 'static,
    {
        self.handler.clone().complete(self.args.clone())
    }
}

impl<H, T> Handler<()> for Binder<H, T>
where
    H: Handler<T>,
    T: Clone + Send + 'static,
{
    fn complete(self, _: ()) {
        self.handler.complete(self.args)
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

/// A nullary handler moving the bound arguments `T` into `H`.
///
/// Used when the arguments can't be copied. It is completed at most once.
pub struct MoveBinder<H, T> {
    handler: H,
    args: T,
}

impl<H, T> MoveBinder<H, T> {
    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn args(&self) -> &T {
        &self.args
    }
}

impl<H, T> Handler<()> for MoveBinder<H, T>
where
    H: Handler<T>,
    T: Send + 'static,
{
    fn complete(self, _: ()) {
        self.handler.complete(self.args)
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

/// A tuple of one to five arguments that can be bound to a handler.
pub trait BindArgs: Sized + Send + 'static {}

impl<A: Send + 'static> BindArgs for (A,) {}
impl<A: Send + 'static, B: Send + 'static> BindArgs for (A, B) {}
impl<A: Send + 'static, B: Send + 'static, C: Send + 'static> BindArgs for (A, B, C) {}
impl<A: Send + 'static, B: Send + 'static, C: Send + 'static, D: Send + 'static> BindArgs
    for (A, B, C, D)
{
}
impl<A, B, C, D, E> BindArgs for (A, B, C, D, E)
where
    A: Send + 'static,
    B: Send + 'static,
    C: Send + 'static,
    D: Send + 'static,
    E: Send + 'static,
{
}

/// Binds copies of `args` to `handler`.
///
/// # Examples
///
/// ```
/// use std::sync::mpsc;
/// use asyncio::{bind_handler, ErrorCode, Handler};
///
/// let (tx, rx) = mpsc::channel();
/// let h = bind_handler(move |ec: ErrorCode, len: usize| tx.send((ec, len)).unwrap(), (ErrorCode::default(), 5));
/// h.invoke();
/// h.complete(());
/// assert_eq!(rx.recv().unwrap(), (ErrorCode::default(), 5));
/// assert_eq!(rx.recv().unwrap(), (ErrorCode::default(), 5));
/// ```
pub fn bind_handler<H, T>(handler: H, args: T) -> Binder<H, T>
where
    H: Handler<T>,
    T: BindArgs + Clone,
{
    Binder {
        handler: handler,
        args: args,
    }
}

/// Binds `args` to `handler` by move.
pub fn move_bind_handler<H, T>(handler: H, args: T) -> MoveBinder<H, T>
where
    H: Handler<T>,
    T: BindArgs,
{
    MoveBinder {
        handler: handler,
        args: args,
    }
}

#[test]
fn test_bind_handler_arities() {
    use std::sync::mpsc;

    let (tx, rx) = mpsc::channel();
    let t = tx.clone();
    bind_handler(move |a: i32| t.send(vec![a]).unwrap(), (1,)).complete(());
    let t = tx.clone();
    bind_handler(move |a: i32, b: i32| t.send(vec![a, b]).unwrap(), (1, 2)).complete(());
    let t = tx.clone();
    bind_handler(move |a: i32, b: i32, c: i32| t.send(vec![a, b, c]).unwrap(), (1, 2, 3)).complete(());
    let t = tx.clone();
    bind_handler(
        move |a: i32, b: i32, c: i32, d: i32| t.send(vec![a, b, c, d]).unwrap(),
        (1, 2, 3, 4),
    )
    .complete(());
    let t = tx.clone();
    bind_handler(
        move |a: i32, b: i32, c: i32, d: i32, e: i32| t.send(vec![a, b, c, d, e]).unwrap(),
        (1, 2, 3, 4, 5),
    )
    .complete(());

    for n in 1..6 {
        assert_eq!(rx.recv().unwrap(), (1..n + 1).collect::<Vec<i32>>());
    }
}

#[test]
fn test_binder_is_reinvocable() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    let sum = Arc::new(AtomicUsize::new(0));
    let s = sum.clone();
    let h = bind_handler(
        move |a: usize, b: usize| {
            s.fetch_add(a + b, Ordering::SeqCst);
        },
        (3, 4),
    );
    h.invoke();
    h.invoke();
    h.clone().complete(());
    assert_eq!(sum.load(Ordering::SeqCst), 21);
    assert_eq!(h.args(), &(3, 4));
}

#[test]
fn test_move_bind_handler() {
    use std::sync::mpsc;

    struct NoCopy(String);

    let (tx, rx) = mpsc::channel();
    let h = move_bind_handler(
        move |a: NoCopy, n: u8| tx.send(format!("{}{}", a.0, n)).unwrap(),
        (NoCopy("abc".to_owned()), 1),
    );
    assert_eq!((h.args().0).0, "abc");
    h.complete(());
    assert_eq!(rx.recv().unwrap(), "abc1");
}

#[test]
fn test_move_bind_handler_arities() {
    use std::sync::mpsc;

    struct NoCopy(i32);

    let (tx, rx) = mpsc::channel();
    let t = tx.clone();
    move_bind_handler(move |a: NoCopy| t.send(vec![a.0]).unwrap(), (NoCopy(1),)).complete(());
    let t = tx.clone();
    move_bind_handler(
        move |a: NoCopy, b: NoCopy| t.send(vec![a.0, b.0]).unwrap(),
        (NoCopy(1), NoCopy(2)),
    )
    .complete(());
    let t = tx.clone();
    move_bind_handler(
        move |a: NoCopy, b: NoCopy, c: NoCopy| t.send(vec![a.0, b.0, c.0]).unwrap(),
        (NoCopy(1), NoCopy(2), NoCopy(3)),
    )
    .complete(());
    let t = tx.clone();
    move_bind_handler(
        move |a: NoCopy, b: NoCopy, c: NoCopy, d: NoCopy| t.send(vec![a.0, b.0, c.0, d.0]).unwrap(),
        (NoCopy(1), NoCopy(2), NoCopy(3), NoCopy(4)),
    )
    .complete(());
    move_bind_handler(
        move |a: NoCopy, b: NoCopy, c: NoCopy, d: NoCopy, e: NoCopy| {
            tx.send(vec![a.0, b.0, c.0, d.0, e.0]).unwrap()
        },
        (NoCopy(1), NoCopy(2), NoCopy(3), NoCopy(4), NoCopy(5)),
    )
    .complete(());

    for n in 1..6 {
        assert_eq!(rx.recv().unwrap(), (1..n + 1).collect::<Vec<i32>>());
    }
}

#[test]
fn test_binders_forward_affinity() {
    use crate::handler::tests::Probe;
    use crate::handler::{get_associated_allocator, get_associated_executor, is_continuation};

    let (probe, rx) = Probe::<(i32, i32)>::new();
    let ex = probe.ex.clone();
    let alloc = probe.alloc.clone();
    let h = move_bind_handler(probe, (1, 2));
    assert_eq!(get_associated_executor::<_, ()>(&h, AnyExecutor::default()), ex);
    assert_eq!(get_associated_allocator::<_, ()>(&h, AnyAllocator::default()), alloc);
    assert!(is_continuation::<_, ()>(&h));
    h.complete(());
    assert_eq!(rx.recv().unwrap(), (1, 2));

    let (probe, rx) = Probe::<(i32,)>::new();
    let ex = probe.ex.clone();
    let h = crate::handler::bind_executor(crate::executor::SystemExecutor, probe);
    let h = MoveBinder { handler: h, args: (9,) };
    assert_eq!(
        get_associated_executor::<_, ()>(&h, ex.clone()),
        AnyExecutor::new(crate::executor::SystemExecutor)
    );
    h.complete(());
    assert_eq!(rx.recv().unwrap(), (9,));
}
