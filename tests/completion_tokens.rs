use asyncio::*;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

type Op = Box<dyn FnOnce(ErrorCode) + Send>;

/// Keeps outstanding operations until the test completes them.
#[derive(Default)]
struct Service {
    ops: Mutex<Vec<Op>>,
}

impl Service {
    fn push(&self, op: Op) {
        self.ops.lock().unwrap().push(op)
    }

    fn complete_all(&self, ec: ErrorCode) -> usize {
        let ops: Vec<Op> = self.ops.lock().unwrap().drain(..).collect();
        let n = ops.len();
        for op in ops {
            op(ec);
        }
        n
    }

    fn shutdown(&self) {
        self.ops.lock().unwrap().clear()
    }
}

struct ReadOp {
    svc: Arc<Service>,
    len: usize,
}

impl Initiation<EcSig<(usize,)>> for ReadOp {
    fn initiate<H>(self, handler: H, _: ())
    where
        H: Handler<(ErrorCode, usize)>,
    {
        let ex = get_associated_executor(&handler, AnyExecutor::default());
        let len = self.len;
        self.svc.push(Box::new(move |ec: ErrorCode| {
            let len = if ec.is_err() { 0 } else { len };
            post(&ex, CompletionHandler(move_bind_handler(handler, (ec, len))));
        }));
    }
}

fn async_read<T>(svc: &Arc<Service>, len: usize, token: T) -> T::Output
where
    T: CompletionToken<EcSig<(usize,)>>,
{
    async_initiate(
        ReadOp {
            svc: svc.clone(),
            len: len,
        },
        token,
        (),
    )
}

struct WaitOp(Arc<Service>);

impl Initiation<EcSig<()>> for WaitOp {
    fn initiate<H>(self, handler: H, _: ())
    where
        H: Handler<(ErrorCode,)>,
    {
        self.0.push(Box::new(move |ec: ErrorCode| handler.complete((ec,))));
    }
}

fn async_wait<T>(svc: &Arc<Service>, token: T) -> T::Output
where
    T: CompletionToken<EcSig<()>>,
{
    async_initiate(WaitOp(svc.clone()), token, ())
}

#[test]
fn test_callback() {
    let svc = Arc::new(Service::default());
    let (tx, rx) = mpsc::channel();
    async_read(&svc, 16, move |ec: ErrorCode, len: usize| tx.send((ec, len)).unwrap());
    assert!(rx.try_recv().is_err());
    assert_eq!(svc.complete_all(ErrorCode::default()), 1);
    assert_eq!(rx.recv().unwrap(), (ErrorCode::default(), 16));
}

#[test]
fn test_callback_runs_on_bound_executor() {
    let svc = Arc::new(Service::default());
    let (tx, rx) = mpsc::channel();
    let caller = thread::current().id();
    async_read(
        &svc,
        8,
        bind_executor(SystemExecutor, move |_: ErrorCode, _: usize| {
            tx.send(thread::current().id()).unwrap()
        }),
    );
    svc.complete_all(ErrorCode::default());
    assert_ne!(rx.recv().unwrap(), caller);
}

#[test]
fn test_use_future() {
    let svc = Arc::new(Service::default());
    let f = async_read(&svc, 32, USE_FUTURE);
    let s = svc.clone();
    thread::spawn(move || s.complete_all(ErrorCode::default()));
    assert_eq!(futures::executor::block_on(f).unwrap(), 32);

    let f = async_read(&svc, 32, USE_FUTURE);
    svc.complete_all(CONNECTION_REFUSED);
    match f.get() {
        Err(FutureError::System(err)) => assert_eq!(err.code(), CONNECTION_REFUSED),
        res => panic!("{:?}", res),
    }
}

#[test]
fn test_use_future_without_values() {
    let svc = Arc::new(Service::default());
    let f = async_wait(&svc, USE_FUTURE);
    assert!(!f.is_ready());
    svc.complete_all(ErrorCode::default());
    assert!(f.is_ready());
    f.get().unwrap();
}

#[test]
fn test_redirect_error() {
    let svc = Arc::new(Service::default());
    let ec = ErrorSlot::new();

    let f = async_read(&svc, 4, redirect_error(USE_FUTURE, &ec));
    svc.complete_all(TIMED_OUT);
    assert_eq!(f.get().unwrap(), 0);
    assert_eq!(ec.get(), TIMED_OUT);

    let (tx, rx) = mpsc::channel();
    async_wait(&svc, redirect_error(move || tx.send(()).unwrap(), &ec));
    svc.complete_all(ErrorCode::default());
    rx.recv().unwrap();
    assert!(!ec.get().is_err());
}

#[test]
fn test_detached() {
    let svc = Arc::new(Service::default());
    async_read(&svc, 1, DETACHED);
    async_wait(&svc, DETACHED);
    assert_eq!(svc.complete_all(CANCELED), 2);
}

#[test]
fn test_shutdown_breaks_promises() {
    let svc = Arc::new(Service::default());
    let f = async_read(&svc, 1, USE_FUTURE);
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    async_wait(&svc, move |_: ErrorCode| {
        c.fetch_add(1, Ordering::SeqCst);
    });
    svc.shutdown();
    match f.get() {
        Err(FutureError::BrokenPromise) => {}
        res => panic!("{:?}", res),
    }
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[test]
fn test_package() {
    let svc = Arc::new(Service::default());
    let f = async_read(
        &svc,
        10,
        USE_FUTURE.package(|ec: ErrorCode, len: usize| if ec.is_err() { None } else { Some(len * 2) }),
    );
    svc.complete_all(ErrorCode::default());
    assert_eq!(f.get().unwrap(), Some(20));
}

#[test]
fn test_use_future_with_recycling_allocator() {
    thread::spawn(|| {
        let svc = Arc::new(Service::default());
        let token = use_future_with(RecyclingAllocator::<thread_info::DefaultTag>::new());
        for _ in 0..3 {
            let f = async_wait(&svc, token);
            svc.complete_all(ErrorCode::default());
            f.get().unwrap();
        }
        thread_info::ThreadInfo::with_current(|ti| {
            let stats = ti.unwrap().stats();
            assert_eq!(stats.heap_allocations, 1);
            assert_eq!(stats.reused, 2);
        });
    })
    .join()
    .unwrap();
}
