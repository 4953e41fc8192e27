use crate::async_result::{async_initiate, CompletionToken, Initiation};
use crate::executor::{AnyExecutor, Executor, ExecutorFunction};
use crate::handler::{get_associated_allocator, Handler};
use crate::memory::{self, AnyAllocator};
use crate::recycling_allocator::RecyclingAllocator;
use crate::thread_info::ExecutorFunctionTag;
use crate::signature::Sig;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Submit {
    Dispatch,
    Post,
    Defer,
}

impl Submit {
    fn submit<E: Executor + ?Sized>(self, ex: &E, f: ExecutorFunction) {
        match self {
            Submit::Dispatch => ex.dispatch(f),
            Submit::Post => ex.post(f),
            Submit::Defer => ex.defer(f),
        }
    }
}

fn function<F>(f: F, alloc: &AnyAllocator) -> ExecutorFunction
where
    F: FnOnce() + Send + 'static,
{
    match ExecutorFunction::new_in(f, alloc.clone()) {
        Ok(f) => f,
        Err(err) => memory::oom(err),
    }
}

/// Counts as outstanding work on an executor until dropped.
struct Work(AnyExecutor);

impl Work {
    fn new(ex: AnyExecutor) -> Work {
        ex.on_work_started();
        Work(ex)
    }
}

impl Drop for Work {
    fn drop(&mut self) {
        self.0.on_work_finished()
    }
}

struct SubmitInitiation<'a, E> {
    ex: &'a E,
    how: Submit,
}

impl<'a, E: Executor> Initiation<Sig<()>> for SubmitInitiation<'a, E> {
    fn initiate<H>(self, handler: H, _: ())
    where
        H: Handler<()>,
    {
        let alloc = get_associated_allocator(
            &handler,
            AnyAllocator::new(RecyclingAllocator::<ExecutorFunctionTag>::new()),
        );
        match handler.executor() {
            Some(hex) if !hex.same_executor(self.ex) => {
                // The handler's executor stays busy until the handler reaches it.
                let work = Work::new(hex);
                let inner = alloc.clone();
                self.how.submit(
                    self.ex,
                    function(
                        move || {
                            work.0.dispatch(function(move || handler.complete(()), &inner));
                        },
                        &alloc,
                    ),
                );
            }
            _ => self.how.submit(self.ex, function(move || handler.complete(()), &alloc)),
        }
    }
}

/// Submits a completion to `ex`, running it inline if `ex` allows.
///
/// If the handler has its own associated executor, `ex` dispatches the
/// handler to it.
pub fn dispatch<E, T>(ex: &E, token: T) -> T::Output
where
    E: Executor,
    T: CompletionToken<Sig<()>>,
{
    async_initiate(
        SubmitInitiation {
            ex: ex,
            how: Submit::Dispatch,
        },
        token,
        (),
    )
}

/// Submits a completion to `ex` without running it inline.
///
/// # Examples
///
/// ```
/// use std::sync::mpsc;
/// use asyncio::{post, SystemExecutor};
///
/// let (tx, rx) = mpsc::channel();
/// post(&SystemExecutor, move || tx.send("posted").unwrap());
/// assert_eq!(rx.recv().unwrap(), "posted");
/// ```
pub fn post<E, T>(ex: &E, token: T) -> T::Output
where
    E: Executor,
    T: CompletionToken<Sig<()>>,
{
    async_initiate(
        SubmitInitiation {
            ex: ex,
            how: Submit::Post,
        },
        token,
        (),
    )
}

/// Submits a completion to `ex` as a continuation of the current work.
pub fn defer<E, T>(ex: &E, token: T) -> T::Output
where
    E: Executor,
    T: CompletionToken<Sig<()>>,
{
    async_initiate(
        SubmitInitiation {
            ex: ex,
            how: Submit::Defer,
        },
        token,
        (),
    )
}

#[test]
fn test_post_queues() {
    use crate::executor::QueueExecutor;
    use std::sync::mpsc;

    let q = QueueExecutor::default();
    let (tx, rx) = mpsc::channel();
    for i in 0..3 {
        let tx = tx.clone();
        post(&q, move || tx.send(i).unwrap());
    }
    defer(&q, move || tx.send(3).unwrap());
    assert!(rx.try_recv().is_err());
    assert_eq!(q.run(), 4);
    assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
}

#[test]
fn test_dispatch_inline() {
    use crate::executor::SystemExecutor;
    use std::sync::mpsc;
    use std::thread;

    let id = thread::current().id();
    let (tx, rx) = mpsc::channel();
    dispatch(&SystemExecutor, move || tx.send(thread::current().id()).unwrap());
    assert_eq!(rx.try_recv().unwrap(), id);
}

#[test]
fn test_post_to_handler_executor() {
    use crate::executor::QueueExecutor;
    use crate::handler::bind_executor;
    use std::sync::mpsc;

    let outer = QueueExecutor::default();
    let inner = QueueExecutor::default();
    let (tx, rx) = mpsc::channel();
    post(&outer, bind_executor(inner.clone(), move || tx.send(()).unwrap()));
    assert_eq!(outer.len(), 1);
    assert_eq!(inner.len(), 0);
    assert_eq!(outer.run(), 1);
    assert!(rx.try_recv().is_err());
    assert_eq!(inner.len(), 1);
    assert_eq!(inner.run(), 1);
    rx.try_recv().unwrap();
}

#[test]
fn test_post_same_executor_is_direct() {
    use crate::executor::QueueExecutor;
    use crate::handler::bind_executor;
    use std::sync::mpsc;

    let q = QueueExecutor::default();
    let (tx, rx) = mpsc::channel();
    post(&q, bind_executor(q.clone(), move || tx.send(()).unwrap()));
    assert_eq!(q.run(), 1);
    rx.try_recv().unwrap();
}

#[test]
fn test_post_use_future() {
    use crate::executor::SystemExecutor;
    use crate::use_future::USE_FUTURE;

    let f = post(&SystemExecutor, USE_FUTURE);
    assert_eq!(f.get().unwrap(), ());
    let f = post(&SystemExecutor, USE_FUTURE.package(|| "packaged"));
    assert_eq!(futures::executor::block_on(f).unwrap(), "packaged");
}

#[test]
fn test_post_detached() {
    use crate::detached::DETACHED;
    use crate::executor::QueueExecutor;

    let q = QueueExecutor::default();
    post(&q, DETACHED);
    assert_eq!(q.run(), 1);
}

#[test]
fn test_post_uses_handler_allocator() {
    use crate::executor::QueueExecutor;
    use crate::handler::{bind_allocator, bind_executor};
    use crate::memory::tests::Counting;
    use std::sync::mpsc;

    let alloc = Counting::new();
    let q = QueueExecutor::default();
    let (tx, rx) = mpsc::channel();
    post(&q, bind_allocator(alloc.clone(), move || tx.send(()).unwrap()));
    assert_eq!(alloc.allocations(), 1);
    assert_eq!(alloc.live(), 1);
    assert_eq!(q.run(), 1);
    rx.try_recv().unwrap();
    assert_eq!(alloc.live(), 0);

    // both hops through another executor allocate from it too
    let inner = QueueExecutor::default();
    let (tx, rx) = mpsc::channel();
    dispatch(
        &q,
        bind_executor(inner.clone(), bind_allocator(alloc.clone(), move || tx.send(()).unwrap())),
    );
    assert_eq!(q.run(), 1);
    assert_eq!(inner.run(), 1);
    rx.try_recv().unwrap();
    assert_eq!(alloc.allocations(), 3);
    assert_eq!(alloc.live(), 0);
}

#[cfg(test)]
#[derive(Clone, Default)]
struct CountingExecutor {
    inner: crate::executor::QueueExecutor,
    work: std::sync::Arc<std::sync::atomic::AtomicUsize>,
}

#[cfg(test)]
impl CountingExecutor {
    fn outstanding(&self) -> usize {
        self.work.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
impl Executor for CountingExecutor {
    fn dispatch(&self, f: ExecutorFunction) {
        self.inner.dispatch(f)
    }

    fn post(&self, f: ExecutorFunction) {
        self.inner.post(f)
    }

    fn on_work_started(&self) {
        self.work.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }

    fn on_work_finished(&self) {
        self.work.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn same_executor(&self, other: &dyn Executor) -> bool {
        match other.as_any().downcast_ref::<CountingExecutor>() {
            Some(other) => std::sync::Arc::ptr_eq(&self.work, &other.work),
            None => false,
        }
    }
}

#[test]
fn test_post_tracks_work_on_handler_executor() {
    use crate::executor::QueueExecutor;
    use crate::handler::bind_executor;

    let hex = CountingExecutor::default();
    let q = QueueExecutor::default();
    post(&q, bind_executor(hex.clone(), || {}));
    assert_eq!(hex.outstanding(), 1);
    assert_eq!(q.run(), 1);
    assert_eq!(hex.outstanding(), 0);
    assert_eq!(hex.inner.run(), 1);
}

#[test]
fn test_work_finished_when_submission_is_dropped() {
    use crate::executor::QueueExecutor;
    use crate::handler::bind_executor;
    use std::sync::Arc;

    let hex = CountingExecutor::default();
    let data = Arc::new(());
    let d = data.clone();
    let q = QueueExecutor::default();
    post(&q, bind_executor(hex.clone(), move || drop(d)));
    assert_eq!(hex.outstanding(), 1);
    drop(q);
    assert_eq!(hex.outstanding(), 0);
    assert_eq!(Arc::strong_count(&data), 1);
    assert_eq!(hex.inner.len(), 0);
}
