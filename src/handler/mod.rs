use crate::executor::AnyExecutor;
use crate::memory::AnyAllocator;

/// A continuation invoked once with the completion arguments `Args`.
///
/// `complete` consumes the handler, so a handler can't run twice. Dropping a
/// handler without completing it is allowed and runs nothing.
///
/// The provided methods describe the handler's affinity. A handler that wraps
/// another handler must forward all three to the wrapped one.
pub trait Handler<Args>: Send + 'static {
    fn complete(self, args: Args);

    /// The executor this handler prefers to run on.
    fn executor(&self) -> Option<AnyExecutor> {
        None
    }

    /// The allocator this handler prefers for memory tied to its operation.
    fn allocator(&self) -> Option<AnyAllocator> {
        None
    }

    /// Returns `true` if running this handler continues the current work.
    fn is_continuation(&self) -> bool {
        false
    }
}

macro_rules! fn_handler_impl {
    ($($name:ident),*) => {
        impl<F, $($name),*> Handler<($($name,)*)> for F
        where
            F: FnOnce($($name),*) + Send + 'static,
        {
            #[allow(non_snake_case)]
            fn complete(self, args: ($($name,)*)) {
                let ($($name,)*) = args;
                self($($name),*)
            }
        }
    };
}

fn_handler_impl!();
fn_handler_impl!(A);
fn_handler_impl!(A, B);
fn_handler_impl!(A, B, C);
fn_handler_impl!(A, B, C, D);
fn_handler_impl!(A, B, C, D, E);

/// Returns the executor of `handler`, or `fallback` if it declares none.
pub fn get_associated_executor<H, Args>(handler: &H, fallback: AnyExecutor) -> AnyExecutor
where
    H: Handler<Args>,
{
    handler.executor().unwrap_or(fallback)
}

/// Returns the allocator of `handler`, or `fallback` if it declares none.
pub fn get_associated_allocator<H, Args>(handler: &H, fallback: AnyAllocator) -> AnyAllocator
where
    H: Handler<Args>,
{
    handler.allocator().unwrap_or(fallback)
}

pub fn is_continuation<H, Args>(handler: &H) -> bool
where
    H: Handler<Args>,
{
    handler.is_continuation()
}

mod bind;
pub use self::bind::*;

mod wrap;
pub use self::wrap::*;

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::executor::QueueExecutor;
    use crate::memory::StdAllocator;
    use crate::recycling_allocator::RecyclingAllocator;

    use std::sync::mpsc;

    /// A handler that declares every affinity and reports its arguments.
    pub struct Probe<T> {
        pub tx: mpsc::Sender<T>,
        pub ex: AnyExecutor,
        pub alloc: AnyAllocator,
    }

    impl<T: Send + 'static> Probe<T> {
        pub fn new() -> (Probe<T>, mpsc::Receiver<T>) {
            let (tx, rx) = mpsc::channel();
            let probe = Probe {
                tx: tx,
                ex: AnyExecutor::new(QueueExecutor::default()),
                alloc: AnyAllocator::new(RecyclingAllocator::<crate::thread_info::DefaultTag>::new()),
            };
            (probe, rx)
        }
    }

    impl<T: Send + 'static> Handler<T> for Probe<T> {
        fn complete(self, args: T) {
            let _ = self.tx.send(args);
        }

        fn executor(&self) -> Option<AnyExecutor> {
            Some(self.ex.clone())
        }

        fn allocator(&self) -> Option<AnyAllocator> {
            Some(self.alloc.clone())
        }

        fn is_continuation(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_closure_handler() {
        let (tx, rx) = mpsc::channel();
        let h = move |a: i32, b: &'static str| tx.send((a, b)).unwrap();
        Handler::complete(h, (1, "one"));
        assert_eq!(rx.recv().unwrap(), (1, "one"));
    }

    #[test]
    fn test_closure_handler_defaults() {
        let h = |_: usize| {};
        let fallback = AnyExecutor::new(QueueExecutor::default());
        assert_eq!(get_associated_executor::<_, (usize,)>(&h, fallback.clone()), fallback);
        assert_eq!(
            get_associated_allocator::<_, (usize,)>(&h, AnyAllocator::default()),
            AnyAllocator::new(StdAllocator)
        );
        assert!(!is_continuation::<_, (usize,)>(&h));
    }

    #[test]
    fn test_declared_affinity_wins() {
        let (probe, _rx) = Probe::<(u8,)>::new();
        let ex = probe.ex.clone();
        let alloc = probe.alloc.clone();
        assert_eq!(get_associated_executor::<_, (u8,)>(&probe, AnyExecutor::default()), ex);
        assert_eq!(get_associated_allocator::<_, (u8,)>(&probe, AnyAllocator::default()), alloc);
        assert!(is_continuation::<_, (u8,)>(&probe));
    }
}
