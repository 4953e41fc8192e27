use crate::async_result::{CompletionToken, Initiation};
use crate::handler::Handler;
use crate::signature::Signature;

/// A completion token that starts an operation and ignores its result.
///
/// The operation's completion arguments, errors included, are dropped. The
/// initiating function returns `()`.
///
/// # Examples
///
/// ```
/// use asyncio::{post, SystemExecutor, DETACHED};
///
/// post(&SystemExecutor, DETACHED);
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Detached;

pub const DETACHED: Detached = Detached;

/// The handler produced by `Detached`. Completing it does nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct DetachedHandler;

impl<Args: Send + 'static> Handler<Args> for DetachedHandler {
    fn complete(self, _: Args) {}
}

impl<S: Signature> CompletionToken<S> for Detached {
    type Output = ();

    fn async_initiate<I, A>(self, initiation: I, args: A)
    where
        I: Initiation<S, A>,
    {
        initiation.initiate(DetachedHandler, args)
    }
}

#[test]
fn test_detached() {
    use crate::async_result::async_initiate;
    use crate::async_result::tests::Immediate;
    use crate::error::{ErrorCode, CANCELED};
    use crate::signature::{EcSig, Sig};

    async_initiate(Immediate::<Sig<()>>(()), DETACHED, ());
    async_initiate(Immediate::<EcSig<(usize,)>>((CANCELED, 3)), DETACHED, ());
    async_initiate(Immediate::<EcSig<(String, u8)>>((ErrorCode::default(), "x".to_owned(), 1)), Detached, ());
}

#[test]
fn test_detached_drops_arguments() {
    use crate::async_result::async_initiate;
    use crate::async_result::tests::Immediate;
    use crate::signature::Sig;
    use std::sync::Arc;

    let data = Arc::new(0);
    async_initiate(Immediate::<Sig<(Arc<i32>,)>>((data.clone(),)), DETACHED, ());
    assert_eq!(Arc::strong_count(&data), 1);
}

#[test]
fn test_detached_handler_has_no_affinity() {
    use crate::handler::{get_associated_executor, is_continuation};
    use crate::executor::AnyExecutor;

    let h = DetachedHandler;
    assert_eq!(get_associated_executor::<_, (i32,)>(&h, AnyExecutor::default()), AnyExecutor::default());
    assert!(!is_continuation::<_, (i32,)>(&h));
}
