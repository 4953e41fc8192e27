// asyncio
//
// The software is released under the MIT license. see LICENSE.txt
// https://github.com/harre-orz/rust_asio/blob/master/LICENSE.txt

//! Completion handling for asynchronous operations.
//!
//! An asynchronous operation is started by an `Initiation` and completes by
//! calling a `Handler` exactly once. The caller chooses how that happens
//! with a `CompletionToken`:
//!
//! - a closure or other handler is called with the completion arguments,
//! - `DETACHED` ignores the completion,
//! - `redirect_error(token, &slot)` stores the error code into an `ErrorSlot`,
//! - `USE_FUTURE` returns a `Future` of the result.
//!
//! Handlers can name the executor they run on and the allocator used for
//! memory tied to their operation. Short-lived allocations go through a
//! small per-thread recycling cache.
//!
//! # Examples
//!
//! ```
//! use asyncio::*;
//!
//! struct Connect;
//!
//! impl Initiation<EcSig<(u16,)>> for Connect {
//!     fn initiate<H>(self, handler: H, _: ())
//!     where
//!         H: Handler<(ErrorCode, u16)>,
//!     {
//!         let h = move_bind_handler(handler, (CONNECTION_REFUSED, 0));
//!         post(&SystemExecutor, CompletionHandler(h));
//!     }
//! }
//!
//! let ec = ErrorSlot::new();
//! let port = async_initiate(Connect, redirect_error(USE_FUTURE, &ec), ()).get().unwrap();
//! assert_eq!(port, 0);
//! assert_eq!(ec.get(), CONNECTION_REFUSED);
//! ```

#[macro_use]
extern crate lazy_static;

mod error;
pub use self::error::*;

pub mod memory;
pub use self::memory::{aligned_delete, aligned_new, Allocator, AnyAllocator, StdAllocator};

pub mod thread_info;

mod recycling_allocator;
pub use self::recycling_allocator::RecyclingAllocator;

mod executor;
pub use self::executor::{AnyExecutor, Executor, ExecutorFunction, SystemExecutor};

mod signature;
pub use self::signature::{EcSig, ExSig, Leading, Sig, Signature, Values};

mod handler;
pub use self::handler::*;

mod bind_handler;
pub use self::bind_handler::{bind_handler, move_bind_handler, BindArgs, Binder, MoveBinder};

mod async_result;
pub use self::async_result::{async_initiate, CompletionHandler, CompletionToken, Initiation};

mod detached;
pub use self::detached::{Detached, DetachedHandler, DETACHED};

mod redirect_error;
pub use self::redirect_error::{
    redirect_error, ErrorSlot, RedirectError, RedirectErrorHandler, RedirectSignature,
};

mod future;
pub use self::future::{Future, Promise};

mod use_future;
pub use self::use_future::{
    use_future_with, Packaged, PackagedHandler, PackagedToken, PromiseExecutor, PromiseHandler,
    PromiseInvoker, UseFuture, USE_FUTURE,
};

mod post;
pub use self::post::{defer, dispatch, post};
