use crate::error::{ErrorCode, ExceptionPtr, FutureError, SystemError};

use std::marker::PhantomData;

/// Completion without an error channel: the handler receives `T`.
pub struct Sig<T>(PhantomData<fn() -> T>);

/// Completion reporting an `ErrorCode` first, then the values of `T`.
pub struct EcSig<T>(PhantomData<fn() -> T>);

/// Completion reporting an `ExceptionPtr` first, then the values of `T`.
pub struct ExSig<T>(PhantomData<fn() -> T>);

/// The leading error argument of a completion, if its signature has one.
#[derive(Clone, Debug, PartialEq)]
pub enum Leading {
    None,
    Code(ErrorCode),
    Exception(ExceptionPtr),
}

impl Leading {
    /// Returns the failure carried by this argument, if it reports one.
    pub fn into_failure(self) -> Option<FutureError> {
        match self {
            Leading::None => None,
            Leading::Code(ec) => {
                if ec.is_err() {
                    Some(FutureError::System(SystemError(ec)))
                } else {
                    None
                }
            }
            Leading::Exception(ex) => {
                if ex.is_null() {
                    None
                } else {
                    Some(FutureError::Exception(ex))
                }
            }
        }
    }
}

/// The result values of a completion.
pub trait Values: Send + 'static {
    /// `()` for no values, the value itself for one, the tuple otherwise.
    type Collapsed: Send + 'static;

    fn collapse(self) -> Self::Collapsed;
}

impl Values for () {
    type Collapsed = ();

    fn collapse(self) {}
}

impl<A: Send + 'static> Values for (A,) {
    type Collapsed = A;

    fn collapse(self) -> A {
        self.0
    }
}

macro_rules! values_impl {
    ($($name:ident),+) => {
        impl<$($name: Send + 'static),+> Values for ($($name,)+) {
            type Collapsed = Self;

            fn collapse(self) -> Self {
                self
            }
        }
    };
}

values_impl!(A, B);
values_impl!(A, B, C);
values_impl!(A, B, C, D);
values_impl!(A, B, C, D, E);

/// A completion signature, resolved at compile time.
pub trait Signature: 'static {
    /// The argument tuple passed to the handler.
    type Args: Send + 'static;

    /// The arguments following the leading error, if any.
    type Values: Values;

    fn split(args: Self::Args) -> (Leading, Self::Values);
}

impl<T: Values> Signature for Sig<T> {
    type Args = T;
    type Values = T;

    fn split(args: T) -> (Leading, T) {
        (Leading::None, args)
    }
}

macro_rules! signature_impl {
    ($($name:ident),*) => {
        impl<$($name: Send + 'static),*> Signature for EcSig<($($name,)*)> {
            type Args = (ErrorCode, $($name,)*);
            type Values = ($($name,)*);

            #[allow(non_snake_case)]
            fn split(args: Self::Args) -> (Leading, Self::Values) {
                let (ec, $($name,)*) = args;
                (Leading::Code(ec), ($($name,)*))
            }
        }

        impl<$($name: Send + 'static),*> Signature for ExSig<($($name,)*)> {
            type Args = (ExceptionPtr, $($name,)*);
            type Values = ($($name,)*);

            #[allow(non_snake_case)]
            fn split(args: Self::Args) -> (Leading, Self::Values) {
                let (ex, $($name,)*) = args;
                (Leading::Exception(ex), ($($name,)*))
            }
        }
    };
}

signature_impl!();
signature_impl!(A);
signature_impl!(A, B);
signature_impl!(A, B, C);
signature_impl!(A, B, C, D);
signature_impl!(A, B, C, D, E);

#[test]
fn test_collapse() {
    assert_eq!(().collapse(), ());
    assert_eq!((1,).collapse(), 1);
    assert_eq!((1, "a").collapse(), (1, "a"));
    assert_eq!((1, 2, 3, 4, 5).collapse(), (1, 2, 3, 4, 5));
}

#[test]
fn test_split() {
    use crate::error::CANCELED;

    let (lead, values) = <Sig<(i32, u8)>>::split((1, 2));
    assert_eq!(lead, Leading::None);
    assert_eq!(values, (1, 2));

    let (lead, values) = <EcSig<(usize,)>>::split((CANCELED, 42));
    assert_eq!(lead, Leading::Code(CANCELED));
    assert_eq!(values, (42,));

    let (lead, values) = <ExSig<()>>::split((ExceptionPtr::null(),));
    assert_eq!(lead, Leading::Exception(ExceptionPtr::null()));
    assert_eq!(values, ());
}

#[test]
fn test_leading_failure() {
    use crate::error::{CANCELED, READY};

    assert!(Leading::None.into_failure().is_none());
    assert!(Leading::Code(READY).into_failure().is_none());
    match Leading::Code(CANCELED).into_failure() {
        Some(FutureError::System(err)) => assert_eq!(err.code(), CANCELED),
        other => panic!("{:?}", other),
    }
    assert!(Leading::Exception(ExceptionPtr::null()).into_failure().is_none());
    let ex = ExceptionPtr::new(SystemError(CANCELED));
    match Leading::Exception(ex.clone()).into_failure() {
        Some(FutureError::Exception(got)) => assert_eq!(got, ex),
        other => panic!("{:?}", other),
    }
}
