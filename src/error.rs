use std::alloc::Layout;
use std::any::Any;
use std::error::Error;
use std::fmt;
use std::io;
use std::sync::Arc;

use errno::Errno;

/// An error code reported by an asynchronous operation.
///
/// The zero value means success; anything else is a failure.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct ErrorCode(Errno);

impl ErrorCode {
    pub const fn new(code: i32) -> ErrorCode {
        ErrorCode(Errno(code))
    }

    pub fn last_os_error() -> ErrorCode {
        ErrorCode(errno::errno())
    }

    pub fn value(&self) -> i32 {
        (self.0).0
    }

    /// Returns `true` if this code is a failure.
    pub fn is_err(&self) -> bool {
        self.value() != 0
    }

    pub fn into_result(self) -> Result<(), SystemError> {
        if self.is_err() {
            Err(SystemError(self))
        } else {
            Ok(())
        }
    }
}

impl Default for ErrorCode {
    fn default() -> ErrorCode {
        READY
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ErrorCode({}: {})", self.value(), self.0)
    }
}

impl From<io::Error> for ErrorCode {
    fn from(err: io::Error) -> ErrorCode {
        ErrorCode::new(err.raw_os_error().unwrap_or(libc::EIO))
    }
}

pub const READY: ErrorCode = ErrorCode::new(0);
pub const CANCELED: ErrorCode = ErrorCode::new(libc::ECANCELED);
pub const WOULD_BLOCK: ErrorCode = ErrorCode::new(libc::EWOULDBLOCK);
pub const CONNECTION_REFUSED: ErrorCode = ErrorCode::new(libc::ECONNREFUSED);
pub const TIMED_OUT: ErrorCode = ErrorCode::new(libc::ETIMEDOUT);

/// An error constructed from a failing `ErrorCode`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[error("{0}")]
pub struct SystemError(pub ErrorCode);

impl SystemError {
    pub fn code(&self) -> ErrorCode {
        self.0
    }
}

impl From<SystemError> for io::Error {
    fn from(err: SystemError) -> io::Error {
        io::Error::from_raw_os_error(err.0.value())
    }
}

/// A nullable, shareable pointer to an error raised while producing a result.
#[derive(Clone, Default)]
pub struct ExceptionPtr(Option<Arc<dyn Error + Send + Sync>>);

impl ExceptionPtr {
    pub fn null() -> ExceptionPtr {
        ExceptionPtr(None)
    }

    pub fn new<E>(err: E) -> ExceptionPtr
    where
        E: Error + Send + Sync + 'static,
    {
        ExceptionPtr(Some(Arc::new(err)))
    }

    pub fn is_null(&self) -> bool {
        self.0.is_none()
    }

    pub fn get(&self) -> Option<&(dyn Error + Send + Sync + 'static)> {
        self.0.as_ref().map(|err| &**err)
    }
}

impl PartialEq for ExceptionPtr {
    fn eq(&self, other: &ExceptionPtr) -> bool {
        match (&self.0, &other.0) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for ExceptionPtr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.0 {
            Some(ref err) => write!(f, "ExceptionPtr({})", err),
            None => write!(f, "ExceptionPtr(null)"),
        }
    }
}

/// The memory allocator could not satisfy a request.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[error("memory allocation of {size} bytes (align {align}) failed")]
pub struct AllocError {
    pub size: usize,
    pub align: usize,
}

impl AllocError {
    /// The layout of the failed request, if it is a valid one.
    pub fn layout(&self) -> Option<Layout> {
        Layout::from_size_align(self.size, self.align).ok()
    }
}

/// The failure reported by a `Future`.
#[derive(Clone, Debug, thiserror::Error)]
pub enum FutureError {
    #[error("operation failed: {0}")]
    System(#[from] SystemError),

    #[error("operation raised: {0:?}")]
    Exception(ExceptionPtr),

    #[error("completion function panicked: {0}")]
    Panicked(String),

    #[error("broken promise")]
    BrokenPromise,

    #[error(transparent)]
    Alloc(#[from] AllocError),
}

impl FutureError {
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> FutureError {
        let msg = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_owned()
        };
        FutureError::Panicked(msg)
    }
}

#[test]
fn test_error_code() {
    assert!(!READY.is_err());
    assert!(CANCELED.is_err());
    assert_eq!(ErrorCode::default(), READY);
    assert_eq!(CANCELED.into_result(), Err(SystemError(CANCELED)));
    assert_eq!(READY.into_result(), Ok(()));
}

#[test]
fn test_error_code_from_io() {
    let err = io::Error::from_raw_os_error(libc::ECONNREFUSED);
    assert_eq!(ErrorCode::from(err), CONNECTION_REFUSED);
    let err: io::Error = SystemError(TIMED_OUT).into();
    assert_eq!(err.raw_os_error(), Some(libc::ETIMEDOUT));
}

#[test]
fn test_exception_ptr() {
    let null = ExceptionPtr::null();
    assert!(null.is_null());
    assert!(null.get().is_none());

    let ex = ExceptionPtr::new(SystemError(CANCELED));
    assert!(!ex.is_null());
    assert_eq!(ex, ex.clone());
    assert_ne!(ex, ExceptionPtr::new(SystemError(CANCELED)));
    assert_eq!(ex.get().unwrap().to_string(), SystemError(CANCELED).to_string());
}

#[test]
fn test_future_error_from_panic() {
    let err = FutureError::from_panic(Box::new("boom"));
    match err {
        FutureError::Panicked(ref msg) => assert_eq!(msg, "boom"),
        _ => panic!("{:?}", err),
    }
    let err = FutureError::from_panic(Box::new(String::from("bang")));
    match err {
        FutureError::Panicked(ref msg) => assert_eq!(msg, "bang"),
        _ => panic!("{:?}", err),
    }
}
