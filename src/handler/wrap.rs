use crate::handler::Handler;

use std::sync::Arc;

/// A handler that passes a shared `Arc<T>` before the completion arguments.
pub struct ArcHandler<T, F> {
    data: Arc<T>,
    handler: F,
}

macro_rules! arc_handler_impl {
    ($($name:ident),*) => {
        impl<T, F, $($name),*> Handler<($($name,)*)> for ArcHandler<T, F>
        where
            T: Send + Sync + 'static,
            F: FnOnce(Arc<T>, $($name),*) + Send + 'static,
        {
            #[allow(non_snake_case)]
            fn complete(self, args: ($($name,)*)) {
                let ArcHandler { data, handler } = self;
                let ($($name,)*) = args;
                handler(data, $($name),*)
            }
        }
    };
}

arc_handler_impl!();
arc_handler_impl!(A);
arc_handler_impl!(A, B);
arc_handler_impl!(A, B, C);
arc_handler_impl!(A, B, C, D);

/// Provides a `Arc` handler to asynchronous operation.
///
/// # Examples
///
/// ```
/// use std::sync::{Arc, Mutex};
/// use asyncio::{wrap, ErrorCode, Handler};
///
/// fn on_read(buf: Arc<Mutex<Vec<u8>>>, ec: ErrorCode, len: usize) {
///     if !ec.is_err() {
///         buf.lock().unwrap().truncate(len);
///     }
/// }
///
/// let buf = Arc::new(Mutex::new(vec![0; 16]));
/// wrap(on_read, &buf).complete((ErrorCode::default(), 4usize));
/// assert_eq!(buf.lock().unwrap().len(), 4);
/// ```
pub fn wrap<T, F>(handler: F, data: &Arc<T>) -> ArcHandler<T, F> {
    ArcHandler {
        data: data.clone(),
        handler: handler,
    }
}

#[test]
fn test_wrap() {
    use std::sync::Mutex;

    let data = Arc::new(Mutex::new(0));
    wrap(|d: Arc<Mutex<i32>>, n: i32| *d.lock().unwrap() += n, &data).complete((5,));
    wrap(|d: Arc<Mutex<i32>>| *d.lock().unwrap() += 1, &data).complete(());
    assert_eq!(*data.lock().unwrap(), 6);
    assert_eq!(Arc::strong_count(&data), 1);
}
