use crate::error::AllocError;

use std::alloc::{self, Layout};
use std::any::Any;
use std::fmt;
use std::mem;
use std::ptr::NonNull;
use std::sync::Arc;

pub const DEFAULT_ALIGN: usize = 16;

/// Allocates `size` bytes aligned to `align` from the heap.
///
/// The memory must be released by `aligned_delete`.
#[cfg(unix)]
pub fn aligned_new(align: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
    let align = align.max(mem::size_of::<usize>()).next_power_of_two();
    let mut ptr: *mut libc::c_void = std::ptr::null_mut();
    let ret = unsafe { libc::posix_memalign(&mut ptr, align, size.max(1)) };
    if ret != 0 {
        return Err(AllocError { size: size, align: align });
    }
    NonNull::new(ptr as *mut u8).ok_or(AllocError { size: size, align: align })
}

#[cfg(windows)]
pub fn aligned_new(align: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
    let align = align.max(mem::size_of::<usize>()).next_power_of_two();
    let ptr = unsafe { libc::aligned_malloc(size.max(1), align) };
    NonNull::new(ptr as *mut u8).ok_or(AllocError { size: size, align: align })
}

#[cfg(unix)]
pub unsafe fn aligned_delete(ptr: NonNull<u8>) {
    libc::free(ptr.as_ptr() as *mut libc::c_void)
}

#[cfg(windows)]
pub unsafe fn aligned_delete(ptr: NonNull<u8>) {
    libc::aligned_free(ptr.as_ptr() as *mut libc::c_void)
}

/// Reports an allocation failure where no error can be returned, and aborts.
pub fn oom(err: AllocError) -> ! {
    tracing::error!(size = err.size, align = err.align, "out of memory");
    match err.layout() {
        Some(layout) => alloc::handle_alloc_error(layout),
        None => std::process::abort(),
    }
}

/// A memory allocator usable by handlers, promises and executor functions.
///
/// # Safety
///
/// `allocate` must return memory valid for `layout` until it is passed back
/// to `deallocate` with the same layout.
pub unsafe trait Allocator: Send + Sync + 'static {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError>;

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);

    #[doc(hidden)]
    fn as_any(&self) -> &dyn Any;

    /// Returns `true` if memory allocated by `self` can be freed by `other`.
    fn same_allocator(&self, other: &dyn Allocator) -> bool;
}

/// The global heap.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StdAllocator;

unsafe impl Allocator for StdAllocator {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        if layout.size() == 0 {
            return Ok(unsafe { NonNull::new_unchecked(layout.align() as *mut u8) });
        }
        let ptr = unsafe { alloc::alloc(layout) };
        NonNull::new(ptr).ok_or(AllocError {
            size: layout.size(),
            align: layout.align(),
        })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() != 0 {
            alloc::dealloc(ptr.as_ptr(), layout)
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn same_allocator(&self, other: &dyn Allocator) -> bool {
        other.as_any().is::<StdAllocator>()
    }
}

/// A cloneable, comparable handle to some `Allocator`.
#[derive(Clone)]
pub struct AnyAllocator(Arc<dyn Allocator>);

impl AnyAllocator {
    pub fn new<A: Allocator>(alloc: A) -> AnyAllocator {
        AnyAllocator(Arc::new(alloc))
    }

    pub fn downcast_ref<A: Allocator>(&self) -> Option<&A> {
        self.0.as_any().downcast_ref::<A>()
    }
}

impl Default for AnyAllocator {
    fn default() -> AnyAllocator {
        AnyAllocator::new(StdAllocator)
    }
}

unsafe impl Allocator for AnyAllocator {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        self.0.allocate(layout)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        self.0.deallocate(ptr, layout)
    }

    fn as_any(&self) -> &dyn Any {
        self.0.as_any()
    }

    fn same_allocator(&self, other: &dyn Allocator) -> bool {
        self.0.same_allocator(other)
    }
}

impl PartialEq for AnyAllocator {
    fn eq(&self, other: &AnyAllocator) -> bool {
        self.0.same_allocator(&*other.0)
    }
}

impl fmt::Debug for AnyAllocator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "AnyAllocator({:p})", Arc::as_ptr(&self.0) as *const u8)
    }
}

#[test]
fn test_aligned_new() {
    for &align in &[1, 8, 16, 64, 4096] {
        let ptr = aligned_new(align, 100).unwrap();
        assert_eq!(ptr.as_ptr() as usize % align, 0);
        unsafe { aligned_delete(ptr) };
    }
}

#[test]
fn test_std_allocator() {
    let layout = Layout::from_size_align(48, 8).unwrap();
    let ptr = StdAllocator.allocate(layout).unwrap();
    assert_eq!(ptr.as_ptr() as usize % 8, 0);
    unsafe { StdAllocator.deallocate(ptr, layout) };

    let empty = Layout::from_size_align(0, 4).unwrap();
    let ptr = StdAllocator.allocate(empty).unwrap();
    unsafe { StdAllocator.deallocate(ptr, empty) };
}

#[test]
fn test_any_allocator_eq() {
    let a = AnyAllocator::new(StdAllocator);
    let b = AnyAllocator::default();
    assert_eq!(a, b);
    assert!(a.downcast_ref::<StdAllocator>().is_some());
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counts {
        allocations: AtomicUsize,
        live: AtomicUsize,
    }

    /// Counts the blocks it hands out and refuses requests past `limit`.
    #[derive(Clone)]
    pub struct Counting {
        counts: Arc<Counts>,
        limit: usize,
    }

    impl Counting {
        pub fn new() -> Counting {
            Counting::with_limit(usize::MAX)
        }

        pub fn with_limit(limit: usize) -> Counting {
            Counting {
                counts: Arc::default(),
                limit: limit,
            }
        }

        pub fn allocations(&self) -> usize {
            self.counts.allocations.load(Ordering::SeqCst)
        }

        pub fn live(&self) -> usize {
            self.counts.live.load(Ordering::SeqCst)
        }
    }

    unsafe impl Allocator for Counting {
        fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
            if self.allocations() >= self.limit {
                return Err(AllocError {
                    size: layout.size(),
                    align: layout.align(),
                });
            }
            let ptr = StdAllocator.allocate(layout)?;
            self.counts.allocations.fetch_add(1, Ordering::SeqCst);
            self.counts.live.fetch_add(1, Ordering::SeqCst);
            Ok(ptr)
        }

        unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
            self.counts.live.fetch_sub(1, Ordering::SeqCst);
            StdAllocator.deallocate(ptr, layout)
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn same_allocator(&self, other: &dyn Allocator) -> bool {
            match other.as_any().downcast_ref::<Counting>() {
                Some(other) => Arc::ptr_eq(&self.counts, &other.counts),
                None => false,
            }
        }
    }
}
