use crate::error::AllocError;
use crate::memory::Allocator;
use crate::thread_info::{DefaultTag, Purpose, ThreadInfo};

use std::alloc::Layout;
use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;

/// An allocator backed by the calling thread's recycling cache for category `P`.
///
/// Memory may be released on a different thread than it was allocated on; the
/// block then lands in the releasing thread's cache.
pub struct RecyclingAllocator<P = DefaultTag> {
    _marker: PhantomData<P>,
}

impl<P: Purpose> RecyclingAllocator<P> {
    pub fn new() -> RecyclingAllocator<P> {
        RecyclingAllocator {
            _marker: PhantomData,
        }
    }
}

impl<P> Clone for RecyclingAllocator<P> {
    fn clone(&self) -> RecyclingAllocator<P> {
        RecyclingAllocator {
            _marker: PhantomData,
        }
    }
}

impl<P> Copy for RecyclingAllocator<P> {}

impl<P: Purpose> Default for RecyclingAllocator<P> {
    fn default() -> RecyclingAllocator<P> {
        RecyclingAllocator::new()
    }
}

impl<P> PartialEq for RecyclingAllocator<P> {
    fn eq(&self, _: &RecyclingAllocator<P>) -> bool {
        true
    }
}

impl<P: Purpose> fmt::Debug for RecyclingAllocator<P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "RecyclingAllocator<{}>", P::NAME)
    }
}

unsafe impl<P: Purpose> Allocator for RecyclingAllocator<P> {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        ThreadInfo::with_current(|this| ThreadInfo::allocate::<P>(this, layout.size(), layout.align()))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        ThreadInfo::with_current(|this| ThreadInfo::deallocate::<P>(this, ptr, layout.size()))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn same_allocator(&self, other: &dyn Allocator) -> bool {
        other.as_any().is::<RecyclingAllocator<P>>()
    }
}

#[test]
fn test_recycling_allocator() {
    use crate::thread_info::Stats;

    std::thread::spawn(|| {
        let alloc = RecyclingAllocator::<DefaultTag>::new();
        let layout = Layout::from_size_align(40, 8).unwrap();
        let p1 = alloc.allocate(layout).unwrap();
        unsafe { alloc.deallocate(p1, layout) };
        let p2 = alloc.allocate(layout).unwrap();
        assert_eq!(p1, p2);
        unsafe { alloc.deallocate(p2, layout) };

        let stats = ThreadInfo::with_current(|ti| ti.unwrap().stats());
        assert_eq!(
            stats,
            Stats {
                heap_allocations: 1,
                heap_deallocations: 0,
                reused: 1,
            }
        );
    })
    .join()
    .unwrap();
}

#[test]
fn test_recycling_allocator_identity() {
    use crate::memory::{AnyAllocator, StdAllocator};
    use crate::thread_info::ExecutorFunctionTag;

    let a = AnyAllocator::new(RecyclingAllocator::<DefaultTag>::new());
    let b = AnyAllocator::new(RecyclingAllocator::<DefaultTag>::new());
    let c = AnyAllocator::new(RecyclingAllocator::<ExecutorFunctionTag>::new());
    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_ne!(a, AnyAllocator::new(StdAllocator));
}

#[test]
fn test_recycling_allocator_failure() {
    use crate::thread_info::ExecutorFunctionTag;

    std::thread::spawn(|| {
        let alloc = RecyclingAllocator::<ExecutorFunctionTag>::new();
        let small = Layout::from_size_align(24, 8).unwrap();
        let p = alloc.allocate(small).unwrap();
        unsafe { alloc.deallocate(p, small) };

        let huge = Layout::from_size_align(isize::MAX as usize - 64, 8).unwrap();
        let err = alloc.allocate(huge).unwrap_err();
        assert_eq!(err.layout(), Some(huge));
        ThreadInfo::with_current(|ti| assert_eq!(ti.unwrap().cached::<ExecutorFunctionTag>(), 1));

        let q = alloc.allocate(small).unwrap();
        assert_eq!(p, q);
        unsafe { alloc.deallocate(q, small) };
    })
    .join()
    .unwrap();
}
