use crate::error::AllocError;
use crate::memory::{aligned_delete, aligned_new};

use std::cell::RefCell;
use std::fmt;
use std::ptr::NonNull;

const fn parse_cache_size(var: Option<&str>, default: usize) -> usize {
    let bytes = match var {
        Some(s) => s.as_bytes(),
        None => return default,
    };
    if bytes.is_empty() {
        return default;
    }
    let mut n = 0;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b < b'0' || b > b'9' {
            return default;
        }
        n = n * 10 + (b - b'0') as usize;
        i += 1;
    }
    n
}

/// Number of cached blocks per category.
///
/// Set `ASYNCIO_RECYCLING_ALLOCATOR_CACHE_SIZE` at build time to override.
pub const RECYCLING_ALLOCATOR_CACHE_SIZE: usize =
    parse_cache_size(option_env!("ASYNCIO_RECYCLING_ALLOCATOR_CACHE_SIZE"), 2);

const CHUNK_SIZE: usize = 4;

const MAX_CHUNKS: usize = u8::MAX as usize;

/// A usage category of the recycling cache, owning the slot range `BEGIN..END`.
pub trait Purpose: Send + Sync + 'static {
    const NAME: &'static str;
    const BEGIN: usize;
    const END: usize;
}

/// General purpose allocations: handlers and promise states.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DefaultTag;

/// Coroutine frames.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct AwaitableFrameTag;

/// Type erased functions submitted to executors.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ExecutorFunctionTag;

impl Purpose for DefaultTag {
    const NAME: &'static str = "default";
    const BEGIN: usize = 0;
    const END: usize = Self::BEGIN + RECYCLING_ALLOCATOR_CACHE_SIZE;
}

impl Purpose for AwaitableFrameTag {
    const NAME: &'static str = "awaitable_frame";
    const BEGIN: usize = DefaultTag::END;
    const END: usize = Self::BEGIN + RECYCLING_ALLOCATOR_CACHE_SIZE;
}

impl Purpose for ExecutorFunctionTag {
    const NAME: &'static str = "executor_function";
    const BEGIN: usize = AwaitableFrameTag::END;
    const END: usize = Self::BEGIN + RECYCLING_ALLOCATOR_CACHE_SIZE;
}

const MAX_MEM_INDEX: usize = ExecutorFunctionTag::END;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Stats {
    pub heap_allocations: usize,
    pub heap_deallocations: usize,
    pub reused: usize,
}

/// Per-thread cache of recently freed memory blocks.
///
/// A cached block is tagged with its capacity in chunks and is only handed out
/// again for a request of the category it was released to. The cache is not
/// `Send`; it never leaves its thread.
pub struct ThreadInfo {
    reusable_memory: [Option<NonNull<u8>>; MAX_MEM_INDEX],
    stats: Stats,
}

thread_local! {
    static THREAD_INFO: RefCell<ThreadInfo> = RefCell::new(ThreadInfo::new());
}

impl ThreadInfo {
    pub fn new() -> ThreadInfo {
        ThreadInfo {
            reusable_memory: [None; MAX_MEM_INDEX],
            stats: Stats::default(),
        }
    }

    /// Runs `func` with the calling thread's cache.
    ///
    /// The cache is created on first use and freed when the thread exits.
    /// `func` receives `None` while the cache is torn down or already borrowed.
    pub fn with_current<F, R>(func: F) -> R
    where
        F: FnOnce(Option<&mut ThreadInfo>) -> R,
    {
        let mut func = Some(func);
        let res = THREAD_INFO.try_with(|cell| {
            let func = func.take()?;
            Some(match cell.try_borrow_mut() {
                Ok(mut this) => func(Some(&mut this)),
                Err(_) => func(None),
            })
        });
        match (res, func) {
            (Ok(Some(res)), _) => res,
            (_, Some(func)) => func(None),
            _ => unreachable!(),
        }
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// Returns the number of blocks currently cached for category `P`.
    pub fn cached<P: Purpose>(&self) -> usize {
        self.reusable_memory[P::BEGIN..P::END]
            .iter()
            .filter(|mem| mem.is_some())
            .count()
    }

    /// Allocates `size` bytes aligned to `align` for category `P`.
    ///
    /// Fails with `AllocError` if `align` is not a power of two, if `size`
    /// exceeds `isize::MAX`, or if the heap is exhausted. A failed request
    /// leaves the cache untouched.
    pub fn allocate<P: Purpose>(
        mut this: Option<&mut ThreadInfo>,
        size: usize,
        align: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        let err = AllocError { size: size, align: align };
        if !align.is_power_of_two() || size > isize::MAX as usize {
            return Err(err);
        }
        let chunks = size / CHUNK_SIZE + (size % CHUNK_SIZE != 0) as usize;
        let block_size = chunks
            .checked_mul(CHUNK_SIZE)
            .and_then(|n| n.checked_add(1))
            .ok_or(err)?;

        if let Some(ref mut this) = this {
            for mem_index in P::BEGIN..P::END {
                if let Some(ptr) = this.reusable_memory[mem_index] {
                    let mem = ptr.as_ptr();
                    if unsafe { *mem } as usize >= chunks && mem as usize % align == 0 {
                        this.reusable_memory[mem_index] = None;
                        unsafe { *mem.add(size) = *mem };
                        this.stats.reused += 1;
                        return Ok(ptr);
                    }
                }
            }
        }

        let ptr = aligned_new(align, block_size)?;
        unsafe {
            *ptr.as_ptr().add(size) = if chunks <= MAX_CHUNKS { chunks as u8 } else { 0 };
        }

        if let Some(this) = this {
            this.stats.heap_allocations += 1;
            for mem_index in P::BEGIN..P::END {
                if let Some(ptr) = this.reusable_memory[mem_index].take() {
                    tracing::trace!(category = P::NAME, slot = mem_index, "evict cached block");
                    unsafe { aligned_delete(ptr) };
                    this.stats.heap_deallocations += 1;
                    break;
                }
            }
        }
        Ok(ptr)
    }

    /// Releases a block obtained from `allocate::<P>` with the same `size`.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `allocate::<P>(_, size, _)` and not be used afterwards.
    pub unsafe fn deallocate<P: Purpose>(
        mut this: Option<&mut ThreadInfo>,
        ptr: NonNull<u8>,
        size: usize,
    ) {
        if size <= CHUNK_SIZE * MAX_CHUNKS {
            if let Some(ref mut this) = this {
                for mem_index in P::BEGIN..P::END {
                    if this.reusable_memory[mem_index].is_none() {
                        let mem = ptr.as_ptr();
                        *mem = *mem.add(size);
                        this.reusable_memory[mem_index] = Some(ptr);
                        return;
                    }
                }
            }
        }

        aligned_delete(ptr);
        if let Some(this) = this {
            this.stats.heap_deallocations += 1;
        }
    }
}

impl Default for ThreadInfo {
    fn default() -> ThreadInfo {
        ThreadInfo::new()
    }
}

impl Drop for ThreadInfo {
    fn drop(&mut self) {
        let mut freed = 0;
        for mem in self.reusable_memory.iter_mut() {
            if let Some(ptr) = mem.take() {
                unsafe { aligned_delete(ptr) };
                freed += 1;
            }
        }
        if freed > 0 {
            tracing::trace!(freed, "released recycling cache");
        }
    }
}

impl fmt::Debug for ThreadInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ThreadInfo")
            .field("default", &self.cached::<DefaultTag>())
            .field("awaitable_frame", &self.cached::<AwaitableFrameTag>())
            .field("executor_function", &self.cached::<ExecutorFunctionTag>())
            .field("stats", &self.stats)
            .finish()
    }
}

#[test]
fn test_parse_cache_size() {
    assert_eq!(parse_cache_size(None, 2), 2);
    assert_eq!(parse_cache_size(Some(""), 2), 2);
    assert_eq!(parse_cache_size(Some("16"), 2), 16);
    assert_eq!(parse_cache_size(Some("x1"), 2), 2);
}

#[test]
fn test_slot_ranges_are_disjoint() {
    assert_eq!(DefaultTag::BEGIN, 0);
    assert_eq!(DefaultTag::END, AwaitableFrameTag::BEGIN);
    assert_eq!(AwaitableFrameTag::END, ExecutorFunctionTag::BEGIN);
    assert_eq!(ExecutorFunctionTag::END, 3 * RECYCLING_ALLOCATOR_CACHE_SIZE);
}

#[test]
fn test_reuse_same_size() {
    let mut ti = ThreadInfo::new();
    let p1 = ThreadInfo::allocate::<DefaultTag>(Some(&mut ti), 24, 8).unwrap();
    unsafe { ThreadInfo::deallocate::<DefaultTag>(Some(&mut ti), p1, 24) };
    assert_eq!(ti.cached::<DefaultTag>(), 1);

    for _ in 0..100 {
        let p = ThreadInfo::allocate::<DefaultTag>(Some(&mut ti), 24, 8).unwrap();
        assert_eq!(p, p1);
        unsafe { ThreadInfo::deallocate::<DefaultTag>(Some(&mut ti), p, 24) };
    }
    assert_eq!(ti.stats().heap_allocations, 1);
    assert_eq!(ti.stats().heap_deallocations, 0);
    assert_eq!(ti.stats().reused, 100);
}

#[test]
fn test_smaller_request_reuses_larger_block() {
    let mut ti = ThreadInfo::new();
    let p1 = ThreadInfo::allocate::<DefaultTag>(Some(&mut ti), 64, 8).unwrap();
    unsafe { ThreadInfo::deallocate::<DefaultTag>(Some(&mut ti), p1, 64) };

    let p2 = ThreadInfo::allocate::<DefaultTag>(Some(&mut ti), 10, 8).unwrap();
    assert_eq!(p1, p2);
    unsafe { ThreadInfo::deallocate::<DefaultTag>(Some(&mut ti), p2, 10) };

    // the block still remembers its 16 chunks
    let p3 = ThreadInfo::allocate::<DefaultTag>(Some(&mut ti), 64, 8).unwrap();
    assert_eq!(p1, p3);
    unsafe { ThreadInfo::deallocate::<DefaultTag>(Some(&mut ti), p3, 64) };
    assert_eq!(ti.stats().heap_allocations, 1);
}

#[test]
fn test_larger_request_evicts() {
    let mut ti = ThreadInfo::new();
    let p1 = ThreadInfo::allocate::<DefaultTag>(Some(&mut ti), 8, 8).unwrap();
    unsafe { ThreadInfo::deallocate::<DefaultTag>(Some(&mut ti), p1, 8) };

    let p2 = ThreadInfo::allocate::<DefaultTag>(Some(&mut ti), 128, 8).unwrap();
    assert_eq!(ti.cached::<DefaultTag>(), 0);
    assert_eq!(ti.stats().heap_allocations, 2);
    assert_eq!(ti.stats().heap_deallocations, 1);
    unsafe { ThreadInfo::deallocate::<DefaultTag>(Some(&mut ti), p2, 128) };
}

#[test]
fn test_categories_do_not_share_blocks() {
    let mut ti = ThreadInfo::new();
    let p1 = ThreadInfo::allocate::<ExecutorFunctionTag>(Some(&mut ti), 32, 8).unwrap();
    unsafe { ThreadInfo::deallocate::<ExecutorFunctionTag>(Some(&mut ti), p1, 32) };
    assert_eq!(ti.cached::<ExecutorFunctionTag>(), 1);

    // a burst in another category never touches the executor function slots
    let mut ptrs = Vec::new();
    for _ in 0..8 {
        ptrs.push(ThreadInfo::allocate::<AwaitableFrameTag>(Some(&mut ti), 32, 8).unwrap());
    }
    for p in ptrs {
        unsafe { ThreadInfo::deallocate::<AwaitableFrameTag>(Some(&mut ti), p, 32) };
    }
    assert_eq!(ti.cached::<ExecutorFunctionTag>(), 1);
    assert_eq!(ti.cached::<AwaitableFrameTag>(), RECYCLING_ALLOCATOR_CACHE_SIZE);
    assert_eq!(ti.cached::<DefaultTag>(), 0);

    let p2 = ThreadInfo::allocate::<ExecutorFunctionTag>(Some(&mut ti), 32, 8).unwrap();
    assert_eq!(p1, p2);
    unsafe { ThreadInfo::deallocate::<ExecutorFunctionTag>(Some(&mut ti), p2, 32) };
}

#[test]
fn test_oversized_block_goes_to_heap() {
    let mut ti = ThreadInfo::new();
    let size = CHUNK_SIZE * MAX_CHUNKS + 1;
    let p = ThreadInfo::allocate::<DefaultTag>(Some(&mut ti), size, 8).unwrap();
    unsafe { ThreadInfo::deallocate::<DefaultTag>(Some(&mut ti), p, size) };
    assert_eq!(ti.cached::<DefaultTag>(), 0);
    assert_eq!(ti.stats().heap_deallocations, 1);
}

#[test]
fn test_alignment_mismatch_is_not_reused() {
    let mut ti = ThreadInfo::new();
    let mut p = ThreadInfo::allocate::<DefaultTag>(Some(&mut ti), 16, 8).unwrap();
    // find a block that is not 4096-aligned
    while p.as_ptr() as usize % 4096 == 0 {
        unsafe { ThreadInfo::deallocate::<DefaultTag>(None, p, 16) };
        p = ThreadInfo::allocate::<DefaultTag>(Some(&mut ti), 16, 8).unwrap();
    }
    unsafe { ThreadInfo::deallocate::<DefaultTag>(Some(&mut ti), p, 16) };

    let q = ThreadInfo::allocate::<DefaultTag>(Some(&mut ti), 16, 4096).unwrap();
    assert_ne!(p, q);
    assert_eq!(q.as_ptr() as usize % 4096, 0);
    unsafe { ThreadInfo::deallocate::<DefaultTag>(Some(&mut ti), q, 16) };
}

#[test]
fn test_invalid_layout_is_refused() {
    let mut ti = ThreadInfo::new();
    let p = ThreadInfo::allocate::<DefaultTag>(Some(&mut ti), 16, 8).unwrap();
    unsafe { ThreadInfo::deallocate::<DefaultTag>(Some(&mut ti), p, 16) };

    for &(size, align) in &[(usize::MAX, 8), (usize::MAX - 2, 8), (isize::MAX as usize + 1, 8), (16, 0), (16, 3)] {
        let err = ThreadInfo::allocate::<DefaultTag>(Some(&mut ti), size, align).unwrap_err();
        assert_eq!((err.size, err.align), (size, align));
    }
    assert_eq!(ti.cached::<DefaultTag>(), 1);
    assert_eq!(ti.stats().heap_allocations, 1);
    assert_eq!(ti.stats().reused, 0);

    assert!(ThreadInfo::allocate::<DefaultTag>(None, usize::MAX, 8).is_err());
}

#[test]
fn test_heap_exhaustion_keeps_cache() {
    let mut ti = ThreadInfo::new();
    let p = ThreadInfo::allocate::<DefaultTag>(Some(&mut ti), 16, 8).unwrap();
    unsafe { ThreadInfo::deallocate::<DefaultTag>(Some(&mut ti), p, 16) };

    let size = isize::MAX as usize - 64;
    let err = ThreadInfo::allocate::<DefaultTag>(Some(&mut ti), size, 8).unwrap_err();
    assert_eq!(err.size, size);
    assert_eq!(ti.cached::<DefaultTag>(), 1);
    assert_eq!(ti.stats().heap_deallocations, 0);

    // the cached block is still handed out
    let q = ThreadInfo::allocate::<DefaultTag>(Some(&mut ti), 16, 8).unwrap();
    assert_eq!(p, q);
    unsafe { ThreadInfo::deallocate::<DefaultTag>(Some(&mut ti), q, 16) };
}

#[test]
fn test_without_thread_info() {
    let p = ThreadInfo::allocate::<DefaultTag>(None, 40, 16).unwrap();
    assert_eq!(p.as_ptr() as usize % 16, 0);
    unsafe { ThreadInfo::deallocate::<DefaultTag>(None, p, 40) };
}

#[test]
fn test_with_current() {
    let (before, after) = std::thread::spawn(|| {
        let before = ThreadInfo::with_current(|ti| ti.unwrap().stats());
        let p = ThreadInfo::with_current(|ti| ThreadInfo::allocate::<DefaultTag>(ti, 20, 8)).unwrap();
        ThreadInfo::with_current(|ti| unsafe { ThreadInfo::deallocate::<DefaultTag>(ti, p, 20) });
        let after = ThreadInfo::with_current(|ti| {
            let ti = ti.unwrap();
            (ti.stats(), ti.cached::<DefaultTag>())
        });
        (before, after)
    })
    .join()
    .unwrap();
    assert_eq!(before, Stats::default());
    assert_eq!(after.0.heap_allocations, 1);
    assert_eq!(after.1, 1);
}

#[test]
fn test_nested_with_current_falls_back() {
    ThreadInfo::with_current(|outer| {
        assert!(outer.is_some());
        ThreadInfo::with_current(|inner| assert!(inner.is_none()));
    });
}
