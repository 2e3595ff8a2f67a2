use core::cell::UnsafeCell;
use core::marker::PhantomData;
use derive_more::{Deref, DerefMut};

/// A minimal `UnsafeCell` wrapper that is `Sync` when `T: Sync`.
///
/// Used by the task arenas to enable interior mutability across threads
/// while correctness is ensured by the completion protocol (no concurrent
/// writers/readers on the same slot in conflicting phases).
#[derive(Deref, DerefMut)]
#[repr(transparent)]
pub(crate) struct SyncUnsafeCell<T>(UnsafeCell<T>);

unsafe impl<T: Sync> Sync for SyncUnsafeCell<T> {}

impl<T> SyncUnsafeCell<T> {
    pub(crate) fn new(val: T) -> Self {
        Self(UnsafeCell::new(val))
    }
}

/// Shared mutable view of a caller-owned buffer, handed to every task of an
/// operation.
///
/// Race freedom is structural rather than enforced here: at every moment,
/// each live task owns an index range disjoint from every other live task's
/// range within the same buffer, so element accesses never conflict. Each
/// call site states which protocol fact grants it access.
pub(crate) struct RawSpan<'a, T> {
    ptr: *mut T,
    len: usize,
    _marker: PhantomData<&'a mut [T]>,
}

impl<'a, T> RawSpan<'a, T> {
    pub(crate) fn new(data: &'a mut [T]) -> Self {
        Self {
            ptr: data.as_mut_ptr(),
            len: data.len(),
            _marker: PhantomData,
        }
    }

    /// # Safety
    ///
    /// `idx` must be in bounds and no task may be concurrently writing the
    /// element.
    #[inline]
    pub(crate) unsafe fn get(&self, idx: usize) -> &T {
        debug_assert!(idx < self.len, "RawSpan::get: [1]");
        // SAFETY: In bounds per the caller; the element is not under
        // concurrent mutation per the caller.
        unsafe { &*self.ptr.add(idx) }
    }

    /// # Safety
    ///
    /// `idx` must be in bounds and the calling task must own the element's
    /// range exclusively.
    #[inline]
    pub(crate) unsafe fn set(&self, idx: usize, val: T) {
        debug_assert!(idx < self.len, "RawSpan::set: [1]");
        // SAFETY: In bounds per the caller; exclusive ownership per the
        // caller. The previous element is dropped in place.
        unsafe { *self.ptr.add(idx) = val };
    }

    /// # Safety
    ///
    /// `lo <= hi <= len` and the calling task must own `[lo, hi)`
    /// exclusively for the lifetime of the returned slice.
    #[inline]
    pub(crate) unsafe fn slice_mut(&self, lo: usize, hi: usize) -> &mut [T] {
        debug_assert!(lo <= hi && hi <= self.len, "RawSpan::slice_mut: [1]");
        // SAFETY: Bounds and exclusivity per the caller.
        unsafe { core::slice::from_raw_parts_mut(self.ptr.add(lo), hi - lo) }
    }
}

impl<T> Clone for RawSpan<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for RawSpan<'_, T> {}

// SAFETY: The span is only ever used to touch elements whose range the
// current task owns; `T: Send` covers moving values across workers and
// `T: Sync` covers concurrent shared reads of already-published elements.
unsafe impl<T: Send + Sync> Send for RawSpan<'_, T> {}
unsafe impl<T: Send + Sync> Sync for RawSpan<'_, T> {}
