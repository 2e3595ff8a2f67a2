//! Parallel prefix (scan) over a mutable slice.
//!
//! Computes, in place, the inclusive prefixes `a[i] = a[0] ⊕ ... ⊕ a[i]` of
//! an associative (not necessarily commutative) operator, using a tree of
//! range tasks coordinated purely through monotonic CAS phase transitions.
//! No task ever blocks on a child: decomposition forks one half and loops
//! inline into the other, and completion is propagated upward by whichever
//! sibling reports second.
//!
//! The protocol is a two-pass scan with asymmetric completion:
//! 1. Leaves reduce their subrange and report `SUMMED` upward; a parent's
//!    total is folded by the second child to report.
//! 2. Nodes on the left spine release `CUMULATE` early for their subtree as
//!    soon as it is fully summed; the release pushes per-child incoming
//!    aggregates down the tree, leaves fold them through their subrange in
//!    place, and `FINISHED` mirrors the upward propagation.
//!
//! Phase bits only ever advance, which is what makes each parent-level
//! transition fire exactly once regardless of scheduling (see
//! [`crate::state::Phase`]).

use crate::fault::FaultSlot;
use crate::policy;
use crate::span::{RawSpan, SyncUnsafeCell};
use crate::state::{Phase, CUMULATE, FINISHED, SUMMED};
use core::sync::atomic::{AtomicUsize, Ordering};
use rayon::Scope;
use rustc_hash::FxHashMap;

/// Compute in place the inclusive prefixes of `data` under `op`, in
/// parallel, with the default decomposition threshold.
///
/// `op` must be associative; it need not be commutative and needs no
/// identity element. The output order is the exact left-to-right sequential
/// application order, independent of task scheduling.
///
/// If `op` panics, the panic resurfaces on the calling thread and the slice
/// contents are left unspecified.
pub fn parallel_prefix<T, F>(data: &mut [T], op: F)
where
    T: Clone + Send + Sync,
    F: Fn(&T, &T) -> T + Sync,
{
    let threshold = policy::scan_threshold(data.len());
    parallel_prefix_with_threshold(data, threshold, op);
}

/// [`parallel_prefix`] with an explicit sequential-fallback threshold.
///
/// Subranges of at most `threshold` elements are processed sequentially;
/// `threshold >= data.len()` therefore runs fully sequentially, and a
/// threshold of zero is clamped to one. The result is identical for every
/// threshold.
pub fn parallel_prefix_with_threshold<T, F>(data: &mut [T], threshold: usize, op: F)
where
    T: Clone + Send + Sync,
    F: Fn(&T, &T) -> T + Sync,
{
    if data.len() <= 1 {
        // Empty ranges are a no-op and a single element is its own prefix.
        return;
    }
    let threshold = threshold.max(1);
    let arena = ScanArena::new(data, threshold, &op);
    let root = arena.alloc(0, arena.fence, None);
    rayon::in_place_scope(|scope| arena.run(scope, root));
    arena.finish();
}

/// One node of the scan task tree.
struct ScanNode<T> {
    phase: Phase,
    slot: SyncUnsafeCell<ScanSlot<T>>,
}

struct ScanSlot<T> {
    lo: usize,
    hi: usize,
    parent: Option<usize>,
    left: Option<usize>,
    right: Option<usize>,
    /// Aggregate of everything left of `lo`; written by the parent's
    /// cumulate push, absent for leftmost nodes.
    carry_in: Option<T>,
    /// Aggregate of this node's own subrange; absent only for the rightmost
    /// top-level remainder, whose total is never consumed.
    total: Option<T>,
}

impl<T> ScanSlot<T> {
    fn vacant() -> Self {
        Self {
            lo: 0,
            hi: 0,
            parent: None,
            left: None,
            right: None,
            carry_in: None,
            total: None,
        }
    }
}

/// Arena of scan task records, addressed by index handle.
///
/// Slots are preallocated to the exact tree size and claimed by a cursor
/// `fetch_add`; nodes are created lazily the first time a subtree is
/// visited, never upfront.
struct ScanArena<'a, T, F> {
    nodes: Vec<ScanNode<T>>,
    cursor: AtomicUsize,
    data: RawSpan<'a, T>,
    op: &'a F,
    /// End of the whole problem range (`origin` is always zero for slices).
    fence: usize,
    threshold: usize,
    fault: FaultSlot,
}

impl<'a, T, F> ScanArena<'a, T, F>
where
    T: Clone + Send + Sync,
    F: Fn(&T, &T) -> T + Sync,
{
    fn new(data: &'a mut [T], threshold: usize, op: &'a F) -> Self {
        let fence = data.len();
        let capacity = tree_capacity(fence, threshold);
        let nodes = (0..capacity)
            .map(|_| ScanNode {
                phase: Phase::new(),
                slot: SyncUnsafeCell::new(ScanSlot::vacant()),
            })
            .collect();
        Self {
            nodes,
            cursor: AtomicUsize::new(0),
            data: RawSpan::new(data),
            op,
            fence,
            threshold,
            fault: FaultSlot::new(),
        }
    }

    /// Claim a fresh node for `[lo, hi)`. Panics on arena exhaustion, which
    /// would mean the capacity precomputation is wrong.
    fn alloc(&self, lo: usize, hi: usize, parent: Option<usize>) -> usize {
        let handle = self.cursor.fetch_add(1, Ordering::Relaxed);
        assert!(handle < self.nodes.len(), "ScanArena::alloc: [1]");
        // SAFETY: The slot was just claimed and its handle has not been
        // published to any other task yet.
        unsafe {
            *self.slot(handle) = ScanSlot {
                lo,
                hi,
                parent,
                left: None,
                right: None,
                carry_in: None,
                total: None,
            };
        }
        handle
    }

    #[inline]
    fn slot(&self, handle: usize) -> *mut ScanSlot<T> {
        self.nodes[handle].slot.get()
    }

    #[inline]
    fn phase(&self, handle: usize) -> &Phase {
        &self.nodes[handle].phase
    }

    /// Task entry point: runs `compute` under the operation's fault slot so
    /// an operator panic becomes the exceptional completion of the whole
    /// operation.
    fn run<'s>(&'s self, scope: &Scope<'s>, handle: usize) {
        self.fault.guard(|| self.compute(scope, handle));
    }

    fn fork<'s>(&'s self, scope: &Scope<'s>, handle: usize) {
        scope.spawn(move |scope| self.run(scope, handle));
    }

    fn finish(self) {
        self.fault.rethrow();
    }

    /// The trampoline: a loop over the current handle, never call-stack
    /// recursion, so decomposition depth costs no stack.
    #[allow(clippy::too_many_lines)]
    fn compute<'s>(&'s self, scope: &Scope<'s>, handle: usize) {
        let op = self.op;
        let mut t = handle;
        loop {
            // SAFETY: Bounds are written at allocation and immutable after.
            let (lo, hi) = unsafe {
                let slot = &*self.slot(t);
                (slot.lo, slot.hi)
            };
            if hi - lo > self.threshold {
                // SAFETY: Child links are written only by this node's first
                // visit, which happens-before any revisit (a node is only
                // released to cumulate once its subtree is fully summed).
                let children = unsafe {
                    let slot = &*self.slot(t);
                    slot.left.zip(slot.right)
                };
                let Some((left, right)) = children else {
                    // First visit: partition. Fork the right half, loop
                    // inline into the left.
                    let mid = (lo + hi) >> 1;
                    let right = self.alloc(mid, hi, Some(t));
                    let left = self.alloc(lo, mid, Some(t));
                    // SAFETY: Only this task writes the links, before any
                    // other task can reach this node (the right child is
                    // forked below, after the write).
                    unsafe {
                        let slot = &mut *self.slot(t);
                        slot.left = Some(left);
                        slot.right = Some(right);
                    }
                    self.fork(scope, right);
                    t = left;
                    continue;
                };

                // Revisit: this node's CUMULATE bit is set and its subtree
                // is fully summed. Push incoming aggregates to the children
                // and release them.
                //
                // SAFETY: `carry_in` of this node was published before its
                // CUMULATE release; the left child's total was published
                // before the subtree reported SUMMED. Neither is written
                // again.
                let (pin, left_total) = unsafe {
                    let slot = &*self.slot(t);
                    let left_slot = &*self.slot(left);
                    (
                        slot.carry_in.clone(),
                        left_slot
                            .total
                            .clone()
                            .expect("ScanArena::compute: [1]"),
                    )
                };
                let right_in = if lo == 0 {
                    left_total
                } else {
                    let pin = pin.as_ref().expect("ScanArena::compute: [2]");
                    op(pin, &left_total)
                };
                // SAFETY: Each carry slot has exactly one writer (this push)
                // and its reader runs only after observing the CUMULATE bit
                // set below. Leftmost children never carry an incoming
                // aggregate and their slot stays untouched, so a left-spine
                // child that released itself never races this write.
                unsafe {
                    (*self.slot(right)).carry_in = Some(right_in);
                    if lo != 0 {
                        (*self.slot(left)).carry_in = pin;
                    }
                }
                let mut next = None;
                let mut forked = None;
                if self.phase(right).set_once(CUMULATE) {
                    next = Some(right);
                }
                if self.phase(left).set_once(CUMULATE) {
                    forked = next.take();
                    next = Some(left);
                }
                let Some(next) = next else {
                    // Both children were already released elsewhere.
                    return;
                };
                if let Some(forked) = forked {
                    self.fork(scope, forked);
                }
                t = next;
            } else {
                // Leaf-sized range: establish which passes this visit owns.
                let phase = self.phase(t);
                let mut word = phase.get();
                let action = loop {
                    if word & FINISHED != 0 {
                        return; // nothing left to do here
                    }
                    let action = if word & CUMULATE != 0 {
                        FINISHED
                    } else if lo > 0 {
                        SUMMED
                    } else {
                        // Leftmost leaf: no predecessor, so summing and
                        // cumulating coincide.
                        SUMMED | FINISHED
                    };
                    match phase.try_advance(word, action) {
                        Ok(()) => break action,
                        Err(actual) => word = actual,
                    }
                };

                if action != SUMMED {
                    // Cumulate pass: fold the incoming aggregate through the
                    // subrange, writing inclusive prefixes in place.
                    //
                    // SAFETY (all span accesses below): this task owns
                    // [lo, hi) exclusively for the duration of the pass;
                    // sibling ranges are disjoint by construction.
                    let (mut acc, first) = if lo == 0 {
                        (unsafe { self.data.get(0) }.clone(), 1)
                    } else {
                        let carried = unsafe { (*self.slot(t)).carry_in.clone() };
                        (carried.expect("ScanArena::compute: [3]"), lo)
                    };
                    for i in first..hi {
                        acc = op(&acc, unsafe { self.data.get(i) });
                        unsafe { self.data.set(i, acc.clone()) };
                    }
                    // SAFETY: The total has a single writer (this task) and
                    // is read only after the SUMMED/FINISHED report below.
                    unsafe { (*self.slot(t)).total = Some(acc) };
                } else if hi < self.fence {
                    // Sum pass. The rightmost top-level remainder's total is
                    // never consumed and is skipped outright.
                    //
                    // SAFETY: As above; the sum pass only reads [lo, hi).
                    let mut acc = unsafe { self.data.get(lo) }.clone();
                    for i in lo + 1..hi {
                        acc = op(&acc, unsafe { self.data.get(i) });
                    }
                    // SAFETY: Single writer, read only after the report.
                    unsafe { (*self.slot(t)).total = Some(acc) };
                }

                self.propagate(scope, t, action);
                return;
            }
        }
    }

    /// Climb the tree reporting `state` bits. Whichever sibling reports a
    /// bit second performs the parent-level transition; the first parks its
    /// bit and stops.
    fn propagate<'s>(&'s self, scope: &Scope<'s>, mut t: usize, mut state: u8) {
        loop {
            // SAFETY: Parent links are written at allocation, never again.
            let parent = unsafe { (*self.slot(t)).parent };
            let Some(parent) = parent else {
                // Root reached: the enclosing scope is the join point, so
                // nothing more to signal.
                return;
            };
            let phase = self.phase(parent);
            let mut word = phase.get();
            loop {
                if word & state & FINISHED != 0 {
                    // The sibling subtree already finished, so the parent's
                    // whole subtree is done: keep climbing.
                    t = parent;
                    break;
                }
                if word & state & SUMMED != 0 {
                    // Second SUMMED report: fold the children's totals into
                    // the parent and, on the left spine, release the parent
                    // to cumulate its subtree early.
                    //
                    // SAFETY: Both totals were published before the SUMMED
                    // reports this task has observed (its own in program
                    // order, the sibling's through the Acquire load of the
                    // parent's phase word). The parent's links and bounds
                    // are immutable since partition.
                    let (left, right, parent_lo) = unsafe {
                        let slot = &*self.slot(parent);
                        (
                            slot.left.expect("ScanArena::propagate: [1]"),
                            slot.right.expect("ScanArena::propagate: [2]"),
                            slot.lo,
                        )
                    };
                    let total = unsafe {
                        let left_total = (*self.slot(left))
                            .total
                            .clone()
                            .expect("ScanArena::propagate: [3]");
                        let right_slot = &*self.slot(right);
                        if right_slot.hi == self.fence {
                            // The rightmost remainder's total is unused.
                            left_total
                        } else {
                            let right_total = right_slot
                                .total
                                .as_ref()
                                .expect("ScanArena::propagate: [4]");
                            (self.op)(&left_total, right_total)
                        }
                    };
                    // SAFETY: Single writer (the transition owner); readers
                    // observe it only through the CAS below.
                    unsafe { (*self.slot(parent)).total = Some(total) };

                    let release = if word & CUMULATE == 0 && parent_lo == 0 {
                        CUMULATE
                    } else {
                        0
                    };
                    match phase.try_advance(word, state | release) {
                        Ok(()) => {
                            if release != 0 {
                                self.fork(scope, parent);
                            }
                            state = SUMMED;
                            t = parent;
                            break;
                        }
                        Err(actual) => {
                            word = actual;
                            continue;
                        }
                    }
                }
                // First report of this bit at the parent: park it and let
                // the sibling resume the climb.
                match phase.try_advance(word, state) {
                    Ok(()) => return,
                    Err(actual) => word = actual,
                }
            }
        }
    }
}

/// Exact node count of the scan tree over `len` elements: ranges split at
/// their midpoint until they fit the threshold. Memoized on range length
/// (both halves of a split depend only on the length).
fn tree_capacity(len: usize, threshold: usize) -> usize {
    fn count(len: usize, threshold: usize, memo: &mut FxHashMap<usize, usize>) -> usize {
        if len <= threshold {
            return 1;
        }
        if let Some(&cached) = memo.get(&len) {
            return cached;
        }
        let half = len >> 1;
        let total = 1 + count(half, threshold, memo) + count(len - half, threshold, memo);
        memo.insert(len, total);
        total
    }
    count(len, threshold, &mut FxHashMap::default())
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::tree_capacity;

    #[test]
    fn capacity_matches_hand_counts() {
        // One sequential leaf.
        assert_eq!(tree_capacity(8, 8), 1);
        assert_eq!(tree_capacity(5, 100), 1);
        // 8 elements, threshold 4: root + two leaves.
        assert_eq!(tree_capacity(8, 4), 3);
        // 8 elements, threshold 1: full binary tree over 8 leaves.
        assert_eq!(tree_capacity(8, 1), 15);
        // Uneven split: [0,5) -> [0,2) + [2,5) -> ...
        assert_eq!(tree_capacity(5, 2), 5);
    }

    #[test]
    fn capacity_counts_every_allocation() {
        // Mirror the allocation recursion directly on a few shapes.
        fn walk(len: usize, threshold: usize) -> usize {
            if len <= threshold {
                return 1;
            }
            let half = len >> 1;
            1 + walk(half, threshold) + walk(len - half, threshold)
        }
        for len in [2usize, 3, 7, 16, 31, 100, 257] {
            for threshold in [1usize, 2, 3, 5, 16] {
                assert_eq!(tree_capacity(len, threshold), walk(len, threshold));
            }
        }
    }
}
