//! Parallel stable merge sort over a mutable slice.
//!
//! Sorts in place using an equal-length workspace buffer, decomposing into
//! a quaternary tree of Sorter tasks stitched together by Merger tasks and
//! lightweight relay/placeholder completers. The quartering (rather than
//! halving) fixes the buffer role-swap per recursion level so the final
//! merged output always lands back in the caller's buffer, never stranded
//! in the workspace. The invariant holds by construction; there is no
//! runtime check.
//!
//! Merging is itself parallel: the larger run is bisected at its midpoint
//! element, the smaller run is binary-searched for the complementary split
//! point (ties land after the probe so the left run always wins), and the
//! high sub-merge is forked while the task loops on the low one. Each
//! merger counts its forked sub-merges on its [`Pending`] register and
//! completes toward its parent only once the last one has arrived.
//!
//! The sequential base cases are opaque collaborators: `<[T]>::sort_by`
//! below the granularity, and a plain two-finger stable merge once both
//! runs fit it.

use crate::fault::FaultSlot;
use crate::policy;
use crate::span::{RawSpan, SyncUnsafeCell};
use crate::state::Pending;
use core::cmp::Ordering;
use core::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use rayon::Scope;
use rustc_hash::FxHashMap;

/// Stably sort `data` in place, in parallel, with the default granularity.
///
/// Equal elements keep their original relative order. Sorting allocates a
/// workspace clone of the input; if the comparison panics, the panic
/// resurfaces on the calling thread and the slice contents are left
/// unspecified.
pub fn parallel_sort<T>(data: &mut [T])
where
    T: Ord + Clone + Send + Sync,
{
    parallel_sort_by(data, T::cmp);
}

/// Stably sort `data` in place with a caller-supplied comparator.
pub fn parallel_sort_by<T, C>(data: &mut [T], cmp: C)
where
    T: Clone + Send + Sync,
    C: Fn(&T, &T) -> Ordering + Sync,
{
    let granularity = policy::sort_granularity(data.len());
    parallel_sort_by_with_granularity(data, granularity, cmp);
}

/// [`parallel_sort`] with an explicit sequential-fallback granularity.
pub fn parallel_sort_with_granularity<T>(data: &mut [T], granularity: usize)
where
    T: Ord + Clone + Send + Sync,
{
    parallel_sort_by_with_granularity(data, granularity, T::cmp);
}

/// [`parallel_sort_by`] with an explicit sequential-fallback granularity.
///
/// Runs of at most `granularity` elements are handed to the sequential
/// stable sort; a granularity of zero is clamped to one. The result is
/// identical for every granularity, including `granularity >= data.len()`
/// which runs fully sequentially without building any task tree.
pub fn parallel_sort_by_with_granularity<T, C>(data: &mut [T], granularity: usize, cmp: C)
where
    T: Clone + Send + Sync,
    C: Fn(&T, &T) -> Ordering + Sync,
{
    let granularity = granularity.max(1);
    let len = data.len();
    if len <= granularity {
        data.sort_by(|lhs, rhs| cmp(lhs, rhs));
        return;
    }
    // The workspace contents are never read before being written; cloning
    // the input just keeps the buffer initialized.
    let mut workspace = data.to_vec();
    let arena = SortArena::new(data, &mut workspace, granularity, &cmp);
    let root = arena.alloc(
        0,
        SortKind::Sorter {
            parent: None,
            base: 0,
            size: len,
            wbase: 0,
        },
    );
    rayon::in_place_scope(|scope| arena.run(scope, root));
    arena.finish();
}

/// Which buffer a merger reads its runs from; it writes the other one.
#[derive(Clone, Copy)]
enum Source {
    Main,
    Work,
}

#[derive(Clone, Copy)]
struct MergeJob {
    parent: Option<usize>,
    source: Source,
    lbase: usize,
    lsize: usize,
    rbase: usize,
    rsize: usize,
    wbase: usize,
}

enum SortKind {
    Vacant,
    Sorter {
        parent: Option<usize>,
        base: usize,
        size: usize,
        wbase: usize,
    },
    Merger(MergeJob),
    /// Zero-work node holding an artificial dependency count of one; on
    /// satisfaction it runs the bound deferred merge inline. Exists only to
    /// sequence "both inputs done, now merge them" without the merger
    /// knowing its predecessor count in advance.
    Relay { body: usize },
    /// Zero-work continuation target interposed so the inline-continued
    /// first quarter completes toward the right relay.
    Placeholder { parent: usize },
}

struct SortNode {
    pending: Pending,
    kind: SyncUnsafeCell<SortKind>,
}

/// Arena of sort task records, addressed by index handle. Records are
/// created and destroyed within a single sort invocation, never persisted.
struct SortArena<'a, T, C> {
    nodes: Vec<SortNode>,
    cursor: AtomicUsize,
    main: RawSpan<'a, T>,
    work: RawSpan<'a, T>,
    cmp: &'a C,
    granularity: usize,
    fault: FaultSlot,
}

impl<'a, T, C> SortArena<'a, T, C>
where
    T: Clone + Send + Sync,
    C: Fn(&T, &T) -> Ordering + Sync,
{
    fn new(data: &'a mut [T], workspace: &'a mut [T], granularity: usize, cmp: &'a C) -> Self {
        assert_eq!(data.len(), workspace.len(), "SortArena::new: [1]");
        let capacity = arena_capacity(data.len(), granularity);
        let nodes = (0..capacity)
            .map(|_| SortNode {
                pending: Pending::new(0),
                kind: SyncUnsafeCell::new(SortKind::Vacant),
            })
            .collect();
        Self {
            nodes,
            cursor: AtomicUsize::new(0),
            main: RawSpan::new(data),
            work: RawSpan::new(workspace),
            cmp,
            granularity,
            fault: FaultSlot::new(),
        }
    }

    /// Claim a fresh node. Panics on arena exhaustion, which would mean the
    /// capacity bound is wrong.
    fn alloc(&self, pending: u32, kind: SortKind) -> usize {
        let handle = self.cursor.fetch_add(1, AtomicOrdering::Relaxed);
        assert!(handle < self.nodes.len(), "SortArena::alloc: [1]");
        for _ in 0..pending {
            self.nodes[handle].pending.bump();
        }
        // SAFETY: The slot was just claimed and its handle has not been
        // published to any other task yet. Kinds are immutable afterwards.
        unsafe { *self.kind(handle) = kind };
        handle
    }

    #[inline]
    fn kind(&self, handle: usize) -> *mut SortKind {
        self.nodes[handle].kind.get()
    }

    /// Task entry point for forked nodes: dispatches on the node kind under
    /// the operation's fault slot.
    fn run<'s>(&'s self, scope: &Scope<'s>, handle: usize) {
        self.fault.guard(|| {
            // SAFETY: Kinds are written at allocation, before the fork that
            // leads here, and never rewritten.
            match unsafe { &*self.kind(handle) } {
                SortKind::Sorter { .. } => self.sort_task(scope, handle),
                SortKind::Merger(_) => self.merge(scope, handle),
                SortKind::Vacant | SortKind::Relay { .. } | SortKind::Placeholder { .. } => {
                    unreachable!("SortArena::run: [1]")
                }
            }
        });
    }

    fn fork<'s>(&'s self, scope: &Scope<'s>, handle: usize) {
        scope.spawn(move |scope| self.run(scope, handle));
    }

    fn finish(self) {
        self.fault.rethrow();
    }

    /// The quaternary Sorter recursion, as an inline trampoline: per level,
    /// fork sorters for quarters four, three, and two, wire up the two
    /// quarter-pair merges and the half merge through relays, and loop into
    /// the first quarter.
    fn sort_task<'s>(&'s self, scope: &Scope<'s>, handle: usize) {
        // SAFETY: Kinds are immutable after allocation.
        let (mut base, mut size, mut wbase) = match unsafe { &*self.kind(handle) } {
            SortKind::Sorter {
                base, size, wbase, ..
            } => (*base, *size, *wbase),
            _ => unreachable!("SortArena::sort_task: [1]"),
        };
        let granularity = self.granularity;
        // Completion target of the inline-continued first quarter.
        let mut cont = handle;
        while size > granularity {
            let half = size >> 1;
            let quarter = half >> 1;
            let upper = half + quarter;
            // Halves, merged from the workspace back into place; completes
            // toward the current continuation target.
            let final_merge = self.alloc(
                0,
                SortKind::Merger(MergeJob {
                    parent: Some(cont),
                    source: Source::Work,
                    lbase: wbase,
                    lsize: half,
                    rbase: wbase + half,
                    rsize: size - half,
                    wbase: base,
                }),
            );
            let final_relay = self.alloc(1, SortKind::Relay { body: final_merge });
            // Quarters three and four, merged into the workspace.
            let upper_merge = self.alloc(
                0,
                SortKind::Merger(MergeJob {
                    parent: Some(final_relay),
                    source: Source::Main,
                    lbase: base + half,
                    lsize: quarter,
                    rbase: base + upper,
                    rsize: size - upper,
                    wbase: wbase + half,
                }),
            );
            let upper_relay = self.alloc(1, SortKind::Relay { body: upper_merge });
            let fourth = self.alloc(
                0,
                SortKind::Sorter {
                    parent: Some(upper_relay),
                    base: base + upper,
                    size: size - upper,
                    wbase: wbase + upper,
                },
            );
            self.fork(scope, fourth);
            let third = self.alloc(
                0,
                SortKind::Sorter {
                    parent: Some(upper_relay),
                    base: base + half,
                    size: quarter,
                    wbase: wbase + half,
                },
            );
            self.fork(scope, third);
            // Quarters one and two, merged into the workspace.
            let lower_merge = self.alloc(
                0,
                SortKind::Merger(MergeJob {
                    parent: Some(final_relay),
                    source: Source::Main,
                    lbase: base,
                    lsize: quarter,
                    rbase: base + quarter,
                    rsize: half - quarter,
                    wbase,
                }),
            );
            let lower_relay = self.alloc(1, SortKind::Relay { body: lower_merge });
            let second = self.alloc(
                0,
                SortKind::Sorter {
                    parent: Some(lower_relay),
                    base: base + quarter,
                    size: half - quarter,
                    wbase: wbase + quarter,
                },
            );
            self.fork(scope, second);
            cont = self.alloc(0, SortKind::Placeholder { parent: lower_relay });
            size = quarter;
        }
        // Base case: the opaque sequential stable sort.
        //
        // SAFETY: This task owns [base, base + size) of the main buffer
        // exclusively; sibling ranges are disjoint by construction.
        let run = unsafe { self.main.slice_mut(base, base + size) };
        run.sort_by(|lhs, rhs| (self.cmp)(lhs, rhs));
        self.try_complete(scope, cont);
    }

    /// Record one completion at `handle` and cascade: the arrival that
    /// finds a pending count of zero fires the node's completion (relays
    /// run their deferred merge inline) and continues at its parent.
    fn try_complete<'s>(&'s self, scope: &Scope<'s>, mut handle: usize) {
        loop {
            if !self.nodes[handle].pending.arrive() {
                return;
            }
            // SAFETY: Kinds are immutable after allocation.
            let parent = match unsafe { &*self.kind(handle) } {
                SortKind::Sorter { parent, .. } | SortKind::Merger(MergeJob { parent, .. }) => {
                    *parent
                }
                SortKind::Placeholder { parent } => Some(*parent),
                SortKind::Relay { body } => {
                    // Both inputs of the deferred merge are in place.
                    self.merge(scope, *body);
                    None
                }
                SortKind::Vacant => unreachable!("SortArena::try_complete: [1]"),
            };
            match parent {
                Some(parent) => handle = parent,
                None => return,
            }
        }
    }

    /// Merge two sorted runs of the source buffer into the destination,
    /// splitting and forking while either run exceeds the granularity.
    fn merge<'s>(&'s self, scope: &Scope<'s>, handle: usize) {
        // SAFETY: Kinds are immutable after allocation.
        let job = match unsafe { &*self.kind(handle) } {
            SortKind::Merger(job) => *job,
            _ => unreachable!("SortArena::merge: [1]"),
        };
        let (src, dst) = match job.source {
            Source::Main => (self.main, self.work),
            Source::Work => (self.work, self.main),
        };
        let cmp = self.cmp;
        let granularity = self.granularity;
        let MergeJob {
            lbase,
            mut lsize,
            rbase,
            mut rsize,
            wbase,
            ..
        } = job;
        // Split loop: bisect the larger run at its midpoint element, binary
        // search the smaller run for the complementary split, fork the high
        // sub-merge and keep resolving the low one here. One fork per split
        // level bounds the task count while this task drains the chain.
        //
        // SAFETY (all source reads below): both runs are fully sorted and
        // published before this merger is released, and no live task writes
        // them while it merges.
        loop {
            let (lsplit, rsplit);
            if lsize >= rsize {
                if lsize <= granularity {
                    break;
                }
                lsplit = lsize >> 1;
                let probe = unsafe { src.get(lbase + lsplit) };
                // First right-run position whose element is not `<= probe`:
                // ties land after the probe, so the left run stays first.
                let mut lo = 0;
                let mut hi = rsize;
                while lo < hi {
                    let mid = (lo + hi) >> 1;
                    if cmp(probe, unsafe { src.get(rbase + mid) }) != Ordering::Greater {
                        hi = mid;
                    } else {
                        lo = mid + 1;
                    }
                }
                rsplit = hi;
            } else {
                if rsize <= granularity {
                    break;
                }
                rsplit = rsize >> 1;
                let probe = unsafe { src.get(rbase + rsplit) };
                // First left-run position whose element is not `<= probe`.
                let mut lo = 0;
                let mut hi = lsize;
                while lo < hi {
                    let mid = (lo + hi) >> 1;
                    if cmp(unsafe { src.get(lbase + mid) }, probe) != Ordering::Greater {
                        lo = mid + 1;
                    } else {
                        hi = mid;
                    }
                }
                lsplit = lo;
            }
            let sub = self.alloc(
                0,
                SortKind::Merger(MergeJob {
                    parent: Some(handle),
                    source: job.source,
                    lbase: lbase + lsplit,
                    lsize: lsize - lsplit,
                    rbase: rbase + rsplit,
                    rsize: rsize - rsplit,
                    wbase: wbase + lsplit + rsplit,
                }),
            );
            lsize = lsplit;
            rsize = rsplit;
            self.nodes[handle].pending.bump();
            self.fork(scope, sub);
        }

        // Sequential stable merge; on ties always take from the left run.
        //
        // SAFETY: This task owns [wbase, wbase + lsize + rsize) of the
        // destination exclusively; the complementary sub-merges write the
        // complementary destination range.
        unsafe {
            let mut left = lbase;
            let left_end = lbase + lsize;
            let mut right = rbase;
            let right_end = rbase + rsize;
            let mut out = wbase;
            while left < left_end && right < right_end {
                if cmp(src.get(left), src.get(right)) != Ordering::Greater {
                    dst.set(out, src.get(left).clone());
                    left += 1;
                } else {
                    dst.set(out, src.get(right).clone());
                    right += 1;
                }
                out += 1;
            }
            while left < left_end {
                dst.set(out, src.get(left).clone());
                left += 1;
                out += 1;
            }
            while right < right_end {
                dst.set(out, src.get(right).clone());
                right += 1;
                out += 1;
            }
        }
        self.try_complete(scope, handle);
    }
}

/// Upper bound on the number of task records one sort invocation can
/// allocate. Sorter-tree allocations are counted exactly (ten records per
/// trampoline level); merge splitting is data-dependent, so it is bounded
/// by the fact that every split halves a run longer than the granularity,
/// giving at most `2 * run_total / granularity` splits per merge.
fn arena_capacity(len: usize, granularity: usize) -> usize {
    fn merge_bound(total: usize, granularity: usize) -> usize {
        2 * total.div_ceil(granularity) + 4
    }
    fn count(size: usize, granularity: usize, memo: &mut FxHashMap<usize, usize>) -> usize {
        if size <= granularity {
            return 0;
        }
        if let Some(&cached) = memo.get(&size) {
            return cached;
        }
        let half = size >> 1;
        let quarter = half >> 1;
        let upper = half + quarter;
        let total = 10
            + merge_bound(half, granularity)
            + merge_bound(size - half, granularity)
            + merge_bound(size, granularity)
            + count(size - upper, granularity, memo)
            + count(quarter, granularity, memo)
            + count(half - quarter, granularity, memo)
            + count(quarter, granularity, memo);
        memo.insert(size, total);
        total
    }
    1 + count(len, granularity, &mut FxHashMap::default())
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::arena_capacity;

    #[test]
    fn capacity_is_trivial_below_granularity() {
        assert_eq!(arena_capacity(100, 100), 1);
        assert_eq!(arena_capacity(0, 1), 1);
    }

    #[test]
    fn capacity_grows_with_forced_parallelism() {
        let coarse = arena_capacity(1 << 12, 1 << 10);
        let fine = arena_capacity(1 << 12, 8);
        assert!(coarse > 1);
        assert!(fine > coarse);
    }

    #[test]
    fn capacity_covers_each_trampoline_level() {
        // One level over 32 elements at granularity 8 allocates exactly
        // ten sorter-tree records plus whatever the three merges split.
        let bound = arena_capacity(32, 8);
        assert!(bound >= 1 + 10);
    }
}
