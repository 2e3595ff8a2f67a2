//! Lock-free fork/join array algorithms with minimal synchronization
//! overhead.
//!
//! This crate provides two in-place parallel primitives over caller-owned
//! slices:
//! - [`parallel_prefix`]: inclusive prefix (scan) under an associative,
//!   not necessarily commutative, binary operator.
//! - [`parallel_sort`] / [`parallel_sort_by`]: stable merge sort backed by
//!   an equal-length workspace buffer.
//!
//! Both decompose a range problem into a tree of cooperating tasks
//! coordinated purely through atomic compare-and-swap state transitions:
//! no locks, and no blocking joins inside the computation itself. A task
//! either forks a sibling onto the scheduler or continues inline into the
//! other half of its range (a trampoline loop, not call-stack recursion);
//! completion propagates upward through CAS-protected registers whose bits
//! only ever advance, so each parent-level transition fires exactly once
//! regardless of scheduling.
//!
//! Key modules:
//! - `scan`: the parallel prefix engine and its task arena.
//! - `sort`: the parallel stable merge sort engine and its task arena.
//! - `policy`: decomposition-size defaults derived from the scheduler's
//!   parallelism hint.
//! - `state`: the atomic protocol primitives (monotonic phase word and
//!   completion counter), model-checked under the `loom` feature.
//!
//! Scheduling rides on [`rayon`]: forked tasks are spawned into an
//! `in_place_scope`, any worker may run any task, and the scope itself is
//! the one blocking join the calling thread performs. The two entry-point
//! families return only once the whole operation has completed; a panic in
//! the user operator or comparator is captured, wound down, and re-raised
//! on the calling thread exactly once, leaving the slice contents
//! unspecified.

/// The parallel prefix (scan) engine.
///
/// Two-pass scan with asymmetric completion: subrange totals propagate
/// upward, incoming aggregates are pushed back down, and nodes on the left
/// spine release their subtree early once it is fully summed.
pub mod scan;
/// The parallel stable merge sort engine.
///
/// Quaternary Sorter recursion plus binary-search-splitting Mergers,
/// sequenced by zero-work relay completers; stability is preserved by
/// always favoring the left run on ties.
pub mod sort;

/// Decomposition-size defaults (threshold and granularity policies).
pub mod policy;

mod fault;
mod span;
mod state;
mod sync;

pub use scan::{parallel_prefix, parallel_prefix_with_threshold};
pub use sort::{
    parallel_sort, parallel_sort_by, parallel_sort_by_with_granularity,
    parallel_sort_with_granularity,
};
