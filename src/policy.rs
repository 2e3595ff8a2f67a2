//! Decomposition-size defaults.
//!
//! These are empirical tuning values, not correctness contracts: any policy
//! bounding the task count to a small multiple of the available parallelism
//! behaves correctly. Both engines accept explicit overrides through the
//! `*_with_threshold` / `*_with_granularity` entry points.

/// Smallest subrange a scan task will ever be split down to.
pub const MIN_SCAN_PARTITION: usize = 16;

/// Smallest run the sort engine will hand to the sequential base sort by
/// default.
pub const MIN_SORT_GRANULARITY: usize = 1 << 13;

/// Default scan threshold: `len / (parallelism * 8)`, floored at
/// [`MIN_SCAN_PARTITION`].
pub fn scan_threshold(len: usize) -> usize {
    (len / (rayon::current_num_threads() << 3)).max(MIN_SCAN_PARTITION)
}

/// Default sort granularity: `len / (parallelism * 4)`, floored at
/// [`MIN_SORT_GRANULARITY`].
pub fn sort_granularity(len: usize) -> usize {
    (len / (rayon::current_num_threads() << 2)).max(MIN_SORT_GRANULARITY)
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn thresholds_never_degenerate() {
        assert_eq!(scan_threshold(0), MIN_SCAN_PARTITION);
        assert!(scan_threshold(1 << 24) >= MIN_SCAN_PARTITION);
        assert_eq!(sort_granularity(0), MIN_SORT_GRANULARITY);
        assert!(sort_granularity(1 << 28) >= MIN_SORT_GRANULARITY);
    }
}
