#![cfg(not(feature = "loom"))]

use fjarray::{parallel_prefix, parallel_prefix_with_threshold};
use proptest::prelude::*;

fn sequential_prefix<T: Clone>(data: &mut [T], op: impl Fn(&T, &T) -> T) {
    for i in 1..data.len() {
        data[i] = op(&data[i - 1], &data[i]);
    }
}

#[test]
fn running_sums_match_every_threshold() {
    let expected = [1u64, 3, 6, 10, 15, 21, 28, 36];
    for threshold in 1..=8 {
        let mut data: Vec<u64> = (1..=8).collect();
        parallel_prefix_with_threshold(&mut data, threshold, |a, b| a + b);
        assert_eq!(data, expected, "threshold {threshold}");
    }
}

#[test]
fn empty_and_singleton_are_untouched() {
    let mut empty: Vec<u32> = vec![];
    parallel_prefix(&mut empty, |a, b| a + b);
    assert!(empty.is_empty());

    let mut one = vec![7u32];
    parallel_prefix(&mut one, |a, b| a + b);
    assert_eq!(one, [7]);
}

#[test]
fn noncommutative_operator_keeps_left_to_right_order() {
    // String concatenation is associative but not commutative, so any
    // reassociation that reorders operands shows up immediately.
    let words = ["a", "b", "c", "d", "e", "f", "g", "h", "i", "j", "k"];
    for threshold in 1..=words.len() {
        let mut data: Vec<String> = words.iter().map(|w| (*w).to_owned()).collect();
        parallel_prefix_with_threshold(&mut data, threshold, |a, b| format!("{a}{b}"));
        let mut expected = String::new();
        for (word, prefix) in words.iter().zip(&data) {
            expected.push_str(word);
            assert_eq!(prefix, &expected, "threshold {threshold}");
        }
    }
}

#[test]
fn oversized_threshold_degrades_to_sequential() {
    let mut data: Vec<i64> = (0..100).map(|i| i * 3 - 50).collect();
    let mut expected = data.clone();
    sequential_prefix(&mut expected, |a, b| a + b);
    let threshold = data.len() + 1;
    parallel_prefix_with_threshold(&mut data, threshold, |a, b| a + b);
    assert_eq!(data, expected);
}

#[test]
fn operator_panic_surfaces_on_the_caller() {
    let mut data: Vec<u32> = (0..256).collect();
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        parallel_prefix_with_threshold(&mut data, 4, |a, b| {
            assert!(*b != 200, "poisoned element {b}");
            a + b
        });
    }));
    let payload = outcome.expect_err("the operator panic must propagate");
    let message = payload
        .downcast_ref::<String>()
        .expect("panic payload should be the assertion message");
    assert!(message.contains("poisoned element"));
}

proptest! {
    #[test]
    fn prefixes_match_the_sequential_fold(
        mut data in proptest::collection::vec(any::<i64>(), 0..500),
        threshold in 1usize..64,
    ) {
        let mut expected = data.clone();
        sequential_prefix(&mut expected, |a, b| a.wrapping_add(*b));
        parallel_prefix_with_threshold(&mut data, threshold, |a, b| a.wrapping_add(*b));
        prop_assert_eq!(data, expected);
    }

    #[test]
    fn threshold_never_changes_the_result(
        data in proptest::collection::vec(any::<u32>(), 2..200),
    ) {
        let mut reference = data.clone();
        parallel_prefix_with_threshold(&mut reference, 1, |a, b| a.wrapping_mul(*b));
        for threshold in [2usize, 3, 7, 16, data.len()] {
            let mut run = data.clone();
            parallel_prefix_with_threshold(&mut run, threshold, |a, b| a.wrapping_mul(*b));
            prop_assert_eq!(&run, &reference, "threshold {}", threshold);
        }
    }
}
