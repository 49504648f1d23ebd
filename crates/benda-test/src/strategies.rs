//! Property-based testing strategies for benda programs.
//!
//! Strategies produce host [`Value`]s shaped like the types declared by
//! [`crate::programs`], along with the reference result a test can compare
//! compiled code against.
//!
//! # Examples
//!
//! ```rust,ignore
//! use benda_test::strategies::*;
//! use proptest::prelude::*;
//!
//! proptest! {
//!     #[test]
//!     fn test_sum(tree in arb_tree(6)) {
//!         // Your test here
//!     }
//! }
//! ```

use benda_lang::{Uint, Value};
use proptest::prelude::*;

use crate::programs::{leaf, list, node};

pub const U24_MASK: u64 = (1 << 24) - 1;

/// Integers that fit in 24 bits.
pub fn arb_u24() -> impl Strategy<Value = u64> {
    0..=U24_MASK
}

/// Integers of any width, for exercising the wrap to 24 bits.
pub fn arb_wide_int() -> impl Strategy<Value = u64> {
    any::<u64>()
}

/// Trees of at most `max_depth` levels with 24-bit leaves.
pub fn arb_tree(max_depth: u32) -> impl Strategy<Value = Value> {
    arb_u24().prop_map(leaf).prop_recursive(max_depth, 1 << max_depth.min(8), 2, |inner| {
        (inner.clone(), inner).prop_map(|(left, right)| node(left, right))
    })
}

/// A tree paired with the wrapped sum of its leaves.
pub fn arb_tree_with_sum(max_depth: u32) -> impl Strategy<Value = (Value, u64)> {
    arb_tree(max_depth).prop_map(|tree| {
        let sum = leaf_sum(&tree);
        (tree, sum)
    })
}

/// Lists of up to `max_len` 24-bit items, with their items.
pub fn arb_list(max_len: usize) -> impl Strategy<Value = (Value, Vec<u64>)> {
    prop::collection::vec(arb_u24(), 0..=max_len).prop_map(|items| (list(&items), items))
}

/// Arguments for `gen_tree`: a small depth and any 24-bit seed.
pub fn arb_gen_tree_args() -> impl Strategy<Value = (u64, u64)> {
    (0u64..=10, arb_u24())
}

/// Sum of every `Leaf` in `tree`, wrapped to 24 bits.
///
/// Walks with an explicit stack so it agrees with compiled code on deep
/// trees.
pub fn leaf_sum(tree: &Value) -> u64 {
    let mut sum = 0u64;
    let mut pending = vec![tree];
    while let Some(value) = pending.pop() {
        let Some(record) = value.as_record() else {
            continue;
        };
        match record.fields.as_slice() {
            [Value::Uint(n)] => sum = sum.wrapping_add(n.value()),
            [left, right] => {
                pending.push(right);
                pending.push(left);
            }
            _ => {}
        }
    }
    sum & Uint::mask(24)
}
