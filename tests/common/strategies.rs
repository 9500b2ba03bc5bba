use proptest::prelude::*;

/// Filter outcomes along a path from the root to a target worker
pub fn filter_path_strategy() -> impl Strategy<Value = Vec<bool>> {
    prop::collection::vec(any::<bool>(), 0..8)
}

/// Filter outcome of the target worker itself
pub fn target_filter_strategy() -> impl Strategy<Value = bool> {
    prop_oneof![3 => Just(true), 1 => Just(false)]
}
