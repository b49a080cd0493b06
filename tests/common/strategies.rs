//! Proptest strategies for allocation invariants.

use proptest::prelude::*;

/// Inbound offsets in seconds for a batch of stock units; duplicates allowed.
pub fn inbound_offsets_strategy() -> impl Strategy<Value = Vec<i64>> {
    prop::collection::vec(0i64..20, 1..8)
}

/// Occupancy changes applied to a pallet.
pub fn occupancy_deltas_strategy() -> impl Strategy<Value = Vec<i64>> {
    prop::collection::vec(-3i64..=3, 1..30)
}

/// (pallet index, target location index) move requests.
pub fn move_requests_strategy(pallets: usize, locations: usize) -> impl Strategy<Value = Vec<(usize, usize)>> {
    prop::collection::vec((0..pallets, 0..locations), 1..40)
}
