//! Resource allocation for pallets, locations and stock units.

pub mod allocator;
pub mod errors;
pub mod locks;

pub use allocator::{PalletMove, ResourceAllocator};
pub use errors::{AllocationError, AllocationResult};
pub use locks::{LockTable, ResourceKey, ResourceLease};
