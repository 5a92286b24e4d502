//! The only genuine `Result`-style error in this crate: the Region Provider
//! boundary. The public allocator API never raises it — resource exhaustion
//! there is reported as a `NULL`/no-op, per the allocator's in-band error
//! contract.

/// Failure reported by a [`crate::region::RegionProvider`] when it cannot
/// satisfy a growth or shrink request.
#[derive(Debug, thiserror::Error)]
pub enum RegionError {
    #[error("region provider refused to grow the region by {requested} bytes")]
    GrowthRefused { requested: usize },
    #[error("region provider refused to shrink the region by {requested} bytes")]
    ShrinkRefused { requested: usize },
}
