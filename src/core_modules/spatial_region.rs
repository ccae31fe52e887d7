// THEORY:
// A spatial region is the single currency of the pipeline: the region of
// interest, the initial segmentation, every computed feature and the final
// segmentation are all regions. The pipeline never looks inside one. It is
// generic over the representation `R` and only moves shared handles around.
//
// Regions are immutable once produced. A stage that wants a different region
// produces a new one. That makes pointer identity a complete change token: if
// two handles point at the same allocation, nothing about the region changed.

use crate::core_modules::modified_time::ModifiedTime;
use std::sync::Arc;

/// Shared, immutable handle to a region. The pipeline never assumes it is the
/// sole owner.
pub type SharedRegion<R> = Arc<R>;

/// Identity comparison of two optional regions. Content is never compared.
pub fn same_region<R>(a: Option<&SharedRegion<R>>, b: Option<&SharedRegion<R>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

/// The value published in the pipeline's output slot.
#[derive(Debug)]
pub struct DecoratedOutput<R> {
    /// The segmentation produced by the module.
    pub region: SharedRegion<R>,
    /// The successful update cycle that produced this region, starting at 1.
    pub cycle: u64,
    /// When the region was published.
    pub published_at: ModifiedTime,
}

impl<R> DecoratedOutput<R> {
    pub fn new(region: SharedRegion<R>, cycle: u64) -> Self {
        Self {
            region,
            cycle,
            published_at: ModifiedTime::now(),
        }
    }
}
