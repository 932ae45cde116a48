//! GPU memory arena bookkeeping
//!
//! CPU-side tracking of which byte ranges inside device buffers are in use. The
//! device itself never sees these structures; it only receives offsets.

pub mod interval_set;

pub use interval_set::{Interval, IntervalSet};

/// Errors raised when an interval operation breaks the caller contract
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum IntervalError {
    /// The range is not fully contained in a single free interval
    #[error("range [{offset}, +{size}) is not contained in one free interval")]
    NotFree {
        /// Start of the offending range
        offset: u64,
        /// Length of the offending range
        size: u64,
    },

    /// Part of the range is already free (double free)
    #[error("range [{offset}, +{size}) overlaps free space")]
    Overlap {
        /// Start of the offending range
        offset: u64,
        /// Length of the offending range
        size: u64,
    },

    /// The range extends past the end of the resource
    #[error("range [{offset}, +{size}) exceeds capacity {capacity}")]
    OutOfBounds {
        /// Start of the offending range
        offset: u64,
        /// Length of the offending range
        size: u64,
        /// Capacity of the set
        capacity: u64,
    },
}
