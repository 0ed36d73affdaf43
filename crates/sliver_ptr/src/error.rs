use thiserror::Error;

// -----------------------------------------------------------------------------
// Error

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum OffsetError {
    #[error("address {address:#x} is outside the displacement window of base {base:#x}")]
    OutOfWindow { address: usize, base: usize },

    #[error("maximum number of segments exceeded ({capacity} in use)")]
    SegmentsExhausted { capacity: usize },
}
