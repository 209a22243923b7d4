//! Memory manager error types

use thiserror::Error;

/// Errors surfaced by the fallible allocation and configuration paths.
///
/// The infallible entry points (`alloc`, `alloc_managed`, `alloc_object`)
/// treat every one of these as fatal and panic.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MmError {
    /// The OS refused to hand out a new chunk
    #[error("out of memory: failed to reserve a {requested} byte chunk")]
    OutOfMemory {
        /// Bytes requested from the page allocator
        requested: usize,
    },

    /// Requested slot size is at or above the size-class ceiling
    #[error("allocation of {size} bytes exceeds the {ceiling} byte item ceiling")]
    OversizedAllocation {
        /// Requested size
        size: usize,
        /// Maximum item size (exclusive)
        ceiling: usize,
    },

    /// Requested slot size is zero or not a multiple of the slot alignment
    #[error("allocation size {0} is not a non-zero multiple of 16")]
    MisalignedSize(usize),

    /// An environment override could not be parsed
    #[error("invalid value {value:?} for {key}")]
    InvalidConfig {
        /// Environment variable name
        key: &'static str,
        /// Raw value found
        value: String,
    },
}

/// Result type for memory manager operations
pub type MmResult<T> = std::result::Result<T, MmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = MmError::OversizedAllocation {
            size: 272,
            ceiling: 256,
        };
        assert_eq!(
            err.to_string(),
            "allocation of 272 bytes exceeds the 256 byte item ceiling"
        );

        let err = MmError::InvalidConfig {
            key: "V4_MM_CHUNK_SIZE",
            value: "lots".to_string(),
        };
        assert_eq!(err.to_string(), "invalid value \"lots\" for V4_MM_CHUNK_SIZE");
    }
}
