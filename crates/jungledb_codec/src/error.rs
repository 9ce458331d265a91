//! Error types for the JungleDB codec.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur while encoding or decoding record values.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The input ended before a complete value was decoded.
    #[error("unexpected end of input at offset {offset}")]
    UnexpectedEof {
        /// Offset at which more data was expected.
        offset: usize,
    },

    /// An unknown type tag was encountered.
    #[error("unknown type tag {tag:#04x} at offset {offset}")]
    UnknownTag {
        /// The offending tag byte.
        tag: u8,
        /// Offset of the tag.
        offset: usize,
    },

    /// A text segment was not valid UTF-8.
    #[error("invalid UTF-8 in text at offset {offset}")]
    InvalidUtf8 {
        /// Offset of the text payload.
        offset: usize,
    },

    /// Input contained data past the end of the encoded value.
    #[error("trailing bytes after value: {remaining} byte(s) left")]
    TrailingBytes {
        /// Number of undecoded bytes.
        remaining: usize,
    },

    /// A declared length exceeds the remaining input.
    #[error("declared length {declared} exceeds remaining input {remaining}")]
    LengthOverflow {
        /// Length declared by the header.
        declared: u64,
        /// Bytes actually remaining.
        remaining: usize,
    },
}
