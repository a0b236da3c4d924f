/// A result type for fallible identifier and token parsing.
///
/// Generation itself is infallible; only decoding user-supplied strings can
/// fail.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// All errors `vaultops` can produce while decoding identifiers or tokens.
#[derive(Clone, Debug, PartialEq, Eq, Hash, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The encoded portion does not have the expected fixed length.
    #[error("invalid length: expected {expected} characters, found {found}")]
    DecodeInvalidLen {
        /// Required number of characters.
        expected: usize,
        /// Number of characters actually supplied.
        found: usize,
    },

    /// A character outside the Crockford Base32 alphabet was found.
    #[error("invalid character {byte:#04x} at index {index}")]
    DecodeInvalidAscii {
        /// The offending byte.
        byte: u8,
        /// Position of the byte in the encoded string.
        index: usize,
    },

    /// The encoded value does not fit in 128 bits (first character > `7`).
    #[error("encoded value overflows 128 bits")]
    DecodeOverflow,

    /// The identifier's kind tag is missing or does not match.
    #[error("expected `{expected}_` prefix, found `{found}`")]
    TagMismatch {
        /// Tag required by the target type.
        expected: &'static str,
        /// The input that failed to match.
        found: String,
    },
}
