mod mono;

pub use mono::*;

use crate::Ulid;

/// Represents the result of attempting to generate a new ULID.
///
/// - [`IdGenStatus::Ready`] indicates a new ID was successfully generated.
/// - [`IdGenStatus::Pending`] means the generator cannot produce an ordered ID
///   until the clock advances by `yield_for` milliseconds.
///
/// This allows non-blocking generation loops and clean backoff strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdGenStatus {
    /// A unique ID was generated and is ready to use.
    Ready {
        /// The generated ID.
        id: Ulid,
    },
    /// The random space for the current millisecond is exhausted, or the
    /// clock moved backwards.
    Pending {
        /// Milliseconds to wait before trying again.
        yield_for: u64,
    },
}
