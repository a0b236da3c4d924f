//! # Shared engine types
//!
//! - [`Clock`] - the default time source, milliseconds since the Unix epoch
//! - [`SharedClock`] - a type-erased clock so tests can substitute a manual
//!   one without changing any engine signatures
//! - [`Ids`] - the identifier generator used for operations, targets and
//!   credential sessions

use std::sync::Arc;
use vaultops::{IdGenerator, MonotonicClock, TimeSource};

/// The system clock used for operation timestamps and backoff deadlines.
pub type Clock = MonotonicClock;

/// A clock shared between the engine, its stores and its ID generator.
pub type SharedClock = Arc<dyn TimeSource<u64> + Send + Sync>;

/// The identifier generator used across the engine.
pub type Ids = IdGenerator<SharedClock>;

/// Returns a [`SharedClock`] backed by [`Clock`].
pub fn system_clock() -> SharedClock {
    Arc::new(Clock::default())
}
