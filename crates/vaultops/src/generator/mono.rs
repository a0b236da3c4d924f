use crate::{IdGenStatus, RandSource, TimeSource, Ulid};
use core::cmp::Ordering;
use parking_lot::Mutex;
#[cfg(feature = "tracing")]
use tracing::instrument;

/// A lock-based *monotonic* ULID generator suitable for multi-threaded
/// environments.
///
/// ## Features
/// - ✅ Thread-safe
/// - ✅ Probabilistically unique (no coordination required)
/// - ✅ Time-ordered (monotonically increasing per millisecond)
///
/// IDs generated within the same millisecond increment the random part of
/// the previous ID instead of drawing fresh randomness, so every ID handed out
/// by one generator sorts strictly after the ones before it.
pub struct MonoUlidGenerator<T, R>
where
    T: TimeSource<u64>,
    R: RandSource<u128>,
{
    state: Mutex<Ulid>,
    time: T,
    rng: R,
}

impl<T, R> MonoUlidGenerator<T, R>
where
    T: TimeSource<u64>,
    R: RandSource<u128>,
{
    /// Creates a new [`MonoUlidGenerator`] with the provided time source and
    /// RNG.
    ///
    /// # Example
    /// ```
    /// use vaultops::{IdGenStatus, MonoUlidGenerator, MonotonicClock, ThreadRandom, Ulid};
    ///
    /// let generator = MonoUlidGenerator::new(MonotonicClock::default(), ThreadRandom);
    ///
    /// let id: Ulid = loop {
    ///     match generator.next_id() {
    ///         IdGenStatus::Ready { id } => break id,
    ///         IdGenStatus::Pending { .. } => std::thread::yield_now(),
    ///     }
    /// };
    /// ```
    pub fn new(time: T, rng: R) -> Self {
        Self::from_components(0, 0, time, rng)
    }

    /// Creates a new generator preloaded with explicit state.
    ///
    /// Useful for restoring state or for tests that need to start at a known
    /// point. Prefer [`Self::new`] otherwise.
    pub fn from_components(timestamp: u64, random: u128, time: T, rng: R) -> Self {
        Self {
            state: Mutex::new(Ulid::from_components(timestamp, random)),
            time,
            rng,
        }
    }

    /// Attempts to generate a new ULID.
    ///
    /// # Returns
    /// - `IdGenStatus::Ready { id }`: A new ID is available
    /// - `IdGenStatus::Pending { yield_for }`: The time to wait (in
    ///   milliseconds) before trying again
    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip(self)))]
    pub fn next_id(&self) -> IdGenStatus {
        let now = self.time.current_millis();
        let mut id = self.state.lock();
        let current_ts = id.timestamp();

        match now.cmp(&current_ts) {
            Ordering::Equal => {
                if id.has_random_room() {
                    *id = id.increment_random();
                    IdGenStatus::Ready { id: *id }
                } else {
                    IdGenStatus::Pending { yield_for: 1 }
                }
            }
            Ordering::Greater => {
                let rand = self.rng.rand();
                *id = id.rollover_to_timestamp(now, rand);
                IdGenStatus::Ready { id: *id }
            }
            Ordering::Less => Self::cold_clock_behind(now, current_ts),
        }
    }

    /// Generates a new ULID, yielding the thread while the generator is
    /// pending.
    ///
    /// Pending only happens when 2^80 IDs were drawn in one millisecond or the
    /// clock moved backwards, so in practice this returns on the first try.
    pub fn generate(&self) -> Ulid {
        loop {
            match self.next_id() {
                IdGenStatus::Ready { id } => break id,
                IdGenStatus::Pending { .. } => std::thread::yield_now(),
            }
        }
    }

    #[cold]
    #[inline(never)]
    fn cold_clock_behind(now: u64, current_ts: u64) -> IdGenStatus {
        #[cfg(feature = "tracing")]
        tracing::warn!(now, current_ts, "clock moved backwards, holding ID generation");
        IdGenStatus::Pending {
            yield_for: current_ts - now,
        }
    }
}
