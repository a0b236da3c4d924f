use rand::{Rng, RngCore, rng};

/// A trait for random sources.
///
/// This abstraction allows you to plug in a real random source or a mocked
/// random source in tests.
///
/// # Example
/// ```
/// use vaultops::RandSource;
///
/// struct FixedRand;
/// impl RandSource<u128> for FixedRand {
///     fn rand(&self) -> u128 {
///         1234
///     }
/// }
///
/// let rng = FixedRand;
/// assert_eq!(rng.rand(), 1234);
/// ```
pub trait RandSource<T> {
    /// Returns a random value.
    fn rand(&self) -> T;
}

/// A `RandSource` that uses the thread-local RNG (`rand::rng()`).
///
/// The thread-local RNG is cryptographically secure (ChaCha-based) and
/// reseeded periodically. This type does not store the RNG, so it is `Send`,
/// `Sync` and free to clone.
///
/// If the operating system's entropy source fails, the underlying RNG panics.
/// There is no safe way to keep issuing identifiers or tokens in that state.
#[derive(Default, Clone, Copy, Debug)]
pub struct ThreadRandom;

impl RandSource<u64> for ThreadRandom {
    fn rand(&self) -> u64 {
        rng().random()
    }
}

impl RandSource<u128> for ThreadRandom {
    fn rand(&self) -> u128 {
        rng().random()
    }
}

impl<const N: usize> RandSource<[u8; N]> for ThreadRandom {
    fn rand(&self) -> [u8; N] {
        let mut bytes = [0_u8; N];
        rng().fill_bytes(&mut bytes);
        bytes
    }
}
