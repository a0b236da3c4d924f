use crate::{
    Result,
    base32::{decode_base32_u128, encode_base32, encoded_len},
};
use core::{fmt, str::FromStr};

/// A 128-bit ULID: a 48-bit millisecond timestamp followed by 80 random bits.
///
/// ```text
///  Bit Index:  127            80 79           0
///              +----------------+-------------+
///  Field:      | timestamp (48) | random (80) |
///              +----------------+-------------+
///              |<-- MSB -- 128 bits -- LSB -->|
/// ```
///
/// Ordering on the raw integer is ordering by creation time, and the 26
/// character Crockford encoding preserves that ordering lexically.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Ulid {
    id: u128,
}

const _: () = {
    assert!(
        Ulid::TIMESTAMP_BITS + Ulid::RANDOM_BITS == u128::BITS,
        "Layout must match underlying type width"
    );
};

impl Ulid {
    pub const TIMESTAMP_BITS: u32 = 48;
    pub const RANDOM_BITS: u32 = 80;

    pub const RANDOM_SHIFT: u32 = 0;
    pub const TIMESTAMP_SHIFT: u32 = Self::RANDOM_SHIFT + Self::RANDOM_BITS;

    pub const RANDOM_MASK: u128 = (1 << Self::RANDOM_BITS) - 1;
    pub const TIMESTAMP_MASK: u128 = (1 << Self::TIMESTAMP_BITS) - 1;

    /// Length of the Crockford Base32 representation.
    pub const ENCODED_LEN: usize = encoded_len(16);

    pub const ZERO: Self = Self::from_raw(0);

    #[must_use]
    pub const fn from_raw(id: u128) -> Self {
        Self { id }
    }

    #[must_use]
    pub const fn to_raw(&self) -> u128 {
        self.id
    }

    /// Builds an ID from its parts, masking each to its field width.
    #[must_use]
    pub const fn from_components(timestamp: u64, random: u128) -> Self {
        let t = (timestamp as u128 & Self::TIMESTAMP_MASK) << Self::TIMESTAMP_SHIFT;
        let r = (random & Self::RANDOM_MASK) << Self::RANDOM_SHIFT;
        Self { id: t | r }
    }

    /// Milliseconds since the Unix epoch.
    pub const fn timestamp(&self) -> u64 {
        ((self.id >> Self::TIMESTAMP_SHIFT) & Self::TIMESTAMP_MASK) as u64
    }

    pub const fn random(&self) -> u128 {
        (self.id >> Self::RANDOM_SHIFT) & Self::RANDOM_MASK
    }

    pub const fn max_timestamp() -> u64 {
        Self::TIMESTAMP_MASK as u64
    }

    pub const fn max_random() -> u128 {
        Self::RANDOM_MASK
    }

    /// Returns true if the random part can be incremented without wrapping.
    pub const fn has_random_room(&self) -> bool {
        self.random() < Self::max_random()
    }

    /// Returns a new ID in the same millisecond with the random part
    /// incremented by one.
    #[must_use]
    pub const fn increment_random(&self) -> Self {
        Self::from_components(self.timestamp(), self.random() + 1)
    }

    /// Returns a new ID for a newer timestamp with fresh randomness.
    #[must_use]
    pub const fn rollover_to_timestamp(&self, timestamp: u64, random: u128) -> Self {
        Self::from_components(timestamp, random)
    }

    /// Writes the 26-character encoding into `buf` and returns it as a `&str`.
    pub fn encode_to_buf<'buf>(&self, buf: &'buf mut [u8; Self::ENCODED_LEN]) -> &'buf str {
        encode_base32(&self.id.to_be_bytes(), buf);
        // Every byte comes from the ASCII alphabet.
        core::str::from_utf8(buf).unwrap_or_default()
    }

    /// Decodes a 26-character Crockford Base32 string.
    ///
    /// # Errors
    ///
    /// Returns an error if the input has the wrong length, contains characters
    /// outside the alphabet, or overflows 128 bits.
    pub fn decode(encoded: &str) -> Result<Self> {
        decode_base32_u128(encoded).map(Self::from_raw)
    }
}

impl fmt::Display for Ulid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut buf = [0_u8; Self::ENCODED_LEN];
        f.write_str(self.encode_to_buf(&mut buf))
    }
}

impl fmt::Debug for Ulid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ulid")
            .field("id", &format_args!("{self}"))
            .field("timestamp", &self.timestamp())
            .field("random", &self.random())
            .finish()
    }
}

impl FromStr for Ulid {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::decode(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn components_round_trip_through_layout() {
        let id = Ulid::from_components(1_700_000_000_000, 42);
        assert_eq!(id.timestamp(), 1_700_000_000_000);
        assert_eq!(id.random(), 42);
    }

    #[test]
    fn components_are_masked_to_field_width() {
        let id = Ulid::from_components(u64::MAX, u128::MAX);
        assert_eq!(id.timestamp(), Ulid::max_timestamp());
        assert_eq!(id.random(), Ulid::max_random());
        assert!(!id.has_random_room());
    }

    #[test]
    fn later_timestamp_sorts_after_any_random() {
        let early = Ulid::from_components(10, Ulid::max_random());
        let late = Ulid::from_components(11, 0);
        assert!(early < late);
        assert!(early.to_string() < late.to_string());
    }

    #[test]
    fn display_and_parse_agree() {
        let id = Ulid::from_components(1_735_689_600_000, 0xDEAD_BEEF);
        let s = id.to_string();
        assert_eq!(s.len(), Ulid::ENCODED_LEN);
        assert_eq!(s.parse::<Ulid>().unwrap(), id);
    }
}
