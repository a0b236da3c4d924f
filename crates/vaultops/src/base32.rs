use crate::{Error, Result};

const ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";
const NO_VALUE: u8 = 255;
const BITS_PER_CHAR: usize = 5;

/// Lookup table for Crockford base32 decoding
const LOOKUP: [u8; 256] = {
    let mut lut = [NO_VALUE; 256];
    let mut i = 0_u8;
    // Main alphabet, allow lower-case
    while i < 32 {
        let c = ALPHABET[i as usize];
        lut[c as usize] = i;
        if c.is_ascii_uppercase() {
            lut[(c + 32) as usize] = i;
        }
        i += 1;
    }
    // Crockford-specific aliases
    lut[b'O' as usize] = 0;
    lut[b'o' as usize] = 0;
    lut[b'I' as usize] = 1;
    lut[b'i' as usize] = 1;
    lut[b'L' as usize] = 1;
    lut[b'l' as usize] = 1;
    lut
};

/// Number of Crockford characters needed to encode `bytes` bytes.
pub const fn encoded_len(bytes: usize) -> usize {
    (bytes * 8).div_ceil(BITS_PER_CHAR)
}

/// Encodes a byte slice into Crockford base32, writing output to `buf`.
///
/// The output is left-padded with zero bits, so a big-endian integer encodes
/// to a string that sorts lexically in the same order as the integer.
///
/// # Panics
///
/// Panics if `buf` is shorter than [`encoded_len`] of the input. Callers in
/// this crate size their buffers at compile time.
pub fn encode_base32(input: &[u8], buf: &mut [u8]) {
    let input_bits = input.len() * 8;
    let total_bits = buf.len() * BITS_PER_CHAR;
    let mut bits = total_bits - input_bits;
    let mut acc = 0_u16;
    let mask = 0x1F;

    let mut out = 0;
    for &b in input {
        acc = (acc << 8) | u16::from(b);
        bits += 8;
        while bits >= BITS_PER_CHAR {
            bits -= BITS_PER_CHAR;
            buf[out] = ALPHABET[((acc >> bits) & mask) as usize];
            out += 1;
        }
    }
}

/// Decodes a 26-character Crockford base32 string into a `u128`.
///
/// Accepts lower-case input and the Crockford aliases `O`, `I` and `L`.
///
/// # Errors
///
/// - [`Error::DecodeInvalidLen`] if the input is not exactly 26 characters
/// - [`Error::DecodeInvalidAscii`] for characters outside the alphabet
/// - [`Error::DecodeOverflow`] if the value needs more than 128 bits
pub fn decode_base32_u128(encoded: &str) -> Result<u128> {
    const LEN: usize = encoded_len(16);

    if encoded.len() != LEN {
        return Err(Error::DecodeInvalidLen {
            expected: LEN,
            found: encoded.len(),
        });
    }

    let mut acc = 0_u128;
    for (i, b) in encoded.bytes().enumerate() {
        let val = LOOKUP[b as usize];
        if val == NO_VALUE {
            return Err(Error::DecodeInvalidAscii { byte: b, index: i });
        }
        // 26 chars carry 130 bits; the top two must be zero.
        if i == 0 && val > 7 {
            return Err(Error::DecodeOverflow);
        }
        acc = (acc << BITS_PER_CHAR) | u128::from(val);
    }

    Ok(acc)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_u128(val: u128) -> String {
        let mut buf = [0u8; encoded_len(16)];
        encode_base32(&val.to_be_bytes(), &mut buf);
        String::from_utf8(buf.to_vec()).unwrap()
    }

    #[test]
    fn encoded_len_matches_known_widths() {
        assert_eq!(encoded_len(4), 7);
        assert_eq!(encoded_len(8), 13);
        assert_eq!(encoded_len(16), 26);
        assert_eq!(encoded_len(32), 52);
    }

    #[test]
    fn encode_matches_reference_ulid_string() {
        assert_eq!(
            encode_u128(2_424_242_424_242_424_242),
            "000000000000023953MG16DJDJ"
        );
        assert_eq!(encode_u128(0), "00000000000000000000000000");
        assert_eq!(encode_u128(u128::MAX), "7ZZZZZZZZZZZZZZZZZZZZZZZZZ");
    }

    #[test]
    fn decode_inverts_encode_at_the_extremes() {
        for v in [0, 1, u128::MAX, 0x0123_4567_89AB_CDEF_0123_4567_89AB_CDEF] {
            assert_eq!(decode_base32_u128(&encode_u128(v)).unwrap(), v);
        }
    }

    #[test]
    fn decode_accepts_lowercase_and_aliases() {
        let upper = decode_base32_u128("01ARZ3NDEKTSV4RRFFQ69G5FAV").unwrap();
        let lower = decode_base32_u128("01arz3ndektsv4rrffq69g5fav").unwrap();
        assert_eq!(upper, lower);

        let canonical = decode_base32_u128("01000000000000000000000000").unwrap();
        let aliased = decode_base32_u128("OIOOOOOOOOOOOOOOOOOOOOOOOO").unwrap();
        assert_eq!(canonical, aliased);
    }

    #[test]
    fn decode_rejects_bad_input() {
        assert_eq!(
            decode_base32_u128("ABC"),
            Err(Error::DecodeInvalidLen {
                expected: 26,
                found: 3
            })
        );
        assert_eq!(
            decode_base32_u128("0000000000000000000000000U"),
            Err(Error::DecodeInvalidAscii {
                byte: b'U',
                index: 25
            })
        );
        assert_eq!(
            decode_base32_u128("8ZZZZZZZZZZZZZZZZZZZZZZZZZ"),
            Err(Error::DecodeOverflow)
        );
    }

    #[test]
    fn encoding_preserves_numeric_order() {
        let a = encode_u128(1 << 80);
        let b = encode_u128((1 << 80) + 1);
        let c = encode_u128(2 << 80);
        assert!(a < b && b < c);
    }
}
