use crate::{
    RandSource, ThreadRandom,
    base32::{encode_base32, encoded_len},
};
use core::fmt;

/// Number of random bytes behind every session token.
pub const TOKEN_BYTES: usize = 32;

const TOKEN_PREFIX: &str = "vst_";
const TOKEN_BODY_LEN: usize = encoded_len(TOKEN_BYTES);

/// An opaque, cryptographically random session token.
///
/// Tokens render as `vst_` followed by 52 Crockford Base32 characters
/// encoding 256 bits of entropy. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken(String);

impl SessionToken {
    /// Returns the full token, including its prefix.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// Checks that `candidate` has the token shape without comparing secrets.
    pub fn is_well_formed(candidate: &str) -> bool {
        candidate.strip_prefix(TOKEN_PREFIX).is_some_and(|body| {
            body.len() == TOKEN_BODY_LEN && body.bytes().all(is_crockford_symbol)
        })
    }

    /// Compares `candidate` against this token in constant time with respect
    /// to the position of the first mismatch.
    pub fn verify(&self, candidate: &str) -> bool {
        let expected = self.0.as_bytes();
        let given = candidate.as_bytes();
        if expected.len() != given.len() {
            return false;
        }
        expected
            .iter()
            .zip(given)
            .fold(0_u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

/// Canonical (uppercase) Crockford Base32 symbol.
fn is_crockford_symbol(b: u8) -> bool {
    b.is_ascii_digit() || (b.is_ascii_uppercase() && !matches!(b, b'I' | b'L' | b'O' | b'U'))
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SessionToken").field(&"<redacted>").finish()
    }
}

/// Produces [`SessionToken`]s from a random source.
///
/// ```
/// use vaultops::{SessionToken, TokenGenerator};
///
/// let tokens = <TokenGenerator>::default();
/// let token = tokens.generate();
/// assert!(SessionToken::is_well_formed(token.as_str()));
/// assert!(token.verify(token.as_str()));
/// ```
#[derive(Default, Clone, Debug)]
pub struct TokenGenerator<R = ThreadRandom>
where
    R: RandSource<[u8; TOKEN_BYTES]>,
{
    rng: R,
}

impl<R> TokenGenerator<R>
where
    R: RandSource<[u8; TOKEN_BYTES]>,
{
    pub fn new(rng: R) -> Self {
        Self { rng }
    }

    pub fn generate(&self) -> SessionToken {
        let bytes = self.rng.rand();
        let mut buf = [0_u8; TOKEN_BODY_LEN];
        encode_base32(&bytes, &mut buf);

        let mut token = String::with_capacity(TOKEN_PREFIX.len() + TOKEN_BODY_LEN);
        token.push_str(TOKEN_PREFIX);
        token.extend(buf.iter().map(|&b| b as char));
        SessionToken(token)
    }
}
