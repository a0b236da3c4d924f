use crate::{Error, MonoUlidGenerator, RandSource, Result, ThreadRandom, TimeSource, Ulid};
use core::{fmt, str::FromStr};

/// The entity kinds that receive identifiers.
///
/// Each kind owns an independent monotonic generator, so heavy operation
/// traffic never perturbs the ordering of target or session identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IdKind {
    Operation,
    Target,
    Session,
}

impl IdKind {
    pub const COUNT: usize = 3;
    pub const ALL: [Self; Self::COUNT] = [Self::Operation, Self::Target, Self::Session];

    /// Short textual tag that prefixes every identifier of this kind.
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Operation => "op",
            Self::Target => "tgt",
            Self::Session => "ses",
        }
    }

    const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for IdKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Splits `tag_ULID` into its ULID, checking the tag.
fn parse_tagged(s: &str, kind: IdKind) -> Result<Ulid> {
    let tag = kind.tag();
    let encoded = s
        .strip_prefix(tag)
        .and_then(|rest| rest.strip_prefix('_'))
        .ok_or_else(|| Error::TagMismatch {
            expected: tag,
            found: s.to_owned(),
        })?;
    Ulid::decode(encoded)
}

/// Returns `true` if `id` carries the tag for `kind` followed by a well-formed
/// 26-character ULID.
///
/// ```
/// use vaultops::{IdKind, is_valid};
///
/// assert!(is_valid("op_01HZY3M7K3Q9W8X5T2V6N4B0CD", IdKind::Operation));
/// assert!(!is_valid("tgt_01HZY3M7K3Q9W8X5T2V6N4B0CD", IdKind::Operation));
/// ```
pub fn is_valid(id: &str, kind: IdKind) -> bool {
    parse_tagged(id, kind).is_ok()
}

macro_rules! define_entity_id {
    ($(#[$meta:meta])* $name:ident => $kind:expr) => {
        $(#[$meta])*
        #[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(Ulid);

        impl $name {
            pub const KIND: IdKind = $kind;

            pub const fn from_ulid(ulid: Ulid) -> Self {
                Self(ulid)
            }

            pub const fn ulid(&self) -> Ulid {
                self.0
            }

            /// Milliseconds since the Unix epoch at which this ID was minted.
            pub const fn timestamp(&self) -> u64 {
                self.0.timestamp()
            }

            pub fn is_valid(s: &str) -> bool {
                is_valid(s, Self::KIND)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let mut buf = [0_u8; Ulid::ENCODED_LEN];
                write!(f, "{}_{}", Self::KIND.tag(), self.0.encode_to_buf(&mut buf))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({self})", stringify!($name))
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                parse_tagged(s, Self::KIND).map(Self)
            }
        }

        impl TryFrom<String> for $name {
            type Error = Error;

            fn try_from(s: String) -> Result<Self> {
                s.parse()
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.to_string()
            }
        }

        #[cfg(feature = "serde")]
        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        #[cfg(feature = "serde")]
        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> core::result::Result<Self, D::Error> {
                let s = <String as serde::Deserialize>::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

define_entity_id!(
    /// Identifier of a queued operation, rendered as `op_<ULID>`.
    OperationId => IdKind::Operation
);
define_entity_id!(
    /// Identifier of a registered target, rendered as `tgt_<ULID>`.
    TargetId => IdKind::Target
);
define_entity_id!(
    /// Identifier of an issued credential session, rendered as `ses_<ULID>`.
    SessionId => IdKind::Session
);

/// Mints kind-tagged identifiers, one monotonic ULID stream per [`IdKind`].
///
/// ```
/// use vaultops::{IdGenerator, IdKind, MonotonicClock, is_valid};
///
/// let ids = IdGenerator::new(MonotonicClock::default());
/// let a = ids.operation_id();
/// let b = ids.operation_id();
/// assert!(a < b);
/// assert!(is_valid(&ids.new_id(IdKind::Target), IdKind::Target));
/// ```
pub struct IdGenerator<T, R = ThreadRandom>
where
    T: TimeSource<u64>,
    R: RandSource<u128>,
{
    streams: [MonoUlidGenerator<T, R>; IdKind::COUNT],
}

impl<T> IdGenerator<T, ThreadRandom>
where
    T: TimeSource<u64> + Clone,
{
    pub fn new(time: T) -> Self {
        Self::with_rng(time, ThreadRandom)
    }
}

impl<T, R> IdGenerator<T, R>
where
    T: TimeSource<u64> + Clone,
    R: RandSource<u128> + Clone,
{
    pub fn with_rng(time: T, rng: R) -> Self {
        Self {
            streams: core::array::from_fn(|_| MonoUlidGenerator::new(time.clone(), rng.clone())),
        }
    }
}

impl<T, R> IdGenerator<T, R>
where
    T: TimeSource<u64>,
    R: RandSource<u128>,
{
    /// Returns the next ULID from the stream for `kind`.
    pub fn next_ulid(&self, kind: IdKind) -> Ulid {
        self.streams[kind.index()].generate()
    }

    /// Returns a new identifier string for `kind`, e.g. `op_01J...`.
    pub fn new_id(&self, kind: IdKind) -> String {
        let mut buf = [0_u8; Ulid::ENCODED_LEN];
        let ulid = self.next_ulid(kind);
        format!("{}_{}", kind.tag(), ulid.encode_to_buf(&mut buf))
    }

    pub fn operation_id(&self) -> OperationId {
        OperationId::from_ulid(self.next_ulid(IdKind::Operation))
    }

    pub fn target_id(&self) -> TargetId {
        TargetId::from_ulid(self.next_ulid(IdKind::Target))
    }

    pub fn session_id(&self) -> SessionId {
        SessionId::from_ulid(self.next_ulid(IdKind::Session))
    }
}
