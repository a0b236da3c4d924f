//! Identifiers and tokens for the vaultops orchestration engine.
//!
//! - [`IdGenerator`] mints kind-tagged, lexically time-sortable identifiers
//!   (`op_…`, `tgt_…`, `ses_…`) backed by one monotonic ULID stream per kind.
//! - [`TokenGenerator`] mints opaque 256-bit session tokens.
//!
//! Both are driven through the [`TimeSource`] and [`RandSource`] seams so
//! tests can pin the clock and the entropy.

pub mod base32;
mod error;
mod generator;
mod kind;
mod rand;
mod time;
mod token;
mod ulid;

pub use crate::error::*;
pub use crate::generator::*;
pub use crate::kind::*;
pub use crate::rand::*;
pub use crate::time::*;
pub use crate::token::*;
pub use crate::ulid::*;
