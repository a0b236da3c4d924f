//! Core of the vaultops orchestration engine.
//!
//! - the operation and target model with its state machine
//! - retry backoff
//! - the [`OperationStore`] contract with in-memory and SQLite stores
//! - the [`VaultApi`] client contract and the [`HandlerRegistry`]
//!
//! Everything here is runtime-agnostic; the scheduler lives in
//! `vaultops-server`.

mod client;
mod common;
mod store;

pub use client::*;
pub use common::*;
pub use store::*;
// Public re-export so downstream crates can access `vaultops` via
// `vaultops_core::vaultops`
pub use vaultops;
