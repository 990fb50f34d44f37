//! An in-memory [`RuleStore`](gateway_controller_core::store::RuleStore).
//!
//! All records live behind a single lock, so every trait method is trivially atomic and the
//! `(ip, port)` unique constraint is checked and written in one critical section. The store is
//! suitable for a single controller replica and for tests; deployments that run several
//! replicas plug in a shared database behind the same trait.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod index;
pub mod metrics;

#[cfg(test)]
mod tests;

pub use self::index::{InMemoryStore, SharedStore};
