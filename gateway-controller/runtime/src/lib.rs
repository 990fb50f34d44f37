//! The gateway rule controller's request-handling runtime.
//!
//! [`GatewayController`] validates rule mutations, reserves external ports through the
//! [`allocator`], persists records in a [`RuleStore`](gateway_controller_core::store::RuleStore)
//! and submits propagation events. The [`api`] module exposes it over HTTP; [`Args`] wires every
//! piece together for the binary.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod admin;
pub mod allocator;
pub mod api;
mod args;
pub mod certificate;
mod controller;
pub mod delivery;
pub mod membership;
pub mod ports;
mod server;
pub mod validation;

#[cfg(test)]
mod test_util;

pub use self::{
    args::Args,
    controller::{ControllerConfig, GatewayController},
};
