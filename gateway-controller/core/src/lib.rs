//! Gateway Rule Controller core types.
//!
//! The controller accepts HTTP rules (domain + certificate + container port) and TCP rules
//! (external ip:port + container port) for workloads behind a shared gateway. It validates and
//! persists them, reserves the external ports they consume, and propagates the resulting
//! configuration to a fleet of data-plane proxies.
//!
//! This crate holds the types shared by every other controller crate:
//!
//! - the canonical records ([`HttpRule`], [`TcpRule`], [`Certificate`]);
//! - the collaborator contracts ([`store::RuleStore`], [`delivery::Delivery`],
//!   [`delivery::Membership`]);
//! - the propagation event model and the consumer-side stale-discard rule
//!   ([`event`], [`apply`]);
//! - the request payloads and the error taxonomy returned to callers.
//!
//! ```text
//! [ request ] -> [ validate ] -> [ reserve port ] -> [ RuleStore ] -> [ propagate ] ~> [ data plane ]
//! ```

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod apply;
mod certificate;
pub mod delivery;
mod error;
pub mod event;
pub mod request;
mod rule;
pub mod store;

pub use self::{
    certificate::Certificate,
    error::{Error, FieldErrors},
    request::RequestContext,
    rule::{is_blank, HttpRule, PortAddr, RuleExtension, TcpRule, UNSPECIFIED_IP},
};
