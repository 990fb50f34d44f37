//! Asynchronous propagation of rule changes to the data plane.
//!
//! Controller operations persist a change and then [`Propagator::submit`] an event. Submission
//! never waits on delivery: events are hashed by entity onto a fixed set of bounded worker
//! queues, so every event for one rule is published in submission order while distinct rules
//! are published concurrently. Workers retry transient failures with jittered exponential
//! backoff and drop the event once retries are exhausted.
//!
//! Anything dropped (a full queue, exhausted retries, a controller restart) is healed by the
//! [`Reconciler`], which periodically re-emits the current state of every rule and a delete
//! event for every recently deleted rule. Consumers discard duplicates by revision.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod backoff;
pub mod metrics;
mod queue;
mod reconcile;


pub use self::{
    backoff::Backoff,
    metrics::PropagateMetrics,
    queue::{Config, Propagator},
    reconcile::{http_rule_event, Reconciler, Sweep},
};
