use crate::event::PropagationEvent;
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum PublishError {
    /// The transport may accept the event if it is retried later.
    #[error("transient delivery failure: {0}")]
    Transient(String),

    /// Retrying will not help (e.g. the event could not be encoded).
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}

/// Hands propagation events to the data plane with at-least-once semantics.
///
/// A successful publish only means the transport accepted the event; the controller never
/// learns whether a data-plane instance applied it.
#[async_trait::async_trait]
pub trait Delivery: Send + Sync + 'static {
    async fn publish(&self, event: &PropagationEvent) -> Result<(), PublishError>;
}

/// Knows which data-plane instances currently exist.
#[async_trait::async_trait]
pub trait Membership: Send + Sync + 'static {
    async fn list_dataplane_addresses(&self) -> Vec<String>;
}
