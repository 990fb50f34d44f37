//! The durable storage contract consumed by the controller.
//!
//! Implementations must make every method atomic with respect to the records it touches. In
//! particular [`RuleStore::claim_port`] is the only coordination point for the external port
//! space: two concurrent claims for the same pair must have exactly one winner.

use crate::{
    certificate::Certificate,
    event::EntityRef,
    rule::{HttpRule, PortAddr, TcpRule},
};
use serde::Serialize;
use std::fmt;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,

    /// A unique constraint was violated or an update carried a stale version.
    #[error("{0}")]
    Conflict(String),

    /// Another active TCP rule already uses the external pair.
    #[error("{0} is already used by another tcp rule")]
    AddrConflict(PortAddr),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Who holds an external port.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "rule_id", rename_all = "snake_case")]
pub enum PortOwner {
    Rule(String),

    /// A short-lived hold handed out by "give me a free port" requests.
    Placeholder,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortReservation {
    pub addr: PortAddr,
    pub owner: PortOwner,

    /// Set for placeholders only.
    pub expires_at: Option<Instant>,
}

/// Remembers a deleted rule so that its delete event can be re-sent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tombstone {
    pub entity: EntityRef,

    /// The last stored version + 1.
    pub version: u64,
    pub deleted_at: Instant,
}

#[async_trait::async_trait]
pub trait RuleStore: Send + Sync + 'static {
    async fn get_http_rule(&self, rule_id: &str) -> Result<HttpRule, StoreError>;

    async fn list_http_rules(&self) -> Result<Vec<HttpRule>, StoreError>;

    /// Inserts a new rule at version 1. Fails with `Conflict` if the id exists.
    async fn create_http_rule(&self, rule: HttpRule) -> Result<HttpRule, StoreError>;

    /// Replaces a rule if its stored version equals `expected_version`, storing it at
    /// `expected_version + 1`.
    async fn update_http_rule(
        &self,
        rule: HttpRule,
        expected_version: u64,
    ) -> Result<HttpRule, StoreError>;

    /// Removes a rule, returning the removed record, and leaves a tombstone.
    async fn delete_http_rule(&self, rule_id: &str) -> Result<HttpRule, StoreError>;

    async fn find_http_rules_by_certificate(
        &self,
        certificate_id: &str,
    ) -> Result<Vec<HttpRule>, StoreError>;

    async fn get_tcp_rule(&self, rule_id: &str) -> Result<TcpRule, StoreError>;

    async fn list_tcp_rules(&self) -> Result<Vec<TcpRule>, StoreError>;

    async fn create_tcp_rule(&self, rule: TcpRule) -> Result<TcpRule, StoreError>;

    async fn update_tcp_rule(
        &self,
        rule: TcpRule,
        expected_version: u64,
    ) -> Result<TcpRule, StoreError>;

    async fn delete_tcp_rule(&self, rule_id: &str) -> Result<TcpRule, StoreError>;

    async fn find_tcp_rule_by_addr(&self, addr: PortAddr) -> Result<TcpRule, StoreError>;

    async fn get_certificate(&self, certificate_id: &str) -> Result<Certificate, StoreError>;

    async fn create_certificate(&self, certificate: Certificate)
        -> Result<Certificate, StoreError>;

    async fn update_certificate(
        &self,
        certificate: Certificate,
        expected_version: u64,
    ) -> Result<Certificate, StoreError>;

    /// Removes a certificate. Fails with `Conflict` while any HTTP rule references it.
    async fn delete_certificate(&self, certificate_id: &str) -> Result<Certificate, StoreError>;

    async fn get_reservation(&self, addr: PortAddr) -> Result<PortReservation, StoreError>;

    /// Inserts a reservation under the `(ip, port)` unique constraint.
    ///
    /// Succeeds when the pair is free, already held by the same rule, held by an expired
    /// placeholder, or held by a live placeholder and claimed by a rule (promotion). Fails with
    /// `Conflict` otherwise.
    async fn claim_port(&self, reservation: PortReservation, now: Instant)
        -> Result<(), StoreError>;

    /// Removes the pair's reservation if `owner` holds it. Missing reservations are not errors.
    async fn release_port(&self, addr: PortAddr, owner: &PortOwner) -> Result<(), StoreError>;

    async fn list_reservations(&self) -> Result<Vec<PortReservation>, StoreError>;

    /// Drops placeholders that expired before `now`, returning how many were removed.
    async fn remove_expired_reservations(&self, now: Instant) -> Result<usize, StoreError>;

    async fn list_tombstones(&self) -> Result<Vec<Tombstone>, StoreError>;

    async fn prune_tombstones(&self, before: Instant) -> Result<usize, StoreError>;
}

// === impl PortOwner ===

impl PortOwner {
    pub fn rule(rule_id: impl Into<String>) -> Self {
        Self::Rule(rule_id.into())
    }
}

impl fmt::Display for PortOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rule(id) => write!(f, "rule/{id}"),
            Self::Placeholder => f.write_str("placeholder"),
        }
    }
}

// === impl PortReservation ===

impl PortReservation {
    pub fn rule(addr: PortAddr, rule_id: impl Into<String>) -> Self {
        Self {
            addr,
            owner: PortOwner::rule(rule_id),
            expires_at: None,
        }
    }

    pub fn placeholder(addr: PortAddr, expires_at: Instant) -> Self {
        Self {
            addr,
            owner: PortOwner::Placeholder,
            expires_at: Some(expires_at),
        }
    }

    /// Rule reservations never expire; placeholders are live until their deadline.
    pub fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |deadline| deadline > now)
    }

    /// Returns true if `claim` may take over this reservation at `now`.
    pub fn yields_to(&self, claim: &PortReservation, now: Instant) -> bool {
        if !self.is_live(now) {
            return true;
        }
        match (&self.owner, &claim.owner) {
            (PortOwner::Rule(held), PortOwner::Rule(id)) => held == id,
            (PortOwner::Placeholder, PortOwner::Rule(_)) => true,
            (_, PortOwner::Placeholder) => false,
        }
    }
}
