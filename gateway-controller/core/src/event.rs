//! Propagation events sent from the controller to data-plane consumers.
//!
//! Events are delivered at least once and may arrive out of order across entities. Consumers
//! order them per entity by [`Revision`]: the entity's own version, then the version of the
//! certificate embedded in it. A certificate update re-sends every referencing rule with an
//! unchanged rule version but a newer certificate version, so the event still supersedes what
//! the consumer applied before.

use crate::{certificate::Certificate, rule::HttpRule, rule::TcpRule};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    HttpRule,
    TcpRule,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

/// Orders events for a single entity. Compared field by field.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Revision {
    pub version: u64,
    #[serde(default)]
    pub certificate_version: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    HttpRule {
        rule: HttpRule,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        certificate: Option<Certificate>,
    },
    TcpRule {
        rule: TcpRule,
    },
    Deleted,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropagationEvent {
    pub entity: EntityRef,
    #[serde(flatten)]
    pub revision: Revision,
    pub operation: Operation,
    pub payload: Payload,
}

// === impl EntityKind ===

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HttpRule => "http_rule",
            Self::TcpRule => "tcp_rule",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl EntityRef ===

impl EntityRef {
    pub fn http_rule(id: impl Into<String>) -> Self {
        Self {
            kind: EntityKind::HttpRule,
            id: id.into(),
        }
    }

    pub fn tcp_rule(id: impl Into<String>) -> Self {
        Self {
            kind: EntityKind::TcpRule,
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

// === impl Operation ===

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

// === impl Revision ===

impl Revision {
    pub fn new(version: u64, certificate_version: u64) -> Self {
        Self {
            version,
            certificate_version,
        }
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.version, self.certificate_version)
    }
}

// === impl PropagationEvent ===

impl PropagationEvent {
    /// Builds a create or update event for an HTTP rule, embedding the certificate it references.
    pub fn http_rule(
        operation: Operation,
        rule: HttpRule,
        certificate: Option<Certificate>,
    ) -> Self {
        let revision = Revision::new(
            rule.version,
            certificate.as_ref().map(|c| c.version).unwrap_or_default(),
        );
        Self {
            entity: EntityRef::http_rule(rule.rule_id.clone()),
            revision,
            operation,
            payload: Payload::HttpRule { rule, certificate },
        }
    }

    pub fn tcp_rule(operation: Operation, rule: TcpRule) -> Self {
        Self {
            entity: EntityRef::tcp_rule(rule.rule_id.clone()),
            revision: Revision::new(rule.version, 0),
            operation,
            payload: Payload::TcpRule { rule },
        }
    }

    /// Builds a delete event. `version` must already be the last known version + 1.
    pub fn deleted(entity: EntityRef, version: u64) -> Self {
        Self {
            entity,
            revision: Revision::new(version, 0),
            operation: Operation::Delete,
            payload: Payload::Deleted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn http_rule(version: u64) -> HttpRule {
        HttpRule {
            rule_id: "r1".to_string(),
            workload_id: "w1".to_string(),
            container_port: 8080,
            domain: "www.example.com".to_string(),
            certificate_id: Some("c1".to_string()),
            extensions: vec![],
            configs: vec![],
            version,
        }
    }

    #[test]
    fn revisions_order_by_rule_then_certificate() {
        assert!(Revision::new(1, 9) < Revision::new(2, 0));
        assert!(Revision::new(1, 1) < Revision::new(1, 2));
        assert_eq!(Revision::new(3, 3), Revision::new(3, 3));
    }

    #[test]
    fn delete_supersedes_last_update() {
        let mut cert = Certificate::new("c1", "cert", "key");
        cert.version = 7;
        let update = PropagationEvent::http_rule(Operation::Update, http_rule(4), Some(cert));
        let delete = PropagationEvent::deleted(EntityRef::http_rule("r1"), 5);
        assert!(delete.revision > update.revision);
    }

    #[test]
    fn serializes_flat_revision() {
        let ev = PropagationEvent::deleted(EntityRef::tcp_rule("t1"), 3);
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "entity": {"kind": "tcp_rule", "id": "t1"},
                "version": 3,
                "certificate_version": 0,
                "operation": "delete",
                "payload": {"type": "deleted"},
            })
        );
        let back: PropagationEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, ev);
    }
}
