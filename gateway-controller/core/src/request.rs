//! Request payloads accepted by the controller.
//!
//! Add requests carry every field; missing fields decode to their defaults and are reported by
//! validation. Update requests are partial: `None` keeps the stored value.

use crate::{
    certificate::Certificate,
    error::{Error, FieldErrors},
    rule::{is_blank, HttpRule, RuleExtension, TcpRule, UNSPECIFIED_IP},
};
use serde::{Deserialize, Serialize};
use std::net::{AddrParseError, IpAddr};

/// Request-scoped values every controller operation receives explicitly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestContext {
    pub tenant_id: String,
    pub event_id: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddHttpRule {
    pub rule_id: String,
    pub workload_id: String,
    pub container_port: u16,
    pub domain: String,
    pub certificate_id: String,
    pub certificate: String,
    pub private_key: String,
    pub extensions: Vec<RuleExtension>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateHttpRule {
    pub rule_id: String,
    pub workload_id: Option<String>,
    pub container_port: Option<u16>,
    pub domain: Option<String>,

    /// A blank id removes the rule's certificate.
    pub certificate_id: Option<String>,
    pub certificate: Option<String>,
    pub private_key: Option<String>,
    pub extensions: Option<Vec<RuleExtension>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeleteRule {
    pub rule_id: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddTcpRule {
    pub rule_id: String,
    pub workload_id: String,
    pub container_port: u16,

    /// Blank binds all addresses.
    pub ip: String,
    pub port: u16,
    pub extensions: Vec<RuleExtension>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateTcpRule {
    pub rule_id: String,
    pub workload_id: Option<String>,
    pub container_port: Option<u16>,
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub extensions: Option<Vec<RuleExtension>>,
}

/// Replaces the proxy configuration entries of an HTTP rule.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateRuleConfig {
    pub rule_id: String,
    pub configs: Vec<RuleExtension>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateCertificate {
    pub certificate_id: String,
    pub certificate: String,
    pub private_key: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeleteCertificate {
    pub certificate_id: String,
}

/// Parses an external ip, treating a blank string as all addresses.
pub fn parse_ip(ip: &str) -> Result<IpAddr, AddrParseError> {
    if is_blank(ip) {
        return Ok(UNSPECIFIED_IP);
    }
    ip.trim().parse()
}

fn certificate_ref(id: &str) -> Option<String> {
    if is_blank(id) {
        None
    } else {
        Some(id.trim().to_string())
    }
}

fn certificate_material(id: Option<&str>, cert: &str, key: &str) -> Option<Certificate> {
    Some(Certificate::new(id?, cert, key)).filter(Certificate::is_complete)
}

// === impl RequestContext ===

impl RequestContext {
    /// Both ids are required.
    pub fn new(tenant_id: impl Into<String>, event_id: impl Into<String>) -> Result<Self, Error> {
        let tenant_id = tenant_id.into();
        let event_id = event_id.into();

        let mut errors = FieldErrors::new();
        if is_blank(&tenant_id) {
            errors.set("tenant_id", "The tenant_id field is required");
        }
        if is_blank(&event_id) {
            errors.set("event_id", "The event_id field is required");
        }
        errors.into_result()?;

        Ok(Self {
            tenant_id,
            event_id,
        })
    }
}

// === impl AddHttpRule ===

impl AddHttpRule {
    pub fn certificate_ref(&self) -> Option<String> {
        certificate_ref(&self.certificate_id)
    }

    /// The certificate material carried by the request, if complete.
    pub fn certificate(&self) -> Option<Certificate> {
        certificate_material(
            self.certificate_ref().as_deref(),
            &self.certificate,
            &self.private_key,
        )
    }

    pub fn to_rule(&self) -> HttpRule {
        HttpRule {
            rule_id: self.rule_id.clone(),
            workload_id: self.workload_id.clone(),
            container_port: self.container_port,
            domain: self.domain.trim().to_string(),
            certificate_id: self.certificate_ref(),
            extensions: self.extensions.clone(),
            configs: Vec::new(),
            version: 0,
        }
    }
}

// === impl UpdateHttpRule ===

impl UpdateHttpRule {
    /// The certificate id the rule will reference after the update.
    pub fn certificate_ref(&self, previous: &HttpRule) -> Option<String> {
        match self.certificate_id.as_deref() {
            Some(id) => certificate_ref(id),
            None => previous.certificate_ref().map(str::to_string),
        }
    }

    pub fn certificate(&self, previous: &HttpRule) -> Option<Certificate> {
        certificate_material(
            self.certificate_ref(previous).as_deref(),
            self.certificate.as_deref().unwrap_or_default(),
            self.private_key.as_deref().unwrap_or_default(),
        )
    }

    /// Merges the supplied fields over the stored record. The version is left untouched.
    pub fn apply_to(&self, previous: &HttpRule) -> HttpRule {
        HttpRule {
            rule_id: previous.rule_id.clone(),
            workload_id: self
                .workload_id
                .clone()
                .filter(|id| !is_blank(id))
                .unwrap_or_else(|| previous.workload_id.clone()),
            container_port: self
                .container_port
                .filter(|port| *port != 0)
                .unwrap_or(previous.container_port),
            domain: self
                .domain
                .as_deref()
                .map(|d| d.trim().to_string())
                .unwrap_or_else(|| previous.domain.clone()),
            certificate_id: self.certificate_ref(previous),
            extensions: self
                .extensions
                .clone()
                .unwrap_or_else(|| previous.extensions.clone()),
            configs: previous.configs.clone(),
            version: previous.version,
        }
    }
}

// === impl AddTcpRule ===

impl AddTcpRule {
    pub fn to_rule(&self, ip: IpAddr) -> TcpRule {
        TcpRule {
            rule_id: self.rule_id.clone(),
            workload_id: self.workload_id.clone(),
            container_port: self.container_port,
            ip,
            port: self.port,
            extensions: self.extensions.clone(),
            version: 0,
        }
    }
}

// === impl UpdateTcpRule ===

impl UpdateTcpRule {
    /// Merges the supplied fields over the stored record using the already-parsed `ip`.
    pub fn apply_to(&self, previous: &TcpRule, ip: IpAddr) -> TcpRule {
        TcpRule {
            rule_id: previous.rule_id.clone(),
            workload_id: self
                .workload_id
                .clone()
                .filter(|id| !is_blank(id))
                .unwrap_or_else(|| previous.workload_id.clone()),
            container_port: self
                .container_port
                .filter(|port| *port != 0)
                .unwrap_or(previous.container_port),
            ip,
            port: self
                .port
                .filter(|port| *port != 0)
                .unwrap_or(previous.port),
            extensions: self
                .extensions
                .clone()
                .unwrap_or_else(|| previous.extensions.clone()),
            version: previous.version,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn stored() -> HttpRule {
        HttpRule {
            rule_id: "r1".to_string(),
            workload_id: "w1".to_string(),
            container_port: 8080,
            domain: "www.example.com".to_string(),
            certificate_id: Some("c1".to_string()),
            extensions: vec![RuleExtension {
                key: "weight".to_string(),
                value: "100".to_string(),
            }],
            configs: vec![],
            version: 3,
        }
    }

    #[test]
    fn context_requires_ids() {
        assert!(RequestContext::new("t1", "e1").is_ok());
        match RequestContext::new(" ", "") {
            Err(Error::Validation(errors)) => {
                assert!(errors.contains("tenant_id"));
                assert!(errors.contains("event_id"));
            }
            res => panic!("unexpected {res:?}"),
        }
    }

    #[test]
    fn partial_update_keeps_omitted_fields() {
        let update = UpdateHttpRule {
            rule_id: "r1".to_string(),
            domain: Some("api.example.com".to_string()),
            ..Default::default()
        };
        let merged = update.apply_to(&stored());
        assert_eq!(
            merged,
            HttpRule {
                domain: "api.example.com".to_string(),
                ..stored()
            }
        );
    }

    #[test]
    fn blank_certificate_id_clears_reference() {
        let update = UpdateHttpRule {
            rule_id: "r1".to_string(),
            certificate_id: Some("  ".to_string()),
            ..Default::default()
        };
        assert_eq!(update.apply_to(&stored()).certificate_id, None);
    }

    #[test]
    fn add_carries_complete_certificate_only() {
        let mut add = AddHttpRule {
            rule_id: "r1".to_string(),
            certificate_id: " c1 ".to_string(),
            certificate: "cert".to_string(),
            ..Default::default()
        };
        assert_eq!(add.certificate(), None);
        add.private_key = "key".to_string();
        let cert = add.certificate().expect("certificate must be complete");
        assert_eq!(cert.certificate_id, "c1");
        assert_eq!(add.to_rule().certificate_id.as_deref(), Some("c1"));
    }

    #[test]
    fn parses_blank_ip_as_unspecified() {
        assert_eq!(parse_ip("").unwrap(), UNSPECIFIED_IP);
        assert_eq!(
            parse_ip(" 10.0.0.1 ").unwrap(),
            "10.0.0.1".parse::<IpAddr>().unwrap()
        );
        assert!(parse_ip("exa mple").is_err());
    }
}
