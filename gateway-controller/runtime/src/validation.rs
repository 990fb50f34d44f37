//! Request validation.
//!
//! Each function inspects a single request (and, for updates, the stored record) and returns the
//! problems it found by field. Validation never touches the store or the allocator.

use gateway_controller_core::{
    is_blank,
    request::{
        parse_ip, AddHttpRule, AddTcpRule, UpdateCertificate, UpdateHttpRule, UpdateRuleConfig,
        UpdateTcpRule,
    },
    FieldErrors, HttpRule, RuleExtension,
};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

const DNS1123_SUBDOMAIN_MAX_LEN: usize = 253;

const DNS1123_SUBDOMAIN_REGEX: &str =
    r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$";

const WILDCARD_DNS1123_SUBDOMAIN_REGEX: &str =
    r"^\*\.[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$";

static DNS1123_SUBDOMAIN: Lazy<Regex> =
    Lazy::new(|| Regex::new(DNS1123_SUBDOMAIN_REGEX).expect("subdomain regex must compile"));

static WILDCARD_DNS1123_SUBDOMAIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(WILDCARD_DNS1123_SUBDOMAIN_REGEX).expect("wildcard regex must compile")
});

pub fn add_http_rule(req: &AddHttpRule) -> FieldErrors {
    let mut errors = FieldErrors::new();
    require_ids(&mut errors, &req.rule_id, Some(&req.workload_id));
    if req.container_port == 0 {
        errors.set("container_port", "The container_port field is required");
    }
    if req.certificate_ref().is_some() {
        require_material(&mut errors, &req.certificate, &req.private_key);
    }
    extensions(&mut errors, &req.extensions);
    domain_field(&mut errors, &req.domain);
    errors
}

/// Omitted fields keep their stored values. Certificate material may be omitted as long as the
/// request keeps referencing the certificate the rule already uses.
pub fn update_http_rule(req: &UpdateHttpRule, previous: &HttpRule) -> FieldErrors {
    let mut errors = FieldErrors::new();
    require_ids(&mut errors, &req.rule_id, req.workload_id.as_deref());

    if let Some(id) = req.certificate_ref(previous) {
        let certificate = req.certificate.as_deref().unwrap_or_default();
        let private_key = req.private_key.as_deref().unwrap_or_default();
        let changed = previous.certificate_ref() != Some(id.as_str());
        if changed || !is_blank(certificate) || !is_blank(private_key) {
            require_material(&mut errors, certificate, private_key);
        }
    }
    if let Some(exts) = req.extensions.as_deref() {
        extensions(&mut errors, exts);
    }
    if let Some(domain) = req.domain.as_deref() {
        domain_field(&mut errors, domain);
    }
    errors
}

/// The external port range is enforced by the allocator; `min_external_port` only shapes the
/// field error reported here.
pub fn add_tcp_rule(req: &AddTcpRule, min_external_port: u16) -> FieldErrors {
    let mut errors = FieldErrors::new();
    require_ids(&mut errors, &req.rule_id, Some(&req.workload_id));
    if req.container_port == 0 {
        errors.set("container_port", "The container_port field is required");
    }
    if req.port == 0 {
        errors.set("port", "The port field is required");
    } else if req.port <= min_external_port {
        errors.set("port", port_too_low(min_external_port));
    }
    ip_field(&mut errors, &req.ip);
    extensions(&mut errors, &req.extensions);
    errors
}

pub fn update_tcp_rule(req: &UpdateTcpRule, min_external_port: u16) -> FieldErrors {
    let mut errors = FieldErrors::new();
    require_ids(&mut errors, &req.rule_id, req.workload_id.as_deref());
    if let Some(port) = req.port.filter(|p| *p != 0) {
        if port <= min_external_port {
            errors.set("port", port_too_low(min_external_port));
        }
    }
    if let Some(ip) = req.ip.as_deref() {
        ip_field(&mut errors, ip);
    }
    if let Some(exts) = req.extensions.as_deref() {
        extensions(&mut errors, exts);
    }
    errors
}

pub fn rule_config(req: &UpdateRuleConfig) -> FieldErrors {
    let mut errors = FieldErrors::new();
    require_ids(&mut errors, &req.rule_id, None);
    extensions(&mut errors, &req.configs);
    errors
}

pub fn certificate(req: &UpdateCertificate) -> FieldErrors {
    let mut errors = FieldErrors::new();
    if is_blank(&req.certificate_id) {
        errors.set("certificate_id", "The certificate_id field is required");
    }
    require_material(&mut errors, &req.certificate, &req.private_key);
    errors
}

pub fn rule_id(rule_id: &str) -> FieldErrors {
    let mut errors = FieldErrors::new();
    require_ids(&mut errors, rule_id, None);
    errors
}

pub fn certificate_id(certificate_id: &str) -> FieldErrors {
    let mut errors = FieldErrors::new();
    if is_blank(certificate_id) {
        errors.set("certificate_id", "The certificate_id field is required");
    }
    errors
}

/// Returns the reasons `domain` is not a valid (wildcard) DNS-1123 subdomain. A blank domain is
/// valid.
pub fn domain(domain: &str) -> Vec<String> {
    if is_blank(domain) {
        return vec![];
    }

    let mut reasons = vec![];
    if domain.len() > DNS1123_SUBDOMAIN_MAX_LEN {
        reasons.push(format!(
            "must be no more than {DNS1123_SUBDOMAIN_MAX_LEN} characters"
        ));
    }
    if domain.contains('*') {
        if !WILDCARD_DNS1123_SUBDOMAIN.is_match(domain) {
            reasons.push(format!(
                "a wildcard DNS-1123 subdomain must start with '*.', followed by a valid DNS \
                 subdomain (regex used for validation is '{WILDCARD_DNS1123_SUBDOMAIN_REGEX}')"
            ));
        }
    } else if !DNS1123_SUBDOMAIN.is_match(domain) {
        reasons.push(format!(
            "a DNS-1123 subdomain must consist of lower case alphanumeric characters, '-' or \
             '.', and must start and end with an alphanumeric character (regex used for \
             validation is '{DNS1123_SUBDOMAIN_REGEX}')"
        ));
    }
    reasons
}

fn port_too_low(min_external_port: u16) -> String {
    format!("The port field should be greater than {min_external_port}")
}

fn require_ids(errors: &mut FieldErrors, rule_id: &str, workload_id: Option<&str>) {
    if is_blank(rule_id) {
        errors.set("rule_id", "The rule_id field is required");
    }
    if workload_id.is_some_and(is_blank) {
        errors.set("workload_id", "The workload_id field is required");
    }
}

fn require_material(errors: &mut FieldErrors, certificate: &str, private_key: &str) {
    if is_blank(certificate) {
        errors.set("certificate", "The certificate field is required");
    }
    if is_blank(private_key) {
        errors.set("private_key", "The private_key field is required");
    }
}

/// Reports only the first malformed entry.
fn extensions(errors: &mut FieldErrors, extensions: &[RuleExtension]) {
    for ext in extensions {
        if ext.key.is_empty() {
            errors.set("key", "The key field is required");
            return;
        }
        if ext.value.is_empty() {
            errors.set("value", "The value field is required");
            return;
        }
    }
}

fn domain_field(errors: &mut FieldErrors, value: &str) {
    let reasons = domain(value);
    if !reasons.is_empty() {
        debug!(domain = %value, reasons = %reasons.join("; "), "Invalid domain");
        errors.set("domain", "The domain field is invalid");
    }
}

fn ip_field(errors: &mut FieldErrors, ip: &str) {
    if let Err(error) = parse_ip(ip) {
        debug!(%ip, %error, "Invalid ip");
        errors.set("ip", "The ip field is invalid");
    }
}
