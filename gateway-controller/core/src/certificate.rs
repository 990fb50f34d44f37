use crate::rule::is_blank;
use serde::{Deserialize, Serialize};
use std::fmt;

/// TLS material referenced by HTTP rules through `certificate_id`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub certificate_id: String,
    pub certificate: String,
    pub private_key: String,
    pub version: u64,
}

impl Certificate {
    pub fn new(
        certificate_id: impl Into<String>,
        certificate: impl Into<String>,
        private_key: impl Into<String>,
    ) -> Self {
        Self {
            certificate_id: certificate_id.into(),
            certificate: certificate.into(),
            private_key: private_key.into(),
            version: 0,
        }
    }

    /// Both PEM payloads are present.
    pub fn is_complete(&self) -> bool {
        !is_blank(&self.certificate) && !is_blank(&self.private_key)
    }

    /// Compares the PEM payloads, ignoring the version.
    pub fn same_material(&self, other: &Self) -> bool {
        self.certificate == other.certificate && self.private_key == other.private_key
    }
}

// Keys never end up in logs.
impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("certificate_id", &self.certificate_id)
            .field("certificate_len", &self.certificate.len())
            .field("private_key", &"<redacted>")
            .field("version", &self.version)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_private_key() {
        let cert = Certificate::new("c1", "-----BEGIN CERTIFICATE-----", "super-secret");
        let debug = format!("{cert:?}");
        assert!(!debug.contains("super-secret"), "{debug}");
        assert!(debug.contains("c1"));
    }

    #[test]
    fn completeness() {
        assert!(Certificate::new("c1", "cert", "key").is_complete());
        assert!(!Certificate::new("c1", "", "key").is_complete());
        assert!(!Certificate::new("c1", "cert", "  ").is_complete());
    }
}
