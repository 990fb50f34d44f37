use crate::validation;
use gateway_controller_core::{
    event::{Operation, PropagationEvent},
    request::UpdateCertificate,
    store::{RuleStore, StoreError},
    Certificate, Error,
};
use gateway_controller_propagate::Propagator;
use std::sync::Arc;
use tracing::{debug, info};

/// Owns certificate records and re-propagates the rules that embed them.
#[derive(Debug)]
pub struct CertificateManager<S> {
    store: Arc<S>,
    propagator: Propagator,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateUpdate {
    pub certificate: Certificate,

    /// The number of referencing rules re-sent to the data plane.
    pub cascaded: usize,
}

// === impl CertificateManager ===

impl<S: RuleStore> CertificateManager<S> {
    pub fn new(store: Arc<S>, propagator: Propagator) -> Self {
        Self { store, propagator }
    }

    /// Replaces the material of an existing certificate and re-sends every rule that
    /// references it.
    pub async fn upsert(&self, req: &UpdateCertificate) -> Result<CertificateUpdate, Error> {
        validation::certificate(req).into_result()?;
        let id = req.certificate_id.trim();
        let current = self
            .store
            .get_certificate(id)
            .await
            .map_err(|error| Error::store(error, format_args!("certificate {id}")))?;
        let certificate = Certificate {
            version: current.version,
            ..Certificate::new(id, &req.certificate, &req.private_key)
        };
        self.replace(certificate, current.version).await
    }

    /// Makes the stored certificate match material supplied with a rule, creating it on first
    /// use. Identical material is left untouched so re-submitting a rule does not cascade.
    pub async fn ensure(&self, certificate: Certificate) -> Result<Certificate, Error> {
        let id = certificate.certificate_id.clone();
        match self.store.get_certificate(&id).await {
            Ok(current) if current.same_material(&certificate) => Ok(current),
            Ok(current) => {
                let version = current.version;
                let update = self.replace(Certificate { version, ..certificate }, version).await?;
                Ok(update.certificate)
            }
            Err(StoreError::NotFound) => match self.store.create_certificate(certificate).await {
                Ok(created) => {
                    info!(certificate_id = %id, "Created certificate");
                    Ok(created)
                }
                Err(error) => Err(Error::store(error, format_args!("certificate {id}"))),
            },
            Err(error) => Err(Error::store(error, format_args!("certificate {id}"))),
        }
    }

    /// Removes an unreferenced certificate.
    pub async fn delete(&self, certificate_id: &str) -> Result<Certificate, Error> {
        validation::certificate_id(certificate_id).into_result()?;
        let id = certificate_id.trim();
        let deleted = self
            .store
            .delete_certificate(id)
            .await
            .map_err(|error| Error::store(error, format_args!("certificate {id}")))?;
        info!(certificate_id = %id, "Deleted certificate");
        Ok(deleted)
    }

    async fn replace(
        &self,
        certificate: Certificate,
        expected_version: u64,
    ) -> Result<CertificateUpdate, Error> {
        let id = certificate.certificate_id.clone();
        let certificate = self
            .store
            .update_certificate(certificate, expected_version)
            .await
            .map_err(|error| Error::store(error, format_args!("certificate {id}")))?;
        let cascaded = self.cascade(&certificate).await?;
        info!(
            certificate_id = %id,
            version = certificate.version,
            cascaded,
            "Updated certificate"
        );
        Ok(CertificateUpdate {
            certificate,
            cascaded,
        })
    }

    /// Re-sends every referencing rule with the new material. Rule versions are unchanged; the
    /// events order after earlier ones by their certificate version.
    ///
    /// Only the lookup runs on the caller's task. The events are enqueued in the background, so
    /// a full propagation queue never delays or fails the update.
    async fn cascade(&self, certificate: &Certificate) -> Result<usize, Error> {
        let rules = self
            .store
            .find_http_rules_by_certificate(&certificate.certificate_id)
            .await
            .map_err(|error| {
                Error::store(
                    error,
                    format_args!("rules of certificate {}", certificate.certificate_id),
                )
            })?;

        let events = rules
            .into_iter()
            .map(|rule| {
                debug!(rule_id = %rule.rule_id, version = rule.version, "Re-sending rule");
                PropagationEvent::http_rule(Operation::Update, rule, Some(certificate.clone()))
            })
            .collect::<Vec<_>>();
        let cascaded = events.len();
        self.propagator.submit_all(events);
        Ok(cascaded)
    }
}
