use ahash::AHashMap as HashMap;
use gateway_controller_core::{
    event::{EntityKind, EntityRef},
    store::{PortOwner, PortReservation, RuleStore, StoreError, Tombstone},
    Certificate, HttpRule, PortAddr, TcpRule,
};
use parking_lot::RwLock;
use std::{collections::hash_map::Entry, sync::Arc};
use tokio::time::Instant;

pub type SharedStore = Arc<InMemoryStore>;

#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

#[derive(Debug, Default)]
pub(crate) struct State {
    pub(crate) http_rules: HashMap<String, HttpRule>,
    pub(crate) tcp_rules: HashMap<String, TcpRule>,
    pub(crate) certificates: HashMap<String, Certificate>,
    pub(crate) reservations: HashMap<PortAddr, PortReservation>,
    pub(crate) tombstones: HashMap<EntityRef, Tombstone>,

    /// The highest version ever issued per rule, including delete versions. Never pruned, so a
    /// rule re-created under a deleted id continues past its delete event.
    versions: HashMap<EntityRef, u64>,
}

// === impl InMemoryStore ===

impl InMemoryStore {
    pub fn shared() -> SharedStore {
        Arc::new(Self::default())
    }

    pub(crate) fn read(&self) -> parking_lot::RwLockReadGuard<'_, State> {
        self.state.read()
    }
}

// === impl State ===

impl State {
    fn next_create_version(&mut self, entity: EntityRef) -> u64 {
        self.tombstones.remove(&entity);
        let version = self.versions.entry(entity).or_default();
        *version += 1;
        *version
    }

    fn bump(&mut self, entity: EntityRef, version: u64) {
        self.versions.insert(entity, version);
    }

    fn bury(&mut self, entity: EntityRef, last_version: u64) {
        let version = last_version + 1;
        self.versions.insert(entity.clone(), version);
        self.tombstones.insert(
            entity.clone(),
            Tombstone {
                entity,
                version,
                deleted_at: Instant::now(),
            },
        );
    }

    fn tcp_addr_owner(&self, addr: PortAddr) -> Option<&TcpRule> {
        self.tcp_rules.values().find(|r| r.addr() == addr)
    }
}

fn stale(kind: &str, id: &str, expected: u64, stored: u64) -> StoreError {
    StoreError::Conflict(format!(
        "{kind} {id} was modified concurrently: expected version {expected}, found {stored}"
    ))
}

#[async_trait::async_trait]
impl RuleStore for InMemoryStore {
    async fn get_http_rule(&self, rule_id: &str) -> Result<HttpRule, StoreError> {
        self.state
            .read()
            .http_rules
            .get(rule_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn list_http_rules(&self) -> Result<Vec<HttpRule>, StoreError> {
        Ok(self.state.read().http_rules.values().cloned().collect())
    }

    async fn create_http_rule(&self, mut rule: HttpRule) -> Result<HttpRule, StoreError> {
        let mut state = self.state.write();
        if state.http_rules.contains_key(&rule.rule_id) {
            return Err(StoreError::Conflict(format!(
                "http rule {} already exists",
                rule.rule_id
            )));
        }
        rule.version = state.next_create_version(EntityRef::http_rule(rule.rule_id.clone()));
        state.http_rules.insert(rule.rule_id.clone(), rule.clone());
        tracing::trace!(rule_id = %rule.rule_id, version = rule.version, "Created http rule");
        Ok(rule)
    }

    async fn update_http_rule(
        &self,
        mut rule: HttpRule,
        expected_version: u64,
    ) -> Result<HttpRule, StoreError> {
        let mut state = self.state.write();
        let stored = state
            .http_rules
            .get_mut(&rule.rule_id)
            .ok_or(StoreError::NotFound)?;
        if stored.version != expected_version {
            return Err(stale(
                "http rule",
                &rule.rule_id,
                expected_version,
                stored.version,
            ));
        }
        rule.version = expected_version + 1;
        *stored = rule.clone();
        state.bump(EntityRef::http_rule(rule.rule_id.clone()), rule.version);
        Ok(rule)
    }

    async fn delete_http_rule(&self, rule_id: &str) -> Result<HttpRule, StoreError> {
        let mut state = self.state.write();
        let rule = state
            .http_rules
            .remove(rule_id)
            .ok_or(StoreError::NotFound)?;
        state.bury(EntityRef::http_rule(rule_id), rule.version);
        Ok(rule)
    }

    async fn find_http_rules_by_certificate(
        &self,
        certificate_id: &str,
    ) -> Result<Vec<HttpRule>, StoreError> {
        Ok(self
            .state
            .read()
            .http_rules
            .values()
            .filter(|r| r.certificate_ref() == Some(certificate_id))
            .cloned()
            .collect())
    }

    async fn get_tcp_rule(&self, rule_id: &str) -> Result<TcpRule, StoreError> {
        self.state
            .read()
            .tcp_rules
            .get(rule_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn list_tcp_rules(&self) -> Result<Vec<TcpRule>, StoreError> {
        Ok(self.state.read().tcp_rules.values().cloned().collect())
    }

    async fn create_tcp_rule(&self, mut rule: TcpRule) -> Result<TcpRule, StoreError> {
        let mut state = self.state.write();
        if state.tcp_rules.contains_key(&rule.rule_id) {
            return Err(StoreError::Conflict(format!(
                "tcp rule {} already exists",
                rule.rule_id
            )));
        }
        if let Some(other) = state.tcp_addr_owner(rule.addr()) {
            tracing::debug!(addr = %rule.addr(), owner = %other.rule_id, "Address already in use");
            return Err(StoreError::AddrConflict(rule.addr()));
        }
        rule.version = state.next_create_version(EntityRef::tcp_rule(rule.rule_id.clone()));
        state.tcp_rules.insert(rule.rule_id.clone(), rule.clone());
        tracing::trace!(rule_id = %rule.rule_id, version = rule.version, "Created tcp rule");
        Ok(rule)
    }

    async fn update_tcp_rule(
        &self,
        mut rule: TcpRule,
        expected_version: u64,
    ) -> Result<TcpRule, StoreError> {
        let mut state = self.state.write();
        match state.tcp_rules.get(&rule.rule_id) {
            None => return Err(StoreError::NotFound),
            Some(stored) if stored.version != expected_version => {
                return Err(stale(
                    "tcp rule",
                    &rule.rule_id,
                    expected_version,
                    stored.version,
                ));
            }
            Some(_) => {}
        }
        if let Some(other) = state
            .tcp_addr_owner(rule.addr())
            .filter(|other| other.rule_id != rule.rule_id)
        {
            tracing::debug!(addr = %rule.addr(), owner = %other.rule_id, "Address already in use");
            return Err(StoreError::AddrConflict(rule.addr()));
        }
        rule.version = expected_version + 1;
        state.tcp_rules.insert(rule.rule_id.clone(), rule.clone());
        state.bump(EntityRef::tcp_rule(rule.rule_id.clone()), rule.version);
        Ok(rule)
    }

    async fn delete_tcp_rule(&self, rule_id: &str) -> Result<TcpRule, StoreError> {
        let mut state = self.state.write();
        let rule = state.tcp_rules.remove(rule_id).ok_or(StoreError::NotFound)?;
        state.bury(EntityRef::tcp_rule(rule_id), rule.version);
        Ok(rule)
    }

    async fn find_tcp_rule_by_addr(&self, addr: PortAddr) -> Result<TcpRule, StoreError> {
        self.state
            .read()
            .tcp_addr_owner(addr)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn get_certificate(&self, certificate_id: &str) -> Result<Certificate, StoreError> {
        self.state
            .read()
            .certificates
            .get(certificate_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn create_certificate(
        &self,
        mut certificate: Certificate,
    ) -> Result<Certificate, StoreError> {
        let mut state = self.state.write();
        match state.certificates.entry(certificate.certificate_id.clone()) {
            Entry::Occupied(_) => Err(StoreError::Conflict(format!(
                "certificate {} already exists",
                certificate.certificate_id
            ))),
            Entry::Vacant(entry) => {
                certificate.version = 1;
                entry.insert(certificate.clone());
                Ok(certificate)
            }
        }
    }

    async fn update_certificate(
        &self,
        mut certificate: Certificate,
        expected_version: u64,
    ) -> Result<Certificate, StoreError> {
        let mut state = self.state.write();
        let stored = state
            .certificates
            .get_mut(&certificate.certificate_id)
            .ok_or(StoreError::NotFound)?;
        if stored.version != expected_version {
            return Err(stale(
                "certificate",
                &certificate.certificate_id,
                expected_version,
                stored.version,
            ));
        }
        certificate.version = expected_version + 1;
        *stored = certificate.clone();
        Ok(certificate)
    }

    async fn delete_certificate(&self, certificate_id: &str) -> Result<Certificate, StoreError> {
        let mut state = self.state.write();
        if !state.certificates.contains_key(certificate_id) {
            return Err(StoreError::NotFound);
        }
        let referenced_by = state
            .http_rules
            .values()
            .filter(|r| r.certificate_ref() == Some(certificate_id))
            .count();
        if referenced_by > 0 {
            return Err(StoreError::Conflict(format!(
                "certificate {certificate_id} is referenced by {referenced_by} http rule(s)"
            )));
        }
        state
            .certificates
            .remove(certificate_id)
            .ok_or(StoreError::NotFound)
    }

    async fn get_reservation(&self, addr: PortAddr) -> Result<PortReservation, StoreError> {
        self.state
            .read()
            .reservations
            .get(&addr)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn claim_port(
        &self,
        reservation: PortReservation,
        now: Instant,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write();
        match state.reservations.entry(reservation.addr) {
            Entry::Vacant(entry) => {
                entry.insert(reservation);
                Ok(())
            }
            Entry::Occupied(mut entry) => {
                if !entry.get().yields_to(&reservation, now) {
                    return Err(StoreError::Conflict(format!(
                        "{} is held by {}",
                        reservation.addr,
                        entry.get().owner
                    )));
                }
                entry.insert(reservation);
                Ok(())
            }
        }
    }

    async fn release_port(&self, addr: PortAddr, owner: &PortOwner) -> Result<(), StoreError> {
        let mut state = self.state.write();
        if let Entry::Occupied(entry) = state.reservations.entry(addr) {
            if entry.get().owner == *owner {
                entry.remove();
            }
        }
        Ok(())
    }

    async fn list_reservations(&self) -> Result<Vec<PortReservation>, StoreError> {
        Ok(self.state.read().reservations.values().cloned().collect())
    }

    async fn remove_expired_reservations(&self, now: Instant) -> Result<usize, StoreError> {
        let mut state = self.state.write();
        let before = state.reservations.len();
        state.reservations.retain(|_, r| r.is_live(now));
        Ok(before - state.reservations.len())
    }

    async fn list_tombstones(&self) -> Result<Vec<Tombstone>, StoreError> {
        Ok(self.state.read().tombstones.values().cloned().collect())
    }

    async fn prune_tombstones(&self, before: Instant) -> Result<usize, StoreError> {
        let mut state = self.state.write();
        let len = state.tombstones.len();
        state.tombstones.retain(|_, t| t.deleted_at >= before);
        Ok(len - state.tombstones.len())
    }
}

impl State {
    pub(crate) fn count_tombstones(&self, kind: EntityKind) -> usize {
        self.tombstones.keys().filter(|e| e.kind == kind).count()
    }
}
