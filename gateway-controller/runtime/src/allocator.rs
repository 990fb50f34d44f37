use crate::ports::ReservedPorts;
use ahash::AHashSet as HashSet;
use gateway_controller_core::{
    store::{PortOwner, PortReservation, RuleStore, StoreError},
    Error, PortAddr,
};
use std::{net::IpAddr, sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Clone, Debug)]
pub struct AllocatorConfig {
    /// External ports must be strictly greater than this.
    pub min_external_port: u16,
    pub max_external_port: u16,
    pub reserved: ReservedPorts,

    /// How long a port handed out with `lock` stays claimed for a follow-up add.
    pub placeholder_ttl: Duration,
}

/// Guards the external `(ip, port)` space shared by all TCP rules.
///
/// Every claim is a single store operation, so concurrent reservations of one pair are
/// linearised by the store rather than by a lock held here.
#[derive(Debug)]
pub struct PortAllocator<S> {
    store: Arc<S>,
    config: AllocatorConfig,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            min_external_port: 1024,
            max_external_port: u16::MAX,
            reserved: ReservedPorts::default(),
            placeholder_ttl: Duration::from_secs(300),
        }
    }
}

// === impl PortAllocator ===

impl<S: RuleStore> PortAllocator<S> {
    pub fn new(store: Arc<S>, config: AllocatorConfig) -> Self {
        Self { store, config }
    }

    pub fn min_external_port(&self) -> u16 {
        self.config.min_external_port
    }

    pub fn check_range(&self, port: u16) -> Result<(), Error> {
        let AllocatorConfig {
            min_external_port: min,
            max_external_port: max,
            ..
        } = self.config;
        if port <= min || port > max {
            return Err(Error::PortOutOfRange { port, min, max });
        }
        Ok(())
    }

    /// Returns true if no live reservation holds the pair.
    pub async fn check_available(&self, addr: PortAddr) -> Result<bool, Error> {
        match self.store.get_reservation(addr).await {
            Ok(reservation) => Ok(!reservation.is_live(Instant::now())),
            Err(StoreError::NotFound) => Ok(true),
            Err(error) => Err(Error::store(error, addr)),
        }
    }

    /// Claims the pair for `rule_id`. Re-reserving a pair the rule already holds succeeds, and
    /// a placeholder left by port discovery is taken over.
    pub async fn reserve(&self, addr: PortAddr, rule_id: &str) -> Result<(), Error> {
        self.check_range(addr.port)?;
        match self
            .store
            .claim_port(PortReservation::rule(addr, rule_id), Instant::now())
            .await
        {
            Ok(()) => {
                debug!(%addr, %rule_id, "Reserved port");
                Ok(())
            }
            Err(reason @ (StoreError::Conflict(_) | StoreError::AddrConflict(_))) => {
                debug!(%addr, %rule_id, %reason, "Port is already reserved");
                Err(Error::PortConflict(addr))
            }
            Err(error) => Err(Error::store(error, addr)),
        }
    }

    /// Releases the pair if `rule_id` holds it. Releasing an unreserved pair is not an error.
    pub async fn release(&self, addr: PortAddr, rule_id: &str) -> Result<(), Error> {
        self.store
            .release_port(addr, &PortOwner::rule(rule_id))
            .await
            .map_err(|error| Error::store(error, addr))?;
        debug!(%addr, %rule_id, "Released port");
        Ok(())
    }

    /// Returns the lowest free port on `ip`. With `lock`, the port is claimed by a placeholder
    /// until it is reserved by a rule or the placeholder expires.
    pub async fn find_available(&self, ip: IpAddr, lock: bool) -> Result<u16, Error> {
        let now = Instant::now();
        let taken = self
            .store
            .list_reservations()
            .await
            .map_err(|error| Error::store(error, "port reservations"))?
            .into_iter()
            .filter(|r| r.addr.ip == ip && r.is_live(now))
            .map(|r| r.addr.port)
            .collect::<HashSet<_>>();

        let AllocatorConfig {
            min_external_port: min,
            max_external_port: max,
            ref reserved,
            placeholder_ttl,
        } = self.config;
        let candidates = (u32::from(min) + 1..=u32::from(max))
            .filter_map(|p| u16::try_from(p).ok())
            .filter(|p| !reserved.contains(*p) && !taken.contains(p));

        for port in candidates {
            if !lock {
                return Ok(port);
            }

            let addr = PortAddr::new(ip, port);
            let placeholder = PortReservation::placeholder(addr, now + placeholder_ttl);
            match self.store.claim_port(placeholder, now).await {
                Ok(()) => {
                    debug!(%addr, ttl = ?placeholder_ttl, "Locked port");
                    return Ok(port);
                }
                // Lost a race with a concurrent claim; try the next port.
                Err(StoreError::Conflict(_) | StoreError::AddrConflict(_)) => continue,
                Err(error) => return Err(Error::store(error, addr)),
            }
        }

        info!(%ip, min, max, "External port range is exhausted");
        Err(Error::CapacityExhausted(ip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_controller_core::UNSPECIFIED_IP;
    use gateway_controller_store::InMemoryStore;

    fn allocator(min: u16, max: u16) -> PortAllocator<InMemoryStore> {
        PortAllocator::new(
            Arc::new(InMemoryStore::default()),
            AllocatorConfig {
                min_external_port: min,
                max_external_port: max,
                reserved: ReservedPorts::default(),
                placeholder_ttl: Duration::from_secs(10),
            },
        )
    }

    fn addr(port: u16) -> PortAddr {
        PortAddr::new(UNSPECIFIED_IP, port)
    }

    #[tokio::test]
    async fn rejects_ports_outside_range() {
        let ports = allocator(1024, 2000);
        assert!(matches!(
            ports.reserve(addr(1024), "r1").await,
            Err(Error::PortOutOfRange { port: 1024, min: 1024, max: 2000 })
        ));
        assert!(matches!(
            ports.reserve(addr(2001), "r1").await,
            Err(Error::PortOutOfRange { .. })
        ));
        ports.reserve(addr(1025), "r1").await.unwrap();
        ports.reserve(addr(2000), "r2").await.unwrap();
    }

    #[tokio::test]
    async fn reserve_is_exclusive_and_release_frees() {
        let ports = allocator(1024, 2000);
        ports.reserve(addr(1500), "r1").await.unwrap();
        ports.reserve(addr(1500), "r1").await.unwrap();
        assert!(matches!(
            ports.reserve(addr(1500), "r2").await,
            Err(Error::PortConflict(a)) if a == addr(1500)
        ));
        assert!(!ports.check_available(addr(1500)).await.unwrap());

        // Only the owner releases.
        ports.release(addr(1500), "r2").await.unwrap();
        assert!(!ports.check_available(addr(1500)).await.unwrap());
        ports.release(addr(1500), "r1").await.unwrap();
        ports.release(addr(1500), "r1").await.unwrap();
        assert!(ports.check_available(addr(1500)).await.unwrap());
        ports.reserve(addr(1500), "r2").await.unwrap();
    }

    #[tokio::test]
    async fn pairs_are_scoped_by_ip() {
        let ports = allocator(1024, 2000);
        let other = PortAddr::new("10.0.0.1".parse().unwrap(), 1500);
        ports.reserve(addr(1500), "r1").await.unwrap();
        ports.reserve(other, "r2").await.unwrap();
    }

    #[tokio::test]
    async fn finds_lowest_free_port() {
        let ports = allocator(1024, 1030);
        assert_eq!(ports.find_available(UNSPECIFIED_IP, false).await.unwrap(), 1025);
        // Without a lock nothing is claimed.
        assert_eq!(ports.find_available(UNSPECIFIED_IP, false).await.unwrap(), 1025);

        ports.reserve(addr(1025), "r1").await.unwrap();
        assert_eq!(ports.find_available(UNSPECIFIED_IP, false).await.unwrap(), 1026);
    }

    #[tokio::test]
    async fn skips_reserved_ports() {
        let ports = PortAllocator::new(
            Arc::new(InMemoryStore::default()),
            AllocatorConfig {
                min_external_port: 1024,
                max_external_port: 1030,
                reserved: "1025-1027".parse().unwrap(),
                placeholder_ttl: Duration::from_secs(10),
            },
        );
        assert_eq!(ports.find_available(UNSPECIFIED_IP, false).await.unwrap(), 1028);
    }

    #[tokio::test(start_paused = true)]
    async fn locked_ports_are_not_handed_out_twice_until_expiry() {
        let ports = allocator(1024, 1026);
        assert_eq!(ports.find_available(UNSPECIFIED_IP, true).await.unwrap(), 1025);
        assert_eq!(ports.find_available(UNSPECIFIED_IP, true).await.unwrap(), 1026);
        assert!(matches!(
            ports.find_available(UNSPECIFIED_IP, true).await,
            Err(Error::CapacityExhausted(_))
        ));

        // A rule may claim a locked port.
        ports.reserve(addr(1025), "r1").await.unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(ports.find_available(UNSPECIFIED_IP, true).await.unwrap(), 1026);
    }

    #[tokio::test]
    async fn empty_range_is_exhausted() {
        let ports = allocator(u16::MAX, u16::MAX);
        assert!(matches!(
            ports.find_available(UNSPECIFIED_IP, false).await,
            Err(Error::CapacityExhausted(ip)) if ip == UNSPECIFIED_IP
        ));
    }
}
