use crate::index::{InMemoryStore, SharedStore};
use gateway_controller_core::{event::EntityKind, store::PortOwner};
use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeMetric},
    metrics::{gauge::ConstGauge, MetricType},
    registry::Registry,
};

#[derive(Debug)]
struct Instrumented(SharedStore);

pub fn register(reg: &mut Registry, store: SharedStore) {
    reg.register_collector(Box::new(Instrumented(store)));
}

impl Collector for Instrumented {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let store: &InMemoryStore = &self.0;
        let state = store.read();

        let mut rules_encoder = encoder.encode_descriptor(
            "rule_index_size",
            "The number of rules in the store",
            None,
            MetricType::Gauge,
        )?;
        for (kind, len) in [
            (EntityKind::HttpRule, state.http_rules.len()),
            (EntityKind::TcpRule, state.tcp_rules.len()),
        ] {
            let labels = [("kind", kind.as_str())];
            let rules = ConstGauge::new(len as i64);
            rules.encode(rules_encoder.encode_family(&labels)?)?;
        }

        let certificates = encoder.encode_descriptor(
            "certificate_index_size",
            "The number of certificates in the store",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(state.certificates.len() as i64).encode(certificates)?;

        let placeholders = state
            .reservations
            .values()
            .filter(|r| r.owner == PortOwner::Placeholder)
            .count();
        let mut reservations_encoder = encoder.encode_descriptor(
            "port_reservation_index_size",
            "The number of reserved external ports",
            None,
            MetricType::Gauge,
        )?;
        for (owner, len) in [
            ("rule", state.reservations.len() - placeholders),
            ("placeholder", placeholders),
        ] {
            let labels = [("owner", owner)];
            let reservations = ConstGauge::new(len as i64);
            reservations.encode(reservations_encoder.encode_family(&labels)?)?;
        }

        let mut tombstones_encoder = encoder.encode_descriptor(
            "tombstone_index_size",
            "The number of deleted rules whose delete events are still re-sent",
            None,
            MetricType::Gauge,
        )?;
        for kind in [EntityKind::HttpRule, EntityKind::TcpRule] {
            let labels = [("kind", kind.as_str())];
            let tombstones = ConstGauge::new(state.count_tombstones(kind) as i64);
            tombstones.encode(tombstones_encoder.encode_family(&labels)?)?;
        }

        Ok(())
    }
}
