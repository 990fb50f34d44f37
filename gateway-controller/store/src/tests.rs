use crate::InMemoryStore;
use gateway_controller_core::{
    event::EntityRef,
    store::{PortOwner, PortReservation, RuleStore, StoreError},
    Certificate, HttpRule, PortAddr, TcpRule, UNSPECIFIED_IP,
};
use pretty_assertions::assert_eq;
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;

fn mk_http_rule(id: &str, certificate_id: Option<&str>) -> HttpRule {
    HttpRule {
        rule_id: id.to_string(),
        workload_id: "workload-0".to_string(),
        container_port: 8080,
        domain: format!("{id}.example.com"),
        certificate_id: certificate_id.map(Into::into),
        extensions: vec![],
        configs: vec![],
        version: 0,
    }
}

fn mk_tcp_rule(id: &str, port: u16) -> TcpRule {
    TcpRule {
        rule_id: id.to_string(),
        workload_id: "workload-0".to_string(),
        container_port: 5432,
        ip: UNSPECIFIED_IP,
        port,
        extensions: vec![],
        version: 0,
    }
}

fn addr(port: u16) -> PortAddr {
    PortAddr::new(UNSPECIFIED_IP, port)
}

#[tokio::test]
async fn create_get_delete_round_trip() {
    let store = InMemoryStore::default();

    let created = store
        .create_http_rule(mk_http_rule("r1", None))
        .await
        .unwrap();
    assert_eq!(created.version, 1);
    assert_eq!(store.get_http_rule("r1").await.unwrap(), created);

    let deleted = store.delete_http_rule("r1").await.unwrap();
    assert_eq!(deleted, created);
    assert_eq!(store.get_http_rule("r1").await, Err(StoreError::NotFound));
    assert_eq!(store.delete_http_rule("r1").await, Err(StoreError::NotFound));
}

#[tokio::test]
async fn duplicate_ids_conflict() {
    let store = InMemoryStore::default();
    store
        .create_http_rule(mk_http_rule("r1", None))
        .await
        .unwrap();
    assert!(matches!(
        store.create_http_rule(mk_http_rule("r1", None)).await,
        Err(StoreError::Conflict(_))
    ));
}

#[tokio::test]
async fn stale_updates_conflict() {
    let store = InMemoryStore::default();
    let rule = store
        .create_http_rule(mk_http_rule("r1", None))
        .await
        .unwrap();

    let updated = store
        .update_http_rule(
            HttpRule {
                container_port: 9090,
                ..rule.clone()
            },
            rule.version,
        )
        .await
        .unwrap();
    assert_eq!(updated.version, 2);
    assert_eq!(updated.container_port, 9090);

    // A writer still holding version 1 loses.
    let res = store.update_http_rule(rule.clone(), rule.version).await;
    assert!(matches!(res, Err(StoreError::Conflict(_))), "{res:?}");
    assert_eq!(store.get_http_rule("r1").await.unwrap(), updated);
}

#[tokio::test]
async fn deletes_leave_tombstones_and_recreates_continue_versions() {
    let store = InMemoryStore::default();
    let rule = store.create_tcp_rule(mk_tcp_rule("t1", 20001)).await.unwrap();
    let rule = store.update_tcp_rule(rule.clone(), rule.version).await.unwrap();
    assert_eq!(rule.version, 2);

    store.delete_tcp_rule("t1").await.unwrap();
    let tombstones = store.list_tombstones().await.unwrap();
    assert_eq!(tombstones.len(), 1);
    assert_eq!(tombstones[0].entity, EntityRef::tcp_rule("t1"));
    assert_eq!(tombstones[0].version, 3);

    let recreated = store.create_tcp_rule(mk_tcp_rule("t1", 20001)).await.unwrap();
    assert_eq!(recreated.version, 4);
    assert!(store.list_tombstones().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn prunes_old_tombstones() {
    let store = InMemoryStore::default();
    store.create_tcp_rule(mk_tcp_rule("t1", 20001)).await.unwrap();
    store.delete_tcp_rule("t1").await.unwrap();

    tokio::time::advance(Duration::from_secs(60)).await;
    store.create_tcp_rule(mk_tcp_rule("t2", 20002)).await.unwrap();
    store.delete_tcp_rule("t2").await.unwrap();

    let pruned = store
        .prune_tombstones(Instant::now() - Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(pruned, 1);
    let remaining = store.list_tombstones().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].entity, EntityRef::tcp_rule("t2"));
}

#[tokio::test]
async fn tcp_rules_are_unique_per_addr() {
    let store = InMemoryStore::default();
    store.create_tcp_rule(mk_tcp_rule("t1", 20001)).await.unwrap();
    assert_eq!(
        store.create_tcp_rule(mk_tcp_rule("t2", 20001)).await,
        Err(StoreError::AddrConflict(addr(20001)))
    );
    assert_eq!(
        store.find_tcp_rule_by_addr(addr(20001)).await.unwrap().rule_id,
        "t1"
    );
    assert_eq!(
        store.find_tcp_rule_by_addr(addr(20002)).await,
        Err(StoreError::NotFound)
    );

    let t2 = store.create_tcp_rule(mk_tcp_rule("t2", 20002)).await.unwrap();
    let moved = TcpRule {
        port: 20001,
        ..t2.clone()
    };
    assert_eq!(
        store.update_tcp_rule(moved, t2.version).await,
        Err(StoreError::AddrConflict(addr(20001)))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_have_one_winner() {
    let store = Arc::new(InMemoryStore::default());
    let claims = (0..16).map(|i| {
        let store = store.clone();
        tokio::spawn(async move {
            store
                .claim_port(
                    PortReservation::rule(addr(20001), format!("r{i}")),
                    Instant::now(),
                )
                .await
        })
    });
    let results = futures::future::join_all(claims).await;
    let winners = results
        .into_iter()
        .map(|res| res.expect("task must not panic"))
        .filter(Result::is_ok)
        .count();
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn placeholders_are_promoted_and_expire() {
    let store = InMemoryStore::default();
    let now = Instant::now();

    store
        .claim_port(
            PortReservation::placeholder(addr(20001), now + Duration::from_secs(10)),
            now,
        )
        .await
        .unwrap();
    assert!(store
        .claim_port(
            PortReservation::placeholder(addr(20001), now + Duration::from_secs(10)),
            now
        )
        .await
        .is_err());

    store
        .claim_port(PortReservation::rule(addr(20001), "r1"), now)
        .await
        .unwrap();
    assert_eq!(
        store.get_reservation(addr(20001)).await.unwrap().owner,
        PortOwner::rule("r1")
    );

    store
        .claim_port(
            PortReservation::placeholder(addr(20002), now + Duration::from_secs(10)),
            now,
        )
        .await
        .unwrap();
    let removed = store
        .remove_expired_reservations(now + Duration::from_secs(11))
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert_eq!(store.list_reservations().await.unwrap().len(), 1);
}

#[tokio::test]
async fn release_is_idempotent_and_owner_scoped() {
    let store = InMemoryStore::default();
    let now = Instant::now();
    store
        .claim_port(PortReservation::rule(addr(20001), "r1"), now)
        .await
        .unwrap();

    store
        .release_port(addr(20001), &PortOwner::rule("r2"))
        .await
        .unwrap();
    assert!(store.get_reservation(addr(20001)).await.is_ok());

    store
        .release_port(addr(20001), &PortOwner::rule("r1"))
        .await
        .unwrap();
    store
        .release_port(addr(20001), &PortOwner::rule("r1"))
        .await
        .unwrap();
    assert_eq!(
        store.get_reservation(addr(20001)).await,
        Err(StoreError::NotFound)
    );
}

#[tokio::test]
async fn referenced_certificates_cannot_be_deleted() {
    let store = InMemoryStore::default();
    let cert = store
        .create_certificate(Certificate::new("c1", "cert", "key"))
        .await
        .unwrap();
    assert_eq!(cert.version, 1);

    for id in ["r1", "r2"] {
        store
            .create_http_rule(mk_http_rule(id, Some("c1")))
            .await
            .unwrap();
    }
    store
        .create_http_rule(mk_http_rule("r3", None))
        .await
        .unwrap();

    let mut referencing = store
        .find_http_rules_by_certificate("c1")
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.rule_id)
        .collect::<Vec<_>>();
    referencing.sort();
    assert_eq!(referencing, vec!["r1", "r2"]);

    assert!(matches!(
        store.delete_certificate("c1").await,
        Err(StoreError::Conflict(_))
    ));

    store.delete_http_rule("r1").await.unwrap();
    store.delete_http_rule("r2").await.unwrap();
    assert_eq!(store.delete_certificate("c1").await.unwrap(), cert);
    assert_eq!(
        store.delete_certificate("c1").await,
        Err(StoreError::NotFound)
    );
}
