//! End-to-end channel tests over real sockets on the loopback interface.

use std::{
    collections::{BTreeMap, HashSet},
    future::Future,
    net::SocketAddr,
    path::Path,
    time::Duration,
};

use bytes::Bytes;
use palisade_amqp::message::{DeliveryState, OutboundMessage, PropertyValue};
use palisade_common::{
    config::{NodeConfig, SignatureScheme},
    constants::{
        CLIENT_TLS_ALIAS, ROOT_CA_ALIAS, SSL_KEYSTORE_FILE, TRUSTSTORE_FILE,
    },
    logger,
    x500::LegalName,
};
use palisade_pki::{
    cert::{
        CA_LIFETIME, CertRole, TLS_LIFETIME, create_certificate,
        create_self_signed,
    },
    keypair::NodeKeyPair,
    keystore::CredentialStore,
    types::DerCert,
};
use tokio::time::timeout;

use crate::{
    ChannelError,
    client::{PeerClient, PeerClientConfig},
    server::{PeerServer, PeerServerConfig},
    tls::TlsMaterial,
};

const PW: &str = "integration-test-pw";

fn alice() -> LegalName {
    LegalName::new("Alice Corp", "Madrid", "ES").unwrap()
}

fn bob() -> LegalName {
    LegalName::new("Bob Plc", "London", "GB").unwrap()
}

fn charlie() -> LegalName {
    LegalName::new("Charlie Ltd", "Paris", "FR").unwrap()
}

struct Zone {
    root_key: NodeKeyPair,
    root: DerCert,
}

fn zone() -> Zone {
    let root_key = NodeKeyPair::generate(SignatureScheme::default()).unwrap();
    let root = create_self_signed(
        CertRole::RootCa,
        &LegalName::new("Zone Root", "London", "GB").unwrap(),
        &root_key,
        CA_LIFETIME,
    )
    .unwrap();
    Zone { root_key, root }
}

/// Issue a node CA + TLS leaf for `name` and assemble transport material,
/// all in memory.
fn material_for(zone: &Zone, name: &LegalName) -> TlsMaterial {
    let node_ca_key =
        NodeKeyPair::generate(SignatureScheme::default()).unwrap();
    let node_ca = create_certificate(
        CertRole::NodeCa,
        &zone.root,
        &zone.root_key,
        name,
        node_ca_key.rcgen(),
        CA_LIFETIME,
    )
    .unwrap();
    let tls_key = NodeKeyPair::generate(SignatureScheme::default()).unwrap();
    let tls_cert = create_certificate(
        CertRole::Tls,
        &node_ca,
        &node_ca_key,
        name,
        tls_key.rcgen(),
        TLS_LIFETIME,
    )
    .unwrap();

    TlsMaterial::from_parts(
        name.clone(),
        vec![tls_cert, node_ca, zone.root.clone()],
        tls_key.serialize_pkcs8_der().into(),
        zone.root.clone(),
    )
    .unwrap()
}

/// The same, but routed through on-disk credential stores the way a
/// production node loads them.
fn material_via_stores(
    dir: &Path,
    zone: &Zone,
    name: &LegalName,
) -> TlsMaterial {
    let node_ca_key =
        NodeKeyPair::generate(SignatureScheme::default()).unwrap();
    let node_ca = create_certificate(
        CertRole::NodeCa,
        &zone.root,
        &zone.root_key,
        name,
        node_ca_key.rcgen(),
        CA_LIFETIME,
    )
    .unwrap();
    let tls_key = NodeKeyPair::generate(SignatureScheme::default()).unwrap();
    let tls_cert = create_certificate(
        CertRole::Tls,
        &node_ca,
        &node_ca_key,
        name,
        tls_key.rcgen(),
        TLS_LIFETIME,
    )
    .unwrap();

    let mut ssl_store = CredentialStore::new();
    ssl_store
        .put_key_entry(
            CLIENT_TLS_ALIAS,
            &tls_key.serialize_pkcs8_der(),
            PW,
            vec![tls_cert, node_ca, zone.root.clone()],
        )
        .unwrap();
    ssl_store.save(&dir.join(SSL_KEYSTORE_FILE), PW).unwrap();

    let mut truststore = CredentialStore::new();
    truststore.put_trusted_cert(ROOT_CA_ALIAS, zone.root.clone());
    truststore.save(&dir.join(TRUSTSTORE_FILE), PW).unwrap();

    let config = NodeConfig::new(name.clone(), dir, PW, PW);
    TlsMaterial::load(&config).unwrap()
}

fn message_to(
    name: &LegalName,
    addr: SocketAddr,
    payload: &'static [u8],
) -> OutboundMessage {
    OutboundMessage {
        payload: Bytes::from_static(payload),
        topic: "p2p.inbound".to_owned(),
        destination_legal_name: name.clone(),
        destination_address: addr,
        application_properties: BTreeMap::from([(
            "platform-version".to_owned(),
            PropertyValue::Long(4),
        )]),
    }
}

async fn within<T>(fut: impl Future<Output = T>) -> T {
    timeout(Duration::from_secs(30), fut)
        .await
        .expect("Test future timed out")
}

#[tokio::test(flavor = "multi_thread")]
async fn message_roundtrip_with_acknowledgement() {
    logger::init_for_testing();
    let zone = zone();
    // ALICE's material goes through on-disk stores, as a real node's would.
    let dir = tempfile::tempdir().unwrap();
    let alice_material = material_via_stores(dir.path(), &zone, &alice());
    let bob_material = material_for(&zone, &bob());

    let server = PeerServer::bind(
        &alice_material,
        PeerServerConfig::new("127.0.0.1:0".parse().unwrap()),
    )
    .await
    .unwrap();
    let server_addr = server.local_addr();

    let mut client_cfg = PeerClientConfig::new(vec![server_addr]);
    client_cfg.allowed_remote_legal_names =
        Some(HashSet::from([alice()]));
    let client = PeerClient::new(&bob_material, client_cfg).unwrap();

    let mut client_events = client.on_connection();
    let mut server_events = server.on_connection();
    let mut inbound = server.on_receive();
    client.start();

    let change = within(client_events.next()).await;
    assert!(change.connected);
    assert_eq!(change.remote_address, server_addr);
    assert_eq!(change.remote_legal_name, Some(alice()));

    let server_saw = within(server_events.next()).await;
    assert!(server_saw.connected);
    assert_eq!(server_saw.remote_legal_name, Some(bob()));

    let receipt = client.send(message_to(&alice(), server_addr, b"Test"));
    let msg = within(inbound.next()).await;
    assert_eq!(msg.payload, Bytes::from_static(b"Test"));
    assert_eq!(msg.topic, "p2p.inbound");
    assert_eq!(msg.source_legal_name, bob());
    assert_eq!(
        msg.application_properties,
        BTreeMap::from([(
            "platform-version".to_owned(),
            PropertyValue::Long(4),
        )]),
    );

    msg.complete(true);
    assert_eq!(
        within(receipt.outcome()).await,
        DeliveryState::Acknowledged,
    );

    // Rejection flows back too.
    let receipt = client.send(message_to(&alice(), server_addr, b"bad"));
    let msg = within(inbound.next()).await;
    msg.complete(false);
    assert_eq!(within(receipt.outcome()).await, DeliveryState::Rejected);

    client.stop().await;
    let change = within(client_events.next_filtered(|c| !c.connected)).await;
    assert_eq!(change.remote_address, server_addr);
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unexpected_peer_is_refused() {
    logger::init_for_testing();
    let zone = zone();
    // The server's cert chain is perfectly valid; only its name is wrong.
    let rogue = LegalName::new("Rogue", "London", "GB").unwrap();
    let server = PeerServer::bind(
        &material_for(&zone, &rogue),
        PeerServerConfig::new("127.0.0.1:0".parse().unwrap()),
    )
    .await
    .unwrap();

    let mut client_cfg = PeerClientConfig::new(vec![server.local_addr()]);
    client_cfg.allowed_remote_legal_names =
        Some(HashSet::from([alice(), charlie()]));
    let client =
        PeerClient::new(&material_for(&zone, &bob()), client_cfg).unwrap();
    let mut client_events = client.on_connection();
    client.start();

    // The very first event is a refusal; no connection ever establishes.
    let change = within(client_events.next()).await;
    assert!(!change.connected);
    assert_eq!(change.remote_legal_name, None);

    client.stop().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_allow_list_refuses_everyone() {
    logger::init_for_testing();
    let zone = zone();
    let server = PeerServer::bind(
        &material_for(&zone, &alice()),
        PeerServerConfig::new("127.0.0.1:0".parse().unwrap()),
    )
    .await
    .unwrap();

    let mut client_cfg = PeerClientConfig::new(vec![server.local_addr()]);
    client_cfg.allowed_remote_legal_names = Some(HashSet::new());
    let client =
        PeerClient::new(&material_for(&zone, &bob()), client_cfg).unwrap();
    let mut client_events = client.on_connection();
    client.start();

    let change = within(client_events.next()).await;
    assert!(!change.connected);

    client.stop().await;
    server.stop().await;
}

fn reserve_port() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

#[tokio::test(flavor = "multi_thread")]
async fn failover_walks_the_candidate_list() {
    logger::init_for_testing();
    let zone = zone();
    let alice_material = material_for(&zone, &alice());
    let p1 = reserve_port();
    let p2 = reserve_port();

    let s1 = PeerServer::bind(&alice_material, PeerServerConfig::new(p1))
        .await
        .unwrap();

    let mut client_cfg = PeerClientConfig::new(vec![p1, p2]);
    client_cfg.allowed_remote_legal_names =
        Some(HashSet::from([alice()]));
    let client =
        PeerClient::new(&material_for(&zone, &bob()), client_cfg).unwrap();
    let mut events = client.on_connection();
    client.start();

    let change = within(events.next()).await;
    assert!(change.connected);
    assert_eq!(change.remote_address, p1);

    // Second server comes up, first goes away: the client re-homes.
    let s2 = PeerServer::bind(&alice_material, PeerServerConfig::new(p2))
        .await
        .unwrap();
    s1.stop().await;

    let change = within(events.next()).await;
    assert!(!change.connected);
    assert_eq!(change.remote_address, p1);
    let change = within(events.next()).await;
    assert!(change.connected);
    assert_eq!(change.remote_address, p2);

    // And back again.
    let s1 = PeerServer::bind(&alice_material, PeerServerConfig::new(p1))
        .await
        .unwrap();
    s2.stop().await;

    let change = within(events.next()).await;
    assert!(!change.connected);
    assert_eq!(change.remote_address, p2);
    let change = within(events.next()).await;
    assert!(change.connected);
    assert_eq!(change.remote_address, p1);

    client.stop().await;
    s1.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn stopping_one_client_leaves_shared_channels_alive() {
    logger::init_for_testing();
    let zone = zone();
    let server = PeerServer::bind(
        &material_for(&zone, &alice()),
        PeerServerConfig::new("127.0.0.1:0".parse().unwrap()),
    )
    .await
    .unwrap();
    let server_addr = server.local_addr();
    let mut inbound = server.on_receive();

    // Two independent channels on the same runtime.
    let client_b = PeerClient::new(
        &material_for(&zone, &bob()),
        PeerClientConfig::new(vec![server_addr]),
    )
    .unwrap();
    let client_c = PeerClient::new(
        &material_for(&zone, &charlie()),
        PeerClientConfig::new(vec![server_addr]),
    )
    .unwrap();
    let mut b_events = client_b.on_connection();
    let mut c_events = client_c.on_connection();
    client_b.start();
    client_c.start();
    within(b_events.next_filtered(|c| c.connected)).await;
    within(c_events.next_filtered(|c| c.connected)).await;

    // Stopping B must not disturb C.
    client_b.stop().await;
    let receipt = client_c.send(message_to(&alice(), server_addr, b"still here"));
    let msg = within(
        inbound.next_filtered(|m| m.source_legal_name == charlie()),
    )
    .await;
    msg.complete(true);
    assert_eq!(
        within(receipt.outcome()).await,
        DeliveryState::Acknowledged,
    );

    client_c.stop().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn misrouted_messages_are_rejected_locally() {
    logger::init_for_testing();
    let zone = zone();
    let server = PeerServer::bind(
        &material_for(&zone, &alice()),
        PeerServerConfig::new("127.0.0.1:0".parse().unwrap()),
    )
    .await
    .unwrap();
    let server_addr = server.local_addr();

    let client = PeerClient::new(
        &material_for(&zone, &bob()),
        PeerClientConfig::new(vec![server_addr]),
    )
    .unwrap();
    let mut events = client.on_connection();
    client.start();
    within(events.next_filtered(|c| c.connected)).await;

    // Wrong identity for this connection.
    let receipt = client.send(message_to(&charlie(), server_addr, b"x"));
    assert_eq!(within(receipt.outcome()).await, DeliveryState::Rejected);

    // Wrong address for this connection.
    let mut wrong_addr = server_addr;
    wrong_addr.set_port(wrong_addr.port().wrapping_add(1));
    let receipt = client.send(message_to(&alice(), wrong_addr, b"x"));
    assert_eq!(within(receipt.outcome()).await, DeliveryState::Rejected);

    // A correctly routed message still flows afterwards.
    let mut inbound = server.on_receive();
    let receipt = client.send(message_to(&alice(), server_addr, b"ok"));
    within(inbound.next()).await.complete(true);
    assert_eq!(
        within(receipt.outcome()).await,
        DeliveryState::Acknowledged,
    );

    client.stop().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn full_outbound_queue_applies_backpressure() {
    logger::init_for_testing();
    let zone = zone();
    // Nothing is listening; messages pile up in the bounded queue.
    let dead_addr = reserve_port();
    let mut client_cfg = PeerClientConfig::new(vec![dead_addr]);
    client_cfg.outbound_queue = 2;
    let client =
        PeerClient::new(&material_for(&zone, &bob()), client_cfg).unwrap();
    client.start();

    let first = client.send(message_to(&alice(), dead_addr, b"1"));
    let second = client.send(message_to(&alice(), dead_addr, b"2"));
    let third = client.send(message_to(&alice(), dead_addr, b"3"));

    // The overflowing message fails immediately.
    assert_eq!(within(third.outcome()).await, DeliveryState::Failed);

    // Stopping fails the buffered ones too.
    client.stop().await;
    assert_eq!(within(first.outcome()).await, DeliveryState::Failed);
    assert_eq!(within(second.outcome()).await, DeliveryState::Failed);
}

#[tokio::test(flavor = "multi_thread")]
async fn client_refuses_to_start_without_addresses() {
    let zone = zone();
    let err = PeerClient::new(
        &material_for(&zone, &bob()),
        PeerClientConfig::new(Vec::new()),
    )
    .err()
    .expect("Must refuse an empty candidate list");
    assert!(matches!(err, ChannelError::NoCandidateAddresses));
}
