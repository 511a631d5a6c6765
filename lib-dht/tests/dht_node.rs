//! End-to-end scenarios over loopback UDP: two real nodes, real sockets,
//! real crypto.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use lib_dht::node::Node;
use lib_dht::{Id, LookupOption, NodeConfig, NodeInfo, PeerInfo, Value};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

async fn start_node() -> Node {
    let config = NodeConfig::new().with_ipv4(LOCALHOST, 0);
    Node::start(config).await.expect("node starts")
}

fn node_info(node: &Node) -> NodeInfo {
    NodeInfo::new(
        *node.id(),
        node.bound_addr(lib_dht::Family::V4).expect("bound"),
    )
}

/// Poll until `check` passes or the deadline runs out.
async fn within<F, Fut>(deadline: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    loop {
        if check().await {
            return;
        }
        if start.elapsed() > deadline {
            panic!("condition not met within {:?}", deadline);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Two empty nodes; after one bootstrap call each side holds a reachable
/// entry for the other.
#[tokio::test]
async fn two_node_ping() {
    let a = start_node().await;
    let b = start_node().await;

    b.bootstrap(node_info(&a)).await.unwrap();

    let (a_id, b_id) = (*a.id(), *b.id());
    within(Duration::from_secs(2), || {
        let (a, b) = (&a, &b);
        async move {
            let b_sees_a = b.table_entry(a_id).await.unwrap();
            let a_sees_b = a.table_entry(b_id).await.unwrap();
            matches!(b_sees_a, Some(e) if e.reachable) && matches!(a_sees_b, Some(e) if e.reachable)
        }
    })
    .await;

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

async fn bootstrapped_pair() -> (Node, Node) {
    let a = start_node().await;
    let b = start_node().await;
    b.bootstrap(node_info(&a)).await.unwrap();

    let (a_id, b_id) = (*a.id(), *b.id());
    within(Duration::from_secs(2), || {
        let (a, b) = (&a, &b);
        async move {
            let b_sees_a = b.table_entry(a_id).await.unwrap();
            let a_sees_b = a.table_entry(b_id).await.unwrap();
            matches!(b_sees_a, Some(e) if e.reachable) && matches!(a_sees_b, Some(e) if e.reachable)
        }
    })
    .await;
    (a, b)
}

/// Immutable value stored through A is retrievable from B, and local
/// copies satisfy arbitrary lookups.
#[tokio::test]
async fn immutable_value_round_trip() {
    let (a, b) = bootstrapped_pair().await;

    let value = Value::create(b"Hello, world").unwrap();
    let value_id = value.id();
    a.store_value(value.clone()).await.unwrap();

    let found = b
        .find_value(value_id, LookupOption::Conservative)
        .await
        .unwrap();
    assert_eq!(found, Some(value.clone()));

    // no local copy: arbitrary must fall through to the network and still hit
    let found = b
        .find_value(value_id, LookupOption::Arbitrary)
        .await
        .unwrap();
    assert_eq!(found, Some(value.clone()));

    // with a local copy the arbitrary lookup answers from storage
    b.store_value(value.clone()).await.unwrap();
    let found = b
        .find_value(value_id, LookupOption::Arbitrary)
        .await
        .unwrap();
    assert_eq!(found, Some(value));

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

/// Mutable value: update bumps the sequence number; remote lookups see the
/// newest version.
#[tokio::test]
async fn mutable_value_update_visible_remotely() {
    let (a, b) = bootstrapped_pair().await;

    let v0 = Value::create_signed(b"v0").unwrap();
    let value_id = v0.id();
    a.store_value(v0.clone()).await.unwrap();

    let v1 = v0.update(b"v1").unwrap();
    assert_eq!(v1.sequence_number(), 1);
    a.store_value(v1.clone()).await.unwrap();

    let found = b
        .find_value(value_id, LookupOption::Conservative)
        .await
        .unwrap()
        .expect("value present");
    assert_eq!(found.sequence_number(), 1);
    assert_eq!(found.data(), b"v1");

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

/// Peer announced via A is found from B.
#[tokio::test]
async fn peer_announce_and_find() {
    let (a, b) = bootstrapped_pair().await;

    let peer = PeerInfo::create(a.id(), 8080).unwrap();
    let peer_id = *peer.id();
    a.announce_peer(peer.clone()).await.unwrap();

    let found = tokio::time::timeout(
        Duration::from_secs(2),
        b.find_peer(peer_id, 1, LookupOption::Conservative),
    )
    .await
    .expect("within deadline")
    .unwrap();

    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id(), &peer_id);
    assert_eq!(found[0].node_id(), a.id());
    assert_eq!(found[0].port(), 8080);

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

/// A lookup for an id nobody stores returns empty-handed but does not hang.
#[tokio::test]
async fn missing_value_returns_none() {
    let (a, b) = bootstrapped_pair().await;

    let found = tokio::time::timeout(
        Duration::from_secs(5),
        b.find_value(Id::random(), LookupOption::Conservative),
    )
    .await
    .expect("lookup terminates")
    .unwrap();
    assert_eq!(found, None);

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

/// Identity persists across restarts of the same data directory.
#[tokio::test]
async fn identity_is_stable_per_data_dir() {
    let dir = tempfile::tempdir().unwrap();

    let config = NodeConfig::new()
        .with_ipv4(LOCALHOST, 0)
        .with_data_dir(dir.path().to_path_buf());
    let node = Node::start(config.clone()).await.unwrap();
    let first_id = *node.id();
    node.stop().await.unwrap();

    let node = Node::start(config).await.unwrap();
    assert_eq!(node.id(), &first_id);
    node.stop().await.unwrap();

    assert!(dir.path().join("key").exists());
    assert!(dir.path().join("id").exists());
}
