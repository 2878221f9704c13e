use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use adnl_core::AdnlError;
use adnl_network::db::NullDb;
use adnl_network::dht::FakeDht;
use adnl_network::error::NetError;
use adnl_network::static_nodes::StaticNodes;
use adnl_network::AdnlNode;
use adnl_types::ShortNodeId;
use tokio::sync::{mpsc, oneshot};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

async fn make_node() -> AdnlNode {
    let (node, inbound_rx) = AdnlNode::new(Arc::new(FakeDht::default()), Arc::new(NullDb), Arc::new(StaticNodes::new()));
    node.spawn_router(inbound_rx);
    node
}

fn bind_addr() -> SocketAddr {
    SocketAddr::new(LOCALHOST, 0)
}

/// Two hosted identities, each already knowing the other's address (the
/// zero-round-trip path: no DHT lookup needed to exchange the first
/// message).
async fn connected_pair() -> (AdnlNode, ShortNodeId, AdnlNode, ShortNodeId) {
    let node_a = make_node().await;
    let node_b = make_node().await;

    let local_a = node_a.host_identity(Some(bind_addr()), 0, 1).await.unwrap();
    let local_b = node_b.host_identity(Some(bind_addr()), 0, 1).await.unwrap();

    let pair_a = node_a
        .add_peer(local_a.short_id(), local_b.full_id(), Some(local_b.address_list()))
        .await
        .unwrap();
    let pair_b = node_b
        .add_peer(local_b.short_id(), local_a.full_id(), Some(local_a.address_list()))
        .await
        .unwrap();
    pair_a.adopt_addr_list(local_b.address_list());
    pair_b.adopt_addr_list(local_a.address_list());

    (node_a, local_a.short_id(), node_b, local_b.short_id())
}

#[tokio::test]
async fn custom_message_reaches_the_matching_subscription() {
    let (node_a, local_a, node_b, local_b) = connected_pair().await;
    let local_b_handle = node_b.local_identity(&local_b).unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    local_b_handle
        .subscribe(
            b"chat".to_vec(),
            Arc::new(move |_peer, data, _responder| {
                let _ = tx.send(data);
            }),
        )
        .unwrap();

    let pair_a = node_a.peer_table.pair_for(local_a, local_b).unwrap();
    let mut payload = b"chat".to_vec();
    payload.extend_from_slice(b":hello");
    pair_a
        .send_messages(vec![adnl_types::Message::Custom { data: payload.clone() }])
        .await
        .unwrap();

    let received = rx.recv().await.expect("custom message delivered");
    assert_eq!(received, payload);
}

#[tokio::test]
async fn query_without_a_subscriber_resolves_with_no_handler() {
    let (node_a, local_a, _node_b, local_b) = connected_pair().await;

    let pair_a = node_a.peer_table.pair_for(local_a, local_b).unwrap();
    let err = pair_a
        .query(b"unhandled:ping".to_vec(), adnl_network::query::DEFAULT_QUERY_TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, NetError::Adnl(AdnlError::NoHandler)));
}

#[tokio::test]
async fn query_with_a_subscriber_round_trips_the_answer() {
    let (node_a, local_a, node_b, local_b) = connected_pair().await;
    let local_b_handle = node_b.local_identity(&local_b).unwrap();

    local_b_handle
        .subscribe(
            b"echo".to_vec(),
            Arc::new(|_peer, data, responder| {
                if let Some(responder) = responder {
                    responder(data);
                }
            }),
        )
        .unwrap();

    let pair_a = node_a.peer_table.pair_for(local_a, local_b).unwrap();
    let answer = pair_a
        .query(b"echo:ping".to_vec(), adnl_network::query::DEFAULT_QUERY_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(answer, b"echo:ping");
}

#[tokio::test]
async fn huge_custom_message_reassembles_across_parts() {
    let (node_a, local_a, node_b, local_b) = connected_pair().await;
    let local_b_handle = node_b.local_identity(&local_b).unwrap();

    let (tx, rx) = oneshot::channel();
    let mut tx = Some(tx);
    local_b_handle
        .subscribe(
            b"blob".to_vec(),
            Arc::new(move |_peer, data, _responder| {
                if let Some(tx) = tx.take() {
                    let _ = tx.send(data);
                }
            }),
        )
        .unwrap();

    let mut payload = b"blob".to_vec();
    payload.extend(std::iter::repeat(0xABu8).take(adnl_types::constants::MESSAGE_MTU * 4));

    let pair_a = node_a.peer_table.pair_for(local_a, local_b).unwrap();
    pair_a
        .send_messages(vec![adnl_types::Message::Custom { data: payload.clone() }])
        .await
        .unwrap();

    let received = rx.await.expect("huge message delivered in one piece");
    assert_eq!(received, payload);
}

#[tokio::test]
async fn overlapping_subscriptions_on_the_same_identity_are_rejected() {
    let node = make_node().await;
    let local = node.host_identity(Some(bind_addr()), 0, 1).await.unwrap();
    local.subscribe(b"dht".to_vec(), Arc::new(|_, _, _| {})).unwrap();
    assert!(local.subscribe(b"dhtquery".to_vec(), Arc::new(|_, _, _| {})).is_err());
    assert!(local.subscribe(b"rldp".to_vec(), Arc::new(|_, _, _| {})).is_ok());
}
