use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use crate::network::dht::{Dht, DhtConfig};
use crate::network::gossip::Gossiper;

struct TestNode {
    dht: Arc<Dht>,
    gossiper: Arc<Gossiper>,
    _shutdown: watch::Sender<bool>,
}

async fn spawn_node(seeds: Vec<(String, u16)>) -> TestNode {
    let cfg = DhtConfig {
        host: "127.0.0.1".into(),
        port: 0,
        seeds,
        black_list: HashSet::new(),
    };
    let (dht, _events) = Dht::bind(cfg, None).await.unwrap();
    let gossiper = Arc::new(Gossiper::new(dht.clone(), 1024));
    dht.set_broadcast_sink(gossiper.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    dht.start(shutdown_rx);
    TestNode { dht, gossiper, _shutdown: shutdown_tx }
}

async fn wait_for_link(a: &TestNode, b: &TestNode) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while a.dht.table_len().await < 1 || b.dht.table_len().await < 1 {
        assert!(tokio::time::Instant::now() < deadline, "overlay link timed out");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_bootstrap_links_both_tables() {
    let a = spawn_node(vec![]).await;
    let seed = a.dht.self_contact();
    let b = spawn_node(vec![(seed.host.clone(), seed.port)]).await;

    wait_for_link(&a, &b).await;

    let healthy_b = b.dht.healthy_nodes().await;
    assert!(healthy_b.iter().any(|c| c.port == seed.port));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_publish_reaches_subscriber() {
    let a = spawn_node(vec![]).await;
    let seed = a.dht.self_contact();
    let b = spawn_node(vec![(seed.host.clone(), seed.port)]).await;

    wait_for_link(&a, &b).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    a.gossiper.subscribe(
        "txs",
        Arc::new(move |envelope, from| {
            let _ = tx.send((envelope.payload, from.endpoint()));
        }),
    );

    assert!(b.gossiper.publish("txs", serde_json::json!({ "seq": 1 }), 1).await);

    let (payload, _from) = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("broadcast delivery timed out")
        .expect("subscription channel closed");
    assert_eq!(payload["seq"], 1);
}
