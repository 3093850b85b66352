//! Full proposal round across two wired nodes: propose on A, verify and
//! vote on B, aggregate back on A until the commit event fires.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use crate::consensus::delegates::StaticDelegates;
use crate::consensus::types::{BlockHeader, FeatureFlags};
use crate::consensus::{CommitEvent, ConsensusEngine};
use crate::crypto::Keypair;
use crate::network::dht::{Dht, DhtConfig};
use crate::network::gossip::Gossiper;
use crate::node::node::{ConsensusBridge, TOPIC_PROPOSE, TOPIC_VOTES};
use crate::pow::{Miner, MinerConfig};

struct WiredNode {
    dht: Arc<Dht>,
    gossiper: Arc<Gossiper>,
    engine: Arc<ConsensusEngine>,
    commit_rx: mpsc::UnboundedReceiver<CommitEvent>,
    _shutdown: watch::Sender<bool>,
}

async fn wired_node(
    seeds: Vec<(String, u16)>,
    ring: &[Keypair],
    forging: Vec<Keypair>,
    delegates: u32,
) -> WiredNode {
    let cfg = DhtConfig {
        host: "127.0.0.1".into(),
        port: 0,
        seeds,
        black_list: HashSet::new(),
    };
    let (dht, _events) = Dht::bind(cfg, None).await.unwrap();
    let gossiper = Arc::new(Gossiper::new(dht.clone(), 1024));
    dht.set_broadcast_sink(gossiper.clone());

    let clock = crate::consensus::slots::SlotClock::new(0, 10, delegates, 2, Duration::from_secs(30)).unwrap();
    let flags = Arc::new(FeatureFlags::new(false));
    let registry = Arc::new(StaticDelegates::new(ring.iter().map(|kp| kp.public()).collect()));
    let miner = Miner::new(MinerConfig { workers: 2, batch: 128 });
    let (engine, commit_rx) = ConsensusEngine::new(clock, flags, registry, miner);
    let engine = Arc::new(engine);

    let bridge = Arc::new(ConsensusBridge::new(engine.clone(), gossiper.clone(), forging));
    {
        let b = bridge.clone();
        gossiper.subscribe(
            TOPIC_PROPOSE,
            Arc::new(move |envelope, _from| {
                let b = b.clone();
                tokio::spawn(async move { b.ingest_propose(envelope).await });
            }),
        );
    }
    {
        let b = bridge.clone();
        gossiper.subscribe(
            TOPIC_VOTES,
            Arc::new(move |envelope, _from| {
                let b = b.clone();
                tokio::spawn(async move { b.ingest_votes(envelope).await });
            }),
        );
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    dht.start(shutdown_rx);
    WiredNode { dht, gossiper, engine, commit_rx, _shutdown: shutdown_tx }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_round_commits_across_two_nodes() {
    // ring of three delegates with D = 3: finality needs all three votes
    let ring: Vec<Keypair> = (0..3).map(|_| Keypair::generate()).collect();
    let proposer = ring[0].clone();

    let mut a = wired_node(vec![], &ring, vec![proposer.clone()], 3).await;
    let seed = a.dht.self_contact();
    let b = wired_node(
        vec![(seed.host.clone(), seed.port)],
        &ring,
        vec![ring[1].clone(), ring[2].clone()],
        3,
    )
    .await;

    // wait for the overlay link in both directions
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while a.dht.table_len().await < 1 || b.dht.table_len().await < 1 {
        assert!(tokio::time::Instant::now() < deadline, "overlay link timed out");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // A is the elected delegate for this round
    let block = BlockHeader {
        height: 42,
        id: "4242424242".into(),
        timestamp: a.engine.clock().epoch_now(),
        generator_public_key: proposer.public(),
    };
    let address = format!("127.0.0.1:{}", a.dht.self_contact().port);
    let propose = a.engine.create_propose(&proposer, &block, &address).await.unwrap();

    // the proposer adopts its own candidate and votes for it
    a.engine.set_pending_block(block.clone()).await;
    let own_vote = a.engine.create_votes(std::slice::from_ref(&proposer), &block).unwrap();
    a.engine.add_pending_votes(&own_vote).await;

    let payload = serde_json::to_value(&propose).unwrap();
    assert!(a.gossiper.publish(TOPIC_PROPOSE, payload, 1).await);

    // B verifies, votes with its two delegates, and gossips the bundle
    // back; A's accumulator crosses 2 of 3 strictly and commits
    let event = tokio::time::timeout(Duration::from_secs(20), a.commit_rx.recv())
        .await
        .expect("commit timed out")
        .expect("commit channel closed");
    assert_eq!(event.block, block);
    assert_eq!(event.votes.signatures.len(), 3);
    assert!(a.engine.has_enough_votes(&event.votes));

    drop(b);
}
