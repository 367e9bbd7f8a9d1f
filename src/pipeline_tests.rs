//! Whole-node scenarios: packets go in through `ingest`, scheduler ticks
//! move them along, and the results show up in the maildir or at a peer.

use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::watch;
use x25519_dalek::PublicKey;

use crate::codec::{build_packet, NextHop, OnionBuilder, Routing};
use crate::config::NodeConfig;
use crate::delivery::test_support::ScriptedDelivery;
use crate::directory::{Directory, StaticDirectory};
use crate::keys::test_support::epoch_at;
use crate::mix::MixStrategy;
use crate::mmtp::Ack;
use crate::node::{Collaborators, MixNode};
use crate::packet::{ExitInfo, Fragment, MessageId, Packet, FRAGMENT_DATA_LEN};
use crate::server::Server;

fn config(home: &Path) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.node.home = home.to_path_buf();
    config.node.listen = "127.0.0.1:0".parse().unwrap();
    config.mix.strategy = MixStrategy::Flush;
    config.mix.min_residency_secs = 0;
    config.transport.handshake_timeout_secs = 5;
    config.transport.idle_timeout_secs = 5;
    config
}

fn current_key(node: &MixNode) -> PublicKey {
    *node
        .state()
        .ring()
        .current(SystemTime::now())
        .unwrap()
        .public_key()
}

fn exit() -> ExitInfo {
    ExitInfo {
        exit_type: 0x100,
        address: "carol@example.org".to_string(),
    }
}

fn maildir_messages(node: &MixNode) -> Vec<String> {
    let new = node.config().maildir().join("new");
    let Ok(entries) = std::fs::read_dir(new) else {
        return Vec::new();
    };
    entries
        .map(|entry| std::fs::read_to_string(entry.unwrap().path()).unwrap())
        .collect()
}

fn deliver_packets(node: &MixNode, message: &[u8]) -> Vec<Packet> {
    let key = current_key(node);
    Fragment::split(MessageId::random(), message)
        .iter()
        .map(|fragment| build_packet(&[(key, Routing::Deliver(exit()))], fragment).unwrap())
        .collect()
}

#[tokio::test]
async fn single_fragment_message_reaches_the_maildir() {
    let home = tempfile::tempdir().unwrap();
    let mut node = MixNode::open(config(home.path())).unwrap();
    let packets = deliver_packets(&node, b"meet at noon");
    assert_eq!(packets.len(), 1);

    assert_eq!(node.state().ingest(&packets[0]), Ack::Received);
    assert_eq!(node.state().pools().incoming.len().unwrap(), 1);

    let summary = node.tick().await.unwrap();
    assert_eq!(summary.mix.delivered, 1);
    assert_eq!(summary.reassembled, 1);
    assert_eq!(summary.delivered, 1);

    assert_eq!(
        maildir_messages(&node),
        vec!["carol@example.org\nmeet at noon".to_string()]
    );
    assert!(node.state().pools().deliver.is_empty().unwrap());
    assert!(node.exit_pool().is_empty().unwrap());

    let stats = node.state().stats().snapshot();
    assert_eq!(stats.received_packets, 1);
    assert_eq!(stats.successful_deliveries, 1);
}

#[tokio::test]
async fn out_of_order_fragments_make_one_message() {
    let home = tempfile::tempdir().unwrap();
    let mut node = MixNode::open(config(home.path())).unwrap();
    let message: Vec<u8> = (0..2 * FRAGMENT_DATA_LEN + 100)
        .map(|i| b'a' + (i % 26) as u8)
        .collect();
    let packets = deliver_packets(&node, &message);
    assert_eq!(packets.len(), 3);

    for index in [2, 0] {
        assert_eq!(node.state().ingest(&packets[index]), Ack::Received);
    }
    let summary = node.tick().await.unwrap();
    assert_eq!(summary.reassembled, 0);
    assert_eq!(node.state().pools().deliver.len().unwrap(), 2);

    assert_eq!(node.state().ingest(&packets[1]), Ack::Received);
    let summary = node.tick().await.unwrap();
    assert_eq!(summary.reassembled, 1);
    assert_eq!(summary.delivered, 1);

    let mut expected = b"carol@example.org\n".to_vec();
    expected.extend_from_slice(&message);
    assert_eq!(
        maildir_messages(&node),
        vec![String::from_utf8(expected).unwrap()]
    );
    assert!(node.state().pools().deliver.is_empty().unwrap());
}

#[tokio::test]
async fn partial_message_survives_a_restart() {
    let home = tempfile::tempdir().unwrap();
    let message = vec![b'z'; FRAGMENT_DATA_LEN + 1];
    let packets = {
        let mut node = MixNode::open(config(home.path())).unwrap();
        let packets = deliver_packets(&node, &message);
        assert_eq!(node.state().ingest(&packets[0]), Ack::Received);
        let summary = node.tick().await.unwrap();
        assert_eq!(summary.reassembled, 0);
        packets
    };

    let mut node = MixNode::open(config(home.path())).unwrap();
    assert_eq!(node.state().pools().deliver.len().unwrap(), 1);
    assert_eq!(node.state().ingest(&packets[1]), Ack::Received);
    let summary = node.tick().await.unwrap();
    assert_eq!(summary.reassembled, 1);
    assert_eq!(maildir_messages(&node).len(), 1);
}

#[tokio::test]
async fn replayed_packet_is_acknowledged_but_dropped() {
    let home = tempfile::tempdir().unwrap();
    let node = MixNode::open(config(home.path())).unwrap();
    let packets = deliver_packets(&node, b"once only");
    let copy = Packet::from_bytes(packets[0].as_bytes().to_vec()).unwrap();

    assert_eq!(node.state().ingest(&packets[0]), Ack::Received);
    assert_eq!(node.state().ingest(&copy), Ack::Received);

    assert_eq!(node.state().pools().incoming.len().unwrap(), 1);
    let stats = node.state().stats().snapshot();
    assert_eq!(stats.received_packets, 2);
    assert_eq!(stats.replay_drops, 1);
}

#[tokio::test]
async fn replay_detection_survives_a_restart() {
    let home = tempfile::tempdir().unwrap();
    let packet = {
        let node = MixNode::open(config(home.path())).unwrap();
        let packets = deliver_packets(&node, b"once only");
        assert_eq!(node.state().ingest(&packets[0]), Ack::Received);
        packets.into_iter().next().unwrap()
    };

    let node = MixNode::open(config(home.path())).unwrap();
    assert_eq!(node.state().ingest(&packet), Ack::Received);
    assert_eq!(node.state().stats().snapshot().replay_drops, 1);
    assert_eq!(node.state().pools().incoming.len().unwrap(), 1);
}

#[tokio::test]
async fn foreign_and_tampered_packets_are_dropped() {
    let home = tempfile::tempdir().unwrap();
    let node = MixNode::open(config(home.path())).unwrap();

    let (_, stranger) = epoch_at(9, SystemTime::now());
    let fragment = &Fragment::split(MessageId::random(), b"lost")[0];
    let foreign = build_packet(&[(*stranger.public_key(), Routing::Deliver(exit()))], fragment)
        .unwrap();
    assert_eq!(node.state().ingest(&foreign), Ack::Received);

    let mut bytes = deliver_packets(&node, b"bent").remove(0).into_bytes();
    bytes[120] ^= 0x40;
    let tampered = Packet::from_bytes(bytes).unwrap();
    assert_eq!(node.state().ingest(&tampered), Ack::Received);

    let stats = node.state().stats().snapshot();
    assert_eq!(stats.wrong_epoch_drops, 1);
    assert_eq!(stats.decode_drops, 1);
    assert!(node.state().pools().incoming.is_empty().unwrap());
}

#[tokio::test]
async fn packet_is_relayed_to_the_next_node() {
    let first_home = tempfile::tempdir().unwrap();
    let second_home = tempfile::tempdir().unwrap();
    let mut first = MixNode::open(config(first_home.path())).unwrap();
    let mut second = MixNode::open(config(second_home.path())).unwrap();

    let server = Server::bind("127.0.0.1:0".parse().unwrap(), second.state().clone()).unwrap();
    let port = server.local_addr().unwrap().port();
    let (stop, stopped) = watch::channel(false);
    let listener = tokio::spawn(server.run(stopped));

    let next_hop = NextHop {
        identity: second.identity().digest(),
        host: "127.0.0.1".to_string(),
        port,
    };
    let fragment = &Fragment::split(MessageId::random(), b"two hops")[0];
    let body = fragment.encode().unwrap();
    let packet = OnionBuilder::new()
        .hop(current_key(&first), Routing::Forward(next_hop))
        .hop(current_key(&second), Routing::Deliver(exit()))
        .build(&body)
        .unwrap();

    assert_eq!(first.state().ingest(&packet), Ack::Received);
    let summary = first.tick().await.unwrap();
    assert_eq!(summary.mix.forwarded, 1);
    assert_eq!(summary.relay_batches.len(), 1);
    for batch in summary.relay_batches {
        let report = batch.await.unwrap();
        assert_eq!(report.relayed, 1);
        assert_eq!(report.failed, 0);
    }
    assert!(first.state().pools().outgoing.is_empty().unwrap());
    assert_eq!(first.state().stats().snapshot().successful_relays, 1);

    let summary = second.tick().await.unwrap();
    assert_eq!(summary.delivered, 1);
    assert_eq!(
        maildir_messages(&second),
        vec!["carol@example.org\ntwo hops".to_string()]
    );
    assert_eq!(second.state().stats().snapshot().received_connections, 1);

    stop.send(true).unwrap();
    listener.await.unwrap();
}

#[tokio::test]
async fn stats_are_saved_on_every_tick() {
    let home = tempfile::tempdir().unwrap();
    let mut node = MixNode::open(config(home.path())).unwrap();
    let packets = deliver_packets(&node, b"counted");
    node.state().ingest(&packets[0]);
    node.tick().await.unwrap();

    let saved = crate::stats::StatsSnapshot::load(&node.config().stats_file()).unwrap();
    assert_eq!(saved, node.state().stats().snapshot());
    assert_eq!(saved.received_packets, 1);
}

#[tokio::test]
async fn exit_outcomes_follow_the_delivery_handler() {
    let home = tempfile::tempdir().unwrap();
    let config = config(home.path());
    let mut collaborators = Collaborators::from_config(&config);
    collaborators.delivery = Arc::new(ScriptedDelivery::new(config.maildir()));
    let mut node = MixNode::open_with(config, collaborators).unwrap();

    let key = current_key(&node);
    for address in ["fail", "FAIL!"] {
        let exit = ExitInfo {
            exit_type: 0x100,
            address: address.to_string(),
        };
        let fragment = &Fragment::split(MessageId::random(), b"bounced")[0];
        let packet = build_packet(&[(key, Routing::Deliver(exit))], fragment).unwrap();
        assert_eq!(node.state().ingest(&packet), Ack::Received);
    }

    let summary = node.tick().await.unwrap();
    assert_eq!(summary.reassembled, 2);
    assert_eq!(summary.delivered, 0);
    assert_eq!(node.exit_pool().len().unwrap(), 1);
    assert!(maildir_messages(&node).is_empty());

    let stats = node.state().stats().snapshot();
    assert_eq!(stats.attempted_deliveries, 2);
    assert_eq!(stats.failed_deliveries, 1);
    assert_eq!(stats.unretriable_deliveries, 1);
}

#[tokio::test]
async fn transport_moves_to_the_next_epoch_before_the_old_certificate_expires() {
    let home = tempfile::tempdir().unwrap();
    let mut node = MixNode::open(config(home.path())).unwrap();
    let first = node.state().ring().current(SystemTime::now()).unwrap().clone();
    assert_eq!(node.state().transport_epoch(), Some(first.id()));

    let last_tick = first.valid_until() - node.config().tick_interval();
    node.tick_at(last_tick).await.unwrap();

    let successor = node.state().transport_epoch().unwrap();
    assert_ne!(successor, first.id());
    let ring = node.state().ring();
    assert_eq!(ring.current(last_tick).unwrap().id(), successor);
    assert!(ring.get(first.id()).is_some());
}

#[test]
fn descriptor_advertises_the_configured_hostname() {
    let home = tempfile::tempdir().unwrap();
    let mut config = config(home.path());
    config.node.hostname = "mix.example.org".to_string();
    config.node.listen = "0.0.0.0:48100".parse().unwrap();
    let node = MixNode::open(config).unwrap();

    let descriptor = node.descriptor();
    assert_eq!(descriptor.host, "mix.example.org");
    assert_eq!(descriptor.port, 48100);
    assert_eq!(descriptor.identity, node.identity().digest());
    let directory = StaticDirectory::new([descriptor.clone()]);
    assert_eq!(directory.lookup(&descriptor.identity), Some(descriptor));
}

#[test]
fn node_refuses_an_invalid_configuration() {
    let home = tempfile::tempdir().unwrap();
    let mut config = config(home.path());
    config.mix.tick_interval_secs = 0;
    assert!(MixNode::open(config).is_err());
}
