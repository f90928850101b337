mod common;

use meshrun::mesh::connection::HANDSHAKE_TIMEOUT;
use meshrun::mesh::{ConnectionManager, Inbound, Mesh, MeshEvent, PeerState, channel};
use meshrun::protocol::{PeerMessage, RelayEnvelope, Signal, WorkerId};
use meshrun::relay::{RelaySender, RelayServer, RoutingTable, connect_relay};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// One worker's mesh side, without a supervisor.
struct Node {
    id: WorkerId,
    manager: ConnectionManager,
    events: mpsc::UnboundedReceiver<MeshEvent>,
    /// (message, arrived over a direct channel)
    inbox: Vec<(Inbound, bool)>,
}

impl Node {
    async fn start(id: &str, relay: SocketAddr) -> Self {
        let id = WorkerId::new(id);
        let (tx, rx) = mpsc::unbounded_channel();
        let (listener, addr) = channel::bind_listener("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        channel::spawn_accept_loop(listener, tx.clone());

        let mut manager = ConnectionManager::new(id.clone(), addr, tx.clone());
        let link = connect_relay(&relay.to_string(), &id, tx).await.unwrap();
        manager.attach_relay(link);

        Self {
            id,
            manager,
            events: rx,
            inbox: Vec::new(),
        }
    }

    fn apply(&mut self, event: MeshEvent) {
        let direct = matches!(event, MeshEvent::ChannelData { .. });
        if let Some(inbound) = self.manager.handle_event(event) {
            self.inbox.push((inbound, direct));
        }
    }
}

async fn start_relay() -> (SocketAddr, Arc<RoutingTable>) {
    let server = RelayServer::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap();
    let table = server.table();
    tokio::spawn(server.run());
    (addr, table)
}

async fn pair() -> (Node, Node) {
    let (relay, table) = start_relay().await;
    let a = Node::start("w-a", relay).await;
    let b = Node::start("w-b", relay).await;
    let ready = common::eventually(Duration::from_secs(5), || {
        table.is_registered(&a.id) && table.is_registered(&b.id)
    })
    .await;
    assert!(ready, "workers never registered with the relay");
    (a, b)
}

/// Drives both nodes' event loops until `done` holds. False on timeout.
async fn pump(a: &mut Node, b: &mut Node, done: impl Fn(&Node, &Node) -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !done(a, b) {
        tokio::select! {
            Some(event) = a.events.recv() => a.apply(event),
            Some(event) = b.events.recv() => b.apply(event),
            _ = tokio::time::sleep_until(deadline) => return false,
        }
    }
    true
}

fn established(a: &Node, b: &Node) -> bool {
    a.manager.is_established(&b.id) && b.manager.is_established(&a.id)
}

#[tokio::test]
async fn test_initiator_is_the_larger_id() {
    let (a, b) = pair().await;
    assert!(!a.manager.is_initiator(&b.id));
    assert!(b.manager.is_initiator(&a.id));
}

#[tokio::test]
async fn test_handshake_from_non_initiator() {
    let (mut a, mut b) = pair().await;

    // w-a sends a request, w-b answers with an offer, w-a dials
    a.manager.connect(&b.id);
    assert!(a.manager.is_pending(&b.id));

    assert!(pump(&mut a, &mut b, established).await);
}

#[tokio::test]
async fn test_handshake_from_initiator() {
    let (mut a, mut b) = pair().await;

    b.manager.connect(&a.id);
    assert!(b.manager.is_pending(&a.id));

    assert!(pump(&mut a, &mut b, established).await);
}

#[tokio::test]
async fn test_simultaneous_connect_settles() {
    let (mut a, mut b) = pair().await;

    a.manager.connect(&b.id);
    b.manager.connect(&a.id);

    assert!(pump(&mut a, &mut b, established).await);
}

#[tokio::test]
async fn test_connect_is_noop_while_pending_or_open() {
    let (mut a, mut b) = pair().await;
    a.manager.connect(&b.id);
    let since = match a.manager.peer_state(&b.id) {
        Some(PeerState::Pending { since }) => *since,
        other => panic!("expected pending, got {:?}", other),
    };
    a.manager.connect(&b.id);
    assert!(matches!(
        a.manager.peer_state(&b.id),
        Some(PeerState::Pending { since: again }) if *again == since
    ));

    assert!(pump(&mut a, &mut b, established).await);
    a.manager.connect(&b.id);
    assert!(a.manager.is_established(&b.id));

    // Self is never a peer
    let own = a.id.clone();
    a.manager.connect(&own);
    assert!(a.manager.peer_state(&own).is_none());
}

#[tokio::test]
async fn test_send_before_handshake_goes_through_relay() {
    let (mut a, mut b) = pair().await;

    a.manager.send(&b.id, &PeerMessage::Ack { ack: 41 });

    let arrived = pump(&mut a, &mut b, |_, b| !b.inbox.is_empty()).await;
    assert!(arrived);
    let (inbound, direct) = &b.inbox[0];
    assert!(!direct);
    assert_eq!(inbound.from, a.id);
    assert_eq!(inbound.message, PeerMessage::Ack { ack: 41 });

    // The send also kicked off the handshake
    assert!(pump(&mut a, &mut b, established).await);
}

#[tokio::test]
async fn test_send_after_handshake_is_direct() {
    let (mut a, mut b) = pair().await;
    a.manager.connect(&b.id);
    assert!(pump(&mut a, &mut b, established).await);

    b.manager.send(&a.id, &PeerMessage::Ack { ack: 7 });

    assert!(pump(&mut a, &mut b, |a, _| !a.inbox.is_empty()).await);
    let (inbound, direct) = &a.inbox[0];
    assert!(*direct);
    assert_eq!(inbound.from, b.id);
    assert_eq!(inbound.message, PeerMessage::Ack { ack: 7 });
}

#[tokio::test]
async fn test_closed_channel_returns_peer_to_absent() {
    let (mut a, mut b) = pair().await;
    a.manager.connect(&b.id);
    assert!(pump(&mut a, &mut b, established).await);

    let b_id = b.id.clone();
    drop(b);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while a.manager.peer_state(&b_id).is_some() {
        tokio::select! {
            Some(event) = a.events.recv() => a.apply(event),
            _ = tokio::time::sleep_until(deadline) => panic!("channel close never observed"),
        }
    }
    assert!(!a.manager.is_established(&b_id));
}

/// A manager with no sockets behind it; relay lines land in the returned receiver.
fn detached(id: &str) -> (ConnectionManager, mpsc::UnboundedReceiver<String>) {
    let (events, _) = mpsc::unbounded_channel();
    let mut manager = ConnectionManager::new(
        WorkerId::new(id),
        "127.0.0.1:7000".parse().unwrap(),
        events,
    );
    let (lines, relay) = mpsc::unbounded_channel();
    manager.attach_relay(RelaySender::new(lines));
    (manager, relay)
}

fn drain(relay: &mut mpsc::UnboundedReceiver<String>) -> Vec<RelayEnvelope> {
    let mut envelopes = Vec::new();
    while let Ok(line) = relay.try_recv() {
        envelopes.push(serde_json::from_str(&line).unwrap());
    }
    envelopes
}

#[tokio::test(start_paused = true)]
async fn test_stale_handshake_is_restarted() {
    let (mut manager, mut relay) = detached("w-a");
    let peer = WorkerId::new("w-b");
    let request = RelayEnvelope::Signal {
        id: WorkerId::new("w-a"),
        dest: peer.clone(),
        data: Signal::Request,
    };

    // 1. First connect signals the peer, which never answers
    manager.connect(&peer);
    assert_eq!(drain(&mut relay), vec![request.clone()]);

    // 2. Still within the timeout: nothing new
    tokio::time::advance(HANDSHAKE_TIMEOUT - Duration::from_secs(1)).await;
    manager.connect(&peer);
    assert!(drain(&mut relay).is_empty());

    // 3. Past the timeout the handshake starts over
    tokio::time::advance(Duration::from_secs(2)).await;
    manager.connect(&peer);
    assert_eq!(drain(&mut relay), vec![request]);
    assert!(manager.is_pending(&peer));
}

#[tokio::test]
async fn test_close_of_replaced_relay_link_is_ignored() {
    let (events, _) = mpsc::unbounded_channel();
    let mut manager = ConnectionManager::new(
        WorkerId::new("w-a"),
        "127.0.0.1:7000".parse().unwrap(),
        events,
    );
    let (old_lines, _old_rx) = mpsc::unbounded_channel();
    let (new_lines, mut new_rx) = mpsc::unbounded_channel();
    let old = RelaySender::new(old_lines);
    let new = RelaySender::new(new_lines);
    assert_ne!(old.id, new.id);

    manager.attach_relay(old.clone());
    manager.handle_event(MeshEvent::RelayConnected(new.clone()));

    // Late close from the old link leaves the new one in place
    manager.handle_event(MeshEvent::RelayClosed { link: old.id });
    assert!(!manager.needs_relay());
    manager.connect(&WorkerId::new("w-b"));
    assert_eq!(drain(&mut new_rx).len(), 1);

    manager.handle_event(MeshEvent::RelayClosed { link: new.id });
    assert!(manager.needs_relay());
}
