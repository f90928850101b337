use super::channel::{self, ChannelId, DirectChannel};
use super::{Inbound, Mesh, MeshEvent};
use crate::protocol::{PeerMessage, RelayEnvelope, Signal, WorkerId};
use crate::relay::RelaySender;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A handshake older than this is abandoned by the next `connect`.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-peer state. A peer with no entry is absent.
#[derive(Debug)]
pub enum PeerState {
    Pending { since: Instant },
    Established(DirectChannel),
}

#[derive(Debug)]
enum RelayLink {
    Down,
    Connecting,
    Up(RelaySender),
}

/// Owns the direct channels of one worker and the relay link used to set
/// them up. All methods run on the worker's control loop; the socket work
/// happens in spawned pumps that report back through [`MeshEvent`]s.
pub struct ConnectionManager {
    local_id: WorkerId,
    advertise: SocketAddr,
    peers: HashMap<WorkerId, PeerState>,
    relay: RelayLink,
    events: mpsc::UnboundedSender<MeshEvent>,
}

impl ConnectionManager {
    pub fn new(local_id: WorkerId, advertise: SocketAddr, events: mpsc::UnboundedSender<MeshEvent>) -> Self {
        Self {
            local_id,
            advertise,
            peers: HashMap::new(),
            relay: RelayLink::Down,
            events,
        }
    }

    pub fn local_id(&self) -> &WorkerId {
        &self.local_id
    }

    pub fn events(&self) -> mpsc::UnboundedSender<MeshEvent> {
        self.events.clone()
    }

    pub fn attach_relay(&mut self, relay: RelaySender) {
        self.relay = RelayLink::Up(relay);
    }

    /// True when no relay link is up or being opened.
    pub fn needs_relay(&self) -> bool {
        matches!(self.relay, RelayLink::Down)
    }

    pub fn mark_relay_connecting(&mut self) {
        self.relay = RelayLink::Connecting;
    }

    pub fn peer_state(&self, peer: &WorkerId) -> Option<&PeerState> {
        self.peers.get(peer)
    }

    pub fn is_established(&self, peer: &WorkerId) -> bool {
        matches!(self.peers.get(peer), Some(PeerState::Established(_)))
    }

    pub fn is_pending(&self, peer: &WorkerId) -> bool {
        matches!(self.peers.get(peer), Some(PeerState::Pending { .. }))
    }

    /// The larger id initiates, so two sides connecting at once agree on
    /// who offers and who dials.
    pub fn is_initiator(&self, peer: &WorkerId) -> bool {
        self.local_id > *peer
    }

    /// Applies one network event. Returns the peer payload it carried, if any.
    pub fn handle_event(&mut self, event: MeshEvent) -> Option<Inbound> {
        match event {
            MeshEvent::Relay(envelope) => self.on_envelope(envelope),
            MeshEvent::RelayConnected(sender) => {
                self.attach_relay(sender);
                None
            }
            MeshEvent::RelayFailed(error) => {
                warn!(worker = %self.local_id, %error, "Relay unreachable, will retry");
                self.relay = RelayLink::Down;
                None
            }
            MeshEvent::RelayClosed { link } => {
                match &self.relay {
                    RelayLink::Up(current) if current.id == link => {
                        warn!(worker = %self.local_id, link, "Relay link lost");
                        self.relay = RelayLink::Down;
                    }
                    _ => debug!(worker = %self.local_id, link, "Ignoring close of a replaced relay link"),
                }
                None
            }
            MeshEvent::ChannelReady { peer, channel } => {
                info!(worker = %self.local_id, peer = %peer, channel = channel.id, "Direct channel established");
                self.peers.insert(peer, PeerState::Established(channel));
                None
            }
            MeshEvent::ChannelData { peer, message, .. } => Some(Inbound { from: peer, message }),
            MeshEvent::ChannelClosed { peer, channel } => {
                self.on_channel_closed(&peer, channel);
                None
            }
            MeshEvent::DialFailed { peer, error } => {
                warn!(worker = %self.local_id, peer = %peer, %error, "Dial failed");
                if self.is_pending(&peer) {
                    self.peers.remove(&peer);
                }
                None
            }
        }
    }

    fn on_envelope(&mut self, envelope: RelayEnvelope) -> Option<Inbound> {
        match envelope {
            RelayEnvelope::Message { id, dest, data } => {
                if dest != self.local_id {
                    warn!(worker = %self.local_id, dest = %dest, "Relay delivered a message for another worker");
                    return None;
                }
                // Open the reverse direction so replies can go direct.
                self.connect(&id);
                Some(Inbound { from: id, message: data })
            }
            RelayEnvelope::Signal { id, data, .. } => {
                self.on_signal(id, data);
                None
            }
            RelayEnvelope::Register { .. } => None,
        }
    }

    fn on_signal(&mut self, from: WorkerId, signal: Signal) {
        match signal {
            Signal::Request => {
                if !self.is_initiator(&from) {
                    debug!(peer = %from, "Ignoring handshake request from initiator");
                    return;
                }
                if self.is_established(&from) {
                    return;
                }
                self.peers.insert(from.clone(), PeerState::Pending { since: Instant::now() });
                self.offer(&from);
            }
            Signal::Offer { addr } => {
                if self.is_initiator(&from) {
                    warn!(peer = %from, "Ignoring offer from non-initiating peer");
                    return;
                }
                // An offer while established means the other side lost the
                // channel; replace ours.
                debug!(peer = %from, %addr, "Dialing offered address");
                self.peers.insert(from.clone(), PeerState::Pending { since: Instant::now() });
                channel::spawn_dial(from, addr, self.local_id.clone(), self.events.clone());
            }
        }
    }

    fn on_channel_closed(&mut self, peer: &WorkerId, channel: ChannelId) {
        let current = matches!(
            self.peers.get(peer),
            Some(PeerState::Established(open)) if open.id == channel
        );
        if current {
            info!(worker = %self.local_id, peer = %peer, channel, "Direct channel closed");
            self.peers.remove(peer);
        }
    }

    fn offer(&mut self, peer: &WorkerId) {
        self.signal(peer, Signal::Offer { addr: self.advertise });
    }

    fn signal(&mut self, peer: &WorkerId, data: Signal) {
        self.relay_send(RelayEnvelope::Signal {
            id: self.local_id.clone(),
            dest: peer.clone(),
            data,
        });
    }

    fn relay_send(&mut self, envelope: RelayEnvelope) {
        let RelayLink::Up(relay) = &self.relay else {
            debug!(worker = %self.local_id, "Relay down, envelope dropped");
            return;
        };
        let line = match serde_json::to_string(&envelope) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Failed to encode relay envelope");
                return;
            }
        };
        if relay.send_line(line).is_err() {
            self.relay = RelayLink::Down;
        }
    }
}

impl Mesh for ConnectionManager {
    fn connect(&mut self, peer: &WorkerId) {
        if *peer == self.local_id {
            return;
        }
        match self.peers.get(peer) {
            Some(PeerState::Established(channel)) if !channel.is_closed() => return,
            Some(PeerState::Pending { since }) if since.elapsed() < HANDSHAKE_TIMEOUT => return,
            _ => {}
        }

        debug!(worker = %self.local_id, peer = %peer, "Starting handshake");
        self.peers.insert(peer.clone(), PeerState::Pending { since: Instant::now() });
        if self.is_initiator(peer) {
            self.offer(peer);
        } else {
            self.signal(peer, Signal::Request);
        }
    }

    fn send(&mut self, peer: &WorkerId, message: &PeerMessage) {
        if let Some(PeerState::Established(channel)) = self.peers.get(peer) {
            match serde_json::to_string(message) {
                Ok(line) => {
                    if channel.send_line(line).is_ok() {
                        return;
                    }
                    self.peers.remove(peer);
                }
                Err(e) => {
                    warn!(error = %e, "Failed to encode peer message");
                    return;
                }
            }
        }

        // Not direct yet: start the handshake and relay this one.
        self.connect(peer);
        self.relay_send(RelayEnvelope::Message {
            id: self.local_id.clone(),
            dest: peer.clone(),
            data: message.clone(),
        });
    }
}
