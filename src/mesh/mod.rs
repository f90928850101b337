use crate::protocol::{PeerMessage, RelayEnvelope, WorkerId};

pub mod channel;
pub mod connection;

pub use channel::{ChannelId, DirectChannel};
pub use connection::{ConnectionManager, PeerState};

/// 对等网络接口 (Peer mesh)
/// Supervisor 只通过此接口与其他 worker 通信
pub trait Mesh: Send {
    /// Starts a handshake with `peer` unless one is pending or open.
    fn connect(&mut self, peer: &WorkerId);

    /// Delivers `message` to `peer`, directly when a channel is open and
    /// through the relay otherwise. Fire-and-forget.
    fn send(&mut self, peer: &WorkerId, message: &PeerMessage);
}

/// Network-side happenings, fed into the worker's control loop.
#[derive(Debug)]
pub enum MeshEvent {
    Relay(RelayEnvelope),
    RelayConnected(crate::relay::RelaySender),
    RelayFailed(String),
    RelayClosed {
        link: crate::relay::LinkId,
    },
    ChannelReady {
        peer: WorkerId,
        channel: DirectChannel,
    },
    ChannelData {
        peer: WorkerId,
        channel: ChannelId,
        message: PeerMessage,
    },
    ChannelClosed {
        peer: WorkerId,
        channel: ChannelId,
    },
    DialFailed {
        peer: WorkerId,
        error: String,
    },
}

/// A peer message that arrived over either path.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub from: WorkerId,
    pub message: PeerMessage,
}
