//! Direct worker-to-worker channels: newline-delimited JSON over TCP.

use super::MeshEvent;
use crate::error::MeshError;
use crate::protocol::wire::ChannelHello;
use crate::protocol::{PeerMessage, WorkerId};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

const HELLO_TIMEOUT: Duration = Duration::from_secs(5);
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

pub type ChannelId = u64;

static NEXT_CHANNEL: AtomicU64 = AtomicU64::new(1);

/// Sending half of an open channel. Dropping it closes the channel.
#[derive(Debug, Clone)]
pub struct DirectChannel {
    pub id: ChannelId,
    sender: mpsc::UnboundedSender<String>,
}

impl DirectChannel {
    /// Queues one serialized message. Fails once the writer has stopped.
    pub fn send_line(&self, line: String) -> Result<(), String> {
        self.sender.send(line).map_err(|e| e.0)
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

pub async fn bind_listener(addr: SocketAddr) -> Result<(TcpListener, SocketAddr), MeshError> {
    let listener = TcpListener::bind(addr).await.map_err(MeshError::Bind)?;
    let local = listener.local_addr().map_err(MeshError::Bind)?;
    Ok((listener, local))
}

/// Accepts inbound channels. The dialing side identifies itself with a
/// [`ChannelHello`] line before anything else.
pub fn spawn_accept_loop(listener: TcpListener, events: mpsc::UnboundedSender<MeshEvent>) {
    tokio::spawn(async move {
        loop {
            let (stream, remote) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Failed to accept peer channel");
                    continue;
                }
            };
            if events.is_closed() {
                return;
            }
            let events = events.clone();
            tokio::spawn(async move {
                let (reader, writer) = stream.into_split();
                let mut reader = BufReader::new(reader);
                let mut first = String::new();
                let read = timeout(HELLO_TIMEOUT, reader.read_line(&mut first)).await;
                let hello = match read {
                    Ok(Ok(n)) if n > 0 => serde_json::from_str::<ChannelHello>(first.trim()),
                    _ => {
                        debug!(%remote, "Peer channel closed before hello");
                        return;
                    }
                };
                match hello {
                    Ok(ChannelHello { hello: peer }) => {
                        let channel = spawn_pumps(peer.clone(), reader, writer, events.clone());
                        let _ = events.send(MeshEvent::ChannelReady { peer, channel });
                    }
                    Err(e) => warn!(%remote, error = %e, "Rejecting peer channel with bad hello"),
                }
            });
        }
    });
}

/// Dials `addr` on behalf of `local_id`. Reports `ChannelReady` or `DialFailed`.
pub fn spawn_dial(
    peer: WorkerId,
    addr: SocketAddr,
    local_id: WorkerId,
    events: mpsc::UnboundedSender<MeshEvent>,
) {
    tokio::spawn(async move {
        let stream = match timeout(DIAL_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                let _ = events.send(MeshEvent::DialFailed {
                    peer,
                    error: e.to_string(),
                });
                return;
            }
            Err(_) => {
                let _ = events.send(MeshEvent::DialFailed {
                    peer,
                    error: "dial timed out".to_string(),
                });
                return;
            }
        };
        let (reader, mut writer) = stream.into_split();
        let hello = match serde_json::to_string(&ChannelHello { hello: local_id }) {
            Ok(line) => line,
            Err(e) => {
                let _ = events.send(MeshEvent::DialFailed {
                    peer,
                    error: e.to_string(),
                });
                return;
            }
        };
        if let Err(e) = write_line(&mut writer, &hello).await {
            let _ = events.send(MeshEvent::DialFailed {
                peer,
                error: e.to_string(),
            });
            return;
        }
        let channel = spawn_pumps(peer.clone(), BufReader::new(reader), writer, events.clone());
        let _ = events.send(MeshEvent::ChannelReady { peer, channel });
    });
}

fn spawn_pumps(
    peer: WorkerId,
    reader: BufReader<OwnedReadHalf>,
    mut writer: OwnedWriteHalf,
    events: mpsc::UnboundedSender<MeshEvent>,
) -> DirectChannel {
    let id = NEXT_CHANNEL.fetch_add(1, Ordering::Relaxed);
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let writer_peer = peer.clone();
    let writer_events = events.clone();
    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if let Err(e) = write_line(&mut writer, &line).await {
                debug!(peer = %writer_peer, channel = id, error = %e, "Channel write failed");
                let _ = writer_events.send(MeshEvent::ChannelClosed {
                    peer: writer_peer,
                    channel: id,
                });
                return;
            }
        }
    });

    tokio::spawn(async move {
        let mut lines = reader.lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<PeerMessage>(&line) {
                        Ok(message) => {
                            let data = MeshEvent::ChannelData {
                                peer: peer.clone(),
                                channel: id,
                                message,
                            };
                            if events.send(data).is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!(peer = %peer, error = %e, "Ignoring malformed peer message"),
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(peer = %peer, channel = id, error = %e, "Channel read failed");
                    break;
                }
            }
        }
        let _ = events.send(MeshEvent::ChannelClosed { peer, channel: id });
    });

    DirectChannel { id, sender: tx }
}

async fn write_line(writer: &mut OwnedWriteHalf, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    Ok(())
}
