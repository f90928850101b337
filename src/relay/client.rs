use crate::error::MeshError;
use crate::mesh::MeshEvent;
use crate::protocol::{RelayEnvelope, WorkerId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const RELAY_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub type LinkId = u64;

static NEXT_LINK: AtomicU64 = AtomicU64::new(1);

/// Outbound half of a worker's relay link. Lines queued here are written in
/// order; inbound envelopes surface as [`MeshEvent::Relay`]. Each link gets
/// its own id so a close reported by an old link can be told apart.
#[derive(Debug, Clone)]
pub struct RelaySender {
    pub id: LinkId,
    lines: mpsc::UnboundedSender<String>,
}

impl RelaySender {
    pub fn new(lines: mpsc::UnboundedSender<String>) -> Self {
        Self {
            id: NEXT_LINK.fetch_add(1, Ordering::Relaxed),
            lines,
        }
    }

    /// Fails once the writer has stopped.
    pub fn send_line(&self, line: String) -> Result<(), String> {
        self.lines.send(line).map_err(|e| e.0)
    }
}

/// Opens the relay link, registers `local_id`, and starts the reader and
/// writer pumps. A closed link is reported as [`MeshEvent::RelayClosed`].
pub async fn connect_relay(
    addr: &str,
    local_id: &WorkerId,
    events: mpsc::UnboundedSender<MeshEvent>,
) -> Result<RelaySender, MeshError> {
    let relay_error = |source| MeshError::RelayUnreachable {
        addr: addr.to_string(),
        source,
    };
    let stream = match timeout(RELAY_CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(relay_error(e)),
        Err(_) => {
            return Err(relay_error(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "connect timed out",
            )));
        }
    };
    let (reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let link = RelaySender::new(tx);
    let link_id = link.id;

    let register = serde_json::to_string(&RelayEnvelope::Register {
        id: local_id.clone(),
    })
    .map_err(|e| relay_error(std::io::Error::other(e)))?;
    link.send_line(register).map_err(|_| MeshError::RelayClosed)?;

    let writer_events = events.clone();
    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if let Err(e) = write_line(&mut writer, &line).await {
                warn!(error = %e, "Relay write failed");
                let _ = writer_events.send(MeshEvent::RelayClosed { link: link_id });
                break;
            }
        }
    });

    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match serde_json::from_str::<RelayEnvelope>(&line) {
                    Ok(envelope) => {
                        if events.send(MeshEvent::Relay(envelope)).is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!(error = %e, "Ignoring malformed envelope from relay"),
                },
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "Relay read failed");
                    break;
                }
            }
        }
        let _ = events.send(MeshEvent::RelayClosed { link: link_id });
    });

    info!(relay = addr, worker = %local_id, link = link_id, "Registered with relay");
    Ok(link)
}

async fn write_line(writer: &mut tokio::net::tcp::OwnedWriteHalf, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    Ok(())
}
