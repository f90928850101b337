use crate::protocol::WorkerId;
use crate::protocol::wire::RouteHeader;
use anyhow::Result;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Outcome of routing one envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routing {
    Registered(WorkerId),
    Forwarded(WorkerId),
    /// Destination never registered or its connection is gone.
    Dropped(WorkerId),
    Ignored,
}

struct Route {
    connection: u64,
    sender: mpsc::WeakUnboundedSender<String>,
}

/// Worker id -> live connection. Entries hold weak senders: once a
/// connection's handler exits the route stops resolving on its own.
#[derive(Default)]
pub struct RoutingTable {
    routes: DashMap<WorkerId, Route>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last registration wins.
    pub fn register(&self, id: WorkerId, connection: u64, sender: &mpsc::UnboundedSender<String>) {
        self.routes.insert(
            id,
            Route {
                connection,
                sender: sender.downgrade(),
            },
        );
    }

    /// Drops every route still owned by `connection`.
    pub fn release(&self, connection: u64) {
        self.routes.retain(|_, route| route.connection != connection);
    }

    pub fn is_registered(&self, id: &WorkerId) -> bool {
        self.routes
            .get(id)
            .map(|route| route.sender.upgrade().is_some())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Routes one raw envelope line received on `connection`. Forwarded
    /// envelopes are passed on byte-for-byte.
    pub fn route(&self, connection: u64, sender: &mpsc::UnboundedSender<String>, line: &str) -> Routing {
        let header: RouteHeader = match serde_json::from_str(line) {
            Ok(h) => h,
            Err(e) => {
                warn!(connection, error = %e, "Discarding malformed relay envelope");
                return Routing::Ignored;
            }
        };

        if header.kind == "register" {
            return match header.id {
                Some(id) => {
                    self.register(id.clone(), connection, sender);
                    Routing::Registered(id)
                }
                None => Routing::Ignored,
            };
        }

        let Some(dest) = header.dest else {
            return Routing::Ignored;
        };

        let target = self.routes.get(&dest).and_then(|route| route.sender.upgrade());
        match target {
            Some(tx) if tx.send(line.to_string()).is_ok() => Routing::Forwarded(dest),
            _ => Routing::Dropped(dest),
        }
    }
}

pub struct RelayServer {
    listener: TcpListener,
    table: Arc<RoutingTable>,
    next_connection: AtomicU64,
}

impl RelayServer {
    pub async fn bind(addr: impl tokio::net::ToSocketAddrs) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            table: Arc::new(RoutingTable::new()),
            next_connection: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn table(&self) -> Arc<RoutingTable> {
        self.table.clone()
    }

    pub async fn run(self) -> Result<()> {
        info!(addr = %self.local_addr()?, "Relay listening");

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Failed to accept relay connection");
                    continue;
                }
            };
            let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
            debug!(connection, %peer_addr, "Relay connection opened");

            let table = self.table.clone();
            tokio::spawn(async move {
                serve_connection(table, connection, stream).await;
                debug!(connection, "Relay connection closed");
            });
        }
    }
}

async fn serve_connection(table: Arc<RoutingTable>, connection: u64, stream: TcpStream) {
    let (reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let writer_task = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if writer.write_all(line.as_bytes()).await.is_err()
                || writer.write_all(b"\n").await.is_err()
            {
                break;
            }
        }
    });

    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match table.route(connection, &tx, &line) {
                    Routing::Registered(id) => info!(connection, worker = %id, "Worker registered"),
                    Routing::Forwarded(dest) => debug!(connection, dest = %dest, "Envelope forwarded"),
                    Routing::Dropped(dest) => debug!(connection, dest = %dest, "No route, envelope dropped"),
                    Routing::Ignored => {}
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(connection, error = %e, "Relay connection read failed");
                break;
            }
        }
    }

    table.release(connection);
    drop(tx);
    let _ = writer_task.await;
}
