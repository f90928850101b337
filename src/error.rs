use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid routed task id `{0}`: expected `<task>~<worker>`")]
    InvalidRoutedId(String),
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
    #[error("resend delay ({resend_ms} ms) must be shorter than the batch delay ({batch_ms} ms)")]
    ResendNotShorter { resend_ms: u64, batch_ms: u64 },
    #[error("data listener binds {0}; set advertise_addr so peers can dial it")]
    MissingAdvertiseAddr(std::net::SocketAddr),
    #[error("invalid worker config: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("scheduler rejected registration of worker {0}")]
    Rejected(String),
    #[error("scheduler has no record of worker {0}")]
    UnknownWorker(String),
}

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("relay at {addr} unreachable: {source}")]
    RelayUnreachable {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to bind data listener: {0}")]
    Bind(#[source] std::io::Error),
    #[error("relay link closed")]
    RelayClosed,
}
