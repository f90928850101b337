//! Messages exchanged between workers, the relay and the scheduler.
//!
//! Every transport in the system carries one JSON document per line.

use super::ids::{RoutedTaskId, TaskUid, Tag, WorkerId};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use tracing::warn;

/// Messages grouped by destination, as carried in one batch.
pub type RoutedMessages = BTreeMap<RoutedTaskId, Vec<Value>>;

/// Payload carried between two workers, directly or through the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PeerMessage {
    Ack { ack: Tag },
    Batch(Batch),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    #[serde(deserialize_with = "routed_messages")]
    pub messages: RoutedMessages,
    pub tag: Tag,
    /// Sender, which is also where the ack goes.
    pub id: WorkerId,
}

/// Drops entries whose key is not a valid routed id instead of failing the
/// whole batch, so the batch can still be acked.
fn routed_messages<'de, D>(deserializer: D) -> Result<RoutedMessages, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<String, Vec<Value>>::deserialize(deserializer)?;
    let mut messages = RoutedMessages::new();
    for (key, payloads) in raw {
        match key.parse::<RoutedTaskId>() {
            Ok(routed) => {
                messages.entry(routed).or_default().extend(payloads);
            }
            Err(e) => warn!(key = %key, dropped = payloads.len(), error = %e, "Dropping messages with invalid route"),
        }
    }
    Ok(messages)
}

/// Envelopes understood by the signaling relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RelayEnvelope {
    Register {
        id: WorkerId,
    },
    Signal {
        id: WorkerId,
        dest: WorkerId,
        data: Signal,
    },
    Message {
        id: WorkerId,
        dest: WorkerId,
        data: PeerMessage,
    },
}

/// The part of an envelope the relay needs for routing. Everything else is
/// forwarded untouched.
#[derive(Debug, Deserialize)]
pub struct RouteHeader {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub id: Option<WorkerId>,
    #[serde(default)]
    pub dest: Option<WorkerId>,
}

/// Handshake signals relayed while a direct channel is being set up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Signal {
    /// Sent by the non-initiating side: "please offer me your address".
    Request,
    /// Sent by the initiator: "dial me here".
    Offer { addr: SocketAddr },
}

/// First line written by the dialing side of a direct channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelHello {
    pub hello: WorkerId,
}

// --- Scheduler contract ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub n_cores: usize,
    pub worker_id: WorkerId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterResponse {
    #[serde(default = "accepted")]
    pub success: bool,
    /// Scheduler-assigned id, replacing the one the worker proposed.
    #[serde(default)]
    pub worker_id: Option<WorkerId>,
}

fn accepted() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub worker_id: WorkerId,
    pub active_tasks: Vec<TaskUid>,
    pub n_cores: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    #[serde(default)]
    pub new_tasks: Vec<Assignment>,
}

/// One task placed on this worker, with the downstream tasks it feeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub task_id: TaskUid,
    #[serde(default)]
    pub contacts: Vec<RoutedTaskId>,
    #[serde(default)]
    pub program: Option<String>,
    #[serde(default)]
    pub params: Value,
}

impl Assignment {
    pub fn new(task_id: TaskUid, contacts: Vec<RoutedTaskId>) -> Self {
        Self {
            task_id,
            contacts,
            program: None,
            params: Value::Null,
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = Some(program.into());
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }
}
