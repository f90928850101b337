#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use meshrun::mesh::Mesh;
use meshrun::protocol::{Batch, PeerMessage, WorkerId};
use meshrun::vertex::{Vertex, VertexDefinition};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum MeshCall {
    Connect(WorkerId),
    Send(WorkerId, PeerMessage),
}

/// Mesh double that records every call instead of touching the network.
#[derive(Debug, Clone, Default)]
pub struct RecordingMesh {
    calls: Arc<Mutex<Vec<MeshCall>>>,
}

impl RecordingMesh {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<MeshCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn sent(&self) -> Vec<(WorkerId, PeerMessage)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                MeshCall::Send(peer, message) => Some((peer, message)),
                MeshCall::Connect(_) => None,
            })
            .collect()
    }

    pub fn batches_to(&self, peer: &WorkerId) -> Vec<Batch> {
        self.sent()
            .into_iter()
            .filter(|(to, _)| to == peer)
            .filter_map(|(_, message)| match message {
                PeerMessage::Batch(batch) => Some(batch),
                PeerMessage::Ack { .. } => None,
            })
            .collect()
    }

    pub fn touched(&self, peer: &WorkerId) -> bool {
        self.calls().iter().any(|call| match call {
            MeshCall::Connect(p) | MeshCall::Send(p, _) => p == peer,
        })
    }
}

impl Mesh for RecordingMesh {
    fn connect(&mut self, peer: &WorkerId) {
        self.calls.lock().unwrap().push(MeshCall::Connect(peer.clone()));
    }

    fn send(&mut self, peer: &WorkerId, message: &PeerMessage) {
        self.calls
            .lock()
            .unwrap()
            .push(MeshCall::Send(peer.clone(), message.clone()));
    }
}

/// Sink program that remembers every input it was given.
#[derive(Debug)]
pub struct CollectVertex {
    seen: Arc<Mutex<Vec<Value>>>,
}

#[async_trait]
impl Vertex for CollectVertex {
    async fn process(&mut self, input: Value) -> Result<Vec<Value>> {
        self.seen.lock().unwrap().push(input);
        Ok(vec![])
    }
}

#[derive(Clone, Default)]
pub struct CollectDefinition {
    pub seen: Arc<Mutex<Vec<Value>>>,
}

impl CollectDefinition {
    pub fn values(&self) -> Vec<Value> {
        self.seen.lock().unwrap().clone()
    }
}

impl VertexDefinition for CollectDefinition {
    fn name(&self) -> &str {
        "collect"
    }

    fn prepare(&self, _params: Value) -> Result<Box<dyn Vertex>> {
        Ok(Box::new(CollectVertex {
            seen: self.seen.clone(),
        }))
    }
}

/// Polls `check` until it holds or `limit` passes.
pub async fn eventually(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
