use super::event::RuntimeEvent;
use crate::protocol::TaskUid;
use crate::vertex::Vertex;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, warn};

/// Upper bound for a single `process` call.
pub const PROCESS_TIMEOUT: Duration = Duration::from_secs(60);

/// Runs one vertex in its own tokio task. The vertex is owned by that task;
/// the supervisor only talks to it through the inbox and the event channel.
#[derive(Debug)]
pub struct TaskHost {
    task: TaskUid,
    inbox: mpsc::UnboundedSender<Vec<Value>>,
    handle: JoinHandle<()>,
}

impl TaskHost {
    pub fn spawn(task: TaskUid, mut vertex: Box<dyn Vertex>, outputs: mpsc::UnboundedSender<RuntimeEvent>) -> Self {
        let (inbox, mut rx) = mpsc::unbounded_channel::<Vec<Value>>();
        let task_id = task.clone();

        let handle = tokio::spawn(async move {
            while let Some(batch) = rx.recv().await {
                debug!(task = %task_id, size = batch.len(), "Processing batch");
                for input in batch {
                    match timeout(PROCESS_TIMEOUT, vertex.process(input)).await {
                        Ok(Ok(produced)) => {
                            for payload in produced {
                                let output = RuntimeEvent::TaskOutput {
                                    task: task_id.clone(),
                                    payload,
                                };
                                if outputs.send(output).is_err() {
                                    return;
                                }
                            }
                        }
                        Ok(Err(e)) => {
                            warn!(task = %task_id, error = ?e, "Vertex failed to process message");
                        }
                        Err(_) => {
                            error!(task = %task_id, "Vertex timed out after {:?}", PROCESS_TIMEOUT);
                        }
                    }
                }
            }
        });

        Self { task, inbox, handle }
    }

    pub fn task(&self) -> &TaskUid {
        &self.task
    }

    /// Hands one batch to the vertex. On failure the batch comes back so the
    /// caller can keep it queued.
    pub fn deliver(&self, batch: Vec<Value>) -> Result<(), Vec<Value>> {
        if self.handle.is_finished() {
            return Err(batch);
        }
        self.inbox.send(batch).map_err(|e| e.0)
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for TaskHost {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
