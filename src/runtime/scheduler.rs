use crate::error::SchedulerError;
use crate::protocol::wire::{HeartbeatRequest, HeartbeatResponse, RegisterRequest, RegisterResponse};
use crate::protocol::{Assignment, TaskUid, WorkerId};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

// --- Interfaces ---

/// The worker's view of the scheduler: register once, then heartbeat.
#[async_trait]
pub trait SchedulerClient: Send + Sync {
    async fn register(&self, request: RegisterRequest) -> Result<RegisterResponse, SchedulerError>;
    async fn heartbeat(&self, request: HeartbeatRequest) -> Result<HeartbeatResponse, SchedulerError>;
}

// --- In-Memory Implementation ---

/// Scheduler double for standalone runs and tests: assignments are pushed
/// by hand and handed out on the target worker's next heartbeat.
#[derive(Default)]
pub struct InMemoryScheduler {
    pending: DashMap<WorkerId, VecDeque<Assignment>>,
    active: DashMap<WorkerId, Vec<TaskUid>>,
    reject: AtomicBool,
}

impl InMemoryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(&self, worker: &WorkerId, assignment: Assignment) {
        self.pending.entry(worker.clone()).or_default().push_back(assignment);
    }

    /// Makes every later registration fail.
    pub fn reject_registrations(&self) {
        self.reject.store(true, Ordering::SeqCst);
    }

    pub fn is_registered(&self, worker: &WorkerId) -> bool {
        self.active.contains_key(worker)
    }

    /// Task ids the worker reported in its latest heartbeat.
    pub fn reported_tasks(&self, worker: &WorkerId) -> Vec<TaskUid> {
        self.active
            .get(worker)
            .map(|tasks| tasks.value().clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SchedulerClient for InMemoryScheduler {
    async fn register(&self, request: RegisterRequest) -> Result<RegisterResponse, SchedulerError> {
        if self.reject.load(Ordering::SeqCst) {
            return Ok(RegisterResponse {
                success: false,
                worker_id: None,
            });
        }
        self.active.entry(request.worker_id.clone()).or_default();
        Ok(RegisterResponse {
            success: true,
            worker_id: None,
        })
    }

    async fn heartbeat(&self, request: HeartbeatRequest) -> Result<HeartbeatResponse, SchedulerError> {
        let Some(mut reported) = self.active.get_mut(&request.worker_id) else {
            return Err(SchedulerError::UnknownWorker(request.worker_id.to_string()));
        };
        *reported = request.active_tasks;
        drop(reported);

        let new_tasks = self
            .pending
            .get_mut(&request.worker_id)
            .map(|mut queue| queue.drain(..).collect())
            .unwrap_or_default();
        Ok(HeartbeatResponse { new_tasks })
    }
}
