//! Per-worker task supervisor.
//!
//! Owns the hosted tasks, the inbound queues (per task), the outbound
//! queues (per destination worker), the address table and the batches
//! awaiting acknowledgment. Every method runs on the worker's single
//! control loop, so none of this state is shared or locked.
//!
//! Delivery is at-least-once: a sent batch stays pending, and is resent
//! every resend period, until the receiver acks its tag. Before each resend
//! the batch is checked against the address table; entries for tasks that
//! have since moved are pulled out and requeued toward the new owner.

use super::event::RuntimeEvent;
use super::host::TaskHost;
use super::timer::ResendTimer;
use crate::mesh::{Inbound, Mesh};
use crate::protocol::wire::{HeartbeatRequest, HeartbeatResponse};
use crate::protocol::{Assignment, Batch, PeerMessage, RoutedMessages, RoutedTaskId, Tag, TagGenerator, TaskUid, WorkerId};
use crate::vertex::VertexRegistry;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub resend_delay: Duration,
    pub n_cores: usize,
}

/// A sent batch awaiting its ack.
#[derive(Debug)]
pub struct PendingBatch {
    worker: WorkerId,
    messages: RoutedMessages,
    resends: u32,
    timer: ResendTimer,
}

impl PendingBatch {
    pub fn worker(&self) -> &WorkerId {
        &self.worker
    }

    pub fn messages(&self) -> &RoutedMessages {
        &self.messages
    }

    pub fn resends(&self) -> u32 {
        self.resends
    }

    pub fn timer_active(&self) -> bool {
        self.timer.is_active()
    }
}

pub struct TaskSupervisor<M: Mesh> {
    id: WorkerId,
    config: SupervisorConfig,
    mesh: M,
    registry: Arc<VertexRegistry>,
    events: mpsc::UnboundedSender<RuntimeEvent>,
    hosts: HashMap<TaskUid, TaskHost>,
    contacts: HashMap<TaskUid, Vec<RoutedTaskId>>,
    addresses: HashMap<TaskUid, WorkerId>,
    inbound: HashMap<TaskUid, Vec<Value>>,
    outbound: HashMap<WorkerId, RoutedMessages>,
    pending: HashMap<Tag, PendingBatch>,
    tags: TagGenerator,
    /// Local task key -> the id the scheduler assigned it under.
    reported_ids: HashMap<TaskUid, TaskUid>,
}

impl<M: Mesh> TaskSupervisor<M> {
    pub fn new(
        id: WorkerId,
        config: SupervisorConfig,
        mesh: M,
        registry: Arc<VertexRegistry>,
        events: mpsc::UnboundedSender<RuntimeEvent>,
    ) -> Self {
        Self {
            id,
            config,
            mesh,
            registry,
            events,
            hosts: HashMap::new(),
            contacts: HashMap::new(),
            addresses: HashMap::new(),
            inbound: HashMap::new(),
            outbound: HashMap::new(),
            pending: HashMap::new(),
            tags: TagGenerator::new(),
            reported_ids: HashMap::new(),
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn mesh(&self) -> &M {
        &self.mesh
    }

    pub fn mesh_mut(&mut self) -> &mut M {
        &mut self.mesh
    }

    // --- Heartbeat ---

    pub fn heartbeat_request(&self) -> HeartbeatRequest {
        let mut active_tasks: Vec<TaskUid> = self
            .hosts
            .keys()
            .map(|task| self.reported_ids.get(task).unwrap_or(task).clone())
            .collect();
        active_tasks.sort();
        HeartbeatRequest {
            worker_id: self.id.clone(),
            active_tasks,
            n_cores: self.config.n_cores,
        }
    }

    pub fn apply_heartbeat(&mut self, response: HeartbeatResponse) {
        for assignment in response.new_tasks {
            self.assign(assignment);
        }
    }

    /// Starts the task on first sight, then always takes the assignment's
    /// contacts as the latest routing truth.
    ///
    /// A task id already routed to this worker (`task~worker`) is keyed by
    /// its task part, the same key its contacts use. Heartbeats keep
    /// reporting it under the assigned id.
    pub fn assign(&mut self, assignment: Assignment) {
        let task = self.local_task(&assignment.task_id);
        if task != assignment.task_id {
            self.reported_ids.insert(task.clone(), assignment.task_id.clone());
        }

        if !self.hosts.contains_key(&task) {
            match self.registry.instantiate(&assignment) {
                Ok(vertex) => {
                    let host = TaskHost::spawn(task.clone(), vertex, self.events.clone());
                    self.hosts.insert(task.clone(), host);
                    info!(worker = %self.id, task = %task, "Task started");
                }
                Err(e) => {
                    warn!(worker = %self.id, task = %task, error = %e, "Failed to start task");
                }
            }
            self.inbound.entry(task.clone()).or_default();
        }

        self.addresses.insert(task.clone(), self.id.clone());
        for contact in &assignment.contacts {
            let previous = self.addresses.insert(contact.task.clone(), contact.worker.clone());
            if previous.as_ref().is_some_and(|w| *w != contact.worker) {
                debug!(task = %contact.task, worker = %contact.worker, "Address changed");
            }
        }
        self.contacts.insert(task, assignment.contacts);
    }

    fn local_task(&self, task_id: &TaskUid) -> TaskUid {
        match task_id.as_str().parse::<RoutedTaskId>() {
            Ok(routed) if routed.worker == self.id => routed.task,
            _ => task_id.clone(),
        }
    }

    // --- Task output ---

    /// Copies `payload` to every current contact of `task`.
    pub fn on_task_output(&mut self, task: &TaskUid, payload: Value) {
        let Some(contacts) = self.contacts.get(task) else {
            debug!(task = %task, "Output from task without contacts dropped");
            return;
        };
        let targets: Vec<RoutedTaskId> = contacts.iter().map(|c| self.resolve(c)).collect();
        for target in targets {
            self.enqueue(target, vec![payload.clone()]);
        }
    }

    /// Routes an externally submitted payload like a task output.
    pub fn submit(&mut self, target: RoutedTaskId, payload: Value) {
        let target = self.resolve(&target);
        self.enqueue(target, vec![payload]);
    }

    /// The contact, pointed at whichever worker the address table now names.
    fn resolve(&self, contact: &RoutedTaskId) -> RoutedTaskId {
        match self.addresses.get(&contact.task) {
            Some(owner) if *owner != contact.worker => contact.rerouted(owner.clone()),
            _ => contact.clone(),
        }
    }

    /// Local targets go straight to the inbound queue; everything else waits
    /// in the destination worker's outbound queue.
    fn enqueue(&mut self, target: RoutedTaskId, payloads: Vec<Value>) {
        if target.worker == self.id {
            self.inbound.entry(target.task).or_default().extend(payloads);
        } else {
            self.outbound
                .entry(target.worker.clone())
                .or_default()
                .entry(target)
                .or_default()
                .extend(payloads);
        }
    }

    // --- Delivery tick ---

    /// Hands each non-empty inbound queue to its task. Queues of missing or
    /// stopped hosts stay as they are.
    pub fn deliver(&mut self) {
        for (task, queue) in self.inbound.iter_mut() {
            if queue.is_empty() {
                continue;
            }
            let Some(host) = self.hosts.get(task) else {
                continue;
            };
            let batch = std::mem::take(queue);
            if let Err(batch) = host.deliver(batch) {
                warn!(worker = %self.id, task = %task, "Task host unavailable, keeping messages queued");
                *queue = batch;
            }
        }
    }

    // --- Send tick ---

    /// Sends one batch per destination worker and tracks it until acked.
    pub fn flush_outbound(&mut self) {
        self.reconcile_outbound();

        let queued = std::mem::take(&mut self.outbound);
        for (worker, messages) in queued {
            if messages.is_empty() {
                continue;
            }
            self.mesh.connect(&worker);

            let tag = self.tags.next_tag();
            let batch = Batch {
                messages,
                tag,
                id: self.id.clone(),
            };
            debug!(worker = %self.id, dest = %worker, tag, routes = batch.messages.len(), "Sending batch");
            self.mesh.send(&worker, &PeerMessage::Batch(batch.clone()));

            let timer = ResendTimer::start(tag, self.config.resend_delay, self.events.clone());
            self.pending.insert(
                tag,
                PendingBatch {
                    worker,
                    messages: batch.messages,
                    resends: 0,
                    timer,
                },
            );
        }
    }

    /// Moves queued messages whose task changed owner since they were queued.
    fn reconcile_outbound(&mut self) {
        let mut moved = Vec::new();
        for queue in self.outbound.values_mut() {
            let stale: Vec<RoutedTaskId> = queue
                .keys()
                .filter(|r| self.addresses.get(&r.task).is_some_and(|owner| *owner != r.worker))
                .cloned()
                .collect();
            for routed in stale {
                if let Some(messages) = queue.remove(&routed) {
                    moved.push((routed, messages));
                }
            }
        }
        self.outbound.retain(|_, queue| !queue.is_empty());
        self.requeue(moved);
    }

    fn requeue(&mut self, moved: Vec<(RoutedTaskId, Vec<Value>)>) {
        for (routed, messages) in moved {
            let target = self.resolve(&routed);
            debug!(from = %routed, to = %target, count = messages.len(), "Rerouting messages");
            self.enqueue(target, messages);
        }
    }

    // --- Resend timer ---

    /// Re-validates a pending batch and resends what is still routed to its
    /// worker. A batch left empty is discarded.
    pub fn on_resend_due(&mut self, tag: Tag) {
        let Some(pending) = self.pending.get_mut(&tag) else {
            return;
        };

        let stale: Vec<RoutedTaskId> = pending
            .messages
            .keys()
            .filter(|r| self.addresses.get(&r.task).is_some_and(|owner| *owner != r.worker))
            .cloned()
            .collect();
        let mut moved = Vec::with_capacity(stale.len());
        for routed in stale {
            if let Some(messages) = pending.messages.remove(&routed) {
                moved.push((routed, messages));
            }
        }

        if pending.messages.is_empty() {
            if let Some(mut done) = self.pending.remove(&tag) {
                done.timer.cancel();
            }
            debug!(worker = %self.id, tag, "Pending batch fully rerouted, discarded");
        } else {
            pending.resends += 1;
            let worker = pending.worker.clone();
            let batch = Batch {
                messages: pending.messages.clone(),
                tag,
                id: self.id.clone(),
            };
            debug!(worker = %self.id, dest = %worker, tag, attempt = pending.resends, "Resending batch");
            self.mesh.send(&worker, &PeerMessage::Batch(batch));
        }

        self.requeue(moved);
    }

    // --- Inbound ---

    pub fn on_peer_message(&mut self, inbound: Inbound) {
        match inbound.message {
            PeerMessage::Ack { ack } => self.on_ack(ack),
            PeerMessage::Batch(batch) => self.on_batch(batch),
        }
    }

    /// Drops the batch with this tag. Unknown tags are ignored.
    pub fn on_ack(&mut self, tag: Tag) {
        match self.pending.remove(&tag) {
            Some(mut done) => {
                done.timer.cancel();
                debug!(worker = %self.id, tag, dest = %done.worker, "Batch acknowledged");
            }
            None => debug!(worker = %self.id, tag, "Ack for unknown batch"),
        }
    }

    /// Queues every message of the batch for its task and acks the sender.
    pub fn on_batch(&mut self, batch: Batch) {
        for (routed, messages) in batch.messages {
            if !self.hosts.contains_key(&routed.task) {
                debug!(task = %routed.task, "Queueing messages for a task not hosted here");
            }
            self.inbound.entry(routed.task).or_default().extend(messages);
        }
        self.mesh.send(&batch.id, &PeerMessage::Ack { ack: batch.tag });
    }

    // --- Inspection ---

    pub fn hosts_task(&self, task: &TaskUid) -> bool {
        self.hosts.contains_key(task)
    }

    pub fn hosted_tasks(&self) -> usize {
        self.hosts.len()
    }

    pub fn contacts_of(&self, task: &TaskUid) -> Option<&[RoutedTaskId]> {
        self.contacts.get(task).map(Vec::as_slice)
    }

    pub fn address_of(&self, task: &TaskUid) -> Option<&WorkerId> {
        self.addresses.get(task)
    }

    pub fn inbound_queue(&self, task: &TaskUid) -> Option<&[Value]> {
        self.inbound.get(task).map(Vec::as_slice)
    }

    pub fn outbound_queue(&self, worker: &WorkerId) -> Option<&BTreeMap<RoutedTaskId, Vec<Value>>> {
        self.outbound.get(worker)
    }

    pub fn pending_batch(&self, tag: Tag) -> Option<&PendingBatch> {
        self.pending.get(&tag)
    }

    pub fn pending_tags(&self) -> Vec<Tag> {
        let mut tags: Vec<Tag> = self.pending.keys().copied().collect();
        tags.sort_unstable();
        tags
    }
}
