use super::event::RuntimeEvent;
use super::scheduler::SchedulerClient;
use super::supervisor::{SupervisorConfig, TaskSupervisor};
use crate::config::WorkerConfig;
use crate::error::SchedulerError;
use crate::mesh::{ConnectionManager, MeshEvent, channel};
use crate::protocol::wire::RegisterRequest;
use crate::protocol::{RoutedTaskId, WorkerId};
use crate::relay::connect_relay;
use crate::vertex::VertexRegistry;
use anyhow::{Result, anyhow};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

/// Handle to a running worker.
pub struct WorkerHandle {
    id: WorkerId,
    events: mpsc::UnboundedSender<RuntimeEvent>,
    shutdown: Option<oneshot::Sender<()>>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// Feeds `payload` into the graph, addressed to `target`.
    pub fn submit(&self, target: RoutedTaskId, payload: Value) -> Result<()> {
        self.events
            .send(RuntimeEvent::Submit { target, payload })
            .map_err(|_| anyhow!("worker {} has stopped", self.id))
    }

    /// Resolves when the control loop exits. Dropping the handle without
    /// calling this stops the worker.
    pub async fn wait(self) -> Result<()> {
        let WorkerHandle { join, shutdown, .. } = self;
        let _keep_running = shutdown;
        join.await?;
        Ok(())
    }

    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.join.await?;
        Ok(())
    }
}

pub struct Worker;

impl Worker {
    /// Registers with the scheduler, opens the data listener and the relay
    /// link, then runs the control loop in the background. Registration
    /// failure is the only error: a worker without an id cannot operate.
    pub async fn start(
        config: WorkerConfig,
        scheduler: Arc<dyn SchedulerClient>,
        registry: Arc<VertexRegistry>,
    ) -> Result<WorkerHandle> {
        config.validate()?;

        // 1. Register
        let proposed = config.worker_id.clone().unwrap_or_else(WorkerId::random);
        let reply = scheduler
            .register(RegisterRequest {
                n_cores: config.n_cores,
                worker_id: proposed.clone(),
            })
            .await
            .map_err(|e| {
                error!(worker = %proposed, error = %e, "Failed to register worker");
                e
            })?;
        if !reply.success {
            error!(worker = %proposed, "Scheduler rejected registration");
            return Err(SchedulerError::Rejected(proposed.to_string()).into());
        }
        let id = reply.worker_id.unwrap_or(proposed);
        info!(worker = %id, "Successfully registered");

        // 2. Direct-channel listener
        let (mesh_tx, mesh_rx) = mpsc::unbounded_channel::<MeshEvent>();
        let (listener, bound) = channel::bind_listener(config.data_bind).await?;
        let advertise = config.advertise_addr.unwrap_or(bound);
        channel::spawn_accept_loop(listener, mesh_tx.clone());
        info!(worker = %id, %bound, %advertise, "Peer listener ready");

        // 3. Relay link; retried from the heartbeat tick if it is down now.
        let mut mesh = ConnectionManager::new(id.clone(), advertise, mesh_tx.clone());
        match connect_relay(&config.relay_addr, &id, mesh_tx.clone()).await {
            Ok(relay) => mesh.attach_relay(relay),
            Err(e) => warn!(worker = %id, error = %e, "Relay unavailable at startup"),
        }

        // 4. Supervisor + control loop
        let (events_tx, events_rx) = mpsc::unbounded_channel::<RuntimeEvent>();
        let supervisor = TaskSupervisor::new(
            id.clone(),
            SupervisorConfig {
                resend_delay: config.resend_delay(),
                n_cores: config.n_cores,
            },
            mesh,
            registry,
            events_tx.clone(),
        );

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let control = ControlLoop {
            config,
            scheduler,
            supervisor,
            events_tx: events_tx.clone(),
            events_rx,
            mesh_rx,
            heartbeat_in_flight: false,
        };
        let join = tokio::spawn(control.run(shutdown_rx));

        Ok(WorkerHandle {
            id,
            events: events_tx,
            shutdown: Some(shutdown_tx),
            join,
        })
    }
}

struct ControlLoop {
    config: WorkerConfig,
    scheduler: Arc<dyn SchedulerClient>,
    supervisor: TaskSupervisor<ConnectionManager>,
    events_tx: mpsc::UnboundedSender<RuntimeEvent>,
    events_rx: mpsc::UnboundedReceiver<RuntimeEvent>,
    mesh_rx: mpsc::UnboundedReceiver<MeshEvent>,
    heartbeat_in_flight: bool,
}

impl ControlLoop {
    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        let mut deliver_tick = interval(self.config.batch_delay());
        let mut send_tick = interval(self.config.batch_delay());
        let mut heartbeat_tick = interval(self.config.heartbeat_interval());
        for tick in [&mut deliver_tick, &mut send_tick, &mut heartbeat_tick] {
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        let id = self.supervisor.id().clone();
        info!(worker = %id, "Worker started.");

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = deliver_tick.tick() => self.supervisor.deliver(),
                _ = send_tick.tick() => self.supervisor.flush_outbound(),
                _ = heartbeat_tick.tick() => self.on_heartbeat_tick(),
                Some(event) = self.mesh_rx.recv() => {
                    if let Some(inbound) = self.supervisor.mesh_mut().handle_event(event) {
                        self.supervisor.on_peer_message(inbound);
                    }
                }
                Some(event) = self.events_rx.recv() => self.on_runtime_event(event),
            }
        }

        info!(worker = %id, "Worker stopped.");
    }

    fn on_heartbeat_tick(&mut self) {
        if self.supervisor.mesh().needs_relay() {
            self.supervisor.mesh_mut().mark_relay_connecting();
            let addr = self.config.relay_addr.clone();
            let id = self.supervisor.id().clone();
            let mesh_tx = self.supervisor.mesh().events();
            tokio::spawn(async move {
                let event = match connect_relay(&addr, &id, mesh_tx.clone()).await {
                    Ok(relay) => MeshEvent::RelayConnected(relay),
                    Err(e) => MeshEvent::RelayFailed(e.to_string()),
                };
                let _ = mesh_tx.send(event);
            });
        }

        if self.heartbeat_in_flight {
            debug!("Previous heartbeat still in flight");
            return;
        }
        self.heartbeat_in_flight = true;

        let request = self.supervisor.heartbeat_request();
        let scheduler = self.scheduler.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let reply = scheduler.heartbeat(request).await;
            let _ = events.send(RuntimeEvent::HeartbeatReply(reply));
        });
    }

    fn on_runtime_event(&mut self, event: RuntimeEvent) {
        match event {
            RuntimeEvent::TaskOutput { task, payload } => self.supervisor.on_task_output(&task, payload),
            RuntimeEvent::ResendDue(tag) => self.supervisor.on_resend_due(tag),
            RuntimeEvent::HeartbeatReply(reply) => {
                self.heartbeat_in_flight = false;
                match reply {
                    Ok(response) => self.supervisor.apply_heartbeat(response),
                    Err(e) => warn!(worker = %self.supervisor.id(), error = %e, "Failed to send heartbeat"),
                }
            }
            RuntimeEvent::Submit { target, payload } => self.supervisor.submit(target, payload),
        }
    }
}
