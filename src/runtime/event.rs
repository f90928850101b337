use crate::error::SchedulerError;
use crate::protocol::wire::HeartbeatResponse;
use crate::protocol::{RoutedTaskId, Tag, TaskUid};
use serde_json::Value;

/// Everything the control loop reacts to besides ticks and network events.
#[derive(Debug)]
pub enum RuntimeEvent {
    /// A hosted task produced a value.
    TaskOutput { task: TaskUid, payload: Value },
    /// The resend timer of a pending batch fired.
    ResendDue(Tag),
    HeartbeatReply(Result<HeartbeatResponse, SchedulerError>),
    /// Ingress from the embedding process.
    Submit { target: RoutedTaskId, payload: Value },
}
