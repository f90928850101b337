use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a worker process, as known to the scheduler and the relay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Random id for workers started without one.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Graph-wide identity of one task, independent of the worker running it.
///
/// Opaque to the runtime; scheduler-issued ids usually look like `client~vertex`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskUid(pub String);

impl TaskUid {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn on(&self, worker: &WorkerId) -> RoutedTaskId {
        RoutedTaskId::new(self.clone(), worker.clone())
    }
}

impl fmt::Display for TaskUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A task paired with the worker currently believed to host it.
///
/// On the wire this is the string `task~worker`. Task ids may contain `~`
/// themselves, so parsing splits at the last separator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoutedTaskId {
    pub task: TaskUid,
    pub worker: WorkerId,
}

pub const ROUTE_SEPARATOR: char = '~';

impl RoutedTaskId {
    pub fn new(task: TaskUid, worker: WorkerId) -> Self {
        Self { task, worker }
    }

    /// Same task, addressed to a different owner.
    pub fn rerouted(&self, worker: WorkerId) -> Self {
        Self {
            task: self.task.clone(),
            worker,
        }
    }
}

impl fmt::Display for RoutedTaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.task, ROUTE_SEPARATOR, self.worker)
    }
}

impl FromStr for RoutedTaskId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once(ROUTE_SEPARATOR) {
            Some((task, worker)) if !task.is_empty() && !worker.is_empty() => {
                Ok(Self::new(TaskUid::new(task), WorkerId::new(worker)))
            }
            _ => Err(ProtocolError::InvalidRoutedId(s.to_string())),
        }
    }
}

impl TryFrom<String> for RoutedTaskId {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RoutedTaskId> for String {
    fn from(value: RoutedTaskId) -> Self {
        value.to_string()
    }
}

/// Identifies one outbound batch until it is acknowledged.
pub type Tag = u64;

/// Issues batch tags: wall-clock milliseconds, bumped when two batches land
/// in the same millisecond so tags stay unique per supervisor.
#[derive(Debug, Default)]
pub struct TagGenerator {
    last: Tag,
}

impl TagGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_tag(&mut self) -> Tag {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as Tag)
            .unwrap_or_default();
        self.last = now.max(self.last + 1);
        self.last
    }
}
