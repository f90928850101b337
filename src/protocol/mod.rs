pub mod ids;
pub mod wire;

pub use ids::{RoutedTaskId, Tag, TagGenerator, TaskUid, WorkerId};
pub use wire::{Assignment, Batch, PeerMessage, RelayEnvelope, RoutedMessages, Signal};
