use super::event::RuntimeEvent;
use crate::protocol::Tag;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval_at};

/// Fires [`RuntimeEvent::ResendDue`] for one batch every `period` until
/// cancelled. Cancelling twice is a no-op; dropping cancels.
#[derive(Debug)]
pub struct ResendTimer {
    handle: Option<JoinHandle<()>>,
}

impl ResendTimer {
    pub fn start(tag: Tag, period: Duration, events: mpsc::UnboundedSender<RuntimeEvent>) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticks = interval_at(tokio::time::Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                if events.send(RuntimeEvent::ResendDue(tag)).is_err() {
                    return;
                }
            }
        });
        Self { handle: Some(handle) }
    }

    /// Stops the timer. Returns false if it was already stopped.
    pub fn cancel(&mut self) -> bool {
        match self.handle.take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for ResendTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
