use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 64;

/// Readiness and lifecycle events shared by the components of one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    DbOperational,
    DbInitFailed,
    AppShuttingDown,
    SchedulerStarted,
    SchedulerReady,
}

impl Event {
    pub const fn topic(&self) -> &'static str {
        match self {
            Self::DbOperational => "DB.OPERATIONAL",
            Self::DbInitFailed => "DB.INIT_FAILED",
            Self::AppShuttingDown => "APP.SHUTTING_DOWN",
            Self::SchedulerStarted => "APP.SCHEDULER_STARTED",
            Self::SchedulerReady => "APP.SCHEDULER_READY",
        }
    }
}

/// In-process publish/subscribe bus. Cloning yields another handle onto the same channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn publish(&self, event: Event) {
        tracing::debug!(topic = event.topic(), "Publishing event");
        if self.sender.send(event).is_err() {
            tracing::debug!(topic = event.topic(), "No subscribers for event");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}
