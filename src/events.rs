//! In-process event bus connecting the managers.
//!
//! The bus decouples producers (sweeper, safe-mode controller, pipeline
//! manager) from consumers without handing out manager references; events
//! carry identifiers only.

use crate::ids::{NodeId, PipelineId};
use parking_lot::Mutex;
use std::sync::Arc;

/// Safe-mode status pair. Monotone within a process lifetime: once
/// `(false, true)` it never regresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafeModeStatus {
    pub in_safe_mode: bool,
    pub pre_check_complete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScmEvent {
    NodeRegistered { node: NodeId },
    NodeStale { node: NodeId },
    NodeDead { node: NodeId },
    NodeRemoved { node: NodeId },
    PipelineOpened { pipeline: PipelineId },
    PipelineClosed { pipeline: PipelineId },
    PreCheckComplete,
    SafeModeStatus(SafeModeStatus),
}

type Subscriber = Box<dyn Fn(&ScmEvent) + Send + Sync>;

/// Fan-out bus. Publishing is synchronous; subscribers must not block.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, subscriber: F)
    where
        F: Fn(&ScmEvent) + Send + Sync + 'static,
    {
        self.subscribers.lock().push(Box::new(subscriber));
    }

    pub fn publish(&self, event: ScmEvent) {
        let subscribers = self.subscribers.lock();
        for subscriber in subscribers.iter() {
            subscriber(&event);
        }
    }
}

/// Test aid capturing every published event.
#[derive(Clone, Default)]
pub struct EventRecorder {
    events: Arc<Mutex<Vec<ScmEvent>>>,
}

impl EventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, bus: &EventBus) {
        let events = self.events.clone();
        bus.subscribe(move |event| events.lock().push(event.clone()));
    }

    pub fn events(&self) -> Vec<ScmEvent> {
        self.events.lock().clone()
    }

    pub fn contains(&self, event: &ScmEvent) -> bool {
        self.events.lock().iter().any(|seen| seen == event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_reaches_every_subscriber() {
        let bus = EventBus::new();
        let first = EventRecorder::new();
        let second = EventRecorder::new();
        first.attach(&bus);
        second.attach(&bus);

        let node = NodeId::random();
        bus.publish(ScmEvent::NodeStale { node });

        assert!(first.contains(&ScmEvent::NodeStale { node }));
        assert!(second.contains(&ScmEvent::NodeStale { node }));
    }

    #[test]
    fn recorder_preserves_order() {
        let bus = EventBus::new();
        let recorder = EventRecorder::new();
        recorder.attach(&bus);

        bus.publish(ScmEvent::PreCheckComplete);
        bus.publish(ScmEvent::SafeModeStatus(SafeModeStatus {
            in_safe_mode: false,
            pre_check_complete: true,
        }));

        let events = recorder.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], ScmEvent::PreCheckComplete);
    }
}
