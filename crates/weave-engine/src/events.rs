//! Event bus for checkpoint observers.
//!
//! Emission is non-blocking with respect to the executor: handler
//! failures are logged at warn and never propagate.

use tracing::warn;

use weave_models::WorkflowEvent;

/// Observer callback for workflow events.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &WorkflowEvent) -> anyhow::Result<()>;
}

impl<F> EventHandler for F
where
    F: Fn(&WorkflowEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn handle(&self, event: &WorkflowEvent) -> anyhow::Result<()> {
        self(event)
    }
}

/// Ordered list of subscribed handlers.
#[derive(Default)]
pub struct EventBus {
    handlers: Vec<Box<dyn EventHandler>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, handler: impl EventHandler + 'static) {
        self.handlers.push(Box::new(handler));
    }

    pub fn emit(&self, event: &WorkflowEvent) {
        for handler in &self.handlers {
            if let Err(error) = handler.handle(event) {
                warn!(kind = ?event.kind, error = %error, "event handler failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use weave_models::{EventKind, PatternType};

    fn event(kind: EventKind) -> WorkflowEvent {
        WorkflowEvent::new(None, "demo", PatternType::Chain, kind, serde_json::json!({}))
    }

    #[test]
    fn handlers_observe_events_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::new();
        let sink = seen.clone();
        bus.subscribe(move |e: &WorkflowEvent| {
            sink.lock().unwrap().push(e.kind);
            Ok(())
        });

        bus.emit(&event(EventKind::WorkflowStart));
        bus.emit(&event(EventKind::StepComplete));

        let kinds = seen.lock().unwrap().clone();
        assert_eq!(kinds, vec![EventKind::WorkflowStart, EventKind::StepComplete]);
    }

    #[test]
    fn failing_handlers_do_not_break_emission() {
        let seen = Arc::new(Mutex::new(0));
        let mut bus = EventBus::new();
        bus.subscribe(|_: &WorkflowEvent| anyhow::bail!("handler boom"));
        let sink = seen.clone();
        bus.subscribe(move |_: &WorkflowEvent| {
            *sink.lock().unwrap() += 1;
            Ok(())
        });

        bus.emit(&event(EventKind::Error));
        assert_eq!(*seen.lock().unwrap(), 1);
    }
}
