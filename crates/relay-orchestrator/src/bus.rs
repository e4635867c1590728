use tokio::sync::broadcast;

use relay_types::LifecycleEvent;

/// Broadcast channel for lifecycle events consumed by the dashboard SSE
/// stream and the notification layer. Sends never fail: with no subscriber
/// the event is simply dropped.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(2048);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: LifecycleEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(LifecycleEvent::AgentRunStarted {
            run_id: 1,
            agent_type: "collection".to_string(),
            trigger_type: "webhook".to_string(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind(), "agent_run_started");
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(LifecycleEvent::ApprovalDecided {
            audit_log_id: 1,
            approved: true,
            approved_by: "admin".to_string(),
        });
    }
}
