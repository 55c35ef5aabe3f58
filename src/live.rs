use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::LiveEvent;

const CHANNEL_CAPACITY: usize = 256;

/// Per-resource broadcast of status changes. Publishing never blocks or fails.
pub struct LiveHub {
    channels: DashMap<Ulid, broadcast::Sender<LiveEvent>>,
}

impl Default for LiveHub {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a resource's events. Creates the channel if needed.
    pub fn subscribe(&self, resource_id: Ulid) -> broadcast::Receiver<LiveEvent> {
        let sender = self
            .channels
            .entry(resource_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// No-op if nobody is listening.
    pub fn publish(&self, event: LiveEvent) {
        if let Some(sender) = self.channels.get(&event.resource_id()) {
            let _ = sender.send(event);
        }
    }

    /// Drop channels whose subscribers have all gone away.
    pub fn prune(&self) {
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ReservationStatus, Span};

    fn changed(resource_id: Ulid) -> LiveEvent {
        LiveEvent::ReservationChanged {
            reservation_id: Ulid::new(),
            resource_id,
            status: ReservationStatus::Confirmed,
            span: Span::new(0, 10),
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = LiveHub::new();
        let rid = Ulid::new();
        let mut rx = hub.subscribe(rid);

        let event = changed(rid);
        hub.publish(event.clone());
        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn other_resources_are_not_delivered() {
        let hub = LiveHub::new();
        let mut rx = hub.subscribe(Ulid::new());
        hub.publish(changed(Ulid::new()));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn publish_without_subscribers_is_noop() {
        let hub = LiveHub::new();
        hub.publish(changed(Ulid::new()));
    }

    #[test]
    fn prune_drops_abandoned_channels() {
        let hub = LiveHub::new();
        let rid = Ulid::new();
        let rx = hub.subscribe(rid);
        hub.prune();
        assert_eq!(hub.channels.len(), 1);
        drop(rx);
        hub.prune();
        assert!(hub.channels.is_empty());
    }
}
