use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;
const FIREHOSE_CAPACITY: usize = 4096;

/// Broadcast hub for committed events.
///
/// Keyed channels carry the events touching one room (or one payment);
/// the firehose carries everything, for the reporting collaborator.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
    firehose: broadcast::Sender<Event>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            firehose: broadcast::channel(FIREHOSE_CAPACITY).0,
        }
    }

    /// Subscribe to one room or payment. Creates the channel if needed.
    pub fn subscribe(&self, key: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(key)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<Event> {
        self.firehose.subscribe()
    }

    /// Fan a committed event out to every channel it touches. No-op if nobody listens.
    pub fn publish(&self, event: &Event) {
        for room_id in event.rooms() {
            self.send(room_id, event);
        }
        if let Some(payment_id) = event.payment_id() {
            self.send(payment_id, event);
        }
        let _ = self.firehose.send(event.clone());
    }

    fn send(&self, key: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&key) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop channels nobody is subscribed to any more.
    pub fn prune(&self) {
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BookingStatus;

    fn status_event(room_id: Ulid) -> Event {
        Event::BookingStatusChanged {
            id: Ulid::new(),
            room_id,
            status: BookingStatus::Cancelled,
            at: 0,
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let room = Ulid::new();
        let mut rx = hub.subscribe(room);

        let event = status_event(room);
        hub.publish(&event);
        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn other_rooms_are_not_delivered() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe(Ulid::new());
        hub.publish(&status_event(Ulid::new()));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn firehose_sees_payment_events() {
        let hub = NotifyHub::new();
        let mut all = hub.subscribe_all();
        let event = Event::PaymentBookingSet { id: Ulid::new(), booking_id: None, at: 0 };
        hub.publish(&event);
        assert_eq!(all.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.publish(&status_event(Ulid::new()));
    }

    #[test]
    fn prune_drops_idle_channels() {
        let hub = NotifyHub::new();
        let kept = hub.subscribe(Ulid::new());
        drop(hub.subscribe(Ulid::new()));
        hub.prune();
        assert_eq!(hub.channels.len(), 1);
        drop(kept);
    }
}
