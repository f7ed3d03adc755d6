use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;

use crate::model::PlayerEvent;

/// Fan-out of [`PlayerEvent`]s to any number of subscribers.
///
/// Disconnected subscribers are pruned on the next broadcast.
#[derive(Clone, Default)]
pub struct PlayerEventBus {
    subscribers: Arc<Mutex<Vec<Sender<PlayerEvent>>>>,
}

impl PlayerEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<PlayerEvent> {
        let (tx, rx) = unbounded::<PlayerEvent>();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn broadcast(&self, event: PlayerEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_subscriber_receives_broadcasts() {
        let bus = PlayerEventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();

        bus.broadcast(PlayerEvent::VolumeChanged(12));

        assert_eq!(a.try_recv().unwrap(), PlayerEvent::VolumeChanged(12));
        assert_eq!(b.try_recv().unwrap(), PlayerEvent::VolumeChanged(12));
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = PlayerEventBus::new();
        let kept = bus.subscribe();
        drop(bus.subscribe());

        bus.broadcast(PlayerEvent::MutedChanged(true));

        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(kept.try_recv().unwrap(), PlayerEvent::MutedChanged(true));
    }
}
