use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Per-studio broadcast of booking events to connected listeners.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
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
        }
    }

    /// Subscribe to a studio's events. Creates the channel on first use.
    pub fn subscribe(&self, studio_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(studio_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Deliver an applied event to every studio it touches. A move reaches
    /// listeners of both the studio it left and the one it landed on.
    pub fn publish(&self, event: &Event) {
        let studio_id = event.studio_id();
        if let Event::BookingMoved { from_studio_id, .. } = event
            && *from_studio_id != studio_id
        {
            self.send(*from_studio_id, event);
        }
        self.send(studio_id, event);
    }

    /// Live receivers on a studio's channel.
    pub fn listener_count(&self, studio_id: &Ulid) -> usize {
        self.channels
            .get(studio_id)
            .map_or(0, |sender| sender.receiver_count())
    }

    /// Drop a studio's channel. Live receivers see the stream close.
    pub fn remove(&self, studio_id: &Ulid) {
        self.channels.remove(studio_id);
    }

    fn send(&self, studio_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&studio_id) {
            let _ = sender.send(event.clone());
        }
    }
}
