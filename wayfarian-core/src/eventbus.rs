//! Room-based publish/subscribe for the socket gateway.
//!
//! One `tokio::sync::broadcast` channel per room name (`user-{id}`,
//! `group-{id}`, `group-journey-{id}`), created lazily behind a
//! `Mutex<HashMap<...>>` the way `GroupQueue::Inner` tracks per-group state
//! — a single lock guarding a small map of per-key channels, rather than a
//! lock per room. Rooms with no subscribers are pruned on next access so
//! the map doesn't grow unbounded over a long-running process.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::sync::Mutex;

const ROOM_CHANNEL_CAPACITY: usize = 256;

struct Inner {
    rooms: HashMap<String, broadcast::Sender<String>>,
}

/// Fan-out hub: join a room to receive its events, emit to broadcast to
/// every current subscriber. Messages are pre-serialized JSON so emit
/// never needs to know the shape of any particular event.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<Inner>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                rooms: HashMap::new(),
            })),
        }
    }

    pub async fn join(&self, room: &str) -> broadcast::Receiver<String> {
        let mut inner = self.inner.lock().await;
        inner
            .rooms
            .entry(room.to_string())
            .or_insert_with(|| broadcast::channel(ROOM_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Send `payload` to every current subscriber of `room`. A room with no
    /// subscribers silently drops the message — there is nothing to retry.
    pub async fn emit(&self, room: &str, payload: String) {
        let mut inner = self.inner.lock().await;
        if let Some(sender) = inner.rooms.get(room) {
            if sender.receiver_count() == 0 {
                inner.rooms.remove(room);
                return;
            }
            let _ = sender.send(payload);
        }
    }

    pub async fn room_count(&self) -> usize {
        self.inner.lock().await.rooms.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

pub mod rooms {
    pub fn user(user_id: &str) -> String {
        format!("user-{user_id}")
    }

    pub fn group(group_id: &str) -> String {
        format!("group-{group_id}")
    }

    pub fn group_journey(group_journey_id: &str) -> String {
        format!("group-journey-{group_journey_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_reaches_subscribers() {
        let bus = EventBus::new();
        let mut rx = bus.join("group-1").await;
        bus.emit("group-1", "hello".to_string()).await;
        assert_eq!(rx.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn emit_to_empty_room_is_a_noop() {
        let bus = EventBus::new();
        bus.emit("nobody-here", "hello".to_string()).await;
    }

    #[tokio::test]
    async fn multiple_subscribers_all_receive() {
        let bus = EventBus::new();
        let mut rx1 = bus.join("group-1").await;
        let mut rx2 = bus.join("group-1").await;
        bus.emit("group-1", "hi".to_string()).await;
        assert_eq!(rx1.recv().await.unwrap(), "hi");
        assert_eq!(rx2.recv().await.unwrap(), "hi");
    }

    #[tokio::test]
    async fn room_with_no_subscribers_is_pruned_on_emit() {
        let bus = EventBus::new();
        {
            let _rx = bus.join("group-1").await;
            assert_eq!(bus.room_count().await, 1);
        }
        bus.emit("group-1", "hi".to_string()).await;
        assert_eq!(bus.room_count().await, 0);
    }
}
