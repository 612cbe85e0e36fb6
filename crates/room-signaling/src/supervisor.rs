use std::sync::Arc;

use futures::future::join_all;

use crate::bus::{ChannelState, MessageBus, RoomChannel};
use crate::error::ConnectError;

/// Owns the connect lifecycle of room channels on top of a [`MessageBus`].
#[derive(Clone)]
pub struct SubscriptionSupervisor {
    bus: MessageBus,
}

impl SubscriptionSupervisor {
    pub fn new(bus: MessageBus) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    /// Connect `room_id`. Errors are surfaced as-is; retrying is the caller's call.
    pub async fn subscribe(&self, room_id: &str) -> Result<Arc<RoomChannel>, ConnectError> {
        self.bus.connect(room_id).await
    }

    /// True only for a channel in the `Subscribed` state. Dead bookkeeping
    /// found along the way is evicted so the next `subscribe` starts fresh.
    pub fn is_subscribed(&self, room_id: &str) -> bool {
        match self.bus.state(room_id) {
            Some(ChannelState::Subscribed) => true,
            Some(state) if state.is_terminal() => {
                self.bus.evict_stale(room_id);
                false
            }
            _ => false,
        }
    }

    pub fn state(&self, room_id: &str) -> Option<ChannelState> {
        self.bus.state(room_id)
    }

    /// A new `subscribe` may be attempted: no live or in-flight channel exists.
    pub fn can_reconnect(&self, room_id: &str) -> bool {
        match self.bus.state(room_id) {
            None => true,
            Some(state) if state.is_terminal() => self.bus.evict_stale(room_id),
            Some(_) => false,
        }
    }

    pub async fn unsubscribe(&self, room_id: &str) {
        self.bus.disconnect(room_id).await;
    }

    /// Disconnect every room concurrently and wait for all of them.
    pub async fn unsubscribe_all(&self) {
        let rooms = self.bus.rooms();
        if rooms.is_empty() {
            return;
        }
        tracing::debug!(rooms = rooms.len(), "unsubscribing from all rooms");
        join_all(rooms.iter().map(|room_id| self.bus.disconnect(room_id))).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SignalingConfig;
    use transport_bus::{JoinBehavior, LocalBus};

    fn make_supervisor(transport: &Arc<LocalBus>) -> SubscriptionSupervisor {
        SubscriptionSupervisor::new(MessageBus::new(
            transport.clone(),
            SignalingConfig::default(),
        ))
    }

    #[tokio::test]
    async fn closed_channel_is_evicted_by_the_subscribed_check() {
        let transport = Arc::new(LocalBus::new());
        let supervisor = make_supervisor(&transport);
        let channel = supervisor.subscribe("lobby").await.expect("subscribe");
        assert!(supervisor.is_subscribed("lobby"));

        transport.force_close("room_lobby_signaling");
        while channel.state() != ChannelState::Closed {
            tokio::task::yield_now().await;
        }

        assert!(!supervisor.is_subscribed("lobby"));
        assert_eq!(supervisor.state("lobby"), None);
        assert!(supervisor.can_reconnect("lobby"));
        supervisor.subscribe("lobby").await.expect("fresh subscribe");
        assert!(supervisor.is_subscribed("lobby"));
    }

    #[tokio::test(start_paused = true)]
    async fn connecting_room_cannot_reconnect() {
        let transport = Arc::new(LocalBus::with_default_join(JoinBehavior::Never));
        let supervisor = make_supervisor(&transport);
        let pending = {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.subscribe("slow").await })
        };
        tokio::task::yield_now().await;
        assert_eq!(supervisor.state("slow"), Some(ChannelState::Connecting));
        assert!(!supervisor.can_reconnect("slow"));

        let result = pending.await.expect("task");
        assert_eq!(result.expect_err("times out"), ConnectError::Timeout);
        assert!(supervisor.can_reconnect("slow"));
    }

    #[tokio::test]
    async fn unsubscribe_all_clears_every_room() {
        let transport = Arc::new(LocalBus::new());
        let supervisor = make_supervisor(&transport);
        for room in ["a", "b", "c"] {
            supervisor.subscribe(room).await.expect("subscribe");
        }
        supervisor.unsubscribe_all().await;
        for room in ["a", "b", "c"] {
            assert!(!supervisor.is_subscribed(room));
            assert_eq!(
                transport.active_subscriptions(&format!("room_{room}_signaling")),
                0
            );
        }
    }
}
