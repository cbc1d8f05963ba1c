pub mod connection;
pub mod events;
pub mod presence;
pub mod rooms;
mod socket;

use std::{fmt, sync::Arc};

use tokio::sync::{
    broadcast::{self, error::RecvError},
    mpsc, watch,
};
use tracing::{debug, warn};

use crate::model::ChatId;

pub use connection::ConnectionManager;
pub use events::{ClientEvent, IncomingMessage, LiveEvent, PresenceUpdate};
pub use presence::PresenceTracker;
pub use rooms::{RoomGuard, RoomRegistry};

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        })
    }
}

/// Queue into the transport. Frames are only accepted while connected.
#[derive(Clone)]
pub(crate) struct Outbox {
    tx: mpsc::UnboundedSender<ClientEvent>,
    state: watch::Receiver<ConnectionState>,
}

impl Outbox {
    pub(crate) fn emit(&self, event: ClientEvent) -> bool {
        if *self.state.borrow() != ConnectionState::Connected {
            debug!(event = event.name(), "live connection down, not sending");
            return false;
        }
        self.tx.send(event).is_ok()
    }
}

/// Application side of one live connection: emit frames, receive events,
/// and hold conversation rooms open.
#[derive(Clone)]
pub struct LiveHandle {
    outbox: Outbox,
    events: broadcast::Sender<LiveEvent>,
    rooms: Arc<RoomRegistry>,
}

/// Transport side of a [`LiveHandle`].
pub struct LiveEndpoint {
    pub(crate) outbound: mpsc::UnboundedReceiver<ClientEvent>,
    pub(crate) events: broadcast::Sender<LiveEvent>,
    pub(crate) rooms: Arc<RoomRegistry>,
    state: Arc<watch::Sender<ConnectionState>>,
}

impl LiveHandle {
    /// A handle/endpoint pair with its own connection state.
    pub fn pair() -> (LiveHandle, LiveEndpoint) {
        Self::pair_on(Arc::new(watch::channel(ConnectionState::Disconnected).0))
    }

    pub(crate) fn pair_on(state: Arc<watch::Sender<ConnectionState>>) -> (LiveHandle, LiveEndpoint) {
        let (tx, outbound) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let outbox = Outbox {
            tx,
            state: state.subscribe(),
        };
        let rooms = Arc::new(RoomRegistry::new(outbox.clone()));

        let handle = LiveHandle {
            outbox,
            events: events.clone(),
            rooms: rooms.clone(),
        };
        let endpoint = LiveEndpoint {
            outbound,
            events,
            rooms,
            state,
        };
        (handle, endpoint)
    }

    pub fn state(&self) -> ConnectionState {
        *self.outbox.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Sends a frame if the connection is up. Returns whether it was queued.
    pub fn emit(&self, event: ClientEvent) -> bool {
        self.outbox.emit(event)
    }

    /// Every event pushed on this connection.
    pub fn subscribe(&self) -> broadcast::Receiver<LiveEvent> {
        self.events.subscribe()
    }

    /// Joins the conversation's room for as long as the guard lives.
    pub fn join(&self, chat_id: &ChatId) -> RoomGuard {
        self.rooms.acquire(chat_id)
    }

    /// Room membership plus a stream filtered to one conversation.
    pub fn subscribe_chat(&self, chat_id: &ChatId) -> ChatSubscription {
        ChatSubscription {
            rx: self.events.subscribe(),
            guard: self.join(chat_id),
        }
    }

    pub fn rooms(&self) -> &RoomRegistry {
        &self.rooms
    }
}

impl LiveEndpoint {
    pub fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    /// Fans an inbound event out to every subscriber.
    pub fn deliver(&self, event: LiveEvent) {
        let _ = self.events.send(event);
    }

    pub async fn next_outbound(&mut self) -> Option<ClientEvent> {
        self.outbound.recv().await
    }

    pub fn try_next_outbound(&mut self) -> Option<ClientEvent> {
        self.outbound.try_recv().ok()
    }
}

pub struct ChatSubscription {
    rx: broadcast::Receiver<LiveEvent>,
    guard: RoomGuard,
}

impl ChatSubscription {
    pub fn chat_id(&self) -> &ChatId {
        self.guard.chat_id()
    }

    /// Next event scoped to this conversation. `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<LiveEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.chat_id() == Some(self.guard.chat_id()) => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(chat_id = %self.guard.chat_id(), skipped, "chat subscription lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::events::ChatRef;

    #[test]
    fn emit_is_refused_while_disconnected() {
        let (handle, mut endpoint) = LiveHandle::pair();
        assert!(!handle.emit(ClientEvent::typing_start(&ChatId::from("c1"))));
        assert!(endpoint.try_next_outbound().is_none());

        endpoint.set_state(ConnectionState::Connected);
        assert!(handle.is_connected());
        assert!(handle.emit(ClientEvent::typing_start(&ChatId::from("c1"))));
        assert_eq!(
            endpoint.try_next_outbound(),
            Some(ClientEvent::TypingStart(ChatRef { chat_id: ChatId::from("c1") }))
        );
    }

    #[tokio::test]
    async fn chat_subscription_filters_other_chats() {
        let (handle, endpoint) = LiveHandle::pair();
        let mut sub = handle.subscribe_chat(&ChatId::from("c1"));

        let typing = |chat: &str| LiveEvent::UserTyping {
            chat_id: ChatId::from(chat),
            user_id: "b".into(),
        };
        endpoint.deliver(typing("c2"));
        endpoint.deliver(typing("c1"));

        assert_eq!(sub.recv().await, Some(typing("c1")));
        assert_eq!(sub.chat_id(), &ChatId::from("c1"));
    }
}
