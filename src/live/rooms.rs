//! Reference-counted room membership, so several surfaces can follow the same
//! conversation without one tearing down another's subscription.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tracing::debug;

use super::{ClientEvent, Outbox};
use crate::model::ChatId;

pub struct RoomRegistry {
    outbox: Outbox,
    counts: Mutex<HashMap<ChatId, usize>>,
}

impl RoomRegistry {
    pub(crate) fn new(outbox: Outbox) -> Self {
        Self {
            outbox,
            counts: Mutex::new(HashMap::new()),
        }
    }

    fn counts(&self) -> MutexGuard<'_, HashMap<ChatId, usize>> {
        self.counts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Frames are emitted under the counts lock so they can't interleave
    /// with [`RoomRegistry::snapshot_on_connect`].
    pub(crate) fn acquire(self: &Arc<Self>, chat_id: &ChatId) -> RoomGuard {
        let mut counts = self.counts();
        let count = counts.entry(chat_id.clone()).or_insert(0);
        *count += 1;
        if *count == 1 {
            debug!(%chat_id, "joining chat room");
            self.outbox.emit(ClientEvent::join(chat_id));
        }
        drop(counts);

        RoomGuard {
            registry: self.clone(),
            chat_id: chat_id.clone(),
        }
    }

    fn release(&self, chat_id: &ChatId) {
        let mut counts = self.counts();
        match counts.get_mut(chat_id) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                counts.remove(chat_id);
                debug!(%chat_id, "leaving chat room");
                self.outbox.emit(ClientEvent::leave(chat_id));
            }
            None => {}
        }
    }

    /// Takes the rooms to replay on a fresh connection and runs `connected`
    /// (which flips the state to connected) before any other join can slip
    /// in. Rooms acquired earlier are in the list; later ones go out live.
    pub(crate) fn snapshot_on_connect(&self, connected: impl FnOnce()) -> Vec<ChatId> {
        let counts = self.counts();
        let mut rooms: Vec<_> = counts.keys().cloned().collect();
        connected();
        drop(counts);
        rooms.sort();
        rooms
    }

    /// Rooms with at least one holder; replayed on every (re)connect.
    pub fn joined(&self) -> Vec<ChatId> {
        let mut rooms: Vec<_> = self.counts().keys().cloned().collect();
        rooms.sort();
        rooms
    }

    pub fn holders(&self, chat_id: &ChatId) -> usize {
        self.counts().get(chat_id).copied().unwrap_or(0)
    }
}

/// Membership in one conversation's room. Dropping the last guard leaves it.
pub struct RoomGuard {
    registry: Arc<RoomRegistry>,
    chat_id: ChatId,
}

impl RoomGuard {
    pub fn chat_id(&self) -> &ChatId {
        &self.chat_id
    }
}

impl Drop for RoomGuard {
    fn drop(&mut self) {
        self.registry.release(&self.chat_id);
    }
}
