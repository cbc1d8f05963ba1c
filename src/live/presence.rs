use std::{
    collections::HashSet,
    sync::{Arc, PoisonError, RwLock},
};

use tracing::debug;

use super::PresenceUpdate;
use crate::model::UserId;

/// Set of users the server currently reports as online.
///
/// Readers get clones of the tracker; only the live connection mutates it.
/// There is no client-side expiry: a user stays online until the server
/// says otherwise or the session ends.
#[derive(Debug, Clone, Default)]
pub struct PresenceTracker {
    online: Arc<RwLock<HashSet<UserId>>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.online
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(user_id)
    }

    pub fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<_> = self
            .online
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();
        users.sort();
        users
    }

    pub fn len(&self) -> usize {
        self.online.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn apply(&self, update: &PresenceUpdate) {
        let mut online = self.online.write().unwrap_or_else(PoisonError::into_inner);
        match update {
            PresenceUpdate::Snapshot(users) => {
                *online = users.iter().cloned().collect();
                debug!(online = online.len(), "presence snapshot");
            }
            PresenceUpdate::Online(user_id) => {
                online.insert(user_id.clone());
            }
            PresenceUpdate::Offline(user_id) => {
                online.remove(user_id);
            }
        }
    }

    pub(crate) fn clear(&self) {
        self.online.write().unwrap_or_else(PoisonError::into_inner).clear();
    }
}
