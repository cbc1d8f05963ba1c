use std::sync::Arc;

use tokio::sync::watch;

use crate::model::UserId;

/// The authenticated identity the chat layer runs as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: UserId,
    pub token: String,
    pub display_name: String,
    pub avatar: Option<String>,
}

impl Session {
    pub fn new(user_id: impl Into<UserId>, token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            token: token.into(),
            display_name: String::new(),
            avatar: None,
        }
    }
}

/// Shared handle to the current session.
///
/// The auth flow is the only writer (`login`/`logout`); the connection manager
/// and the conversation controllers read it or watch it for changes.
#[derive(Debug, Clone)]
pub struct SessionStore {
    tx: Arc<watch::Sender<Option<Session>>>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            tx: Arc::new(watch::channel(None).0),
        }
    }

    pub fn login(&self, session: Session) {
        self.tx.send_replace(Some(session));
    }

    pub fn logout(&self) {
        self.tx.send_replace(None);
    }

    pub fn current(&self) -> Option<Session> {
        self.tx.borrow().clone()
    }

    pub fn token(&self) -> Option<String> {
        self.tx.borrow().as_ref().map(|s| s.token.clone())
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.tx.borrow().as_ref().map(|s| s.user_id.clone())
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Session>> {
        self.tx.subscribe()
    }
}
