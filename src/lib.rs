pub mod api;
pub mod appresult;
pub mod chat;
pub mod config;
pub mod live;
pub mod model;
pub mod session;

use std::sync::Arc;

pub use appresult::{AppError, AppResult};
pub use chat::{ConversationController, Notice};
pub use live::{ConnectionManager, ConnectionState, LiveEvent, LiveHandle, PresenceTracker};

use api::{ChatApi, RestChatApi};
use config::ChatConfig;
use session::SessionStore;

/// Everything the chat layer needs from the host application.
///
/// Cloning is cheap; pass one context to the [`ConnectionManager`] and to
/// every [`ConversationController`].
#[derive(Clone)]
pub struct ChatContext {
    pub config: ChatConfig,
    pub session: SessionStore,
    pub api: Arc<dyn ChatApi>,
}

impl ChatContext {
    /// Talks REST to `config.api_url` as whoever is logged into `session`.
    pub fn new(config: ChatConfig, session: SessionStore) -> Self {
        let api = Arc::new(RestChatApi::new(config.api_url.clone(), session.clone()));
        Self { config, session, api }
    }

    pub fn with_api(config: ChatConfig, session: SessionStore, api: Arc<dyn ChatApi>) -> Self {
        Self { config, session, api }
    }
}
