use std::{sync::Arc, time::Duration};

use tokio::{sync::watch, task::JoinHandle};
use tracing::{info, warn};

use super::{ConnectionState, LiveHandle, PresenceTracker, socket::SocketTask};
use crate::{ChatContext, config::ChatConfig, model::UserId, session::Session};

/// Keeps exactly one live connection open while a session exists.
///
/// There is no `connect()`: the manager watches the [`SessionStore`](crate::session::SessionStore),
/// opens a connection when a session with a token appears, and closes it on
/// logout or when the manager itself is dropped.
pub struct ConnectionManager {
    state: watch::Receiver<ConnectionState>,
    handle: watch::Receiver<Option<LiveHandle>>,
    presence: PresenceTracker,
    supervisor: JoinHandle<()>,
}

impl ConnectionManager {
    pub fn spawn(ctx: &ChatContext) -> Self {
        let state = Arc::new(watch::channel(ConnectionState::Disconnected).0);
        let (handle_tx, handle) = watch::channel(None);
        let presence = PresenceTracker::new();

        let supervisor = Supervisor {
            config: ctx.config.clone(),
            state: state.clone(),
            handle: handle_tx,
            presence: presence.clone(),
            active: None,
        };
        let supervisor = tokio::spawn(supervisor.run(ctx.session.subscribe()));

        Self {
            state: state.subscribe(),
            handle,
            presence,
            supervisor,
        }
    }

    /// The current connection, or `None` before login / after logout.
    pub fn handle(&self) -> Option<LiveHandle> {
        self.handle.borrow().clone()
    }

    pub fn watch_handle(&self) -> watch::Receiver<Option<LiveHandle>> {
        self.handle.clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.presence.is_online(user_id)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.supervisor.abort();
    }
}

/// How long a socket gets to send its Close frame before it is aborted.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

struct ActiveConnection {
    token: String,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ActiveConnection {
    /// Asks the socket task to close the connection and waits until it can
    /// no longer touch shared state. A task that hangs is aborted.
    async fn close(mut self) {
        self.shutdown.send_replace(true);
        if tokio::time::timeout(CLOSE_GRACE, &mut self.task).await.is_err() {
            warn!("live connection did not close in time, aborting");
            self.task.abort();
            let _ = (&mut self.task).await;
        }
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Supervisor {
    config: ChatConfig,
    state: Arc<watch::Sender<ConnectionState>>,
    handle: watch::Sender<Option<LiveHandle>>,
    presence: PresenceTracker,
    active: Option<ActiveConnection>,
}

impl Supervisor {
    async fn run(mut self, mut sessions: watch::Receiver<Option<Session>>) {
        loop {
            let session = sessions.borrow_and_update().clone();
            self.reconcile(session).await;

            if sessions.changed().await.is_err() {
                break;
            }
        }
        self.teardown().await;
    }

    async fn reconcile(&mut self, session: Option<Session>) {
        match session {
            Some(session) if !session.token.is_empty() => {
                if self.active.as_ref().is_some_and(|a| a.token == session.token) {
                    return;
                }
                self.teardown().await;
                self.open(session);
            }
            _ => {
                if self.active.is_some() {
                    self.teardown().await;
                    info!("live connection closed on logout");
                }
            }
        }
    }

    fn open(&mut self, session: Session) {
        info!(user_id = %session.user_id, url = %self.config.socket_url, "opening live connection");
        let (handle, endpoint) = LiveHandle::pair_on(self.state.clone());
        let (shutdown, stop) = watch::channel(false);
        let task = SocketTask {
            url: self.config.socket_url.clone(),
            token: session.token.clone(),
            endpoint,
            presence: self.presence.clone(),
            reconnect: self.config.reconnect.clone(),
            shutdown: stop,
        };

        self.active = Some(ActiveConnection {
            token: session.token,
            shutdown,
            task: tokio::spawn(task.run()),
        });
        self.handle.send_replace(Some(handle));
    }

    async fn teardown(&mut self) {
        self.handle.send_replace(None);
        if let Some(active) = self.active.take() {
            active.close().await;
        }
        self.presence.clear();
        self.state.send_replace(ConnectionState::Disconnected);
    }
}
