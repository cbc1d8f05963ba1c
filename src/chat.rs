pub mod list;
pub mod thread;
pub mod typing;

use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, Weak,
    atomic::{AtomicBool, Ordering},
};

use tokio::{
    sync::{
        broadcast::{self, error::RecvError},
        watch,
    },
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    AppError, AppResult, ChatContext,
    api::ChatApi,
    config::ChatConfig,
    live::{ClientEvent, LiveEvent, LiveHandle, RoomGuard, events::OutgoingMessage},
    model::{Chat, ChatId, Message, MessageId, MessageType, UserId},
    session::SessionStore,
};

use list::ChatList;
use thread::MessageThread;
use typing::{LocalTyping, PeerTimers, PeerTyping};

const NOTICE_BUFFER: usize = 128;

/// What changed, for whoever draws the UI.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    HistoryLoaded { chat_id: ChatId },
    MessageAppended { chat_id: ChatId, message: Message },
    MessageUpdated { chat_id: ChatId, message_id: MessageId },
    MessageRemoved { chat_id: ChatId, message_id: MessageId },
    MessagesRead { chat_id: ChatId, reader: UserId },
    TypingChanged { chat_id: ChatId, users: Vec<UserId> },
    ChatsChanged,
    Closed { chat_id: ChatId },
    /// A user action failed; show it briefly and move on.
    Failed { action: &'static str, message: String },
}

struct OpenChat {
    chat_id: ChatId,
    generation: u64,
    thread: MessageThread,
    typing: PeerTyping,
    typing_timers: PeerTimers,
    /// History is in. Before that, sends are refused and live events only
    /// touch the list, since the fetched history replaces the thread.
    ready: bool,
    room: Option<RoomGuard>,
}

#[derive(Default)]
struct State {
    /// Bumped on every open and close; responses from older opens are dropped.
    generation: u64,
    open: Option<OpenChat>,
    chats: ChatList,
    typing: LocalTyping,
}

impl State {
    fn current(&mut self, generation: u64) -> Option<&mut OpenChat> {
        self.open.as_mut().filter(|open| open.generation == generation)
    }

    fn open_for(&mut self, chat_id: &ChatId) -> Option<&mut OpenChat> {
        self.open.as_mut().filter(|open| &open.chat_id == chat_id)
    }
}

struct Inner {
    api: Arc<dyn ChatApi>,
    session: SessionStore,
    config: ChatConfig,
    live: watch::Receiver<Option<LiveHandle>>,
    state: Mutex<State>,
    sending: AtomicBool,
    notices: broadcast::Sender<Notice>,
}

struct SendingFlag<'a>(&'a AtomicBool);

impl Drop for SendingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Keeps the open conversation consistent across fetched history, our own
/// sends and live events, and runs the typing indicator and the
/// conversation list.
pub struct ConversationController {
    inner: Arc<Inner>,
    pump: JoinHandle<()>,
}

impl ConversationController {
    /// Starts the controller and the task that follows `live`. Must be
    /// called from within a Tokio runtime.
    pub fn spawn(ctx: &ChatContext, live: watch::Receiver<Option<LiveHandle>>) -> Self {
        let inner = Arc::new(Inner {
            api: ctx.api.clone(),
            session: ctx.session.clone(),
            config: ctx.config.clone(),
            live: live.clone(),
            state: Mutex::new(State::default()),
            sending: AtomicBool::new(false),
            notices: broadcast::channel(NOTICE_BUFFER).0,
        });
        let pump = tokio::spawn(pump(inner.clone(), live));
        Self { inner, pump }
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.inner.notices.subscribe()
    }

    /// Fetches the history of `chat_id`, marks it read and subscribes to its
    /// live events. Returns `Ok(false)` if another open/close superseded it
    /// before it finished.
    pub async fn open(&self, chat_id: &ChatId) -> AppResult<bool> {
        let inner = &self.inner;
        inner.close_current();

        let generation = {
            let mut state = inner.state();
            state.generation += 1;
            let generation = state.generation;
            state.open = Some(OpenChat {
                chat_id: chat_id.clone(),
                generation,
                thread: MessageThread::new(),
                typing: PeerTyping::new(inner.config.typing_expiry),
                typing_timers: PeerTimers::default(),
                ready: false,
                room: None,
            });
            generation
        };
        info!(%chat_id, "opening conversation");

        let history = match inner.api.fetch_messages(chat_id).await {
            Ok(history) => history,
            Err(e) => {
                let current = {
                    let mut state = inner.state();
                    let current = state.current(generation).is_some();
                    if current {
                        state.open = None;
                    }
                    current
                };
                if current {
                    inner.fail("load messages", &e);
                }
                return Err(e);
            }
        };

        {
            let mut state = inner.state();
            let Some(open) = state.current(generation) else {
                debug!(%chat_id, "discarding superseded history");
                return Ok(false);
            };
            open.thread.replace(history);
        }
        inner.notify([Notice::HistoryLoaded { chat_id: chat_id.clone() }]);

        if let Err(e) = inner.api.mark_read(chat_id).await {
            warn!(%chat_id, error = %e, "marking conversation read failed");
        }

        let live = inner.live();
        let mut state = inner.state();
        let Some(open) = state.current(generation) else {
            return Ok(false);
        };
        open.ready = true;
        open.room = live.map(|handle| handle.join(chat_id));
        Ok(true)
    }

    /// Leaves the open conversation, if any.
    pub fn close(&self) {
        self.inner.close_current();
    }

    /// Persists `text` in the open conversation, then mirrors it live.
    ///
    /// Blank text, sends while another is in flight and sends before the
    /// history has loaded are ignored (`Ok(None)`).
    pub async fn send(&self, text: &str) -> AppResult<Option<Message>> {
        let inner = &self.inner;
        let content = text.trim();
        if content.is_empty() {
            return Ok(None);
        }
        let chat_id = {
            let state = inner.state();
            let open = state.open.as_ref().ok_or(AppError::NoOpenConversation)?;
            if !open.ready {
                debug!(chat_id = %open.chat_id, "history still loading, send ignored");
                return Ok(None);
            }
            open.chat_id.clone()
        };

        if inner.sending.swap(true, Ordering::AcqRel) {
            debug!(%chat_id, "send already in flight");
            return Ok(None);
        }
        let _sending = SendingFlag(&inner.sending);

        let typing = inner.state().typing.stop();
        if let Some(typing_in) = typing {
            inner.emit(ClientEvent::typing_stop(&typing_in));
        }

        let mut message = match inner.api.send_message(&chat_id, content, MessageType::Text).await {
            Ok(message) => message,
            Err(e) => {
                inner.fail("send message", &e);
                return Err(e);
            }
        };
        let client_id = *message.client_id.get_or_insert_with(Uuid::now_v7);

        let mut notices = Vec::new();
        {
            let mut state = inner.state();
            // Reopened meanwhile: the fresh history will carry the message.
            if let Some(open) = state.open_for(&chat_id).filter(|open| open.ready) {
                if open.thread.append(message.clone()) {
                    notices.push(Notice::MessageAppended {
                        chat_id: chat_id.clone(),
                        message: message.clone(),
                    });
                }
            }
            if state
                .chats
                .record_message(&chat_id, &message.content, message.sender.clone(), message.created_at)
            {
                notices.push(Notice::ChatsChanged);
            }
        }
        inner.notify(notices);

        let mirrored = inner.emit(ClientEvent::SendMessage(OutgoingMessage {
            chat_id: chat_id.clone(),
            content: message.content.clone(),
            message_type: message.message_type,
            client_id,
        }));
        if !mirrored {
            debug!(%chat_id, "message persisted without live fan-out");
        }
        Ok(Some(message))
    }

    /// Call on every edit of the compose box.
    ///
    /// Arms the debounce timer with `tokio::spawn`, so this must be called
    /// from within a Tokio runtime.
    pub fn keystroke(&self) {
        let inner = &self.inner;
        let (chat_id, stroke) = {
            let mut state = inner.state();
            let Some(chat_id) = state.open.as_ref().map(|open| open.chat_id.clone()) else {
                return;
            };
            let stroke = state.typing.keystroke(&chat_id);

            let weak = Arc::downgrade(inner);
            let debounce = inner.config.typing_debounce;
            let generation = stroke.generation;
            state.typing.arm(tokio::spawn(async move {
                tokio::time::sleep(debounce).await;
                if let Some(inner) = Weak::upgrade(&weak) {
                    inner.typing_timeout(generation);
                }
            }));
            (chat_id, stroke)
        };

        if let Some(previous) = stroke.abandoned {
            inner.emit(ClientEvent::typing_stop(&previous));
        }
        if stroke.start {
            inner.emit(ClientEvent::typing_start(&chat_id));
        }
    }

    /// Applies one live event. The connection pump calls this for every
    /// event; it is public so other transports can feed the controller.
    ///
    /// A `user_typing` event arms an expiry timer, so like [`keystroke`](Self::keystroke)
    /// this needs a Tokio runtime.
    pub fn handle_event(&self, event: LiveEvent) {
        self.inner.apply(event);
    }

    pub async fn load_chats(&self) -> AppResult<Vec<Chat>> {
        let chats = self
            .inner
            .api
            .list_chats()
            .await
            .inspect_err(|e| self.inner.fail("load conversations", e))?;

        self.inner.state().chats.replace(chats);
        self.inner.notify([Notice::ChatsChanged]);
        Ok(self.chats())
    }

    /// Creates or fetches the one-to-one conversation with `peer`.
    pub async fn start_chat(&self, peer: &UserId) -> AppResult<Chat> {
        let chat = self
            .inner
            .api
            .create_or_get_chat(peer)
            .await
            .inspect_err(|e| self.inner.fail("start conversation", e))?;

        let inserted = self.inner.state().chats.upsert(chat.clone());
        if inserted {
            self.inner.notify([Notice::ChatsChanged]);
        }
        Ok(chat)
    }

    pub async fn archive_chat(&self, chat_id: &ChatId) -> AppResult<()> {
        self.inner
            .api
            .archive_chat(chat_id)
            .await
            .inspect_err(|e| self.inner.fail("archive conversation", e))?;
        self.inner.forget_chat(chat_id);
        Ok(())
    }

    pub async fn unarchive_chat(&self, chat_id: &ChatId) -> AppResult<()> {
        self.inner
            .api
            .unarchive_chat(chat_id)
            .await
            .inspect_err(|e| self.inner.fail("unarchive conversation", e))?;
        self.load_chats().await?;
        Ok(())
    }

    pub async fn delete_chat(&self, chat_id: &ChatId) -> AppResult<()> {
        self.inner
            .api
            .delete_chat(chat_id)
            .await
            .inspect_err(|e| self.inner.fail("delete conversation", e))?;
        self.inner.forget_chat(chat_id);
        Ok(())
    }

    pub async fn edit_message(&self, message_id: &MessageId, text: &str) -> AppResult<Option<Message>> {
        let content = text.trim();
        if content.is_empty() {
            return Ok(None);
        }
        let edited = self
            .inner
            .api
            .edit_message(message_id, content)
            .await
            .inspect_err(|e| self.inner.fail("edit message", e))?;

        let mut notice = None;
        if let Some(open) = self.inner.state().open.as_mut() {
            if open.thread.update(edited.clone()) {
                notice = Some(Notice::MessageUpdated {
                    chat_id: open.chat_id.clone(),
                    message_id: message_id.clone(),
                });
            }
        }
        self.inner.notify(notice);
        Ok(Some(edited))
    }

    pub async fn delete_message(&self, message_id: &MessageId) -> AppResult<()> {
        self.inner
            .api
            .delete_message(message_id)
            .await
            .inspect_err(|e| self.inner.fail("delete message", e))?;

        let mut notice = None;
        if let Some(open) = self.inner.state().open.as_mut() {
            if open.thread.remove(message_id) {
                notice = Some(Notice::MessageRemoved {
                    chat_id: open.chat_id.clone(),
                    message_id: message_id.clone(),
                });
            }
        }
        self.inner.notify(notice);
        Ok(())
    }

    pub async fn unread_count(&self) -> AppResult<u64> {
        self.inner
            .api
            .unread_count()
            .await
            .inspect_err(|e| self.inner.fail("load unread count", e))
    }

    pub fn open_chat_id(&self) -> Option<ChatId> {
        self.inner.open_chat_id()
    }

    /// Messages of the open conversation, oldest first.
    pub fn messages(&self) -> Vec<Message> {
        self.inner
            .state()
            .open
            .as_ref()
            .map(|open| open.thread.messages().to_vec())
            .unwrap_or_default()
    }

    pub fn typing_users(&self) -> Vec<UserId> {
        self.inner
            .state()
            .open
            .as_mut()
            .map(|open| open.typing.users(Instant::now()))
            .unwrap_or_default()
    }

    pub fn chats(&self) -> Vec<Chat> {
        self.inner.state().chats.chats().to_vec()
    }

    pub fn chat(&self, chat_id: &ChatId) -> Option<Chat> {
        self.inner.state().chats.get(chat_id).cloned()
    }

    pub fn is_typing(&self) -> bool {
        self.inner.state().typing.is_typing()
    }

    pub fn is_sending(&self) -> bool {
        self.inner.sending.load(Ordering::Acquire)
    }
}

impl Drop for ConversationController {
    fn drop(&mut self) {
        self.pump.abort();
        self.inner.close_current();
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn live(&self) -> Option<LiveHandle> {
        self.live.borrow().clone()
    }

    fn emit(&self, event: ClientEvent) -> bool {
        match self.live() {
            Some(handle) => handle.emit(event),
            None => {
                debug!(event = event.name(), "no live connection");
                false
            }
        }
    }

    fn notify(&self, notices: impl IntoIterator<Item = Notice>) {
        for notice in notices {
            let _ = self.notices.send(notice);
        }
    }

    fn fail(&self, action: &'static str, err: &AppError) {
        error!(action, error = %err, "chat action failed");
        self.notify([Notice::Failed {
            action,
            message: err.user_message(),
        }]);
    }

    fn open_chat_id(&self) -> Option<ChatId> {
        self.state().open.as_ref().map(|open| open.chat_id.clone())
    }

    fn close_current(&self) {
        let (typing, open) = {
            let mut state = self.state();
            state.generation += 1;
            (state.typing.stop(), state.open.take())
        };

        if let Some(typing_in) = typing {
            self.emit(ClientEvent::typing_stop(&typing_in));
        }
        if let Some(open) = open {
            info!(chat_id = %open.chat_id, "closing conversation");
            let chat_id = open.chat_id.clone();
            drop(open);
            self.notify([Notice::Closed { chat_id }]);
        }
    }

    fn forget_chat(&self, chat_id: &ChatId) {
        let (removed, was_open) = {
            let mut state = self.state();
            let removed = state.chats.remove(chat_id).is_some();
            (removed, state.open_for(chat_id).is_some())
        };
        if was_open {
            self.close_current();
        }
        if removed {
            self.notify([Notice::ChatsChanged]);
        }
    }

    fn typing_timeout(&self, generation: u64) {
        let expired = self.state().typing.expire(generation);
        if let Some(chat_id) = expired {
            self.emit(ClientEvent::typing_stop(&chat_id));
        }
    }

    /// Moves the open conversation's room onto a new connection, or drops it
    /// when the connection is gone.
    fn attach(&self, handle: Option<&LiveHandle>) {
        let mut state = self.state();
        let Some(open) = state.open.as_mut() else {
            return;
        };
        match handle {
            Some(handle) if open.ready => open.room = Some(handle.join(&open.chat_id)),
            Some(_) => {}
            None => {
                open.room = None;
                open.typing.clear();
                open.typing_timers.clear();
            }
        }
    }

    fn peer_typing_timer(self: &Arc<Self>, generation: u64) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let expiry = self.config.typing_expiry;
        tokio::spawn(async move {
            tokio::time::sleep(expiry).await;
            if let Some(inner) = Weak::upgrade(&weak) {
                inner.peer_typing_expired(generation);
            }
        })
    }

    fn peer_typing_expired(&self, generation: u64) {
        let notice = {
            let mut state = self.state();
            let Some(open) = state.current(generation) else {
                return;
            };
            let now = Instant::now();
            if !open.typing.prune(now) {
                return;
            }
            Notice::TypingChanged {
                chat_id: open.chat_id.clone(),
                users: open.typing.users(now),
            }
        };
        self.notify([notice]);
    }

    fn apply(self: &Arc<Self>, event: LiveEvent) {
        let me = self.session.user_id();
        let now = Instant::now();
        let mut notices = Vec::new();

        {
            let mut state = self.state();
            match event {
                LiveEvent::NewMessage(incoming) => {
                    let message = incoming.to_message();
                    let chat_id = incoming.chat_id;

                    if state
                        .chats
                        .record_message(&chat_id, &message.content, message.sender.clone(), message.created_at)
                    {
                        notices.push(Notice::ChatsChanged);
                    } else {
                        debug!(%chat_id, "new message for a conversation not in the list");
                    }

                    if let Some(open) = state.open_for(&chat_id) {
                        if me.as_ref() == Some(&message.sender.id) {
                            debug!(%chat_id, "ignoring live echo of own message");
                        } else if !open.ready {
                            debug!(%chat_id, "history still loading, message left to the fetch");
                        } else if open.thread.append(message.clone()) {
                            notices.push(Notice::MessageAppended { chat_id, message });
                        }
                    }
                }
                LiveEvent::MessageSent(ack) => debug!(?ack, "send acknowledged"),
                LiveEvent::UserTyping { chat_id, user_id } if me.as_ref() != Some(&user_id) => {
                    if let Some(open) = state.open_for(&chat_id) {
                        let timer = self.peer_typing_timer(open.generation);
                        open.typing_timers.arm(&user_id, timer);
                        if open.typing.start(&user_id, now) {
                            let users = open.typing.users(now);
                            notices.push(Notice::TypingChanged { chat_id, users });
                        }
                    }
                }
                LiveEvent::UserStoppedTyping { chat_id, user_id } => {
                    if let Some(open) = state.open_for(&chat_id) {
                        open.typing_timers.cancel(&user_id);
                        if open.typing.stop(&user_id, now) {
                            let users = open.typing.users(now);
                            notices.push(Notice::TypingChanged { chat_id, users });
                        }
                    }
                }
                LiveEvent::UserTyping { .. } => {}
                LiveEvent::MessageRead { chat_id, user_id } => {
                    if let Some(open) = state.open_for(&chat_id).filter(|open| open.ready) {
                        if open.thread.mark_read_by(&user_id) > 0 {
                            notices.push(Notice::MessagesRead { chat_id, reader: user_id });
                        }
                    }
                }
                // The connection's PresenceTracker consumes these.
                LiveEvent::Presence(_) => {}
            }
        }

        self.notify(notices);
    }
}

async fn pump(inner: Arc<Inner>, mut live: watch::Receiver<Option<LiveHandle>>) {
    loop {
        let handle = live.borrow_and_update().clone();
        inner.attach(handle.as_ref());

        let Some(handle) = handle else {
            if live.changed().await.is_err() {
                return;
            }
            continue;
        };

        let mut events = handle.subscribe();
        loop {
            tokio::select! {
                changed = live.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    break;
                }
                event = events.recv() => match event {
                    Ok(event) => inner.apply(event),
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "live events lagged"),
                    Err(RecvError::Closed) => return,
                },
            }
        }
    }
}
