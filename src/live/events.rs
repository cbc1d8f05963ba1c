use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    AppResult,
    model::{ChatId, Message, MessageId, MessageType, UserId, UserRef},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRef {
    pub chat_id: ChatId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub chat_id: ChatId,
    pub content: String,
    pub message_type: MessageType,
    pub client_id: Uuid,
}

/// Frames the client sends on the live connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    JoinChat(ChatRef),
    LeaveChat(ChatRef),
    SendMessage(OutgoingMessage),
    TypingStart(ChatRef),
    TypingStop(ChatRef),
}

impl ClientEvent {
    pub fn join(chat_id: &ChatId) -> Self {
        Self::JoinChat(ChatRef { chat_id: chat_id.clone() })
    }

    pub fn leave(chat_id: &ChatId) -> Self {
        Self::LeaveChat(ChatRef { chat_id: chat_id.clone() })
    }

    pub fn typing_start(chat_id: &ChatId) -> Self {
        Self::TypingStart(ChatRef { chat_id: chat_id.clone() })
    }

    pub fn typing_stop(chat_id: &ChatId) -> Self {
        Self::TypingStop(ChatRef { chat_id: chat_id.clone() })
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinChat(_) => "join_chat",
            ClientEvent::LeaveChat(_) => "leave_chat",
            ClientEvent::SendMessage(_) => "send_message",
            ClientEvent::TypingStart(_) => "typing_start",
            ClientEvent::TypingStop(_) => "typing_stop",
        }
    }

    pub fn encode(&self) -> AppResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// `new_message` payload. The live event carries no authoritative id unless
/// the server chooses to echo one.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingMessage {
    pub chat_id: ChatId,
    pub content: String,
    pub sender: UserRef,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub timestamp: Option<OffsetDateTime>,
    #[serde(default, alias = "_id")]
    pub message_id: Option<MessageId>,
    #[serde(default)]
    pub client_id: Option<Uuid>,
    #[serde(default)]
    pub reply_to: Option<MessageId>,
}

impl IncomingMessage {
    pub fn sent_at(&self) -> OffsetDateTime {
        self.timestamp.unwrap_or_else(OffsetDateTime::now_utc)
    }

    /// Builds the list entry for this event, under a local id when the
    /// server didn't provide one.
    pub fn to_message(&self) -> Message {
        Message {
            id: self.message_id.clone().unwrap_or_else(MessageId::local),
            content: self.content.clone(),
            sender: self.sender.clone(),
            message_type: self.message_type,
            is_read: false,
            read_by: Vec::new(),
            is_edited: false,
            edited_at: None,
            reply_to: self.reply_to.clone(),
            created_at: self.sent_at(),
            client_id: self.client_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSent {
    #[serde(default)]
    pub chat_id: Option<ChatId>,
    #[serde(default, alias = "_id")]
    pub message_id: Option<MessageId>,
    #[serde(default)]
    pub client_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatUser {
    chat_id: ChatId,
    user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OnlineUser {
    user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceUpdate {
    /// Full replacement of the online set.
    Snapshot(Vec<UserId>),
    Online(UserId),
    Offline(UserId),
}

/// Everything the server can push to us.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    NewMessage(IncomingMessage),
    MessageSent(MessageSent),
    UserTyping { chat_id: ChatId, user_id: UserId },
    UserStoppedTyping { chat_id: ChatId, user_id: UserId },
    MessageRead { chat_id: ChatId, user_id: UserId },
    Presence(PresenceUpdate),
}

#[derive(Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
enum ServerFrame {
    NewMessage(IncomingMessage),
    MessageSent(MessageSent),
    UserTyping(ChatUser),
    UserStoppedTyping(ChatUser),
    MessageRead(ChatUser),
    OnlineUsers(Vec<OnlineUser>),
    UserOnline(OnlineUser),
    UserOffline(OnlineUser),
}

impl From<ServerFrame> for LiveEvent {
    fn from(frame: ServerFrame) -> Self {
        match frame {
            ServerFrame::NewMessage(message) => LiveEvent::NewMessage(message),
            ServerFrame::MessageSent(ack) => LiveEvent::MessageSent(ack),
            ServerFrame::UserTyping(ChatUser { chat_id, user_id }) => LiveEvent::UserTyping { chat_id, user_id },
            ServerFrame::UserStoppedTyping(ChatUser { chat_id, user_id }) => {
                LiveEvent::UserStoppedTyping { chat_id, user_id }
            }
            ServerFrame::MessageRead(ChatUser { chat_id, user_id }) => LiveEvent::MessageRead { chat_id, user_id },
            ServerFrame::OnlineUsers(users) => {
                LiveEvent::Presence(PresenceUpdate::Snapshot(users.into_iter().map(|u| u.user_id).collect()))
            }
            ServerFrame::UserOnline(user) => LiveEvent::Presence(PresenceUpdate::Online(user.user_id)),
            ServerFrame::UserOffline(user) => LiveEvent::Presence(PresenceUpdate::Offline(user.user_id)),
        }
    }
}

impl LiveEvent {
    pub fn decode(text: &str) -> AppResult<Self> {
        Ok(serde_json::from_str::<ServerFrame>(text)?.into())
    }

    /// The conversation this event is scoped to, if any.
    pub fn chat_id(&self) -> Option<&ChatId> {
        match self {
            LiveEvent::NewMessage(message) => Some(&message.chat_id),
            LiveEvent::MessageSent(ack) => ack.chat_id.as_ref(),
            LiveEvent::UserTyping { chat_id, .. }
            | LiveEvent::UserStoppedTyping { chat_id, .. }
            | LiveEvent::MessageRead { chat_id, .. } => Some(chat_id),
            LiveEvent::Presence(_) => None,
        }
    }
}
