use time::OffsetDateTime;

use crate::model::{Chat, ChatId, UserRef};

/// The user's conversations, most recent activity first.
#[derive(Debug, Default, Clone)]
pub struct ChatList {
    chats: Vec<Chat>,
}

impl ChatList {
    pub fn replace(&mut self, mut chats: Vec<Chat>) {
        chats.sort_by(Chat::cmp_recent);
        self.chats = chats;
    }

    /// Inserts the chat unless one with the same id is already listed.
    pub fn upsert(&mut self, chat: Chat) -> bool {
        if let Some(existing) = self.chats.iter_mut().find(|c| c.id == chat.id) {
            existing.participants = chat.participants;
            return false;
        }
        self.chats.push(chat);
        self.chats.sort_by(Chat::cmp_recent);
        true
    }

    /// Updates the preview of `chat_id`. Returns false for chats we don't list.
    pub fn record_message(&mut self, chat_id: &ChatId, content: &str, sender: UserRef, at: OffsetDateTime) -> bool {
        let Some(chat) = self.chats.iter_mut().find(|c| &c.id == chat_id) else {
            return false;
        };
        chat.record_message(content, sender, at);
        self.chats.sort_by(Chat::cmp_recent);
        true
    }

    pub fn remove(&mut self, chat_id: &ChatId) -> Option<Chat> {
        let index = self.chats.iter().position(|c| &c.id == chat_id)?;
        Some(self.chats.remove(index))
    }

    pub fn get(&self, chat_id: &ChatId) -> Option<&Chat> {
        self.chats.iter().find(|c| &c.id == chat_id)
    }

    pub fn chats(&self) -> &[Chat] {
        &self.chats
    }
}
