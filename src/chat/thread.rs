use crate::model::{Message, MessageId, UserId};

/// Messages of the open conversation, oldest first. Append-only: edits and
/// deletes act in place and never reorder what is already shown.
#[derive(Debug, Default, Clone)]
pub struct MessageThread {
    messages: Vec<Message>,
}

impl MessageThread {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces everything with fetched history.
    pub fn replace(&mut self, mut history: Vec<Message>) {
        history.sort_by_key(|m| m.created_at);
        self.messages = history;
    }

    /// Appends unless the message is already present, either under the same
    /// server id or the same client id. Returns whether it was added.
    pub fn append(&mut self, message: Message) -> bool {
        if self.is_known(&message) {
            return false;
        }
        self.messages.push(message);
        true
    }

    fn is_known(&self, message: &Message) -> bool {
        self.messages.iter().any(|existing| {
            (!message.id.is_local() && existing.id == message.id)
                || (message.client_id.is_some() && existing.client_id == message.client_id)
        })
    }

    /// Swaps in the edited version of a message, keeping its position.
    pub fn update(&mut self, edited: Message) -> bool {
        match self.messages.iter_mut().find(|m| m.id == edited.id) {
            Some(slot) => {
                *slot = Message {
                    client_id: slot.client_id.or(edited.client_id),
                    ..edited
                };
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: &MessageId) -> bool {
        let before = self.messages.len();
        self.messages.retain(|m| &m.id != id);
        self.messages.len() != before
    }

    /// Marks everything `reader` didn't send as read by them.
    pub fn mark_read_by(&mut self, reader: &UserId) -> usize {
        let mut marked = 0;
        for message in self.messages.iter_mut().filter(|m| !m.is_from(reader)) {
            if !message.read_by.contains(reader) {
                marked += 1;
            }
            message.mark_read_by(reader);
        }
        marked
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use time::{Duration, OffsetDateTime, macros::datetime};
    use uuid::Uuid;

    use super::*;
    use crate::model::{MessageType, UserRef};

    pub(crate) fn message(id: &str, sender: &str, content: &str, at: OffsetDateTime) -> Message {
        Message {
            id: MessageId::from(id),
            content: content.to_owned(),
            sender: UserRef::new(sender),
            message_type: MessageType::Text,
            is_read: false,
            read_by: Vec::new(),
            is_edited: false,
            edited_at: None,
            reply_to: None,
            created_at: at,
            client_id: None,
        }
    }

    const T0: OffsetDateTime = datetime!(2024-05-01 09:00 UTC);

    #[test]
    fn replace_orders_by_creation_time() {
        let mut thread = MessageThread::new();
        thread.append(message("stale", "a", "gone", T0));
        thread.replace(vec![
            message("m2", "b", "second", T0 + Duration::minutes(1)),
            message("m1", "a", "first", T0),
        ]);

        let ids: Vec<_> = thread.messages().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["m1", "m2"]);
    }

    #[test]
    fn append_skips_known_server_and_client_ids() {
        let mut thread = MessageThread::new();
        let client_id = Uuid::now_v7();

        let mut own = message("m1", "a", "hello", T0);
        own.client_id = Some(client_id);
        assert!(thread.append(own));

        assert!(!thread.append(message("m1", "a", "hello", T0)));

        let mut echo = message("local-1", "a", "hello", T0);
        echo.id = MessageId::local();
        echo.client_id = Some(client_id);
        assert!(!thread.append(echo));

        let mut peer = message("x", "b", "hello", T0);
        peer.id = MessageId::local();
        assert!(thread.append(peer));
        assert_eq!(thread.len(), 2);
    }

    #[test]
    fn local_ids_never_collide() {
        let mut thread = MessageThread::new();
        for _ in 0..2 {
            let mut m = message("x", "b", "same text", T0);
            m.id = MessageId::local();
            assert!(thread.append(m));
        }
        assert_eq!(thread.len(), 2);
    }

    #[test]
    fn edits_and_deletes_keep_order() {
        let mut thread = MessageThread::new();
        thread.replace(vec![
            message("m1", "a", "one", T0),
            message("m2", "a", "two", T0 + Duration::seconds(1)),
            message("m3", "b", "three", T0 + Duration::seconds(2)),
        ]);

        let mut edited = message("m2", "a", "two!", T0 + Duration::seconds(1));
        edited.is_edited = true;
        assert!(thread.update(edited));
        assert!(thread.remove(&MessageId::from("m1")));
        assert!(!thread.remove(&MessageId::from("m1")));

        let contents: Vec<_> = thread.messages().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["two!", "three"]);
        assert!(thread.messages()[0].is_edited);
    }

    #[test]
    fn read_receipts_skip_the_readers_own_messages() {
        let mut thread = MessageThread::new();
        thread.replace(vec![message("m1", "a", "mine", T0), message("m2", "b", "theirs", T0)]);

        assert_eq!(thread.mark_read_by(&UserId::from("a")), 1);
        assert_eq!(thread.mark_read_by(&UserId::from("a")), 0);
        assert!(!thread.messages()[0].is_read);
        assert!(thread.messages()[1].is_read);
        assert_eq!(thread.messages()[1].read_by, vec![UserId::from("a")]);
    }
}
