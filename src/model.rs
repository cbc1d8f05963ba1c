use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

macro_rules! string_id {
    ($Name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $Name(pub String);

        impl $Name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $Name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $Name {
            fn from(id: &str) -> Self {
                Self(id.to_owned())
            }
        }

        impl From<String> for $Name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(ChatId);
string_id!(MessageId);
string_id!(UserId);

impl MessageId {
    /// Identifier for a message that only exists locally.
    pub fn local() -> Self {
        Self(format!("local-{}", Uuid::now_v7()))
    }

    pub fn is_local(&self) -> bool {
        self.0.starts_with("local-")
    }
}

/// The backend sends references either as a bare id or as a populated document.
#[derive(Deserialize)]
#[serde(untagged)]
enum IdOrDoc<T> {
    Id(T),
    Doc {
        #[serde(rename = "_id")]
        id: T,
    },
}

impl<T> IdOrDoc<T> {
    fn into_id(self) -> T {
        match self {
            IdOrDoc::Id(id) | IdOrDoc::Doc { id } => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "UserRefRepr")]
pub struct UserRef {
    #[serde(rename = "_id")]
    pub id: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum UserRefRepr {
    Id(UserId),
    Profile {
        #[serde(rename = "_id")]
        id: UserId,
        #[serde(default)]
        name: Option<String>,
        #[serde(default, rename = "firstName")]
        first_name: Option<String>,
        #[serde(default, alias = "profilePicture")]
        avatar: Option<String>,
    },
}

impl From<UserRefRepr> for UserRef {
    fn from(repr: UserRefRepr) -> Self {
        match repr {
            UserRefRepr::Id(id) => UserRef::new(id),
            UserRefRepr::Profile { id, name, first_name, avatar } => UserRef {
                id,
                name: name.or(first_name),
                avatar,
            },
        }
    }
}

impl UserRef {
    pub fn new(id: impl Into<UserId>) -> Self {
        Self {
            id: id.into(),
            name: None,
            avatar: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(rename = "_id")]
    pub id: MessageId,
    pub content: String,
    pub sender: UserRef,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default, deserialize_with = "read_by")]
    pub read_by: Vec<UserId>,
    #[serde(default)]
    pub is_edited: bool,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub edited_at: Option<OffsetDateTime>,
    #[serde(default, deserialize_with = "reply_to", skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Client-generated key echoed through the live connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<Uuid>,
}

impl Message {
    pub fn is_from(&self, user_id: &UserId) -> bool {
        &self.sender.id == user_id
    }

    pub fn mark_read_by(&mut self, user_id: &UserId) {
        self.is_read = true;
        if !self.read_by.contains(user_id) {
            self.read_by.push(user_id.clone());
        }
    }
}

fn read_by<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<UserId>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Receipt {
        Entry { user: IdOrDoc<UserId> },
        Plain(IdOrDoc<UserId>),
    }

    let receipts = Vec::<Receipt>::deserialize(deserializer)?;
    Ok(receipts
        .into_iter()
        .map(|receipt| match receipt {
            Receipt::Entry { user } | Receipt::Plain(user) => user.into_id(),
        })
        .collect())
}

fn reply_to<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<MessageId>, D::Error> {
    Ok(Option::<IdOrDoc<MessageId>>::deserialize(deserializer)?.map(IdOrDoc::into_id))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastMessage {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<UserRef>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub timestamp: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    #[serde(rename = "_id")]
    pub id: ChatId,
    #[serde(default)]
    pub participants: Vec<UserRef>,
    #[serde(default)]
    pub last_message: Option<LastMessage>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_message_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub is_archived: bool,
}

impl Chat {
    /// The first participant that isn't `me`.
    pub fn peer(&self, me: &UserId) -> Option<&UserRef> {
        self.participants.iter().find(|p| &p.id != me)
    }

    /// Updates the denormalized preview. `last_message_at` never moves backwards.
    pub fn record_message(&mut self, content: &str, sender: UserRef, at: OffsetDateTime) {
        self.last_message = Some(LastMessage {
            content: content.to_owned(),
            sender: Some(sender),
            timestamp: Some(at),
        });
        self.last_message_at = Some(match self.last_message_at {
            Some(prev) if prev > at => prev,
            _ => at,
        });
    }

    fn sort_key(&self) -> Option<OffsetDateTime> {
        self.last_message_at.or(self.created_at)
    }

    /// Newest activity first.
    pub fn cmp_recent(a: &Chat, b: &Chat) -> std::cmp::Ordering {
        b.sort_key().cmp(&a.sort_key())
    }
}
