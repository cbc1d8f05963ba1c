//! REST collaborator: the chat endpoints of the platform backend.

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::debug;

use crate::{
    AppError, AppResult,
    model::{Chat, ChatId, Message, MessageId, MessageType, UserId},
    session::SessionStore,
};

#[async_trait]
pub trait ChatApi: Send + Sync {
    /// `POST /chat/create`. Idempotent per participant.
    async fn create_or_get_chat(&self, participant: &UserId) -> AppResult<Chat>;
    /// `GET /chat`
    async fn list_chats(&self) -> AppResult<Vec<Chat>>;
    /// `GET /chat/:chatId/messages`, oldest first.
    async fn fetch_messages(&self, chat_id: &ChatId) -> AppResult<Vec<Message>>;
    /// `POST /chat/:chatId/messages`
    async fn send_message(&self, chat_id: &ChatId, content: &str, message_type: MessageType) -> AppResult<Message>;
    /// `PUT /chat/:chatId/read`
    async fn mark_read(&self, chat_id: &ChatId) -> AppResult<()>;
    /// `DELETE /chat/messages/:messageId`
    async fn delete_message(&self, message_id: &MessageId) -> AppResult<()>;
    /// `PUT /chat/messages/:messageId`
    async fn edit_message(&self, message_id: &MessageId, content: &str) -> AppResult<Message>;
    /// `GET /chat/unread/count`
    async fn unread_count(&self) -> AppResult<u64>;
    /// `DELETE /chat/:chatId`
    async fn delete_chat(&self, chat_id: &ChatId) -> AppResult<()>;
    /// `PUT /chat/:chatId/archive`
    async fn archive_chat(&self, chat_id: &ChatId) -> AppResult<()>;
    /// `PUT /chat/:chatId/unarchive`
    async fn unarchive_chat(&self, chat_id: &ChatId) -> AppResult<()>;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Envelope<T> {
    Wrapped { data: T },
    Bare(T),
}

impl<T> Envelope<T> {
    fn into_inner(self) -> T {
        match self {
            Envelope::Wrapped { data } | Envelope::Bare(data) => data,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum History {
    Keyed { messages: Vec<Message> },
    List(Vec<Message>),
}

#[derive(Deserialize)]
struct UnreadCount {
    #[serde(alias = "unreadCount")]
    count: u64,
}

#[derive(Deserialize, Default)]
struct ErrorBody {
    message: Option<String>,
    error: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateChatBody<'a> {
    participant_id: &'a UserId,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageBody<'a> {
    content: &'a str,
    message_type: MessageType,
}

#[derive(Serialize)]
struct EditMessageBody<'a> {
    content: &'a str,
}

/// [`ChatApi`] over HTTP, authenticated with the current session's bearer token.
#[derive(Clone)]
pub struct RestChatApi {
    http: reqwest::Client,
    base_url: String,
    session: SessionStore,
}

impl RestChatApi {
    pub fn new(base_url: impl Into<String>, session: SessionStore) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            session,
        }
    }

    fn request(&self, method: Method, path: &str) -> AppResult<RequestBuilder> {
        let token = self.session.token().ok_or(AppError::NotAuthenticated)?;
        debug!(%method, path, "chat api request");
        Ok(self
            .http
            .request(method, format!("{}{path}", self.base_url))
            .bearer_auth(token))
    }

    async fn json<T: DeserializeOwned>(request: RequestBuilder) -> AppResult<T> {
        let response = checked(request.send().await?).await?;
        let body = response.bytes().await?;
        Ok(serde_json::from_slice::<Envelope<T>>(&body)?.into_inner())
    }

    async fn empty(request: RequestBuilder) -> AppResult<()> {
        checked(request.send().await?).await?;
        Ok(())
    }
}

async fn checked(response: Response) -> AppResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let parsed: ErrorBody = serde_json::from_str(&body).unwrap_or_default();
    let message = parsed.message.or(parsed.error).unwrap_or(body);
    Err(AppError::status(status, message))
}

#[async_trait]
impl ChatApi for RestChatApi {
    async fn create_or_get_chat(&self, participant: &UserId) -> AppResult<Chat> {
        // The backend does not require auth here, but sending the bearer
        // header anyway keeps every call on `request()` and fails early
        // without a session.
        let request = self
            .request(Method::POST, "/chat/create")?
            .json(&CreateChatBody { participant_id: participant });
        Self::json(request).await
    }

    async fn list_chats(&self) -> AppResult<Vec<Chat>> {
        Self::json(self.request(Method::GET, "/chat")?).await
    }

    async fn fetch_messages(&self, chat_id: &ChatId) -> AppResult<Vec<Message>> {
        let request = self.request(Method::GET, &format!("/chat/{chat_id}/messages"))?;
        Ok(match Self::json::<History>(request).await? {
            History::Keyed { messages } | History::List(messages) => messages,
        })
    }

    async fn send_message(&self, chat_id: &ChatId, content: &str, message_type: MessageType) -> AppResult<Message> {
        let request = self
            .request(Method::POST, &format!("/chat/{chat_id}/messages"))?
            .json(&SendMessageBody { content, message_type });
        Self::json(request).await
    }

    async fn mark_read(&self, chat_id: &ChatId) -> AppResult<()> {
        Self::empty(self.request(Method::PUT, &format!("/chat/{chat_id}/read"))?).await
    }

    async fn delete_message(&self, message_id: &MessageId) -> AppResult<()> {
        Self::empty(self.request(Method::DELETE, &format!("/chat/messages/{message_id}"))?).await
    }

    async fn edit_message(&self, message_id: &MessageId, content: &str) -> AppResult<Message> {
        let request = self
            .request(Method::PUT, &format!("/chat/messages/{message_id}"))?
            .json(&EditMessageBody { content });
        Self::json(request).await
    }

    async fn unread_count(&self) -> AppResult<u64> {
        let count: UnreadCount = Self::json(self.request(Method::GET, "/chat/unread/count")?).await?;
        Ok(count.count)
    }

    async fn delete_chat(&self, chat_id: &ChatId) -> AppResult<()> {
        Self::empty(self.request(Method::DELETE, &format!("/chat/{chat_id}"))?).await
    }

    async fn archive_chat(&self, chat_id: &ChatId) -> AppResult<()> {
        Self::empty(self.request(Method::PUT, &format!("/chat/{chat_id}/archive"))?).await
    }

    async fn unarchive_chat(&self, chat_id: &ChatId) -> AppResult<()> {
        Self::empty(self.request(Method::PUT, &format!("/chat/{chat_id}/unarchive"))?).await
    }
}
