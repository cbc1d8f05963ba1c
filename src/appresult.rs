use reqwest::StatusCode;
use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server replied {status}: {message}")]
    Status { status: StatusCode, message: String },

    #[error("malformed payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("live connection: {0}")]
    Live(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("not logged in")]
    NotAuthenticated,

    #[error("no conversation is open")]
    NoOpenConversation,

    #[error("configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AppError {
    pub fn status(status: StatusCode, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    /// Short text suitable for a transient user-facing notification.
    pub fn user_message(&self) -> String {
        match self {
            AppError::Http(_) => "Network error, please try again".to_owned(),
            AppError::Status { message, .. } if !message.is_empty() => message.clone(),
            AppError::Status { status, .. } => format!("Request failed ({status})"),
            AppError::NotAuthenticated => "Please log in again".to_owned(),
            other => other.to_string(),
        }
    }
}

impl From<String> for AppError {
    fn from(err: String) -> Self {
        Self::Other(anyhow::Error::msg(err))
    }
}

impl From<&str> for AppError {
    fn from(err: &str) -> Self {
        Self::Other(anyhow::Error::msg(err.to_owned()))
    }
}
