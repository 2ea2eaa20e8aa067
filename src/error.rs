use thiserror::Error;
use url::ParseError;

pub type Result<T, E = StreamError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("WebSocket Error: {0}")]
    WebsocketError(String),

    #[error("STOMP Protocol Error: {0}")]
    StompError(String),

    #[error("JSON Serialization/Deserialization Error: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("URL Parsing Error: {0}")]
    UrlParseError(#[from] ParseError),
}
