//! fatal errors for a single send.
//!
//! everything here ends the current request. recoverable conditions (partial
//! json payloads, unknown frames) never become a `ChatError`; see
//! [`crate::delta::RetryableParseError`] and [`crate::frame::Frame::Other`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    /// network failure while connecting or reading the body.
    #[error("transport error: {0}")]
    Transport(String),
    /// the backend answered with a non-success status.
    #[error("backend returned status {status}")]
    Status { status: u16 },
    /// success status but nothing to read from.
    #[error("response has no readable body")]
    MissingBody,
    /// image endpoint answered without an image reference.
    #[error("image endpoint returned no image")]
    MissingImage,
    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("invalid backend config: {0}")]
    Config(String),
    /// the conversation was cleared while the request was outstanding.
    #[error("request cancelled")]
    Cancelled,
}

#[cfg(not(target_arch = "wasm32"))]
impl From<ureq::Error> for ChatError {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::StatusCode(status) => ChatError::Status { status },
            other => ChatError::Transport(other.to_string()),
        }
    }
}

#[cfg(not(target_arch = "wasm32"))]
impl From<std::io::Error> for ChatError {
    fn from(err: std::io::Error) -> Self {
        ChatError::Transport(err.to_string())
    }
}

#[cfg(target_arch = "wasm32")]
impl From<gloo_net::Error> for ChatError {
    fn from(err: gloo_net::Error) -> Self {
        ChatError::Transport(err.to_string())
    }
}
