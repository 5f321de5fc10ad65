// =============================================================================
// Publishers — outbound adapters for the microblog feed and the chat bot
// =============================================================================
//
// The router talks to both channels through capability traits so tests can
// substitute recording fakes. Rate-limit handling for the microblog lives in
// the router (sleep until reset, retry once); network retry for the chat
// channel lives in the client itself.
// =============================================================================

pub mod telegram;
pub mod twitter;

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub use telegram::TelegramClient;
pub use twitter::TwitterClient;

/// Publish failure modes.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The provider throttled us; retry after `reset_at` when supplied.
    #[error("rate limited (reset at {reset_at:?})")]
    RateLimited { reset_at: Option<DateTime<Utc>> },
    /// Transport-level failure (DNS, TLS, timeout).
    #[error("publish network failure: {0}")]
    Network(String),
    /// The provider rejected the request.
    #[error("publish api error: {0}")]
    Api(String),
}

/// Text + optional-image feed (microblog).
#[async_trait]
pub trait Microblog: Send + Sync {
    async fn post_text(&self, body: &str) -> Result<(), PublishError>;
    async fn post_with_image(&self, body: &str, image: &Path) -> Result<(), PublishError>;
}

/// Direct-message channel (chat bot).
#[async_trait]
pub trait Chat: Send + Sync {
    async fn send_message(
        &self,
        chat_id: i64,
        body: &str,
        parse_mode: Option<&str>,
    ) -> Result<(), PublishError>;
}
