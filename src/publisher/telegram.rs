// =============================================================================
// Chat Client — bot API (sendMessage + long-poll updates)
// =============================================================================
//
// `send_message` retries transport failures with exponential backoff (base
// 2 s, 3 attempts) before giving up; API rejections are never retried.
// `get_updates` long-polls with a server-held timeout and an offset cursor
// so each update is delivered once.
//
// SECURITY: the bot token is part of every URL and must never be logged.
// =============================================================================

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument, warn};

use super::{Chat, PublishError};

/// Base delay for send retries.
const RETRY_BASE_SECS: u64 = 2;
/// Maximum send attempts per message.
const MAX_SEND_ATTEMPTS: u32 = 3;
/// Server-side long-poll hold, in seconds.
const POLL_TIMEOUT_SECS: u64 = 30;

/// One incoming update from the bot API.
#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub chat: ChatRef,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRef {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
struct UpdatesResponse {
    ok: bool,
    #[serde(default)]
    result: Vec<Update>,
}

/// Bot API client.
#[derive(Clone)]
pub struct TelegramClient {
    http: reqwest::Client,
    token: String,
    base_url: String,
}

impl TelegramClient {
    pub fn new(token: impl Into<String>) -> Self {
        // Long-poll requests are held open by the server, so the client
        // deadline must exceed the poll hold.
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(POLL_TIMEOUT_SECS + 10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            http,
            token: token.into(),
            base_url: "https://api.telegram.org".to_string(),
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.base_url, self.token)
    }

    async fn send_once(
        &self,
        chat_id: i64,
        body: &str,
        parse_mode: Option<&str>,
    ) -> Result<(), PublishError> {
        let mut payload = json!({ "chat_id": chat_id, "text": body });
        if let Some(mode) = parse_mode {
            payload["parse_mode"] = json!(mode);
        }

        let resp = self
            .http
            .post(self.method_url("sendMessage"))
            .json(&payload)
            .send()
            .await
            .map_err(|e| PublishError::Network(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(PublishError::Api(format!(
                "sendMessage returned {status}: {text}"
            )));
        }

        debug!(chat_id, chars = body.len(), "chat message sent");
        Ok(())
    }

    /// Long-poll for updates after `offset`. Returns an empty vec on a
    /// timeout with no traffic.
    #[instrument(skip(self), name = "telegram::get_updates")]
    pub async fn get_updates(&self, offset: i64) -> Result<Vec<Update>, PublishError> {
        let resp = self
            .http
            .get(self.method_url("getUpdates"))
            .query(&[
                ("offset", offset.to_string()),
                ("timeout", POLL_TIMEOUT_SECS.to_string()),
            ])
            .send()
            .await
            .map_err(|e| PublishError::Network(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(PublishError::Api(format!(
                "getUpdates returned {status}: {text}"
            )));
        }

        let body: UpdatesResponse = resp
            .json()
            .await
            .map_err(|e| PublishError::Network(e.to_string()))?;
        if !body.ok {
            return Err(PublishError::Api("getUpdates returned ok=false".into()));
        }

        Ok(body.result)
    }
}

#[async_trait]
impl Chat for TelegramClient {
    /// Send a message, retrying transport failures with exponential backoff.
    #[instrument(skip(self, body), name = "telegram::send_message")]
    async fn send_message(
        &self,
        chat_id: i64,
        body: &str,
        parse_mode: Option<&str>,
    ) -> Result<(), PublishError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.send_once(chat_id, body, parse_mode).await {
                Ok(()) => return Ok(()),
                Err(e @ PublishError::Network(_)) if attempt < MAX_SEND_ATTEMPTS => {
                    let wait = RETRY_BASE_SECS * 2u64.pow(attempt - 1);
                    warn!(
                        attempt,
                        wait_secs = wait,
                        error = %e,
                        "chat send failed — backing off"
                    );
                    tokio::time::sleep(std::time::Duration::from_secs(wait)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl std::fmt::Debug for TelegramClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramClient")
            .field("token", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}
