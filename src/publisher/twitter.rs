// =============================================================================
// Microblog Client — vendor API v2 (text posts + media upload)
// =============================================================================
//
// Uses bearer-token user auth. Posting with an image is two calls: upload
// the media, then create the post referencing the returned media id. A 429
// surfaces as `PublishError::RateLimited` carrying the provider's reset time
// (from the `x-rate-limit-reset` header) so the caller can sleep and retry.
//
// SECURITY: the bearer token is never logged or included in Debug output.
// =============================================================================

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::multipart;
use serde_json::json;
use tracing::{debug, instrument};

use super::{Microblog, PublishError};

/// Total deadline applied to each API call.
const REQUEST_TIMEOUT_SECS: u64 = 10;

/// Microblog API v2 client.
#[derive(Clone)]
pub struct TwitterClient {
    http: reqwest::Client,
    bearer_token: String,
    base_url: String,
}

impl TwitterClient {
    pub fn new(bearer_token: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("failed to build reqwest client");

        Self {
            http,
            bearer_token: bearer_token.into(),
            base_url: "https://api.x.com".to_string(),
        }
    }

    /// Interpret a response status, extracting the reset time on a 429.
    fn classify_failure(
        status: reqwest::StatusCode,
        headers: &reqwest::header::HeaderMap,
        body: &str,
    ) -> PublishError {
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let reset_at = headers
                .get("x-rate-limit-reset")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<i64>().ok())
                .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0));
            return PublishError::RateLimited { reset_at };
        }
        PublishError::Api(format!("microblog API returned {status}: {body}"))
    }

    async fn create_post(
        &self,
        body: &str,
        media_id: Option<&str>,
    ) -> Result<(), PublishError> {
        let mut payload = json!({ "text": body });
        if let Some(id) = media_id {
            payload["media"] = json!({ "media_ids": [id] });
        }

        let resp = self
            .http
            .post(format!("{}/2/tweets", self.base_url))
            .bearer_auth(&self.bearer_token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| PublishError::Network(e.to_string()))?;

        let status = resp.status();
        let headers = resp.headers().clone();
        let text = resp
            .text()
            .await
            .map_err(|e| PublishError::Network(e.to_string()))?;

        if !status.is_success() {
            return Err(Self::classify_failure(status, &headers, &text));
        }

        debug!(chars = body.len(), with_media = media_id.is_some(), "post created");
        Ok(())
    }

    /// Upload one image and return its media id.
    async fn upload_media(&self, image: &Path) -> Result<String, PublishError> {
        let bytes = tokio::fs::read(image)
            .await
            .map_err(|e| PublishError::Api(format!("reading media {}: {e}", image.display())))?;

        let file_name = image
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "chart.png".to_string());
        let form = multipart::Form::new().part(
            "media",
            multipart::Part::bytes(bytes)
                .file_name(file_name)
                .mime_str("image/png")
                .map_err(|e| PublishError::Api(e.to_string()))?,
        );

        let resp = self
            .http
            .post(format!("{}/2/media/upload", self.base_url))
            .bearer_auth(&self.bearer_token)
            .multipart(form)
            .send()
            .await
            .map_err(|e| PublishError::Network(e.to_string()))?;

        let status = resp.status();
        let headers = resp.headers().clone();
        let text = resp
            .text()
            .await
            .map_err(|e| PublishError::Network(e.to_string()))?;

        if !status.is_success() {
            return Err(Self::classify_failure(status, &headers, &text));
        }

        let body: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| PublishError::Api(format!("bad media upload response: {e}")))?;
        // The endpoint has answered both flat and data-wrapped over API
        // revisions; accept either shape.
        let media_id = body["media_id_string"]
            .as_str()
            .or_else(|| body["media_id"].as_str())
            .or_else(|| body["data"]["id"].as_str())
            .map(str::to_owned)
            .or_else(|| body["media_id"].as_u64().map(|id| id.to_string()));

        match media_id {
            Some(id) => {
                debug!(media_id = %id, "media uploaded");
                Ok(id)
            }
            None => Err(PublishError::Api(format!(
                "media upload response missing id: {text}"
            ))),
        }
    }
}

#[async_trait]
impl Microblog for TwitterClient {
    #[instrument(skip(self, body), name = "twitter::post_text")]
    async fn post_text(&self, body: &str) -> Result<(), PublishError> {
        self.create_post(body, None).await
    }

    #[instrument(skip(self, body), name = "twitter::post_with_image")]
    async fn post_with_image(&self, body: &str, image: &Path) -> Result<(), PublishError> {
        let media_id = self.upload_media(image).await?;
        self.create_post(body, Some(&media_id)).await
    }
}

impl std::fmt::Debug for TwitterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TwitterClient")
            .field("bearer_token", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}
