//! Outbound REST client for the messaging provider.
//!
//! All provider operations go through [`ProviderApi`] so the portal engine
//! can be exercised against a recording mock in tests.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::ProviderError;

/// Default provider API root (Twilio-compatible).
pub const DEFAULT_BASE_URL: &str = "https://api.twilio.com/2010-04-01";

/// Narrow interface the portal engine uses to talk to the provider.
#[async_trait]
pub trait ProviderApi: Send + Sync {
    /// Send a message to a remote address. At least one of `body` and
    /// `media_url` must be given. Returns the provider-assigned message id.
    async fn send_message(
        &self,
        to: &str,
        body: Option<&str>,
        media_url: Option<&str>,
    ) -> Result<String, ProviderError>;

    /// Fetch the bytes of an inbound media attachment.
    async fn fetch_media(&self, url: &str) -> Result<Vec<u8>, ProviderError>;
}

/// reqwest-backed client for the provider's messages endpoint.
pub struct ProviderClient {
    http: reqwest::Client,
    base_url: String,
    account_id: String,
    sender_id: String,
    secret: String,
}

/// JSON envelope of the provider's send response.
#[derive(Deserialize)]
struct SendResponse {
    sid: Option<String>,
}

impl ProviderClient {
    /// Create a client for the given account.
    pub fn new(base_url: String, account_id: String, sender_id: String, secret: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            account_id,
            sender_id,
            secret,
        }
    }
}

#[async_trait]
impl ProviderApi for ProviderClient {
    async fn send_message(
        &self,
        to: &str,
        body: Option<&str>,
        media_url: Option<&str>,
    ) -> Result<String, ProviderError> {
        let mut form: Vec<(&str, &str)> = vec![("From", &self.sender_id), ("To", to)];
        if let Some(body) = body {
            form.push(("Body", body));
        }
        if let Some(media_url) = media_url {
            form.push(("MediaUrl", media_url));
        }
        debug!(to, has_body = body.is_some(), has_media = media_url.is_some(), "sending provider message");

        let url = format!(
            "{}/Accounts/{}/Messages.json",
            self.base_url, self.account_id
        );
        let resp = self
            .http
            .post(&url)
            .basic_auth(&self.account_id, Some(&self.secret))
            .form(&form)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::SendFailed(format!("HTTP {status}: {text}")));
        }
        let body: SendResponse = resp.json().await?;
        let sid = body
            .sid
            .ok_or_else(|| ProviderError::SendFailed("response carried no sid".to_owned()))?;
        debug!(sid, "provider accepted message");
        Ok(sid)
    }

    async fn fetch_media(&self, url: &str) -> Result<Vec<u8>, ProviderError> {
        let resp = self.http.get(url).send().await?.error_for_status()?;
        Ok(resp.bytes().await?.to_vec())
    }
}
