//! Provider side of the bridge: webhook signature validation, typed webhook
//! events, the outbound REST client, and the axum receiver.
//!
//! The provider speaks a Twilio-style API: form-encoded webhooks signed with
//! HMAC-SHA1 in, authenticated form POSTs with a JSON `sid` response out.

pub mod client;
pub mod events;
pub mod signature;
pub mod webhook;

/// Errors from the provider adapter.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// HTTP request to the provider failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Webhook request carried no signature header.
    #[error("missing webhook signature header")]
    MissingSignature,

    /// Webhook signature did not verify against the shared secret.
    #[error("invalid webhook signature")]
    InvalidSignature,

    /// Webhook form body lacked a required field.
    #[error("malformed webhook event: missing field {0}")]
    MalformedEvent(&'static str),

    /// The provider rejected an outbound send or returned no message id.
    #[error("provider send failed: {0}")]
    SendFailed(String),
}
