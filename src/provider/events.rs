//! Typed webhook events deserialized from the provider's form payloads.

use super::ProviderError;

/// Delivery status attached to message and status events (`SmsStatus`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageStatus {
    /// Accepted by the provider for delivery.
    Sent,
    /// Delivered to the remote handset.
    Delivered,
    /// Read by the remote party.
    Read,
    /// Received by the provider (inbound).
    Received,
    /// Delivery failed after acceptance.
    Undelivered,
    /// Send rejected outright.
    Failed,
    /// A status string this bridge does not recognize.
    Unknown(String),
}

impl MessageStatus {
    /// Parse the provider's status string. Unknown values are preserved
    /// rather than rejected so new provider statuses cannot break parsing.
    pub fn parse(value: &str) -> Self {
        match value {
            "sent" => Self::Sent,
            "delivered" => Self::Delivered,
            "read" => Self::Read,
            "received" => Self::Received,
            "undelivered" => Self::Undelivered,
            "failed" => Self::Failed,
            other => Self::Unknown(other.to_owned()),
        }
    }
}

/// Status-callback event kind (`EventType`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEventType {
    /// Message reached the handset.
    Delivered,
    /// Message was read.
    Read,
    /// Message could not be delivered.
    Undelivered,
    /// An event kind this bridge does not recognize.
    Unknown(String),
}

impl StatusEventType {
    /// Parse the provider's event-type string.
    pub fn parse(value: &str) -> Self {
        match value {
            "DELIVERED" => Self::Delivered,
            "READ" => Self::Read,
            "UNDELIVERED" => Self::Undelivered,
            other => Self::Unknown(other.to_owned()),
        }
    }
}

/// Media attachment on an inbound message.
#[derive(Debug, Clone)]
pub struct MediaAttachment {
    /// MIME type (`MediaContentType0`).
    pub mime_type: String,
    /// Download URL (`MediaUrl0`).
    pub url: String,
}

/// An inbound message webhook (`POST /receive`).
#[derive(Debug, Clone)]
pub struct MessageEvent {
    /// Provider-assigned message id (`MessageSid`).
    pub id: String,
    /// Remote address that sent the message (`From`).
    pub sender: String,
    /// Bridge's provider address (`To`).
    pub receiver: String,
    /// Delivery status (`SmsStatus`).
    pub status: MessageStatus,
    /// Plain-text body (`Body`).
    pub body: String,
    /// Number of SMS segments (`NumSegments`).
    pub segments: u32,
    /// First media attachment, when both media fields are present.
    pub media: Option<MediaAttachment>,
}

/// A delivery-status webhook (`POST /status`).
#[derive(Debug, Clone)]
pub struct StatusEvent {
    /// Provider-assigned message id (`MessageSid`).
    pub id: String,
    /// Our provider address (`From`).
    pub sender: String,
    /// Remote address the original message went to (`To`).
    pub receiver: String,
    /// Delivery status (`SmsStatus`).
    pub status: MessageStatus,
    /// Status-callback event kind (`EventType`).
    pub event_type: StatusEventType,
}

/// Look up a form field by name.
fn field<'a>(form: &'a [(String, String)], name: &str) -> Option<&'a str> {
    form.iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

fn required<'a>(
    form: &'a [(String, String)],
    name: &'static str,
) -> Result<&'a str, ProviderError> {
    field(form, name).ok_or(ProviderError::MalformedEvent(name))
}

impl MessageEvent {
    /// Deserialize from parsed form parameters.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::MalformedEvent`] if a required field is
    /// missing.
    pub fn from_form(form: &[(String, String)]) -> Result<Self, ProviderError> {
        let media = match (field(form, "MediaContentType0"), field(form, "MediaUrl0")) {
            (Some(mime_type), Some(url)) => Some(MediaAttachment {
                mime_type: mime_type.to_owned(),
                url: url.to_owned(),
            }),
            _ => None,
        };
        Ok(Self {
            id: required(form, "MessageSid")?.to_owned(),
            sender: required(form, "From")?.to_owned(),
            receiver: required(form, "To")?.to_owned(),
            status: MessageStatus::parse(required(form, "SmsStatus")?),
            body: required(form, "Body")?.to_owned(),
            segments: required(form, "NumSegments")?.parse().unwrap_or(1),
            media,
        })
    }
}

impl StatusEvent {
    /// Deserialize from parsed form parameters.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::MalformedEvent`] if a required field is
    /// missing.
    pub fn from_form(form: &[(String, String)]) -> Result<Self, ProviderError> {
        Ok(Self {
            id: required(form, "MessageSid")?.to_owned(),
            sender: required(form, "From")?.to_owned(),
            receiver: required(form, "To")?.to_owned(),
            status: MessageStatus::parse(required(form, "SmsStatus")?),
            event_type: StatusEventType::parse(field(form, "EventType").unwrap_or_default()),
        })
    }
}
