//! Narrow interface to the Matrix room backend.
//!
//! The bridge consumes the homeserver through [`RoomBackend`] only: room
//! creation, event delivery, media upload, receipts, and profile updates.
//! Room-state synchronization and account administration live outside this
//! bridge.

pub mod appservice;
pub mod transactions;

use async_trait::async_trait;

/// Errors from the Matrix backend.
#[derive(Debug, thiserror::Error)]
pub enum MatrixError {
    /// HTTP request to the homeserver failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The homeserver returned a Matrix error response.
    #[error("homeserver error {errcode}: {message}")]
    Api {
        /// Matrix error code (e.g. `M_USER_IN_USE`).
        errcode: String,
        /// Human-readable error message.
        message: String,
    },

    /// A success response lacked an expected field.
    #[error("homeserver response missing field {0}")]
    MissingField(&'static str),
}

/// Major MIME group of a media message, mapped to a Matrix msgtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    /// `image/*` → `m.image`.
    Image,
    /// `video/*` → `m.video`.
    Video,
    /// `audio/*` → `m.audio`.
    Audio,
    /// Everything else → `m.file`.
    File,
}

impl MediaKind {
    /// Classify a MIME type by its major group.
    pub fn from_mime(mime: &str) -> Self {
        if mime.starts_with("image/") {
            Self::Image
        } else if mime.starts_with("video/") {
            Self::Video
        } else if mime.starts_with("audio/") {
            Self::Audio
        } else {
            Self::File
        }
    }

    /// The Matrix msgtype string.
    pub fn msgtype(self) -> &'static str {
        match self {
            Self::Image => "m.image",
            Self::Video => "m.video",
            Self::Audio => "m.audio",
            Self::File => "m.file",
        }
    }
}

/// A Matrix message as seen by the outbound (Matrix → provider) path.
#[derive(Debug, Clone)]
pub enum MessageContent {
    /// `m.text` message, optionally with an HTML formatted body.
    Text {
        /// Plain-text body.
        body: String,
        /// HTML formatted body, when `format` was `org.matrix.custom.html`.
        html: Option<String>,
    },
    /// `m.notice` message.
    Notice {
        /// Plain-text body.
        body: String,
        /// HTML formatted body, if any.
        html: Option<String>,
    },
    /// One of the four media msgtypes.
    Media {
        /// Which media msgtype.
        kind: MediaKind,
        /// `mxc://` content URI of the uploaded media.
        mxc: String,
    },
    /// Any other msgtype; not relayed.
    Other {
        /// The unrecognized msgtype string.
        msgtype: String,
    },
}

impl MessageContent {
    /// Parse an `m.room.message` event content.
    ///
    /// Never fails: unknown or incomplete content maps to [`Self::Other`],
    /// which the portal engine drops.
    pub fn parse(content: &serde_json::Value) -> Self {
        let msgtype = content
            .get("msgtype")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let body = content
            .get("body")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_owned();
        let html = content
            .get("format")
            .and_then(|v| v.as_str())
            .filter(|format| *format == "org.matrix.custom.html")
            .and_then(|_| content.get("formatted_body"))
            .and_then(|v| v.as_str())
            .map(str::to_owned);
        let mxc = content.get("url").and_then(|v| v.as_str());
        match (msgtype, mxc) {
            ("m.text", _) => Self::Text { body, html },
            ("m.notice", _) => Self::Notice { body, html },
            ("m.image", Some(mxc)) => Self::Media {
                kind: MediaKind::Image,
                mxc: mxc.to_owned(),
            },
            ("m.video", Some(mxc)) => Self::Media {
                kind: MediaKind::Video,
                mxc: mxc.to_owned(),
            },
            ("m.audio", Some(mxc)) => Self::Media {
                kind: MediaKind::Audio,
                mxc: mxc.to_owned(),
            },
            ("m.file", Some(mxc)) => Self::Media {
                kind: MediaKind::File,
                mxc: mxc.to_owned(),
            },
            (other, _) => Self::Other {
                msgtype: other.to_owned(),
            },
        }
    }
}

/// Room/messaging backend operations the bridge needs, each acting as a
/// specific user (the bridge bot or a puppet).
#[async_trait]
pub trait RoomBackend: Send + Sync {
    /// Register the synthetic account for `localpart` if it does not exist.
    /// Registering an already-registered localpart is not an error.
    async fn ensure_registered(&self, localpart: &str) -> Result<(), MatrixError>;

    /// Set a user's profile display name.
    async fn set_displayname(&self, user: &str, name: &str) -> Result<(), MatrixError>;

    /// Create a room and return its room id.
    async fn create_room(
        &self,
        creator: &str,
        name: &str,
        invitees: &[String],
        creation_content: serde_json::Value,
        initial_state: Vec<serde_json::Value>,
    ) -> Result<String, MatrixError>;

    /// Join a room as the given user.
    async fn join_room(&self, user: &str, room: &str) -> Result<(), MatrixError>;

    /// Send a text message; `html` switches the event to HTML format.
    async fn send_text(
        &self,
        user: &str,
        room: &str,
        body: &str,
        html: Option<&str>,
    ) -> Result<String, MatrixError>;

    /// Send an `m.notice` message.
    async fn send_notice(&self, user: &str, room: &str, body: &str) -> Result<String, MatrixError>;

    /// Send a media message referencing previously uploaded content.
    async fn send_media(
        &self,
        user: &str,
        room: &str,
        kind: MediaKind,
        filename: &str,
        mime: &str,
        mxc: &str,
        size: usize,
    ) -> Result<String, MatrixError>;

    /// Upload a media blob, returning its `mxc://` URI.
    async fn upload_media(
        &self,
        user: &str,
        data: Vec<u8>,
        mime: &str,
    ) -> Result<String, MatrixError>;

    /// Mark an event as read by the given user.
    async fn mark_read(&self, user: &str, room: &str, event: &str) -> Result<(), MatrixError>;

    /// Attach an annotation (reaction) to an event.
    async fn react(
        &self,
        user: &str,
        room: &str,
        event: &str,
        key: &str,
    ) -> Result<String, MatrixError>;

    /// Resolve a user's display name within a room, if set.
    async fn room_displayname(
        &self,
        room: &str,
        user: &str,
    ) -> Result<Option<String>, MatrixError>;
}
