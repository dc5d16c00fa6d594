//! Appservice-mode implementation of [`RoomBackend`] over the Matrix
//! client-server API.
//!
//! Authenticates with the appservice token and impersonates puppets through
//! the `user_id` query parameter.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;
use url::Url;

use super::{MatrixError, MediaKind, RoomBackend};

/// reqwest client for a homeserver's client-server API.
pub struct AppserviceClient {
    http: reqwest::Client,
    base_url: Url,
    token: String,
    txn_counter: AtomicU64,
}

/// Matrix standard error body.
#[derive(Deserialize)]
struct ApiError {
    errcode: Option<String>,
    error: Option<String>,
}

impl AppserviceClient {
    /// Create a client for the homeserver at `base_url` using the
    /// appservice `as_token`.
    pub fn new(base_url: Url, token: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            token,
            txn_counter: AtomicU64::new(0),
        }
    }

    /// Build a client-server API URL from path segments, percent-encoding
    /// each segment.
    fn endpoint(&self, segments: &[&str], user: Option<&str>) -> Url {
        let mut url = self.base_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .expect("homeserver base URL is absolute");
            path.pop_if_empty();
            for segment in segments {
                path.push(segment);
            }
        }
        if let Some(user) = user {
            url.query_pairs_mut().append_pair("user_id", user);
        }
        url
    }

    /// Fresh transaction id for `PUT /send` endpoints.
    fn next_txn(&self) -> String {
        let n = self.txn_counter.fetch_add(1, Ordering::Relaxed);
        format!("bridge-{}-{n}", std::process::id())
    }

    /// Check a homeserver response, mapping Matrix error bodies to
    /// [`MatrixError::Api`].
    async fn checked(resp: reqwest::Response) -> Result<reqwest::Response, MatrixError> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let err: ApiError = resp.json().await.unwrap_or(ApiError {
            errcode: None,
            error: None,
        });
        Err(MatrixError::Api {
            errcode: err.errcode.unwrap_or_else(|| format!("HTTP {status}")),
            message: err.error.unwrap_or_default(),
        })
    }

    async fn send_event(
        &self,
        user: &str,
        room: &str,
        event_type: &str,
        content: serde_json::Value,
    ) -> Result<String, MatrixError> {
        let txn = self.next_txn();
        let url = self.endpoint(
            &["_matrix", "client", "r0", "rooms", room, "send", event_type, &txn],
            Some(user),
        );
        let resp = self
            .http
            .put(url)
            .bearer_auth(&self.token)
            .json(&content)
            .send()
            .await?;
        let body: serde_json::Value = Self::checked(resp).await?.json().await?;
        event_id(&body)
    }
}

fn event_id(body: &serde_json::Value) -> Result<String, MatrixError> {
    body.get("event_id")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .ok_or(MatrixError::MissingField("event_id"))
}

#[async_trait]
impl RoomBackend for AppserviceClient {
    async fn ensure_registered(&self, localpart: &str) -> Result<(), MatrixError> {
        let url = self.endpoint(&["_matrix", "client", "r0", "register"], None);
        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(&json!({
                "type": "m.login.application_service",
                "username": localpart,
            }))
            .send()
            .await?;
        match Self::checked(resp).await {
            Ok(_) => Ok(()),
            // Already registered is the common steady-state case.
            Err(MatrixError::Api { errcode, .. }) if errcode == "M_USER_IN_USE" => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn set_displayname(&self, user: &str, name: &str) -> Result<(), MatrixError> {
        let url = self.endpoint(
            &["_matrix", "client", "r0", "profile", user, "displayname"],
            Some(user),
        );
        let resp = self
            .http
            .put(url)
            .bearer_auth(&self.token)
            .json(&json!({ "displayname": name }))
            .send()
            .await?;
        Self::checked(resp).await.map(|_| ())
    }

    async fn create_room(
        &self,
        creator: &str,
        name: &str,
        invitees: &[String],
        creation_content: serde_json::Value,
        initial_state: Vec<serde_json::Value>,
    ) -> Result<String, MatrixError> {
        let url = self.endpoint(&["_matrix", "client", "r0", "createRoom"], Some(creator));
        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(&json!({
                "name": name,
                "invite": invitees,
                "creation_content": creation_content,
                "initial_state": initial_state,
            }))
            .send()
            .await?;
        let body: serde_json::Value = Self::checked(resp).await?.json().await?;
        let room_id = body
            .get("room_id")
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .ok_or(MatrixError::MissingField("room_id"))?;
        debug!(room_id, "room created");
        Ok(room_id)
    }

    async fn join_room(&self, user: &str, room: &str) -> Result<(), MatrixError> {
        let url = self.endpoint(&["_matrix", "client", "r0", "join", room], Some(user));
        let resp = self.http.post(url).bearer_auth(&self.token).send().await?;
        Self::checked(resp).await.map(|_| ())
    }

    async fn send_text(
        &self,
        user: &str,
        room: &str,
        body: &str,
        html: Option<&str>,
    ) -> Result<String, MatrixError> {
        let mut content = json!({ "msgtype": "m.text", "body": body });
        if let Some(html) = html {
            content["format"] = json!("org.matrix.custom.html");
            content["formatted_body"] = json!(html);
        }
        self.send_event(user, room, "m.room.message", content).await
    }

    async fn send_notice(&self, user: &str, room: &str, body: &str) -> Result<String, MatrixError> {
        self.send_event(
            user,
            room,
            "m.room.message",
            json!({ "msgtype": "m.notice", "body": body }),
        )
        .await
    }

    async fn send_media(
        &self,
        user: &str,
        room: &str,
        kind: MediaKind,
        filename: &str,
        mime: &str,
        mxc: &str,
        size: usize,
    ) -> Result<String, MatrixError> {
        let content = json!({
            "msgtype": kind.msgtype(),
            "body": filename,
            "url": mxc,
            "info": { "mimetype": mime, "size": size },
        });
        self.send_event(user, room, "m.room.message", content).await
    }

    async fn upload_media(
        &self,
        user: &str,
        data: Vec<u8>,
        mime: &str,
    ) -> Result<String, MatrixError> {
        let url = self.endpoint(&["_matrix", "media", "r0", "upload"], Some(user));
        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .header(CONTENT_TYPE, mime)
            .body(data)
            .send()
            .await?;
        let body: serde_json::Value = Self::checked(resp).await?.json().await?;
        body.get("content_uri")
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .ok_or(MatrixError::MissingField("content_uri"))
    }

    async fn mark_read(&self, user: &str, room: &str, event: &str) -> Result<(), MatrixError> {
        let url = self.endpoint(
            &["_matrix", "client", "r0", "rooms", room, "receipt", "m.read", event],
            Some(user),
        );
        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(&json!({}))
            .send()
            .await?;
        Self::checked(resp).await.map(|_| ())
    }

    async fn react(
        &self,
        user: &str,
        room: &str,
        event: &str,
        key: &str,
    ) -> Result<String, MatrixError> {
        let content = json!({
            "m.relates_to": {
                "rel_type": "m.annotation",
                "event_id": event,
                "key": key,
            }
        });
        self.send_event(user, room, "m.reaction", content).await
    }

    async fn room_displayname(
        &self,
        room: &str,
        user: &str,
    ) -> Result<Option<String>, MatrixError> {
        let url = self.endpoint(
            &["_matrix", "client", "r0", "rooms", room, "state", "m.room.member", user],
            None,
        );
        let resp = self.http.get(url).bearer_auth(&self.token).send().await?;
        if !resp.status().is_success() {
            return Ok(None);
        }
        let body: serde_json::Value = resp.json().await?;
        Ok(body
            .get("displayname")
            .and_then(|v| v.as_str())
            .map(str::to_owned))
    }
}
