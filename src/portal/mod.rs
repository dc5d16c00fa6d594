//! Portal engine: the per-conversation state machine.
//!
//! A portal pairs one remote address with at most one Matrix room. It starts
//! ephemeral (known key, no room) and materializes on first traffic. One
//! lock per conversation covers both room creation and the ordering of
//! outbound sends against inbound delivery-status updates, so creation is
//! idempotent and a status event can never observe a half-recorded send.
//! Different conversations never share a lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info};

use crate::config::Config;
use crate::formatter;
use crate::matrix::{MatrixError, MediaKind, MessageContent, RoomBackend};
use crate::provider::client::ProviderApi;
use crate::provider::events::{MessageEvent, MessageStatus, StatusEvent};
use crate::provider::ProviderError;
use crate::puppet::{PuppetError, PuppetRegistry};
use crate::store::{MessageRow, PortalIndex, PortalRow, Store, StoreError};

/// Errors from the portal engine.
#[derive(Debug, thiserror::Error)]
pub enum PortalError {
    /// Correlation-store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Homeserver operation failed.
    #[error(transparent)]
    Matrix(#[from] MatrixError),

    /// Provider operation failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl From<PuppetError> for PortalError {
    fn from(e: PuppetError) -> Self {
        match e {
            PuppetError::Store(e) => Self::Store(e),
            PuppetError::Matrix(e) => Self::Matrix(e),
        }
    }
}

/// One bridged conversation. Pure state; all behavior lives on
/// [`PortalEngine`].
pub struct Portal {
    /// Immutable remote conversation key (the remote address).
    pub remote_id: String,
    room_id: RwLock<Option<String>>,
    persisted: AtomicBool,
    // Held across room creation, outbound sends, and status application.
    // May suspend on network I/O; blocks this conversation only.
    lock: Mutex<()>,
}

impl Portal {
    fn new(remote_id: String, room_id: Option<String>, persisted: bool) -> Arc<Self> {
        Arc::new(Self {
            remote_id,
            room_id: RwLock::new(room_id),
            persisted: AtomicBool::new(persisted),
            lock: Mutex::new(()),
        })
    }

    /// The Matrix room id, once materialized.
    pub async fn room_id(&self) -> Option<String> {
        self.room_id.read().await.clone()
    }
}

/// Bridge-wide values the engine needs, resolved from [`Config`] at
/// construction.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Matrix user id of the bridge bot.
    pub bot_mxid: String,
    /// Public homeserver address for media download URLs.
    pub homeserver_public_address: String,
    /// Template applied to outbound text messages.
    pub message_template: String,
    /// Whether `m.notice` messages are relayed.
    pub bridge_notices: bool,
    /// `m.federate` flag for created rooms.
    pub federate_rooms: bool,
    /// Users invited to every portal room.
    pub invite_users: Vec<String>,
    /// Extra initial state for created rooms: event type → content.
    pub initial_state: HashMap<String, serde_json::Value>,
}

impl EngineSettings {
    /// Resolve engine settings from the loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            bot_mxid: config.bot_mxid(),
            homeserver_public_address: config.homeserver.public_address.clone(),
            message_template: config.bridge.message_template.clone(),
            bridge_notices: config.bridge.bridge_notices,
            federate_rooms: config.bridge.federate_rooms,
            invite_users: config.bridge.invite_users.clone(),
            initial_state: config.bridge.initial_state.clone(),
        }
    }
}

/// The conversation-level engine: owns portal lifecycle and drives message
/// relay in both directions.
pub struct PortalEngine {
    store: Store,
    index: PortalIndex<Arc<Portal>>,
    puppets: PuppetRegistry,
    matrix: Arc<dyn RoomBackend>,
    provider: Arc<dyn ProviderApi>,
    settings: EngineSettings,
    // Guards the cache-miss path of lookup-or-create so one conversation
    // never gets two live instances (and therefore two lock pairs).
    registry_lock: Mutex<()>,
}

impl PortalEngine {
    /// Assemble the engine from its collaborators.
    pub fn new(
        store: Store,
        puppets: PuppetRegistry,
        matrix: Arc<dyn RoomBackend>,
        provider: Arc<dyn ProviderApi>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            index: PortalIndex::new(),
            puppets,
            matrix,
            provider,
            settings,
            registry_lock: Mutex::new(()),
        }
    }

    /// Whether a Matrix user id belongs to the bridge itself (the bot or a
    /// puppet), as opposed to a real Matrix user.
    pub fn is_bridge_user(&self, mxid: &str) -> bool {
        mxid == self.settings.bot_mxid || self.puppets.remote_for(mxid).is_some()
    }

    // ------------------------------------------------------------------
    // Lookup / create
    // ------------------------------------------------------------------

    /// Look up the portal for a remote conversation key, creating an
    /// ephemeral one when `create` is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    pub async fn portal_by_remote(
        &self,
        remote_id: &str,
        create: bool,
    ) -> Result<Option<Arc<Portal>>, StoreError> {
        if let Some(portal) = self.index.get_by_remote(remote_id).await {
            return Ok(Some(portal));
        }

        let _guard = self.registry_lock.lock().await;
        // Re-check: another task may have instantiated it while we waited.
        if let Some(portal) = self.index.get_by_remote(remote_id).await {
            return Ok(Some(portal));
        }

        if let Some(row) = self.store.portal_by_remote(remote_id).await? {
            let portal = Portal::new(row.remote_id, row.room_id.clone(), true);
            self.index
                .insert(remote_id, row.room_id.as_deref(), Arc::clone(&portal))
                .await;
            return Ok(Some(portal));
        }

        if !create {
            return Ok(None);
        }

        let portal = Portal::new(remote_id.to_owned(), None, false);
        self.ensure_persisted(&portal).await?;
        self.index.insert(remote_id, None, Arc::clone(&portal)).await;
        debug!(remote_id, "portal created");
        Ok(Some(portal))
    }

    /// Look up the portal for a Matrix room id. Never creates.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn portal_by_room(&self, room_id: &str) -> Result<Option<Arc<Portal>>, StoreError> {
        if let Some(portal) = self.index.get_by_room(room_id).await {
            return Ok(Some(portal));
        }
        let Some(row) = self.store.portal_by_room(room_id).await? else {
            return Ok(None);
        };
        let _guard = self.registry_lock.lock().await;
        if let Some(portal) = self.index.get_by_remote(&row.remote_id).await {
            return Ok(Some(portal));
        }
        let portal = Portal::new(row.remote_id.clone(), row.room_id.clone(), true);
        self.index
            .insert(&row.remote_id, row.room_id.as_deref(), Arc::clone(&portal))
            .await;
        Ok(Some(portal))
    }

    /// Materialize the durable row for an in-memory portal, exactly once.
    async fn ensure_persisted(&self, portal: &Portal) -> Result<(), StoreError> {
        if portal.persisted.load(Ordering::Acquire) {
            return Ok(());
        }
        self.store
            .insert_portal(&PortalRow {
                remote_id: portal.remote_id.clone(),
                room_id: portal.room_id().await,
            })
            .await?;
        portal.persisted.store(true, Ordering::Release);
        Ok(())
    }

    /// Administrative unbridge: drop the durable row and both indices.
    ///
    /// # Errors
    ///
    /// Returns an error if the store delete fails.
    pub async fn unbridge(&self, remote_id: &str) -> Result<(), StoreError> {
        let room_id = match self.portal_by_remote(remote_id, false).await? {
            Some(portal) => portal.room_id().await,
            None => None,
        };
        self.store.delete_portal(remote_id).await?;
        self.index.remove(remote_id, room_id.as_deref()).await;
        info!(remote_id, "portal unbridged");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Room creation
    // ------------------------------------------------------------------

    /// Return the portal's room id, creating the room on first use.
    ///
    /// `None` means creation failed; the portal stays ephemeral and the
    /// caller must not retry synchronously.
    pub async fn ensure_room(&self, portal: &Arc<Portal>) -> Option<String> {
        if let Some(room_id) = portal.room_id().await {
            return Some(room_id);
        }
        let _guard = portal.lock.lock().await;
        // Another task may have just created it.
        if let Some(room_id) = portal.room_id().await {
            return Some(room_id);
        }
        match self.create_room(portal).await {
            Ok(room_id) => Some(room_id),
            Err(e) => {
                error!(remote_id = %portal.remote_id, error = %e, "failed to create portal room");
                None
            }
        }
    }

    async fn create_room(&self, portal: &Arc<Portal>) -> Result<String, PortalError> {
        debug!(remote_id = %portal.remote_id, "creating portal room");
        let puppet = self.puppets.get_by_remote(&portal.remote_id).await?;
        self.puppets
            .ensure_registered(&puppet, self.matrix.as_ref())
            .await?;
        self.matrix
            .set_displayname(&puppet.mxid, &puppet.displayname)
            .await?;

        let creation_content = json!({ "m.federate": self.settings.federate_rooms });
        let mut initial_state: Vec<serde_json::Value> = self
            .settings
            .initial_state
            .iter()
            .filter(|(event_type, _)| *event_type != "m.room.power_levels")
            .map(|(event_type, content)| {
                json!({ "type": event_type, "state_key": "", "content": content })
            })
            .collect();
        initial_state.push(json!({
            "type": "m.room.power_levels",
            "state_key": "",
            "content": self.power_levels(&puppet.mxid),
        }));

        let mut invitees = vec![self.settings.bot_mxid.clone()];
        invitees.extend(self.settings.invite_users.iter().cloned());

        let room_id = self
            .matrix
            .create_room(
                &puppet.mxid,
                &puppet.displayname,
                &invitees,
                creation_content,
                initial_state,
            )
            .await?;

        self.ensure_persisted(portal).await?;
        self.store
            .set_portal_room(&portal.remote_id, &room_id)
            .await?;
        *portal.room_id.write().await = Some(room_id.clone());
        self.index.index_room(&room_id, Arc::clone(portal)).await;
        self.matrix.join_room(&puppet.mxid, &room_id).await?;
        info!(remote_id = %portal.remote_id, room_id, "portal room created");
        Ok(room_id)
    }

    /// Power-levels content for a new room: any configured base, with the
    /// bot and the main puppet at full power and invitees defaulted to it.
    fn power_levels(&self, puppet_mxid: &str) -> serde_json::Value {
        let mut content = self
            .settings
            .initial_state
            .get("m.room.power_levels")
            .cloned()
            .filter(serde_json::Value::is_object)
            .unwrap_or_else(|| json!({}));
        if let Some(obj) = content.as_object_mut() {
            let users = obj
                .entry("users".to_owned())
                .or_insert_with(|| json!({}));
            if let Some(users) = users.as_object_mut() {
                users.insert(self.settings.bot_mxid.clone(), json!(100));
                users.insert(puppet_mxid.to_owned(), json!(100));
                for invitee in &self.settings.invite_users {
                    users.entry(invitee.clone()).or_insert_with(|| json!(100));
                }
            }
        }
        content
    }

    // ------------------------------------------------------------------
    // Remote → Matrix
    // ------------------------------------------------------------------

    /// Relay an inbound provider message into the portal's Matrix room.
    ///
    /// # Errors
    ///
    /// Returns an error if delivery to the homeserver or the correlation
    /// write fails. Room-creation failure is not an error: the message is
    /// dropped and the portal stays ephemeral.
    pub async fn handle_remote_message(&self, event: &MessageEvent) -> Result<(), PortalError> {
        let Some(portal) = self.portal_by_remote(&event.sender, true).await? else {
            return Ok(());
        };
        let Some(room_id) = self.ensure_room(&portal).await else {
            return Ok(());
        };
        let puppet = self.puppets.get_by_remote(&portal.remote_id).await?;

        let mut delivered = None;

        if let Some(media) = &event.media {
            let data = self.provider.fetch_media(&media.url).await?;
            let size = data.len();
            let kind = MediaKind::from_mime(&media.mime_type);
            let mxc = self
                .matrix
                .upload_media(&puppet.mxid, data, &media.mime_type)
                .await?;
            let filename = format!("{}{}", event.id, extension_for(&media.mime_type));
            let event_id = self
                .matrix
                .send_media(
                    &puppet.mxid,
                    &room_id,
                    kind,
                    &filename,
                    &media.mime_type,
                    &mxc,
                    size,
                )
                .await?;
            delivered = Some(event_id);
        }

        if !event.body.is_empty() {
            let (html, text) = formatter::remote_to_matrix(&event.body);
            let event_id = self
                .matrix
                .send_text(&puppet.mxid, &room_id, &text, html.as_deref())
                .await?;
            delivered = Some(event_id);
        }

        let event_id = match delivered {
            Some(event_id) => event_id,
            None => {
                self.matrix
                    .send_notice(&puppet.mxid, &room_id, "Message with unknown content")
                    .await?
            }
        };

        // One correlation row per inbound message, anchored to the last
        // delivered event so status markers land on the visible one.
        self.store
            .insert_message(&MessageRow {
                event_id,
                room_id,
                remote_receiver: portal.remote_id.clone(),
                remote_id: event.id.clone(),
            })
            .await?;
        Ok(())
    }

    /// Apply an inbound delivery-status event to a previously relayed
    /// message.
    ///
    /// # Errors
    ///
    /// Returns an error if the store or homeserver fails. A status for an
    /// untracked message is silently dropped.
    pub async fn handle_remote_status(&self, event: &StatusEvent) -> Result<(), PortalError> {
        let Some(portal) = self.portal_by_remote(&event.receiver, true).await? else {
            return Ok(());
        };
        let Some(room_id) = portal.room_id().await else {
            return Ok(());
        };
        let _guard = portal.lock.lock().await;

        let Some(message) = self
            .store
            .message_by_remote(&event.id, &portal.remote_id)
            .await?
        else {
            debug!(remote_id = %event.id, "status for untracked message, dropping");
            return Ok(());
        };

        match &event.status {
            MessageStatus::Delivered => {
                self.matrix
                    .mark_read(&self.settings.bot_mxid, &room_id, &message.event_id)
                    .await?;
            }
            MessageStatus::Read => {
                // "Read" means the remote party saw it, so the receipt comes
                // from the puppet rather than the bot.
                let puppet = self.puppets.get_by_remote(&portal.remote_id).await?;
                self.matrix
                    .mark_read(&puppet.mxid, &room_id, &message.event_id)
                    .await?;
            }
            MessageStatus::Undelivered | MessageStatus::Failed => {
                self.matrix
                    .react(&self.settings.bot_mxid, &room_id, &message.event_id, "\u{274c}")
                    .await?;
            }
            other => {
                debug!(status = ?other, "ignoring unhandled delivery status");
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Matrix → remote
    // ------------------------------------------------------------------

    /// Relay a Matrix message out to the provider.
    ///
    /// Sends on one conversation are strictly serialized against each other
    /// and against inbound status handling.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider send or the correlation write fails.
    pub async fn handle_matrix_message(
        &self,
        room_id: &str,
        sender_mxid: &str,
        event_id: &str,
        content: &MessageContent,
    ) -> Result<(), PortalError> {
        let Some(portal) = self.portal_by_room(room_id).await? else {
            debug!(room_id, "message in unbridged room, ignoring");
            return Ok(());
        };
        let _guard = portal.lock.lock().await;

        let sid = match content {
            MessageContent::Text { body, html } => {
                self.send_text_to_remote(&portal.remote_id, room_id, sender_mxid, body, html)
                    .await?
            }
            MessageContent::Notice { body, html } if self.settings.bridge_notices => {
                self.send_text_to_remote(&portal.remote_id, room_id, sender_mxid, body, html)
                    .await?
            }
            MessageContent::Media { mxc, .. } => {
                let url = self.public_media_url(mxc);
                self.provider
                    .send_message(&portal.remote_id, None, Some(&url))
                    .await?
            }
            other => {
                debug!(?other, "ignoring unsupported message kind");
                return Ok(());
            }
        };

        self.store
            .insert_message(&MessageRow {
                event_id: event_id.to_owned(),
                room_id: room_id.to_owned(),
                remote_receiver: portal.remote_id.clone(),
                remote_id: sid,
            })
            .await?;
        Ok(())
    }

    async fn send_text_to_remote(
        &self,
        remote_id: &str,
        room_id: &str,
        sender_mxid: &str,
        body: &str,
        html: &Option<String>,
    ) -> Result<String, PortalError> {
        let localpart = sender_mxid
            .strip_prefix('@')
            .and_then(|rest| rest.split(':').next())
            .unwrap_or(sender_mxid);
        let displayname = self
            .matrix
            .room_displayname(room_id, sender_mxid)
            .await?
            .unwrap_or_else(|| sender_mxid.to_owned());

        let html_body = match html {
            Some(html) => html.clone(),
            None => escape_html(body),
        };
        let enriched = self
            .settings
            .message_template
            .replace("{message}", &html_body)
            .replace("{mxid}", sender_mxid)
            .replace("{localpart}", localpart)
            .replace("{displayname}", &displayname);
        let text = formatter::matrix_to_remote(&enriched);

        let sid = self
            .provider
            .send_message(remote_id, Some(&text), None)
            .await?;
        Ok(sid)
    }

    /// Public download URL for previously uploaded content; the provider
    /// fetches media itself, so no re-upload happens.
    fn public_media_url(&self, mxc: &str) -> String {
        let path = mxc.strip_prefix("mxc://").unwrap_or(mxc);
        format!(
            "{}/_matrix/media/r0/download/{path}",
            self.settings.homeserver_public_address.trim_end_matches('/')
        )
    }
}

/// File extension for a MIME type, used to derive media filenames.
fn extension_for(mime: &str) -> String {
    match mime {
        "image/jpeg" => ".jpg".to_owned(),
        "image/png" => ".png".to_owned(),
        "image/gif" => ".gif".to_owned(),
        "image/webp" => ".webp".to_owned(),
        "video/mp4" => ".mp4".to_owned(),
        "video/webm" => ".webm".to_owned(),
        "audio/mpeg" => ".mp3".to_owned(),
        "audio/ogg" => ".ogg".to_owned(),
        "audio/amr" => ".amr".to_owned(),
        "application/pdf" => ".pdf".to_owned(),
        "text/plain" => ".txt".to_owned(),
        "text/vcard" => ".vcf".to_owned(),
        other => match other.split('/').nth(1) {
            Some(subtype) if subtype.chars().all(char::is_alphanumeric) => {
                format!(".{subtype}")
            }
            _ => String::new(),
        },
    }
}

/// Minimal HTML escaping for plain-text bodies fed into the HTML message
/// template.
fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
