//! Correlation store: durable identity mappings plus in-memory indices.
//!
//! SQLite is the single source of truth for the three entity kinds (portal,
//! puppet, relayed message). Live [`Portal`](crate::portal::Portal) instances
//! are additionally indexed in memory by both keys via [`PortalIndex`];
//! entries are populated read-through, written write-through, and retained
//! for the lifetime of the process.

use std::collections::HashMap;
use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tokio::sync::RwLock;
use tracing::debug;

/// Errors from the correlation store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying SQLite operation failed.
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

/// Durable portal row: one conversation, at most one room.
#[derive(Debug, Clone)]
pub struct PortalRow {
    /// Immutable remote conversation key (the remote address).
    pub remote_id: String,
    /// Matrix room id, assigned exactly once on materialization.
    pub room_id: Option<String>,
}

/// Durable puppet row.
#[derive(Debug, Clone)]
pub struct PuppetRow {
    /// Remote address the puppet represents.
    pub remote_id: String,
    /// Whether the synthetic Matrix account has been registered.
    pub matrix_registered: bool,
}

/// Durable relayed-message row correlating a Matrix event with a provider
/// message id.
#[derive(Debug, Clone)]
pub struct MessageRow {
    /// Matrix event id of the delivered event.
    pub event_id: String,
    /// Matrix room the event was delivered to.
    pub room_id: String,
    /// Remote conversation key the message belongs to.
    pub remote_receiver: String,
    /// Provider-assigned message id.
    pub remote_id: String,
}

/// SQLite-backed correlation store. Cheap to clone (shares the pool).
#[derive(Clone)]
pub struct Store {
    db: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the bridge database at `path` and ensure
    /// the schema exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let db = SqlitePoolOptions::new().connect_with(options).await?;
        let store = Self { db };
        store.init_schema().await?;
        Ok(store)
    }

    /// Open an in-memory store (tests).
    ///
    /// # Errors
    ///
    /// Returns an error if the pool cannot be created.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let db = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { db };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS portal (
                remote_id TEXT PRIMARY KEY,
                room_id   TEXT UNIQUE
            )",
        )
        .execute(&self.db)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS puppet (
                remote_id         TEXT PRIMARY KEY,
                matrix_registered BOOLEAN NOT NULL DEFAULT FALSE
            )",
        )
        .execute(&self.db)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS message (
                event_id        TEXT NOT NULL,
                room_id         TEXT NOT NULL,
                remote_receiver TEXT NOT NULL,
                remote_id       TEXT NOT NULL,
                PRIMARY KEY (remote_receiver, remote_id),
                UNIQUE (event_id, room_id)
            )",
        )
        .execute(&self.db)
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Portal rows
    // ------------------------------------------------------------------

    /// Fetch a portal row by its remote conversation key.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn portal_by_remote(&self, remote_id: &str) -> Result<Option<PortalRow>, StoreError> {
        let row = sqlx::query("SELECT remote_id, room_id FROM portal WHERE remote_id = ?1")
            .bind(remote_id)
            .fetch_optional(&self.db)
            .await?;
        row.map(portal_from_row).transpose()
    }

    /// Fetch a portal row by its Matrix room id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn portal_by_room(&self, room_id: &str) -> Result<Option<PortalRow>, StoreError> {
        let row = sqlx::query("SELECT remote_id, room_id FROM portal WHERE room_id = ?1")
            .bind(room_id)
            .fetch_optional(&self.db)
            .await?;
        row.map(portal_from_row).transpose()
    }

    /// Insert a portal row if it does not exist yet (idempotent persist).
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn insert_portal(&self, portal: &PortalRow) -> Result<(), StoreError> {
        sqlx::query("INSERT OR IGNORE INTO portal (remote_id, room_id) VALUES (?1, ?2)")
            .bind(&portal.remote_id)
            .bind(&portal.room_id)
            .execute(&self.db)
            .await?;
        debug!(remote_id = %portal.remote_id, "portal row persisted");
        Ok(())
    }

    /// Record the room id assigned to a portal.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn set_portal_room(&self, remote_id: &str, room_id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE portal SET room_id = ?1 WHERE remote_id = ?2")
            .bind(room_id)
            .bind(remote_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    /// Delete a portal row (administrative unbridge).
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn delete_portal(&self, remote_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM portal WHERE remote_id = ?1")
            .bind(remote_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Puppet rows
    // ------------------------------------------------------------------

    /// Fetch a puppet row by remote address.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn puppet_by_remote(&self, remote_id: &str) -> Result<Option<PuppetRow>, StoreError> {
        let row =
            sqlx::query("SELECT remote_id, matrix_registered FROM puppet WHERE remote_id = ?1")
                .bind(remote_id)
                .fetch_optional(&self.db)
                .await?;
        row.map(|row: SqliteRow| {
            Ok(PuppetRow {
                remote_id: row.try_get("remote_id")?,
                matrix_registered: row.try_get("matrix_registered")?,
            })
        })
        .transpose()
    }

    /// Insert a puppet row if it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn insert_puppet(&self, puppet: &PuppetRow) -> Result<(), StoreError> {
        sqlx::query("INSERT OR IGNORE INTO puppet (remote_id, matrix_registered) VALUES (?1, ?2)")
            .bind(&puppet.remote_id)
            .bind(puppet.matrix_registered)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    /// Flip the registration flag for a puppet.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn set_puppet_registered(&self, remote_id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE puppet SET matrix_registered = TRUE WHERE remote_id = ?1")
            .bind(remote_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Relayed messages
    // ------------------------------------------------------------------

    /// Append a relayed-message correlation row.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn insert_message(&self, message: &MessageRow) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO message (event_id, room_id, remote_receiver, remote_id) \
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(&message.event_id)
        .bind(&message.room_id)
        .bind(&message.remote_receiver)
        .bind(&message.remote_id)
        .execute(&self.db)
        .await?;
        debug!(
            event_id = %message.event_id,
            remote_id = %message.remote_id,
            "relayed message recorded"
        );
        Ok(())
    }

    /// Look up a relayed message by provider message id + conversation key.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn message_by_remote(
        &self,
        remote_id: &str,
        remote_receiver: &str,
    ) -> Result<Option<MessageRow>, StoreError> {
        let row = sqlx::query(
            "SELECT event_id, room_id, remote_receiver, remote_id FROM message \
             WHERE remote_id = ?1 AND remote_receiver = ?2",
        )
        .bind(remote_id)
        .bind(remote_receiver)
        .fetch_optional(&self.db)
        .await?;
        row.map(message_from_row).transpose()
    }

    /// Look up a relayed message by Matrix event id + room.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn message_by_matrix(
        &self,
        event_id: &str,
        room_id: &str,
    ) -> Result<Option<MessageRow>, StoreError> {
        let row = sqlx::query(
            "SELECT event_id, room_id, remote_receiver, remote_id FROM message \
             WHERE event_id = ?1 AND room_id = ?2",
        )
        .bind(event_id)
        .bind(room_id)
        .fetch_optional(&self.db)
        .await?;
        row.map(message_from_row).transpose()
    }
}

fn portal_from_row(row: SqliteRow) -> Result<PortalRow, StoreError> {
    Ok(PortalRow {
        remote_id: row.try_get("remote_id")?,
        room_id: row.try_get("room_id")?,
    })
}

fn message_from_row(row: SqliteRow) -> Result<MessageRow, StoreError> {
    Ok(MessageRow {
        event_id: row.try_get("event_id")?,
        room_id: row.try_get("room_id")?,
        remote_receiver: row.try_get("remote_receiver")?,
        remote_id: row.try_get("remote_id")?,
    })
}

/// In-memory index over live portal instances, keyed by both identities.
///
/// Entries live for the process lifetime; consistency with the durable
/// layer is the caller's responsibility (insert after persist, remove on
/// unbridge).
pub struct PortalIndex<P> {
    by_remote: RwLock<HashMap<String, P>>,
    by_room: RwLock<HashMap<String, P>>,
}

impl<P: Clone> PortalIndex<P> {
    /// Create an empty index.
    pub fn new() -> Self {
        Self {
            by_remote: RwLock::new(HashMap::new()),
            by_room: RwLock::new(HashMap::new()),
        }
    }

    /// Look up by remote conversation key.
    pub async fn get_by_remote(&self, remote_id: &str) -> Option<P> {
        self.by_remote.read().await.get(remote_id).cloned()
    }

    /// Look up by Matrix room id.
    pub async fn get_by_room(&self, room_id: &str) -> Option<P> {
        self.by_room.read().await.get(room_id).cloned()
    }

    /// Index an instance under its remote key (and room id, if known).
    pub async fn insert(&self, remote_id: &str, room_id: Option<&str>, portal: P) {
        self.by_remote
            .write()
            .await
            .insert(remote_id.to_owned(), portal.clone());
        if let Some(room_id) = room_id {
            self.by_room.write().await.insert(room_id.to_owned(), portal);
        }
    }

    /// Index a freshly assigned room id.
    pub async fn index_room(&self, room_id: &str, portal: P) {
        self.by_room.write().await.insert(room_id.to_owned(), portal);
    }

    /// Drop an instance from both indices (unbridge).
    pub async fn remove(&self, remote_id: &str, room_id: Option<&str>) {
        self.by_remote.write().await.remove(remote_id);
        if let Some(room_id) = room_id {
            self.by_room.write().await.remove(room_id);
        }
    }
}

impl<P: Clone> Default for PortalIndex<P> {
    fn default() -> Self {
        Self::new()
    }
}
