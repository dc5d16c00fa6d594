//! Synthetic Matrix identities for remote participants.
//!
//! A puppet's Matrix id is derived from its remote address through fixed
//! templates, so both directions are computable without a lookup. The only
//! mutable state is the registration flag, flipped once after the synthetic
//! account is registered with the homeserver.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::matrix::{MatrixError, RoomBackend};
use crate::store::{PuppetRow, Store, StoreError};

/// Errors from puppet management.
#[derive(Debug, thiserror::Error)]
pub enum PuppetError {
    /// Correlation-store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Homeserver operation failed.
    #[error(transparent)]
    Matrix(#[from] MatrixError),
}

/// A single-placeholder template, reversible in both directions.
#[derive(Debug, Clone)]
pub struct Template {
    prefix: String,
    suffix: String,
}

impl Template {
    /// Split a template string around its `{}` placeholder.
    ///
    /// Returns `None` if the string does not contain exactly one `{}`.
    pub fn new(template: &str) -> Option<Self> {
        if template.matches("{}").count() != 1 {
            return None;
        }
        let (prefix, suffix) = template.split_once("{}")?;
        Some(Self {
            prefix: prefix.to_owned(),
            suffix: suffix.to_owned(),
        })
    }

    /// Substitute a value into the placeholder.
    pub fn format(&self, value: &str) -> String {
        format!("{}{value}{}", self.prefix, self.suffix)
    }

    /// Extract the placeholder value, if the input matches the template.
    pub fn parse<'a>(&self, input: &'a str) -> Option<&'a str> {
        input
            .strip_prefix(self.prefix.as_str())?
            .strip_suffix(self.suffix.as_str())
    }
}

/// A remote participant's synthetic Matrix identity.
pub struct Puppet {
    /// Remote address this puppet represents.
    pub remote_id: String,
    /// Matrix localpart derived from the address.
    pub localpart: String,
    /// Full Matrix user id.
    pub mxid: String,
    /// Display name derived from the address.
    pub displayname: String,
    registered: AtomicBool,
}

impl Puppet {
    /// Whether the synthetic account is known to be registered.
    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }
}

/// Creates, caches, and resolves puppets; owns the address transform.
pub struct PuppetRegistry {
    store: Store,
    domain: String,
    address: Template,
    username: Template,
    displayname: Template,
    cache: RwLock<HashMap<String, Arc<Puppet>>>,
}

impl PuppetRegistry {
    /// Build a registry from resolved template strings.
    ///
    /// Template validity is checked at config load; malformed templates
    /// here fall back to a bare `{}` (identity transform).
    pub fn new(
        store: Store,
        domain: String,
        address_template: &str,
        username_template: &str,
        displayname_template: &str,
    ) -> Self {
        let identity = || Template {
            prefix: String::new(),
            suffix: String::new(),
        };
        Self {
            store,
            domain,
            address: Template::new(address_template).unwrap_or_else(identity),
            username: Template::new(username_template).unwrap_or_else(identity),
            displayname: Template::new(displayname_template).unwrap_or_else(identity),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// The bare number for a remote address.
    ///
    /// Addresses that do not match the address template are mapped whole,
    /// with the characters Matrix localparts forbid replaced, keeping the
    /// transform total without colliding with template-matching numbers.
    fn number(&self, remote_id: &str) -> String {
        match self.address.parse(remote_id) {
            Some(number) => number.to_owned(),
            None => remote_id.replace([':', '+'], "_"),
        }
    }

    /// Compute the Matrix user id for a remote address (pure).
    pub fn mxid_for(&self, remote_id: &str) -> String {
        format!(
            "@{}:{}",
            self.username.format(&self.number(remote_id)),
            self.domain
        )
    }

    /// Invert a puppet Matrix id back to its remote address (pure).
    ///
    /// Returns `None` for user ids outside the puppet namespace.
    pub fn remote_for(&self, mxid: &str) -> Option<String> {
        let localpart = mxid
            .strip_prefix('@')?
            .strip_suffix(&format!(":{}", self.domain))?;
        let number = self.username.parse(localpart)?;
        Some(self.address.format(number))
    }

    /// Fetch or create the puppet for a remote address.
    ///
    /// Read-through: cache, then durable row, then create (write-through).
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    pub async fn get_by_remote(&self, remote_id: &str) -> Result<Arc<Puppet>, StoreError> {
        if let Some(puppet) = self.cache.read().await.get(remote_id) {
            return Ok(Arc::clone(puppet));
        }

        let row = self.store.puppet_by_remote(remote_id).await?;
        let registered = match &row {
            Some(row) => row.matrix_registered,
            None => {
                self.store
                    .insert_puppet(&PuppetRow {
                        remote_id: remote_id.to_owned(),
                        matrix_registered: false,
                    })
                    .await?;
                debug!(remote_id, "puppet created");
                false
            }
        };

        let number = self.number(remote_id);
        let localpart = self.username.format(&number);
        let puppet = Arc::new(Puppet {
            remote_id: remote_id.to_owned(),
            mxid: format!("@{localpart}:{}", self.domain),
            localpart,
            displayname: self.displayname.format(&number),
            registered: AtomicBool::new(registered),
        });
        self.cache
            .write()
            .await
            .insert(remote_id.to_owned(), Arc::clone(&puppet));
        Ok(puppet)
    }

    /// Register the puppet's account with the homeserver, once.
    ///
    /// # Errors
    ///
    /// Returns an error if registration or the store update fails.
    pub async fn ensure_registered(
        &self,
        puppet: &Puppet,
        matrix: &dyn RoomBackend,
    ) -> Result<(), PuppetError> {
        if puppet.is_registered() {
            return Ok(());
        }
        matrix.ensure_registered(&puppet.localpart).await?;
        self.store.set_puppet_registered(&puppet.remote_id).await?;
        puppet.registered.store(true, Ordering::Release);
        debug!(remote_id = %puppet.remote_id, mxid = %puppet.mxid, "puppet registered");
        Ok(())
    }
}
