//! Configuration loading and validation.
//!
//! One TOML file, path from `--config` or `BRIDGE_CONFIG_PATH`, no env
//! overrides for individual keys. All values are resolved at load time and
//! injected into components at construction.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use url::Url;

/// Top-level bridge configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Homeserver connection details.
    pub homeserver: HomeserverConfig,

    /// Appservice identity and listener settings.
    pub appservice: AppserviceConfig,

    /// Messaging-provider account.
    pub provider: ProviderConfig,

    /// Bridge behavior knobs.
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Directory for rotated JSON log files; stderr-only when unset.
    #[serde(default)]
    pub logs_dir: Option<PathBuf>,
}

/// Homeserver connection details.
#[derive(Debug, Clone, Deserialize)]
pub struct HomeserverConfig {
    /// Client-server API base the bridge talks to (e.g. `http://localhost:8008`).
    pub address: String,

    /// Publicly reachable address used to build media download URLs.
    pub public_address: String,

    /// Server name used in Matrix user ids.
    pub domain: String,
}

/// Appservice identity and webhook listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AppserviceConfig {
    /// Appservice token for the client-server API.
    pub as_token: String,

    /// Token the homeserver presents on inbound appservice transactions.
    pub hs_token: String,

    /// Localpart of the bridge bot account.
    #[serde(default = "default_bot_localpart")]
    pub bot_localpart: String,

    /// Path of the SQLite database file.
    #[serde(default = "default_database")]
    pub database: PathBuf,

    /// Address the webhook listener binds to.
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Port the webhook listener binds to.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Externally visible base URL of the webhook listener; the provider
    /// signs requests against this URL.
    pub public_webhook_base: String,
}

/// Messaging-provider account settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// Provider account identifier.
    pub account_id: String,

    /// Provider-side address the bridge sends from (e.g. `whatsapp:+14155551234`).
    pub sender_id: String,

    /// Shared secret: HTTP auth password and webhook signing key.
    pub secret: String,

    /// Provider API root.
    #[serde(default = "default_provider_base_url")]
    pub base_url: String,
}

/// Bridge behavior knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// Template forming a puppet localpart from the bare number; must
    /// contain a single `{}`.
    #[serde(default = "default_username_template")]
    pub username_template: String,

    /// Template forming a puppet display name from the bare number.
    #[serde(default = "default_displayname_template")]
    pub displayname_template: String,

    /// Template matching remote addresses, with `{}` standing for the bare
    /// number (e.g. `whatsapp:+{}`).
    #[serde(default = "default_address_template")]
    pub address_template: String,

    /// Template applied to outbound text messages. Placeholders:
    /// `{message}`, `{mxid}`, `{localpart}`, `{displayname}`.
    #[serde(default = "default_message_template")]
    pub message_template: String,

    /// Whether `m.notice` messages are relayed to the provider.
    #[serde(default)]
    pub bridge_notices: bool,

    /// Value of the `m.federate` flag on created rooms.
    #[serde(default = "default_true")]
    pub federate_rooms: bool,

    /// Matrix users invited to every portal room, with full power.
    #[serde(default)]
    pub invite_users: Vec<String>,

    /// Extra initial state events for created rooms: event type → content.
    #[serde(default)]
    pub initial_state: HashMap<String, serde_json::Value>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            username_template: default_username_template(),
            displayname_template: default_displayname_template(),
            address_template: default_address_template(),
            message_template: default_message_template(),
            bridge_notices: false,
            federate_rooms: true,
            invite_users: Vec::new(),
            initial_state: HashMap::new(),
        }
    }
}

fn default_bot_localpart() -> String {
    "smsbot".to_owned()
}

fn default_database() -> PathBuf {
    PathBuf::from("bridge.db")
}

fn default_listen_address() -> String {
    "0.0.0.0".to_owned()
}

fn default_listen_port() -> u16 {
    29_310
}

fn default_provider_base_url() -> String {
    crate::provider::client::DEFAULT_BASE_URL.to_owned()
}

fn default_username_template() -> String {
    "sms_{}".to_owned()
}

fn default_displayname_template() -> String {
    "+{} (SMS)".to_owned()
}

fn default_address_template() -> String {
    "whatsapp:+{}".to_owned()
}

fn default_message_template() -> String {
    "{message}".to_owned()
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load and validate configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails
    /// validation.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&contents).context("failed to parse config TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the config file path: `--config` value if given, else
    /// `$BRIDGE_CONFIG_PATH`, else `./config.toml`.
    pub fn resolve_path(cli_path: Option<PathBuf>) -> PathBuf {
        cli_path
            .or_else(|| std::env::var("BRIDGE_CONFIG_PATH").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("config.toml"))
    }

    /// Check cross-field invariants the type system cannot.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first violated invariant.
    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.homeserver.address).context("homeserver.address is not a valid URL")?;
        Url::parse(&self.appservice.public_webhook_base)
            .context("appservice.public_webhook_base is not a valid URL")?;
        for (name, template) in [
            ("bridge.username_template", &self.bridge.username_template),
            ("bridge.address_template", &self.bridge.address_template),
            (
                "bridge.displayname_template",
                &self.bridge.displayname_template,
            ),
        ] {
            if template.matches("{}").count() != 1 {
                anyhow::bail!("{name} must contain exactly one {{}} placeholder");
            }
        }
        if !self.bridge.message_template.contains("{message}") {
            anyhow::bail!("bridge.message_template must contain {{message}}");
        }
        Ok(())
    }

    /// Matrix user id of the bridge bot.
    pub fn bot_mxid(&self) -> String {
        format!(
            "@{}:{}",
            self.appservice.bot_localpart, self.homeserver.domain
        )
    }
}
