//! CLI entry point: load configuration, wire the components, run the
//! webhook listener.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use url::Url;

use matrix_sms_bridge::config::Config;
use matrix_sms_bridge::logging;
use matrix_sms_bridge::matrix::appservice::AppserviceClient;
use matrix_sms_bridge::matrix::transactions::{self, AppserviceState};
use matrix_sms_bridge::portal::{EngineSettings, PortalEngine};
use matrix_sms_bridge::provider::client::ProviderClient;
use matrix_sms_bridge::provider::signature::RequestValidator;
use matrix_sms_bridge::provider::webhook::{self, WebhookState};
use matrix_sms_bridge::puppet::PuppetRegistry;
use matrix_sms_bridge::store::Store;

#[derive(Parser)]
#[command(name = "matrix-sms-bridge", version, about)]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the bridge.
    Start,
    /// Load and validate the configuration, then exit.
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Pick up PROVIDER_* style secrets from a local .env, if present.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let config_path = Config::resolve_path(cli.config);

    match cli.command {
        Command::CheckConfig => {
            let _guard = logging::init(None)?;
            let config = Config::load(&config_path)?;
            println!(
                "config ok: bridging {} as {}",
                config.provider.sender_id,
                config.bot_mxid()
            );
            Ok(())
        }
        Command::Start => {
            let config = Config::load(&config_path)?;
            let _guard = logging::init(config.logs_dir.as_deref())?;
            info!(config = %config_path.display(), "matrix-sms-bridge starting");
            run(config).await
        }
    }
}

async fn run(config: Config) -> Result<()> {
    let store = Store::open(&config.appservice.database)
        .await
        .context("failed to open bridge database")?;
    info!(path = %config.appservice.database.display(), "database opened");

    let homeserver_url = Url::parse(&config.homeserver.address)
        .context("homeserver.address is not a valid URL")?;
    let matrix = Arc::new(AppserviceClient::new(
        homeserver_url,
        config.appservice.as_token.clone(),
    ));

    let provider = Arc::new(ProviderClient::new(
        config.provider.base_url.clone(),
        config.provider.account_id.clone(),
        config.provider.sender_id.clone(),
        config.provider.secret.clone(),
    ));

    let puppets = PuppetRegistry::new(
        store.clone(),
        config.homeserver.domain.clone(),
        &config.bridge.address_template,
        &config.bridge.username_template,
        &config.bridge.displayname_template,
    );

    let engine = Arc::new(PortalEngine::new(
        store,
        puppets,
        matrix,
        provider,
        EngineSettings::from_config(&config),
    ));

    let public_base = Url::parse(&config.appservice.public_webhook_base)
        .context("appservice.public_webhook_base is not a valid URL")?;
    let state = WebhookState {
        engine: Arc::clone(&engine),
        validator: Arc::new(RequestValidator::new(&config.provider.secret)),
        public_base,
    };

    // One listener carries both the provider webhooks and the homeserver's
    // appservice transactions.
    let app = webhook::router(state).merge(transactions::router(AppserviceState::new(
        engine,
        config.appservice.hs_token.clone(),
    )));
    webhook::serve(
        app,
        &config.appservice.listen_address,
        config.appservice.listen_port,
    )
    .await
}
