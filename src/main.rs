mod backend;
mod config;
mod dashboard;
mod metrics;
mod metrix;
mod models;
mod provisioning;
mod stage;
mod store;
mod utils;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::{
    backend::BackendClient, config::Settings, provisioning::AccountProvisioner, store::SqliteStore,
};

#[derive(Debug, Parser)]
#[command(name = "metrix", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the admin dashboard and API (default)
    Serve,
    /// Print the derived metrics report of one challenge as JSON
    Report {
        document_id: String,
        /// Bearer token of the challenge owner
        #[arg(long, env = "METRIX_TOKEN", hide_env_values = true)]
        token: Option<String>,
    },
    /// Print the unused broker-account pool and tier counts as JSON
    Accounts {
        #[arg(long, env = "METRIX_TOKEN", hide_env_values = true)]
        token: Option<String>,
    },
}

fn require_token<'a>(settings: &'a Settings, token: Option<&'a str>) -> Result<&'a str> {
    settings
        .bearer(token)
        .context("no bearer token (pass --token, METRIX_TOKEN or API_TOKEN)")
}

async fn serve(settings: Settings, store: SqliteStore) -> Result<()> {
    if !settings.dashboard_enabled {
        log::warn!("app.dashboard_disabled nothing to serve");
        return Ok(());
    }
    let url = format!("http://{}:{}/", settings.dashboard_host, settings.dashboard_port);
    if settings.dashboard_open_browser {
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(650)).await;
            let _ = std::process::Command::new("xdg-open").arg(&url).spawn();
        });
    }

    tokio::select! {
        res = dashboard::serve_dashboard(settings, store) => res,
        _ = tokio::signal::ctrl_c() => {
            log::info!("app.shutdown signal=ctrl_c");
            Ok(())
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let settings = Settings::load()?;

    let store = SqliteStore::new(&settings.sqlite_path)?;
    store.init_db()?;

    log::info!(
        "app.start backend={} sqlite={} cache_ttl_secs={}",
        settings.backend_url,
        store.path(),
        settings.accounts_cache_ttl_secs
    );

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(settings, store).await?,
        Command::Report { document_id, token } => {
            let token = require_token(&settings, token.as_deref())?;
            let client = BackendClient::new(&settings)?;
            let report = metrix::load_report(&client, token, &document_id, utils::now_ms())
                .await?
                .with_context(|| format!("challenge {document_id} not found for this user"))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Accounts { token } => {
            let token = require_token(&settings, token.as_deref())?;
            let client = BackendClient::new(&settings)?;
            let provisioner =
                AccountProvisioner::new(client, store, settings.accounts_cache_ttl_secs);
            let listing = provisioner.refresh(token).await?;
            println!("{}", serde_json::to_string_pretty(&listing)?);
        }
    }
    Ok(())
}
