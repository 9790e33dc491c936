use claude_pool::account::AccountStore;
use claude_pool::api;
use claude_pool::auth::OAuthAuthenticator;
use claude_pool::config::Settings;
use claude_pool::http::HttpTransport;
use claude_pool::pipeline::Services;
use claude_pool::selector::AccountSelector;
use claude_pool::tools::{self, ToolCallTracker};
use claude_pool::web::{self, WebClient, WebSessionManager};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Default lifetime of an unresolved synthetic tool call.
const TOOL_CALL_EXPIRY: Duration = Duration::from_secs(300);

#[derive(Debug, Parser)]
#[command(name = "claude-pool", about = "Claude-compatible pooled reverse proxy")]
struct Args {
    /// Path to config.yaml; created with defaults when missing.
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Override the configured bind host.
    #[arg(long)]
    host: Option<String>,

    /// Override the configured bind port.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let settings = Settings::load(&args.config)?;
    if args.host.is_some() || args.port.is_some() {
        let mut config = settings.get();
        if let Some(host) = args.host {
            config.host = host;
        }
        if let Some(port) = args.port {
            config.port = port;
        }
        settings.update(config)?;
    }
    let config = settings.get();

    let http = Arc::new(HttpTransport::new(&config)?);
    if !http.web_enabled() {
        tracing::warn!("web transport disabled; only OAuth accounts will serve");
    }

    let store = AccountStore::load(config.accounts_path())?;
    tracing::info!("{} accounts available", store.len());

    let web_client = Arc::new(WebClient::new(Arc::clone(&http)));
    let sessions = WebSessionManager::new(web_client, Arc::clone(&store), settings.clone());
    let tracker = ToolCallTracker::new(TOOL_CALL_EXPIRY);
    let selector = AccountSelector::new(Arc::clone(&store), http.web_enabled());
    let oauth = Arc::new(OAuthAuthenticator::new(
        Arc::clone(&http),
        Arc::clone(&store),
        settings.clone(),
    ));

    let services = Arc::new(Services {
        settings: settings.clone(),
        store: Arc::clone(&store),
        oauth,
        sessions: Arc::clone(&sessions),
        tracker: Arc::clone(&tracker),
        selector,
        http,
    });

    web::spawn_sweeper(sessions, settings.clone());
    tools::spawn_sweeper(tracker, config.session_sweep_interval());

    tokio::select! {
        result = api::start_server(Arc::clone(&services)) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            api::stop_server();
        }
    }

    if let Err(e) = services.store.persist().await {
        tracing::error!("final account persistence failed: {}", e);
    }
    Ok(())
}
