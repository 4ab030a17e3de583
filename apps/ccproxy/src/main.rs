use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use ccproxy_accounts::AccountPool;
use ccproxy_core::oauth::AuthClient;
use ccproxy_core::upstream::{TransportConfig, WreqTransport};
use ccproxy_core::{AppState, DispatchEngine, ProxyConfig, UpstreamTransport, router};

mod cli;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = cli::Cli::parse();
    let mut config = ProxyConfig::load(&args.config)
        .with_context(|| format!("loading config from {}", args.config.display()))?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(accounts) = args.accounts {
        config.accounts_path = accounts;
    }
    if let Some(auth_token) = args.auth_token {
        config.auth_token = auth_token;
    }

    let accounts = ccproxy_accounts::load_accounts(&config.accounts_path).with_context(|| {
        format!("loading accounts from {}", config.accounts_path.display())
    })?;
    let pool = Arc::new(AccountPool::new(config.max_accounts));
    for account in accounts {
        let email = account.email.clone();
        if let Err(err) = pool.add(account).await {
            tracing::warn!(event = "account_skipped", email = %email, error = %err);
        }
    }
    info!(event = "accounts_loaded", count = pool.len().await);

    let transport: Arc<dyn UpstreamTransport> = Arc::new(WreqTransport::new(TransportConfig {
        proxy: config.proxy.clone(),
        ..TransportConfig::default()
    })?);
    let auth = AuthClient::new(config.oauth_token_url.clone(), config.proxy.as_deref())?;
    let engine = DispatchEngine::new(config.clone(), pool, transport, auth);

    let bind = format!("{}:{}", config.host, config.port);
    let state = Arc::new(AppState { config, engine });
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    info!(event = "listening", addr = %bind);
    axum::serve(listener, app).await?;
    Ok(())
}
