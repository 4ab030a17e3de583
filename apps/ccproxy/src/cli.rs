use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(name = "ccproxy", about = "Anthropic-compatible proxy for the Cloud Code backend")]
pub(crate) struct Cli {
    /// Path to the JSON config file.
    #[arg(long, default_value = "ccproxy.json")]
    pub(crate) config: PathBuf,
    /// Override the configured listen host.
    #[arg(long)]
    pub(crate) host: Option<String>,
    /// Override the configured listen port.
    #[arg(long)]
    pub(crate) port: Option<u16>,
    /// Override the configured accounts file.
    #[arg(long)]
    pub(crate) accounts: Option<PathBuf>,
    /// Override the configured client auth token.
    #[arg(long)]
    pub(crate) auth_token: Option<String>,
}
