use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "console-gateway",
    version,
    about = "Token-authenticated WebSocket gateway for remote consoles"
)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.yaml")]
    pub config: PathBuf,

    /// Listen address (overrides config file setting)
    #[arg(long)]
    pub listen: Option<String>,

    /// Session authority endpoint (overrides config file setting)
    #[arg(long)]
    pub authority_url: Option<String>,
}
