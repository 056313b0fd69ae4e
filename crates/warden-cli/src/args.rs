use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "warden")]
#[command(about = "Client for the warden execution gateway", long_about = None)]
pub struct Args {
    /// Gateway URL
    #[arg(long, env = "WARDEN_GATEWAY_URL", default_value = "http://127.0.0.1:8080")]
    pub gateway_url: String,

    /// Gateway API token (Authorization: Bearer)
    #[arg(long, env = "WARDEN_TOKEN")]
    pub token: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run an action for a tenant
    Execute {
        /// `action` or `action@version`
        target: String,
        #[arg(long)]
        tenant: String,
        /// Parameters as a JSON object
        #[arg(long, default_value = "{}")]
        params: String,
        #[arg(long)]
        request_id: Option<String>,
    },
    /// Drop cached results of an action
    Invalidate {
        /// `action` or `action@version`
        target: String,
        #[arg(long)]
        version: Option<String>,
    },
    /// Show the operational snapshot
    Stats {
        /// Print raw JSON instead of tables
        #[arg(long)]
        json: bool,
    },
    /// Check gateway health
    Health,
    /// Fetch Prometheus metrics
    Metrics,
}
