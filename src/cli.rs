//! Command line interface for the session client

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use sessionlink::config::{Config, API_URL_ENV, WS_URL_ENV};

/// sessionlink CLI
#[derive(Parser, Debug)]
#[command(name = "sessionlink")]
#[command(about = "PKCE sign-in and an auth-gated realtime channel", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress non-error output (no short flag to avoid conflicts)
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Configuration file (defaults to <config dir>/sessionlink/config.json)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Keep credentials in this JSON file instead of the OS keyring
    #[arg(long, global = true)]
    pub store_file: Option<PathBuf>,

    /// HTTP API base address, e.g. https://app.example.com/api
    #[arg(long, global = true, env = API_URL_ENV)]
    pub api_url: Option<String>,

    /// Realtime endpoint; derived from the API address when omitted
    #[arg(long, global = true, env = WS_URL_ENV)]
    pub ws_url: Option<String>,

    #[command(flatten)]
    pub provider: ProviderArgs,

    /// Seconds before `exp` at which a credential counts as expired
    #[arg(long, global = true)]
    pub expiry_threshold: Option<i64>,

    /// Seconds between background expiry checks
    #[arg(long, global = true)]
    pub expiry_poll: Option<u64>,
}

/// Identity provider overrides
#[derive(Args, Debug, Default)]
pub struct ProviderArgs {
    /// OAuth client id
    #[arg(long, global = true, env = "SESSIONLINK_CLIENT_ID")]
    pub client_id: Option<String>,

    /// Provider authorization endpoint
    #[arg(long, global = true)]
    pub authorize_endpoint: Option<String>,

    /// Provider token endpoint
    #[arg(long, global = true)]
    pub token_endpoint: Option<String>,

    /// Loopback redirect URI registered with the provider
    #[arg(long, global = true)]
    pub redirect_uri: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Sign in through the browser
    Login(LoginArgs),
    /// Forget the stored credential
    Logout,
    /// Show the session state
    Status,
    /// Print realtime events while signed in
    Listen(ListenArgs),
    /// Print the realtime endpoint in use
    Endpoint,
}

/// Login command arguments
#[derive(Args, Debug)]
pub struct LoginArgs {
    /// Seconds to wait for the browser to come back
    #[arg(long, default_value_t = 300)]
    pub timeout: u64,
}

/// Listen command arguments
#[derive(Args, Debug)]
pub struct ListenArgs {
    /// Message to send once connected
    #[arg(long)]
    pub send: Option<String>,

    /// Stop after this many inbound messages
    #[arg(short = 'n', long)]
    pub max_events: Option<usize>,
}

impl Cli {
    /// Layer command line and environment values over the loaded configuration
    pub fn apply(&self, config: Config) -> Config {
        let mut config = config.with_overrides(self.api_url.clone(), self.ws_url.clone());

        let provider = &self.provider;
        if let Some(client_id) = &provider.client_id {
            config.provider.client_id = client_id.clone();
        }
        if let Some(endpoint) = &provider.authorize_endpoint {
            config.provider.authorize_endpoint = endpoint.clone();
        }
        if let Some(endpoint) = &provider.token_endpoint {
            config.provider.token_endpoint = endpoint.clone();
        }
        if let Some(redirect_uri) = &provider.redirect_uri {
            config.provider.redirect_uri = redirect_uri.clone();
        }
        if let Some(threshold) = self.expiry_threshold {
            config.expiry_threshold_secs = threshold;
        }
        if let Some(poll) = self.expiry_poll {
            config.expiry_poll_secs = poll.max(1);
        }
        config
    }
}
