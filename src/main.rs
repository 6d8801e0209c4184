//! sessionlink command line host
//!
//! - `login`: browser sign-in through a loopback redirect
//! - `logout` / `status`: inspect or clear the stored session
//! - `listen`: hold the realtime channel open while the session is valid
//! - `endpoint`: show which realtime endpoint would be used

mod cli;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands, ListenArgs, LoginArgs};
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tracing::{info, warn};

use sessionlink::auth::{
    BrowserNavigator, CallbackServer, Clock, IdentityProvider, LoginOutcome, OAuthClient,
    SessionManager, SessionState, SystemClock,
};
use sessionlink::config::{self, Config};
use sessionlink::error::AppError;
use sessionlink::realtime::{derive_endpoint, ChannelEvent, RealtimeChannel, WebSocketTransport};
use sessionlink::store::{BackendKind, FileBackend, Store};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity flags
    let log_level = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_writer(std::io::stderr) // Log to stderr to keep stdout clean
        .init();

    match run(cli).await {
        Ok(output) => {
            if !output.is_empty() {
                println!("{}", output);
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(e.exit_code());
        }
    }
}

async fn run(cli: Cli) -> Result<String, AppError> {
    let loaded = match &cli.config {
        Some(path) => config::load_config_from(path)?,
        None => config::load_config()?,
    };
    let config = cli.apply(loaded);

    match cli.command {
        Commands::Endpoint => {
            Ok(derive_endpoint(&config.api_url, config.ws_url.as_deref()).to_string())
        }
        Commands::Status => {
            let session = open_session(&config, open_store(cli.store_file.as_deref())?, None)?;
            Ok(describe(&session.state(), config.expiry_threshold_secs))
        }
        Commands::Logout => {
            let session = open_session(&config, open_store(cli.store_file.as_deref())?, None)?;
            session.logout();
            Ok("Logged out.".to_string())
        }
        Commands::Login(args) => {
            let store = open_store(cli.store_file.as_deref())?;
            execute_login(&config, store, args).await
        }
        Commands::Listen(args) => {
            let store = open_store(cli.store_file.as_deref())?;
            execute_listen(&config, store, args).await
        }
    }
}

fn open_store(path: Option<&Path>) -> Result<Store, AppError> {
    let store = match path {
        Some(path) => Store::with_backend(Arc::new(FileBackend::new(path)), BackendKind::File),
        None => Store::open_default()?,
    };
    info!(backend = ?store.kind(), "Using credential store");
    Ok(store)
}

fn open_session(
    config: &Config,
    store: Store,
    provider: Option<Arc<dyn IdentityProvider>>,
) -> Result<SessionManager, AppError> {
    let provider: Arc<dyn IdentityProvider> = match provider {
        Some(provider) => provider,
        None => Arc::new(OAuthClient::new(&config.provider)?),
    };
    let session = SessionManager::builder(store, provider, Arc::new(BrowserNavigator))
        .expiry_threshold_secs(config.expiry_threshold_secs)
        .build()?;
    Ok(session)
}

/// Execute login command
async fn execute_login(config: &Config, store: Store, args: LoginArgs) -> Result<String, AppError> {
    let server = CallbackServer::bind(&config.provider.redirect_uri).await?;
    let mut client = OAuthClient::new(&config.provider)?;
    client.set_redirect_uri(server.redirect_uri().as_str());

    let provider: Arc<dyn IdentityProvider> = Arc::new(client);
    let session = open_session(config, store, Some(provider))?;

    if matches!(session.state(), SessionState::Authenticating) {
        // The loopback listener of that run is gone; start over
        info!("Discarding unfinished sign-in from a previous run");
        session.logout();
    }

    match session.login()? {
        LoginOutcome::Redirected => {}
        LoginOutcome::AlreadyAuthenticated | LoginOutcome::AlreadyInProgress => {
            return Ok(describe(&session.state(), config.expiry_threshold_secs));
        }
    }

    let redirect = match server
        .wait_for_redirect(Duration::from_secs(args.timeout))
        .await
    {
        Ok(redirect) => redirect,
        Err(e) => {
            session.logout();
            return Err(e.into());
        }
    };

    session.handle_redirect(&redirect).await?;
    Ok(describe(&session.state(), config.expiry_threshold_secs))
}

/// Execute listen command
async fn execute_listen(config: &Config, store: Store, args: ListenArgs) -> Result<String, AppError> {
    let session = Arc::new(open_session(config, store, None)?);
    if !session.check_expiry().is_authenticated() {
        return Err(AppError::InvalidInput(
            "Not signed in. Run `sessionlink login` first.".to_string(),
        ));
    }

    let (ended_tx, mut ended_rx) = mpsc::unbounded_channel();
    session.subscribe(Box::new(move |state| {
        if !state.is_authenticated() {
            let _ = ended_tx.send(state.name());
        }
    }));

    let endpoint = derive_endpoint(&config.api_url, config.ws_url.as_deref());
    let channel = Arc::new(RealtimeChannel::new(
        endpoint,
        Arc::new(WebSocketTransport::default()),
    ));
    let handle = channel.handle();
    let mut events = handle.subscribe();
    channel.attach(&session);

    let watch = session.spawn_expiry_watch(Duration::from_secs(config.expiry_poll_secs));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut pending_send = args.send;
    let mut received = 0usize;
    let outcome = loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted");
                break Ok(());
            }
            Some(state) = ended_rx.recv() => {
                warn!(state, "Session ended, realtime channel closed");
                break Err(AppError::LoginFailed(format!("Session {}", state)));
            }
            event = events.recv() => match event {
                Ok(ChannelEvent::Connected) => {
                    info!(endpoint = %handle.endpoint(), "Listening");
                    if let Some(text) = pending_send.take() {
                        handle.send(text)?;
                    }
                }
                Ok(ChannelEvent::Disconnected { reason }) => {
                    info!(
                        reason = reason.as_deref().unwrap_or("requested"),
                        "Realtime channel disconnected"
                    );
                }
                Ok(ChannelEvent::Text(text)) => {
                    println!("{}", text);
                    received += 1;
                    if args.max_events.is_some_and(|max| received >= max) {
                        break Ok(());
                    }
                }
                Ok(ChannelEvent::Binary(data)) => {
                    println!("<{} bytes>", data.len());
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Dropped realtime events"),
                Err(RecvError::Closed) => break Ok(()),
            }
        }
    };

    watch.abort();
    channel.set_desired(false);
    outcome.map(|()| format!("Received {} message(s).", received))
}

fn describe(state: &SessionState, threshold_secs: i64) -> String {
    match state {
        SessionState::Authenticated(credential) => {
            let now = SystemClock.now_epoch_seconds();
            let expires = chrono::DateTime::from_timestamp(credential.expires_at(), 0)
                .map(|at| at.to_rfc3339())
                .unwrap_or_else(|| credential.expires_at().to_string());
            format!(
                "Signed in as {} until {} ({}s remaining)",
                credential.claims().subject().unwrap_or("unknown subject"),
                expires,
                credential.seconds_remaining(threshold_secs, now)
            )
        }
        SessionState::Authenticating => "Sign-in in progress.".to_string(),
        SessionState::Expired => "Session expired. Run `sessionlink login`.".to_string(),
        SessionState::Unauthenticated => "Not signed in.".to_string(),
    }
}
