use clap::Parser;
use std::sync::Arc;
use syncline_core::models::{AuthorProfile, ChannelId};
use syncline_server::{feed::FeedStore, serve, AppState};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "syncline-server")]
#[command(about = "Reference relay for syncline channels")]
struct Args {
    /// Address to listen on
    #[arg(long, env = "BIND_ADDRESS", default_value = "0.0.0.0:8080")]
    bind: String,

    /// Refuse subscriptions and writes for this channel (repeatable)
    #[arg(long = "deny-channel")]
    deny_channel: Vec<String>,

    /// Seed an author profile as ID=DISPLAY_NAME (repeatable)
    #[arg(long = "profile", value_parser = parse_profile)]
    profile: Vec<AuthorProfile>,
}

fn parse_profile(raw: &str) -> Result<AuthorProfile, String> {
    match raw.split_once('=') {
        Some((id, name)) if !id.is_empty() && !name.is_empty() => Ok(AuthorProfile::new(id, name)),
        _ => Err(format!("expected ID=DISPLAY_NAME, got '{}'", raw)),
    }
}

#[tokio::main]
async fn main() -> syncline_core::SyncResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("syncline_server=debug,tower_http=debug")),
        )
        .init();

    let args = Args::parse();

    let feed = FeedStore::new(args.deny_channel.into_iter().map(ChannelId::from));
    for profile in args.profile {
        feed.register_profile(profile);
    }
    let state = Arc::new(AppState::new(feed));

    tracing::info!("Starting syncline relay on {}", args.bind);

    let listener = match tokio::net::TcpListener::bind(&args.bind).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(%e, addr = %args.bind, "Failed to bind");
            return Ok(());
        }
    };
    if let Err(e) = serve(listener, state).await {
        tracing::error!(%e, addr = %args.bind, "Server stopped");
    }

    Ok(())
}
