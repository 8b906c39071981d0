use anyhow::Context;
use clap::Parser;
use std::time::Duration;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cirrus_mock::{AppState, EnvelopeStyle, MockOptions, create_router};

#[derive(Parser)]
#[command(name = "cirrus-mock")]
#[command(about = "In-memory mock of the compute API")]
struct Args {
    /// Listen address
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    listen: String,

    /// List envelope to serve
    #[arg(long, value_enum, default_value_t = EnvelopeStyle::Current)]
    envelope: EnvelopeStyle,

    /// Milliseconds a server spends in a transitional status
    #[arg(long, default_value_t = 2000)]
    transition_ms: u64,

    /// Require this X-Auth-Token on every request
    #[arg(long)]
    token: Option<String>,

    /// Start without the demo data set
    #[arg(long)]
    empty: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("cirrus_mock=info".parse()?))
        .init();

    let args = Args::parse();

    let state = AppState::new(MockOptions {
        envelope: args.envelope,
        transition_delay: Duration::from_millis(args.transition_ms),
        token: args.token,
        seed: !args.empty,
    });
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    info!(
        "Mock compute API listening on http://{}/compute/v2 ({:?} envelope)",
        listener.local_addr()?,
        args.envelope
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            signal::ctrl_c().await.ok();
            info!("Shutting down");
        })
        .await?;
    Ok(())
}
