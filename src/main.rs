// likepool - Main Entry Point
//
// Wires the token pool, quota tracker, profile reader and dispatch engine
// into the HTTP server and runs the background refresh loop alongside it.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use likepool::config::Config;
use likepool::credentials::FileCredentialSource;
use likepool::dispatch::{DispatchEngine, HttpActionProvider};
use likepool::metrics;
use likepool::orchestrator::{LikeOrchestrator, OrchestratorConfig};
use likepool::profile::HttpProfileReader;
use likepool::quota::QuotaTracker;
use likepool::server::{self, AppState};
use likepool::tokens::{spawn_refresh_loop, HttpTokenIssuer, RefreshOutcome, TokenPool};
use tokio::sync::watch;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

/// likepool: pooled-token like service
#[derive(Parser, Debug)]
#[command(name = "likepool")]
#[command(version)]
#[command(about = "Token pool and quota-limited like dispatch service", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to a TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP service (default)
    Serve,
    /// Validate the configuration and print it with secrets masked
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(args.config.as_deref()).context("Invalid configuration")?;

    match args.command.unwrap_or(Commands::Serve) {
        Commands::CheckConfig => {
            print!("{}", config.to_redacted_toml()?);
            Ok(())
        }
        Commands::Serve => {
            init_logging(&config, args.verbose)?;
            run(config).await
        }
    }
}

fn init_logging(config: &Config, verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { config.log_level()? };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.logging.format.to_lowercase().as_str() {
        "json" => builder.json().init(),
        "pretty" => builder.pretty().init(),
        _ => builder.compact().init(),
    }
    Ok(())
}

async fn run(config: Config) -> Result<()> {
    info!("likepool v{} starting", env!("CARGO_PKG_VERSION"));

    metrics::init().context("Failed to register metrics")?;

    let issuer = HttpTokenIssuer::new(
        config.issuer.url.clone(),
        config.issuer.timeout(),
        config.issuer.retry(),
    )?;
    let source = FileCredentialSource::new(config.credentials.path.clone());
    let pool = Arc::new(
        TokenPool::new(Arc::new(source), Arc::new(issuer))
            .with_issue_concurrency(config.refresh.concurrency),
    );

    let quota = Arc::new(QuotaTracker::new(config.quota.daily_limit));
    let profiles = HttpProfileReader::new(
        config.profile.url.clone(),
        config.profile.timeout(),
        config.profile.fields(),
    )?;
    let provider = HttpActionProvider::new(
        config.dispatch.url.clone(),
        config.dispatch.timeout(),
        config.dispatch.burst_size,
    )?;
    let engine = DispatchEngine::new(Arc::new(provider), config.dispatch.timeout());

    let orchestrator = Arc::new(LikeOrchestrator::new(
        pool.clone(),
        quota,
        Arc::new(profiles),
        engine,
        OrchestratorConfig {
            burst_size: config.dispatch.burst_size,
        },
    ));

    match pool.refresh().await {
        RefreshOutcome::Replaced { issued, failed } => {
            info!("Startup refresh loaded {} tokens ({} failed)", issued, failed)
        }
        RefreshOutcome::NothingIssued { failed } => {
            warn!("Startup refresh issued no tokens ({} failed), serving without a pool", failed)
        }
        RefreshOutcome::CredentialsUnavailable(e) => {
            warn!("Startup refresh could not load credentials: {}", e)
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let refresh_task = spawn_refresh_loop(pool, config.refresh.interval(), shutdown_rx.clone());

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| {
            format!(
                "Invalid listen address {}:{}",
                config.server.host, config.server.port
            )
        })?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    let app = server::router(AppState::new(orchestrator, config.server.access_keys.clone()));

    let mut server_shutdown = shutdown_rx;
    let served = server::serve(listener, app, async move {
        let _ = server_shutdown.wait_for(|stop| *stop).await;
    });
    tokio::pin!(served);

    let result = tokio::select! {
        result = &mut served => result,
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
            served.await
        }
    };
    let _ = shutdown_tx.send(true);

    refresh_task
        .await
        .context("Refresh loop terminated abnormally")?;

    info!("likepool stopped");
    result
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
